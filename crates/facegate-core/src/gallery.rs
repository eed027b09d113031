//! Directory-backed face gallery.
//!
//! Two layouts are supported:
//! - flat: `<root>/<identity>.<ext>`, one image per identity
//! - per-identity: `<root>/<identity>/<any>.<ext>`, images accumulate

use crate::strategy::MatchingStrategy;
use crate::types::Identity;
use image::{GrayImage, ImageFormat};
use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Image extensions recognised when scanning the gallery.
const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

/// Label used by the flat layout when none was typed.
pub const UNNAMED_LABEL: &str = "unnamed_photo";

/// Prefix of the auto-generated label used by the per-identity layout.
pub const UNKNOWN_LABEL_PREFIX: &str = "unknown_";

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("gallery I/O at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to encode face image: {0}")]
    Encode(#[from] image::ImageError),
    #[error("invalid identity label {0:?}")]
    InvalidLabel(String),
    #[error("saved {identity} to {path} but reloading the gallery failed: {source}")]
    ReloadAfterEnroll {
        identity: Identity,
        path: PathBuf,
        #[source]
        source: Box<GalleryError>,
    },
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> GalleryError + '_ {
    move |source| GalleryError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GalleryLayout {
    Flat,
    PerIdentity,
}

impl GalleryLayout {
    /// Label to enroll under when the operator typed nothing usable.
    pub fn fallback_label(&self, unix_seconds: i64) -> String {
        match self {
            GalleryLayout::Flat => UNNAMED_LABEL.to_string(),
            GalleryLayout::PerIdentity => format!("{UNKNOWN_LABEL_PREFIX}{unix_seconds}"),
        }
    }

    /// Turn typed text into an identity, falling back when it is blank.
    pub fn resolve_label(&self, typed: &str, unix_seconds: i64) -> Identity {
        match sanitize_label(typed) {
            Some(label) => Identity::new(label),
            None => Identity::new(self.fallback_label(unix_seconds)),
        }
    }
}

/// Make typed text safe to use as a file or directory name.
///
/// Characters outside `[A-Za-z0-9 _.-]` become `_` and leading dots are
/// dropped. Returns `None` when nothing is left.
pub fn sanitize_label(typed: &str) -> Option<String> {
    let cleaned: String = typed
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, ' ' | '_' | '.' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.').trim();
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned.to_string())
    }
}

/// Enrolled identities and their representations, in scan order.
#[derive(Debug, Clone)]
pub struct Gallery<R> {
    entries: Vec<GalleryEntry<R>>,
}

#[derive(Debug, Clone)]
pub struct GalleryEntry<R> {
    pub identity: Identity,
    pub representations: Vec<R>,
}

impl<R> Default for Gallery<R> {
    fn default() -> Self {
        Self { entries: Vec::new() }
    }
}

impl<R> Gallery<R> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a representation, creating the identity on first use.
    pub fn push(&mut self, identity: Identity, representation: R) {
        match self.entries.iter_mut().find(|e| e.identity == identity) {
            Some(entry) => entry.representations.push(representation),
            None => self.entries.push(GalleryEntry {
                identity,
                representations: vec![representation],
            }),
        }
    }

    pub fn contains(&self, identity: &Identity) -> bool {
        self.entries.iter().any(|e| &e.identity == identity)
    }

    pub fn get(&self, identity: &Identity) -> Option<&[R]> {
        self.entries
            .iter()
            .find(|e| &e.identity == identity)
            .map(|e| e.representations.as_slice())
    }

    pub fn iter(&self) -> impl Iterator<Item = &GalleryEntry<R>> {
        self.entries.iter()
    }

    /// Number of identities.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn representation_count(&self) -> usize {
        self.entries.iter().map(|e| e.representations.len()).sum()
    }
}

/// Why a gallery file did not contribute a representation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", content = "detail", rename_all = "kebab-case")]
pub enum SkipReason {
    Unreadable(String),
    NoDescriptors,
    DuplicateIdentity,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedFile {
    pub path: PathBuf,
    #[serde(flatten)]
    pub reason: SkipReason,
}

/// Outcome of one gallery scan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoadReport {
    pub identities: usize,
    pub representations: usize,
    pub skipped: Vec<SkippedFile>,
}

impl LoadReport {
    fn skip(&mut self, path: &Path, reason: SkipReason) {
        tracing::warn!(path = %path.display(), ?reason, "skipping gallery file");
        self.skipped.push(SkippedFile {
            path: path.to_path_buf(),
            reason,
        });
    }
}

/// Gallery persisted under a root directory.
#[derive(Debug, Clone)]
pub struct GalleryStore {
    root: PathBuf,
    layout: GalleryLayout,
}

impl GalleryStore {
    pub fn new(root: impl Into<PathBuf>, layout: GalleryLayout) -> Self {
        Self {
            root: root.into(),
            layout,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn layout(&self) -> GalleryLayout {
        self.layout
    }

    /// Scan the root and extract a representation from every face image.
    ///
    /// The root is created if missing and is the only fatal read. Identity
    /// directories or files that cannot be read, decoded or described are
    /// recorded in the report and skipped. Hidden entries are ignored.
    pub fn load<S: MatchingStrategy>(
        &self,
        strategy: &S,
    ) -> Result<(Gallery<S::Repr>, LoadReport), GalleryError> {
        fs::create_dir_all(&self.root).map_err(io_err(&self.root))?;

        let mut gallery = Gallery::new();
        let mut report = LoadReport::default();

        match self.layout {
            GalleryLayout::Flat => {
                for path in sorted_entries(&self.root, &mut report)? {
                    if is_hidden(&path) || !path.is_file() || !is_image(&path) {
                        continue;
                    }
                    let Some(identity) = file_identity(&path) else {
                        continue;
                    };
                    if gallery.contains(&identity) {
                        report.skip(&path, SkipReason::DuplicateIdentity);
                        continue;
                    }
                    if let Some(repr) = extract_file(strategy, &path, &mut report) {
                        gallery.push(identity, repr);
                    }
                }
            }
            GalleryLayout::PerIdentity => {
                for dir in sorted_entries(&self.root, &mut report)? {
                    if is_hidden(&dir) || !dir.is_dir() {
                        continue;
                    }
                    let Some(identity) = file_name(&dir).map(Identity::new) else {
                        continue;
                    };
                    let files = match sorted_entries(&dir, &mut report) {
                        Ok(files) => files,
                        Err(e) => {
                            report.skip(&dir, SkipReason::Unreadable(e.to_string()));
                            continue;
                        }
                    };
                    for path in files {
                        if is_hidden(&path) || !path.is_file() || !is_image(&path) {
                            continue;
                        }
                        if let Some(repr) = extract_file(strategy, &path, &mut report) {
                            gallery.push(identity.clone(), repr);
                        }
                    }
                }
            }
        }

        report.identities = gallery.len();
        report.representations = gallery.representation_count();

        tracing::info!(
            root = %self.root.display(),
            strategy = %strategy.kind(),
            identities = report.identities,
            representations = report.representations,
            skipped = report.skipped.len(),
            "gallery loaded"
        );
        for entry in gallery.iter() {
            tracing::debug!(identity = %entry.identity, images = entry.representations.len(), "gallery entry");
        }

        Ok((gallery, report))
    }

    /// Persist a face crop under `identity` and return the written path.
    ///
    /// The flat layout overwrites an existing image of the same identity; the
    /// per-identity layout adds a new image next to the existing ones. Files
    /// are written to a temporary file in the destination directory and then
    /// renamed into place.
    pub fn enroll(&self, identity: &Identity, face: &GrayImage) -> Result<PathBuf, GalleryError> {
        if sanitize_label(identity.as_str()).as_deref() != Some(identity.as_str()) {
            return Err(GalleryError::InvalidLabel(identity.to_string()));
        }

        let path = match self.layout {
            GalleryLayout::Flat => {
                fs::create_dir_all(&self.root).map_err(io_err(&self.root))?;
                self.root.join(format!("{identity}.png"))
            }
            GalleryLayout::PerIdentity => {
                let dir = self.root.join(identity.as_str());
                fs::create_dir_all(&dir).map_err(io_err(&dir))?;
                unique_image_path(&dir, chrono::Utc::now().timestamp_millis())
            }
        };

        let dir = path.parent().unwrap_or(&self.root);
        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(io_err(dir))?;
        face.write_to(&mut tmp, ImageFormat::Png)?;
        tmp.persist(&path).map_err(|e| GalleryError::Io {
            path: path.clone(),
            source: e.error,
        })?;

        if self.layout == GalleryLayout::Flat {
            self.remove_stale_flat_images(identity, &path)?;
        }

        tracing::info!(identity = %identity, path = %path.display(), "face enrolled");
        Ok(path)
    }

    /// Drop other images with the same stem so the new one is the identity's
    /// only flat-layout image.
    fn remove_stale_flat_images(&self, identity: &Identity, keep: &Path) -> Result<(), GalleryError> {
        for path in sorted_entries(&self.root, &mut LoadReport::default())? {
            if path == keep || !path.is_file() || !is_image(&path) {
                continue;
            }
            if file_identity(&path).as_ref() == Some(identity) {
                fs::remove_file(&path).map_err(io_err(&path))?;
                tracing::debug!(path = %path.display(), "replaced flat gallery image");
            }
        }
        Ok(())
    }
}

/// `img_<millis>.png`, with a numeric suffix if that name is taken.
fn unique_image_path(dir: &Path, millis: i64) -> PathBuf {
    let first = dir.join(format!("img_{millis}.png"));
    if !first.exists() {
        return first;
    }
    (1u32..)
        .map(|n| dir.join(format!("img_{millis}_{n}.png")))
        .find(|p| !p.exists())
        .unwrap_or(first)
}

fn extract_file<S: MatchingStrategy>(strategy: &S, path: &Path, report: &mut LoadReport) -> Option<S::Repr> {
    let face = match image::open(path) {
        Ok(img) => img.to_luma8(),
        Err(e) => {
            report.skip(path, SkipReason::Unreadable(e.to_string()));
            return None;
        }
    };
    let repr = strategy.extract(&face);
    if repr.is_none() {
        report.skip(path, SkipReason::NoDescriptors);
    }
    repr
}

/// Sorted paths in `dir`. Failing to open `dir` is an error; entries that
/// cannot be read are recorded in `report`.
fn sorted_entries(dir: &Path, report: &mut LoadReport) -> Result<Vec<PathBuf>, GalleryError> {
    let mut paths = Vec::new();
    for entry in fs::read_dir(dir).map_err(io_err(dir))? {
        match entry {
            Ok(entry) => paths.push(entry.path()),
            Err(e) => report.skip(dir, SkipReason::Unreadable(e.to_string())),
        }
    }
    paths.sort();
    Ok(paths)
}

/// Dot-prefixed names are never produced by enrollment.
fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with('.'))
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.iter().any(|ext| e.eq_ignore_ascii_case(ext)))
        .unwrap_or(false)
}

fn file_name(path: &Path) -> Option<String> {
    path.file_name()?.to_str().map(str::to_string)
}

fn file_identity(path: &Path) -> Option<Identity> {
    path.file_stem()?.to_str().map(Identity::new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::tests::textured;
    use crate::descriptor::DescriptorStrategy;
    use crate::histogram::HistogramStrategy;

    #[test]
    fn test_sanitize_label() {
        assert_eq!(sanitize_label("  alice "), Some("alice".into()));
        assert_eq!(sanitize_label("../etc/passwd"), Some("_etc_passwd".into()));
        assert_eq!(sanitize_label("Zé Silva"), Some("Z_ Silva".into()));
        assert_eq!(sanitize_label("   "), None);
        assert_eq!(sanitize_label("..."), None);
    }

    #[test]
    fn test_blank_label_fallbacks() {
        let flat = GalleryLayout::Flat.resolve_label("", 1_700_000_000);
        assert_eq!(flat.as_str(), "unnamed_photo");

        let per = GalleryLayout::PerIdentity.resolve_label("  ", 1_700_000_000);
        assert_eq!(per.as_str(), "unknown_1700000000");

        let typed = GalleryLayout::PerIdentity.resolve_label("bob", 1_700_000_000);
        assert_eq!(typed.as_str(), "bob");
    }

    #[test]
    fn test_gallery_push_keeps_order_and_groups() {
        let mut gallery = Gallery::new();
        gallery.push(Identity::from("b"), 1);
        gallery.push(Identity::from("a"), 2);
        gallery.push(Identity::from("b"), 3);
        let ids: Vec<_> = gallery.iter().map(|e| e.identity.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
        assert_eq!(gallery.get(&"b".into()), Some(&[1, 3][..]));
        assert_eq!(gallery.representation_count(), 3);
    }

    #[test]
    fn test_missing_root_is_created_and_empty() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("faces");
        let store = GalleryStore::new(&root, GalleryLayout::PerIdentity);
        let (gallery, report) = store.load(&DescriptorStrategy::default()).unwrap();
        assert!(root.is_dir());
        assert!(gallery.is_empty());
        assert_eq!(report, LoadReport::default());
    }

    #[test]
    fn test_flat_load_skips_undecodable_and_ignores_other_files() {
        let dir = tempfile::tempdir().unwrap();
        textured(1, 80, 8).save(dir.path().join("alice.png")).unwrap();
        fs::write(dir.path().join("broken.jpg"), b"not a jpeg").unwrap();
        fs::write(dir.path().join("notes.txt"), b"hello").unwrap();
        fs::create_dir(dir.path().join("subdir")).unwrap();

        let store = GalleryStore::new(dir.path(), GalleryLayout::Flat);
        let (gallery, report) = store.load(&HistogramStrategy::default()).unwrap();

        assert_eq!(gallery.len(), 1);
        assert!(gallery.contains(&"alice".into()));
        assert_eq!(report.skipped.len(), 1);
        assert!(report.skipped[0].path.ends_with("broken.jpg"));
        assert!(matches!(report.skipped[0].reason, SkipReason::Unreadable(_)));
    }

    #[test]
    fn test_flat_duplicate_stem_keeps_first() {
        let dir = tempfile::tempdir().unwrap();
        textured(1, 50, 5).save(dir.path().join("carol.jpg")).unwrap();
        textured(2, 50, 5).save(dir.path().join("carol.png")).unwrap();

        let store = GalleryStore::new(dir.path(), GalleryLayout::Flat);
        let (gallery, report) = store.load(&HistogramStrategy::default()).unwrap();
        assert_eq!(gallery.get(&"carol".into()).map(|r| r.len()), Some(1));
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].reason, SkipReason::DuplicateIdentity);
    }

    #[test]
    fn test_per_identity_load_accumulates_and_drops_empty_identities() {
        let dir = tempfile::tempdir().unwrap();
        let alice = dir.path().join("alice");
        let ghost = dir.path().join("ghost");
        fs::create_dir_all(&alice).unwrap();
        fs::create_dir_all(&ghost).unwrap();
        textured(1, 200, 10).save(alice.join("a.png")).unwrap();
        textured(2, 200, 10).save(alice.join("b.png")).unwrap();
        GrayImage::from_pixel(200, 200, image::Luma([90])).save(ghost.join("flat.png")).unwrap();
        textured(3, 200, 10).save(dir.path().join("stray.png")).unwrap();

        let store = GalleryStore::new(dir.path(), GalleryLayout::PerIdentity);
        let (gallery, report) = store.load(&DescriptorStrategy::default()).unwrap();

        assert_eq!(gallery.len(), 1);
        assert_eq!(gallery.get(&"alice".into()).map(|r| r.len()), Some(2));
        assert!(!gallery.contains(&"ghost".into()));
        assert_eq!(report.identities, 1);
        assert_eq!(report.representations, 2);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].reason, SkipReason::NoDescriptors);
    }

    #[test]
    fn test_hidden_entries_are_not_identities() {
        let dir = tempfile::tempdir().unwrap();
        let trash = dir.path().join(".trash");
        let alice = dir.path().join("alice");
        fs::create_dir_all(&trash).unwrap();
        fs::create_dir_all(&alice).unwrap();
        textured(1, 200, 10).save(trash.join("a.png")).unwrap();
        textured(2, 200, 10).save(alice.join("a.png")).unwrap();
        textured(3, 200, 10).save(alice.join(".b.png")).unwrap();

        let store = GalleryStore::new(dir.path(), GalleryLayout::PerIdentity);
        let (gallery, report) = store.load(&DescriptorStrategy::default()).unwrap();
        let ids: Vec<_> = gallery.iter().map(|e| e.identity.as_str()).collect();
        assert_eq!(ids, vec!["alice"]);
        assert_eq!(report.representations, 1);
        assert!(report.skipped.is_empty());

        textured(4, 64, 8).save(dir.path().join(".hidden.png")).unwrap();
        let flat = GalleryStore::new(dir.path(), GalleryLayout::Flat);
        let (gallery, _) = flat.load(&HistogramStrategy::default()).unwrap();
        assert!(gallery.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_unreadable_identity_dir_is_skipped() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let alice = dir.path().join("alice");
        let locked = dir.path().join("locked");
        fs::create_dir_all(&alice).unwrap();
        fs::create_dir_all(&locked).unwrap();
        textured(1, 200, 10).save(alice.join("a.png")).unwrap();
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).unwrap();
        // Privileged users can still list the directory.
        let denied = fs::read_dir(&locked).is_err();

        let store = GalleryStore::new(dir.path(), GalleryLayout::PerIdentity);
        let loaded = store.load(&DescriptorStrategy::default());
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();

        let (gallery, report) = loaded.unwrap();
        assert_eq!(gallery.get(&"alice".into()).map(|r| r.len()), Some(1));
        assert!(!gallery.contains(&"locked".into()));
        if denied {
            assert_eq!(report.skipped.len(), 1);
            assert_eq!(report.skipped[0].path, locked);
            assert!(matches!(report.skipped[0].reason, SkipReason::Unreadable(_)));
        }
    }

    #[test]
    fn test_flat_enroll_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let store = GalleryStore::new(dir.path(), GalleryLayout::Flat);
        let first = store.enroll(&"dave".into(), &textured(1, 64, 8)).unwrap();
        let second = store.enroll(&"dave".into(), &textured(2, 64, 8)).unwrap();
        assert_eq!(first, second);
        assert_eq!(first, dir.path().join("dave.png"));

        let stored = image::open(&second).unwrap().to_luma8();
        assert_eq!(stored, textured(2, 64, 8));
        let leftovers = fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(leftovers, 1, "temporary files must not remain");
    }

    #[test]
    fn test_flat_enroll_replaces_other_extensions() {
        let dir = tempfile::tempdir().unwrap();
        textured(1, 64, 8).save(dir.path().join("frank.jpg")).unwrap();
        textured(3, 64, 8).save(dir.path().join("grace.jpg")).unwrap();

        let store = GalleryStore::new(dir.path(), GalleryLayout::Flat);
        store.enroll(&"frank".into(), &textured(2, 64, 8)).unwrap();
        assert!(!dir.path().join("frank.jpg").exists());
        assert!(dir.path().join("grace.jpg").exists());

        let (gallery, report) = store.load(&HistogramStrategy::default()).unwrap();
        assert!(report.skipped.is_empty());
        assert_eq!(gallery.len(), 2);
    }

    #[test]
    fn test_per_identity_enroll_accumulates() {
        let dir = tempfile::tempdir().unwrap();
        let store = GalleryStore::new(dir.path(), GalleryLayout::PerIdentity);
        let a = store.enroll(&"erin".into(), &textured(1, 200, 10)).unwrap();
        let b = store.enroll(&"erin".into(), &textured(2, 200, 10)).unwrap();
        assert_ne!(a, b);
        assert!(a.starts_with(dir.path().join("erin")));

        let (gallery, _) = store.load(&DescriptorStrategy::default()).unwrap();
        assert_eq!(gallery.get(&"erin".into()).map(|r| r.len()), Some(2));
    }

    #[test]
    fn test_enroll_rejects_unsafe_identity() {
        let dir = tempfile::tempdir().unwrap();
        let store = GalleryStore::new(dir.path(), GalleryLayout::Flat);
        let err = store.enroll(&"../escape".into(), &textured(1, 32, 4)).unwrap_err();
        assert!(matches!(err, GalleryError::InvalidLabel(_)));
    }

    #[test]
    fn test_load_report_serializes_reason() {
        let report = LoadReport {
            identities: 0,
            representations: 0,
            skipped: vec![SkippedFile { path: "x.png".into(), reason: SkipReason::NoDescriptors }],
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["skipped"][0]["reason"], "no-descriptors");
        assert_eq!(json["skipped"][0]["path"], "x.png");
    }
}
