mod capture;
mod config;
mod console;

use anyhow::{bail, Context, Result};
use capture::{CameraSource, Locator};
use clap::{Parser, Subcommand};
use config::{Config, Overrides};
use console::{Console, StdoutEvents};
use facegate_core::decision::{self, Decision};
use facegate_core::session::FaceLocator;
use facegate_core::{preprocess, Engine, GalleryStore, LoadReport, MatchResult, MatchingStrategy, Region, StrategyKind};
use facegate_hw::Camera;
use serde::Serialize;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "facegate", about = "Face identification console with operator-gated enrollment")]
struct Cli {
    /// TOML configuration file (default: $FACEGATE_CONFIG)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Matching strategy: histogram or descriptors
    #[arg(long, global = true)]
    strategy: Option<StrategyKind>,
    /// Gallery directory
    #[arg(long, global = true)]
    gallery: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Interactive capture session on the camera (Enter = capture, q = quit)
    Run,
    /// Identify the face in an image file
    Identify {
        image: PathBuf,
        /// Print the result as JSON
        #[arg(long)]
        json: bool,
        /// Treat the whole image as the face
        #[arg(long)]
        no_detect: bool,
    },
    /// Enroll the face in an image file
    Enroll {
        image: PathBuf,
        /// Identity label (blank for automatic)
        #[arg(short, long, default_value = "")]
        label: String,
        /// Treat the whole image as the face
        #[arg(long)]
        no_detect: bool,
    },
    /// List gallery identities
    List {
        #[arg(long)]
        json: bool,
    },
    /// List V4L2 capture devices
    Devices,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if let Commands::Devices = cli.command {
        return list_devices();
    }

    let overrides = Overrides {
        strategy: cli.strategy,
        gallery_dir: cli.gallery,
    };
    let config = Config::load(cli.config.as_deref(), overrides)?;

    match config.strategy {
        StrategyKind::Histogram => execute(config.histogram_strategy(), &config, cli.command),
        StrategyKind::Descriptors => execute(config.descriptor_strategy(), &config, cli.command),
    }
}

fn execute<S: MatchingStrategy>(strategy: S, config: &Config, command: Commands) -> Result<()> {
    let store = GalleryStore::new(&config.gallery_dir, strategy.layout());
    let engine = Engine::open(strategy, store)
        .with_context(|| format!("loading gallery {}", config.gallery_dir.display()))?;
    tracing::info!(
        strategy = %config.strategy,
        gallery = %config.gallery_dir.display(),
        identities = engine.gallery().len(),
        "engine ready"
    );

    match command {
        Commands::Run => run_session(engine, config),
        Commands::Identify { image, json, no_detect } => identify(&engine, config, &image, json, no_detect),
        Commands::Enroll { image, label, no_detect } => enroll(engine, config, &image, &label, no_detect),
        Commands::List { json } => list(&engine, json),
        Commands::Devices => list_devices(),
    }
}

fn run_session<S: MatchingStrategy>(engine: Engine<S>, config: &Config) -> Result<()> {
    let mut engine = engine.with_countdown(config.countdown_secs);
    let mut locator = Locator::from_config(config.detect, &config.scrfd_model_path())?;
    let mut source = CameraSource::open(&config.camera_device, config.frame_width, config.frame_height)
        .with_context(|| format!("opening camera {}", config.camera_device))?;
    let mut console = Console::spawn();

    println!("Press Enter to capture, q + Enter to quit.");
    let summary = engine.run(&mut source, &mut locator, &mut console, &mut StdoutEvents)?;
    println!("session ended after {} captures", summary.captures);
    Ok(())
}

/// Read an image file and crop the most confident face out of it.
fn face_from_file(path: &Path, config: &Config, no_detect: bool) -> Result<(image::GrayImage, Region)> {
    let frame = image::open(path)
        .with_context(|| format!("reading {}", path.display()))?
        .into_luma8();

    let mut locator = Locator::from_config(config.detect && !no_detect, &config.scrfd_model_path())?;
    let regions = locator.locate(&frame)?;
    let Some((region, face)) = regions
        .first()
        .and_then(|r| preprocess::crop_region(&frame, r).map(|face| (*r, face)))
    else {
        bail!("no face detected in {}", path.display());
    };
    Ok((face, region))
}

#[derive(Serialize)]
struct IdentifyReport {
    #[serde(flatten)]
    result: MatchResult,
    accepted: bool,
    region: Region,
}

fn identify<S: MatchingStrategy>(
    engine: &Engine<S>,
    config: &Config,
    image: &Path,
    json: bool,
    no_detect: bool,
) -> Result<()> {
    let (face, region) = face_from_file(image, config, no_detect)?;
    let Some(result) = engine.identify_face(&face) else {
        bail!("could not extract features from the face in {}", image.display());
    };

    let decision = decision::decide(engine.strategy(), result.clone());
    if json {
        let report = IdentifyReport {
            result,
            accepted: matches!(decision, Decision::Identified { .. }),
            region,
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    match decision {
        Decision::Identified { identity, score } => println!("identified: {identity} (score {score:.2})"),
        Decision::Unknown { closest: Some(closest), score } => {
            println!("not recognized (closest: {closest}, score {score:.2})")
        }
        Decision::Unknown { closest: None, .. } => println!("not recognized"),
    }
    Ok(())
}

fn enroll<S: MatchingStrategy>(
    mut engine: Engine<S>,
    config: &Config,
    image: &Path,
    label: &str,
    no_detect: bool,
) -> Result<()> {
    let (face, _) = face_from_file(image, config, no_detect)?;
    if engine.strategy().extract(&face).is_none() {
        bail!("could not extract features from the face in {}", image.display());
    }

    let enrollment = engine.enroll(label, &face)?;
    println!("saved {} to {}", enrollment.identity, enrollment.path.display());
    Ok(())
}

#[derive(Serialize)]
struct IdentitySummary {
    identity: String,
    images: usize,
}

#[derive(Serialize)]
struct GalleryListing<'a> {
    identities: Vec<IdentitySummary>,
    report: &'a LoadReport,
}

fn list<S: MatchingStrategy>(engine: &Engine<S>, json: bool) -> Result<()> {
    let identities: Vec<IdentitySummary> = engine
        .gallery()
        .iter()
        .map(|entry| IdentitySummary {
            identity: entry.identity.to_string(),
            images: entry.representations.len(),
        })
        .collect();

    if json {
        let listing = GalleryListing {
            identities,
            report: engine.load_report(),
        };
        println!("{}", serde_json::to_string_pretty(&listing)?);
        return Ok(());
    }

    if identities.is_empty() {
        println!("No identities enrolled in {}", engine.store().root().display());
    }
    for summary in &identities {
        println!("{:<32} {} image(s)", summary.identity, summary.images);
    }
    for skipped in &engine.load_report().skipped {
        println!("skipped {} ({:?})", skipped.path.display(), skipped.reason);
    }
    Ok(())
}

fn list_devices() -> Result<()> {
    let devices = Camera::list_devices();
    if devices.is_empty() {
        println!("No V4L2 capture devices found");
    }
    for dev in devices {
        println!("{}  {} ({}, {})", dev.path, dev.name, dev.driver, dev.bus);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_identify_with_globals() {
        let cli = Cli::try_parse_from([
            "facegate",
            "identify",
            "face.png",
            "--json",
            "--no-detect",
            "--strategy",
            "descriptors",
        ])
        .unwrap();
        assert_eq!(cli.strategy, Some(StrategyKind::Descriptors));
        assert!(matches!(cli.command, Commands::Identify { json: true, no_detect: true, .. }));
    }

    #[test]
    fn test_bad_strategy_rejected() {
        assert!(Cli::try_parse_from(["facegate", "--strategy", "eigenfaces", "list"]).is_err());
    }

    fn test_config(gallery: &Path) -> Config {
        let overrides = Overrides {
            strategy: Some(StrategyKind::Histogram),
            gallery_dir: Some(gallery.to_path_buf()),
        };
        let mut config = Config::from_sources(Default::default(), |_| None, overrides);
        config.detect = false;
        config
    }

    #[test]
    fn test_enroll_then_identify_from_files() {
        let dir = tempfile::tempdir().unwrap();
        let gallery = dir.path().join("gallery");
        let config = test_config(&gallery);

        let photo = dir.path().join("alice.png");
        image::GrayImage::from_fn(80, 80, |x, y| image::Luma([((x * 7 + y * 13) % 256) as u8]))
            .save(&photo)
            .unwrap();

        let engine = Engine::open(config.histogram_strategy(), GalleryStore::new(&gallery, StrategyKind::Histogram.layout())).unwrap();
        enroll(engine, &config, &photo, "alice", false).unwrap();
        assert!(gallery.join("alice.png").exists());

        let engine = Engine::open(config.histogram_strategy(), GalleryStore::new(&gallery, StrategyKind::Histogram.layout())).unwrap();
        let (face, region) = face_from_file(&photo, &config, false).unwrap();
        assert_eq!(region, Region::full(80, 80));
        let result = engine.identify_face(&face).unwrap();
        assert_eq!(result.identity.map(|i| i.to_string()), Some("alice".to_string()));
        identify(&engine, &config, &photo, true, false).unwrap();
    }

    #[test]
    fn test_identify_missing_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        assert!(face_from_file(&dir.path().join("nope.png"), &config, true).is_err());
    }
}
