//! Capture session: the engine that owns the gallery, the per-capture state
//! machine and the frame polling loop.
//!
//! ```text
//! Idle -> capture -> Located | NoFaceFound
//!   Located -> Extracted | NoDescriptors -> Matched
//!   Matched -> Identified -> authorization prompt
//!           -> Unknown    -> enrollment prompt
//! -> Idle
//! ```

use crate::decision::{self, Decision, Prompt};
use crate::gallery::{Gallery, GalleryError, GalleryStore, LoadReport};
use crate::matcher;
use crate::preprocess;
use crate::strategy::MatchingStrategy;
use crate::types::{Identity, MatchResult, Region};
use image::GrayImage;
use std::convert::Infallible;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("frame source unavailable: {0}")]
    Unavailable(String),
    #[error("frame read failed: {0}")]
    ReadFailed(String),
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("frame source unavailable: {0}")]
    SourceUnavailable(String),
    #[error("frame read failed: {0}")]
    FrameReadFailure(String),
    #[error("gallery: {0}")]
    Gallery(#[from] GalleryError),
}

impl From<SourceError> for SessionError {
    fn from(e: SourceError) -> Self {
        match e {
            SourceError::Unavailable(msg) => SessionError::SourceUnavailable(msg),
            SourceError::ReadFailed(msg) => SessionError::FrameReadFailure(msg),
        }
    }
}

/// Supplies grayscale frames; `Ok(None)` marks the end of the stream.
pub trait FrameSource {
    fn next_frame(&mut self) -> Result<Option<GrayImage>, SourceError>;
}

/// Finds face regions in a frame, most confident first.
pub trait FaceLocator {
    type Error: fmt::Display;

    fn locate(&mut self, frame: &GrayImage) -> Result<Vec<Region>, Self::Error>;
}

/// Treats the whole frame as the face, for inputs that are already cropped.
#[derive(Debug, Clone, Copy, Default)]
pub struct WholeFrameLocator;

impl FaceLocator for WholeFrameLocator {
    type Error = Infallible;

    fn locate(&mut self, frame: &GrayImage) -> Result<Vec<Region>, Infallible> {
        if frame.width() == 0 || frame.height() == 0 {
            return Ok(Vec::new());
        }
        Ok(vec![Region::full(frame.width(), frame.height())])
    }
}

/// Operator command observed between frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Idle,
    Capture,
    Quit,
}

/// Polled once per frame; must not block.
pub trait Trigger {
    fn poll(&mut self) -> Command;
}

/// Status the session reports to the operator.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    GalleryLoaded { identities: usize, representations: usize, skipped: usize },
    Countdown(u32),
    NoFaceFound,
    LocatorFailed(String),
    NoDescriptors,
    Identified { identity: Identity, score: f64 },
    AccessGranted { identity: Identity },
    AccessDenied { identity: Identity },
    NotRecognized { closest: Option<Identity>, score: f64 },
    Enrolled { identity: Identity, path: PathBuf },
    EnrollmentDeclined,
    EnrollmentFailed(String),
    GalleryReloadFailed(String),
}

impl fmt::Display for SessionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionEvent::GalleryLoaded { identities, representations, skipped } => write!(
                f,
                "gallery loaded: {identities} people, {representations} images ({skipped} skipped)"
            ),
            SessionEvent::Countdown(n) => write!(f, "capturing in {n}..."),
            SessionEvent::NoFaceFound => f.write_str("no face detected"),
            SessionEvent::LocatorFailed(reason) => write!(f, "face detection failed: {reason}"),
            SessionEvent::NoDescriptors => f.write_str("could not extract features from the face"),
            SessionEvent::Identified { identity, score } => {
                write!(f, "face identified as {identity} (score {score:.2})")
            }
            SessionEvent::AccessGranted { identity } => write!(f, "access granted to {identity}"),
            SessionEvent::AccessDenied { identity } => write!(f, "access denied to {identity}"),
            SessionEvent::NotRecognized { closest: Some(closest), score } => {
                write!(f, "face not recognized (closest: {closest}, score {score:.2})")
            }
            SessionEvent::NotRecognized { closest: None, .. } => f.write_str("face not recognized"),
            SessionEvent::Enrolled { identity, path } => {
                write!(f, "saved {identity} to {}", path.display())
            }
            SessionEvent::EnrollmentDeclined => f.write_str("face not saved"),
            SessionEvent::EnrollmentFailed(reason) => write!(f, "failed to save face: {reason}"),
            SessionEvent::GalleryReloadFailed(reason) => {
                write!(f, "face saved, but the gallery could not be reloaded: {reason}")
            }
        }
    }
}

/// Receives session events.
pub trait EventSink {
    fn report(&mut self, event: SessionEvent);
}

impl EventSink for Vec<SessionEvent> {
    fn report(&mut self, event: SessionEvent) {
        self.push(event);
    }
}

/// A representation written to the gallery during a capture.
#[derive(Debug, Clone, PartialEq)]
pub struct Enrollment {
    pub identity: Identity,
    pub path: PathBuf,
}

/// How one capture ended before returning to idle.
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureOutcome {
    NoFaceFound,
    NoDescriptors,
    Authorized {
        identity: Identity,
        score: f64,
        enrolled: Option<Enrollment>,
    },
    Denied {
        identity: Identity,
        score: f64,
    },
    Unknown {
        closest: Option<Identity>,
        score: f64,
        enrolled: Option<Enrollment>,
    },
}

/// Why [`Engine::run`] returned normally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    Quit,
    EndOfStream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSummary {
    pub end: SessionEnd,
    pub frames: usize,
    pub captures: usize,
}

/// Identification engine: a strategy, the store it enrolls into and the
/// gallery currently loaded from that store.
pub struct Engine<S: MatchingStrategy> {
    strategy: S,
    store: GalleryStore,
    gallery: Gallery<S::Repr>,
    report: LoadReport,
    countdown: Duration,
}

impl<S: MatchingStrategy> Engine<S> {
    /// Load the gallery from `store` and build an engine around it.
    pub fn open(strategy: S, store: GalleryStore) -> Result<Self, GalleryError> {
        let (gallery, report) = store.load(&strategy)?;
        Ok(Self {
            strategy,
            store,
            gallery,
            report,
            countdown: Duration::ZERO,
        })
    }

    /// Count down this many seconds between a capture request and the frame
    /// that is processed.
    pub fn with_countdown(mut self, seconds: u32) -> Self {
        self.countdown = Duration::from_secs(seconds as u64);
        self
    }

    pub fn strategy(&self) -> &S {
        &self.strategy
    }

    pub fn store(&self) -> &GalleryStore {
        &self.store
    }

    pub fn gallery(&self) -> &Gallery<S::Repr> {
        &self.gallery
    }

    pub fn load_report(&self) -> &LoadReport {
        &self.report
    }

    /// Rebuild the gallery from storage and swap it in.
    ///
    /// On failure the previous gallery stays in place.
    pub fn reload(&mut self) -> Result<&LoadReport, GalleryError> {
        let (gallery, report) = self.store.load(&self.strategy)?;
        self.gallery = gallery;
        self.report = report;
        Ok(&self.report)
    }

    /// Match a face crop against the gallery.
    ///
    /// Returns `None` when the crop yields no representation.
    pub fn identify_face(&self, face: &GrayImage) -> Option<MatchResult> {
        let query = self.strategy.extract(face)?;
        Some(matcher::identify(&self.strategy, &query, &self.gallery))
    }

    /// Write a face crop to the store under a typed label (blank labels fall
    /// back per layout) and reload the gallery.
    ///
    /// If the image was written but the reload fails, the error is
    /// [`GalleryError::ReloadAfterEnroll`] carrying the written path, and the
    /// previous gallery stays loaded.
    pub fn enroll(&mut self, typed_label: &str, face: &GrayImage) -> Result<Enrollment, GalleryError> {
        let layout = self.store.layout();
        let identity = layout.resolve_label(typed_label, chrono::Utc::now().timestamp());
        let path = self.store.enroll(&identity, face)?;
        if let Err(e) = self.reload() {
            return Err(GalleryError::ReloadAfterEnroll {
                identity,
                path,
                source: Box::new(e),
            });
        }
        Ok(Enrollment { identity, path })
    }

    /// Run one capture event on `frame` through locate, extract, match and
    /// decide, prompting the operator where the decision needs it.
    pub fn handle_capture<L, P, E>(
        &mut self,
        frame: &GrayImage,
        locator: &mut L,
        prompt: &mut P,
        events: &mut E,
    ) -> CaptureOutcome
    where
        L: FaceLocator,
        P: Prompt,
        E: EventSink,
    {
        let regions = match locator.locate(frame) {
            Ok(regions) => regions,
            Err(e) => {
                tracing::warn!(error = %e, "face locator failed");
                events.report(SessionEvent::LocatorFailed(e.to_string()));
                return CaptureOutcome::NoFaceFound;
            }
        };

        let Some(face) = regions.first().and_then(|r| preprocess::crop_region(frame, r)) else {
            tracing::info!(regions = regions.len(), "capture: no face");
            events.report(SessionEvent::NoFaceFound);
            return CaptureOutcome::NoFaceFound;
        };
        tracing::debug!(width = face.width(), height = face.height(), "capture: face located");

        let Some(result) = self.identify_face(&face) else {
            events.report(SessionEvent::NoDescriptors);
            return CaptureOutcome::NoDescriptors;
        };

        let policy = self.strategy.enrollment_policy();
        match decision::decide(&self.strategy, result) {
            Decision::Identified { identity, score } => {
                events.report(SessionEvent::Identified {
                    identity: identity.clone(),
                    score,
                });

                if !prompt.confirm(decision::AUTHORIZE_QUESTION) {
                    tracing::info!(identity = %identity, score, "access denied");
                    events.report(SessionEvent::AccessDenied { identity: identity.clone() });
                    return CaptureOutcome::Denied { identity, score };
                }

                tracing::info!(identity = %identity, score, "access granted");
                events.report(SessionEvent::AccessGranted { identity: identity.clone() });
                let enrolled = if policy.after_authorization {
                    self.offer_enrollment(&face, prompt, events)
                } else {
                    None
                };
                CaptureOutcome::Authorized {
                    identity,
                    score,
                    enrolled,
                }
            }
            Decision::Unknown { closest, score } => {
                tracing::info!(closest = closest.as_ref().map(|i| i.as_str()), score, "face not recognized");
                events.report(SessionEvent::NotRecognized {
                    closest: closest.clone(),
                    score,
                });

                let wants_enroll = !policy.confirm_unknown || prompt.confirm(decision::SAVE_FACE_QUESTION);
                let enrolled = if wants_enroll {
                    self.offer_enrollment(&face, prompt, events)
                } else {
                    events.report(SessionEvent::EnrollmentDeclined);
                    None
                };
                CaptureOutcome::Unknown {
                    closest,
                    score,
                    enrolled,
                }
            }
        }
    }

    fn offer_enrollment<P: Prompt, E: EventSink>(
        &mut self,
        face: &GrayImage,
        prompt: &mut P,
        events: &mut E,
    ) -> Option<Enrollment> {
        let label = prompt.ask_text(decision::LABEL_QUESTION);
        match self.enroll(&label, face) {
            Ok(enrollment) => {
                events.report(SessionEvent::Enrolled {
                    identity: enrollment.identity.clone(),
                    path: enrollment.path.clone(),
                });
                Some(enrollment)
            }
            Err(GalleryError::ReloadAfterEnroll { identity, path, source }) => {
                tracing::warn!(identity = %identity, path = %path.display(), error = %source, "gallery reload failed after enrollment");
                events.report(SessionEvent::Enrolled {
                    identity: identity.clone(),
                    path: path.clone(),
                });
                events.report(SessionEvent::GalleryReloadFailed(source.to_string()));
                Some(Enrollment { identity, path })
            }
            Err(e) => {
                tracing::warn!(error = %e, "enrollment failed");
                events.report(SessionEvent::EnrollmentFailed(e.to_string()));
                None
            }
        }
    }

    /// Poll frames until the operator quits or the source ends, handling a
    /// capture whenever the trigger asks for one.
    ///
    /// A frame read failure ends the session with an error.
    pub fn run<F, L, C, E>(
        &mut self,
        source: &mut F,
        locator: &mut L,
        console: &mut C,
        events: &mut E,
    ) -> Result<SessionSummary, SessionError>
    where
        F: FrameSource,
        L: FaceLocator,
        C: Trigger + Prompt,
        E: EventSink,
    {
        events.report(SessionEvent::GalleryLoaded {
            identities: self.report.identities,
            representations: self.report.representations,
            skipped: self.report.skipped.len(),
        });

        let mut summary = SessionSummary {
            end: SessionEnd::EndOfStream,
            frames: 0,
            captures: 0,
        };

        loop {
            let Some(mut frame) = next_frame(source)? else {
                break;
            };
            summary.frames += 1;

            match console.poll() {
                Command::Idle => continue,
                Command::Quit => {
                    summary.end = SessionEnd::Quit;
                    break;
                }
                Command::Capture => {}
            }

            if !self.countdown.is_zero() {
                for n in (1..=self.countdown.as_secs() as u32).rev() {
                    events.report(SessionEvent::Countdown(n));
                    std::thread::sleep(Duration::from_secs(1));
                }
                match next_frame(source)? {
                    Some(fresh) => frame = fresh,
                    None => break,
                }
                summary.frames += 1;
            }

            summary.captures += 1;
            let outcome = self.handle_capture(&frame, locator, console, events);
            tracing::debug!(?outcome, "capture handled");
        }

        tracing::info!(?summary, "session ended");
        Ok(summary)
    }
}

fn next_frame<F: FrameSource>(source: &mut F) -> Result<Option<GrayImage>, SessionError> {
    source.next_frame().map_err(|e| {
        tracing::error!(error = %e, "frame source failed");
        SessionError::from(e)
    })
}
