//! facegate-core — Face identification and operator-gated enrollment engine.
//!
//! Two interchangeable matching strategies (global intensity histograms and
//! ORB-style binary descriptors) score a captured face against a gallery of
//! known identities kept on disk. Face localization uses SCRFD via ONNX
//! Runtime, or the whole frame when no detector is configured.

pub mod decision;
pub mod descriptor;
pub mod detector;
pub mod gallery;
pub mod histogram;
pub mod matcher;
pub mod preprocess;
pub mod session;
pub mod strategy;
pub mod types;

pub use decision::{Decision, Prompt};
pub use descriptor::DescriptorStrategy;
pub use gallery::{Gallery, GalleryError, GalleryLayout, GalleryStore, LoadReport};
pub use histogram::HistogramStrategy;
pub use session::{CaptureOutcome, Engine, EventSink, FaceLocator, FrameSource, SessionEvent, Trigger};
pub use strategy::{MatchingStrategy, StrategyKind};
pub use types::{Identity, MatchResult, Region};
