use anyhow::{Context, Result};
use facegate_core::descriptor::{
    OrbExtractor, DEFAULT_FAST_THRESHOLD, DEFAULT_MAX_FEATURES, DEFAULT_MIN_MATCHES, DEFAULT_RATIO,
};
use facegate_core::detector::SCRFD_MODEL_FILE;
use facegate_core::histogram::DEFAULT_HISTOGRAM_THRESHOLD;
use facegate_core::{DescriptorStrategy, HistogramStrategy, StrategyKind};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Resolved configuration: defaults, then the TOML file, then `FACEGATE_*`
/// environment variables, then command-line flags.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub strategy: StrategyKind,
    /// Gallery root for the selected strategy.
    pub gallery_dir: PathBuf,
    /// Directory containing the SCRFD ONNX model.
    pub model_dir: PathBuf,
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    pub frame_width: u32,
    pub frame_height: u32,
    /// Correlation a histogram match must exceed.
    pub histogram_threshold: f64,
    /// Ratio-test matches a descriptor match needs.
    pub min_matches: usize,
    pub ratio: f32,
    pub max_features: usize,
    pub fast_threshold: u8,
    /// Seconds counted down between a capture request and the capture.
    pub countdown_secs: u32,
    /// Locate faces with SCRFD; when off the whole frame is the face.
    pub detect: bool,
}

/// On-disk form of [`Config`]; every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub strategy: Option<StrategyKind>,
    pub gallery_dir: Option<PathBuf>,
    pub model_dir: Option<PathBuf>,
    pub camera_device: Option<String>,
    pub frame_width: Option<u32>,
    pub frame_height: Option<u32>,
    pub histogram_threshold: Option<f64>,
    pub min_matches: Option<usize>,
    pub ratio: Option<f32>,
    pub max_features: Option<usize>,
    pub fast_threshold: Option<u8>,
    pub countdown_secs: Option<u32>,
    pub detect: Option<bool>,
}

impl FileConfig {
    pub fn read(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).with_context(|| format!("reading config {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
    }
}

/// Command-line overrides, applied last.
#[derive(Debug, Default)]
pub struct Overrides {
    pub strategy: Option<StrategyKind>,
    pub gallery_dir: Option<PathBuf>,
}

impl Config {
    /// Load from the process environment and an optional config file
    /// (`--config`, else `FACEGATE_CONFIG`).
    pub fn load(config_path: Option<&Path>, overrides: Overrides) -> Result<Self> {
        let env = |key: &str| std::env::var(key).ok();
        let path = config_path
            .map(Path::to_path_buf)
            .or_else(|| env("FACEGATE_CONFIG").map(PathBuf::from));

        let file = match path {
            Some(path) => FileConfig::read(&path)?,
            None => FileConfig::default(),
        };
        let config = Self::from_sources(file, env, overrides);
        tracing::debug!(?config, "configuration resolved");
        Ok(config)
    }

    /// Merge the layers. `env` looks up environment variables.
    pub fn from_sources(file: FileConfig, env: impl Fn(&str) -> Option<String>, overrides: Overrides) -> Self {
        let data_dir = env("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let home = env("HOME").unwrap_or_else(|| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("facegate");

        let strategy = overrides
            .strategy
            .or(env_parse(&env, "FACEGATE_STRATEGY"))
            .or(file.strategy)
            .unwrap_or(StrategyKind::Histogram);

        let gallery_dir = overrides
            .gallery_dir
            .or(env("FACEGATE_GALLERY_DIR").map(PathBuf::from))
            .or(file.gallery_dir)
            .unwrap_or_else(|| data_dir.join(strategy.as_str()));

        let model_dir = env("FACEGATE_MODEL_DIR")
            .map(PathBuf::from)
            .or(file.model_dir)
            .unwrap_or_else(|| data_dir.join("models"));

        Self {
            strategy,
            gallery_dir,
            model_dir,
            camera_device: env("FACEGATE_CAMERA_DEVICE")
                .or(file.camera_device)
                .unwrap_or_else(|| "/dev/video0".to_string()),
            frame_width: env_parse(&env, "FACEGATE_FRAME_WIDTH").or(file.frame_width).unwrap_or(640),
            frame_height: env_parse(&env, "FACEGATE_FRAME_HEIGHT").or(file.frame_height).unwrap_or(480),
            histogram_threshold: env_parse(&env, "FACEGATE_HISTOGRAM_THRESHOLD")
                .or(file.histogram_threshold)
                .unwrap_or(DEFAULT_HISTOGRAM_THRESHOLD),
            min_matches: env_parse(&env, "FACEGATE_MIN_MATCHES")
                .or(file.min_matches)
                .unwrap_or(DEFAULT_MIN_MATCHES),
            ratio: env_parse(&env, "FACEGATE_RATIO").or(file.ratio).unwrap_or(DEFAULT_RATIO),
            max_features: env_parse(&env, "FACEGATE_MAX_FEATURES")
                .or(file.max_features)
                .unwrap_or(DEFAULT_MAX_FEATURES),
            fast_threshold: env_parse(&env, "FACEGATE_FAST_THRESHOLD")
                .or(file.fast_threshold)
                .unwrap_or(DEFAULT_FAST_THRESHOLD),
            countdown_secs: env_parse(&env, "FACEGATE_COUNTDOWN_SECS")
                .or(file.countdown_secs)
                .unwrap_or(0),
            detect: env("FACEGATE_DETECT")
                .map(|v| v != "0" && !v.eq_ignore_ascii_case("false"))
                .or(file.detect)
                .unwrap_or(true),
        }
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> PathBuf {
        self.model_dir.join(SCRFD_MODEL_FILE)
    }

    pub fn histogram_strategy(&self) -> HistogramStrategy {
        HistogramStrategy::new(self.histogram_threshold)
    }

    pub fn descriptor_strategy(&self) -> DescriptorStrategy {
        let extractor = OrbExtractor {
            max_features: self.max_features,
            fast_threshold: self.fast_threshold,
            ..OrbExtractor::default()
        };
        DescriptorStrategy::new(extractor, self.min_matches, self.ratio)
    }
}

/// Parse an environment variable, ignoring (with a warning) values that
/// don't parse.
fn env_parse<T: FromStr>(env: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = env(key)?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparseable environment value");
            None
        }
    }
}
