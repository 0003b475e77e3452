use std::{
    env, fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    codec::AudioCodec,
    convert::{ConversionMode, ConversionSettings},
    limiter::LimiterSettings,
    renderer::SynthSettings,
    scheduler::{EventFilters, RtsSettings, SchedulerSettings},
};

pub const CONFIG_FILE_NAME: &str = "midiforge.config.toml";
pub const CONFIG_PATH_ENV: &str = "MIDIFORGE_CONFIG_PATH";

#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("{codec} supports sample rates up to {max} Hz, got {sample_rate} Hz")]
    UnsupportedSampleRate {
        codec: AudioCodec,
        sample_rate: u32,
        max: u32,
    },
    #[error("{codec} supports bitrates from 1 to {max} kbps, got {bitrate_kbps} kbps")]
    UnsupportedBitrate {
        codec: AudioCodec,
        bitrate_kbps: u32,
        max: u32,
    },
    #[error("synthesis source unavailable: {0}")]
    MissingSynthSource(String),
    #[error("sample rate must be positive, got {0}")]
    InvalidSampleRate(u32),
    #[error("worker thread count must be at least 1")]
    InvalidThreads,
    #[error("failed to build worker pool: {0}")]
    WorkerPool(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct ConverterConfig {
    pub synth: SynthSettings,
    pub render: RenderConfig,
    pub encoder: EncoderConfig,
    pub events: EventFilters,
    pub rts: RtsSettings,
    pub limiter: LimiterSettings,
    pub diagnostics: DiagnosticsConfig,
    pub paths: PathsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RenderConfig {
    pub mode: ConversionMode,
    pub per_track_files: bool,
    pub threads: usize,
    pub max_tail_seconds: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EncoderConfig {
    pub codec: AudioCodec,
    pub bitrate_kbps: u32,
    pub ffmpeg_binary: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DiagnosticsConfig {
    pub rust_log_filter: String,
    pub trace_file_prefix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub output_dir: PathBuf,
    pub logs_dir: PathBuf,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            mode: ConversionMode::WholeFile,
            per_track_files: false,
            threads: 0,
            max_tail_seconds: SchedulerSettings::default().max_tail_seconds,
        }
    }
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            codec: AudioCodec::Pcm,
            bitrate_kbps: 256,
            ffmpeg_binary: "ffmpeg".to_string(),
        }
    }
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            rust_log_filter: "info,midiforge_core=debug".to_string(),
            trace_file_prefix: "midiforge".to_string(),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("data/renders"),
            logs_dir: PathBuf::from("logs"),
        }
    }
}

impl ConverterConfig {
    pub fn load() -> Result<Self> {
        let config_path = discover_config_path().with_context(|| {
            format!("failed to locate {CONFIG_FILE_NAME}; looked in cwd and parent directory")
        })?;
        Self::load_from(&config_path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;

        toml::from_str(&content)
            .with_context(|| format!("failed to parse config TOML from {}", path.display()))
    }

    /// Loads the discovered config file, or defaults when none exists. A
    /// file that exists but does not parse is still an error.
    pub fn load_or_default() -> Result<Self> {
        match discover_config_path() {
            Ok(path) => Self::load_from(&path),
            Err(_) => Ok(Self::default()),
        }
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("failed to serialize config to TOML")
    }

    #[must_use]
    pub fn threads(&self) -> usize {
        if self.render.threads == 0 {
            std::thread::available_parallelism().map_or(1, usize::from)
        } else {
            self.render.threads
        }
    }

    #[must_use]
    pub fn conversion_settings(&self) -> ConversionSettings {
        ConversionSettings {
            output_dir: self.paths.output_dir.clone(),
            mode: self.render.mode,
            per_track_files: self.render.per_track_files,
            threads: self.threads(),
            codec: self.encoder.codec,
            bitrate_kbps: self.encoder.bitrate_kbps,
            synth: self.synth.clone(),
            limiter: self.limiter,
            scheduler: SchedulerSettings {
                filters: self.events,
                rts: self.rts,
                max_tail_seconds: self.render.max_tail_seconds,
            },
        }
    }
}

fn discover_config_path() -> Result<PathBuf> {
    if let Some(path) = env::var_os(CONFIG_PATH_ENV) {
        let path = PathBuf::from(path);
        if path.is_file() {
            return Ok(path);
        }
    }

    let cwd = env::current_dir().context("failed to resolve current directory")?;
    let candidates = [
        cwd.join(CONFIG_FILE_NAME),
        cwd.join("..").join(CONFIG_FILE_NAME),
    ];

    candidates
        .into_iter()
        .find(|path| path.is_file())
        .ok_or_else(|| anyhow::anyhow!("{CONFIG_FILE_NAME} not found"))
}
