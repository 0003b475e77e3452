mod chip;
mod soundfont;
mod tone;
mod voices;

use std::{
    fs::File,
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

pub use chip::ChipRenderer;
pub use soundfont::SoundFontRenderer;
pub use tone::ToneRenderer;

use crate::event::{CONTROLLER_CHORUS, CONTROLLER_REVERB};

pub const DEFAULT_SAMPLE_RATE: u32 = 48_000;
pub const MIDI_CHANNELS: u8 = 16;

#[derive(Debug, Error)]
pub enum RendererError {
    #[error("renderer initialization failed: {0}")]
    Init(String),
    #[error("failed to load soundfont {path}: {message}")]
    SoundFont { path: PathBuf, message: String },
    #[error("malformed event bytes: {0:02X?}")]
    MalformedEvent(Vec<u8>),
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SampleFormat {
    Float,
    Int,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct WaveFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
    pub sample_format: SampleFormat,
}

impl WaveFormat {
    #[must_use]
    pub const fn float_stereo(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            channels: 2,
            bits_per_sample: 32,
            sample_format: SampleFormat::Float,
        }
    }

    #[must_use]
    pub const fn int16_stereo(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            channels: 2,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        }
    }

    #[must_use]
    pub fn wav_spec(&self) -> hound::WavSpec {
        hound::WavSpec {
            channels: self.channels,
            sample_rate: self.sample_rate,
            bits_per_sample: self.bits_per_sample,
            sample_format: match self.sample_format {
                SampleFormat::Float => hound::SampleFormat::Float,
                SampleFormat::Int => hound::SampleFormat::Int,
            },
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq)]
pub struct Telemetry {
    pub active_voices: u64,
    pub cpu_load: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlKind {
    Reverb,
    Chorus,
}

impl ControlKind {
    #[must_use]
    pub const fn controller(self) -> u8 {
        match self {
            Self::Reverb => CONTROLLER_REVERB,
            Self::Chorus => CONTROLLER_CHORUS,
        }
    }
}

pub trait Renderer: Send {
    fn session_id(&self) -> Uuid;
    fn wave_format(&self) -> WaveFormat;
    fn native_float(&self) -> bool;
    fn send_event(&mut self, bytes: &[u8]) -> Result<(), RendererError>;
    fn send_control(&mut self, channel: u8, kind: ControlKind, value: u8);
    fn system_reset(&mut self);
    fn send_end_of_stream(&mut self);
    /// Fills `buffer` with interleaved samples and returns how many were
    /// written.
    fn read_samples(&mut self, buffer: &mut [f32]) -> usize;
    fn refresh_telemetry(&mut self) -> Telemetry;
}

pub trait RendererFactory: Send + Sync {
    fn wave_format(&self) -> WaveFormat;
    fn create(&self) -> Result<Box<dyn Renderer>, RendererError>;

    fn check_source(&self) -> Result<(), RendererError> {
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    #[default]
    Tone,
    Chip,
    SoundFont,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct SynthSettings {
    pub engine: EngineKind,
    pub sample_rate: u32,
    pub max_voices: usize,
    pub volume: f32,
    pub release_ms: f32,
    pub soundfont_path: Option<PathBuf>,
    pub disable_effects: bool,
}

impl Default for SynthSettings {
    fn default() -> Self {
        Self {
            engine: EngineKind::Tone,
            sample_rate: DEFAULT_SAMPLE_RATE,
            max_voices: 512,
            volume: 1.0,
            release_ms: 120.0,
            soundfont_path: None,
            disable_effects: false,
        }
    }
}

pub struct SynthFactory {
    settings: SynthSettings,
    soundfont: Mutex<Option<Arc<rustysynth::SoundFont>>>,
}

impl SynthFactory {
    #[must_use]
    pub fn new(settings: SynthSettings) -> Self {
        Self {
            settings,
            soundfont: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn settings(&self) -> &SynthSettings {
        &self.settings
    }

    fn soundfont_path(&self) -> Result<&PathBuf, RendererError> {
        self.settings
            .soundfont_path
            .as_ref()
            .ok_or_else(|| RendererError::Init("no soundfont configured".to_string()))
    }

    fn shared_soundfont(&self) -> Result<Arc<rustysynth::SoundFont>, RendererError> {
        let mut cached = self.soundfont.lock();
        if let Some(soundfont) = cached.as_ref() {
            return Ok(Arc::clone(soundfont));
        }

        let path = self.soundfont_path()?;
        let mut file = File::open(path).map_err(|error| RendererError::SoundFont {
            path: path.clone(),
            message: error.to_string(),
        })?;
        let soundfont =
            rustysynth::SoundFont::new(&mut file).map_err(|error| RendererError::SoundFont {
                path: path.clone(),
                message: format!("{error:?}"),
            })?;
        let soundfont = Arc::new(soundfont);
        info!(path = %path.display(), "soundfont loaded");
        *cached = Some(Arc::clone(&soundfont));
        Ok(soundfont)
    }
}

impl RendererFactory for SynthFactory {
    fn wave_format(&self) -> WaveFormat {
        match self.settings.engine {
            EngineKind::Tone | EngineKind::SoundFont => {
                WaveFormat::float_stereo(self.settings.sample_rate)
            }
            EngineKind::Chip => WaveFormat::int16_stereo(self.settings.sample_rate),
        }
    }

    fn create(&self) -> Result<Box<dyn Renderer>, RendererError> {
        Ok(match self.settings.engine {
            EngineKind::Tone => Box::new(ToneRenderer::new(&self.settings)),
            EngineKind::Chip => Box::new(ChipRenderer::new(&self.settings)),
            EngineKind::SoundFont => Box::new(SoundFontRenderer::new(
                &self.settings,
                self.shared_soundfont()?,
            )?),
        })
    }

    fn check_source(&self) -> Result<(), RendererError> {
        if self.settings.engine != EngineKind::SoundFont {
            return Ok(());
        }

        let path = self.soundfont_path()?;
        if !path.is_file() {
            return Err(RendererError::SoundFont {
                path: path.clone(),
                message: "file does not exist".to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Debug)]
pub(crate) struct LoadMeter {
    sample_rate: u32,
    busy: Duration,
    frames: u64,
}

impl LoadMeter {
    pub(crate) fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate: sample_rate.max(1),
            busy: Duration::ZERO,
            frames: 0,
        }
    }

    pub(crate) fn measure<R>(&mut self, frames: usize, render: impl FnOnce() -> R) -> R {
        let started = Instant::now();
        let result = render();
        self.busy += started.elapsed();
        self.frames += frames as u64;
        result
    }

    pub(crate) fn load_percent(&self) -> f32 {
        if self.frames == 0 {
            return 0.0;
        }
        let audio_seconds = self.frames as f64 / f64::from(self.sample_rate);
        (self.busy.as_secs_f64() / audio_seconds * 100.0) as f32
    }
}

pub(crate) fn split_channel_message(bytes: &[u8]) -> Result<(u8, u8, u8, u8), RendererError> {
    let malformed = || RendererError::MalformedEvent(bytes.to_vec());
    let (&status, data) = bytes.split_first().ok_or_else(malformed)?;
    if status < 0x80 || status >= 0xF0 {
        return Err(malformed());
    }

    let expected = match status & 0xF0 {
        0xC0 | 0xD0 => 1,
        _ => 2,
    };
    if data.len() < expected || data.iter().take(expected).any(|byte| *byte > 0x7F) {
        return Err(malformed());
    }

    let first = data[0];
    let second = if expected == 2 { data[1] } else { 0 };
    Ok((status & 0xF0, status & 0x0F, first, second))
}

pub(crate) fn is_gm_reset(bytes: &[u8]) -> bool {
    matches!(bytes, [0xF0, 0x7E, _, 0x09, 0x01, ..])
}
