use std::{
    fmt,
    path::{Path, PathBuf},
    process::{Command, Stdio},
    str::FromStr,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument};

use crate::config::ConfigurationError;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AudioCodec {
    #[default]
    Pcm,
    Flac,
    Mp3,
    Vorbis,
    WavPack,
}

impl AudioCodec {
    pub const ALL: [Self; 5] = [Self::Pcm, Self::Flac, Self::Mp3, Self::Vorbis, Self::WavPack];

    #[must_use]
    pub const fn extension(self) -> &'static str {
        match self {
            Self::Pcm => "wav",
            Self::Flac => "flac",
            Self::Mp3 => "mp3",
            Self::Vorbis => "ogg",
            Self::WavPack => "wv",
        }
    }

    #[must_use]
    pub const fn ffmpeg_encoder(self) -> Option<&'static str> {
        match self {
            Self::Pcm => None,
            Self::Flac => Some("flac"),
            Self::Mp3 => Some("libmp3lame"),
            Self::Vorbis => Some("libvorbis"),
            Self::WavPack => Some("wavpack"),
        }
    }

    #[must_use]
    pub const fn handles_float(self) -> bool {
        !matches!(self, Self::Flac | Self::Mp3)
    }

    #[must_use]
    pub const fn offers_bitrate(self) -> bool {
        matches!(self, Self::Mp3 | Self::Vorbis)
    }

    #[must_use]
    pub const fn max_sample_rate(self) -> Option<u32> {
        match self {
            Self::Flac => Some(384_000),
            Self::Mp3 | Self::Vorbis => Some(48_000),
            Self::Pcm | Self::WavPack => None,
        }
    }

    #[must_use]
    pub const fn max_bitrate_kbps(self) -> Option<u32> {
        match self {
            Self::Mp3 => Some(320),
            Self::Vorbis => Some(480),
            Self::Pcm | Self::Flac | Self::WavPack => None,
        }
    }

    pub fn validate(self, sample_rate: u32, bitrate_kbps: u32) -> Result<(), ConfigurationError> {
        if let Some(max) = self.max_sample_rate() {
            if sample_rate > max {
                return Err(ConfigurationError::UnsupportedSampleRate {
                    codec: self,
                    sample_rate,
                    max,
                });
            }
        }

        if let Some(max) = self.max_bitrate_kbps() {
            if bitrate_kbps == 0 || bitrate_kbps > max {
                return Err(ConfigurationError::UnsupportedBitrate {
                    codec: self,
                    bitrate_kbps,
                    max,
                });
            }
        }
        Ok(())
    }
}

impl fmt::Display for AudioCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pcm => "pcm",
            Self::Flac => "flac",
            Self::Mp3 => "mp3",
            Self::Vorbis => "vorbis",
            Self::WavPack => "wavpack",
        };
        f.write_str(name)
    }
}

impl FromStr for AudioCodec {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pcm" | "wav" => Ok(Self::Pcm),
            "flac" => Ok(Self::Flac),
            "mp3" | "lame" => Ok(Self::Mp3),
            "vorbis" | "ogg" => Ok(Self::Vorbis),
            "wavpack" | "wv" => Ok(Self::WavPack),
            other => Err(format!("unknown codec: {other}")),
        }
    }
}

#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error("no transcoder is available")]
    Unavailable,
    #[error("{0} output does not need transcoding")]
    NotRequired(AudioCodec),
    #[error("path is not valid utf-8: {0}")]
    InvalidPath(PathBuf),
    #[error("failed to spawn transcoder {binary}: {source}")]
    Spawn {
        binary: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("transcoder exited with {0}")]
    Failed(String),
}

pub trait Transcoder: Send + Sync {
    fn is_available(&self) -> bool;
    fn transcode(
        &self,
        input: &Path,
        codec: AudioCodec,
        bitrate_kbps: u32,
        output: &Path,
    ) -> Result<(), TranscodeError>;
}

#[derive(Debug, Clone)]
pub struct FfmpegTranscoder {
    binary: PathBuf,
}

impl Default for FfmpegTranscoder {
    fn default() -> Self {
        Self::new("ffmpeg")
    }
}

impl FfmpegTranscoder {
    #[must_use]
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

fn utf8_path(path: &Path) -> Result<&str, TranscodeError> {
    path.to_str()
        .ok_or_else(|| TranscodeError::InvalidPath(path.to_path_buf()))
}

impl Transcoder for FfmpegTranscoder {
    fn is_available(&self) -> bool {
        Command::new(&self.binary)
            .arg("-version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .is_ok_and(|status| status.success())
    }

    #[instrument(skip(self), fields(binary = %self.binary.display()))]
    fn transcode(
        &self,
        input: &Path,
        codec: AudioCodec,
        bitrate_kbps: u32,
        output: &Path,
    ) -> Result<(), TranscodeError> {
        let encoder = codec
            .ffmpeg_encoder()
            .ok_or(TranscodeError::NotRequired(codec))?;

        let mut command = Command::new(&self.binary);
        command.args([
            "-y",
            "-hide_banner",
            "-loglevel",
            "error",
            "-i",
            utf8_path(input)?,
            "-codec:a",
            encoder,
        ]);
        if codec.offers_bitrate() {
            command.arg("-b:a").arg(format!("{bitrate_kbps}k"));
        }
        command.arg(utf8_path(output)?);

        let status = command.status().map_err(|source| TranscodeError::Spawn {
            binary: self.binary.clone(),
            source,
        })?;
        if !status.success() {
            return Err(TranscodeError::Failed(status.to_string()));
        }

        debug!("transcode completed");
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoTranscoder;

impl Transcoder for NoTranscoder {
    fn is_available(&self) -> bool {
        false
    }

    fn transcode(
        &self,
        _input: &Path,
        _codec: AudioCodec,
        _bitrate_kbps: u32,
        _output: &Path,
    ) -> Result<(), TranscodeError> {
        Err(TranscodeError::Unavailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_table_matches_containers() {
        let extensions: Vec<&str> = AudioCodec::ALL.iter().map(|codec| codec.extension()).collect();
        assert_eq!(extensions, vec!["wav", "flac", "mp3", "ogg", "wv"]);
        assert!(!AudioCodec::Flac.handles_float());
        assert!(!AudioCodec::Mp3.handles_float());
        assert!(AudioCodec::Vorbis.handles_float());
        assert!(AudioCodec::Vorbis.offers_bitrate());
        assert!(!AudioCodec::Flac.offers_bitrate());
    }

    #[test]
    fn validation_enforces_codec_limits() {
        assert!(AudioCodec::Mp3.validate(48_000, 320).is_ok());
        assert!(matches!(
            AudioCodec::Mp3.validate(96_000, 320),
            Err(ConfigurationError::UnsupportedSampleRate { max: 48_000, .. })
        ));
        assert!(matches!(
            AudioCodec::Mp3.validate(44_100, 321),
            Err(ConfigurationError::UnsupportedBitrate { max: 320, .. })
        ));
        assert!(AudioCodec::Vorbis.validate(48_000, 480).is_ok());
        assert!(AudioCodec::Flac.validate(384_000, 0).is_ok());
        assert!(AudioCodec::Flac.validate(384_001, 0).is_err());
        assert!(AudioCodec::Pcm.validate(768_000, 0).is_ok());
    }

    #[test]
    fn codec_names_parse() {
        assert_eq!("OGG".parse::<AudioCodec>(), Ok(AudioCodec::Vorbis));
        assert_eq!("wv".parse::<AudioCodec>(), Ok(AudioCodec::WavPack));
        assert!("aac".parse::<AudioCodec>().is_err());
    }

    #[test]
    fn missing_binary_is_unavailable() {
        let transcoder = FfmpegTranscoder::new("/nonexistent/ffmpeg-midiforge");
        assert!(!transcoder.is_available());
        assert!(!NoTranscoder.is_available());
    }
}
