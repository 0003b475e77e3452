use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use chrono::Local;
use tracing::{info, instrument, warn};

use crate::{
    codec::{AudioCodec, Transcoder},
    renderer::{SampleFormat, WaveFormat},
};

pub const SWAP_EXTENSION: &str = "swp";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputPaths {
    pub render: PathBuf,
    pub final_path: PathBuf,
    pub fallback: PathBuf,
}

fn timestamp_suffix() -> String {
    Local::now().format("%Y-%m-%d %H%M%S").to_string()
}

fn paths_for(dir: &Path, stem: &str, codec: AudioCodec) -> OutputPaths {
    let final_path = dir.join(format!("{stem}.{}", codec.extension()));
    let fallback = dir.join(format!("{stem}.{}", AudioCodec::Pcm.extension()));
    let render = if codec == AudioCodec::Pcm {
        final_path.clone()
    } else {
        let mut swap = final_path.clone().into_os_string();
        swap.push(format!(".{SWAP_EXTENSION}"));
        PathBuf::from(swap)
    };

    OutputPaths {
        render,
        final_path,
        fallback,
    }
}

impl OutputPaths {
    fn clashes(&self) -> bool {
        self.final_path.exists() || self.fallback.exists() || self.render.exists()
    }
}

#[must_use]
pub fn output_paths(dir: &Path, stem: &str, codec: AudioCodec) -> OutputPaths {
    let paths = paths_for(dir, stem, codec);
    if !paths.clashes() {
        return paths;
    }
    paths_for(dir, &format!("{stem} - {}", timestamp_suffix()), codec)
}

#[must_use]
pub fn track_output_paths(folder: &Path, track_index: usize, codec: AudioCodec) -> OutputPaths {
    output_paths(folder, &format!("Track {track_index}"), codec)
}

pub fn create_track_folder(dir: &Path, stem: &str) -> Result<PathBuf> {
    let mut folder = dir.join(stem);
    if folder.exists() {
        folder = dir.join(format!("{stem} - {}", timestamp_suffix()));
    }
    fs::create_dir_all(&folder)
        .with_context(|| format!("failed to create track output folder: {}", folder.display()))?;
    Ok(folder)
}

#[instrument(skip(samples), fields(path = %path.display(), samples = samples.len()))]
pub fn write_wav(path: &Path, format: WaveFormat, samples: &[f32]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| {
            format!(
                "failed to create wav output directory: {}",
                parent.display()
            )
        })?;
    }

    let mut writer = hound::WavWriter::create(path, format.wav_spec())
        .with_context(|| format!("failed to create wav file: {}", path.display()))?;

    match (format.sample_format, format.bits_per_sample) {
        (SampleFormat::Float, _) => {
            for sample in samples {
                writer
                    .write_sample(*sample)
                    .context("failed to write float sample")?;
            }
        }
        (SampleFormat::Int, 16) => {
            for sample in samples {
                let quantized = (sample.clamp(-1.0, 1.0) * f32::from(i16::MAX)).round() as i16;
                writer
                    .write_sample(quantized)
                    .context("failed to write 16-bit sample")?;
            }
        }
        (SampleFormat::Int, bits) => {
            let scale = ((1_i64 << (bits.clamp(8, 32) - 1)) - 1) as f64;
            for sample in samples {
                let quantized = (f64::from(sample.clamp(-1.0, 1.0)) * scale).round() as i32;
                writer
                    .write_sample(quantized)
                    .context("failed to write integer sample")?;
            }
        }
    }

    writer.finalize().context("failed to finalize wav file")?;
    Ok(())
}

#[instrument(skip(transcoder), fields(render = %paths.render.display()))]
pub fn deliver(
    paths: &OutputPaths,
    codec: AudioCodec,
    bitrate_kbps: u32,
    transcoder: &dyn Transcoder,
) -> Result<PathBuf> {
    if codec == AudioCodec::Pcm {
        return Ok(paths.final_path.clone());
    }

    let result = if transcoder.is_available() {
        transcoder.transcode(&paths.render, codec, bitrate_kbps, &paths.final_path)
    } else {
        Err(crate::codec::TranscodeError::Unavailable)
    };

    match result {
        Ok(()) => {
            fs::remove_file(&paths.render).with_context(|| {
                format!("failed to remove swap file: {}", paths.render.display())
            })?;
            info!(path = %paths.final_path.display(), %codec, "encoded output written");
            Ok(paths.final_path.clone())
        }
        Err(error) => {
            warn!(%error, %codec, fallback = %paths.fallback.display(), "transcoding failed; keeping wav output");
            if paths.final_path.exists() {
                fs::remove_file(&paths.final_path).with_context(|| {
                    format!(
                        "failed to remove partial output: {}",
                        paths.final_path.display()
                    )
                })?;
            }
            fs::rename(&paths.render, &paths.fallback).with_context(|| {
                format!(
                    "failed to move swap file to fallback: {}",
                    paths.fallback.display()
                )
            })?;
            Ok(paths.fallback.clone())
        }
    }
}

pub fn discard_swap(paths: &OutputPaths) {
    if paths.render != paths.final_path && paths.render.exists() {
        if let Err(error) = fs::remove_file(&paths.render) {
            warn!(%error, path = %paths.render.display(), "failed to remove swap file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pcm_renders_straight_to_final_path() {
        let dir = tempfile::tempdir().expect("temp dir should be created");
        let paths = output_paths(dir.path(), "song", AudioCodec::Pcm);
        assert_eq!(paths.render, dir.path().join("song.wav"));
        assert_eq!(paths.render, paths.final_path);
    }

    #[test]
    fn encoded_output_renders_to_swap_file() {
        let dir = tempfile::tempdir().expect("temp dir should be created");
        let paths = output_paths(dir.path(), "song", AudioCodec::Vorbis);
        assert_eq!(paths.final_path, dir.path().join("song.ogg"));
        assert_eq!(paths.render, dir.path().join("song.ogg.swp"));
        assert_eq!(paths.fallback, dir.path().join("song.wav"));
    }

    #[test]
    fn existing_output_gets_timestamped_name() {
        let dir = tempfile::tempdir().expect("temp dir should be created");
        fs::write(dir.path().join("song.wav"), b"taken").expect("seed file should write");

        let paths = output_paths(dir.path(), "song", AudioCodec::Flac);
        let name = paths
            .final_path
            .file_name()
            .and_then(|name| name.to_str())
            .expect("file name");
        assert!(name.starts_with("song - "));
        assert!(name.ends_with(".flac"));
        assert_eq!(
            paths.fallback.file_stem(),
            paths.final_path.file_stem()
        );
    }

    #[test]
    fn int16_wav_round_trips_through_hound() {
        let dir = tempfile::tempdir().expect("temp dir should be created");
        let path = dir.path().join("chip.wav");
        write_wav(&path, WaveFormat::int16_stereo(22_050), &[0.5, -0.5, 1.5, 0.0])
            .expect("wav should write");

        let mut reader = hound::WavReader::open(&path).expect("wav should open");
        assert_eq!(reader.spec().bits_per_sample, 16);
        let samples: Vec<i16> = reader
            .samples::<i16>()
            .collect::<Result<_, _>>()
            .expect("samples should decode");
        assert_eq!(samples, vec![16_384, -16_384, i16::MAX, 0]);
    }

    #[test]
    fn track_folder_avoids_existing_directory() {
        let dir = tempfile::tempdir().expect("temp dir should be created");
        let first = create_track_folder(dir.path(), "song").expect("folder should be created");
        let second = create_track_folder(dir.path(), "song").expect("folder should be created");
        assert_ne!(first, second);
        assert!(second.is_dir());
    }
}
