use std::{fs, path::Path, sync::Arc};

use midiforge_core::{
    AudioCodec, ConversionSettings, Converter, LoadOptions, NoTranscoder, Score, TranscodeError,
    Transcoder,
    fixtures::{EchoFactory, single_note_score_bytes},
};

/// Stands in for ffmpeg by copying the WAV to the requested output.
struct CopyTranscoder;

impl Transcoder for CopyTranscoder {
    fn is_available(&self) -> bool {
        true
    }

    fn transcode(
        &self,
        input: &Path,
        _codec: AudioCodec,
        _bitrate_kbps: u32,
        output: &Path,
    ) -> Result<(), TranscodeError> {
        fs::copy(input, output).map_err(|error| TranscodeError::Failed(error.to_string()))?;
        Ok(())
    }
}

/// Leaves a partial output behind and then reports failure.
struct BrokenTranscoder;

impl Transcoder for BrokenTranscoder {
    fn is_available(&self) -> bool {
        true
    }

    fn transcode(
        &self,
        _input: &Path,
        _codec: AudioCodec,
        _bitrate_kbps: u32,
        output: &Path,
    ) -> Result<(), TranscodeError> {
        fs::write(output, b"partial").map_err(|error| TranscodeError::Failed(error.to_string()))?;
        Err(TranscodeError::Failed("exit status: 1".to_string()))
    }
}

fn convert_with(dir: &Path, codec: AudioCodec, transcoder: Arc<dyn Transcoder>) -> Vec<std::path::PathBuf> {
    let converter = Converter::new(
        ConversionSettings {
            output_dir: dir.to_path_buf(),
            threads: 1,
            codec,
            bitrate_kbps: 192,
            ..ConversionSettings::default()
        },
        Arc::new(EchoFactory::new(48_000)),
        transcoder,
    );
    let score = Score::from_bytes("song.mid", &single_note_score_bytes(), &LoadOptions::default())
        .expect("fixture should load");
    let report = converter.convert(&[score]).expect("conversion should start");
    assert_eq!(report.converted_files, 1);
    report.outputs
}

#[test]
fn missing_transcoder_falls_back_to_wav() {
    let temp_dir = tempfile::tempdir().expect("tempdir should work");
    let outputs = convert_with(temp_dir.path(), AudioCodec::Vorbis, Arc::new(NoTranscoder));

    let wav = temp_dir.path().join("song.wav");
    assert_eq!(outputs, vec![wav.clone()]);
    assert!(hound::WavReader::open(&wav).is_ok());
    assert!(!temp_dir.path().join("song.ogg.swp").exists());
    assert!(!temp_dir.path().join("song.ogg").exists());
}

#[test]
fn successful_transcode_removes_swap_file() {
    let temp_dir = tempfile::tempdir().expect("tempdir should work");
    let outputs = convert_with(temp_dir.path(), AudioCodec::Mp3, Arc::new(CopyTranscoder));

    let encoded = temp_dir.path().join("song.mp3");
    assert_eq!(outputs, vec![encoded.clone()]);
    assert!(encoded.exists());
    assert!(!temp_dir.path().join("song.mp3.swp").exists());
    assert!(!temp_dir.path().join("song.wav").exists());
}

#[test]
fn failed_transcode_discards_partial_output() {
    let temp_dir = tempfile::tempdir().expect("tempdir should work");
    let outputs = convert_with(temp_dir.path(), AudioCodec::Flac, Arc::new(BrokenTranscoder));

    assert_eq!(outputs, vec![temp_dir.path().join("song.wav")]);
    assert!(!temp_dir.path().join("song.flac").exists());
    assert!(!temp_dir.path().join("song.flac.swp").exists());
}
