use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    thread,
    time::Duration,
};

use anyhow::{Context, anyhow};
use clap::{Args, Parser, Subcommand, ValueEnum};
use midiforge_core::{
    AudioCodec, ConversionMode, ConversionReport, Converter, ConverterConfig, EngineKind,
    FfmpegTranscoder, LoadOptions, Score, StatusReport, SynthFactory,
    diagnostics::init_tracing_from_config,
    fingerprint::{render_fingerprint, write_fingerprint},
    fixtures::demo_score_bytes,
};
use tracing::{info, warn};
use walkdir::WalkDir;

const MIDI_EXTENSIONS: [&str; 6] = ["mid", "midi", "kar", "rmi", "smf", "mff"];

#[derive(Debug, Parser)]
#[command(name = "midiforge-cli")]
#[command(about = "Render MIDI files to audio with the midiforge engines")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Overrides the discovered midiforge.config.toml.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Convert MIDI files, or every MIDI file under the given directories.
    Convert {
        #[arg(required = true)]
        inputs: Vec<PathBuf>,

        #[command(flatten)]
        render: RenderArgs,
    },
    /// Print score metadata as JSON.
    Inspect { input: PathBuf },
    /// Write the built-in demo score and convert it.
    Demo {
        #[command(flatten)]
        render: RenderArgs,
    },
    /// Render a score to memory and write its PCM fingerprint.
    Fingerprint {
        input: PathBuf,

        #[arg(long)]
        output: Option<PathBuf>,

        #[command(flatten)]
        render: RenderArgs,
    },
}

#[derive(Debug, Args)]
struct RenderArgs {
    #[arg(long)]
    output_dir: Option<PathBuf>,

    #[arg(long, value_enum)]
    mode: Option<ModeArg>,

    #[arg(long)]
    per_track_files: bool,

    /// pcm, flac, mp3, vorbis or wavpack.
    #[arg(long)]
    codec: Option<AudioCodec>,

    #[arg(long)]
    bitrate: Option<u32>,

    #[arg(long)]
    threads: Option<usize>,

    #[arg(long, value_enum)]
    engine: Option<EngineArg>,

    #[arg(long)]
    soundfont: Option<PathBuf>,

    #[arg(long)]
    sample_rate: Option<u32>,

    /// Apply the limiter even to float output.
    #[arg(long)]
    limiter: bool,

    #[arg(long)]
    rts: bool,

    #[arg(long)]
    rts_fps: Option<f64>,

    #[arg(long)]
    ffmpeg: Option<String>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ModeArg {
    WholeFile,
    PerTrack,
}

impl From<ModeArg> for ConversionMode {
    fn from(value: ModeArg) -> Self {
        match value {
            ModeArg::WholeFile => Self::WholeFile,
            ModeArg::PerTrack => Self::PerTrack,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum EngineArg {
    Tone,
    Chip,
    Soundfont,
}

impl From<EngineArg> for EngineKind {
    fn from(value: EngineArg) -> Self {
        match value {
            EngineArg::Tone => Self::Tone,
            EngineArg::Chip => Self::Chip,
            EngineArg::Soundfont => Self::SoundFont,
        }
    }
}

impl RenderArgs {
    fn apply(&self, config: &mut ConverterConfig) {
        if let Some(output_dir) = &self.output_dir {
            config.paths.output_dir = output_dir.clone();
        }
        if let Some(mode) = self.mode {
            config.render.mode = mode.into();
        }
        config.render.per_track_files |= self.per_track_files;
        if let Some(codec) = self.codec {
            config.encoder.codec = codec;
        }
        if let Some(bitrate) = self.bitrate {
            config.encoder.bitrate_kbps = bitrate;
        }
        if let Some(threads) = self.threads {
            config.render.threads = threads;
        }
        if let Some(engine) = self.engine {
            config.synth.engine = engine.into();
        }
        if let Some(soundfont) = &self.soundfont {
            config.synth.soundfont_path = Some(soundfont.clone());
            if self.engine.is_none() {
                config.synth.engine = EngineKind::SoundFont;
            }
        }
        if let Some(sample_rate) = self.sample_rate {
            config.synth.sample_rate = sample_rate;
        }
        config.limiter.force |= self.limiter;
        config.rts.enabled |= self.rts;
        if let Some(fps) = self.rts_fps {
            config.rts.target_fps = fps;
        }
        if let Some(ffmpeg) = &self.ffmpeg {
            config.encoder.ffmpeg_binary = ffmpeg.clone();
        }
    }
}

fn is_midi_file(path: &Path) -> bool {
    path.extension()
        .and_then(|extension| extension.to_str())
        .is_some_and(|extension| {
            MIDI_EXTENSIONS
                .iter()
                .any(|known| known.eq_ignore_ascii_case(extension))
        })
}

fn collect_inputs(inputs: &[PathBuf]) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for input in inputs {
        if input.is_dir() {
            let mut found: Vec<PathBuf> = WalkDir::new(input)
                .into_iter()
                .filter_map(Result::ok)
                .filter(|entry| entry.file_type().is_file() && is_midi_file(entry.path()))
                .map(|entry| entry.into_path())
                .collect();
            found.sort();
            files.extend(found);
        } else {
            files.push(input.clone());
        }
    }
    files
}

fn load_scores(paths: &[PathBuf], options: &LoadOptions) -> Vec<Score> {
    paths
        .iter()
        .filter_map(|path| match Score::load(path, options) {
            Ok(score) => Some(score),
            Err(error) => {
                warn!(path = %path.display(), %error, "skipping unreadable midi file");
                None
            }
        })
        .collect()
}

fn print_status(status: &StatusReport) {
    let paused = if status.paused { " (paused)" } else { "" };
    eprintln!(
        "[{:>5.1}%]{paused} {}",
        status.percent,
        status.message.replace('\n', " ")
    );
}

fn run_conversion(config: &ConverterConfig, scores: &[Score]) -> anyhow::Result<ConversionReport> {
    let (sender, receiver) = crossbeam_channel::unbounded();
    let transcoder = Arc::new(FfmpegTranscoder::new(config.encoder.ffmpeg_binary.clone()));
    let converter = Converter::with_synth(config.conversion_settings(), transcoder)
        .with_status_channel(sender);

    let outcome = thread::scope(|scope| {
        let worker = scope.spawn(|| converter.convert(scores));
        while !worker.is_finished() {
            if let Ok(status) = receiver.recv_timeout(Duration::from_millis(500)) {
                print_status(&status);
            }
        }
        worker.join()
    })
    .map_err(|_| anyhow!("conversion worker panicked"))?;

    if let Some(last) = receiver.try_iter().last() {
        print_status(&last);
    }
    outcome.context("conversion could not start")
}

fn print_report(report: &ConversionReport) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(report).context("failed to encode report json")?;
    println!("{json}");
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => ConverterConfig::load_from(path)?,
        None => ConverterConfig::load_or_default()?,
    };

    let log_dir = cli
        .log_dir
        .clone()
        .unwrap_or_else(|| config.paths.logs_dir.clone());
    let _telemetry = init_tracing_from_config(&log_dir, &config.diagnostics)?;

    match cli.command {
        Commands::Convert { inputs, render } => {
            render.apply(&mut config);
            let files = collect_inputs(&inputs);
            info!(files = files.len(), "midi inputs collected");

            let options = LoadOptions {
                threads: config.threads(),
                ..LoadOptions::default()
            };
            let scores = load_scores(&files, &options);
            let report = run_conversion(&config, &scores)?;
            print_report(&report)?;
        }
        Commands::Inspect { input } => {
            let score = Score::load(&input, &LoadOptions::default())
                .with_context(|| format!("failed to load {}", input.display()))?;
            let json = serde_json::to_string_pretty(&score.summary())
                .context("failed to encode score summary")?;
            println!("{json}");
        }
        Commands::Demo { render } => {
            render.apply(&mut config);
            let output_dir = config.paths.output_dir.clone();
            fs::create_dir_all(&output_dir).with_context(|| {
                format!("failed to create output directory: {}", output_dir.display())
            })?;

            let demo_path = output_dir.join("demo.mid");
            fs::write(&demo_path, demo_score_bytes())
                .with_context(|| format!("failed to write {}", demo_path.display()))?;
            info!(path = %demo_path.display(), "demo score written");

            let score = Score::load(&demo_path, &LoadOptions::default())
                .with_context(|| format!("failed to load {}", demo_path.display()))?;
            let report = run_conversion(&config, &[score])?;
            print_report(&report)?;
        }
        Commands::Fingerprint {
            input,
            output,
            render,
        } => {
            render.apply(&mut config);
            let score = Score::load(&input, &LoadOptions::default())
                .with_context(|| format!("failed to load {}", input.display()))?;
            let factory = SynthFactory::new(config.synth.clone());
            let settings = config.conversion_settings();
            let fingerprint = render_fingerprint(&score, &factory, &settings.scheduler)?;

            match output {
                Some(path) => {
                    write_fingerprint(&path, &fingerprint)?;
                    info!(path = %path.display(), hash = %fingerprint.pcm_hash, "fingerprint written");
                }
                None => {
                    let json = serde_json::to_string_pretty(&fingerprint)
                        .context("failed to encode fingerprint json")?;
                    println!("{json}");
                }
            }
        }
    }

    Ok(())
}
