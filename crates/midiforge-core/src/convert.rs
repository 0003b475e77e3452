use std::{
    path::{Path, PathBuf},
    sync::Arc,
    thread,
    time::Duration,
};

use crossbeam_channel::{Sender, select};
use parking_lot::Mutex;
use rayon::{ThreadPool, ThreadPoolBuilder, prelude::*};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use crate::{
    codec::{AudioCodec, Transcoder},
    config::ConfigurationError,
    limiter::{Limiter, LimiterSettings},
    merge::Scope,
    output::{
        OutputPaths, create_track_folder, deliver, discard_swap, output_paths,
        track_output_paths, write_wav,
    },
    progress::{
        CancelToken, ConversionPhase, JobProgress, JobSnapshot, PauseGate, ProgressCounters,
        StatusReport,
    },
    renderer::{RendererError, RendererFactory, SynthFactory, SynthSettings, WaveFormat},
    scheduler::{
        JobContext, RenderSummary, SchedulerError, SchedulerOutcome, SchedulerSettings, Scheduler,
    },
    score::Score,
};

pub const STATUS_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConversionMode {
    #[default]
    WholeFile,
    PerTrack,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConversionSettings {
    pub output_dir: PathBuf,
    pub mode: ConversionMode,
    pub per_track_files: bool,
    pub threads: usize,
    pub codec: AudioCodec,
    pub bitrate_kbps: u32,
    pub synth: SynthSettings,
    pub limiter: LimiterSettings,
    pub scheduler: SchedulerSettings,
}

impl Default for ConversionSettings {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("data/renders"),
            mode: ConversionMode::WholeFile,
            per_track_files: false,
            threads: thread::available_parallelism().map_or(1, usize::from),
            codec: AudioCodec::Pcm,
            bitrate_kbps: 256,
            synth: SynthSettings::default(),
            limiter: LimiterSettings::default(),
            scheduler: SchedulerSettings::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    Renderer(#[from] RendererError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error("{score} has no timeline for {scope:?}")]
    InvalidScope { score: String, scope: Scope },
    #[error("all {failed} rendered track(s) of {score} failed")]
    TracksFailed { score: String, failed: u64 },
    #[error(transparent)]
    Output(#[from] anyhow::Error),
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct ConversionReport {
    pub outputs: Vec<PathBuf>,
    pub converted_files: u64,
    pub failed_files: u64,
    pub rendered_tracks: u64,
    pub skipped_tracks: u64,
    pub failed_tracks: u64,
    pub cancelled: bool,
}

#[derive(Debug, Clone)]
pub struct RenderedAudio {
    pub summary: RenderSummary,
    pub samples: Vec<f32>,
}

impl RenderedAudio {
    fn silent(format: WaveFormat) -> Self {
        Self {
            summary: RenderSummary {
                outcome: SchedulerOutcome::Finished,
                format,
                native_float: true,
                timeline_frames: 0,
                frames_written: 0,
                events_processed: 0,
            },
            samples: Vec::new(),
        }
    }

    fn mix(&mut self, other: &Self) {
        if self.samples.len() < other.samples.len() {
            self.samples.resize(other.samples.len(), 0.0);
        }
        for (out, sample) in self.samples.iter_mut().zip(&other.samples) {
            *out += sample;
        }

        let summary = &mut self.summary;
        summary.native_float &= other.summary.native_float;
        summary.timeline_frames = summary.timeline_frames.max(other.summary.timeline_frames);
        summary.frames_written = summary.frames_written.max(other.summary.frames_written);
        summary.events_processed += other.summary.events_processed;
    }
}

enum TrackOutcome {
    Skipped,
    Cancelled,
    Failed,
    Rendered(RenderedAudio),
    Written(PathBuf),
}

struct TrackFolder<'a> {
    parent: &'a Path,
    stem: String,
    path: Mutex<Option<PathBuf>>,
}

impl<'a> TrackFolder<'a> {
    fn new(parent: &'a Path, stem: String) -> Self {
        Self {
            parent,
            stem,
            path: Mutex::new(None),
        }
    }

    fn get_or_create(&self) -> anyhow::Result<PathBuf> {
        let mut path = self.path.lock();
        if let Some(path) = path.as_ref() {
            return Ok(path.clone());
        }
        let created = create_track_folder(self.parent, &self.stem)?;
        *path = Some(created.clone());
        Ok(created)
    }
}

fn render_timeline(
    score: &Score,
    scope: Scope,
    factory: &dyn RendererFactory,
    settings: &SchedulerSettings,
    ctx: &JobContext<'_>,
) -> Result<RenderedAudio, JobError> {
    let timeline = score.timeline(scope).ok_or_else(|| JobError::InvalidScope {
        score: score.name.clone(),
        scope,
    })?;
    let renderer = factory.create()?;
    let mut samples = Vec::new();
    let summary = Scheduler::new(renderer, settings).run(timeline, &mut samples, ctx)?;
    Ok(RenderedAudio { summary, samples })
}

pub fn render_score(
    score: &Score,
    scope: Scope,
    factory: &dyn RendererFactory,
    settings: &SchedulerSettings,
) -> Result<RenderedAudio, JobError> {
    let cancel = CancelToken::new();
    let pause = PauseGate::default();
    let progress = JobProgress::new(
        score.name.clone(),
        score.event_count(scope),
        score.duration_seconds,
    );
    let ctx = JobContext {
        cancel: &cancel,
        pause: &pause,
        progress: &progress,
        on_event: &|| {},
    };
    render_timeline(score, scope, factory, settings, &ctx)
}

pub struct Converter {
    settings: ConversionSettings,
    factory: Arc<dyn RendererFactory>,
    transcoder: Arc<dyn Transcoder>,
    cancel: CancelToken,
    pause: PauseGate,
    counters: ProgressCounters,
    phase: Mutex<ConversionPhase>,
    jobs: Mutex<Vec<Arc<JobProgress>>>,
    status_tx: Option<Sender<StatusReport>>,
}

impl Converter {
    #[must_use]
    pub fn new(
        settings: ConversionSettings,
        factory: Arc<dyn RendererFactory>,
        transcoder: Arc<dyn Transcoder>,
    ) -> Self {
        Self {
            settings,
            factory,
            transcoder,
            cancel: CancelToken::new(),
            pause: PauseGate::default(),
            counters: ProgressCounters::default(),
            phase: Mutex::new(ConversionPhase::Idle),
            jobs: Mutex::new(Vec::new()),
            status_tx: None,
        }
    }

    #[must_use]
    pub fn with_synth(settings: ConversionSettings, transcoder: Arc<dyn Transcoder>) -> Self {
        let factory = Arc::new(SynthFactory::new(settings.synth.clone()));
        Self::new(settings, factory, transcoder)
    }

    #[must_use]
    pub fn with_status_channel(mut self, sender: Sender<StatusReport>) -> Self {
        self.status_tx = Some(sender);
        self
    }

    #[must_use]
    pub fn settings(&self) -> &ConversionSettings {
        &self.settings
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.settings.threads == 0 {
            return Err(ConfigurationError::InvalidThreads);
        }

        let format = self.factory.wave_format();
        if format.sample_rate == 0 {
            return Err(ConfigurationError::InvalidSampleRate(format.sample_rate));
        }
        self.settings
            .codec
            .validate(format.sample_rate, self.settings.bitrate_kbps)?;
        self.factory
            .check_source()
            .map_err(|error| ConfigurationError::MissingSynthSource(error.to_string()))
    }

    #[must_use]
    pub fn can_start(&self) -> bool {
        match self.validate() {
            Ok(()) => true,
            Err(error) => {
                warn!(%error, "conversion cannot start");
                false
            }
        }
    }

    pub fn cancel(&self) {
        info!("conversion cancel requested");
        self.cancel.cancel();
    }

    #[must_use]
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn set_paused(&self, paused: bool) {
        debug!(paused, "conversion pause toggled");
        self.pause.set_paused(paused);
    }

    #[must_use]
    pub fn status(&self) -> StatusReport {
        StatusReport::describe(
            *self.phase.lock(),
            self.counters.snapshot(),
            self.pause.is_paused(),
        )
    }

    #[must_use]
    pub fn counters(&self) -> &ProgressCounters {
        &self.counters
    }

    #[must_use]
    pub fn active_jobs(&self) -> Vec<JobSnapshot> {
        self.jobs.lock().iter().map(|job| job.snapshot()).collect()
    }

    #[instrument(skip_all, fields(scores = scores.len(), mode = ?self.settings.mode))]
    pub fn convert(&self, scores: &[Score]) -> Result<ConversionReport, ConfigurationError> {
        if let Err(error) = self.validate() {
            self.set_phase(ConversionPhase::Failed);
            self.publish_status();
            return Err(error);
        }

        let pool = ThreadPoolBuilder::new()
            .num_threads(self.settings.threads)
            .thread_name(|index| format!("midiforge-render-{index}"))
            .build()
            .map_err(|error| ConfigurationError::WorkerPool(error.to_string()))?;

        let total_events: u64 = match self.settings.mode {
            ConversionMode::WholeFile => scores.iter().map(Score::total_event_count).sum(),
            ConversionMode::PerTrack => scores.iter().map(Score::total_merged_event_count).sum(),
        };
        self.counters.begin_run(scores.len() as u64, total_events);
        self.set_phase(ConversionPhase::Preparing);
        info!(
            files = scores.len(),
            total_events,
            threads = self.settings.threads,
            codec = %self.settings.codec,
            "conversion started"
        );

        let mut report = self.with_status_monitor(|| match self.settings.mode {
            ConversionMode::WholeFile => self.convert_whole_files(&pool, scores),
            ConversionMode::PerTrack => self.convert_per_track(&pool, scores),
        });

        let snapshot = self.counters.snapshot();
        report.converted_files = snapshot.converted_files;
        report.failed_files = snapshot.failed_files;
        report.cancelled = self.cancel.is_cancelled();

        self.set_phase(if report.cancelled {
            ConversionPhase::Cancelled
        } else {
            ConversionPhase::Finished
        });
        self.publish_status();
        info!(
            converted = report.converted_files,
            failed = report.failed_files,
            outputs = report.outputs.len(),
            cancelled = report.cancelled,
            "conversion finished"
        );
        Ok(report)
    }

    fn set_phase(&self, phase: ConversionPhase) {
        *self.phase.lock() = phase;
    }

    fn publish_status(&self) {
        if let Some(sender) = &self.status_tx {
            if sender.send(self.status()).is_err() {
                debug!("status receiver dropped");
            }
        }
    }

    fn with_status_monitor<R>(&self, work: impl FnOnce() -> R) -> R {
        let Some(sender) = self.status_tx.as_ref() else {
            return work();
        };

        let (done_tx, done_rx) = crossbeam_channel::bounded::<()>(0);
        thread::scope(|scope| {
            scope.spawn(move || {
                let ticker = crossbeam_channel::tick(STATUS_INTERVAL);
                loop {
                    select! {
                        recv(done_rx) -> _ => break,
                        recv(ticker) -> _ => {
                            if sender.send(self.status()).is_err() {
                                break;
                            }
                        }
                    }
                }
            });

            let result = work();
            drop(done_tx);
            result
        })
    }

    fn register_job(&self, job: JobProgress) -> Arc<JobProgress> {
        let job = Arc::new(job);
        self.jobs.lock().push(Arc::clone(&job));
        job
    }

    fn unregister_job(&self, job: &Arc<JobProgress>) {
        self.jobs.lock().retain(|active| !Arc::ptr_eq(active, job));
    }

    fn limiter_engaged(&self, native_float: bool) -> bool {
        !native_float || !self.settings.codec.handles_float() || self.settings.limiter.force
    }

    fn render_job(
        &self,
        score: &Score,
        scope: Scope,
        progress: &JobProgress,
        on_event: &(dyn Fn() + Sync),
    ) -> Result<Option<RenderedAudio>, JobError> {
        let ctx = JobContext {
            cancel: &self.cancel,
            pause: &self.pause,
            progress,
            on_event,
        };
        let audio = render_timeline(
            score,
            scope,
            self.factory.as_ref(),
            &self.settings.scheduler,
            &ctx,
        )?;
        Ok((audio.summary.outcome == SchedulerOutcome::Finished).then_some(audio))
    }

    fn finish_output(
        &self,
        paths: &OutputPaths,
        audio: &mut RenderedAudio,
    ) -> Result<PathBuf, JobError> {
        let format = audio.summary.format;
        if self.limiter_engaged(audio.summary.native_float) {
            debug!(path = %paths.final_path.display(), "limiting rendered output");
            Limiter::new(format.sample_rate, format.channels, &self.settings.limiter)
                .process_interleaved(&mut audio.samples);
        }

        if let Err(error) = write_wav(&paths.render, format, &audio.samples) {
            discard_swap(paths);
            return Err(error.into());
        }

        match deliver(
            paths,
            self.settings.codec,
            self.settings.bitrate_kbps,
            self.transcoder.as_ref(),
        ) {
            Ok(path) => Ok(path),
            Err(error) => {
                discard_swap(paths);
                Err(error.into())
            }
        }
    }

    fn convert_whole_files(&self, pool: &ThreadPool, scores: &[Score]) -> ConversionReport {
        self.set_phase(ConversionPhase::Rendering);
        let outputs: Vec<PathBuf> = pool.install(|| {
            scores
                .par_iter()
                .filter_map(|score| self.whole_file_job(score))
                .collect()
        });

        ConversionReport {
            outputs,
            ..ConversionReport::default()
        }
    }

    fn whole_file_job(&self, score: &Score) -> Option<PathBuf> {
        if self.cancel.is_cancelled() {
            return None;
        }

        match self.render_whole_file(score) {
            Ok(Some(path)) => {
                self.counters.file_converted();
                info!(score = %score.name, path = %path.display(), "score converted");
                Some(path)
            }
            Ok(None) => None,
            Err(error) => {
                error!(score = %score.name, %error, "conversion job failed");
                self.counters.file_failed();
                None
            }
        }
    }

    fn render_whole_file(&self, score: &Score) -> Result<Option<PathBuf>, JobError> {
        let progress = self.register_job(JobProgress::new(
            score.name.clone(),
            score.total_event_count(),
            score.duration_seconds,
        ));
        let on_event = || self.counters.add_events(1);
        let rendered = self.render_job(score, Scope::WholeFile, &progress, &on_event);
        self.unregister_job(&progress);

        let Some(mut audio) = rendered? else {
            return Ok(None);
        };
        let paths = output_paths(&self.settings.output_dir, &score.stem(), self.settings.codec);
        self.finish_output(&paths, &mut audio).map(Some)
    }

    fn convert_per_track(&self, pool: &ThreadPool, scores: &[Score]) -> ConversionReport {
        self.set_phase(ConversionPhase::RenderingTracks);
        let mut report = ConversionReport::default();

        for score in scores {
            if self.cancel.is_cancelled() {
                break;
            }
            match self.convert_tracks(pool, score, &mut report) {
                Ok(true) => {
                    self.counters.file_converted();
                    info!(score = %score.name, "score tracks converted");
                }
                Ok(false) => {}
                Err(error) => {
                    error!(score = %score.name, %error, "per-track conversion failed");
                    self.counters.file_failed();
                }
            }
        }
        report
    }

    /// Returns `false` when the run was cancelled before the score finished.
    /// A failed track is logged and left out; the score fails only when no
    /// rendered track survives.
    fn convert_tracks(
        &self,
        pool: &ThreadPool,
        score: &Score,
        report: &mut ConversionReport,
    ) -> Result<bool, JobError> {
        let track_count = score.track_count();
        self.counters
            .begin_tracks(track_count as u64, score.total_merged_event_count());

        let folder = self
            .settings
            .per_track_files
            .then(|| TrackFolder::new(&self.settings.output_dir, score.stem()));

        let outcomes: Vec<TrackOutcome> = pool.install(|| {
            (0..track_count)
                .into_par_iter()
                .map(|index| self.track_job(score, index, folder.as_ref()))
                .collect()
        });

        let mut mix: Option<RenderedAudio> = None;
        let mut cancelled = false;
        let (mut rendered, mut failed) = (0_u64, 0_u64);
        for outcome in outcomes {
            match outcome {
                TrackOutcome::Skipped => report.skipped_tracks += 1,
                TrackOutcome::Cancelled => cancelled = true,
                TrackOutcome::Failed => failed += 1,
                TrackOutcome::Written(path) => {
                    rendered += 1;
                    report.outputs.push(path);
                }
                TrackOutcome::Rendered(audio) => {
                    rendered += 1;
                    match mix.as_mut() {
                        Some(mix) => mix.mix(&audio),
                        None => mix = Some(audio),
                    }
                }
            }
        }
        report.rendered_tracks += rendered;
        report.failed_tracks += failed;

        if cancelled {
            return Ok(false);
        }
        if failed > 0 {
            if rendered == 0 {
                return Err(JobError::TracksFailed {
                    score: score.name.clone(),
                    failed,
                });
            }
            warn!(score = %score.name, failed, rendered, "writing score without its failed tracks");
        }
        if folder.is_some() {
            return Ok(true);
        }

        let mut audio = mix.unwrap_or_else(|| RenderedAudio::silent(self.factory.wave_format()));
        let paths = output_paths(&self.settings.output_dir, &score.stem(), self.settings.codec);
        self.set_phase(ConversionPhase::Encoding);
        self.publish_status();
        let written = self.finish_output(&paths, &mut audio);
        self.set_phase(ConversionPhase::RenderingTracks);
        report.outputs.push(written?);
        Ok(true)
    }

    fn track_job(
        &self,
        score: &Score,
        index: usize,
        folder: Option<&TrackFolder<'_>>,
    ) -> TrackOutcome {
        let outcome = self.render_track(score, index, folder).unwrap_or_else(|error| {
            error!(score = %score.name, track = index, %error, "track job failed");
            TrackOutcome::Failed
        });
        if !matches!(outcome, TrackOutcome::Cancelled) {
            self.counters.track_completed();
        }
        outcome
    }

    fn render_track(
        &self,
        score: &Score,
        index: usize,
        folder: Option<&TrackFolder<'_>>,
    ) -> Result<TrackOutcome, JobError> {
        if self.cancel.is_cancelled() {
            return Ok(TrackOutcome::Cancelled);
        }

        let scope = Scope::Track(index);
        let events = score.event_count(scope);
        if !score.track_has_notes(index) {
            self.counters.add_events(events);
            self.counters.add_track_events(events);
            debug!(score = %score.name, track = index, "skipping track without notes");
            return Ok(TrackOutcome::Skipped);
        }

        let progress = self.register_job(JobProgress::new(
            format!("{} - Track {index}", score.name),
            events,
            score.duration_seconds,
        ));
        let on_event = || {
            self.counters.add_events(1);
            self.counters.add_track_events(1);
        };
        let rendered = self.render_job(score, scope, &progress, &on_event);
        self.unregister_job(&progress);

        let Some(mut audio) = rendered? else {
            return Ok(TrackOutcome::Cancelled);
        };

        match folder {
            Some(folder) => {
                let paths = track_output_paths(&folder.get_or_create()?, index, self.settings.codec);
                Ok(TrackOutcome::Written(self.finish_output(&paths, &mut audio)?))
            }
            None => Ok(TrackOutcome::Rendered(audio)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        codec::NoTranscoder,
        fixtures::{EchoFactory, single_note_score_bytes},
        renderer::EngineKind,
        score::LoadOptions,
    };

    fn score(name: &str) -> Score {
        Score::from_bytes(name, &single_note_score_bytes(), &LoadOptions::default())
            .expect("fixture should load")
    }

    fn converter(dir: &Path, factory: EchoFactory) -> Converter {
        Converter::new(
            ConversionSettings {
                output_dir: dir.to_path_buf(),
                threads: 2,
                ..ConversionSettings::default()
            },
            Arc::new(factory),
            Arc::new(NoTranscoder),
        )
    }

    #[test]
    fn whole_file_mode_writes_one_wav_per_score() {
        let dir = tempfile::tempdir().expect("temp dir should be created");
        let converter = converter(dir.path(), EchoFactory::new(48_000));
        let report = converter
            .convert(&[score("first.mid"), score("second.mid")])
            .expect("conversion should start");

        assert_eq!(report.converted_files, 2);
        assert_eq!(report.failed_files, 0);
        assert_eq!(
            report.outputs,
            vec![dir.path().join("first.wav"), dir.path().join("second.wav")]
        );

        let reader = hound::WavReader::open(dir.path().join("first.wav")).expect("wav should open");
        assert_eq!(reader.duration(), 48_000);

        let status = converter.status();
        assert_eq!(status.phase, ConversionPhase::Finished);
        assert!((status.percent - 100.0).abs() < f64::EPSILON);
        assert!(converter.active_jobs().is_empty());
    }

    #[test]
    fn invalid_codec_settings_block_start() {
        let dir = tempfile::tempdir().expect("temp dir should be created");
        let converter = Converter::new(
            ConversionSettings {
                output_dir: dir.path().to_path_buf(),
                codec: AudioCodec::Mp3,
                ..ConversionSettings::default()
            },
            Arc::new(EchoFactory::new(96_000)),
            Arc::new(NoTranscoder),
        );

        assert!(!converter.can_start());
        assert!(matches!(
            converter.convert(&[score("song.mid")]),
            Err(ConfigurationError::UnsupportedSampleRate { .. })
        ));
        assert_eq!(converter.status().phase, ConversionPhase::Failed);
    }

    #[test]
    fn missing_soundfont_blocks_start() {
        let converter = Converter::with_synth(
            ConversionSettings {
                synth: SynthSettings {
                    engine: EngineKind::SoundFont,
                    soundfont_path: Some(PathBuf::from("/nonexistent/font.sf2")),
                    ..SynthSettings::default()
                },
                ..ConversionSettings::default()
            },
            Arc::new(NoTranscoder),
        );
        assert!(matches!(
            converter.validate(),
            Err(ConfigurationError::MissingSynthSource(_))
        ));
    }

    #[test]
    fn zero_threads_block_start() {
        let dir = tempfile::tempdir().expect("temp dir should be created");
        let mut converter = converter(dir.path(), EchoFactory::new(48_000));
        converter.settings.threads = 0;
        assert!(matches!(
            converter.validate(),
            Err(ConfigurationError::InvalidThreads)
        ));
    }

    #[test]
    fn cancelled_run_produces_no_output() {
        let dir = tempfile::tempdir().expect("temp dir should be created");
        let converter = converter(dir.path(), EchoFactory::new(48_000));
        converter.cancel();

        let report = converter
            .convert(&[score("song.mid")])
            .expect("conversion should start");
        assert!(report.cancelled);
        assert!(report.outputs.is_empty());
        assert_eq!(report.converted_files, 0);
        assert!(!dir.path().join("song.wav").exists());
        assert_eq!(converter.status().phase, ConversionPhase::Cancelled);
    }

    #[test]
    fn status_channel_receives_final_report() {
        let dir = tempfile::tempdir().expect("temp dir should be created");
        let (sender, receiver) = crossbeam_channel::unbounded();
        let converter =
            converter(dir.path(), EchoFactory::new(48_000)).with_status_channel(sender);

        converter
            .convert(&[score("song.mid")])
            .expect("conversion should start");
        let last = receiver.try_iter().last().expect("a status report");
        assert_eq!(last.phase, ConversionPhase::Finished);
        assert_eq!(last.progress.converted_files, 1);
    }

    #[test]
    fn mixed_track_output_reports_encoding_phase() {
        let dir = tempfile::tempdir().expect("temp dir should be created");
        let (sender, receiver) = crossbeam_channel::unbounded();
        let mut converter =
            converter(dir.path(), EchoFactory::new(48_000)).with_status_channel(sender);
        converter.settings.mode = ConversionMode::PerTrack;

        converter
            .convert(&[score("song.mid")])
            .expect("conversion should start");
        let reports: Vec<StatusReport> = receiver.try_iter().collect();
        let encoding = reports
            .iter()
            .find(|report| report.phase == ConversionPhase::Encoding)
            .expect("encoding status should be published");
        assert_eq!(encoding.message, "Writing rendered audio to disk...");
        assert_eq!(
            reports.last().map(|report| report.phase),
            Some(ConversionPhase::Finished)
        );
    }

    #[test]
    fn limiter_follows_float_support() {
        let dir = tempfile::tempdir().expect("temp dir should be created");
        let mut converter = converter(dir.path(), EchoFactory::new(48_000));
        assert!(!converter.limiter_engaged(true));
        assert!(converter.limiter_engaged(false));

        converter.settings.codec = AudioCodec::Flac;
        assert!(converter.limiter_engaged(true));

        converter.settings.codec = AudioCodec::Vorbis;
        converter.settings.limiter.force = true;
        assert!(converter.limiter_engaged(true));
    }

    #[test]
    fn mixing_sums_tracks_and_keeps_longest() {
        let format = WaveFormat::float_stereo(48_000);
        let mut first = RenderedAudio::silent(format);
        first.samples = vec![0.1, 0.1];
        let mut second = RenderedAudio::silent(format);
        second.samples = vec![0.2, 0.2, 0.3, 0.3];
        second.summary.native_float = false;

        first.mix(&second);
        assert_eq!(first.samples.len(), 4);
        assert!((first.samples[0] - 0.3).abs() < 1e-6);
        assert!((first.samples[3] - 0.3).abs() < 1e-6);
        assert!(!first.summary.native_float);
    }
}
