use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, Ordering},
    },
    time::Duration,
};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

pub const PAUSE_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct PauseGate {
    paused: AtomicBool,
    lock: Mutex<()>,
    wake: Condvar,
}

impl PauseGate {
    pub fn set_paused(&self, paused: bool) {
        let _guard = self.lock.lock();
        self.paused.store(paused, Ordering::SeqCst);
        self.wake.notify_all();
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    /// Blocks while paused. Returns `false` when the run was cancelled
    /// before or during the wait.
    pub fn wait_while_paused(&self, cancel: &CancelToken) -> bool {
        if !self.is_paused() {
            return !cancel.is_cancelled();
        }

        let mut guard = self.lock.lock();
        while self.paused.load(Ordering::SeqCst) {
            if cancel.is_cancelled() {
                return false;
            }
            self.wake.wait_for(&mut guard, PAUSE_POLL_INTERVAL);
        }
        !cancel.is_cancelled()
    }
}

#[derive(Debug, Default)]
pub struct ProgressCounters {
    processed_events: AtomicU64,
    total_events: AtomicU64,
    processed_track_events: AtomicU64,
    total_track_events: AtomicU64,
    converted_files: AtomicU64,
    failed_files: AtomicU64,
    total_files: AtomicU64,
    processed_tracks: AtomicU64,
    total_tracks: AtomicU64,
}

impl ProgressCounters {
    pub fn begin_run(&self, total_files: u64, total_events: u64) {
        self.processed_events.store(0, Ordering::SeqCst);
        self.converted_files.store(0, Ordering::SeqCst);
        self.failed_files.store(0, Ordering::SeqCst);
        self.total_files.store(total_files, Ordering::SeqCst);
        self.total_events.store(total_events, Ordering::SeqCst);
        self.begin_tracks(0, 0);
    }

    pub fn begin_tracks(&self, total_tracks: u64, total_track_events: u64) {
        self.processed_tracks.store(0, Ordering::SeqCst);
        self.processed_track_events.store(0, Ordering::SeqCst);
        self.total_tracks.store(total_tracks, Ordering::SeqCst);
        self.total_track_events.store(total_track_events, Ordering::SeqCst);
    }

    pub fn add_events(&self, count: u64) {
        self.processed_events.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_track_events(&self, count: u64) {
        self.processed_track_events
            .fetch_add(count, Ordering::Relaxed);
    }

    pub fn track_completed(&self) {
        self.processed_tracks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn file_converted(&self) {
        self.converted_files.fetch_add(1, Ordering::Relaxed);
    }

    pub fn file_failed(&self) {
        self.failed_files.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            processed_events: self.processed_events.load(Ordering::Relaxed),
            total_events: self.total_events.load(Ordering::Relaxed),
            processed_track_events: self.processed_track_events.load(Ordering::Relaxed),
            total_track_events: self.total_track_events.load(Ordering::Relaxed),
            converted_files: self.converted_files.load(Ordering::Relaxed),
            failed_files: self.failed_files.load(Ordering::Relaxed),
            total_files: self.total_files.load(Ordering::Relaxed),
            processed_tracks: self.processed_tracks.load(Ordering::Relaxed),
            total_tracks: self.total_tracks.load(Ordering::Relaxed),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub processed_events: u64,
    pub total_events: u64,
    pub processed_track_events: u64,
    pub total_track_events: u64,
    pub converted_files: u64,
    pub failed_files: u64,
    pub total_files: u64,
    pub processed_tracks: u64,
    pub total_tracks: u64,
}

impl ProgressSnapshot {
    #[must_use]
    pub fn overall_percent(&self) -> f64 {
        percent(self.processed_events, self.total_events)
    }

    #[must_use]
    pub fn track_percent(&self) -> f64 {
        percent(self.processed_track_events, self.total_track_events)
    }

    #[must_use]
    pub fn finished_files(&self) -> u64 {
        self.converted_files + self.failed_files
    }
}

fn percent(processed: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (processed as f64 * 100.0 / total as f64).min(100.0)
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConversionPhase {
    #[default]
    Idle,
    Preparing,
    Rendering,
    RenderingTracks,
    Encoding,
    Finished,
    Cancelled,
    Failed,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct StatusReport {
    pub phase: ConversionPhase,
    pub message: String,
    pub percent: f64,
    pub track_percent: Option<f64>,
    pub paused: bool,
    pub progress: ProgressSnapshot,
}

impl StatusReport {
    #[must_use]
    pub fn describe(phase: ConversionPhase, progress: ProgressSnapshot, paused: bool) -> Self {
        let message = match phase {
            ConversionPhase::Idle => "Waiting to start.".to_string(),
            ConversionPhase::Preparing => "Preparing renderers...".to_string(),
            ConversionPhase::Rendering => format!(
                "{} file(s) out of {} have been converted.\n{} events rendered out of {}.",
                progress.finished_files(),
                progress.total_files,
                progress.processed_events,
                progress.total_events
            ),
            ConversionPhase::RenderingTracks => format!(
                "{} file(s) out of {} have been converted.\nRendered {} track(s) out of {}.",
                progress.finished_files(),
                progress.total_files,
                progress.processed_tracks,
                progress.total_tracks
            ),
            ConversionPhase::Encoding => "Writing rendered audio to disk...".to_string(),
            ConversionPhase::Finished => format!(
                "Conversion finished: {} converted, {} failed.",
                progress.converted_files, progress.failed_files
            ),
            ConversionPhase::Cancelled => "Conversion cancelled.".to_string(),
            ConversionPhase::Failed => "Conversion could not start.".to_string(),
        };

        let track_percent = (phase == ConversionPhase::RenderingTracks)
            .then(|| progress.track_percent());

        Self {
            phase,
            message,
            percent: progress.overall_percent(),
            track_percent,
            paused,
            progress,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    #[default]
    Initializing,
    Streaming,
    Draining,
    Finished,
    Cancelled,
    Faulted,
}

impl SchedulerState {
    const fn to_u8(self) -> u8 {
        match self {
            Self::Initializing => 0,
            Self::Streaming => 1,
            Self::Draining => 2,
            Self::Finished => 3,
            Self::Cancelled => 4,
            Self::Faulted => 5,
        }
    }

    const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Streaming,
            2 => Self::Draining,
            3 => Self::Finished,
            4 => Self::Cancelled,
            5 => Self::Faulted,
            _ => Self::Initializing,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct JobSnapshot {
    pub label: String,
    pub state: SchedulerState,
    pub processed_events: u64,
    pub total_events: u64,
    pub elapsed_seconds: f64,
    pub total_seconds: f64,
    pub played_notes: u64,
    pub active_voices: u64,
    pub cpu_load: f32,
}

#[derive(Debug)]
pub struct JobProgress {
    label: String,
    total_events: u64,
    total_seconds: f64,
    processed_events: AtomicU64,
    elapsed_seconds_bits: AtomicU64,
    played_notes: AtomicU64,
    active_voices: AtomicU64,
    cpu_load_bits: AtomicU32,
    state: AtomicU8,
}

impl JobProgress {
    #[must_use]
    pub fn new(label: impl Into<String>, total_events: u64, total_seconds: f64) -> Self {
        Self {
            label: label.into(),
            total_events,
            total_seconds,
            processed_events: AtomicU64::new(0),
            elapsed_seconds_bits: AtomicU64::new(0),
            played_notes: AtomicU64::new(0),
            active_voices: AtomicU64::new(0),
            cpu_load_bits: AtomicU32::new(0),
            state: AtomicU8::new(SchedulerState::Initializing.to_u8()),
        }
    }

    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    #[must_use]
    pub fn total_events(&self) -> u64 {
        self.total_events
    }

    pub fn add_event(&self) {
        self.processed_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_played_note(&self) {
        self.played_notes.fetch_add(1, Ordering::Relaxed);
    }

    /// Non-negative floats order the same as their bit patterns, so
    /// `fetch_max` keeps the published time monotonic.
    pub fn advance_elapsed(&self, seconds: f64) {
        self.elapsed_seconds_bits
            .fetch_max(seconds.max(0.0).to_bits(), Ordering::Relaxed);
    }

    pub fn publish_telemetry(&self, active_voices: u64, cpu_load: f32) {
        self.active_voices.store(active_voices, Ordering::Relaxed);
        self.cpu_load_bits
            .store(cpu_load.to_bits(), Ordering::Relaxed);
    }

    pub fn set_state(&self, state: SchedulerState) {
        self.state.store(state.to_u8(), Ordering::SeqCst);
    }

    #[must_use]
    pub fn state(&self) -> SchedulerState {
        SchedulerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    #[must_use]
    pub fn processed_events(&self) -> u64 {
        self.processed_events.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn elapsed_seconds(&self) -> f64 {
        f64::from_bits(self.elapsed_seconds_bits.load(Ordering::Relaxed))
    }

    #[must_use]
    pub fn played_notes(&self) -> u64 {
        self.played_notes.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn active_voices(&self) -> u64 {
        self.active_voices.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn cpu_load(&self) -> f32 {
        f32::from_bits(self.cpu_load_bits.load(Ordering::Relaxed))
    }

    #[must_use]
    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            label: self.label.clone(),
            state: self.state(),
            processed_events: self.processed_events(),
            total_events: self.total_events,
            elapsed_seconds: self.elapsed_seconds(),
            total_seconds: self.total_seconds,
            played_notes: self.played_notes(),
            active_voices: self.active_voices(),
            cpu_load: self.cpu_load(),
        }
    }
}
