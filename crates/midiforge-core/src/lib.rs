pub mod codec;
pub mod config;
pub mod convert;
pub mod diagnostics;
pub mod event;
pub mod fingerprint;
pub mod fixtures;
pub mod limiter;
pub mod merge;
pub mod output;
pub mod progress;
pub mod renderer;
pub mod scheduler;
pub mod score;
pub mod time;

pub use codec::{AudioCodec, FfmpegTranscoder, NoTranscoder, TranscodeError, Transcoder};
pub use config::{ConfigurationError, ConverterConfig};
pub use convert::{
    ConversionMode, ConversionReport, ConversionSettings, Converter, JobError, RenderedAudio,
    render_score,
};
pub use diagnostics::{
    TelemetryGuard, init_tracing, init_tracing_from_config, init_tracing_with_options,
};
pub use event::{Event, EventKind};
pub use fingerprint::{RenderFingerprint, fingerprint_samples, render_fingerprint};
pub use limiter::{Compressor, Limiter, LimiterSettings};
pub use merge::{MergedTimeline, Scope, TimedEvent};
pub use progress::{
    CancelToken, ConversionPhase, JobProgress, JobSnapshot, PauseGate, ProgressSnapshot,
    SchedulerState, StatusReport,
};
pub use renderer::{
    EngineKind, Renderer, RendererError, RendererFactory, SynthFactory, SynthSettings, WaveFormat,
};
pub use scheduler::{
    EventFilters, RenderSummary, RtsSettings, Scheduler, SchedulerError, SchedulerOutcome,
    SchedulerSettings,
};
pub use score::{LoadError, LoadOptions, Score, ScoreSummary};
pub use time::{TempoMap, TimeBase};
