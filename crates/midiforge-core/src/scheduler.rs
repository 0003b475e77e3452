use rand::{Rng, SeedableRng, rngs::StdRng};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument, trace, warn};

use crate::{
    event::{CONTROLLER_CHORUS, CONTROLLER_REVERB, Event, EventKind},
    merge::TimedEvent,
    progress::{CancelToken, JobProgress, PauseGate, SchedulerState},
    renderer::{ControlKind, MIDI_CHANNELS, Renderer, WaveFormat},
    time::{round_to_nearest, seconds_to_frames},
};

pub const CHUNK_FRAMES: usize = 256;
const TELEMETRY_EVERY_EVENTS: u64 = 1_024;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct EventFilters {
    pub velocity_filter: bool,
    pub velocity_low: u8,
    pub velocity_high: u8,
    pub key_filter: bool,
    pub key_low: u8,
    pub key_high: u8,
    pub ignore_program_changes: bool,
    pub override_effects: bool,
    pub reverb: u8,
    pub chorus: u8,
}

impl Default for EventFilters {
    fn default() -> Self {
        Self {
            velocity_filter: false,
            velocity_low: 1,
            velocity_high: 1,
            key_filter: false,
            key_low: 0,
            key_high: 127,
            ignore_program_changes: false,
            override_effects: false,
            reverb: 64,
            chorus: 64,
        }
    }
}

impl EventFilters {
    fn key_excluded(&self, event: &Event) -> bool {
        self.key_filter
            && event
                .key()
                .is_some_and(|key| key < self.key_low || key > self.key_high)
    }

    fn velocity_excluded(&self, event: &Event) -> bool {
        self.velocity_filter
            && event
                .velocity()
                .is_some_and(|velocity| (self.velocity_low..=self.velocity_high).contains(&velocity))
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
#[serde(default)]
pub struct RtsSettings {
    pub enabled: bool,
    pub target_fps: f64,
    pub fluctuation_percent: f64,
    pub seed: u64,
}

impl Default for RtsSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            target_fps: 60.0,
            fluctuation_percent: 5.0,
            seed: 0x6d69_6469_666f_7267,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
#[serde(default)]
pub struct SchedulerSettings {
    pub filters: EventFilters,
    pub rts: RtsSettings,
    pub max_tail_seconds: f64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            filters: EventFilters::default(),
            rts: RtsSettings::default(),
            max_tail_seconds: 10.0,
        }
    }
}

struct RtsClock {
    rng: StdRng,
    nominal: f64,
    fluctuation: f64,
}

impl RtsClock {
    fn new(settings: &RtsSettings) -> Option<Self> {
        if !settings.enabled || settings.target_fps <= 0.0 {
            return None;
        }
        let nominal = 1.0 / settings.target_fps;
        Some(Self {
            rng: StdRng::seed_from_u64(settings.seed),
            nominal,
            fluctuation: nominal * settings.fluctuation_percent.clamp(0.0, 100.0) / 100.0,
        })
    }

    fn snap(&mut self, seconds: f64) -> f64 {
        let period = if self.fluctuation > 0.0 {
            self.nominal + self.rng.gen_range(-self.fluctuation..=self.fluctuation)
        } else {
            self.nominal
        };
        round_to_nearest(seconds, period)
    }
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("failed to write rendered samples: {0}")]
    Sink(String),
}

pub trait SampleSink {
    fn write_samples(&mut self, samples: &[f32]) -> Result<(), SchedulerError>;
}

impl SampleSink for Vec<f32> {
    fn write_samples(&mut self, samples: &[f32]) -> Result<(), SchedulerError> {
        self.extend_from_slice(samples);
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerOutcome {
    Finished,
    Cancelled,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct RenderSummary {
    pub outcome: SchedulerOutcome,
    pub format: WaveFormat,
    pub native_float: bool,
    pub timeline_frames: u64,
    pub frames_written: u64,
    pub events_processed: u64,
}

pub struct JobContext<'a> {
    pub cancel: &'a CancelToken,
    pub pause: &'a PauseGate,
    pub progress: &'a JobProgress,
    pub on_event: &'a (dyn Fn() + Sync),
}

pub struct Scheduler<'a> {
    renderer: Box<dyn Renderer>,
    settings: &'a SchedulerSettings,
    format: WaveFormat,
    channels: usize,
    chunk: Vec<f32>,
    frames_written: u64,
    events_processed: u64,
}

impl<'a> Scheduler<'a> {
    #[must_use]
    pub fn new(renderer: Box<dyn Renderer>, settings: &'a SchedulerSettings) -> Self {
        let format = renderer.wave_format();
        let channels = usize::from(format.channels.max(1));
        Self {
            renderer,
            settings,
            format,
            channels,
            chunk: vec![0.0; CHUNK_FRAMES * channels],
            frames_written: 0,
            events_processed: 0,
        }
    }

    #[instrument(skip_all, fields(session = %self.renderer.session_id(), job = %ctx.progress.label()))]
    pub fn run<I, S>(
        mut self,
        timeline: I,
        sink: &mut S,
        ctx: &JobContext<'_>,
    ) -> Result<RenderSummary, SchedulerError>
    where
        I: IntoIterator<Item = TimedEvent>,
        S: SampleSink + ?Sized,
    {
        ctx.progress.set_state(SchedulerState::Initializing);
        let filters = self.settings.filters;
        if filters.override_effects {
            for channel in 0..MIDI_CHANNELS {
                self.renderer
                    .send_control(channel, ControlKind::Reverb, filters.reverb);
                self.renderer
                    .send_control(channel, ControlKind::Chorus, filters.chorus);
            }
        }

        let mut clock = RtsClock::new(&self.settings.rts);
        let mut elapsed = 0.0_f64;
        ctx.progress.set_state(SchedulerState::Streaming);

        for timed in timeline {
            if !ctx.pause.wait_while_paused(ctx.cancel) {
                return Ok(self.cancelled(ctx));
            }

            elapsed += timed.delta_seconds;
            ctx.progress.advance_elapsed(elapsed);

            let time = clock.as_mut().map_or(elapsed, |clock| clock.snap(elapsed));
            let target = seconds_to_frames(time, self.format.sample_rate);
            if target > self.frames_written {
                if let Err(error) = self.pull(target - self.frames_written, sink) {
                    ctx.progress.set_state(SchedulerState::Faulted);
                    return Err(error);
                }
            }

            self.dispatch(&timed.event, ctx.progress);
            self.events_processed += 1;
            ctx.progress.add_event();
            (ctx.on_event)();

            if self.events_processed % TELEMETRY_EVERY_EVENTS == 0 {
                self.publish_telemetry(ctx.progress);
            }
        }

        let timeline_frames = self.frames_written;
        ctx.progress.set_state(SchedulerState::Draining);
        self.renderer.send_end_of_stream();
        let tail_limit = seconds_to_frames(self.settings.max_tail_seconds, self.format.sample_rate);
        let mut tail_frames = 0_u64;

        loop {
            if !ctx.pause.wait_while_paused(ctx.cancel) {
                return Ok(self.cancelled(ctx));
            }
            if self.publish_telemetry(ctx.progress) == 0 || tail_frames >= tail_limit {
                break;
            }

            let frames = (tail_limit - tail_frames).min(CHUNK_FRAMES as u64);
            if let Err(error) = self.pull(frames, sink) {
                ctx.progress.set_state(SchedulerState::Faulted);
                return Err(error);
            }
            tail_frames += frames;
        }

        ctx.progress.set_state(SchedulerState::Finished);
        debug!(
            events = self.events_processed,
            frames = self.frames_written,
            tail_frames,
            "timeline rendered"
        );
        Ok(self.summary(SchedulerOutcome::Finished, timeline_frames))
    }

    fn pull<S>(&mut self, frames: u64, sink: &mut S) -> Result<(), SchedulerError>
    where
        S: SampleSink + ?Sized,
    {
        let mut remaining = frames;
        while remaining > 0 {
            let take = remaining.min(CHUNK_FRAMES as u64) as usize;
            let chunk = &mut self.chunk[..take * self.channels];
            chunk.fill(0.0);
            let read = self.renderer.read_samples(chunk);
            if read < chunk.len() {
                trace!(requested = chunk.len(), read, "renderer returned a short read");
            }
            sink.write_samples(chunk)?;
            self.frames_written += take as u64;
            remaining -= take as u64;
        }
        Ok(())
    }

    fn dispatch(&mut self, event: &Event, progress: &JobProgress) {
        if !event.kind.is_dispatchable() {
            return;
        }

        let filters = &self.settings.filters;
        match event.kind {
            EventKind::NoteOn => {
                progress.add_played_note();
                if filters.velocity_excluded(event) || filters.key_excluded(event) {
                    return;
                }
            }
            EventKind::NoteOff if filters.key_excluded(event) => return,
            EventKind::ProgramChange if filters.ignore_program_changes => return,
            EventKind::ControlChange
                if filters.override_effects
                    && matches!(
                        event.controller(),
                        Some(CONTROLLER_REVERB | CONTROLLER_CHORUS)
                    ) =>
            {
                return;
            }
            _ => {}
        }

        if let Err(error) = self.renderer.send_event(event.bytes()) {
            warn!(%error, kind = ?event.kind, "skipping event the renderer rejected");
        }
    }

    fn publish_telemetry(&mut self, progress: &JobProgress) -> u64 {
        let telemetry = self.renderer.refresh_telemetry();
        progress.publish_telemetry(telemetry.active_voices, telemetry.cpu_load);
        telemetry.active_voices
    }

    fn cancelled(&self, ctx: &JobContext<'_>) -> RenderSummary {
        ctx.progress.set_state(SchedulerState::Cancelled);
        debug!(events = self.events_processed, "render cancelled");
        self.summary(SchedulerOutcome::Cancelled, self.frames_written)
    }

    fn summary(&self, outcome: SchedulerOutcome, timeline_frames: u64) -> RenderSummary {
        RenderSummary {
            outcome,
            format: self.format,
            native_float: self.renderer.native_float(),
            timeline_frames,
            frames_written: self.frames_written,
            events_processed: self.events_processed,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicU64, Ordering},
        thread,
        time::Duration,
    };

    use uuid::Uuid;

    use super::*;
    use crate::{
        fixtures::{
            EchoFactory, control_change, end_of_track, note_off, note_on, program_change,
            single_note_score_bytes, smf_bytes, tempo,
        },
        merge::Scope,
        renderer::{RendererError, RendererFactory, Telemetry},
        score::{LoadOptions, Score},
    };

    struct Harness {
        cancel: CancelToken,
        pause: PauseGate,
        progress: JobProgress,
        global: AtomicU64,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                cancel: CancelToken::new(),
                pause: PauseGate::default(),
                progress: JobProgress::new("test", 0, 0.0),
                global: AtomicU64::new(0),
            }
        }

        fn render(
            &self,
            score: &Score,
            factory: &EchoFactory,
            settings: &SchedulerSettings,
        ) -> (RenderSummary, Vec<f32>) {
            let on_event = || {
                self.global.fetch_add(1, Ordering::Relaxed);
            };
            let renderer = factory.create().expect("echo renderer should start");
            self.run(score, renderer, settings, &on_event)
        }

        fn run(
            &self,
            score: &Score,
            renderer: Box<dyn Renderer>,
            settings: &SchedulerSettings,
            on_event: &(dyn Fn() + Sync),
        ) -> (RenderSummary, Vec<f32>) {
            let ctx = JobContext {
                cancel: &self.cancel,
                pause: &self.pause,
                progress: &self.progress,
                on_event,
            };
            let mut samples = Vec::new();
            let summary = Scheduler::new(renderer, settings)
                .run(
                    score.timeline(Scope::WholeFile).expect("whole file"),
                    &mut samples,
                    &ctx,
                )
                .expect("render should succeed");
            (summary, samples)
        }
    }

    struct DroneRenderer {
        session_id: Uuid,
    }

    impl Renderer for DroneRenderer {
        fn session_id(&self) -> Uuid {
            self.session_id
        }

        fn wave_format(&self) -> WaveFormat {
            WaveFormat::float_stereo(1_000)
        }

        fn native_float(&self) -> bool {
            true
        }

        fn send_event(&mut self, _bytes: &[u8]) -> Result<(), RendererError> {
            Ok(())
        }

        fn send_control(&mut self, _channel: u8, _kind: ControlKind, _value: u8) {}

        fn system_reset(&mut self) {}

        fn send_end_of_stream(&mut self) {}

        fn read_samples(&mut self, buffer: &mut [f32]) -> usize {
            buffer.fill(0.5);
            buffer.len()
        }

        fn refresh_telemetry(&mut self) -> Telemetry {
            Telemetry {
                active_voices: 1,
                cpu_load: 0.0,
            }
        }
    }

    fn load(bytes: &[u8]) -> Score {
        Score::from_bytes("fixture.mid", bytes, &LoadOptions::default()).expect("fixture should load")
    }

    #[test]
    fn single_note_renders_exactly_one_second_before_drain() {
        let score = load(&single_note_score_bytes());
        let factory = EchoFactory::new(48_000);
        let harness = Harness::new();
        let (summary, samples) = harness.render(&score, &factory, &SchedulerSettings::default());

        assert_eq!(summary.outcome, SchedulerOutcome::Finished);
        assert_eq!(summary.timeline_frames, 48_000);
        // the echo renderer has no release tail
        assert_eq!(samples.len(), 48_000 * 2);
        assert_eq!(summary.events_processed, 4);
        assert_eq!(harness.global.load(Ordering::Relaxed), 4);
        assert_eq!(harness.progress.played_notes(), 1);
        assert_eq!(harness.progress.state(), SchedulerState::Finished);

        let records = factory.records();
        let frames: Vec<u64> = records.iter().map(|record| record.frame).collect();
        assert_eq!(frames, vec![0, 24_000]);
    }

    #[test]
    fn dispatch_positions_never_decrease_under_rts() {
        let mut track = vec![tempo(0, 133.0)];
        for step in 0..64_u8 {
            track.push(note_on(if step == 0 { 0 } else { 37 }, 0, 40 + step % 40, 90));
            track.push(note_off(23, 0, 40 + step % 40));
        }
        track.push(end_of_track(0));
        let score = load(&smf_bytes(480, vec![track]));

        let settings = SchedulerSettings {
            rts: RtsSettings {
                enabled: true,
                target_fps: 60.0,
                fluctuation_percent: 25.0,
                seed: 7,
            },
            ..SchedulerSettings::default()
        };
        let factory = EchoFactory::new(44_100);
        let (summary, _) = Harness::new().render(&score, &factory, &settings);

        let frames: Vec<u64> = factory.records().iter().map(|record| record.frame).collect();
        assert!(frames.windows(2).all(|pair| pair[0] <= pair[1]));
        assert!(summary.timeline_frames > 0);
    }

    #[test]
    fn seeded_rts_is_reproducible() {
        let score = load(&single_note_score_bytes());
        let settings = SchedulerSettings {
            rts: RtsSettings {
                enabled: true,
                ..RtsSettings::default()
            },
            ..SchedulerSettings::default()
        };

        let first = EchoFactory::new(48_000);
        let second = EchoFactory::new(48_000);
        let (a, _) = Harness::new().render(&score, &first, &settings);
        let (b, _) = Harness::new().render(&score, &second, &settings);

        assert_eq!(a.frames_written, b.frames_written);
        let frames = |factory: &EchoFactory| -> Vec<u64> {
            factory.records().iter().map(|record| record.frame).collect()
        };
        assert_eq!(frames(&first), frames(&second));
    }

    #[test]
    fn filters_drop_matching_events() {
        let score = load(&smf_bytes(
            480,
            vec![vec![
                program_change(0, 0, 12),
                control_change(0, 0, CONTROLLER_REVERB, 100),
                note_on(0, 0, 20, 100),
                note_on(0, 0, 60, 1),
                note_on(0, 0, 64, 100),
                note_off(240, 0, 20),
                note_off(0, 0, 60),
                note_off(0, 0, 64),
                end_of_track(0),
            ]],
        ));
        let settings = SchedulerSettings {
            filters: EventFilters {
                velocity_filter: true,
                velocity_low: 1,
                velocity_high: 10,
                key_filter: true,
                key_low: 21,
                key_high: 108,
                ignore_program_changes: true,
                override_effects: true,
                reverb: 10,
                chorus: 0,
            },
            ..SchedulerSettings::default()
        };
        let factory = EchoFactory::new(48_000);
        let harness = Harness::new();
        harness.render(&score, &factory, &settings);

        let sent: Vec<Vec<u8>> = factory
            .records()
            .into_iter()
            .map(|record| record.bytes)
            .collect();
        // 32 effect controls, then the surviving note traffic
        assert_eq!(sent.len(), 32 + 3);
        assert_eq!(sent[0], vec![0xB0, CONTROLLER_REVERB, 10]);
        assert_eq!(sent[1], vec![0xB0, CONTROLLER_CHORUS, 0]);
        assert_eq!(
            &sent[32..],
            &[vec![0x90, 64, 100], vec![0x80, 60, 0], vec![0x80, 64, 0]]
        );
        assert_eq!(harness.progress.played_notes(), 3);
    }

    #[test]
    fn cancellation_stops_before_the_next_event() {
        let score = load(&single_note_score_bytes());
        let factory = EchoFactory::new(48_000);
        let harness = Harness::new();
        harness.cancel.cancel();
        let (summary, samples) = harness.render(&score, &factory, &SchedulerSettings::default());

        assert_eq!(summary.outcome, SchedulerOutcome::Cancelled);
        assert!(samples.is_empty());
        assert_eq!(harness.progress.state(), SchedulerState::Cancelled);
        assert!(factory.records().is_empty());
    }

    #[test]
    fn cancelling_mid_stream_stops_at_the_current_position() {
        let score = load(&single_note_score_bytes());
        let factory = EchoFactory::new(48_000);
        let harness = Harness::new();
        // tempo and note-on sit at tick 0; cancel before the note-off is reached
        let on_event = || {
            if harness.progress.processed_events() == 2 {
                harness.cancel.cancel();
            }
        };
        let renderer = factory.create().expect("echo renderer should start");
        let (summary, samples) =
            harness.run(&score, renderer, &SchedulerSettings::default(), &on_event);

        assert_eq!(summary.outcome, SchedulerOutcome::Cancelled);
        assert_eq!(summary.events_processed, 2);
        assert!(summary.events_processed < score.total_event_count());
        assert_eq!(summary.frames_written, 0);
        assert!(samples.is_empty());
        assert_eq!(harness.progress.state(), SchedulerState::Cancelled);

        let sent: Vec<Vec<u8>> = factory
            .records()
            .into_iter()
            .map(|record| record.bytes)
            .collect();
        assert_eq!(sent, vec![vec![0x90, 60, 100]]);
    }

    #[test]
    fn pause_and_resume_leave_output_unchanged() {
        let score = load(&single_note_score_bytes());
        let settings = SchedulerSettings::default();
        let baseline = EchoFactory::new(48_000);
        let (expected, expected_samples) = Harness::new().render(&score, &baseline, &settings);

        let factory = EchoFactory::new(48_000);
        let harness = Harness::new();
        let on_event = || {
            if harness.progress.processed_events() == 2 {
                harness.pause.set_paused(true);
            }
        };

        let (summary, samples) = thread::scope(|scope| {
            scope.spawn(|| {
                while !harness.pause.is_paused() {
                    thread::sleep(Duration::from_millis(1));
                }
                thread::sleep(Duration::from_millis(20));
                assert_eq!(harness.progress.processed_events(), 2);
                harness.pause.set_paused(false);
            });
            let renderer = factory.create().expect("echo renderer should start");
            harness.run(&score, renderer, &settings, &on_event)
        });

        assert_eq!(summary, expected);
        assert_eq!(samples, expected_samples);
        let frames = |factory: &EchoFactory| -> Vec<u64> {
            factory.records().iter().map(|record| record.frame).collect()
        };
        assert_eq!(frames(&factory), frames(&baseline));
    }

    #[test]
    fn cancel_while_paused_ends_the_job() {
        let score = load(&single_note_score_bytes());
        let factory = EchoFactory::new(48_000);
        let harness = Harness::new();
        let on_event = || harness.pause.set_paused(true);

        let (summary, _) = thread::scope(|scope| {
            scope.spawn(|| {
                while !harness.pause.is_paused() {
                    thread::sleep(Duration::from_millis(1));
                }
                harness.cancel.cancel();
            });
            let renderer = factory.create().expect("echo renderer should start");
            harness.run(&score, renderer, &SchedulerSettings::default(), &on_event)
        });

        assert_eq!(summary.outcome, SchedulerOutcome::Cancelled);
        assert_eq!(summary.events_processed, 1);
        assert!(harness.pause.is_paused());
    }

    #[test]
    fn endless_release_tail_is_capped() {
        let score = load(&single_note_score_bytes());
        let settings = SchedulerSettings {
            max_tail_seconds: 0.5,
            ..SchedulerSettings::default()
        };
        let harness = Harness::new();
        let renderer = Box::new(DroneRenderer {
            session_id: Uuid::new_v4(),
        });
        let (summary, samples) = harness.run(&score, renderer, &settings, &|| {});

        assert_eq!(summary.outcome, SchedulerOutcome::Finished);
        assert_eq!(summary.timeline_frames, 1_000);
        assert_eq!(summary.frames_written - summary.timeline_frames, 500);
        assert_eq!(samples.len(), 1_500 * 2);
        assert_eq!(harness.progress.active_voices(), 1);
    }
}
