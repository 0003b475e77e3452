use std::{
    collections::BTreeSet,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use midly::{
    Format, Header, MetaMessage, MidiMessage, Smf, Timing, TrackEvent, TrackEventKind,
    num::{u4, u7, u15, u24, u28},
};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::{
    renderer::{
        ControlKind, Renderer, RendererError, RendererFactory, Telemetry, WaveFormat,
    },
    time::bpm_to_tempo_micros,
};

pub const FIXTURE_PPQ: u16 = 480;

#[must_use]
pub fn smf_bytes(ppq: u16, tracks: Vec<Vec<TrackEvent<'static>>>) -> Vec<u8> {
    let header = Header {
        format: Format::Parallel,
        timing: Timing::Metrical(u15::from(ppq)),
    };

    let mut bytes = Vec::new();
    Smf { header, tracks }
        .write_std(&mut bytes)
        .expect("fixture midi should encode");
    bytes
}

#[must_use]
pub fn note_on(delta: u32, channel: u8, key: u8, velocity: u8) -> TrackEvent<'static> {
    midi(
        delta,
        channel,
        MidiMessage::NoteOn {
            key: u7::from(key),
            vel: u7::from(velocity),
        },
    )
}

#[must_use]
pub fn note_off(delta: u32, channel: u8, key: u8) -> TrackEvent<'static> {
    midi(
        delta,
        channel,
        MidiMessage::NoteOff {
            key: u7::from(key),
            vel: u7::from(0_u8),
        },
    )
}

#[must_use]
pub fn control_change(delta: u32, channel: u8, controller: u8, value: u8) -> TrackEvent<'static> {
    midi(
        delta,
        channel,
        MidiMessage::Controller {
            controller: u7::from(controller),
            value: u7::from(value),
        },
    )
}

#[must_use]
pub fn program_change(delta: u32, channel: u8, program: u8) -> TrackEvent<'static> {
    midi(
        delta,
        channel,
        MidiMessage::ProgramChange {
            program: u7::from(program),
        },
    )
}

#[must_use]
pub fn tempo(delta: u32, bpm: f64) -> TrackEvent<'static> {
    TrackEvent {
        delta: u28::from(delta),
        kind: TrackEventKind::Meta(MetaMessage::Tempo(u24::from(bpm_to_tempo_micros(bpm)))),
    }
}

#[must_use]
pub fn end_of_track(delta: u32) -> TrackEvent<'static> {
    TrackEvent {
        delta: u28::from(delta),
        kind: TrackEventKind::Meta(MetaMessage::EndOfTrack),
    }
}

fn midi(delta: u32, channel: u8, message: MidiMessage) -> TrackEvent<'static> {
    TrackEvent {
        delta: u28::from(delta),
        kind: TrackEventKind::Midi {
            channel: u4::from(channel.min(15)),
            message,
        },
    }
}

/// One track at 120 bpm: middle C from tick 0 to 480, end of track at 960.
#[must_use]
pub fn single_note_score_bytes() -> Vec<u8> {
    smf_bytes(
        FIXTURE_PPQ,
        vec![vec![
            tempo(0, 120.0),
            note_on(0, 0, 60, 100),
            note_off(480, 0, 60),
            end_of_track(480),
        ]],
    )
}

#[must_use]
pub fn empty_score_bytes() -> Vec<u8> {
    smf_bytes(FIXTURE_PPQ, vec![vec![end_of_track(0)]])
}

#[must_use]
pub fn silent_middle_track_score_bytes() -> Vec<u8> {
    smf_bytes(
        FIXTURE_PPQ,
        vec![
            vec![
                tempo(0, 120.0),
                note_on(0, 0, 60, 100),
                note_off(480, 0, 60),
                end_of_track(0),
            ],
            vec![control_change(0, 1, 7, 100), end_of_track(960)],
            vec![
                note_on(240, 2, 67, 90),
                note_off(480, 2, 67),
                end_of_track(0),
            ],
        ],
    )
}

#[must_use]
pub fn demo_score_bytes() -> Vec<u8> {
    let lead = [(72, 240), (74, 240), (79, 720), (81, 720)];
    let bass = [(36, 480), (36, 480), (43, 480), (41, 480)];

    let mut lead_track = vec![program_change(0, 0, 80), control_change(0, 0, 10, 40)];
    for (key, length) in lead {
        lead_track.push(note_on(0, 0, key, 112));
        lead_track.push(note_off(length, 0, key));
    }
    lead_track.push(end_of_track(0));

    let mut bass_track = vec![program_change(0, 1, 38), control_change(0, 1, 10, 88)];
    for (key, length) in bass {
        bass_track.push(note_on(0, 1, key, 100));
        bass_track.push(note_off(length, 1, key));
    }
    bass_track.push(end_of_track(0));

    smf_bytes(
        FIXTURE_PPQ,
        vec![
            vec![tempo(0, 138.0), end_of_track(0)],
            lead_track,
            bass_track,
        ],
    )
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EchoRecord {
    pub session: Uuid,
    pub frame: u64,
    pub bytes: Vec<u8>,
}

#[derive(Debug)]
pub struct EchoRenderer {
    session_id: Uuid,
    format: WaveFormat,
    frames_read: u64,
    held: BTreeSet<(u8, u8)>,
    log: Arc<Mutex<Vec<EchoRecord>>>,
}

impl EchoRenderer {
    #[must_use]
    pub fn new(sample_rate: u32, log: Arc<Mutex<Vec<EchoRecord>>>) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            format: WaveFormat::float_stereo(sample_rate),
            frames_read: 0,
            held: BTreeSet::new(),
            log,
        }
    }
}

impl Renderer for EchoRenderer {
    fn session_id(&self) -> Uuid {
        self.session_id
    }

    fn wave_format(&self) -> WaveFormat {
        self.format
    }

    fn native_float(&self) -> bool {
        true
    }

    fn send_event(&mut self, bytes: &[u8]) -> Result<(), RendererError> {
        match bytes {
            [status, key, velocity] if status & 0xF0 == 0x90 && *velocity > 0 => {
                self.held.insert((status & 0x0F, *key));
            }
            [status, key, _] if matches!(status & 0xF0, 0x80 | 0x90) => {
                self.held.remove(&(status & 0x0F, *key));
            }
            [] => return Err(RendererError::MalformedEvent(Vec::new())),
            _ => {}
        }
        self.log.lock().push(EchoRecord {
            session: self.session_id,
            frame: self.frames_read,
            bytes: bytes.to_vec(),
        });
        Ok(())
    }

    fn send_control(&mut self, channel: u8, kind: ControlKind, value: u8) {
        self.log.lock().push(EchoRecord {
            session: self.session_id,
            frame: self.frames_read,
            bytes: vec![0xB0 | (channel & 0x0F), kind.controller(), value],
        });
    }

    fn system_reset(&mut self) {
        self.held.clear();
    }

    fn send_end_of_stream(&mut self) {
        self.held.clear();
    }

    fn read_samples(&mut self, buffer: &mut [f32]) -> usize {
        let level = 0.1 * self.held.len() as f32;
        buffer.fill(level);
        self.frames_read += (buffer.len() / usize::from(self.format.channels)) as u64;
        buffer.len()
    }

    fn refresh_telemetry(&mut self) -> Telemetry {
        Telemetry {
            active_voices: self.held.len() as u64,
            cpu_load: 0.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EchoFactory {
    pub sample_rate: u32,
    pub fail_on_create: bool,
    /// 1-based `create` call that fails while the others succeed.
    pub fail_on_call: Option<usize>,
    pub calls: Arc<AtomicUsize>,
    pub log: Arc<Mutex<Vec<EchoRecord>>>,
}

impl EchoFactory {
    #[must_use]
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            fail_on_create: false,
            fail_on_call: None,
            calls: Arc::new(AtomicUsize::new(0)),
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    #[must_use]
    pub fn failing(sample_rate: u32) -> Self {
        Self {
            fail_on_create: true,
            ..Self::new(sample_rate)
        }
    }

    #[must_use]
    pub fn failing_on_call(sample_rate: u32, call: usize) -> Self {
        Self {
            fail_on_call: Some(call),
            ..Self::new(sample_rate)
        }
    }

    #[must_use]
    pub fn records(&self) -> Vec<EchoRecord> {
        self.log.lock().clone()
    }
}

impl RendererFactory for EchoFactory {
    fn wave_format(&self) -> WaveFormat {
        WaveFormat::float_stereo(self.sample_rate)
    }

    fn create(&self) -> Result<Box<dyn Renderer>, RendererError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_on_create || self.fail_on_call == Some(call) {
            return Err(RendererError::Init(format!(
                "echo renderer configured to fail on call {call}"
            )));
        }
        Ok(Box::new(EchoRenderer::new(self.sample_rate, Arc::clone(&self.log))))
    }
}
