use midly::{MetaMessage, MidiMessage, TrackEventKind};
use serde::{Deserialize, Serialize};

pub const CONTROLLER_VOLUME: u8 = 0x07;
pub const CONTROLLER_PAN: u8 = 0x0A;
pub const CONTROLLER_EXPRESSION: u8 = 0x0B;
pub const CONTROLLER_SUSTAIN: u8 = 0x40;
pub const CONTROLLER_REVERB: u8 = 0x5B;
pub const CONTROLLER_CHORUS: u8 = 0x5D;
pub const CONTROLLER_ALL_SOUND_OFF: u8 = 0x78;
pub const CONTROLLER_RESET_ALL: u8 = 0x79;
pub const CONTROLLER_ALL_NOTES_OFF: u8 = 0x7B;

const META_STATUS: u8 = 0xFF;
const META_TEMPO: u8 = 0x51;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    NoteOn,
    NoteOff,
    Aftertouch,
    ControlChange,
    ProgramChange,
    ChannelPressure,
    PitchBend,
    SysEx,
    Tempo,
    Meta,
    Other,
}

impl EventKind {
    /// Events that change shared synth or timing state and must be replayed
    /// into every other track when a single track is rendered on its own.
    #[must_use]
    pub const fn is_cross_track(self) -> bool {
        matches!(
            self,
            Self::Tempo
                | Self::ControlChange
                | Self::ProgramChange
                | Self::ChannelPressure
                | Self::SysEx
                | Self::Aftertouch
        )
    }

    #[must_use]
    pub const fn is_dispatchable(self) -> bool {
        !matches!(self, Self::Tempo | Self::Meta | Self::Other)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Payload {
    Short { bytes: [u8; 3], len: u8 },
    Long(Box<[u8]>),
}

impl Payload {
    fn from_slice(bytes: &[u8]) -> Self {
        if bytes.len() <= 3 {
            let mut short = [0_u8; 3];
            short[..bytes.len()].copy_from_slice(bytes);
            Self::Short {
                bytes: short,
                len: bytes.len() as u8,
            }
        } else {
            Self::Long(bytes.into())
        }
    }

    fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Short { bytes, len } => &bytes[..usize::from(*len)],
            Self::Long(bytes) => bytes,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub delta: u64,
    pub kind: EventKind,
    pub channel: u8,
    payload: Payload,
}

impl Event {
    #[must_use]
    pub fn new(delta: u64, kind: EventKind, channel: u8, bytes: &[u8]) -> Self {
        Self {
            delta,
            kind,
            channel: channel & 0x0F,
            payload: Payload::from_slice(bytes),
        }
    }

    #[must_use]
    pub fn note_on(delta: u64, channel: u8, key: u8, velocity: u8) -> Self {
        if velocity == 0 {
            return Self::note_off(delta, channel, key);
        }
        Self::new(
            delta,
            EventKind::NoteOn,
            channel,
            &[0x90 | (channel & 0x0F), key & 0x7F, velocity & 0x7F],
        )
    }

    #[must_use]
    pub fn note_off(delta: u64, channel: u8, key: u8) -> Self {
        Self::new(
            delta,
            EventKind::NoteOff,
            channel,
            &[0x80 | (channel & 0x0F), key & 0x7F, 0],
        )
    }

    #[must_use]
    pub fn control_change(delta: u64, channel: u8, controller: u8, value: u8) -> Self {
        Self::new(
            delta,
            EventKind::ControlChange,
            channel,
            &[0xB0 | (channel & 0x0F), controller & 0x7F, value & 0x7F],
        )
    }

    #[must_use]
    pub fn program_change(delta: u64, channel: u8, program: u8) -> Self {
        Self::new(
            delta,
            EventKind::ProgramChange,
            channel,
            &[0xC0 | (channel & 0x0F), program & 0x7F],
        )
    }

    #[must_use]
    pub fn tempo(delta: u64, tempo_micros: u32) -> Self {
        let [_, high, mid, low] = tempo_micros.min(0x00FF_FFFF).to_be_bytes();
        Self::new(delta, EventKind::Tempo, 0, &[high, mid, low])
    }

    #[must_use]
    pub fn meta(delta: u64, meta_type: u8) -> Self {
        Self::new(delta, EventKind::Meta, 0, &[META_STATUS, meta_type])
    }

    #[must_use]
    pub fn from_midly(delta: u64, kind: &TrackEventKind<'_>) -> Self {
        match kind {
            TrackEventKind::Midi { channel, message } => {
                let channel = channel.as_int();
                let status = |high: u8| high | channel;
                match *message {
                    MidiMessage::NoteOn { key, vel } => {
                        Self::note_on(delta, channel, key.as_int(), vel.as_int())
                    }
                    MidiMessage::NoteOff { key, vel } => Self::new(
                        delta,
                        EventKind::NoteOff,
                        channel,
                        &[status(0x80), key.as_int(), vel.as_int()],
                    ),
                    MidiMessage::Aftertouch { key, vel } => Self::new(
                        delta,
                        EventKind::Aftertouch,
                        channel,
                        &[status(0xA0), key.as_int(), vel.as_int()],
                    ),
                    MidiMessage::Controller { controller, value } => {
                        Self::control_change(delta, channel, controller.as_int(), value.as_int())
                    }
                    MidiMessage::ProgramChange { program } => {
                        Self::program_change(delta, channel, program.as_int())
                    }
                    MidiMessage::ChannelAftertouch { vel } => Self::new(
                        delta,
                        EventKind::ChannelPressure,
                        channel,
                        &[status(0xD0), vel.as_int()],
                    ),
                    MidiMessage::PitchBend { bend } => {
                        let raw = bend.0.as_int();
                        Self::new(
                            delta,
                            EventKind::PitchBend,
                            channel,
                            &[status(0xE0), (raw & 0x7F) as u8, ((raw >> 7) & 0x7F) as u8],
                        )
                    }
                }
            }
            TrackEventKind::SysEx(data) => {
                let mut bytes = Vec::with_capacity(data.len() + 1);
                bytes.push(0xF0);
                bytes.extend_from_slice(data);
                Self::new(delta, EventKind::SysEx, 0, &bytes)
            }
            TrackEventKind::Escape(data) => Self::new(delta, EventKind::Other, 0, data),
            TrackEventKind::Meta(MetaMessage::Tempo(tempo)) => Self::tempo(delta, tempo.as_int()),
            TrackEventKind::Meta(message) => Self::meta(delta, meta_type(message)),
        }
    }

    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        self.payload.as_bytes()
    }

    #[must_use]
    pub fn is_cross_track(&self) -> bool {
        self.kind.is_cross_track()
    }

    #[must_use]
    pub fn tempo_micros(&self) -> Option<u32> {
        if self.kind != EventKind::Tempo {
            return None;
        }
        match self.bytes() {
            [high, mid, low] => Some(u32::from_be_bytes([0, *high, *mid, *low])),
            _ => None,
        }
    }

    #[must_use]
    pub fn key(&self) -> Option<u8> {
        match self.kind {
            EventKind::NoteOn | EventKind::NoteOff | EventKind::Aftertouch => {
                self.bytes().get(1).copied()
            }
            _ => None,
        }
    }

    #[must_use]
    pub fn velocity(&self) -> Option<u8> {
        match self.kind {
            EventKind::NoteOn | EventKind::NoteOff => self.bytes().get(2).copied(),
            _ => None,
        }
    }

    #[must_use]
    pub fn controller(&self) -> Option<u8> {
        match self.kind {
            EventKind::ControlChange => self.bytes().get(1).copied(),
            _ => None,
        }
    }
}

fn meta_type(message: &MetaMessage<'_>) -> u8 {
    match message {
        MetaMessage::TrackNumber(_) => 0x00,
        MetaMessage::Text(_) => 0x01,
        MetaMessage::Copyright(_) => 0x02,
        MetaMessage::TrackName(_) => 0x03,
        MetaMessage::InstrumentName(_) => 0x04,
        MetaMessage::Lyric(_) => 0x05,
        MetaMessage::Marker(_) => 0x06,
        MetaMessage::CuePoint(_) => 0x07,
        MetaMessage::ProgramName(_) => 0x08,
        MetaMessage::DeviceName(_) => 0x09,
        MetaMessage::MidiChannel(_) => 0x20,
        MetaMessage::MidiPort(_) => 0x21,
        MetaMessage::EndOfTrack => 0x2F,
        MetaMessage::Tempo(_) => META_TEMPO,
        MetaMessage::SmpteOffset(_) => 0x54,
        MetaMessage::TimeSignature(..) => 0x58,
        MetaMessage::KeySignature(..) => 0x59,
        MetaMessage::SequencerSpecific(_) => 0x7F,
        MetaMessage::Unknown(kind, _) => *kind,
    }
}
