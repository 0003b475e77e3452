use std::{collections::HashSet, sync::Arc};

use rustysynth::{SoundFont, Synthesizer, SynthesizerSettings};
use tracing::trace;
use uuid::Uuid;

use super::{
    ControlKind, LoadMeter, MIDI_CHANNELS, Renderer, RendererError, SynthSettings, Telemetry,
    WaveFormat, is_gm_reset, split_channel_message,
};
use crate::event::{CONTROLLER_ALL_NOTES_OFF, CONTROLLER_ALL_SOUND_OFF, CONTROLLER_SUSTAIN};

const SILENCE_THRESHOLD: f32 = 1.0e-4;

pub struct SoundFontRenderer {
    session_id: Uuid,
    format: WaveFormat,
    synth: Synthesizer,
    volume: f32,
    disable_effects: bool,
    left: Vec<f32>,
    right: Vec<f32>,
    held: HashSet<(u8, u8)>,
    tail_audible: bool,
    meter: LoadMeter,
}

impl SoundFontRenderer {
    pub fn new(settings: &SynthSettings, soundfont: Arc<SoundFont>) -> Result<Self, RendererError> {
        let format = WaveFormat::float_stereo(settings.sample_rate);
        let sample_rate = i32::try_from(format.sample_rate)
            .map_err(|_| RendererError::Init(format!("sample rate out of range: {}", format.sample_rate)))?;

        let mut synth_settings = SynthesizerSettings::new(sample_rate);
        synth_settings.maximum_polyphony = settings.max_voices.clamp(8, 256);
        synth_settings.enable_reverb_and_chorus = !settings.disable_effects;

        let synth = Synthesizer::new(&soundfont, &synth_settings)
            .map_err(|error| RendererError::Init(format!("{error:?}")))?;

        Ok(Self {
            session_id: Uuid::new_v4(),
            format,
            synth,
            volume: settings.volume.max(0.0),
            disable_effects: settings.disable_effects,
            left: Vec::new(),
            right: Vec::new(),
            held: HashSet::new(),
            tail_audible: false,
            meter: LoadMeter::new(format.sample_rate),
        })
    }

    fn send(&mut self, command: u8, channel: u8, first: u8, second: u8) {
        self.synth.process_midi_message(
            i32::from(channel),
            i32::from(command),
            i32::from(first),
            i32::from(second),
        );
    }
}

impl Renderer for SoundFontRenderer {
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
        if bytes.first() == Some(&0xF0) {
            if is_gm_reset(bytes) {
                self.system_reset();
            } else {
                trace!(len = bytes.len(), "ignoring system exclusive message");
            }
            return Ok(());
        }

        let (command, channel, first, second) = split_channel_message(bytes)?;
        match command {
            0x90 if second > 0 => {
                self.held.insert((channel, first));
            }
            0x80 | 0x90 => {
                self.held.remove(&(channel, first));
            }
            0xB0 if matches!(first, CONTROLLER_ALL_NOTES_OFF | CONTROLLER_ALL_SOUND_OFF) => {
                self.held.retain(|(held_channel, _)| *held_channel != channel);
            }
            _ => {}
        }
        self.send(command, channel, first, second);
        Ok(())
    }

    fn send_control(&mut self, channel: u8, kind: ControlKind, value: u8) {
        if self.disable_effects || channel >= MIDI_CHANNELS {
            return;
        }
        self.send(0xB0, channel, kind.controller(), value.min(0x7F));
    }

    fn system_reset(&mut self) {
        self.synth.reset();
        self.held.clear();
    }

    fn send_end_of_stream(&mut self) {
        for channel in 0..MIDI_CHANNELS {
            self.send(0xB0, channel, CONTROLLER_SUSTAIN, 0);
            self.send(0xB0, channel, CONTROLLER_ALL_NOTES_OFF, 0);
        }
        self.synth.note_off_all(false);
        self.held.clear();
    }

    fn read_samples(&mut self, buffer: &mut [f32]) -> usize {
        let frames = buffer.len() / usize::from(self.format.channels);
        self.left.resize(frames, 0.0);
        self.right.resize(frames, 0.0);

        let (synth, left, right) = (&mut self.synth, &mut self.left, &mut self.right);
        self.meter.measure(frames, || synth.render(left, right));

        let mut peak = 0.0_f32;
        for (frame, (left, right)) in buffer
            .chunks_exact_mut(2)
            .zip(self.left.iter().zip(self.right.iter()))
        {
            frame[0] = left * self.volume;
            frame[1] = right * self.volume;
            peak = peak.max(frame[0].abs()).max(frame[1].abs());
        }
        self.tail_audible = peak > SILENCE_THRESHOLD;
        frames * 2
    }

    fn refresh_telemetry(&mut self) -> Telemetry {
        let active = if self.held.is_empty() {
            u64::from(self.tail_audible)
        } else {
            self.held.len() as u64
        };
        Telemetry {
            active_voices: active,
            cpu_load: self.meter.load_percent(),
        }
    }
}
