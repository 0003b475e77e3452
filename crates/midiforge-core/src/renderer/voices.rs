use std::f32::consts::FRAC_PI_2;

use tracing::trace;

use super::{RendererError, is_gm_reset, split_channel_message};
use crate::event::{
    CONTROLLER_ALL_NOTES_OFF, CONTROLLER_ALL_SOUND_OFF, CONTROLLER_EXPRESSION, CONTROLLER_PAN,
    CONTROLLER_RESET_ALL, CONTROLLER_SUSTAIN, CONTROLLER_VOLUME,
};

const NOTE_AMPLITUDE: f32 = 0.18;
const ATTACK_MS: f32 = 2.0;
const PITCH_BEND_RANGE_SEMITONES: f32 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Waveform {
    Triangle,
    Square,
}

#[derive(Debug, Clone)]
struct Voice {
    channel: u8,
    key: u8,
    amplitude: f32,
    phase: u32,
    envelope: f32,
    released: bool,
    held_by_pedal: bool,
    started: u64,
}

#[derive(Debug, Clone, Copy)]
struct ChannelState {
    volume: f32,
    expression: f32,
    pan: f32,
    sustain: bool,
    bend_semitones: f32,
}

impl Default for ChannelState {
    fn default() -> Self {
        Self {
            volume: 100.0 / 127.0,
            expression: 1.0,
            pan: 0.5,
            sustain: false,
            bend_semitones: 0.0,
        }
    }
}

#[derive(Debug)]
pub(crate) struct VoiceBank {
    sample_rate: u32,
    waveform: Waveform,
    max_voices: usize,
    master_volume: f32,
    attack_step: f32,
    release_step: f32,
    voices: Vec<Voice>,
    channels: [ChannelState; 16],
    note_counter: u64,
}

impl VoiceBank {
    pub(crate) fn new(
        sample_rate: u32,
        waveform: Waveform,
        max_voices: usize,
        release_ms: f32,
        master_volume: f32,
    ) -> Self {
        let sample_rate = sample_rate.max(1);
        Self {
            sample_rate,
            waveform,
            max_voices: max_voices.max(1),
            master_volume: master_volume.max(0.0),
            attack_step: envelope_step(ATTACK_MS, sample_rate),
            release_step: envelope_step(release_ms, sample_rate),
            voices: Vec::new(),
            channels: [ChannelState::default(); 16],
            note_counter: 0,
        }
    }

    pub(crate) fn active_voices(&self) -> usize {
        self.voices.len()
    }

    pub(crate) fn handle(&mut self, bytes: &[u8]) -> Result<(), RendererError> {
        if bytes.first() == Some(&0xF0) {
            if is_gm_reset(bytes) {
                self.reset();
            } else {
                trace!(len = bytes.len(), "ignoring system exclusive message");
            }
            return Ok(());
        }

        let (command, channel, first, second) = split_channel_message(bytes)?;
        match command {
            0x90 if second > 0 => self.note_on(channel, first, second),
            0x80 | 0x90 => self.note_off(channel, first),
            0xB0 => self.control_change(channel, first, second),
            0xE0 => {
                let raw = i32::from(first) | (i32::from(second) << 7);
                self.channels[usize::from(channel)].bend_semitones =
                    (raw - 8_192) as f32 / 8_192.0 * PITCH_BEND_RANGE_SEMITONES;
            }
            _ => {}
        }
        Ok(())
    }

    fn note_on(&mut self, channel: u8, key: u8, velocity: u8) {
        if self.voices.len() >= self.max_voices {
            if let Some(oldest) = self
                .voices
                .iter()
                .enumerate()
                .min_by_key(|(_, voice)| voice.started)
                .map(|(index, _)| index)
            {
                self.voices.swap_remove(oldest);
            }
        }

        self.note_counter += 1;
        self.voices.push(Voice {
            channel,
            key,
            amplitude: f32::from(velocity.min(127)) / 127.0 * NOTE_AMPLITUDE,
            phase: 0,
            envelope: 0.0,
            released: false,
            held_by_pedal: false,
            started: self.note_counter,
        });
    }

    fn note_off(&mut self, channel: u8, key: u8) {
        let sustain = self.channels[usize::from(channel)].sustain;
        for voice in self
            .voices
            .iter_mut()
            .filter(|voice| voice.channel == channel && voice.key == key && !voice.released)
        {
            if sustain {
                voice.held_by_pedal = true;
            } else {
                voice.released = true;
            }
        }
    }

    fn control_change(&mut self, channel: u8, controller: u8, value: u8) {
        let state = &mut self.channels[usize::from(channel)];
        let normalized = f32::from(value) / 127.0;
        match controller {
            CONTROLLER_VOLUME => state.volume = normalized,
            CONTROLLER_EXPRESSION => state.expression = normalized,
            CONTROLLER_PAN => state.pan = normalized,
            CONTROLLER_SUSTAIN => {
                state.sustain = value >= 64;
                if !state.sustain {
                    for voice in self
                        .voices
                        .iter_mut()
                        .filter(|voice| voice.channel == channel && voice.held_by_pedal)
                    {
                        voice.held_by_pedal = false;
                        voice.released = true;
                    }
                }
            }
            CONTROLLER_ALL_SOUND_OFF => self.voices.retain(|voice| voice.channel != channel),
            CONTROLLER_RESET_ALL => {
                *state = ChannelState {
                    volume: state.volume,
                    pan: state.pan,
                    ..ChannelState::default()
                };
            }
            CONTROLLER_ALL_NOTES_OFF => {
                for voice in self.voices.iter_mut().filter(|voice| voice.channel == channel) {
                    voice.released = true;
                }
            }
            _ => {}
        }
    }

    pub(crate) fn release_all(&mut self) {
        for state in &mut self.channels {
            state.sustain = false;
        }
        for voice in &mut self.voices {
            voice.held_by_pedal = false;
            voice.released = true;
        }
    }

    pub(crate) fn reset(&mut self) {
        self.voices.clear();
        self.channels = [ChannelState::default(); 16];
    }

    pub(crate) fn render(&mut self, buffer: &mut [f32], channels: usize) {
        buffer.fill(0.0);
        let channels = channels.max(1);
        let frames = buffer.len() / channels;

        for voice in &mut self.voices {
            let state = self.channels[usize::from(voice.channel)];
            let frequency =
                note_frequency_hz(voice.key) * 2_f64.powf(f64::from(state.bend_semitones) / 12.0);
            let increment = frequency_to_phase_increment(frequency, self.sample_rate);
            let gain = voice.amplitude * state.volume * state.expression * self.master_volume;
            let angle = state.pan.clamp(0.0, 1.0) * FRAC_PI_2;
            let (left_gain, right_gain) = (angle.cos(), angle.sin());

            for frame in buffer.chunks_exact_mut(channels).take(frames) {
                if voice.released {
                    voice.envelope -= self.release_step;
                    if voice.envelope <= 0.0 {
                        voice.envelope = 0.0;
                        break;
                    }
                } else if voice.envelope < 1.0 {
                    voice.envelope = (voice.envelope + self.attack_step).min(1.0);
                }

                let osc = match self.waveform {
                    Waveform::Triangle => triangle_osc(voice.phase),
                    Waveform::Square => square_osc(voice.phase),
                };
                let sample = osc * gain * voice.envelope;
                voice.phase = voice.phase.wrapping_add(increment);

                if channels == 1 {
                    frame[0] += sample;
                } else {
                    frame[0] += sample * left_gain;
                    frame[1] += sample * right_gain;
                }
            }
        }

        self.voices
            .retain(|voice| !(voice.released && voice.envelope <= 0.0));
    }
}

fn envelope_step(ms: f32, sample_rate: u32) -> f32 {
    let samples = ms.max(0.0) * 0.001 * sample_rate as f32;
    if samples < 1.0 { 1.0 } else { 1.0 / samples }
}

fn frequency_to_phase_increment(frequency_hz: f64, sample_rate: u32) -> u32 {
    let normalized = frequency_hz / f64::from(sample_rate.max(1));
    let increment = normalized * f64::from(u32::MAX);
    increment.clamp(1.0, f64::from(u32::MAX)) as u32
}

fn note_frequency_hz(key: u8) -> f64 {
    let semitone_offset = f64::from(i16::from(key) - 69);
    440.0 * 2_f64.powf(semitone_offset / 12.0)
}

fn square_osc(phase: u32) -> f32 {
    if phase < 0x8000_0000 { 1.0 } else { -1.0 }
}

fn triangle_osc(phase: u32) -> f32 {
    let phase_unit = phase as f32 / u32::MAX as f32;
    if phase_unit < 0.5 {
        (phase_unit * 4.0) - 1.0
    } else {
        3.0 - (phase_unit * 4.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bank(max_voices: usize) -> VoiceBank {
        VoiceBank::new(48_000, Waveform::Triangle, max_voices, 10.0, 1.0)
    }

    #[test]
    fn a4_maps_to_440_hz() {
        assert!((note_frequency_hz(69) - 440.0).abs() < 1e-9);
        assert!((note_frequency_hz(81) - 880.0).abs() < 1e-9);
    }

    #[test]
    fn released_voices_die_after_release_time() {
        let mut bank = bank(8);
        bank.handle(&[0x90, 60, 100]).expect("note on");
        let mut buffer = vec![0.0; 256 * 2];
        bank.render(&mut buffer, 2);
        assert_eq!(bank.active_voices(), 1);
        assert!(buffer.iter().any(|sample| sample.abs() > 0.0));

        bank.handle(&[0x80, 60, 0]).expect("note off");
        for _ in 0..4 {
            bank.render(&mut buffer, 2);
        }
        assert_eq!(bank.active_voices(), 0);
    }

    #[test]
    fn sustain_pedal_holds_released_notes() {
        let mut bank = bank(8);
        bank.handle(&[0xB0, CONTROLLER_SUSTAIN, 127]).expect("pedal down");
        bank.handle(&[0x90, 64, 100]).expect("note on");
        bank.handle(&[0x80, 64, 0]).expect("note off");

        let mut buffer = vec![0.0; 2_048];
        bank.render(&mut buffer, 2);
        assert_eq!(bank.active_voices(), 1);

        bank.handle(&[0xB0, CONTROLLER_SUSTAIN, 0]).expect("pedal up");
        bank.render(&mut buffer, 2);
        assert_eq!(bank.active_voices(), 0);
    }

    #[test]
    fn oldest_voice_is_stolen_at_the_limit() {
        let mut bank = bank(2);
        for key in [60, 62, 64] {
            bank.handle(&[0x90, key, 100]).expect("note on");
        }
        assert_eq!(bank.active_voices(), 2);
        assert!(bank.voices.iter().all(|voice| voice.key != 60));
    }

    #[test]
    fn hard_left_pan_silences_right_channel() {
        let mut bank = bank(4);
        bank.handle(&[0xB0, CONTROLLER_PAN, 0]).expect("pan");
        bank.handle(&[0x90, 69, 127]).expect("note on");
        let mut buffer = vec![0.0; 512];
        bank.render(&mut buffer, 2);

        let right_peak = buffer
            .iter()
            .skip(1)
            .step_by(2)
            .fold(0.0_f32, |peak, sample| peak.max(sample.abs()));
        assert!(right_peak < 1e-6);
    }

    #[test]
    fn malformed_bytes_are_rejected() {
        let mut bank = bank(4);
        assert!(bank.handle(&[0x90, 60]).is_err());
        assert!(bank.handle(&[0xF0, 0x43, 0xF7]).is_ok());
    }
}
