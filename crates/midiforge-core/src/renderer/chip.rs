use uuid::Uuid;

use super::{
    ControlKind, LoadMeter, Renderer, RendererError, SynthSettings, Telemetry, WaveFormat,
    voices::{VoiceBank, Waveform},
};

#[derive(Debug)]
pub struct ChipRenderer {
    session_id: Uuid,
    format: WaveFormat,
    bank: VoiceBank,
    meter: LoadMeter,
}

impl ChipRenderer {
    #[must_use]
    pub fn new(settings: &SynthSettings) -> Self {
        let format = WaveFormat::int16_stereo(settings.sample_rate);
        Self {
            session_id: Uuid::new_v4(),
            format,
            bank: VoiceBank::new(
                format.sample_rate,
                Waveform::Square,
                settings.max_voices,
                settings.release_ms,
                settings.volume,
            ),
            meter: LoadMeter::new(format.sample_rate),
        }
    }
}

fn quantize_i16(sample: f32) -> f32 {
    let scale = f32::from(i16::MAX);
    (sample.clamp(-1.0, 1.0) * scale).round() / scale
}

impl Renderer for ChipRenderer {
    fn session_id(&self) -> Uuid {
        self.session_id
    }

    fn wave_format(&self) -> WaveFormat {
        self.format
    }

    fn native_float(&self) -> bool {
        false
    }

    fn send_event(&mut self, bytes: &[u8]) -> Result<(), RendererError> {
        self.bank.handle(bytes)
    }

    fn send_control(&mut self, _channel: u8, _kind: ControlKind, _value: u8) {}

    fn system_reset(&mut self) {
        self.bank.reset();
    }

    fn send_end_of_stream(&mut self) {
        self.bank.release_all();
    }

    fn read_samples(&mut self, buffer: &mut [f32]) -> usize {
        let channels = usize::from(self.format.channels);
        let frames = buffer.len() / channels;
        let bank = &mut self.bank;
        self.meter.measure(frames, || {
            bank.render(buffer, channels);
            for sample in buffer.iter_mut() {
                *sample = quantize_i16(*sample);
            }
        });
        buffer.len()
    }

    fn refresh_telemetry(&mut self) -> Telemetry {
        Telemetry {
            active_voices: self.bank.active_voices() as u64,
            cpu_load: self.meter.load_percent(),
        }
    }
}
