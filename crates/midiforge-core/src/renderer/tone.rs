use uuid::Uuid;

use super::{
    ControlKind, LoadMeter, Renderer, RendererError, SynthSettings, Telemetry, WaveFormat,
    voices::{VoiceBank, Waveform},
};

#[derive(Debug)]
pub struct ToneRenderer {
    session_id: Uuid,
    format: WaveFormat,
    bank: VoiceBank,
    meter: LoadMeter,
}

impl ToneRenderer {
    #[must_use]
    pub fn new(settings: &SynthSettings) -> Self {
        let format = WaveFormat::float_stereo(settings.sample_rate);
        Self {
            session_id: Uuid::new_v4(),
            format,
            bank: VoiceBank::new(
                format.sample_rate,
                Waveform::Triangle,
                settings.max_voices,
                settings.release_ms,
                settings.volume,
            ),
            meter: LoadMeter::new(format.sample_rate),
        }
    }
}

impl Renderer for ToneRenderer {
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
        self.bank.handle(bytes)
    }

    // no effect units
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
        self.meter
            .measure(frames, || bank.render(buffer, channels));
        buffer.len()
    }

    fn refresh_telemetry(&mut self) -> Telemetry {
        Telemetry {
            active_voices: self.bank.active_voices() as u64,
            cpu_load: self.meter.load_percent(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn end_of_stream_lets_voices_ring_out() {
        let mut renderer = ToneRenderer::new(&SynthSettings {
            release_ms: 5.0,
            ..SynthSettings::default()
        });
        renderer.send_event(&[0x90, 60, 100]).expect("note on");

        let mut buffer = vec![0.0; 512];
        assert_eq!(renderer.read_samples(&mut buffer), 512);
        assert_eq!(renderer.refresh_telemetry().active_voices, 1);

        renderer.send_end_of_stream();
        renderer.read_samples(&mut buffer);
        renderer.read_samples(&mut buffer);
        assert_eq!(renderer.refresh_telemetry().active_voices, 0);
        assert!(buffer.iter().all(|sample| *sample == 0.0));
    }
}
