use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
#[serde(default)]
pub struct LimiterSettings {
    pub force: bool,
    pub threshold: f32,
    pub ratio: f32,
    pub attack_ms: f32,
    pub release_ms: f32,
    pub lookahead_ms: f32,
}

impl Default for LimiterSettings {
    fn default() -> Self {
        Self {
            force: false,
            threshold: 0.1,
            ratio: 1_000.0,
            attack_ms: 10.0,
            release_ms: 50.0,
            lookahead_ms: 10.0,
        }
    }
}

fn smoothing_coeff(time_ms: f32, sample_rate: u32) -> f32 {
    if time_ms <= 0.0 {
        return 1.0;
    }
    (-1.0 / (time_ms * 0.001 * sample_rate as f32)).exp()
}

#[derive(Debug, Clone)]
pub struct Compressor {
    threshold: f32,
    ratio: f32,
    attack_coeff: f32,
    release_coeff: f32,
    delay: Vec<f32>,
    write_index: usize,
    read_index: usize,
    envelope: f32,
    gain: f32,
}

impl Compressor {
    #[must_use]
    pub fn new(sample_rate: u32, settings: &LimiterSettings) -> Self {
        let size = ((f64::from(settings.lookahead_ms) * f64::from(sample_rate) / 1_000.0) as usize)
            .max(1);
        Self {
            threshold: settings.threshold,
            ratio: settings.ratio,
            attack_coeff: smoothing_coeff(settings.attack_ms, sample_rate),
            release_coeff: smoothing_coeff(settings.release_ms, sample_rate),
            delay: vec![0.0; size],
            write_index: 0,
            read_index: 1 % size,
            envelope: 0.0,
            gain: 1.0,
        }
    }

    pub fn process(&mut self, input: f32) -> f32 {
        self.delay[self.write_index] = input;
        let delayed = self.delay[self.read_index];

        let rectified = input.abs();
        let coeff = if rectified > self.envelope {
            self.attack_coeff
        } else {
            self.release_coeff
        };
        self.envelope = coeff * self.envelope + (1.0 - coeff) * rectified;

        let target_gain = if self.envelope > self.threshold {
            (self.threshold + (self.envelope - self.threshold) / self.ratio) / self.envelope
        } else {
            1.0
        };

        if target_gain < self.gain {
            self.gain = target_gain;
        } else {
            self.gain = self.release_coeff * self.gain + (1.0 - self.release_coeff) * target_gain;
        }

        let size = self.delay.len();
        self.write_index = (self.write_index + 1) % size;
        self.read_index = (self.read_index + 1) % size;

        delayed * self.gain
    }

    #[must_use]
    pub fn envelope(&self) -> f32 {
        self.envelope
    }

    #[must_use]
    pub fn gain(&self) -> f32 {
        self.gain
    }

    #[must_use]
    pub fn latency(&self) -> usize {
        self.delay.len() - 1
    }
}

#[derive(Debug, Clone)]
pub struct Limiter {
    compressors: Vec<Compressor>,
}

impl Limiter {
    #[must_use]
    pub fn new(sample_rate: u32, channels: u16, settings: &LimiterSettings) -> Self {
        Self {
            compressors: (0..channels.max(1))
                .map(|_| Compressor::new(sample_rate, settings))
                .collect(),
        }
    }

    pub fn process_interleaved(&mut self, samples: &mut [f32]) {
        let channels = self.compressors.len();
        for frame in samples.chunks_mut(channels) {
            for (sample, compressor) in frame.iter_mut().zip(self.compressors.iter_mut()) {
                *sample = compressor.process(*sample);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RATE: u32 = 48_000;

    #[test]
    fn envelope_converges_within_five_time_constants() {
        let settings = LimiterSettings::default();
        let mut compressor = Compressor::new(RATE, &settings);
        // 10 ms at 48 kHz
        let time_constant = 480;

        for _ in 0..time_constant * 5 {
            compressor.process(1.0);
        }
        assert!((compressor.envelope() - 1.0).abs() < 0.02);
        assert!(compressor.gain() < 0.15);
    }

    #[test]
    fn gain_recovers_after_ten_release_times() {
        let settings = LimiterSettings::default();
        let mut compressor = Compressor::new(RATE, &settings);
        for _ in 0..RATE / 10 {
            compressor.process(1.0);
        }
        assert!(compressor.gain() < 0.5);

        // 50 ms at 48 kHz
        let release_samples = 2_400;
        for _ in 0..release_samples * 10 {
            compressor.process(0.0);
        }
        assert!(compressor.gain() > 0.99);
    }

    #[test]
    fn impulse_is_delayed_by_lookahead() {
        let settings = LimiterSettings {
            threshold: 1.0,
            ..LimiterSettings::default()
        };
        let mut compressor = Compressor::new(RATE, &settings);
        let latency = compressor.latency();
        assert_eq!(latency, 479);

        let outputs: Vec<f32> = (0..latency + 2)
            .map(|index| compressor.process(if index == 0 { 0.5 } else { 0.0 }))
            .collect();
        let peak_at = outputs
            .iter()
            .position(|sample| sample.abs() > 0.0)
            .expect("impulse should come out");
        assert_eq!(peak_at, latency);
    }

    #[test]
    fn zero_lookahead_passes_through_immediately() {
        let settings = LimiterSettings {
            threshold: 1.0,
            lookahead_ms: 0.0,
            ..LimiterSettings::default()
        };
        let mut compressor = Compressor::new(RATE, &settings);
        assert!((compressor.process(0.25) - 0.25).abs() < f32::EPSILON);
    }

    #[test]
    fn channels_are_limited_independently() {
        let mut limiter = Limiter::new(RATE, 2, &LimiterSettings::default());
        let mut samples: Vec<f32> = (0..RATE as usize).flat_map(|_| [1.0, 0.01]).collect();
        limiter.process_interleaved(&mut samples);

        let tail = &samples[samples.len() - 2..];
        assert!(tail[0] < 0.15);
        assert!((tail[1] - 0.01).abs() < 1e-4);
    }
}
