use serde::{Deserialize, Serialize};

pub const DEFAULT_PPQ: u16 = 480;
pub const DEFAULT_TEMPO_MICROS: u32 = 500_000;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeBase {
    Metrical { ppq: u16 },
    Timecode { ticks_per_second: f64 },
}

impl Default for TimeBase {
    fn default() -> Self {
        Self::Metrical { ppq: DEFAULT_PPQ }
    }
}

impl TimeBase {
    #[must_use]
    pub fn seconds_for_ticks(self, ticks: u64, tempo_micros: u32) -> f64 {
        match self {
            Self::Metrical { ppq } => ticks_to_seconds(ticks, tempo_micros, ppq),
            Self::Timecode { ticks_per_second } => {
                if ticks_per_second <= 0.0 {
                    return 0.0;
                }
                ticks as f64 / ticks_per_second
            }
        }
    }
}

#[must_use]
pub fn ticks_to_seconds(ticks: u64, tempo_micros: u32, ppq: u16) -> f64 {
    if ppq == 0 {
        return 0.0;
    }

    let beats = ticks as f64 / f64::from(ppq);
    beats * f64::from(tempo_micros) / 1_000_000.0
}

#[must_use]
pub fn bpm_to_tempo_micros(bpm: f64) -> u32 {
    if bpm <= 0.0 {
        return DEFAULT_TEMPO_MICROS;
    }

    (60_000_000.0 / bpm).round().clamp(1.0, f64::from(0x00FF_FFFF_u32)) as u32
}

#[must_use]
pub fn tempo_micros_to_bpm(tempo_micros: u32) -> f64 {
    if tempo_micros == 0 {
        return 0.0;
    }

    60_000_000.0 / f64::from(tempo_micros)
}

/// Frame index for a point in time. Truncates toward zero so a frame is only
/// counted once it has fully elapsed.
#[must_use]
pub fn seconds_to_frames(seconds: f64, sample_rate: u32) -> u64 {
    if seconds <= 0.0 {
        return 0;
    }

    (seconds * f64::from(sample_rate)).floor() as u64
}

#[must_use]
pub fn round_to_nearest(value: f64, step: f64) -> f64 {
    if step <= 0.0 {
        return value;
    }

    (value / step).round() * step
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TempoChange {
    pub tick: u64,
    pub tempo_micros: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TempoMap {
    time_base: TimeBase,
    changes: Vec<TempoChange>,
}

impl TempoMap {
    #[must_use]
    pub fn new(time_base: TimeBase, changes: Vec<TempoChange>) -> Self {
        Self {
            time_base,
            changes,
        }
    }

    #[must_use]
    pub fn changes(&self) -> &[TempoChange] {
        &self.changes
    }

    #[must_use]
    pub fn seconds_at(&self, tick: u64) -> f64 {
        let mut seconds = 0.0;
        let mut cursor = 0_u64;
        let mut tempo = DEFAULT_TEMPO_MICROS;

        for change in self.changes.iter().take_while(|change| change.tick <= tick) {
            seconds += self
                .time_base
                .seconds_for_ticks(change.tick - cursor, tempo);
            cursor = change.tick;
            tempo = change.tempo_micros;
        }

        seconds + self.time_base.seconds_for_ticks(tick - cursor, tempo)
    }
}
