use std::{
    fs,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use midly::{EventIter, Timing};
use rayon::prelude::*;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::{
    event::{Event, EventKind},
    merge::{MergedTimeline, Scope},
    progress::CancelToken,
    time::{TempoChange, TempoMap, TimeBase},
};

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to read midi file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid midi header: {0}")]
    Header(#[from] midly::Error),
    #[error("failed to build loader thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

#[derive(Debug, Clone)]
pub struct LoadOptions {
    pub threads: usize,
    pub cancel: CancelToken,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            threads: std::thread::available_parallelism().map_or(1, usize::from),
            cancel: CancelToken::new(),
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct TrackData {
    pub events: Vec<Event>,
    pub meta: Vec<Event>,
    pub note_on_count: u64,
    pub simple_event_count: u64,
    pub meta_event_count: u64,
    pub end_tick: u64,
    pub parse_failed: bool,
    pub cut_short: bool,
}

impl TrackData {
    #[must_use]
    pub fn isolated_event_count(&self) -> u64 {
        self.simple_event_count + self.meta_event_count
    }
}

#[derive(Debug)]
pub(crate) struct ScoreData {
    pub(crate) time_base: TimeBase,
    pub(crate) tracks: Vec<TrackData>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrackSummary {
    pub index: usize,
    pub note_on_count: u64,
    pub isolated_event_count: u64,
    pub merged_event_count: u64,
    pub end_tick: u64,
    pub parse_failed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScoreSummary {
    pub id: Uuid,
    pub name: String,
    pub path: PathBuf,
    pub file_size: u64,
    pub time_base: TimeBase,
    pub duration_seconds: f64,
    pub note_count: u64,
    pub total_event_count: u64,
    pub corrupted: bool,
    pub tracks: Vec<TrackSummary>,
}

#[derive(Debug, Clone)]
pub struct Score {
    pub id: Uuid,
    pub name: String,
    pub path: PathBuf,
    pub file_size: u64,
    pub duration_seconds: f64,
    pub note_count: u64,
    pub corrupted: bool,
    isolated_counts: Vec<u64>,
    merged_counts: Vec<u64>,
    data: Arc<ScoreData>,
}

impl Score {
    pub fn load(path: &Path, options: &LoadOptions) -> Result<Self, LoadError> {
        Self::load_with_progress(path, options, &|_, _| {})
    }

    #[instrument(skip(options, progress), fields(path = %path.display()))]
    pub fn load_with_progress(
        path: &Path,
        options: &LoadOptions,
        progress: &(dyn Fn(usize, usize) + Sync),
    ) -> Result<Self, LoadError> {
        let bytes = fs::read(path).map_err(|source| LoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let name = path
            .file_name()
            .map_or_else(|| path.display().to_string(), |name| name.to_string_lossy().into_owned());

        Self::parse(name, path.to_path_buf(), &bytes, options, progress)
    }

    pub fn from_bytes(
        name: impl Into<String>,
        bytes: &[u8],
        options: &LoadOptions,
    ) -> Result<Self, LoadError> {
        let name = name.into();
        let path = PathBuf::from(&name);
        Self::parse(name, path, bytes, options, &|_, _| {})
    }

    fn parse(
        name: String,
        path: PathBuf,
        bytes: &[u8],
        options: &LoadOptions,
        progress: &(dyn Fn(usize, usize) + Sync),
    ) -> Result<Self, LoadError> {
        let (header, track_iter) = midly::parse(bytes)?;
        let time_base = match header.timing {
            Timing::Metrical(ppq) => TimeBase::Metrical { ppq: ppq.as_int() },
            Timing::Timecode(fps, subframe) => TimeBase::Timecode {
                ticks_per_second: f64::from(fps.as_f32()) * f64::from(subframe),
            },
        };

        let raw_tracks: Vec<_> = track_iter.collect();
        let total = raw_tracks.len();
        let parsed = AtomicUsize::new(0);

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(options.threads.max(1))
            .thread_name(|index| format!("midiforge-load-{index}"))
            .build()?;
        let tracks: Vec<TrackData> = pool.install(|| {
            raw_tracks
                .into_par_iter()
                .enumerate()
                .map(|(index, events)| {
                    let track = walk_track(index, events, &options.cancel);
                    let done = parsed.fetch_add(1, Ordering::Relaxed) + 1;
                    progress(done, total);
                    track
                })
                .collect()
        });

        let corrupted = tracks
            .iter()
            .any(|track| track.parse_failed || track.cut_short);
        let total_meta: u64 = tracks.iter().map(|track| track.meta_event_count).sum();
        let isolated_counts: Vec<u64> = tracks.iter().map(TrackData::isolated_event_count).collect();
        let merged_counts: Vec<u64> = tracks
            .iter()
            .map(|track| track.simple_event_count + total_meta)
            .collect();
        let note_count = tracks.iter().map(|track| track.note_on_count).sum();
        let end_tick = tracks.iter().map(|track| track.end_tick).max().unwrap_or(0);
        let duration_seconds = tempo_map(time_base, &tracks).seconds_at(end_tick);

        let score = Self {
            id: Uuid::new_v4(),
            name,
            path,
            file_size: bytes.len() as u64,
            duration_seconds,
            note_count,
            corrupted,
            isolated_counts,
            merged_counts,
            data: Arc::new(ScoreData { time_base, tracks }),
        };

        if corrupted {
            warn!(score = %score.name, "score has unreadable tracks; rendering what was parsed");
        }
        info!(
            score = %score.name,
            tracks = score.track_count(),
            notes = score.note_count,
            duration_seconds = score.duration_seconds,
            "midi file loaded"
        );
        Ok(score)
    }

    #[must_use]
    pub fn time_base(&self) -> TimeBase {
        self.data.time_base
    }

    #[must_use]
    pub fn track_count(&self) -> usize {
        self.data.tracks.len()
    }

    #[must_use]
    pub fn track(&self, index: usize) -> Option<&TrackData> {
        self.data.tracks.get(index)
    }

    #[must_use]
    pub fn track_has_notes(&self, index: usize) -> bool {
        self.track(index).is_some_and(|track| track.note_on_count > 0)
    }

    #[must_use]
    pub fn isolated_event_counts(&self) -> &[u64] {
        &self.isolated_counts
    }

    #[must_use]
    pub fn merged_event_counts(&self) -> &[u64] {
        &self.merged_counts
    }

    #[must_use]
    pub fn total_event_count(&self) -> u64 {
        self.isolated_counts.iter().sum()
    }

    #[must_use]
    pub fn total_merged_event_count(&self) -> u64 {
        self.merged_counts.iter().sum()
    }

    #[must_use]
    pub fn event_count(&self, scope: Scope) -> u64 {
        match scope {
            Scope::WholeFile => self.total_event_count(),
            Scope::Track(index) => self.merged_counts.get(index).copied().unwrap_or(0),
        }
    }

    #[must_use]
    pub fn timeline(&self, scope: Scope) -> Option<MergedTimeline> {
        MergedTimeline::new(Arc::clone(&self.data), scope)
    }

    #[must_use]
    pub fn stem(&self) -> String {
        Path::new(&self.name)
            .file_stem()
            .map_or_else(|| self.name.clone(), |stem| stem.to_string_lossy().into_owned())
    }

    #[must_use]
    pub fn summary(&self) -> ScoreSummary {
        ScoreSummary {
            id: self.id,
            name: self.name.clone(),
            path: self.path.clone(),
            file_size: self.file_size,
            time_base: self.time_base(),
            duration_seconds: self.duration_seconds,
            note_count: self.note_count,
            total_event_count: self.total_event_count(),
            corrupted: self.corrupted,
            tracks: self
                .data
                .tracks
                .iter()
                .enumerate()
                .map(|(index, track)| TrackSummary {
                    index,
                    note_on_count: track.note_on_count,
                    isolated_event_count: track.isolated_event_count(),
                    merged_event_count: self.merged_counts[index],
                    end_tick: track.end_tick,
                    parse_failed: track.parse_failed,
                })
                .collect(),
        }
    }
}

fn walk_track(
    index: usize,
    events: Result<EventIter<'_>, midly::Error>,
    cancel: &CancelToken,
) -> TrackData {
    let mut track = TrackData::default();
    let events = match events {
        Ok(events) => events,
        Err(error) => {
            warn!(track = index, %error, "track chunk is unreadable");
            track.parse_failed = true;
            return track;
        }
    };

    let mut pending_delta = 0_u64;
    for event in events {
        if cancel.is_cancelled() {
            track.cut_short = true;
            break;
        }

        let event = match event {
            Ok(event) => event,
            Err(error) => {
                warn!(track = index, parsed = track.events.len(), %error, "track parse stopped early");
                track.parse_failed = true;
                break;
            }
        };

        let delta = u64::from(event.delta.as_int());
        let converted = Event::from_midly(delta, &event.kind);
        track.end_tick += delta;
        pending_delta += delta;

        if converted.is_cross_track() {
            let mut meta = converted.clone();
            meta.delta = pending_delta;
            pending_delta = 0;
            track.meta.push(meta);
            track.meta_event_count += 1;
        } else {
            track.simple_event_count += 1;
            if converted.kind == EventKind::NoteOn {
                track.note_on_count += 1;
            }
        }
        track.events.push(converted);
    }

    debug!(
        track = index,
        events = track.events.len(),
        meta = track.meta_event_count,
        notes = track.note_on_count,
        "track parsed"
    );
    track
}

fn tempo_map(time_base: TimeBase, tracks: &[TrackData]) -> TempoMap {
    let mut changes: Vec<(u64, usize, u32)> = Vec::new();
    for (index, track) in tracks.iter().enumerate() {
        let mut tick = 0_u64;
        for event in &track.meta {
            tick += event.delta;
            if let Some(tempo_micros) = event.tempo_micros() {
                changes.push((tick, index, tempo_micros));
            }
        }
    }
    changes.sort_by_key(|(tick, index, _)| (*tick, *index));

    TempoMap::new(
        time_base,
        changes
            .into_iter()
            .map(|(tick, _, tempo_micros)| TempoChange { tick, tempo_micros })
            .collect(),
    )
}
