use std::{cmp::Reverse, collections::BinaryHeap, sync::Arc};

use serde::{Deserialize, Serialize};

use crate::{
    event::Event,
    score::ScoreData,
    time::{DEFAULT_TEMPO_MICROS, TimeBase},
};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    WholeFile,
    Track(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SlotId(u32);

#[derive(Debug, Default)]
pub struct EventPool {
    slots: Vec<Option<Event>>,
    free: Vec<SlotId>,
}

impl EventPool {
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            free: Vec::new(),
        }
    }

    pub fn insert(&mut self, event: Event) -> SlotId {
        if let Some(slot) = self.free.pop() {
            self.slots[slot.0 as usize] = Some(event);
            return slot;
        }
        self.slots.push(Some(event));
        SlotId((self.slots.len() - 1) as u32)
    }

    pub fn take(&mut self, slot: SlotId) -> Option<Event> {
        let event = self.slots.get_mut(slot.0 as usize)?.take()?;
        self.free.push(slot);
        Some(event)
    }

    #[must_use]
    pub fn in_use(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}

#[derive(Debug, Clone, Copy)]
enum StreamSource {
    Raw(usize),
    Meta(usize),
}

#[derive(Debug)]
struct StreamCursor {
    source: StreamSource,
    stream: usize,
    position: usize,
    tick: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TimedEvent {
    pub delta_seconds: f64,
    pub tick: u64,
    pub stream: usize,
    pub event: Event,
}

/// Single-pass k-way merge over a score's streams. Ties on the absolute tick
/// go to the lower stream index.
#[derive(Debug)]
pub struct MergedTimeline {
    data: Arc<ScoreData>,
    cursors: Vec<StreamCursor>,
    heap: BinaryHeap<Reverse<(u64, usize, usize, SlotId)>>,
    pool: EventPool,
    time_base: TimeBase,
    tempo_micros: u32,
    last_tick: u64,
}

impl MergedTimeline {
    pub(crate) fn new(data: Arc<ScoreData>, scope: Scope) -> Option<Self> {
        let track_count = data.tracks.len();
        let cursors: Vec<StreamCursor> = match scope {
            Scope::WholeFile => (0..track_count)
                .map(|index| StreamCursor::new(StreamSource::Raw(index), index))
                .collect(),
            Scope::Track(target) => {
                if target >= track_count {
                    return None;
                }
                (0..track_count)
                    .map(|index| {
                        let source = if index == target {
                            StreamSource::Raw(index)
                        } else {
                            StreamSource::Meta(index)
                        };
                        StreamCursor::new(source, index)
                    })
                    .collect()
            }
        };

        let mut timeline = Self {
            time_base: data.time_base,
            pool: EventPool::with_capacity(cursors.len()),
            heap: BinaryHeap::with_capacity(cursors.len()),
            data,
            cursors,
            tempo_micros: DEFAULT_TEMPO_MICROS,
            last_tick: 0,
        };
        for cursor in 0..timeline.cursors.len() {
            timeline.advance(cursor);
        }
        Some(timeline)
    }

    #[must_use]
    pub fn stream_count(&self) -> usize {
        self.cursors.len()
    }

    #[must_use]
    pub fn pool(&self) -> &EventPool {
        &self.pool
    }

    fn advance(&mut self, cursor_index: usize) {
        let cursor = &mut self.cursors[cursor_index];
        let stream = match cursor.source {
            StreamSource::Raw(index) => &self.data.tracks[index].events,
            StreamSource::Meta(index) => &self.data.tracks[index].meta,
        };
        let Some(event) = stream.get(cursor.position) else {
            return;
        };

        cursor.position += 1;
        cursor.tick += event.delta;
        let slot = self.pool.insert(event.clone());
        self.heap
            .push(Reverse((cursor.tick, cursor.stream, cursor_index, slot)));
    }
}

impl StreamCursor {
    fn new(source: StreamSource, stream: usize) -> Self {
        Self {
            source,
            stream,
            position: 0,
            tick: 0,
        }
    }
}

impl Iterator for MergedTimeline {
    type Item = TimedEvent;

    fn next(&mut self) -> Option<Self::Item> {
        let Reverse((tick, stream, cursor, slot)) = self.heap.pop()?;
        let event = self.pool.take(slot)?;
        self.advance(cursor);

        let delta_ticks = tick.saturating_sub(self.last_tick);
        self.last_tick = tick;
        let delta_seconds = self.time_base.seconds_for_ticks(delta_ticks, self.tempo_micros);
        if let Some(tempo_micros) = event.tempo_micros() {
            self.tempo_micros = tempo_micros;
        }

        Some(TimedEvent {
            delta_seconds,
            tick,
            stream,
            event,
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.heap.len(), None)
    }
}
