//! Live Buffer - latest sample plus a bounded rolling window per register
//!
//! Windows are keyed by (channel name, register address). Each window is an
//! immutable snapshot behind an `ArcSwap`; a push builds the next snapshot
//! and swaps it in, so readers never block and never see a half-written
//! sample.
//!
//! A window stores full segments of `SEGMENT_LEN` samples as shared
//! `Arc<[Sample]>` plus a short open tail. Building the next snapshot copies
//! the tail and one pointer per segment, not the whole window.

use arc_swap::ArcSwap;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};

use crate::config::defaults;
use crate::types::Sample;

/// Identifies one live series.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SeriesKey {
    pub channel: Arc<str>,
    pub address: u16,
}

impl SeriesKey {
    pub fn new(channel: &str, address: u16) -> Self {
        Self {
            channel: Arc::from(channel),
            address,
        }
    }
}

const SEGMENT_LEN: usize = 64;

/// Immutable view of one series, oldest sample first.
#[derive(Debug, Clone, Default)]
pub struct LiveWindow {
    /// Full segments, oldest first
    sealed: VecDeque<Arc<[Sample]>>,
    /// Samples already evicted from the front of `sealed[0]`
    head_skip: usize,
    tail: Vec<Sample>,
    len: usize,
}

impl LiveWindow {
    pub fn latest(&self) -> Option<&Sample> {
        self.tail
            .last()
            .or_else(|| self.sealed.back().and_then(|seg| seg.last()))
    }

    pub const fn len(&self) -> usize {
        self.len
    }

    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = &Sample> {
        let skip = self.head_skip;
        self.sealed
            .iter()
            .enumerate()
            .flat_map(move |(i, seg)| seg[if i == 0 { skip } else { 0 }..].iter())
            .chain(self.tail.iter())
    }

    /// `(timestamp, value)` pairs for charting.
    pub fn points(&self) -> Vec<(chrono::DateTime<chrono::Utc>, f64)> {
        self.iter().map(|s| (s.timestamp, s.value)).collect()
    }

    fn push(&mut self, sample: Sample, capacity: usize) {
        self.tail.push(sample);
        self.len += 1;
        if self.tail.len() == SEGMENT_LEN {
            let full = std::mem::replace(&mut self.tail, Vec::with_capacity(SEGMENT_LEN));
            self.sealed.push_back(Arc::from(full));
        }
        while self.len > capacity {
            self.evict_oldest();
        }
    }

    fn evict_oldest(&mut self) {
        match self.sealed.front() {
            Some(seg) => {
                self.head_skip += 1;
                if self.head_skip == seg.len() {
                    self.sealed.pop_front();
                    self.head_skip = 0;
                }
            }
            None => {
                self.tail.remove(0);
            }
        }
        self.len -= 1;
    }
}

#[derive(Debug)]
pub struct LiveBuffer {
    capacity: usize,
    series: RwLock<HashMap<SeriesKey, Arc<ArcSwap<LiveWindow>>>>,
}

impl Default for LiveBuffer {
    fn default() -> Self {
        Self::new(defaults::LIVE_WINDOW_CAPACITY)
    }
}

impl LiveBuffer {
    /// `capacity` is clamped to at least 1.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            series: RwLock::new(HashMap::new()),
        }
    }

    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append a sample to its series, dropping the oldest point when full.
    pub fn push(&self, sample: Sample) {
        let slot = self.slot(&sample.channel, sample.address);
        let capacity = self.capacity;
        slot.rcu(|current| {
            let mut next = LiveWindow::clone(current);
            next.push(sample.clone(), capacity);
            next
        });
    }

    pub fn latest(&self, channel: &str, address: u16) -> Option<Sample> {
        self.window(channel, address)
            .and_then(|w| w.latest().cloned())
    }

    /// Current snapshot of one series.
    pub fn window(&self, channel: &str, address: u16) -> Option<Arc<LiveWindow>> {
        let series = self.series.read().unwrap_or_else(|e| e.into_inner());
        series
            .get(&SeriesKey::new(channel, address))
            .map(|slot| slot.load_full())
    }

    /// Snapshot of every series, sorted by channel then address.
    pub fn snapshot(&self) -> Vec<(SeriesKey, Arc<LiveWindow>)> {
        let series = self.series.read().unwrap_or_else(|e| e.into_inner());
        let mut all: Vec<_> = series
            .iter()
            .map(|(k, slot)| (k.clone(), slot.load_full()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    /// Drop every series of a removed channel.
    pub fn remove_channel(&self, channel: &str) -> usize {
        let mut series = self.series.write().unwrap_or_else(|e| e.into_inner());
        let before = series.len();
        series.retain(|k, _| &*k.channel != channel);
        before - series.len()
    }

    pub fn clear(&self) {
        self.series.write().unwrap_or_else(|e| e.into_inner()).clear();
    }

    fn slot(&self, channel: &Arc<str>, address: u16) -> Arc<ArcSwap<LiveWindow>> {
        let key = SeriesKey {
            channel: channel.clone(),
            address,
        };
        if let Some(slot) = self
            .series
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&key)
        {
            return slot.clone();
        }
        self.series
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(key)
            .or_insert_with(|| Arc::new(ArcSwap::from_pointee(LiveWindow::default())))
            .clone()
    }
}
