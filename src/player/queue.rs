use std::collections::VecDeque;

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::model::TrackHandle;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoopMode {
    #[default]
    Off,
    /// Replay the current track when it ends.
    Track,
    /// Re-append every finished track to the back of the queue.
    Queue,
}

/// Upcoming tracks of one player. The current track is not part of the queue.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Queue {
    tracks: VecDeque<TrackHandle>,
    loop_mode: LoopMode,
}

impl Queue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn push_back(&mut self, track: TrackHandle) {
        self.tracks.push_back(track);
    }

    pub fn extend(&mut self, tracks: impl IntoIterator<Item = TrackHandle>) {
        self.tracks.extend(tracks);
    }

    pub fn push_front(&mut self, track: TrackHandle) {
        self.tracks.push_front(track);
    }

    pub fn pop_front(&mut self) -> Option<TrackHandle> {
        self.tracks.pop_front()
    }

    pub fn remove(&mut self, index: usize) -> Option<TrackHandle> {
        self.tracks.remove(index)
    }

    /// Empties the queue and returns how many tracks were dropped.
    pub fn clear(&mut self) -> usize {
        let dropped = self.tracks.len();
        self.tracks.clear();
        dropped
    }

    pub fn shuffle(&mut self) {
        self.tracks.make_contiguous().shuffle(&mut rand::rng());
    }

    pub fn loop_mode(&self) -> LoopMode {
        self.loop_mode
    }

    pub fn set_loop_mode(&mut self, mode: LoopMode) {
        self.loop_mode = mode;
    }

    pub fn to_vec(&self) -> Vec<TrackHandle> {
        self.tracks.iter().cloned().collect()
    }

    pub fn replace(&mut self, tracks: Vec<TrackHandle>) {
        self.tracks = tracks.into();
    }

    /// Picks what plays after `finished`.
    ///
    /// `skipping` is set for explicit skips, which move on even in [`LoopMode::Track`].
    pub fn next(&mut self, finished: Option<TrackHandle>, skipping: bool) -> Option<TrackHandle> {
        match (self.loop_mode, finished) {
            (LoopMode::Track, Some(track)) if !skipping => Some(track),
            (LoopMode::Queue, Some(track)) => {
                self.tracks.push_back(track);
                self.tracks.pop_front()
            }
            _ => self.tracks.pop_front(),
        }
    }
}
