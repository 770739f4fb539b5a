use std::collections::VecDeque;

use log::debug;

use crate::protocol::IceCandidate;

/// Remote candidates that arrived before the remote description of their
/// session was applied.
///
/// The buffer is bound to one transport generation. Pushing or draining with
/// any other generation is a no-op, so candidates can never leak into a
/// later session.
#[derive(Debug, Default)]
pub struct PendingCandidates {
    generation: u64,
    queue: VecDeque<IceCandidate>,
}

impl PendingCandidates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Drops everything buffered and binds the buffer to `generation`.
    pub fn reset(&mut self, generation: u64) {
        if !self.queue.is_empty() {
            debug!(
                "Discarding {} pending candidates of generation {}",
                self.queue.len(),
                self.generation
            );
        }
        self.queue.clear();
        self.generation = generation;
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    /// Returns false (and drops the candidate) when `generation` is stale.
    pub fn push(&mut self, generation: u64, candidate: IceCandidate) -> bool {
        if generation != self.generation {
            return false;
        }
        self.queue.push_back(candidate);
        true
    }

    /// Takes every buffered candidate in arrival order.
    pub fn drain(&mut self, generation: u64) -> Vec<IceCandidate> {
        if generation != self.generation {
            return Vec::new();
        }
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
