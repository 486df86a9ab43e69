use std::collections::VecDeque;

use crate::my_types::Timestamp;

/// How many frames of packed flow deltas are kept for the flow consumer
pub const MAX_FRAME_HISTORY_SIZE: usize = 200;

#[derive(Clone, Debug, PartialEq)]
pub struct TimestampedDeltas {
    pub timestamp: Timestamp,
    pub deltas: Vec<u8>,
}

/// Bounded FIFO of per-frame packed deltas, drained by timestamp cutoff.
/// Entries arrive in non-decreasing timestamp order.
#[derive(Debug)]
pub struct FlowHistoryBuffer {
    entries: VecDeque<TimestampedDeltas>,
    capacity: usize,
}

impl Default for FlowHistoryBuffer {
    fn default() -> Self {
        Self::new(MAX_FRAME_HISTORY_SIZE)
    }
}

impl FlowHistoryBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn record(&mut self, timestamp: Timestamp, deltas: Vec<u8>) {
        self.entries.push_back(TimestampedDeltas { timestamp, deltas });
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
    }

    /// Remove and return, oldest first, every entry at or before `cutoff`
    pub fn poll(&mut self, cutoff: Timestamp) -> Vec<TimestampedDeltas> {
        let count = self
            .entries
            .iter()
            .take_while(|e| e.timestamp <= cutoff)
            .count();
        self.entries.drain(..count).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn timestamps(&self) -> Vec<Timestamp> {
        self.entries.iter().map(|e| e.timestamp).collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poll_cutoff() {
        let mut buffer = FlowHistoryBuffer::default();
        for t in [100, 500, 900, 1200] {
            buffer.record(t, vec![t as u8]);
        }
        let polled = buffer.poll(1000);
        assert_eq!(
            polled.iter().map(|e| e.timestamp).collect::<Vec<_>>(),
            vec![100, 500, 900]
        );
        assert_eq!(buffer.timestamps(), vec![1200]);
        assert!(buffer.poll(1000).is_empty());
        assert_eq!(buffer.poll(1200).len(), 1);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_bounded() {
        let mut buffer = FlowHistoryBuffer::default();
        for t in 0..1000u64 {
            buffer.record(t, vec![]);
            assert!(buffer.len() <= MAX_FRAME_HISTORY_SIZE);
        }
        assert_eq!(buffer.len(), MAX_FRAME_HISTORY_SIZE);
        // oldest were evicted
        assert_eq!(buffer.timestamps()[0], 800);
        let polled = buffer.poll(850);
        assert!(polled.iter().all(|e| e.timestamp <= 850));
        assert_eq!(polled.len(), 51);
    }
}
