use std::collections::VecDeque;

use crate::my_types::*;

/// How many history points to keep for the debug trail
pub const MAX_DEBUG_HISTORY_SIZE: usize = 30;

/// Ring of recent whole-frame flow deltas, oldest first.
#[derive(Debug, Default)]
pub struct DebugHistory {
    deltas: VecDeque<Vector2d>,
}

impl DebugHistory {
    pub fn new() -> Self {
        Self {
            deltas: VecDeque::with_capacity(MAX_DEBUG_HISTORY_SIZE),
        }
    }

    pub fn push(&mut self, delta: Vector2d) {
        self.deltas.push_back(delta);
        while self.deltas.len() > MAX_DEBUG_HISTORY_SIZE {
            self.deltas.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.deltas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Vector2d> {
        self.deltas.iter()
    }

    /// Positions reached by walking the deltas from `start`, `start` included
    pub fn trail(&self, start: Vector2d) -> Vec<Vector2d> {
        let mut points = Vec::with_capacity(self.deltas.len() + 1);
        points.push(start);
        let mut p = start;
        for d in &self.deltas {
            p += d;
            points.push(p);
        }
        points
    }

    pub fn clear(&mut self) {
        self.deltas.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounded_fifo() {
        let mut history = DebugHistory::new();
        for i in 0..1000 {
            history.push(Vector2d::new(i as f64, 0.));
            assert!(history.len() <= MAX_DEBUG_HISTORY_SIZE);
        }
        assert_eq!(history.len(), MAX_DEBUG_HISTORY_SIZE);
        assert_eq!(history.iter().next().unwrap().x, 970.);
    }

    #[test]
    fn test_trail() {
        let mut history = DebugHistory::new();
        history.push(Vector2d::new(1., 0.));
        history.push(Vector2d::new(0., 2.));
        let trail = history.trail(Vector2d::new(10., 10.));
        assert_eq!(
            trail,
            vec![
                Vector2d::new(10., 10.),
                Vector2d::new(11., 10.),
                Vector2d::new(11., 12.)
            ]
        );
    }
}
