//! Notebook-style execution numbering (`In [3]:`).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Tracks which cell is running and the count each finished cell got.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionCounter {
    executing: Option<String>,
    counts: HashMap<String, u32>,
    next: u32,
}

impl Default for ExecutionCounter {
    fn default() -> Self {
        Self {
            executing: None,
            counts: HashMap::new(),
            next: 1,
        }
    }
}

impl ExecutionCounter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&mut self, cell_id: impl Into<String>) {
        self.executing = Some(cell_id.into());
    }

    /// Assign the next count to `cell_id` and return it.
    pub fn finish(&mut self, cell_id: &str) -> u32 {
        let count = self.next;
        self.executing = None;
        self.counts.insert(cell_id.to_string(), count);
        self.next += 1;
        count
    }

    /// Forget all counts; numbering restarts at 1.
    pub fn clear(&mut self) {
        self.counts.clear();
        self.next = 1;
    }

    #[must_use]
    pub fn executing(&self) -> Option<&str> {
        self.executing.as_deref()
    }

    #[must_use]
    pub fn count(&self, cell_id: &str) -> Option<u32> {
        self.counts.get(cell_id).copied()
    }

    #[must_use]
    pub const fn next_count(&self) -> u32 {
        self.next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_increase() {
        let mut counter = ExecutionCounter::new();
        counter.start("a");
        assert_eq!(counter.executing(), Some("a"));
        assert_eq!(counter.finish("a"), 1);
        assert_eq!(counter.executing(), None);

        counter.start("b");
        assert_eq!(counter.finish("b"), 2);
        counter.start("a");
        assert_eq!(counter.finish("a"), 3);

        assert_eq!(counter.count("a"), Some(3));
        assert_eq!(counter.count("b"), Some(2));
        assert_eq!(counter.next_count(), 4);
    }

    #[test]
    fn test_clear_restarts_numbering() {
        let mut counter = ExecutionCounter::new();
        counter.finish("a");
        counter.start("b");
        counter.clear();

        assert_eq!(counter.count("a"), None);
        // A running cell keeps running across a clear.
        assert_eq!(counter.executing(), Some("b"));
        assert_eq!(counter.finish("b"), 1);
    }

    #[test]
    fn test_serde_round_trip() {
        let mut counter = ExecutionCounter::new();
        counter.finish("a");
        let json = serde_json::to_string(&counter).unwrap();
        let back: ExecutionCounter = serde_json::from_str(&json).unwrap();
        assert_eq!(back, counter);
    }
}
