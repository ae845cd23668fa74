//! Buffer-until-ready queues
//!
//! Candidates, pending streams and pending text messages all accumulate
//! while a session cannot take them and are handed out in arrival order
//! once it can.

use std::collections::VecDeque;

/// FIFO buffer drained as a whole batch
#[derive(Debug, Clone)]
pub struct FifoBuffer<T> {
    items: VecDeque<T>,
}

impl<T> Default for FifoBuffer<T> {
    fn default() -> Self {
        Self { items: VecDeque::new() }
    }
}

impl<T> FifoBuffer<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, item: T) {
        self.items.push_back(item);
    }

    /// Take everything buffered so far. Items pushed afterwards belong to
    /// the next batch.
    pub fn drain(&mut self) -> Vec<T> {
        self.items.drain(..).collect()
    }

    /// Drop everything, returning how many items were discarded
    pub fn clear(&mut self) -> usize {
        let count = self.items.len();
        self.items.clear();
        count
    }

    /// Remove the first item matching `predicate`
    pub fn remove_first(&mut self, predicate: impl Fn(&T) -> bool) -> Option<T> {
        let index = self.items.iter().position(predicate)?;
        self.items.remove(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drain_preserves_order() {
        let mut buffer = FifoBuffer::new();
        buffer.push("c1");
        buffer.push("c2");
        buffer.push("c3");
        assert_eq!(buffer.drain(), vec!["c1", "c2", "c3"]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_later_pushes_form_next_batch() {
        let mut buffer = FifoBuffer::new();
        buffer.push(1);
        buffer.push(2);
        let first = buffer.drain();
        buffer.push(3);
        assert_eq!(first, vec![1, 2]);
        assert_eq!(buffer.drain(), vec![3]);
    }

    #[test]
    fn test_clear_and_remove() {
        let mut buffer = FifoBuffer::new();
        buffer.push("a");
        buffer.push("b");
        buffer.push("a");
        assert_eq!(buffer.remove_first(|s| *s == "a"), Some("a"));
        assert_eq!(buffer.iter().copied().collect::<Vec<_>>(), vec!["b", "a"]);
        assert_eq!(buffer.clear(), 2);
        assert_eq!(buffer.len(), 0);
    }
}
