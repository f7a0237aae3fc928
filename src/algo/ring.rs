use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Fixed-capacity FIFO window. Pushing at capacity evicts the oldest entry.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct RingBuffer<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> RingBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a value, returning the evicted oldest value if the window was full.
    pub fn push(&mut self, value: T) -> Option<T> {
        let evicted = if self.items.len() >= self.capacity {
            self.items.pop_front()
        } else {
            None
        };
        self.items.push_back(value);
        evicted
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.items.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    pub fn newest(&self) -> Option<&T> {
        self.items.back()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}

impl<T: Clone> RingBuffer<T> {
    pub fn to_vec(&self) -> Vec<T> {
        self.items.iter().cloned().collect()
    }

    /// Rebuild from values ordered oldest first; only the newest `capacity` survive.
    pub fn from_values(capacity: usize, values: &[T]) -> Self {
        let mut ring = Self::new(capacity);
        for v in values {
            ring.push(v.clone());
        }
        ring
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_eviction() {
        let mut ring = RingBuffer::new(3);
        assert_eq!(ring.push(1), None);
        assert_eq!(ring.push(2), None);
        assert_eq!(ring.push(3), None);
        assert!(ring.is_full());
        assert_eq!(ring.push(4), Some(1));
        assert_eq!(ring.push(5), Some(2));
        assert_eq!(ring.to_vec(), vec![3, 4, 5]);
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.newest(), Some(&5));
    }

    #[test]
    fn test_never_exceeds_capacity() {
        let mut ring = RingBuffer::new(10);
        for i in 0..1_000 {
            ring.push(i);
            assert!(ring.len() <= 10);
        }
        assert_eq!(ring.iter().copied().min(), Some(990));
    }

    #[test]
    fn test_from_values_keeps_newest() {
        let ring = RingBuffer::from_values(2, &[1.0, 2.0, 3.0]);
        assert_eq!(ring.to_vec(), vec![2.0, 3.0]);
    }
}
