//! Bounded ring buffers for per-session log lines and recent OCPP
//! messages. Both cap at 500 entries; pushing past capacity discards
//! the oldest entry rather than growing unbounded, since these exist
//! for operator inspection, not as an audit trail.

use std::collections::VecDeque;

pub const BUFFER_CAPACITY: usize = 500;

#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> RingBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, item: T) {
        if self.items.len() == self.capacity {
            self.items.pop_front();
        }
        self.items.push_back(item);
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

    pub fn to_vec(&self) -> Vec<T>
    where
        T: Clone,
    {
        self.items.iter().cloned().collect()
    }
}

impl<T> Default for RingBuffer<T> {
    fn default() -> Self {
        Self::new(BUFFER_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discards_oldest_past_capacity() {
        let mut buf: RingBuffer<u32> = RingBuffer::new(3);
        for i in 0..5 {
            buf.push(i);
        }
        assert_eq!(buf.to_vec(), vec![2, 3, 4]);
    }
}
