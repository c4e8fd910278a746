use std::collections::VecDeque;

use crate::metric::MetricPoint;

/// Bounded FIFO of points waiting for delivery.
///
/// When full, the oldest point is dropped to admit the newest. Every point
/// that ever left the front (acknowledged or dropped) advances `head`, so a
/// batch taken at `head = n` can be acknowledged correctly even if drops
/// happened while it was being written.
#[derive(Debug)]
pub struct OutboundBuffer {
    points: VecDeque<MetricPoint>,
    capacity: usize,
    head: u64,
    dropped: u64,
}

impl OutboundBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            points: VecDeque::with_capacity(capacity.min(4096)),
            capacity,
            head: 0,
            dropped: 0,
        }
    }

    /// Appends a point, returning the point evicted to make room, if any.
    pub fn push(&mut self, point: MetricPoint) -> Option<MetricPoint> {
        let evicted = if self.points.len() >= self.capacity {
            self.head += 1;
            self.dropped += 1;
            self.points.pop_front()
        } else {
            None
        };
        self.points.push_back(point);
        evicted
    }

    /// Position of the current front point and up to `max` points from it.
    pub fn front_batch(&self, max: usize) -> (u64, impl Iterator<Item = &MetricPoint>) {
        (self.head, self.points.iter().take(max))
    }

    /// Removes the `count` points of a batch that started at `start`.
    ///
    /// Points of that batch already dropped for capacity are skipped.
    pub fn ack(&mut self, start: u64, count: usize) {
        let end = start + count as u64;
        while self.head < end {
            if self.points.pop_front().is_none() {
                break;
            }
            self.head += 1;
        }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Points dropped for capacity since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}
