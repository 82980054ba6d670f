//! Segmented FIFO used by every controller to buffer chunks.
//!
//! Elements live in fixed-capacity segments. Pushing allocates a new back
//! segment only when the current one is full, and shifting advances a cursor
//! through the front segment, dropping it once it is exhausted. Both are O(1)
//! amortized, independent of how many elements are queued.

use std::collections::VecDeque;

pub(crate) const SEGMENT_CAPACITY: usize = 16384;

struct Segment<T> {
    slots: Vec<Option<T>>,
    cursor: usize,
}

impl<T> Segment<T> {
    fn new() -> Self {
        Self {
            slots: Vec::with_capacity(SEGMENT_CAPACITY),
            cursor: 0,
        }
    }

    fn is_full(&self) -> bool {
        self.slots.len() == SEGMENT_CAPACITY
    }
}

pub struct ChunkedQueue<T> {
    segments: VecDeque<Segment<T>>,
    len: usize,
}

impl<T> Default for ChunkedQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ChunkedQueue<T> {
    pub fn new() -> Self {
        Self {
            segments: VecDeque::new(),
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn push(&mut self, value: T) {
        if self.segments.back().map_or(true, Segment::is_full) {
            self.segments.push_back(Segment::new());
        }
        if let Some(back) = self.segments.back_mut() {
            back.slots.push(Some(value));
        }
        self.len += 1;
    }

    /// Removes the oldest element, or `None` when the queue is empty.
    pub fn shift(&mut self) -> Option<T> {
        let has_successor = self.segments.len() > 1;
        let front = self.segments.front_mut()?;
        let value = front.slots.get_mut(front.cursor)?.take();
        front.cursor += 1;
        if front.cursor == front.slots.len() {
            // A consumed back segment that can still accept pushes is rewound.
            if front.is_full() || has_successor {
                self.segments.pop_front();
            } else {
                front.slots.clear();
                front.cursor = 0;
            }
        }
        if value.is_some() {
            self.len -= 1;
        }
        value
    }

    pub fn peek(&self) -> Option<&T> {
        let front = self.segments.front()?;
        front.slots.get(front.cursor)?.as_ref()
    }

    pub fn peek_mut(&mut self) -> Option<&mut T> {
        let front = self.segments.front_mut()?;
        front.slots.get_mut(front.cursor)?.as_mut()
    }

    /// Visits every queued element from oldest to newest.
    ///
    /// Slots that were consumed while the walk was in progress are skipped
    /// instead of ending the iteration.
    pub fn for_each(&self, mut f: impl FnMut(&T)) {
        for segment in &self.segments {
            for slot in &segment.slots[segment.cursor..] {
                if let Some(value) = slot {
                    f(value);
                }
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.segments
            .iter()
            .flat_map(|segment| segment.slots[segment.cursor..].iter().flatten())
    }

    pub fn clear(&mut self) {
        self.segments.clear();
        self.len = 0;
    }
}

impl<T> Extend<T> for ChunkedQueue<T> {
    fn extend<I: IntoIterator<Item = T>>(&mut self, iter: I) {
        for value in iter {
            self.push(value);
        }
    }
}

impl<T> FromIterator<T> for ChunkedQueue<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let mut queue = ChunkedQueue::new();
        queue.extend(iter);
        queue
    }
}
