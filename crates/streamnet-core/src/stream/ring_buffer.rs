//! Fixed-capacity ring buffer backing a stream.
//!
//! The buffer itself is not synchronized: a [`Stream`](super::Stream) keeps it
//! behind its mutex and pairs it with the not-empty and not-full condition
//! variables.
//!
//! ## Design
//!
//! - Capacity fixed at creation, any value `>= 1` (no power-of-two rounding)
//! - `head` indexes the oldest item, `tail` the next free slot
//! - `len` disambiguates the full and empty states where `head == tail`

/// A bounded FIFO of `T` with runtime capacity.
pub struct RingBuffer<T> {
    /// Slot storage. `None` marks a free slot.
    slots: Box<[Option<T>]>,

    /// Index of the oldest item.
    head: usize,

    /// Index of the next slot to write.
    tail: usize,

    /// Number of stored items.
    len: usize,
}

impl<T> RingBuffer<T> {
    /// Creates an empty ring buffer holding at most `capacity` items.
    ///
    /// A capacity of `0` is raised to `1`.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let slots = (0..capacity).map(|_| None).collect::<Vec<_>>();
        Self {
            slots: slots.into_boxed_slice(),
            head: 0,
            tail: 0,
            len: 0,
        }
    }

    /// Returns the maximum number of items.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Returns the number of stored items.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if no items are stored.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns true if the buffer is at capacity.
    #[inline]
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.len == self.slots.len()
    }

    /// Appends an item at the tail.
    ///
    /// # Errors
    ///
    /// Returns the item back if the buffer is full.
    pub fn push(&mut self, item: T) -> Result<(), T> {
        if self.is_full() {
            return Err(item);
        }
        self.slots[self.tail] = Some(item);
        self.tail = (self.tail + 1) % self.slots.len();
        self.len += 1;
        Ok(())
    }

    /// Removes the item at the head.
    pub fn pop(&mut self) -> Option<T> {
        if self.is_empty() {
            return None;
        }
        let item = self.slots[self.head].take();
        self.head = (self.head + 1) % self.slots.len();
        self.len -= 1;
        item
    }

    /// Returns the item at the head without removing it.
    #[must_use]
    pub fn peek(&self) -> Option<&T> {
        if self.is_empty() {
            None
        } else {
            self.slots[self.head].as_ref()
        }
    }

    /// Drops every stored item.
    pub fn clear(&mut self) {
        while self.pop().is_some() {}
        self.head = 0;
        self.tail = 0;
    }
}

impl<T> std::fmt::Debug for RingBuffer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("capacity", &self.capacity())
            .field("len", &self.len)
            .field("head", &self.head)
            .field("tail", &self.tail)
            .finish()
    }
}
