//! Stream sets: the read descriptors owned by one consumer.
//!
//! A set owns its [`StreamReader`]s and one [`PollSlot`]. Only the owning
//! entity polls, adds, removes or replaces members, so the set itself needs
//! no synchronization; the slot is shared with writers only through poll
//! registrations.

use std::sync::Arc;

use smallvec::SmallVec;

use super::{DescId, PollSlot, StreamReader};
use crate::error::fatal;

/// An unordered collection of read descriptors with wait-for-any polling.
pub struct StreamSet<T> {
    members: SmallVec<[StreamReader<T>; 4]>,
    slot: Arc<PollSlot>,
}

impl<T> Default for StreamSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> StreamSet<T> {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self {
            members: SmallVec::new(),
            slot: Arc::new(PollSlot::default()),
        }
    }

    /// Adds a reader. It is visited after all current members.
    pub fn put(&mut self, reader: StreamReader<T>) {
        self.members.push(reader);
    }

    /// Removes the reader with the given id.
    pub fn remove(&mut self, id: DescId) -> Option<StreamReader<T>> {
        let idx = self.position(id)?;
        Some(self.members.remove(idx))
    }

    /// Removes the reader at `idx`, keeping the order of the others.
    ///
    /// # Panics
    ///
    /// If `idx` is out of bounds.
    pub fn remove_at(&mut self, idx: usize) -> StreamReader<T> {
        self.members.remove(idx)
    }

    /// Returns the reader with the given id.
    #[must_use]
    pub fn get(&self, id: DescId) -> Option<&StreamReader<T>> {
        self.members.iter().find(|r| r.id() == id)
    }

    /// Returns the reader with the given id, mutably.
    pub fn get_mut(&mut self, id: DescId) -> Option<&mut StreamReader<T>> {
        self.members.iter_mut().find(|r| r.id() == id)
    }

    /// Returns the reader at `idx`.
    #[must_use]
    pub fn get_at(&self, idx: usize) -> Option<&StreamReader<T>> {
        self.members.get(idx)
    }

    /// Returns the reader at `idx`, mutably.
    pub fn get_at_mut(&mut self, idx: usize) -> Option<&mut StreamReader<T>> {
        self.members.get_mut(idx)
    }

    /// Returns the position of the reader with the given id.
    #[must_use]
    pub fn position(&self, id: DescId) -> Option<usize> {
        self.members.iter().position(|r| r.id() == id)
    }

    /// Returns true if a reader with the given id is a member.
    #[must_use]
    pub fn contains(&self, id: DescId) -> bool {
        self.position(id).is_some()
    }

    /// Returns the number of members.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Returns true if the set has no members.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Iterates over the members.
    pub fn iter(&self) -> impl Iterator<Item = &StreamReader<T>> {
        self.members.iter()
    }

    /// Moves every member of `other` into this set.
    pub fn append(&mut self, other: &mut Self) {
        self.members.extend(other.members.drain(..));
    }

    /// Removes and returns every member.
    pub fn drain(&mut self) -> impl Iterator<Item = StreamReader<T>> + '_ {
        self.members.drain(..)
    }

    /// Blocks until some member is non-empty and returns its id.
    ///
    /// # Panics
    ///
    /// Polling an empty set would block forever and is a fatal violation.
    pub fn poll(&self) -> DescId {
        if self.members.is_empty() {
            fatal("poll on an empty stream set");
        }

        if let Some(reader) = self.members.iter().find(|r| !r.is_empty()) {
            return reader.id();
        }

        *self.slot.wakeup.lock() = None;

        let mut ready = None;
        for reader in &self.members {
            let mut state = reader.stream.lock();
            if !state.buffer.is_empty() {
                ready = Some(reader.id());
                break;
            }
            state.poll = Some((Arc::clone(&self.slot), reader.id()));
        }

        let id = match ready {
            Some(id) => id,
            None => {
                let mut wakeup = self.slot.wakeup.lock();
                loop {
                    if let Some(id) = *wakeup {
                        break id;
                    }
                    self.slot.cond.wait(&mut wakeup);
                }
            }
        };

        // A writer wakes the slot under its stream lock, so once every
        // registration is cleared no wakeup is still in flight.
        for reader in &self.members {
            reader.stream.lock().poll = None;
        }
        *self.slot.wakeup.lock() = None;

        id
    }
}

impl<T> std::fmt::Debug for StreamSet<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSet")
            .field("members", &self.members.iter().map(StreamReader::id).collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::Stream;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_put_remove() {
        let a: Stream<u8> = Stream::new(1);
        let b: Stream<u8> = Stream::new(1);
        let mut set = StreamSet::new();
        assert!(set.is_empty());

        let ra = a.open_reader();
        let id_a = ra.id();
        set.put(ra);
        set.put(b.open_reader());
        assert_eq!(set.len(), 2);
        assert!(set.contains(id_a));
        assert_eq!(set.position(id_a), Some(0));

        let removed = set.remove(id_a).unwrap();
        assert_eq!(removed.id(), id_a);
        assert_eq!(set.len(), 1);
        assert!(set.remove(id_a).is_none());
    }

    #[test]
    fn test_poll_fast_path() {
        let a = Stream::new(2);
        let b = Stream::new(2);
        let mut set = StreamSet::new();
        set.put(a.open_reader());
        let rb = b.open_reader();
        let id_b = rb.id();
        set.put(rb);

        b.open_writer().write(5);
        assert_eq!(set.poll(), id_b);
        assert_eq!(set.get(id_b).unwrap().read(), 5);
    }

    #[test]
    fn test_poll_wakes_on_write() {
        let streams: Vec<Stream<u32>> = (0..3).map(|_| Stream::new(1)).collect();
        let mut set = StreamSet::new();
        for stream in &streams {
            set.put(stream.open_reader());
        }
        let target = set.get_at(2).unwrap().id();

        let writer = streams[2].open_writer();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            writer.write(11);
        });

        let id = set.poll();
        assert_eq!(id, target);
        assert_eq!(set.get(id).unwrap().read(), 11);
        handle.join().unwrap();

        // Registrations are cleared after wakeup.
        for stream in &streams {
            assert!(stream.lock().poll.is_none());
        }
    }

    #[test]
    fn test_poll_repeated() {
        let a = Stream::new(4);
        let b = Stream::new(4);
        let mut set = StreamSet::new();
        set.put(a.open_reader());
        set.put(b.open_reader());

        let wa = a.open_writer();
        let wb = b.open_writer();
        let handle = thread::spawn(move || {
            for i in 0..20 {
                if i % 2 == 0 {
                    wa.write(i);
                } else {
                    wb.write(i);
                }
            }
        });

        let mut seen = Vec::new();
        while seen.len() < 20 {
            let id = set.poll();
            seen.push(set.get(id).unwrap().read());
        }
        handle.join().unwrap();
        seen.sort_unstable();
        assert_eq!(seen, (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn test_append_and_drain() {
        let mut left: StreamSet<u8> = StreamSet::new();
        let mut right: StreamSet<u8> = StreamSet::new();
        right.put(Stream::new(1).open_reader());
        right.put(Stream::new(1).open_reader());

        left.append(&mut right);
        assert_eq!(left.len(), 2);
        assert!(right.is_empty());
        assert_eq!(left.drain().count(), 2);
        assert!(left.is_empty());
    }

    #[test]
    #[should_panic(expected = "empty stream set")]
    fn test_poll_empty_is_fatal() {
        let set: StreamSet<u8> = StreamSet::new();
        set.poll();
    }
}
