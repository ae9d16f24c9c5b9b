//! # Streams
//!
//! Bounded blocking FIFO streams connecting network entities.
//!
//! A [`Stream`] is a fixed-capacity ring buffer behind one mutex with two
//! condition variables (not-empty and not-full). Entities access it through
//! descriptors: one [`StreamReader`] and one [`StreamWriter`] may be open at
//! a time. Reads block while the stream is empty, writes block while it is
//! full.
//!
//! A [`StreamSet`] groups the read descriptors of one consumer and supports
//! [`StreamSet::poll`], which blocks until any member is non-empty.
//!
//! ## Polling protocol
//!
//! ```text
//!   poller                       writer
//!   ──────                       ──────
//!   fast path: scan members
//!   slow path: lock each stream,
//!     register (slot, desc id)
//!   lock slot, wait ──────────▶  write under stream lock
//!                                take registration
//!                                lock slot, publish desc id if unset
//!   ◀──────────────────────────  signal slot
//!   clear all registrations
//! ```
//!
//! Locks are always taken stream first, slot second.
//!
//! ## Module Structure
//!
//! - [`error`]: Error types for non-blocking writes
//! - [`ring_buffer`]: The unsynchronized ring buffer
//! - [`set`]: Stream sets and polling

pub mod error;
pub mod ring_buffer;
pub mod set;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::config::DEFAULT_STREAM_CAPACITY;
use crate::error::fatal;

pub use error::{StreamError, TryWriteError};
pub use ring_buffer::RingBuffer;
pub use set::StreamSet;

/// Callback invoked after every successful read from a stream.
pub type ReadCallback = Arc<dyn Fn() + Send + Sync>;

static NEXT_DESC_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a read descriptor.
///
/// The id survives [`StreamReader::replace`], so a consumer can keep using it
/// as a key after the underlying stream has been swapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DescId(u64);

impl DescId {
    fn next() -> Self {
        Self(NEXT_DESC_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw id.
    #[must_use]
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for DescId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sd#{}", self.0)
    }
}

/// Wake slot owned by one poller.
///
/// Holds the id of the first descriptor that became readable while the
/// poller was blocked.
#[derive(Default)]
pub(crate) struct PollSlot {
    wakeup: Mutex<Option<DescId>>,
    cond: Condvar,
}

impl PollSlot {
    /// Publishes `id` as the wakeup target unless one is already set.
    fn wake(&self, id: DescId) {
        let mut wakeup = self.wakeup.lock();
        if wakeup.is_none() {
            *wakeup = Some(id);
        }
        self.cond.notify_one();
    }
}

struct State<T> {
    buffer: RingBuffer<T>,
    /// Poll registration of the reader, set while its owner is polling.
    poll: Option<(Arc<PollSlot>, DescId)>,
    has_reader: bool,
    has_writer: bool,
    /// Set once a reader has been opened and closed again.
    reader_closed: bool,
    read_callback: Option<ReadCallback>,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    not_empty: Condvar,
    not_full: Condvar,
}

/// A bounded blocking FIFO stream.
///
/// `Stream` is a cheap, cloneable handle; the buffer is freed once every
/// handle and descriptor is gone.
pub struct Stream<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Stream<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Stream<T> {
    /// Creates an empty stream.
    ///
    /// A capacity of `0` selects [`DEFAULT_STREAM_CAPACITY`].
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = if capacity == 0 {
            DEFAULT_STREAM_CAPACITY
        } else {
            capacity
        };
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    buffer: RingBuffer::new(capacity),
                    poll: None,
                    has_reader: false,
                    has_writer: false,
                    reader_closed: false,
                    read_callback: None,
                }),
                not_empty: Condvar::new(),
                not_full: Condvar::new(),
            }),
        }
    }

    /// Opens the read descriptor of this stream.
    ///
    /// # Panics
    ///
    /// Opening a second reader while one is open is a fatal protocol
    /// violation.
    #[must_use]
    pub fn open_reader(&self) -> StreamReader<T> {
        self.attach_reader();
        StreamReader {
            id: DescId::next(),
            stream: self.clone(),
            released: false,
        }
    }

    /// Opens the write descriptor of this stream.
    ///
    /// # Panics
    ///
    /// Opening a second writer while one is open is a fatal protocol
    /// violation.
    #[must_use]
    pub fn open_writer(&self) -> StreamWriter<T> {
        let mut state = self.shared.state.lock();
        if state.has_writer {
            drop(state);
            fatal("stream already has an open writer");
        }
        state.has_writer = true;
        drop(state);
        StreamWriter {
            stream: self.clone(),
        }
    }

    /// Registers a callback run after every successful read.
    ///
    /// The callback runs on the reading thread after the stream lock has
    /// been released, so it may itself touch the stream.
    pub fn register_read_callback(&self, callback: ReadCallback) {
        self.shared.state.lock().read_callback = Some(callback);
    }

    /// Returns the capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.shared.state.lock().buffer.capacity()
    }

    /// Returns the number of buffered items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.state.lock().buffer.len()
    }

    /// Returns true if no items are buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.shared.state.lock().buffer.is_empty()
    }

    /// Returns true if both handles refer to the same stream.
    #[must_use]
    pub fn same_stream(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.shared.state.lock()
    }

    fn attach_reader(&self) {
        let mut state = self.shared.state.lock();
        if state.has_reader {
            drop(state);
            fatal("stream already has an open reader");
        }
        state.has_reader = true;
        state.reader_closed = false;
        state.poll = None;
    }

    /// Drops the reader attachment but leaves buffered items, the read
    /// callback and the open state in place for the next reader.
    fn release_reader(&self) {
        let mut state = self.shared.state.lock();
        state.has_reader = false;
        state.poll = None;
    }

    fn detach_reader(&self) {
        let mut state = self.shared.state.lock();
        state.has_reader = false;
        state.reader_closed = true;
        state.poll = None;
        let callback = state.read_callback.take();
        let mut orphans = Vec::with_capacity(state.buffer.len());
        while let Some(item) = state.buffer.pop() {
            orphans.push(item);
        }
        // Unblock a writer stuck on a full stream nobody will drain.
        self.shared.not_full.notify_all();
        drop(state);
        drop(callback);
        drop(orphans);
    }

    /// Pushes `item` and performs the post-write signalling.
    ///
    /// Must be called with the buffer known to have room.
    fn push_locked(&self, state: &mut State<T>, item: T) {
        if state.buffer.push(item).is_err() {
            unreachable!("push_locked called on a full stream");
        }
        if state.buffer.len() == 1 {
            self.shared.not_empty.notify_one();
        }
        if let Some((slot, id)) = state.poll.take() {
            slot.wake(id);
        }
    }
}

impl<T> fmt::Debug for Stream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("Stream")
            .field("capacity", &state.buffer.capacity())
            .field("len", &state.buffer.len())
            .field("has_reader", &state.has_reader)
            .field("has_writer", &state.has_writer)
            .finish()
    }
}

/// Read descriptor of a stream.
///
/// Dropping the reader closes it.
pub struct StreamReader<T> {
    id: DescId,
    stream: Stream<T>,
    released: bool,
}

impl<T> StreamReader<T> {
    /// Returns the descriptor id.
    #[inline]
    #[must_use]
    pub fn id(&self) -> DescId {
        self.id
    }

    /// Returns the stream currently behind this descriptor.
    #[must_use]
    pub fn stream(&self) -> &Stream<T> {
        &self.stream
    }

    /// Blocks until an item is available and removes it.
    pub fn read(&self) -> T {
        let shared = &self.stream.shared;
        let mut state = shared.state.lock();
        let item = loop {
            if let Some(item) = state.buffer.pop() {
                break item;
            }
            shared.not_empty.wait(&mut state);
        };
        if state.buffer.len() + 1 == state.buffer.capacity() {
            shared.not_full.notify_one();
        }
        let callback = state.read_callback.clone();
        drop(state);

        if let Some(callback) = callback {
            callback();
        }
        item
    }

    /// Inspects the oldest item without removing it.
    pub fn peek<R>(&self, f: impl FnOnce(Option<&T>) -> R) -> R {
        let state = self.stream.lock();
        f(state.buffer.peek())
    }

    /// Returns true if the stream has no buffered items.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stream.is_empty()
    }

    /// Swaps the stream behind this descriptor for `stream`.
    ///
    /// The old stream is closed for reading. The descriptor id is kept.
    ///
    /// # Panics
    ///
    /// If `stream` already has an open reader.
    pub fn replace(&mut self, stream: Stream<T>) {
        if stream.same_stream(&self.stream) {
            return;
        }
        stream.attach_reader();
        let old = std::mem::replace(&mut self.stream, stream);
        old.detach_reader();
    }

    /// Gives up the descriptor without closing the stream.
    ///
    /// Buffered items stay in place and the returned stream can be opened
    /// by another reader, typically after being passed on in a `sync`
    /// record.
    #[must_use]
    pub fn into_stream(mut self) -> Stream<T> {
        self.stream.release_reader();
        self.released = true;
        self.stream.clone()
    }

    /// Closes the descriptor.
    pub fn close(self) {
        drop(self);
    }
}

impl<T> Drop for StreamReader<T> {
    fn drop(&mut self) {
        if !self.released {
            self.stream.detach_reader();
        }
    }
}

impl<T> fmt::Debug for StreamReader<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamReader")
            .field("id", &self.id)
            .field("stream", &self.stream)
            .finish()
    }
}

/// Write descriptor of a stream.
///
/// Dropping the writer closes it.
pub struct StreamWriter<T> {
    stream: Stream<T>,
}

impl<T> StreamWriter<T> {
    /// Returns the stream behind this descriptor.
    #[must_use]
    pub fn stream(&self) -> &Stream<T> {
        &self.stream
    }

    /// Blocks until there is room and appends `item`.
    ///
    /// Items written after the reader has been closed are dropped.
    pub fn write(&self, item: T) {
        let shared = &self.stream.shared;
        let mut state = shared.state.lock();
        while state.buffer.is_full() && !state.reader_closed {
            shared.not_full.wait(&mut state);
        }
        if state.reader_closed {
            return;
        }
        self.stream.push_locked(&mut state, item);
    }

    /// Appends `item` if there is room, without blocking.
    ///
    /// # Errors
    ///
    /// Returns [`TryWriteError`] carrying the item back if the stream is
    /// full or its reader has been closed.
    pub fn try_write(&self, item: T) -> Result<(), TryWriteError<T>> {
        let mut state = self.stream.lock();
        if state.reader_closed {
            return Err(TryWriteError::closed(item));
        }
        if state.buffer.is_full() {
            return Err(TryWriteError::full(item));
        }
        self.stream.push_locked(&mut state, item);
        Ok(())
    }

    /// Closes the descriptor.
    pub fn close(self) {
        drop(self);
    }
}

impl<T> Drop for StreamWriter<T> {
    fn drop(&mut self) {
        self.stream.lock().has_writer = false;
    }
}

impl<T> fmt::Debug for StreamWriter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamWriter")
            .field("stream", &self.stream)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_default_capacity() {
        let stream: Stream<u32> = Stream::new(0);
        assert_eq!(stream.capacity(), DEFAULT_STREAM_CAPACITY);
        let stream: Stream<u32> = Stream::new(3);
        assert_eq!(stream.capacity(), 3);
    }

    #[test]
    fn test_fifo_order() {
        let stream = Stream::new(4);
        let writer = stream.open_writer();
        let reader = stream.open_reader();

        for i in 0..4 {
            writer.write(i);
        }
        assert_eq!(stream.len(), 4);
        for i in 0..4 {
            assert_eq!(reader.read(), i);
        }
        assert!(reader.is_empty());
    }

    #[test]
    fn test_try_write_full() {
        let stream = Stream::new(1);
        let writer = stream.open_writer();
        let _reader = stream.open_reader();

        assert!(writer.try_write(1).is_ok());
        let err = writer.try_write(2).unwrap_err();
        assert!(err.is_full());
        assert_eq!(err.into_inner(), 2);
    }

    #[test]
    fn test_try_write_after_reader_closed() {
        let stream = Stream::new(2);
        let writer = stream.open_writer();
        let reader = stream.open_reader();
        reader.close();

        let err = writer.try_write(5).unwrap_err();
        assert!(err.is_closed());
    }

    #[test]
    fn test_write_before_reader_opens() {
        let stream = Stream::new(2);
        let writer = stream.open_writer();
        writer.write("early");
        let reader = stream.open_reader();
        assert_eq!(reader.read(), "early");
    }

    #[test]
    fn test_peek() {
        let stream = Stream::new(2);
        let writer = stream.open_writer();
        let reader = stream.open_reader();

        assert!(reader.peek(|item| item.is_none()));
        writer.write(10);
        assert_eq!(reader.peek(|item| item.copied()), Some(10));
        assert_eq!(reader.read(), 10);
    }

    #[test]
    fn test_writer_blocks_until_read() {
        let stream = Stream::new(1);
        let writer = stream.open_writer();
        let reader = stream.open_reader();
        writer.write(0);

        let handle = thread::spawn(move || {
            writer.write(1);
        });

        thread::sleep(Duration::from_millis(50));
        assert!(!handle.is_finished());
        assert_eq!(reader.read(), 0);
        handle.join().unwrap();
        assert_eq!(reader.read(), 1);
    }

    #[test]
    fn test_reader_blocks_until_write() {
        let stream = Stream::new(1);
        let writer = stream.open_writer();
        let reader = stream.open_reader();

        let handle = thread::spawn(move || reader.read());
        thread::sleep(Duration::from_millis(50));
        assert!(!handle.is_finished());
        writer.write(42);
        assert_eq!(handle.join().unwrap(), 42);
    }

    #[test]
    fn test_read_callback_runs_after_read() {
        let stream = Stream::new(2);
        let writer = stream.open_writer();
        let reader = stream.open_reader();
        let reads = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&reads);
        stream.register_read_callback(Arc::new(move || {
            counter.fetch_add(1, Ordering::Relaxed);
        }));

        writer.write(1);
        writer.write(2);
        assert_eq!(reads.load(Ordering::Relaxed), 0);
        reader.read();
        reader.read();
        assert_eq!(reads.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_replace_keeps_descriptor_id() {
        let first = Stream::new(2);
        let second = Stream::new(2);
        let mut reader = first.open_reader();
        let id = reader.id();

        let writer = second.open_writer();
        writer.write("after sync");
        reader.replace(second.clone());

        assert_eq!(reader.id(), id);
        assert!(reader.stream().same_stream(&second));
        assert_eq!(reader.read(), "after sync");
        // The old stream can take a new reader again.
        let _again = first.open_reader();
    }

    #[test]
    #[should_panic(expected = "open reader")]
    fn test_double_reader_is_fatal() {
        let stream: Stream<u8> = Stream::new(1);
        let _a = stream.open_reader();
        let _b = stream.open_reader();
    }

    #[test]
    #[should_panic(expected = "open writer")]
    fn test_double_writer_is_fatal() {
        let stream: Stream<u8> = Stream::new(1);
        let _a = stream.open_writer();
        let _b = stream.open_writer();
    }

    #[test]
    fn test_reopen_after_close() {
        let stream: Stream<u8> = Stream::new(1);
        stream.open_writer().close();
        let writer = stream.open_writer();
        writer.write(9);
        let reader = stream.open_reader();
        assert_eq!(reader.read(), 9);
    }

    #[test]
    fn test_into_stream_keeps_items() {
        let stream: Stream<u8> = Stream::new(4);
        let writer = stream.open_writer();
        writer.write(1);
        writer.write(2);
        let first = stream.open_reader();
        assert_eq!(first.read(), 1);

        let handed = first.into_stream();
        writer.write(3);
        let second = handed.open_reader();
        assert_eq!(second.read(), 2);
        assert_eq!(second.read(), 3);
    }
}
