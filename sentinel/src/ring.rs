//! Bounded multi-producer, single-consumer record ring.
//!
//! Host counterpart of the kernel `BPF_MAP_TYPE_RINGBUF` the classifier
//! writes to, with the same contract: a producer claims space by advancing
//! the shared producer position with one atomic step, fails immediately when
//! the claim would overrun unread data, writes its record without holding any
//! lock, then commits it. The consumer sees records in reservation order and
//! stops at the first one that is reserved but not yet committed.
//!
//! The region is a slice of `AtomicU32` words so that producers writing
//! disjoint records and the consumer clearing consumed ones never race on
//! plain memory.

use anyhow::ensure;
use sentinel_common::{Event, EventSink};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// Length word plus one reserved word, as in the kernel ring buffer.
pub const HEADER_LEN: usize = 8;

const DISCARD_BIT: u32 = 1 << 30;
const LEN_MASK: u32 = DISCARD_BIT - 1;

struct Shared {
    words: Box<[AtomicU32]>,
    capacity: u64,
    producer_pos: AtomicU64,
    consumer_pos: AtomicU64,
}

impl Shared {
    fn word(&self, pos: u64) -> &AtomicU32 {
        let index = (pos % self.capacity) / 4;
        &self.words[index as usize]
    }

    /// Clears `[pos, pos + len)` so stale payload can never be read back as
    /// a committed header.
    fn clear(&self, pos: u64, len: u64) {
        let mut off = 0;
        while off < len {
            self.word(pos + off).store(0, Ordering::Relaxed);
            off += 4;
        }
    }
}

/// Space taken by a record with `len` payload bytes.
pub fn record_len(len: usize) -> usize {
    (HEADER_LEN + len + 7) & !7
}

/// Creates a ring of `capacity` bytes, which must be a power of two of at
/// least 16.
pub fn channel(capacity: usize) -> anyhow::Result<(Producer, Consumer)> {
    ensure!(
        capacity >= 16 && capacity.is_power_of_two(),
        "ring capacity must be a power of two >= 16, got {capacity}"
    );
    let shared = Arc::new(Shared {
        words: (0..capacity / 4).map(|_| AtomicU32::new(0)).collect(),
        capacity: capacity as u64,
        producer_pos: AtomicU64::new(0),
        consumer_pos: AtomicU64::new(0),
    });
    Ok((
        Producer {
            shared: shared.clone(),
        },
        Consumer { shared },
    ))
}

/// Producer handle. Cheap to clone, one per concurrent writer.
#[derive(Clone)]
pub struct Producer {
    shared: Arc<Shared>,
}

impl Producer {
    /// Claims room for a `len`-byte record, or returns `None` straight away
    /// if the ring cannot hold it. The only loop is the compare-exchange on
    /// the producer position, which repeats only when another producer won
    /// the same slot.
    pub fn reserve(&self, len: usize) -> Option<Reservation<'_>> {
        let shared = &*self.shared;
        if len == 0 || len > LEN_MASK as usize {
            return None;
        }
        let total = record_len(len) as u64;
        if total > shared.capacity {
            return None;
        }

        let mut pos = shared.producer_pos.load(Ordering::Relaxed);
        loop {
            let consumed = shared.consumer_pos.load(Ordering::Acquire);
            // A stale `pos` can trail `consumed`; the exchange below then
            // fails and reloads it.
            if pos.saturating_sub(consumed) + total > shared.capacity {
                return None;
            }
            match shared.producer_pos.compare_exchange_weak(
                pos,
                pos + total,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(current) => pos = current,
            }
        }

        Some(Reservation {
            shared,
            pos,
            len: len as u32,
            done: false,
        })
    }

    /// Bytes not claimed by unread or in-flight records.
    pub fn free_bytes(&self) -> usize {
        let shared = &*self.shared;
        let consumed = shared.consumer_pos.load(Ordering::Acquire);
        let used = shared.producer_pos.load(Ordering::Acquire) - consumed;
        (shared.capacity - used) as usize
    }
}

impl EventSink for Producer {
    fn publish(&self, event: &Event) -> bool {
        match self.reserve(Event::LEN) {
            Some(mut slot) => {
                slot.fill(&event.to_bytes());
                slot.submit();
                true
            }
            None => false,
        }
    }
}

/// A claimed record. Invisible to the consumer until [`Reservation::submit`];
/// dropped without submitting, it is discarded.
pub struct Reservation<'a> {
    shared: &'a Shared,
    pos: u64,
    len: u32,
    done: bool,
}

impl Reservation<'_> {
    pub fn len(&self) -> usize {
        self.len as usize
    }

    /// Writes the payload. Bytes beyond the reserved length are ignored.
    pub fn fill(&mut self, payload: &[u8]) {
        let payload = &payload[..payload.len().min(self.len())];
        let start = self.pos + HEADER_LEN as u64;
        for (i, chunk) in payload.chunks(4).enumerate() {
            let mut word = [0u8; 4];
            word[..chunk.len()].copy_from_slice(chunk);
            self.shared
                .word(start + 4 * i as u64)
                .store(u32::from_ne_bytes(word), Ordering::Relaxed);
        }
    }

    /// Makes the record visible to the consumer.
    pub fn submit(mut self) {
        self.finish(self.len);
    }

    pub fn discard(mut self) {
        self.finish(self.len | DISCARD_BIT);
    }

    fn finish(&mut self, header: u32) {
        self.done = true;
        // Release: the payload stores happen-before the consumer's Acquire
        // load of a non-zero header.
        self.shared.word(self.pos).store(header, Ordering::Release);
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.finish(self.len | DISCARD_BIT);
        }
    }
}

/// The single consumer.
pub struct Consumer {
    shared: Arc<Shared>,
}

impl Consumer {
    /// Next committed record, skipping discarded ones. `None` when the ring
    /// is empty or the oldest record is still being written.
    pub fn pop(&mut self) -> Option<Vec<u8>> {
        let shared = &*self.shared;
        loop {
            let pos = shared.consumer_pos.load(Ordering::Relaxed);
            if pos == shared.producer_pos.load(Ordering::Acquire) {
                return None;
            }
            // Zero means reserved but not committed yet.
            let header = shared.word(pos).load(Ordering::Acquire);
            if header == 0 {
                return None;
            }

            let len = (header & LEN_MASK) as usize;
            let record = if header & DISCARD_BIT == 0 {
                Some(self.read(pos + HEADER_LEN as u64, len))
            } else {
                None
            };

            let total = record_len(len) as u64;
            shared.clear(pos, total);
            shared.consumer_pos.store(pos + total, Ordering::Release);

            if record.is_some() {
                return record;
            }
        }
    }

    fn read(&self, start: u64, len: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(len + 3);
        let mut off = 0;
        while off < len as u64 {
            let word = self.shared.word(start + off).load(Ordering::Relaxed);
            out.extend_from_slice(&word.to_ne_bytes());
            off += 4;
        }
        out.truncate(len);
        out
    }

    /// Bytes held by unread or in-flight records.
    pub fn pending_bytes(&self) -> usize {
        let shared = &*self.shared;
        (shared.producer_pos.load(Ordering::Acquire) - shared.consumer_pos.load(Ordering::Relaxed))
            as usize
    }
}
