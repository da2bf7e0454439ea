//! Fixed-capacity cyclic byte queues holding framed samples.
//!
//! Every record is a [`RecordHeader`] followed by its payload. Video payloads
//! are stored with a 4-byte big-endian NAL length prefix so they can be
//! copied into an `mdat` box verbatim.
//!
//! Reads are two-phase: a [`ScanCursor`] walks records without consuming
//! them, [`CyclicQueue::commit`] then moves the tail up to the cursor.

use bytes::BytesMut;
use parking_lot::Mutex;

use crate::error::{RecorderError, Result};
use crate::frame::{RecordHeader, SampleType, RECORD_HEADER_SIZE};

/// Size of the NAL length prefix stored in front of video payloads.
pub const NAL_LENGTH_SIZE: usize = 4;

/// Raw ring storage. Only reachable through a queue lock.
pub struct Ring {
    bytes: Box<[u8]>,
    head: usize,
    tail: usize,
    /// Bumped whenever records are dropped on the producer side.
    epoch: u64,
}

impl Ring {
    fn new(capacity: usize) -> Self {
        assert!(capacity > RECORD_HEADER_SIZE, "cyclic queue capacity too small");
        Self {
            bytes: vec![0u8; capacity].into_boxed_slice(),
            head: 0,
            tail: 0,
            epoch: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.bytes.len()
    }

    /// Write position of the next record.
    pub fn head(&self) -> usize {
        self.head
    }

    /// Position of the oldest record.
    pub fn tail(&self) -> usize {
        self.tail
    }

    pub fn len(&self) -> usize {
        self.distance(self.tail, self.head)
    }

    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    /// Whether `len` more bytes can be appended. One byte always stays free
    /// so that a full queue never looks empty.
    pub fn fits(&self, len: usize) -> bool {
        self.len() + len < self.capacity()
    }

    pub fn available(&self) -> usize {
        self.capacity() - self.len() - 1
    }

    /// Header of the oldest record.
    pub fn oldest(&self) -> Option<RecordHeader> {
        (!self.is_empty()).then(|| self.header_at(self.tail))
    }

    /// Drop the oldest record. Outstanding scan cursors become stale.
    pub fn discard_oldest(&mut self) -> Option<RecordHeader> {
        let header = self.oldest()?;
        self.tail = self.advance(self.tail, header.record_len());
        self.epoch += 1;
        Some(header)
    }

    /// Drop every record written at or after `pos`. A position that is no
    /// longer inside the queue empties it.
    pub fn truncate(&mut self, pos: usize) {
        self.head = if self.contains(pos) { pos } else { self.tail };
    }

    /// Drop every record.
    pub fn clear(&mut self) {
        self.head = self.tail;
    }

    fn distance(&self, from: usize, to: usize) -> usize {
        if to >= from {
            to - from
        } else {
            self.capacity() - from + to
        }
    }

    fn advance(&self, pos: usize, n: usize) -> usize {
        let rest = self.capacity() - pos;
        if n >= rest {
            n - rest
        } else {
            pos + n
        }
    }

    fn contains(&self, pos: usize) -> bool {
        pos < self.capacity() && self.distance(self.tail, pos) <= self.len()
    }

    fn is_valid(&self, cursor: &ScanCursor) -> bool {
        cursor.epoch == self.epoch && self.contains(cursor.pos)
    }

    fn write(&mut self, data: &[u8]) {
        assert!(
            self.len() + data.len() < self.capacity(),
            "cyclic queue write beyond free space"
        );
        let head = self.head;
        let rest = self.capacity() - head;
        if data.len() > rest {
            self.bytes[head..].copy_from_slice(&data[..rest]);
            self.bytes[..data.len() - rest].copy_from_slice(&data[rest..]);
        } else {
            self.bytes[head..head + data.len()].copy_from_slice(data);
        }
        self.head = self.advance(head, data.len());
    }

    /// The `n` bytes starting at `pos`, split at the wrap point.
    fn slices(&self, pos: usize, n: usize) -> (&[u8], &[u8]) {
        assert!(n <= self.distance(pos, self.head), "cyclic queue read past head");
        let rest = self.capacity() - pos;
        if n > rest {
            (&self.bytes[pos..], &self.bytes[..n - rest])
        } else {
            (&self.bytes[pos..pos + n], &[])
        }
    }

    fn header_at(&self, pos: usize) -> RecordHeader {
        let mut raw = [0u8; RECORD_HEADER_SIZE];
        let (first, second) = self.slices(pos, RECORD_HEADER_SIZE);
        raw[..first.len()].copy_from_slice(first);
        raw[first.len()..].copy_from_slice(second);
        RecordHeader::decode_trusted(&raw)
    }

    /// Move the oldest record into `dst` using `header` (which may carry
    /// flags added by the destination's admission).
    fn move_oldest_into(&mut self, dst: &mut Ring, header: &RecordHeader) {
        dst.write(&header.encode());
        let payload = self.advance(self.tail, RECORD_HEADER_SIZE);
        let (first, second) = self.slices(payload, header.size as usize);
        dst.write(first);
        dst.write(second);
        self.tail = self.advance(self.tail, header.record_len());
    }
}

/// Space admission of a queue, evaluated with the queue lock held before a
/// record is appended.
pub trait Admission {
    /// Return `Ok(true)` when the record may be appended. The policy may drop
    /// old records, roll back the head, or add flags to `header`.
    fn admit(&mut self, ring: &mut Ring, header: &mut RecordHeader) -> Result<bool>;
}

/// Admission of the synchronization queues: running out of space is an error.
#[derive(Debug, Clone, Copy)]
pub struct Strict;

impl Admission for Strict {
    fn admit(&mut self, ring: &mut Ring, header: &mut RecordHeader) -> Result<bool> {
        if ring.fits(header.record_len()) {
            Ok(true)
        } else {
            Err(RecorderError::SyncQueueOverflow {
                queue: "",
                needed: header.record_len(),
                available: ring.available(),
            })
        }
    }
}

/// Read position of a two-phase scan.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScanCursor {
    pos: usize,
    /// Unread bytes of a partially read frame.
    remaining: usize,
    epoch: u64,
}

impl ScanCursor {
    pub fn remaining(&self) -> usize {
        self.remaining
    }
}

/// Result of [`CyclicQueue::copy_from`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CopyOutcome {
    pub copied: usize,
    /// Records the destination refused; they are removed from the source.
    pub dropped: usize,
    /// A fragment-start frame reached the destination.
    pub fragment_start: bool,
    pub source_empty: bool,
}

struct Guarded<P> {
    ring: Ring,
    policy: P,
}

/// A cyclic queue guarded by its own lock.
pub struct CyclicQueue<P> {
    name: &'static str,
    inner: Mutex<Guarded<P>>,
}

impl<P: Admission> CyclicQueue<P> {
    pub fn new(name: &'static str, capacity: usize, policy: P) -> Self {
        Self {
            name,
            inner: Mutex::new(Guarded {
                ring: Ring::new(capacity),
                policy,
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().ring.capacity()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().ring.is_empty()
    }

    /// Run `f` on the admission policy and ring under the queue lock.
    pub fn with_policy<R>(&self, f: impl FnOnce(&mut P, &mut Ring) -> R) -> R {
        let mut guard = self.inner.lock();
        let Guarded { ring, policy } = &mut *guard;
        f(policy, ring)
    }

    /// Append one frame. Video payloads get a NAL length prefix.
    ///
    /// Returns `Ok(false)` when admission refused the frame.
    pub fn put(&self, sample_time: u64, sample_type: SampleType, payload: &[u8]) -> Result<bool> {
        let prefixed = !sample_type.is_audio();
        let size = payload.len() + if prefixed { NAL_LENGTH_SIZE } else { 0 };
        assert!(size <= u32::MAX as usize, "frame too large for a record header");
        let mut header = RecordHeader {
            sample_time,
            size: size as u32,
            sample_type,
        };

        let mut guard = self.inner.lock();
        let Guarded { ring, policy } = &mut *guard;
        let admitted = policy.admit(ring, &mut header).map_err(|e| self.named(e))?;
        if !admitted {
            return Ok(false);
        }
        ring.write(&header.encode());
        if prefixed {
            ring.write(&(payload.len() as u32).to_be_bytes());
        }
        ring.write(payload);
        Ok(true)
    }

    /// Start a scan at the oldest record.
    pub fn begin_scan(&self) -> ScanCursor {
        let guard = self.inner.lock();
        ScanCursor {
            pos: guard.ring.tail,
            remaining: 0,
            epoch: guard.ring.epoch,
        }
    }

    /// Header of the record at the cursor; the cursor moves past the record.
    ///
    /// `None` at the end of the queue or when the cursor went stale.
    pub fn scan_frame(&self, cursor: &mut ScanCursor) -> Option<RecordHeader> {
        let guard = self.inner.lock();
        let ring = &guard.ring;
        if !ring.is_valid(cursor) || cursor.pos == ring.head {
            return None;
        }
        debug_assert_eq!(cursor.remaining, 0, "scan inside a partially read frame");
        let header = ring.header_at(cursor.pos);
        cursor.pos = ring.advance(cursor.pos, header.record_len());
        Some(header)
    }

    /// Release everything before the cursor. Fails on a stale cursor.
    pub fn commit(&self, cursor: &ScanCursor) -> bool {
        let mut guard = self.inner.lock();
        if !guard.ring.is_valid(cursor) {
            return false;
        }
        guard.ring.tail = cursor.pos;
        true
    }

    /// Append up to `max` payload bytes of the frame at the cursor to `out`.
    ///
    /// A frame larger than `max` is continued by the next call. With
    /// `skip_audio`, audio records are passed over when a new frame starts.
    pub fn read_chunk(
        &self,
        cursor: &mut ScanCursor,
        out: &mut BytesMut,
        max: usize,
        skip_audio: bool,
    ) -> usize {
        let guard = self.inner.lock();
        let ring = &guard.ring;
        if !ring.is_valid(cursor) {
            return 0;
        }

        let mut size = cursor.remaining;
        if size == 0 {
            loop {
                if cursor.pos == ring.head {
                    return 0;
                }
                let header = ring.header_at(cursor.pos);
                cursor.pos = ring.advance(cursor.pos, RECORD_HEADER_SIZE);
                if skip_audio && header.sample_type.is_audio() {
                    cursor.pos = ring.advance(cursor.pos, header.size as usize);
                    continue;
                }
                size = header.size as usize;
                break;
            }
        }

        let n = max.min(size);
        let (first, second) = ring.slices(cursor.pos, n);
        out.extend_from_slice(first);
        out.extend_from_slice(second);
        cursor.pos = ring.advance(cursor.pos, n);
        cursor.remaining = size - n;
        n
    }

    /// Drop the unread rest of a partially read frame and commit.
    pub fn skip_partial(&self, cursor: &mut ScanCursor) {
        let mut guard = self.inner.lock();
        if cursor.remaining > 0 && guard.ring.is_valid(cursor) {
            let ring = &mut guard.ring;
            assert!(
                cursor.remaining <= ring.distance(cursor.pos, ring.head),
                "partial frame extends past head"
            );
            cursor.pos = ring.advance(cursor.pos, cursor.remaining);
            ring.tail = cursor.pos;
        }
        cursor.remaining = 0;
    }

    /// Move every record of `source` older than `time_limit` into this queue.
    ///
    /// Locks this queue, then `source`. Records this queue's admission
    /// refuses are dropped from the source. `source` must be a different
    /// queue.
    pub fn copy_from<Q: Admission>(
        &self,
        source: &CyclicQueue<Q>,
        time_limit: u64,
    ) -> Result<CopyOutcome> {
        let mut dst = self.inner.lock();
        let mut src = source.inner.lock();
        let mut outcome = CopyOutcome::default();

        while let Some(mut header) = src.ring.oldest() {
            if header.sample_time >= time_limit {
                break;
            }
            let Guarded { ring, policy } = &mut *dst;
            if policy.admit(ring, &mut header).map_err(|e| self.named(e))? {
                src.ring.move_oldest_into(ring, &header);
                outcome.copied += 1;
                outcome.fragment_start |= header.sample_type.is_fragment_start();
            } else {
                src.ring.discard_oldest();
                outcome.dropped += 1;
            }
        }

        outcome.source_empty = src.ring.is_empty();
        Ok(outcome)
    }

    fn named(&self, err: RecorderError) -> RecorderError {
        match err {
            RecorderError::SyncQueueOverflow {
                needed, available, ..
            } => RecorderError::SyncQueueOverflow {
                queue: self.name,
                needed,
                available,
            },
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::nal_unit_type;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::VecDeque;

    /// Drops the oldest records until the new one fits.
    struct DropOldest;

    impl Admission for DropOldest {
        fn admit(&mut self, ring: &mut Ring, header: &mut RecordHeader) -> Result<bool> {
            while !ring.fits(header.record_len()) {
                if ring.discard_oldest().is_none() {
                    return Ok(false);
                }
            }
            Ok(true)
        }
    }

    fn read_frame<P: Admission>(queue: &CyclicQueue<P>, cursor: &mut ScanCursor) -> Vec<u8> {
        let mut out = BytesMut::new();
        queue.read_chunk(cursor, &mut out, usize::MAX, false);
        out.to_vec()
    }

    #[test]
    fn test_put_scan_commit() {
        let queue = CyclicQueue::new("audio", 256, Strict);
        assert!(queue.put(10, SampleType::AUDIO, &[1, 2, 3]).unwrap());
        assert!(queue.put(20, SampleType::AUDIO, &[4, 5]).unwrap());
        assert_eq!(queue.len(), 2 * RECORD_HEADER_SIZE + 5);

        let mut cursor = queue.begin_scan();
        let first = queue.scan_frame(&mut cursor).unwrap();
        assert_eq!(first.sample_time, 10);
        assert_eq!(first.size, 3);
        let second = queue.scan_frame(&mut cursor).unwrap();
        assert_eq!(second.sample_time, 20);
        assert!(queue.scan_frame(&mut cursor).is_none());

        // Scanning alone consumes nothing.
        assert_eq!(queue.len(), 2 * RECORD_HEADER_SIZE + 5);
        assert!(queue.commit(&cursor));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_video_records_carry_nal_length_prefix() {
        let queue = CyclicQueue::new("video", 256, Strict);
        let sample_type = SampleType::video(nal_unit_type::IDR_SLICE);
        queue.put(0, sample_type, &[0x65, 0xAA, 0xBB]).unwrap();

        let mut cursor = queue.begin_scan();
        assert_eq!(queue.scan_frame(&mut cursor).unwrap().size, 7);

        let mut cursor = queue.begin_scan();
        assert_eq!(read_frame(&queue, &mut cursor), vec![0, 0, 0, 3, 0x65, 0xAA, 0xBB]);
    }

    #[test]
    fn test_strict_queue_overflow_is_error() {
        let queue = CyclicQueue::new("video", 64, Strict);
        assert!(queue.put(0, SampleType::AUDIO, &[0u8; 30]).unwrap());
        match queue.put(1, SampleType::AUDIO, &[0u8; 30]) {
            Err(RecorderError::SyncQueueOverflow { queue, needed, .. }) => {
                assert_eq!(queue, "video");
                assert_eq!(needed, RECORD_HEADER_SIZE + 30);
            }
            other => panic!("expected overflow, got {:?}", other),
        }
    }

    #[test]
    fn test_record_never_fills_last_byte() {
        // 16 + 47 = 63 bytes would leave head == tail in a 64 byte ring.
        let queue = CyclicQueue::new("audio", 64, Strict);
        assert!(queue.put(0, SampleType::AUDIO, &[0u8; 48]).is_err());
        assert!(queue.put(0, SampleType::AUDIO, &[0u8; 47]).unwrap());
    }

    #[test]
    fn test_read_chunk_splits_frames() {
        let queue = CyclicQueue::new("main", 256, Strict);
        let payload: Vec<u8> = (0..10).collect();
        queue.put(0, SampleType::AUDIO, &payload).unwrap();
        queue.put(1, SampleType::AUDIO, &[42]).unwrap();

        let mut cursor = queue.begin_scan();
        let mut out = BytesMut::new();
        assert_eq!(queue.read_chunk(&mut cursor, &mut out, 4, false), 4);
        assert_eq!(cursor.remaining(), 6);
        assert!(queue.commit(&cursor));
        assert_eq!(queue.read_chunk(&mut cursor, &mut out, 4, false), 4);
        assert_eq!(queue.read_chunk(&mut cursor, &mut out, 4, false), 2);
        assert_eq!(cursor.remaining(), 0);
        assert_eq!(&out[..], &payload[..]);

        // The next call starts the next frame.
        assert_eq!(queue.read_chunk(&mut cursor, &mut out, 4, false), 1);
        assert_eq!(out.last(), Some(&42));
        assert_eq!(queue.read_chunk(&mut cursor, &mut out, 4, false), 0);
    }

    #[test]
    fn test_read_chunk_skips_audio() {
        let queue = CyclicQueue::new("main", 256, Strict);
        queue.put(0, SampleType::AUDIO, &[1, 1]).unwrap();
        queue.put(1, SampleType::AUDIO, &[2, 2]).unwrap();
        queue.put(2, SampleType::video(nal_unit_type::NON_IDR_SLICE), &[0x41]).unwrap();

        let mut cursor = queue.begin_scan();
        let mut out = BytesMut::new();
        assert_eq!(queue.read_chunk(&mut cursor, &mut out, 100, true), 5);
        assert_eq!(&out[..], &[0, 0, 0, 1, 0x41]);
    }

    #[test]
    fn test_skip_partial_discards_rest_of_frame() {
        let queue = CyclicQueue::new("main", 256, Strict);
        queue.put(0, SampleType::AUDIO, &[7u8; 20]).unwrap();
        queue.put(1, SampleType::AUDIO, &[9u8; 3]).unwrap();

        let mut cursor = queue.begin_scan();
        let mut out = BytesMut::new();
        queue.read_chunk(&mut cursor, &mut out, 5, false);
        queue.commit(&cursor);
        queue.skip_partial(&mut cursor);
        assert_eq!(cursor.remaining(), 0);
        assert_eq!(queue.len(), RECORD_HEADER_SIZE + 3);

        let mut cursor = queue.begin_scan();
        assert_eq!(queue.scan_frame(&mut cursor).unwrap().sample_time, 1);
    }

    #[test]
    fn test_copy_from_respects_time_limit() {
        let main = CyclicQueue::new("main", 512, Strict);
        let sync = CyclicQueue::new("audio", 512, Strict);
        for t in [10, 20, 30, 40] {
            sync.put(t, SampleType::AUDIO, &[t as u8]).unwrap();
        }

        let outcome = main.copy_from(&sync, 30).unwrap();
        assert_eq!(outcome.copied, 2);
        assert!(!outcome.source_empty);

        let mut cursor = main.begin_scan();
        assert_eq!(main.scan_frame(&mut cursor).unwrap().sample_time, 10);
        assert_eq!(main.scan_frame(&mut cursor).unwrap().sample_time, 20);
        assert!(main.scan_frame(&mut cursor).is_none());

        let outcome = main.copy_from(&sync, u64::MAX).unwrap();
        assert_eq!(outcome.copied, 2);
        assert!(outcome.source_empty);
        assert!(sync.is_empty());
    }

    #[test]
    fn test_copy_from_drops_refused_records() {
        let main = CyclicQueue::new("main", 64, Strict);
        main.put(0, SampleType::AUDIO, &[0u8; 10]).unwrap();
        let sync = CyclicQueue::new("audio", 512, Strict);
        sync.put(1, SampleType::AUDIO, &[0u8; 40]).unwrap();

        // The destination overflows, which a strict queue reports.
        assert!(main.copy_from(&sync, u64::MAX).is_err());

        let main = CyclicQueue::new("main", 64, DropOldest);
        main.put(0, SampleType::AUDIO, &[0u8; 40]).unwrap();
        let outcome = main.copy_from(&sync, u64::MAX).unwrap();
        assert_eq!(outcome.copied, 1);
        assert!(outcome.source_empty);
    }

    #[test]
    fn test_producer_discard_invalidates_cursor() {
        let queue = CyclicQueue::new("main", 100, DropOldest);
        queue.put(0, SampleType::AUDIO, &[0u8; 40]).unwrap();
        let mut cursor = queue.begin_scan();

        queue.put(1, SampleType::AUDIO, &[0u8; 40]).unwrap();
        assert!(queue.scan_frame(&mut cursor).is_none());
        assert!(!queue.commit(&cursor));

        let mut out = BytesMut::new();
        assert_eq!(queue.read_chunk(&mut cursor, &mut out, 100, false), 0);
    }

    #[test]
    fn test_truncate_outside_queue_empties_it() {
        let queue = CyclicQueue::new("main", 100, DropOldest);
        queue.put(0, SampleType::AUDIO, &[0u8; 10]).unwrap();
        let start = queue.with_policy(|_, ring| ring.head());
        queue.put(1, SampleType::AUDIO, &[0u8; 10]).unwrap();

        queue.with_policy(|_, ring| ring.truncate(start));
        assert_eq!(queue.len(), RECORD_HEADER_SIZE + 10);

        // Consume everything and write past the saved position.
        queue.put(2, SampleType::AUDIO, &[0u8; 20]).unwrap();
        queue.with_policy(|_, ring| {
            ring.discard_oldest();
            ring.discard_oldest();
        });
        queue.put(3, SampleType::AUDIO, &[0u8; 20]).unwrap();
        queue.with_policy(|_, ring| ring.truncate(start));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_no_overwrite_randomized() {
        let mut rng = StdRng::seed_from_u64(0x5EED);
        let queue = CyclicQueue::new("main", 997, Strict);
        let mut model: VecDeque<(u64, Vec<u8>)> = VecDeque::new();

        for step in 0..5000u64 {
            if rng.random_bool(0.55) {
                let len = rng.random_range(1..120);
                let payload: Vec<u8> = (0..len).map(|_| rng.random()).collect();
                match queue.put(step, SampleType::AUDIO, &payload) {
                    Ok(true) => model.push_back((step, payload)),
                    Ok(false) => unreachable!(),
                    Err(_) => {}
                }
            } else {
                let mut cursor = queue.begin_scan();
                match queue.scan_frame(&mut cursor) {
                    Some(header) => {
                        let (time, payload) = model.pop_front().unwrap();
                        assert_eq!(header.sample_time, time);
                        assert_eq!(header.size as usize, payload.len());

                        let mut cursor = queue.begin_scan();
                        let mut out = BytesMut::new();
                        // Read in random slices to exercise partial frames.
                        while out.len() < payload.len() {
                            let max = rng.random_range(1..64);
                            assert!(queue.read_chunk(&mut cursor, &mut out, max, false) > 0);
                            assert!(queue.commit(&cursor));
                        }
                        assert_eq!(&out[..], &payload[..]);
                    }
                    None => assert!(model.is_empty()),
                }
            }

            let expected: usize = model.iter().map(|(_, p)| RECORD_HEADER_SIZE + p.len()).sum();
            assert_eq!(queue.len(), expected);
        }
    }
}
