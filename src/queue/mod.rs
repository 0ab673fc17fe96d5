//! Shared-memory ring queues
//!
//! A [`RingQueue`] implements one data edge between two stage processes:
//! - fixed-capacity circular byte buffer in a named segment (`Q_<edge_id>`)
//! - frames written as `[header][body]`, split across the wrap boundary
//! - watermark and CRC32 checked on every read
//! - separate read and write locks, so one producer and one consumer can
//!   proceed concurrently

pub mod control;
pub mod layout;
mod lock;
mod segment;

pub use control::{NodeStatusBlock, NodeStatusSnapshot, StageControlBlock};
pub use layout::{FrameHeader, FrameStatus, QueueStatus, DATA_START, FRAME_HEADER_SIZE, MIN_QUEUE_SIZE};
pub use lock::LockGuard;
pub use segment::{
    Segment, SegmentSpace, DEFAULT_ATTACH_TIMEOUT, DEFAULT_LOCK_RETRY, DEFAULT_LOCK_TIMEOUT,
};

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use crc::{Crc, CRC_32_ISO_HDLC};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error};

use crate::codec::{CodecError, Frame, FrameCodec};
use layout::{offset, MAX_OCCUPANCY, QUEUE_MAGIC};

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Recent enqueue/dequeue actions kept per queue handle
const ACTION_LOG_LIMIT: usize = 60;
const DEFAULT_DFPS_INTERVAL_MS: u32 = 1000;
const PUT_POLL_INTERVAL: Duration = Duration::from_millis(100);
const GET_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Errors that can occur during queue operations
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Queue full: frame needs {needed} bytes, {free} free")]
    CapacityExceeded { needed: usize, free: usize },

    #[error("Timed out after {waited:?} waiting for lock '{name}'")]
    LockTimeout { name: String, waited: Duration },

    #[error("Integrity failure on queue '{queue}': {reason}")]
    Integrity { queue: String, reason: String },

    #[error("Timed out after {waited:?} on queue '{queue}'")]
    Timeout { queue: String, waited: Duration },

    #[error("Queue size {size} is invalid (min {min}, must fit in u32)")]
    InvalidSize { size: usize, min: usize },

    #[error("Segment '{name}' is {actual} bytes, expected at least {expected}")]
    SegmentMismatch {
        name: String,
        expected: usize,
        actual: usize,
    },

    #[error("Access of {len} bytes at {offset} outside segment of {size} bytes")]
    OutOfBounds {
        offset: usize,
        len: usize,
        size: usize,
    },

    #[error("Shared memory error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
}

impl QueueError {
    /// Errors after which the queue must not be used again
    pub fn is_fatal(&self) -> bool {
        matches!(self, QueueError::Integrity { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueActionKind {
    Enqueue,
    Dequeue,
}

/// One entry of the per-handle action log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueAction {
    pub kind: QueueActionKind,
    pub sequence: u32,
    pub size: u32,
    pub alloc_index: u32,
    pub exe_index: u32,
    pub at: DateTime<Utc>,
}

/// Point-in-time view of a queue's header
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStats {
    pub q_id: String,
    pub size: usize,
    pub free_space: usize,
    pub occupancy: f64,
    pub alloc_index: u32,
    pub exe_index: u32,
    pub alloc_counter: u32,
    pub exe_counter: u32,
    pub pending: u32,
    pub dfps_in: f64,
    pub dfps_out: f64,
}

#[derive(Clone, Copy)]
enum LockKind {
    Read,
    Write,
}

/// Lock plus the header word that records its holder
struct HeldLock<'a> {
    holder: &'a AtomicU32,
    _guard: LockGuard,
}

impl Drop for HeldLock<'_> {
    fn drop(&mut self) {
        self.holder.store(0, Ordering::Release);
    }
}

/// One data edge backed by a shared-memory segment
pub struct RingQueue {
    id: String,
    segment: Segment,
    space: Arc<SegmentSpace>,
    codec: FrameCodec,
    read_lock: String,
    write_lock: String,
    actions: Mutex<VecDeque<QueueAction>>,
}

impl RingQueue {
    pub fn segment_name(id: &str) -> String {
        format!("Q_{}", id)
    }

    pub fn read_lock_name(id: &str) -> String {
        format!("Q_{}_rlock", id)
    }

    pub fn write_lock_name(id: &str) -> String {
        format!("Q_{}_wlock", id)
    }

    fn check_size(size: usize) -> Result<(), QueueError> {
        if size < MIN_QUEUE_SIZE || size > u32::MAX as usize {
            return Err(QueueError::InvalidSize {
                size,
                min: MIN_QUEUE_SIZE,
            });
        }
        Ok(())
    }

    /// Open the queue for edge `id`, creating its segment on first use
    pub fn open(
        space: Arc<SegmentSpace>,
        id: &str,
        size: usize,
        codec: FrameCodec,
    ) -> Result<Self, QueueError> {
        Self::check_size(size)?;
        let segment = space.open_segment(&Self::segment_name(id), size)?;
        Self::from_segment(space, id, segment, codec)
    }

    /// Create an empty queue for edge `id`, discarding whatever an earlier
    /// run left under the same name
    pub fn create(
        space: Arc<SegmentSpace>,
        id: &str,
        size: usize,
        codec: FrameCodec,
    ) -> Result<Self, QueueError> {
        Self::check_size(size)?;
        let segment = space.create_segment(&Self::segment_name(id), size)?;
        Self::from_segment(space, id, segment, codec)
    }

    /// Unlink the segment and lock markers of edge `id`
    ///
    /// Open handles keep working on the unlinked memory; later opens start over.
    pub fn remove(space: &SegmentSpace, id: &str) -> Result<(), QueueError> {
        space.remove_segment(&Self::segment_name(id))?;
        space.clear_lock(&Self::read_lock_name(id))?;
        space.clear_lock(&Self::write_lock_name(id))?;
        debug!("Removed queue '{}'", id);
        Ok(())
    }

    fn from_segment(
        space: Arc<SegmentSpace>,
        id: &str,
        segment: Segment,
        codec: FrameCodec,
    ) -> Result<Self, QueueError> {
        let queue = Self {
            id: id.to_string(),
            segment,
            read_lock: Self::read_lock_name(id),
            write_lock: Self::write_lock_name(id),
            space,
            codec,
            actions: Mutex::new(VecDeque::with_capacity(ACTION_LOG_LIMIT)),
        };

        if queue.segment.created() {
            // Markers left by a previous run of the same edge
            queue.space.clear_lock(&queue.read_lock)?;
            queue.space.clear_lock(&queue.write_lock)?;
            queue.initialise();
        } else {
            // The creator publishes MAGIC last
            let magic = queue.word(offset::MAGIC);
            if !queue
                .space
                .wait_attached(|| magic.load(Ordering::Acquire) == QUEUE_MAGIC)
            {
                return Err(QueueError::Integrity {
                    queue: id.to_string(),
                    reason: "segment exists but was never initialised as a queue".to_string(),
                });
            }
        }

        Ok(queue)
    }

    fn initialise(&self) {
        let start = DATA_START as u32;
        self.word(offset::ALLOC_INDEX).store(start, Ordering::Relaxed);
        self.word(offset::EXE_INDEX).store(start, Ordering::Relaxed);
        self.word(offset::STATUS)
            .store(QueueStatus::Open as u32, Ordering::Relaxed);
        self.word(offset::DFPS_INTERVAL_MS)
            .store(DEFAULT_DFPS_INTERVAL_MS, Ordering::Relaxed);
        self.segment
            .u64_at(offset::DFPS_LAST_TIME_MS)
            .store(now_ms(), Ordering::Relaxed);
        self.word(offset::MAGIC).store(QUEUE_MAGIC, Ordering::Release);
        debug!("Initialised queue '{}' ({} bytes)", self.id, self.size());
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Window between throughput snapshots, shared by every handle
    pub fn set_dfps_interval(&self, interval_ms: u32) {
        self.word(offset::DFPS_INTERVAL_MS)
            .store(interval_ms.max(1), Ordering::Release);
    }

    pub fn codec(&self) -> &FrameCodec {
        &self.codec
    }

    /// Total segment size including the control header
    pub fn size(&self) -> usize {
        self.segment.len()
    }

    pub fn data_size(&self) -> usize {
        self.size() - DATA_START
    }

    fn word(&self, at: usize) -> &AtomicU32 {
        self.segment.u32_at(at)
    }

    pub fn alloc_counter(&self) -> u32 {
        self.word(offset::ALLOC_COUNTER).load(Ordering::Acquire)
    }

    pub fn exe_counter(&self) -> u32 {
        self.word(offset::EXE_COUNTER).load(Ordering::Acquire)
    }

    pub fn alloc_index(&self) -> u32 {
        self.word(offset::ALLOC_INDEX).load(Ordering::Acquire)
    }

    pub fn exe_index(&self) -> u32 {
        self.word(offset::EXE_INDEX).load(Ordering::Acquire)
    }

    /// Frames written but not yet consumed
    pub fn pending(&self) -> u32 {
        self.alloc_counter().wrapping_sub(self.exe_counter())
    }

    pub fn status(&self) -> QueueStatus {
        match self.word(offset::STATUS).load(Ordering::Acquire) {
            s if s == QueueStatus::Open as u32 => QueueStatus::Open,
            _ => QueueStatus::Broken,
        }
    }

    pub fn is_broken(&self) -> bool {
        self.status() == QueueStatus::Broken
    }

    /// Bytes of the data region not holding unconsumed frames
    pub fn free_space(&self) -> usize {
        let data_size = self.data_size();
        if self.pending() == 0 {
            return data_size;
        }
        let alloc = self.alloc_index() as usize;
        let exe = self.exe_index() as usize;
        match alloc.cmp(&exe) {
            std::cmp::Ordering::Less => exe - alloc,
            std::cmp::Ordering::Greater => data_size - (alloc - exe),
            // Equal indices with frames pending: the ring is exactly full
            std::cmp::Ordering::Equal => 0,
        }
    }

    /// Share of the whole segment occupied by unconsumed frames
    pub fn occupancy(&self) -> f64 {
        (self.data_size() - self.free_space()) as f64 / self.size() as f64
    }

    fn ensure_open(&self) -> Result<(), QueueError> {
        if self.is_broken() {
            return Err(QueueError::Integrity {
                queue: self.id.clone(),
                reason: "queue was marked broken by an earlier failure".to_string(),
            });
        }
        Ok(())
    }

    fn check_capacity(&self, frame_size: usize) -> Result<(), QueueError> {
        let free = self.free_space();
        if self.occupancy() > MAX_OCCUPANCY || frame_size > free {
            return Err(QueueError::CapacityExceeded {
                needed: frame_size,
                free,
            });
        }
        Ok(())
    }

    /// Side-effect free check that `frame` would currently be accepted
    pub fn space_available(&self, frame: &Frame) -> Result<bool, QueueError> {
        let body = self.codec.encode_frame(frame)?;
        Ok(self.check_capacity(FRAME_HEADER_SIZE + body.len()).is_ok())
    }

    /// Put a frame, returning `false` without side effects when it does not fit
    pub fn put(&self, frame: &Frame) -> Result<bool, QueueError> {
        match self.try_put(frame) {
            Ok(()) => Ok(true),
            Err(QueueError::CapacityExceeded { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Like [`RingQueue::put`], but reports a full queue as `CapacityExceeded`
    pub fn try_put(&self, frame: &Frame) -> Result<(), QueueError> {
        self.ensure_open()?;
        let body = self.codec.encode_frame(frame)?;
        self.put_encoded(&body)
    }

    /// Put, polling for space until `timeout` elapses
    pub fn put_sync(&self, frame: &Frame, timeout: Duration) -> Result<(), QueueError> {
        self.ensure_open()?;
        let body = self.codec.encode_frame(frame)?;
        let started = Instant::now();
        loop {
            match self.put_encoded(&body) {
                Err(QueueError::CapacityExceeded { .. }) => {}
                other => return other,
            }
            let waited = started.elapsed();
            if waited >= timeout {
                return Err(QueueError::Timeout {
                    queue: self.id.clone(),
                    waited,
                });
            }
            std::thread::sleep(PUT_POLL_INTERVAL.min(timeout - waited));
        }
    }

    fn put_encoded(&self, body: &[u8]) -> Result<(), QueueError> {
        let frame_size = FRAME_HEADER_SIZE + body.len();
        self.check_capacity(frame_size)?;

        let _lock = self.hold(LockKind::Write)?;
        self.check_capacity(frame_size)?;

        let sequence = self.word(offset::SEQUENCE).fetch_add(1, Ordering::AcqRel);
        let header = FrameHeader::new(frame_size as u32, CRC32.checksum(body), sequence);

        let alloc = self.checked_index(offset::ALLOC_INDEX)?;
        let body_at = self.write_wrapped(alloc, &header.to_bytes())?;
        let next = self.write_wrapped(body_at, body)?;

        self.word(offset::ALLOC_INDEX)
            .store(next as u32, Ordering::Release);
        if next <= alloc {
            self.word(offset::DIRECTION).fetch_xor(1, Ordering::AcqRel);
        }
        self.word(offset::ALLOC_COUNTER)
            .fetch_add(1, Ordering::Release);

        self.refresh_dfps();
        self.record(QueueActionKind::Enqueue, sequence, frame_size as u32);
        Ok(())
    }

    /// Take the oldest frame, or `None` if nothing is visible yet
    pub fn get(&self) -> Result<Option<Frame>, QueueError> {
        self.ensure_open()?;
        if self.pending() == 0 {
            return Ok(None);
        }

        let _lock = self.hold(LockKind::Read)?;
        if self.pending() == 0 {
            return Ok(None);
        }

        let exe = self.checked_index(offset::EXE_INDEX)?;
        let (raw, body_at) = self.read_wrapped(exe, FRAME_HEADER_SIZE)?;
        let mut header_bytes = [0u8; FRAME_HEADER_SIZE];
        header_bytes.copy_from_slice(&raw);
        let header = FrameHeader::from_bytes(&header_bytes);

        if header.status() != Some(FrameStatus::Created) {
            return Ok(None);
        }
        if !header.has_watermark() {
            return Err(self.corrupted(format!("watermark mismatch at offset {}", exe)));
        }
        let frame_size = header.size as usize;
        if frame_size <= FRAME_HEADER_SIZE || frame_size > self.data_size() {
            return Err(self.corrupted(format!(
                "frame {} declares impossible size {}",
                header.sequence, frame_size
            )));
        }

        let (body, next) = self.read_wrapped(body_at, frame_size - FRAME_HEADER_SIZE)?;
        self.zero_wrapped(exe, frame_size)?;
        self.word(offset::EXE_INDEX)
            .store(next as u32, Ordering::Release);

        if CRC32.checksum(&body) != header.crc {
            return Err(self.corrupted(format!("CRC mismatch on frame {}", header.sequence)));
        }

        // Counted before decoding so an undecodable frame cannot wedge the ring
        self.word(offset::EXE_COUNTER).fetch_add(1, Ordering::Release);
        self.refresh_dfps();
        self.record(QueueActionKind::Dequeue, header.sequence, header.size);

        Ok(Some(self.codec.decode_frame(&body)?))
    }

    /// Get, polling until a frame arrives or `timeout` elapses
    pub fn get_sync(&self, timeout: Duration) -> Result<Frame, QueueError> {
        let started = Instant::now();
        loop {
            if let Some(frame) = self.get()? {
                return Ok(frame);
            }
            let waited = started.elapsed();
            if waited >= timeout {
                return Err(QueueError::Timeout {
                    queue: self.id.clone(),
                    waited,
                });
            }
            std::thread::sleep(GET_POLL_INTERVAL.min(timeout - waited));
        }
    }

    fn hold(&self, kind: LockKind) -> Result<HeldLock<'_>, QueueError> {
        let (name, at) = match kind {
            LockKind::Read => (&self.read_lock, offset::READ_LOCK),
            LockKind::Write => (&self.write_lock, offset::WRITE_LOCK),
        };
        let guard = self.space.acquire_lock(name)?;
        let holder = self.word(at);
        holder.store(std::process::id(), Ordering::Release);
        Ok(HeldLock {
            holder,
            _guard: guard,
        })
    }

    fn corrupted(&self, reason: String) -> QueueError {
        self.word(offset::STATUS)
            .store(QueueStatus::Broken as u32, Ordering::Release);
        error!("Queue '{}' corrupted: {}", self.id, reason);
        QueueError::Integrity {
            queue: self.id.clone(),
            reason,
        }
    }

    fn checked_index(&self, at: usize) -> Result<usize, QueueError> {
        let index = self.word(at).load(Ordering::Acquire) as usize;
        if index < DATA_START || index >= self.size() {
            return Err(self.corrupted(format!("index {} outside data region", index)));
        }
        Ok(index)
    }

    /// Write at `pos`, continuing at the data start when the end is reached.
    /// Returns the position after the last byte.
    fn write_wrapped(&self, pos: usize, data: &[u8]) -> Result<usize, QueueError> {
        let end_space = self.size() - pos;
        if data.len() < end_space {
            self.segment.write(pos, data)?;
            return Ok(pos + data.len());
        }
        let (head, tail) = data.split_at(end_space);
        self.segment.write(pos, head)?;
        self.segment.write(DATA_START, tail)?;
        Ok(DATA_START + tail.len())
    }

    fn read_wrapped(&self, pos: usize, len: usize) -> Result<(Vec<u8>, usize), QueueError> {
        let mut out = vec![0u8; len];
        let end_space = self.size() - pos;
        if len < end_space {
            self.segment.read(pos, &mut out)?;
            return Ok((out, pos + len));
        }
        let (head, tail) = out.split_at_mut(end_space);
        self.segment.read(pos, head)?;
        self.segment.read(DATA_START, tail)?;
        let next = DATA_START + tail.len();
        Ok((out, next))
    }

    fn zero_wrapped(&self, pos: usize, len: usize) -> Result<(), QueueError> {
        let end_space = self.size() - pos;
        if len < end_space {
            return self.segment.zero(pos, len);
        }
        self.segment.zero(pos, end_space)?;
        self.segment.zero(DATA_START, len - end_space)
    }

    fn refresh_dfps(&self) {
        let now = now_ms();
        let last = self.segment.u64_at(offset::DFPS_LAST_TIME_MS);
        let interval = self.word(offset::DFPS_INTERVAL_MS).load(Ordering::Relaxed) as u64;
        if now.saturating_sub(last.load(Ordering::Acquire)) >= interval {
            self.word(offset::DFPS_LAST_ALLOC)
                .store(self.alloc_counter(), Ordering::Release);
            self.word(offset::DFPS_LAST_EXE)
                .store(self.exe_counter(), Ordering::Release);
            last.store(now, Ordering::Release);
        }
    }

    fn rate_since_snapshot(&self, current: u32, snapshot_at: usize) -> f64 {
        let last = self
            .segment
            .u64_at(offset::DFPS_LAST_TIME_MS)
            .load(Ordering::Acquire);
        let elapsed = now_ms().saturating_sub(last) as f64 / 1000.0;
        if elapsed <= 0.0 {
            return 0.0;
        }
        let base = self.word(snapshot_at).load(Ordering::Acquire);
        current.wrapping_sub(base) as f64 / elapsed
    }

    /// Frames per second written since the last throughput snapshot
    pub fn dfps_in(&self) -> f64 {
        self.rate_since_snapshot(self.alloc_counter(), offset::DFPS_LAST_ALLOC)
    }

    /// Frames per second consumed since the last throughput snapshot
    pub fn dfps_out(&self) -> f64 {
        self.rate_since_snapshot(self.exe_counter(), offset::DFPS_LAST_EXE)
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            q_id: self.id.clone(),
            size: self.size(),
            free_space: self.free_space(),
            occupancy: self.occupancy(),
            alloc_index: self.alloc_index(),
            exe_index: self.exe_index(),
            alloc_counter: self.alloc_counter(),
            exe_counter: self.exe_counter(),
            pending: self.pending(),
            dfps_in: self.dfps_in(),
            dfps_out: self.dfps_out(),
        }
    }

    fn record(&self, kind: QueueActionKind, sequence: u32, size: u32) {
        let mut actions = self.actions.lock();
        if actions.len() == ACTION_LOG_LIMIT {
            actions.pop_front();
        }
        actions.push_back(QueueAction {
            kind,
            sequence,
            size,
            alloc_index: self.alloc_index(),
            exe_index: self.exe_index(),
            at: Utc::now(),
        });
    }

    /// Actions performed through this handle, oldest first
    pub fn recent_actions(&self) -> Vec<QueueAction> {
        self.actions.lock().iter().cloned().collect()
    }
}

impl std::fmt::Debug for RingQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingQueue")
            .field("id", &self.id)
            .field("size", &self.size())
            .field("pending", &self.pending())
            .finish()
    }
}

pub(crate) fn now_ms() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}
