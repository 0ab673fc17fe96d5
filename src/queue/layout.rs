//! Fixed byte layout of a ring queue segment
//!
//! ```text
//! [0, 64)        control header (atomic words)
//! [64, size)     data region: {[frame header:32][frame body]}*
//! ```

/// Size of the control header at the start of every queue segment
pub const CONTROL_SIZE: usize = 64;
/// First byte of the data region
pub const DATA_START: usize = CONTROL_SIZE;
/// Size of the header in front of every frame body
pub const FRAME_HEADER_SIZE: usize = 32;
/// Smallest segment that can hold one non-empty frame
pub const MIN_QUEUE_SIZE: usize = CONTROL_SIZE + FRAME_HEADER_SIZE + 1;

/// Guard bytes written into every frame header
pub const WATERMARK: [u8; 8] = *b"shmflow!";
/// Written last when a creator finishes initialising the header
pub const QUEUE_MAGIC: u32 = 0x5146_4d53;

/// Reject puts once occupied bytes exceed this share of the segment
pub const MAX_OCCUPANCY: f64 = 0.90;

/// Control header word offsets
pub mod offset {
    pub const READ_LOCK: usize = 0;
    pub const WRITE_LOCK: usize = 4;
    pub const STATUS: usize = 8;
    pub const DIRECTION: usize = 12;
    pub const ALLOC_INDEX: usize = 16;
    pub const EXE_INDEX: usize = 20;
    pub const ALLOC_COUNTER: usize = 24;
    pub const EXE_COUNTER: usize = 28;
    pub const DFPS_INTERVAL_MS: usize = 32;
    pub const DFPS_LAST_ALLOC: usize = 36;
    pub const DFPS_LAST_EXE: usize = 40;
    pub const MAGIC: usize = 44;
    pub const DFPS_LAST_TIME_MS: usize = 48;
    pub const SEQUENCE: usize = 56;
}

/// Queue-wide status word
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum QueueStatus {
    Open = 1,
    /// An integrity check failed; the queue must not be used again
    Broken = 2,
}

/// Per-frame status byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameStatus {
    Available = 0,
    Created = 1,
    Executing = 2,
    Retired = 3,
}

impl FrameStatus {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(FrameStatus::Available),
            1 => Some(FrameStatus::Created),
            2 => Some(FrameStatus::Executing),
            3 => Some(FrameStatus::Retired),
            _ => None,
        }
    }
}

/// Message type of a frame body encoded by [`crate::codec::FrameCodec`]
pub const FRAME_MESSAGE_TYPE: u8 = 1;

/// Header preceding each frame body in the data region
///
/// `[status:1][type:1][size:4][watermark:8][crc32:4][sequence:4][pad:10]`;
/// `size` covers header and body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub status: u8,
    pub message_type: u8,
    pub size: u32,
    pub watermark: [u8; 8],
    pub crc: u32,
    pub sequence: u32,
}

impl FrameHeader {
    pub fn new(size: u32, crc: u32, sequence: u32) -> Self {
        Self {
            status: FrameStatus::Created as u8,
            message_type: FRAME_MESSAGE_TYPE,
            size,
            watermark: WATERMARK,
            crc,
            sequence,
        }
    }

    pub fn to_bytes(&self) -> [u8; FRAME_HEADER_SIZE] {
        let mut out = [0u8; FRAME_HEADER_SIZE];
        out[0] = self.status;
        out[1] = self.message_type;
        out[2..6].copy_from_slice(&self.size.to_le_bytes());
        out[6..14].copy_from_slice(&self.watermark);
        out[14..18].copy_from_slice(&self.crc.to_le_bytes());
        out[18..22].copy_from_slice(&self.sequence.to_le_bytes());
        out
    }

    pub fn from_bytes(raw: &[u8; FRAME_HEADER_SIZE]) -> Self {
        let word = |at: usize| u32::from_le_bytes([raw[at], raw[at + 1], raw[at + 2], raw[at + 3]]);
        let mut watermark = [0u8; 8];
        watermark.copy_from_slice(&raw[6..14]);
        Self {
            status: raw[0],
            message_type: raw[1],
            size: word(2),
            watermark,
            crc: word(14),
            sequence: word(18),
        }
    }

    pub fn status(&self) -> Option<FrameStatus> {
        FrameStatus::from_u8(self.status)
    }

    pub fn has_watermark(&self) -> bool {
        self.watermark == WATERMARK
    }
}
