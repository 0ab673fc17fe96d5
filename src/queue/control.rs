//! Small bookkeeping segments shared between node and stage processes
//!
//! - `stage_control:<stage>`: per-stage instance id counter
//! - `node_status`: node-wide liveness and tick bookkeeping

use std::sync::atomic::Ordering;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{now_ms, QueueError, Segment, SegmentSpace};

const STAGE_CONTROL_SIZE: usize = 64;
const NODE_STATUS_SIZE: usize = 4096;

mod stage_offset {
    pub const LAST_INSTANCE_ID: usize = 4;
}

mod node_offset {
    pub const NODE_PID: usize = 0;
    pub const LIVE_PIPES: usize = 4;
    pub const TICKS: usize = 8;
    pub const LAST_TICK_MS: usize = 16;
}

/// Per-stage counter handing out instance ids
pub struct StageControlBlock {
    segment: Segment,
}

impl StageControlBlock {
    pub fn segment_name(stage: &str) -> String {
        format!("stage_control:{}", stage)
    }

    pub fn open(space: &Arc<SegmentSpace>, stage: &str) -> Result<Self, QueueError> {
        let segment = space.open_segment(&Self::segment_name(stage), STAGE_CONTROL_SIZE)?;
        Ok(Self { segment })
    }

    /// Next id for this stage; ids start at 1 and are never reused
    pub fn allocate_instance_id(&self) -> u32 {
        self.segment
            .u32_at(stage_offset::LAST_INSTANCE_ID)
            .fetch_add(1, Ordering::AcqRel)
            + 1
    }

    pub fn last_instance_id(&self) -> u32 {
        self.segment
            .u32_at(stage_offset::LAST_INSTANCE_ID)
            .load(Ordering::Acquire)
    }
}

/// Snapshot of the node status block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatusSnapshot {
    pub node_pid: u32,
    pub live_pipes: u32,
    pub ticks: u64,
    pub last_tick_ms: u64,
}

/// Node-wide bookkeeping readable by any process on the host
pub struct NodeStatusBlock {
    segment: Segment,
}

impl NodeStatusBlock {
    pub const SEGMENT_NAME: &'static str = "node_status";

    pub fn open(space: &Arc<SegmentSpace>) -> Result<Self, QueueError> {
        let segment = space.open_segment(Self::SEGMENT_NAME, NODE_STATUS_SIZE)?;
        segment
            .u32_at(node_offset::NODE_PID)
            .store(std::process::id(), Ordering::Release);
        Ok(Self { segment })
    }

    pub fn record_tick(&self, live_pipes: u32) {
        self.segment
            .u32_at(node_offset::LIVE_PIPES)
            .store(live_pipes, Ordering::Release);
        self.segment
            .u64_at(node_offset::TICKS)
            .fetch_add(1, Ordering::AcqRel);
        self.segment
            .u64_at(node_offset::LAST_TICK_MS)
            .store(now_ms(), Ordering::Release);
    }

    pub fn snapshot(&self) -> NodeStatusSnapshot {
        NodeStatusSnapshot {
            node_pid: self
                .segment
                .u32_at(node_offset::NODE_PID)
                .load(Ordering::Acquire),
            live_pipes: self
                .segment
                .u32_at(node_offset::LIVE_PIPES)
                .load(Ordering::Acquire),
            ticks: self.segment.u64_at(node_offset::TICKS).load(Ordering::Acquire),
            last_tick_ms: self
                .segment
                .u64_at(node_offset::LAST_TICK_MS)
                .load(Ordering::Acquire),
        }
    }
}
