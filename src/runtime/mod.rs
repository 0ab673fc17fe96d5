//! Orchestration of stage processes
//!
//! Control flows top-down through this module:
//! - [`NodeManager`]: per-host supervisor, periodic tick and autoscaling
//! - [`PipeController`]: one loaded pipeline and its state machine
//! - [`StageController`]: all instances of one stage
//! - [`StageInstance`]: one child process or in-process worker
//!
//! Data never flows through here; stages exchange frames over ring queues
//! via their [`StageEndpoint`].

pub mod autoscaler;
pub mod endpoint;
pub mod instance;
pub mod node;
pub mod pipe;
pub mod stage;
pub mod worker;

pub use autoscaler::{
    evaluate_scaling, AutoscalerState, ScalingDecision, ScalingInputs, UtilizationHistory,
    UtilizationSample, WeightedUtilization,
};
pub use endpoint::StageEndpoint;
pub use instance::{InstanceKind, InstanceState, LaunchError, StageInstance};
pub use node::{spawn_node_manager, NodeManager};
pub use pipe::PipeController;
pub use stage::{StageController, StageStatus, StageUsage};
pub use worker::{WorkerFn, WorkerRegistry};

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::codec::{CodecError, FrameCodec};
use crate::config::{NodeConfig, TopologyError};
use crate::protocol::PipeStatus;
use crate::queue::{QueueError, SegmentSpace};

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Pipeline '{0}' is already loaded")]
    PipelineAlreadyExists(String),

    #[error("Pipeline '{0}' not found")]
    PipelineNotFound(String),

    #[error("Stage '{stage}' not found in pipeline '{pipe}'")]
    StageNotFound { pipe: String, stage: String },

    #[error("Instance {instance_id} of stage '{stage}' not found")]
    InstanceNotFound { stage: String, instance_id: u32 },

    #[error("Stage '{0}' has no launched instance awaiting registration")]
    NoPendingInstance(String),

    #[error("Cannot {action} pipeline in state {from:?}")]
    InvalidStateTransition {
        from: PipeStatus,
        action: &'static str,
    },

    #[error("Pipeline '{0}' has no input edge")]
    NoInputEdge(String),

    #[error("Pipeline '{0}' has no sink queue")]
    NoSink(String),

    #[error("Launch error: {0}")]
    Launch(#[from] LaunchError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Topology error: {0}")]
    Topology(#[from] TopologyError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
}

/// Shared handles every controller needs
#[derive(Clone)]
pub struct RuntimeContext {
    pub space: Arc<SegmentSpace>,
    pub codec: FrameCodec,
    pub workers: Arc<WorkerRegistry>,
    pub node_id: String,
    pub monitor_interval: Duration,
    pub dfps_interval_ms: u32,
    pub stage_usage_log_limit: usize,
}

impl RuntimeContext {
    pub fn new(config: &NodeConfig, workers: Arc<WorkerRegistry>) -> Self {
        Self {
            space: Arc::new(config.segment_space()),
            codec: FrameCodec::new(),
            workers,
            node_id: config.node_id.clone(),
            monitor_interval: config.monitor_interval(),
            dfps_interval_ms: config.dfps_interval_ms,
            stage_usage_log_limit: config.stage_usage_log_limit,
        }
    }

    pub fn with_codec(mut self, codec: FrameCodec) -> Self {
        self.codec = codec;
        self
    }
}
