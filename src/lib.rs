//! shmflow: multi-process dataflow pipelines over shared-memory ring queues
//!
//! - [`codec`]: binary frame encoding
//! - [`queue`]: ring queues and the other shared-memory blocks
//! - [`protocol`]: control messages and the registration contract
//! - [`config`]: node settings and topology descriptors
//! - [`runtime`]: stage instances, stage/pipe controllers and the node manager
//! - [`metrics`]: host and process sampling

pub mod cli;
pub mod codec;
pub mod config;
pub mod metrics;
pub mod protocol;
pub mod queue;
pub mod runtime;
