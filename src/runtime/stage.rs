//! Per-stage instance management
//!
//! A [`StageController`] owns every instance of one stage, hands out
//! instance ids, answers registrations and turns the backlog on its inbound
//! queues into a scale-up signal.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use super::endpoint::StageEndpoint;
use super::instance::{InstanceState, LaunchError, StageInstance};
use super::{RuntimeContext, RuntimeError};
use crate::config::StageDescriptor;
use crate::metrics::ResourceSample;
use crate::protocol::{
    ControlMessage, MessageKind, QueueUpdate, RegistrationResponse, Scope, StageRef,
};
use crate::queue::{RingQueue, StageControlBlock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageStatus {
    Init,
    Running,
    PendingTermination,
    Completed,
}

/// One utilization sample of a stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageUsage {
    pub cpu: f64,
    pub memory: f64,
    pub pending: u64,
    pub instances: usize,
    pub at: DateTime<Utc>,
}

pub struct StageController {
    pipe_id: String,
    descriptor: StageDescriptor,
    ctx: RuntimeContext,
    inbound: Vec<Arc<RingQueue>>,
    update: QueueUpdate,
    control_block: StageControlBlock,
    instances: Vec<StageInstance>,
    status: StageStatus,
    last_error: Option<String>,
    usage_log: VecDeque<StageUsage>,
}

impl StageController {
    pub fn new(
        pipe_id: &str,
        descriptor: StageDescriptor,
        ctx: RuntimeContext,
        inbound: Vec<Arc<RingQueue>>,
        update: QueueUpdate,
    ) -> Result<Self, RuntimeError> {
        let control_block = StageControlBlock::open(&ctx.space, descriptor.display_name())?;
        Ok(Self {
            pipe_id: pipe_id.to_string(),
            descriptor,
            ctx,
            inbound,
            update,
            control_block,
            instances: Vec::new(),
            status: StageStatus::Init,
            last_error: None,
            usage_log: VecDeque::new(),
        })
    }

    pub fn id(&self) -> &str {
        &self.descriptor.id
    }

    pub fn descriptor(&self) -> &StageDescriptor {
        &self.descriptor
    }

    pub fn status(&self) -> StageStatus {
        self.status
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn is_runnable(&self) -> bool {
        self.descriptor.is_runnable()
    }

    pub fn instances(&self) -> &[StageInstance] {
        &self.instances
    }

    pub fn live_instances(&self) -> usize {
        self.instances.iter().filter(|i| i.is_live()).count()
    }

    /// Live instances not already asked to stop
    pub fn active_instances(&self) -> usize {
        self.instances
            .iter()
            .filter(|i| {
                matches!(
                    i.state(),
                    InstanceState::Launched | InstanceState::Ready | InstanceState::Running
                )
            })
            .count()
    }

    /// Instances that may still be launched under the autoscale ceiling
    pub fn available_instances(&self) -> u32 {
        let available = self.descriptor.settings.autoscale as i64 - self.live_instances() as i64;
        assert!(
            available >= 0,
            "stage '{}' runs {} instances over a ceiling of {}",
            self.id(),
            self.live_instances(),
            self.descriptor.settings.autoscale
        );
        available as u32
    }

    /// Backlog over all inbound queues
    pub fn pending(&self) -> u64 {
        self.inbound.iter().map(|q| q.pending() as u64).sum()
    }

    /// An instance is starting up or being retired
    pub fn is_scaling(&self) -> bool {
        self.instances
            .iter()
            .any(|i| i.state() == InstanceState::Launched || i.is_scaling_down())
    }

    fn stage_ref(&self) -> StageRef {
        StageRef::new(self.pipe_id.clone(), self.descriptor.id.clone())
    }

    fn registration_messages(&self, instance_id: u32) -> Vec<ControlMessage> {
        let dest = self.descriptor.id.clone();
        vec![
            ControlMessage::new(
                dest.clone(),
                self.ctx.node_id.clone(),
                Scope::StageInstance,
                MessageKind::RegistrationInfo { instance_id },
            ),
            ControlMessage::new(
                dest,
                self.ctx.node_id.clone(),
                Scope::Stage,
                MessageKind::QUpdate(self.update.clone()),
            ),
        ]
    }

    /// Start one more instance if the ceiling allows.
    ///
    /// Workers are registered on the spot; child processes stay LAUNCHED
    /// until they call back with [`StageController::register_instance`].
    pub fn launch_instance(&mut self) -> Result<bool, RuntimeError> {
        if !self.is_runnable() {
            return Err(LaunchError::NoEntry(self.id().to_string()).into());
        }
        if self.available_instances() == 0 {
            warn!("Stage '{}' is already at its instance ceiling", self.id());
            return Ok(false);
        }

        let instance = match &self.descriptor.function {
            Some(function) if self.descriptor.entry.is_none() => {
                let worker = self.ctx.workers.get(function).ok_or_else(|| {
                    LaunchError::UnknownFunction {
                        stage: self.id().to_string(),
                        function: function.clone(),
                    }
                })?;

                let instance_id = self.control_block.allocate_instance_id();
                let (tx, rx) = crossbeam_channel::unbounded();
                for msg in self.registration_messages(instance_id) {
                    tx.send(msg).ok();
                }
                let endpoint = StageEndpoint::new(
                    self.stage_ref(),
                    self.ctx.space.clone(),
                    self.ctx.codec.clone(),
                    rx,
                )
                .with_config(self.descriptor.config.clone());

                let mut instance = StageInstance::spawn_worker(&self.descriptor, worker, endpoint)?;
                instance.register(instance_id, std::process::id());
                instance.attach_control(tx);
                instance
            }
            _ => StageInstance::spawn_process(
                &self.descriptor,
                &self.pipe_id,
                self.ctx.space.root(),
                self.ctx.monitor_interval,
            )?,
        };

        info!(
            "Launched {:?} instance of stage '{}' ({}/{})",
            instance.kind(),
            self.id(),
            self.live_instances() + 1,
            self.descriptor.settings.autoscale
        );
        self.instances.push(instance);
        if self.status == StageStatus::Init || self.status == StageStatus::Completed {
            self.status = StageStatus::Running;
        }
        Ok(true)
    }

    /// Registration handshake from a launched child process
    pub fn register_instance(&mut self, pid: u32) -> Result<RegistrationResponse, RuntimeError> {
        let index = self
            .instances
            .iter()
            .position(|i| i.state() == InstanceState::Launched && i.child_pid() == Some(pid))
            .or_else(|| {
                self.instances
                    .iter()
                    .position(|i| i.state() == InstanceState::Launched)
            })
            .ok_or_else(|| RuntimeError::NoPendingInstance(self.id().to_string()))?;

        let instance_id = self.control_block.allocate_instance_id();
        self.instances[index].register(instance_id, pid);
        info!(
            "Registered instance {} of stage '{}' (pid {})",
            instance_id,
            self.id(),
            pid
        );

        Ok(RegistrationResponse {
            instance_id,
            config: self.descriptor.config.clone(),
            messages: self.registration_messages(instance_id),
        })
    }

    /// Connect a registered instance's control channel
    pub fn attach_control(
        &mut self,
        instance_id: u32,
        control: Sender<ControlMessage>,
    ) -> Result<(), RuntimeError> {
        let stage = self.id().to_string();
        let instance = self
            .instances
            .iter_mut()
            .find(|i| i.instance_id() == Some(instance_id))
            .ok_or(RuntimeError::InstanceNotFound { stage, instance_id })?;
        instance.attach_control(control);
        Ok(())
    }

    /// Forward `msg` to every live instance
    pub fn broadcast(&mut self, msg: &ControlMessage) {
        for instance in self.instances.iter_mut().filter(|i| i.is_live()) {
            instance.send(msg.clone());
        }
    }

    /// Ask every live instance to finish
    pub fn request_termination(&mut self) {
        let node_id = self.ctx.node_id.clone();
        for instance in self.instances.iter_mut() {
            instance.request_termination(&node_id);
        }
        self.status = if self.live_instances() == 0 {
            StageStatus::Completed
        } else {
            StageStatus::PendingTermination
        };
        info!("Requested termination of stage '{}'", self.id());
    }

    /// Retire the newest running instance, keeping at least one
    pub fn scale_down(&mut self) -> bool {
        if self.active_instances() <= 1 {
            return false;
        }
        let node_id = self.ctx.node_id.clone();
        let candidate = self.instances.iter_mut().rev().find(|i| {
            matches!(i.state(), InstanceState::Running | InstanceState::Ready)
        });
        match candidate {
            Some(instance) => {
                instance.mark_scaling_down();
                instance.request_termination(&node_id);
                info!(
                    "Scaling down stage '{}' (instance {:?})",
                    self.descriptor.id,
                    instance.instance_id()
                );
                true
            }
            None => false,
        }
    }

    /// Collect exit codes and drop finished instances. Returns how many exited.
    pub fn reap(&mut self) -> usize {
        let mut exited = Vec::new();
        for instance in self.instances.iter_mut() {
            if let Some(code) = instance.check_exit() {
                exited.push((instance.instance_id(), code));
            }
        }
        self.instances.retain(StageInstance::is_live);

        for (instance_id, code) in &exited {
            self.on_complete(*instance_id, *code);
        }
        exited.len()
    }

    /// Exit of one instance
    pub fn on_complete(&mut self, instance_id: Option<u32>, code: i32) {
        if code == 0 {
            info!(
                "Instance {:?} of stage '{}' exited cleanly",
                instance_id,
                self.id()
            );
        } else {
            let message = format!(
                "instance {:?} of stage '{}' exited with code {}",
                instance_id,
                self.id(),
                code
            );
            error!("{}", message);
            self.last_error = Some(message);
        }

        if self.live_instances() == 0 && code == 0 {
            self.status = StageStatus::Completed;
        }
    }

    /// Captured output lines, up to `max` per instance
    pub fn drain_output(&self, max: usize) -> Vec<String> {
        self.instances
            .iter()
            .flat_map(|i| i.read_output(max))
            .collect()
    }

    /// Child pids worth sampling; workers share the node's own process
    pub fn sample_pids(&self) -> Vec<u32> {
        self.instances
            .iter()
            .filter(|i| i.is_live())
            .filter_map(StageInstance::child_pid)
            .collect()
    }

    pub fn apply_usage(&mut self, sample: &ResourceSample) {
        for instance in self.instances.iter_mut() {
            if let Some(pid) = instance.child_pid() {
                instance.record_usage(sample.usage(pid));
            }
        }

        let limit = self.ctx.stage_usage_log_limit.max(1);
        if self.usage_log.len() == limit {
            self.usage_log.pop_front();
        }
        self.usage_log.push_back(StageUsage {
            cpu: self.cpu(),
            memory: self.memory(),
            pending: self.pending(),
            instances: self.live_instances(),
            at: Utc::now(),
        });
    }

    pub fn cpu(&self) -> f64 {
        self.instances.iter().map(|i| i.usage().cpu_percent).sum()
    }

    pub fn memory(&self) -> f64 {
        self.instances.iter().map(|i| i.usage().memory_percent).sum()
    }

    pub fn usage_log(&self) -> impl Iterator<Item = &StageUsage> {
        self.usage_log.iter()
    }

    /// Force-stop every child. Crash recovery only.
    pub fn kill_all(&mut self) {
        for instance in self.instances.iter_mut() {
            instance.kill();
        }
    }
}

impl std::fmt::Debug for StageController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageController")
            .field("id", &self.descriptor.id)
            .field("status", &self.status)
            .field("instances", &self.instances)
            .finish()
    }
}
