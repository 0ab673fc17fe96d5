//! Per-host supervisor
//!
//! The [`NodeManager`] owns every pipeline loaded on this host and runs the
//! periodic tick:
//! 1. sample host and stage-process utilization on a blocking thread
//! 2. reap exits, drain captured output, advance drains
//! 3. complete pipes with nothing left running
//! 4. make at most one autoscaling move
//!
//! It also exposes the registration contract (`load_pipe`, `register_stage`,
//! `push_queue`) as plain methods; the transport carrying them lives outside.

use std::sync::Arc;

use crossbeam_channel::Receiver;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::autoscaler::{
    evaluate_scaling, AutoscalerState, ScalingDecision, ScalingInputs, UtilizationHistory,
    UtilizationSample,
};
use super::pipe::PipeController;
use super::worker::WorkerRegistry;
use super::{RuntimeContext, RuntimeError};
use crate::codec::Frame;
use crate::config::{EdgeDescriptor, NodeConfig, Topology};
use crate::metrics::{new_shared_collector, ResourceSample, SharedResourceCollector};
use crate::protocol::{
    ControlMessage, PipeStatus, PushResponse, RegistrationResponse, Scope, ServerDescriptor,
    ServerKind, StageRef,
};
use crate::queue::{NodeStatusBlock, NodeStatusSnapshot};

pub struct NodeManager {
    config: NodeConfig,
    ctx: RuntimeContext,
    pipes: DashMap<String, PipeController>,
    history: Mutex<UtilizationHistory>,
    autoscaler: Mutex<AutoscalerState>,
    collector: SharedResourceCollector,
    status_block: NodeStatusBlock,
}

impl NodeManager {
    pub fn new(config: NodeConfig, workers: WorkerRegistry) -> Result<Self, RuntimeError> {
        let ctx = RuntimeContext::new(&config, Arc::new(workers));
        let status_block = NodeStatusBlock::open(&ctx.space)?;
        info!(
            "Node '{}' using segments in {}",
            config.node_id,
            ctx.space.root().display()
        );
        Ok(Self {
            history: Mutex::new(UtilizationHistory::new(config.usage_history_limit)),
            autoscaler: Mutex::new(AutoscalerState::new()),
            collector: new_shared_collector(),
            status_block,
            pipes: DashMap::new(),
            config,
            ctx,
        })
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn context(&self) -> &RuntimeContext {
        &self.ctx
    }

    // ========================================================================
    // Pipeline lifecycle
    // ========================================================================

    /// Load a pipeline; its id must not already be present on this node
    pub fn load_pipe(&self, topology: Topology) -> Result<ServerDescriptor, RuntimeError> {
        let id = topology.id.clone();
        match self.pipes.entry(id.clone()) {
            Entry::Occupied(_) => Err(RuntimeError::PipelineAlreadyExists(id)),
            Entry::Vacant(slot) => {
                let mut pipe = PipeController::new(topology, self.ctx.clone());
                pipe.load()?;
                slot.insert(pipe);
                Ok(ServerDescriptor {
                    name: self.config.node_id.clone(),
                    id,
                    kind: ServerKind::Node,
                    pid: std::process::id(),
                })
            }
        }
    }

    /// Run `f` against one pipeline
    pub fn with_pipe<R>(
        &self,
        id: &str,
        f: impl FnOnce(&mut PipeController) -> R,
    ) -> Result<R, RuntimeError> {
        let mut pipe = self
            .pipes
            .get_mut(id)
            .ok_or_else(|| RuntimeError::PipelineNotFound(id.to_string()))?;
        Ok(f(pipe.value_mut()))
    }

    pub fn start_pipe(&self, id: &str) -> Result<(), RuntimeError> {
        self.with_pipe(id, |p| p.start())?
    }

    pub fn pause_pipe(&self, id: &str) -> Result<(), RuntimeError> {
        self.with_pipe(id, |p| p.pause())?
    }

    pub fn terminate_pipe(&self, id: &str) -> Result<(), RuntimeError> {
        self.with_pipe(id, |p| p.request_termination())?
    }

    pub fn pipe_status(&self, id: &str) -> Option<PipeStatus> {
        self.pipes.get(id).map(|p| p.status())
    }

    pub fn pipe_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.pipes.iter().map(|p| p.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn subscribe(&self, id: &str) -> Result<broadcast::Receiver<ControlMessage>, RuntimeError> {
        self.with_pipe(id, |p| p.subscribe())
    }

    pub fn push_input(&self, id: &str, frame: Frame) -> Result<bool, RuntimeError> {
        self.with_pipe(id, |p| p.push_input(frame))?
    }

    pub fn collect(&self, id: &str) -> Result<Option<Frame>, RuntimeError> {
        self.with_pipe(id, |p| p.collect())?
    }

    /// Pipes still doing something
    pub fn live_pipes(&self) -> usize {
        self.pipes
            .iter()
            .filter(|p| p.status() != PipeStatus::Completed)
            .count()
    }

    // ========================================================================
    // Registration contract
    // ========================================================================

    /// A launched stage process reports in with its pid
    pub fn register_stage(
        &self,
        pid: u32,
        stage: &StageRef,
    ) -> Result<RegistrationResponse, RuntimeError> {
        self.with_pipe(&stage.pipe_id, |p| {
            p.stage_mut(&stage.stage_id)?.register_instance(pid)
        })?
    }

    /// Open the control channel of a registered instance
    pub fn attach_control(
        &self,
        stage: &StageRef,
        instance_id: u32,
    ) -> Result<Receiver<ControlMessage>, RuntimeError> {
        let (tx, rx) = crossbeam_channel::unbounded();
        self.with_pipe(&stage.pipe_id, |p| {
            p.stage_mut(&stage.stage_id)?.attach_control(instance_id, tx)
        })??;
        Ok(rx)
    }

    /// Deliver a serialized frame into a locally hosted queue
    pub fn push_queue(
        &self,
        queue: &EdgeDescriptor,
        frame_bytes: &[u8],
    ) -> Result<PushResponse, RuntimeError> {
        for pipe in self.pipes.iter() {
            if let Some(success) = pipe.push_encoded(&queue.id, frame_bytes)? {
                return Ok(PushResponse { success });
            }
        }
        warn!("No local queue '{}' for pushed frame", queue.id);
        Ok(PushResponse { success: false })
    }

    /// Route a parsed control message by scope and destination
    pub fn dispatch(&self, msg: &ControlMessage) -> Result<(), RuntimeError> {
        match msg.scope {
            Scope::Pipeline => self.with_pipe(&msg.dest, |p| p.handle_message(msg))?,
            Scope::Stage | Scope::StageInstance => {
                for mut pipe in self.pipes.iter_mut() {
                    if let Ok(stage) = pipe.stage_mut(&msg.dest) {
                        stage.broadcast(msg);
                        return Ok(());
                    }
                }
                warn!("No stage '{}' for {}", msg.dest, msg.kind.type_name());
                Ok(())
            }
            Scope::Node => {
                debug!("Node ignoring {} from '{}'", msg.kind.type_name(), msg.sender);
                Ok(())
            }
        }
    }

    /// Parse and dispatch a raw envelope. Malformed messages are logged and dropped.
    pub fn handle_raw(&self, text: &str) -> Result<(), RuntimeError> {
        match ControlMessage::from_json(text) {
            Ok(msg) => self.dispatch(&msg),
            Err(e) => {
                warn!("Dropping control message: {}", e);
                Ok(())
            }
        }
    }

    // ========================================================================
    // Tick
    // ========================================================================

    /// Add a host utilization sample to the history
    pub fn record_utilization(&self, sample: UtilizationSample) {
        self.history.lock().push(sample);
    }

    pub fn status_snapshot(&self) -> NodeStatusSnapshot {
        self.status_block.snapshot()
    }

    /// One pass of monitoring and autoscaling
    pub async fn tick(&self) {
        let pids: Vec<u32> = self
            .pipes
            .iter()
            .filter(|p| p.is_active())
            .flat_map(|p| p.sample_pids())
            .collect();
        let collector = self.collector.clone();
        let sampled = tokio::task::spawn_blocking(move || {
            let mut collector = collector.lock();
            collector.sample(&pids)
        });
        let sample = match sampled.await {
            Ok(sample) => Some(sample),
            Err(e) => {
                warn!("Resource sampling failed: {}", e);
                None
            }
        };

        self.monitor_pipes(sample.as_ref());

        if let Some(sample) = &sample {
            self.record_utilization(UtilizationSample::from(&sample.host));
            let weighted = self.history.lock().weighted();
            debug!(
                "Node '{}' utilization: cpu {:.1}%, memory {:.1}%, disk {:.1}%",
                self.config.node_id, weighted.cpu, weighted.memory, weighted.disk
            );
        }

        self.check_autoscale();
        self.status_block.record_tick(self.live_pipes() as u32);
    }

    fn monitor_pipes(&self, sample: Option<&ResourceSample>) {
        let max_lines = self.config.output_lines_per_tick;
        for mut pipe in self.pipes.iter_mut() {
            if !pipe.is_active() {
                continue;
            }
            if let Some(sample) = sample {
                pipe.apply_usage(sample);
            }
            let running = pipe.monitor(max_lines);
            for stats in pipe.queue_stats() {
                debug!(
                    "Queue '{}': pending {}, free {}, in {:.1}/s, out {:.1}/s",
                    stats.q_id, stats.pending, stats.free_space, stats.dfps_in, stats.dfps_out
                );
            }
            let draining = matches!(
                pipe.status(),
                PipeStatus::Running | PipeStatus::PendingTermination
            );
            if running == 0 && draining {
                info!("Pipeline '{}' has no running instances", pipe.id());
                pipe.complete();
            }
        }
    }

    /// Apply the autoscaling policy to at most one pipe
    pub fn check_autoscale(&self) -> ScalingDecision {
        let utilization = self.history.lock().weighted();
        let mut inputs = ScalingInputs {
            utilization,
            ..Default::default()
        };
        for pipe in self.pipes.iter() {
            inputs.scaling_in_progress |= pipe.is_scaling();
            if pipe.status() == PipeStatus::Running {
                inputs.headroom |= !pipe.scaled_to_max();
                inputs.scaled |= pipe.is_scaled();
            }
        }

        let decision = {
            let state = self.autoscaler.lock();
            evaluate_scaling(&self.config.autoscale, &inputs, &state)
        };

        match &decision {
            ScalingDecision::NoChange => {}
            ScalingDecision::ScaleDown { reason } => {
                let scaled = self
                    .pipes
                    .iter_mut()
                    .filter(|p| p.status() == PipeStatus::Running && p.is_scaled())
                    .any(|mut p| p.scale_down());
                if scaled {
                    info!("Scaled down: {}", reason);
                    self.autoscaler.lock().record_scale_down();
                }
            }
            ScalingDecision::ScaleUp { reason } => {
                let mut scaled = false;
                for mut pipe in self.pipes.iter_mut() {
                    if pipe.status() != PipeStatus::Running || pipe.scaled_to_max() {
                        continue;
                    }
                    match pipe.scale_up() {
                        Ok(true) => {
                            scaled = true;
                            break;
                        }
                        Ok(false) => {}
                        Err(e) => warn!("Scale up of '{}' failed: {}", pipe.id(), e),
                    }
                }
                if scaled {
                    info!("Scaled up: {}", reason);
                    self.autoscaler.lock().record_scale_up();
                }
            }
        }
        decision
    }

    /// Tick until `shutdown` flips
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let interval = self.config.tick_interval();
        info!(
            "Starting node manager: node={}, tick={}ms",
            self.config.node_id, self.config.tick_interval_ms
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    self.tick().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Node manager shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Ask every pipe to drain
    pub fn terminate_all(&self) {
        for mut pipe in self.pipes.iter_mut() {
            if let Err(e) = pipe.request_termination() {
                warn!("Failed to terminate '{}': {}", pipe.id(), e);
            }
        }
    }

    /// Force-stop whatever is still running. Crash recovery only.
    pub fn kill_all(&self) {
        for mut pipe in self.pipes.iter_mut() {
            if pipe.total_live() > 0 {
                pipe.kill_all();
            }
        }
    }
}

/// Spawn the node loop as a background task.
///
/// Returns a shutdown sender and the task handle.
pub fn spawn_node_manager(node: Arc<NodeManager>) -> (watch::Sender<bool>, JoinHandle<()>) {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(node.run(shutdown_rx));
    (shutdown_tx, handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AutoscaleConfig, StageDescriptor};
    use chrono::Utc;
    use std::time::Duration;

    fn node(dir: &tempfile::TempDir) -> NodeManager {
        let config = NodeConfig::default()
            .with_segment_dir(dir.path())
            .with_node_id("n1")
            .with_monitor_interval(Duration::from_millis(10))
            .with_tick_interval(Duration::from_millis(20));
        NodeManager::new(config, WorkerRegistry::with_builtins()).unwrap()
    }

    fn topology(id: &str, autoscale: u32) -> Topology {
        Topology::new("t", id, "a")
            .with_stage("a", StageDescriptor::function("passthrough").with_autoscale(autoscale))
            .with_edge(EdgeDescriptor::new(id, "a").with_size(4096))
            .with_sink("a", 4096)
    }

    fn calm(node: &NodeManager, cpu: f64, memory: f64) {
        node.record_utilization(UtilizationSample {
            cpu,
            memory,
            disk: 0.0,
            at: Utc::now(),
        });
    }

    #[test]
    fn test_duplicate_pipe_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let node = node(&dir);
        let server = node.load_pipe(topology("p1", 1)).unwrap();
        assert_eq!(server.name, "n1");
        assert_eq!(server.id, "p1");
        assert!(matches!(
            node.load_pipe(topology("p1", 1)),
            Err(RuntimeError::PipelineAlreadyExists(id)) if id == "p1"
        ));
        assert_eq!(node.pipe_status("p1"), Some(PipeStatus::Ready));
    }

    #[test]
    fn test_unknown_pipe() {
        let dir = tempfile::tempdir().unwrap();
        let node = node(&dir);
        assert!(matches!(
            node.start_pipe("ghost"),
            Err(RuntimeError::PipelineNotFound(_))
        ));
    }

    #[test]
    fn test_malformed_message_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let node = node(&dir);
        assert!(node.handle_raw("not json").is_ok());
        assert!(node
            .handle_raw(r#"{"dest":"x","type":"WHAT","sender":"s","scope":"NODE"}"#)
            .is_ok());
    }

    #[test]
    fn test_dispatch_pipe_control() {
        let dir = tempfile::tempdir().unwrap();
        let node = node(&dir);
        node.load_pipe(topology("p2", 1)).unwrap();
        let start = r#"{"dest":"p2","type":"PIPE_CONTROL","sender":"cli","scope":"PIPELINE","body":{"action":"START"}}"#;
        node.handle_raw(start).unwrap();
        assert_eq!(node.pipe_status("p2"), Some(PipeStatus::Running));
        node.terminate_pipe("p2").unwrap();
        node.kill_all();
    }

    #[tokio::test]
    async fn test_tick_completes_drained_pipe() {
        let dir = tempfile::tempdir().unwrap();
        let node = node(&dir);
        node.load_pipe(topology("p3", 1)).unwrap();
        node.start_pipe("p3").unwrap();
        node.terminate_pipe("p3").unwrap();

        for _ in 0..200 {
            node.tick().await;
            if node.pipe_status("p3") == Some(PipeStatus::Completed) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(node.pipe_status("p3"), Some(PipeStatus::Completed));
        assert_eq!(node.live_pipes(), 0);
        assert!(node.status_snapshot().ticks > 0);
    }

    #[test]
    fn test_autoscale_up_then_cooldown() {
        let dir = tempfile::tempdir().unwrap();
        let node = node(&dir);
        node.load_pipe(topology("p4", 3)).unwrap();
        node.start_pipe("p4").unwrap();
        calm(&node, 10.0, 10.0);

        assert!(matches!(node.check_autoscale(), ScalingDecision::ScaleUp { .. }));
        let live = node.with_pipe("p4", |p| p.total_live()).unwrap();
        assert_eq!(live, 2);

        // Within the cooldown nothing more happens
        assert_eq!(node.check_autoscale(), ScalingDecision::NoChange);

        node.terminate_pipe("p4").unwrap();
        node.kill_all();
    }

    #[test]
    fn test_autoscale_down_under_pressure() {
        let dir = tempfile::tempdir().unwrap();
        let config = NodeConfig::default()
            .with_segment_dir(dir.path())
            .with_autoscale(AutoscaleConfig {
                cooldown_secs: 0,
                ..Default::default()
            });
        let node = NodeManager::new(config, WorkerRegistry::with_builtins()).unwrap();
        node.load_pipe(topology("p5", 2)).unwrap();
        node.start_pipe("p5").unwrap();
        calm(&node, 10.0, 10.0);
        assert!(matches!(node.check_autoscale(), ScalingDecision::ScaleUp { .. }));

        calm(&node, 100.0, 10.0);
        calm(&node, 100.0, 10.0);
        assert!(matches!(node.check_autoscale(), ScalingDecision::ScaleDown { .. }));
        assert!(node.with_pipe("p5", |p| p.is_scaling()).unwrap());

        // A retiring instance blocks further moves
        assert_eq!(node.check_autoscale(), ScalingDecision::NoChange);

        node.terminate_pipe("p5").unwrap();
        node.kill_all();
    }
}
