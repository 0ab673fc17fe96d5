//! One loaded pipeline
//!
//! The [`PipeController`] owns the queue graph and one [`StageController`]
//! per stage, and drives the pipeline state machine:
//!
//! ```text
//! INIT -> READY -> RUNNING -> PAUSED -> RUNNING
//!                          -> PENDING_TERMINATION -> COMPLETED
//! ```
//!
//! Termination drains stages in breadth-first order from the root: a stage is
//! only told to stop once nothing upstream of it is still running.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use super::stage::{StageController, StageStatus};
use super::{RuntimeContext, RuntimeError};
use crate::codec::Frame;
use crate::config::{validate_topology, Topology};
use crate::metrics::ResourceSample;
use crate::protocol::{ControlMessage, MessageKind, PipeAction, PipeStatus, QueueUpdate};
use crate::queue::{QueueError, QueueStats, RingQueue};

const STATUS_CHANNEL_CAPACITY: usize = 64;

pub struct PipeController {
    topology: Topology,
    ctx: RuntimeContext,
    status: PipeStatus,
    queues: BTreeMap<String, Arc<RingQueue>>,
    stages: BTreeMap<String, StageController>,
    drain_order: Vec<String>,
    signaled: Vec<String>,
    events: broadcast::Sender<ControlMessage>,
}

impl PipeController {
    pub fn new(topology: Topology, ctx: RuntimeContext) -> Self {
        let (events, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        Self {
            topology,
            ctx,
            status: PipeStatus::Init,
            queues: BTreeMap::new(),
            stages: BTreeMap::new(),
            drain_order: Vec::new(),
            signaled: Vec::new(),
            events,
        }
    }

    pub fn id(&self) -> &str {
        &self.topology.id
    }

    pub fn name(&self) -> &str {
        &self.topology.name
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn status(&self) -> PipeStatus {
        self.status
    }

    pub fn stage(&self, id: &str) -> Option<&StageController> {
        self.stages.get(id)
    }

    pub fn stages(&self) -> impl Iterator<Item = &StageController> {
        self.stages.values()
    }

    pub fn stage_mut(&mut self, id: &str) -> Result<&mut StageController, RuntimeError> {
        let pipe = self.topology.id.clone();
        self.stages.get_mut(id).ok_or(RuntimeError::StageNotFound {
            pipe,
            stage: id.to_string(),
        })
    }

    pub fn queue(&self, id: &str) -> Option<&Arc<RingQueue>> {
        self.queues.get(id)
    }

    pub fn drain_order(&self) -> &[String] {
        &self.drain_order
    }

    /// Stages told to terminate so far, in order
    pub fn signaled_stages(&self) -> &[String] {
        &self.signaled
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ControlMessage> {
        self.events.subscribe()
    }

    fn set_status(&mut self, status: PipeStatus) {
        if self.status == status {
            return;
        }
        info!(
            "Pipeline '{}': {:?} -> {:?}",
            self.topology.id, self.status, status
        );
        self.status = status;
        let msg = ControlMessage::pipe_status(self.topology.id.clone(), status);
        for stage in self.stages.values_mut() {
            stage.broadcast(&msg);
        }
        // No subscribers is fine
        let _ = self.events.send(msg);
    }

    fn invalid(&self, action: &'static str) -> RuntimeError {
        RuntimeError::InvalidStateTransition {
            from: self.status,
            action,
        }
    }

    /// Create queues and stage controllers: INIT -> READY
    pub fn load(&mut self) -> Result<(), RuntimeError> {
        if self.status != PipeStatus::Init {
            return Err(self.invalid("load"));
        }
        validate_topology(&self.topology)?;

        // Queued data never outlives a run: every edge starts empty
        for edge in self.topology.edges.values() {
            let queue = RingQueue::create(
                self.ctx.space.clone(),
                &edge.id,
                edge.size_or_default(),
                self.ctx.codec.clone(),
            )?;
            queue.set_dfps_interval(self.ctx.dfps_interval_ms);
            self.queues.insert(edge.id.clone(), Arc::new(queue));
        }

        let sink = self.topology.sink().cloned();
        for (id, descriptor) in &self.topology.stages {
            let inbound_edges: Vec<_> = self.topology.inbound_edges(id).cloned().collect();
            let inbound = inbound_edges
                .iter()
                .filter_map(|e| self.queues.get(&e.id).cloned())
                .collect();
            let update = QueueUpdate {
                stage_id: id.clone(),
                segment_dir: self.ctx.space.root().to_path_buf(),
                inbound: inbound_edges,
                outbound: self.topology.outbound_edges(id).cloned().collect(),
                sink: sink.clone().filter(|s| s.from == *id),
            };
            let controller = StageController::new(
                &self.topology.id,
                descriptor.clone(),
                self.ctx.clone(),
                inbound,
                update,
            )?;
            self.stages.insert(id.clone(), controller);
        }

        self.drain_order = self.topology.drain_order();
        info!(
            "Loaded pipeline '{}' ({} stages, {} queues)",
            self.topology.id,
            self.stages.len(),
            self.queues.len()
        );
        self.set_status(PipeStatus::Ready);
        Ok(())
    }

    /// READY -> RUNNING by launching every runnable stage, or resume from PAUSED
    pub fn start(&mut self) -> Result<(), RuntimeError> {
        match self.status {
            PipeStatus::Ready => {}
            PipeStatus::Paused => {
                self.set_status(PipeStatus::Running);
                return Ok(());
            }
            _ => return Err(self.invalid("start")),
        }

        // Resolve every worker before launching anything
        for stage in self.stages.values() {
            let d = stage.descriptor();
            if let (Some(function), None) = (&d.function, &d.entry) {
                if !self.ctx.workers.contains(function) {
                    return Err(super::LaunchError::UnknownFunction {
                        stage: d.id.clone(),
                        function: function.clone(),
                    }
                    .into());
                }
            }
        }

        for id in self.drain_order.clone() {
            let stage = self.stage_mut(&id)?;
            if !stage.is_runnable() {
                continue;
            }
            if let Err(e) = stage.launch_instance() {
                error!("Failed to launch stage '{}': {}", id, e);
                self.kill_all();
                return Err(e);
            }
        }

        self.set_status(PipeStatus::Running);
        Ok(())
    }

    /// RUNNING -> PAUSED
    pub fn pause(&mut self) -> Result<(), RuntimeError> {
        if self.status != PipeStatus::Running {
            return Err(self.invalid("pause"));
        }
        self.set_status(PipeStatus::Paused);
        Ok(())
    }

    /// Begin an ordered drain of the pipeline
    pub fn request_termination(&mut self) -> Result<(), RuntimeError> {
        match self.status {
            PipeStatus::Init | PipeStatus::Ready => self.complete(),
            PipeStatus::Running | PipeStatus::Paused => {
                self.set_status(PipeStatus::PendingTermination);
                self.terminate_next_stage();
            }
            PipeStatus::PendingTermination | PipeStatus::Completed => {}
        }
        Ok(())
    }

    /// Signal the next terminable stage, or complete once nothing runs.
    ///
    /// At most one stage is draining at a time. A stage is terminable once
    /// every stage upstream of it has no live instance.
    pub fn terminate_next_stage(&mut self) {
        if self.total_live() == 0 {
            self.complete();
            return;
        }

        let draining = self
            .signaled
            .iter()
            .any(|id| self.stages.get(id).map(|s| s.live_instances() > 0).unwrap_or(false));
        if draining {
            return;
        }

        for id in self.drain_order.clone() {
            if self.signaled.contains(&id) {
                continue;
            }
            let upstream_done = self
                .topology
                .upstream(&id)
                .iter()
                .all(|u| self.stages.get(*u).map(|s| s.live_instances() == 0).unwrap_or(true));
            if !upstream_done {
                // Everything later in the order waits on this stage's producers
                return;
            }

            let Some(stage) = self.stages.get_mut(&id) else {
                continue;
            };
            self.signaled.push(id.clone());
            if stage.live_instances() == 0 {
                continue;
            }
            stage.request_termination();
            return;
        }
    }

    /// Mark the pipeline COMPLETED and unlink its queue segments
    ///
    /// Handles held here stay mapped, so frames already in the sink can
    /// still be collected.
    pub fn complete(&mut self) {
        if self.status == PipeStatus::Completed {
            return;
        }
        self.set_status(PipeStatus::Completed);
        for id in self.queues.keys() {
            if let Err(e) = RingQueue::remove(&self.ctx.space, id) {
                warn!("Failed to remove queue '{}': {}", id, e);
            }
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self.status,
            PipeStatus::Running | PipeStatus::Paused | PipeStatus::PendingTermination
        )
    }

    pub fn total_live(&self) -> usize {
        self.stages.values().map(StageController::live_instances).sum()
    }

    /// Drain output, reap exits and advance any drain in progress.
    /// Returns the number of live instances.
    pub fn monitor(&mut self, max_lines: usize) -> usize {
        for stage in self.stages.values_mut() {
            for line in stage.drain_output(max_lines) {
                info!("{}", line);
            }
            stage.reap();
        }
        if self.status == PipeStatus::PendingTermination {
            self.terminate_next_stage();
        }
        self.total_live()
    }

    fn running_stages(&self) -> impl Iterator<Item = &StageController> {
        self.stages
            .values()
            .filter(|s| s.is_runnable() && s.status() == StageStatus::Running)
    }

    /// Launch one more instance of the stage with the largest backlog
    pub fn scale_up(&mut self) -> Result<bool, RuntimeError> {
        if self.status != PipeStatus::Running {
            return Ok(false);
        }
        let candidate = self
            .running_stages()
            .filter(|s| s.available_instances() > 0)
            .max_by_key(|s| s.pending())
            .map(|s| s.id().to_string());

        match candidate {
            Some(id) => {
                info!("Scaling up stage '{}' of pipeline '{}'", id, self.topology.id);
                self.stage_mut(&id)?.launch_instance()
            }
            None => Ok(false),
        }
    }

    /// Retire one instance of the stage furthest below its ceiling
    pub fn scale_down(&mut self) -> bool {
        if self.status != PipeStatus::Running {
            return false;
        }
        let candidate = self
            .running_stages()
            .filter(|s| s.active_instances() > 1)
            .max_by_key(|s| s.available_instances())
            .map(|s| s.id().to_string());

        match candidate.and_then(|id| self.stages.get_mut(&id)) {
            Some(stage) => stage.scale_down(),
            None => false,
        }
    }

    pub fn is_scaling(&self) -> bool {
        self.stages.values().any(StageController::is_scaling)
    }

    /// No running stage can take another instance
    pub fn scaled_to_max(&self) -> bool {
        self.running_stages().all(|s| s.available_instances() == 0)
    }

    /// Some stage runs more than one instance
    pub fn is_scaled(&self) -> bool {
        self.running_stages().any(|s| s.active_instances() > 1)
    }

    pub fn handle_message(&mut self, msg: &ControlMessage) -> Result<(), RuntimeError> {
        match &msg.kind {
            MessageKind::PipeControl { action } => match action {
                PipeAction::Start => self.start(),
                PipeAction::Pause => self.pause(),
                PipeAction::Terminate => self.request_termination(),
            },
            MessageKind::PipeStatus { status } => {
                debug!("Pipeline '{}' peer reports {:?}", self.topology.id, status);
                Ok(())
            }
            MessageKind::QUpdate(_)
            | MessageKind::ConfigUpdate(_)
            | MessageKind::RegistrationInfo { .. }
            | MessageKind::RequestTermination => {
                debug!(
                    "Pipeline '{}' ignoring {} from '{}'",
                    self.topology.id,
                    msg.kind.type_name(),
                    msg.sender
                );
                Ok(())
            }
        }
    }

    fn input_queues(&self) -> Vec<&Arc<RingQueue>> {
        self.topology
            .input_edges()
            .filter_map(|e| self.queues.get(&e.id))
            .collect()
    }

    /// Feed a frame into every pipeline input edge.
    ///
    /// The frame gets a fresh pipeline-execution id unless it has one.
    /// Returns `false` without writing if any input queue lacks room.
    pub fn push_input(&self, frame: Frame) -> Result<bool, RuntimeError> {
        let frame = if frame.pipeline_id().is_some() {
            frame
        } else {
            frame.with_new_pipeline_id()
        };
        let queues = self.input_queues();
        if queues.is_empty() {
            return Err(RuntimeError::NoInputEdge(self.topology.id.clone()));
        }
        for q in &queues {
            if !q.space_available(&frame)? {
                return Ok(false);
            }
        }
        for q in queues {
            q.try_put(&frame)?;
        }
        Ok(true)
    }

    fn sink_queue(&self) -> Result<&Arc<RingQueue>, RuntimeError> {
        self.queues
            .get(&self.topology.sink_edge)
            .ok_or_else(|| RuntimeError::NoSink(self.topology.id.clone()))
    }

    /// Next pipeline result, if any
    pub fn collect(&self) -> Result<Option<Frame>, RuntimeError> {
        Ok(self.sink_queue()?.get()?)
    }

    pub fn collect_sync(&self, timeout: Duration) -> Result<Frame, RuntimeError> {
        Ok(self.sink_queue()?.get_sync(timeout)?)
    }

    /// Put an already-serialized frame into one of this pipe's queues
    pub fn push_encoded(&self, queue_id: &str, bytes: &[u8]) -> Result<Option<bool>, RuntimeError> {
        let Some(queue) = self.queues.get(queue_id) else {
            return Ok(None);
        };
        let frame = self.ctx.codec.decode_frame(bytes)?;
        match queue.put(&frame) {
            Ok(accepted) => Ok(Some(accepted)),
            Err(e @ QueueError::Integrity { .. }) => Err(e.into()),
            Err(e) => {
                warn!("Push into '{}' failed: {}", queue_id, e);
                Ok(Some(false))
            }
        }
    }

    pub fn queue_stats(&self) -> Vec<QueueStats> {
        self.queues.values().map(|q| q.stats()).collect()
    }

    pub fn sample_pids(&self) -> Vec<u32> {
        self.stages.values().flat_map(StageController::sample_pids).collect()
    }

    pub fn apply_usage(&mut self, sample: &ResourceSample) {
        for stage in self.stages.values_mut() {
            stage.apply_usage(sample);
        }
    }

    /// Force-stop every instance. Crash recovery only.
    pub fn kill_all(&mut self) {
        for stage in self.stages.values_mut() {
            stage.kill_all();
        }
    }
}

impl std::fmt::Debug for PipeController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipeController")
            .field("id", &self.topology.id)
            .field("status", &self.status)
            .field("stages", &self.stages.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EdgeDescriptor, NodeConfig, StageDescriptor};
    use crate::runtime::{StageEndpoint, WorkerRegistry};
    use std::time::Instant;

    fn ctx(dir: &tempfile::TempDir) -> RuntimeContext {
        let workers = WorkerRegistry::with_builtins();
        let config = NodeConfig::default()
            .with_segment_dir(dir.path())
            .with_monitor_interval(Duration::from_millis(10));
        RuntimeContext::new(&config, Arc::new(workers))
    }

    fn two_stage(id: &str) -> Topology {
        Topology::new("two", id, "a")
            .with_stage("a", StageDescriptor::function("passthrough"))
            .with_stage("b", StageDescriptor::function("passthrough"))
            .with_edge(EdgeDescriptor::new(id, "a").with_size(4096))
            .with_edge(EdgeDescriptor::new("a", "b").with_size(4096))
            .with_sink("b", 4096)
    }

    fn wait_completed(pipe: &mut PipeController) {
        let started = Instant::now();
        while pipe.status() != PipeStatus::Completed {
            pipe.monitor(3);
            assert!(started.elapsed() < Duration::from_secs(10), "pipe never completed");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_state_machine() {
        let dir = tempfile::tempdir().unwrap();
        let mut pipe = PipeController::new(two_stage("sm"), ctx(&dir));
        assert!(matches!(
            pipe.start(),
            Err(RuntimeError::InvalidStateTransition {
                from: PipeStatus::Init,
                ..
            })
        ));
        assert!(pipe.pause().is_err());

        pipe.load().unwrap();
        assert_eq!(pipe.status(), PipeStatus::Ready);
        assert!(pipe.pause().is_err());

        pipe.start().unwrap();
        assert_eq!(pipe.status(), PipeStatus::Running);
        assert_eq!(pipe.total_live(), 2);

        pipe.pause().unwrap();
        assert_eq!(pipe.status(), PipeStatus::Paused);
        pipe.start().unwrap();
        assert_eq!(pipe.status(), PipeStatus::Running);
        assert_eq!(pipe.total_live(), 2);

        pipe.request_termination().unwrap();
        wait_completed(&mut pipe);
        assert_eq!(pipe.signaled_stages(), &["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_data_flows_to_sink() {
        let dir = tempfile::tempdir().unwrap();
        let mut pipe = PipeController::new(two_stage("flow"), ctx(&dir));
        pipe.load().unwrap();
        pipe.start().unwrap();

        assert!(pipe.push_input(Frame::from_data("hello")).unwrap());
        let out = pipe.collect_sync(Duration::from_secs(5)).unwrap();
        assert_eq!(out.data().and_then(|v| v.as_str()), Some("hello"));
        assert!(out.pipeline_id().is_some());

        pipe.request_termination().unwrap();
        wait_completed(&mut pipe);
    }

    #[test]
    fn test_terminate_before_start() {
        let dir = tempfile::tempdir().unwrap();
        let mut pipe = PipeController::new(two_stage("early"), ctx(&dir));
        pipe.load().unwrap();
        pipe.request_termination().unwrap();
        assert_eq!(pipe.status(), PipeStatus::Completed);
    }

    #[test]
    fn test_load_discards_frames_left_by_earlier_run() {
        let dir = tempfile::tempdir().unwrap();
        let context = ctx(&dir);
        let stale = RingQueue::open(context.space.clone(), "a:b", 4096, context.codec.clone()).unwrap();
        stale.put(&Frame::from_data("from-run-1")).unwrap();
        drop(stale);

        let mut pipe = PipeController::new(two_stage("rerun"), context);
        pipe.load().unwrap();
        let queue = pipe.queue("a:b").unwrap();
        assert_eq!(queue.pending(), 0);
        assert!(queue.get().unwrap().is_none());
    }

    #[test]
    fn test_completion_unlinks_queue_segments() {
        let dir = tempfile::tempdir().unwrap();
        let mut pipe = PipeController::new(two_stage("unlink"), ctx(&dir));
        pipe.load().unwrap();
        let segments: Vec<_> = ["unlink:a", "a:b", "b:unlink"]
            .iter()
            .map(|id| dir.path().join(RingQueue::segment_name(id)))
            .collect();
        assert!(segments.iter().all(|p| p.exists()));

        pipe.start().unwrap();
        assert!(pipe.push_input(Frame::from_data("last")).unwrap());
        pipe.request_termination().unwrap();
        wait_completed(&mut pipe);

        assert!(segments.iter().all(|p| !p.exists()));
        // Frames already in the sink survive the unlink
        let out = pipe.collect().unwrap().unwrap();
        assert_eq!(out.data().and_then(|v| v.as_str()), Some("last"));
    }

    #[test]
    fn test_status_broadcast() {
        let dir = tempfile::tempdir().unwrap();
        let mut pipe = PipeController::new(two_stage("bc"), ctx(&dir));
        let mut rx = pipe.subscribe();
        pipe.load().unwrap();
        let msg = rx.try_recv().unwrap();
        assert_eq!(
            msg.kind,
            MessageKind::PipeStatus {
                status: PipeStatus::Ready
            }
        );
        assert_eq!(msg.dest, "bc");
    }

    #[test]
    fn test_handle_pipe_control() {
        let dir = tempfile::tempdir().unwrap();
        let mut pipe = PipeController::new(two_stage("ctl"), ctx(&dir));
        pipe.load().unwrap();
        pipe.handle_message(&ControlMessage::pipe_control("ctl", "t", PipeAction::Start))
            .unwrap();
        assert_eq!(pipe.status(), PipeStatus::Running);
        pipe.handle_message(&ControlMessage::pipe_control("ctl", "t", PipeAction::Terminate))
            .unwrap();
        wait_completed(&mut pipe);
    }

    #[test]
    fn test_unknown_worker_launches_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let topology = two_stage("uw").with_stage("c", StageDescriptor::function("missing"));
        let mut pipe = PipeController::new(topology, ctx(&dir));
        pipe.load().unwrap();
        assert!(matches!(pipe.start(), Err(RuntimeError::Launch(_))));
        assert_eq!(pipe.total_live(), 0);
        assert_eq!(pipe.status(), PipeStatus::Ready);
    }

    #[test]
    fn test_scale_up_picks_backlog_and_scale_down() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx(&dir);
        // "hold" never consumes, so the backlog stays put
        ctx.workers.register("hold", |ep: &mut StageEndpoint| {
            while !ep.should_terminate() {
                std::thread::sleep(Duration::from_millis(5));
            }
            Ok(())
        });
        let topology = Topology::new("sc", "sc", "a")
            .with_stage("a", StageDescriptor::function("hold").with_autoscale(3))
            .with_stage("b", StageDescriptor::function("hold").with_autoscale(3))
            .with_edge(EdgeDescriptor::new("sc", "a").with_size(4096))
            .with_edge(EdgeDescriptor::new("a", "b").with_size(4096))
            .with_sink("b", 4096);
        let mut pipe = PipeController::new(topology, ctx);
        pipe.load().unwrap();
        pipe.start().unwrap();

        pipe.push_input(Frame::from_data("x")).unwrap();
        pipe.push_input(Frame::from_data("y")).unwrap();
        assert!(pipe.scale_up().unwrap());
        assert_eq!(pipe.stage("a").unwrap().live_instances(), 2);
        assert_eq!(pipe.stage("b").unwrap().live_instances(), 1);
        assert!(pipe.is_scaled());
        assert!(!pipe.scaled_to_max());

        assert!(pipe.scale_down());
        assert!(pipe.is_scaling());

        // Drain the input so the "hold" workers may exit
        while pipe.queue("sc:a").unwrap().get().unwrap().is_some() {}
        pipe.request_termination().unwrap();
        wait_completed(&mut pipe);
    }
}
