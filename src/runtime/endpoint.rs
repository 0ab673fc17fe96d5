//! Stage-side view of the runtime
//!
//! A [`StageEndpoint`] is what a stage's code talks to. It consumes the
//! control messages pushed by the node, opens the queues named in
//! `Q_UPDATE`, and offers the data-path calls:
//! - `get` / `get_sync`: round-robin over inbound queues
//! - `emit` / `emit_sync`: every outbound queue, or the sink for the last stage
//! - `should_terminate`: termination was requested and the inputs are drained

use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use serde_json::Value as Json;
use tracing::{debug, info, warn};

use crate::codec::{Frame, FrameCodec};
use crate::config::EdgeDescriptor;
use crate::protocol::{ControlMessage, MessageKind, PipeStatus, QueueUpdate, StageRef};
use crate::queue::{QueueError, RingQueue, SegmentSpace};

const IDLE_POLL: Duration = Duration::from_millis(10);
const EMIT_TIMEOUT: Duration = Duration::from_secs(30);

pub struct StageEndpoint {
    stage: StageRef,
    instance_id: Option<u32>,
    space: Arc<SegmentSpace>,
    codec: FrameCodec,
    control: Receiver<ControlMessage>,
    output: Option<Sender<String>>,
    config: Json,
    inbound: Vec<RingQueue>,
    outbound: Vec<RingQueue>,
    sink: Option<RingQueue>,
    next_inbound: usize,
    termination_requested: bool,
    pipe_status: Option<PipeStatus>,
}

impl StageEndpoint {
    pub fn new(
        stage: StageRef,
        space: Arc<SegmentSpace>,
        codec: FrameCodec,
        control: Receiver<ControlMessage>,
    ) -> Self {
        Self {
            stage,
            instance_id: None,
            space,
            codec,
            control,
            output: None,
            config: Json::Null,
            inbound: Vec::new(),
            outbound: Vec::new(),
            sink: None,
            next_inbound: 0,
            termination_requested: false,
            pipe_status: None,
        }
    }

    /// Route [`StageEndpoint::print`] into the instance's capture buffer
    pub fn with_output(mut self, output: Sender<String>) -> Self {
        self.output = Some(output);
        self
    }

    pub fn with_config(mut self, config: Json) -> Self {
        self.config = config;
        self
    }

    pub fn stage(&self) -> &StageRef {
        &self.stage
    }

    pub fn instance_id(&self) -> Option<u32> {
        self.instance_id
    }

    pub fn config(&self) -> &Json {
        &self.config
    }

    pub fn is_paused(&self) -> bool {
        self.pipe_status == Some(PipeStatus::Paused)
    }

    /// Apply every control message waiting on the channel
    pub fn poll_control(&mut self) -> Result<(), QueueError> {
        loop {
            match self.control.try_recv() {
                Ok(msg) => self.handle_message(msg)?,
                Err(TryRecvError::Empty) => return Ok(()),
                Err(TryRecvError::Disconnected) => {
                    // The node is gone; nobody will ever ask nicely
                    if !self.termination_requested {
                        warn!(
                            "Control channel of stage '{}' closed, terminating",
                            self.stage.stage_id
                        );
                    }
                    self.termination_requested = true;
                    return Ok(());
                }
            }
        }
    }

    pub fn handle_message(&mut self, msg: ControlMessage) -> Result<(), QueueError> {
        match msg.kind {
            MessageKind::RegistrationInfo { instance_id } => {
                self.instance_id = Some(instance_id);
            }
            MessageKind::QUpdate(update) => self.apply_queue_update(&update)?,
            MessageKind::ConfigUpdate(config) => self.config = config,
            MessageKind::RequestTermination => {
                debug!("Stage '{}' asked to terminate", self.stage.stage_id);
                self.termination_requested = true;
            }
            MessageKind::PipeStatus { status } => self.pipe_status = Some(status),
            MessageKind::PipeControl { action } => {
                debug!(
                    "Stage '{}' ignoring pipe control {:?}",
                    self.stage.stage_id, action
                );
            }
        }
        Ok(())
    }

    fn open(&self, edge: &EdgeDescriptor) -> Result<RingQueue, QueueError> {
        RingQueue::open(
            self.space.clone(),
            &edge.id,
            edge.size_or_default(),
            self.codec.clone(),
        )
    }

    fn apply_queue_update(&mut self, update: &QueueUpdate) -> Result<(), QueueError> {
        self.inbound = update
            .inbound
            .iter()
            .map(|e| self.open(e))
            .collect::<Result<_, _>>()?;
        self.outbound = update
            .outbound
            .iter()
            .map(|e| self.open(e))
            .collect::<Result<_, _>>()?;
        self.sink = update.sink.as_ref().map(|e| self.open(e)).transpose()?;
        self.next_inbound = 0;
        debug!(
            "Stage '{}' wired: {} in, {} out, sink: {}",
            self.stage.stage_id,
            self.inbound.len(),
            self.outbound.len(),
            self.sink.is_some()
        );
        Ok(())
    }

    /// Next frame from any inbound queue, starting after the last one served
    pub fn get(&mut self) -> Result<Option<Frame>, QueueError> {
        self.poll_control()?;
        let count = self.inbound.len();
        for step in 0..count {
            let index = (self.next_inbound + step) % count;
            if let Some(frame) = self.inbound[index].get()? {
                self.next_inbound = (index + 1) % count;
                return Ok(Some(frame));
            }
        }
        Ok(None)
    }

    pub fn get_sync(&mut self, timeout: Duration) -> Result<Frame, QueueError> {
        let started = Instant::now();
        loop {
            if let Some(frame) = self.get()? {
                return Ok(frame);
            }
            let waited = started.elapsed();
            if waited >= timeout {
                return Err(QueueError::Timeout {
                    queue: self.stage.stage_id.clone(),
                    waited,
                });
            }
            std::thread::sleep(IDLE_POLL.min(timeout - waited));
        }
    }

    fn targets(&self) -> Vec<&RingQueue> {
        if self.outbound.is_empty() {
            self.sink.iter().collect()
        } else {
            self.outbound.iter().collect()
        }
    }

    /// Write `frame` to every target if all of them have room.
    /// Returns `false` without writing anything otherwise.
    pub fn emit(&mut self, frame: &Frame) -> Result<bool, QueueError> {
        self.poll_control()?;
        let targets = self.targets();
        if targets.is_empty() {
            debug!("Stage '{}' has nowhere to emit", self.stage.stage_id);
            return Ok(true);
        }
        for queue in &targets {
            if !queue.space_available(frame)? {
                return Ok(false);
            }
        }
        for queue in targets {
            queue.try_put(frame)?;
        }
        Ok(true)
    }

    pub fn emit_sync(&mut self, frame: &Frame, timeout: Duration) -> Result<(), QueueError> {
        self.poll_control()?;
        let started = Instant::now();
        for queue in self.targets() {
            let left = timeout.saturating_sub(started.elapsed());
            queue.put_sync(frame, left)?;
        }
        Ok(())
    }

    /// Frames still waiting on the inbound queues
    pub fn pending(&self) -> u64 {
        self.inbound.iter().map(|q| q.pending() as u64).sum()
    }

    pub fn should_terminate(&mut self) -> bool {
        if let Err(e) = self.poll_control() {
            warn!("Stage '{}' control error: {}", self.stage.stage_id, e);
            return true;
        }
        self.termination_requested && self.pending() == 0
    }

    /// Emit a line of stage output
    pub fn print(&self, line: impl Into<String>) {
        let line = line.into();
        match &self.output {
            Some(tx) if tx.send(line.clone()).is_ok() => {}
            _ => info!("{}>>> {}", self.stage.stage_id, line),
        }
    }

    /// Run `handler` over every inbound frame until termination.
    /// A returned frame is emitted downstream; `None` drops it.
    pub fn serve<F>(&mut self, mut handler: F) -> anyhow::Result<()>
    where
        F: FnMut(Frame) -> anyhow::Result<Option<Frame>>,
    {
        while !self.should_terminate() {
            if self.is_paused() {
                std::thread::sleep(IDLE_POLL);
                continue;
            }
            match self.get()? {
                Some(frame) => {
                    if let Some(out) = handler(frame)? {
                        self.emit_sync(&out, EMIT_TIMEOUT)?;
                    }
                }
                None => std::thread::sleep(IDLE_POLL),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Scope;

    fn setup(dir: &tempfile::TempDir) -> (StageEndpoint, Sender<ControlMessage>, Arc<SegmentSpace>) {
        let space = Arc::new(SegmentSpace::new(dir.path()));
        let (tx, rx) = crossbeam_channel::unbounded();
        let endpoint = StageEndpoint::new(
            StageRef::new("p", "b"),
            space.clone(),
            FrameCodec::new(),
            rx,
        );
        (endpoint, tx, space)
    }

    fn wire(tx: &Sender<ControlMessage>, dir: &tempfile::TempDir) {
        let update = QueueUpdate {
            stage_id: "b".to_string(),
            segment_dir: dir.path().to_path_buf(),
            inbound: vec![
                EdgeDescriptor::new("a1", "b").with_size(2048),
                EdgeDescriptor::new("a2", "b").with_size(2048),
            ],
            outbound: vec![EdgeDescriptor::new("b", "c").with_size(2048)],
            sink: None,
        };
        tx.send(ControlMessage::new("b", "node", Scope::Stage, MessageKind::QUpdate(update)))
            .unwrap();
    }

    fn queue(space: &Arc<SegmentSpace>, id: &str) -> RingQueue {
        RingQueue::open(space.clone(), id, 2048, FrameCodec::new()).unwrap()
    }

    #[test]
    fn test_round_robin_get() {
        let dir = tempfile::tempdir().unwrap();
        let (mut endpoint, tx, space) = setup(&dir);
        wire(&tx, &dir);

        let a1 = queue(&space, "a1:b");
        let a2 = queue(&space, "a2:b");
        a1.put(&Frame::from_data("x1")).unwrap();
        a1.put(&Frame::from_data("x2")).unwrap();
        a2.put(&Frame::from_data("y1")).unwrap();

        let got: Vec<String> = (0..3)
            .map(|_| {
                let f = endpoint.get().unwrap().unwrap();
                f.data().and_then(|v| v.as_str()).unwrap().to_string()
            })
            .collect();
        assert_eq!(got, vec!["x1", "y1", "x2"]);
        assert!(endpoint.get().unwrap().is_none());
    }

    #[test]
    fn test_emit_goes_downstream() {
        let dir = tempfile::tempdir().unwrap();
        let (mut endpoint, tx, space) = setup(&dir);
        wire(&tx, &dir);

        assert!(endpoint.emit(&Frame::from_data("out")).unwrap());
        let c = queue(&space, "b:c");
        assert_eq!(c.pending(), 1);
    }

    #[test]
    fn test_should_terminate_waits_for_inputs() {
        let dir = tempfile::tempdir().unwrap();
        let (mut endpoint, tx, space) = setup(&dir);
        wire(&tx, &dir);
        assert!(!endpoint.should_terminate());

        queue(&space, "a1:b").put(&Frame::from_data("late")).unwrap();
        tx.send(ControlMessage::request_termination("b", "node")).unwrap();
        assert!(!endpoint.should_terminate());

        endpoint.get().unwrap().unwrap();
        assert!(endpoint.should_terminate());
    }

    #[test]
    fn test_registration_and_config() {
        let dir = tempfile::tempdir().unwrap();
        let (mut endpoint, tx, _) = setup(&dir);
        tx.send(ControlMessage::new(
            "b",
            "node",
            Scope::StageInstance,
            MessageKind::RegistrationInfo { instance_id: 7 },
        ))
        .unwrap();
        tx.send(ControlMessage::new(
            "b",
            "node",
            Scope::Stage,
            MessageKind::ConfigUpdate(serde_json::json!({"k": 1})),
        ))
        .unwrap();
        endpoint.poll_control().unwrap();
        assert_eq!(endpoint.instance_id(), Some(7));
        assert_eq!(endpoint.config()["k"], 1);
    }

    #[test]
    fn test_dropped_channel_terminates() {
        let dir = tempfile::tempdir().unwrap();
        let (mut endpoint, tx, _) = setup(&dir);
        drop(tx);
        assert!(endpoint.should_terminate());
    }

    #[test]
    fn test_get_sync_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let (mut endpoint, tx, _) = setup(&dir);
        wire(&tx, &dir);
        assert!(matches!(
            endpoint.get_sync(Duration::from_millis(30)),
            Err(QueueError::Timeout { .. })
        ));
    }
}
