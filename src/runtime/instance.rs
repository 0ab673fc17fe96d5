//! One running copy of a stage
//!
//! An instance is either a child process started from the stage's `entry`
//! or a thread running a registered worker function. Either way a background
//! monitor records the exit code, and captured output lands in a channel the
//! node drains once per tick.

use std::io::{BufRead, BufReader, Read};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, warn};

use super::endpoint::StageEndpoint;
use super::worker::WorkerFn;
use crate::config::StageDescriptor;
use crate::metrics::ProcessUsage;
use crate::protocol::ControlMessage;

/// Exit code recorded for workers that fail or panic, and for children
/// killed by a signal
const FAILURE_EXIT_CODE: i32 = 1;

#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("Stage '{0}' has no entry point or worker function")]
    NoEntry(String),

    #[error("Stage '{stage}' names unknown worker function '{function}'")]
    UnknownFunction { stage: String, function: String },

    #[error("Failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },

    #[error("Failed to start thread: {0}")]
    Thread(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceState {
    Launched,
    Ready,
    Running,
    PendingTermination,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceKind {
    Process,
    Worker,
}

/// Where the process environment tells a child to find the node
pub const ENV_PIPE: &str = "SHMFLOW_PIPE";
pub const ENV_STAGE: &str = "SHMFLOW_STAGE";
pub const ENV_SEGMENT_DIR: &str = "SHMFLOW_SEGMENT_DIR";

pub struct StageInstance {
    stage_id: String,
    name: String,
    kind: InstanceKind,
    state: InstanceState,
    instance_id: Option<u32>,
    pid: Option<u32>,
    child_pid: Option<u32>,
    control: Option<Sender<ControlMessage>>,
    queued: Vec<ControlMessage>,
    output: Receiver<String>,
    exit: Arc<Mutex<Option<i32>>>,
    exit_code: Option<i32>,
    kill_tx: Option<Sender<()>>,
    monitor: Option<JoinHandle<()>>,
    usage: ProcessUsage,
    launched_at: DateTime<Utc>,
    scaling_down: bool,
}

impl StageInstance {
    fn base(stage: &StageDescriptor, kind: InstanceKind, output: Receiver<String>) -> Self {
        Self {
            stage_id: stage.id.clone(),
            name: stage.display_name().to_string(),
            kind,
            state: InstanceState::Launched,
            instance_id: None,
            pid: None,
            child_pid: None,
            control: None,
            queued: Vec::new(),
            output,
            exit: Arc::new(Mutex::new(None)),
            exit_code: None,
            kill_tx: None,
            monitor: None,
            usage: ProcessUsage::default(),
            launched_at: Utc::now(),
            scaling_down: false,
        }
    }

    /// Start the stage's entry as a child process.
    ///
    /// The instance stays LAUNCHED until the child registers.
    pub fn spawn_process(
        stage: &StageDescriptor,
        pipe_id: &str,
        segment_dir: &std::path::Path,
        monitor_interval: Duration,
    ) -> Result<Self, LaunchError> {
        let entry = stage
            .entry
            .as_deref()
            .ok_or_else(|| LaunchError::NoEntry(stage.id.clone()))?;
        let entry = shellexpand::tilde(entry).into_owned();

        let mut command = match &stage.interpreter {
            Some(interpreter) => {
                let mut c = Command::new(shellexpand::tilde(interpreter).into_owned());
                c.arg(&entry);
                c
            }
            None => Command::new(&entry),
        };
        let command_line = match &stage.interpreter {
            Some(i) => format!("{} {}", i, entry),
            None => entry.clone(),
        };

        let mut child = command
            .env(ENV_PIPE, pipe_id)
            .env(ENV_STAGE, &stage.id)
            .env(ENV_SEGMENT_DIR, segment_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| LaunchError::Spawn {
                command: command_line.clone(),
                source,
            })?;

        let (out_tx, out_rx) = crossbeam_channel::unbounded();
        if let Some(stdout) = child.stdout.take() {
            spawn_reader(stdout, out_tx.clone(), &stage.id)?;
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_reader(stderr, out_tx, &stage.id)?;
        }

        let mut instance = Self::base(stage, InstanceKind::Process, out_rx);
        instance.child_pid = Some(child.id());

        let (kill_tx, kill_rx) = crossbeam_channel::bounded::<()>(1);
        let exit = instance.exit.clone();
        let label = stage.id.clone();
        let monitor = std::thread::Builder::new()
            .name(format!("monitor-{}", stage.id))
            .spawn(move || loop {
                match child.try_wait() {
                    Ok(Some(status)) => {
                        *exit.lock() = Some(status.code().unwrap_or(FAILURE_EXIT_CODE));
                        break;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!("Lost track of '{}' child: {}", label, e);
                        *exit.lock() = Some(FAILURE_EXIT_CODE);
                        break;
                    }
                }
                match kill_rx.recv_timeout(monitor_interval) {
                    Ok(()) => {
                        if let Err(e) = child.kill() {
                            warn!("Failed to kill '{}' child: {}", label, e);
                        }
                    }
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => std::thread::sleep(monitor_interval),
                }
            })?;

        instance.kill_tx = Some(kill_tx);
        instance.monitor = Some(monitor);
        debug!(
            "Spawned '{}' for stage '{}' (pid {:?})",
            command_line, stage.id, instance.child_pid
        );
        Ok(instance)
    }

    /// Run `worker` on its own thread against `endpoint`
    pub fn spawn_worker(
        stage: &StageDescriptor,
        worker: WorkerFn,
        endpoint: StageEndpoint,
    ) -> Result<Self, LaunchError> {
        let (out_tx, out_rx) = crossbeam_channel::unbounded();
        let mut endpoint = endpoint.with_output(out_tx);
        let mut instance = Self::base(stage, InstanceKind::Worker, out_rx);

        let exit = instance.exit.clone();
        let label = stage.id.clone();
        let handle = std::thread::Builder::new()
            .name(format!("stage-{}", stage.id))
            .spawn(move || {
                let code = match catch_unwind(AssertUnwindSafe(|| worker(&mut endpoint))) {
                    Ok(Ok(())) => 0,
                    Ok(Err(e)) => {
                        error!("Worker for stage '{}' failed: {:#}", label, e);
                        FAILURE_EXIT_CODE
                    }
                    Err(_) => {
                        error!("Worker for stage '{}' panicked", label);
                        FAILURE_EXIT_CODE
                    }
                };
                *exit.lock() = Some(code);
            })?;

        instance.monitor = Some(handle);
        Ok(instance)
    }

    pub fn stage_id(&self) -> &str {
        &self.stage_id
    }

    pub fn kind(&self) -> InstanceKind {
        self.kind
    }

    pub fn state(&self) -> InstanceState {
        self.state
    }

    pub fn instance_id(&self) -> Option<u32> {
        self.instance_id
    }

    /// Registered pid, or the child's pid before registration
    pub fn pid(&self) -> Option<u32> {
        self.pid.or(self.child_pid)
    }

    pub fn child_pid(&self) -> Option<u32> {
        self.child_pid
    }

    pub fn launched_at(&self) -> DateTime<Utc> {
        self.launched_at
    }

    pub fn is_live(&self) -> bool {
        self.state != InstanceState::Done
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    /// Registration handshake: LAUNCHED -> READY
    pub fn register(&mut self, instance_id: u32, pid: u32) {
        self.instance_id = Some(instance_id);
        self.pid = Some(pid);
        if self.state == InstanceState::Launched {
            self.state = InstanceState::Ready;
        }
    }

    /// Connect the control channel, flushing anything queued before it
    pub fn attach_control(&mut self, control: Sender<ControlMessage>) {
        for msg in self.queued.drain(..) {
            if control.send(msg).is_err() {
                debug!("Instance of '{}' dropped its control channel", self.stage_id);
            }
        }
        self.control = Some(control);
        if self.state == InstanceState::Ready {
            self.state = InstanceState::Running;
        }
    }

    pub fn send(&mut self, msg: ControlMessage) {
        match &self.control {
            Some(tx) => {
                if tx.send(msg).is_err() {
                    debug!("Instance of '{}' dropped its control channel", self.stage_id);
                }
            }
            None => self.queued.push(msg),
        }
    }

    /// Ask the instance to finish; it exits on its own
    pub fn request_termination(&mut self, sender: &str) {
        if matches!(
            self.state,
            InstanceState::PendingTermination | InstanceState::Done
        ) {
            return;
        }
        self.send(ControlMessage::request_termination(self.stage_id.clone(), sender));
        self.state = InstanceState::PendingTermination;
    }

    pub fn mark_scaling_down(&mut self) {
        self.scaling_down = true;
    }

    pub fn is_scaling_down(&self) -> bool {
        self.scaling_down && self.is_live()
    }

    /// Exit code, reported exactly once when the instance finishes
    pub fn check_exit(&mut self) -> Option<i32> {
        if self.state == InstanceState::Done {
            return None;
        }
        let code = (*self.exit.lock())?;
        self.state = InstanceState::Done;
        self.exit_code = Some(code);
        if let Some(handle) = self.monitor.take() {
            if handle.join().is_err() {
                warn!("Monitor of '{}' panicked", self.stage_id);
            }
        }
        Some(code)
    }

    /// Forcefully stop a child process. Not data-safe.
    pub fn kill(&mut self) -> bool {
        if !self.is_live() {
            return false;
        }
        if self.kind == InstanceKind::Worker {
            warn!(
                "Worker of stage '{}' cannot be killed, asking it to stop",
                self.stage_id
            );
            self.request_termination("node");
            return false;
        }
        warn!(
            "Killing instance {:?} of stage '{}'",
            self.instance_id, self.stage_id
        );
        self.kill_tx
            .as_ref()
            .map(|tx| tx.try_send(()).is_ok())
            .unwrap_or(false)
    }

    /// Up to `max` captured lines, prefixed with `<stage>(<pid>)>>> `
    pub fn read_output(&self, max: usize) -> Vec<String> {
        let pid = self.pid().unwrap_or(0);
        self.output
            .try_iter()
            .take(max)
            .map(|line| format!("{}({})>>> {}", self.name, pid, line))
            .collect()
    }

    pub fn record_usage(&mut self, usage: ProcessUsage) {
        self.usage = if self.is_live() {
            usage
        } else {
            ProcessUsage::default()
        };
    }

    pub fn usage(&self) -> ProcessUsage {
        self.usage
    }
}

impl std::fmt::Debug for StageInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageInstance")
            .field("stage_id", &self.stage_id)
            .field("kind", &self.kind)
            .field("state", &self.state)
            .field("instance_id", &self.instance_id)
            .field("pid", &self.pid())
            .finish()
    }
}

fn spawn_reader<R: Read + Send + 'static>(
    stream: R,
    tx: Sender<String>,
    stage: &str,
) -> Result<(), LaunchError> {
    std::thread::Builder::new()
        .name(format!("output-{}", stage))
        .spawn(move || {
            for line in BufReader::new(stream).lines() {
                match line {
                    Ok(line) => {
                        if tx.send(line).is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::FrameCodec;
    use crate::protocol::{MessageKind, StageRef};
    use crate::queue::SegmentSpace;
    use std::time::Instant;

    fn wait_exit(instance: &mut StageInstance) -> i32 {
        let started = Instant::now();
        loop {
            if let Some(code) = instance.check_exit() {
                return code;
            }
            assert!(started.elapsed() < Duration::from_secs(10), "instance never exited");
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    fn endpoint(dir: &tempfile::TempDir) -> (StageEndpoint, Sender<ControlMessage>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let ep = StageEndpoint::new(
            StageRef::new("p", "w"),
            Arc::new(SegmentSpace::new(dir.path())),
            FrameCodec::new(),
            rx,
        );
        (ep, tx)
    }

    fn script_stage(dir: &tempfile::TempDir, id: &str, body: &str) -> StageDescriptor {
        let script = dir.path().join(format!("{}.sh", id));
        std::fs::write(&script, body).unwrap();
        StageDescriptor {
            id: id.to_string(),
            ..StageDescriptor::entry(script.to_string_lossy().to_string()).with_interpreter("sh")
        }
    }

    #[test]
    fn test_process_exit() {
        let dir = tempfile::tempdir().unwrap();
        let stage = script_stage(&dir, "quick", "exit 0\n");
        let mut instance =
            StageInstance::spawn_process(&stage, "p", dir.path(), Duration::from_millis(10))
                .unwrap();
        assert_eq!(instance.state(), InstanceState::Launched);
        assert!(instance.child_pid().is_some());
        assert_eq!(wait_exit(&mut instance), 0);
        assert_eq!(instance.state(), InstanceState::Done);
        assert_eq!(instance.check_exit(), None);
    }

    #[test]
    fn test_process_env_and_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let stage = script_stage(&dir, "greeter", "echo \"hi from $SHMFLOW_STAGE\"\nexit 3\n");

        let mut instance =
            StageInstance::spawn_process(&stage, "p", dir.path(), Duration::from_millis(10))
                .unwrap();
        assert_eq!(wait_exit(&mut instance), 3);

        // Reader thread may trail the exit slightly
        let started = Instant::now();
        let mut lines = Vec::new();
        while lines.is_empty() && started.elapsed() < Duration::from_secs(5) {
            lines = instance.read_output(3);
            std::thread::sleep(Duration::from_millis(10));
        }
        let pid = instance.child_pid().unwrap();
        assert_eq!(lines, vec![format!("greeter({})>>> hi from greeter", pid)]);
    }

    #[test]
    fn test_missing_entry_fails_to_spawn() {
        let dir = tempfile::tempdir().unwrap();
        let stage = StageDescriptor::entry("/definitely/not/here");
        assert!(matches!(
            StageInstance::spawn_process(&stage, "p", dir.path(), Duration::from_millis(10)),
            Err(LaunchError::Spawn { .. })
        ));
    }

    #[test]
    fn test_kill_child() {
        let dir = tempfile::tempdir().unwrap();
        let stage = script_stage(&dir, "sleeper", "sleep 30\n");
        let mut instance =
            StageInstance::spawn_process(&stage, "p", dir.path(), Duration::from_millis(20))
                .unwrap();
        assert!(instance.kill());
        assert_ne!(wait_exit(&mut instance), 0);
    }

    #[test]
    fn test_worker_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let (ep, tx) = endpoint(&dir);
        let worker: WorkerFn = Arc::new(|ep: &mut StageEndpoint| {
            while !ep.should_terminate() {
                std::thread::sleep(Duration::from_millis(5));
            }
            ep.print("bye");
            Ok(())
        });
        let stage = StageDescriptor {
            id: "w".to_string(),
            ..StageDescriptor::function("loop")
        };

        let mut instance = StageInstance::spawn_worker(&stage, worker, ep).unwrap();
        instance.register(1, std::process::id());
        assert_eq!(instance.state(), InstanceState::Ready);
        instance.attach_control(tx);
        assert_eq!(instance.state(), InstanceState::Running);

        instance.request_termination("node");
        assert_eq!(instance.state(), InstanceState::PendingTermination);
        assert_eq!(wait_exit(&mut instance), 0);
        let out = instance.read_output(3);
        assert_eq!(out.len(), 1);
        assert!(out[0].ends_with(">>> bye"));
    }

    #[test]
    fn test_worker_error_and_panic_exit_nonzero() {
        let dir = tempfile::tempdir().unwrap();
        let stage = StageDescriptor {
            id: "w".to_string(),
            ..StageDescriptor::function("bad")
        };

        let (ep, _tx) = endpoint(&dir);
        let failing: WorkerFn = Arc::new(|_: &mut StageEndpoint| anyhow::bail!("boom"));
        let mut instance = StageInstance::spawn_worker(&stage, failing, ep).unwrap();
        assert_eq!(wait_exit(&mut instance), FAILURE_EXIT_CODE);

        let (ep, _tx) = endpoint(&dir);
        let panicking: WorkerFn = Arc::new(|_: &mut StageEndpoint| panic!("kaboom"));
        let mut instance = StageInstance::spawn_worker(&stage, panicking, ep).unwrap();
        assert_eq!(wait_exit(&mut instance), FAILURE_EXIT_CODE);
    }

    #[test]
    fn test_messages_queued_until_attached() {
        let dir = tempfile::tempdir().unwrap();
        let (ep, tx) = endpoint(&dir);
        let (seen_tx, seen_rx) = crossbeam_channel::unbounded();
        let worker: WorkerFn = Arc::new(move |ep: &mut StageEndpoint| {
            while !ep.should_terminate() {
                std::thread::sleep(Duration::from_millis(5));
            }
            seen_tx.send(ep.instance_id()).ok();
            Ok(())
        });
        let stage = StageDescriptor {
            id: "w".to_string(),
            ..StageDescriptor::function("q")
        };
        let mut instance = StageInstance::spawn_worker(&stage, worker, ep).unwrap();

        instance.send(ControlMessage::new(
            "w",
            "node",
            crate::protocol::Scope::StageInstance,
            MessageKind::RegistrationInfo { instance_id: 9 },
        ));
        instance.request_termination("node");
        instance.attach_control(tx);

        assert_eq!(wait_exit(&mut instance), 0);
        assert_eq!(seen_rx.recv().unwrap(), Some(9));
    }
}
