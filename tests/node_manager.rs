//! Registration contract between the node and the processes it launches
//!
//! A stage process is simulated by a shell script that only sleeps; the test
//! plays its side of the handshake through the node's methods.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use shmflow::codec::{Frame, FrameCodec, Value};
use shmflow::config::{EdgeDescriptor, NodeConfig, StageDescriptor, Topology};
use shmflow::protocol::{MessageKind, PipeStatus, ServerKind, StageRef};
use shmflow::runtime::{spawn_node_manager, InstanceState, NodeManager, RuntimeError, WorkerRegistry};

fn node(dir: &Path) -> NodeManager {
    let config = NodeConfig::default()
        .with_segment_dir(dir.join("segments"))
        .with_node_id("node-a")
        .with_monitor_interval(Duration::from_millis(10))
        .with_tick_interval(Duration::from_millis(20));
    NodeManager::new(config, WorkerRegistry::with_builtins()).unwrap()
}

fn sleeper(dir: &Path) -> StageDescriptor {
    let script = dir.join("sleeper.sh");
    std::fs::write(&script, "exec sleep 30\n").unwrap();
    StageDescriptor::entry(script.to_string_lossy().to_string())
        .with_interpreter("sh")
        .with_config(serde_json::json!({"threshold": 3}))
}

fn topology(dir: &Path) -> Topology {
    Topology::new("contract", "pc", "ext")
        .with_stage("ext", sleeper(dir))
        .with_edge(EdgeDescriptor::new("pc", "ext").with_size(4096))
        .with_sink("ext", 4096)
}

#[test]
fn test_load_register_attach_terminate() {
    let dir = tempfile::tempdir().unwrap();
    let node = node(dir.path());

    let server = node.load_pipe(topology(dir.path())).unwrap();
    assert_eq!(server.kind, ServerKind::Node);
    assert_eq!(server.name, "node-a");
    assert_eq!(server.pid, std::process::id());
    assert!(matches!(
        node.load_pipe(topology(dir.path())),
        Err(RuntimeError::PipelineAlreadyExists(_))
    ));

    node.start_pipe("pc").unwrap();
    let child = node
        .with_pipe("pc", |p| {
            let stage = p.stage("ext").unwrap();
            assert_eq!(stage.instances()[0].state(), InstanceState::Launched);
            stage.instances()[0].child_pid()
        })
        .unwrap()
        .unwrap();

    let stage = StageRef::new("pc", "ext");
    let response = node.register_stage(child, &stage).unwrap();
    assert_eq!(response.config["threshold"], 3);
    assert_eq!(response.messages.len(), 2);
    assert!(matches!(
        response.messages[0].kind,
        MessageKind::RegistrationInfo { instance_id } if instance_id == response.instance_id
    ));
    match &response.messages[1].kind {
        MessageKind::QUpdate(update) => {
            assert_eq!(update.stage_id, "ext");
            assert_eq!(update.inbound.len(), 1);
            assert!(update.outbound.is_empty());
            assert_eq!(update.sink.as_ref().map(|e| e.id.as_str()), Some("ext:pc"));
        }
        other => panic!("expected Q_UPDATE, got {}", other.type_name()),
    }

    // No second instance is waiting
    assert!(matches!(
        node.register_stage(child, &stage),
        Err(RuntimeError::NoPendingInstance(_))
    ));

    let control = node.attach_control(&stage, response.instance_id).unwrap();
    node.terminate_pipe("pc").unwrap();
    // Status broadcasts queued before attach arrive first
    let mut kinds = Vec::new();
    while let Ok(msg) = control.recv_timeout(Duration::from_secs(5)) {
        let done = msg.kind == MessageKind::RequestTermination;
        kinds.push(msg.kind);
        if done {
            break;
        }
    }
    assert_eq!(kinds.last(), Some(&MessageKind::RequestTermination));
    assert!(kinds.contains(&MessageKind::PipeStatus {
        status: PipeStatus::PendingTermination
    }));
    assert_eq!(node.pipe_status("pc"), Some(PipeStatus::PendingTermination));

    node.kill_all();
}

#[test]
fn test_push_queue_delivers_serialized_frame() {
    let dir = tempfile::tempdir().unwrap();
    let node = node(dir.path());
    node.load_pipe(topology(dir.path())).unwrap();

    let codec = FrameCodec::new();
    let bytes = codec
        .encode_frame(&Frame::from_data("remote").with_field("hop", 1u8))
        .unwrap();
    let edge = EdgeDescriptor::new("pc", "ext");
    assert!(node.push_queue(&edge, &bytes).unwrap().success);

    let missing = EdgeDescriptor::new("nowhere", "ext");
    assert!(!node.push_queue(&missing, &bytes).unwrap().success);

    let frame = node
        .with_pipe("pc", |p| p.queue("pc:ext").unwrap().get().unwrap())
        .unwrap()
        .unwrap();
    assert_eq!(frame.data().and_then(Value::as_str), Some("remote"));
    assert_eq!(frame.get("hop").and_then(Value::as_u64), Some(1));
}

#[tokio::test]
async fn test_node_loop_completes_worker_pipe() {
    let dir = tempfile::tempdir().unwrap();
    let node = Arc::new(node(dir.path()));
    let topology = Topology::new("workers", "pw", "w")
        .with_stage("w", StageDescriptor::function("passthrough"))
        .with_edge(EdgeDescriptor::new("pw", "w").with_size(4096))
        .with_sink("w", 4096);
    node.load_pipe(topology).unwrap();
    node.start_pipe("pw").unwrap();
    let mut status = node.subscribe("pw").unwrap();

    let (shutdown, handle) = spawn_node_manager(node.clone());

    assert!(node.push_input("pw", Frame::from_data("through")).unwrap());
    let out = loop {
        if let Some(frame) = node.collect("pw").unwrap() {
            break frame;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    };
    assert_eq!(out.data().and_then(Value::as_str), Some("through"));

    node.terminate_pipe("pw").unwrap();
    let completed = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match status.recv().await {
                Ok(msg) if msg.kind == (MessageKind::PipeStatus { status: PipeStatus::Completed }) => {
                    break
                }
                Ok(_) => continue,
                Err(e) => panic!("status channel closed: {}", e),
            }
        }
    })
    .await;
    assert!(completed.is_ok());
    assert_eq!(node.live_pipes(), 0);

    shutdown.send(true).unwrap();
    handle.await.unwrap();
    assert!(node.status_snapshot().ticks > 0);
}
