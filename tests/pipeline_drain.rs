//! Drain ordering on a linear pipeline a -> b -> c
//!
//! Producers must stop before their consumers are told to stop, and every
//! frame already in flight must still reach the sink.

use std::sync::Arc;
use std::time::{Duration, Instant};

use shmflow::codec::{Frame, Value, DATA_KEY};
use shmflow::config::{EdgeDescriptor, NodeConfig, StageDescriptor, Topology};
use shmflow::protocol::PipeStatus;
use shmflow::runtime::{PipeController, RuntimeContext, StageEndpoint, WorkerRegistry};

fn context(dir: &tempfile::TempDir) -> RuntimeContext {
    let workers = WorkerRegistry::with_builtins();
    // Adds one to the integer payload
    workers.register("increment", |endpoint: &mut StageEndpoint| {
        endpoint.serve(|mut frame| {
            let n = frame.data().and_then(Value::as_u64).unwrap_or(0);
            frame.set(DATA_KEY, n + 1);
            Ok(Some(frame))
        })
    });
    let config = NodeConfig::default()
        .with_segment_dir(dir.path())
        .with_node_id("drain-test")
        .with_monitor_interval(Duration::from_millis(10));
    RuntimeContext::new(&config, Arc::new(workers))
}

fn linear() -> Topology {
    Topology::new("linear", "lin", "a")
        .with_stage("a", StageDescriptor::function("increment"))
        .with_stage("b", StageDescriptor::function("increment"))
        .with_stage("c", StageDescriptor::function("passthrough"))
        .with_edge(EdgeDescriptor::new("lin", "a").with_size(8192))
        .with_edge(EdgeDescriptor::new("a", "b").with_size(8192))
        .with_edge(EdgeDescriptor::new("b", "c").with_size(8192))
        .with_sink("c", 8192)
}

#[test]
fn test_linear_drain_order_and_delivery() {
    let dir = tempfile::tempdir().unwrap();
    let mut pipe = PipeController::new(linear(), context(&dir));
    pipe.load().unwrap();
    assert_eq!(pipe.drain_order(), ["a", "b", "c"]);
    pipe.start().unwrap();

    for i in 0..20u64 {
        assert!(pipe.push_input(Frame::from_data(i)).unwrap());
    }
    pipe.request_termination().unwrap();
    assert_eq!(pipe.status(), PipeStatus::PendingTermination);
    assert_eq!(pipe.signaled_stages(), ["a"]);

    let mut results = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(20);
    while pipe.status() != PipeStatus::Completed {
        assert!(Instant::now() < deadline, "drain did not finish");
        pipe.monitor(10);

        let signaled = pipe.signaled_stages();
        if signaled.iter().any(|s| s == "b") {
            assert_eq!(pipe.stage("a").unwrap().live_instances(), 0);
        }
        if signaled.iter().any(|s| s == "c") {
            assert_eq!(pipe.stage("a").unwrap().live_instances(), 0);
            assert_eq!(pipe.stage("b").unwrap().live_instances(), 0);
        }

        while let Some(frame) = pipe.collect().unwrap() {
            results.push(frame);
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    while let Some(frame) = pipe.collect().unwrap() {
        results.push(frame);
    }

    assert_eq!(pipe.signaled_stages(), ["a", "b", "c"]);
    assert_eq!(pipe.total_live(), 0);
    let values: Vec<u64> = results
        .iter()
        .filter_map(|f| f.data().and_then(Value::as_u64))
        .collect();
    assert_eq!(values, (2..22).collect::<Vec<u64>>());
    assert!(results.iter().all(|f| f.pipeline_id().is_some()));
}

#[test]
fn test_pause_and_resume_keeps_instances() {
    let dir = tempfile::tempdir().unwrap();
    let mut pipe = PipeController::new(linear(), context(&dir));
    pipe.load().unwrap();
    pipe.start().unwrap();
    let live = pipe.total_live();

    pipe.pause().unwrap();
    assert_eq!(pipe.status(), PipeStatus::Paused);
    assert!(pipe.pause().is_err());

    pipe.start().unwrap();
    assert_eq!(pipe.status(), PipeStatus::Running);
    assert_eq!(pipe.total_live(), live);

    pipe.request_termination().unwrap();
    let deadline = Instant::now() + Duration::from_secs(10);
    while pipe.status() != PipeStatus::Completed && Instant::now() < deadline {
        pipe.monitor(10);
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(pipe.status(), PipeStatus::Completed);
}
