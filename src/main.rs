use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use shmflow::cli::{format_dry_run, Args};
use shmflow::codec::Frame;
use shmflow::config::{load_node_config, load_topology_file, NodeConfig};
use shmflow::protocol::PipeStatus;
use shmflow::runtime::{spawn_node_manager, NodeManager, WorkerRegistry};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let filter = match args.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    // Stage processes inherit the environment
    if let Some(ref env_file) = args.env_file {
        dotenvy::from_path(env_file)
            .with_context(|| format!("Failed to load env file {}", env_file.display()))?;
    }

    let topology = load_topology_file(&args.topology_file).with_context(|| {
        format!(
            "Failed to load topology file {}",
            args.topology_file.display()
        )
    })?;

    if args.dry_run {
        println!("{}", format_dry_run(&topology, &args));
        return Ok(());
    }

    let mut config = match &args.config {
        Some(path) => load_node_config(path)
            .with_context(|| format!("Failed to load node config {}", path.display()))?,
        None => NodeConfig::default(),
    };
    if let Some(dir) = &args.segment_dir {
        config = config.with_segment_dir(dir);
    }

    let node = Arc::new(NodeManager::new(config, WorkerRegistry::with_builtins())?);
    let pipe_id = topology.id.clone();
    node.load_pipe(topology)?;
    node.start_pipe(&pipe_id)?;
    info!("Pipeline '{}' running", pipe_id);

    let (shutdown_tx, node_task) = spawn_node_manager(node.clone());

    let feeder = {
        let node = node.clone();
        let pipe_id = pipe_id.clone();
        let input = args.input.clone();
        tokio::spawn(async move {
            if let Some(path) = input {
                if let Err(e) = feed_input(&node, &pipe_id, &path).await {
                    warn!("Input feed stopped: {}", e);
                }
                // Input exhausted: drain and finish
                if let Err(e) = node.terminate_pipe(&pipe_id) {
                    warn!("Failed to terminate '{}': {}", pipe_id, e);
                }
            }
        })
    };

    tokio::select! {
        result = collect_output(&node, &pipe_id) => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, draining pipeline '{}'", pipe_id);
            node.terminate_pipe(&pipe_id)?;
            let grace = Duration::from_secs(args.grace);
            if tokio::time::timeout(grace, collect_output(&node, &pipe_id)).await.is_err() {
                warn!("Drain did not finish within {}s, killing stages", args.grace);
                node.kill_all();
            }
        }
    }

    feeder.abort();
    let _ = shutdown_tx.send(true);
    if let Err(e) = node_task.await {
        warn!("Node task failed: {}", e);
    }
    info!("Pipeline '{}' finished", pipe_id);
    Ok(())
}

/// Push every JSON line of `path` into the pipeline input
async fn feed_input(node: &NodeManager, pipe_id: &str, path: &Path) -> Result<()> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read input {}", path.display()))?;

    for (n, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let value: serde_json::Value = serde_json::from_str(line)
            .with_context(|| format!("{}:{}: not JSON", path.display(), n + 1))?;
        let frame = Frame::from_data(value);
        while !node.push_input(pipe_id, frame.clone())? {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
    Ok(())
}

/// Print sink frames as JSON lines until the pipeline completes
async fn collect_output(node: &NodeManager, pipe_id: &str) -> Result<()> {
    loop {
        match node.collect(pipe_id)? {
            Some(frame) => {
                let data = frame
                    .data()
                    .map(|v| v.to_json())
                    .unwrap_or(serde_json::Value::Null);
                println!("{}", data);
            }
            None => {
                if node.pipe_status(pipe_id) == Some(PipeStatus::Completed) {
                    return Ok(());
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }
}
