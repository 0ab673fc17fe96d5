use clap::{ArgAction, Parser};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "shmflow")]
#[command(about = "Run a dataflow pipeline over shared-memory queues")]
#[command(version)]
pub struct Args {
    /// Path to the topology file (JSON or YAML)
    #[arg(required = true)]
    pub topology_file: PathBuf,

    /// Node configuration file (JSON or YAML)
    #[arg(short, long, value_name = "FILE", env = "SHMFLOW_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging output (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Validate the topology and show the drain plan without running
    #[arg(long)]
    pub dry_run: bool,

    /// JSON lines fed to the pipeline input, one frame per line
    #[arg(short, long, value_name = "FILE")]
    pub input: Option<PathBuf>,

    /// Override the segment directory
    #[arg(long, value_name = "DIR", env = "SHMFLOW_SEGMENT_DIR")]
    pub segment_dir: Option<PathBuf>,

    /// Path to a .env file exported to stage processes
    #[arg(long, value_name = "FILE")]
    pub env_file: Option<PathBuf>,

    /// Seconds to wait for a drain after Ctrl-C before killing stages
    #[arg(long, default_value = "30")]
    pub grace: u64,
}

// ============================================================================
// Pure display logic (returns formatted strings)
// ============================================================================

use crate::config::Topology;

/// Format a dry-run summary of the pipeline.
pub fn format_dry_run(topology: &Topology, args: &Args) -> String {
    let mut output = String::new();

    output.push_str(&format!(
        "shmflow v{} - Dry Run Mode\n\n",
        env!("CARGO_PKG_VERSION")
    ));
    output.push_str(&format!("Topology: {}\n", args.topology_file.display()));
    output.push_str(&format!(
        "Pipeline: {} ({})\n\n",
        topology.name, topology.id
    ));

    output.push_str(&format!("Stages ({}):\n", topology.stages.len()));
    for (id, stage) in &topology.stages {
        let kind = match (&stage.function, &stage.entry) {
            (Some(f), _) => format!("worker {}", f),
            (None, Some(entry)) => match &stage.interpreter {
                Some(i) => format!("{} {}", i, entry),
                None => entry.clone(),
            },
            (None, None) => "not runnable".to_string(),
        };
        let root = if *id == topology.root_stage { " (root)" } else { "" };
        output.push_str(&format!(
            "  - {}{} [{}] x{}\n",
            id, root, kind, stage.settings.autoscale
        ));
    }
    output.push('\n');

    output.push_str(&format!("Edges ({}):\n", topology.edges.len()));
    for edge in topology.edges.values() {
        let sink = if edge.id == topology.sink_edge {
            " (sink)"
        } else {
            ""
        };
        output.push_str(&format!(
            "  {} -> {} ({} bytes){}\n",
            edge.from,
            edge.to,
            edge.size_or_default(),
            sink
        ));
    }
    output.push('\n');

    output.push_str(&format!(
        "Drain order: {}\n\n",
        topology.drain_order().join(" -> ")
    ));

    match crate::config::validate_topology(topology) {
        Ok(()) => output.push_str("Validation: PASSED\n"),
        Err(e) => output.push_str(&format!("Validation: FAILED ({})\n", e)),
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EdgeDescriptor, StageDescriptor};

    fn create_test_args() -> Args {
        Args {
            topology_file: PathBuf::from("pipe.yaml"),
            config: None,
            verbose: 0,
            dry_run: true,
            input: None,
            segment_dir: None,
            env_file: None,
            grace: 30,
        }
    }

    #[test]
    fn test_format_dry_run_basic() {
        let topology = Topology::new("words", "p1", "split")
            .with_stage("split", StageDescriptor::function("passthrough"))
            .with_stage(
                "count",
                StageDescriptor::entry("count.py")
                    .with_interpreter("python3")
                    .with_autoscale(4),
            )
            .with_edge(EdgeDescriptor::new("p1", "split"))
            .with_edge(EdgeDescriptor::new("split", "count"))
            .with_sink("count", 4096);

        let output = format_dry_run(&topology, &create_test_args());

        assert!(output.contains("Pipeline: words (p1)"));
        assert!(output.contains("split (root) [worker passthrough]"));
        assert!(output.contains("count [python3 count.py] x4"));
        assert!(output.contains("Drain order: split -> count"));
        assert!(output.contains("Validation: PASSED"));
    }

    #[test]
    fn test_clap_parsing() {
        let args = Args::parse_from(["shmflow", "pipe.yaml"]);
        assert_eq!(args.topology_file, PathBuf::from("pipe.yaml"));
        assert!(!args.dry_run);
        assert_eq!(args.grace, 30);
    }

    #[test]
    fn test_clap_verbose() {
        let args = Args::parse_from(["shmflow", "-vv", "pipe.yaml"]);
        assert_eq!(args.verbose, 2);
    }

    #[test]
    fn test_clap_overrides() {
        let args = Args::parse_from([
            "shmflow",
            "--config",
            "node.yaml",
            "--input",
            "frames.jsonl",
            "--segment-dir",
            "/tmp/seg",
            "pipe.yaml",
        ]);
        assert_eq!(args.config, Some(PathBuf::from("node.yaml")));
        assert_eq!(args.input, Some(PathBuf::from("frames.jsonl")));
        assert_eq!(args.segment_dir, Some(PathBuf::from("/tmp/seg")));
    }
}
