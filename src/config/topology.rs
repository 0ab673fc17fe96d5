//! Pipeline topology descriptor
//!
//! A topology is a flat arena of stages and edges keyed by id; edges refer to
//! stages by id only. One edge is the pipeline sink. Edges may start at the
//! pipeline id itself (pipeline input) or end at it (the sink).

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::queue::MIN_QUEUE_SIZE;

/// Default edge size when neither the edge nor its consumer sets one
pub const DEFAULT_BUFFER_SIZE: usize = 1000 * 4096;

#[derive(Error, Debug, PartialEq)]
pub enum TopologyError {
    #[error("Topology parse error: {0}")]
    ParseError(String),

    #[error("Root stage '{0}' is not defined")]
    UndefinedRoot(String),

    #[error("Edge '{edge}' references undefined stage '{stage}'")]
    UndefinedStage { edge: String, stage: String },

    #[error("Sink edge '{0}' is not defined")]
    UndefinedSink(String),

    #[error("Sink edge '{0}' must start at a stage")]
    SinkWithoutProducer(String),

    #[error("Edge '{edge}' size {size} is below the minimum of {min}")]
    EdgeTooSmall { edge: String, size: usize, min: usize },

    #[error("Id '{0}' may only contain letters, digits, '_', '.', ':' and '-'")]
    InvalidId(String),

    #[error("Stage '{0}' is part of a cycle")]
    Cycle(String),

    #[error("No stage has an entry point or worker function")]
    NoRunnableStage,
}

/// Complete description of one pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Topology {
    pub name: String,
    pub id: String,
    pub root_stage: String,
    pub stages: BTreeMap<String, StageDescriptor>,
    #[serde(default)]
    pub edges: BTreeMap<String, EdgeDescriptor>,
    pub sink_edge: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageDescriptor {
    /// Filled from the map key when loaded
    #[serde(default)]
    pub id: String,
    /// Display name; also names the stage's control segment
    #[serde(default)]
    pub name: Option<String>,
    /// Executable (or script, with `interpreter`) run as a child process
    #[serde(default)]
    pub entry: Option<String>,
    /// In-process worker registered by name
    #[serde(default)]
    pub function: Option<String>,
    #[serde(default)]
    pub interpreter: Option<String>,
    #[serde(default)]
    pub settings: StageSettings,
    /// Opaque configuration handed to every instance on registration
    #[serde(default)]
    pub config: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageSettings {
    /// Upper bound on concurrently running instances
    #[serde(default = "default_autoscale")]
    pub autoscale: u32,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default)]
    pub host: Option<String>,
}

fn default_autoscale() -> u32 {
    1
}

fn default_buffer_size() -> usize {
    DEFAULT_BUFFER_SIZE
}

impl Default for StageSettings {
    fn default() -> Self {
        Self {
            autoscale: default_autoscale(),
            buffer_size: default_buffer_size(),
            host: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeDescriptor {
    /// Filled from the map key when loaded
    #[serde(default)]
    pub id: String,
    pub from: String,
    pub to: String,
    /// Segment size in bytes; defaults to the consumer's buffer size
    #[serde(default)]
    pub size: Option<usize>,
    #[serde(default)]
    pub host: Option<String>,
}

impl EdgeDescriptor {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        let from = from.into();
        let to = to.into();
        Self {
            id: format!("{}:{}", from, to),
            from,
            to,
            size: None,
            host: None,
        }
    }

    pub fn with_size(mut self, size: usize) -> Self {
        self.size = Some(size);
        self
    }

    pub fn size_or_default(&self) -> usize {
        self.size.unwrap_or(DEFAULT_BUFFER_SIZE)
    }
}

impl StageDescriptor {
    pub fn function(name: impl Into<String>) -> Self {
        Self {
            function: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn entry(path: impl Into<String>) -> Self {
        Self {
            entry: Some(path.into()),
            ..Default::default()
        }
    }

    pub fn with_interpreter(mut self, interpreter: impl Into<String>) -> Self {
        self.interpreter = Some(interpreter.into());
        self
    }

    pub fn with_autoscale(mut self, autoscale: u32) -> Self {
        self.settings.autoscale = autoscale;
        self
    }

    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    pub fn is_runnable(&self) -> bool {
        self.entry.is_some() || self.function.is_some()
    }
}

impl Topology {
    pub fn new(name: impl Into<String>, id: impl Into<String>, root: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: id.into(),
            root_stage: root.into(),
            stages: BTreeMap::new(),
            edges: BTreeMap::new(),
            sink_edge: String::new(),
        }
    }

    pub fn with_stage(mut self, id: impl Into<String>, mut stage: StageDescriptor) -> Self {
        let id = id.into();
        stage.id = id.clone();
        self.stages.insert(id, stage);
        self
    }

    pub fn with_edge(mut self, edge: EdgeDescriptor) -> Self {
        self.edges.insert(edge.id.clone(), edge);
        self
    }

    /// Add the sink edge from `stage` back to the pipeline
    pub fn with_sink(mut self, stage: &str, size: usize) -> Self {
        let edge = EdgeDescriptor::new(stage, self.id.clone()).with_size(size);
        self.sink_edge = edge.id.clone();
        self.edges.insert(edge.id.clone(), edge);
        self
    }

    /// Copy map keys into the descriptors and resolve edge sizes
    pub fn normalize(&mut self) {
        for (id, stage) in self.stages.iter_mut() {
            stage.id = id.clone();
        }
        for (id, edge) in self.edges.iter_mut() {
            edge.id = id.clone();
            if edge.size.is_none() {
                let consumer = self.stages.get(&edge.to);
                edge.size = Some(
                    consumer
                        .map(|s| s.settings.buffer_size)
                        .unwrap_or(DEFAULT_BUFFER_SIZE),
                );
            }
        }
    }

    fn is_stage(&self, id: &str) -> bool {
        self.stages.contains_key(id)
    }

    pub fn sink(&self) -> Option<&EdgeDescriptor> {
        self.edges.get(&self.sink_edge)
    }

    /// Edges consumed by `stage`
    pub fn inbound_edges<'a>(&'a self, stage: &'a str) -> impl Iterator<Item = &'a EdgeDescriptor> {
        self.edges.values().filter(move |e| e.to == stage)
    }

    /// Edges produced by `stage`, excluding the sink
    pub fn outbound_edges<'a>(&'a self, stage: &'a str) -> impl Iterator<Item = &'a EdgeDescriptor> {
        self.edges
            .values()
            .filter(move |e| e.from == stage && e.id != self.sink_edge)
    }

    /// Edges fed by the pipeline itself
    pub fn input_edges(&self) -> impl Iterator<Item = &EdgeDescriptor> {
        self.edges.values().filter(move |e| e.from == self.id)
    }

    /// Stages directly consuming from `stage`
    pub fn downstream(&self, stage: &str) -> Vec<&str> {
        let found: BTreeSet<&str> = self
            .edges
            .values()
            .filter(|e| e.from == stage && self.is_stage(&e.to))
            .map(|e| e.to.as_str())
            .collect();
        found.into_iter().collect()
    }

    /// Every stage with a data path into `stage`
    pub fn upstream(&self, stage: &str) -> BTreeSet<&str> {
        let mut seen = BTreeSet::new();
        let mut frontier = vec![stage];
        while let Some(current) = frontier.pop() {
            for edge in self.edges.values() {
                if edge.to == current && self.is_stage(&edge.from) && seen.insert(edge.from.as_str()) {
                    frontier.push(edge.from.as_str());
                }
            }
        }
        seen
    }

    /// Breadth-first drain order from the root.
    ///
    /// A stage reached again through a longer path moves to the back, so every
    /// stage comes after all of its producers. Stages unreachable from the
    /// root are appended last.
    pub fn drain_order(&self) -> Vec<String> {
        let mut order: Vec<&str> = Vec::new();
        let mut frontier = VecDeque::new();

        if self.is_stage(&self.root_stage) {
            order.push(&self.root_stage);
            frontier.push_back(self.root_stage.as_str());
        }

        // Bounds the walk on graphs that skipped validation
        let mut budget = self.stages.len() * self.stages.len() + self.edges.len();
        while let Some(stage) = frontier.pop_front() {
            for child in self.downstream(stage) {
                if let Some(pos) = order.iter().position(|s| *s == child) {
                    if pos == 0 || budget == 0 {
                        continue;
                    }
                    budget -= 1;
                    order.remove(pos);
                }
                order.push(child);
                frontier.push_back(child);
            }
        }

        for id in self.stages.keys() {
            if !order.contains(&id.as_str()) {
                order.push(id);
            }
        }
        order.into_iter().map(String::from).collect()
    }
}

/// Parse a topology from JSON or YAML text
pub fn parse_topology(content: &str, yaml: bool) -> Result<Topology, TopologyError> {
    let mut topology: Topology = if yaml {
        serde_yaml::from_str(content).map_err(|e| TopologyError::ParseError(e.to_string()))?
    } else {
        serde_json::from_str(content).map_err(|e| TopologyError::ParseError(e.to_string()))?
    };
    topology.normalize();
    validate_topology(&topology)?;
    Ok(topology)
}

/// Validate a topology for consistency.
/// This is a pure function - no I/O.
pub fn validate_topology(topology: &Topology) -> Result<(), TopologyError> {
    let id_pattern = Regex::new(r"^[A-Za-z0-9_.:-]+$")
        .map_err(|e| TopologyError::ParseError(e.to_string()))?;

    // Stage names key the per-stage control segment, so they obey the same rule
    let ids = std::iter::once(&topology.id)
        .chain(topology.stages.keys())
        .chain(topology.stages.values().filter_map(|s| s.name.as_ref()))
        .chain(topology.edges.keys());
    for id in ids {
        if !id_pattern.is_match(id) {
            return Err(TopologyError::InvalidId(id.clone()));
        }
    }

    if !topology.is_stage(&topology.root_stage) {
        return Err(TopologyError::UndefinedRoot(topology.root_stage.clone()));
    }

    for edge in topology.edges.values() {
        for end in [&edge.from, &edge.to] {
            if !topology.is_stage(end) && *end != topology.id {
                return Err(TopologyError::UndefinedStage {
                    edge: edge.id.clone(),
                    stage: end.clone(),
                });
            }
        }
        let size = edge.size_or_default();
        if size < MIN_QUEUE_SIZE {
            return Err(TopologyError::EdgeTooSmall {
                edge: edge.id.clone(),
                size,
                min: MIN_QUEUE_SIZE,
            });
        }
    }

    let sink = topology
        .sink()
        .ok_or_else(|| TopologyError::UndefinedSink(topology.sink_edge.clone()))?;
    if !topology.is_stage(&sink.from) {
        return Err(TopologyError::SinkWithoutProducer(sink.id.clone()));
    }

    if !topology.stages.values().any(StageDescriptor::is_runnable) {
        return Err(TopologyError::NoRunnableStage);
    }

    check_acyclic(topology)
}

fn check_acyclic(topology: &Topology) -> Result<(), TopologyError> {
    fn visit<'a>(
        topology: &'a Topology,
        stage: &'a str,
        path: &mut HashSet<&'a str>,
        done: &mut HashSet<&'a str>,
    ) -> Result<(), TopologyError> {
        if done.contains(stage) {
            return Ok(());
        }
        if !path.insert(stage) {
            return Err(TopologyError::Cycle(stage.to_string()));
        }
        for child in topology.downstream(stage) {
            visit(topology, child, path, done)?;
        }
        path.remove(stage);
        done.insert(stage);
        Ok(())
    }

    let mut done = HashSet::new();
    for stage in topology.stages.keys() {
        visit(topology, stage, &mut HashSet::new(), &mut done)?;
    }
    Ok(())
}
