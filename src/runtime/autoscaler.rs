//! Node-level autoscaling policy
//!
//! Host utilization is kept as a bounded history and averaged with
//! quadratically increasing weights, so recent samples dominate without a
//! single spike deciding anything. The decision itself is a pure function of
//! that average, the pipes' scaling headroom and the cooldown state.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::AutoscaleConfig;
use crate::metrics::HostMetrics;

/// One host utilization sample
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UtilizationSample {
    pub cpu: f64,
    pub memory: f64,
    pub disk: f64,
    pub at: DateTime<Utc>,
}

impl From<&HostMetrics> for UtilizationSample {
    fn from(m: &HostMetrics) -> Self {
        Self {
            cpu: m.cpu_usage_percent,
            memory: m.memory_usage_percent,
            disk: m.disk_usage_percent,
            at: m.collected_at,
        }
    }
}

/// Weighted averages over the history
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct WeightedUtilization {
    pub cpu: f64,
    pub memory: f64,
    pub disk: f64,
}

/// Fixed-length utilization history
#[derive(Debug, Clone)]
pub struct UtilizationHistory {
    limit: usize,
    samples: VecDeque<UtilizationSample>,
}

impl UtilizationHistory {
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            limit,
            samples: VecDeque::with_capacity(limit),
        }
    }

    pub fn push(&mut self, sample: UtilizationSample) {
        if self.samples.len() == self.limit {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn latest(&self) -> Option<&UtilizationSample> {
        self.samples.back()
    }

    /// Average where the i-th oldest sample weighs (i+1)^2
    pub fn weighted(&self) -> WeightedUtilization {
        let mut total = 0.0;
        let mut out = WeightedUtilization::default();
        for (i, s) in self.samples.iter().enumerate() {
            let w = ((i + 1) * (i + 1)) as f64;
            total += w;
            out.cpu += s.cpu * w;
            out.memory += s.memory * w;
            out.disk += s.disk * w;
        }
        if total > 0.0 {
            out.cpu /= total;
            out.memory /= total;
            out.disk /= total;
        }
        out
    }
}

/// Tracks the last scaling action to enforce the cooldown
#[derive(Debug, Clone, Default)]
pub struct AutoscalerState {
    pub last_scale_up: Option<DateTime<Utc>>,
    pub last_scale_down: Option<DateTime<Utc>>,
}

impl AutoscalerState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_scale_up(&mut self) {
        self.last_scale_up = Some(Utc::now());
    }

    pub fn record_scale_down(&mut self) {
        self.last_scale_down = Some(Utc::now());
    }

    fn last_action(&self) -> Option<DateTime<Utc>> {
        self.last_scale_up.max(self.last_scale_down)
    }

    /// Whether `cooldown_seconds` have passed since any scaling action
    pub fn cooldown_elapsed(&self, cooldown_seconds: u64) -> bool {
        self.last_action()
            .map(|t| (Utc::now() - t).num_seconds() >= cooldown_seconds as i64)
            .unwrap_or(true)
    }
}

/// What the node sees of its pipes when deciding
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ScalingInputs {
    pub utilization: WeightedUtilization,
    /// Some stage is launching or retiring an instance right now
    pub scaling_in_progress: bool,
    /// Some running pipe has a stage below its autoscale ceiling
    pub headroom: bool,
    /// Some pipe runs a stage with more than one instance
    pub scaled: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScalingDecision {
    NoChange,
    ScaleUp { reason: String },
    ScaleDown { reason: String },
}

/// Decide the node's next scaling step
pub fn evaluate_scaling(
    config: &AutoscaleConfig,
    inputs: &ScalingInputs,
    state: &AutoscalerState,
) -> ScalingDecision {
    if !config.enabled || inputs.scaling_in_progress {
        return ScalingDecision::NoChange;
    }

    let u = inputs.utilization;
    if u.cpu >= config.scale_down_above || u.memory >= config.scale_down_above {
        if !inputs.scaled {
            return ScalingDecision::NoChange;
        }
        return ScalingDecision::ScaleDown {
            reason: format!(
                "High utilization: CPU {:.1}%, Memory {:.1}% (limit {:.1}%)",
                u.cpu, u.memory, config.scale_down_above
            ),
        };
    }

    if u.cpu < config.scale_up_cpu_below
        && u.memory < config.scale_up_memory_below
        && inputs.headroom
        && state.cooldown_elapsed(config.cooldown_secs)
    {
        return ScalingDecision::ScaleUp {
            reason: format!(
                "Spare capacity: CPU {:.1}% (below {:.1}%), Memory {:.1}% (below {:.1}%)",
                u.cpu, config.scale_up_cpu_below, u.memory, config.scale_up_memory_below
            ),
        };
    }

    ScalingDecision::NoChange
}
