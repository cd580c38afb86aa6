//! Policy report emitted by the compiler and re-checked at dispatch.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyStatus {
    Ok,
    Rejected,
}

/// Checks in evaluation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyCheck {
    Caps,
    Egress,
    Cost,
}

impl std::fmt::Display for PolicyCheck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            PolicyCheck::Caps => "caps",
            PolicyCheck::Egress => "egress",
            PolicyCheck::Cost => "cost",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckOutcome {
    pub check: PolicyCheck,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Effective caps for the run (requested values clamped to defaults).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Caps {
    pub workers: usize,
    pub time_s: u64,
    pub mem_mb: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostEstimate {
    pub shards: usize,
    pub map_weight: f64,
    pub reduce_weight: f64,
    pub produce_weight: f64,
    pub total: f64,
    pub budget_cap: f64,
    pub kill_threshold: f64,
}

impl CostEstimate {
    /// Observed cost above this value trips the governor.
    pub fn kill_limit(&self) -> f64 {
        self.budget_cap * self.kill_threshold
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyReport {
    pub status: PolicyStatus,
    pub egress_allowed: bool,
    pub egress_allowlist: Vec<String>,
    pub caps: Caps,
    pub cost_estimate: CostEstimate,
    pub checks: Vec<CheckOutcome>,
}

impl PolicyReport {
    pub fn is_ok(&self) -> bool {
        self.status == PolicyStatus::Ok
    }

    /// The first failing check, if any.
    pub fn failing_check(&self) -> Option<&CheckOutcome> {
        self.checks.iter().find(|c| !c.passed)
    }
}
