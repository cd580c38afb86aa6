//! Draft cost estimate.
//!
//! Σ shards × map weight + reduce weight + produce weight, with weights taken
//! from the configured `CostModel` by operator name. Retries are not priced
//! in; the governor meters what actually runs.

use mrp_core::config::CostModel;
use mrp_core::ir::OperatorSet;
use mrp_core::policy::CostEstimate;

pub fn estimate_cost(
    shards: usize,
    operators: &OperatorSet,
    model: &CostModel,
    budget_cap: f64,
    kill_threshold: f64,
) -> CostEstimate {
    let map_weight = model.weight_for(&operators.map.name);
    let reduce_weight = model.weight_for(&operators.reduce.name);
    let produce_weight = model.weight_for(&operators.produce.name);
    CostEstimate {
        shards,
        map_weight,
        reduce_weight,
        produce_weight,
        total: shards as f64 * map_weight + reduce_weight + produce_weight,
        budget_cap,
        kill_threshold,
    }
}

/// Effective cap: the configured cap, lowered by a job's own `max_cost`.
pub fn effective_budget(configured: f64, requested: Option<f64>) -> f64 {
    match requested {
        Some(r) if r >= 0.0 => configured.min(r),
        _ => configured,
    }
}
