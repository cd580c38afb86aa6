//! Policy engine.
//!
//! Checks run in a fixed order and stop at the first failure:
//! 1. caps: requested workers/time/memory within configured limits
//! 2. egress: default deny; `sandboxed_remote` may reach only its provider
//! 3. cost: draft estimate within the budget cap
//!
//! A non-ok report is fail-closed. The compiler evaluates it against its own
//! configuration and the runtime evaluates it again at dispatch against the
//! dispatcher's configuration.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use mrp_core::config::{CostModel, EngineConfig, PolicyLimits, SandboxProfile};
use mrp_core::ir::{Ir, Manifest, OperatorSet};
use mrp_core::policy::{Caps, CheckOutcome, PolicyCheck, PolicyReport, PolicyStatus};
use mrp_core::spec::{ExecutionBackend, JobSpec, ResourceRequest};

use crate::cost::{effective_budget, estimate_cost};
use crate::error::CompileError;

/// Everything a policy decision depends on, borrowed from a spec or an IR.
#[derive(Debug, Clone, Copy)]
pub struct PolicyRequest<'a> {
    pub backend: ExecutionBackend,
    pub sandbox_profile_ref: Option<&'a str>,
    pub resources: &'a ResourceRequest,
    pub egress: &'a [String],
    pub shards: usize,
    pub operators: &'a OperatorSet,
}

impl<'a> PolicyRequest<'a> {
    pub fn from_spec(spec: &'a JobSpec, operators: &'a OperatorSet) -> Self {
        Self {
            backend: spec.execution_backend,
            sandbox_profile_ref: spec.sandbox_profile_ref.as_deref(),
            resources: &spec.resources,
            egress: &spec.egress,
            shards: spec.map.shards.len(),
            operators,
        }
    }

    pub fn from_ir(ir: &'a Ir, manifest: &'a Manifest) -> Self {
        Self {
            backend: ir.backend,
            sandbox_profile_ref: ir.sandbox_profile_ref.as_deref(),
            resources: &ir.resources,
            egress: &ir.egress,
            shards: ir.maps.len(),
            operators: &manifest.operators,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PolicyEngine {
    limits: PolicyLimits,
    max_workers: usize,
    budget_cap: f64,
    kill_threshold: f64,
    cost_model: CostModel,
    sandbox_profiles: BTreeMap<String, SandboxProfile>,
}

/// Host part of an endpoint URL (`https://sbx.example:443/v1` → `sbx.example`).
pub fn endpoint_host(endpoint: &str) -> String {
    let rest = endpoint
        .split_once("://")
        .map(|(_, r)| r)
        .unwrap_or(endpoint);
    let authority = rest.split('/').next().unwrap_or(rest);
    let host = authority.rsplit('@').next().unwrap_or(authority);
    let host = match host.rsplit_once(':') {
        Some((h, port)) if port.chars().all(|c| c.is_ascii_digit()) => h,
        _ => host,
    };
    host.to_ascii_lowercase()
}

fn cap_min<T: Ord + Copy>(base: T, others: &[Option<T>]) -> T {
    others.iter().flatten().fold(base, |acc, v| acc.min(*v))
}

impl PolicyEngine {
    pub fn new(cfg: &EngineConfig) -> Self {
        Self {
            limits: cfg.limits.clone(),
            max_workers: cfg.max_workers,
            budget_cap: cfg.budget_cap,
            kill_threshold: cfg.kill_threshold,
            cost_model: cfg.cost_model.clone(),
            sandbox_profiles: cfg.sandbox_profiles.clone(),
        }
    }

    fn profile(&self, reference: Option<&str>) -> Option<(&str, &SandboxProfile)> {
        let name = reference.unwrap_or("default");
        self.sandbox_profiles
            .get_key_value(name)
            .map(|(k, v)| (k.as_str(), v))
    }

    /// Requested caps clamped by configuration and (for sandboxes) the profile.
    pub fn effective_caps(&self, req: &PolicyRequest<'_>) -> Caps {
        let profile = match req.backend {
            ExecutionBackend::SandboxedRemote => self.profile(req.sandbox_profile_ref).map(|(_, p)| p),
            _ => None,
        };
        let r = req.resources;
        Caps {
            workers: cap_min(
                self.max_workers.min(self.limits.max_workers),
                &[r.workers, profile.and_then(|p| p.workers)],
            )
            .max(1),
            time_s: cap_min(
                self.limits.max_time_s,
                &[r.time_s, profile.and_then(|p| p.time_s)],
            ),
            mem_mb: cap_min(
                self.limits.max_mem_mb,
                &[r.mem_mb, profile.and_then(|p| p.mem_mb)],
            ),
        }
    }

    fn check_caps(&self, req: &PolicyRequest<'_>) -> Result<(), String> {
        let r = req.resources;
        if let Some(w) = r.workers {
            if w == 0 {
                return Err("requested workers must be at least 1".into());
            }
            if w > self.limits.max_workers {
                return Err(format!(
                    "requested workers {w} exceed limit {}",
                    self.limits.max_workers
                ));
            }
        }
        if let Some(t) = r.time_s {
            if t > self.limits.max_time_s {
                return Err(format!(
                    "requested time_s {t} exceeds limit {}",
                    self.limits.max_time_s
                ));
            }
        }
        if let Some(m) = r.mem_mb {
            if m > self.limits.max_mem_mb {
                return Err(format!(
                    "requested mem_mb {m} exceeds limit {}",
                    self.limits.max_mem_mb
                ));
            }
        }
        Ok(())
    }

    /// Returns the allowlist on success.
    fn check_egress(&self, req: &PolicyRequest<'_>) -> Result<Vec<String>, String> {
        match req.backend {
            ExecutionBackend::SandboxedRemote => {
                let name = req.sandbox_profile_ref.unwrap_or("default");
                let (_, profile) = self
                    .profile(req.sandbox_profile_ref)
                    .ok_or_else(|| format!("sandbox profile `{name}` does not resolve"))?;
                let provider = endpoint_host(&profile.endpoint);
                if provider.is_empty() {
                    return Err(format!("sandbox profile `{name}` has no provider endpoint"));
                }
                if let Some(host) = req
                    .egress
                    .iter()
                    .find(|h| endpoint_host(h) != provider)
                {
                    return Err(format!(
                        "egress to `{host}` denied; only the sandbox provider `{provider}` is allowlisted"
                    ));
                }
                Ok(vec![provider])
            }
            _ => match req.egress.first() {
                Some(host) => Err(format!(
                    "egress to `{host}` denied; {} backend allows no egress",
                    req.backend
                )),
                None => Ok(Vec::new()),
            },
        }
    }

    pub fn evaluate(&self, req: &PolicyRequest<'_>) -> PolicyReport {
        let caps = self.effective_caps(req);
        let budget = effective_budget(self.budget_cap, req.resources.max_cost);
        let cost_estimate = estimate_cost(
            req.shards,
            req.operators,
            &self.cost_model,
            budget,
            self.kill_threshold,
        );

        let mut checks = Vec::with_capacity(3);
        let mut allowlist = Vec::new();
        let mut record = |check: PolicyCheck, result: Result<(), String>| -> bool {
            let passed = result.is_ok();
            match &result {
                Ok(()) => debug!(%check, "policy check passed"),
                Err(reason) => warn!(%check, %reason, "policy check failed"),
            }
            checks.push(CheckOutcome {
                check,
                passed,
                reason: result.err(),
            });
            passed
        };

        let ok = record(PolicyCheck::Caps, self.check_caps(req))
            && record(
                PolicyCheck::Egress,
                self.check_egress(req).map(|list| allowlist = list),
            )
            && record(
                PolicyCheck::Cost,
                if cost_estimate.total <= budget {
                    Ok(())
                } else {
                    Err(format!(
                        "estimated cost {} exceeds budget cap {}",
                        cost_estimate.total, budget
                    ))
                },
            );

        PolicyReport {
            status: if ok {
                PolicyStatus::Ok
            } else {
                PolicyStatus::Rejected
            },
            egress_allowed: ok && !allowlist.is_empty(),
            egress_allowlist: allowlist,
            caps,
            cost_estimate,
            checks,
        }
    }

    /// Evaluate and fail closed.
    pub fn enforce(&self, req: &PolicyRequest<'_>) -> Result<PolicyReport, CompileError> {
        let report = self.evaluate(req);
        if report.is_ok() {
            Ok(report)
        } else {
            Err(CompileError::policy(report))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mrp_core::hash::hash_str;
    use mrp_core::ir::{OperatorIdentity, OperatorSource};
    use mrp_core::spec::OperatorKind;

    fn ops() -> OperatorSet {
        let ident = |kind, name: &str| OperatorIdentity {
            reference: format!("{name}@1"),
            name: name.into(),
            kind,
            version: "1".into(),
            digest: hash_str(name),
            source: OperatorSource::Registered,
        };
        OperatorSet {
            map: ident(OperatorKind::Map, "uppercase"),
            reduce: ident(OperatorKind::Reduce, "concat"),
            produce: ident(OperatorKind::Produce, "json_writer"),
        }
    }

    fn sandbox_config() -> EngineConfig {
        let mut cfg = EngineConfig::default();
        cfg.sandbox_profiles.insert(
            "default".into(),
            SandboxProfile {
                endpoint: "https://sbx.provider.test:8443/api".into(),
                image: None,
                workers: Some(2),
                time_s: None,
                mem_mb: None,
            },
        );
        cfg
    }

    fn request<'a>(
        backend: ExecutionBackend,
        resources: &'a ResourceRequest,
        egress: &'a [String],
        operators: &'a OperatorSet,
    ) -> PolicyRequest<'a> {
        PolicyRequest {
            backend,
            sandbox_profile_ref: None,
            resources,
            egress,
            shards: 2,
            operators,
        }
    }

    #[test]
    fn local_job_passes_all_checks_in_order() {
        let ops = ops();
        let res = ResourceRequest::default();
        let report = PolicyEngine::new(&EngineConfig::default())
            .evaluate(&request(ExecutionBackend::Local, &res, &[], &ops));
        assert!(report.is_ok());
        let order: Vec<PolicyCheck> = report.checks.iter().map(|c| c.check).collect();
        assert_eq!(order, vec![PolicyCheck::Caps, PolicyCheck::Egress, PolicyCheck::Cost]);
        assert!(!report.egress_allowed);
        assert_eq!(report.cost_estimate.total, 4.0);
    }

    #[test]
    fn caps_failure_stops_evaluation() {
        let ops = ops();
        let res = ResourceRequest {
            workers: Some(10_000),
            ..Default::default()
        };
        let report = PolicyEngine::new(&EngineConfig::default())
            .evaluate(&request(ExecutionBackend::Local, &res, &[], &ops));
        assert!(!report.is_ok());
        assert_eq!(report.checks.len(), 1);
        assert_eq!(report.failing_check().unwrap().check, PolicyCheck::Caps);
    }

    #[test]
    fn local_backend_denies_all_egress() {
        let ops = ops();
        let res = ResourceRequest::default();
        let egress = vec!["api.example.com".to_string()];
        let report = PolicyEngine::new(&EngineConfig::default())
            .evaluate(&request(ExecutionBackend::Local, &res, &egress, &ops));
        assert_eq!(report.failing_check().unwrap().check, PolicyCheck::Egress);
    }

    #[test]
    fn sandbox_allowlists_only_provider() {
        let ops = ops();
        let res = ResourceRequest::default();
        let engine = PolicyEngine::new(&sandbox_config());

        let report = engine.evaluate(&request(ExecutionBackend::SandboxedRemote, &res, &[], &ops));
        assert!(report.is_ok());
        assert!(report.egress_allowed);
        assert_eq!(report.egress_allowlist, vec!["sbx.provider.test".to_string()]);
        assert_eq!(report.caps.workers, 2);

        let provider = vec!["sbx.provider.test".to_string()];
        assert!(engine
            .evaluate(&request(ExecutionBackend::SandboxedRemote, &res, &provider, &ops))
            .is_ok());

        let other = vec!["evil.example".to_string()];
        let report = engine.evaluate(&request(ExecutionBackend::SandboxedRemote, &res, &other, &ops));
        assert_eq!(report.failing_check().unwrap().check, PolicyCheck::Egress);
    }

    #[test]
    fn unresolved_profile_is_rejected() {
        let ops = ops();
        let res = ResourceRequest::default();
        let mut req = request(ExecutionBackend::SandboxedRemote, &res, &[], &ops);
        req.sandbox_profile_ref = Some("gpu");
        let err = PolicyEngine::new(&sandbox_config()).enforce(&req).unwrap_err();
        match err {
            CompileError::PolicyViolation { check, reason, .. } => {
                assert_eq!(check, PolicyCheck::Egress);
                assert!(reason.contains("gpu"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn cost_over_cap_is_rejected() {
        let ops = ops();
        let res = ResourceRequest {
            max_cost: Some(3.0),
            ..Default::default()
        };
        let report = PolicyEngine::new(&EngineConfig::default())
            .evaluate(&request(ExecutionBackend::Local, &res, &[], &ops));
        let failing = report.failing_check().unwrap();
        assert_eq!(failing.check, PolicyCheck::Cost);
        assert_eq!(report.cost_estimate.budget_cap, 3.0);
    }

    #[test]
    fn endpoint_host_strips_scheme_port_and_path() {
        assert_eq!(endpoint_host("https://Sbx.Example:443/v1"), "sbx.example");
        assert_eq!(endpoint_host("sbx.example"), "sbx.example");
        assert_eq!(endpoint_host("http://user@h.test/x"), "h.test");
    }
}
