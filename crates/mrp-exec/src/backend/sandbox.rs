//! Sandboxed-remote backend.
//!
//! Every attempt gets its own ephemeral sandbox:
//! package (content-addressed, stored) → create → launch → collect → delete.
//! The sandbox is held by a lease that deletes it on every exit path. The
//! normal path awaits the delete; if the attempt future is dropped (timeout,
//! run cancellation) the lease's `Drop` schedules the delete on the runtime.
//!
//! Classification: provisioning and transport failures are retryable; a
//! non-zero exit or output that cannot be parsed is permanent.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use mrp_core::config::SandboxProfile;
use mrp_core::hash::Digest;
use mrp_core::ir::{MapTask, OperatorIdentity, OperatorSource, Seed};
use mrp_core::spec::ExecutionBackend;
use mrp_operators::{GeneratedOperator, MapOperator, OpError, OperatorPackage, OperatorRegistry, PackageRunner};
use mrp_store::ArtifactStore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use super::{AttemptContext, AttemptError, AttemptOutput, ShardExecutor};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct ProviderError(pub String);

/// What to provision, taken from the resolved sandbox profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxSpec {
    pub profile: String,
    pub endpoint: String,
    pub image: Option<String>,
    pub time_s: Option<u64>,
    pub mem_mb: Option<u64>,
}

impl SandboxSpec {
    pub fn from_profile(name: &str, profile: &SandboxProfile) -> Self {
        Self {
            profile: name.to_string(),
            endpoint: profile.endpoint.clone(),
            image: profile.image.clone(),
            time_s: profile.time_s,
            mem_mb: profile.mem_mb,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxHandle {
    pub id: String,
}

/// What the on-sandbox launcher reports.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchResult {
    pub exit_code: i32,
    pub stdout: String,
    /// Structured result, when the provider returns one out of band.
    pub result: Option<Value>,
}

/// Self-contained unit shipped to a sandbox. Identical operator + payload +
/// seed always serializes (and so digests) identically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardPackage {
    pub entrypoint: String,
    pub operator: OperatorIdentity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<OperatorPackage>,
    pub dependencies: Vec<String>,
    pub payload: Value,
    pub seed: Seed,
}

impl ShardPackage {
    pub fn build(
        operator: &OperatorIdentity,
        code: Option<&OperatorPackage>,
        task: &MapTask,
        seed: Seed,
    ) -> Self {
        let entrypoint = match &operator.source {
            OperatorSource::Generated { entrypoint, .. } => entrypoint.clone(),
            OperatorSource::Registered => operator.reference.clone(),
        };
        Self {
            entrypoint,
            operator: operator.clone(),
            code: code.cloned(),
            dependencies: code.map(|c| c.dependencies.clone()).unwrap_or_default(),
            payload: task.params.clone(),
            seed,
        }
    }
}

#[async_trait]
pub trait SandboxProvider: Send + Sync + 'static {
    async fn create(&self, spec: &SandboxSpec) -> Result<SandboxHandle, ProviderError>;

    async fn launch(
        &self,
        sandbox: &SandboxHandle,
        package: &ShardPackage,
        digest: &Digest,
    ) -> Result<LaunchResult, ProviderError>;

    /// Must tolerate being called more than once for the same sandbox.
    async fn delete(&self, sandbox: &SandboxHandle) -> Result<(), ProviderError>;
}

async fn delete_logged(provider: &dyn SandboxProvider, sandbox: &SandboxHandle) {
    match provider.delete(sandbox).await {
        Ok(()) => debug!(sandbox = %sandbox.id, "sandbox deleted"),
        Err(e) => warn!(sandbox = %sandbox.id, error = %e, "sandbox delete failed"),
    }
}

struct SandboxLease {
    provider: Arc<dyn SandboxProvider>,
    handle: SandboxHandle,
    released: bool,
}

impl SandboxLease {
    fn new(provider: Arc<dyn SandboxProvider>, handle: SandboxHandle) -> Self {
        Self {
            provider,
            handle,
            released: false,
        }
    }

    async fn release(mut self) {
        delete_logged(self.provider.as_ref(), &self.handle).await;
        self.released = true;
    }
}

impl Drop for SandboxLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let provider = self.provider.clone();
        let handle = self.handle.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                debug!(sandbox = %handle.id, "attempt abandoned; scheduling sandbox delete");
                rt.spawn(async move { delete_logged(provider.as_ref(), &handle).await });
            }
            Err(_) => warn!(sandbox = %handle.id, "no runtime to delete abandoned sandbox"),
        }
    }
}

/// The structured result if present, else the last non-empty stdout line as JSON.
pub fn parse_output(launched: &LaunchResult) -> Result<Value, String> {
    if let Some(result) = &launched.result {
        return Ok(result.clone());
    }
    let line = launched
        .stdout
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .ok_or_else(|| "sandbox produced no output".to_string())?;
    serde_json::from_str(line).map_err(|e| format!("last stdout line is not JSON: {e}"))
}

pub struct SandboxExecutor {
    provider: Arc<dyn SandboxProvider>,
    store: ArtifactStore,
    spec: SandboxSpec,
    operator: OperatorIdentity,
    code: Option<OperatorPackage>,
}

impl SandboxExecutor {
    pub fn new(
        provider: Arc<dyn SandboxProvider>,
        store: ArtifactStore,
        spec: SandboxSpec,
        operator: OperatorIdentity,
        code: Option<OperatorPackage>,
    ) -> Self {
        Self {
            provider,
            store,
            spec,
            operator,
            code,
        }
    }
}

#[async_trait]
impl ShardExecutor for SandboxExecutor {
    fn backend(&self) -> ExecutionBackend {
        ExecutionBackend::SandboxedRemote
    }

    async fn execute(&self, ctx: AttemptContext) -> Result<AttemptOutput, AttemptError> {
        let package = ShardPackage::build(&self.operator, self.code.as_ref(), &ctx.task, ctx.seed);
        let digest = self
            .store
            .put_json(&package)
            .map_err(|e| AttemptError::retryable(format!("storing shard package: {e}")))?;

        let handle = self
            .provider
            .create(&self.spec)
            .await
            .map_err(|e| AttemptError::retryable(format!("sandbox provisioning failed: {e}")))?;
        let sandbox_id = handle.id.clone();
        let lease = SandboxLease::new(self.provider.clone(), handle);
        debug!(shard = %ctx.task.shard_id, sandbox = %sandbox_id, package = %digest.short(), attempt = ctx.attempt, "sandbox launch");

        let launched = self.provider.launch(&lease.handle, &package, &digest).await;
        lease.release().await;

        let launched = launched.map_err(|e| {
            AttemptError::retryable(format!("sandbox launch failed: {e}")).on_worker(sandbox_id.clone())
        })?;
        if launched.exit_code != 0 {
            return Err(AttemptError::Permanent {
                message: format!(
                    "operator exited with status {}: {}",
                    launched.exit_code,
                    launched.stdout.lines().last().unwrap_or_default()
                ),
                worker: Some(sandbox_id),
                exit_code: Some(launched.exit_code),
            });
        }
        let output = parse_output(&launched).map_err(|message| AttemptError::Permanent {
            message,
            worker: Some(sandbox_id.clone()),
            exit_code: Some(launched.exit_code),
        })?;

        Ok(AttemptOutput {
            output,
            worker: sandbox_id,
            exit_code: Some(launched.exit_code),
            stdout: Some(launched.stdout),
            package_digest: Some(digest),
        })
    }
}

/// Exit status the loopback launcher reports when the operator panics.
pub const LAUNCHER_PANIC_EXIT: i32 = 101;

/// In-process provider: "sandboxes" are ids in a live set and launching runs
/// the package's operator on the blocking pool. Registered entrypoints resolve
/// against the registry; generated code goes through the package runner.
pub struct LoopbackSandbox {
    registry: Arc<OperatorRegistry>,
    runner: Arc<dyn PackageRunner>,
    live: Mutex<BTreeSet<String>>,
    created: AtomicU64,
}

impl LoopbackSandbox {
    pub fn new(registry: Arc<OperatorRegistry>, runner: Arc<dyn PackageRunner>) -> Self {
        Self {
            registry,
            runner,
            live: Mutex::new(BTreeSet::new()),
            created: AtomicU64::new(0),
        }
    }

    /// Sandboxes created and not yet deleted.
    pub fn live(&self) -> usize {
        self.live.lock().map(|l| l.len()).unwrap_or_else(|e| e.into_inner().len())
    }

    pub fn created(&self) -> u64 {
        self.created.load(Ordering::Relaxed)
    }

    fn operator_for(&self, package: &ShardPackage) -> Option<Arc<dyn MapOperator>> {
        match &package.code {
            Some(code) => {
                let op: Arc<dyn MapOperator> = Arc::new(GeneratedOperator::new(
                    code.clone(),
                    package.operator.digest,
                    self.runner.clone(),
                ));
                Some(op)
            }
            None => self.registry.map_operator(&package.operator.reference),
        }
    }
}

#[async_trait]
impl SandboxProvider for LoopbackSandbox {
    async fn create(&self, spec: &SandboxSpec) -> Result<SandboxHandle, ProviderError> {
        let n = self.created.fetch_add(1, Ordering::Relaxed);
        let id = format!("{}-sbx-{n}", spec.profile);
        self.live
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.clone());
        Ok(SandboxHandle { id })
    }

    async fn launch(
        &self,
        sandbox: &SandboxHandle,
        package: &ShardPackage,
        digest: &Digest,
    ) -> Result<LaunchResult, ProviderError> {
        let Some(op) = self.operator_for(package) else {
            return Ok(LaunchResult {
                exit_code: 127,
                stdout: format!("entrypoint `{}` not found\n", package.entrypoint),
                result: None,
            });
        };
        let payload = package.payload.clone();
        let seed = package.seed;
        let banner = format!("launch {} package {}", sandbox.id, digest.short());
        let ran = match tokio::task::spawn_blocking(move || op.run(&payload, &seed)).await {
            Ok(ran) => ran,
            // A panicking operator is a crashed process, not a transport fault.
            Err(e) => {
                return Ok(LaunchResult {
                    exit_code: LAUNCHER_PANIC_EXIT,
                    stdout: format!("{banner}\nlauncher panicked: {e}\n"),
                    result: None,
                })
            }
        };

        Ok(match ran {
            Ok(value) => LaunchResult {
                exit_code: 0,
                stdout: format!("{banner}\n{value}\n"),
                result: None,
            },
            Err(OpError::Transient(msg)) => return Err(ProviderError(msg)),
            Err(e) => LaunchResult {
                exit_code: 1,
                stdout: format!("{banner}\n{e}\n"),
                result: None,
            },
        })
    }

    async fn delete(&self, sandbox: &SandboxHandle) -> Result<(), ProviderError> {
        self.live
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&sandbox.id);
        Ok(())
    }
}
