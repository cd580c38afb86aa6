//! In-process backend: the Map operator runs on tokio's blocking pool. The
//! scheduler's semaphore bounds how many run at once.

use std::sync::Arc;

use async_trait::async_trait;
use mrp_core::spec::ExecutionBackend;
use mrp_operators::MapOperator;

use super::{AttemptContext, AttemptError, AttemptOutput, ShardExecutor};

pub struct LocalExecutor {
    operator: Arc<dyn MapOperator>,
}

impl LocalExecutor {
    pub fn new(operator: Arc<dyn MapOperator>) -> Self {
        Self { operator }
    }
}

#[async_trait]
impl ShardExecutor for LocalExecutor {
    fn backend(&self) -> ExecutionBackend {
        ExecutionBackend::Local
    }

    async fn execute(&self, ctx: AttemptContext) -> Result<AttemptOutput, AttemptError> {
        let op = self.operator.clone();
        let AttemptContext { task, seed, .. } = ctx;
        let joined = tokio::task::spawn_blocking(move || {
            let worker = format!("local/{:?}", std::thread::current().id());
            let result = op
                .run(&task.params, &seed)
                .map_err(|e| AttemptError::from(e).on_worker(worker.clone()));
            (worker, result)
        })
        .await;

        match joined {
            Ok((worker, Ok(output))) => Ok(AttemptOutput::new(output, worker)),
            Ok((_, Err(e))) => Err(e),
            Err(e) if e.is_panic() => Err(AttemptError::permanent("map operator panicked")),
            Err(e) => Err(AttemptError::retryable(format!("worker join failed: {e}"))),
        }
    }
}
