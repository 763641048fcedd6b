//! Operation executor: one invocation end to end.
//!
//! Resolution order is fixed: operation lookup, licensing, document
//! resolution, context build, dispatch. Licensing runs before resolution so
//! an unauthorized caller never costs a resolver round-trip. Synchronous
//! dispatch races the handler against a timeout without interrupting it;
//! asynchronous dispatch returns a job id the moment the job exists.

use crate::config::ServerConfig;
use crate::error::ExecuteError;
use crate::jobs::{JobManager, JobStatus};
use crate::registry::OperationRegistry;
use crate::types::{
    AuthenticatedUser, DocumentHandle, DocumentReference, ExecuteRequest, ExecuteResult,
    ExecutionMode, OperationContext, OperationDeclaration, ProgressFn,
};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// Resolves a caller-supplied document reference to a usable handle.
///
/// Serialization of concurrent operations against one document, if needed,
/// lives behind this trait; the executor provides no mutual exclusion.
#[async_trait]
pub trait DocumentResolver: Send + Sync {
    async fn resolve(&self, reference: &DocumentReference) -> anyhow::Result<DocumentHandle>;
}

/// Orchestrates operation invocations against the registry and job manager.
pub struct OperationExecutor {
    registry: Arc<OperationRegistry>,
    jobs: Arc<JobManager>,
    resolver: Arc<dyn DocumentResolver>,
    sync_timeout: Duration,
}

impl OperationExecutor {
    pub fn new(
        registry: Arc<OperationRegistry>,
        jobs: Arc<JobManager>,
        resolver: Arc<dyn DocumentResolver>,
        config: &ServerConfig,
    ) -> Self {
        Self {
            registry,
            jobs,
            resolver,
            sync_timeout: config.sync_timeout(),
        }
    }

    /// The job manager backing async dispatch.
    pub fn job_manager(&self) -> &Arc<JobManager> {
        &self.jobs
    }

    /// Execute one operation.
    ///
    /// Failures before dispatch never create a job. For async operations the
    /// returned result reports the job id and does not wait for the handler.
    pub async fn execute(&self, request: ExecuteRequest) -> ExecuteResult {
        let started = Instant::now();
        let correlation_id = request
            .correlation_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let operation = match self
            .registry
            .get_operation(&request.language_id, &request.operation_id)
        {
            Some(operation) => operation,
            None => {
                let error = ExecuteError::OperationNotFound {
                    language_id: request.language_id.clone(),
                    operation_id: request.operation_id.clone(),
                };
                tracing::warn!("{}", error);
                return ExecuteResult::failure(&error, correlation_id, Some(elapsed_ms(started)));
            }
        };

        if let Err(error) = check_licensing(&operation.declaration, request.user.as_ref()) {
            tracing::warn!(
                "licensing rejected operation '{}': {}",
                operation.declaration.id,
                error
            );
            return ExecuteResult::failure(&error, correlation_id, Some(elapsed_ms(started)));
        }

        let document = match self.resolver.resolve(&request.document).await {
            Ok(document) => document,
            Err(resolve_error) => {
                let error = ExecuteError::DocumentResolutionFailed(resolve_error.to_string());
                tracing::warn!("{}", error);
                return ExecuteResult::failure(&error, correlation_id, Some(elapsed_ms(started)));
            }
        };

        let uri = document.uri.clone();
        let context = OperationContext {
            document,
            selected_ids: request.selected_ids.unwrap_or_default(),
            input: request.input,
            user: request.user,
            correlation_id: correlation_id.clone(),
            language_id: request.language_id.clone(),
            uri: uri.clone(),
        };

        match operation.declaration.execution {
            ExecutionMode::Async => {
                let job_id = self.jobs.create_job(
                    &operation.declaration.id,
                    &request.language_id,
                    &uri,
                    &correlation_id,
                );
                self.spawn_job(job_id.clone(), operation.handler.clone(), context);
                ExecuteResult::accepted(job_id, correlation_id)
            }
            ExecutionMode::Sync => {
                self.run_sync(operation.handler.clone(), context, correlation_id, started)
                    .await
            }
        }
    }

    async fn run_sync(
        &self,
        handler: crate::types::OperationHandler,
        context: OperationContext,
        correlation_id: String,
        started: Instant,
    ) -> ExecuteResult {
        // Sync invocations have no job to feed, so progress reports go to the log.
        let progress: ProgressFn = Arc::new(|value, message| {
            tracing::trace!("sync operation progress {}: {:?}", value, message);
        });

        // Spawned as its own task: losing the timeout race abandons the
        // result, not the work.
        let task = tokio::spawn(handler(context, progress));

        match tokio::time::timeout(self.sync_timeout, task).await {
            Err(_) => {
                let error = ExecuteError::Timeout {
                    ms: self.sync_timeout.as_millis() as u64,
                };
                tracing::warn!("{}", error);
                ExecuteResult::failure(&error, correlation_id, Some(elapsed_ms(started)))
            }
            Ok(Err(join_error)) => {
                let error = ExecuteError::HandlerFailed(join_error.to_string());
                tracing::error!("{}", error);
                ExecuteResult::failure(&error, correlation_id, Some(elapsed_ms(started)))
            }
            Ok(Ok(Err(handler_error))) => {
                let error = ExecuteError::HandlerFailed(handler_error.to_string());
                tracing::warn!("{}", error);
                ExecuteResult::failure(&error, correlation_id, Some(elapsed_ms(started)))
            }
            Ok(Ok(Ok(value))) => {
                ExecuteResult::completed(Some(value), correlation_id, elapsed_ms(started))
            }
        }
    }

    fn spawn_job(
        &self,
        job_id: String,
        handler: crate::types::OperationHandler,
        context: OperationContext,
    ) {
        let jobs = Arc::clone(&self.jobs);

        tokio::spawn(async move {
            jobs.update_job_status(&job_id, JobStatus::Running);

            let progress_jobs = Arc::clone(&jobs);
            let progress_id = job_id.clone();
            let progress: ProgressFn = Arc::new(move |value, message| {
                progress_jobs.update_job_progress(&progress_id, value, message);
            });

            // Inner spawn so a panicking handler surfaces as a join error
            // instead of silently killing this bookkeeping task.
            let outcome = tokio::spawn(handler(context, progress)).await;
            match outcome {
                Ok(Ok(value)) => {
                    jobs.complete_job(&job_id, Some(value));
                }
                Ok(Err(handler_error)) => {
                    jobs.fail_job(&job_id, handler_error.to_string());
                }
                Err(join_error) => {
                    jobs.fail_job(&job_id, format!("operation handler panicked: {join_error}"));
                }
            }
        });
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

/// Gate an invocation on the operation's licensing declaration.
///
/// A missing user fails any declaration that needs one, either explicitly
/// (`requires_auth`) or implicitly (a tier floor cannot be checked against
/// nobody).
fn check_licensing(
    declaration: &OperationDeclaration,
    user: Option<&AuthenticatedUser>,
) -> Result<(), ExecuteError> {
    let Some(licensing) = &declaration.licensing else {
        return Ok(());
    };

    if !licensing.requires_auth && licensing.min_tier.is_none() {
        return Ok(());
    }

    let Some(user) = user else {
        return Err(ExecuteError::AuthenticationRequired);
    };

    if let Some(required) = licensing.min_tier {
        if user.tier < required {
            return Err(ExecuteError::InsufficientTier {
                required,
                actual: user.tier,
            });
        }
    }

    Ok(())
}
