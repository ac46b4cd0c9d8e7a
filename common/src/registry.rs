// Handler registry: process-wide mapping from job_type to handler
// Populated once at startup; read-only afterwards, so lookups need no lock.

use crate::db::repositories::JobRepository;
use crate::errors::HandlerError;
use crate::handlers::ResourceContext;
use crate::models::Job;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

/// A job handler registered under a `job_type`.
///
/// The handler drives the external processor for its type, persists progress
/// and results through the repository, transitions the job to exactly one
/// terminal state, and sends the terminal webhook. Errors returned here are
/// converted by the worker into a `HANDLER_EXCEPTION` failure.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(
        &self,
        job: Job,
        repo: Arc<JobRepository>,
        resources: Arc<ResourceContext>,
    ) -> Result<(), HandlerError>;
}

/// String-keyed handler registry. Registration is static at startup; there
/// is no unregistration during normal operation.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a handler for a job type. Re-registration replaces the prior
    /// handler (last registration wins).
    pub fn register(&mut self, job_type: impl Into<String>, handler: Arc<dyn JobHandler>) {
        let job_type = job_type.into();
        if self.handlers.insert(job_type.clone(), handler).is_some() {
            warn!(job_type = %job_type, "Handler re-registered, replacing prior handler");
        }
    }

    pub fn lookup(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(job_type).cloned()
    }

    pub fn registered_types(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }
}
