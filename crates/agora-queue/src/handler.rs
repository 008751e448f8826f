//! Job handler contract.

use std::future::Future;

use agora_core::BoxFuture;

use crate::job::Job;

/// Processes jobs tagged with the name it is registered under.
///
/// Returning an error (or panicking) counts as a failed attempt and goes
/// through the job's retry policy. Any `Fn(Job) -> impl Future<Output =
/// anyhow::Result<()>>` is a handler.
pub trait JobHandler: Send + Sync + 'static {
    /// Runs one attempt of `job`.
    fn handle(&self, job: Job) -> BoxFuture<'static, anyhow::Result<()>>;
}

impl<F, Fut> JobHandler for F
where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    fn handle(&self, job: Job) -> BoxFuture<'static, anyhow::Result<()>> {
        Box::pin(self(job))
    }
}
