//! [`Scheduler`] backed by tokio timers.

use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tokio::time::sleep;

use super::traits::Scheduler;
use crate::Result;
use crate::error::{Error, Kind};

/// Runs each retry as a sleeping task on the runtime it was created in.
#[derive(Debug, Clone)]
pub struct TokioScheduler {
    runtime: Handle,
}

impl TokioScheduler {
    /// Create a scheduler bound to the current tokio runtime.
    ///
    /// Fails when called outside a runtime.
    pub fn new() -> Result<Self> {
        let runtime = Handle::try_current().map_err(|e| Error::with_source(Kind::Internal, e))?;
        Ok(Self::with_runtime(runtime))
    }

    #[must_use]
    pub fn with_runtime(runtime: Handle) -> Self {
        Self { runtime }
    }
}

impl Scheduler for TokioScheduler {
    type Token = AbortHandle;

    fn schedule(&self, delay: Duration, task: Box<dyn FnOnce() + Send + 'static>) -> Self::Token {
        self.runtime
            .spawn(async move {
                sleep(delay).await;
                task();
            })
            .abort_handle()
    }

    fn cancel(&self, token: Self::Token) {
        token.abort();
    }
}
