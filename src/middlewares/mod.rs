use std::future::Future;

use tokio::time::{Duration, Instant};

use crate::api::error;

/// Request-scoped data handed to every chat operation: who is acting, and until when.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    user_id: String,
    deadline: Option<Instant>,
}

impl RequestContext {
    /// Unauthenticated context.
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn with_user(user_id: impl Into<String>) -> Self {
        Self { user_id: user_id.into(), deadline: None }
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Runs `fut` under the caller's deadline. The future is dropped when the deadline
    /// fires, which rolls back any transaction it holds open.
    pub async fn run<T, F>(&self, fut: F) -> Result<T, error::SystemError>
    where
        F: Future<Output = Result<T, error::SystemError>>,
    {
        let Some(deadline) = self.deadline else {
            return fut.await;
        };

        if deadline <= Instant::now() {
            return Err(error::SystemError::DeadlineExceeded);
        }

        tokio::time::timeout_at(deadline, fut)
            .await
            .map_err(|_| error::SystemError::DeadlineExceeded)?
    }
}

/// Empty when the caller is not authenticated.
pub fn current_user_id(ctx: &RequestContext) -> &str {
    &ctx.user_id
}
