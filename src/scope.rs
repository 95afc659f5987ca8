use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Interrupted {
    #[error("operation was cancelled")]
    Cancelled,
    #[error("operation timed out after {0:?}")]
    TimedOut(Duration),
}

/// Cancellation and deadline applied to every network-bound call of a reconcile.
#[derive(Debug, Clone)]
pub struct OperationScope {
    cancel_token: CancellationToken,
    timeout: Duration,
}

impl OperationScope {
    pub fn new(cancel_token: CancellationToken, timeout: Duration) -> Self {
        Self {
            cancel_token,
            timeout,
        }
    }

    /// Drives `operation` until it completes, the scope is cancelled or the timeout
    /// elapses. An interrupted operation is dropped, which aborts in-flight requests.
    pub async fn run<F: Future>(&self, operation: F) -> Result<F::Output, Interrupted> {
        tokio::select! {
            biased;
            _ = self.cancel_token.cancelled() => Err(Interrupted::Cancelled),
            result = tokio::time::timeout(self.timeout, operation) => {
                result.map_err(|_| Interrupted::TimedOut(self.timeout))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_returns_operation_output() {
        let scope = OperationScope::new(CancellationToken::new(), Duration::from_secs(5));
        assert_eq!(scope.run(async { 42 }).await, Ok(42));
    }

    #[tokio::test]
    async fn test_run_after_cancel_does_not_poll_operation() {
        let token = CancellationToken::new();
        let scope = OperationScope::new(token.clone(), Duration::from_secs(5));
        token.cancel();
        let result = scope
            .run(async { panic!("operation must not run after cancellation") })
            .await;
        assert_eq!(result, Err::<(), _>(Interrupted::Cancelled));
    }

    #[tokio::test]
    async fn test_run_cancels_pending_operation() {
        let token = CancellationToken::new();
        let scope = OperationScope::new(token.clone(), Duration::from_secs(60));
        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
        });
        let result = scope.run(std::future::pending::<()>()).await;
        canceller.await.unwrap();
        assert_eq!(result, Err(Interrupted::Cancelled));
    }

    #[tokio::test]
    async fn test_run_times_out() {
        let timeout = Duration::from_millis(20);
        let scope = OperationScope::new(CancellationToken::new(), timeout);
        let result = scope.run(std::future::pending::<()>()).await;
        assert_eq!(result, Err(Interrupted::TimedOut(timeout)));
    }
}
