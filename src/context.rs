//! Per-call cancellation and deadlines.

use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Carried by every driver call.  Cloning shares the cancellation token, so
/// cancelling any clone cancels them all.
#[derive(Clone, Debug, Default)]
pub struct Context {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Context {
            token: CancellationToken::new(),
            deadline: Some(deadline),
        }
    }

    /// A context that is cancelled when either `self` is cancelled or `cancel()`
    /// is called on the child.  The deadline is inherited.
    pub fn child(&self) -> Self {
        Context {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Fails with [`Error::Cancelled`] or [`Error::DeadlineExceeded`] once the
    /// context has ended.
    pub fn check(&self) -> Result<()> {
        if self.token.is_cancelled() {
            return Err(Error::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(Error::DeadlineExceeded),
            _ => Ok(()),
        }
    }

    /// Resolves once the context is cancelled or its deadline passes, with the
    /// matching error.
    pub async fn done(&self) -> Error {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.token.cancelled() => Error::Cancelled,
                    _ = tokio::time::sleep_until(deadline.into()) => Error::DeadlineExceeded,
                }
            }
            None => {
                self.token.cancelled().await;
                Error::Cancelled
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_check() {
        let ctx = Context::new();
        assert!(ctx.check().is_ok());
        let child = ctx.child();
        ctx.cancel();
        assert!(matches!(child.check(), Err(Error::Cancelled)));

        let expired = Context::with_deadline(Instant::now() - Duration::from_secs(1));
        assert!(matches!(expired.check(), Err(Error::DeadlineExceeded)));
        assert!(Context::with_timeout(Duration::from_secs(60)).check().is_ok());
    }

    #[tokio::test]
    async fn test_done() {
        let ctx = Context::with_timeout(Duration::from_millis(10));
        assert!(matches!(ctx.done().await, Error::DeadlineExceeded));

        let ctx = Context::new();
        let clone = ctx.clone();
        tokio::spawn(async move { clone.cancel() });
        assert!(matches!(ctx.done().await, Error::Cancelled));
    }
}
