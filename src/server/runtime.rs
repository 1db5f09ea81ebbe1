//! The server's runtime.
//!
//! All service operations are synchronous since they may block on device
//! I/O for an unduly long time. The HTTP server on the other hand is async.
//! This module provides the bridge: operations are moved onto Tokio's
//! blocking thread pool and their result is sent back through a oneshot
//! channel.
//!
//! At most a configured number of operations run at the same time. Others
//! wait for a permit.
//!
//! An operation that takes longer than the request timeout, including the
//! wait for its permit, is reported to the client as [`Error::Timeout`].
//! Once started, it keeps running to completion on its thread and holds on
//! to its permit. Whatever it changed is picked up by the next discovery
//! cycle.

use std::{error, fmt};
use std::sync::Arc;
use std::time::Duration;
use hyper::StatusCode;
use tokio::runtime;
use tokio::sync::{Semaphore, oneshot};
use crate::api::fault::Fault;
use crate::commons::error::Error;


//------------ SignerRuntime -------------------------------------------------

#[derive(Clone, Debug)]
pub struct SignerRuntime {
    /// The Tokio runtime to spawn blocking operations onto.
    tokio: runtime::Handle,

    timeout: Duration,

    /// Permits for running operations.
    permits: Arc<Semaphore>,
}

impl SignerRuntime {
    pub fn new(
        tokio: runtime::Handle, timeout: Duration, max_operations: usize
    ) -> Self {
        SignerRuntime {
            tokio,
            timeout,
            permits: Arc::new(Semaphore::new(max_operations.max(1))),
        }
    }

    /// Creates a runtime for the Tokio runtime we are currently running on.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a Tokio runtime.
    pub fn current(timeout: Duration, max_operations: usize) -> Self {
        Self::new(runtime::Handle::current(), timeout, max_operations)
    }

    pub async fn run<F, T, E>(
        &self, op: F
    ) -> Result<T, RunError>
    where
        F: FnOnce() -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: Into<RunError> + Send + 'static
    {
        let started = async {
            let permit = self.permits.clone().acquire_owned().await.map_err(
                |_| RunError(Error::internal("operation permits closed"))
            )?;
            let (tx, rx) = oneshot::channel();
            self.tokio.spawn_blocking(move || {
                let _ = tx.send(op());
                drop(permit);
            });
            Ok::<_, RunError>(rx.await?)
        };
        match tokio::time::timeout(self.timeout, started).await {
            Ok(res) => res?.map_err(Into::into),
            Err(_) => Err(RunError(Error::Timeout)),
        }
    }
}


//------------ RunError ------------------------------------------------------

/// An error happened when running an operation.
#[derive(Debug)]
pub struct RunError(Error);

impl RunError {
    pub fn status(&self) -> StatusCode {
        self.0.status()
    }

    pub fn to_fault(&self) -> Fault {
        self.0.to_fault()
    }

    pub fn into_error(self) -> Error {
        self.0
    }
}

impl From<Error> for RunError {
    fn from(src: Error) -> Self {
        Self(src)
    }
}

impl From<oneshot::error::RecvError> for RunError {
    fn from(_: oneshot::error::RecvError) -> Self {
        Self(Error::internal("operation dropped"))
    }
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl error::Error for RunError { }


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::thread;
    use super::*;
    use crate::commons::SignerResult;

    fn runtime(timeout: Duration) -> SignerRuntime {
        SignerRuntime::current(timeout, 4)
    }

    #[tokio::test]
    async fn results_are_passed_back() {
        let rt = runtime(Duration::from_secs(5));
        let value = rt.run(|| SignerResult::Ok(42)).await.unwrap();
        assert_eq!(value, 42);

        let err = rt.run(|| {
            SignerResult::<()>::Err(Error::invalid_request("nope"))
        }).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(err.to_fault().fault_code, "Signer.InvalidRequest");
    }

    #[tokio::test]
    async fn slow_operations_time_out() {
        let rt = runtime(Duration::from_millis(20));
        let err = rt.run(|| {
            thread::sleep(Duration::from_millis(500));
            SignerResult::Ok(())
        }).await.unwrap_err();
        assert!(matches!(err.into_error(), Error::Timeout));
    }

    #[tokio::test]
    async fn concurrent_operations_are_limited() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let rt = SignerRuntime::current(Duration::from_secs(5), 2);
        let running = Arc::new(AtomicUsize::new(0));
        let most = Arc::new(AtomicUsize::new(0));
        let mut ops = tokio::task::JoinSet::new();
        for _ in 0..6 {
            let rt = rt.clone();
            let running = running.clone();
            let most = most.clone();
            ops.spawn(async move {
                rt.run(move || {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    most.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(50));
                    running.fetch_sub(1, Ordering::SeqCst);
                    SignerResult::Ok(())
                }).await
            });
        }
        while let Some(res) = ops.join_next().await {
            res.unwrap().unwrap();
        }
        assert_eq!(most.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn timed_out_operations_keep_their_permit() {
        let rt = SignerRuntime::current(Duration::from_millis(50), 1);
        let err = rt.run(|| {
            thread::sleep(Duration::from_millis(300));
            SignerResult::Ok(())
        }).await.unwrap_err();
        assert!(matches!(err.into_error(), Error::Timeout));

        // The slow operation still runs, so this one never gets to start.
        let err = rt.run(|| SignerResult::Ok(())).await.unwrap_err();
        assert!(matches!(err.into_error(), Error::Timeout));

        tokio::time::sleep(Duration::from_millis(300)).await;
        rt.run(|| SignerResult::Ok(())).await.unwrap();
    }

    #[tokio::test]
    async fn panicking_operations_are_internal_errors() {
        let rt = runtime(Duration::from_secs(5));
        let err = rt.run(|| -> SignerResult<()> {
            panic!("device driver bug")
        }).await.unwrap_err();
        assert!(matches!(err.into_error(), Error::Internal(_)));
    }
}
