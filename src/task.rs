//! Supervised task spawning
//!
//! Every background task is spawned through [`spawn_supervised`], which
//! catches an unwinding panic at the task boundary and logs it, so one
//! crashing task never brings down the process or its siblings.

use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use tokio::task::JoinHandle;
use tracing::error;

/// Spawn `future` on the runtime, containing any panic to this task
pub fn spawn_supervised<F>(name: &'static str, future: F) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(panic) = AssertUnwindSafe(future).catch_unwind().await {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            error!(task = name, "task panicked: {}", message);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn panicking_task_does_not_propagate() {
        let handle = spawn_supervised("boom", async {
            panic!("intentional test panic");
        });
        // The join itself must succeed: the panic was contained
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn normal_task_runs_to_completion() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        spawn_supervised("ok", async move {
            flag.store(true, Ordering::SeqCst);
        })
        .await
        .unwrap();
        assert!(ran.load(Ordering::SeqCst));
    }
}
