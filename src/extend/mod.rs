use std::future::Future;

use async_shutdown::ShutdownManager;

pub(crate) mod frame_queue;

/// Spawns a task that is cancelled by the scope's shutdown trigger and whose
/// completion is awaited by `wait_shutdown_complete`. This is what makes
/// "old session teardown observed complete" hold before a replacement
/// session starts.
pub(crate) fn spawn_guarded<F>(shutdown: &ShutdownManager<()>, task: F)
where
    F: Future + Send + 'static,
    F::Output: Send,
{
    let shutdown = shutdown.clone();
    tokio::spawn(async move {
        let Ok(_token) = shutdown.delay_shutdown_token() else {
            return;
        };
        _ = shutdown.wrap_cancel(task).await;
    });
}

/// Propagates a parent scope's shutdown trigger into a child scope. The child
/// can still be triggered on its own without affecting the parent.
pub(crate) fn chain_shutdown(parent: &ShutdownManager<()>, child: &ShutdownManager<()>) {
    let parent = parent.clone();
    let child = child.clone();
    tokio::spawn(async move {
        parent.wait_shutdown_triggered().await;
        _ = child.trigger_shutdown(());
    });
}
