//! Process-wide shutdown signal.
//!
//! One root [`CancellationToken`] is cancelled on Ctrl-C; every loop runs on a
//! child of it, so a single `cancel()` reaches all of them.

use std::future::Future;
use std::io;
use tokio_util::sync::CancellationToken;

/// Cancels `root` on the first Ctrl-C. Returns the same token for chaining.
pub fn cancel_on_ctrl_c(root: CancellationToken) -> CancellationToken {
    cancel_on_signal(root, tokio::signal::ctrl_c())
}

/// Cancels `root` once `signal` fires. A signal that cannot be listened for
/// leaves the token alone; the process then runs until it ends on its own.
pub fn cancel_on_signal<F>(root: CancellationToken, signal: F) -> CancellationToken
where
    F: Future<Output = io::Result<()>> + Send + 'static,
{
    let token = root.clone();

    tokio::spawn(async move {
        match signal.await {
            Ok(()) => {
                tracing::info!("Shutdown signal received");
                token.cancel();
            }
            Err(e) => tracing::error!("Unable to listen for shutdown signal: {}", e),
        }
    });

    root
}
