use std::future::Future;
use std::io;

use tokio::signal::unix::{signal, SignalKind};
use tracing::info;

/// Maps process signals to the reload and shutdown actions.
///
/// Blocks until `SIGINT` or `SIGTERM` comes in, running `reload` on every
/// `SIGHUP` along the way, then runs `shutdown` and returns. Meant to be the
/// foreground of the process.
pub async fn dispatch<R, S, Fut>(mut reload: R, shutdown: S) -> io::Result<()>
where
    R: FnMut(),
    S: FnOnce() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut hangup = signal(SignalKind::hangup())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;

    loop {
        tokio::select! {
            _ = hangup.recv() => {
                info!("Received SIGHUP, reloading");
                reload();
            }
            _ = interrupt.recv() => break,
            _ = terminate.recv() => break,
        }
    }

    info!("Shutting down...");
    shutdown().await;

    Ok(())
}
