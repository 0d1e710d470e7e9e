//! Process-termination signals, folded into one future the reactors
//! select on.

#[cfg(unix)]
async fn wait_for(kind: tokio::signal::unix::SignalKind) {
    use tokio::signal::unix::signal;

    match signal(kind) {
        Ok(mut sig) => {
            sig.recv().await;
        }
        // Registration failed: this kind simply never fires.
        Err(_) => std::future::pending::<()>().await,
    }
}

/// Completes when a termination signal arrives. On unix the set is
/// hangup, interrupt, terminate, and the two user signals; elsewhere
/// only the interrupt is available.
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::SignalKind;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = wait_for(SignalKind::hangup()) => {}
            _ = wait_for(SignalKind::terminate()) => {}
            _ = wait_for(SignalKind::user_defined1()) => {}
            _ = wait_for(SignalKind::user_defined2()) => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
