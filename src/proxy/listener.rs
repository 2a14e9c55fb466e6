use std::time::Duration;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use super::AppContext;
use super::handler::serve_connection;

const DRAIN_DEADLINE: Duration = Duration::from_secs(30);

/// Accept loop: one task per inbound connection. When `shutdown` fires the
/// loop stops accepting, in-flight connections get up to 30 seconds to
/// drain, and whatever remains is aborted.
pub async fn serve(
    listener: TcpListener,
    app: AppContext,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let local_addr = listener.local_addr()?;
    info!(address = %local_addr, "proxy listening");

    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer_addr) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        error!(error = %err, "failed to accept incoming connection");
                        continue;
                    }
                };
                debug!(peer = %peer_addr, "accepted connection");
                if let Err(err) = stream.set_nodelay(true) {
                    debug!(peer = %peer_addr, error = %err, "failed to set TCP_NODELAY");
                }
                let connection_app = app.clone();
                let connection_shutdown = shutdown.clone();
                connections.spawn(async move {
                    if let Err(err) =
                        serve_connection(stream, peer_addr, connection_app, connection_shutdown)
                            .await
                    {
                        debug!(peer = %peer_addr, error = %err, "connection closed with error");
                    }
                });
                // Reap finished tasks so the set doesn't grow unboundedly.
                while connections.try_join_next().is_some() {}
            }
            _ = shutdown.changed() => break,
        }
    }

    info!(in_flight = connections.len(), "draining in-flight connections");
    let drain = async {
        while connections.join_next().await.is_some() {}
    };
    if timeout(DRAIN_DEADLINE, drain).await.is_err() {
        warn!("drain deadline exceeded; force-closing remaining connections");
        connections.shutdown().await;
    }
    info!("proxy stopped");
    Ok(())
}
