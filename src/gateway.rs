use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::bridge::BridgeSession;
use crate::upstream::UpstreamTarget;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// Local SOCKS5 listener bridging every accepted client through one
/// configured upstream proxy. Sessions are independent; a failing session
/// never takes down the accept loop or its siblings.
pub struct GatewayServer {
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    accept_task: tokio::task::JoinHandle<()>,
}

impl GatewayServer {
    pub async fn start(
        bind_address: SocketAddr,
        upstream: UpstreamTarget,
        connect_timeout: Duration,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(bind_address).await?;
        let local_addr = listener.local_addr()?;
        log::info!("gateway listening on {local_addr}");

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let upstream = Arc::new(upstream);

        let accept_task = tokio::spawn(async move {
            let mut sessions: JoinSet<()> = JoinSet::new();
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, peer_addr)) => {
                                if let Err(e) = stream.set_nodelay(true) {
                                    log::warn!("failed to set nodelay for {peer_addr}: {e}");
                                }
                                let session =
                                    BridgeSession::new(upstream.clone(), connect_timeout);
                                sessions.spawn(async move {
                                    if let Err(e) = session.run(Box::new(stream)).await {
                                        log::warn!("session from {peer_addr} failed: {e}");
                                    }
                                });
                            }
                            Err(e) => {
                                log::warn!("accept failed: {e}");
                            }
                        }
                    }
                    Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
                    _ = shutdown_rx.changed() => {
                        break;
                    }
                }
            }
            sessions.abort_all();
            while sessions.join_next().await.is_some() {}
        });

        Ok(Self {
            local_addr,
            shutdown_tx,
            accept_task,
        })
    }

    /// The bound address, useful when starting on port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting, aborts in-flight sessions, and waits briefly for the
    /// accept task to wind down.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        let abort_handle = self.accept_task.abort_handle();
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, self.accept_task)
            .await
            .is_err()
        {
            log::warn!("gateway shutdown timed out, aborting accept task");
            abort_handle.abort();
        }
    }
}
