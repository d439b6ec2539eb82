use std::{future::Future, net::SocketAddr, sync::Arc};

use anyhow::Result;
use futures::StreamExt;
use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, TcpStream},
    select,
};
use tokio_util::codec::FramedRead;
use tracing::{debug, info, warn};

use crate::{
    codec::LineCodec,
    message::Message,
    registry::{Admission, ConnectionId, DEFAULT_OUTBOUND_CAPACITY, Registry},
};

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Lines a connection may have queued before it is evicted as too slow.
    pub outbound_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
        }
    }
}

pub struct Relay {
    listener: TcpListener,
    registry: Arc<Registry>,
}

impl Relay {
    pub fn new(listener: TcpListener, config: RelayConfig) -> Self {
        Self {
            listener,
            registry: Arc::new(Registry::new(config.outbound_capacity)),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Handle on the shared state, for inspection.
    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.registry)
    }

    /// Accepts connections until `shutdown` resolves. Connections already
    /// admitted keep running.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Relay { listener, registry } = self;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    info!("relay no longer accepting connections");
                    break;
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &registry).await;
                }
            }
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

async fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    registry: &Arc<Registry>,
) {
    match result {
        Ok((stream, peer)) => {
            info!(%peer, "client connected");
            // Registered, with its avatar snapshot queued, before its task starts.
            let admission = registry.admit().await;
            spawn_connection_handler(stream, peer, admission, registry);
        }
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_connection_handler(
    stream: TcpStream,
    peer: SocketAddr,
    admission: Admission,
    registry: &Arc<Registry>,
) {
    let registry = Arc::clone(registry);
    tokio::spawn(async move {
        let id = admission.id;
        let outcome = handle_connection(stream, admission, &registry).await;
        if let Err(err) = &outcome {
            warn!(%peer, error = ?err, "client connection closed with error");
        }
        match registry.depart(id).await {
            Some(name) => info!(%peer, %name, "client disconnected"),
            None => info!(%peer, "unnamed client disconnected"),
        }
    });
}

async fn handle_connection(
    stream: TcpStream,
    admission: Admission,
    registry: &Registry,
) -> Result<()> {
    let Admission {
        id,
        mut outbound,
        evicted,
    } = admission;
    let (reader, mut writer) = stream.into_split();
    let mut lines = FramedRead::new(reader, LineCodec::new());

    loop {
        select! {
            _ = evicted.cancelled() => {
                warn!(id, "dropping connection that stopped reading");
                break;
            }
            line = lines.next() => match line {
                Some(line) => handle_line(registry, id, &line?).await,
                None => break,
            },
            queued = outbound.recv() => match queued {
                // A peer that never drains would park this write forever.
                Some(bytes) => select! {
                    written = writer.write_all(&bytes) => written?,
                    _ = evicted.cancelled() => {
                        warn!(id, "dropping connection that stopped reading");
                        break;
                    }
                },
                None => break,
            },
        }
    }

    Ok(())
}

async fn handle_line(registry: &Registry, id: ConnectionId, line: &str) {
    match Message::parse(line) {
        Ok(Some(message)) => {
            let delivered = registry.relay(id, &message).await;
            debug!(id, delivered, "relayed line");
        }
        Ok(None) => {}
        Err(err) => debug!(id, error = %err, "dropping malformed line"),
    }
}
