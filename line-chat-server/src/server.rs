use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

use tokio::{
    net::{TcpListener, TcpStream},
    select,
};
use tracing::{Instrument, debug, info, info_span, warn};

use crate::{
    error::{RegisterError, ServerError},
    registry::Registry,
    session::{SessionConfig, run_session},
};

pub const DEFAULT_LISTEN: &str = "0.0.0.0:8080";

// Pause after a failed accept so a persistent error (e.g. fd exhaustion) does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    pub session: SessionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 8080)),
            session: SessionConfig::default(),
        }
    }
}

/// Accept loop that hands every connection to its own session task.
pub struct Server {
    listener: TcpListener,
    registry: Arc<Registry>,
    session: SessionConfig,
}

impl Server {
    pub async fn bind(config: &ServerConfig) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(config.listen)
            .await
            .map_err(|source| ServerError::Bind {
                addr: config.listen,
                source,
            })?;
        Ok(Self::new(listener, config.session.clone()))
    }

    pub fn new(listener: TcpListener, session: SessionConfig) -> Self {
        Self {
            listener,
            registry: Arc::new(Registry::new()),
            session,
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Handle to the shared registry, for observation.
    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.registry)
    }

    /// Accepts connections until `shutdown` resolves.
    ///
    /// Sessions already running are not cancelled; they end on their own or
    /// with the process.
    pub async fn run_until<F>(self, shutdown: F)
    where
        F: Future<Output = ()> + Send,
    {
        let Server {
            listener,
            registry,
            session,
        } = self;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    info!("listener shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &registry, &session).await;
                }
            }
        }
    }

    pub async fn run_until_ctrl_c(self) {
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
    config: &SessionConfig,
) {
    match result {
        Ok((stream, peer)) => spawn_session(stream, peer, registry, config),
        Err(err) => {
            warn!(error = ?err, "failed to accept connection");
            tokio::time::sleep(ACCEPT_BACKOFF).await;
        }
    }
}

fn spawn_session(
    stream: TcpStream,
    peer: SocketAddr,
    registry: &Arc<Registry>,
    config: &SessionConfig,
) {
    let registry = Arc::clone(registry);
    let config = config.clone();
    let span = info_span!("session", peer = %peer);

    tokio::spawn(
        async move {
            debug!("connection accepted");
            let (reader, writer) = stream.into_split();
            match run_session(reader, writer, registry, &config).await {
                Ok(()) => debug!("connection closed"),
                Err(err) if err.downcast_ref::<RegisterError>().is_some() => {
                    info!(error = %err, "registration rejected");
                }
                Err(err) => warn!(error = ?err, "session ended with error"),
            }
        }
        .instrument(span),
    );
}
