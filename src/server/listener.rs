use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio_rustls::TlsAcceptor;
use tracing::{info, warn};

use crate::config::Config;
use crate::http::connection::serve_connection;
use crate::http::handler::Handler;
use crate::settings::ConnectionSettings;
use crate::transport::{Stream, load_tls_acceptor};

/// Accepts connections and runs each one on its own task.
pub struct Server {
    config: Config,
    settings: Arc<ConnectionSettings>,
    tls: Option<TlsAcceptor>,
    limit: Option<Arc<Semaphore>>,
}

impl Server {
    pub fn new(config: Config, handler: impl Handler) -> anyhow::Result<Self> {
        config.validate()?;

        let tls = match &config.server.tls {
            Some(tls) => {
                let (Some(cert), Some(key)) = (&tls.cert_path, &tls.key_path) else {
                    anyhow::bail!("server.tls needs both cert_path and key_path");
                };
                Some(load_tls_acceptor(cert, key)?)
            }
            None => None,
        };
        let limit = config
            .server
            .max_connections
            .map(|max| Arc::new(Semaphore::new(max)));
        let settings = Arc::new(ConnectionSettings::from_config(&config, handler));

        Ok(Self {
            config,
            settings,
            tls,
            limit,
        })
    }

    pub fn settings(&self) -> &Arc<ConnectionSettings> {
        &self.settings
    }

    pub async fn bind(&self) -> anyhow::Result<TcpListener> {
        let addr = &self.config.server.listen_addr;
        TcpListener::bind(addr)
            .await
            .with_context(|| format!("binding {addr}"))
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Serves until `shutdown` resolves. Connections already accepted keep
    /// running on their own tasks.
    pub async fn run_until(&self, shutdown: impl Future<Output = ()>) -> anyhow::Result<()> {
        let listener = self.bind().await?;
        self.serve_listener(listener, shutdown).await
    }

    pub async fn serve_listener(&self, listener: TcpListener, shutdown: impl Future<Output = ()>) -> anyhow::Result<()> {
        tokio::pin!(shutdown);
        info!(
            "Listening on {}{}",
            listener.local_addr()?,
            if self.tls.is_some() { " (TLS)" } else { "" }
        );

        loop {
            let permit = match &self.limit {
                Some(limit) => tokio::select! {
                    biased;
                    _ = &mut shutdown => break,
                    permit = Arc::clone(limit).acquire_owned() => Some(permit?),
                },
                None => None,
            };

            let (socket, peer) = tokio::select! {
                biased;
                _ = &mut shutdown => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("Accept failed: {}", e);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        continue;
                    }
                },
            };
            info!("Accepted connection from {}", peer);

            if let Err(e) = socket.set_nodelay(true) {
                warn!("Failed to set TCP_NODELAY for {}: {}", peer, e);
            }

            let settings = Arc::clone(&self.settings);
            let tls = self.tls.clone();
            let handshake_limit = self.config.connection.read_next_http_message_timelimit;

            tokio::spawn(async move {
                let _permit = permit;
                let result = match tls {
                    Some(acceptor) => match tokio::time::timeout(handshake_limit, acceptor.accept(socket)).await {
                        Ok(Ok(stream)) => serve_connection(Stream::Tls(Box::new(stream)), settings).await,
                        Ok(Err(e)) => Err(anyhow::Error::new(e).context("TLS handshake failed")),
                        Err(_) => Err(anyhow::anyhow!("TLS handshake timed out")),
                    },
                    None => serve_connection(Stream::Plain(socket), settings).await,
                };

                if let Err(e) = result {
                    tracing::error!("Connection error from {}: {:#}", peer, e);
                }
            });
        }

        info!("Stopped accepting connections");
        Ok(())
    }
}
