//! Serving the mailbox (HTTPS) and metrics (HTTP) surfaces of a Peer.

use crate::error::{ApiError, ApiResult};
use crate::{mailbox, metrics};
use acn_kernel::{Monitor, PeerNode};
use acn_types::config::AcnConfig;
use acn_wire::Host;
use axum::serve::{Listener, ListenerExt};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

/// Time a client has to finish the TLS handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Handshakes completed but not yet picked up by the server.
const ACCEPT_BACKLOG: usize = 128;

/// TCP listener that hands out TLS streams.
///
/// Handshakes run on their own tasks so a slow client cannot stall accepts.
pub struct TlsListener {
    local_addr: SocketAddr,
    ready: mpsc::Receiver<(TlsStream<TcpStream>, SocketAddr)>,
    acceptor_task: JoinHandle<()>,
}

impl TlsListener {
    pub fn new(listener: TcpListener, acceptor: TlsAcceptor) -> std::io::Result<Self> {
        let local_addr = listener.local_addr()?;
        let (tx, ready) = mpsc::channel(ACCEPT_BACKLOG);
        let acceptor_task = tokio::spawn(accept_loop(listener, acceptor, tx));
        Ok(Self {
            local_addr,
            ready,
            acceptor_task,
        })
    }
}

impl Drop for TlsListener {
    fn drop(&mut self) {
        self.acceptor_task.abort();
    }
}

async fn accept_loop(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    ready: mpsc::Sender<(TlsStream<TcpStream>, SocketAddr)>,
) {
    loop {
        match listener.accept().await {
            Ok((tcp, addr)) => {
                let acceptor = acceptor.clone();
                let ready = ready.clone();
                tokio::spawn(async move {
                    match tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(tcp)).await {
                        Ok(Ok(tls)) => {
                            let _ = ready.send((tls, addr)).await;
                        }
                        Ok(Err(e)) => debug!("Mailbox: TLS handshake with {} failed: {}", addr, e),
                        Err(_) => debug!("Mailbox: TLS handshake with {} timed out", addr),
                    }
                });
            }
            Err(e) => {
                error!("Mailbox: accept error: {}", e);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
        if ready.is_closed() {
            break;
        }
    }
}

impl Listener for TlsListener {
    type Io = TlsStream<TcpStream>;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        match self.ready.recv().await {
            Some(conn) => conn,
            // The accept loop only stops once this receiver is gone.
            None => std::future::pending().await,
        }
    }

    fn local_addr(&self) -> std::io::Result<Self::Addr> {
        Ok(self.local_addr)
    }
}

/// A running HTTP server.
pub struct ServiceHandle {
    local_addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl ServiceHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting and wait for in-flight requests.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if tokio::time::timeout(Duration::from_secs(5), &mut self.task).await.is_err() {
            self.task.abort();
        }
    }
}

fn spawn_server<F, Fut>(name: &'static str, local_addr: SocketAddr, serve: F) -> ServiceHandle
where
    F: FnOnce(oneshot::Receiver<()>) -> Fut,
    Fut: Future<Output = std::io::Result<()>> + Send + 'static,
{
    let (tx, rx) = oneshot::channel::<()>();
    let server = serve(rx);
    let task = tokio::spawn(async move {
        if let Err(e) = server.await {
            warn!("{} server error: {}", name, e);
        }
        info!("{} server stopped", name);
    });
    ServiceHandle {
        local_addr,
        shutdown: Some(tx),
        task,
    }
}

async fn bind(addr: &str) -> ApiResult<(TcpListener, SocketAddr)> {
    let listener = TcpListener::bind(addr).await.map_err(|source| ApiError::Bind {
        addr: addr.to_string(),
        source,
    })?;
    let local_addr = listener.local_addr().map_err(|source| ApiError::Bind {
        addr: addr.to_string(),
        source,
    })?;
    Ok((listener, local_addr))
}

/// Serve the mailbox endpoints of `peer` over HTTPS on `addr`.
pub async fn start_mailbox(
    peer: Arc<PeerNode>,
    addr: &str,
    rate_limit_per_minute: u32,
) -> ApiResult<ServiceHandle> {
    let identity = peer
        .tls_identity()
        .ok_or_else(|| ApiError::Unavailable("peer has no TLS session identity".into()))?;
    let mut tls_config = identity.server_config()?;
    tls_config.alpn_protocols = vec![b"http/1.1".to_vec()];
    let acceptor = TlsAcceptor::from(Arc::new(tls_config));

    let (tcp, local_addr) = bind(addr).await?;
    let listener = TlsListener::new(tcp, acceptor).map_err(|source| ApiError::Bind {
        addr: addr.to_string(),
        source,
    })?;
    info!("Mailbox service listening on https://{}", local_addr);
    let app = mailbox::router(peer, rate_limit_per_minute);
    Ok(spawn_server("Mailbox", local_addr, move |stop| async move {
        axum::serve(
            listener.tap_io(|_| {}),
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
            .with_graceful_shutdown(async {
                let _ = stop.await;
            })
            .await
    }))
}

/// Serve `GET /metrics` over plain HTTP on `addr`.
pub async fn start_metrics(monitor: Monitor, addr: &str) -> ApiResult<ServiceHandle> {
    let (listener, local_addr) = bind(addr).await?;
    info!("Metrics exporter listening on http://{}/metrics", local_addr);
    let app = metrics::router(monitor);
    Ok(spawn_server("Metrics", local_addr, move |stop| async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = stop.await;
            })
            .await
    }))
}

/// A Peer together with the HTTP services its config enables.
pub struct AcnService {
    peer: Arc<PeerNode>,
    mailbox: Option<ServiceHandle>,
    metrics: Option<ServiceHandle>,
}

impl AcnService {
    pub async fn start(config: AcnConfig, host: Arc<dyn Host>) -> ApiResult<Self> {
        let peer = PeerNode::start(config.clone(), host).await?;
        match Self::start_services(&peer, &config).await {
            Ok((mailbox, metrics)) => Ok(Self {
                peer,
                mailbox,
                metrics,
            }),
            Err(e) => {
                error!(error = %e, "ACN service failed to start");
                peer.close().await;
                Err(e)
            }
        }
    }

    async fn start_services(
        peer: &Arc<PeerNode>,
        config: &AcnConfig,
    ) -> ApiResult<(Option<ServiceHandle>, Option<ServiceHandle>)> {
        let mailbox = match &config.mailbox.listen_addr {
            Some(addr) => Some(
                start_mailbox(Arc::clone(peer), addr, config.mailbox.rate_limit_per_minute).await?,
            ),
            None => None,
        };
        let metrics = match &config.monitoring.listen_addr {
            Some(addr) => match start_metrics(peer.monitor().clone(), addr).await {
                Ok(handle) => Some(handle),
                Err(e) => {
                    if let Some(mailbox) = mailbox {
                        mailbox.shutdown().await;
                    }
                    return Err(e);
                }
            },
            None => None,
        };
        Ok((mailbox, metrics))
    }

    pub fn peer(&self) -> &Arc<PeerNode> {
        &self.peer
    }

    pub fn mailbox_addr(&self) -> Option<SocketAddr> {
        self.mailbox.as_ref().map(ServiceHandle::local_addr)
    }

    pub fn metrics_addr(&self) -> Option<SocketAddr> {
        self.metrics.as_ref().map(ServiceHandle::local_addr)
    }

    pub async fn close(self) {
        if let Some(mailbox) = self.mailbox {
            mailbox.shutdown().await;
        }
        if let Some(metrics) = self.metrics {
            metrics.shutdown().await;
        }
        self.peer.close().await;
    }
}
