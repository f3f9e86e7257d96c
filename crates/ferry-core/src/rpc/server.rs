use std::{collections::HashMap, net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use tokio::{
    io::BufReader,
    net::{tcp::OwnedWriteHalf, TcpListener, TcpStream},
    sync::{watch, Mutex as AsyncMutex},
    task::{JoinHandle, JoinSet},
};
use tracing::Instrument;

use super::frame::{read_frame, write_frame, RequestFrame, ResponseFrame};
use crate::error::TransportError;

/// An object reachable over RPC under one endpoint name.
///
/// `method` is the part after the endpoint prefix. Returning `Err` reports a
/// transport-level failure to the caller; domain failures belong in the reply
/// body.
#[async_trait]
pub trait Service: Send + Sync + 'static {
    async fn call(&self, method: &str, body: &[u8]) -> Result<Vec<u8>, TransportError>;
}

/// Endpoint name to service table. Populated before serving, read-only after.
#[derive(Default)]
pub struct Registry {
    services: HashMap<String, Arc<dyn Service>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<S: Service>(
        &mut self,
        endpoint: impl Into<String>,
        service: S,
    ) -> Result<(), TransportError> {
        self.register_arc(endpoint, Arc::new(service))
    }

    pub fn register_arc(
        &mut self,
        endpoint: impl Into<String>,
        service: Arc<dyn Service>,
    ) -> Result<(), TransportError> {
        let endpoint = endpoint.into();
        if self.services.contains_key(&endpoint) {
            return Err(TransportError::DuplicateService(endpoint));
        }
        self.services.insert(endpoint, service);
        Ok(())
    }

    pub fn endpoints(&self) -> impl Iterator<Item = &str> {
        self.services.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub async fn dispatch(&self, method: &str, body: &[u8]) -> Result<Vec<u8>, TransportError> {
        let (endpoint, name) = method
            .rsplit_once('.')
            .ok_or_else(|| TransportError::MalformedMethod(method.to_string()))?;
        let service = self
            .services
            .get(endpoint)
            .ok_or_else(|| TransportError::UnknownService(endpoint.to_string()))?;
        service.call(name, body).await
    }
}

/// Accepts connections until `shutdown` flips. Dropping out of this function
/// closes the listener and aborts every connection it spawned.
pub async fn serve(
    listener: TcpListener,
    registry: Arc<Registry>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), TransportError> {
    let local = listener.local_addr()?;
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                tracing::debug!(addr = %local, "rpc server shutting down");
                break;
            }
            Some(finished) = connections.join_next(), if !connections.is_empty() => {
                if let Err(err) = finished {
                    if !err.is_cancelled() {
                        tracing::error!(error = %err, "connection task aborted");
                    }
                }
            }
            accept = listener.accept() => {
                let (stream, peer) = accept?;
                let registry = registry.clone();
                connections.spawn(async move {
                    if let Err(err) = serve_connection(stream, peer, registry).await {
                        tracing::warn!(%peer, error = %err, "connection closed with error");
                    }
                });
            }
        }
    }
    Ok(())
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    registry: Arc<Registry>,
) -> Result<(), TransportError> {
    stream.set_nodelay(true)?;
    let (reader, writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let writer = Arc::new(AsyncMutex::new(writer));
    let mut calls = JoinSet::new();
    tracing::debug!(%peer, "connection accepted");

    // Each request runs on its own task so a long call does not hold up the
    // rest of the connection (Cancel must reach the server while Execute runs).
    while let Some(frame) = read_frame::<_, RequestFrame>(&mut reader).await? {
        calls.spawn(handle_request(registry.clone(), writer.clone(), frame));
        while let Some(done) = calls.try_join_next() {
            match done {
                Ok(Err(err)) => tracing::warn!(%peer, error = %err, "failed to send reply"),
                Err(err) if !err.is_cancelled() => tracing::error!(%peer, error = %err, "call panicked"),
                _ => {}
            }
        }
    }
    tracing::debug!(%peer, in_flight = calls.len(), "peer closed connection");
    Ok(())
}

async fn handle_request(
    registry: Arc<Registry>,
    writer: Arc<AsyncMutex<OwnedWriteHalf>>,
    frame: RequestFrame,
) -> Result<(), TransportError> {
    let span = tracing::debug_span!("rpc", method = %frame.method, seq = frame.seq);
    let result = registry
        .dispatch(&frame.method, &frame.body)
        .instrument(span)
        .await;
    let reply = match result {
        Ok(body) => {
            metrics::counter!("ferry_rpc_requests_total", "outcome" => "ok").increment(1);
            ResponseFrame {
                seq: frame.seq,
                body,
                error: None,
            }
        }
        Err(err) => {
            metrics::counter!("ferry_rpc_requests_total", "outcome" => "error").increment(1);
            tracing::warn!(method = %frame.method, error = %err, "call failed");
            ResponseFrame {
                seq: frame.seq,
                body: Vec::new(),
                error: Some(err.to_string()),
            }
        }
    };
    let mut writer = writer.lock().await;
    write_frame(&mut *writer, &reply).await
}

/// A running server bound to a local address.
///
/// Dropping the handle signals shutdown and aborts the accept loop, so the
/// listening socket is released on every exit path. [`ServerHandle::shutdown`]
/// additionally waits until the socket is closed.
pub struct ServerHandle {
    addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<Result<(), TransportError>>>,
}

impl ServerHandle {
    pub async fn spawn(bind: SocketAddr, registry: Registry) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(bind).await?;
        let addr = listener.local_addr()?;
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(serve(listener, Arc::new(registry), shutdown_rx));
        Ok(Self {
            addr,
            shutdown,
            task: Some(task),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn shutdown(mut self) -> Result<(), TransportError> {
        self.shutdown.send(true).ok();
        let Some(task) = self.task.take() else {
            return Ok(());
        };
        match task.await {
            Ok(result) => result,
            Err(err) if err.is_cancelled() => Ok(()),
            Err(err) => Err(TransportError::Io(std::io::Error::other(err))),
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.shutdown.send(true).ok();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
