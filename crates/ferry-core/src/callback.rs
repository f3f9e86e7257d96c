use std::net::SocketAddr;

use crate::{
    error::TransportError,
    rpc::{Registry, ServerHandle, Service},
};

/// Short-lived listener exposing host-owned objects to a plugin for the span
/// of one call.
///
/// Objects are registered before [`CallbackServer::start`]; the registry is
/// frozen afterwards. Dropping the server releases the socket even if
/// [`CallbackServer::stop`] never ran.
pub struct CallbackServer {
    registry: Option<Registry>,
    handle: Option<ServerHandle>,
}

impl Default for CallbackServer {
    fn default() -> Self {
        Self::new()
    }
}

impl CallbackServer {
    pub fn new() -> Self {
        Self {
            registry: Some(Registry::new()),
            handle: None,
        }
    }

    pub fn register<S: Service>(
        &mut self,
        endpoint: impl Into<String>,
        service: S,
    ) -> Result<(), TransportError> {
        self.registry
            .as_mut()
            .ok_or(TransportError::ServerStarted)?
            .register(endpoint, service)
    }

    /// Binds `bind` (usually port 0) and starts serving on a background task.
    pub async fn start(&mut self, bind: SocketAddr) -> Result<SocketAddr, TransportError> {
        let registry = self.registry.take().ok_or(TransportError::ServerStarted)?;
        let endpoints = registry.endpoints().collect::<Vec<_>>().join(",");
        let handle = ServerHandle::spawn(bind, registry).await?;
        let addr = handle.local_addr();
        metrics::counter!("ferry_callback_servers_total").increment(1);
        tracing::info!(%addr, endpoints = %endpoints, "callback server listening");
        self.handle = Some(handle);
        Ok(addr)
    }

    pub fn address(&self) -> Option<SocketAddr> {
        self.handle.as_ref().map(ServerHandle::local_addr)
    }

    /// Stops serving and waits until the listening socket is closed.
    pub async fn stop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        let addr = handle.local_addr();
        match handle.shutdown().await {
            Ok(()) => tracing::debug!(%addr, "callback server stopped"),
            Err(err) => tracing::warn!(%addr, error = %err, "callback server stopped with error"),
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use tokio::net::TcpStream;

    use super::*;
    use crate::rpc::RpcClient;

    struct Ping;

    #[async_trait]
    impl Service for Ping {
        async fn call(&self, _method: &str, _body: &[u8]) -> Result<Vec<u8>, TransportError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn registry_is_frozen_once_started() {
        let mut server = CallbackServer::new();
        server.register("Ping", Ping).unwrap();
        server.start("127.0.0.1:0".parse().unwrap()).await.unwrap();
        assert!(matches!(
            server.register("Late", Ping),
            Err(TransportError::ServerStarted)
        ));
        assert!(matches!(
            server.start("127.0.0.1:0".parse().unwrap()).await,
            Err(TransportError::ServerStarted)
        ));
        server.stop().await;
    }

    #[tokio::test]
    async fn stop_closes_the_listening_socket() {
        let mut server = CallbackServer::new();
        server.register("Ping", Ping).unwrap();
        let addr = server.start("127.0.0.1:0".parse().unwrap()).await.unwrap();

        let client = RpcClient::connect(addr).await.unwrap();
        client
            .call::<_, crate::rpc::Empty>("Ping.Any", &crate::rpc::Empty)
            .await
            .unwrap();

        server.stop().await;
        assert!(server.address().is_none());
        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn dropping_the_server_releases_the_socket() {
        let mut server = CallbackServer::new();
        server.register("Ping", Ping).unwrap();
        let addr = server.start("127.0.0.1:0".parse().unwrap()).await.unwrap();
        drop(server);
        // Abort is processed on the next scheduler turn.
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert!(TcpStream::connect(addr).await.is_err());
    }
}
