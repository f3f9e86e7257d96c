//! Entry points for both roles: [`PluginServer`] runs inside a plugin and
//! exposes its capabilities, [`PluginClient`] runs in the host and hands out
//! stubs for them.

use std::{future::Future, net::SocketAddr, sync::Arc};

use ferry_plugin_sdk::{Builder, CapabilityKind, Datasource, Mode};

use crate::{
    builder::{BuilderSkeleton, BuilderStub},
    datasource::{DatasourceSkeleton, DatasourceStub},
    error::TransportError,
    rpc::{Registry, RpcClient, ServerHandle},
};

/// Collects capability implementations and serves them in one [`Mode`].
pub struct PluginServer {
    mode: Mode,
    registry: Registry,
    endpoints: Vec<(String, CapabilityKind)>,
}

impl PluginServer {
    pub fn new(mode: Mode) -> Self {
        Self {
            mode,
            registry: Registry::new(),
            endpoints: Vec::new(),
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn serve_datasource(
        &mut self,
        endpoint: impl Into<String>,
        datasource: Arc<dyn Datasource>,
    ) -> Result<&mut Self, TransportError> {
        let endpoint = endpoint.into();
        self.registry
            .register(endpoint.clone(), DatasourceSkeleton::new(datasource, self.mode))?;
        self.endpoints.push((endpoint, CapabilityKind::Datasource));
        Ok(self)
    }

    pub fn serve_builder(
        &mut self,
        endpoint: impl Into<String>,
        builder: Arc<dyn Builder>,
    ) -> Result<&mut Self, TransportError> {
        let endpoint = endpoint.into();
        self.registry
            .register(endpoint.clone(), BuilderSkeleton::new(builder, self.mode))?;
        self.endpoints.push((endpoint, CapabilityKind::Builder));
        Ok(self)
    }

    pub fn endpoints(&self) -> &[(String, CapabilityKind)] {
        &self.endpoints
    }

    /// Binds `bind` and serves on a background task.
    pub async fn spawn(self, bind: SocketAddr) -> Result<ServerHandle, TransportError> {
        let mode = self.mode;
        let count = self.endpoints.len();
        let handle = ServerHandle::spawn(bind, self.registry).await?;
        tracing::info!(addr = %handle.local_addr(), %mode, endpoints = count, "plugin server listening");
        Ok(handle)
    }

    /// Serves until `signal` resolves, then shuts down and waits for the
    /// listener to close.
    pub async fn run_until<F>(self, bind: SocketAddr, signal: F) -> Result<(), TransportError>
    where
        F: Future<Output = ()>,
    {
        let handle = self.spawn(bind).await?;
        signal.await;
        tracing::info!(addr = %handle.local_addr(), "plugin server shutting down");
        handle.shutdown().await
    }
}

/// Host-side connection to one plugin process.
///
/// Every stub handed out shares the one connection.
pub struct PluginClient {
    client: Arc<RpcClient>,
    mode: Mode,
    callback_bind: Option<SocketAddr>,
}

impl PluginClient {
    pub async fn connect(addr: SocketAddr, mode: Mode) -> Result<Self, TransportError> {
        let client = RpcClient::connect(addr).await?;
        tracing::info!(%addr, %mode, "connected to plugin");
        Ok(Self {
            client: Arc::new(client),
            mode,
            callback_bind: None,
        })
    }

    /// Address builder stubs bind their callback servers to.
    pub fn with_callback_bind(mut self, bind: SocketAddr) -> Self {
        self.callback_bind = Some(bind);
        self
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.client.peer_addr()
    }

    pub fn datasource(&self, endpoint: impl Into<String>) -> DatasourceStub {
        DatasourceStub::new(self.client.clone(), endpoint, self.mode)
    }

    pub fn builder(&self, endpoint: impl Into<String>) -> BuilderStub {
        let stub = BuilderStub::new(self.client.clone(), endpoint, self.mode);
        match self.callback_bind {
            Some(bind) => stub.with_callback_bind(bind),
            None => stub,
        }
    }

    pub async fn close(&self) {
        self.client.close().await;
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use ferry_plugin_sdk::{Build, ObjectSpec, Type, Ui, Value};
    use parking_lot::Mutex;

    use super::*;

    #[derive(Default)]
    struct Lookup {
        name: Mutex<Option<String>>,
    }

    #[async_trait]
    impl Datasource for Lookup {
        async fn configure(&self, configs: Vec<Value>) -> anyhow::Result<()> {
            let name = configs
                .first()
                .and_then(|c| c.get("name"))
                .and_then(Value::as_str)
                .ok_or_else(|| anyhow::anyhow!("missing field: name"))?;
            *self.name.lock() = Some(name.to_string());
            Ok(())
        }

        async fn output_spec(&self) -> ObjectSpec {
            ObjectSpec::new().attr("result", Type::String, true)
        }

        async fn execute(&self) -> anyhow::Result<Value> {
            match self.name.lock().as_deref() {
                Some("foo") => Ok(Value::from("bar")),
                Some(other) => anyhow::bail!("no record for {other}"),
                None => anyhow::bail!("not configured"),
            }
        }
    }

    struct Noop;

    #[async_trait]
    impl Builder for Noop {
        async fn prepare(&self, _config: Value) -> anyhow::Result<()> {
            Ok(())
        }

        async fn run(&self, _build: Arc<dyn Build>, ui: Arc<dyn Ui>) -> anyhow::Result<()> {
            ui.say("nothing to do").await
        }
    }

    struct Quiet;

    #[async_trait]
    impl Build for Quiet {
        async fn name(&self) -> anyhow::Result<String> {
            Ok("quiet".into())
        }

        async fn progress(&self, _step: &str) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl Ui for Quiet {
        async fn say(&self, _message: &str) -> anyhow::Result<()> {
            Ok(())
        }

        async fn message(&self, _message: &str) -> anyhow::Result<()> {
            Ok(())
        }

        async fn error(&self, _message: &str) -> anyhow::Result<()> {
            Ok(())
        }
    }

    async fn start(mode: Mode) -> (ServerHandle, PluginClient) {
        let mut server = PluginServer::new(mode);
        server
            .serve_datasource("Datasource", Arc::new(Lookup::default()))
            .unwrap()
            .serve_builder("Builder", Arc::new(Noop))
            .unwrap();
        let handle = server.spawn("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let client = PluginClient::connect(handle.local_addr(), mode).await.unwrap();
        (handle, client)
    }

    #[tokio::test]
    async fn host_sees_plugin_result_in_both_modes() {
        crate::codec::register_builtin_types();
        for mode in [Mode::Legacy, Mode::Current] {
            let (_handle, client) = start(mode).await;
            let datasource = client.datasource("Datasource");
            datasource
                .configure(vec![Value::object([("name", Value::from("foo"))])])
                .await
                .unwrap();
            assert_eq!(datasource.execute().await.unwrap(), Value::from("bar"));
            client.close().await;
        }
    }

    #[tokio::test]
    async fn configure_error_reaches_host_verbatim() {
        let (_handle, client) = start(Mode::Current).await;
        let err = client
            .datasource("Datasource")
            .configure(vec![Value::object([("title", Value::from("foo"))])])
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "missing field: name");
    }

    #[tokio::test]
    async fn stubs_share_one_connection() {
        let (_handle, client) = start(Mode::Current).await;
        let builder = client.builder("Builder");
        let datasource = client.datasource("Datasource");

        let quiet = Arc::new(Quiet);
        builder.run(quiet.clone(), quiet).await.unwrap();
        assert_eq!(
            datasource.output_spec().await,
            ObjectSpec::new().attr("result", Type::String, true)
        );
    }

    #[tokio::test]
    async fn unknown_endpoint_is_a_transport_error() {
        let (_handle, client) = start(Mode::Current).await;
        let err = client.datasource("Missing").execute().await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "Missing.Execute failed: can't find service `Missing`"
        );
    }

    #[tokio::test]
    async fn run_until_stops_on_signal() {
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let mut server = PluginServer::new(Mode::Legacy);
        server
            .serve_datasource("Datasource", Arc::new(Lookup::default()))
            .unwrap();
        assert_eq!(server.endpoints().len(), 1);
        let task = tokio::spawn(server.run_until("127.0.0.1:0".parse().unwrap(), async {
            rx.await.ok();
        }));
        tx.send(()).unwrap();
        task.await.unwrap().unwrap();
    }
}
