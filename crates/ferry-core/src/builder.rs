use std::{net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use ferry_plugin_sdk::{Build, Builder, Mode, Ui, Value};
use serde::{Deserialize, Serialize};

use crate::{
    callback::CallbackServer,
    codec::{self, Codec},
    envelope::{ErrorEnvelope, ErrorKind},
    error::{BridgeError, TransportError},
    rpc::{
        frame::{decode_body, encode_body},
        Empty, RpcClient, Service,
    },
    sink::{BuildSkeleton, BuildStub, UiSkeleton, UiStub, BUILD_ENDPOINT, UI_ENDPOINT},
    stub::{RemoteEndpoint, Reply},
};

#[derive(Debug, Serialize, Deserialize)]
pub struct PrepareArgs {
    pub config: Vec<u8>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct PrepareReply {
    pub error: Option<ErrorEnvelope>,
}

impl Reply for PrepareReply {
    fn take_error(&mut self) -> Option<ErrorEnvelope> {
        self.error.take()
    }
}

/// Sole argument of `Builder.Run`: where the plugin dials back to.
#[derive(Debug, Serialize, Deserialize)]
pub struct RunArgs {
    pub rpc_address: String,
}

fn loopback() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 0))
}

/// Host-side [`Builder`] forwarding to a plugin.
///
/// Each `run` opens a private [`CallbackServer`] carrying the host's
/// [`Build`] and [`Ui`], and tears it down before returning.
pub struct BuilderStub {
    endpoint: RemoteEndpoint,
    callback_bind: SocketAddr,
}

impl BuilderStub {
    pub fn new(client: Arc<RpcClient>, endpoint: impl Into<String>, mode: Mode) -> Self {
        Self {
            endpoint: RemoteEndpoint::new(client, endpoint, mode),
            callback_bind: loopback(),
        }
    }

    /// Address the callback server binds. The port is normally left at 0.
    pub fn with_callback_bind(mut self, bind: SocketAddr) -> Self {
        self.callback_bind = bind;
        self
    }

    pub fn endpoint(&self) -> &str {
        self.endpoint.name()
    }

    async fn run_with_callbacks(
        &self,
        server: &mut CallbackServer,
        build: Arc<dyn Build>,
        ui: Arc<dyn Ui>,
    ) -> Result<(), BridgeError> {
        server
            .register(BUILD_ENDPOINT, BuildSkeleton::new(build))
            .map_err(BridgeError::CallbackServer)?;
        server
            .register(UI_ENDPOINT, UiSkeleton::new(ui))
            .map_err(BridgeError::CallbackServer)?;
        let addr = server
            .start(self.callback_bind)
            .await
            .map_err(BridgeError::CallbackServer)?;

        tracing::info!(endpoint = self.endpoint.name(), callback = %addr, "running builder");
        let args = RunArgs {
            rpc_address: addr.to_string(),
        };
        let _: Empty = self.endpoint.invoke("Run", &args).await?;
        Ok(())
    }
}

#[async_trait]
impl Builder for BuilderStub {
    async fn prepare(&self, config: Value) -> anyhow::Result<()> {
        let codec = self.endpoint.codec();
        let config = codec
            .encode_value(&config)
            .map_err(|source| BridgeError::Configuration { index: 0, source })?;
        tracing::debug!(endpoint = self.endpoint.name(), "sending Prepare as {}", codec.name());
        let _: PrepareReply = self.endpoint.invoke("Prepare", &PrepareArgs { config }).await?;
        Ok(())
    }

    async fn run(&self, build: Arc<dyn Build>, ui: Arc<dyn Ui>) -> anyhow::Result<()> {
        let mut server = CallbackServer::new();
        let result = self.run_with_callbacks(&mut server, build, ui).await;
        server.stop().await;
        Ok(result?)
    }
}

/// Plugin-side server object for a [`Builder`].
pub struct BuilderSkeleton {
    builder: Arc<dyn Builder>,
    mode: Mode,
}

impl BuilderSkeleton {
    pub fn new(builder: Arc<dyn Builder>, mode: Mode) -> Self {
        Self { builder, mode }
    }

    fn codec(&self) -> &'static dyn Codec {
        codec::for_mode(self.mode)
    }

    async fn prepare(&self, args: PrepareArgs) -> PrepareReply {
        let config = match self.codec().decode_value(&args.config) {
            Ok(config) => config,
            Err(err) => {
                return PrepareReply {
                    error: Some(ErrorEnvelope::new(err.to_string(), Some(ErrorKind::Configuration))),
                }
            }
        };
        let result = self.builder.prepare(config).await;
        PrepareReply {
            error: ErrorEnvelope::wrap(&result, ErrorKind::Configuration),
        }
    }

    async fn run(&self, args: RunArgs) -> Result<(), TransportError> {
        let client = Arc::new(RpcClient::connect(args.rpc_address.as_str()).await?);
        tracing::debug!(callback = %client.peer_addr(), "dialed host callback server");
        let build = Arc::new(BuildStub::new(client.clone(), self.mode));
        let ui = Arc::new(UiStub::new(client.clone(), self.mode));
        let result = self.builder.run(build, ui).await;
        client.close().await;
        // Run has no reply body; its failure travels as the transport error.
        result.map_err(|err| TransportError::ServerError(err.to_string()))
    }
}

#[async_trait]
impl Service for BuilderSkeleton {
    async fn call(&self, method: &str, body: &[u8]) -> Result<Vec<u8>, TransportError> {
        match method {
            "Prepare" => encode_body(&self.prepare(decode_body(body)?).await),
            "Run" => {
                self.run(decode_body(body)?).await?;
                encode_body(&Empty)
            }
            other => Err(TransportError::UnknownMethod(other.to_string())),
        }
    }
}
