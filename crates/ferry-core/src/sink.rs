//! Reverse-direction objects for a builder run.
//!
//! The host wraps its own [`Build`] and [`Ui`] in skeletons and serves them
//! from a callback server; the plugin reaches them through the stubs below
//! over a connection it dials itself.

use std::sync::Arc;

use async_trait::async_trait;
use ferry_plugin_sdk::{Build, Mode, Ui};
use serde::{Deserialize, Serialize};

use crate::{
    envelope::{ErrorEnvelope, ErrorKind},
    error::TransportError,
    rpc::{
        frame::{decode_body, encode_body},
        RpcClient, Service,
    },
    stub::{RemoteEndpoint, Reply},
};

pub const BUILD_ENDPOINT: &str = "Build";
pub const UI_ENDPOINT: &str = "Ui";

#[derive(Debug, Serialize, Deserialize)]
pub struct MessageArgs {
    pub message: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct SinkReply {
    pub error: Option<ErrorEnvelope>,
}

impl Reply for SinkReply {
    fn take_error(&mut self) -> Option<ErrorEnvelope> {
        self.error.take()
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct NameReply {
    pub name: String,
    pub error: Option<ErrorEnvelope>,
}

impl Reply for NameReply {
    fn take_error(&mut self) -> Option<ErrorEnvelope> {
        self.error.take()
    }
}

/// Plugin-side [`Build`] that forwards to the host.
pub struct BuildStub {
    endpoint: RemoteEndpoint,
}

impl BuildStub {
    pub fn new(client: Arc<RpcClient>, mode: Mode) -> Self {
        Self {
            endpoint: RemoteEndpoint::new(client, BUILD_ENDPOINT, mode),
        }
    }
}

#[async_trait]
impl Build for BuildStub {
    async fn name(&self) -> anyhow::Result<String> {
        let reply: NameReply = self.endpoint.invoke("Name", &crate::rpc::Empty).await?;
        Ok(reply.name)
    }

    async fn progress(&self, step: &str) -> anyhow::Result<()> {
        let args = MessageArgs {
            message: step.to_string(),
        };
        let _: SinkReply = self.endpoint.invoke("Progress", &args).await?;
        Ok(())
    }
}

/// Plugin-side [`Ui`] that forwards to the host.
pub struct UiStub {
    endpoint: RemoteEndpoint,
}

impl UiStub {
    pub fn new(client: Arc<RpcClient>, mode: Mode) -> Self {
        Self {
            endpoint: RemoteEndpoint::new(client, UI_ENDPOINT, mode),
        }
    }

    async fn send(&self, method: &str, message: &str) -> anyhow::Result<()> {
        let args = MessageArgs {
            message: message.to_string(),
        };
        let _: SinkReply = self.endpoint.invoke(method, &args).await?;
        Ok(())
    }
}

#[async_trait]
impl Ui for UiStub {
    async fn say(&self, message: &str) -> anyhow::Result<()> {
        self.send("Say", message).await
    }

    async fn message(&self, message: &str) -> anyhow::Result<()> {
        self.send("Message", message).await
    }

    async fn error(&self, message: &str) -> anyhow::Result<()> {
        self.send("Error", message).await
    }
}

/// Host-side server object for a [`Build`].
pub struct BuildSkeleton {
    build: Arc<dyn Build>,
}

impl BuildSkeleton {
    pub fn new(build: Arc<dyn Build>) -> Self {
        Self { build }
    }
}

#[async_trait]
impl Service for BuildSkeleton {
    async fn call(&self, method: &str, body: &[u8]) -> Result<Vec<u8>, TransportError> {
        match method {
            "Name" => {
                let (name, error) = match self.build.name().await {
                    Ok(name) => (name, None),
                    Err(err) => (
                        String::new(),
                        Some(ErrorEnvelope::from_error(&err, ErrorKind::Callback)),
                    ),
                };
                encode_body(&NameReply { name, error })
            }
            "Progress" => {
                let args: MessageArgs = decode_body(body)?;
                let result = self.build.progress(&args.message).await;
                encode_body(&SinkReply {
                    error: ErrorEnvelope::wrap(&result, ErrorKind::Callback),
                })
            }
            other => Err(TransportError::UnknownMethod(format!("{BUILD_ENDPOINT}.{other}"))),
        }
    }
}

/// Host-side server object for a [`Ui`].
pub struct UiSkeleton {
    ui: Arc<dyn Ui>,
}

impl UiSkeleton {
    pub fn new(ui: Arc<dyn Ui>) -> Self {
        Self { ui }
    }
}

#[async_trait]
impl Service for UiSkeleton {
    async fn call(&self, method: &str, body: &[u8]) -> Result<Vec<u8>, TransportError> {
        let result = match method {
            "Say" => {
                let args: MessageArgs = decode_body(body)?;
                self.ui.say(&args.message).await
            }
            "Message" => {
                let args: MessageArgs = decode_body(body)?;
                self.ui.message(&args.message).await
            }
            "Error" => {
                let args: MessageArgs = decode_body(body)?;
                self.ui.error(&args.message).await
            }
            other => return Err(TransportError::UnknownMethod(format!("{UI_ENDPOINT}.{other}"))),
        };
        encode_body(&SinkReply {
            error: ErrorEnvelope::wrap(&result, ErrorKind::Callback),
        })
    }
}
