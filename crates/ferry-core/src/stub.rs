use std::sync::Arc;

use ferry_plugin_sdk::Mode;
use serde::{de::DeserializeOwned, Serialize};

use crate::{
    codec::{self, Codec},
    envelope::ErrorEnvelope,
    error::{BridgeError, TransportError},
    rpc::{
        frame::{decode_body, encode_body},
        Empty, RpcClient,
    },
};

/// Reply structs that may carry a domain error.
pub(crate) trait Reply: DeserializeOwned {
    fn take_error(&mut self) -> Option<ErrorEnvelope> {
        None
    }
}

impl Reply for Empty {}

/// Host-side handle on one named endpoint of a shared connection.
#[derive(Clone)]
pub(crate) struct RemoteEndpoint {
    client: Arc<RpcClient>,
    name: String,
    mode: Mode,
}

impl RemoteEndpoint {
    pub(crate) fn new(client: Arc<RpcClient>, name: impl Into<String>, mode: Mode) -> Self {
        Self {
            client,
            name: name.into(),
            mode,
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn mode(&self) -> Mode {
        self.mode
    }

    pub(crate) fn codec(&self) -> &'static dyn Codec {
        codec::for_mode(self.mode)
    }

    /// Calls `<endpoint>.<method>`. An envelope in the reply wins over a
    /// transport error reported alongside it. Nothing is retried.
    pub(crate) async fn invoke<A, R>(&self, method: &str, args: &A) -> Result<R, BridgeError>
    where
        A: Serialize + Sync,
        R: Reply,
    {
        let method = format!("{}.{}", self.name, method);
        let body = encode_body(args).map_err(|err| BridgeError::transport(&method, err))?;
        let frame = self
            .client
            .call_raw(&method, body)
            .await
            .map_err(|err| BridgeError::transport(&method, err))?;

        match (decode_body::<R>(&frame.body), frame.error) {
            (Ok(mut reply), error) => {
                if let Some(envelope) = reply.take_error() {
                    return Err(envelope.into_error().into());
                }
                match error {
                    Some(message) => Err(BridgeError::transport(
                        &method,
                        TransportError::ServerError(message),
                    )),
                    None => Ok(reply),
                }
            }
            (Err(_), Some(message)) => Err(BridgeError::transport(
                &method,
                TransportError::ServerError(message),
            )),
            (Err(err), None) => Err(BridgeError::transport(&method, err)),
        }
    }
}
