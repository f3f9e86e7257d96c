use std::sync::Arc;

use async_trait::async_trait;
use ferry_plugin_sdk::{Datasource, Mode, ObjectSpec, Value};
use serde::{Deserialize, Serialize};

use crate::{
    cancel::CancelTrigger,
    codec::{self, Codec},
    envelope::{ErrorEnvelope, ErrorKind},
    error::{BridgeError, TransportError},
    rpc::{
        frame::{decode_body, encode_body},
        Empty, RpcClient, Service,
    },
    stub::{RemoteEndpoint, Reply},
};

pub const CANCELLED_MESSAGE: &str = "execution cancelled";

#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigureArgs {
    pub configs: Vec<Vec<u8>>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConfigureReply {
    pub error: Option<ErrorEnvelope>,
}

impl Reply for ConfigureReply {
    fn take_error(&mut self) -> Option<ErrorEnvelope> {
        self.error.take()
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct OutputSpecReply {
    pub output_spec: Vec<u8>,
}

impl Reply for OutputSpecReply {}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ExecuteReply {
    pub value: Vec<u8>,
    pub error: Option<ErrorEnvelope>,
}

impl Reply for ExecuteReply {
    fn take_error(&mut self) -> Option<ErrorEnvelope> {
        self.error.take()
    }
}

/// Host-side [`Datasource`] forwarding every call to a plugin.
pub struct DatasourceStub {
    endpoint: RemoteEndpoint,
}

impl DatasourceStub {
    pub fn new(client: Arc<RpcClient>, endpoint: impl Into<String>, mode: Mode) -> Self {
        Self {
            endpoint: RemoteEndpoint::new(client, endpoint, mode),
        }
    }

    pub fn endpoint(&self) -> &str {
        self.endpoint.name()
    }

    pub fn mode(&self) -> Mode {
        self.endpoint.mode()
    }

    /// Fallible form of [`Datasource::output_spec`].
    pub async fn try_output_spec(&self) -> Result<ObjectSpec, BridgeError> {
        let reply: OutputSpecReply = self.endpoint.invoke("OutputSpec", &Empty).await?;
        Ok(self.endpoint.codec().decode_spec(&reply.output_spec)?)
    }
}

#[async_trait]
impl Datasource for DatasourceStub {
    async fn configure(&self, configs: Vec<Value>) -> anyhow::Result<()> {
        let codec = self.endpoint.codec();
        let configs = configs
            .iter()
            .enumerate()
            .map(|(index, value)| {
                codec
                    .encode_value(value)
                    .map_err(|source| BridgeError::Configuration { index, source })
            })
            .collect::<Result<Vec<_>, _>>()?;
        tracing::debug!(
            endpoint = self.endpoint.name(),
            count = configs.len(),
            "sending Configure as {}",
            codec.name()
        );
        let _: ConfigureReply = self
            .endpoint
            .invoke("Configure", &ConfigureArgs { configs })
            .await?;
        Ok(())
    }

    /// Panics when the plugin's schema can't be fetched or decoded; use
    /// [`DatasourceStub::try_output_spec`] to handle that case.
    async fn output_spec(&self) -> ObjectSpec {
        match self.try_output_spec().await {
            Ok(spec) => spec,
            Err(err) => panic!(
                "{}.OutputSpec returned an undecodable schema: {err}",
                self.endpoint.name()
            ),
        }
    }

    async fn execute(&self) -> anyhow::Result<Value> {
        let reply: ExecuteReply = self.endpoint.invoke("Execute", &Empty).await?;
        let value = self
            .endpoint
            .codec()
            .decode_result(&reply.value)
            .map_err(BridgeError::from)?;
        Ok(value)
    }

    async fn cancel(&self) {
        if let Err(err) = self.endpoint.invoke::<_, Empty>("Cancel", &Empty).await {
            tracing::warn!(endpoint = self.endpoint.name(), error = %err, "cancel was not delivered");
        }
    }
}

/// Plugin-side server object for a [`Datasource`].
pub struct DatasourceSkeleton {
    datasource: Arc<dyn Datasource>,
    mode: Mode,
    trigger: CancelTrigger,
}

impl DatasourceSkeleton {
    pub fn new(datasource: Arc<dyn Datasource>, mode: Mode) -> Self {
        Self {
            datasource,
            mode,
            trigger: CancelTrigger::new(),
        }
    }

    fn codec(&self) -> &'static dyn Codec {
        codec::for_mode(self.mode)
    }

    async fn configure(&self, args: ConfigureArgs) -> ConfigureReply {
        let codec = self.codec();
        let decoded = args
            .configs
            .iter()
            .map(|raw| codec.decode_value(raw))
            .collect::<Result<Vec<_>, _>>();
        let configs = match decoded {
            Ok(configs) => configs,
            Err(err) => {
                return ConfigureReply {
                    error: Some(ErrorEnvelope::new(err.to_string(), Some(ErrorKind::Configuration))),
                }
            }
        };
        let result = self.datasource.configure(configs).await;
        ConfigureReply {
            error: ErrorEnvelope::wrap(&result, ErrorKind::Configuration),
        }
    }

    async fn execute(&self) -> ExecuteReply {
        let armed = self.trigger.arm();
        let result = tokio::select! {
            result = self.datasource.execute() => result,
            _ = armed.cancelled() => {
                tracing::debug!("execute interrupted by cancel");
                return ExecuteReply {
                    value: Vec::new(),
                    error: Some(ErrorEnvelope::new(CANCELLED_MESSAGE, Some(ErrorKind::Cancelled))),
                };
            }
        };
        drop(armed);

        let codec = self.codec();
        match result {
            Ok(value) => match codec.encode_result(&value) {
                Ok(value) => {
                    tracing::debug!("sending Execute as {}", codec.name());
                    ExecuteReply { value, error: None }
                }
                Err(err) => ExecuteReply {
                    value: Vec::new(),
                    error: Some(ErrorEnvelope::new(err.to_string(), Some(ErrorKind::Encoding))),
                },
            },
            Err(err) => ExecuteReply {
                value: Vec::new(),
                error: Some(ErrorEnvelope::from_error(&err, ErrorKind::Execution)),
            },
        }
    }
}

#[async_trait]
impl Service for DatasourceSkeleton {
    async fn call(&self, method: &str, body: &[u8]) -> Result<Vec<u8>, TransportError> {
        match method {
            "Configure" => encode_body(&self.configure(decode_body(body)?).await),
            "OutputSpec" => {
                let spec = self.datasource.output_spec().await;
                let codec = self.codec();
                let output_spec = codec.encode_spec(&spec)?;
                tracing::debug!("sending OutputSpec as {}", codec.name());
                encode_body(&OutputSpecReply { output_spec })
            }
            "Execute" => encode_body(&self.execute().await),
            "Cancel" => {
                if self.trigger.fire() {
                    tracing::debug!("cancel delivered to running execute");
                }
                self.datasource.cancel().await;
                encode_body(&Empty)
            }
            other => Err(TransportError::UnknownMethod(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use ferry_plugin_sdk::Type;
    use parking_lot::Mutex;
    use tokio::sync::Notify;

    use super::*;
    use crate::{
        envelope::RemoteError,
        rpc::{Registry, ServerHandle},
    };

    /// Answers OutputSpec with bytes no codec can read.
    struct Garbled;

    #[async_trait]
    impl Service for Garbled {
        async fn call(&self, _method: &str, _body: &[u8]) -> Result<Vec<u8>, TransportError> {
            encode_body(&OutputSpecReply {
                output_spec: vec![0xff, 0x00, 0x13],
            })
        }
    }

    async fn garbled() -> (ServerHandle, DatasourceStub) {
        let mut registry = Registry::new();
        registry.register("Datasource", Garbled).unwrap();
        let handle = ServerHandle::spawn("127.0.0.1:0".parse().unwrap(), registry)
            .await
            .unwrap();
        let client = Arc::new(RpcClient::connect(handle.local_addr()).await.unwrap());
        (handle, DatasourceStub::new(client, "Datasource", Mode::Current))
    }

    #[derive(Default)]
    struct Fake {
        configs: Mutex<Vec<Value>>,
        fail_execute: bool,
        block: bool,
        started: Notify,
        cancels: Mutex<usize>,
        configure_calls: Mutex<usize>,
    }

    #[async_trait]
    impl Datasource for Fake {
        async fn configure(&self, configs: Vec<Value>) -> anyhow::Result<()> {
            *self.configure_calls.lock() += 1;
            if configs.iter().any(|c| c.get("name").is_none()) {
                anyhow::bail!("missing field: name");
            }
            *self.configs.lock() = configs;
            Ok(())
        }

        async fn output_spec(&self) -> ObjectSpec {
            ObjectSpec::new().attr("value", Type::String, true)
        }

        async fn execute(&self) -> anyhow::Result<Value> {
            if self.fail_execute {
                anyhow::bail!("upstream returned 503");
            }
            if self.block {
                self.started.notify_one();
                std::future::pending::<()>().await;
            }
            let name = self.configs.lock().first().and_then(|c| c.get("name").cloned());
            Ok(match name.as_ref().and_then(Value::as_str) {
                Some("foo") => Value::from("bar"),
                _ => Value::Null,
            })
        }

        async fn cancel(&self) {
            *self.cancels.lock() += 1;
        }
    }

    async fn serve(fake: Arc<Fake>, mode: Mode) -> (ServerHandle, DatasourceStub) {
        let mut registry = Registry::new();
        registry
            .register("Datasource", DatasourceSkeleton::new(fake, mode))
            .unwrap();
        let handle = ServerHandle::spawn("127.0.0.1:0".parse().unwrap(), registry)
            .await
            .unwrap();
        let client = Arc::new(RpcClient::connect(handle.local_addr()).await.unwrap());
        (handle, DatasourceStub::new(client, "Datasource", mode))
    }

    #[tokio::test]
    async fn configure_then_execute_returns_result_in_both_modes() {
        crate::codec::register_builtin_types();
        for mode in [Mode::Legacy, Mode::Current] {
            let (_handle, stub) = serve(Arc::new(Fake::default()), mode).await;
            stub.configure(vec![Value::object([("name", Value::from("foo"))])])
                .await
                .unwrap();
            assert_eq!(stub.execute().await.unwrap(), Value::from("bar"), "{mode}");
        }
    }

    #[tokio::test]
    async fn configure_error_message_is_preserved() {
        let (_handle, stub) = serve(Arc::new(Fake::default()), Mode::Current).await;
        let err = stub
            .configure(vec![Value::object([("other", Value::from("x"))])])
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "missing field: name");
        let remote = err.downcast_ref::<BridgeError>().unwrap();
        assert!(!remote.is_transport());
    }

    #[tokio::test]
    async fn execute_error_message_is_preserved() {
        let fake = Arc::new(Fake {
            fail_execute: true,
            ..Fake::default()
        });
        let (_handle, stub) = serve(fake, Mode::Current).await;
        let err = stub.execute().await.unwrap_err();
        assert_eq!(err.to_string(), "upstream returned 503");
    }

    #[tokio::test]
    async fn output_spec_uses_the_spec_path() {
        for mode in [Mode::Legacy, Mode::Current] {
            let (_handle, stub) = serve(Arc::new(Fake::default()), mode).await;
            let spec = stub.output_spec().await;
            assert_eq!(spec, ObjectSpec::new().attr("value", Type::String, true));
        }
    }

    #[tokio::test]
    async fn cancel_interrupts_running_execute() {
        let fake = Arc::new(Fake {
            block: true,
            ..Fake::default()
        });
        let (_handle, stub) = serve(fake.clone(), Mode::Current).await;
        let stub = Arc::new(stub);

        let running = {
            let stub = stub.clone();
            tokio::spawn(async move { stub.execute().await })
        };
        fake.started.notified().await;
        stub.cancel().await;
        stub.cancel().await;

        let err = tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        let remote = err
            .downcast_ref::<BridgeError>()
            .and_then(|err| match err {
                BridgeError::Remote(remote) => Some(remote.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(remote.message(), CANCELLED_MESSAGE);
        assert_eq!(remote.kind(), Some(ErrorKind::Cancelled));
        assert_eq!(*fake.cancels.lock(), 2);
    }

    #[tokio::test]
    async fn cancel_without_execute_is_a_no_op() {
        let fake = Arc::new(Fake::default());
        let (_handle, stub) = serve(fake.clone(), Mode::Legacy).await;
        stub.cancel().await;
        stub.configure(vec![Value::object([("name", Value::from("foo"))])])
            .await
            .unwrap();
        assert_eq!(stub.execute().await.unwrap(), Value::from("bar"));
        stub.cancel().await;
        assert_eq!(*fake.cancels.lock(), 2);
    }

    #[tokio::test]
    async fn transport_failure_names_the_method() {
        let (handle, stub) = serve(Arc::new(Fake::default()), Mode::Current).await;
        handle.shutdown().await.unwrap();
        let err = stub.execute().await.unwrap_err();
        assert!(err.to_string().starts_with("Datasource.Execute failed"), "{err}");
        assert!(err.downcast_ref::<RemoteError>().is_none());
    }

    #[tokio::test]
    async fn undecodable_output_spec_is_an_error() {
        let (_handle, stub) = garbled().await;
        let err = stub.try_output_spec().await.unwrap_err();
        assert!(matches!(err, BridgeError::Codec(_)), "{err}");
    }

    #[tokio::test]
    #[should_panic(expected = "Datasource.OutputSpec returned an undecodable schema")]
    async fn undecodable_output_spec_panics_through_the_trait() {
        let (_handle, stub) = garbled().await;
        let _ = stub.output_spec().await;
    }

    #[tokio::test]
    async fn undecodable_configuration_never_reaches_the_implementation() {
        let fake = Arc::new(Fake::default());
        let (handle, _stub) = serve(fake.clone(), Mode::Current).await;
        let client = Arc::new(RpcClient::connect(handle.local_addr()).await.unwrap());
        let endpoint = RemoteEndpoint::new(client, "Datasource", Mode::Current);

        let args = ConfigureArgs {
            configs: vec![vec![0xff, 0x00, 0x13]],
        };
        let err = endpoint
            .invoke::<_, ConfigureReply>("Configure", &args)
            .await
            .unwrap_err();
        match err {
            BridgeError::Remote(remote) => {
                assert_eq!(remote.kind(), Some(ErrorKind::Configuration))
            }
            other => panic!("expected a remote configuration error, got {other}"),
        }
        assert_eq!(*fake.configure_calls.lock(), 0);
    }
}
