use std::sync::Arc;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tracing::debug;

use super::server::sign_challenge;
use super::{RemoteModel, SamplingParams};

struct Channel {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Channel {
    async fn roundtrip(&mut self, request: &Value) -> Result<Value> {
        self.writer.write_all(request.to_string().as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        let mut line = String::new();
        if self.reader.read_line(&mut line).await? == 0 {
            bail!("engine server closed the connection");
        }
        let reply: Value =
            serde_json::from_str(line.trim()).context("malformed engine server reply")?;
        if reply.get("ok").and_then(Value::as_bool) != Some(true) {
            bail!(
                "engine server error: {}",
                reply
                    .get("error")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
            );
        }
        Ok(reply)
    }
}

/// Client side of the remote-engine protocol: connects with the shared
/// key, then issues requests over one serialized channel. Obtain per-key
/// proxies through [`EngineClient::get_engine`].
pub struct EngineClient {
    channel: tokio::sync::Mutex<Channel>,
}

impl EngineClient {
    /// Connect and authenticate against `host:port`.
    pub async fn connect(address: &str, authkey: &str) -> Result<Self> {
        let stream = TcpStream::connect(address)
            .await
            .with_context(|| format!("failed to connect to engine server at {}", address))?;
        let (read_half, mut writer) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            bail!("engine server closed before handshake");
        }
        let hello: Value =
            serde_json::from_str(line.trim()).context("malformed handshake frame")?;
        let challenge = hello
            .get("challenge")
            .and_then(Value::as_str)
            .context("handshake frame missing challenge")?;

        let auth = json!({ "auth": sign_challenge(authkey, challenge) });
        writer.write_all(auth.to_string().as_bytes()).await?;
        writer.write_all(b"\n").await?;

        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            bail!("engine server rejected the auth key");
        }
        let ready: Value = serde_json::from_str(line.trim()).context("malformed ready frame")?;
        if ready.get("ok").and_then(Value::as_bool) != Some(true) {
            bail!("engine server refused the handshake");
        }
        debug!("connected to engine server at {}", address);

        Ok(Self {
            channel: tokio::sync::Mutex::new(Channel { reader, writer }),
        })
    }

    async fn request(&self, request: Value) -> Result<Value> {
        let mut channel = self.channel.lock().await;
        channel.roundtrip(&request).await
    }

    pub async fn list_engines(&self) -> Result<Vec<String>> {
        let reply = self.request(json!({ "op": "list_engines" })).await?;
        Ok(serde_json::from_value(
            reply.get("engines").cloned().unwrap_or_default(),
        )?)
    }

    /// Resolve a proxy for the engine under `key`, verifying it exists.
    pub async fn get_engine(self: &Arc<Self>, key: &str) -> Result<EngineProxy> {
        let reply = self
            .request(json!({ "op": "metadata", "engine": key }))
            .await?;
        debug!(
            "resolved engine '{}': {}",
            key,
            reply.get("metadata").cloned().unwrap_or(serde_json::Value::Null)
        );
        Ok(EngineProxy {
            client: Arc::clone(self),
            key: key.to_string(),
        })
    }
}

/// Handle to one hosted engine. All proxies for the same key share the
/// single engine instance living in the server process.
pub struct EngineProxy {
    client: Arc<EngineClient>,
    key: String,
}

impl EngineProxy {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn metadata(&self) -> Result<Value> {
        let reply = self
            .client
            .request(json!({ "op": "metadata", "engine": self.key }))
            .await?;
        Ok(reply.get("metadata").cloned().unwrap_or(Value::Null))
    }
}

#[async_trait]
impl RemoteModel for EngineProxy {
    async fn generate(
        &self,
        prompts: &[String],
        sampling: &SamplingParams,
        return_json: bool,
        json_schema: Option<&Value>,
    ) -> Result<Vec<Option<String>>> {
        let reply = self
            .client
            .request(json!({
                "op": "generate",
                "engine": self.key,
                "prompts": prompts,
                "sampling": sampling,
                "return_json": return_json,
                "json_schema": json_schema,
            }))
            .await?;
        Ok(serde_json::from_value(
            reply.get("results").cloned().unwrap_or_default(),
        )?)
    }
}
