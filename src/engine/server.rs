use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use anyhow::{Context, Result, bail};
use hmac::{Hmac, Mac};
use serde_json::{Value, json};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{InferenceEngine, SamplingParams, enforce_json_outputs};

type HmacSha256 = Hmac<Sha256>;

/// Compute the handshake response for a challenge under the shared key.
pub(crate) fn sign_challenge(authkey: &str, challenge: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(authkey.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(challenge.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

fn verify_auth(authkey: &str, challenge: &str, response: &str) -> bool {
    let expected = sign_challenge(authkey, challenge);
    expected.as_bytes().ct_eq(response.as_bytes()).into()
}

/// Long-lived server hosting inference engines for many client
/// processes. Speaks newline-delimited JSON over TCP behind an
/// HMAC-SHA256 challenge/response handshake on the shared key.
///
/// Engines must be registered before `serve` and are constructed in this
/// process: inference runtimes may spawn their own worker processes,
/// which cannot descend from a detached daemon child.
pub struct EngineServer {
    engines: RwLock<HashMap<String, Arc<dyn InferenceEngine>>>,
    authkey: String,
}

impl EngineServer {
    pub fn new(authkey: impl Into<String>) -> Self {
        Self {
            engines: RwLock::new(HashMap::new()),
            authkey: authkey.into(),
        }
    }

    /// Register an engine under its key. At most one engine per key: all
    /// clients asking for the same key share the same instance.
    pub fn register_engine(&self, key: impl Into<String>, engine: Arc<dyn InferenceEngine>) -> Result<()> {
        let key = key.into();
        let mut engines = self
            .engines
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if engines.contains_key(&key) {
            bail!("an engine with key '{}' is already registered", key);
        }
        info!("engine server: registered engine '{}'", key);
        engines.insert(key, engine);
        Ok(())
    }

    pub fn engine_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .engines
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    fn engine(&self, key: &str) -> Option<Arc<dyn InferenceEngine>> {
        self.engines
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Accept connections until the listener fails. Each connection gets
    /// its own task; a failed handshake closes the socket silently.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        info!(
            "engine server listening on {}",
            listener.local_addr().map_or_else(|_| "<unknown>".into(), |a| a.to_string())
        );
        loop {
            let (stream, peer) = listener.accept().await.context("accept failed")?;
            let server = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream).await {
                    debug!("engine connection from {} ended: {}", peer, e);
                }
            });
        }
    }

    async fn handle_connection(&self, stream: TcpStream) -> Result<()> {
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let mut line = String::new();

        // Challenge/response handshake before any request is served.
        let challenge = format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple());
        let hello = json!({ "challenge": challenge }).to_string();
        write_half.write_all(hello.as_bytes()).await?;
        write_half.write_all(b"\n").await?;

        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            bail!("client closed during handshake");
        }
        let auth: Value = serde_json::from_str(line.trim()).context("malformed auth frame")?;
        let response = auth.get("auth").and_then(Value::as_str).unwrap_or_default();
        if !verify_auth(&self.authkey, &challenge, response) {
            warn!("engine server: rejected client with bad auth key");
            bail!("authentication failed");
        }
        let ready = json!({ "ok": true, "server": "tooluniverse-engine", "version": crate::VERSION });
        write_half.write_all(ready.to_string().as_bytes()).await?;
        write_half.write_all(b"\n").await?;

        loop {
            line.clear();
            if reader.read_line(&mut line).await? == 0 {
                return Ok(());
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let reply = match serde_json::from_str::<Value>(trimmed) {
                Ok(request) => self.handle_request(request).await,
                Err(e) => json!({ "ok": false, "error": format!("malformed request: {}", e) }),
            };
            write_half.write_all(reply.to_string().as_bytes()).await?;
            write_half.write_all(b"\n").await?;
        }
    }

    async fn handle_request(&self, request: Value) -> Value {
        let op = request.get("op").and_then(Value::as_str).unwrap_or_default();
        match op {
            "list_engines" => json!({ "ok": true, "engines": self.engine_keys() }),
            "metadata" => match self.lookup(&request) {
                Ok(engine) => json!({ "ok": true, "metadata": engine.metadata() }),
                Err(e) => json!({ "ok": false, "error": e.to_string() }),
            },
            "generate" => match self.generate(&request).await {
                Ok(results) => json!({ "ok": true, "results": results }),
                Err(e) => json!({ "ok": false, "error": e.to_string() }),
            },
            other => json!({ "ok": false, "error": format!("unknown op '{}'", other) }),
        }
    }

    fn lookup(&self, request: &Value) -> Result<Arc<dyn InferenceEngine>> {
        let key = request
            .get("engine")
            .and_then(Value::as_str)
            .context("missing 'engine' key")?;
        self.engine(key)
            .with_context(|| format!("engine '{}' is not registered", key))
    }

    async fn generate(&self, request: &Value) -> Result<Vec<Option<String>>> {
        let engine = self.lookup(request)?;
        let prompts: Vec<String> = request
            .get("prompts")
            .map(|p| serde_json::from_value(p.clone()))
            .transpose()
            .context("'prompts' must be an array of strings")?
            .unwrap_or_default();
        let sampling: SamplingParams = request
            .get("sampling")
            .filter(|s| !s.is_null())
            .map(|s| serde_json::from_value(s.clone()))
            .transpose()
            .context("malformed 'sampling' object")?
            .unwrap_or_default();
        let return_json = request
            .get("return_json")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let json_schema = request.get("json_schema").filter(|s| !s.is_null());

        if return_json && json_schema.is_none() {
            warn!("generate: return_json without json_schema; relying on prompt-side guidance");
        }
        if return_json && json_schema.is_some() && !engine.supports_structured_output() {
            warn!(
                "generate: engine does not support structured output; falling back to prompt-only JSON guidance"
            );
        }

        let results = engine
            .generate(&prompts, &sampling, return_json, json_schema)
            .await?;
        Ok(if return_json {
            enforce_json_outputs(results)
        } else {
            results
        })
    }
}
