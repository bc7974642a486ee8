use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::warn;

use crate::config::Config;
use crate::dispatch::{FunctionCall, RunOptions};
use crate::engine::EngineServer;
use crate::finder::SearchMethod;
use crate::rpc::{self, RpcServer};
use crate::runtime::Runtime;

#[derive(Parser)]
#[command(
    name = "tooluniverse",
    version,
    about = "Tool dispatch runtime with caching, batching, and an MCP-compatible JSON-RPC surface"
)]
struct Cli {
    /// Optional JSON config file; environment variables still override.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory of catalog files (each *.json file is one category).
    #[arg(long, global = true)]
    catalog_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve JSON-RPC over stdio (default) or HTTP.
    Serve {
        /// Listen address for the HTTP transport, e.g. 127.0.0.1:8300.
        /// Omit to serve newline-delimited JSON-RPC on stdio.
        #[arg(long)]
        http: Option<SocketAddr>,

        /// Server name reported in the initialize handshake.
        #[arg(long, default_value = "tooluniverse")]
        name: String,
    },

    /// List registered tool names.
    ListTools {
        /// Restrict the listing to one catalog category.
        #[arg(long)]
        category: Option<String>,
    },

    /// Search tools by free text.
    Find {
        query: String,

        /// Search strategy: auto, keyword, embedding, or llm.
        #[arg(long, default_value = "auto")]
        method: String,

        #[arg(long, default_value_t = 10)]
        limit: usize,
    },

    /// Run a single tool call and print the result.
    Call {
        name: String,

        /// Arguments as a JSON object.
        #[arg(long, default_value = "{}")]
        arguments: String,

        #[arg(long)]
        no_cache: bool,

        #[arg(long)]
        no_validate: bool,
    },

    /// Inspect or flush the result cache.
    Cache {
        #[command(subcommand)]
        command: CacheCommand,
    },

    /// Host the remote-engine registry for co-located client processes.
    /// Engines must be constructed and registered in this process, so the
    /// server runs in the foreground rather than forking a daemon child.
    EngineServe {
        /// Listen address, e.g. 127.0.0.1:5317.
        #[arg(long)]
        listen: SocketAddr,

        /// Shared key clients must present; falls back to the configured
        /// TOOLUNIVERSE_ENGINE_AUTHKEY.
        #[arg(long)]
        authkey: Option<String>,
    },
}

#[derive(Subcommand)]
enum CacheCommand {
    /// Print cache statistics.
    Stats,
    /// Print all live persistent entries.
    Dump,
    /// Flush entries, optionally scoped to one tool namespace.
    Clear {
        #[arg(long)]
        namespace: Option<String>,
    },
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::from_env(),
    };
    let runtime = Runtime::connect(config).await?;
    if let Some(dir) = &cli.catalog_dir {
        let added = runtime.registry().add_catalog_dir(dir)?;
        if added == 0 {
            warn!("no catalog files found in {}", dir.display());
        }
    }

    let result = execute(&cli.command, &runtime).await;
    runtime.close();
    result
}

async fn execute(command: &Command, runtime: &Arc<Runtime>) -> Result<()> {
    match command {
        Command::Serve { http, name } => {
            let server = Arc::new(RpcServer::new(
                Arc::clone(runtime.dispatcher()),
                Arc::clone(runtime.finder()),
                name.clone(),
            ));
            match http {
                Some(addr) => rpc::http::serve(server, *addr).await?,
                None => rpc::stdio::serve(server).await?,
            }
        }
        Command::ListTools { category } => {
            for name in runtime.registry().list_names(category.as_deref()) {
                println!("{}", name);
            }
        }
        Command::Find {
            query,
            method,
            limit,
        } => {
            let method = SearchMethod::parse(method).unwrap_or_else(|| {
                warn!("unknown search method '{}'; using keyword", method);
                SearchMethod::Keyword
            });
            let matches = runtime.find(query, method, *limit).await?;
            println!("{}", serde_json::to_string_pretty(&matches)?);
        }
        Command::Call {
            name,
            arguments,
            no_cache,
            no_validate,
        } => {
            let arguments: Value =
                serde_json::from_str(arguments).context("arguments must be a JSON object")?;
            let opts = RunOptions {
                use_cache: !no_cache,
                validate: !no_validate,
                ..RunOptions::standard()
            };
            let result = runtime
                .dispatcher()
                .run_one(&FunctionCall::new(name.clone(), arguments), &opts)
                .await;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Command::Cache { command } => match command {
            CacheCommand::Stats => {
                println!("{}", serde_json::to_string_pretty(&runtime.cache().stats())?);
            }
            CacheCommand::Dump => {
                for entry in runtime.cache().dump() {
                    println!("{}", serde_json::to_string(&entry)?);
                }
            }
            CacheCommand::Clear { namespace } => {
                runtime.cache().clear(namespace.as_deref());
                println!("cache cleared");
            }
        },
        Command::EngineServe { listen, authkey } => {
            let authkey = authkey
                .clone()
                .or_else(|| runtime.config().engine.authkey.clone())
                .unwrap_or_default();
            if authkey.is_empty() {
                warn!("engine server starting without a shared key; any client can connect");
            }
            let server = Arc::new(EngineServer::new(authkey));
            let listener = tokio::net::TcpListener::bind(listen)
                .await
                .with_context(|| format!("failed to bind engine server on {}", listen))?;
            server.serve(listener).await?;
        }
    }
    Ok(())
}
