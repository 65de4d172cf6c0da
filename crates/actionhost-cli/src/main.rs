// Copyright 2025 Actionhost Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! # Actionhost CLI Entry Point
//!
//! ## Usage
//!
//! ```bash
//! # Serve actions from a local store
//! actionhost serve -b 0.0.0.0:5995 --store http://127.0.0.1:5984
//!
//! # Call an action (outputs raw JSON)
//! actionhost call http://127.0.0.1:5995/db1/report
//! actionhost call http://127.0.0.1:5995/db1/report -a '{"year": 2024}'
//! ```
//!
//! The store URL falls back to `ACTIONHOST_STORE_URL`, then to
//! `http://127.0.0.1:5984`.

use std::io::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use actionhost_cli::call::{call_action, validate_http_url, CallOutput};
use actionhost_client::HttpStore;
use actionhost_server::{CacheConfig, Dispatcher, HttpServer, ResourceLimits, ServerConfig};
use anyhow::Result;
use argh::FromArgs;

const STORE_URL_ENV: &str = "ACTIONHOST_STORE_URL";
const DEFAULT_STORE_URL: &str = "http://127.0.0.1:5984";

#[derive(FromArgs)]
/// Actionhost - multi-tenant action execution engine
struct Cli {
    #[argh(subcommand)]
    command: Commands,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Commands {
    Serve(ServeArgs),
    Call(CallArgs),
}

/// Arguments for the HTTP front.
#[derive(FromArgs)]
#[argh(subcommand, name = "serve")]
/// serve tenant actions over HTTP
struct ServeArgs {
    /// address to bind the HTTP server to
    #[argh(option, short = 'b', default = "\"127.0.0.1:5995\".into()")]
    bind: String,

    /// base URL of the document store
    ///
    /// Defaults to the ACTIONHOST_STORE_URL environment variable, then to
    /// http://127.0.0.1:5984.
    #[argh(option, short = 's')]
    store: Option<String>,

    /// concurrent store calls allowed per request
    #[argh(option, long = "pool-size", default = "10")]
    pool_size: usize,

    /// wall-clock budget for one action in milliseconds
    #[argh(option, long = "max-execution-time-ms", default = "30000")]
    max_execution_time_ms: u64,

    /// deadline for one store call in milliseconds
    #[argh(option, long = "store-timeout-ms", default = "10000")]
    store_timeout_ms: u64,

    /// iterations any single loop may run
    #[argh(option, long = "loop-limit", default = "10_000_000")]
    loop_limit: u64,

    /// maximum call depth of tenant code
    #[argh(option, long = "recursion-limit", default = "512")]
    recursion_limit: usize,

    /// largest accepted request body in bytes
    #[argh(option, long = "max-body-bytes", default = "10 * 1024 * 1024")]
    max_body_bytes: usize,

    /// bundles kept in the document cache
    #[argh(option, long = "cache-size", default = "1024")]
    cache_size: usize,

    /// seconds an unused bundle stays cached
    #[argh(option, long = "cache-ttl-secs", default = "3600")]
    cache_ttl_secs: u64,
}

/// Arguments for a single action call.
///
/// Outputs raw JSON to stdout, or the raw bytes of a download. Errors go to
/// stderr with a non-zero exit code.
#[derive(FromArgs)]
#[argh(subcommand, name = "call")]
/// call one action
struct CallArgs {
    /// full URL of the action, e.g. http://127.0.0.1:5995/db1/report
    #[argh(positional)]
    url: String,

    /// JSON body; when given the call is a POST
    #[argh(option, short = 'a', long = "args")]
    args: Option<String>,
}

impl ServeArgs {
    fn store_url(&self) -> String {
        self.store
            .clone()
            .or_else(|| std::env::var(STORE_URL_ENV).ok())
            .unwrap_or_else(|| DEFAULT_STORE_URL.to_string())
    }

    fn server_config(&self) -> ServerConfig {
        let limits = ResourceLimits::new()
            .with_execution_timeout(Duration::from_millis(self.max_execution_time_ms))
            .with_store_call_timeout(Duration::from_millis(self.store_timeout_ms))
            .with_loop_iteration_limit(self.loop_limit)
            .with_recursion_limit(self.recursion_limit);

        ServerConfig::new()
            .with_pool_size(self.pool_size)
            .with_max_body_bytes(self.max_body_bytes)
            .with_limits(limits)
            .with_cache(CacheConfig {
                max_bundles: self.cache_size,
                idle_ttl: Duration::from_secs(self.cache_ttl_secs),
            })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    // call keeps stdout clean for piping
    if !matches!(cli.command, Commands::Call(_)) {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    match cli.command {
        Commands::Serve(args) => run_serve(args).await,
        Commands::Call(args) => run_call(args).await,
    }
}

async fn run_serve(args: ServeArgs) -> Result<()> {
    let store_url = args.store_url();
    validate_http_url(&store_url, "store URL")?;
    tracing::info!("Using document store at {}", store_url);

    let config = args.server_config();
    tracing::info!(
        "Maximum execution time: {}ms, store calls: {}ms",
        args.max_execution_time_ms,
        args.store_timeout_ms
    );

    let store = Arc::new(HttpStore::new(&store_url)?);
    let dispatcher = Arc::new(Dispatcher::new(store, config)?);

    let addr: SocketAddr = args
        .bind
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid bind address {}: {}", args.bind, e))?;
    HttpServer::new(dispatcher).run(addr).await?;

    Ok(())
}

async fn run_call(args: CallArgs) -> Result<()> {
    let body = args
        .args
        .as_deref()
        .map(serde_json::from_str::<serde_json::Value>)
        .transpose()
        .map_err(|e| anyhow::anyhow!("Invalid JSON in args: {}", e))?;

    let client = reqwest::Client::new();
    match call_action(&client, &args.url, body.as_ref()).await? {
        CallOutput::Json(value) => println!("{}", serde_json::to_string(&value)?),
        CallOutput::Download(bytes) => std::io::stdout().write_all(&bytes)?,
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_serve_defaults() {
        let args: Cli = Cli::from_args(&["actionhost"], &["serve"]).unwrap();
        match args.command {
            Commands::Serve(args) => {
                assert_eq!(args.bind, "127.0.0.1:5995");
                assert!(args.store.is_none());
                assert_eq!(args.pool_size, 10);
                assert_eq!(args.max_execution_time_ms, 30000);
                assert_eq!(args.loop_limit, 10_000_000);
                assert_eq!(args.server_config(), ServerConfig::default());
            }
            _ => panic!("Expected Serve command"),
        }
    }

    #[test]
    fn test_cli_parse_serve_options() {
        let args: Cli = Cli::from_args(
            &["actionhost"],
            &[
                "serve",
                "-b", "0.0.0.0:8000",
                "--store", "http://db:5984",
                "--pool-size", "4",
                "--max-execution-time-ms", "500",
            ],
        )
        .unwrap();
        match args.command {
            Commands::Serve(args) => {
                assert_eq!(args.store_url(), "http://db:5984");
                let config = args.server_config();
                assert_eq!(config.pool_size, 4);
                assert_eq!(config.limits.execution_timeout, Duration::from_millis(500));
                assert!(config.validate().is_ok());
            }
            _ => panic!("Expected Serve command"),
        }
    }

    #[test]
    fn test_cli_parse_call() {
        let args: Cli = Cli::from_args(
            &["actionhost"],
            &["call", "http://127.0.0.1:5995/db1/act", "-a", "{\"x\": 1}"],
        )
        .unwrap();
        match args.command {
            Commands::Call(CallArgs { url, args }) => {
                assert_eq!(url, "http://127.0.0.1:5995/db1/act");
                assert_eq!(args.as_deref(), Some("{\"x\": 1}"));
            }
            _ => panic!("Expected Call command"),
        }
    }

    #[test]
    fn test_cli_parse_call_requires_url() {
        assert!(Cli::from_args(&["actionhost"], &["call"]).is_err());
    }
}
