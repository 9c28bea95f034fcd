#![allow(missing_docs)]

//! Agentgate daemon entry point.
//!
//! `agentgate start` boots the full stack: config from the environment,
//! SQLite repository, tool registry, LLM client, gateway core, and the
//! WebSocket control plane. `agentgate check-config` validates the
//! environment and prints the effective settings without binding anything.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use agentgate::config::Config;
use agentgate::gateway::Gateway;
use agentgate::llm::{build_client, ResilientClient};
use agentgate::server;
use agentgate::store::Store;
use agentgate::logging;
use agentgate::tools::builtin::builtin_registry;

/// Repository pool size for the daemon.
const STORE_POOL_SIZE: u32 = 5;

#[derive(Debug, Parser)]
#[command(name = "agentgate", version, about = "Centralized agent gateway")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the gateway daemon (default).
    Start,
    /// Validate configuration and exit.
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Command::Start) {
        Command::Start => start().await,
        Command::CheckConfig => check_config(),
    }
}

async fn start() -> Result<()> {
    let config = Config::from_env().context("failed to load configuration")?;

    let logs_dir = config.data_dir.join("logs");
    let _logging_guard = logging::init_daemon(&logs_dir, &config.instance_id)
        .context("failed to initialise logging")?;

    info!(
        instance = %config.instance_id,
        host = %config.host,
        port = config.port,
        "agentgate starting"
    );

    std::fs::create_dir_all(&config.data_dir).with_context(|| {
        format!("failed to create data directory {}", config.data_dir.display())
    })?;
    let db_path = config.data_dir.join("agentgate.db");
    let store = Store::open(&db_path, STORE_POOL_SIZE)
        .await
        .context("failed to open repository")?;

    let registry = builtin_registry().context("failed to build tool registry")?;

    let llm = Arc::new(ResilientClient::new(
        build_client(&config.llm),
        Duration::from_secs(config.limits.llm_timeout_s),
        config.breaker,
    ));

    let host = config.host.clone();
    let port = config.port;
    let gateway = Gateway::new(config, store, registry, llm);
    gateway.bootstrap().await.context("bootstrap failed")?;

    server::serve(gateway, &host, port, shutdown_signal()).await?;

    info!("agentgate stopped");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}

fn check_config() -> Result<()> {
    let _logging_guard = logging::init_cli();
    let config = Config::from_env().context("configuration invalid")?;

    println!("instance_id   {}", config.instance_id);
    println!("bind          {}:{}", config.host, config.port);
    println!("data_dir      {}", config.data_dir.display());
    println!("principals    {}", config.principals.len());
    println!(
        "channels      {}",
        config
            .channels
            .iter()
            .map(|c| format!("{}:{}", c.channel_id, c.kind.as_str()))
            .collect::<Vec<_>>()
            .join(", ")
    );
    println!("llm           {} ({})", config.llm.provider, config.llm.model);
    println!(
        "limits        max_steps={} timeout={}s tool={}s approval={}s llm={}s",
        config.limits.max_steps,
        config.limits.timeout_s,
        config.limits.tool_timeout_s,
        config.limits.approval_timeout_s,
        config.limits.llm_timeout_s
    );
    println!(
        "rate          {} rps, burst {}",
        config.rate.rps, config.rate.burst
    );
    println!(
        "policy        {} allowlisted tool(s), approval_for_write={}",
        config.policy.tool_allowlist.len(),
        config.policy.require_approval_for_write
    );
    println!("ok");
    Ok(())
}
