//! skillctl - CLI client for skilld
//!
//! Publishes skill manager commands on the daemon bus and renders replies.

mod client;
mod render;

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use clap::{Parser, Subcommand};
use client::{Client, ClientError};
use serde_json::{json, Value};
use skill_core::messages::{Command as BusCommand, PassFinishedPayload, StatusEvent};

/// CLI client for the skilld skill manager daemon.
#[derive(Parser)]
#[command(name = "skillctl")]
#[command(about = "Control the skilld skill manager")]
#[command(version)]
struct Cli {
    /// Daemon address (default: http://127.0.0.1:7710)
    #[arg(long, global = true, env = "SKILLD_ADDR")]
    addr: Option<String>,

    /// Auth token for daemon API
    #[arg(long, global = true, env = "SKILLD_TOKEN")]
    token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Request a reconciliation pass now
    Update {
        /// Wait for the pass to finish and print its report
        #[arg(long)]
        wait: bool,
    },

    /// List known skills
    List,

    /// Reactivate a skill (or "all")
    Activate {
        /// Skill id, or "all"
        skill: String,
    },

    /// Deactivate a skill until restart
    Deactivate {
        /// Skill id
        skill: String,
    },

    /// Keep a skill installed even if blacklisted
    Keep {
        /// Skill id
        skill: String,
    },

    /// Stream bus messages
    Watch {
        /// Only show messages whose type starts with this prefix
        #[arg(long)]
        prefix: Option<String>,
    },

    /// Show scheduler state and the last pass
    Status,

    /// Publish an arbitrary bus message
    Publish {
        /// Message type, e.g. skillmanager.list
        event: String,

        /// JSON data
        data: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let addr = cli
        .addr
        .unwrap_or_else(|| "http://127.0.0.1:7710".to_string());
    let client = Client::new(&addr, cli.token.as_deref());

    if let Err(e) = client.wait_for_ready().await {
        eprintln!("error: {e}");
        std::process::exit(1);
    }

    let result = match cli.command {
        Command::Update { wait } => run_update(&client, wait).await,
        Command::List => run_list(&client).await,
        Command::Activate { skill } => publish_target(&client, BusCommand::Activate, &skill).await,
        Command::Deactivate { skill } => {
            publish_target(&client, BusCommand::Deactivate, &skill).await
        }
        Command::Keep { skill } => publish_target(&client, BusCommand::Keep, &skill).await,
        Command::Watch { prefix } => run_watch(&client, prefix.as_deref()).await,
        Command::Status => run_status(&client).await,
        Command::Publish { event, data } => run_publish(&client, &event, data.as_deref()).await,
    };

    if let Err(e) = result {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

async fn run_update(client: &Client, wait: bool) -> Result<(), ClientError> {
    if !wait {
        client.publish(BusCommand::Update.as_str(), None).await?;
        println!("Update requested.");
        return Ok(());
    }

    // Subscribe first so the result cannot be missed.
    let mut events = client.events(Some("skillmanager.pass.")).await?;
    client.publish(BusCommand::Update.as_str(), None).await?;
    println!("Update requested, waiting for pass...");

    while let Some(msg) = events.next_message().await? {
        let finished = msg.msg_type == StatusEvent::PassCompleted.as_str()
            || msg.msg_type == StatusEvent::PassFailed.as_str();
        if !finished {
            continue;
        }
        let payload: PassFinishedPayload = msg
            .payload()
            .map_err(|e| ClientError::InvalidResponse(e.to_string()))?;
        println!();
        render::print_report(&payload.report);
        return Ok(());
    }
    Err(ClientError::StreamClosed)
}

async fn run_list(client: &Client) -> Result<(), ClientError> {
    let list = client.skills().await?;
    render::print_skill_list(&list);
    Ok(())
}

async fn publish_target(
    client: &Client,
    command: BusCommand,
    skill: &str,
) -> Result<(), ClientError> {
    client
        .publish(command.as_str(), Some(&json!({ "skill": skill })))
        .await?;
    println!("{}: {}", command.as_str(), skill);
    Ok(())
}

async fn run_watch(client: &Client, prefix: Option<&str>) -> Result<(), ClientError> {
    let mut events = client.events(prefix).await?;
    while let Some(msg) = events.next_message().await? {
        render::print_message(&msg);
    }
    Ok(())
}

async fn run_status(client: &Client) -> Result<(), ClientError> {
    let status = client.status().await?;
    render::print_status(&status);
    Ok(())
}

async fn run_publish(client: &Client, event: &str, data: Option<&str>) -> Result<(), ClientError> {
    let data: Option<Value> = data
        .map(serde_json::from_str)
        .transpose()
        .map_err(|e| ClientError::InvalidPayload(e.to_string()))?;
    let response = client.publish(event, data.as_ref()).await?;
    println!(
        "Published {} ({} subscriber(s))",
        response.event, response.delivered
    );
    Ok(())
}
