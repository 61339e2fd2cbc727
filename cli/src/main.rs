//! litflow CLI - submit and inspect delegated flows on a litflow server

mod client;
mod messages;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use crate::client::LitflowClient;
use crate::messages::{FlowRun, RunStatus, SubmitFlow};

#[derive(Parser)]
#[command(name = "litflow-cli")]
#[command(about = "CLI client for the litflow demo server")]
#[command(version)]
struct Cli {
    /// Server URL
    #[arg(short, long, env = "LITFLOW_SERVER", default_value = "http://localhost:3000")]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a delegated flow
    Submit {
        /// File with the Lit Action source (default: PKP signing action)
        #[arg(long, conflicts_with = "ipfs")]
        code_file: Option<PathBuf>,

        /// IPFS id of the action
        #[arg(long)]
        ipfs: Option<String>,

        /// UTF-8 message whose digest the action signs (default: bytes 1..=5)
        #[arg(short, long)]
        message: Option<String>,

        /// Name the signature is reported under
        #[arg(long)]
        sig_name: Option<String>,

        /// Extra action parameter; the value is parsed as JSON, else taken as a string
        #[arg(short, long = "param", value_name = "KEY=VALUE", value_parser = parse_param)]
        params: Vec<(String, serde_json::Value)>,

        /// JSON file with access control conditions the action checks before signing
        #[arg(long)]
        conditions: Option<PathBuf>,

        /// Chain the conditions are evaluated on
        #[arg(long, requires = "conditions")]
        chain: Option<String>,

        /// Wait for the flow to finish
        #[arg(short, long)]
        wait: bool,

        /// Give up waiting after this many seconds
        #[arg(long, default_value_t = 120)]
        timeout: u64,
    },

    /// Show one flow
    Status {
        /// Flow ID
        id: Uuid,
    },

    /// List recent flows
    List {
        #[arg(short, long, default_value_t = 20)]
        limit: u32,
    },

    /// Check that the server is up
    Health,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "litflow_cli=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let cli = Cli::parse();
    let client = LitflowClient::new(&cli.server);

    match cli.command {
        Commands::Submit {
            code_file,
            ipfs,
            message,
            sig_name,
            params,
            conditions,
            chain,
            wait,
            timeout,
        } => {
            let code = code_file.map(|path| read_file(&path)).transpose()?;
            let conditions = conditions
                .map(|path| {
                    serde_json::from_str::<Vec<serde_json::Value>>(&read_file(&path)?)
                        .with_context(|| format!("{} is not a JSON array", path.display()))
                })
                .transpose()?;
            let request = SubmitFlow {
                code,
                ipfs_id: ipfs,
                message: message.map(String::into_bytes),
                sig_name,
                params: (!params.is_empty()).then(|| params.into_iter().collect()),
                conditions,
                chain,
            };
            run_submit(&client, &request, wait, Duration::from_secs(timeout)).await
        }
        Commands::Status { id } => {
            print_run(&client.get_flow(id).await?);
            Ok(())
        }
        Commands::List { limit } => run_list(&client, limit).await,
        Commands::Health => {
            println!("{}", client.health().await?);
            Ok(())
        }
    }
}

fn read_file(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
}

fn parse_param(raw: &str) -> std::result::Result<(String, serde_json::Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got {}", raw))?;
    if key.is_empty() {
        return Err(format!("missing parameter name in {}", raw));
    }
    let value = serde_json::from_str(value)
        .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

async fn run_submit(
    client: &LitflowClient,
    request: &SubmitFlow,
    wait: bool,
    timeout: Duration,
) -> Result<()> {
    let submitted = client.submit(request).await?;
    println!("Submitted flow {}", submitted.id);

    if !wait {
        return Ok(());
    }

    let run = client
        .wait(submitted.id, Duration::from_millis(500), timeout)
        .await?;
    print_run(&run);
    if run.status == RunStatus::Error {
        anyhow::bail!("Flow {} failed", run.id);
    }
    Ok(())
}

async fn run_list(client: &LitflowClient, limit: u32) -> Result<()> {
    let runs = client.list_flows(limit).await?;

    if runs.is_empty() {
        println!("No flows found.");
        return Ok(());
    }

    println!("Flows:");
    for run in runs {
        println!(
            "  {} - {} ({})",
            run.id,
            run.status.as_str(),
            run.created_at.format("%Y-%m-%d %H:%M")
        );
    }
    Ok(())
}

fn print_run(run: &FlowRun) {
    println!("Flow {}: {}", run.id, run.status.as_str());
    if let Some(delegate) = &run.delegate {
        println!("  delegate:   {}", delegate);
    }
    if let Some(credential) = &run.credential_id {
        println!("  credential: {}", credential);
    }
    if let Some(stage) = &run.failed_stage {
        println!("  failed at:  {}", stage);
    }
    if let Some(error) = &run.error {
        println!("  error:      {}", error);
    }
    if let Some(result) = &run.result {
        for (name, signature) in &result.signatures {
            println!("  {}: {}", name, signature.signature);
            println!("    public key: {}", signature.public_key);
            println!("    signed:     {}", signature.data_signed);
        }
        if !result.logs.is_empty() {
            println!("  logs: {}", result.logs);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_param_json_or_string() {
        assert_eq!(
            parse_param("limit=5").unwrap(),
            ("limit".to_string(), serde_json::json!(5))
        );
        assert_eq!(
            parse_param("note=hello world").unwrap(),
            ("note".to_string(), serde_json::json!("hello world"))
        );
        assert_eq!(
            parse_param("tags=[\"a\"]").unwrap(),
            ("tags".to_string(), serde_json::json!(["a"]))
        );
        assert!(parse_param("novalue").is_err());
        assert!(parse_param("=1").is_err());
    }

    #[test]
    fn test_submit_accepts_conditions_and_params() {
        let cli = Cli::parse_from([
            "litflow-cli",
            "submit",
            "--conditions",
            "conditions.json",
            "--chain",
            "ethereum",
            "-p",
            "note=hi",
            "-p",
            "n=2",
        ]);
        match cli.command {
            Commands::Submit {
                params,
                conditions,
                chain,
                ..
            } => {
                assert_eq!(params.len(), 2);
                assert_eq!(conditions, Some(PathBuf::from("conditions.json")));
                assert_eq!(chain.as_deref(), Some("ethereum"));
            }
            _ => panic!("expected submit"),
        }
    }

    #[test]
    fn test_chain_requires_conditions() {
        assert!(Cli::try_parse_from(["litflow-cli", "submit", "--chain", "ethereum"]).is_err());
    }
}
