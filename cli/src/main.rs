mod config;
mod error;
mod http_client;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use reqwest::Method;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::time::Duration;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;
use uuid::Uuid;

use config::{default_config_path, Config};
use http_client::{print_json, Client};

#[derive(Parser, Debug)]
#[command(name = "morioctl")]
#[command(about = "Operate a Morio cluster through its core API", long_about = None)]
struct Cli {
    /// Core API base URL, e.g. http://a.example.com:3007
    #[arg(long, env = "MORIO_CORE_URL")]
    url: Option<String>,

    /// Config file path
    #[arg(long, env = "MORIOCTL_CONFIG")]
    config: Option<PathBuf>,

    /// Request timeout in seconds
    #[arg(long, default_value_t = 10)]
    timeout: u64,

    /// Retries for requests refused while a node reloads
    #[arg(long, default_value_t = 3)]
    retries: u32,

    /// Enable debug logging
    #[arg(long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show node and cluster status
    Status,
    /// Show status, settings, keys and presets
    Reload,
    /// Set up a new cluster from a settings file
    Setup {
        /// Settings document (JSON)
        #[arg(long)]
        file: PathBuf,
    },
    /// Deploy a new settings version (leader only)
    Settings {
        #[arg(long)]
        file: PathBuf,
    },
    /// List stored settings versions, or show one of them
    Versions {
        /// Serial to show, or `current` for the running version
        serial: Option<String>,
    },
    /// Ask an ephemeral node to join the cluster
    Invite {
        /// FQDN of the node to invite
        #[arg(long)]
        you: String,
        /// FQDN of the leader the node should join
        #[arg(long)]
        join: String,
        /// Cluster UUID (defaults to the cluster set up from here)
        #[arg(long)]
        cluster: Option<Uuid>,
        #[arg(long = "as", default_value = "broker_node", value_parser = ["broker_node", "flanking_node"])]
        role: String,
    },
    /// Print the root certificate of the cluster CA
    CaCert {
        /// Write the PEM to this file instead of stdout
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Remember the core API URL
    Use { url: String },
}

fn versions_path(serial: Option<&str>) -> String {
    match serial {
        Some(serial) => format!("/settings/{}", serial),
        None => "/settings".to_string(),
    }
}

fn read_json(path: &PathBuf) -> Result<Value> {
    let bytes = std::fs::read(path).with_context(|| format!("Failed to read {:?}", path))?;
    serde_json::from_slice(&bytes).with_context(|| format!("Failed to parse {:?}", path))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(if cli.verbose { Level::DEBUG } else { Level::WARN })
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let mut cfg = Config::load(&config_path)?;

    if let Command::Use { url } = &cli.command {
        cfg.base_url = Some(url.clone());
        cfg.save(&config_path)?;
        println!("Using {}", url);
        return Ok(());
    }

    let base_url = cli
        .url
        .clone()
        .or_else(|| cfg.base_url.clone())
        .context("No core URL configured, pass --url or run `morioctl use <url>`")?;
    let client = Client::new(&base_url, Duration::from_secs(cli.timeout), cli.retries)?;

    match cli.command {
        Command::Status => {
            let status = client.send_json(Method::GET, "/status", None).await?;
            print_json(&status)?;
        }
        Command::Reload => {
            let reload = client.send_json(Method::GET, "/reload", None).await?;
            print_json(&reload)?;
        }
        Command::Setup { file } => {
            let settings = read_json(&file)?;
            let res = client.send_json(Method::POST, "/setup", Some(settings)).await?;
            if let Some(cluster) = res
                .pointer("/uuids/cluster")
                .and_then(Value::as_str)
                .and_then(|s| Uuid::parse_str(s).ok())
            {
                cfg.base_url = Some(base_url.clone());
                cfg.cluster = Some(cluster);
                cfg.save(&config_path)?;
            }
            print_json(&res)?;
            eprintln!("The root token above is shown only once. Store it safely.");
        }
        Command::Settings { file } => {
            let settings = read_json(&file)?;
            let res = client.send_json(Method::POST, "/settings", Some(settings)).await?;
            print_json(&res)?;
        }
        Command::Versions { serial } => {
            let res = client
                .send_json(Method::GET, &versions_path(serial.as_deref()), None)
                .await?;
            print_json(&res)?;
        }
        Command::Invite {
            you,
            join,
            cluster,
            role,
        } => {
            let cluster = cluster
                .or(cfg.cluster)
                .context("No cluster UUID known, pass --cluster")?;
            let body = json!({
                "you": you,
                "join": join,
                "cluster": { "uuid": cluster },
                "as": role,
            });
            let res = client.send_json(Method::POST, "/cluster/invite", Some(body)).await?;
            print_json(&res)?;
        }
        Command::CaCert { out } => {
            let res = client.send_json(Method::GET, "/ca/certificate", None).await?;
            let pem = res
                .get("certificate")
                .and_then(Value::as_str)
                .context("Response carries no certificate")?;
            match out {
                Some(path) => {
                    std::fs::write(&path, pem).with_context(|| format!("Failed to write {:?}", path))?;
                    if let Some(fpr) = res.get("fingerprint").and_then(Value::as_str) {
                        eprintln!("Wrote {:?} (fingerprint {})", path, fpr);
                    }
                }
                None => print!("{}", pem),
            }
        }
        Command::Use { .. } => {}
    }

    Ok(())
}
