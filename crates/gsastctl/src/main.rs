//! gsastctl - CLI client for gsastd
//!
//! Local control plane client for the scan orchestrator daemon.

mod client;
mod render;

use clap::{Parser, Subcommand};
use client::{Client, ClientError, RuleFileWire};
use std::path::{Path, PathBuf};

/// CLI client for the gsastd scan orchestrator daemon.
#[derive(Parser)]
#[command(name = "gsastctl")]
#[command(about = "Control plane for gsastd SAST scan orchestrator")]
#[command(version)]
struct Cli {
    /// Daemon address (default: http://127.0.0.1:5000)
    #[arg(long, global = true, env = "GSASTD_ADDR")]
    addr: Option<String>,

    /// Shared secret for the X-API-Secret-Key header
    #[arg(long, global = true, env = "GSASTD_TOKEN")]
    token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a new scan from a config file, optionally uploading rule files
    Scan {
        /// Path to a JSON file matching the /scan config payload
        #[arg(long)]
        config: PathBuf,

        /// Directory of .yaml/.yml/.json rule files to upload (required for semgrep)
        #[arg(long)]
        rules: Option<PathBuf>,
    },

    /// Show a scan's current status
    Status {
        /// Scan ID
        scan_id: String,
    },

    /// Fetch a scan's results, optionally filtered
    Results {
        /// Scan ID
        scan_id: String,

        /// Keep only projects whose URL contains (or ends in) this substring
        #[arg(long)]
        project: Option<String>,

        /// Keep only scanner entries whose id contains this substring
        #[arg(long)]
        scanner: Option<String>,

        /// JSONPath expression applied to each scanner's payload
        #[arg(long)]
        query: Option<String>,
    },

    /// List every known scan id
    Scans,

    /// List the cached project keys
    Projects,

    /// Wipe the scans, tasks, and rules queues
    #[command(name = "cleanup-queues")]
    CleanupQueues,

    /// Wipe the cached project metadata
    #[command(name = "cleanup-projects")]
    CleanupProjects,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let addr = cli.addr.unwrap_or_else(|| "http://127.0.0.1:5000".to_string());
    let client = Client::new(&addr, cli.token.as_deref());

    let result = match cli.command {
        Command::Scan { config, rules } => run_scan(&client, &config, rules.as_deref()).await,
        Command::Status { scan_id } => run_status(&client, &scan_id).await,
        Command::Results {
            scan_id,
            project,
            scanner,
            query,
        } => run_results(&client, &scan_id, project.as_deref(), scanner.as_deref(), query.as_deref()).await,
        Command::Scans => run_scans(&client).await,
        Command::Projects => run_projects(&client).await,
        Command::CleanupQueues => run_cleanup_queues(&client).await,
        Command::CleanupProjects => run_cleanup_projects(&client).await,
    };

    if let Err(e) = result {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

async fn run_scan(client: &Client, config_path: &Path, rules_dir: Option<&Path>) -> Result<(), ClientError> {
    let config_raw = std::fs::read_to_string(config_path)
        .map_err(|e| ClientError::IoError(format!("reading {}: {e}", config_path.display())))?;
    let config: serde_json::Value = serde_json::from_str(&config_raw)
        .map_err(|e| ClientError::IoError(format!("parsing {}: {e}", config_path.display())))?;

    let rule_files = match rules_dir {
        Some(dir) => load_rule_files(dir)?,
        None => Vec::new(),
    };

    let scan_id = client.start_scan(config, rule_files).await?;
    render::print_scan_created(&scan_id);
    Ok(())
}

fn load_rule_files(dir: &Path) -> Result<Vec<RuleFileWire>, ClientError> {
    let entries = std::fs::read_dir(dir)
        .map_err(|e| ClientError::IoError(format!("reading rules dir {}: {e}", dir.display())))?;

    let mut rule_files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| ClientError::IoError(e.to_string()))?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if !(name.ends_with(".yaml") || name.ends_with(".yml") || name.ends_with(".json")) {
            continue;
        }
        let content = std::fs::read_to_string(&path)
            .map_err(|e| ClientError::IoError(format!("reading {}: {e}", path.display())))?;
        rule_files.push(RuleFileWire { name, content });
    }
    Ok(rule_files)
}

async fn run_status(client: &Client, scan_id: &str) -> Result<(), ClientError> {
    let info = client.get_status(scan_id).await?;
    render::print_scan_status(&info);
    Ok(())
}

async fn run_results(
    client: &Client,
    scan_id: &str,
    project: Option<&str>,
    scanner: Option<&str>,
    query: Option<&str>,
) -> Result<(), ClientError> {
    let results = client.get_results(scan_id, project, scanner, query).await?;
    render::print_results(&results);
    Ok(())
}

async fn run_scans(client: &Client) -> Result<(), ClientError> {
    let scans = client.list_scans().await?;
    render::print_scan_list(&scans);
    Ok(())
}

async fn run_projects(client: &Client) -> Result<(), ClientError> {
    let projects = client.list_projects().await?;
    render::print_project_list(&projects);
    Ok(())
}

async fn run_cleanup_queues(client: &Client) -> Result<(), ClientError> {
    let message = client.cleanup_queues().await?;
    println!("{}", message);
    Ok(())
}

async fn run_cleanup_projects(client: &Client) -> Result<(), ClientError> {
    let message = client.cleanup_projects().await?;
    println!("{}", message);
    Ok(())
}
