use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "herald")]
#[command(about = "Command-line tool for the Herald report cache")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Settings file (TOML)
    #[arg(short, long, global = true, env = "HERALD_CONFIG")]
    pub config: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run one report request and print the response
    Report(ReportArgs),
    /// Refresh the full-dataset cache for one endpoint or all of them
    Refresh(RefreshArgs),
    /// List full-dataset cache entries
    Cached,
    /// Purge the reverse-proxy cache
    Purge(PurgeArgs),
    /// List configured endpoints
    Endpoints,
    /// Show the visualizations and filters of an analytics report
    Describe(DescribeArgs),
    /// Refresh all cached datasets periodically, reloading the catalog on change
    Daemon(DaemonArgs),
}

#[derive(clap::Args)]
pub struct ReportArgs {
    /// Endpoint name
    pub endpoint: String,
    /// Info type (visualization) to serve
    #[arg(short, long)]
    pub info_type: Option<String>,
    /// Filter as key=value (repeatable)
    #[arg(short = 'f', long = "filter", value_parser = parse_key_val)]
    pub filters: Vec<(String, String)>,
    /// 1-based page
    #[arg(long)]
    pub page: Option<usize>,
    #[arg(long)]
    pub page_size: Option<usize>,
    /// Also print the proxy cache headers
    #[arg(long)]
    pub headers: bool,
}

#[derive(clap::Args)]
pub struct RefreshArgs {
    /// Endpoint to refresh; all dataset-cached endpoints when omitted
    pub endpoint: Option<String>,
}

#[derive(clap::Args)]
pub struct PurgeArgs {
    /// Endpoint to purge; everything when omitted
    pub endpoint: Option<String>,
}

#[derive(clap::Args)]
pub struct DescribeArgs {
    /// Report (dossier) id
    pub report_id: String,
}

#[derive(clap::Args)]
pub struct DaemonArgs {
    /// Seconds between refresh runs (overrides cache.refresh_interval_secs)
    #[arg(long)]
    pub interval: Option<u64>,
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{s}'"))?;
    if key.is_empty() {
        return Err(format!("empty filter key in '{s}'"));
    }
    Ok((key.to_string(), value.to_string()))
}
