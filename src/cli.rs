use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

use crate::adapters::{IngressObject, MonitorObject};
use crate::config::AppConfig;
use crate::controller::generated_monitor;
use crate::desired::{derive_desired, monitoring_enabled};
use crate::domain::Route;
use crate::error::{OperatorError, Result};

#[derive(Parser, Debug)]
#[command(name = "routewatch")]
#[command(author = "Routewatch Team")]
#[command(version)]
#[command(about = "Keeps uptime monitors in sync with cluster ingress routes", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config directory (default.toml plus the $ROUTEWATCH_ENV overlay)
    #[arg(short, long, env = "ROUTEWATCH_CONFIG_DIR", default_value = "config")]
    pub config: PathBuf,

    /// Emit JSON log lines on the console
    #[arg(long)]
    pub json: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run both controllers and the health server until SIGINT/SIGTERM
    Run {
        /// Log monitoring service calls instead of making them
        #[arg(long)]
        dry_run: bool,
    },
    /// Print the Monitor that would be generated for an Ingress manifest
    Derive {
        /// Ingress manifest, YAML or JSON
        #[arg(short, long)]
        file: PathBuf,
        /// Interval used when the route has no interval annotation
        #[arg(long)]
        default_interval: Option<String>,
    },
    /// Load and validate configuration, then exit
    CheckConfig,
}

/// Parse an Ingress manifest (YAML or JSON) into a route
pub fn parse_route_manifest(text: &str) -> Result<Route> {
    let ingress: IngressObject = serde_yaml::from_str(text)?;
    if ingress.metadata.name.is_empty() {
        return Err(OperatorError::InvalidConfig(
            "manifest has no metadata.name".to_string(),
        ));
    }
    Ok(ingress.into_route("default"))
}

/// Render the Monitor manifest generated for the route in `text`
pub fn render_derived(text: &str, default_interval: Option<&str>) -> Result<String> {
    let route = parse_route_manifest(text)?;
    if !monitoring_enabled(&route) {
        return Ok(format!(
            "# monitoring disabled for {}; no Monitor would be kept\n",
            route.key
        ));
    }

    let desired = derive_desired(&route, default_interval)?;
    let monitor = generated_monitor(&route, &desired);
    Ok(serde_yaml::to_string(&MonitorObject::from_monitor(&monitor))?)
}

pub fn derive_from_file(path: &Path, default_interval: Option<&str>) -> Result<String> {
    let text = std::fs::read_to_string(path)?;
    render_derived(&text, default_interval)
}

/// Load configuration from `dir` and collect every validation problem
pub fn check_config(dir: &Path) -> Result<AppConfig> {
    let config = AppConfig::load_from(dir)?;
    config
        .validate()
        .map_err(|errors| OperatorError::InvalidConfig(errors.join("; ")))?;
    Ok(config)
}
