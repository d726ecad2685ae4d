//! Command-line and config-file handling for the proxy binary

use anyhow::{Context, Result};
use clap::Parser;
use mwproxy_router::{NetworkRanges, ResolutionPolicy};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

const DEFAULT_BIND: &str = "0.0.0.0";
const DEFAULT_FWDADDR: &str = "127.0.0.1:3020";
const DEFAULT_SERVICES_CIDR: &str = "10.21.0.0/16";
const DEFAULT_CONTAINERS_CIDR: &str = "10.20.0.0/16";
const DEFAULT_KEYSTONE_TIMEOUT: &str = "30s";
const DEFAULT_CACHE_TTL: &str = "5m";

/// Transparent proxy that tunnels intercepted connections to cluster nodes
#[derive(Parser, Debug)]
#[command(name = "mw-proxy")]
#[command(about = "Transparent TCP proxy that tunnels intercepted connections to cluster nodes")]
#[command(version = env!("GIT_TAG"))]
#[command(long_about = r#"
mw-proxy accepts connections redirected to it by the packet filter, recovers
their original destination and tunnels them through the per-node forwarding
service. Service and container network destinations are spread across nodes
in round-robin order; other destinations go to the node owning that IP.

EXAMPLES:
  # Run with positional credentials
  mw-proxy --port 3128 https://keystone.example.com/keystone/v3 \
    $PROJECT_ID admin $PASSWORD https://du.example.com/qbert $CLUSTER_ID

  # Run from a config file
  mw-proxy --config mw-proxy.yaml

  # Override the forwarder and log level
  mw-proxy --config mw-proxy.yaml --fwdaddr 127.0.0.1:3021 --log-level debug

ENVIRONMENT VARIABLES:
  MWPROXY_BIND             Address to listen on
  MWPROXY_PORT             Port to listen on (0 picks a free port)
  MWPROXY_FWDADDR          Forwarding service address (host:port)
  MWPROXY_SERVICES_CIDR    Services network range
  MWPROXY_CONTAINERS_CIDR  Containers network range
  MWPROXY_TOKEN            Initial authentication token
"#)]
pub struct Cli {
    /// Keystone URL (e.g. https://du.example.com/keystone/v3)
    pub keystone_url: Option<String>,

    /// Project id the token is scoped to
    pub project_id: Option<String>,

    /// Keystone username
    pub username: Option<String>,

    /// Keystone password
    pub password: Option<String>,

    /// Node directory URL (e.g. https://du.example.com/qbert)
    pub qbert_url: Option<String>,

    /// Cluster whose nodes are used (empty uses every node)
    pub cluster_id: Option<String>,

    /// Address to listen on
    #[arg(long, env = "MWPROXY_BIND")]
    pub bind: Option<String>,

    /// Port to listen on (0 picks a free port)
    #[arg(long, env = "MWPROXY_PORT")]
    pub port: Option<u16>,

    /// Forwarding service address
    #[arg(long, env = "MWPROXY_FWDADDR")]
    pub fwdaddr: Option<String>,

    /// Services network range
    #[arg(long, env = "MWPROXY_SERVICES_CIDR")]
    pub services_cidr: Option<String>,

    /// Containers network range
    #[arg(long, env = "MWPROXY_CONTAINERS_CIDR")]
    pub containers_cidr: Option<String>,

    /// Initial authentication token; replaced once it is rejected
    #[arg(long, env = "MWPROXY_TOKEN")]
    pub token: Option<String>,

    /// Timeout for Keystone and node directory requests (e.g. 30s)
    #[arg(long)]
    pub keystone_timeout: Option<String>,

    /// Period between node cache invalidations (e.g. 5m)
    #[arg(long)]
    pub cache_ttl: Option<String>,

    /// What to do when no node can be picked for overlay traffic (abort, continue)
    #[arg(long)]
    pub on_resolution_failure: Option<ResolutionPolicy>,

    /// Path to a YAML configuration file
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG is used when unset
    #[arg(long)]
    pub log_level: Option<String>,
}

/// Configuration file format
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub keystone: KeystoneSection,

    #[serde(default)]
    pub directory: DirectorySection,

    #[serde(default)]
    pub proxy: ProxySection,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct KeystoneSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    /// Environment variable holding the password
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password_env: Option<String>,

    /// Direct password (prefer using password_env)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct DirectorySection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_ttl: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ProxySection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub fwdaddr: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub services_cidr: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub containers_cidr: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub on_resolution_failure: Option<ResolutionPolicy>,
}

/// Validated runtime configuration
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub listen_addr: SocketAddr,
    pub forwarder_addr: String,
    pub ranges: NetworkRanges,
    pub keystone_url: String,
    pub project_id: String,
    pub username: String,
    pub password: String,
    pub token: Option<String>,
    pub request_timeout: Duration,
    pub qbert_url: String,
    pub cluster_id: String,
    pub cache_ttl: Duration,
    pub resolution_policy: ResolutionPolicy,
}

impl ProxyConfig {
    /// Merge CLI args with the config file, giving precedence to CLI args
    pub fn from_cli(cli: Cli) -> Result<Self> {
        let file = match &cli.config {
            Some(path) => {
                info!("Loading configuration from: {}", path.display());
                load_config_file(path)?
            }
            None => ConfigFile::default(),
        };
        Self::merge(cli, file)
    }

    pub fn merge(cli: Cli, file: ConfigFile) -> Result<Self> {
        let ConfigFile {
            keystone,
            directory,
            proxy,
        } = file;

        let file_password = match &keystone.password_env {
            Some(env_var) => Some(
                std::env::var(env_var)
                    .with_context(|| format!("Environment variable {} not set", env_var))?,
            ),
            None => keystone.password,
        };

        let keystone_url = required(cli.keystone_url.or(keystone.url), "keystone-url")?;
        let project_id = required(cli.project_id.or(keystone.project_id), "project-id")?;
        let username = required(cli.username.or(keystone.username), "username")?;
        let password = required(cli.password.or(file_password), "password")?;
        let qbert_url = required(cli.qbert_url.or(directory.url), "qbert-url")?;
        let cluster_id = required(cli.cluster_id.or(directory.cluster_id), "cluster-id")?;

        let bind = cli
            .bind
            .or(proxy.bind)
            .unwrap_or_else(|| DEFAULT_BIND.to_string());
        let bind_ip: IpAddr = bind
            .parse()
            .with_context(|| format!("Invalid bind address: {}", bind))?;
        let port = cli.port.or(proxy.port).unwrap_or(0);

        let forwarder_addr = cli
            .fwdaddr
            .or(proxy.fwdaddr)
            .unwrap_or_else(|| DEFAULT_FWDADDR.to_string());
        validate_address(&forwarder_addr, "forwarder")?;

        let services = cli
            .services_cidr
            .or(proxy.services_cidr)
            .unwrap_or_else(|| DEFAULT_SERVICES_CIDR.to_string());
        let containers = cli
            .containers_cidr
            .or(proxy.containers_cidr)
            .unwrap_or_else(|| DEFAULT_CONTAINERS_CIDR.to_string());
        let ranges = NetworkRanges::parse(&services, &containers)?;

        let request_timeout = parse_duration(
            &cli.keystone_timeout
                .or(keystone.timeout)
                .unwrap_or_else(|| DEFAULT_KEYSTONE_TIMEOUT.to_string()),
        )
        .context("Invalid keystone timeout")?;
        let cache_ttl = parse_duration(
            &cli.cache_ttl
                .or(directory.cache_ttl)
                .unwrap_or_else(|| DEFAULT_CACHE_TTL.to_string()),
        )
        .context("Invalid cache TTL")?;

        let token = cli.token.or(keystone.token).filter(|t| !t.is_empty());
        let resolution_policy = cli
            .on_resolution_failure
            .or(proxy.on_resolution_failure)
            .unwrap_or_default();

        Ok(Self {
            listen_addr: SocketAddr::new(bind_ip, port),
            forwarder_addr,
            ranges,
            keystone_url,
            project_id,
            username,
            password,
            token,
            request_timeout,
            qbert_url,
            cluster_id,
            cache_ttl,
            resolution_policy,
        })
    }
}

/// Load configuration from YAML file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: ConfigFile = serde_yaml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

fn required(value: Option<String>, name: &str) -> Result<String> {
    value.ok_or_else(|| anyhow::anyhow!("{} is required (positional argument or config file)", name))
}

/// Parse a duration such as "30s", "5m", "1h", "250ms" or bare seconds
pub fn parse_duration(value: &str) -> Result<Duration> {
    let value = value.trim();
    let (number, unit) = match value.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => value.split_at(idx),
        None => (value, "s"),
    };

    let amount: u64 = number
        .parse()
        .with_context(|| format!("Invalid duration: '{}'", value))?;

    let seconds_per_unit = match unit {
        "ms" => return non_zero(Duration::from_millis(amount), value),
        "s" => 1,
        "m" => 60,
        "h" => 3600,
        other => anyhow::bail!("Invalid duration unit '{}' in '{}'", other, value),
    };
    let seconds = amount
        .checked_mul(seconds_per_unit)
        .with_context(|| format!("Duration out of range: '{}'", value))?;

    non_zero(Duration::from_secs(seconds), value)
}

fn non_zero(duration: Duration, value: &str) -> Result<Duration> {
    if duration.is_zero() {
        anyhow::bail!("Duration must be greater than zero: '{}'", value);
    }
    Ok(duration)
}

/// Validate address format (should be host:port)
fn validate_address(addr: &str, addr_type: &str) -> Result<()> {
    let (host, port) = addr.rsplit_once(':').ok_or_else(|| {
        anyhow::anyhow!(
            "Invalid {} address format: '{}' (expected format: host:port)",
            addr_type,
            addr
        )
    })?;

    if host.is_empty() {
        anyhow::bail!(
            "Invalid {} address format: '{}' (host cannot be empty)",
            addr_type,
            addr
        );
    }

    port.parse::<u16>()
        .with_context(|| format!("Invalid port in {} address: {}", addr_type, addr))?;

    Ok(())
}
