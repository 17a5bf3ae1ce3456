use anyhow::Context;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    /// Path the reporting API is mounted under
    pub stats_path_prefix: String,
    pub client_address: ClientAddressConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Which forwarding headers are trusted when resolving a visitor's address
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustedProxyMode {
    /// Socket address only
    #[default]
    None,
    /// `Forwarded` / `X-Forwarded-For`
    Standard,
    /// `CF-Connecting-IP`
    Cloudflare,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientAddressConfig {
    pub trusted_proxy_mode: TrustedProxyMode,
    /// Proxy ranges allowed to set forwarding headers; empty trusts any peer
    #[serde(default)]
    pub trusted_proxies: Vec<IpNet>,
    /// Number of proxy hops to skip from the right of `X-Forwarded-For`
    #[serde(default)]
    pub num_trusted_proxies: Option<usize>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let host = std::env::var("PAGESTATS_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = std::env::var("PAGESTATS_PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse::<u16>()
            .context("PAGESTATS_PORT must be a valid port number")?;

        let stats_path_prefix = normalize_prefix(
            &std::env::var("STATS_PATH_PREFIX").unwrap_or_else(|_| "/stats".to_string()),
        );

        let trusted_proxy_mode = parse_proxy_mode(
            &std::env::var("TRUSTED_PROXY_MODE").unwrap_or_else(|_| "none".to_string()),
        );

        let trusted_proxies = std::env::var("TRUSTED_PROXIES")
            .map(|v| parse_trusted_proxies(&v))
            .unwrap_or_default();

        let num_trusted_proxies = match std::env::var("NUM_TRUSTED_PROXIES") {
            Ok(v) => Some(
                v.parse::<usize>()
                    .context("NUM_TRUSTED_PROXIES must be a non-negative integer")?,
            ),
            Err(_) => None,
        };

        Ok(Config {
            server: ServerConfig { host, port },
            stats_path_prefix,
            client_address: ClientAddressConfig {
                trusted_proxy_mode,
                trusted_proxies,
                num_trusted_proxies,
            },
        })
    }
}

fn parse_proxy_mode(value: &str) -> TrustedProxyMode {
    match value.to_lowercase().as_str() {
        "none" => TrustedProxyMode::None,
        "standard" => TrustedProxyMode::Standard,
        "cloudflare" => TrustedProxyMode::Cloudflare,
        other => {
            tracing::warn!(
                "Unknown TRUSTED_PROXY_MODE '{other}', falling back to 'none'. Supported values: none, standard, cloudflare"
            );
            TrustedProxyMode::None
        }
    }
}

/// Parse a comma separated CIDR list, skipping malformed entries
fn parse_trusted_proxies(value: &str) -> Vec<IpNet> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|s| match s.parse::<IpNet>() {
            Ok(net) => Some(net),
            Err(_) => match s.parse::<IpAddr>() {
                Ok(ip) => IpNet::new(ip, if ip.is_ipv4() { 32 } else { 128 }).ok(),
                Err(err) => {
                    tracing::warn!("Ignoring invalid TRUSTED_PROXIES entry '{s}': {err}");
                    None
                }
            },
        })
        .collect()
}

/// Leading slash, no trailing slash; the root collapses to "/"
fn normalize_prefix(value: &str) -> String {
    let trimmed = value.trim().trim_matches('/');
    format!("/{trimmed}")
}
