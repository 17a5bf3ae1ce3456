//! Visitor address resolution from HTTP headers with trust validation
//!
//! Forwarding headers are only honored when:
//! - the configured mode names them, and
//! - the immediate peer falls inside the trusted proxy ranges (any peer when
//!   no ranges are configured).
//!
//! Otherwise the socket address wins.

use axum::http::HeaderMap;
use std::net::IpAddr;
use tracing::warn;

use crate::config::{ClientAddressConfig, TrustedProxyMode};

/// Extract the client IP address of a request
///
/// # Arguments
/// * `headers` - HTTP request headers
/// * `socket_ip` - The socket remote address, if the server exposes it
/// * `config` - Trust settings
///
/// # Returns
/// The client IP, or `None` when neither the socket nor a trusted header
/// provides one
pub fn extract_client_ip(
    headers: &HeaderMap,
    socket_ip: Option<IpAddr>,
    config: &ClientAddressConfig,
) -> Option<IpAddr> {
    if !is_trusted_peer(socket_ip, config) {
        return socket_ip;
    }

    match config.trusted_proxy_mode {
        TrustedProxyMode::Cloudflare => extract_cloudflare_ip(headers).or_else(|| {
            warn!("CF-Connecting-IP header missing in Cloudflare mode, using socket address");
            socket_ip
        }),
        TrustedProxyMode::Standard => extract_standard_ip(headers, config).or(socket_ip),
        TrustedProxyMode::None => socket_ip,
    }
}

/// A missing socket address means the request never crossed the network
/// (in-process service calls), so its headers are taken at face value
fn is_trusted_peer(socket_ip: Option<IpAddr>, config: &ClientAddressConfig) -> bool {
    match socket_ip {
        Some(ip) => is_trusted_proxy(ip, config),
        None => true,
    }
}

fn is_trusted_proxy(ip: IpAddr, config: &ClientAddressConfig) -> bool {
    config.trusted_proxies.is_empty() || config.trusted_proxies.iter().any(|net| net.contains(&ip))
}

/// Extract IP from Cloudflare-specific header
fn extract_cloudflare_ip(headers: &HeaderMap) -> Option<IpAddr> {
    headers
        .get("cf-connecting-ip")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.trim().parse::<IpAddr>().ok())
}

/// Extract IP from standard headers (Forwarded, X-Forwarded-For)
fn extract_standard_ip(headers: &HeaderMap, config: &ClientAddressConfig) -> Option<IpAddr> {
    // Prefer RFC 7239 Forwarded header
    if let Some(ip) = extract_from_forwarded(headers, config) {
        return Some(ip);
    }

    extract_from_x_forwarded_for(headers, config)
}

/// Parse the `for=` parameters of an RFC 7239 Forwarded header
fn forwarded_chain(headers: &HeaderMap) -> Vec<IpAddr> {
    let Some(forwarded) = headers.get("forwarded").and_then(|h| h.to_str().ok()) else {
        return Vec::new();
    };

    // Forwarded: for=192.0.2.60;proto=http, for="[2001:db8::1]:4711"
    forwarded
        .split(',')
        .flat_map(|element| element.split(';'))
        .filter_map(|param| {
            let param = param.trim();
            let value = param
                .strip_prefix("for=")
                .or_else(|| param.strip_prefix("For="))?
                .trim_matches('"');
            parse_node(value)
        })
        .collect()
}

/// Node identifiers may carry brackets and ports
fn parse_node(value: &str) -> Option<IpAddr> {
    if let Some(rest) = value.strip_prefix('[') {
        return rest.split(']').next()?.parse().ok();
    }

    value.parse().ok().or_else(|| {
        // IPv4 with port
        value.rsplit_once(':').and_then(|(host, _)| host.parse().ok())
    })
}

fn extract_from_forwarded(headers: &HeaderMap, config: &ClientAddressConfig) -> Option<IpAddr> {
    select_from_chain(&forwarded_chain(headers), config)
}

fn extract_from_x_forwarded_for(
    headers: &HeaderMap,
    config: &ClientAddressConfig,
) -> Option<IpAddr> {
    let xff = headers.get("x-forwarded-for")?.to_str().ok()?;

    let ips: Vec<IpAddr> = xff
        .split(',')
        .filter_map(|s| s.trim().parse::<IpAddr>().ok())
        .collect();

    select_from_chain(&ips, config)
}

/// Pick the client out of a proxy chain, validating right to left
fn select_from_chain(ips: &[IpAddr], config: &ClientAddressConfig) -> Option<IpAddr> {
    if ips.is_empty() {
        return None;
    }

    // If num_trusted_proxies is specified, skip that many from the right
    if let Some(num_trusted) = config.num_trusted_proxies {
        if ips.len() > num_trusted {
            return Some(ips[ips.len() - num_trusted - 1]);
        }
        // Not enough IPs in chain, return the leftmost (least trusted)
        return ips.first().copied();
    }

    // Walk from the right, skipping hops inside the trusted ranges
    if !config.trusted_proxies.is_empty() {
        return ips
            .iter()
            .rev()
            .find(|ip| !is_trusted_proxy(**ip, config))
            .or_else(|| ips.first())
            .copied();
    }

    // No trust configuration, return the rightmost IP
    ips.last().copied()
}
