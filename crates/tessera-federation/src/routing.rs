//! Destination routing.

use std::net::IpAddr;

use tessera_types::DEFAULT_FEDERATION_PORT;
use url::{Host, Url};

use crate::resolver::{pick, FederationResolver, ResolveError};

/// Where and how to open a federation connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingInfo {
    /// Value for the `Host` header: `host[:port]` as written in the URI, or
    /// the delegated server name after `.well-known`.
    pub host_header: String,
    /// Name to validate the server certificate against.
    pub tls_server_name: String,
    /// Hostname or IP literal to connect to.
    pub target_host: String,
    pub target_port: u16,
}

/// Logical server name split out of a destination URI.
struct Destination {
    host: String,
    ip: Option<IpAddr>,
    port: Option<u16>,
    host_header: String,
}

impl Destination {
    fn parse(uri: &Url) -> Result<Self, ResolveError> {
        let (host, ip) = match uri.host() {
            // Non-special schemes such as `matrix://` leave IPv4 unparsed.
            Some(Host::Domain(d)) => (d.to_string(), d.parse::<IpAddr>().ok()),
            Some(Host::Ipv4(v4)) => (v4.to_string(), Some(IpAddr::V4(v4))),
            Some(Host::Ipv6(v6)) => (v6.to_string(), Some(IpAddr::V6(v6))),
            None => return Err(ResolveError::InvalidDestination(uri.to_string())),
        };
        let bare = uri.host_str().unwrap_or(&host).to_string();
        let host_header = match uri.port() {
            Some(port) => format!("{bare}:{port}"),
            None => bare,
        };
        Ok(Self {
            host,
            ip,
            port: uri.port(),
            host_header,
        })
    }
}

/// Works out where to send a request for `uri`.
///
/// In order:
/// 1. An IP literal is used as-is, on its port or 8448.
/// 2. An explicit port pins the hostname and port.
/// 3. With `allow_well_known`, a delegation document restarts routing at the
///    delegated server name (once; delegation is not followed twice).
/// 4. Otherwise an SRV candidate is picked.
///
/// The TLS name is always the logical hostname, never the SRV target.
pub async fn route(
    resolver: &FederationResolver,
    uri: &Url,
    allow_well_known: bool,
) -> Result<RoutingInfo, ResolveError> {
    let dest = Destination::parse(uri)?;

    if let Some(ip) = dest.ip {
        return Ok(RoutingInfo {
            host_header: dest.host_header,
            tls_server_name: dest.host,
            target_host: ip.to_string(),
            target_port: dest.port.unwrap_or(DEFAULT_FEDERATION_PORT),
        });
    }

    if let Some(port) = dest.port {
        return Ok(RoutingInfo {
            host_header: dest.host_header,
            tls_server_name: dest.host.clone(),
            target_host: dest.host,
            target_port: port,
        });
    }

    if allow_well_known {
        if let Some(delegated) = resolver.well_known(&dest.host).await {
            let mut next = uri.clone();
            let (host, port) = split_server_name(&delegated)?;
            next.set_host(Some(&host))
                .map_err(|e| ResolveError::InvalidDestination(format!("{delegated}: {e}")))?;
            next.set_port(port)
                .map_err(|_| ResolveError::InvalidDestination(delegated.clone()))?;
            return Box::pin(route(resolver, &next, false)).await;
        }
    }

    let candidates = resolver.resolve(&dest.host).await?;
    let chosen = pick(&candidates)?;
    Ok(RoutingInfo {
        host_header: dest.host_header,
        tls_server_name: dest.host,
        target_host: chosen.target,
        target_port: chosen.port,
    })
}

/// Splits a server name such as `example.org:8448` or `[::1]:443`.
fn split_server_name(name: &str) -> Result<(String, Option<u16>), ResolveError> {
    let invalid = || ResolveError::InvalidDestination(name.to_string());
    if let Some(rest) = name.strip_prefix('[') {
        let (addr, tail) = rest.split_once(']').ok_or_else(invalid)?;
        let port = match tail.strip_prefix(':') {
            Some(p) => Some(p.parse().map_err(|_| invalid())?),
            None if tail.is_empty() => None,
            None => return Err(invalid()),
        };
        return Ok((format!("[{addr}]"), port));
    }
    match name.rsplit_once(':') {
        Some((host, port)) => Ok((host.to_string(), Some(port.parse().map_err(|_| invalid())?))),
        None => Ok((name.to_string(), None)),
    }
}
