use anyhow::anyhow;
use std::net::{SocketAddr, ToSocketAddrs};
use url::Url;

pub fn sanitize_url(url: &str) -> anyhow::Result<String> {
    let url = url.trim();
    if url.is_empty() {
        return Err(anyhow!("URL cannot be empty"));
    }

    if url.contains('\0') || url.contains('\r') || url.contains('\n') {
        return Err(anyhow!("URL contains invalid control characters"));
    }

    let parsed_url = Url::parse(url).map_err(|e| anyhow!("Invalid URL format: {}", e))?;

    match parsed_url.scheme() {
        "http" | "https" => {}
        other => return Err(anyhow!("Unsupported URL scheme: {}", other)),
    }

    // Url always renders a trailing slash for an empty path; callers append their own paths.
    Ok(parsed_url.to_string().trim_end_matches('/').to_string())
}

/// Builds the base URL a node is reached at from one of its interface addresses and its TCP port.
pub fn endpoint_url(interface: &str, port: u16) -> anyhow::Result<String> {
    let host = interface.trim();
    if host.is_empty() {
        return Err(anyhow!("interface address cannot be empty"));
    }

    let host = if host.contains(':') && !host.starts_with('[') {
        format!("[{}]", host)
    } else {
        host.to_string()
    };

    sanitize_url(&format!("http://{}:{}", host, port))
}

pub fn parse_socket_addr(listen: &str) -> anyhow::Result<SocketAddr> {
    let url = if listen.starts_with("http://") || listen.starts_with("https://") {
        Url::parse(listen)?
    } else {
        Url::parse(&format!("http://{}", listen))?
    };

    let host = url
        .host_str()
        .ok_or(anyhow!("missing host in listen address"))?;
    let port = url
        .port_or_known_default()
        .ok_or(anyhow!("missing port in listen address"))?;

    (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| anyhow!("could not resolve {}", listen))
}
