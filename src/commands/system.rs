// System Commands
// Operator utilities: egress binary probe and destination reachability tests

use std::net::{TcpStream, ToSocketAddrs};
use std::process::Command;
use std::time::{Duration, Instant};

use crate::models::Destination;

/// Result of probing a destination's RTMP endpoint
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DestinationTestResult {
    pub success: bool,
    pub message: String,
    /// Time taken in milliseconds
    pub latency_ms: Option<u64>,
}

/// Report the installed nginx version (nginx prints its banner to stderr)
pub fn nginx_version(binary: &str) -> Result<String, String> {
    let resolved = which::which(binary)
        .map_err(|_| format!("nginx binary '{binary}' not found"))?;

    let output = Command::new(&resolved)
        .arg("-v")
        .output()
        .map_err(|e| format!("Failed to run {}: {e}", resolved.display()))?;

    let banner = if output.stderr.is_empty() {
        String::from_utf8_lossy(&output.stdout).to_string()
    } else {
        String::from_utf8_lossy(&output.stderr).to_string()
    };

    banner
        .lines()
        .next()
        .map(|line| line.trim().to_string())
        .filter(|line| !line.is_empty())
        .ok_or_else(|| "No version output from nginx".to_string())
}

/// Test a destination's reachability with a TCP connect to its RTMP
/// host:port. Does not publish; a reachable endpoint can still reject the
/// stream key.
pub fn test_destination(dest: &Destination) -> Result<DestinationTestResult, String> {
    let start = Instant::now();
    let (host, port) = parse_rtmp_host_port(&dest.rtmp_url)?;
    let addr = format!("{host}:{port}");

    let socket_addr = addr
        .to_socket_addrs()
        .map_err(|e| format!("Cannot resolve {addr}: {e}"))?
        .next()
        .ok_or_else(|| format!("Cannot resolve {addr}"))?;

    match TcpStream::connect_timeout(&socket_addr, Duration::from_secs(5)) {
        Ok(_) => {
            log::info!(
                "TCP connection to {addr} successful for destination '{}'",
                dest.name
            );
            Ok(DestinationTestResult {
                success: true,
                message: format!("Reached {addr}"),
                latency_ms: Some(start.elapsed().as_millis() as u64),
            })
        }
        Err(e) => Ok(DestinationTestResult {
            success: false,
            message: format!("Cannot reach {addr} - {e}"),
            latency_ms: Some(start.elapsed().as_millis() as u64),
        }),
    }
}

/// Extract host and port from an rtmp:// or rtmps:// URL, applying the
/// scheme's default port when none is given
fn parse_rtmp_host_port(url: &str) -> Result<(String, u16), String> {
    let url = url.trim();

    let (is_secure, rest) = if let Some(rest) = url.strip_prefix("rtmps://") {
        (true, rest)
    } else if let Some(rest) = url.strip_prefix("rtmp://") {
        (false, rest)
    } else {
        return Err("Invalid RTMP URL: must start with rtmp:// or rtmps://".to_string());
    };

    let host_port = rest.split('/').next().unwrap_or(rest);

    let (host, port) = match host_port.split_once(':') {
        Some((host, port)) => {
            let port: u16 = port
                .parse()
                .map_err(|_| format!("Invalid port in URL: {port}"))?;
            (host.to_string(), port)
        }
        None => {
            let default_port = if is_secure { 443 } else { 1935 };
            (host_port.to_string(), default_port)
        }
    };

    if host.is_empty() {
        return Err("Empty host in RTMP URL".to_string());
    }

    Ok((host, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_url_defaults_to_1935() {
        assert_eq!(
            parse_rtmp_host_port("rtmp://live.twitch.tv/app").unwrap(),
            ("live.twitch.tv".to_string(), 1935)
        );
    }

    #[test]
    fn test_parse_secure_url_defaults_to_443() {
        assert_eq!(
            parse_rtmp_host_port("rtmps://live-api-s.facebook.com/rtmp").unwrap(),
            ("live-api-s.facebook.com".to_string(), 443)
        );
    }

    #[test]
    fn test_parse_explicit_port() {
        assert_eq!(
            parse_rtmp_host_port("rtmp://127.0.0.1:1936/live").unwrap(),
            ("127.0.0.1".to_string(), 1936)
        );
    }

    #[test]
    fn test_parse_rejects_other_schemes() {
        assert!(parse_rtmp_host_port("https://example.com/live").is_err());
        assert!(parse_rtmp_host_port("rtmp://").is_err());
    }
}
