use std::net::SocketAddr;
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::Regex;
use reqwest::{Client, StatusCode};
use tokio::net::TcpStream;
use tokio::process::Command;

use crate::core::config::{ServiceCheck, ServiceDescriptor};
use crate::core::metrics;

const SOCKET_TIMEOUT: Duration = Duration::from_secs(2);
const WEB_TIMEOUT: Duration = Duration::from_secs(10);
const PING_DEADLINE: Duration = Duration::from_secs(5);

const IPV4_PATTERN: &str =
    r"^((25[0-5]|(2[0-4]|1?[0-9])?[0-9])\.){3}(25[0-5]|(2[0-4]|1?[0-9])?[0-9])$";
const IPV6_PATTERN: &str = concat!(
    r"^(",
    r"([0-9a-fA-F]{1,4}:){7}[0-9a-fA-F]{1,4}|",
    r"([0-9a-fA-F]{1,4}:){1,7}:|",
    r"([0-9a-fA-F]{1,4}:){1,6}:[0-9a-fA-F]{1,4}|",
    r"([0-9a-fA-F]{1,4}:){1,5}(:[0-9a-fA-F]{1,4}){1,2}|",
    r"([0-9a-fA-F]{1,4}:){1,4}(:[0-9a-fA-F]{1,4}){1,3}|",
    r"([0-9a-fA-F]{1,4}:){1,3}(:[0-9a-fA-F]{1,4}){1,4}|",
    r"([0-9a-fA-F]{1,4}:){1,2}(:[0-9a-fA-F]{1,4}){1,5}|",
    r"[0-9a-fA-F]{1,4}:(:[0-9a-fA-F]{1,4}){1,6}|",
    r":((:[0-9a-fA-F]{1,4}){1,7}|:)|",
    r"fe80:(:[0-9a-fA-F]{0,4}){0,4}%[0-9a-zA-Z]+|",
    r"::(ffff(:0{1,4})?:)?((25[0-5]|(2[0-4]|1?[0-9])?[0-9])\.){3}(25[0-5]|(2[0-4]|1?[0-9])?[0-9])|",
    r"([0-9a-fA-F]{1,4}:){1,4}:((25[0-5]|(2[0-4]|1?[0-9])?[0-9])\.){3}(25[0-5]|(2[0-4]|1?[0-9])?[0-9])",
    r")$"
);
const DNS_LABEL_PATTERN: &str = r"^[a-zA-Z0-9]([a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?$";
const TLD_PATTERN: &str = r"^[a-zA-Z]{2,63}$";

fn regex(cell: &'static OnceLock<Option<Regex>>, pattern: &str) -> Option<&'static Regex> {
    cell.get_or_init(|| match Regex::new(pattern) {
        Ok(regex) => Some(regex),
        Err(err) => {
            tracing::error!(error = %err, pattern, "Invalid address pattern");
            None
        }
    })
    .as_ref()
}

pub(crate) fn is_ipv4_literal(host: &str) -> bool {
    static CELL: OnceLock<Option<Regex>> = OnceLock::new();
    regex(&CELL, IPV4_PATTERN).is_some_and(|re| re.is_match(host))
}

pub(crate) fn is_ipv6_literal(host: &str) -> bool {
    static CELL: OnceLock<Option<Regex>> = OnceLock::new();
    regex(&CELL, IPV6_PATTERN).is_some_and(|re| re.is_match(host))
}

/// Dotted hostname with at least two labels and an alphabetic TLD, 4 to 253 chars.
pub(crate) fn is_fqdn(host: &str) -> bool {
    static LABEL: OnceLock<Option<Regex>> = OnceLock::new();
    static TLD: OnceLock<Option<Regex>> = OnceLock::new();

    if !(4..=253).contains(&host.len()) {
        return false;
    }
    let trimmed = host.strip_suffix('.').unwrap_or(host);
    let labels: Vec<&str> = trimmed.split('.').collect();
    let Some((tld, rest)) = labels.split_last() else {
        return false;
    };
    if rest.is_empty() {
        return false;
    }

    let (Some(label_re), Some(tld_re)) = (regex(&LABEL, DNS_LABEL_PATTERN), regex(&TLD, TLD_PATTERN))
    else {
        return false;
    };
    tld_re.is_match(tld) && rest.iter().all(|label| label_re.is_match(label))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AddressFamily {
    V4,
    V6,
}

/// Literal patterns first, then DNS. Anything unresolved counts as IPv4.
pub(crate) async fn address_family(host: &str) -> AddressFamily {
    if is_ipv4_literal(host) {
        return AddressFamily::V4;
    }
    if is_ipv6_literal(host) {
        return AddressFamily::V6;
    }

    match tokio::net::lookup_host((host, 0)).await {
        Ok(addrs) => {
            let addrs: Vec<SocketAddr> = addrs.collect();
            if addrs.iter().any(SocketAddr::is_ipv4) {
                AddressFamily::V4
            } else if addrs.iter().any(SocketAddr::is_ipv6) {
                AddressFamily::V6
            } else {
                tracing::warn!(host, "Resolution returned no addresses; assuming IPv4");
                AddressFamily::V4
            }
        }
        Err(err) => {
            tracing::warn!(host, error = %err, "Failed to resolve host; assuming IPv4");
            AddressFamily::V4
        }
    }
}

pub(crate) async fn web_url(host: &str, port: u16, path: &str) -> String {
    if is_fqdn(host) || address_family(host).await == AddressFamily::V4 {
        format!("http://{host}:{port}{path}")
    } else {
        format!("http://[{host}]:{port}{path}")
    }
}

/// Reachability predicate for one service.
#[async_trait]
pub(crate) trait ServiceProbe: Send + Sync {
    async fn check(&self, service: &ServiceDescriptor) -> bool;
}

#[derive(Clone)]
pub(crate) struct NetworkProbe {
    http: Client,
}

impl NetworkProbe {
    pub(crate) fn new() -> Result<Self> {
        let http = Client::builder()
            .connect_timeout(SOCKET_TIMEOUT)
            .timeout(WEB_TIMEOUT)
            .build()
            .context("Failed to build probe HTTP client")?;
        Ok(Self { http })
    }

    pub(crate) async fn check_ping(&self, host: &str) -> bool {
        let mut command = Command::new("ping");
        command
            .args([host, "-W", "1", "-c", "1"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = match command.spawn() {
            Ok(child) => tokio::time::timeout(PING_DEADLINE, child.wait_with_output()).await,
            Err(err) => {
                tracing::error!(host, error = %err, "Failed to launch ping");
                return false;
            }
        };

        match output {
            Ok(Ok(output)) if output.status.success() => {
                tracing::info!(host, "Successful ping");
                true
            }
            Ok(Ok(output)) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                tracing::warn!(host, code = ?output.status.code(), stderr = %stderr.trim(), "Ping failed");
                false
            }
            Ok(Err(err)) => {
                tracing::error!(host, error = %err, "Ping failed to run");
                false
            }
            Err(_) => {
                tracing::warn!(host, "Ping timed out");
                false
            }
        }
    }

    pub(crate) async fn check_socket(&self, host: &str, port: u16) -> bool {
        let family = address_family(host).await;
        let addrs: Vec<SocketAddr> = match tokio::net::lookup_host((host, port)).await {
            Ok(addrs) => addrs.collect(),
            Err(err) => {
                tracing::warn!(host, port, error = %err, "Failed to resolve socket address");
                return false;
            }
        };
        let target = addrs
            .iter()
            .find(|addr| match family {
                AddressFamily::V4 => addr.is_ipv4(),
                AddressFamily::V6 => addr.is_ipv6(),
            })
            .or_else(|| addrs.first())
            .copied();
        let Some(target) = target else {
            tracing::warn!(host, port, "No addresses to connect to");
            return false;
        };

        match tokio::time::timeout(SOCKET_TIMEOUT, TcpStream::connect(target)).await {
            Ok(Ok(_stream)) => {
                tracing::info!(host, port, "Successful connection to socket");
                true
            }
            Ok(Err(err)) => {
                tracing::warn!(host, port, error = %err, "Failed connection to socket");
                false
            }
            Err(_) => {
                tracing::warn!(host, port, "Socket connection timed out");
                false
            }
        }
    }

    pub(crate) async fn check_web(&self, host: &str, port: u16, path: &str) -> bool {
        let url = web_url(host, port, path).await;
        match self.http.get(&url).send().await {
            Ok(response) if response.status() == StatusCode::OK => {
                tracing::info!(url = %url, "Web check returned 200");
                true
            }
            Ok(response) => {
                tracing::warn!(url = %url, status = response.status().as_u16(), "Web check failed");
                false
            }
            Err(err) => {
                tracing::warn!(url = %url, error = %err, "Web request failed");
                false
            }
        }
    }
}

#[async_trait]
impl ServiceProbe for NetworkProbe {
    async fn check(&self, service: &ServiceDescriptor) -> bool {
        let reachable = match &service.check {
            ServiceCheck::Ping => self.check_ping(&service.host).await,
            ServiceCheck::Socket { port } => self.check_socket(&service.host, *port).await,
            ServiceCheck::Web { port, path } => self.check_web(&service.host, *port, path).await,
        };

        metrics::record_service_check(service.check.kind(), reachable);
        if reachable {
            tracing::info!(service = %service.name, host = %service.host, "Service available");
        } else {
            tracing::warn!(service = %service.name, host = %service.host, "Service unavailable");
        }
        reachable
    }
}
