//! Egress router configuration.
//!
//! Read once at startup from the environment; never reloaded.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};

use crate::relay::{
    ListenerConfig, ListenerSpec, DEFAULT_HALF_CLOSE_TIMEOUT, DEFAULT_MAX_CONNECTIONS,
    MAX_CONNECTIONS_LIMIT,
};

/// Listeners used when `EGRESS_LISTENERS` is unset.
pub const DEFAULT_LISTENERS: &str = "HTTPS@8080=443,HTTP@8081=80";

/// Protocol label for listener entries that do not name one.
pub const DEFAULT_PROTOCOL_LABEL: &str = "TCP";

/// Process identity used when none is configured.
pub const DEFAULT_SERVER_NAME: &str = "unknown-egress-router";

/// Egress router configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    /// Process identity attached to every log record.
    pub server_name: String,

    /// Listener-to-destination mappings.
    pub listeners: Vec<ListenerSpec>,

    /// Address every listener binds on.
    pub bind_ip: IpAddr,

    /// Per-listener cap on concurrently bridged connections.
    pub max_connections: usize,

    /// Destination dial timeout.
    pub connect_timeout: Duration,

    /// Idle window for the surviving direction after a half-close.
    pub half_close_timeout: Duration,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let server_name = lookup("EGRESS_SERVER_NAME")
            .or_else(|| lookup("SERVER_NAME"))
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_SERVER_NAME.to_string());

        let destination_host = lookup("EGRESS_DESTINATION_HOST").filter(|h| !h.trim().is_empty());

        let raw_listeners =
            lookup("EGRESS_LISTENERS").unwrap_or_else(|| DEFAULT_LISTENERS.to_string());
        let listeners = parse_listeners(&raw_listeners, destination_host.as_deref())
            .context("EGRESS_LISTENERS is invalid.")?;

        let bind_ip = lookup("EGRESS_BIND_IP")
            .map(|v| v.parse())
            .transpose()
            .context("EGRESS_BIND_IP must be an IP address.")?
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));

        let max_connections: usize = lookup("EGRESS_MAX_CONNECTIONS")
            .map(|v| v.parse())
            .transpose()
            .context("EGRESS_MAX_CONNECTIONS must be an integer.")?
            .unwrap_or(DEFAULT_MAX_CONNECTIONS)
            .max(1);
        if max_connections > MAX_CONNECTIONS_LIMIT {
            bail!(
                "EGRESS_MAX_CONNECTIONS must be at most {} (got {}).",
                MAX_CONNECTIONS_LIMIT,
                max_connections
            );
        }

        let connect_timeout_ms: u64 = lookup("EGRESS_CONNECT_TIMEOUT_MS")
            .map(|v| v.parse())
            .transpose()
            .context("EGRESS_CONNECT_TIMEOUT_MS must be an integer (milliseconds).")?
            .unwrap_or(10_000);
        let connect_timeout = Duration::from_millis(connect_timeout_ms.max(1));

        let half_close_timeout_ms: u64 = lookup("EGRESS_HALF_CLOSE_TIMEOUT_MS")
            .map(|v| v.parse())
            .transpose()
            .context("EGRESS_HALF_CLOSE_TIMEOUT_MS must be an integer (milliseconds).")?
            .unwrap_or(DEFAULT_HALF_CLOSE_TIMEOUT.as_millis() as u64);
        let half_close_timeout = Duration::from_millis(half_close_timeout_ms.max(1));

        let log_level = lookup("EGRESS_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            server_name,
            listeners,
            bind_ip,
            max_connections,
            connect_timeout,
            half_close_timeout,
            log_level,
        })
    }

    /// Listener tuning derived from this configuration.
    pub fn listener_config(&self) -> ListenerConfig {
        ListenerConfig {
            bind_ip: self.bind_ip,
            max_connections: self.max_connections,
            connect_timeout: self.connect_timeout,
            half_close_timeout: self.half_close_timeout,
            ..ListenerConfig::new()
        }
    }
}

/// Parse a comma-separated list of `[label@]listen_port=[host:]dest_port`.
///
/// Entries without a host use `default_host`.
pub fn parse_listeners(raw: &str, default_host: Option<&str>) -> Result<Vec<ListenerSpec>> {
    let mut specs = Vec::new();
    let mut seen_ports = HashSet::new();

    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let spec = parse_listener(entry, default_host)
            .with_context(|| format!("invalid listener entry '{}'", entry))?;
        if !seen_ports.insert(spec.listen_port) {
            bail!("listen port {} is configured more than once", spec.listen_port);
        }
        specs.push(spec);
    }

    if specs.is_empty() {
        bail!("no listeners configured");
    }

    Ok(specs)
}

fn parse_listener(entry: &str, default_host: Option<&str>) -> Result<ListenerSpec> {
    let (label, mapping) = match entry.split_once('@') {
        Some((label, mapping)) => (label.trim(), mapping),
        None => (DEFAULT_PROTOCOL_LABEL, entry),
    };
    if label.is_empty() {
        bail!("protocol label is empty");
    }

    let (listen, target) = mapping
        .split_once('=')
        .ok_or_else(|| anyhow!("expected listen_port=[host:]dest_port"))?;

    let listen_port = parse_port(listen).context("bad listen port")?;

    let (host, destination_port) = match target.trim().rsplit_once(':') {
        Some((host, port)) => {
            let host = host.trim().trim_start_matches('[').trim_end_matches(']');
            if host.is_empty() {
                bail!("destination host is empty");
            }
            (host.to_string(), parse_port(port).context("bad destination port")?)
        }
        None => {
            let host = default_host.ok_or_else(|| {
                anyhow!("no destination host; set EGRESS_DESTINATION_HOST or use host:port")
            })?;
            (host.to_string(), parse_port(target).context("bad destination port")?)
        }
    };

    Ok(ListenerSpec::new(listen_port, host, destination_port, label))
}

fn parse_port(raw: &str) -> Result<u16> {
    let port: u16 = raw.trim().parse()?;
    if port == 0 {
        bail!("port must be non-zero");
    }
    Ok(port)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_listeners() {
        let config =
            Config::from_lookup(lookup_from(&[("EGRESS_DESTINATION_HOST", "44.207.188.95")]))
                .unwrap();

        assert_eq!(config.server_name, DEFAULT_SERVER_NAME);
        assert_eq!(
            config.listeners,
            vec![
                ListenerSpec::new(8080, "44.207.188.95", 443, "HTTPS"),
                ListenerSpec::new(8081, "44.207.188.95", 80, "HTTP"),
            ]
        );
        assert_eq!(config.max_connections, DEFAULT_MAX_CONNECTIONS);
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_server_name_fallback() {
        let config = Config::from_lookup(lookup_from(&[
            ("SERVER_NAME", "egress-a"),
            ("EGRESS_DESTINATION_HOST", "10.0.0.1"),
        ]))
        .unwrap();
        assert_eq!(config.server_name, "egress-a");

        let config = Config::from_lookup(lookup_from(&[
            ("SERVER_NAME", "egress-a"),
            ("EGRESS_SERVER_NAME", "egress-b"),
            ("EGRESS_DESTINATION_HOST", "10.0.0.1"),
        ]))
        .unwrap();
        assert_eq!(config.server_name, "egress-b");
    }

    #[test]
    fn test_missing_destination_host() {
        let err = Config::from_lookup(lookup_from(&[])).unwrap_err();
        assert!(format!("{:#}", err).contains("EGRESS_DESTINATION_HOST"));
    }

    #[test]
    fn test_explicit_hosts_need_no_default() {
        let specs = parse_listeners("9000=db.internal:5432, SMTP@2525=[::1]:25", None).unwrap();
        assert_eq!(
            specs,
            vec![
                ListenerSpec::new(9000, "db.internal", 5432, DEFAULT_PROTOCOL_LABEL),
                ListenerSpec::new(2525, "::1", 25, "SMTP"),
            ]
        );
    }

    #[test]
    fn test_rejects_bad_entries() {
        assert!(parse_listeners("8080", Some("h")).is_err());
        assert!(parse_listeners("8080=0", Some("h")).is_err());
        assert!(parse_listeners("x=443", Some("h")).is_err());
        assert!(parse_listeners("@8080=443", Some("h")).is_err());
        assert!(parse_listeners("8080=:443", Some("h")).is_err());
        assert!(parse_listeners(" , ", Some("h")).is_err());
        assert!(parse_listeners("8080=443,8080=80", Some("h")).is_err());
    }

    #[test]
    fn test_numeric_overrides() {
        let config = Config::from_lookup(lookup_from(&[
            ("EGRESS_DESTINATION_HOST", "10.0.0.1"),
            ("EGRESS_MAX_CONNECTIONS", "0"),
            ("EGRESS_CONNECT_TIMEOUT_MS", "250"),
            ("EGRESS_BIND_IP", "127.0.0.1"),
            ("EGRESS_HALF_CLOSE_TIMEOUT_MS", "1500"),
        ]))
        .unwrap();
        assert_eq!(config.max_connections, 1);
        assert_eq!(config.connect_timeout, Duration::from_millis(250));
        assert_eq!(config.half_close_timeout, Duration::from_millis(1500));

        let listener_config = config.listener_config();
        assert_eq!(listener_config.bind_ip.to_string(), "127.0.0.1");
        assert_eq!(listener_config.max_connections, 1);
        assert_eq!(listener_config.half_close_timeout, Duration::from_millis(1500));

        assert!(Config::from_lookup(lookup_from(&[
            ("EGRESS_DESTINATION_HOST", "10.0.0.1"),
            ("EGRESS_MAX_CONNECTIONS", "many"),
        ]))
        .is_err());
    }

    #[test]
    fn test_connection_cap_upper_bound() {
        let at_limit = MAX_CONNECTIONS_LIMIT.to_string();
        let config = Config::from_lookup(lookup_from(&[
            ("EGRESS_DESTINATION_HOST", "10.0.0.1"),
            ("EGRESS_MAX_CONNECTIONS", at_limit.as_str()),
        ]))
        .unwrap();
        assert_eq!(config.max_connections, MAX_CONNECTIONS_LIMIT);

        let too_many = usize::MAX.to_string();
        let err = Config::from_lookup(lookup_from(&[
            ("EGRESS_DESTINATION_HOST", "10.0.0.1"),
            ("EGRESS_MAX_CONNECTIONS", too_many.as_str()),
        ]))
        .unwrap_err();
        assert!(format!("{:#}", err).contains("EGRESS_MAX_CONNECTIONS must be at most"));
    }
}
