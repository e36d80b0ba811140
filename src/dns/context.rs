//! `RelayConfig` holds the settings the relay is started with

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use chrono::Duration;
use derive_more::{Display, Error, From};

use crate::dns::cache::{DnsCache, DEFAULT_CACHE_CAPACITY};
use crate::dns::hosts::HostsTable;
use crate::dns::query_log::{QueryLog, DEFAULT_QUERY_LOG_PATH};
use crate::dns::relay::DnsRelay;
use crate::dns::translator::{IdTranslator, DEFAULT_ID_LIFETIME, DEFAULT_TRANSLATOR_CAPACITY};

pub const DEFAULT_UPSTREAM: &str = "8.8.8.8";
pub const DEFAULT_DNS_PORT: u16 = 53;
pub const DEFAULT_HOSTS_PATH: &str = "./hosts.txt";

/// TTL put on answers the relay builds itself
pub const DEFAULT_ANSWER_TTL: u32 = 4;

/// Seconds between sweeps of expired cache entries
pub const DEFAULT_CLEANUP_INTERVAL: i64 = 60;

#[derive(Debug, Display, From, Error)]
pub enum ContextError {
    Hosts(crate::dns::hosts::HostsError),
    Translator(crate::dns::translator::TranslatorError),
    Io(std::io::Error),
    #[from(ignore)]
    #[display(fmt = "InvalidUpstream({})", _0)]
    InvalidUpstream(#[error(not(source))] String),
    #[from(ignore)]
    #[display(fmt = "InvalidMode({})", _0)]
    InvalidMode(#[error(not(source))] String),
    #[from(ignore)]
    #[display(fmt = "InvalidSetting({})", _0)]
    InvalidSetting(#[error(not(source))] String),
}

type Result<T> = std::result::Result<T, ContextError>;

/// How the server loop waits for datagrams
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LoopMode {
    /// Non-blocking sockets checked in a tight loop
    Polling,
    /// Readiness driven, sleeping until a socket has data
    EventDriven,
}

impl Default for LoopMode {
    fn default() -> Self {
        LoopMode::Polling
    }
}

impl LoopMode {
    pub fn from_arg(arg: &str) -> Result<LoopMode> {
        match arg.trim() {
            "0" => Ok(LoopMode::Polling),
            "1" => Ok(LoopMode::EventDriven),
            other => Err(ContextError::InvalidMode(other.to_string())),
        }
    }
}

/// Parses an upstream resolver given as `a.b.c.d` or `a.b.c.d:port`
pub fn parse_upstream(arg: &str) -> Result<SocketAddr> {
    let arg = arg.trim();

    if let Ok(addr) = arg.parse::<SocketAddr>() {
        return Ok(addr);
    }

    match arg.parse::<Ipv4Addr>() {
        Ok(ip) => Ok(SocketAddr::from((ip, DEFAULT_DNS_PORT))),
        Err(_) => Err(ContextError::InvalidUpstream(arg.to_string())),
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RelayConfig {
    pub upstream: SocketAddr,
    pub listen_port: u16,
    pub mode: LoopMode,
    pub hosts_path: PathBuf,
    pub query_log_path: Option<PathBuf>,
    pub cache_capacity: usize,
    pub translator_capacity: usize,
    pub id_lifetime: i64,
    pub answer_ttl: u32,
    pub cleanup_interval: i64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig {
            upstream: SocketAddr::from(([8, 8, 8, 8], DEFAULT_DNS_PORT)),
            listen_port: DEFAULT_DNS_PORT,
            mode: LoopMode::default(),
            hosts_path: PathBuf::from(DEFAULT_HOSTS_PATH),
            query_log_path: None,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            translator_capacity: DEFAULT_TRANSLATOR_CAPACITY,
            id_lifetime: DEFAULT_ID_LIFETIME,
            answer_ttl: DEFAULT_ANSWER_TTL,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
        }
    }
}

impl RelayConfig {
    pub fn new() -> RelayConfig {
        RelayConfig::default()
    }

    pub fn enable_query_log(&mut self) {
        self.query_log_path = Some(PathBuf::from(DEFAULT_QUERY_LOG_PATH));
    }

    pub fn validate(&self) -> Result<()> {
        if self.cache_capacity == 0 {
            return Err(ContextError::InvalidSetting(
                "cache capacity must be at least 1".to_string(),
            ));
        }

        if self.id_lifetime <= 0 {
            return Err(ContextError::InvalidSetting(
                "id timeout must be at least 1 second".to_string(),
            ));
        }

        if self.cleanup_interval <= 0 {
            return Err(ContextError::InvalidSetting(
                "cleanup interval must be at least 1 second".to_string(),
            ));
        }

        if self.upstream.ip().is_unspecified() || self.upstream.port() == 0 {
            return Err(ContextError::InvalidUpstream(self.upstream.to_string()));
        }

        Ok(())
    }

    /// Builds the relay, reading the hosts file from `hosts_path`
    pub fn build_relay(&self) -> Result<DnsRelay> {
        self.validate()?;

        let (hosts, summary) = HostsTable::from_file(&self.hosts_path)?;
        log::info!(
            "Loaded {} host records for {} domains from {} ({} lines skipped)",
            summary.records,
            summary.domains,
            self.hosts_path.display(),
            summary.skipped
        );

        self.build_relay_with_hosts(hosts)
    }

    /// Builds the relay around an already loaded hosts table
    pub fn build_relay_with_hosts(&self, hosts: HostsTable) -> Result<DnsRelay> {
        self.validate()?;

        let cache = DnsCache::new(self.cache_capacity);
        let translator = IdTranslator::with_capacity(
            self.translator_capacity,
            Duration::seconds(self.id_lifetime),
        )?;

        let mut relay = DnsRelay::new(cache, hosts, translator)
            .with_answer_ttl(self.answer_ttl)
            .with_cleanup_interval(Duration::seconds(self.cleanup_interval));

        if let Some(ref path) = self.query_log_path {
            relay = relay.with_query_log(QueryLog::open(path)?);
            log::info!("Writing query log to {}", path.display());
        }

        Ok(relay)
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn test_parse_upstream() {
        assert_eq!(
            SocketAddr::from(([10, 3, 9, 5], 53)),
            parse_upstream("10.3.9.5").unwrap()
        );
        assert_eq!(
            SocketAddr::from(([127, 0, 0, 1], 5353)),
            parse_upstream("127.0.0.1:5353").unwrap()
        );
        assert!(parse_upstream("dns.google").is_err());
        assert!(parse_upstream("").is_err());
    }

    #[test]
    fn test_loop_mode() {
        assert_eq!(LoopMode::Polling, LoopMode::from_arg("0").unwrap());
        assert_eq!(LoopMode::EventDriven, LoopMode::from_arg("1").unwrap());
        assert!(LoopMode::from_arg("2").is_err());
        assert!(LoopMode::from_arg("fast").is_err());
    }

    #[test]
    fn test_validate() {
        let config = RelayConfig::default();
        assert!(config.validate().is_ok());

        let mut config = RelayConfig::default();
        config.cache_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = RelayConfig::default();
        config.id_lifetime = 0;
        assert!(config.validate().is_err());

        let mut config = RelayConfig::default();
        config.upstream = SocketAddr::from(([0, 0, 0, 0], 53));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_build_relay_requires_hosts_file() {
        let mut config = RelayConfig::default();
        config.hosts_path = PathBuf::from("/nonexistent/dnsrelay/hosts.txt");

        match config.build_relay() {
            Err(ContextError::Hosts(_)) => {}
            _ => panic!(),
        }
    }

    #[test]
    fn test_build_relay_rejects_bad_translator() {
        let mut config = RelayConfig::default();
        config.translator_capacity = 0;

        match config.build_relay_with_hosts(HostsTable::new()) {
            Err(ContextError::Translator(_)) => {}
            _ => panic!(),
        }
    }
}
