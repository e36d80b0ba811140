//! static host overrides
//!
//! The hosts file maps domains to fixed addresses that are answered locally
//! without ever going upstream. A domain mapped to `0.0.0.0` is blocked.
//!
//! The file holds one `<IPv4> <domain>` pair per line. Consecutive lines for
//! the same domain are merged into one multi-address entry:
//!
//! ```text
//! # ad servers
//! 0.0.0.0     ads.example.com
//!
//! 10.0.0.1    intranet.local
//! 10.0.0.2    intranet.local
//! ```

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::net::Ipv4Addr;
use std::path::Path;

use derive_more::{Display, Error, From};
use serde_derive::{Deserialize, Serialize};

use crate::dns::cache::MAX_ADDRS_PER_DOMAIN;

/// TTL given to every address read from the hosts file
pub const HOSTS_TTL: u32 = 86400;

#[derive(Debug, Display, From, Error)]
pub enum HostsError {
    Io(std::io::Error),
}

type Result<T> = std::result::Result<T, HostsError>;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostAddr {
    pub addr: Ipv4Addr,
    pub ttl: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostsSummary {
    /// Lines that contributed an address
    pub records: usize,
    /// Domains in the table after loading
    pub domains: usize,
    /// Lines that could not be used
    pub skipped: usize,
}

#[derive(Clone, Debug, Default)]
pub struct HostsTable {
    entries: HashMap<String, Vec<HostAddr>>,
}

impl HostsTable {
    pub fn new() -> HostsTable {
        HostsTable::default()
    }

    /// Reads a hosts file from disk
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<(HostsTable, HostsSummary)> {
        let file = File::open(path)?;

        let mut table = HostsTable::new();
        let summary = table.load(BufReader::new(file))?;

        Ok((table, summary))
    }

    /// Adds the entries read from `reader` to the table
    pub fn load<R: BufRead>(&mut self, reader: R) -> Result<HostsSummary> {
        let mut summary = HostsSummary::default();

        let mut current_domain: Option<String> = None;
        let mut current_addrs: Vec<Ipv4Addr> = Vec::new();

        for (lineno, line) in reader.lines().enumerate() {
            let line = line?;

            let content = match line.find('#') {
                Some(pos) => &line[..pos],
                None => &line[..],
            };

            let tokens: Vec<&str> = content.split_whitespace().collect();
            if tokens.is_empty() {
                continue;
            }

            if tokens.len() != 2 {
                log::warn!(
                    "hosts line {}: expected `<address> <domain>`, got {:?}",
                    lineno + 1,
                    content.trim()
                );
                summary.skipped += 1;
                continue;
            }

            let addr = match tokens[0].parse::<Ipv4Addr>() {
                Ok(addr) => addr,
                Err(_) => {
                    log::warn!(
                        "hosts line {}: invalid address {:?}",
                        lineno + 1,
                        tokens[0]
                    );
                    summary.skipped += 1;
                    continue;
                }
            };

            let domain = normalize(tokens[1]);

            if current_domain.as_ref() != Some(&domain) {
                if let Some(prev) = current_domain.take() {
                    self.insert(&prev, &current_addrs, HOSTS_TTL);
                }
                current_domain = Some(domain);
                current_addrs.clear();
            }

            current_addrs.push(addr);
            summary.records += 1;
        }

        if let Some(prev) = current_domain.take() {
            self.insert(&prev, &current_addrs, HOSTS_TTL);
        }

        summary.domains = self.entries.len();

        Ok(summary)
    }

    /// Sets the addresses for `domain`, replacing any existing entry, and
    /// returns how many were kept
    pub fn insert(&mut self, domain: &str, addrs: &[Ipv4Addr], ttl: u32) -> usize {
        let domain = normalize(domain);

        if addrs.len() > MAX_ADDRS_PER_DOMAIN {
            log::warn!(
                "Keeping {} of {} host addresses for {}",
                MAX_ADDRS_PER_DOMAIN,
                addrs.len(),
                domain
            );
        }

        let entry: Vec<HostAddr> = addrs
            .iter()
            .take(MAX_ADDRS_PER_DOMAIN)
            .map(|&addr| HostAddr { addr, ttl })
            .collect();
        let kept = entry.len();

        self.entries.insert(domain, entry);

        kept
    }

    pub fn get(&self, domain: &str) -> Option<&[HostAddr]> {
        self.entries
            .get(&normalize(domain))
            .map(|x| x.as_slice())
    }

    /// Addresses configured for `domain`, if any
    pub fn query(&self, domain: &str) -> Option<Vec<Ipv4Addr>> {
        self.get(domain)
            .map(|entry| entry.iter().map(|x| x.addr).collect())
    }

    pub fn is_blocked(&self, domain: &str) -> bool {
        match self.get(domain) {
            Some(entry) => entry.iter().any(|x| x.addr.is_unspecified()),
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn normalize(domain: &str) -> String {
    domain.trim_end_matches('.').to_ascii_lowercase()
}

#[cfg(test)]
mod tests {

    use super::*;

    use std::io::Cursor;

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    #[test]
    fn test_load() {
        let data = "\
# comment line
0.0.0.0 ads.example.com

10.0.0.1    intranet.local
10.0.0.2    Intranet.Local.   # trailing comment
not-an-ip   broken.local
1.2.3.4
192.168.0.1 router.lan
";

        let mut table = HostsTable::new();
        let summary = table.load(Cursor::new(data)).unwrap();

        assert_eq!(
            HostsSummary {
                records: 4,
                domains: 3,
                skipped: 2,
            },
            summary
        );

        assert_eq!(
            Some(vec![ip("10.0.0.1"), ip("10.0.0.2")]),
            table.query("intranet.local")
        );
        assert_eq!(Some(vec![ip("192.168.0.1")]), table.query("ROUTER.lan"));
        assert_eq!(None, table.query("broken.local"));

        assert!(table.is_blocked("ads.example.com"));
        assert!(!table.is_blocked("router.lan"));

        let entry = table.get("router.lan").unwrap();
        assert_eq!(HOSTS_TTL, entry[0].ttl);
    }

    #[test]
    fn test_non_consecutive_block_overwrites() {
        let data = "\
10.0.0.1 a.com
10.0.0.2 a.com
10.0.0.3 b.com
10.0.0.4 a.com
";

        let mut table = HostsTable::new();
        table.load(Cursor::new(data)).unwrap();

        assert_eq!(Some(vec![ip("10.0.0.4")]), table.query("a.com"));
        assert_eq!(Some(vec![ip("10.0.0.3")]), table.query("b.com"));
    }

    #[test]
    fn test_insert_caps_addresses() {
        let mut table = HostsTable::new();

        let addrs: Vec<Ipv4Addr> = (1..=10).map(|i| Ipv4Addr::new(10, 0, 0, i)).collect();
        assert_eq!(MAX_ADDRS_PER_DOMAIN, table.insert("big.com", &addrs, HOSTS_TTL));
        assert_eq!(MAX_ADDRS_PER_DOMAIN, table.query("big.com").unwrap().len());

        assert_eq!(1, table.insert("big.com", &[ip("1.1.1.1")], HOSTS_TTL));
        assert_eq!(Some(vec![ip("1.1.1.1")]), table.query("big.com"));
        assert_eq!(1, table.len());
    }

    #[test]
    fn test_missing_file() {
        assert!(HostsTable::from_file("/nonexistent/dnsrelay/hosts.txt").is_err());
    }
}
