//! the relay core: decides how each datagram is answered
//!
//! `DnsRelay` owns the cache, the hosts table and the id translator, and
//! never touches a socket. The server loop hands it every datagram it reads
//! and sends whatever it returns.

use std::net::{Ipv4Addr, SocketAddr};

use chrono::{DateTime, Duration, Local};
use serde_derive::{Deserialize, Serialize};

use crate::dns::cache::{CacheStats, DnsCache};
use crate::dns::hosts::HostsTable;
use crate::dns::protocol::{DnsPacket, QueryType, ResultCode, CLASS_IN, UDP_RESPONSE_LIMIT};
use crate::dns::query_log::{LoggedAnswer, QueryLog};
use crate::dns::translator::IdTranslator;

/// A datagram the relay wants sent
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outgoing {
    /// An answer for a client
    Client(SocketAddr, Vec<u8>),
    /// A query to forward to the upstream resolver
    Upstream(Vec<u8>),
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayStatistics {
    pub queries: usize,
    pub malformed: usize,
    pub cache_hits: usize,
    pub hosts_hits: usize,
    pub blocked: usize,
    pub forwarded: usize,
    pub translator_full: usize,
    pub upstream_replies: usize,
    pub unmatched_replies: usize,
}

pub struct DnsRelay {
    cache: DnsCache,
    hosts: HostsTable,
    translator: IdTranslator,
    query_log: Option<QueryLog>,
    answer_ttl: u32,
    cleanup_interval: Duration,
    last_cleanup: DateTime<Local>,
    statistics: RelayStatistics,
}

impl DnsRelay {
    pub fn new(cache: DnsCache, hosts: HostsTable, translator: IdTranslator) -> DnsRelay {
        DnsRelay {
            cache,
            hosts,
            translator,
            query_log: None,
            answer_ttl: crate::dns::context::DEFAULT_ANSWER_TTL,
            cleanup_interval: Duration::seconds(crate::dns::context::DEFAULT_CLEANUP_INTERVAL),
            last_cleanup: Local::now(),
            statistics: RelayStatistics::default(),
        }
    }

    pub fn with_query_log(mut self, query_log: QueryLog) -> DnsRelay {
        self.query_log = Some(query_log);
        self
    }

    pub fn with_answer_ttl(mut self, ttl: u32) -> DnsRelay {
        self.answer_ttl = ttl;
        self
    }

    pub fn with_cleanup_interval(mut self, interval: Duration) -> DnsRelay {
        self.cleanup_interval = interval;
        self
    }

    pub fn cache(&self) -> &DnsCache {
        &self.cache
    }

    pub fn hosts(&self) -> &HostsTable {
        &self.hosts
    }

    pub fn translator(&self) -> &IdTranslator {
        &self.translator
    }

    pub fn statistics(&self) -> &RelayStatistics {
        &self.statistics
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.get_stats()
    }

    pub fn handle_query(&mut self, data: &[u8], client: SocketAddr) -> Option<Outgoing> {
        self.handle_query_at(data, client, Local::now())
    }

    /// Handles a datagram received from a client
    ///
    /// A queries are answered from the cache, then from the hosts table.
    /// Blocked names get NXDOMAIN whatever the query type. Everything else is
    /// forwarded upstream under a freshly issued id. Datagrams that do not
    /// parse as a query are dropped.
    pub fn handle_query_at(
        &mut self,
        data: &[u8],
        client: SocketAddr,
        now: DateTime<Local>,
    ) -> Option<Outgoing> {
        self.statistics.queries += 1;

        let request = match DnsPacket::from_bytes(data) {
            Ok(x) => x,
            Err(e) => {
                log::debug!("Dropping malformed query from {}: {}", client, e);
                self.statistics.malformed += 1;
                return None;
            }
        };

        if log::log_enabled!(log::Level::Debug) {
            log::debug!("Query from {}", client);
            request.print();
        }

        if request.header.response {
            log::debug!("Dropping response packet received on the query socket from {}", client);
            self.statistics.malformed += 1;
            return None;
        }

        let question = match request.questions.first() {
            Some(x) => x.clone(),
            None => {
                log::debug!("Dropping query without questions from {}", client);
                self.statistics.malformed += 1;
                return None;
            }
        };

        if question.qclass == CLASS_IN {
            if question.qtype == QueryType::A {
                if let Some(addrs) = self.cache.lookup_at(&question.name, now) {
                    if !addrs.is_empty() {
                        log::info!("{} answered from cache", question.name);
                        self.statistics.cache_hits += 1;
                        return self.answer(&request, client, &addrs);
                    }
                }
            }

            if let Some(addrs) = self.hosts.query(&question.name) {
                if addrs.iter().any(|x| x.is_unspecified()) {
                    log::info!("{} is blocked", question.name);
                    self.statistics.blocked += 1;
                    return self.answer(&request, client, &addrs);
                }

                if question.qtype == QueryType::A && !addrs.is_empty() {
                    log::info!("{} answered from hosts table", question.name);
                    self.statistics.hosts_hits += 1;
                    return self.answer(&request, client, &addrs);
                }
            }
        }

        let new_id = match self
            .translator
            .allocate_at(request.header.id, client, now)
        {
            Some(x) => x,
            None => {
                log::warn!(
                    "No free transaction ids, dropping query for {} from {}",
                    question.name,
                    client
                );
                self.statistics.translator_full += 1;
                return None;
            }
        };

        log::info!(
            "Forwarding {} ({:?}) for {} as id {}",
            question.name,
            question.qtype,
            client,
            new_id
        );
        self.statistics.forwarded += 1;

        let mut forward = data.to_vec();
        set_id(&mut forward, new_id);

        Some(Outgoing::Upstream(forward))
    }

    pub fn handle_upstream(&mut self, data: &[u8]) -> Option<Outgoing> {
        self.handle_upstream_at(data, Local::now())
    }

    /// Handles a datagram received from the upstream resolver
    ///
    /// The reply is matched to its client through the id translator and
    /// relayed byte for byte, with only the id put back. A records in a
    /// successful A reply are cached under the question name.
    pub fn handle_upstream_at(&mut self, data: &[u8], now: DateTime<Local>) -> Option<Outgoing> {
        if data.len() < 2 {
            log::debug!("Dropping {} byte upstream datagram", data.len());
            self.statistics.unmatched_replies += 1;
            return None;
        }

        let id = ((data[0] as u16) << 8) | (data[1] as u16);

        let pending = match self.translator.resolve(id) {
            Some(x) => x,
            None => {
                log::debug!("Dropping upstream reply with unknown id {}", id);
                self.statistics.unmatched_replies += 1;
                return None;
            }
        };

        self.statistics.upstream_replies += 1;

        let mut reply = data.to_vec();
        set_id(&mut reply, pending.original_id);

        match DnsPacket::from_bytes(data) {
            Ok(packet) => {
                if log::log_enabled!(log::Level::Debug) {
                    log::debug!("Reply for {}", pending.client);
                    packet.print();
                }

                self.learn(&packet, now);
            }
            Err(e) => {
                log::debug!("Relaying unparseable reply for {}: {}", pending.client, e);
            }
        }

        Some(Outgoing::Client(pending.client, reply))
    }

    pub fn clean_expired(&mut self) -> usize {
        self.clean_expired_at(Local::now())
    }

    /// Sweeps expired cache entries if the cleanup interval has passed since
    /// the previous sweep. Returns the number of entries removed.
    pub fn clean_expired_at(&mut self, now: DateTime<Local>) -> usize {
        if now - self.last_cleanup < self.cleanup_interval {
            return 0;
        }
        self.last_cleanup = now;

        let removed = self.cache.clean_expired_at(now);

        let stats = self.cache.get_stats();
        log::info!(
            "Cache sweep removed {} entries, {}/{} in use, {} hits, {} misses, {} ids outstanding",
            removed,
            stats.total_entries,
            stats.capacity,
            stats.hits,
            stats.misses,
            self.translator.occupied_at(now)
        );

        removed
    }

    fn answer(
        &mut self,
        request: &DnsPacket,
        client: SocketAddr,
        addrs: &[Ipv4Addr],
    ) -> Option<Outgoing> {
        let mut response = DnsPacket::build_response(request, addrs, self.answer_ttl);

        let bytes = match response.to_bytes(UDP_RESPONSE_LIMIT) {
            Ok(x) => x,
            Err(e) => {
                log::warn!("Failed to build response for {}: {}", client, e);
                return None;
            }
        };

        if let (Some(query_log), Some(question), Some(addr)) = (
            self.query_log.as_mut(),
            request.questions.first(),
            addrs.first(),
        ) {
            query_log.record(&question.name, LoggedAnswer::Address(*addr));
        }

        Some(Outgoing::Client(client, bytes))
    }

    fn learn(&mut self, packet: &DnsPacket, now: DateTime<Local>) {
        let question = match packet.questions.first() {
            Some(x) => x,
            None => return,
        };

        let cacheable = packet.header.rescode == ResultCode::NOERROR
            && question.qtype == QueryType::A
            && question.qclass == CLASS_IN;

        let addrs: Vec<(Ipv4Addr, Option<u32>)> = if cacheable {
            packet
                .get_a_records()
                .into_iter()
                .map(|(addr, ttl)| (addr, Some(ttl)))
                .collect()
        } else {
            Vec::new()
        };

        if !addrs.is_empty() {
            let stored = self
                .cache
                .store_at(&question.name, &addrs, self.answer_ttl, now);
            log::info!("Cached {} addresses for {}", stored, question.name);
        }

        if let Some(ref mut query_log) = self.query_log {
            let answer = match addrs.first() {
                Some(&(addr, _)) => LoggedAnswer::Address(addr),
                None => LoggedAnswer::Remote,
            };
            query_log.record(&question.name, answer);
        }
    }
}

fn set_id(data: &mut [u8], id: u16) {
    if data.len() >= 2 {
        data[0] = (id >> 8) as u8;
        data[1] = (id & 0xFF) as u8;
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    use crate::dns::protocol::{DnsQuestion, DnsRecord, TransientTtl};

    fn client() -> SocketAddr {
        SocketAddr::from(([192, 168, 1, 20], 40000))
    }

    fn query(id: u16, name: &str, qtype: QueryType) -> Vec<u8> {
        let mut packet = DnsPacket::new();
        packet.header.id = id;
        packet.header.recursion_desired = true;
        packet
            .questions
            .push(DnsQuestion::new(name.to_string(), qtype));

        packet.to_bytes(UDP_RESPONSE_LIMIT).unwrap()
    }

    fn upstream_reply(id: u16, name: &str, addrs: &[(Ipv4Addr, u32)]) -> Vec<u8> {
        let mut packet = DnsPacket::new();
        packet.header.id = id;
        packet.header.response = true;
        packet.header.recursion_available = true;
        packet
            .questions
            .push(DnsQuestion::new(name.to_string(), QueryType::A));
        for &(addr, ttl) in addrs {
            packet.answers.push(DnsRecord::A {
                domain: name.to_string(),
                addr,
                ttl: TransientTtl(ttl),
            });
        }

        packet.to_bytes(UDP_RESPONSE_LIMIT).unwrap()
    }

    fn relay_with_hosts(entries: &[(&str, &str)]) -> DnsRelay {
        let mut hosts = HostsTable::new();
        for (domain, addr) in entries {
            hosts.insert(domain, &[addr.parse().unwrap()], 86400);
        }

        DnsRelay::new(DnsCache::new(16), hosts, IdTranslator::new())
    }

    #[test]
    fn test_hosts_answer() {
        let mut relay = relay_with_hosts(&[("intranet.local", "10.0.0.1")]);

        let out = relay
            .handle_query(&query(0x1111, "intranet.local", QueryType::A), client())
            .unwrap();

        let (addr, bytes) = match out {
            Outgoing::Client(addr, bytes) => (addr, bytes),
            Outgoing::Upstream(_) => panic!(),
        };
        assert_eq!(client(), addr);

        let response = DnsPacket::from_bytes(&bytes).unwrap();
        assert_eq!(0x1111, response.header.id);
        assert_eq!(ResultCode::NOERROR, response.header.rescode);
        assert_eq!(
            vec![("10.0.0.1".parse().unwrap(), 4)],
            response.get_a_records()
        );
        assert_eq!(1, relay.statistics().hosts_hits);
        assert_eq!(0, relay.translator().occupied());
    }

    #[test]
    fn test_answer_echoes_raw_question() {
        let mut relay = relay_with_hosts(&[("\\255x.com", "10.0.0.7")]);

        let request = [
            0x22, 0x22, 0x01, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // header
            2, 0xFF, b'x', 3, b'c', b'o', b'm', 0, // \255x.com
            0x00, 0x01, 0x00, 0x01, // A, IN
        ];

        let bytes = match relay.handle_query(&request, client()).unwrap() {
            Outgoing::Client(_, bytes) => bytes,
            Outgoing::Upstream(_) => panic!(),
        };

        assert_eq!(&request[12..], &bytes[12..request.len()]);
        let response = DnsPacket::from_bytes(&bytes).unwrap();
        assert_eq!(
            vec![("10.0.0.7".parse().unwrap(), 4)],
            response.get_a_records()
        );
    }

    #[test]
    fn test_blocked_name() {
        let mut relay = relay_with_hosts(&[("ads.example.com", "0.0.0.0")]);

        for qtype in &[QueryType::A, QueryType::Aaaa, QueryType::Mx] {
            let out = relay
                .handle_query(&query(7, "ads.example.com", *qtype), client())
                .unwrap();

            match out {
                Outgoing::Client(_, bytes) => {
                    let response = DnsPacket::from_bytes(&bytes).unwrap();
                    assert_eq!(ResultCode::NXDOMAIN, response.header.rescode);
                    assert!(response.answers.is_empty());
                }
                Outgoing::Upstream(_) => panic!(),
            }
        }

        assert_eq!(3, relay.statistics().blocked);
        assert_eq!(0, relay.statistics().forwarded);
    }

    #[test]
    fn test_forward_and_relay_back() {
        let mut relay = relay_with_hosts(&[]);
        let now = Local::now();

        let out = relay
            .handle_query_at(&query(0xABCD, "example.com", QueryType::A), client(), now)
            .unwrap();
        let forwarded = match out {
            Outgoing::Upstream(bytes) => bytes,
            Outgoing::Client(..) => panic!(),
        };

        let new_id = ((forwarded[0] as u16) << 8) | forwarded[1] as u16;
        assert_eq!(0, new_id);
        assert_eq!(
            &query(0xABCD, "example.com", QueryType::A)[2..],
            &forwarded[2..]
        );

        let reply = upstream_reply(new_id, "example.com", &[("93.184.216.34".parse().unwrap(), 300)]);
        let out = relay.handle_upstream_at(&reply, now).unwrap();

        match out {
            Outgoing::Client(addr, bytes) => {
                assert_eq!(client(), addr);
                assert_eq!(&[0xAB, 0xCD], &bytes[0..2]);
                assert_eq!(&reply[2..], &bytes[2..]);
            }
            Outgoing::Upstream(_) => panic!(),
        }

        // The answer was learned and the next query never leaves the relay
        let out = relay
            .handle_query_at(&query(0x0102, "example.com", QueryType::A), client(), now)
            .unwrap();
        match out {
            Outgoing::Client(_, bytes) => {
                let response = DnsPacket::from_bytes(&bytes).unwrap();
                assert_eq!(0x0102, response.header.id);
                assert_eq!(
                    vec![("93.184.216.34".parse().unwrap(), 4)],
                    response.get_a_records()
                );
            }
            Outgoing::Upstream(_) => panic!(),
        }

        // A late duplicate of the reply has nowhere to go
        assert_eq!(None, relay.handle_upstream_at(&reply, now));
        assert_eq!(1, relay.statistics().cache_hits);
        assert_eq!(1, relay.statistics().unmatched_replies);
    }

    #[test]
    fn test_non_a_queries_are_forwarded() {
        let mut relay = relay_with_hosts(&[("intranet.local", "10.0.0.1")]);

        match relay.handle_query(&query(1, "intranet.local", QueryType::Aaaa), client()) {
            Some(Outgoing::Upstream(_)) => {}
            _ => panic!(),
        }
    }

    #[test]
    fn test_failed_replies_are_not_cached() {
        let mut relay = relay_with_hosts(&[]);
        let now = Local::now();

        relay.handle_query_at(&query(5, "missing.example", QueryType::A), client(), now);

        let mut packet = DnsPacket::from_bytes(&upstream_reply(0, "missing.example", &[])).unwrap();
        packet.header.rescode = ResultCode::NXDOMAIN;
        let reply = packet.to_bytes(UDP_RESPONSE_LIMIT).unwrap();

        assert!(relay.handle_upstream_at(&reply, now).is_some());
        assert!(relay.cache().is_empty());
    }

    #[test]
    fn test_unnamed_rcodes_are_not_cached() {
        let mut relay = relay_with_hosts(&[]);
        let now = Local::now();

        relay.handle_query_at(&query(6, "notauth.example", QueryType::A), client(), now);

        let mut reply = upstream_reply(0, "notauth.example", &[("10.9.9.9".parse().unwrap(), 300)]);
        // NOTAUTH
        reply[3] = (reply[3] & 0xF0) | 9;

        let out = relay.handle_upstream_at(&reply, now).unwrap();
        match out {
            Outgoing::Client(_, bytes) => assert_eq!(9, bytes[3] & 0x0F),
            _ => panic!(),
        }
        assert!(relay.cache().is_empty());
    }

    #[test]
    fn test_drops_garbage() {
        let mut relay = relay_with_hosts(&[]);

        assert_eq!(None, relay.handle_query(&[0x12, 0x34, 0x01], client()));
        assert_eq!(None, relay.handle_query(&[], client()));

        // Responses and question-less packets are not queries
        let mut response = DnsPacket::from_bytes(&query(9, "example.com", QueryType::A)).unwrap();
        response.header.response = true;
        let bytes = response.to_bytes(UDP_RESPONSE_LIMIT).unwrap();
        assert_eq!(None, relay.handle_query(&bytes, client()));

        let empty = DnsPacket::new().to_bytes(UDP_RESPONSE_LIMIT).unwrap();
        assert_eq!(None, relay.handle_query(&empty, client()));

        assert_eq!(None, relay.handle_upstream(&[0x00]));
        assert_eq!(4, relay.statistics().malformed);
        assert_eq!(0, relay.translator().occupied());
    }

    #[test]
    fn test_translator_full_drops_query() {
        let translator = IdTranslator::with_capacity(1, Duration::seconds(4)).unwrap();
        let mut relay = DnsRelay::new(DnsCache::new(4), HostsTable::new(), translator);
        let now = Local::now();

        assert!(relay
            .handle_query_at(&query(1, "a.com", QueryType::A), client(), now)
            .is_some());
        assert_eq!(
            None,
            relay.handle_query_at(&query(2, "b.com", QueryType::A), client(), now)
        );
        assert_eq!(1, relay.statistics().translator_full);
    }

    #[test]
    fn test_cleanup_interval() {
        let mut relay = relay_with_hosts(&[]).with_cleanup_interval(Duration::seconds(60));
        let now = Local::now();

        relay.handle_query_at(&query(5, "short.example", QueryType::A), client(), now);
        let reply = upstream_reply(0, "short.example", &[("10.0.0.1".parse().unwrap(), 5)]);
        relay.handle_upstream_at(&reply, now).unwrap();
        assert_eq!(1, relay.cache().len());

        // Not due yet, even though the entry has expired
        assert_eq!(0, relay.clean_expired_at(now + Duration::seconds(10)));
        assert_eq!(1, relay.cache().len());

        assert_eq!(1, relay.clean_expired_at(now + Duration::seconds(61)));
        assert!(relay.cache().is_empty());
    }
}
