//! DNS Answer Cache
//!
//! A bounded LRU store mapping domain names to the IPv4 addresses learned for
//! them from upstream answers. Each address carries its own TTL, counted from
//! the moment the entry was last stored.
//!
//! # Structure
//!
//! Entries live in an arena of slots addressed by index. The slots are linked
//! into a doubly linked list ordered by recency (head is the most recently
//! used entry, tail the least), and a hash index maps each lowercased domain
//! name to its slot. Promotion and eviction are both O(1).
//!
//! # Expiry
//!
//! Expiry is lazy. An entry stays alive while at least one of its addresses
//! is younger than its TTL. A lookup that finds every address aged out
//! removes the entry and reports a miss, and `clean_expired` sweeps the
//! whole list for entries nobody has looked at.
//!
//! The cache is not synchronized. It is owned by the relay loop, which is
//! the only code that touches it.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use chrono::{DateTime, Local};
use serde_derive::{Deserialize, Serialize};

/// Default number of domains held by the cache
pub const DEFAULT_CACHE_CAPACITY: usize = 1024;

/// Maximum number of addresses kept per domain
pub const MAX_ADDRS_PER_DOMAIN: usize = 8;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedAddr {
    pub addr: Ipv4Addr,
    pub ttl: u32,
}

impl CachedAddr {
    fn is_valid(&self, age: i64) -> bool {
        age < self.ttl as i64
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DomainEntry {
    pub domain: String,
    pub addrs: Vec<CachedAddr>,
    pub timestamp: DateTime<Local>,
    pub hits: u32,
    pub updates: u32,

    #[serde(skip)]
    prev: Option<usize>,
    #[serde(skip)]
    next: Option<usize>,
}

impl DomainEntry {
    fn age(&self, now: DateTime<Local>) -> i64 {
        // A clock stepping backwards counts as no time having passed
        (now - self.timestamp).num_seconds().max(0)
    }

    fn is_expired(&self, now: DateTime<Local>) -> bool {
        let age = self.age(now);
        !self.addrs.iter().any(|x| x.is_valid(age))
    }

    fn valid_addrs(&self, now: DateTime<Local>) -> Vec<Ipv4Addr> {
        let age = self.age(now);
        self.addrs
            .iter()
            .filter(|x| x.is_valid(age))
            .map(|x| x.addr)
            .collect()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub total_entries: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
}

pub struct DnsCache {
    slots: Vec<Option<DomainEntry>>,
    free_slots: Vec<usize>,
    index: HashMap<String, usize>,
    head: Option<usize>,
    tail: Option<usize>,
    capacity: usize,

    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
}

impl Default for DnsCache {
    fn default() -> Self {
        DnsCache::new(DEFAULT_CACHE_CAPACITY)
    }
}

impl DnsCache {
    /// Creates a cache holding at most `capacity` domains. A capacity of
    /// zero is raised to one.
    pub fn new(capacity: usize) -> DnsCache {
        let capacity = capacity.max(1);

        DnsCache {
            slots: Vec::with_capacity(capacity),
            free_slots: Vec::new(),
            index: HashMap::with_capacity(2 * capacity),
            head: None,
            tail: None,
            capacity,
            hits: 0,
            misses: 0,
            evictions: 0,
            expirations: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Checks for an entry without promoting it or testing its expiry
    pub fn contains(&self, qname: &str) -> bool {
        self.index.contains_key(&qname.to_ascii_lowercase())
    }

    pub fn lookup(&mut self, qname: &str) -> Option<Vec<Ipv4Addr>> {
        self.lookup_at(qname, Local::now())
    }

    /// Returns the addresses of `qname` that are still within their TTL
    ///
    /// A hit moves the entry to the head of the recency list. An entry whose
    /// addresses have all expired is removed and reported as a miss.
    pub fn lookup_at(&mut self, qname: &str, now: DateTime<Local>) -> Option<Vec<Ipv4Addr>> {
        let key = qname.to_ascii_lowercase();

        let idx = match self.index.get(&key) {
            Some(&idx) => idx,
            None => {
                self.misses += 1;
                return None;
            }
        };

        let expired = match self.slots[idx] {
            Some(ref entry) => entry.is_expired(now),
            None => true,
        };

        if expired {
            log::debug!("Cache entry for {} has expired", key);
            self.remove(idx);
            self.expirations += 1;
            self.misses += 1;
            return None;
        }

        self.detach(idx);
        self.push_front(idx);

        let entry = self.slots[idx].as_mut()?;
        entry.hits += 1;
        self.hits += 1;

        Some(entry.valid_addrs(now))
    }

    pub fn store(
        &mut self,
        qname: &str,
        addrs: &[(Ipv4Addr, Option<u32>)],
        default_ttl: u32,
    ) -> usize {
        self.store_at(qname, addrs, default_ttl, Local::now())
    }

    /// Stores the addresses learned for `qname`, replacing whatever was
    /// cached for it before
    ///
    /// Addresses without a TTL of their own get `default_ttl`. At most
    /// `MAX_ADDRS_PER_DOMAIN` addresses are kept and the number actually
    /// stored is returned. Storing a new domain into a full cache evicts the
    /// least recently used entry first.
    pub fn store_at(
        &mut self,
        qname: &str,
        addrs: &[(Ipv4Addr, Option<u32>)],
        default_ttl: u32,
        now: DateTime<Local>,
    ) -> usize {
        if addrs.is_empty() {
            return 0;
        }

        let key = qname.to_ascii_lowercase();

        if addrs.len() > MAX_ADDRS_PER_DOMAIN {
            log::warn!(
                "Keeping {} of {} addresses for {}",
                MAX_ADDRS_PER_DOMAIN,
                addrs.len(),
                key
            );
        }

        let cached: Vec<CachedAddr> = addrs
            .iter()
            .take(MAX_ADDRS_PER_DOMAIN)
            .map(|&(addr, ttl)| CachedAddr {
                addr,
                ttl: ttl.unwrap_or(default_ttl),
            })
            .collect();
        let stored = cached.len();

        if let Some(&idx) = self.index.get(&key) {
            if let Some(ref mut entry) = self.slots[idx] {
                entry.addrs = cached;
                entry.timestamp = now;
                entry.updates += 1;
            }

            self.detach(idx);
            self.push_front(idx);

            return stored;
        }

        if self.index.len() >= self.capacity {
            if let Some(tail) = self.tail {
                if let Some(evicted) = self.remove(tail) {
                    log::debug!("Evicting {} from cache", evicted.domain);
                }
                self.evictions += 1;
            }
        }

        let entry = DomainEntry {
            domain: key.clone(),
            addrs: cached,
            timestamp: now,
            hits: 0,
            updates: 1,
            prev: None,
            next: None,
        };

        let idx = match self.free_slots.pop() {
            Some(idx) => {
                self.slots[idx] = Some(entry);
                idx
            }
            None => {
                self.slots.push(Some(entry));
                self.slots.len() - 1
            }
        };

        self.index.insert(key, idx);
        self.push_front(idx);

        stored
    }

    pub fn clean_expired(&mut self) -> usize {
        self.clean_expired_at(Local::now())
    }

    /// Removes every entry whose addresses have all expired, returning how
    /// many were dropped
    pub fn clean_expired_at(&mut self, now: DateTime<Local>) -> usize {
        let mut removed = 0;
        let mut cursor = self.head;

        while let Some(idx) = cursor {
            let (next, expired) = match self.slots[idx] {
                Some(ref entry) => (entry.next, entry.is_expired(now)),
                None => break,
            };

            if expired {
                self.remove(idx);
                removed += 1;
            }

            cursor = next;
        }

        self.expirations += removed as u64;

        removed
    }

    pub fn get_stats(&self) -> CacheStats {
        CacheStats {
            total_entries: self.len(),
            capacity: self.capacity,
            hits: self.hits,
            misses: self.misses,
            evictions: self.evictions,
            expirations: self.expirations,
        }
    }

    /// Entries from most to least recently used
    pub fn list(&self) -> Vec<&DomainEntry> {
        let mut list = Vec::with_capacity(self.len());
        let mut cursor = self.head;

        while let Some(idx) = cursor {
            match self.slots[idx] {
                Some(ref entry) => {
                    list.push(entry);
                    cursor = entry.next;
                }
                None => break,
            }
        }

        list
    }

    fn remove(&mut self, idx: usize) -> Option<DomainEntry> {
        self.detach(idx);

        let entry = self.slots[idx].take()?;
        self.index.remove(&entry.domain);
        self.free_slots.push(idx);

        Some(entry)
    }

    fn detach(&mut self, idx: usize) {
        let (prev, next) = match self.slots[idx] {
            Some(ref mut entry) => (entry.prev.take(), entry.next.take()),
            None => return,
        };

        match prev {
            Some(p) => {
                if let Some(ref mut entry) = self.slots[p] {
                    entry.next = next;
                }
            }
            None => {
                if self.head == Some(idx) {
                    self.head = next;
                }
            }
        }

        match next {
            Some(n) => {
                if let Some(ref mut entry) = self.slots[n] {
                    entry.prev = prev;
                }
            }
            None => {
                if self.tail == Some(idx) {
                    self.tail = prev;
                }
            }
        }
    }

    fn push_front(&mut self, idx: usize) {
        let old_head = self.head;

        if let Some(ref mut entry) = self.slots[idx] {
            entry.prev = None;
            entry.next = old_head;
        }

        if let Some(h) = old_head {
            if let Some(ref mut entry) = self.slots[h] {
                entry.prev = Some(idx);
            }
        }

        self.head = Some(idx);
        if self.tail.is_none() {
            self.tail = Some(idx);
        }
    }
}
