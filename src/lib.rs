//! dnsrelay
//!
//! A caching DNS relay. Queries are answered from a static hosts table or an
//! LRU answer cache when possible, and forwarded to an upstream resolver
//! otherwise, with transaction ids translated so that any number of clients
//! can share one upstream socket.
//!
//! # Architecture
//!
//! * `dns::buffer` and `dns::protocol` - the wire format codec
//! * `dns::cache` - the LRU answer cache with per-address TTLs
//! * `dns::translator` - transaction id translation for forwarded queries
//! * `dns::hosts` - the static hosts table
//! * `dns::relay` - decides how each datagram is answered
//! * `dns::server` - the UDP loops feeding the relay

/// DNS relay implementation and protocol handling
pub mod dns;
