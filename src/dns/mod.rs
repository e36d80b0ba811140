//! DNS Relay Implementation
//!
//! # Module Structure
//!
//! * `buffer` - Low-level packet buffer operations
//! * `protocol` - DNS protocol definitions and packet handling
//! * `cache` - LRU answer cache with TTL based expiry
//! * `translator` - Transaction id translation for forwarded queries
//! * `hosts` - Static host overrides
//! * `query_log` - Log of answered queries
//! * `context` - Relay configuration
//! * `relay` - Per datagram relay logic
//! * `server` - UDP server loops

/// Low-level buffer operations for DNS packet handling
pub mod buffer;

/// DNS answer caching with TTL support
pub mod cache;

/// Relay configuration
pub mod context;

/// Static host overrides
pub mod hosts;

/// DNS protocol definitions and packet handling
pub mod protocol;

/// Log of answered queries
pub mod query_log;

/// Per datagram relay logic
pub mod relay;

/// UDP server loops
pub mod server;

/// Transaction id translation
pub mod translator;
