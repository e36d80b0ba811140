//! transaction id translation for forwarded queries
//!
//! Every query sent upstream goes out with an id issued here. The id is the
//! index of a slot remembering the client's own id and address, so the
//! upstream reply can be routed back to whoever asked.

use std::net::SocketAddr;

use chrono::{DateTime, Duration, Local};
use derive_more::{Display, Error, From};

/// Default number of ids that may be outstanding at once
pub const DEFAULT_TRANSLATOR_CAPACITY: usize = 2048;

/// Default number of seconds a forwarded query may go unanswered before its
/// slot can be reused
pub const DEFAULT_ID_LIFETIME: i64 = 4;

/// The 16 bit id space puts a ceiling on the table size
pub const MAX_TRANSLATOR_CAPACITY: usize = 1 << 16;

#[derive(Debug, Display, From, Error)]
pub enum TranslatorError {
    #[display(fmt = "InvalidCapacity({})", _0)]
    InvalidCapacity(#[error(not(source))] usize),
    #[display(fmt = "InvalidLifetime({})", _0)]
    InvalidLifetime(#[error(not(source))] i64),
}

type Result<T> = std::result::Result<T, TranslatorError>;

/// The client a forwarded query was received from
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PendingClient {
    pub original_id: u16,
    pub client: SocketAddr,
}

#[derive(Clone, Debug, Default)]
struct Slot {
    pending: Option<PendingClient>,
    expires: Option<DateTime<Local>>,
}

impl Slot {
    fn is_free(&self, now: DateTime<Local>) -> bool {
        match self.expires {
            Some(expires) => expires <= now,
            None => true,
        }
    }
}

pub struct IdTranslator {
    slots: Vec<Slot>,
    cursor: usize,
    lifetime: Duration,
}

impl Default for IdTranslator {
    fn default() -> Self {
        IdTranslator {
            slots: vec![Slot::default(); DEFAULT_TRANSLATOR_CAPACITY],
            cursor: 0,
            lifetime: Duration::seconds(DEFAULT_ID_LIFETIME),
        }
    }
}

impl IdTranslator {
    pub fn new() -> IdTranslator {
        IdTranslator::default()
    }

    /// Creates a table of `capacity` slots, each held for `lifetime` after
    /// being claimed
    pub fn with_capacity(capacity: usize, lifetime: Duration) -> Result<IdTranslator> {
        if capacity == 0 || capacity > MAX_TRANSLATOR_CAPACITY {
            return Err(TranslatorError::InvalidCapacity(capacity));
        }

        if lifetime <= Duration::zero() {
            return Err(TranslatorError::InvalidLifetime(lifetime.num_seconds()));
        }

        Ok(IdTranslator {
            slots: vec![Slot::default(); capacity],
            cursor: 0,
            lifetime,
        })
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn lifetime(&self) -> Duration {
        self.lifetime
    }

    pub fn allocate(&mut self, original_id: u16, client: SocketAddr) -> Option<u16> {
        self.allocate_at(original_id, client, Local::now())
    }

    /// Claims the next free slot at or after the cursor, wrapping around
    /// once. Returns the id to put on the forwarded query, or `None` when
    /// every slot is held by a query that is still waiting for its answer.
    pub fn allocate_at(
        &mut self,
        original_id: u16,
        client: SocketAddr,
        now: DateTime<Local>,
    ) -> Option<u16> {
        let capacity = self.slots.len();

        for i in 0..capacity {
            let idx = (self.cursor + i) % capacity;

            let slot = &mut self.slots[idx];
            if !slot.is_free(now) {
                continue;
            }

            slot.pending = Some(PendingClient {
                original_id,
                client,
            });
            slot.expires = Some(now + self.lifetime);

            self.cursor = (idx + 1) % capacity;

            return Some(idx as u16);
        }

        None
    }

    /// Looks up the client behind `id` and releases the slot
    ///
    /// Each id resolves once. Ids out of range, and ids whose slot has
    /// already been released, give `None`.
    pub fn resolve(&mut self, id: u16) -> Option<PendingClient> {
        let slot = self.slots.get_mut(id as usize)?;

        slot.expires.take()?;
        slot.pending.take()
    }

    pub fn occupied(&self) -> usize {
        self.occupied_at(Local::now())
    }

    /// Number of slots held by queries that have not yet expired
    pub fn occupied_at(&self, now: DateTime<Local>) -> usize {
        self.slots.iter().filter(|x| !x.is_free(now)).count()
    }
}
