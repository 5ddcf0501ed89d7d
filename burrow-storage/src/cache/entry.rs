//! Per-key cache slot with dirty tracking.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::OnceLock;
use std::thread::{self, ThreadId};

use burrow_core::{now_millis, Millis, DIRTY_OFFSET_MS};

use crate::traits::EntityRef;

/// The thread that first modified an entry through the checked path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriterIdentity {
    pub id: ThreadId,
    pub name: Option<String>,
}

impl WriterIdentity {
    pub fn current() -> Self {
        let current = thread::current();
        Self {
            id: current.id(),
            name: current.name().map(str::to_owned),
        }
    }
}

/// What the cache stores for one key.
///
/// An entry with no entity records that the backing store had no document
/// for the key, so repeated loads do not go back to it. Such entries are
/// never dirty.
///
/// The entry is dirty while `modified_time != write_to_db_time`. Both start
/// at the creation time; `mark_modified` pushes the first ahead and
/// `mark_persisted` pulls the second up to whatever modified time was
/// observed before the write began.
#[derive(Debug)]
pub struct CacheEntry<E> {
    entity: Option<EntityRef<E>>,
    modified_time: AtomicI64,
    write_to_db_time: AtomicI64,
    owner: OnceLock<WriterIdentity>,
}

impl<E> CacheEntry<E> {
    pub fn new(entity: Option<EntityRef<E>>) -> Self {
        let now = now_millis();
        Self {
            entity,
            modified_time: AtomicI64::new(now),
            write_to_db_time: AtomicI64::new(now),
            owner: OnceLock::new(),
        }
    }

    /// Marker for a key the backing store does not have.
    pub fn absent() -> Self {
        Self::new(None)
    }

    pub fn entity(&self) -> Option<&EntityRef<E>> {
        self.entity.as_ref()
    }

    pub fn is_absent(&self) -> bool {
        self.entity.is_none()
    }

    pub fn modified_time(&self) -> Millis {
        self.modified_time.load(Ordering::Acquire)
    }

    pub fn write_to_db_time(&self) -> Millis {
        self.write_to_db_time.load(Ordering::Acquire)
    }

    pub fn is_dirty(&self) -> bool {
        self.entity.is_some() && self.modified_time() != self.write_to_db_time()
    }

    /// Record a modification. The new modified time is at least
    /// `now + DIRTY_OFFSET_MS` and strictly greater than the previous one.
    pub fn mark_modified(&self) -> Millis {
        let target = now_millis() + DIRTY_OFFSET_MS;
        let previous = self
            .modified_time
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |prev| {
                Some(target.max(prev + 1))
            })
            .unwrap_or_else(|prev| prev);
        target.max(previous + 1)
    }

    /// Record that the state observed at `observed_modified` has reached the
    /// backing store. Modifications made after that observation keep the
    /// entry dirty.
    pub fn mark_persisted(&self, observed_modified: Millis) {
        self.write_to_db_time
            .fetch_max(observed_modified, Ordering::AcqRel);
    }

    pub fn owner(&self) -> Option<&WriterIdentity> {
        self.owner.get()
    }

    /// Record the calling thread as owner if none is set yet. Returns the
    /// existing owner when it is a different thread.
    pub fn claim_owner(&self) -> Result<(), &WriterIdentity> {
        let current = thread::current().id();
        let owner = self.owner.get_or_init(WriterIdentity::current);
        if owner.id == current {
            Ok(())
        } else {
            Err(owner)
        }
    }
}
