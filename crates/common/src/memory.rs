//! Memory accounting shared by the query controller and the read path.
//!
//! A [`MemoryPool`] tracks process-wide bytes against a hard ceiling. Each
//! query gets an [`Allocator`] that charges buffer allocations against its
//! own ceiling and grows its pool reservation on demand. The pool counter
//! is atomic; allocators may be charged from any thread of a query.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{Result, RillError};

/// Process-wide memory counter with a hard ceiling.
#[derive(Debug)]
pub struct MemoryPool {
    max_bytes: u64,
    used: AtomicU64,
}

impl MemoryPool {
    /// Create a pool with the given ceiling. `u64::MAX` disables the bound.
    pub fn new(max_bytes: u64) -> Arc<Self> {
        Arc::new(Self {
            max_bytes,
            used: AtomicU64::new(0),
        })
    }

    /// Bytes currently reserved from the pool.
    pub fn used(&self) -> u64 {
        self.used.load(Ordering::Acquire)
    }

    /// The configured ceiling.
    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    /// Reserve `bytes`, failing without side effects when the ceiling would
    /// be crossed.
    pub fn try_reserve(&self, bytes: u64) -> bool {
        loop {
            let current = self.used.load(Ordering::Acquire);
            let Some(next) = current.checked_add(bytes) else {
                return false;
            };
            if next > self.max_bytes {
                return false;
            }
            if self
                .used
                .compare_exchange(current, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Return previously reserved bytes to the pool.
    pub fn release(&self, bytes: u64) {
        self.used.fetch_sub(bytes, Ordering::AcqRel);
    }
}

#[derive(Debug)]
struct AllocatorInner {
    pool: Option<Arc<MemoryPool>>,
    limit_bytes: u64,
    /// Bytes granted from the pool to this allocator.
    reserved: AtomicU64,
    /// Bytes accounted by live buffers.
    used: AtomicU64,
}

impl Drop for AllocatorInner {
    fn drop(&mut self) {
        if let Some(pool) = &self.pool {
            let reserved = self.reserved.load(Ordering::Acquire);
            if reserved > 0 {
                pool.release(reserved);
            }
        }
    }
}

/// Per-query memory account threaded into every table buffer allocation.
///
/// Cloning shares the account. The pool reservation is returned when the
/// last clone drops or when [`Allocator::release_all`] runs at query
/// termination, whichever comes first.
#[derive(Debug, Clone)]
pub struct Allocator {
    inner: Arc<AllocatorInner>,
}

impl Allocator {
    /// An account with no ceiling and no backing pool, for tests and
    /// administrative reads.
    pub fn unlimited() -> Self {
        Self {
            inner: Arc::new(AllocatorInner {
                pool: None,
                limit_bytes: u64::MAX,
                reserved: AtomicU64::new(0),
                used: AtomicU64::new(0),
            }),
        }
    }

    /// An account backed by `pool`, seeded with `initial_bytes` and capped
    /// at `limit_bytes`. Fails with `resource exhausted` when the pool
    /// cannot grant the initial reservation.
    pub fn with_pool(pool: Arc<MemoryPool>, initial_bytes: u64, limit_bytes: u64) -> Result<Self> {
        if !pool.try_reserve(initial_bytes) {
            return Err(RillError::ResourceExhausted(format!(
                "memory pool cannot reserve initial {initial_bytes} bytes ({} of {} in use)",
                pool.used(),
                pool.max_bytes(),
            )));
        }
        Ok(Self {
            inner: Arc::new(AllocatorInner {
                pool: Some(pool),
                limit_bytes,
                reserved: AtomicU64::new(initial_bytes),
                used: AtomicU64::new(0),
            }),
        })
    }

    /// Charge `bytes` to the account, growing the pool reservation as
    /// needed. Fails with `resource exhausted` when either the per-account
    /// ceiling or the pool ceiling would be crossed; the account is left
    /// unchanged on failure.
    pub fn account(&self, bytes: u64) -> Result<()> {
        let inner = &self.inner;
        let new_used = inner.used.fetch_add(bytes, Ordering::AcqRel) + bytes;
        if new_used > inner.limit_bytes {
            inner.used.fetch_sub(bytes, Ordering::AcqRel);
            return Err(RillError::ResourceExhausted(format!(
                "query memory limit exceeded: {new_used} > {} bytes",
                inner.limit_bytes
            )));
        }
        let Some(pool) = &inner.pool else {
            return Ok(());
        };
        loop {
            let reserved = inner.reserved.load(Ordering::Acquire);
            if reserved >= new_used {
                return Ok(());
            }
            let grow = new_used - reserved;
            if !pool.try_reserve(grow) {
                inner.used.fetch_sub(bytes, Ordering::AcqRel);
                return Err(RillError::ResourceExhausted(format!(
                    "memory pool exhausted growing reservation by {grow} bytes ({} of {} in use)",
                    pool.used(),
                    pool.max_bytes(),
                )));
            }
            if inner
                .reserved
                .compare_exchange(reserved, reserved + grow, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(());
            }
            // Lost the race; another thread grew the reservation meanwhile.
            pool.release(grow);
        }
    }

    /// Return buffer bytes to the account. The pool reservation is kept
    /// until termination so re-allocation within the query stays cheap.
    /// Saturates at zero: buffers may be reclaimed after the account was
    /// force-released at termination.
    pub fn free(&self, bytes: u64) {
        let _ = self
            .inner
            .used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                Some(used.saturating_sub(bytes))
            });
    }

    /// Bytes accounted by live buffers.
    pub fn used(&self) -> u64 {
        self.inner.used.load(Ordering::Acquire)
    }

    /// Bytes currently reserved from the pool for this account.
    pub fn reserved(&self) -> u64 {
        self.inner.reserved.load(Ordering::Acquire)
    }

    /// Force-return the whole pool reservation. Called once at query
    /// termination; later charges fail against a zero reservation only if
    /// the pool itself is full.
    pub fn release_all(&self) {
        let inner = &self.inner;
        if let Some(pool) = &inner.pool {
            let reserved = inner.reserved.swap(0, Ordering::AcqRel);
            if reserved > 0 {
                pool.release(reserved);
            }
        }
        inner.used.store(0, Ordering::Release);
    }
}
