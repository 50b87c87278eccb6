//! Process-wide configuration: the thread bound, thread-slot assignment and
//! the two replaceable hooks. All of it is init-once state that must be set
//! up before transactions run concurrently.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use once_cell::sync::Lazy;
use parking_lot::RwLock;

use crate::result::{TxError, TxResult};

/// Upper bound for the number of threads that may run transactions over the
/// whole process lifetime. Every variable's reader table is sized with it.
static MAX_THREAD_NUM: AtomicUsize = AtomicUsize::new(32);

/// Raised once the first variable exists; the bound must not move any more.
static THREAD_BOUND_FROZEN: AtomicBool = AtomicBool::new(false);

static THREAD_ID_SEQUENCER: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static THREAD_ID: usize = THREAD_ID_SEQUENCER.fetch_add(1, Ordering::Relaxed);
}

/// Current upper bound for the number of transactional threads.
pub fn max_thread_num() -> usize {
    MAX_THREAD_NUM.load(Ordering::Relaxed)
}

/// Set the upper bound for the number of transactional threads.
///
/// Reader tables are sized with this value when a [`TVar`](crate::TVar) is
/// created, so it can only be changed while no variable exists yet. A thread
/// whose lazily assigned slot ends up outside the bound panics on its first
/// visible read.
///
/// # Panics
///
/// Panics if a `TVar` has already been created, or if `n` is zero.
pub fn set_max_thread_num(n: usize) {
    assert!(
        !THREAD_BOUND_FROZEN.load(Ordering::Acquire),
        "set_max_thread_num called after a TVar was created"
    );
    assert!(n > 0, "at least one thread slot is required");
    MAX_THREAD_NUM.store(n, Ordering::Relaxed);
}

/// Freeze the bound and return it. Called on variable construction.
pub(crate) fn freeze_max_thread_num() -> usize {
    THREAD_BOUND_FROZEN.store(true, Ordering::Release);
    MAX_THREAD_NUM.load(Ordering::Relaxed)
}

/// Slot of the calling thread, assigned on first touch and kept for the
/// process lifetime.
pub(crate) fn thread_id() -> usize {
    THREAD_ID.with(|id| *id)
}

type Hook = Box<dyn Fn() -> TxResult<()> + Send + Sync>;

static NON_TRANS_ACCESS: Lazy<RwLock<Hook>> =
    Lazy::new(|| RwLock::new(Box::new(|| Err(TxError::InvalidUse))));

static FORCING_ABORT_ON_IRR: Lazy<RwLock<Hook>> =
    Lazy::new(|| RwLock::new(Box::new(|| Err(TxError::InvalidUse))));

/// Replace the hook consulted when a variable is accessed outside any
/// transaction.
///
/// The default refuses with [`TxError::InvalidUse`]. A hook returning
/// `Ok(())` lets the access fall through to the variable's global copy,
/// unsynchronized with concurrent commits.
pub fn set_non_trans_access_hook<F>(hook: F)
where
    F: Fn() -> TxResult<()> + Send + Sync + 'static,
{
    *NON_TRANS_ACCESS.write() = Box::new(hook);
}

/// Replace the hook consulted when [`abort_t`](crate::abort_t) is called on
/// an irrevocable transaction.
///
/// The default refuses with [`TxError::InvalidUse`], leaving the
/// transaction active. A hook that permits the abort is dangerous: other
/// transactions have already died on the assumption that this one commits.
pub fn set_forcing_abort_on_irr_hook<F>(hook: F)
where
    F: Fn() -> TxResult<()> + Send + Sync + 'static,
{
    *FORCING_ABORT_ON_IRR.write() = Box::new(hook);
}

pub(crate) fn non_trans_access() -> TxResult<()> {
    (NON_TRANS_ACCESS.read())()
}

pub(crate) fn forcing_abort_on_irr() -> TxResult<()> {
    (FORCING_ABORT_ON_IRR.read())()
}

#[cfg(test)]
mod test {
    use super::*;
    use std::thread;

    #[test]
    fn thread_ids_are_distinct() {
        crate::test::init();
        let here = thread_id();
        let there = thread::spawn(thread_id).join().unwrap();
        assert_ne!(here, there);
        // Stable across calls from the same thread.
        assert_eq!(here, thread_id());
    }

    #[test]
    #[should_panic(expected = "after a TVar was created")]
    fn thread_bound_is_frozen_by_first_var() {
        crate::test::init();
        let _var = crate::TVar::new(0);
        set_max_thread_num(8);
    }
}
