// Copyright 2026 stm-irrevocable Developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::mem;
use std::sync::atomic::{fence, AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::config;
use crate::result::{TxError, TxResult};
use crate::tvar::{ArcAny, VarControlBlock, WriteBuf};

/// Serializes irrevocable transactions: at most one holds it at any time.
static IRR_TRANSACTION_LOCK: AtomicBool = AtomicBool::new(false);

thread_local! {
    static CURRENT: RefCell<Option<Arc<Transaction>>> = const { RefCell::new(None) };
}

pub(crate) fn current_transaction() -> Option<Arc<Transaction>> {
    CURRENT.with(|slot| slot.borrow().clone())
}

fn clear_current() {
    CURRENT.with(|slot| slot.borrow_mut().take());
}

/// The thread-local bookkeeping of a transaction.
///
/// Only the owning thread touches these; the write set lives outside in
/// [`Transaction::write_set`] because a hijacker reads it remotely. None of
/// the transaction-level locks is ever held across another one, or across a
/// write-buffer lock, or across a publish.
pub(crate) struct TxSets {
    /// Uniquely owned snapshots of everything read.
    pub(crate) read_set: BTreeMap<Arc<VarControlBlock>, ArcAny>,

    /// Buffers taken over from still-live revocable writers.
    pub(crate) hijacked_set: BTreeMap<Arc<VarControlBlock>, WriteBuf>,

    /// Variables whose write lock this transaction holds.
    pub(crate) locks_held: Vec<Arc<VarControlBlock>>,
}

/// A transaction's shared state.
///
/// The atomic flags are poked by remote transactions: a committer that
/// overwrites one of our reads takes `clean_readset_lock`, a promoting
/// irrevocable that wants us dead takes `commit_lock`. Everything else is
/// driven by the owning thread.
pub struct Transaction {
    /// Reader-table slot of the owning thread, fixed at begin.
    pub(crate) slot: usize,

    /// Set once at the end of a successful commit.
    pub(crate) committed: AtomicBool,

    /// Set by this transaction or by whoever killed it. At most one of
    /// `committed` and `aborted` ever becomes true.
    pub(crate) aborted: AtomicBool,

    /// Set on successful promotion, never cleared.
    pub(crate) irrevocable: AtomicBool,

    /// Taken by a remote commit that overwrites one of our reads, poisoning
    /// our own commit. We take it ourselves on commit and promotion.
    pub(crate) clean_readset_lock: AtomicBool,

    /// Taken by us on commit, or by a promoting irrevocable to fence us out
    /// of committing. Losing it to the irrevocable means we die; the
    /// irrevocable losing it to us means it must hijack.
    pub(crate) commit_lock: AtomicBool,

    /// Shared buffers of everything written.
    ///
    /// Behind its own lock, taken only for single lookups and inserts, so
    /// that a hijacker probing a mid-commit owner gets its buffer without
    /// waiting on anything the commit does. Once the commit race is won the
    /// map is frozen, and it survives cleanup so a hijacker racing our
    /// completion still finds it.
    pub(crate) write_set: Mutex<BTreeMap<Arc<VarControlBlock>, WriteBuf>>,

    pub(crate) sets: Mutex<TxSets>,
}

impl Transaction {
    pub(crate) fn new() -> Arc<Transaction> {
        Arc::new(Transaction {
            slot: config::thread_id(),
            committed: AtomicBool::new(false),
            aborted: AtomicBool::new(false),
            irrevocable: AtomicBool::new(false),
            clean_readset_lock: AtomicBool::new(false),
            commit_lock: AtomicBool::new(false),
            write_set: Mutex::new(BTreeMap::new()),
            sets: Mutex::new(TxSets {
                read_set: BTreeMap::new(),
                hijacked_set: BTreeMap::new(),
                locks_held: Vec::new(),
            }),
        })
    }

    /// Attempt to commit.
    ///
    /// Walks the write set raising dirty flags, kills registered readers of
    /// the written variables, verifies nobody poisoned this transaction,
    /// and publishes the buffers.
    pub(crate) fn commit(&self) -> TxResult<()> {
        if self.committed.load(Ordering::Relaxed) {
            return Err(TxError::InvalidUse);
        }

        if self.aborted.load(Ordering::Relaxed) {
            // A remote commit overwrote one of our reads.
            trace!(source = "commit_poisoned", "aborting transaction");
            self.abort()?;
            return Err(TxError::CommitFailed);
        }

        let irrevocable = self.irrevocable.load(Ordering::Relaxed);

        // Snapshot the write set. It is frozen from here until the
        // transaction is dropped; a hijacker may read it at any point.
        let writes: Vec<(Arc<VarControlBlock>, WriteBuf)> = self
            .write_set
            .lock()
            .iter()
            .map(|(var, buf)| (var.clone(), buf.clone()))
            .collect();

        // From here on a fresh reader sees the variable dirty and keeps
        // out; it cannot order itself against this publish.
        for (var, _) in &writes {
            var.mark_dirty(irrevocable);
        }

        fence(Ordering::SeqCst);

        // Readers that registered before the fence lost the race.
        self.kill_readers(&writes);

        if !irrevocable {
            // An irrevocable already owns both flags since promotion.
            if self.clean_readset_lock.swap(true, Ordering::Release)
                || self.commit_lock.swap(true, Ordering::Release)
            {
                for (var, _) in &writes {
                    var.unmark_dirty(false);
                }
                trace!(source = "commit_lost_race", "aborting transaction");
                self.abort()?;
                return Err(TxError::CommitFailed);
            }
        }

        #[cfg(test)]
        crate::test::before_publish_pause();

        // Publish with no transaction-level lock held: a hijacker must be
        // able to reach the write set while this loop runs.
        if irrevocable {
            let hijacked = self.sets.lock().hijacked_set.clone();
            for (var, buf) in &writes {
                var.publish_as_irr(buf, hijacked.get(var));
            }
        } else {
            for (var, buf) in &writes {
                var.publish(buf);
            }
        }

        fence(Ordering::Release);

        if irrevocable {
            let reads: Vec<Arc<VarControlBlock>> =
                self.sets.lock().read_set.keys().cloned().collect();
            for var in &reads {
                var.clear_used_by_irr(Ordering::Relaxed);
            }
            for (var, _) in &writes {
                var.clear_used_by_irr(Ordering::Relaxed);
            }
        }

        self.committed.store(true, Ordering::Relaxed);

        fence(Ordering::Release);

        // Unlock all held locks, any order.
        let locks = mem::take(&mut self.sets.lock().locks_held);
        for var in locks {
            var.release_write_lock();
        }

        // Except for the irrevocable slot, which goes last.
        if irrevocable {
            IRR_TRANSACTION_LOCK.store(false, Ordering::Relaxed);
        }

        self.cleanup();
        Ok(())
    }

    /// Abort the transaction.
    ///
    /// For an irrevocable one the forced-abort hook decides first; if it
    /// refuses, the transaction stays active and the error propagates.
    pub(crate) fn abort(&self) -> TxResult<()> {
        if self.committed.load(Ordering::Relaxed) {
            return Err(TxError::InvalidUse);
        }

        let irrevocable = self.irrevocable.load(Ordering::Relaxed);
        if irrevocable {
            config::forcing_abort_on_irr()?;
            let reads: Vec<Arc<VarControlBlock>> =
                self.sets.lock().read_set.keys().cloned().collect();
            for var in &reads {
                var.clear_used_by_irr(Ordering::Release);
            }
            let writes: Vec<Arc<VarControlBlock>> =
                self.write_set.lock().keys().cloned().collect();
            for var in &writes {
                var.clear_used_by_irr(Ordering::Release);
            }
        }

        self.aborted.store(true, Ordering::Relaxed);

        if irrevocable {
            IRR_TRANSACTION_LOCK.store(false, Ordering::SeqCst);
        }

        self.cleanup();
        Ok(())
    }

    /// Promote to irrevocable.
    ///
    /// Serializes against other irrevocables, locks the read set, then
    /// claims this transaction's own contention flags so no remote commit
    /// can poison it any more.
    pub(crate) fn irr(&self) -> TxResult<()> {
        if self.irrevocable.load(Ordering::Relaxed) {
            return Ok(());
        }

        if IRR_TRANSACTION_LOCK.swap(true, Ordering::Relaxed) {
            // Another transaction is irrevocable, or about to be.
            trace!(source = "irr_contended", "aborting transaction");
            self.abort()?;
            return Err(TxError::IrrevocFailed);
        }

        // Our reads must become visible as reads of an irrevocable.
        if !self.acquire_readset() {
            IRR_TRANSACTION_LOCK.store(false, Ordering::Relaxed);
            trace!(source = "irr_readset", "aborting transaction");
            self.abort()?;
            return Err(TxError::IrrevocFailed);
        }

        // Nobody may have forced (or force from now on) our abort.
        if self.clean_readset_lock.swap(true, Ordering::Relaxed)
            || self.commit_lock.swap(true, Ordering::Relaxed)
        {
            {
                let sets = self.sets.lock();
                for var in sets.read_set.keys() {
                    var.clear_used_by_irr(Ordering::Release);
                }
            }
            IRR_TRANSACTION_LOCK.store(false, Ordering::Release);
            trace!(source = "irr_poisoned", "aborting transaction");
            self.abort()?;
            return Err(TxError::IrrevocFailed);
        }

        self.irrevocable.store(true, Ordering::Relaxed);
        debug!("transaction promoted to irrevocable");
        Ok(())
    }

    /// Lock every read-set variable for the promotion. On failure every
    /// flag raised and lock taken so far is rolled back.
    fn acquire_readset(&self) -> bool {
        let mut sets = self.sets.lock();
        let vars: Vec<Arc<VarControlBlock>> = sets.read_set.keys().cloned().collect();

        for (i, var) in vars.iter().enumerate() {
            if !var.acquire_read() {
                // The flag went up on every variable up to and including
                // this one, the lock on every one before it.
                for v in &vars[..=i] {
                    v.clear_used_by_irr(Ordering::SeqCst);
                }
                for v in &vars[..i] {
                    v.release_write_lock();
                }
                return false;
            }
        }

        sets.locks_held.extend(vars);
        true
    }

    /// Abort all transactions that read a variable this commit overwrites.
    fn kill_readers(&self, writes: &[(Arc<VarControlBlock>, WriteBuf)]) {
        fence(Ordering::Acquire);
        for (var, _) in writes {
            var.kill_readers(self.slot);
        }
    }

    /// Release locks and drop the read and hijack buffers. The write set
    /// stays until the transaction itself is dropped: a hijacker racing our
    /// completion must still find its buffers.
    fn cleanup(&self) {
        {
            let mut sets = self.sets.lock();
            for var in sets.locks_held.drain(..) {
                var.release_write_lock();
            }
            sets.read_set.clear();
            sets.hijacked_set.clear();
        }
        clear_current();
    }
}

/// Start a transaction on the current thread.
///
/// # Errors
///
/// `InvalidUse` if this thread is already inside one; transactions do not
/// nest.
pub fn begin_t() -> TxResult<()> {
    CURRENT.with(|slot| {
        let mut slot = slot.borrow_mut();
        if slot.is_some() {
            return Err(TxError::InvalidUse);
        }
        *slot = Some(Transaction::new());
        Ok(())
    })
}

/// Explicitly abort the current transaction.
///
/// On an irrevocable transaction the forced-abort hook decides; the default
/// refuses with `InvalidUse` and leaves the transaction active.
///
/// # Errors
///
/// `InvalidUse` if no transaction is active on this thread.
pub fn abort_t() -> TxResult<()> {
    let tx = current_transaction().ok_or(TxError::InvalidUse)?;
    tx.abort()
}

/// Promote the current transaction to irrevocable.
///
/// Once promoted, no other transaction can abort it and none of its
/// operations fail any more. At most one irrevocable transaction exists at
/// any time.
///
/// # Errors
///
/// `InvalidUse` if no transaction is active. `IrrevocFailed` if the
/// promotion lost a race; the transaction is aborted then.
pub fn irr_t() -> TxResult<()> {
    let tx = current_transaction().ok_or(TxError::InvalidUse)?;
    tx.irr()
}

/// Attempt to commit the current transaction.
///
/// # Errors
///
/// `InvalidUse` if no transaction is active. `CommitFailed` if the commit
/// lost a conflict race; the transaction is aborted then.
pub fn commit_t() -> TxResult<()> {
    let tx = current_transaction().ok_or(TxError::InvalidUse)?;
    tx.commit()
}

/// Run `f` as a transaction, retrying with a linear backoff until it
/// commits.
///
/// `f` must be transaction-safe: no side effects besides `TVar` accesses,
/// because it reruns on every conflict. Errors must be propagated with `?`,
/// not handled; `f` may call [`irr_t`] to promote itself.
///
/// # Panics
///
/// Panics on `InvalidUse`: nesting `atomically`, or aborting inside `f`
/// and then returning `Ok`, is a program bug.
pub fn atomically<T, F>(mut f: F) -> T
where
    F: FnMut() -> TxResult<T>,
{
    let mut restarts = 0u32;
    loop {
        match run_once(&mut f) {
            Ok(v) => return v,
            Err(e) if e.is_recoverable() => {
                restarts += 1;
                std::thread::sleep(Duration::from_micros(100 * u64::from(restarts.min(50))));
            }
            Err(e) => panic!("transactional program bug: {e}"),
        }
    }
}

fn run_once<T>(f: &mut impl FnMut() -> TxResult<T>) -> TxResult<T> {
    begin_t()?;
    // On an error the transaction is already aborted and the slot cleared.
    let value = f()?;
    commit_t()?;
    Ok(value)
}
