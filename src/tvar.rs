// Copyright 2026 stm-irrevocable Developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::any::Any;
use std::cmp;
use std::fmt::{self, Debug};
use std::marker::PhantomData;
use std::sync::atomic::{fence, AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tracing::trace;

use crate::config;
use crate::result::{TxResult, READ_FAILED, WRITE_FAILED};
use crate::transaction::Transaction;

/// Type-erased value handle shared between the global copy and the local
/// buffers.
pub(crate) type ArcAny = Arc<dyn Any + Send + Sync>;

/// A write-set buffer.
///
/// Shared (`Arc`) so a hijacking irrevocable transaction can keep the
/// buffer of a still-live revocable writer; the inner mutex orders the
/// hijacker's write-through against the owner's publish. The payload behind
/// the innermost `Arc` is never mutated, only replaced.
pub(crate) type WriteBuf = Arc<Mutex<ArcAny>>;

/// Outcome of the owner probe in `irr_acquire`.
#[derive(PartialEq)]
enum TakeOver {
    Exclusive,
    Hijacked,
}

/// `VarControlBlock` contains all the shared state of a `TVar` while being
/// the same type for every `T`.
///
/// The control block is accessed from other threads directly whereas `TVar`
/// is just a typesafe wrapper around it. Values are type-erased, which
/// keeps every operation a transaction needs to call on a heterogeneous
/// set of variables monomorphic.
pub struct VarControlBlock {
    /// The authoritative copy.
    ///
    /// Replaced wholesale at publish under the short-held write half of the
    /// lock; readers snapshot it by cloning the `Arc` under the read half.
    /// The payload is never mutated in place, so a captured snapshot stays
    /// consistent.
    value: RwLock<ArcAny>,

    /// Single-holder right to publish a new `value`.
    write_lock: AtomicBool,

    /// Raised by a committing revocable transaction before it publishes,
    /// lowered after. A reader observing it cannot order itself against the
    /// in-flight commit and must abort.
    dirty: AtomicBool,

    /// Same as `dirty` for an irrevocable commit. Kept separate so a
    /// hijacked revocable publish and the irrevocable publish do not clear
    /// each other's flag.
    dirty_irr: AtomicBool,

    /// While set, any revocable transaction writing this variable aborts.
    used_by_irr: AtomicBool,

    /// Visible-read registry, one slot per thread. Slot `i` is only ever
    /// written by the thread owning slot `i`.
    readers: Box<[Mutex<Weak<Transaction>>]>,

    /// The transaction holding `write_lock`, recorded right after the
    /// acquisition. A prober may transiently observe the previous holder;
    /// the probe in `irr_acquire` tolerates that.
    most_recent_lock_owner: Mutex<Weak<Transaction>>,
}

impl VarControlBlock {
    fn new(val: ArcAny) -> Arc<VarControlBlock> {
        let slots = config::freeze_max_thread_num();
        let readers = (0..slots)
            .map(|_| Mutex::new(Weak::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Arc::new(VarControlBlock {
            value: RwLock::new(val),
            write_lock: AtomicBool::new(false),
            dirty: AtomicBool::new(false),
            dirty_irr: AtomicBool::new(false),
            used_by_irr: AtomicBool::new(false),
            readers,
            most_recent_lock_owner: Mutex::new(Weak::new()),
        })
    }

    /// Snapshot of the authoritative value.
    pub(crate) fn snapshot(&self) -> ArcAny {
        self.value.read().clone()
    }

    /// Replace the authoritative value outside any transaction. Only
    /// reachable through a permissive non-transactional-access hook;
    /// unsynchronized with in-flight commits.
    pub(crate) fn store_direct(&self, val: ArcAny) {
        *self.value.write() = val;
    }

    /// Transactional read of the variable.
    ///
    /// Returns the value this transaction sees: its own write buffer, its
    /// earlier read snapshot, or a freshly registered visible read of the
    /// global copy. On conflict the transaction is aborted before the error
    /// is returned.
    pub(crate) fn transactional_read(self: &Arc<Self>, tx: &Arc<Transaction>) -> TxResult<ArcAny> {
        {
            let buf = tx.write_set.lock().get(self).cloned();
            if let Some(buf) = buf {
                return Ok(buf.lock().clone());
            }
            if let Some(snapshot) = tx.sets.lock().read_set.get(self) {
                return Ok(snapshot.clone());
            }
        }

        if tx.irrevocable.load(Ordering::Relaxed) {
            self.irr_acquire(tx, true);
            // irr_acquire left the variable in one of the sets. A hijack
            // registers it as a write even for a read-only wish.
            let buf = tx.write_set.lock().get(self).cloned();
            if let Some(buf) = buf {
                return Ok(buf.lock().clone());
            }
            let snapshot = tx
                .sets
                .lock()
                .read_set
                .get(self)
                .expect("irr_acquire did not register the variable")
                .clone();
            return Ok(snapshot);
        }

        // Visible read: register in the reader table first.
        *self.readers[tx.slot].lock() = Arc::downgrade(tx);

        // The registration must be globally visible before the dirty check.
        fence(Ordering::SeqCst);

        // A raised dirty flag means a commit is publishing right now and
        // may not have seen the registration.
        if self.dirty.load(Ordering::Relaxed) || self.dirty_irr.load(Ordering::Relaxed) {
            trace!(source = "read_dirty", "aborting transaction");
            tx.abort()?;
            return Err(READ_FAILED);
        }

        fence(Ordering::Acquire);

        let snapshot = self.snapshot();

        // Whoever replaced the value between the registration and the
        // snapshot has set our aborted flag first.
        if tx.aborted.load(Ordering::Acquire) {
            trace!(source = "read_killed", "aborting transaction");
            tx.abort()?;
            return Err(READ_FAILED);
        }

        tx.sets
            .lock()
            .read_set
            .insert(self.clone(), snapshot.clone());
        Ok(snapshot)
    }

    /// Transactional write of the variable.
    ///
    /// Buffers `val` locally; nothing becomes visible to other transactions
    /// before commit. On conflict the transaction is aborted before the
    /// error is returned.
    pub(crate) fn transactional_write(
        self: &Arc<Self>,
        tx: &Arc<Transaction>,
        val: ArcAny,
    ) -> TxResult<()> {
        {
            let buf = tx.write_set.lock().get(self).cloned();
            if let Some(buf) = buf {
                *buf.lock() = val;
                return Ok(());
            }
        }

        if tx.irrevocable.load(Ordering::Relaxed) {
            // A read-set entry means the variable is already locked for us,
            // either by the promotion or by an earlier acquisition; it just
            // moves over to the write set.
            let had_read_buffer = tx.sets.lock().read_set.remove(self).is_some();
            if !had_read_buffer {
                self.irr_acquire(tx, false);
            }
            let buf = tx.write_set.lock().get(self).cloned();
            if let Some(buf) = buf {
                *buf.lock() = val;
            } else {
                tx.write_set
                    .lock()
                    .insert(self.clone(), Arc::new(Mutex::new(val)));
            }
            return Ok(());
        }

        // First write access by a revocable transaction.

        if self.used_by_irr.load(Ordering::Acquire) {
            trace!(source = "write_used_by_irr", "aborting transaction");
            tx.abort()?;
            return Err(WRITE_FAILED);
        }

        if self.write_lock.swap(true, Ordering::Acquire) {
            trace!(source = "write_locked", "aborting transaction");
            tx.abort()?;
            return Err(WRITE_FAILED);
        }

        // Record ownership for irrevocable probers. The retired handle may
        // still be held by a concurrent prober; reference counting keeps it
        // valid for as long as that takes.
        *self.most_recent_lock_owner.lock() = Arc::downgrade(tx);

        // Second check: an irrevocable that raised the flag before the
        // ownership record went in would otherwise never find the owner.
        if self.used_by_irr.load(Ordering::Acquire) {
            self.write_lock.store(false, Ordering::Relaxed);
            trace!(source = "write_used_by_irr_late", "aborting transaction");
            tx.abort()?;
            return Err(WRITE_FAILED);
        }

        // Read and write sets stay disjoint: a prior read of this variable
        // is folded into the write.
        tx.sets.lock().read_set.remove(self);

        if tx.aborted.load(Ordering::Acquire) {
            self.write_lock.store(false, Ordering::Relaxed);
            trace!(source = "write_killed", "aborting transaction");
            tx.abort()?;
            return Err(WRITE_FAILED);
        }

        tx.write_set
            .lock()
            .insert(self.clone(), Arc::new(Mutex::new(val)));
        tx.sets.lock().locks_held.push(self.clone());
        Ok(())
    }

    /// First touch of a variable by an irrevocable transaction (after the
    /// promotion). Leaves the variable in the read set (`read_only`) or the
    /// write set, taking over a live writer's buffer if there is one.
    fn irr_acquire(self: &Arc<Self>, tx: &Arc<Transaction>, read_only: bool) {
        // Revocable writers keep out from here on.
        self.used_by_irr.store(true, Ordering::Relaxed);

        if self.try_take_over(tx) == TakeOver::Hijacked {
            return;
        }

        // Exclusive access to the global copy.
        if read_only {
            tx.sets.lock().read_set.insert(self.clone(), self.snapshot());
        } else {
            tx.write_set
                .lock()
                .insert(self.clone(), Arc::new(Mutex::new(self.snapshot())));
        }
    }

    /// Probe the current lock holder on behalf of an irrevocable
    /// transaction that just raised `used_by_irr`.
    fn try_take_over(self: &Arc<Self>, tx: &Arc<Transaction>) -> TakeOver {
        if !self.write_lock.swap(true, Ordering::Relaxed) {
            // The lock was free. No ownership record needed: the record is
            // only ever read on behalf of the single irrevocable, which we
            // are.
            tx.sets.lock().locks_held.push(self.clone());
            return TakeOver::Exclusive;
        }

        let Some(owner) = self.most_recent_lock_owner.lock().upgrade() else {
            // The owner is gone, or has not recorded itself yet. Any fresh
            // move by it dies on `used_by_irr`.
            return TakeOver::Exclusive;
        };

        if !owner.commit_lock.swap(true, Ordering::Relaxed) {
            // Got the owner's commit lock: it can no longer commit.
            owner.aborted.store(true, Ordering::Relaxed);
            return TakeOver::Exclusive;
        }

        if owner.aborted.load(Ordering::Relaxed) || owner.committed.load(Ordering::Relaxed) {
            // Already finished either way.
            return TakeOver::Exclusive;
        }

        // A live owner past all its commit checks: it is publishing right
        // now. Keep its buffer so a late publish installs our value rather
        // than its stale one, and seed our own write from it. The owner's
        // write set is frozen and behind its own short-held lock, so this
        // lookup does not wait on the rest of the owner's commit.
        trace!(source = "hijack", "taking over a live writer's buffer");
        let buf = owner
            .write_set
            .lock()
            .get(self)
            .cloned()
            .expect("lock owner mid-commit has no write buffer for the locked variable");

        tx.sets.lock().hijacked_set.insert(self.clone(), buf.clone());

        fence(Ordering::Acquire);

        let seed = buf.lock().clone();
        tx.write_set
            .lock()
            .insert(self.clone(), Arc::new(Mutex::new(seed)));
        TakeOver::Hijacked
    }

    /// Promotion-time lock of a read-set variable. `used_by_irr` is raised
    /// either way; the caller rolls it back on failure.
    pub(crate) fn acquire_read(&self) -> bool {
        self.used_by_irr.store(true, Ordering::Relaxed);
        !self.write_lock.swap(true, Ordering::Relaxed)
    }

    pub(crate) fn clear_used_by_irr(&self, order: Ordering) {
        self.used_by_irr.store(false, order);
    }

    pub(crate) fn release_write_lock(&self) {
        self.write_lock.store(false, Ordering::Relaxed);
    }

    /// Abort every registered reader except the committer's own slot.
    ///
    /// At most one flag is contended per remote transaction; no remote lock
    /// is held across more than that single atomic operation.
    pub(crate) fn kill_readers(&self, own_slot: usize) {
        for (slot, reader) in self.readers.iter().enumerate() {
            if slot == own_slot {
                continue;
            }
            let Some(reader) = reader.lock().upgrade() else {
                continue;
            };
            if !reader.clean_readset_lock.swap(true, Ordering::Relaxed) {
                reader.aborted.store(true, Ordering::Relaxed);
            }
            // Losing the flag race means the reader is itself committing or
            // irrevocable; it either beat this commit or cannot die.
        }
    }

    /// Raise the dirty flag matching the committing mode.
    pub(crate) fn mark_dirty(&self, irrevocable: bool) {
        if irrevocable {
            self.dirty_irr.store(true, Ordering::Relaxed);
        } else {
            self.dirty.store(true, Ordering::Relaxed);
        }
    }

    /// Lower the dirty flag again on a failed commit.
    pub(crate) fn unmark_dirty(&self, irrevocable: bool) {
        if irrevocable {
            self.dirty_irr.store(false, Ordering::Relaxed);
        } else {
            self.dirty.store(false, Ordering::Relaxed);
        }
    }

    /// Publish a revocable transaction's buffer.
    pub(crate) fn publish(&self, buf: &WriteBuf) {
        let new_val = buf.lock().clone();
        *self.value.write() = new_val;
        self.dirty.store(false, Ordering::Release);
    }

    /// Publish an irrevocable transaction's buffer, writing through the
    /// hijacked buffer when one exists so that a resumed owner republishes
    /// this value instead of its own.
    pub(crate) fn publish_as_irr(&self, buf: &WriteBuf, hijacked: Option<&WriteBuf>) {
        let new_val = buf.lock().clone();
        if let Some(hijacked) = hijacked {
            *hijacked.lock() = new_val.clone();
        }
        *self.value.write() = new_val;
        self.dirty_irr.store(false, Ordering::Release);
    }

    fn get_address(&self) -> usize {
        self as *const VarControlBlock as usize
    }
}

// Control blocks are keyed by address in the transaction's sets.

impl PartialEq for VarControlBlock {
    fn eq(&self, other: &Self) -> bool {
        self.get_address() == other.get_address()
    }
}

impl Eq for VarControlBlock {}

impl Ord for VarControlBlock {
    fn cmp(&self, other: &Self) -> cmp::Ordering {
        self.get_address().cmp(&other.get_address())
    }
}

impl PartialOrd for VarControlBlock {
    fn partial_cmp(&self, other: &Self) -> Option<cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// A shared variable that can only be read and written inside transactions.
///
/// `TVar` hands out clones: [`read`](TVar::read) returns the value this
/// transaction sees, [`write`](TVar::write) buffers a new one. Nothing
/// becomes visible to other transactions before a successful
/// [`commit_t`](crate::commit_t).
#[derive(Clone)]
pub struct TVar<T> {
    /// The control block is the inner of the variable.
    ///
    /// The rest of `TVar` is just the typesafe interface.
    control_block: Arc<VarControlBlock>,

    _marker: PhantomData<T>,
}

impl<T> TVar<T>
where
    T: Any + Send + Sync + Clone,
{
    /// Create a new `TVar`.
    pub fn new(val: T) -> TVar<T> {
        TVar {
            control_block: VarControlBlock::new(Arc::new(val)),
            _marker: PhantomData,
        }
    }

    /// Read the variable inside the current transaction.
    ///
    /// Outside a transaction the non-transactional-access hook decides: the
    /// default refuses with [`TxError::InvalidUse`](crate::TxError);
    /// a permissive hook falls through to a snapshot of the global copy.
    ///
    /// # Errors
    ///
    /// `AccessFailed(Read)` if a conflict was detected; the transaction is
    /// already aborted when that is returned.
    pub fn read(&self) -> TxResult<T> {
        match crate::transaction::current_transaction() {
            Some(tx) => {
                let snapshot = self.control_block.transactional_read(&tx)?;
                Ok(Self::downcast(snapshot))
            }
            None => {
                config::non_trans_access()?;
                Ok(self.read_atomic())
            }
        }
    }

    /// Write the variable inside the current transaction.
    ///
    /// Outside a transaction the non-transactional-access hook decides; a
    /// permissive hook stores straight into the global copy.
    ///
    /// # Errors
    ///
    /// `AccessFailed(Write)` if a conflict was detected; the transaction is
    /// already aborted when that is returned.
    pub fn write(&self, val: T) -> TxResult<()> {
        match crate::transaction::current_transaction() {
            Some(tx) => self.control_block.transactional_write(&tx, Arc::new(val)),
            None => {
                config::non_trans_access()?;
                self.control_block.store_direct(Arc::new(val));
                Ok(())
            }
        }
    }

    /// Modify the content of the `TVar` with the function `f`.
    ///
    /// ```
    /// # use stm_irrevocable::{atomically, TVar};
    /// let var = TVar::new(21);
    /// atomically(|| var.modify(|x| x * 2));
    ///
    /// assert_eq!(var.read_atomic(), 42);
    /// ```
    pub fn modify<F>(&self, f: F) -> TxResult<()>
    where
        F: FnOnce(T) -> T,
    {
        let old = self.read()?;
        self.write(f(old))
    }

    /// Replace the value of the `TVar`, returning the old one.
    pub fn replace(&self, val: T) -> TxResult<T> {
        let old = self.read()?;
        self.write(val)?;
        Ok(old)
    }

    /// Read a snapshot of the value without a transaction.
    ///
    /// This is the explicit escape hatch and does not consult the
    /// non-transactional-access hook. The snapshot is consistent in itself
    /// but carries no ordering against anything this thread does next.
    pub fn read_atomic(&self) -> T {
        Self::downcast(self.control_block.snapshot())
    }

    fn downcast(val: ArcAny) -> T {
        (&*val as &dyn Any)
            .downcast_ref::<T>()
            .expect("wrong type in TVar<T>")
            .clone()
    }

    /// Check if two `TVar`s refer to the same variable.
    pub fn ref_eq(this: &TVar<T>, other: &TVar<T>) -> bool {
        Arc::ptr_eq(&this.control_block, &other.control_block)
    }

    /// Access the control block of the variable.
    ///
    /// Internal use only!
    pub fn control_block(&self) -> &Arc<VarControlBlock> {
        &self.control_block
    }
}

impl<T> Default for TVar<T>
where
    T: Any + Send + Sync + Clone + Default,
{
    fn default() -> TVar<T> {
        TVar::new(T::default())
    }
}

/// Debug output of the current snapshot.
///
/// Note that this does not print the state atomically with respect to the
/// rest of an in-flight transaction.
impl<T> Debug for TVar<T>
where
    T: Any + Send + Sync + Clone + Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        let x = self.read_atomic();
        f.debug_struct("TVar").field("value", &x).finish()
    }
}
