// Copyright 2026 stm-irrevocable Developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! This library implements
//! [software transactional memory](https://en.wikipedia.org/wiki/Software_transactional_memory)
//! with *revocable* and *irrevocable* transactions.
//!
//! Shared state lives in [`TVar`]s. A thread opens a transaction with
//! [`begin_t`], reads and writes any number of variables, and either
//! [`commit_t`]s all of it atomically or leaves no trace. Conflicts are
//! resolved by aborting: none of the operations ever block on another
//! transaction, they fail fast with a recoverable [`TxError`] and the
//! caller runs the transaction again. [`atomically`] wraps that retry loop.
//!
//! ```
//! use stm_irrevocable::{atomically, TVar};
//!
//! let var = TVar::new(0);
//!
//! let x = atomically(|| {
//!     var.write(42)?;
//!     var.read() // Return the value saved in var.
//! });
//!
//! assert_eq!(x, 42);
//! ```
//!
//! # Irrevocable transactions
//!
//! A transaction that must not die, typically because it is about to do
//! something unrepeatable, promotes itself with
//! [`irr_t`]. From that point on no other transaction can abort it and none
//! of its operations fail. At most one irrevocable transaction exists at
//! any time; a promotion that loses a race aborts with
//! [`TxError::IrrevocFailed`] and can simply be retried.
//!
//! The price is paid by everyone else: revocable transactions touching the
//! same variables die, including a writer the irrevocable catches in the
//! middle of publishing, whose buffer is quietly taken over so that both
//! commits serialize.
//!
//! # Transaction safety
//!
//! * Don't run side effects in a transaction body; conflict handling reruns
//!   it. Return a closure if you have to.
//! * Don't handle a [`TxError`] inside the body. Propagate it with `?`; by
//!   the time you see it, the transaction is already aborted.
//! * Don't nest transactions. [`begin_t`] refuses with
//!   [`TxError::InvalidUse`], and [`atomically`] inside `atomically`
//!   panics.
//! * Accessing a `TVar` without a transaction goes through a replaceable
//!   hook and refuses by default; see
//!   [`set_non_trans_access_hook`].
//!
//! The thread bound [`set_max_thread_num`] must be configured before the
//! first variable is created; every variable carries a reader table sized
//! with it.

// The whole coordination scheme is flag-based; it is meaningless on a
// platform where these are silently lock-backed.
#[cfg(not(all(target_has_atomic = "8", target_has_atomic = "ptr")))]
compile_error!("stm-irrevocable requires lock-free byte- and pointer-sized atomics");

mod config;
mod result;
mod transaction;
mod tvar;


pub use config::{
    max_thread_num, set_forcing_abort_on_irr_hook, set_max_thread_num, set_non_trans_access_hook,
};
pub use result::{AccessKind, TxError, TxResult};
pub use transaction::{abort_t, atomically, begin_t, commit_t, irr_t};
pub use tvar::TVar;

#[cfg(test)]
mod test_lib {
    use super::*;
    use crate::test::{hook_serial, init, irr_serial, terminates};
    use std::sync::mpsc::channel;
    use std::sync::{Arc, Barrier};
    use std::thread;
    use std::time::Duration;

    const LOCKSTEP: Duration = Duration::from_secs(10);

    #[test]
    fn uncommitted_write_is_invisible_to_other_threads() {
        init();
        let var = TVar::new(1);
        let var = &var;

        thread::scope(|s| {
            let (ready_tx, ready_rx) = channel();
            let (go_tx, go_rx) = channel();

            let writer = s.spawn(move || {
                begin_t().unwrap();
                var.write(2).unwrap();
                ready_tx.send(()).unwrap();
                go_rx.recv_timeout(LOCKSTEP).unwrap();
                abort_t().unwrap();
            });

            ready_rx.recv_timeout(LOCKSTEP).unwrap();
            // The write is buffered in the writer's transaction only.
            assert_eq!(var.read_atomic(), 1);
            go_tx.send(()).unwrap();
            writer.join().unwrap();
        });

        assert_eq!(var.read_atomic(), 1);
    }

    #[test]
    fn reader_dies_when_its_read_is_overwritten() {
        init();
        let var = TVar::new(1);

        begin_t().unwrap();
        assert_eq!(var.read().unwrap(), 1);

        // A remote transaction overwrites the read and commits.
        thread::scope(|s| {
            s.spawn(|| {
                begin_t().unwrap();
                var.write(2).unwrap();
                commit_t().unwrap();
            });
        });

        assert_eq!(commit_t(), Err(TxError::CommitFailed));
        assert_eq!(var.read_atomic(), 2);
    }

    #[test]
    fn irrevocable_wins_over_a_revocable_writer() {
        let _serial = irr_serial();
        let var = TVar::new(1);
        let var = &var;

        thread::scope(|s| {
            let (ready_tx, ready_rx) = channel();
            let (go_tx, go_rx) = channel();

            let loser = s.spawn(move || {
                begin_t().unwrap();
                var.write(10).unwrap();
                ready_tx.send(()).unwrap();
                go_rx.recv_timeout(LOCKSTEP).unwrap();
                commit_t()
            });

            ready_rx.recv_timeout(LOCKSTEP).unwrap();

            // The writer holds the variable's lock and is not committing:
            // the irrevocable fences it out of ever doing so.
            begin_t().unwrap();
            irr_t().unwrap();
            var.write(20).unwrap();
            commit_t().unwrap();
            assert_eq!(var.read_atomic(), 20);

            go_tx.send(()).unwrap();
            assert_eq!(loser.join().unwrap(), Err(TxError::CommitFailed));
        });

        assert_eq!(var.read_atomic(), 20);
    }

    /// The genuine hijack: the owner is parked inside its own `commit()`,
    /// past the commit race and right before its publish loop. The
    /// irrevocable round must finish in bounded time (the probe may not
    /// park on the owner's commit), land its value while the owner is
    /// still mid-commit, and the owner's resumed publish must install the
    /// write-through value, not its stale one.
    #[test]
    fn hijack_lands_in_a_live_commit() {
        let _serial = irr_serial();
        let var = TVar::new(1);

        let entered = Arc::new(Barrier::new(2));
        let resume = Arc::new(Barrier::new(2));
        {
            let entered = Arc::clone(&entered);
            let resume = Arc::clone(&resume);
            crate::test::set_before_publish_pause(move || {
                if thread::current().name() == Some("paused-committer") {
                    entered.wait();
                    resume.wait();
                }
            });
        }

        thread::scope(|s| {
            let owner = thread::Builder::new()
                .name("paused-committer".into())
                .spawn_scoped(s, || {
                    begin_t().unwrap();
                    var.write(10).unwrap();
                    commit_t()
                })
                .unwrap();

            entered.wait();

            let varc = var.clone();
            let finished = terminates(10_000, move || {
                begin_t().unwrap();
                irr_t().unwrap();
                varc.write(20).unwrap();
                // The probe found a live owner and took the hijack branch.
                let tx = crate::transaction::current_transaction().unwrap();
                assert_eq!(tx.sets.lock().hijacked_set.len(), 1);
                commit_t().unwrap();
            });
            assert!(finished, "irrevocable probe parked on a mid-commit owner");

            // The irrevocable's value is in while the owner still sits in
            // its commit.
            assert_eq!(var.read_atomic(), 20);

            resume.wait();
            // The owner's own publish went through the hijacked buffer and
            // installed the value it was overwritten with.
            assert_eq!(owner.join().unwrap(), Ok(()));
        });

        crate::test::clear_before_publish_pause();
        assert_eq!(var.read_atomic(), 20);
    }

    #[test]
    fn at_most_one_irrevocable() {
        let _serial = irr_serial();

        thread::scope(|s| {
            let (ready_tx, ready_rx) = channel();
            let (go_tx, go_rx) = channel();

            let winner = s.spawn(move || {
                begin_t().unwrap();
                irr_t().unwrap();
                ready_tx.send(()).unwrap();
                go_rx.recv_timeout(LOCKSTEP).unwrap();
                commit_t().unwrap();
            });

            ready_rx.recv_timeout(LOCKSTEP).unwrap();

            begin_t().unwrap();
            assert_eq!(irr_t(), Err(TxError::IrrevocFailed));

            go_tx.send(()).unwrap();
            winner.join().unwrap();
        });

        // The slot is free again once the winner finished.
        begin_t().unwrap();
        irr_t().unwrap();
        commit_t().unwrap();
    }

    #[test]
    fn promotion_fails_on_a_locked_read() {
        let _serial = irr_serial();
        let var = TVar::new(1);
        let var = &var;

        thread::scope(|s| {
            let (ready_tx, ready_rx) = channel();
            let (go_tx, go_rx) = channel();

            let writer = s.spawn(move || {
                begin_t().unwrap();
                var.write(5).unwrap();
                ready_tx.send(()).unwrap();
                go_rx.recv_timeout(LOCKSTEP).unwrap();
                commit_t().unwrap();
            });

            ready_rx.recv_timeout(LOCKSTEP).unwrap();

            // Reading past a held write lock is fine...
            begin_t().unwrap();
            assert_eq!(var.read().unwrap(), 1);
            // ...but the promotion cannot lock the read set.
            assert_eq!(irr_t(), Err(TxError::IrrevocFailed));

            go_tx.send(()).unwrap();
            writer.join().unwrap();
        });

        assert_eq!(var.read_atomic(), 5);
    }

    #[test]
    fn revocable_write_dies_on_irrevocable_interest() {
        let _serial = irr_serial();
        let var = TVar::new(1);
        let var = &var;

        thread::scope(|s| {
            let (ready_tx, ready_rx) = channel();
            let (go_tx, go_rx) = channel();

            let irr = s.spawn(move || {
                begin_t().unwrap();
                assert_eq!(var.read().unwrap(), 1);
                irr_t().unwrap();
                ready_tx.send(()).unwrap();
                go_rx.recv_timeout(LOCKSTEP).unwrap();
                commit_t().unwrap();
            });

            ready_rx.recv_timeout(LOCKSTEP).unwrap();

            begin_t().unwrap();
            assert_eq!(
                var.write(99),
                Err(TxError::AccessFailed(AccessKind::Write))
            );

            go_tx.send(()).unwrap();
            irr.join().unwrap();
        });

        assert_eq!(var.read_atomic(), 1);
    }

    #[test]
    fn non_transactional_access_asks_the_hook() {
        let _serial = hook_serial();
        let var = TVar::new(1);

        // The default hook refuses.
        assert_eq!(var.read(), Err(TxError::InvalidUse));
        assert_eq!(var.write(9), Err(TxError::InvalidUse));
        assert_eq!(var.read_atomic(), 1);

        // A permissive hook falls through to the global copy.
        set_non_trans_access_hook(|| Ok(()));
        assert_eq!(var.read(), Ok(1));
        var.write(9).unwrap();
        assert_eq!(var.read_atomic(), 9);

        set_non_trans_access_hook(|| Err(TxError::InvalidUse));
        assert_eq!(var.read(), Err(TxError::InvalidUse));
    }

    #[test]
    fn forced_abort_of_an_irrevocable_asks_the_hook() {
        let _serial = irr_serial();
        let _hooks = hook_serial();
        let var = TVar::new(1);

        begin_t().unwrap();
        var.write(2).unwrap();
        irr_t().unwrap();

        // The default hook refuses and the transaction stays active.
        assert_eq!(abort_t(), Err(TxError::InvalidUse));
        assert_eq!(var.read(), Ok(2));

        set_forcing_abort_on_irr_hook(|| Ok(()));
        abort_t().unwrap();
        set_forcing_abort_on_irr_hook(|| Err(TxError::InvalidUse));

        assert_eq!(var.read_atomic(), 1);
        assert_eq!(commit_t(), Err(TxError::InvalidUse));

        // The irrevocable slot was released by the forced abort.
        begin_t().unwrap();
        irr_t().unwrap();
        commit_t().unwrap();
    }

    #[test]
    fn concurrent_increments_conserve_the_count() {
        init();
        let var = TVar::new(0);
        let varc = var.clone();

        let finished = terminates(30_000, move || {
            thread::scope(|s| {
                for _ in 0..2 {
                    s.spawn(|| {
                        for _ in 0..500 {
                            atomically(|| varc.modify(|x| x + 1));
                        }
                    });
                }
            });
        });

        assert!(finished);
        assert_eq!(var.read_atomic(), 1000);
    }

    /// Random transfer workload: the sum over all variables is invariant
    /// under any interleaving, and a promoted transaction never loses.
    #[test]
    fn conservation_under_contention() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        let _serial = irr_serial();

        const VARS: usize = 128;
        const THREADS: usize = 4;
        const TRANSFERS_PER_TX: usize = 10;
        const TXS_PER_THREAD: usize = 250;

        let vars: Vec<TVar<i64>> = (0..VARS).map(|_| TVar::new(100)).collect();
        let initial_sum = 100 * VARS as i64;

        fn run_transfer(
            vars: &[TVar<i64>],
            transfers: &[(usize, usize, i64)],
            make_irr: bool,
        ) -> TxResult<()> {
            begin_t()?;
            let promoted = if make_irr {
                irr_t()?;
                true
            } else {
                false
            };

            let result = (|| {
                for &(from, to, amount) in transfers {
                    let balance = vars[from].read()?;
                    if balance >= amount {
                        vars[from].write(balance - amount)?;
                        vars[to].modify(|x| x + amount)?;
                    }
                }
                commit_t()
            })();

            if promoted {
                // Progress guarantee: a promoted transaction never fails.
                result.expect("irrevocable transaction lost a race");
                return Ok(());
            }
            result
        }

        thread::scope(|s| {
            for seed in 0..THREADS as u64 {
                let vars = &vars;
                s.spawn(move || {
                    let mut rng = StdRng::seed_from_u64(0xBEEF ^ seed);
                    for i in 0..TXS_PER_THREAD {
                        let transfers: Vec<(usize, usize, i64)> = (0..TRANSFERS_PER_TX)
                            .map(|_| {
                                let from = rng.gen_range(0..VARS);
                                let mut to = rng.gen_range(0..VARS);
                                while to == from {
                                    to = rng.gen_range(0..VARS);
                                }
                                (from, to, rng.gen_range(1..25))
                            })
                            .collect();
                        let make_irr = i % 16 == 0;

                        let mut restarts = 0u32;
                        loop {
                            match run_transfer(vars, &transfers, make_irr) {
                                Ok(()) => break,
                                Err(e) => {
                                    assert!(e.is_recoverable(), "unexpected {e}");
                                    restarts += 1;
                                    thread::sleep(Duration::from_micros(
                                        100 * u64::from(restarts.min(50)),
                                    ));
                                }
                            }
                        }
                    }
                });
            }
        });

        // Audit the final state from an irrevocable transaction.
        begin_t().unwrap();
        irr_t().unwrap();
        let sum: i64 = vars.iter().map(|v| v.read().unwrap()).sum();
        commit_t().unwrap();

        assert_eq!(sum, initial_sum);
    }
}
