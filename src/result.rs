use thiserror::Error;

/// Which kind of variable access lost a conflict race.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write,
}

/// Errors surfaced by the transactional API.
///
/// Every variant except [`InvalidUse`](TxError::InvalidUse) means the
/// current transaction has already been aborted by the time the error is
/// returned; the caller decides whether to start over. `InvalidUse` signals
/// a sequencing bug in the program and is never returned for a correctly
/// sequenced transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TxError {
    /// A read or write conflicted with a concurrent transaction.
    #[error("{0:?} access conflicted with a concurrent transaction")]
    AccessFailed(AccessKind),

    /// Promotion to irrevocable lost the race for the global irrevocable
    /// slot or for one of the read-set locks.
    #[error("could not promote the transaction to irrevocable")]
    IrrevocFailed,

    /// The commit lost a conflict race.
    #[error("transaction commit failed")]
    CommitFailed,

    /// Nesting, variable access outside a transaction, commit or abort
    /// without a transaction, double commit.
    #[error("invalid use of the transactional API")]
    InvalidUse,
}

impl TxError {
    /// True for conflicts the caller can recover from by running the
    /// transaction again.
    pub fn is_recoverable(self) -> bool {
        self != TxError::InvalidUse
    }
}

pub type TxResult<T> = Result<T, TxError>;

pub(crate) const READ_FAILED: TxError = TxError::AccessFailed(AccessKind::Read);
pub(crate) const WRITE_FAILED: TxError = TxError::AccessFailed(AccessKind::Write);
