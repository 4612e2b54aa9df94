//! # Data Repository Layer
//!
//! This module provides the storage interfaces behind the order store and
//! the ledger, plus their PostgreSQL implementations.
//!
//! Every method that changes more than one record is atomic: implementations
//! must never let a reader observe an order as `PROCESSED` without the
//! matching credit, or a withdrawal without the matching debit.

use async_trait::async_trait;
use deadpool_postgres::PoolError;
use model::{LedgerEntry, Order, OrderUpdate, Points, Transition, UserId, Withdrawal};
use thiserror::Error;

mod postgres;

pub use postgres::{PgLedgerRepository, PgOrdersRepository};

/// # RepositoryError
///
/// Error types that can occur during repository operations.
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// Database-related errors, wrapping the underlying PostgreSQL error
    #[error("Database error: {0}")]
    Db(#[from] tokio_postgres::Error),
    /// Failed to obtain a database connection from the pool.
    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),
    /// No result found.
    #[error("Not found")]
    NotFound,
    /// Stored data contradicts an invariant (unknown status, counter overflow, ...).
    #[error("Inconsistent data: {0}")]
    Inconsistent(String),
}

/// Outcome of inserting an order whose number may already be taken.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// The number is already stored; `owner` uploaded it first.
    Existing { owner: UserId },
}

/// Outcome of a debit attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebitOutcome {
    /// The debit was applied; the entry is the state after the debit.
    Applied(LedgerEntry),
    /// Nothing was written; the entry is the state that was checked.
    InsufficientFunds(LedgerEntry),
}

/// # OrdersRepository
///
/// Repository interface for uploaded orders.
///
/// Order numbers are unique across all users. Orders are never deleted, and
/// their owner and upload time never change.
#[async_trait]
pub trait OrdersRepository: Send + Sync {
    /// Stores `order` unless its number is already taken.
    async fn insert(&self, order: &Order) -> Result<InsertOutcome, RepositoryError>;

    /// All orders of `owner`, oldest upload first, insertion order breaking ties.
    async fn list_by_owner(&self, owner: &UserId) -> Result<Vec<Order>, RepositoryError>;

    /// Up to `limit` orders still in `NEW` or `PROCESSING`, oldest first.
    ///
    /// Numbers listed in `exclude` are skipped before the limit applies, so
    /// callers can step past orders they are not ready to retry.
    async fn list_pending(
        &self,
        limit: usize,
        exclude: &[String],
    ) -> Result<Vec<Order>, RepositoryError>;

    /// Applies `update` to the order and, when it becomes `PROCESSED`,
    /// credits its owner in the same atomic step.
    ///
    /// Concurrent calls for one order serialize; the loser sees the advanced
    /// status and gets [`Transition::Unchanged`] or [`Transition::Rejected`].
    async fn apply_update(
        &self,
        number: &str,
        update: OrderUpdate,
    ) -> Result<Transition, RepositoryError>;
}

/// # LedgerRepository
///
/// Repository interface for per-user point balances and withdrawals.
///
/// Operations on one user serialize; operations on different users do not
/// block each other.
#[async_trait]
pub trait LedgerRepository: Send + Sync {
    /// Current totals of `user`; zero when the user has no entry yet.
    async fn entry(&self, user: &UserId) -> Result<LedgerEntry, RepositoryError>;

    /// Adds `amount` to the accrued total and returns the new entry.
    async fn credit(&self, user: &UserId, amount: Points) -> Result<LedgerEntry, RepositoryError>;

    /// Checks the balance and, if it covers `withdrawal.sum`, increases the
    /// withdrawn total and records the withdrawal, all in one atomic step.
    async fn debit(
        &self,
        user: &UserId,
        withdrawal: &Withdrawal,
    ) -> Result<DebitOutcome, RepositoryError>;

    /// Withdrawals of `user`, oldest first.
    async fn withdrawals(&self, user: &UserId) -> Result<Vec<Withdrawal>, RepositoryError>;
}
