//! Business logic layer of the loyalty backend.
//!
//! [`OrderStore`] and [`Ledger`] own the domain rules for orders and point
//! balances; [`LoyaltyService`] is the façade the HTTP layer talks to. All of
//! them work on injected repositories, so the same code runs against
//! PostgreSQL and the in-memory store.

use async_trait::async_trait;
use model::{Balance, Order, Points, UserId, Withdrawal, luhn};
use repository::RepositoryError;
use thiserror::Error;
use tracing::instrument;

pub mod ledger;
pub mod orders;

pub use ledger::{DebitResult, Ledger};
pub use orders::{OrderStore, SubmitOutcome};

/// The main error type for all operations in this crate.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// A repository (database) operation failed.
    #[error("Storage error: {0}")]
    Repository(#[from] RepositoryError),
    /// Stored state contradicts an invariant; the operation did not mutate anything.
    #[error("Internal inconsistency: {0}")]
    InternalInconsistency(String),
    /// A ledger amount must be positive.
    #[error("Amount must be positive")]
    InvalidAmount,
}

/// Result of [`LoyaltyService::upload_order`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadOutcome {
    Accepted,
    AlreadyUploaded,
    Conflict,
    InvalidFormat,
}

impl From<SubmitOutcome> for UploadOutcome {
    fn from(outcome: SubmitOutcome) -> Self {
        match outcome {
            SubmitOutcome::Accepted => UploadOutcome::Accepted,
            SubmitOutcome::AlreadyOwnedByUser => UploadOutcome::AlreadyUploaded,
            SubmitOutcome::OwnedByOther => UploadOutcome::Conflict,
            SubmitOutcome::InvalidFormat => UploadOutcome::InvalidFormat,
        }
    }
}

/// Result of [`LoyaltyService::withdraw`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WithdrawOutcome {
    Accepted(Withdrawal),
    InsufficientFunds,
    InvalidOrderNumber,
    InvalidSum,
}

/// A per-user listing where "nothing yet" is a distinct, successful result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Listing<T> {
    Empty,
    Found(Vec<T>),
}

impl<T> From<Vec<T>> for Listing<T> {
    fn from(items: Vec<T>) -> Self {
        if items.is_empty() {
            Listing::Empty
        } else {
            Listing::Found(items)
        }
    }
}

/// Operations exposed to the transport layer for an already authenticated user.
#[async_trait]
pub trait LoyaltyService: Send + Sync {
    /// Uploads an order number for accrual.
    async fn upload_order(&self, user: &UserId, number: &str)
    -> Result<UploadOutcome, ServiceError>;

    /// Orders of `user`, oldest upload first.
    async fn list_orders(&self, user: &UserId) -> Result<Listing<Order>, ServiceError>;

    /// Current and withdrawn points of `user`.
    async fn balance(&self, user: &UserId) -> Result<Balance, ServiceError>;

    /// Spends `sum` points against the payment reference `order`.
    ///
    /// The reference is validated with the same Luhn rule as uploads but does
    /// not need to match an uploaded order.
    async fn withdraw(
        &self,
        user: &UserId,
        order: &str,
        sum: Points,
    ) -> Result<WithdrawOutcome, ServiceError>;

    /// Withdrawals of `user`, oldest first.
    async fn list_withdrawals(&self, user: &UserId) -> Result<Listing<Withdrawal>, ServiceError>;
}

/// [`LoyaltyService`] on top of an [`OrderStore`] and a [`Ledger`].
#[derive(Clone)]
pub struct LoyaltyServiceImpl {
    orders: OrderStore,
    ledger: Ledger,
}

impl LoyaltyServiceImpl {
    pub fn new(orders: OrderStore, ledger: Ledger) -> Self {
        Self { orders, ledger }
    }
}

#[async_trait]
impl LoyaltyService for LoyaltyServiceImpl {
    #[instrument(skip(self, user), fields(user = %user))]
    async fn upload_order(
        &self,
        user: &UserId,
        number: &str,
    ) -> Result<UploadOutcome, ServiceError> {
        Ok(self.orders.submit(user, number).await?.into())
    }

    async fn list_orders(&self, user: &UserId) -> Result<Listing<Order>, ServiceError> {
        Ok(self.orders.list_by_user(user).await?.into())
    }

    async fn balance(&self, user: &UserId) -> Result<Balance, ServiceError> {
        self.ledger.read(user).await
    }

    #[instrument(skip(self, user), fields(user = %user))]
    async fn withdraw(
        &self,
        user: &UserId,
        order: &str,
        sum: Points,
    ) -> Result<WithdrawOutcome, ServiceError> {
        if !luhn::is_valid(order) {
            return Ok(WithdrawOutcome::InvalidOrderNumber);
        }
        if sum == 0 {
            return Ok(WithdrawOutcome::InvalidSum);
        }

        match self.ledger.debit(user, order, sum).await? {
            DebitResult::Debited(withdrawal) => Ok(WithdrawOutcome::Accepted(withdrawal)),
            DebitResult::InsufficientFunds { .. } => Ok(WithdrawOutcome::InsufficientFunds),
        }
    }

    async fn list_withdrawals(&self, user: &UserId) -> Result<Listing<Withdrawal>, ServiceError> {
        Ok(self.ledger.withdrawals(user).await?.into())
    }
}
