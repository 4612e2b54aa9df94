//! Per-user point balances.

use std::sync::Arc;

use chrono::Utc;
use model::{Balance, Points, UserId, Withdrawal};
use repository::{DebitOutcome, LedgerRepository};
use tracing::{info, instrument};

use crate::ServiceError;

/// Result of [`Ledger::debit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DebitResult {
    /// The points were withdrawn and the withdrawal recorded.
    Debited(Withdrawal),
    /// The balance does not cover the amount; nothing changed.
    InsufficientFunds { current: Points },
}

/// Owns every user's accrued and withdrawn totals.
///
/// The "never negative" rule is enforced here and in the repository, not by
/// callers: a debit checks and mutates the balance in one atomic step.
#[derive(Clone)]
pub struct Ledger {
    repo: Arc<dyn LedgerRepository>,
}

impl Ledger {
    pub fn new(repo: Arc<dyn LedgerRepository>) -> Self {
        Self { repo }
    }

    /// Adds `amount` to the accrued total of `user`.
    pub async fn credit(&self, user: &UserId, amount: Points) -> Result<Balance, ServiceError> {
        let entry = self.repo.credit(user, amount).await?;
        Ok(entry.balance())
    }

    /// Withdraws `amount` from `user` against the payment reference `order`.
    ///
    /// # Errors
    /// Returns [`ServiceError::InvalidAmount`] for a zero amount and
    /// [`ServiceError::Repository`] if the storage fails.
    #[instrument(skip(self, user), fields(user = %user))]
    pub async fn debit(
        &self,
        user: &UserId,
        order: &str,
        amount: Points,
    ) -> Result<DebitResult, ServiceError> {
        if amount == 0 {
            return Err(ServiceError::InvalidAmount);
        }

        let withdrawal = Withdrawal {
            order: order.to_string(),
            sum: amount,
            processed_at: Utc::now(),
        };
        match self.repo.debit(user, &withdrawal).await? {
            DebitOutcome::Applied(entry) => {
                info!(current = entry.current(), "Points withdrawn");
                Ok(DebitResult::Debited(withdrawal))
            }
            DebitOutcome::InsufficientFunds(entry) => {
                info!(current = entry.current(), "Withdrawal rejected: insufficient funds");
                Ok(DebitResult::InsufficientFunds {
                    current: entry.current(),
                })
            }
        }
    }

    /// Point-in-time balance of `user`.
    pub async fn read(&self, user: &UserId) -> Result<Balance, ServiceError> {
        Ok(self.repo.entry(user).await?.balance())
    }

    /// Withdrawals of `user`, oldest first.
    pub async fn withdrawals(&self, user: &UserId) -> Result<Vec<Withdrawal>, ServiceError> {
        Ok(self.repo.withdrawals(user).await?)
    }
}
