//! Order ingestion: uniqueness, idempotent re-upload and status updates.

use std::sync::Arc;

use chrono::Utc;
use model::{Order, OrderUpdate, Transition, UserId, luhn};
use repository::{InsertOutcome, OrdersRepository, RepositoryError};
use tokio::sync::Notify;
use tracing::{debug, error, info, instrument, warn};

use crate::ServiceError;

/// Result of [`OrderStore::submit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// A new order was created in `NEW` status.
    Accepted,
    /// The same user uploaded this number before; nothing changed.
    AlreadyOwnedByUser,
    /// Another user owns this number.
    OwnedByOther,
    /// The number fails the Luhn check.
    InvalidFormat,
}

/// Owns the orders of all users on top of an [`OrdersRepository`].
///
/// Cheap to clone; clones share the repository and the pending-work signal.
#[derive(Clone)]
pub struct OrderStore {
    repo: Arc<dyn OrdersRepository>,
    pending: Arc<Notify>,
}

impl OrderStore {
    pub fn new(repo: Arc<dyn OrdersRepository>) -> Self {
        Self {
            repo,
            pending: Arc::new(Notify::new()),
        }
    }

    /// Signal raised whenever a new order is accepted.
    ///
    /// The accrual poller waits on it to pick up fresh uploads without
    /// waiting for its next scheduled cycle.
    pub fn pending_signal(&self) -> Arc<Notify> {
        Arc::clone(&self.pending)
    }

    /// Registers `number` for `user`.
    ///
    /// # Errors
    /// Returns [`ServiceError::Repository`] if the storage fails.
    #[instrument(skip(self, user), fields(user = %user))]
    pub async fn submit(&self, user: &UserId, number: &str) -> Result<SubmitOutcome, ServiceError> {
        if !luhn::is_valid(number) {
            return Ok(SubmitOutcome::InvalidFormat);
        }

        let order = Order::new(number, user.clone(), Utc::now());
        match self.repo.insert(&order).await? {
            InsertOutcome::Inserted => {
                info!(order = number, "Order accepted");
                self.pending.notify_one();
                Ok(SubmitOutcome::Accepted)
            }
            InsertOutcome::Existing { owner } if owner == *user => {
                debug!(order = number, "Order already uploaded by this user");
                Ok(SubmitOutcome::AlreadyOwnedByUser)
            }
            InsertOutcome::Existing { .. } => {
                warn!(order = number, "Order number belongs to another user");
                Ok(SubmitOutcome::OwnedByOther)
            }
        }
    }

    /// Orders of `user`, oldest upload first.
    pub async fn list_by_user(&self, user: &UserId) -> Result<Vec<Order>, ServiceError> {
        Ok(self.repo.list_by_owner(user).await?)
    }

    /// Up to `limit` orders still waiting for a final accrual status,
    /// leaving out the numbers in `exclude`.
    pub async fn pending(
        &self,
        limit: usize,
        exclude: &[String],
    ) -> Result<Vec<Order>, ServiceError> {
        Ok(self.repo.list_pending(limit, exclude).await?)
    }

    /// Applies an accrual report to the order `number`.
    ///
    /// A transition to `PROCESSED` credits the owner in the same atomic step.
    /// Repeated or out-of-order reports leave the order untouched.
    ///
    /// # Errors
    /// Returns [`ServiceError::InternalInconsistency`] when the order is
    /// missing or its stored state contradicts an invariant; the record is
    /// left as it was.
    #[instrument(skip(self))]
    pub async fn apply_accrual_result(
        &self,
        number: &str,
        update: OrderUpdate,
    ) -> Result<Transition, ServiceError> {
        let transition = self
            .repo
            .apply_update(number, update)
            .await
            .map_err(|err| match err {
                RepositoryError::NotFound => {
                    ServiceError::InternalInconsistency(format!("order {number} is not stored"))
                }
                RepositoryError::Inconsistent(reason) => {
                    ServiceError::InternalInconsistency(reason)
                }
                other => ServiceError::Repository(other),
            });

        match &transition {
            Ok(Transition::Advanced { from, to, credit }) => {
                info!(order = number, %from, %to, credit = ?credit, "Order status advanced");
            }
            Ok(Transition::Unchanged(status)) => {
                debug!(order = number, %status, "Order status unchanged");
            }
            Ok(Transition::Rejected { from, to }) => {
                warn!(order = number, %from, %to, "Ignoring out-of-order accrual report");
            }
            Err(ServiceError::InternalInconsistency(reason)) => {
                error!(order = number, reason = %reason, "Internal inconsistency while applying accrual");
            }
            Err(_) => {}
        }
        transition
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memory_store::MemoryStore;
    use model::OrderStatus;
    use std::time::Duration;

    fn store() -> OrderStore {
        OrderStore::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn test_submit_rejects_bad_format_before_storage() {
        let orders = store();
        let alice = UserId::from("alice");
        for number in ["", "12345678902", "1234-5678-903", " 12345678903"] {
            assert_eq!(
                orders.submit(&alice, number).await.unwrap(),
                SubmitOutcome::InvalidFormat
            );
        }
        assert!(orders.list_by_user(&alice).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_submit_raises_pending_signal() {
        let orders = store();
        let signal = orders.pending_signal();

        orders
            .submit(&UserId::from("alice"), "12345678903")
            .await
            .unwrap();

        // notify_one stores a permit, so a late waiter still wakes up
        tokio::time::timeout(Duration::from_secs(1), signal.notified())
            .await
            .expect("pending signal was not raised");
    }

    #[tokio::test]
    async fn test_apply_on_unknown_order_is_inconsistent() {
        let orders = store();
        let err = orders
            .apply_accrual_result("12345678903", OrderUpdate::Processing)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::InternalInconsistency(_)));
    }

    #[tokio::test]
    async fn test_pending_returns_oldest_first() {
        let orders = store();
        let alice = UserId::from("alice");
        for number in ["12345678903", "9278923470", "346436439"] {
            orders.submit(&alice, number).await.unwrap();
        }
        orders
            .apply_accrual_result("9278923470", OrderUpdate::Invalid)
            .await
            .unwrap();

        let pending = orders.pending(10, &[]).await.unwrap();
        let numbers: Vec<_> = pending.iter().map(|o| o.number.as_str()).collect();
        assert_eq!(numbers, ["12345678903", "346436439"]);
        assert!(pending.iter().all(|o| o.status == OrderStatus::New));

        // exclusion applies before the limit
        let pending = orders
            .pending(1, &["12345678903".to_string()])
            .await
            .unwrap();
        let numbers: Vec<_> = pending.iter().map(|o| o.number.as_str()).collect();
        assert_eq!(numbers, ["346436439"]);
    }
}
