//! In-memory storage backend for orders and balances, with thread-safe access
//! partitioned per order number and per user.
//!
//! Each order and each user account sits behind its own async mutex inside a
//! sharded map, so unrelated users never wait on each other. Whenever both
//! are needed the order is locked before the account.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use model::{LedgerEntry, LedgerError, Order, OrderUpdate, Points, Transition, UserId, Withdrawal};
use repository::{DebitOutcome, InsertOutcome, LedgerRepository, OrdersRepository, RepositoryError};
use tokio::sync::Mutex;

/// Thread-safe in-memory store implementing both repository traits.
#[derive(Debug, Default)]
pub struct MemoryStore {
    orders: DashMap<String, Arc<OrderSlot>>,
    owners: DashMap<UserId, Vec<String>>,
    accounts: DashMap<UserId, Arc<Mutex<Account>>>,
    next_seq: AtomicU64,
}

#[derive(Debug)]
struct OrderSlot {
    owner: UserId,
    /// Insertion sequence, breaks ties between equal upload times.
    seq: u64,
    order: Mutex<Order>,
}

#[derive(Debug, Default)]
struct Account {
    entry: LedgerEntry,
    withdrawals: Vec<Withdrawal>,
}

impl MemoryStore {
    /// Create a new, empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, number: &str) -> Option<Arc<OrderSlot>> {
        self.orders.get(number).map(|slot| Arc::clone(slot.value()))
    }

    /// Account of `user`, created on first use.
    fn account(&self, user: &UserId) -> Arc<Mutex<Account>> {
        Arc::clone(self.accounts.entry(user.clone()).or_default().value())
    }
}

#[async_trait]
impl OrdersRepository for MemoryStore {
    async fn insert(&self, order: &Order) -> Result<InsertOutcome, RepositoryError> {
        match self.orders.entry(order.number.clone()) {
            Entry::Occupied(existing) => {
                return Ok(InsertOutcome::Existing {
                    owner: existing.get().owner.clone(),
                });
            }
            Entry::Vacant(vacant) => {
                // listed under the owner before the number slot is released
                self.owners
                    .entry(order.owner.clone())
                    .or_default()
                    .push(order.number.clone());
                vacant.insert(Arc::new(OrderSlot {
                    owner: order.owner.clone(),
                    seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
                    order: Mutex::new(order.clone()),
                }));
            }
        }
        Ok(InsertOutcome::Inserted)
    }

    async fn list_by_owner(&self, owner: &UserId) -> Result<Vec<Order>, RepositoryError> {
        let numbers = self
            .owners
            .get(owner)
            .map(|numbers| numbers.value().clone())
            .unwrap_or_default();

        let mut orders = Vec::with_capacity(numbers.len());
        for slot in numbers.iter().filter_map(|number| self.slot(number)) {
            let order = slot.order.lock().await.clone();
            orders.push((slot.seq, order));
        }
        orders.sort_by(|(a_seq, a), (b_seq, b)| {
            a.uploaded_at.cmp(&b.uploaded_at).then(a_seq.cmp(b_seq))
        });
        Ok(orders.into_iter().map(|(_, order)| order).collect())
    }

    async fn list_pending(
        &self,
        limit: usize,
        exclude: &[String],
    ) -> Result<Vec<Order>, RepositoryError> {
        let slots: Vec<Arc<OrderSlot>> = self
            .orders
            .iter()
            .filter(|slot| !exclude.contains(slot.key()))
            .map(|slot| Arc::clone(slot.value()))
            .collect();

        let mut pending = Vec::new();
        for slot in slots {
            let order = slot.order.lock().await;
            if order.status.is_pending() {
                pending.push((order.uploaded_at, slot.seq, order.clone()));
            }
        }
        pending.sort_by_key(|(uploaded_at, seq, _)| (*uploaded_at, *seq));
        pending.truncate(limit);
        Ok(pending.into_iter().map(|(_, _, order)| order).collect())
    }

    async fn apply_update(
        &self,
        number: &str,
        update: OrderUpdate,
    ) -> Result<Transition, RepositoryError> {
        let slot = self.slot(number).ok_or(RepositoryError::NotFound)?;
        let mut order = slot.order.lock().await;

        let transition = order.plan(update);
        if let Some(amount) = transition.credit() {
            let account = self.account(&slot.owner);
            let mut account = account.lock().await;
            // no await from here on: the credit and the status change land together
            account
                .entry
                .credit(amount)
                .map_err(|e| RepositoryError::Inconsistent(format!("order {number}: {e}")))?;
        }
        order.apply(&transition);
        Ok(transition)
    }
}

#[async_trait]
impl LedgerRepository for MemoryStore {
    async fn entry(&self, user: &UserId) -> Result<LedgerEntry, RepositoryError> {
        let account = self.accounts.get(user).map(|a| Arc::clone(a.value()));
        match account {
            Some(account) => Ok(account.lock().await.entry),
            None => Ok(LedgerEntry::default()),
        }
    }

    async fn credit(&self, user: &UserId, amount: Points) -> Result<LedgerEntry, RepositoryError> {
        let account = self.account(user);
        let mut account = account.lock().await;
        account
            .entry
            .credit(amount)
            .map_err(|e| RepositoryError::Inconsistent(format!("user {user}: {e}")))?;
        Ok(account.entry)
    }

    async fn debit(
        &self,
        user: &UserId,
        withdrawal: &Withdrawal,
    ) -> Result<DebitOutcome, RepositoryError> {
        let account = self.account(user);
        let mut account = account.lock().await;
        match account.entry.debit(withdrawal.sum) {
            Ok(()) => {
                account.withdrawals.push(withdrawal.clone());
                Ok(DebitOutcome::Applied(account.entry))
            }
            Err(LedgerError::InsufficientFunds { .. }) => {
                Ok(DebitOutcome::InsufficientFunds(account.entry))
            }
            Err(err @ LedgerError::Overflow) => {
                Err(RepositoryError::Inconsistent(format!("user {user}: {err}")))
            }
        }
    }

    async fn withdrawals(&self, user: &UserId) -> Result<Vec<Withdrawal>, RepositoryError> {
        let account = self.accounts.get(user).map(|a| Arc::clone(a.value()));
        let mut withdrawals = match account {
            Some(account) => account.lock().await.withdrawals.clone(),
            None => Vec::new(),
        };
        withdrawals.sort_by_key(|w| w.processed_at);
        Ok(withdrawals)
    }
}
