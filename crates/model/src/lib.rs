//! Domain types shared by every layer of the loyalty backend.
//!
//! Orders, withdrawals and ledger entries are plain data here; the order
//! status state machine and the ledger arithmetic live next to the types so
//! that every storage backend enforces the same rules.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod luhn;

/// Integer loyalty points.
pub type Points = u64;

/// UserId: opaque identity resolved by the authentication layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for UserId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Lifecycle status of an uploaded order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    New,
    Processing,
    Processed,
    Invalid,
}

impl OrderStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            OrderStatus::New => "NEW",
            OrderStatus::Processing => "PROCESSING",
            OrderStatus::Processed => "PROCESSED",
            OrderStatus::Invalid => "INVALID",
        }
    }

    /// `PROCESSED` and `INVALID` accept no further transitions.
    pub const fn is_terminal(self) -> bool {
        matches!(self, OrderStatus::Processed | OrderStatus::Invalid)
    }

    /// Orders the accrual poller still has to look at.
    pub const fn is_pending(self) -> bool {
        !self.is_terminal()
    }

    const fn rank(self) -> u8 {
        match self {
            OrderStatus::New => 0,
            OrderStatus::Processing => 1,
            OrderStatus::Processed | OrderStatus::Invalid => 2,
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown order status: {0}")]
pub struct ParseStatusError(String);

impl FromStr for OrderStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NEW" => Ok(OrderStatus::New),
            "PROCESSING" => Ok(OrderStatus::Processing),
            "PROCESSED" => Ok(OrderStatus::Processed),
            "INVALID" => Ok(OrderStatus::Invalid),
            other => Err(ParseStatusError(other.to_string())),
        }
    }
}

/// A status change reported for an order by the accrual pipeline.
///
/// Only `Processed` carries points, so an accrual can never be attached to
/// any other status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderUpdate {
    Processing,
    Processed { accrual: Points },
    Invalid,
}

impl OrderUpdate {
    pub const fn status(self) -> OrderStatus {
        match self {
            OrderUpdate::Processing => OrderStatus::Processing,
            OrderUpdate::Processed { .. } => OrderStatus::Processed,
            OrderUpdate::Invalid => OrderStatus::Invalid,
        }
    }

    pub const fn accrual(self) -> Option<Points> {
        match self {
            OrderUpdate::Processed { accrual } => Some(accrual),
            _ => None,
        }
    }
}

/// Result of applying an [`OrderUpdate`] to an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The status moved forward; `credit` is owed to the owner when set.
    Advanced {
        from: OrderStatus,
        to: OrderStatus,
        credit: Option<Points>,
    },
    /// The order already had the reported status.
    Unchanged(OrderStatus),
    /// The report would move the order backwards or out of a terminal state.
    Rejected { from: OrderStatus, to: OrderStatus },
}

impl Transition {
    pub const fn credit(&self) -> Option<Points> {
        match self {
            Transition::Advanced { credit, .. } => *credit,
            _ => None,
        }
    }
}

/// Order: a purchase uploaded by a user for points accrual.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Order {
    pub number: String,
    #[serde(skip)]
    pub owner: UserId,
    pub status: OrderStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accrual: Option<Points>,
    pub uploaded_at: DateTime<Utc>,
}

impl Order {
    /// A freshly uploaded order in `NEW` status.
    pub fn new(number: impl Into<String>, owner: UserId, uploaded_at: DateTime<Utc>) -> Self {
        Self {
            number: number.into(),
            owner,
            status: OrderStatus::New,
            accrual: None,
            uploaded_at,
        }
    }

    /// Works out what `update` would do to this order without touching it.
    ///
    /// Statuses only move forward (`NEW -> PROCESSING -> PROCESSED | INVALID`,
    /// skipping steps is allowed). Repeating the current status is a no-op, and
    /// so an order that is already `PROCESSED` is never credited twice.
    pub fn plan(&self, update: OrderUpdate) -> Transition {
        let to = update.status();
        if to == self.status {
            return Transition::Unchanged(self.status);
        }
        if self.status.is_terminal() || to.rank() < self.status.rank() {
            return Transition::Rejected {
                from: self.status,
                to,
            };
        }
        Transition::Advanced {
            from: self.status,
            to,
            credit: update.accrual(),
        }
    }

    /// Writes an [`Transition::Advanced`] into the order; other variants are ignored.
    pub fn apply(&mut self, transition: &Transition) {
        if let Transition::Advanced { to, credit, .. } = *transition {
            self.status = to;
            if credit.is_some() {
                self.accrual = credit;
            }
        }
    }
}

/// Withdrawal: points spent against a purchase.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Withdrawal {
    /// Payment reference supplied by the user.
    pub order: String,
    pub sum: Points,
    pub processed_at: DateTime<Utc>,
}

/// Balance snapshot handed to callers.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Balance {
    pub current: Points,
    pub withdrawn: Points,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LedgerError {
    #[error("insufficient funds: requested {requested}, available {current}")]
    InsufficientFunds { current: Points, requested: Points },
    #[error("points counter overflow")]
    Overflow,
}

/// Per-user running totals.
///
/// `withdrawn <= accrued` holds for every value produced through
/// [`LedgerEntry::credit`] and [`LedgerEntry::debit`]; both leave the entry
/// untouched when they fail.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LedgerEntry {
    pub accrued: Points,
    pub withdrawn: Points,
}

impl LedgerEntry {
    pub fn current(&self) -> Points {
        self.accrued.saturating_sub(self.withdrawn)
    }

    pub fn credit(&mut self, amount: Points) -> Result<(), LedgerError> {
        self.accrued = self
            .accrued
            .checked_add(amount)
            .ok_or(LedgerError::Overflow)?;
        Ok(())
    }

    pub fn debit(&mut self, amount: Points) -> Result<(), LedgerError> {
        let current = self.current();
        if amount > current {
            return Err(LedgerError::InsufficientFunds {
                current,
                requested: amount,
            });
        }
        self.withdrawn = self
            .withdrawn
            .checked_add(amount)
            .ok_or(LedgerError::Overflow)?;
        Ok(())
    }

    pub fn balance(&self) -> Balance {
        Balance {
            current: self.current(),
            withdrawn: self.withdrawn,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn order(status: OrderStatus) -> Order {
        let mut order = Order::new("9278923470", UserId::from("alice"), Utc::now());
        order.status = status;
        order
    }

    #[test]
    fn test_serialize_order_to_json() {
        let uploaded_at = Utc.with_ymd_and_hms(2020, 12, 10, 12, 15, 45).unwrap();
        let mut processed = Order::new("9278923470", UserId::from("alice"), uploaded_at);
        processed.status = OrderStatus::Processed;
        processed.accrual = Some(500);
        let pending = Order::new("12345678903", UserId::from("alice"), uploaded_at);

        let json = serde_json::to_value(&processed).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "number": "9278923470",
                "status": "PROCESSED",
                "accrual": 500,
                "uploaded_at": "2020-12-10T12:15:45Z"
            })
        );

        // accrual is omitted until the order is processed, owner is never exposed
        let json = serde_json::to_value(&pending).unwrap();
        assert!(json.get("accrual").is_none());
        assert!(json.get("owner").is_none());
        assert_eq!(json["status"], "NEW");
    }

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [
            OrderStatus::New,
            OrderStatus::Processing,
            OrderStatus::Processed,
            OrderStatus::Invalid,
        ] {
            assert_eq!(status.as_str().parse::<OrderStatus>(), Ok(status));
        }
        assert!("DONE".parse::<OrderStatus>().is_err());
    }

    #[test]
    fn test_plan_moves_forward() {
        assert_eq!(
            order(OrderStatus::New).plan(OrderUpdate::Processing),
            Transition::Advanced {
                from: OrderStatus::New,
                to: OrderStatus::Processing,
                credit: None
            }
        );
        assert_eq!(
            order(OrderStatus::Processing).plan(OrderUpdate::Processed { accrual: 500 }),
            Transition::Advanced {
                from: OrderStatus::Processing,
                to: OrderStatus::Processed,
                credit: Some(500)
            }
        );
        // the provider may report a final status on the first query
        assert_eq!(
            order(OrderStatus::New).plan(OrderUpdate::Invalid).credit(),
            None
        );
    }

    #[test]
    fn test_plan_is_idempotent_and_terminal() {
        assert_eq!(
            order(OrderStatus::Processing).plan(OrderUpdate::Processing),
            Transition::Unchanged(OrderStatus::Processing)
        );
        assert_eq!(
            order(OrderStatus::Processed).plan(OrderUpdate::Processed { accrual: 500 }),
            Transition::Unchanged(OrderStatus::Processed)
        );
        assert_eq!(
            order(OrderStatus::Processed).plan(OrderUpdate::Invalid),
            Transition::Rejected {
                from: OrderStatus::Processed,
                to: OrderStatus::Invalid
            }
        );
        assert_eq!(
            order(OrderStatus::Invalid).plan(OrderUpdate::Processing),
            Transition::Rejected {
                from: OrderStatus::Invalid,
                to: OrderStatus::Processing
            }
        );
    }

    #[test]
    fn test_apply_sets_accrual_once() {
        let mut order = order(OrderStatus::New);
        let transition = order.plan(OrderUpdate::Processed { accrual: 500 });
        order.apply(&transition);
        assert_eq!(order.status, OrderStatus::Processed);
        assert_eq!(order.accrual, Some(500));

        let again = order.plan(OrderUpdate::Processed { accrual: 900 });
        order.apply(&again);
        assert_eq!(order.accrual, Some(500));
    }

    #[test]
    fn test_ledger_entry_rejects_overdraft_without_mutation() {
        let mut entry = LedgerEntry::default();
        entry.credit(500).unwrap();

        assert_eq!(
            entry.debit(600),
            Err(LedgerError::InsufficientFunds {
                current: 500,
                requested: 600
            })
        );
        assert_eq!(entry, LedgerEntry { accrued: 500, withdrawn: 0 });

        entry.debit(500).unwrap();
        assert_eq!(entry.balance(), Balance { current: 0, withdrawn: 500 });
    }

    #[test]
    fn test_ledger_entry_detects_overflow() {
        let mut entry = LedgerEntry {
            accrued: Points::MAX,
            withdrawn: 0,
        };
        assert_eq!(entry.credit(1), Err(LedgerError::Overflow));
        assert_eq!(entry.accrued, Points::MAX);
    }
}
