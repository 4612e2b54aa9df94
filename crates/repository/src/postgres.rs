//! PostgreSQL implementations of the repository traits.
//!
//! Composite operations run in one transaction and lock the rows they read
//! with `SELECT ... FOR UPDATE`, which serializes writers per order number
//! and per user. Returning early drops the transaction, which rolls it back.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::Pool;
use model::{LedgerEntry, LedgerError, Order, OrderUpdate, Points, Transition, UserId, Withdrawal};
use tokio_postgres::{Row, Transaction};

use crate::{DebitOutcome, InsertOutcome, LedgerRepository, OrdersRepository, RepositoryError};

const ORDER_COLUMNS: &str = "number, user_id, status, accrual, uploaded_at";

/// PostgreSQL implementation of the OrdersRepository trait.
///
/// Owns a connection pool rather than a single client so that polling and
/// request handling never queue behind each other on one connection.
#[derive(Clone)]
pub struct PgOrdersRepository {
    pool: Pool,
}

impl PgOrdersRepository {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OrdersRepository for PgOrdersRepository {
    async fn insert(&self, order: &Order) -> Result<InsertOutcome, RepositoryError> {
        let client = self.pool.get().await?;
        let query = r#"
            INSERT INTO orders (number, user_id, status, uploaded_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (number) DO NOTHING
        "#;
        let inserted = client
            .execute(
                query,
                &[
                    &order.number,
                    &order.owner.as_str(),
                    &order.status.as_str(),
                    &order.uploaded_at,
                ],
            )
            .await?;
        if inserted == 1 {
            return Ok(InsertOutcome::Inserted);
        }

        let row = client
            .query_opt("SELECT user_id FROM orders WHERE number = $1", &[&order.number])
            .await?;
        match row {
            Some(row) => Ok(InsertOutcome::Existing {
                owner: UserId::from(row.try_get::<_, String>("user_id")?),
            }),
            // orders are never deleted, so a conflicting row must still be there
            None => Err(RepositoryError::Inconsistent(format!(
                "order {} conflicted on insert but is missing",
                order.number
            ))),
        }
    }

    async fn list_by_owner(&self, owner: &UserId) -> Result<Vec<Order>, RepositoryError> {
        let client = self.pool.get().await?;
        let query = format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE user_id = $1 ORDER BY uploaded_at, seq"
        );
        let rows = client.query(query.as_str(), &[&owner.as_str()]).await?;
        rows.iter().map(order_from_row).collect()
    }

    async fn list_pending(
        &self,
        limit: usize,
        exclude: &[String],
    ) -> Result<Vec<Order>, RepositoryError> {
        let client = self.pool.get().await?;
        let query = format!(
            "SELECT {ORDER_COLUMNS} FROM orders
             WHERE status IN ('NEW', 'PROCESSING') AND number <> ALL($2)
             ORDER BY uploaded_at, seq
             LIMIT $1"
        );
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = client.query(query.as_str(), &[&limit, &exclude]).await?;
        rows.iter().map(order_from_row).collect()
    }

    async fn apply_update(
        &self,
        number: &str,
        update: OrderUpdate,
    ) -> Result<Transition, RepositoryError> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;

        let query = format!("SELECT {ORDER_COLUMNS} FROM orders WHERE number = $1 FOR UPDATE");
        let row = tx
            .query_opt(query.as_str(), &[&number])
            .await?
            .ok_or(RepositoryError::NotFound)?;
        let order = order_from_row(&row)?;

        let transition = order.plan(update);
        if let Transition::Advanced { to, credit, .. } = transition {
            let accrual = credit.map(to_db).transpose()?;
            tx.execute(
                "UPDATE orders SET status = $2, accrual = COALESCE($3, accrual) WHERE number = $1",
                &[&number, &to.as_str(), &accrual],
            )
            .await?;
            if let Some(amount) = credit {
                credit_tx(&tx, &order.owner, amount).await?;
            }
            tx.commit().await?;
        }
        Ok(transition)
    }
}

/// PostgreSQL implementation of the LedgerRepository trait.
///
/// The `balances` table carries `CHECK (withdrawn <= accrued)`, so even a
/// buggy caller cannot commit a negative balance.
#[derive(Clone)]
pub struct PgLedgerRepository {
    pool: Pool,
}

impl PgLedgerRepository {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LedgerRepository for PgLedgerRepository {
    async fn entry(&self, user: &UserId) -> Result<LedgerEntry, RepositoryError> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "SELECT accrued, withdrawn FROM balances WHERE user_id = $1",
                &[&user.as_str()],
            )
            .await?;
        row.as_ref()
            .map(entry_from_row)
            .transpose()
            .map(Option::unwrap_or_default)
    }

    async fn credit(&self, user: &UserId, amount: Points) -> Result<LedgerEntry, RepositoryError> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;
        let entry = credit_tx(&tx, user, amount).await?;
        tx.commit().await?;
        Ok(entry)
    }

    async fn debit(
        &self,
        user: &UserId,
        withdrawal: &Withdrawal,
    ) -> Result<DebitOutcome, RepositoryError> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;

        // make sure there is a row to lock, even for a user who never earned anything
        tx.execute(
            "INSERT INTO balances (user_id) VALUES ($1) ON CONFLICT (user_id) DO NOTHING",
            &[&user.as_str()],
        )
        .await?;
        let row = tx
            .query_one(
                "SELECT accrued, withdrawn FROM balances WHERE user_id = $1 FOR UPDATE",
                &[&user.as_str()],
            )
            .await?;
        let mut entry = entry_from_row(&row)?;

        match entry.debit(withdrawal.sum) {
            Ok(()) => {}
            Err(LedgerError::InsufficientFunds { .. }) => {
                return Ok(DebitOutcome::InsufficientFunds(entry));
            }
            Err(err @ LedgerError::Overflow) => {
                return Err(RepositoryError::Inconsistent(format!("user {user}: {err}")));
            }
        }

        tx.execute(
            "UPDATE balances SET withdrawn = $2 WHERE user_id = $1",
            &[&user.as_str(), &to_db(entry.withdrawn)?],
        )
        .await?;
        tx.execute(
            r#"
            INSERT INTO withdrawals (user_id, order_number, sum, processed_at)
            VALUES ($1, $2, $3, $4)
            "#,
            &[
                &user.as_str(),
                &withdrawal.order,
                &to_db(withdrawal.sum)?,
                &withdrawal.processed_at,
            ],
        )
        .await?;
        tx.commit().await?;

        Ok(DebitOutcome::Applied(entry))
    }

    async fn withdrawals(&self, user: &UserId) -> Result<Vec<Withdrawal>, RepositoryError> {
        let client = self.pool.get().await?;
        let query = r#"
            SELECT order_number, sum, processed_at
            FROM withdrawals WHERE user_id = $1
            ORDER BY processed_at, seq
        "#;
        let rows = client.query(query, &[&user.as_str()]).await?;
        rows.iter()
            .map(|row| -> Result<Withdrawal, RepositoryError> {
                Ok(Withdrawal {
                    order: row.try_get("order_number")?,
                    sum: from_db(row.try_get("sum")?)?,
                    processed_at: row.try_get::<_, DateTime<Utc>>("processed_at")?,
                })
            })
            .collect()
    }
}

/// Adds `amount` to the accrued total of `user` inside `tx`, creating the
/// balance row on first credit.
pub(crate) async fn credit_tx(
    tx: &Transaction<'_>,
    user: &UserId,
    amount: Points,
) -> Result<LedgerEntry, RepositoryError> {
    let query = r#"
        INSERT INTO balances (user_id, accrued) VALUES ($1, $2)
        ON CONFLICT (user_id) DO UPDATE SET accrued = balances.accrued + EXCLUDED.accrued
        RETURNING accrued, withdrawn
    "#;
    let row = tx
        .query_one(query, &[&user.as_str(), &to_db(amount)?])
        .await?;
    entry_from_row(&row)
}

fn order_from_row(row: &Row) -> Result<Order, RepositoryError> {
    let status: String = row.try_get("status")?;
    let accrual: Option<i64> = row.try_get("accrual")?;
    Ok(Order {
        number: row.try_get("number")?,
        owner: UserId::from(row.try_get::<_, String>("user_id")?),
        status: status
            .parse()
            .map_err(|e| RepositoryError::Inconsistent(format!("{e}")))?,
        accrual: accrual.map(from_db).transpose()?,
        uploaded_at: row.try_get("uploaded_at")?,
    })
}

fn entry_from_row(row: &Row) -> Result<LedgerEntry, RepositoryError> {
    Ok(LedgerEntry {
        accrued: from_db(row.try_get("accrued")?)?,
        withdrawn: from_db(row.try_get("withdrawn")?)?,
    })
}

fn to_db(points: Points) -> Result<i64, RepositoryError> {
    i64::try_from(points)
        .map_err(|_| RepositoryError::Inconsistent(format!("{points} points exceed BIGINT")))
}

fn from_db(value: i64) -> Result<Points, RepositoryError> {
    Points::try_from(value)
        .map_err(|_| RepositoryError::Inconsistent(format!("negative points value {value}")))
}
