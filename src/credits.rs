use async_trait::async_trait;
use sqlx::PgPool;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("credit amounts must not be negative (got {0})")]
    NegativeAmount(i64),
}

/// key: credit-ledger -> per-user balance with atomic compare-and-decrement
///
/// `reserve_check` is advisory: it answers whether the balance covers an amount right now and
/// holds nothing. `commit` is the only operation that moves credits and never lets a balance go
/// negative.
#[async_trait]
pub trait CreditLedger: Send + Sync {
    async fn balance(&self, user_id: Uuid) -> Result<i64, LedgerError>;

    async fn reserve_check(&self, user_id: Uuid, amount: i64) -> Result<bool, LedgerError> {
        if amount < 0 {
            return Err(LedgerError::NegativeAmount(amount));
        }
        Ok(self.balance(user_id).await? >= amount)
    }

    /// Deducts `amount` iff the balance still covers it. Returns false when it does not.
    async fn commit(&self, user_id: Uuid, amount: i64) -> Result<bool, LedgerError>;

    /// Hands back credits set aside for a task. Nothing is held before commit, so the ledgers
    /// here have nothing to return.
    async fn release(&self, task_id: Uuid) -> Result<bool, LedgerError> {
        debug!(%task_id, "release requested; no credits held");
        Ok(true)
    }
}

#[derive(Clone)]
pub struct PgCreditLedger {
    pool: PgPool,
}

impl PgCreditLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Adds credits to a user's balance, creating the row when needed.
    pub async fn grant(&self, user_id: Uuid, amount: i64) -> Result<i64, LedgerError> {
        if amount < 0 {
            return Err(LedgerError::NegativeAmount(amount));
        }
        let balance: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO credit_balances (user_id, balance)
            VALUES ($1, $2)
            ON CONFLICT (user_id)
            DO UPDATE SET balance = credit_balances.balance + EXCLUDED.balance, updated_at = NOW()
            RETURNING balance
            "#,
        )
        .bind(user_id)
        .bind(amount)
        .fetch_one(&self.pool)
        .await?;
        Ok(balance)
    }
}

#[async_trait]
impl CreditLedger for PgCreditLedger {
    async fn balance(&self, user_id: Uuid) -> Result<i64, LedgerError> {
        let balance: Option<i64> =
            sqlx::query_scalar("SELECT balance FROM credit_balances WHERE user_id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(balance.unwrap_or(0))
    }

    async fn commit(&self, user_id: Uuid, amount: i64) -> Result<bool, LedgerError> {
        if amount < 0 {
            return Err(LedgerError::NegativeAmount(amount));
        }
        if amount == 0 {
            return Ok(true);
        }
        let result = sqlx::query(
            r#"
            UPDATE credit_balances
            SET balance = balance - $2, updated_at = NOW()
            WHERE user_id = $1 AND balance >= $2
            "#,
        )
        .bind(user_id)
        .bind(amount)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}
