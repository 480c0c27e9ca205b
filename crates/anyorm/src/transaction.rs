//! Transaction state tracking and the [`transaction!`] macro.
//!
//! Each driver handle owns one [`TransactionTracker`]. The lifecycle is
//! `Idle -> Active -> {Committed, RolledBack}`; the terminal states behave like
//! `Idle`, so the handle can start the next transaction. At most one transaction
//! is active per handle.
//!
//! # Example
//!
//! ```ignore
//! use anyorm::{OrmError, OrmResult, QueryBuilder, Row};
//!
//! # async fn demo(driver: &anyorm::PgDriver) -> OrmResult<()> {
//! anyorm::transaction!(driver, {
//!     QueryBuilder::on(driver, "accounts")
//!         .where_eq("id", 1)
//!         .update(driver, Row::from_pairs([("balance", 0i64)]))
//!         .await?;
//!     Ok::<(), OrmError>(())
//! })?;
//! # Ok(()) }
//! ```

use crate::error::{OrmError, OrmResult};
use std::sync::Mutex;

/// Runs the given block inside a transaction on a [`Driver`](crate::Driver).
///
/// - Begins via `Driver::begin_transaction`.
/// - Commits on `Ok(_)`.
/// - Rolls back on `Err(_)`, returning the original error.
///
/// The block must evaluate to `anyorm::OrmResult<T>`.
#[macro_export]
macro_rules! transaction {
    ($driver:expr, $body:block) => {{
        let __anyorm_driver = $driver;
        $crate::Driver::begin_transaction(__anyorm_driver).await?;

        let __anyorm_tx_body_result = async { $body }.await;
        match __anyorm_tx_body_result {
            Ok(value) => {
                $crate::Driver::commit(__anyorm_driver).await?;
                Ok(value)
            }
            Err(error) => match $crate::Driver::rollback(__anyorm_driver).await {
                Ok(()) => Err(error),
                Err(rollback_err) => Err($crate::OrmError::Other(format!(
                    "{error} (rollback failed: {rollback_err})"
                ))),
            },
        }
    }};
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Idle,
    Active,
    Committed,
    RolledBack,
}

/// Per-handle transaction state.
#[derive(Debug)]
pub struct TransactionTracker {
    state: Mutex<TransactionState>,
}

impl Default for TransactionTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionTracker {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TransactionState::Idle),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TransactionState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> TransactionState {
        *self.lock()
    }

    pub fn is_active(&self) -> bool {
        self.state() == TransactionState::Active
    }

    /// Move to `Active`. Fails if a transaction is already active.
    pub fn begin(&self) -> OrmResult<()> {
        let mut state = self.lock();
        if *state == TransactionState::Active {
            return Err(OrmError::TransactionAlreadyActive);
        }
        *state = TransactionState::Active;
        tracing::debug!(target: "anyorm.tx", "transaction begin");
        Ok(())
    }

    /// Undo a `begin` whose `BEGIN` statement failed.
    pub fn abort_begin(&self) {
        *self.lock() = TransactionState::Idle;
    }

    pub fn commit(&self) -> OrmResult<()> {
        self.finish(TransactionState::Committed)
    }

    pub fn rollback(&self) -> OrmResult<()> {
        self.finish(TransactionState::RolledBack)
    }

    /// Fail unless a transaction is active.
    pub fn ensure_active(&self) -> OrmResult<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(OrmError::NoActiveTransaction)
        }
    }

    fn finish(&self, outcome: TransactionState) -> OrmResult<()> {
        let mut state = self.lock();
        if *state != TransactionState::Active {
            return Err(OrmError::NoActiveTransaction);
        }
        *state = outcome;
        tracing::debug!(target: "anyorm.tx", outcome = ?outcome, "transaction finished");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle() {
        let tx = TransactionTracker::new();
        assert_eq!(tx.state(), TransactionState::Idle);
        tx.begin().unwrap();
        assert!(tx.is_active());
        assert!(matches!(tx.begin(), Err(OrmError::TransactionAlreadyActive)));
        tx.commit().unwrap();
        assert_eq!(tx.state(), TransactionState::Committed);

        tx.begin().unwrap();
        tx.rollback().unwrap();
        assert_eq!(tx.state(), TransactionState::RolledBack);
        assert!(matches!(tx.commit(), Err(OrmError::NoActiveTransaction)));
    }

    #[test]
    fn aborted_begin_returns_to_idle() {
        let tx = TransactionTracker::new();
        tx.begin().unwrap();
        tx.abort_begin();
        assert_eq!(tx.state(), TransactionState::Idle);
        assert!(tx.ensure_active().is_err());
    }
}
