//! Cooperative cancel and pause for running operations

use crate::driver::{ConflictPolicy, EnvironmentDriver, Row, RowWindow};
use crate::error::AppError;
use crate::schema::{SchemaDifference, TableRef};
use async_trait::async_trait;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

/// Shared between a running clone and the API calls that steer it.
/// Cancellation is observed at phase boundaries; a pause holds the run
/// before its next driver call, mid-phase included.
pub struct OperationControl {
    cancelled: AtomicBool,
    paused: watch::Sender<bool>,
}

impl Default for OperationControl {
    fn default() -> Self {
        Self::new()
    }
}

impl OperationControl {
    pub fn new() -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            cancelled: AtomicBool::new(false),
            paused,
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        // a paused run must wake up to notice
        self.paused.send_replace(false);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn pause(&self) {
        self.paused.send_replace(true);
    }

    pub fn resume(&self) {
        self.paused.send_replace(false);
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// Block until resumed (or cancelled); returns at once when not paused
    pub async fn wait_while_paused(&self) {
        let mut paused = self.paused.subscribe();
        while *paused.borrow_and_update() {
            if paused.changed().await.is_err() {
                break;
            }
        }
    }

    /// Block while paused, then fail if cancellation was requested
    pub async fn checkpoint(&self) -> Result<(), AppError> {
        self.wait_while_paused().await;
        if self.is_cancelled() {
            return Err(AppError::Cancelled("cancellation requested".to_string()));
        }
        Ok(())
    }
}

/// The driver a running clone works through. Every call waits out a pause
/// first and then runs under the operation timeout, so paused time is not
/// counted against it.
pub struct PausableDriver<'a> {
    inner: &'a dyn EnvironmentDriver,
    control: &'a OperationControl,
    timeout_ms: u64,
}

impl<'a> PausableDriver<'a> {
    pub fn new(inner: &'a dyn EnvironmentDriver, control: &'a OperationControl, timeout_ms: u64) -> Self {
        Self {
            inner,
            control,
            timeout_ms,
        }
    }

    async fn gated<T>(&self, label: &str, work: impl Future<Output = Result<T, AppError>>) -> Result<T, AppError> {
        if self.control.is_paused() {
            debug!("{} held while paused", label);
        }
        self.control.wait_while_paused().await;
        match tokio::time::timeout(Duration::from_millis(self.timeout_ms), work).await {
            Ok(result) => result,
            Err(_) => Err(AppError::Timeout(format!("{} exceeded {} ms", label, self.timeout_ms))),
        }
    }
}

#[async_trait]
impl EnvironmentDriver for PausableDriver<'_> {
    async fn execute(&self, sql: &str) -> Result<(), AppError> {
        self.gated("statement", self.inner.execute(sql)).await
    }

    async fn fetch_rows(&self, table: &TableRef, window: &RowWindow) -> Result<Vec<Row>, AppError> {
        self.gated("row fetch", self.inner.fetch_rows(table, window)).await
    }

    async fn insert_rows(&self, table: &TableRef, rows: &[Row], policy: ConflictPolicy) -> Result<u64, AppError> {
        self.gated("row insert", self.inner.insert_rows(table, rows, policy)).await
    }

    async fn update_rows(&self, table: &TableRef, key_columns: &[String], rows: &[Row]) -> Result<u64, AppError> {
        self.gated("row update", self.inner.update_rows(table, key_columns, rows)).await
    }

    async fn truncate(&self, tables: &[TableRef]) -> Result<(), AppError> {
        self.gated("truncate", self.inner.truncate(tables)).await
    }

    async fn count_rows(&self, table: &TableRef) -> Result<u64, AppError> {
        self.gated("row count", self.inner.count_rows(table)).await
    }

    async fn apply_difference(&self, difference: &SchemaDifference, sql: &str) -> Result<(), AppError> {
        self.gated("schema change", self.inner.apply_difference(difference, sql)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SchemaDefinition;
    use crate::testing::MemoryDriver;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_checkpoint_waits_for_resume() {
        let control = Arc::new(OperationControl::new());
        control.pause();

        let waiter = {
            let control = control.clone();
            tokio::spawn(async move { control.checkpoint().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        control.resume();
        assert!(waiter.await.unwrap().is_ok());
    }

    #[test]
    fn test_checkpoint_is_pending_while_paused() {
        let control = OperationControl::new();
        control.pause();

        let mut checkpoint = tokio_test::task::spawn(control.checkpoint());
        tokio_test::assert_pending!(checkpoint.poll());

        control.resume();
        assert!(checkpoint.is_woken());
        tokio_test::assert_ready_ok!(checkpoint.poll());
    }

    #[tokio::test]
    async fn test_pausable_driver_holds_calls_while_paused() {
        let control = OperationControl::new();
        let db = MemoryDriver::new(SchemaDefinition::empty());
        let driver = PausableDriver::new(&db, &control, 1_000);

        control.pause();
        let held = tokio::time::timeout(Duration::from_millis(50), driver.execute("ANALYZE orders")).await;
        assert!(held.is_err());
        assert_eq!(db.mutation_count(), 0);

        control.resume();
        driver.execute("ANALYZE orders").await.unwrap();
        assert_eq!(db.executed(), vec!["ANALYZE orders".to_string()]);
    }

    #[tokio::test]
    async fn test_pausable_driver_times_out_slow_calls() {
        let control = OperationControl::new();
        let db = MemoryDriver::new(SchemaDefinition::empty());
        db.set_delay(Duration::from_millis(200));
        let driver = PausableDriver::new(&db, &control, 20);

        assert!(matches!(driver.execute("ANALYZE orders").await, Err(AppError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_cancel_releases_a_paused_checkpoint() {
        let control = Arc::new(OperationControl::new());
        control.pause();

        let waiter = {
            let control = control.clone();
            tokio::spawn(async move { control.checkpoint().await })
        };
        control.cancel();
        assert!(matches!(waiter.await.unwrap(), Err(AppError::Cancelled(_))));
        assert!(!control.is_paused());
    }
}
