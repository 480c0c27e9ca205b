mod common;

use anyorm::{Dialect, Driver, OrmError, OrmResult, QueryBuilder, Row};
use common::MockDriver;

async fn transfer(driver: &MockDriver, fail: bool) -> OrmResult<u64> {
    anyorm::transaction!(driver, {
        let moved = QueryBuilder::on(driver, "accounts")
            .where_eq("id", 1)
            .update(driver, Row::from_pairs([("balance", 0i64)]))
            .await?;
        if fail {
            return Err(OrmError::validation("insufficient funds"));
        }
        Ok::<u64, OrmError>(moved)
    })
}

#[tokio::test]
async fn commits_on_ok() {
    let driver = MockDriver::empty(Dialect::Postgres);
    assert_eq!(transfer(&driver, false).await.unwrap(), 1);

    let sql = driver.sql();
    assert_eq!(sql.first().map(String::as_str), Some("BEGIN"));
    assert!(sql[1].starts_with(r#"UPDATE "accounts" SET "balance" = $1 WHERE "id" = $2"#));
    assert_eq!(sql.last().map(String::as_str), Some("COMMIT"));
    assert!(!driver.in_transaction());
}

#[tokio::test]
async fn rolls_back_on_err_and_keeps_the_error() {
    let driver = MockDriver::empty(Dialect::Postgres);
    let err = transfer(&driver, true).await.unwrap_err();

    assert!(matches!(err, OrmError::Validation(ref m) if m == "insufficient funds"));
    assert_eq!(driver.sql().last().map(String::as_str), Some("ROLLBACK"));
    assert!(!driver.in_transaction());
}

#[tokio::test]
async fn second_begin_is_rejected() {
    let driver = MockDriver::empty(Dialect::Postgres);
    driver.begin_transaction().await.unwrap();
    let err = driver.begin_transaction().await.unwrap_err();
    assert!(matches!(err, OrmError::TransactionAlreadyActive));

    driver.rollback().await.unwrap();
    driver.begin_transaction().await.unwrap();
    driver.commit().await.unwrap();
}

#[tokio::test]
async fn commit_without_begin_fails() {
    let driver = MockDriver::empty(Dialect::MySql);
    assert!(matches!(
        driver.commit().await,
        Err(OrmError::NoActiveTransaction)
    ));
}

#[tokio::test]
async fn failed_commit_surfaces_and_ends_the_transaction() {
    let driver = MockDriver::empty(Dialect::Postgres);
    driver.fail_next_commit();
    let err = transfer(&driver, false).await.unwrap_err();
    assert!(matches!(err, OrmError::Query(_)));
    assert!(!driver.in_transaction());
}
