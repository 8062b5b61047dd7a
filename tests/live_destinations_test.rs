// ABOUTME: Integration tests for the PostgreSQL, MySQL and MongoDB destination writers
// ABOUTME: Need live servers; run with TEST_POSTGRES_URL, TEST_MYSQL_URL or TEST_MONGODB_URL set and --ignored

use std::env;
use std::sync::Arc;

use audit_sync::destination::{
    DestinationWriter, MongoDestination, MysqlDestination, PostgresDestination, TargetRow,
    WriteRequest,
};
use audit_sync::event::{FieldMap, PrimaryKey, SourceEngine};
use chrono::{TimeZone, Utc};
use serde_json::json;

fn env_url(key: &str) -> String {
    env::var(key).unwrap_or_else(|_| panic!("{} must be set", key))
}

fn row(id: i64) -> TargetRow {
    TargetRow {
        schema: Some("public".to_string()),
        table: format!("live_test_{}", uuid::Uuid::new_v4().simple()),
        key: PrimaryKey::single("id", json!(id)),
    }
}

fn fields(id: i64, price: i64) -> FieldMap {
    json!({"id": id, "name": "lamp", "price": price})
        .as_object()
        .cloned()
        .unwrap()
}

/// Insert, overwrite, read back and delete one row.
async fn exercise(writer: Arc<dyn DestinationWriter>) {
    let target = row(42);
    let written_at = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
    let mut request = WriteRequest {
        row: target.clone(),
        fields: fields(42, 100),
        source_engine: SourceEngine::Postgres,
        source_timestamp: written_at,
        origin: "pg-main".to_string(),
    };

    assert!(writer.read_version(&target).await.unwrap().is_none());
    writer.upsert(&request).await.unwrap();

    request.fields = fields(42, 110);
    request.source_timestamp = written_at + chrono::Duration::seconds(5);
    writer.upsert(&request).await.unwrap();
    // Applying the same write twice leaves one row.
    writer.upsert(&request).await.unwrap();

    let version = writer.read_version(&target).await.unwrap().unwrap();
    assert_eq!(version.fields["price"], json!(110));
    assert_eq!(version.origin.as_deref(), Some("pg-main"));
    assert_eq!(version.written_at.timestamp(), request.source_timestamp.timestamp());

    writer.delete(&target).await.unwrap();
    assert!(writer.read_version(&target).await.unwrap().is_none());
    writer.delete(&target).await.unwrap();
}

#[tokio::test]
#[ignore]
async fn test_postgres_destination_round_trip() {
    let url = env_url("TEST_POSTGRES_URL");
    exercise(Arc::new(PostgresDestination::new("pg-replica", url, None))).await;
}

#[tokio::test]
#[ignore]
async fn test_mysql_destination_round_trip() {
    let url = env_url("TEST_MYSQL_URL");
    let writer = MysqlDestination::new("mysql-replica", url).unwrap();
    exercise(Arc::new(writer)).await;
}

#[tokio::test]
#[ignore]
async fn test_mongodb_destination_round_trip() {
    let url = env_url("TEST_MONGODB_URL");
    exercise(Arc::new(MongoDestination::new(
        "mongo-replica",
        url,
        Some("audit_sync_test".to_string()),
    )))
    .await;
}
