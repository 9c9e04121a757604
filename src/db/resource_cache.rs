use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use sqlx::SqlitePool;

use crate::models::ResourceKind;

/// A cached copy of a server resource
#[derive(Debug, Clone, PartialEq)]
pub struct CachedResource {
    pub kind: ResourceKind,
    pub body: Value,
    pub fetched_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct ResourceRow {
    body: String,
    fetched_at: String,
}

/// Local copies of the reference data a registration form reads offline.
#[derive(Clone)]
pub struct ResourceCache {
    pool: SqlitePool,
}

impl ResourceCache {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn put(&self, kind: ResourceKind, body: &Value) -> Result<(), sqlx::Error> {
        let fetched_at = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);

        sqlx::query(
            r#"
            INSERT INTO offline_resources (kind, body, fetched_at) VALUES (?, ?, ?)
            ON CONFLICT(kind) DO UPDATE SET body = excluded.body, fetched_at = excluded.fetched_at
            "#,
        )
        .bind(kind.as_str())
        .bind(body.to_string())
        .bind(&fetched_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get(&self, kind: ResourceKind) -> Result<Option<CachedResource>, sqlx::Error> {
        let row: Option<ResourceRow> =
            sqlx::query_as("SELECT body, fetched_at FROM offline_resources WHERE kind = ?")
                .bind(kind.as_str())
                .fetch_optional(&self.pool)
                .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let body = serde_json::from_str(&row.body).map_err(|e| sqlx::Error::Decode(Box::new(e)))?;
        let fetched_at = DateTime::parse_from_rfc3339(&row.fetched_at)
            .map_err(|e| sqlx::Error::Decode(Box::new(e)))?
            .with_timezone(&Utc);

        Ok(Some(CachedResource {
            kind,
            body,
            fetched_at,
        }))
    }
}
