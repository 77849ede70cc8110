use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::query::Query;
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use crate::error::QUERY_CANCELED;
use crate::query::Condition;
use crate::store::{
    CommitOutcome, DocumentStream, ReadConcern, StoreSession, TransactionOptions,
    TransactionalStore, UpdateOutcome, WriteConcern, unique_index_name,
};
use crate::{Collection, Document, DocumentId, Filter, Result, StoreError, Update};

const UNIQUE_VIOLATION: &str = "23505";
const PRIMARY_KEY: &str = "documents_pkey";

/// PostgreSQL-backed document store.
///
/// Documents live in a single `documents` table keyed by
/// `(collection, id)` with a JSONB body. Snapshot transactions run at
/// `REPEATABLE READ`, where PostgreSQL reports concurrent writes to the same
/// row as serialization failures.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Creates a new PostgreSQL document store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> std::result::Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await
    }

    fn row_to_document(row: PgRow) -> Result<Document> {
        let id = DocumentId::from_uuid(row.try_get::<Uuid, _>("id")?);
        match row.try_get::<Value, _>("body")? {
            Value::Object(body) => Document::from_parts(id, body),
            other => Err(StoreError::InvalidDocument(format!(
                "stored body of {id} is not an object: {other}"
            ))),
        }
    }
}

/// A value bound to a positional parameter.
enum Param {
    Text(String),
    Json(Value),
}

/// Builds a `SELECT` over one collection with the filter's conditions.
///
/// Returns the SQL and its parameters in positional order.
fn select_sql(collection: &Collection, filter: &Filter, for_update: bool) -> (String, Vec<Param>) {
    let mut sql = String::from("SELECT id, body FROM documents WHERE collection = $1");
    let mut params = vec![Param::Text(collection.as_str().to_string())];

    for condition in filter.conditions() {
        match condition {
            Condition::Eq { field, value } => {
                let f = params.len() + 1;
                sql.push_str(&format!(" AND body -> ${f} = ${}", f + 1));
                params.push(Param::Text(field.clone()));
                params.push(Param::Json(value.clone()));
            }
            Condition::Gte { field, value } => {
                let f = params.len() + 1;
                let v = f + 1;
                sql.push_str(&format!(
                    " AND jsonb_typeof(body -> ${f}) = jsonb_typeof(${v}) AND body -> ${f} >= ${v}"
                ));
                params.push(Param::Text(field.clone()));
                params.push(Param::Json(value.clone()));
            }
        }
    }

    sql.push_str(" ORDER BY id ASC LIMIT 1");
    if for_update {
        sql.push_str(" FOR UPDATE");
    }
    (sql, params)
}

fn bind_all(
    mut query: Query<'_, Postgres, PgArguments>,
    params: Vec<Param>,
) -> Query<'_, Postgres, PgArguments> {
    for param in params {
        query = match param {
            Param::Text(text) => query.bind(text),
            Param::Json(json) => query.bind(json),
        };
    }
    query
}

fn map_insert_error(e: sqlx::Error, collection: &Collection, id: DocumentId) -> StoreError {
    if let sqlx::Error::Database(ref db_err) = e
        && db_err.code().as_deref() == Some(UNIQUE_VIOLATION)
    {
        return match db_err.constraint() {
            Some(index) if index != PRIMARY_KEY => StoreError::UniqueViolation {
                collection: collection.clone(),
                index: index.to_string(),
            },
            _ => StoreError::DuplicateKey {
                collection: collection.clone(),
                id,
            },
        };
    }
    StoreError::Database(e)
}

/// Reports a statement cancelled by the lifetime bound as an expired transaction.
fn expired_on_timeout(error: StoreError, max_lifetime: Duration) -> StoreError {
    match &error {
        StoreError::Database(sqlx::Error::Database(db_err))
            if db_err.code().as_deref() == Some(QUERY_CANCELED) =>
        {
            StoreError::TransactionExpired {
                max_lifetime_ms: max_lifetime.as_millis(),
            }
        }
        _ => error,
    }
}

/// Names interpolated into DDL must be plain identifiers.
fn is_identifier(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn create_unique_index_sql(collection: &Collection, field: &str) -> Result<String> {
    if !is_identifier(collection.as_str()) || !is_identifier(field) {
        return Err(StoreError::InvalidIndex(format!(
            "'{collection}.{field}' is not a plain identifier"
        )));
    }
    Ok(format!(
        "CREATE UNIQUE INDEX IF NOT EXISTS {} ON documents ((body ->> '{field}')) \
         WHERE collection = '{collection}'",
        unique_index_name(collection, field)
    ))
}

#[async_trait]
impl TransactionalStore for PostgresStore {
    type Session = PostgresSession;

    async fn start_session(&self) -> Result<PostgresSession> {
        Ok(PostgresSession {
            pool: self.pool.clone(),
            txn: None,
        })
    }

    async fn insert_one(&self, collection: &Collection, document: Document) -> Result<DocumentId> {
        let id = document.id();
        sqlx::query("INSERT INTO documents (collection, id, body) VALUES ($1, $2, $3)")
            .bind(collection.as_str())
            .bind(id.as_uuid())
            .bind(document.into_value())
            .execute(&self.pool)
            .await
            .map_err(|e| map_insert_error(e, collection, id))?;
        Ok(id)
    }

    async fn find_one(&self, collection: &Collection, filter: &Filter) -> Result<Option<Document>> {
        let (sql, params) = select_sql(collection, filter, false);
        let row = bind_all(sqlx::query(&sql), params)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Self::row_to_document).transpose()
    }

    async fn scan(&self, collection: &Collection) -> Result<DocumentStream> {
        use futures_util::stream;

        let rows = sqlx::query(
            r#"
            SELECT id, body
            FROM documents
            WHERE collection = $1
            ORDER BY id ASC
            "#,
        )
        .bind(collection.as_str())
        .fetch_all(&self.pool)
        .await?;

        let documents: Vec<Result<Document>> =
            rows.into_iter().map(Self::row_to_document).collect();
        Ok(Box::pin(stream::iter(documents)))
    }

    async fn drop_collection(&self, collection: &Collection) -> Result<()> {
        sqlx::query("DELETE FROM documents WHERE collection = $1")
            .bind(collection.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn create_unique_index(&self, collection: &Collection, field: &str) -> Result<()> {
        let sql = create_unique_index_sql(collection, field)?;
        sqlx::raw_sql(&sql).execute(&self.pool).await?;
        Ok(())
    }
}

struct PostgresTransaction {
    tx: Transaction<'static, Postgres>,
    options: TransactionOptions,
    started: Instant,
}

/// A session on a [`PostgresStore`], holding at most one open transaction.
///
/// Dropping the session rolls back the open transaction.
pub struct PostgresSession {
    pool: PgPool,
    txn: Option<PostgresTransaction>,
}

impl PostgresSession {
    /// Returns the open transaction, rolling it back first if it outlived its bound.
    async fn active(&mut self) -> Result<&mut PostgresTransaction> {
        let expired = match &self.txn {
            None => return Err(StoreError::NoTransaction),
            Some(txn) => txn.started.elapsed() > txn.options.max_lifetime,
        };

        if expired && let Some(txn) = self.txn.take() {
            let max_lifetime = txn.options.max_lifetime;
            if let Err(e) = txn.tx.rollback().await {
                tracing::warn!(error = %e, "rollback of expired transaction failed");
            }
            return Err(StoreError::TransactionExpired {
                max_lifetime_ms: max_lifetime.as_millis(),
            });
        }

        self.txn.as_mut().ok_or(StoreError::NoTransaction)
    }
}

#[async_trait]
impl StoreSession for PostgresSession {
    async fn start_transaction(&mut self, options: TransactionOptions) -> Result<()> {
        if self.txn.is_some() {
            return Err(StoreError::TransactionInProgress);
        }

        let mut tx = self.pool.begin().await?;

        let isolation = match options.read_concern {
            ReadConcern::Snapshot => "REPEATABLE READ",
            ReadConcern::Local => "READ COMMITTED",
        };
        sqlx::query(&format!("SET TRANSACTION ISOLATION LEVEL {isolation}"))
            .execute(&mut *tx)
            .await?;

        let synchronous_commit = match options.write_concern {
            WriteConcern::Majority => "remote_apply",
            WriteConcern::Acknowledged => "local",
        };
        sqlx::query(&format!(
            "SET LOCAL synchronous_commit TO {synchronous_commit}"
        ))
        .execute(&mut *tx)
        .await?;
        sqlx::query(&format!(
            "SET LOCAL statement_timeout TO {}",
            options.max_lifetime.as_millis()
        ))
        .execute(&mut *tx)
        .await?;

        self.txn = Some(PostgresTransaction {
            tx,
            options,
            started: Instant::now(),
        });
        Ok(())
    }

    async fn insert_one(
        &mut self,
        collection: &Collection,
        document: Document,
    ) -> Result<DocumentId> {
        let txn = self.active().await?;
        let max_lifetime = txn.options.max_lifetime;
        let id = document.id();

        sqlx::query("INSERT INTO documents (collection, id, body) VALUES ($1, $2, $3)")
            .bind(collection.as_str())
            .bind(id.as_uuid())
            .bind(document.into_value())
            .execute(&mut *txn.tx)
            .await
            .map_err(|e| expired_on_timeout(map_insert_error(e, collection, id), max_lifetime))?;
        Ok(id)
    }

    async fn find_one(
        &mut self,
        collection: &Collection,
        filter: &Filter,
    ) -> Result<Option<Document>> {
        let txn = self.active().await?;
        let max_lifetime = txn.options.max_lifetime;
        let (sql, params) = select_sql(collection, filter, false);
        let row = bind_all(sqlx::query(&sql), params)
            .fetch_optional(&mut *txn.tx)
            .await
            .map_err(|e| expired_on_timeout(e.into(), max_lifetime))?;
        row.map(PostgresStore::row_to_document).transpose()
    }

    async fn update_one(
        &mut self,
        collection: &Collection,
        filter: &Filter,
        update: &Update,
    ) -> Result<UpdateOutcome> {
        let txn = self.active().await?;
        let max_lifetime = txn.options.max_lifetime;
        let (sql, params) = select_sql(collection, filter, true);
        let row = bind_all(sqlx::query(&sql), params)
            .fetch_optional(&mut *txn.tx)
            .await
            .map_err(|e| expired_on_timeout(e.into(), max_lifetime))?;

        let Some(row) = row else {
            return Ok(UpdateOutcome::default());
        };
        let mut document = PostgresStore::row_to_document(row)?;

        let modified = update.apply(document.body_mut())?;
        if modified {
            let id = document.id();
            sqlx::query(
                r#"
                UPDATE documents
                SET body = $1, updated_at = NOW()
                WHERE collection = $2 AND id = $3
                "#,
            )
            .bind(document.into_value())
            .bind(collection.as_str())
            .bind(id.as_uuid())
            .execute(&mut *txn.tx)
            .await
            .map_err(|e| expired_on_timeout(e.into(), max_lifetime))?;
        }

        Ok(UpdateOutcome {
            matched: 1,
            modified: u64::from(modified),
        })
    }

    async fn commit_transaction(&mut self) -> CommitOutcome {
        if let Err(e) = self.active().await {
            return CommitOutcome::Failed(e);
        }
        let Some(txn) = self.txn.take() else {
            return CommitOutcome::Failed(StoreError::NoTransaction);
        };

        match txn.tx.commit().await {
            Ok(()) => {
                metrics::counter!("doc_store_commits_total").increment(1);
                CommitOutcome::Committed
            }
            Err(e) => {
                let error = StoreError::Database(e);
                if error.is_connection_loss() {
                    tracing::warn!(error = %error, "connection lost during commit");
                    CommitOutcome::Ambiguous(error)
                } else {
                    CommitOutcome::Failed(error)
                }
            }
        }
    }

    async fn abort_transaction(&mut self) -> Result<()> {
        if let Some(txn) = self.txn.take() {
            txn.tx.rollback().await?;
            metrics::counter!("doc_store_aborts_total").increment(1);
        }
        Ok(())
    }

    async fn end_session(mut self) -> Result<()> {
        self.abort_transaction().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_sql_numbers_parameters_in_order() {
        let filter = Filter::new().eq("sku", "5432").gte("qty", 1);
        let (sql, params) = select_sql(&Collection::new("inventory"), &filter, true);

        assert_eq!(
            sql,
            "SELECT id, body FROM documents WHERE collection = $1 \
             AND body -> $2 = $3 \
             AND jsonb_typeof(body -> $4) = jsonb_typeof($5) AND body -> $4 >= $5 \
             ORDER BY id ASC LIMIT 1 FOR UPDATE"
        );
        assert_eq!(params.len(), 5);
    }

    #[test]
    fn unique_index_is_partial_on_the_collection() {
        let sql = create_unique_index_sql(&Collection::new("orders"), "request_id").unwrap();
        assert_eq!(
            sql,
            "CREATE UNIQUE INDEX IF NOT EXISTS documents_orders_request_id_key \
             ON documents ((body ->> 'request_id')) WHERE collection = 'orders'"
        );
    }

    #[test]
    fn unique_index_rejects_non_identifiers() {
        let result = create_unique_index_sql(&Collection::new("orders"), "id'); DROP TABLE x; --");
        assert!(matches!(result, Err(StoreError::InvalidIndex(_))));
    }

    #[test]
    fn select_sql_without_conditions() {
        let (sql, params) = select_sql(&Collection::new("orders"), &Filter::new(), false);
        assert_eq!(
            sql,
            "SELECT id, body FROM documents WHERE collection = $1 ORDER BY id ASC LIMIT 1"
        );
        assert_eq!(params.len(), 1);
    }
}
