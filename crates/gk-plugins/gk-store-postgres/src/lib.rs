//! # gk-store-postgres
//!
//! `DocumentStore` over Postgres. Each collection is one table of
//! `(key TEXT PRIMARY KEY, body JSONB)`; unique fields get expression indexes on
//! the body, and filters compile to `#>` path predicates.

use async_trait::async_trait;
use gk_core::error::StoreError;
use gk_core::filter::{path_segments, Direction, Document, Filter, Sort};
use gk_core::traits::DocumentStore;
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::{Postgres, QueryBuilder};
use std::marker::PhantomData;
use tracing::{debug, info};

pub async fn connect(url: &SecretString, max_connections: u32) -> Result<PgPool, StoreError> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(url.expose_secret())
        .await
        .map_err(|e| StoreError::Backend(format!("connect: {e}")))?;
    info!(max_connections, "postgres pool ready");
    Ok(pool)
}

pub struct PgDocumentStore<D: Document> {
    pool: PgPool,
    _docs: PhantomData<fn() -> D>,
}

impl<D: Document> PgDocumentStore<D> {
    /// Creates the collection's table and unique indexes if they are missing.
    pub async fn open(pool: PgPool) -> Result<Self, StoreError> {
        let table = D::COLLECTION;
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (key TEXT PRIMARY KEY, body JSONB NOT NULL)"
        ))
        .execute(&pool)
        .await
        .map_err(backend)?;

        for field in D::UNIQUE_FIELDS {
            sqlx::query(&format!(
                "CREATE UNIQUE INDEX IF NOT EXISTS {table}_{field}_key ON {table} ((body ->> '{field}'))"
            ))
            .execute(&pool)
            .await
            .map_err(backend)?;
        }
        debug!(collection = table, "collection ready");

        Ok(Self {
            pool,
            _docs: PhantomData,
        })
    }

    fn encode(doc: &D) -> Result<Value, StoreError> {
        serde_json::to_value(doc).map_err(|e| StoreError::Corrupt {
            collection: D::COLLECTION,
            message: e.to_string(),
        })
    }

    fn decode(body: Json<Value>) -> Result<D, StoreError> {
        serde_json::from_value(body.0).map_err(|e| StoreError::Corrupt {
            collection: D::COLLECTION,
            message: e.to_string(),
        })
    }

    fn write_error(key: String, e: sqlx::Error) -> StoreError {
        match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::DuplicateKey {
                collection: D::COLLECTION,
                key,
            },
            _ => backend(e),
        }
    }
}

fn backend(e: sqlx::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

/// Appends `filter` as a boolean SQL expression over the `body` column.
fn push_filter(query: &mut QueryBuilder<'_, Postgres>, filter: &Filter) {
    match filter {
        Filter::All => {
            query.push("TRUE");
        }
        Filter::Eq(path, value) => {
            query
                .push("body #> ")
                .push_bind(path_segments(path))
                .push(" = ")
                .push_bind(Json(value.clone()));
        }
        Filter::IsNull(path) => {
            query
                .push("COALESCE(body #> ")
                .push_bind(path_segments(path))
                .push(", 'null'::jsonb) = 'null'::jsonb");
        }
        Filter::And(parts) | Filter::Or(parts) => {
            if parts.is_empty() {
                query.push(if matches!(filter, Filter::And(_)) { "TRUE" } else { "FALSE" });
                return;
            }
            let joiner = if matches!(filter, Filter::And(_)) { " AND " } else { " OR " };
            query.push("(");
            for (i, part) in parts.iter().enumerate() {
                if i > 0 {
                    query.push(joiner);
                }
                push_filter(query, part);
            }
            query.push(")");
        }
    }
}

fn select<'a>(
    table: &str,
    filter: &Filter,
    sort: Option<&Sort>,
    limit: Option<usize>,
) -> QueryBuilder<'a, Postgres> {
    let mut query = QueryBuilder::new(format!("SELECT body FROM {table} WHERE "));
    push_filter(&mut query, filter);
    if let Some(sort) = sort {
        // Missing paths sort first ascending, as in the in-memory comparator.
        let nulls = match sort.direction {
            Direction::Ascending => " ASC NULLS FIRST",
            Direction::Descending => " DESC NULLS LAST",
        };
        query
            .push(" ORDER BY body #> ")
            .push_bind(path_segments(&sort.path))
            .push(nulls);
    }
    if let Some(limit) = limit {
        query.push(" LIMIT ").push_bind(limit as i64);
    }
    query
}

#[async_trait]
impl<D: Document> DocumentStore<D> for PgDocumentStore<D> {
    async fn upsert(&self, doc: &D) -> Result<(), StoreError> {
        let key = doc.key();
        sqlx::query(&format!(
            "INSERT INTO {} (key, body) VALUES ($1, $2) \
             ON CONFLICT (key) DO UPDATE SET body = EXCLUDED.body",
            D::COLLECTION
        ))
        .bind(&key)
        .bind(Json(Self::encode(doc)?))
        .execute(&self.pool)
        .await
        .map_err(|e| Self::write_error(key, e))?;
        Ok(())
    }

    async fn insert_new(&self, doc: &D) -> Result<(), StoreError> {
        let key = doc.key();
        let inserted = sqlx::query(&format!(
            "INSERT INTO {} (key, body) VALUES ($1, $2) ON CONFLICT DO NOTHING",
            D::COLLECTION
        ))
        .bind(&key)
        .bind(Json(Self::encode(doc)?))
        .execute(&self.pool)
        .await
        .map_err(|e| Self::write_error(key.clone(), e))?
        .rows_affected();

        if inserted == 0 {
            debug!(collection = D::COLLECTION, %key, "insert rejected, key or unique field taken");
            return Err(StoreError::DuplicateKey {
                collection: D::COLLECTION,
                key,
            });
        }
        Ok(())
    }

    async fn find_one(&self, filter: &Filter) -> Result<Option<D>, StoreError> {
        Ok(self.find_many(filter, None, Some(1)).await?.into_iter().next())
    }

    async fn find_many(
        &self,
        filter: &Filter,
        sort: Option<&Sort>,
        limit: Option<usize>,
    ) -> Result<Vec<D>, StoreError> {
        let mut query = select(D::COLLECTION, filter, sort, limit);
        query
            .build_query_scalar::<Json<Value>>()
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?
            .into_iter()
            .map(Self::decode)
            .collect()
    }

    async fn delete_one(&self, filter: &Filter) -> Result<Option<D>, StoreError> {
        let table = D::COLLECTION;
        let mut query = QueryBuilder::new(format!(
            "DELETE FROM {table} WHERE key = (SELECT key FROM {table} WHERE "
        ));
        push_filter(&mut query, filter);
        query.push(" LIMIT 1) RETURNING body");
        query
            .build_query_scalar::<Json<Value>>()
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?
            .map(Self::decode)
            .transpose()
    }

    async fn delete_many(&self, filter: &Filter) -> Result<u64, StoreError> {
        let mut query = QueryBuilder::new(format!("DELETE FROM {} WHERE ", D::COLLECTION));
        push_filter(&mut query, filter);
        Ok(query
            .build()
            .execute(&self.pool)
            .await
            .map_err(backend)?
            .rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sql(filter: &Filter) -> String {
        let mut query = QueryBuilder::<Postgres>::new("");
        push_filter(&mut query, filter);
        query.sql().to_string()
    }

    #[test]
    fn filters_compile_to_path_predicates() {
        let filter = Filter::eq("target_platform_id", 42u64).and(Filter::is_null("closure"));
        assert_eq!(
            sql(&filter),
            "(body #> $1 = $2 AND COALESCE(body #> $3, 'null'::jsonb) = 'null'::jsonb)"
        );
    }

    #[test]
    fn nested_groups_keep_their_parentheses() {
        let filter = Filter::eq("a", 1u64)
            .or(Filter::eq("b", 2u64))
            .and(Filter::All);
        assert_eq!(sql(&filter), "((body #> $1 = $2 OR body #> $3 = $4) AND TRUE)");
        assert_eq!(sql(&Filter::Or(Vec::new())), "FALSE");
    }

    #[test]
    fn select_sorts_and_limits() {
        let query = select(
            "punishments",
            &Filter::All,
            Some(&Sort::descending("audit_id")),
            Some(5),
        );
        assert_eq!(
            query.sql(),
            "SELECT body FROM punishments WHERE TRUE ORDER BY body #> $1 DESC NULLS LAST LIMIT $2"
        );
    }

    /// Runs against a live database when `GATEKEEPER_TEST_DATABASE_URL` is set.
    #[tokio::test]
    async fn live_round_trip_respects_unique_accounts() {
        use gk_core::models::{GameAccount, GameAccountId, IdentityLink};

        let Ok(url) = std::env::var("GATEKEEPER_TEST_DATABASE_URL") else {
            return;
        };
        let pool = connect(&SecretString::from(url), 2).await.unwrap();
        let store = PgDocumentStore::<IdentityLink>::open(pool).await.unwrap();
        store.delete_many(&Filter::All).await.unwrap();

        let account = GameAccount {
            id: GameAccountId::parse(&"c".repeat(32)).unwrap(),
            display_name: "Steve".into(),
        };
        store
            .insert_new(&IdentityLink::self_service(1, &account))
            .await
            .unwrap();
        let err = store
            .insert_new(&IdentityLink::self_service(2, &account))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateKey { .. }));

        let found = store
            .find_one(&Filter::eq("platform_id", 1u64))
            .await
            .unwrap();
        assert_eq!(found.map(|link| link.platform_id), Some(1));
        assert!(store
            .delete_one(&Filter::eq("platform_id", 1u64))
            .await
            .unwrap()
            .is_some());
    }
}
