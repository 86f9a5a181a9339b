//! SQLite EventStore implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_query::{Expr, Order, Query, SqliteQueryBuilder};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};
use uuid::Uuid;

use crate::interfaces::event_store::{
    EventPage, EventStore, KeyedEvent, NewEvent, Result, StorageError,
};
use crate::storage::schema::{
    LedgerEvents, CREATE_DOMAIN_INDEX, CREATE_IDEMPOTENCY_KEY_INDEX, CREATE_LEDGER_EVENTS_TABLE,
};

/// SQLite implementation of EventStore.
pub struct SqliteEventStore {
    pool: SqlitePool,
}

impl SqliteEventStore {
    /// Create a new SQLite event store.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create the table and indexes if they do not exist.
    pub async fn init(&self) -> Result<()> {
        for statement in [
            CREATE_LEDGER_EVENTS_TABLE,
            CREATE_IDEMPOTENCY_KEY_INDEX,
            CREATE_DOMAIN_INDEX,
        ] {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn next_sequence(conn: &mut SqliteConnection, domain: &str, root_str: &str) -> Result<u32> {
        let query = Query::select()
            .expr(Expr::col(LedgerEvents::Sequence).max())
            .from(LedgerEvents::Table)
            .and_where(Expr::col(LedgerEvents::Domain).eq(domain))
            .and_where(Expr::col(LedgerEvents::Root).eq(root_str))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query).fetch_optional(&mut *conn).await?;
        Ok(match row {
            Some(row) => {
                let max_seq: Option<i64> = row.get(0);
                max_seq.map(|s| s as u32 + 1).unwrap_or(0)
            }
            None => 0,
        })
    }

    /// Check keys and sequence, then insert, within an already-started transaction.
    async fn insert_events(
        conn: &mut SqliteConnection,
        domain: &str,
        root_str: &str,
        expected_sequence: u32,
        events: Vec<NewEvent>,
    ) -> Result<Vec<EventPage>> {
        let keys: Vec<String> = events
            .iter()
            .filter_map(|e| e.idempotency_key.clone())
            .collect();
        for (i, key) in keys.iter().enumerate() {
            if keys[..i].contains(key) {
                return Err(StorageError::DuplicateKey { key: key.clone() });
            }
        }
        if !keys.is_empty() {
            let query = Query::select()
                .column(LedgerEvents::IdempotencyKey)
                .from(LedgerEvents::Table)
                .and_where(Expr::col(LedgerEvents::IdempotencyKey).is_in(keys.clone()))
                .limit(1)
                .to_string(SqliteQueryBuilder);
            if let Some(row) = sqlx::query(&query).fetch_optional(&mut *conn).await? {
                return Err(StorageError::DuplicateKey {
                    key: row.get("idempotency_key"),
                });
            }
        }

        let next = Self::next_sequence(conn, domain, root_str).await?;
        if next != expected_sequence {
            return Err(StorageError::SequenceConflict {
                expected: next,
                actual: expected_sequence,
            });
        }

        let recorded_at = Utc::now();
        let mut pages = Vec::with_capacity(events.len());
        for (offset, new_event) in events.into_iter().enumerate() {
            let sequence = next + offset as u32;
            let event_data = serde_json::to_string(&new_event.event)?;

            let query = Query::insert()
                .into_table(LedgerEvents::Table)
                .columns([
                    LedgerEvents::Domain,
                    LedgerEvents::Root,
                    LedgerEvents::Sequence,
                    LedgerEvents::RecordedAt,
                    LedgerEvents::IdempotencyKey,
                    LedgerEvents::EventType,
                    LedgerEvents::EventData,
                ])
                .values_panic([
                    domain.into(),
                    root_str.into(),
                    (sequence as i64).into(),
                    recorded_at.to_rfc3339().into(),
                    new_event.idempotency_key.clone().into(),
                    new_event.event.type_name().into(),
                    event_data.into(),
                ])
                .to_string(SqliteQueryBuilder);

            sqlx::query(&query)
                .execute(&mut *conn)
                .await
                .map_err(|e| {
                    let unique = matches!(
                        &e,
                        sqlx::Error::Database(db_err) if db_err.is_unique_violation()
                    );
                    if !unique {
                        return StorageError::Database(e);
                    }
                    match &new_event.idempotency_key {
                        Some(key) => StorageError::DuplicateKey { key: key.clone() },
                        None => StorageError::SequenceConflict {
                            expected: sequence,
                            actual: expected_sequence,
                        },
                    }
                })?;

            pages.push(EventPage {
                sequence,
                recorded_at,
                idempotency_key: new_event.idempotency_key,
                event: new_event.event,
            });
        }

        Ok(pages)
    }

    fn page_from_row(row: &SqliteRow) -> Result<EventPage> {
        let sequence: i64 = row.get("sequence");
        let recorded_at: String = row.get("recorded_at");
        let event_data: String = row.get("event_data");
        let recorded_at = DateTime::parse_from_rfc3339(&recorded_at)
            .map_err(|e| StorageError::InvalidTimestamp(e.to_string()))?
            .with_timezone(&Utc);
        Ok(EventPage {
            sequence: sequence as u32,
            recorded_at,
            idempotency_key: row.get("idempotency_key"),
            event: serde_json::from_str(&event_data)?,
        })
    }
}

#[async_trait]
impl EventStore for SqliteEventStore {
    async fn add(
        &self,
        domain: &str,
        root: Uuid,
        expected_sequence: u32,
        events: Vec<NewEvent>,
    ) -> Result<Vec<EventPage>> {
        if events.is_empty() {
            return Ok(Vec::new());
        }

        let root_str = root.to_string();

        // BEGIN IMMEDIATE acquires the write lock upfront, preventing deadlocks
        // when concurrent DEFERRED transactions race to upgrade from shared to exclusive.
        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

        let result =
            Self::insert_events(&mut conn, domain, &root_str, expected_sequence, events).await;

        match result {
            Ok(pages) => {
                sqlx::query("COMMIT").execute(&mut *conn).await?;
                Ok(pages)
            }
            Err(e) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                Err(e)
            }
        }
    }

    async fn get(&self, domain: &str, root: Uuid) -> Result<Vec<EventPage>> {
        self.get_from(domain, root, 0).await
    }

    async fn get_from(&self, domain: &str, root: Uuid, from: u32) -> Result<Vec<EventPage>> {
        let root_str = root.to_string();

        let query = Query::select()
            .columns([
                LedgerEvents::Sequence,
                LedgerEvents::RecordedAt,
                LedgerEvents::IdempotencyKey,
                LedgerEvents::EventData,
            ])
            .from(LedgerEvents::Table)
            .and_where(Expr::col(LedgerEvents::Domain).eq(domain))
            .and_where(Expr::col(LedgerEvents::Root).eq(&root_str))
            .and_where(Expr::col(LedgerEvents::Sequence).gte(from as i64))
            .order_by(LedgerEvents::Sequence, Order::Asc)
            .to_string(SqliteQueryBuilder);

        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        rows.iter().map(Self::page_from_row).collect()
    }

    async fn list_roots(&self, domain: &str) -> Result<Vec<Uuid>> {
        let query = Query::select()
            .distinct()
            .column(LedgerEvents::Root)
            .from(LedgerEvents::Table)
            .and_where(Expr::col(LedgerEvents::Domain).eq(domain))
            .order_by(LedgerEvents::Root, Order::Asc)
            .to_string(SqliteQueryBuilder);

        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;

        let mut roots = Vec::with_capacity(rows.len());
        for row in rows {
            let root_str: String = row.get("root");
            roots.push(Uuid::parse_str(&root_str)?);
        }
        roots.sort();
        Ok(roots)
    }

    async fn get_next_sequence(&self, domain: &str, root: Uuid) -> Result<u32> {
        let root_str = root.to_string();
        let mut conn = self.pool.acquire().await?;
        Self::next_sequence(&mut conn, domain, &root_str).await
    }

    async fn find_by_key(&self, key: &str) -> Result<Option<KeyedEvent>> {
        let query = Query::select()
            .columns([
                LedgerEvents::Domain,
                LedgerEvents::Root,
                LedgerEvents::Sequence,
                LedgerEvents::RecordedAt,
                LedgerEvents::IdempotencyKey,
                LedgerEvents::EventData,
            ])
            .from(LedgerEvents::Table)
            .and_where(Expr::col(LedgerEvents::IdempotencyKey).eq(key))
            .limit(1)
            .to_string(SqliteQueryBuilder);

        let Some(row) = sqlx::query(&query).fetch_optional(&self.pool).await? else {
            return Ok(None);
        };
        let root_str: String = row.get("root");
        Ok(Some(KeyedEvent {
            domain: row.get("domain"),
            root: Uuid::parse_str(&root_str)?,
            page: Self::page_from_row(&row)?,
        }))
    }
}
