//! Database schema definitions using sea-query.
//!
//! These define the table and column identifiers for type-safe query building.

use sea_query::Iden;

/// Ledger events table schema.
#[derive(Iden)]
pub enum LedgerEvents {
    Table,
    #[iden = "domain"]
    Domain,
    #[iden = "root"]
    Root,
    #[iden = "sequence"]
    Sequence,
    #[iden = "recorded_at"]
    RecordedAt,
    #[iden = "idempotency_key"]
    IdempotencyKey,
    #[iden = "event_type"]
    EventType,
    #[iden = "event_data"]
    EventData,
}

/// SQL for creating the ledger events table.
pub const CREATE_LEDGER_EVENTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS ledger_events (
    domain TEXT NOT NULL,
    root TEXT NOT NULL,
    sequence INTEGER NOT NULL,
    recorded_at TEXT NOT NULL,
    idempotency_key TEXT,
    event_type TEXT NOT NULL,
    event_data TEXT NOT NULL,
    PRIMARY KEY (domain, root, sequence)
)
"#;

/// Idempotency keys are unique across every stream. NULL keys never collide.
pub const CREATE_IDEMPOTENCY_KEY_INDEX: &str = r#"
CREATE UNIQUE INDEX IF NOT EXISTS idx_ledger_events_idempotency_key
    ON ledger_events(idempotency_key)
"#;

pub const CREATE_DOMAIN_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_ledger_events_domain ON ledger_events(domain)
"#;
