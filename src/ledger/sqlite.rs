//! SQLite ticket store
//!
//! Timestamps are stored as unix milliseconds. The connection sits behind an
//! async mutex, so every debit is serialized; the fast path is a single
//! conditional UPDATE and the slow path a single transaction.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use super::{chain_expiry, Ledger, LedgerError, Ticket};

const TICKET_COLUMNS: &str =
    "id, token, bytes, total_bytes, pay_order, buy_order, created, updated, expires";

/// Durable ticket ledger
pub struct SqliteLedger {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteLedger {
    /// Open (or create) the ledger database at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let conn = Connection::open(path)?;
        Self::create_tables(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory ledger, used by tests and throwaway deployments
    pub fn in_memory() -> Result<Self, LedgerError> {
        let conn = Connection::open_in_memory()?;
        Self::create_tables(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn create_tables(conn: &Connection) -> Result<(), LedgerError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS tickets (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                token TEXT NOT NULL,
                bytes INTEGER NOT NULL,
                total_bytes INTEGER NOT NULL,
                pay_order TEXT NOT NULL,
                buy_order TEXT NOT NULL,
                created INTEGER NOT NULL,
                updated INTEGER NOT NULL,
                expires INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS t_token_expires ON tickets(token, expires);
            CREATE UNIQUE INDEX IF NOT EXISTS t_pay_order ON tickets(pay_order);",
        )?;
        Ok(())
    }

    /// [`Ledger::create`] with an explicit clock
    pub async fn create_at(
        &self,
        token: &str,
        bytes: i64,
        pay_order: &str,
        buy_order: &str,
        now: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        let latest: Option<i64> = tx
            .query_row(
                "SELECT expires FROM tickets WHERE token = ?1 ORDER BY id DESC LIMIT 1",
                params![token],
                |row| row.get(0),
            )
            .optional()?;

        let expires = chain_expiry(latest.map(from_millis), bytes, now);
        let now_ms = now.timestamp_millis();

        let inserted = tx.execute(
            "INSERT INTO tickets (token, bytes, total_bytes, pay_order, buy_order, created, updated, expires)
             VALUES (?1, ?2, ?2, ?3, ?4, ?5, ?5, ?6)
             ON CONFLICT(pay_order) DO NOTHING",
            params![token, bytes, pay_order, buy_order, now_ms, expires.timestamp_millis()],
        )?;
        tx.commit()?;

        if inserted == 0 {
            debug!("Duplicate pay order {} ignored", pay_order);
        } else {
            debug!("Ticket created for {}: {} bytes, expires {}", token, bytes, expires);
        }

        Ok(())
    }

    /// [`Ledger::cost`] with an explicit clock
    pub async fn cost_at(
        &self,
        token: &str,
        bytes: i64,
        now: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        if bytes <= 0 {
            return Ok(());
        }

        let mut conn = self.conn.lock().await;
        let now_ms = now.timestamp_millis();

        // Fast path: the first chargeable ticket covers the whole amount
        let changed = conn.execute(
            "UPDATE tickets SET bytes = bytes - ?1, updated = ?2
             WHERE id = (
                 SELECT id FROM tickets
                 WHERE token = ?3 AND expires > ?2 AND bytes > 0
                 ORDER BY id ASC LIMIT 1
             ) AND bytes >= ?1",
            params![bytes, now_ms, token],
        )?;
        if changed == 1 {
            return Ok(());
        }

        let tx = conn.transaction()?;
        let mut tickets: Vec<(i64, i64)> = {
            let mut stmt = tx.prepare(
                "SELECT id, bytes FROM tickets
                 WHERE token = ?1 AND expires > ?2 AND bytes > 0
                 ORDER BY id ASC",
            )?;
            let rows = stmt.query_map(params![token, now_ms], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
            })?;
            rows.collect::<Result<_, _>>()?
        };

        if tickets.is_empty() {
            return Err(LedgerError::NoEntitlement);
        }

        let mut remaining = bytes;
        let mut touched = 0;
        for (_, balance) in tickets.iter_mut() {
            touched += 1;
            if remaining <= *balance {
                *balance -= remaining;
                remaining = 0;
                break;
            }
            remaining -= *balance;
            *balance = 0;
        }
        if remaining > 0 {
            if let Some((_, balance)) = tickets.last_mut() {
                *balance -= remaining;
            }
        }

        for (id, balance) in &tickets[..touched] {
            tx.execute(
                "UPDATE tickets SET bytes = ?1, updated = ?2 WHERE id = ?3",
                params![balance, now_ms, id],
            )?;
        }
        tx.commit()?;

        if remaining > 0 {
            debug!("Token {} overdrawn by {} bytes", token, remaining);
        }

        Ok(())
    }
}

#[async_trait::async_trait]
impl Ledger for SqliteLedger {
    async fn create(
        &self,
        token: &str,
        bytes: i64,
        pay_order: &str,
        buy_order: &str,
    ) -> Result<(), LedgerError> {
        self.create_at(token, bytes, pay_order, buy_order, Utc::now()).await
    }

    async fn cost(&self, token: &str, bytes: i64) -> Result<(), LedgerError> {
        self.cost_at(token, bytes, Utc::now()).await
    }

    async fn list(&self, token: &str, limit: usize) -> Result<Vec<Ticket>, LedgerError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM tickets WHERE token = ?1 ORDER BY id DESC LIMIT ?2",
            TICKET_COLUMNS
        ))?;
        let rows = stmt.query_map(params![token, limit as i64], ticket_from_row)?;
        let tickets = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(tickets)
    }
}

fn ticket_from_row(row: &Row<'_>) -> rusqlite::Result<Ticket> {
    Ok(Ticket {
        id: row.get(0)?,
        token: row.get(1)?,
        bytes: row.get(2)?,
        total_bytes: row.get(3)?,
        pay_order: row.get(4)?,
        buy_order: row.get(5)?,
        created: from_millis(row.get(6)?),
        updated: from_millis(row.get(7)?),
        expires: from_millis(row.get(8)?),
    })
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}
