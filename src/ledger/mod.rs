//! Prepaid Bandwidth Ledger
//!
//! Tickets are prepaid entitlements owned by an opaque access token. A token
//! may hold many tickets at once; debits walk them oldest first and the last
//! one walked absorbs any overdraft, so a charge is never refused for lack of
//! balance. Service is cut at the next authorization instead.
//!
//! Two backends implement [`Ledger`]:
//! - [`SqliteLedger`]: durable store, one SQLite connection
//! - [`FreeLedger`]: every token has a fixed positive balance, nothing persists

mod sqlite;

pub use sqlite::SqliteLedger;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

/// One GiB, the unit that buys an expiry period
pub const GIB: i64 = 1 << 30;

/// Days of validity granted per whole GiB
pub const DAYS_PER_UNIT: i64 = 30;

/// Balance reported by [`FreeLedger`] for every token
pub const FREE_BALANCE: i64 = 100;

/// Prepaid entitlement record
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Ticket {
    pub id: i64,
    #[serde(skip)]
    pub token: String,
    /// Remaining bytes, negative once overdrawn
    pub bytes: i64,
    pub total_bytes: i64,
    pub pay_order: String,
    pub buy_order: String,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub expires: DateTime<Utc>,
}

impl Ticket {
    /// Whether the ticket can still be charged at `now`
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.expires > now
    }
}

/// Ledger errors
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("No chargeable ticket for token")]
    NoEntitlement,
}

/// Token ledger shared by the resolver, the tunnel proxy and the ticket API
#[async_trait::async_trait]
pub trait Ledger: Send + Sync {
    /// Create a ticket. A repeated `pay_order` is accepted and changes nothing.
    async fn create(
        &self,
        token: &str,
        bytes: i64,
        pay_order: &str,
        buy_order: &str,
    ) -> Result<(), LedgerError>;

    /// Debit `bytes` from the token's valid tickets, overdrawing the last one
    /// if the balance does not cover it.
    async fn cost(&self, token: &str, bytes: i64) -> Result<(), LedgerError>;

    /// Most recent tickets first, at most `limit` of them
    async fn list(&self, token: &str, limit: usize) -> Result<Vec<Ticket>, LedgerError>;

    /// A token is active when its newest ticket still has a positive balance
    async fn is_active(&self, token: &str) -> Result<bool, LedgerError> {
        let tickets = self.list(token, 1).await?;
        Ok(tickets.first().map_or(false, |t| t.bytes > 0))
    }
}

/// Validity granted by a ticket of `bytes`: one period per whole GiB, at least one
pub fn ticket_lifetime(bytes: i64) -> Duration {
    let units = (bytes / GIB).max(1);
    Duration::days(DAYS_PER_UNIT * units)
}

/// Expiry of a new ticket. Extends the latest ticket's expiry while it is
/// still in the future, otherwise starts from `now`.
pub fn chain_expiry(
    latest_expiry: Option<DateTime<Utc>>,
    bytes: i64,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    let base = match latest_expiry {
        Some(expires) if expires > now => expires,
        _ => now,
    };
    base + ticket_lifetime(bytes)
}

/// Ledger that never runs dry
#[derive(Debug, Clone)]
pub struct FreeLedger {
    balance: i64,
}

impl FreeLedger {
    pub fn new() -> Self {
        Self {
            balance: FREE_BALANCE,
        }
    }
}

impl Default for FreeLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Ledger for FreeLedger {
    async fn create(
        &self,
        _token: &str,
        _bytes: i64,
        _pay_order: &str,
        _buy_order: &str,
    ) -> Result<(), LedgerError> {
        Ok(())
    }

    async fn cost(&self, _token: &str, _bytes: i64) -> Result<(), LedgerError> {
        Ok(())
    }

    async fn list(&self, token: &str, limit: usize) -> Result<Vec<Ticket>, LedgerError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let now = Utc::now();
        Ok(vec![Ticket {
            id: 0,
            token: token.to_string(),
            bytes: self.balance,
            total_bytes: self.balance,
            pay_order: String::new(),
            buy_order: String::new(),
            created: now,
            updated: now,
            expires: now + ticket_lifetime(self.balance),
        }])
    }
}
