use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use proptest::prelude::*;
use zns_gateway::ledger::{Ledger, LedgerError, SqliteLedger, GIB};

fn balances(tickets: &[zns_gateway::ledger::Ticket]) -> Vec<i64> {
    tickets.iter().map(|t| t.bytes).collect()
}

#[tokio::test]
async fn test_ticket_lifecycle() {
    let ledger = SqliteLedger::in_memory().unwrap();
    let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();

    ledger.create_at("tok", 100, "o1", "", now).await.unwrap();
    ledger.cost_at("tok", 50, now).await.unwrap();
    assert_eq!(balances(&ledger.list("tok", 10).await.unwrap()), vec![50]);

    // New tickets extend the latest expiry
    ledger.create_at("tok", 30, "o2", "", now).await.unwrap();
    ledger.create_at("tok", 40, "o3", "", now).await.unwrap();
    let tickets = ledger.list("tok", 10).await.unwrap();
    assert_eq!(tickets[0].expires, now + Duration::days(90));
    assert_eq!(tickets[1].expires, now + Duration::days(60));
    assert_eq!(tickets[2].expires, now + Duration::days(30));

    // Oldest tickets are drained first
    ledger.cost_at("tok", 110, now).await.unwrap();
    assert_eq!(balances(&ledger.list("tok", 10).await.unwrap()), vec![10, 0, 0]);

    // Overdraft lands on the last chargeable ticket
    ledger.cost_at("tok", 20, now).await.unwrap();
    assert_eq!(balances(&ledger.list("tok", 10).await.unwrap()), vec![-10, 0, 0]);
    assert!(!ledger.is_active("tok").await.unwrap());

    ledger.create_at("tok", 40, "o4", "", now).await.unwrap();
    ledger.create_at("tok", 10, "o5", "", now).await.unwrap();
    assert!(ledger.is_active("tok").await.unwrap());

    ledger.cost_at("tok", 65, now).await.unwrap();
    let tickets = ledger.list("tok", 2).await.unwrap();
    assert_eq!(balances(&tickets), vec![-15, 0]);
    assert!(!ledger.is_active("tok").await.unwrap());

    // One period per whole GiB
    let latest = tickets[0].expires;
    ledger.create_at("tok", 3 * GIB, "o6", "", now).await.unwrap();
    let tickets = ledger.list("tok", 1).await.unwrap();
    assert_eq!(tickets[0].expires, latest + Duration::days(90));
    assert_eq!(tickets[0].total_bytes, 3 * GIB);
}

#[tokio::test]
async fn test_overdraft_then_inactive() {
    let ledger = SqliteLedger::in_memory().unwrap();
    ledger.create("tok", 10, "o1", "").await.unwrap();

    ledger.cost("tok", 20).await.unwrap();
    let tickets = ledger.list("tok", 10).await.unwrap();
    assert_eq!(tickets[0].bytes, -10);
    assert!(!ledger.is_active("tok").await.unwrap());

    // Nothing left to charge
    assert!(matches!(
        ledger.cost("tok", 1).await,
        Err(LedgerError::NoEntitlement)
    ));
}

#[tokio::test]
async fn test_lapsed_ticket_restarts_expiry_chain() {
    let ledger = SqliteLedger::in_memory().unwrap();
    let then = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    let later = then + Duration::days(45);

    ledger.create_at("tok", 100, "o1", "", then).await.unwrap();
    ledger.create_at("tok", 100, "o2", "", later).await.unwrap();

    let tickets = ledger.list("tok", 1).await.unwrap();
    assert_eq!(tickets[0].expires, later + Duration::days(30));

    // The lapsed ticket is never charged
    ledger.cost_at("tok", 150, later).await.unwrap();
    assert_eq!(balances(&ledger.list("tok", 10).await.unwrap()), vec![-50, 100]);
}

#[tokio::test]
async fn test_tokens_are_isolated() {
    let ledger = SqliteLedger::in_memory().unwrap();
    ledger.create("a", 100, "oa", "").await.unwrap();
    ledger.create("b", 100, "ob", "").await.unwrap();

    ledger.cost("a", 60).await.unwrap();
    assert_eq!(ledger.list("a", 10).await.unwrap()[0].bytes, 40);
    assert_eq!(ledger.list("b", 10).await.unwrap()[0].bytes, 100);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_debits_conserve_bytes() {
    let ledger = Arc::new(SqliteLedger::in_memory().unwrap());
    ledger.create("tok", 500, "o1", "").await.unwrap();
    ledger.create("tok", 300, "o2", "").await.unwrap();

    let debits: Vec<_> = (0..50)
        .map(|_| {
            let ledger = ledger.clone();
            tokio::spawn(async move { ledger.cost("tok", 7).await })
        })
        .collect();
    for debit in debits {
        debit.await.unwrap().unwrap();
    }

    // 350 bytes drained from the oldest ticket, none lost or doubled
    let tickets = ledger.list("tok", 10).await.unwrap();
    assert_eq!(tickets.iter().map(|t| t.bytes).sum::<i64>(), 800 - 350);
    assert_eq!(balances(&tickets), vec![300, 150]);
    assert!(ledger.is_active("tok").await.unwrap());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Debits move exactly their amount out of the token's tickets
    #[test]
    fn prop_cost_conserves_bytes(
        grants in prop::collection::vec(1i64..1_000, 1..5),
        costs in prop::collection::vec(1i64..400, 0..8),
    ) {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let ledger = SqliteLedger::in_memory().unwrap();
            let now = Utc::now();
            for (i, bytes) in grants.iter().enumerate() {
                ledger.create_at("tok", *bytes, &format!("o{}", i), "", now).await.unwrap();
            }

            let mut expected: i64 = grants.iter().sum();
            for cost in &costs {
                let has_positive = ledger
                    .list("tok", 100)
                    .await
                    .unwrap()
                    .iter()
                    .any(|t| t.bytes > 0);
                let result = ledger.cost_at("tok", *cost, now).await;
                if has_positive {
                    prop_assert!(result.is_ok());
                    expected -= cost;
                } else {
                    prop_assert!(result.is_err());
                }

                let tickets = ledger.list("tok", 100).await.unwrap();
                let total: i64 = tickets.iter().map(|t| t.bytes).sum();
                prop_assert_eq!(total, expected);
                // Only the newest ticket may go negative
                for t in tickets.iter().skip(1) {
                    prop_assert!(t.bytes >= 0);
                }
            }
            Ok(())
        })?;
    }
}
