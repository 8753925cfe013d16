//! Purchase statistics for a sale, rebuilt from its full `Bought` history.
//!
//! A run fixes a head block first and evaluates everything against it: the
//! log scan ends there and `totalSoldBase` is read pinned to it. Two runs with
//! the same head therefore produce identical statistics.

use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::path::Path;

use alloy_primitives::{Address, B256, U256, U512};
use alloy_sol_types::SolEvent;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::contracts::{decode_event, decode_total_sold, total_sold_call, Bought};
use crate::descriptor::write_atomic;
use crate::error::LaunchpadError;
use crate::ledger::{BlockId, Finality, LedgerClient, Log, LogScanner};
use crate::units::{display_amount, format_units};

pub const DEFAULT_CHUNK_SIZE: u64 = 10_000;

/// Which part of the history a run covers and how it is fetched.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScanConfig {
    pub from_block: u64,
    pub chunk_size: u64,
    pub finality: Finality,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            from_block: 0,
            chunk_size: DEFAULT_CHUNK_SIZE,
            finality: Finality::Finalized,
        }
    }
}

/// A decoded `Bought` log with its ledger position.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PurchaseEvent {
    pub buyer: Address,
    pub settlement_in: U256,
    pub fee: U256,
    pub tokens_out_base: U256,
    pub block_number: u64,
    pub log_index: u64,
    pub transaction_hash: B256,
}

impl PurchaseEvent {
    pub fn from_log(log: &Log) -> Result<Self, LaunchpadError> {
        let bought = decode_event::<Bought>(log)?;
        Ok(Self {
            buyer: bought.buyer,
            settlement_in: bought.usdcIn,
            fee: bought.feeUsdc,
            tokens_out_base: bought.tokensOutBase,
            block_number: log.block_number,
            log_index: log.log_index,
            transaction_hash: log.transaction_hash,
        })
    }

    /// Identity of the log this event came from.
    pub fn key(&self) -> (B256, u64) {
        (self.transaction_hash, self.log_index)
    }
}

/// Running totals over purchase events, each log counted once.
#[derive(Clone, Debug, Default)]
pub struct PurchaseTally {
    seen: BTreeSet<(B256, u64)>,
    total_raised: U512,
    total_fees: U512,
    tokens_out: U512,
    buyers: BTreeSet<Address>,
}

impl PurchaseTally {
    /// Add `event`; returns `false` if the same log was already counted.
    pub fn record(&mut self, event: &PurchaseEvent) -> bool {
        if !self.seen.insert(event.key()) {
            return false;
        }
        self.total_raised += U512::from(event.settlement_in);
        self.total_fees += U512::from(event.fee);
        self.tokens_out += U512::from(event.tokens_out_base);
        self.buyers.insert(event.buyer);
        true
    }

    pub fn event_count(&self) -> u64 {
        self.seen.len() as u64
    }

    pub fn unique_buyers(&self) -> usize {
        self.buyers.len()
    }

    pub fn finish(self, sale: Address, head_block: u64, tokens_sold_base: U256) -> AggregatedStats {
        AggregatedStats {
            sale,
            head_block,
            event_count: self.event_count(),
            total_raised: self.total_raised,
            total_fees: self.total_fees,
            event_tokens_out_base: self.tokens_out,
            unique_buyer_count: self.buyers.len(),
            tokens_sold_base,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AggregatedStats {
    pub sale: Address,
    pub head_block: u64,
    pub event_count: u64,
    /// Settlement base units paid in, fees included as the sale reports them.
    pub total_raised: U512,
    pub total_fees: U512,
    /// Sum of `tokensOutBase` over the events.
    pub event_tokens_out_base: U512,
    pub unique_buyer_count: usize,
    /// `totalSoldBase()` as reported by the sale at `head_block`.
    pub tokens_sold_base: U256,
}

pub struct PurchaseAggregator<L> {
    ledger: L,
    config: ScanConfig,
}

impl<L: LedgerClient> PurchaseAggregator<L> {
    pub fn new(ledger: L, config: ScanConfig) -> Self {
        Self { ledger, config }
    }

    /// Statistics up to the current head for the configured finality.
    pub async fn compute(&self, sale: Address) -> Result<AggregatedStats, LaunchpadError> {
        let head = self.ledger.head(self.config.finality).await?;
        self.compute_at(sale, head).await
    }

    /// Statistics over `[from_block, head]`.
    pub async fn compute_at(&self, sale: Address, head: u64) -> Result<AggregatedStats, LaunchpadError> {
        info!(%sale, from = self.config.from_block, head, "aggregating purchases");
        let mut scanner = LogScanner::new(
            &self.ledger,
            sale,
            Bought::SIGNATURE_HASH,
            self.config.from_block,
            head,
            self.config.chunk_size,
        );
        let mut tally = PurchaseTally::default();
        while let Some(chunk) = scanner.next_chunk().await? {
            for log in &chunk {
                let event = PurchaseEvent::from_log(log)?;
                if !tally.record(&event) {
                    debug!(tx = %event.transaction_hash, log_index = event.log_index, "duplicate log skipped");
                }
            }
        }

        let out = self
            .ledger
            .call(sale, total_sold_call(), BlockId::Number(head))
            .await?;
        let tokens_sold_base = decode_total_sold(&out)?;

        let stats = tally.finish(sale, head, tokens_sold_base);
        if U512::from(tokens_sold_base) != stats.event_tokens_out_base {
            warn!(
                %sale,
                head,
                contract = %tokens_sold_base,
                events = %stats.event_tokens_out_base,
                "totalSoldBase disagrees with the Bought events; reporting the contract value"
            );
        }
        info!(
            %sale,
            events = stats.event_count,
            buyers = stats.unique_buyer_count,
            raised_base = %stats.total_raised,
            "aggregation complete"
        );
        Ok(stats)
    }
}

/// Serialized analytics output.
///
/// The human-unit fields are rounded for display; the `*Base` fields are the
/// exact integers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsReport {
    pub sale: Address,
    pub usdc_raised: f64,
    pub platform_fees: f64,
    pub buyers: usize,
    pub tokens_sold_base: String,
    pub usdc_raised_base: String,
    pub platform_fees_base: String,
    pub event_tokens_out_base: String,
    pub head_block: u64,
    pub events: u64,
}

impl AnalyticsReport {
    pub fn from_stats(stats: &AggregatedStats, settlement_decimals: u8) -> Self {
        Self {
            sale: stats.sale,
            usdc_raised: display_amount(stats.total_raised, settlement_decimals),
            platform_fees: display_amount(stats.total_fees, settlement_decimals),
            buyers: stats.unique_buyer_count,
            tokens_sold_base: stats.tokens_sold_base.to_string(),
            usdc_raised_base: stats.total_raised.to_string(),
            platform_fees_base: stats.total_fees.to_string(),
            event_tokens_out_base: stats.event_tokens_out_base.to_string(),
            head_block: stats.head_block,
            events: stats.event_count,
        }
    }

    pub fn to_json(&self) -> Result<String, LaunchpadError> {
        let mut json = serde_json::to_string_pretty(self)?;
        json.push('\n');
        Ok(json)
    }

    /// Console summary; amounts are exact decimals.
    pub fn summary(&self, settlement_decimals: u8) -> String {
        let exact = |base: &str| format_units(base, settlement_decimals);
        let mut out = String::new();
        let _ = writeln!(out, "===== Launchpad Stats =====");
        let _ = writeln!(out, "Sale: {}", self.sale);
        let _ = writeln!(out, "Head block: {}", self.head_block);
        let _ = writeln!(out, "Total USDC Raised: {}", exact(&self.usdc_raised_base));
        let _ = writeln!(out, "Platform Fees (USDC): {}", exact(&self.platform_fees_base));
        let _ = writeln!(out, "Unique Buyers: {}", self.buyers);
        let _ = writeln!(out, "Purchase events: {}", self.events);
        let _ = writeln!(out, "Tokens Sold (base units): {}", self.tokens_sold_base);
        let _ = writeln!(out, "===========================");
        out
    }
}

/// Atomically write `report` as pretty JSON.
pub fn write_report(path: &Path, report: &AnalyticsReport) -> Result<(), LaunchpadError> {
    write_atomic(path, report.to_json()?.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use proptest::prelude::*;

    use crate::contracts::{find_event, SaleCreated, SaleInit};
    use crate::ledger::{InMemoryLedger, TransactionRequest};

    fn buyer(n: u8) -> Address {
        Address::repeat_byte(n)
    }

    /// Deploy a sale through a factory so `totalSoldBase` answers before any purchase.
    async fn deploy_sale(ledger: &InMemoryLedger) -> Address {
        let factory = Address::repeat_byte(0x11);
        let owner = Address::repeat_byte(0xde);
        ledger.register_factory(factory);
        let init = SaleInit {
            owner,
            token: Address::repeat_byte(0x22),
            settlement_asset: Address::repeat_byte(0x33),
            token_decimals: 18,
            price: U256::from(1u64),
            cap_tokens: U256::from(1u64),
            start_time: 1,
            end_time: 2,
        };
        let tx = ledger
            .send_transaction(TransactionRequest::call(owner, factory, init.create_sale_call(&[0x60, 0x80])))
            .await
            .unwrap();
        let receipt = ledger.transaction_receipt(tx).await.unwrap().unwrap();
        find_event::<SaleCreated>(&receipt.logs, factory)
            .unwrap()
            .unwrap()
            .sale
    }

    fn aggregator(ledger: &Arc<InMemoryLedger>, chunk_size: u64) -> PurchaseAggregator<Arc<InMemoryLedger>> {
        PurchaseAggregator::new(
            ledger.clone(),
            ScanConfig {
                chunk_size,
                ..ScanConfig::default()
            },
        )
    }

    #[tokio::test]
    async fn sums_purchases_and_counts_distinct_buyers() {
        let ledger = Arc::new(InMemoryLedger::new());
        let sale = deploy_sale(&ledger).await;
        for (who, amount, fee, tokens) in [
            (1, 100_000_000u64, 2_000_000u64, 2_000u64),
            (2, 250_000_000, 5_000_000, 5_000),
            (1, 50_000_000, 1_000_000, 1_000),
        ] {
            ledger.record_purchase(sale, buyer(who), U256::from(amount), U256::from(fee), U256::from(tokens));
        }

        let stats = aggregator(&ledger, DEFAULT_CHUNK_SIZE).compute(sale).await.unwrap();
        assert_eq!(stats.total_raised, U512::from(400_000_000u64));
        assert_eq!(stats.total_fees, U512::from(8_000_000u64));
        assert_eq!(stats.unique_buyer_count, 2);
        assert_eq!(stats.event_count, 3);
        assert_eq!(stats.tokens_sold_base, U256::from(8_000u64));
        assert_eq!(stats.event_tokens_out_base, U512::from(8_000u64));

        let report = AnalyticsReport::from_stats(&stats, 6);
        assert_eq!(report.usdc_raised, 400.0);
        assert_eq!(report.usdc_raised_base, "400000000");
        assert_eq!(report.platform_fees, 8.0);
        assert!(report.summary(6).contains("Total USDC Raised: 400\n"));
    }

    #[tokio::test]
    async fn sale_without_purchases_reports_zeroes() {
        let ledger = Arc::new(InMemoryLedger::new());
        let sale = deploy_sale(&ledger).await;
        let stats = aggregator(&ledger, DEFAULT_CHUNK_SIZE).compute(sale).await.unwrap();
        assert_eq!(stats.total_raised, U512::ZERO);
        assert_eq!(stats.total_fees, U512::ZERO);
        assert_eq!(stats.unique_buyer_count, 0);
        assert_eq!(stats.event_count, 0);

        let report = AnalyticsReport::from_stats(&stats, 6);
        assert_eq!(report.tokens_sold_base, "0");
        assert_eq!(report.usdc_raised, 0.0);
    }

    #[tokio::test]
    async fn totals_do_not_overflow_uint256() {
        let ledger = Arc::new(InMemoryLedger::new());
        let sale = Address::repeat_byte(0x5a);
        ledger.record_purchase(sale, buyer(1), U256::MAX, U256::MAX, U256::ZERO);
        ledger.record_purchase(sale, buyer(2), U256::MAX, U256::ZERO, U256::ZERO);
        let stats = aggregator(&ledger, DEFAULT_CHUNK_SIZE).compute(sale).await.unwrap();
        assert_eq!(stats.total_raised, U512::from(U256::MAX) * U512::from(2u64));
        assert_eq!(stats.total_fees, U512::from(U256::MAX));
    }

    #[tokio::test]
    async fn fixed_head_gives_byte_identical_reports() {
        let ledger = Arc::new(InMemoryLedger::new());
        let sale = deploy_sale(&ledger).await;
        for i in 1..=5u8 {
            ledger.record_purchase(sale, buyer(i % 3 + 1), U256::from(i), U256::ZERO, U256::from(i));
        }
        let head = ledger.head(Finality::Finalized).await.unwrap();
        let aggregator = aggregator(&ledger, 2);
        let first = aggregator.compute_at(sale, head).await.unwrap();

        // activity past the head must not leak into a pinned run
        ledger.record_purchase(sale, buyer(9), U256::from(1_000u64), U256::ZERO, U256::from(7u64));
        let second = aggregator.compute_at(sale, head).await.unwrap();
        assert_eq!(first, second);

        let dir = tempfile::tempdir().unwrap();
        let (a, b) = (dir.path().join("a.json"), dir.path().join("b.json"));
        write_report(&a, &AnalyticsReport::from_stats(&first, 6)).unwrap();
        write_report(&b, &AnalyticsReport::from_stats(&second, 6)).unwrap();
        assert_eq!(std::fs::read(&a).unwrap(), std::fs::read(&b).unwrap());

        let parsed: AnalyticsReport =
            serde_json::from_slice(&std::fs::read(&a).unwrap()).unwrap();
        assert_eq!(parsed.events, 5);
        assert_eq!(parsed.head_block, head);
    }

    #[test]
    fn duplicate_logs_are_counted_once() {
        let event = PurchaseEvent {
            buyer: buyer(1),
            settlement_in: U256::from(10u64),
            fee: U256::from(1u64),
            tokens_out_base: U256::from(3u64),
            block_number: 4,
            log_index: 0,
            transaction_hash: B256::repeat_byte(0xee),
        };
        let mut tally = PurchaseTally::default();
        assert!(tally.record(&event));
        assert!(!tally.record(&event));
        let stats = tally.finish(Address::ZERO, 4, U256::from(3u64));
        assert_eq!(stats.event_count, 1);
        assert_eq!(stats.total_raised, U512::from(10u64));
    }

    #[tokio::test]
    async fn malformed_purchase_log_aborts_the_run() {
        let ledger = Arc::new(InMemoryLedger::new());
        let sale = deploy_sale(&ledger).await;
        // indexed buyer missing
        ledger.push_raw_log(sale, vec![Bought::SIGNATURE_HASH], vec![0u8; 96]);
        let err = aggregator(&ledger, DEFAULT_CHUNK_SIZE).compute(sale).await.unwrap_err();
        assert!(matches!(err, LaunchpadError::Decode(_)));
    }

    fn purchases() -> impl Strategy<Value = Vec<(u8, u64, u64)>> {
        prop::collection::vec((1u8..8, any::<u64>(), any::<u64>()), 0..40)
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn totals_match_exact_sums_for_any_chunking(purchases in purchases(), chunk in 1u64..16) {
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let ledger = Arc::new(InMemoryLedger::new());
            let sale = runtime.block_on(deploy_sale(&ledger));
            for (who, amount, fee) in &purchases {
                ledger.record_purchase(sale, buyer(*who), U256::from(*amount), U256::from(*fee), U256::from(1u64));
            }

            let stats = runtime.block_on(aggregator(&ledger, chunk).compute(sale)).unwrap();
            let whole = runtime.block_on(aggregator(&ledger, 1_000).compute(sale)).unwrap();

            let raised: u128 = purchases.iter().map(|(_, amount, _)| u128::from(*amount)).sum();
            let fees: u128 = purchases.iter().map(|(_, _, fee)| u128::from(*fee)).sum();
            let buyers: BTreeSet<u8> = purchases.iter().map(|(who, _, _)| *who).collect();

            prop_assert_eq!(stats.total_raised, U512::from(raised));
            prop_assert_eq!(stats.total_fees, U512::from(fees));
            prop_assert_eq!(stats.unique_buyer_count, buyers.len());
            prop_assert!(stats.unique_buyer_count as u64 <= stats.event_count);
            prop_assert_eq!(stats.event_count, purchases.len() as u64);
            prop_assert_eq!(stats, whole);
        }
    }
}
