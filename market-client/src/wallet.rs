use chrono::{DateTime, Datelike, Utc};
use serde::Serialize;

use market_core::error::MarketResult;
use market_core::types::{TransactionType, WalletTransaction};

use crate::cache::keys;
use crate::client::MarketClient;

/// Header figures of the wallet screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WalletSummary {
    pub balance: i64,
    pub month_spend: i64,
    pub lead_count: i64,
    pub average_lead_cost: i64,
}

impl WalletSummary {
    /// `balance` comes from the profile, never from summing the ledger.
    pub fn derive(balance: i64, transactions: &[WalletTransaction], now: DateTime<Utc>) -> Self {
        let debits: Vec<&WalletTransaction> = transactions
            .iter()
            .filter(|t| t.tx_type == TransactionType::Debit)
            .collect();

        let month_spend = debits
            .iter()
            .filter(|t| t.created_at.year() == now.year() && t.created_at.month() == now.month())
            .map(|t| t.amount)
            .sum();
        let lead_count = debits.len() as i64;
        let total: i64 = debits.iter().map(|t| t.amount).sum();
        let average_lead_cost = if lead_count == 0 {
            0
        } else {
            (total + lead_count / 2) / lead_count
        };

        Self {
            balance,
            month_spend,
            lead_count,
            average_lead_cost,
        }
    }
}

/// One ledger line as displayed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LedgerEntry {
    pub id: String,
    pub label: &'static str,
    /// Positive for credits and refunds, negative for debits.
    pub signed_amount: i64,
    pub balance_after: i64,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<&WalletTransaction> for LedgerEntry {
    fn from(tx: &WalletTransaction) -> Self {
        let label = match tx.tx_type {
            TransactionType::Debit => "Lead purchase",
            TransactionType::Credit => "Coins added",
            TransactionType::Refund => "Refund",
        };
        Self {
            id: tx.id.clone(),
            label,
            signed_amount: tx.tx_type.signed(tx.amount),
            balance_after: tx.balance_after,
            description: tx.description.clone(),
            created_at: tx.created_at,
        }
    }
}

impl MarketClient {
    pub async fn wallet_transactions(&self) -> MarketResult<Vec<WalletTransaction>> {
        let session = self.signed_in()?;
        self.cache
            .fetch(keys::wallet_transactions(&session.user_id), || {
                self.backend.list_wallet_transactions(&session.user_id)
            })
            .await
    }

    pub async fn ledger(&self) -> MarketResult<Vec<LedgerEntry>> {
        Ok(self.wallet_transactions().await?.iter().map(LedgerEntry::from).collect())
    }

    pub async fn wallet_summary(&self) -> MarketResult<WalletSummary> {
        let profile = self.profile().await?;
        let transactions = self.wallet_transactions().await?;
        Ok(WalletSummary::derive(profile.coin_balance, &transactions, Utc::now()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Fixture;
    use chrono::TimeZone;

    fn tx(tx_type: TransactionType, amount: i64, at: DateTime<Utc>) -> WalletTransaction {
        WalletTransaction {
            id: format!("{}-{}", tx_type, amount),
            user_id: "b1".to_string(),
            amount,
            tx_type,
            reference_id: None,
            description: None,
            balance_after: 0,
            created_at: at,
        }
    }

    #[test]
    fn test_average_is_zero_without_debits() {
        let now = Utc::now();
        let summary = WalletSummary::derive(500, &[tx(TransactionType::Credit, 500, now)], now);
        assert_eq!(summary.average_lead_cost, 0);
        assert_eq!(summary.lead_count, 0);
        assert_eq!(summary.month_spend, 0);
        assert_eq!(summary.balance, 500);
    }

    #[test]
    fn test_month_spend_and_rounded_average() {
        let now = Utc.with_ymd_and_hms(2026, 3, 15, 12, 0, 0).unwrap();
        let last_month = Utc.with_ymd_and_hms(2026, 2, 27, 9, 0, 0).unwrap();
        let last_year = Utc.with_ymd_and_hms(2025, 3, 10, 9, 0, 0).unwrap();
        let txs = vec![
            tx(TransactionType::Debit, 100, now),
            tx(TransactionType::Debit, 150, last_month),
            tx(TransactionType::Debit, 101, last_year),
            tx(TransactionType::Refund, 150, now),
        ];
        let summary = WalletSummary::derive(0, &txs, now);
        assert_eq!(summary.month_spend, 100);
        assert_eq!(summary.lead_count, 3);
        // 351 / 3 = 117
        assert_eq!(summary.average_lead_cost, 117);

        let two = [tx(TransactionType::Debit, 100, now), tx(TransactionType::Debit, 101, now)];
        assert_eq!(WalletSummary::derive(0, &two, now).average_lead_cost, 101);
    }

    #[test]
    fn test_ledger_entry_signs() {
        let now = Utc::now();
        assert_eq!(LedgerEntry::from(&tx(TransactionType::Debit, 100, now)).signed_amount, -100);
        assert_eq!(LedgerEntry::from(&tx(TransactionType::Refund, 100, now)).signed_amount, 100);
        assert_eq!(LedgerEntry::from(&tx(TransactionType::Credit, 5, now)).label, "Coins added");
    }

    #[tokio::test]
    async fn test_summary_after_purchase() {
        let f = Fixture::new(300).await;
        f.purchase_directly(&f.matches[0]).await;
        let client = f.client_for(&f.broker).await;

        let summary = client.wallet_summary().await.unwrap();
        assert_eq!(summary.balance, 200);
        assert_eq!(summary.lead_count, 1);
        assert_eq!(summary.average_lead_cost, 100);
        assert_eq!(summary.month_spend, 100);

        let ledger = client.ledger().await.unwrap();
        assert_eq!(ledger[0].signed_amount, -100);
        assert_eq!(ledger.len(), 2);
    }
}
