//! Provider wallet balances.

use chrono::{DateTime, Utc};
use escrowsettle_common::{Currency, Money, ProviderId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{LedgerError, LedgerResult};

/// Running balance owed to a provider. One per provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderWallet {
    pub provider_id: ProviderId,
    pub balance: Decimal,
    pub currency: Currency,
    /// Whether the provider may withdraw from this wallet.
    pub can_withdraw: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProviderWallet {
    /// Open a wallet funded by its first credit. A zero credit opens an
    /// empty wallet.
    pub fn open_with(
        provider_id: ProviderId,
        credit: &Money,
        now: DateTime<Utc>,
    ) -> LedgerResult<Self> {
        if credit.is_negative() {
            return Err(LedgerError::NegativeCredit(credit.value));
        }

        Ok(Self {
            provider_id,
            balance: credit.value,
            currency: credit.currency.clone(),
            can_withdraw: true,
            created_at: now,
            updated_at: now,
        })
    }

    /// Increment the balance. Wallets are never decremented here.
    pub fn credit(&mut self, amount: &Money, now: DateTime<Utc>) -> LedgerResult<Decimal> {
        if amount.is_negative() {
            return Err(LedgerError::NegativeCredit(amount.value));
        }
        if amount.currency != self.currency {
            return Err(LedgerError::CurrencyMismatch {
                provider_id: self.provider_id.clone(),
                wallet: self.currency.clone(),
                credit: amount.currency.clone(),
            });
        }

        self.balance += amount.value;
        self.updated_at = now;
        Ok(self.balance)
    }

    /// Balance as money.
    pub fn balance(&self) -> Money {
        Money::new(self.balance, self.currency.clone())
    }
}

/// Upsert semantics shared by every store: credit the existing wallet or open
/// a new one with the credit as its balance.
pub fn upsert_credit(
    existing: Option<ProviderWallet>,
    provider_id: &ProviderId,
    amount: &Money,
    now: DateTime<Utc>,
) -> LedgerResult<ProviderWallet> {
    match existing {
        Some(mut wallet) => {
            wallet.credit(amount, now)?;
            Ok(wallet)
        }
        None => ProviderWallet::open_with(provider_id.clone(), amount, now),
    }
}
