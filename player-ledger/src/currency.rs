//! Currency registry
//!
//! The registry is a read-only snapshot. `reload` builds a new
//! [`CurrencySet`] and swaps it in atomically, so a caller holding the old
//! snapshot keeps a consistent view for as long as it needs one.

use crate::types::CurrencyId;
use crate::{Error, Result};
use parking_lot::RwLock;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Currency definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Currency {
    /// Identifier used in balances and commands
    pub id: CurrencyId,

    /// Human-readable name
    pub display_name: String,

    /// Prefix rendered before amounts
    pub symbol: String,

    /// DecimalFormat-style pattern, e.g. `#,##0.00`
    pub format_spec: String,

    /// Default currency for new accounts and unqualified commands
    #[serde(default)]
    pub is_default: bool,
}

impl Currency {
    /// Built-in fallback currency
    pub fn dollar() -> Self {
        Self {
            id: CurrencyId::new("dollar"),
            display_name: "Dollar".to_string(),
            symbol: "$".to_string(),
            format_spec: "#,##0.00".to_string(),
            is_default: true,
        }
    }

    /// Render `amount` with this currency's symbol and pattern
    pub fn format(&self, amount: Decimal) -> String {
        let body = format_amount(amount, &self.format_spec);
        match body.strip_prefix('-') {
            Some(digits) => format!("-{}{}", self.symbol, digits),
            None => format!("{}{}", self.symbol, body),
        }
    }
}

/// Format a decimal using the subset of DecimalFormat patterns currencies use:
/// fraction digits after `.`, thousands grouping when the pattern has `,`.
pub fn format_amount(amount: Decimal, pattern: &str) -> String {
    let scale = pattern
        .split_once('.')
        .map(|(_, frac)| frac.chars().filter(|c| *c == '0' || *c == '#').count())
        .unwrap_or(0) as u32;
    let grouped = pattern.contains(',');

    let rounded = amount
        .abs()
        .round_dp_with_strategy(scale, RoundingStrategy::MidpointAwayFromZero);
    let text = format!("{:.*}", scale as usize, rounded);
    let (int_part, frac_part) = match text.split_once('.') {
        Some((i, f)) => (i.to_string(), Some(f.to_string())),
        None => (text, None),
    };

    let int_part = if grouped { group_thousands(&int_part) } else { int_part };

    let mut out = String::with_capacity(int_part.len() + scale as usize + 2);
    if amount.is_sign_negative() && !rounded.is_zero() {
        out.push('-');
    }
    out.push_str(&int_part);
    if let Some(frac) = frac_part {
        out.push('.');
        out.push_str(&frac);
    }
    out
}

fn group_thousands(digits: &str) -> String {
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

/// Immutable snapshot of the configured currencies
#[derive(Debug, Clone)]
pub struct CurrencySet {
    by_id: HashMap<CurrencyId, Currency>,
    default_id: CurrencyId,
}

impl CurrencySet {
    /// Build a snapshot, electing exactly one default currency
    pub fn new(currencies: Vec<Currency>) -> Result<Self> {
        if currencies.is_empty() {
            tracing::warn!("No currencies configured, using built-in dollar");
            return Self::new(vec![Currency::dollar()]);
        }

        let mut by_id = HashMap::with_capacity(currencies.len());
        let mut default_id = None;
        let mut first_id = None;

        for mut currency in currencies {
            currency.id = CurrencyId::new(currency.id.as_str());
            if currency.id.as_str().is_empty() {
                return Err(Error::Config("Currency id must not be empty".to_string()));
            }
            if by_id.contains_key(&currency.id) {
                return Err(Error::Config(format!("Duplicate currency: {}", currency.id)));
            }

            first_id.get_or_insert_with(|| currency.id.clone());
            if currency.is_default {
                if let Some(previous) = &default_id {
                    tracing::warn!(
                        currency = %currency.id,
                        default = %previous,
                        "Multiple default currencies, keeping the first"
                    );
                    currency.is_default = false;
                } else {
                    default_id = Some(currency.id.clone());
                }
            }
            by_id.insert(currency.id.clone(), currency);
        }

        let default_id = match default_id {
            Some(id) => id,
            None => {
                let id = first_id
                    .ok_or_else(|| Error::Config("No currencies configured".to_string()))?;
                tracing::warn!(currency = %id, "No default currency flagged, promoting first");
                if let Some(currency) = by_id.get_mut(&id) {
                    currency.is_default = true;
                }
                id
            }
        };

        Ok(Self { by_id, default_id })
    }

    /// Look up a currency by (unnormalized) id
    pub fn get(&self, id: &str) -> Result<&Currency> {
        self.by_id
            .get(&CurrencyId::new(id))
            .ok_or_else(|| Error::UnknownCurrency(id.trim().to_string()))
    }

    /// Whether the id names a known currency
    pub fn contains(&self, id: &CurrencyId) -> bool {
        self.by_id.contains_key(id)
    }

    /// The default currency
    pub fn default_currency(&self) -> &Currency {
        // `new` guarantees the default id is present
        &self.by_id[&self.default_id]
    }

    /// All currencies, sorted by id
    pub fn all(&self) -> Vec<&Currency> {
        let mut all: Vec<_> = self.by_id.values().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }
}

/// Process-wide handle to the current currency snapshot
#[derive(Debug)]
pub struct CurrencyRegistry {
    current: RwLock<Arc<CurrencySet>>,
}

impl CurrencyRegistry {
    /// Create a registry from an initial list
    pub fn new(currencies: Vec<Currency>) -> Result<Self> {
        Ok(Self {
            current: RwLock::new(Arc::new(CurrencySet::new(currencies)?)),
        })
    }

    /// Current snapshot
    pub fn snapshot(&self) -> Arc<CurrencySet> {
        self.current.read().clone()
    }

    /// Resolve an id to its normalized form, failing if unknown
    pub fn resolve(&self, id: &str) -> Result<CurrencyId> {
        Ok(self.snapshot().get(id)?.id.clone())
    }

    /// Id of the default currency
    pub fn default_id(&self) -> CurrencyId {
        self.snapshot().default_currency().id.clone()
    }

    /// Replace the snapshot; a failed build keeps the old one
    pub fn reload(&self, currencies: Vec<Currency>) -> Result<()> {
        let next = Arc::new(CurrencySet::new(currencies)?);
        tracing::info!(
            currencies = next.by_id.len(),
            default = %next.default_id,
            "Currency registry reloaded"
        );
        *self.current.write() = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gems() -> Currency {
        Currency {
            id: CurrencyId::new("gems"),
            display_name: "Gems".to_string(),
            symbol: "♦".to_string(),
            format_spec: "#,##0".to_string(),
            is_default: false,
        }
    }

    #[test]
    fn test_format_amount() {
        assert_eq!(format_amount(Decimal::new(123450, 2), "#,##0.00"), "1,234.50");
        assert_eq!(format_amount(Decimal::new(5, 1), "#,##0.00"), "0.50");
        assert_eq!(format_amount(Decimal::new(1234567, 0), "#,##0"), "1,234,567");
        assert_eq!(format_amount(Decimal::new(1234567, 0), "0.0"), "1234567.0");
        assert_eq!(format_amount(Decimal::new(-100, 0), "#,##0.00"), "-100.00");
    }

    #[test]
    fn test_currency_format_puts_sign_before_symbol() {
        let dollar = Currency::dollar();
        assert_eq!(dollar.format(Decimal::new(123450, 2)), "$1,234.50");
        assert_eq!(dollar.format(Decimal::new(-123450, 2)), "-$1,234.50");
    }

    #[test]
    fn test_lookup_is_case_insensitive() {
        let registry = CurrencyRegistry::new(vec![Currency::dollar(), gems()]).unwrap();
        assert_eq!(registry.resolve(" GEMS ").unwrap().as_str(), "gems");
        assert!(matches!(registry.resolve("coins"), Err(Error::UnknownCurrency(_))));
        assert_eq!(registry.default_id().as_str(), "dollar");
    }

    #[test]
    fn test_first_currency_promoted_to_default() {
        let set = CurrencySet::new(vec![gems()]).unwrap();
        assert_eq!(set.default_currency().id.as_str(), "gems");
        assert!(set.default_currency().is_default);
    }

    #[test]
    fn test_empty_list_falls_back_to_dollar() {
        let set = CurrencySet::new(Vec::new()).unwrap();
        assert_eq!(set.default_currency().id.as_str(), "dollar");
    }

    #[test]
    fn test_duplicate_currency_rejected() {
        assert!(CurrencySet::new(vec![gems(), gems()]).is_err());
    }

    #[test]
    fn test_reload_swaps_snapshot() {
        let registry = CurrencyRegistry::new(vec![Currency::dollar()]).unwrap();
        let old = registry.snapshot();

        registry.reload(vec![Currency::dollar(), gems()]).unwrap();

        assert!(old.get("gems").is_err());
        assert!(registry.snapshot().get("gems").is_ok());

        // A bad reload leaves the current snapshot in place
        assert!(registry.reload(vec![gems(), gems()]).is_err());
        assert!(registry.snapshot().get("gems").is_ok());
    }
}
