//! Ticker data: last price and 24h statistics for a pair.

use crate::shared::Pair;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Price ticker update. Replaces the stored ticker when strictly newer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceUpdate {
    pub pair: Pair,
    pub price: Decimal,
    #[serde(rename = "change24h")]
    pub change_24h: Decimal,
    #[serde(rename = "volume24h")]
    pub volume_24h: Decimal,
    #[serde(rename = "high24h")]
    pub high_24h: Decimal,
    #[serde(rename = "low24h")]
    pub low_24h: Decimal,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_price_update_uses_camel_case_24h_fields() {
        let json = r#"{"pair":"BTC/USDT","price":65000.5,"change24h":-1.25,
            "volume24h":1200,"high24h":66000,"low24h":64000,"timestamp":1700000000000}"#;
        let update: PriceUpdate = serde_json::from_str(json).unwrap();
        assert_eq!(update.price, Decimal::new(650005, 1));
        assert_eq!(update.change_24h, Decimal::new(-125, 2));
        assert_eq!(update.timestamp, 1_700_000_000_000);

        let back = serde_json::to_value(&update).unwrap();
        assert!(back.get("change24h").is_some());
        assert!(back.get("change_24h").is_none());
    }
}
