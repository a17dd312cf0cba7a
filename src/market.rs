use std::{env, time::Duration};

use anyhow::{Context, Result};
use reqwest::Client;
use serde_json::Value;

use crate::models::Quote;

const DEFAULT_QUOTE_URL: &str = "https://finnhub.io/api/v1/quote";
const QUOTE_TIMEOUT: Duration = Duration::from_secs(10);

/// Quote lookups for the watchlist. Calls are sequential on purpose; the
/// vendors rate-limit aggressively.
pub struct MarketClient {
    http: Client,
    base_url: String,
    api_key: String,
}

impl MarketClient {
    /// None when no MARKET_API_KEY is configured; the pipeline then skips
    /// quotes entirely.
    pub fn from_env(http: &Client) -> Option<Self> {
        let api_key = env::var("MARKET_API_KEY").ok().filter(|k| !k.is_empty())?;
        let base_url = env::var("MARKET_API_URL").unwrap_or_else(|_| DEFAULT_QUOTE_URL.to_string());
        Some(Self {
            http: http.clone(),
            base_url,
            api_key,
        })
    }

    pub async fn quote(&self, symbol: &str) -> Result<Quote> {
        let resp = self
            .http
            .get(&self.base_url)
            .query(&[("symbol", symbol)])
            .bearer_auth(&self.api_key)
            .timeout(QUOTE_TIMEOUT)
            .send()
            .await
            .with_context(|| format!("quote request for {symbol}"))?;

        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("quote HTTP {status} for {symbol}");
        }
        let body: Value = resp.json().await.context("quote body")?;
        coerce_quote(symbol, &body)
            .ok_or_else(|| anyhow::anyhow!("quote for {symbol} had missing or non-finite fields"))
    }
}

fn field(v: &Value, names: &[&str]) -> Option<f64> {
    for name in names {
        if let Some(n) = v.get(name).and_then(Value::as_f64) {
            return Some(n);
        }
    }
    None
}

/// Map vendor-specific field names onto our shape; any missing or
/// non-finite numeric disqualifies the symbol.
pub fn coerce_quote(symbol: &str, body: &Value) -> Option<Quote> {
    let price = field(body, &["price", "c", "current_price"])?;
    let change_amount = field(body, &["change", "d", "change_amount"])?;
    let change_percent = field(body, &["change_percent", "changePercent", "dp"])?;
    if !price.is_finite() || !change_amount.is_finite() || !change_percent.is_finite() {
        return None;
    }
    Some(Quote {
        symbol: symbol.to_string(),
        price,
        change_amount,
        change_percent,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn maps_short_vendor_fields() {
        let q = coerce_quote("AAPL", &json!({"c": 212.5, "d": -1.25, "dp": -0.58})).unwrap();
        assert_eq!(q.symbol, "AAPL");
        assert_eq!(q.price, 212.5);
        assert_eq!(q.change_amount, -1.25);
        assert_eq!(q.change_percent, -0.58);
    }

    #[test]
    fn maps_long_vendor_fields() {
        let q = coerce_quote(
            "MSFT",
            &json!({"price": 501.0, "change": 3.0, "change_percent": 0.6}),
        )
        .unwrap();
        assert_eq!(q.price, 501.0);
    }

    #[test]
    fn rejects_missing_or_non_finite() {
        assert!(coerce_quote("X", &json!({"c": 1.0, "d": 0.5})).is_none());
        assert!(coerce_quote("X", &json!({"c": "NaN", "d": 0.5, "dp": 0.1})).is_none());
        assert!(coerce_quote("X", &json!({})).is_none());
    }
}
