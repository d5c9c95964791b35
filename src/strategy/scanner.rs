//! Symbol scanner: ranks tradable perpetuals for the supervisor.

use crate::config::ScannerConfig;
use crate::exchange::{ExchangeAdapter, Ticker24h};
use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Order-book depth levels requested per candidate.
const DEPTH_LEVELS: u32 = 20;
/// Deep-filter evaluation is capped to this many change-ranked candidates,
/// since klines and depth cost one REST call each per symbol.
const MAX_DEEP_CANDIDATES: usize = 30;

/// Source of ranked trading candidates, best first.
#[async_trait]
pub trait CandidateSource: Send + Sync {
    async fn scan(&self) -> Result<Vec<String>>;
}

/// Reasons for rejecting a symbol during deep qualification.
#[derive(Debug, Clone, Copy)]
enum RejectReason {
    LowVolumeRatio,
    NarrowRange,
    DepthOutOfRange,
    SpreadOutOfRange,
    MissingData,
}

/// A symbol that passed every filter, with its ranking score.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub symbol: String,
    pub change_pct: Decimal,
    pub range_pct: Decimal,
    pub score: Decimal,
}

/// Scans 24h tickers and order books for eligible symbols.
pub struct MarketScanner {
    adapter: Arc<ExchangeAdapter>,
    config: ScannerConfig,
    max_candidates: usize,
}

impl MarketScanner {
    pub fn new(adapter: Arc<ExchangeAdapter>, config: ScannerConfig, max_candidates: usize) -> Self {
        Self {
            adapter,
            config,
            max_candidates,
        }
    }

    /// Whether a ticker's 24h change magnitude falls inside the band.
    fn change_in_band(&self, ticker: &Ticker24h) -> bool {
        let change = ticker.price_change_percent.abs();
        change >= self.config.min_change && change <= self.config.max_change
    }

    /// Deep per-symbol checks: volume ratio, 4h range, depth, spread.
    async fn qualify(&self, ticker: &Ticker24h) -> Result<Candidate, RejectReason> {
        let symbol = &ticker.symbol;

        let klines = self
            .adapter
            .get_klines(symbol, "1h", 24)
            .await
            .map_err(|_| RejectReason::MissingData)?;
        if klines.is_empty() || ticker.quote_volume <= Decimal::ZERO {
            return Err(RejectReason::MissingData);
        }

        // Share of the day's turnover that happened in the last hour.
        let last_hour_volume = klines.last().map(|k| k.quote_volume).unwrap_or_default();
        if last_hour_volume / ticker.quote_volume < self.config.volume_ratio {
            return Err(RejectReason::LowVolumeRatio);
        }

        let recent = &klines[klines.len().saturating_sub(4)..];
        let high = recent.iter().map(|k| k.high).max().unwrap_or_default();
        let low = recent.iter().map(|k| k.low).min().unwrap_or_default();
        if ticker.last_price <= Decimal::ZERO {
            return Err(RejectReason::MissingData);
        }
        let range_pct = (high - low) / ticker.last_price * dec!(100);
        if range_pct < self.config.min_range_percent {
            return Err(RejectReason::NarrowRange);
        }

        let depth = self
            .adapter
            .get_depth(symbol, DEPTH_LEVELS)
            .await
            .map_err(|_| RejectReason::MissingData)?;
        let notional = depth.notional();
        if notional < self.config.depth_min || notional > self.config.depth_max {
            return Err(RejectReason::DepthOutOfRange);
        }

        let (best_bid, best_ask) = match (depth.bids.first(), depth.asks.first()) {
            (Some(bid), Some(ask)) => (bid[0], ask[0]),
            _ => return Err(RejectReason::MissingData),
        };
        let mid = (best_bid + best_ask) / Decimal::TWO;
        if mid <= Decimal::ZERO {
            return Err(RejectReason::MissingData);
        }
        let spread_pct = (best_ask - best_bid) / mid * dec!(100);
        if spread_pct < self.config.spread_min || spread_pct > self.config.spread_max {
            return Err(RejectReason::SpreadOutOfRange);
        }

        let change_pct = ticker.price_change_percent.abs();
        Ok(Candidate {
            symbol: symbol.clone(),
            change_pct,
            range_pct,
            score: change_pct + range_pct,
        })
    }
}

#[async_trait]
impl CandidateSource for MarketScanner {
    #[instrument(skip(self))]
    async fn scan(&self) -> Result<Vec<String>> {
        let info = self.adapter.get_exchange_info().await?;
        let tickers = self.adapter.get_24h_tickers().await?;

        let tradable: std::collections::HashSet<&str> = info
            .symbols
            .iter()
            .filter(|s| {
                s.status == "TRADING" && s.contract_type == "PERPETUAL" && s.quote_asset == "USDT"
            })
            .map(|s| s.symbol.as_str())
            .collect();

        let mut rejected_change = 0usize;
        let mut rejected_volume_ratio = 0usize;
        let mut rejected_range = 0usize;
        let mut rejected_depth = 0usize;
        let mut rejected_spread = 0usize;
        let mut rejected_missing = 0usize;

        let mut in_band: Vec<&Ticker24h> = tickers
            .iter()
            .filter(|t| tradable.contains(t.symbol.as_str()))
            .filter(|t| {
                if self.change_in_band(t) {
                    true
                } else {
                    rejected_change += 1;
                    false
                }
            })
            .collect();
        in_band.sort_by(|a, b| {
            b.price_change_percent
                .abs()
                .cmp(&a.price_change_percent.abs())
        });

        let mut candidates: Vec<Candidate> = Vec::new();
        if self.config.enable_scanner_filters {
            for ticker in in_band.iter().take(MAX_DEEP_CANDIDATES) {
                match self.qualify(ticker).await {
                    Ok(candidate) => candidates.push(candidate),
                    Err(reason) => match reason {
                        RejectReason::LowVolumeRatio => rejected_volume_ratio += 1,
                        RejectReason::NarrowRange => rejected_range += 1,
                        RejectReason::DepthOutOfRange => rejected_depth += 1,
                        RejectReason::SpreadOutOfRange => rejected_spread += 1,
                        RejectReason::MissingData => rejected_missing += 1,
                    },
                }
            }
        } else {
            candidates = in_band
                .iter()
                .map(|t| Candidate {
                    symbol: t.symbol.clone(),
                    change_pct: t.price_change_percent.abs(),
                    range_pct: Decimal::ZERO,
                    score: t.price_change_percent.abs(),
                })
                .collect();
        }

        candidates.sort_by(|a, b| b.score.cmp(&a.score));
        candidates.truncate(self.max_candidates);

        info!(
            scanned = tickers.len(),
            qualified = candidates.len(),
            rejected_change,
            rejected_volume_ratio,
            rejected_range,
            rejected_depth,
            rejected_spread,
            rejected_missing,
            "Market scan complete"
        );
        if candidates.is_empty() {
            warn!("Scan produced no candidates");
        }

        Ok(candidates.into_iter().map(|c| c.symbol).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn ticker(symbol: &str, change: Decimal) -> Ticker24h {
        Ticker24h {
            symbol: symbol.to_string(),
            price_change_percent: change,
            last_price: dec!(100),
            volume: dec!(1000),
            quote_volume: dec!(100000),
        }
    }

    fn scanner(config: ScannerConfig) -> MarketScanner {
        let adapter = Arc::new(
            ExchangeAdapter::new(&crate::config::Config::default()).unwrap(),
        );
        MarketScanner::new(adapter, config, 6)
    }

    #[test]
    fn test_change_band_includes_both_signs() {
        let config = ScannerConfig {
            min_change: dec!(5),
            max_change: dec!(30),
            ..crate::config::Config::default().scanner
        };
        let scanner = scanner(config);

        assert!(scanner.change_in_band(&ticker("AUSDT", dec!(7))));
        assert!(scanner.change_in_band(&ticker("BUSDT", dec!(-7))));
        assert!(!scanner.change_in_band(&ticker("CUSDT", dec!(3))));
        assert!(!scanner.change_in_band(&ticker("DUSDT", dec!(45))));
        // Boundary values are inclusive
        assert!(scanner.change_in_band(&ticker("EUSDT", dec!(5))));
        assert!(scanner.change_in_band(&ticker("FUSDT", dec!(30))));
    }

    #[test]
    fn test_candidate_score_is_change_plus_range() {
        let candidate = Candidate {
            symbol: "AUSDT".to_string(),
            change_pct: dec!(8),
            range_pct: dec!(4),
            score: dec!(8) + dec!(4),
        };
        assert_eq!(candidate.score, dec!(12));
    }
}
