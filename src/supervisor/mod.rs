//! Supervisor: scans, gates, launches, and reclaims per-symbol traders.
//!
//! A single task owns the trader map and drives every trader serially from
//! one `select!` loop over market events, the account-sync tick, and the
//! scan tick. A trader handler runs to completion before the next event is
//! dispatched, so no trader is ever re-entered mid-await.

use crate::config::{Config, Mode};
use crate::exchange::{ExchangeAdapter, MarketEvent};
use crate::ledger::Ledger;
use crate::strategy::{CandidateSource, StrategyKind, Trader};
use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Timelike, Utc};
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

/// Balance/equity refresh cadence.
const ACCOUNT_SYNC_INTERVAL: Duration = Duration::from_secs(10);
/// A strategy variant that failed to start this many times in one scan tick
/// is skipped for the rest of the tick.
const MAX_VARIANT_FAILURES_PER_TICK: u32 = 3;

/// Per-symbol start-failure state.
#[derive(Debug, Clone, Copy)]
struct StartFailure {
    count: u32,
    until: DateTime<Utc>,
}

/// Cooldown after the nth consecutive start failure on a symbol.
fn start_failure_cooldown(count: u32) -> ChronoDuration {
    match count {
        0 | 1 => ChronoDuration::minutes(5),
        2 => ChronoDuration::minutes(15),
        _ => ChronoDuration::minutes(60),
    }
}

/// Global cooldown after n consecutive losing traders.
fn loss_cooldown(consecutive: u32) -> Option<ChronoDuration> {
    match consecutive {
        0 | 1 => None,
        2 => Some(ChronoDuration::minutes(15)),
        3 => Some(ChronoDuration::minutes(30)),
        _ => Some(ChronoDuration::minutes(60)),
    }
}

/// Owns every active trader and the launch policy around them.
pub struct Supervisor {
    config: Config,
    adapter: Arc<ExchangeAdapter>,
    ledger: Ledger,
    scanner: Arc<dyn CandidateSource>,
    traders: HashMap<String, Trader>,
    leverage_set: HashSet<String>,
    leverage_blacklist: HashSet<String>,
    failed_symbols: HashMap<String, StartFailure>,
    consecutive_losses: u32,
    loss_cooldown_until: Option<DateTime<Utc>>,
}

impl Supervisor {
    pub fn new(
        config: Config,
        adapter: Arc<ExchangeAdapter>,
        ledger: Ledger,
        scanner: Arc<dyn CandidateSource>,
    ) -> Self {
        Self {
            config,
            adapter,
            ledger,
            scanner,
            traders: HashMap::new(),
            leverage_set: HashSet::new(),
            leverage_blacklist: HashSet::new(),
            failed_symbols: HashMap::new(),
            consecutive_losses: 0,
            loss_cooldown_until: None,
        }
    }

    /// Start streams and run the event loop until the process stops.
    pub async fn run(mut self) -> Result<()> {
        if self.config.exchange.mode == Mode::Live {
            self.adapter
                .start_user_stream()
                .context("User-data stream startup failed")?;
        }
        self.adapter
            .start_market_streams(Vec::new())
            .await
            .context("Market stream startup failed")?;
        self.sync_account()
            .await
            .context("Initial account sync failed")?;

        let mut events = self.adapter.subscribe();
        let mut sync_tick = tokio::time::interval(ACCOUNT_SYNC_INTERVAL);
        let mut scan_tick =
            tokio::time::interval(Duration::from_millis(self.config.trading.scanner_interval_ms));
        sync_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        scan_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(
            mode = ?self.config.exchange.mode,
            max_traders = self.config.trading.max_traders,
            "Supervisor running"
        );

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(event) => self.dispatch(event).await,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Event stream lagged, traders missed updates");
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = sync_tick.tick() => {
                    if let Err(e) = self.sync_account().await {
                        warn!(error = %e, "Account sync failed");
                        self.ledger
                            .set_market_status(false, self.adapter.ws_connected())
                            .await;
                    }
                }
                _ = scan_tick.tick() => self.scan_and_launch().await,
            }
        }
        Ok(())
    }

    /// Route one event to the owning trader; reclaim its slot if it died.
    async fn dispatch(&mut self, event: MarketEvent) {
        let symbol = event.symbol().to_string();
        let Some(trader) = self.traders.get_mut(&symbol) else {
            return;
        };
        if let Err(e) = trader.on_event(&event).await {
            error!(%symbol, error = %e, "Trader event handling failed");
        }
        if !trader.is_active() {
            self.reap(&symbol).await;
        }
    }

    /// Remove a terminated trader, apply cooldown accounting, refresh streams.
    async fn reap(&mut self, symbol: &str) {
        let Some(trader) = self.traders.remove(symbol) else {
            return;
        };
        let pnl = trader.realized_pnl();
        self.note_terminal_pnl(pnl);
        info!(
            %symbol,
            strategy = %trader.kind(),
            pnl = %pnl,
            consecutive_losses = self.consecutive_losses,
            "Trader slot reclaimed"
        );
        self.refresh_streams().await;
    }

    /// Update the consecutive-loss counter and global cooldown.
    fn note_terminal_pnl(&mut self, pnl: Decimal) {
        if pnl < Decimal::ZERO {
            self.consecutive_losses += 1;
            if let Some(duration) = loss_cooldown(self.consecutive_losses) {
                self.loss_cooldown_until = Some(Utc::now() + duration);
                warn!(
                    consecutive_losses = self.consecutive_losses,
                    cooldown_min = duration.num_minutes(),
                    "Consecutive losses, pausing launches"
                );
            }
        } else {
            self.consecutive_losses = 0;
            self.loss_cooldown_until = None;
        }
    }

    async fn refresh_streams(&self) {
        self.adapter
            .update_symbols(self.traders.keys().cloned().collect())
            .await;
    }

    /// Refresh balance and equity in the ledger.
    async fn sync_account(&mut self) -> Result<()> {
        let balance = match self.config.exchange.mode {
            Mode::Test => {
                self.config.trading.starting_balance_usdt + self.ledger.net_profit().await
            }
            Mode::Live => self.adapter.get_balance().await?,
        };
        self.ledger.set_balance(balance).await;

        let unrealized: Decimal = self.traders.values().map(|t| t.unrealized_pnl()).sum();
        self.ledger.set_equity(balance + unrealized).await;
        self.ledger
            .set_market_status(true, self.adapter.ws_connected())
            .await;
        Ok(())
    }

    /// Whether launches are allowed at this wall-clock time.
    fn window_open(&self, now: DateTime<Utc>) -> bool {
        if !self.config.trading.enable_trading_window {
            return true;
        }
        let hour = now.hour();
        hour >= self.config.trading.trading_window_start_hour
            && hour < self.config.trading.trading_window_end_hour
    }

    fn active_count(&self, kind: StrategyKind) -> usize {
        self.traders.values().filter(|t| t.kind() == kind).count()
    }

    /// One scan tick: gate, rank, and fill free slots.
    pub async fn scan_and_launch(&mut self) {
        let max_traders = self.config.trading.max_traders;
        if self.traders.len() >= max_traders {
            return;
        }
        if let Some(until) = self.loss_cooldown_until {
            let now = Utc::now();
            if until > now {
                info!(
                    remaining_min = (until - now).num_minutes(),
                    "Loss cooldown active, skipping scan"
                );
                return;
            }
        }

        let candidates = match self.scanner.scan().await {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!(error = %e, "Scan failed");
                return;
            }
        };

        if !self.window_open(Utc::now()) {
            info!(
                start = self.config.trading.trading_window_start_hour,
                end = self.config.trading.trading_window_end_hour,
                "Outside trading window, not launching"
            );
            return;
        }

        let volatility_slots = max_traders / 2;
        let grid_slots = max_traders - volatility_slots;
        let mut variant_failures: HashMap<StrategyKind, u32> = HashMap::new();

        for symbol in candidates {
            if self.traders.len() >= max_traders {
                break;
            }
            if self.traders.contains_key(&symbol) || self.leverage_blacklist.contains(&symbol) {
                continue;
            }
            if let Some(failure) = self.failed_symbols.get(&symbol) {
                if failure.until > Utc::now() {
                    continue;
                }
            }

            if self.config.exchange.mode == Mode::Live && !self.leverage_set.contains(&symbol) {
                match self
                    .adapter
                    .set_leverage(&symbol, self.config.trading.leverage)
                    .await
                {
                    Ok(()) => {
                        self.leverage_set.insert(symbol.clone());
                    }
                    Err(e) => {
                        warn!(%symbol, error = %e, "Leverage setup failed, blacklisting");
                        self.leverage_blacklist.insert(symbol.clone());
                        continue;
                    }
                }
            }

            // Volatility is preferred whenever it has a free, healthy slot.
            let volatility_ok = self.active_count(StrategyKind::Volatility) < volatility_slots
                && variant_failures
                    .get(&StrategyKind::Volatility)
                    .copied()
                    .unwrap_or(0)
                    < MAX_VARIANT_FAILURES_PER_TICK;
            let grid_ok = self.active_count(StrategyKind::Grid) < grid_slots
                && variant_failures
                    .get(&StrategyKind::Grid)
                    .copied()
                    .unwrap_or(0)
                    < MAX_VARIANT_FAILURES_PER_TICK;
            let kind = if volatility_ok {
                StrategyKind::Volatility
            } else if grid_ok {
                StrategyKind::Grid
            } else {
                continue;
            };

            match Trader::start(
                kind,
                symbol.clone(),
                Arc::clone(&self.adapter),
                self.ledger.clone(),
                &self.config,
            )
            .await
            {
                Ok(trader) => {
                    info!(%symbol, strategy = %kind, "Trader launched");
                    self.traders.insert(symbol, trader);
                }
                Err(e) => {
                    *variant_failures.entry(kind).or_insert(0) += 1;
                    let failure = self.failed_symbols.entry(symbol.clone()).or_insert(
                        StartFailure {
                            count: 0,
                            until: Utc::now(),
                        },
                    );
                    failure.count += 1;
                    failure.until = Utc::now() + start_failure_cooldown(failure.count);
                    warn!(
                        %symbol,
                        strategy = %kind,
                        failures = failure.count,
                        error = %e,
                        "Trader start failed, symbol cooling down"
                    );
                }
            }
        }

        self.refresh_streams().await;
    }

    pub fn active_traders(&self) -> usize {
        self.traders.len()
    }
}
