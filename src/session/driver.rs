use anyhow::Context;
use chrono::NaiveDateTime;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;

use super::schedule::{now_kst, Phase, SessionSchedule};
use crate::api::{Broker, Notifier};
use crate::config::{load_watchlist, AppConfig};
use crate::execution::{
    ExecutionReport, MarketDataPoller, OrderExecutor, PositionTracker, RateLimiter, RetryPolicy,
};
use crate::models::{OrderIntent, OrderMode, OrderOutcome, Side, SymbolConfig};
use crate::strategy::{CutPriceUpdate, DecisionEngine};

/// Knobs for one trading session
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub schedule: SessionSchedule,
    pub watchlist_path: PathBuf,
    pub batch_size: usize,
    pub batch_pause: Duration,
    pub cycle_interval: Duration,
    pub fetch_retry: RetryPolicy,
    pub balance_retry: RetryPolicy,
    pub min_credit_buying_power: f64,
}

impl From<&AppConfig> for SessionSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            schedule: config.session,
            watchlist_path: config.watchlist_path.clone(),
            batch_size: config.batch_size,
            batch_pause: Duration::from_millis(config.batch_pause_ms),
            cycle_interval: Duration::from_millis(config.cycle_interval_ms),
            fetch_retry: config.fetch_retry(),
            balance_retry: config.balance_retry(),
            min_credit_buying_power: config.min_credit_buying_power,
        }
    }
}

/// What one pass over the watch-list did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleSummary {
    pub symbols: usize,
    pub fetch_failures: usize,
    pub stale_skipped: usize,
    pub intents: usize,
    pub accepted: usize,
    /// Some of the intent's orders were rejected
    pub partial: usize,
    pub rejected: usize,
}

/// Drives reconcile → fetch → decide → execute once per cycle
pub struct TradingSession {
    broker: Arc<dyn Broker>,
    notifier: Arc<dyn Notifier>,
    limiter: RateLimiter,
    poller: MarketDataPoller,
    tracker: PositionTracker,
    executor: OrderExecutor,
    engine: DecisionEngine,
    watchlist: Vec<SymbolConfig>,
    names: HashMap<String, String>,
    settings: SessionSettings,
}

impl TradingSession {
    pub fn new(
        broker: Arc<dyn Broker>,
        notifier: Arc<dyn Notifier>,
        limiter: RateLimiter,
        settings: SessionSettings,
    ) -> Self {
        let poller = MarketDataPoller::new(
            broker.clone(),
            limiter.clone(),
            settings.fetch_retry,
            settings.batch_pause,
        );
        let tracker = PositionTracker::new(broker.clone(), limiter.clone(), settings.balance_retry);
        let executor = OrderExecutor::new(
            broker.clone(),
            limiter.clone(),
            settings.min_credit_buying_power,
        );
        let engine = DecisionEngine::new(settings.schedule);

        Self {
            broker,
            notifier,
            limiter,
            poller,
            tracker,
            executor,
            engine,
            watchlist: Vec::new(),
            names: HashMap::new(),
            settings,
        }
    }

    pub fn engine(&self) -> &DecisionEngine {
        &self.engine
    }

    pub fn watchlist(&self) -> &[SymbolConfig] {
        &self.watchlist
    }

    async fn refresh_credentials(&self) -> anyhow::Result<()> {
        if let Err(e) = self.broker.ensure_session().await {
            self.notifier
                .notify(&format!("🚨 Credential refresh failed, stopping: {}", e))
                .await;
            return Err(e).context("credential refresh failed");
        }
        Ok(())
    }

    /// Re-read the watch-list, keeping the previous one if the file is unreadable
    async fn reload_watchlist(&mut self) {
        match load_watchlist(&self.settings.watchlist_path).await {
            Ok(list) => {
                if list.len() != self.watchlist.len() {
                    tracing::info!("📋 Watch-list now has {} symbols", list.len());
                }
                self.watchlist = list;
            }
            Err(e) => tracing::warn!("⚠️  {}, keeping previous watch-list", e),
        }
    }

    /// Display name for notifications, looked up once per symbol
    async fn display_name(&mut self, symbol: &str) -> String {
        if let Some(name) = self.names.get(symbol) {
            return name.clone();
        }
        let looked_up = match self.limiter.acquire().await {
            Ok(_permit) => self.broker.symbol_name(symbol).await,
            Err(e) => {
                tracing::debug!(symbol, "Name lookup skipped: {}", e);
                return symbol.to_string();
            }
        };
        match looked_up {
            Ok(name) => {
                self.names.insert(symbol.to_string(), name.clone());
                name
            }
            Err(e) => {
                tracing::debug!(symbol, "Name lookup failed: {}", e);
                symbol.to_string()
            }
        }
    }

    /// Authenticate, load the watch-list and seed held symbols
    pub async fn start(&mut self) -> anyhow::Result<()> {
        self.refresh_credentials().await?;

        self.watchlist = load_watchlist(&self.settings.watchlist_path)
            .await
            .context("initial watch-list load")?;

        let recon = self.tracker.reconcile().await;
        self.engine
            .seed_holdings(recon.positions.keys().map(String::as_str));

        tracing::info!(
            symbols = self.watchlist.len(),
            held = recon.positions.len(),
            "🚀 Trading session started"
        );
        self.notifier
            .notify(&format!(
                "🚀 Trading session started: {} symbols watched, {} positions held",
                self.watchlist.len(),
                recon.positions.len()
            ))
            .await;
        Ok(())
    }

    /// One pass over the symbols whose trading window is open.
    /// Errors are fatal to the session.
    pub async fn run_cycle(&mut self, now: NaiveDateTime) -> anyhow::Result<CycleSummary> {
        self.refresh_credentials().await?;
        self.reload_watchlist().await;

        let recon = self.tracker.reconcile().await;
        let watchlist: Vec<SymbolConfig> = self
            .watchlist
            .iter()
            .filter(|c| self.engine.is_active(c.trade_type, now.time()))
            .cloned()
            .collect();
        let samples = self
            .poller
            .fetch_batch(&watchlist, self.settings.batch_size)
            .await;

        let mut summary = CycleSummary {
            symbols: watchlist.len(),
            ..CycleSummary::default()
        };

        for (config, (symbol, fetched)) in watchlist.iter().zip(samples) {
            let sample = match fetched {
                Ok(sample) => sample,
                Err(_) => {
                    summary.fetch_failures += 1;
                    continue;
                }
            };
            if recon.is_stale(&symbol) {
                tracing::debug!(symbol = %symbol, "Skipping symbol with stale holdings");
                summary.stale_skipped += 1;
                continue;
            }

            let position = recon.position(&symbol);
            let intent = self.engine.evaluate(config, &sample, position, now.time());
            for update in self.engine.take_cut_updates() {
                self.report_cut_price(config, &update).await;
            }
            let Some(intent) = intent else {
                continue;
            };
            summary.intents += 1;

            // Buying on a partial book could double a position we cannot see
            if intent.side == Side::Buy && !recon.is_complete() {
                tracing::info!(symbol = %symbol, "Holdings incomplete, holding off on buy");
                self.engine.resolve(&symbol, OrderOutcome::Rejected);
                continue;
            }

            let report = self.executor.execute(&intent, position, now.date()).await;
            let outcome = report.outcome();
            self.engine.resolve(&symbol, outcome);
            match outcome {
                OrderOutcome::Accepted => summary.accepted += 1,
                OrderOutcome::Partial => summary.partial += 1,
                OrderOutcome::Rejected => summary.rejected += 1,
            }
            self.report_outcome(&intent, &report).await;
        }

        tracing::debug!(?summary, "Cycle complete");
        Ok(summary)
    }

    async fn report_cut_price(&mut self, config: &SymbolConfig, update: &CutPriceUpdate) {
        let name = self.display_name(&update.symbol).await;
        self.notifier
            .notify(&format!(
                "✂️ {}({}/{}) avg {:.0}, band {}-{}, cut price {:.0}",
                name,
                update.symbol,
                update.trade_type,
                update.avg_cost,
                config.low_threshold,
                config.high_threshold,
                update.cut_price
            ))
            .await;
    }

    async fn report_outcome(&mut self, intent: &OrderIntent, report: &ExecutionReport) {
        let name = self.display_name(&intent.symbol).await;
        let price = match intent.mode {
            OrderMode::Market => "market".to_string(),
            OrderMode::Limit { price } => format!("{}", price),
        };

        for (order, id) in &report.accepted {
            self.notifier
                .notify(&format!(
                    "✅ {} {}({}) x{} @ {} [{}] {:?} order {}",
                    order.side, name, order.symbol, order.quantity, price, intent.reason, order.funding, id
                ))
                .await;
        }
        for (order, reason) in &report.rejected {
            self.notifier
                .notify(&format!(
                    "❌ {} {}({}) x{} [{}] rejected: {}",
                    order.side, name, order.symbol, order.quantity, intent.reason, reason
                ))
                .await;
        }
    }

    /// Clear session state and announce the close
    pub async fn finish(&mut self) {
        self.engine.end_session();
        tracing::info!("🏁 Trading session ended");
        self.notifier.notify("🏁 Trading session ended").await;
    }

    /// Run the whole trading day: wait for the open, cycle until exit.
    pub async fn run(mut self) -> anyhow::Result<()> {
        let schedule = self.settings.schedule;
        let now = now_kst().naive_local();

        match schedule.phase(now) {
            Phase::Holiday => {
                self.notifier.notify("🏖️ Market holiday, not trading today").await;
                return Ok(());
            }
            Phase::Closed => {
                tracing::info!("Session already over for today ({})", schedule.closes_at());
                return Ok(());
            }
            Phase::BeforeOpen => {
                let wait = schedule.until_open(now);
                tracing::info!("⏳ Waiting {:?} for the open at {}", wait, schedule.start);
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = tokio::signal::ctrl_c() => {
                        tracing::info!("Interrupted before the open");
                        return Ok(());
                    }
                }
            }
            Phase::Open => {}
        }

        self.start().await?;

        let mut ticker = tokio::time::interval(self.settings.cycle_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Interrupted, shutting down");
                    break;
                }
            }

            let now = now_kst().naive_local();
            if schedule.phase(now) != Phase::Open {
                break;
            }
            if let Err(e) = self.run_cycle(now).await {
                tracing::error!("Session aborted: {:#}", e);
                self.finish().await;
                return Err(e);
            }
        }

        self.finish().await;
        Ok(())
    }
}
