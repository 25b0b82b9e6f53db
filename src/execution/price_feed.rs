use chrono::{Duration as ChronoDuration, NaiveDate};
use futures::future::join_all;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use super::rate_limiter::{LimiterClosed, RateLimiter};
use super::retry::{Classify, FailureKind, RetryError, RetryPolicy};
use crate::api::{Broker, BrokerError};
use crate::models::{DailyBar, PriceSample, QuoteField, SymbolConfig};
use crate::session::schedule::now_kst;

/// Sessions looked back for the breakout high
const HIGH_LOOKBACK_SESSIONS: usize = 120;
/// Calendar days per chart request; the endpoint caps rows per call
const CHART_WINDOW_DAYS: i64 = 100;
const CLOSES_WINDOW_DAYS: i64 = 20;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Limiter(#[from] LimiterClosed),

    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: Box<FetchError> },

    #[error("insufficient chart history: {0} bars")]
    InsufficientHistory(usize),
}

impl Classify for FetchError {
    fn classify(&self) -> FailureKind {
        match self {
            FetchError::Broker(e) => e.classify(),
            _ => FailureKind::Fatal,
        }
    }
}

impl From<RetryError<FetchError>> for FetchError {
    fn from(e: RetryError<FetchError>) -> Self {
        match e {
            RetryError::Exhausted { attempts, last } => FetchError::Exhausted {
                attempts,
                last: Box::new(last),
            },
            RetryError::Fatal(e) => e,
        }
    }
}

/// Run a broker call under the shared limiter, retrying per `policy`.
/// The permit is held only for the duration of each attempt.
pub(crate) async fn guarded<T, F, Fut>(
    limiter: &RateLimiter,
    policy: &RetryPolicy,
    label: &str,
    op: F,
) -> Result<T, FetchError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, BrokerError>>,
{
    policy
        .run(label, |_| {
            let op = &op;
            async move {
                let _permit = limiter.acquire().await?;
                Ok::<T, FetchError>(op().await?)
            }
        })
        .await
        .map_err(FetchError::from)
}

/// Polls quotes for the watch-list with bounded concurrency
pub struct MarketDataPoller {
    broker: Arc<dyn Broker>,
    limiter: RateLimiter,
    retry: RetryPolicy,
    batch_pause: Duration,
}

impl MarketDataPoller {
    pub fn new(
        broker: Arc<dyn Broker>,
        limiter: RateLimiter,
        retry: RetryPolicy,
        batch_pause: Duration,
    ) -> Self {
        Self {
            broker,
            limiter,
            retry,
            batch_pause,
        }
    }

    /// Fetch a single quote field
    pub async fn fetch_price(&self, symbol: &str, field: QuoteField) -> Result<f64, FetchError> {
        let label = format!("quote {} {:?}", symbol, field);
        guarded(&self.limiter, &self.retry, &label, || {
            self.broker.quote(symbol, field)
        })
        .await
    }

    /// Fetch everything the symbol's strategy reads
    pub async fn fetch_sample(&self, config: &SymbolConfig) -> Result<PriceSample, FetchError> {
        let params = config.trade_type.params();
        let symbol = config.symbol.as_str();
        let today = now_kst().date_naive();

        let price = self.fetch_price(symbol, params.price_field).await?;
        let mut sample = PriceSample::bare(symbol, price);

        for &field in params.extra_fields() {
            let value = self.fetch_price(symbol, field).await?;
            match field {
                QuoteField::Open => sample.open = Some(value),
                QuoteField::Ceiling => sample.ceiling = Some(value),
                QuoteField::Reference => sample.reference = Some(value),
                QuoteField::Current | QuoteField::ExpectedClose => {}
            }
        }

        if params.needs_high_120d() {
            sample.high_120d = Some(self.fetch_high_120d(symbol, today).await?);
        }

        let closes = params.prior_closes();
        if closes > 0 {
            sample.prior_closes = self.fetch_prior_closes(symbol, closes, today).await?;
        }

        tracing::debug!(symbol, price, "Fetched price sample");
        Ok(sample)
    }

    /// Highest daily high over the sessions before `today`
    pub async fn fetch_high_120d(&self, symbol: &str, today: NaiveDate) -> Result<f64, FetchError> {
        let recent_from = today - ChronoDuration::days(CHART_WINDOW_DAYS);
        let older_to = recent_from - ChronoDuration::days(1);
        let older_from = older_to - ChronoDuration::days(CHART_WINDOW_DAYS);

        let recent = self.fetch_bars(symbol, recent_from, today).await?;
        let older = self.fetch_bars(symbol, older_from, older_to).await?;

        let bars = prior_sessions(recent.into_iter().chain(older), today);
        bars.iter()
            .take(HIGH_LOOKBACK_SESSIONS)
            .map(|b| b.high)
            .reduce(f64::max)
            .ok_or(FetchError::InsufficientHistory(0))
    }

    /// Closes of the `count` sessions before `today`, most recent first
    pub async fn fetch_prior_closes(
        &self,
        symbol: &str,
        count: usize,
        today: NaiveDate,
    ) -> Result<Vec<f64>, FetchError> {
        let from = today - ChronoDuration::days(CLOSES_WINDOW_DAYS);
        let bars = prior_sessions(self.fetch_bars(symbol, from, today).await?, today);
        if bars.len() < count {
            return Err(FetchError::InsufficientHistory(bars.len()));
        }
        Ok(bars.iter().take(count).map(|b| b.close).collect())
    }

    async fn fetch_bars(
        &self,
        symbol: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<DailyBar>, FetchError> {
        let label = format!("chart {} {}..{}", symbol, from, to);
        guarded(&self.limiter, &self.retry, &label, || {
            self.broker.daily_bars(symbol, from, to)
        })
        .await
    }

    /// Fetch samples in batches of `batch_size`, pausing between batches.
    /// One symbol's failure never affects the others.
    pub async fn fetch_batch(
        &self,
        configs: &[SymbolConfig],
        batch_size: usize,
    ) -> Vec<(String, Result<PriceSample, FetchError>)> {
        let batch_size = batch_size.max(1);
        let batches = configs.len().div_ceil(batch_size);
        let mut results = Vec::with_capacity(configs.len());

        for (i, batch) in configs.chunks(batch_size).enumerate() {
            let fetched = join_all(batch.iter().map(|config| async move {
                (config.symbol.clone(), self.fetch_sample(config).await)
            }))
            .await;

            for (symbol, result) in &fetched {
                if let Err(e) = result {
                    tracing::warn!(symbol = %symbol, "Price fetch failed: {}", e);
                }
            }
            results.extend(fetched);

            if i + 1 < batches && !self.batch_pause.is_zero() {
                tokio::time::sleep(self.batch_pause).await;
            }
        }

        results
    }
}

/// Bars dated before `today`, deduplicated by date, most recent first
fn prior_sessions(bars: impl IntoIterator<Item = DailyBar>, today: NaiveDate) -> Vec<DailyBar> {
    let by_date: BTreeMap<NaiveDate, DailyBar> = bars
        .into_iter()
        .filter(|b| b.date < today)
        .map(|b| (b.date, b))
        .collect();
    by_date.into_values().rev().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::PaperBroker;
    use crate::strategy::TradeType;

    fn poller(broker: Arc<PaperBroker>) -> MarketDataPoller {
        MarketDataPoller::new(
            broker,
            RateLimiter::new(4),
            RetryPolicy::fixed(10, Duration::from_millis(1)),
            Duration::from_millis(1),
        )
    }

    fn config(symbol: &str, trade_type: TradeType) -> SymbolConfig {
        SymbolConfig {
            symbol: symbol.to_string(),
            low_threshold: 900.0,
            high_threshold: 1200.0,
            trade_type,
        }
    }

    fn bar(date: NaiveDate, high: f64, close: f64) -> DailyBar {
        DailyBar {
            date,
            open: close,
            high,
            low: close,
            close,
        }
    }

    #[test]
    fn test_prior_sessions_drops_today_and_dedupes() {
        let today = NaiveDate::from_ymd_opt(2024, 3, 8).unwrap();
        let d = |day| NaiveDate::from_ymd_opt(2024, 3, day).unwrap();
        let bars = vec![
            bar(d(8), 999.0, 990.0),
            bar(d(6), 110.0, 105.0),
            bar(d(7), 120.0, 115.0),
            bar(d(6), 110.0, 105.0),
        ];

        let sessions = prior_sessions(bars, today);
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].date, d(7));
        assert_eq!(sessions[1].date, d(6));
    }

    #[tokio::test]
    async fn test_fetch_price_retries_transient() {
        let broker = Arc::new(PaperBroker::new());
        broker.set_quote("005930", QuoteField::Current, 71_000.0);
        broker.fail_quotes("005930", Some(3), BrokerError::Timeout);

        let poller = poller(broker.clone());
        let price = poller
            .fetch_price("005930", QuoteField::Current)
            .await
            .unwrap();

        assert_eq!(price, 71_000.0);
        assert_eq!(broker.quote_calls("005930"), 4);
    }

    #[tokio::test]
    async fn test_timeout_exhaustion_is_isolated() {
        let broker = Arc::new(PaperBroker::new());
        broker.set_quote("AAA", QuoteField::Current, 1000.0);
        broker.set_quote("BBB", QuoteField::Current, 2000.0);
        broker.set_quote("ZZZ", QuoteField::Current, 3000.0);
        broker.fail_quotes("ZZZ", None, BrokerError::Timeout);

        let poller = poller(broker.clone());
        let configs = vec![
            config("AAA", TradeType::MeanReversion),
            config("ZZZ", TradeType::MeanReversion),
            config("BBB", TradeType::MeanReversion),
        ];
        let results = poller.fetch_batch(&configs, 2).await;

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].0, "AAA");
        assert_eq!(results[0].1.as_ref().unwrap().price, 1000.0);
        assert_eq!(results[2].1.as_ref().unwrap().price, 2000.0);

        match &results[1].1 {
            Err(FetchError::Exhausted { attempts, last }) => {
                assert_eq!(*attempts, 10);
                assert!(matches!(**last, FetchError::Broker(BrokerError::Timeout)));
            }
            other => panic!("expected exhaustion, got {:?}", other),
        }
        assert_eq!(broker.quote_calls("ZZZ"), 10);
    }

    #[tokio::test]
    async fn test_malformed_quote_not_retried() {
        let broker = Arc::new(PaperBroker::new());
        broker.fail_quotes(
            "005930",
            None,
            BrokerError::Malformed("empty output".to_string()),
        );

        let poller = poller(broker.clone());
        let result = poller.fetch_price("005930", QuoteField::Current).await;

        assert!(matches!(
            result,
            Err(FetchError::Broker(BrokerError::Malformed(_)))
        ));
        assert_eq!(broker.quote_calls("005930"), 1);
    }

    #[tokio::test]
    async fn test_breakout_sample_has_all_fields() {
        let broker = Arc::new(PaperBroker::new());
        let today = now_kst().date_naive();
        for field in [
            QuoteField::ExpectedClose,
            QuoteField::Open,
            QuoteField::Ceiling,
            QuoteField::Reference,
        ] {
            broker.set_quote("000660", field, 1000.0);
        }
        let bars: Vec<DailyBar> = (1..=150)
            .map(|i| bar(today - ChronoDuration::days(i), 900.0 + i as f64, 950.0))
            .collect();
        broker.set_bars("000660", bars);

        let sample = poller(broker)
            .fetch_sample(&config("000660", TradeType::HighBreakout))
            .await
            .unwrap();

        assert_eq!(sample.open, Some(1000.0));
        assert_eq!(sample.ceiling, Some(1000.0));
        assert_eq!(sample.reference, Some(1000.0));
        // 120 most recent prior sessions: highs 901..=1020
        assert_eq!(sample.high_120d, Some(1020.0));
    }

    #[tokio::test]
    async fn test_low_bounce_sample_reads_two_closes() {
        let broker = Arc::new(PaperBroker::new());
        let today = now_kst().date_naive();
        broker.set_quote("035720", QuoteField::ExpectedClose, 50_000.0);
        broker.set_bars(
            "035720",
            vec![
                bar(today, 0.0, 49_000.0),
                bar(today - ChronoDuration::days(1), 0.0, 51_000.0),
                bar(today - ChronoDuration::days(2), 0.0, 52_000.0),
                bar(today - ChronoDuration::days(3), 0.0, 53_000.0),
            ],
        );

        let sample = poller(broker)
            .fetch_sample(&config("035720", TradeType::LowBounce))
            .await
            .unwrap();

        assert_eq!(sample.prior_closes, vec![51_000.0, 52_000.0]);
    }
}
