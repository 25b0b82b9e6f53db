use chrono::{DateTime, Datelike, NaiveDateTime, NaiveTime, Weekday};
use chrono_tz::Tz;
use serde::Deserialize;
use std::time::Duration;

use crate::models::Side;
use crate::strategy::TradingWindow;

/// Exchange time zone
pub const KST: Tz = chrono_tz::Asia::Seoul;

pub fn now_kst() -> DateTime<Tz> {
    chrono::Utc::now().with_timezone(&KST)
}

/// Where a wall-clock instant falls relative to the trading day
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Holiday,
    BeforeOpen,
    Open,
    Closed,
}

/// Daily session boundaries in exchange-local time.
///
/// Continuous-market strategies trade from `start` until `exit`.
/// Expected-close strategies only trade in the closing auction: sells after
/// `closing_sell`, buys after `closing_buy`, both until `closing_end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SessionSchedule {
    pub start: NaiveTime,
    /// After this time held positions are flattened and no entries are made
    pub time_cut: NaiveTime,
    pub exit: NaiveTime,
    pub closing_sell: NaiveTime,
    pub closing_buy: NaiveTime,
    pub closing_end: NaiveTime,
}

fn hms(h: u32, m: u32, s: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(h, m, s).unwrap_or(NaiveTime::MIN)
}

impl Default for SessionSchedule {
    fn default() -> Self {
        Self {
            start: hms(9, 0, 0),
            time_cut: hms(15, 20, 10),
            exit: hms(15, 20, 30),
            closing_sell: hms(15, 29, 45),
            closing_buy: hms(15, 29, 50),
            closing_end: hms(15, 32, 0),
        }
    }
}

impl SessionSchedule {
    pub fn phase(&self, now: NaiveDateTime) -> Phase {
        if matches!(now.weekday(), Weekday::Sat | Weekday::Sun) {
            return Phase::Holiday;
        }
        let t = now.time();
        if t < self.start {
            Phase::BeforeOpen
        } else if t >= self.closes_at() {
            Phase::Closed
        } else {
            Phase::Open
        }
    }

    /// Time left before the opening bell, zero once open
    pub fn until_open(&self, now: NaiveDateTime) -> Duration {
        (self.start - now.time()).to_std().unwrap_or(Duration::ZERO)
    }

    /// Whether a strategy trading in `window` may place a `side` order at `now`
    pub fn allows(&self, window: TradingWindow, side: Side, now: NaiveTime) -> bool {
        match window {
            TradingWindow::Continuous => self.start <= now && now < self.exit,
            TradingWindow::ClosingAuction => {
                let opens = match side {
                    Side::Sell => self.closing_sell,
                    Side::Buy => self.closing_buy,
                };
                opens < now && now < self.closing_end
            }
        }
    }

    /// End of the last trading window
    pub fn closes_at(&self) -> NaiveTime {
        self.exit.max(self.closing_end)
    }

    pub fn is_valid(&self) -> bool {
        self.start < self.time_cut
            && self.time_cut <= self.exit
            && self.start < self.closing_sell
            && self.closing_sell < self.closing_end
            && self.closing_buy < self.closing_end
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(day: u32, h: u32, m: u32, s: u32) -> NaiveDateTime {
        // March 2024: the 11th is a Monday, the 16th a Saturday
        NaiveDate::from_ymd_opt(2024, 3, day)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    #[test]
    fn test_default_schedule() {
        let s = SessionSchedule::default();
        assert_eq!(s.start, NaiveTime::from_hms_opt(9, 0, 0).unwrap());
        assert_eq!(s.time_cut, NaiveTime::from_hms_opt(15, 20, 10).unwrap());
        assert_eq!(s.exit, NaiveTime::from_hms_opt(15, 20, 30).unwrap());
        assert_eq!(s.closing_buy, NaiveTime::from_hms_opt(15, 29, 50).unwrap());
        assert_eq!(s.closes_at(), NaiveTime::from_hms_opt(15, 32, 0).unwrap());
        assert!(s.is_valid());
    }

    #[test]
    fn test_phases() {
        let s = SessionSchedule::default();
        assert_eq!(s.phase(at(11, 8, 59, 59)), Phase::BeforeOpen);
        assert_eq!(s.phase(at(11, 9, 0, 0)), Phase::Open);
        assert_eq!(s.phase(at(11, 15, 20, 29)), Phase::Open);
        // Still open for the closing auction
        assert_eq!(s.phase(at(11, 15, 30, 0)), Phase::Open);
        assert_eq!(s.phase(at(11, 15, 32, 0)), Phase::Closed);
        assert_eq!(s.phase(at(16, 10, 0, 0)), Phase::Holiday);
        assert_eq!(s.phase(at(17, 10, 0, 0)), Phase::Holiday);
    }

    #[test]
    fn test_trading_windows() {
        let s = SessionSchedule::default();
        let t = |h, m, sec| NaiveTime::from_hms_opt(h, m, sec).unwrap();
        let auction = TradingWindow::ClosingAuction;

        assert!(s.allows(TradingWindow::Continuous, Side::Buy, t(9, 0, 0)));
        assert!(!s.allows(TradingWindow::Continuous, Side::Sell, t(15, 20, 30)));
        assert!(!s.allows(auction, Side::Buy, t(10, 0, 0)));
        assert!(!s.allows(auction, Side::Sell, t(15, 29, 45)));
        assert!(s.allows(auction, Side::Sell, t(15, 29, 46)));
        assert!(!s.allows(auction, Side::Buy, t(15, 29, 50)));
        assert!(s.allows(auction, Side::Buy, t(15, 29, 51)));
        assert!(!s.allows(auction, Side::Buy, t(15, 32, 0)));
    }

    #[test]
    fn test_until_open() {
        let s = SessionSchedule::default();
        assert_eq!(s.until_open(at(11, 8, 58, 30)), Duration::from_secs(90));
        assert_eq!(s.until_open(at(11, 10, 0, 0)), Duration::ZERO);
    }

    #[test]
    fn test_deserialize_partial() {
        let s: SessionSchedule = serde_json::from_str(r#"{"exit": "15:30:00"}"#).unwrap();
        assert_eq!(s.start, SessionSchedule::default().start);
        assert_eq!(s.exit, NaiveTime::from_hms_opt(15, 30, 0).unwrap());
        assert_eq!(s.closing_end, SessionSchedule::default().closing_end);
    }

    #[test]
    fn test_closing_auction_must_close() {
        let s = SessionSchedule {
            closing_buy: NaiveTime::from_hms_opt(15, 33, 0).unwrap(),
            ..SessionSchedule::default()
        };
        assert!(!s.is_valid());
    }
}
