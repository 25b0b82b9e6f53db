// Trading-day lifecycle
pub mod driver;
pub mod schedule;

pub use driver::{CycleSummary, SessionSettings, TradingSession};
pub use schedule::{now_kst, Phase, SessionSchedule, KST};
