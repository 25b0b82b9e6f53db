pub mod broker;
pub mod kis;
pub mod notifier;
pub mod paper;

pub use broker::{Broker, BrokerError};
pub use kis::{KisClient, KisCredentials};
pub use notifier::{DiscordNotifier, LogNotifier, Notifier};
pub use paper::PaperBroker;
