use clap::Parser;
use equitybot::config::AppConfig;
use equitybot::session::{SessionSettings, TradingSession};
use equitybot::{Broker, DiscordNotifier, KisClient, KisCredentials, LogNotifier, Notifier, PaperBroker};
use std::path::PathBuf;
use std::sync::Arc;

const DEFAULT_LOG_FILTER: &str = "equitybot=info,equitybot::strategy=debug";

#[derive(Parser, Debug)]
#[command(name = "equitybot", about = "Rule-based equity trading bot for KIS accounts")]
struct Args {
    /// YAML config file, layered under EQUITYBOT__* environment variables
    #[arg(long)]
    config: Option<PathBuf>,

    /// Watch-list file (overrides `watchlist_path`)
    #[arg(long)]
    watchlist: Option<PathBuf>,

    /// Simulate orders in memory, reading market data from the brokerage
    #[arg(long)]
    paper: bool,

    /// tracing filter directive (overrides RUST_LOG)
    #[arg(long)]
    log_filter: Option<String>,
}

#[tokio::main]
async fn main() -> equitybot::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    setup_logging(args.log_filter.as_deref());

    tracing::info!("🚀 EquityBot starting");

    let mut config = AppConfig::load(args.config.as_deref())?;
    if let Some(path) = args.watchlist {
        config.watchlist_path = path;
    }
    config.require_credentials()?;

    tracing::info!("\n📊 Configuration:");
    tracing::info!("  Account: {}-{}", mask(&config.account_no), config.account_product_code);
    tracing::info!("  Mode: {}", if args.paper { "paper" } else { "live" });
    tracing::info!("  Watch-list: {}", config.watchlist_path.display());
    tracing::info!("  Concurrency: {}", config.max_concurrency);
    tracing::info!(
        "  Session: {} - {} (time cut {})",
        config.session.start,
        config.session.exit,
        config.session.time_cut
    );
    tracing::info!(
        "  Closing auction: sells after {}, buys after {}, until {}",
        config.session.closing_sell,
        config.session.closing_buy,
        config.session.closing_end
    );

    let kis = KisClient::new(
        config.url_base.clone(),
        KisCredentials {
            app_key: config.app_key.clone(),
            app_secret: config.app_secret.clone(),
            account_no: config.account_no.clone(),
            account_product_code: config.account_product_code.clone(),
        },
        config.http_timeout(),
        Some(config.token_cache_path.clone()),
    )?;

    let broker: Arc<dyn Broker> = if args.paper {
        Arc::new(
            PaperBroker::with_market(Arc::new(kis))
                .with_credit_buying_power(config.paper_credit_buying_power),
        )
    } else {
        Arc::new(kis)
    };

    let notifier: Arc<dyn Notifier> = match &config.discord_webhook_url {
        Some(url) if !url.is_empty() => Arc::new(DiscordNotifier::new(url.clone())?),
        _ => {
            tracing::info!("No webhook configured, notifications go to the log");
            Arc::new(LogNotifier)
        }
    };

    let session = TradingSession::new(
        broker,
        notifier,
        config.limiter(),
        SessionSettings::from(&config),
    );
    session.run().await?;

    tracing::info!("👋 EquityBot stopped");
    Ok(())
}

fn setup_logging(filter: Option<&str>) {
    let filter = match filter {
        Some(directive) => tracing_subscriber::EnvFilter::new(directive),
        None => tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Show only the last four digits of an account number
fn mask(account_no: &str) -> String {
    let visible = account_no.len().saturating_sub(4);
    account_no
        .char_indices()
        .map(|(i, c)| if i < visible { '*' } else { c })
        .collect()
}
