use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::models::SymbolConfig;

#[derive(Debug, Error)]
pub enum WatchlistError {
    #[error("failed to read watch-list {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Parse one `symbol/low/high/TYPE` record
fn parse_line(line: &str) -> Result<SymbolConfig, String> {
    let parts: Vec<&str> = line.split('/').map(str::trim).collect();
    if parts.len() < 4 {
        return Err(format!("expected symbol/low/high/TYPE, got {} fields", parts.len()));
    }

    let symbol = parts[0];
    if symbol.is_empty() {
        return Err("empty symbol".to_string());
    }
    let low: f64 = parts[1]
        .parse()
        .map_err(|_| format!("bad low threshold `{}`", parts[1]))?;
    let high: f64 = parts[2]
        .parse()
        .map_err(|_| format!("bad high threshold `{}`", parts[2]))?;
    let trade_type = parts[3].parse().map_err(|e| format!("{}", e))?;

    Ok(SymbolConfig {
        symbol: symbol.to_string(),
        low_threshold: low,
        high_threshold: high,
        trade_type,
    })
}

/// Parse a watch-list document.
///
/// Blank lines and `#` comments are ignored, malformed lines are logged and
/// skipped. A symbol listed twice keeps its last record.
pub fn parse_watchlist(text: &str) -> Vec<SymbolConfig> {
    let mut configs: Vec<SymbolConfig> = Vec::new();

    for (lineno, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match parse_line(line) {
            Ok(config) => {
                if let Some(existing) = configs.iter_mut().find(|c| c.symbol == config.symbol) {
                    *existing = config;
                } else {
                    configs.push(config);
                }
            }
            Err(e) => tracing::warn!(line = lineno + 1, "Skipping watch-list entry `{}`: {}", line, e),
        }
    }

    configs
}

pub async fn load_watchlist(path: &Path) -> Result<Vec<SymbolConfig>, WatchlistError> {
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| WatchlistError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(parse_watchlist(&text))
}
