// =============================================================================
// Day-Start Equity Store — persisted seed for the daily-loss cap
// =============================================================================
//
// Keyed `YYYY-MM-DD → { symbol → equity }`. Only the risk governor's daily
// loss cap reads it; losing the file is safe (the store reseeds from current
// equity on the next read-miss). Persistence uses the atomic tmp + rename
// pattern to survive a crash mid-write.
// =============================================================================

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::RwLock;
use tracing::{info, warn};

type DayMap = HashMap<String, HashMap<String, f64>>;

pub struct EquityStore {
    path: PathBuf,
    days: RwLock<DayMap>,
}

impl EquityStore {
    /// Open (or lazily create) the store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let days = match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<DayMap>(&content) {
                Ok(days) => days,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "equity store unreadable — starting empty");
                    DayMap::new()
                }
            },
            Err(_) => DayMap::new(),
        };

        Self {
            path,
            days: RwLock::new(days),
        }
    }

    /// Today's UTC key.
    pub fn today() -> String {
        Utc::now().format("%Y-%m-%d").to_string()
    }

    /// The day-start equity for `(date, symbol)`. On a read-miss the store
    /// seeds from `current_equity` and persists.
    pub fn day_start(&self, date: &str, symbol: &str, current_equity: f64) -> f64 {
        {
            let days = self.days.read();
            if let Some(eq) = days.get(date).and_then(|m| m.get(symbol)) {
                return *eq;
            }
        }

        {
            let mut days = self.days.write();
            days.entry(date.to_string())
                .or_default()
                .insert(symbol.to_string(), current_equity);
        }

        if let Err(e) = self.save() {
            warn!(error = %e, "failed to persist equity store");
        } else {
            info!(date, symbol, equity = current_equity, "day-start equity seeded");
        }

        current_equity
    }

    /// Atomic persist: write a tmp sibling, then rename over the target.
    pub fn save(&self) -> Result<()> {
        let content = {
            let days = self.days.read();
            serde_json::to_string_pretty(&*days).context("failed to serialise equity store")?
        };

        let tmp_path = self.path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp equity store to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("failed to rename equity store to {}", self.path.display()))?;

        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn tmp_store(name: &str) -> EquityStore {
        let path = std::env::temp_dir().join(format!("meridian-equity-{name}-{}.json", std::process::id()));
        let _ = std::fs::remove_file(&path);
        EquityStore::open(path)
    }

    #[test]
    fn read_miss_seeds_from_current_equity() {
        let store = tmp_store("seed");
        let eq = store.day_start("2026-08-01", "ETHUSDT", 1_234.0);
        assert_eq!(eq, 1_234.0);

        // Later reads return the seeded value, not the new current equity.
        let eq = store.day_start("2026-08-01", "ETHUSDT", 900.0);
        assert_eq!(eq, 1_234.0);
    }

    #[test]
    fn days_and_symbols_are_independent() {
        let store = tmp_store("independent");
        store.day_start("2026-08-01", "ETHUSDT", 1_000.0);
        assert_eq!(store.day_start("2026-08-01", "BTCUSDT", 2_000.0), 2_000.0);
        assert_eq!(store.day_start("2026-08-02", "ETHUSDT", 1_500.0), 1_500.0);
    }

    #[test]
    fn persists_and_reloads() {
        let path = std::env::temp_dir().join(format!("meridian-equity-reload-{}.json", std::process::id()));
        let _ = std::fs::remove_file(&path);

        {
            let store = EquityStore::open(&path);
            store.day_start("2026-08-01", "ETHUSDT", 1_111.0);
        }

        let store = EquityStore::open(&path);
        assert_eq!(store.day_start("2026-08-01", "ETHUSDT", 0.0), 1_111.0);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn corrupt_file_starts_empty() {
        let path = std::env::temp_dir().join(format!("meridian-equity-corrupt-{}.json", std::process::id()));
        std::fs::write(&path, "not json at all").unwrap();
        let store = EquityStore::open(&path);
        assert_eq!(store.day_start("2026-08-01", "ETHUSDT", 500.0), 500.0);
        let _ = std::fs::remove_file(&path);
    }
}
