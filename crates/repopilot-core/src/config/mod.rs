mod env;
mod types;


pub use types::*;

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, bail};
use repopilot_index::IndexerConfig;

impl Config {
    /// Load configuration from a TOML file with env var overrides.
    ///
    /// Falls back to defaults when the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed, or if
    /// the resulting configuration fails [`Config::validate`].
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path).context("failed to read config file")?;
            toml::from_str::<Self>(&content).context("failed to parse config file")?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    ///
    /// Returns an error describing the first invalid setting.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.query.search_k == 0 {
            bail!("query.search_k must be at least 1");
        }
        if self.query.top_n == 0 {
            bail!("query.top_n must be at least 1");
        }
        if self.query.max_sub_queries == 0 {
            bail!("query.max_sub_queries must be at least 1");
        }
        let chunk = &self.index.chunk;
        if chunk.window_lines == 0 {
            bail!("index.chunk.window_lines must be at least 1");
        }
        if chunk.window_overlap >= chunk.window_lines {
            bail!(
                "index.chunk.window_overlap ({}) must be smaller than window_lines ({})",
                chunk.window_overlap,
                chunk.window_lines
            );
        }
        if self.index.embed_max_attempts == 0 {
            bail!("index.embed_max_attempts must be at least 1");
        }
        let t = &self.timeouts;
        for (name, secs) in [
            ("embedding_secs", t.embedding_secs),
            ("search_secs", t.search_secs),
            ("planner_secs", t.planner_secs),
            ("generation_secs", t.generation_secs),
            ("verifier_secs", t.verifier_secs),
        ] {
            if secs == 0 {
                bail!("timeouts.{name} must be greater than zero");
            }
        }
        Ok(())
    }

    /// Indexer settings with the embedding timeout filled in.
    #[must_use]
    pub fn indexer_config(&self) -> IndexerConfig {
        let mut index = self.index.clone();
        index.embed_timeout_secs = self.timeouts.embedding_secs;
        index
    }
}

impl TimeoutConfig {
    #[must_use]
    pub fn embedding(&self) -> Duration {
        Duration::from_secs(self.embedding_secs)
    }

    #[must_use]
    pub fn search(&self) -> Duration {
        Duration::from_secs(self.search_secs)
    }

    #[must_use]
    pub fn planner(&self) -> Duration {
        Duration::from_secs(self.planner_secs)
    }

    #[must_use]
    pub fn generation(&self) -> Duration {
        Duration::from_secs(self.generation_secs)
    }

    #[must_use]
    pub fn verifier(&self) -> Duration {
        Duration::from_secs(self.verifier_secs)
    }
}
