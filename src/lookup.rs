use std::collections::HashMap;

use dashmap::DashMap;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::LookupConfig;
use crate::wire::lookup_id;

/// Failure modes of the tag configuration lookup.
///
/// `Unconfigured` is a normal outcome: the metric path has no tagging
/// profile and is emitted untagged. Every other variant aborts the
/// emission and is fatal to the owning worker.
#[derive(Debug, Error)]
pub enum LookupError {
    #[error("metric path has no tag configuration")]
    Unconfigured,

    #[error("lookup request failed")]
    Request(#[from] reqwest::Error),

    #[error("lookup returned status {0}")]
    Status(u16),
}

#[derive(Debug, Deserialize)]
struct ConfigurationResponse {
    tags: Vec<String>,
}

enum Backend {
    Http {
        http: reqwest::Client,
        endpoint: String,
    },
    /// In-memory table keyed by lookup id; offline runs and tests.
    Fixed(HashMap<String, Vec<String>>),
}

enum CacheEntry {
    Tags(Vec<String>),
    Unconfigured,
}

/// Client for the configuration service that maps `(asset, path)` to the
/// tag profile attached to derived metrics.
///
/// Results are cached for the process lifetime: tag profiles change only
/// with a redeploy of the configuration service, and a restart picks the
/// new profile up. Transport errors are never cached.
pub struct Lookup {
    backend: Backend,
    cache: DashMap<String, CacheEntry>,
}

impl Lookup {
    /// Creates an HTTP-backed lookup client.
    pub fn new(cfg: &LookupConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(cfg.timeout)
            .build()
            .map_err(|e| anyhow::anyhow!("building lookup HTTP client: {e}"))?;

        Ok(Self {
            backend: Backend::Http {
                http,
                endpoint: cfg.endpoint.trim_end_matches('/').to_string(),
            },
            cache: DashMap::new(),
        })
    }

    /// Creates a lookup backed by a fixed in-memory table.
    pub fn fixed(table: HashMap<String, Vec<String>>) -> Self {
        Self {
            backend: Backend::Fixed(table),
            cache: DashMap::new(),
        }
    }

    /// Returns the configured tags for `(asset_id, path)`.
    pub async fn tags_for(&self, asset_id: i64, path: &str) -> Result<Vec<String>, LookupError> {
        let key = lookup_id(asset_id, path);

        if let Some(hit) = self.cache.get(&key) {
            return match hit.value() {
                CacheEntry::Tags(tags) => Ok(tags.clone()),
                CacheEntry::Unconfigured => Err(LookupError::Unconfigured),
            };
        }

        let result = self.fetch(&key).await;
        match &result {
            Ok(tags) => {
                self.cache.insert(key, CacheEntry::Tags(tags.clone()));
            }
            Err(LookupError::Unconfigured) => {
                self.cache.insert(key, CacheEntry::Unconfigured);
            }
            Err(_) => {}
        }

        result
    }

    async fn fetch(&self, key: &str) -> Result<Vec<String>, LookupError> {
        match &self.backend {
            Backend::Fixed(table) => match table.get(key) {
                Some(tags) => Ok(tags.clone()),
                None => Err(LookupError::Unconfigured),
            },

            Backend::Http { http, endpoint } => {
                let url = format!("{endpoint}/api/v1/configuration/{key}");
                let response = http.get(&url).send().await?;

                match response.status().as_u16() {
                    200 => {
                        let body: ConfigurationResponse = response.json().await?;
                        debug!(key, tags = body.tags.len(), "tag configuration resolved");
                        Ok(body.tags)
                    }
                    404 => Err(LookupError::Unconfigured),
                    status => Err(LookupError::Status(status)),
                }
            }
        }
    }

    /// Forwards a bus liveness beacon to the configuration service.
    /// Best effort: failures are logged and never escalate.
    pub async fn heartbeat(&self, instance: &str, worker: usize, payload: &[u8]) {
        let Backend::Http { http, endpoint } = &self.backend else {
            return;
        };

        let url = format!("{endpoint}/api/v1/heartbeat/{instance}/{worker}");
        match http
            .post(&url)
            .header("Content-Type", "application/json")
            .body(payload.to_vec())
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => {}
            Ok(response) => {
                warn!(status = response.status().as_u16(), "heartbeat rejected");
            }
            Err(e) => {
                warn!(error = %e, "heartbeat forward failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed_lookup() -> Lookup {
        let mut table = HashMap::new();
        table.insert(
            "5:cpu.usage.percent".to_string(),
            vec!["profile-cpu".to_string()],
        );
        Lookup::fixed(table)
    }

    #[tokio::test]
    async fn test_fixed_lookup_hit() {
        let lookup = fixed_lookup();
        let tags = lookup.tags_for(5, "cpu.usage.percent").await.expect("tags");
        assert_eq!(tags, vec!["profile-cpu".to_string()]);
    }

    #[tokio::test]
    async fn test_fixed_lookup_unconfigured() {
        let lookup = fixed_lookup();
        let err = lookup.tags_for(5, "ctx.per.second").await.unwrap_err();
        assert!(matches!(err, LookupError::Unconfigured));
    }

    #[tokio::test]
    async fn test_unconfigured_result_is_cached() {
        let lookup = fixed_lookup();
        let _ = lookup.tags_for(9, "disk.free:/").await;
        assert!(lookup.cache.contains_key("9:disk.free:/"));

        let err = lookup.tags_for(9, "disk.free:/").await.unwrap_err();
        assert!(matches!(err, LookupError::Unconfigured));
    }

    #[tokio::test]
    async fn test_heartbeat_noop_on_fixed_backend() {
        let lookup = fixed_lookup();
        lookup.heartbeat("hurricane", 0, b"{\"heartbeat\":{}}").await;
    }
}
