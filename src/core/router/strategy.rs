//! Strategy-driven model resolution.
//!
//! A strategy is an intent (`cheapest`, `fastest`, `best`, `balanced`,
//! `specific`). Resolution combines the static registry with live statistics
//! from the call log, filtered to models with enough recent samples and an
//! acceptable success rate. Resolution never fails: every strategy has a
//! hard fallback, so a model name is always returned.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::core::Core;
use crate::core::error::Result;
use crate::core::now_iso_at;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    Cheapest,
    Fastest,
    Best,
    Balanced,
    Specific,
}

impl Strategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Strategy::Cheapest => "cheapest",
            Strategy::Fastest => "fastest",
            Strategy::Best => "best",
            Strategy::Balanced => "balanced",
            Strategy::Specific => "specific",
        }
    }

    pub fn from_name(value: &str) -> Option<Self> {
        match value {
            "cheapest" => Some(Strategy::Cheapest),
            "fastest" => Some(Strategy::Fastest),
            "best" => Some(Strategy::Best),
            "balanced" => Some(Strategy::Balanced),
            "specific" => Some(Strategy::Specific),
            _ => None,
        }
    }
}

/// Router tunables. Snapshot returned by [`Core::configure_router`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    pub min_success_rate: f64,
    pub balanced_min_success_rate: f64,
    pub min_sample_size: u32,
    pub stats_hours_back: i64,
    pub cheap_fallback: String,
    pub best_fallback: String,
    pub balanced_fallback: String,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            min_success_rate: 0.8,
            balanced_min_success_rate: 0.9,
            min_sample_size: 3,
            stats_hours_back: 24,
            cheap_fallback: "claude-haiku-4-5".to_string(),
            best_fallback: "claude-opus-4-5".to_string(),
            balanced_fallback: "claude-sonnet-4-5".to_string(),
        }
    }
}

/// Partial overrides applied by [`Core::configure_router`].
#[derive(Debug, Clone, Default)]
pub struct RouterOverrides {
    pub min_success_rate: Option<f64>,
    pub balanced_min_success_rate: Option<f64>,
    pub min_sample_size: Option<u32>,
    pub stats_hours_back: Option<i64>,
    pub cheap_fallback: Option<String>,
    pub best_fallback: Option<String>,
    pub balanced_fallback: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ResolveOptions {
    pub capability: Option<String>,
    pub model: Option<String>,
}

/// Aggregated recent history for one model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelStats {
    pub model: String,
    pub call_count: u32,
    pub avg_latency_ms: f64,
    pub success_rate: f64,
    pub avg_cost: f64,
}

const EPSILON: f64 = 1e-6;

impl Core {
    /// Apply overrides to the router configuration and return the resulting
    /// snapshot.
    pub fn configure_router(&self, overrides: RouterOverrides) -> RouterConfig {
        let mut cfg = self.inner.router.write().expect("router config poisoned");
        if let Some(v) = overrides.min_success_rate {
            cfg.min_success_rate = v;
        }
        if let Some(v) = overrides.balanced_min_success_rate {
            cfg.balanced_min_success_rate = v;
        }
        if let Some(v) = overrides.min_sample_size {
            cfg.min_sample_size = v;
        }
        if let Some(v) = overrides.stats_hours_back {
            cfg.stats_hours_back = v;
        }
        if let Some(v) = overrides.cheap_fallback {
            cfg.cheap_fallback = v;
        }
        if let Some(v) = overrides.best_fallback {
            cfg.best_fallback = v;
        }
        if let Some(v) = overrides.balanced_fallback {
            cfg.balanced_fallback = v;
        }
        cfg.clone()
    }

    /// Current router configuration snapshot.
    pub fn router_defaults(&self) -> RouterConfig {
        self.inner.router.read().expect("router config poisoned").clone()
    }

    /// Per-model aggregates over the last `hours_back` hours, restricted to
    /// models with at least `min_samples` calls.
    pub async fn get_model_stats(
        &self,
        hours_back: i64,
        min_samples: u32,
    ) -> Result<Vec<ModelStats>> {
        let cutoff = now_iso_at(chrono::Utc::now() - chrono::Duration::hours(hours_back));
        let conn = self.inner.calllog.db();
        let conn = conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT model,
                    COUNT(*) AS call_count,
                    AVG(duration_ms) AS avg_latency_ms,
                    AVG(CASE WHEN ok = 1 THEN 1.0 ELSE 0.0 END) AS success_rate,
                    AVG(cost_estimate) AS avg_cost
             FROM llm_calls
             WHERE timestamp >= ?1
             GROUP BY model
             HAVING COUNT(*) >= ?2
             ORDER BY model",
        )?;
        let rows = stmt.query_map(rusqlite::params![cutoff, min_samples], |row| {
            Ok(ModelStats {
                model: row.get(0)?,
                call_count: row.get::<_, i64>(1)? as u32,
                avg_latency_ms: row.get(2)?,
                success_rate: row.get(3)?,
                avg_cost: row.get(4)?,
            })
        })?;
        let mut stats = Vec::new();
        for row in rows {
            stats.push(row?);
        }
        Ok(stats)
    }

    /// Pick a concrete model for a strategy. Total: hard fallbacks guarantee
    /// an answer even with an empty call log or an unknown capability.
    pub async fn resolve_model(&self, strategy: Strategy, opts: &ResolveOptions) -> String {
        if strategy == Strategy::Specific {
            if let Some(model) = &opts.model {
                return super::normalize_model(model);
            }
            // Specific without a model degrades to the balanced fallback.
            return self.router_defaults().balanced_fallback;
        }

        let registry = &self.inner.registry;
        let pool: Vec<String> = match &opts.capability {
            Some(cap) => registry.by_capability(cap),
            None => registry.names(),
        };
        let cfg = self.router_defaults();

        // `best` is static by design: recent latency or cost history never
        // changes which model is considered strongest.
        if strategy == Strategy::Best {
            return registry
                .best(Some(&pool))
                .unwrap_or(cfg.best_fallback);
        }

        let stats = match self.get_model_stats(cfg.stats_hours_back, cfg.min_sample_size).await {
            Ok(stats) => stats,
            Err(e) => {
                warn!("stats query failed, falling back to registry selection: {}", e);
                Vec::new()
            }
        };
        let threshold = if strategy == Strategy::Balanced {
            cfg.balanced_min_success_rate
        } else {
            cfg.min_success_rate
        };
        let reliable: Vec<&ModelStats> = stats
            .iter()
            .filter(|s| pool.contains(&s.model))
            .filter(|s| s.success_rate >= threshold)
            .collect();

        match strategy {
            Strategy::Cheapest => reliable
                .iter()
                .min_by(|a, b| {
                    (a.avg_cost, &a.model)
                        .partial_cmp(&(b.avg_cost, &b.model))
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .map(|s| s.model.clone())
                .or_else(|| registry.cheapest(Some(&pool)))
                .unwrap_or(cfg.cheap_fallback),
            Strategy::Fastest => reliable
                .iter()
                .min_by(|a, b| {
                    (a.avg_latency_ms, &a.model)
                        .partial_cmp(&(b.avg_latency_ms, &b.model))
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .map(|s| s.model.clone())
                .or_else(|| registry.fastest(Some(&pool)))
                .unwrap_or(cfg.cheap_fallback),
            Strategy::Balanced => reliable
                .iter()
                .max_by(|a, b| {
                    balanced_score(a)
                        .partial_cmp(&balanced_score(b))
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then_with(|| b.model.cmp(&a.model))
                })
                .map(|s| s.model.clone())
                .unwrap_or_else(|| {
                    if pool.contains(&cfg.balanced_fallback) {
                        cfg.balanced_fallback.clone()
                    } else {
                        pool.iter()
                            .find(|name| name.contains("sonnet"))
                            .cloned()
                            .unwrap_or(cfg.balanced_fallback)
                    }
                }),
            Strategy::Best | Strategy::Specific => unreachable!("handled above"),
        }
    }
}

/// Higher is better: inverse of cost x latency, both clamped away from zero.
fn balanced_score(stats: &ModelStats) -> f64 {
    1.0 / (stats.avg_cost.max(EPSILON) * stats.avg_latency_ms.max(EPSILON))
}
