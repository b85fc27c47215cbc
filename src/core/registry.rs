//! Static model registry: provider, tier, capabilities, context window, and
//! pricing for every model the router can dispatch to.
//!
//! Pure data, no I/O. The registry is loaded once from the embedded
//! `models.json` and is read-only for the life of the process. Pricing lives
//! in the data file on purpose: unpublished rates (gpt-5.3-codex) ship as
//! zero and are corrected by editing the registry, not the code.

use serde::{Deserialize, Serialize};

const MODELS_JSON: &str = include_str!("models.json");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Anthropic,
    Openai,
}

impl Provider {
    pub fn as_str(self) -> &'static str {
        match self {
            Provider::Anthropic => "anthropic",
            Provider::Openai => "openai",
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordinal quality ranking, independent of capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Cheap,
    Balanced,
    Best,
}

impl Tier {
    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Cheap => "cheap",
            Tier::Balanced => "balanced",
            Tier::Best => "best",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Pricing {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub name: String,
    pub provider: Provider,
    pub tier: Tier,
    pub capabilities: Vec<String>,
    /// Relative cost rank; lower is cheaper.
    pub cost_tier: u8,
    pub default_timeout_ms: u64,
    pub max_context_tokens: u64,
    pub pricing: Pricing,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRegistry {
    pub models: Vec<ModelDescriptor>,
}

impl ModelRegistry {
    pub fn load() -> Self {
        serde_json::from_str(MODELS_JSON).expect("models.json is invalid")
    }

    pub fn info(&self, name: &str) -> Option<&ModelDescriptor> {
        self.models.iter().find(|m| m.name == name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.models.iter().map(|m| m.name.clone()).collect();
        names.sort();
        names
    }

    pub fn by_tier(&self, tier: Tier) -> Vec<String> {
        let mut names: Vec<String> = self
            .models
            .iter()
            .filter(|m| m.tier == tier)
            .map(|m| m.name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn by_capability(&self, capability: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .models
            .iter()
            .filter(|m| m.capabilities.iter().any(|c| c == capability))
            .map(|m| m.name.clone())
            .collect();
        names.sort();
        names
    }

    /// Models whose context window holds at least `min_tokens`.
    pub fn by_context_fit(&self, min_tokens: u64, candidates: Option<&[String]>) -> Vec<String> {
        let mut names: Vec<String> = self
            .pool(candidates)
            .into_iter()
            .filter(|m| m.max_context_tokens >= min_tokens)
            .map(|m| m.name.clone())
            .collect();
        names.sort();
        names
    }

    /// Lowest cost tier; ties broken by alphabetical name.
    pub fn cheapest(&self, candidates: Option<&[String]>) -> Option<String> {
        self.pool(candidates)
            .into_iter()
            .min_by(|a, b| (a.cost_tier, &a.name).cmp(&(b.cost_tier, &b.name)))
            .map(|m| m.name.clone())
    }

    /// Lowest default timeout; ties broken by alphabetical name.
    pub fn fastest(&self, candidates: Option<&[String]>) -> Option<String> {
        self.pool(candidates)
            .into_iter()
            .min_by(|a, b| (a.default_timeout_ms, &a.name).cmp(&(b.default_timeout_ms, &b.name)))
            .map(|m| m.name.clone())
    }

    /// Highest tier; ties broken by alphabetical name.
    pub fn best(&self, candidates: Option<&[String]>) -> Option<String> {
        self.pool(candidates)
            .into_iter()
            .min_by(|a, b| {
                (std::cmp::Reverse(a.tier), &a.name).cmp(&(std::cmp::Reverse(b.tier), &b.name))
            })
            .map(|m| m.name.clone())
    }

    fn pool(&self, candidates: Option<&[String]>) -> Vec<&ModelDescriptor> {
        match candidates {
            Some(names) => names.iter().filter_map(|n| self.info(n)).collect(),
            None => self.models.iter().collect(),
        }
    }
}
