//! Model target parsing and fallback chains.

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Backend family assumed for bare model names without a `family/` prefix.
pub const DEFAULT_FAMILY: &str = "anthropic";

/// A model on a specific backend family: `family/model`
///
/// Example: "openai/gpt-4o". A bare "claude-opus-4-5" belongs to
/// [`DEFAULT_FAMILY`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ModelTarget {
    family: String,
    model: String,
}

impl ModelTarget {
    /// Parse from `family/model` or a bare model name.
    pub fn parse(spec: &str) -> Result<Self> {
        let spec = spec.trim();
        if spec.is_empty() {
            bail!("Invalid model target: empty string");
        }
        match spec.split_once('/') {
            Some((family, model)) => {
                if family.is_empty() || model.is_empty() {
                    bail!("Invalid model target '{}': expected family/model", spec);
                }
                Ok(Self {
                    family: family.to_lowercase(),
                    model: model.to_string(),
                })
            }
            None => Ok(Self {
                family: DEFAULT_FAMILY.to_string(),
                model: spec.to_string(),
            }),
        }
    }

    /// Backend family used to pick credentials.
    pub fn family(&self) -> &str {
        &self.family
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

impl FromStr for ModelTarget {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ModelTarget {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<ModelTarget> for String {
    fn from(target: ModelTarget) -> Self {
        target.to_string()
    }
}

impl std::fmt::Display for ModelTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.family, self.model)
    }
}

/// Ordered candidate models: `[primary, fallback1, fallback2, ...]`.
///
/// Supplied per dispatch and never mutated while walked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackChain {
    targets: Vec<ModelTarget>,
}

impl FallbackChain {
    pub fn new(primary: ModelTarget, fallbacks: Vec<ModelTarget>) -> Self {
        let mut targets = Vec::with_capacity(fallbacks.len() + 1);
        targets.push(primary);
        targets.extend(fallbacks);
        Self { targets }
    }

    /// Build a chain from model spec strings, primary first.
    pub fn parse<S: AsRef<str>>(specs: &[S]) -> Result<Self> {
        if specs.is_empty() {
            bail!("Fallback chain needs at least a primary model");
        }
        let targets = specs
            .iter()
            .map(|s| ModelTarget::parse(s.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { targets })
    }

    pub fn primary(&self) -> &ModelTarget {
        &self.targets[0]
    }

    pub fn get(&self, index: usize) -> Option<&ModelTarget> {
        self.targets.get(index)
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ModelTarget> {
        self.targets.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_family_and_model() {
        let target = ModelTarget::parse("openai/gpt-4o").unwrap();
        assert_eq!(target.family(), "openai");
        assert_eq!(target.model(), "gpt-4o");
        assert_eq!(target.to_string(), "openai/gpt-4o");
    }

    #[test]
    fn test_parse_bare_model_uses_default_family() {
        let target = ModelTarget::parse("claude-opus-4-5").unwrap();
        assert_eq!(target.family(), DEFAULT_FAMILY);
        assert_eq!(target.model(), "claude-opus-4-5");
    }

    #[test]
    fn test_parse_keeps_nested_model_path() {
        let target = ModelTarget::parse("bedrock/anthropic.claude-3/sonnet").unwrap();
        assert_eq!(target.family(), "bedrock");
        assert_eq!(target.model(), "anthropic.claude-3/sonnet");
    }

    #[test]
    fn test_parse_rejects_empty_parts() {
        assert!(ModelTarget::parse("").is_err());
        assert!(ModelTarget::parse("/gpt-4o").is_err());
        assert!(ModelTarget::parse("openai/").is_err());
    }

    #[test]
    fn test_family_is_lowercased() {
        let target = ModelTarget::parse("OpenAI/gpt-4o").unwrap();
        assert_eq!(target.family(), "openai");
    }

    #[test]
    fn test_chain_order_primary_first() {
        let chain = FallbackChain::parse(&["anthropic/m1", "openai/m2", "m3"]).unwrap();
        assert_eq!(chain.len(), 3);
        assert_eq!(chain.primary().model(), "m1");
        assert_eq!(chain.get(1).unwrap().family(), "openai");
        assert_eq!(chain.get(2).unwrap().family(), DEFAULT_FAMILY);
        assert!(chain.get(3).is_none());
    }

    #[test]
    fn test_chain_rejects_empty() {
        let empty: [&str; 0] = [];
        assert!(FallbackChain::parse(&empty).is_err());
    }

    #[test]
    fn test_target_serde_as_string() {
        let target = ModelTarget::parse("gemini/gemini-pro").unwrap();
        let json = serde_json::to_string(&target).unwrap();
        assert_eq!(json, "\"gemini/gemini-pro\"");
        let back: ModelTarget = serde_json::from_str(&json).unwrap();
        assert_eq!(back, target);
    }
}
