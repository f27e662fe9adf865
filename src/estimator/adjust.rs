use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

use crate::likert::{Distribution, rescale_topline};
use crate::model::Concept;

/// Post-processing hook applied to an aggregated distribution. `None` leaves it untouched.
pub trait DistributionAdjuster: Send + Sync {
    fn adjust(&self, concept: &Concept, distribution: &Distribution) -> Option<Distribution>;
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToplineRule {
    #[serde(default)]
    pub segment: Option<String>,
    pub keywords: Vec<String>,
    pub target_topline: f64,
}

impl ToplineRule {
    fn matches(&self, concept: &Concept) -> bool {
        if let Some(segment) = &self.segment {
            let same_segment = concept
                .segment
                .as_deref()
                .is_some_and(|value| value.eq_ignore_ascii_case(segment.trim()));
            if !same_segment {
                return false;
            }
        }
        let text = concept.construct.to_lowercase();
        self.keywords
            .iter()
            .all(|keyword| text.contains(&keyword.to_lowercase()))
    }
}

/// Keyword-triggered topline targets; the first matching rule wins.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToplineRules {
    rules: Vec<ToplineRule>,
}

impl ToplineRules {
    pub fn new(rules: Vec<ToplineRule>) -> Result<Self> {
        for (index, rule) in rules.iter().enumerate() {
            if rule.keywords.iter().all(|keyword| keyword.trim().is_empty()) {
                bail!("adjustment rule {index} has no keywords");
            }
            if !(0.0..=100.0).contains(&rule.target_topline) {
                bail!(
                    "adjustment rule {index} has target_topline {} outside 0..=100",
                    rule.target_topline
                );
            }
        }
        Ok(Self { rules })
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let raw = fs::read(path)
            .with_context(|| format!("failed to read adjustments: {}", path.display()))?;
        let rules: Vec<ToplineRule> = serde_json::from_slice(&raw)
            .with_context(|| format!("failed to parse adjustments: {}", path.display()))?;
        Self::new(rules).with_context(|| format!("invalid adjustments: {}", path.display()))
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }
}

impl DistributionAdjuster for ToplineRules {
    fn adjust(&self, concept: &Concept, distribution: &Distribution) -> Option<Distribution> {
        let rule = self.rules.iter().find(|rule| rule.matches(concept))?;
        Some(rescale_topline(distribution, rule.target_topline))
    }
}
