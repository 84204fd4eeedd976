//! Approved tips, links and resources loaded once per run.

use std::fs;
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const EMBEDDED_LIBRARY: &str = include_str!("../reference/library.toml");

#[derive(Debug, Error)]
pub enum ReferenceError {
    #[error("failed to read reference library {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse reference library: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid reference library: {0}")]
    Invalid(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovedLink {
    pub label: String,
    pub url: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedResource {
    pub keyword: String,
    pub label: String,
}

#[derive(Debug, Deserialize)]
struct LibraryFile {
    #[serde(default)]
    allowed_link_prefixes: Vec<String>,
    #[serde(default)]
    referrer_markers: Vec<String>,
    #[serde(default)]
    resources: Vec<NamedResource>,
    #[serde(default)]
    rules: Vec<RuleFile>,
}

#[derive(Debug, Deserialize)]
struct RuleFile {
    topic: String,
    triggers: Vec<String>,
    tip: String,
    #[serde(default)]
    links: Vec<ApprovedLink>,
    #[serde(default)]
    skip_for_referrers: bool,
}

/// One row of the ordered rules table.
#[derive(Clone, Debug)]
pub struct TipRule {
    pub topic: String,
    pub triggers: Vec<String>,
    pub tip: String,
    pub links: Vec<ApprovedLink>,
    pub skip_for_referrers: bool,
    patterns: Vec<Regex>,
}

impl TipRule {
    /// First trigger found in `text`, matched case-insensitively on word boundaries.
    pub fn trigger_in(&self, text: &str) -> Option<&str> {
        self.patterns
            .iter()
            .zip(&self.triggers)
            .find(|(pattern, _)| pattern.is_match(text))
            .map(|(_, trigger)| trigger.as_str())
    }
}

#[derive(Clone, Debug)]
pub struct ReferenceLibrary {
    allowed_link_prefixes: Vec<String>,
    referrer_markers: Vec<String>,
    resources: Vec<NamedResource>,
    rules: Vec<TipRule>,
}

impl ReferenceLibrary {
    pub fn embedded() -> Result<Self, ReferenceError> {
        Self::from_toml_str(EMBEDDED_LIBRARY)
    }

    /// File override when `path` is set, embedded defaults otherwise.
    pub fn load(path: Option<&Path>) -> Result<Self, ReferenceError> {
        match path {
            Some(path) => {
                let raw = fs::read_to_string(path).map_err(|source| ReferenceError::ReadFile {
                    path: path.to_path_buf(),
                    source,
                })?;
                Self::from_toml_str(&raw)
            }
            None => Self::embedded(),
        }
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ReferenceError> {
        let file: LibraryFile = toml::from_str(raw)?;
        if file.allowed_link_prefixes.is_empty() {
            return Err(ReferenceError::Invalid("allowed_link_prefixes must not be empty".to_string()));
        }

        let mut rules = Vec::with_capacity(file.rules.len());
        for rule in file.rules {
            if rule.triggers.is_empty() {
                return Err(ReferenceError::Invalid(format!("rule `{}` has no triggers", rule.topic)));
            }
            for link in &rule.links {
                if !is_allowed(&file.allowed_link_prefixes, &link.url) {
                    return Err(ReferenceError::Invalid(format!(
                        "rule `{}` links to `{}` which is not allowlisted",
                        rule.topic, link.url
                    )));
                }
            }
            let patterns = rule
                .triggers
                .iter()
                .map(|trigger| {
                    Regex::new(&format!(r"(?i)\b{}\b", regex::escape(trigger.trim()))).map_err(|error| {
                        ReferenceError::Invalid(format!("trigger `{trigger}` is not matchable: {error}"))
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;

            rules.push(TipRule {
                topic: rule.topic,
                triggers: rule.triggers,
                tip: rule.tip,
                links: rule.links,
                skip_for_referrers: rule.skip_for_referrers,
                patterns,
            });
        }

        Ok(Self {
            allowed_link_prefixes: file.allowed_link_prefixes,
            referrer_markers: file
                .referrer_markers
                .into_iter()
                .map(|marker| marker.to_lowercase())
                .collect(),
            resources: file.resources,
            rules,
        })
    }

    pub fn rules(&self) -> &[TipRule] {
        &self.rules
    }

    pub fn resources(&self) -> &[NamedResource] {
        &self.resources
    }

    pub fn is_allowed_link(&self, url: &str) -> bool {
        is_allowed(&self.allowed_link_prefixes, url)
    }

    /// True when the lead's acquisition source names a known referrer.
    pub fn is_referral(&self, source: Option<&str>) -> bool {
        let Some(source) = source else {
            return false;
        };
        let source = source.to_lowercase();
        self.referrer_markers.iter().any(|marker| source.contains(marker.as_str()))
    }

    /// First rule in table order with a trigger in `text`.
    pub fn select_tip(&self, text: &str, referral: bool) -> Option<(&TipRule, &str)> {
        self.rules
            .iter()
            .filter(|rule| !(referral && rule.skip_for_referrers))
            .find_map(|rule| rule.trigger_in(text).map(|trigger| (rule, trigger)))
    }
}

fn is_allowed(prefixes: &[String], url: &str) -> bool {
    prefixes.iter().any(|prefix| url.starts_with(prefix.as_str()))
}
