//! Engine configuration data model.
//!
//! Sections are nullable nested records: an absent section means "inherit
//! from a lower-precedence layer", and defaults are materialized only at
//! resolution time. All types are fully owned, so `clone` is a deep copy.

use crate::error::{Error, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Root of the hierarchical configuration record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfigSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub global: Option<GlobalConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crawling: Option<CrawlingConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing: Option<ProcessingConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<OutputConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policies: Option<PoliciesConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<usize>,
    #[serde(with = "duration_opt", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging_level: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlingConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub site_rules: Option<IndexMap<String, SiteRules>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link_rules: Option<LinkRules>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_rules: Option<ContentRules>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_rules: Option<RateRules>,
}

impl CrawlingConfig {
    /// Compiles the site-rule patterns once for repeated host lookups.
    pub fn compiled_site_rules(&self) -> Result<SiteRuleSet> {
        SiteRuleSet::compile(self.site_rules.as_ref())
    }
}

/// Site rules with their patterns compiled ahead of matching.
#[derive(Debug, Clone, Default)]
pub struct SiteRuleSet {
    rules: Vec<(SitePattern, SiteRules)>,
}

impl SiteRuleSet {
    pub fn compile(rules: Option<&IndexMap<String, SiteRules>>) -> Result<Self> {
        let rules = match rules {
            Some(rules) => rules,
            None => return Ok(Self::default()),
        };

        let compiled = rules
            .iter()
            .map(|(pattern, site_rules)| {
                SitePattern::compile(pattern).map(|pattern| (pattern, site_rules.clone()))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { rules: compiled })
    }

    /// First entry whose pattern matches `host`, in authoring order.
    pub fn lookup(&self, host: &str) -> Option<&SiteRules> {
        self.rules
            .iter()
            .find(|(pattern, _)| pattern.matches(host))
            .map(|(_, site_rules)| site_rules)
    }
}

/// Per-site overrides, keyed by a [`SitePattern`] in the parent map.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SiteRules {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_depth: Option<u32>,
    #[serde(with = "duration_opt", skip_serializing_if = "Option::is_none")]
    pub request_delay: Option<Duration>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkRules {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub follow_external_links: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_depth: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContentRules {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extraction_rules: Option<Vec<ExtractionRule>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractionRule {
    pub name: String,
    pub selector: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateRules {
    #[serde(with = "duration_opt", skip_serializing_if = "Option::is_none")]
    pub default_delay: Option<Duration>,
    #[serde(with = "delay_map_opt", skip_serializing_if = "Option::is_none")]
    pub site_delays: Option<IndexMap<String, Duration>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality_threshold: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compression: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoliciesConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub business_rules: Option<Vec<PolicyRuleSpec>>,
}

/// A business rule, opaque to the engine beyond its unique id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyRuleSpec {
    pub id: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl EngineConfigSpec {
    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw)
            .map_err(|error| Error::InvalidInput(format!("malformed config JSON: {error}")))
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|error| Error::InvalidInput(format!("unserializable config: {error}")))
    }

    /// Fully-populated defaults; the bottom of every layer stack.
    pub fn baseline() -> Self {
        Self {
            global: Some(GlobalConfig {
                max_concurrency: Some(8),
                timeout: Some(Duration::from_secs(30)),
                logging_level: Some("info".into()),
            }),
            crawling: Some(CrawlingConfig {
                site_rules: Some(IndexMap::new()),
                link_rules: Some(LinkRules {
                    follow_external_links: Some(false),
                    max_depth: Some(5),
                }),
                content_rules: Some(ContentRules {
                    extraction_rules: Some(Vec::new()),
                }),
                rate_rules: Some(RateRules {
                    default_delay: Some(Duration::from_millis(250)),
                    site_delays: Some(IndexMap::new()),
                }),
            }),
            processing: Some(ProcessingConfig {
                quality_threshold: Some(0.5),
            }),
            output: Some(OutputConfig {
                default_format: Some("json".into()),
                compression: Some(false),
            }),
            policies: Some(PoliciesConfig {
                business_rules: Some(Vec::new()),
            }),
        }
    }

    /// Structural checks a spec must pass before entering the resolver or
    /// the version store.
    pub fn validate(&self) -> Result<()> {
        if let Some(global) = &self.global {
            if global.max_concurrency == Some(0) {
                return Err(Error::InvalidInput(
                    "global.max_concurrency must be positive".into(),
                ));
            }
            if global.timeout == Some(Duration::ZERO) {
                return Err(Error::InvalidInput("global.timeout must be positive".into()));
            }
        }

        if let Some(crawling) = &self.crawling {
            if let Some(site_rules) = &crawling.site_rules {
                for pattern in site_rules.keys() {
                    SitePattern::compile(pattern)?;
                }
            }
        }

        if let Some(processing) = &self.processing {
            if let Some(threshold) = processing.quality_threshold {
                if !(0.0..=1.0).contains(&threshold) {
                    return Err(Error::InvalidInput(format!(
                        "processing.quality_threshold must be within [0, 1]: {threshold}"
                    )));
                }
            }
        }

        if let Some(policies) = &self.policies {
            if let Some(rules) = &policies.business_rules {
                let mut ids = std::collections::HashSet::new();
                for rule in rules {
                    if !ids.insert(rule.id.as_str()) {
                        return Err(Error::InvalidInput(format!(
                            "duplicate business rule id: {}",
                            rule.id
                        )));
                    }
                }
            }
        }

        Ok(())
    }
}

/// Glob-lite host pattern, compiled once per rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SitePattern {
    /// `*`
    Any,
    /// A literal host.
    Exact(String),
    /// `*.suffix`; matches hosts strictly below the suffix.
    Suffix(String),
}

impl SitePattern {
    pub fn compile(pattern: &str) -> Result<Self> {
        let pattern = pattern.trim().to_ascii_lowercase();

        if pattern.is_empty() {
            return Err(Error::InvalidInput("empty site pattern".into()));
        }

        if pattern == "*" {
            return Ok(SitePattern::Any);
        }

        if let Some(suffix) = pattern.strip_prefix("*.") {
            if suffix.is_empty() || suffix.contains('*') {
                return Err(Error::InvalidInput(format!("bad site pattern: {pattern}")));
            }

            return Ok(SitePattern::Suffix(suffix.to_string()));
        }

        if pattern.contains('*') {
            return Err(Error::InvalidInput(format!("bad site pattern: {pattern}")));
        }

        Ok(SitePattern::Exact(pattern))
    }

    pub fn matches(&self, host: &str) -> bool {
        let host = host.to_ascii_lowercase();

        match self {
            SitePattern::Any => true,
            SitePattern::Exact(exact) => host == *exact,
            SitePattern::Suffix(suffix) => host.ends_with(&format!(".{suffix}")),
        }
    }
}

/// Duration strings: a bare number is seconds; `ms`, `s`, `m`, `h` suffixes
/// scale accordingly.
pub fn parse_duration(raw: &str) -> Result<Duration> {
    let raw = raw.trim();

    let (digits, unit) = match raw.find(|c: char| !c.is_ascii_digit()) {
        Some(split) => raw.split_at(split),
        None => (raw, "s"),
    };

    let value: u64 = digits
        .parse()
        .map_err(|_| Error::InvalidInput(format!("bad duration: {raw:?}")))?;

    match unit.trim() {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 3600)),
        _ => Err(Error::InvalidInput(format!("bad duration: {raw:?}"))),
    }
}

/// Renders in the largest exact unit, mirroring [`parse_duration`].
pub fn format_duration(duration: Duration) -> String {
    let millis = duration.as_millis();

    if millis == 0 {
        return "0s".to_string();
    }

    if millis % 1000 != 0 {
        return format!("{millis}ms");
    }

    let secs = duration.as_secs();
    if secs % 3600 == 0 {
        format!("{}h", secs / 3600)
    } else if secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{secs}s")
    }
}

mod duration_opt {
    use super::{format_duration, parse_duration};
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => serializer.serialize_str(&format_duration(*duration)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        let raw: Option<String> = Option::deserialize(deserializer)?;

        raw.map(|raw| parse_duration(&raw).map_err(serde::de::Error::custom))
            .transpose()
    }
}

mod delay_map_opt {
    use super::{format_duration, parse_duration};
    use indexmap::IndexMap;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<IndexMap<String, Duration>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(delays) => {
                let rendered: IndexMap<&str, String> = delays
                    .iter()
                    .map(|(host, delay)| (host.as_str(), format_duration(*delay)))
                    .collect();

                rendered.serialize(serializer)
            }
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<IndexMap<String, Duration>>, D::Error> {
        let raw: Option<IndexMap<String, String>> = Option::deserialize(deserializer)?;

        raw.map(|raw| {
            raw.into_iter()
                .map(|(host, delay)| {
                    parse_duration(&delay)
                        .map(|delay| (host, delay))
                        .map_err(serde::de::Error::custom)
                })
                .collect()
        })
        .transpose()
    }
}
