//! Layered engine configuration: data model, precedence resolver, and the
//! versioned apply/rollback store.

mod apply;
mod resolve;
mod spec;

pub use apply::{
    ApplyOptions, ApplyOutcome, ConfigStore, ConfigVersion, RuleCountSimulator, SimImpact,
    Simulator,
};
pub use resolve::{resolve, ConfigLayer};
pub use spec::{
    format_duration, parse_duration, ContentRules, CrawlingConfig, EngineConfigSpec,
    ExtractionRule, GlobalConfig, LinkRules, OutputConfig, PoliciesConfig, PolicyRuleSpec,
    ProcessingConfig, RateRules, SitePattern, SiteRuleSet, SiteRules,
};
