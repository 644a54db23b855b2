//! Layered merge of configuration specs.
//!
//! Precedence runs `Global ≺ Environment ≺ Domain ≺ Site ≺ Ephemeral`.
//! Scalars in higher layers replace lower values, keyed maps merge
//! key-by-key with the higher layer winning conflicts, and sequences are
//! replaced wholesale. The resolved spec owns all of its data, so mutating
//! a source layer afterwards never alters the result.

use super::spec::{
    ContentRules, CrawlingConfig, EngineConfigSpec, GlobalConfig, LinkRules, OutputConfig,
    PoliciesConfig, ProcessingConfig, RateRules,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Configuration precedence levels, lowest first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum ConfigLayer {
    Global,
    Environment,
    Domain,
    Site,
    Ephemeral,
}

impl ConfigLayer {
    pub const ALL: [ConfigLayer; 5] = [
        ConfigLayer::Global,
        ConfigLayer::Environment,
        ConfigLayer::Domain,
        ConfigLayer::Site,
        ConfigLayer::Ephemeral,
    ];
}

/// Merges the layer stack over the materialized baseline, lowest precedence
/// first. Sections absent from every layer keep their default values.
pub fn resolve(layers: &BTreeMap<ConfigLayer, EngineConfigSpec>) -> EngineConfigSpec {
    let mut resolved = EngineConfigSpec::baseline();

    for spec in layers.values() {
        merge_spec(&mut resolved, spec);
    }

    resolved
}

fn merge_spec(base: &mut EngineConfigSpec, layer: &EngineConfigSpec) {
    merge_section(&mut base.global, &layer.global, merge_global);
    merge_section(&mut base.crawling, &layer.crawling, merge_crawling);
    merge_section(&mut base.processing, &layer.processing, merge_processing);
    merge_section(&mut base.output, &layer.output, merge_output);
    merge_section(&mut base.policies, &layer.policies, merge_policies);
}

/// An absent overlay section inherits; a present one merges field-wise into
/// the (cloned) base section.
fn merge_section<T: Clone>(base: &mut Option<T>, overlay: &Option<T>, merge: impl Fn(&mut T, &T)) {
    if let Some(overlay) = overlay {
        match base {
            Some(current) => merge(current, overlay),
            None => *base = Some(overlay.clone()),
        }
    }
}

/// Scalar rule: a set overlay field replaces the base value.
fn replace<T: Clone>(base: &mut Option<T>, overlay: &Option<T>) {
    if overlay.is_some() {
        *base = overlay.clone();
    }
}

fn merge_global(base: &mut GlobalConfig, overlay: &GlobalConfig) {
    replace(&mut base.max_concurrency, &overlay.max_concurrency);
    replace(&mut base.timeout, &overlay.timeout);
    replace(&mut base.logging_level, &overlay.logging_level);
}

fn merge_crawling(base: &mut CrawlingConfig, overlay: &CrawlingConfig) {
    // Keyed map: union of keys, higher layer wins each conflict.
    if let Some(overlay_rules) = &overlay.site_rules {
        let merged = base.site_rules.get_or_insert_with(Default::default);
        for (pattern, rules) in overlay_rules {
            merged.insert(pattern.clone(), rules.clone());
        }
    }

    merge_section(&mut base.link_rules, &overlay.link_rules, merge_link_rules);
    merge_section(
        &mut base.content_rules,
        &overlay.content_rules,
        merge_content_rules,
    );
    merge_section(&mut base.rate_rules, &overlay.rate_rules, merge_rate_rules);
}

fn merge_link_rules(base: &mut LinkRules, overlay: &LinkRules) {
    replace(
        &mut base.follow_external_links,
        &overlay.follow_external_links,
    );
    replace(&mut base.max_depth, &overlay.max_depth);
}

fn merge_content_rules(base: &mut ContentRules, overlay: &ContentRules) {
    // Ordered sequence: the higher layer replaces it outright.
    replace(&mut base.extraction_rules, &overlay.extraction_rules);
}

fn merge_rate_rules(base: &mut RateRules, overlay: &RateRules) {
    replace(&mut base.default_delay, &overlay.default_delay);

    if let Some(overlay_delays) = &overlay.site_delays {
        let merged = base.site_delays.get_or_insert_with(Default::default);
        for (host, delay) in overlay_delays {
            merged.insert(host.clone(), *delay);
        }
    }
}

fn merge_processing(base: &mut ProcessingConfig, overlay: &ProcessingConfig) {
    replace(&mut base.quality_threshold, &overlay.quality_threshold);
}

fn merge_output(base: &mut OutputConfig, overlay: &OutputConfig) {
    replace(&mut base.default_format, &overlay.default_format);
    replace(&mut base.compression, &overlay.compression);
}

fn merge_policies(base: &mut PoliciesConfig, overlay: &PoliciesConfig) {
    // Business rules are an ordered sequence, not a map: replace wholesale.
    replace(&mut base.business_rules, &overlay.business_rules);
}
