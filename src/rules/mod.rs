//! Evaluates RuleGroups → RuleSets → Rules against one series'
//! representative-instance metadata and decides the per-series match
//! outcome.

mod engine;
mod pipeline;

pub use engine::{Combinator, MatchedGroup, Rule, RuleGroup, RuleSet, SeriesOutcome, TagMap};
pub use pipeline::run_rule_match_for_series;
