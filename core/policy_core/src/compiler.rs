//! Compiles live rules into interception directives.
//!
//! The directive JSON mirrors the browser's declarative request rule format,
//! so the shim can install `GET /directives` output verbatim.

use crate::model::{BlockMode, MatchType, Rule};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::warn;
use url::Url;

/// Rule id the catch-all redirect reports to the interstitial.
pub const CATCH_ALL_RULE_ID: &str = "__catchall__";
/// Ids below `ID_BASE` are reserved; 1 is unused, 2 is the catch-all.
pub const CATCH_ALL_ID: u32 = 2;
pub const CATCH_ALL_PRIORITY: u32 = 1;
/// Allow entries in allowlist mode, strictly above the catch-all.
pub const ALLOWLIST_PRIORITY: u32 = 2;
pub const BLOCKLIST_PRIORITY: u32 = 10;

const ID_BASE: u32 = 1000;
const ID_SPAN: u32 = 2_000_000_000;
const ORIGINAL_URL_PARAM: &str = "u";

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct Directive {
    pub id: u32,
    pub priority: u32,
    pub action: Action,
    pub condition: Condition,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Action {
    Allow,
    Redirect { redirect: Redirect },
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct Redirect {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform: Option<UrlTransform>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UrlTransform {
    pub query_transform: QueryTransform,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct QueryTransform {
    pub add_or_replace_params: Vec<QueryKeyValue>,
}

/// `value` may be the `{url}` placeholder, substituted with the request URL.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct QueryKeyValue {
    pub key: String,
    pub value: String,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    MainFrame,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url_filter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regex_filter: Option<String>,
    pub resource_types: Vec<ResourceType>,
}

impl Condition {
    fn url_filter(filter: String) -> Self {
        Self {
            url_filter: Some(filter),
            regex_filter: None,
            resource_types: vec![ResourceType::MainFrame],
        }
    }

    fn regex_filter(pattern: String) -> Self {
        Self {
            url_filter: None,
            regex_filter: Some(pattern),
            resource_types: vec![ResourceType::MainFrame],
        }
    }
}

/// Rolling 31-multiplier hash over UTF-16 code units, wrapping in u32.
pub fn stable_hash(s: &str) -> u32 {
    s.encode_utf16()
        .fold(0u32, |h, unit| h.wrapping_mul(31).wrapping_add(unit as u32))
}

/// Deterministic directive id for a rule id, always >= 1000.
pub fn directive_id(rule_id: &str) -> u32 {
    ID_BASE + stable_hash(rule_id) % ID_SPAN
}

fn next_id_in_range(id: u32) -> u32 {
    if id >= ID_BASE + ID_SPAN - 1 {
        ID_BASE
    } else {
        id + 1
    }
}

#[derive(Clone, Debug)]
pub struct RuleCompiler {
    interstitial: Url,
}

impl RuleCompiler {
    /// `interstitial` is the block page every redirect points at.
    pub fn new(interstitial: Url) -> Self {
        Self { interstitial }
    }

    fn redirect_action(&self, rid: &str, mode: BlockMode) -> Action {
        let mut url = self.interstitial.clone();
        url.query_pairs_mut()
            .clear()
            .append_pair("rid", rid)
            .append_pair("mode", mode.as_str());
        Action::Redirect {
            redirect: Redirect {
                url: url.to_string(),
                transform: Some(UrlTransform {
                    query_transform: QueryTransform {
                        add_or_replace_params: vec![QueryKeyValue {
                            key: ORIGINAL_URL_PARAM.to_string(),
                            value: "{url}".to_string(),
                        }],
                    },
                }),
            },
        }
    }

    pub fn compile(&self, rule: &Rule, priority: u32) -> Directive {
        let action = if rule.allow {
            Action::Allow
        } else {
            self.redirect_action(&rule.id, rule.mode)
        };

        let pattern = rule.pattern.trim();
        let condition = match rule.kind {
            MatchType::Exact => Condition::url_filter(format!("||{}", pattern.to_ascii_lowercase())),
            MatchType::Wildcard => {
                let host = pattern.strip_prefix("*.").unwrap_or(pattern);
                Condition::url_filter(format!("||{}", host.to_ascii_lowercase()))
            }
            MatchType::Regex => Condition::regex_filter(rule.pattern.clone()),
        };

        Directive {
            id: directive_id(&rule.id),
            priority,
            action,
            condition,
        }
    }

    /// Redirects every top-level http(s) navigation; allowlist mode only.
    pub fn catch_all(&self) -> Directive {
        Directive {
            id: CATCH_ALL_ID,
            priority: CATCH_ALL_PRIORITY,
            action: self.redirect_action(CATCH_ALL_RULE_ID, BlockMode::Hard),
            condition: Condition::url_filter("|http".to_string()),
        }
    }

    /// Compiles `rules` at `priority`, remapping any directive id that is
    /// already in `taken` to the next free id in range.
    pub fn compile_all<'a, I>(&self, rules: I, priority: u32, taken: &mut HashSet<u32>) -> Vec<Directive>
    where
        I: IntoIterator<Item = &'a Rule>,
    {
        rules
            .into_iter()
            .map(|rule| {
                let mut directive = self.compile(rule, priority);
                if taken.contains(&directive.id) {
                    let original = directive.id;
                    let mut candidate = next_id_in_range(original);
                    while taken.contains(&candidate) {
                        candidate = next_id_in_range(candidate);
                    }
                    warn!(
                        "directive id {original} for rule {} collides, remapped to {candidate}",
                        rule.id
                    );
                    directive.id = candidate;
                }
                taken.insert(directive.id);
                directive
            })
            .collect()
    }
}
