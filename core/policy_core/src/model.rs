//! Policy data model shared by the engine, the store and the HTTP surface.
//!
//! Field names serialize in camelCase so the browser shim can exchange the
//! same JSON it keeps in extension storage.

use crate::error::{PolicyError, Result};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};

pub const DEFAULT_OVERRIDE_MINUTES: [i64; 3] = [5, 15, 30];

const RULE_ID_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MatchType {
    Exact,
    #[default]
    Wildcard,
    Regex,
}

/// How the interstitial behaves once a navigation is redirected.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BlockMode {
    #[default]
    Hard,
    Soft,
}

impl BlockMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockMode::Hard => "hard",
            BlockMode::Soft => "soft",
        }
    }
}

/// Weekly time window. Every field is optional on the wire; an incomplete
/// window is treated as always active by the evaluator.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct Schedule {
    /// Weekdays, 0 = Sunday.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub days: Option<Vec<u8>>,
    /// "HH:MM"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<String>,
    /// "HH:MM"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<String>,
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

fn default_timezone() -> String {
    "auto".to_string()
}

impl Schedule {
    pub fn validate(&self) -> Result<()> {
        if let Some(days) = &self.days {
            if let Some(bad) = days.iter().find(|d| **d > 6) {
                return Err(PolicyError::InvalidSchedule(format!(
                    "weekday {bad} out of range 0-6"
                )));
            }
        }
        for t in [&self.start, &self.end].into_iter().flatten() {
            if crate::schedule::parse_hhmm(t).is_none() {
                return Err(PolicyError::InvalidSchedule(format!(
                    "time '{t}' is not HH:MM"
                )));
            }
        }
        Ok(())
    }
}

/// A user-authored policy entry.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub pattern: String,
    #[serde(rename = "type", default)]
    pub kind: MatchType,
    #[serde(default)]
    pub mode: BlockMode,
    #[serde(default)]
    pub allow: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<Schedule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl Rule {
    pub fn new(id: &str, pattern: &str, kind: MatchType) -> Self {
        Self {
            id: id.to_string(),
            pattern: pattern.to_string(),
            kind,
            mode: BlockMode::Hard,
            allow: false,
            schedule: None,
            notes: None,
        }
    }

    pub fn allowing(mut self) -> Self {
        self.allow = true;
        self
    }

    pub fn with_schedule(mut self, schedule: Schedule) -> Self {
        self.schedule = Some(schedule);
        self
    }

    pub fn with_mode(mut self, mode: BlockMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.pattern.trim().is_empty() {
            return Err(PolicyError::MissingPattern);
        }
        if self.kind == MatchType::Regex {
            regex_lite::Regex::new(&self.pattern)
                .map_err(|e| PolicyError::InvalidRegex(e.to_string()))?;
        }
        if let Some(schedule) = &self.schedule {
            schedule.validate()?;
        }
        Ok(())
    }

    /// Hostname an override must be keyed by to shield this rule directly.
    /// Regex rules have no such key.
    pub fn override_key(&self) -> Option<String> {
        match self.kind {
            MatchType::Exact | MatchType::Wildcard => crate::matcher::hostname_of(&self.pattern),
            MatchType::Regex => None,
        }
    }
}

/// Rule as submitted by `addRule`: identity, type and mode may be left out.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleDraft {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub pattern: String,
    #[serde(rename = "type", default)]
    pub kind: Option<MatchType>,
    #[serde(default)]
    pub mode: Option<BlockMode>,
    #[serde(default)]
    pub allow: bool,
    #[serde(default)]
    pub schedule: Option<Schedule>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl RuleDraft {
    pub fn into_rule(self, default_mode: BlockMode) -> Rule {
        Rule {
            id: self
                .id
                .filter(|id| !id.trim().is_empty())
                .unwrap_or_else(new_rule_id),
            pattern: self.pattern.trim().to_string(),
            kind: self.kind.unwrap_or_default(),
            mode: self.mode.unwrap_or(default_mode),
            allow: self.allow,
            schedule: self.schedule,
            notes: self.notes,
        }
    }
}

pub fn new_rule_id() -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..8)
        .map(|_| RULE_ID_ALPHABET[rng.gen_range(0..RULE_ID_ALPHABET.len())] as char)
        .collect();
    format!("r_{suffix}")
}

/// Salted PIN hash, both fields base64.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct PinRecord {
    #[serde(default)]
    pub hash: Option<String>,
    #[serde(default)]
    pub salt: Option<String>,
}

impl PinRecord {
    pub fn is_set(&self) -> bool {
        self.hash.is_some() && self.salt.is_some()
    }
}

/// The whole settings aggregate, read and written as one blob.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub enabled: bool,
    pub allowlist_mode: bool,
    pub default_block_mode: BlockMode,
    pub require_pin_for_changes: bool,
    pub default_override_minutes: Vec<i64>,
    pub rules: Vec<Rule>,
    pub pin: PinRecord,
    /// Lower-cased hostname -> expiry.
    pub overrides: BTreeMap<String, DateTime<Utc>>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            enabled: true,
            allowlist_mode: false,
            default_block_mode: BlockMode::Hard,
            require_pin_for_changes: false,
            default_override_minutes: DEFAULT_OVERRIDE_MINUTES.to_vec(),
            rules: Vec::new(),
            pin: PinRecord::default(),
            overrides: BTreeMap::new(),
        }
    }
}

impl Settings {
    pub fn rule(&self, id: &str) -> Option<&Rule> {
        self.rules.iter().find(|r| r.id == id)
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for rule in &self.rules {
            if rule.id.trim().is_empty() {
                return Err(PolicyError::InvalidSettings("rule without id".to_string()));
            }
            if !seen.insert(rule.id.as_str()) {
                return Err(PolicyError::DuplicateRuleId(rule.id.clone()));
            }
            rule.validate()?;
        }
        if self.default_override_minutes.iter().any(|m| *m <= 0) {
            return Err(PolicyError::InvalidSettings(
                "defaultOverrideMinutes must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Re-keys `overrides` by normalized hostname. When two keys collapse
    /// onto the same host the later expiry wins.
    pub fn normalize_overrides(&mut self) -> Result<()> {
        let mut normalized = BTreeMap::new();
        for (key, until) in std::mem::take(&mut self.overrides) {
            let host = crate::matcher::hostname_of(&key)
                .ok_or_else(|| PolicyError::InvalidHostname(key.clone()))?;
            let slot = normalized.entry(host).or_insert(until);
            if until > *slot {
                *slot = until;
            }
        }
        self.overrides = normalized;
        Ok(())
    }

    /// Drops every override whose expiry is at or before `now`.
    /// Returns how many were removed.
    pub fn purge_expired_overrides(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.overrides.len();
        self.overrides.retain(|_, until| *until > now);
        before - self.overrides.len()
    }

    /// Unexpired override hosts at `now`.
    pub fn live_overrides(&self, now: DateTime<Utc>) -> impl Iterator<Item = &str> {
        self.overrides
            .iter()
            .filter(move |(_, until)| **until > now)
            .map(|(host, _)| host.as_str())
    }

    /// Copy safe to hand out: the PIN hash and salt are blanked.
    pub fn redacted(&self) -> SettingsView {
        let mut settings = self.clone();
        let pin_configured = settings.pin.is_set();
        settings.pin = PinRecord::default();
        SettingsView {
            settings,
            pin_configured,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsView {
    #[serde(flatten)]
    pub settings: Settings,
    pub pin_configured: bool,
}

/// Subset of the settings that `exportPolicy` / `importPolicy` carry.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PolicyExport {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub allowlist_mode: bool,
    #[serde(default)]
    pub default_block_mode: Option<BlockMode>,
    pub rules: Vec<Rule>,
}

impl From<&Settings> for PolicyExport {
    fn from(s: &Settings) -> Self {
        Self {
            enabled: s.enabled,
            allowlist_mode: s.allowlist_mode,
            default_block_mode: Some(s.default_block_mode),
            rules: s.rules.clone(),
        }
    }
}

/// Shallow merge: every top-level key of `patch` replaces the same key of
/// `base`, except keys listed in `protected`.
pub fn merge_top_level<T>(base: &T, patch: Value, protected: &[&str]) -> Result<T>
where
    T: Serialize + serde::de::DeserializeOwned,
{
    let Value::Object(patch) = patch else {
        return Err(PolicyError::InvalidSettings("expected a JSON object".to_string()));
    };
    let mut merged = serde_json::to_value(base)?;
    let Some(target) = merged.as_object_mut() else {
        return Err(PolicyError::InvalidSettings("base is not an object".to_string()));
    };
    for (key, value) in patch {
        if protected.contains(&key.as_str()) {
            continue;
        }
        target.insert(key, value);
    }
    serde_json::from_value(merged).map_err(|e| PolicyError::InvalidSettings(e.to_string()))
}
