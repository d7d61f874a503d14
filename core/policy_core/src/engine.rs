//! Reconciliation loop.
//!
//! One task owns the settings store, the directive table and every timer.
//! HTTP handlers, the minute timer and restoration timers all reach it through
//! a single command queue, so passes and settings writes are strictly ordered.

use crate::compiler::{
    Directive, RuleCompiler, ALLOWLIST_PRIORITY, BLOCKLIST_PRIORITY, CATCH_ALL_ID,
    CATCH_ALL_RULE_ID,
};
use crate::directives::{evaluate, InterceptionLayer, Verdict};
use crate::error::{PolicyError, Result};
use crate::matcher::{hostname_of, matches};
use crate::model::{
    merge_top_level, new_rule_id, MatchType, PolicyExport, Rule, RuleDraft, Settings,
    SettingsView,
};
use crate::pin::{set_pin, verify_pin};
use crate::schedule::{is_active, next_minute_boundary};
use crate::store::SettingsStore;
use chrono::{DateTime, Local, TimeZone, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use url::Url;

/// Shortest delay before the next scheduled pass.
const MIN_TIMER_DELAY: Duration = Duration::from_millis(1200);
/// Longest single override: one year.
pub const MAX_OVERRIDE_MINUTES: i64 = 365 * 24 * 60;

pub type Clock = Arc<dyn Fn() -> DateTime<Local> + Send + Sync>;

#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Block page every redirect points at.
    pub interstitial: Url,
    /// How long `temporary_allow` keeps a rule out of the table.
    pub grace: Duration,
}

/// Outcome of one reconciliation pass.
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct PassReport {
    pub reason: String,
    pub installed: usize,
    pub added: usize,
    pub removed: usize,
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TemporaryAllow {
    pub rule_id: String,
    pub restore_in_seconds: u64,
    pub navigate_to: String,
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OverrideGrant {
    pub hostname: String,
    pub until: DateTime<Utc>,
    pub navigate_to: String,
}

/// Directive ids to drop and directives to install for one pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Delta {
    pub remove: Vec<u32>,
    pub add: Vec<Directive>,
}

impl Delta {
    pub fn is_empty(&self) -> bool {
        self.remove.is_empty() && self.add.is_empty()
    }
}

/// Incremental delta between what is installed and what should be.
/// Applying it yields the same table as a full rebuild.
pub fn diff(installed: &[Directive], desired: &[Directive]) -> Delta {
    let remove = installed
        .iter()
        .filter(|d| !desired.contains(d))
        .map(|d| d.id)
        .collect();
    let add = desired
        .iter()
        .filter(|d| !installed.contains(d))
        .cloned()
        .collect();
    Delta { remove, add }
}

/// Whether a live override suppresses `rule`: either its own hostname is
/// overridden, or some overridden host would itself be caught by it.
pub fn is_shielded(rule: &Rule, settings: &Settings, now: DateTime<Utc>) -> bool {
    if let Some(key) = rule.override_key() {
        if settings.overrides.get(&key).is_some_and(|until| *until > now) {
            debug!("rule {} shielded by override for {key}", rule.id);
            return true;
        }
    }
    for host in settings.live_overrides(now) {
        if matches(&format!("https://{host}"), rule) {
            debug!("rule {} shielded by override for {host}", rule.id);
            return true;
        }
    }
    false
}

/// Directives that should be installed for `settings` at `now`. Rules in
/// `suspended` (temporary allows) are left out.
pub fn plan<Tz: TimeZone>(
    settings: &Settings,
    now: &DateTime<Tz>,
    suspended: &HashSet<&str>,
    compiler: &RuleCompiler,
) -> Vec<Directive> {
    if !settings.enabled {
        return Vec::new();
    }

    let mut taken = HashSet::new();
    if settings.allowlist_mode {
        let mut out = Vec::new();
        if !suspended.contains(CATCH_ALL_RULE_ID) {
            taken.insert(CATCH_ALL_ID);
            out.push(compiler.catch_all());
        }
        let allowed = settings
            .rules
            .iter()
            .filter(|r| r.allow && !suspended.contains(r.id.as_str()));
        out.extend(compiler.compile_all(allowed, ALLOWLIST_PRIORITY, &mut taken));
        return out;
    }

    let now_utc = now.with_timezone(&Utc);
    let live = settings.rules.iter().filter(|rule| {
        if rule.allow || suspended.contains(rule.id.as_str()) {
            return false;
        }
        if !is_active(now, rule.schedule.as_ref()) {
            debug!("rule {} outside its schedule", rule.id);
            return false;
        }
        !is_shielded(rule, settings, now_utc)
    });
    compiler.compile_all(live, BLOCKLIST_PRIORITY, &mut taken)
}

type Reply<T> = oneshot::Sender<Result<T>>;

pub enum Command {
    Reconcile { reason: String, reply: Reply<PassReport> },
    GetSettings { reply: Reply<SettingsView> },
    SetEnabled { enabled: bool, reply: Reply<()> },
    SaveSettings { settings: Value, pin: Option<String>, reply: Reply<()> },
    AddRule { rule: RuleDraft, reply: Reply<Rule> },
    RemoveRule { id: String, reply: Reply<()> },
    UpdateRule { rule: Value, reply: Reply<Rule> },
    TestMatch { url: String, reply: Reply<Option<Rule>> },
    TemporaryAllow { rid: String, url: String, reply: Reply<TemporaryAllow> },
    OverrideHostname {
        hostname: String,
        minutes: i64,
        url: Option<String>,
        reply: Reply<OverrideGrant>,
    },
    AddCurrentSite { url: String, reply: Reply<Rule> },
    SetPin { pin: String, current_pin: Option<String>, reply: Reply<()> },
    ExportPolicy { reply: Reply<PolicyExport> },
    ImportPolicy { policy: PolicyExport, pin: Option<String>, reply: Reply<()> },
    Directives { reply: Reply<Vec<Directive>> },
    Navigate { url: String, reply: Reply<Verdict> },
    /// Fired by a restoration timer once a temporary allow runs out.
    Restore { rid: String },
}

pub struct Engine<S, L> {
    store: S,
    layer: L,
    compiler: RuleCompiler,
    grace: Duration,
    clock: Clock,
    /// Rule id -> pending restoration task.
    suspended: HashMap<String, Option<AbortHandle>>,
    next_pass_at: Option<Instant>,
    queue: Option<mpsc::WeakSender<Command>>,
}

impl<S, L> Engine<S, L>
where
    S: SettingsStore,
    L: InterceptionLayer,
{
    pub fn new(store: S, layer: L, config: EngineConfig) -> Self {
        Self {
            store,
            layer,
            compiler: RuleCompiler::new(config.interstitial),
            grace: config.grace,
            clock: Arc::new(Local::now),
            suspended: HashMap::new(),
            next_pass_at: None,
            queue: None,
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    fn now(&self) -> DateTime<Local> {
        (self.clock)()
    }

    /// One full load / evaluate / compile / install cycle.
    pub fn reconcile(&mut self, reason: &str) -> Result<PassReport> {
        let now = self.now();
        let now_utc = now.with_timezone(&Utc);

        let mut settings = self.store.load();
        let purged = settings.purge_expired_overrides(now_utc);
        if purged > 0 {
            debug!("purged {purged} expired override(s)");
            if let Err(err) = self.store.save(&settings) {
                error!("persisting override purge failed: {err}");
            }
        }

        let installed = self.layer.installed()?;
        let suspended: HashSet<&str> = self.suspended.keys().map(String::as_str).collect();
        let desired = plan(&settings, &now, &suspended, &self.compiler);
        let delta = diff(&installed, &desired);

        if !delta.is_empty() {
            self.layer.replace(&delta.remove, &delta.add)?;
        }

        let report = PassReport {
            reason: reason.to_string(),
            installed: desired.len(),
            added: delta.add.len(),
            removed: delta.remove.len(),
        };
        info!(
            "reconcile ({reason}): {} installed, +{} -{}",
            report.installed, report.added, report.removed
        );
        Ok(report)
    }

    /// Reconciles and re-arms the minute timer whatever the outcome.
    fn run_pass(&mut self, reason: &str) -> Result<PassReport> {
        let result = self.reconcile(reason);
        if let Err(err) = &result {
            error!("reconcile ({reason}) failed: {err}");
        }
        self.arm_minute_timer();
        result
    }

    fn arm_minute_timer(&mut self) {
        let now = self.now();
        let delay = (next_minute_boundary(&now) - now)
            .to_std()
            .unwrap_or(MIN_TIMER_DELAY)
            .max(MIN_TIMER_DELAY);
        self.next_pass_at = Some(Instant::now() + delay);
    }

    fn authorize(settings: &Settings, pin: Option<&str>) -> Result<()> {
        if !settings.require_pin_for_changes || !settings.pin.is_set() {
            return Ok(());
        }
        match pin.filter(|p| !p.is_empty()) {
            None => Err(PolicyError::PinRequired),
            Some(p) if verify_pin(settings, p) => Ok(()),
            Some(_) => Err(PolicyError::InvalidPin),
        }
    }

    fn commit(&mut self, settings: &Settings, reason: &str) -> Result<()> {
        self.store.save(settings)?;
        self.run_pass(reason).map(|_| ())
    }

    pub fn get_settings(&mut self) -> SettingsView {
        self.store.load().redacted()
    }

    pub fn set_enabled(&mut self, enabled: bool) -> Result<()> {
        let mut settings = self.store.load();
        settings.enabled = enabled;
        self.commit(&settings, "toggle")
    }

    /// Shallow-merges `patch` into the stored settings. The PIN record can
    /// only change through [`Engine::set_pin`].
    pub fn save_settings(&mut self, patch: Value, pin: Option<&str>) -> Result<()> {
        let settings = self.store.load();
        Self::authorize(&settings, pin)?;
        let mut merged: Settings = merge_top_level(&settings, patch, &["pin"])?;
        merged.normalize_overrides()?;
        merged.validate()?;

        let retained: HashSet<&str> = merged.rules.iter().map(|r| r.id.as_str()).collect();
        let dropped: Vec<String> = self
            .suspended
            .keys()
            .filter(|rid| rid.as_str() != CATCH_ALL_RULE_ID && !retained.contains(rid.as_str()))
            .cloned()
            .collect();
        for rid in dropped {
            self.cancel_restore(&rid);
        }
        self.commit(&merged, "save")
    }

    pub fn add_rule(&mut self, draft: RuleDraft) -> Result<Rule> {
        let mut settings = self.store.load();
        let rule = draft.into_rule(settings.default_block_mode);
        rule.validate()?;
        if settings.rule(&rule.id).is_some() {
            return Err(PolicyError::DuplicateRuleId(rule.id));
        }
        settings.rules.push(rule.clone());
        self.commit(&settings, "addRule")?;
        Ok(rule)
    }

    pub fn remove_rule(&mut self, id: &str) -> Result<()> {
        let mut settings = self.store.load();
        let Some(idx) = settings.rules.iter().position(|r| r.id == id) else {
            return Err(PolicyError::NotFound(id.to_string()));
        };
        settings.rules.remove(idx);
        self.cancel_restore(id);
        self.commit(&settings, "removeRule")
    }

    /// Merges the fields present in `patch` onto the rule with the same id.
    pub fn update_rule(&mut self, patch: Value) -> Result<Rule> {
        let id = patch
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| PolicyError::InvalidSettings("rule id missing".to_string()))?;

        let mut settings = self.store.load();
        let Some(idx) = settings.rules.iter().position(|r| r.id == id) else {
            return Err(PolicyError::NotFound(id));
        };
        let updated: Rule = merge_top_level(&settings.rules[idx], patch, &["id"])?;
        updated.validate()?;
        settings.rules[idx] = updated.clone();
        self.cancel_restore(&id);
        self.commit(&settings, "updateRule")?;
        Ok(updated)
    }

    /// First block rule that catches `url`.
    pub fn test_match(&mut self, url: &str) -> Result<Option<Rule>> {
        Url::parse(url).map_err(|e| PolicyError::InvalidUrl(format!("{url}: {e}")))?;
        let settings = self.store.load();
        Ok(settings
            .rules
            .into_iter()
            .find(|r| !r.allow && matches(url, r)))
    }

    /// Takes one rule's directive out of the table for the grace window, then
    /// puts it back unless the rule was removed or edited meanwhile.
    pub fn temporary_allow(&mut self, rid: &str, url: &str) -> Result<TemporaryAllow> {
        Url::parse(url).map_err(|e| PolicyError::InvalidUrl(format!("{url}: {e}")))?;
        let settings = self.store.load();
        if rid != CATCH_ALL_RULE_ID && settings.rule(rid).is_none() {
            return Err(PolicyError::NotFound(rid.to_string()));
        }

        self.schedule_restore(rid);
        self.run_pass("temporaryAllow")?;
        Ok(TemporaryAllow {
            rule_id: rid.to_string(),
            restore_in_seconds: self.grace.as_secs(),
            navigate_to: url.to_string(),
        })
    }

    fn schedule_restore(&mut self, rid: &str) {
        self.cancel_restore(rid);
        let task = match (self.queue.clone(), tokio::runtime::Handle::try_current()) {
            (Some(queue), Ok(runtime)) => {
                let grace = self.grace;
                let rid = rid.to_string();
                let handle = runtime.spawn(async move {
                    tokio::time::sleep(grace).await;
                    if let Some(tx) = queue.upgrade() {
                        let _ = tx.send(Command::Restore { rid }).await;
                    }
                });
                Some(handle.abort_handle())
            }
            _ => None,
        };
        self.suspended.insert(rid.to_string(), task);
    }

    /// Drops a pending restoration. Returns whether one was pending.
    fn cancel_restore(&mut self, rid: &str) -> bool {
        match self.suspended.remove(rid) {
            Some(task) => {
                if let Some(task) = task {
                    task.abort();
                }
                debug!("cancelled pending restoration for {rid}");
                true
            }
            None => false,
        }
    }

    /// Ends a temporary allow. No-op if it was already cancelled.
    pub fn restore(&mut self, rid: &str) -> Result<()> {
        if self.suspended.remove(rid).is_none() {
            return Ok(());
        }
        let settings = self.store.load();
        if rid != CATCH_ALL_RULE_ID && settings.rule(rid).is_none() {
            debug!("rule {rid} is gone, nothing to restore");
            return Ok(());
        }
        self.run_pass("restore").map(|_| ())
    }

    /// Installs or extends an override; the later expiry wins.
    pub fn override_hostname(
        &mut self,
        hostname: &str,
        minutes: i64,
        url: Option<&str>,
    ) -> Result<OverrideGrant> {
        if !(1..=MAX_OVERRIDE_MINUTES).contains(&minutes) {
            return Err(PolicyError::InvalidMinutes(minutes));
        }
        let host =
            hostname_of(hostname).ok_or_else(|| PolicyError::InvalidHostname(hostname.to_string()))?;
        let requested = chrono::Duration::try_minutes(minutes)
            .and_then(|d| self.now().with_timezone(&Utc).checked_add_signed(d))
            .ok_or(PolicyError::InvalidMinutes(minutes))?;

        let mut settings = self.store.load();
        let until = match settings.overrides.get(&host) {
            Some(existing) if *existing > requested => *existing,
            _ => requested,
        };
        settings.overrides.insert(host.clone(), until);
        info!("override for {host} until {until}");
        self.commit(&settings, "override")?;

        Ok(OverrideGrant {
            navigate_to: url
                .map(str::to_string)
                .unwrap_or_else(|| format!("https://{host}")),
            hostname: host,
            until,
        })
    }

    /// Blocks the site of `url` (and its subdomains) with a new wildcard rule.
    pub fn add_current_site(&mut self, url: &str) -> Result<Rule> {
        let parsed = Url::parse(url).map_err(|e| PolicyError::InvalidUrl(format!("{url}: {e}")))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| PolicyError::InvalidUrl(format!("{url}: no host")))?
            .to_ascii_lowercase();

        let mut settings = self.store.load();
        let existing = settings.rules.iter().find(|r| {
            r.kind == MatchType::Wildcard && !r.allow && r.pattern.eq_ignore_ascii_case(&host)
        });
        if let Some(existing) = existing {
            debug!("{host} already blocked by rule {}", existing.id);
            return Ok(existing.clone());
        }
        let rule = Rule {
            id: new_rule_id(),
            pattern: host,
            kind: MatchType::Wildcard,
            mode: settings.default_block_mode,
            allow: false,
            schedule: None,
            notes: Some("Added from current page".to_string()),
        };
        settings.rules.push(rule.clone());
        self.commit(&settings, "addCurrentSite")?;
        Ok(rule)
    }

    /// Sets a new PIN. Once one exists, the current PIN must be supplied.
    pub fn set_pin(&mut self, pin: &str, current_pin: Option<&str>) -> Result<()> {
        if pin.trim().is_empty() {
            return Err(PolicyError::InvalidSettings("PIN must not be empty".to_string()));
        }
        let mut settings = self.store.load();
        if settings.pin.is_set() {
            match current_pin.filter(|p| !p.is_empty()) {
                None => return Err(PolicyError::PinRequired),
                Some(p) if !verify_pin(&settings, p) => return Err(PolicyError::InvalidPin),
                Some(_) => {}
            }
        }
        set_pin(&mut settings, pin);
        self.commit(&settings, "setPin")
    }

    pub fn export_policy(&mut self) -> PolicyExport {
        PolicyExport::from(&self.store.load())
    }

    pub fn import_policy(&mut self, policy: PolicyExport, pin: Option<&str>) -> Result<()> {
        let mut settings = self.store.load();
        Self::authorize(&settings, pin)?;
        settings.enabled = policy.enabled;
        settings.allowlist_mode = policy.allowlist_mode;
        if let Some(mode) = policy.default_block_mode {
            settings.default_block_mode = mode;
        }
        settings.rules = policy.rules;
        settings.normalize_overrides()?;
        settings.validate()?;

        let pending: Vec<String> = self.suspended.keys().cloned().collect();
        for rid in pending {
            self.cancel_restore(&rid);
        }
        self.commit(&settings, "import")
    }

    pub fn directives(&mut self) -> Result<Vec<Directive>> {
        self.layer.installed()
    }

    pub fn navigate(&mut self, url: &str) -> Result<Verdict> {
        Url::parse(url).map_err(|e| PolicyError::InvalidUrl(format!("{url}: {e}")))?;
        let installed = self.layer.installed()?;
        Ok(evaluate(&installed, url))
    }

    fn handle(&mut self, cmd: Command) {
        // A dropped receiver just means the caller went away.
        match cmd {
            Command::Reconcile { reason, reply } => {
                let _ = reply.send(self.run_pass(&reason));
            }
            Command::GetSettings { reply } => {
                let _ = reply.send(Ok(self.get_settings()));
            }
            Command::SetEnabled { enabled, reply } => {
                let _ = reply.send(self.set_enabled(enabled));
            }
            Command::SaveSettings { settings, pin, reply } => {
                let _ = reply.send(self.save_settings(settings, pin.as_deref()));
            }
            Command::AddRule { rule, reply } => {
                let _ = reply.send(self.add_rule(rule));
            }
            Command::RemoveRule { id, reply } => {
                let _ = reply.send(self.remove_rule(&id));
            }
            Command::UpdateRule { rule, reply } => {
                let _ = reply.send(self.update_rule(rule));
            }
            Command::TestMatch { url, reply } => {
                let _ = reply.send(self.test_match(&url));
            }
            Command::TemporaryAllow { rid, url, reply } => {
                let _ = reply.send(self.temporary_allow(&rid, &url));
            }
            Command::OverrideHostname {
                hostname,
                minutes,
                url,
                reply,
            } => {
                let _ = reply.send(self.override_hostname(&hostname, minutes, url.as_deref()));
            }
            Command::AddCurrentSite { url, reply } => {
                let _ = reply.send(self.add_current_site(&url));
            }
            Command::SetPin {
                pin,
                current_pin,
                reply,
            } => {
                let _ = reply.send(self.set_pin(&pin, current_pin.as_deref()));
            }
            Command::ExportPolicy { reply } => {
                let _ = reply.send(Ok(self.export_policy()));
            }
            Command::ImportPolicy { policy, pin, reply } => {
                let _ = reply.send(self.import_policy(policy, pin.as_deref()));
            }
            Command::Directives { reply } => {
                let _ = reply.send(self.directives());
            }
            Command::Navigate { url, reply } => {
                let _ = reply.send(self.navigate(&url));
            }
            Command::Restore { rid } => {
                if let Err(err) = self.restore(&rid) {
                    warn!("restoring {rid} failed: {err}");
                }
            }
        }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        let _ = self.run_pass("startup");
        loop {
            let deadline = self
                .next_pass_at
                .unwrap_or_else(|| Instant::now() + Duration::from_secs(60));
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(cmd) => self.handle(cmd),
                    None => break,
                },
                _ = tokio::time::sleep_until(deadline) => {
                    let _ = self.run_pass("alarm");
                }
            }
        }
        info!("policy engine stopped");
    }
}

impl<S, L> Engine<S, L>
where
    S: SettingsStore + Send + 'static,
    L: InterceptionLayer + Send + 'static,
{
    /// Starts the engine task. It runs a startup pass first and stops once
    /// every [`EngineHandle`] is dropped.
    pub fn spawn(mut self, queue_depth: usize) -> (EngineHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(queue_depth.max(1));
        self.queue = Some(tx.downgrade());
        let task = tokio::spawn(self.run(rx));
        (EngineHandle { tx }, task)
    }
}

/// Cheap, cloneable front door to the engine task.
#[derive(Clone, Debug)]
pub struct EngineHandle {
    tx: mpsc::Sender<Command>,
}

impl EngineHandle {
    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| PolicyError::EngineUnavailable)?;
        rx.await.map_err(|_| PolicyError::EngineUnavailable)?
    }

    pub async fn reconcile(&self, reason: &str) -> Result<PassReport> {
        let reason = reason.to_string();
        self.request(|reply| Command::Reconcile { reason, reply }).await
    }

    pub async fn get_settings(&self) -> Result<SettingsView> {
        self.request(|reply| Command::GetSettings { reply }).await
    }

    pub async fn set_enabled(&self, enabled: bool) -> Result<()> {
        self.request(|reply| Command::SetEnabled { enabled, reply }).await
    }

    pub async fn save_settings(&self, settings: Value, pin: Option<String>) -> Result<()> {
        self.request(|reply| Command::SaveSettings { settings, pin, reply })
            .await
    }

    pub async fn add_rule(&self, rule: RuleDraft) -> Result<Rule> {
        self.request(|reply| Command::AddRule { rule, reply }).await
    }

    pub async fn remove_rule(&self, id: String) -> Result<()> {
        self.request(|reply| Command::RemoveRule { id, reply }).await
    }

    pub async fn update_rule(&self, rule: Value) -> Result<Rule> {
        self.request(|reply| Command::UpdateRule { rule, reply }).await
    }

    pub async fn test_match(&self, url: String) -> Result<Option<Rule>> {
        self.request(|reply| Command::TestMatch { url, reply }).await
    }

    pub async fn temporary_allow(&self, rid: String, url: String) -> Result<TemporaryAllow> {
        self.request(|reply| Command::TemporaryAllow { rid, url, reply })
            .await
    }

    pub async fn override_hostname(
        &self,
        hostname: String,
        minutes: i64,
        url: Option<String>,
    ) -> Result<OverrideGrant> {
        self.request(|reply| Command::OverrideHostname {
            hostname,
            minutes,
            url,
            reply,
        })
        .await
    }

    pub async fn add_current_site(&self, url: String) -> Result<Rule> {
        self.request(|reply| Command::AddCurrentSite { url, reply }).await
    }

    pub async fn set_pin(&self, pin: String, current_pin: Option<String>) -> Result<()> {
        self.request(|reply| Command::SetPin {
            pin,
            current_pin,
            reply,
        })
        .await
    }

    pub async fn export_policy(&self) -> Result<PolicyExport> {
        self.request(|reply| Command::ExportPolicy { reply }).await
    }

    pub async fn import_policy(&self, policy: PolicyExport, pin: Option<String>) -> Result<()> {
        self.request(|reply| Command::ImportPolicy { policy, pin, reply })
            .await
    }

    pub async fn directives(&self) -> Result<Vec<Directive>> {
        self.request(|reply| Command::Directives { reply }).await
    }

    pub async fn navigate(&self, url: String) -> Result<Verdict> {
        self.request(|reply| Command::Navigate { url, reply }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directives::SqliteDirectiveTable;
    use crate::model::Schedule;
    use crate::store::SqliteSettingsStore;
    use chrono::NaiveDate;
    use serde_json::json;
    use std::sync::Mutex;

    type TestEngine = Engine<SqliteSettingsStore, SqliteDirectiveTable>;

    fn config() -> EngineConfig {
        EngineConfig {
            interstitial: Url::parse("chrome-extension://guard/block.html").unwrap(),
            grace: Duration::from_secs(15),
        }
    }

    // 2026-02-17 is a Tuesday.
    fn local(day: u32, hh: u32, mm: u32) -> DateTime<Local> {
        let naive = NaiveDate::from_ymd_opt(2026, 2, day)
            .unwrap()
            .and_hms_opt(hh, mm, 0)
            .unwrap();
        Local.from_local_datetime(&naive).earliest().unwrap()
    }

    fn engine_at(now: DateTime<Local>) -> (TestEngine, Arc<Mutex<DateTime<Local>>>) {
        let clock_now = Arc::new(Mutex::new(now));
        let shared = clock_now.clone();
        let engine = Engine::new(
            SqliteSettingsStore::in_memory(None).unwrap(),
            SqliteDirectiveTable::in_memory().unwrap(),
            config(),
        )
        .with_clock(Arc::new(move || *shared.lock().unwrap()));
        (engine, clock_now)
    }

    fn block(pattern: &str) -> RuleDraft {
        RuleDraft {
            pattern: pattern.to_string(),
            ..Default::default()
        }
    }

    fn redirected(engine: &mut TestEngine, url: &str) -> bool {
        matches!(engine.navigate(url).unwrap(), Verdict::Redirect { .. })
    }

    #[test]
    fn reconcile_is_idempotent() {
        let (mut engine, _) = engine_at(local(17, 10, 0));
        engine.add_rule(block("*.example.com")).unwrap();
        engine.add_rule(block("news.com")).unwrap();

        let first = engine.directives().unwrap();
        let report = engine.reconcile("again").unwrap();
        assert_eq!(engine.directives().unwrap(), first);
        assert_eq!(report.added, 0);
        assert_eq!(report.removed, 0);
        assert_eq!(report.installed, 2);
    }

    #[test]
    fn disabled_installs_nothing() {
        let (mut engine, _) = engine_at(local(17, 10, 0));
        engine.add_rule(block("example.com")).unwrap();
        assert_eq!(engine.directives().unwrap().len(), 1);

        engine.set_enabled(false).unwrap();
        assert!(engine.directives().unwrap().is_empty());
        assert!(!redirected(&mut engine, "https://example.com"));
    }

    #[test]
    fn override_expires_and_rule_returns() {
        let (mut engine, clock) = engine_at(local(17, 10, 0));
        engine.add_rule(block("example.com")).unwrap();
        assert!(redirected(&mut engine, "https://example.com/"));

        let grant = engine.override_hostname("example.com", 5, None).unwrap();
        assert_eq!(grant.navigate_to, "https://example.com");
        assert!(!redirected(&mut engine, "https://example.com/"));

        *clock.lock().unwrap() = local(17, 10, 6);
        engine.reconcile("alarm").unwrap();
        assert!(redirected(&mut engine, "https://example.com/"));
        assert!(engine.get_settings().settings.overrides.is_empty());
    }

    #[test]
    fn subdomain_override_shields_broader_rule() {
        let (mut engine, _) = engine_at(local(17, 10, 0));
        engine.add_rule(block("*.example.com")).unwrap();
        engine.override_hostname("https://mail.example.com/inbox", 15, None).unwrap();
        assert!(engine.directives().unwrap().is_empty());
    }

    #[test]
    fn override_extends_but_never_shortens() {
        let (mut engine, _) = engine_at(local(17, 10, 0));
        let long = engine.override_hostname("example.com", 30, None).unwrap();
        let short = engine.override_hostname("EXAMPLE.com", 5, None).unwrap();
        assert_eq!(short.until, long.until);
        assert!(matches!(
            engine.override_hostname("example.com", 0, None),
            Err(PolicyError::InvalidMinutes(0))
        ));
    }

    #[test]
    fn oversized_override_is_rejected_and_engine_survives() {
        let (mut engine, _) = engine_at(local(17, 10, 0));
        for minutes in [MAX_OVERRIDE_MINUTES + 1, 200_000_000_000, i64::MAX] {
            assert!(matches!(
                engine.override_hostname("example.com", minutes, None),
                Err(PolicyError::InvalidMinutes(m)) if m == minutes
            ));
        }
        assert!(engine.get_settings().settings.overrides.is_empty());
        engine
            .override_hostname("example.com", MAX_OVERRIDE_MINUTES, None)
            .unwrap();
    }

    #[test]
    fn override_hostname_rejects_malformed_host() {
        let (mut engine, _) = engine_at(local(17, 10, 0));
        assert!(matches!(
            engine.override_hostname("exa mple.com", 5, None),
            Err(PolicyError::InvalidHostname(_))
        ));
    }

    #[test]
    fn regex_rule_shielded_by_host_override() {
        let (mut engine, _) = engine_at(local(17, 10, 0));
        let mut draft = block(r"^https://example\.com");
        draft.kind = Some(MatchType::Regex);
        engine.add_rule(draft).unwrap();
        assert_eq!(engine.directives().unwrap().len(), 1);

        engine.override_hostname("example.com", 15, None).unwrap();
        assert!(engine.directives().unwrap().is_empty());
    }

    #[test]
    fn path_specific_regex_stays_installed_under_override() {
        let (mut engine, _) = engine_at(local(17, 10, 0));
        let mut draft = block(r"example\.com/shorts/");
        draft.kind = Some(MatchType::Regex);
        engine.add_rule(draft).unwrap();

        engine.override_hostname("example.com", 15, None).unwrap();
        assert_eq!(engine.directives().unwrap().len(), 1);
        assert!(redirected(&mut engine, "https://example.com/shorts/abc"));
    }

    #[test]
    fn expired_override_shields_nothing_before_purge() {
        let now = local(17, 10, 0);
        let mut settings = Settings::default();
        settings.rules.push(Rule::new("r_a", "example.com", MatchType::Wildcard));
        settings
            .rules
            .push(Rule::new("r_b", r"^https://example\.com", MatchType::Regex));
        settings.overrides.insert(
            "example.com".to_string(),
            now.with_timezone(&Utc) - chrono::Duration::minutes(1),
        );

        let compiler = RuleCompiler::new(config().interstitial);
        let desired = plan(&settings, &now, &HashSet::new(), &compiler);
        assert_eq!(desired.len(), 2);

        settings.overrides.insert(
            "example.com".to_string(),
            now.with_timezone(&Utc) + chrono::Duration::minutes(1),
        );
        assert!(plan(&settings, &now, &HashSet::new(), &compiler).is_empty());
    }

    #[test]
    fn saved_override_keys_are_normalized() {
        let (mut engine, _) = engine_at(local(17, 10, 0));
        let mut draft = block(r"^https://example\.com");
        draft.kind = Some(MatchType::Regex);
        engine.add_rule(draft).unwrap();

        let until = local(17, 10, 30).with_timezone(&Utc);
        engine
            .save_settings(json!({ "overrides": { "Example.COM": until } }), None)
            .unwrap();
        let stored = engine.get_settings().settings.overrides;
        assert_eq!(stored.keys().collect::<Vec<_>>(), vec!["example.com"]);
        assert!(engine.directives().unwrap().is_empty());

        assert!(matches!(
            engine.save_settings(json!({ "overrides": { "exa mple.com": until } }), None),
            Err(PolicyError::InvalidHostname(_))
        ));
        assert_eq!(engine.get_settings().settings.overrides.len(), 1);
    }

    #[test]
    fn schedule_gates_rules() {
        let (mut engine, clock) = engine_at(local(17, 8, 59));
        let mut draft = block("example.com");
        draft.schedule = Some(Schedule {
            days: Some(vec![1, 2, 3, 4, 5]),
            start: Some("09:00".to_string()),
            end: Some("17:00".to_string()),
            timezone: "auto".to_string(),
        });
        engine.add_rule(draft).unwrap();
        assert!(engine.directives().unwrap().is_empty());

        *clock.lock().unwrap() = local(17, 9, 0);
        engine.reconcile("alarm").unwrap();
        assert_eq!(engine.directives().unwrap().len(), 1);
    }

    #[test]
    fn allowlist_mode_redirects_everything_else() {
        let (mut engine, _) = engine_at(local(17, 10, 0));
        let mut allow = block("docs.example.com");
        allow.kind = Some(MatchType::Exact);
        allow.allow = true;
        engine.add_rule(allow).unwrap();
        engine.save_settings(json!({ "allowlistMode": true }), None).unwrap();

        assert!(matches!(
            engine.navigate("https://docs.example.com/").unwrap(),
            Verdict::Allowed { .. }
        ));
        match engine.navigate("https://other.com/").unwrap() {
            Verdict::Redirect { directive_id, location } => {
                assert_eq!(directive_id, CATCH_ALL_ID);
                assert!(location.contains("rid=__catchall__"));
            }
            other => panic!("expected redirect, got {other:?}"),
        }
    }

    #[test]
    fn temporary_allow_suspends_until_restore() {
        let (mut engine, _) = engine_at(local(17, 10, 0));
        let rule = engine.add_rule(block("example.com")).unwrap();

        let grant = engine.temporary_allow(&rule.id, "https://example.com/a").unwrap();
        assert_eq!(grant.restore_in_seconds, 15);
        assert!(!redirected(&mut engine, "https://example.com/a"));

        // A scheduled pass inside the grace window keeps it suspended.
        engine.reconcile("alarm").unwrap();
        assert!(!redirected(&mut engine, "https://example.com/a"));

        engine.restore(&rule.id).unwrap();
        assert!(redirected(&mut engine, "https://example.com/a"));
    }

    #[test]
    fn removing_rule_cancels_restoration() {
        let (mut engine, _) = engine_at(local(17, 10, 0));
        let rule = engine.add_rule(block("example.com")).unwrap();
        engine.temporary_allow(&rule.id, "https://example.com").unwrap();
        engine.remove_rule(&rule.id).unwrap();
        assert!(engine.suspended.is_empty());
        engine.restore(&rule.id).unwrap();
        assert!(engine.directives().unwrap().is_empty());
    }

    #[test]
    fn temporary_allow_unknown_rule_is_not_found() {
        let (mut engine, _) = engine_at(local(17, 10, 0));
        assert!(matches!(
            engine.temporary_allow("r_missing", "https://x.com"),
            Err(PolicyError::NotFound(_))
        ));
    }

    #[test]
    fn update_rule_merges_and_keeps_id() {
        let (mut engine, _) = engine_at(local(17, 10, 0));
        let rule = engine.add_rule(block("example.com")).unwrap();
        let updated = engine
            .update_rule(json!({ "id": rule.id, "pattern": "other.com", "notes": "moved" }))
            .unwrap();
        assert_eq!(updated.id, rule.id);
        assert_eq!(updated.pattern, "other.com");
        assert_eq!(updated.notes.as_deref(), Some("moved"));
        assert!(redirected(&mut engine, "https://other.com"));
        assert!(!redirected(&mut engine, "https://example.com"));

        assert!(matches!(
            engine.update_rule(json!({ "id": "nope" })),
            Err(PolicyError::NotFound(_))
        ));
        assert!(matches!(
            engine.update_rule(json!({ "id": rule.id, "type": "regex", "pattern": "(" })),
            Err(PolicyError::InvalidRegex(_))
        ));
    }

    #[test]
    fn invalid_rule_changes_nothing() {
        let (mut engine, _) = engine_at(local(17, 10, 0));
        let mut bad = block("(");
        bad.kind = Some(MatchType::Regex);
        assert!(matches!(engine.add_rule(bad), Err(PolicyError::InvalidRegex(_))));
        assert!(matches!(engine.add_rule(block("  ")), Err(PolicyError::MissingPattern)));
        assert!(engine.get_settings().settings.rules.is_empty());
    }

    #[test]
    fn test_match_skips_allow_rules() {
        let (mut engine, _) = engine_at(local(17, 10, 0));
        let mut allow = block("example.com");
        allow.allow = true;
        engine.add_rule(allow).unwrap();
        let blocker = engine.add_rule(block("*.example.com")).unwrap();

        let hit = engine.test_match("https://www.example.com").unwrap();
        assert_eq!(hit.map(|r| r.id), Some(blocker.id));
        assert_eq!(engine.test_match("https://example.org").unwrap(), None);
        assert!(matches!(
            engine.test_match("example.com"),
            Err(PolicyError::InvalidUrl(_))
        ));
    }

    #[test]
    fn pin_gates_settings_changes() {
        let (mut engine, _) = engine_at(local(17, 10, 0));
        engine.set_pin("2468", None).unwrap();
        engine
            .save_settings(json!({ "requirePinForChanges": true }), None)
            .unwrap();

        assert!(matches!(
            engine.save_settings(json!({ "enabled": false }), None),
            Err(PolicyError::PinRequired)
        ));
        assert!(matches!(
            engine.save_settings(json!({ "enabled": false }), Some("0000")),
            Err(PolicyError::InvalidPin)
        ));
        assert!(engine.get_settings().settings.enabled);

        engine
            .save_settings(json!({ "enabled": false }), Some("2468"))
            .unwrap();
        assert!(!engine.get_settings().settings.enabled);

        assert!(matches!(engine.set_pin("1111", None), Err(PolicyError::PinRequired)));
        engine.set_pin("1111", Some("2468")).unwrap();
    }

    #[test]
    fn add_current_site_blocks_host_and_subdomains() {
        let (mut engine, _) = engine_at(local(17, 10, 0));
        let rule = engine.add_current_site("https://Www.Reddit.com/r/rust").unwrap();
        assert_eq!(rule.pattern, "www.reddit.com");
        assert!(redirected(&mut engine, "https://www.reddit.com/"));

        let again = engine.add_current_site("https://www.reddit.com/r/other").unwrap();
        assert_eq!(again.id, rule.id);
        assert_eq!(engine.get_settings().settings.rules.len(), 1);
        assert!(matches!(
            engine.add_current_site("about:blank"),
            Err(PolicyError::InvalidUrl(_))
        ));
    }

    #[test]
    fn import_replaces_policy() {
        let (mut engine, _) = engine_at(local(17, 10, 0));
        engine.add_rule(block("old.com")).unwrap();
        let policy = PolicyExport {
            enabled: true,
            allowlist_mode: false,
            default_block_mode: None,
            rules: vec![Rule::new("r_new", "new.com", MatchType::Wildcard)],
        };
        engine.import_policy(policy.clone(), None).unwrap();
        assert_eq!(engine.export_policy().rules, policy.rules);
        assert!(redirected(&mut engine, "https://new.com"));
        assert!(!redirected(&mut engine, "https://old.com"));
    }

    #[test]
    fn diff_reports_only_changes() {
        let compiler = RuleCompiler::new(config().interstitial);
        let a = compiler.compile(&Rule::new("a", "a.com", MatchType::Exact), 10);
        let b = compiler.compile(&Rule::new("b", "b.com", MatchType::Exact), 10);
        let b2 = compiler.compile(&Rule::new("b", "b2.com", MatchType::Exact), 10);

        assert!(diff(&[a.clone(), b.clone()], &[a.clone(), b.clone()]).is_empty());
        let delta = diff(&[a.clone(), b.clone()], &[a, b2.clone()]);
        assert_eq!(delta.remove, vec![b.id]);
        assert_eq!(delta.add, vec![b2]);
    }

    struct BrokenLayer;

    impl InterceptionLayer for BrokenLayer {
        fn installed(&mut self) -> Result<Vec<Directive>> {
            Ok(Vec::new())
        }

        fn replace(&mut self, _remove_ids: &[u32], _add: &[Directive]) -> Result<()> {
            Err(PolicyError::Interception("rule quota exceeded".to_string()))
        }
    }

    #[test]
    fn interception_failure_fails_the_pass_but_keeps_timer() {
        let mut engine = Engine::new(
            SqliteSettingsStore::in_memory(None).unwrap(),
            BrokenLayer,
            config(),
        );
        let err = engine.add_rule(block("example.com")).unwrap_err();
        assert_eq!(err.code(), "interception_error");
        assert!(engine.next_pass_at.is_some());
    }

    #[tokio::test]
    async fn actor_serializes_commands() {
        let engine = Engine::new(
            SqliteSettingsStore::in_memory(None).unwrap(),
            SqliteDirectiveTable::in_memory().unwrap(),
            config(),
        );
        let (handle, task) = engine.spawn(16);

        let rule = handle.add_rule(block("example.com")).await.unwrap();
        let verdict = handle.navigate("https://example.com".to_string()).await.unwrap();
        assert!(matches!(verdict, Verdict::Redirect { .. }));

        handle.remove_rule(rule.id.clone()).await.unwrap();
        assert!(matches!(
            handle.remove_rule(rule.id).await,
            Err(PolicyError::NotFound(_))
        ));

        drop(handle);
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn restoration_timer_reinstalls_rule() {
        let engine = Engine::new(
            SqliteSettingsStore::in_memory(None).unwrap(),
            SqliteDirectiveTable::in_memory().unwrap(),
            config(),
        );
        let (handle, _task) = engine.spawn(16);
        let rule = handle.add_rule(block("example.com")).await.unwrap();

        handle
            .temporary_allow(rule.id.clone(), "https://example.com".to_string())
            .await
            .unwrap();
        assert!(handle.directives().await.unwrap().is_empty());

        tokio::time::sleep(Duration::from_secs(16)).await;
        assert_eq!(handle.directives().await.unwrap().len(), 1);
    }
}
