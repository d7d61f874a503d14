//! Installed directive table and per-navigation evaluation.
//!
//! `InterceptionLayer` is the seam the engine writes through. The SQLite
//! table below is the daemon's copy; the browser shim polls it and mirrors
//! it into the browser's own request-rule store.

use crate::compiler::{Action, Directive, QueryTransform, UrlTransform};
use crate::error::{PolicyError, Result};
use rusqlite::Connection;
use serde::Serialize;
use std::collections::HashSet;
use std::path::Path;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use url::Url;

pub trait InterceptionLayer {
    /// Every directive currently installed, ordered by id.
    fn installed(&mut self) -> Result<Vec<Directive>>;

    /// Removes `remove_ids` and installs `add` as one atomic step. An id both
    /// removed and added ends up replaced.
    fn replace(&mut self, remove_ids: &[u32], add: &[Directive]) -> Result<()>;
}

pub struct SqliteDirectiveTable {
    conn: Connection,
}

impl SqliteDirectiveTable {
    pub fn open(path: &Path) -> Result<Self> {
        Self::with_connection(Connection::open(path)?)
    }

    pub fn in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS installed_directives (
  id INTEGER PRIMARY KEY,
  priority INTEGER NOT NULL,
  directive_json TEXT NOT NULL,
  installed_at TEXT NOT NULL
);
"#,
        )?;
        Ok(Self { conn })
    }
}

impl InterceptionLayer for SqliteDirectiveTable {
    fn installed(&mut self) -> Result<Vec<Directive>> {
        let mut stmt = self
            .conn
            .prepare("SELECT directive_json FROM installed_directives ORDER BY id")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut out = Vec::new();
        for r in rows {
            let json = r?;
            let directive: Directive = serde_json::from_str(&json)
                .map_err(|e| PolicyError::Interception(format!("corrupt directive row: {e}")))?;
            out.push(directive);
        }
        Ok(out)
    }

    fn replace(&mut self, remove_ids: &[u32], add: &[Directive]) -> Result<()> {
        let mut seen = HashSet::new();
        for d in add {
            if !seen.insert(d.id) {
                return Err(PolicyError::Interception(format!(
                    "duplicate directive id {} in one update",
                    d.id
                )));
            }
        }

        let installed_at = OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default();
        let tx = self
            .conn
            .transaction()
            .map_err(|e| PolicyError::Interception(e.to_string()))?;
        {
            let mut delete = tx
                .prepare("DELETE FROM installed_directives WHERE id = ?1")
                .map_err(|e| PolicyError::Interception(e.to_string()))?;
            for id in remove_ids {
                delete
                    .execute([id])
                    .map_err(|e| PolicyError::Interception(e.to_string()))?;
            }

            let mut insert = tx
                .prepare(
                    r#"
INSERT INTO installed_directives (id, priority, directive_json, installed_at)
VALUES (?1, ?2, ?3, ?4)
ON CONFLICT(id) DO UPDATE SET
  priority=excluded.priority,
  directive_json=excluded.directive_json,
  installed_at=excluded.installed_at
"#,
                )
                .map_err(|e| PolicyError::Interception(e.to_string()))?;
            for d in add {
                let json = serde_json::to_string(d)?;
                insert
                    .execute((d.id, d.priority, json, &installed_at))
                    .map_err(|e| PolicyError::Interception(e.to_string()))?;
            }
        }
        tx.commit()
            .map_err(|e| PolicyError::Interception(e.to_string()))
    }
}

/// What the browser should do with a top-level navigation.
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    /// No directive matched.
    Proceed,
    /// An allow directive won.
    Allowed { directive_id: u32 },
    /// A redirect directive won; `location` is the final interstitial URL.
    Redirect { directive_id: u32, location: String },
}

/// Picks the winning directive for `url`: highest priority first, and at
/// equal priority an allow beats a redirect.
pub fn evaluate(directives: &[Directive], url: &str) -> Verdict {
    let winner = directives
        .iter()
        .filter(|d| directive_matches(d, url))
        .max_by_key(|d| (d.priority, matches!(d.action, Action::Allow)));

    match winner {
        None => Verdict::Proceed,
        Some(d) => match &d.action {
            Action::Allow => Verdict::Allowed { directive_id: d.id },
            Action::Redirect { redirect } => Verdict::Redirect {
                directive_id: d.id,
                location: apply_transform(&redirect.url, redirect.transform.as_ref(), url),
            },
        },
    }
}

fn directive_matches(d: &Directive, url: &str) -> bool {
    if let Some(filter) = &d.condition.url_filter {
        return url_filter_matches(filter, url);
    }
    if let Some(pattern) = &d.condition.regex_filter {
        return regex_lite::Regex::new(pattern).is_ok_and(|re| re.is_match(url));
    }
    false
}

/// Subset of the declarative filter syntax the compiler emits: `||host`
/// (host anchor, covers subdomains), `|prefix` (start anchor), and plain
/// substrings. Matching is case-insensitive.
fn url_filter_matches(filter: &str, url: &str) -> bool {
    let url_lc = url.to_ascii_lowercase();
    let filter = filter.to_ascii_lowercase();

    if let Some(rest) = filter.strip_prefix("||") {
        let Ok(parsed) = Url::parse(url) else {
            return false;
        };
        let Some(host) = parsed.host_str() else {
            return false;
        };
        let (domain, path) = match rest.split_once('/') {
            Some((domain, path)) => (domain, Some(path)),
            None => (rest, None),
        };
        let host_ok = host == domain || host.ends_with(&format!(".{domain}"));
        return host_ok && path.map_or(true, |p| url_lc.contains(&format!("/{p}")));
    }
    if let Some(prefix) = filter.strip_prefix('|') {
        return url_lc.starts_with(prefix);
    }
    url_lc.contains(&filter)
}

fn apply_transform(target: &str, transform: Option<&UrlTransform>, request_url: &str) -> String {
    let Some(UrlTransform {
        query_transform: QueryTransform { add_or_replace_params },
    }) = transform
    else {
        return target.to_string();
    };
    let Ok(mut location) = Url::parse(target) else {
        return target.to_string();
    };

    let replaced: HashSet<&str> = add_or_replace_params.iter().map(|p| p.key.as_str()).collect();
    let kept: Vec<(String, String)> = location
        .query_pairs()
        .filter(|(k, _)| !replaced.contains(k.as_ref()))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    {
        let mut pairs = location.query_pairs_mut();
        pairs.clear();
        for (k, v) in &kept {
            pairs.append_pair(k, v);
        }
        for p in add_or_replace_params {
            pairs.append_pair(&p.key, &p.value.replace("{url}", request_url));
        }
    }
    location.to_string()
}
