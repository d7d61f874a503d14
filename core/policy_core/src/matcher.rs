//! URL / hostname matching for policy rules.

use crate::model::{MatchType, Rule};
use url::{Host, Url};

/// Whether `url` is caught by `rule`. Unparseable or relative URLs never match.
pub fn matches(url: &str, rule: &Rule) -> bool {
    let Ok(parsed) = Url::parse(url) else {
        return false;
    };

    match rule.kind {
        MatchType::Exact => parsed
            .host_str()
            .is_some_and(|host| host.eq_ignore_ascii_case(rule.pattern.trim())),
        MatchType::Wildcard => parsed
            .host_str()
            .is_some_and(|host| wildcard_matches(host, &rule.pattern)),
        MatchType::Regex => match regex_lite::Regex::new(&rule.pattern) {
            Ok(re) => re.is_match(url),
            Err(_) => false,
        },
    }
}

/// `*.example.com` needs at least one subdomain label; `example.com` matches
/// itself and every subdomain.
fn wildcard_matches(host: &str, pattern: &str) -> bool {
    let host = host.to_ascii_lowercase();
    let pattern = pattern.trim().to_ascii_lowercase();
    match pattern.strip_prefix("*.") {
        Some(base) => host.ends_with(&format!(".{base}")),
        None => host == pattern || host.ends_with(&format!(".{pattern}")),
    }
}

/// Bare lowercase hostname of a URL or of a rule pattern (scheme, `*.`,
/// path and port stripped).
pub fn hostname_of(url_or_pattern: &str) -> Option<String> {
    let input = url_or_pattern.trim();
    if let Ok(parsed) = Url::parse(input) {
        // "localhost:3000" parses with scheme "localhost" and no host; fall
        // through to pattern handling for those.
        if let Some(host) = parsed.host_str() {
            return Some(host.trim_end_matches('.').to_ascii_lowercase());
        }
    }

    let mut host = input.strip_prefix("*.").unwrap_or(input);
    if let Some((before, _)) = host.split_once('/') {
        host = before;
    }
    if let Some((before, _)) = host.split_once(':') {
        host = before;
    }
    let host = host.trim().to_ascii_lowercase();
    if host.is_empty() || Host::parse(&host).is_err() {
        return None;
    }
    Some(host)
}
