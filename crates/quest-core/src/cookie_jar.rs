//! RFC-6265-flavored cookie storage (spec §4.4).
//!
//! Grounded on the teacher's `ChainContext` (an indexed, run-scoped store
//! keyed by name) generalized with domain/path matching and lazy expiry
//! pruning per §9's "Cookie jar" design note.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// `SameSite` attribute values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SameSite {
    Strict,
    Lax,
    None,
}

/// A single stored cookie (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    pub path: String,
    pub expires: Option<DateTime<Utc>>,
    pub max_age: Option<i64>,
    #[serde(default)]
    pub secure: bool,
    #[serde(default)]
    pub http_only: bool,
    pub same_site: Option<SameSite>,
    pub created_at: DateTime<Utc>,
}

impl Cookie {
    /// Whether this cookie has expired as of `now`, by `Expires` or
    /// `Max-Age` (whichever is stricter).
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        if let Some(expires) = self.expires {
            if now >= expires {
                return true;
            }
        }
        if let Some(max_age) = self.max_age {
            if max_age <= 0 {
                return true;
            }
            let deadline = self.created_at + chrono::Duration::seconds(max_age);
            if now >= deadline {
                return true;
            }
        }
        false
    }
}

/// Options accepted by [`CookieJar::set`].
#[derive(Debug, Clone, Default)]
pub struct CookieSetOptions {
    pub domain: Option<String>,
    pub path: Option<String>,
    pub expires: Option<DateTime<Utc>>,
    pub max_age: Option<i64>,
    pub secure: bool,
    pub http_only: bool,
    pub same_site: Option<SameSite>,
}

/// Domain/path-aware cookie store (spec §4.4).
///
/// Keyed by `(domain, path, name)` per §9's design note; stored as an
/// `IndexMap` so iteration (`toObject`) is deterministic.
#[derive(Debug, Clone, Default)]
pub struct CookieJar {
    cookies: IndexMap<(String, String, String), Cookie>,
}

impl CookieJar {
    /// An empty jar.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a single cookie, keyed against the request URL's host/path
    /// when `domain`/`path` attributes are absent (ordinary `Set-Cookie`
    /// ingestion behavior).
    pub fn store_one(&mut self, mut cookie: Cookie, request_host: &str, request_path: &str) {
        if cookie.domain.is_empty() {
            cookie.domain = request_host.to_string();
        }
        if cookie.path.is_empty() {
            cookie.path = request_path.to_string();
        }
        let key = (cookie.domain.clone(), cookie.path.clone(), cookie.name.clone());
        self.cookies.insert(key, cookie);
    }

    /// Store every cookie parsed from one or more `Set-Cookie` header
    /// values. All values must be stored, including on error responses
    /// (spec §4.4).
    pub fn store_set_cookie_headers(&mut self, values: &[String], request_host: &str, request_path: &str) {
        for raw in values {
            if let Some(cookie) = parse_set_cookie(raw) {
                self.store_one(cookie, request_host, request_path);
            }
        }
    }

    /// Build the `Cookie:` header value for a request to `host`/`path`, or
    /// `None` if no unexpired cookie matches.
    pub fn get_cookie_header(&mut self, host: &str, path: &str, secure: bool) -> Option<String> {
        self.purge_expired();
        let mut matches: Vec<&Cookie> = self
            .cookies
            .values()
            .filter(|c| domain_matches(&c.domain, host) && path_matches(&c.path, path))
            .filter(|c| !c.secure || secure)
            .collect();
        if matches.is_empty() {
            return None;
        }
        // Longer paths first, matching common cookie-header ordering rules.
        matches.sort_by(|a, b| b.path.len().cmp(&a.path.len()));
        let header = matches.iter().map(|c| format!("{}={}", c.name, c.value)).collect::<Vec<_>>().join("; ");
        Some(header)
    }

    /// Get a cookie's value by name (first unexpired match, any domain/path).
    pub fn get(&mut self, name: &str) -> Option<String> {
        self.purge_expired();
        self.cookies.values().find(|c| c.name == name).map(|c| c.value.clone())
    }

    /// Whether an unexpired cookie named `name` exists.
    pub fn has(&mut self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Set a cookie directly (as from `quest.cookies.set`), defaulting
    /// domain/path to `"/"`/empty when not given by `options`.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>, options: CookieSetOptions) {
        let name = name.into();
        let domain = options.domain.unwrap_or_default();
        let path = options.path.unwrap_or_else(|| "/".to_string());
        let cookie = Cookie {
            name: name.clone(),
            value: value.into(),
            domain: domain.clone(),
            path: path.clone(),
            expires: options.expires,
            max_age: options.max_age,
            secure: options.secure,
            http_only: options.http_only,
            same_site: options.same_site,
            created_at: Utc::now(),
        };
        self.cookies.insert((domain, path, name), cookie);
    }

    /// Remove every cookie named `name`, regardless of domain/path.
    pub fn remove(&mut self, name: &str) {
        self.cookies.retain(|(_, _, n), _| n != name);
    }

    /// Empty the jar (used between requests when `persist: false`).
    pub fn clear(&mut self) {
        self.cookies.clear();
    }

    /// Snapshot of unexpired cookies as a flat `name -> value` map.
    pub fn to_object(&mut self) -> IndexMap<String, String> {
        self.purge_expired();
        self.cookies.values().map(|c| (c.name.clone(), c.value.clone())).collect()
    }

    /// Drop cookies that have expired as of now. Called lazily by readers
    /// (spec §4.4: "may be garbage-collected lazily").
    pub fn purge_expired(&mut self) {
        let now = Utc::now();
        self.cookies.retain(|_, c| !c.is_expired_at(now));
    }
}

/// Domain match per spec §4.4: exact match, or dotted-suffix match when the
/// cookie domain has a leading dot or the request host is `domain` or
/// `*.domain`.
fn domain_matches(cookie_domain: &str, request_host: &str) -> bool {
    if cookie_domain.is_empty() {
        return true;
    }
    let bare = cookie_domain.strip_prefix('.').unwrap_or(cookie_domain);
    if request_host.eq_ignore_ascii_case(bare) {
        return true;
    }
    if cookie_domain.starts_with('.') {
        return request_host.to_ascii_lowercase().ends_with(&format!(".{}", bare.to_ascii_lowercase()));
    }
    request_host.to_ascii_lowercase().ends_with(&format!(".{}", bare.to_ascii_lowercase()))
}

/// Path match per spec §4.4: exact match, or request path is `cookie.path`
/// followed by `/...`.
fn path_matches(cookie_path: &str, request_path: &str) -> bool {
    if cookie_path.is_empty() || cookie_path == "/" {
        return true;
    }
    if request_path == cookie_path {
        return true;
    }
    let prefix = if cookie_path.ends_with('/') { cookie_path.to_string() } else { format!("{}/", cookie_path) };
    request_path.starts_with(&prefix)
}

/// Parse a single `Set-Cookie` header value into a [`Cookie`] with no domain
/// or path yet resolved (callers default those from the request URL).
pub fn parse_set_cookie(raw: &str) -> Option<Cookie> {
    let mut parts = raw.split(';');
    let first = parts.next()?.trim();
    let (name, value) = first.split_once('=')?;
    let mut cookie = Cookie {
        name: name.trim().to_string(),
        value: value.trim().to_string(),
        domain: String::new(),
        path: String::new(),
        expires: None,
        max_age: None,
        secure: false,
        http_only: false,
        same_site: None,
        created_at: Utc::now(),
    };
    for attr in parts {
        let attr = attr.trim();
        if attr.is_empty() {
            continue;
        }
        let (key, value) = attr.split_once('=').map(|(k, v)| (k, Some(v))).unwrap_or((attr, None));
        match key.trim().to_ascii_lowercase().as_str() {
            "domain" => cookie.domain = value.unwrap_or_default().trim().to_string(),
            "path" => cookie.path = value.unwrap_or_default().trim().to_string(),
            "expires" => {
                cookie.expires = value.and_then(|v| DateTime::parse_from_rfc2822(v.trim()).ok()).map(|dt| dt.with_timezone(&Utc));
            }
            "max-age" => cookie.max_age = value.and_then(|v| v.trim().parse::<i64>().ok()),
            "secure" => cookie.secure = true,
            "httponly" => cookie.http_only = true,
            "samesite" => {
                cookie.same_site = value.map(|v| match v.trim().to_ascii_lowercase().as_str() {
                    "strict" => SameSite::Strict,
                    "none" => SameSite::None,
                    _ => SameSite::Lax,
                });
            }
            _ => {}
        }
    }
    Some(cookie)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_set_and_get() {
        let mut jar = CookieJar::new();
        jar.set("sessionId", "abc", CookieSetOptions::default());
        assert_eq!(jar.get("sessionId"), Some("abc".to_string()));
    }

    #[test]
    fn remove_then_has_is_false() {
        let mut jar = CookieJar::new();
        jar.set("sessionId", "abc", CookieSetOptions::default());
        jar.remove("sessionId");
        assert!(!jar.has("sessionId"));
    }

    #[test]
    fn cross_request_cookie_visibility() {
        let mut jar = CookieJar::new();
        jar.store_set_cookie_headers(&["sessionId=abc; Path=/".to_string()], "example.com", "/set");
        let header = jar.get_cookie_header("example.com", "/echo", false);
        assert_eq!(header, Some("sessionId=abc".to_string()));
    }

    #[test]
    fn dotted_suffix_domain_match() {
        let mut jar = CookieJar::new();
        jar.store_set_cookie_headers(&["a=1; Domain=.example.com".to_string()], "example.com", "/");
        assert_eq!(jar.get_cookie_header("api.example.com", "/", false), Some("a=1".to_string()));
    }

    #[test]
    fn expired_cookie_is_not_returned() {
        let mut jar = CookieJar::new();
        jar.set(
            "a",
            "1",
            CookieSetOptions { max_age: Some(-1), ..Default::default() },
        );
        assert!(jar.get("a").is_none());
    }

    #[test]
    fn multiple_set_cookie_values_all_stored() {
        let mut jar = CookieJar::new();
        jar.store_set_cookie_headers(
            &["a=1; Path=/".to_string(), "b=2; Path=/".to_string()],
            "example.com",
            "/",
        );
        let obj = jar.to_object();
        assert_eq!(obj.get("a"), Some(&"1".to_string()));
        assert_eq!(obj.get("b"), Some(&"2".to_string()));
    }

    #[test]
    fn clear_empties_jar() {
        let mut jar = CookieJar::new();
        jar.set("a", "1", CookieSetOptions::default());
        jar.clear();
        assert!(jar.to_object().is_empty());
    }
}
