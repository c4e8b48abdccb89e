//! Coherent browser identity generation.
//!
//! Every header in an [`Identity`] derives from a single browser profile so
//! the combination is never internally contradictory (a Chrome user-agent
//! with Firefox accept headers is a known detection signal). Identities are
//! value objects: rotation replaces them wholesale, never mutates one in
//! place.

use chrono::{DateTime, Utc};
use http::{HeaderName, HeaderValue};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("profile set is empty")]
    EmptyProfileSet,
    #[error("profile `{0}` carries no user agents")]
    NoUserAgents(String),
    #[error("invalid header in profile `{profile}`: {reason}")]
    InvalidHeader { profile: String, reason: String },
    #[error("failed to parse profile set: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("failed to read profile set: {0}")]
    Io(#[from] std::io::Error),
}

/// One complete request fingerprint bound to a session.
///
/// The header set is ordered the way a real browser emits it; cosmetic
/// headers may be appended in randomized order but the set itself is fixed
/// once generated.
#[derive(Debug, Clone)]
pub struct Identity {
    pub user_agent: String,
    pub headers: Vec<(HeaderName, HeaderValue)>,
    pub created_at: DateTime<Utc>,
    pub requests_served: u64,
}

impl Identity {
    pub fn header_map(&self) -> http::HeaderMap {
        let mut map = http::HeaderMap::new();
        for (name, value) in &self.headers {
            map.insert(name.clone(), value.clone());
        }
        map
    }
}

/// Declarative browser profile: one of these drives an entire identity.
#[derive(Debug, Clone, Deserialize)]
pub struct BrowserProfile {
    pub user_agents: Vec<String>,
    pub accept: String,
    pub accept_encoding: String,
    pub accept_languages: Vec<String>,
    /// Chromium-family client hints (sec-ch-ua etc.), absent for Gecko/WebKit.
    #[serde(default)]
    pub client_hints: HashMap<String, String>,
    /// Whether the browser sends the sec-fetch-* navigation family.
    #[serde(default)]
    pub sec_fetch: bool,
}

/// A named collection of browser profiles.
///
/// The embedded default set covers the current Chrome/Firefox/Safari/Edge
/// stable lines; a custom set can be loaded from JSON with the same shape.
#[derive(Debug, Clone, Deserialize)]
pub struct ProfileSet {
    pub profiles: HashMap<String, BrowserProfile>,
}

impl ProfileSet {
    pub fn from_json_str(data: &str) -> Result<Self, IdentityError> {
        let set: ProfileSet = serde_json::from_str(data)?;
        if set.profiles.is_empty() {
            return Err(IdentityError::EmptyProfileSet);
        }
        Ok(set)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, IdentityError> {
        let data = std::fs::read_to_string(path)?;
        Self::from_json_str(&data)
    }
}

impl Default for ProfileSet {
    fn default() -> Self {
        let mut profiles = HashMap::new();

        profiles.insert(
            "chrome".to_string(),
            BrowserProfile {
                user_agents: vec![
                    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36".into(),
                    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/119.0.0.0 Safari/537.36".into(),
                    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36".into(),
                    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36".into(),
                ],
                accept: "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,image/apng,*/*;q=0.8,application/signed-exchange;v=b3;q=0.7".into(),
                accept_encoding: "gzip, deflate, br".into(),
                accept_languages: vec![
                    "en-US,en;q=0.9".into(),
                    "en-GB,en-US;q=0.9,en;q=0.8".into(),
                    "en-US,en;q=0.9,es;q=0.8".into(),
                ],
                client_hints: HashMap::from([
                    ("sec-ch-ua".to_string(), "\"Not_A Brand\";v=\"8\", \"Chromium\";v=\"120\", \"Google Chrome\";v=\"120\"".to_string()),
                    ("sec-ch-ua-mobile".to_string(), "?0".to_string()),
                    ("sec-ch-ua-platform".to_string(), "\"Windows\"".to_string()),
                ]),
                sec_fetch: true,
            },
        );

        profiles.insert(
            "firefox".to_string(),
            BrowserProfile {
                user_agents: vec![
                    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:120.0) Gecko/20100101 Firefox/120.0".into(),
                    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10.15; rv:120.0) Gecko/20100101 Firefox/120.0".into(),
                    "Mozilla/5.0 (X11; Linux x86_64; rv:120.0) Gecko/20100101 Firefox/120.0".into(),
                ],
                accept: "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8".into(),
                accept_encoding: "gzip, deflate, br".into(),
                accept_languages: vec![
                    "en-US,en;q=0.5".into(),
                    "en-GB,en;q=0.5".into(),
                    "en-US,en;q=0.5,es;q=0.3".into(),
                ],
                client_hints: HashMap::new(),
                sec_fetch: false,
            },
        );

        profiles.insert(
            "safari".to_string(),
            BrowserProfile {
                user_agents: vec![
                    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.1 Safari/605.1.15".into(),
                    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/16.6 Safari/605.1.15".into(),
                ],
                accept: "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8".into(),
                accept_encoding: "gzip, deflate, br".into(),
                accept_languages: vec![
                    "en-US,en;q=0.9".into(),
                    "en-GB,en-US;q=0.9,en;q=0.8".into(),
                ],
                client_hints: HashMap::new(),
                sec_fetch: false,
            },
        );

        profiles.insert(
            "edge".to_string(),
            BrowserProfile {
                user_agents: vec![
                    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36 Edg/120.0.0.0".into(),
                ],
                accept: "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,image/apng,*/*;q=0.8,application/signed-exchange;v=b3;q=0.7".into(),
                accept_encoding: "gzip, deflate, br".into(),
                accept_languages: vec![
                    "en-US,en;q=0.9".into(),
                    "en-GB,en-US;q=0.9,en;q=0.8".into(),
                ],
                client_hints: HashMap::from([
                    ("sec-ch-ua".to_string(), "\"Not_A Brand\";v=\"8\", \"Chromium\";v=\"120\", \"Microsoft Edge\";v=\"120\"".to_string()),
                    ("sec-ch-ua-mobile".to_string(), "?0".to_string()),
                    ("sec-ch-ua-platform".to_string(), "\"Windows\"".to_string()),
                ]),
                sec_fetch: true,
            },
        );

        Self { profiles }
    }
}

/// Produces fresh identities, one coherent profile per call.
#[derive(Debug, Clone)]
pub struct IdentityGenerator {
    profiles: ProfileSet,
}

impl IdentityGenerator {
    pub fn new() -> Self {
        Self {
            profiles: ProfileSet::default(),
        }
    }

    pub fn with_profiles(profiles: ProfileSet) -> Result<Self, IdentityError> {
        if profiles.profiles.is_empty() {
            return Err(IdentityError::EmptyProfileSet);
        }
        Ok(Self { profiles })
    }

    /// Generate a complete identity from a single randomly chosen profile.
    pub fn generate(&self) -> Result<Identity, IdentityError> {
        let mut rng = rand::thread_rng();

        let names: Vec<&String> = self.profiles.profiles.keys().collect();
        let name = names
            .choose(&mut rng)
            .copied()
            .ok_or(IdentityError::EmptyProfileSet)?;
        let profile = &self.profiles.profiles[name];

        let user_agent = profile
            .user_agents
            .choose(&mut rng)
            .cloned()
            .ok_or_else(|| IdentityError::NoUserAgents(name.clone()))?;
        let language = profile
            .accept_languages
            .choose(&mut rng)
            .cloned()
            .unwrap_or_else(|| "en-US,en;q=0.9".into());

        let mut headers: Vec<(HeaderName, HeaderValue)> = Vec::new();
        push_header(&mut headers, name, "user-agent", &user_agent)?;
        push_header(&mut headers, name, "accept", &profile.accept)?;
        push_header(&mut headers, name, "accept-language", &language)?;
        push_header(&mut headers, name, "accept-encoding", &profile.accept_encoding)?;
        push_header(&mut headers, name, "connection", "keep-alive")?;
        push_header(&mut headers, name, "upgrade-insecure-requests", "1")?;

        for (hint, value) in &profile.client_hints {
            push_header(&mut headers, name, hint, value)?;
        }

        if profile.sec_fetch {
            push_header(&mut headers, name, "sec-fetch-dest", "document")?;
            push_header(&mut headers, name, "sec-fetch-mode", "navigate")?;
            push_header(&mut headers, name, "sec-fetch-site", "none")?;
            push_header(&mut headers, name, "sec-fetch-user", "?1")?;
        }

        // Cosmetic headers appear with the probabilities real traffic shows,
        // in randomized order.
        let mut cosmetic: Vec<(&str, String)> = Vec::new();
        if rng.gen_bool(0.7) {
            cosmetic.push(("dnt", "1".into()));
        }
        if rng.gen_bool(0.6) {
            let referer = [
                "https://www.google.com/",
                "https://www.bing.com/",
                "https://duckduckgo.com/",
            ]
            .choose(&mut rng)
            .unwrap();
            cosmetic.push(("referer", (*referer).into()));
        }
        if rng.gen_bool(0.5) {
            let cache = ["no-cache", "max-age=0"].choose(&mut rng).unwrap();
            cosmetic.push(("cache-control", (*cache).into()));
        }
        cosmetic.shuffle(&mut rng);
        for (header, value) in cosmetic {
            push_header(&mut headers, name, header, &value)?;
        }

        Ok(Identity {
            user_agent,
            headers,
            created_at: Utc::now(),
            requests_served: 0,
        })
    }
}

impl Default for IdentityGenerator {
    fn default() -> Self {
        Self::new()
    }
}

fn push_header(
    headers: &mut Vec<(HeaderName, HeaderValue)>,
    profile: &str,
    name: &str,
    value: &str,
) -> Result<(), IdentityError> {
    let name = HeaderName::from_bytes(name.as_bytes()).map_err(|err| {
        IdentityError::InvalidHeader {
            profile: profile.to_string(),
            reason: err.to_string(),
        }
    })?;
    let value = HeaderValue::from_str(value).map_err(|err| IdentityError::InvalidHeader {
        profile: profile.to_string(),
        reason: err.to_string(),
    })?;
    headers.push((name, value));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header<'a>(identity: &'a Identity, name: &str) -> Option<&'a str> {
        identity
            .headers
            .iter()
            .find(|(n, _)| n.as_str() == name)
            .and_then(|(_, v)| v.to_str().ok())
    }

    #[test]
    fn headers_match_the_chosen_profile() {
        let generator = IdentityGenerator::new();
        for _ in 0..50 {
            let identity = generator.generate().unwrap();
            let ua = &identity.user_agent;
            let has_hints = header(&identity, "sec-ch-ua").is_some();

            if ua.contains("Firefox") || ua.contains("Version/") {
                // Gecko and WebKit never send Chromium client hints.
                assert!(!has_hints, "client hints on non-Chromium UA: {ua}");
            } else {
                assert!(has_hints, "missing client hints on Chromium UA: {ua}");
            }
            assert_eq!(header(&identity, "user-agent"), Some(ua.as_str()));
            assert!(header(&identity, "accept").is_some());
            assert!(header(&identity, "accept-encoding").is_some());
        }
    }

    #[test]
    fn identities_are_regenerated_wholesale() {
        let generator = IdentityGenerator::new();
        let first = generator.generate().unwrap();
        let second = generator.generate().unwrap();
        assert_eq!(first.requests_served, 0);
        assert_eq!(second.requests_served, 0);
        // created_at distinguishes replacements even if the roll repeats
        assert!(second.created_at >= first.created_at);
    }

    #[test]
    fn custom_profile_set_round_trips() {
        let json = r#"{
            "profiles": {
                "kiosk": {
                    "user_agents": ["TestBrowser/1.0"],
                    "accept": "*/*",
                    "accept_encoding": "gzip",
                    "accept_languages": ["en"]
                }
            }
        }"#;
        let set = ProfileSet::from_json_str(json).unwrap();
        let generator = IdentityGenerator::with_profiles(set).unwrap();
        let identity = generator.generate().unwrap();
        assert_eq!(identity.user_agent, "TestBrowser/1.0");
        assert!(header(&identity, "sec-fetch-dest").is_none());
    }

    #[test]
    fn empty_profile_set_is_rejected() {
        assert!(ProfileSet::from_json_str(r#"{"profiles": {}}"#).is_err());
    }
}
