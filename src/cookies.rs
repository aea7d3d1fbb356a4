use std::collections::BTreeMap;

use http::HeaderMap;
use http::header::{HeaderValue, SET_COOKIE};
use serde_json::Value;
use url::Url;

/// Hosts a cookie is sent to.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum Scope {
    /// Set by hand or loaded from a store: every host.
    Any,
    /// Captured without a `Domain` attribute: the setting host only.
    Host(String),
    /// Captured with a `Domain` attribute: that domain and its subdomains.
    Domain(String),
}

impl Scope {
    fn matches(&self, host: Option<&str>) -> bool {
        match (self, host) {
            (Scope::Any, _) => true,
            (_, None) => false,
            (Scope::Host(scope), Some(host)) => scope == host,
            (Scope::Domain(scope), Some(host)) => domain_matches(host, scope),
        }
    }
}

fn domain_matches(host: &str, domain: &str) -> bool {
    host == domain
        || host
            .strip_suffix(domain)
            .is_some_and(|prefix| prefix.ends_with('.'))
}

fn request_host(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    Some(parsed.host_str()?.trim_end_matches('.').to_ascii_lowercase())
}

/// Cookies of a session, scoped by host.
///
/// Cookies captured from a response are only sent back to the host that
/// set them, or to the domain named by their `Domain` attribute. Cookies set
/// by hand or loaded with [`CookieJar::from_json`] go to every host. Paths
/// and expiry dates are not tracked; `Max-Age=0` removes a cookie.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CookieJar {
    cookies: BTreeMap<(Scope, String), String>,
}

impl CookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Value of the first cookie called `name`, whatever its scope.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.cookies
            .iter()
            .find(|((_, cookie), _)| cookie == name)
            .map(|(_, value)| value.as_str())
    }

    /// Adds a cookie sent to every host.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.cookies.insert((Scope::Any, name.into()), value.into());
    }

    /// Adds a cookie sent to `domain` and its subdomains.
    pub fn insert_for_domain(
        &mut self,
        domain: &str,
        name: impl Into<String>,
        value: impl Into<String>,
    ) {
        let domain = domain.trim_start_matches('.').to_ascii_lowercase();
        self.cookies
            .insert((Scope::Domain(domain), name.into()), value.into());
    }

    /// Removes every cookie called `name`.
    pub fn remove(&mut self, name: &str) {
        self.cookies.retain(|(_, cookie), _| cookie != name);
    }

    pub fn len(&self) -> usize {
        self.cookies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }

    pub fn clear(&mut self) {
        self.cookies.clear();
    }

    /// Applies every `Set-Cookie` header of a response to `request_url`.
    ///
    /// A `Domain` attribute that does not cover the request host drops the
    /// cookie.
    pub fn store_response_cookies(&mut self, request_url: &str, headers: &HeaderMap) {
        let Some(host) = request_host(request_url) else {
            return;
        };
        for value in headers.get_all(SET_COOKIE) {
            let Ok(text) = value.to_str() else {
                continue;
            };
            let mut parts = text.split(';');
            let Some((name, value)) = parts.next().and_then(|pair| pair.split_once('=')) else {
                continue;
            };
            let name = name.trim();
            if name.is_empty() {
                continue;
            }

            let mut expired = false;
            let mut domain = None;
            for attribute in parts {
                let Some((key, attribute_value)) = attribute.split_once('=') else {
                    continue;
                };
                let (key, attribute_value) = (key.trim(), attribute_value.trim());
                if key.eq_ignore_ascii_case("max-age") {
                    expired = attribute_value.parse::<i64>().is_ok_and(|age| age <= 0);
                } else if key.eq_ignore_ascii_case("domain") && !attribute_value.is_empty() {
                    domain = Some(attribute_value.trim_start_matches('.').to_ascii_lowercase());
                }
            }

            let scope = match domain {
                Some(domain) if domain_matches(&host, &domain) => Scope::Domain(domain),
                Some(_) => continue,
                None => Scope::Host(host.clone()),
            };
            let key = (scope, name.to_owned());
            if expired {
                self.cookies.remove(&key);
            } else {
                self.cookies
                    .insert(key, value.trim().trim_matches('"').to_owned());
            }
        }
    }

    /// `Cookie` request header for `url`, `None` when no cookie applies.
    pub fn header_value(&self, url: &str) -> Option<HeaderValue> {
        let host = request_host(url);
        let joined = self
            .cookies
            .iter()
            .filter(|((scope, _), _)| scope.matches(host.as_deref()))
            .map(|((_, name), value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join("; ");
        if joined.is_empty() {
            return None;
        }
        HeaderValue::from_str(&joined).ok()
    }

    /// Flat `name -> value` object; scopes are not persisted, so reloaded
    /// cookies go to every host.
    pub fn to_json(&self) -> Value {
        Value::Object(
            self.cookies
                .iter()
                .map(|((_, name), value)| (name.clone(), Value::String(value.clone())))
                .collect(),
        )
    }

    /// Loads the object written by [`CookieJar::to_json`]; anything else
    /// yields an empty jar.
    pub fn from_json(value: &Value) -> Self {
        let cookies = value
            .as_object()
            .map(|object| {
                object
                    .iter()
                    .filter_map(|(name, value)| {
                        Some(((Scope::Any, name.clone()), value.as_str()?.to_owned()))
                    })
                    .collect()
            })
            .unwrap_or_default();
        Self { cookies }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SITE: &str = "https://api.example.com/v1/items";

    fn set_cookies(values: &[&'static str]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for value in values {
            headers.append(SET_COOKIE, HeaderValue::from_static(value));
        }
        headers
    }

    #[test]
    fn set_cookie_headers_update_the_jar() {
        let mut jar = CookieJar::new();
        jar.store_response_cookies(
            SITE,
            &set_cookies(&["session=abc123; Path=/; HttpOnly", "theme=\"dark\""]),
        );
        assert_eq!(jar.get("session"), Some("abc123"));
        assert_eq!(jar.get("theme"), Some("dark"));
        assert_eq!(
            jar.header_value("https://api.example.com/other"),
            Some(HeaderValue::from_static("session=abc123; theme=dark"))
        );
    }

    #[test]
    fn captured_cookies_stay_with_their_host() {
        let mut jar = CookieJar::new();
        jar.store_response_cookies(SITE, &set_cookies(&["session=secret"]));
        jar.insert("global", "1");

        assert_eq!(
            jar.header_value("https://cdn.example.net/a.js"),
            Some(HeaderValue::from_static("global=1"))
        );
        assert_eq!(
            jar.header_value("https://www.api.example.com/"),
            Some(HeaderValue::from_static("global=1"))
        );
        assert_eq!(
            jar.header_value("http://API.example.com:8080/"),
            Some(HeaderValue::from_static("global=1; session=secret"))
        );
    }

    #[test]
    fn domain_attribute_covers_subdomains() {
        let mut jar = CookieJar::new();
        jar.store_response_cookies(
            SITE,
            &set_cookies(&["wide=1; Domain=.example.com", "foreign=1; Domain=example.org"]),
        );
        assert_eq!(jar.len(), 1);
        assert_eq!(
            jar.header_value("https://static.example.com/"),
            Some(HeaderValue::from_static("wide=1"))
        );
        assert_eq!(jar.header_value("https://badexample.com/"), None);
        assert_eq!(jar.header_value("not a url"), None);
    }

    #[test]
    fn max_age_zero_deletes_cookie() {
        let mut jar = CookieJar::new();
        jar.store_response_cookies(SITE, &set_cookies(&["session=abc123"]));
        jar.store_response_cookies(SITE, &set_cookies(&["session=; Max-Age=0"]));
        assert!(jar.is_empty());
        assert_eq!(jar.header_value(SITE), None);
    }

    #[test]
    fn json_form_round_trips_and_ignores_junk() {
        let mut jar = CookieJar::new();
        jar.insert("a", "1");
        assert_eq!(CookieJar::from_json(&jar.to_json()), jar);
        assert!(CookieJar::from_json(&serde_json::json!(["a"])).is_empty());
        let mixed = CookieJar::from_json(&serde_json::json!({ "a": "1", "b": 2 }));
        assert_eq!(mixed.len(), 1);
        assert_eq!(
            mixed.header_value("https://anywhere.example/"),
            Some(HeaderValue::from_static("a=1"))
        );
    }
}
