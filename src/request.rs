use std::time::Duration;

use bytes::Bytes;
use http::header::{CONTENT_TYPE, HeaderName, HeaderValue};
use http::{HeaderMap, Method};
use serde::Serialize;

use crate::error::Error;
use crate::util::{append_query_pairs, parse_header_name, parse_header_value};

/// One HTTP exchange, before any rewrite rule has touched it.
///
/// Requests are plain values: a retrying session clones the request for every
/// attempt.
#[derive(Clone, Debug)]
pub struct TransportRequest {
    pub(crate) method: Method,
    pub(crate) url: String,
    pub(crate) query_pairs: Vec<(String, String)>,
    pub(crate) headers: HeaderMap,
    pub(crate) body: Bytes,
    pub(crate) timeout: Option<Duration>,
    pub(crate) verify: Option<bool>,
}

impl TransportRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            query_pairs: Vec::new(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
            timeout: None,
            verify: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::POST, url)
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body_bytes(&self) -> &Bytes {
        &self.body
    }

    /// URL with the query pairs appended, as it goes through rule matching.
    pub fn full_url(&self) -> String {
        append_query_pairs(&self.url, &self.query_pairs)
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn try_header(self, name: &str, value: &str) -> Result<Self, Error> {
        let name = parse_header_name(name)?;
        let value = parse_header_value(name.as_str(), value)?;
        Ok(self.header(name, value))
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn query_pair(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query_pairs.push((name.into(), value.into()));
        self
    }

    pub fn query_pairs<K, V, I>(mut self, pairs: I) -> Self
    where
        K: Into<String>,
        V: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        self.query_pairs.extend(
            pairs
                .into_iter()
                .map(|(name, value)| (name.into(), value.into())),
        );
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn json<T>(self, payload: &T) -> Result<Self, Error>
    where
        T: Serialize + ?Sized,
    {
        let body = serde_json::to_vec(payload).map_err(|source| Error::Serialize {
            what: "json body",
            source: Box::new(source),
        })?;
        Ok(self
            .body(body)
            .header(CONTENT_TYPE, HeaderValue::from_static("application/json")))
    }

    pub fn form<T>(self, payload: &T) -> Result<Self, Error>
    where
        T: Serialize + ?Sized,
    {
        let encoded = serde_urlencoded::to_string(payload).map_err(|source| Error::Serialize {
            what: "form body",
            source: Box::new(source),
        })?;
        Ok(self.body(encoded).header(
            CONTENT_TYPE,
            HeaderValue::from_static("application/x-www-form-urlencoded"),
        ))
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout.max(Duration::from_millis(1)));
        self
    }

    /// Overrides the session's certificate verification for this request.
    pub fn verify(mut self, verify: bool) -> Self {
        self.verify = Some(verify);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_pairs_are_appended_to_existing_query() {
        let request = TransportRequest::get("https://api.example.com/search?q=rust")
            .query_pair("page", "2")
            .query_pairs([("sort", "new")]);
        assert_eq!(
            request.full_url(),
            "https://api.example.com/search?q=rust&page=2&sort=new"
        );
    }

    #[test]
    fn json_body_sets_content_type() {
        let request = TransportRequest::post("https://api.example.com/items")
            .json(&serde_json::json!({ "name": "widget" }))
            .expect("payload serializes");
        assert_eq!(
            request.headers().get(CONTENT_TYPE),
            Some(&HeaderValue::from_static("application/json"))
        );
        assert_eq!(request.body_bytes().as_ref(), br#"{"name":"widget"}"#);
    }

    #[test]
    fn form_body_is_url_encoded() {
        let request = TransportRequest::post("https://api.example.com/login")
            .form(&[("user", "a b"), ("next", "/home")])
            .expect("payload serializes");
        assert_eq!(request.body_bytes().as_ref(), b"user=a+b&next=%2Fhome");
    }

    #[test]
    fn invalid_header_name_is_rejected() {
        let error = TransportRequest::get("https://api.example.com")
            .try_header("bad header", "x")
            .expect_err("space is not allowed");
        assert!(matches!(error, Error::InvalidHeaderName { .. }));
    }
}
