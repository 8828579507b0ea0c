//! `Cookie` and `Set-Cookie` header helpers.

use std::fmt;

use http::header::{self, HeaderMap, HeaderValue, InvalidHeaderValue};

/// Every `name=value` pair carried by the request's `Cookie` headers, in order.
pub fn request_cookies(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| {
            let (name, value) = pair.trim().split_once('=')?;
            Some((name.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}

pub fn has_request_cookie(headers: &HeaderMap, name: &str) -> bool {
    request_cookies(headers).iter().any(|(n, _)| n == name)
}

/// Add `name=value` to the request's cookies unless a cookie of that name is
/// already present. Multiple `Cookie` headers are folded into one.
///
/// Returns whether the cookie was added.
pub fn add_request_cookie(
    headers: &mut HeaderMap,
    name: &str,
    value: &str,
) -> Result<bool, InvalidHeaderValue> {
    if has_request_cookie(headers, name) {
        return Ok(false);
    }

    let mut parts: Vec<String> = headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .map(|v| v.trim().trim_end_matches(';').to_string())
        .filter(|v| !v.is_empty())
        .collect();
    parts.push(format!("{name}={value}"));

    let folded = HeaderValue::from_str(&parts.join("; "))?;
    headers.insert(header::COOKIE, folded);
    Ok(true)
}

/// One parsed `Set-Cookie` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetCookie {
    pub name: String,
    pub value: String,
    /// Everything after the first `;`, untouched (`Path=/; HttpOnly`).
    pub attributes: String,
}

impl SetCookie {
    pub fn parse(raw: &str) -> Option<Self> {
        let (pair, attributes) = match raw.split_once(';') {
            Some((pair, rest)) => (pair, rest.trim()),
            None => (raw, ""),
        };
        let (name, value) = pair.split_once('=')?;
        let name = name.trim();
        if name.is_empty() {
            return None;
        }
        Some(Self {
            name: name.to_string(),
            value: value.trim().to_string(),
            attributes: attributes.to_string(),
        })
    }
}

impl fmt::Display for SetCookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.name, self.value)?;
        if !self.attributes.is_empty() {
            write!(f, "; {}", self.attributes)?;
        }
        Ok(())
    }
}

/// Every well-formed `Set-Cookie` header on a response.
pub fn set_cookies(headers: &HeaderMap) -> Vec<SetCookie> {
    headers
        .get_all(header::SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .filter_map(SetCookie::parse)
        .collect()
}

/// Drop `Set-Cookie` headers that set `name`. Returns how many were removed.
pub fn remove_set_cookie(headers: &mut HeaderMap, name: &str) -> usize {
    let all: Vec<HeaderValue> = headers.get_all(header::SET_COOKIE).iter().cloned().collect();
    if all.is_empty() {
        return 0;
    }

    let (dropped, kept): (Vec<_>, Vec<_>) = all.into_iter().partition(|v| {
        v.to_str()
            .ok()
            .and_then(SetCookie::parse)
            .is_some_and(|c| c.name == name)
    });

    headers.remove(header::SET_COOKIE);
    for value in kept {
        headers.append(header::SET_COOKIE, value);
    }
    dropped.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adds_cookie_to_empty_request() {
        let mut headers = HeaderMap::new();
        assert!(add_request_cookie(&mut headers, "JSESSIONID", "abc").unwrap());
        assert_eq!(headers[header::COOKIE], "JSESSIONID=abc");
    }

    #[test]
    fn appends_to_existing_cookies() {
        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, HeaderValue::from_static("theme=dark; lang=en"));

        add_request_cookie(&mut headers, "JSESSIONID", "abc").unwrap();
        assert_eq!(headers[header::COOKIE], "theme=dark; lang=en; JSESSIONID=abc");
    }

    #[test]
    fn injection_is_idempotent() {
        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, HeaderValue::from_static("JSESSIONID=client-set"));

        assert!(!add_request_cookie(&mut headers, "JSESSIONID", "abc").unwrap());
        assert_eq!(headers[header::COOKIE], "JSESSIONID=client-set");

        let mut fresh = HeaderMap::new();
        add_request_cookie(&mut fresh, "JSESSIONID", "abc").unwrap();
        add_request_cookie(&mut fresh, "JSESSIONID", "abc").unwrap();
        assert_eq!(request_cookies(&fresh).len(), 1);
    }

    #[test]
    fn folds_multiple_cookie_headers() {
        let mut headers = HeaderMap::new();
        headers.append(header::COOKIE, HeaderValue::from_static("a=1"));
        headers.append(header::COOKIE, HeaderValue::from_static("b=2;"));

        add_request_cookie(&mut headers, "c", "3").unwrap();
        assert_eq!(headers.get_all(header::COOKIE).iter().count(), 1);
        assert_eq!(headers[header::COOKIE], "a=1; b=2; c=3");
    }

    #[test]
    fn parses_set_cookie_attributes() {
        let cookie = SetCookie::parse("SESSION=xyz; Path=/; HttpOnly").unwrap();
        assert_eq!(cookie.name, "SESSION");
        assert_eq!(cookie.value, "xyz");
        assert_eq!(cookie.attributes, "Path=/; HttpOnly");
        assert_eq!(cookie.to_string(), "SESSION=xyz; Path=/; HttpOnly");

        assert!(SetCookie::parse("novalue").is_none());
        assert!(SetCookie::parse("=orphan").is_none());
    }

    #[test]
    fn removes_only_named_set_cookie() {
        let mut headers = HeaderMap::new();
        headers.append(header::SET_COOKIE, HeaderValue::from_static("track=1; Path=/"));
        headers.append(header::SET_COOKIE, HeaderValue::from_static("keep=2"));
        headers.append(header::SET_COOKIE, HeaderValue::from_static("track=3"));

        assert_eq!(remove_set_cookie(&mut headers, "track"), 2);
        let left = set_cookies(&headers);
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].name, "keep");
    }
}
