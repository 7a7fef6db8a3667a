//! Locating the raw session credential in a request.
//!
//! Channels are tried in a fixed order and the first non-empty value wins. Values from
//! different channels are never merged or compared.

use axum::http::{header::AUTHORIZATION, HeaderMap, HeaderName};
use axum_extra::extract::cookie::CookieJar;
use url::form_urlencoded;

use crate::config::CookieConfig;

pub const TOKEN_QUERY_PARAM: &str = "token";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSource {
    Cookie,
    Bearer,
    SecondaryHeader,
    Query,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCredential {
    pub token: String,
    pub source: CredentialSource,
}

#[derive(Debug, Clone)]
pub struct CredentialResolver {
    cookie_name: String,
    secondary_header: Option<HeaderName>,
}

impl CredentialResolver {
    pub fn new(cfg: &CookieConfig) -> Self {
        Self {
            cookie_name: cfg.name.clone(),
            secondary_header: HeaderName::try_from(cfg.secondary_header.as_str()).ok(),
        }
    }

    pub fn cookie_name(&self) -> &str {
        &self.cookie_name
    }

    /// Cookie, then `Authorization: Bearer`, then the secondary header, then `?token=`.
    pub fn resolve(&self, headers: &HeaderMap, query: Option<&str>) -> Option<ResolvedCredential> {
        self.from_cookie(headers)
            .map(|t| (t, CredentialSource::Cookie))
            .or_else(|| bearer_token(headers).map(|t| (t, CredentialSource::Bearer)))
            .or_else(|| {
                self.from_secondary_header(headers)
                    .map(|t| (t, CredentialSource::SecondaryHeader))
            })
            .or_else(|| query.and_then(query_token).map(|t| (t, CredentialSource::Query)))
            .map(|(token, source)| ResolvedCredential { token, source })
    }

    /// Only the cookie channel; used where a header-carried token must not be trusted.
    pub fn resolve_cookie(&self, headers: &HeaderMap) -> Option<String> {
        self.from_cookie(headers)
    }

    fn from_cookie(&self, headers: &HeaderMap) -> Option<String> {
        let jar = CookieJar::from_headers(headers);
        jar.get(&self.cookie_name)
            .map(|c| c.value().trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn from_secondary_header(&self, headers: &HeaderMap) -> Option<String> {
        let name = self.secondary_header.as_ref()?;
        non_empty(headers.get(name)?.to_str().ok()?)
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?.trim();
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    non_empty(token)
}

fn query_token(query: &str) -> Option<String> {
    form_urlencoded::parse(query.as_bytes())
        .find(|(k, _)| k == TOKEN_QUERY_PARAM)
        .and_then(|(_, v)| non_empty(&v))
}

fn non_empty(v: &str) -> Option<String> {
    let v = v.trim();
    (!v.is_empty()).then(|| v.to_string())
}

/// Which credential the browser should use when a page boots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCredential {
    /// Token handed over in the URL fragment by the OAuth redirect. Cache it.
    Fragment(String),
    /// Token cached by an earlier visit.
    Cached(String),
    /// Nothing held locally; probe `/api/auth/verify` with cookies, then `/api/auth/get-token`.
    CookieProbe,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientBootstrap {
    pub credential: ClientCredential,
    /// The address bar still shows `#token=...` and must be rewritten without it.
    pub strip_fragment: bool,
}

/// Page-load resolution: URL fragment, then cached token, then cookie probe.
///
/// `fragment` is the raw location hash with or without its leading `#`.
pub fn resolve_client(fragment: Option<&str>, cached: Option<&str>) -> ClientBootstrap {
    let fragment = fragment.map(|f| f.trim_start_matches('#')).unwrap_or("");
    let mut carried_token = false;
    let mut from_fragment = None;
    for (k, v) in form_urlencoded::parse(fragment.as_bytes()) {
        if k == TOKEN_QUERY_PARAM {
            carried_token = true;
            from_fragment = non_empty(&v);
            break;
        }
    }

    let credential = match (from_fragment, cached.and_then(non_empty)) {
        (Some(t), _) => ClientCredential::Fragment(t),
        (None, Some(t)) => ClientCredential::Cached(t),
        (None, None) => ClientCredential::CookieProbe,
    };
    ClientBootstrap {
        credential,
        strip_fragment: carried_token,
    }
}
