//! Forward options, process-wide defaults and the option resolver.

use std::collections::BTreeMap;

use axum::http::header::{self, HeaderName, HeaderValue};
use axum::http::{HeaderMap, Method};
use bytes::Bytes;
use serde::Deserialize;
use url::Url;

use crate::error::ForwardError;
use crate::inbound::{FileDescriptor, InboundRequest};
use crate::translate;

/// One part of an outbound `multipart/form-data` body.
#[derive(Debug, Clone, PartialEq)]
pub enum FormPart {
    Text(String),
    /// Opened for reading only when the request is sent.
    File(FileDescriptor),
}

/// The single payload representation carried by an outbound request.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundBody {
    Raw(Bytes),
    Json(serde_json::Value),
    Form(Vec<(String, String)>),
    Multipart(Vec<(String, FormPart)>),
}

/// Options for one forward call.
///
/// Fields left as `None` are filled from [`DefaultOptions`] and then from the
/// inbound request during [`resolve`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ForwardOptions {
    pub url: Option<String>,
    pub base_url: Option<String>,
    pub method: Option<Method>,
    pub headers: Option<HeaderMap>,
    pub query: Option<Vec<(String, String)>>,
    /// Setting a body here bypasses body translation for the call.
    pub body: Option<OutboundBody>,
    pub debug: bool,
}

impl ForwardOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn method(mut self, method: Method) -> Self {
        self.method = Some(method);
        self
    }

    /// Replace the outbound headers entirely. An empty map sends no inbound headers.
    pub fn headers(mut self, headers: HeaderMap) -> Self {
        self.headers = Some(headers);
        self
    }

    pub fn query<K, V>(mut self, pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.query = Some(pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect());
        self
    }

    pub fn body(mut self, body: OutboundBody) -> Self {
        self.body = Some(body);
        self
    }

    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Fill every unset field from `defaults`. Call-site values always win.
    pub fn merged_with(self, defaults: &DefaultOptions) -> Result<Self, ForwardError> {
        let method = match self.method {
            Some(m) => Some(m),
            None => non_empty(defaults.method.clone())
                .map(|m| {
                    Method::from_bytes(m.to_ascii_uppercase().as_bytes())
                        .map_err(|_| ForwardError::invalid(format!("invalid default method `{m}`")))
                })
                .transpose()?,
        };
        let headers = match self.headers {
            Some(h) => Some(h),
            None => defaults.headers.as_ref().map(header_map).transpose()?,
        };
        let query = self.query.or_else(|| {
            defaults
                .query
                .as_ref()
                .map(|q| q.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        });

        Ok(Self {
            url: non_empty(self.url).or_else(|| non_empty(defaults.url.clone())),
            base_url: non_empty(self.base_url).or_else(|| non_empty(defaults.base_url.clone())),
            method,
            headers,
            query,
            body: self.body,
            debug: self.debug || defaults.debug,
        })
    }

    /// The absolute outbound URL: `base_url` joined with `url`, plus the query pairs.
    pub fn target_url(&self) -> Result<Url, ForwardError> {
        let target = self
            .url
            .as_deref()
            .ok_or_else(|| ForwardError::invalid("no target url resolved"))?;

        let joined = match self.base_url.as_deref() {
            Some(base) if !is_absolute_url(target) => join_url(base, target),
            _ => target.to_string(),
        };
        let mut url = Url::parse(&joined)
            .map_err(|e| ForwardError::invalid(format!("invalid target url `{joined}`: {e}")))?;

        if let Some(query) = self.query.as_ref().filter(|q| !q.is_empty()) {
            url.query_pairs_mut().extend_pairs(query);
        }
        Ok(url)
    }
}

/// Process-wide default options, set once from configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DefaultOptions {
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub headers: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub query: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub debug: bool,
}

impl DefaultOptions {
    /// Check that configured method and headers are well-formed.
    pub fn validate(&self) -> Result<(), ForwardError> {
        ForwardOptions::default().merged_with(self).map(|_| ())
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

fn header_map(headers: &BTreeMap<String, String>) -> Result<HeaderMap, ForwardError> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| ForwardError::invalid(format!("invalid header name `{name}`")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|_| ForwardError::invalid(format!("invalid value for header `{name}`")))?;
        map.insert(name, value);
    }
    Ok(map)
}

/// True for `http`/`https` URLs with a non-empty host.
pub fn is_absolute_url(target: &str) -> bool {
    Url::parse(target).is_ok_and(|u| {
        matches!(u.scheme(), "http" | "https") && u.host_str().is_some_and(|h| !h.is_empty())
    })
}

fn join_url(base: &str, path: &str) -> String {
    match (base.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{base}{}", &path[1..]),
        (false, false) if !path.is_empty() => format!("{base}/{path}"),
        _ => format!("{base}{path}"),
    }
}

/// Resolve the outbound options for forwarding `inbound` to `target`.
///
/// `target` is either an absolute URL or a path on the inbound host (or on
/// the configured base URL). Precedence for every field is call-site option,
/// then default option, then the inbound request.
pub fn resolve(
    inbound: &InboundRequest,
    target: &str,
    options: ForwardOptions,
    defaults: &DefaultOptions,
) -> Result<ForwardOptions, ForwardError> {
    if target.is_empty() {
        return Err(ForwardError::invalid("forward target must be a non-empty url or path"));
    }
    let absolute = is_absolute_url(target);
    if !absolute && !target.starts_with('/') {
        return Err(ForwardError::invalid(format!(
            "forward target `{target}` is neither an absolute url nor a path"
        )));
    }

    let mut resolved = options.merged_with(defaults)?;

    if resolved.url.is_none() {
        resolved.url = Some(target.to_string());
    }
    if !absolute && resolved.base_url.is_none() {
        resolved.base_url = Some(format!("{}://{}", inbound.protocol, inbound.host));
    }
    if resolved.method.is_none() {
        resolved.method = Some(inbound.method.clone());
    }
    if resolved.headers.is_none() {
        let mut headers = inbound.headers.clone();
        headers.remove(header::HOST);
        resolved.headers = Some(headers);
    }
    if resolved.query.is_none() {
        resolved.query = Some(inbound.query.clone());
    }

    translate::translate(&mut resolved, inbound.content_kind, &inbound.body);
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inbound::{ContentKind, ParsedBody};

    fn inbound(method: Method) -> InboundRequest {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("localhost:3000"));
        headers.insert("x-trace", HeaderValue::from_static("abc"));
        InboundRequest {
            method,
            protocol: "http".to_string(),
            host: "localhost:3000".to_string(),
            path: "/".to_string(),
            query: vec![("page".to_string(), "2".to_string())],
            headers,
            content_kind: ContentKind::Other,
            body: ParsedBody::Absent,
        }
    }

    #[test]
    fn test_path_target_uses_inbound_host() {
        let resolved = resolve(
            &inbound(Method::GET),
            "/test",
            ForwardOptions::new(),
            &DefaultOptions::default(),
        )
        .unwrap();

        assert_eq!(resolved.url.as_deref(), Some("/test"));
        assert_eq!(resolved.base_url.as_deref(), Some("http://localhost:3000"));
        assert_eq!(resolved.method, Some(Method::GET));
        assert_eq!(
            resolved.target_url().unwrap().as_str(),
            "http://localhost:3000/test?page=2"
        );
    }

    #[test]
    fn test_host_header_removed_from_inbound_headers() {
        let resolved = resolve(
            &inbound(Method::GET),
            "/test",
            ForwardOptions::new(),
            &DefaultOptions::default(),
        )
        .unwrap();

        let headers = resolved.headers.unwrap();
        assert!(headers.get(header::HOST).is_none());
        assert_eq!(headers.get("x-trace").unwrap(), "abc");
    }

    #[test]
    fn test_absolute_target_has_no_base_url() {
        let resolved = resolve(
            &inbound(Method::GET),
            "http://example.test/images/a.png?v5",
            ForwardOptions::new().query(Vec::<(String, String)>::new()),
            &DefaultOptions::default(),
        )
        .unwrap();

        assert!(resolved.base_url.is_none());
        assert_eq!(
            resolved.target_url().unwrap().as_str(),
            "http://example.test/images/a.png?v5"
        );
    }

    #[test]
    fn test_default_base_url_applies_to_paths() {
        let defaults = DefaultOptions {
            base_url: Some("http://example.test".to_string()),
            ..Default::default()
        };
        let resolved =
            resolve(&inbound(Method::GET), "/docs/page", ForwardOptions::new(), &defaults).unwrap();

        assert_eq!(
            resolved.target_url().unwrap().as_str(),
            "http://example.test/docs/page?page=2"
        );
    }

    #[test]
    fn test_call_headers_fully_override_defaults() {
        let defaults = DefaultOptions {
            headers: Some(BTreeMap::from([
                ("x-default".to_string(), "1".to_string()),
                ("x-shared".to_string(), "default".to_string()),
            ])),
            ..Default::default()
        };
        let mut call_headers = HeaderMap::new();
        call_headers.insert("x-shared", HeaderValue::from_static("call"));

        let resolved = resolve(
            &inbound(Method::GET),
            "/test",
            ForwardOptions::new().headers(call_headers),
            &defaults,
        )
        .unwrap();

        let headers = resolved.headers.unwrap();
        assert_eq!(headers.len(), 1);
        assert_eq!(headers.get("x-shared").unwrap(), "call");
        assert!(headers.get("x-default").is_none());
        assert!(headers.get("x-trace").is_none());
    }

    #[test]
    fn test_unset_call_field_falls_back_to_default() {
        let defaults = DefaultOptions {
            method: Some("put".to_string()),
            headers: Some(BTreeMap::from([("x-default".to_string(), "1".to_string())])),
            debug: true,
            ..Default::default()
        };
        let resolved =
            resolve(&inbound(Method::GET), "/test", ForwardOptions::new(), &defaults).unwrap();

        assert_eq!(resolved.method, Some(Method::PUT));
        assert!(resolved.debug);
        let headers = resolved.headers.unwrap();
        assert_eq!(headers.get("x-default").unwrap(), "1");
        assert!(headers.get("x-trace").is_none());
    }

    #[test]
    fn test_empty_call_string_counts_as_unset() {
        let defaults = DefaultOptions {
            base_url: Some("http://example.test".to_string()),
            ..Default::default()
        };
        let resolved = resolve(
            &inbound(Method::GET),
            "/x",
            ForwardOptions::new().base_url(""),
            &defaults,
        )
        .unwrap();
        assert_eq!(resolved.base_url.as_deref(), Some("http://example.test"));
    }

    #[test]
    fn test_empty_header_map_suppresses_inbound_headers() {
        let resolved = resolve(
            &inbound(Method::GET),
            "/test",
            ForwardOptions::new().headers(HeaderMap::new()),
            &DefaultOptions::default(),
        )
        .unwrap();
        assert!(resolved.headers.unwrap().is_empty());
    }

    #[test]
    fn test_invalid_targets_rejected() {
        for target in ["", "relative/path", "ftp:/nohost"] {
            let err = resolve(
                &inbound(Method::GET),
                target,
                ForwardOptions::new(),
                &DefaultOptions::default(),
            )
            .unwrap_err();
            assert!(matches!(err, ForwardError::InvalidArgument(_)), "target {target:?}");
        }
    }

    #[test]
    fn test_invalid_default_method_rejected() {
        let defaults = DefaultOptions {
            method: Some("BAD METHOD".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            defaults.validate(),
            Err(ForwardError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_join_url_single_slash() {
        assert_eq!(join_url("http://a.test/", "/x"), "http://a.test/x");
        assert_eq!(join_url("http://a.test", "x"), "http://a.test/x");
        assert_eq!(join_url("http://a.test", "/x"), "http://a.test/x");
        assert_eq!(join_url("http://a.test/", ""), "http://a.test/");
    }
}
