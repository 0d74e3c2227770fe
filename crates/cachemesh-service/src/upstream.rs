//! The HTTP backend: issues GETs against the origin export server or
//! against a peer's embedded server, and translates the response into a
//! [`Reply`].

use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use reqwest::header::{self, HeaderMap};
use reqwest::{redirect, Client, StatusCode};

use crate::error::BackendError;
use crate::stats::{bump, CACHE_STATS};
use crate::types::{ContentEncoding, Reply, Request, HDR_ERRNO, HDR_ESTALE_COOKIE};
use crate::volatile::Volatiles;
use crate::{Backend, Outcome};

/// HTTP User-Agent string to use.
const USER_AGENT: &str = concat!("cachemesh/", env!("CARGO_PKG_VERSION"));

/// Who this backend talks to. Peers get the tighter peer timeouts; the
/// label also shows up in logs.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum UpstreamKind {
    Origin,
    Peer,
}

/// Creates a [`reqwest::Client`] with the given timeouts and redirect cap.
///
/// Gzip stays off on purpose: bodies are cached in their transfer
/// encoding so that end-to-end sealed content survives every cache tier.
pub fn create_client(
    connect_timeout: Duration,
    transfer_timeout: Duration,
    max_redirects: usize,
) -> Client {
    Client::builder()
        .connect_timeout(connect_timeout)
        .timeout(transfer_timeout)
        .redirect(redirect::Policy::limited(max_redirects))
        .pool_idle_timeout(Duration::from_secs(30))
        .build()
        .expect("reqwest client construction only fails on TLS backend misconfiguration")
}

#[derive(Debug)]
pub struct HttpBackend {
    /// Base URL without a trailing slash; request stems are appended as-is.
    base_url: String,
    client: Client,
    transfer_timeout: Duration,
    kind: UpstreamKind,
}

impl HttpBackend {
    pub fn new(base_url: impl Into<String>, vols: &Volatiles, kind: UpstreamKind) -> Self {
        let (connect, transfer) = match kind {
            UpstreamKind::Origin => (vols.connect_timeout(), vols.transfer_timeout()),
            UpstreamKind::Peer => (vols.peer_connect_timeout(), vols.peer_transfer_timeout()),
        };
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        HttpBackend {
            base_url,
            client: create_client(connect, transfer, vols.http_max_redirects()),
            transfer_timeout: transfer,
            kind,
        }
    }

    async fn do_refresh(&self, req: &Request, reply: &mut Reply) -> Result<Outcome, BackendError> {
        let url = format!("{}{}", self.base_url, req.urlstem);
        let mut builder = self
            .client
            .get(&url)
            .header(header::USER_AGENT, USER_AGENT);

        if req.no_cache {
            // A no-cache request must trigger a full body transfer, so no
            // validator may be attached.
            builder = builder.header(header::CACHE_CONTROL, "no-cache");
        } else {
            if let Some(max_stale) = req.max_stale {
                builder =
                    builder.header(header::CACHE_CONTROL, format!("max-stale={max_stale}"));
            }
            if reply.valid() && reply.etag64 != 0 {
                builder =
                    builder.header(header::IF_NONE_MATCH, format!("\"{}\"", reply.etag64));
            }
        }

        tracing::trace!(kind = ?self.kind, %url, "refreshing");

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                BackendError::Timeout(self.transfer_timeout)
            } else {
                BackendError::transfer_error(&e)
            }
        })?;

        let status = response.status();
        match status {
            StatusCode::OK => {
                let headers = response.headers().clone();
                let content = response.bytes().await.map_err(BackendError::from)?;
                *reply = build_reply(&headers, content)?;
                Ok(Outcome::Modified)
            }
            StatusCode::NOT_MODIFIED => {
                if !reply.valid() {
                    return Err(BackendError::Malformed(
                        "304 for a request that carried no validator".into(),
                    ));
                }
                let (age, max_age, swr) = cache_lifetimes(response.headers())
                    // A 304 without cache-control re-grants the previous
                    // lifetime.
                    .unwrap_or((Duration::ZERO, reply.max_age(), reply.stale_while_revalidate));
                reply.set_times(age, max_age, swr);
                Ok(Outcome::NotModified)
            }
            StatusCode::FORBIDDEN | StatusCode::UNAUTHORIZED => {
                Err(BackendError::PermissionDenied(status.to_string()))
            }
            s if s.is_client_error() => Err(BackendError::NotFound),
            s => Err(BackendError::Transfer(s.to_string())),
        }
    }
}

impl Backend for HttpBackend {
    fn refresh<'a>(
        &'a self,
        req: &'a Request,
        reply: &'a mut Reply,
    ) -> BoxFuture<'a, Result<Outcome, BackendError>> {
        Box::pin(async move {
            match self.do_refresh(req, reply).await {
                Ok(outcome) => Ok(outcome),
                Err(err) => {
                    if reply.within_stale_if_error(req.stale_if_error) {
                        bump(&CACHE_STATS.stale_if_error_served);
                        tracing::warn!(
                            kind = ?self.kind,
                            urlstem = %req.urlstem,
                            error = %err,
                            "upstream failed, serving stale within stale-if-error window"
                        );
                        reply.extend_staleness(Duration::from_secs(1));
                        return Ok(Outcome::NotModified);
                    }
                    Err(err)
                }
            }
        })
    }
}

fn build_reply(headers: &HeaderMap, content: Bytes) -> Result<Reply, BackendError> {
    let eno: i32 = match header_str(headers, HDR_ERRNO) {
        Some(raw) => raw
            .parse()
            .map_err(|_| BackendError::Malformed(format!("bad {HDR_ERRNO}: {raw:?}")))?,
        None => 0,
    };
    if eno < 0 {
        return Err(BackendError::Malformed(format!("negative errno {eno}")));
    }
    if eno != 0 && !content.is_empty() {
        return Err(BackendError::Malformed(
            "non-zero errno with non-empty content".into(),
        ));
    }

    let estale_cookie: u64 = match header_str(headers, HDR_ESTALE_COOKIE) {
        Some(raw) => raw
            .parse()
            .map_err(|_| BackendError::Malformed(format!("bad {HDR_ESTALE_COOKIE}: {raw:?}")))?,
        None => 0,
    };

    let etag64 = match header_str(headers, "etag") {
        Some(raw) => parse_quoted_etag(raw)?,
        None => 0,
    };

    let encoding =
        ContentEncoding::from_header_value(header_str(headers, "content-encoding"))?;

    let (age, max_age, swr) =
        cache_lifetimes(headers).unwrap_or((Duration::ZERO, Duration::ZERO, Duration::ZERO));

    let mut reply = Reply {
        eno,
        etag64,
        estale_cookie,
        ..Reply::default()
    };
    reply.set_content(content, encoding);
    reply.set_times(age, max_age, swr);
    Ok(reply)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Extract `(age, max-age, stale-while-revalidate)` from the response
/// headers. `None` when there is no `Cache-Control` at all.
fn cache_lifetimes(headers: &HeaderMap) -> Option<(Duration, Duration, Duration)> {
    let cc = header_str(headers, "cache-control")?;
    let mut max_age = Duration::ZERO;
    let mut swr = Duration::ZERO;
    for directive in cc.split(',') {
        let directive = directive.trim();
        if let Some(v) = directive.strip_prefix("max-age=") {
            max_age = Duration::from_secs(v.parse().unwrap_or(0));
        } else if let Some(v) = directive.strip_prefix("stale-while-revalidate=") {
            swr = Duration::from_secs(v.parse().unwrap_or(0));
        }
    }
    let age = header_str(headers, "age")
        .and_then(|v| v.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(Duration::ZERO);
    Some((age, max_age, swr))
}

/// Parse a quoted ETag into a `u64` validator.
///
/// Rejects anything ambiguous: a leading zero would make `"0123"` compare
/// equal numerically but not byte-wise, so it does not parse.
pub fn parse_quoted_etag(raw: &str) -> Result<u64, BackendError> {
    let inner = raw
        .trim()
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .ok_or_else(|| BackendError::Malformed(format!("unquoted etag {raw:?}")))?;
    if inner.starts_with('0') {
        return Err(BackendError::Malformed(format!(
            "ambiguous leading zero in etag {raw:?}"
        )));
    }
    inner
        .parse()
        .map_err(|_| BackendError::Malformed(format!("non-numeric etag {raw:?}")))
}

/// Format the validator the way [`parse_quoted_etag`] expects it back.
pub fn format_etag(etag64: u64) -> String {
    format!("\"{etag64}\"")
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.insert(
                reqwest::header::HeaderName::from_bytes(k.as_bytes()).unwrap(),
                HeaderValue::from_str(v).unwrap(),
            );
        }
        map
    }

    #[test]
    fn etag_roundtrip() {
        assert_eq!(parse_quoted_etag(&format_etag(12345)).unwrap(), 12345);
        assert!(parse_quoted_etag("\"0123\"").is_err());
        assert!(parse_quoted_etag("123").is_err());
        assert!(parse_quoted_etag("\"abc\"").is_err());
    }

    #[test]
    fn reply_from_headers() {
        let h = headers(&[
            ("cache-control", "max-age=60,stale-while-revalidate=30"),
            ("age", "5"),
            ("etag", "\"77\""),
            (HDR_ESTALE_COOKIE, "99"),
        ]);
        let reply = build_reply(&h, Bytes::from_static(b"payload")).unwrap();
        assert_eq!(reply.eno, 0);
        assert_eq!(reply.etag64, 77);
        assert_eq!(reply.estale_cookie, 99);
        assert_eq!(reply.max_age(), Duration::from_secs(60));
        assert_eq!(reply.stale_while_revalidate, Duration::from_secs(30));
        assert!(reply.fresh());
        assert!(reply.fingerprint_ok());
    }

    #[test]
    fn errno_forbids_content() {
        let h = headers(&[(HDR_ERRNO, "2")]);
        let reply = build_reply(&h, Bytes::new()).unwrap();
        assert_eq!(reply.eno, 2);
        assert!(reply.valid());

        let h = headers(&[(HDR_ERRNO, "2")]);
        assert!(build_reply(&h, Bytes::from_static(b"x")).is_err());
    }

    #[test]
    fn unknown_encoding_is_malformed() {
        let h = headers(&[("content-encoding", "gzip")]);
        assert!(build_reply(&h, Bytes::new()).is_err());
    }
}
