use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;

use crate::error::BackendError;
use crate::volatile::Volatiles;

/// Name of the protocol-private response header carrying the reply errno.
pub const HDR_ERRNO: &str = "fs123-errno";
/// Name of the protocol-private response header carrying the estale cookie.
pub const HDR_ESTALE_COOKIE: &str = "fs123-estalecookie";

/// A request for one URL stem, plus the per-request cache directives.
#[derive(Clone, Debug)]
pub struct Request {
    /// Path plus optional query, starting with `/`.
    pub urlstem: String,
    /// Bypass any cached reply; the content must be fully re-transferred.
    pub no_cache: bool,
    /// Bypass peer routing. Set on every request that arrived over `/p`,
    /// which is what keeps a forwarded request from bouncing between peers.
    pub no_peer_cache: bool,
    /// Staleness tolerance override. `Some(0)` forces revalidation of
    /// entries that would otherwise ride out their
    /// stale-while-revalidate window.
    pub max_stale: Option<u64>,
    /// How long a stale entry may substitute for an unreachable upstream.
    pub stale_if_error: Duration,
}

impl Request {
    pub fn new(urlstem: impl Into<String>, vols: &Volatiles) -> Self {
        Request {
            urlstem: urlstem.into(),
            no_cache: false,
            no_peer_cache: false,
            max_stale: None,
            stale_if_error: Duration::from_secs(vols.stale_if_error()),
        }
    }

    /// A request with no staleness allowances, used for peer probes and
    /// other internal traffic.
    pub fn internal(urlstem: impl Into<String>) -> Self {
        Request {
            urlstem: urlstem.into(),
            no_cache: false,
            no_peer_cache: false,
            max_stale: None,
            stale_if_error: Duration::ZERO,
        }
    }
}

/// Content encoding tag carried verbatim between the origin and the
/// consumer. The cache stores encoded bodies, so an encrypted payload
/// passes through every cache tier without being opened.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ContentEncoding {
    Identity,
    /// End-to-end sealed content; only the mount holding the content key
    /// can open it.
    Secretbox,
}

impl ContentEncoding {
    pub fn as_header_value(self) -> Option<&'static str> {
        match self {
            ContentEncoding::Identity => None,
            ContentEncoding::Secretbox => Some("secretbox"),
        }
    }

    pub fn from_header_value(value: Option<&str>) -> Result<Self, BackendError> {
        match value {
            None | Some("identity") => Ok(ContentEncoding::Identity),
            Some("secretbox") => Ok(ContentEncoding::Secretbox),
            Some(other) => Err(BackendError::Malformed(format!(
                "unknown content encoding {other:?}"
            ))),
        }
    }

    fn to_wire(self) -> i16 {
        match self {
            ContentEncoding::Identity => 0,
            ContentEncoding::Secretbox => 1,
        }
    }

    fn from_wire(v: i16) -> Result<Self, BackendError> {
        match v {
            0 => Ok(ContentEncoding::Identity),
            1 => Ok(ContentEncoding::Secretbox),
            other => Err(BackendError::Malformed(format!(
                "unknown content encoding tag {other}"
            ))),
        }
    }
}

/// One reply as held in memory and on disk.
///
/// A reply is `valid()` iff `eno` is non-negative. If `eno` is zero the
/// content came from the server; a non-zero `eno` carries the server-side
/// error and forbids content. The cache-control accessors (`fresh`, `age`,
/// `ttl`, `max_age`) work even on invalid replies.
#[derive(Clone, Debug)]
pub struct Reply {
    pub eno: i32,
    pub content: Bytes,
    pub encoding: ContentEncoding,
    pub last_refresh: SystemTime,
    pub expires: SystemTime,
    pub stale_while_revalidate: Duration,
    pub etag64: u64,
    pub estale_cookie: u64,
    /// BLAKE3 of the (encoded) content, truncated to 128 bits.
    pub fingerprint: [u8; 16],
}

/// Sentinel at the head of every on-disk record. Bump whenever the
/// serialized layout changes; old records then read as a cache miss
/// instead of misparsing.
const MAGIC: u32 = 2_718_281_828;

/// Fixed-size part of the on-disk record, before the content bytes.
const RECORD_HEADER_LEN: usize = 4 + 4 + 2 + 8 + 8 + 8 + 8 + 8 + 16;

impl Default for Reply {
    fn default() -> Self {
        Reply {
            eno: -1,
            content: Bytes::new(),
            encoding: ContentEncoding::Identity,
            last_refresh: UNIX_EPOCH,
            expires: UNIX_EPOCH,
            stale_while_revalidate: Duration::ZERO,
            etag64: 0,
            estale_cookie: 0,
            fingerprint: content_fingerprint(b""),
        }
    }
}

impl Reply {
    /// A reply holding nothing but a validator, used to seed an
    /// `If-None-Match` exchange on behalf of a remote caller.
    pub fn validator_only(etag64: u64) -> Self {
        Reply {
            eno: 0,
            etag64,
            ..Reply::default()
        }
    }

    pub fn valid(&self) -> bool {
        self.eno >= 0
    }

    pub fn fresh(&self) -> bool {
        self.valid() && SystemTime::now() < self.expires
    }

    /// `expires - last_refresh`; the lifetime granted at the last refresh.
    pub fn max_age(&self) -> Duration {
        self.expires
            .duration_since(self.last_refresh)
            .unwrap_or_default()
    }

    /// Seconds since the last refresh. Zero if the clock stepped backwards.
    pub fn age(&self) -> Duration {
        SystemTime::now()
            .duration_since(self.last_refresh)
            .unwrap_or_default()
    }

    /// Time until expiry. `None` once expired.
    pub fn ttl(&self) -> Option<Duration> {
        self.expires.duration_since(SystemTime::now()).ok()
    }

    /// Whether a stale reply is still inside its stale-while-revalidate
    /// window.
    pub fn within_swr(&self) -> bool {
        self.valid() && SystemTime::now() < self.expires + self.stale_while_revalidate
    }

    /// Whether a stale reply may substitute for a failing upstream.
    pub fn within_stale_if_error(&self, window: Duration) -> bool {
        self.valid() && SystemTime::now() < self.expires + window
    }

    /// Set the cache timestamps from an HTTP-shaped triple: the reply's
    /// `Age`, its `max-age` and its `stale-while-revalidate`, all in whole
    /// seconds.
    pub fn set_times(&mut self, age: Duration, max_age: Duration, swr: Duration) {
        let now = SystemTime::now();
        self.last_refresh = now - age;
        self.expires = self.last_refresh + max_age;
        self.stale_while_revalidate = swr;
    }

    /// Push `expires` forward without pretending the content was
    /// refreshed. Used when a stale entry substitutes for a failing
    /// upstream: the caller gets a reply that is fresh-at-return, and the
    /// next request retries the upstream almost immediately.
    pub fn extend_staleness(&mut self, grace: Duration) {
        self.expires = SystemTime::now() + grace;
    }

    pub fn set_content(&mut self, content: Bytes, encoding: ContentEncoding) {
        self.fingerprint = content_fingerprint(&content);
        self.content = content;
        self.encoding = encoding;
    }

    /// Check that the fingerprint still matches the content bytes.
    pub fn fingerprint_ok(&self) -> bool {
        self.fingerprint == content_fingerprint(&self.content)
    }

    /// Serialize into the on-disk record layout. Every field round-trips
    /// through [`Reply::from_record`].
    pub fn to_record(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(RECORD_HEADER_LEN + self.content.len());
        out.extend_from_slice(&MAGIC.to_le_bytes());
        out.extend_from_slice(&self.eno.to_le_bytes());
        out.extend_from_slice(&self.encoding.to_wire().to_le_bytes());
        out.extend_from_slice(&self.etag64.to_le_bytes());
        out.extend_from_slice(&self.estale_cookie.to_le_bytes());
        out.extend_from_slice(&systemtime_millis(self.last_refresh).to_le_bytes());
        out.extend_from_slice(&systemtime_millis(self.expires).to_le_bytes());
        out.extend_from_slice(&(self.stale_while_revalidate.as_millis() as i64).to_le_bytes());
        out.extend_from_slice(&self.fingerprint);
        out.extend_from_slice(&self.content);
        out
    }

    /// Deserialize an on-disk record. Rejects records with the wrong
    /// sentinel or a fingerprint that disagrees with the content.
    pub fn from_record(data: &[u8]) -> Result<Self, BackendError> {
        if data.len() < RECORD_HEADER_LEN {
            return Err(BackendError::Malformed("cache record too short".into()));
        }
        let mut r = RecordReader { data, pos: 0 };
        let magic = r.u32();
        if magic != MAGIC {
            return Err(BackendError::Malformed(format!(
                "cache record sentinel mismatch: {magic}"
            )));
        }
        let eno = r.i32();
        let encoding = ContentEncoding::from_wire(r.i16())?;
        let etag64 = r.u64();
        let estale_cookie = r.u64();
        let last_refresh = millis_systemtime(r.i64());
        let expires = millis_systemtime(r.i64());
        let swr_millis = r.i64();
        if swr_millis < 0 {
            return Err(BackendError::Malformed(
                "negative stale-while-revalidate".into(),
            ));
        }
        let mut fingerprint = [0u8; 16];
        fingerprint.copy_from_slice(r.take(16));
        let content = Bytes::copy_from_slice(&data[RECORD_HEADER_LEN..]);

        let reply = Reply {
            eno,
            content,
            encoding,
            last_refresh,
            expires,
            stale_while_revalidate: Duration::from_millis(swr_millis as u64),
            etag64,
            estale_cookie,
            fingerprint,
        };
        if !reply.fingerprint_ok() {
            return Err(BackendError::Malformed(
                "cache record fingerprint mismatch".into(),
            ));
        }
        Ok(reply)
    }
}

pub fn content_fingerprint(content: &[u8]) -> [u8; 16] {
    let hash = blake3::hash(content);
    let mut out = [0u8; 16];
    out.copy_from_slice(&hash.as_bytes()[..16]);
    out
}

fn systemtime_millis(t: SystemTime) -> i64 {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_millis() as i64,
        Err(e) => -(e.duration().as_millis() as i64),
    }
}

fn millis_systemtime(millis: i64) -> SystemTime {
    if millis >= 0 {
        UNIX_EPOCH + Duration::from_millis(millis as u64)
    } else {
        UNIX_EPOCH - Duration::from_millis(millis.unsigned_abs())
    }
}

struct RecordReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> RecordReader<'a> {
    fn take(&mut self, n: usize) -> &'a [u8] {
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        out
    }

    fn u32(&mut self) -> u32 {
        u32::from_le_bytes(self.take(4).try_into().unwrap())
    }

    fn i32(&mut self) -> i32 {
        i32::from_le_bytes(self.take(4).try_into().unwrap())
    }

    fn i16(&mut self) -> i16 {
        i16::from_le_bytes(self.take(2).try_into().unwrap())
    }

    fn u64(&mut self) -> u64 {
        u64::from_le_bytes(self.take(8).try_into().unwrap())
    }

    fn i64(&mut self) -> i64 {
        i64::from_le_bytes(self.take(8).try_into().unwrap())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_reply() -> Reply {
        let mut reply = Reply {
            eno: 0,
            etag64: 0xDEAD_BEEF_1234,
            estale_cookie: 42,
            ..Reply::default()
        };
        reply.set_content(Bytes::from_static(b"hello world"), ContentEncoding::Identity);
        reply.set_times(
            Duration::from_secs(3),
            Duration::from_secs(60),
            Duration::from_secs(30),
        );
        reply
    }

    #[test]
    fn record_roundtrip_preserves_every_field() {
        let reply = sample_reply();
        let restored = Reply::from_record(&reply.to_record()).unwrap();

        assert_eq!(restored.eno, reply.eno);
        assert_eq!(restored.content, reply.content);
        assert_eq!(restored.encoding, reply.encoding);
        assert_eq!(restored.etag64, reply.etag64);
        assert_eq!(restored.estale_cookie, reply.estale_cookie);
        assert_eq!(restored.fingerprint, reply.fingerprint);
        assert_eq!(
            restored.stale_while_revalidate,
            reply.stale_while_revalidate
        );
        // Timestamps round-trip at millisecond resolution.
        assert!(diff_millis(restored.last_refresh, reply.last_refresh) < 1);
        assert!(diff_millis(restored.expires, reply.expires) < 1);
    }

    fn diff_millis(a: SystemTime, b: SystemTime) -> u128 {
        a.duration_since(b)
            .unwrap_or_else(|e| e.duration())
            .as_millis()
    }

    #[test]
    fn record_rejects_wrong_sentinel() {
        let mut record = sample_reply().to_record();
        record[0] ^= 0xff;
        assert!(Reply::from_record(&record).is_err());
    }

    #[test]
    fn record_rejects_corrupted_content() {
        let mut record = sample_reply().to_record();
        let last = record.len() - 1;
        record[last] ^= 0xff;
        assert!(Reply::from_record(&record).is_err());
    }

    #[test]
    fn fresh_implies_valid_and_unexpired() {
        let reply = sample_reply();
        assert!(reply.fresh());
        assert!(reply.valid());
        assert!(SystemTime::now() < reply.expires);

        let mut stale = sample_reply();
        stale.set_times(
            Duration::from_secs(120),
            Duration::from_secs(60),
            Duration::from_secs(30),
        );
        assert!(!stale.fresh());
        assert!(stale.valid());
        assert!(!stale.within_swr());

        let invalid = Reply::default();
        assert!(!invalid.valid());
        assert!(!invalid.fresh());
    }

    #[test]
    fn max_age_is_expiry_minus_refresh() {
        let reply = sample_reply();
        assert_eq!(reply.max_age(), Duration::from_secs(60));
    }

    #[test]
    fn age_and_ttl_track_the_clock() {
        // Refreshed 3 seconds ago with a 60 second lifetime, so 57
        // seconds remain.
        let reply = sample_reply();
        assert!(reply.age() >= Duration::from_secs(3));
        assert!(reply.age() < Duration::from_secs(30));
        let ttl = reply.ttl().unwrap();
        assert!(ttl <= Duration::from_secs(57));
        assert!(ttl > Duration::from_secs(30));

        // Past expiry there is no time to live left.
        let mut expired = sample_reply();
        expired.set_times(
            Duration::from_secs(120),
            Duration::from_secs(60),
            Duration::ZERO,
        );
        assert!(expired.ttl().is_none());
        assert!(expired.age() >= Duration::from_secs(120));
    }

    #[test]
    fn swr_window_tracks_expiry() {
        let mut reply = sample_reply();
        reply.set_times(
            Duration::from_secs(70),
            Duration::from_secs(60),
            Duration::from_secs(300),
        );
        assert!(!reply.fresh());
        assert!(reply.within_swr());
    }
}
