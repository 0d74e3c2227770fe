//! Control-message framing.
//!
//! A control message is one UDP datagram of at most 512 bytes: a version
//! word, the deployment scope, a secret-id and the payload words, each
//! NUL-terminated, followed by an 8-byte little-endian millisecond
//! timestamp and a 32-byte HMAC over everything before it:
//!
//! ```text
//! "2" NUL scope NUL sid NUL word... NUL  tstamp(8 LE)  hmac(32)
//! ```
//!
//! With an empty secret-id the tag is all zeros and is not checked. The
//! timestamp bounds the replay window without per-peer nonce state; the
//! acceptance window also has to absorb clock skew and listener stalls,
//! so it is wide (tens of seconds) and configurable.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

use super::secrets::SecretStore;

/// Hard cap on the datagram size.
pub const MAX_MESSAGE_LEN: usize = 512;

const VERSION: &str = "2";
const TSTAMP_LEN: usize = 8;
const TAG_LEN: usize = 32;

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum FrameError {
    #[error("message too large: {0} bytes")]
    MessageTooLarge(usize),
    /// Not even room for a word, a timestamp and a tag. Whatever this
    /// datagram is, it is not meant for us.
    #[error("message too short")]
    TooShort,
    #[error("words do not end with NUL")]
    BadLayout,
    #[error("incorrect version {0:?}")]
    WrongVersion(String),
    #[error("unexpected scope {0:?}")]
    WrongScope(String),
    /// Outside the skew window. Clock skew, a stalled listener loop, or a
    /// replay.
    #[error("unacceptable timestamp {message_millis}, now {now_millis}")]
    StaleMessage {
        message_millis: i64,
        now_millis: i64,
    },
    #[error("unknown secret id {0:?}")]
    UnknownSecret(String),
    #[error("authentication failed")]
    AuthFailed,
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Assemble a datagram from payload words.
pub fn encode(
    scope: &str,
    secrets: Option<&SecretStore>,
    words: &[&str],
) -> Result<Vec<u8>, FrameError> {
    encode_at(scope, secrets, words, now_millis())
}

/// [`encode`] with an explicit timestamp; tests use it to build delayed
/// packets.
pub(crate) fn encode_at(
    scope: &str,
    secrets: Option<&SecretStore>,
    words: &[&str],
    tstamp_millis: i64,
) -> Result<Vec<u8>, FrameError> {
    let signing = secrets.and_then(|s| s.signing_key());
    let sid = signing.as_ref().map(|(sid, _)| sid.as_str()).unwrap_or("");

    let mut out = Vec::with_capacity(128);
    for word in [VERSION, scope, sid].iter().chain(words.iter()) {
        out.extend_from_slice(word.as_bytes());
        out.push(0);
    }
    out.extend_from_slice(&tstamp_millis.to_le_bytes());

    if out.len() + TAG_LEN > MAX_MESSAGE_LEN {
        return Err(FrameError::MessageTooLarge(out.len() + TAG_LEN));
    }

    match signing {
        Some((_, key)) => {
            let mut mac = HmacSha256::new_from_slice(&key)
                .expect("hmac accepts any key length");
            mac.update(&out);
            out.extend_from_slice(&mac.finalize().into_bytes());
        }
        None => out.extend_from_slice(&[0u8; TAG_LEN]),
    }
    Ok(out)
}

/// Parse and authenticate a received datagram, returning its payload
/// words.
pub fn decode(
    data: &[u8],
    scope: &str,
    secrets: Option<&SecretStore>,
    skew: Duration,
) -> Result<Vec<String>, FrameError> {
    if data.len() > MAX_MESSAGE_LEN {
        return Err(FrameError::MessageTooLarge(data.len()));
    }
    if data.len() < TSTAMP_LEN + TAG_LEN + 2 {
        return Err(FrameError::TooShort);
    }
    let words_end = data.len() - TSTAMP_LEN - TAG_LEN;
    if data[words_end - 1] != 0 {
        return Err(FrameError::BadLayout);
    }

    let mut words = data[..words_end - 1].split(|&b| b == 0);

    let version = take_word(&mut words)?;
    if version != VERSION {
        return Err(FrameError::WrongVersion(version));
    }
    let msg_scope = take_word(&mut words)?;
    if msg_scope != scope {
        return Err(FrameError::WrongScope(msg_scope));
    }

    // Check the timestamp before doing any crypto; an attacker replaying
    // old traffic should not get to spend our cycles.
    let tstamp = i64::from_le_bytes(
        data[words_end..words_end + TSTAMP_LEN]
            .try_into()
            .expect("slice length is fixed"),
    );
    let now = now_millis();
    if (now - tstamp).unsigned_abs() > skew.as_millis() as u64 {
        return Err(FrameError::StaleMessage {
            message_millis: tstamp,
            now_millis: now,
        });
    }

    let sid = take_word(&mut words)?;
    if !sid.is_empty() {
        let key = secrets
            .and_then(|s| s.get(&sid))
            .ok_or_else(|| FrameError::UnknownSecret(sid.clone()))?;
        let mut mac =
            HmacSha256::new_from_slice(&key).expect("hmac accepts any key length");
        mac.update(&data[..words_end + TSTAMP_LEN]);
        mac.verify_slice(&data[words_end + TSTAMP_LEN..])
            .map_err(|_| FrameError::AuthFailed)?;
    }

    Ok(words
        .map(|w| String::from_utf8_lossy(w).into_owned())
        .collect())
}

fn take_word<'a>(words: &mut impl Iterator<Item = &'a [u8]>) -> Result<String, FrameError> {
    words
        .next()
        .map(|w| String::from_utf8_lossy(w).into_owned())
        .ok_or(FrameError::TooShort)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SecretStore {
        SecretStore::for_testing(&[("k1", &[7u8; 32])])
    }

    #[test]
    fn roundtrip_with_key() {
        let secrets = store();
        let frame = encode("prod", Some(&secrets), &["P", "http://10.0.0.1:8080"]).unwrap();
        assert!(frame.len() <= MAX_MESSAGE_LEN);
        let words = decode(&frame, "prod", Some(&secrets), Duration::from_secs(10)).unwrap();
        assert_eq!(words, vec!["P", "http://10.0.0.1:8080"]);
    }

    #[test]
    fn roundtrip_unauthenticated() {
        let frame = encode("prod", None, &["A", "http://10.0.0.1:8080"]).unwrap();
        // The tag slot is all zeros.
        assert!(frame[frame.len() - TAG_LEN..].iter().all(|&b| b == 0));
        let words = decode(&frame, "prod", None, Duration::from_secs(10)).unwrap();
        assert_eq!(words, vec!["A", "http://10.0.0.1:8080"]);
    }

    #[test]
    fn rejects_wrong_scope() {
        let frame = encode("prod", None, &["P", "u"]).unwrap();
        assert!(matches!(
            decode(&frame, "staging", None, Duration::from_secs(10)),
            Err(FrameError::WrongScope(_))
        ));
    }

    #[test]
    fn rejects_wrong_version() {
        let mut frame = encode("prod", None, &["P", "u"]).unwrap();
        frame[0] = b'1';
        assert!(matches!(
            decode(&frame, "prod", None, Duration::from_secs(10)),
            Err(FrameError::WrongVersion(_))
        ));
    }

    #[test]
    fn rejects_tampered_tag() {
        let secrets = store();
        let mut frame = encode("prod", Some(&secrets), &["P", "u"]).unwrap();
        let last = frame.len() - 1;
        frame[last] ^= 0xff;
        assert_eq!(
            decode(&frame, "prod", Some(&secrets), Duration::from_secs(10)),
            Err(FrameError::AuthFailed)
        );
    }

    #[test]
    fn rejects_tampered_payload() {
        let secrets = store();
        let mut frame = encode("prod", Some(&secrets), &["P", "u"]).unwrap();
        // Flip the command letter.
        let pos = frame.iter().position(|&b| b == b'P').unwrap();
        frame[pos] = b'A';
        assert_eq!(
            decode(&frame, "prod", Some(&secrets), Duration::from_secs(10)),
            Err(FrameError::AuthFailed)
        );
    }

    #[test]
    fn rejects_delayed_packet() {
        let skew = Duration::from_secs(10);
        let frame = encode_at(
            "prod",
            None,
            &["P", "u"],
            now_millis() - (skew.as_millis() as i64 + 1_000),
        )
        .unwrap();
        assert!(matches!(
            decode(&frame, "prod", None, skew),
            Err(FrameError::StaleMessage { .. })
        ));
    }

    #[test]
    fn rejects_future_packet() {
        let skew = Duration::from_secs(10);
        let frame = encode_at("prod", None, &["P", "u"], now_millis() + 60_000).unwrap();
        assert!(matches!(
            decode(&frame, "prod", None, skew),
            Err(FrameError::StaleMessage { .. })
        ));
    }

    #[test]
    fn rejects_unknown_secret() {
        let sender = SecretStore::for_testing(&[("other", &[9u8; 32])]);
        let receiver = store();
        let frame = encode("prod", Some(&sender), &["P", "u"]).unwrap();
        assert!(matches!(
            decode(&frame, "prod", Some(&receiver), Duration::from_secs(10)),
            Err(FrameError::UnknownSecret(_))
        ));
    }

    #[test]
    fn oversize_payload_fails() {
        let url = "x".repeat(600);
        assert!(matches!(
            encode("prod", None, &["P", &url]),
            Err(FrameError::MessageTooLarge(_))
        ));
    }

    #[test]
    fn truncated_frame_fails() {
        let frame = encode("prod", None, &["P", "u"]).unwrap();
        assert_eq!(
            decode(&frame[..10], "prod", None, Duration::from_secs(10)),
            Err(FrameError::TooShort)
        );
    }
}
