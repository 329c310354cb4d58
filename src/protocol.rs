//! Wire Protocol Module
//!
//! The request/response protocol between client, proxy, and origin. Requests
//! are ASCII, fit in one bounded read, and responses are either an in-band
//! marker line or raw object bytes terminated by connection close; there is
//! no length prefix anywhere.

use crate::{ProxyError, Result};
use std::fmt;

/// A request must fit in a single read of this many bytes; the transport
/// message boundary is the logical message boundary.
pub const REQUEST_MAX_BYTES: usize = 254;

/// Upper bound on object name length, in bytes.
pub const OBJECT_NAME_MAX_BYTES: usize = 254;

/// Denial sent to a client requesting a blacklisted object.
pub const BLACKLISTED_RESPONSE: &[u8] = b"****black-listed****\n";

/// Sent when the origin does not hold the requested object.
pub const NOT_FOUND_RESPONSE: &[u8] = b"****not-found****\n";

/// Sent for a malformed request or an unknown shard name.
pub const BAD_REQUEST_RESPONSE: &[u8] = b"****bad-request****\n";

/// Sent when a fetch or cache write failed transiently; the client may retry.
pub const UNAVAILABLE_RESPONSE: &[u8] = b"****unavailable****\n";

/// A validated object name, safe to use as a cache and store key.
///
/// Names double as filesystem path components, so validation rejects
/// anything that could traverse out of the per-shard directory: path
/// separators, control bytes, and names starting with `.` (which also
/// reserves the store's internal dot-directories).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectName(String);

impl ObjectName {
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.is_empty() {
            return Err(ProxyError::ProtocolError("empty object name".to_string()));
        }
        if raw.len() > OBJECT_NAME_MAX_BYTES {
            return Err(ProxyError::ProtocolError(format!(
                "object name exceeds {} bytes",
                OBJECT_NAME_MAX_BYTES
            )));
        }
        if raw.starts_with('.') {
            return Err(ProxyError::ProtocolError(format!(
                "object name may not start with '.': {}",
                raw
            )));
        }
        for c in raw.chars() {
            if c == '/' || c == '\\' {
                return Err(ProxyError::ProtocolError(format!(
                    "object name contains path separator: {}",
                    raw
                )));
            }
            if c.is_control() {
                return Err(ProxyError::ProtocolError(
                    "object name contains control characters".to_string(),
                ));
            }
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ObjectName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Decoded client→proxy request: `"<shard-name> <object-name>"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub shard_label: String,
    pub object: ObjectName,
}

impl Request {
    /// Parses the bytes of one bounded read into a request.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(buf)
            .map_err(|_| ProxyError::ProtocolError("request is not valid ASCII".to_string()))?;
        let mut tokens = text.split_whitespace();
        let shard_label = tokens
            .next()
            .ok_or_else(|| ProxyError::ProtocolError("empty request".to_string()))?;
        let object = tokens.next().ok_or_else(|| {
            ProxyError::ProtocolError("request is missing the object name".to_string())
        })?;
        if tokens.next().is_some() {
            return Err(ProxyError::ProtocolError(
                "request has trailing tokens".to_string(),
            ));
        }
        Ok(Self {
            shard_label: shard_label.to_string(),
            object: ObjectName::parse(object)?,
        })
    }
}

/// Parses the bytes of one bounded read into the proxy→origin request,
/// which is a bare object name.
pub fn parse_origin_request(buf: &[u8]) -> Result<ObjectName> {
    let text = std::str::from_utf8(buf)
        .map_err(|_| ProxyError::ProtocolError("request is not valid ASCII".to_string()))?;
    let mut tokens = text.split_whitespace();
    let name = tokens
        .next()
        .ok_or_else(|| ProxyError::ProtocolError("empty request".to_string()))?;
    if tokens.next().is_some() {
        return Err(ProxyError::ProtocolError(
            "request has trailing tokens".to_string(),
        ));
    }
    ObjectName::parse(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_request() {
        let req = Request::parse(b"three index.html").unwrap();
        assert_eq!(req.shard_label, "three");
        assert_eq!(req.object.as_str(), "index.html");
    }

    #[test]
    fn test_parse_request_tolerates_surrounding_whitespace() {
        let req = Request::parse(b"  one  page.txt \n").unwrap();
        assert_eq!(req.shard_label, "one");
        assert_eq!(req.object.as_str(), "page.txt");
    }

    #[test]
    fn test_parse_request_rejects_missing_object() {
        assert!(Request::parse(b"one").is_err());
        assert!(Request::parse(b"").is_err());
        assert!(Request::parse(b"   ").is_err());
    }

    #[test]
    fn test_parse_request_rejects_trailing_tokens() {
        assert!(Request::parse(b"one a.txt extra").is_err());
    }

    #[test]
    fn test_parse_request_rejects_non_utf8() {
        assert!(Request::parse(&[0x6f, 0x6e, 0x65, 0x20, 0xff, 0xfe]).is_err());
    }

    #[test]
    fn test_object_name_rejects_traversal() {
        assert!(ObjectName::parse("../etc/passwd").is_err());
        assert!(ObjectName::parse("..").is_err());
        assert!(ObjectName::parse("a/b").is_err());
        assert!(ObjectName::parse("a\\b").is_err());
        assert!(ObjectName::parse(".hidden").is_err());
    }

    #[test]
    fn test_object_name_rejects_control_bytes() {
        assert!(ObjectName::parse("a\x00b").is_err());
        assert!(ObjectName::parse("a\tb").is_err());
    }

    #[test]
    fn test_object_name_rejects_overlong() {
        let long = "x".repeat(OBJECT_NAME_MAX_BYTES + 1);
        assert!(ObjectName::parse(&long).is_err());
        let max = "x".repeat(OBJECT_NAME_MAX_BYTES);
        assert!(ObjectName::parse(&max).is_ok());
    }

    #[test]
    fn test_object_name_accepts_interior_dots() {
        assert!(ObjectName::parse("release-v1..2.tar").is_ok());
        assert!(ObjectName::parse("index.html").is_ok());
    }

    #[test]
    fn test_parse_origin_request() {
        let name = parse_origin_request(b"index.html\n").unwrap();
        assert_eq!(name.as_str(), "index.html");
        assert!(parse_origin_request(b"two tokens").is_err());
        assert!(parse_origin_request(b"").is_err());
    }
}
