//! Canonical job encoding and HMAC signatures.
//!
//! Pure and I/O free. The canonical form is byte-compatible with
//! `json.dumps(job, sort_keys=True, separators=(",", ":"))` so jobs signed
//! by the Python producer tooling verify here and vice versa:
//!
//! - object keys sorted by code point, at every depth
//! - no whitespace
//! - non-ASCII characters and DEL escaped as lower-case `\uXXXX`
//!   (UTF-16 surrogate pairs above the BMP)
//! - the top-level `sig` field removed

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use hmac::{Hmac, Mac};
use serde::ser::{Serialize, SerializeMap, SerializeSeq, Serializer};
use serde_json::{Map, Value};
use sha2::Sha256;
use std::io;

use crate::error::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

/// Name of the signature field on the wire.
pub const SIGNATURE_FIELD: &str = "sig";

/// Canonical bytes of a job, excluding its top-level signature.
pub fn canonicalize(job: &Map<String, Value>) -> Vec<u8> {
    let mut out = Vec::with_capacity(256);
    let mut ser = serde_json::Serializer::with_formatter(&mut out, AsciiFormatter);
    // Writing into a Vec cannot fail and every Value is serializable.
    let _ = CanonicalObject {
        map: job,
        skip: Some(SIGNATURE_FIELD),
    }
    .serialize(&mut ser);
    out
}

/// HMAC-SHA256 over `bytes`, base64 encoded.
pub fn sign(bytes: &[u8], secret: &[u8]) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|_| Error::Other("failed to initialize hmac".to_string()))?;
    mac.update(bytes);
    Ok(STANDARD.encode(mac.finalize().into_bytes()))
}

/// Compute the signature of `job` and store it in its `sig` field.
pub fn sign_job(job: &mut Map<String, Value>, secret: &[u8]) -> Result<()> {
    let sig = sign(&canonicalize(job), secret)?;
    job.insert(SIGNATURE_FIELD.to_string(), Value::String(sig));
    Ok(())
}

/// Check the signature carried by `job`.
///
/// Any malformation (missing or non-string `sig`, bad base64, wrong length)
/// is a failed verification, never an error. The MAC comparison is constant
/// time.
pub fn verify(job: &Map<String, Value>, secret: &[u8]) -> bool {
    let Some(Value::String(sig)) = job.get(SIGNATURE_FIELD) else {
        return false;
    };
    let Ok(provided) = STANDARD.decode(sig.as_bytes()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return false;
    };
    mac.update(&canonicalize(job));
    mac.verify_slice(&provided).is_ok()
}

// ---------------------------------------------------------------------------
// Sorted serialization
// ---------------------------------------------------------------------------

/// Serializes a JSON value with object keys sorted regardless of how the
/// underlying map orders them.
struct Canonical<'a>(&'a Value);

struct CanonicalObject<'a> {
    map: &'a Map<String, Value>,
    skip: Option<&'a str>,
}

impl Serialize for Canonical<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self.0 {
            Value::Object(map) => CanonicalObject { map, skip: None }.serialize(serializer),
            Value::Array(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(&Canonical(item))?;
                }
                seq.end()
            }
            scalar => scalar.serialize(serializer),
        }
    }
}

impl Serialize for CanonicalObject<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut entries: Vec<(&String, &Value)> = self
            .map
            .iter()
            .filter(|(k, _)| Some(k.as_str()) != self.skip)
            .collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));

        let mut map = serializer.serialize_map(Some(entries.len()))?;
        for (key, value) in entries {
            map.serialize_entry(key, &Canonical(value))?;
        }
        map.end()
    }
}

// ---------------------------------------------------------------------------
// ASCII-only compact formatter
// ---------------------------------------------------------------------------

/// Compact formatter that additionally escapes everything outside printable
/// ASCII. serde_json already escapes quotes, backslashes and control
/// characters before fragments reach this formatter.
struct AsciiFormatter;

impl serde_json::ser::Formatter for AsciiFormatter {
    fn write_string_fragment<W>(&mut self, writer: &mut W, fragment: &str) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        let mut start = 0;
        for (i, ch) in fragment.char_indices() {
            if ch.is_ascii() && ch != '\u{7f}' {
                continue;
            }
            if start < i {
                writer.write_all(&fragment.as_bytes()[start..i])?;
            }
            let mut units = [0u16; 2];
            for unit in ch.encode_utf16(&mut units) {
                write!(writer, "\\u{unit:04x}")?;
            }
            start = i + ch.len_utf8();
        }
        writer.write_all(&fragment.as_bytes()[start..])
    }
}
