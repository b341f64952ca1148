//! Stream identifiers.

use anyhow::{anyhow, Result};
use serde::Serialize;
use std::fmt;
use std::sync::OnceLock;

/// Name of one camera/direction feed ("Front", "Left", ...).
///
/// The set of streams is fixed at start-up. Identifiers end up verbatim in the
/// rendered detections string, so they are restricted to characters that cannot
/// collide with its `:{}|` delimiters.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct StreamId(String);

impl StreamId {
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        validate_stream_id(&id)?;
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for StreamId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Allowed: "Front", "rear_left", "cam-3".
/// Disallowed: empty, whitespace, or any punctuation outside [_-].
pub fn validate_stream_id(id: &str) -> Result<()> {
    static STREAM_ID_RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = STREAM_ID_RE.get_or_init(|| regex::Regex::new(r"^[A-Za-z0-9_-]{1,32}$").unwrap());

    if !re.is_match(id) {
        return Err(anyhow!(
            "stream id '{}' must match ^[A-Za-z0-9_-]{{1,32}}$",
            id
        ));
    }
    Ok(())
}
