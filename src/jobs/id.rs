//! Job identifier validation.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::LifecycleError;

static JOB_ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9_-]{1,128}$").unwrap()
});

/// Whether `raw` is usable as a single path component under a job directory.
/// Job ids and task names share this charset.
pub fn is_path_token(raw: &str) -> bool {
    JOB_ID_RE.is_match(raw)
}

/// A validated job identifier: 1-128 characters of `[A-Za-z0-9_-]`.
///
/// The charset keeps ids safe to use as a single path component.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobId(String);

impl JobId {
    pub fn parse(raw: &str) -> Result<Self, LifecycleError> {
        if is_path_token(raw) {
            Ok(Self(raw.to_string()))
        } else {
            Err(LifecycleError::BadRequest(format!(
                "invalid job id {:?}: expected 1-128 characters of [A-Za-z0-9_-]",
                raw
            )))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for JobId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
