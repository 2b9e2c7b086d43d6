//! Dot-path parsing.
//!
//! A path addresses a node in the value tree: segments are separated by
//! `.`, the empty path addresses the root. A segment addresses an object
//! key, or an array index when the node being navigated is an array and
//! the segment is all digits. Keys that themselves contain `.` are
//! unreachable; there is no escaping.

use crate::error::{CodecError, CodecResult};

/// A parsed dot-path.
///
/// `Path::parse("users.alice.email")` yields the segments
/// `["users", "alice", "email"]`. `Path::root()` (or parsing the empty
/// string) addresses the tree root.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Path {
    segments: Vec<String>,
}

impl Path {
    /// The root path (no segments).
    #[must_use]
    pub fn root() -> Self {
        Self {
            segments: Vec::new(),
        }
    }

    /// Parses a dot-path.
    ///
    /// # Errors
    ///
    /// Returns an error on empty segments (`"a..b"`, leading or trailing
    /// dots) and on wildcard segments, which are only legal in
    /// subscription patterns.
    pub fn parse(raw: &str) -> CodecResult<Self> {
        if raw.is_empty() {
            return Ok(Self::root());
        }

        let mut segments = Vec::new();
        for segment in raw.split('.') {
            if segment.is_empty() {
                return Err(CodecError::malformed_path(format!(
                    "empty segment in path {raw:?}"
                )));
            }
            if segment == "*" || segment == "**" {
                return Err(CodecError::malformed_path(format!(
                    "wildcard segment {segment:?} is not allowed in a data path"
                )));
            }
            segments.push(segment.to_owned());
        }

        Ok(Self { segments })
    }

    /// Checks whether this is the root path.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// Returns the path segments.
    #[must_use]
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Returns the number of segments.
    #[must_use]
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// Checks whether the path has no segments.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Returns the final segment, if any.
    #[must_use]
    pub fn leaf(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    /// Returns the path with the final segment removed.
    ///
    /// The parent of the root is the root.
    #[must_use]
    pub fn parent(&self) -> Path {
        let mut segments = self.segments.clone();
        segments.pop();
        Path { segments }
    }

    /// Returns a new path with `segment` appended.
    #[must_use]
    pub fn child(&self, segment: &str) -> Path {
        let mut segments = self.segments.clone();
        segments.push(segment.to_owned());
        Path { segments }
    }

    /// Checks whether `prefix` is a (non-strict) prefix of this path.
    #[must_use]
    pub fn starts_with(&self, prefix: &Path) -> bool {
        prefix.segments.len() <= self.segments.len()
            && self.segments[..prefix.segments.len()] == prefix.segments[..]
    }

    /// Returns the segments remaining after `prefix`, if `prefix` is a
    /// prefix of this path.
    #[must_use]
    pub fn strip_prefix(&self, prefix: &Path) -> Option<&[String]> {
        if self.starts_with(prefix) {
            Some(&self.segments[prefix.segments.len()..])
        } else {
            None
        }
    }

    /// Renders the path back to dotted form.
    #[must_use]
    pub fn as_dotted(&self) -> String {
        self.segments.join(".")
    }
}

impl std::fmt::Display for Path {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.as_dotted())
    }
}

/// Interprets a segment as an array index.
///
/// A segment is an index iff it is non-empty and all digits.
#[must_use]
pub fn segment_as_index(segment: &str) -> Option<usize> {
    if segment.is_empty() || !segment.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    segment.parse().ok()
}
