use super::StoreError;
use std::fmt;
use std::str::FromStr;

/// Characters the backing tree refuses inside a single key.
const FORBIDDEN_KEY_CHARS: &[char] = &['/', '.', '#', '$', '[', ']'];

/// Maximum key length accepted by the tree, in bytes.
const MAX_KEY_LEN: usize = 768;

/// Returns true if `key` can be used as a single path segment.
pub fn is_valid_key(key: &str) -> bool {
    !key.is_empty()
        && key.len() <= MAX_KEY_LEN
        && !key.chars().any(|c| FORBIDDEN_KEY_CHARS.contains(&c) || c.is_control())
}

/// A validated location inside the tree, e.g. `posts/p1/applications/a1`.
///
/// The empty path is the root of the tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct TreePath {
    segments: Vec<String>,
}

impl TreePath {
    pub fn root() -> Self {
        Self::default()
    }

    /// Parse a `/`-separated path. Leading and trailing slashes are ignored.
    pub fn parse(raw: &str) -> Result<Self, StoreError> {
        let trimmed = raw.trim_matches('/');
        if trimmed.is_empty() {
            return Ok(Self::root());
        }
        let mut segments = Vec::new();
        for segment in trimmed.split('/') {
            if segment.is_empty() {
                return Err(StoreError::InvalidPath {
                    path: raw.to_string(),
                    reason: "empty segment",
                });
            }
            if !is_valid_key(segment) {
                return Err(StoreError::InvalidPath {
                    path: raw.to_string(),
                    reason: "segment contains a forbidden character",
                });
            }
            segments.push(segment.to_string());
        }
        Ok(Self { segments })
    }

    /// Build a path from already-validated segments.
    pub fn from_segments<I, S>(segments: I) -> Result<Self, StoreError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let segments: Vec<String> = segments.into_iter().map(Into::into).collect();
        if let Some(bad) = segments.iter().find(|s| !is_valid_key(s)) {
            return Err(StoreError::InvalidPath {
                path: segments.join("/"),
                reason: if bad.is_empty() {
                    "empty segment"
                } else {
                    "segment contains a forbidden character"
                },
            });
        }
        Ok(Self { segments })
    }

    /// Append one key. Keys coming from store listings are always valid;
    /// keys coming from record fields must be checked with [`is_valid_key`] first.
    pub fn child(&self, key: &str) -> Self {
        debug_assert!(is_valid_key(key), "invalid tree key: {key:?}");
        let mut segments = self.segments.clone();
        segments.push(key.to_string());
        Self { segments }
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn last(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    pub fn parent(&self) -> Option<TreePath> {
        if self.segments.is_empty() {
            None
        } else {
            Some(Self {
                segments: self.segments[..self.segments.len() - 1].to_vec(),
            })
        }
    }

    /// True if `self` is `other` or one of its ancestors.
    pub fn contains(&self, other: &TreePath) -> bool {
        other.segments.len() >= self.segments.len()
            && other.segments[..self.segments.len()] == self.segments[..]
    }

    /// Segments of `other` below `self`, if `self` contains `other`.
    pub fn relative<'a>(&self, other: &'a TreePath) -> Option<&'a [String]> {
        if self.contains(other) {
            Some(&other.segments[self.segments.len()..])
        } else {
            None
        }
    }
}

impl fmt::Display for TreePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.segments.is_empty() {
            write!(f, "/")
        } else {
            write!(f, "{}", self.segments.join("/"))
        }
    }
}

impl FromStr for TreePath {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_trims_slashes() {
        let path = TreePath::parse("/posts/p1/").unwrap();
        assert_eq!(path.segments(), &["posts".to_string(), "p1".to_string()]);
        assert_eq!(path.to_string(), "posts/p1");
    }

    #[test]
    fn parse_empty_is_root() {
        assert!(TreePath::parse("").unwrap().is_root());
        assert!(TreePath::parse("/").unwrap().is_root());
        assert_eq!(TreePath::root().to_string(), "/");
    }

    #[test]
    fn parse_rejects_bad_segments() {
        assert!(TreePath::parse("posts//p1").is_err());
        assert!(TreePath::parse("posts/p.1").is_err());
        assert!(TreePath::parse("posts/$key").is_err());
        assert!(TreePath::parse("posts/[0]").is_err());
    }

    #[test]
    fn from_segments_validates() {
        assert!(TreePath::from_segments(["users", "u1"]).is_ok());
        assert!(TreePath::from_segments(["users", "a/b"]).is_err());
        assert!(TreePath::from_segments(["users", ""]).is_err());
    }

    #[test]
    fn contains_and_relative() {
        let posts = TreePath::parse("posts").unwrap();
        let entry = TreePath::parse("posts/p1/applications/a1").unwrap();
        assert!(posts.contains(&entry));
        assert!(posts.contains(&posts));
        assert!(!entry.contains(&posts));
        assert_eq!(
            posts.relative(&entry).unwrap(),
            &["p1".to_string(), "applications".to_string(), "a1".to_string()]
        );
        assert!(TreePath::root().contains(&entry));
    }

    #[test]
    fn parent_and_last() {
        let entry = TreePath::parse("users/u1/applications").unwrap();
        assert_eq!(entry.last(), Some("applications"));
        assert_eq!(entry.parent().unwrap().to_string(), "users/u1");
        assert!(TreePath::root().parent().is_none());
    }

    #[test]
    fn key_validation() {
        assert!(is_valid_key("-Kx9abc_DEF"));
        assert!(!is_valid_key(""));
        assert!(!is_valid_key("a.b"));
        assert!(!is_valid_key("line\nbreak"));
        assert!(!is_valid_key(&"k".repeat(MAX_KEY_LEN + 1)));
    }
}
