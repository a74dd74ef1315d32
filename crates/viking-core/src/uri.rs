//! The `viking://` URI model.
//!
//! URIs are case-sensitive, slash-separated, and always stored in normalised
//! form: `./` segments removed, `//` runs collapsed, no trailing slash. Two
//! URIs compare equal iff their normalised forms are byte-identical.

use serde::{Deserialize, Serialize};

use crate::error::{VikingError, VikingResult};

/// URI scheme prefix for the Viking namespace.
pub const SCHEME: &str = "viking://";

/// Maximum total URI length in bytes.
pub const MAX_URI_BYTES: usize = 2048;

/// Maximum length of a single path segment in bytes.
pub const MAX_SEGMENT_BYTES: usize = 255;

/// Enumerates the reserved scope roots of the namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Resources,
    User,
    Agent,
    Temp,
    System,
}

impl Scope {
    /// Parses the first path segment of a URI into a scope.
    pub fn from_segment(segment: &str) -> Option<Self> {
        match segment {
            "resources" => Some(Self::Resources),
            "user" => Some(Self::User),
            "agent" => Some(Self::Agent),
            "temp" => Some(Self::Temp),
            ".system" => Some(Self::System),
            _ => None,
        }
    }

    /// Returns the root segment spelling.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Resources => "resources",
            Self::User => "user",
            Self::Agent => "agent",
            Self::Temp => "temp",
            Self::System => ".system",
        }
    }
}

/// Enumerates the three kinds of stable content in the namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeKind {
    Resource,
    Memory,
    Skill,
}

impl ScopeKind {
    /// Returns the stable snake_case wire representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Resource => "resource",
            Self::Memory => "memory",
            Self::Skill => "skill",
        }
    }

    /// Parses a kind token used by ingest APIs.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "resource" | "resources" => Some(Self::Resource),
            "memory" | "user" => Some(Self::Memory),
            "skill" | "agent" => Some(Self::Skill),
            _ => None,
        }
    }

    /// Returns the stable namespace root content of this kind is promoted under.
    pub fn base_uri(self) -> VikingUri {
        let raw = match self {
            Self::Resource => "viking://resources",
            Self::Memory => "viking://user/memories",
            Self::Skill => "viking://agent/skills",
        };
        VikingUri {
            raw: raw.to_string(),
        }
    }
}

/// A normalised position in the `viking://` namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VikingUri {
    raw: String,
}

impl VikingUri {
    /// Parses and normalises a URI string.
    ///
    /// Rejects non-`viking://` schemes, NUL bytes, over-long segments and
    /// over-long URIs with `INVALID_ARGUMENT`.
    pub fn parse(input: &str) -> VikingResult<Self> {
        let trimmed = input.trim();
        let rest = trimmed
            .strip_prefix(SCHEME)
            .ok_or_else(|| VikingError::invalid_argument(format!("not a viking:// URI: '{trimmed}'")))?;

        let mut segments = Vec::new();
        for segment in rest.split('/') {
            if segment.is_empty() || segment == "." {
                continue;
            }
            if segment == ".." {
                return Err(VikingError::invalid_argument(format!(
                    "parent traversal is not allowed in '{trimmed}'"
                )));
            }
            if segment.contains('\0') {
                return Err(VikingError::invalid_argument("URI segment contains NUL byte"));
            }
            if segment.len() > MAX_SEGMENT_BYTES {
                return Err(VikingError::invalid_argument(format!(
                    "URI segment exceeds {MAX_SEGMENT_BYTES} bytes"
                )));
            }
            segments.push(segment);
        }

        let raw = if segments.is_empty() {
            SCHEME.to_string()
        } else {
            format!("{SCHEME}{}", segments.join("/"))
        };
        if raw.len() > MAX_URI_BYTES {
            return Err(VikingError::invalid_argument(format!(
                "URI exceeds {MAX_URI_BYTES} bytes"
            )));
        }
        Ok(Self { raw })
    }

    /// Returns the namespace root `viking://`.
    pub fn root() -> Self {
        Self {
            raw: SCHEME.to_string(),
        }
    }

    /// Builds a fresh scratch-tree root `viking://temp/<uuid>`.
    pub fn new_temp_root() -> Self {
        Self {
            raw: format!("{SCHEME}temp/{}", uuid::Uuid::new_v4()),
        }
    }

    /// Returns the normalised string form.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Returns true for the bare `viking://` namespace root.
    pub fn is_root(&self) -> bool {
        self.raw == SCHEME
    }

    /// Returns the path segments below the scheme.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.raw[SCHEME.len()..]
            .split('/')
            .filter(|segment| !segment.is_empty())
    }

    /// Returns the scope root this URI sits under, if any.
    pub fn scope(&self) -> Option<Scope> {
        self.segments().next().and_then(Scope::from_segment)
    }

    /// Returns true when this URI is exactly one of the reserved scope roots.
    pub fn is_scope_root(&self) -> bool {
        let mut segments = self.segments();
        match (segments.next(), segments.next()) {
            (Some(first), None) => Scope::from_segment(first).is_some(),
            _ => false,
        }
    }

    /// Returns the final path segment, if any.
    pub fn name(&self) -> Option<&str> {
        self.segments().last()
    }

    /// Strips the trailing segment; `None` at the namespace root.
    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            return None;
        }
        let body = &self.raw[SCHEME.len()..];
        match body.rfind('/') {
            Some(index) => Some(Self {
                raw: format!("{SCHEME}{}", &body[..index]),
            }),
            None => Some(Self::root()),
        }
    }

    /// Appends one validated segment.
    pub fn join(&self, segment: &str) -> VikingResult<Self> {
        if segment.is_empty() || segment == "." || segment == ".." {
            return Err(VikingError::invalid_argument(format!(
                "invalid URI segment '{segment}'"
            )));
        }
        if segment.contains('/') || segment.contains('\0') {
            return Err(VikingError::invalid_argument(format!(
                "URI segment '{segment}' contains reserved bytes"
            )));
        }
        if segment.len() > MAX_SEGMENT_BYTES {
            return Err(VikingError::invalid_argument(format!(
                "URI segment exceeds {MAX_SEGMENT_BYTES} bytes"
            )));
        }
        let raw = if self.is_root() {
            format!("{SCHEME}{segment}")
        } else {
            format!("{}/{segment}", self.raw)
        };
        if raw.len() > MAX_URI_BYTES {
            return Err(VikingError::invalid_argument(format!(
                "URI exceeds {MAX_URI_BYTES} bytes"
            )));
        }
        Ok(Self { raw })
    }

    /// Returns true when `self` equals `prefix` or sits underneath it.
    ///
    /// Matching is segment-aligned: `viking://resources/docs` is not a prefix
    /// of `viking://resources/docs2`.
    pub fn starts_with(&self, prefix: &VikingUri) -> bool {
        if prefix.is_root() {
            return true;
        }
        if self.raw == prefix.raw {
            return true;
        }
        self.raw.starts_with(&prefix.raw)
            && self.raw.as_bytes().get(prefix.raw.len()) == Some(&b'/')
    }

    /// Returns the slash-joined path below the scheme, used by storage backends.
    pub fn storage_path(&self) -> &str {
        &self.raw[SCHEME.len()..]
    }
}

impl std::fmt::Display for VikingUri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

impl TryFrom<String> for VikingUri {
    type Error = VikingError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<VikingUri> for String {
    fn from(value: VikingUri) -> Self {
        value.raw
    }
}

impl std::str::FromStr for VikingUri {
    type Err = VikingError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value)
    }
}

/// Returns true for names hidden from listings (`.`-prefixed).
pub fn is_hidden_name(name: &str) -> bool {
    name.starts_with('.')
}

#[cfg(test)]
mod tests {
    use super::{Scope, ScopeKind, VikingUri};
    use crate::error::ErrorCode;

    #[test]
    fn normalisation_collapses_dot_and_double_slash() {
        let uri = VikingUri::parse("viking://resources//docs/./guide").expect("parse");
        assert_eq!(uri.as_str(), "viking://resources/docs/guide");
        let twin = VikingUri::parse("viking://resources/docs/guide/").expect("parse");
        assert_eq!(uri, twin);
    }

    #[test]
    fn rejects_foreign_scheme_and_traversal() {
        assert_eq!(
            VikingUri::parse("file:///etc/passwd").expect_err("scheme").code,
            ErrorCode::InvalidArgument
        );
        assert_eq!(
            VikingUri::parse("viking://resources/../user").expect_err("dotdot").code,
            ErrorCode::InvalidArgument
        );
    }

    #[test]
    fn rejects_oversized_segments_and_uris() {
        let long_segment = "x".repeat(256);
        let error = VikingUri::parse(&format!("viking://resources/{long_segment}"))
            .expect_err("segment too long");
        assert_eq!(error.code, ErrorCode::InvalidArgument);

        let base = VikingUri::parse("viking://resources").expect("parse");
        let mut uri = base;
        let mut failed = false;
        for _ in 0..12 {
            match uri.join(&"y".repeat(200)) {
                Ok(next) => uri = next,
                Err(error) => {
                    assert_eq!(error.code, ErrorCode::InvalidArgument);
                    failed = true;
                    break;
                }
            }
        }
        assert!(failed, "joining past the total limit must fail");
    }

    #[test]
    fn parent_walks_to_root() {
        let uri = VikingUri::parse("viking://user/memories/berlin").expect("parse");
        let parent = uri.parent().expect("parent");
        assert_eq!(parent.as_str(), "viking://user/memories");
        let scope_root = parent.parent().expect("scope root parent");
        assert_eq!(scope_root.as_str(), "viking://user");
        let root = scope_root.parent().expect("root");
        assert!(root.is_root());
        assert!(root.parent().is_none());
    }

    #[test]
    fn prefix_match_is_segment_aligned() {
        let prefix = VikingUri::parse("viking://resources/docs").expect("parse");
        let child = VikingUri::parse("viking://resources/docs/guide.md").expect("parse");
        let sibling = VikingUri::parse("viking://resources/docs2").expect("parse");
        assert!(child.starts_with(&prefix));
        assert!(prefix.starts_with(&prefix));
        assert!(!sibling.starts_with(&prefix));
        assert!(child.starts_with(&VikingUri::root()));
    }

    #[test]
    fn scope_detection_covers_reserved_roots() {
        let cases = [
            ("viking://resources/a", Scope::Resources),
            ("viking://user/memories", Scope::User),
            ("viking://agent/skills/s", Scope::Agent),
            ("viking://temp/abc", Scope::Temp),
            ("viking://.system/queues", Scope::System),
        ];
        for (raw, scope) in cases {
            let uri = VikingUri::parse(raw).expect("parse");
            assert_eq!(uri.scope(), Some(scope), "{raw}");
        }
        assert!(VikingUri::parse("viking://resources")
            .expect("parse")
            .is_scope_root());
    }

    #[test]
    fn scope_kind_base_uris_are_fixed() {
        assert_eq!(ScopeKind::Resource.base_uri().as_str(), "viking://resources");
        assert_eq!(ScopeKind::Memory.base_uri().as_str(), "viking://user/memories");
        assert_eq!(ScopeKind::Skill.base_uri().as_str(), "viking://agent/skills");
    }

    #[test]
    fn temp_roots_are_unique() {
        let first = VikingUri::new_temp_root();
        let second = VikingUri::new_temp_root();
        assert_ne!(first, second);
        assert_eq!(first.scope(), Some(Scope::Temp));
    }

    #[test]
    fn serde_round_trip_validates() {
        let uri = VikingUri::parse("viking://agent/skills/review").expect("parse");
        let encoded = serde_json::to_string(&uri).expect("encode");
        assert_eq!(encoded, "\"viking://agent/skills/review\"");
        let decoded: VikingUri = serde_json::from_str(&encoded).expect("decode");
        assert_eq!(decoded, uri);
        assert!(serde_json::from_str::<VikingUri>("\"http://x\"").is_err());
    }
}
