//! Document identity.
//!
//! A document is identified by a [`DocumentUuid`] that never changes, even
//! when the document moves between storage backends. Where a document lives
//! right now is a [`ProviderId`] (provider kind + backend-native ID). A
//! [`CompositeId`] combines the UUID with an optional placement and an
//! optional project reference.
//!
//! # Text encodings
//!
//! | Form | Example |
//! |------|---------|
//! | short | `uuid/550e8400-e29b-41d4-a716-446655440000` |
//! | full | `uuid:550e8400-…:provider:local:id:docs/a.md:project:platform` |
//! | URI | `uuid/550e8400-…?provider=local&id=docs%2Fa.md&project=platform` |
//! | bare | `550e8400-e29b-41d4-a716-446655440000` (parsed as short) |
//!
//! Every formatter is an exact inverse of [`CompositeId::parse`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use url::form_urlencoded;
use uuid::Uuid;

const SHORT_PREFIX: &str = "uuid/";
const FULL_PREFIX: &str = "uuid:";
const PROVIDER_SEGMENT: &str = ":provider:";
const ID_SEGMENT: &str = ":id:";
const PROJECT_SEGMENT: &str = ":project:";

/// Malformed identity text. Always carries the offending input.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentityError {
    #[error("invalid document UUID '{input}': {reason}")]
    InvalidUuid { input: String, reason: String },

    #[error("unknown provider kind '{0}' (expected local, google, or remote-peer)")]
    UnknownProviderKind(String),

    #[error("invalid {kind} native ID '{input}': {reason}")]
    InvalidNativeId {
        kind: ProviderKind,
        input: String,
        reason: &'static str,
    },

    #[error("invalid project name '{input}': {reason}")]
    InvalidProjectName { input: String, reason: &'static str },

    #[error("unrecognized composite ID '{input}'")]
    UnrecognizedFormat { input: String },

    #[error("malformed composite ID '{input}': {reason}")]
    MalformedComposite { input: String, reason: String },
}

fn malformed(input: &str, reason: impl fmt::Display) -> IdentityError {
    IdentityError::MalformedComposite {
        input: input.to_string(),
        reason: reason.to_string(),
    }
}

// ═══════════════════════════════════════════════════════════════════════
// DocumentUuid
// ═══════════════════════════════════════════════════════════════════════

/// Stable 128-bit document identifier.
///
/// The nil UUID is the "unassigned" sentinel: it is what [`Default`]
/// returns, [`is_zero`](DocumentUuid::is_zero) reports it, and it
/// serializes as `null` rather than as sixteen zero bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct DocumentUuid(Uuid);

impl DocumentUuid {
    /// Generate a fresh random (v4) UUID.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// The unassigned sentinel.
    pub const fn nil() -> Self {
        Self(Uuid::nil())
    }

    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Parse a hyphenated (or simple/braced/URN) UUID string.
    pub fn parse(input: &str) -> Result<Self, IdentityError> {
        if input.is_empty() {
            return Err(IdentityError::InvalidUuid {
                input: String::new(),
                reason: "UUID cannot be empty".to_string(),
            });
        }
        Uuid::parse_str(input)
            .map(Self)
            .map_err(|e| IdentityError::InvalidUuid {
                input: input.to_string(),
                reason: e.to_string(),
            })
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_nil()
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for DocumentUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for DocumentUuid {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for DocumentUuid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if self.is_zero() {
            serializer.serialize_none()
        } else {
            serializer.serialize_str(&self.to_string())
        }
    }
}

impl<'de> Deserialize<'de> for DocumentUuid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            None => Ok(Self::nil()),
            Some(s) if s.is_empty() => Ok(Self::nil()),
            Some(s) => Self::parse(&s).map_err(serde::de::Error::custom),
        }
    }
}

/// Constructors for identifiers written into source code.
///
/// These panic on malformed input. Feed them string literals only (test
/// fixtures, well-known constants); everything read at runtime goes
/// through the fallible parsers.
pub mod literal {
    use super::{CompositeId, DocumentUuid};

    pub fn uuid(text: &'static str) -> DocumentUuid {
        match DocumentUuid::parse(text) {
            Ok(uuid) => uuid,
            Err(e) => panic!("invalid UUID literal {text:?}: {e}"),
        }
    }

    pub fn composite(text: &'static str) -> CompositeId {
        match CompositeId::parse(text) {
            Ok(id) => id,
            Err(e) => panic!("invalid composite ID literal {text:?}: {e}"),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// ProviderKind / ProviderId
// ═══════════════════════════════════════════════════════════════════════

/// The storage backend family a document lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    /// Local filesystem or Git working tree.
    Local,
    /// Google Workspace (Drive file IDs).
    Google,
    /// Another docmesh instance reached over the network.
    RemotePeer,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 3] = [Self::Local, Self::Google, Self::RemotePeer];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Google => "google",
            Self::RemotePeer => "remote-peer",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| IdentityError::UnknownProviderKind(s.to_string()))
    }
}

/// A document's backend-native placement: provider kind plus native ID.
///
/// Local native IDs are workspace-relative paths, normalized to forward
/// slashes with any leading `./` removed. The sequence `:project:` is
/// reserved by the full composite encoding and rejected for every kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "RawProviderId", into = "RawProviderId")]
pub struct ProviderId {
    kind: ProviderKind,
    native: String,
}

#[derive(Serialize, Deserialize)]
struct RawProviderId {
    provider: ProviderKind,
    id: String,
}

impl TryFrom<RawProviderId> for ProviderId {
    type Error = IdentityError;

    fn try_from(raw: RawProviderId) -> Result<Self, Self::Error> {
        ProviderId::new(raw.provider, raw.id)
    }
}

impl From<ProviderId> for RawProviderId {
    fn from(id: ProviderId) -> Self {
        RawProviderId {
            provider: id.kind,
            id: id.native,
        }
    }
}

impl ProviderId {
    pub fn new(kind: ProviderKind, native: impl Into<String>) -> Result<Self, IdentityError> {
        let raw = native.into();
        let invalid = |reason| IdentityError::InvalidNativeId {
            kind,
            input: raw.clone(),
            reason,
        };

        if raw.trim().is_empty() {
            return Err(invalid("native ID cannot be empty"));
        }
        if raw.contains(PROJECT_SEGMENT) {
            return Err(invalid("native ID cannot contain ':project:'"));
        }
        if raw.chars().any(char::is_control) {
            return Err(invalid("native ID cannot contain control characters"));
        }

        let native = match kind {
            ProviderKind::Local => normalize_local_path(&raw).map_err(invalid)?,
            ProviderKind::Google => {
                if !raw
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
                {
                    return Err(invalid("Drive IDs contain only letters, digits, '-' and '_'"));
                }
                raw.clone()
            }
            ProviderKind::RemotePeer => {
                if raw.chars().any(char::is_whitespace) {
                    return Err(invalid("remote IDs cannot contain whitespace"));
                }
                raw.clone()
            }
        };

        Ok(Self { kind, native })
    }

    pub fn local(path: impl Into<String>) -> Result<Self, IdentityError> {
        Self::new(ProviderKind::Local, path)
    }

    pub fn google(file_id: impl Into<String>) -> Result<Self, IdentityError> {
        Self::new(ProviderKind::Google, file_id)
    }

    pub fn remote_peer(uri: impl Into<String>) -> Result<Self, IdentityError> {
        Self::new(ProviderKind::RemotePeer, uri)
    }

    pub fn kind(&self) -> ProviderKind {
        self.kind
    }

    pub fn native_id(&self) -> &str {
        &self.native
    }
}

fn normalize_local_path(raw: &str) -> Result<String, &'static str> {
    let mut path = raw.replace('\\', "/");
    while let Some(rest) = path.strip_prefix("./") {
        path = rest.to_string();
    }
    if path.is_empty() {
        return Err("path cannot be empty");
    }
    let bytes = path.as_bytes();
    let drive_letter = bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':';
    if path.starts_with('/') || drive_letter {
        return Err("path must be relative to the workspace root");
    }
    if path.split('/').any(|segment| segment == "..") {
        return Err("path cannot traverse outside the workspace root");
    }
    Ok(path)
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.native)
    }
}

impl FromStr for ProviderId {
    type Err = IdentityError;

    /// Parses the `kind:native` form produced by [`Display`](fmt::Display).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, native) = s
            .split_once(':')
            .ok_or_else(|| IdentityError::UnknownProviderKind(s.to_string()))?;
        ProviderId::new(kind.parse()?, native)
    }
}

// ═══════════════════════════════════════════════════════════════════════
// ProjectName
// ═══════════════════════════════════════════════════════════════════════

/// A project reference: lowercase kebab-case, at most 64 characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ProjectName(String);

impl ProjectName {
    pub fn new(name: impl Into<String>) -> Result<Self, IdentityError> {
        let name = name.into();
        let invalid = |reason| IdentityError::InvalidProjectName {
            input: name.clone(),
            reason,
        };
        if name.is_empty() {
            return Err(invalid("name cannot be empty"));
        }
        if name.len() > 64 {
            return Err(invalid("name is longer than 64 characters"));
        }
        if !name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return Err(invalid("name must be lowercase alphanumeric with hyphens"));
        }
        if name.starts_with('-') || name.ends_with('-') {
            return Err(invalid("name cannot start or end with a hyphen"));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProjectName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ProjectName {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for ProjectName {
    type Error = IdentityError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ProjectName> for String {
    fn from(name: ProjectName) -> Self {
        name.0
    }
}

// ═══════════════════════════════════════════════════════════════════════
// CompositeId
// ═══════════════════════════════════════════════════════════════════════

/// UUID plus optional placement and project.
///
/// Partial identities are legal: UUID-only is what external callers
/// usually hold; the full form pins a specific backend placement.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CompositeId {
    uuid: DocumentUuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    provider: Option<ProviderId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    project: Option<ProjectName>,
}

impl CompositeId {
    pub fn new(uuid: DocumentUuid, provider: Option<ProviderId>, project: Option<ProjectName>) -> Self {
        Self {
            uuid,
            provider,
            project,
        }
    }

    pub fn from_uuid(uuid: DocumentUuid) -> Self {
        Self::new(uuid, None, None)
    }

    pub fn with_provider(mut self, provider: ProviderId) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn with_project(mut self, project: ProjectName) -> Self {
        self.project = Some(project);
        self
    }

    pub fn uuid(&self) -> DocumentUuid {
        self.uuid
    }

    pub fn provider(&self) -> Option<&ProviderId> {
        self.provider.as_ref()
    }

    pub fn project(&self) -> Option<&ProjectName> {
        self.project.as_ref()
    }

    /// True when UUID, placement, and project are all present.
    pub fn is_complete(&self) -> bool {
        !self.uuid.is_zero() && self.provider.is_some() && self.project.is_some()
    }

    /// `uuid/<uuid>`. Drops placement and project.
    pub fn to_short_string(&self) -> String {
        format!("{SHORT_PREFIX}{}", self.uuid)
    }

    /// `uuid:<uuid>[:provider:<kind>:id:<native>][:project:<project>]`
    pub fn to_full_string(&self) -> String {
        let mut out = format!("{FULL_PREFIX}{}", self.uuid);
        if let Some(provider) = &self.provider {
            out.push_str(PROVIDER_SEGMENT);
            out.push_str(provider.kind().as_str());
            out.push_str(ID_SEGMENT);
            out.push_str(provider.native_id());
        }
        if let Some(project) = &self.project {
            out.push_str(PROJECT_SEGMENT);
            out.push_str(project.as_str());
        }
        out
    }

    /// `uuid/<uuid>[?provider=<kind>&id=<native>&project=<project>]`
    pub fn to_uri_string(&self) -> String {
        let mut out = self.to_short_string();
        if self.provider.is_none() && self.project.is_none() {
            return out;
        }
        let mut query = form_urlencoded::Serializer::new(String::new());
        if let Some(provider) = &self.provider {
            query.append_pair("provider", provider.kind().as_str());
            query.append_pair("id", provider.native_id());
        }
        if let Some(project) = &self.project {
            query.append_pair("project", project.as_str());
        }
        out.push('?');
        out.push_str(&query.finish());
        out
    }

    /// Parse any of the short, URI, full, or bare-UUID encodings, tried in
    /// that order.
    pub fn parse(input: &str) -> Result<Self, IdentityError> {
        if let Some(rest) = input.strip_prefix(SHORT_PREFIX) {
            return Self::parse_short(input, rest);
        }
        if let Some(rest) = input.strip_prefix(FULL_PREFIX) {
            return Self::parse_full(input, rest);
        }
        DocumentUuid::parse(input)
            .map(Self::from_uuid)
            .map_err(|_| IdentityError::UnrecognizedFormat {
                input: input.to_string(),
            })
    }

    fn parse_short(input: &str, rest: &str) -> Result<Self, IdentityError> {
        let (uuid_text, query) = match rest.split_once('?') {
            Some((uuid_text, query)) => (uuid_text, Some(query)),
            None => (rest, None),
        };
        let uuid = DocumentUuid::parse(uuid_text).map_err(|e| malformed(input, e))?;
        let mut id = Self::from_uuid(uuid);

        let Some(query) = query else {
            return Ok(id);
        };
        let mut kind = None;
        let mut native = None;
        let mut project = None;
        for (key, value) in form_urlencoded::parse(query.as_bytes()) {
            let slot = match key.as_ref() {
                "provider" => &mut kind,
                "id" => &mut native,
                "project" => &mut project,
                other => return Err(malformed(input, format!("unknown query parameter '{other}'"))),
            };
            if slot.replace(value.into_owned()).is_some() {
                return Err(malformed(input, format!("query parameter '{key}' given more than once")));
            }
        }
        if kind.is_none() && native.is_none() && project.is_none() {
            return Err(malformed(input, "empty query"));
        }
        id.project = project
            .map(|p| ProjectName::new(p).map_err(|e| malformed(input, e)))
            .transpose()?;
        id.provider = match (kind, native) {
            (Some(kind), Some(native)) => {
                let kind: ProviderKind = kind.parse().map_err(|e| malformed(input, e))?;
                Some(ProviderId::new(kind, native).map_err(|e| malformed(input, e))?)
            }
            (None, None) => None,
            (Some(_), None) => return Err(malformed(input, "provider given without id")),
            (None, Some(_)) => return Err(malformed(input, "id given without provider")),
        };
        Ok(id)
    }

    fn parse_full(input: &str, rest: &str) -> Result<Self, IdentityError> {
        // Native IDs never contain ':project:', so its last occurrence
        // always starts the project segment.
        let (body, project) = match rest.rfind(PROJECT_SEGMENT) {
            Some(pos) => (&rest[..pos], Some(&rest[pos + PROJECT_SEGMENT.len()..])),
            None => (rest, None),
        };
        // UUIDs contain no ':', so the first ':provider:' is ours.
        let (uuid_text, placement) = match body.split_once(PROVIDER_SEGMENT) {
            Some((uuid_text, placement)) => (uuid_text, Some(placement)),
            None => (body, None),
        };

        let uuid = DocumentUuid::parse(uuid_text).map_err(|e| malformed(input, e))?;
        let provider = match placement {
            Some(placement) => {
                let (kind, native) = placement
                    .split_once(ID_SEGMENT)
                    .ok_or_else(|| malformed(input, "provider segment without id"))?;
                let kind: ProviderKind = kind.parse().map_err(|e| malformed(input, e))?;
                Some(ProviderId::new(kind, native).map_err(|e| malformed(input, e))?)
            }
            None => None,
        };
        let project = project
            .map(|p| ProjectName::new(p).map_err(|e| malformed(input, e)))
            .transpose()?;

        Ok(Self::new(uuid, provider, project))
    }
}

impl fmt::Display for CompositeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_full_string())
    }
}

impl FromStr for CompositeId {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl From<DocumentUuid> for CompositeId {
    fn from(uuid: DocumentUuid) -> Self {
        Self::from_uuid(uuid)
    }
}
