//! UUID assignment for observed documents.
//!
//! A placement keeps the UUID it was first recorded with. For a placement
//! seen for the first time, the UUID comes from (in order) a legacy alias
//! for its `kind:native` text, a UUID declared in the document's
//! frontmatter, or a fresh v4 UUID.

use tracing::{debug, warn};

use crate::identity::{DocumentUuid, ProjectName, ProviderId};
use crate::store::RevisionStore;

const FRONTMATTER_KEYS: [&str; 3] = ["uuid", "hermes_uuid", "hermes-uuid"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignmentSource {
    Recorded,
    Alias,
    Frontmatter,
    Generated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Assignment {
    pub uuid: DocumentUuid,
    pub source: AssignmentSource,
}

pub async fn assign_uuid(
    store: &dyn RevisionStore,
    project: &ProjectName,
    provider: &ProviderId,
    content: &[u8],
) -> anyhow::Result<Assignment> {
    if let Some(uuid) = store.uuid_for_provider(project, provider).await? {
        return Ok(Assignment {
            uuid,
            source: AssignmentSource::Recorded,
        });
    }
    if let Some(uuid) = store.lookup_alias(&provider.to_string()).await? {
        debug!(provider = %provider, uuid = %uuid, "UUID resolved through legacy alias");
        return Ok(Assignment {
            uuid,
            source: AssignmentSource::Alias,
        });
    }
    if let Some(uuid) = frontmatter_uuid(content) {
        return Ok(Assignment {
            uuid,
            source: AssignmentSource::Frontmatter,
        });
    }
    let uuid = DocumentUuid::generate();
    debug!(provider = %provider, uuid = %uuid, "Generated new document UUID");
    Ok(Assignment {
        uuid,
        source: AssignmentSource::Generated,
    })
}

/// UUID declared in a leading `---` frontmatter block, if any.
///
/// Values may be quoted. A malformed or nil value is logged and ignored.
pub fn frontmatter_uuid(content: &[u8]) -> Option<DocumentUuid> {
    let text = std::str::from_utf8(content).ok()?;
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);
    let mut lines = text.lines();
    if lines.next()?.trim_end() != "---" {
        return None;
    }
    for line in lines {
        let line = line.trim();
        if line == "---" || line == "..." {
            break;
        }
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        if !FRONTMATTER_KEYS.contains(&key.trim()) {
            continue;
        }
        let value = value.trim().trim_matches(|c| c == '"' || c == '\'');
        match DocumentUuid::parse(value) {
            Ok(uuid) if !uuid.is_zero() => return Some(uuid),
            Ok(_) => warn!(key = key.trim(), "Ignoring nil UUID in frontmatter"),
            Err(e) => warn!(key = key.trim(), error = %e, "Ignoring invalid UUID in frontmatter"),
        }
    }
    None
}
