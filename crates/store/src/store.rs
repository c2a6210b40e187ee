use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use turnloop_core::message::{ContentBlock, Role};
use turnloop_core::session::Session;

use crate::envelope::{decode, encode};
use crate::error::StoreError;

const EXTENSION: &str = "json";

/// Directory of session envelopes, one `<id>.json` file per session.
#[derive(Debug, Clone)]
pub struct SessionStore {
    root: PathBuf,
}

/// What `list` reports about a stored session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSummary {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub message_count: usize,
    /// First line of the first user text, if any
    pub preview: Option<String>,
}

impl SessionSummary {
    fn of(session: &Session) -> Self {
        let preview = session
            .messages()
            .iter()
            .filter(|m| m.role() == Role::User)
            .flat_map(|m| m.content())
            .find_map(|block| match block {
                ContentBlock::Text { text } => {
                    text.lines().next().map(str::to_string)
                }
                _ => None,
            });
        Self {
            id: session.id().to_string(),
            created_at: session.created_at(),
            updated_at: session.updated_at(),
            message_count: session.len(),
            preview,
        }
    }
}

impl SessionStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, id: &str) -> Result<PathBuf, StoreError> {
        let valid = !id.is_empty()
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(StoreError::InvalidId(id.to_string()));
        }
        Ok(self.root.join(format!("{id}.{EXTENSION}")))
    }

    /// Write the session, replacing any previous copy.
    ///
    /// The envelope goes to a temporary sibling first and is renamed into
    /// place, so a crash never leaves a half-written file under the real name.
    pub fn save(&self, session: &Session) -> Result<PathBuf, StoreError> {
        let path = self.path_for(session.id())?;
        fs::create_dir_all(&self.root)
            .map_err(|source| StoreError::io("creating session directory", &self.root, source))?;

        let bytes = encode(session)?;
        let tmp = path.with_extension(format!("{EXTENSION}.tmp"));
        fs::write(&tmp, bytes)
            .map_err(|source| StoreError::io("writing session file", &tmp, source))?;
        fs::rename(&tmp, &path)
            .map_err(|source| StoreError::io("renaming session file", &path, source))?;

        debug!(session_id = %session.id(), path = %path.display(), messages = session.len(), "Saved session");
        Ok(path)
    }

    pub fn load(&self, id: &str) -> Result<Session, StoreError> {
        let path = self.path_for(id)?;
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(id.to_string()));
            }
            Err(source) => return Err(StoreError::io("reading session file", &path, source)),
        };
        decode(&bytes)
    }

    /// Every readable session, most recently updated first.
    ///
    /// Files that fail to decode are skipped with a warning.
    pub fn list(&self) -> Result<Vec<SessionSummary>, StoreError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(StoreError::io("listing session directory", &self.root, source));
            }
        };

        let mut summaries = Vec::new();
        for entry in entries {
            let entry = entry
                .map_err(|source| StoreError::io("listing session directory", &self.root, source))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }

            let decoded = fs::read(&path)
                .map_err(|source| StoreError::io("reading session file", &path, source))
                .and_then(|bytes| decode(&bytes));
            match decoded {
                Ok(session) => summaries.push(SessionSummary::of(&session)),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable session"),
            }
        }

        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| a.id.cmp(&b.id)));
        Ok(summaries)
    }

    /// The most recently updated session.
    pub fn latest(&self) -> Result<Session, StoreError> {
        let newest = self
            .list()?
            .into_iter()
            .next()
            .ok_or_else(|| StoreError::NoSessions {
                root: self.root.clone(),
            })?;
        self.load(&newest.id)
    }
}
