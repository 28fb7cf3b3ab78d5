mod error;

pub use error::StoreError;

use chrono::Utc;
use devpilot_core::{DEFAULT_MAX_SESSION_BYTES, Session, SessionSummary, runtime_dir};
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub type StoreResult<T> = Result<T, StoreError>;

const SESSION_EXT: &str = "json";
const MAX_ID_LEN: usize = 128;

/// One JSON file per session id under `.devpilot/sessions/`.
///
/// Single writer per id: concurrent runs sharing a session id must be
/// serialized by the caller.
#[derive(Debug, Clone)]
pub struct SessionStore {
    dir: PathBuf,
    max_bytes: u64,
}

impl SessionStore {
    pub fn new(workspace: &Path) -> StoreResult<Self> {
        Self::at(runtime_dir(workspace).join("sessions"))
    }

    pub fn at(dir: impl Into<PathBuf>) -> StoreResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| StoreError::io("creating session dir", &dir, e))?;
        Ok(Self {
            dir,
            max_bytes: DEFAULT_MAX_SESSION_BYTES,
        })
    }

    pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Validate, stamp `updated_at`, and write the session atomically.
    /// An oversized payload is rejected and leaves both the file and the
    /// in-memory session untouched.
    pub fn save(&self, session: &mut Session) -> StoreResult<()> {
        validate_session(session)?;
        let previous = session.updated_at;
        session.updated_at = Utc::now().max(session.created_at);

        let bytes = match serde_json::to_vec_pretty(session) {
            Ok(bytes) => bytes,
            Err(err) => {
                session.updated_at = previous;
                return Err(StoreError::serde("serialize", self.path_for(&session.id), err));
            }
        };
        let size = bytes.len() as u64;
        if size > self.max_bytes {
            session.updated_at = previous;
            return Err(StoreError::TooLarge {
                id: session.id.clone(),
                size,
                limit: self.max_bytes,
            });
        }

        let path = self.path_for(&session.id);
        let tmp = self
            .dir
            .join(format!(".{}.{}.tmp", session.id, Uuid::now_v7()));
        if let Err(err) = fs::write(&tmp, &bytes) {
            session.updated_at = previous;
            return Err(StoreError::io("writing session", &tmp, err));
        }
        if let Err(err) = fs::rename(&tmp, &path) {
            let _ = fs::remove_file(&tmp);
            session.updated_at = previous;
            return Err(StoreError::io("replacing session", &path, err));
        }
        Ok(())
    }

    pub fn load(&self, id: &str) -> StoreResult<Session> {
        validate_id(id)?;
        let path = self.path_for(id);
        if !path.is_file() {
            return Err(StoreError::NotFound { id: id.to_string() });
        }
        let raw = fs::read(&path).map_err(|e| StoreError::io("reading session", &path, e))?;
        let session: Session =
            serde_json::from_slice(&raw).map_err(|e| StoreError::serde("parse", &path, e))?;
        validate_session(&session)?;
        if session.id != id {
            return Err(StoreError::invalid(format!(
                "file for {id} contains session {}",
                session.id
            )));
        }
        Ok(session)
    }

    /// Summaries of every loadable session, most recently updated first.
    /// Files that fail to load are skipped.
    pub fn list(&self) -> StoreResult<Vec<SessionSummary>> {
        let entries =
            fs::read_dir(&self.dir).map_err(|e| StoreError::io("listing sessions", &self.dir, e))?;
        let mut summaries = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(SESSION_EXT) {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            if let Ok(session) = self.load(id) {
                summaries.push(session.summary());
            }
        }
        summaries.sort_by(|a, b| {
            b.updated_at
                .cmp(&a.updated_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        Ok(summaries)
    }

    /// Delete the oldest sessions beyond `max_keep`. Per-file deletion
    /// errors are ignored. Returns how many files were removed.
    pub fn cleanup_old(&self, max_keep: usize) -> StoreResult<usize> {
        let summaries = self.list()?;
        let mut removed = 0;
        for summary in summaries.iter().skip(max_keep) {
            if fs::remove_file(self.path_for(&summary.id)).is_ok() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub fn exists(&self, id: &str) -> bool {
        validate_id(id).is_ok() && self.path_for(id).is_file()
    }

    pub fn delete(&self, id: &str) -> StoreResult<()> {
        validate_id(id)?;
        let path = self.path_for(id);
        if !path.is_file() {
            return Err(StoreError::NotFound { id: id.to_string() });
        }
        fs::remove_file(&path).map_err(|e| StoreError::io("deleting session", &path, e))
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.{SESSION_EXT}"))
    }
}

fn validate_id(id: &str) -> StoreResult<()> {
    if id.trim().is_empty() {
        return Err(StoreError::invalid("session id is empty"));
    }
    if id.len() > MAX_ID_LEN {
        return Err(StoreError::invalid(format!(
            "session id longer than {MAX_ID_LEN} characters"
        )));
    }
    if !id
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_')
    {
        return Err(StoreError::invalid(format!(
            "session id contains unsupported characters: {id}"
        )));
    }
    Ok(())
}

// The agent kind is a closed enum, so an unknown kind already fails at parse time.
fn validate_session(session: &Session) -> StoreResult<()> {
    validate_id(&session.id)?;
    if session.created_at.timestamp() <= 0 {
        return Err(StoreError::invalid("created_at is not set"));
    }
    Ok(())
}
