//! Filesystem-backed session store.
//!
//! Each session is one markdown file, `<dir>/session-<id>.md`, holding the
//! machine-owned metadata block followed by the human/agent-editable body.
//! The store does whole-file reads and atomic whole-file writes and no
//! locking: one orchestrator process is assumed to drive a session at a time,
//! and concurrent external edits resolve as last-writer-wins.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use rand::RngCore;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::core::metadata::{Metadata, MetadataPatch, parse_metadata, update_metadata};
use crate::core::status::resolve_content;
use crate::core::types::{Stage, Status};

const FILE_PREFIX: &str = "session-";
const FILE_SUFFIX: &str = ".md";
const CREATED_PREFIX: &str = "Created:";
const WORKDIR_PREFIX: &str = "Working Directory:";

/// Session lookup failures callers branch on.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("session '{0}' not found")]
    NotFound(String),
    #[error("session '{0}' already exists")]
    AlreadyExists(String),
    #[error("invalid session id '{id}': {reason}")]
    InvalidId { id: String, reason: String },
    #[error("no sessions found (create one with `loopgate new`)")]
    NoSessions,
    #[error("multiple sessions found, specify one of: {}", .0.join(", "))]
    Ambiguous(Vec<String>),
}

/// One row of `loopgate sessions`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub id: String,
    pub path: PathBuf,
    /// `None` for sessions without a metadata block.
    pub stage: Option<Stage>,
    pub iterations: u32,
    pub created: Option<String>,
    pub working_directory: Option<String>,
    pub status: Status,
}

#[derive(Debug, Clone)]
pub struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// `<system temp dir>/loopgate`, used when no directory is configured.
    pub fn default_dir() -> PathBuf {
        std::env::temp_dir().join("loopgate")
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{FILE_PREFIX}{id}{FILE_SUFFIX}"))
    }

    /// Directory holding raw agent event streams for a session.
    pub fn logs_dir(&self, id: &str) -> PathBuf {
        self.dir.join("logs").join(id)
    }

    pub fn config_path(&self) -> PathBuf {
        self.dir.join("config.toml")
    }

    /// Create a session for `task` and return its id.
    ///
    /// The new session starts at `stage: initialized` with provenance
    /// (creation time, working directory) recorded in the body header.
    #[instrument(skip(self, task), fields(dir = %self.dir.display()))]
    pub fn create(&self, task: &str, id: Option<&str>, workdir: &Path) -> Result<String> {
        let id = match id {
            Some(id) => {
                validate_id(id)?;
                id.to_string()
            }
            None => generate_id(),
        };
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("create session dir {}", self.dir.display()))?;
        let path = self.path(&id);
        if path.exists() {
            return Err(SessionError::AlreadyExists(id).into());
        }

        let created = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        let doc = format!(
            "# Session: {id}\n{CREATED_PREFIX} {created}\n{WORKDIR_PREFIX} {}\n\n## Task\n\n{}\n",
            workdir.display(),
            task.trim()
        );
        let content = update_metadata(&doc, &MetadataPatch::stage(Stage::Initialized));
        write_atomic(&path, &content)?;
        debug!(%id, "session created");
        Ok(id)
    }

    pub fn exists(&self, id: &str) -> bool {
        self.path(id).is_file()
    }

    pub fn read(&self, id: &str) -> Result<String> {
        let path = self.path(id);
        if !path.is_file() {
            return Err(SessionError::NotFound(id.to_string()).into());
        }
        fs::read_to_string(&path).with_context(|| format!("read session {}", path.display()))
    }

    /// Replace the whole session document.
    pub fn write(&self, id: &str, content: &str) -> Result<()> {
        let path = self.path(id);
        if !path.is_file() {
            return Err(SessionError::NotFound(id.to_string()).into());
        }
        debug!(%id, bytes = content.len(), "writing session");
        write_atomic(&path, content)
    }

    /// Read-modify-write of the metadata block.
    pub fn update_metadata(&self, id: &str, patch: &MetadataPatch) -> Result<Metadata> {
        let content = self.read(id)?;
        let updated = update_metadata(&content, patch);
        self.write(id, &updated)?;
        Ok(parse_metadata(&updated).unwrap_or_default())
    }

    /// All sessions in the store, oldest first.
    pub fn list(&self) -> Result<Vec<SessionSummary>> {
        let mut sessions = Vec::new();
        for id in self.ids()? {
            let path = self.path(&id);
            let content = fs::read_to_string(&path)
                .with_context(|| format!("read session {}", path.display()))?;
            let meta = parse_metadata(&content);
            sessions.push(SessionSummary {
                stage: meta.map(|m| m.stage),
                iterations: meta.map(|m| m.iterations).unwrap_or(0),
                created: created_at(&content).map(str::to_string),
                working_directory: working_directory(&content).map(str::to_string),
                status: resolve_content(&content),
                path,
                id,
            });
        }
        sessions.sort_by(|a, b| a.created.cmp(&b.created).then_with(|| a.id.cmp(&b.id)));
        Ok(sessions)
    }

    /// Delete every session file and its logs. Returns the number of sessions removed.
    pub fn delete_all(&self) -> Result<usize> {
        let ids = self.ids()?;
        for id in &ids {
            let path = self.path(id);
            fs::remove_file(&path).with_context(|| format!("remove {}", path.display()))?;
            let logs = self.logs_dir(id);
            if logs.exists() {
                fs::remove_dir_all(&logs)
                    .with_context(|| format!("remove {}", logs.display()))?;
            }
        }
        Ok(ids.len())
    }

    /// Resolve an explicit id, or pick the only session when none is given.
    pub fn resolve_id(&self, id: Option<&str>) -> Result<String> {
        if let Some(id) = id {
            if !self.exists(id) {
                return Err(SessionError::NotFound(id.to_string()).into());
            }
            return Ok(id.to_string());
        }
        let mut ids = self.ids()?;
        match ids.len() {
            0 => Err(SessionError::NoSessions.into()),
            1 => Ok(ids.remove(0)),
            _ => Err(SessionError::Ambiguous(ids).into()),
        }
    }

    fn ids(&self) -> Result<Vec<String>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.dir)
            .with_context(|| format!("read session dir {}", self.dir.display()))?
        {
            let entry = entry.context("read session dir entry")?;
            if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if let Some(id) = name
                .strip_prefix(FILE_PREFIX)
                .and_then(|rest| rest.strip_suffix(FILE_SUFFIX))
                && !id.is_empty()
            {
                ids.push(id.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }
}

/// Random 8-hex-char session id.
pub fn generate_id() -> String {
    let mut bytes = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Validate that an id is safe to embed in a file name.
pub fn validate_id(id: &str) -> Result<()> {
    let invalid = |reason: &str| SessionError::InvalidId {
        id: id.to_string(),
        reason: reason.to_string(),
    };
    if id.is_empty() {
        return Err(invalid("must not be empty").into());
    }
    if id.starts_with('.') {
        return Err(invalid("must not start with '.'").into());
    }
    if id
        .chars()
        .any(|c| !(c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-'))
    {
        return Err(invalid("must be [A-Za-z0-9._-] only").into());
    }
    Ok(())
}

/// `Created:` timestamp from the session header.
pub fn created_at(content: &str) -> Option<&str> {
    header_value(content, CREATED_PREFIX)
}

/// `Working Directory:` from the session header.
pub fn working_directory(content: &str) -> Option<&str> {
    header_value(content, WORKDIR_PREFIX)
}

fn header_value<'a>(content: &'a str, prefix: &str) -> Option<&'a str> {
    content
        .lines()
        .find_map(|line| line.strip_prefix(prefix))
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("session path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("md.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp session {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace session {}", path.display()))?;
    Ok(())
}
