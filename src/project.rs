//! Project directories on disk.
//!
//! Projects live under a common base directory, one directory per project
//! id, with an optional `project.json` holding metadata such as the display
//! name. The sync engine only needs to turn a project id into a root
//! directory and a client-supplied file path into a file under that root.

use async_trait::async_trait;
use std::io;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

/// Metadata file at the root of every project
pub const PROJECT_METADATA_FILE: &str = "project.json";

/// Extensions edited as text
const TEXT_EXTENSIONS: &[&str] = &[
    "tex", "ltx", "sty", "cls", "bib", "bst", "bbx", "cbx", "dtx", "ins", "txt", "md", "json", "yaml", "yml",
    "toml", "csv", "tsv", "xml", "html", "css", "js", "ts", "py", "lua", "cfg", "ini",
];

/// Extensionless files edited as text
const TEXT_FILE_NAMES: &[&str] = &["latexmkrc", ".latexmkrc", "Makefile", "README", "LICENSE"];

/// Errors that can occur while resolving a project
#[derive(Error, Debug)]
pub enum ProjectError {
    #[error("Invalid project id: {0}")]
    InvalidId(String),

    #[error("Project not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Rejected file paths
#[derive(Error, Debug, PartialEq, Eq)]
pub enum PathError {
    #[error("Empty path")]
    Empty,

    #[error("Absolute path not allowed: {0}")]
    Absolute(String),

    #[error("Path escapes project root: {0}")]
    EscapesRoot(String),

    #[error("Path contains a NUL byte")]
    NulByte,
}

/// Resolves project ids to directories
#[async_trait]
pub trait ProjectResolver: Send + Sync {
    /// Root directory of an existing project
    async fn resolve_root(&self, project_id: &str) -> Result<PathBuf, ProjectError>;

    /// Display name from the project metadata, falling back to the id
    async fn project_name(&self, project_id: &str) -> Result<String, ProjectError> {
        let root = self.resolve_root(project_id).await?;
        Ok(read_project_name(&root).await.unwrap_or_else(|| project_id.to_string()))
    }
}

/// Projects stored as directories under a base path
#[derive(Debug, Clone)]
pub struct ProjectDirectory {
    base: PathBuf,
}

impl ProjectDirectory {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }
}

#[async_trait]
impl ProjectResolver for ProjectDirectory {
    async fn resolve_root(&self, project_id: &str) -> Result<PathBuf, ProjectError> {
        if !is_valid_project_id(project_id) {
            return Err(ProjectError::InvalidId(project_id.to_string()));
        }

        let root = self.base.join(project_id);
        match tokio::fs::metadata(&root).await {
            Ok(meta) if meta.is_dir() => Ok(root),
            Ok(_) => Err(ProjectError::NotFound(project_id.to_string())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(ProjectError::NotFound(project_id.to_string())),
            Err(e) => Err(e.into()),
        }
    }
}

/// Ids are single path components of `[A-Za-z0-9_-]`
fn is_valid_project_id(project_id: &str) -> bool {
    !project_id.is_empty()
        && project_id.len() <= 128
        && project_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

async fn read_project_name(root: &Path) -> Option<String> {
    let raw = tokio::fs::read(root.join(PROJECT_METADATA_FILE)).await.ok()?;
    let meta: serde_json::Value = serde_json::from_slice(&raw).ok()?;
    meta.get("name")
        .and_then(|name| name.as_str())
        .filter(|name| !name.is_empty())
        .map(str::to_string)
}

/// Join a client-supplied relative path onto `root` without touching the
/// filesystem. `..` may not climb above the root. Symlinks inside the
/// project are not resolved.
pub fn safe_join(root: &Path, relative: &str) -> Result<PathBuf, PathError> {
    if relative.is_empty() {
        return Err(PathError::Empty);
    }
    if relative.contains('\0') {
        return Err(PathError::NulByte);
    }

    let mut parts: Vec<&std::ffi::OsStr> = Vec::new();
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(part) => parts.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if parts.pop().is_none() {
                    return Err(PathError::EscapesRoot(relative.to_string()));
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(PathError::Absolute(relative.to_string()));
            }
        }
    }

    if parts.is_empty() {
        return Err(PathError::Empty);
    }

    let mut joined = root.to_path_buf();
    joined.extend(parts);
    Ok(joined)
}

/// Whether a file is edited as text (and therefore shareable)
pub fn is_text_file(file_path: &str) -> bool {
    let path = Path::new(file_path);
    let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
        return false;
    };
    if TEXT_FILE_NAMES.contains(&name) {
        return true;
    }
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| TEXT_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}
