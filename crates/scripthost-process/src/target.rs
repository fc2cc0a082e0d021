use std::path::{Component, Path, PathBuf};

/// Entry segment used for a repository target before its runnable file is chosen.
pub const REPO_PLACEHOLDER: &str = "PLACEHOLDER";

const SEPARATOR: char = '|';

/// Opaque key of one hosted target.
///
/// Shapes (exactly one applies to any string):
/// - user file: `u<digits>|<filename>`
/// - repo file: `<repo>|<relative path>` (one separator, not a user file)
/// - legacy: everything else, including strings with more than one separator
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(transparent)]
pub struct TargetId(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum TargetKind {
    #[serde(rename = "file")]
    UserFile,
    #[serde(rename = "repo")]
    RepoFile,
    #[serde(rename = "legacy")]
    Legacy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetIdError {
    Empty,
    Separator,
    Shape,
}

impl std::fmt::Display for TargetIdError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TargetIdError::Empty => f.write_str("identifier segment must be non-empty"),
            TargetIdError::Separator => f.write_str("identifier segment must not contain '|'"),
            TargetIdError::Shape => f.write_str("identifier does not have the requested shape"),
        }
    }
}

impl std::error::Error for TargetIdError {}

fn owner_digits(head: &str) -> Option<&str> {
    head.strip_prefix('u')
        .filter(|d| !d.is_empty() && d.bytes().all(|b| b.is_ascii_digit()))
}

/// Classify an identifier string. Total and pure.
pub fn classify(id: &str) -> TargetKind {
    let mut parts = id.split(SEPARATOR);
    let head = parts.next().unwrap_or_default();
    match (parts.next(), parts.next()) {
        (Some(_), None) if owner_digits(head).is_some() => TargetKind::UserFile,
        (Some(_), None) => TargetKind::RepoFile,
        _ => TargetKind::Legacy,
    }
}

fn check_segment(s: &str) -> Result<(), TargetIdError> {
    if s.trim().is_empty() {
        return Err(TargetIdError::Empty);
    }
    if s.contains(SEPARATOR) {
        return Err(TargetIdError::Separator);
    }
    Ok(())
}

impl TargetId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn user_file(owner: i64, filename: &str) -> Result<Self, TargetIdError> {
        check_segment(filename)?;
        if owner < 0 {
            return Err(TargetIdError::Shape);
        }
        Ok(Self(format!("u{owner}{SEPARATOR}{filename}")))
    }

    pub fn repo_file(repo: &str, rel_path: &str) -> Result<Self, TargetIdError> {
        check_segment(repo)?;
        check_segment(rel_path)?;
        let id = Self(format!("{repo}{SEPARATOR}{rel_path}"));
        // A repo named like `u123` would collide with the user-file shape.
        if id.kind() != TargetKind::RepoFile {
            return Err(TargetIdError::Shape);
        }
        Ok(id)
    }

    pub fn repo_placeholder(repo: &str) -> Result<Self, TargetIdError> {
        Self::repo_file(repo, REPO_PLACEHOLDER)
    }

    pub fn legacy(name: &str) -> Result<Self, TargetIdError> {
        check_segment(name)?;
        Ok(Self(name.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn kind(&self) -> TargetKind {
        classify(&self.0)
    }

    /// `(head, tail)` split on the first separator.
    fn segments(&self) -> (&str, Option<&str>) {
        match self.0.split_once(SEPARATOR) {
            Some((h, t)) => (h, Some(t)),
            None => (&self.0, None),
        }
    }

    pub fn owner_id(&self) -> Option<i64> {
        if self.kind() != TargetKind::UserFile {
            return None;
        }
        owner_digits(self.segments().0).and_then(|d| d.parse().ok())
    }

    pub fn repo_name(&self) -> Option<&str> {
        match self.kind() {
            TargetKind::RepoFile => Some(self.segments().0),
            _ => None,
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.kind() == TargetKind::RepoFile && self.segments().1 == Some(REPO_PLACEHOLDER)
    }

    /// Single filesystem entry name for this target's log file.
    pub fn log_file_name(&self) -> String {
        let flat: String = self
            .0
            .chars()
            .map(|c| match c {
                SEPARATOR | '/' | '\\' => '_',
                c => c,
            })
            .collect();
        format!("{flat}.log")
    }

    pub fn locations(&self, root: &Path) -> TargetLocations {
        TargetLocations::resolve(self, root)
    }
}

impl std::fmt::Display for TargetId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TargetId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Filesystem locations derived from an identifier and the data root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetLocations {
    pub work_dir: PathBuf,
    pub relative_entry: String,
    pub env_file: PathBuf,
    pub dependency_manifest: PathBuf,
    pub entry_path: PathBuf,
}

impl TargetLocations {
    pub fn resolve(id: &TargetId, root: &Path) -> Self {
        match id.kind() {
            TargetKind::UserFile | TargetKind::RepoFile => {
                let (head, tail) = id.segments();
                let dir_name = match id.kind() {
                    TargetKind::UserFile => owner_digits(head).unwrap_or(head),
                    _ => head,
                };
                let rel = tail.unwrap_or_default().to_string();
                let work_dir = root.join(dir_name);
                Self {
                    env_file: work_dir.join(".env"),
                    dependency_manifest: work_dir.join("requirements.txt"),
                    entry_path: work_dir.join(&rel),
                    relative_entry: rel,
                    work_dir,
                }
            }
            TargetKind::Legacy => {
                let name = id.as_str();
                Self {
                    work_dir: root.to_path_buf(),
                    relative_entry: name.to_string(),
                    env_file: root.join(format!("{name}.env")),
                    dependency_manifest: root.join(format!("{name}_req.txt")),
                    entry_path: root.join(name),
                }
            }
        }
    }

    /// True when none of the derived paths escapes `root` (or the work dir,
    /// for the entry).
    pub fn is_contained(&self, root: &Path) -> bool {
        within(root, &self.work_dir)
            && within(&self.work_dir, &self.entry_path)
            && within(root, &self.env_file)
            && within(root, &self.dependency_manifest)
    }
}

/// Lexically normalize a path against the current directory. Does not touch
/// the filesystem, so symlinks are not resolved.
pub fn normalize(p: &Path) -> PathBuf {
    let abs = if p.is_absolute() {
        p.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(p))
            .unwrap_or_else(|_| p.to_path_buf())
    };

    let mut out = PathBuf::new();
    for c in abs.components() {
        match c {
            Component::Prefix(_) | Component::RootDir => out.push(c.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(seg) => out.push(seg),
        }
    }
    out
}

/// True iff `candidate` normalizes to `base` or to a path nested under it.
pub fn within(base: &Path, candidate: &Path) -> bool {
    normalize(candidate).starts_with(normalize(base))
}
