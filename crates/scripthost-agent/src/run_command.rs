//! Decide how to launch a target from what is on disk.
//!
//! Order: package manifest start script, explicit entry, conventional entry
//! names, then a bounded flat-first scan for any runnable file.

use std::{
    collections::VecDeque,
    path::{Path, PathBuf},
};

const MANIFEST_FILE: &str = "package.json";
const SCAN_MAX_FILES: usize = 200;
pub const LISTING_MAX_FILES: usize = 400;

/// Conventional entry points, tried in order.
pub const CONVENTIONAL_ENTRIES: [&str; 7] = [
    "main.py",
    "app.py",
    "server.py",
    "bot.py",
    "index.js",
    "server.js",
    "start.sh",
];

const SKIPPED_DIRS: [&str; 3] = [".git", "node_modules", "__pycache__"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interpreter {
    Python,
    Node,
    Shell,
}

impl Interpreter {
    /// Used for entries whose extension is not recognized.
    pub const FALLBACK: Interpreter = Interpreter::Python;

    pub fn for_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "py" => Some(Interpreter::Python),
            "js" => Some(Interpreter::Node),
            "sh" => Some(Interpreter::Shell),
            _ => None,
        }
    }

    pub fn for_entry(rel: &str) -> Self {
        Path::new(rel)
            .extension()
            .and_then(|e| e.to_str())
            .and_then(Self::for_extension)
            .unwrap_or(Self::FALLBACK)
    }

    fn argv(self, rel: &str, python: &str) -> Vec<String> {
        match self {
            Interpreter::Python => vec![python.to_string(), "-u".to_string(), rel.to_string()],
            Interpreter::Node => vec!["node".to_string(), rel.to_string()],
            Interpreter::Shell => vec!["bash".to_string(), rel.to_string()],
        }
    }
}

pub fn is_runnable_name(rel: &str) -> bool {
    Path::new(rel)
        .extension()
        .and_then(|e| e.to_str())
        .and_then(Interpreter::for_extension)
        .is_some()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunCommand {
    pub argv: Vec<String>,
    /// Entry file the command runs, relative to the work dir. `None` when the
    /// package manifest drives the start.
    pub entry: Option<String>,
}

fn manifest_has_start_script(work_dir: &Path) -> bool {
    let Ok(raw) = std::fs::read(work_dir.join(MANIFEST_FILE)) else {
        return false;
    };
    match serde_json::from_slice::<serde_json::Value>(&raw) {
        Ok(v) => v.get("scripts").and_then(|s| s.get("start")).is_some(),
        Err(e) => {
            tracing::debug!(dir = %work_dir.display(), error = %e, "ignoring unparsable package manifest");
            false
        }
    }
}

pub fn resolve_run_command(
    work_dir: &Path,
    explicit_entry: Option<&str>,
    python: &str,
) -> Option<RunCommand> {
    let explicit_entry = explicit_entry.map(str::trim).filter(|e| !e.is_empty());

    let manifest_applies = match explicit_entry {
        None => true,
        Some(e) => Interpreter::for_entry(e) == Interpreter::Node,
    };
    if manifest_applies && manifest_has_start_script(work_dir) {
        return Some(RunCommand {
            argv: vec!["npm".to_string(), "start".to_string()],
            entry: None,
        });
    }

    if let Some(entry) = explicit_entry {
        return Some(RunCommand {
            argv: Interpreter::for_entry(entry).argv(entry, python),
            entry: Some(entry.to_string()),
        });
    }

    if let Some(c) = CONVENTIONAL_ENTRIES
        .iter()
        .find(|c| work_dir.join(c).is_file())
    {
        return Some(RunCommand {
            argv: Interpreter::for_entry(c).argv(c, python),
            entry: Some(c.to_string()),
        });
    }

    list_files(work_dir, SCAN_MAX_FILES)
        .into_iter()
        .find(|f| is_runnable_name(f))
        .map(|f| RunCommand {
            argv: Interpreter::for_entry(&f).argv(&f, python),
            entry: Some(f),
        })
}

/// Runnable files under `work_dir`, flat-first, for entry selection.
pub fn list_runnable_files(work_dir: &Path, max: usize) -> Vec<String> {
    list_files(work_dir, max)
        .into_iter()
        .filter(|f| is_runnable_name(f))
        .collect()
}

/// Breadth-first listing of regular files, relative to `base` with `/`
/// separators. Symlinks and tooling directories are not followed.
fn list_files(base: &Path, max: usize) -> Vec<String> {
    let mut out = Vec::new();
    let mut queue: VecDeque<(PathBuf, String)> = VecDeque::new();
    queue.push_back((base.to_path_buf(), String::new()));

    while let Some((dir, prefix)) = queue.pop_front() {
        let Ok(rd) = std::fs::read_dir(&dir) else {
            continue;
        };
        let mut entries: Vec<_> = rd.filter_map(|e| e.ok()).collect();
        entries.sort_by_key(|e| e.file_name());

        for e in entries {
            let Ok(ft) = e.file_type() else {
                continue;
            };
            let name = e.file_name().to_string_lossy().into_owned();
            let rel = if prefix.is_empty() {
                name.clone()
            } else {
                format!("{prefix}/{name}")
            };

            if ft.is_dir() {
                if !SKIPPED_DIRS.contains(&name.as_str()) {
                    queue.push_back((e.path(), rel));
                }
            } else if ft.is_file() {
                if name.ends_with(".pyc") {
                    continue;
                }
                out.push(rel);
                if out.len() >= max {
                    return out;
                }
            }
        }
    }
    out
}
