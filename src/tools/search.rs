//! grep and find: recursive walks confined to the workspace.

use super::{ToolError, ToolOutput};
use crate::sandbox::Workspace;
use crate::util::truncate;
use globset::GlobMatcher;
use regex::Regex;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

/// Directories that are never worth searching.
const NOISE_DIRS: &[&str] = &[
    ".git",
    "node_modules",
    "target",
    "__pycache__",
    ".venv",
    "venv",
    "dist",
    "build",
    ".next",
];

/// A file with a NUL byte in this prefix is treated as binary.
const BINARY_PROBE_BYTES: usize = 8 * 1024;

const MAX_LINE_CHARS: usize = 500;

fn is_noise_dir(entry: &DirEntry) -> bool {
    entry.file_type().is_dir()
        && entry
            .file_name()
            .to_str()
            .is_some_and(|name| NOISE_DIRS.contains(&name))
}

/// Walk `scope` in sorted order, yielding `(display path, real path, is_dir)`.
///
/// Symlinks are not descended into. A symlink is yielded (as its target) only
/// when the target resolves inside the workspace.
fn walk(workspace: &Workspace, scope: &Path) -> impl Iterator<Item = (PathBuf, PathBuf, bool)> {
    let workspace = workspace.clone();
    WalkDir::new(scope)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !is_noise_dir(e))
        .filter_map(Result::ok)
        .filter_map(move |entry| {
            let shown = entry.path().to_path_buf();
            if entry.path_is_symlink() {
                let target = entry.path().canonicalize().ok()?;
                if !workspace.contains(&target) {
                    return None;
                }
                let is_dir = target.is_dir();
                Some((shown, target, is_dir))
            } else {
                let is_dir = entry.file_type().is_dir();
                Some((shown, entry.into_path(), is_dir))
            }
        })
}

// ═══════════════════════════════════════════════════════════════════════════
//  GREP
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrepMatch {
    /// Path relative to the workspace root.
    pub path: String,
    /// 1-based line number.
    pub line: usize,
    pub text: String,
}

#[derive(Debug, Clone, Default)]
pub struct GrepOutcome {
    pub matches: Vec<GrepMatch>,
    pub files_searched: usize,
    /// More matches existed than `max_matches`.
    pub truncated: bool,
}

fn read_text(path: &Path) -> io::Result<Option<String>> {
    let mut file = fs::File::open(path)?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;
    let probe = &bytes[..bytes.len().min(BINARY_PROBE_BYTES)];
    if probe.contains(&0) {
        return Ok(None);
    }
    Ok(Some(String::from_utf8_lossy(&bytes).into_owned()))
}

/// Search every text file under `scope` (a directory or a single file).
pub fn grep(
    workspace: &Workspace,
    matcher: &Regex,
    scope: &Path,
    max_matches: usize,
) -> GrepOutcome {
    let mut outcome = GrepOutcome::default();

    'files: for (shown, real, is_dir) in walk(workspace, scope) {
        if is_dir {
            continue;
        }
        // Unreadable files are skipped the way binary ones are.
        let Ok(Some(text)) = read_text(&real) else {
            continue;
        };
        outcome.files_searched += 1;

        for (index, line) in text.lines().enumerate() {
            if !matcher.is_match(line) {
                continue;
            }
            if outcome.matches.len() >= max_matches {
                outcome.truncated = true;
                break 'files;
            }
            outcome.matches.push(GrepMatch {
                path: workspace.display_relative(&shown),
                line: index + 1,
                text: truncate(line.trim_end(), MAX_LINE_CHARS),
            });
        }
    }

    outcome
}

pub(super) fn execute_grep(
    workspace: &Workspace,
    pattern: &str,
    matcher: &Regex,
    scope: &Path,
    max_matches: usize,
) -> Result<ToolOutput, ToolError> {
    if !scope.exists() {
        return Err(ToolError::NotFound(workspace.display_relative(scope)));
    }

    let outcome = grep(workspace, matcher, scope, max_matches);
    if outcome.matches.is_empty() {
        return Ok(ToolOutput::complete(format!(
            "No matches found for pattern: {pattern}"
        )));
    }

    let mut content = String::new();
    for m in &outcome.matches {
        content.push_str(&format!("{}:{}: {}\n", m.path, m.line, m.text));
    }
    if outcome.truncated {
        content.push_str(&format!(
            "\n[showing the first {} matches; narrow the pattern or path to see more]",
            outcome.matches.len()
        ));
    }

    Ok(ToolOutput {
        content,
        truncated: outcome.truncated,
    })
}

// ═══════════════════════════════════════════════════════════════════════════
//  FIND
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Default)]
pub struct FindOutcome {
    /// Sorted workspace-relative paths; directories end with `/`.
    pub paths: Vec<String>,
    pub truncated: bool,
}

/// Match every path under the workspace root against `matcher`.
pub fn find(workspace: &Workspace, matcher: &GlobMatcher, max_results: usize) -> FindOutcome {
    let mut paths: Vec<String> = walk(workspace, workspace.root())
        .filter_map(|(shown, _real, is_dir)| {
            let rel = shown.strip_prefix(workspace.root()).ok()?;
            if rel.as_os_str().is_empty() || !matcher.is_match(rel) {
                return None;
            }
            let mut display = rel.to_string_lossy().replace('\\', "/");
            if is_dir {
                display.push('/');
            }
            Some(display)
        })
        .collect();

    paths.sort();
    let truncated = paths.len() > max_results;
    paths.truncate(max_results);
    FindOutcome { paths, truncated }
}

pub(super) fn execute_find(
    workspace: &Workspace,
    pattern: &str,
    matcher: &GlobMatcher,
    max_results: usize,
) -> Result<ToolOutput, ToolError> {
    let outcome = find(workspace, matcher, max_results);
    if outcome.paths.is_empty() {
        return Ok(ToolOutput::complete(format!(
            "No files found matching pattern: {pattern}"
        )));
    }

    let mut content = outcome.paths.join("\n");
    content.push('\n');
    if outcome.truncated {
        content.push_str(&format!(
            "\n[showing the first {} results; use a more specific pattern]",
            outcome.paths.len()
        ));
    }

    Ok(ToolOutput {
        content,
        truncated: outcome.truncated,
    })
}
