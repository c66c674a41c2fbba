//! read, write, edit, and ls.

use super::{ToolError, ToolOutput};
use crate::sandbox::Workspace;
use std::fs;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use tempfile::NamedTempFile;

/// Per-call byte cap for `read`.
pub const READ_MAX_BYTES: u64 = 20 * 1024;

// ═══════════════════════════════════════════════════════════════════════════
//  READ - Paginated, lossless
// ═══════════════════════════════════════════════════════════════════════════

/// One page of a file. Concatenating `bytes` across pages reproduces the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadChunk {
    pub bytes: Vec<u8>,
    pub offset: u64,
    pub next_offset: u64,
    pub total_size: u64,
    pub has_more: bool,
}

pub fn read_chunk(path: &Path, offset: u64, limit: u64) -> io::Result<ReadChunk> {
    let mut file = fs::File::open(path)?;
    let total_size = file.metadata()?.len();

    if offset >= total_size {
        return Ok(ReadChunk {
            bytes: Vec::new(),
            offset,
            next_offset: offset,
            total_size,
            has_more: false,
        });
    }

    let limit = limit.clamp(1, READ_MAX_BYTES);
    file.seek(SeekFrom::Start(offset))?;
    let mut bytes = Vec::with_capacity(limit.min(total_size - offset) as usize);
    file.take(limit).read_to_end(&mut bytes)?;

    let mut end = offset + bytes.len() as u64;
    if end < total_size {
        // Don't split a multi-byte character across pages when we can avoid it.
        let cut = utf8_boundary(&bytes);
        if cut > 0 && cut < bytes.len() {
            bytes.truncate(cut);
            end = offset + cut as u64;
        }
    }

    Ok(ReadChunk {
        bytes,
        offset,
        next_offset: end,
        total_size,
        has_more: end < total_size,
    })
}

/// Length of the longest prefix that does not end inside a UTF-8 sequence.
fn utf8_boundary(bytes: &[u8]) -> usize {
    let len = bytes.len();
    for back in 1..=len.min(4) {
        let byte = bytes[len - back];
        if byte & 0b1100_0000 == 0b1000_0000 {
            continue;
        }
        let width = match byte {
            0xC0..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF7 => 4,
            _ => 1,
        };
        return if width > back { len - back } else { len };
    }
    len
}

pub(super) fn execute_read(
    workspace: &Workspace,
    path: &Path,
    offset: u64,
    limit: u64,
) -> Result<ToolOutput, ToolError> {
    let display = workspace.display_relative(path);
    if !path.exists() {
        return Err(ToolError::NotFound(display));
    }
    if !path.is_file() {
        return Err(ToolError::NotAFile(display));
    }

    let chunk = read_chunk(path, offset, limit).map_err(|e| ToolError::io(&display, e))?;
    // Lossy decoding would inflate each bad byte to three, so binary pages
    // are described rather than shown.
    let mut content = match std::str::from_utf8(&chunk.bytes) {
        Ok(text) => text.to_string(),
        Err(_) => format!(
            "[{} bytes at offset {} are not valid UTF-8 text and are not shown]",
            chunk.bytes.len(),
            chunk.offset
        ),
    };
    if !content.is_empty() && !content.ends_with('\n') {
        content.push('\n');
    }
    content.push_str(&format!(
        "\n[read {}: bytes {}-{} of {}; hasMore={}; nextOffset={}]",
        display,
        chunk.offset.min(chunk.total_size),
        chunk.next_offset,
        chunk.total_size,
        chunk.has_more,
        chunk.next_offset
    ));
    if chunk.has_more {
        content.push_str(&format!(
            "\nCall read again with offset={} to continue.",
            chunk.next_offset
        ));
    }

    Ok(ToolOutput::complete(content))
}

// ═══════════════════════════════════════════════════════════════════════════
//  WRITE - Atomic via temp file + rename
// ═══════════════════════════════════════════════════════════════════════════

/// Write `content` to `path` through a temp file in the same directory.
///
/// The rename is atomic on the same filesystem, so readers see either the old
/// file or the new one. An existing file keeps its permissions.
pub fn atomic_write(path: &Path, content: &[u8]) -> io::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no parent"))?;
    fs::create_dir_all(parent)?;

    let mut staged = NamedTempFile::new_in(parent)?;
    staged.write_all(content)?;
    if let Ok(metadata) = fs::metadata(path) {
        staged.as_file().set_permissions(metadata.permissions())?;
    }
    staged.as_file().sync_all()?;
    staged.persist(path).map_err(|e| e.error)?;
    Ok(())
}

pub(super) fn execute_write(
    workspace: &Workspace,
    path: &Path,
    content: &str,
) -> Result<ToolOutput, ToolError> {
    let display = workspace.display_relative(path);
    if path.is_dir() {
        return Err(ToolError::NotAFile(display));
    }
    let existed = path.exists();
    atomic_write(path, content.as_bytes()).map_err(|e| ToolError::io(&display, e))?;

    Ok(ToolOutput::complete(format!(
        "{} {} ({} bytes)",
        if existed { "Overwrote" } else { "Created" },
        display,
        content.len()
    )))
}

// ═══════════════════════════════════════════════════════════════════════════
//  EDIT - Exactly-once replacement
// ═══════════════════════════════════════════════════════════════════════════

/// Start offsets of every occurrence of `needle`, overlapping ones included.
fn find_occurrences(haystack: &str, needle: &str) -> Vec<usize> {
    let mut positions = Vec::new();
    let mut start = 0;
    while start <= haystack.len() {
        let Some(found) = haystack[start..].find(needle) else {
            break;
        };
        let at = start + found;
        positions.push(at);
        start = at + haystack[at..].chars().next().map_or(1, char::len_utf8);
    }
    positions
}

pub(super) fn execute_edit(
    workspace: &Workspace,
    path: &Path,
    old_text: &str,
    new_text: &str,
) -> Result<ToolOutput, ToolError> {
    let display = workspace.display_relative(path);
    if !path.exists() {
        return Err(ToolError::NotFound(display));
    }
    if !path.is_file() {
        return Err(ToolError::NotAFile(display));
    }

    let bytes = fs::read(path).map_err(|e| ToolError::io(&display, e))?;
    let original = String::from_utf8(bytes).map_err(|_| ToolError::NotUtf8(display.clone()))?;

    let occurrences = find_occurrences(&original, old_text);
    let at = match occurrences.as_slice() {
        [] => return Err(ToolError::NoMatch { path: display }),
        [at] => *at,
        many => {
            return Err(ToolError::AmbiguousMatch {
                path: display,
                count: many.len(),
            })
        }
    };

    let mut updated = String::with_capacity(original.len() - old_text.len() + new_text.len());
    updated.push_str(&original[..at]);
    updated.push_str(new_text);
    updated.push_str(&original[at + old_text.len()..]);

    atomic_write(path, updated.as_bytes()).map_err(|e| ToolError::io(&display, e))?;

    let line = original[..at].matches('\n').count() + 1;
    Ok(ToolOutput::complete(format!(
        "Edited {} at line {}: replaced {} line(s) with {} line(s)",
        display,
        line,
        old_text.lines().count().max(1),
        new_text.lines().count().max(1)
    )))
}

// ═══════════════════════════════════════════════════════════════════════════
//  LS - Immediate children only
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirEntryKind {
    File,
    Dir,
}

/// Sorted immediate children of `dir`. Symlinks are tagged by their target.
pub fn list_directory(dir: &Path) -> io::Result<Vec<(String, DirEntryKind)>> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let is_dir = fs::metadata(entry.path())
            .map(|m| m.is_dir())
            .unwrap_or(false);
        let kind = if is_dir {
            DirEntryKind::Dir
        } else {
            DirEntryKind::File
        };
        entries.push((entry.file_name().to_string_lossy().into_owned(), kind));
    }
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(entries)
}

pub(super) fn execute_ls(workspace: &Workspace, path: &Path) -> Result<ToolOutput, ToolError> {
    let display = workspace.display_relative(path);
    if !path.exists() {
        return Err(ToolError::NotFound(display));
    }
    if !path.is_dir() {
        return Err(ToolError::NotADirectory(display));
    }

    let entries = list_directory(path).map_err(|e| ToolError::io(&display, e))?;
    if entries.is_empty() {
        return Ok(ToolOutput::complete(format!("{display}: (empty directory)")));
    }

    let mut output = String::new();
    for (name, kind) in entries {
        match kind {
            DirEntryKind::Dir => output.push_str(&format!("[dir]  {name}/\n")),
            DirEntryKind::File => output.push_str(&format!("[file] {name}\n")),
        }
    }
    Ok(ToolOutput::complete(output))
}
