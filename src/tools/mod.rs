//! Tool definitions, argument validation, and execution.
//!
//! The seven tools form a closed set. [`TOOL_TABLE`] maps each wire name to its
//! variant, schema, and argument parser; the dispatcher goes through that table
//! and never matches on raw strings elsewhere.

mod fs;
mod search;
mod shell;

pub use fs::{atomic_write, list_directory, read_chunk, DirEntryKind, ReadChunk, READ_MAX_BYTES};
pub use search::{find, grep, FindOutcome, GrepMatch, GrepOutcome};
pub use shell::{run_shell, ShellOutcome};

use crate::sandbox::{SandboxError, Workspace};
use globset::{GlobBuilder, GlobMatcher};
use regex::{Regex, RegexBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

// ═══════════════════════════════════════════════════════════════════════════
//  TOOL DEFINITIONS
// ═══════════════════════════════════════════════════════════════════════════

/// Tool definition advertised to the model
#[derive(Debug, Clone, Serialize)]
pub struct ToolDefinition {
    #[serde(rename = "type")]
    pub tool_type: &'static str,
    pub function: FunctionDefinition,
}

#[derive(Debug, Clone, Serialize)]
pub struct FunctionDefinition {
    pub name: &'static str,
    pub description: &'static str,
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolName {
    Read,
    Write,
    Edit,
    Bash,
    Grep,
    Find,
    Ls,
}

struct ToolSpec {
    name: ToolName,
    wire: &'static str,
    description: &'static str,
    parameters: fn() -> serde_json::Value,
    parse: fn(&str, &Workspace, &ToolLimits) -> Result<ToolRequest, ToolError>,
}

static TOOL_TABLE: [ToolSpec; 7] = [
    ToolSpec {
        name: ToolName::Read,
        wire: "read",
        description: "Read a file. Returns at most 20KB per call starting at `offset` (bytes). \
                      When the footer says hasMore=true, call again with offset=nextOffset.",
        parameters: read_schema,
        parse: parse_read,
    },
    ToolSpec {
        name: ToolName::Write,
        wire: "write",
        description: "Create or overwrite a file with the given content. Parent directories are created.",
        parameters: write_schema,
        parse: parse_write,
    },
    ToolSpec {
        name: ToolName::Edit,
        wire: "edit",
        description: "Replace old_text with new_text in a file. old_text must occur exactly once; \
                      read the file first to copy the exact text.",
        parameters: edit_schema,
        parse: parse_edit,
    },
    ToolSpec {
        name: ToolName::Bash,
        wire: "bash",
        description: "Run a shell command in the workspace root (git, tests, builds). \
                      Default timeout 120s. Risky commands require user approval.",
        parameters: bash_schema,
        parse: parse_bash,
    },
    ToolSpec {
        name: ToolName::Grep,
        wire: "grep",
        description: "Search files recursively for a regex. Returns file:line: text for each match.",
        parameters: grep_schema,
        parse: parse_grep,
    },
    ToolSpec {
        name: ToolName::Find,
        wire: "find",
        description: "Find files by glob pattern relative to the workspace root, e.g. '**/*.py'.",
        parameters: find_schema,
        parse: parse_find,
    },
    ToolSpec {
        name: ToolName::Ls,
        wire: "ls",
        description: "List the immediate children of a directory, marking each as file or dir.",
        parameters: ls_schema,
        parse: parse_ls,
    },
];

impl ToolName {
    /// Look up a wire name (`"read"`, `"bash"`, ...).
    pub fn lookup(wire: &str) -> Option<ToolName> {
        TOOL_TABLE
            .iter()
            .find(|spec| spec.wire == wire)
            .map(|spec| spec.name)
    }

    pub fn wire_name(self) -> &'static str {
        self.spec().wire
    }

    fn spec(self) -> &'static ToolSpec {
        // The table has one entry per variant, in declaration order.
        &TOOL_TABLE[self as usize]
    }
}

/// Get all tool definitions in table order
pub fn get_tool_definitions() -> Vec<ToolDefinition> {
    TOOL_TABLE
        .iter()
        .map(|spec| ToolDefinition {
            tool_type: "function",
            function: FunctionDefinition {
                name: spec.wire,
                description: spec.description,
                parameters: (spec.parameters)(),
            },
        })
        .collect()
}

fn read_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "path": {"type": "string", "description": "File path relative to the workspace"},
            "offset": {"type": "integer", "description": "Byte offset to start from (default: 0)"},
            "limit": {"type": "integer", "description": "Maximum bytes to return (default and max: 20480)"}
        },
        "required": ["path"]
    })
}

fn write_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "path": {"type": "string", "description": "File path relative to the workspace"},
            "content": {"type": "string", "description": "Full file content"}
        },
        "required": ["path", "content"]
    })
}

fn edit_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "path": {"type": "string", "description": "File path relative to the workspace"},
            "old_text": {"type": "string", "description": "Exact text to replace; must occur exactly once"},
            "new_text": {"type": "string", "description": "Replacement text"}
        },
        "required": ["path", "old_text", "new_text"]
    })
}

fn bash_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "command": {"type": "string", "description": "Shell command to run"},
            "timeout": {"type": "integer", "description": "Timeout in seconds (default: 120, max: 600)"}
        },
        "required": ["command"]
    })
}

fn grep_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "pattern": {"type": "string", "description": "Regex pattern to search for"},
            "path": {"type": "string", "description": "File or directory to search (default: workspace root)"},
            "ignore_case": {"type": "boolean", "description": "Case-insensitive match (default: false)"}
        },
        "required": ["pattern"]
    })
}

fn find_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "pattern": {"type": "string", "description": "Glob pattern, e.g. '**/*.rs' or 'src/*.toml'"}
        },
        "required": ["pattern"]
    })
}

fn ls_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "path": {"type": "string", "description": "Directory path (default: workspace root)"}
        }
    })
}

// ═══════════════════════════════════════════════════════════════════════════
//  ERRORS AND LIMITS
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Unknown tool '{0}'. Available tools: read, write, edit, bash, grep, find, ls")]
    UnknownTool(String),
    #[error("Invalid arguments for {tool}: {message}")]
    InvalidArguments { tool: &'static str, message: String },
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
    #[error("File not found: {0}")]
    NotFound(String),
    #[error("{0} is not a file")]
    NotAFile(String),
    #[error("{0} is not a directory")]
    NotADirectory(String),
    #[error("old_text was not found in {path}. Re-read the file with `read` and copy the exact text.")]
    NoMatch { path: String },
    #[error(
        "old_text occurs {count} times in {path}; it must be unique. \
         Re-read the file and include more surrounding context."
    )]
    AmbiguousMatch { path: String, count: usize },
    #[error("{0} is not valid UTF-8 text")]
    NotUtf8(String),
    #[error("Invalid pattern '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },
    #[error("Command timed out after {secs}s and its process group was killed.{partial}")]
    SubprocessTimeout { secs: u64, partial: String },
    #[error("Failed to start command: {0}")]
    Spawn(#[source] io::Error),
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
}

impl ToolError {
    pub(crate) fn io(path: impl Into<String>, source: io::Error) -> Self {
        ToolError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Size and time bounds applied by the tool implementations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolLimits {
    /// Page size cap for `read`, never above [`READ_MAX_BYTES`]
    pub read_max_bytes: u64,
    pub shell_timeout: Duration,
    pub shell_max_timeout: Duration,
    pub shell_max_output_bytes: usize,
    pub grep_max_matches: usize,
    pub find_max_results: usize,
}

impl Default for ToolLimits {
    fn default() -> Self {
        Self {
            read_max_bytes: READ_MAX_BYTES,
            shell_timeout: Duration::from_secs(120),
            shell_max_timeout: Duration::from_secs(600),
            shell_max_output_bytes: 64 * 1024,
            grep_max_matches: 200,
            find_max_results: 500,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
//  VALIDATION
// ═══════════════════════════════════════════════════════════════════════════

/// A validated tool call: arguments are typed, paths are resolved inside the
/// workspace, and patterns are compiled.
#[derive(Debug)]
pub enum ToolRequest {
    Read {
        path: PathBuf,
        offset: u64,
        limit: u64,
    },
    Write {
        path: PathBuf,
        content: String,
    },
    Edit {
        path: PathBuf,
        old_text: String,
        new_text: String,
    },
    Bash {
        command: String,
        timeout: Duration,
    },
    Grep {
        pattern: String,
        matcher: Regex,
        scope: PathBuf,
    },
    Find {
        pattern: String,
        matcher: GlobMatcher,
    },
    Ls {
        path: PathBuf,
    },
}

impl ToolRequest {
    /// Validate a raw call against its tool's schema.
    pub fn parse(
        name: ToolName,
        arguments: &str,
        workspace: &Workspace,
        limits: &ToolLimits,
    ) -> Result<ToolRequest, ToolError> {
        (name.spec().parse)(arguments, workspace, limits)
    }

    pub fn tool(&self) -> ToolName {
        match self {
            ToolRequest::Read { .. } => ToolName::Read,
            ToolRequest::Write { .. } => ToolName::Write,
            ToolRequest::Edit { .. } => ToolName::Edit,
            ToolRequest::Bash { .. } => ToolName::Bash,
            ToolRequest::Grep { .. } => ToolName::Grep,
            ToolRequest::Find { .. } => ToolName::Find,
            ToolRequest::Ls { .. } => ToolName::Ls,
        }
    }
}

fn parse_args<T: DeserializeOwned>(tool: ToolName, arguments: &str) -> Result<T, ToolError> {
    let arguments = if arguments.trim().is_empty() {
        "{}"
    } else {
        arguments
    };
    serde_json::from_str(arguments).map_err(|e| ToolError::InvalidArguments {
        tool: tool.wire_name(),
        message: e.to_string(),
    })
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ReadArgs {
    path: String,
    offset: Option<u64>,
    limit: Option<u64>,
}

fn parse_read(
    arguments: &str,
    workspace: &Workspace,
    limits: &ToolLimits,
) -> Result<ToolRequest, ToolError> {
    let args: ReadArgs = parse_args(ToolName::Read, arguments)?;
    let page = limits.read_max_bytes.clamp(1, READ_MAX_BYTES);
    let limit = match args.limit {
        Some(0) => {
            return Err(ToolError::InvalidArguments {
                tool: "read",
                message: "limit must be at least 1".to_string(),
            })
        }
        Some(limit) => limit.min(page),
        None => page,
    };
    Ok(ToolRequest::Read {
        path: workspace.resolve(&args.path)?,
        offset: args.offset.unwrap_or(0),
        limit,
    })
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct WriteArgs {
    path: String,
    content: String,
}

fn parse_write(
    arguments: &str,
    workspace: &Workspace,
    _limits: &ToolLimits,
) -> Result<ToolRequest, ToolError> {
    let args: WriteArgs = parse_args(ToolName::Write, arguments)?;
    Ok(ToolRequest::Write {
        path: workspace.resolve(&args.path)?,
        content: args.content,
    })
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct EditArgs {
    path: String,
    #[serde(alias = "oldText", alias = "old")]
    old_text: String,
    #[serde(alias = "newText", alias = "new")]
    new_text: String,
}

fn parse_edit(
    arguments: &str,
    workspace: &Workspace,
    _limits: &ToolLimits,
) -> Result<ToolRequest, ToolError> {
    let args: EditArgs = parse_args(ToolName::Edit, arguments)?;
    if args.old_text.is_empty() {
        return Err(ToolError::InvalidArguments {
            tool: "edit",
            message: "old_text must not be empty".to_string(),
        });
    }
    Ok(ToolRequest::Edit {
        path: workspace.resolve(&args.path)?,
        old_text: args.old_text,
        new_text: args.new_text,
    })
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct BashArgs {
    #[serde(alias = "cmd")]
    command: String,
    timeout: Option<u64>,
}

fn parse_bash(
    arguments: &str,
    _workspace: &Workspace,
    limits: &ToolLimits,
) -> Result<ToolRequest, ToolError> {
    let args: BashArgs = parse_args(ToolName::Bash, arguments)?;
    let command = args.command.trim();
    if command.is_empty() {
        return Err(ToolError::InvalidArguments {
            tool: "bash",
            message: "missing command".to_string(),
        });
    }
    let timeout = match args.timeout {
        Some(secs) => Duration::from_secs(secs.max(1)).min(limits.shell_max_timeout),
        None => limits.shell_timeout,
    };
    Ok(ToolRequest::Bash {
        command: command.to_string(),
        timeout,
    })
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct GrepArgs {
    pattern: String,
    path: Option<String>,
    #[serde(default)]
    ignore_case: bool,
}

fn parse_grep(
    arguments: &str,
    workspace: &Workspace,
    _limits: &ToolLimits,
) -> Result<ToolRequest, ToolError> {
    let args: GrepArgs = parse_args(ToolName::Grep, arguments)?;
    let matcher = RegexBuilder::new(&args.pattern)
        .case_insensitive(args.ignore_case)
        .size_limit(1 << 20)
        .build()
        .map_err(|e| ToolError::InvalidPattern {
            pattern: args.pattern.clone(),
            message: e.to_string(),
        })?;
    let scope = workspace.resolve(args.path.as_deref().unwrap_or("."))?;
    Ok(ToolRequest::Grep {
        pattern: args.pattern,
        matcher,
        scope,
    })
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct FindArgs {
    pattern: String,
}

fn parse_find(
    arguments: &str,
    _workspace: &Workspace,
    _limits: &ToolLimits,
) -> Result<ToolRequest, ToolError> {
    let args: FindArgs = parse_args(ToolName::Find, arguments)?;
    let pattern = args.pattern.trim().trim_start_matches("./").to_string();
    if pattern.is_empty() {
        return Err(ToolError::InvalidArguments {
            tool: "find",
            message: "pattern must not be empty".to_string(),
        });
    }
    let matcher = GlobBuilder::new(&pattern)
        .literal_separator(true)
        .build()
        .map_err(|e| ToolError::InvalidPattern {
            pattern: pattern.clone(),
            message: e.to_string(),
        })?
        .compile_matcher();
    Ok(ToolRequest::Find { pattern, matcher })
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct LsArgs {
    path: Option<String>,
}

fn parse_ls(
    arguments: &str,
    workspace: &Workspace,
    _limits: &ToolLimits,
) -> Result<ToolRequest, ToolError> {
    let args: LsArgs = parse_args(ToolName::Ls, arguments)?;
    Ok(ToolRequest::Ls {
        path: workspace.resolve(args.path.as_deref().unwrap_or("."))?,
    })
}

// ═══════════════════════════════════════════════════════════════════════════
//  EXECUTION
// ═══════════════════════════════════════════════════════════════════════════

/// Text produced by a successful tool run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    pub content: String,
    pub truncated: bool,
}

impl ToolOutput {
    fn complete(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            truncated: false,
        }
    }
}

/// Run a validated request. Each variant has exactly one handler.
pub fn execute(
    request: &ToolRequest,
    workspace: &Workspace,
    limits: &ToolLimits,
) -> Result<ToolOutput, ToolError> {
    match request {
        ToolRequest::Read {
            path,
            offset,
            limit,
        } => fs::execute_read(workspace, path, *offset, *limit),
        ToolRequest::Write { path, content } => fs::execute_write(workspace, path, content),
        ToolRequest::Edit {
            path,
            old_text,
            new_text,
        } => fs::execute_edit(workspace, path, old_text, new_text),
        ToolRequest::Bash { command, timeout } => {
            shell::execute_bash(workspace, command, *timeout, limits.shell_max_output_bytes)
        }
        ToolRequest::Grep {
            pattern,
            matcher,
            scope,
        } => search::execute_grep(workspace, pattern, matcher, scope, limits.grep_max_matches),
        ToolRequest::Find { pattern, matcher } => {
            search::execute_find(workspace, pattern, matcher, limits.find_max_results)
        }
        ToolRequest::Ls { path } => fs::execute_ls(workspace, path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn workspace() -> (tempfile::TempDir, Workspace) {
        let dir = tempdir().unwrap();
        let ws = Workspace::open(dir.path()).unwrap();
        (dir, ws)
    }

    #[test]
    fn test_tool_definitions() {
        let tools = get_tool_definitions();
        let names: Vec<_> = tools.iter().map(|t| t.function.name).collect();
        assert_eq!(names, vec!["read", "write", "edit", "bash", "grep", "find", "ls"]);
        for tool in &tools {
            assert_eq!(tool.tool_type, "function");
            assert_eq!(tool.function.parameters["type"], "object");
        }
    }

    #[test]
    fn test_table_order_matches_variants() {
        for name in [
            ToolName::Read,
            ToolName::Write,
            ToolName::Edit,
            ToolName::Bash,
            ToolName::Grep,
            ToolName::Find,
            ToolName::Ls,
        ] {
            assert_eq!(ToolName::lookup(name.wire_name()), Some(name));
        }
        assert_eq!(ToolName::lookup("read_file"), None);
    }

    #[test]
    fn test_parse_rejects_unknown_and_duplicate_keys() {
        let (_dir, ws) = workspace();
        let limits = ToolLimits::default();

        let err = ToolRequest::parse(ToolName::Ls, r#"{"path": ".", "depth": 2}"#, &ws, &limits)
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments { tool: "ls", .. }));

        let err = ToolRequest::parse(
            ToolName::Write,
            r#"{"path": "a.txt", "path": "b.txt", "content": ""}"#,
            &ws,
            &limits,
        )
        .unwrap_err();
        assert!(err.to_string().contains("duplicate field"), "{err}");
    }

    #[test]
    fn test_parse_read_clamps_limit() {
        let (_dir, ws) = workspace();
        let request = ToolRequest::parse(
            ToolName::Read,
            r#"{"path": "a.txt", "limit": 1000000}"#,
            &ws,
            &ToolLimits::default(),
        )
        .unwrap();
        match request {
            ToolRequest::Read { limit, offset, .. } => {
                assert_eq!(limit, READ_MAX_BYTES);
                assert_eq!(offset, 0);
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn test_parse_edit_accepts_camel_case() {
        let (_dir, ws) = workspace();
        let request = ToolRequest::parse(
            ToolName::Edit,
            r#"{"path": "a.txt", "oldText": "a", "newText": "b"}"#,
            &ws,
            &ToolLimits::default(),
        )
        .unwrap();
        assert_eq!(request.tool(), ToolName::Edit);
    }

    #[test]
    fn test_parse_bash_clamps_timeout() {
        let (_dir, ws) = workspace();
        let limits = ToolLimits::default();
        let request =
            ToolRequest::parse(ToolName::Bash, r#"{"command": "ls", "timeout": 99999}"#, &ws, &limits)
                .unwrap();
        match request {
            ToolRequest::Bash { timeout, .. } => assert_eq!(timeout, limits.shell_max_timeout),
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn test_parse_invalid_regex_and_glob() {
        let (_dir, ws) = workspace();
        let limits = ToolLimits::default();
        let err = ToolRequest::parse(ToolName::Grep, r#"{"pattern": "(unclosed"}"#, &ws, &limits)
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidPattern { .. }));
        let err = ToolRequest::parse(ToolName::Find, r#"{"pattern": "a[b"}"#, &ws, &limits)
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidPattern { .. }));
    }

    #[test]
    fn test_parse_resolves_paths_in_sandbox() {
        let (_dir, ws) = workspace();
        let err = ToolRequest::parse(
            ToolName::Read,
            r#"{"path": "../../etc/passwd"}"#,
            &ws,
            &ToolLimits::default(),
        )
        .unwrap_err();
        assert!(matches!(err, ToolError::Sandbox(ref e) if e.is_violation()));
    }

    #[test]
    fn test_empty_arguments_mean_empty_object() {
        let (_dir, ws) = workspace();
        let request = ToolRequest::parse(ToolName::Ls, "", &ws, &ToolLimits::default()).unwrap();
        assert!(matches!(request, ToolRequest::Ls { .. }));
    }
}
