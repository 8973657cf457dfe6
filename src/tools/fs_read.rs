use std::path::{Path, PathBuf};

use serde_json::{Value, json};

use crate::error::ToolError;

pub const FS_READ_DEFAULT_MAX_BYTES: usize = 8192;
pub const FS_READ_MAX_BYTES_LIMIT: usize = 65536;
pub const FS_READ_DEFAULT_MAX_LINES: usize = 200;
pub const FS_READ_MAX_LINES_LIMIT: usize = 2000;
pub const FS_READ_DEFAULT_MAX_ENTRIES: usize = 100;
pub const FS_READ_MAX_ENTRIES_LIMIT: usize = 500;
pub const FS_READ_DENIED_SEGMENTS: &[&str] = &[".git", ".agent-relay"];
pub const FS_READ_DENIED_FILE_NAMES: &[&str] =
    &[".env", ".env.local", ".env.development", ".env.production"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsReadRequest {
    pub path: String,
    pub start_line: usize,
    pub max_lines: usize,
    pub max_bytes: usize,
    pub max_entries: usize,
}

pub fn fs_read_parameters() -> Value {
    json!({
        "type": "object",
        "properties": {
            "path": { "type": "string", "minLength": 1 },
            "start_line": { "type": "integer", "minimum": 1 },
            "max_lines": { "type": "integer", "minimum": 1, "maximum": FS_READ_MAX_LINES_LIMIT },
            "max_bytes": { "type": "integer", "minimum": 1, "maximum": FS_READ_MAX_BYTES_LIMIT },
            "max_entries": { "type": "integer", "minimum": 1, "maximum": FS_READ_MAX_ENTRIES_LIMIT }
        },
        "required": ["path"]
    })
}

/// Reads an optional bounded integer argument.
pub fn usize_arg(
    args: &Value,
    key: &str,
    default: usize,
    min: usize,
    max: usize,
) -> Result<usize, ToolError> {
    let Some(raw) = args.get(key) else {
        return Ok(default);
    };
    let value = raw
        .as_u64()
        .and_then(|value| usize::try_from(value).ok())
        .ok_or_else(|| ToolError::invalid_args(format!("'{key}' must be a positive integer")))?;
    if value < min || value > max {
        return Err(ToolError::invalid_args(format!(
            "'{key}' must be between {min} and {max}"
        )));
    }
    Ok(value)
}

pub fn parse_fs_read_request(args: &Value) -> Result<FsReadRequest, ToolError> {
    let path = args
        .get("path")
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or_default();
    if path.is_empty() {
        return Err(ToolError::invalid_args("'path' is required for fs_read"));
    }

    Ok(FsReadRequest {
        path: path.to_string(),
        start_line: usize_arg(args, "start_line", 1, 1, 1_000_000)?,
        max_lines: usize_arg(
            args,
            "max_lines",
            FS_READ_DEFAULT_MAX_LINES,
            1,
            FS_READ_MAX_LINES_LIMIT,
        )?,
        max_bytes: usize_arg(
            args,
            "max_bytes",
            FS_READ_DEFAULT_MAX_BYTES,
            1,
            FS_READ_MAX_BYTES_LIMIT,
        )?,
        max_entries: usize_arg(
            args,
            "max_entries",
            FS_READ_DEFAULT_MAX_ENTRIES,
            1,
            FS_READ_MAX_ENTRIES_LIMIT,
        )?,
    })
}

pub fn resolve_workspace_path(workspace_root: &Path, requested: &str) -> Result<PathBuf, ToolError> {
    let requested_path = PathBuf::from(requested);
    let absolute = if requested_path.is_absolute() {
        requested_path
    } else {
        workspace_root.join(requested_path)
    };

    let resolved = absolute.canonicalize().map_err(|_| {
        ToolError::new("invalid_path", format!("path '{requested}' does not exist"))
    })?;
    let root = workspace_root
        .canonicalize()
        .unwrap_or_else(|_| workspace_root.to_path_buf());

    if !resolved.starts_with(&root) {
        return Err(ToolError::new(
            "denied_path",
            format!(
                "fs_read denied path '{requested}': outside workspace root '{}'",
                root.display()
            ),
        ));
    }

    let blocked_segment = resolved.components().find_map(|component| {
        let segment = component.as_os_str().to_string_lossy();
        FS_READ_DENIED_SEGMENTS
            .iter()
            .any(|denied| segment.eq_ignore_ascii_case(denied))
            .then(|| segment.to_string())
    });
    if let Some(segment) = blocked_segment {
        return Err(ToolError::new(
            "denied_path",
            format!("fs_read denied path '{requested}': segment '{segment}' is blocked"),
        ));
    }

    if let Some(name) = resolved.file_name().and_then(|value| value.to_str())
        && FS_READ_DENIED_FILE_NAMES
            .iter()
            .any(|denied| name.eq_ignore_ascii_case(denied))
    {
        return Err(ToolError::new(
            "denied_path",
            format!("fs_read denied path '{requested}': file '{name}' is blocked"),
        ));
    }

    Ok(resolved)
}

fn display_path(path: &Path, workspace_root: &Path) -> String {
    let root = workspace_root
        .canonicalize()
        .unwrap_or_else(|_| workspace_root.to_path_buf());
    match path.strip_prefix(&root) {
        Ok(relative) if relative.as_os_str().is_empty() => ".".to_string(),
        Ok(relative) => format!("./{}", relative.display()),
        Err(_) => path.display().to_string(),
    }
}

fn read_file(resolved: &Path, shown: &str, request: &FsReadRequest) -> Result<Value, ToolError> {
    let data = std::fs::read(resolved)
        .map_err(|_| ToolError::new("io_error", format!("failed to read file '{shown}'")))?;

    let take = data.len().min(request.max_bytes);
    let content = String::from_utf8_lossy(&data[..take]);
    let lines = content.lines().collect::<Vec<&str>>();
    let start = request.start_line.saturating_sub(1).min(lines.len());
    let end = start.saturating_add(request.max_lines).min(lines.len());
    let omitted_lines = lines.len() - end;

    Ok(json!({
        "kind": "file",
        "path": shown,
        "start_line": request.start_line,
        "line_count": end - start,
        "omitted_lines": omitted_lines,
        "truncated": data.len() > take || omitted_lines > 0,
        "content": lines[start..end].join("\n")
    }))
}

fn read_directory(resolved: &Path, shown: &str, request: &FsReadRequest) -> Result<Value, ToolError> {
    let mut entries = std::fs::read_dir(resolved)
        .map_err(|_| ToolError::new("io_error", format!("failed to read directory '{shown}'")))?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let file_type = entry.file_type().ok()?;
            let kind = if file_type.is_dir() {
                "dir"
            } else if file_type.is_file() {
                "file"
            } else {
                "other"
            };
            Some((entry.file_name().to_string_lossy().to_string(), kind))
        })
        .collect::<Vec<(String, &str)>>();
    entries.sort_by(|a, b| a.0.cmp(&b.0));

    let total = entries.len();
    entries.truncate(request.max_entries);

    Ok(json!({
        "kind": "directory",
        "path": shown,
        "entry_count": total,
        "truncated": total > request.max_entries,
        "entries": entries
            .into_iter()
            .map(|(name, kind)| json!({ "name": name, "kind": kind }))
            .collect::<Vec<Value>>()
    }))
}

pub fn fs_read(workspace_root: &Path, args: &Value) -> Result<Value, ToolError> {
    let request = parse_fs_read_request(args)?;
    let resolved = resolve_workspace_path(workspace_root, &request.path)?;
    let shown = display_path(&resolved, workspace_root);

    if resolved.is_file() {
        read_file(&resolved, &shown, &request)
    } else if resolved.is_dir() {
        read_directory(&resolved, &shown, &request)
    } else {
        Err(ToolError::new(
            "unsupported_path",
            format!("fs_read supports only files and directories (path '{}')", request.path),
        ))
    }
}
