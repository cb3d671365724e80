/// Local file nodes: read, write and glob
///
/// Paths come from the `path` (or `directory`) handle, then a text `input`, then
/// config; a leading `~` expands to `HOME`. Credential stores such as `.ssh` and
/// `.gnupg` are refused, as are `/etc/shadow` and `/etc/passwd`. Reads are capped
/// by `maxSize` (megabytes, default 10); globbing also stops at `maxFiles`.
///
/// Modes: `text` (default), `json`, `csv` and `binary` for reads; `text`, `json` and
/// `csv` for writes. A glob in `none` mode lists files without reading them.

use super::{NodeContext, NodeHandler, NodeResult};
use crate::error::NodeError;
use crate::workflow::types::NodeKind;
use crate::workflow::value::{NodeOutput, NodeValue};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use regex::Regex;
use serde_json::{Map, Value};
use std::path::{Component, Path, PathBuf};
use tokio::io::AsyncWriteExt;

const DENIED_COMPONENTS: [&str; 2] = [".ssh", ".gnupg"];
const DENIED_FILES: [&str; 2] = ["/etc/shadow", "/etc/passwd"];

const DEFAULT_MAX_SIZE_MB: f64 = 10.0;
const DEFAULT_MAX_FILES: usize = 100;
const BYTES_PER_MB: f64 = 1_048_576.0;

pub fn is_path_denied(path: &Path) -> bool {
    if DENIED_FILES.iter().any(|denied| path == Path::new(denied)) {
        return true;
    }
    path.components().any(|component| match component {
        Component::Normal(name) => DENIED_COMPONENTS.iter().any(|denied| name == *denied),
        _ => false,
    })
}

fn expand_tilde(path: &str) -> PathBuf {
    match (path.strip_prefix('~'), std::env::var("HOME")) {
        (Some(rest), Ok(home)) if rest.is_empty() || rest.starts_with('/') => {
            PathBuf::from(format!("{}{}", home, rest))
        }
        _ => PathBuf::from(path),
    }
}

/// Path from a handle, a text primary input, or config
fn resolve_path(ctx: &NodeContext<'_>, handle: &str) -> Result<PathBuf, NodeError> {
    let raw = ctx
        .handle(handle)
        .map(NodeValue::as_text)
        .or_else(|| ctx.handle("input").and_then(NodeValue::as_str).map(str::to_string))
        .or_else(|| ctx.config_str(handle).map(str::to_string))
        .unwrap_or_default();
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(NodeError::config(format!("{} node '{}' has an empty {}", ctx.node.kind, ctx.node.id, handle)));
    }
    let path = expand_tilde(raw);
    if is_path_denied(&path) {
        return Err(NodeError::failed(format!("access denied to sensitive path '{}'", raw)));
    }
    Ok(path)
}

fn max_size_bytes(ctx: &NodeContext<'_>) -> u64 {
    let mb = ctx.config_f64("maxSize").filter(|mb| *mb > 0.0).unwrap_or(DEFAULT_MAX_SIZE_MB);
    (mb * BYTES_PER_MB) as u64
}

fn csv_options(ctx: &NodeContext<'_>) -> (char, bool) {
    let delimiter = ctx.config_str("csvDelimiter").and_then(|d| d.chars().next()).unwrap_or(',');
    let has_header = ctx.config.get("csvHasHeader").and_then(Value::as_bool).unwrap_or(true);
    (delimiter, has_header)
}

pub fn guess_mime_type(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase()
        .as_str()
    {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        "pdf" => "application/pdf",
        "json" => "application/json",
        "csv" => "text/csv",
        "txt" | "md" => "text/plain",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "mp4" => "video/mp4",
        _ => "application/octet-stream",
    }
}

/// Split one CSV line; quotes group delimiters and `""` is a literal quote
fn parse_csv_line(line: &str, delimiter: char) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '"' if in_quotes && chars.peek() == Some(&'"') => {
                current.push('"');
                chars.next();
            }
            '"' => in_quotes = !in_quotes,
            c if c == delimiter && !in_quotes => fields.push(std::mem::take(&mut current).trim().to_string()),
            c => current.push(c),
        }
    }
    fields.push(current.trim().to_string());
    fields
}

/// Rows as objects keyed by header (or `col_{i}` without one)
pub fn parse_csv(content: &str, delimiter: char, has_header: bool) -> Vec<Value> {
    let mut lines = content.lines().filter(|l| !l.trim().is_empty());
    let Some(first) = lines.next() else {
        return Vec::new();
    };
    let first_fields = parse_csv_line(first, delimiter);
    let headers: Vec<String> = if has_header {
        first_fields.clone()
    } else {
        (0..first_fields.len()).map(|i| format!("col_{}", i)).collect()
    };

    let row = |fields: Vec<String>| -> Value {
        let mut object = Map::new();
        for (i, header) in headers.iter().enumerate() {
            object.insert(header.clone(), Value::String(fields.get(i).cloned().unwrap_or_default()));
        }
        Value::Object(object)
    };
    let mut rows = Vec::new();
    if !has_header {
        rows.push(row(first_fields));
    }
    rows.extend(lines.map(|line| row(parse_csv_line(line, delimiter))));
    rows
}

/// Rows of objects as CSV; headers come from the first row
pub fn to_csv(value: &Value, delimiter: char) -> Result<String, NodeError> {
    let rows = value
        .as_array()
        .ok_or_else(|| NodeError::failed("csv mode needs an array of row objects"))?;
    let Some(first) = rows.first() else {
        return Ok(String::new());
    };
    let headers: Vec<&String> = first
        .as_object()
        .ok_or_else(|| NodeError::failed("csv rows must be objects"))?
        .keys()
        .collect();

    let separator = delimiter.to_string();
    let quote = |text: String| -> String {
        if text.contains(delimiter) || text.contains('\n') || text.contains('"') {
            format!("\"{}\"", text.replace('"', "\"\""))
        } else {
            text
        }
    };
    let mut csv = headers.iter().map(|h| quote(h.to_string())).collect::<Vec<_>>().join(&separator);
    csv.push('\n');
    for row in rows.iter().filter_map(Value::as_object) {
        let fields: Vec<String> = headers
            .iter()
            .map(|h| match row.get(h.as_str()) {
                Some(Value::String(s)) => quote(s.clone()),
                Some(Value::Null) | None => String::new(),
                Some(other) => quote(other.to_string()),
            })
            .collect();
        csv.push_str(&fields.join(&separator));
        csv.push('\n');
    }
    Ok(csv)
}

/// Read one file under `mode` into output handles
async fn read_file(path: &Path, mode: &str, csv: (char, bool)) -> Result<NodeOutput, NodeError> {
    let read_failed = |e: std::io::Error| NodeError::failed(format!("failed to read {}: {}", path.display(), e));
    let output = match mode {
        "binary" => {
            let bytes = tokio::fs::read(path).await.map_err(read_failed)?;
            NodeOutput::new()
                .with("content", NodeValue::Binary(bytes))
                .with("mimeType", guess_mime_type(path))
        }
        "json" => {
            let text = tokio::fs::read_to_string(path).await.map_err(read_failed)?;
            let parsed: Value = serde_json::from_str(&text)
                .map_err(|e| NodeError::failed(format!("invalid JSON in {}: {}", path.display(), e)))?;
            NodeOutput::new().with("content", parsed)
        }
        "csv" => {
            let text = tokio::fs::read_to_string(path).await.map_err(read_failed)?;
            let rows = parse_csv(&text, csv.0, csv.1);
            NodeOutput::new()
                .with("rows", NodeValue::Json(Value::Array(rows)))
                .with("content", text)
        }
        "text" => NodeOutput::new().with("content", tokio::fs::read_to_string(path).await.map_err(read_failed)?),
        other => return Err(NodeError::config(format!("unknown file mode '{}'", other))),
    };
    Ok(output)
}

pub struct FileReadNode;

#[async_trait]
impl NodeHandler for FileReadNode {
    fn kind(&self) -> NodeKind {
        NodeKind::FileRead
    }

    async fn execute(&self, ctx: &NodeContext<'_>) -> Result<NodeResult, NodeError> {
        let requested = resolve_path(ctx, "path")?;
        let path = tokio::fs::canonicalize(&requested)
            .await
            .map_err(|e| NodeError::failed(format!("file not found or inaccessible: {} ({})", requested.display(), e)))?;
        if is_path_denied(&path) {
            return Err(NodeError::failed(format!(
                "access denied to sensitive path '{}'",
                requested.display()
            )));
        }

        let size = tokio::fs::metadata(&path)
            .await
            .map_err(|e| NodeError::failed(format!("cannot read metadata of {}: {}", path.display(), e)))?
            .len();
        let limit = max_size_bytes(ctx);
        if size > limit {
            return Err(NodeError::failed(format!(
                "file too large: {:.1}MB > {:.1}MB limit",
                size as f64 / BYTES_PER_MB,
                limit as f64 / BYTES_PER_MB
            )));
        }

        let mode = ctx.config_str("mode").unwrap_or("text");
        tracing::debug!("📄 Reading {} ({} bytes, {})", path.display(), size, mode);
        let mut output = read_file(&path, mode, csv_options(ctx)).await?;
        let content = output.resolve("content");
        output.insert("output", content);
        output.insert("size", NodeValue::Number(size as f64));
        output.insert("path", path.to_string_lossy().to_string());
        Ok(NodeResult::new(output))
    }
}

pub struct FileWriteNode;

#[async_trait]
impl NodeHandler for FileWriteNode {
    fn kind(&self) -> NodeKind {
        NodeKind::FileWrite
    }

    async fn execute(&self, ctx: &NodeContext<'_>) -> Result<NodeResult, NodeError> {
        let path = resolve_write_path(ctx)?;
        let content = ctx
            .handle("content")
            .cloned()
            .or_else(|| ctx.config.get("content").cloned().map(NodeValue::from))
            .or_else(|| ctx.handle("input").cloned())
            .filter(|v| !v.is_null())
            .ok_or_else(|| NodeError::failed(format!("file_write node '{}' has no content", ctx.node.id)))?;

        let bytes: Vec<u8> = match ctx.config_str("mode").unwrap_or("text") {
            "json" => {
                let value = content.to_json();
                let pretty = ctx.config.get("jsonPretty").and_then(Value::as_bool).unwrap_or(true);
                let rendered = if pretty {
                    serde_json::to_string_pretty(&value)
                } else {
                    serde_json::to_string(&value)
                };
                rendered
                    .map_err(|e| NodeError::failed(format!("JSON serialization failed: {}", e)))?
                    .into_bytes()
            }
            "csv" => to_csv(&content.to_json(), csv_options(ctx).0)?.into_bytes(),
            "text" => match content {
                NodeValue::Binary(bytes) => bytes,
                other => other.as_text().into_bytes(),
            },
            other => return Err(NodeError::config(format!("unknown file mode '{}'", other))),
        };
        let limit = max_size_bytes(ctx);
        if bytes.len() as u64 > limit {
            return Err(NodeError::failed(format!(
                "content too large: {:.1}MB > {:.1}MB limit",
                bytes.len() as f64 / BYTES_PER_MB,
                limit as f64 / BYTES_PER_MB
            )));
        }

        let create_dirs = ctx.config.get("createDirs").and_then(Value::as_bool).unwrap_or(true);
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if create_dirs {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| NodeError::failed(format!("failed to create {}: {}", parent.display(), e)))?;
            }
        }

        let write_failed = |e: std::io::Error| NodeError::failed(format!("failed to write {}: {}", path.display(), e));
        match ctx.config_str("writeMode").unwrap_or("overwrite") {
            "append" => {
                let mut file = tokio::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)
                    .await
                    .map_err(write_failed)?;
                file.write_all(&bytes).await.map_err(write_failed)?;
                file.flush().await.map_err(write_failed)?;
            }
            "overwrite" => tokio::fs::write(&path, &bytes).await.map_err(write_failed)?,
            other => return Err(NodeError::config(format!("unknown write mode '{}'", other))),
        }

        let written = path.to_string_lossy().to_string();
        tracing::info!("💾 Wrote {} bytes to {}", bytes.len(), written);
        Ok(NodeResult::new(
            NodeOutput::new()
                .with("path", written.as_str())
                .with("output", written.as_str())
                .with("bytes", NodeValue::Number(bytes.len() as f64)),
        ))
    }
}

/// Write target from the `path` handle or config, checked against its real parent
fn resolve_write_path(ctx: &NodeContext<'_>) -> Result<PathBuf, NodeError> {
    let raw = ctx
        .handle("path")
        .map(NodeValue::as_text)
        .or_else(|| ctx.config_str("path").map(str::to_string))
        .unwrap_or_default();
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(NodeError::config(format!("file_write node '{}' has an empty path", ctx.node.id)));
    }
    let path = expand_tilde(raw);
    let denied = is_path_denied(&path)
        || path
            .parent()
            .and_then(|parent| std::fs::canonicalize(parent).ok())
            .map(|parent| is_path_denied(&parent))
            .unwrap_or(false);
    if denied {
        return Err(NodeError::failed(format!("access denied to sensitive path '{}'", raw)));
    }
    Ok(path)
}

/// Compile a shell-style pattern: `*`, `?`, `[...]` and `{a,b}`; `**/` spans directories
pub fn glob_regex(pattern: &str) -> Result<Regex, NodeError> {
    let mut out = String::from("^");
    let mut chars = pattern.chars().peekable();
    let mut in_braces = false;
    while let Some(c) = chars.next() {
        match c {
            '*' if chars.peek() == Some(&'*') => {
                chars.next();
                if chars.peek() == Some(&'/') {
                    chars.next();
                    out.push_str("(?:.*/)?");
                } else {
                    out.push_str(".*");
                }
            }
            '*' => out.push_str("[^/]*"),
            '?' => out.push_str("[^/]"),
            '[' => {
                out.push('[');
                if chars.peek() == Some(&'!') {
                    chars.next();
                    out.push('^');
                }
                for c in chars.by_ref() {
                    if c == ']' {
                        break;
                    }
                    if c == '\\' || c == '[' {
                        out.push('\\');
                    }
                    out.push(c);
                }
                out.push(']');
            }
            '{' if !in_braces => {
                in_braces = true;
                out.push_str("(?:");
            }
            '}' if in_braces => {
                in_braces = false;
                out.push(')');
            }
            ',' if in_braces => out.push('|'),
            c => out.push_str(&regex::escape(&c.to_string())),
        }
    }
    out.push('$');
    Regex::new(&out).map_err(|e| NodeError::config(format!("invalid glob pattern '{}': {}", pattern, e)))
}

struct FileEntry {
    path: PathBuf,
    name: String,
    size: u64,
    modified: Option<DateTime<Utc>>,
}

/// Files under `base` whose relative path (or name) matches, within the size cap
fn collect_matches(
    base: &Path,
    matcher: &Regex,
    match_full_path: bool,
    recursive: bool,
    max_size: u64,
) -> Result<Vec<FileEntry>, NodeError> {
    let mut found = Vec::new();
    let mut pending = vec![base.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let entries = std::fs::read_dir(&dir)
            .map_err(|e| NodeError::failed(format!("cannot list {}: {}", dir.display(), e)))?;
        for entry in entries.flatten() {
            // symlinks out of the base directory are ignored
            let Ok(real) = entry.path().canonicalize() else {
                continue;
            };
            if !real.starts_with(base) || is_path_denied(&real) {
                continue;
            }
            let Ok(metadata) = std::fs::metadata(&real) else {
                continue;
            };
            if metadata.is_dir() {
                if recursive {
                    pending.push(entry.path());
                }
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            let relative = entry
                .path()
                .strip_prefix(base)
                .map(|p| p.to_string_lossy().replace('\\', "/"))
                .unwrap_or_else(|_| name.clone());
            let candidate = if match_full_path { relative.as_str() } else { name.as_str() };
            if !matcher.is_match(candidate) || metadata.len() > max_size {
                continue;
            }
            found.push(FileEntry {
                path: real,
                name,
                size: metadata.len(),
                modified: metadata.modified().ok().map(DateTime::<Utc>::from),
            });
        }
    }
    Ok(found)
}

pub struct FileGlobNode;

#[async_trait]
impl NodeHandler for FileGlobNode {
    fn kind(&self) -> NodeKind {
        NodeKind::FileGlob
    }

    async fn execute(&self, ctx: &NodeContext<'_>) -> Result<NodeResult, NodeError> {
        let requested = resolve_path(ctx, "directory")?;
        let base = tokio::fs::canonicalize(&requested)
            .await
            .map_err(|e| NodeError::failed(format!("directory not found: {} ({})", requested.display(), e)))?;
        if !base.is_dir() {
            return Err(NodeError::failed(format!("not a directory: {}", requested.display())));
        }

        let pattern = ctx.config_str("pattern").filter(|p| !p.trim().is_empty()).unwrap_or("*");
        let matcher = glob_regex(pattern)?;
        let match_full_path = pattern.contains('/');
        let recursive = ctx.config.get("recursive").and_then(Value::as_bool).unwrap_or(false) || match_full_path;
        let max_files = ctx
            .config_u64("maxFiles")
            .map(|n| n as usize)
            .unwrap_or(DEFAULT_MAX_FILES)
            .max(1);
        let max_size = max_size_bytes(ctx);

        let walk_base = base.clone();
        let mut entries = tokio::task::spawn_blocking(move || {
            collect_matches(&walk_base, &matcher, match_full_path, recursive, max_size)
        })
        .await
        .map_err(|e| NodeError::failed(format!("glob task failed: {}", e)))??;

        match ctx.config_str("sortBy").unwrap_or("name") {
            "size" => entries.sort_by_key(|e| e.size),
            "modified" => entries.sort_by_key(|e| e.modified),
            _ => entries.sort_by_key(|e| e.name.to_lowercase()),
        }
        if ctx.config_str("sortOrder") == Some("desc") {
            entries.reverse();
        }
        entries.truncate(max_files);

        let mode = ctx.config_str("mode").unwrap_or("text");
        let csv = csv_options(ctx);
        let mut files = Vec::with_capacity(entries.len());
        let mut paths = Vec::with_capacity(entries.len());
        for entry in &entries {
            let path = entry.path.to_string_lossy().to_string();
            let mut file = match mode {
                "none" => NodeOutput::new(),
                _ => read_file(&entry.path, mode, csv).await?,
            };
            file.insert("path", path.as_str());
            file.insert("name", entry.name.as_str());
            file.insert("size", NodeValue::Number(entry.size as f64));
            if let Some(modified) = entry.modified {
                file.insert("modified", modified.to_rfc3339_opts(SecondsFormat::Secs, true));
            }
            files.push(file.to_json());
            paths.push(Value::String(path));
        }

        tracing::debug!("🗂️ Glob '{}' in {} matched {} file(s)", pattern, base.display(), files.len());
        let count = files.len();
        let files = Value::Array(files);
        Ok(NodeResult::new(
            NodeOutput::new()
                .with("files", NodeValue::Json(files.clone()))
                .with("output", NodeValue::Json(files))
                .with("paths", NodeValue::Json(Value::Array(paths)))
                .with("count", NodeValue::Number(count as f64)),
        ))
    }
}
