//! `read_file` tool: read a workspace file as text, or as an image block.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use turnloop_core::error::ToolError;
use turnloop_core::message::ContentBlock;
use turnloop_core::tool::{Tool, ToolResult};

use crate::path::{self, PathError};

const NAME: &str = "read_file";

pub struct ReadFileTool {
    workspace: PathBuf,
    max_bytes: u64,
    forbidden_paths: Vec<String>,
}

impl ReadFileTool {
    /// A reader confined to `workspace`.
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        Self {
            workspace: workspace.into(),
            max_bytes: 256 * 1024,
            forbidden_paths: Vec::new(),
        }
    }

    /// Text beyond this many bytes is cut off; larger images are refused.
    pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    pub fn with_forbidden_paths(mut self, forbidden_paths: Vec<String>) -> Self {
        self.forbidden_paths = forbidden_paths;
        self
    }

    /// Join the window's lines and clip at `max_bytes`. `clipped` forces the
    /// note when the read itself stopped at the cap.
    fn render_text(&self, bytes: &[u8], clipped: bool) -> String {
        let text = String::from_utf8_lossy(bytes);
        let mut out = text.lines().collect::<Vec<_>>().join("\n");

        let max = usize::try_from(self.max_bytes).unwrap_or(usize::MAX);
        if clipped || out.len() > max {
            let mut cut = max.min(out.len());
            while !out.is_char_boundary(cut) {
                cut -= 1;
            }
            out.truncate(cut);
            out.push_str(&format!("\n[truncated at {max} bytes]"));
        }
        out
    }
}

/// Collect the bytes of lines `offset..offset + limit` (1-based), stopping
/// once more than `cap` bytes are held. Skipped lines are never buffered.
/// Returns the bytes and whether the cap was hit.
async fn read_window<R>(
    mut reader: R,
    offset: usize,
    limit: Option<usize>,
    cap: usize,
) -> std::io::Result<(Vec<u8>, bool)>
where
    R: AsyncBufRead + Unpin,
{
    let mut skip = offset.saturating_sub(1);
    let mut out = Vec::new();
    let mut lines = 0usize;
    if limit == Some(0) {
        return Ok((out, false));
    }

    loop {
        let chunk = reader.fill_buf().await?;
        if chunk.is_empty() {
            return Ok((out, false));
        }
        let mut used = 0;
        for &byte in chunk {
            used += 1;
            if skip > 0 {
                if byte == b'\n' {
                    skip -= 1;
                }
                continue;
            }
            out.push(byte);
            if out.len() > cap {
                return Ok((out, true));
            }
            if byte == b'\n' {
                lines += 1;
                if limit.is_some_and(|limit| lines >= limit) {
                    return Ok((out, false));
                }
            }
        }
        reader.consume(used);
    }
}

fn image_mime(path: &std::path::Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "gif" => Some("image/gif"),
        "webp" => Some("image/webp"),
        _ => None,
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        NAME
    }

    fn description(&self) -> &str {
        "Read a file from the workspace. Text files are returned as text, optionally a \
         range of lines; PNG, JPEG, GIF and WebP files are returned as images."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "File path, relative to the workspace root"
                },
                "offset": {
                    "type": "integer",
                    "description": "First line to return (1-based)",
                    "minimum": 1
                },
                "limit": {
                    "type": "integer",
                    "description": "Maximum number of lines to return",
                    "minimum": 1
                }
            },
            "required": ["path"]
        })
    }

    async fn execute(
        &self,
        cancel: CancellationToken,
        arguments: serde_json::Value,
    ) -> Result<ToolResult, ToolError> {
        let raw = arguments["path"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("Missing 'path' argument".into()))?;
        let offset = arguments["offset"].as_u64().unwrap_or(1) as usize;
        let limit = arguments["limit"].as_u64().map(|n| n as usize);

        let resolved = match path::resolve(&self.workspace, raw, &self.forbidden_paths) {
            Ok(resolved) => resolved,
            Err(e @ PathError::NotFound { .. }) => return Ok(ToolResult::error(e.to_string())),
            Err(e) => {
                return Err(ToolError::PermissionDenied {
                    tool_name: NAME.into(),
                    reason: e.to_string(),
                });
            }
        };

        if resolved.is_dir() {
            return Ok(ToolResult::error(format!("{raw} is a directory")));
        }

        debug!(path = %resolved.display(), "Reading file");

        let read_failed = |e: std::io::Error| ToolError::ExecutionFailed {
            tool_name: NAME.into(),
            reason: format!("Failed to read {raw}: {e}"),
        };

        if let Some(mime) = image_mime(&resolved) {
            let size = tokio::fs::metadata(&resolved).await.map_err(read_failed)?.len();
            if size > self.max_bytes {
                return Ok(ToolResult::error(format!(
                    "Image {raw} is {size} bytes, over the {} byte limit",
                    self.max_bytes
                )));
            }
            let bytes = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(ToolResult::error("Read cancelled")),
                read = tokio::fs::read(&resolved) => read.map_err(read_failed)?,
            };
            return Ok(ToolResult::with_content(vec![
                ContentBlock::text(format!("Read image {raw} ({} bytes)", bytes.len())),
                ContentBlock::image(bytes, mime),
            ]));
        }

        let file = tokio::fs::File::open(&resolved).await.map_err(read_failed)?;
        let cap = usize::try_from(self.max_bytes).unwrap_or(usize::MAX);
        let (bytes, clipped) = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(ToolResult::error("Read cancelled")),
            read = read_window(BufReader::new(file), offset, limit, cap) => read.map_err(read_failed)?,
        };

        Ok(ToolResult::text(self.render_text(&bytes, clipped)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn text_of(result: &ToolResult) -> &str {
        match &result.content[0] {
            ContentBlock::Text { text } => text,
            other => panic!("Expected text block, got {other:?}"),
        }
    }

    #[test]
    fn tool_definition() {
        let tool = ReadFileTool::new(".");
        assert_eq!(tool.name(), "read_file");
        let schema = tool.parameters_schema();
        assert_eq!(schema["required"], serde_json::json!(["path"]));
        assert!(schema["properties"]["path"].is_object());
    }

    #[tokio::test]
    async fn read_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut f = std::fs::File::create(dir.path().join("test.txt")).unwrap();
        writeln!(f, "Hello, world!").unwrap();

        let tool = ReadFileTool::new(dir.path());
        let result = tool
            .execute(
                CancellationToken::new(),
                serde_json::json!({ "path": "test.txt" }),
            )
            .await
            .unwrap();

        assert!(!result.is_error);
        assert_eq!(text_of(&result), "Hello, world!");
    }

    #[tokio::test]
    async fn line_window() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("lines.txt"), "one\ntwo\nthree\nfour\n").unwrap();

        let tool = ReadFileTool::new(dir.path());
        let result = tool
            .execute(
                CancellationToken::new(),
                serde_json::json!({ "path": "lines.txt", "offset": 2, "limit": 2 }),
            )
            .await
            .unwrap();
        assert_eq!(text_of(&result), "two\nthree");
    }

    #[tokio::test]
    async fn long_file_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("big.txt"), "x".repeat(100)).unwrap();

        let tool = ReadFileTool::new(dir.path()).with_max_bytes(10);
        let result = tool
            .execute(
                CancellationToken::new(),
                serde_json::json!({ "path": "big.txt" }),
            )
            .await
            .unwrap();
        assert!(!result.is_error);
        assert!(text_of(&result).starts_with("xxxxxxxxxx\n[truncated at 10 bytes]"));
    }

    #[tokio::test]
    async fn window_past_the_byte_cap_is_still_reachable() {
        let dir = tempfile::tempdir().unwrap();
        let mut body = "y".repeat(5000);
        body.push_str("\ntarget line\nafter\n");
        std::fs::write(dir.path().join("wide.txt"), body).unwrap();

        let tool = ReadFileTool::new(dir.path()).with_max_bytes(64);
        let result = tool
            .execute(
                CancellationToken::new(),
                serde_json::json!({ "path": "wide.txt", "offset": 2, "limit": 1 }),
            )
            .await
            .unwrap();
        assert_eq!(text_of(&result), "target line");
    }

    #[tokio::test]
    async fn read_stops_just_past_the_cap() {
        let body = "z".repeat(1 << 20);
        let (bytes, clipped) = read_window(body.as_bytes(), 1, None, 16).await.unwrap();
        assert!(clipped);
        assert_eq!(bytes.len(), 17);

        let (bytes, clipped) = read_window(&b"a\nb\nc\n"[..], 2, Some(5), 16).await.unwrap();
        assert!(!clipped);
        assert_eq!(bytes, b"b\nc\n");
    }

    #[tokio::test]
    async fn oversized_image_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("big.png"), vec![0u8; 64]).unwrap();

        let tool = ReadFileTool::new(dir.path()).with_max_bytes(32);
        let result = tool
            .execute(
                CancellationToken::new(),
                serde_json::json!({ "path": "big.png" }),
            )
            .await
            .unwrap();
        assert!(result.is_error);
        assert!(text_of(&result).contains("64 bytes"));
    }

    #[tokio::test]
    async fn image_comes_back_as_image_block() {
        let dir = tempfile::tempdir().unwrap();
        let png = [0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a];
        std::fs::write(dir.path().join("dot.png"), png).unwrap();

        let tool = ReadFileTool::new(dir.path());
        let result = tool
            .execute(
                CancellationToken::new(),
                serde_json::json!({ "path": "dot.png" }),
            )
            .await
            .unwrap();
        assert_eq!(result.content.len(), 2);
        assert_eq!(result.content[1], ContentBlock::image(png.to_vec(), "image/png"));
    }

    #[tokio::test]
    async fn read_nonexistent_file_is_error_result() {
        let dir = tempfile::tempdir().unwrap();
        let tool = ReadFileTool::new(dir.path());
        let result = tool
            .execute(
                CancellationToken::new(),
                serde_json::json!({ "path": "missing.txt" }),
            )
            .await
            .unwrap();

        assert!(result.is_error);
        assert_eq!(text_of(&result), "File not found: missing.txt");
    }

    #[tokio::test]
    async fn missing_path_argument() {
        let tool = ReadFileTool::new(".");
        let result = tool
            .execute(CancellationToken::new(), serde_json::json!({}))
            .await;
        assert!(matches!(result, Err(ToolError::InvalidArguments(_))));
    }

    #[tokio::test]
    async fn path_traversal_blocked() {
        let outer = tempfile::tempdir().unwrap();
        let workspace = outer.path().join("ws");
        std::fs::create_dir(&workspace).unwrap();
        std::fs::write(outer.path().join("passwd"), "root").unwrap();

        let tool = ReadFileTool::new(&workspace);
        let result = tool
            .execute(
                CancellationToken::new(),
                serde_json::json!({ "path": "../passwd" }),
            )
            .await;
        assert!(matches!(result, Err(ToolError::PermissionDenied { .. })));
    }

    #[tokio::test]
    async fn directory_is_error_result() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let tool = ReadFileTool::new(dir.path());
        let result = tool
            .execute(CancellationToken::new(), serde_json::json!({ "path": "sub" }))
            .await
            .unwrap();
        assert!(result.is_error);
    }
}
