//! Per-result truncation with spill-to-disk.
//!
//! Tool results larger than [`MAX_TOOL_RESULT_SIZE`] are persisted in full
//! under `.nanobot/<sessionId>/truncated-outputs/` and replaced by a
//! truncated head plus a pointer to the file. Results carrying the
//! skip-truncation content meta pass through unchanged.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;

use nanobot_types::{CallResult, Content, SKIP_TRUNCATION_META_KEY};

/// Cap on the byte size of a tool result fed back to the model.
pub const MAX_TOOL_RESULT_SIZE: usize = 50 * 1024;

fn sanitize_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^a-zA-Z0-9_\-.]").expect("static regex"))
}

/// Sanitize one path component: anything outside `[A-Za-z0-9_.-]` becomes
/// `_`, leading dots are stripped, length caps at 100, empty maps to
/// `"unnamed"`. Idempotent.
pub fn sanitize_path_component(s: &str) -> String {
    let mut out = sanitize_re().replace_all(s, "_").into_owned();
    out = out.trim_start_matches('.').to_string();
    if out.len() > 100 {
        out.truncate(100);
    }
    if out.is_empty() {
        out = "unnamed".to_string();
    }
    out
}

fn has_skip_truncation(content: &[Content]) -> bool {
    content.iter().any(|c| c.meta_flag(SKIP_TRUNCATION_META_KEY))
}

fn content_size(content: &[Content]) -> usize {
    content.iter().map(Content::byte_size).sum()
}

/// Truncate a tool result, spilling the full content to disk when it
/// exceeds the cap. `workspace_root` anchors the relative spill path;
/// `is_error` survives the transformation.
pub fn truncate_tool_result(
    workspace_root: &Path,
    session_id: &str,
    tool_name: &str,
    call_id: &str,
    result: CallResult,
) -> CallResult {
    if result.content.is_empty() || has_skip_truncation(&result.content) {
        return result;
    }

    let size = content_size(&result.content);
    if size <= MAX_TOOL_RESULT_SIZE {
        return result;
    }

    let all_text = result.content.iter().all(|c| matches!(c, Content::Text { .. }));
    let ext = if all_text { ".txt" } else { ".json" };

    let relative: PathBuf = [
        ".nanobot",
        &sanitize_path_component(session_id),
        "truncated-outputs",
        &format!(
            "{}-{}{ext}",
            sanitize_path_component(tool_name),
            sanitize_path_component(call_id)
        ),
    ]
    .iter()
    .collect();
    let display_path = relative.to_string_lossy().into_owned();
    let full_path = workspace_root.join(&relative);

    let write_result = write_full_result(&result.content, &full_path, all_text);
    let mut truncated = build_truncated_content(&result.content, MAX_TOOL_RESULT_SIZE, &display_path);

    if let Err(e) = write_result {
        tracing::error!(
            path = %full_path.display(),
            error = %e,
            "failed to persist full tool result"
        );
        truncated.insert(
            0,
            Content::text(format!(
                "Note: failed to persist full tool output to {display_path}: {e}. \
                 Only truncated output is available."
            )),
        );
    }

    CallResult {
        content: truncated,
        ..result
    }
}

fn write_full_result(content: &[Content], path: &Path, all_text: bool) -> std::io::Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))?;
        }
    }

    let bytes = if all_text {
        let texts: Vec<&str> = content.iter().filter_map(Content::as_text).collect();
        texts.join("\n").into_bytes()
    } else {
        serde_json::to_vec_pretty(content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?
    };

    std::fs::write(path, bytes)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

/// Build the truncated content: the suffix pointer is budgeted first, then
/// items consume what remains in order, the last partial text item cut at a
/// character boundary. Non-text items collapse to a pointer note.
fn build_truncated_content(content: &[Content], budget: usize, display_path: &str) -> Vec<Content> {
    let suffix = format!("\n\n[Truncated: full output available at {display_path}]");
    let mut remaining = budget.saturating_sub(suffix.len());

    let mut out = Vec::new();
    for item in content {
        if remaining == 0 {
            break;
        }
        match item {
            Content::Text { text, .. } => {
                let cut = floor_char_boundary(text, remaining);
                let head = &text[..cut];
                remaining -= head.len();
                out.push(Content::text(head));
            }
            other => {
                let note = format!("[{} content written to {display_path}]", other.kind());
                remaining = remaining.saturating_sub(note.len());
                out.push(Content::text(note));
            }
        }
    }

    out.push(Content::text(suffix));
    out
}

fn floor_char_boundary(text: &str, max: usize) -> usize {
    if max >= text.len() {
        return text.len();
    }
    let mut cut = max;
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    cut
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Map, Value};
    use tempfile::TempDir;

    fn big_text_result(len: usize) -> CallResult {
        CallResult {
            content: vec![Content::text("X".repeat(len))],
            ..Default::default()
        }
    }

    #[test]
    fn sanitize_is_idempotent_and_bounded() {
        let cases = [
            ("simple", "simple"),
            ("has spaces/and:colons", "has_spaces_and_colons"),
            ("...leading.dots", "leading.dots"),
            ("", "unnamed"),
            ("///", "___"),
        ];
        for (input, want) in cases {
            let once = sanitize_path_component(input);
            assert_eq!(once, want);
            assert_eq!(sanitize_path_component(&once), once);
        }

        let long = sanitize_path_component(&"a".repeat(250));
        assert_eq!(long.len(), 100);
        assert_eq!(sanitize_path_component(&long), long);
    }

    #[test]
    fn small_results_pass_through() {
        let tmp = TempDir::new().unwrap();
        let result = big_text_result(100);
        let out = truncate_tool_result(tmp.path(), "sid", "tool", "call", result);
        assert_eq!(out.content.len(), 1);
        assert_eq!(out.content[0].byte_size(), 100);
    }

    #[test]
    fn oversized_text_spills_and_truncates() {
        let tmp = TempDir::new().unwrap();
        let out = truncate_tool_result(tmp.path(), "sid", "big", "call-1", big_text_result(60_000));

        // Head + pointer suffix.
        assert_eq!(out.content.len(), 2);
        let head = out.content[0].as_text().unwrap();
        let suffix = out.content[1].as_text().unwrap();
        assert!(head.len() <= MAX_TOOL_RESULT_SIZE);
        assert!(head.chars().all(|c| c == 'X'));
        assert!(suffix.contains("[Truncated: full output available at "));
        assert!(suffix.contains(".nanobot/sid/truncated-outputs/big-call-1.txt"));

        // Total stays within budget.
        let total: usize = out.content.iter().map(Content::byte_size).sum();
        assert!(total <= MAX_TOOL_RESULT_SIZE);

        // The full content is on disk.
        let path = tmp
            .path()
            .join(".nanobot/sid/truncated-outputs/big-call-1.txt");
        let written = std::fs::read_to_string(&path).unwrap();
        assert_eq!(written.len(), 60_000);
        assert!(written.chars().all(|c| c == 'X'));
    }

    #[cfg(unix)]
    #[test]
    fn spill_files_are_private() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = TempDir::new().unwrap();
        truncate_tool_result(tmp.path(), "sid", "big", "call-1", big_text_result(60_000));

        let dir = tmp.path().join(".nanobot/sid/truncated-outputs");
        assert_eq!(dir.metadata().unwrap().permissions().mode() & 0o777, 0o700);
        let file = dir.join("big-call-1.txt");
        assert_eq!(file.metadata().unwrap().permissions().mode() & 0o777, 0o600);
    }

    #[test]
    fn skip_truncation_meta_passes_through() {
        let tmp = TempDir::new().unwrap();
        let mut meta = Map::new();
        meta.insert(SKIP_TRUNCATION_META_KEY.to_string(), Value::Bool(true));
        let result = CallResult {
            content: vec![Content::Text {
                text: "Y".repeat(60_000),
                meta: Some(meta),
            }],
            ..Default::default()
        };

        let out = truncate_tool_result(tmp.path(), "sid", "tool", "call", result);
        assert_eq!(out.content[0].byte_size(), 60_000);
        assert!(!tmp.path().join(".nanobot").exists());
    }

    #[test]
    fn mixed_content_spills_as_json() {
        let tmp = TempDir::new().unwrap();
        let result = CallResult {
            content: vec![
                Content::text("Z".repeat(60_000)),
                Content::Image {
                    data: "aGk=".to_string(),
                    mime_type: "image/png".to_string(),
                    meta: None,
                },
            ],
            is_error: true,
            ..Default::default()
        };

        let out = truncate_tool_result(tmp.path(), "sid", "shot", "c9", result);

        // isError survives.
        assert!(out.is_error);
        // The image collapsed to a pointer note.
        let notes: Vec<&str> = out.content.iter().filter_map(Content::as_text).collect();
        assert!(notes.iter().any(|t| t.contains("[image content written to ")));

        let path = tmp.path().join(".nanobot/sid/truncated-outputs/shot-c9.json");
        let written: Vec<Content> = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(written.len(), 2);
        assert_eq!(written[0].byte_size(), 60_000);
    }

    #[test]
    fn sanitized_names_land_in_the_path() {
        let tmp = TempDir::new().unwrap();
        truncate_tool_result(tmp.path(), "s/1", "my tool", "id:42", big_text_result(60_000));
        let path = tmp.path().join(".nanobot/s_1/truncated-outputs/my_tool-id_42.txt");
        assert!(path.exists());
    }

    #[test]
    fn truncation_cuts_on_char_boundaries() {
        let tmp = TempDir::new().unwrap();
        // Multi-byte characters across the cut point must not split.
        let result = CallResult {
            content: vec![Content::text("é".repeat(40_000))],
            ..Default::default()
        };
        let out = truncate_tool_result(tmp.path(), "sid", "tool", "call", result);
        for c in &out.content {
            // as_text on invalid UTF-8 would have panicked at construction;
            // reaching here with text items means boundaries held.
            assert!(c.as_text().is_some());
        }
    }

    #[test]
    fn empty_content_passes_through() {
        let tmp = TempDir::new().unwrap();
        let out = truncate_tool_result(tmp.path(), "sid", "tool", "call", CallResult::default());
        assert!(out.content.is_empty());
    }
}
