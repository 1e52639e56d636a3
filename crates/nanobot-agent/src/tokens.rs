//! Token estimation for compaction decisions.
//!
//! Text tokens use the deterministic `len/4` heuristic; it is monotonic in
//! added content, which keeps the compaction trigger from oscillating.
//! Image tokens are estimated from the decoded image header dimensions with
//! `round(min(w,1568) × min(h,1568·aspect) / 750)`; anything that fails to
//! decode counts as a conservative 1600 tokens, roughly a max-sized image.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;

use nanobot_types::{ChatMessage, Content, ToolUseDefinition};

/// Characters per token for plain text.
const CHARS_PER_TOKEN: usize = 4;
/// Longest edge an image is scaled down to before costing tokens.
const MAX_IMAGE_EDGE: u32 = 1568;
/// Token cost assumed for undecodable images.
const IMAGE_TOKEN_FALLBACK: usize = 1600;

/// Count tokens in plain text.
pub fn count_tokens(text: &str) -> usize {
    text.len() / CHARS_PER_TOKEN
}

/// Estimate the total token count for messages, a system prompt, and tool
/// definitions.
pub fn estimate_tokens(messages: &[ChatMessage], system_prompt: &str, tools: &[ToolUseDefinition]) -> usize {
    let mut text = String::new();
    let mut image_tokens = 0usize;

    if !system_prompt.is_empty() {
        text.push_str(system_prompt);
        text.push('\n');
    }

    for msg in messages {
        text.push_str(&msg.role);
        text.push_str(": ");
        for item in &msg.items {
            if let Some(content) = &item.content {
                accumulate_content(content, &mut text, &mut image_tokens);
                text.push(' ');
            }
            if let Some(call) = &item.tool_call {
                text.push_str(&call.name);
                text.push(' ');
                text.push_str(&call.arguments);
                text.push(' ');
            }
            if let Some(result) = &item.tool_call_result {
                for content in &result.output.content {
                    accumulate_content(content, &mut text, &mut image_tokens);
                    text.push(' ');
                }
            }
            if let Some(reasoning) = &item.reasoning {
                for summary in &reasoning.summary {
                    text.push_str(&summary.text);
                    text.push(' ');
                }
            }
        }
        text.push('\n');
    }

    for tool in tools {
        text.push_str(&tool.name);
        text.push(' ');
        text.push_str(&tool.description);
        text.push(' ');
        if let Some(parameters) = &tool.parameters {
            text.push_str(&parameters.to_string());
            text.push(' ');
        }
        text.push('\n');
    }

    count_tokens(&text) + image_tokens
}

fn accumulate_content(content: &Content, text: &mut String, image_tokens: &mut usize) {
    match content {
        Content::Text { text: t, .. } => text.push_str(t),
        Content::Image { data, .. } => *image_tokens += estimate_image_tokens(data),
        Content::Audio { data, .. } => text.push_str(data),
        Content::Resource { resource, .. } => {
            text.push_str(&resource.text);
            text.push_str(&resource.blob);
        }
        Content::Other(v) => {
            if let Ok(encoded) = serde_json::to_string(v) {
                text.push_str(&encoded);
            }
        }
    }
}

/// Estimate vision tokens for a base64-encoded image from its pixel
/// dimensions, scaled so neither edge exceeds 1568.
pub fn estimate_image_tokens(data: &str) -> usize {
    let Ok(raw) = BASE64.decode(data.trim()) else {
        return IMAGE_TOKEN_FALLBACK;
    };
    let Some((w, h)) = image_dimensions(&raw) else {
        return IMAGE_TOKEN_FALLBACK;
    };

    let (mut w, mut h) = (w as f64, h as f64);
    let max_edge = MAX_IMAGE_EDGE as f64;
    if w > max_edge || h > max_edge {
        let scale = max_edge / w.max(h);
        w *= scale;
        h *= scale;
    }

    ((w * h) / 750.0).round() as usize
}

/// Read the dimensions from an image header. Only the fixed header fields
/// are inspected, never the pixel data. PNG, GIF, JPEG, and WebP (VP8X)
/// are recognized.
fn image_dimensions(data: &[u8]) -> Option<(u32, u32)> {
    if data.starts_with(b"\x89PNG\r\n\x1a\n") && data.len() >= 24 {
        let w = u32::from_be_bytes(data[16..20].try_into().ok()?);
        let h = u32::from_be_bytes(data[20..24].try_into().ok()?);
        return Some((w, h));
    }

    if (data.starts_with(b"GIF87a") || data.starts_with(b"GIF89a")) && data.len() >= 10 {
        let w = u16::from_le_bytes(data[6..8].try_into().ok()?) as u32;
        let h = u16::from_le_bytes(data[8..10].try_into().ok()?) as u32;
        return Some((w, h));
    }

    if data.starts_with(b"\xff\xd8") {
        return jpeg_dimensions(data);
    }

    // WebP extended header: canvas size stored minus-one in 24-bit LE.
    if data.len() >= 30 && &data[0..4] == b"RIFF" && &data[8..12] == b"WEBP" && &data[12..16] == b"VP8X" {
        let w = 1 + u32::from_le_bytes([data[24], data[25], data[26], 0]);
        let h = 1 + u32::from_le_bytes([data[27], data[28], data[29], 0]);
        return Some((w, h));
    }

    None
}

/// Walk JPEG segment markers to the first start-of-frame.
fn jpeg_dimensions(data: &[u8]) -> Option<(u32, u32)> {
    let mut pos = 2usize;
    while pos + 4 <= data.len() {
        if data[pos] != 0xff {
            return None;
        }
        let marker = data[pos + 1];
        // Standalone markers carry no length.
        if (0xd0..=0xd9).contains(&marker) {
            pos += 2;
            continue;
        }
        let length = u16::from_be_bytes(data[pos + 2..pos + 4].try_into().ok()?) as usize;
        let is_sof = matches!(marker, 0xc0..=0xcf) && !matches!(marker, 0xc4 | 0xc8 | 0xcc);
        if is_sof {
            if pos + 9 > data.len() {
                return None;
            }
            let h = u16::from_be_bytes(data[pos + 5..pos + 7].try_into().ok()?) as u32;
            let w = u16::from_be_bytes(data[pos + 7..pos + 9].try_into().ok()?) as u32;
            return Some((w, h));
        }
        pos += 2 + length;
    }
    None
}
