//! Text utilities the host contract exposes to channel senders: chunking
//! to per-platform limits and Markdown table conversion.
//!
//! Chunking is lossless: concatenating the chunks reproduces the input
//! byte-for-byte, and every chunk fits the limit in the requested unit.

use qiao_common::{ChannelKind, markdown};

pub use qiao_common::markdown::TableMode;

/// Unit a platform's message limit is expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkMode {
    Chars,
    Bytes,
}

/// Platform default chunk limit, overridable per account.
#[must_use]
pub fn resolve_text_chunk_limit(channel: ChannelKind, configured: Option<usize>) -> usize {
    if let Some(limit) = configured.filter(|l| *l > 0) {
        return limit;
    }
    match channel {
        ChannelKind::Dingtalk => 4000,
        ChannelKind::Feishu => 4000,
        ChannelKind::Wecom | ChannelKind::WecomApp => 2048,
        ChannelKind::Qqbot => 1500,
    }
}

/// WeCom limits are byte counts; the rest count characters.
#[must_use]
pub fn resolve_chunk_mode(channel: ChannelKind) -> ChunkMode {
    match channel {
        ChannelKind::Wecom | ChannelKind::WecomApp => ChunkMode::Bytes,
        _ => ChunkMode::Chars,
    }
}

/// Table handling for a platform's text renderer.
#[must_use]
pub fn resolve_markdown_table_mode(channel: ChannelKind) -> TableMode {
    match channel {
        ChannelKind::Dingtalk | ChannelKind::Feishu => TableMode::Keep,
        ChannelKind::Wecom | ChannelKind::WecomApp | ChannelKind::Qqbot => TableMode::Bullets,
    }
}

/// Convert Markdown tables per mode. Delegates to the shared pipeline.
#[must_use]
pub fn convert_markdown_tables(text: &str, mode: TableMode) -> String {
    markdown::convert_tables(text, mode)
}

/// Chunk markdown-ish text by character count, preferring paragraph and
/// line boundaries.
#[must_use]
pub fn chunk_markdown_text(text: &str, limit: usize) -> Vec<String> {
    chunk_text_with_mode(text, limit, ChunkMode::Chars)
}

/// Chunk `text` so every piece fits `limit` in `mode` units.
#[must_use]
pub fn chunk_text_with_mode(text: &str, limit: usize, mode: ChunkMode) -> Vec<String> {
    if limit == 0 || text.is_empty() {
        return if text.is_empty() {
            Vec::new()
        } else {
            vec![text.to_string()]
        };
    }

    let mut chunks = Vec::new();
    let mut remaining = text;
    while !remaining.is_empty() {
        if fits(remaining, limit, mode) {
            chunks.push(remaining.to_string());
            break;
        }
        let window = window_end(remaining, limit, mode);
        let split_at = best_split(&remaining[..window]).unwrap_or(window);
        chunks.push(remaining[..split_at].to_string());
        remaining = &remaining[split_at..];
    }
    chunks
}

fn fits(text: &str, limit: usize, mode: ChunkMode) -> bool {
    match mode {
        ChunkMode::Bytes => text.len() <= limit,
        ChunkMode::Chars => text.chars().count() <= limit,
    }
}

/// Largest byte index ≤ limit units that lands on a char boundary, always
/// covering at least one character.
fn window_end(text: &str, limit: usize, mode: ChunkMode) -> usize {
    let end = match mode {
        ChunkMode::Chars => text
            .char_indices()
            .nth(limit)
            .map(|(i, _)| i)
            .unwrap_or(text.len()),
        ChunkMode::Bytes => {
            let mut end = limit.min(text.len());
            while end > 0 && !text.is_char_boundary(end) {
                end -= 1;
            }
            end
        },
    };
    if end == 0 {
        text.chars()
            .next()
            .map(char::len_utf8)
            .unwrap_or(text.len())
    } else {
        end
    }
}

/// Split point inside the window: paragraph break, then newline, then
/// space — always keeping the separator in the left chunk so no bytes are
/// dropped.
fn best_split(window: &str) -> Option<usize> {
    if let Some(pos) = window.rfind("\n\n") {
        if pos > 0 {
            return Some(pos + 2);
        }
    }
    if let Some(pos) = window.rfind('\n') {
        if pos > 0 {
            return Some(pos + 1);
        }
    }
    match window.rfind(' ') {
        Some(pos) if pos > 0 => Some(pos + 1),
        _ => None,
    }
}
