//! Best-effort Markdown degradation for platforms that render plain text
//! only (WeCom text messages, QQ without markdown approval).
//!
//! The pipeline is a fixed sequence of passes over the source: code blocks,
//! headings, emphasis, lists, inline code, strikethrough, links, images,
//! tables, quotes, rules, whitespace. The order is load-bearing: a pass may
//! rely on earlier passes having neutralised markers it would otherwise
//! misread. The result is idempotent: degrading already-degraded text is a
//! no-op.

/// How `convert_tables` should rewrite Markdown tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TableMode {
    /// Leave table markup untouched.
    #[default]
    Keep,
    /// Rewrite each data row as a bullet with `header: cell` pairs.
    Bullets,
}

impl TableMode {
    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value.trim() {
            "bullets" => Self::Bullets,
            _ => Self::Keep,
        }
    }
}

/// Degrade Markdown to plain text.
///
/// Code blocks become four-space indented text preceded by a language
/// label, headings become `【heading】`, emphasis markers are stripped,
/// tables are rewritten as space-padded columns, images become
/// `[image: alt]`, and inline links become `text (url)`.
#[must_use]
pub fn strip_to_plain_text(input: &str) -> String {
    let text = degrade_code_blocks(input);
    let mut lines: Vec<String> = Vec::new();
    let mut table_buf: Vec<String> = Vec::new();

    for raw in text.lines() {
        if is_table_row(raw) {
            table_buf.push(raw.to_string());
            continue;
        }
        if !table_buf.is_empty() {
            lines.extend(render_table_padded(&table_buf));
            table_buf.clear();
        }
        lines.push(degrade_line(raw));
    }
    if !table_buf.is_empty() {
        lines.extend(render_table_padded(&table_buf));
    }

    collapse_whitespace(&lines)
}

/// Convert Markdown tables per `mode`, leaving the rest of the text alone.
#[must_use]
pub fn convert_tables(input: &str, mode: TableMode) -> String {
    if mode == TableMode::Keep {
        return input.to_string();
    }

    let mut out: Vec<String> = Vec::new();
    let mut table_buf: Vec<String> = Vec::new();
    for raw in input.lines() {
        if is_table_row(raw) {
            table_buf.push(raw.to_string());
            continue;
        }
        if !table_buf.is_empty() {
            out.extend(render_table_bullets(&table_buf));
            table_buf.clear();
        }
        out.push(raw.to_string());
    }
    if !table_buf.is_empty() {
        out.extend(render_table_bullets(&table_buf));
    }

    let mut joined = out.join("\n");
    if input.ends_with('\n') {
        joined.push('\n');
    }
    joined
}

// ── pass: fenced code blocks ────────────────────────────────────────────────

fn degrade_code_blocks(input: &str) -> String {
    let mut out: Vec<String> = Vec::new();
    let mut in_fence = false;
    for line in input.lines() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("```") {
            if in_fence {
                in_fence = false;
            } else {
                in_fence = true;
                let lang = trimmed.trim_start_matches('`').trim();
                if !lang.is_empty() {
                    out.push(format!("[{lang}]"));
                }
            }
            continue;
        }
        if in_fence {
            out.push(format!("    {line}"));
        } else {
            out.push(line.to_string());
        }
    }
    let mut joined = out.join("\n");
    if input.ends_with('\n') {
        joined.push('\n');
    }
    joined
}

// ── per-line passes ─────────────────────────────────────────────────────────

fn is_code_line(line: &str) -> bool {
    line.starts_with("    ")
}

fn degrade_line(line: &str) -> String {
    if is_code_line(line) {
        return line.trim_end().to_string();
    }

    // heading
    let mut line = line.to_string();
    if line.starts_with('#') {
        let level = line.chars().take_while(|c| *c == '#').count();
        if level <= 6 {
            let rest = line[level..].trim();
            if !rest.is_empty() && line.as_bytes().get(level) == Some(&b' ') {
                line = format!("【{rest}】");
            }
        }
    }

    let mut line = strip_pair(&line, "**");
    line = strip_pair(&line, "__");
    line = strip_single_emphasis(&line, '*');
    line = strip_single_emphasis(&line, '_');

    // list markers
    if let Some(rest) = line
        .strip_prefix("- ")
        .or_else(|| line.strip_prefix("* "))
        .or_else(|| line.strip_prefix("+ "))
    {
        line = format!("• {rest}");
    }

    line = strip_pair(&line, "`");
    line = strip_pair(&line, "~~");
    line = degrade_links(&line);
    line = degrade_images(&line);

    // quote
    if let Some(rest) = line.strip_prefix("> ") {
        line = rest.to_string();
    } else if line == ">" {
        line = String::new();
    }

    // horizontal rule
    let bare = line.trim();
    if bare.len() >= 3 && (bare.chars().all(|c| c == '-') || bare.chars().all(|c| c == '*')) {
        line = String::new();
    }

    line.trim_end().to_string()
}

/// Strip a symmetric marker when it opens and closes on the same line.
fn strip_pair(line: &str, marker: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut rest = line;
    loop {
        let Some(open) = rest.find(marker) else {
            out.push_str(rest);
            break;
        };
        let after = &rest[open + marker.len()..];
        let Some(close) = after.find(marker) else {
            out.push_str(rest);
            break;
        };
        out.push_str(&rest[..open]);
        out.push_str(&after[..close]);
        rest = &after[close + marker.len()..];
    }
    out
}

/// Strip single-character emphasis (`*x*`, `_x_`) without touching list
/// markers or identifiers_with_underscores.
fn strip_single_emphasis(line: &str, marker: char) -> String {
    let chars: Vec<char> = line.chars().collect();
    let mut out = String::with_capacity(line.len());
    let mut i = 0;
    while i < chars.len() {
        if chars[i] == marker {
            // candidate opener: next char must be non-space, and a closer
            // must exist with a non-space before it
            if let Some(close_rel) = find_emphasis_close(&chars[i + 1..], marker) {
                let close = i + 1 + close_rel;
                let inner: String = chars[i + 1..close].iter().collect();
                let prev_ok = i == 0 || !chars[i - 1].is_alphanumeric();
                let next_ok = close + 1 >= chars.len() || !chars[close + 1].is_alphanumeric();
                if prev_ok && next_ok && !inner.is_empty() {
                    out.push_str(&inner);
                    i = close + 1;
                    continue;
                }
            }
        }
        out.push(chars[i]);
        i += 1;
    }
    out
}

fn find_emphasis_close(chars: &[char], marker: char) -> Option<usize> {
    if chars.first().is_none_or(|c| c.is_whitespace()) {
        return None;
    }
    let mut idx = None;
    for (i, c) in chars.iter().enumerate() {
        if *c == marker {
            idx = Some(i);
            break;
        }
    }
    let i = idx?;
    if i == 0 || chars[i - 1].is_whitespace() {
        return None;
    }
    Some(i)
}

fn degrade_images(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut rest = line;
    while let Some(start) = rest.find("![") {
        let tail = &rest[start..];
        if let Some((alt, _url, consumed)) = parse_bracket_link(&tail[1..]) {
            out.push_str(&rest[..start]);
            out.push_str(&format!("[image: {alt}]"));
            rest = &tail[1 + consumed..];
        } else {
            out.push_str(&rest[..start + 2]);
            rest = &rest[start + 2..];
        }
    }
    out.push_str(rest);
    out
}

fn degrade_links(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut rest = line;
    while let Some(start) = rest.find('[') {
        // image syntax is handled by the image pass
        if start > 0 && rest.as_bytes()[start - 1] == b'!' {
            out.push_str(&rest[..start + 1]);
            rest = &rest[start + 1..];
            continue;
        }
        if let Some((text, url, consumed)) = parse_bracket_link(&rest[start..]) {
            out.push_str(&rest[..start]);
            out.push_str(&format!("{text} ({url})"));
            rest = &rest[start + consumed..];
        } else {
            out.push_str(&rest[..start + 1]);
            rest = &rest[start + 1..];
        }
    }
    out.push_str(rest);
    out
}

/// Parse `[text](url)` at the start of `input`; returns (text, url, len).
fn parse_bracket_link(input: &str) -> Option<(String, String, usize)> {
    let close = input.find(']')?;
    if !input[close + 1..].starts_with('(') {
        return None;
    }
    let url_end = input[close + 2..].find(')')?;
    let text = input[1..close].to_string();
    let url = input[close + 2..close + 2 + url_end].to_string();
    Some((text, url, close + 2 + url_end + 1))
}

// ── tables ──────────────────────────────────────────────────────────────────

fn is_table_row(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.starts_with('|') && trimmed.len() > 1
}

fn split_cells(line: &str) -> Vec<String> {
    line.trim()
        .trim_matches('|')
        .split('|')
        .map(|cell| cell.trim().to_string())
        .collect()
}

fn is_separator_row(cells: &[String]) -> bool {
    !cells.is_empty()
        && cells
            .iter()
            .all(|c| !c.is_empty() && c.chars().all(|ch| matches!(ch, '-' | ':' | ' ')))
}

fn parse_table(lines: &[String]) -> Vec<Vec<String>> {
    lines
        .iter()
        .map(|line| split_cells(line))
        .filter(|cells| !is_separator_row(cells))
        .map(|cells| cells.iter().map(|cell| degrade_line(cell)).collect())
        .collect()
}

fn render_table_padded(lines: &[String]) -> Vec<String> {
    let rows = parse_table(lines);
    if rows.is_empty() {
        return Vec::new();
    }
    let columns = rows.iter().map(Vec::len).max().unwrap_or(0);
    let mut widths = vec![0usize; columns];
    for row in &rows {
        for (i, cell) in row.iter().enumerate() {
            widths[i] = widths[i].max(cell.chars().count());
        }
    }
    rows.iter()
        .map(|row| {
            let mut parts = Vec::with_capacity(row.len());
            for (i, cell) in row.iter().enumerate() {
                let pad = widths[i].saturating_sub(cell.chars().count());
                if i + 1 == row.len() {
                    parts.push(cell.clone());
                } else {
                    parts.push(format!("{cell}{}", " ".repeat(pad)));
                }
            }
            parts.join("  ").trim_end().to_string()
        })
        .collect()
}

fn render_table_bullets(lines: &[String]) -> Vec<String> {
    let rows = parse_table(lines);
    let Some((header, data)) = rows.split_first() else {
        return Vec::new();
    };
    if data.is_empty() {
        return vec![header.join("  ")];
    }
    data.iter()
        .map(|row| {
            let first = row.first().cloned().unwrap_or_default();
            let rest: Vec<String> = row
                .iter()
                .enumerate()
                .skip(1)
                .map(|(i, cell)| {
                    let label = header.get(i).map(String::as_str).unwrap_or("");
                    if label.is_empty() {
                        cell.clone()
                    } else {
                        format!("{label}: {cell}")
                    }
                })
                .collect();
            if rest.is_empty() {
                format!("- {first}")
            } else {
                format!("- {first} ({})", rest.join(", "))
            }
        })
        .collect()
}

// ── whitespace ──────────────────────────────────────────────────────────────

fn collapse_whitespace(lines: &[String]) -> String {
    let mut out: Vec<&str> = Vec::with_capacity(lines.len());
    let mut blank_run = 0usize;
    for line in lines {
        if line.trim().is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
            out.push("");
        } else {
            blank_run = 0;
            out.push(line);
        }
    }
    while out.last().is_some_and(|l| l.is_empty()) {
        out.pop();
    }
    out.join("\n")
}
