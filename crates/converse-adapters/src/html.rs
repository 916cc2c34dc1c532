//! HTML-to-text helpers shared by the search and scrape tools.

/// Strip HTML tags and decode the common entities.
///
/// Tags are replaced by nothing, so `<b>a</b>b` becomes `ab`; callers that
/// need word separation use [`page_text`].
pub fn strip_tags(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut inside_tag = false;
    for ch in input.chars() {
        match ch {
            '<' => inside_tag = true,
            '>' => inside_tag = false,
            _ if !inside_tag => out.push(ch),
            _ => {}
        }
    }
    decode_entities(&out)
}

fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&#x27;", "'")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// Readable text of a whole page. Script, style, nav and noscript blocks are
/// dropped, then html2text renders the rest; plain tag stripping is the
/// fallback.
pub fn page_text(html: &str) -> String {
    let mut cleaned = html.to_owned();
    for tag in ["script", "style", "nav", "noscript"] {
        cleaned = remove_blocks(&cleaned, tag);
    }

    if let Ok(text) = html2text::from_read(cleaned.as_bytes(), 120) {
        let text = collapse_whitespace(&text);
        if !text.is_empty() {
            return text;
        }
    }

    // Tags become spaces so adjacent block elements do not run together.
    let spaced = cleaned.replace('<', " <");
    collapse_whitespace(&strip_tags(&spaced))
}

/// Remove every `<tag ...>...</tag>` block, case-insensitively.
fn remove_blocks(html: &str, tag: &str) -> String {
    let open = format!("<{tag}");
    let close = format!("</{tag}>");
    let lower = html.to_ascii_lowercase();
    let mut out = String::with_capacity(html.len());
    let mut cursor = 0;

    while cursor < html.len() {
        let Some(start) = lower[cursor..].find(&open).map(|s| cursor + s) else {
            out.push_str(&html[cursor..]);
            break;
        };
        out.push_str(&html[cursor..start]);
        cursor = match lower[start..].find(&close) {
            Some(end) => start + end + close.len(),
            None => html.len(),
        };
    }
    out
}

/// Collapse runs of spaces to one and allow at most one blank line.
pub fn collapse_whitespace(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut newlines = 0u32;
    let mut space = false;

    for ch in text.chars() {
        if ch == '\n' {
            newlines += 1;
            space = false;
            if newlines <= 2 {
                // Trailing spaces before a newline are noise.
                while out.ends_with(' ') {
                    out.pop();
                }
                out.push('\n');
            }
        } else if ch.is_whitespace() {
            if !space && newlines == 0 {
                out.push(' ');
            }
            space = true;
        } else {
            newlines = 0;
            space = false;
            out.push(ch);
        }
    }
    out.trim().to_owned()
}

/// Cut `text` to at most `max_chars` characters, preferring a paragraph or
/// sentence boundary in the second half of the window.
///
/// Returns the text and whether it was cut.
pub fn truncate_readable(text: &str, max_chars: usize) -> (String, bool) {
    let Some((cut, _)) = text.char_indices().nth(max_chars) else {
        return (text.to_owned(), false);
    };
    let window = &text[..cut];
    let boundary = window
        .rfind("\n\n")
        .or_else(|| window.rfind(". ").map(|i| i + 1))
        .filter(|&i| i >= cut / 2)
        .unwrap_or(cut);
    let mut out = window[..boundary].trim_end().to_owned();
    out.push_str("\n\n[... truncated]");
    (out, true)
}
