//! Sidenotes for Markdown posts.
//!
//! ```text
//! [>id]           numbered sidenote reference
//! [>id]: content  numbered sidenote definition
//! [>_id]          unnumbered sidenote reference
//! [>_id]: content unnumbered sidenote definition
//! ```
//!
//! A definition runs from its marker line over the following lines indented
//! by two spaces or a tab past the marker. Definitions may sit inside
//! blockquotes (`> [>id]: ...`) and list items (`- [>id]: ...`); continuation
//! lines then carry the same quote markers. Definitions are removed from the
//! document and every matching reference is replaced by inline HTML.
//! References without a definition are left as they are. Fenced code blocks,
//! indented code blocks and inline code spans are never touched.

use std::collections::HashMap;

use regex::{Captures, Regex};

struct Definition {
    content: String,
    unnumbered: bool,
}

/// Compiled sidenote patterns.
pub struct Sidenotes {
    definition: Regex,
    list_item: Regex,
    reference: Regex,
    link: Regex,
    strong: Regex,
    emphasis: Regex,
}

impl Sidenotes {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            definition: Regex::new(
                r"^((?:[ \t]*>[ ]?)*[ \t]*(?:(?:[-*+]|\d{1,9}[.)])[ \t]+)?)\[>(_)?([^\]]+)\]:\s*",
            )?,
            list_item: Regex::new(r"^([ \t]*(?:[-*+]|\d{1,9}[.)])[ \t]+)\S")?,
            reference: Regex::new(r"\[>_([^\]]+)\]|\[>([^\]_][^\]]*)\]")?,
            link: Regex::new(r"\[([^\]]+)\]\(([^)\s]+)\)")?,
            strong: Regex::new(r"\*\*([^*]+)\*\*")?,
            emphasis: Regex::new(r"\*([^*\s][^*]*)\*")?,
        })
    }

    /// Rewrite `markdown`, numbering sidenotes `sidenote-1`, `sidenote-2`, ...
    pub fn transform(&self, markdown: &str) -> String {
        let (definitions, body) = self.collect(markdown);
        tracing::debug!(definitions = definitions.len(), "collected sidenote definitions");

        let mut next_id = 0usize;
        let mut out = Vec::with_capacity(body.len());

        for (line, code) in body {
            if code {
                out.push(line.to_string());
                continue;
            }

            let mut rewritten = String::with_capacity(line.len());
            for span in code_spans(line) {
                match span {
                    Span::Code { raw, .. } => rewritten.push_str(raw),
                    Span::Text(text) => {
                        let replaced = self.reference.replace_all(text, |caps: &Captures| {
                            let (key, unnumbered) = match (caps.get(1), caps.get(2)) {
                                (Some(id), _) => (format!("_{}", id.as_str()), true),
                                (None, Some(id)) => (id.as_str().to_string(), false),
                                (None, None) => return caps[0].to_string(),
                            };
                            match definitions.get(&key) {
                                Some(def) if def.unnumbered == unnumbered => {
                                    next_id += 1;
                                    let html = self.render_inline(&def.content);
                                    sidenote_html(&format!("sidenote-{}", next_id), &html, unnumbered)
                                }
                                _ => caps[0].to_string(),
                            }
                        });
                        rewritten.push_str(&replaced);
                    }
                }
            }
            out.push(rewritten);
        }

        out.join("\n")
    }

    /// Split definitions out of the document, returning the remaining lines
    /// flagged as code or prose. Later definitions of the same key replace
    /// earlier ones.
    fn collect<'a>(&self, markdown: &'a str) -> (HashMap<String, Definition>, Vec<(&'a str, bool)>) {
        let lines: Vec<&str> = markdown.split('\n').collect();
        let code = self.code_lines(&lines);
        let mut definitions = HashMap::new();
        let mut body = Vec::with_capacity(lines.len());
        let mut i = 0;

        while i < lines.len() {
            let (line, is_code) = (lines[i], code[i]);
            i += 1;
            let caps = if is_code { None } else { self.definition.captures(line) };
            let Some(caps) = caps else {
                body.push((line, is_code));
                continue;
            };
            let prefix = caps.get(1).map_or("", |m| m.as_str());
            let unnumbered = caps.get(2).is_some();
            let id = &caps[3];
            let key = if unnumbered { format!("_{}", id) } else { id.to_string() };

            // Continuations repeat the quote markers and indent past the list marker.
            let depth = prefix.matches('>').count();
            let indent = strip_quotes(prefix, depth).map_or(0, column_width);
            let mut content = line[caps[0].len()..].trim_end().to_string();
            while i < lines.len() && !code[i] {
                let Some(rest) = strip_quotes(lines[i], depth) else {
                    break;
                };
                if rest.trim().is_empty() || indent_width(rest) < indent + 2 {
                    break;
                }
                content.push('\n');
                content.push_str(rest.trim());
                i += 1;
            }

            definitions.insert(key, Definition { content, unnumbered });
        }

        (definitions, body)
    }

    /// Flag the lines of fenced and indented code blocks. Inside a list the
    /// indented-code threshold moves with the item's content column.
    fn code_lines(&self, lines: &[&str]) -> Vec<bool> {
        let mut code = Vec::with_capacity(lines.len());
        let mut fence: Option<&str> = None;
        let mut indented = false;
        let mut after_blank = true;
        let mut list_indent: Option<usize> = None;

        for &line in lines {
            if let Some(open) = fence {
                if closes_fence(line, open) {
                    fence = None;
                }
                code.push(true);
                continue;
            }
            if line.trim().is_empty() {
                code.push(indented);
                after_blank = true;
                continue;
            }

            let indent = indent_width(line);
            let base = list_indent.unwrap_or(0);
            if indent >= base + 4 && (after_blank || indented) {
                indented = true;
                after_blank = false;
                code.push(true);
                continue;
            }
            indented = false;
            if after_blank && indent < base {
                list_indent = None;
            }
            after_blank = false;

            if let Some(marker) = fence_marker(line) {
                fence = Some(marker);
                code.push(true);
                continue;
            }
            if let Some(caps) = self.list_item.captures(line) {
                list_indent = Some(column_width(&caps[1]));
            }
            code.push(false);
        }
        code
    }

    /// Inline Markdown to HTML: escaping, code spans, links, strong, emphasis.
    pub fn render_inline(&self, markdown: &str) -> String {
        let mut html = String::with_capacity(markdown.len());
        for span in code_spans(markdown) {
            match span {
                Span::Code { inner, .. } => {
                    html.push_str("<code>");
                    html.push_str(&escape_html(inner.trim()));
                    html.push_str("</code>");
                }
                Span::Text(text) => {
                    let escaped = escape_html(text);
                    let linked = self.link.replace_all(&escaped, r#"<a href="$2">$1</a>"#);
                    let strong = self.strong.replace_all(&linked, "<strong>$1</strong>");
                    let em = self.emphasis.replace_all(&strong, "<em>$1</em>");
                    html.push_str(&em);
                }
            }
        }
        html
    }
}

/// Transform `markdown` with freshly compiled patterns.
pub fn transform(markdown: &str) -> Result<String, regex::Error> {
    Ok(Sidenotes::new()?.transform(markdown))
}

fn sidenote_html(id: &str, content: &str, unnumbered: bool) -> String {
    if unnumbered {
        format!(
            r#"<span class="sidenote-unnumbered-wrapper" data-sidenote-id="{id}"><span class="sidenote-unnumbered">{content}</span></span>"#
        )
    } else {
        format!(
            r#"<span class="sidenote-wrapper" data-sidenote-id="{id}"><input type="checkbox" class="margin-toggle" id="{id}" /><label class="sidenote-number" for="{id}"></label><span class="sidenote"><span class="sidenote-number-copy text-primary dark:text-primary-dark"></span>{content}</span></span>"#
        )
    }
}

/// Strip `depth` blockquote markers, or `None` if the line has fewer.
fn strip_quotes(line: &str, depth: usize) -> Option<&str> {
    let mut rest = line;
    for _ in 0..depth {
        rest = rest.trim_start_matches([' ', '\t']).strip_prefix('>')?;
        rest = rest.strip_prefix(' ').unwrap_or(rest);
    }
    Some(rest)
}

/// Display width with tab stops every four columns.
fn column_width(text: &str) -> usize {
    text.chars()
        .fold(0, |width, c| if c == '\t' { width + 4 - width % 4 } else { width + 1 })
}

fn indent_width(line: &str) -> usize {
    column_width(&line[..line.len() - line.trim_start_matches([' ', '\t']).len()])
}

pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

// ============================================================================
// Code Detection
// ============================================================================

/// Opening fence run (```` ``` ```` or `~~~`, possibly longer) of `line`.
fn fence_marker(line: &str) -> Option<&str> {
    let indent = line.len() - line.trim_start_matches(' ').len();
    if indent > 3 {
        return None;
    }
    let rest = &line[indent..];
    let ch = rest.chars().next().filter(|c| *c == '`' || *c == '~')?;
    let run = rest.len() - rest.trim_start_matches(ch).len();
    (run >= 3).then(|| &rest[..run])
}

fn closes_fence(line: &str, open: &str) -> bool {
    match fence_marker(line) {
        Some(marker) => {
            marker.as_bytes()[0] == open.as_bytes()[0]
                && marker.len() >= open.len()
                && line.trim()[marker.len()..].trim().is_empty()
        }
        None => false,
    }
}

enum Span<'a> {
    Text(&'a str),
    Code { raw: &'a str, inner: &'a str },
}

/// Split `text` into plain text and backtick code spans. A run of N
/// backticks closes only on the next run of exactly N.
fn code_spans(text: &str) -> Vec<Span<'_>> {
    let bytes = text.as_bytes();
    let mut spans = Vec::new();
    let mut start = 0;
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] != b'`' {
            i += 1;
            continue;
        }
        let open = i;
        while i < bytes.len() && bytes[i] == b'`' {
            i += 1;
        }
        let width = i - open;

        let mut j = i;
        let mut close = None;
        while j < bytes.len() {
            if bytes[j] != b'`' {
                j += 1;
                continue;
            }
            let run = j;
            while j < bytes.len() && bytes[j] == b'`' {
                j += 1;
            }
            if j - run == width {
                close = Some(run);
                break;
            }
        }

        if let Some(close) = close {
            if open > start {
                spans.push(Span::Text(&text[start..open]));
            }
            spans.push(Span::Code {
                raw: &text[open..close + width],
                inner: &text[i..close],
            });
            start = close + width;
            i = start;
        }
    }

    if start < text.len() {
        spans.push(Span::Text(&text[start..]));
    }
    spans
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(md: &str) -> String {
        transform(md).unwrap()
    }

    #[test]
    fn test_unnumbered_definition_and_reference() {
        let out = run("[>_x]: hello\nSee [>_x] here.");
        assert_eq!(
            out,
            r#"See <span class="sidenote-unnumbered-wrapper" data-sidenote-id="sidenote-1"><span class="sidenote-unnumbered">hello</span></span> here."#
        );
    }

    #[test]
    fn test_unmatched_reference_stays_literal() {
        let out = run("[>_x]: hello\nSee [>_y] here.");
        assert_eq!(out, "See [>_y] here.");
    }

    #[test]
    fn test_numbered_markup() {
        let out = run("Text[>a] more.\n\n[>a]: A note.");
        assert!(out.starts_with(r#"Text<span class="sidenote-wrapper" data-sidenote-id="sidenote-1">"#));
        assert!(out.contains(r#"<input type="checkbox" class="margin-toggle" id="sidenote-1" />"#));
        assert!(out.contains(r#"<label class="sidenote-number" for="sidenote-1"></label>"#));
        assert!(out.contains("A note.</span></span> more."));
        assert!(!out.contains("[>a]:"));
    }

    #[test]
    fn test_ids_are_sequential() {
        let out = run("[>a]: one\n[>_b]: two\nx [>a] y [>_b] z [>a]");
        assert!(out.contains("sidenote-1"));
        assert!(out.contains("sidenote-2"));
        assert!(out.contains("sidenote-3"));
        assert!(!out.contains("sidenote-4"));
    }

    #[test]
    fn test_numbered_and_unnumbered_keys_are_distinct() {
        let out = run("[>_n]: margin\nsee [>n]");
        assert_eq!(out, "see [>n]");
    }

    #[test]
    fn test_continuation_lines() {
        let out = run("[>_x]: first\n  second\n\nBody [>_x]");
        assert!(out.contains(">first\nsecond</span>"));
        assert!(out.starts_with("\nBody "));
    }

    #[test]
    fn test_fenced_code_untouched() {
        let md = "```\n[>_x]: not a definition\nuse [>_x]\n```\n[>_x]: real\nafter [>_x]";
        let out = run(md);
        assert!(out.starts_with("```\n[>_x]: not a definition\nuse [>_x]\n```\n"));
        assert!(out.contains("after <span class=\"sidenote-unnumbered-wrapper\""));
        assert!(out.contains(">real</span>"));
    }

    #[test]
    fn test_indented_code_untouched() {
        let out = run("[>_x]: hello\n\nExample:\n\n    write [>_x] for a note\n");
        assert_eq!(out, "\nExample:\n\n    write [>_x] for a note\n");

        let out = run("[>_x]: hello\n    [>_x]: kept\n\n\tcode [>_x]\n\nprose [>_x]");
        assert!(out.contains("\n\tcode [>_x]\n"));
        assert!(out.contains("prose <span"));
        assert!(out.contains(">hello\n[&gt;_x]: kept</span>"));
    }

    #[test]
    fn test_indented_lines_inside_paragraph_are_prose() {
        let out = run("Para [>_x]\n    still prose [>_x]\n\n[>_x]: n");
        assert_eq!(out.matches("sidenote-unnumbered-wrapper").count(), 2);
    }

    #[test]
    fn test_list_paragraph_is_not_code() {
        let out = run("[>_x]: n\n- item\n\n    more [>_x]\n\n        code [>_x]\n\nafter\n\n    code [>_x]");
        assert!(out.contains("    more <span"));
        assert!(out.contains("\n        code [>_x]\n"));
        assert!(out.ends_with("\n    code [>_x]"));
    }

    #[test]
    fn test_blockquote_definition() {
        let out = run("> [>_q]: quoted note\n\nText [>_q].");
        assert!(out.starts_with("\nText <span class=\"sidenote-unnumbered-wrapper\""));
        assert!(out.contains(">quoted note</span>"));
        assert!(!out.contains("[>_q]"));
    }

    #[test]
    fn test_quoted_continuation_keeps_depth() {
        let out = run(">> [>_q]: first\n>>   second\n> not part\n\nSee [>_q]");
        assert!(out.starts_with("> not part\n\nSee <span"));
        assert!(out.contains(">first\nsecond</span>"));
    }

    #[test]
    fn test_list_item_definitions() {
        let md = "- [>a]: listed\n    and more\n* [>_b]: starred\n1. [>_c]: ordered\n\nx [>a] [>_b] [>_c]";
        let out = run(md);
        assert!(out.starts_with("\nx <span class=\"sidenote-wrapper\""));
        assert!(out.contains("listed\nand more</span>"));
        assert!(out.contains(">starred</span>"));
        assert!(out.contains(">ordered</span>"));
        assert!(!out.contains("]:"));
    }

    #[test]
    fn test_inline_code_untouched() {
        let out = run("[>_x]: note\nwrite `[>_x]` for [>_x]");
        assert!(out.starts_with("write `[>_x]` for <span"));
    }

    #[test]
    fn test_definition_content_rendered_inline() {
        let s = Sidenotes::new().unwrap();
        let html = s.render_inline("**bold** and *em* with `a<b` and [link](https://x.y) & more");
        assert_eq!(
            html,
            r#"<strong>bold</strong> and <em>em</em> with <code>a&lt;b</code> and <a href="https://x.y">link</a> &amp; more"#
        );
    }

    #[test]
    fn test_plain_document_unchanged() {
        let md = "# Title\n\nA paragraph with [a link](/x) and [>] oddity.\n";
        assert_eq!(run(md), md);
    }

    #[test]
    fn test_code_spans_split() {
        let spans = code_spans("a ``b ` c`` d `e");
        let kinds: Vec<&str> = spans
            .iter()
            .map(|s| match s {
                Span::Text(t) => *t,
                Span::Code { raw, .. } => *raw,
            })
            .collect();
        assert_eq!(kinds, vec!["a ", "``b ` c``", " d `e"]);
    }

    #[test]
    fn test_widths() {
        assert_eq!(indent_width("  \tx"), 4);
        assert_eq!(indent_width("x  "), 0);
        assert_eq!(column_width("1. "), 3);
        assert_eq!(strip_quotes("> > text", 2), Some("text"));
        assert_eq!(strip_quotes("> text", 2), None);
    }

    #[test]
    fn test_fence_markers() {
        assert_eq!(fence_marker("```rust"), Some("```"));
        assert_eq!(fence_marker("  ~~~~"), Some("~~~~"));
        assert_eq!(fence_marker("    ```"), None);
        assert_eq!(fence_marker("``"), None);
        assert!(closes_fence("````", "```"));
        assert!(!closes_fence("~~~", "```"));
    }
}
