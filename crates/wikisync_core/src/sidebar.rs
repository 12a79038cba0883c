use serde::Serialize;

/// One page (or content-less branch) in the generated `_Sidebar.md`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SidebarEntry {
    pub display_title: String,
    /// Flat file the entry links to; `None` for folders without an `index.md`.
    pub target_filename: Option<String>,
    /// 1-based nesting depth in the original tree.
    pub depth: usize,
    pub children: Vec<SidebarEntry>,
}

impl SidebarEntry {
    /// Wiki page name the entry links to: the target filename without `.md`.
    pub fn link_name(&self) -> Option<&str> {
        self.target_filename
            .as_deref()
            .map(|name| name.strip_suffix(".md").unwrap_or(name))
    }
}

/// Percent-encode a wiki page name for use as a relative link. Only RFC 3986
/// unreserved characters are kept as-is.
pub fn encode_page_link(name: &str) -> String {
    let mut output = String::with_capacity(name.len());
    for byte in name.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'.' | b'_' | b'~') {
            output.push(char::from(byte));
        } else {
            output.push_str(&format!("%{byte:02X}"));
        }
    }
    output
}

/// Render nested disclosure blocks. Branches at depth `<= expand_level` start
/// expanded.
pub fn render_sidebar(entries: &[SidebarEntry], expand_level: usize) -> String {
    let mut lines = Vec::new();
    render_entries(entries, expand_level, &mut lines);
    let mut output = lines.join("\n");
    output.push('\n');
    output
}

fn render_entries(entries: &[SidebarEntry], expand_level: usize, lines: &mut Vec<String>) {
    for entry in entries {
        let indent = "  ".repeat(entry.depth.saturating_sub(1));
        let label = match entry.link_name() {
            Some(link) => format!(
                "<a href=\"{}\">{}</a>",
                escape_html(&encode_page_link(link)),
                escape_html(&entry.display_title)
            ),
            None => escape_html(&entry.display_title),
        };

        if entry.children.is_empty() {
            lines.push(format!("{indent}<li>{label}</li>"));
            continue;
        }

        let open = if entry.depth <= expand_level {
            "<details open>"
        } else {
            "<details>"
        };
        lines.push(format!("{indent}{open}"));
        lines.push(format!("{indent}<summary>{label}</summary>"));
        lines.push(format!("{indent}<ul>"));
        render_entries(&entry.children, expand_level, lines);
        lines.push(format!("{indent}</ul>"));
        lines.push(format!("{indent}</details>"));
    }
}

fn escape_html(value: &str) -> String {
    let mut output = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => output.push_str("&amp;"),
            '<' => output.push_str("&lt;"),
            '>' => output.push_str("&gt;"),
            '"' => output.push_str("&quot;"),
            other => output.push(other),
        }
    }
    output
}
