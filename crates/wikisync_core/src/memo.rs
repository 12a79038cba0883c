use std::path::Path;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use regex::Regex;

use crate::error::SyncError;
use crate::filesystem::{read_text, write_text_atomic};

/// Side-channel record stored as `memo.md` next to each synced `index.md`.
///
/// Line 1 is the page's remote URL, line 2 its original unsanitized name.
/// This is the only way back from a sanitized folder to the remote page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageMemo {
    pub url: String,
    pub name: String,
}

impl PageMemo {
    pub fn new(url: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            name: name.into(),
        }
    }

    pub fn parse(content: &str) -> Result<Self> {
        let mut lines = content.lines().map(str::trim);
        let url = lines.next().unwrap_or("");
        let name = lines.next().unwrap_or("");
        if url.is_empty() || name.is_empty() {
            return Err(SyncError::NotFound(
                "memo needs a URL line and a page name line".to_string(),
            )
            .into());
        }
        Ok(Self::new(url, name))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = read_text(path)?;
        Self::parse(&content).with_context(|| format!("invalid memo {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        write_text_atomic(path, &self.render())
    }

    pub fn render(&self) -> String {
        format!("{}\n{}\n", self.url, self.name)
    }

    /// Remote page id encoded in the memo URL, if any.
    pub fn page_id(&self) -> Option<i64> {
        page_id_from_url(&self.url)
    }

    /// Last segment of the original page name, used as the display title.
    pub fn title(&self) -> &str {
        self.name
            .rsplit('/')
            .map(str::trim)
            .find(|segment| !segment.is_empty())
            .unwrap_or(&self.name)
    }
}

/// Extract the page id from a `…/alias/wiki/<id>` URL.
pub fn page_id_from_url(url: &str) -> Option<i64> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern =
        PATTERN.get_or_init(|| Regex::new(r"/alias/wiki/(\d+)").expect("valid wiki url pattern"));
    pattern
        .captures(url)
        .and_then(|caps| caps[1].parse::<i64>().ok())
}

pub fn page_url(space_url: &str, page_id: i64) -> String {
    format!("{}/alias/wiki/{page_id}", space_url.trim_end_matches('/'))
}
