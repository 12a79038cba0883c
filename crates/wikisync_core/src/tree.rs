//! In-memory page hierarchy, rebuilt on every run from either the remote page
//! list or the local `Wiki/` directory.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use anyhow::{Context, Result};
use walkdir::WalkDir;

use crate::error::SyncError;
use crate::filesystem::{CONTENT_FILENAME, MEMO_FILENAME, attachment_files};
use crate::memo::{PageMemo, page_id_from_url};
use crate::names::{display_name, sanitize, split_page_name};
use crate::remote::RemotePageSummary;

#[derive(Debug, Clone, Default)]
pub struct PageNode {
    /// Sanitized folder name; empty for the root.
    pub segment: String,
    pub children: BTreeMap<String, PageNode>,
    /// Remote record this node was built from (remote trees only).
    pub remote: Option<RemotePageSummary>,
    /// Parsed `memo.md` (local trees only).
    pub memo: Option<PageMemo>,
    /// Set when `memo.md` exists but could not be parsed.
    pub memo_error: Option<String>,
    /// Whether an `index.md` exists in the folder (local trees only).
    pub has_content_file: bool,
    pub attachments: BTreeSet<String>,
}

impl PageNode {
    fn named(segment: &str) -> Self {
        Self {
            segment: segment.to_string(),
            ..Self::default()
        }
    }

    /// Children in display order: numeric prefix first (`01_…`, `2_…`),
    /// then lexicographic on the sanitized segment.
    pub fn ordered_children(&self) -> Vec<&PageNode> {
        let mut children: Vec<&PageNode> = self.children.values().collect();
        children.sort_by(|left, right| compare_segments(&left.segment, &right.segment));
        children
    }

    pub fn is_synced(&self) -> bool {
        self.memo.is_some()
    }

    /// Human title: the last segment of the original page name when known.
    pub fn display_title(&self) -> String {
        if let Some(memo) = &self.memo {
            return memo.title().to_string();
        }
        if let Some(remote) = &self.remote
            && let Some(last) = split_page_name(&remote.name).last()
        {
            return last.clone();
        }
        display_name(&self.segment)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeCollision {
    /// Sanitized relative folder path shared by both pages.
    pub path: String,
    pub kept: String,
    pub dropped: String,
}

#[derive(Debug, Clone, Default)]
pub struct PageTree {
    pub root: PageNode,
    pub collisions: Vec<TreeCollision>,
}

impl PageTree {
    /// Build the hierarchy implied by slash-delimited remote page names.
    /// Intermediate folders with no page of their own become virtual nodes.
    pub fn from_remote(pages: &[RemotePageSummary]) -> Self {
        let mut tree = Self::default();
        for page in pages {
            let segments = split_page_name(&page.name);
            if segments.is_empty() {
                continue;
            }
            let sanitized: Vec<String> = segments.iter().map(|segment| sanitize(segment)).collect();
            let node = tree.node_mut(&sanitized);
            let collision = match node.remote.as_ref() {
                Some(existing) => Some(TreeCollision {
                    path: sanitized.join("/"),
                    kept: existing.name.clone(),
                    dropped: page.name.clone(),
                }),
                None => {
                    node.remote = Some(page.clone());
                    None
                }
            };
            tree.collisions.extend(collision);
        }
        tree
    }

    /// Walk a local wiki directory. A node exists for every folder holding a
    /// `memo.md` or `index.md`, plus the folders above it.
    pub fn from_local(wiki_dir: &Path) -> Result<Self> {
        if !wiki_dir.is_dir() {
            return Err(SyncError::Configuration(format!(
                "wiki directory not found: {}",
                wiki_dir.display()
            ))
            .into());
        }

        let mut tree = Self::default();
        let walker = WalkDir::new(wiki_dir)
            .min_depth(1)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| {
                entry.depth() == 0 || !entry.file_name().to_string_lossy().starts_with('.')
            });
        for entry in walker {
            let entry = entry.with_context(|| format!("failed to walk {}", wiki_dir.display()))?;
            if !entry.file_type().is_dir() {
                continue;
            }
            let dir = entry.path();
            let memo_path = dir.join(MEMO_FILENAME);
            let content_path = dir.join(CONTENT_FILENAME);
            if !memo_path.is_file() && !content_path.is_file() {
                continue;
            }

            let relative = dir.strip_prefix(wiki_dir).with_context(|| {
                format!("failed to relativize {} against {}", dir.display(), wiki_dir.display())
            })?;
            let segments: Vec<String> = relative
                .components()
                .map(|component| component.as_os_str().to_string_lossy().into_owned())
                .collect();
            let attachments = attachment_files(dir)?;

            let node = tree.node_mut(&segments);
            node.has_content_file = content_path.is_file();
            node.attachments = attachments.into_iter().collect();
            if memo_path.is_file() {
                match PageMemo::load(&memo_path) {
                    Ok(memo) => node.memo = Some(memo),
                    Err(error) => node.memo_error = Some(format!("{error:#}")),
                }
            }
        }
        Ok(tree)
    }

    pub fn get(&self, segments: &[String]) -> Option<&PageNode> {
        let mut current = &self.root;
        for segment in segments {
            current = current.children.get(segment)?;
        }
        Some(current)
    }

    /// Depth-first, pre-order traversal in display order. The root is not
    /// yielded.
    pub fn walk(&self) -> Vec<(Vec<String>, &PageNode)> {
        let mut output = Vec::new();
        let mut prefix = Vec::new();
        walk_into(&self.root, &mut prefix, &mut output);
        output
    }

    pub fn find_by_page_id(&self, page_id: i64) -> Option<(Vec<String>, &PageNode)> {
        self.walk().into_iter().find(|(_, node)| {
            node.memo.as_ref().and_then(PageMemo::page_id) == Some(page_id)
                || node.remote.as_ref().map(|remote| remote.id) == Some(page_id)
        })
    }

    /// Resolve a remote page URL to the local node whose memo points at it.
    pub fn find_by_url(&self, url: &str) -> Option<(Vec<String>, &PageNode)> {
        if let Some(page_id) = page_id_from_url(url) {
            return self.find_by_page_id(page_id);
        }
        let wanted = url.trim().trim_end_matches('/');
        self.walk().into_iter().find(|(_, node)| {
            node.memo
                .as_ref()
                .is_some_and(|memo| memo.url.trim_end_matches('/') == wanted)
        })
    }

    pub fn len(&self) -> usize {
        self.walk().len()
    }

    pub fn is_empty(&self) -> bool {
        self.root.children.is_empty()
    }

    fn node_mut(&mut self, segments: &[String]) -> &mut PageNode {
        let mut current = &mut self.root;
        for segment in segments {
            current = current
                .children
                .entry(segment.clone())
                .or_insert_with(|| PageNode::named(segment));
        }
        current
    }
}

fn walk_into<'a>(
    node: &'a PageNode,
    prefix: &mut Vec<String>,
    output: &mut Vec<(Vec<String>, &'a PageNode)>,
) {
    for child in node.ordered_children() {
        prefix.push(child.segment.clone());
        output.push((prefix.clone(), child));
        walk_into(child, prefix, output);
        prefix.pop();
    }
}

fn compare_segments(left: &str, right: &str) -> Ordering {
    match (numeric_prefix(left), numeric_prefix(right)) {
        (Some(a), Some(b)) => a.cmp(&b).then_with(|| left.cmp(right)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => left.cmp(right),
    }
}

fn numeric_prefix(segment: &str) -> Option<u64> {
    let digits: String = segment.chars().take_while(char::is_ascii_digit).collect();
    if digits.is_empty() {
        return None;
    }
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;

    use tempfile::tempdir;

    use super::PageTree;
    use crate::memo::PageMemo;
    use crate::remote::RemotePageSummary;

    fn summary(id: i64, name: &str) -> RemotePageSummary {
        RemotePageSummary {
            id,
            name: name.to_string(),
        }
    }

    fn write_page(root: &Path, rel: &str, memo: Option<(&str, &str)>, content: &str) {
        let dir = root.join(rel);
        fs::create_dir_all(&dir).expect("mkdir");
        fs::write(dir.join("index.md"), content).expect("write index");
        if let Some((url, name)) = memo {
            PageMemo::new(url, name).save(&dir.join("memo.md")).expect("write memo");
        }
    }

    #[test]
    fn slash_names_nest_one_node_per_segment() {
        let tree = PageTree::from_remote(&[summary(3, "Dev/Design/01 Overview")]);

        let dev = tree.root.children.get("Dev").expect("Dev");
        assert!(dev.remote.is_none(), "intermediate node is virtual");
        let design = dev.children.get("Design").expect("Design");
        assert!(design.remote.is_none());
        let leaf = design.children.get("01_Overview").expect("leaf");
        assert_eq!(leaf.remote.as_ref().map(|page| page.name.as_str()), Some("Dev/Design/01 Overview"));
        assert_eq!(leaf.display_title(), "01 Overview");
        assert_eq!(tree.len(), 3);
    }

    #[test]
    fn sanitized_collisions_are_recorded_not_overwritten() {
        let tree = PageTree::from_remote(&[summary(1, "A B"), summary(2, "A_B")]);
        let node = tree.root.children.get("A_B").expect("node");
        assert_eq!(node.remote.as_ref().map(|page| page.id), Some(1));
        assert_eq!(tree.collisions.len(), 1);
        assert_eq!(tree.collisions[0].dropped, "A_B");
    }

    #[test]
    fn local_tree_round_trips_original_name_through_memo() {
        let temp = tempdir().expect("tempdir");
        let wiki = temp.path().join("Wiki");
        write_page(
            &wiki,
            "Dev/Design/01_Overview",
            Some(("https://acme.backlog.com/alias/wiki/3", "Dev/Design/01 Overview")),
            "- a",
        );

        let tree = PageTree::from_local(&wiki).expect("tree");
        let segments: Vec<String> = ["Dev", "Design", "01_Overview"].iter().map(|s| s.to_string()).collect();
        let leaf = tree.get(&segments).expect("leaf");
        assert_eq!(
            leaf.memo.as_ref().map(|memo| memo.name.as_str()),
            Some("Dev/Design/01 Overview")
        );
        assert!(leaf.has_content_file);
        assert!(!tree.get(&segments[..1]).expect("Dev").has_content_file);
    }

    #[test]
    fn local_walk_order_is_numeric_then_lexicographic() {
        let temp = tempdir().expect("tempdir");
        let wiki = temp.path().join("Wiki");
        for rel in ["Zeta", "10_Ten", "2_Two", "alpha", "Home/b", "Home/a"] {
            write_page(&wiki, rel, None, "x");
        }
        fs::create_dir_all(wiki.join("EmptyFolder")).expect("mkdir");
        fs::create_dir_all(wiki.join(".git").join("Hidden")).expect("mkdir");
        fs::write(wiki.join(".git").join("Hidden").join("index.md"), "x").expect("write");

        let tree = PageTree::from_local(&wiki).expect("tree");
        let order: Vec<String> = tree
            .walk()
            .into_iter()
            .map(|(segments, _)| segments.join("/"))
            .collect();
        assert_eq!(
            order,
            vec!["2_Two", "10_Ten", "Home", "Home/a", "Home/b", "Zeta", "alpha"]
        );
    }

    #[test]
    fn find_by_url_matches_page_id() {
        let temp = tempdir().expect("tempdir");
        let wiki = temp.path().join("Wiki");
        write_page(&wiki, "Home", Some(("https://acme.backlog.com/alias/wiki/10", "Home")), "x");
        write_page(
            &wiki,
            "Home/Child",
            Some(("https://acme.backlog.com/alias/wiki/11", "Home/Child")),
            "y",
        );

        let tree = PageTree::from_local(&wiki).expect("tree");
        let (segments, _) = tree
            .find_by_url("https://acme.backlog.com/alias/wiki/11")
            .expect("found");
        assert_eq!(segments, vec!["Home", "Child"]);
        assert!(tree.find_by_url("https://acme.backlog.com/alias/wiki/99").is_none());
    }

    #[test]
    fn broken_memo_is_kept_as_error() {
        let temp = tempdir().expect("tempdir");
        let wiki = temp.path().join("Wiki");
        write_page(&wiki, "Home", None, "x");
        fs::write(wiki.join("Home").join("memo.md"), "only-one-line").expect("write");

        let tree = PageTree::from_local(&wiki).expect("tree");
        let home = tree.get(&["Home".to_string()]).expect("home");
        assert!(home.memo.is_none());
        assert!(home.memo_error.is_some());
    }

    #[test]
    fn missing_wiki_dir_is_configuration_error() {
        let error = PageTree::from_local(Path::new("/nonexistent/Wiki")).expect_err("must fail");
        assert_eq!(
            crate::error::FailureKind::classify(&error),
            crate::error::FailureKind::Configuration
        );
    }
}
