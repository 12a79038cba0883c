//! Rebuild the nested `Wiki/` tree as a flat GitHub-wiki checkout: one
//! `seg1<sep>seg2.md` per page, hashed attachment names and `_Sidebar.md`.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use regex::{Captures, Regex};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{DEFAULT_EXPAND_LEVEL, DEFAULT_SEPARATOR};
use crate::convert::{FenceTracker, is_external_target};
use crate::error::{ItemFailure, SyncError};
use crate::filesystem::{
    CONTENT_FILENAME, compute_hash, display_path, normalize_relative, read_text, write_atomic,
    write_text_atomic,
};
use crate::sidebar::{SidebarEntry, encode_page_link, render_sidebar};
use crate::tree::{PageNode, PageTree};

pub const SIDEBAR_FILENAME: &str = "_Sidebar.md";

/// Page names the target wiki gives special meaning to.
const RESERVED_PAGE_NAMES: [&str; 3] = ["_Sidebar", "_Footer", "_Header"];
const KEPT_ON_CLEAN: [&str; 2] = ["_Footer.md", "_Header.md"];
const IMAGE_EXTENSIONS: [&str; 8] = ["png", "jpg", "jpeg", "gif", "webp", "svg", "bmp", "ico"];
const ATTACHMENT_HASH_LEN: usize = 12;

#[derive(Debug, Clone)]
pub struct FlattenOptions {
    pub separator: String,
    pub expand_level: usize,
    /// Remove previously generated pages and attachments first.
    pub clean: bool,
}

impl Default for FlattenOptions {
    fn default() -> Self {
        Self {
            separator: DEFAULT_SEPARATOR.to_string(),
            expand_level: DEFAULT_EXPAND_LEVEL,
            clean: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PageMapping {
    /// Folder relative to the wiki directory.
    pub source: String,
    pub target_filename: String,
    /// True when a ` (n)` suffix had to be added.
    pub disambiguated: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct AttachmentMapping {
    pub source: String,
    pub original_name: String,
    pub target_filename: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct FlattenReport {
    pub success: bool,
    pub pages_written: usize,
    pub attachments_copied: usize,
    pub removed_files: usize,
    pub pages: Vec<PageMapping>,
    pub attachments: Vec<AttachmentMapping>,
    pub failures: Vec<ItemFailure>,
    pub sidebar_path: String,
}

pub fn flatten_wiki(
    wiki_dir: &Path,
    output_dir: &Path,
    options: &FlattenOptions,
) -> Result<FlattenReport> {
    validate_separator(&options.separator)?;
    if !output_dir.is_dir() {
        return Err(SyncError::Configuration(format!(
            "output directory does not exist: {} (clone the wiki repository first)",
            output_dir.display()
        ))
        .into());
    }
    let tree = PageTree::from_local(wiki_dir)?;

    let sidebar_path = output_dir.join(SIDEBAR_FILENAME);
    let mut report = FlattenReport {
        success: true,
        pages_written: 0,
        attachments_copied: 0,
        removed_files: 0,
        pages: Vec::new(),
        attachments: Vec::new(),
        failures: Vec::new(),
        sidebar_path: display_path(&sidebar_path),
    };
    if options.clean {
        report.removed_files = clean_output(output_dir)?;
        info!(removed = report.removed_files, "cleaned output directory");
    }

    report.pages = plan_pages(&tree, &options.separator);
    let page_targets: BTreeMap<String, String> = report
        .pages
        .iter()
        .map(|mapping| (mapping.source.clone(), mapping.target_filename.clone()))
        .collect();
    report.attachments = plan_attachments(&tree);
    let attachment_targets: BTreeMap<String, String> = report
        .attachments
        .iter()
        .map(|mapping| (mapping.source.clone(), mapping.target_filename.clone()))
        .collect();

    for (segments, node) in tree.walk() {
        let relative = segments.join("/");
        let mut dir = wiki_dir.to_path_buf();
        dir.extend(&segments);

        for name in &node.attachments {
            let source = format!("{relative}/{name}");
            let Some(target) = attachment_targets.get(&source) else {
                continue;
            };
            let result = fs::read(dir.join(name))
                .with_context(|| format!("failed to read {}", dir.join(name).display()))
                .and_then(|bytes| write_atomic(&output_dir.join(target), &bytes));
            match result {
                Ok(()) => report.attachments_copied += 1,
                Err(error) => {
                    warn!(attachment = %source, error = %format!("{error:#}"), "attachment copy failed");
                    report.failures.push(ItemFailure::from_error(source, &error));
                }
            }
        }

        let Some(target) = page_targets.get(&relative) else {
            continue;
        };
        let result = read_text(&dir.join(CONTENT_FILENAME)).and_then(|content| {
            let page = render_page(
                &content,
                &node.display_title(),
                &relative,
                &page_targets,
                &attachment_targets,
            );
            write_text_atomic(&output_dir.join(target), &page)
        });
        match result {
            Ok(()) => {
                debug!(source = %relative, target = %target, "wrote flat page");
                report.pages_written += 1;
            }
            Err(error) => {
                warn!(page = %relative, error = %format!("{error:#}"), "page flatten failed");
                report.failures.push(ItemFailure::from_error(relative, &error));
            }
        }
    }

    let mut prefix = Vec::new();
    let entries = sidebar_entries(&tree.root, &mut prefix, &page_targets);
    write_text_atomic(&sidebar_path, &render_sidebar(&entries, options.expand_level))?;
    info!(
        pages = report.pages_written,
        attachments = report.attachments_copied,
        output = %output_dir.display(),
        "flattened wiki"
    );

    report.success = report.failures.is_empty();
    Ok(report)
}

/// Flat file name for an attachment stored at `<relative_dir>/<original_name>`.
pub fn flat_attachment_name(relative_dir: &str, original_name: &str) -> String {
    let hash = compute_hash(&format!("{relative_dir}/{original_name}"), ATTACHMENT_HASH_LEN);
    let extension: String = Path::new(original_name)
        .extension()
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default()
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .collect();
    let kind = if IMAGE_EXTENSIONS.contains(&extension.as_str()) {
        "img"
    } else {
        "file"
    };
    if extension.is_empty() {
        format!("{kind}_{hash}")
    } else {
        format!("{kind}_{hash}.{extension}")
    }
}

fn validate_separator(separator: &str) -> Result<()> {
    if separator.contains('/') || separator.contains('\\') {
        return Err(SyncError::Configuration(format!(
            "separator {separator:?} must not contain path separators"
        ))
        .into());
    }
    Ok(())
}

/// Assign every page with content a unique flat file name, in traversal
/// order. Names compare case-insensitively.
fn plan_pages(tree: &PageTree, separator: &str) -> Vec<PageMapping> {
    let mut used: HashSet<String> = RESERVED_PAGE_NAMES
        .iter()
        .map(|name| name.to_lowercase())
        .collect();
    let mut mappings = Vec::new();
    for (segments, node) in tree.walk() {
        if !node.has_content_file {
            continue;
        }
        let base = segments.join(separator);
        let mut candidate = base.clone();
        let mut counter = 2;
        while used.contains(&candidate.to_lowercase()) {
            candidate = format!("{base} ({counter})");
            counter += 1;
        }
        used.insert(candidate.to_lowercase());
        mappings.push(PageMapping {
            source: segments.join("/"),
            disambiguated: candidate != base,
            target_filename: format!("{candidate}.md"),
        });
    }
    mappings
}

fn plan_attachments(tree: &PageTree) -> Vec<AttachmentMapping> {
    let mut mappings = Vec::new();
    for (segments, node) in tree.walk() {
        let relative = segments.join("/");
        for name in &node.attachments {
            mappings.push(AttachmentMapping {
                source: format!("{relative}/{name}"),
                original_name: name.clone(),
                target_filename: flat_attachment_name(&relative, name),
            });
        }
    }
    mappings
}

fn render_page(
    content: &str,
    title: &str,
    relative_dir: &str,
    pages: &BTreeMap<String, String>,
    attachments: &BTreeMap<String, String>,
) -> String {
    let body = strip_title_heading(content, title);
    rewrite_references(&body, relative_dir, pages, attachments)
}

/// Drop a leading ATX heading equal to `title` and the blank lines after it.
fn strip_title_heading(content: &str, title: &str) -> String {
    let lines: Vec<&str> = content.split('\n').collect();
    let Some(first) = lines.iter().position(|line| !line.trim().is_empty()) else {
        return content.to_string();
    };
    if heading_text(lines[first]) != Some(title.trim()) {
        return content.to_string();
    }
    let rest = lines[first + 1..]
        .iter()
        .skip_while(|line| line.trim().is_empty())
        .copied()
        .collect::<Vec<_>>();
    rest.join("\n")
}

fn heading_text(line: &str) -> Option<&str> {
    let trimmed = line.trim_start();
    let level = trimmed.chars().take_while(|ch| *ch == '#').count();
    if level == 0 || level > 6 {
        return None;
    }
    let rest = &trimmed[level..];
    if !rest.is_empty() && !rest.starts_with([' ', '\t']) {
        return None;
    }
    Some(rest.trim().trim_end_matches('#').trim_end())
}

fn reference_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(!?)\[([^\]\[]*)\]\(([^()]+)\)").expect("valid reference pattern")
    })
}

/// Point relative image and page links at their flat names. Unknown and
/// external targets are left alone.
fn rewrite_references(
    content: &str,
    relative_dir: &str,
    pages: &BTreeMap<String, String>,
    attachments: &BTreeMap<String, String>,
) -> String {
    let mut fences = FenceTracker::default();
    let mut lines = Vec::new();
    for line in content.split('\n') {
        if fences.observe(line) {
            lines.push(line.to_string());
            continue;
        }
        let replaced = reference_pattern().replace_all(line, |caps: &Captures| {
            match flat_target(&caps[3], relative_dir, pages, attachments) {
                Some(target) => format!("{}[{}]({})", &caps[1], &caps[2], target),
                None => caps[0].to_string(),
            }
        });
        lines.push(replaced.into_owned());
    }
    lines.join("\n")
}

fn flat_target(
    target: &str,
    relative_dir: &str,
    pages: &BTreeMap<String, String>,
    attachments: &BTreeMap<String, String>,
) -> Option<String> {
    let target = target.trim();
    let target = target
        .strip_prefix('<')
        .and_then(|inner| inner.strip_suffix('>'))
        .unwrap_or(target);
    if is_external_target(target) {
        return None;
    }
    let (path, fragment) = match target.split_once('#') {
        Some((path, fragment)) => (path, Some(fragment)),
        None => (target, None),
    };
    let resolved = normalize_relative(&format!("{relative_dir}/{path}"))?;
    if let Some(flat) = attachments.get(&resolved) {
        return Some(flat.clone());
    }

    let page_key = resolved
        .strip_suffix(&format!("/{CONTENT_FILENAME}"))
        .or_else(|| resolved.strip_suffix(".md"))
        .unwrap_or(&resolved);
    let flat = pages.get(page_key)?;
    let mut link = encode_page_link(flat.strip_suffix(".md").unwrap_or(flat));
    if let Some(fragment) = fragment {
        link.push('#');
        link.push_str(fragment);
    }
    Some(link)
}

fn sidebar_entries(
    node: &PageNode,
    prefix: &mut Vec<String>,
    pages: &BTreeMap<String, String>,
) -> Vec<SidebarEntry> {
    let mut entries = Vec::new();
    for child in node.ordered_children() {
        prefix.push(child.segment.clone());
        let children = sidebar_entries(child, prefix, pages);
        let target_filename = pages.get(&prefix.join("/")).cloned();
        if target_filename.is_some() || !children.is_empty() {
            entries.push(SidebarEntry {
                display_title: child.display_title(),
                target_filename,
                depth: prefix.len(),
                children,
            });
        }
        prefix.pop();
    }
    entries
}

/// Delete generated pages and attachments from a previous run. Dot-files
/// (the wiki's `.git`) and the footer/header pages survive.
fn clean_output(output_dir: &Path) -> Result<usize> {
    let mut removed = 0;
    let entries = fs::read_dir(output_dir)
        .with_context(|| format!("failed to list {}", output_dir.display()))?;
    for entry in entries {
        let entry = entry.with_context(|| format!("failed to list {}", output_dir.display()))?;
        if !entry.file_type().is_ok_and(|kind| kind.is_file()) {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') || KEPT_ON_CLEAN.contains(&name.as_str()) {
            continue;
        }
        if name.ends_with(".md") || name.starts_with("img_") || name.starts_with("file_") {
            fs::remove_file(entry.path())
                .with_context(|| format!("failed to remove {}", entry.path().display()))?;
            removed += 1;
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;

    use tempfile::tempdir;

    use super::{FlattenOptions, flat_attachment_name, flatten_wiki, strip_title_heading};
    use crate::error::FailureKind;
    use crate::memo::PageMemo;

    fn write_page(wiki_dir: &Path, relative: &str, content: &str) {
        let dir = wiki_dir.join(relative);
        fs::create_dir_all(&dir).expect("mkdir");
        fs::write(dir.join("index.md"), content).expect("write");
    }

    fn options(separator: &str) -> FlattenOptions {
        FlattenOptions {
            separator: separator.to_string(),
            ..FlattenOptions::default()
        }
    }

    #[test]
    fn separator_collision_is_disambiguated() {
        let temp = tempdir().expect("tempdir");
        let wiki_dir = temp.path().join("Wiki");
        let output = temp.path().join("out");
        fs::create_dir_all(&output).expect("mkdir");
        write_page(&wiki_dir, "A/B", "nested");
        write_page(&wiki_dir, "A_B", "flat");

        let report = flatten_wiki(&wiki_dir, &output, &options("_")).expect("flatten");
        assert_eq!(report.pages_written, 2);
        assert_eq!(
            fs::read_to_string(output.join("A_B.md")).expect("read"),
            "nested"
        );
        assert_eq!(
            fs::read_to_string(output.join("A_B (2).md")).expect("read"),
            "flat"
        );
        assert!(report.pages[1].disambiguated);
    }

    #[test]
    fn reserved_and_case_insensitive_names_are_disambiguated() {
        let temp = tempdir().expect("tempdir");
        let wiki_dir = temp.path().join("Wiki");
        let output = temp.path().join("out");
        fs::create_dir_all(&output).expect("mkdir");
        write_page(&wiki_dir, "_sidebar", "not the sidebar");
        write_page(&wiki_dir, "Notes", "upper");
        write_page(&wiki_dir, "notes", "lower");

        let report = flatten_wiki(&wiki_dir, &output, &options(" › ")).expect("flatten");
        let targets: Vec<&str> = report
            .pages
            .iter()
            .map(|page| page.target_filename.as_str())
            .collect();
        assert_eq!(targets, vec!["Notes.md", "_sidebar (2).md", "notes (2).md"]);
    }

    #[test]
    fn links_and_images_point_at_flat_names() {
        let temp = tempdir().expect("tempdir");
        let wiki_dir = temp.path().join("Wiki");
        let output = temp.path().join("out");
        fs::create_dir_all(&output).expect("mkdir");
        write_page(
            &wiki_dir,
            "Home",
            "![logo](logo.png) [child](Child/index.md#usage) [site](https://x.test/a.md)\n```\n![logo](logo.png)\n```",
        );
        fs::write(wiki_dir.join("Home").join("logo.png"), b"PNG").expect("write");
        write_page(&wiki_dir, "Home/Child", "[up](../index.md) [spec](spec.pdf)");
        fs::write(wiki_dir.join("Home").join("Child").join("spec.pdf"), b"PDF").expect("write");

        let report = flatten_wiki(&wiki_dir, &output, &options(" › ")).expect("flatten");
        assert!(report.success, "{:?}", report.failures);
        assert_eq!(report.attachments_copied, 2);

        let logo = flat_attachment_name("Home", "logo.png");
        let pdf = flat_attachment_name("Home/Child", "spec.pdf");
        assert!(logo.starts_with("img_") && logo.ends_with(".png"));
        assert!(pdf.starts_with("file_") && pdf.ends_with(".pdf"));
        assert_eq!(fs::read(output.join(&logo)).expect("read"), b"PNG");

        assert_eq!(
            fs::read_to_string(output.join("Home.md")).expect("read"),
            format!(
                "![logo]({logo}) [child](Home%20%E2%80%BA%20Child#usage) [site](https://x.test/a.md)\n```\n![logo](logo.png)\n```"
            )
        );
        assert_eq!(
            fs::read_to_string(output.join("Home › Child.md")).expect("read"),
            format!("[up](Home) [spec]({pdf})")
        );
    }

    #[test]
    fn targets_with_spaces_and_angle_brackets_resolve() {
        let temp = tempdir().expect("tempdir");
        let wiki_dir = temp.path().join("Wiki");
        let output = temp.path().join("out");
        fs::create_dir_all(&output).expect("mkdir");
        write_page(
            &wiki_dir,
            "Home",
            "![shot](my shot.png) [child](<Child/index.md>)",
        );
        fs::write(wiki_dir.join("Home").join("my shot.png"), b"PNG").expect("write");
        write_page(&wiki_dir, "Home/Child", "child");

        let report = flatten_wiki(&wiki_dir, &output, &options(" › ")).expect("flatten");
        assert!(report.success, "{:?}", report.failures);

        let shot = flat_attachment_name("Home", "my shot.png");
        assert!(output.join(&shot).is_file());
        assert_eq!(
            fs::read_to_string(output.join("Home.md")).expect("read"),
            format!("![shot]({shot}) [child](Home%20%E2%80%BA%20Child)")
        );
    }

    #[test]
    fn duplicate_title_heading_is_removed() {
        assert_eq!(strip_title_heading("# Overview\n\n\nBody", "Overview"), "Body");
        assert_eq!(strip_title_heading("\n## Overview ##\ntext", "Overview"), "text");
        assert_eq!(
            strip_title_heading("# Something else\nBody", "Overview"),
            "# Something else\nBody"
        );

        let temp = tempdir().expect("tempdir");
        let wiki_dir = temp.path().join("Wiki");
        let output = temp.path().join("out");
        fs::create_dir_all(&output).expect("mkdir");
        write_page(&wiki_dir, "01_Intro_Page", "# Intro Page (v2)\n\nHello");
        PageMemo::new("https://acme.backlog.com/alias/wiki/3", "01 Intro Page (v2)")
            .save(&wiki_dir.join("01_Intro_Page").join("memo.md"))
            .expect("memo");
        write_page(&wiki_dir, "Other", "# Other\nkept?");

        flatten_wiki(&wiki_dir, &output, &options("_")).expect("flatten");
        assert_eq!(
            fs::read_to_string(output.join("01_Intro_Page.md")).expect("read"),
            "# Intro Page (v2)\n\nHello"
        );
        assert_eq!(fs::read_to_string(output.join("Other.md")).expect("read"), "kept?");
    }

    #[test]
    fn clean_removes_generated_files_only() {
        let temp = tempdir().expect("tempdir");
        let wiki_dir = temp.path().join("Wiki");
        let output = temp.path().join("out");
        fs::create_dir_all(output.join(".git")).expect("mkdir");
        for name in ["Old.md", "img_0123456789ab.png", "_Footer.md", ".gitignore", "notes.txt"] {
            fs::write(output.join(name), "x").expect("write");
        }
        write_page(&wiki_dir, "Home", "home");

        let report = flatten_wiki(
            &wiki_dir,
            &output,
            &FlattenOptions {
                clean: true,
                ..FlattenOptions::default()
            },
        )
        .expect("flatten");
        assert_eq!(report.removed_files, 2);
        assert!(!output.join("Old.md").exists());
        assert!(!output.join("img_0123456789ab.png").exists());
        assert!(output.join("_Footer.md").exists());
        assert!(output.join(".gitignore").exists());
        assert!(output.join("notes.txt").exists());
        assert!(output.join("Home.md").exists());
    }

    #[test]
    fn bad_separator_and_missing_output_are_configuration_errors() {
        let temp = tempdir().expect("tempdir");
        let wiki_dir = temp.path().join("Wiki");
        write_page(&wiki_dir, "Home", "home");
        fs::create_dir_all(temp.path().join("out")).expect("mkdir");

        let error = flatten_wiki(&wiki_dir, &temp.path().join("out"), &options("/"))
            .expect_err("must fail");
        assert_eq!(FailureKind::classify(&error), FailureKind::Configuration);

        let error = flatten_wiki(&wiki_dir, &temp.path().join("missing"), &options("_"))
            .expect_err("must fail");
        assert_eq!(FailureKind::classify(&error), FailureKind::Configuration);
    }

    #[test]
    fn attachment_names_are_stable_and_path_dependent() {
        assert_eq!(
            flat_attachment_name("Home", "a.PNG"),
            flat_attachment_name("Home", "a.PNG")
        );
        assert_ne!(
            flat_attachment_name("Home", "a.png"),
            flat_attachment_name("Other", "a.png")
        );
        assert!(flat_attachment_name("Home", "README").starts_with("file_"));
        assert!(!flat_attachment_name("Home", "README").contains('.'));
        assert!(flat_attachment_name("Home", "a.PNG").ends_with(".png"));
    }
}
