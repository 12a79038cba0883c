use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::convert::{
    image_references, is_external_target, rewrite_image_targets, to_markdown_with_warnings,
};
use crate::error::{FailureKind, ItemFailure, SyncError};
use crate::filesystem::{
    CONTENT_FILENAME, MEMO_FILENAME, ensure_dir, has_content, read_text, write_atomic,
    write_text_atomic,
};
use crate::memo::{PageMemo, page_id_from_url};
use crate::names::{sanitize, split_page_name};
use crate::remote::{RemotePageSummary, RemoteWiki};
use crate::tree::PageTree;

#[derive(Debug, Clone)]
pub struct DownloadOptions {
    pub project_key: String,
    /// Page name (`Parent/Child`) or page URL limiting the run to a subtree.
    pub prefix: Option<String>,
    pub wiki_dir: PathBuf,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DownloadAction {
    Downloaded,
    Skipped,
    Collision,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct DownloadPageResult {
    pub title: String,
    /// Local folder relative to the wiki directory.
    pub path: String,
    pub action: DownloadAction,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DownloadReport {
    pub success: bool,
    pub requested_pages: usize,
    pub downloaded: usize,
    pub skipped: usize,
    pub attachments_downloaded: usize,
    pub failures: Vec<ItemFailure>,
    pub warnings: Vec<ItemFailure>,
    pub pages: Vec<DownloadPageResult>,
    pub request_count: usize,
}

/// Mirror remote pages into `options.wiki_dir`.
///
/// Pages whose `index.md` already has content are never refetched; only
/// their missing attachments are. Per-page and per-attachment failures are
/// recorded in the report and do not stop the run.
pub fn download_wiki<A: RemoteWiki>(
    api: &mut A,
    options: &DownloadOptions,
) -> Result<DownloadReport> {
    ensure_dir(&options.wiki_dir)?;

    let mut report = DownloadReport {
        success: true,
        requested_pages: 0,
        downloaded: 0,
        skipped: 0,
        attachments_downloaded: 0,
        failures: Vec::new(),
        warnings: Vec::new(),
        pages: Vec::new(),
        request_count: 0,
    };

    let prefix = resolve_prefix(api, options.prefix.as_deref())?;
    let pages: Vec<RemotePageSummary> = api
        .list_pages(&options.project_key)?
        .into_iter()
        .filter(|page| starts_with_segments(&split_page_name(&page.name), &prefix))
        .collect();
    info!(
        project = %options.project_key,
        pages = pages.len(),
        prefix = %prefix.join("/"),
        "listed remote wiki pages"
    );

    let tree = PageTree::from_remote(&pages);
    for collision in &tree.collisions {
        warn!(
            path = %collision.path,
            kept = %collision.kept,
            dropped = %collision.dropped,
            "page name collision"
        );
        report.failures.push(ItemFailure::new(
            collision.dropped.clone(),
            FailureKind::Collision,
            format!("sanitizes to {} already used by {}", collision.path, collision.kept),
        ));
        report.pages.push(DownloadPageResult {
            title: collision.dropped.clone(),
            path: collision.path.clone(),
            action: DownloadAction::Collision,
            detail: Some(format!("folder belongs to {}", collision.kept)),
        });
    }

    for (segments, node) in tree.walk() {
        let Some(summary) = node.remote.as_ref() else {
            continue;
        };
        report.requested_pages += 1;
        let mut dir = options.wiki_dir.clone();
        dir.extend(&segments);
        let relative = segments.join("/");

        match download_page(api, summary, &dir, &mut report) {
            Ok((action, detail)) => {
                match action {
                    DownloadAction::Downloaded => report.downloaded += 1,
                    DownloadAction::Skipped => report.skipped += 1,
                    DownloadAction::Collision | DownloadAction::Failed => {}
                }
                report.pages.push(DownloadPageResult {
                    title: summary.name.clone(),
                    path: relative,
                    action,
                    detail,
                });
            }
            Err(error) => {
                warn!(page = %summary.name, error = %format!("{error:#}"), "page download failed");
                let failure = ItemFailure::from_error(summary.name.clone(), &error);
                report.pages.push(DownloadPageResult {
                    title: summary.name.clone(),
                    path: relative,
                    action: DownloadAction::Failed,
                    detail: Some(failure.detail.clone()),
                });
                report.failures.push(failure);
            }
        }
    }

    report.success = report.failures.is_empty();
    report.request_count = api.request_count();
    Ok(report)
}

fn download_page<A: RemoteWiki>(
    api: &mut A,
    summary: &RemotePageSummary,
    dir: &Path,
    report: &mut DownloadReport,
) -> Result<(DownloadAction, Option<String>)> {
    let memo_path = dir.join(MEMO_FILENAME);
    let content_path = dir.join(CONTENT_FILENAME);

    if memo_path.is_file()
        && let Ok(memo) = PageMemo::load(&memo_path)
        && memo.page_id() != Some(summary.id)
    {
        report.failures.push(ItemFailure::new(
            summary.name.clone(),
            FailureKind::Collision,
            format!("{} is bound to {}", dir.display(), memo.url),
        ));
        return Ok((
            DownloadAction::Collision,
            Some(format!("folder is bound to {}", memo.name)),
        ));
    }

    if has_content(&content_path) {
        debug!(page = %summary.name, "index.md present, skipping content fetch");
        let local = read_text(&content_path)?;
        let references = image_references(&local);
        let fetched = fetch_missing_attachments(api, summary, dir, &references, report);
        return Ok((DownloadAction::Skipped, attachment_detail(fetched)));
    }

    let page = api.get_page(summary.id)?;
    let conversion = to_markdown_with_warnings(&page.content);
    for warning in &conversion.warnings {
        warn!(page = %page.name, line = warning.line, "{}", warning.message);
        let ambiguity = anyhow::Error::from(SyncError::ConversionAmbiguity {
            line: warning.line,
            message: warning.message.clone(),
        });
        report
            .warnings
            .push(ItemFailure::from_error(page.name.clone(), &ambiguity));
    }
    let references = image_references(&conversion.text);
    let markdown = rewrite_image_targets(&conversion.text, |target| {
        let target = target.trim();
        if is_external_target(target) {
            return None;
        }
        let safe = sanitize(target);
        (safe != target).then_some(safe)
    });

    ensure_dir(dir)?;
    PageMemo::new(api.page_url(summary.id), page.name.clone()).save(&memo_path)?;
    write_text_atomic(&content_path, &markdown)?;
    info!(page = %page.name, path = %dir.display(), "downloaded page");

    let fetched = fetch_missing_attachments(api, summary, dir, &references, report);
    Ok((DownloadAction::Downloaded, attachment_detail(fetched)))
}

/// Fetch every referenced attachment that is not on disk yet. Returns the
/// number written; failures go straight into the report.
fn fetch_missing_attachments<A: RemoteWiki>(
    api: &mut A,
    summary: &RemotePageSummary,
    dir: &Path,
    references: &[String],
    report: &mut DownloadReport,
) -> usize {
    let missing: Vec<&String> = references
        .iter()
        .filter(|reference| !dir.join(sanitize(reference)).exists())
        .collect();
    if missing.is_empty() {
        return 0;
    }

    let remote = match api.list_attachments(summary.id) {
        Ok(remote) => remote,
        Err(error) => {
            warn!(page = %summary.name, error = %format!("{error:#}"), "attachment listing failed");
            report
                .failures
                .push(ItemFailure::from_error(format!("{} (attachments)", summary.name), &error));
            return 0;
        }
    };

    let mut fetched = 0;
    for reference in missing {
        let local_name = sanitize(reference);
        let subject = format!("{}/{}", summary.name, reference);
        let Some(attachment) = remote
            .iter()
            .find(|item| item.name == *reference || sanitize(&item.name) == local_name)
        else {
            warn!(attachment = %subject, "referenced attachment is not on the remote page");
            report.failures.push(ItemFailure::new(
                subject,
                FailureKind::NotFound,
                "referenced attachment is not attached to the page",
            ));
            continue;
        };

        let result = api
            .get_attachment(summary.id, attachment)
            .and_then(|bytes| write_atomic(&dir.join(&local_name), &bytes));
        match result {
            Ok(()) => {
                debug!(attachment = %subject, "downloaded attachment");
                fetched += 1;
            }
            Err(error) => {
                warn!(attachment = %subject, error = %format!("{error:#}"), "attachment download failed");
                report.failures.push(ItemFailure::from_error(subject, &error));
            }
        }
    }
    report.attachments_downloaded += fetched;
    fetched
}

fn attachment_detail(fetched: usize) -> Option<String> {
    (fetched > 0).then(|| format!("{fetched} attachment(s)"))
}

/// Turn the configured prefix into page-name segments. A page URL is looked
/// up remotely so its full name can be used.
fn resolve_prefix<A: RemoteWiki>(api: &mut A, prefix: Option<&str>) -> Result<Vec<String>> {
    let Some(prefix) = prefix.map(str::trim).filter(|value| !value.is_empty()) else {
        return Ok(Vec::new());
    };
    if !prefix.contains("://") {
        return Ok(split_page_name(prefix));
    }
    let page_id = page_id_from_url(prefix).ok_or_else(|| {
        SyncError::Configuration(format!("prefix URL has no /alias/wiki/<id> part: {prefix}"))
    })?;
    let page = api.get_page(page_id)?;
    debug!(url = prefix, name = %page.name, "resolved prefix URL");
    Ok(split_page_name(&page.name))
}

fn starts_with_segments(segments: &[String], prefix: &[String]) -> bool {
    segments.len() >= prefix.len() && segments.iter().zip(prefix).all(|(left, right)| left == right)
}

/// Referenced attachments that are still not on disk for a downloaded page.
pub fn missing_attachments(dir: &Path) -> Result<Vec<String>> {
    let content_path = dir.join(CONTENT_FILENAME);
    if !content_path.is_file() {
        return Ok(Vec::new());
    }
    let content = read_text(&content_path)?;
    Ok(image_references(&content)
        .into_iter()
        .filter(|reference| !dir.join(sanitize(reference)).exists())
        .collect())
}
