use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::convert::{image_references, to_source_markup_with_warnings};
use crate::error::{ItemFailure, SyncError};
use crate::filesystem::{CONTENT_FILENAME, normalize_relative, read_text};
use crate::memo::PageMemo;
use crate::remote::{RemoteAttachment, RemoteWiki};
use crate::tree::{PageNode, PageTree};

#[derive(Debug, Clone)]
pub struct UploadOptions {
    pub wiki_dir: PathBuf,
    /// Remote page URL; when set only the node whose memo matches is pushed.
    pub target_url: Option<String>,
    pub dry_run: bool,
}

/// A remote write the run performs, or would perform under `dry_run`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum PlannedAction {
    UploadAttachment { page_id: i64, filename: String },
    UpdatePage { page_id: i64, name: String },
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UploadAction {
    Updated,
    WouldUpdate,
    Unsyncable,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadPageResult {
    pub title: String,
    pub path: String,
    pub action: UploadAction,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadReport {
    pub success: bool,
    pub dry_run: bool,
    pub requested_pages: usize,
    pub updated: usize,
    pub unsyncable: usize,
    pub attachments_uploaded: usize,
    pub attachments_present: usize,
    pub actions: Vec<PlannedAction>,
    pub failures: Vec<ItemFailure>,
    pub warnings: Vec<ItemFailure>,
    pub pages: Vec<UploadPageResult>,
    pub request_count: usize,
}

/// Push local pages back to their remote counterparts in place.
///
/// Only nodes whose memo yields a remote page id are pushed; the remote side
/// never gains new pages. Attachments are uploaded when no remote attachment
/// of the same name exists.
pub fn upload_wiki<A: RemoteWiki>(api: &mut A, options: &UploadOptions) -> Result<UploadReport> {
    let tree = PageTree::from_local(&options.wiki_dir)?;
    let mut report = UploadReport {
        success: true,
        dry_run: options.dry_run,
        requested_pages: 0,
        updated: 0,
        unsyncable: 0,
        attachments_uploaded: 0,
        attachments_present: 0,
        actions: Vec::new(),
        failures: Vec::new(),
        warnings: Vec::new(),
        pages: Vec::new(),
        request_count: 0,
    };

    let selected: Vec<(Vec<String>, &PageNode)> = match options.target_url.as_deref() {
        Some(url) => match tree.find_by_url(url) {
            Some(found) => vec![found],
            None => {
                let error = anyhow::Error::from(SyncError::NotFound(format!(
                    "no memo.md under {} points at {url}",
                    options.wiki_dir.display()
                )));
                warn!(url, "upload target not found locally");
                report.failures.push(ItemFailure::from_error(url, &error));
                report.success = false;
                report.request_count = api.request_count();
                return Ok(report);
            }
        },
        None => tree
            .walk()
            .into_iter()
            .filter(|(_, node)| {
                node.has_content_file || node.memo.is_some() || node.memo_error.is_some()
            })
            .collect(),
    };

    for (segments, node) in selected {
        report.requested_pages += 1;
        let relative = segments.join("/");
        let mut dir = options.wiki_dir.clone();
        dir.extend(&segments);
        let title = node
            .memo
            .as_ref()
            .map(|memo| memo.name.clone())
            .unwrap_or_else(|| relative.clone());

        let Some((memo, page_id)) = node
            .memo
            .as_ref()
            .and_then(|memo| memo.page_id().map(|page_id| (memo, page_id)))
        else {
            let detail = node
                .memo_error
                .clone()
                .unwrap_or_else(|| "no memo.md with a remote page URL".to_string());
            warn!(path = %relative, "{detail}");
            report.unsyncable += 1;
            report.pages.push(UploadPageResult {
                title,
                path: relative,
                action: UploadAction::Unsyncable,
                detail: Some(detail),
            });
            continue;
        };

        match upload_page(api, memo, page_id, &dir, options.dry_run, &mut report) {
            Ok(()) => {
                let action = if options.dry_run {
                    UploadAction::WouldUpdate
                } else {
                    report.updated += 1;
                    UploadAction::Updated
                };
                report.pages.push(UploadPageResult {
                    title,
                    path: relative,
                    action,
                    detail: None,
                });
            }
            Err(error) => {
                warn!(page = %title, error = %format!("{error:#}"), "page upload failed");
                let failure = ItemFailure::from_error(title.clone(), &error);
                report.pages.push(UploadPageResult {
                    title,
                    path: relative,
                    action: UploadAction::Failed,
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

fn upload_page<A: RemoteWiki>(
    api: &mut A,
    memo: &PageMemo,
    page_id: i64,
    dir: &Path,
    dry_run: bool,
    report: &mut UploadReport,
) -> Result<()> {
    let content_path = dir.join(CONTENT_FILENAME);
    if !content_path.is_file() {
        return Err(SyncError::NotFound(format!("{} is missing", content_path.display())).into());
    }
    let markdown = read_text(&content_path)?;
    let conversion = to_source_markup_with_warnings(&markdown);
    for warning in &conversion.warnings {
        warn!(page = %memo.name, line = warning.line, "{}", warning.message);
        let ambiguity = anyhow::Error::from(SyncError::ConversionAmbiguity {
            line: warning.line,
            message: warning.message.clone(),
        });
        report
            .warnings
            .push(ItemFailure::from_error(memo.name.clone(), &ambiguity));
    }

    let references = image_references(&markdown);
    if !references.is_empty() {
        let remote = api.list_attachments(page_id)?;
        for reference in &references {
            let subject = format!("{}/{}", memo.name, reference);
            let result =
                upload_attachment(api, page_id, dir, reference, &remote, dry_run, report);
            if let Err(error) = result {
                warn!(attachment = %subject, error = %format!("{error:#}"), "attachment upload failed");
                report.failures.push(ItemFailure::from_error(subject, &error));
            }
        }
    }

    report.actions.push(PlannedAction::UpdatePage {
        page_id,
        name: memo.name.clone(),
    });
    if dry_run {
        debug!(page = %memo.name, "dry run: page update suppressed");
        return Ok(());
    }
    api.update_page(page_id, &memo.name, &conversion.text)?;
    info!(page = %memo.name, page_id, "updated remote page");
    Ok(())
}

fn upload_attachment<A: RemoteWiki>(
    api: &mut A,
    page_id: i64,
    dir: &Path,
    reference: &str,
    remote: &[RemoteAttachment],
    dry_run: bool,
    report: &mut UploadReport,
) -> Result<()> {
    let relative = normalize_relative(reference).ok_or_else(|| {
        SyncError::NotFound(format!("attachment path leaves the page folder: {reference}"))
    })?;
    let local_path = dir.join(&relative);
    if !local_path.is_file() {
        return Err(SyncError::NotFound(format!(
            "referenced attachment missing locally: {}",
            local_path.display()
        ))
        .into());
    }
    let filename = relative.rsplit('/').next().unwrap_or(&relative).to_string();

    // Presence is decided by name; differing bytes under the same name are not re-uploaded.
    if remote.iter().any(|attachment| attachment.name == filename) {
        debug!(page_id, filename = %filename, "attachment already present remotely");
        report.attachments_present += 1;
        return Ok(());
    }

    report.actions.push(PlannedAction::UploadAttachment {
        page_id,
        filename: filename.clone(),
    });
    if dry_run {
        return Ok(());
    }
    let bytes =
        fs::read(&local_path).with_context(|| format!("failed to read {}", local_path.display()))?;
    api.upload_attachment(page_id, &filename, bytes)?;
    info!(page_id, filename = %filename, "uploaded attachment");
    report.attachments_uploaded += 1;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;

    use tempfile::tempdir;

    use super::{PlannedAction, UploadAction, UploadOptions, upload_wiki};
    use crate::error::FailureKind;
    use crate::memo::PageMemo;
    use crate::mock::MockWiki;

    fn write_page(wiki_dir: &Path, relative: &str, page: Option<(i64, &str)>, content: &str) {
        let dir = wiki_dir.join(relative);
        fs::create_dir_all(&dir).expect("mkdir");
        fs::write(dir.join("index.md"), content).expect("write index");
        if let Some((id, name)) = page {
            PageMemo::new(format!("https://acme.backlog.com/alias/wiki/{id}"), name)
                .save(&dir.join("memo.md"))
                .expect("write memo");
        }
    }

    fn options(wiki_dir: &Path, target_url: Option<&str>, dry_run: bool) -> UploadOptions {
        UploadOptions {
            wiki_dir: wiki_dir.to_path_buf(),
            target_url: target_url.map(ToString::to_string),
            dry_run,
        }
    }

    #[test]
    fn upload_reverse_converts_and_updates_in_place() {
        let temp = tempdir().expect("tempdir");
        let wiki_dir = temp.path().join("Wiki");
        write_page(&wiki_dir, "Home", Some((1, "Home")), "- a\n  - b\n![logo](logo.png)");
        fs::write(wiki_dir.join("Home").join("logo.png"), b"PNG").expect("write png");
        let mut api = MockWiki::default().with_page(1, "Home", "old");

        let report = upload_wiki(&mut api, &options(&wiki_dir, None, false)).expect("upload");
        assert!(report.success, "{:?}", report.failures);
        assert_eq!(report.updated, 1);
        assert_eq!(report.attachments_uploaded, 1);
        assert_eq!(
            api.updates,
            vec![(1, "Home".to_string(), "* a\n** b\n![logo][logo.png]".to_string())]
        );
        assert_eq!(api.uploads.len(), 1);
        assert_eq!(api.uploads[0].1, "logo.png");
    }

    #[test]
    fn dry_run_plans_the_same_actions_without_writing() {
        let temp = tempdir().expect("tempdir");
        let wiki_dir = temp.path().join("Wiki");
        write_page(&wiki_dir, "Home", Some((1, "Home")), "![a](a.png)");
        write_page(&wiki_dir, "Home/Child", Some((2, "Home/Child")), "child");
        fs::write(wiki_dir.join("Home").join("a.png"), b"A").expect("write");

        let mut dry_api = MockWiki::default()
            .with_page(1, "Home", "")
            .with_page(2, "Home/Child", "");
        let dry = upload_wiki(&mut dry_api, &options(&wiki_dir, None, true)).expect("dry run");
        assert!(dry_api.updates.is_empty());
        assert!(dry_api.uploads.is_empty());
        assert!(dry.pages.iter().all(|page| page.action == UploadAction::WouldUpdate));

        let mut api = MockWiki::default()
            .with_page(1, "Home", "")
            .with_page(2, "Home/Child", "");
        let real = upload_wiki(&mut api, &options(&wiki_dir, None, false)).expect("upload");
        assert_eq!(dry.actions, real.actions);
        assert_eq!(
            real.actions,
            vec![
                PlannedAction::UploadAttachment {
                    page_id: 1,
                    filename: "a.png".to_string()
                },
                PlannedAction::UpdatePage {
                    page_id: 1,
                    name: "Home".to_string()
                },
                PlannedAction::UpdatePage {
                    page_id: 2,
                    name: "Home/Child".to_string()
                },
            ]
        );
    }

    #[test]
    fn attachment_presence_is_judged_by_name_only() {
        let temp = tempdir().expect("tempdir");
        let wiki_dir = temp.path().join("Wiki");
        write_page(&wiki_dir, "Home", Some((1, "Home")), "![a](a.png)");
        fs::write(wiki_dir.join("Home").join("a.png"), b"new bytes").expect("write");
        let mut api = MockWiki::default()
            .with_page(1, "Home", "")
            .with_attachment(1, "a.png", b"old bytes");

        let report = upload_wiki(&mut api, &options(&wiki_dir, None, false)).expect("upload");
        assert!(report.success);
        assert_eq!(report.attachments_present, 1);
        assert!(api.uploads.is_empty());
    }

    #[test]
    fn nodes_without_memo_are_unsyncable() {
        let temp = tempdir().expect("tempdir");
        let wiki_dir = temp.path().join("Wiki");
        write_page(&wiki_dir, "Draft", None, "new page");
        let mut api = MockWiki::default();

        let report = upload_wiki(&mut api, &options(&wiki_dir, None, false)).expect("upload");
        assert_eq!(report.unsyncable, 1);
        assert_eq!(report.pages[0].action, UploadAction::Unsyncable);
        assert_eq!(api.request_count, 0);
    }

    #[test]
    fn target_url_selects_single_page() {
        let temp = tempdir().expect("tempdir");
        let wiki_dir = temp.path().join("Wiki");
        write_page(&wiki_dir, "Home", Some((1, "Home")), "home");
        write_page(&wiki_dir, "Home/Child", Some((2, "Home/Child")), "child");
        let mut api = MockWiki::default()
            .with_page(1, "Home", "")
            .with_page(2, "Home/Child", "");

        let report = upload_wiki(
            &mut api,
            &options(&wiki_dir, Some("https://acme.backlog.com/alias/wiki/2"), false),
        )
        .expect("upload");
        assert_eq!(report.updated, 1);
        assert_eq!(api.updates.len(), 1);
        assert_eq!(api.updates[0].0, 2);

        let missing = upload_wiki(
            &mut api,
            &options(&wiki_dir, Some("https://acme.backlog.com/alias/wiki/99"), false),
        )
        .expect("upload");
        assert!(!missing.success);
        assert_eq!(missing.failures[0].kind, FailureKind::NotFound);
    }

    #[test]
    fn missing_local_attachment_is_not_found_but_page_still_updates() {
        let temp = tempdir().expect("tempdir");
        let wiki_dir = temp.path().join("Wiki");
        write_page(&wiki_dir, "Home", Some((1, "Home")), "![gone](gone.png)");
        let mut api = MockWiki::default().with_page(1, "Home", "");

        let report = upload_wiki(&mut api, &options(&wiki_dir, None, false)).expect("upload");
        assert!(!report.success);
        assert_eq!(report.updated, 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].kind, FailureKind::NotFound);
    }

    #[test]
    fn transport_failure_is_isolated_per_page() {
        let temp = tempdir().expect("tempdir");
        let wiki_dir = temp.path().join("Wiki");
        write_page(&wiki_dir, "A", Some((1, "A")), "a");
        write_page(&wiki_dir, "B", Some((2, "B")), "b");
        let mut api = MockWiki::default().with_page(1, "A", "").with_page(2, "B", "");
        api.failing_pages.insert(1);

        let report = upload_wiki(&mut api, &options(&wiki_dir, None, false)).expect("upload");
        assert_eq!(report.updated, 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].kind, FailureKind::Transport);
        assert_eq!(report.pages[0].action, UploadAction::Failed);
    }
}
