//! In-memory `RemoteWiki` used by the engine unit tests.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;

use crate::error::SyncError;
use crate::memo::page_url;
use crate::remote::{RemoteAttachment, RemotePage, RemotePageSummary, RemoteWiki};

pub(crate) const SPACE_URL: &str = "https://acme.backlog.com";

#[derive(Debug, Default)]
pub(crate) struct MockWiki {
    pub pages: BTreeMap<i64, RemotePage>,
    pub attachments: BTreeMap<i64, Vec<(RemoteAttachment, Vec<u8>)>>,
    pub failing_pages: BTreeSet<i64>,
    pub failing_attachments: BTreeSet<String>,
    pub fetched_pages: Vec<i64>,
    pub fetched_attachments: Vec<String>,
    pub updates: Vec<(i64, String, String)>,
    pub uploads: Vec<(i64, String, Vec<u8>)>,
    pub request_count: usize,
    next_attachment_id: i64,
}

impl MockWiki {
    pub fn with_page(mut self, id: i64, name: &str, content: &str) -> Self {
        self.pages.insert(
            id,
            RemotePage {
                id,
                name: name.to_string(),
                content: content.to_string(),
            },
        );
        self
    }

    pub fn with_attachment(mut self, page_id: i64, name: &str, bytes: &[u8]) -> Self {
        self.next_attachment_id += 1;
        let attachment = RemoteAttachment {
            id: self.next_attachment_id,
            name: name.to_string(),
        };
        self.attachments
            .entry(page_id)
            .or_default()
            .push((attachment, bytes.to_vec()));
        self
    }

    fn page(&self, page_id: i64) -> Result<&RemotePage> {
        if self.failing_pages.contains(&page_id) {
            return Err(SyncError::Transport(format!("wiki {page_id}: HTTP 500")).into());
        }
        self.pages
            .get(&page_id)
            .ok_or_else(|| SyncError::NotFound(format!("wiki {page_id}")).into())
    }
}

impl RemoteWiki for MockWiki {
    fn list_pages(&mut self, _project_key: &str) -> Result<Vec<RemotePageSummary>> {
        self.request_count += 1;
        Ok(self
            .pages
            .values()
            .map(|page| RemotePageSummary {
                id: page.id,
                name: page.name.clone(),
            })
            .collect())
    }

    fn get_page(&mut self, page_id: i64) -> Result<RemotePage> {
        self.request_count += 1;
        self.fetched_pages.push(page_id);
        self.page(page_id).cloned()
    }

    fn list_attachments(&mut self, page_id: i64) -> Result<Vec<RemoteAttachment>> {
        self.request_count += 1;
        self.page(page_id)?;
        Ok(self
            .attachments
            .get(&page_id)
            .map(|items| items.iter().map(|(item, _)| item.clone()).collect())
            .unwrap_or_default())
    }

    fn get_attachment(&mut self, page_id: i64, attachment: &RemoteAttachment) -> Result<Vec<u8>> {
        self.request_count += 1;
        if self.failing_attachments.contains(&attachment.name) {
            return Err(SyncError::Transport(format!("{}: connection reset", attachment.name)).into());
        }
        self.fetched_attachments.push(attachment.name.clone());
        self.attachments
            .get(&page_id)
            .and_then(|items| items.iter().find(|(item, _)| item.id == attachment.id))
            .map(|(_, bytes)| bytes.clone())
            .ok_or_else(|| SyncError::NotFound(attachment.name.clone()).into())
    }

    fn update_page(&mut self, page_id: i64, name: &str, content: &str) -> Result<()> {
        self.request_count += 1;
        self.page(page_id)?;
        self.updates
            .push((page_id, name.to_string(), content.to_string()));
        if let Some(page) = self.pages.get_mut(&page_id) {
            page.content = content.to_string();
        }
        Ok(())
    }

    fn upload_attachment(&mut self, page_id: i64, filename: &str, bytes: Vec<u8>) -> Result<()> {
        self.request_count += 1;
        self.page(page_id)?;
        self.uploads.push((page_id, filename.to_string(), bytes.clone()));
        self.next_attachment_id += 1;
        let attachment = RemoteAttachment {
            id: self.next_attachment_id,
            name: filename.to_string(),
        };
        self.attachments
            .entry(page_id)
            .or_default()
            .push((attachment, bytes));
        Ok(())
    }

    fn page_url(&self, page_id: i64) -> String {
        page_url(SPACE_URL, page_id)
    }

    fn request_count(&self) -> usize {
        self.request_count
    }
}
