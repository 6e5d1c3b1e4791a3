//! Content store for message attachments.
//!
//! Files live under one directory as `{message_id}-{filename}`; metadata rows
//! point at them and are deleted with the parent message. A filename repeated
//! within one message gets its position added: `{message_id}-{n}-{filename}`.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{debug, warn};

use crate::config::AttachmentConfig;
use crate::mail::OutboundAttachment;
use crate::pipeline::types::{AttachmentRecord, ParsedAttachment};
use crate::store::Database;

#[derive(Debug, Clone)]
pub struct AttachmentStore {
    dir: PathBuf,
    max_size: usize,
}

impl AttachmentStore {
    pub fn new(config: &AttachmentConfig) -> Self {
        Self {
            dir: config.dir.clone(),
            max_size: config.max_size,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write each attachment to disk and record it.
    ///
    /// Oversized or unwritable attachments are skipped with a warning; they
    /// never fail the message.
    pub async fn save_all(
        &self,
        db: &dyn Database,
        message_id: &str,
        attachments: &[ParsedAttachment],
    ) -> Vec<AttachmentRecord> {
        if attachments.is_empty() {
            return Vec::new();
        }
        if let Err(e) = tokio::fs::create_dir_all(&self.dir).await {
            warn!(dir = %self.dir.display(), "Cannot create attachments directory: {e}");
            return Vec::new();
        }

        let mut saved = Vec::new();
        let mut used = HashSet::new();
        for (index, attachment) in attachments.iter().enumerate() {
            if attachment.data.len() > self.max_size {
                warn!(
                    message_id = message_id,
                    filename = %attachment.filename,
                    size = attachment.data.len(),
                    max = self.max_size,
                    "Skipping oversized attachment"
                );
                continue;
            }

            let filename = sanitize_filename(&attachment.filename, index);
            let disk_name = if used.insert(filename.clone()) {
                format!("{message_id}-{filename}")
            } else {
                format!("{message_id}-{}-{filename}", index + 1)
            };
            let path = self.dir.join(disk_name);
            if let Err(e) = tokio::fs::write(&path, &attachment.data).await {
                warn!(path = %path.display(), "Failed to write attachment: {e}");
                continue;
            }

            let record = AttachmentRecord {
                id: uuid::Uuid::new_v4().to_string(),
                message_id: message_id.to_string(),
                filename,
                content_type: attachment.content_type.clone(),
                size: attachment.data.len() as u64,
                path: path.to_string_lossy().into_owned(),
                created_at: Utc::now(),
            };
            match db.insert_attachment(&record).await {
                Ok(()) => {
                    debug!(message_id = message_id, filename = %record.filename, "Attachment saved");
                    saved.push(record);
                }
                Err(e) => warn!(message_id = message_id, "Failed to record attachment: {e}"),
            }
        }
        saved
    }

    /// Read stored attachments back for re-sending. Missing files are skipped.
    pub async fn load(&self, records: &[AttachmentRecord]) -> Vec<OutboundAttachment> {
        let mut loaded = Vec::with_capacity(records.len());
        for record in records {
            match tokio::fs::read(&record.path).await {
                Ok(data) => loaded.push(OutboundAttachment {
                    filename: record.filename.clone(),
                    content_type: record.content_type.clone(),
                    data,
                }),
                Err(e) => warn!(path = %record.path, "Attachment unreadable, not forwarded: {e}"),
            }
        }
        loaded
    }
}

/// Keep a filename safe to join onto the store directory.
pub fn sanitize_filename(name: &str, index: usize) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '.' | '-' | '_' | ' ') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim().trim_start_matches('.').to_string();
    if cleaned.is_empty() {
        format!("attachment-{}", index + 1)
    } else {
        cleaned
    }
}
