use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use gdrive_core::{DriveChange, DriveClient};
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;

use super::change::RepoTag;
use super::checksum;
use super::manifest::{parse_modified, CloudEntry, Manifest, ITEM_FIELDS};
use super::processor::ChangeProcessor;

const CHANGE_FIELDS: &str = "nextPageToken,newStartPageToken,changes(fileId,removed,file(id,name,mimeType,parents,size,md5Checksum,modifiedTime,trashed,shortcutDetails))";

const POLL_INTERVAL: Duration = Duration::from_secs(5);
const TRANSPORT_RETRY: Duration = Duration::from_secs(10);

/// Outcome of one drained batch of the change feed. Idle is judged from
/// the final page alone, not the batch total.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct FeedBatch {
    changes: usize,
    last_page_changes: usize,
}

/// Long-polls the incremental change feed from the persisted cursor and
/// feeds canonical changes to the processor.
///
/// The cursor is only advanced by tokens the feed itself returned, and the
/// manifest (cursor included) is persisted after every drained batch: the
/// feed is at-least-once from the cursor forward, so correctness across
/// disconnects rests on that ordering.
pub struct CloudObserver {
    client: DriveClient,
    manifest: Arc<Mutex<Manifest>>,
    processor: Arc<ChangeProcessor>,
    manifest_path: PathBuf,
    idle_tx: watch::Sender<bool>,
    stop: CancellationToken,
}

impl CloudObserver {
    pub fn new(
        client: DriveClient,
        manifest: Arc<Mutex<Manifest>>,
        processor: Arc<ChangeProcessor>,
        manifest_path: PathBuf,
        stop: CancellationToken,
    ) -> (Self, watch::Receiver<bool>) {
        let (idle_tx, idle_rx) = watch::channel(false);
        (
            Self {
                client,
                manifest,
                processor,
                manifest_path,
                idle_tx,
                stop,
            },
            idle_rx,
        )
    }

    pub async fn run(&self) {
        loop {
            let batch = self.drain_feed().await;
            if batch.changes > 0 {
                eprintln!(
                    "[{}] change feed batch: {} change(s)",
                    RepoTag::GoogleDrive,
                    batch.changes
                );
            }

            {
                let mut manifest = self.manifest.lock().await;
                if manifest.is_dirty()
                    && let Err(err) = manifest.save_file(&self.manifest_path)
                {
                    eprintln!("[{}] failed to save manifest: {err}", RepoTag::GoogleDrive);
                }
            }

            // Idle when the last page had zero changes, even if earlier
            // pages of the same catch-up batch were full.
            let _ = self.idle_tx.send(batch.last_page_changes == 0);

            tokio::select! {
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
                _ = self.stop.cancelled() => return,
            }
        }
    }

    /// Pages through the feed until a new-start token (or a token-less
    /// page) ends the batch. Transport failures wait 10 s and retry the
    /// same cursor.
    async fn drain_feed(&self) -> FeedBatch {
        let mut batch = FeedBatch::default();
        loop {
            if self.stop.is_cancelled() {
                return batch;
            }

            let cursor = self.manifest.lock().await.cursor().to_string();
            let page = match self.client.list_changes(&cursor, CHANGE_FIELDS, true).await {
                Ok(page) => page,
                Err(err) => {
                    eprintln!(
                        "[{}] change feed request failed: {err}",
                        RepoTag::GoogleDrive
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(TRANSPORT_RETRY) => continue,
                        _ = self.stop.cancelled() => return batch,
                    }
                }
            };

            batch.changes += page.changes.len();
            batch.last_page_changes = page.changes.len();
            let mut manifest = self.manifest.lock().await;
            for entry in &page.changes {
                self.register(&mut manifest, entry).await;
            }

            if let Some(token) = page.next_page_token {
                manifest.set_cursor(token);
            } else if let Some(token) = page.new_start_page_token {
                manifest.set_cursor(token);
                return batch;
            } else {
                // A page without either token cannot advance the cursor;
                // retrying it inside this loop would spin on the same
                // cursor, so the batch ends here and the next poll cycle
                // retries from the unchanged cursor.
                eprintln!(
                    "[{}] change page carried neither continuation token",
                    RepoTag::GoogleDrive
                );
                return batch;
            }
        }
    }

    async fn register(&self, manifest: &mut Manifest, entry: &DriveChange) {
        let trashed = entry.file.as_ref().is_some_and(|file| file.trashed);
        if entry.removed || trashed {
            if let Some(id) = &entry.file_id
                && let Some(info) = manifest.register_removal(id)
            {
                eprintln!("[{}] {info}", RepoTag::GoogleDrive);
                self.processor.queue_change(info);
            }
            return;
        }

        let Some(file) = &entry.file else {
            return;
        };
        let Some(parent_id) = file.parents.first().cloned() else {
            return;
        };

        let cloud_entry = if file.is_folder() {
            CloudEntry {
                id: file.id.clone(),
                name: file.name.clone(),
                parent_id,
                is_folder: true,
                size: -1,
                modified: parse_modified(file.modified_time.as_deref()),
                checksum: checksum::UNKNOWN_CHECKSUM.to_string(),
            }
        } else if let Some(details) = &file.shortcut_details {
            if details.targets_folder() {
                CloudEntry {
                    id: details.target_id.clone(),
                    name: file.name.clone(),
                    parent_id,
                    is_folder: true,
                    size: -1,
                    modified: parse_modified(file.modified_time.as_deref()),
                    checksum: checksum::UNKNOWN_CHECKSUM.to_string(),
                }
            } else {
                // Shortcut to a file: the visible entry carries the
                // target's content fingerprint.
                let target = match self.client.get_file(&details.target_id, ITEM_FIELDS).await {
                    Ok(target) => target,
                    Err(err) => {
                        eprintln!(
                            "[{}] cannot resolve shortcut target {}: {err}",
                            RepoTag::GoogleDrive,
                            details.target_id
                        );
                        return;
                    }
                };
                CloudEntry {
                    id: file.id.clone(),
                    name: file.name.clone(),
                    parent_id,
                    is_folder: false,
                    size: target.size_bytes().unwrap_or(-1),
                    modified: parse_modified(target.modified_time.as_deref()),
                    checksum: target
                        .md5_checksum
                        .clone()
                        .unwrap_or_else(|| checksum::UNKNOWN_CHECKSUM.to_string()),
                }
            }
        } else {
            CloudEntry {
                id: file.id.clone(),
                name: file.name.clone(),
                parent_id,
                is_folder: false,
                size: file.size_bytes().unwrap_or(-1),
                modified: parse_modified(file.modified_time.as_deref()),
                checksum: file
                    .md5_checksum
                    .clone()
                    .unwrap_or_else(|| checksum::UNKNOWN_CHECKSUM.to_string()),
            }
        };

        if let Some(info) = manifest.register_change(&cloud_entry) {
            eprintln!("[{}] {info}", RepoTag::GoogleDrive);
            self.processor.queue_change(info);
        }
    }
}
