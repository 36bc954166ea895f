use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use rand::Rng;
use time::macros::format_description;
use time::OffsetDateTime;
use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;

use super::change::{self, ChangeInfo, ChangeKind};
use super::checksum;
use super::error::SyncError;
use super::repository::Repositories;

/// Horizon of the recent-changes window used for echo suppression, and of
/// the per-repository self-change ledgers.
pub const ECHO_WINDOW: Duration = Duration::from_secs(60);

pub const CHANGES_FILE: &str = "changes";
pub const CRASH_FILE_PREFIX: &str = "change_processor_thread_crash";

const RESTART_DELAY: Duration = Duration::from_secs(30);
const RETRY_BASE_MS: u64 = 250;
const RETRY_MAX_MS: u64 = 10_000;

struct RecentChange {
    info: ChangeInfo,
    at: Instant,
}

struct ProcessorState {
    queue: VecDeque<ChangeInfo>,
    recent: Vec<RecentChange>,
    busy: bool,
}

/// Single consumer of the shared change queue. Applies each change to
/// every non-originating repository, serially and durably.
pub struct ChangeProcessor {
    state: StdMutex<ProcessorState>,
    notify: Notify,
    idle_tx: watch::Sender<bool>,
    idle_rx: watch::Receiver<bool>,
    queue_path: PathBuf,
    stop: CancellationToken,
}

impl ChangeProcessor {
    /// Reloads any queue persisted by a previous run; a corrupt queue file
    /// starts empty and the next reconciliation closes the gap.
    pub fn new(work_dir: &Path, stop: CancellationToken) -> Self {
        let queue_path = work_dir.join(CHANGES_FILE);
        let queue = match std::fs::read_to_string(&queue_path) {
            Ok(content) => match change::decode_queue(&content) {
                Ok(changes) => VecDeque::from(changes),
                Err(err) => {
                    eprintln!("[gdrivesyncd] persisted queue is corrupt, starting empty: {err}");
                    VecDeque::new()
                }
            },
            Err(_) => VecDeque::new(),
        };

        let (idle_tx, idle_rx) = watch::channel(queue.is_empty());
        Self {
            state: StdMutex::new(ProcessorState {
                queue,
                recent: Vec::new(),
                busy: false,
            }),
            notify: Notify::new(),
            idle_tx,
            idle_rx,
            queue_path,
            stop,
        }
    }

    pub fn queue_len(&self) -> usize {
        self.state.lock().expect("processor mutex poisoned").queue.len()
    }

    /// Producer entry point. MovedAndModified is split into its
    /// Created/Removed pair; anything equal to a recently processed change
    /// inside the echo window is discarded.
    pub fn queue_change(&self, change: ChangeInfo) {
        if change.kind == ChangeKind::MovedAndModified {
            let old_path = change.old_path.clone().unwrap_or_default();
            let old_checksum = change
                .old_checksum
                .clone()
                .unwrap_or_else(|| checksum::UNKNOWN_CHECKSUM.to_string());
            self.queue_change(ChangeInfo::new(
                change.source,
                ChangeKind::Created,
                change.path,
                change.checksum,
                change.is_folder,
            ));
            self.queue_change(ChangeInfo::new(
                change.source,
                ChangeKind::Removed,
                old_path,
                old_checksum,
                change.is_folder,
            ));
            return;
        }

        let mut state = self.state.lock().expect("processor mutex poisoned");
        prune_recent(&mut state.recent);
        if state.recent.iter().any(|recent| recent.info == change) {
            eprintln!("[{}] suppressed echo: {change}", change.source);
            return;
        }

        state.queue.push_back(change);
        self.persist_locked(&state);
        let _ = self.idle_tx.send(false);
        self.notify.notify_one();
    }

    /// Blocks until the queue is drained and no change is being applied.
    pub async fn await_idle(&self) {
        let mut rx = self.idle_rx.clone();
        let _ = rx.wait_for(|idle| *idle).await;
    }

    /// The consumer loop. Returns `Ok` on stop; a fatal error propagates
    /// so the supervisor can write the crash file and restart.
    pub async fn run(&self, repositories: &Repositories) -> Result<(), SyncError> {
        loop {
            let mut head: Option<ChangeInfo> = None;
            while head.is_none() {
                {
                    let mut state = self.state.lock().expect("processor mutex poisoned");
                    state.busy = false;
                    self.persist_locked(&state);
                    if let Some(change) = state.queue.pop_front() {
                        state.busy = true;
                        let _ = self.idle_tx.send(false);
                        // An out-of-order Created/Removed pair must not
                        // cancel each other forever; clear earlier ghosts
                        // of the complementary kind first.
                        if let Some(complement) = complement_of(change.kind) {
                            state.recent.retain(|recent| {
                                !(recent.info.path == change.path
                                    && recent.info.kind == complement)
                            });
                        }
                        prune_recent(&mut state.recent);
                        state.recent.push(RecentChange {
                            info: change.clone(),
                            at: Instant::now(),
                        });
                        head = Some(change);
                        continue;
                    }
                    let _ = self.idle_tx.send(true);
                    if self.stop.is_cancelled() {
                        return Ok(());
                    }
                }
                tokio::select! {
                    _ = self.notify.notified() => {}
                    _ = self.stop.cancelled() => {}
                }
            }

            let change = head.expect("head populated above");
            self.apply(repositories, &change).await?;
        }
    }

    /// Wraps [`ChangeProcessor::run`]: a fatal failure writes the crash
    /// file and the task restarts after 30 s unless stop was requested.
    pub async fn run_supervised(&self, repositories: &Repositories, work_dir: &Path) {
        loop {
            match self.run(repositories).await {
                Ok(()) => return,
                Err(err) => {
                    eprintln!("[gdrivesyncd] change processor crashed: {err}");
                    write_crash_file(work_dir, &err);
                    if self.stop.is_cancelled() {
                        return;
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(RESTART_DELAY) => {}
                        _ = self.stop.cancelled() => return,
                    }
                }
            }
        }
    }

    async fn apply(&self, repositories: &Repositories, change: &ChangeInfo) -> Result<(), SyncError> {
        for destination in repositories.all() {
            if destination.tag() == change.source {
                continue;
            }
            let mut attempt = 0u32;
            loop {
                match self.apply_to(repositories, destination.tag(), change).await {
                    Ok(()) => break,
                    Err(err) if err.is_fatal() => return Err(err),
                    Err(err) if err.is_transient() && !self.stop.is_cancelled() => {
                        attempt = attempt.saturating_add(1);
                        eprintln!(
                            "[{}] transient failure applying {change}, retrying: {err}",
                            destination.tag()
                        );
                        tokio::select! {
                            _ = tokio::time::sleep(retry_delay(attempt)) => {}
                            _ = self.stop.cancelled() => break,
                        }
                    }
                    Err(err) => {
                        // Dropped; the next reconciliation re-raises any
                        // divergence this leaves behind.
                        eprintln!("[{}] failed to apply {change}: {err}", destination.tag());
                        break;
                    }
                }
            }

            let manifest = destination.manifest().lock().await;
            if let Err(violation) = manifest.check_consistency() {
                return Err(SyncError::Invariant(violation));
            }
        }
        Ok(())
    }

    async fn apply_to(
        &self,
        repositories: &Repositories,
        destination: super::change::RepoTag,
        change: &ChangeInfo,
    ) -> Result<(), SyncError> {
        let destination = repositories.by_tag(destination);
        let old_path = || {
            change
                .old_path
                .as_deref()
                .ok_or_else(|| SyncError::Invariant(format!("{} without old path", change.kind)))
        };

        match (change.is_folder, change.kind) {
            (false, ChangeKind::Created | ChangeKind::Modified) => {
                let source = repositories.by_tag(change.source);
                let content = match source.get_content(&change.path).await {
                    Ok(content) => content,
                    Err(SyncError::NotFound(path)) => {
                        eprintln!(
                            "[{}] source content vanished before transfer: {path}",
                            change.source
                        );
                        return Ok(());
                    }
                    Err(err) => return Err(err),
                };
                destination
                    .create_or_update_file(&change.path, &content, &change.checksum)
                    .await
            }
            (false, ChangeKind::Moved | ChangeKind::Renamed) => {
                destination.move_file(old_path()?, &change.path).await
            }
            (false, ChangeKind::Removed) => destination.remove_file(&change.path).await,
            (true, ChangeKind::Created) => destination.create_folder(&change.path).await,
            (true, ChangeKind::Moved | ChangeKind::Renamed) => {
                destination.move_folder(old_path()?, &change.path).await
            }
            (true, ChangeKind::Removed) => destination.remove_folder(&change.path).await,
            (true, ChangeKind::Modified) => Ok(()),
            (_, ChangeKind::MovedAndModified) => Err(SyncError::Invariant(
                "MovedAndModified must be split before the queue".to_string(),
            )),
        }
    }

    fn persist_locked(&self, state: &ProcessorState) {
        match change::encode_queue(state.queue.iter()) {
            Ok(content) => {
                if let Err(err) = std::fs::write(&self.queue_path, content) {
                    eprintln!("[gdrivesyncd] failed to persist change queue: {err}");
                }
            }
            Err(err) => eprintln!("[gdrivesyncd] failed to encode change queue: {err}"),
        }
    }
}

fn complement_of(kind: ChangeKind) -> Option<ChangeKind> {
    match kind {
        ChangeKind::Created => Some(ChangeKind::Removed),
        ChangeKind::Removed => Some(ChangeKind::Created),
        _ => None,
    }
}

fn prune_recent(recent: &mut Vec<RecentChange>) {
    let now = Instant::now();
    recent.retain(|entry| now.duration_since(entry.at) < ECHO_WINDOW);
}

fn retry_delay(attempt: u32) -> Duration {
    let shift = attempt.min(16);
    let exp = RETRY_BASE_MS
        .saturating_mul(1u64 << shift)
        .min(RETRY_MAX_MS);
    Duration::from_millis(rand::thread_rng().gen_range(0..=exp))
}

fn write_crash_file(work_dir: &Path, err: &SyncError) {
    let stamp_format = format_description!("[year][month][day]T[hour][minute][second]Z");
    let stamp = OffsetDateTime::now_utc()
        .format(&stamp_format)
        .unwrap_or_else(|_| "unknown".to_string());
    let path = work_dir.join(format!("{CRASH_FILE_PREFIX}.{stamp}"));
    if let Err(write_err) = std::fs::write(&path, format!("{err}\n")) {
        eprintln!("[gdrivesyncd] failed to write crash file: {write_err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::change::RepoTag;
    use crate::sync::manifest::{FileRecord, Manifest};
    use crate::sync::repository::{
        CloudRepository, LocalRepository, SelfChangeLedger, SyncRepository,
    };
    use gdrive_core::DriveClient;
    use std::sync::Arc;
    use tokio::sync::Mutex;
    use wiremock::matchers::{method, path as url_path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn created(path: &str, checksum: &str) -> ChangeInfo {
        ChangeInfo::new(RepoTag::GoogleDrive, ChangeKind::Created, path, checksum, false)
    }

    fn make_processor(dir: &Path) -> ChangeProcessor {
        ChangeProcessor::new(dir, CancellationToken::new())
    }

    fn make_repositories(server_uri: &str, local_root: &Path) -> Repositories {
        let client = DriveClient::with_base_url(server_uri, "test-token").unwrap();
        let cloud_manifest = Arc::new(Mutex::new({
            let mut manifest = Manifest::new(RepoTag::GoogleDrive);
            manifest.insert_folder("root-id", "");
            manifest
        }));
        let local_manifest = Arc::new(Mutex::new(Manifest::new(RepoTag::LocalDrive)));
        Repositories {
            cloud: SyncRepository::Cloud(CloudRepository::new(
                client,
                cloud_manifest,
                Arc::new(SelfChangeLedger::new()),
                "root-id".to_string(),
            )),
            local: SyncRepository::Local(LocalRepository::new(
                local_root.to_path_buf(),
                local_manifest,
                Arc::new(SelfChangeLedger::new()),
            )),
        }
    }

    #[test]
    fn enqueue_persists_queue_file() {
        let dir = tempfile::tempdir().unwrap();
        let processor = make_processor(dir.path());

        processor.queue_change(created("a.txt", "abc"));

        let content = std::fs::read_to_string(dir.path().join(CHANGES_FILE)).unwrap();
        assert!(content.starts_with("1\n"));
        assert!(content.contains("\"a.txt\""));
    }

    #[test]
    fn restart_reloads_persisted_queue() {
        let dir = tempfile::tempdir().unwrap();
        {
            let processor = make_processor(dir.path());
            processor.queue_change(created("a.txt", "abc"));
            assert_eq!(processor.queue_len(), 1);
        }

        let reloaded = make_processor(dir.path());
        assert_eq!(reloaded.queue_len(), 1);
    }

    #[test]
    fn corrupt_queue_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CHANGES_FILE), "not a queue").unwrap();
        let processor = make_processor(dir.path());
        assert_eq!(processor.queue_len(), 0);
    }

    #[test]
    fn moved_and_modified_splits_into_pair() {
        let dir = tempfile::tempdir().unwrap();
        let processor = make_processor(dir.path());

        let change = ChangeInfo::new(
            RepoTag::GoogleDrive,
            ChangeKind::MovedAndModified,
            "b/p.bin",
            "new-sum",
            false,
        )
        .with_old("a/p.bin", Some("old-sum".into()));
        processor.queue_change(change);

        let state = processor.state.lock().unwrap();
        assert_eq!(state.queue.len(), 2);
        assert_eq!(state.queue[0].kind, ChangeKind::Created);
        assert_eq!(state.queue[0].path, "b/p.bin");
        assert_eq!(state.queue[1].kind, ChangeKind::Removed);
        assert_eq!(state.queue[1].path, "a/p.bin");
        assert_eq!(state.queue[1].checksum, "old-sum");
    }

    #[test]
    fn recent_window_discards_equal_changes() {
        let dir = tempfile::tempdir().unwrap();
        let processor = make_processor(dir.path());

        {
            let mut state = processor.state.lock().unwrap();
            state.recent.push(RecentChange {
                info: created("a.txt", "abc"),
                at: Instant::now(),
            });
        }

        // Same logical change from the other side: suppressed.
        let mut echo = created("a.txt", "abc");
        echo.source = RepoTag::LocalDrive;
        processor.queue_change(echo);
        assert_eq!(processor.queue_len(), 0);

        // Different checksum: a real change, enqueued.
        processor.queue_change(created("a.txt", "def"));
        assert_eq!(processor.queue_len(), 1);
    }

    #[test]
    fn complementary_ghosts_are_cleared_on_dequeue() {
        let dir = tempfile::tempdir().unwrap();
        let processor = make_processor(dir.path());

        {
            let mut state = processor.state.lock().unwrap();
            state.recent.push(RecentChange {
                info: ChangeInfo::new(
                    RepoTag::GoogleDrive,
                    ChangeKind::Removed,
                    "a.txt",
                    "abc",
                    false,
                ),
                at: Instant::now(),
            });
            state.queue.push_back(created("a.txt", "abc"));
        }

        // One dequeue cycle. The cloud manifest has no such path, so the
        // transfer is skipped as vanished-source; this test only inspects
        // the recent window.
        let local_dir = tempfile::tempdir().unwrap();
        let repositories = make_repositories("http://127.0.0.1:9", local_dir.path());

        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            processor.stop.cancel();
            let _ = processor.run(&repositories).await;
        });

        let state = processor.state.lock().unwrap();
        let removed_ghosts = state
            .recent
            .iter()
            .filter(|recent| recent.info.kind == ChangeKind::Removed)
            .count();
        assert_eq!(removed_ghosts, 0, "complementary Removed ghost must be cleared");
        assert!(state
            .recent
            .iter()
            .any(|recent| recent.info.kind == ChangeKind::Created));
    }

    #[tokio::test]
    async fn created_file_is_replayed_from_cloud_to_local() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(url_path("/drive/v3/files/f1"))
            .and(query_param("alt", "media"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"hello cloud!"))
            .mount(&server)
            .await;

        let work_dir = tempfile::tempdir().unwrap();
        let local_dir = tempfile::tempdir().unwrap();
        let repositories = make_repositories(&server.uri(), local_dir.path());

        {
            let mut manifest = repositories.cloud.manifest().lock().await;
            manifest.insert_file(
                "f1",
                FileRecord {
                    path: "a.txt".into(),
                    size: 12,
                    modified: OffsetDateTime::UNIX_EPOCH,
                    checksum: crate::sync::checksum::bytes_md5(b"hello cloud!"),
                },
            );
        }

        let processor = Arc::new(make_processor(work_dir.path()));
        processor.queue_change(created(
            "a.txt",
            &crate::sync::checksum::bytes_md5(b"hello cloud!"),
        ));

        let runner = Arc::clone(&processor);
        let run = tokio::spawn(async move { runner.run(&repositories).await });

        // The queue drains and the file lands locally with identical bytes.
        processor.await_idle().await;
        let written = tokio::fs::read(local_dir.path().join("a.txt")).await.unwrap();
        assert_eq!(written, b"hello cloud!");

        processor.stop.cancel();
        processor.notify.notify_one();
        run.await.unwrap().unwrap();

        let content = std::fs::read_to_string(work_dir.path().join(CHANGES_FILE)).unwrap();
        assert!(content.starts_with("0\n"), "queue file must be drained");
    }

    #[tokio::test]
    async fn local_create_is_uploaded_to_cloud() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(url_path("/drive/v3/files"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "new-id",
                "name": "new.txt",
                "parents": ["root-id"]
            })))
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .and(url_path("/upload/drive/v3/files/new-id"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "new-id",
                "name": "new.txt",
                "parents": ["root-id"],
                "size": "4",
                "md5Checksum": "e2fc714c4727ee9395f324cd2e7f331f",
                "modifiedTime": "2023-11-14T22:13:20Z"
            })))
            .mount(&server)
            .await;

        let work_dir = tempfile::tempdir().unwrap();
        let local_dir = tempfile::tempdir().unwrap();
        let repositories = Arc::new(make_repositories(&server.uri(), local_dir.path()));
        tokio::fs::write(local_dir.path().join("new.txt"), b"abcd").await.unwrap();
        {
            let mut manifest = repositories.local.manifest().lock().await;
            manifest.insert_file(
                "new.txt",
                FileRecord {
                    path: "new.txt".into(),
                    size: 4,
                    modified: OffsetDateTime::UNIX_EPOCH,
                    checksum: "e2fc714c4727ee9395f324cd2e7f331f".into(),
                },
            );
        }

        let processor = Arc::new(make_processor(work_dir.path()));
        let mut change = created("new.txt", "e2fc714c4727ee9395f324cd2e7f331f");
        change.source = RepoTag::LocalDrive;
        processor.queue_change(change);

        let run = {
            let processor = Arc::clone(&processor);
            let repositories = Arc::clone(&repositories);
            tokio::spawn(async move { processor.run(&repositories).await })
        };

        processor.await_idle().await;
        {
            let manifest = repositories.cloud.manifest().lock().await;
            let record = manifest.file_at_path("new.txt").unwrap();
            assert_eq!(record.size, 4);
            assert_eq!(record.checksum, "e2fc714c4727ee9395f324cd2e7f331f");
        }

        processor.stop.cancel();
        processor.notify.notify_one();
        run.await.unwrap().unwrap();
    }

    #[test]
    fn retry_delay_is_capped() {
        for attempt in 0..40 {
            assert!(retry_delay(attempt) <= Duration::from_millis(RETRY_MAX_MS));
        }
    }

    #[test]
    fn crash_file_is_written_with_timestamp_suffix() {
        let dir = tempfile::tempdir().unwrap();
        write_crash_file(dir.path(), &SyncError::Invariant("boom".into()));

        let entries: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].starts_with(CRASH_FILE_PREFIX));
        let content = std::fs::read_to_string(dir.path().join(&entries[0])).unwrap();
        assert!(content.contains("boom"));
    }
}
