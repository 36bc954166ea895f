use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use time::OffsetDateTime;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::change::RepoTag;
use super::checksum;
use super::manifest::{ticks_from, Manifest};
use super::paths;
use super::processor::ChangeProcessor;
use super::repository::SelfChangeLedger;

/// Raw watcher events rest in the queue this long so bursts on the same
/// path collapse into one canonical change.
pub const COALESCE_WINDOW: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RawKind {
    Created,
    Changed,
    Deleted,
    Renamed,
}

#[derive(Debug, Clone)]
struct RawEvent {
    kind: RawKind,
    path: PathBuf,
    old_path: Option<PathBuf>,
    due: Instant,
}

enum PumpStep {
    Raw(RawEvent),
    /// A Removed/Created pair whose filenames match; candidates for move
    /// re-synthesis. `older` is the delete side, `newer` the create side.
    MaybePair {
        older: RawEvent,
        newer: RawEvent,
    },
}

/// Translates the OS watch into canonical changes, compensating for the
/// watcher's granularity with a due-time queue and move re-synthesis.
pub struct LocalObserver {
    root: PathBuf,
    manifest: Arc<Mutex<Manifest>>,
    ledger: Arc<SelfChangeLedger>,
    processor: Arc<ChangeProcessor>,
    manifest_path: PathBuf,
    queue: StdMutex<VecDeque<RawEvent>>,
    notify: Notify,
    stop: CancellationToken,
}

impl LocalObserver {
    pub fn new(
        root: PathBuf,
        manifest: Arc<Mutex<Manifest>>,
        ledger: Arc<SelfChangeLedger>,
        processor: Arc<ChangeProcessor>,
        manifest_path: PathBuf,
        stop: CancellationToken,
    ) -> Self {
        Self {
            root,
            manifest,
            ledger,
            processor,
            manifest_path,
            queue: StdMutex::new(VecDeque::new()),
            notify: Notify::new(),
            stop,
        }
    }

    /// Starts the OS watch. The returned watcher must stay alive for the
    /// callback to keep firing.
    pub fn start_watcher(self: &Arc<Self>) -> notify::Result<RecommendedWatcher> {
        let observer = Arc::clone(self);
        let mut watcher = notify::recommended_watcher(move |result: notify::Result<Event>| {
            if let Ok(event) = result {
                for raw in map_event(event) {
                    observer.push(raw);
                }
            }
        })?;
        watcher.watch(&self.root, RecursiveMode::Recursive)?;
        Ok(watcher)
    }

    fn push(&self, (kind, path, old_path): (RawKind, PathBuf, Option<PathBuf>)) {
        let mut queue = self.queue.lock().expect("event queue mutex poisoned");
        queue.push_back(RawEvent {
            kind,
            path,
            old_path,
            due: Instant::now() + COALESCE_WINDOW,
        });
        self.notify.notify_one();
    }

    /// The pump task: consumes the due-time queue in FIFO order.
    pub async fn run(self: &Arc<Self>) {
        loop {
            let next_due = {
                self.queue
                    .lock()
                    .expect("event queue mutex poisoned")
                    .front()
                    .map(|event| event.due)
            };

            match next_due {
                None => {
                    self.save_manifest_if_dirty().await;
                    tokio::select! {
                        _ = self.notify.notified() => {}
                        _ = self.stop.cancelled() => return,
                    }
                }
                Some(due) if due > Instant::now() => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(due) => {}
                        _ = self.notify.notified() => {}
                        _ = self.stop.cancelled() => return,
                    }
                }
                Some(_) => {
                    if let Some(step) = self.coalesce_head() {
                        self.handle(step).await;
                    }
                }
            }
        }
    }

    /// Pops the due head and applies the coalescing rules against the rest
    /// of the queue.
    fn coalesce_head(&self) -> Option<PumpStep> {
        let mut queue = self.queue.lock().expect("event queue mutex poisoned");
        let head = queue.pop_front()?;

        if matches!(head.kind, RawKind::Created | RawKind::Changed) {
            // Later writes on the same path are redundant; a later delete
            // suppresses the head outright.
            let mut suppressed = false;
            queue.retain(|event| {
                if event.path == head.path {
                    if event.kind == RawKind::Changed {
                        return false;
                    }
                    if event.kind == RawKind::Deleted {
                        suppressed = true;
                    }
                }
                true
            });
            if suppressed {
                return None;
            }
        }

        match head.kind {
            RawKind::Created => {
                let name = head.path.file_name().map(|n| n.to_owned());
                let complement = queue.iter().position(|event| {
                    event.kind == RawKind::Deleted
                        && event.path.file_name().map(|n| n.to_owned()) == name
                });
                if let Some(index) = complement {
                    let older = queue.remove(index).expect("index in bounds");
                    return Some(PumpStep::MaybePair { older, newer: head });
                }
                Some(PumpStep::Raw(head))
            }
            RawKind::Deleted => {
                let name = head.path.file_name().map(|n| n.to_owned());
                let complement = queue.iter().position(|event| {
                    event.kind == RawKind::Created
                        && event.path.file_name().map(|n| n.to_owned()) == name
                });
                if let Some(index) = complement {
                    let newer = queue.remove(index).expect("index in bounds");
                    return Some(PumpStep::MaybePair { older: head, newer });
                }
                Some(PumpStep::Raw(head))
            }
            _ => Some(PumpStep::Raw(head)),
        }
    }

    async fn handle(&self, step: PumpStep) {
        match step {
            PumpStep::Raw(event) => self.raise(event).await,
            PumpStep::MaybePair { older, newer } => {
                if self.resynthesize_move(&older, &newer).await {
                    return;
                }
                // Not the same content: the pair stands as independent
                // delete and create events.
                self.raise(older).await;
                self.raise(newer).await;
            }
        }
    }

    /// A Removed/Created pair is one move when the file now at the newer
    /// path matches the manifest's record of the older path on size, mtime
    /// and checksum.
    async fn resynthesize_move(&self, older: &RawEvent, newer: &RawEvent) -> bool {
        let Ok(old_rel) = paths::relative_from_local(&self.root, &older.path) else {
            return false;
        };
        let Ok(new_rel) = paths::relative_from_local(&self.root, &newer.path) else {
            return false;
        };

        let mut manifest = self.manifest.lock().await;
        let Some(record) = manifest.file_at_path(&old_rel).cloned() else {
            return false;
        };
        let Ok(metadata) = tokio::fs::metadata(&newer.path).await else {
            return false;
        };
        if !metadata.is_file() || record.size != metadata.len() as i64 {
            return false;
        }
        let disk_modified = metadata
            .modified()
            .map(OffsetDateTime::from)
            .unwrap_or(OffsetDateTime::UNIX_EPOCH);
        if ticks_from(record.modified) != ticks_from(disk_modified) {
            return false;
        }
        let disk_checksum = checksum::file_md5_or_unknown(&newer.path).await;
        if disk_checksum != record.checksum {
            return false;
        }

        match manifest.register_move(&old_rel, &new_rel) {
            Ok(Some(info)) => {
                eprintln!("[{}] {info}", RepoTag::LocalDrive);
                self.processor.queue_change(info);
                true
            }
            Ok(None) => false,
            Err(err) => {
                eprintln!("[{}] cannot re-synthesize move: {err}", RepoTag::LocalDrive);
                false
            }
        }
    }

    async fn raise(&self, event: RawEvent) {
        let Ok(relative) = paths::relative_from_local(&self.root, &event.path) else {
            // Outside the root (or the root itself): rejected.
            return;
        };

        match event.kind {
            RawKind::Renamed => self.raise_rename(&event, &relative).await,
            RawKind::Created | RawKind::Changed => self.raise_upsert(&event, &relative).await,
            RawKind::Deleted => {
                let mut manifest = self.manifest.lock().await;
                if let Some(info) = manifest.register_local_removal(&relative) {
                    eprintln!("[{}] {info}", RepoTag::LocalDrive);
                    self.processor.queue_change(info);
                }
            }
        }
    }

    async fn raise_rename(&self, event: &RawEvent, new_rel: &str) {
        let old_rel = event
            .old_path
            .as_ref()
            .and_then(|old| paths::relative_from_local(&self.root, old).ok());
        let Some(old_rel) = old_rel else {
            // Rename from outside the root is a plain appearance.
            self.raise_upsert(event, new_rel).await;
            return;
        };

        let mut manifest = self.manifest.lock().await;
        match manifest.register_move(&old_rel, new_rel) {
            Ok(Some(info)) => {
                eprintln!("[{}] {info}", RepoTag::LocalDrive);
                self.processor.queue_change(info);
            }
            Ok(None) => {
                // Unknown source path: classify the destination fresh.
                drop(manifest);
                self.raise_upsert(event, new_rel).await;
            }
            Err(err) => {
                eprintln!("[{}] move rejected: {err}", RepoTag::LocalDrive);
            }
        }
    }

    async fn raise_upsert(&self, event: &RawEvent, relative: &str) {
        match tokio::fs::metadata(&event.path).await {
            Ok(metadata) if metadata.is_dir() => {
                let mut manifest = self.manifest.lock().await;
                if let Some(info) = manifest.register_local_folder(relative) {
                    eprintln!("[{}] {info}", RepoTag::LocalDrive);
                    self.processor.queue_change(info);
                }
            }
            Ok(metadata) => {
                let size = metadata.len() as i64;
                let modified = metadata
                    .modified()
                    .map(OffsetDateTime::from)
                    .unwrap_or(OffsetDateTime::UNIX_EPOCH);

                // Engine-written paths whose record still matches the disk
                // need no checksum recompute.
                if self.ledger.is_recent(relative) {
                    let manifest = self.manifest.lock().await;
                    if let Some(record) = manifest.file_at_path(relative)
                        && record.size == size
                        && ticks_from(record.modified) == ticks_from(modified)
                    {
                        return;
                    }
                }

                let digest = checksum::file_md5_or_unknown(&event.path).await;
                let mut manifest = self.manifest.lock().await;
                if let Some(info) =
                    manifest.register_local_file(relative, size, modified, &digest)
                {
                    eprintln!("[{}] {info}", RepoTag::LocalDrive);
                    self.processor.queue_change(info);
                }
            }
            Err(_) => {
                // Vanished before the coalesce window closed; the checksum
                // of a missing file is unknown. Untracked paths are left
                // alone so no phantom record enters the shadow.
                let mut manifest = self.manifest.lock().await;
                if !manifest.contains_path(relative) {
                    return;
                }
                if let Some(info) = manifest.register_local_file(
                    relative,
                    -1,
                    OffsetDateTime::UNIX_EPOCH,
                    checksum::UNKNOWN_CHECKSUM,
                ) {
                    eprintln!("[{}] {info}", RepoTag::LocalDrive);
                    self.processor.queue_change(info);
                }
            }
        }
    }

    async fn save_manifest_if_dirty(&self) {
        let mut manifest = self.manifest.lock().await;
        if manifest.is_dirty()
            && let Err(err) = manifest.save_file(&self.manifest_path)
        {
            eprintln!("[{}] failed to save manifest: {err}", RepoTag::LocalDrive);
        }
    }

    #[cfg(test)]
    fn push_due_now(&self, kind: RawKind, path: &Path, old_path: Option<&Path>) {
        let mut queue = self.queue.lock().expect("event queue mutex poisoned");
        queue.push_back(RawEvent {
            kind,
            path: path.to_path_buf(),
            old_path: old_path.map(Path::to_path_buf),
            due: Instant::now(),
        });
    }
}

fn map_event(event: Event) -> Vec<(RawKind, PathBuf, Option<PathBuf>)> {
    match event.kind {
        EventKind::Modify(notify::event::ModifyKind::Name(_)) => {
            if event.paths.len() >= 2 {
                let old = event.paths[0].clone();
                let new = event.paths[1].clone();
                return vec![(RawKind::Renamed, new, Some(old))];
            }
            // Half of a rename: the complementary half re-synthesizes it.
            match event.kind {
                EventKind::Modify(notify::event::ModifyKind::Name(
                    notify::event::RenameMode::From,
                )) => event
                    .paths
                    .into_iter()
                    .map(|path| (RawKind::Deleted, path, None))
                    .collect(),
                _ => event
                    .paths
                    .into_iter()
                    .filter(|path| !is_symlink(path))
                    .map(|path| (RawKind::Created, path, None))
                    .collect(),
            }
        }
        EventKind::Create(_) => event
            .paths
            .into_iter()
            .filter(|path| !is_symlink(path))
            .map(|path| (RawKind::Created, path, None))
            .collect(),
        EventKind::Modify(_) => event
            .paths
            .into_iter()
            .filter(|path| !is_symlink(path))
            .map(|path| (RawKind::Changed, path, None))
            .collect(),
        EventKind::Remove(_) => event
            .paths
            .into_iter()
            .map(|path| (RawKind::Deleted, path, None))
            .collect(),
        _ => Vec::new(),
    }
}

fn is_symlink(path: &Path) -> bool {
    std::fs::symlink_metadata(path)
        .map(|meta| meta.file_type().is_symlink())
        .unwrap_or(false)
}
