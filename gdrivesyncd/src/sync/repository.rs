use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Instant;

use futures_util::StreamExt;
use gdrive_core::{DriveClient, DriveFile, FOLDER_MIME_TYPE};
use md5::Context;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tokio_util::io::ReaderStream;

use super::change::{ChangeInfo, RepoTag};
use super::checksum;
use super::error::SyncError;
use super::manifest::{parse_modified, CloudEntry, Manifest, ITEM_FIELDS};
use super::paths;
use super::processor::ECHO_WINDOW;

const DOWNLOAD_CONCURRENCY: usize = 4;
const UPLOAD_CONCURRENCY: usize = 2;

/// Per-repository record of paths the engine itself wrote recently.
/// Observers consult it to drop echoes cheaply before recomputing
/// checksums.
pub struct SelfChangeLedger {
    entries: StdMutex<HashMap<String, Instant>>,
}

impl SelfChangeLedger {
    pub fn new() -> Self {
        Self {
            entries: StdMutex::new(HashMap::new()),
        }
    }

    pub fn record(&self, path: &str) {
        let mut entries = self.entries.lock().expect("ledger mutex poisoned");
        let now = Instant::now();
        entries.retain(|_, stamp| now.duration_since(*stamp) < ECHO_WINDOW);
        entries.insert(path.to_string(), now);
    }

    pub fn is_recent(&self, path: &str) -> bool {
        let entries = self.entries.lock().expect("ledger mutex poisoned");
        entries
            .get(path)
            .is_some_and(|stamp| stamp.elapsed() < ECHO_WINDOW)
    }
}

impl Default for SelfChangeLedger {
    fn default() -> Self {
        Self::new()
    }
}

/// Whole-file content handed from the source repository to a destination.
/// Cloud downloads are backed by a temp file that disappears with the
/// stream; local reads point at the live file.
pub struct ContentStream {
    path: PathBuf,
    len: u64,
    _temp: Option<tempfile::TempPath>,
}

impl ContentStream {
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub async fn into_body(&self) -> io::Result<reqwest::Body> {
        let file = tokio::fs::File::open(&self.path).await?;
        Ok(reqwest::Body::wrap_stream(ReaderStream::new(file)))
    }

    /// Copies into place through a `.partial` sibling so readers never see
    /// a half-written file.
    pub async fn copy_to(&self, target: &Path) -> io::Result<()> {
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let partial = partial_path(target);
        tokio::fs::copy(&self.path, &partial).await?;
        tokio::fs::rename(&partial, target).await?;
        Ok(())
    }
}

fn partial_path(target: &Path) -> PathBuf {
    target.with_extension(format!(
        "{}partial",
        target
            .extension()
            .map(|ext| format!("{}.", ext.to_string_lossy()))
            .unwrap_or_default()
    ))
}

pub struct CloudRepository {
    client: DriveClient,
    manifest: Arc<Mutex<Manifest>>,
    ledger: Arc<SelfChangeLedger>,
    root_id: String,
    download_limit: Semaphore,
    upload_limit: Semaphore,
}

impl CloudRepository {
    pub fn new(
        client: DriveClient,
        manifest: Arc<Mutex<Manifest>>,
        ledger: Arc<SelfChangeLedger>,
        root_id: String,
    ) -> Self {
        Self {
            client,
            manifest,
            ledger,
            root_id,
            download_limit: Semaphore::new(DOWNLOAD_CONCURRENCY),
            upload_limit: Semaphore::new(UPLOAD_CONCURRENCY),
        }
    }

    pub fn manifest(&self) -> &Arc<Mutex<Manifest>> {
        &self.manifest
    }

    /// Creates any missing ancestor folders, bottom of the chain last, and
    /// returns the folder id for `path`.
    async fn ensure_folder(
        &self,
        manifest: &mut Manifest,
        path: &str,
    ) -> Result<String, SyncError> {
        if path.is_empty() {
            return Ok(self.root_id.clone());
        }

        let mut missing: Vec<&str> = Vec::new();
        let mut current = path;
        let mut parent_id = loop {
            if current.is_empty() {
                break self.root_id.clone();
            }
            if let Some(id) = manifest.folder_id_at_path(current) {
                break id.to_string();
            }
            missing.push(current);
            current = paths::parent_of(current).unwrap_or("");
        };

        for folder_path in missing.into_iter().rev() {
            let name = paths::file_name_of(folder_path);
            let created = self
                .client
                .create_file(name, &parent_id, Some(FOLDER_MIME_TYPE), ITEM_FIELDS)
                .await?;
            self.ledger.record(folder_path);
            manifest.insert_folder(created.id.clone(), folder_path);
            parent_id = created.id;
        }
        Ok(parent_id)
    }

    async fn create_or_update_file(
        &self,
        path: &str,
        content: &ContentStream,
        checksum: &str,
    ) -> Result<(), SyncError> {
        let _permit = self.upload_limit.acquire().await.expect("semaphore closed");
        // The lock spans the cloud write and the manifest registration so
        // the poller cannot classify our own write as an external change.
        let mut manifest = self.manifest.lock().await;

        let existing = manifest.id_at_path(path).map(str::to_string);
        let uploaded = match existing {
            Some(id) => {
                self.client
                    .upload_content(&id, content.into_body().await?, ITEM_FIELDS)
                    .await?
            }
            None => {
                let parent = paths::parent_of(path)
                    .ok_or_else(|| SyncError::NotFound(path.to_string()))?;
                let parent_id = self.ensure_folder(&mut manifest, parent).await?;
                let created = self
                    .client
                    .create_file(paths::file_name_of(path), &parent_id, None, ITEM_FIELDS)
                    .await?;
                self.client
                    .upload_content(&created.id, content.into_body().await?, ITEM_FIELDS)
                    .await?
            }
        };

        self.ledger.record(path);
        if let Some(entry) = self.entry_from_response(&uploaded, path, checksum) {
            let _ = manifest.register_change(&entry);
        }
        Ok(())
    }

    fn entry_from_response(
        &self,
        file: &DriveFile,
        path: &str,
        fallback_checksum: &str,
    ) -> Option<CloudEntry> {
        let parent_id = file.parents.first().cloned()?;
        let checksum = file
            .md5_checksum
            .clone()
            .unwrap_or_else(|| fallback_checksum.to_string());
        Some(CloudEntry {
            id: file.id.clone(),
            name: paths::file_name_of(path).to_string(),
            parent_id,
            is_folder: false,
            size: file.size_bytes().unwrap_or(-1),
            modified: parse_modified(file.modified_time.as_deref()),
            checksum,
        })
    }

    async fn create_folder(&self, path: &str) -> Result<(), SyncError> {
        let mut manifest = self.manifest.lock().await;
        self.ensure_folder(&mut manifest, path).await?;
        Ok(())
    }

    async fn move_item(&self, from: &str, to: &str) -> Result<(), SyncError> {
        let mut manifest = self.manifest.lock().await;
        let id = manifest
            .id_at_path(from)
            .map(str::to_string)
            .ok_or_else(|| SyncError::NotFound(from.to_string()))?;
        if from != to && manifest.contains_path(to) {
            return Err(SyncError::Manifest(
                super::manifest::ManifestError::DuplicateDestination(to.to_string()),
            ));
        }

        let old_parent = paths::parent_of(from).unwrap_or("");
        let new_parent = paths::parent_of(to).unwrap_or("");
        let old_name = paths::file_name_of(from);
        let new_name = paths::file_name_of(to);

        let old_parent_id = if old_parent.is_empty() {
            self.root_id.clone()
        } else {
            manifest
                .folder_id_at_path(old_parent)
                .map(str::to_string)
                .unwrap_or_else(|| self.root_id.clone())
        };
        let new_parent_id = self.ensure_folder(&mut manifest, new_parent).await?;

        let rename = (old_name != new_name).then_some(new_name);
        let reparent = old_parent_id != new_parent_id;
        self.client
            .update_file_metadata(
                &id,
                rename,
                reparent.then_some(new_parent_id.as_str()),
                reparent.then_some(old_parent_id.as_str()),
                ITEM_FIELDS,
            )
            .await?;

        self.ledger.record(from);
        self.ledger.record(to);
        let _ = manifest.register_move(from, to)?;
        Ok(())
    }

    async fn remove_item(&self, path: &str) -> Result<(), SyncError> {
        let mut manifest = self.manifest.lock().await;
        let Some(id) = manifest.id_at_path(path).map(str::to_string) else {
            // Removing what is already gone is a success.
            return Ok(());
        };
        match self.client.delete_file(&id).await {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err.into()),
        }
        self.ledger.record(path);
        let _ = manifest.register_removal(&id);
        Ok(())
    }

    /// Downloads into a consumer-owned temp file, verifying the Drive
    /// checksum on the way through.
    async fn get_content(&self, path: &str) -> Result<ContentStream, SyncError> {
        let _permit = self
            .download_limit
            .acquire()
            .await
            .expect("semaphore closed");
        let (id, expected) = {
            let manifest = self.manifest.lock().await;
            let id = manifest
                .id_at_path(path)
                .map(str::to_string)
                .ok_or_else(|| SyncError::NotFound(path.to_string()))?;
            let expected = manifest
                .file_at_path(path)
                .map(|record| record.checksum.clone());
            (id, expected)
        };

        let response = self.client.download_file(&id).await?;
        let temp = tempfile::NamedTempFile::new()?;
        let temp_path = temp.into_temp_path();
        let mut file = tokio::fs::File::create(&temp_path).await?;
        let mut stream = response.bytes_stream();
        let mut digest = Context::new();
        let mut len = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            digest.consume(&chunk);
            len += chunk.len() as u64;
        }
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        if let Some(expected) = expected
            && expected != checksum::UNKNOWN_CHECKSUM
            && expected != checksum::UNREADABLE_CHECKSUM
        {
            let actual = format!("{:x}", digest.compute());
            if actual != expected.to_ascii_lowercase() {
                return Err(SyncError::Integrity { expected, actual });
            }
        }

        Ok(ContentStream {
            path: temp_path.to_path_buf(),
            len,
            _temp: Some(temp_path),
        })
    }

    async fn exists(&self, path: &str) -> bool {
        self.manifest.lock().await.contains_path(path)
    }
}

pub struct LocalRepository {
    root: PathBuf,
    manifest: Arc<Mutex<Manifest>>,
    ledger: Arc<SelfChangeLedger>,
}

impl LocalRepository {
    pub fn new(root: PathBuf, manifest: Arc<Mutex<Manifest>>, ledger: Arc<SelfChangeLedger>) -> Self {
        Self {
            root,
            manifest,
            ledger,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn manifest(&self) -> &Arc<Mutex<Manifest>> {
        &self.manifest
    }

    pub fn ledger(&self) -> &Arc<SelfChangeLedger> {
        &self.ledger
    }

    async fn create_or_update_file(
        &self,
        path: &str,
        content: &ContentStream,
        checksum: &str,
    ) -> Result<(), SyncError> {
        let target = paths::local_path_for(&self.root, path)?;
        // Lock spans the filesystem write and the manifest registration so
        // the watcher pump cannot race a classification in between.
        let mut manifest = self.manifest.lock().await;
        content.copy_to(&target).await?;
        self.ledger.record(path);

        let metadata = tokio::fs::metadata(&target).await?;
        let recorded_checksum = if checksum == checksum::UNKNOWN_CHECKSUM
            || checksum == checksum::UNREADABLE_CHECKSUM
        {
            checksum::file_md5_or_unknown(&target).await
        } else {
            checksum.to_string()
        };
        let _ = manifest.register_local_file(
            path,
            metadata.len() as i64,
            metadata
                .modified()
                .map(time::OffsetDateTime::from)
                .unwrap_or(time::OffsetDateTime::UNIX_EPOCH),
            &recorded_checksum,
        );
        Ok(())
    }

    async fn create_folder(&self, path: &str) -> Result<(), SyncError> {
        let target = paths::local_path_for(&self.root, path)?;
        let mut manifest = self.manifest.lock().await;
        tokio::fs::create_dir_all(&target).await?;
        self.ledger.record(path);
        let _ = manifest.register_local_folder(path);
        Ok(())
    }

    async fn move_item(&self, from: &str, to: &str) -> Result<(), SyncError> {
        let source = paths::local_path_for(&self.root, from)?;
        let target = paths::local_path_for(&self.root, to)?;
        let mut manifest = self.manifest.lock().await;

        if tokio::fs::metadata(&source).await.is_err() {
            return Err(SyncError::NotFound(from.to_string()));
        }
        if from != to && tokio::fs::metadata(&target).await.is_ok() {
            return Err(SyncError::Manifest(
                super::manifest::ManifestError::DuplicateDestination(to.to_string()),
            ));
        }
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(&source, &target).await?;

        self.ledger.record(from);
        self.ledger.record(to);
        let _ = manifest.register_move(from, to)?;
        Ok(())
    }

    async fn remove_file(&self, path: &str) -> Result<(), SyncError> {
        let target = paths::local_path_for(&self.root, path)?;
        let mut manifest = self.manifest.lock().await;
        match tokio::fs::remove_file(&target).await {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        self.ledger.record(path);
        let _ = manifest.register_local_removal(path);
        Ok(())
    }

    async fn remove_folder(&self, path: &str) -> Result<(), SyncError> {
        let target = paths::local_path_for(&self.root, path)?;
        let mut manifest = self.manifest.lock().await;
        match tokio::fs::remove_dir_all(&target).await {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        self.ledger.record(path);
        let _ = manifest.register_local_removal(path);
        Ok(())
    }

    async fn get_content(&self, path: &str) -> Result<ContentStream, SyncError> {
        let source = paths::local_path_for(&self.root, path)?;
        let metadata = match tokio::fs::metadata(&source).await {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(SyncError::NotFound(path.to_string()));
            }
            Err(err) => return Err(err.into()),
        };
        Ok(ContentStream {
            path: source,
            len: metadata.len(),
            _temp: None,
        })
    }

    async fn exists(&self, path: &str) -> bool {
        let Ok(target) = paths::local_path_for(&self.root, path) else {
            return false;
        };
        tokio::fs::metadata(&target).await.is_ok()
    }
}

/// The two managed repositories as one tagged variant; the processor
/// dispatches mutations through this surface.
pub enum SyncRepository {
    Cloud(CloudRepository),
    Local(LocalRepository),
}

impl SyncRepository {
    pub fn tag(&self) -> RepoTag {
        match self {
            SyncRepository::Cloud(_) => RepoTag::GoogleDrive,
            SyncRepository::Local(_) => RepoTag::LocalDrive,
        }
    }

    pub fn manifest(&self) -> &Arc<Mutex<Manifest>> {
        match self {
            SyncRepository::Cloud(repo) => repo.manifest(),
            SyncRepository::Local(repo) => repo.manifest(),
        }
    }

    pub async fn create_or_update_file(
        &self,
        path: &str,
        content: &ContentStream,
        checksum: &str,
    ) -> Result<(), SyncError> {
        match self {
            SyncRepository::Cloud(repo) => repo.create_or_update_file(path, content, checksum).await,
            SyncRepository::Local(repo) => repo.create_or_update_file(path, content, checksum).await,
        }
    }

    pub async fn create_folder(&self, path: &str) -> Result<(), SyncError> {
        match self {
            SyncRepository::Cloud(repo) => repo.create_folder(path).await,
            SyncRepository::Local(repo) => repo.create_folder(path).await,
        }
    }

    pub async fn move_file(&self, from: &str, to: &str) -> Result<(), SyncError> {
        match self {
            SyncRepository::Cloud(repo) => repo.move_item(from, to).await,
            SyncRepository::Local(repo) => repo.move_item(from, to).await,
        }
    }

    pub async fn move_folder(&self, from: &str, to: &str) -> Result<(), SyncError> {
        match self {
            SyncRepository::Cloud(repo) => repo.move_item(from, to).await,
            SyncRepository::Local(repo) => repo.move_item(from, to).await,
        }
    }

    pub async fn remove_file(&self, path: &str) -> Result<(), SyncError> {
        match self {
            SyncRepository::Cloud(repo) => repo.remove_item(path).await,
            SyncRepository::Local(repo) => repo.remove_file(path).await,
        }
    }

    pub async fn remove_folder(&self, path: &str) -> Result<(), SyncError> {
        match self {
            SyncRepository::Cloud(repo) => repo.remove_item(path).await,
            SyncRepository::Local(repo) => repo.remove_folder(path).await,
        }
    }

    pub async fn get_content(&self, path: &str) -> Result<ContentStream, SyncError> {
        match self {
            SyncRepository::Cloud(repo) => repo.get_content(path).await,
            SyncRepository::Local(repo) => repo.get_content(path).await,
        }
    }

    pub async fn does_file_exist(&self, change: &ChangeInfo) -> bool {
        match self {
            SyncRepository::Cloud(repo) => repo.exists(&change.path).await,
            SyncRepository::Local(repo) => repo.exists(&change.path).await,
        }
    }
}

pub struct Repositories {
    pub cloud: SyncRepository,
    pub local: SyncRepository,
}

impl Repositories {
    pub fn by_tag(&self, tag: RepoTag) -> &SyncRepository {
        match tag {
            RepoTag::GoogleDrive => &self.cloud,
            RepoTag::LocalDrive => &self.local,
        }
    }

    pub fn all(&self) -> [&SyncRepository; 2] {
        [&self.cloud, &self.local]
    }
}
