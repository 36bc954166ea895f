use std::collections::{HashMap, HashSet};
use std::io;
use std::path::Path;

use gdrive_core::{DriveClient, DriveError, DriveFile, FOLDER_MIME_TYPE, SHORTCUT_MIME_TYPE};
use thiserror::Error;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use super::change::{ChangeInfo, ChangeKind, RepoTag};
use super::checksum;
use super::paths;

/// Metadata fields requested for every Drive item the manifest touches.
pub const ITEM_FIELDS: &str = "id,name,mimeType,parents,size,md5Checksum,modifiedTime,trashed,shortcutDetails";

const LIST_FIELDS: &str = "nextPageToken,files(id,name,mimeType,parents,size,md5Checksum,modifiedTime,trashed,shortcutDetails)";

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("api error: {0}")]
    Api(#[from] DriveError),
    #[error("manifest is corrupt: {0}")]
    Parse(String),
    #[error("path cannot be persisted: {0:?}")]
    UnsupportedPath(String),
    #[error("move destination already exists: {0}")]
    DuplicateDestination(String),
}

/// One tracked file: canonical path plus the content fingerprint used for
/// change classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub path: String,
    /// −1 when the size is unknown.
    pub size: i64,
    pub modified: OffsetDateTime,
    pub checksum: String,
}

/// A normalized entry from the cloud change feed or a cloud listing.
#[derive(Debug, Clone)]
pub struct CloudEntry {
    pub id: String,
    pub name: String,
    pub parent_id: String,
    pub is_folder: bool,
    pub size: i64,
    pub modified: OffsetDateTime,
    pub checksum: String,
}

/// Persistent shadow model of one repository's tree.
///
/// Invariants:
/// - every file id maps back through the reverse index to itself,
/// - every folder id maps back through the reverse index to itself,
/// - the reverse index covers exactly the union of file and folder paths,
/// - a path is either a file or a folder, never both,
/// - any mutation leaves the dirty flag set.
#[derive(Debug, PartialEq)]
pub struct Manifest {
    tag: RepoTag,
    cursor: String,
    folders: HashMap<String, String>,
    files: HashMap<String, FileRecord>,
    paths: HashMap<String, String>,
    dirty: bool,
}

impl Manifest {
    pub fn new(tag: RepoTag) -> Self {
        Self {
            tag,
            cursor: String::new(),
            folders: HashMap::new(),
            files: HashMap::new(),
            paths: HashMap::new(),
            dirty: false,
        }
    }

    pub fn tag(&self) -> RepoTag {
        self.tag
    }

    pub fn cursor(&self) -> &str {
        &self.cursor
    }

    pub fn set_cursor(&mut self, cursor: impl Into<String>) {
        self.cursor = cursor.into();
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn contains_path(&self, path: &str) -> bool {
        self.paths.contains_key(path)
    }

    pub fn id_at_path(&self, path: &str) -> Option<&str> {
        self.paths.get(path).map(String::as_str)
    }

    pub fn file_at_path(&self, path: &str) -> Option<&FileRecord> {
        let id = self.paths.get(path)?;
        self.files.get(id).filter(|record| record.path == *path)
    }

    pub fn folder_id_at_path(&self, path: &str) -> Option<&str> {
        let id = self.paths.get(path)?;
        self.folders.contains_key(id).then_some(id.as_str())
    }

    pub fn folder_path(&self, id: &str) -> Option<&str> {
        self.folders.get(id).map(String::as_str)
    }

    pub fn files(&self) -> impl Iterator<Item = (&String, &FileRecord)> {
        self.files.iter()
    }

    pub fn folders(&self) -> impl Iterator<Item = (&String, &String)> {
        self.folders.iter()
    }

    pub fn insert_file(&mut self, id: impl Into<String>, mut record: FileRecord) {
        let id = id.into();
        record.modified = truncate_to_ticks(record.modified);
        if let Some(previous) = self.files.get(&id) {
            self.paths.remove(&previous.path);
        }
        self.evict_path_occupant(&record.path, &id);
        self.paths.insert(record.path.clone(), id.clone());
        self.files.insert(id, record);
        self.dirty = true;
    }

    pub fn insert_folder(&mut self, id: impl Into<String>, path: impl Into<String>) {
        let id = id.into();
        let path = path.into();
        if let Some(previous) = self.folders.get(&id) {
            self.paths.remove(previous);
        }
        self.evict_path_occupant(&path, &id);
        self.paths.insert(path.clone(), id.clone());
        self.folders.insert(id, path);
        self.dirty = true;
    }

    // Drive permits duplicate names inside one folder; the shadow keeps
    // one entry per path, last writer wins.
    fn evict_path_occupant(&mut self, path: &str, id: &str) {
        if let Some(occupant) = self.paths.get(path).cloned()
            && occupant != id
        {
            self.files.remove(&occupant);
            self.folders.remove(&occupant);
        }
    }

    fn remove_entry(&mut self, id: &str) -> Option<String> {
        if let Some(record) = self.files.remove(id) {
            self.paths.remove(&record.path);
            self.dirty = true;
            return Some(record.path);
        }
        if let Some(path) = self.folders.remove(id) {
            self.paths.remove(&path);
            self.dirty = true;
            return Some(path);
        }
        None
    }

    /// Classifies one cloud feed entry against the shadow. Returns the
    /// canonical change, or `None` when the entry is a no-op or cannot be
    /// placed (its parent is outside the tracked tree).
    pub fn register_change(&mut self, entry: &CloudEntry) -> Option<ChangeInfo> {
        let parent_path = self.folders.get(&entry.parent_id)?.clone();
        let new_path = paths::join(&parent_path, &entry.name);
        if entry.is_folder {
            self.classify_folder(&entry.id, new_path)
        } else {
            self.classify_file(
                &entry.id,
                new_path,
                entry.size,
                entry.modified,
                &entry.checksum,
            )
        }
    }

    /// Removal or trashing of a known id. Unknown ids are no-ops.
    pub fn register_removal(&mut self, id: &str) -> Option<ChangeInfo> {
        if let Some(record) = self.files.get(id).cloned() {
            self.remove_entry(id);
            return Some(ChangeInfo::new(
                self.tag,
                ChangeKind::Removed,
                record.path,
                record.checksum,
                false,
            ));
        }

        let folder_path = self.folders.get(id)?.clone();
        self.remove_entry(id);
        // Children disappear with the folder; drop them from the shadow
        // without emitting per-child changes.
        self.remove_descendants(&folder_path);
        Some(ChangeInfo::new(
            self.tag,
            ChangeKind::Removed,
            folder_path,
            checksum::UNKNOWN_CHECKSUM,
            true,
        ))
    }

    /// Injects a synthetic move into the shadow and classifies it as Moved
    /// or Renamed. Returns `Ok(None)` when `from` is not tracked.
    pub fn register_move(
        &mut self,
        from: &str,
        to: &str,
    ) -> Result<Option<ChangeInfo>, ManifestError> {
        let Some(id) = self.paths.get(from).cloned() else {
            return Ok(None);
        };
        if from != to && self.paths.contains_key(to) {
            return Err(ManifestError::DuplicateDestination(to.to_string()));
        }

        let kind = move_kind(from, to);

        if let Some(record) = self.files.get(&id).cloned() {
            let new_id = if self.tag == RepoTag::LocalDrive {
                // Local identity is the path itself; moving re-keys the entry.
                self.paths.remove(from);
                self.files.remove(&id);
                to.to_string()
            } else {
                id
            };
            self.insert_file(
                new_id,
                FileRecord {
                    path: to.to_string(),
                    ..record.clone()
                },
            );
            return Ok(Some(
                ChangeInfo::new(self.tag, kind, to, record.checksum.clone(), false)
                    .with_old(from, Some(record.checksum)),
            ));
        }

        if self.folders.contains_key(&id) {
            self.relocate_folder(&id, from, to);
            return Ok(Some(
                ChangeInfo::new(self.tag, kind, to, checksum::UNKNOWN_CHECKSUM, true)
                    .with_old(from, None),
            ));
        }

        Ok(None)
    }

    /// Local file observation; identity is the path itself.
    pub fn register_local_file(
        &mut self,
        path: &str,
        size: i64,
        modified: OffsetDateTime,
        checksum: &str,
    ) -> Option<ChangeInfo> {
        self.classify_file(&path.to_string(), path.to_string(), size, modified, checksum)
    }

    pub fn register_local_folder(&mut self, path: &str) -> Option<ChangeInfo> {
        self.classify_folder(&path.to_string(), path.to_string())
    }

    pub fn register_local_removal(&mut self, path: &str) -> Option<ChangeInfo> {
        let id = self.paths.get(path)?.clone();
        self.register_removal(&id)
    }

    fn classify_file(
        &mut self,
        id: &str,
        new_path: String,
        size: i64,
        modified: OffsetDateTime,
        checksum: &str,
    ) -> Option<ChangeInfo> {
        let Some(old) = self.files.get(id).cloned() else {
            self.insert_file(
                id.to_string(),
                FileRecord {
                    path: new_path.clone(),
                    size,
                    modified,
                    checksum: checksum.to_string(),
                },
            );
            return Some(ChangeInfo::new(
                self.tag,
                ChangeKind::Created,
                new_path,
                checksum,
                false,
            ));
        };

        let path_changed = old.path != new_path;
        let content_changed = old.size != size || old.checksum != checksum;
        if !path_changed && !content_changed {
            return None;
        }

        let new_id = if path_changed && self.tag == RepoTag::LocalDrive {
            self.paths.remove(&old.path);
            self.files.remove(id);
            new_path.clone()
        } else {
            id.to_string()
        };
        self.insert_file(
            new_id,
            FileRecord {
                path: new_path.clone(),
                size,
                modified,
                checksum: checksum.to_string(),
            },
        );

        let change = match (path_changed, content_changed) {
            (false, true) => ChangeInfo::new(self.tag, ChangeKind::Modified, new_path, checksum, false)
                .with_old(old.path, Some(old.checksum)),
            (true, false) => {
                let kind = move_kind(&old.path, &new_path);
                ChangeInfo::new(self.tag, kind, new_path, checksum, false)
                    .with_old(old.path, Some(old.checksum))
            }
            (true, true) => {
                ChangeInfo::new(self.tag, ChangeKind::MovedAndModified, new_path, checksum, false)
                    .with_old(old.path, Some(old.checksum))
            }
            (false, false) => unreachable!(),
        };
        Some(change)
    }

    fn classify_folder(&mut self, id: &str, new_path: String) -> Option<ChangeInfo> {
        match self.folders.get(id).cloned() {
            None => {
                self.insert_folder(id.to_string(), new_path.clone());
                Some(ChangeInfo::new(
                    self.tag,
                    ChangeKind::Created,
                    new_path,
                    checksum::UNKNOWN_CHECKSUM,
                    true,
                ))
            }
            Some(old_path) if old_path == new_path => None,
            Some(old_path) => {
                let kind = move_kind(&old_path, &new_path);
                self.relocate_folder(id, &old_path, &new_path);
                Some(
                    ChangeInfo::new(self.tag, kind, new_path, checksum::UNKNOWN_CHECKSUM, true)
                        .with_old(old_path, None),
                )
            }
        }
    }

    /// Moves a folder and rewrites every descendant path so the reverse
    /// index stays consistent.
    fn relocate_folder(&mut self, id: &str, old_path: &str, new_path: &str) {
        self.paths.remove(old_path);
        let new_id = if self.tag == RepoTag::LocalDrive {
            self.folders.remove(id);
            new_path.to_string()
        } else {
            id.to_string()
        };
        self.folders.insert(new_id.clone(), new_path.to_string());
        self.paths.insert(new_path.to_string(), new_id);

        let prefix = format!("{old_path}/");
        let moved_folders: Vec<(String, String)> = self
            .folders
            .iter()
            .filter(|(_, path)| path.starts_with(&prefix))
            .map(|(id, path)| (id.clone(), path.clone()))
            .collect();
        for (folder_id, path) in moved_folders {
            let relocated = format!("{new_path}/{}", &path[prefix.len()..]);
            self.paths.remove(&path);
            let folder_id = if self.tag == RepoTag::LocalDrive {
                self.folders.remove(&folder_id);
                relocated.clone()
            } else {
                folder_id
            };
            self.paths.insert(relocated.clone(), folder_id.clone());
            self.folders.insert(folder_id, relocated);
        }

        let moved_files: Vec<(String, FileRecord)> = self
            .files
            .iter()
            .filter(|(_, record)| record.path.starts_with(&prefix))
            .map(|(id, record)| (id.clone(), record.clone()))
            .collect();
        for (file_id, record) in moved_files {
            let relocated = format!("{new_path}/{}", &record.path[prefix.len()..]);
            self.paths.remove(&record.path);
            let file_id = if self.tag == RepoTag::LocalDrive {
                self.files.remove(&file_id);
                relocated.clone()
            } else {
                file_id
            };
            self.paths.insert(relocated.clone(), file_id.clone());
            self.files.insert(
                file_id,
                FileRecord {
                    path: relocated,
                    ..record
                },
            );
        }
        self.dirty = true;
    }

    fn remove_descendants(&mut self, folder_path: &str) {
        let prefix = format!("{folder_path}/");
        let folder_ids: Vec<String> = self
            .folders
            .iter()
            .filter(|(_, path)| path.starts_with(&prefix))
            .map(|(id, _)| id.clone())
            .collect();
        for id in folder_ids {
            self.remove_entry(&id);
        }
        let file_ids: Vec<String> = self
            .files
            .iter()
            .filter(|(_, record)| record.path.starts_with(&prefix))
            .map(|(id, _)| id.clone())
            .collect();
        for id in file_ids {
            self.remove_entry(&id);
        }
    }

    /// Lists the whole owned Drive hierarchy and records it. Folder
    /// shortcuts are traversed under their apparent paths; file shortcuts
    /// are recorded with the target's content fingerprint.
    pub async fn build_from_cloud(
        client: &DriveClient,
        root_id: &str,
    ) -> Result<Manifest, ManifestError> {
        let mut manifest = Manifest::new(RepoTag::GoogleDrive);
        manifest.folders.insert(root_id.to_string(), String::new());
        manifest.paths.insert(String::new(), root_id.to_string());

        // Pass one: every folder, plus shortcuts. The query language cannot
        // filter on the shortcut target's mime type, so folder shortcuts are
        // separated client-side.
        let folder_query = format!(
            "trashed = false and (mimeType = '{FOLDER_MIME_TYPE}' or mimeType = '{SHORTCUT_MIME_TYPE}')"
        );
        let items = client.list_files_all(Some(&folder_query), LIST_FIELDS).await?;

        let mut raw_folders: HashMap<String, (String, Option<String>)> = HashMap::new();
        let mut folder_shortcuts: Vec<DriveFile> = Vec::new();
        for item in items {
            if item.is_folder() {
                raw_folders.insert(
                    item.id.clone(),
                    (item.name.clone(), item.parents.first().cloned()),
                );
            } else if let Some(details) = &item.shortcut_details
                && details.targets_folder()
            {
                folder_shortcuts.push(item);
            }
        }

        let mut resolved: HashMap<String, Option<String>> = HashMap::new();
        resolved.insert(root_id.to_string(), Some(String::new()));
        for id in raw_folders.keys() {
            let _ = resolve_folder_path(id, &raw_folders, &mut resolved);
        }
        for (id, path) in &resolved {
            if let Some(path) = path
                && !path.is_empty()
            {
                manifest.insert_folder(id.clone(), path.clone());
            }
        }

        let mut worklist: Vec<(String, String)> = Vec::new();
        let mut visited: HashSet<String> = HashSet::new();
        for shortcut in &folder_shortcuts {
            let Some(details) = &shortcut.shortcut_details else {
                continue;
            };
            let Some(parent_path) = shortcut
                .parents
                .first()
                .and_then(|parent| resolved.get(parent))
                .and_then(Clone::clone)
            else {
                continue;
            };
            let apparent = paths::join(&parent_path, &shortcut.name);
            manifest.insert_folder(details.target_id.clone(), apparent.clone());
            if visited.insert(details.target_id.clone()) {
                worklist.push((details.target_id.clone(), apparent));
            }
        }

        // Pass two: every non-folder item, including file shortcuts.
        let file_query =
            format!("trashed = false and mimeType != '{FOLDER_MIME_TYPE}'");
        let items = client.list_files_all(Some(&file_query), LIST_FIELDS).await?;
        for item in items {
            manifest.record_cloud_file(client, &item).await?;
        }

        // Pass three: children reachable only through folder shortcuts,
        // recorded under the shortcut's apparent path. Fresh shortcuts
        // extend the worklist; the visited set keeps cycles finite.
        while let Some((folder_id, base_path)) = worklist.pop() {
            let child_query = format!("'{folder_id}' in parents and trashed = false");
            let children = client.list_files_all(Some(&child_query), LIST_FIELDS).await?;
            for child in children {
                let apparent = paths::join(&base_path, &child.name);
                if child.is_folder() {
                    manifest.insert_folder(child.id.clone(), apparent.clone());
                    if visited.insert(child.id.clone()) {
                        worklist.push((child.id.clone(), apparent));
                    }
                } else if let Some(details) = &child.shortcut_details {
                    if details.targets_folder() {
                        manifest.insert_folder(details.target_id.clone(), apparent.clone());
                        if visited.insert(details.target_id.clone()) {
                            worklist.push((details.target_id.clone(), apparent));
                        }
                    } else {
                        manifest.record_file_shortcut(client, &child, &base_path).await?;
                    }
                } else {
                    manifest.insert_file(
                        child.id.clone(),
                        FileRecord {
                            path: apparent,
                            size: child.size_bytes().unwrap_or(-1),
                            modified: parse_modified(child.modified_time.as_deref()),
                            checksum: cloud_checksum(&child),
                        },
                    );
                }
            }
        }

        manifest.cursor = client.get_start_page_token().await?;
        manifest.dirty = false;
        Ok(manifest)
    }

    async fn record_cloud_file(
        &mut self,
        client: &DriveClient,
        item: &DriveFile,
    ) -> Result<(), ManifestError> {
        let Some(parent_path) = item
            .parents
            .first()
            .and_then(|parent| self.folders.get(parent))
            .cloned()
        else {
            return Ok(());
        };

        if let Some(details) = &item.shortcut_details {
            if details.targets_folder() {
                return Ok(());
            }
            return self.record_file_shortcut(client, item, &parent_path).await;
        }

        self.insert_file(
            item.id.clone(),
            FileRecord {
                path: paths::join(&parent_path, &item.name),
                size: item.size_bytes().unwrap_or(-1),
                modified: parse_modified(item.modified_time.as_deref()),
                checksum: cloud_checksum(item),
            },
        );
        Ok(())
    }

    /// Records a shortcut to a non-folder: the shortcut's parent and name,
    /// the target's size, checksum and modification time.
    async fn record_file_shortcut(
        &mut self,
        client: &DriveClient,
        shortcut: &DriveFile,
        parent_path: &str,
    ) -> Result<(), ManifestError> {
        let Some(details) = &shortcut.shortcut_details else {
            return Ok(());
        };
        let target = match client.get_file(&details.target_id, ITEM_FIELDS).await {
            Ok(target) => target,
            Err(err) if err.is_not_found() => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        self.insert_file(
            shortcut.id.clone(),
            FileRecord {
                path: paths::join(parent_path, &shortcut.name),
                size: target.size_bytes().unwrap_or(-1),
                modified: parse_modified(target.modified_time.as_deref()),
                checksum: cloud_checksum(&target),
            },
        );
        Ok(())
    }

    /// Recursive scan of the local subtree. A previously persisted manifest
    /// can be supplied to reuse checksums for entries whose size and mtime
    /// have not moved since the last run; the scan stays authoritative.
    pub fn build_from_local(
        root: &Path,
        hydrate: Option<&Manifest>,
    ) -> Result<Manifest, ManifestError> {
        let mut manifest = Manifest::new(RepoTag::LocalDrive);
        scan_local_dir(root, root, &mut manifest, hydrate)?;
        manifest.dirty = false;
        Ok(manifest)
    }

    pub fn load(content: &str, tag: RepoTag) -> Result<Manifest, ManifestError> {
        let corrupt = |what: &str| ManifestError::Parse(what.to_string());
        let mut lines = content.lines();

        let cursor = lines.next().ok_or_else(|| corrupt("missing cursor"))?;
        let mut manifest = Manifest::new(tag);
        manifest.cursor = cursor.to_string();

        let folder_count: usize = lines
            .next()
            .ok_or_else(|| corrupt("missing folder count"))?
            .trim()
            .parse()
            .map_err(|_| corrupt("bad folder count"))?;
        for _ in 0..folder_count {
            let id = lines.next().ok_or_else(|| corrupt("truncated folder id"))?;
            let path = lines
                .next()
                .ok_or_else(|| corrupt("truncated folder path"))?;
            if manifest.paths.contains_key(path) {
                return Err(corrupt("duplicate folder path"));
            }
            manifest.folders.insert(id.to_string(), path.to_string());
            manifest.paths.insert(path.to_string(), id.to_string());
        }

        let file_count: usize = lines
            .next()
            .ok_or_else(|| corrupt("missing file count"))?
            .trim()
            .parse()
            .map_err(|_| corrupt("bad file count"))?;
        for _ in 0..file_count {
            let id = lines.next().ok_or_else(|| corrupt("truncated file id"))?;
            let path = lines.next().ok_or_else(|| corrupt("truncated file path"))?;
            let size: i64 = lines
                .next()
                .ok_or_else(|| corrupt("truncated file size"))?
                .trim()
                .parse()
                .map_err(|_| corrupt("bad file size"))?;
            let ticks: i64 = lines
                .next()
                .ok_or_else(|| corrupt("truncated file mtime"))?
                .trim()
                .parse()
                .map_err(|_| corrupt("bad file mtime"))?;
            let checksum = lines
                .next()
                .ok_or_else(|| corrupt("truncated file checksum"))?;
            if manifest.paths.contains_key(path) {
                return Err(corrupt("duplicate file path"));
            }
            manifest.files.insert(
                id.to_string(),
                FileRecord {
                    path: path.to_string(),
                    size,
                    modified: from_ticks(ticks)?,
                    checksum: checksum.to_string(),
                },
            );
            manifest.paths.insert(path.to_string(), id.to_string());
        }

        Ok(manifest)
    }

    pub fn to_text(&self) -> Result<String, ManifestError> {
        let mut out = String::new();
        out.push_str(&self.cursor);
        out.push('\n');

        out.push_str(&format!("{}\n", self.folders.len()));
        let mut folders: Vec<(&String, &String)> = self.folders.iter().collect();
        folders.sort_by(|a, b| a.1.cmp(b.1));
        for (id, path) in folders {
            check_persistable(id)?;
            check_persistable(path)?;
            out.push_str(&format!("{id}\n{path}\n"));
        }

        out.push_str(&format!("{}\n", self.files.len()));
        let mut files: Vec<(&String, &FileRecord)> = self.files.iter().collect();
        files.sort_by(|a, b| a.1.path.cmp(&b.1.path));
        for (id, record) in files {
            check_persistable(id)?;
            check_persistable(&record.path)?;
            check_persistable(&record.checksum)?;
            out.push_str(&format!(
                "{id}\n{}\n{}\n{}\n{}\n",
                record.path,
                record.size,
                ticks_from(record.modified),
                record.checksum
            ));
        }
        Ok(out)
    }

    pub fn load_file(path: &Path, tag: RepoTag) -> Result<Manifest, ManifestError> {
        let content = std::fs::read_to_string(path)?;
        Self::load(&content, tag)
    }

    /// Writes through a `.partial` sibling and renames into place, then
    /// clears the dirty flag.
    pub fn save_file(&mut self, path: &Path) -> Result<(), ManifestError> {
        let text = self.to_text()?;
        let partial = path.with_extension("partial");
        std::fs::write(&partial, text)?;
        std::fs::rename(&partial, path)?;
        self.dirty = false;
        Ok(())
    }

    /// Consistency check over the id maps and the reverse index. Used by
    /// tests and by the processor's fatal-error path.
    pub fn check_consistency(&self) -> Result<(), String> {
        for (id, record) in &self.files {
            match self.paths.get(&record.path) {
                Some(mapped) if mapped == id => {}
                _ => return Err(format!("file path {:?} does not map back to {id}", record.path)),
            }
        }
        for (id, path) in &self.folders {
            match self.paths.get(path) {
                Some(mapped) if mapped == id => {}
                _ => return Err(format!("folder path {path:?} does not map back to {id}")),
            }
        }
        if self.paths.len() != self.files.len() + self.folders.len() {
            return Err(format!(
                "reverse index has {} entries for {} files and {} folders",
                self.paths.len(),
                self.files.len(),
                self.folders.len()
            ));
        }
        Ok(())
    }
}

fn resolve_folder_path(
    id: &str,
    raw: &HashMap<String, (String, Option<String>)>,
    resolved: &mut HashMap<String, Option<String>>,
) -> Option<String> {
    if let Some(path) = resolved.get(id) {
        return path.clone();
    }
    // Mark in-progress so a parent cycle terminates as unplaceable.
    resolved.insert(id.to_string(), None);

    let (name, parent) = raw.get(id)?;
    let parent_id = parent.as_ref()?;
    let parent_path = resolve_folder_path(parent_id, raw, resolved)?;
    let path = paths::join(&parent_path, name);
    resolved.insert(id.to_string(), Some(path.clone()));
    Some(path)
}

fn scan_local_dir(
    dir: &Path,
    root: &Path,
    manifest: &mut Manifest,
    hydrate: Option<&Manifest>,
) -> Result<(), ManifestError> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let metadata = entry.metadata()?;
        if metadata.file_type().is_symlink() {
            continue;
        }
        let Ok(relative) = paths::relative_from_local(root, &entry.path()) else {
            continue;
        };

        if metadata.is_dir() {
            manifest.insert_folder(relative.clone(), relative);
            scan_local_dir(&entry.path(), root, manifest, hydrate)?;
            continue;
        }

        let size = metadata.len() as i64;
        let modified = metadata
            .modified()
            .map(OffsetDateTime::from)
            .unwrap_or(OffsetDateTime::UNIX_EPOCH);
        let checksum = hydrated_checksum(&relative, size, modified, hydrate)
            .unwrap_or_else(|| checksum::file_md5_or_unreadable(&entry.path()));
        manifest.insert_file(
            relative.clone(),
            FileRecord {
                path: relative,
                size,
                modified,
                checksum,
            },
        );
    }
    Ok(())
}

fn hydrated_checksum(
    path: &str,
    size: i64,
    modified: OffsetDateTime,
    hydrate: Option<&Manifest>,
) -> Option<String> {
    let record = hydrate?.file_at_path(path)?;
    (record.size == size && ticks_from(record.modified) == ticks_from(modified))
        .then(|| record.checksum.clone())
}

/// Same-directory renames are reported as Renamed; anything else is Moved.
fn move_kind(old_path: &str, new_path: &str) -> ChangeKind {
    let new_parent = paths::parent_of(new_path).unwrap_or("");
    if new_parent.is_empty() && !old_path.contains('/') {
        return ChangeKind::Renamed;
    }
    if old_path.starts_with(&format!("{new_parent}/")) {
        ChangeKind::Renamed
    } else {
        ChangeKind::Moved
    }
}

fn cloud_checksum(file: &DriveFile) -> String {
    file.md5_checksum
        .clone()
        .unwrap_or_else(|| checksum::UNKNOWN_CHECKSUM.to_string())
}

pub(crate) fn parse_modified(value: Option<&str>) -> OffsetDateTime {
    value
        .and_then(|raw| OffsetDateTime::parse(raw, &Rfc3339).ok())
        .unwrap_or(OffsetDateTime::UNIX_EPOCH)
}

pub(crate) fn ticks_from(value: OffsetDateTime) -> i64 {
    (value.unix_timestamp_nanos() / 100) as i64
}

pub(crate) fn from_ticks(ticks: i64) -> Result<OffsetDateTime, ManifestError> {
    OffsetDateTime::from_unix_timestamp_nanos(ticks as i128 * 100)
        .map_err(|_| ManifestError::Parse(format!("mtime out of range: {ticks}")))
}

fn truncate_to_ticks(value: OffsetDateTime) -> OffsetDateTime {
    from_ticks(ticks_from(value)).unwrap_or(OffsetDateTime::UNIX_EPOCH)
}

fn check_persistable(value: &str) -> Result<(), ManifestError> {
    if value.contains('\n') || value.contains('\r') {
        return Err(ManifestError::UnsupportedPath(value.to_string()));
    }
    Ok(())
}

#[cfg(test)]
#[path = "manifest_tests.rs"]
mod tests;
