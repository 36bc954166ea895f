use std::fmt;
use std::hash::{Hash, Hasher};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChangeCodecError {
    #[error("unknown repository tag: {0}")]
    UnknownTag(String),
    #[error("unknown change kind: {0}")]
    UnknownKind(String),
    #[error("malformed change record: {0}")]
    Malformed(String),
    #[error("path contains an unsupported character: {0:?}")]
    UnsupportedPath(String),
}

/// Stable identity of a repository, used as the change-record prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RepoTag {
    GoogleDrive,
    LocalDrive,
}

impl RepoTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            RepoTag::GoogleDrive => "google_drive",
            RepoTag::LocalDrive => "local_drive",
        }
    }

    pub fn parse(value: &str) -> Result<Self, ChangeCodecError> {
        match value {
            "google_drive" => Ok(RepoTag::GoogleDrive),
            "local_drive" => Ok(RepoTag::LocalDrive),
            other => Err(ChangeCodecError::UnknownTag(other.to_string())),
        }
    }

    pub fn other(&self) -> Self {
        match self {
            RepoTag::GoogleDrive => RepoTag::LocalDrive,
            RepoTag::LocalDrive => RepoTag::GoogleDrive,
        }
    }
}

impl fmt::Display for RepoTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Created,
    Modified,
    Moved,
    Renamed,
    Removed,
    MovedAndModified,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Created => "Created",
            ChangeKind::Modified => "Modified",
            ChangeKind::Moved => "Moved",
            ChangeKind::Renamed => "Renamed",
            ChangeKind::Removed => "Removed",
            ChangeKind::MovedAndModified => "MovedAndModified",
        }
    }

    pub fn parse(value: &str) -> Result<Self, ChangeCodecError> {
        match value {
            "Created" => Ok(ChangeKind::Created),
            "Modified" => Ok(ChangeKind::Modified),
            "Moved" => Ok(ChangeKind::Moved),
            "Renamed" => Ok(ChangeKind::Renamed),
            "Removed" => Ok(ChangeKind::Removed),
            "MovedAndModified" => Ok(ChangeKind::MovedAndModified),
            other => Err(ChangeCodecError::UnknownKind(other.to_string())),
        }
    }

    /// Moved, Renamed and MovedAndModified carry the previous path.
    pub fn requires_old_path(&self) -> bool {
        matches!(
            self,
            ChangeKind::Moved | ChangeKind::Renamed | ChangeKind::MovedAndModified
        )
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical, source-agnostic record of one observed mutation.
///
/// Equality and hashing deliberately ignore `source` and the old-path
/// fields: the same logical event observed from either side must compare
/// equal so the processor can deduplicate echoes.
#[derive(Debug, Clone)]
pub struct ChangeInfo {
    pub source: RepoTag,
    pub kind: ChangeKind,
    pub path: String,
    pub old_path: Option<String>,
    pub is_folder: bool,
    pub checksum: String,
    pub old_checksum: Option<String>,
}

impl ChangeInfo {
    pub fn new(
        source: RepoTag,
        kind: ChangeKind,
        path: impl Into<String>,
        checksum: impl Into<String>,
        is_folder: bool,
    ) -> Self {
        Self {
            source,
            kind,
            path: path.into(),
            old_path: None,
            is_folder,
            checksum: checksum.into(),
            old_checksum: None,
        }
    }

    pub fn with_old(mut self, old_path: impl Into<String>, old_checksum: Option<String>) -> Self {
        self.old_path = Some(old_path.into());
        self.old_checksum = old_checksum;
        self
    }

    /// Serializes to the one-line queue record:
    /// `<tag> <kind> <checksum> <is-folder> "<new path>" ["<old path>"]`
    pub fn to_line(&self) -> Result<String, ChangeCodecError> {
        check_encodable(&self.path)?;
        let mut line = format!(
            "{} {} {} {} \"{}\"",
            self.source, self.kind, self.checksum, self.is_folder, self.path
        );
        if let Some(old) = &self.old_path {
            check_encodable(old)?;
            line.push_str(&format!(" \"{old}\""));
        }
        Ok(line)
    }

    pub fn from_line(line: &str) -> Result<Self, ChangeCodecError> {
        let malformed = || ChangeCodecError::Malformed(line.to_string());

        let mut parts = line.splitn(5, ' ');
        let source = RepoTag::parse(parts.next().ok_or_else(malformed)?)?;
        let kind = ChangeKind::parse(parts.next().ok_or_else(malformed)?)?;
        let checksum = parts.next().ok_or_else(malformed)?.to_string();
        let is_folder = match parts.next().ok_or_else(malformed)? {
            "true" => true,
            "false" => false,
            _ => return Err(malformed()),
        };

        let rest = parts.next().ok_or_else(malformed)?;
        let (path, rest) = take_quoted(rest).ok_or_else(malformed)?;
        let old_path = if rest.is_empty() {
            None
        } else {
            let rest = rest.strip_prefix(' ').ok_or_else(malformed)?;
            let (old, tail) = take_quoted(rest).ok_or_else(malformed)?;
            if !tail.is_empty() {
                return Err(malformed());
            }
            Some(old.to_string())
        };

        if kind.requires_old_path() && old_path.is_none() {
            return Err(malformed());
        }

        Ok(Self {
            source,
            kind,
            path: path.to_string(),
            old_path,
            is_folder,
            checksum,
            old_checksum: None,
        })
    }
}

impl PartialEq for ChangeInfo {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
            && self.path == other.path
            && self.checksum == other.checksum
            && self.is_folder == other.is_folder
    }
}

impl Eq for ChangeInfo {}

impl Hash for ChangeInfo {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.kind.hash(state);
        self.path.hash(state);
        self.checksum.hash(state);
        self.is_folder.hash(state);
    }
}

impl fmt::Display for ChangeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.old_path {
            Some(old) => write!(f, "{} {:?} -> {:?}", self.kind, old, self.path),
            None => write!(f, "{} {:?}", self.kind, self.path),
        }
    }
}

fn check_encodable(path: &str) -> Result<(), ChangeCodecError> {
    if path.contains('"') || path.contains('\n') {
        return Err(ChangeCodecError::UnsupportedPath(path.to_string()));
    }
    Ok(())
}

fn take_quoted(input: &str) -> Option<(&str, &str)> {
    let rest = input.strip_prefix('"')?;
    let end = rest.find('"')?;
    Some((&rest[..end], &rest[end + 1..]))
}

/// Renders the persisted queue file: a length line followed by one record
/// per line.
pub fn encode_queue<'a>(
    changes: impl ExactSizeIterator<Item = &'a ChangeInfo>,
) -> Result<String, ChangeCodecError> {
    let mut out = format!("{}\n", changes.len());
    for change in changes {
        out.push_str(&change.to_line()?);
        out.push('\n');
    }
    Ok(out)
}

pub fn decode_queue(content: &str) -> Result<Vec<ChangeInfo>, ChangeCodecError> {
    let mut lines = content.lines();
    let count: usize = lines
        .next()
        .ok_or_else(|| ChangeCodecError::Malformed("empty queue file".to_string()))?
        .trim()
        .parse()
        .map_err(|_| ChangeCodecError::Malformed("bad queue length".to_string()))?;

    let mut changes = Vec::with_capacity(count);
    for _ in 0..count {
        let line = lines
            .next()
            .ok_or_else(|| ChangeCodecError::Malformed("truncated queue file".to_string()))?;
        changes.push(ChangeInfo::from_line(line)?);
    }
    Ok(changes)
}
