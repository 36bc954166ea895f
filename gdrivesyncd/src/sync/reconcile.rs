use std::collections::{HashMap, HashSet};

use super::change::{ChangeInfo, ChangeKind, RepoTag};
use super::checksum;
use super::manifest::{FileRecord, Manifest};
use super::paths;
use super::processor::ChangeProcessor;
use super::repository::Repositories;

/// Everything beneath this prefix flows one-way, cloud to local; local
/// edits under it are overwritten, including during reconciliation.
pub const CLOUD_PRECEDENCE_PREFIX: &str = "Mirrored";

struct TreeSnapshot {
    files: Vec<FileRecord>,
    folders: Vec<String>,
    paths: HashSet<String>,
}

impl TreeSnapshot {
    fn of(manifest: &Manifest) -> Self {
        let files: Vec<FileRecord> = manifest.files().map(|(_, record)| record.clone()).collect();
        let folders: Vec<String> = manifest
            .folders()
            .map(|(_, path)| path.clone())
            .filter(|path| !path.is_empty())
            .collect();
        let paths = files
            .iter()
            .map(|record| record.path.clone())
            .chain(folders.iter().cloned())
            .collect();
        Self {
            files,
            folders,
            paths,
        }
    }
}

/// Startup pass closing the gap left while the engine was not running.
/// The cloud side is protected by the persisted cursor; the local side is
/// not, so divergence is resolved by set comparison over both manifests.
///
/// `remote_precedence` is true when the cloud manifest was freshly built
/// rather than resumed from disk.
pub async fn reconcile(
    repositories: &Repositories,
    processor: &ChangeProcessor,
    remote_precedence: bool,
) {
    let cloud = TreeSnapshot::of(&*repositories.cloud.manifest().lock().await);
    let local = TreeSnapshot::of(&*repositories.local.manifest().lock().await);

    let cloud_phase = plan_cloud_phase(&cloud, &local, remote_precedence);
    eprintln!(
        "[gdrivesyncd] reconcile: {} change(s) from the cloud sweep",
        cloud_phase.len()
    );
    for change in cloud_phase {
        processor.queue_change(change);
    }
    processor.await_idle().await;

    // The cloud sweep may have grown the local tree; re-snapshot before
    // sweeping the local side.
    let local = TreeSnapshot::of(&*repositories.local.manifest().lock().await);
    let cloud = TreeSnapshot::of(&*repositories.cloud.manifest().lock().await);
    let local_phase = plan_local_phase(&local, &cloud);
    eprintln!(
        "[gdrivesyncd] reconcile: {} change(s) from the local sweep",
        local_phase.len()
    );
    for change in local_phase {
        processor.queue_change(change);
    }
    processor.await_idle().await;
}

/// Cloud entries with no local counterpart: download them, unless the
/// resumed cursor says the local deletion is the newer fact.
fn plan_cloud_phase(
    cloud: &TreeSnapshot,
    local: &TreeSnapshot,
    remote_precedence: bool,
) -> Vec<ChangeInfo> {
    let mut plan = Vec::new();

    for record in &cloud.files {
        if local.paths.contains(&record.path) {
            continue;
        }
        if paths::is_under(&record.path, CLOUD_PRECEDENCE_PREFIX) || remote_precedence {
            plan.push(ChangeInfo::new(
                RepoTag::GoogleDrive,
                ChangeKind::Created,
                record.path.clone(),
                record.checksum.clone(),
                false,
            ));
        } else {
            plan.push(ChangeInfo::new(
                RepoTag::LocalDrive,
                ChangeKind::Removed,
                record.path.clone(),
                record.checksum.clone(),
                false,
            ));
        }
    }

    for folder in &cloud.folders {
        if local.paths.contains(folder) {
            continue;
        }
        // The prefix root itself is exempt from the removal branch.
        if paths::is_under(folder, CLOUD_PRECEDENCE_PREFIX) || remote_precedence {
            plan.push(ChangeInfo::new(
                RepoTag::GoogleDrive,
                ChangeKind::Created,
                folder.clone(),
                checksum::UNKNOWN_CHECKSUM,
                true,
            ));
        } else {
            plan.push(ChangeInfo::new(
                RepoTag::LocalDrive,
                ChangeKind::Removed,
                folder.clone(),
                checksum::UNKNOWN_CHECKSUM,
                true,
            ));
        }
    }

    plan
}

/// Local entries missing or different on the cloud side: upload them,
/// except under the downstream-only prefix where the cloud is truth.
fn plan_local_phase(local: &TreeSnapshot, cloud: &TreeSnapshot) -> Vec<ChangeInfo> {
    let mut plan = Vec::new();

    // Parents before children so cloud folder creation never dangles.
    let mut folders = local.folders.clone();
    folders.sort_by_key(|path| (path.matches('/').count(), path.clone()));
    for folder in folders {
        if cloud.paths.contains(&folder) {
            continue;
        }
        if folder != CLOUD_PRECEDENCE_PREFIX && paths::is_under(&folder, CLOUD_PRECEDENCE_PREFIX) {
            plan.push(ChangeInfo::new(
                RepoTag::GoogleDrive,
                ChangeKind::Removed,
                folder,
                checksum::UNKNOWN_CHECKSUM,
                true,
            ));
        } else {
            plan.push(ChangeInfo::new(
                RepoTag::LocalDrive,
                ChangeKind::Created,
                folder,
                checksum::UNKNOWN_CHECKSUM,
                true,
            ));
        }
    }

    let cloud_files: HashMap<&str, &FileRecord> = cloud
        .files
        .iter()
        .map(|record| (record.path.as_str(), record))
        .collect();

    for record in &local.files {
        match cloud_files.get(record.path.as_str()) {
            None => {
                if paths::is_under(&record.path, CLOUD_PRECEDENCE_PREFIX) {
                    plan.push(ChangeInfo::new(
                        RepoTag::GoogleDrive,
                        ChangeKind::Removed,
                        record.path.clone(),
                        record.checksum.clone(),
                        false,
                    ));
                } else {
                    plan.push(ChangeInfo::new(
                        RepoTag::LocalDrive,
                        ChangeKind::Created,
                        record.path.clone(),
                        record.checksum.clone(),
                        false,
                    ));
                }
            }
            Some(cloud_record) if differs(record, cloud_record) => {
                if paths::is_under(&record.path, CLOUD_PRECEDENCE_PREFIX) {
                    plan.push(
                        ChangeInfo::new(
                            RepoTag::GoogleDrive,
                            ChangeKind::Modified,
                            record.path.clone(),
                            cloud_record.checksum.clone(),
                            false,
                        )
                        .with_old(record.path.clone(), Some(record.checksum.clone())),
                    );
                } else {
                    plan.push(
                        ChangeInfo::new(
                            RepoTag::LocalDrive,
                            ChangeKind::Modified,
                            record.path.clone(),
                            record.checksum.clone(),
                            false,
                        )
                        .with_old(record.path.clone(), Some(cloud_record.checksum.clone())),
                    );
                }
            }
            Some(_) => {}
        }
    }

    plan
}

fn differs(local: &FileRecord, cloud: &FileRecord) -> bool {
    let known = |value: &str| {
        value != checksum::UNKNOWN_CHECKSUM && value != checksum::UNREADABLE_CHECKSUM
    };
    if known(&local.checksum) && known(&cloud.checksum) {
        return local.checksum != cloud.checksum;
    }
    local.size != cloud.size
}
