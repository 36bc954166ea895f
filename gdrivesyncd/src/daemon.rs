use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use gdrive_core::DriveClient;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::credentials;
use crate::sync::change::RepoTag;
use crate::sync::cloud_observer::CloudObserver;
use crate::sync::local_observer::LocalObserver;
use crate::sync::manifest::Manifest;
use crate::sync::processor::ChangeProcessor;
use crate::sync::reconcile;
use crate::sync::repository::{
    CloudRepository, LocalRepository, Repositories, SelfChangeLedger, SyncRepository,
};

pub const GOOGLE_DRIVE_MANIFEST_FILE: &str = "google_drive_manifest";
pub const LOCAL_DRIVE_MANIFEST_FILE: &str = "local_drive_manifest";

const DEFAULT_SYNC_DIR_NAME: &str = "Google Drive";

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub sync_root: PathBuf,
    pub work_dir: PathBuf,
}

impl DaemonConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let home = dirs::home_dir().context("home directory is unavailable")?;
        let sync_root = std::env::var("GDRIVESYNC_ROOT")
            .ok()
            .map(|value| expand_with_home(&value, &home))
            .unwrap_or_else(|| home.join(DEFAULT_SYNC_DIR_NAME));
        let work_dir = match std::env::var("GDRIVESYNC_WORK_DIR") {
            Ok(value) => expand_with_home(&value, &home),
            Err(_) => std::env::current_dir().context("working directory is unavailable")?,
        };
        Ok(Self {
            sync_root,
            work_dir,
        })
    }
}

pub struct DaemonRuntime {
    config: DaemonConfig,
    client: DriveClient,
    repositories: Arc<Repositories>,
    processor: Arc<ChangeProcessor>,
    remote_precedence: bool,
    stop: CancellationToken,
}

impl DaemonRuntime {
    /// Loads or builds both manifests, wires the repositories and reloads
    /// any persisted queue. Network access happens here (token resolution,
    /// root lookup, possibly the full cloud walk).
    pub async fn bootstrap(config: DaemonConfig) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&config.sync_root)
            .await
            .with_context(|| format!("failed to create sync root at {:?}", config.sync_root))?;
        tokio::fs::create_dir_all(&config.work_dir)
            .await
            .with_context(|| format!("failed to create work dir at {:?}", config.work_dir))?;

        let token = credentials::resolve_access_token(&config.work_dir)
            .await
            .context("failed to resolve an access token")?;
        let client = DriveClient::new(token).context("failed to build the Drive client")?;
        let root = client
            .get_file("root", "id,name")
            .await
            .context("failed to resolve the Drive root")?;

        let cloud_manifest_path = config.work_dir.join(GOOGLE_DRIVE_MANIFEST_FILE);
        let (mut cloud_manifest, remote_precedence) =
            match Manifest::load_file(&cloud_manifest_path, RepoTag::GoogleDrive) {
                Ok(manifest) => (manifest, false),
                Err(err) => {
                    eprintln!(
                        "[{}] manifest unavailable ({err}), scanning the cloud tree",
                        RepoTag::GoogleDrive
                    );
                    let manifest = Manifest::build_from_cloud(&client, &root.id)
                        .await
                        .context("failed to scan the cloud tree")?;
                    (manifest, true)
                }
            };
        cloud_manifest
            .save_file(&cloud_manifest_path)
            .context("failed to persist the cloud manifest")?;

        let local_manifest_path = config.work_dir.join(LOCAL_DRIVE_MANIFEST_FILE);
        let hydrate = Manifest::load_file(&local_manifest_path, RepoTag::LocalDrive).ok();
        let mut local_manifest = Manifest::build_from_local(&config.sync_root, hydrate.as_ref())
            .context("failed to scan the local tree")?;
        local_manifest
            .save_file(&local_manifest_path)
            .context("failed to persist the local manifest")?;

        let stop = CancellationToken::new();
        let processor = Arc::new(ChangeProcessor::new(&config.work_dir, stop.clone()));

        let repositories = Arc::new(Repositories {
            cloud: SyncRepository::Cloud(CloudRepository::new(
                client.clone(),
                Arc::new(Mutex::new(cloud_manifest)),
                Arc::new(SelfChangeLedger::new()),
                root.id,
            )),
            local: SyncRepository::Local(LocalRepository::new(
                config.sync_root.clone(),
                Arc::new(Mutex::new(local_manifest)),
                Arc::new(SelfChangeLedger::new()),
            )),
        });

        Ok(Self {
            config,
            client,
            repositories,
            processor,
            remote_precedence,
            stop,
        })
    }

    /// Starts the processor, the cloud poller, one reconciliation pass and
    /// the local watcher, then runs until `shutdown` fires. Stop is
    /// synchronous: every task is awaited before this returns.
    pub async fn run(self, shutdown: CancellationToken) -> anyhow::Result<()> {
        eprintln!(
            "[gdrivesyncd] started: sync_root={}, work_dir={}",
            self.config.sync_root.display(),
            self.config.work_dir.display()
        );

        let processor_handle = {
            let processor = Arc::clone(&self.processor);
            let repositories = Arc::clone(&self.repositories);
            let work_dir = self.config.work_dir.clone();
            tokio::spawn(async move {
                processor.run_supervised(&repositories, &work_dir).await;
            })
        };

        let (cloud_observer, mut cloud_idle) = CloudObserver::new(
            self.client.clone(),
            Arc::clone(self.repositories.cloud.manifest()),
            Arc::clone(&self.processor),
            self.config.work_dir.join(GOOGLE_DRIVE_MANIFEST_FILE),
            self.stop.clone(),
        );
        let cloud_handle = tokio::spawn(async move { cloud_observer.run().await });

        // Reconciliation runs once the feed has drained to idle, so the
        // cursor-protected cloud state is current before the divergence
        // sweep.
        let feed_idled = tokio::select! {
            result = cloud_idle.wait_for(|idle| *idle) => result.is_ok(),
            _ = shutdown.cancelled() => false,
            _ = tokio::signal::ctrl_c() => false,
        };
        if feed_idled {
            reconcile::reconcile(&self.repositories, &self.processor, self.remote_precedence).await;
            eprintln!("[gdrivesyncd] reconciliation finished");
        }

        let local_observer = Arc::new(LocalObserver::new(
            self.config.sync_root.clone(),
            Arc::clone(self.repositories.local.manifest()),
            Arc::clone(local_ledger(&self.repositories)),
            Arc::clone(&self.processor),
            self.config.work_dir.join(LOCAL_DRIVE_MANIFEST_FILE),
            self.stop.clone(),
        ));
        let watcher = match local_observer.start_watcher() {
            Ok(watcher) => Some(watcher),
            Err(err) => {
                eprintln!("[{}] failed to start the watcher: {err}", RepoTag::LocalDrive);
                None
            }
        };
        let local_handle = {
            let observer = Arc::clone(&local_observer);
            tokio::spawn(async move { observer.run().await })
        };

        if !self.stop.is_cancelled() && !shutdown.is_cancelled() {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                result = tokio::signal::ctrl_c() => {
                    result.context("failed waiting for the shutdown signal")?;
                }
            }
        }

        eprintln!("[gdrivesyncd] stopping");
        self.stop.cancel();
        let _ = processor_handle.await;
        let _ = cloud_handle.await;
        let _ = local_handle.await;
        drop(watcher);

        for repository in self.repositories.all() {
            let path = match repository.tag() {
                RepoTag::GoogleDrive => self.config.work_dir.join(GOOGLE_DRIVE_MANIFEST_FILE),
                RepoTag::LocalDrive => self.config.work_dir.join(LOCAL_DRIVE_MANIFEST_FILE),
            };
            let mut manifest = repository.manifest().lock().await;
            if manifest.is_dirty()
                && let Err(err) = manifest.save_file(&path)
            {
                eprintln!("[{}] failed to save manifest on shutdown: {err}", repository.tag());
            }
        }

        Ok(())
    }
}

fn local_ledger(repositories: &Repositories) -> &Arc<SelfChangeLedger> {
    match &repositories.local {
        SyncRepository::Local(repo) => repo.ledger(),
        SyncRepository::Cloud(_) => unreachable!("local slot always holds the local repository"),
    }
}

fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    if value == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(value)
}
