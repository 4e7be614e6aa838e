// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! The resource cache.
//!
//! Artifacts are memoized by physical URL with single-flight build
//! semantics: while a build for a URL is in flight, concurrent requests
//! for it wait on that build and share its result, including its error.
//! Failed builds are not retained, so the next request rebuilds.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::watch;
use url::Url;

use crate::error::{ErrorList, PackageError, PackageErrorKind};
use crate::exchange::SignedExchange;

/// A packaged resource: the signed exchange plus its serialized form and
/// materialization metadata.
#[derive(Debug)]
pub struct Artifact {
    pub physical_url: Url,
    pub exchange: SignedExchange,
    pub serialized: Bytes,
    /// Where the filesystem tier materialized the exchange, if it did.
    pub file_path: Option<PathBuf>,
}

pub type BuildResult = Result<Arc<Artifact>, Arc<ErrorList>>;

enum Slot {
    Ready(Arc<Artifact>),
    Building(watch::Receiver<Option<BuildResult>>),
}

/// What `lookup` observed for a URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    Ready,
    Building,
    Absent,
}

/// The outcome of claiming a URL for building.
pub enum Claim {
    /// An artifact is already cached.
    Ready(Arc<Artifact>),
    /// Another build is in flight; wait on the receiver.
    Wait(watch::Receiver<Option<BuildResult>>),
    /// The caller owns the build and must finish (or drop) the lease.
    Build(Lease),
}

type SlotMap = Arc<Mutex<HashMap<Url, Slot>>>;

/// Exclusive permission to build one URL.
///
/// Dropping an unfinished lease wakes all waiters with a terminal error so
/// cancellation cannot strand them.
pub struct Lease {
    url: Url,
    tx: watch::Sender<Option<BuildResult>>,
    slots: SlotMap,
    finished: bool,
}

impl Lease {
    pub fn url(&self) -> &Url {
        &self.url
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        self.slots
            .lock()
            .expect("cache lock poisoned")
            .remove(&self.url);
        let error = ErrorList::single(PackageError::new(
            self.url.clone(),
            PackageErrorKind::CacheBuild("build was abandoned".to_string()),
        ));
        let _ = self.tx.send(Some(Err(Arc::new(error))));
    }
}

/// Optional filesystem materialization of serialized exchanges.
#[derive(Debug, Clone)]
pub struct FileWriteConfig {
    pub base_dir: PathBuf,
    pub extension: String,
}

impl FileWriteConfig {
    /// The target path for a physical URL: the URL path relative to the
    /// base directory, with the extension appended.
    fn target_path(&self, url: &Url) -> PathBuf {
        let relative = url.path().trim_start_matches('/');
        self.base_dir.join(format!("{relative}{}", self.extension))
    }
}

pub struct ResourceCache {
    slots: SlotMap,
    filewrite: Option<FileWriteConfig>,
}

impl ResourceCache {
    pub fn new(filewrite: Option<FileWriteConfig>) -> Self {
        ResourceCache {
            slots: Arc::new(Mutex::new(HashMap::new())),
            filewrite,
        }
    }

    pub fn lookup(&self, url: &Url) -> Lookup {
        match self.slots.lock().expect("cache lock poisoned").get(url) {
            Some(Slot::Ready(_)) => Lookup::Ready,
            Some(Slot::Building(_)) => Lookup::Building,
            None => Lookup::Absent,
        }
    }

    /// Atomically look up `url` or claim the right to build it.
    pub fn claim(&self, url: &Url) -> Claim {
        let mut slots = self.slots.lock().expect("cache lock poisoned");
        match slots.get(url) {
            Some(Slot::Ready(artifact)) => Claim::Ready(artifact.clone()),
            Some(Slot::Building(rx)) => Claim::Wait(rx.clone()),
            None => {
                let (tx, rx) = watch::channel(None);
                slots.insert(url.clone(), Slot::Building(rx));
                Claim::Build(Lease {
                    url: url.clone(),
                    tx,
                    slots: self.slots.clone(),
                    finished: false,
                })
            }
        }
    }

    /// Publish a build result, waking all waiters. Successful artifacts are
    /// retained and materialized to the filesystem tier when configured.
    pub async fn finish_build(&self, mut lease: Lease, result: BuildResult) -> BuildResult {
        let result = match result {
            Ok(artifact) => Ok(self.materialize(artifact).await),
            Err(error) => Err(error),
        };

        {
            let mut slots = self.slots.lock().expect("cache lock poisoned");
            match &result {
                Ok(artifact) => {
                    slots.insert(lease.url.clone(), Slot::Ready(artifact.clone()));
                }
                Err(_) => {
                    slots.remove(&lease.url);
                }
            }
        }
        lease.finished = true;
        let _ = lease.tx.send(Some(result.clone()));
        result
    }

    /// Wait for an in-flight build to publish its result.
    pub async fn wait(mut rx: watch::Receiver<Option<BuildResult>>) -> BuildResult {
        loop {
            if let Some(result) = rx.borrow().clone() {
                return result;
            }
            if rx.changed().await.is_err() {
                // The builder vanished without publishing; Lease::drop
                // should have sent an error first, so this is a fallback.
                return Err(Arc::new(ErrorList::default()));
            }
        }
    }

    /// Cached artifact for `url`, if one is ready.
    pub fn get(&self, url: &Url) -> Option<Arc<Artifact>> {
        match self.slots.lock().expect("cache lock poisoned").get(url) {
            Some(Slot::Ready(artifact)) => Some(artifact.clone()),
            _ => None,
        }
    }

    async fn materialize(&self, artifact: Arc<Artifact>) -> Arc<Artifact> {
        let Some(filewrite) = &self.filewrite else {
            return artifact;
        };
        let path = filewrite.target_path(&artifact.physical_url);
        match write_file(&path, &artifact.serialized).await {
            Ok(()) => {
                tracing::debug!(path = %path.display(), "Materialized signed exchange");
                Arc::new(Artifact {
                    physical_url: artifact.physical_url.clone(),
                    exchange: artifact.exchange.clone(),
                    serialized: artifact.serialized.clone(),
                    file_path: Some(path),
                })
            }
            Err(error) => {
                // The in-memory artifact is still good; serving beats
                // failing the build over a disk problem.
                tracing::error!(?error, path = %path.display(), "Failed to materialize exchange");
                artifact
            }
        }
    }
}

async fn write_file(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, contents).await
}
