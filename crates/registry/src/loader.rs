use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;

use crate::Registries;

/// Binds the registrations contained in one user module file. The
/// concrete loader depends on the deployment: a plugin host, an embedded
/// interpreter, or a compiled-in set keyed by file name.
pub trait ModuleLoader: Send + Sync {
    fn load(&self, path: &Path, registries: &Registries) -> anyhow::Result<()>;
}

#[derive(Debug, Default, PartialEq)]
pub struct ScanReport {
    pub loaded: Vec<PathBuf>,
    pub unchanged: usize,
}

/// Scans a directory of user modules and hands changed files to the
/// loader. File contents are hashed so that an unchanged module is not
/// re-bound on subsequent scans; registering under an existing name
/// replaces the binding, which makes rescans safe while iterations run.
pub struct ModuleScanner {
    dir: PathBuf,
    loader: Arc<dyn ModuleLoader>,
    seen: Mutex<HashSet<String>>,
}

impl ModuleScanner {
    pub fn new(dir: impl Into<PathBuf>, loader: Arc<dyn ModuleLoader>) -> Self {
        ModuleScanner {
            dir: dir.into(),
            loader,
            seen: Mutex::new(HashSet::new()),
        }
    }

    pub fn scan(&self, registries: &Registries) -> anyhow::Result<ScanReport> {
        let mut report = ScanReport::default();
        let mut current = HashSet::new();

        let mut paths: Vec<PathBuf> = std::fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_file())
            .collect();
        paths.sort();

        for path in paths {
            let content = std::fs::read(&path)?;
            let digest = hex::encode(Sha256::digest(&content));
            current.insert(digest.clone());

            if self.seen.lock().unwrap().contains(&digest) {
                report.unchanged += 1;
                continue;
            }

            match self.loader.load(&path, registries) {
                Ok(()) => report.loaded.push(path),
                Err(err) => {
                    tracing::error!(path = %path.display(), %err, "failed to load module");
                }
            }
        }

        *self.seen.lock().unwrap() = current;

        if !report.loaded.is_empty() {
            tracing::info!(
                loaded = report.loaded.len(),
                unchanged = report.unchanged,
                dir = %self.dir.display(),
                "loaded user modules"
            );
        }
        Ok(report)
    }

    /// Rescan on an interval until cancelled.
    pub fn watch(
        self: Arc<Self>,
        registries: Arc<Registries>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(interval) => (),
                }
                if let Err(err) = self.scan(&registries) {
                    tracing::error!(%err, "module rescan failed");
                }
            }
        })
    }
}
