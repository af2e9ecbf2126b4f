//! Kernel connection-file discovery
//!
//! Running kernels publish `kernel-*.json` connection files in the Jupyter
//! runtime directory. [`RuntimeWatcher`] follows that directory through
//! filesystem notifications and reports files appearing, changing and
//! disappearing.

use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::error::ConfigError;
use crate::message::ConnectionInfo;

/// Whether `path` names a kernel connection file (`kernel*.json`)
pub fn is_kernel_json(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.starts_with("kernel") && name.ends_with(".json"))
}

/// The Jupyter runtime directory for this user
pub fn default_runtime_dir() -> Option<PathBuf> {
    if let Some(dir) = std::env::var_os("JUPYTER_RUNTIME_DIR") {
        return Some(PathBuf::from(dir));
    }

    let home = PathBuf::from(std::env::var_os("HOME")?);
    if cfg!(target_os = "macos") {
        Some(home.join("Library/Jupyter/runtime"))
    } else {
        Some(home.join(".local/share/jupyter/runtime"))
    }
}

/// Connection files currently in `dir`, sorted by path
pub fn scan(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file() && is_kernel_json(path))
        .collect();
    files.sort();
    Ok(files)
}

/// The most recently modified connection file in `dir`
pub fn newest_connection_file(dir: &Path) -> io::Result<Option<PathBuf>> {
    let mut newest: Option<(SystemTime, PathBuf)> = None;
    for path in scan(dir)? {
        let modified = std::fs::metadata(&path)?.modified()?;
        if newest.as_ref().map_or(true, |(time, _)| modified >= *time) {
            newest = Some((modified, path));
        }
    }
    Ok(newest.map(|(_, path)| path))
}

/// A change to a connection file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeEvent {
    Added(PathBuf),
    Changed(PathBuf),
    Removed(PathBuf),
}

impl RuntimeEvent {
    pub fn path(&self) -> &Path {
        match self {
            Self::Added(path) | Self::Changed(path) | Self::Removed(path) => path,
        }
    }
}

/// Translate a filesystem event into connection-file changes
pub fn classify(event: &Event) -> Vec<RuntimeEvent> {
    let kernel_files = || event.paths.iter().filter(|path| is_kernel_json(path)).cloned();

    match &event.kind {
        EventKind::Create(_) | EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            kernel_files().map(RuntimeEvent::Added).collect()
        }
        EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            kernel_files().map(RuntimeEvent::Removed).collect()
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            // paths are [from, to]
            let mut changes = Vec::new();
            if let Some(from) = event.paths.first().filter(|path| is_kernel_json(path)) {
                changes.push(RuntimeEvent::Removed(from.clone()));
            }
            if let Some(to) = event.paths.get(1).filter(|path| is_kernel_json(path)) {
                changes.push(RuntimeEvent::Added(to.clone()));
            }
            changes
        }
        // Some backends do not say which side of a rename a path is on.
        EventKind::Modify(ModifyKind::Name(_)) => kernel_files()
            .map(|path| {
                if path.exists() {
                    RuntimeEvent::Added(path)
                } else {
                    RuntimeEvent::Removed(path)
                }
            })
            .collect(),
        EventKind::Modify(_) => kernel_files().map(RuntimeEvent::Changed).collect(),
        _ => Vec::new(),
    }
}

/// Watches a runtime directory for connection-file changes
pub struct RuntimeWatcher {
    dir: PathBuf,
    _watcher: RecommendedWatcher,
    events: mpsc::UnboundedReceiver<RuntimeEvent>,
}

impl RuntimeWatcher {
    /// Start watching `dir`. Only changes after this call are reported.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let dir = dir.into();
        let (tx, events) = mpsc::unbounded_channel();

        let mut watcher = notify::recommended_watcher(move |result: notify::Result<Event>| {
            match result {
                Ok(event) => {
                    for change in classify(&event) {
                        tracing::debug!("Runtime directory event: {:?}", change);
                        if tx.send(change).is_err() {
                            return;
                        }
                    }
                }
                Err(e) => tracing::warn!("Runtime directory watch error: {}", e),
            }
        })?;
        watcher.watch(&dir, RecursiveMode::NonRecursive)?;
        tracing::info!("Watching {} for kernel connection files", dir.display());

        Ok(Self {
            dir,
            _watcher: watcher,
            events,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Next connection-file change, or `None` once the watcher has stopped
    pub async fn next(&mut self) -> Option<RuntimeEvent> {
        self.events.recv().await
    }

    /// Wait for a connection file to be added or rewritten with loadable content.
    ///
    /// Kernels create the file before filling it in, so a file that does not
    /// parse yet is skipped until a later change.
    pub async fn next_connection_file(&mut self) -> Option<PathBuf> {
        while let Some(event) = self.next().await {
            let path = match event {
                RuntimeEvent::Added(path) | RuntimeEvent::Changed(path) => path,
                RuntimeEvent::Removed(_) => continue,
            };
            match ConnectionInfo::from_file(&path) {
                Ok(_) => return Some(path),
                Err(e) => tracing::debug!("Skipping {}: {}", path.display(), e),
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{AccessKind, CreateKind, DataChange, RemoveKind};
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(5);

    #[test]
    fn test_kernel_json_filter() {
        assert!(is_kernel_json(Path::new("/run/kernel-1234.json")));
        assert!(is_kernel_json(Path::new("kernel.json")));
        assert!(!is_kernel_json(Path::new("/run/nbserver-1.json")));
        assert!(!is_kernel_json(Path::new("/run/kernel-1234.json.bak")));
    }

    #[test]
    fn test_scan_and_newest() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("kernel-a.json");
        let new = dir.path().join("kernel-b.json");
        std::fs::write(&old, "{}").unwrap();
        std::fs::write(&new, "{}").unwrap();
        std::fs::write(dir.path().join("notebook.json"), "{}").unwrap();

        let epoch = SystemTime::UNIX_EPOCH;
        set_mtime(&old, epoch + Duration::from_secs(1_000));
        set_mtime(&new, epoch + Duration::from_secs(2_000));

        assert_eq!(scan(dir.path()).unwrap(), vec![old, new.clone()]);
        assert_eq!(newest_connection_file(dir.path()).unwrap(), Some(new));
    }

    #[test]
    fn test_classify_filters_and_maps_kinds() {
        let kernel = PathBuf::from("/run/kernel-1.json");
        let other = PathBuf::from("/run/nbserver-1.json");

        let created = Event::new(EventKind::Create(CreateKind::File))
            .add_path(kernel.clone())
            .add_path(other.clone());
        assert_eq!(classify(&created), vec![RuntimeEvent::Added(kernel.clone())]);

        let written = Event::new(EventKind::Modify(ModifyKind::Data(DataChange::Content)))
            .add_path(kernel.clone());
        assert_eq!(classify(&written), vec![RuntimeEvent::Changed(kernel.clone())]);

        let removed = Event::new(EventKind::Remove(RemoveKind::File)).add_path(kernel.clone());
        assert_eq!(classify(&removed), vec![RuntimeEvent::Removed(kernel.clone())]);

        let renamed = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
            .add_path(PathBuf::from("/run/kernel-1.json.tmp"))
            .add_path(kernel.clone());
        assert_eq!(classify(&renamed), vec![RuntimeEvent::Added(kernel.clone())]);

        let opened = Event::new(EventKind::Access(AccessKind::Any)).add_path(kernel);
        assert!(classify(&opened).is_empty());
    }

    #[tokio::test]
    async fn test_watcher_reports_file_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let mut watcher = RuntimeWatcher::new(dir.path()).unwrap();

        let kernel = dir.path().join("kernel-1.json");
        std::fs::write(dir.path().join("notebook.json"), "{}").unwrap();
        std::fs::write(&kernel, "{}").unwrap();

        let first = tokio::time::timeout(WAIT, watcher.next()).await.unwrap();
        assert_eq!(first, Some(RuntimeEvent::Added(kernel.clone())));

        std::fs::remove_file(&kernel).unwrap();
        let removed = tokio::time::timeout(WAIT, async {
            loop {
                match watcher.next().await {
                    Some(RuntimeEvent::Removed(path)) => return path,
                    Some(_) => continue,
                    None => panic!("watcher stopped"),
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(removed, kernel);
    }

    #[tokio::test]
    async fn test_next_connection_file_skips_unloadable() {
        let dir = tempfile::tempdir().unwrap();
        let mut watcher = RuntimeWatcher::new(dir.path()).unwrap();

        let kernel = dir.path().join("kernel-2.json");
        std::fs::write(dir.path().join("kernel-broken.json"), "{").unwrap();
        std::fs::write(
            &kernel,
            r#"{"ip": "127.0.0.1", "transport": "tcp", "signature_scheme": "hmac-sha256",
                "key": "k", "shell_port": 1, "iopub_port": 2, "stdin_port": 3,
                "control_port": 4, "hb_port": 5}"#,
        )
        .unwrap();

        let found = tokio::time::timeout(WAIT, watcher.next_connection_file())
            .await
            .unwrap();
        assert_eq!(found, Some(kernel));
    }

    fn set_mtime(path: &Path, time: SystemTime) {
        std::fs::File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(time)
            .unwrap();
    }
}
