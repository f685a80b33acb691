use crate::core::interfaces::FileWatcher;
use crate::utils::{KilnError, Logger, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

/// File watcher backed by `notify`.
///
/// Watches the parent directory of every added file (editors often replace
/// files instead of writing them in place) and forwards changes to files in
/// the watch set over a channel.
pub struct NotifyWatcher {
    watcher: Mutex<Option<RecommendedWatcher>>,
    files: Arc<Mutex<HashSet<PathBuf>>>,
    /// Directory -> number of watched files inside it
    dirs: Mutex<HashMap<PathBuf, usize>>,
}

impl NotifyWatcher {
    pub fn new() -> Result<(Self, UnboundedReceiver<PathBuf>)> {
        let (tx, rx) = unbounded_channel();
        let files: Arc<Mutex<HashSet<PathBuf>>> = Arc::new(Mutex::new(HashSet::new()));

        let watched = files.clone();
        let watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => forward(&event, &watched, &tx),
                Err(e) => Logger::warn(&format!("Watch error: {}", e)),
            },
            notify::Config::default(),
        )
        .map_err(|e| KilnError::build(format!("Failed to create watcher: {}", e)))?;

        Ok((
            Self {
                watcher: Mutex::new(Some(watcher)),
                files,
                dirs: Mutex::new(HashMap::new()),
            },
            rx,
        ))
    }

    pub fn is_watching(&self, path: &Path) -> bool {
        self.files.lock().contains(path)
    }
}

fn forward(event: &Event, watched: &Mutex<HashSet<PathBuf>>, tx: &UnboundedSender<PathBuf>) {
    if matches!(event.kind, EventKind::Access(_) | EventKind::Other) {
        return;
    }

    let files = watched.lock();
    for path in &event.paths {
        if files.contains(path) {
            let _ = tx.send(path.clone());
        }
    }
}

impl FileWatcher for NotifyWatcher {
    fn add(&self, path: &Path) -> Result<()> {
        if !self.files.lock().insert(path.to_path_buf()) {
            return Ok(());
        }

        let Some(dir) = path.parent() else {
            return Ok(());
        };
        let mut dirs = self.dirs.lock();
        let count = dirs.entry(dir.to_path_buf()).or_insert(0);
        *count += 1;

        if *count == 1 {
            if let Some(watcher) = self.watcher.lock().as_mut() {
                watcher
                    .watch(dir, RecursiveMode::NonRecursive)
                    .map_err(|e| KilnError::build(format!("Failed to watch {}: {}", dir.display(), e)))?;
            }
        }
        Ok(())
    }

    fn unwatch(&self, path: &Path) -> Result<()> {
        if !self.files.lock().remove(path) {
            return Ok(());
        }

        let Some(dir) = path.parent() else {
            return Ok(());
        };
        let mut dirs = self.dirs.lock();
        let remaining = match dirs.get_mut(dir) {
            Some(count) => {
                *count -= 1;
                *count
            }
            None => return Ok(()),
        };

        if remaining == 0 {
            dirs.remove(dir);
            if let Some(watcher) = self.watcher.lock().as_mut() {
                // The directory may already be gone
                let _ = watcher.unwatch(dir);
            }
        }
        Ok(())
    }

    fn close(&self) {
        self.watcher.lock().take();
        self.files.lock().clear();
        self.dirs.lock().clear();
    }
}
