// appinapp-core/src/watch.rs
use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};

use crossbeam::channel::{Receiver, unbounded};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, info, warn};

use crate::event::{BundleChanged, Event, EventBus, WIDGETS_RELOAD};
use crate::loader::ModuleLoader;
use crate::scanner::BUNDLE_SUFFIX;

#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error("File watcher error: {0}")]
    Watcher(#[from] notify::Error),
}

/// Dev hot reload: reports which bundle types changed under the widget folder.
pub struct BundleWatcher {
    root: PathBuf,
    watcher: RecommendedWatcher,
    rx: Receiver<notify::Result<notify::Event>>,
}

impl BundleWatcher {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, WatchError> {
        let root = root.into();
        let (tx, rx) = unbounded();
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<notify::Event>| {
                let _ = tx.send(res);
            },
            notify::Config::default(),
        )?;
        watcher.watch(&root, RecursiveMode::Recursive)?;
        info!(root = %root.display(), "watching widget folder");

        Ok(Self { root, watcher, rx })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Types touched since the last call.
    pub fn changed_types(&self) -> BTreeSet<String> {
        let mut changed = BTreeSet::new();
        while let Ok(event) = self.rx.try_recv() {
            let event = match event {
                Ok(event) => event,
                Err(e) => {
                    warn!(error = %e, "widget folder watch error");
                    continue;
                }
            };
            if !(event.kind.is_modify() || event.kind.is_create() || event.kind.is_remove()) {
                continue;
            }
            changed.extend(
                event
                    .paths
                    .iter()
                    .filter_map(|path| bundle_type_of(&self.root, path)),
            );
        }
        changed
    }

    /// Drop changed types from the loader cache and announce them on the bus.
    pub fn pump(&self, loader: &ModuleLoader, bus: &EventBus) -> BTreeSet<String> {
        let changed = self.changed_types();
        for widget_type in &changed {
            debug!(widget_type = %widget_type, "bundle changed on disk");
            loader.invalidate(widget_type);
            bus.publish(Event::new(
                WIDGETS_RELOAD,
                BundleChanged {
                    widget_type: widget_type.clone(),
                },
            ));
        }
        changed
    }
}

impl Drop for BundleWatcher {
    fn drop(&mut self) {
        let _ = self.watcher.unwatch(&self.root);
    }
}

/// `<root>/Clock.widget/lib/x.lua` -> `Clock`
pub fn bundle_type_of(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    match relative.components().next()? {
        Component::Normal(name) => name
            .to_str()?
            .strip_suffix(BUNDLE_SUFFIX)
            .filter(|n| !n.is_empty())
            .map(str::to_string),
        _ => None,
    }
}
