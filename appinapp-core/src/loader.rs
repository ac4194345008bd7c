// appinapp-core/src/loader.rs
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::module::WidgetModule;
use crate::sandbox::{Sandbox, SandboxError};
use crate::scanner::BundleScanner;
use crate::sync::{lock, read, write};

/// How widget source reaches the sandbox.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadMode {
    /// Execute the live file path directly, for development.
    Live,
    /// Read bytes through the host's [`SourceReader`].
    #[default]
    Packaged,
}

/// Host file-read interface used in packaged mode.
pub trait SourceReader: Send + Sync {
    fn read(&self, path: &Path) -> std::io::Result<Vec<u8>>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FsReader;

impl SourceReader for FsReader {
    fn read(&self, path: &Path) -> std::io::Result<Vec<u8>> {
        std::fs::read(path)
    }
}

/// Why one entry candidate failed.
#[derive(Debug, thiserror::Error)]
pub enum CandidateError {
    #[error("{}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{}: {source}", .path.display())]
    Sandbox {
        path: PathBuf,
        #[source]
        source: SandboxError,
    },
}

impl CandidateError {
    fn is_missing(&self) -> bool {
        matches!(self, CandidateError::Read { source, .. } if source.kind() == std::io::ErrorKind::NotFound)
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum LoadError {
    #[error("Widget type '{widget_type}' has no loadable source{}", describe_last(.last))]
    ModuleNotFound {
        widget_type: String,
        last: Option<Arc<CandidateError>>,
    },
}

fn describe_last(last: &Option<Arc<CandidateError>>) -> String {
    match last {
        Some(e) => format!(" (last error: {e})"),
        None => String::new(),
    }
}

type LoadResult = Result<Arc<WidgetModule>, LoadError>;

#[derive(Default)]
struct InFlight {
    result: Mutex<Option<LoadResult>>,
    done: Condvar,
}

impl InFlight {
    fn wait(&self) -> LoadResult {
        let mut result = lock(&self.result);
        loop {
            if let Some(result) = result.as_ref() {
                return result.clone();
            }
            result = self
                .done
                .wait(result)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
    }

    fn finish(&self, value: LoadResult) {
        *lock(&self.result) = Some(value);
        self.done.notify_all();
    }
}

enum Slot {
    Ready(Arc<WidgetModule>),
    Loading(Arc<InFlight>),
}

/// Produces executable modules for widget types, caching successes.
///
/// At most one load per type is in flight. Callers that arrive while a load
/// is running block on it and receive the same `Arc`. Failures are handed to
/// every waiting caller but never cached, so the next call retries.
pub struct ModuleLoader {
    mode: LoadMode,
    scanner: BundleScanner,
    reader: Arc<dyn SourceReader>,
    sandbox: Sandbox,
    root: RwLock<PathBuf>,
    slots: Mutex<HashMap<String, Slot>>,
}

impl ModuleLoader {
    pub fn new(
        root: impl Into<PathBuf>,
        mode: LoadMode,
        scanner: BundleScanner,
        reader: Arc<dyn SourceReader>,
    ) -> Self {
        Self {
            mode,
            scanner,
            reader,
            sandbox: Sandbox::new(),
            root: RwLock::new(root.into()),
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn mode(&self) -> LoadMode {
        self.mode
    }

    pub fn scanner(&self) -> &BundleScanner {
        &self.scanner
    }

    pub fn root(&self) -> PathBuf {
        read(&self.root).clone()
    }

    /// Point at another widget folder. Everything cached is dropped.
    pub fn set_root(&self, root: impl Into<PathBuf>) {
        *write(&self.root) = root.into();
        self.invalidate_all();
    }

    pub fn load(&self, widget_type: &str) -> LoadResult {
        let flight = {
            let mut slots = lock(&self.slots);
            match slots.get(widget_type) {
                Some(Slot::Ready(module)) => return Ok(module.clone()),
                Some(Slot::Loading(flight)) => {
                    let flight = flight.clone();
                    drop(slots);
                    debug!(widget_type, "joining in-flight load");
                    return flight.wait();
                }
                None => {
                    let flight = Arc::new(InFlight::default());
                    slots.insert(widget_type.to_string(), Slot::Loading(flight.clone()));
                    flight
                }
            }
        };

        let result = catch_unwind(AssertUnwindSafe(|| self.load_uncached(widget_type)))
            .unwrap_or_else(|_| {
                warn!(widget_type, "module load panicked");
                Err(LoadError::ModuleNotFound {
                    widget_type: widget_type.to_string(),
                    last: None,
                })
            });

        {
            let mut slots = lock(&self.slots);
            // An invalidate while loading detaches this flight from the cache.
            let current = matches!(
                slots.get(widget_type),
                Some(Slot::Loading(f)) if Arc::ptr_eq(f, &flight)
            );
            if current {
                match &result {
                    Ok(module) => {
                        slots.insert(widget_type.to_string(), Slot::Ready(module.clone()));
                    }
                    Err(_) => {
                        slots.remove(widget_type);
                    }
                }
            }
        }

        flight.finish(result.clone());
        result
    }

    /// Drop one cached module. The next `load` re-executes its source.
    pub fn invalidate(&self, widget_type: &str) {
        if lock(&self.slots).remove(widget_type).is_some() {
            info!(widget_type, "module cache entry invalidated");
        }
    }

    pub fn invalidate_all(&self) {
        lock(&self.slots).clear();
        info!("module cache cleared");
    }

    pub fn cached(&self, widget_type: &str) -> Option<Arc<WidgetModule>> {
        match lock(&self.slots).get(widget_type) {
            Some(Slot::Ready(module)) => Some(module.clone()),
            _ => None,
        }
    }

    fn load_uncached(&self, widget_type: &str) -> LoadResult {
        let root = self.root();
        let mut last: Option<CandidateError> = None;

        for path in self.scanner.candidates(&root, widget_type) {
            match self.load_candidate(widget_type, &path) {
                Ok(module) => {
                    info!(widget_type, path = %path.display(), mode = ?self.mode, "widget module loaded");
                    return Ok(Arc::new(module));
                }
                Err(e) => {
                    debug!(widget_type, error = %e, "entry candidate failed");
                    // a missing later candidate must not hide a real failure
                    if !e.is_missing() || last.is_none() {
                        last = Some(e);
                    }
                }
            }
        }

        let last = last.map(Arc::new);
        warn!(
            widget_type,
            root = %root.display(),
            error = %describe_last(&last),
            "no loadable source for widget type"
        );
        Err(LoadError::ModuleNotFound {
            widget_type: widget_type.to_string(),
            last,
        })
    }

    fn load_candidate(&self, widget_type: &str, path: &Path) -> Result<WidgetModule, CandidateError> {
        let sandboxed = match self.mode {
            LoadMode::Live => {
                if !path.is_file() {
                    return Err(CandidateError::Read {
                        path: path.to_path_buf(),
                        source: std::io::ErrorKind::NotFound.into(),
                    });
                }
                self.sandbox.execute_file(path)
            }
            LoadMode::Packaged => {
                let bytes = self.reader.read(path).map_err(|source| CandidateError::Read {
                    path: path.to_path_buf(),
                    source,
                })?;
                let source = String::from_utf8_lossy(&bytes);
                self.sandbox.execute(&source, &chunk_name(widget_type, path))
            }
        };

        let sandboxed = sandboxed.map_err(|source| CandidateError::Sandbox {
            path: path.to_path_buf(),
            source,
        })?;

        WidgetModule::from_sandbox(widget_type, path, sandboxed).map_err(|e| {
            CandidateError::Sandbox {
                path: path.to_path_buf(),
                source: SandboxError::Execution(e.to_string()),
            }
        })
    }
}

// `Clock/index.lua`, short enough for error messages
fn chunk_name(widget_type: &str, path: &Path) -> String {
    match path.file_name() {
        Some(file) => format!("{widget_type}/{}", file.to_string_lossy()),
        None => widget_type.to_string(),
    }
}
