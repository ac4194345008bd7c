// appinapp-core/src/store.rs
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::registry::WidgetInstance;
use crate::sync::lock;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("State file parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("State file encode error: {0}")]
    Encode(#[from] toml::ser::Error),
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Durable key/value state: the instance list and the widget folder setting.
pub trait Store: Send + Sync {
    fn load_instances(&self) -> Result<Vec<WidgetInstance>, StoreError>;
    fn save_instances(&self, instances: &[WidgetInstance]) -> Result<(), StoreError>;
    fn widget_folder(&self) -> Result<Option<PathBuf>, StoreError>;
    fn set_widget_folder(&self, folder: &Path) -> Result<(), StoreError>;
}

/// On-disk layout of the state file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateFile {
    // scalars ahead of the instance tables
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub widget_folder: Option<PathBuf>,
    #[serde(default)]
    pub instances: Vec<WidgetInstance>,
}

/// TOML state file. Writes go through a temp file and a rename.
pub struct FileStore {
    path: PathBuf,
    guard: Mutex<()>,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            guard: Mutex::new(()),
        }
    }

    /// `<config_dir>/appinapp/state.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("appinapp").join("state.toml"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.clone(),
            source,
        }
    }

    fn read(&self) -> Result<StateFile, StoreError> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => Ok(toml::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(StateFile::default()),
            Err(e) => Err(self.io_error(e)),
        }
    }

    fn write(&self, state: &StateFile) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
        }
        let content = toml::to_string_pretty(state)?;
        let tmp = self.path.with_extension("toml.tmp");
        std::fs::write(&tmp, content).map_err(|e| self.io_error(e))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| self.io_error(e))?;
        debug!(path = %self.path.display(), instances = state.instances.len(), "state saved");
        Ok(())
    }

    fn modify(&self, f: impl FnOnce(&mut StateFile)) -> Result<(), StoreError> {
        let _guard = lock(&self.guard);
        let mut state = self.read()?;
        f(&mut state);
        self.write(&state)
    }
}

impl Store for FileStore {
    fn load_instances(&self) -> Result<Vec<WidgetInstance>, StoreError> {
        let _guard = lock(&self.guard);
        Ok(self.read()?.instances)
    }

    fn save_instances(&self, instances: &[WidgetInstance]) -> Result<(), StoreError> {
        self.modify(|state| state.instances = instances.to_vec())
    }

    fn widget_folder(&self) -> Result<Option<PathBuf>, StoreError> {
        let _guard = lock(&self.guard);
        Ok(self.read()?.widget_folder)
    }

    fn set_widget_folder(&self, folder: &Path) -> Result<(), StoreError> {
        self.modify(|state| state.widget_folder = Some(folder.to_path_buf()))
    }
}

/// Ephemeral store, with a switch to make saves fail.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<StateFile>,
    fail_saves: AtomicBool,
    saves: AtomicUsize,
}

impl MemoryStore {
    pub fn with_instances(instances: Vec<WidgetInstance>) -> Self {
        Self {
            state: Mutex::new(StateFile {
                widget_folder: None,
                instances,
            }),
            ..Self::default()
        }
    }

    pub fn fail_saves(&self, failing: bool) {
        self.fail_saves.store(failing, Ordering::SeqCst);
    }

    /// Successful saves so far.
    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("saves are disabled".to_string()));
        }
        Ok(())
    }
}

impl Store for MemoryStore {
    fn load_instances(&self) -> Result<Vec<WidgetInstance>, StoreError> {
        Ok(lock(&self.state).instances.clone())
    }

    fn save_instances(&self, instances: &[WidgetInstance]) -> Result<(), StoreError> {
        self.check()?;
        lock(&self.state).instances = instances.to_vec();
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn widget_folder(&self) -> Result<Option<PathBuf>, StoreError> {
        Ok(lock(&self.state).widget_folder.clone())
    }

    fn set_widget_folder(&self, folder: &Path) -> Result<(), StoreError> {
        self.check()?;
        lock(&self.state).widget_folder = Some(folder.to_path_buf());
        Ok(())
    }
}
