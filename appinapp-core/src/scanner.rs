// appinapp-core/src/scanner.rs
use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};

use tracing::{debug, warn};

/// Folder suffix that marks a widget bundle: `Clock.widget/`
pub const BUNDLE_SUFFIX: &str = ".widget";

/// File stem of a bundle's entry source: `index.lua`
pub const ENTRY_STEM: &str = "index";

/// Entry extensions in priority order. Earlier wins when several exist.
pub const DEFAULT_EXTENSIONS: &[&str] = &["lua", "luax"];

#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error("Widget folder does not exist: {0}")]
    MissingFolder(PathBuf),
    #[error("Widget folder is not a directory: {0}")]
    NotADirectory(PathBuf),
    #[error("Failed to read widget folder {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Widget bundle not found: {0}")]
    BundleMissing(String),
    #[error("Invalid widget type name: {0:?}")]
    InvalidType(String),
    #[error("Failed to delete widget bundle {path}: {source}")]
    Delete {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// One bundle on disk. Recreated on every scan.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WidgetTypeDescriptor {
    pub name: String,
    pub entry: PathBuf,
}

/// Result of a scan. A failed scan still yields a (possibly empty) set; the
/// error is informational.
#[derive(Debug, Default)]
pub struct ScanReport {
    pub types: BTreeSet<WidgetTypeDescriptor>,
    pub error: Option<ScanError>,
}

impl ScanReport {
    fn failed(error: ScanError) -> Self {
        warn!(%error, "widget folder scan failed");
        Self {
            types: BTreeSet::new(),
            error: Some(error),
        }
    }

    pub fn names(&self) -> Vec<&str> {
        self.types.iter().map(|t| t.name.as_str()).collect()
    }

    pub fn get(&self, name: &str) -> Option<&WidgetTypeDescriptor> {
        self.types.iter().find(|t| t.name == name)
    }
}

#[derive(Debug, Clone)]
pub struct BundleScanner {
    extensions: Vec<String>,
}

impl Default for BundleScanner {
    fn default() -> Self {
        Self::new(DEFAULT_EXTENSIONS.iter().map(|e| e.to_string()).collect())
    }
}

impl BundleScanner {
    pub fn new(extensions: Vec<String>) -> Self {
        Self { extensions }
    }

    pub fn extensions(&self) -> &[String] {
        &self.extensions
    }

    /// Enumerate the bundles directly under `root`.
    pub fn scan(&self, root: &Path) -> ScanReport {
        if !root.exists() {
            return ScanReport::failed(ScanError::MissingFolder(root.to_path_buf()));
        }
        if !root.is_dir() {
            return ScanReport::failed(ScanError::NotADirectory(root.to_path_buf()));
        }

        let entries = match std::fs::read_dir(root) {
            Ok(entries) => entries,
            Err(source) => {
                return ScanReport::failed(ScanError::Unreadable {
                    path: root.to_path_buf(),
                    source,
                });
            }
        };

        let mut types = BTreeSet::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let Some(name) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_suffix(BUNDLE_SUFFIX))
            else {
                continue;
            };
            if name.is_empty() {
                continue;
            }

            match self.entry_in(&path) {
                Some(entry) => {
                    types.insert(WidgetTypeDescriptor {
                        name: name.to_string(),
                        entry,
                    });
                }
                None => debug!(bundle = %path.display(), "bundle has no entry source, skipped"),
            }
        }

        debug!(root = %root.display(), found = types.len(), "scanned widget folder");
        ScanReport { types, error: None }
    }

    /// Entry source candidates for a type, in priority order.
    /// Empty for a type name that is not a plain folder name.
    pub fn candidates(&self, root: &Path, widget_type: &str) -> Vec<PathBuf> {
        let Some(dir) = bundle_dir(root, widget_type) else {
            return Vec::new();
        };
        self.extensions
            .iter()
            .map(|ext| dir.join(format!("{ENTRY_STEM}.{ext}")))
            .collect()
    }

    fn entry_in(&self, bundle: &Path) -> Option<PathBuf> {
        self.extensions
            .iter()
            .map(|ext| bundle.join(format!("{ENTRY_STEM}.{ext}")))
            .find(|p| p.is_file())
    }
}

/// Folder of a bundle: `<root>/<type>.widget`. None unless `widget_type`
/// is a single plain path component.
pub fn bundle_dir(root: &Path, widget_type: &str) -> Option<PathBuf> {
    let mut components = Path::new(widget_type).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(name)), None) if name == widget_type => {
            Some(root.join(format!("{widget_type}{BUNDLE_SUFFIX}")))
        }
        _ => None,
    }
}

/// Remove a bundle folder from disk.
pub fn delete_bundle(root: &Path, widget_type: &str) -> Result<(), ScanError> {
    let path = bundle_dir(root, widget_type)
        .ok_or_else(|| ScanError::InvalidType(widget_type.to_string()))?;
    if !path.is_dir() {
        return Err(ScanError::BundleMissing(widget_type.to_string()));
    }
    std::fs::remove_dir_all(&path).map_err(|source| ScanError::Delete { path, source })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn bundle(root: &Path, name: &str, files: &[&str]) {
        let dir = root.join(name);
        std::fs::create_dir_all(&dir).unwrap();
        for file in files {
            std::fs::write(dir.join(file), "export default 1").unwrap();
        }
    }

    #[test]
    fn test_empty_folder_yields_empty_set() {
        let tmp = TempDir::new().unwrap();
        let report = BundleScanner::default().scan(tmp.path());

        assert!(report.types.is_empty());
        assert!(report.error.is_none());
    }

    #[test]
    fn test_folder_without_matching_bundles() {
        let tmp = TempDir::new().unwrap();
        bundle(tmp.path(), "notes", &["index.lua"]);
        bundle(tmp.path(), "Empty.widget", &["readme.txt"]);
        std::fs::write(tmp.path().join("Loose.widget"), "not a dir").unwrap();

        let report = BundleScanner::default().scan(tmp.path());
        assert!(report.types.is_empty());
        assert!(report.error.is_none());
    }

    #[test]
    fn test_missing_folder_is_recoverable() {
        let tmp = TempDir::new().unwrap();
        let report = BundleScanner::default().scan(&tmp.path().join("nope"));

        assert!(report.types.is_empty());
        assert!(matches!(report.error, Some(ScanError::MissingFolder(_))));
    }

    #[test]
    fn test_file_instead_of_folder() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("widgets.txt");
        std::fs::write(&file, "").unwrap();

        let report = BundleScanner::default().scan(&file);
        assert!(report.types.is_empty());
        assert!(matches!(report.error, Some(ScanError::NotADirectory(_))));
    }

    #[test]
    fn test_scan_finds_bundles() {
        let tmp = TempDir::new().unwrap();
        bundle(tmp.path(), "Clock.widget", &["index.lua"]);
        bundle(tmp.path(), "Todo.widget", &["index.luax"]);

        let report = BundleScanner::default().scan(tmp.path());
        assert_eq!(report.names(), vec!["Clock", "Todo"]);
        assert_eq!(
            report.get("Todo").unwrap().entry,
            tmp.path().join("Todo.widget/index.luax")
        );
    }

    #[test]
    fn test_entry_priority() {
        let tmp = TempDir::new().unwrap();
        bundle(tmp.path(), "Clock.widget", &["index.luax", "index.lua"]);

        let report = BundleScanner::default().scan(tmp.path());
        assert_eq!(
            report.get("Clock").unwrap().entry,
            tmp.path().join("Clock.widget/index.lua")
        );
    }

    #[test]
    fn test_rescan_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        bundle(tmp.path(), "B.widget", &["index.lua"]);
        bundle(tmp.path(), "A.widget", &["index.lua"]);

        let scanner = BundleScanner::default();
        assert_eq!(scanner.scan(tmp.path()).types, scanner.scan(tmp.path()).types);
    }

    #[test]
    fn test_candidates_follow_extension_order() {
        let scanner = BundleScanner::new(vec!["luax".into(), "lua".into()]);
        let candidates = scanner.candidates(Path::new("/w"), "Clock");

        assert_eq!(
            candidates,
            vec![
                PathBuf::from("/w/Clock.widget/index.luax"),
                PathBuf::from("/w/Clock.widget/index.lua"),
            ]
        );
    }

    #[test]
    fn test_delete_bundle() {
        let tmp = TempDir::new().unwrap();
        bundle(tmp.path(), "Clock.widget", &["index.lua"]);

        delete_bundle(tmp.path(), "Clock").unwrap();
        assert!(!tmp.path().join("Clock.widget").exists());
        assert!(matches!(
            delete_bundle(tmp.path(), "Clock"),
            Err(ScanError::BundleMissing(_))
        ));
    }

    #[test]
    fn test_delete_rejects_paths_outside_root() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("widgets");
        std::fs::create_dir_all(&root).unwrap();
        bundle(tmp.path(), "x.widget", &["index.lua"]);

        for name in ["../x", "..", ".", "", "a/b", "/x"] {
            assert!(
                matches!(delete_bundle(&root, name), Err(ScanError::InvalidType(_))),
                "{name:?}"
            );
        }
        assert!(tmp.path().join("x.widget").is_dir());
        assert!(BundleScanner::default().candidates(&root, "../x").is_empty());
    }
}
