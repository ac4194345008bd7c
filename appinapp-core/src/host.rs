// appinapp-core/src/host.rs
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::Receiver;
use tracing::{debug, info, warn};

use crate::boundary::CrashBoundary;
use crate::command::{CommandBridge, CommandExecutor, CommandState};
use crate::config::RuntimeConfig;
use crate::event::{BundleChanged, Event, EventBus, Subscription, WIDGETS_RELOAD};
use crate::loader::{ModuleLoader, SourceReader};
use crate::module::{DeclaredGeometry, RenderProps, WidgetModule};
use crate::node::Node;
use crate::orchestrator::{OrchestratorTiming, WindowOrchestrator};
use crate::registry::{
    InstanceId, InstancePatch, InstanceRegistry, RegistryError, RegistryView, WidgetInstance,
};
use crate::scanner::{ScanError, ScanReport, delete_bundle};
use crate::stats::{AppStats, StatsSampler};
use crate::store::{Store, StoreError};
use crate::window::{Geometry, WindowService};

const STATS_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Scan(#[from] ScanError),
}

/// Shared collaborators of every window in one process.
#[derive(Clone)]
pub struct Runtime {
    pub registry: InstanceRegistry,
    pub loader: Arc<ModuleLoader>,
    pub executor: Arc<dyn CommandExecutor>,
    pub windows: Arc<dyn WindowService>,
    pub store: Arc<dyn Store>,
    pub timing: OrchestratorTiming,
    pub default_geometry: Geometry,
}

impl Runtime {
    pub fn new(
        config: &RuntimeConfig,
        store: Arc<dyn Store>,
        windows: Arc<dyn WindowService>,
        executor: Arc<dyn CommandExecutor>,
        reader: Arc<dyn SourceReader>,
    ) -> Self {
        let persisted = store.widget_folder().unwrap_or_else(|e| {
            warn!(error = %e, "could not read the widget folder setting");
            None
        });
        let root = config.resolve_widget_folder(persisted).unwrap_or_default();
        info!(root = %root.display(), mode = ?config.mode, "widget runtime configured");

        let loader = ModuleLoader::new(root, config.mode, config.scanner(), reader);
        let registry = InstanceRegistry::new(store.clone(), EventBus::new(), Some(windows.clone()));

        Self {
            registry,
            loader: Arc::new(loader),
            executor,
            windows,
            store,
            timing: config.timing(),
            default_geometry: config.default_geometry,
        }
    }

    pub fn bus(&self) -> &EventBus {
        self.registry.bus()
    }

    pub fn widget_folder(&self) -> PathBuf {
        self.loader.root()
    }
}

/// What one widget window shows.
#[derive(Debug, Clone, PartialEq)]
pub enum WindowContent {
    Empty,
    Loading,
    TypeNotFound { widget_type: String, folder: PathBuf },
    Crashed { message: String },
    Widget { style: Option<String>, node: Node },
}

struct MountedWidget {
    module: Arc<WidgetModule>,
    bridge: CommandBridge,
    boundary: CrashBoundary,
}

enum HostState {
    Loading,
    Gone,
    NotFound { widget_type: String, folder: PathBuf },
    Mounted(Box<MountedWidget>),
}

/// Runtime of one widget window: module, command polling, crash boundary
/// and window orchestration for a single instance.
pub struct WidgetHost {
    id: InstanceId,
    runtime: Runtime,
    view: RegistryView,
    orchestrator: WindowOrchestrator,
    _reload_subscription: Subscription,
    reload_rx: Receiver<Event>,
    state: HostState,
}

impl WidgetHost {
    pub fn new(id: InstanceId, runtime: Runtime) -> Self {
        let (subscription, reload_rx) = runtime.bus().subscribe(WIDGETS_RELOAD);
        let view = RegistryView::new(runtime.registry.clone());
        let orchestrator = WindowOrchestrator::new(
            id.clone(),
            runtime.registry.clone(),
            runtime.windows.clone(),
            runtime.timing,
        );
        Self {
            id,
            runtime,
            view,
            orchestrator,
            _reload_subscription: subscription,
            reload_rx,
            state: HostState::Loading,
        }
    }

    pub fn id(&self) -> &InstanceId {
        &self.id
    }

    pub fn instance(&self) -> Option<&WidgetInstance> {
        self.view.find(&self.id)
    }

    pub fn widget_type(&self) -> Option<&str> {
        self.instance().map(|i| i.widget_type.as_str())
    }

    /// Load the module and mount everything around it.
    pub fn start(&mut self) {
        self.view.sync();
        let Some(widget_type) = self.widget_type().map(str::to_string) else {
            warn!(instance = %self.id, "widget instance no longer exists");
            self.state = HostState::Gone;
            return;
        };

        self.state = match self.runtime.loader.load(&widget_type) {
            Ok(module) => {
                let mut bridge = CommandBridge::new(
                    self.runtime.executor.clone(),
                    module.bundle_dir(),
                    module.command(),
                    module.refresh_frequency(),
                );
                bridge.mount();
                debug!(instance = %self.id, widget_type = %widget_type, "widget mounted");
                HostState::Mounted(Box::new(MountedWidget {
                    module,
                    bridge,
                    boundary: CrashBoundary::new(format!("{widget_type} ({})", self.id)),
                }))
            }
            Err(e) => {
                warn!(instance = %self.id, error = %e, "widget type could not be loaded");
                HostState::NotFound {
                    widget_type,
                    folder: self.runtime.widget_folder(),
                }
            }
        };
        self.orchestrator.mount();
    }

    pub fn update(&mut self, delta: Duration) {
        if self.view.sync() {
            match self.view.find(&self.id).cloned() {
                Some(instance) => self.orchestrator.apply_instance(&instance),
                None => {
                    info!(instance = %self.id, "widget instance removed, unmounting");
                    self.unmount();
                    self.state = HostState::Gone;
                    return;
                }
            }
        }

        if self.reload_requested() {
            self.reload();
        }

        if let HostState::Mounted(widget) = &mut self.state {
            widget.bridge.update(delta);
        }
        self.orchestrator.update(delta);
    }

    /// Remount from a fresh module. Clears a latched crash.
    pub fn reload(&mut self) {
        info!(instance = %self.id, "reloading widget");
        self.unmount();
        self.start();
    }

    pub fn render(&mut self) -> WindowContent {
        match &mut self.state {
            HostState::Loading => WindowContent::Loading,
            HostState::Gone => WindowContent::Empty,
            HostState::NotFound {
                widget_type,
                folder,
            } => WindowContent::TypeNotFound {
                widget_type: widget_type.clone(),
                folder: folder.clone(),
            },
            HostState::Mounted(widget) => {
                let state = widget.bridge.state();
                let props = RenderProps {
                    output: state.output.clone(),
                    error: state.error.as_ref().map(|e| e.to_string()),
                    run: widget.bridge.run_handle(),
                };
                let module = widget.module.clone();
                match widget.boundary.guard(|| module.render(props)) {
                    Ok(node) => WindowContent::Widget {
                        style: module.style().map(str::to_string),
                        node,
                    },
                    Err(crash) => WindowContent::Crashed {
                        message: crash.message,
                    },
                }
            }
        }
    }

    /// Stop polling and timers. The host shows `Loading` until started again.
    pub fn unmount(&mut self) {
        if let HostState::Mounted(widget) = &mut self.state {
            widget.bridge.unmount();
        }
        self.orchestrator.unmount();
        self.state = HostState::Loading;
    }

    pub fn orchestrator_mut(&mut self) -> &mut WindowOrchestrator {
        &mut self.orchestrator
    }

    pub fn command_state(&self) -> Option<&CommandState> {
        match &self.state {
            HostState::Mounted(widget) => Some(widget.bridge.state()),
            _ => None,
        }
    }

    /// Wait for in-flight command results and apply them.
    pub fn settle(&mut self) {
        if let HostState::Mounted(widget) = &mut self.state {
            widget.bridge.settle();
        }
    }

    fn reload_requested(&self) -> bool {
        let Some(widget_type) = self.widget_type() else {
            return false;
        };
        let mut requested = false;
        while let Ok(event) = self.reload_rx.try_recv() {
            if let Some(changed) = event.payload.downcast::<BundleChanged>() {
                requested |= changed.widget_type == widget_type;
            }
        }
        requested
    }
}

impl Drop for WidgetHost {
    fn drop(&mut self) {
        self.unmount();
    }
}

/// The control window: available types, instance list and app stats.
pub struct ControlSurface {
    runtime: Runtime,
    view: RegistryView,
    scan: ScanReport,
    sampler: StatsSampler,
    stats: AppStats,
    since_stats: Duration,
}

impl ControlSurface {
    pub fn new(runtime: Runtime) -> Self {
        let view = RegistryView::new(runtime.registry.clone());
        let mut surface = Self {
            runtime,
            view,
            scan: ScanReport::default(),
            sampler: StatsSampler::new(),
            stats: AppStats::default(),
            since_stats: Duration::ZERO,
        };
        surface.rescan();
        surface
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    pub fn rescan(&mut self) -> &ScanReport {
        let root = self.runtime.widget_folder();
        self.scan = self.runtime.loader.scanner().scan(&root);
        debug!(root = %root.display(), types = self.scan.types.len(), "widget folder scanned");
        &self.scan
    }

    pub fn scan(&self) -> &ScanReport {
        &self.scan
    }

    pub fn available_types(&self) -> Vec<&str> {
        self.scan.names()
    }

    pub fn instances(&self) -> &[WidgetInstance] {
        self.view.instances()
    }

    pub fn widget_folder(&self) -> PathBuf {
        self.runtime.widget_folder()
    }

    /// Explicit geometry, else what the module declares, else defaults.
    pub fn add(
        &mut self,
        widget_type: &str,
        geometry: Option<Geometry>,
    ) -> Result<WidgetInstance, HostError> {
        let geometry = match geometry {
            Some(geometry) => geometry,
            None => self.initial_geometry(widget_type),
        };
        let instance = self.runtime.registry.add(widget_type, geometry)?;
        self.view.sync();
        Ok(instance)
    }

    pub fn remove(&mut self, id: &InstanceId) -> Result<(), HostError> {
        self.runtime.registry.remove(id)?;
        self.view.sync();
        Ok(())
    }

    pub fn toggle_background(&mut self, id: &InstanceId) -> Result<WidgetInstance, HostError> {
        let instance = self.runtime.registry.toggle_background(id)?;
        self.view.sync();
        Ok(instance)
    }

    pub fn update_config(
        &mut self,
        id: &InstanceId,
        patch: InstancePatch,
    ) -> Result<WidgetInstance, HostError> {
        let instance = self.runtime.registry.update_config(id, patch)?;
        self.view.sync();
        Ok(instance)
    }

    /// Persist a new widget folder, drop every cached module and rescan.
    pub fn set_widget_folder(&mut self, folder: &Path) -> Result<(), HostError> {
        self.runtime.store.set_widget_folder(folder)?;
        self.runtime.loader.set_root(folder);
        info!(folder = %folder.display(), "widget folder changed");
        self.rescan();
        Ok(())
    }

    /// Delete a bundle's source folder. Running instances keep their module
    /// until remounted.
    pub fn delete_type(&mut self, widget_type: &str) -> Result<(), HostError> {
        delete_bundle(&self.runtime.widget_folder(), widget_type)?;
        self.runtime.loader.invalidate(widget_type);
        info!(widget_type, "widget bundle deleted");
        self.rescan();
        Ok(())
    }

    pub fn stats(&self) -> AppStats {
        self.stats
    }

    pub fn sample_stats(&mut self) -> AppStats {
        self.stats = self.sampler.sample();
        self.since_stats = Duration::ZERO;
        self.stats
    }

    /// Take broadcasts and refresh stats on their interval.
    pub fn update(&mut self, delta: Duration) -> bool {
        let changed = self.view.sync();
        self.since_stats += delta;
        if self.since_stats >= STATS_INTERVAL {
            self.sample_stats();
        }
        changed
    }

    fn initial_geometry(&self, widget_type: &str) -> Geometry {
        let declared = match self.runtime.loader.load(widget_type) {
            Ok(module) => module.geometry(),
            Err(e) => {
                debug!(widget_type, error = %e, "no declared geometry");
                DeclaredGeometry::default()
            }
        };
        merge_geometry(self.runtime.default_geometry, declared)
    }
}

fn merge_geometry(base: Geometry, declared: DeclaredGeometry) -> Geometry {
    Geometry {
        x: declared.left.unwrap_or(base.x),
        y: declared.top.unwrap_or(base.y),
        width: declared.width.unwrap_or(base.width),
        height: declared.height.unwrap_or(base.height),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::tests::RecordingExecutor;
    use crate::loader::{FsReader, LoadMode};
    use crate::store::MemoryStore;
    use crate::window::MemoryWindows;
    use tempfile::TempDir;

    const CLOCK: &str = r#"
export const command = "date"
export const refreshFrequency = 1000
export const className = "color: white;"

export default function(props)
    return <div class="clock">{props.output}</div>
end
"#;

    const BROKEN: &str = r#"
export default function(props)
    error("render exploded")
end
"#;

    struct Fixture {
        _tmp: TempDir,
        root: PathBuf,
        runtime: Runtime,
        store: Arc<MemoryStore>,
        windows: Arc<MemoryWindows>,
        executor: Arc<RecordingExecutor>,
    }

    impl Fixture {
        fn new() -> Self {
            let tmp = TempDir::new().unwrap();
            let root = tmp.path().join("widgets");
            bundle(&root, "Clock", CLOCK);
            bundle(&root, "Broken", BROKEN);

            let store = Arc::new(MemoryStore::default());
            let windows = Arc::new(MemoryWindows::default());
            let executor = Arc::new(RecordingExecutor::default());
            let config = RuntimeConfig {
                widget_folder: Some(root.clone()),
                mode: LoadMode::Live,
                ..RuntimeConfig::default()
            };
            let runtime = Runtime::new(
                &config,
                store.clone(),
                windows.clone(),
                executor.clone(),
                Arc::new(FsReader),
            );
            Self {
                _tmp: tmp,
                root,
                runtime,
                store,
                windows,
                executor,
            }
        }

        fn control(&self) -> ControlSurface {
            ControlSurface::new(self.runtime.clone())
        }

        fn host(&self, id: &InstanceId) -> WidgetHost {
            let mut host = WidgetHost::new(id.clone(), self.runtime.clone());
            host.start();
            host.settle();
            host
        }
    }

    fn bundle(root: &Path, name: &str, source: &str) {
        let dir = root.join(format!("{name}.widget"));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("index.lua"), source).unwrap();
    }

    fn text(content: &WindowContent) -> String {
        match content {
            WindowContent::Widget { node, .. } => node.text_content(),
            other => panic!("expected widget content, got {other:?}"),
        }
    }

    #[test]
    fn test_control_lists_types() {
        let fx = Fixture::new();
        let control = fx.control();
        assert_eq!(control.available_types(), vec!["Broken", "Clock"]);
        assert!(control.scan().error.is_none());
    }

    #[test]
    fn test_widget_renders_command_output() {
        let fx = Fixture::new();
        let mut control = fx.control();
        let instance = control.add("Clock", None).unwrap();

        let mut host = fx.host(&instance.id);
        host.update(Duration::ZERO);
        let content = host.render();

        assert_eq!(text(&content), "out:date");
        assert!(matches!(
            &content,
            WindowContent::Widget { style: Some(s), .. } if s == "color: white;"
        ));
        assert_eq!(fx.executor.count(), 1);
        assert_eq!(fx.windows.len(), 1);
    }

    #[test]
    fn test_crash_is_contained() {
        let fx = Fixture::new();
        let mut control = fx.control();
        let broken = control.add("Broken", None).unwrap();
        let healthy = control.add("Clock", None).unwrap();

        let mut broken_host = fx.host(&broken.id);
        let mut healthy_host = fx.host(&healthy.id);

        let crashed = broken_host.render();
        match &crashed {
            WindowContent::Crashed { message } => assert!(message.contains("render exploded")),
            other => panic!("expected crash, got {other:?}"),
        }
        // latched
        assert_eq!(broken_host.render(), crashed);

        healthy_host.update(Duration::ZERO);
        assert_eq!(text(&healthy_host.render()), "out:date");
        assert_eq!(control.instances().len(), 2);
    }

    #[test]
    fn test_missing_type_placeholder() {
        let fx = Fixture::new();
        let mut control = fx.control();
        let instance = control.add("Weather", None).unwrap();

        let mut host = fx.host(&instance.id);
        assert_eq!(
            host.render(),
            WindowContent::TypeNotFound {
                widget_type: "Weather".into(),
                folder: fx.root.clone(),
            }
        );
    }

    #[test]
    fn test_unstarted_host_is_loading() {
        let fx = Fixture::new();
        let instance = fx.runtime.registry.add("Clock", Geometry::default()).unwrap();
        let mut host = WidgetHost::new(instance.id, fx.runtime.clone());
        assert_eq!(host.render(), WindowContent::Loading);
    }

    #[test]
    fn test_add_uses_declared_geometry() {
        let fx = Fixture::new();
        bundle(
            &fx.root,
            "Sized",
            "export const windowLeft = 10\nexport const windowWidth = 640\nexport default 'x'",
        );
        let mut control = fx.control();

        let declared = control.add("Sized", None).unwrap();
        assert_eq!(
            declared.geometry(),
            Geometry {
                x: 10.0,
                y: 100.0,
                width: 640.0,
                height: 200.0
            }
        );

        let explicit = Geometry {
            x: 1.0,
            y: 2.0,
            width: 3.0,
            height: 4.0,
        };
        assert_eq!(control.add("Sized", Some(explicit)).unwrap().geometry(), explicit);
    }

    #[test]
    fn test_persisted_geometry_wins_on_reload() {
        let fx = Fixture::new();
        bundle(&fx.root, "Sized", "export const windowWidth = 640\nexport default 'x'");
        let mut control = fx.control();
        let instance = control.add("Sized", None).unwrap();
        let moved = Geometry {
            x: 5.0,
            y: 5.0,
            width: 150.0,
            height: 90.0,
        };
        control
            .update_config(&instance.id, InstancePatch::geometry(moved))
            .unwrap();

        let mut host = fx.host(&instance.id);
        host.reload();
        assert_eq!(host.instance().unwrap().geometry(), moved);
        assert_eq!(fx.runtime.registry.get(&instance.id).unwrap().geometry(), moved);
    }

    #[test]
    fn test_removed_instance_unmounts_host() {
        let fx = Fixture::new();
        let mut control = fx.control();
        let instance = control.add("Clock", None).unwrap();
        let mut host = fx.host(&instance.id);

        control.remove(&instance.id).unwrap();
        host.update(Duration::from_millis(5000));

        assert_eq!(host.render(), WindowContent::Empty);
        assert!(host.command_state().is_none());
        assert_eq!(fx.executor.count(), 1);
        assert!(control.instances().is_empty());
    }

    #[test]
    fn test_reload_event_remounts() {
        let fx = Fixture::new();
        let mut control = fx.control();
        let instance = control.add("Broken", None).unwrap();
        let mut host = fx.host(&instance.id);
        assert!(matches!(host.render(), WindowContent::Crashed { .. }));

        bundle(&fx.root, "Broken", "export default function() return 'fixed' end");
        fx.runtime.loader.invalidate("Broken");
        fx.runtime.bus().publish(Event::new(
            WIDGETS_RELOAD,
            BundleChanged {
                widget_type: "Broken".into(),
            },
        ));
        host.update(Duration::ZERO);

        assert_eq!(text(&host.render()), "fixed");
    }

    #[test]
    fn test_set_widget_folder() {
        let fx = Fixture::new();
        let mut control = fx.control();
        let other = fx.root.parent().unwrap().join("other");
        bundle(&other, "Notes", "export default 'notes'");

        control.set_widget_folder(&other).unwrap();

        assert_eq!(control.available_types(), vec!["Notes"]);
        assert_eq!(fx.store.widget_folder().unwrap(), Some(other.clone()));
        assert_eq!(fx.runtime.widget_folder(), other);
    }

    #[test]
    fn test_delete_type() {
        let fx = Fixture::new();
        let mut control = fx.control();
        fx.runtime.loader.load("Clock").unwrap();

        control.delete_type("Clock").unwrap();

        assert_eq!(control.available_types(), vec!["Broken"]);
        assert!(fx.runtime.loader.cached("Clock").is_none());
        assert!(matches!(
            control.delete_type("Clock"),
            Err(HostError::Scan(ScanError::BundleMissing(_)))
        ));
    }

    #[test]
    fn test_toggle_background_via_control() {
        let fx = Fixture::new();
        let mut control = fx.control();
        let instance = control.add("Clock", None).unwrap();

        let toggled = control.toggle_background(&instance.id).unwrap();
        assert!(toggled.background);
        assert!(fx.windows.get(&instance.id).unwrap().snapshot().always_on_bottom);
        assert!(control.instances()[0].background);
    }

    #[test]
    fn test_demo_bundles() {
        let root = Path::new(env!("CARGO_MANIFEST_DIR")).join("../demos/widgets");
        let executor = Arc::new(RecordingExecutor::default());
        let config = RuntimeConfig {
            widget_folder: Some(root),
            ..RuntimeConfig::default()
        };
        let runtime = Runtime::new(
            &config,
            Arc::new(MemoryStore::default()),
            Arc::new(MemoryWindows::default()),
            executor.clone(),
            Arc::new(FsReader),
        );
        let mut control = ControlSurface::new(runtime.clone());
        assert_eq!(control.available_types(), vec!["Clock", "Hello", "Uptime"]);

        let hello = control.add("Hello", None).unwrap();
        assert_eq!(hello.x, 360.0);
        let mut host = WidgetHost::new(hello.id, runtime.clone());
        host.start();
        assert!(text(&host.render()).contains("◆ Hello, desktop!"));

        let clock = control.add("Clock", None).unwrap();
        assert_eq!(clock.width, 240.0);
        let mut host = WidgetHost::new(clock.id, runtime.clone());
        host.start();
        assert!(text(&host.render()).contains(':'));

        let uptime = control.add("Uptime", None).unwrap();
        let mut host = WidgetHost::new(uptime.id, runtime);
        host.start();
        host.settle();
        assert!(text(&host.render()).starts_with("Uptime"));
        let calls = crate::sync::lock(&executor.calls).clone();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].ends_with("Uptime.widget/bin/uptime.sh"));
    }

    #[test]
    fn test_stats_sampled_on_interval() {
        let fx = Fixture::new();
        let mut control = fx.control();
        assert_eq!(control.stats(), AppStats::default());

        control.update(Duration::from_secs(1));
        assert_eq!(control.stats(), AppStats::default());
        control.update(Duration::from_secs(1));
        assert!(control.stats().main.memory_mib > 0);
    }
}
