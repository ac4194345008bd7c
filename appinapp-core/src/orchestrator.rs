// appinapp-core/src/orchestrator.rs
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::registry::{InstanceId, InstancePatch, InstanceRegistry, RegistryError, WidgetInstance};
use crate::window::{Effect, Geometry, WidgetWindow, WindowLevel, WindowOpError, WindowService};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestratorTiming {
    /// Inactivity after the last edit before geometry is applied.
    pub debounce: Duration,
    /// Interval at which the translucency effect is re-applied.
    pub reassert: Duration,
}

impl Default for OrchestratorTiming {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(300),
            reassert: Duration::from_millis(2000),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Window(#[from] WindowOpError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Editable window settings of one instance, in logical units.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct WindowFields {
    pub geometry: Geometry,
    pub always_on_top: bool,
    pub translucent: bool,
    pub all_workspaces: bool,
    pub background: bool,
}

impl WindowFields {
    fn from_instance(instance: &WidgetInstance) -> Self {
        Self {
            geometry: instance.geometry(),
            always_on_top: instance.always_on_top,
            translucent: instance.acrylic,
            all_workspaces: instance.visible_on_all_workspaces,
            background: instance.background,
        }
    }
}

/// Keeps one widget window in step with its instance configuration.
pub struct WindowOrchestrator {
    id: InstanceId,
    registry: InstanceRegistry,
    windows: Arc<dyn WindowService>,
    window: Option<Arc<dyn WidgetWindow>>,
    timing: OrchestratorTiming,
    fields: WindowFields,
    // idle time since the last unapplied edit
    pending: Option<Duration>,
    since_reassert: Duration,
    mounted: bool,
}

impl WindowOrchestrator {
    pub fn new(
        id: InstanceId,
        registry: InstanceRegistry,
        windows: Arc<dyn WindowService>,
        timing: OrchestratorTiming,
    ) -> Self {
        Self {
            id,
            registry,
            windows,
            window: None,
            timing,
            fields: WindowFields::default(),
            pending: None,
            since_reassert: Duration::ZERO,
            mounted: false,
        }
    }

    /// Reflect the window's current geometry into the editable fields.
    pub fn mount(&mut self) {
        self.window = self.windows.window(&self.id);
        if let Some(instance) = self.registry.get(&self.id) {
            self.fields = WindowFields::from_instance(&instance);
        }

        if let Some(window) = &self.window {
            match read_geometry(window.as_ref()) {
                Ok(geometry) => self.fields.geometry = geometry,
                Err(e) => warn!(instance = %self.id, error = %e, "could not read window geometry"),
            }
            if let Ok(all) = window.is_visible_on_all_workspaces() {
                self.fields.all_workspaces = all;
            }
            if self.fields.translucent {
                if let Err(e) = window.set_effect(Effect::Acrylic) {
                    warn!(instance = %self.id, error = %e, "could not apply window effect");
                }
            }
        } else {
            warn!(instance = %self.id, "no window to orchestrate");
        }

        self.pending = None;
        self.since_reassert = Duration::ZERO;
        self.mounted = true;
        debug!(instance = %self.id, fields = ?self.fields, "window orchestrator mounted");
    }

    pub fn fields(&self) -> &WindowFields {
        &self.fields
    }

    pub fn has_pending_edit(&self) -> bool {
        self.pending.is_some()
    }

    /// Record a geometry edit. Applied once edits stop for the debounce period.
    pub fn edit(&mut self, geometry: Geometry) {
        self.fields.geometry = geometry;
        self.pending = Some(Duration::ZERO);
    }

    pub fn update(&mut self, delta: Duration) {
        if !self.mounted {
            return;
        }

        if let Some(idle) = self.pending {
            let idle = idle + delta;
            if idle >= self.timing.debounce {
                self.pending = None;
                self.apply_geometry();
            } else {
                self.pending = Some(idle);
            }
        }

        self.since_reassert += delta;
        if self.since_reassert >= self.timing.reassert {
            self.since_reassert = Duration::ZERO;
            self.reassert();
        }
    }

    /// Apply a pending edit now.
    pub fn flush(&mut self) {
        if self.pending.take().is_some() {
            self.apply_geometry();
        }
    }

    pub fn set_always_on_top(&mut self, enabled: bool) -> Result<(), OrchestratorError> {
        let previous = self.fields;
        self.fields.always_on_top = enabled;
        let level = level_of(&self.fields);
        self.toggle(previous, InstancePatch::always_on_top(enabled), |w| {
            level.apply(w)
        })
    }

    pub fn set_translucent(&mut self, enabled: bool) -> Result<(), OrchestratorError> {
        let previous = self.fields;
        self.fields.translucent = enabled;
        self.toggle(previous, InstancePatch::acrylic(enabled), |w| {
            if enabled {
                w.set_effect(Effect::Acrylic)
            } else {
                w.clear_effect()
            }
        })
    }

    pub fn set_visible_on_all_workspaces(&mut self, enabled: bool) -> Result<(), OrchestratorError> {
        let previous = self.fields;
        self.fields.all_workspaces = enabled;
        self.toggle(previous, InstancePatch::visible_on_all_workspaces(enabled), |w| {
            w.set_visible_on_all_workspaces(enabled)
        })
    }

    /// Take flag changes from a registry broadcast. Geometry is left alone
    /// while an edit is pending.
    pub fn apply_instance(&mut self, instance: &WidgetInstance) {
        if instance.id != self.id {
            return;
        }
        let mut fields = WindowFields::from_instance(instance);
        if self.pending.is_some() {
            fields.geometry = self.fields.geometry;
        }
        self.fields = fields;
    }

    /// Cancel the pending edit and stop re-asserting effects.
    pub fn unmount(&mut self) {
        if self.pending.take().is_some() {
            debug!(instance = %self.id, "pending window edit discarded");
        }
        self.mounted = false;
        self.window = None;
    }

    fn toggle(
        &mut self,
        previous: WindowFields,
        patch: InstancePatch,
        op: impl FnOnce(&dyn WidgetWindow) -> Result<(), WindowOpError>,
    ) -> Result<(), OrchestratorError> {
        let result = match &self.window {
            Some(window) => op(window.as_ref()),
            None => Err(WindowOpError::NoWindow(self.id.to_string())),
        };
        if let Err(e) = result {
            warn!(instance = %self.id, error = %e, "window toggle failed, reverted");
            self.fields = previous;
            return Err(e.into());
        }

        if let Err(e) = self.registry.update_config(&self.id, patch) {
            warn!(instance = %self.id, error = %e, "window toggle not persisted, reverted");
            self.restore_window(&previous);
            self.fields = previous;
            return Err(e.into());
        }
        Ok(())
    }

    // Best effort: put the window flags back to `fields`.
    fn restore_window(&self, fields: &WindowFields) {
        let Some(window) = &self.window else {
            return;
        };
        let restored = level_of(fields)
            .apply(window.as_ref())
            .and_then(|_| {
                if fields.translucent {
                    window.set_effect(Effect::Acrylic)
                } else {
                    window.clear_effect()
                }
            })
            .and_then(|_| window.set_visible_on_all_workspaces(fields.all_workspaces));
        if let Err(e) = restored {
            warn!(instance = %self.id, error = %e, "window flags not restored");
        }
    }

    fn apply_geometry(&mut self) {
        let geometry = self.fields.geometry;
        let Some(window) = &self.window else {
            warn!(instance = %self.id, "no window for geometry edit");
            return;
        };

        let applied = window
            .set_size(geometry.width, geometry.height)
            .and_then(|_| window.set_position(geometry.x, geometry.y));
        if let Err(e) = applied {
            warn!(instance = %self.id, error = %e, "window geometry not applied");
            if let Ok(actual) = read_geometry(window.as_ref()) {
                self.fields.geometry = actual;
            }
            return;
        }

        match self
            .registry
            .update_config(&self.id, InstancePatch::geometry(geometry))
        {
            Ok(_) => debug!(instance = %self.id, ?geometry, "window geometry saved"),
            Err(e) => warn!(instance = %self.id, error = %e, "window geometry not persisted"),
        }
    }

    fn reassert(&self) {
        if !self.fields.translucent {
            return;
        }
        if let Some(window) = &self.window {
            if let Err(e) = window.set_effect(Effect::Acrylic) {
                debug!(instance = %self.id, error = %e, "effect re-assertion failed");
            }
        }
    }
}

fn level_of(fields: &WindowFields) -> WindowLevel {
    if fields.background {
        WindowLevel::Bottom
    } else if fields.always_on_top {
        WindowLevel::Top
    } else {
        WindowLevel::Normal
    }
}

fn read_geometry(window: &dyn WidgetWindow) -> Result<Geometry, WindowOpError> {
    let scale = window.scale_factor()?;
    let scale = if scale > 0.0 { scale } else { 1.0 };
    let size = window.inner_size()?;
    let position = window.outer_position()?;
    Ok(Geometry {
        x: f64::from(position.x) / scale,
        y: f64::from(position.y) / scale,
        width: f64::from(size.width) / scale,
        height: f64::from(size.height) / scale,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventBus;
    use crate::store::MemoryStore;
    use crate::window::{MemoryWindow, MemoryWindows, PhysicalSize};

    struct Fixture {
        registry: InstanceRegistry,
        store: Arc<MemoryStore>,
        windows: Arc<MemoryWindows>,
        id: InstanceId,
    }

    impl Fixture {
        fn new(scale: f64) -> Self {
            let store = Arc::new(MemoryStore::default());
            let windows = Arc::new(MemoryWindows::with_scale(scale));
            let registry =
                InstanceRegistry::new(store.clone(), EventBus::new(), Some(windows.clone()));
            let id = registry.add("Clock", Geometry::default()).unwrap().id;
            Self {
                registry,
                store,
                windows,
                id,
            }
        }

        fn orchestrator(&self) -> WindowOrchestrator {
            let mut orchestrator = WindowOrchestrator::new(
                self.id.clone(),
                self.registry.clone(),
                self.windows.clone(),
                OrchestratorTiming::default(),
            );
            orchestrator.mount();
            orchestrator
        }

        fn window(&self) -> Arc<MemoryWindow> {
            self.windows.get(&self.id).unwrap()
        }

        fn stored(&self) -> WidgetInstance {
            self.registry.get(&self.id).unwrap()
        }
    }

    fn ms(ms: u64) -> Duration {
        Duration::from_millis(ms)
    }

    fn moved() -> Geometry {
        Geometry {
            x: 40.0,
            y: 50.0,
            width: 320.0,
            height: 240.0,
        }
    }

    #[test]
    fn test_mount_reads_logical_geometry() {
        let fx = Fixture::new(2.0);
        fx.window().set_size(150.0, 100.0).unwrap();

        let orchestrator = fx.orchestrator();
        assert_eq!(orchestrator.fields().geometry.width, 150.0);
        assert_eq!(orchestrator.fields().geometry.height, 100.0);
        assert_eq!(orchestrator.fields().geometry.x, 100.0);
    }

    #[test]
    fn test_edit_is_debounced() {
        let fx = Fixture::new(1.0);
        let mut orchestrator = fx.orchestrator();
        let saves = fx.store.saves();

        orchestrator.edit(moved());
        orchestrator.update(ms(200));
        orchestrator.edit(moved());
        orchestrator.update(ms(200));
        assert_eq!(fx.store.saves(), saves);
        assert_eq!(fx.window().snapshot().size, PhysicalSize { width: 300, height: 200 });

        orchestrator.update(ms(100));
        assert!(!orchestrator.has_pending_edit());
        assert_eq!(fx.store.saves(), saves + 1);
        assert_eq!(fx.window().snapshot().size, PhysicalSize { width: 320, height: 240 });
        assert_eq!(fx.stored().geometry(), moved());
    }

    #[test]
    fn test_geometry_edit_keeps_flags() {
        let fx = Fixture::new(1.0);
        fx.registry
            .update_config(&fx.id, InstancePatch::always_on_top(true))
            .unwrap();
        let mut orchestrator = fx.orchestrator();
        assert!(orchestrator.fields().always_on_top);

        orchestrator.edit(moved());
        orchestrator.flush();

        let stored = fx.stored();
        assert!(stored.always_on_top);
        assert_eq!(stored.geometry(), moved());
    }

    #[test]
    fn test_toggle_applies_and_persists() {
        let fx = Fixture::new(1.0);
        let mut orchestrator = fx.orchestrator();

        orchestrator.set_always_on_top(true).unwrap();
        assert!(fx.window().snapshot().always_on_top);
        assert!(fx.stored().always_on_top);

        orchestrator.set_visible_on_all_workspaces(true).unwrap();
        assert!(fx.window().snapshot().all_workspaces);
        assert!(fx.stored().visible_on_all_workspaces);
    }

    #[test]
    fn test_failed_toggle_reverts() {
        let fx = Fixture::new(1.0);
        let mut orchestrator = fx.orchestrator();
        fx.window().fail("set_effect", true);

        assert!(orchestrator.set_translucent(true).is_err());
        assert!(!orchestrator.fields().translucent);
        assert!(!fx.stored().acrylic);
    }

    #[test]
    fn test_unsaved_toggle_reverts_window() {
        let fx = Fixture::new(1.0);
        let mut orchestrator = fx.orchestrator();
        fx.store.fail_saves(true);

        assert!(orchestrator.set_always_on_top(true).is_err());
        assert!(!orchestrator.fields().always_on_top);
        assert!(!fx.window().snapshot().always_on_top);
        assert!(!fx.stored().always_on_top);

        // the same action succeeds once saving works again
        fx.store.fail_saves(false);
        orchestrator.set_always_on_top(true).unwrap();
        assert!(fx.window().snapshot().always_on_top);
        assert!(fx.stored().always_on_top);
    }

    #[test]
    fn test_effect_reasserted() {
        let fx = Fixture::new(1.0);
        let mut orchestrator = fx.orchestrator();
        orchestrator.set_translucent(true).unwrap();

        fx.window().revert_effect();
        orchestrator.update(ms(1999));
        assert_eq!(fx.window().snapshot().effect, None);

        orchestrator.update(ms(1));
        assert_eq!(fx.window().snapshot().effect, Some(Effect::Acrylic));
    }

    #[test]
    fn test_unmount_cancels_pending_edit() {
        let fx = Fixture::new(1.0);
        let mut orchestrator = fx.orchestrator();
        let saves = fx.store.saves();

        orchestrator.edit(moved());
        orchestrator.unmount();
        orchestrator.update(ms(5000));

        assert_eq!(fx.store.saves(), saves);
        assert_eq!(fx.stored().geometry(), Geometry::default());
    }

    #[test]
    fn test_failed_geometry_apply_reverts_fields() {
        let fx = Fixture::new(1.0);
        let mut orchestrator = fx.orchestrator();
        fx.window().fail("set_size", true);

        orchestrator.edit(moved());
        orchestrator.flush();

        assert_eq!(orchestrator.fields().geometry, Geometry::default());
        assert_eq!(fx.stored().geometry(), Geometry::default());
    }

    #[test]
    fn test_broadcast_updates_flags() {
        let fx = Fixture::new(1.0);
        let mut orchestrator = fx.orchestrator();
        orchestrator.edit(moved());

        let updated = fx
            .registry
            .update_config(&fx.id, InstancePatch::acrylic(true))
            .unwrap();
        orchestrator.apply_instance(&updated);

        assert!(orchestrator.fields().translucent);
        assert_eq!(orchestrator.fields().geometry, moved());
    }
}
