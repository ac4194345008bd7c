// appinapp-core/src/registry.rs
use std::fmt;
use std::sync::{Arc, Mutex};

use crossbeam::channel::Receiver;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::event::{Event, EventBus, Subscription, WIDGETS_UPDATE};
use crate::store::{Store, StoreError};
use crate::sync::lock;
use crate::window::{Effect, Geometry, WindowLevel, WindowService};

/// Opaque instance id, stable for the instance's lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(String);

impl InstanceId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for InstanceId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Window label prefix of widget windows: `widget-<id>`
pub const WIDGET_LABEL_PREFIX: &str = "widget-";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Active,
    Background,
}

/// One running widget and its window configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WidgetInstance {
    pub id: InstanceId,
    #[serde(rename = "w_type")]
    pub widget_type: String,
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    #[serde(default)]
    pub always_on_top: bool,
    #[serde(default)]
    pub acrylic: bool,
    #[serde(default)]
    pub visible_on_all_workspaces: bool,
    #[serde(default)]
    pub background: bool,
}

impl WidgetInstance {
    pub fn new(widget_type: impl Into<String>, geometry: Geometry) -> Self {
        Self {
            id: InstanceId::generate(),
            widget_type: widget_type.into(),
            x: geometry.x,
            y: geometry.y,
            width: geometry.width,
            height: geometry.height,
            always_on_top: false,
            acrylic: false,
            visible_on_all_workspaces: false,
            background: false,
        }
    }

    pub fn geometry(&self) -> Geometry {
        Geometry {
            x: self.x,
            y: self.y,
            width: self.width,
            height: self.height,
        }
    }

    pub fn window_label(&self) -> String {
        format!("{WIDGET_LABEL_PREFIX}{}", self.id)
    }

    pub fn state(&self) -> InstanceState {
        if self.background {
            InstanceState::Background
        } else {
            InstanceState::Active
        }
    }
}

/// Partial update for `update_config`. Unset fields are left alone.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct InstancePatch {
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub width: Option<f64>,
    pub height: Option<f64>,
    pub always_on_top: Option<bool>,
    pub acrylic: Option<bool>,
    pub visible_on_all_workspaces: Option<bool>,
}

impl InstancePatch {
    pub fn geometry(geometry: Geometry) -> Self {
        Self {
            x: Some(geometry.x),
            y: Some(geometry.y),
            width: Some(geometry.width),
            height: Some(geometry.height),
            ..Self::default()
        }
    }

    pub fn always_on_top(enabled: bool) -> Self {
        Self {
            always_on_top: Some(enabled),
            ..Self::default()
        }
    }

    pub fn acrylic(enabled: bool) -> Self {
        Self {
            acrylic: Some(enabled),
            ..Self::default()
        }
    }

    pub fn visible_on_all_workspaces(enabled: bool) -> Self {
        Self {
            visible_on_all_workspaces: Some(enabled),
            ..Self::default()
        }
    }

    fn apply(&self, instance: &mut WidgetInstance) {
        if let Some(x) = self.x {
            instance.x = x;
        }
        if let Some(y) = self.y {
            instance.y = y;
        }
        if let Some(width) = self.width {
            instance.width = width;
        }
        if let Some(height) = self.height {
            instance.height = height;
        }
        if let Some(on_top) = self.always_on_top {
            instance.always_on_top = on_top;
        }
        if let Some(acrylic) = self.acrylic {
            instance.acrylic = acrylic;
        }
        if let Some(all) = self.visible_on_all_workspaces {
            instance.visible_on_all_workspaces = all;
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Unknown widget instance: {0}")]
    UnknownInstance(InstanceId),
    #[error("Failed to persist widget instances: {0}")]
    Store(#[from] StoreError),
}

/// Full instance list at one revision. This is what every broadcast carries.
#[derive(Debug, Clone, Default)]
pub struct RegistrySnapshot {
    pub revision: u64,
    pub instances: Arc<Vec<WidgetInstance>>,
}

impl RegistrySnapshot {
    pub fn find(&self, id: &InstanceId) -> Option<&WidgetInstance> {
        self.instances.iter().find(|i| &i.id == id)
    }
}

struct RegistryInner {
    state: Mutex<RegistrySnapshot>,
    store: Arc<dyn Store>,
    bus: EventBus,
    windows: Option<Arc<dyn WindowService>>,
}

/// Authoritative, ordered list of widget instances.
///
/// Every mutation is persisted first, then committed under a new revision
/// and broadcast in full on [`WIDGETS_UPDATE`]. A failed save leaves the
/// list untouched and broadcasts nothing. Windows are opened and closed
/// alongside; a window failure is logged and never undoes the mutation.
#[derive(Clone)]
pub struct InstanceRegistry {
    inner: Arc<RegistryInner>,
}

impl InstanceRegistry {
    pub fn new(
        store: Arc<dyn Store>,
        bus: EventBus,
        windows: Option<Arc<dyn WindowService>>,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                state: Mutex::new(RegistrySnapshot::default()),
                store,
                bus,
                windows,
            }),
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    /// Reload the persisted list, open every window and broadcast once.
    pub fn restore(&self) -> Result<usize, RegistryError> {
        let instances = self.inner.store.load_instances()?;
        let count = instances.len();
        {
            let mut state = lock(&self.inner.state);
            self.publish(&mut state, instances);
        }
        for instance in self.instances().iter() {
            self.open_window(instance);
        }
        info!(count, "widget instances restored");
        Ok(count)
    }

    pub fn add(&self, widget_type: &str, geometry: Geometry) -> Result<WidgetInstance, RegistryError> {
        let instance = WidgetInstance::new(widget_type, geometry);
        self.mutate(|list| {
            list.push(instance.clone());
            Ok(())
        })?;
        info!(instance = %instance.id, widget_type, "widget instance added");
        self.open_window(&instance);
        Ok(instance)
    }

    pub fn remove(&self, id: &InstanceId) -> Result<(), RegistryError> {
        self.mutate(|list| {
            let before = list.len();
            list.retain(|i| &i.id != id);
            if list.len() == before {
                return Err(RegistryError::UnknownInstance(id.clone()));
            }
            Ok(())
        })?;
        info!(instance = %id, "widget instance removed");

        if let Some(windows) = &self.inner.windows {
            if let Err(e) = windows.close(id) {
                warn!(instance = %id, error = %e, "failed to close widget window");
            }
        }
        Ok(())
    }

    pub fn update_config(
        &self,
        id: &InstanceId,
        patch: InstancePatch,
    ) -> Result<WidgetInstance, RegistryError> {
        let updated = self.mutate(|list| {
            let instance = find_mut(list, id)?;
            patch.apply(instance);
            Ok(instance.clone())
        })?;
        debug!(instance = %id, ?patch, "widget instance updated");
        Ok(updated)
    }

    /// Flip `active ⇄ background`. Background widgets sit below other windows.
    pub fn toggle_background(&self, id: &InstanceId) -> Result<WidgetInstance, RegistryError> {
        let updated = self.mutate(|list| {
            let instance = find_mut(list, id)?;
            instance.background = !instance.background;
            Ok(instance.clone())
        })?;
        info!(instance = %id, state = ?updated.state(), "widget state toggled");

        if let Some(window) = self.inner.windows.as_ref().and_then(|w| w.window(id)) {
            if let Err(e) = WindowLevel::of(&updated).apply(window.as_ref()) {
                warn!(instance = %id, error = %e, "failed to apply window level");
            }
        }
        Ok(updated)
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        lock(&self.inner.state).clone()
    }

    pub fn instances(&self) -> Arc<Vec<WidgetInstance>> {
        lock(&self.inner.state).instances.clone()
    }

    pub fn get(&self, id: &InstanceId) -> Option<WidgetInstance> {
        lock(&self.inner.state).find(id).cloned()
    }

    pub fn subscribe(&self) -> (Subscription, Receiver<Event>) {
        self.inner.bus.subscribe(WIDGETS_UPDATE)
    }

    // Persist, commit and broadcast under the state lock so revisions and
    // broadcasts come out in the same order.
    fn mutate<T>(
        &self,
        f: impl FnOnce(&mut Vec<WidgetInstance>) -> Result<T, RegistryError>,
    ) -> Result<T, RegistryError> {
        let mut state = lock(&self.inner.state);
        let mut next = state.instances.as_ref().clone();
        let value = f(&mut next)?;
        if let Err(e) = self.inner.store.save_instances(&next) {
            warn!(error = %e, "widget instances not saved, change dropped");
            return Err(e.into());
        }
        self.publish(&mut state, next);
        Ok(value)
    }

    fn publish(&self, state: &mut RegistrySnapshot, instances: Vec<WidgetInstance>) {
        state.revision += 1;
        state.instances = Arc::new(instances);
        debug!(revision = state.revision, count = state.instances.len(), "broadcasting widget list");
        self.inner.bus.publish(Event::new(WIDGETS_UPDATE, state.clone()));
    }

    fn open_window(&self, instance: &WidgetInstance) {
        let Some(windows) = &self.inner.windows else {
            return;
        };
        if let Err(e) = windows.open(instance) {
            warn!(instance = %instance.id, error = %e, "failed to open widget window");
            return;
        }
        let Some(window) = windows.window(&instance.id) else {
            return;
        };
        let mut result = WindowLevel::of(instance).apply(window.as_ref());
        if result.is_ok() && instance.acrylic {
            result = window.set_effect(Effect::Acrylic);
        }
        if let Err(e) = result {
            warn!(instance = %instance.id, error = %e, "failed to apply window flags");
        }
    }
}

fn find_mut<'a>(
    list: &'a mut [WidgetInstance],
    id: &InstanceId,
) -> Result<&'a mut WidgetInstance, RegistryError> {
    list.iter_mut()
        .find(|i| &i.id == id)
        .ok_or_else(|| RegistryError::UnknownInstance(id.clone()))
}

/// One window's local copy of the instance list.
///
/// Subscribes before its first fetch, then only ever adopts newer revisions,
/// so a direct fetch and the broadcast stream converge on the same list.
pub struct RegistryView {
    registry: InstanceRegistry,
    _subscription: Subscription,
    rx: Receiver<Event>,
    current: RegistrySnapshot,
}

impl RegistryView {
    pub fn new(registry: InstanceRegistry) -> Self {
        let (subscription, rx) = registry.subscribe();
        let mut view = Self {
            registry,
            _subscription: subscription,
            rx,
            current: RegistrySnapshot::default(),
        };
        view.fetch();
        view
    }

    /// Ask the registry directly.
    pub fn fetch(&mut self) -> bool {
        let snapshot = self.registry.snapshot();
        self.adopt(snapshot)
    }

    /// Drain pending broadcasts. Returns whether the list changed.
    pub fn sync(&mut self) -> bool {
        let mut changed = false;
        while let Ok(event) = self.rx.try_recv() {
            if let Some(snapshot) = event.payload.downcast::<RegistrySnapshot>() {
                changed |= self.adopt(snapshot.as_ref().clone());
            }
        }
        changed
    }

    pub fn instances(&self) -> &[WidgetInstance] {
        &self.current.instances
    }

    pub fn find(&self, id: &InstanceId) -> Option<&WidgetInstance> {
        self.current.find(id)
    }

    pub fn revision(&self) -> u64 {
        self.current.revision
    }

    fn adopt(&mut self, snapshot: RegistrySnapshot) -> bool {
        if snapshot.revision <= self.current.revision {
            return false;
        }
        self.current = snapshot;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::window::MemoryWindows;

    fn registry() -> (InstanceRegistry, Arc<MemoryStore>, Arc<MemoryWindows>) {
        let store = Arc::new(MemoryStore::default());
        let windows = Arc::new(MemoryWindows::default());
        let registry = InstanceRegistry::new(store.clone(), EventBus::new(), Some(windows.clone()));
        (registry, store, windows)
    }

    fn broadcasts(rx: &Receiver<Event>) -> Vec<Arc<RegistrySnapshot>> {
        rx.try_iter()
            .filter_map(|e| e.payload.downcast::<RegistrySnapshot>())
            .collect()
    }

    #[test]
    fn test_add_then_remove_broadcasts_twice() {
        let (registry, _store, windows) = registry();
        let (_sub, rx) = registry.subscribe();

        let clock = registry
            .add(
                "Clock",
                Geometry {
                    x: 100.0,
                    y: 100.0,
                    width: 300.0,
                    height: 200.0,
                },
            )
            .unwrap();
        assert_eq!(windows.len(), 1);

        registry.remove(&clock.id).unwrap();
        assert!(registry.instances().is_empty());
        assert!(windows.is_empty());

        let seen = broadcasts(&rx);
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].instances.len(), 1);
        assert_eq!(seen[0].instances[0].widget_type, "Clock");
        assert!(seen[1].instances.is_empty());
        assert!(seen[0].revision < seen[1].revision);
    }

    #[test]
    fn test_remove_unknown() {
        let (registry, _store, _windows) = registry();
        let (_sub, rx) = registry.subscribe();

        let err = registry.remove(&InstanceId::from("nope")).unwrap_err();
        assert!(matches!(err, RegistryError::UnknownInstance(_)));
        assert!(broadcasts(&rx).is_empty());
    }

    #[test]
    fn test_update_config_round_trip() {
        let (registry, store, _windows) = registry();
        let inst = registry.add("Clock", Geometry::default()).unwrap();

        registry
            .update_config(&inst.id, InstancePatch::always_on_top(true))
            .unwrap();
        assert!(registry.get(&inst.id).unwrap().always_on_top);

        let moved = Geometry {
            x: 5.0,
            y: 6.0,
            width: 120.0,
            height: 80.0,
        };
        registry
            .update_config(&inst.id, InstancePatch::geometry(moved))
            .unwrap();

        let current = registry.get(&inst.id).unwrap();
        assert!(current.always_on_top);
        assert_eq!(current.geometry(), moved);
        assert_eq!(store.load_instances().unwrap()[0], current);
    }

    #[test]
    fn test_toggle_background() {
        let (registry, _store, windows) = registry();
        let inst = registry.add("Clock", Geometry::default()).unwrap();
        assert_eq!(inst.state(), InstanceState::Active);

        let toggled = registry.toggle_background(&inst.id).unwrap();
        assert_eq!(toggled.state(), InstanceState::Background);
        assert!(windows.get(&inst.id).unwrap().snapshot().always_on_bottom);

        let toggled = registry.toggle_background(&inst.id).unwrap();
        assert_eq!(toggled.state(), InstanceState::Active);
        assert!(!windows.get(&inst.id).unwrap().snapshot().always_on_bottom);
    }

    #[test]
    fn test_failed_save_changes_nothing() {
        let (registry, store, windows) = registry();
        let (_sub, rx) = registry.subscribe();
        store.fail_saves(true);

        assert!(matches!(
            registry.add("Clock", Geometry::default()),
            Err(RegistryError::Store(_))
        ));
        assert!(registry.instances().is_empty());
        assert!(windows.is_empty());
        assert!(broadcasts(&rx).is_empty());
    }

    #[test]
    fn test_window_failure_keeps_instance() {
        let (registry, _store, windows) = registry();
        windows.fail_open(true);

        let inst = registry.add("Clock", Geometry::default()).unwrap();
        assert!(registry.get(&inst.id).is_some());
        assert!(windows.is_empty());
    }

    #[test]
    fn test_restore_opens_windows() {
        let mut pinned = WidgetInstance::new("Clock", Geometry::default());
        pinned.background = true;
        let saved = vec![pinned.clone(), WidgetInstance::new("Todo", Geometry::default())];
        let store = Arc::new(MemoryStore::with_instances(saved));
        let windows = Arc::new(MemoryWindows::default());
        let registry = InstanceRegistry::new(store, EventBus::new(), Some(windows.clone()));
        let (_sub, rx) = registry.subscribe();

        assert_eq!(registry.restore().unwrap(), 2);
        assert_eq!(windows.len(), 2);
        assert!(windows.get(&pinned.id).unwrap().snapshot().always_on_bottom);
        assert_eq!(broadcasts(&rx).len(), 1);
    }

    #[test]
    fn test_view_converges() {
        let (registry, _store, _windows) = registry();
        let mut view = RegistryView::new(registry.clone());
        assert!(view.instances().is_empty());

        registry.add("Clock", Geometry::default()).unwrap();
        registry.add("Todo", Geometry::default()).unwrap();

        // direct fetch first, then the two queued broadcasts
        assert!(view.fetch());
        assert!(!view.sync());
        assert_eq!(view.instances().len(), 2);
        assert_eq!(view.revision(), registry.snapshot().revision);

        let other = registry.instances()[0].id.clone();
        registry.remove(&other).unwrap();
        assert!(view.sync());
        assert!(view.find(&other).is_none());
        assert_eq!(view.instances(), registry.instances().as_slice());
    }

    #[test]
    fn test_serialized_field_names() {
        let inst = WidgetInstance::new("Clock", Geometry::default());
        let encoded = toml::to_string(&inst).unwrap();
        assert!(encoded.contains("w_type = \"Clock\""));
        assert!(inst.window_label().starts_with("widget-"));
    }
}
