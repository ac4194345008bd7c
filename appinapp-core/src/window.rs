// appinapp-core/src/window.rs
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::registry::{InstanceId, WidgetInstance};
use crate::sync::lock;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WindowOpError {
    #[error("No window for widget instance {0}")]
    NoWindow(String),
    #[error("Window operation '{op}' failed: {message}")]
    Failed { op: &'static str, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PhysicalSize {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PhysicalPosition {
    pub x: i32,
    pub y: i32,
}

/// Logical window geometry.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Geometry {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Default for Geometry {
    fn default() -> Self {
        Self {
            x: 100.0,
            y: 100.0,
            width: 300.0,
            height: 200.0,
        }
    }
}

/// Translucency effect applied behind a widget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Effect {
    #[default]
    Acrylic,
    Blur,
    Mica,
}

/// Stacking level. Background widgets are pinned below normal windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum WindowLevel {
    Bottom,
    Normal,
    Top,
}

impl WindowLevel {
    pub fn of(instance: &WidgetInstance) -> Self {
        if instance.background {
            WindowLevel::Bottom
        } else if instance.always_on_top {
            WindowLevel::Top
        } else {
            WindowLevel::Normal
        }
    }

    pub fn apply(self, window: &dyn WidgetWindow) -> Result<(), WindowOpError> {
        match self {
            WindowLevel::Bottom => {
                window.set_always_on_top(false)?;
                window.set_always_on_bottom(true)
            }
            WindowLevel::Normal => {
                window.set_always_on_bottom(false)?;
                window.set_always_on_top(false)
            }
            WindowLevel::Top => {
                window.set_always_on_bottom(false)?;
                window.set_always_on_top(true)
            }
        }
    }
}

/// One OS-level widget window. Sizes and positions are physical pixels on
/// the query side and logical units on the set side.
pub trait WidgetWindow: Send + Sync {
    fn scale_factor(&self) -> Result<f64, WindowOpError>;
    fn inner_size(&self) -> Result<PhysicalSize, WindowOpError>;
    fn outer_position(&self) -> Result<PhysicalPosition, WindowOpError>;
    fn set_size(&self, width: f64, height: f64) -> Result<(), WindowOpError>;
    fn set_position(&self, x: f64, y: f64) -> Result<(), WindowOpError>;
    fn set_always_on_top(&self, enabled: bool) -> Result<(), WindowOpError>;
    fn set_always_on_bottom(&self, enabled: bool) -> Result<(), WindowOpError>;
    fn set_effect(&self, effect: Effect) -> Result<(), WindowOpError>;
    fn clear_effect(&self) -> Result<(), WindowOpError>;
    fn set_visible_on_all_workspaces(&self, enabled: bool) -> Result<(), WindowOpError>;
    fn is_visible_on_all_workspaces(&self) -> Result<bool, WindowOpError>;
}

/// Host windowing service.
pub trait WindowService: Send + Sync {
    fn window(&self, id: &InstanceId) -> Option<Arc<dyn WidgetWindow>>;
    /// Create the window for an instance. Opening an existing window is a no-op.
    fn open(&self, instance: &WidgetInstance) -> Result<(), WindowOpError>;
    fn close(&self, id: &InstanceId) -> Result<(), WindowOpError>;
}

/// Observable state of a [`MemoryWindow`].
#[derive(Debug, Clone, PartialEq)]
pub struct WindowState {
    pub title: String,
    pub scale: f64,
    pub size: PhysicalSize,
    pub position: PhysicalPosition,
    pub always_on_top: bool,
    pub always_on_bottom: bool,
    pub effect: Option<Effect>,
    pub all_workspaces: bool,
    pub effect_applications: u32,
}

/// Window kept in memory. Backs the terminal host and tests.
pub struct MemoryWindow {
    state: Mutex<WindowState>,
    failing: Mutex<HashSet<&'static str>>,
}

impl MemoryWindow {
    fn new(instance: &WidgetInstance, scale: f64) -> Self {
        Self {
            state: Mutex::new(WindowState {
                title: format!("Widget: {}", instance.widget_type),
                scale,
                size: PhysicalSize {
                    width: to_physical(instance.width, scale).max(0) as u32,
                    height: to_physical(instance.height, scale).max(0) as u32,
                },
                position: PhysicalPosition {
                    x: to_physical(instance.x, scale),
                    y: to_physical(instance.y, scale),
                },
                always_on_top: instance.always_on_top && !instance.background,
                always_on_bottom: instance.background,
                effect: None,
                all_workspaces: instance.visible_on_all_workspaces,
                effect_applications: 0,
            }),
            failing: Mutex::new(HashSet::new()),
        }
    }

    pub fn snapshot(&self) -> WindowState {
        lock(&self.state).clone()
    }

    /// Make `op` fail (or succeed again).
    pub fn fail(&self, op: &'static str, failing: bool) {
        let mut ops = lock(&self.failing);
        if failing {
            ops.insert(op);
        } else {
            ops.remove(op);
        }
    }

    /// Drop the effect the way a compositor does on focus or theme changes.
    pub fn revert_effect(&self) {
        lock(&self.state).effect = None;
    }

    fn check(&self, op: &'static str) -> Result<(), WindowOpError> {
        if lock(&self.failing).contains(op) {
            return Err(WindowOpError::Failed {
                op,
                message: "simulated failure".to_string(),
            });
        }
        Ok(())
    }

    fn with_state<T>(
        &self,
        op: &'static str,
        f: impl FnOnce(&mut WindowState) -> T,
    ) -> Result<T, WindowOpError> {
        self.check(op)?;
        Ok(f(&mut lock(&self.state)))
    }
}

fn to_physical(logical: f64, scale: f64) -> i32 {
    (logical * scale).round() as i32
}

impl WidgetWindow for MemoryWindow {
    fn scale_factor(&self) -> Result<f64, WindowOpError> {
        self.with_state("scale_factor", |s| s.scale)
    }

    fn inner_size(&self) -> Result<PhysicalSize, WindowOpError> {
        self.with_state("inner_size", |s| s.size)
    }

    fn outer_position(&self) -> Result<PhysicalPosition, WindowOpError> {
        self.with_state("outer_position", |s| s.position)
    }

    fn set_size(&self, width: f64, height: f64) -> Result<(), WindowOpError> {
        self.with_state("set_size", |s| {
            s.size = PhysicalSize {
                width: to_physical(width, s.scale).max(0) as u32,
                height: to_physical(height, s.scale).max(0) as u32,
            };
        })
    }

    fn set_position(&self, x: f64, y: f64) -> Result<(), WindowOpError> {
        self.with_state("set_position", |s| {
            s.position = PhysicalPosition {
                x: to_physical(x, s.scale),
                y: to_physical(y, s.scale),
            };
        })
    }

    fn set_always_on_top(&self, enabled: bool) -> Result<(), WindowOpError> {
        self.with_state("set_always_on_top", |s| s.always_on_top = enabled)
    }

    fn set_always_on_bottom(&self, enabled: bool) -> Result<(), WindowOpError> {
        self.with_state("set_always_on_bottom", |s| s.always_on_bottom = enabled)
    }

    fn set_effect(&self, effect: Effect) -> Result<(), WindowOpError> {
        self.with_state("set_effect", |s| {
            s.effect = Some(effect);
            s.effect_applications += 1;
        })
    }

    fn clear_effect(&self) -> Result<(), WindowOpError> {
        self.with_state("clear_effect", |s| s.effect = None)
    }

    fn set_visible_on_all_workspaces(&self, enabled: bool) -> Result<(), WindowOpError> {
        self.with_state("set_visible_on_all_workspaces", |s| s.all_workspaces = enabled)
    }

    fn is_visible_on_all_workspaces(&self) -> Result<bool, WindowOpError> {
        self.with_state("is_visible_on_all_workspaces", |s| s.all_workspaces)
    }
}

/// [`WindowService`] over [`MemoryWindow`]s.
pub struct MemoryWindows {
    scale: f64,
    windows: Mutex<HashMap<InstanceId, Arc<MemoryWindow>>>,
    fail_open: Mutex<bool>,
}

impl Default for MemoryWindows {
    fn default() -> Self {
        Self::with_scale(1.0)
    }
}

impl MemoryWindows {
    pub fn with_scale(scale: f64) -> Self {
        Self {
            scale,
            windows: Mutex::new(HashMap::new()),
            fail_open: Mutex::new(false),
        }
    }

    pub fn get(&self, id: &InstanceId) -> Option<Arc<MemoryWindow>> {
        lock(&self.windows).get(id).cloned()
    }

    pub fn ids(&self) -> Vec<InstanceId> {
        lock(&self.windows).keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.windows).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn fail_open(&self, failing: bool) {
        *lock(&self.fail_open) = failing;
    }
}

impl WindowService for MemoryWindows {
    fn window(&self, id: &InstanceId) -> Option<Arc<dyn WidgetWindow>> {
        self.get(id).map(|w| w as Arc<dyn WidgetWindow>)
    }

    fn open(&self, instance: &WidgetInstance) -> Result<(), WindowOpError> {
        if *lock(&self.fail_open) {
            return Err(WindowOpError::Failed {
                op: "open",
                message: "simulated failure".to_string(),
            });
        }
        let mut windows = lock(&self.windows);
        if windows.contains_key(&instance.id) {
            return Ok(());
        }
        windows.insert(
            instance.id.clone(),
            Arc::new(MemoryWindow::new(instance, self.scale)),
        );
        debug!(instance = %instance.id, label = %instance.window_label(), "window opened");
        Ok(())
    }

    fn close(&self, id: &InstanceId) -> Result<(), WindowOpError> {
        match lock(&self.windows).remove(id) {
            Some(_) => {
                debug!(instance = %id, "window closed");
                Ok(())
            }
            None => Err(WindowOpError::NoWindow(id.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance() -> WidgetInstance {
        WidgetInstance::new("Clock", Geometry::default())
    }

    #[test]
    fn test_open_uses_instance_geometry() {
        let windows = MemoryWindows::with_scale(2.0);
        let inst = instance();
        windows.open(&inst).unwrap();

        let state = windows.get(&inst.id).unwrap().snapshot();
        assert_eq!(state.size, PhysicalSize { width: 600, height: 400 });
        assert_eq!(state.position, PhysicalPosition { x: 200, y: 200 });
        assert_eq!(state.title, "Widget: Clock");
    }

    #[test]
    fn test_open_is_idempotent_and_close() {
        let windows = MemoryWindows::default();
        let inst = instance();
        windows.open(&inst).unwrap();
        windows.get(&inst.id).unwrap().set_size(10.0, 10.0).unwrap();
        windows.open(&inst).unwrap();

        assert_eq!(windows.len(), 1);
        assert_eq!(
            windows.get(&inst.id).unwrap().snapshot().size,
            PhysicalSize { width: 10, height: 10 }
        );

        windows.close(&inst.id).unwrap();
        assert!(windows.is_empty());
        assert!(matches!(
            windows.close(&inst.id),
            Err(WindowOpError::NoWindow(_))
        ));
    }

    #[test]
    fn test_failure_injection() {
        let windows = MemoryWindows::default();
        let inst = instance();
        windows.open(&inst).unwrap();
        let window = windows.get(&inst.id).unwrap();

        window.fail("set_always_on_top", true);
        assert!(window.set_always_on_top(true).is_err());
        assert!(!window.snapshot().always_on_top);

        window.fail("set_always_on_top", false);
        window.set_always_on_top(true).unwrap();
        assert!(window.snapshot().always_on_top);
    }

    #[test]
    fn test_window_levels() {
        let mut inst = instance();
        assert_eq!(WindowLevel::of(&inst), WindowLevel::Normal);
        inst.always_on_top = true;
        assert_eq!(WindowLevel::of(&inst), WindowLevel::Top);
        inst.background = true;
        assert_eq!(WindowLevel::of(&inst), WindowLevel::Bottom);

        let windows = MemoryWindows::default();
        windows.open(&inst).unwrap();
        let window = windows.get(&inst.id).unwrap();
        WindowLevel::Bottom.apply(window.as_ref()).unwrap();
        let state = window.snapshot();
        assert!(state.always_on_bottom && !state.always_on_top);

        WindowLevel::Top.apply(window.as_ref()).unwrap();
        let state = window.snapshot();
        assert!(!state.always_on_bottom && state.always_on_top);
    }
}
