// appinapp-cli/src/app.rs
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};
use tracing::{info, warn};

use appinapp_core::{
    AppStats, BundleWatcher, ControlSurface, Geometry, InstanceId, MemoryWindows, ProcessRole,
    Runtime, WidgetHost, WidgetInstance, WindowContent, WindowLevel,
};

const MOVE_STEP: f64 = 16.0;
const RESIZE_STEP: f64 = 16.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Focus {
    Types,
    Instances,
}

/// One widget window as the desktop view draws it.
pub struct Pane {
    pub title: String,
    pub geometry: Geometry,
    pub level: WindowLevel,
    pub selected: bool,
    pub content: WindowContent,
}

/// Control surface plus every widget host of this process.
pub struct App {
    control: ControlSurface,
    windows: Arc<MemoryWindows>,
    hosts: HashMap<InstanceId, WidgetHost>,
    role: ProcessRole,
    watcher: Option<BundleWatcher>,
    pub focus: Focus,
    pub selected_type: usize,
    pub selected_instance: usize,
    pub status: Option<String>,
    pub folder_input: Option<String>,
}

impl App {
    pub fn new(
        runtime: Runtime,
        windows: Arc<MemoryWindows>,
        role: ProcessRole,
        watcher: Option<BundleWatcher>,
    ) -> Self {
        let mut app = Self {
            control: ControlSurface::new(runtime),
            windows,
            hosts: HashMap::new(),
            role,
            watcher,
            focus: Focus::Types,
            selected_type: 0,
            selected_instance: 0,
            status: None,
            folder_input: None,
        };
        app.control.sample_stats();
        app.reconcile();
        app
    }

    pub fn role(&self) -> &ProcessRole {
        &self.role
    }

    pub fn types(&self) -> Vec<&str> {
        self.control.available_types()
    }

    pub fn instances(&self) -> &[WidgetInstance] {
        self.control.instances()
    }

    pub fn stats(&self) -> AppStats {
        self.control.stats()
    }

    pub fn widget_folder(&self) -> PathBuf {
        self.control.widget_folder()
    }

    pub fn scan_error(&self) -> Option<String> {
        self.control.scan().error.as_ref().map(|e| e.to_string())
    }

    pub fn hot_reload(&self) -> bool {
        self.watcher.is_some()
    }

    pub fn tick(&mut self, delta: Duration) {
        if self.control.update(delta) {
            self.reconcile();
        }

        if let Some(watcher) = &self.watcher {
            let runtime = self.control.runtime();
            let changed = watcher.pump(&runtime.loader, runtime.bus());
            if !changed.is_empty() {
                info!(types = ?changed, "bundles changed, reloading");
                self.control.rescan();
            }
        }

        for host in self.hosts.values_mut() {
            host.update(delta);
        }
    }

    /// Returns true to quit.
    pub fn handle_key(&mut self, key: KeyEvent) -> bool {
        if self.folder_input.is_some() {
            self.handle_folder_input(key);
            return false;
        }

        match key.code {
            KeyCode::Char('q') => return true,
            KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => return true,
            KeyCode::Tab => {
                self.focus = match self.focus {
                    Focus::Types => Focus::Instances,
                    Focus::Instances => Focus::Types,
                };
            }
            KeyCode::Up => self.select(-1),
            KeyCode::Down => self.select(1),
            KeyCode::Enter => self.add_selected(),
            KeyCode::Char('d') => match self.focus {
                Focus::Types => self.delete_selected_type(),
                Focus::Instances => self.remove_selected(),
            },
            KeyCode::Char('b') => self.with_selected(|app, id| {
                app.control
                    .toggle_background(&id)
                    .map(|_| ())
                    .map_err(|e| e.to_string())
            }),
            KeyCode::Char('t') => self.toggle_window_flag(|host| {
                let enabled = !host.orchestrator_mut().fields().always_on_top;
                host.orchestrator_mut().set_always_on_top(enabled)
            }),
            KeyCode::Char('a') => self.toggle_window_flag(|host| {
                let enabled = !host.orchestrator_mut().fields().translucent;
                host.orchestrator_mut().set_translucent(enabled)
            }),
            KeyCode::Char('v') => self.toggle_window_flag(|host| {
                let enabled = !host.orchestrator_mut().fields().all_workspaces;
                host.orchestrator_mut().set_visible_on_all_workspaces(enabled)
            }),
            KeyCode::Char('h') => self.edit_geometry(|g| g.x = (g.x - MOVE_STEP).max(0.0)),
            KeyCode::Char('l') => self.edit_geometry(|g| g.x += MOVE_STEP),
            KeyCode::Char('k') => self.edit_geometry(|g| g.y = (g.y - MOVE_STEP).max(0.0)),
            KeyCode::Char('j') => self.edit_geometry(|g| g.y += MOVE_STEP),
            KeyCode::Char('+') => self.edit_geometry(|g| {
                g.width += RESIZE_STEP;
                g.height += RESIZE_STEP;
            }),
            KeyCode::Char('-') => self.edit_geometry(|g| {
                g.width = (g.width - RESIZE_STEP).max(RESIZE_STEP * 4.0);
                g.height = (g.height - RESIZE_STEP).max(RESIZE_STEP * 2.0);
            }),
            KeyCode::Char('r') => self.reload(),
            KeyCode::Char('w') => {
                self.folder_input = Some(self.widget_folder().display().to_string());
            }
            _ => {}
        }
        false
    }

    /// Panes to draw, bottom-most first.
    pub fn panes(&mut self) -> Vec<Pane> {
        let selected = self.selected_id();
        let mut panes = Vec::new();
        for instance in self.control.instances().to_vec() {
            if let ProcessRole::WidgetHost(only) = &self.role {
                if *only != instance.id {
                    continue;
                }
            }
            let Some(host) = self.hosts.get_mut(&instance.id) else {
                continue;
            };
            // edited fields, so a move shows before the debounced apply
            let geometry = host.orchestrator_mut().fields().geometry;
            let window = self.windows.get(&instance.id).map(|w| w.snapshot());
            let mut title = format!(" {} ", instance.widget_type);
            if let Some(window) = &window {
                if window.effect.is_some() {
                    title.push_str("~ ");
                }
                if window.all_workspaces {
                    title.push_str("* ");
                }
            }
            panes.push(Pane {
                title,
                geometry,
                level: WindowLevel::of(&instance),
                selected: selected.as_ref() == Some(&instance.id),
                content: host.render(),
            });
        }
        panes.sort_by_key(|p| p.level);
        panes
    }

    pub fn shutdown(&mut self) {
        for host in self.hosts.values_mut() {
            host.unmount();
        }
        self.hosts.clear();
    }

    fn reconcile(&mut self) {
        let ids: Vec<InstanceId> = self
            .control
            .instances()
            .iter()
            .map(|i| i.id.clone())
            .filter(|id| match &self.role {
                ProcessRole::ControlSurface => true,
                ProcessRole::WidgetHost(only) => only == id,
            })
            .collect();

        self.hosts.retain(|id, _| ids.contains(id));
        for id in ids {
            if self.hosts.contains_key(&id) {
                continue;
            }
            let mut host = WidgetHost::new(id.clone(), self.control.runtime().clone());
            host.start();
            self.hosts.insert(id, host);
        }

        let count = self.control.instances().len();
        if self.selected_instance >= count {
            self.selected_instance = count.saturating_sub(1);
        }
        self.restart_watcher();
    }

    // the watched folder follows the widget folder setting
    fn restart_watcher(&mut self) {
        let root = self.widget_folder();
        let stale = self.watcher.as_ref().is_some_and(|w| w.root() != root);
        if stale {
            self.watcher = BundleWatcher::new(root)
                .inspect_err(|e| warn!(error = %e, "hot reload disabled"))
                .ok();
        }
    }

    fn select(&mut self, step: isize) {
        let (index, len) = match self.focus {
            Focus::Types => (&mut self.selected_type, self.control.available_types().len()),
            Focus::Instances => (&mut self.selected_instance, self.control.instances().len()),
        };
        if len == 0 {
            *index = 0;
            return;
        }
        *index = (*index as isize + step).rem_euclid(len as isize) as usize;
    }

    fn selected_id(&self) -> Option<InstanceId> {
        self.control
            .instances()
            .get(self.selected_instance)
            .map(|i| i.id.clone())
    }

    fn add_selected(&mut self) {
        if self.focus != Focus::Types {
            return;
        }
        let Some(widget_type) = self
            .control
            .available_types()
            .get(self.selected_type)
            .map(|t| t.to_string())
        else {
            return;
        };
        match self.control.add(&widget_type, None) {
            Ok(instance) => {
                self.status = Some(format!("Added {widget_type}"));
                self.reconcile();
                self.selected_instance = self
                    .control
                    .instances()
                    .iter()
                    .position(|i| i.id == instance.id)
                    .unwrap_or(0);
            }
            Err(e) => self.status = Some(e.to_string()),
        }
    }

    fn remove_selected(&mut self) {
        self.with_selected(|app, id| app.control.remove(&id).map_err(|e| e.to_string()));
        self.reconcile();
    }

    fn delete_selected_type(&mut self) {
        let Some(widget_type) = self
            .control
            .available_types()
            .get(self.selected_type)
            .map(|t| t.to_string())
        else {
            return;
        };
        self.status = Some(match self.control.delete_type(&widget_type) {
            Ok(()) => format!("Deleted {widget_type}.widget"),
            Err(e) => e.to_string(),
        });
        self.select(0);
    }

    fn reload(&mut self) {
        self.control.rescan();
        if let Some(id) = self.selected_id() {
            self.control.runtime().loader.invalidate_all();
            if let Some(host) = self.hosts.get_mut(&id) {
                host.reload();
            }
        }
        self.status = Some("Rescanned widget folder".to_string());
    }

    fn with_selected(&mut self, f: impl FnOnce(&mut Self, InstanceId) -> Result<(), String>) {
        let Some(id) = self.selected_id() else {
            return;
        };
        if let Err(e) = f(self, id) {
            self.status = Some(e);
        }
    }

    fn toggle_window_flag<E: std::fmt::Display>(
        &mut self,
        f: impl FnOnce(&mut WidgetHost) -> Result<(), E>,
    ) {
        let Some(id) = self.selected_id() else {
            return;
        };
        if let Some(host) = self.hosts.get_mut(&id) {
            if let Err(e) = f(host) {
                self.status = Some(e.to_string());
            }
        }
    }

    fn edit_geometry(&mut self, f: impl FnOnce(&mut Geometry)) {
        let Some(id) = self.selected_id() else {
            return;
        };
        if let Some(host) = self.hosts.get_mut(&id) {
            let mut geometry = host.orchestrator_mut().fields().geometry;
            f(&mut geometry);
            host.orchestrator_mut().edit(geometry);
        }
    }

    fn handle_folder_input(&mut self, key: KeyEvent) {
        let Some(input) = self.folder_input.as_mut() else {
            return;
        };
        match key.code {
            KeyCode::Esc => self.folder_input = None,
            KeyCode::Backspace => {
                input.pop();
            }
            KeyCode::Char(c) => input.push(c),
            KeyCode::Enter => {
                let folder = PathBuf::from(input.trim());
                self.folder_input = None;
                self.status = Some(match self.control.set_widget_folder(&folder) {
                    Ok(()) => format!("Widget folder: {}", folder.display()),
                    Err(e) => e.to_string(),
                });
                self.selected_type = 0;
                self.restart_watcher();
            }
            _ => {}
        }
    }
}
