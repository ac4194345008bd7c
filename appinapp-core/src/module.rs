// appinapp-core/src/module.rs
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use mlua::prelude::*;

use crate::command::CommandError;
use crate::node::Node;
use crate::sandbox::SandboxModule;

/// Manual command entry point handed to a widget as `props.run`.
pub type RunHandle = Arc<dyn Fn(&str) -> Result<String, CommandError> + Send + Sync>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum RenderError {
    #[error("Widget module has no default component")]
    MissingComponent,
    #[error("Widget render failed: {0}")]
    Script(String),
}

impl From<LuaError> for RenderError {
    fn from(e: LuaError) -> Self {
        RenderError::Script(e.to_string())
    }
}

/// Window geometry a module may declare (`windowTop`, `windowLeft`, ...).
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DeclaredGeometry {
    pub top: Option<f64>,
    pub left: Option<f64>,
    pub width: Option<f64>,
    pub height: Option<f64>,
}

impl DeclaredGeometry {
    pub fn is_empty(&self) -> bool {
        self.top.is_none() && self.left.is_none() && self.width.is_none() && self.height.is_none()
    }
}

/// Props passed to the default component on every render.
pub struct RenderProps {
    pub output: String,
    pub error: Option<String>,
    pub run: RunHandle,
}

/// Loaded, executable widget bundle.
pub struct WidgetModule {
    type_name: String,
    source_path: PathBuf,
    command: Option<String>,
    refresh_frequency: Option<Duration>,
    geometry: DeclaredGeometry,
    style: Option<String>,
    sandbox: SandboxModule,
    component: Option<LuaRegistryKey>,
}

impl std::fmt::Debug for WidgetModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WidgetModule")
            .field("type_name", &self.type_name)
            .field("source_path", &self.source_path)
            .field("command", &self.command)
            .field("refresh_frequency", &self.refresh_frequency)
            .finish_non_exhaustive()
    }
}

impl WidgetModule {
    /// Read the declared metadata out of a module's exports.
    pub fn from_sandbox(
        type_name: impl Into<String>,
        source_path: impl Into<PathBuf>,
        sandbox: SandboxModule,
    ) -> LuaResult<Self> {
        let exports = sandbox.exports()?;

        let command = exports
            .get::<Option<String>>("command")?
            .filter(|c| !c.trim().is_empty());
        // 0, negative or absent: run once
        let refresh_frequency = exports
            .get::<Option<f64>>("refreshFrequency")?
            .filter(|ms| ms.is_finite() && *ms > 0.0)
            .map(|ms| Duration::from_millis(ms as u64));
        let geometry = DeclaredGeometry {
            top: exports.get("windowTop")?,
            left: exports.get("windowLeft")?,
            width: exports.get("windowWidth")?,
            height: exports.get("windowHeight")?,
        };
        let style = match exports.get::<Option<String>>("className")? {
            Some(style) => Some(style),
            None => exports.get::<Option<String>>("style")?,
        };

        let component = match exports.get::<LuaValue>("default")? {
            value @ (LuaValue::Function(_) | LuaValue::Table(_) | LuaValue::String(_)) => {
                Some(sandbox.lua().create_registry_value(value)?)
            }
            _ => None,
        };

        Ok(Self {
            type_name: type_name.into(),
            source_path: source_path.into(),
            command,
            refresh_frequency,
            geometry,
            style,
            sandbox,
            component,
        })
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn source_path(&self) -> &Path {
        &self.source_path
    }

    /// Bundle folder, the base for `./` commands.
    pub fn bundle_dir(&self) -> &Path {
        self.source_path.parent().unwrap_or(Path::new("."))
    }

    pub fn command(&self) -> Option<&str> {
        self.command.as_deref()
    }

    pub fn refresh_frequency(&self) -> Option<Duration> {
        self.refresh_frequency
    }

    pub fn geometry(&self) -> DeclaredGeometry {
        self.geometry
    }

    pub fn style(&self) -> Option<&str> {
        self.style.as_deref()
    }

    pub fn has_component(&self) -> bool {
        self.component.is_some()
    }

    /// Call the default component. A non-function default renders as-is.
    pub fn render(&self, props: RenderProps) -> Result<Node, RenderError> {
        let key = self.component.as_ref().ok_or(RenderError::MissingComponent)?;
        let lua = self.sandbox.lua();
        let component: LuaValue = lua.registry_value(key)?;

        let LuaValue::Function(component) = component else {
            return Ok(Node::from_lua(component)?);
        };

        let run = props.run;
        let table = lua.create_table()?;
        table.set("output", props.output)?;
        table.set("error", props.error)?;
        table.set(
            "run",
            lua.create_function(move |_, command: String| {
                run(&command).map_err(LuaError::external)
            })?,
        )?;

        let value: LuaValue = component.call(table)?;
        Ok(Node::from_lua(value)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::Sandbox;

    fn module(source: &str) -> WidgetModule {
        let sandbox = Sandbox::new().execute(source, "test").unwrap();
        WidgetModule::from_sandbox("Test", "/w/Test.widget/index.lua", sandbox).unwrap()
    }

    fn props(output: &str) -> RenderProps {
        RenderProps {
            output: output.to_string(),
            error: None,
            run: Arc::new(|cmd: &str| Ok(format!("ran {cmd}"))),
        }
    }

    #[test]
    fn test_metadata() {
        let m = module(
            r#"
            export const command = "./bin/status"
            export const refreshFrequency = 1500
            export const windowTop = 10
            export const windowWidth = 320.5
            export const className = "color: white;"
            export default function() return "x" end
            "#,
        );
        assert_eq!(m.command(), Some("./bin/status"));
        assert_eq!(m.refresh_frequency(), Some(Duration::from_millis(1500)));
        assert_eq!(m.geometry().top, Some(10.0));
        assert_eq!(m.geometry().width, Some(320.5));
        assert_eq!(m.geometry().left, None);
        assert_eq!(m.style(), Some("color: white;"));
        assert_eq!(m.bundle_dir(), Path::new("/w/Test.widget"));
    }

    #[test]
    fn test_zero_frequency_runs_once() {
        let m = module("export const refreshFrequency = 0\nexport default 1");
        assert_eq!(m.refresh_frequency(), None);
        assert_eq!(m.command(), None);
        assert!(m.geometry().is_empty());
    }

    #[test]
    fn test_render_contract() {
        let m = module(
            r#"
            export default function(props)
                local err = props.error and ("!" .. props.error) or ""
                return <p>{props.output}{err} {props.run("uptime")}</p>
            end
            "#,
        );
        let node = m.render(props("up")).unwrap();
        assert_eq!(node.text_content(), "up ran uptime");

        let node = m
            .render(RenderProps {
                error: Some("bad".into()),
                ..props("up")
            })
            .unwrap();
        assert_eq!(node.text_content(), "up!bad ran uptime");
    }

    #[test]
    fn test_run_failure_raises_in_widget() {
        let m = module(
            r#"
            export default function(props)
                local ok = pcall(props.run, "false")
                return ok and "ok" or "failed"
            end
            "#,
        );
        let node = m
            .render(RenderProps {
                run: Arc::new(|cmd: &str| {
                    Err(CommandError::Exit {
                        command: cmd.to_string(),
                        code: Some(1),
                        stderr: String::new(),
                    })
                }),
                ..props("")
            })
            .unwrap();
        assert_eq!(node, Node::text("failed"));
    }

    #[test]
    fn test_missing_component() {
        let m = module("export const command = \"date\"");
        assert!(!m.has_component());
        assert!(matches!(
            m.render(props("")),
            Err(RenderError::MissingComponent)
        ));
    }

    #[test]
    fn test_render_error() {
        let m = module("export default function() error(\"kaput\") end");
        assert!(matches!(m.render(props("")), Err(RenderError::Script(msg)) if msg.contains("kaput")));
    }

    #[test]
    fn test_static_default() {
        let m = module("export default <span>static</span>");
        assert_eq!(m.render(props("")).unwrap().to_markup(), "<span>static</span>");
    }
}
