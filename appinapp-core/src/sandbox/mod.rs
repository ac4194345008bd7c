// appinapp-core/src/sandbox/mod.rs
//! Execution sandbox for widget source.
//!
//! Every module gets its own Lua VM with a reduced standard library. The
//! transpiled chunk runs against a private scope table whose reads fall back
//! to the VM globals, so whatever the widget assigns stays in its scope. The
//! scope exposes `exports`, `module`, the element factory and a `require`
//! that only resolves [`ALLOWED_MODULES`].

mod runtime;
pub mod transpile;

use std::path::Path;

use mlua::prelude::*;
use tracing::debug;

pub use runtime::{ALLOWED_MODULES, ICON_TAG};
pub use transpile::{TranspileError, transpile};

use transpile::{ELEMENT_FACTORY, INTEROP_DEFAULT};

#[derive(Debug, Clone, thiserror::Error)]
pub enum SandboxError {
    #[error("Transpile error: {0}")]
    Transpile(#[from] TranspileError),
    #[error("Sandbox execution error: {0}")]
    Execution(String),
    #[error("Unresolved dependency: '{0}' is not an allowed module")]
    UnresolvedDependency(String),
    #[error("Module produced no exports")]
    NoExports,
}

// Set by `require` so a failed chunk can be reported as an import problem.
struct UnresolvedImport(String);

/// Result of running widget source: the VM and its exports table.
pub struct SandboxModule {
    lua: Lua,
    exports: LuaRegistryKey,
}

impl std::fmt::Debug for SandboxModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxModule").finish_non_exhaustive()
    }
}

impl SandboxModule {
    pub fn lua(&self) -> &Lua {
        &self.lua
    }

    pub fn exports(&self) -> LuaResult<LuaTable> {
        self.lua.registry_value(&self.exports)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Sandbox;

impl Sandbox {
    pub fn new() -> Self {
        Self
    }

    /// Transpile and run `source`, collecting what it exports.
    pub fn execute(&self, source: &str, chunk_name: &str) -> Result<SandboxModule, SandboxError> {
        let code = transpile(source)?;
        let lua = Lua::new_with(
            LuaStdLib::TABLE | LuaStdLib::STRING | LuaStdLib::MATH | LuaStdLib::UTF8 | LuaStdLib::OS,
            LuaOptions::default(),
        )
        .map_err(|e| SandboxError::Execution(e.to_string()))?;

        let (scope, module) = build_scope(&lua).map_err(|e| SandboxError::Execution(e.to_string()))?;

        let returned = lua
            .load(&code)
            .set_name(chunk_name)
            .set_environment(scope)
            .call::<LuaValue>(())
            .map_err(|e| classify(&lua, e))?;

        let exports = collect_exports(&lua, &module, returned)
            .map_err(|e| SandboxError::Execution(e.to_string()))?
            .ok_or(SandboxError::NoExports)?;
        let exports = lua
            .create_registry_value(exports)
            .map_err(|e| SandboxError::Execution(e.to_string()))?;

        debug!(chunk = chunk_name, "executed widget source");
        Ok(SandboxModule { lua, exports })
    }

    /// Execute a file straight from disk.
    pub fn execute_file(&self, path: &Path) -> Result<SandboxModule, SandboxError> {
        let source = std::fs::read_to_string(path)
            .map_err(|e| SandboxError::Execution(format!("{}: {e}", path.display())))?;
        self.execute(&source, &format!("@{}", path.display()))
    }
}

fn build_scope(lua: &Lua) -> LuaResult<(LuaTable, LuaTable)> {
    runtime::install(lua)?;

    let scope = lua.create_table()?;
    let exports = lua.create_table()?;
    let module = lua.create_table()?;
    module.set("exports", exports.clone())?;

    scope.set("exports", exports)?;
    scope.set("module", module.clone())?;
    scope.set(ELEMENT_FACTORY, runtime::element_factory(lua)?)?;
    scope.set(INTEROP_DEFAULT, runtime::interop_default(lua)?)?;
    scope.set(
        "require",
        lua.create_function(|lua, name: String| match runtime::resolve(lua, &name)? {
            Some(module) => {
                lua.remove_app_data::<UnresolvedImport>();
                Ok(module)
            }
            None => {
                let message = unresolved_message(&name);
                lua.set_app_data(UnresolvedImport(name));
                Err(LuaError::RuntimeError(message))
            }
        })?,
    )?;

    let meta = lua.create_table()?;
    meta.set("__index", lua.globals())?;
    scope.set_metatable(Some(meta));

    Ok((scope, module))
}

// `module.exports` may have been replaced, and plain Lua modules `return` their table.
fn collect_exports(lua: &Lua, module: &LuaTable, returned: LuaValue) -> LuaResult<Option<LuaTable>> {
    let exports = match module.get::<LuaValue>("exports")? {
        LuaValue::Table(table) => Some(table),
        LuaValue::Nil => None,
        other => {
            let wrapped = lua.create_table()?;
            wrapped.set("default", other)?;
            Some(wrapped)
        }
    };

    let exports_empty = match &exports {
        Some(table) => table.pairs::<LuaValue, LuaValue>().next().is_none(),
        None => true,
    };
    if exports_empty {
        match returned {
            LuaValue::Table(table) => return Ok(Some(table)),
            LuaValue::Function(component) => {
                let wrapped = lua.create_table()?;
                wrapped.set("default", component)?;
                return Ok(Some(wrapped));
            }
            _ => {}
        }
    }

    Ok(exports.filter(|_| !exports_empty))
}

fn unresolved_message(name: &str) -> String {
    format!("module '{name}' is not available to widgets")
}

fn classify(lua: &Lua, error: LuaError) -> SandboxError {
    // A caught failed `require` must not mask an unrelated error.
    if let Some(UnresolvedImport(name)) = lua.remove_app_data::<UnresolvedImport>() {
        if error.to_string().contains(&unresolved_message(&name)) {
            return SandboxError::UnresolvedDependency(name);
        }
    }
    match error {
        LuaError::SyntaxError { message, .. } => SandboxError::Transpile(TranspileError {
            line: syntax_error_line(&message),
            message,
        }),
        other => SandboxError::Execution(other.to_string()),
    }
}

// `[string "Clock"]:3: unexpected symbol` -> 3
fn syntax_error_line(message: &str) -> usize {
    let Some(start) = message.find("]:").map(|i| i + 2) else {
        return 0;
    };
    message[start..]
        .chars()
        .take_while(char::is_ascii_digit)
        .collect::<String>()
        .parse()
        .unwrap_or(0)
}
