// appinapp-core/src/sandbox/runtime.rs
//! Modules a widget may `require`: the component runtime and the icon set.

use mlua::prelude::*;

pub(crate) const UI_MODULE: &str = "ui";
pub(crate) const ICONS_MODULE: &str = "icons";

/// Names widget code can import. Everything else is an unresolved dependency.
pub const ALLOWED_MODULES: &[&str] = &[UI_MODULE, ICONS_MODULE];

const UI_KEY: &str = "appinapp.module.ui";
const ICONS_KEY: &str = "appinapp.module.icons";

/// Tag of the elements produced by icon components.
pub const ICON_TAG: &str = "icon";

/// Build the allow-listed modules into the registry of a fresh VM.
pub(crate) fn install(lua: &Lua) -> LuaResult<()> {
    let ui = lua.create_table()?;
    ui.set("h", element_factory(lua)?)?;
    ui.set(
        "Fragment",
        lua.create_function(|lua, props: Option<LuaTable>| {
            let children = match &props {
                Some(props) => props.get::<LuaValue>("children")?,
                None => LuaNil,
            };
            fragment(lua, children)
        })?,
    )?;
    ui.set(
        "join",
        lua.create_function(|lua, (items, separator): (LuaTable, LuaValue)| {
            let joined = lua.create_table()?;
            let mut n = 0;
            for (i, item) in items.sequence_values::<LuaValue>().enumerate() {
                if i > 0 {
                    n += 1;
                    joined.raw_set(n, separator.clone())?;
                }
                n += 1;
                joined.raw_set(n, item?)?;
            }
            joined.raw_set("n", n)?;
            Ok(joined)
        })?,
    )?;
    lua.set_named_registry_value(UI_KEY, ui)?;

    let icons = lua.create_table()?;
    let meta = lua.create_table()?;
    meta.set(
        "__index",
        lua.create_function(|lua, (icons, name): (LuaTable, String)| {
            let icon_name = name.clone();
            let component = lua.create_function(move |lua, props: Option<LuaTable>| {
                let props = match props {
                    Some(props) => props,
                    None => lua.create_table()?,
                };
                let children = props.get::<LuaValue>("children")?;
                props.set("name", icon_name.as_str())?;
                props.set("children", LuaNil)?;
                element(lua, ICON_TAG, Some(props), children)
            })?;
            icons.raw_set(name, component.clone())?;
            Ok(component)
        })?,
    )?;
    icons.set_metatable(Some(meta));
    lua.set_named_registry_value(ICONS_KEY, icons)?;

    Ok(())
}

/// Resolve an allow-listed module, `None` for anything else.
pub(crate) fn resolve(lua: &Lua, name: &str) -> LuaResult<Option<LuaValue>> {
    let key = match name {
        UI_MODULE => UI_KEY,
        ICONS_MODULE => ICONS_KEY,
        _ => return Ok(None),
    };
    lua.named_registry_value(key).map(Some)
}

/// `h(tag, props, ...children)`
///
/// * string tag: an intrinsic element table `{ tag, props, children }`
/// * function tag: a component, called with `props.children` set
/// * nil tag: a fragment
pub(crate) fn element_factory(lua: &Lua) -> LuaResult<LuaFunction> {
    lua.create_function(
        |lua, (tag, props, children): (LuaValue, Option<LuaTable>, LuaMultiValue)| {
            let children = LuaValue::Table(children_table(lua, children)?);
            match tag {
                LuaValue::Nil => fragment(lua, children),
                LuaValue::String(tag) => {
                    element(lua, &tag.to_str()?, props, children).map(LuaValue::Table)
                }
                LuaValue::Function(component) => {
                    let props = match props {
                        Some(props) => props,
                        None => lua.create_table()?,
                    };
                    props.set("children", children)?;
                    component.call::<LuaValue>(props)
                }
                other => Err(LuaError::RuntimeError(format!(
                    "invalid element type: {}",
                    other.type_name()
                ))),
            }
        },
    )
}

/// `function(m) return m.default or m end` for table modules.
pub(crate) fn interop_default(lua: &Lua) -> LuaResult<LuaFunction> {
    lua.create_function(|_, module: LuaValue| {
        if let LuaValue::Table(table) = &module {
            let default: LuaValue = table.raw_get("default")?;
            if !default.is_nil() {
                return Ok(default);
            }
        }
        Ok(module)
    })
}

fn element(
    lua: &Lua,
    tag: &str,
    props: Option<LuaTable>,
    children: LuaValue,
) -> LuaResult<LuaTable> {
    let node = lua.create_table()?;
    node.set("tag", tag)?;
    node.set("props", props)?;
    node.set("children", children)?;
    Ok(node)
}

fn fragment(lua: &Lua, children: LuaValue) -> LuaResult<LuaValue> {
    let node = lua.create_table()?;
    node.set("fragment", true)?;
    node.set("children", children)?;
    Ok(LuaValue::Table(node))
}

// Keeps nil holes addressable through `n`.
fn children_table(lua: &Lua, children: LuaMultiValue) -> LuaResult<LuaTable> {
    let table = lua.create_table()?;
    let mut n = 0;
    for child in children {
        n += 1;
        table.raw_set(n, child)?;
    }
    table.raw_set("n", n)?;
    Ok(table)
}
