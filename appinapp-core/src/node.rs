// appinapp-core/src/node.rs
use std::collections::BTreeMap;

use mlua::prelude::*;

const MAX_DEPTH: usize = 128;
const MAX_CHILDREN: usize = 10_000;

// Elements that start on their own line in `text_content`.
const BLOCK_TAGS: &[&str] = &[
    "div", "p", "h1", "h2", "h3", "h4", "h5", "h6", "li", "ul", "ol", "section", "header",
    "footer", "br", "pre", "table", "tr",
];

/// Renderable tree produced by a widget component.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Node {
    #[default]
    Empty,
    Text(String),
    Element {
        tag: String,
        props: BTreeMap<String, String>,
        children: Vec<Node>,
    },
    Fragment(Vec<Node>),
}

impl Node {
    pub fn text(value: impl Into<String>) -> Self {
        Node::Text(value.into())
    }

    pub fn element(tag: impl Into<String>, children: Vec<Node>) -> Self {
        Node::Element {
            tag: tag.into(),
            props: BTreeMap::new(),
            children,
        }
    }

    /// Convert the value a component returned.
    pub fn from_lua(value: LuaValue) -> LuaResult<Self> {
        convert(value, 0)
    }

    /// HTML-like serialisation for hosts that render markup.
    pub fn to_markup(&self) -> String {
        let mut out = String::new();
        self.write_markup(&mut out);
        out
    }

    fn write_markup(&self, out: &mut String) {
        match self {
            Node::Empty => {}
            Node::Text(text) => out.push_str(&escape(text, false)),
            Node::Fragment(children) => children.iter().for_each(|c| c.write_markup(out)),
            Node::Element {
                tag,
                props,
                children,
            } => {
                out.push('<');
                out.push_str(tag);
                for (key, value) in props {
                    let key = if key == "className" { "class" } else { key };
                    out.push_str(&format!(" {}=\"{}\"", key, escape(value, true)));
                }
                if children.is_empty() {
                    out.push_str(" />");
                    return;
                }
                out.push('>');
                children.iter().for_each(|c| c.write_markup(out));
                out.push_str(&format!("</{tag}>"));
            }
        }
    }

    /// Visible text, block elements on separate lines. Used by terminal hosts.
    pub fn text_content(&self) -> String {
        let mut out = String::new();
        self.write_text(&mut out);
        out.lines()
            .map(str::trim_end)
            .filter(|l| !l.trim().is_empty())
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn write_text(&self, out: &mut String) {
        match self {
            Node::Empty => {}
            Node::Text(text) => out.push_str(text),
            Node::Fragment(children) => children.iter().for_each(|c| c.write_text(out)),
            Node::Element { tag, children, .. } => {
                let block = BLOCK_TAGS.contains(&tag.as_str());
                if block {
                    out.push('\n');
                }
                if tag == "icon" {
                    out.push('◆');
                }
                children.iter().for_each(|c| c.write_text(out));
                if block {
                    out.push('\n');
                }
            }
        }
    }
}

fn convert(value: LuaValue, depth: usize) -> LuaResult<Node> {
    if depth > MAX_DEPTH {
        return Err(LuaError::RuntimeError(
            "render tree is too deep (cyclic children?)".to_string(),
        ));
    }

    match value {
        LuaValue::Nil | LuaValue::Boolean(_) => Ok(Node::Empty),
        LuaValue::Integer(i) => Ok(Node::Text(i.to_string())),
        LuaValue::Number(n) => Ok(Node::Text(format_number(n))),
        LuaValue::String(s) => Ok(Node::Text(s.to_str()?.to_string())),
        LuaValue::Table(table) => {
            if let Some(tag) = table.get::<Option<String>>("tag")? {
                let props = match table.get::<Option<LuaTable>>("props")? {
                    Some(props) => convert_props(props)?,
                    None => BTreeMap::new(),
                };
                let children = convert_children(table.get("children")?, depth)?;
                Ok(Node::Element {
                    tag,
                    props,
                    children,
                })
            } else if table.get::<Option<bool>>("fragment")?.unwrap_or(false) {
                Ok(Node::Fragment(convert_children(table.get("children")?, depth)?))
            } else {
                Ok(Node::Fragment(convert_children(LuaValue::Table(table), depth)?))
            }
        }
        other => Err(LuaError::RuntimeError(format!(
            "cannot render a value of type {}",
            other.type_name()
        ))),
    }
}

fn convert_children(value: LuaValue, depth: usize) -> LuaResult<Vec<Node>> {
    let LuaValue::Table(children) = value else {
        return Ok(Vec::new());
    };

    // `n` survives nil holes from conditional children.
    let len = match children.get::<Option<i64>>("n")? {
        Some(n) => usize::try_from(n.max(0)).unwrap_or(usize::MAX),
        None => children.raw_len(),
    };
    if len > MAX_CHILDREN {
        return Err(LuaError::RuntimeError(format!(
            "too many children ({len}, at most {MAX_CHILDREN})"
        )));
    }

    let mut nodes = Vec::new();
    for i in 1..=len {
        let node = convert(children.get(i)?, depth + 1)?;
        match node {
            Node::Empty => {}
            Node::Fragment(inner) => nodes.extend(inner),
            node => nodes.push(node),
        }
    }
    Ok(nodes)
}

fn convert_props(props: LuaTable) -> LuaResult<BTreeMap<String, String>> {
    let mut out = BTreeMap::new();
    for pair in props.pairs::<String, LuaValue>() {
        let (key, value) = pair?;
        if key == "children" {
            continue;
        }
        match value {
            LuaValue::Boolean(true) => {
                out.insert(key, "true".to_string());
            }
            LuaValue::Integer(i) => {
                out.insert(key, i.to_string());
            }
            LuaValue::Number(n) => {
                out.insert(key, format_number(n));
            }
            LuaValue::String(s) => {
                out.insert(key, s.to_str()?.to_string());
            }
            LuaValue::Table(style) => {
                out.insert(key, flatten_style(style)?);
            }
            // false, nil and handler functions never reach markup
            _ => {}
        }
    }
    Ok(out)
}

/// `{ fontSize = "2rem", margin = 0 }` -> `font-size: 2rem; margin: 0;`
fn flatten_style(style: LuaTable) -> LuaResult<String> {
    let mut entries = BTreeMap::new();
    for pair in style.pairs::<String, LuaValue>() {
        let (key, value) = pair?;
        let value = match value {
            LuaValue::Integer(i) => i.to_string(),
            LuaValue::Number(n) => format_number(n),
            LuaValue::String(s) => s.to_str()?.to_string(),
            _ => continue,
        };
        entries.insert(kebab_case(&key), value);
    }
    Ok(entries
        .iter()
        .map(|(k, v)| format!("{k}: {v};"))
        .collect::<Vec<_>>()
        .join(" "))
}

fn kebab_case(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 4);
    for c in key.chars() {
        if c.is_ascii_uppercase() {
            out.push('-');
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

fn format_number(n: f64) -> String {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{n:.0}")
    } else {
        n.to_string()
    }
}

fn escape(text: &str, attribute: bool) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' if attribute => out.push_str("&quot;"),
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalars() {
        let lua = Lua::new();
        assert_eq!(Node::from_lua(LuaValue::Nil).unwrap(), Node::Empty);
        assert_eq!(Node::from_lua(LuaValue::Integer(4)).unwrap(), Node::text("4"));
        assert_eq!(Node::from_lua(LuaValue::Number(2.0)).unwrap(), Node::text("2"));
        assert_eq!(Node::from_lua(LuaValue::Number(2.5)).unwrap(), Node::text("2.5"));
        let s = lua.create_string("hi").unwrap();
        assert_eq!(Node::from_lua(LuaValue::String(s)).unwrap(), Node::text("hi"));
    }

    #[test]
    fn test_element_table() {
        let lua = Lua::new();
        let value: LuaValue = lua
            .load(
                r#"return {
                    tag = "div",
                    props = { className = "box", hidden = false, onClick = function() end,
                              style = { fontSize = "2rem", margin = 0 } },
                    children = { "a", nil, { tag = "b", children = { "c" } }, n = 3 },
                }"#,
            )
            .eval()
            .unwrap();

        let node = Node::from_lua(value).unwrap();
        let Node::Element {
            tag,
            props,
            children,
        } = &node
        else {
            panic!("expected element");
        };
        assert_eq!(tag, "div");
        assert_eq!(props.get("className").unwrap(), "box");
        assert_eq!(props.get("style").unwrap(), "font-size: 2rem; margin: 0;");
        assert!(!props.contains_key("hidden"));
        assert!(!props.contains_key("onClick"));
        assert_eq!(children.len(), 2);

        assert_eq!(
            node.to_markup(),
            "<div class=\"box\" style=\"font-size: 2rem; margin: 0;\">a<b>c</b></div>"
        );
    }

    #[test]
    fn test_array_is_fragment() {
        let lua = Lua::new();
        let value: LuaValue = lua.load(r#"return { "x", 1 }"#).eval().unwrap();
        assert_eq!(
            Node::from_lua(value).unwrap(),
            Node::Fragment(vec![Node::text("x"), Node::text("1")])
        );
    }

    #[test]
    fn test_cyclic_children_error() {
        let lua = Lua::new();
        let value: LuaValue = lua
            .load(r#"local t = { tag = "div" } t.children = { t } return t"#)
            .eval()
            .unwrap();
        assert!(Node::from_lua(value).is_err());
    }

    #[test]
    fn test_oversized_child_count_error() {
        let lua = Lua::new();
        let value: LuaValue = lua
            .load(r#"return { "a", n = 1700000000 }"#)
            .eval()
            .unwrap();
        assert!(Node::from_lua(value).is_err());

        let value: LuaValue = lua
            .load(r#"return { tag = "ul", children = { n = 10001 } }"#)
            .eval()
            .unwrap();
        assert!(Node::from_lua(value).is_err());
    }

    #[test]
    fn test_markup_escaping() {
        let mut props = BTreeMap::new();
        props.insert("title".to_string(), "a \"q\"".to_string());
        let node = Node::Element {
            tag: "p".into(),
            props,
            children: vec![Node::text("1 < 2 & 3")],
        };
        assert_eq!(
            node.to_markup(),
            "<p title=\"a &quot;q&quot;\">1 &lt; 2 &amp; 3</p>"
        );
    }

    #[test]
    fn test_text_content_blocks() {
        let node = Node::element(
            "div",
            vec![
                Node::element("h1", vec![Node::text("12:30")]),
                Node::element("h2", vec![Node::text("Mon")]),
                Node::element("span", vec![Node::text("inline")]),
            ],
        );
        assert_eq!(node.text_content(), "12:30\nMon\ninline");
    }
}
