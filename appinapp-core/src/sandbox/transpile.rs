//! Source transform for widget code.
//!
//! Widgets are Lua extended with ES-style module statements and component
//! markup. This pass rewrites both into plain Lua:
//!
//! * `import X from "ui"` becomes `local X = __interop_default(require("ui"))`
//! * `export local command = "date"` becomes `local command = "date"` plus a
//!   trailing `exports["command"] = command`
//! * `<div class="a">{output}</div>` becomes `h("div", {class="a"}, (output))`
//!
//! Everything else (strings, comments, ordinary code) is copied verbatim.
//! Newlines swallowed by a rewrite are re-emitted so that line numbers in
//! runtime errors still point at the widget author's source.

/// Element factory the sandbox injects into every widget scope.
pub const ELEMENT_FACTORY: &str = "h";

/// Helper the sandbox injects to unwrap default imports.
pub const INTEROP_DEFAULT: &str = "__interop_default";

const LUA_KEYWORDS: &[&str] = &[
    "and", "break", "do", "else", "elseif", "end", "false", "for", "function", "goto", "if", "in",
    "local", "nil", "not", "or", "repeat", "return", "then", "true", "until", "while",
];

// After these keywords an expression (and so markup) may start.
const EXPR_KEYWORDS: &[&str] = &[
    "return", "and", "or", "not", "then", "else", "do", "in", "if", "elseif", "while", "until",
];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("line {line}: {message}")]
pub struct TranspileError {
    pub line: usize,
    pub message: String,
}

/// Rewrite widget source into plain Lua.
pub fn transpile(source: &str) -> Result<String, TranspileError> {
    let mut transpiler = Transpiler::new(source, false, 1);
    transpiler.run()?;
    Ok(transpiler.finish())
}

struct Transpiler {
    src: Vec<char>,
    pos: usize,
    out: String,
    // Nested transpilers handle `{expr}` inside markup; module statements are
    // not allowed there.
    nested: bool,
    line_base: usize,
    expr_start: bool,
    line_start: bool,
    exports: Vec<(String, String)>,
    imports: usize,
}

impl Transpiler {
    fn new(source: &str, nested: bool, line_base: usize) -> Self {
        Self {
            src: source.chars().collect(),
            pos: 0,
            out: String::with_capacity(source.len()),
            nested,
            line_base,
            expr_start: true,
            line_start: !nested,
            exports: Vec::new(),
            imports: 0,
        }
    }

    fn run(&mut self) -> Result<(), TranspileError> {
        while let Some(c) = self.peek() {
            match c {
                '\n' => {
                    self.bump_copy();
                    self.line_start = !self.nested;
                }
                c if c.is_whitespace() => self.bump_copy(),
                '-' if self.peek_at(1) == Some('-') => self.copy_comment()?,
                '"' | '\'' => {
                    let end = self.quoted_end(self.pos)?;
                    self.copy_to(end);
                    self.mark_operand();
                }
                '[' if self.long_bracket_level(self.pos).is_some() => {
                    let end = self.long_bracket_end(self.pos)?;
                    self.copy_to(end);
                    self.mark_operand();
                }
                '<' if self.expr_start && self.markup_follows() => {
                    let start = self.pos;
                    let code = self.element()?;
                    self.out.push_str(&code);
                    self.push_newlines(start);
                    self.mark_operand();
                }
                c if is_ident_start(c) => self.word()?,
                c if c.is_ascii_digit() => {
                    self.copy_number();
                    self.mark_operand();
                }
                ')' | ']' | '}' => {
                    self.bump_copy();
                    self.mark_operand();
                }
                ';' => {
                    self.bump_copy();
                    self.expr_start = true;
                    self.line_start = !self.nested;
                }
                _ => {
                    self.bump_copy();
                    self.expr_start = true;
                    self.line_start = false;
                }
            }
        }
        Ok(())
    }

    fn finish(mut self) -> String {
        if !self.exports.is_empty() {
            self.out.push('\n');
            for (exported, local) in &self.exports {
                self.out
                    .push_str(&format!("exports[{}] = {}\n", lua_string(exported), local));
            }
        }
        self.out
    }

    // --- cursor helpers -------------------------------------------------

    fn peek(&self) -> Option<char> {
        self.src.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.src.get(self.pos + offset).copied()
    }

    fn eat(&mut self, c: char) -> bool {
        if self.peek() == Some(c) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_char(&mut self, c: char) -> Result<(), TranspileError> {
        if self.eat(c) {
            Ok(())
        } else {
            let found = self
                .peek()
                .map(|f| format!("'{f}'"))
                .unwrap_or_else(|| "end of input".to_string());
            Err(self.error(format!("expected '{c}', found {found}")))
        }
    }

    fn bump_copy(&mut self) {
        if let Some(c) = self.peek() {
            self.out.push(c);
            self.pos += 1;
        }
    }

    fn copy_to(&mut self, end: usize) {
        self.out.extend(&self.src[self.pos..end]);
        self.pos = end;
    }

    fn skip_ws(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.pos += 1;
        }
    }

    fn skip_inline_ws(&mut self) {
        while matches!(self.peek(), Some(' ' | '\t')) {
            self.pos += 1;
        }
    }

    fn mark_operand(&mut self) {
        self.expr_start = false;
        self.line_start = false;
    }

    fn line(&self) -> usize {
        self.line_at(self.pos)
    }

    fn line_at(&self, pos: usize) -> usize {
        let end = pos.min(self.src.len());
        self.line_base + self.src[..end].iter().filter(|&&c| c == '\n').count()
    }

    fn error(&self, message: impl Into<String>) -> TranspileError {
        TranspileError {
            line: self.line(),
            message: message.into(),
        }
    }

    fn error_at(&self, pos: usize, message: impl Into<String>) -> TranspileError {
        TranspileError {
            line: self.line_at(pos),
            message: message.into(),
        }
    }

    /// Re-emit the newlines consumed since `start`.
    fn push_newlines(&mut self, start: usize) {
        let count = self.src[start..self.pos].iter().filter(|&&c| c == '\n').count();
        for _ in 0..count {
            self.out.push('\n');
        }
    }

    // --- lexical pieces -------------------------------------------------

    fn read_ident(&mut self) -> String {
        let start = self.pos;
        while self.peek().is_some_and(is_ident_continue) {
            self.pos += 1;
        }
        self.src[start..self.pos].iter().collect()
    }

    fn ident(&mut self) -> Result<String, TranspileError> {
        let at = self.pos;
        let name = self.read_ident();
        if name.is_empty() {
            return Err(self.error("expected identifier"));
        }
        if LUA_KEYWORDS.contains(&name.as_str()) {
            return Err(self.error_at(at, format!("'{name}' is a reserved word")));
        }
        Ok(name)
    }

    fn expect_word(&mut self, word: &str) -> Result<(), TranspileError> {
        let at = self.pos;
        let found = self.read_ident();
        if found == word {
            Ok(())
        } else {
            Err(self.error_at(at, format!("expected '{word}'")))
        }
    }

    fn string_literal(&mut self) -> Result<String, TranspileError> {
        let quote = match self.peek() {
            Some(q @ ('"' | '\'')) => q,
            _ => return Err(self.error("expected module name string")),
        };
        let end = self.quoted_end(self.pos)?;
        let value = self.src[self.pos + 1..end - 1].iter().collect::<String>();
        if value.contains('\\') || value.contains(quote) {
            return Err(self.error("module names may not contain escapes"));
        }
        self.pos = end;
        Ok(value)
    }

    /// Index just past the closing quote of the string starting at `at`.
    fn quoted_end(&self, at: usize) -> Result<usize, TranspileError> {
        let quote = self.src[at];
        let mut i = at + 1;
        while let Some(&c) = self.src.get(i) {
            match c {
                '\\' => i += 2,
                '\n' => return Err(self.error_at(at, "unfinished string")),
                c if c == quote => return Ok(i + 1),
                _ => i += 1,
            }
        }
        Err(self.error_at(at, "unfinished string"))
    }

    /// `[[`, `[=[`, ... at `at`: returns the number of `=`.
    fn long_bracket_level(&self, at: usize) -> Option<usize> {
        if self.src.get(at) != Some(&'[') {
            return None;
        }
        let mut level = 0;
        while self.src.get(at + 1 + level) == Some(&'=') {
            level += 1;
        }
        (self.src.get(at + 1 + level) == Some(&'[')).then_some(level)
    }

    fn long_bracket_end(&self, at: usize) -> Result<usize, TranspileError> {
        let level = self
            .long_bracket_level(at)
            .ok_or_else(|| self.error_at(at, "malformed long bracket"))?;
        let mut i = at + level + 2;
        while i < self.src.len() {
            if self.src[i] == ']'
                && (1..=level).all(|k| self.src.get(i + k) == Some(&'='))
                && self.src.get(i + level + 1) == Some(&']')
            {
                return Ok(i + level + 2);
            }
            i += 1;
        }
        Err(self.error_at(at, "unfinished long string or comment"))
    }

    fn copy_comment(&mut self) -> Result<(), TranspileError> {
        self.out.push_str("--");
        self.pos += 2;
        if self.long_bracket_level(self.pos).is_some() {
            let end = self.long_bracket_end(self.pos)?;
            self.copy_to(end);
        } else {
            while self.peek().is_some_and(|c| c != '\n') {
                self.bump_copy();
            }
        }
        Ok(())
    }

    fn copy_number(&mut self) {
        while let Some(c) = self.peek() {
            let exponent_sign = (c == '+' || c == '-')
                && matches!(self.out.chars().last(), Some('e' | 'E' | 'p' | 'P'));
            if c.is_ascii_alphanumeric() || c == '.' || c == '_' || exponent_sign {
                self.bump_copy();
            } else {
                break;
            }
        }
    }

    fn word(&mut self) -> Result<(), TranspileError> {
        let start = self.pos;
        let word = self.read_ident();
        if self.line_start && !self.nested && self.statement_follows() {
            match word.as_str() {
                "import" => return self.import_statement(start),
                "export" => return self.export_statement(start),
                _ => {}
            }
        }
        self.expr_start = EXPR_KEYWORDS.contains(&word.as_str());
        self.line_start = false;
        self.out.push_str(&word);
        Ok(())
    }

    // `import` / `export` used as plain identifiers stay untouched.
    fn statement_follows(&self) -> bool {
        let mut i = self.pos;
        let mut spaced = false;
        while matches!(self.src.get(i), Some(' ' | '\t')) {
            i += 1;
            spaced = true;
        }
        match self.src.get(i) {
            Some(&c) if is_ident_start(c) => spaced,
            Some('{' | '*' | '"' | '\'') => true,
            _ => false,
        }
    }

    // --- module statements ----------------------------------------------

    fn import_statement(&mut self, start: usize) -> Result<(), TranspileError> {
        self.skip_ws();

        let mut default = None;
        let mut namespace = None;
        let mut named = Vec::new();

        let module = match self.peek() {
            Some('"' | '\'') => self.string_literal()?,
            _ => {
                match self.peek() {
                    Some('*') => namespace = Some(self.namespace_clause()?),
                    Some('{') => named = self.named_list()?,
                    _ => {
                        default = Some(self.ident()?);
                        self.skip_ws();
                        if self.eat(',') {
                            self.skip_ws();
                            if self.peek() == Some('*') {
                                namespace = Some(self.namespace_clause()?);
                            } else {
                                named = self.named_list()?;
                            }
                        }
                    }
                }
                self.skip_ws();
                self.expect_word("from")?;
                self.skip_ws();
                self.string_literal()?
            }
        };
        self.skip_inline_ws();
        self.eat(';');

        let require = format!("require({})", lua_string(&module));
        let code = match (&default, &namespace, named.is_empty()) {
            (None, None, true) => require,
            (None, Some(ns), true) => format!("local {ns} = {require}"),
            (Some(d), None, true) => format!("local {d} = {INTEROP_DEFAULT}({require})"),
            _ => {
                let tmp = format!("__import_{}", self.imports);
                self.imports += 1;
                let mut code = format!("local {tmp} = {require}");
                if let Some(ns) = &namespace {
                    code.push_str(&format!(" local {ns} = {tmp}"));
                }
                if let Some(d) = &default {
                    code.push_str(&format!(" local {d} = {INTEROP_DEFAULT}({tmp})"));
                }
                if !named.is_empty() {
                    let locals: Vec<&str> = named.iter().map(|(_, l)| l.as_str()).collect();
                    let fields: Vec<String> =
                        named.iter().map(|(i, _)| format!("{tmp}.{i}")).collect();
                    code.push_str(&format!(
                        " local {} = {}",
                        locals.join(", "),
                        fields.join(", ")
                    ));
                }
                code
            }
        };

        self.out.push_str(&code);
        self.push_newlines(start);
        self.expr_start = true;
        self.line_start = false;
        Ok(())
    }

    fn namespace_clause(&mut self) -> Result<String, TranspileError> {
        self.expect_char('*')?;
        self.skip_ws();
        self.expect_word("as")?;
        self.skip_ws();
        self.ident()
    }

    /// `{ a, b as c }` as (original, alias) pairs.
    fn named_list(&mut self) -> Result<Vec<(String, String)>, TranspileError> {
        self.expect_char('{')?;
        let mut names = Vec::new();
        loop {
            self.skip_ws();
            if self.eat('}') {
                return Ok(names);
            }
            let name = self.ident()?;
            self.skip_ws();
            let alias = if self.peek().is_some_and(is_ident_start) {
                self.expect_word("as")?;
                self.skip_ws();
                self.ident()?
            } else {
                name.clone()
            };
            names.push((name, alias));
            self.skip_ws();
            if !self.eat(',') {
                self.skip_ws();
                self.expect_char('}')?;
                return Ok(names);
            }
        }
    }

    fn export_statement(&mut self, start: usize) -> Result<(), TranspileError> {
        self.skip_ws();

        if self.peek() == Some('{') {
            for (local, exported) in self.named_list()? {
                self.exports.push((exported, local));
            }
            self.skip_inline_ws();
            self.eat(';');
            self.push_newlines(start);
            self.expr_start = true;
            self.line_start = false;
            return Ok(());
        }

        let at = self.pos;
        let keyword = self.read_ident();
        match keyword.as_str() {
            "default" => {
                self.skip_ws();
                let save = self.pos;
                let named_function = if self.read_ident() == "function" {
                    self.skip_ws();
                    let name = self.read_ident();
                    (!name.is_empty() && !LUA_KEYWORDS.contains(&name.as_str())).then_some(name)
                } else {
                    None
                };
                match named_function {
                    Some(name) => {
                        self.out.push_str(&format!("local function {name}"));
                        self.exports.push(("default".to_string(), name));
                        self.expr_start = false;
                    }
                    None => {
                        self.pos = save;
                        self.out.push_str("exports.default = ");
                        self.expr_start = true;
                    }
                }
            }
            "const" | "let" | "local" => {
                self.skip_ws();
                let mut names = vec![self.ident()?];
                loop {
                    let save = self.pos;
                    self.skip_inline_ws();
                    if self.eat(',') {
                        self.skip_inline_ws();
                        names.push(self.ident()?);
                    } else {
                        self.pos = save;
                        break;
                    }
                }
                self.out.push_str(&format!("local {}", names.join(", ")));
                for name in names {
                    self.exports.push((name.clone(), name));
                }
                self.expr_start = false;
            }
            "function" => {
                self.skip_ws();
                let name = self.ident()?;
                self.out.push_str(&format!("local function {name}"));
                self.exports.push((name.clone(), name));
                self.expr_start = false;
            }
            other => {
                return Err(self.error_at(at, format!("unsupported export form 'export {other}'")));
            }
        }

        self.push_newlines(start);
        self.line_start = false;
        Ok(())
    }

    // --- markup ---------------------------------------------------------

    fn markup_follows(&self) -> bool {
        self.peek_at(1)
            .is_some_and(|c| c == '>' || c == '_' || c.is_ascii_alphabetic())
    }

    fn element(&mut self) -> Result<String, TranspileError> {
        let open = self.pos;
        self.expect_char('<')?;

        if self.eat('>') {
            let children = self.children(None, open)?;
            return Ok(element_call("nil", &[], &children));
        }

        let name = self.tag_name();
        let tag = tag_expression(&name);
        let mut props = Vec::new();

        loop {
            self.skip_ws();
            match self.peek() {
                Some('/') => {
                    self.pos += 1;
                    self.expect_char('>')?;
                    return Ok(element_call(&tag, &props, &[]));
                }
                Some('>') => {
                    self.pos += 1;
                    break;
                }
                Some('{') => return Err(self.error("spread attributes are not supported")),
                Some(c) if is_ident_start(c) => {
                    let attr = self.attr_name();
                    self.skip_ws();
                    let value = if self.eat('=') {
                        self.skip_ws();
                        self.attr_value(&attr)?
                    } else {
                        "true".to_string()
                    };
                    props.push((attr, value));
                }
                Some(c) => return Err(self.error(format!("unexpected '{c}' in <{name}>"))),
                None => return Err(self.error_at(open, format!("unterminated <{name}>"))),
            }
        }

        let children = self.children(Some(&name), open)?;
        Ok(element_call(&tag, &props, &children))
    }

    fn children(&mut self, closing: Option<&str>, open: usize) -> Result<Vec<String>, TranspileError> {
        let expected = closing.unwrap_or("");
        let mut children = Vec::new();
        let mut text = String::new();

        loop {
            match self.peek() {
                None => {
                    return Err(self.error_at(open, format!("missing closing tag </{expected}>")));
                }
                Some('<') if self.peek_at(1) == Some('/') => {
                    flush_text(&mut text, &mut children);
                    self.pos += 2;
                    self.skip_ws();
                    let name = self.tag_name();
                    self.skip_ws();
                    self.expect_char('>')?;
                    if name != expected {
                        return Err(
                            self.error(format!("expected </{expected}> but found </{name}>"))
                        );
                    }
                    return Ok(children);
                }
                Some('<') => {
                    flush_text(&mut text, &mut children);
                    children.push(self.element()?);
                }
                Some('{') => {
                    flush_text(&mut text, &mut children);
                    if let Some(expr) = self.embedded_expression()? {
                        children.push(expr);
                    }
                }
                Some(c) => {
                    text.push(c);
                    self.pos += 1;
                }
            }
        }
    }

    fn tag_name(&mut self) -> String {
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|c| is_ident_continue(c) || matches!(c, '.' | '-' | ':'))
        {
            self.pos += 1;
        }
        self.src[start..self.pos].iter().collect()
    }

    fn attr_name(&mut self) -> String {
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|c| is_ident_continue(c) || matches!(c, '-' | ':'))
        {
            self.pos += 1;
        }
        self.src[start..self.pos].iter().collect()
    }

    fn attr_value(&mut self, attr: &str) -> Result<String, TranspileError> {
        match self.peek() {
            Some(q @ ('"' | '\'')) => {
                let start = self.pos + 1;
                let mut end = start;
                while self.src.get(end).is_some_and(|&c| c != q) {
                    end += 1;
                }
                if end >= self.src.len() {
                    return Err(self.error(format!("unterminated value for '{attr}'")));
                }
                let value: String = self.src[start..end].iter().collect();
                self.pos = end + 1;
                Ok(lua_string(&value))
            }
            Some('{') => self
                .embedded_expression()?
                .ok_or_else(|| self.error(format!("empty expression for '{attr}'"))),
            Some('<') => self.element(),
            _ => Err(self.error(format!("expected value for '{attr}'"))),
        }
    }

    /// `{ expr }` inside markup. Comments-only braces yield `None`.
    fn embedded_expression(&mut self) -> Result<Option<String>, TranspileError> {
        let open = self.pos;
        self.expect_char('{')?;
        let start = self.pos;
        let mut depth = 0usize;

        loop {
            match self.peek() {
                None => return Err(self.error_at(open, "unterminated '{' in markup")),
                Some('{') => depth += 1,
                Some('}') if depth == 0 => break,
                Some('}') => depth -= 1,
                Some('"' | '\'') => {
                    self.pos = self.quoted_end(self.pos)?;
                    continue;
                }
                Some(_) => {}
            }
            self.pos += 1;
        }

        let inner: String = self.src[start..self.pos].iter().collect();
        self.pos += 1;

        let trimmed = inner.trim();
        if trimmed.is_empty() || (trimmed.starts_with("/*") && trimmed.ends_with("*/")) {
            return Ok(None);
        }

        let mut nested = Transpiler::new(&inner, true, self.line_at(start));
        nested.run()?;
        Ok(Some(format!("({})", nested.out.trim())))
    }
}

fn is_ident_start(c: char) -> bool {
    c == '_' || c.is_alphabetic()
}

fn is_ident_continue(c: char) -> bool {
    c == '_' || c.is_alphanumeric()
}

fn is_lua_name(name: &str) -> bool {
    let mut chars = name.chars();
    chars.next().is_some_and(|c| c == '_' || c.is_ascii_alphabetic())
        && chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
        && !LUA_KEYWORDS.contains(&name)
}

/// Intrinsic tags become strings, components stay references.
fn tag_expression(name: &str) -> String {
    let component = name.contains('.') || name.chars().next().is_some_and(char::is_uppercase);
    if component {
        name.to_string()
    } else {
        lua_string(name)
    }
}

fn element_call(tag: &str, props: &[(String, String)], children: &[String]) -> String {
    let props = if props.is_empty() {
        "nil".to_string()
    } else {
        let fields: Vec<String> = props
            .iter()
            .map(|(key, value)| {
                if is_lua_name(key) {
                    format!("{key}={value}")
                } else {
                    format!("[{}]={value}", lua_string(key))
                }
            })
            .collect();
        format!("{{{}}}", fields.join(", "))
    };

    let mut call = format!("{ELEMENT_FACTORY}({tag}, {props}");
    for child in children {
        call.push_str(", ");
        call.push_str(child);
    }
    call.push(')');
    call
}

fn flush_text(text: &mut String, children: &mut Vec<String>) {
    if let Some(cleaned) = markup_text(text) {
        children.push(lua_string(&cleaned));
    }
    text.clear();
}

/// Markup whitespace rules: lines are trimmed where they meet a line break,
/// blank lines vanish, and the remaining lines join with a single space.
fn markup_text(raw: &str) -> Option<String> {
    let lines: Vec<&str> = raw.split('\n').collect();
    let last = lines.len() - 1;
    let mut out = String::new();

    for (i, line) in lines.iter().enumerate() {
        let mut line = line.trim_end_matches('\r');
        if i != 0 {
            line = line.trim_start();
        }
        if i != last {
            line = line.trim_end();
        }
        if line.is_empty() {
            continue;
        }
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(line);
    }

    (!out.is_empty()).then_some(out)
}

/// Quote `value` as a Lua string literal.
pub fn lua_string(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => out.push_str(&format!("\\{}", c as u32)),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}
