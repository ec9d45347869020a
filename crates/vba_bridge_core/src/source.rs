//! Line-oriented lexical view of VBA module text.
//!
//! Nothing here is a parser: classification works one physical line at a
//! time, with just enough context (procedure nesting, `_` continuations) to
//! tell statements from structure.

use std::path::Path;

const MODULE_EXTENSIONS: [&str; 3] = ["bas", "cls", "frm"];

/// Module text split into lines that keep their own terminators, so rendering
/// after edits is byte-identical everywhere except the edited lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleText {
    lines: Vec<(String, String)>,
}

impl ModuleText {
    pub fn parse(text: &str) -> Self {
        let lines = text
            .split_inclusive('\n')
            .map(|raw| {
                let body_len = raw
                    .strip_suffix("\r\n")
                    .or_else(|| raw.strip_suffix('\n'))
                    .unwrap_or(raw)
                    .len();
                (raw[..body_len].to_string(), raw[body_len..].to_string())
            })
            .collect();
        Self { lines }
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Body of 1-based `line`, without its terminator.
    pub fn line(&self, line: u32) -> Option<&str> {
        let index = usize::try_from(line).ok()?.checked_sub(1)?;
        self.lines.get(index).map(|(body, _)| body.as_str())
    }

    /// Replaces the body of `line`, keeping its terminator. Returns the old body.
    pub fn replace(&mut self, line: u32, body: &str) -> Option<String> {
        let index = usize::try_from(line).ok()?.checked_sub(1)?;
        let slot = self.lines.get_mut(index)?;
        Some(std::mem::replace(&mut slot.0, body.to_string()))
    }

    pub fn bodies(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().map(|(body, _)| body.as_str())
    }

    pub fn render(&self) -> String {
        let capacity = self.lines.iter().map(|(b, e)| b.len() + e.len()).sum();
        self.lines
            .iter()
            .fold(String::with_capacity(capacity), |mut out, (body, ending)| {
                out.push_str(body);
                out.push_str(ending);
                out
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineKind {
    Blank,
    Comment,
    Directive,
    Declaration,
    ProcedureStart(String),
    ProcedureEnd,
    /// Structure a `Stop:` prefix may not precede: block `If`, `ElseIf`, `Else`, `Case`, `Loop`, `Next`, `End If`.
    BlockStructure,
    Label,
    Continuation,
    Stop,
    Statement,
}

/// Classifies every line of `module`, and records whether it sits inside a procedure body.
pub fn classify_lines(module: &ModuleText) -> Vec<(LineKind, bool)> {
    let mut kinds = Vec::with_capacity(module.len());
    let mut in_procedure = false;
    let mut continues = false;

    for body in module.bodies() {
        let kind = if continues {
            LineKind::Continuation
        } else {
            classify(body)
        };
        continues = ends_with_continuation(body);

        let inside = match &kind {
            LineKind::ProcedureStart(_) => {
                in_procedure = true;
                false
            }
            LineKind::ProcedureEnd => {
                in_procedure = false;
                false
            }
            _ => in_procedure,
        };
        kinds.push((kind, inside));
    }
    kinds
}

/// Classifies one line in isolation.
pub fn classify(body: &str) -> LineKind {
    let code = strip_comment(body).trim();
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return LineKind::Blank;
    }
    if code.is_empty() || starts_with_word(code, "REM") {
        return LineKind::Comment;
    }
    if code.starts_with('#') || starts_with_word(code, "OPTION") || starts_with_word(code, "ATTRIBUTE") {
        return LineKind::Directive;
    }
    if let Some(name) = procedure_name(code) {
        return LineKind::ProcedureStart(name);
    }

    let upper = code.to_ascii_uppercase();
    let words: Vec<&str> = upper.split_whitespace().collect();
    match words.as_slice() {
        ["END", "SUB" | "FUNCTION" | "PROPERTY", ..] => return LineKind::ProcedureEnd,
        ["END", "IF" | "SELECT" | "WITH", ..] => return LineKind::BlockStructure,
        ["END", "TYPE" | "ENUM", ..] => return LineKind::Declaration,
        ["ELSE", ..] | ["ELSEIF", ..] | ["CASE", ..] | ["SELECT", "CASE", ..] => {
            return LineKind::BlockStructure
        }
        ["LOOP", ..] | ["NEXT", ..] | ["WEND"] => return LineKind::BlockStructure,
        ["IF", .., "THEN"] => return LineKind::BlockStructure,
        _ => {}
    }
    if is_stop(&upper) {
        return LineKind::Stop;
    }
    if is_declaration(&words) {
        return LineKind::Declaration;
    }
    if is_label(code) {
        return LineKind::Label;
    }
    LineKind::Statement
}

/// `Stop` alone, or as the first of several `:`-separated statements.
fn is_stop(upper: &str) -> bool {
    upper
        .strip_prefix("STOP")
        .is_some_and(|rest| rest.is_empty() || rest.trim_start().starts_with(':'))
}

fn is_declaration(words: &[&str]) -> bool {
    let Some(first) = words.first() else {
        return false;
    };
    match *first {
        "DIM" | "CONST" | "DECLARE" | "TYPE" | "ENUM" | "IMPLEMENTS" | "EVENT" => true,
        "STATIC" => true,
        "PRIVATE" | "PUBLIC" | "GLOBAL" | "FRIEND" => true,
        word => word.starts_with("DEF") && word.len() == 6,
    }
}

fn is_label(code: &str) -> bool {
    let Some(name) = code.strip_suffix(':') else {
        return false;
    };
    !name.is_empty()
        && (name.chars().all(|c| c.is_ascii_digit())
            || (name.chars().next().is_some_and(|c| c.is_ascii_alphabetic())
                && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')))
}

fn starts_with_word(code: &str, word: &str) -> bool {
    code.get(..word.len())
        .is_some_and(|head| head.eq_ignore_ascii_case(word))
        && code[word.len()..]
            .chars()
            .next()
            .map_or(true, |c| !c.is_ascii_alphanumeric() && c != '_')
}

fn ends_with_continuation(body: &str) -> bool {
    let code = strip_comment(body).trim_end();
    code == "_" || code.ends_with(" _") || code.ends_with("\t_")
}

/// Module name of an exported `.bas`/`.cls`/`.frm` file, which is its file stem.
pub fn exported_module_name(path: &Path) -> Option<&str> {
    let ext = path.extension()?.to_str()?;
    if !MODULE_EXTENSIONS.iter().any(|m| ext.eq_ignore_ascii_case(m)) {
        return None;
    }
    path.file_stem()?.to_str()
}

/// Splits an exported `.bas`/`.cls`/`.frm` file into the metadata the editor
/// writes above the code and the code itself. Designer blocks
/// (`Begin` ... `End`, `BeginProperty` ... `EndProperty`) may nest.
pub fn split_export_header(text: &str) -> (&str, &str) {
    let mut offset = 0;
    let mut depth = 0_usize;
    for line in text.split_inclusive('\n') {
        let upper = line.trim().to_ascii_uppercase();
        let first = upper.split_whitespace().next().unwrap_or_default();
        if first.starts_with("BEGIN") {
            depth += 1;
        } else if depth > 0 {
            if first == "END" || first == "ENDPROPERTY" {
                depth -= 1;
            }
        } else {
            let is_metadata = first == "VERSION"
                || first == "ATTRIBUTE"
                || (first == "OBJECT" && upper.contains('='));
            if !is_metadata {
                break;
            }
        }
        offset += line.len();
    }
    text.split_at(offset)
}

/// Removes a trailing `'` comment, ignoring apostrophes inside string literals.
pub fn strip_comment(body: &str) -> &str {
    let mut in_string = false;
    for (index, c) in body.char_indices() {
        match c {
            '"' => in_string = !in_string,
            '\'' if !in_string => return &body[..index],
            _ => {}
        }
    }
    body
}

/// Name of the procedure declared on this line, if it is a `Sub`/`Function`/`Property` header.
pub fn procedure_name(code: &str) -> Option<String> {
    let mut rest = code.trim();
    for modifier in ["PUBLIC", "PRIVATE", "FRIEND"] {
        if starts_with_word(rest, modifier) {
            rest = rest[modifier.len()..].trim_start();
            break;
        }
    }
    if starts_with_word(rest, "STATIC") {
        rest = rest["STATIC".len()..].trim_start();
    }

    if starts_with_word(rest, "SUB") {
        rest = rest[3..].trim_start();
    } else if starts_with_word(rest, "FUNCTION") {
        rest = rest[8..].trim_start();
    } else if starts_with_word(rest, "PROPERTY") {
        rest = rest[8..].trim_start();
        let accessor = ["GET", "LET", "SET"]
            .into_iter()
            .find(|a| starts_with_word(rest, a))?;
        rest = rest[accessor.len()..].trim_start();
    } else {
        return None;
    }

    let name: String = rest
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect();
    (!name.is_empty()).then_some(name)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcedureSpan {
    pub name: String,
    /// 1-based line of the header.
    pub start: u32,
    /// 1-based line of the `End` statement, or the last line if it is missing.
    pub end: u32,
}

impl ProcedureSpan {
    pub fn contains(&self, line: u32) -> bool {
        (self.start..=self.end).contains(&line)
    }
}

pub fn procedures(module: &ModuleText) -> Vec<ProcedureSpan> {
    let mut spans = Vec::new();
    let mut open: Option<(String, u32)> = None;

    for (index, (kind, _)) in classify_lines(module).into_iter().enumerate() {
        let line = index as u32 + 1;
        match kind {
            LineKind::ProcedureStart(name) => {
                if let Some((previous, start)) = open.take() {
                    spans.push(ProcedureSpan {
                        name: previous,
                        start,
                        end: line - 1,
                    });
                }
                open = Some((name, line));
            }
            LineKind::ProcedureEnd => {
                if let Some((name, start)) = open.take() {
                    spans.push(ProcedureSpan {
                        name,
                        start,
                        end: line,
                    });
                }
            }
            _ => {}
        }
    }
    if let Some((name, start)) = open {
        spans.push(ProcedureSpan {
            name,
            start,
            end: module.len() as u32,
        });
    }
    spans
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Declared {
    pub name: String,
    pub type_name: Option<String>,
}

/// Variables declared by a `Dim`/`Static`/`Private`/`Public`/`Global`/`Const` line.
pub fn declarations(body: &str) -> Vec<Declared> {
    let code = strip_comment(body).trim();
    let mut rest = code;
    let mut is_const = false;
    let mut matched = false;

    for keyword in ["PRIVATE", "PUBLIC", "GLOBAL", "DIM", "STATIC", "CONST", "WITHEVENTS"] {
        if starts_with_word(rest, keyword) {
            matched = true;
            is_const |= keyword == "CONST";
            rest = rest[keyword.len()..].trim_start();
        }
    }
    if !matched || procedure_name(code).is_some() {
        return Vec::new();
    }
    if ["DECLARE", "TYPE", "ENUM", "EVENT", "SUB", "FUNCTION", "PROPERTY"]
        .iter()
        .any(|k| starts_with_word(rest, k))
    {
        return Vec::new();
    }

    split_top_level(rest)
        .into_iter()
        .filter_map(|item| parse_item(item, if is_const { None } else { Some("Variant") }))
        .collect()
}

/// Parameters from a procedure header such as `Sub Foo(ByVal a As Long, Optional b$)`.
pub fn parameters(header: &str) -> Vec<Declared> {
    let code = strip_comment(header);
    let (Some(open), Some(close)) = (code.find('('), code.rfind(')')) else {
        return Vec::new();
    };
    if close <= open {
        return Vec::new();
    }
    split_top_level(&code[open + 1..close])
        .into_iter()
        .filter_map(|item| {
            let mut item = item.trim();
            for modifier in ["OPTIONAL", "BYVAL", "BYREF", "PARAMARRAY"] {
                if starts_with_word(item, modifier) {
                    item = item[modifier.len()..].trim_start();
                }
            }
            parse_item(item, Some("Variant"))
        })
        .collect()
}

fn parse_item(item: &str, default_type: Option<&str>) -> Option<Declared> {
    let item = item.trim();
    let item = if starts_with_word(item, "WITHEVENTS") {
        item[10..].trim_start()
    } else {
        item
    };
    let name_len = item
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .unwrap_or(item.len());
    if name_len == 0 || !item.starts_with(|c: char| c.is_ascii_alphabetic()) {
        return None;
    }
    let name = item[..name_len].to_string();
    let mut rest = &item[name_len..];

    let suffix_type = rest.chars().next().and_then(suffix_type);
    if suffix_type.is_some() {
        rest = &rest[1..];
    }

    let upper = rest.to_ascii_uppercase();
    let declared_type = upper.find(" AS ").map(|at| {
        let after = rest[at + 4..].trim_start();
        let after = if starts_with_word(after, "NEW") {
            after[3..].trim_start()
        } else {
            after
        };
        after
            .split(|c: char| c.is_whitespace() || c == '=' || c == '*')
            .next()
            .unwrap_or_default()
            .to_string()
    });

    let type_name = declared_type
        .filter(|t| !t.is_empty())
        .or_else(|| suffix_type.map(str::to_string))
        .or_else(|| default_type.map(str::to_string));
    Some(Declared { name, type_name })
}

fn suffix_type(c: char) -> Option<&'static str> {
    match c {
        '%' => Some("Integer"),
        '&' => Some("Long"),
        '$' => Some("String"),
        '!' => Some("Single"),
        '#' => Some("Double"),
        '@' => Some("Currency"),
        _ => None,
    }
}

/// Splits on commas that are not nested in parentheses or string literals.
fn split_top_level(list: &str) -> Vec<&str> {
    let mut items = Vec::new();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut start = 0;
    for (index, c) in list.char_indices() {
        match c {
            '"' => in_string = !in_string,
            '(' if !in_string => depth += 1,
            ')' if !in_string => depth = depth.saturating_sub(1),
            ',' if !in_string && depth == 0 => {
                items.push(&list[start..index]);
                start = index + 1;
            }
            _ => {}
        }
    }
    if !list[start..].trim().is_empty() {
        items.push(&list[start..]);
    }
    items
}
