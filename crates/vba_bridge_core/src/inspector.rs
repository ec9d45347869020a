//! Stack frame and variable listing for the current break location.
//!
//! The target reports only where execution is, never a call chain, so there is
//! always exactly one frame. Variables come from reading the source around
//! that location; values are filled in by evaluating each name, when possible.

use crate::adapter::Location;
use crate::error::DebugError;
use crate::recovery::RecoveringBridge;
use crate::source::{self, classify_lines, LineKind, ModuleText, ProcedureSpan};
use serde::Serialize;
use std::collections::HashSet;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StackFrame {
    pub id: u32,
    pub module: String,
    pub procedure: Option<String>,
    pub line: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VariableScope {
    Local,
    Global,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VariableEntry {
    pub name: String,
    pub declared_type: Option<String>,
    pub scope: VariableScope,
    /// `None` when the target could not produce a value.
    pub value: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameVariables {
    pub locals: Vec<VariableEntry>,
    pub globals: Vec<VariableEntry>,
}

impl FrameVariables {
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut VariableEntry> {
        self.locals.iter_mut().chain(self.globals.iter_mut())
    }
}

/// Enclosing procedure of `line`, if any.
pub fn enclosing_procedure(text: &str, line: u32) -> Option<ProcedureSpan> {
    source::procedures(&ModuleText::parse(text))
        .into_iter()
        .find(|span| span.contains(line))
}

/// The single frame for `location`, naming the procedure from source when the
/// target did not.
pub fn frame_for(location: &Location, text: Option<&str>) -> StackFrame {
    let procedure = location.procedure.clone().or_else(|| {
        text.and_then(|text| enclosing_procedure(text, location.line))
            .map(|span| span.name)
    });
    StackFrame {
        id: 0,
        module: location.module.clone(),
        procedure,
        line: location.line,
    }
}

/// Variables visible at `line`, without values.
pub fn declared_variables(text: &str, line: u32) -> FrameVariables {
    let module = ModuleText::parse(text);
    let kinds = classify_lines(&module);
    let spans = source::procedures(&module);
    let first_procedure = spans.first().map_or(module.len() as u32 + 1, |s| s.start);

    let mut variables = FrameVariables::default();

    let mut seen = HashSet::new();
    for (index, (kind, _)) in kinds.iter().enumerate() {
        let number = index as u32 + 1;
        if number >= first_procedure {
            break;
        }
        if *kind == LineKind::Declaration {
            let body = module.line(number).unwrap_or_default();
            push_unique(&mut variables.globals, &mut seen, source::declarations(body), VariableScope::Global);
        }
    }

    let Some(span) = spans.iter().find(|span| span.contains(line)) else {
        return variables;
    };

    let mut seen = HashSet::new();
    let header = joined_header(&module, span.start);
    push_unique(&mut variables.locals, &mut seen, source::parameters(&header), VariableScope::Local);
    for number in span.start + 1..=span.end {
        let is_declaration = kinds
            .get(number as usize - 1)
            .is_some_and(|(kind, inside)| *inside && *kind == LineKind::Declaration);
        if is_declaration {
            let body = module.line(number).unwrap_or_default();
            push_unique(&mut variables.locals, &mut seen, source::declarations(body), VariableScope::Local);
        }
    }
    variables
}

/// A procedure header with its `_` continuation lines joined.
fn joined_header(module: &ModuleText, start: u32) -> String {
    let mut header = String::new();
    let mut number = start;
    while let Some(body) = module.line(number) {
        let code = source::strip_comment(body).trim_end();
        match code.strip_suffix(" _") {
            Some(head) => {
                header.push_str(head);
                header.push(' ');
                number += 1;
            }
            None => {
                header.push_str(code);
                break;
            }
        }
    }
    header
}

fn push_unique(
    into: &mut Vec<VariableEntry>,
    seen: &mut HashSet<String>,
    declared: Vec<source::Declared>,
    scope: VariableScope,
) {
    for item in declared {
        if seen.insert(item.name.to_ascii_lowercase()) {
            into.push(VariableEntry {
                name: item.name,
                declared_type: item.type_name,
                scope,
                value: None,
            });
        }
    }
}

pub async fn frame(bridge: &RecoveringBridge, location: &Location) -> StackFrame {
    if location.procedure.is_some() {
        return frame_for(location, None);
    }
    let text = bridge.read_module(&location.module).await.ok();
    frame_for(location, text.as_deref())
}

/// Variables for the frame at `location`. Values are only requested while the
/// target is paused; a name that cannot be evaluated keeps `value: None`.
pub async fn variables(
    bridge: &RecoveringBridge,
    location: &Location,
    paused: bool,
) -> Result<FrameVariables, DebugError> {
    let text = bridge.read_module(&location.module).await?;
    let mut variables = declared_variables(&text, location.line);
    if !paused {
        return Ok(variables);
    }

    for entry in variables.iter_mut() {
        match bridge.evaluate(&entry.name).await {
            Ok(value) => entry.value = Some(value),
            Err(err) if err.is_fatal() || err.is_disconnect() => {
                tracing::warn!("Stopped evaluating variables: {err}");
                break;
            }
            Err(err) => {
                tracing::debug!(variable = %entry.name, "No value: {err}");
            }
        }
    }
    Ok(variables)
}
