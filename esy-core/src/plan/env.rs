//! Environment composition and closure.
//!
//! An [`Environment`] is an ordered list of name/value bindings. Values may
//! reference earlier bindings as `$name` or `${name}`; [`Environment::close`]
//! expands every reference, producing a closed environment that can be handed
//! to a process or rendered for a shell.

use crate::error::{EsyError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Variables with cons semantics: a later addition is prepended to the
/// existing value rather than replacing it.
const CONS_VARS: [&str; 3] = ["PATH", "MANPATH", "OCAMLPATH"];

/// A single environment binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvBinding {
    pub name: String,
    pub value: String,
}

/// An ordered environment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Environment {
    bindings: Vec<EnvBinding>,
}

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a binding.
    ///
    /// Rebinding an existing name replaces its value in place; for the cons
    /// variables (`PATH`, `MANPATH`, `OCAMLPATH`) the new value is prepended
    /// to the existing one with `:`.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();

        if let Some(existing) = self.bindings.iter_mut().find(|b| b.name == name) {
            if CONS_VARS.contains(&name.as_str()) && !existing.value.is_empty() {
                existing.value = format!("{}:{}", value, existing.value);
            } else {
                existing.value = value;
            }
        } else {
            self.bindings.push(EnvBinding { name, value });
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.bindings.iter().find(|b| b.name == name).map(|b| b.value.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &EnvBinding> {
        self.bindings.iter()
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Expand every `$name` / `${name}` reference against earlier bindings,
    /// in insertion order. The result is order-preserving and closing an
    /// already-closed environment is a no-op.
    pub fn close(&self) -> Result<Environment> {
        let mut closed = Environment::new();
        let mut resolved: HashMap<&str, String> = HashMap::new();

        for binding in &self.bindings {
            let value = expand(&binding.value, |name| resolved.get(name).map(String::as_str))
                .map_err(|name| EsyError::UnknownEnvRef { name, binding: binding.name.clone() })?;
            resolved.insert(binding.name.as_str(), value.clone());
            closed.bindings.push(EnvBinding { name: binding.name.clone(), value });
        }

        Ok(closed)
    }

    /// Render as a sourceable shell script with a header comment.
    pub fn render_shell_source(&self, header: &str) -> String {
        let mut out = String::new();
        for line in header.lines() {
            out.push_str("# ");
            out.push_str(line);
            out.push('\n');
        }
        for binding in &self.bindings {
            out.push_str("export ");
            out.push_str(&binding.name);
            out.push_str("=\"");
            out.push_str(&shell_escape(&binding.value));
            out.push_str("\"\n");
        }
        out
    }

    /// Render as a pretty-printed JSON object of `{name: value}`.
    pub fn render_json(&self) -> String {
        let map: serde_json::Map<String, serde_json::Value> = self
            .bindings
            .iter()
            .map(|b| (b.name.clone(), serde_json::Value::String(b.value.clone())))
            .collect();
        serde_json::to_string_pretty(&serde_json::Value::Object(map))
            .expect("environment serialization cannot fail")
    }
}

/// Expand `$name` / `${name}` references in a value. Returns the unresolved
/// name on failure. A `$` not followed by a reference is literal.
fn expand<'a, F>(value: &str, lookup: F) -> std::result::Result<String, String>
where
    F: Fn(&str) -> Option<&'a str>,
{
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }

        match chars.peek() {
            Some('{') => {
                chars.next();
                let mut name = String::new();
                for c in chars.by_ref() {
                    if c == '}' {
                        break;
                    }
                    name.push(c);
                }
                match lookup(&name) {
                    Some(v) => out.push_str(v),
                    None => return Err(name),
                }
            }
            Some(c) if c.is_ascii_alphabetic() || *c == '_' => {
                let mut name = String::new();
                while let Some(c) = chars.peek() {
                    if c.is_ascii_alphanumeric() || *c == '_' {
                        name.push(*c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                match lookup(&name) {
                    Some(v) => out.push_str(v),
                    None => return Err(name),
                }
            }
            _ => out.push('$'),
        }
    }

    Ok(out)
}

fn shell_escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '"' | '\\' | '$' | '`') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
