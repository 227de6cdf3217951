//! Reference Resolution
//!
//! Rewrites `<prefix.path>` and `{{NAME}}` tokens inside a block's config
//! into values from the execution context.
//!
//! A `<...>` token counts as a reference only when its body has no
//! surrounding whitespace, does not start or end with an operator
//! character, and its prefix is accessible from the requesting block (or
//! is a system prefix). Anything else stays literal, so condition
//! expressions like `<a.n> < <b.n>` survive intact.

use std::sync::Arc;

use log::{debug, warn};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde_json::{json, Map, Value};

use super::access::AccessibleSet;
use super::normalize::{normalize_name, LOOP_PREFIX, PARALLEL_PREFIX, START_PREFIX, VARIABLE_PREFIX};
use crate::error::ReferenceError;
use crate::execution::context::{ExecutionContext, StateKey};
use crate::workflow::{Block, GroupKind, Workflow};

static TOKEN_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<([^<>]+)>|\{\{([^{}]+)\}\}").expect("valid regex"));

/// Characters that mark a `<...>` body as an expression, not a reference.
const OPERATOR_CHARS: &[char] = &['=', '!', '<', '>', '+', '-', '*', '/', '%', '&', '|'];

/// Outcome of looking up a single reference body.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    /// Not a reference for this block; leave the token as text
    Literal,
    /// Resolved value
    Found(Value),
    /// A reference, but nothing to read yet
    Missing(String),
}

/// Whether a `<...>` body is shaped like a reference.
pub fn is_reference_candidate(body: &str) -> bool {
    if body.is_empty() || body.trim() != body {
        return false;
    }
    let first = body.chars().next();
    let last = body.chars().last();
    !matches!(first, Some(c) if OPERATOR_CHARS.contains(&c))
        && !matches!(last, Some(c) if OPERATOR_CHARS.contains(&c))
}

/// Follows a dotted path into a JSON value. Numeric segments index arrays.
pub fn get_path<'v>(value: &'v Value, segments: &[&str]) -> Option<&'v Value> {
    segments.iter().try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get(*segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Inline rendering of a value inside a larger string.
fn stringify(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Resolves references on behalf of one node instance.
pub struct ReferenceResolver<'a> {
    workflow: &'a Workflow,
    ctx: &'a ExecutionContext,
    node: &'a str,
    path: &'a [usize],
    access: Arc<AccessibleSet>,
}

impl<'a> ReferenceResolver<'a> {
    /// Creates a resolver for `node` running at iteration `path`.
    pub fn new(
        workflow: &'a Workflow,
        ctx: &'a ExecutionContext,
        node: &'a str,
        path: &'a [usize],
    ) -> Self {
        Self {
            workflow,
            ctx,
            node,
            path,
            access: workflow.accessible(node),
        }
    }

    /// Resolves a block's config into its handler inputs, enforcing the
    /// block's required references first.
    pub fn resolve_block_inputs(&self, block: &Block) -> Result<Value, ReferenceError> {
        for body in &block.required_references {
            let token = format!("<{}>", body);
            match self.lookup(body) {
                Lookup::Found(Value::Null) => {
                    return Err(self.error(&token, "required reference resolved to null"))
                }
                Lookup::Found(_) => {}
                Lookup::Literal => {
                    return Err(self.error(&token, "reference is not accessible from this block"))
                }
                Lookup::Missing(reason) => return Err(self.error(&token, &reason)),
            }
        }

        self.resolve_value(&block.config)
    }

    /// Resolves every string inside a JSON value.
    pub fn resolve_value(&self, value: &Value) -> Result<Value, ReferenceError> {
        match value {
            Value::String(text) => self.resolve_str(text),
            Value::Array(items) => items
                .iter()
                .map(|item| self.resolve_value(item))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Value::Object(map) => {
                let mut resolved = Map::with_capacity(map.len());
                for (key, item) in map {
                    resolved.insert(key.clone(), self.resolve_value(item)?);
                }
                Ok(Value::Object(resolved))
            }
            other => Ok(other.clone()),
        }
    }

    /// Resolves one string. A string that is exactly one reference becomes
    /// the referenced value itself; otherwise tokens are substituted inline.
    pub fn resolve_str(&self, text: &str) -> Result<Value, ReferenceError> {
        if !TOKEN_PATTERN.is_match(text) {
            return Ok(Value::String(text.to_string()));
        }

        if let Some(caps) = TOKEN_PATTERN.captures(text) {
            let whole = caps.get(0).map(|m| m.as_str().len() == text.len()).unwrap_or(false);
            if whole {
                if let Some(value) = self.resolve_token(&caps)? {
                    return Ok(value);
                }
                return Ok(Value::String(text.to_string()));
            }
        }

        self.substitute(text, stringify).map(Value::String)
    }

    /// Resolves a condition expression. Referenced values are rendered as
    /// JSON literals, so a string stays one quoted operand even when it
    /// contains operator characters.
    pub fn resolve_expression(&self, text: &str) -> Result<String, ReferenceError> {
        self.substitute(text, |value| value.to_string())
    }

    fn substitute(
        &self,
        text: &str,
        render: impl Fn(&Value) -> String,
    ) -> Result<String, ReferenceError> {
        let mut output = String::with_capacity(text.len());
        let mut last = 0;
        for caps in TOKEN_PATTERN.captures_iter(text) {
            let Some(m) = caps.get(0) else { continue };
            output.push_str(&text[last..m.start()]);
            match self.resolve_token(&caps)? {
                Some(value) => output.push_str(&render(&value)),
                None => output.push_str(m.as_str()),
            }
            last = m.end();
        }
        output.push_str(&text[last..]);
        Ok(output)
    }

    /// `Some(value)` for a recognized token (null when unresolved), `None`
    /// for text that must stay literal.
    fn resolve_token(&self, caps: &Captures<'_>) -> Result<Option<Value>, ReferenceError> {
        if let Some(name) = caps.get(2) {
            return self.resolve_env(name.as_str()).map(Some);
        }

        let Some(body) = caps.get(1).map(|m| m.as_str()) else {
            return Ok(None);
        };
        if !is_reference_candidate(body) {
            return Ok(None);
        }

        match self.lookup(body) {
            Lookup::Literal => Ok(None),
            Lookup::Found(value) => Ok(Some(value)),
            Lookup::Missing(reason) => {
                warn!(
                    "Block '{}' left reference <{}> empty: {}",
                    self.node, body, reason
                );
                Ok(Some(Value::Null))
            }
        }
    }

    fn resolve_env(&self, raw: &str) -> Result<Value, ReferenceError> {
        let name = raw.trim();
        self.ctx
            .environment_variables
            .get(name)
            .map(|v| Value::String(v.clone()))
            .ok_or_else(|| {
                self.error(
                    &format!("{{{{{}}}}}", raw),
                    &format!("environment variable '{}' is not set", name),
                )
            })
    }

    /// Looks up a reference body such as `agent.content` or `loop.index`.
    pub fn lookup(&self, body: &str) -> Lookup {
        let segments: Vec<&str> = body.split('.').collect();
        let prefix = normalize_name(segments[0]);
        let rest = &segments[1..];

        match prefix.as_str() {
            START_PREFIX => self.lookup_node(self.workflow.entry(), rest),
            LOOP_PREFIX => self.lookup_group_scope(GroupKind::Loop, rest),
            PARALLEL_PREFIX => self.lookup_group_scope(GroupKind::Parallel, rest),
            VARIABLE_PREFIX => self.lookup_variable(rest),
            _ => match self.access.resolve(&prefix) {
                Some(node) => self.lookup_node(node, rest),
                None => {
                    if self.workflow.resolve_prefix(&prefix).is_some() {
                        debug!(
                            "Block '{}' cannot see '{}'; leaving <{}> as text",
                            self.node, prefix, body
                        );
                    }
                    Lookup::Literal
                }
            },
        }
    }

    fn lookup_node(&self, node: &str, rest: &[&str]) -> Lookup {
        let Some(state) = self.ctx.state_from(node, self.path) else {
            return Lookup::Missing(format!("'{}' has not produced an output", node));
        };
        if !state.executed {
            return Lookup::Missing(format!("'{}' did not execute", node));
        }
        match get_path(&state.output, rest) {
            Some(value) => Lookup::Found(value.clone()),
            None => Lookup::Missing(format!(
                "'{}' has no field '{}'",
                node,
                rest.join(".")
            )),
        }
    }

    fn lookup_variable(&self, rest: &[&str]) -> Lookup {
        let Some((name, path)) = rest.split_first() else {
            let all: Map<String, Value> = self
                .ctx
                .workflow_variables
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            return Lookup::Found(Value::Object(all));
        };

        let wanted = normalize_name(name);
        let value = self.ctx.workflow_variables.get(*name).or_else(|| {
            self.ctx
                .workflow_variables
                .iter()
                .find(|(k, _)| normalize_name(k) == wanted)
                .map(|(_, v)| v)
        });

        match value.and_then(|v| get_path(v, path)) {
            Some(value) => Lookup::Found(value.clone()),
            None => Lookup::Missing(format!("variable '{}' is not set", name)),
        }
    }

    /// `loop.*` / `parallel.*`: the current iteration inside a group of that
    /// kind, otherwise the latest accessible aggregate of that kind.
    fn lookup_group_scope(&self, kind: GroupKind, rest: &[&str]) -> Lookup {
        let chain = self.workflow.enclosing_groups(self.node);
        let innermost = chain.iter().enumerate().rev().find(|(_, group)| {
            self.workflow
                .group(group)
                .map(|g| g.kind == kind)
                .unwrap_or(false)
        });

        if let Some((depth, group)) = innermost {
            let Some(index) = self.path.get(depth).copied() else {
                return Lookup::Missing(format!("'{}' has no active iteration", group));
            };
            let key = StateKey::new(*group, self.path[..depth].to_vec());
            let Some(run) = self.ctx.group_runs.get(&key) else {
                return Lookup::Missing(format!("'{}' has not opened", group));
            };
            let scope = json!({
                "index": index,
                "currentItem": run.current_item(index),
                "items": run.items.clone().map(Value::Array).unwrap_or(Value::Null),
                "iterations": run.total,
            });
            return match get_path(&scope, rest) {
                Some(value) => Lookup::Found(value.clone()),
                None => Lookup::Missing(format!(
                    "{} has no field '{}'",
                    kind.system_prefix(),
                    rest.join(".")
                )),
            };
        }

        let latest = self
            .access
            .nodes()
            .filter(|id| {
                self.workflow
                    .group(id)
                    .map(|g| g.kind == kind)
                    .unwrap_or(false)
            })
            .filter_map(|id| self.ctx.state_from(id, self.path).map(|s| (id, s)))
            .max_by_key(|(_, state)| state.sequence);

        match latest {
            Some((id, _)) => self.lookup_node(id, rest),
            None => Lookup::Missing(format!(
                "no completed {} is accessible",
                kind.system_prefix()
            )),
        }
    }

    fn error(&self, token: &str, reason: &str) -> ReferenceError {
        ReferenceError::new(self.node, token, reason)
    }
}
