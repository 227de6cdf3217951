//! Built-in Blocks
//!
//! Blocks the engine itself understands. Everything else (agents, API
//! calls, integrations) is registered by the embedding application.

use std::sync::Arc;

use async_trait::async_trait;
use log::debug;
use serde_json::{json, Map, Value};

use super::registry::HandlerRegistry;
use super::{BlockContext, BlockHandler, BlockOutcome, BlockOutput, HandlerResult, WaitRequest};
use crate::error::ReferenceError;
use crate::references::ReferenceResolver;
use crate::workflow::Block;

pub const STARTER: &str = "starter";
pub const CONDITION: &str = "condition";
pub const WAIT: &str = "wait";
pub const VARIABLES: &str = "variables";
pub const RESPONSE: &str = "response";

/// Handle prefix used by condition branches.
pub const CONDITION_HANDLE_PREFIX: &str = "condition-";

/// Registers every built-in handler.
pub fn register_builtins(registry: &mut HandlerRegistry) {
    registry.register(Arc::new(StarterHandler));
    registry.register(Arc::new(ConditionHandler));
    registry.register(Arc::new(WaitHandler));
    registry.register(Arc::new(VariablesHandler));
    registry.register(Arc::new(ResponseHandler));
}

/// Entry block. Its output is the workflow input.
pub struct StarterHandler;

#[async_trait]
impl BlockHandler for StarterHandler {
    fn block_type(&self) -> &str {
        STARTER
    }

    fn is_entry(&self) -> bool {
        true
    }

    async fn execute(&self, _block: &Block, _inputs: &Value, ctx: &BlockContext) -> HandlerResult {
        Ok(BlockOutcome::output(starter_output(&ctx.workflow_input)))
    }
}

/// Exposes object inputs field by field and always under `input`.
fn starter_output(input: &Value) -> Value {
    match input {
        Value::Object(map) => {
            let mut output = map.clone();
            output
                .entry("input".to_string())
                .or_insert_with(|| input.clone());
            Value::Object(output)
        }
        other => json!({ "input": other }),
    }
}

/// Routes to the first branch whose expression holds.
///
/// ```yaml
/// config:
///   conditions:
///     - id: if
///       expression: "<agent.score> >= 5"
///     - id: else
/// ```
pub struct ConditionHandler;

#[async_trait]
impl BlockHandler for ConditionHandler {
    fn block_type(&self) -> &str {
        CONDITION
    }

    /// Expressions get their references as JSON literals so a referenced
    /// string can never be read as an operator.
    fn resolve_inputs(
        &self,
        block: &Block,
        resolver: &ReferenceResolver<'_>,
    ) -> Result<Value, ReferenceError> {
        let mut inputs = resolver.resolve_block_inputs(block)?;

        let raw = block.config.get("conditions").and_then(Value::as_array);
        if let (Some(raw), Some(Value::Array(resolved))) = (raw, inputs.get_mut("conditions")) {
            for (condition, slot) in raw.iter().zip(resolved.iter_mut()) {
                let Some(expression) = condition.get("expression").and_then(Value::as_str) else {
                    continue;
                };
                if let Some(target) = slot.get_mut("expression") {
                    *target = Value::String(resolver.resolve_expression(expression)?);
                }
            }
        }
        Ok(inputs)
    }

    async fn execute(&self, block: &Block, inputs: &Value, _ctx: &BlockContext) -> HandlerResult {
        let conditions = inputs
            .get("conditions")
            .and_then(Value::as_array)
            .ok_or_else(|| format!("Condition block '{}' has no conditions list", block.id))?;

        for (index, condition) in conditions.iter().enumerate() {
            let id = condition
                .get("id")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| index.to_string());
            let expression = match condition.get("expression") {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Bool(b)) => b.to_string(),
                Some(Value::Null) | None => String::new(),
                Some(other) => other.to_string(),
            };

            if evaluate_expression(&expression)? {
                debug!("Condition '{}' selected branch '{}'", block.id, id);
                let handle = format!("{}{}", CONDITION_HANDLE_PREFIX, id);
                return Ok(BlockOutcome::Completed(
                    BlockOutput::new(json!({
                        "conditionResult": true,
                        "selectedConditionId": id,
                        "selectedPath": handle,
                    }))
                    .with_handle(handle),
                ));
            }
        }

        // No branch matched; every handle-tagged edge is dead.
        Ok(BlockOutcome::Completed(
            BlockOutput::new(json!({
                "conditionResult": false,
                "selectedConditionId": Value::Null,
                "selectedPath": Value::Null,
            }))
            .with_handle(format!("{}none", CONDITION_HANDLE_PREFIX)),
        ))
    }
}

/// Suspends the run until it is resumed with external input.
pub struct WaitHandler;

#[async_trait]
impl BlockHandler for WaitHandler {
    fn block_type(&self) -> &str {
        WAIT
    }

    async fn execute(&self, _block: &Block, inputs: &Value, _ctx: &BlockContext) -> HandlerResult {
        let reason = inputs
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("Waiting for external input")
            .to_string();

        Ok(BlockOutcome::Wait(WaitRequest {
            reason,
            payload: inputs.clone(),
        }))
    }
}

/// Assigns workflow variables from its `assignments` object.
pub struct VariablesHandler;

#[async_trait]
impl BlockHandler for VariablesHandler {
    fn block_type(&self) -> &str {
        VARIABLES
    }

    async fn execute(&self, block: &Block, inputs: &Value, _ctx: &BlockContext) -> HandlerResult {
        let assignments = match inputs.get("assignments") {
            Some(Value::Object(map)) => map.clone(),
            None | Some(Value::Null) => Map::new(),
            Some(_) => {
                return Err(format!(
                    "Variables block '{}': 'assignments' must be an object",
                    block.id
                )
                .into())
            }
        };

        let mut output = BlockOutput::new(Value::Object(assignments.clone()));
        for (name, value) in assignments {
            output = output.with_variable(name, value);
        }
        Ok(BlockOutcome::Completed(output))
    }
}

/// Outputs its resolved `data` field (or the whole config).
pub struct ResponseHandler;

#[async_trait]
impl BlockHandler for ResponseHandler {
    fn block_type(&self) -> &str {
        RESPONSE
    }

    async fn execute(&self, _block: &Block, inputs: &Value, _ctx: &BlockContext) -> HandlerResult {
        let data = inputs.get("data").cloned().unwrap_or_else(|| inputs.clone());
        Ok(BlockOutcome::output(data))
    }
}

/// Comparison operators, two-character ones first.
const OPERATORS: &[&str] = &["==", "!=", ">=", "<=", ">", "<"];

/// Evaluates a resolved condition expression.
///
/// Supports `||`, `&&`, the comparisons in [`OPERATORS`], and bare literals
/// (`true`, `false`, numbers, strings). An empty expression or `else` holds.
pub fn evaluate_expression(expression: &str) -> Result<bool, String> {
    let expression = expression.trim();
    if expression.is_empty() || expression.eq_ignore_ascii_case("else") {
        return Ok(true);
    }

    for disjunct in split_unquoted(expression, "||") {
        let mut all = true;
        for conjunct in split_unquoted(disjunct, "&&") {
            if !evaluate_comparison(conjunct.trim())? {
                all = false;
                break;
            }
        }
        if all {
            return Ok(true);
        }
    }
    Ok(false)
}

fn evaluate_comparison(term: &str) -> Result<bool, String> {
    if term.is_empty() {
        return Err("Empty operand in condition".to_string());
    }

    for i in unquoted_offsets(term) {
        for op in OPERATORS {
            if term[i..].starts_with(op) {
                let left = parse_literal(&term[..i]);
                let right = parse_literal(&term[i + op.len()..]);
                return Ok(compare(&left, &right, op));
            }
        }
    }

    Ok(is_truthy(&parse_literal(term)))
}

/// Byte offsets of characters outside `'...'` and `"..."` literals.
fn unquoted_offsets(text: &str) -> Vec<usize> {
    let mut offsets = Vec::new();
    let mut quote: Option<char> = None;
    let mut escaped = false;

    for (i, c) in text.char_indices() {
        match quote {
            Some(_) if escaped => escaped = false,
            Some('"') if c == '\\' => escaped = true,
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None if c == '"' || c == '\'' => quote = Some(c),
            None => offsets.push(i),
        }
    }
    offsets
}

/// Splits on `separator` wherever it appears outside quoted literals.
fn split_unquoted<'t>(text: &'t str, separator: &str) -> Vec<&'t str> {
    let mut parts = Vec::new();
    let mut last = 0;
    for i in unquoted_offsets(text) {
        if i >= last && text[i..].starts_with(separator) {
            parts.push(&text[last..i]);
            last = i + separator.len();
        }
    }
    parts.push(&text[last..]);
    parts
}

fn parse_literal(text: &str) -> Value {
    let text = text.trim();
    if let Ok(value) = serde_json::from_str::<Value>(text) {
        return value;
    }
    let unquoted = text
        .strip_prefix('\'')
        .and_then(|s| s.strip_suffix('\''))
        .unwrap_or(text);
    Value::String(unquoted.to_string())
}

fn compare(left: &Value, right: &Value, op: &str) -> bool {
    if let (Some(l), Some(r)) = (as_number(left), as_number(right)) {
        return match op {
            "==" => l == r,
            "!=" => l != r,
            ">=" => l >= r,
            "<=" => l <= r,
            ">" => l > r,
            _ => l < r,
        };
    }

    let l = as_text(left);
    let r = as_text(right);
    match op {
        "==" => l == r,
        "!=" => l != r,
        ">=" => l >= r,
        "<=" => l <= r,
        ">" => l > r,
        _ => l < r,
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty() && s != "false",
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn context(input: Value) -> BlockContext {
        BlockContext {
            execution_id: "exec".to_string(),
            workflow_id: "wf".to_string(),
            block_id: "b".to_string(),
            block_name: "B".to_string(),
            iteration: Vec::new(),
            workflow_input: input,
            workflow_variables: HashMap::new(),
            environment_variables: Arc::new(HashMap::new()),
            is_deployed_context: false,
            workspace_id: None,
        }
    }

    #[test]
    fn test_evaluate_comparisons() {
        assert!(evaluate_expression("3 > 2").unwrap());
        assert!(!evaluate_expression("3 < 2").unwrap());
        assert!(evaluate_expression("10 >= 10").unwrap());
        assert!(evaluate_expression("hi == hi").unwrap());
        assert!(evaluate_expression("'hi' == \"hi\"").unwrap());
        assert!(evaluate_expression("2 == 2.0").unwrap());
        assert!(evaluate_expression("a != b").unwrap());
    }

    #[test]
    fn test_evaluate_logical() {
        assert!(evaluate_expression("1 > 2 || 3 > 2").unwrap());
        assert!(!evaluate_expression("1 > 2 && 3 > 2").unwrap());
        assert!(evaluate_expression("true && 1 == 1").unwrap());
    }

    #[test]
    fn test_evaluate_literals_and_else() {
        assert!(evaluate_expression("true").unwrap());
        assert!(!evaluate_expression("false").unwrap());
        assert!(!evaluate_expression("0").unwrap());
        assert!(evaluate_expression("").unwrap());
        assert!(evaluate_expression("else").unwrap());
    }

    #[test]
    fn test_evaluate_quoted_operators() {
        assert!(evaluate_expression("\"x > y\" == \"x > y\"").unwrap());
        assert!(evaluate_expression("\"R&&D\" == 'R&&D'").unwrap());
        assert!(!evaluate_expression("\"a || b\" == \"a\"").unwrap());
        assert!(evaluate_expression("'1 < 2' != \"3\" && \"say \\\"hi\\\"\" == 'say \"hi\"'").unwrap());
    }

    #[test]
    fn test_split_unquoted() {
        assert_eq!(split_unquoted("a && 'b && c' && d", "&&"), vec!["a ", " 'b && c' ", " d"]);
        assert_eq!(split_unquoted("\"x||y\"", "||"), vec!["\"x||y\""]);
    }

    #[test]
    fn test_evaluate_empty_operand_errors() {
        assert!(evaluate_expression("1 > 2 && ").is_err());
    }

    #[tokio::test]
    async fn test_starter_exposes_fields_and_input() {
        let ctx = context(json!({"name": "ada"}));
        let block = Block::new("start", STARTER);
        let outcome = StarterHandler
            .execute(&block, &json!({}), &ctx)
            .await
            .unwrap();

        match outcome {
            BlockOutcome::Completed(out) => {
                assert_eq!(out.output["name"], "ada");
                assert_eq!(out.output["input"]["name"], "ada");
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_starter_wraps_scalar_input() {
        let ctx = context(json!(5));
        let outcome = StarterHandler
            .execute(&Block::new("start", STARTER), &json!({}), &ctx)
            .await
            .unwrap();
        assert_eq!(outcome, BlockOutcome::output(json!({"input": 5})));
    }

    #[tokio::test]
    async fn test_condition_selects_first_true_branch() {
        let inputs = json!({
            "conditions": [
                {"id": "if", "expression": "1 > 2"},
                {"id": "elseif", "expression": "2 > 1"},
                {"id": "else"}
            ]
        });
        let outcome = ConditionHandler
            .execute(&Block::new("c", CONDITION), &inputs, &context(json!({})))
            .await
            .unwrap();

        match outcome {
            BlockOutcome::Completed(out) => {
                assert_eq!(out.selected_handle.as_deref(), Some("condition-elseif"));
                assert_eq!(out.output["selectedConditionId"], "elseif");
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_condition_without_match() {
        let inputs = json!({"conditions": [{"id": "if", "expression": "false"}]});
        let outcome = ConditionHandler
            .execute(&Block::new("c", CONDITION), &inputs, &context(json!({})))
            .await
            .unwrap();

        match outcome {
            BlockOutcome::Completed(out) => {
                assert_eq!(out.output["conditionResult"], false);
                assert_eq!(out.selected_handle.as_deref(), Some("condition-none"));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_condition_requires_list() {
        let result = ConditionHandler
            .execute(&Block::new("c", CONDITION), &json!({}), &context(json!({})))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_wait_returns_wait_request() {
        let inputs = json!({"message": "Approve the draft"});
        let outcome = WaitHandler
            .execute(&Block::new("w", WAIT), &inputs, &context(json!({})))
            .await
            .unwrap();

        assert_eq!(
            outcome,
            BlockOutcome::Wait(WaitRequest {
                reason: "Approve the draft".to_string(),
                payload: inputs,
            })
        );
    }

    #[tokio::test]
    async fn test_variables_assigns() {
        let inputs = json!({"assignments": {"counter": 3}});
        let outcome = VariablesHandler
            .execute(&Block::new("v", VARIABLES), &inputs, &context(json!({})))
            .await
            .unwrap();

        match outcome {
            BlockOutcome::Completed(out) => {
                assert_eq!(out.variable_updates, vec![("counter".to_string(), json!(3))]);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_variables_rejects_non_object() {
        let result = VariablesHandler
            .execute(
                &Block::new("v", VARIABLES),
                &json!({"assignments": [1]}),
                &context(json!({})),
            )
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_response_outputs_data() {
        let outcome = ResponseHandler
            .execute(
                &Block::new("r", RESPONSE),
                &json!({"data": {"ok": true}}),
                &context(json!({})),
            )
            .await
            .unwrap();
        assert_eq!(outcome, BlockOutcome::output(json!({"ok": true})));
    }
}
