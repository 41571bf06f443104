//! Per-resolution value tree and template expansion.

use std::collections::HashMap;

use serde_json::{Map, Value};
use tera::{Context as TeraContext, Tera};

#[derive(Debug, Clone, thiserror::Error)]
pub enum TemplateError {
    #[error("template rendering failed: {0}")]
    Render(String),
    #[error("step {step}: foreach did not produce a list")]
    ForeachNotAList { step: String },
}

fn render_error(err: tera::Error) -> TemplateError {
    let mut message = err.to_string();
    let mut source = std::error::Error::source(&err);
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = std::error::Error::source(cause);
    }
    TemplateError::Render(message)
}

/// Scoped key/value scratch space for one resolution.
///
/// Holds the task input, per-step results, the current foreach item and the
/// other named scopes step configurations can reference through `{{ … }}`
/// expressions. Expansion never mutates the tree; a snapshot is serialized
/// into a rendering context on every call.
#[derive(Debug, Clone, Default)]
pub struct ValueContext {
    input: Value,
    resolver_input: Value,
    config: Value,
    function_args: Value,
    task: Map<String, Value>,
    variables: HashMap<String, Value>,
    steps: Map<String, Value>,
    iterator_stack: Vec<Value>,
    pre_hook: Option<Value>,
}

impl ValueContext {
    pub fn new(input: Value, resolver_input: Value) -> Self {
        Self {
            input,
            resolver_input,
            ..Self::default()
        }
    }

    pub fn set_task_attr(&mut self, key: &str, value: Value) {
        self.task.insert(key.to_string(), value);
    }

    pub fn set_config(&mut self, config: Value) {
        self.config = config;
    }

    pub fn set_function_args(&mut self, args: Value) {
        self.function_args = args;
    }

    pub fn set_variables(&mut self, variables: HashMap<String, Value>) {
        self.variables = variables;
    }

    /// Record one step's visible result under `step.<name>`.
    pub fn record_step(
        &mut self,
        name: &str,
        state: &str,
        output: &Value,
        metadata: &Value,
        error: Option<&str>,
        children: Option<&Value>,
        tags: &HashMap<String, String>,
    ) {
        let mut entry = Map::new();
        entry.insert("state".to_string(), Value::String(state.to_string()));
        entry.insert("output".to_string(), output.clone());
        entry.insert("metadata".to_string(), metadata.clone());
        entry.insert(
            "error".to_string(),
            error.map(|e| Value::String(e.to_string())).unwrap_or(Value::Null),
        );
        if let Some(children) = children {
            entry.insert("children".to_string(), children.clone());
        }
        if !tags.is_empty() {
            entry.insert(
                "tags".to_string(),
                Value::Object(
                    tags.iter()
                        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                        .collect(),
                ),
            );
        }
        self.steps.insert(name.to_string(), Value::Object(entry));
    }

    /// Push a foreach item for child evaluation. Pop when done.
    pub fn push_iterator(&mut self, item: Value) {
        self.iterator_stack.push(item);
    }

    pub fn pop_iterator(&mut self) {
        self.iterator_stack.pop();
    }

    pub fn set_pre_hook(&mut self, output: Value) {
        self.pre_hook = Some(output);
    }

    pub fn clear_pre_hook(&mut self) {
        self.pre_hook = None;
    }

    fn base_context(&self) -> TeraContext {
        let mut ctx = TeraContext::new();
        ctx.insert("input", &self.input);
        ctx.insert("resolver_input", &self.resolver_input);
        ctx.insert("config", &self.config);
        ctx.insert("function_args", &self.function_args);
        ctx.insert("task", &self.task);
        ctx.insert("step", &self.steps);
        if let Some(item) = self.iterator_stack.last() {
            ctx.insert("iterator", item);
        }
        if let Some(pre_hook) = &self.pre_hook {
            ctx.insert("pre_hook", pre_hook);
        }
        ctx
    }

    fn snapshot(&self) -> Result<TeraContext, TemplateError> {
        let mut ctx = self.base_context();
        if !self.variables.is_empty() {
            // Variables may themselves reference the other scopes; render them
            // against the base snapshot before exposing them as `var.<name>`.
            let mut rendered = Map::new();
            for (name, raw) in &self.variables {
                let value = match raw {
                    Value::String(s) if contains_template(s) => render_template(&ctx, s)?,
                    other => other.clone(),
                };
                rendered.insert(name.clone(), value);
            }
            ctx.insert("var", &rendered);
        }
        Ok(ctx)
    }

    /// Render a single template string. Strings without `{{ … }}` segments are
    /// returned untouched; a string that is exactly one expression keeps the
    /// referenced value's type (lists stay lists, numbers stay numbers), and
    /// mixed text renders to a string.
    pub fn expand_str(&self, raw: &str) -> Result<Value, TemplateError> {
        if !contains_template(raw) {
            return Ok(Value::String(raw.to_string()));
        }
        render_template(&self.snapshot()?, raw)
    }

    /// Render a template string and keep the result as text (titles, result
    /// formats).
    pub fn expand_text(&self, raw: &str) -> Result<String, TemplateError> {
        if !contains_template(raw) {
            return Ok(raw.to_string());
        }
        Tera::one_off(raw, &self.snapshot()?, false).map_err(render_error)
    }

    /// Walk a whole configuration tree, expanding every string node.
    pub fn expand_value(&self, value: &Value) -> Result<Value, TemplateError> {
        match value {
            Value::String(raw) => self.expand_str(raw),
            Value::Array(items) => {
                let mut expanded = Vec::with_capacity(items.len());
                for item in items {
                    expanded.push(self.expand_value(item)?);
                }
                Ok(Value::Array(expanded))
            }
            Value::Object(entries) => {
                let mut expanded = Map::new();
                for (key, item) in entries {
                    expanded.insert(key.clone(), self.expand_value(item)?);
                }
                Ok(Value::Object(expanded))
            }
            other => Ok(other.clone()),
        }
    }

    /// Render a foreach expression into the list it fans out over.
    pub fn expand_list(&self, raw: &str, step: &str) -> Result<Vec<Value>, TemplateError> {
        match self.expand_str(raw)? {
            Value::Array(items) => Ok(items),
            _ => Err(TemplateError::ForeachNotAList {
                step: step.to_string(),
            }),
        }
    }
}

fn contains_template(raw: &str) -> bool {
    raw.contains("{{") || raw.contains("{%")
}

fn render_template(ctx: &TeraContext, raw: &str) -> Result<Value, TemplateError> {
    // A lone `{{ expr }}` goes through json_encode so the referenced value
    // keeps its type; plain rendering of a list drops the quoting of its
    // string elements.
    if let Some(expr) = single_expression(raw) {
        let wrapped = format!("{{{{ {expr} | json_encode }}}}");
        let rendered = Tera::one_off(&wrapped, ctx, false).map_err(render_error)?;
        if let Ok(value) = serde_json::from_str(&rendered) {
            return Ok(value);
        }
    }
    let rendered = Tera::one_off(raw, ctx, false).map_err(render_error)?;
    Ok(reparse(rendered))
}

fn single_expression(raw: &str) -> Option<&str> {
    let inner = raw.trim().strip_prefix("{{")?.strip_suffix("}}")?;
    if inner.contains("{{") || inner.contains("}}") || inner.contains("{%") {
        return None;
    }
    Some(inner.trim())
}

fn reparse(rendered: String) -> Value {
    serde_json::from_str(&rendered).unwrap_or(Value::String(rendered))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context() -> ValueContext {
        let mut ctx = ValueContext::new(json!({"env": "prod", "count": 3}), Value::Null);
        ctx.record_step(
            "fetch",
            "DONE",
            &json!({"url": "https://example.org", "ids": [1, 2]}),
            &json!({"http_status": 200}),
            None,
            None,
            &HashMap::new(),
        );
        ctx
    }

    #[test]
    fn plain_strings_pass_through() {
        let ctx = context();
        assert_eq!(
            ctx.expand_str("no templates here").expect("expand"),
            json!("no templates here")
        );
    }

    #[test]
    fn expansion_reparses_json_values() {
        let ctx = context();
        assert_eq!(ctx.expand_str("{{ input.count }}").expect("expand"), json!(3));
        assert_eq!(
            ctx.expand_str("{{ step.fetch.metadata.http_status }}").expect("expand"),
            json!(200)
        );
        assert_eq!(
            ctx.expand_str("env={{ input.env }}").expect("expand"),
            json!("env=prod")
        );
    }

    #[test]
    fn expand_value_walks_nested_configs() {
        let ctx = context();
        let config = json!({
            "url": "{{ step.fetch.output.url }}/items",
            "nested": {"count": "{{ input.count }}"},
            "list": ["{{ input.env }}", 42]
        });
        let expanded = ctx.expand_value(&config).expect("expand");
        assert_eq!(
            expanded,
            json!({
                "url": "https://example.org/items",
                "nested": {"count": 3},
                "list": ["prod", 42]
            })
        );
    }

    #[test]
    fn foreach_requires_a_list() {
        let ctx = context();
        let items = ctx
            .expand_list("{{ step.fetch.output.ids }}", "fan")
            .expect("expand");
        assert_eq!(items, vec![json!(1), json!(2)]);

        let err = ctx.expand_list("{{ input.env }}", "fan").unwrap_err();
        assert!(matches!(err, TemplateError::ForeachNotAList { .. }));
    }

    #[test]
    fn string_lists_and_objects_keep_their_shape() {
        let mut ctx = context();
        ctx.record_step(
            "list",
            "DONE",
            &json!({"names": ["alice", "bob"], "pair": {"k": "v"}}),
            &Value::Null,
            None,
            None,
            &HashMap::new(),
        );
        let items = ctx
            .expand_list("{{ step.list.output.names }}", "fan")
            .expect("expand");
        assert_eq!(items, vec![json!("alice"), json!("bob")]);
        assert_eq!(
            ctx.expand_str("{{ step.list.output.pair }}").expect("expand"),
            json!({"k": "v"})
        );
    }

    #[test]
    fn iterator_scope_is_stacked() {
        let mut ctx = context();
        ctx.push_iterator(json!({"name": "a"}));
        assert_eq!(
            ctx.expand_str("{{ iterator.name }}").expect("expand"),
            json!("a")
        );
        ctx.pop_iterator();
        assert!(ctx.expand_str("{{ iterator.name }}").is_err());
    }

    #[test]
    fn bad_reference_is_a_render_error() {
        let ctx = context();
        let err = ctx.expand_str("{{ step.missing.output }}").unwrap_err();
        assert!(matches!(err, TemplateError::Render(_)));
    }

    #[test]
    fn variables_render_against_the_tree() {
        let mut ctx = context();
        ctx.set_variables(HashMap::from([(
            "base_url".to_string(),
            json!("{{ step.fetch.output.url }}"),
        )]));
        assert_eq!(
            ctx.expand_str("{{ var.base_url }}/health").expect("expand"),
            json!("https://example.org/health")
        );
    }
}
