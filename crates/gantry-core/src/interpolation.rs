use crate::workflow::BooleanOrExpression;
use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;

static EXPRESSION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{\{\s*([^}]+?)\s*\}\}").expect("interpolation pattern is valid")
});

/// Context for variable interpolation.
#[derive(Debug, Clone, Default)]
pub struct InterpolationContext {
    /// Workflow, matrix and step variables
    pub variables: HashMap<String, String>,
    /// Step outputs: "step_name.output_key" -> value
    pub outputs: HashMap<String, String>,
    /// Matrix values for current run
    pub matrix: HashMap<String, String>,
    /// Trigger context: workflow, ref, ref_name, event_name, sha, base_ref, head_ref
    pub trigger: HashMap<String, String>,
}

impl InterpolationContext {
    /// Create a new empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Interpolate variables in a string.
    ///
    /// Supports:
    /// - `${{ variable }}` - direct variable lookup
    /// - `${{ env.VAR }}` - environment variable
    /// - `${{ matrix.key }}` - matrix value
    /// - `${{ steps.name.outputs.key }}` - step output
    /// - `${{ workflow }}`, `${{ ref }}`, `${{ sha }}`... - trigger context
    pub fn interpolate(&self, input: &str) -> String {
        EXPRESSION
            .replace_all(input, |caps: &regex::Captures| {
                let expr = caps.get(1).map_or("", |m| m.as_str()).trim();
                self.resolve_expression(expr)
            })
            .to_string()
    }

    /// Whether the input contains any `${{ }}` expression.
    pub fn has_expressions(input: &str) -> bool {
        EXPRESSION.is_match(input)
    }

    fn resolve_expression(&self, expr: &str) -> String {
        if let Some(var_name) = expr.strip_prefix("env.") {
            return self
                .variables
                .get(var_name)
                .cloned()
                .or_else(|| std::env::var(var_name).ok())
                .unwrap_or_default();
        }

        if let Some(key) = expr.strip_prefix("matrix.") {
            return self.matrix.get(key).cloned().unwrap_or_default();
        }

        if let Some(rest) = expr.strip_prefix("steps.")
            && let Some((step_name, output_key)) = rest.split_once(".outputs.")
        {
            let lookup_key = format!("{}.{}", step_name, output_key);
            return self.outputs.get(&lookup_key).cloned().unwrap_or_default();
        }

        let key = expr.strip_prefix("gantry.").unwrap_or(expr);
        if let Some(value) = self.trigger.get(key) {
            return value.clone();
        }

        self.variables.get(expr).cloned().unwrap_or_default()
    }

    /// Record a step output for later `steps.<name>.outputs.<key>` lookups.
    pub fn set_output(&mut self, step_name: &str, key: &str, value: impl Into<String>) {
        self.outputs
            .insert(format!("{}.{}", step_name, key), value.into());
    }

    /// Parse outputs written to the `GANTRY_OUTPUT` file.
    ///
    /// Format: one `key=value` per line.
    pub fn parse_outputs(&mut self, step_name: &str, content: &str) {
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                let key = key.trim();
                if !key.is_empty() {
                    self.set_output(step_name, key, value.trim());
                }
            }
        }
    }

    /// Evaluate a boolean flag that may be a literal or an expression.
    pub fn evaluate_flag(&self, flag: Option<&BooleanOrExpression>) -> bool {
        match flag {
            None => false,
            Some(BooleanOrExpression::Boolean(b)) => *b,
            Some(BooleanOrExpression::Expression(expr)) => self.evaluate_string_expression(expr),
        }
    }

    /// Evaluate a simple string expression (equality, inequality, contains).
    fn evaluate_string_expression(&self, expr: &str) -> bool {
        let interpolated = self.interpolate(expr);
        let trimmed = interpolated.trim();

        if trimmed == "true" {
            return true;
        }
        if trimmed == "false" || trimmed.is_empty() {
            return false;
        }

        if let Some((left, right)) = trimmed.split_once("!=") {
            return unquote(left) != unquote(right);
        }
        if let Some((left, right)) = trimmed.split_once("==") {
            return unquote(left) == unquote(right);
        }
        if let Some((left, right)) = trimmed.split_once(" contains ") {
            return unquote(left).contains(unquote(right));
        }

        false
    }
}

fn unquote(s: &str) -> &str {
    let s = s.trim();
    s.strip_prefix('\'')
        .and_then(|rest| rest.strip_suffix('\''))
        .unwrap_or(s)
}
