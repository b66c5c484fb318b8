//! Payload template rendering collaborator.
//!
//! Rules may carry a payload template. Rendering is pluggable: the engine
//! only depends on the [`TemplateRenderer`] contract, and the payload
//! builder falls back to the untemplated payload when rendering fails.

use serde_json::Value;

use crate::error::{PipelineError, Result};

/// Template renderer abstraction.
///
/// Receives the assembled payload context and must return a valid JSON
/// object.
pub trait TemplateRenderer: Send + Sync {
    /// Render a template source with the given context.
    fn render(&self, template: &str, context: &Value) -> Result<Value>;
}

/// Default renderer: `{{ field }}` placeholder substitution against the
/// top-level context fields.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlaceholderRenderer;

impl PlaceholderRenderer {
    /// Create a new placeholder renderer.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl TemplateRenderer for PlaceholderRenderer {
    fn render(&self, template: &str, context: &Value) -> Result<Value> {
        let mut rendered = template.to_string();

        if let Value::Object(map) = context {
            for (key, value) in map {
                let placeholder = format!("{{{{ {key} }}}}");
                let value_str = match value {
                    Value::String(s) => s.clone(),
                    _ => value.to_string(),
                };
                rendered = rendered.replace(&placeholder, &value_str);
            }
        }

        let parsed: Value =
            serde_json::from_str(&rendered).map_err(|e| PipelineError::TemplateRenderingFailed {
                reason: format!("template output is not valid JSON: {e}"),
            })?;

        if parsed.is_object() {
            Ok(parsed)
        } else {
            Err(PipelineError::TemplateRenderingFailed {
                reason: "template output is not a JSON object".to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_placeholder_substitution() {
        let renderer = PlaceholderRenderer::new();
        let context = json!({"state": "confirmed", "total": 150});
        let template = r#"{"status": "{{ state }}", "amount": {{ total }}}"#;

        let rendered = renderer.render(template, &context).expect("render");
        assert_eq!(rendered, json!({"status": "confirmed", "amount": 150}));
    }

    #[test]
    fn test_non_object_output_is_error() {
        let renderer = PlaceholderRenderer::new();
        let result = renderer.render(r#""just a string""#, &json!({}));
        assert!(matches!(result, Err(PipelineError::TemplateRenderingFailed { .. })));
    }

    #[test]
    fn test_invalid_json_output_is_error() {
        let renderer = PlaceholderRenderer::new();
        let result = renderer.render("{not json", &json!({}));
        assert!(matches!(result, Err(PipelineError::TemplateRenderingFailed { .. })));
    }

    #[test]
    fn test_unresolved_placeholders_left_verbatim() {
        let renderer = PlaceholderRenderer::new();
        let rendered = renderer
            .render(r#"{"who": "{{ missing }}"}"#, &json!({"state": "x"}))
            .expect("render");
        assert_eq!(rendered, json!({"who": "{{ missing }}"}));
    }
}
