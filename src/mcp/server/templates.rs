//! Prompt templates served through `prompts/list` and `prompts/get`.
//!
//! A template is text with `{name}` placeholders. Rendering substitutes each
//! placeholder in one pass; substituted values are never expanded again.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::error::TemplateError;
use crate::mcp::server::registry::Registry;
use crate::mcp::types::{PromptArgument, PromptInfo};

/// Argument values keyed by name.
pub type TemplateArguments = BTreeMap<String, String>;

/// One declared template argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateArgument {
    /// Placeholder name.
    pub name: String,
    /// Shown to clients in `prompts/list`.
    pub description: String,
    /// Rendering fails without it.
    pub required: bool,
}

/// A named prompt with its declared arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptTemplate {
    name: String,
    description: String,
    arguments: Vec<TemplateArgument>,
    content: String,
}

impl PromptTemplate {
    /// Creates a template with no declared arguments.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            arguments: Vec::new(),
            content: content.into(),
        }
    }

    /// Declares an argument.
    #[must_use]
    pub fn argument(
        mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        required: bool,
    ) -> Self {
        self.arguments.push(TemplateArgument {
            name: name.into(),
            description: description.into(),
            required,
        });
        self
    }

    /// Template name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Template description.
    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Declared arguments in declaration order.
    #[must_use]
    pub fn arguments(&self) -> &[TemplateArgument] {
        &self.arguments
    }

    /// Raw template text.
    #[must_use]
    pub fn content(&self) -> &str {
        &self.content
    }

    fn is_required(&self, name: &str) -> bool {
        self.arguments.iter().any(|a| a.required && a.name == name)
    }

    /// Checks that every required argument is supplied.
    ///
    /// Undeclared arguments are logged and otherwise ignored.
    ///
    /// # Errors
    ///
    /// Returns [`TemplateError::MissingArgument`] naming the first required
    /// argument that is absent.
    pub fn validate_arguments(&self, arguments: &TemplateArguments) -> Result<(), TemplateError> {
        if let Some(missing) = self
            .arguments
            .iter()
            .find(|a| a.required && !arguments.contains_key(&a.name))
        {
            return Err(TemplateError::MissingArgument(missing.name.clone()));
        }
        for name in arguments.keys() {
            if !self.arguments.iter().any(|a| &a.name == name) {
                warn!(template = %self.name, argument = %name, "Unknown template argument");
            }
        }
        Ok(())
    }

    /// Substitutes `{identifier}` placeholders.
    ///
    /// A placeholder without a value renders empty unless it names a required
    /// argument. Braces around anything that is not an identifier are kept.
    ///
    /// # Errors
    ///
    /// Returns [`TemplateError::MissingArgument`] for a required placeholder
    /// without a value.
    pub fn render(&self, arguments: &TemplateArguments) -> Result<String, TemplateError> {
        let mut out = String::with_capacity(self.content.len());
        let mut rest = self.content.as_str();

        while let Some(open) = rest.find('{') {
            out.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            match after.find('}') {
                Some(close) if is_identifier(&after[..close]) => {
                    let name = &after[..close];
                    match arguments.get(name) {
                        Some(value) => out.push_str(value),
                        None if self.is_required(name) => {
                            return Err(TemplateError::MissingArgument(name.to_string()));
                        }
                        None => {}
                    }
                    rest = &after[close + 1..];
                }
                _ => {
                    out.push('{');
                    rest = after;
                }
            }
        }
        out.push_str(rest);
        debug!(template = %self.name, "Rendered template");
        Ok(out)
    }

    /// Listing entry for `prompts/list`.
    #[must_use]
    pub fn info(&self) -> PromptInfo {
        PromptInfo {
            name: self.name.clone(),
            description: non_empty(&self.description),
            arguments: self
                .arguments
                .iter()
                .map(|a| PromptArgument {
                    name: a.name.clone(),
                    description: non_empty(&a.description),
                    required: a.required,
                })
                .collect(),
        }
    }
}

fn non_empty(text: &str) -> Option<String> {
    (!text.is_empty()).then(|| text.to_string())
}

fn is_identifier(text: &str) -> bool {
    let mut chars = text.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Reads a `prompts/get` `arguments` object.
///
/// # Errors
///
/// Returns [`TemplateError::NotAString`] for a non-string value.
pub fn arguments_from_value(value: Option<&Value>) -> Result<TemplateArguments, TemplateError> {
    let Some(Value::Object(map)) = value else {
        return Ok(TemplateArguments::new());
    };
    map.iter()
        .map(|(name, value)| match value {
            Value::String(text) => Ok((name.clone(), text.clone())),
            _ => Err(TemplateError::NotAString(name.clone())),
        })
        .collect()
}

/// Prompt templates keyed by name.
pub type TemplateRegistry = Registry<PromptTemplate>;

impl TemplateRegistry {
    /// Creates an empty template registry.
    #[must_use]
    pub fn new() -> Self {
        Self::named("template")
    }

    /// Registers a template under its own name.
    pub fn add(&self, template: PromptTemplate) -> Option<Arc<PromptTemplate>> {
        let name = template.name().to_string();
        self.register(name, Arc::new(template))
    }

    /// Looks up a template.
    ///
    /// # Errors
    ///
    /// Returns [`TemplateError::NotFound`] when `name` is not registered.
    pub fn template(&self, name: &str) -> Result<Arc<PromptTemplate>, TemplateError> {
        self.get(name)
            .ok_or_else(|| TemplateError::NotFound(name.to_string()))
    }

    /// Validates `arguments` against the named template and renders it.
    ///
    /// # Errors
    ///
    /// Returns a [`TemplateError`] if the template is unknown or an argument
    /// is missing.
    pub fn render_template(
        &self,
        name: &str,
        arguments: &TemplateArguments,
    ) -> Result<String, TemplateError> {
        let template = self.template(name)?;
        template.validate_arguments(arguments)?;
        template.render(arguments)
    }
}

impl Default for TemplateRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// `prompts/get` result for a rendered template: one user text message.
#[must_use]
pub fn prompt_result(template: &PromptTemplate, text: String) -> Value {
    let mut result = json!({
        "messages": [{
            "role": "user",
            "content": {"type": "text", "text": text},
        }],
    });
    if let Some(description) = non_empty(template.description()) {
        result["description"] = Value::String(description);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(pairs: &[(&str, &str)]) -> TemplateArguments {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    fn greeting() -> PromptTemplate {
        PromptTemplate::new("greet", "Greets someone", "Hello {name}{suffix}!")
            .argument("name", "Who to greet", true)
            .argument("suffix", "", false)
    }

    #[test]
    fn substitutes_supplied_values() {
        let text = greeting()
            .render(&args(&[("name", "Ada"), ("suffix", ", welcome")]))
            .unwrap();
        assert_eq!(text, "Hello Ada, welcome!");
    }

    #[test]
    fn optional_placeholder_renders_empty() {
        assert_eq!(greeting().render(&args(&[("name", "Ada")])).unwrap(), "Hello Ada!");
    }

    #[test]
    fn missing_required_argument_is_reported() {
        let template = greeting();
        assert_eq!(
            template.validate_arguments(&args(&[("suffix", "?")])),
            Err(TemplateError::MissingArgument("name".into()))
        );
        assert_eq!(
            template.render(&TemplateArguments::new()),
            Err(TemplateError::MissingArgument("name".into()))
        );
    }

    #[test]
    fn unknown_arguments_are_accepted() {
        assert!(greeting()
            .validate_arguments(&args(&[("name", "Ada"), ("mood", "sunny")]))
            .is_ok());
    }

    #[test]
    fn non_identifier_braces_are_literal() {
        let template = PromptTemplate::new("json", "", r#"{"k": {v}} {1x} {"#);
        let text = template.render(&args(&[("v", "1")])).unwrap();
        assert_eq!(text, r#"{"k": 1} {1x} {"#);
    }

    #[test]
    fn values_are_not_expanded_again() {
        let template = PromptTemplate::new("t", "", "{a}").argument("b", "", true);
        let text = template.render(&args(&[("a", "{b}"), ("b", "no")])).unwrap();
        assert_eq!(text, "{b}");
    }

    #[test]
    fn registry_renders_by_name() {
        let registry = TemplateRegistry::new();
        assert!(registry.add(greeting()).is_none());
        assert_eq!(
            registry.render_template("greet", &args(&[("name", "Bo")])).unwrap(),
            "Hello Bo!"
        );
        assert_eq!(
            registry.render_template("nope", &TemplateArguments::new()),
            Err(TemplateError::NotFound("nope".into()))
        );
        assert!(registry.unregister("greet"));
        registry.add(greeting());
        registry.clear();
        assert!(registry.is_empty());
    }

    #[test]
    fn arguments_must_be_strings() {
        let parsed = arguments_from_value(Some(&json!({"name": "Ada"}))).unwrap();
        assert_eq!(parsed, args(&[("name", "Ada")]));
        assert!(arguments_from_value(None).unwrap().is_empty());
        assert_eq!(
            arguments_from_value(Some(&json!({"n": 3}))),
            Err(TemplateError::NotAString("n".into()))
        );
    }

    #[test]
    fn info_lists_declared_arguments() {
        let info = greeting().info();
        assert_eq!(info.name, "greet");
        assert_eq!(info.description.as_deref(), Some("Greets someone"));
        assert_eq!(info.arguments.len(), 2);
        assert!(info.arguments[0].required);
        assert!(info.arguments[1].description.is_none());
    }
}
