//! Per-tract registry of custom content-type tags.
//!
//! Built-in tags (see [`super::BUILTIN_TAGS`]) never need registration. A
//! custom tag must be registered with a validator closure before any payload
//! carrying it can be committed or deserialized.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

type Validator = Arc<dyn Fn(&Value) -> Result<(), String> + Send + Sync>;

#[derive(Clone, Default)]
pub struct ContentTypeRegistry {
    validators: HashMap<String, Validator>,
}

impl std::fmt::Debug for ContentTypeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentTypeRegistry")
            .field("tags", &self.validators.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ContentTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a custom content-type tag with a structural validator.
    ///
    /// Registering a tag that shadows a built-in (`instruction`, `dialogue`,
    /// ...) is allowed but pointless: built-ins are always parsed by their
    /// own fixed-shape branch before the registry is consulted.
    pub fn register(
        &mut self,
        tag: impl Into<String>,
        validator: impl Fn(&Value) -> Result<(), String> + Send + Sync + 'static,
    ) {
        self.validators.insert(tag.into(), Arc::new(validator));
    }

    pub fn is_registered(&self, tag: &str) -> bool {
        self.validators.contains_key(tag)
    }

    pub fn validate(&self, tag: &str, body: &Value) -> Result<(), String> {
        match self.validators.get(tag) {
            Some(validator) => validator(body),
            None => Err(format!("content type `{tag}` is not registered")),
        }
    }

    pub fn registered_tags(&self) -> Vec<&str> {
        self.validators.keys().map(String::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unregistered_tag_fails_validate() {
        let registry = ContentTypeRegistry::new();
        assert!(!registry.is_registered("widget"));
        assert!(registry.validate("widget", &json!({})).is_err());
    }

    #[test]
    fn registered_tag_runs_validator() {
        let mut registry = ContentTypeRegistry::new();
        registry.register("widget", |body| {
            if body.is_object() {
                Ok(())
            } else {
                Err("must be an object".to_string())
            }
        });
        assert!(registry.validate("widget", &json!({"a": 1})).is_ok());
        assert!(registry.validate("widget", &json!(1)).is_err());
    }
}
