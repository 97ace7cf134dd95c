use serde::Serialize;

use crate::error::ProxyError;

/// Built-in alias table, in listing order.
const BUILTIN_ALIASES: &[(&str, &str)] = &[
    ("claude-3-5-sonnet-20241022", "claude-3-5-sonnet-20241022"),
    ("claude-3-5-haiku-20241022", "claude-3-5-haiku-20241022"),
    ("claude-3-opus-20240229", "claude-3-opus-20240229"),
    ("claude-3-sonnet-20240229", "claude-3-sonnet-20240229"),
    ("claude-3-haiku-20240307", "claude-3-haiku-20240307"),
    ("claude-sonnet-4", "claude-sonnet-4-20250514"),
    ("claude-3.5-sonnet", "claude-3-5-sonnet-20241022"),
    ("claude-3.5-haiku", "claude-3-5-haiku-20241022"),
    ("claude-opus-4", "claude-opus-4-20250514"),
    ("claude-sonnet", "claude-sonnet-4-20250514"),
    ("claude-opus", "claude-opus-4-20250514"),
    ("claude-sonnet-4-20250514", "claude-sonnet-4-20250514"),
    ("claude-opus-4-20250514", "claude-opus-4-20250514"),
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelAlias {
    pub alias: String,
    pub upstream_model_id: String,
}

/// Read-only alias → upstream model table, fixed at startup.
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    entries: Vec<ModelAlias>,
}

impl ModelRegistry {
    /// Built-in table with `overrides` applied in order. An override for an
    /// existing alias replaces its target in place; new aliases are appended.
    pub fn new(overrides: &[(String, String)]) -> Self {
        let mut entries: Vec<ModelAlias> = BUILTIN_ALIASES
            .iter()
            .map(|(alias, id)| ModelAlias {
                alias: alias.to_string(),
                upstream_model_id: id.to_string(),
            })
            .collect();

        for (alias, id) in overrides {
            match entries.iter_mut().find(|e| &e.alias == alias) {
                Some(existing) => existing.upstream_model_id = id.clone(),
                None => entries.push(ModelAlias {
                    alias: alias.clone(),
                    upstream_model_id: id.clone(),
                }),
            }
        }

        Self { entries }
    }

    pub fn resolve(&self, alias: &str) -> Result<&str, ProxyError> {
        self.entries
            .iter()
            .find(|e| e.alias == alias)
            .map(|e| e.upstream_model_id.as_str())
            .ok_or_else(|| ProxyError::UnknownModel(alias.to_string()))
    }

    pub fn list(&self) -> &[ModelAlias] {
        &self.entries
    }
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new(&[])
    }
}
