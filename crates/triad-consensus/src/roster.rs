//! Review-type → delegate roster routing.

use std::collections::HashMap;

use once_cell::sync::Lazy;

use triad_core::types::ModelId;

/// Built-in routes. Configuration (`routing.*`) overrides per review type;
/// anything unlisted falls back to DEFAULT (the full trio).
static DEFAULT_ROUTES: Lazy<HashMap<&'static str, Vec<&'static str>>> = Lazy::new(|| {
    HashMap::from([
        ("ARCHITECTURE", vec!["claude", "gemini"]),
        ("SECURITY", vec!["claude", "codex"]),
        ("IMPLEMENTATION", vec!["codex", "claude"]),
        ("DEFAULT", vec!["claude", "codex", "gemini"]),
    ])
});

#[derive(Debug, Clone)]
pub struct Roster {
    routes: HashMap<String, Vec<ModelId>>,
    default: Vec<ModelId>,
}

impl Roster {
    /// Built-ins merged with the configured `routing` table.
    pub fn from_config(routing: &std::collections::BTreeMap<String, Vec<String>>) -> Self {
        let mut routes: HashMap<String, Vec<ModelId>> = DEFAULT_ROUTES
            .iter()
            .map(|(k, models)| {
                (
                    k.to_string(),
                    models.iter().map(|m| ModelId::new(*m)).collect(),
                )
            })
            .collect();
        for (review_type, models) in routing {
            routes.insert(
                review_type.clone(),
                models.iter().map(|m| ModelId::new(m.clone())).collect(),
            );
        }
        let default = routes
            .get("DEFAULT")
            .cloned()
            .unwrap_or_else(|| vec![ModelId::new("claude"), ModelId::new("codex"), ModelId::new("gemini")]);
        Self { routes, default }
    }

    pub fn for_review_type(&self, review_type: &str) -> &[ModelId] {
        self.routes
            .get(review_type)
            .map(Vec::as_slice)
            .unwrap_or(&self.default)
    }
}

impl Default for Roster {
    fn default() -> Self {
        Self::from_config(&std::collections::BTreeMap::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_routes_resolve() {
        let roster = Roster::default();
        let arch: Vec<&str> = roster
            .for_review_type("ARCHITECTURE")
            .iter()
            .map(|m| m.as_str())
            .collect();
        assert_eq!(arch, vec!["claude", "gemini"]);

        let security: Vec<&str> = roster
            .for_review_type("SECURITY")
            .iter()
            .map(|m| m.as_str())
            .collect();
        assert_eq!(security, vec!["claude", "codex"]);
    }

    #[test]
    fn unknown_review_type_gets_full_trio() {
        let roster = Roster::default();
        assert_eq!(roster.for_review_type("PLAN").len(), 3);
    }

    #[test]
    fn config_overrides_builtin() {
        let mut routing = std::collections::BTreeMap::new();
        routing.insert("SECURITY".to_string(), vec!["gemini".to_string()]);
        let roster = Roster::from_config(&routing);
        let security: Vec<&str> = roster
            .for_review_type("SECURITY")
            .iter()
            .map(|m| m.as_str())
            .collect();
        assert_eq!(security, vec!["gemini"]);
    }
}
