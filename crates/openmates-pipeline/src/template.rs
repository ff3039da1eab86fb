//! Typed tool-description templating (SPEC_FULL.md §4.D.1). Replaces the
//! ad hoc string substitution the teacher and the original source both do
//! (`{PLACEHOLDER}` tokens resolved scattered across call sites) with one
//! explicit type resolved once per task.

use std::collections::BTreeMap;

use tracing::warn;

/// Resolved once per task, keyed by the placeholder name without braces
/// (e.g. `"AVAILABLE_APPS"`).
#[derive(Debug, Clone, Default)]
pub struct TemplateContext(BTreeMap<String, String>);

impl TemplateContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(|s| s.as_str())
    }
}

/// A tool description (or any manifest string) carrying `{PLACEHOLDER}` tokens.
#[derive(Debug, Clone)]
pub struct PromptTemplate {
    raw: String,
}

impl PromptTemplate {
    pub fn new(raw: impl Into<String>) -> Self {
        Self { raw: raw.into() }
    }

    /// Resolve every `{PLACEHOLDER}` this template contains against `ctx`.
    /// Placeholders missing from `ctx` are left verbatim and logged — a
    /// manifest typo must be visible in logs, never shipped silently broken.
    pub fn render(&self, ctx: &TemplateContext) -> String {
        let mut out = String::with_capacity(self.raw.len());
        let mut rest = self.raw.as_str();

        while let Some(open) = rest.find('{') {
            out.push_str(&rest[..open]);
            let after_open = &rest[open + 1..];
            match after_open.find('}') {
                Some(close) => {
                    let key = &after_open[..close];
                    if is_placeholder_key(key) {
                        match ctx.get(key) {
                            Some(value) => out.push_str(value),
                            None => {
                                warn!(placeholder = key, "unresolved template placeholder");
                                out.push('{');
                                out.push_str(key);
                                out.push('}');
                            }
                        }
                        rest = &after_open[close + 1..];
                    } else {
                        // Not a placeholder token (e.g. a literal JSON brace) — copy
                        // the opening brace and keep scanning past it.
                        out.push('{');
                        rest = after_open;
                    }
                }
                None => {
                    out.push('{');
                    rest = after_open;
                }
            }
        }
        out.push_str(rest);
        out
    }
}

/// A placeholder key is alphanumeric/underscore, matching `{AVAILABLE_APPS}`-style
/// tokens — this excludes ordinary JSON object braces from being misread as templates.
fn is_placeholder_key(key: &str) -> bool {
    !key.is_empty() && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_known_placeholders() {
        let ctx = TemplateContext::new().with("AVAILABLE_APPS", "code, travel");
        let tpl = PromptTemplate::new("Apps available: {AVAILABLE_APPS}.");
        assert_eq!(tpl.render(&ctx), "Apps available: code, travel.");
    }

    #[test]
    fn leaves_unresolved_placeholders_verbatim() {
        let ctx = TemplateContext::new();
        let tpl = PromptTemplate::new("Missing: {NOT_SET}");
        assert_eq!(tpl.render(&ctx), "Missing: {NOT_SET}");
    }

    #[test]
    fn does_not_mistake_json_braces_for_placeholders() {
        let ctx = TemplateContext::new().with("X", "y");
        let tpl = PromptTemplate::new(r#"schema: {"type": "object"} then {X}"#);
        assert_eq!(tpl.render(&ctx), r#"schema: {"type": "object"} then y"#);
    }
}
