//! C5: renders named prompt templates against a context map. Plain string
//! substitution, no templating crate — the system prompt and skill prompts
//! are a handful of short, fixed layouts, not user-facing documents.

use std::collections::HashMap;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("unknown template: {0}")]
    NotFound(String),
}

/// A registry of named templates. Placeholders are written `{{key}}`; a
/// missing key in the context map is substituted with an empty string
/// rather than erroring, matching the teacher's tolerant prompt assembly
/// (a missing optional section should just disappear, not fail the turn).
#[derive(Debug, Clone, Default)]
pub struct TemplateRenderer {
    templates: HashMap<String, String>,
}

impl TemplateRenderer {
    pub fn new() -> Self {
        Self {
            templates: HashMap::new(),
        }
    }

    pub fn register(&mut self, name: impl Into<String>, body: impl Into<String>) {
        self.templates.insert(name.into(), body.into());
    }

    pub fn render(&self, name: &str, context: &HashMap<&str, String>) -> Result<String, TemplateError> {
        let body = self
            .templates
            .get(name)
            .ok_or_else(|| TemplateError::NotFound(name.to_string()))?;
        Ok(substitute(body, context))
    }
}

fn substitute(body: &str, context: &HashMap<&str, String>) -> String {
    let mut out = String::with_capacity(body.len());
    let mut rest = body;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                let key = after[..end].trim();
                out.push_str(context.get(key).map(String::as_str).unwrap_or(""));
                rest = &after[end + 2..];
            }
            None => {
                out.push_str(rest);
                rest = "";
                break;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Built-in template names used by the Conversation Manager and Dispatch
/// Middleware (§4.3, §4.5).
pub mod names {
    pub const SYSTEM_MESSAGE: &str = "system_message";
    pub const SKILL_SELECTION: &str = "skill_selection";
    pub const COMMAND_INTERPRETATION: &str = "command_interpretation";
    pub const MEMORY_ASSIMILATION: &str = "memory_assimilation";
}

/// Builds a `TemplateRenderer` pre-loaded with the engine's fixed templates.
pub fn default_renderer() -> TemplateRenderer {
    let mut r = TemplateRenderer::new();

    r.register(
        names::SYSTEM_MESSAGE,
        "{{base}}\
         {{summary_section}}\
         {{profile_section}}\
         {{recent_memories_section}}\
         {{relevant_memories_section}}",
    );

    r.register(
        names::SKILL_SELECTION,
        "A user asked: \"{{query}}\"\n\n\
         Candidate skills:\n{{candidates}}\n\n\
         Respond with a JSON object: \
         {\"skill_id\":string,\"parameters\":object,\"skill_intention\":string,\
         \"frustration_level\":number,\"frustration_reason\":string}.",
    );

    r.register(
        names::COMMAND_INTERPRETATION,
        "The skill `{{skill_id}}` was invoked for the request \"{{query}}\" and returned:\n\n\
         {{result}}\n\
         {{chat_context}}\n\n\
         Write a natural-language reply to the user based on this result.",
    );

    r.register(
        names::MEMORY_ASSIMILATION,
        "Turn:\n{{turn_context}}\n\n\
         Existing candidate memories:\n{{candidates}}\n\n\
         Decide what to do with this turn. Respond with a JSON object: \
         {\"action\":\"ignore\"|\"reinforce\"|\"create\",\"memory_id\":string,\"new_text\":string,\
         \"target\":\"key\"|\"extended\",\"topic\":string,\"text\":string,\
         \"past_memory_ids\":[string],\"duplicates\":[string]}. \
         Omit fields that don't apply to the chosen action.",
    );

    r
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitutes_known_keys_and_blanks_unknown_ones() {
        let mut r = TemplateRenderer::new();
        r.register("greet", "Hello {{name}}, you are {{mood}} today.");
        let mut ctx = HashMap::new();
        ctx.insert("name", "Ada".to_string());
        let out = r.render("greet", &ctx).unwrap();
        assert_eq!(out, "Hello Ada, you are  today.");
    }

    #[test]
    fn unregistered_template_errors() {
        let r = TemplateRenderer::new();
        let err = r.render("missing", &HashMap::new()).unwrap_err();
        matches!(err, TemplateError::NotFound(_));
    }

    #[test]
    fn default_renderer_composes_system_message_sections() {
        let r = default_renderer();
        let mut ctx = HashMap::new();
        ctx.insert("base", "You are Orakle.".to_string());
        ctx.insert("summary_section", "\n\nSummary: none yet.".to_string());
        let out = r.render(names::SYSTEM_MESSAGE, &ctx).unwrap();
        assert!(out.starts_with("You are Orakle."));
        assert!(out.contains("Summary: none yet."));
    }
}
