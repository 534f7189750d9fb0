//! Model safety guard
//!
//! Some small models spend most of a short token budget on extended
//! "thinking" before they answer. For those families on fast tasks the guard
//! returns a rewritten request that asks the chat template to skip reasoning,
//! appends the `/no_think` directive to the last user text, and pins
//! conservative sampling. Every other request passes through untouched.

use std::borrow::Cow;
use std::collections::HashSet;

use crate::config::SafetyConfig;
use crate::types::{ContentBlock, MessageContent, MessageRole, RequestEnvelope, SafetyOverrides};

/// Directive recognised by the chat template to skip extended reasoning
pub const NO_THINK_DIRECTIVE: &str = "/no_think";
/// Pinned sampling for guarded requests
pub const SAFE_TEMPERATURE: f32 = 0.3;
pub const SAFE_TOP_P: f32 = 0.8;
pub const SAFE_TOP_K: u32 = 20;

/// Rewrites requests for latency-sensitive model families on fast tasks
#[derive(Debug, Clone)]
pub struct SafetyGuard {
    enabled: bool,
    model_families: Vec<String>,
    fast_tasks: HashSet<String>,
}

impl Default for SafetyGuard {
    fn default() -> Self {
        Self::from_config(&SafetyConfig::default())
    }
}

impl SafetyGuard {
    pub fn from_config(config: &SafetyConfig) -> Self {
        Self {
            enabled: config.enabled,
            model_families: config
                .model_families
                .iter()
                .map(|f| f.to_lowercase())
                .collect(),
            fast_tasks: config.fast_tasks.iter().cloned().collect(),
        }
    }

    /// Guard that never rewrites anything
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            model_families: Vec::new(),
            fast_tasks: HashSet::new(),
        }
    }

    /// Whether a request for this model and task gets rewritten
    pub fn applies_to(&self, model: &str, task: &str) -> bool {
        if !self.enabled || !self.fast_tasks.contains(task) {
            return false;
        }
        let model = model.to_lowercase();
        self.model_families.iter().any(|family| model.contains(family))
    }

    /// Return the envelope to send: borrowed as-is, or a rewritten copy
    pub fn apply<'a>(&self, envelope: &'a RequestEnvelope, task: &str) -> Cow<'a, RequestEnvelope> {
        if !self.applies_to(&envelope.model, task) {
            return Cow::Borrowed(envelope);
        }

        let mut guarded = envelope.clone();
        guarded.temperature = SAFE_TEMPERATURE;
        guarded.safety = Some(SafetyOverrides {
            disable_reasoning: true,
            top_p: SAFE_TOP_P,
            top_k: SAFE_TOP_K,
        });

        if let Some(message) = guarded
            .messages
            .iter_mut()
            .rev()
            .find(|m| m.role == MessageRole::User)
        {
            append_directive(&mut message.content);
        }

        tracing::debug!(
            task,
            model = %envelope.model,
            "Disabled extended reasoning for fast task"
        );
        Cow::Owned(guarded)
    }
}

fn append_directive(content: &mut MessageContent) {
    match content {
        MessageContent::Text(text) => append_to_text(text),
        MessageContent::Blocks(blocks) => {
            let last_text = blocks.iter_mut().rev().find_map(|block| match block {
                ContentBlock::Text { text } => Some(text),
                _ => None,
            });
            match last_text {
                Some(text) => append_to_text(text),
                None => blocks.push(ContentBlock::text(NO_THINK_DIRECTIVE)),
            }
        }
    }
}

fn append_to_text(text: &mut String) {
    if text.trim_end().ends_with(NO_THINK_DIRECTIVE) {
        return;
    }
    if !text.is_empty() {
        text.push_str("\n\n");
    }
    text.push_str(NO_THINK_DIRECTIVE);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::profiles::{QUICK_MODEL, REASONING_MODEL};
    use crate::types::{Message, Messages};

    fn envelope(model: &str, messages: Vec<Message>) -> RequestEnvelope {
        RequestEnvelope::new(model, Messages::from(messages), 0.7, 2000)
    }

    #[test]
    fn test_passes_through_other_models_and_tasks() {
        let guard = SafetyGuard::default();

        let reasoning = envelope(REASONING_MODEL, vec![Message::user("dictation")]);
        assert!(matches!(guard.apply(&reasoning, "background"), Cow::Borrowed(_)));

        let quick = envelope(QUICK_MODEL, vec![Message::user("dictation")]);
        assert!(matches!(guard.apply(&quick, "tavi"), Cow::Borrowed(_)));
        assert!(matches!(
            SafetyGuard::disabled().apply(&quick, "background"),
            Cow::Borrowed(_)
        ));
    }

    #[test]
    fn test_rewrites_fast_task_on_quick_model() {
        let guard = SafetyGuard::default();
        let original = envelope(
            QUICK_MODEL,
            vec![
                Message::system("Summarise investigations."),
                Message::user("Echo: LVEF 55%"),
                Message::assistant("..."),
                Message::user("Bloods: Hb 132"),
            ],
        );

        let guarded = guard.apply(&original, "investigation-summary");
        let guarded = guarded.as_ref();

        assert_eq!(guarded.messages[3].text(), "Bloods: Hb 132\n\n/no_think");
        assert_eq!(guarded.messages[1].text(), "Echo: LVEF 55%");
        assert_eq!(guarded.messages[0].text(), "Summarise investigations.");
        assert_eq!(guarded.temperature, SAFE_TEMPERATURE);
        assert!(guarded.reasoning_disabled());

        // The original is never edited
        assert_eq!(original.messages[3].text(), "Bloods: Hb 132");
        assert!(original.safety.is_none());
        assert_eq!(original.temperature, 0.7);
    }

    #[test]
    fn test_multi_block_content() {
        let guard = SafetyGuard::default();

        let with_text = envelope(
            QUICK_MODEL,
            vec![Message::user(vec![
                ContentBlock::text("first"),
                ContentBlock::text("second"),
                ContentBlock::image_url("data:image/png;base64,AAAA"),
            ])],
        );
        let guarded = guard.apply(&with_text, "medication").into_owned();
        match &guarded.messages[0].content {
            MessageContent::Blocks(blocks) => {
                assert_eq!(blocks.len(), 3);
                assert_eq!(blocks[0].as_text(), Some("first"));
                assert_eq!(blocks[1].as_text(), Some("second\n\n/no_think"));
            }
            other => panic!("expected blocks, got {:?}", other),
        }

        let image_only = envelope(
            QUICK_MODEL,
            vec![Message::user(vec![ContentBlock::image_url("data:image/png;base64,AAAA")])],
        );
        let guarded = guard.apply(&image_only, "medication").into_owned();
        match &guarded.messages[0].content {
            MessageContent::Blocks(blocks) => {
                assert_eq!(blocks.len(), 2);
                assert_eq!(blocks[1].as_text(), Some(NO_THINK_DIRECTIVE));
            }
            other => panic!("expected blocks, got {:?}", other),
        }
    }

    #[test]
    fn test_directive_not_duplicated() {
        let guard = SafetyGuard::default();
        let original = envelope(QUICK_MODEL, vec![Message::user("Plan: continue /no_think")]);
        let guarded = guard.apply(&original, "quick-letter");
        assert_eq!(guarded.messages[0].text(), "Plan: continue /no_think");
        assert!(guarded.reasoning_disabled());
    }
}
