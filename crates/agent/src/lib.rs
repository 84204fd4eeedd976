//! Generative phrasing for follow-up drafts.
//!
//! The deterministic composer in `touchpoint-core` always produces a complete
//! draft first. This crate optionally asks a language model to phrase the
//! personalized touches, lints the result and falls back to the
//! deterministic text whenever the model output cannot be trusted.
//!
//! # Flow
//!
//! 1. **Prompting** (`prompts`) - lead context, the selected tip and its
//!    approved links, prior emails.
//! 2. **Completion** (`llm`) - one of the configured providers.
//! 3. **Guardrails** (`guardrails`) - lint the draft, request rewrites.
//! 4. **Fallback** (`runtime`) - fixed template when the model fails or its
//!    links stay outside the allowlist.
//!
//! The model never chooses the tip or the links. Those come from the rules
//! table.

pub mod guardrails;
pub mod llm;
pub mod prompts;
pub mod runtime;

pub use guardrails::{DraftLinter, GuardrailDecision, LintContext, LintIssue};
pub use llm::{client_from_config, LlmClient, PromptPair};
pub use runtime::{AgentRequest, DraftAgent, DraftOutcome};
