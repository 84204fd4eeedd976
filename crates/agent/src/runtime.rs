use std::sync::Arc;

use touchpoint_core::compose::{Draft, DraftComposer, DraftOrigin, DraftRequest};
use touchpoint_core::domain::followup::FollowUpHistory;
use touchpoint_core::errors::ApplicationError;
use touchpoint_sources::SourceError;
use tracing::{info, warn};

use crate::guardrails::{extract_urls, DraftLinter, GuardrailDecision, LintContext};
use crate::llm::LlmClient;
use crate::prompts::{build_prompt, parse_sections, rewrite_prompt, PromptInput};

/// Per-lead input to [`DraftAgent::draft`].
pub struct AgentRequest<'a> {
    pub draft: DraftRequest<'a>,
    pub history: &'a FollowUpHistory,
    pub days_since_call: Option<i64>,
    pub days_overdue: Option<i64>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DraftOutcome {
    pub draft: Draft,
    pub model_calls: u32,
    /// Set when generated text was discarded in favor of the template.
    pub fallback_reason: Option<String>,
    /// Style issues still present in an accepted generated draft.
    pub remaining_issues: Vec<String>,
    pub priority: Option<String>,
}

impl DraftOutcome {
    fn deterministic(draft: Draft, model_calls: u32, fallback_reason: Option<String>) -> Self {
        Self { draft, model_calls, fallback_reason, remaining_issues: Vec::new(), priority: None }
    }
}

/// Composes drafts, optionally phrased by a model under lint guardrails.
pub struct DraftAgent {
    composer: Arc<DraftComposer>,
    llm: Option<Arc<dyn LlmClient>>,
    max_rewrites: u32,
}

impl DraftAgent {
    pub fn new(composer: Arc<DraftComposer>, llm: Option<Arc<dyn LlmClient>>, max_rewrites: u32) -> Self {
        Self { composer, llm, max_rewrites }
    }

    pub fn composer(&self) -> &DraftComposer {
        &self.composer
    }

    pub fn is_generative(&self) -> bool {
        self.llm.is_some()
    }

    /// Only touches with a selected tip are handed to the model; fixed and
    /// generic touches are returned exactly as rendered.
    pub async fn draft(&self, request: &AgentRequest<'_>) -> Result<DraftOutcome, ApplicationError> {
        let plan = self.composer.plan(&request.draft)?;
        let base = self.composer.render(&plan, &request.draft)?;

        let Some(llm) = self.llm.as_ref().filter(|_| plan.tip.is_some()) else {
            return Ok(DraftOutcome::deterministic(base, 0, None));
        };

        let linter = DraftLinter::new(self.composer.library());
        let mut approved_links: Vec<String> =
            plan.tip.iter().flat_map(|tip| tip.links.iter().map(|link| link.url.clone())).collect();
        approved_links.extend(extract_urls(&base.body));
        let context = LintContext {
            track: plan.spec.track,
            touch: plan.spec.touch,
            days_since_call: request.days_since_call,
            prior_emails: &request.history.emails,
            approved_links: &approved_links,
        };
        let prompt = build_prompt(&PromptInput {
            request: &request.draft,
            plan: &plan,
            base_draft: &base,
            history: request.history,
            days_since_call: request.days_since_call,
            overdue_days: request.days_overdue,
        });

        let lead_id = &request.draft.lead.id;
        let mut current = prompt.clone();
        let mut calls = 0;
        let mut last = None;

        for attempt in 0..=self.max_rewrites {
            let reply = match llm.complete(&current).await {
                Ok(reply) => reply,
                Err(error) => {
                    if let Some(blocked) =
                        error.downcast_ref::<SourceError>().filter(|source| source.is_mutation_blocked())
                    {
                        return Err(ApplicationError::ReadOnlyViolation(blocked.to_string()));
                    }
                    warn!(
                        event_name = "agent.draft.generation_failed",
                        lead_id = %lead_id,
                        provider = llm.name(),
                        error = %error,
                        "generation failed, using template"
                    );
                    return Ok(DraftOutcome::deterministic(base, calls + 1, Some(format!("generation failed: {error}"))));
                }
            };
            calls += 1;

            let sections = parse_sections(&reply);
            let decision = linter.evaluate(&sections.draft, &context);
            if decision == GuardrailDecision::Allow {
                info!(event_name = "agent.draft.accepted", lead_id = %lead_id, calls, "generated draft accepted");
                return Ok(generated(base, sections.draft, sections.priority, calls, Vec::new()));
            }
            if attempt < self.max_rewrites {
                current = rewrite_prompt(&prompt, decision.issues());
            }
            last = Some((sections, decision));
        }

        match last {
            Some((sections, GuardrailDecision::Degrade { issues, .. })) => {
                let remaining: Vec<String> = issues.iter().map(ToString::to_string).collect();
                warn!(
                    event_name = "agent.draft.issues_remaining",
                    lead_id = %lead_id,
                    issues = ?remaining,
                    "draft still has style issues after rewrites"
                );
                Ok(generated(base, sections.draft, sections.priority, calls, remaining))
            }
            Some((_, GuardrailDecision::Deny { reason_code, .. })) => {
                warn!(
                    event_name = "agent.draft.fallback",
                    lead_id = %lead_id,
                    reason_code,
                    calls,
                    "generated draft rejected, using template"
                );
                Ok(DraftOutcome::deterministic(base, calls, Some(format!("{reason_code} after {calls} attempts"))))
            }
            _ => Ok(DraftOutcome::deterministic(base, calls, None)),
        }
    }
}

fn generated(base: Draft, body: String, priority: String, calls: u32, remaining: Vec<String>) -> DraftOutcome {
    DraftOutcome {
        draft: Draft { body, origin: DraftOrigin::Generative, ..base },
        model_calls: calls,
        fallback_reason: None,
        remaining_issues: remaining,
        priority: Some(priority).filter(|priority| !priority.is_empty()),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use chrono::NaiveDate;

    use touchpoint_core::cadence::Track;
    use touchpoint_core::compose::{DraftComposer, DraftOrigin, DraftRequest};
    use touchpoint_core::domain::followup::FollowUpHistory;
    use touchpoint_core::domain::lead::{Lead, LeadId};
    use touchpoint_core::domain::owner::Owner;
    use touchpoint_core::domain::transcript::{TranscriptRecord, TranscriptSource};
    use touchpoint_core::errors::ApplicationError;
    use touchpoint_core::reference::ReferenceLibrary;
    use touchpoint_sources::SourceError;

    use super::{AgentRequest, DraftAgent};
    use crate::llm::{LlmClient, PromptPair};

    struct ScriptedLlm {
        replies: Mutex<VecDeque<Result<String>>>,
        prompts: Mutex<Vec<PromptPair>>,
    }

    impl ScriptedLlm {
        fn new(replies: Vec<Result<String>>) -> Arc<Self> {
            Arc::new(Self { replies: Mutex::new(replies.into()), prompts: Mutex::new(Vec::new()) })
        }

        fn prompts(&self) -> Vec<PromptPair> {
            self.prompts.lock().expect("prompts lock").clone()
        }
    }

    #[async_trait]
    impl LlmClient for ScriptedLlm {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn complete(&self, prompt: &PromptPair) -> Result<String> {
            self.prompts.lock().expect("prompts lock").push(prompt.clone());
            self.replies.lock().expect("replies lock").pop_front().unwrap_or_else(|| Err(anyhow!("script exhausted")))
        }
    }

    fn lead() -> Lead {
        Lead {
            id: LeadId("lead_a".to_string()),
            name: "Jane Doe".to_string(),
            email: None,
            city: Some("Austin".to_string()),
            qualification: Default::default(),
            source: None,
            reason: None,
            status_label: None,
            categories: Vec::new(),
            opportunities: Vec::new(),
            url: None,
        }
    }

    fn owner() -> Owner {
        Owner {
            email: Some("sam@lightwork.test".to_string()),
            display_name: "Sam".to_string(),
            signature: "Best,\nSam".to_string(),
            booking_link: None,
        }
    }

    fn transcript() -> TranscriptRecord {
        let mut record = TranscriptRecord::new("doc-1", TranscriptSource::Spreadsheet, "Intro");
        record.body = "Jane: there is a musty smell after the leak".to_string();
        record
    }

    fn agent(llm: Option<Arc<ScriptedLlm>>, max_rewrites: u32) -> DraftAgent {
        let library = Arc::new(ReferenceLibrary::embedded().expect("library"));
        let composer = Arc::new(DraftComposer::new(library).expect("composer"));
        DraftAgent::new(composer, llm.map(|llm| llm as Arc<dyn LlmClient>), max_rewrites)
    }

    async fn run(agent: &DraftAgent, touch: u32) -> Result<super::DraftOutcome, ApplicationError> {
        run_for(agent, &lead(), touch).await
    }

    async fn run_for(
        agent: &DraftAgent,
        lead: &Lead,
        touch: u32,
    ) -> Result<super::DraftOutcome, ApplicationError> {
        let (owner, transcript) = (owner(), transcript());
        let history = FollowUpHistory::default();
        let request = AgentRequest {
            draft: DraftRequest {
                lead,
                owner: &owner,
                track: Track::Standard,
                touch,
                transcript: Some(&transcript),
                call_date: NaiveDate::from_ymd_opt(2026, 3, 2),
            },
            history: &history,
            days_since_call: Some(5),
            days_overdue: Some(0),
        };
        agent.draft(&request).await
    }

    const CLEAN: &str = "FOLLOW-UP DRAFT:\nHey Jane,\n\nA cheap hygrometer is a good early warning for mold.\n\n\
Best,\nSam\n\nVALUE TIP REASONING:\nMusty smell.\n\nPRIORITY: MEDIUM";

    #[tokio::test]
    async fn without_a_model_the_rules_table_draft_is_returned() {
        let outcome = run(&agent(None, 3), 2).await.expect("draft");

        assert_eq!(outcome.draft.origin, DraftOrigin::RulesTable);
        assert_eq!(outcome.model_calls, 0);
        assert!(outcome.draft.body.contains("Hey Jane"));
    }

    #[tokio::test]
    async fn fixed_touches_never_reach_the_model() {
        let llm = ScriptedLlm::new(vec![Ok(CLEAN.to_string())]);
        let outcome = run(&agent(Some(llm.clone()), 3), 1).await.expect("draft");

        assert_eq!(outcome.draft.origin, DraftOrigin::FixedTemplate);
        assert!(llm.prompts().is_empty());
    }

    #[tokio::test]
    async fn clean_reply_is_accepted_with_priority() {
        let llm = ScriptedLlm::new(vec![Ok(CLEAN.to_string())]);
        let outcome = run(&agent(Some(llm), 3), 2).await.expect("draft");

        assert_eq!(outcome.draft.origin, DraftOrigin::Generative);
        assert!(outcome.draft.body.starts_with("Hey Jane,"));
        assert!(!outcome.draft.body.contains("PRIORITY"));
        assert_eq!(outcome.priority.as_deref(), Some("MEDIUM"));
        assert_eq!(outcome.draft.tip.as_ref().map(|tip| tip.topic.as_str()), Some("mold"));
    }

    #[tokio::test]
    async fn lint_issues_trigger_a_rewrite_with_the_fix_list() {
        let llm = ScriptedLlm::new(vec![
            Ok("Hey Jane \u{2014} quick idea about mold.\n\nBest,\nSam".to_string()),
            Ok(CLEAN.to_string()),
        ]);
        let outcome = run(&agent(Some(llm.clone()), 3), 2).await.expect("draft");

        assert_eq!(outcome.model_calls, 2);
        assert_eq!(outcome.draft.origin, DraftOrigin::Generative);
        let prompts = llm.prompts();
        assert!(prompts[1].user.contains("COMPLIANCE FIXES REQUIRED:\n- Contains em dash"));
    }

    #[tokio::test]
    async fn persistent_unapproved_link_falls_back_to_template() {
        let bad = "Hey Jane, read https://example.com/mold-guide when you can.\n\nBest,\nSam";
        let llm = ScriptedLlm::new(vec![Ok(bad.to_string()), Ok(bad.to_string()), Ok(bad.to_string())]);
        let outcome = run(&agent(Some(llm.clone()), 2), 2).await.expect("draft");

        assert_eq!(llm.prompts().len(), 3);
        assert_eq!(outcome.draft.origin, DraftOrigin::RulesTable);
        assert!(!outcome.draft.body.contains("example.com"));
        assert!(outcome.fallback_reason.as_deref().is_some_and(|reason| reason.contains("allowlist")));
    }

    #[tokio::test]
    async fn referred_lead_never_receives_another_tips_link() {
        let mut referred = lead();
        referred.source = Some("Andrew Wilkinson".to_string());
        let leaky = "FOLLOW-UP DRAFT:\nHey Jane,\n\nA hygrometer helps with mold. Andrew wrote about us at \
https://www.lightworkhome.com/blog-posts/wilkinson too.\n\nBest,\nSam\n\nPRIORITY: LOW";
        let llm = ScriptedLlm::new(vec![Ok(leaky.to_string()), Ok(leaky.to_string())]);

        let outcome = run_for(&agent(Some(llm.clone()), 1), &referred, 2).await.expect("draft");

        assert_eq!(llm.prompts().len(), 2);
        assert_eq!(outcome.draft.tip.as_ref().map(|tip| tip.topic.as_str()), Some("mold"));
        assert_eq!(outcome.draft.origin, DraftOrigin::RulesTable);
        assert!(!outcome.draft.body.contains("wilkinson"));
        assert!(!llm.prompts()[0].system.contains("blog-posts"));
    }

    #[tokio::test]
    async fn model_failure_falls_back_to_template() {
        let llm = ScriptedLlm::new(vec![Err(anyhow!("timeout"))]);
        let outcome = run(&agent(Some(llm), 3), 2).await.expect("draft");

        assert_eq!(outcome.draft.origin, DraftOrigin::RulesTable);
        assert!(outcome.fallback_reason.as_deref().is_some_and(|reason| reason.contains("timeout")));
    }

    #[tokio::test]
    async fn blocked_write_aborts_instead_of_falling_back() {
        let blocked = SourceError::MutationBlocked {
            method: "POST".to_string(),
            url: "https://api.close.com/api/v1/activity/email/".to_string(),
        };
        let llm = ScriptedLlm::new(vec![Err(blocked.into())]);
        let error = run(&agent(Some(llm), 3), 2).await.expect_err("fatal");

        assert!(matches!(error, ApplicationError::ReadOnlyViolation(_)));
        assert!(error.is_fatal());
    }
}
