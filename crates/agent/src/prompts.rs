//! Prompt assembly and parsing of the model's sectioned reply.

use std::sync::LazyLock;

use regex::Regex;

use touchpoint_core::cadence::Track;
use touchpoint_core::compose::{Draft, DraftPlan, DraftRequest};
use touchpoint_core::domain::followup::FollowUpHistory;
use touchpoint_core::domain::transcript::cap_text;

use crate::guardrails::{length_caps, LintIssue};
use crate::llm::PromptPair;

/// Call notes beyond this many characters are truncated in the prompt.
pub const PROMPT_NOTES_CAP: usize = 6000;
/// Overdue drafts past this many days must not imply the call was recent.
const OVERDUE_NOTICE_DAYS: i64 = 3;

static DRAFT_SECTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)FOLLOW-UP\s*DRAFT:\s*(.*?)\s*(?:VALUE\s*TIP\s*REASONING:|PRIORITY:|$)")
        .expect("draft section pattern is valid")
});
static REASONING_SECTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)VALUE\s*TIP\s*REASONING:\s*(.*?)\s*(?:PRIORITY:|$)").expect("reasoning section pattern is valid")
});
static PRIORITY_SECTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)PRIORITY:\s*(.*?)\s*$").expect("priority section pattern is valid"));

/// Everything the prompt needs about one lead and its planned touch.
pub struct PromptInput<'a> {
    pub request: &'a DraftRequest<'a>,
    pub plan: &'a DraftPlan,
    pub base_draft: &'a Draft,
    pub history: &'a FollowUpHistory,
    pub days_since_call: Option<i64>,
    pub overdue_days: Option<i64>,
}

pub fn build_prompt(input: &PromptInput<'_>) -> PromptPair {
    PromptPair { system: system_prompt(input), user: user_prompt(input) }
}

fn system_prompt(input: &PromptInput<'_>) -> String {
    let (max_sentences, max_words) = length_caps(input.plan.spec.track, input.plan.spec.touch);
    let sender = &input.request.owner.display_name;

    let mut lines = vec![
        format!("You phrase short sales follow-up emails for {sender} at a home health testing company."),
        String::new(),
        "RULES:".to_string(),
        format!("- At most {max_sentences} sentences and {max_words} words."),
        "- Use the lead's first name in the greeting.".to_string(),
        "- Mention at most one tip, and only the tip given below. Never invent tips.".to_string(),
        "- Only use links listed under APPROVED LINKS. Do not add any other URL.".to_string(),
        "- Do not imply anything is scheduled unless the notes confirm it.".to_string(),
        "- No filler such as \"just checking in\", \"circling back\" or \"touching base\".".to_string(),
        "- Never use em dashes. At most one exclamation mark.".to_string(),
        "- Do not repeat resources or talking points from emails already sent.".to_string(),
        "- Sign off with the exact signature provided.".to_string(),
    ];
    lines.join("\n")
}

fn user_prompt(input: &PromptInput<'_>) -> String {
    let request = input.request;
    let lead = request.lead;
    let plan = input.plan;
    let mut sections = Vec::new();

    let mode = match plan.spec.track {
        Track::Standard => "ACTIVE",
        Track::Nurture => {
            "LONG-TERM NURTURE. The lead said now is not the right time. Share something useful, \
             with no asks and no scheduling."
        }
        Track::Rebook => "REBOOK. The lead missed the call. Do not reference any conversation.",
    };
    sections.push(format!("CADENCE: {mode}"));
    if plan.referral {
        sections.push(
            "This lead came through a personal referral. Do not mention the referrer or their write-up."
                .to_string(),
        );
    }

    let mut touch = format!("FOLLOW-UP #{} ({})", plan.spec.touch, plan.spec.label);
    if let Some(days) = input.days_since_call {
        touch.push_str(&format!("\nDays since the call: {days}."));
    }
    if let Some(overdue) = input.overdue_days.filter(|days| *days > OVERDUE_NOTICE_DAYS) {
        touch.push_str(&format!(
            " This follow-up is {overdue} days late, so avoid \"the other day\" or \"recently\"."
        ));
    }
    sections.push(touch);

    match &plan.tip {
        Some(tip) => {
            let mut block = format!("TIP (topic: {}):\n{}", tip.topic, tip.tip);
            block.push_str("\n\nAPPROVED LINKS:");
            if tip.links.is_empty() {
                block.push_str("\n(none, include no links)");
            }
            for link in &tip.links {
                block.push_str(&format!("\n- {} <{}>", link.label, link.url));
            }
            sections.push(block);
        }
        None => sections.push("TIP: none. Write a clean, short follow-up without a tip or links.".to_string()),
    }

    sections.push(format!("STARTING DRAFT (rephrase, keep the facts):\n{}", input.base_draft.body));
    sections.push(format!("SIGNATURE:\n{}", request.owner.signature));

    let prior = if input.history.emails.is_empty() {
        "(No prior emails sent)".to_string()
    } else {
        input.history.summary()
    };
    sections.push(format!("EMAILS ALREADY SENT (do not repeat their tips or resources):\n{prior}"));

    let field = |value: &Option<String>| value.clone().unwrap_or_else(|| "N/A".to_string());
    sections.push(format!(
        "LEAD:\n- Name: {} (greet as \"{}\")\n- City: {}\n- Budget: {}\n- Annual health spend: {}\n\
         - Home size: {}\n- Heard about us: {}\n- Reason for reaching out: {}",
        lead.name,
        lead.first_name(),
        field(&lead.city),
        field(&lead.qualification.budget),
        field(&lead.qualification.health_spend),
        field(&lead.qualification.home_size),
        field(&lead.source),
        field(&lead.reason),
    ));

    let notes = request
        .transcript
        .map(|record| record.call_notes())
        .filter(|notes| !notes.trim().is_empty())
        .map(|notes| cap_text(&notes, PROMPT_NOTES_CAP))
        .unwrap_or_else(|| "(No transcript available)".to_string());
    sections.push(format!("CALL NOTES:\n{notes}"));

    sections.push(
        "Reply in exactly this format:\n\nFOLLOW-UP DRAFT:\n[the email]\n\nVALUE TIP REASONING:\n\
         [one sentence on why the tip fits, or \"No tip.\"]\n\nPRIORITY: [HIGH / MEDIUM / LOW]"
            .to_string(),
    );
    sections.join("\n\n")
}

/// Same prompt with the lint findings appended as required fixes.
pub fn rewrite_prompt(original: &PromptPair, issues: &[LintIssue]) -> PromptPair {
    let fixes = issues.iter().map(|issue| format!("- {issue}")).collect::<Vec<_>>().join("\n");
    PromptPair {
        system: original.system.clone(),
        user: format!(
            "{}\n\nCOMPLIANCE FIXES REQUIRED:\n{fixes}\n\nRewrite the email to fix these issues. \
             Keep it short, specific and human.",
            original.user
        ),
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DraftSections {
    pub draft: String,
    pub reasoning: String,
    pub priority: String,
}

/// Splits a reply into its sections. Without a draft heading the whole reply
/// is the draft.
pub fn parse_sections(text: &str) -> DraftSections {
    let text = text.trim();
    let grab = |pattern: &Regex| {
        pattern.captures(text).and_then(|captures| captures.get(1)).map(|m| m.as_str().trim().to_string())
    };

    let draft = grab(&DRAFT_SECTION).filter(|draft| !draft.is_empty()).unwrap_or_else(|| text.to_string());
    DraftSections {
        draft,
        reasoning: grab(&REASONING_SECTION).unwrap_or_default(),
        priority: grab(&PRIORITY_SECTION).unwrap_or_default(),
    }
}
