//! Deterministic draft composition.
//!
//! The composer picks the template for a (track, touch) pair, scans the call
//! notes against the ordered rules table for transcript-driven touches and
//! renders the result. Generative phrasing lives in the agent crate and falls
//! back to the draft produced here.

pub mod templates;

use std::sync::Arc;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tera::{Context, Tera};
use thiserror::Error;

use crate::cadence::Track;
use crate::domain::lead::Lead;
use crate::domain::owner::Owner;
use crate::domain::transcript::TranscriptRecord;
use crate::reference::{ApprovedLink, ReferenceLibrary};
use templates::{TouchKind, TouchSpec, NURTURE_TIP_TEMPLATE, STANDARD_TIP_TEMPLATE};

const EXAMPLE_REPORT_URL: &str = "https://www.lightworkhome.com/examplereport";
const SCIENCE_URL: &str = "https://www.lightworkhome.com/blog-posts/the-science-behind-lightwork";

#[derive(Debug, Error)]
pub enum ComposeError {
    #[error("no {track:?} touch {touch} in the cadence table")]
    UnknownTouch { track: Track, touch: u32 },
    #[error("template rendering failed: {0}")]
    Template(#[from] tera::Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DraftOrigin {
    FixedTemplate,
    RulesTable,
    GenericTemplate,
    Generative,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectedTip {
    pub topic: String,
    pub trigger: String,
    pub tip: String,
    pub links: Vec<ApprovedLink>,
}

/// Inputs for one lead's draft.
#[derive(Clone, Copy, Debug)]
pub struct DraftRequest<'a> {
    pub lead: &'a Lead,
    pub owner: &'a Owner,
    pub track: Track,
    pub touch: u32,
    pub transcript: Option<&'a TranscriptRecord>,
    pub call_date: Option<NaiveDate>,
}

/// Template and tip chosen for a request, before rendering.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DraftPlan {
    pub spec: TouchSpec,
    pub template: &'static str,
    pub tip: Option<SelectedTip>,
    pub referral: bool,
}

impl DraftPlan {
    pub fn origin(&self) -> DraftOrigin {
        match (self.spec.kind, &self.tip) {
            (TouchKind::Fixed, _) => DraftOrigin::FixedTemplate,
            (TouchKind::TipDriven, Some(_)) => DraftOrigin::RulesTable,
            (TouchKind::TipDriven, None) => DraftOrigin::GenericTemplate,
        }
    }

    pub fn subject(&self) -> String {
        let prefix = match self.spec.track {
            Track::Standard => "Follow-up",
            Track::Nurture => "Nurture",
            Track::Rebook => "Rebook",
        };
        format!("{prefix} {}: {}", self.spec.touch, self.spec.label)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Draft {
    pub subject: String,
    pub body: String,
    pub origin: DraftOrigin,
    pub template: String,
    pub tip: Option<SelectedTip>,
}

pub struct DraftComposer {
    library: Arc<ReferenceLibrary>,
    templates: Tera,
}

impl DraftComposer {
    pub fn new(library: Arc<ReferenceLibrary>) -> Result<Self, ComposeError> {
        Ok(Self { library, templates: templates::build_templates()? })
    }

    pub fn library(&self) -> &ReferenceLibrary {
        &self.library
    }

    pub fn plan(&self, request: &DraftRequest<'_>) -> Result<DraftPlan, ComposeError> {
        let spec = templates::touch_spec(request.track, request.touch).ok_or(
            ComposeError::UnknownTouch { track: request.track, touch: request.touch },
        )?;
        let referral = self.library.is_referral(request.lead.source.as_deref());

        let tip = match spec.kind {
            TouchKind::Fixed => None,
            TouchKind::TipDriven => request
                .transcript
                .map(TranscriptRecord::call_notes)
                .and_then(|notes| {
                    self.library.select_tip(&notes, referral).map(|(rule, trigger)| SelectedTip {
                        topic: rule.topic.clone(),
                        trigger: trigger.to_string(),
                        tip: rule.tip.clone(),
                        links: rule.links.clone(),
                    })
                }),
        };

        let template = match (&tip, request.track) {
            (Some(_), Track::Nurture) => NURTURE_TIP_TEMPLATE,
            (Some(_), _) => STANDARD_TIP_TEMPLATE,
            (None, _) => spec.template,
        };

        Ok(DraftPlan { spec, template, tip, referral })
    }

    pub fn render(&self, plan: &DraftPlan, request: &DraftRequest<'_>) -> Result<Draft, ComposeError> {
        let mut context = Context::new();
        context.insert("first_name", &request.lead.first_name());
        context.insert("city", &request.lead.city);
        context.insert("call_date", &request.call_date.map(|date| date.format("%B %-d").to_string()));
        context.insert("signature", &request.owner.signature);
        context.insert("booking_link", &request.owner.booking_link);
        context.insert(
            "example_report",
            &ApprovedLink { label: "example report".to_string(), url: EXAMPLE_REPORT_URL.to_string() },
        );
        context.insert(
            "science_video",
            &ApprovedLink { label: "the science behind our testing".to_string(), url: SCIENCE_URL.to_string() },
        );

        if let Some(tip) = &plan.tip {
            let (opener, closer) = templates::tip_framing(plan.spec.touch);
            context.insert("topic", &tip.topic);
            context.insert("tip", &tip.tip);
            context.insert("links", &tip.links);
            context.insert("opener", opener);
            context.insert("closer", closer);
        }

        let body = self.templates.render(plan.template, &context)?;
        Ok(Draft {
            subject: plan.subject(),
            body,
            origin: plan.origin(),
            template: plan.template.to_string(),
            tip: plan.tip.clone(),
        })
    }

    pub fn compose(&self, request: &DraftRequest<'_>) -> Result<Draft, ComposeError> {
        let plan = self.plan(request)?;
        self.render(&plan, request)
    }
}

/// Stable digest of draft inputs, used as the draft cache key.
pub fn input_fingerprint(parts: &[&str]) -> String {
    let mut hasher = blake3::Hasher::new();
    for part in parts {
        hasher.update(&(part.len() as u64).to_le_bytes());
        hasher.update(part.as_bytes());
    }
    hasher.finalize().to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::NaiveDate;

    use super::{input_fingerprint, DraftComposer, DraftOrigin, DraftRequest};
    use crate::cadence::Track;
    use crate::domain::lead::fixtures::lead;
    use crate::domain::lead::Lead;
    use crate::domain::owner::Owner;
    use crate::domain::transcript::{TranscriptRecord, TranscriptSource};
    use crate::reference::ReferenceLibrary;

    fn composer() -> DraftComposer {
        DraftComposer::new(Arc::new(ReferenceLibrary::embedded().expect("library"))).expect("composer")
    }

    fn owner() -> Owner {
        Owner {
            email: Some("sam@lightwork.example".to_string()),
            display_name: "Sam".to_string(),
            signature: "Sam\nLightwork Home Health".to_string(),
            booking_link: Some("https://cal.example/sam".to_string()),
        }
    }

    fn transcript(body: &str) -> TranscriptRecord {
        let mut record = TranscriptRecord::new("t1", TranscriptSource::Spreadsheet, "Intro");
        record.body = body.to_string();
        record
    }

    fn request<'a>(
        lead: &'a Lead,
        owner: &'a Owner,
        track: Track,
        touch: u32,
        transcript: Option<&'a TranscriptRecord>,
    ) -> DraftRequest<'a> {
        DraftRequest {
            lead,
            owner,
            track,
            touch,
            transcript,
            call_date: NaiveDate::from_ymd_opt(2026, 1, 5),
        }
    }

    #[test]
    fn fixed_touch_fills_slots() {
        let lead = lead("l1", "Jane Doe");
        let owner = owner();
        let draft = composer().compose(&request(&lead, &owner, Track::Standard, 1, None)).expect("draft");

        assert_eq!(draft.origin, DraftOrigin::FixedTemplate);
        assert_eq!(draft.subject, "Follow-up 1: Post-call recap");
        assert!(draft.body.starts_with("Hey Jane,"));
        assert!(draft.body.contains("on January 5"));
        assert!(draft.body.contains("for homes in Austin"));
        assert!(draft.body.ends_with("Sam\nLightwork Home Health"));
    }

    #[test]
    fn transcript_touch_uses_only_first_matching_tip() {
        let lead = lead("l1", "Jane Doe");
        let owner = owner();
        let notes = transcript("We talked about the baby monitor placement and the mold in the garage.");
        let draft =
            composer().compose(&request(&lead, &owner, Track::Standard, 2, Some(&notes))).expect("draft");

        assert_eq!(draft.origin, DraftOrigin::RulesTable);
        let tip = draft.tip.expect("tip selected");
        assert_eq!(tip.topic, "baby monitors and EMF");
        assert!(draft.body.contains("baby monitor at least six feet"));
        assert!(!draft.body.contains("hygrometer"));
        assert!(draft.body.contains("the-science-behind-lightwork"));
    }

    #[test]
    fn missing_transcript_falls_back_to_generic_template() {
        let lead = lead("l1", "Jane Doe");
        let owner = owner();
        let draft = composer().compose(&request(&lead, &owner, Track::Standard, 4, None)).expect("draft");

        assert_eq!(draft.origin, DraftOrigin::GenericTemplate);
        assert!(draft.tip.is_none());
        assert!(!draft.body.contains("http"));
    }

    #[test]
    fn transcript_without_trigger_falls_back_to_generic_template() {
        let lead = lead("l1", "Jane Doe");
        let owner = owner();
        let notes = transcript("We discussed pricing and timing only.");
        let draft =
            composer().compose(&request(&lead, &owner, Track::Standard, 5, Some(&notes))).expect("draft");
        assert_eq!(draft.origin, DraftOrigin::GenericTemplate);
    }

    #[test]
    fn fixed_touch_ignores_transcript() {
        let lead = lead("l1", "Jane Doe");
        let owner = owner();
        let notes = transcript("mold everywhere");
        let draft =
            composer().compose(&request(&lead, &owner, Track::Standard, 6, Some(&notes))).expect("draft");
        assert_eq!(draft.origin, DraftOrigin::FixedTemplate);
        assert!(draft.tip.is_none());
    }

    #[test]
    fn rebook_touch_includes_booking_link() {
        let lead = lead("l1", "Jane Doe");
        let owner = owner();
        let draft = composer().compose(&request(&lead, &owner, Track::Rebook, 1, None)).expect("draft");
        assert_eq!(draft.subject, "Rebook 1: Acknowledge and rebook");
        assert!(draft.body.contains("https://cal.example/sam"));
    }

    #[test]
    fn nurture_tip_has_no_ask() {
        let lead = lead("l1", "Jane Doe");
        let owner = owner();
        let notes = transcript("Mostly worried about mold after the leak.");
        let draft =
            composer().compose(&request(&lead, &owner, Track::Nurture, 1, Some(&notes))).expect("draft");
        assert_eq!(draft.template, "nurture_tip");
        assert!(!draft.body.contains("move forward"));
        assert!(!draft.body.contains("cal.example"));
    }

    #[test]
    fn referred_lead_never_gets_referrer_content() {
        let mut lead = lead("l1", "Jane Doe");
        lead.source = Some("Andrew Wilkinson".to_string());
        let owner = owner();
        let notes = transcript("Do you have reviews from other clients?");
        let draft =
            composer().compose(&request(&lead, &owner, Track::Standard, 2, Some(&notes))).expect("draft");
        assert!(draft.tip.is_none());
        assert!(!draft.body.to_lowercase().contains("wilkinson"));
    }

    #[test]
    fn unknown_touch_is_an_error() {
        let lead = lead("l1", "Jane Doe");
        let owner = owner();
        assert!(composer().compose(&request(&lead, &owner, Track::Standard, 8, None)).is_err());
    }

    #[test]
    fn fingerprint_separates_parts() {
        assert_ne!(input_fingerprint(&["ab", "c"]), input_fingerprint(&["a", "bc"]));
        assert_eq!(input_fingerprint(&["x"]), input_fingerprint(&["x"]));
    }
}
