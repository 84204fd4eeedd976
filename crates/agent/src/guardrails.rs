//! Draft lint rules applied to generated text before it reaches a human.

use std::collections::HashSet;
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

use touchpoint_core::cadence::Track;
use touchpoint_core::domain::followup::SentEmail;
use touchpoint_core::reference::ReferenceLibrary;

pub const FORBIDDEN_PHRASES: &[&str] = &[
    "just checking in",
    "circling back",
    "touching base",
    "reaching out to",
    "hope this finds you well",
    "per my last email",
];

pub const FORBIDDEN_TONE_MARKERS: &[&str] = &["as an ai", "i can't", "i cannot", "i don't have access"];

pub const MAX_EXCLAMATIONS: usize = 1;
/// Calls older than this may not be called "today" or "yesterday".
pub const RECENT_CALL_DAYS: i64 = 2;

const EM_DASH: char = '\u{2014}';

static URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"https?://[^\s<>()"']+"#).expect("url pattern is valid"));
static HREF: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"href="(https?://[^"]+)""#).expect("href pattern is valid"));
static SENTENCE_BREAK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[.!?]+(?:\s+|$)").expect("sentence pattern is valid"));
static WORD: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b\w+\b").expect("word pattern is valid"));

/// (sentences, words) allowed for a touch.
pub fn length_caps(track: Track, touch: u32) -> (usize, usize) {
    match track {
        Track::Rebook => {
            let sentences = match touch {
                1 => 4,
                2..=4 => 5,
                5 => 2,
                _ => 4,
            };
            let words = if touch == 5 { 30 } else { 80 };
            (sentences, words)
        }
        Track::Standard | Track::Nurture => match touch {
            1 => (8, 170),
            2 => (6, 120),
            3 => (15, 300),
            4 => (20, 400),
            5 => (6, 130),
            6 => (3, 60),
            7 => (3, 40),
            _ => (6, 150),
        },
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LintIssue {
    ForbiddenPhrase(&'static str),
    ToneMarker(&'static str),
    StaleDayReference,
    DisallowedLinks(Vec<String>),
    TooManySentences { count: usize, max: usize },
    TooManyWords { count: usize, max: usize },
    TooManyExclamations,
    EmDash,
    RepeatedLink(String),
    RepeatedResource(String),
}

impl LintIssue {
    /// Blocking issues force the fallback template if they survive rewrites.
    pub fn is_blocking(&self) -> bool {
        matches!(self, Self::DisallowedLinks(_))
    }
}

impl fmt::Display for LintIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ForbiddenPhrase(phrase) => write!(f, "Forbidden phrase: \"{phrase}\""),
            Self::ToneMarker(marker) => write!(f, "Forbidden tone marker: \"{marker}\""),
            Self::StaleDayReference => write!(f, "Avoid \"today/yesterday\" when the call was not recent"),
            Self::DisallowedLinks(links) => write!(f, "Disallowed link(s): {}", links.join(", ")),
            Self::TooManySentences { count, max } => write!(f, "Too many sentences ({count} > {max})"),
            Self::TooManyWords { count, max } => write!(f, "Too long ({count} words > {max})"),
            Self::TooManyExclamations => write!(f, "Too many exclamation points (> {MAX_EXCLAMATIONS})"),
            Self::EmDash => write!(f, "Contains em dash(es). Replace with commas, periods, or semicolons."),
            Self::RepeatedLink(url) => write!(f, "Duplicate resource already sent in a prior email: {url}"),
            Self::RepeatedResource(label) => write!(
                f,
                "Duplicate resource: \"{label}\" was already shared in a prior email. Use a different resource."
            ),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GuardrailDecision {
    Allow,
    /// Style issues. A rewrite is requested; if they persist the draft is kept.
    Degrade { reason_code: &'static str, issues: Vec<LintIssue> },
    /// The draft must not be used as is.
    Deny { reason_code: &'static str, issues: Vec<LintIssue>, fallback_path: &'static str },
}

impl GuardrailDecision {
    pub fn issues(&self) -> &[LintIssue] {
        match self {
            Self::Allow => &[],
            Self::Degrade { issues, .. } | Self::Deny { issues, .. } => issues,
        }
    }
}

/// Per-draft facts the lint rules depend on.
#[derive(Clone, Copy, Debug)]
pub struct LintContext<'a> {
    pub track: Track,
    pub touch: u32,
    pub days_since_call: Option<i64>,
    pub prior_emails: &'a [SentEmail],
    /// URLs this draft may carry: the selected tip's links and those already
    /// in the rendered template. Anything else is blocking.
    pub approved_links: &'a [String],
}

pub struct DraftLinter<'a> {
    library: &'a ReferenceLibrary,
}

impl<'a> DraftLinter<'a> {
    pub fn new(library: &'a ReferenceLibrary) -> Self {
        Self { library }
    }

    pub fn lint(&self, draft: &str, context: &LintContext<'_>) -> Vec<LintIssue> {
        let draft = draft.trim();
        let lowered = draft.to_lowercase();
        let mut issues = Vec::new();

        for phrase in FORBIDDEN_PHRASES.iter().filter(|phrase| lowered.contains(*phrase)) {
            issues.push(LintIssue::ForbiddenPhrase(phrase));
        }
        for marker in FORBIDDEN_TONE_MARKERS.iter().filter(|marker| lowered.contains(*marker)) {
            issues.push(LintIssue::ToneMarker(marker));
        }

        let stale = context.days_since_call.is_some_and(|days| days > RECENT_CALL_DAYS);
        if stale && (lowered.contains("today") || lowered.contains("yesterday")) {
            issues.push(LintIssue::StaleDayReference);
        }

        let urls = extract_urls(draft);
        let approved: HashSet<String> = context.approved_links.iter().map(|url| normalize_url(url)).collect();
        let disallowed: Vec<String> = urls
            .iter()
            .filter(|url| !self.library.is_allowed_link(url) || !approved.contains(&normalize_url(url)))
            .take(5)
            .cloned()
            .collect();
        if !disallowed.is_empty() {
            issues.push(LintIssue::DisallowedLinks(disallowed));
        }

        let (max_sentences, max_words) = length_caps(context.track, context.touch);
        let sentences = sentence_count(draft);
        if sentences > max_sentences {
            issues.push(LintIssue::TooManySentences { count: sentences, max: max_sentences });
        }
        let words = word_count(draft);
        if words > max_words {
            issues.push(LintIssue::TooManyWords { count: words, max: max_words });
        }

        if draft.matches('!').count() > MAX_EXCLAMATIONS {
            issues.push(LintIssue::TooManyExclamations);
        }
        if draft.contains(EM_DASH) {
            issues.push(LintIssue::EmDash);
        }

        if !context.prior_emails.is_empty() {
            issues.extend(self.repeated_resources(&lowered, &urls, context.prior_emails));
        }
        issues
    }

    pub fn evaluate(&self, draft: &str, context: &LintContext<'_>) -> GuardrailDecision {
        let issues = self.lint(draft, context);
        if issues.is_empty() {
            GuardrailDecision::Allow
        } else if issues.iter().any(LintIssue::is_blocking) {
            GuardrailDecision::Deny {
                reason_code: "link_outside_allowlist",
                issues,
                fallback_path: "fixed_template",
            }
        } else {
            GuardrailDecision::Degrade { reason_code: "style_rules", issues }
        }
    }

    fn repeated_resources(&self, lowered: &str, urls: &[String], prior: &[SentEmail]) -> Vec<LintIssue> {
        let prior_text = prior.iter().map(|email| email.body.to_lowercase()).collect::<Vec<_>>().join(" ");
        let prior_urls: HashSet<String> =
            prior.iter().flat_map(|email| extract_urls(&email.body)).map(|url| normalize_url(&url)).collect();

        let mut issues: Vec<LintIssue> = urls
            .iter()
            .filter(|url| prior_urls.contains(&normalize_url(url)))
            .map(|url| LintIssue::RepeatedLink(url.clone()))
            .collect();
        issues.extend(
            self.library
                .resources()
                .iter()
                .filter(|resource| lowered.contains(&resource.keyword) && prior_text.contains(&resource.keyword))
                .map(|resource| LintIssue::RepeatedResource(resource.label.clone())),
        );
        issues
    }
}

/// Bare URLs and anchor targets, de-duplicated in order of appearance.
pub fn extract_urls(text: &str) -> Vec<String> {
    let bare = URL.find_iter(text).map(|m| m.as_str());
    let anchors = HREF.captures_iter(text).filter_map(|c| c.get(1)).map(|m| m.as_str());

    let mut seen = HashSet::new();
    bare.chain(anchors)
        .map(str::trim)
        .filter(|url| !url.is_empty() && seen.insert(url.to_string()))
        .map(str::to_string)
        .collect()
}

fn normalize_url(url: &str) -> String {
    url.to_lowercase().trim_end_matches('/').to_string()
}

pub fn sentence_count(text: &str) -> usize {
    SENTENCE_BREAK.split(text.trim()).filter(|part| !part.trim().is_empty()).count()
}

pub fn word_count(text: &str) -> usize {
    WORD.find_iter(text).count()
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use touchpoint_core::cadence::Track;
    use touchpoint_core::domain::followup::SentEmail;
    use touchpoint_core::reference::ReferenceLibrary;

    use super::{
        extract_urls, length_caps, sentence_count, word_count, DraftLinter, GuardrailDecision, LintContext,
        LintIssue,
    };

    fn library() -> ReferenceLibrary {
        ReferenceLibrary::embedded().expect("embedded library")
    }

    const NO_LINKS: &[String] = &[];

    fn context(prior: &[SentEmail]) -> LintContext<'_> {
        LintContext {
            track: Track::Standard,
            touch: 2,
            days_since_call: Some(5),
            prior_emails: prior,
            approved_links: NO_LINKS,
        }
    }

    #[test]
    fn clean_short_draft_is_allowed() {
        let library = library();
        let linter = DraftLinter::new(&library);
        let draft = "Hey Jane,\n\nOne idea from our call: keep humidity near 45 percent.\n\nBest,\nSam";

        assert_eq!(linter.evaluate(draft, &context(&[])), GuardrailDecision::Allow);
    }

    #[test]
    fn unknown_link_denies_the_draft() {
        let library = library();
        let linter = DraftLinter::new(&library);
        let draft = "Hey Jane, take a look at <a href=\"https://example.com/guide\">this guide</a>.";

        let decision = linter.evaluate(draft, &context(&[]));
        assert!(matches!(decision, GuardrailDecision::Deny { fallback_path: "fixed_template", .. }));
        assert_eq!(decision.issues(), &[LintIssue::DisallowedLinks(vec!["https://example.com/guide".to_string()])]);
    }

    #[test]
    fn allowlisted_links_outside_the_selected_tip_are_denied() {
        let library = library();
        let linter = DraftLinter::new(&library);
        let approved = vec!["https://www.lightworkhome.com/examplereport".to_string()];
        let with_tip = LintContext { approved_links: &approved, ..context(&[]) };

        let own = "Hey Jane, here's the https://www.lightworkhome.com/examplereport/ we mentioned.";
        assert_eq!(linter.evaluate(own, &with_tip), GuardrailDecision::Allow);

        let other = "Hey Jane, see https://www.lightworkhome.com/blog-posts/wilkinson for a story.";
        let decision = linter.evaluate(other, &with_tip);
        assert!(matches!(decision, GuardrailDecision::Deny { .. }));
        assert_eq!(
            decision.issues(),
            &[LintIssue::DisallowedLinks(vec!["https://www.lightworkhome.com/blog-posts/wilkinson".to_string()])]
        );
    }

    #[test]
    fn style_problems_degrade_with_readable_messages() {
        let library = library();
        let linter = DraftLinter::new(&library);
        let draft = "Just checking in \u{2014} great chatting today! Talk soon!";

        let decision = linter.evaluate(draft, &context(&[]));
        let messages: Vec<String> = decision.issues().iter().map(ToString::to_string).collect();
        assert!(matches!(decision, GuardrailDecision::Degrade { .. }));
        assert!(messages.contains(&"Forbidden phrase: \"just checking in\"".to_string()));
        assert!(messages.iter().any(|message| message.contains("today/yesterday")));
        assert!(messages.iter().any(|message| message.contains("exclamation")));
        assert!(messages.iter().any(|message| message.contains("em dash")));
    }

    #[test]
    fn recent_call_may_say_today() {
        let library = library();
        let linter = DraftLinter::new(&library);
        let recent = LintContext { days_since_call: Some(1), ..context(&[]) };

        assert!(linter.lint("Great talking today.", &recent).is_empty());
    }

    #[test]
    fn resources_sent_before_are_flagged() {
        let library = library();
        let linter = DraftLinter::new(&library);
        let prior = vec![SentEmail {
            subject: "Your example report".to_string(),
            body: "Here it is: https://www.lightworkhome.com/examplereport/".to_string(),
            sent_at: Utc.with_ymd_and_hms(2026, 3, 3, 10, 0, 0).single().expect("sent"),
        }];
        let draft = "Here's the https://www.lightworkhome.com/examplereport again.";

        let issues = linter.lint(draft, &context(&prior));
        assert!(issues.contains(&LintIssue::RepeatedLink("https://www.lightworkhome.com/examplereport".to_string())));
        assert!(issues.contains(&LintIssue::RepeatedResource("example report".to_string())));
    }

    #[test]
    fn counting_helpers_follow_punctuation_and_word_boundaries() {
        assert_eq!(sentence_count("One. Two! Three?"), 3);
        assert_eq!(sentence_count("No terminal punctuation"), 1);
        assert_eq!(sentence_count("   "), 0);
        assert_eq!(word_count("It's a two-part test."), 6);
        assert_eq!(
            extract_urls("See https://a.test/x and <a href=\"https://a.test/x\">x</a>"),
            vec!["https://a.test/x".to_string()]
        );
    }

    #[test]
    fn rebook_touches_are_held_to_tighter_caps() {
        assert_eq!(length_caps(Track::Rebook, 5), (2, 30));
        assert_eq!(length_caps(Track::Rebook, 1), (4, 80));
        assert_eq!(length_caps(Track::Standard, 7), (3, 40));
        assert_eq!(length_caps(Track::Nurture, 9), (6, 150));
    }
}
