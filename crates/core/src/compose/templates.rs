//! Fixed email templates and the touch table they hang off.

use std::collections::HashMap;

use serde::Serialize;
use tera::Tera;

use crate::cadence::Track;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TouchKind {
    /// Same text for every lead apart from slot filling.
    Fixed,
    /// Driven by the first matching rule in the tip table.
    TipDriven,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct TouchSpec {
    pub track: Track,
    pub touch: u32,
    pub label: &'static str,
    pub kind: TouchKind,
    /// Template used when the touch renders without a tip.
    pub template: &'static str,
}

const STANDARD: &[(&str, TouchKind, &str)] = &[
    ("Post-call recap", TouchKind::Fixed, "standard_recap"),
    ("Personal tip", TouchKind::TipDriven, "standard_generic"),
    ("Key findings", TouchKind::Fixed, "standard_findings"),
    ("Reviews and a tip", TouchKind::TipDriven, "standard_generic"),
    ("Clinical credibility", TouchKind::TipDriven, "standard_generic"),
    ("Graceful close", TouchKind::Fixed, "standard_close"),
    ("Five-week check-in", TouchKind::Fixed, "standard_checkin"),
];

const NURTURE: &[(&str, TouchKind, &str)] = &[
    ("Nurture check-in", TouchKind::TipDriven, "nurture_generic"),
    ("Nurture check-in", TouchKind::TipDriven, "nurture_generic"),
    ("Nurture check-in", TouchKind::TipDriven, "nurture_generic"),
    ("Nurture check-in", TouchKind::TipDriven, "nurture_generic"),
    ("Nurture check-in", TouchKind::TipDriven, "nurture_generic"),
    ("Nurture final", TouchKind::TipDriven, "nurture_generic"),
];

const REBOOK: &[(&str, TouchKind, &str)] = &[
    ("Acknowledge and rebook", TouchKind::Fixed, "rebook_acknowledge"),
    ("Presentation deck", TouchKind::Fixed, "rebook_deck"),
    ("Science write-up", TouchKind::Fixed, "rebook_science"),
    ("Example report", TouchKind::Fixed, "rebook_report"),
    ("Graceful close", TouchKind::Fixed, "rebook_close"),
];

pub const STANDARD_TIP_TEMPLATE: &str = "standard_tip";
pub const NURTURE_TIP_TEMPLATE: &str = "nurture_tip";

pub fn touch_spec(track: Track, touch: u32) -> Option<TouchSpec> {
    let table = match track {
        Track::Standard => STANDARD,
        Track::Nurture => NURTURE,
        Track::Rebook => REBOOK,
    };
    let index = usize::try_from(touch).ok()?.checked_sub(1)?;
    table.get(index).map(|(label, kind, template)| TouchSpec {
        track,
        touch,
        label,
        kind: *kind,
        template,
    })
}

/// Opening and closing lines for the transcript-driven standard touches.
pub fn tip_framing(touch: u32) -> (&'static str, &'static str) {
    match touch {
        2 => (
            "Hope you're doing well. One thing from our call stuck with me.",
            "Let me know if you'd like to move forward, or if any questions come up.",
        ),
        4 => (
            "Wanted to pass along one more idea from our conversation.",
            "Happy to answer anything before you decide.",
        ),
        _ => (
            "Hope the week is treating you well.",
            "We're here whenever you have questions.",
        ),
    }
}

const TEMPLATES: &[(&str, &str)] = &[
    (
        "standard_recap",
        "Hey {{ first_name }},\n\n\
Thanks for taking the time to talk{% if call_date %} on {{ call_date }}{% endif %}. \
As promised, here's an {{ example_report | anchor }} (password: homehealth) so you can see exactly what we deliver\
{% if city %} for homes in {{ city }}{% endif %}.\n\n\
Let me know if you'd like to move forward, and feel free to send over any questions.\n\n\
{{ signature }}",
    ),
    (
        "standard_findings",
        "Hey {{ first_name }},\n\n\
Hope things are going well. We find issues in every home we test, however new or well kept it is. \
A few recent examples:\n\n\
- Hidden mold behind a wall that two earlier inspections had cleared.\n\
- Elevated trihalomethanes in shower water, which vaporize in hot showers.\n\
- High ultrafine particulate levels in a newly furnished living room.\n\
- Strong electric fields across every bedroom, including the kids' rooms.\n\n\
Each came with a clear, practical fix. Shall we set up a time to go over any questions?\n\n\
{{ signature }}",
    ),
    (
        "standard_close",
        "Hey {{ first_name }},\n\n\
Wanted to leave the door open. We're here whenever you're ready.\n\n\
{{ signature }}",
    ),
    (
        "standard_checkin",
        "Hey {{ first_name }},\n\n\
How's it been going with home health? Let me know if you have any questions.\n\n\
{{ signature }}",
    ),
    (
        "standard_tip",
        "Hey {{ first_name }},\n\n\
{{ opener }}\n\n\
Since {{ topic }} came up, one thing worth noting: {{ tip }}\
{% for link in links %} Here's {{ link | anchor }}.{% endfor %}\n\n\
{{ closer }}\n\n\
{{ signature }}",
    ),
    (
        "standard_generic",
        "Hey {{ first_name }},\n\n\
Hope things are going well{% if city %} in {{ city }}{% endif %}. \
Happy to answer any questions about next steps whenever it suits you.\n\n\
{{ signature }}",
    ),
    (
        "nurture_tip",
        "Hey {{ first_name }},\n\n\
Came across something that made me think of our conversation about {{ topic }}. {{ tip }}\
{% for link in links %} Here's {{ link | anchor }}.{% endfor %}\n\n\
{{ signature }}",
    ),
    (
        "nurture_generic",
        "Hey {{ first_name }},\n\n\
Hope the year is treating you well{% if city %} in {{ city }}{% endif %}. \
Nothing needed on your end. We're still around if home health questions ever come up.\n\n\
{{ signature }}",
    ),
    (
        "rebook_acknowledge",
        "Hey {{ first_name }},\n\n\
Looks like we missed each other for our call. Totally understand, things come up. \
{% if booking_link %}Here's my calendar if you'd like to find a new time: {{ booking_link }}\
{% else %}Just reply here and we'll find a new time.{% endif %}\n\n\
{{ signature }}",
    ),
    (
        "rebook_deck",
        "Hey {{ first_name }},\n\n\
Sending over our presentation deck in case it's helpful. \
It covers what we test, how the process works and what clients typically find.\n\n\
{% if booking_link %}Here's my link if you'd like to rebook a call: {{ booking_link }}\
{% else %}Happy to rebook a call whenever suits you.{% endif %}\n\n\
{{ signature }}",
    ),
    (
        "rebook_science",
        "Hey {{ first_name }},\n\n\
Here's a short piece on {{ science_video | anchor }} and why it matters for health at home.\n\n\
{% if booking_link %}Let me know if you'd like to rebook a call: {{ booking_link }}\
{% else %}Let me know if you'd like to rebook a call.{% endif %}\n\n\
{{ signature }}",
    ),
    (
        "rebook_report",
        "Hey {{ first_name }},\n\n\
Here's an {{ example_report | anchor }} (password: homehealth) so you can see exactly what we deliver.\n\n\
{% if booking_link %}Happy to jump on a call whenever works for you: {{ booking_link }}\
{% else %}Happy to jump on a call whenever works for you.{% endif %}\n\n\
{{ signature }}",
    ),
    (
        "rebook_close",
        "Hey {{ first_name }},\n\n\
Wanted to leave the door open. We're here whenever you're ready.\n\n\
{{ signature }}",
    ),
];

/// Tera instance with every draft template and the `anchor` filter registered.
pub fn build_templates() -> tera::Result<Tera> {
    let mut tera = Tera::default();
    tera.register_filter("anchor", anchor_filter);
    tera.add_raw_templates(TEMPLATES.iter().copied())?;
    Ok(tera)
}

/// Renders `{label, url}` as an HTML anchor.
fn anchor_filter(value: &tera::Value, _args: &HashMap<String, tera::Value>) -> tera::Result<tera::Value> {
    let url = value
        .get("url")
        .and_then(tera::Value::as_str)
        .ok_or_else(|| tera::Error::msg("anchor filter expects an object with a `url`"))?;
    let label = value.get("label").and_then(tera::Value::as_str).unwrap_or(url);
    Ok(tera::Value::String(format!("<a href=\"{url}\">{label}</a>")))
}
