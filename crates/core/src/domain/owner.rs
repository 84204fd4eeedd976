use serde::{Deserialize, Serialize};

pub const UNASSIGNED_OWNER: &str = "Unassigned";

/// Team member responsible for a lead's follow-ups.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Owner {
    pub email: Option<String>,
    pub display_name: String,
    pub signature: String,
    pub booking_link: Option<String>,
}

impl Owner {
    pub fn unassigned() -> Self {
        Self {
            email: None,
            display_name: UNASSIGNED_OWNER.to_string(),
            signature: "Best,\nThe team".to_string(),
            booking_link: None,
        }
    }

    pub fn is_assigned(&self) -> bool {
        self.email.is_some()
    }
}

/// First team email among the attendees of a lead's meetings, in meeting order.
pub fn owner_email<'a, I>(attendees: I, team_emails: &[String]) -> Option<String>
where
    I: IntoIterator<Item = &'a String>,
{
    attendees.into_iter().find_map(|attendee| {
        team_emails.iter().find(|team| team.eq_ignore_ascii_case(attendee.trim())).cloned()
    })
}

#[cfg(test)]
mod tests {
    use super::owner_email;

    #[test]
    fn owner_is_first_team_attendee() {
        let team = vec!["sam@lightwork.example".to_string(), "ana@lightwork.example".to_string()];
        let attendees = vec![
            "lead@example.com".to_string(),
            "Ana@Lightwork.example".to_string(),
            "sam@lightwork.example".to_string(),
        ];
        assert_eq!(owner_email(&attendees, &team).as_deref(), Some("ana@lightwork.example"));
        assert_eq!(owner_email(&attendees[..1], &team), None);
    }
}
