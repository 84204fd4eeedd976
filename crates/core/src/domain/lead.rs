use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LeadId(pub String);

impl std::fmt::Display for LeadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Self-reported qualification bands captured by the intake form.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Qualification {
    pub budget: Option<String>,
    pub health_spend: Option<String>,
    pub home_size: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpportunityStatus {
    Open,
    Won,
    Lost,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Opportunity {
    pub label: String,
    pub status: OpportunityStatus,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lead {
    pub id: LeadId,
    pub name: String,
    pub email: Option<String>,
    pub city: Option<String>,
    pub qualification: Qualification,
    pub source: Option<String>,
    pub reason: Option<String>,
    pub status_label: Option<String>,
    pub categories: Vec<String>,
    pub opportunities: Vec<Opportunity>,
    pub url: Option<String>,
}

const HONORIFICS: &[&str] = &["the", "mr", "mrs", "ms", "dr", "mr.", "mrs.", "ms.", "dr."];

impl Lead {
    /// Greeting name derived from the CRM display name.
    ///
    /// "John & Sarah Smith" greets John; "The Smiths" is kept whole because
    /// there is no usable first name.
    pub fn first_name(&self) -> String {
        let name = self.name.trim();
        if name.is_empty() {
            return String::new();
        }

        let lowered = name.to_ascii_lowercase();
        let split_at = [lowered.find('&'), lowered.find(" and ")].into_iter().flatten().min();
        let first_part = match split_at {
            Some(index) => name[..index].trim(),
            None => name,
        };

        match first_part.split_whitespace().next() {
            Some(word) if !HONORIFICS.contains(&word.to_lowercase().as_str()) => word.to_string(),
            _ => name.to_string(),
        }
    }

    /// Collapsed opportunity status. A won opportunity dominates, then lost.
    pub fn opportunity_status(&self) -> Option<OpportunityStatus> {
        let statuses = self.opportunities.iter().map(|opportunity| opportunity.status);
        let mut collapsed = None;
        for status in statuses {
            collapsed = match (collapsed, status) {
                (_, OpportunityStatus::Won) | (Some(OpportunityStatus::Won), _) => {
                    Some(OpportunityStatus::Won)
                }
                (_, OpportunityStatus::Lost) | (Some(OpportunityStatus::Lost), _) => {
                    Some(OpportunityStatus::Lost)
                }
                _ => Some(OpportunityStatus::Open),
            };
        }
        collapsed
    }

    pub fn in_category(&self, category: &str) -> bool {
        self.categories.iter().any(|candidate| candidate.eq_ignore_ascii_case(category))
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::{Lead, LeadId, Qualification};

    pub fn lead(id: &str, name: &str) -> Lead {
        Lead {
            id: LeadId(id.to_string()),
            name: name.to_string(),
            email: Some(format!("{id}@example.com")),
            city: Some("Austin".to_string()),
            qualification: Qualification::default(),
            source: None,
            reason: None,
            status_label: Some("Potential".to_string()),
            categories: vec!["Customer Lead".to_string()],
            opportunities: Vec::new(),
            url: None,
        }
    }
}
