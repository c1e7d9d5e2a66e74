//! Entity references shared across crates

use serde::{Deserialize, Serialize};

/// Entities that own a chat thread with attachments
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Ticket,
    InspectionReport,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ticket => "ticket",
            Self::InspectionReport => "inspection_report",
        }
    }

    /// REST collection holding entities of this kind
    pub fn path_segment(&self) -> &'static str {
        match self {
            Self::Ticket => "tickets",
            Self::InspectionReport => "inspection-reports",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "ticket" => Some(Self::Ticket),
            "inspection_report" => Some(Self::InspectionReport),
            _ => None,
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Points at one ticket or inspection report
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    pub kind: EntityKind,
    pub id: String,
}

impl EntityRef {
    pub fn new(kind: EntityKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }

    pub fn ticket(id: impl Into<String>) -> Self {
        Self::new(EntityKind::Ticket, id)
    }

    pub fn inspection_report(id: impl Into<String>) -> Self {
        Self::new(EntityKind::InspectionReport, id)
    }

    /// Resource path relative to the API base, e.g. `tickets/42`
    pub fn path(&self) -> String {
        format!("{}/{}", self.kind.path_segment(), self.id)
    }

    /// Path of the message collection under this entity
    pub fn messages_path(&self) -> String {
        format!("{}/messages", self.path())
    }
}

impl std::fmt::Display for EntityRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.kind, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_paths() {
        let ticket = EntityRef::ticket("42");
        assert_eq!(ticket.path(), "tickets/42");
        assert_eq!(ticket.messages_path(), "tickets/42/messages");

        let report = EntityRef::inspection_report("9");
        assert_eq!(report.path(), "inspection-reports/9");
        assert_eq!(report.to_string(), "inspection_report#9");
    }

    #[test]
    fn test_entity_kind_conversion() {
        assert_eq!(EntityKind::Ticket.as_str(), "ticket");
        assert_eq!(
            EntityKind::from_str("inspection_report"),
            Some(EntityKind::InspectionReport)
        );
        assert_eq!(EntityKind::from_str("warranty"), None);
    }
}
