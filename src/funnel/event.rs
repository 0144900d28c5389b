//! Inbound events — the three things a transport can hand the funnel.

use crate::store::NewSubject;

/// One discrete inbound event, carrying the subject's identity and display
/// attributes plus transport metadata (e.g. the menu message id to edit).
#[derive(Debug, Clone)]
pub struct InboundEvent {
    pub subject: NewSubject,
    pub payload: EventPayload,
    pub metadata: serde_json::Value,
}

impl InboundEvent {
    pub fn new(subject: NewSubject, payload: EventPayload) -> Self {
        Self {
            subject,
            payload,
            metadata: serde_json::json!({}),
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Transport-native id of the menu message this event came from, if any.
    pub fn menu_message_id(&self) -> Option<&str> {
        self.metadata.get("menu_message_id").and_then(|v| v.as_str())
    }
}

/// The kinds of inbound event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventPayload {
    /// First contact or explicit return-to-start.
    FirstContact,
    /// A menu button press carrying a selection id.
    Selection { id: String },
    /// An unstructured text message.
    FreeText { text: String },
}

/// Known menu-selection ids. Back buttons reuse the id of the screen they
/// return to, so one id can mean "forward" or "back" depending on the
/// current step — the transition table disambiguates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SelectionId {
    ShowBenefits,
    HasBroker,
    MakePayment,
    CompletedRegistration,
    BackToStart,
}

impl SelectionId {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ShowBenefits => "show_benefits",
            Self::HasBroker => "has_broker",
            Self::MakePayment => "make_payment",
            Self::CompletedRegistration => "completed_registration",
            Self::BackToStart => "back_to_start",
        }
    }
}

impl std::fmt::Display for SelectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SelectionId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "show_benefits" => Ok(Self::ShowBenefits),
            "has_broker" => Ok(Self::HasBroker),
            "make_payment" => Ok(Self::MakePayment),
            "completed_registration" => Ok(Self::CompletedRegistration),
            "back_to_start" => Ok(Self::BackToStart),
            other => Err(format!("unknown selection id '{other}'")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selection_ids_roundtrip() {
        for id in [
            SelectionId::ShowBenefits,
            SelectionId::HasBroker,
            SelectionId::MakePayment,
            SelectionId::CompletedRegistration,
            SelectionId::BackToStart,
        ] {
            assert_eq!(id.as_str().parse::<SelectionId>().unwrap(), id);
        }
        assert!("buy_now".parse::<SelectionId>().is_err());
    }

    #[test]
    fn menu_message_id_from_metadata() {
        let subject = NewSubject {
            subject_id: "u1".into(),
            ..Default::default()
        };
        let event = InboundEvent::new(
            subject,
            EventPayload::Selection {
                id: "show_benefits".into(),
            },
        )
        .with_metadata(serde_json::json!({ "menu_message_id": "77" }));

        assert_eq!(event.menu_message_id(), Some("77"));
    }
}
