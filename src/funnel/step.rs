//! Funnel step — the subject's position in the scripted conversation.

use serde::{Deserialize, Serialize};

/// The screens of the funnel.
///
/// Forward path: Start → ViewedBenefits → {SelectedHasBroker →
/// AwaitingPayment | AwaitingRegistrationData → Done}. `Done` is absorbing;
/// `AwaitingPayment` is a terminal display state (payment happens
/// off-platform).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FunnelStep {
    Start,
    ViewedBenefits,
    SelectedHasBroker,
    AwaitingPayment,
    AwaitingRegistrationData,
    Done,
}

impl FunnelStep {
    /// Whether the funnel is finished for this subject.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done)
    }

    /// Database string for this step. Matches the serde representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::ViewedBenefits => "viewed_benefits",
            Self::SelectedHasBroker => "selected_has_broker",
            Self::AwaitingPayment => "awaiting_payment",
            Self::AwaitingRegistrationData => "awaiting_registration_data",
            Self::Done => "done",
        }
    }
}

impl Default for FunnelStep {
    fn default() -> Self {
        Self::Start
    }
}

impl std::fmt::Display for FunnelStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for FunnelStep {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start" => Ok(Self::Start),
            "viewed_benefits" => Ok(Self::ViewedBenefits),
            "selected_has_broker" => Ok(Self::SelectedHasBroker),
            "awaiting_payment" => Ok(Self::AwaitingPayment),
            "awaiting_registration_data" => Ok(Self::AwaitingRegistrationData),
            "done" => Ok(Self::Done),
            other => Err(format!("unknown funnel step '{other}'")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [FunnelStep; 6] = [
        FunnelStep::Start,
        FunnelStep::ViewedBenefits,
        FunnelStep::SelectedHasBroker,
        FunnelStep::AwaitingPayment,
        FunnelStep::AwaitingRegistrationData,
        FunnelStep::Done,
    ];

    #[test]
    fn only_done_is_terminal() {
        for step in ALL {
            assert_eq!(step.is_terminal(), step == FunnelStep::Done);
        }
    }

    #[test]
    fn display_matches_serde() {
        for step in ALL {
            let json = serde_json::to_string(&step).unwrap();
            assert_eq!(json, format!("\"{step}\""));
        }
    }

    #[test]
    fn str_roundtrip() {
        for step in ALL {
            assert_eq!(step.as_str().parse::<FunnelStep>().unwrap(), step);
        }
        assert!("checkout".parse::<FunnelStep>().is_err());
    }
}
