//! Static funnel content — screen copy, inline keyboards, reminder texts.
//!
//! Everything here is presentation; the structure (which screen follows
//! which) lives in the transition table, not in this file.

use crate::channels::{Button, OutgoingMessage};
use crate::funnel::event::SelectionId;
use crate::store::ReminderKind;

/// Contact handle shown to users who want to talk to the manager directly.
const MANAGER_HANDLE: &str = "@vip_manager";
const MANAGER_URL: &str = "https://t.me/vip_manager";

/// Which screen to render after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScreenId {
    Welcome,
    Benefits,
    BrokerPlans,
    PaymentInstructions,
    RegistrationRequest,
}

/// Render a screen for a subject.
pub fn screen(id: ScreenId, display_name: &str) -> OutgoingMessage {
    match id {
        ScreenId::Welcome => welcome(display_name),
        ScreenId::Benefits => benefits(),
        ScreenId::BrokerPlans => broker_plans(),
        ScreenId::PaymentInstructions => payment_instructions(),
        ScreenId::RegistrationRequest => registration_request(),
    }
}

fn welcome(display_name: &str) -> OutgoingMessage {
    OutgoingMessage::new(format!(
        "👋 Hi {display_name}!\n\n\
         Welcome to our private trading community.\n\n\
         I'll help you get access to VIP signals and premium training."
    ))
    .with_keyboard(vec![vec![Button::select(
        "🚀 See VIP benefits",
        SelectionId::ShowBenefits.as_str(),
    )]])
}

fn benefits() -> OutgoingMessage {
    OutgoingMessage::new(
        "🎯 *VIP benefits:*\n\n\
         ⭐ *Trade copying*: 3-7 winning signals every day\n\n\
         ⭐ *Methods*: our trading playbook, applied to your account\n\n\
         ⭐ *1:1 support*: personal guidance whenever you need it\n\n\
         💎 *Register a trading account to join VIP right now*\n\n\
         💰 *Fund the account with a minimum of $400*",
    )
    .with_keyboard(vec![
        vec![Button::select(
            "1️⃣ I already have a broker",
            SelectionId::HasBroker.as_str(),
        )],
        vec![Button::select(
            "2️⃣ I completed registration ✅",
            SelectionId::CompletedRegistration.as_str(),
        )],
        vec![Button::select("⬅️ Back", SelectionId::BackToStart.as_str())],
    ])
}

fn broker_plans() -> OutgoingMessage {
    OutgoingMessage::new(
        "📈 *VIP group* 🥇 3-7 signals per day\n\n\
         💵 *Pricing:*\n\n\
         1 month / $150\n\n\
         3 months / $300\n\n\
         1 year / $500\n\n\
         🎉🎁 Lifetime plan $1000",
    )
    .with_keyboard(vec![
        vec![Button::select(
            "💳 I want to pay ✅",
            SelectionId::MakePayment.as_str(),
        )],
        vec![Button::select(
            "⬅️ Back to benefits",
            SelectionId::ShowBenefits.as_str(),
        )],
    ])
}

fn payment_instructions() -> OutgoingMessage {
    OutgoingMessage::new(format!(
        "💳 *To arrange payment:*\n\n\
         Message me directly:\n👉 {MANAGER_HANDLE}\n\n\
         *Include in your message:*\n\
         - the plan you chose (1 month, 3 months, 1 year or lifetime)\n\n\
         I'll reply within 5-10 minutes with payment details and instructions!"
    ))
    .with_keyboard(vec![
        vec![Button::url("📞 Message the manager", MANAGER_URL)],
        vec![Button::select(
            "⬅️ Back to plans",
            SelectionId::HasBroker.as_str(),
        )],
    ])
}

fn registration_request() -> OutgoingMessage {
    OutgoingMessage::new(
        "After registering, send me the following in one message:\n\n\
         ✅ Full name\n\
         ✅ Account number\n\
         ✅ Deposit size",
    )
    .with_keyboard(vec![vec![Button::select(
        "⬅️ Back to benefits",
        SelectionId::ShowBenefits.as_str(),
    )]])
}

/// The second, separate message sent when a subject reports a completed
/// registration — distinct from the menu edit.
pub fn reservation_notice(display_name: &str) -> OutgoingMessage {
    OutgoingMessage::new(format!(
        "Hi {display_name}, just letting you know I'm holding a free spot for you \
         for the next 24 hours!"
    ))
}

/// Reply after the registration payload has been recorded.
pub fn registration_confirmation() -> OutgoingMessage {
    OutgoingMessage::new(
        "✅ *Thank you! Your details are in!*\n\n\
         Our manager will contact you within 15 minutes to confirm and connect \
         you to the VIP signals.\n\n\
         ⏳ *Please hold on!*",
    )
}

/// Reply to free text when no input is expected.
pub fn fallback_reply() -> OutgoingMessage {
    OutgoingMessage::new(format!(
        "🤖 I'm the VIP access bot.\n\n\
         Use the menu buttons to navigate, or message {MANAGER_HANDLE} to reach \
         the manager."
    ))
}

/// Generic, non-technical reply when handling an event fails internally.
pub fn apology() -> OutgoingMessage {
    OutgoingMessage::new("Sorry, something went wrong on my side. Please try again in a moment.")
}

/// Text for a due reminder.
pub fn reminder_text(kind: ReminderKind, display_name: &str) -> String {
    match kind {
        ReminderKind::FirstNudge => format!(
            "👋 Hi {display_name}! I've reserved a VIP spot for you, waiting to hear back 🙏"
        ),
        ReminderKind::SecondNudge => format!(
            "🤝 Hi {display_name}! I'm still holding your spot, drop me a line when you're ready 🤝"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::ButtonAction;

    #[test]
    fn welcome_greets_by_name() {
        let msg = screen(ScreenId::Welcome, "Alice");
        assert!(msg.text.contains("Alice"));
        assert_eq!(msg.keyboard.len(), 1);
    }

    #[test]
    fn benefits_buttons_carry_known_selection_ids() {
        let msg = screen(ScreenId::Benefits, "Alice");
        for row in &msg.keyboard {
            for button in row {
                match &button.action {
                    ButtonAction::Select(id) => {
                        assert!(id.parse::<SelectionId>().is_ok(), "unknown id {id}");
                    }
                    ButtonAction::Url(_) => {}
                }
            }
        }
    }

    #[test]
    fn reminder_texts_differ_by_kind() {
        let first = reminder_text(ReminderKind::FirstNudge, "Alice");
        let second = reminder_text(ReminderKind::SecondNudge, "Alice");
        assert_ne!(first, second);
        assert!(first.contains("Alice") && second.contains("Alice"));
    }
}
