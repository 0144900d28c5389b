//! Funnel state machine.
//!
//! Deterministic mapping from (current step, inbound event) to the next
//! step, the screen to show, and side effects (reminder scheduling, the
//! awaiting-free-text flag, operator notification). The mapping is an
//! explicit transition table passed in at construction.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use tracing::{debug, error, info, warn};

use crate::channels::{Notifier, OperatorSink};
use crate::config::{FunnelConfig, ReminderConfig, ReturningStartPolicy};
use crate::content::{self, ScreenId};
use crate::error::{ChannelError, DatabaseError, Result};
use crate::funnel::event::{EventPayload, InboundEvent, SelectionId};
use crate::funnel::step::FunnelStep;
use crate::store::{AwaitingInput, ReminderKind, Store};

/// One row of the transition table.
#[derive(Debug, Clone)]
pub struct Transition {
    pub next_step: FunnelStep,
    pub screen: ScreenId,
    /// Awaiting-input flag value after the transition. `None` clears it, so
    /// backing out of the data-request screen disarms the flag the forward
    /// transition armed.
    pub awaiting: Option<AwaitingInput>,
    /// Send the separate reservation notice after the menu acknowledgement.
    pub reservation_notice: bool,
}

impl Transition {
    fn display(next_step: FunnelStep, screen: ScreenId) -> Self {
        Self {
            next_step,
            screen,
            awaiting: None,
            reservation_notice: false,
        }
    }
}

/// Mapping of (step, selection) to transition.
#[derive(Debug, Default)]
pub struct TransitionTable {
    rules: HashMap<(FunnelStep, SelectionId), Transition>,
}

impl TransitionTable {
    pub fn insert(&mut self, step: FunnelStep, selection: SelectionId, transition: Transition) {
        self.rules.insert((step, selection), transition);
    }

    pub fn get(&self, step: FunnelStep, selection: SelectionId) -> Option<&Transition> {
        self.rules.get(&(step, selection))
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// The scripted funnel: forward selections, back rows that reuse the target
/// screen's id, and the registration branch that arms the free-text flag.
pub fn default_table() -> TransitionTable {
    use FunnelStep::*;
    use SelectionId::*;

    let mut table = TransitionTable::default();

    table.insert(
        Start,
        ShowBenefits,
        Transition::display(ViewedBenefits, ScreenId::Benefits),
    );
    table.insert(
        ViewedBenefits,
        HasBroker,
        Transition::display(SelectedHasBroker, ScreenId::BrokerPlans),
    );
    table.insert(
        ViewedBenefits,
        CompletedRegistration,
        Transition {
            next_step: AwaitingRegistrationData,
            screen: ScreenId::RegistrationRequest,
            awaiting: Some(AwaitingInput::RegistrationPayload),
            reservation_notice: true,
        },
    );
    table.insert(
        ViewedBenefits,
        BackToStart,
        Transition::display(Start, ScreenId::Welcome),
    );
    table.insert(
        SelectedHasBroker,
        MakePayment,
        Transition::display(AwaitingPayment, ScreenId::PaymentInstructions),
    );
    table.insert(
        SelectedHasBroker,
        ShowBenefits,
        Transition::display(ViewedBenefits, ScreenId::Benefits),
    );
    table.insert(
        AwaitingPayment,
        HasBroker,
        Transition::display(SelectedHasBroker, ScreenId::BrokerPlans),
    );
    table.insert(
        AwaitingRegistrationData,
        ShowBenefits,
        Transition::display(ViewedBenefits, ScreenId::Benefits),
    );

    table
}

/// Drives the funnel for inbound events.
pub struct FunnelMachine {
    store: Arc<dyn Store>,
    notifier: Arc<dyn Notifier>,
    operator: Arc<dyn OperatorSink>,
    table: TransitionTable,
    config: FunnelConfig,
    /// (kind, offset from first contact) pairs, scheduled on first entry.
    reminder_plan: Vec<(ReminderKind, Duration)>,
}

impl FunnelMachine {
    pub fn new(
        store: Arc<dyn Store>,
        notifier: Arc<dyn Notifier>,
        operator: Arc<dyn OperatorSink>,
        table: TransitionTable,
        config: FunnelConfig,
        reminders: &ReminderConfig,
    ) -> Self {
        Self {
            store,
            notifier,
            operator,
            table,
            config,
            reminder_plan: vec![
                (ReminderKind::FirstNudge, Duration::hours(reminders.first_nudge_hours)),
                (ReminderKind::SecondNudge, Duration::hours(reminders.second_nudge_hours)),
            ],
        }
    }

    /// Handle one inbound event.
    ///
    /// Per-event errors propagate to the caller (which replies with a
    /// generic apology); they never leave subject state partially updated —
    /// every store operation is atomic on its own.
    pub async fn handle_event(&self, event: &InboundEvent) -> Result<()> {
        if event.subject.subject_id.trim().is_empty() {
            return Err(ChannelError::InvalidEvent("missing subject identity".into()).into());
        }

        match &event.payload {
            EventPayload::FirstContact => self.handle_first_contact(event).await,
            EventPayload::Selection { id } => self.handle_selection(event, id).await,
            EventPayload::FreeText { text } => self.handle_free_text(event, text).await,
        }
    }

    async fn handle_first_contact(&self, event: &InboundEvent) -> Result<()> {
        let subject_id = event.subject.subject_id.as_str();

        let created = self.store.upsert_subject(&event.subject).await?;
        let first_entry = self
            .store
            .ensure_conversation_state(subject_id, FunnelStep::Start)
            .await?;

        // "First-ever" is keyed off the conversation-state row, not reminder
        // count: reminders may already have fired and must not be re-armed.
        if first_entry {
            let now = Utc::now();
            for (kind, offset) in &self.reminder_plan {
                self.store
                    .insert_reminder_if_absent(subject_id, *kind, now + *offset)
                    .await?;
            }
            info!(subject_id, created, "First funnel entry, reminders scheduled");
        }

        let state = self.store.get_conversation_state(subject_id).await?;
        let terminal = state.as_ref().is_some_and(|s| s.step.is_terminal());

        let screen_id = if !first_entry
            && self.config.returning_start == ReturningStartPolicy::Benefits
        {
            ScreenId::Benefits
        } else {
            ScreenId::Welcome
        };

        // `Done` is absorbing: a finished subject still gets the content but
        // their state is left alone.
        if !terminal {
            let next_step = match screen_id {
                ScreenId::Benefits => FunnelStep::ViewedBenefits,
                _ => FunnelStep::Start,
            };
            self.store
                .set_conversation_state(subject_id, next_step, None)
                .await?;
        }

        self.log(subject_id, "first_contact", None).await;
        self.notifier
            .send(subject_id, &content::screen(screen_id, event.subject.display_name()))
            .await?;
        Ok(())
    }

    async fn handle_selection(&self, event: &InboundEvent, raw_id: &str) -> Result<()> {
        let subject_id = event.subject.subject_id.as_str();

        let Ok(selection) = raw_id.parse::<SelectionId>() else {
            warn!(subject_id, selection = raw_id, "Unknown selection id, ignoring");
            self.log(subject_id, "unknown_selection", Some(raw_id)).await;
            return Ok(());
        };

        let state = self.store.get_conversation_state(subject_id).await?;
        let step = state.map(|s| s.step).unwrap_or_default();

        if step.is_terminal() {
            debug!(subject_id, %selection, "Selection after funnel completion, ignoring");
            return Ok(());
        }

        let Some(transition) = self.table.get(step, selection) else {
            debug!(subject_id, %step, %selection, "No transition for selection, ignoring");
            self.log(subject_id, "rejected_selection", Some(raw_id)).await;
            return Ok(());
        };

        self.store
            .set_conversation_state(subject_id, transition.next_step, transition.awaiting)
            .await?;
        self.log(subject_id, selection.as_str(), None).await;

        let name = event.subject.display_name();
        let mut menu = content::screen(transition.screen, name);
        if let Some(message_id) = event.menu_message_id() {
            menu = menu.as_edit_of(message_id);
        }
        // Menu acknowledgement first, reservation notice second.
        self.notifier.send(subject_id, &menu).await?;
        if transition.reservation_notice {
            self.notifier
                .send(subject_id, &content::reservation_notice(name))
                .await?;
        }
        Ok(())
    }

    async fn handle_free_text(&self, event: &InboundEvent, text: &str) -> Result<()> {
        let subject_id = event.subject.subject_id.as_str();

        let state = self.store.get_conversation_state(subject_id).await?;
        let awaiting = state.and_then(|s| s.awaiting);

        match awaiting {
            Some(AwaitingInput::RegistrationPayload) => {
                self.store.save_registration(subject_id, text).await?;
                self.store
                    .set_conversation_state(subject_id, FunnelStep::Done, None)
                    .await?;

                let subject = self.store.get_subject(subject_id).await?.ok_or_else(|| {
                    DatabaseError::NotFound {
                        entity: "subject".into(),
                        id: subject_id.into(),
                    }
                })?;

                // Operator delivery first, then the user confirmation. A
                // failed operator send is logged and must not block the
                // confirmation.
                if let Err(e) = self.operator.notify_registration(&subject, text).await {
                    error!(subject_id, error = %e, "Operator notification failed");
                }

                self.log(subject_id, "registration_submitted", Some(text)).await;
                self.notifier
                    .send(subject_id, &content::registration_confirmation())
                    .await?;
                info!(subject_id, "Registration payload recorded");
            }
            None => {
                // Not waiting for anything: generic fallback, no mutation.
                self.log(subject_id, "free_text", Some(text)).await;
                self.notifier
                    .send(subject_id, &content::fallback_reply())
                    .await?;
            }
        }
        Ok(())
    }

    /// Append to the interaction log; observability only, failures swallowed.
    async fn log(&self, subject_id: &str, action: &str, details: Option<&str>) {
        if let Err(e) = self.store.log_interaction(subject_id, action, details).await {
            warn!(subject_id, action, error = %e, "Failed to log interaction");
        }
    }
}
