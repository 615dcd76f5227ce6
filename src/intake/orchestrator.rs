//! The per-message entry point of the intake flow.
//!
//! Loads the profile and recent history, asks the model gateway for a turn,
//! decodes it, then writes profile, reminder and log updates. A turn always
//! ends in a reply: either the model's text or a fixed apology. Storage
//! faults are logged at error level and counted on the [`TurnReport`], never
//! raised.
//!
//! Writes are individual store calls with no enclosing transaction, so a
//! fault part-way through a turn can leave the stores out of step.
//!
//! Dates are UTC calendar dates: a reminder counts from the UTC day the
//! message was received, not the server's local day.

use std::sync::Arc;

use chrono::{DateTime, Days, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{Instrument, error, info, info_span, warn};
use uuid::Uuid;

use crate::config::IntakeConfig;
use crate::error::{ChannelError, DatabaseError, GatewayError, TurnError};
use crate::intake::interpreter::{self, TurnResult};
use crate::intake::model::{ClientProfile, MessageLogEntry, ProfileUpdate};
use crate::intake::prompts::PromptBuilder;
use crate::intake::state::IntakeState;
use crate::llm::ModelGateway;
use crate::store::Database;

/// Reply when the model failed or its output could not be decoded.
pub const PROCESSING_APOLOGY: &str =
    "Hubo un error al procesar tu solicitud. Por favor, inténtalo de nuevo más tarde.";

/// Reply when every attempt was rate limited.
pub const NO_RESPONSE_APOLOGY: &str =
    "No se pudo obtener una respuesta de la IA. Por favor, inténtalo de nuevo más tarde.";

/// One inbound message, as handed over by the transport layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnRequest {
    pub user_id: String,
    pub text: String,
    pub received_at: DateTime<Utc>,
}

impl TurnRequest {
    /// A request received now.
    pub fn new(user_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            text: text.into(),
            received_at: Utc::now(),
        }
    }

    /// A request stamped with a Unix epoch in seconds.
    pub fn from_epoch(
        user_id: impl Into<String>,
        text: impl Into<String>,
        epoch_secs: i64,
    ) -> Result<Self, ChannelError> {
        let received_at = DateTime::from_timestamp(epoch_secs, 0).ok_or_else(|| {
            ChannelError::InvalidMessage(format!("timestamp {epoch_secs} is out of range"))
        })?;
        Ok(Self {
            user_id: user_id.into(),
            text: text.into(),
            received_at,
        })
    }
}

/// The reply for the delivery layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingReply {
    pub user_id: String,
    pub reply_text: String,
}

/// How a turn ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    /// The model's reply was delivered and state updated.
    Completed,
    /// The gateway produced no usable text; an apology was returned.
    GatewayFailed(GatewayError),
    /// The model's text did not decode; an apology was returned.
    Malformed(TurnError),
}

/// Everything a caller may want to know about a finished turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnReport {
    pub reply: OutgoingReply,
    /// Step stored for the user after this turn.
    pub step: u32,
    /// Target date of the reminder created this turn, if any.
    pub reminder: Option<NaiveDate>,
    /// Set when the model sent an `intervalo` that could not be used.
    pub interval_error: Option<TurnError>,
    pub outcome: TurnOutcome,
    /// Store operations that failed during the turn.
    pub storage_faults: u32,
}

impl TurnReport {
    pub fn is_completed(&self) -> bool {
        self.outcome == TurnOutcome::Completed
    }
}

/// Drives one turn of the intake dialogue. Shared by all concurrent turns.
pub struct DialogueOrchestrator {
    db: Arc<dyn Database>,
    gateway: Arc<ModelGateway>,
    prompts: PromptBuilder,
    config: IntakeConfig,
}

impl DialogueOrchestrator {
    pub fn new(db: Arc<dyn Database>, gateway: Arc<ModelGateway>, config: IntakeConfig) -> Self {
        Self {
            db,
            gateway,
            prompts: PromptBuilder::new(config.history_window),
            config,
        }
    }

    /// Replace the prompt builder (custom template).
    pub fn with_prompts(mut self, prompts: PromptBuilder) -> Self {
        self.prompts = prompts;
        self
    }

    /// Process one inbound message. Never fails; see [`TurnReport`].
    pub async fn handle_turn(&self, request: &TurnRequest) -> TurnReport {
        let span = info_span!(
            "turn",
            turn_id = %Uuid::new_v4(),
            user_id = %request.user_id,
        );
        self.run_turn(request).instrument(span).await
    }

    async fn run_turn(&self, request: &TurnRequest) -> TurnReport {
        let user_id = request.user_id.as_str();
        let mut faults = Faults::default();

        // 1. Profile, created on first contact.
        let profile = self.load_or_create_profile(user_id, &mut faults).await;
        let state = IntakeState::from(&profile);
        let prior_step = state.step;
        info!(step = prior_step, "Inbound message");

        // 2. Recent history, most recent first.
        let history = match self
            .db
            .inbound_history(user_id, self.prompts.window())
            .await
        {
            Ok(history) => history,
            Err(e) => {
                faults.record("inbound_history", &e);
                Vec::new()
            }
        };

        // 3. Model call.
        let prompt = self.prompts.build(&history, &request.text);
        let raw = match self.gateway.complete(&prompt).await {
            Ok(raw) => raw,
            Err(e) => {
                error!(error = %e, "No usable model output, replying with apology");
                let apology = match e {
                    GatewayError::NoResponseObtained { .. } => NO_RESPONSE_APOLOGY,
                    _ => PROCESSING_APOLOGY,
                };
                return self
                    .fail_turn(request, prior_step, apology, TurnOutcome::GatewayFailed(e), faults)
                    .await;
            }
        };

        // 4. Decode.
        let result = match interpreter::interpret(&raw) {
            Ok(result) => result,
            Err(e) => {
                error!(error = %e, "Model output could not be decoded");
                return self
                    .fail_turn(
                        request,
                        prior_step,
                        PROCESSING_APOLOGY,
                        TurnOutcome::Malformed(e),
                        faults,
                    )
                    .await;
            }
        };

        // 5. Effective step.
        if result.step.is_none() {
            warn!(step = prior_step, "Model omitted the step, keeping the previous one");
        }
        let next = state.apply(&result);

        // 6. Inbound, tagged with the pre-turn step.
        self.log_inbound(request, prior_step, &mut faults).await;

        // 7. Reminder.
        let (reminder, interval_error) = self
            .schedule_reminder(user_id, request.received_at, &result, &mut faults)
            .await;

        // 8. Extracted facts.
        let update = result.profile_update();
        if !update.is_empty() {
            if let Err(e) = self.db.upsert_profile(user_id, &update).await {
                faults.record("upsert_profile", &e);
            }
        }

        // 9. Step.
        if let Err(e) = self.db.set_step(user_id, next.step).await {
            faults.record("set_step", &e);
        }

        // 10. Outbound, tagged with the effective step.
        let outbound = MessageLogEntry::outbound(
            user_id,
            &result.reply,
            reply_timestamp(request),
            &self.config.service_tag,
            next.step,
        );
        if let Err(e) = self.db.append_message(&outbound).await {
            faults.record("append_message", &e);
        }

        info!(
            from_step = prior_step,
            to_step = next.step,
            complete = next.is_complete(),
            reminder = ?reminder,
            storage_faults = faults.count,
            "Turn completed"
        );

        // 11. Reply.
        TurnReport {
            reply: OutgoingReply {
                user_id: user_id.to_string(),
                reply_text: result.reply,
            },
            step: next.step,
            reminder,
            interval_error,
            outcome: TurnOutcome::Completed,
            storage_faults: faults.count,
        }
    }

    async fn load_or_create_profile(&self, user_id: &str, faults: &mut Faults) -> ClientProfile {
        match self.db.get_profile(user_id).await {
            Ok(Some(profile)) => return profile,
            Ok(None) => info!("New client, creating profile at step 0"),
            Err(e) => {
                faults.record("get_profile", &e);
                return ClientProfile::new(user_id);
            }
        }

        // An empty update only inserts; a row written by a concurrent first
        // turn keeps its name and step.
        if let Err(e) = self
            .db
            .upsert_profile(user_id, &ProfileUpdate::default())
            .await
        {
            faults.record("upsert_profile", &e);
        }
        ClientProfile::new(user_id)
    }

    async fn log_inbound(&self, request: &TurnRequest, step: u32, faults: &mut Faults) {
        let inbound = MessageLogEntry::inbound(
            &request.user_id,
            &request.text,
            request.received_at,
            &self.config.service_tag,
            step,
        );
        if let Err(e) = self.db.append_message(&inbound).await {
            faults.record("append_message", &e);
        }
    }

    /// Create a reminder when the turn carried a usable interval. The target
    /// date counts from the day the message was received.
    async fn schedule_reminder(
        &self,
        user_id: &str,
        received_at: DateTime<Utc>,
        result: &TurnResult,
        faults: &mut Faults,
    ) -> (Option<NaiveDate>, Option<TurnError>) {
        let weeks = match result.interval.weeks() {
            Ok(Some(weeks)) => weeks,
            Ok(None) => return (None, None),
            Err(e) => {
                warn!(error = %e, "Ignoring unusable interval, no reminder created");
                return (None, Some(e));
            }
        };

        let Some(target) = reminder_date(received_at, weeks) else {
            let e = TurnError::IntervalCoercion {
                value: weeks.to_string(),
            };
            warn!(error = %e, "Interval overflows the calendar, no reminder created");
            return (None, Some(e));
        };

        match self.db.create_reminder(user_id, target, weeks).await {
            Ok(_) => (Some(target), None),
            Err(e) => {
                faults.record("create_reminder", &e);
                (None, None)
            }
        }
    }

    /// Log the inbound message and an apology, leaving profile state alone.
    async fn fail_turn(
        &self,
        request: &TurnRequest,
        step: u32,
        apology: &str,
        outcome: TurnOutcome,
        mut faults: Faults,
    ) -> TurnReport {
        self.log_inbound(request, step, &mut faults).await;

        let outbound = MessageLogEntry::outbound(
            &request.user_id,
            apology,
            reply_timestamp(request),
            &self.config.service_tag,
            step,
        );
        if let Err(e) = self.db.append_message(&outbound).await {
            faults.record("append_message", &e);
        }

        TurnReport {
            reply: OutgoingReply {
                user_id: request.user_id.clone(),
                reply_text: apology.to_string(),
            },
            step,
            reminder: None,
            interval_error: None,
            outcome,
            storage_faults: faults.count,
        }
    }
}

/// UTC date of `received_at` plus whole weeks.
pub fn reminder_date(received_at: DateTime<Utc>, weeks: u32) -> Option<NaiveDate> {
    received_at
        .date_naive()
        .checked_add_days(Days::new(u64::from(weeks) * 7))
}

/// Outbound entries never sort before the inbound message they answer.
fn reply_timestamp(request: &TurnRequest) -> DateTime<Utc> {
    Utc::now().max(request.received_at)
}

/// Storage faults seen during one turn.
#[derive(Debug, Default)]
struct Faults {
    count: u32,
}

impl Faults {
    fn record(&mut self, op: &str, e: &DatabaseError) {
        self.count += 1;
        error!(op, error = %e, "Storage fault during turn");
    }
}
