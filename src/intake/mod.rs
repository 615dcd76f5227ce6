//! Intake dialogue engine.
//!
//! A fixed six-step conversation (greeting, reminder interval, pet name, food
//! preference, breed, confirmation) whose progression is decided by the
//! model. This module builds the prompts, decodes the model's answers, folds
//! them into per-user state and persists the outcome.

pub mod interpreter;
pub mod model;
pub mod orchestrator;
pub mod prompts;
pub mod state;

pub use interpreter::{IntervalField, TurnResult, interpret};
pub use model::{ClientProfile, Direction, MessageLogEntry, ProfileUpdate, ReminderRecord};
pub use orchestrator::{
    DialogueOrchestrator, NO_RESPONSE_APOLOGY, OutgoingReply, PROCESSING_APOLOGY, TurnOutcome,
    TurnReport, TurnRequest,
};
pub use prompts::PromptBuilder;
pub use state::IntakeState;
