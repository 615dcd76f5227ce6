//! Intake state: the user's step plus the pet facts gathered so far.
//!
//! The model decides step progression; this type only encodes how a decoded
//! turn folds into the existing state, independent of any model call.

use serde::{Deserialize, Serialize};

use crate::intake::interpreter::TurnResult;
use crate::intake::model::{ClientProfile, PLACEHOLDER_NAME};

/// Final step of the scripted flow: the reminder has been confirmed.
pub const FINAL_STEP: u32 = 6;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntakeState {
    pub step: u32,
    pub name: String,
    pub pet_name: Option<String>,
    pub pet_type: Option<String>,
    pub preferences: Option<String>,
}

impl IntakeState {
    /// Fold a decoded turn into the state.
    ///
    /// A present step replaces the current one, an absent step keeps it.
    /// Extracted facts only ever add or overwrite; absence never clears.
    pub fn apply(&self, result: &TurnResult) -> IntakeState {
        IntakeState {
            step: result.step.unwrap_or(self.step),
            name: self.name.clone(),
            pet_name: result.pet_name.clone().or_else(|| self.pet_name.clone()),
            pet_type: result.breed.clone().or_else(|| self.pet_type.clone()),
            preferences: result
                .preference
                .clone()
                .or_else(|| self.preferences.clone()),
        }
    }

    /// Whether the flow has reached its confirmation step.
    pub fn is_complete(&self) -> bool {
        self.step >= FINAL_STEP
    }
}

impl Default for IntakeState {
    fn default() -> Self {
        Self {
            step: 0,
            name: PLACEHOLDER_NAME.to_string(),
            pet_name: None,
            pet_type: None,
            preferences: None,
        }
    }
}

impl From<&ClientProfile> for IntakeState {
    fn from(profile: &ClientProfile) -> Self {
        Self {
            step: profile.step,
            name: profile.name.clone(),
            pet_name: profile.pet_name.clone(),
            pet_type: profile.pet_type.clone(),
            preferences: profile.preferences.clone(),
        }
    }
}
