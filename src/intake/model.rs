//! Client profile, message log and reminder records.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Display name given to a client we know nothing about yet.
pub const PLACEHOLDER_NAME: &str = "Desconocido";

/// Per-user intake record, keyed by the external (WhatsApp) id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientProfile {
    pub user_id: String,
    pub name: String,
    /// Species or breed, free text.
    pub pet_type: Option<String>,
    pub pet_name: Option<String>,
    /// Food and other preferences, free text.
    pub preferences: Option<String>,
    pub step: u32,
}

impl ClientProfile {
    /// A fresh profile at step 0.
    pub fn new(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            name: PLACEHOLDER_NAME.to_string(),
            pet_type: None,
            pet_name: None,
            preferences: None,
            step: 0,
        }
    }
}

/// Fields to merge into a profile. `None` leaves the stored value untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProfileUpdate {
    pub name: Option<String>,
    pub pet_type: Option<String>,
    pub pet_name: Option<String>,
    pub preferences: Option<String>,
    pub step: Option<u32>,
}

impl ProfileUpdate {
    /// True when there is nothing to write.
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.pet_type.is_none()
            && self.pet_name.is_none()
            && self.preferences.is_none()
            && self.step.is_none()
    }
}

/// Which way a logged message travelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inbound => "inbound",
            Self::Outbound => "outbound",
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inbound" => Ok(Self::Inbound),
            "outbound" => Ok(Self::Outbound),
            other => Err(format!("unknown message direction '{other}'")),
        }
    }
}

/// One row of the audit log. Append-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageLogEntry {
    pub user_id: String,
    pub timestamp: DateTime<Utc>,
    pub text: String,
    pub direction: Direction,
    /// Service tag (the `servicio` column).
    pub service: String,
    /// Step the user was in when this message was logged.
    pub step: u32,
}

impl MessageLogEntry {
    pub fn inbound(user_id: &str, text: &str, timestamp: DateTime<Utc>, service: &str, step: u32) -> Self {
        Self {
            user_id: user_id.to_string(),
            timestamp,
            text: text.to_string(),
            direction: Direction::Inbound,
            service: service.to_string(),
            step,
        }
    }

    pub fn outbound(user_id: &str, text: &str, timestamp: DateTime<Utc>, service: &str, step: u32) -> Self {
        Self {
            direction: Direction::Outbound,
            ..Self::inbound(user_id, text, timestamp, service, step)
        }
    }
}

/// A scheduled purchase reminder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReminderRecord {
    pub id: i64,
    pub user_id: String,
    pub target_date: NaiveDate,
    pub weeks: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_profile_starts_at_step_zero() {
        let profile = ClientProfile::new("5491112345678");
        assert_eq!(profile.step, 0);
        assert_eq!(profile.name, PLACEHOLDER_NAME);
        assert!(profile.pet_name.is_none());
    }

    #[test]
    fn empty_update() {
        assert!(ProfileUpdate::default().is_empty());
        let update = ProfileUpdate {
            step: Some(0),
            ..Default::default()
        };
        assert!(!update.is_empty());
    }

    #[test]
    fn direction_display_matches_serde() {
        for direction in [Direction::Inbound, Direction::Outbound] {
            let json = serde_json::to_string(&direction).unwrap();
            assert_eq!(format!("\"{direction}\""), json);
            assert_eq!(direction.as_str().parse::<Direction>().unwrap(), direction);
        }
        assert!("sideways".parse::<Direction>().is_err());
    }
}
