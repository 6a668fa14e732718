//! Per-user, per-channel delivery preferences

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::{Channel, ParseEnumError};

/// How often a user wants to hear from a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Frequency {
    #[default]
    Immediate,
    Hourly,
    Daily,
}

impl Frequency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Immediate => "immediate",
            Self::Hourly => "hourly",
            Self::Daily => "daily",
        }
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Frequency {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "immediate" => Ok(Self::Immediate),
            "hourly" => Ok(Self::Hourly),
            "daily" => Ok(Self::Daily),
            other => Err(ParseEnumError::new("frequency", other)),
        }
    }
}

/// Opt-in record for one (user, channel) pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preference {
    pub user_id: String,
    pub channel: Channel,
    pub enabled: bool,
    #[serde(default)]
    pub frequency: Frequency,
}

impl Preference {
    /// The preference assumed when no record exists: enabled, immediate.
    pub fn default_for(user_id: impl Into<String>, channel: Channel) -> Self {
        Self {
            user_id: user_id.into(),
            channel,
            enabled: true,
            frequency: Frequency::Immediate,
        }
    }
}
