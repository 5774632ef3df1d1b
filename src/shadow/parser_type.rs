use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use crate::error::{ForgeError, Result};

/// Which shadow copy implementation backs a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ParserType {
    #[default]
    Unknown,
    /// The live Windows snapshot service.
    Microsoft,
    /// On-disk shadow storage, read directly.
    Internal,
}

impl ParserType {
    pub const ALL: [ParserType; 3] = [Self::Unknown, Self::Microsoft, Self::Internal];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Microsoft => "microsoft",
            Self::Internal => "internal",
        }
    }

    /// Parses an operator setting. Empty input leaves the setting unset, anything
    /// unrecognized is an invalid argument.
    pub fn parse_setting(value: &str) -> Result<Option<Self>> {
        let value = value.trim();
        if value.is_empty() {
            return Ok(None);
        }
        Self::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(value))
            .map(Some)
            .ok_or_else(|| {
                ForgeError::InvalidArgument(format!(
                    "unknown shadow copy parser '{}' (expected unknown, microsoft or internal)",
                    value
                ))
            })
    }
}

impl fmt::Display for ParserType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ParserType {
    type Err = ForgeError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse_setting(s)?
            .ok_or_else(|| ForgeError::InvalidArgument("empty shadow copy parser".to_string()))
    }
}
