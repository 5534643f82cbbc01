//! Kitchen display tickets and long-poll batches.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Preparation station a ticket is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Station {
    Kitchen,
    Drinker,
}

impl Station {
    pub fn as_str(&self) -> &'static str {
        match self {
            Station::Kitchen => "kitchen",
            Station::Drinker => "drinker",
        }
    }
}

impl fmt::Display for Station {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Station {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "kitchen" => Ok(Station::Kitchen),
            "drinker" => Ok(Station::Drinker),
            other => Err(format!("unknown station '{other}' (expected kitchen|drinker)")),
        }
    }
}

/// One order ticket as the KDS endpoints serialize it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticket {
    pub id: u64,
    #[serde(default)]
    pub state: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Result of one long-poll round.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PollBatch<T> {
    pub items: Vec<T>,
    /// New stream position; None leaves the cursor where it is.
    pub cursor: Option<u64>,
    /// Server-suggested pause before the next request.
    pub retry_after: Option<Duration>,
}

impl<T> PollBatch<T> {
    pub fn empty() -> Self {
        Self {
            items: Vec::new(),
            cursor: None,
            retry_after: None,
        }
    }
}
