use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// `YYYYMMDDhhmmss` UTC, lexicographically sortable, ASCII-only.
///
/// Used both as the deployment's database key and as the image tag
/// suffix (`<appName>:<DeploymentID>`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeploymentId(NaiveDateTime);

const FORMAT: &str = "%Y%m%d%H%M%S";

#[derive(Debug, Error)]
pub enum DeploymentIdError {
    #[error("deployment id {0:?} is not {} chars of {}", FORMAT, "YYYYMMDDhhmmss")]
    BadFormat(String),
}

impl DeploymentId {
    pub fn now() -> Self {
        Self(Utc::now().naive_utc())
    }

    /// Generates an id strictly greater than `after`, bumping by one
    /// second if the clock hasn't moved (keeps ids unique under rapid
    /// successive deploys in tests).
    pub fn after(after: DeploymentId) -> Self {
        let now = Utc::now().naive_utc();
        if now > after.0 {
            Self(now)
        } else {
            Self(after.0 + chrono::Duration::seconds(1))
        }
    }

    pub fn as_str(&self) -> String {
        self.0.format(FORMAT).to_string()
    }
}

impl fmt::Display for DeploymentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for DeploymentId {
    type Err = DeploymentIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 14 || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(DeploymentIdError::BadFormat(s.to_owned()));
        }
        NaiveDateTime::parse_from_str(s, FORMAT)
            .map(Self)
            .map_err(|_| DeploymentIdError::BadFormat(s.to_owned()))
    }
}

impl TryFrom<String> for DeploymentId {
    type Error = DeploymentIdError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<DeploymentId> for String {
    fn from(id: DeploymentId) -> Self {
        id.as_str()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_string() {
        let id = DeploymentId::now();
        let s = id.as_str();
        assert_eq!(s.len(), 14);
        assert_eq!(s.parse::<DeploymentId>().unwrap(), id);
    }

    #[test]
    fn sorts_lexicographically_with_time() {
        let a = DeploymentId::now();
        let b = DeploymentId::after(a);
        assert!(b > a);
        assert!(b.as_str() > a.as_str());
    }

    #[test]
    fn rejects_malformed_input() {
        assert!("not-a-timestamp".parse::<DeploymentId>().is_err());
        assert!("2024010112".parse::<DeploymentId>().is_err());
    }
}
