use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

/// Unix epoch timestamp in seconds.
pub type Timestamp = i64;

/// Current unix time in seconds.
pub fn now() -> Timestamp {
    Utc::now().timestamp()
}

/// The fields carried inside a pilot bearer token.
///
/// Decoded form is `host_uuid|host_ip|hostname|issued_at`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthToken {
    pub host_uuid: String,
    pub host_ip: String,
    pub hostname: String,
    pub issued_at: Timestamp,
}

impl AuthToken {
    /// Seconds elapsed between issue time and `now`.
    pub fn age(&self, now: Timestamp) -> i64 {
        now.saturating_sub(self.issued_at)
    }
}

/// An authenticated caller. Pilots are identified only, they hold no rights.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub identity: String,
    pub rights: BTreeSet<String>,
    pub created: Timestamp,
}

impl Principal {
    pub fn pilot(host_uuid: impl Into<String>) -> Self {
        Self {
            identity: host_uuid.into(),
            rights: BTreeSet::new(),
            created: now(),
        }
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.identity)
    }
}

/// Everything a pilot needs to execute a job.
///
/// A default command (`job_id == 0`) tells the pilot there is nothing to run.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub job_id: i64,
    pub package: String,
    pub function: String,
    pub user: String,
    pub pwd: String,
    pub verbose: bool,
    pub containerised: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<serde_json::Value>,
}

impl Command {
    pub fn is_empty(&self) -> bool {
        self.job_id <= 0
    }
}

/// The signed content of a ping response.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PingEnvelope {
    #[serde(rename = "value")]
    pub command: Command,
    /// Polling interval, serialized as integer nanoseconds.
    #[serde(with = "duration_nanos")]
    pub interval: Duration,
}

/// Body of `POST /ping`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PingRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<JobResult>,
}

/// Outcome of a job, reported by the pilot on its next ping.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct JobResult {
    pub job_id: i64,
    pub success: bool,
    #[serde(default)]
    pub log: String,
    #[serde(default)]
    pub err: String,
    #[serde(default)]
    pub time: Option<DateTime<Utc>>,
}

impl JobResult {
    /// The log as it should be stored, with the error appended on failure.
    pub fn log_entry(&self) -> String {
        if !self.success && !self.err.is_empty() {
            format!("{} !!! ERROR: {}\n", self.log, self.err)
        } else {
            self.log.clone()
        }
    }
}

/// Next job selected for a host.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobAssignment {
    pub job_id: i64,
    pub command_key: String,
    pub command_version: i64,
}

/// An operational event raised on a managed host.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(default)]
    pub event_id: String,
    #[serde(default)]
    pub client: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub host_uuid: String,
    #[serde(default)]
    pub machine_id: String,
    #[serde(default)]
    pub host_address: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub organisation: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub organisation_group: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub area: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub location: String,
    #[serde(default)]
    pub facility: i32,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub severity: i32,
    #[serde(default)]
    pub time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub tls_peer: String,
    #[serde(default)]
    pub boot_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub tag: String,
    #[serde(default)]
    pub mac_address: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub host_label: Vec<String>,
}

/// A downstream HTTP endpoint accepting event batches.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventReceiver {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pwd: Option<String>,
}

impl EventReceiver {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            name: None,
            uri: uri.into(),
            user: None,
            pwd: None,
        }
    }

    pub fn with_credentials(mut self, user: impl Into<String>, pwd: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self.pwd = Some(pwd.into());
        self
    }

    /// Credentials, only when both halves are present and non-empty.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (self.user.as_deref(), self.pwd.as_deref()) {
            (Some(user), Some(pwd)) if !user.is_empty() && !pwd.is_empty() => Some((user, pwd)),
            _ => None,
        }
    }
}

impl fmt::Display for EventReceiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{name} ({})", self.uri),
            None => write!(f, "{}", self.uri),
        }
    }
}

/// On-disk shape of the receiver configuration file.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventReceivers {
    #[serde(default)]
    pub event_receivers: Vec<EventReceiver>,
}

/// Serde helper for `Duration` as integer nanoseconds.
mod duration_nanos {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let nanos = u64::try_from(duration.as_nanos())
            .map_err(|_| serde::ser::Error::custom("duration overflows u64 nanoseconds"))?;
        serializer.serialize_u64(nanos)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let nanos = u64::deserialize(deserializer)?;
        Ok(Duration::from_nanos(nanos))
    }
}
