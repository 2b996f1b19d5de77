//! Host identity: isolation levels, host descriptions and activation metadata.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Group used when activation metadata names none.
pub const DEFAULT_GROUP: &str = "DefaultGroup";

/// Degree of execution separation for a hosted component.
///
/// Variants are ordered by increasing isolation strength and cost.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum IsolationLevel {
    /// Components run in the caller's process, called directly.
    #[default]
    None,
    /// Components run on a dedicated sandbox thread inside this process.
    SandboxedInProcess,
    /// Components run in a child agent process.
    SeparateProcess,
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::SandboxedInProcess => write!(f, "sandboxed-in-process"),
            Self::SeparateProcess => write!(f, "separate-process"),
        }
    }
}

/// Identity of a host: isolation level plus named group.
///
/// Equality is structural; this is the pool's lookup key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActivationHostDescription {
    isolation: IsolationLevel,
    group: String,
}

impl ActivationHostDescription {
    /// Create a description.
    pub fn new(isolation: IsolationLevel, group: impl Into<String>) -> Self {
        Self {
            isolation,
            group: group.into(),
        }
    }

    /// Isolation level of the host.
    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    /// Group name of the host.
    pub fn group(&self) -> &str {
        &self.group
    }
}

impl fmt::Display for ActivationHostDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.isolation, self.group)
    }
}

/// Caller-supplied isolation policy for one activation request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IsolationMetadata {
    /// Requested isolation level.
    pub isolation: IsolationLevel,
    /// Host group; [`DEFAULT_GROUP`] when unset.
    pub group: Option<String>,
    /// Never co-locate two instances of the same implementation type.
    pub host_per_instance: bool,
}

impl IsolationMetadata {
    /// Metadata for the given level in the default group.
    pub fn new(isolation: IsolationLevel) -> Self {
        Self {
            isolation,
            ..Default::default()
        }
    }

    /// Set the host group.
    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    /// Set the host-per-instance flag.
    pub fn host_per_instance(mut self, enabled: bool) -> Self {
        self.host_per_instance = enabled;
        self
    }

    /// Effective group name.
    pub fn group_name(&self) -> &str {
        self.group.as_deref().unwrap_or(DEFAULT_GROUP)
    }

    /// Description of the hosts eligible for this request.
    pub fn description(&self) -> ActivationHostDescription {
        ActivationHostDescription::new(self.isolation, self.group_name())
    }
}

/// Unique identifier for a pooled host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HostId(Uuid);

impl HostId {
    /// Create a new random host ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for HostId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for HostId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}
