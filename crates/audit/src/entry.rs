//! Audit log entry types.
//!
//! A caller describes what happened with a [`NewAuditEntry`]; the engine
//! turns it into an [`AuditLogEntry`] by assigning an id and timestamp,
//! scoring risk, tagging compliance regimes and sealing the result with an
//! integrity checksum. Sealed entries are never mutated. A mistake is fixed
//! by logging a correction whose `supersedes` points at the original.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    str::FromStr,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{checksum::IntegrityKey, compliance::ComplianceRegime};

/// Kind of principal that performed an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorType {
    /// An end user.
    User,
    /// A machine client or API key.
    Service,
    /// The platform itself (sweepers, schedulers).
    System,
    /// A caller whose identity could not be established.
    Anonymous,
}

impl fmt::Display for ActorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Service => write!(f, "service"),
            Self::System => write!(f, "system"),
            Self::Anonymous => write!(f, "anonymous"),
        }
    }
}

/// Who performed an action, and from where.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    /// Actor identifier (subject id, client id, component name).
    pub id: String,
    /// Kind of actor.
    #[serde(rename = "type")]
    pub actor_type: ActorType,
    /// Source network address, if known.
    pub ip: Option<String>,
    /// Client user agent, if known.
    pub user_agent: Option<String>,
}

impl Actor {
    /// Creates an actor with no network context.
    #[must_use]
    pub fn new(id: impl Into<String>, actor_type: ActorType) -> Self {
        Self { id: id.into(), actor_type, ip: None, user_agent: None }
    }

    /// The platform acting on its own behalf.
    #[must_use]
    pub fn system(component: impl Into<String>) -> Self {
        Self::new(component, ActorType::System)
    }

    /// Attaches the source address.
    #[must_use]
    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip = Some(ip.into());
        self
    }

    /// Attaches the client user agent.
    #[must_use]
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }
}

/// What an action was performed on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    /// Resource category (e.g. `session`, `signing_key`, `payment`).
    #[serde(rename = "type")]
    pub resource_type: String,
    /// Resource identifier within its category.
    pub id: String,
}

impl Resource {
    /// Creates a resource reference.
    #[must_use]
    pub fn new(resource_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self { resource_type: resource_type.into(), id: id.into() }
    }
}

/// Result of an audited action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// The action completed.
    Success,
    /// The action was refused (bad credentials, policy).
    Failure,
    /// The action could not be evaluated (dependency failure).
    Error,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Failure => write!(f, "failure"),
            Self::Error => write!(f, "error"),
        }
    }
}

impl FromStr for Outcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(Self::Success),
            "failure" => Ok(Self::Failure),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown outcome '{other}'")),
        }
    }
}

/// A security event as reported by a component, before sealing.
///
/// ```
/// use warden_audit::{Actor, ActorType, NewAuditEntry, Outcome, Resource};
///
/// let event = NewAuditEntry::builder()
///     .actor(Actor::new("user-42", ActorType::User).with_ip("203.0.113.9"))
///     .action("session.refresh")
///     .resource(Resource::new("session", "s-1"))
///     .outcome(Outcome::Success)
///     .build();
/// assert!(event.metadata.is_empty());
/// ```
#[derive(Debug, Clone, PartialEq, bon::Builder)]
pub struct NewAuditEntry {
    /// Who acted.
    pub actor: Actor,
    /// Dotted action name (e.g. `token.verify`).
    #[builder(into)]
    pub action: String,
    /// What was acted on.
    pub resource: Resource,
    /// How it ended.
    pub outcome: Outcome,
    /// Free-form context; sorted so that checksums are stable.
    #[builder(default)]
    pub metadata: BTreeMap<String, String>,
    /// Lower bound on the computed risk score.
    pub risk_floor: Option<f64>,
    /// Entry this one corrects.
    pub supersedes: Option<Uuid>,
}

impl NewAuditEntry {
    /// Adds one metadata pair.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.metadata.insert(key.into(), value.to_string());
        self
    }
}

/// A sealed audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuditLogEntry {
    /// Unique entry id.
    pub id: Uuid,
    /// When the engine accepted the event.
    pub timestamp: DateTime<Utc>,
    /// Who acted.
    pub actor: Actor,
    /// Dotted action name.
    pub action: String,
    /// What was acted on.
    pub resource: Resource,
    /// How it ended.
    pub outcome: Outcome,
    /// Risk in `[0, 1]`.
    pub risk_score: f64,
    /// Regimes this entry is relevant to.
    pub compliance_flags: BTreeSet<ComplianceRegime>,
    /// Free-form context.
    pub metadata: BTreeMap<String, String>,
    /// Entry this one corrects.
    pub supersedes: Option<Uuid>,
    /// Hex HMAC-SHA256 over every other field.
    pub integrity_checksum: String,
}

impl AuditLogEntry {
    /// Returns `true` if the checksum still matches the content under `key`.
    #[must_use]
    pub fn verify_checksum(&self, key: &IntegrityKey) -> bool {
        crate::checksum::verify(key, self)
    }
}
