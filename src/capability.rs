//! Resource/ability model for session authorizations
//!
//! A session authorization grants a set of `(resource, ability)` pairs. Resources
//! are addressed by URI (`lit-pkp://*`, `lit-litaction://<cid>`, ...) and a `*` id
//! matches every resource of the same kind.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use thiserror::Error;

/// Wildcard resource id
pub const WILDCARD: &str = "*";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScopeError {
    #[error("Invalid resource: {0}")]
    InvalidResource(String),

    #[error("Invalid ability: {0}")]
    InvalidAbility(String),

    #[error("Ability {ability} cannot be requested on {resource}")]
    Incompatible { resource: String, ability: String },
}

/// Kinds of resources the network can grant access to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Pkp,
    LitAction,
    AccessControlCondition,
    PaymentDelegation,
}

impl ResourceKind {
    /// URI scheme prefix
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Pkp => "lit-pkp",
            ResourceKind::LitAction => "lit-litaction",
            ResourceKind::AccessControlCondition => "lit-accesscontrolcondition",
            ResourceKind::PaymentDelegation => "lit-paymentdelegation",
        }
    }
}

impl std::str::FromStr for ResourceKind {
    type Err = ScopeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lit-pkp" => Ok(ResourceKind::Pkp),
            "lit-litaction" => Ok(ResourceKind::LitAction),
            "lit-accesscontrolcondition" => Ok(ResourceKind::AccessControlCondition),
            "lit-paymentdelegation" => Ok(ResourceKind::PaymentDelegation),
            _ => Err(ScopeError::InvalidResource(s.to_string())),
        }
    }
}

/// A resource addressed by kind and id
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Resource {
    pub kind: ResourceKind,
    pub id: String,
}

impl Resource {
    pub fn new(kind: ResourceKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }

    pub fn pkp(id: impl Into<String>) -> Self {
        Self::new(ResourceKind::Pkp, id)
    }

    pub fn lit_action(id: impl Into<String>) -> Self {
        Self::new(ResourceKind::LitAction, id)
    }

    pub fn access_control_condition(id: impl Into<String>) -> Self {
        Self::new(ResourceKind::AccessControlCondition, id)
    }

    pub fn is_wildcard(&self) -> bool {
        self.id == WILDCARD
    }

    /// Whether this (granted) resource covers `other`
    pub fn matches(&self, other: &Resource) -> bool {
        self.kind == other.kind && (self.is_wildcard() || self.id == other.id)
    }

    pub fn uri(&self) -> String {
        format!("{}://{}", self.kind.as_str(), self.id)
    }
}

impl std::fmt::Display for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.uri())
    }
}

impl std::str::FromStr for Resource {
    type Err = ScopeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scheme, id) = s
            .split_once("://")
            .ok_or_else(|| ScopeError::InvalidResource(s.to_string()))?;
        if id.is_empty() {
            return Err(ScopeError::InvalidResource(s.to_string()));
        }
        Ok(Resource::new(scheme.parse()?, id))
    }
}

impl Serialize for Resource {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.uri())
    }
}

impl<'de> Deserialize<'de> for Resource {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Abilities that can be exercised on a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Ability {
    /// Sign with a PKP
    PkpSigning,
    /// Run a Lit Action
    LitActionExecution,
    AccessControlConditionDecryption,
    AccessControlConditionSigning,
    /// Spend a delegated capacity credit
    PaymentDelegationAuth,
}

impl Ability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Ability::PkpSigning => "pkp-signing",
            Ability::LitActionExecution => "lit-action-execution",
            Ability::AccessControlConditionDecryption => "access-control-condition-decryption",
            Ability::AccessControlConditionSigning => "access-control-condition-signing",
            Ability::PaymentDelegationAuth => "lit-payment-delegation",
        }
    }

    /// The resource kind this ability applies to
    pub fn resource_kind(&self) -> ResourceKind {
        match self {
            Ability::PkpSigning => ResourceKind::Pkp,
            Ability::LitActionExecution => ResourceKind::LitAction,
            Ability::AccessControlConditionDecryption | Ability::AccessControlConditionSigning => {
                ResourceKind::AccessControlCondition
            }
            Ability::PaymentDelegationAuth => ResourceKind::PaymentDelegation,
        }
    }

    /// ReCap `namespace/name` pair used when the ability is rendered into a
    /// sign-in message
    pub fn recap(&self) -> (&'static str, &'static str) {
        match self {
            Ability::PkpSigning => ("Threshold", "Signing"),
            Ability::LitActionExecution => ("Threshold", "Execution"),
            Ability::AccessControlConditionDecryption => ("Threshold", "Decryption"),
            Ability::AccessControlConditionSigning => ("Threshold", "Signing"),
            Ability::PaymentDelegationAuth => ("Auth", "Auth"),
        }
    }
}

impl std::str::FromStr for Ability {
    type Err = ScopeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pkp-signing" => Ok(Ability::PkpSigning),
            "lit-action-execution" => Ok(Ability::LitActionExecution),
            "access-control-condition-decryption" => Ok(Ability::AccessControlConditionDecryption),
            "access-control-condition-signing" => Ok(Ability::AccessControlConditionSigning),
            "lit-payment-delegation" => Ok(Ability::PaymentDelegationAuth),
            _ => Err(ScopeError::InvalidAbility(s.to_string())),
        }
    }
}

impl std::fmt::Display for Ability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Ability {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Ability {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A single `(resource, ability)` pair
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceAbilityRequest {
    pub resource: Resource,
    pub ability: Ability,
}

impl ResourceAbilityRequest {
    pub fn new(resource: Resource, ability: Ability) -> Result<Self, ScopeError> {
        if ability.resource_kind() != resource.kind {
            return Err(ScopeError::Incompatible {
                resource: resource.uri(),
                ability: ability.as_str().to_string(),
            });
        }
        Ok(Self { resource, ability })
    }

    pub fn pkp_signing(id: impl Into<String>) -> Self {
        Self {
            resource: Resource::pkp(id),
            ability: Ability::PkpSigning,
        }
    }

    pub fn lit_action_execution(id: impl Into<String>) -> Self {
        Self {
            resource: Resource::lit_action(id),
            ability: Ability::LitActionExecution,
        }
    }

    pub fn decryption(id: impl Into<String>) -> Self {
        Self {
            resource: Resource::access_control_condition(id),
            ability: Ability::AccessControlConditionDecryption,
        }
    }

    /// Whether this (granted) pair covers the `required` one
    pub fn covers(&self, required: &ResourceAbilityRequest) -> bool {
        self.ability == required.ability && self.resource.matches(&required.resource)
    }
}

impl std::fmt::Display for ResourceAbilityRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} on {}", self.ability, self.resource)
    }
}

/// A set of resource/ability pairs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Scope {
    requests: BTreeSet<ResourceAbilityRequest>,
}

impl Scope {
    pub fn new() -> Self {
        Self::default()
    }

    /// PKP signing and Lit Action execution on every resource
    pub fn signing_and_execution() -> Self {
        vec![
            ResourceAbilityRequest::pkp_signing(WILDCARD),
            ResourceAbilityRequest::lit_action_execution(WILDCARD),
        ]
        .into()
    }

    /// Decryption of anything gated by access control conditions
    pub fn decryption() -> Self {
        vec![ResourceAbilityRequest::decryption(WILDCARD)].into()
    }

    pub fn add(&mut self, request: ResourceAbilityRequest) {
        self.requests.insert(request);
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ResourceAbilityRequest> {
        self.requests.iter()
    }

    pub fn covers(&self, required: &ResourceAbilityRequest) -> bool {
        self.requests.iter().any(|granted| granted.covers(required))
    }

    /// Required pairs this scope does not cover
    pub fn missing<'a>(
        &self,
        required: impl IntoIterator<Item = &'a ResourceAbilityRequest>,
    ) -> Vec<ResourceAbilityRequest> {
        required
            .into_iter()
            .filter(|r| !self.covers(r))
            .cloned()
            .collect()
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parts: Vec<String> = self.requests.iter().map(|r| r.to_string()).collect();
        write!(f, "{{{}}}", parts.join(", "))
    }
}

impl From<Vec<ResourceAbilityRequest>> for Scope {
    fn from(requests: Vec<ResourceAbilityRequest>) -> Self {
        Self {
            requests: requests.into_iter().collect(),
        }
    }
}

impl FromIterator<ResourceAbilityRequest> for Scope {
    fn from_iter<T: IntoIterator<Item = ResourceAbilityRequest>>(iter: T) -> Self {
        Self {
            requests: iter.into_iter().collect(),
        }
    }
}
