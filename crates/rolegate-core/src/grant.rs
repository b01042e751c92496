use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub const WILDCARD: &str = "*";

/// A scope field of a grant: either a named container or "any".
///
/// `Any` is only rendered as `*` when a value crosses the enforcement engine
/// boundary; everywhere else the distinction stays in the type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ScopeValue {
    Specific(String),
    Any,
}

impl ScopeValue {
    pub fn specific(name: impl Into<String>) -> Self {
        Self::Specific(name.into())
    }

    /// A row referenced a project or namespace that no longer resolves.
    pub fn unresolved() -> Self {
        Self::Specific(String::new())
    }

    pub fn from_optional(name: Option<String>) -> Self {
        match name {
            Some(name) => Self::Specific(name),
            None => Self::Any,
        }
    }

    pub fn is_any(&self) -> bool {
        matches!(self, Self::Any)
    }

    pub fn is_unresolved(&self) -> bool {
        matches!(self, Self::Specific(name) if name.is_empty())
    }

    pub fn as_specific(&self) -> Option<&str> {
        match self {
            Self::Specific(name) => Some(name),
            Self::Any => None,
        }
    }

    pub fn as_wire(&self) -> &str {
        match self {
            Self::Specific(name) => name,
            Self::Any => WILDCARD,
        }
    }

    /// The name shown to API callers. A dangling reference reads as `*`.
    pub fn for_display(&self) -> &str {
        match self {
            Self::Specific(name) if !name.is_empty() => name,
            _ => WILDCARD,
        }
    }
}

impl fmt::Display for ScopeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_wire())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SubjectKind {
    Account,
    Group,
}

impl SubjectKind {
    pub fn prefix(&self) -> &'static str {
        match self {
            SubjectKind::Account => "u",
            SubjectKind::Group => "g",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SubjectKind::Account => "account",
            SubjectKind::Group => "group",
        }
    }
}

impl FromStr for SubjectKind {
    type Err = GrantError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "account" => Ok(SubjectKind::Account),
            "group" => Ok(SubjectKind::Group),
            other => Err(GrantError::UnknownSubjectKind(other.to_string())),
        }
    }
}

/// Breadth at which a single grant applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum GrantScope {
    System,
    Project,
    Namespace,
}

impl GrantScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            GrantScope::System => "system",
            GrantScope::Project => "project",
            GrantScope::Namespace => "namespace",
        }
    }
}

impl FromStr for GrantScope {
    type Err = GrantError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "system" => Ok(GrantScope::System),
            "project" => Ok(GrantScope::Project),
            "namespace" => Ok(GrantScope::Namespace),
            other => Err(GrantError::UnknownScope(other.to_string())),
        }
    }
}

/// The `scope` attribute carried by a role definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoleScope {
    System,
    Organization,
    Project,
}

impl RoleScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoleScope::System => "system",
            RoleScope::Organization => "organization",
            RoleScope::Project => "project",
        }
    }
}

impl fmt::Display for RoleScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RoleScope {
    type Err = GrantError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "system" => Ok(RoleScope::System),
            "organization" => Ok(RoleScope::Organization),
            "project" => Ok(RoleScope::Project),
            other => Err(GrantError::UnknownScope(other.to_string())),
        }
    }
}

/// One of the six (subject kind x scope) combinations a grant can take.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GrantShape {
    pub subject: SubjectKind,
    pub scope: GrantScope,
}

impl GrantShape {
    pub const fn new(subject: SubjectKind, scope: GrantScope) -> Self {
        Self { subject, scope }
    }

    /// Group shapes first, then account shapes; system, project, namespace
    /// within each.
    pub const RESOLUTION_ORDER: [GrantShape; 6] = [
        GrantShape::new(SubjectKind::Group, GrantScope::System),
        GrantShape::new(SubjectKind::Group, GrantScope::Project),
        GrantShape::new(SubjectKind::Group, GrantScope::Namespace),
        GrantShape::new(SubjectKind::Account, GrantScope::System),
        GrantShape::new(SubjectKind::Account, GrantScope::Project),
        GrantShape::new(SubjectKind::Account, GrantScope::Namespace),
    ];
}

impl fmt::Display for GrantShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.subject.as_str(), self.scope.as_str())
    }
}

/// A resolved `(role, project, namespace)` triple and the path it came from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoleGrant {
    pub shape: GrantShape,
    pub group: Option<String>,
    pub role: String,
    pub project: ScopeValue,
    pub namespace: ScopeValue,
}

impl RoleGrant {
    pub fn key(&self) -> (&str, &ScopeValue, &ScopeValue) {
        (&self.role, &self.project, &self.namespace)
    }

    pub fn via_group(&self) -> bool {
        self.shape.subject == SubjectKind::Group
    }
}

impl fmt::Display for RoleGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}/{}", self.role, self.project, self.namespace)?;
        if let Some(ref group) = self.group {
            write!(f, " via {group}")?;
        }
        Ok(())
    }
}

/// A role assignment as requested by a caller, before any lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleBinding {
    #[serde(default)]
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl RoleBinding {
    pub fn new(role: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            project: None,
            namespace: None,
        }
    }

    pub fn in_project(mut self, project: impl Into<String>) -> Self {
        self.project = Some(project.into());
        self
    }

    pub fn in_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn project(&self) -> Option<&str> {
        self.project.as_deref().filter(|p| !p.trim().is_empty())
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref().filter(|n| !n.trim().is_empty())
    }

    /// Checks the binding's shape and returns the scope it will be stored at.
    pub fn validate(&self) -> Result<GrantScope, GrantError> {
        if self.role.trim().is_empty() {
            return Err(GrantError::MissingRole);
        }
        match (self.project(), self.namespace()) {
            (None, Some(namespace)) => Err(GrantError::NamespaceWithoutProject {
                role: self.role.clone(),
                namespace: namespace.to_string(),
            }),
            (Some(_), Some(_)) => Ok(GrantScope::Namespace),
            (Some(_), None) => Ok(GrantScope::Project),
            (None, None) => Ok(GrantScope::System),
        }
    }

    /// Checks the binding against the scope of the role it names.
    pub fn check_role_scope(&self, role_scope: RoleScope) -> Result<GrantScope, GrantError> {
        let scope = self.validate()?;
        match (role_scope, scope) {
            (RoleScope::Project, GrantScope::System) => Err(GrantError::ProjectRequired {
                role: self.role.clone(),
            }),
            (RoleScope::System | RoleScope::Organization, GrantScope::Project)
            | (RoleScope::System | RoleScope::Organization, GrantScope::Namespace) => {
                Err(GrantError::ProjectNotAllowed {
                    role: self.role.clone(),
                    scope: role_scope,
                })
            }
            _ => Ok(scope),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GrantError {
    #[error("role binding must name a role")]
    MissingRole,

    #[error("role '{role}' names namespace '{namespace}' without a project")]
    NamespaceWithoutProject { role: String, namespace: String },

    #[error("role '{role}' is project scoped and requires a project")]
    ProjectRequired { role: String },

    #[error("role '{role}' has {scope} scope and cannot be bound to a project")]
    ProjectNotAllowed { role: String, scope: RoleScope },

    #[error("unknown scope: {0}")]
    UnknownScope(String),

    #[error("unknown subject kind: {0}")]
    UnknownSubjectKind(String),
}
