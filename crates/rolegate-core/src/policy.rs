use std::fmt;

use crate::grant::{RoleGrant, SubjectKind};
use crate::ids::{AccountId, GroupId};

pub use crate::grant::WILDCARD;

/// Builds the engine subject string for an account or group.
pub fn subject_for(kind: SubjectKind, id: impl fmt::Display) -> String {
    format!("{}:{id}", kind.prefix())
}

pub fn account_subject(account: &AccountId) -> String {
    subject_for(SubjectKind::Account, account)
}

pub fn group_subject(group: &GroupId) -> String {
    subject_for(SubjectKind::Group, group)
}

/// The enforcement engine's native permission record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PolicyTuple {
    pub sub: String,
    pub ns: String,
    pub proj: String,
    pub org: String,
    pub obj: String,
    pub act: String,
}

impl PolicyTuple {
    /// Renders a grant held by `account` in `organization`. Unset scope
    /// fields become the wildcard and `act` stays empty.
    pub fn for_grant(account: &AccountId, organization: &str, grant: &RoleGrant) -> Self {
        Self {
            sub: account_subject(account),
            ns: grant.namespace.as_wire().to_string(),
            proj: grant.project.as_wire().to_string(),
            org: organization.to_string(),
            obj: grant.role.clone(),
            act: String::new(),
        }
    }
}

impl fmt::Display for PolicyTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "p, {}, {}, {}, {}, {}, {}",
            self.sub, self.ns, self.proj, self.org, self.obj, self.act
        )
    }
}

/// Selects policy tuples. Empty fields match any value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PolicyFilter {
    pub sub: String,
    pub ns: String,
    pub proj: String,
    pub org: String,
    pub obj: String,
    pub act: String,
}

impl PolicyFilter {
    pub fn for_subject(sub: impl Into<String>) -> Self {
        Self {
            sub: sub.into(),
            ..Default::default()
        }
    }

    pub fn matches(&self, tuple: &PolicyTuple) -> bool {
        field_matches(&self.sub, &tuple.sub)
            && field_matches(&self.ns, &tuple.ns)
            && field_matches(&self.proj, &tuple.proj)
            && field_matches(&self.org, &tuple.org)
            && field_matches(&self.obj, &tuple.obj)
            && field_matches(&self.act, &tuple.act)
    }
}

fn field_matches(filter: &str, value: &str) -> bool {
    filter.is_empty() || filter == value
}

/// Mirrors one group membership into the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UserGroup {
    pub user: String,
    pub grp: String,
    pub org: String,
}

impl UserGroup {
    pub fn new(account: &AccountId, group: &GroupId, organization: &str) -> Self {
        Self {
            user: account_subject(account),
            grp: group_subject(group),
            org: organization.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserGroupFilter {
    pub user: String,
    pub grp: String,
    pub org: String,
}

impl UserGroupFilter {
    pub fn for_user(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            ..Default::default()
        }
    }

    pub fn matches(&self, user_group: &UserGroup) -> bool {
        field_matches(&self.user, &user_group.user)
            && field_matches(&self.grp, &user_group.grp)
            && field_matches(&self.org, &user_group.org)
    }
}

/// The permissions a role carries, as the engine sees them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RolePermissionMapping {
    pub role: String,
    pub permissions: Vec<String>,
}

impl RolePermissionMapping {
    pub fn new(role: impl Into<String>, permissions: Vec<String>) -> Self {
        Self {
            role: role.into(),
            permissions,
        }
    }
}
