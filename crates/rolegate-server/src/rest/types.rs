use rolegate_core::grant::{RoleBinding, RoleGrant};
use rolegate_core::sync::SyncReport;
use rolegate_storage::IdentityTraits;
use serde::{Deserialize, Serialize};

use crate::service::{GroupRoles, PermissionGrant, User, UserInfo, UserInput, UserList, UserUpdate};

#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    pub name: String,
    #[serde(flatten)]
    pub profile: IdentityTraits,
    #[serde(default)]
    pub roles: Vec<RoleBinding>,
    #[serde(default)]
    pub groups: Vec<String>,
}

impl From<CreateUserRequest> for UserInput {
    fn from(req: CreateUserRequest) -> Self {
        UserInput {
            name: req.name,
            traits: req.profile,
            roles: req.roles,
            groups: req.groups,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct UpdateUserRequest {
    #[serde(flatten)]
    pub profile: IdentityTraits,
    #[serde(default)]
    pub roles: Vec<RoleBinding>,
    #[serde(default)]
    pub groups: Vec<String>,
}

impl From<UpdateUserRequest> for UserUpdate {
    fn from(req: UpdateUserRequest) -> Self {
        UserUpdate {
            traits: req.profile,
            roles: req.roles,
            groups: req.groups,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct GrantResponse {
    pub role: String,
    pub project: String,
    pub namespace: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
}

impl From<RoleGrant> for GrantResponse {
    fn from(grant: RoleGrant) -> Self {
        GrantResponse {
            role: grant.role,
            project: grant.project.for_display().to_string(),
            namespace: grant.namespace.for_display().to_string(),
            group: grant.group,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct UserResponse {
    pub id: String,
    pub name: String,
    pub partner: String,
    pub organization: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub description: String,
    pub groups: Vec<String>,
    pub roles: Vec<GrantResponse>,
}

impl From<User> for UserResponse {
    fn from(user: User) -> Self {
        UserResponse {
            id: user.id.to_string(),
            name: user.name,
            partner: user.partner,
            organization: user.organization,
            email: user.traits.email,
            first_name: user.traits.first_name,
            last_name: user.traits.last_name,
            description: user.traits.description,
            groups: user.groups,
            roles: user.grants.into_iter().map(GrantResponse::from).collect(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct UserListResponse {
    pub count: usize,
    pub items: Vec<UserResponse>,
}

impl From<UserList> for UserListResponse {
    fn from(list: UserList) -> Self {
        UserListResponse {
            count: list.count,
            items: list.items.into_iter().map(UserResponse::from).collect(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PermissionResponse {
    pub role: String,
    pub project: String,
    pub namespace: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    pub permissions: Vec<String>,
}

impl From<PermissionGrant> for PermissionResponse {
    fn from(grant: PermissionGrant) -> Self {
        PermissionResponse {
            role: grant.role,
            project: grant.project,
            namespace: grant.namespace,
            group: grant.group,
            permissions: grant.permissions,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct UserInfoResponse {
    pub name: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub organization: String,
    pub partner: String,
    pub groups: Vec<String>,
    pub permissions: Vec<PermissionResponse>,
}

impl From<UserInfo> for UserInfoResponse {
    fn from(info: UserInfo) -> Self {
        UserInfoResponse {
            name: info.name,
            email: info.email,
            first_name: info.first_name,
            last_name: info.last_name,
            organization: info.organization,
            partner: info.partner,
            groups: info.groups,
            permissions: info
                .permissions
                .into_iter()
                .map(PermissionResponse::from)
                .collect(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ReconcileResponse {
    pub created: usize,
    pub pruned: usize,
    pub skipped: usize,
}

impl From<SyncReport> for ReconcileResponse {
    fn from(report: SyncReport) -> Self {
        ReconcileResponse {
            created: report.created,
            pruned: report.pruned,
            skipped: report.skipped,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct GroupRolesRequest {
    #[serde(default)]
    pub roles: Vec<RoleBinding>,
}

#[derive(Debug, Serialize)]
pub struct GroupRolesResponse {
    pub group: String,
    pub roles: Vec<RoleBinding>,
}

impl From<GroupRoles> for GroupRolesResponse {
    fn from(roles: GroupRoles) -> Self {
        GroupRolesResponse {
            group: roles.group,
            roles: roles.roles,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}
