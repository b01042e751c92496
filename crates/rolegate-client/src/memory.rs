use std::sync::{Mutex, MutexGuard};

use rolegate_core::policy::{
    PolicyFilter, PolicyTuple, RolePermissionMapping, UserGroup, UserGroupFilter, WILDCARD,
};
use rolegate_core::sync::{EnforcementEngine, EngineError};

/// One bulk call as the engine received it.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineCall {
    Enforce(PolicyTuple),
    ListPolicies(PolicyFilter),
    CreatePolicies(Vec<PolicyTuple>),
    DeletePolicies(PolicyFilter),
    RemovePolicies(Vec<PolicyTuple>),
    ListUserGroups(UserGroupFilter),
    CreateUserGroups(Vec<UserGroup>),
    DeleteUserGroups(UserGroupFilter),
    RemoveUserGroups(Vec<UserGroup>),
    ListRolePermissionMappings(String),
    CreateRolePermissionMappings(Vec<RolePermissionMapping>),
    DeleteRolePermissionMappings(String),
}

impl EngineCall {
    pub fn rpc_name(&self) -> &'static str {
        match self {
            EngineCall::Enforce(_) => "Enforce",
            EngineCall::ListPolicies(_) => "ListPolicies",
            EngineCall::CreatePolicies(_) => "CreatePolicies",
            EngineCall::DeletePolicies(_) => "DeletePolicies",
            EngineCall::RemovePolicies(_) => "RemovePolicies",
            EngineCall::ListUserGroups(_) => "ListUserGroups",
            EngineCall::CreateUserGroups(_) => "CreateUserGroups",
            EngineCall::DeleteUserGroups(_) => "DeleteUserGroups",
            EngineCall::RemoveUserGroups(_) => "RemoveUserGroups",
            EngineCall::ListRolePermissionMappings(_) => "ListRolePermissionMappings",
            EngineCall::CreateRolePermissionMappings(_) => "CreateRolePermissionMappings",
            EngineCall::DeleteRolePermissionMappings(_) => "DeleteRolePermissionMappings",
        }
    }

    pub fn is_write(&self) -> bool {
        matches!(
            self,
            EngineCall::CreatePolicies(_)
                | EngineCall::DeletePolicies(_)
                | EngineCall::RemovePolicies(_)
                | EngineCall::CreateUserGroups(_)
                | EngineCall::DeleteUserGroups(_)
                | EngineCall::RemoveUserGroups(_)
                | EngineCall::CreateRolePermissionMappings(_)
                | EngineCall::DeleteRolePermissionMappings(_)
        )
    }
}

#[derive(Debug, Default)]
struct EngineState {
    policies: Vec<PolicyTuple>,
    user_groups: Vec<UserGroup>,
    role_permissions: Vec<RolePermissionMapping>,
    calls: Vec<EngineCall>,
    failure: Option<EngineError>,
    failing_call: Option<&'static str>,
}

/// An enforcement engine held in process memory.
///
/// Used when no engine endpoint is configured and as the engine double in
/// tests: every call is recorded, and writes can be made to fail.
#[derive(Debug, Default)]
pub struct InMemoryEngine {
    state: Mutex<EngineState>,
}

impl InMemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, EngineState>, EngineError> {
        self.state
            .lock()
            .map_err(|_| EngineError::Unavailable("engine state lock poisoned".to_string()))
    }

    /// Makes every following write fail with `error` until cleared.
    pub fn fail_writes(&self, error: Option<EngineError>) {
        if let Ok(mut state) = self.state.lock() {
            state.failing_call = None;
            state.failure = error;
        }
    }

    /// Makes the next call to the named RPC fail once, e.g. `"CreatePolicies"`.
    pub fn fail_call(&self, rpc: &'static str, error: EngineError) {
        if let Ok(mut state) = self.state.lock() {
            state.failing_call = Some(rpc);
            state.failure = Some(error);
        }
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        self.state.lock().map(|s| s.calls.clone()).unwrap_or_default()
    }

    pub fn clear_calls(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.calls.clear();
        }
    }

    pub fn policies(&self) -> Vec<PolicyTuple> {
        self.state
            .lock()
            .map(|s| s.policies.clone())
            .unwrap_or_default()
    }

    pub fn user_groups(&self) -> Vec<UserGroup> {
        self.state
            .lock()
            .map(|s| s.user_groups.clone())
            .unwrap_or_default()
    }

    fn record(&self, call: EngineCall) -> Result<MutexGuard<'_, EngineState>, EngineError> {
        let mut state = self.state()?;
        let targeted = state.failing_call == Some(call.rpc_name());
        let fails = targeted || (state.failing_call.is_none() && call.is_write());
        state.calls.push(call);
        if fails && let Some(err) = state.failure.clone() {
            if targeted {
                state.failing_call = None;
                state.failure = None;
            }
            return Err(err);
        }
        Ok(state)
    }
}

fn scope_matches(policy: &str, requested: &str) -> bool {
    policy == WILDCARD || policy == requested
}

fn action_matches(policy: &str, requested: &str) -> bool {
    policy.is_empty() || scope_matches(policy, requested)
}

impl EngineState {
    fn subjects_for(&self, sub: &str, org: &str) -> Vec<String> {
        let mut subjects = vec![sub.to_string()];
        subjects.extend(
            self.user_groups
                .iter()
                .filter(|ug| ug.user == sub && scope_matches(&ug.org, org))
                .map(|ug| ug.grp.clone()),
        );
        subjects
    }

    // `obj` in a request is either a role name or a permission the role carries.
    fn object_matches(&self, role: &str, requested: &str) -> bool {
        if role == requested {
            return true;
        }
        self.role_permissions
            .iter()
            .filter(|m| m.role == role)
            .any(|m| m.permissions.iter().any(|p| p == requested || p == WILDCARD))
    }

    fn enforce(&self, request: &PolicyTuple) -> bool {
        let subjects = self.subjects_for(&request.sub, &request.org);
        self.policies.iter().any(|p| {
            subjects.contains(&p.sub)
                && scope_matches(&p.ns, &request.ns)
                && scope_matches(&p.proj, &request.proj)
                && scope_matches(&p.org, &request.org)
                && self.object_matches(&p.obj, &request.obj)
                && action_matches(&p.act, &request.act)
        })
    }
}

impl EnforcementEngine for InMemoryEngine {
    async fn enforce(&self, request: &PolicyTuple) -> Result<bool, EngineError> {
        let state = self.record(EngineCall::Enforce(request.clone()))?;
        Ok(state.enforce(request))
    }

    async fn list_policies(&self, filter: &PolicyFilter) -> Result<Vec<PolicyTuple>, EngineError> {
        let state = self.record(EngineCall::ListPolicies(filter.clone()))?;
        Ok(state
            .policies
            .iter()
            .filter(|p| filter.matches(p))
            .cloned()
            .collect())
    }

    async fn create_policies(&self, policies: &[PolicyTuple]) -> Result<(), EngineError> {
        let mut state = self.record(EngineCall::CreatePolicies(policies.to_vec()))?;
        for policy in policies {
            if !state.policies.contains(policy) {
                state.policies.push(policy.clone());
            }
        }
        Ok(())
    }

    async fn delete_policies(&self, filter: &PolicyFilter) -> Result<(), EngineError> {
        let mut state = self.record(EngineCall::DeletePolicies(filter.clone()))?;
        state.policies.retain(|p| !filter.matches(p));
        Ok(())
    }

    async fn remove_policies(&self, policies: &[PolicyTuple]) -> Result<(), EngineError> {
        let mut state = self.record(EngineCall::RemovePolicies(policies.to_vec()))?;
        state.policies.retain(|p| !policies.contains(p));
        Ok(())
    }

    async fn list_user_groups(
        &self,
        filter: &UserGroupFilter,
    ) -> Result<Vec<UserGroup>, EngineError> {
        let state = self.record(EngineCall::ListUserGroups(filter.clone()))?;
        Ok(state
            .user_groups
            .iter()
            .filter(|ug| filter.matches(ug))
            .cloned()
            .collect())
    }

    async fn create_user_groups(&self, user_groups: &[UserGroup]) -> Result<(), EngineError> {
        let mut state = self.record(EngineCall::CreateUserGroups(user_groups.to_vec()))?;
        for user_group in user_groups {
            if !state.user_groups.contains(user_group) {
                state.user_groups.push(user_group.clone());
            }
        }
        Ok(())
    }

    async fn delete_user_groups(&self, filter: &UserGroupFilter) -> Result<(), EngineError> {
        let mut state = self.record(EngineCall::DeleteUserGroups(filter.clone()))?;
        state.user_groups.retain(|ug| !filter.matches(ug));
        Ok(())
    }

    async fn remove_user_groups(&self, user_groups: &[UserGroup]) -> Result<(), EngineError> {
        let mut state = self.record(EngineCall::RemoveUserGroups(user_groups.to_vec()))?;
        state.user_groups.retain(|ug| !user_groups.contains(ug));
        Ok(())
    }

    async fn list_role_permission_mappings(
        &self,
        role: &str,
    ) -> Result<Vec<RolePermissionMapping>, EngineError> {
        let state = self.record(EngineCall::ListRolePermissionMappings(role.to_string()))?;
        Ok(state
            .role_permissions
            .iter()
            .filter(|m| role.is_empty() || m.role == role)
            .cloned()
            .collect())
    }

    async fn create_role_permission_mappings(
        &self,
        mappings: &[RolePermissionMapping],
    ) -> Result<(), EngineError> {
        let mut state =
            self.record(EngineCall::CreateRolePermissionMappings(mappings.to_vec()))?;
        for mapping in mappings {
            match state.role_permissions.iter_mut().find(|m| m.role == mapping.role) {
                Some(existing) => {
                    for permission in &mapping.permissions {
                        if !existing.permissions.contains(permission) {
                            existing.permissions.push(permission.clone());
                        }
                    }
                }
                None => state.role_permissions.push(mapping.clone()),
            }
        }
        Ok(())
    }

    async fn delete_role_permission_mappings(&self, role: &str) -> Result<(), EngineError> {
        let mut state =
            self.record(EngineCall::DeleteRolePermissionMappings(role.to_string()))?;
        state
            .role_permissions
            .retain(|m| !(role.is_empty() || m.role == role));
        Ok(())
    }
}
