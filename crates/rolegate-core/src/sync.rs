use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use crate::grant::RoleGrant;
use crate::ids::{AccountId, GroupId};
use crate::policy::{
    PolicyFilter, PolicyTuple, RolePermissionMapping, UserGroup, UserGroupFilter,
    account_subject,
};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("enforcement engine unavailable: {0}")]
    Unavailable(String),

    #[error("enforcement engine rejected request: {0}")]
    Rejected(String),
}

/// The external policy store and matcher.
///
/// Every write is a single bulk call. `create_*` calls are set inserts:
/// pushing a tuple that already exists is not an error.
pub trait EnforcementEngine: Send + Sync {
    fn enforce(
        &self,
        request: &PolicyTuple,
    ) -> impl Future<Output = Result<bool, EngineError>> + Send;

    fn list_policies(
        &self,
        filter: &PolicyFilter,
    ) -> impl Future<Output = Result<Vec<PolicyTuple>, EngineError>> + Send;

    fn create_policies(
        &self,
        policies: &[PolicyTuple],
    ) -> impl Future<Output = Result<(), EngineError>> + Send;

    fn delete_policies(
        &self,
        filter: &PolicyFilter,
    ) -> impl Future<Output = Result<(), EngineError>> + Send;

    /// Removes exactly the given tuples in one call.
    fn remove_policies(
        &self,
        policies: &[PolicyTuple],
    ) -> impl Future<Output = Result<(), EngineError>> + Send;

    fn list_user_groups(
        &self,
        filter: &UserGroupFilter,
    ) -> impl Future<Output = Result<Vec<UserGroup>, EngineError>> + Send;

    fn create_user_groups(
        &self,
        user_groups: &[UserGroup],
    ) -> impl Future<Output = Result<(), EngineError>> + Send;

    fn delete_user_groups(
        &self,
        filter: &UserGroupFilter,
    ) -> impl Future<Output = Result<(), EngineError>> + Send;

    fn remove_user_groups(
        &self,
        user_groups: &[UserGroup],
    ) -> impl Future<Output = Result<(), EngineError>> + Send;

    /// An empty `role` lists every mapping.
    fn list_role_permission_mappings(
        &self,
        role: &str,
    ) -> impl Future<Output = Result<Vec<RolePermissionMapping>, EngineError>> + Send;

    fn create_role_permission_mappings(
        &self,
        mappings: &[RolePermissionMapping],
    ) -> impl Future<Output = Result<(), EngineError>> + Send;

    fn delete_role_permission_mappings(
        &self,
        role: &str,
    ) -> impl Future<Output = Result<(), EngineError>> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Make the engine hold exactly the tuples derived from the grants.
    Replace,
    /// Drop every tuple for the account's subject.
    Delete,
}

#[derive(Debug, thiserror::Error)]
#[error("{operation} failed: {source}")]
pub struct SyncError {
    pub operation: &'static str,
    #[source]
    pub source: EngineError,
}

impl SyncError {
    fn at(operation: &'static str) -> impl FnOnce(EngineError) -> Self {
        move |source| Self { operation, source }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub created: usize,
    pub pruned: usize,
    pub skipped: usize,
}

/// Engine writes made while serving one request.
///
/// Only records that were absent before a create, or present before a
/// remove, are kept, so reverting touches nothing the request did not
/// change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncJournal {
    policies_created: Vec<PolicyTuple>,
    policies_removed: Vec<PolicyTuple>,
    groups_created: Vec<UserGroup>,
    groups_removed: Vec<UserGroup>,
}

impl SyncJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.policies_created.is_empty()
            && self.policies_removed.is_empty()
            && self.groups_created.is_empty()
            && self.groups_removed.is_empty()
    }
}

/// Pushes resolved grants into the enforcement engine.
pub struct PolicySynchronizer<E: EnforcementEngine> {
    engine: Arc<E>,
}

impl<E: EnforcementEngine> PolicySynchronizer<E> {
    pub fn new(engine: Arc<E>) -> Self {
        Self { engine }
    }

    /// Derives the tuple set for `grants`, keeping first-seen order and
    /// skipping grants whose project or namespace no longer resolves.
    pub fn desired_policies(
        account: &AccountId,
        organization: &str,
        grants: &[RoleGrant],
    ) -> (Vec<PolicyTuple>, usize) {
        let mut seen = HashSet::new();
        let mut policies = Vec::with_capacity(grants.len());
        let mut skipped = 0;
        for grant in grants {
            if grant.project.is_unresolved() || grant.namespace.is_unresolved() {
                tracing::warn!(
                    account = %account,
                    grant = %grant,
                    "skipping grant with dangling scope reference"
                );
                skipped += 1;
                continue;
            }
            let tuple = PolicyTuple::for_grant(account, organization, grant);
            if seen.insert(tuple.clone()) {
                policies.push(tuple);
            }
        }
        (policies, skipped)
    }

    /// Brings the engine's tuples for `account` in line with `grants`.
    ///
    /// Replace creates the full desired set before removing stale tuples,
    /// so a failed call never leaves the account with fewer grants than it
    /// held before. Every write that lands is recorded in `journal`.
    pub async fn sync(
        &self,
        account: &AccountId,
        organization: &str,
        grants: &[RoleGrant],
        mode: SyncMode,
        journal: &mut SyncJournal,
    ) -> Result<SyncReport, SyncError> {
        let subject = account_subject(account);
        let filter = PolicyFilter::for_subject(subject.clone());
        let current = self
            .engine
            .list_policies(&filter)
            .await
            .map_err(SyncError::at("ListPolicies"))?;

        match mode {
            SyncMode::Delete => {
                self.engine
                    .delete_policies(&filter)
                    .await
                    .map_err(SyncError::at("DeletePolicies"))?;
                let pruned = current.len();
                journal.policies_removed.extend(current);
                tracing::debug!(subject = %subject, pruned, "dropped all policies");
                Ok(SyncReport {
                    pruned,
                    ..SyncReport::default()
                })
            }
            SyncMode::Replace => {
                let (desired, skipped) = Self::desired_policies(account, organization, grants);
                let wanted: HashSet<&PolicyTuple> = desired.iter().collect();
                let held: HashSet<&PolicyTuple> = current.iter().collect();

                if !desired.is_empty() {
                    self.engine
                        .create_policies(&desired)
                        .await
                        .map_err(SyncError::at("CreatePolicies"))?;
                    journal.policies_created.extend(
                        desired.iter().filter(|t| !held.contains(t)).cloned(),
                    );
                }

                let stale: Vec<PolicyTuple> = current
                    .iter()
                    .filter(|t| !wanted.contains(t))
                    .cloned()
                    .collect();
                if !stale.is_empty() {
                    self.engine
                        .remove_policies(&stale)
                        .await
                        .map_err(SyncError::at("RemovePolicies"))?;
                }
                let pruned = stale.len();
                journal.policies_removed.extend(stale);

                tracing::debug!(
                    subject = %subject,
                    created = desired.len(),
                    pruned,
                    skipped,
                    "replaced policies"
                );
                Ok(SyncReport {
                    created: desired.len(),
                    pruned,
                    skipped,
                })
            }
        }
    }

    /// Mirrors the account's group memberships into the engine.
    pub async fn sync_memberships(
        &self,
        account: &AccountId,
        organization: &str,
        groups: &[GroupId],
        mode: SyncMode,
        journal: &mut SyncJournal,
    ) -> Result<(), SyncError> {
        let filter = UserGroupFilter::for_user(account_subject(account));
        let current = self
            .engine
            .list_user_groups(&filter)
            .await
            .map_err(SyncError::at("ListUserGroups"))?;

        if mode == SyncMode::Delete {
            self.engine
                .delete_user_groups(&filter)
                .await
                .map_err(SyncError::at("DeleteUserGroups"))?;
            journal.groups_removed.extend(current);
            return Ok(());
        }

        let desired: Vec<UserGroup> = groups
            .iter()
            .map(|group| UserGroup::new(account, group, organization))
            .collect();

        let missing: Vec<UserGroup> = desired
            .iter()
            .filter(|ug| !current.contains(ug))
            .cloned()
            .collect();
        if !missing.is_empty() {
            self.engine
                .create_user_groups(&missing)
                .await
                .map_err(SyncError::at("CreateUserGroups"))?;
            journal.groups_created.extend(missing);
        }

        let stale: Vec<UserGroup> = current
            .into_iter()
            .filter(|ug| !desired.contains(ug))
            .collect();
        if !stale.is_empty() {
            self.engine
                .remove_user_groups(&stale)
                .await
                .map_err(SyncError::at("RemoveUserGroups"))?;
            journal.groups_removed.extend(stale);
        }
        Ok(())
    }

    /// Undoes the writes in `journal`, restoring removed records before
    /// dropping created ones.
    pub async fn revert(&self, journal: SyncJournal) -> Result<(), SyncError> {
        if !journal.policies_removed.is_empty() {
            self.engine
                .create_policies(&journal.policies_removed)
                .await
                .map_err(SyncError::at("CreatePolicies"))?;
        }
        if !journal.policies_created.is_empty() {
            self.engine
                .remove_policies(&journal.policies_created)
                .await
                .map_err(SyncError::at("RemovePolicies"))?;
        }
        if !journal.groups_removed.is_empty() {
            self.engine
                .create_user_groups(&journal.groups_removed)
                .await
                .map_err(SyncError::at("CreateUserGroups"))?;
        }
        if !journal.groups_created.is_empty() {
            self.engine
                .remove_user_groups(&journal.groups_created)
                .await
                .map_err(SyncError::at("RemoveUserGroups"))?;
        }
        tracing::debug!(
            restored = journal.policies_removed.len(),
            withdrawn = journal.policies_created.len(),
            "reverted engine writes"
        );
        Ok(())
    }

    /// Replaces the engine's permission list for each given role.
    pub async fn push_role_permissions(
        &self,
        mappings: &[RolePermissionMapping],
    ) -> Result<(), SyncError> {
        if mappings.is_empty() {
            return Ok(());
        }
        for mapping in mappings {
            self.engine
                .delete_role_permission_mappings(&mapping.role)
                .await
                .map_err(SyncError::at("DeleteRolePermissionMappings"))?;
        }
        self.engine
            .create_role_permission_mappings(mappings)
            .await
            .map_err(SyncError::at("CreateRolePermissionMappings"))?;
        tracing::info!(roles = mappings.len(), "pushed role permissions");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grant::{GrantScope, GrantShape, ScopeValue, SubjectKind};
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        List(PolicyFilter),
        Create(Vec<PolicyTuple>),
        Delete(PolicyFilter),
        Remove(Vec<PolicyTuple>),
        CreateUserGroups(Vec<UserGroup>),
        DeleteUserGroups(UserGroupFilter),
        RemoveUserGroups(Vec<UserGroup>),
        DeleteMappings(String),
        CreateMappings(usize),
    }

    #[derive(Default)]
    struct RecordingEngine {
        policies: Mutex<Vec<PolicyTuple>>,
        user_groups: Mutex<Vec<UserGroup>>,
        calls: Mutex<Vec<Call>>,
        fail_create: bool,
        fail_remove: bool,
    }

    impl RecordingEngine {
        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: Call) {
            self.calls.lock().unwrap().push(call);
        }
    }

    impl EnforcementEngine for RecordingEngine {
        async fn enforce(&self, _request: &PolicyTuple) -> Result<bool, EngineError> {
            Ok(false)
        }

        async fn list_policies(
            &self,
            filter: &PolicyFilter,
        ) -> Result<Vec<PolicyTuple>, EngineError> {
            self.record(Call::List(filter.clone()));
            Ok(self
                .policies
                .lock()
                .unwrap()
                .iter()
                .filter(|t| filter.matches(t))
                .cloned()
                .collect())
        }

        async fn create_policies(&self, policies: &[PolicyTuple]) -> Result<(), EngineError> {
            self.record(Call::Create(policies.to_vec()));
            if self.fail_create {
                return Err(EngineError::Rejected("policy exists".to_string()));
            }
            let mut stored = self.policies.lock().unwrap();
            for policy in policies {
                if !stored.contains(policy) {
                    stored.push(policy.clone());
                }
            }
            Ok(())
        }

        async fn delete_policies(&self, filter: &PolicyFilter) -> Result<(), EngineError> {
            self.record(Call::Delete(filter.clone()));
            self.policies.lock().unwrap().retain(|t| !filter.matches(t));
            Ok(())
        }

        async fn remove_policies(&self, policies: &[PolicyTuple]) -> Result<(), EngineError> {
            self.record(Call::Remove(policies.to_vec()));
            if self.fail_remove {
                return Err(EngineError::Unavailable("connection reset".to_string()));
            }
            self.policies
                .lock()
                .unwrap()
                .retain(|t| !policies.contains(t));
            Ok(())
        }

        async fn list_user_groups(
            &self,
            filter: &UserGroupFilter,
        ) -> Result<Vec<UserGroup>, EngineError> {
            Ok(self
                .user_groups
                .lock()
                .unwrap()
                .iter()
                .filter(|ug| filter.matches(ug))
                .cloned()
                .collect())
        }

        async fn create_user_groups(&self, user_groups: &[UserGroup]) -> Result<(), EngineError> {
            self.record(Call::CreateUserGroups(user_groups.to_vec()));
            self.user_groups
                .lock()
                .unwrap()
                .extend(user_groups.iter().cloned());
            Ok(())
        }

        async fn delete_user_groups(&self, filter: &UserGroupFilter) -> Result<(), EngineError> {
            self.record(Call::DeleteUserGroups(filter.clone()));
            self.user_groups
                .lock()
                .unwrap()
                .retain(|ug| !filter.matches(ug));
            Ok(())
        }

        async fn remove_user_groups(&self, user_groups: &[UserGroup]) -> Result<(), EngineError> {
            self.record(Call::RemoveUserGroups(user_groups.to_vec()));
            self.user_groups
                .lock()
                .unwrap()
                .retain(|ug| !user_groups.contains(ug));
            Ok(())
        }

        async fn list_role_permission_mappings(
            &self,
            _role: &str,
        ) -> Result<Vec<RolePermissionMapping>, EngineError> {
            Ok(vec![])
        }

        async fn create_role_permission_mappings(
            &self,
            mappings: &[RolePermissionMapping],
        ) -> Result<(), EngineError> {
            self.record(Call::CreateMappings(mappings.len()));
            Ok(())
        }

        async fn delete_role_permission_mappings(&self, role: &str) -> Result<(), EngineError> {
            self.record(Call::DeleteMappings(role.to_string()));
            Ok(())
        }
    }

    fn grant(
        subject: SubjectKind,
        scope: GrantScope,
        role: &str,
        project: ScopeValue,
        namespace: ScopeValue,
    ) -> RoleGrant {
        RoleGrant {
            shape: GrantShape::new(subject, scope),
            group: (subject == SubjectKind::Group).then(|| "G".to_string()),
            role: role.to_string(),
            project,
            namespace,
        }
    }

    fn creates(calls: &[Call]) -> Vec<&Vec<PolicyTuple>> {
        calls
            .iter()
            .filter_map(|c| match c {
                Call::Create(p) => Some(p),
                _ => None,
            })
            .collect()
    }

    fn scenario_grants() -> Vec<RoleGrant> {
        vec![
            grant(
                SubjectKind::Group,
                GrantScope::Project,
                "R2",
                ScopeValue::specific("P"),
                ScopeValue::Any,
            ),
            grant(
                SubjectKind::Account,
                GrantScope::System,
                "R",
                ScopeValue::Any,
                ScopeValue::Any,
            ),
        ]
    }

    #[tokio::test]
    async fn replace_issues_single_create_with_all_tuples() {
        let engine = Arc::new(RecordingEngine::default());
        let sync = PolicySynchronizer::new(Arc::clone(&engine));
        let account = AccountId::generate();

        let report = sync
            .sync(&account, "O", &scenario_grants(), SyncMode::Replace, &mut SyncJournal::new())
            .await
            .unwrap();

        let calls = engine.calls();
        let created = creates(&calls);
        assert_eq!(created.len(), 1);
        let sub = format!("u:{account}");
        assert_eq!(
            created[0]
                .iter()
                .map(|t| (t.sub.as_str(), t.obj.as_str(), t.proj.as_str(), t.ns.as_str()))
                .collect::<Vec<_>>(),
            vec![
                (sub.as_str(), "R2", "P", "*"),
                (sub.as_str(), "R", "*", "*"),
            ]
        );
        assert_eq!(report.created, 2);
        assert_eq!(report.pruned, 0);
    }

    #[tokio::test]
    async fn replace_round_trips_through_list() {
        let engine = Arc::new(RecordingEngine::default());
        let sync = PolicySynchronizer::new(Arc::clone(&engine));
        let account = AccountId::generate();
        let grants = scenario_grants();

        sync.sync(&account, "O", &grants, SyncMode::Replace, &mut SyncJournal::new())
            .await
            .unwrap();

        let (mut expected, _) = PolicySynchronizer::<RecordingEngine>::desired_policies(
            &account, "O", &grants,
        );
        let mut listed = engine
            .list_policies(&PolicyFilter::for_subject(account_subject(&account)))
            .await
            .unwrap();
        expected.sort();
        listed.sort();
        assert_eq!(listed, expected);
    }

    #[tokio::test]
    async fn replace_with_no_grants_pushes_nothing() {
        let engine = Arc::new(RecordingEngine::default());
        let sync = PolicySynchronizer::new(Arc::clone(&engine));

        let report = sync
            .sync(&AccountId::generate(), "O", &[], SyncMode::Replace, &mut SyncJournal::new())
            .await
            .unwrap();

        assert!(creates(&engine.calls()).is_empty());
        assert_eq!(report, SyncReport::default());
    }

    #[tokio::test]
    async fn replace_prunes_tuples_no_longer_granted() {
        let engine = Arc::new(RecordingEngine::default());
        let sync = PolicySynchronizer::new(Arc::clone(&engine));
        let account = AccountId::generate();
        sync.sync(&account, "O", &scenario_grants(), SyncMode::Replace, &mut SyncJournal::new())
            .await
            .unwrap();

        let remaining = vec![scenario_grants().remove(1)];
        let report = sync
            .sync(&account, "O", &remaining, SyncMode::Replace, &mut SyncJournal::new())
            .await
            .unwrap();

        let listed = engine
            .list_policies(&PolicyFilter::for_subject(account_subject(&account)))
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].obj, "R");
        assert_eq!(report.pruned, 1);
    }

    #[tokio::test]
    async fn replace_prunes_in_one_call_after_create() {
        let engine = Arc::new(RecordingEngine::default());
        let sync = PolicySynchronizer::new(Arc::clone(&engine));
        let account = AccountId::generate();
        let projects: Vec<RoleGrant> = ["P1", "P2", "P3"]
            .into_iter()
            .map(|p| {
                grant(
                    SubjectKind::Account,
                    GrantScope::Project,
                    "PROJECT_ADMIN",
                    ScopeValue::specific(p),
                    ScopeValue::Any,
                )
            })
            .collect();
        sync.sync(&account, "O", &projects, SyncMode::Replace, &mut SyncJournal::new())
            .await
            .unwrap();

        let report = sync
            .sync(&account, "O", &scenario_grants(), SyncMode::Replace, &mut SyncJournal::new())
            .await
            .unwrap();

        let calls = engine.calls();
        let removes: Vec<usize> = calls
            .iter()
            .enumerate()
            .filter(|(_, c)| matches!(c, Call::Remove(_)))
            .map(|(i, _)| i)
            .collect();
        assert_eq!(removes.len(), 1);
        assert!(matches!(calls[removes[0] - 1], Call::Create(_)));
        assert!(!calls.iter().any(|c| matches!(c, Call::Delete(_))));
        assert_eq!(report.pruned, 3);
    }

    #[tokio::test]
    async fn failed_create_leaves_previous_tuples_in_place() {
        let engine = Arc::new(RecordingEngine::default());
        let account = AccountId::generate();
        let previous = vec![scenario_grants().remove(0)];
        PolicySynchronizer::new(Arc::clone(&engine))
            .sync(&account, "O", &previous, SyncMode::Replace, &mut SyncJournal::new())
            .await
            .unwrap();
        let before = engine.policies.lock().unwrap().clone();

        let failing = Arc::new(RecordingEngine {
            policies: Mutex::new(before.clone()),
            fail_create: true,
            ..Default::default()
        });
        let mut journal = SyncJournal::new();
        let err = PolicySynchronizer::new(Arc::clone(&failing))
            .sync(&account, "O", &scenario_grants()[1..], SyncMode::Replace, &mut journal)
            .await
            .unwrap_err();

        assert_eq!(err.operation, "CreatePolicies");
        assert_eq!(*failing.policies.lock().unwrap(), before);
        assert!(journal.is_empty());
    }

    #[tokio::test]
    async fn revert_undoes_partial_replace() {
        let engine = Arc::new(RecordingEngine {
            fail_remove: true,
            ..Default::default()
        });
        let account = AccountId::generate();
        let old = PolicyTuple::for_grant(&account, "O", &scenario_grants()[0]);
        engine.policies.lock().unwrap().push(old.clone());
        let sync = PolicySynchronizer::new(Arc::clone(&engine));

        let mut journal = SyncJournal::new();
        let err = sync
            .sync(&account, "O", &scenario_grants()[1..], SyncMode::Replace, &mut journal)
            .await
            .unwrap_err();
        assert_eq!(err.operation, "RemovePolicies");
        assert_eq!(engine.policies.lock().unwrap().len(), 2);

        let engine = Arc::new(RecordingEngine {
            policies: Mutex::new(engine.policies.lock().unwrap().clone()),
            ..Default::default()
        });
        PolicySynchronizer::new(Arc::clone(&engine))
            .revert(journal)
            .await
            .unwrap();

        assert_eq!(*engine.policies.lock().unwrap(), vec![old]);
    }

    #[tokio::test]
    async fn revert_restores_deleted_subject() {
        let engine = Arc::new(RecordingEngine::default());
        let sync = PolicySynchronizer::new(Arc::clone(&engine));
        let account = AccountId::generate();
        sync.sync(&account, "O", &scenario_grants(), SyncMode::Replace, &mut SyncJournal::new())
            .await
            .unwrap();
        let mut before = engine.policies.lock().unwrap().clone();

        let mut journal = SyncJournal::new();
        sync.sync(&account, "O", &[], SyncMode::Delete, &mut journal)
            .await
            .unwrap();
        assert!(engine.policies.lock().unwrap().is_empty());
        sync.revert(journal).await.unwrap();

        let mut after = engine.policies.lock().unwrap().clone();
        before.sort();
        after.sort();
        assert_eq!(after, before);
    }

    #[tokio::test]
    async fn replace_leaves_other_subjects_alone() {
        let engine = Arc::new(RecordingEngine::default());
        let sync = PolicySynchronizer::new(Arc::clone(&engine));
        let a = AccountId::generate();
        let b = AccountId::generate();
        sync.sync(&a, "O", &scenario_grants(), SyncMode::Replace, &mut SyncJournal::new())
            .await
            .unwrap();

        sync.sync(&b, "O", &[], SyncMode::Replace, &mut SyncJournal::new()).await.unwrap();

        let listed = engine
            .list_policies(&PolicyFilter::for_subject(account_subject(&a)))
            .await
            .unwrap();
        assert_eq!(listed.len(), 2);
    }

    #[tokio::test]
    async fn delete_issues_one_subject_filter_and_no_create() {
        let engine = Arc::new(RecordingEngine::default());
        let sync = PolicySynchronizer::new(Arc::clone(&engine));
        let account = AccountId::generate();

        sync.sync(&account, "O", &scenario_grants(), SyncMode::Delete, &mut SyncJournal::new())
            .await
            .unwrap();

        let writes: Vec<Call> = engine
            .calls()
            .into_iter()
            .filter(|c| !matches!(c, Call::List(_)))
            .collect();
        assert_eq!(
            writes,
            vec![Call::Delete(PolicyFilter::for_subject(format!(
                "u:{account}"
            )))]
        );
    }

    #[tokio::test]
    async fn namespace_grant_pushes_namespace_name() {
        let engine = Arc::new(RecordingEngine::default());
        let sync = PolicySynchronizer::new(Arc::clone(&engine));
        let grants = vec![grant(
            SubjectKind::Group,
            GrantScope::Namespace,
            "NAMESPACE_ADMIN",
            ScopeValue::specific("P"),
            ScopeValue::specific("7"),
        )];

        sync.sync(&AccountId::generate(), "O", &grants, SyncMode::Replace, &mut SyncJournal::new())
            .await
            .unwrap();

        let calls = engine.calls();
        assert_eq!(creates(&calls)[0][0].ns, "7");
    }

    #[tokio::test]
    async fn duplicate_paths_push_one_tuple() {
        let engine = Arc::new(RecordingEngine::default());
        let sync = PolicySynchronizer::new(Arc::clone(&engine));
        let grants = vec![
            grant(
                SubjectKind::Group,
                GrantScope::System,
                "ADMIN",
                ScopeValue::Any,
                ScopeValue::Any,
            ),
            grant(
                SubjectKind::Account,
                GrantScope::System,
                "ADMIN",
                ScopeValue::Any,
                ScopeValue::Any,
            ),
        ];

        let report = sync
            .sync(&AccountId::generate(), "O", &grants, SyncMode::Replace, &mut SyncJournal::new())
            .await
            .unwrap();

        assert_eq!(report.created, 1);
    }

    #[tokio::test]
    async fn dangling_grant_is_skipped() {
        let engine = Arc::new(RecordingEngine::default());
        let sync = PolicySynchronizer::new(Arc::clone(&engine));
        let grants = vec![grant(
            SubjectKind::Account,
            GrantScope::Project,
            "PROJECT_ADMIN",
            ScopeValue::unresolved(),
            ScopeValue::Any,
        )];

        let report = sync
            .sync(&AccountId::generate(), "O", &grants, SyncMode::Replace, &mut SyncJournal::new())
            .await
            .unwrap();

        assert_eq!(report.skipped, 1);
        assert!(creates(&engine.calls()).is_empty());
    }

    #[tokio::test]
    async fn engine_rejection_surfaces_operation() {
        let engine = Arc::new(RecordingEngine {
            fail_create: true,
            ..Default::default()
        });
        let sync = PolicySynchronizer::new(engine);

        let err = sync
            .sync(
                &AccountId::generate(),
                "O",
                &scenario_grants(),
                SyncMode::Replace,
                &mut SyncJournal::new(),
            )
            .await
            .unwrap_err();

        assert_eq!(err.operation, "CreatePolicies");
        assert!(matches!(err.source, EngineError::Rejected(_)));
    }

    #[tokio::test]
    async fn memberships_are_mirrored_and_pruned() {
        let engine = Arc::new(RecordingEngine::default());
        let sync = PolicySynchronizer::new(Arc::clone(&engine));
        let account = AccountId::generate();
        let first = GroupId::generate();
        let second = GroupId::generate();

        sync.sync_memberships(
            &account,
            "O",
            &[first, second],
            SyncMode::Replace,
            &mut SyncJournal::new(),
        )
        .await
        .unwrap();
        sync.sync_memberships(&account, "O", &[second], SyncMode::Replace, &mut SyncJournal::new())
            .await
            .unwrap();

        let groups = engine
            .list_user_groups(&UserGroupFilter::for_user(account_subject(&account)))
            .await
            .unwrap();
        assert_eq!(groups, vec![UserGroup::new(&account, &second, "O")]);
        let removals = engine
            .calls()
            .into_iter()
            .filter(|c| matches!(c, Call::RemoveUserGroups(_)))
            .count();
        assert_eq!(removals, 1);
    }

    #[tokio::test]
    async fn membership_delete_drops_user() {
        let engine = Arc::new(RecordingEngine::default());
        let sync = PolicySynchronizer::new(Arc::clone(&engine));
        let account = AccountId::generate();
        sync.sync_memberships(
            &account,
            "O",
            &[GroupId::generate()],
            SyncMode::Replace,
            &mut SyncJournal::new(),
        )
        .await
        .unwrap();

        sync.sync_memberships(&account, "O", &[], SyncMode::Delete, &mut SyncJournal::new())
            .await
            .unwrap();

        assert!(engine.user_groups.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn role_permissions_replace_per_role() {
        let engine = Arc::new(RecordingEngine::default());
        let sync = PolicySynchronizer::new(Arc::clone(&engine));
        let mappings = vec![
            RolePermissionMapping::new("ADMIN", vec!["account.read".to_string()]),
            RolePermissionMapping::new("PROJECT_ADMIN", vec!["project.write".to_string()]),
        ];

        sync.push_role_permissions(&mappings).await.unwrap();

        assert_eq!(
            engine.calls(),
            vec![
                Call::DeleteMappings("ADMIN".to_string()),
                Call::DeleteMappings("PROJECT_ADMIN".to_string()),
                Call::CreateMappings(2),
            ]
        );
    }
}
