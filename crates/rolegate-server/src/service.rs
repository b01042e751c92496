use std::collections::HashMap;
use std::sync::Arc;

use rolegate_core::grant::{RoleBinding, RoleGrant};
use rolegate_core::ids::{AccountId, GroupId};
use rolegate_core::resolver::{MappingSubject, PermissionResolver, resolve_grants};
use rolegate_core::sync::{
    EnforcementEngine, PolicySynchronizer, SyncError, SyncJournal, SyncMode, SyncReport,
};
use rolegate_storage::{
    DirectoryStore, GroupRecord, Identity, IdentityProvider, IdentityTraits, MappingKey,
    MappingReader, MappingStore, MappingTransaction, OrganizationRecord, Tenancy,
};
use serde::Deserialize;

use crate::adapter::{StoreMappingReader, TxMappingReader};
use crate::error::ApiError;
use crate::metrics::Metrics;

/// Names that would shadow the `/user/id/{id}` route.
pub const RESERVED_NAMES: &[&str] = &["id"];

#[derive(Debug, Clone, Default)]
pub struct UserInput {
    pub name: String,
    pub traits: IdentityTraits,
    pub roles: Vec<RoleBinding>,
    pub groups: Vec<String>,
}

/// Replacement state for an existing user. Roles and groups are the full
/// desired sets, not a delta.
#[derive(Debug, Clone, Default)]
pub struct UserUpdate {
    pub traits: IdentityTraits,
    pub roles: Vec<RoleBinding>,
    pub groups: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct User {
    pub id: AccountId,
    pub name: String,
    pub partner: String,
    pub organization: String,
    pub traits: IdentityTraits,
    pub groups: Vec<String>,
    pub grants: Vec<RoleGrant>,
}

/// A resolved grant with the permissions its role carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionGrant {
    pub role: String,
    pub project: String,
    pub namespace: String,
    pub group: Option<String>,
    pub permissions: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct UserInfo {
    pub name: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub organization: String,
    pub partner: String,
    pub groups: Vec<String>,
    pub permissions: Vec<PermissionGrant>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderBy {
    Email,
    FirstName,
    LastName,
}

impl OrderBy {
    fn key(self, identity: &Identity) -> String {
        let field = match self {
            OrderBy::Email => &identity.traits.email,
            OrderBy::FirstName => &identity.traits.first_name,
            OrderBy::LastName => &identity.traits.last_name,
        };
        field.to_lowercase()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ListOptions {
    /// Case-insensitive substring of email, first or last name.
    pub q: Option<String>,
    pub role: Option<String>,
    pub group: Option<String>,
    pub order_by: Option<OrderBy>,
    pub order: SortOrder,
    pub limit: Option<usize>,
    pub offset: usize,
}

#[derive(Debug, Clone)]
pub struct UserList {
    /// Matches before `limit`/`offset` were applied.
    pub count: usize,
    pub items: Vec<User>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupRoles {
    pub group: String,
    pub roles: Vec<RoleBinding>,
}

/// Orchestrates user writes across the relational store, the identity
/// provider and the enforcement engine.
///
/// Every write resolves grants inside its own transaction and pushes them to
/// the engine before committing. An engine failure rolls the transaction
/// back, so the store never holds grants the engine refused.
pub struct UserService<S, I, E>
where
    S: DirectoryStore + MappingStore,
    I: IdentityProvider,
    E: EnforcementEngine,
{
    store: Arc<S>,
    identities: Arc<I>,
    sync: PolicySynchronizer<E>,
    resolver: PermissionResolver<StoreMappingReader<S>>,
    metrics: Option<Arc<Metrics>>,
}

impl<S, I, E> UserService<S, I, E>
where
    S: DirectoryStore + MappingStore,
    I: IdentityProvider,
    E: EnforcementEngine,
{
    pub fn new(store: Arc<S>, identities: Arc<I>, engine: Arc<E>) -> Self {
        Self {
            resolver: PermissionResolver::new(Arc::new(StoreMappingReader::new(Arc::clone(
                &store,
            )))),
            store,
            identities,
            sync: PolicySynchronizer::new(engine),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn synchronizer(&self) -> &PolicySynchronizer<E> {
        &self.sync
    }

    pub async fn create(
        &self,
        partner: &str,
        organization: &str,
        input: UserInput,
    ) -> Result<User, ApiError> {
        let name = input.name.trim();
        if name.is_empty() {
            return Err(ApiError::Validation("user name is required".to_string()));
        }
        if RESERVED_NAMES.contains(&name) {
            return Err(ApiError::Validation(format!("user name '{name}' is reserved")));
        }
        let bindings = normalize_bindings(&input.roles)?;

        let org = self.organization(partner, organization).await?;
        let keys = self.mapping_keys(&org, &bindings).await?;
        let groups = self.group_records(&org, &input.groups).await?;
        if self.identities.find_by_name(&org.id, name).await?.is_some() {
            return Err(ApiError::Conflict(format!("user '{name}'")));
        }

        let identity = self
            .identities
            .create(&org.tenancy(), name, &input.traits)
            .await?;

        let grants = match self
            .apply_account(&org, &identity.id, &keys, &group_ids(&groups))
            .await
        {
            Ok(grants) => grants,
            Err(err) => {
                if let Err(e) = self.identities.delete(&identity.id).await {
                    tracing::error!(
                        account_id = %identity.id,
                        error = %e,
                        "failed to remove identity after rejected create"
                    );
                }
                return Err(err);
            }
        };

        tracing::info!(
            account_id = %identity.id,
            organization = %org.name,
            grant_count = grants.len(),
            "user created"
        );
        Ok(User {
            id: identity.id,
            name: identity.name,
            partner: partner.to_string(),
            organization: org.name,
            traits: identity.traits,
            groups: group_names(groups),
            grants,
        })
    }

    pub async fn update(
        &self,
        partner: &str,
        organization: &str,
        name: &str,
        update: UserUpdate,
    ) -> Result<User, ApiError> {
        let bindings = normalize_bindings(&update.roles)?;

        let org = self.organization(partner, organization).await?;
        let identity = self.identity(&org, name).await?;
        let keys = self.mapping_keys(&org, &bindings).await?;
        let groups = self.group_records(&org, &update.groups).await?;

        let grants = self
            .apply_account(&org, &identity.id, &keys, &group_ids(&groups))
            .await?;
        let identity = self.identities.update(&identity.id, &update.traits).await?;

        tracing::info!(
            account_id = %identity.id,
            organization = %org.name,
            grant_count = grants.len(),
            "user updated"
        );
        Ok(User {
            id: identity.id,
            name: identity.name,
            partner: partner.to_string(),
            organization: org.name,
            traits: identity.traits,
            groups: group_names(groups),
            grants,
        })
    }

    pub async fn delete(
        &self,
        partner: &str,
        organization: &str,
        name: &str,
    ) -> Result<(), ApiError> {
        let org = self.organization(partner, organization).await?;
        let identity = self.identity(&org, name).await?;

        let tx = self.store.begin().await?;
        let mut journal = SyncJournal::new();
        let staged = self
            .stage_delete(&tx, &org, &identity.id, &mut journal)
            .await;
        self.settle(tx, staged, journal, &identity.id.to_string())
            .await?;

        self.identities.delete(&identity.id).await?;
        tracing::info!(account_id = %identity.id, organization = %org.name, "user deleted");
        Ok(())
    }

    pub async fn get_by_name(
        &self,
        partner: &str,
        organization: &str,
        name: &str,
    ) -> Result<User, ApiError> {
        let org = self.organization(partner, organization).await?;
        let identity = self.identity(&org, name).await?;
        self.to_user(partner, &org, identity).await
    }

    pub async fn get_by_id(
        &self,
        partner: &str,
        organization: &str,
        id: &str,
    ) -> Result<User, ApiError> {
        let account: AccountId = id
            .parse()
            .map_err(|_| ApiError::Validation(format!("invalid user id '{id}'")))?;
        let org = self.organization(partner, organization).await?;
        let identity = self
            .identities
            .get(&account)
            .await?
            .filter(|i| i.tenancy.organization_id == org.id)
            .ok_or_else(|| ApiError::not_found("user", id))?;
        self.to_user(partner, &org, identity).await
    }

    pub async fn list(
        &self,
        partner: &str,
        organization: &str,
        options: &ListOptions,
    ) -> Result<UserList, ApiError> {
        let org = self.organization(partner, organization).await?;
        let mut identities = self.identities.list(&org.id).await?;

        if let Some(q) = options.q.as_deref().map(str::trim).filter(|q| !q.is_empty()) {
            let needle = q.to_lowercase();
            identities.retain(|i| {
                [&i.traits.email, &i.traits.first_name, &i.traits.last_name]
                    .iter()
                    .any(|field| field.to_lowercase().contains(&needle))
            });
        }
        if let Some(order_by) = options.order_by {
            identities.sort_by_key(|i| order_by.key(i));
            if options.order == SortOrder::Desc {
                identities.reverse();
            }
        }

        let mut users = Vec::with_capacity(identities.len());
        for identity in identities {
            let user = self.to_user(partner, &org, identity).await?;
            if let Some(role) = options.role.as_deref()
                && !user.grants.iter().any(|g| g.role == role)
            {
                continue;
            }
            if let Some(group) = options.group.as_deref()
                && !user.groups.iter().any(|g| g == group)
            {
                continue;
            }
            users.push(user);
        }

        let count = users.len();
        let items = users
            .into_iter()
            .skip(options.offset)
            .take(options.limit.unwrap_or(usize::MAX))
            .collect();
        Ok(UserList { count, items })
    }

    pub async fn user_info(
        &self,
        partner: &str,
        organization: &str,
        name: &str,
    ) -> Result<UserInfo, ApiError> {
        let user = self.get_by_name(partner, organization, name).await?;

        let mut role_permissions: HashMap<String, Vec<String>> = HashMap::new();
        let mut permissions = Vec::with_capacity(user.grants.len());
        for grant in &user.grants {
            if !role_permissions.contains_key(&grant.role) {
                let listed = self
                    .store
                    .role_by_name(&grant.role)
                    .await?
                    .map(|r| r.permissions)
                    .unwrap_or_default();
                role_permissions.insert(grant.role.clone(), listed);
            }
            permissions.push(PermissionGrant {
                role: grant.role.clone(),
                project: grant.project.for_display().to_string(),
                namespace: grant.namespace.for_display().to_string(),
                group: grant.group.clone(),
                permissions: role_permissions
                    .get(&grant.role)
                    .cloned()
                    .unwrap_or_default(),
            });
        }

        Ok(UserInfo {
            name: user.name,
            email: user.traits.email,
            first_name: user.traits.first_name,
            last_name: user.traits.last_name,
            organization: user.organization,
            partner: user.partner,
            groups: user.groups,
            permissions,
        })
    }

    /// Re-pushes the account's committed grants and memberships.
    ///
    /// Repairs an engine that drifted from the store, e.g. after a commit
    /// failed following a successful push.
    pub async fn reconcile(
        &self,
        partner: &str,
        organization: &str,
        name: &str,
    ) -> Result<SyncReport, ApiError> {
        let org = self.organization(partner, organization).await?;
        let identity = self.identity(&org, name).await?;

        // Holding a transaction keeps writers out while we push.
        let tx = self.store.begin().await?;
        let mut journal = SyncJournal::new();
        let staged = self
            .stage_reconcile(&tx, &org, &identity.id, &mut journal)
            .await;
        if let Err(e) = tx.rollback().await {
            tracing::warn!(account_id = %identity.id, error = %e, "failed to release reconcile transaction");
        }
        if staged.is_err() {
            self.revert(journal, &identity.id.to_string()).await;
        }
        let report = staged?;

        tracing::info!(
            account_id = %identity.id,
            organization = %org.name,
            tuple_count = report.created,
            pruned = report.pruned,
            "user reconciled"
        );
        Ok(report)
    }

    /// Replaces the roles bound to a group and re-pushes every member.
    pub async fn set_group_roles(
        &self,
        partner: &str,
        organization: &str,
        group: &str,
        roles: &[RoleBinding],
    ) -> Result<GroupRoles, ApiError> {
        let bindings = normalize_bindings(roles)?;

        let org = self.organization(partner, organization).await?;
        let record = self.group(&org, group).await?;
        let keys = self.mapping_keys(&org, &bindings).await?;

        let tx = self.store.begin().await?;
        let mut journal = SyncJournal::new();
        let staged = self
            .stage_group(&tx, &org, &record, &keys, &mut journal)
            .await;
        let members = self
            .settle(tx, staged, journal, &format!("group {}", record.name))
            .await?;

        tracing::info!(
            group = %record.name,
            organization = %org.name,
            members,
            role_count = keys.len(),
            "group roles replaced"
        );
        self.group_bindings(record).await
    }

    pub async fn group_roles(
        &self,
        partner: &str,
        organization: &str,
        group: &str,
    ) -> Result<GroupRoles, ApiError> {
        let org = self.organization(partner, organization).await?;
        let record = self.group(&org, group).await?;
        self.group_bindings(record).await
    }

    async fn apply_account(
        &self,
        org: &OrganizationRecord,
        account: &AccountId,
        keys: &[MappingKey],
        groups: &[GroupId],
    ) -> Result<Vec<RoleGrant>, ApiError> {
        let tx = self.store.begin().await?;
        let mut journal = SyncJournal::new();
        let staged = self
            .stage_account(&tx, org, account, keys, groups, &mut journal)
            .await;
        self.settle(tx, staged, journal, &account.to_string()).await
    }

    async fn stage_account(
        &self,
        tx: &S::Tx,
        org: &OrganizationRecord,
        account: &AccountId,
        keys: &[MappingKey],
        groups: &[GroupId],
        journal: &mut SyncJournal,
    ) -> Result<Vec<RoleGrant>, ApiError> {
        replace_subject_mappings(tx, &org.tenancy(), &MappingSubject::Account(*account), keys)
            .await?;
        tx.set_account_groups(account, groups).await?;

        let grants = resolve_grants(&TxMappingReader::new(tx), account).await?;
        self.push_policies(account, &org.name, &grants, journal)
            .await?;
        let mirrored = self
            .sync
            .sync_memberships(account, &org.name, groups, SyncMode::Replace, journal)
            .await;
        self.observe(account, mirrored)?;
        Ok(grants)
    }

    async fn stage_delete(
        &self,
        tx: &S::Tx,
        org: &OrganizationRecord,
        account: &AccountId,
        journal: &mut SyncJournal,
    ) -> Result<(), ApiError> {
        tx.delete_subject_mappings(&MappingSubject::Account(*account))
            .await?;
        tx.set_account_groups(account, &[]).await?;

        let dropped = self
            .sync
            .sync(account, &org.name, &[], SyncMode::Delete, journal)
            .await;
        self.observe(account, dropped)?;
        let unlinked = self
            .sync
            .sync_memberships(account, &org.name, &[], SyncMode::Delete, journal)
            .await;
        self.observe(account, unlinked)
    }

    async fn stage_reconcile(
        &self,
        tx: &S::Tx,
        org: &OrganizationRecord,
        account: &AccountId,
        journal: &mut SyncJournal,
    ) -> Result<SyncReport, ApiError> {
        let grants = resolve_grants(&TxMappingReader::new(tx), account).await?;
        let groups: Vec<GroupId> = tx
            .account_groups(account)
            .await?
            .into_iter()
            .map(|g| g.id)
            .collect();

        let report = self
            .push_policies(account, &org.name, &grants, journal)
            .await?;
        let mirrored = self
            .sync
            .sync_memberships(account, &org.name, &groups, SyncMode::Replace, journal)
            .await;
        self.observe(account, mirrored)?;
        Ok(report)
    }

    async fn stage_group(
        &self,
        tx: &S::Tx,
        org: &OrganizationRecord,
        group: &GroupRecord,
        keys: &[MappingKey],
        journal: &mut SyncJournal,
    ) -> Result<usize, ApiError> {
        replace_subject_mappings(tx, &org.tenancy(), &MappingSubject::Group(group.id), keys)
            .await?;

        let members = tx.group_members(&group.id).await?;
        for member in &members {
            let grants = resolve_grants(&TxMappingReader::new(tx), member).await?;
            self.push_policies(member, &org.name, &grants, journal)
                .await?;
        }
        Ok(members.len())
    }

    async fn push_policies(
        &self,
        account: &AccountId,
        organization: &str,
        grants: &[RoleGrant],
        journal: &mut SyncJournal,
    ) -> Result<SyncReport, ApiError> {
        let pushed = self
            .sync
            .sync(account, organization, grants, SyncMode::Replace, journal)
            .await;
        let report = self.observe(account, pushed)?;
        if let Some(ref metrics) = self.metrics {
            metrics.record_sync(&report);
        }
        Ok(report)
    }

    /// Commits when staging succeeded, rolls back otherwise.
    ///
    /// Either way, if the store does not end up holding the staged change,
    /// the engine writes made while staging are reverted.
    async fn settle<R>(
        &self,
        tx: S::Tx,
        staged: Result<R, ApiError>,
        journal: SyncJournal,
        subject: &str,
    ) -> Result<R, ApiError> {
        match staged {
            Ok(value) => {
                if let Err(e) = tx.commit().await {
                    tracing::error!(subject, error = %e, "commit failed after engine push");
                    self.revert(journal, subject).await;
                    return Err(e.into());
                }
                Ok(value)
            }
            Err(err) => {
                if let Err(e) = tx.rollback().await {
                    tracing::warn!(subject, error = %e, "rollback failed");
                }
                self.revert(journal, subject).await;
                Err(err)
            }
        }
    }

    async fn revert(&self, journal: SyncJournal, subject: &str) {
        if journal.is_empty() {
            return;
        }
        if let Err(e) = self.sync.revert(journal).await {
            if let Some(ref metrics) = self.metrics {
                metrics.record_sync_failure();
            }
            tracing::error!(
                subject,
                error = %e,
                "engine left ahead of the store; reconcile to repair"
            );
        }
    }

    fn observe<T>(&self, account: &AccountId, result: Result<T, SyncError>) -> Result<T, ApiError> {
        result.map_err(|err| {
            if let Some(ref metrics) = self.metrics {
                metrics.record_sync_failure();
            }
            tracing::warn!(account_id = %account, error = %err, "policy sync failed");
            ApiError::from(err)
        })
    }

    async fn to_user(
        &self,
        partner: &str,
        org: &OrganizationRecord,
        identity: Identity,
    ) -> Result<User, ApiError> {
        let grants = self.resolver.resolve(&identity.id).await?;
        let mut groups: Vec<String> = self
            .store
            .account_groups(&identity.id)
            .await?
            .into_iter()
            .map(|g| g.name)
            .collect();
        groups.sort();

        Ok(User {
            id: identity.id,
            name: identity.name,
            partner: partner.to_string(),
            organization: org.name.clone(),
            traits: identity.traits,
            groups,
            grants,
        })
    }

    async fn group_bindings(&self, group: GroupRecord) -> Result<GroupRoles, ApiError> {
        let keys = self
            .store
            .subject_mappings(&MappingSubject::Group(group.id))
            .await?;

        let mut roles = Vec::with_capacity(keys.len());
        for key in keys {
            let Some(role) = self.store.role_by_id(&key.role_id).await? else {
                continue;
            };
            let project = match key.project_id {
                Some(id) => Some(
                    self.store
                        .project_by_id(&id)
                        .await?
                        .map(|p| p.name)
                        .unwrap_or_default(),
                ),
                None => None,
            };
            roles.push(RoleBinding {
                role: role.name,
                project,
                namespace: key.namespace,
            });
        }

        Ok(GroupRoles {
            group: group.name,
            roles,
        })
    }

    async fn organization(
        &self,
        partner: &str,
        organization: &str,
    ) -> Result<OrganizationRecord, ApiError> {
        let partner_record = self
            .store
            .partner_by_name(partner)
            .await?
            .ok_or_else(|| ApiError::not_found("partner", partner))?;
        self.store
            .organization_by_name(&partner_record.id, organization)
            .await?
            .ok_or_else(|| ApiError::not_found("organization", organization))
    }

    async fn identity(&self, org: &OrganizationRecord, name: &str) -> Result<Identity, ApiError> {
        self.identities
            .find_by_name(&org.id, name)
            .await?
            .ok_or_else(|| ApiError::not_found("user", name))
    }

    async fn group(&self, org: &OrganizationRecord, name: &str) -> Result<GroupRecord, ApiError> {
        self.store
            .group_by_name(&org.id, name)
            .await?
            .ok_or_else(|| ApiError::not_found("group", name))
    }

    /// Looks up every referenced role and project. Runs before any write.
    async fn mapping_keys(
        &self,
        org: &OrganizationRecord,
        bindings: &[RoleBinding],
    ) -> Result<Vec<MappingKey>, ApiError> {
        let mut keys: Vec<MappingKey> = Vec::with_capacity(bindings.len());
        for binding in bindings {
            let role = self
                .store
                .role_by_name(&binding.role)
                .await?
                .ok_or_else(|| ApiError::not_found("role", &binding.role))?;
            binding.check_role_scope(role.scope)?;

            let project_id = match binding.project() {
                Some(project) => Some(
                    self.store
                        .project_by_name(&org.id, project)
                        .await?
                        .ok_or_else(|| ApiError::not_found("project", project))?
                        .id,
                ),
                None => None,
            };

            let key = MappingKey {
                role_id: role.id,
                project_id,
                namespace: binding.namespace().map(str::to_string),
            };
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
        Ok(keys)
    }

    async fn group_records(
        &self,
        org: &OrganizationRecord,
        names: &[String],
    ) -> Result<Vec<GroupRecord>, ApiError> {
        let mut groups: Vec<GroupRecord> = Vec::with_capacity(names.len());
        for name in names {
            let name = name.trim();
            if name.is_empty() {
                return Err(ApiError::Validation(
                    "group name must not be empty".to_string(),
                ));
            }
            let record = self.group(org, name).await?;
            if !groups.iter().any(|g| g.id == record.id) {
                groups.push(record);
            }
        }
        Ok(groups)
    }
}

/// Checks binding shapes and drops exact repeats, keeping first-seen order.
fn normalize_bindings(bindings: &[RoleBinding]) -> Result<Vec<RoleBinding>, ApiError> {
    let mut unique: Vec<RoleBinding> = Vec::with_capacity(bindings.len());
    for binding in bindings {
        binding.validate()?;
        let normalized = RoleBinding {
            role: binding.role.trim().to_string(),
            project: binding.project().map(|p| p.trim().to_string()),
            namespace: binding.namespace().map(|n| n.trim().to_string()),
        };
        if !unique.contains(&normalized) {
            unique.push(normalized);
        }
    }
    Ok(unique)
}

/// Brings a subject's stored mappings to exactly `keys`. Rows that stay keep
/// their original position.
async fn replace_subject_mappings<T: MappingTransaction>(
    tx: &T,
    tenancy: &Tenancy,
    subject: &MappingSubject,
    keys: &[MappingKey],
) -> Result<(), ApiError> {
    let existing = tx.subject_mappings(subject).await?;
    for stale in existing.iter().filter(|k| !keys.contains(k)) {
        tx.delete_mapping(subject, stale).await?;
    }
    for key in keys.iter().filter(|k| !existing.contains(k)) {
        tx.insert_mapping(tenancy, subject, key).await?;
    }
    Ok(())
}

fn group_ids(groups: &[GroupRecord]) -> Vec<GroupId> {
    groups.iter().map(|g| g.id).collect()
}

fn group_names(groups: Vec<GroupRecord>) -> Vec<String> {
    let mut names: Vec<String> = groups.into_iter().map(|g| g.name).collect();
    names.sort();
    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use rolegate_client::{EngineCall, InMemoryEngine};
    use rolegate_core::grant::{GrantScope, GrantShape, RoleScope, ScopeValue, SubjectKind};
    use rolegate_core::policy::{PolicyFilter, PolicyTuple, UserGroupFilter, account_subject};
    use rolegate_core::sync::EngineError;
    use rolegate_storage::{InMemoryIdentityProvider, InMemoryStore};

    type TestService = UserService<InMemoryStore, InMemoryIdentityProvider, InMemoryEngine>;

    struct Fixture {
        service: TestService,
        store: Arc<InMemoryStore>,
        identities: Arc<InMemoryIdentityProvider>,
        engine: Arc<InMemoryEngine>,
        org: OrganizationRecord,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let identities = Arc::new(InMemoryIdentityProvider::new());
        let engine = Arc::new(InMemoryEngine::new());

        let partner = store.create_partner("finman").await.unwrap();
        let org = store
            .create_organization(&partner.id, "acme")
            .await
            .unwrap();
        store.create_project(&org.id, "P").await.unwrap();
        store.create_project(&org.id, "billing").await.unwrap();
        store.create_group(&org.id, "G").await.unwrap();
        store.create_group(&org.id, "ops").await.unwrap();
        store
            .upsert_role(
                "R",
                RoleScope::Organization,
                &["account.read".to_string()],
                false,
            )
            .await
            .unwrap();
        store
            .upsert_role(
                "R2",
                RoleScope::Project,
                &["project.read".to_string(), "project.write".to_string()],
                false,
            )
            .await
            .unwrap();
        store
            .upsert_role("NAMESPACE_ADMIN", RoleScope::Project, &[], true)
            .await
            .unwrap();

        let service = UserService::new(
            Arc::clone(&store),
            Arc::clone(&identities),
            Arc::clone(&engine),
        );
        Fixture {
            service,
            store,
            identities,
            engine,
            org,
        }
    }

    fn input(name: &str, roles: Vec<RoleBinding>, groups: &[&str]) -> UserInput {
        UserInput {
            name: name.to_string(),
            traits: IdentityTraits {
                email: format!("{name}@example.com"),
                ..Default::default()
            },
            roles,
            groups: groups.iter().map(|g| g.to_string()).collect(),
        }
    }

    fn creates(calls: &[EngineCall]) -> Vec<Vec<PolicyTuple>> {
        calls
            .iter()
            .filter_map(|c| match c {
                EngineCall::CreatePolicies(p) => Some(p.clone()),
                _ => None,
            })
            .collect()
    }

    fn policy_deletes(calls: &[EngineCall]) -> Vec<PolicyFilter> {
        calls
            .iter()
            .filter_map(|c| match c {
                EngineCall::DeletePolicies(f) => Some(f.clone()),
                _ => None,
            })
            .collect()
    }

    async fn bind_group(f: &Fixture, group: &str, roles: Vec<RoleBinding>) {
        f.service
            .set_group_roles("finman", "acme", group, &roles)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn create_resolves_group_project_before_account_system() {
        let f = fixture().await;
        bind_group(&f, "G", vec![RoleBinding::new("R2").in_project("P")]).await;
        f.engine.clear_calls();

        let user = f
            .service
            .create("finman", "acme", input("A", vec![RoleBinding::new("R")], &["G"]))
            .await
            .unwrap();

        let resolved: Vec<(Option<&str>, &str, String, String)> = user
            .grants
            .iter()
            .map(|g| {
                (
                    g.group.as_deref(),
                    g.role.as_str(),
                    g.project.to_string(),
                    g.namespace.to_string(),
                )
            })
            .collect();
        assert_eq!(
            resolved,
            vec![
                (Some("G"), "R2", "P".to_string(), "*".to_string()),
                (None, "R", "*".to_string(), "*".to_string()),
            ]
        );

        let calls = f.engine.calls();
        let created = creates(&calls);
        assert_eq!(created.len(), 1, "exactly one CreatePolicies call");
        let sub = account_subject(&user.id);
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
        assert!(created[0].iter().all(|t| t.org == "acme" && t.act.is_empty()));
    }

    #[tokio::test]
    async fn delete_issues_one_subject_delete_and_no_create() {
        let f = fixture().await;
        let user = f
            .service
            .create("finman", "acme", input("A", vec![RoleBinding::new("R")], &[]))
            .await
            .unwrap();
        f.engine.clear_calls();

        f.service.delete("finman", "acme", "A").await.unwrap();

        let calls = f.engine.calls();
        assert_eq!(
            policy_deletes(&calls),
            vec![PolicyFilter::for_subject(account_subject(&user.id))]
        );
        assert!(creates(&calls).is_empty());
        assert!(f.engine.policies().is_empty());
        assert!(
            f.identities
                .find_by_name(&f.org.id, "A")
                .await
                .unwrap()
                .is_none()
        );
        let leftover = f
            .store
            .subject_mappings(&MappingSubject::Account(user.id))
            .await
            .unwrap();
        assert!(leftover.is_empty());
    }

    #[tokio::test]
    async fn update_adds_namespace_grant_via_group() {
        let f = fixture().await;
        f.service
            .create("finman", "acme", input("A", vec![RoleBinding::new("R")], &[]))
            .await
            .unwrap();
        bind_group(
            &f,
            "ops",
            vec![RoleBinding::new("NAMESPACE_ADMIN")
                .in_project("P")
                .in_namespace("7")],
        )
        .await;
        f.engine.clear_calls();

        let user = f
            .service
            .update(
                "finman",
                "acme",
                "A",
                UserUpdate {
                    roles: vec![RoleBinding::new("R")],
                    groups: vec!["ops".to_string()],
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(
            user.grants[0].shape,
            GrantShape::new(SubjectKind::Group, GrantScope::Namespace)
        );
        assert_eq!(user.grants[0].namespace, ScopeValue::specific("7"));
        let created = creates(&f.engine.calls());
        let pushed = created
            .last()
            .unwrap()
            .iter()
            .find(|t| t.obj == "NAMESPACE_ADMIN")
            .cloned()
            .unwrap();
        assert_eq!(pushed.ns, "7");
        assert_eq!(pushed.proj, "P");
    }

    #[tokio::test]
    async fn namespace_without_project_is_rejected_before_any_write() {
        let f = fixture().await;
        let binding = RoleBinding::new("NAMESPACE_ADMIN").in_namespace("7");

        let err = f
            .service
            .create("finman", "acme", input("A", vec![binding.clone()], &[]))
            .await
            .unwrap_err();

        assert!(matches!(err, ApiError::Grant(_)));
        assert!(f.engine.calls().is_empty());
        assert!(f.identities.list(&f.org.id).await.unwrap().is_empty());

        let group_err = f
            .service
            .set_group_roles("finman", "acme", "G", &[binding])
            .await
            .unwrap_err();
        assert!(matches!(group_err, ApiError::Grant(_)));
    }

    #[tokio::test]
    async fn account_with_no_roles_pushes_nothing() {
        let f = fixture().await;

        let user = f
            .service
            .create("finman", "acme", input("A", vec![], &[]))
            .await
            .unwrap();

        assert!(user.grants.is_empty());
        assert!(creates(&f.engine.calls()).is_empty());
    }

    #[tokio::test]
    async fn duplicate_name_conflicts() {
        let f = fixture().await;
        f.service
            .create("finman", "acme", input("A", vec![], &[]))
            .await
            .unwrap();

        let err = f
            .service
            .create("finman", "acme", input("A", vec![], &[]))
            .await
            .unwrap_err();

        assert!(matches!(err, ApiError::Conflict(_)));
    }

    #[tokio::test]
    async fn missing_name_is_validation_error() {
        let f = fixture().await;

        let err = f
            .service
            .create("finman", "acme", input("  ", vec![], &[]))
            .await
            .unwrap_err();

        assert!(matches!(err, ApiError::Validation(_)));
    }

    #[tokio::test]
    async fn route_segment_name_is_reserved() {
        let f = fixture().await;

        let err = f
            .service
            .create("finman", "acme", input("id", vec![], &[]))
            .await
            .unwrap_err();

        assert!(matches!(err, ApiError::Validation(_)));
        assert!(f.identities.list(&f.org.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_role_is_not_found() {
        let f = fixture().await;

        let err = f
            .service
            .create("finman", "acme", input("A", vec![RoleBinding::new("GHOST")], &[]))
            .await
            .unwrap_err();

        assert!(matches!(err, ApiError::NotFound(ref what) if what.contains("GHOST")));
    }

    #[tokio::test]
    async fn project_role_without_project_is_rejected() {
        let f = fixture().await;

        let err = f
            .service
            .create("finman", "acme", input("A", vec![RoleBinding::new("R2")], &[]))
            .await
            .unwrap_err();

        assert!(matches!(err, ApiError::Grant(_)));
    }

    #[tokio::test]
    async fn engine_failure_rolls_back_create() {
        let f = fixture().await;
        f.engine
            .fail_writes(Some(EngineError::Unavailable("down".to_string())));

        let err = f
            .service
            .create("finman", "acme", input("A", vec![RoleBinding::new("R")], &["G"]))
            .await
            .unwrap_err();

        assert!(matches!(err, ApiError::Sync(_)));
        assert!(f.identities.list(&f.org.id).await.unwrap().is_empty());
        let group = f.store.group_by_name(&f.org.id, "G").await.unwrap().unwrap();
        assert!(f.store.group_members(&group.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn engine_failure_keeps_previous_roles_on_update() {
        let f = fixture().await;
        f.service
            .create("finman", "acme", input("A", vec![RoleBinding::new("R")], &[]))
            .await
            .unwrap();
        f.engine
            .fail_writes(Some(EngineError::Rejected("no".to_string())));

        let result = f
            .service
            .update(
                "finman",
                "acme",
                "A",
                UserUpdate {
                    roles: vec![RoleBinding::new("R2").in_project("P")],
                    ..Default::default()
                },
            )
            .await;

        assert!(result.is_err());
        f.engine.fail_writes(None);
        let user = f.service.get_by_name("finman", "acme", "A").await.unwrap();
        assert_eq!(user.grants.len(), 1);
        assert_eq!(user.grants[0].role, "R");
    }

    async fn held_policies(f: &Fixture, account: &AccountId) -> Vec<PolicyTuple> {
        let mut held = f
            .engine
            .list_policies(&PolicyFilter::for_subject(account_subject(account)))
            .await
            .unwrap();
        held.sort();
        held
    }

    async fn two_grant_user(f: &Fixture) -> User {
        f.service
            .create(
                "finman",
                "acme",
                input(
                    "A",
                    vec![RoleBinding::new("R"), RoleBinding::new("R2").in_project("P")],
                    &["G"],
                ),
            )
            .await
            .unwrap()
    }

    fn move_to_billing() -> UserUpdate {
        UserUpdate {
            roles: vec![RoleBinding::new("R2").in_project("billing")],
            groups: vec!["ops".to_string()],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn failed_create_on_update_keeps_engine_at_previous_grants() {
        let f = fixture().await;
        let user = two_grant_user(&f).await;
        let before = held_policies(&f, &user.id).await;
        f.engine.clear_calls();
        f.engine
            .fail_call("CreatePolicies", EngineError::Unavailable("down".to_string()));

        let result = f
            .service
            .update("finman", "acme", "A", move_to_billing())
            .await;

        assert!(matches!(result, Err(ApiError::Sync(_))));
        assert_eq!(held_policies(&f, &user.id).await, before);
        assert!(
            !f.engine
                .calls()
                .iter()
                .any(|c| matches!(c, EngineCall::RemovePolicies(_)))
        );
    }

    #[tokio::test]
    async fn failed_prune_on_update_withdraws_new_tuples() {
        let f = fixture().await;
        let user = two_grant_user(&f).await;
        let before = held_policies(&f, &user.id).await;
        f.engine
            .fail_call("RemovePolicies", EngineError::Unavailable("down".to_string()));

        let result = f
            .service
            .update("finman", "acme", "A", move_to_billing())
            .await;
        assert!(result.is_err());
        let stored = f.service.get_by_name("finman", "acme", "A").await.unwrap();
        assert_eq!(stored.grants.len(), 2);
        assert_eq!(held_policies(&f, &user.id).await, before);
    }

    #[tokio::test]
    async fn failed_membership_mirror_reverts_pushed_policies() {
        let f = fixture().await;
        let user = two_grant_user(&f).await;
        let before = held_policies(&f, &user.id).await;
        let groups_before = f.engine.user_groups();
        f.engine.clear_calls();
        f.engine
            .fail_call("CreateUserGroups", EngineError::Unavailable("down".to_string()));

        let result = f
            .service
            .update("finman", "acme", "A", move_to_billing())
            .await;

        assert!(result.is_err());
        assert_eq!(held_policies(&f, &user.id).await, before);
        assert_eq!(f.engine.user_groups(), groups_before);
        let policy_writes = f
            .engine
            .calls()
            .into_iter()
            .filter(|c| {
                matches!(
                    c,
                    EngineCall::CreatePolicies(_) | EngineCall::RemovePolicies(_)
                )
            })
            .count();
        // push, prune, then the revert's restore and withdraw
        assert_eq!(policy_writes, 4);
    }

    #[tokio::test]
    async fn failed_membership_delete_restores_policies() {
        let f = fixture().await;
        let user = two_grant_user(&f).await;
        let before = held_policies(&f, &user.id).await;
        f.engine
            .fail_call("DeleteUserGroups", EngineError::Unavailable("down".to_string()));

        let result = f.service.delete("finman", "acme", "A").await;

        assert!(matches!(result, Err(ApiError::Sync(_))));
        assert_eq!(held_policies(&f, &user.id).await, before);
        assert_eq!(f.engine.user_groups().len(), 1);
        assert!(f.service.get_by_name("finman", "acme", "A").await.is_ok());
    }

    #[tokio::test]
    async fn update_replaces_roles_and_prunes_engine() {
        let f = fixture().await;
        let user = f
            .service
            .create(
                "finman",
                "acme",
                input(
                    "A",
                    vec![RoleBinding::new("R"), RoleBinding::new("R2").in_project("P")],
                    &[],
                ),
            )
            .await
            .unwrap();

        f.service
            .update(
                "finman",
                "acme",
                "A",
                UserUpdate {
                    roles: vec![RoleBinding::new("R2").in_project("billing")],
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let policies = f
            .engine
            .list_policies(&PolicyFilter::for_subject(account_subject(&user.id)))
            .await
            .unwrap();
        assert_eq!(policies.len(), 1);
        assert_eq!(policies[0].proj, "billing");
    }

    #[tokio::test]
    async fn memberships_are_mirrored_to_engine() {
        let f = fixture().await;

        let user = f
            .service
            .create("finman", "acme", input("A", vec![], &["ops", "G"]))
            .await
            .unwrap();

        assert_eq!(user.groups, vec!["G".to_string(), "ops".to_string()]);
        let mirrored = f
            .engine
            .list_user_groups(&UserGroupFilter::for_user(account_subject(&user.id)))
            .await
            .unwrap();
        assert_eq!(mirrored.len(), 2);
        assert!(mirrored.iter().all(|ug| ug.org == "acme"));
    }

    #[tokio::test]
    async fn group_role_change_repushes_members() {
        let f = fixture().await;
        let user = f
            .service
            .create("finman", "acme", input("A", vec![], &["G"]))
            .await
            .unwrap();

        let roles = f
            .service
            .set_group_roles("finman", "acme", "G", &[RoleBinding::new("R2").in_project("P")])
            .await
            .unwrap();

        assert_eq!(roles.roles, vec![RoleBinding::new("R2").in_project("P")]);
        let policies = f
            .engine
            .list_policies(&PolicyFilter::for_subject(account_subject(&user.id)))
            .await
            .unwrap();
        assert_eq!(policies.len(), 1);
        assert_eq!(policies[0].obj, "R2");

        let read_back = f.service.group_roles("finman", "acme", "G").await.unwrap();
        assert_eq!(read_back, roles);
    }

    #[tokio::test]
    async fn group_role_change_rolls_back_on_engine_failure() {
        let f = fixture().await;
        f.service
            .create("finman", "acme", input("A", vec![], &["G"]))
            .await
            .unwrap();
        f.engine
            .fail_writes(Some(EngineError::Unavailable("down".to_string())));

        let result = f
            .service
            .set_group_roles("finman", "acme", "G", &[RoleBinding::new("R")])
            .await;

        assert!(result.is_err());
        let roles = f.service.group_roles("finman", "acme", "G").await.unwrap();
        assert!(roles.roles.is_empty());
    }

    #[tokio::test]
    async fn user_info_lists_role_permissions() {
        let f = fixture().await;
        f.service
            .create(
                "finman",
                "acme",
                input("A", vec![RoleBinding::new("R2").in_project("P")], &[]),
            )
            .await
            .unwrap();

        let info = f.service.user_info("finman", "acme", "A").await.unwrap();

        assert_eq!(info.email, "A@example.com");
        assert_eq!(
            info.permissions,
            vec![PermissionGrant {
                role: "R2".to_string(),
                project: "P".to_string(),
                namespace: "*".to_string(),
                group: None,
                permissions: vec!["project.read".to_string(), "project.write".to_string()],
            }]
        );
    }

    #[tokio::test]
    async fn list_filters_orders_and_pages() {
        let f = fixture().await;
        for (name, last) in [("a", "Zed"), ("b", "Young"), ("c", "Xu")] {
            let mut user = input(name, vec![], &[]);
            user.traits.last_name = last.to_string();
            if name != "b" {
                user.roles = vec![RoleBinding::new("R")];
            }
            f.service.create("finman", "acme", user).await.unwrap();
        }

        let by_role = f
            .service
            .list(
                "finman",
                "acme",
                &ListOptions {
                    role: Some("R".to_string()),
                    order_by: Some(OrderBy::LastName),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(by_role.count, 2);
        assert_eq!(
            by_role.items.iter().map(|u| u.name.as_str()).collect::<Vec<_>>(),
            vec!["c", "a"]
        );

        let paged = f
            .service
            .list(
                "finman",
                "acme",
                &ListOptions {
                    order_by: Some(OrderBy::Email),
                    order: SortOrder::Desc,
                    limit: Some(1),
                    offset: 1,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(paged.count, 3);
        assert_eq!(paged.items.len(), 1);
        assert_eq!(paged.items[0].name, "b");

        let searched = f
            .service
            .list(
                "finman",
                "acme",
                &ListOptions {
                    q: Some("YOU".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(searched.count, 1);
        assert_eq!(searched.items[0].name, "b");
    }

    #[tokio::test]
    async fn get_by_id_is_scoped_to_organization() {
        let f = fixture().await;
        let user = f
            .service
            .create("finman", "acme", input("A", vec![], &[]))
            .await
            .unwrap();
        let partner = f.store.partner_by_name("finman").await.unwrap().unwrap();
        f.store
            .create_organization(&partner.id, "other")
            .await
            .unwrap();

        let found = f
            .service
            .get_by_id("finman", "acme", &user.id.to_string())
            .await
            .unwrap();
        let elsewhere = f
            .service
            .get_by_id("finman", "other", &user.id.to_string())
            .await
            .unwrap_err();
        let malformed = f
            .service
            .get_by_id("finman", "acme", "not-a-uuid")
            .await
            .unwrap_err();

        assert_eq!(found.name, "A");
        assert!(matches!(elsewhere, ApiError::NotFound(_)));
        assert!(matches!(malformed, ApiError::Validation(_)));
    }

    #[tokio::test]
    async fn reconcile_restores_drifted_engine() {
        let f = fixture().await;
        let user = f
            .service
            .create("finman", "acme", input("A", vec![RoleBinding::new("R")], &["G"]))
            .await
            .unwrap();
        f.engine
            .delete_policies(&PolicyFilter::for_subject(account_subject(&user.id)))
            .await
            .unwrap();

        let report = f.service.reconcile("finman", "acme", "A").await.unwrap();

        assert_eq!(report.created, 1);
        let policies = f
            .engine
            .list_policies(&PolicyFilter::for_subject(account_subject(&user.id)))
            .await
            .unwrap();
        assert_eq!(policies.len(), 1);
    }

    #[tokio::test]
    async fn concurrent_updates_end_at_last_commit() {
        let f = fixture().await;
        let user = f
            .service
            .create("finman", "acme", input("A", vec![], &[]))
            .await
            .unwrap();
        let service = Arc::new(f.service);

        let first = {
            let service = Arc::clone(&service);
            tokio::spawn(async move {
                service
                    .update(
                        "finman",
                        "acme",
                        "A",
                        UserUpdate {
                            roles: vec![RoleBinding::new("R")],
                            ..Default::default()
                        },
                    )
                    .await
                    .unwrap()
            })
        };
        let second = {
            let service = Arc::clone(&service);
            tokio::spawn(async move {
                service
                    .update(
                        "finman",
                        "acme",
                        "A",
                        UserUpdate {
                            roles: vec![RoleBinding::new("R2").in_project("P")],
                            ..Default::default()
                        },
                    )
                    .await
                    .unwrap()
            })
        };
        first.await.unwrap();
        second.await.unwrap();

        let committed = service.get_by_name("finman", "acme", "A").await.unwrap();
        let (expected, _) = PolicySynchronizer::<InMemoryEngine>::desired_policies(
            &user.id,
            "acme",
            &committed.grants,
        );
        let mut pushed = f
            .engine
            .list_policies(&PolicyFilter::for_subject(account_subject(&user.id)))
            .await
            .unwrap();
        let mut expected = expected;
        pushed.sort();
        expected.sort();
        assert_eq!(pushed, expected);
    }

    #[tokio::test]
    async fn sync_metrics_are_recorded() {
        let f = fixture().await;
        let metrics = Arc::new(Metrics::new());
        let service = f.service.with_metrics(Arc::clone(&metrics));

        service
            .create("finman", "acme", input("A", vec![RoleBinding::new("R")], &[]))
            .await
            .unwrap();
        f.engine
            .fail_writes(Some(EngineError::Unavailable("down".to_string())));
        let _ = service
            .create("finman", "acme", input("B", vec![RoleBinding::new("R")], &[]))
            .await;

        assert_eq!(metrics.policies_pushed(), 1);
        assert_eq!(metrics.sync_failures(), 1);
    }

    #[test]
    fn normalize_drops_repeated_bindings() {
        let bindings = vec![
            RoleBinding::new("R"),
            RoleBinding::new(" R "),
            RoleBinding::new("R2").in_project("P"),
        ];

        let normalized = normalize_bindings(&bindings).unwrap();

        assert_eq!(
            normalized,
            vec![RoleBinding::new("R"), RoleBinding::new("R2").in_project("P")]
        );
    }
}
