use std::sync::{Arc, Mutex, MutexGuard};

use rolegate_core::grant::{GrantScope, RoleScope};
use rolegate_core::ids::{
    AccountId, GroupId, OrganizationId, PartnerId, ProjectId, RoleId,
};
use rolegate_core::resolver::{GroupRef, MappingRow, MappingSubject};
use tokio::sync::OwnedMutexGuard;

use crate::traits::{
    DirectoryStore, GroupRecord, Identity, IdentityProvider, IdentityTraits, MappingKey,
    MappingReader, MappingStore, MappingTransaction, OrganizationRecord, PartnerRecord,
    ProjectRecord, RoleRecord, StorageError, Tenancy,
};

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>, StorageError> {
    mutex
        .lock()
        .map_err(|_| StorageError::Internal("in-memory state lock poisoned".to_string()))
}

#[derive(Debug, Default)]
struct DirectoryState {
    partners: Vec<PartnerRecord>,
    organizations: Vec<OrganizationRecord>,
    projects: Vec<ProjectRecord>,
    roles: Vec<RoleRecord>,
    groups: Vec<GroupRecord>,
}

impl DirectoryState {
    fn role_name(&self, id: &RoleId) -> Option<&str> {
        self.roles
            .iter()
            .find(|r| r.id == *id)
            .map(|r| r.name.as_str())
    }

    fn project_name(&self, id: &ProjectId) -> Option<&str> {
        self.projects
            .iter()
            .find(|p| p.id == *id)
            .map(|p| p.name.as_str())
    }

    fn group_name(&self, id: &GroupId) -> Option<&str> {
        self.groups
            .iter()
            .find(|g| g.id == *id)
            .map(|g| g.name.as_str())
    }
}

#[derive(Debug, Clone)]
struct StoredMapping {
    subject: MappingSubject,
    key: MappingKey,
}

#[derive(Debug, Clone, Default)]
struct MappingState {
    mappings: Vec<StoredMapping>,
    memberships: Vec<(GroupId, AccountId)>,
}

impl MappingState {
    fn account_groups(&self, directory: &DirectoryState, account: &AccountId) -> Vec<GroupRef> {
        self.memberships
            .iter()
            .filter(|(_, a)| a == account)
            .filter_map(|(g, _)| {
                directory.group_name(g).map(|name| GroupRef {
                    id: *g,
                    name: name.to_string(),
                })
            })
            .collect()
    }

    fn rows(
        &self,
        directory: &DirectoryState,
        subject: &MappingSubject,
        scope: GrantScope,
    ) -> Vec<MappingRow> {
        self.mappings
            .iter()
            .filter(|m| m.subject == *subject && m.key.scope() == scope)
            .filter_map(|m| {
                let role = directory.role_name(&m.key.role_id)?;
                Some(MappingRow {
                    role: role.to_string(),
                    project: m
                        .key
                        .project_id
                        .and_then(|p| directory.project_name(&p).map(str::to_string)),
                    namespace: m.key.namespace.clone(),
                })
            })
            .collect()
    }

    fn subject_mappings(&self, subject: &MappingSubject) -> Vec<MappingKey> {
        self.mappings
            .iter()
            .filter(|m| m.subject == *subject)
            .map(|m| m.key.clone())
            .collect()
    }

    fn group_members(&self, group: &GroupId) -> Vec<AccountId> {
        self.memberships
            .iter()
            .filter(|(g, _)| g == group)
            .map(|(_, a)| *a)
            .collect()
    }

    fn insert(&mut self, subject: &MappingSubject, key: &MappingKey) -> Result<(), StorageError> {
        if key.namespace.is_some() && key.project_id.is_none() {
            return Err(StorageError::Internal(
                "namespace mapping without project".to_string(),
            ));
        }
        if self
            .mappings
            .iter()
            .any(|m| m.subject == *subject && m.key == *key)
        {
            return Err(StorageError::Conflict(format!(
                "role mapping for role {}",
                key.role_id
            )));
        }
        self.mappings.push(StoredMapping {
            subject: *subject,
            key: key.clone(),
        });
        Ok(())
    }
}

/// Process-local store for development and tests.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    directory: Arc<Mutex<DirectoryState>>,
    committed: Arc<Mutex<MappingState>>,
    writer: Arc<tokio::sync::Mutex<()>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DirectoryStore for InMemoryStore {
    async fn partner_by_name(&self, name: &str) -> Result<Option<PartnerRecord>, StorageError> {
        let dir = lock(&self.directory)?;
        Ok(dir.partners.iter().find(|p| p.name == name).cloned())
    }

    async fn organization_by_name(
        &self,
        partner_id: &PartnerId,
        name: &str,
    ) -> Result<Option<OrganizationRecord>, StorageError> {
        let dir = lock(&self.directory)?;
        Ok(dir
            .organizations
            .iter()
            .find(|o| o.partner_id == *partner_id && o.name == name)
            .cloned())
    }

    async fn project_by_name(
        &self,
        organization_id: &OrganizationId,
        name: &str,
    ) -> Result<Option<ProjectRecord>, StorageError> {
        let dir = lock(&self.directory)?;
        Ok(dir
            .projects
            .iter()
            .find(|p| p.organization_id == *organization_id && p.name == name)
            .cloned())
    }

    async fn project_by_id(&self, id: &ProjectId) -> Result<Option<ProjectRecord>, StorageError> {
        let dir = lock(&self.directory)?;
        Ok(dir.projects.iter().find(|p| p.id == *id).cloned())
    }

    async fn role_by_name(&self, name: &str) -> Result<Option<RoleRecord>, StorageError> {
        let dir = lock(&self.directory)?;
        Ok(dir.roles.iter().find(|r| r.name == name).cloned())
    }

    async fn role_by_id(&self, id: &RoleId) -> Result<Option<RoleRecord>, StorageError> {
        let dir = lock(&self.directory)?;
        Ok(dir.roles.iter().find(|r| r.id == *id).cloned())
    }

    async fn group_by_name(
        &self,
        organization_id: &OrganizationId,
        name: &str,
    ) -> Result<Option<GroupRecord>, StorageError> {
        let dir = lock(&self.directory)?;
        Ok(dir
            .groups
            .iter()
            .find(|g| g.organization_id == *organization_id && g.name == name)
            .cloned())
    }

    async fn create_partner(&self, name: &str) -> Result<PartnerRecord, StorageError> {
        let mut dir = lock(&self.directory)?;
        if dir.partners.iter().any(|p| p.name == name) {
            return Err(StorageError::Conflict(format!("partner '{name}'")));
        }
        let record = PartnerRecord {
            id: PartnerId::generate(),
            name: name.to_string(),
        };
        dir.partners.push(record.clone());
        Ok(record)
    }

    async fn create_organization(
        &self,
        partner_id: &PartnerId,
        name: &str,
    ) -> Result<OrganizationRecord, StorageError> {
        let mut dir = lock(&self.directory)?;
        if !dir.partners.iter().any(|p| p.id == *partner_id) {
            return Err(StorageError::NotFound(format!("partner {partner_id}")));
        }
        if dir
            .organizations
            .iter()
            .any(|o| o.partner_id == *partner_id && o.name == name)
        {
            return Err(StorageError::Conflict(format!("organization '{name}'")));
        }
        let record = OrganizationRecord {
            id: OrganizationId::generate(),
            partner_id: *partner_id,
            name: name.to_string(),
        };
        dir.organizations.push(record.clone());
        Ok(record)
    }

    async fn create_project(
        &self,
        organization_id: &OrganizationId,
        name: &str,
    ) -> Result<ProjectRecord, StorageError> {
        let mut dir = lock(&self.directory)?;
        if dir
            .projects
            .iter()
            .any(|p| p.organization_id == *organization_id && p.name == name)
        {
            return Err(StorageError::Conflict(format!("project '{name}'")));
        }
        let record = ProjectRecord {
            id: ProjectId::generate(),
            organization_id: *organization_id,
            name: name.to_string(),
        };
        dir.projects.push(record.clone());
        Ok(record)
    }

    async fn create_group(
        &self,
        organization_id: &OrganizationId,
        name: &str,
    ) -> Result<GroupRecord, StorageError> {
        let mut dir = lock(&self.directory)?;
        if dir
            .groups
            .iter()
            .any(|g| g.organization_id == *organization_id && g.name == name)
        {
            return Err(StorageError::Conflict(format!("group '{name}'")));
        }
        let record = GroupRecord {
            id: GroupId::generate(),
            organization_id: *organization_id,
            name: name.to_string(),
        };
        dir.groups.push(record.clone());
        Ok(record)
    }

    async fn upsert_role(
        &self,
        name: &str,
        scope: RoleScope,
        permissions: &[String],
        builtin: bool,
    ) -> Result<RoleRecord, StorageError> {
        let mut dir = lock(&self.directory)?;
        if let Some(existing) = dir.roles.iter_mut().find(|r| r.name == name) {
            existing.scope = scope;
            existing.permissions = permissions.to_vec();
            existing.builtin = builtin;
            return Ok(existing.clone());
        }
        let record = RoleRecord {
            id: RoleId::generate(),
            name: name.to_string(),
            scope,
            permissions: permissions.to_vec(),
            builtin,
        };
        dir.roles.push(record.clone());
        Ok(record)
    }
}

impl MappingReader for InMemoryStore {
    async fn account_groups(&self, account: &AccountId) -> Result<Vec<GroupRef>, StorageError> {
        let state = lock(&self.committed)?;
        let dir = lock(&self.directory)?;
        Ok(state.account_groups(&dir, account))
    }

    async fn mappings(
        &self,
        subject: &MappingSubject,
        scope: GrantScope,
    ) -> Result<Vec<MappingRow>, StorageError> {
        let state = lock(&self.committed)?;
        let dir = lock(&self.directory)?;
        Ok(state.rows(&dir, subject, scope))
    }

    async fn subject_mappings(
        &self,
        subject: &MappingSubject,
    ) -> Result<Vec<MappingKey>, StorageError> {
        Ok(lock(&self.committed)?.subject_mappings(subject))
    }

    async fn group_members(&self, group: &GroupId) -> Result<Vec<AccountId>, StorageError> {
        Ok(lock(&self.committed)?.group_members(group))
    }
}

impl MappingStore for InMemoryStore {
    type Tx = InMemoryTransaction;

    async fn begin(&self) -> Result<InMemoryTransaction, StorageError> {
        let writer = Arc::clone(&self.writer).lock_owned().await;
        let working = lock(&self.committed)?.clone();
        Ok(InMemoryTransaction {
            store: self.clone(),
            working: Mutex::new(working),
            _writer: writer,
        })
    }
}

/// A copy-on-begin write transaction. Holding it blocks other writers.
pub struct InMemoryTransaction {
    store: InMemoryStore,
    working: Mutex<MappingState>,
    _writer: OwnedMutexGuard<()>,
}

impl MappingReader for InMemoryTransaction {
    async fn account_groups(&self, account: &AccountId) -> Result<Vec<GroupRef>, StorageError> {
        let state = lock(&self.working)?;
        let dir = lock(&self.store.directory)?;
        Ok(state.account_groups(&dir, account))
    }

    async fn mappings(
        &self,
        subject: &MappingSubject,
        scope: GrantScope,
    ) -> Result<Vec<MappingRow>, StorageError> {
        let state = lock(&self.working)?;
        let dir = lock(&self.store.directory)?;
        Ok(state.rows(&dir, subject, scope))
    }

    async fn subject_mappings(
        &self,
        subject: &MappingSubject,
    ) -> Result<Vec<MappingKey>, StorageError> {
        Ok(lock(&self.working)?.subject_mappings(subject))
    }

    async fn group_members(&self, group: &GroupId) -> Result<Vec<AccountId>, StorageError> {
        Ok(lock(&self.working)?.group_members(group))
    }
}

impl MappingTransaction for InMemoryTransaction {
    async fn insert_mapping(
        &self,
        _tenancy: &Tenancy,
        subject: &MappingSubject,
        key: &MappingKey,
    ) -> Result<(), StorageError> {
        lock(&self.working)?.insert(subject, key)
    }

    async fn delete_mapping(
        &self,
        subject: &MappingSubject,
        key: &MappingKey,
    ) -> Result<(), StorageError> {
        lock(&self.working)?
            .mappings
            .retain(|m| !(m.subject == *subject && m.key == *key));
        Ok(())
    }

    async fn delete_subject_mappings(&self, subject: &MappingSubject) -> Result<(), StorageError> {
        lock(&self.working)?
            .mappings
            .retain(|m| m.subject != *subject);
        Ok(())
    }

    async fn set_account_groups(
        &self,
        account: &AccountId,
        groups: &[GroupId],
    ) -> Result<(), StorageError> {
        let mut state = lock(&self.working)?;
        state.memberships.retain(|(_, a)| a != account);
        for group in groups {
            if !state.memberships.contains(&(*group, *account)) {
                state.memberships.push((*group, *account));
            }
        }
        Ok(())
    }

    async fn commit(self) -> Result<(), StorageError> {
        let working = self
            .working
            .into_inner()
            .map_err(|_| StorageError::Internal("in-memory state lock poisoned".to_string()))?;
        *lock(&self.store.committed)? = working;
        Ok(())
    }

    async fn rollback(self) -> Result<(), StorageError> {
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryIdentityProvider {
    identities: Mutex<Vec<Identity>>,
}

impl InMemoryIdentityProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IdentityProvider for InMemoryIdentityProvider {
    async fn create(
        &self,
        tenancy: &Tenancy,
        name: &str,
        traits: &IdentityTraits,
    ) -> Result<Identity, StorageError> {
        let mut identities = lock(&self.identities)?;
        if identities
            .iter()
            .any(|i| i.tenancy.organization_id == tenancy.organization_id && i.name == name)
        {
            return Err(StorageError::Conflict(format!("identity '{name}'")));
        }
        let identity = Identity {
            id: AccountId::generate(),
            tenancy: *tenancy,
            name: name.to_string(),
            traits: traits.clone(),
        };
        identities.push(identity.clone());
        Ok(identity)
    }

    async fn get(&self, id: &AccountId) -> Result<Option<Identity>, StorageError> {
        Ok(lock(&self.identities)?.iter().find(|i| i.id == *id).cloned())
    }

    async fn find_by_name(
        &self,
        organization_id: &OrganizationId,
        name: &str,
    ) -> Result<Option<Identity>, StorageError> {
        Ok(lock(&self.identities)?
            .iter()
            .find(|i| i.tenancy.organization_id == *organization_id && i.name == name)
            .cloned())
    }

    async fn update(
        &self,
        id: &AccountId,
        traits: &IdentityTraits,
    ) -> Result<Identity, StorageError> {
        let mut identities = lock(&self.identities)?;
        let identity = identities
            .iter_mut()
            .find(|i| i.id == *id)
            .ok_or_else(|| StorageError::NotFound(format!("identity {id}")))?;
        identity.traits = traits.clone();
        Ok(identity.clone())
    }

    async fn delete(&self, id: &AccountId) -> Result<(), StorageError> {
        lock(&self.identities)?.retain(|i| i.id != *id);
        Ok(())
    }

    async fn list(&self, organization_id: &OrganizationId) -> Result<Vec<Identity>, StorageError> {
        Ok(lock(&self.identities)?
            .iter()
            .filter(|i| i.tenancy.organization_id == *organization_id)
            .cloned()
            .collect())
    }
}
