use std::future::Future;

use rolegate_core::grant::{GrantScope, RoleScope};
use rolegate_core::ids::{
    AccountId, GroupId, OrganizationId, PartnerId, ProjectId, RoleId,
};
use rolegate_core::resolver::{GroupRef, MappingRow, MappingSubject};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    Conflict(String),
    #[error("internal storage error: {0}")]
    Internal(String),
}

/// The partner and organization every request is scoped to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tenancy {
    pub partner_id: PartnerId,
    pub organization_id: OrganizationId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartnerRecord {
    pub id: PartnerId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrganizationRecord {
    pub id: OrganizationId,
    pub partner_id: PartnerId,
    pub name: String,
}

impl OrganizationRecord {
    pub fn tenancy(&self) -> Tenancy {
        Tenancy {
            partner_id: self.partner_id,
            organization_id: self.id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectRecord {
    pub id: ProjectId,
    pub organization_id: OrganizationId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleRecord {
    pub id: RoleId,
    pub name: String,
    pub scope: RoleScope,
    pub permissions: Vec<String>,
    pub builtin: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupRecord {
    pub id: GroupId,
    pub organization_id: OrganizationId,
    pub name: String,
}

/// A stored role mapping, identified by what it grants.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MappingKey {
    pub role_id: RoleId,
    pub project_id: Option<ProjectId>,
    pub namespace: Option<String>,
}

impl MappingKey {
    pub fn scope(&self) -> GrantScope {
        match (&self.project_id, &self.namespace) {
            (Some(_), Some(_)) => GrantScope::Namespace,
            (Some(_), None) => GrantScope::Project,
            _ => GrantScope::System,
        }
    }
}

/// Lookups of the hierarchy containers and roles by name.
pub trait DirectoryStore: Send + Sync {
    fn partner_by_name(
        &self,
        name: &str,
    ) -> impl Future<Output = Result<Option<PartnerRecord>, StorageError>> + Send;

    fn organization_by_name(
        &self,
        partner_id: &PartnerId,
        name: &str,
    ) -> impl Future<Output = Result<Option<OrganizationRecord>, StorageError>> + Send;

    fn project_by_name(
        &self,
        organization_id: &OrganizationId,
        name: &str,
    ) -> impl Future<Output = Result<Option<ProjectRecord>, StorageError>> + Send;

    fn project_by_id(
        &self,
        id: &ProjectId,
    ) -> impl Future<Output = Result<Option<ProjectRecord>, StorageError>> + Send;

    fn role_by_name(
        &self,
        name: &str,
    ) -> impl Future<Output = Result<Option<RoleRecord>, StorageError>> + Send;

    fn role_by_id(
        &self,
        id: &RoleId,
    ) -> impl Future<Output = Result<Option<RoleRecord>, StorageError>> + Send;

    fn group_by_name(
        &self,
        organization_id: &OrganizationId,
        name: &str,
    ) -> impl Future<Output = Result<Option<GroupRecord>, StorageError>> + Send;

    fn create_partner(
        &self,
        name: &str,
    ) -> impl Future<Output = Result<PartnerRecord, StorageError>> + Send;

    fn create_organization(
        &self,
        partner_id: &PartnerId,
        name: &str,
    ) -> impl Future<Output = Result<OrganizationRecord, StorageError>> + Send;

    fn create_project(
        &self,
        organization_id: &OrganizationId,
        name: &str,
    ) -> impl Future<Output = Result<ProjectRecord, StorageError>> + Send;

    fn create_group(
        &self,
        organization_id: &OrganizationId,
        name: &str,
    ) -> impl Future<Output = Result<GroupRecord, StorageError>> + Send;

    /// Inserts or updates a role by name, replacing its permission list.
    fn upsert_role(
        &self,
        name: &str,
        scope: RoleScope,
        permissions: &[String],
        builtin: bool,
    ) -> impl Future<Output = Result<RoleRecord, StorageError>> + Send;
}

/// Reads over role mappings and group memberships.
pub trait MappingReader: Send + Sync {
    fn account_groups(
        &self,
        account: &AccountId,
    ) -> impl Future<Output = Result<Vec<GroupRef>, StorageError>> + Send;

    /// Rows for one subject at one scope, names joined in, in insertion order.
    fn mappings(
        &self,
        subject: &MappingSubject,
        scope: GrantScope,
    ) -> impl Future<Output = Result<Vec<MappingRow>, StorageError>> + Send;

    fn subject_mappings(
        &self,
        subject: &MappingSubject,
    ) -> impl Future<Output = Result<Vec<MappingKey>, StorageError>> + Send;

    fn group_members(
        &self,
        group: &GroupId,
    ) -> impl Future<Output = Result<Vec<AccountId>, StorageError>> + Send;
}

/// Writes to role mappings and memberships, visible to the transaction's own
/// reads and to nobody else until [`MappingTransaction::commit`].
pub trait MappingTransaction: MappingReader {
    fn insert_mapping(
        &self,
        tenancy: &Tenancy,
        subject: &MappingSubject,
        key: &MappingKey,
    ) -> impl Future<Output = Result<(), StorageError>> + Send;

    fn delete_mapping(
        &self,
        subject: &MappingSubject,
        key: &MappingKey,
    ) -> impl Future<Output = Result<(), StorageError>> + Send;

    fn delete_subject_mappings(
        &self,
        subject: &MappingSubject,
    ) -> impl Future<Output = Result<(), StorageError>> + Send;

    /// Replaces the set of groups the account belongs to.
    fn set_account_groups(
        &self,
        account: &AccountId,
        groups: &[GroupId],
    ) -> impl Future<Output = Result<(), StorageError>> + Send;

    fn commit(self) -> impl Future<Output = Result<(), StorageError>> + Send;

    fn rollback(self) -> impl Future<Output = Result<(), StorageError>> + Send;
}

pub trait MappingStore: MappingReader {
    type Tx: MappingTransaction;

    /// Opens a write transaction. Writers are serialized; a second `begin`
    /// waits until the first transaction ends.
    fn begin(&self) -> impl Future<Output = Result<Self::Tx, StorageError>> + Send;
}

/// Profile fields kept by the identity provider.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityTraits {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub id: AccountId,
    pub tenancy: Tenancy,
    pub name: String,
    pub traits: IdentityTraits,
}

/// The external user-record store, keyed by account id.
pub trait IdentityProvider: Send + Sync {
    /// Fails with `Conflict` when the organization already has the name.
    fn create(
        &self,
        tenancy: &Tenancy,
        name: &str,
        traits: &IdentityTraits,
    ) -> impl Future<Output = Result<Identity, StorageError>> + Send;

    fn get(
        &self,
        id: &AccountId,
    ) -> impl Future<Output = Result<Option<Identity>, StorageError>> + Send;

    fn find_by_name(
        &self,
        organization_id: &OrganizationId,
        name: &str,
    ) -> impl Future<Output = Result<Option<Identity>, StorageError>> + Send;

    fn update(
        &self,
        id: &AccountId,
        traits: &IdentityTraits,
    ) -> impl Future<Output = Result<Identity, StorageError>> + Send;

    /// Deleting a missing record succeeds.
    fn delete(&self, id: &AccountId) -> impl Future<Output = Result<(), StorageError>> + Send;

    fn list(
        &self,
        organization_id: &OrganizationId,
    ) -> impl Future<Output = Result<Vec<Identity>, StorageError>> + Send;
}
