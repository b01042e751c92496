pub mod migrations;
mod queries;

use rolegate_core::grant::{GrantScope, RoleScope};
use rolegate_core::ids::{
    AccountId, GroupId, OrganizationId, PartnerId, ProjectId, RoleId,
};
use rolegate_core::resolver::{GroupRef, MappingRow, MappingSubject};
use sqlx::{PgPool, Postgres, Transaction};
use tokio::sync::Mutex;

use crate::traits::{
    DirectoryStore, GroupRecord, Identity, IdentityProvider, IdentityTraits, MappingKey,
    MappingReader, MappingStore, MappingTransaction, OrganizationRecord, PartnerRecord,
    ProjectRecord, RoleRecord, StorageError, Tenancy,
};

use queries::to_storage_error;

// Taken at the start of every mapping transaction so that writers queue
// behind each other instead of interleaving deletes and inserts.
const MAPPING_WRITER_LOCK: i64 = 0x726f_6c65_6761_7465;

#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

impl DirectoryStore for PostgresStore {
    async fn partner_by_name(&self, name: &str) -> Result<Option<PartnerRecord>, StorageError> {
        queries::partner_by_name(&self.pool, name).await
    }

    async fn organization_by_name(
        &self,
        partner_id: &PartnerId,
        name: &str,
    ) -> Result<Option<OrganizationRecord>, StorageError> {
        queries::organization_by_name(&self.pool, partner_id, name).await
    }

    async fn project_by_name(
        &self,
        organization_id: &OrganizationId,
        name: &str,
    ) -> Result<Option<ProjectRecord>, StorageError> {
        queries::project_by_name(&self.pool, organization_id, name).await
    }

    async fn project_by_id(&self, id: &ProjectId) -> Result<Option<ProjectRecord>, StorageError> {
        queries::project_by_id(&self.pool, id).await
    }

    async fn role_by_name(&self, name: &str) -> Result<Option<RoleRecord>, StorageError> {
        queries::role_by_name(&self.pool, name).await
    }

    async fn role_by_id(&self, id: &RoleId) -> Result<Option<RoleRecord>, StorageError> {
        queries::role_by_id(&self.pool, id).await
    }

    async fn group_by_name(
        &self,
        organization_id: &OrganizationId,
        name: &str,
    ) -> Result<Option<GroupRecord>, StorageError> {
        queries::group_by_name(&self.pool, organization_id, name).await
    }

    async fn create_partner(&self, name: &str) -> Result<PartnerRecord, StorageError> {
        queries::insert_partner(&self.pool, name).await
    }

    async fn create_organization(
        &self,
        partner_id: &PartnerId,
        name: &str,
    ) -> Result<OrganizationRecord, StorageError> {
        queries::insert_organization(&self.pool, partner_id, name).await
    }

    async fn create_project(
        &self,
        organization_id: &OrganizationId,
        name: &str,
    ) -> Result<ProjectRecord, StorageError> {
        queries::insert_project(&self.pool, organization_id, name).await
    }

    async fn create_group(
        &self,
        organization_id: &OrganizationId,
        name: &str,
    ) -> Result<GroupRecord, StorageError> {
        queries::insert_group(&self.pool, organization_id, name).await
    }

    async fn upsert_role(
        &self,
        name: &str,
        scope: RoleScope,
        permissions: &[String],
        builtin: bool,
    ) -> Result<RoleRecord, StorageError> {
        let mut tx = self.pool.begin().await.map_err(to_storage_error)?;
        let role_id = queries::upsert_role_row(&mut *tx, name, scope, builtin).await?;
        queries::replace_role_permissions(&mut tx, &role_id, permissions).await?;
        tx.commit().await.map_err(to_storage_error)?;

        let mut permissions = permissions.to_vec();
        permissions.sort();
        permissions.dedup();
        Ok(RoleRecord {
            id: role_id,
            name: name.to_string(),
            scope,
            permissions,
            builtin,
        })
    }
}

impl MappingReader for PostgresStore {
    async fn account_groups(&self, account: &AccountId) -> Result<Vec<GroupRef>, StorageError> {
        queries::account_groups(&self.pool, account).await
    }

    async fn mappings(
        &self,
        subject: &MappingSubject,
        scope: GrantScope,
    ) -> Result<Vec<MappingRow>, StorageError> {
        queries::mapping_rows(&self.pool, subject, scope).await
    }

    async fn subject_mappings(
        &self,
        subject: &MappingSubject,
    ) -> Result<Vec<MappingKey>, StorageError> {
        queries::subject_mappings(&self.pool, subject).await
    }

    async fn group_members(&self, group: &GroupId) -> Result<Vec<AccountId>, StorageError> {
        queries::group_members(&self.pool, group).await
    }
}

impl MappingStore for PostgresStore {
    type Tx = PostgresTransaction;

    async fn begin(&self) -> Result<PostgresTransaction, StorageError> {
        let mut tx = self.pool.begin().await.map_err(to_storage_error)?;
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(MAPPING_WRITER_LOCK)
            .execute(&mut *tx)
            .await
            .map_err(to_storage_error)?;
        Ok(PostgresTransaction {
            tx: Mutex::new(Some(tx)),
        })
    }
}

pub struct PostgresTransaction {
    tx: Mutex<Option<Transaction<'static, Postgres>>>,
}

fn closed() -> StorageError {
    StorageError::Internal("transaction already finished".to_string())
}

// Borrows the live transaction as an executor for the body.
macro_rules! with_tx {
    ($self:ident, |$conn:ident| $body:expr) => {{
        let mut guard = $self.tx.lock().await;
        let tx = guard.as_mut().ok_or_else(closed)?;
        let $conn = &mut **tx;
        $body.await
    }};
}

impl MappingReader for PostgresTransaction {
    async fn account_groups(&self, account: &AccountId) -> Result<Vec<GroupRef>, StorageError> {
        with_tx!(self, |conn| queries::account_groups(conn, account))
    }

    async fn mappings(
        &self,
        subject: &MappingSubject,
        scope: GrantScope,
    ) -> Result<Vec<MappingRow>, StorageError> {
        with_tx!(self, |conn| queries::mapping_rows(conn, subject, scope))
    }

    async fn subject_mappings(
        &self,
        subject: &MappingSubject,
    ) -> Result<Vec<MappingKey>, StorageError> {
        with_tx!(self, |conn| queries::subject_mappings(conn, subject))
    }

    async fn group_members(&self, group: &GroupId) -> Result<Vec<AccountId>, StorageError> {
        with_tx!(self, |conn| queries::group_members(conn, group))
    }
}

impl MappingTransaction for PostgresTransaction {
    async fn insert_mapping(
        &self,
        tenancy: &Tenancy,
        subject: &MappingSubject,
        key: &MappingKey,
    ) -> Result<(), StorageError> {
        with_tx!(self, |conn| queries::insert_mapping(conn, tenancy, subject, key))
    }

    async fn delete_mapping(
        &self,
        subject: &MappingSubject,
        key: &MappingKey,
    ) -> Result<(), StorageError> {
        with_tx!(self, |conn| queries::delete_mapping(conn, subject, key))
    }

    async fn delete_subject_mappings(&self, subject: &MappingSubject) -> Result<(), StorageError> {
        with_tx!(self, |conn| queries::delete_subject_mappings(conn, subject))
    }

    async fn set_account_groups(
        &self,
        account: &AccountId,
        groups: &[GroupId],
    ) -> Result<(), StorageError> {
        let mut guard = self.tx.lock().await;
        let tx = guard.as_mut().ok_or_else(closed)?;
        queries::delete_account_groups(&mut **tx, account).await?;
        for group in groups {
            queries::insert_account_group(&mut **tx, account, group).await?;
        }
        Ok(())
    }

    async fn commit(self) -> Result<(), StorageError> {
        let tx = self.tx.into_inner().ok_or_else(closed)?;
        tx.commit().await.map_err(to_storage_error)
    }

    async fn rollback(self) -> Result<(), StorageError> {
        let tx = self.tx.into_inner().ok_or_else(closed)?;
        tx.rollback().await.map_err(to_storage_error)
    }
}

/// Identity records kept in the `identities` table with JSON traits.
#[derive(Debug, Clone)]
pub struct PostgresIdentityProvider {
    pool: PgPool,
}

impl PostgresIdentityProvider {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl IdentityProvider for PostgresIdentityProvider {
    async fn create(
        &self,
        tenancy: &Tenancy,
        name: &str,
        traits: &IdentityTraits,
    ) -> Result<Identity, StorageError> {
        queries::insert_identity(&self.pool, tenancy, name, traits).await
    }

    async fn get(&self, id: &AccountId) -> Result<Option<Identity>, StorageError> {
        queries::identity_by_id(&self.pool, id).await
    }

    async fn find_by_name(
        &self,
        organization_id: &OrganizationId,
        name: &str,
    ) -> Result<Option<Identity>, StorageError> {
        queries::identity_by_name(&self.pool, organization_id, name).await
    }

    async fn update(
        &self,
        id: &AccountId,
        traits: &IdentityTraits,
    ) -> Result<Identity, StorageError> {
        queries::update_identity(&self.pool, id, traits).await
    }

    async fn delete(&self, id: &AccountId) -> Result<(), StorageError> {
        queries::delete_identity(&self.pool, id).await
    }

    async fn list(&self, organization_id: &OrganizationId) -> Result<Vec<Identity>, StorageError> {
        queries::list_identities(&self.pool, organization_id).await
    }
}
