use std::sync::Arc;

use rolegate_core::grant::GrantScope;
use rolegate_core::ids::AccountId;
use rolegate_core::resolver::{
    GroupRef, MappingRow, MappingSubject, ResolveError, RoleMappingReader,
};
use rolegate_storage::{MappingReader, StorageError};

fn to_resolve_error(err: StorageError) -> ResolveError {
    ResolveError::StorageError(err.to_string())
}

/// Resolves against committed store state.
pub struct StoreMappingReader<S: MappingReader> {
    store: Arc<S>,
}

impl<S: MappingReader> StoreMappingReader<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }
}

impl<S: MappingReader> RoleMappingReader for StoreMappingReader<S> {
    async fn account_groups(&self, account: &AccountId) -> Result<Vec<GroupRef>, ResolveError> {
        self.store
            .account_groups(account)
            .await
            .map_err(to_resolve_error)
    }

    async fn mappings(
        &self,
        subject: &MappingSubject,
        scope: GrantScope,
    ) -> Result<Vec<MappingRow>, ResolveError> {
        self.store
            .mappings(subject, scope)
            .await
            .map_err(to_resolve_error)
    }
}

/// Resolves against an open transaction, including its uncommitted writes.
pub struct TxMappingReader<'a, T: MappingReader> {
    tx: &'a T,
}

impl<'a, T: MappingReader> TxMappingReader<'a, T> {
    pub fn new(tx: &'a T) -> Self {
        Self { tx }
    }
}

impl<T: MappingReader> RoleMappingReader for TxMappingReader<'_, T> {
    async fn account_groups(&self, account: &AccountId) -> Result<Vec<GroupRef>, ResolveError> {
        self.tx
            .account_groups(account)
            .await
            .map_err(to_resolve_error)
    }

    async fn mappings(
        &self,
        subject: &MappingSubject,
        scope: GrantScope,
    ) -> Result<Vec<MappingRow>, ResolveError> {
        self.tx
            .mappings(subject, scope)
            .await
            .map_err(to_resolve_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rolegate_core::grant::RoleScope;
    use rolegate_core::resolver::resolve_grants;
    use rolegate_storage::{
        DirectoryStore, InMemoryStore, MappingKey, MappingStore, MappingTransaction,
    };

    #[tokio::test]
    async fn adapter_reads_committed_mappings() {
        let store = Arc::new(InMemoryStore::new());
        let partner = store.create_partner("finman").await.unwrap();
        let org = store.create_organization(&partner.id, "acme").await.unwrap();
        let role = store
            .upsert_role("ADMIN", RoleScope::Organization, &[], true)
            .await
            .unwrap();
        let account = AccountId::generate();
        let tx = store.begin().await.unwrap();
        tx.insert_mapping(
            &org.tenancy(),
            &MappingSubject::Account(account),
            &MappingKey {
                role_id: role.id,
                project_id: None,
                namespace: None,
            },
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();

        let adapter = StoreMappingReader::new(Arc::clone(&store));
        let rows = adapter
            .mappings(&MappingSubject::Account(account), GrantScope::System)
            .await
            .unwrap();

        assert_eq!(rows, vec![MappingRow::system("ADMIN")]);
    }

    #[tokio::test]
    async fn tx_adapter_sees_uncommitted_writes() {
        let store = Arc::new(InMemoryStore::new());
        let partner = store.create_partner("finman").await.unwrap();
        let org = store.create_organization(&partner.id, "acme").await.unwrap();
        let role = store
            .upsert_role("ADMIN", RoleScope::Organization, &[], true)
            .await
            .unwrap();
        let account = AccountId::generate();
        let tx = store.begin().await.unwrap();
        tx.insert_mapping(
            &org.tenancy(),
            &MappingSubject::Account(account),
            &MappingKey {
                role_id: role.id,
                project_id: None,
                namespace: None,
            },
        )
        .await
        .unwrap();

        let in_tx = resolve_grants(&TxMappingReader::new(&tx), &account)
            .await
            .unwrap();
        let committed = resolve_grants(&StoreMappingReader::new(Arc::clone(&store)), &account)
            .await
            .unwrap();

        assert_eq!(in_tx.len(), 1);
        assert!(committed.is_empty());
        tx.rollback().await.unwrap();
    }
}
