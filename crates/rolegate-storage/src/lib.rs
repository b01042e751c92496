pub mod memory;
pub mod postgres;
pub mod traits;

pub use memory::{InMemoryIdentityProvider, InMemoryStore, InMemoryTransaction};
pub use postgres::{PostgresIdentityProvider, PostgresStore, PostgresTransaction};
pub use traits::{
    DirectoryStore, GroupRecord, Identity, IdentityProvider, IdentityTraits, MappingKey,
    MappingReader, MappingStore, MappingTransaction, OrganizationRecord, PartnerRecord,
    ProjectRecord, RoleRecord, StorageError, Tenancy,
};
