use rolegate_core::grant::RoleScope;
use rolegate_core::policy::RolePermissionMapping;
use rolegate_core::sync::{EnforcementEngine, PolicySynchronizer};
use rolegate_storage::{DirectoryStore, OrganizationRecord, RoleRecord, StorageError};

use crate::config::BootstrapConfig;
use crate::error::ApiError;

pub struct BuiltinRole {
    pub name: &'static str,
    pub scope: RoleScope,
    pub permissions: &'static [&'static str],
}

pub const BUILTIN_ROLES: &[BuiltinRole] = &[
    BuiltinRole {
        name: "SYSTEM_ADMIN",
        scope: RoleScope::System,
        permissions: &[
            "partner.read",
            "partner.write",
            "organization.read",
            "organization.write",
            "account.read",
            "account.write",
        ],
    },
    BuiltinRole {
        name: "ADMIN",
        scope: RoleScope::Organization,
        permissions: &[
            "account.read",
            "account.write",
            "project.read",
            "project.write",
            "group.read",
            "group.write",
            "role.read",
        ],
    },
    BuiltinRole {
        name: "ADMIN_READ_ONLY",
        scope: RoleScope::Organization,
        permissions: &["account.read", "project.read", "group.read", "role.read"],
    },
    BuiltinRole {
        name: "PROJECT_ADMIN",
        scope: RoleScope::Project,
        permissions: &[
            "project.read",
            "project.write",
            "cluster.read",
            "cluster.write",
            "namespace.read",
            "namespace.write",
        ],
    },
    BuiltinRole {
        name: "PROJECT_READ_ONLY",
        scope: RoleScope::Project,
        permissions: &["project.read", "cluster.read", "namespace.read"],
    },
    BuiltinRole {
        name: "NAMESPACE_ADMIN",
        scope: RoleScope::Project,
        permissions: &["namespace.read", "namespace.write"],
    },
];

/// Writes the built-in roles and replaces their permission lists in the
/// engine. Safe to run repeatedly.
pub async fn seed_roles<S, E>(
    store: &S,
    sync: &PolicySynchronizer<E>,
) -> Result<Vec<RoleRecord>, ApiError>
where
    S: DirectoryStore,
    E: EnforcementEngine,
{
    let mut records = Vec::with_capacity(BUILTIN_ROLES.len());
    for role in BUILTIN_ROLES {
        let permissions: Vec<String> = role.permissions.iter().map(|p| p.to_string()).collect();
        records.push(
            store
                .upsert_role(role.name, role.scope, &permissions, true)
                .await?,
        );
    }

    let mappings: Vec<RolePermissionMapping> = records
        .iter()
        .map(|r| RolePermissionMapping::new(r.name.clone(), r.permissions.clone()))
        .collect();
    sync.push_role_permissions(&mappings).await?;

    tracing::info!(roles = records.len(), "built-in roles seeded");
    Ok(records)
}

/// Returns the organization, creating it and its partner when missing.
pub async fn provision_organization<S: DirectoryStore>(
    store: &S,
    partner: &str,
    organization: &str,
) -> Result<OrganizationRecord, ApiError> {
    if partner.trim().is_empty() || organization.trim().is_empty() {
        return Err(ApiError::Validation(
            "partner and organization names are required".to_string(),
        ));
    }

    let partner_record = match store.partner_by_name(partner).await? {
        Some(existing) => existing,
        None => store.create_partner(partner).await?,
    };
    if let Some(existing) = store
        .organization_by_name(&partner_record.id, organization)
        .await?
    {
        return Ok(existing);
    }

    let created = store
        .create_organization(&partner_record.id, organization)
        .await?;
    tracing::info!(partner, organization, "organization provisioned");
    Ok(created)
}

/// Applies the `[bootstrap]` config section.
pub async fn provision_from_config<S: DirectoryStore>(
    store: &S,
    config: &BootstrapConfig,
) -> Result<Option<OrganizationRecord>, ApiError> {
    let Some((partner, organization)) = config.tenant() else {
        return Ok(None);
    };
    let org = provision_organization(store, partner, organization).await?;

    for project in &config.projects {
        ignore_conflict(store.create_project(&org.id, project).await)?;
    }
    for group in &config.groups {
        ignore_conflict(store.create_group(&org.id, group).await)?;
    }
    Ok(Some(org))
}

fn ignore_conflict<T>(result: Result<T, StorageError>) -> Result<(), StorageError> {
    match result {
        Ok(_) | Err(StorageError::Conflict(_)) => Ok(()),
        Err(e) => Err(e),
    }
}
