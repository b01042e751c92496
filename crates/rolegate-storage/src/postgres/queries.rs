use rolegate_core::grant::{GrantScope, RoleScope};
use rolegate_core::ids::{
    AccountId, GroupId, OrganizationId, PartnerId, ProjectId, RoleId,
};
use rolegate_core::resolver::{GroupRef, MappingRow, MappingSubject};
use sqlx::types::Json;
use uuid::Uuid;

use crate::traits::{
    GroupRecord, Identity, IdentityTraits, MappingKey, OrganizationRecord, PartnerRecord,
    ProjectRecord, RoleRecord, StorageError, Tenancy,
};

pub(super) fn to_storage_error(e: sqlx::Error) -> StorageError {
    StorageError::Internal(e.to_string())
}

fn conflict_or_internal(what: impl Into<String>) -> impl FnOnce(sqlx::Error) -> StorageError {
    let what = what.into();
    move |e| {
        if let sqlx::Error::Database(ref db_err) = e
            && db_err.is_unique_violation()
        {
            return StorageError::Conflict(what);
        }
        to_storage_error(e)
    }
}

fn subject_columns(subject: &MappingSubject) -> (&'static str, Uuid) {
    match subject {
        MappingSubject::Account(id) => ("account", *id.as_uuid()),
        MappingSubject::Group(id) => ("group", *id.as_uuid()),
    }
}

// --- directory ---

pub async fn partner_by_name<'e>(
    executor: impl sqlx::PgExecutor<'e>,
    name: &str,
) -> Result<Option<PartnerRecord>, StorageError> {
    let row: Option<(Uuid, String)> =
        sqlx::query_as("SELECT id, name FROM partners WHERE name = $1")
            .bind(name)
            .fetch_optional(executor)
            .await
            .map_err(to_storage_error)?;
    Ok(row.map(|(id, name)| PartnerRecord {
        id: PartnerId::new(id),
        name,
    }))
}

pub async fn insert_partner<'e>(
    executor: impl sqlx::PgExecutor<'e>,
    name: &str,
) -> Result<PartnerRecord, StorageError> {
    let id = PartnerId::generate();
    sqlx::query("INSERT INTO partners (id, name) VALUES ($1, $2)")
        .bind(id.as_uuid())
        .bind(name)
        .execute(executor)
        .await
        .map_err(conflict_or_internal(format!("partner '{name}'")))?;
    Ok(PartnerRecord {
        id,
        name: name.to_string(),
    })
}

pub async fn organization_by_name<'e>(
    executor: impl sqlx::PgExecutor<'e>,
    partner_id: &PartnerId,
    name: &str,
) -> Result<Option<OrganizationRecord>, StorageError> {
    let row: Option<(Uuid, String)> = sqlx::query_as(
        "SELECT id, name FROM organizations WHERE partner_id = $1 AND name = $2",
    )
    .bind(partner_id.as_uuid())
    .bind(name)
    .fetch_optional(executor)
    .await
    .map_err(to_storage_error)?;
    Ok(row.map(|(id, name)| OrganizationRecord {
        id: OrganizationId::new(id),
        partner_id: *partner_id,
        name,
    }))
}

pub async fn insert_organization<'e>(
    executor: impl sqlx::PgExecutor<'e>,
    partner_id: &PartnerId,
    name: &str,
) -> Result<OrganizationRecord, StorageError> {
    let id = OrganizationId::generate();
    sqlx::query("INSERT INTO organizations (id, partner_id, name) VALUES ($1, $2, $3)")
        .bind(id.as_uuid())
        .bind(partner_id.as_uuid())
        .bind(name)
        .execute(executor)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(ref db_err) = e
                && db_err.is_foreign_key_violation()
            {
                return StorageError::NotFound(format!("partner {partner_id}"));
            }
            conflict_or_internal(format!("organization '{name}'"))(e)
        })?;
    Ok(OrganizationRecord {
        id,
        partner_id: *partner_id,
        name: name.to_string(),
    })
}

pub async fn project_by_name<'e>(
    executor: impl sqlx::PgExecutor<'e>,
    organization_id: &OrganizationId,
    name: &str,
) -> Result<Option<ProjectRecord>, StorageError> {
    let row: Option<(Uuid, String)> =
        sqlx::query_as("SELECT id, name FROM projects WHERE organization_id = $1 AND name = $2")
            .bind(organization_id.as_uuid())
            .bind(name)
            .fetch_optional(executor)
            .await
            .map_err(to_storage_error)?;
    Ok(row.map(|(id, name)| ProjectRecord {
        id: ProjectId::new(id),
        organization_id: *organization_id,
        name,
    }))
}

pub async fn project_by_id<'e>(
    executor: impl sqlx::PgExecutor<'e>,
    id: &ProjectId,
) -> Result<Option<ProjectRecord>, StorageError> {
    let row: Option<(Uuid, Uuid, String)> =
        sqlx::query_as("SELECT id, organization_id, name FROM projects WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(executor)
            .await
            .map_err(to_storage_error)?;
    Ok(row.map(|(id, organization_id, name)| ProjectRecord {
        id: ProjectId::new(id),
        organization_id: OrganizationId::new(organization_id),
        name,
    }))
}

pub async fn insert_project<'e>(
    executor: impl sqlx::PgExecutor<'e>,
    organization_id: &OrganizationId,
    name: &str,
) -> Result<ProjectRecord, StorageError> {
    let id = ProjectId::generate();
    sqlx::query("INSERT INTO projects (id, organization_id, name) VALUES ($1, $2, $3)")
        .bind(id.as_uuid())
        .bind(organization_id.as_uuid())
        .bind(name)
        .execute(executor)
        .await
        .map_err(conflict_or_internal(format!("project '{name}'")))?;
    Ok(ProjectRecord {
        id,
        organization_id: *organization_id,
        name: name.to_string(),
    })
}

type RoleRow = (Uuid, String, String, bool, Vec<String>);

const SELECT_ROLE: &str = r#"
    SELECT r.id, r.name, r.scope, r.builtin,
           COALESCE(array_agg(rp.permission ORDER BY rp.permission)
                    FILTER (WHERE rp.permission IS NOT NULL), '{}'::text[]) AS permissions
    FROM roles r
    LEFT JOIN role_permissions rp ON rp.role_id = r.id
"#;

fn role_from_row(row: RoleRow) -> Result<RoleRecord, StorageError> {
    let (id, name, scope, builtin, permissions) = row;
    let scope: RoleScope = scope
        .parse()
        .map_err(|e| StorageError::Internal(format!("role '{name}': {e}")))?;
    Ok(RoleRecord {
        id: RoleId::new(id),
        name,
        scope,
        permissions,
        builtin,
    })
}

pub async fn role_by_name<'e>(
    executor: impl sqlx::PgExecutor<'e>,
    name: &str,
) -> Result<Option<RoleRecord>, StorageError> {
    let query = format!("{SELECT_ROLE} WHERE r.name = $1 GROUP BY r.id");
    let row: Option<RoleRow> = sqlx::query_as(&query)
        .bind(name)
        .fetch_optional(executor)
        .await
        .map_err(to_storage_error)?;
    row.map(role_from_row).transpose()
}

pub async fn role_by_id<'e>(
    executor: impl sqlx::PgExecutor<'e>,
    id: &RoleId,
) -> Result<Option<RoleRecord>, StorageError> {
    let query = format!("{SELECT_ROLE} WHERE r.id = $1 GROUP BY r.id");
    let row: Option<RoleRow> = sqlx::query_as(&query)
        .bind(id.as_uuid())
        .fetch_optional(executor)
        .await
        .map_err(to_storage_error)?;
    row.map(role_from_row).transpose()
}

/// Inserts the role or updates its scope, returning the stored id.
pub async fn upsert_role_row<'e>(
    executor: impl sqlx::PgExecutor<'e>,
    name: &str,
    scope: RoleScope,
    builtin: bool,
) -> Result<RoleId, StorageError> {
    let row: (Uuid,) = sqlx::query_as(
        r#"
        INSERT INTO roles (id, name, scope, builtin)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (name) DO UPDATE SET scope = EXCLUDED.scope, builtin = EXCLUDED.builtin
        RETURNING id
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(name)
    .bind(scope.as_str())
    .bind(builtin)
    .fetch_one(executor)
    .await
    .map_err(to_storage_error)?;
    Ok(RoleId::new(row.0))
}

pub async fn replace_role_permissions(
    conn: &mut sqlx::PgConnection,
    role_id: &RoleId,
    permissions: &[String],
) -> Result<(), StorageError> {
    sqlx::query("DELETE FROM role_permissions WHERE role_id = $1")
        .bind(role_id.as_uuid())
        .execute(&mut *conn)
        .await
        .map_err(to_storage_error)?;
    for permission in permissions {
        sqlx::query(
            "INSERT INTO role_permissions (role_id, permission) VALUES ($1, $2) ON CONFLICT DO NOTHING",
        )
        .bind(role_id.as_uuid())
        .bind(permission)
        .execute(&mut *conn)
        .await
        .map_err(to_storage_error)?;
    }
    Ok(())
}

pub async fn group_by_name<'e>(
    executor: impl sqlx::PgExecutor<'e>,
    organization_id: &OrganizationId,
    name: &str,
) -> Result<Option<GroupRecord>, StorageError> {
    let row: Option<(Uuid, String)> =
        sqlx::query_as("SELECT id, name FROM groups WHERE organization_id = $1 AND name = $2")
            .bind(organization_id.as_uuid())
            .bind(name)
            .fetch_optional(executor)
            .await
            .map_err(to_storage_error)?;
    Ok(row.map(|(id, name)| GroupRecord {
        id: GroupId::new(id),
        organization_id: *organization_id,
        name,
    }))
}

pub async fn insert_group<'e>(
    executor: impl sqlx::PgExecutor<'e>,
    organization_id: &OrganizationId,
    name: &str,
) -> Result<GroupRecord, StorageError> {
    let id = GroupId::generate();
    sqlx::query("INSERT INTO groups (id, organization_id, name) VALUES ($1, $2, $3)")
        .bind(id.as_uuid())
        .bind(organization_id.as_uuid())
        .bind(name)
        .execute(executor)
        .await
        .map_err(conflict_or_internal(format!("group '{name}'")))?;
    Ok(GroupRecord {
        id,
        organization_id: *organization_id,
        name: name.to_string(),
    })
}

// --- role mappings and memberships ---

pub async fn account_groups<'e>(
    executor: impl sqlx::PgExecutor<'e>,
    account: &AccountId,
) -> Result<Vec<GroupRef>, StorageError> {
    let rows: Vec<(Uuid, String)> = sqlx::query_as(
        r#"
        SELECT g.id, g.name
        FROM group_accounts ga
        JOIN groups g ON g.id = ga.group_id
        WHERE ga.account_id = $1
        ORDER BY ga.seq
        "#,
    )
    .bind(account.as_uuid())
    .fetch_all(executor)
    .await
    .map_err(to_storage_error)?;
    Ok(rows
        .into_iter()
        .map(|(id, name)| GroupRef {
            id: GroupId::new(id),
            name,
        })
        .collect())
}

pub async fn group_members<'e>(
    executor: impl sqlx::PgExecutor<'e>,
    group: &GroupId,
) -> Result<Vec<AccountId>, StorageError> {
    let rows: Vec<(Uuid,)> =
        sqlx::query_as("SELECT account_id FROM group_accounts WHERE group_id = $1 ORDER BY seq")
            .bind(group.as_uuid())
            .fetch_all(executor)
            .await
            .map_err(to_storage_error)?;
    Ok(rows.into_iter().map(|(id,)| AccountId::new(id)).collect())
}

pub async fn delete_account_groups<'e>(
    executor: impl sqlx::PgExecutor<'e>,
    account: &AccountId,
) -> Result<(), StorageError> {
    sqlx::query("DELETE FROM group_accounts WHERE account_id = $1")
        .bind(account.as_uuid())
        .execute(executor)
        .await
        .map_err(to_storage_error)?;
    Ok(())
}

pub async fn insert_account_group<'e>(
    executor: impl sqlx::PgExecutor<'e>,
    account: &AccountId,
    group: &GroupId,
) -> Result<(), StorageError> {
    sqlx::query(
        "INSERT INTO group_accounts (group_id, account_id) VALUES ($1, $2) ON CONFLICT DO NOTHING",
    )
    .bind(group.as_uuid())
    .bind(account.as_uuid())
    .execute(executor)
    .await
    .map_err(to_storage_error)?;
    Ok(())
}

/// The one parameterized query behind all six grant shapes.
pub async fn mapping_rows<'e>(
    executor: impl sqlx::PgExecutor<'e>,
    subject: &MappingSubject,
    scope: GrantScope,
) -> Result<Vec<MappingRow>, StorageError> {
    let (kind, id) = subject_columns(subject);
    let rows: Vec<(String, Option<String>, Option<String>)> = sqlx::query_as(
        r#"
        SELECT r.name, p.name, m.namespace
        FROM role_mappings m
        JOIN roles r ON r.id = m.role_id
        LEFT JOIN projects p ON p.id = m.project_id
        WHERE m.subject_kind = $1 AND m.subject_id = $2 AND m.scope = $3
        ORDER BY m.seq
        "#,
    )
    .bind(kind)
    .bind(id)
    .bind(scope.as_str())
    .fetch_all(executor)
    .await
    .map_err(to_storage_error)?;
    Ok(rows
        .into_iter()
        .map(|(role, project, namespace)| MappingRow {
            role,
            project,
            namespace,
        })
        .collect())
}

pub async fn subject_mappings<'e>(
    executor: impl sqlx::PgExecutor<'e>,
    subject: &MappingSubject,
) -> Result<Vec<MappingKey>, StorageError> {
    let (kind, id) = subject_columns(subject);
    let rows: Vec<(Uuid, Option<Uuid>, Option<String>)> = sqlx::query_as(
        r#"
        SELECT role_id, project_id, namespace
        FROM role_mappings
        WHERE subject_kind = $1 AND subject_id = $2
        ORDER BY seq
        "#,
    )
    .bind(kind)
    .bind(id)
    .fetch_all(executor)
    .await
    .map_err(to_storage_error)?;
    Ok(rows
        .into_iter()
        .map(|(role_id, project_id, namespace)| MappingKey {
            role_id: RoleId::new(role_id),
            project_id: project_id.map(ProjectId::new),
            namespace,
        })
        .collect())
}

pub async fn insert_mapping<'e>(
    executor: impl sqlx::PgExecutor<'e>,
    tenancy: &Tenancy,
    subject: &MappingSubject,
    key: &MappingKey,
) -> Result<(), StorageError> {
    let (kind, id) = subject_columns(subject);
    sqlx::query(
        r#"
        INSERT INTO role_mappings
            (subject_kind, subject_id, scope, role_id, project_id, namespace, organization_id, partner_id)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(kind)
    .bind(id)
    .bind(key.scope().as_str())
    .bind(key.role_id.as_uuid())
    .bind(key.project_id.map(|p| *p.as_uuid()))
    .bind(&key.namespace)
    .bind(tenancy.organization_id.as_uuid())
    .bind(tenancy.partner_id.as_uuid())
    .execute(executor)
    .await
    .map_err(conflict_or_internal(format!("role mapping for role {}", key.role_id)))?;
    Ok(())
}

pub async fn delete_mapping<'e>(
    executor: impl sqlx::PgExecutor<'e>,
    subject: &MappingSubject,
    key: &MappingKey,
) -> Result<(), StorageError> {
    let (kind, id) = subject_columns(subject);
    sqlx::query(
        r#"
        DELETE FROM role_mappings
        WHERE subject_kind = $1 AND subject_id = $2 AND role_id = $3
          AND project_id IS NOT DISTINCT FROM $4
          AND namespace IS NOT DISTINCT FROM $5
        "#,
    )
    .bind(kind)
    .bind(id)
    .bind(key.role_id.as_uuid())
    .bind(key.project_id.map(|p| *p.as_uuid()))
    .bind(&key.namespace)
    .execute(executor)
    .await
    .map_err(to_storage_error)?;
    Ok(())
}

pub async fn delete_subject_mappings<'e>(
    executor: impl sqlx::PgExecutor<'e>,
    subject: &MappingSubject,
) -> Result<(), StorageError> {
    let (kind, id) = subject_columns(subject);
    sqlx::query("DELETE FROM role_mappings WHERE subject_kind = $1 AND subject_id = $2")
        .bind(kind)
        .bind(id)
        .execute(executor)
        .await
        .map_err(to_storage_error)?;
    Ok(())
}

// --- identities ---

type IdentityRow = (Uuid, Uuid, Uuid, String, Json<IdentityTraits>);

fn identity_from_row((id, partner_id, organization_id, name, traits): IdentityRow) -> Identity {
    Identity {
        id: AccountId::new(id),
        tenancy: Tenancy {
            partner_id: PartnerId::new(partner_id),
            organization_id: OrganizationId::new(organization_id),
        },
        name,
        traits: traits.0,
    }
}

const SELECT_IDENTITY: &str =
    "SELECT id, partner_id, organization_id, name, traits FROM identities";

pub async fn insert_identity<'e>(
    executor: impl sqlx::PgExecutor<'e>,
    tenancy: &Tenancy,
    name: &str,
    traits: &IdentityTraits,
) -> Result<Identity, StorageError> {
    let id = AccountId::generate();
    sqlx::query(
        r#"
        INSERT INTO identities (id, partner_id, organization_id, name, traits)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(id.as_uuid())
    .bind(tenancy.partner_id.as_uuid())
    .bind(tenancy.organization_id.as_uuid())
    .bind(name)
    .bind(Json(traits))
    .execute(executor)
    .await
    .map_err(conflict_or_internal(format!("identity '{name}'")))?;
    Ok(Identity {
        id,
        tenancy: *tenancy,
        name: name.to_string(),
        traits: traits.clone(),
    })
}

pub async fn identity_by_id<'e>(
    executor: impl sqlx::PgExecutor<'e>,
    id: &AccountId,
) -> Result<Option<Identity>, StorageError> {
    let query = format!("{SELECT_IDENTITY} WHERE id = $1");
    let row: Option<IdentityRow> = sqlx::query_as(&query)
        .bind(id.as_uuid())
        .fetch_optional(executor)
        .await
        .map_err(to_storage_error)?;
    Ok(row.map(identity_from_row))
}

pub async fn identity_by_name<'e>(
    executor: impl sqlx::PgExecutor<'e>,
    organization_id: &OrganizationId,
    name: &str,
) -> Result<Option<Identity>, StorageError> {
    let query = format!("{SELECT_IDENTITY} WHERE organization_id = $1 AND name = $2");
    let row: Option<IdentityRow> = sqlx::query_as(&query)
        .bind(organization_id.as_uuid())
        .bind(name)
        .fetch_optional(executor)
        .await
        .map_err(to_storage_error)?;
    Ok(row.map(identity_from_row))
}

pub async fn update_identity<'e>(
    executor: impl sqlx::PgExecutor<'e>,
    id: &AccountId,
    traits: &IdentityTraits,
) -> Result<Identity, StorageError> {
    let row: Option<IdentityRow> = sqlx::query_as(
        r#"
        UPDATE identities SET traits = $2, updated_at = now()
        WHERE id = $1
        RETURNING id, partner_id, organization_id, name, traits
        "#,
    )
    .bind(id.as_uuid())
    .bind(Json(traits))
    .fetch_optional(executor)
    .await
    .map_err(to_storage_error)?;
    row.map(identity_from_row)
        .ok_or_else(|| StorageError::NotFound(format!("identity {id}")))
}

pub async fn delete_identity<'e>(
    executor: impl sqlx::PgExecutor<'e>,
    id: &AccountId,
) -> Result<(), StorageError> {
    sqlx::query("DELETE FROM identities WHERE id = $1")
        .bind(id.as_uuid())
        .execute(executor)
        .await
        .map_err(to_storage_error)?;
    Ok(())
}

pub async fn list_identities<'e>(
    executor: impl sqlx::PgExecutor<'e>,
    organization_id: &OrganizationId,
) -> Result<Vec<Identity>, StorageError> {
    let query = format!("{SELECT_IDENTITY} WHERE organization_id = $1 ORDER BY created_at, id");
    let rows: Vec<IdentityRow> = sqlx::query_as(&query)
        .bind(organization_id.as_uuid())
        .fetch_all(executor)
        .await
        .map_err(to_storage_error)?;
    Ok(rows.into_iter().map(identity_from_row).collect())
}
