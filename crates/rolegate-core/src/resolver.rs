use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use crate::grant::{GrantScope, GrantShape, RoleGrant, ScopeValue, SubjectKind};
use crate::ids::{AccountId, GroupId};

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("storage error: {0}")]
    StorageError(String),
}

/// A group an account belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupRef {
    pub id: GroupId,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MappingSubject {
    Account(AccountId),
    Group(GroupId),
}

impl MappingSubject {
    pub fn kind(&self) -> SubjectKind {
        match self {
            MappingSubject::Account(_) => SubjectKind::Account,
            MappingSubject::Group(_) => SubjectKind::Group,
        }
    }
}

/// One stored role mapping with its references already turned into names.
/// `None` for a project or namespace means the reference did not resolve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingRow {
    pub role: String,
    pub project: Option<String>,
    pub namespace: Option<String>,
}

impl MappingRow {
    pub fn system(role: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            project: None,
            namespace: None,
        }
    }

    pub fn project(role: impl Into<String>, project: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            project: Some(project.into()),
            namespace: None,
        }
    }

    pub fn namespace(
        role: impl Into<String>,
        project: impl Into<String>,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            role: role.into(),
            project: Some(project.into()),
            namespace: Some(namespace.into()),
        }
    }
}

/// Read access to role mappings and group memberships.
pub trait RoleMappingReader: Send + Sync {
    fn account_groups(
        &self,
        account: &AccountId,
    ) -> impl Future<Output = Result<Vec<GroupRef>, ResolveError>> + Send;

    /// Rows for one subject at one scope, in store order.
    fn mappings(
        &self,
        subject: &MappingSubject,
        scope: GrantScope,
    ) -> impl Future<Output = Result<Vec<MappingRow>, ResolveError>> + Send;
}

/// Computes an account's effective grants.
pub struct PermissionResolver<R: RoleMappingReader> {
    reader: Arc<R>,
}

impl<R: RoleMappingReader> PermissionResolver<R> {
    pub fn new(reader: Arc<R>) -> Self {
        Self { reader }
    }

    pub async fn resolve(&self, account: &AccountId) -> Result<Vec<RoleGrant>, ResolveError> {
        resolve_grants(self.reader.as_ref(), account).await
    }
}

/// Runs the six resolution steps against `reader` and concatenates them.
///
/// Steps follow [`GrantShape::RESOLUTION_ORDER`]. Group steps visit groups
/// by ascending name. Duplicates are collapsed within a step only, so the
/// same role held directly and through a group appears twice.
pub async fn resolve_grants<R>(
    reader: &R,
    account: &AccountId,
) -> Result<Vec<RoleGrant>, ResolveError>
where
    R: RoleMappingReader + ?Sized,
{
    let mut groups = reader.account_groups(account).await?;
    groups.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));

    let mut grants = Vec::new();
    for shape in GrantShape::RESOLUTION_ORDER {
        let mut seen = HashSet::new();
        match shape.subject {
            SubjectKind::Group => {
                for group in &groups {
                    let rows = reader
                        .mappings(&MappingSubject::Group(group.id), shape.scope)
                        .await?;
                    for row in rows {
                        let grant = to_grant(shape, Some(&group.name), row);
                        if seen.insert(dedup_key(&grant)) {
                            grants.push(grant);
                        }
                    }
                }
            }
            SubjectKind::Account => {
                let rows = reader
                    .mappings(&MappingSubject::Account(*account), shape.scope)
                    .await?;
                for row in rows {
                    let grant = to_grant(shape, None, row);
                    if seen.insert(dedup_key(&grant)) {
                        grants.push(grant);
                    }
                }
            }
        }
    }

    tracing::debug!(
        account = %account,
        groups = groups.len(),
        grants = grants.len(),
        "resolved grants"
    );

    Ok(grants)
}

type DedupKey = (Option<String>, String, ScopeValue, ScopeValue);

fn dedup_key(grant: &RoleGrant) -> DedupKey {
    (
        grant.group.clone(),
        grant.role.clone(),
        grant.project.clone(),
        grant.namespace.clone(),
    )
}

fn to_grant(shape: GrantShape, group: Option<&str>, row: MappingRow) -> RoleGrant {
    let scoped =
        |name: Option<String>| name.map_or_else(ScopeValue::unresolved, ScopeValue::Specific);
    let (project, namespace) = match shape.scope {
        GrantScope::System => (ScopeValue::Any, ScopeValue::Any),
        GrantScope::Project => (scoped(row.project), ScopeValue::Any),
        GrantScope::Namespace => (scoped(row.project), scoped(row.namespace)),
    };
    RoleGrant {
        shape,
        group: group.map(str::to_string),
        role: row.role,
        project,
        namespace,
    }
}
