use sqlx::PgPool;

const MIGRATIONS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS partners (
        id          UUID PRIMARY KEY,
        name        TEXT NOT NULL UNIQUE,
        created_at  TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS organizations (
        id          UUID PRIMARY KEY,
        partner_id  UUID NOT NULL REFERENCES partners(id),
        name        TEXT NOT NULL,
        created_at  TIMESTAMPTZ NOT NULL DEFAULT now(),
        UNIQUE (partner_id, name)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS projects (
        id              UUID PRIMARY KEY,
        organization_id UUID NOT NULL REFERENCES organizations(id),
        name            TEXT NOT NULL,
        created_at      TIMESTAMPTZ NOT NULL DEFAULT now(),
        UNIQUE (organization_id, name)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS roles (
        id          UUID PRIMARY KEY,
        name        TEXT NOT NULL UNIQUE,
        scope       TEXT NOT NULL CHECK (scope IN ('system', 'organization', 'project')),
        builtin     BOOLEAN NOT NULL DEFAULT false,
        created_at  TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS role_permissions (
        role_id     UUID NOT NULL REFERENCES roles(id) ON DELETE CASCADE,
        permission  TEXT NOT NULL,
        PRIMARY KEY (role_id, permission)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS groups (
        id              UUID PRIMARY KEY,
        organization_id UUID NOT NULL REFERENCES organizations(id),
        name            TEXT NOT NULL,
        created_at      TIMESTAMPTZ NOT NULL DEFAULT now(),
        UNIQUE (organization_id, name)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS group_accounts (
        group_id    UUID NOT NULL REFERENCES groups(id) ON DELETE CASCADE,
        account_id  UUID NOT NULL,
        seq         BIGSERIAL,
        PRIMARY KEY (group_id, account_id)
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_group_accounts_account
    ON group_accounts (account_id)
    "#,
    // project_id carries no foreign key: a mapping whose project is gone
    // still resolves, with an empty project name.
    r#"
    CREATE TABLE IF NOT EXISTS role_mappings (
        seq             BIGSERIAL PRIMARY KEY,
        subject_kind    TEXT NOT NULL CHECK (subject_kind IN ('account', 'group')),
        subject_id      UUID NOT NULL,
        scope           TEXT NOT NULL CHECK (scope IN ('system', 'project', 'namespace')),
        role_id         UUID NOT NULL REFERENCES roles(id),
        project_id      UUID,
        namespace       TEXT,
        organization_id UUID NOT NULL,
        partner_id      UUID NOT NULL,
        CHECK (namespace IS NULL OR project_id IS NOT NULL)
    )
    "#,
    // Expression index so unscoped mappings still collide on PostgreSQL
    // releases without NULLS NOT DISTINCT.
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS idx_role_mappings_unique
    ON role_mappings (
        subject_kind,
        subject_id,
        role_id,
        COALESCE(project_id, '00000000-0000-0000-0000-000000000000'::uuid),
        COALESCE(namespace, '')
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_role_mappings_subject
    ON role_mappings (subject_kind, subject_id, scope, seq)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS identities (
        id              UUID PRIMARY KEY,
        partner_id      UUID NOT NULL,
        organization_id UUID NOT NULL,
        name            TEXT NOT NULL,
        traits          JSONB NOT NULL DEFAULT '{}'::jsonb,
        created_at      TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at      TIMESTAMPTZ NOT NULL DEFAULT now(),
        UNIQUE (organization_id, name)
    )
    "#,
];

pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    for statement in MIGRATIONS {
        sqlx::query(statement).execute(pool).await?;
    }
    tracing::info!(statements = MIGRATIONS.len(), "migrations applied");
    Ok(())
}
