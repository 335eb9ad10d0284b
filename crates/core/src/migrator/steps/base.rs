//! Version 1. Result tables still carry the legacy `status` text columns and
//! operator results their untyped `metadata`; later steps replace both.

pub(super) const POSTGRES: &str = r#"
CREATE TABLE IF NOT EXISTS app_user (
    id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
    email VARCHAR NOT NULL,
    organization_id VARCHAR NOT NULL,
    api_key VARCHAR NOT NULL UNIQUE,
    auth0_id VARCHAR NOT NULL DEFAULT ''
);

CREATE TABLE IF NOT EXISTS workflow (
    id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
    user_id UUID NOT NULL REFERENCES app_user (id),
    name VARCHAR NOT NULL,
    description VARCHAR NOT NULL DEFAULT '',
    created_at TIMESTAMPTZ NOT NULL,
    UNIQUE (user_id, name)
);

CREATE TABLE IF NOT EXISTS workflow_dag (
    id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
    workflow_id UUID NOT NULL REFERENCES workflow (id),
    created_at TIMESTAMPTZ NOT NULL,
    storage_config JSONB NOT NULL,
    engine_config JSONB
);

CREATE TABLE IF NOT EXISTS operator (
    id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
    name VARCHAR NOT NULL,
    description VARCHAR NOT NULL DEFAULT '',
    spec JSONB NOT NULL
);

CREATE TABLE IF NOT EXISTS artifact (
    id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
    name VARCHAR NOT NULL,
    description VARCHAR NOT NULL DEFAULT '',
    type VARCHAR NOT NULL
);

CREATE TABLE IF NOT EXISTS workflow_dag_edge (
    workflow_dag_id UUID NOT NULL REFERENCES workflow_dag (id),
    type VARCHAR NOT NULL,
    from_id UUID NOT NULL,
    to_id UUID NOT NULL,
    idx INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS workflow_dag_result (
    id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
    workflow_dag_id UUID NOT NULL REFERENCES workflow_dag (id),
    status VARCHAR NOT NULL,
    created_at TIMESTAMPTZ NOT NULL
);

CREATE TABLE IF NOT EXISTS operator_result (
    id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
    workflow_dag_result_id UUID NOT NULL REFERENCES workflow_dag_result (id),
    operator_id UUID NOT NULL REFERENCES operator (id),
    status VARCHAR NOT NULL,
    metadata JSONB
);

CREATE TABLE IF NOT EXISTS artifact_result (
    id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
    workflow_dag_result_id UUID NOT NULL REFERENCES workflow_dag_result (id),
    artifact_id UUID NOT NULL REFERENCES artifact (id),
    content_path VARCHAR NOT NULL,
    status VARCHAR NOT NULL,
    metadata JSONB
);

CREATE TABLE IF NOT EXISTS integration (
    id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
    user_id UUID REFERENCES app_user (id),
    organization_id VARCHAR NOT NULL,
    service VARCHAR NOT NULL,
    name VARCHAR NOT NULL,
    config JSONB NOT NULL,
    created_at TIMESTAMPTZ NOT NULL,
    validated BOOLEAN NOT NULL DEFAULT FALSE
);
"#;

// No foreign keys: the table rebuilds in later steps would trip them.
pub(super) const SQLITE: &str = r#"
CREATE TABLE IF NOT EXISTS app_user (
    id BLOB NOT NULL PRIMARY KEY,
    email TEXT NOT NULL,
    organization_id TEXT NOT NULL,
    api_key TEXT NOT NULL UNIQUE,
    auth0_id TEXT NOT NULL DEFAULT ''
);

CREATE TABLE IF NOT EXISTS workflow (
    id BLOB NOT NULL PRIMARY KEY,
    user_id BLOB NOT NULL,
    name TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    created_at DATETIME NOT NULL,
    UNIQUE (user_id, name)
);

CREATE TABLE IF NOT EXISTS workflow_dag (
    id BLOB NOT NULL PRIMARY KEY,
    workflow_id BLOB NOT NULL,
    created_at DATETIME NOT NULL,
    storage_config BLOB NOT NULL,
    engine_config BLOB
);

CREATE TABLE IF NOT EXISTS operator (
    id BLOB NOT NULL PRIMARY KEY,
    name TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    spec BLOB NOT NULL
);

CREATE TABLE IF NOT EXISTS artifact (
    id BLOB NOT NULL PRIMARY KEY,
    name TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    type TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS workflow_dag_edge (
    workflow_dag_id BLOB NOT NULL,
    type TEXT NOT NULL,
    from_id BLOB NOT NULL,
    to_id BLOB NOT NULL,
    idx INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS workflow_dag_result (
    id BLOB NOT NULL PRIMARY KEY,
    workflow_dag_id BLOB NOT NULL,
    status TEXT NOT NULL,
    created_at DATETIME NOT NULL
);

CREATE TABLE IF NOT EXISTS operator_result (
    id BLOB NOT NULL PRIMARY KEY,
    workflow_dag_result_id BLOB NOT NULL,
    operator_id BLOB NOT NULL,
    status TEXT NOT NULL,
    metadata BLOB
);

CREATE TABLE IF NOT EXISTS artifact_result (
    id BLOB NOT NULL PRIMARY KEY,
    workflow_dag_result_id BLOB NOT NULL,
    artifact_id BLOB NOT NULL,
    content_path TEXT NOT NULL,
    status TEXT NOT NULL,
    metadata BLOB
);

CREATE TABLE IF NOT EXISTS integration (
    id BLOB NOT NULL PRIMARY KEY,
    user_id BLOB,
    organization_id TEXT NOT NULL,
    service TEXT NOT NULL,
    name TEXT NOT NULL,
    config BLOB NOT NULL,
    created_at DATETIME NOT NULL,
    validated BOOLEAN NOT NULL DEFAULT FALSE
);
"#;
