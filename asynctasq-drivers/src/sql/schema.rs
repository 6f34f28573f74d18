//! Idempotent DDL for the SQL drivers.

pub const POSTGRES_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS task_queue (
    id uuid PRIMARY KEY,
    queue text NOT NULL,
    payload bytea NOT NULL,
    status text NOT NULL CHECK (status IN ('pending', 'processing', 'completed', 'failed')),
    current_attempt integer NOT NULL DEFAULT 0,
    max_attempts integer NOT NULL,
    available_at timestamptz NOT NULL,
    locked_until timestamptz NULL,
    worker_id text NULL,
    last_error text NULL,
    created_at timestamptz NOT NULL DEFAULT now(),
    updated_at timestamptz NOT NULL DEFAULT now()
);

CREATE INDEX IF NOT EXISTS task_queue_queue_status_available_idx
    ON task_queue (queue, status, available_at);
CREATE INDEX IF NOT EXISTS task_queue_status_locked_until_idx
    ON task_queue (status, locked_until);

CREATE TABLE IF NOT EXISTS dead_letter_queue (
    id uuid PRIMARY KEY,
    queue text NOT NULL,
    payload bytea NOT NULL,
    status text NOT NULL,
    current_attempt integer NOT NULL,
    max_attempts integer NOT NULL,
    available_at timestamptz NOT NULL,
    locked_until timestamptz NULL,
    worker_id text NULL,
    last_error text NULL,
    created_at timestamptz NOT NULL,
    updated_at timestamptz NOT NULL,
    failed_at timestamptz NOT NULL DEFAULT now(),
    attempts integer NOT NULL,
    final_error text NOT NULL
);
"#;

pub const MYSQL_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS task_queue (
    id CHAR(36) PRIMARY KEY,
    queue VARCHAR(255) NOT NULL,
    payload LONGBLOB NOT NULL,
    status VARCHAR(16) NOT NULL,
    current_attempt INT NOT NULL DEFAULT 0,
    max_attempts INT NOT NULL,
    available_at DATETIME(3) NOT NULL,
    locked_until DATETIME(3) NULL,
    worker_id VARCHAR(255) NULL,
    last_error TEXT NULL,
    created_at DATETIME(3) NOT NULL DEFAULT CURRENT_TIMESTAMP(3),
    updated_at DATETIME(3) NOT NULL DEFAULT CURRENT_TIMESTAMP(3),
    INDEX task_queue_queue_status_available_idx (queue, status, available_at),
    INDEX task_queue_status_locked_until_idx (status, locked_until)
);

CREATE TABLE IF NOT EXISTS dead_letter_queue (
    id CHAR(36) PRIMARY KEY,
    queue VARCHAR(255) NOT NULL,
    payload LONGBLOB NOT NULL,
    status VARCHAR(16) NOT NULL,
    current_attempt INT NOT NULL,
    max_attempts INT NOT NULL,
    available_at DATETIME(3) NOT NULL,
    locked_until DATETIME(3) NULL,
    worker_id VARCHAR(255) NULL,
    last_error TEXT NULL,
    created_at DATETIME(3) NOT NULL,
    updated_at DATETIME(3) NOT NULL,
    failed_at DATETIME(3) NOT NULL DEFAULT CURRENT_TIMESTAMP(3),
    attempts INT NOT NULL,
    final_error TEXT NOT NULL
);
"#;
