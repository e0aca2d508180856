use thiserror::Error;

/// Pool and schema errors. Query failures inside the collaborator
/// implementations surface as their own error types.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("failed to connect to database: {0}")]
    Connect(#[source] sqlx::Error),

    #[error("query failed: {0}")]
    Query(#[source] sqlx::Error),

    #[error("migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),

    #[error("no migrations directory in {tried} ({last_error}); run from the repository root or services/control-plane")]
    MigrationDirNotFound { tried: String, last_error: String },
}
