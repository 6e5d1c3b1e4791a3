//! Error types for the intake pipeline.

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Mailbox, SMTP and extraction connectivity failures.
///
/// Always recovered locally: the account, recipient or call is skipped and
/// the sweep continues.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Mailbox {account} connection failed: {reason}")]
    Connection { account: String, reason: String },

    #[error("Mailbox {account} protocol error: {reason}")]
    Protocol { account: String, reason: String },

    #[error("Failed to send mail to {recipient}: {reason}")]
    Send { recipient: String, reason: String },

    #[error("SMTP not configured")]
    NotConfigured,

    #[error("Extraction service failed: {0}")]
    Extraction(String),
}

/// Malformed inbound mail.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("Message could not be parsed as MIME")]
    Unparseable,
}

/// Errors surfaced to callers of user-facing funnel mutations.
#[derive(Debug, thiserror::Error)]
pub enum FunnelError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}
