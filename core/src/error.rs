use thiserror::Error;

#[derive(Error, Debug)]
pub enum NexoError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{entity} not found")]
    NotFound { entity: &'static str },

    #[error("Not authenticated")]
    Unauthorized,

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("{feature} is not enabled for this organization")]
    FeatureDisabled { feature: String },

    #[error("Usage limit has been reached for {feature}")]
    LimitReached { feature: String },

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl NexoError {
    pub fn not_found(entity: &'static str) -> Self {
        Self::NotFound { entity }
    }

    /// HTTP status the outer web layer should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::NotFound { .. } => 404,
            Self::Unauthorized => 401,
            Self::Forbidden(_) | Self::FeatureDisabled { .. } | Self::LimitReached { .. } => 403,
            Self::Conflict(_) => 409,
            Self::Validation(_) => 422,
            Self::BadRequest(_) => 400,
            Self::Database(_) | Self::Serialization(_) | Self::Internal(_) | Self::Other(_) => 500,
        }
    }
}

pub type NexoResult<T> = Result<T, NexoError>;
