use crate::entity::EntityType;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceType {
    Tenant,
    Entity(EntityType),
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceType::Tenant => write!(f, "tenant"),
            ResourceType::Entity(entity_type) => write!(f, "{entity_type}"),
        }
    }
}

impl From<EntityType> for ResourceType {
    fn from(entity_type: EntityType) -> Self {
        ResourceType::Entity(entity_type)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Validation,
    InvalidConfig,
    Forbidden,
    NotFound,
    Conflict,
    Unauthorized,
    NestedScope,
    QuotaExceeded,
    RateLimited,
    StorageUnavailable,
    Internal,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::Validation => "validation",
            ErrorCode::InvalidConfig => "invalid_config",
            ErrorCode::Forbidden => "forbidden",
            ErrorCode::NotFound => "not_found",
            ErrorCode::Conflict => "conflict",
            ErrorCode::Unauthorized => "unauthorized",
            ErrorCode::NestedScope => "nested_scope",
            ErrorCode::QuotaExceeded => "quota_exceeded",
            ErrorCode::RateLimited => "rate_limited",
            ErrorCode::StorageUnavailable => "storage_unavailable",
            ErrorCode::Internal => "internal",
        }
    }
}

/// Errors surfaced by the core.
///
/// `CoreError` is `Clone` because a coalesced fetch hands the very same
/// outcome to every waiter.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CoreError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("invalid config: {message}")]
    InvalidConfig { message: String },
    #[error("forbidden: {action} on {resource_type} '{resource_id}'")]
    Forbidden {
        resource_type: ResourceType,
        resource_id: String,
        action: String,
    },
    #[error("{resource_type} '{resource_id}' not found")]
    NotFound {
        resource_type: ResourceType,
        resource_id: String,
    },
    #[error("conflict error: {0}")]
    Conflict(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("tenant scope already active for this task")]
    NestedScope,
    #[error("quota exceeded for {entity_type} in tenant '{tenant_id}' (limit {limit})")]
    QuotaExceeded {
        tenant_id: String,
        entity_type: EntityType,
        limit: u64,
    },
    #[error("rate limit exceeded for tenant '{tenant_id}' (limit {limit} points/window)")]
    RateLimited { tenant_id: String, limit: u64 },
    #[error("storage unavailable: {message}")]
    StorageUnavailable { message: String },
    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    pub fn code(&self) -> ErrorCode {
        match self {
            CoreError::Validation(_) => ErrorCode::Validation,
            CoreError::InvalidConfig { .. } => ErrorCode::InvalidConfig,
            CoreError::Forbidden { .. } => ErrorCode::Forbidden,
            CoreError::NotFound { .. } => ErrorCode::NotFound,
            CoreError::Conflict(_) => ErrorCode::Conflict,
            CoreError::Unauthorized(_) => ErrorCode::Unauthorized,
            CoreError::NestedScope => ErrorCode::NestedScope,
            CoreError::QuotaExceeded { .. } => ErrorCode::QuotaExceeded,
            CoreError::RateLimited { .. } => ErrorCode::RateLimited,
            CoreError::StorageUnavailable { .. } => ErrorCode::StorageUnavailable,
            CoreError::Internal(_) => ErrorCode::Internal,
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code().as_str()
    }

    /// Code exposed to untrusted callers. A denied entity must look exactly
    /// like a missing one.
    pub fn public_code(&self) -> ErrorCode {
        match self.code() {
            ErrorCode::Forbidden => ErrorCode::NotFound,
            other => other,
        }
    }

    /// Message exposed to untrusted callers, paired with [`Self::public_code`].
    pub fn public_message(&self) -> String {
        match self {
            CoreError::Forbidden {
                resource_type,
                resource_id,
                ..
            } => CoreError::NotFound {
                resource_type: *resource_type,
                resource_id: resource_id.clone(),
            }
            .to_string(),
            other => other.to_string(),
        }
    }

    pub fn not_found(resource_type: impl Into<ResourceType>, resource_id: impl Into<String>) -> Self {
        CoreError::NotFound {
            resource_type: resource_type.into(),
            resource_id: resource_id.into(),
        }
    }

    pub fn forbidden(
        resource_type: impl Into<ResourceType>,
        resource_id: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        CoreError::Forbidden {
            resource_type: resource_type.into(),
            resource_id: resource_id.into(),
            action: action.into(),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        CoreError::StorageUnavailable {
            message: message.into(),
        }
    }
}
