use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use sea_orm::error::DbErr;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

fn current_request_id() -> Option<String> {
    crate::tracing::current_request_id().map(|rid| rid.as_str().to_string())
}

/// Standard JSON body returned for every failed request.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// HTTP status category (e.g., "Not Found", "Bad Request")
    pub error: String,
    /// Human-readable error description
    pub message: String,
    /// Structured payload for errors that carry one (inventory issues, conflicting reviews)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    /// Unique request identifier for support and debugging
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// RFC 3339 timestamp when the error occurred
    pub timestamp: String,
}

/// A single cart line that could not be satisfied from current stock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InventoryIssue {
    pub product_id: Uuid,
    pub name: String,
    pub requested_amount: i32,
    pub inventory: i32,
}

/// Stock problems found while validating a cart.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InventoryIssues {
    pub out_of_stock: Vec<InventoryIssue>,
    pub not_enough_inventory: Vec<InventoryIssue>,
}

impl InventoryIssues {
    pub fn is_empty(&self) -> bool {
        self.out_of_stock.is_empty() && self.not_enough_inventory.is_empty()
    }

    pub fn len(&self) -> usize {
        self.out_of_stock.len() + self.not_enough_inventory.len()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] DbErr),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Invalid status: {0}")]
    InvalidStatus(String),

    #[error("Product {0} appears more than once in the cart")]
    DuplicateCartItem(Uuid),

    #[error("Insufficient inventory for {} cart item(s)", .0.len())]
    InsufficientInventory(InventoryIssues),

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("Order is already {0}")]
    NoOpTransition(String),

    #[error("Wrong currency: {0}")]
    InvalidCurrency(String),

    #[error("Cannot {transition}: remove your reviews for the affected products first")]
    ReviewConflict {
        review_ids: Vec<Uuid>,
        transition: String,
    },

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Concurrent modification: {0}")]
    ConcurrentModification(Uuid),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(err: validator::ValidationErrors) -> Self {
        ServiceError::ValidationError(err.to_string())
    }
}

impl ServiceError {
    /// Returns the HTTP status code for this error.
    /// This is the single source of truth for error-to-status mapping.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::DatabaseError(_) | Self::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::ValidationError(_)
            | Self::BadRequest(_)
            | Self::InvalidStatus(_)
            | Self::DuplicateCartItem(_)
            | Self::InsufficientInventory(_)
            | Self::InvalidTransition(_)
            | Self::NoOpTransition(_)
            | Self::InvalidCurrency(_)
            | Self::ReviewConflict { .. } => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::ConcurrentModification(_) => StatusCode::CONFLICT,
        }
    }

    /// Returns the error message suitable for HTTP responses.
    /// Internal errors return generic messages to avoid leaking implementation details.
    pub fn response_message(&self) -> String {
        match self {
            Self::DatabaseError(_) => "Database error".to_string(),
            Self::InternalError(_) => "Internal server error".to_string(),
            Self::ConcurrentModification(id) => {
                format!("Concurrent modification for ID {}", id)
            }
            _ => self.to_string(),
        }
    }

    /// Structured payload attached to the response body, if any.
    pub fn details(&self) -> Option<Value> {
        match self {
            Self::InsufficientInventory(issues) => serde_json::to_value(issues).ok(),
            Self::ReviewConflict {
                review_ids,
                transition,
            } => Some(json!({
                "reviewIds": review_ids,
                "transition": transition,
            })),
            Self::DuplicateCartItem(product_id) => Some(json!({ "product": product_id })),
            _ => None,
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }

        let err = ErrorResponse {
            error: status.canonical_reason().unwrap_or("Error").to_string(),
            message: self.response_message(),
            details: self.details(),
            request_id: current_request_id(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        };

        (status, Json(err)).into_response()
    }
}
