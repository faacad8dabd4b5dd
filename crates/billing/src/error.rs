//! Billing error taxonomy

use thiserror::Error;

/// Errors produced by the billing subsystem.
///
/// The split matters for callers: `Config` is fatal, `WebhookSignatureInvalid`
/// and `InvalidPayload` map to request rejection, `Database` is retryable
/// infrastructure failure, and `Stripe` wraps provider errors that only the
/// live fallback path is allowed to absorb.
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("billing configuration error: {0}")]
    Config(String),

    #[error("webhook signature verification failed")]
    WebhookSignatureInvalid,

    #[error("invalid webhook payload: {0}")]
    InvalidPayload(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("no account matches billing identity: {0}")]
    UserNotFound(String),

    #[error("stripe error: {0}")]
    Stripe(String),
}

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        Self::Database(e.to_string())
    }
}

impl From<stripe::StripeError> for BillingError {
    fn from(e: stripe::StripeError) -> Self {
        Self::Stripe(e.to_string())
    }
}

pub type BillingResult<T> = Result<T, BillingError>;
