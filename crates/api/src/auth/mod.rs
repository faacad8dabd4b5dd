//! Authentication module for the EchoDeck API

pub mod jwt;
pub mod middleware;

pub use jwt::{Claims, JwtManager};
pub use middleware::{auth_middleware, AuthUser};

use sqlx::PgPool;
use uuid::Uuid;

/// Identity-provider role check: does the user hold `role`?
pub async fn has_role(pool: &PgPool, user_id: Uuid, role: &str) -> Result<bool, sqlx::Error> {
    let (exists,): (bool,) = sqlx::query_as(
        "SELECT EXISTS(SELECT 1 FROM user_roles WHERE user_id = $1 AND role = $2)",
    )
    .bind(user_id)
    .bind(role)
    .fetch_one(pool)
    .await?;

    Ok(exists)
}
