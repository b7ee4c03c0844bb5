use async_trait::async_trait;

use crate::app_error::AppResult;

/// Lookup into the identity provider's user records.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Case-insensitive email match.
    async fn find_user_id_by_email(&self, email: &str) -> AppResult<Option<String>>;
}
