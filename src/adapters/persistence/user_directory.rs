use async_trait::async_trait;
use sqlx::Row;

use crate::{
    adapters::persistence::PostgresPersistence,
    app_error::{AppError, AppResult},
    ports::user_directory::UserDirectory,
};

#[async_trait]
impl UserDirectory for PostgresPersistence {
    async fn find_user_id_by_email(&self, email: &str) -> AppResult<Option<String>> {
        let email = email.trim();
        if email.is_empty() {
            return Ok(None);
        }
        let row = sqlx::query("SELECT id FROM users WHERE LOWER(email) = LOWER($1) ORDER BY created_at LIMIT 1")
            .bind(email)
            .fetch_optional(self.pool())
            .await
            .map_err(AppError::from)?;
        Ok(row.map(|r| r.get("id")))
    }
}
