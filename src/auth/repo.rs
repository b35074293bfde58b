use anyhow::Context;
use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use super::password::hash_password;
use super::repo_types::{NewUser, PublicUser, StoreError, UniqueField, User};

/// Credential store. Implementations hash `NewUser::password` before saving
/// and reject duplicate usernames/emails with [`StoreError::Duplicate`].
#[async_trait]
pub trait UserStore: Send + Sync {
    /// First account whose username or email matches; `None` arguments match nothing.
    async fn find_by_username_or_email(
        &self,
        username: Option<&str>,
        email: Option<&str>,
    ) -> anyhow::Result<Option<User>>;

    async fn find_by_id(&self, id: Uuid) -> anyhow::Result<Option<User>>;

    async fn find_public_by_id(&self, id: Uuid) -> anyhow::Result<Option<PublicUser>>;

    async fn create(&self, new_user: NewUser) -> Result<Uuid, StoreError>;

    /// Overwrites the stored refresh token. Returns `false` when no such account exists.
    async fn set_refresh_token(&self, id: Uuid, token: Option<&str>) -> anyhow::Result<bool>;
}

#[derive(Clone)]
pub struct PgUserStore {
    db: PgPool,
}

impl PgUserStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

const USER_COLUMNS: &str = "id, username, email, full_name, password_hash, avatar, cover_image, \
                            refresh_token, created_at, updated_at";

#[async_trait]
impl UserStore for PgUserStore {
    async fn find_by_username_or_email(
        &self,
        username: Option<&str>,
        email: Option<&str>,
    ) -> anyhow::Result<Option<User>> {
        let sql = format!(
            "SELECT {USER_COLUMNS} FROM users WHERE username = $1 OR email = $2 LIMIT 1"
        );
        let user = sqlx::query_as::<_, User>(&sql)
            .bind(username)
            .bind(email)
            .fetch_optional(&self.db)
            .await
            .context("find user by username or email")?;
        Ok(user)
    }

    async fn find_by_id(&self, id: Uuid) -> anyhow::Result<Option<User>> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1");
        let user = sqlx::query_as::<_, User>(&sql)
            .bind(id)
            .fetch_optional(&self.db)
            .await
            .context("find user by id")?;
        Ok(user)
    }

    async fn find_public_by_id(&self, id: Uuid) -> anyhow::Result<Option<PublicUser>> {
        let user = sqlx::query_as::<_, PublicUser>(
            r#"
            SELECT id, username, email, full_name, avatar, cover_image, created_at, updated_at
            FROM users
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.db)
        .await
        .context("find public user by id")?;
        Ok(user)
    }

    async fn create(&self, new_user: NewUser) -> Result<Uuid, StoreError> {
        let hash = hash_password(&new_user.password).context("hash new user password")?;
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO users (id, username, email, full_name, password_hash, avatar, cover_image)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(id)
        .bind(&new_user.username)
        .bind(&new_user.email)
        .bind(&new_user.full_name)
        .bind(&hash)
        .bind(&new_user.avatar)
        .bind(&new_user.cover_image)
        .execute(&self.db)
        .await
        .map_err(map_insert_error)?;
        Ok(id)
    }

    async fn set_refresh_token(&self, id: Uuid, token: Option<&str>) -> anyhow::Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE users
               SET refresh_token = $2, updated_at = now()
             WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(token)
        .execute(&self.db)
        .await
        .context("update refresh token")?;
        Ok(res.rows_affected() > 0)
    }
}

fn map_insert_error(e: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db) = &e {
        if db.is_unique_violation() {
            return StoreError::Duplicate(field_for_constraint(db.constraint()));
        }
    }
    StoreError::Other(anyhow::Error::new(e).context("insert user"))
}

fn field_for_constraint(constraint: Option<&str>) -> UniqueField {
    match constraint {
        Some("users_username_key") => UniqueField::Username,
        Some("users_email_key") => UniqueField::Email,
        _ => UniqueField::Unknown,
    }
}
