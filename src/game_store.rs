use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection};
use sqlx::{Connection, Row};
use tokio::time::timeout;
use tracing::{debug, instrument};

use crate::config::GameDbConfig;
use crate::error::AppError;

const CONNECT_BUDGET: Duration = Duration::from_secs(3);
pub(crate) const QUERY_BUDGET: Duration = Duration::from_secs(5);

/// Character row as read from the legacy `characters` table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CharacterRow {
    pub char_id: i64,
    pub name: String,
    pub account_name: String,
    pub online: bool,
}

/// Seam over the legacy game database. The MySQL adapter is the production
/// implementation; tests drive the fulfillment pathway through an in-memory
/// double.
#[async_trait]
pub trait GameStore: Send + Sync {
    async fn find_character(&self, name: &str) -> Result<Option<CharacterRow>, AppError>;

    /// Game login linked to a web account email, if any.
    async fn account_login_for_email(&self, email: &str) -> Result<Option<String>, AppError>;

    /// Increments an existing inventory stack of `item_id` or inserts a new
    /// one. Fails with NotFound when the character does not exist.
    async fn credit_item(&self, character: &str, item_id: u32, count: u64) -> Result<(), AppError>;

    /// Moves an offline character to the given coordinates.
    async fn teleport(&self, character: &str, x: i32, y: i32, z: i32) -> Result<(), AppError>;
}

/// Opens a fresh connection per call, mirroring the one-shot serverless
/// functions this replaces. No pool, no retries.
pub struct MySqlGameStore {
    config: GameDbConfig,
}

impl MySqlGameStore {
    pub fn new(config: GameDbConfig) -> Self {
        Self { config }
    }

    async fn connect(&self) -> Result<MySqlConnection, AppError> {
        connect(&self.config).await
    }
}

/// One-shot connection, shared with the server-info reads.
pub(crate) async fn connect(config: &GameDbConfig) -> Result<MySqlConnection, AppError> {
    let options = MySqlConnectOptions::new()
        .host(&config.host)
        .port(config.port)
        .database(&config.database)
        .username(&config.user)
        .password(&config.password);
    with_budget(CONNECT_BUDGET, MySqlConnection::connect_with(&options)).await
}

/// Caps an awaited database call so a dead server cannot hang a request.
pub(crate) async fn with_budget<T, F>(budget: Duration, fut: F) -> Result<T, AppError>
where
    F: Future<Output = Result<T, sqlx::Error>>,
{
    match timeout(budget, fut).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(AppError::Upstream("game database timed out".to_string())),
    }
}

#[async_trait]
impl GameStore for MySqlGameStore {
    #[instrument(skip(self))]
    async fn find_character(&self, name: &str) -> Result<Option<CharacterRow>, AppError> {
        let mut conn = self.connect().await?;
        let row = with_budget(
            QUERY_BUDGET,
            sqlx::query(
                "SELECT charId, char_name, account_name, online \
                 FROM characters WHERE char_name = ?",
            )
            .bind(name)
            .fetch_optional(&mut conn),
        )
        .await?;

        Ok(row.map(|r| CharacterRow {
            char_id: r.get::<i64, _>("charId"),
            name: r.get("char_name"),
            account_name: r.get("account_name"),
            online: r.get::<i64, _>("online") != 0,
        }))
    }

    #[instrument(skip(self))]
    async fn account_login_for_email(&self, email: &str) -> Result<Option<String>, AppError> {
        let mut conn = self.connect().await?;
        let row = with_budget(
            QUERY_BUDGET,
            sqlx::query("SELECT login FROM accounts WHERE email = ?")
                .bind(email)
                .fetch_optional(&mut conn),
        )
        .await?;
        Ok(row.map(|r| r.get("login")))
    }

    #[instrument(skip(self))]
    async fn credit_item(&self, character: &str, item_id: u32, count: u64) -> Result<(), AppError> {
        let mut conn = self.connect().await?;

        let owner = with_budget(
            QUERY_BUDGET,
            sqlx::query("SELECT charId FROM characters WHERE char_name = ?")
                .bind(character)
                .fetch_optional(&mut conn),
        )
        .await?
        .ok_or_else(|| AppError::NotFound(format!("character {character} not found")))?;
        let owner_id: i64 = owner.get("charId");

        let existing = with_budget(
            QUERY_BUDGET,
            sqlx::query(
                "SELECT object_id FROM items \
                 WHERE owner_id = ? AND item_id = ? AND loc = 'INVENTORY' LIMIT 1",
            )
            .bind(owner_id)
            .bind(item_id)
            .fetch_optional(&mut conn),
        )
        .await?;

        match existing {
            Some(stack) => {
                let object_id: i64 = stack.get("object_id");
                with_budget(
                    QUERY_BUDGET,
                    sqlx::query("UPDATE items SET count = count + ? WHERE object_id = ?")
                        .bind(count as i64)
                        .bind(object_id)
                        .execute(&mut conn),
                )
                .await?;
                debug!(character, item_id, count, object_id, "incremented stack");
            }
            None => {
                // Known race: two concurrent deliveries can read the same max
                // and collide on object_id. The legacy schema has no sequence
                // to lean on.
                let max_row = with_budget(
                    QUERY_BUDGET,
                    sqlx::query("SELECT COALESCE(MAX(object_id), 0) AS max_id FROM items")
                        .fetch_one(&mut conn),
                )
                .await?;
                let object_id: i64 = max_row.get::<i64, _>("max_id") + 1;

                with_budget(
                    QUERY_BUDGET,
                    sqlx::query(
                        "INSERT INTO items \
                         (object_id, owner_id, item_id, count, enchant_level, loc, loc_data) \
                         VALUES (?, ?, ?, ?, 0, 'INVENTORY', 0)",
                    )
                    .bind(object_id)
                    .bind(owner_id)
                    .bind(item_id)
                    .bind(count as i64)
                    .execute(&mut conn),
                )
                .await?;
                debug!(character, item_id, count, object_id, "inserted stack");
            }
        }

        Ok(())
    }

    #[instrument(skip(self))]
    async fn teleport(&self, character: &str, x: i32, y: i32, z: i32) -> Result<(), AppError> {
        let mut conn = self.connect().await?;
        let result = with_budget(
            QUERY_BUDGET,
            sqlx::query(
                "UPDATE characters SET x = ?, y = ?, z = ? \
                 WHERE char_name = ? AND online = 0",
            )
            .bind(x)
            .bind(y)
            .bind(z)
            .bind(character)
            .execute(&mut conn),
        )
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::Conflict(
                "character must be offline to be teleported".to_string(),
            ));
        }
        Ok(())
    }
}
