use std::sync::Arc;

use axum::{extract::State, Json};
use serde::Serialize;
use sqlx::mysql::MySqlConnection;
use sqlx::Row;
use tracing::warn;

use crate::config::GameDbConfig;
use crate::game_store::{connect, with_budget, QUERY_BUDGET};

#[derive(Clone)]
pub struct ServerInfoState {
    pub game_db: GameDbConfig,
}

#[derive(Serialize)]
pub struct StatusResponse {
    pub online: u64,
}

#[derive(Serialize)]
pub struct RankedCharacter {
    pub name: String,
    pub level: i64,
    pub class_id: i64,
    pub kills: i64,
}

#[derive(Serialize)]
pub struct Hero {
    pub name: String,
    pub class_id: i64,
    pub count: i64,
}

#[derive(Serialize)]
pub struct Castle {
    pub name: String,
    pub owner_clan: Option<String>,
    pub siege_date: Option<i64>,
}

#[derive(Serialize)]
pub struct RankingsResponse {
    pub pvp: Vec<RankedCharacter>,
    pub pk: Vec<RankedCharacter>,
    pub heroes: Vec<Hero>,
    pub castles: Vec<Castle>,
}

/// GET /server/status — live character count. An unreachable game database
/// reads as an empty server rather than an error page.
pub async fn server_status(
    State(state): State<Arc<ServerInfoState>>,
) -> Json<StatusResponse> {
    let online = match count_online(&state.game_db).await {
        Ok(n) => n,
        Err(e) => {
            warn!("online count unavailable: {e}");
            0
        }
    };
    Json(StatusResponse { online })
}

/// GET /server/rankings — top PvP/PK lists, heroes, castle sieges. The
/// legacy schema is an undocumented contract; any table that is missing or
/// changed degrades to an empty section.
pub async fn server_rankings(
    State(state): State<Arc<ServerInfoState>>,
) -> Json<RankingsResponse> {
    let mut conn = match connect(&state.game_db).await {
        Ok(conn) => conn,
        Err(e) => {
            warn!("rankings unavailable: {e}");
            return Json(RankingsResponse {
                pvp: vec![],
                pk: vec![],
                heroes: vec![],
                castles: vec![],
            });
        }
    };

    let pvp = top_characters(&mut conn, "pvpkills").await;
    let pk = top_characters(&mut conn, "pkkills").await;
    let heroes = current_heroes(&mut conn).await;
    let castles = castle_sieges(&mut conn).await;
    Json(RankingsResponse {
        pvp,
        pk,
        heroes,
        castles,
    })
}

async fn count_online(config: &GameDbConfig) -> Result<u64, crate::error::AppError> {
    let mut conn = connect(config).await?;
    let row = with_budget(
        QUERY_BUDGET,
        sqlx::query("SELECT COUNT(*) AS cnt FROM characters WHERE online = 1")
            .fetch_one(&mut conn),
    )
    .await?;
    Ok(row.get::<i64, _>("cnt").max(0) as u64)
}

async fn top_characters(conn: &mut MySqlConnection, column: &str) -> Vec<RankedCharacter> {
    // `column` is one of two compile-time literals, never user input.
    let query = format!(
        "SELECT char_name, level, classid, {column} AS kills FROM characters \
         WHERE accesslevel = 0 AND {column} > 0 ORDER BY {column} DESC LIMIT 10"
    );
    let result = with_budget(QUERY_BUDGET, sqlx::query(&query).fetch_all(conn)).await;
    match result {
        Ok(rows) => rows
            .iter()
            .map(|r| RankedCharacter {
                name: r.get("char_name"),
                level: r.get::<i64, _>("level"),
                class_id: r.get::<i64, _>("classid"),
                kills: r.get::<i64, _>("kills"),
            })
            .collect(),
        Err(e) => {
            warn!(column, "ranking query failed: {e}");
            vec![]
        }
    }
}

async fn current_heroes(conn: &mut MySqlConnection) -> Vec<Hero> {
    let result = with_budget(
        QUERY_BUDGET,
        sqlx::query(
            "SELECT c.char_name, h.class_id, h.count FROM heroes h \
             JOIN characters c ON c.charId = h.charId WHERE h.played = 1",
        )
        .fetch_all(conn),
    )
    .await;
    match result {
        Ok(rows) => rows
            .iter()
            .map(|r| Hero {
                name: r.get("char_name"),
                class_id: r.get::<i64, _>("class_id"),
                count: r.get::<i64, _>("count"),
            })
            .collect(),
        Err(e) => {
            warn!("heroes query failed: {e}");
            vec![]
        }
    }
}

async fn castle_sieges(conn: &mut MySqlConnection) -> Vec<Castle> {
    let result = with_budget(
        QUERY_BUDGET,
        sqlx::query(
            "SELECT ca.name, ca.siegeDate, cl.clan_name FROM castle ca \
             LEFT JOIN clan_data cl ON cl.hasCastle = ca.id",
        )
        .fetch_all(conn),
    )
    .await;
    match result {
        Ok(rows) => rows
            .iter()
            .map(|r| Castle {
                name: r.get("name"),
                owner_clan: r.try_get("clan_name").ok(),
                siege_date: r.try_get::<i64, _>("siegeDate").ok(),
            })
            .collect(),
        Err(e) => {
            warn!("castle query failed: {e}");
            vec![]
        }
    }
}
