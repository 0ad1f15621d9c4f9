// src/services/assets.rs
//! Asset persistence. Assets are written once by the stage that produced
//! them and read by later stages and by composition.

use sqlx::PgPool;
use uuid::Uuid;

use crate::error::PipelineError;
use crate::models::{Asset, AssetKind};

pub struct NewAsset {
    pub session_id: Uuid,
    pub kind: AssetKind,
    pub reference: String,
    pub approved: bool,
    pub position: i32,
    pub metadata: serde_json::Value,
    pub verification: Option<serde_json::Value>,
}

pub struct AssetService;

impl AssetService {
    pub async fn insert(pool: &PgPool, new_asset: NewAsset) -> Result<Asset, PipelineError> {
        let asset = sqlx::query_as::<_, Asset>(
            r#"
            INSERT INTO assets (id, session_id, kind, reference, approved, position, metadata, verification)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(new_asset.session_id)
        .bind(new_asset.kind.as_str())
        .bind(&new_asset.reference)
        .bind(new_asset.approved)
        .bind(new_asset.position)
        .bind(&new_asset.metadata)
        .bind(&new_asset.verification)
        .fetch_one(pool)
        .await?;
        Ok(asset)
    }

    pub async fn for_session(pool: &PgPool, session_id: Uuid) -> Result<Vec<Asset>, PipelineError> {
        let assets = sqlx::query_as::<_, Asset>(
            "SELECT * FROM assets WHERE session_id = $1 ORDER BY kind, position",
        )
        .bind(session_id)
        .fetch_all(pool)
        .await?;
        Ok(assets)
    }

    /// Approved assets of one kind in timeline order.
    pub async fn approved(
        pool: &PgPool,
        session_id: Uuid,
        kind: AssetKind,
    ) -> Result<Vec<Asset>, PipelineError> {
        let assets = sqlx::query_as::<_, Asset>(
            "SELECT * FROM assets WHERE session_id = $1 AND kind = $2 AND approved \
             ORDER BY position",
        )
        .bind(session_id)
        .bind(kind.as_str())
        .fetch_all(pool)
        .await?;
        Ok(assets)
    }

    pub async fn count_of_kind(
        pool: &PgPool,
        session_id: Uuid,
        kind: AssetKind,
    ) -> Result<i64, PipelineError> {
        let row: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM assets WHERE session_id = $1 AND kind = $2 AND approved",
        )
        .bind(session_id)
        .bind(kind.as_str())
        .fetch_one(pool)
        .await?;
        Ok(row.0)
    }

    /// Optional background-music track for a session, if one was provided.
    pub async fn music_for_session(
        pool: &PgPool,
        session_id: Uuid,
    ) -> Result<Option<Asset>, PipelineError> {
        let asset = sqlx::query_as::<_, Asset>(
            "SELECT * FROM assets WHERE session_id = $1 AND kind = 'audio' \
             AND metadata->>'role' = 'music' AND approved LIMIT 1",
        )
        .bind(session_id)
        .fetch_optional(pool)
        .await?;
        Ok(asset)
    }
}
