// src/services/sessions.rs
//! Session persistence: creation, stage transitions, cost roll-ups.

use rust_decimal::Decimal;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::PipelineError;
use crate::models::{Session, Stage};

pub struct SessionService;

impl SessionService {
    pub async fn create(pool: &PgPool, owner: &str, prompt: &str) -> Result<Session, PipelineError> {
        let session = sqlx::query_as::<_, Session>(
            r#"
            INSERT INTO sessions (id, owner, prompt)
            VALUES ($1, $2, $3)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(owner)
        .bind(prompt)
        .fetch_one(pool)
        .await?;

        tracing::info!("🎬 Created session {} for {}", session.id, owner);
        Ok(session)
    }

    pub async fn fetch(pool: &PgPool, id: Uuid) -> Result<Session, PipelineError> {
        sqlx::query_as::<_, Session>("SELECT * FROM sessions WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await?
            .ok_or(PipelineError::SessionNotFound(id))
    }

    pub async fn set_stage(pool: &PgPool, id: Uuid, stage: Stage) -> Result<(), PipelineError> {
        sqlx::query("UPDATE sessions SET stage = $2, updated_at = now() WHERE id = $1")
            .bind(id)
            .bind(stage.as_str())
            .execute(pool)
            .await?;
        tracing::debug!("Session {} stage -> {}", id, stage);
        Ok(())
    }

    /// Terminal failure for this invocation: records the error alongside the
    /// stage flip.
    pub async fn mark_failed(pool: &PgPool, id: Uuid, error: &str) -> Result<(), PipelineError> {
        sqlx::query(
            "UPDATE sessions SET stage = $2, last_error = $3, updated_at = now() WHERE id = $1",
        )
        .bind(id)
        .bind(Stage::Failed.as_str())
        .bind(error)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn store_script(
        pool: &PgPool,
        id: Uuid,
        script: &serde_json::Value,
    ) -> Result<(), PipelineError> {
        sqlx::query("UPDATE sessions SET script = $2, updated_at = now() WHERE id = $1")
            .bind(id)
            .bind(script)
            .execute(pool)
            .await?;
        Ok(())
    }

    /// Add a stage's cost to its column and the session total. The column is
    /// selected statically per stage; amounts only ever accumulate.
    pub async fn add_stage_cost(
        pool: &PgPool,
        id: Uuid,
        trigger: &str,
        amount: Decimal,
    ) -> Result<(), PipelineError> {
        let sql = match trigger {
            "script" => {
                "UPDATE sessions SET script_cost = script_cost + $2, \
                 total_cost = total_cost + $2, updated_at = now() WHERE id = $1"
            }
            "images" => {
                "UPDATE sessions SET image_cost = image_cost + $2, \
                 total_cost = total_cost + $2, updated_at = now() WHERE id = $1"
            }
            "audio" => {
                "UPDATE sessions SET audio_cost = audio_cost + $2, \
                 total_cost = total_cost + $2, updated_at = now() WHERE id = $1"
            }
            "clips" => {
                "UPDATE sessions SET clip_cost = clip_cost + $2, \
                 total_cost = total_cost + $2, updated_at = now() WHERE id = $1"
            }
            "compose" => {
                "UPDATE sessions SET compose_cost = compose_cost + $2, \
                 total_cost = total_cost + $2, updated_at = now() WHERE id = $1"
            }
            other => {
                return Err(PipelineError::Storage(format!(
                    "unknown cost bucket: {}",
                    other
                )))
            }
        };

        sqlx::query(sql).bind(id).bind(amount).execute(pool).await?;
        Ok(())
    }

    pub async fn set_final_video(
        pool: &PgPool,
        id: Uuid,
        reference: &str,
        verification_status: &str,
    ) -> Result<(), PipelineError> {
        sqlx::query(
            "UPDATE sessions SET final_video_ref = $2, verification_status = $3, \
             updated_at = now() WHERE id = $1",
        )
        .bind(id)
        .bind(reference)
        .bind(verification_status)
        .execute(pool)
        .await?;
        Ok(())
    }
}
