// src/models/mod.rs
//! Database row types and the session stage machine.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Pipeline stage for a session.
///
/// Transitions are monotonic forward on success; `Failed` is terminal for the
/// invocation that set it (a later explicit re-trigger starts a new one).
/// Stored as TEXT, converted at the query boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Pending,
    GeneratingScript,
    ScriptReady,
    GeneratingImages,
    ImagesReady,
    GeneratingAudio,
    AudioReady,
    GeneratingAssets,
    AssetsReady,
    GeneratingClips,
    ClipsReady,
    Composing,
    Completed,
    Failed,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Pending => "pending",
            Stage::GeneratingScript => "generating_script",
            Stage::ScriptReady => "script_ready",
            Stage::GeneratingImages => "generating_images",
            Stage::ImagesReady => "images_ready",
            Stage::GeneratingAudio => "generating_audio",
            Stage::AudioReady => "audio_ready",
            Stage::GeneratingAssets => "generating_assets",
            Stage::AssetsReady => "assets_ready",
            Stage::GeneratingClips => "generating_clips",
            Stage::ClipsReady => "clips_ready",
            Stage::Composing => "composing",
            Stage::Completed => "completed",
            Stage::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Stage> {
        let stage = match value {
            "pending" => Stage::Pending,
            "generating_script" => Stage::GeneratingScript,
            "script_ready" => Stage::ScriptReady,
            "generating_images" => Stage::GeneratingImages,
            "images_ready" => Stage::ImagesReady,
            "generating_audio" => Stage::GeneratingAudio,
            "audio_ready" => Stage::AudioReady,
            "generating_assets" => Stage::GeneratingAssets,
            "assets_ready" => Stage::AssetsReady,
            "generating_clips" => Stage::GeneratingClips,
            "clips_ready" => Stage::ClipsReady,
            "composing" => Stage::Composing,
            "completed" => Stage::Completed,
            "failed" => Stage::Failed,
            _ => return None,
        };
        Some(stage)
    }

    /// Position of the stage along the forward path. `Failed` ranks above
    /// everything so a failed session never compares as "behind" a progress
    /// write within the same invocation.
    pub fn rank(&self) -> u8 {
        match self {
            Stage::Pending => 0,
            Stage::GeneratingScript => 1,
            Stage::ScriptReady => 2,
            Stage::GeneratingImages | Stage::GeneratingAudio | Stage::GeneratingAssets => 3,
            Stage::ImagesReady | Stage::AudioReady => 4,
            Stage::AssetsReady => 5,
            Stage::GeneratingClips => 6,
            Stage::ClipsReady => 7,
            Stage::Composing => 8,
            Stage::Completed => 9,
            Stage::Failed => 10,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Completed | Stage::Failed)
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One end-to-end pipeline invocation tracked through ordered stages.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Session {
    pub id: Uuid,
    pub owner: String,
    pub prompt: String,
    pub stage: String,
    pub script: Option<serde_json::Value>,
    pub script_cost: Decimal,
    pub image_cost: Decimal,
    pub audio_cost: Decimal,
    pub clip_cost: Decimal,
    pub compose_cost: Decimal,
    pub total_cost: Decimal,
    pub final_video_ref: Option<String>,
    pub verification_status: Option<String>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    /// Current stage as an enum. An unknown value in the column is treated as
    /// `Failed` so nothing advances past corrupt state.
    pub fn current_stage(&self) -> Stage {
        Stage::parse(&self.stage).unwrap_or(Stage::Failed)
    }
}

/// Asset kind. Stored as TEXT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetKind {
    Image,
    Audio,
    Video,
    Final,
}

impl AssetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetKind::Image => "image",
            AssetKind::Audio => "audio",
            AssetKind::Video => "video",
            AssetKind::Final => "final",
        }
    }
}

/// A generated artifact plus provenance metadata.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Asset {
    pub id: Uuid,
    pub session_id: Uuid,
    pub kind: String,
    pub reference: String,
    pub approved: bool,
    pub position: i32,
    pub metadata: serde_json::Value,
    pub verification: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// Append-only per-service cost entry. Never mutated or deleted; the sum per
/// session equals the session's cost total.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CostRecord {
    pub id: i64,
    pub session_id: Uuid,
    pub service: String,
    pub amount: Decimal,
    pub detail: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// One status-subscriber connection as seen by the shared store.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ConnectionRecord {
    pub id: Uuid,
    pub session_id: Option<Uuid>,
    pub connected_at: DateTime<Utc>,
    pub disconnected_at: Option<DateTime<Utc>>,
}

/// One segment of the generated script; the ordered list is stored in
/// `sessions.script` and drives the image, audio, and clip stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptSegment {
    pub part: String,
    pub narration: String,
    pub visual_prompt: String,
    pub target_duration: f64,
}

/// The four required parts of a generated script, in timeline order.
pub const SCRIPT_PARTS: [&str; 4] = ["hook", "concept", "process", "conclusion"];
