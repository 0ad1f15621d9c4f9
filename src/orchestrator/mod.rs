// src/orchestrator/mod.rs
//! Top-level pipeline coordinator.
//!
//! Sequences stages per session, drives the generation providers through the
//! retrying client and bounded fan-out, persists assets and costs, and
//! broadcasts progress. Every stage follows the same shape: mark in-progress,
//! 0% event, run providers, persist, advance, 100% event with the stage cost.
//! On any error the session flips to `failed` and exactly one error event
//! goes out; there is no automatic stage-level retry.

use base64::Engine as _;
use rust_decimal::Decimal;
use serde_json::json;
use sqlx::PgPool;
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

use crate::compose::ffmpeg::CommandRunner;
use crate::compose::{Composer, ProgressFn, SegmentSpec, VisualSource};
use crate::error::PipelineError;
use crate::models::{AssetKind, ScriptSegment, Session, Stage, SCRIPT_PARTS};
use crate::providers::fanout::{self, CompletionPolicy};
use crate::providers::{GenerationProvider, ProviderCatalog};
use crate::registry::{ConnectionRegistry, CumulativeEvent, ErrorEvent, ProgressEvent};
use crate::services::assets::{AssetService, NewAsset};
use crate::services::cost_ledger::CostLedger;
use crate::services::sessions::SessionService;
use crate::storage::{asset_key, ObjectStore};
use crate::verify;
use crate::verify::clip::ClipVerifyConfig;
use crate::verify::image::ImageVerifyConfig;

pub mod guard;

use guard::ProcessingGuard;

/// Caller-visible stage triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageTrigger {
    Script,
    Images,
    Audio,
    Assets,
    Clips,
    Compose,
}

impl StageTrigger {
    pub fn parse(value: &str) -> Option<Self> {
        let trigger = match value {
            "script" => Self::Script,
            "images" => Self::Images,
            "audio" => Self::Audio,
            "assets" => Self::Assets,
            "clips" => Self::Clips,
            "compose" => Self::Compose,
            _ => return None,
        };
        Some(trigger)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Script => "script",
            Self::Images => "images",
            Self::Audio => "audio",
            Self::Assets => "assets",
            Self::Clips => "clips",
            Self::Compose => "compose",
        }
    }

    pub fn in_progress_stage(&self) -> Stage {
        match self {
            Self::Script => Stage::GeneratingScript,
            Self::Images => Stage::GeneratingImages,
            Self::Audio => Stage::GeneratingAudio,
            Self::Assets => Stage::GeneratingAssets,
            Self::Clips => Stage::GeneratingClips,
            Self::Compose => Stage::Composing,
        }
    }

    /// Which current stages permit this trigger. `Failed` always does: a
    /// failed stage is only ever restarted by an explicit re-trigger.
    pub fn allowed_from(&self, current: Stage) -> bool {
        if current == Stage::Failed {
            return true;
        }
        match self {
            Self::Script => current == Stage::Pending,
            Self::Images => matches!(current, Stage::ScriptReady | Stage::AudioReady),
            Self::Audio => matches!(current, Stage::ScriptReady | Stage::ImagesReady),
            Self::Assets => current == Stage::ScriptReady,
            Self::Clips => current == Stage::AssetsReady,
            Self::Compose => current == Stage::ClipsReady,
        }
    }
}

pub struct Orchestrator {
    pool: PgPool,
    registry: Arc<ConnectionRegistry>,
    providers: ProviderCatalog,
    store: Arc<dyn ObjectStore>,
    runner: Arc<dyn CommandRunner>,
    guard: ProcessingGuard,
    scratch_root: PathBuf,
    fan_out_limit: usize,
    image_config: ImageVerifyConfig,
    clip_config: ClipVerifyConfig,
}

impl Orchestrator {
    pub fn new(
        pool: PgPool,
        registry: Arc<ConnectionRegistry>,
        providers: ProviderCatalog,
        store: Arc<dyn ObjectStore>,
        runner: Arc<dyn CommandRunner>,
        scratch_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            pool,
            registry,
            providers,
            store,
            runner,
            guard: ProcessingGuard::new(),
            scratch_root: scratch_root.into(),
            fan_out_limit: 4,
            image_config: ImageVerifyConfig::default(),
            clip_config: ClipVerifyConfig::default(),
        }
    }

    pub fn providers(&self) -> &ProviderCatalog {
        &self.providers
    }

    pub fn is_processing(&self, session_id: Uuid) -> bool {
        self.guard.is_processing(session_id)
    }

    /// Validate and launch a stage in the background. Returns immediately;
    /// progress and errors flow to status subscribers.
    pub async fn trigger(self: &Arc<Self>, session_id: Uuid, trigger: StageTrigger) -> Result<(), PipelineError> {
        let session = SessionService::fetch(&self.pool, session_id).await?;
        let current = session.current_stage();
        if !trigger.allowed_from(current) {
            return Err(PipelineError::InvalidStage {
                current: current.as_str().to_string(),
                requested: trigger.as_str().to_string(),
            });
        }

        let claim = self
            .guard
            .claim(session_id)
            .ok_or(PipelineError::AlreadyProcessing(session_id))?;

        let this = self.clone();
        tokio::spawn(async move {
            let _claim = claim;
            this.run_stage(session, trigger).await;
        });

        Ok(())
    }

    async fn run_stage(&self, session: Session, trigger: StageTrigger) {
        let session_id = session.id;
        let stage_label = trigger.as_str();
        tracing::info!("🎬 Running stage {} for session {}", stage_label, session_id);

        let result = match trigger {
            StageTrigger::Script => self.generate_script(&session).await,
            StageTrigger::Images => self.run_images_stage(&session).await,
            StageTrigger::Audio => self.run_audio_stage(&session).await,
            StageTrigger::Assets => self.finalize_assets(&session).await,
            StageTrigger::Clips => self.generate_clips(&session).await,
            StageTrigger::Compose => self.compose_final(&session).await,
        };

        match result {
            Ok(()) => {
                tracing::info!("✅ Stage {} completed for session {}", stage_label, session_id);
            }
            Err(err) => {
                tracing::error!("❌ Stage {} failed for session {}: {}", stage_label, session_id, err);
                if let Err(db_err) = SessionService::mark_failed(&self.pool, session_id, &err.to_string()).await {
                    tracing::error!("Failed to record failure for session {}: {}", session_id, db_err);
                }
                // Exactly one error event per failed invocation.
                self.registry
                    .broadcast(session_id, &ErrorEvent::new(stage_label, err.class(), &err.to_string()))
                    .await;
            }
        }
    }

    // -- script ------------------------------------------------------------

    async fn generate_script(&self, session: &Session) -> Result<(), PipelineError> {
        let provider = self.providers.require("script")?;
        SessionService::set_stage(&self.pool, session.id, Stage::GeneratingScript).await?;
        self.registry
            .broadcast(session.id, &ProgressEvent::started("script"))
            .await;

        let parts: Vec<String> = SCRIPT_PARTS.iter().map(|p| p.to_string()).collect();
        let prompt = session.prompt.clone();
        let outcome = fanout::run_bounded(parts, self.fan_out_limit, |_, part| {
            let provider = provider.clone();
            let prompt = prompt.clone();
            async move {
                let output = provider
                    .generate(json!({ "part": part, "topic": prompt }))
                    .await?;

                let narration = output.result["narration"].as_str().unwrap_or_default().to_string();
                let visual_prompt = output.result["visual_prompt"].as_str().unwrap_or_default().to_string();
                if narration.is_empty() || visual_prompt.is_empty() {
                    return Err(PipelineError::ProviderLogic {
                        service: provider.service().to_string(),
                        message: format!("script part '{}' came back incomplete", part),
                    });
                }

                let segment = ScriptSegment {
                    part,
                    narration,
                    visual_prompt,
                    target_duration: output.result["target_duration"].as_f64().unwrap_or(10.0),
                };
                Ok((segment, output.cost))
            }
        })
        .await;

        // A script missing any required part is unusable.
        let report = outcome.into_result(CompletionPolicy::AllRequired)?;
        let segments: Vec<ScriptSegment> = report.values.into_iter().map(|(_, segment)| segment).collect();
        let script = serde_json::to_value(&segments)
            .map_err(|e| PipelineError::Storage(format!("serialize script failed: {}", e)))?;

        SessionService::store_script(&self.pool, session.id, &script).await?;
        CostLedger::record(
            &self.pool,
            session.id,
            "script",
            report.total_cost,
            json!({ "parts": segments.len() }),
        )
        .await?;
        SessionService::add_stage_cost(&self.pool, session.id, "script", report.total_cost).await?;
        SessionService::set_stage(&self.pool, session.id, Stage::ScriptReady).await?;
        self.registry
            .broadcast(session.id, &ProgressEvent::completed("script", report.total_cost))
            .await;
        Ok(())
    }

    // -- images / audio ----------------------------------------------------

    async fn run_images_stage(&self, session: &Session) -> Result<(), PipelineError> {
        let segments = script_segments(session)?;
        SessionService::set_stage(&self.pool, session.id, Stage::GeneratingImages).await?;
        self.registry
            .broadcast(session.id, &ProgressEvent::started("images"))
            .await;

        let cost = self.run_image_batch(session, &segments).await?;
        SessionService::add_stage_cost(&self.pool, session.id, "images", cost).await?;

        // Both halves done moves straight to assets_ready.
        let audio_done = AssetService::count_of_kind(&self.pool, session.id, AssetKind::Audio).await? > 0;
        let next = if audio_done { Stage::AssetsReady } else { Stage::ImagesReady };
        SessionService::set_stage(&self.pool, session.id, next).await?;
        self.registry
            .broadcast(session.id, &ProgressEvent::completed("images", cost))
            .await;
        Ok(())
    }

    async fn run_audio_stage(&self, session: &Session) -> Result<(), PipelineError> {
        let segments = script_segments(session)?;
        SessionService::set_stage(&self.pool, session.id, Stage::GeneratingAudio).await?;
        self.registry
            .broadcast(session.id, &ProgressEvent::started("audio"))
            .await;

        let cost = self.run_audio_batch(session, &segments).await?;
        SessionService::add_stage_cost(&self.pool, session.id, "audio", cost).await?;

        let images_done = AssetService::count_of_kind(&self.pool, session.id, AssetKind::Image).await? > 0;
        let next = if images_done { Stage::AssetsReady } else { Stage::AudioReady };
        SessionService::set_stage(&self.pool, session.id, next).await?;
        self.registry
            .broadcast(session.id, &ProgressEvent::completed("audio", cost))
            .await;
        Ok(())
    }

    /// Finalize variant: images and audio concurrently under an all-required
    /// join. Both halves run to completion (no cancellation of in-flight
    /// provider calls) and both must succeed, or the combined stage fails as
    /// one unit.
    async fn finalize_assets(&self, session: &Session) -> Result<(), PipelineError> {
        let segments = script_segments(session)?;
        self.providers.require("image")?;
        self.providers.require("voice")?;

        SessionService::set_stage(&self.pool, session.id, Stage::GeneratingAssets).await?;
        self.registry
            .broadcast(session.id, &ProgressEvent::started("assets"))
            .await;

        let (images, audio) = tokio::join!(
            self.run_image_batch(session, &segments),
            self.run_audio_batch(session, &segments),
        );
        let image_cost = images?;
        let audio_cost = audio?;

        SessionService::add_stage_cost(&self.pool, session.id, "images", image_cost).await?;
        SessionService::add_stage_cost(&self.pool, session.id, "audio", audio_cost).await?;
        SessionService::set_stage(&self.pool, session.id, Stage::AssetsReady).await?;
        self.registry
            .broadcast(session.id, &ProgressEvent::completed("assets", image_cost + audio_cost))
            .await;
        Ok(())
    }

    /// Generate one image per segment, gate each through verification, and
    /// persist the survivors. Best-effort: a single good image keeps the
    /// batch alive.
    async fn run_image_batch(&self, session: &Session, segments: &[ScriptSegment]) -> Result<Decimal, PipelineError> {
        let provider = self.providers.require("image")?;
        let tracker = self
            .new_tracker(
                session.id,
                "image_generation",
                segments.iter().map(|s| (s.part.clone(), "image")).collect(),
            )
            .await;

        let session_id = session.id;
        let outcome = fanout::run_bounded(segments.to_vec(), self.fan_out_limit, |index, segment| {
            let provider = provider.clone();
            let tracker = tracker.clone();
            let store = self.store.clone();
            let pool = self.pool.clone();
            let image_config = self.image_config.clone();
            async move {
                self.track(&tracker, session_id, &segment.part, "processing").await;

                let result = generate_image_asset(
                    provider,
                    store,
                    &pool,
                    session_id,
                    index,
                    &segment,
                    &image_config,
                )
                .await;

                let item_status = if result.is_ok() { "completed" } else { "failed" };
                self.track(&tracker, session_id, &segment.part, item_status).await;
                result
            }
        })
        .await;

        let report = outcome.into_result(CompletionPolicy::BestEffort)?;
        CostLedger::record(
            &self.pool,
            session_id,
            "image",
            report.total_cost,
            json!({ "generated": report.values.len(), "failed": report.failed.len() }),
        )
        .await?;
        Ok(report.total_cost)
    }

    /// Generate one narration track per segment. Best-effort like images;
    /// audio has no statistical gate, so tracks are approved on arrival.
    async fn run_audio_batch(&self, session: &Session, segments: &[ScriptSegment]) -> Result<Decimal, PipelineError> {
        let provider = self.providers.require("voice")?;
        let tracker = self
            .new_tracker(
                session.id,
                "audio_generation",
                segments.iter().map(|s| (s.part.clone(), "audio")).collect(),
            )
            .await;

        let session_id = session.id;
        let outcome = fanout::run_bounded(segments.to_vec(), self.fan_out_limit, |index, segment| {
            let provider = provider.clone();
            let tracker = tracker.clone();
            let store = self.store.clone();
            let pool = self.pool.clone();
            async move {
                self.track(&tracker, session_id, &segment.part, "processing").await;

                let result = generate_audio_asset(provider, store, &pool, session_id, index, &segment).await;

                let item_status = if result.is_ok() { "completed" } else { "failed" };
                self.track(&tracker, session_id, &segment.part, item_status).await;
                result
            }
        })
        .await;

        let report = outcome.into_result(CompletionPolicy::BestEffort)?;
        CostLedger::record(
            &self.pool,
            session_id,
            "voice",
            report.total_cost,
            json!({ "generated": report.values.len(), "failed": report.failed.len() }),
        )
        .await?;
        Ok(report.total_cost)
    }

    // -- clips ---------------------------------------------------------------

    async fn generate_clips(&self, session: &Session) -> Result<(), PipelineError> {
        let provider = self.providers.require("clip")?;
        let segments = script_segments(session)?;

        SessionService::set_stage(&self.pool, session.id, Stage::GeneratingClips).await?;
        self.registry
            .broadcast(session.id, &ProgressEvent::started("clips"))
            .await;

        let images = AssetService::approved(&self.pool, session.id, AssetKind::Image).await?;
        let audio = narration_assets(&self.pool, session.id).await?;

        // Only segments with both inputs can become clips; the rest fall back
        // to their still image at composition time.
        let mut jobs = Vec::new();
        for (index, segment) in segments.iter().enumerate() {
            let image = images.iter().find(|a| a.position == index as i32);
            let narration = audio.iter().find(|a| a.position == index as i32);
            if let (Some(image), Some(narration)) = (image, narration) {
                jobs.push(ClipJob {
                    index,
                    part: segment.part.clone(),
                    image_ref: image.reference.clone(),
                    audio_ref: narration.reference.clone(),
                    target_duration: segment.target_duration,
                });
            } else {
                tracing::warn!(
                    "Segment '{}' lacks an approved image or narration, skipping clip",
                    segment.part
                );
            }
        }
        if jobs.is_empty() {
            return Err(PipelineError::InvalidStage {
                current: session.stage.clone(),
                requested: "clips (no segment has both image and narration)".to_string(),
            });
        }

        let tracker = self
            .new_tracker(
                session.id,
                "clip_generation",
                jobs.iter().map(|j| (j.part.clone(), "video")).collect(),
            )
            .await;

        let session_id = session.id;
        let outcome = fanout::run_bounded(jobs, self.fan_out_limit, |_, job| {
            let provider = provider.clone();
            let tracker = tracker.clone();
            let store = self.store.clone();
            let pool = self.pool.clone();
            let runner = self.runner.clone();
            let clip_config = self.clip_config.clone();
            async move {
                self.track(&tracker, session_id, &job.part, "processing").await;

                let result = generate_clip_asset(
                    provider,
                    store,
                    &pool,
                    runner,
                    session_id,
                    &job,
                    &clip_config,
                )
                .await;

                let item_status = if result.is_ok() { "completed" } else { "failed" };
                self.track(&tracker, session_id, &job.part, item_status).await;
                result
            }
        })
        .await;

        let report = outcome.into_result(CompletionPolicy::BestEffort)?;
        CostLedger::record(
            &self.pool,
            session_id,
            "clip",
            report.total_cost,
            json!({ "generated": report.values.len(), "failed": report.failed.len() }),
        )
        .await?;
        SessionService::add_stage_cost(&self.pool, session.id, "clips", report.total_cost).await?;
        SessionService::set_stage(&self.pool, session.id, Stage::ClipsReady).await?;
        self.registry
            .broadcast(session.id, &ProgressEvent::completed("clips", report.total_cost))
            .await;
        Ok(())
    }

    // -- compose -------------------------------------------------------------

    async fn compose_final(&self, session: &Session) -> Result<(), PipelineError> {
        let segments = script_segments(session)?;
        SessionService::set_stage(&self.pool, session.id, Stage::Composing).await?;
        self.registry
            .broadcast(session.id, &ProgressEvent::started("compose"))
            .await;

        let clips = AssetService::approved(&self.pool, session.id, AssetKind::Video).await?;
        let images = AssetService::approved(&self.pool, session.id, AssetKind::Image).await?;
        let narration = narration_assets(&self.pool, session.id).await?;

        let mut specs = Vec::with_capacity(segments.len());
        for (index, segment) in segments.iter().enumerate() {
            let visual = clips
                .iter()
                .find(|a| a.position == index as i32)
                .map(|a| VisualSource::Video(a.reference.clone()))
                .or_else(|| {
                    images
                        .iter()
                        .find(|a| a.position == index as i32)
                        .map(|a| VisualSource::Image(a.reference.clone()))
                })
                .ok_or_else(|| PipelineError::CompositionStep {
                    step: "fetch".to_string(),
                    message: format!("segment '{}' has no approved visual", segment.part),
                })?;
            let audio = narration
                .iter()
                .find(|a| a.position == index as i32)
                .ok_or_else(|| PipelineError::CompositionStep {
                    step: "fetch".to_string(),
                    message: format!("segment '{}' has no narration", segment.part),
                })?;
            specs.push(SegmentSpec {
                part: segment.part.clone(),
                visual,
                audio_ref: audio.reference.clone(),
                target_duration: segment.target_duration,
            });
        }

        let music = AssetService::music_for_session(&self.pool, session.id).await?;

        let progress = self.compose_progress(session.id);
        let composer = Composer::new(self.store.clone(), self.runner.clone(), self.scratch_root.clone());
        let output = composer
            .compose(&specs, music.as_ref().map(|m| m.reference.as_str()), Some(progress))
            .await?;

        let key = asset_key(session.id, "final", 0, "mp4");
        self.store.put(&output.data, &key, "video/mp4").await?;

        // Gate the finished artifact the same way generated clips are gated.
        let expected_duration: f64 = segments.iter().map(|s| s.target_duration).sum();
        let verification = self
            .verify_final(&output.data, &key, expected_duration)
            .await;

        AssetService::insert(
            &self.pool,
            NewAsset {
                session_id: session.id,
                kind: AssetKind::Final,
                reference: key.clone(),
                approved: verification.is_usable(),
                position: 0,
                metadata: json!({
                    "duration": output.duration,
                    "with_music": output.with_music,
                }),
                verification: serde_json::to_value(&verification).ok(),
            },
        )
        .await?;
        SessionService::set_final_video(&self.pool, session.id, &key, verification.overall_str()).await?;
        SessionService::set_stage(&self.pool, session.id, Stage::Completed).await?;
        self.registry
            .broadcast(session.id, &ProgressEvent::completed("compose", Decimal::ZERO))
            .await;
        Ok(())
    }

    async fn verify_final(&self, data: &[u8], key: &str, expected_duration: f64) -> verify::VerificationReport {
        let scratch = match tempfile::TempDir::new_in(&self.scratch_root) {
            Ok(scratch) => scratch,
            Err(e) => {
                tracing::warn!("Could not stage final video for verification: {}", e);
                let mut report = verify::VerificationReport::new(key, "video");
                report.push(verify::Check::skipped("probe"));
                return report;
            }
        };
        let path = scratch.path().join("final.mp4");
        if let Err(e) = std::fs::write(&path, data) {
            tracing::warn!("Could not stage final video for verification: {}", e);
            let mut report = verify::VerificationReport::new(key, "video");
            report.push(verify::Check::skipped("probe"));
            return report;
        }

        verify::clip::verify_clip(key, &path, Some(expected_duration), &self.clip_config, self.runner.clone()).await
    }

    // -- shared helpers ------------------------------------------------------

    async fn new_tracker(
        &self,
        session_id: Uuid,
        event_type: &str,
        items: Vec<(String, &str)>,
    ) -> Arc<tokio::sync::Mutex<CumulativeEvent>> {
        let items = items
            .into_iter()
            .map(|(part, item_type)| CumulativeEvent::item(&part, &format!("{} {}", item_type, part), item_type))
            .collect();
        let event = CumulativeEvent::new(event_type, items);
        self.registry.broadcast(session_id, &event).await;
        Arc::new(tokio::sync::Mutex::new(event))
    }

    /// Update one cumulative item and broadcast the refreshed snapshot.
    async fn track(
        &self,
        tracker: &Arc<tokio::sync::Mutex<CumulativeEvent>>,
        session_id: Uuid,
        item_id: &str,
        status: &str,
    ) {
        let snapshot = {
            let mut event = tracker.lock().await;
            event.update_item(item_id, status);
            event.clone()
        };
        self.registry.broadcast(session_id, &snapshot).await;
    }

    /// Bridge the composer's synchronous progress callback onto broadcasts.
    fn compose_progress(&self, session_id: Uuid) -> ProgressFn {
        let registry = self.registry.clone();
        Arc::new(move |fraction: f32, message: &str| {
            let registry = registry.clone();
            let details = message.to_string();
            tokio::spawn(async move {
                let event = ProgressEvent {
                    event_type: "stage_progress".to_string(),
                    status: "composing".to_string(),
                    progress: (fraction * 100.0).clamp(0.0, 100.0) as u8,
                    details,
                    cost: None,
                };
                registry.broadcast(session_id, &event).await;
            });
        })
    }
}

struct ClipJob {
    index: usize,
    part: String,
    image_ref: String,
    audio_ref: String,
    target_duration: f64,
}

fn script_segments(session: &Session) -> Result<Vec<ScriptSegment>, PipelineError> {
    let value = session.script.as_ref().ok_or_else(|| PipelineError::InvalidStage {
        current: session.stage.clone(),
        requested: "a generated script".to_string(),
    })?;
    serde_json::from_value(value.clone())
        .map_err(|e| PipelineError::Storage(format!("corrupt script for session {}: {}", session.id, e)))
}

/// Narration tracks only; an uploaded background-music asset shares the
/// audio kind but is tagged with a music role.
async fn narration_assets(pool: &PgPool, session_id: Uuid) -> Result<Vec<crate::models::Asset>, PipelineError> {
    let assets = AssetService::approved(pool, session_id, AssetKind::Audio).await?;
    Ok(assets
        .into_iter()
        .filter(|a| a.metadata.get("role").and_then(|r| r.as_str()) != Some("music"))
        .collect())
}

/// Decode the base64 payload every binary-producing provider returns in its
/// envelope result.
fn decode_payload(service: &str, result: &serde_json::Value) -> Result<Vec<u8>, PipelineError> {
    let encoded = result["data"].as_str().ok_or_else(|| PipelineError::ProviderLogic {
        service: service.to_string(),
        message: "result is missing binary payload".to_string(),
    })?;
    base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|e| PipelineError::ProviderLogic {
            service: service.to_string(),
            message: format!("payload is not valid base64: {}", e),
        })
}

async fn generate_image_asset(
    provider: Arc<dyn GenerationProvider>,
    store: Arc<dyn ObjectStore>,
    pool: &PgPool,
    session_id: Uuid,
    index: usize,
    segment: &ScriptSegment,
    config: &ImageVerifyConfig,
) -> Result<((), Decimal), PipelineError> {
    let output = provider
        .generate(json!({
            "prompt": segment.visual_prompt,
            "aspect_ratio": "16:9",
        }))
        .await?;
    let bytes = decode_payload(provider.service(), &output.result)?;

    let key = asset_key(session_id, "image", index, "png");
    let report = verify::image::verify_image(&key, &bytes, config);
    if !report.is_usable() {
        tracing::warn!(
            "Image for segment '{}' failed verification ({}), keeping unapproved",
            segment.part,
            report.overall_str()
        );
    }

    let reference = store.put(&bytes, &key, "image/png").await?;
    AssetService::insert(
        pool,
        NewAsset {
            session_id,
            kind: AssetKind::Image,
            reference,
            approved: report.is_usable(),
            position: index as i32,
            metadata: json!({ "part": segment.part }),
            verification: serde_json::to_value(&report).ok(),
        },
    )
    .await?;
    Ok(((), output.cost))
}

async fn generate_audio_asset(
    provider: Arc<dyn GenerationProvider>,
    store: Arc<dyn ObjectStore>,
    pool: &PgPool,
    session_id: Uuid,
    index: usize,
    segment: &ScriptSegment,
) -> Result<((), Decimal), PipelineError> {
    let output = provider
        .generate(json!({
            "text": segment.narration,
            "format": "mp3",
        }))
        .await?;
    let bytes = decode_payload(provider.service(), &output.result)?;

    let key = asset_key(session_id, "audio", index, "mp3");
    let reference = store.put(&bytes, &key, "audio/mpeg").await?;
    AssetService::insert(
        pool,
        NewAsset {
            session_id,
            kind: AssetKind::Audio,
            reference,
            approved: true,
            position: index as i32,
            metadata: json!({
                "part": segment.part,
                "target_duration": segment.target_duration,
            }),
            verification: None,
        },
    )
    .await?;
    Ok(((), output.cost))
}

async fn generate_clip_asset(
    provider: Arc<dyn GenerationProvider>,
    store: Arc<dyn ObjectStore>,
    pool: &PgPool,
    runner: Arc<dyn CommandRunner>,
    session_id: Uuid,
    job: &ClipJob,
    config: &ClipVerifyConfig,
) -> Result<((), Decimal), PipelineError> {
    // Providers fetch their inputs over expiring URLs.
    let image_url = store.presign(&job.image_ref, 3600).await?;
    let audio_url = store.presign(&job.audio_ref, 3600).await?;

    let output = provider
        .generate(json!({
            "image_url": image_url,
            "audio_url": audio_url,
            "duration": job.target_duration,
        }))
        .await?;
    let bytes = decode_payload(provider.service(), &output.result)?;

    let key = asset_key(session_id, "video", job.index, "mp4");

    // Stage the clip to disk for probing before it is accepted.
    let scratch = tempfile::TempDir::new()
        .map_err(|e| PipelineError::Storage(format!("scratch dir failed: {}", e)))?;
    let clip_path = scratch.path().join("clip.mp4");
    std::fs::write(&clip_path, &bytes)
        .map_err(|e| PipelineError::Storage(format!("stage clip failed: {}", e)))?;
    let report = verify::clip::verify_clip(&key, &clip_path, Some(job.target_duration), config, runner).await;

    let reference = store.put(&bytes, &key, "video/mp4").await?;
    AssetService::insert(
        pool,
        NewAsset {
            session_id,
            kind: AssetKind::Video,
            reference,
            approved: report.is_usable(),
            position: job.index as i32,
            metadata: json!({ "part": job.part }),
            verification: serde_json::to_value(&report).ok(),
        },
    )
    .await?;
    Ok(((), output.cost))
}
