// src/compose/mod.rs
//! Local composition pipeline: per-segment assets in, one final video out.
//!
//! Fetch -> normalize -> concatenate -> narration mux -> optional music ->
//! probe. Steps 1-4 are hard requirements; only the music mix degrades
//! gracefully. Every intermediate is deleted once consumed, and the scratch
//! directory itself is removed on every exit path.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::PipelineError;
use crate::storage::ObjectStore;

pub mod ffmpeg;

use ffmpeg::CommandRunner;

/// Segment visual: either a generated clip or a still image held for the
/// segment's target duration.
#[derive(Debug, Clone)]
pub enum VisualSource {
    Video(String),
    Image(String),
}

impl VisualSource {
    fn reference(&self) -> &str {
        match self {
            VisualSource::Video(reference) | VisualSource::Image(reference) => reference,
        }
    }

    fn default_extension(&self) -> &'static str {
        match self {
            VisualSource::Video(_) => "mp4",
            VisualSource::Image(_) => "png",
        }
    }
}

/// One timeline entry, in order.
#[derive(Debug, Clone)]
pub struct SegmentSpec {
    pub part: String,
    pub visual: VisualSource,
    pub audio_ref: String,
    pub target_duration: f64,
}

#[derive(Debug)]
pub struct CompositionOutput {
    pub data: Vec<u8>,
    pub duration: f64,
    pub with_music: bool,
}

pub type ProgressFn = Arc<dyn Fn(f32, &str) + Send + Sync>;

pub struct Composer {
    store: Arc<dyn ObjectStore>,
    runner: Arc<dyn CommandRunner>,
    scratch_root: PathBuf,
}

fn step_err(step: &str, message: impl ToString) -> PipelineError {
    PipelineError::CompositionStep {
        step: step.to_string(),
        message: message.to_string(),
    }
}

fn extension_of(reference: &str, fallback: &'static str) -> String {
    Path::new(reference)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_lowercase())
        .unwrap_or_else(|| fallback.to_string())
}

impl Composer {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        runner: Arc<dyn CommandRunner>,
        scratch_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            runner,
            scratch_root: scratch_root.into(),
        }
    }

    pub async fn compose(
        &self,
        segments: &[SegmentSpec],
        music_ref: Option<&str>,
        progress: Option<ProgressFn>,
    ) -> Result<CompositionOutput, PipelineError> {
        if segments.is_empty() {
            return Err(step_err("fetch", "no segments to compose"));
        }

        let report = |fraction: f32, message: &str| {
            if let Some(callback) = &progress {
                callback(fraction, message);
            }
        };

        std::fs::create_dir_all(&self.scratch_root)
            .map_err(|e| step_err("fetch", format!("scratch root unavailable: {}", e)))?;
        // Dropping the TempDir wipes whatever a failed step left behind.
        let scratch = tempfile::TempDir::new_in(&self.scratch_root)
            .map_err(|e| step_err("fetch", format!("scratch dir failed: {}", e)))?;

        // Step 1: fetch every segment's visual and narration audio.
        report(0.05, "Fetching segment assets");
        let mut visual_paths = Vec::with_capacity(segments.len());
        let mut audio_paths = Vec::with_capacity(segments.len());
        for (index, segment) in segments.iter().enumerate() {
            let visual_ext = extension_of(segment.visual.reference(), segment.visual.default_extension());
            let visual_path = scratch.path().join(format!("visual_{:03}.{}", index, visual_ext));
            self.fetch_to(segment.visual.reference(), &visual_path).await?;
            visual_paths.push(visual_path);

            let audio_ext = extension_of(&segment.audio_ref, "mp3");
            let audio_path = scratch.path().join(format!("narration_{:03}.{}", index, audio_ext));
            self.fetch_to(&segment.audio_ref, &audio_path).await?;
            audio_paths.push(audio_path);
        }

        // Step 2: normalize everything onto the canonical clip shape. The
        // source visual is deleted as soon as its clip exists.
        report(0.25, "Normalizing segments");
        let mut clip_paths = Vec::with_capacity(segments.len());
        for (index, segment) in segments.iter().enumerate() {
            let clip_path = scratch.path().join(format!("clip_{:03}.mp4", index));
            let args = match &segment.visual {
                VisualSource::Video(_) => ffmpeg::normalize_video_args(&visual_paths[index], &clip_path),
                VisualSource::Image(_) => {
                    ffmpeg::still_to_clip_args(&visual_paths[index], &clip_path, segment.target_duration)
                }
            };
            ffmpeg::run_tool(self.runner.clone(), "ffmpeg", args)
                .await
                .map_err(|e| step_err("normalize", format!("segment '{}': {}", segment.part, e)))?;

            let _ = std::fs::remove_file(&visual_paths[index]);
            clip_paths.push(clip_path);
        }

        // Step 3: concatenate in timeline order, lossless stream copy.
        report(0.5, "Concatenating timeline");
        let video_list = scratch.path().join("videos.txt");
        write_concat_list(&video_list, &clip_paths).map_err(|e| step_err("concatenate", e))?;
        let timeline_path = scratch.path().join("timeline.mp4");
        ffmpeg::run_tool(
            self.runner.clone(),
            "ffmpeg",
            ffmpeg::concat_video_args(&video_list, &timeline_path),
        )
        .await
        .map_err(|e| step_err("concatenate", e))?;
        for clip in &clip_paths {
            let _ = std::fs::remove_file(clip);
        }
        let _ = std::fs::remove_file(&video_list);

        // Step 4: one narration track, attached as the sole audio stream.
        report(0.7, "Muxing narration");
        let audio_list = scratch.path().join("narration.txt");
        write_concat_list(&audio_list, &audio_paths).map_err(|e| step_err("narration_mux", e))?;
        let narration_path = scratch.path().join("narration.m4a");
        ffmpeg::run_tool(
            self.runner.clone(),
            "ffmpeg",
            ffmpeg::concat_audio_args(&audio_list, &narration_path),
        )
        .await
        .map_err(|e| step_err("narration_mux", e))?;
        for audio in &audio_paths {
            let _ = std::fs::remove_file(audio);
        }
        let _ = std::fs::remove_file(&audio_list);

        let narrated_path = scratch.path().join("narrated.mp4");
        ffmpeg::run_tool(
            self.runner.clone(),
            "ffmpeg",
            ffmpeg::mux_narration_args(&timeline_path, &narration_path, &narrated_path),
        )
        .await
        .map_err(|e| step_err("narration_mux", e))?;
        let _ = std::fs::remove_file(&timeline_path);
        let _ = std::fs::remove_file(&narration_path);

        // Step 5: optional background music. The only step allowed to fail
        // without aborting: the narrated cut ships as-is instead.
        let (final_path, with_music) = match music_ref {
            Some(music_ref) => {
                report(0.85, "Mixing background music");
                match self.mix_music(scratch.path(), &narrated_path, music_ref).await {
                    Ok(mixed_path) => {
                        let _ = std::fs::remove_file(&narrated_path);
                        (mixed_path, true)
                    }
                    Err(e) => {
                        tracing::warn!("Background music mix failed, delivering without music: {}", e);
                        (narrated_path.clone(), false)
                    }
                }
            }
            None => (narrated_path.clone(), false),
        };

        // Step 6: probe the final container for reporting.
        let probe_output = ffmpeg::run_tool(
            self.runner.clone(),
            "ffprobe",
            ffmpeg::probe_args(&final_path),
        )
        .await
        .map_err(|e| step_err("probe", e))?;
        let duration = ffmpeg::duration_from_probe(&probe_output).map_err(|e| step_err("probe", e))?;

        let data = tokio::fs::read(&final_path)
            .await
            .map_err(|e| step_err("probe", format!("read final video failed: {}", e)))?;

        report(1.0, "Composition complete");
        tracing::info!(
            "🎬 Composed {} segments into {:.1}s video ({} bytes, music: {})",
            segments.len(),
            duration,
            data.len(),
            with_music
        );

        Ok(CompositionOutput {
            data,
            duration,
            with_music,
        })
    }

    async fn fetch_to(&self, reference: &str, path: &Path) -> Result<(), PipelineError> {
        let bytes = self
            .store
            .get(reference)
            .await
            .map_err(|e| step_err("fetch", format!("{}: {}", reference, e)))?;
        tokio::fs::write(path, bytes)
            .await
            .map_err(|e| step_err("fetch", format!("write {} failed: {}", path.display(), e)))
    }

    async fn mix_music(
        &self,
        scratch: &Path,
        narrated_path: &Path,
        music_ref: &str,
    ) -> Result<PathBuf, String> {
        let music_ext = extension_of(music_ref, "mp3");
        let music_path = scratch.join(format!("music.{}", music_ext));
        let bytes = self.store.get(music_ref).await.map_err(|e| e.to_string())?;
        tokio::fs::write(&music_path, bytes)
            .await
            .map_err(|e| e.to_string())?;

        let mixed_path = scratch.join("final.mp4");
        let result = ffmpeg::run_tool(
            self.runner.clone(),
            "ffmpeg",
            ffmpeg::music_mix_args(narrated_path, &music_path, &mixed_path),
        )
        .await;
        let _ = std::fs::remove_file(&music_path);

        result.map(|_| mixed_path)
    }
}

fn write_concat_list(list_path: &Path, entries: &[PathBuf]) -> Result<(), String> {
    let mut body = String::new();
    for entry in entries {
        body.push_str(&format!("file '{}'\n", entry.display()));
    }
    std::fs::write(list_path, body).map_err(|e| format!("write concat list failed: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// In-memory object store seeded with test assets.
    struct MemoryStore {
        objects: Mutex<HashMap<String, Vec<u8>>>,
    }

    impl MemoryStore {
        fn new() -> Self {
            Self {
                objects: Mutex::new(HashMap::new()),
            }
        }

        fn seed(&self, key: &str, bytes: &[u8]) {
            self.objects.lock().unwrap().insert(key.to_string(), bytes.to_vec());
        }
    }

    #[async_trait]
    impl ObjectStore for MemoryStore {
        async fn put(&self, bytes: &[u8], key: &str, _content_type: &str) -> Result<String, PipelineError> {
            self.seed(key, bytes);
            Ok(key.to_string())
        }

        async fn get(&self, reference: &str) -> Result<Vec<u8>, PipelineError> {
            self.objects
                .lock()
                .unwrap()
                .get(reference)
                .cloned()
                .ok_or_else(|| PipelineError::Storage(format!("missing: {}", reference)))
        }

        async fn presign(&self, reference: &str, _ttl_secs: u64) -> Result<String, PipelineError> {
            Ok(format!("/media/{}", reference))
        }
    }

    /// Runner that fabricates step outputs instead of invoking ffmpeg. The
    /// bytes written identify which step produced the file, so tests can
    /// assert exactly what the pipeline delivered.
    struct FakeRunner {
        invocations: Mutex<Vec<(String, Vec<String>)>>,
        fail_on: Option<&'static str>,
        probe_duration: f64,
    }

    impl FakeRunner {
        fn new(probe_duration: f64) -> Self {
            Self {
                invocations: Mutex::new(Vec::new()),
                fail_on: None,
                probe_duration,
            }
        }

        fn failing_on(mut self, needle: &'static str) -> Self {
            self.fail_on = Some(needle);
            self
        }

        fn invocations(&self) -> Vec<(String, Vec<String>)> {
            self.invocations.lock().unwrap().clone()
        }
    }

    impl CommandRunner for FakeRunner {
        fn run(&self, program: &str, args: &[String]) -> Result<String, String> {
            self.invocations
                .lock()
                .unwrap()
                .push((program.to_string(), args.to_vec()));

            if let Some(needle) = self.fail_on {
                if args.iter().any(|a| a.contains(needle)) {
                    return Err(format!("simulated failure on {}", needle));
                }
            }

            if program == "ffprobe" {
                return Ok(format!(
                    r#"{{"format":{{"duration":"{}"}}}}"#,
                    self.probe_duration
                ));
            }

            let marker: &[u8] = if args.iter().any(|a| a.contains("[mixed]")) {
                b"FINAL_WITH_MUSIC"
            } else if args.iter().any(|a| a == "1:a:0") {
                b"NARRATED"
            } else {
                b"INTERMEDIATE"
            };
            let output = args.last().expect("ffmpeg invocations end with the output path");
            std::fs::write(output, marker).map_err(|e| e.to_string())?;
            Ok(String::new())
        }
    }

    fn still_segments(count: usize) -> Vec<SegmentSpec> {
        let parts = ["hook", "concept", "process", "conclusion"];
        (0..count)
            .map(|i| SegmentSpec {
                part: parts[i % parts.len()].to_string(),
                visual: VisualSource::Image(format!("s/image/{:03}.png", i)),
                audio_ref: format!("s/audio/{:03}.mp3", i),
                target_duration: 10.0,
            })
            .collect()
    }

    fn seeded_store(segments: &[SegmentSpec]) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        for segment in segments {
            store.seed(segment.visual.reference(), b"imagebytes");
            store.seed(&segment.audio_ref, b"audiobytes");
        }
        store
    }

    fn scratch_root() -> tempfile::TempDir {
        tempfile::TempDir::new().unwrap()
    }

    fn assert_no_residue(root: &Path) {
        let leftover: Vec<_> = std::fs::read_dir(root).unwrap().collect();
        assert!(leftover.is_empty(), "scratch residue: {:?}", leftover);
    }

    #[tokio::test]
    async fn test_four_still_segments_compose_to_forty_seconds() {
        let segments = still_segments(4);
        let store = seeded_store(&segments);
        let runner = Arc::new(FakeRunner::new(40.2));
        let root = scratch_root();
        let composer = Composer::new(store, runner.clone(), root.path());

        let output = composer.compose(&segments, None, None).await.unwrap();

        assert!((output.duration - 40.0).abs() <= 1.0);
        assert!(!output.with_music);
        assert_eq!(output.data, b"NARRATED");

        let invocations = runner.invocations();
        let stills = invocations
            .iter()
            .filter(|(_, args)| args.iter().any(|a| a == "-loop"))
            .count();
        assert_eq!(stills, 4);
        assert!(!invocations.iter().any(|(_, args)| args.iter().any(|a| a.contains("amix"))));

        assert_no_residue(root.path());
    }

    #[tokio::test]
    async fn test_video_visuals_are_normalized_with_audio_stripped() {
        let mut segments = still_segments(2);
        segments[0].visual = VisualSource::Video("s/video/000.mp4".to_string());
        let store = seeded_store(&segments);
        let runner = Arc::new(FakeRunner::new(20.0));
        let root = scratch_root();
        let composer = Composer::new(store, runner.clone(), root.path());

        composer.compose(&segments, None, None).await.unwrap();

        let normalizes: Vec<_> = runner
            .invocations()
            .into_iter()
            .filter(|(_, args)| args.iter().any(|a| a == "-an"))
            .collect();
        assert_eq!(normalizes.len(), 1);
    }

    #[tokio::test]
    async fn test_music_failure_degrades_to_narrated_video() {
        let segments = still_segments(4);
        let store = seeded_store(&segments);
        store.seed("s/music/theme.mp3", b"musicbytes");
        let runner = Arc::new(FakeRunner::new(40.0).failing_on("amix"));
        let root = scratch_root();
        let composer = Composer::new(store, runner, root.path());

        let output = composer
            .compose(&segments, Some("s/music/theme.mp3"), None)
            .await
            .unwrap();

        // Graceful degrade: the narrated cut ships unchanged.
        assert!(!output.with_music);
        assert_eq!(output.data, b"NARRATED");
        assert_no_residue(root.path());
    }

    #[tokio::test]
    async fn test_music_success_ships_the_mixed_cut() {
        let segments = still_segments(4);
        let store = seeded_store(&segments);
        store.seed("s/music/theme.mp3", b"musicbytes");
        let runner = Arc::new(FakeRunner::new(40.0));
        let root = scratch_root();
        let composer = Composer::new(store, runner, root.path());

        let output = composer
            .compose(&segments, Some("s/music/theme.mp3"), None)
            .await
            .unwrap();

        assert!(output.with_music);
        assert_eq!(output.data, b"FINAL_WITH_MUSIC");
        assert_no_residue(root.path());
    }

    #[tokio::test]
    async fn test_concat_failure_aborts_and_leaves_no_residue() {
        let segments = still_segments(3);
        let store = seeded_store(&segments);
        let runner = Arc::new(FakeRunner::new(30.0).failing_on("videos.txt"));
        let root = scratch_root();
        let composer = Composer::new(store, runner, root.path());

        let err = composer.compose(&segments, None, None).await.unwrap_err();

        match err {
            PipelineError::CompositionStep { step, .. } => assert_eq!(step, "concatenate"),
            other => panic!("unexpected error: {:?}", other),
        }
        assert_no_residue(root.path());
    }

    #[tokio::test]
    async fn test_missing_asset_fails_fetch_step() {
        let segments = still_segments(2);
        let store = Arc::new(MemoryStore::new());
        store.seed(segments[0].visual.reference(), b"imagebytes");
        // First narration track missing.
        let runner = Arc::new(FakeRunner::new(20.0));
        let root = scratch_root();
        let composer = Composer::new(store, runner, root.path());

        let err = composer.compose(&segments, None, None).await.unwrap_err();

        match err {
            PipelineError::CompositionStep { step, .. } => assert_eq!(step, "fetch"),
            other => panic!("unexpected error: {:?}", other),
        }
        assert_no_residue(root.path());
    }

    #[tokio::test]
    async fn test_empty_segment_list_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let runner = Arc::new(FakeRunner::new(0.0));
        let root = scratch_root();
        let composer = Composer::new(store, runner, root.path());

        assert!(composer.compose(&[], None, None).await.is_err());
    }

    #[tokio::test]
    async fn test_progress_callback_reports_each_step() {
        let segments = still_segments(2);
        let store = seeded_store(&segments);
        let runner = Arc::new(FakeRunner::new(20.0));
        let root = scratch_root();
        let composer = Composer::new(store, runner, root.path());

        let messages: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = messages.clone();
        let progress: ProgressFn = Arc::new(move |_, message| {
            sink.lock().unwrap().push(message.to_string());
        });

        composer.compose(&segments, None, Some(progress)).await.unwrap();

        let messages = messages.lock().unwrap();
        assert!(messages.iter().any(|m| m.contains("Fetching")));
        assert!(messages.iter().any(|m| m.contains("Concatenating")));
        assert!(messages.iter().any(|m| m.contains("complete")));
    }
}
