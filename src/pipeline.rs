//! End-to-end generation for one request.
//!
//! [`GenerationPipeline::synthesize`] runs the whole job inside the
//! inference slot:
//! 1. Resolve the task and validate the request
//! 2. Apply the requested adapter
//! 3. Encode the prompts (conditioned, unconditioned, text-only)
//! 4. Encode the reference audio to latents
//! 5. Plan frames, draw seeded noise, build the splicer
//! 6. Run the denoising loop (or flow-edit)
//! 7. Re-attach trimmed frames and decode to audio
//! 8. Optionally write WAV files

use std::path::{Path, PathBuf};
use std::time::Instant;

use candle_core::Tensor;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::adapter::{AdapterCache, AdapterState};
use crate::audio::GeneratedAudio;
use crate::config::{EngineConfig, LatentConfig};
use crate::engine::{InferenceEngine, Prompt};
use crate::guidance::{GuidanceSchedule, Guider};
use crate::noise::{NoiseGenerator, batch_seeds, resolve_seed};
use crate::progress::{ProgressSink, ProgressSnapshot, ProgressWindow, stage};
use crate::request::{AudioHandle, GenerationRequest, GuidanceKind, SchedulerKind, lyrics_or_none};
use crate::sampler::edit::{EditRun, edit};
use crate::sampler::{CancelFlag, Conditions, SampleRun, sample};
use crate::scheduler::{self, SchedulerConfig};
use crate::splice::{self, SpliceMode, Splicer, noised, prepare_source, reattach, retake_blend};
use crate::task::{ResolvedTask, TaskKind, resolve_request};
use crate::{Error, Result};

/// Fractions of overall progress at which fixed stages are reported.
const TEXT_PROGRESS: f64 = 0.01;
const REFERENCE_PROGRESS: f64 = 0.03;
const SAMPLING_START: f64 = 0.05;

/// Wall-clock time spent in each stage, in milliseconds.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StageTimings {
    pub adapter_ms: u64,
    pub encode_ms: u64,
    pub sample_ms: u64,
    pub decode_ms: u64,
    pub total_ms: u64,
}

/// How a result was produced.
#[derive(Debug, Clone, Serialize)]
pub struct Provenance {
    pub requested_task: String,
    pub task: TaskKind,
    pub audio_to_audio: bool,
    pub mode: SpliceMode,
    pub caption: String,
    pub seeds: Vec<u64>,
    pub retake_seeds: Vec<u64>,
    pub steps: usize,
    pub start_step: usize,
    pub scheduler: SchedulerKind,
    pub guidance: GuidanceKind,
    pub guidance_scale: f64,
    /// Guided steps `[start, end)`.
    pub guidance_steps: (usize, usize),
    pub adapter: AdapterState,
    pub frames: usize,
    pub duration_s: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    pub timings: StageTimings,
    pub created_at: DateTime<Utc>,
}

/// Result of one generation.
#[derive(Debug)]
pub struct GenerationOutput {
    /// Final latents `[batch, channels, bands, frames]`.
    pub latents: Tensor,
    /// One waveform per batch element; empty when decoding is disabled.
    pub audio: Vec<GeneratedAudio>,
    /// WAV files written, one per batch element.
    pub written: Vec<PathBuf>,
    pub provenance: Provenance,
}

/// Validate a request and resolve its task.
///
/// This is everything that can be checked without the inference engine; the
/// job queue runs it before accepting a request.
pub fn validate(request: &GenerationRequest, latent: &LatentConfig) -> Result<ResolvedTask> {
    request.validate_fields()?;
    let resolved = resolve_request(request);

    match resolved.task {
        TaskKind::Edit => {
            if resolved.reference.is_none() {
                return Err(Error::validation("edit needs source audio"));
            }
            if request.edit_target_caption.trim().is_empty() {
                return Err(Error::validation("edit needs a target caption"));
            }
        }
        TaskKind::Repaint | TaskKind::Extend => {
            if request.repaint_end_s <= request.repaint_start_s {
                return Err(Error::validation(format!(
                    "repaint window [{}, {}) must end after it starts",
                    request.repaint_start_s, request.repaint_end_s
                )));
            }
        }
        TaskKind::TextToMusic => {
            if request.duration_s > latent.max_duration_s {
                return Err(Error::validation(format!(
                    "duration_s {} exceeds the {} s maximum",
                    request.duration_s, latent.max_duration_s
                )));
            }
            if latent.frames_for(request.duration_s) == 0 {
                return Err(Error::validation(format!(
                    "duration_s {} is shorter than one latent frame",
                    request.duration_s
                )));
            }
        }
        TaskKind::Retake => {}
    }

    if let Some(AudioHandle::Path(path)) = resolved.reference_handle(request)
        && !path.is_file()
    {
        return Err(Error::validation(format!(
            "audio file {} does not exist",
            path.display()
        )));
    }
    Ok(resolved)
}

/// Runs requests against an inference engine. Owns the adapter cache, so one
/// pipeline serves one engine.
pub struct GenerationPipeline {
    config: EngineConfig,
    adapters: AdapterCache,
}

impl GenerationPipeline {
    pub fn new(config: EngineConfig) -> Self {
        let adapters = AdapterCache::new(config.adapter.clone());
        Self { config, adapters }
    }

    pub fn with_adapters(config: EngineConfig, adapters: AdapterCache) -> Self {
        Self { config, adapters }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn adapters(&self) -> &AdapterCache {
        &self.adapters
    }

    /// Generate audio for `request`.
    pub fn synthesize(
        &mut self,
        engine: &mut dyn InferenceEngine,
        request: &GenerationRequest,
        progress: &dyn ProgressSink,
        cancel: &CancelFlag,
    ) -> Result<GenerationOutput> {
        let total_start = Instant::now();
        let mut timings = StageTimings::default();
        let latent_config = self.config.latent.clone();
        let resolved = validate(request, &latent_config)?;
        cancel.check()?;

        // Adapter swap happens inside the slot, before any sampling.
        let start = Instant::now();
        progress.on_step(&ProgressSnapshot::new(0.0, stage::APPLYING_ADAPTER));
        self.adapters
            .apply(engine, request.adapter.as_deref(), request.adapter_weight)?;
        timings.adapter_ms = elapsed_ms(start);

        let start = Instant::now();
        progress.on_step(&ProgressSnapshot::new(TEXT_PROGRESS, stage::ENCODING_TEXT));
        let conditions = encode_conditions(
            engine,
            &request.caption,
            request.lyrics_condition(),
            request.double_condition(),
        )?;

        let reference = resolved.reference_handle(request);
        let source = match reference {
            Some(handle) => {
                progress.on_step(&ProgressSnapshot::new(
                    REFERENCE_PROGRESS,
                    stage::ENCODING_REFERENCE,
                ));
                Some(self.source_latents(engine, handle)?)
            }
            None => None,
        };
        timings.encode_ms = elapsed_ms(start);
        cancel.check()?;

        let source_frames = source.as_ref().map(|s| s.dim(3)).transpose()?;
        let plan = splice::plan(
            resolved.task,
            source_frames,
            latent_config.frames_for(request.duration_s),
            (request.repaint_start_s, request.repaint_end_s),
            &latent_config,
        )?;

        let seed = resolve_seed(request.seed);
        let retake_seed = resolve_seed(request.retake_seed);
        let seeds = batch_seeds(seed, request.batch_size);
        let retake_seeds = batch_seeds(retake_seed, request.batch_size);

        let scheduler_config = SchedulerConfig {
            omega_scale: request.omega_scale,
            ..self.config.scheduler.clone()
        };
        let mut scheduler =
            scheduler::build(request.scheduler, scheduler_config, request.steps, seed);
        let sigmas = scheduler.sigmas().to_vec();
        let start_step = plan.start_step(&sigmas, request.retake_variance, request.audio_to_audio_strength);
        let schedule = GuidanceSchedule::new(
            request.steps,
            request.guidance_scale,
            request.guidance_interval,
            request.guidance_interval_decay,
            request.min_guidance_scale,
        );

        tracing::info!(
            task = %resolved.task,
            mode = ?plan.mode,
            frames = plan.frames,
            steps = request.steps,
            start_step,
            seed,
            scheduler = ?request.scheduler,
            guidance = ?request.guidance,
            "synthesizing"
        );

        let device = engine.device().clone();
        let dtype = engine.dtype();
        let dims = [latent_config.channels, latent_config.bands, plan.frames];
        let mut noise = NoiseGenerator::new(&seeds);
        let n1 = noise.randn(&dims, &device, dtype)?;

        let prepared = source
            .as_ref()
            .map(|s| prepare_source(&s.to_dtype(dtype)?, &plan, request.batch_size))
            .transpose()?;

        let decode_share = self.config.progress.decode_share;
        let window = ProgressWindow::new(progress, SAMPLING_START, 1.0 - decode_share);
        let start = Instant::now();
        let sampled = match (plan.mode, prepared.as_ref()) {
            (SpliceMode::Edit, Some(prepared)) => {
                let target_lyrics = if request.edit_target_lyrics.trim().is_empty() {
                    request.lyrics_condition()
                } else {
                    lyrics_or_none(&request.edit_target_lyrics)
                };
                let target = encode_conditions(
                    engine,
                    &request.edit_target_caption,
                    target_lyrics,
                    request.double_condition(),
                )?;
                let mut source_guider = self.guider(request);
                let mut target_guider = self.guider(request);
                edit(
                    engine,
                    &conditions,
                    &target,
                    &prepared.latents,
                    EditRun {
                        sigmas: &sigmas,
                        schedule,
                        source_guider: &mut source_guider,
                        target_guider: &mut target_guider,
                        n_min: request.edit_n_min,
                        n_max: request.edit_n_max,
                        n_avg: request.edit_n_avg,
                        window: plan.window,
                        noise: &mut noise,
                        progress: &window,
                        cancel,
                    },
                )?
            }
            (SpliceMode::Generate, _) => {
                let mut guider = self.guider(request);
                sample(
                    engine,
                    &conditions,
                    n1,
                    SampleRun {
                        scheduler: scheduler.as_mut(),
                        guider: &mut guider,
                        schedule,
                        start_step,
                        splicer: None,
                        progress: &window,
                        cancel,
                    },
                )?
            }
            (mode, Some(prepared)) => {
                let n2 = NoiseGenerator::new(&retake_seeds).randn(&dims, &device, dtype)?;
                let blend = retake_blend(&n1, &n2, request.retake_variance)?;
                let sigma = sigmas[start_step];
                let splicer = match plan.window {
                    Some(frames) if mode != SpliceMode::Retake => {
                        Some(Splicer::new(prepared.latents.clone(), &n1, &blend, frames)?)
                    }
                    _ => None,
                };
                let init = match &splicer {
                    Some(splicer) => splicer.source_at(sigma)?,
                    None => noised(&prepared.latents, &blend, sigma)?,
                };
                let mut guider = self.guider(request);
                sample(
                    engine,
                    &conditions,
                    init,
                    SampleRun {
                        scheduler: scheduler.as_mut(),
                        guider: &mut guider,
                        schedule,
                        start_step,
                        splicer: splicer.as_ref(),
                        progress: &window,
                        cancel,
                    },
                )?
            }
            (mode, None) => {
                return Err(Error::Inference(format!("{mode:?} planned without source latents")));
            }
        };
        timings.sample_ms = elapsed_ms(start);

        let latents = match &prepared {
            Some(prepared) => reattach(&sampled, prepared.head.as_ref(), prepared.tail.as_ref())?,
            None => sampled,
        };

        let start = Instant::now();
        let audio = if self.config.decode {
            decode_batch(engine, &latents, progress, decode_share)?
        } else {
            Vec::new()
        };
        let written = match (&request.output_path, audio.is_empty()) {
            (Some(path), false) => write_outputs(path, &audio)?,
            (Some(path), true) => {
                tracing::warn!(path = %path.display(), "decoding disabled, nothing written");
                Vec::new()
            }
            (None, _) => Vec::new(),
        };
        timings.decode_ms = elapsed_ms(start);
        timings.total_ms = elapsed_ms(total_start);

        progress.on_step(&ProgressSnapshot::new(1.0, stage::COMPLETE));
        let frames = latents.dim(3)?;
        tracing::info!(
            task = %resolved.task,
            frames,
            total_ms = timings.total_ms,
            sample_ms = timings.sample_ms,
            "synthesis complete"
        );

        let provenance = Provenance {
            requested_task: request.task.clone(),
            task: resolved.task,
            audio_to_audio: resolved.audio_to_audio,
            mode: plan.mode,
            caption: request.caption.clone(),
            seeds,
            retake_seeds,
            steps: request.steps,
            start_step,
            scheduler: request.scheduler,
            guidance: request.guidance,
            guidance_scale: request.guidance_scale,
            guidance_steps: (schedule.start, schedule.end),
            adapter: self.adapters.state().clone(),
            frames,
            duration_s: latent_config.duration_of(frames),
            reference: reference.map(AudioHandle::describe),
            timings,
            created_at: Utc::now(),
        };
        Ok(GenerationOutput {
            latents,
            audio,
            written,
            provenance,
        })
    }

    fn guider(&self, request: &GenerationRequest) -> Guider {
        Guider::new(
            request.guidance,
            self.config.guidance.clone(),
            request.cfg_star_zero_steps,
            request.use_zero_init,
            request
                .double_condition()
                .then_some((request.guidance_scale_text, request.guidance_scale_lyric)),
        )
    }

    /// Reference audio as latents, checked against the configured geometry.
    fn source_latents(
        &self,
        engine: &mut dyn InferenceEngine,
        handle: &AudioHandle,
    ) -> Result<Tensor> {
        let latents = match handle {
            AudioHandle::Path(path) => engine.encode_audio(&GeneratedAudio::load(path)?)?,
            AudioHandle::Waveform(audio) => engine.encode_audio(audio)?,
            AudioHandle::Latents(latents) => latents.clone(),
        };
        let latent = &self.config.latent;
        match latents.dims() {
            &[_, c, h, f] if c == latent.channels && h == latent.bands && f > 0 => Ok(latents),
            dims => Err(Error::Inference(format!(
                "reference latents {dims:?} do not match [batch, {}, {}, frames]",
                latent.channels, latent.bands
            ))),
        }
    }
}

fn encode_conditions(
    engine: &mut dyn InferenceEngine,
    caption: &str,
    lyrics: Option<&str>,
    double_condition: bool,
) -> Result<Conditions> {
    let cond = engine.encode_text(&Prompt::new(caption, lyrics))?;
    let uncond = engine.encode_text(&Prompt::unconditional())?;
    let text_only = if double_condition {
        Some(engine.encode_text(&Prompt::text_only(caption))?)
    } else {
        None
    };
    Ok(Conditions {
        cond,
        uncond,
        text_only,
    })
}

fn decode_batch(
    engine: &mut dyn InferenceEngine,
    latents: &Tensor,
    progress: &dyn ProgressSink,
    decode_share: f64,
) -> Result<Vec<GeneratedAudio>> {
    let batch = latents.dim(0)?;
    let base = 1.0 - decode_share;
    let mut audio = Vec::with_capacity(batch);
    for b in 0..batch {
        progress.on_step(
            &ProgressSnapshot::new(base + decode_share * b as f64 / batch as f64, stage::DECODING)
                .with_steps(b, batch),
        );
        audio.push(engine.decode(&latents.narrow(0, b, 1)?)?);
    }
    Ok(audio)
}

/// `path` for a single result, `stem_<i>.ext` per element otherwise.
fn output_paths(path: &Path, count: usize) -> Vec<PathBuf> {
    if count == 1 {
        return vec![path.to_path_buf()];
    }
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().into_owned())
        .unwrap_or_else(|| "wav".to_string());
    (0..count)
        .map(|i| path.with_file_name(format!("{stem}_{i}.{ext}")))
        .collect()
}

fn write_outputs(path: &Path, audio: &[GeneratedAudio]) -> Result<Vec<PathBuf>> {
    let paths = output_paths(path, audio.len());
    for (clip, path) in audio.iter().zip(&paths) {
        clip.save(path)?;
        tracing::info!(path = %path.display(), duration_s = clip.duration_s(), "wrote audio");
    }
    Ok(paths)
}

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NoopProgress;
    use crate::testing::{MockEngine, ramp_latents, small_config};
    use std::sync::Mutex;

    fn run(request: &GenerationRequest) -> (Result<GenerationOutput>, Vec<ProgressSnapshot>) {
        let mut engine = MockEngine::new();
        let mut pipeline = GenerationPipeline::new(small_config());
        let seen = Mutex::new(Vec::new());
        let sink = |s: &ProgressSnapshot| seen.lock().unwrap().push(s.clone());
        let result = pipeline.synthesize(&mut engine, request, &sink, &CancelFlag::new());
        (result, seen.into_inner().unwrap())
    }

    #[test]
    fn text_to_music_end_to_end() {
        let request = GenerationRequest {
            seed: 42,
            ..GenerationRequest::text_to_music("ambient piano", 30.0, 10)
        };
        let (result, seen) = run(&request);
        let output = result.unwrap();
        assert_eq!(output.latents.dims(), &[1, 2, 2, 30]);
        assert_eq!(output.audio.len(), 1);
        assert_eq!(output.audio[0].frames(), 30);

        let p = &output.provenance;
        assert_eq!(p.task, TaskKind::TextToMusic);
        assert!(!p.audio_to_audio);
        assert_eq!(p.seeds, vec![42]);
        assert_eq!(p.steps, 10);
        assert_eq!(p.frames, 30);
        assert!(p.adapter.is_none());

        assert!(seen.windows(2).all(|w| w[0].fraction <= w[1].fraction));
        assert_eq!(seen.last().unwrap().fraction, 1.0);
        assert_eq!(seen.last().unwrap().stage, stage::COMPLETE);
        let sampling = seen.iter().filter(|s| s.stage == stage::SAMPLING).count();
        assert_eq!(sampling, 10);
    }

    #[test]
    fn same_seed_same_latents() {
        let request = GenerationRequest {
            seed: 7,
            batch_size: 2,
            ..GenerationRequest::text_to_music("lofi", 6.0, 4)
        };
        let a: Vec<f32> = run(&request).0.unwrap().latents.flatten_all().unwrap().to_vec1().unwrap();
        let b: Vec<f32> = run(&request).0.unwrap().latents.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn cover_with_reference_is_a_retake() {
        let request = GenerationRequest {
            task: "cover".into(),
            reference_audio: Some(AudioHandle::Latents(ramp_latents(2, 2, 20))),
            ..GenerationRequest::text_to_music("punk cover", 20.0, 8)
        };
        let resolved = validate(&request, &small_config().latent).unwrap();
        assert_eq!(resolved.task, TaskKind::Retake);
        assert!(resolved.audio_to_audio);

        let output = run(&request).0.unwrap();
        assert_eq!(output.provenance.mode, SpliceMode::Retake);
        assert_eq!(output.latents.dims(), &[1, 2, 2, 20]);
        // Default strength 0.5 anchors sampling part-way into the schedule.
        assert!(output.provenance.start_step > 0);
        assert!(output.provenance.reference.is_some());
    }

    #[test]
    fn repaint_preserves_frames_outside_window() {
        let source = ramp_latents(2, 2, 12);
        let request = GenerationRequest {
            task: "repaint".into(),
            reference_audio: Some(AudioHandle::Latents(source.clone())),
            repaint_start_s: 3.0,
            repaint_end_s: 7.0,
            retake_variance: 1.0,
            ..GenerationRequest::text_to_music("x", 12.0, 6)
        };
        let output = run(&request).0.unwrap();
        assert_eq!(output.provenance.mode, SpliceMode::Repaint);
        for t in (0..3).chain(7..12) {
            let got: Vec<f32> = output.latents.narrow(3, t, 1).unwrap().flatten_all().unwrap().to_vec1().unwrap();
            let want: Vec<f32> = source.narrow(3, t, 1).unwrap().flatten_all().unwrap().to_vec1().unwrap();
            assert_eq!(got, want, "frame {t}");
        }
    }

    #[test]
    fn extend_reattaches_trimmed_frames() {
        let source = ramp_latents(2, 2, 235);
        let request = GenerationRequest {
            task: "extend".into(),
            reference_audio: Some(AudioHandle::Latents(source.clone())),
            repaint_start_s: 230.0,
            repaint_end_s: 250.0,
            ..GenerationRequest::text_to_music("x", 10.0, 3)
        };
        let output = run(&request).0.unwrap();
        assert_eq!(output.provenance.mode, SpliceMode::Extend);
        assert_eq!(output.provenance.start_step, 0);
        assert_eq!(output.latents.dims(), &[1, 2, 2, 250]);
        // The first 10 frames never went through the sampler and the rest of
        // the preserved region was copied back at sigma 0.
        let got: Vec<f32> = output.latents.narrow(3, 0, 230).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        let want: Vec<f32> = source.narrow(3, 0, 230).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(got, want);
    }

    #[test]
    fn missing_reference_demotes_to_text_to_music() {
        let request = GenerationRequest {
            task: "repaint".into(),
            repaint_start_s: 1.0,
            repaint_end_s: 2.0,
            ..GenerationRequest::text_to_music("x", 5.0, 3)
        };
        let output = run(&request).0.unwrap();
        assert_eq!(output.provenance.task, TaskKind::TextToMusic);
        assert_eq!(output.provenance.mode, SpliceMode::Generate);
    }

    #[test]
    fn validation_failures() {
        let latent = small_config().latent;
        let empty_window = GenerationRequest {
            task: "repaint".into(),
            reference_audio: Some(AudioHandle::Latents(ramp_latents(2, 2, 10))),
            repaint_start_s: 5.0,
            repaint_end_s: 5.0,
            ..GenerationRequest::text_to_music("x", 10.0, 3)
        };
        let edit_without_source = GenerationRequest {
            task: "edit".into(),
            edit_target_caption: "metal".into(),
            ..GenerationRequest::text_to_music("x", 10.0, 3)
        };
        let edit_without_target = GenerationRequest {
            task: "edit".into(),
            source_audio: Some(AudioHandle::Latents(ramp_latents(2, 2, 10))),
            ..GenerationRequest::text_to_music("x", 10.0, 3)
        };
        let missing_file = GenerationRequest {
            task: "retake".into(),
            reference_audio: Some(AudioHandle::Path("/no/such/file.wav".into())),
            ..GenerationRequest::text_to_music("x", 10.0, 3)
        };
        let too_long = GenerationRequest::text_to_music("x", 300.0, 3);
        for request in [empty_window, edit_without_source, edit_without_target, missing_file, too_long] {
            assert!(
                matches!(validate(&request, &latent), Err(Error::Validation(_))),
                "{request:?}"
            );
        }
    }

    #[test]
    fn edit_runs_flow_edit() {
        let request = GenerationRequest {
            task: "edit".into(),
            source_audio: Some(AudioHandle::Latents(ramp_latents(2, 2, 8))),
            edit_target_caption: "metal".into(),
            edit_n_max: 0.5,
            ..GenerationRequest::text_to_music("jazz", 8.0, 4)
        };
        let output = run(&request).0.unwrap();
        assert_eq!(output.provenance.task, TaskKind::Edit);
        assert_eq!(output.provenance.mode, SpliceMode::Edit);
        assert_eq!(output.latents.dims(), &[1, 2, 2, 8]);
    }

    #[test]
    fn adapter_is_applied_and_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let weights = dir.path().join("style.safetensors");
        std::fs::write(&weights, b"lora").unwrap();
        let request = GenerationRequest {
            adapter: Some(dir.path().to_string_lossy().into_owned()),
            adapter_weight: 0.6,
            ..GenerationRequest::text_to_music("x", 4.0, 2)
        };
        let mut engine = MockEngine::new();
        let stats = engine.stats();
        let mut pipeline = GenerationPipeline::new(small_config());
        let output = pipeline
            .synthesize(&mut engine, &request, &NoopProgress, &CancelFlag::new())
            .unwrap();
        assert_eq!(output.provenance.adapter.weight, 0.6);
        assert_eq!(stats.attached_path(), Some(weights));
        pipeline
            .synthesize(&mut engine, &request, &NoopProgress, &CancelFlag::new())
            .unwrap();
        assert_eq!(pipeline.adapters().swap_count(), 1);
    }

    #[test]
    fn writes_wav_per_batch_element() {
        let dir = tempfile::tempdir().unwrap();
        let request = GenerationRequest {
            batch_size: 2,
            output_path: Some(dir.path().join("take.wav")),
            ..GenerationRequest::text_to_music("x", 4.0, 2)
        };
        let output = run(&request).0.unwrap();
        assert_eq!(
            output.written,
            vec![dir.path().join("take_0.wav"), dir.path().join("take_1.wav")]
        );
        assert!(output.written.iter().all(|p| p.is_file()));
    }

    #[test]
    fn double_condition_encodes_text_only_prompt() {
        let request = GenerationRequest {
            lyrics: "[verse] hello".into(),
            guidance_scale_text: 5.0,
            guidance_scale_lyric: 2.0,
            guidance_interval: 1.0,
            ..GenerationRequest::text_to_music("x", 4.0, 2)
        };
        let mut engine = MockEngine::new();
        let stats = engine.stats();
        GenerationPipeline::new(small_config())
            .synthesize(&mut engine, &request, &NoopProgress, &CancelFlag::new())
            .unwrap();
        let prompts = stats.prompts.lock().unwrap().clone();
        assert_eq!(prompts.len(), 3);
        assert!(prompts.contains(&Prompt::text_only("x")));
        // Three predictions per guided step.
        assert_eq!(stats.predicts(), 2 * 3);
    }

    #[test]
    fn provenance_serializes() {
        let output = run(&GenerationRequest::text_to_music("x", 3.0, 2)).0.unwrap();
        let json = serde_json::to_value(&output.provenance).unwrap();
        assert_eq!(json["task"], "text_to_music");
        assert_eq!(json["scheduler"], "euler");
        assert_eq!(json["guidance"], "apg");
        assert!(json["created_at"].is_string());
    }
}
