//! Dry-run planner for generation requests.
//!
//! Resolves the task, frame layout, guidance window and sigma schedule of a
//! request without loading a model, and prints them as one JSON document.
//!
//! ```sh
//! echo '{"task":"repaint","reference_audio":"take.wav","repaint_start_s":10,"repaint_end_s":20}' \
//!   | ace-step-plan --steps 27
//! ```
//!
//! Exit code 0 when the request is valid, non-zero otherwise.

use std::io::Read;
use std::path::PathBuf;

use ace_step_engine::{
    audio::GeneratedAudio,
    config::EngineConfig,
    guidance::GuidanceSchedule,
    noise::resolve_seed,
    pipeline,
    request::{AudioHandle, GenerationRequest},
    scheduler, splice,
};
use anyhow::Context;
use clap::Parser;
use serde_json::json;

#[derive(Parser, Debug)]
#[command(
    name = "ace-step-plan",
    about = "Print the generation plan for a request without running a model"
)]
struct Args {
    /// Request JSON file. Reads stdin when omitted or `-`.
    request: Option<PathBuf>,

    /// Engine configuration JSON. Defaults apply when omitted.
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Override the request's step count.
    #[arg(long)]
    steps: Option<usize>,

    /// Frame count of the reference latents. Read from the WAV header when omitted.
    #[arg(long)]
    source_frames: Option<usize>,

    /// Pretty-print the output.
    #[arg(long, default_value_t = false)]
    pretty: bool,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => EngineConfig::from_json_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => EngineConfig::default(),
    };

    let text = match args.request.as_deref() {
        Some(path) if path.as_os_str() != "-" => std::fs::read_to_string(path)
            .with_context(|| format!("reading request {}", path.display()))?,
        _ => {
            let mut text = String::new();
            std::io::stdin().read_to_string(&mut text)?;
            text
        }
    };
    let mut request: GenerationRequest =
        serde_json::from_str(&text).context("parsing request JSON")?;
    if let Some(steps) = args.steps {
        request.steps = steps;
    }

    let resolved = pipeline::validate(&request, &config.latent)?;
    let latent = &config.latent;

    let source_frames = match (args.source_frames, resolved.reference_handle(&request)) {
        (Some(frames), _) => Some(frames),
        (None, Some(AudioHandle::Path(path))) => {
            let audio = GeneratedAudio::load(path)?;
            Some(latent.frames_for(audio.duration_s()))
        }
        (None, Some(handle)) => anyhow::bail!("cannot size {} without --source-frames", handle.describe()),
        (None, None) => None,
    };
    let plan = splice::plan(
        resolved.task,
        source_frames,
        latent.frames_for(request.duration_s),
        (request.repaint_start_s, request.repaint_end_s),
        latent,
    )?;

    let seed = resolve_seed(request.seed);
    let scheduler_config = scheduler::SchedulerConfig {
        omega_scale: request.omega_scale,
        ..config.scheduler.clone()
    };
    let scheduler = scheduler::build(request.scheduler, scheduler_config, request.steps, seed);
    let sigmas = scheduler.sigmas();
    let start_step = plan.start_step(sigmas, request.retake_variance, request.audio_to_audio_strength);
    let schedule = GuidanceSchedule::new(
        request.steps,
        request.guidance_scale,
        request.guidance_interval,
        request.guidance_interval_decay,
        request.min_guidance_scale,
    );

    let output = json!({
        "requested_task": request.task,
        "resolved": resolved,
        "seed": seed,
        "latent_fps": latent.latent_fps(),
        "frames": plan.output_frames(),
        "duration_s": latent.duration_of(plan.output_frames()),
        "plan": plan,
        "steps": request.steps,
        "start_step": start_step,
        "scheduler": request.scheduler,
        "sigmas": sigmas,
        "guidance": {
            "kind": request.guidance,
            "scale": request.guidance_scale,
            "enabled": schedule.enabled(),
            "steps": [schedule.start, schedule.end],
            "double_condition": request.double_condition(),
        },
        "adapter": request.adapter,
    });

    let rendered = if args.pretty {
        serde_json::to_string_pretty(&output)?
    } else {
        serde_json::to_string(&output)?
    };
    println!("{rendered}");
    Ok(())
}
