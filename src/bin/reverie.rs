use std::path::{Path, PathBuf};

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use reverie::{
    FrameIndex, FsLibrary, GeneratorSettings, JobOutcome, ParameterSet, Preferences,
    PreviewBackend, Scheduler, SchedulerEvent, SchedulerState, Timeline, output,
};

#[derive(Parser, Debug)]
#[command(name = "reverie", version)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the parameters a timeline resolves to at one frame, as JSON.
    Resolve(ResolveArgs),
    /// Print the output file name and resolved knobs of every frame of a timeline.
    Plan(PlanArgs),
    /// Generate a single image or a whole timeline into a library.
    Dream(DreamArgs),
}

#[derive(Parser, Debug)]
struct ResolveArgs {
    /// Input timeline JSON.
    #[arg(long = "in")]
    in_path: PathBuf,

    /// Frame index (0-based).
    #[arg(long)]
    frame: u64,
}

#[derive(Parser, Debug)]
struct PlanArgs {
    /// Input timeline JSON.
    #[arg(long = "in")]
    in_path: PathBuf,
}

#[derive(Parser, Debug)]
struct DreamArgs {
    /// Input timeline JSON. Every frame is generated.
    #[arg(long = "in", required_unless_present = "prompt", conflicts_with = "prompt")]
    in_path: Option<PathBuf>,

    /// Prompt for a single image.
    #[arg(long)]
    prompt: Option<String>,

    /// Sampling steps for a single image.
    #[arg(long, default_value_t = 50)]
    steps: u32,

    /// Seed for a single image.
    #[arg(long)]
    seed: Option<u32>,

    /// Output path relative to the library. Derived from the time of day when omitted.
    #[arg(long)]
    out: Option<PathBuf>,

    /// Library directory. Overrides the preferences file.
    #[arg(long)]
    library: Option<PathBuf>,

    /// Preferences JSON.
    #[arg(long, default_value = "reverie.json")]
    preferences: PathBuf,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "reverie=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    match cli.cmd {
        Command::Resolve(args) => cmd_resolve(args),
        Command::Plan(args) => cmd_plan(args),
        Command::Dream(args) => cmd_dream(args),
    }
}

fn read_timeline(path: &Path) -> anyhow::Result<Timeline> {
    Timeline::load_json(path).with_context(|| format!("load timeline '{}'", path.display()))
}

fn cmd_resolve(args: ResolveArgs) -> anyhow::Result<()> {
    let timeline = read_timeline(&args.in_path)?;
    let params = timeline.resolve(FrameIndex(args.frame)).normalized();
    println!("{}", serde_json::to_string_pretty(&params)?);
    Ok(())
}

fn cmd_plan(args: PlanArgs) -> anyhow::Result<()> {
    let timeline = read_timeline(&args.in_path)?;
    let base = match timeline.path() {
        Some(p) => p.to_path_buf(),
        None => args.in_path.file_stem().map(PathBuf::from).unwrap_or_default(),
    };
    let base = output::with_format_extension(&base, timeline.output().format);

    for (frame, params) in timeline.frames() {
        let g = params.normalized().generator;
        let key = if timeline.key_at(frame).is_some() {
            "*"
        } else {
            " "
        };
        println!(
            "{key}{:>5}  {}  seeds {}/{} blend {:.3}  strength {:.3}  steps {}  cfg {:.2}",
            frame.0,
            output::frame_file_name(&base, frame).display(),
            g.seed_a,
            g.seed_b,
            g.seed_blend,
            g.image_strength,
            g.steps,
            g.cfg_scale,
        );
    }
    Ok(())
}

fn cmd_dream(args: DreamArgs) -> anyhow::Result<()> {
    let prefs = Preferences::load_or_default(&args.preferences)?;
    let library_path = args.library.clone().unwrap_or(prefs.library_path.clone());
    let library = FsLibrary::open(&library_path)?;

    let mut scheduler = Scheduler::new(prefs.scheduler_opts());
    let events = scheduler.subscribe();

    let handle = match (&args.in_path, &args.prompt) {
        (Some(in_path), _) => {
            let mut timeline = read_timeline(in_path)?;
            if let Some(out) = &args.out {
                timeline.set_path(Some(out.clone()));
            } else if timeline.path().is_none() {
                let stem = in_path.file_stem().map(PathBuf::from).unwrap_or_default();
                timeline.set_path(Some(stem));
            }
            scheduler.submit_sequence_job(&timeline)?
        }
        (None, Some(prompt)) => {
            let mut params = ParameterSet::new(
                GeneratorSettings::default().with_prompt(prompt.as_str()),
                Default::default(),
            );
            params.generator.steps = args.steps;
            match args.seed {
                Some(seed) => params.generator.seed_a = seed,
                None => params.generator.seed_a_randomize = true,
            }
            match &args.out {
                Some(out) => scheduler.submit_image_job_at(&params, out),
                None => scheduler.submit_image_job(&params),
            }
        }
        (None, None) => anyhow::bail!("either --in or --prompt is required"),
    };

    scheduler.start(PreviewBackend::from_model(&prefs.model), library)?;

    let outcome = loop {
        let event = events
            .recv()
            .context("scheduler worker exited before the job finished")?;
        match event {
            SchedulerEvent::StateChanged(SchedulerState::Failed) => {
                scheduler.join()?;
                anyhow::bail!("generation backend failed to load");
            }
            SchedulerEvent::StateChanged(_) => {}
            SchedulerEvent::Progress(p) => {
                tracing::debug!(step = p.step, total = p.total_steps, "{}", p.text);
            }
            SchedulerEvent::Result(r) => {
                match &r.persist_error {
                    Some(e) => eprintln!("frame {} not saved: {e}", r.frame),
                    None => eprintln!("wrote {}", r.artifact.paths.image.display()),
                }
            }
            SchedulerEvent::JobFinished { job, outcome } if job == handle.id() => break outcome,
            SchedulerEvent::JobFinished { .. } => {}
        }
    };

    scheduler.stop()?;
    match outcome {
        JobOutcome::Completed { frames } => {
            eprintln!("done: {frames} frame(s) in {}", library_path.display());
            Ok(())
        }
        JobOutcome::Cancelled { frames } => anyhow::bail!("job cancelled after {frames} frame(s)"),
        JobOutcome::Failed { frames, error } => {
            anyhow::bail!("job failed after {frames} frame(s): {error}")
        }
    }
}
