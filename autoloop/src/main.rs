//! `autoloop` command line.
//!
//! Runs an external coding agent against a plan, one phase at a time, until
//! each phase's tracked issues are closed or its iterations run out.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::{Args, Parser, Subcommand};

use autoloop::core::id::validate_id;
use autoloop::core::run::{LoopRun, RunMode, RunTarget};
use autoloop::core::types::RunState;
use autoloop::exit_codes;
use autoloop::io::agent::CliAgent;
use autoloop::io::checkpoint::load_checkpoint;
use autoloop::io::config::{LoopConfig, load_config};
use autoloop::io::control::{LoopControl, clear_marker, set_marker};
use autoloop::io::git::{Git, GitStatus};
use autoloop::io::init::{InitOptions, LoopPaths, init_workspace};
use autoloop::io::observer::{FanOut, FileTee, LineObserver, TracingObserver};
use autoloop::io::tracker::{CliTracker, DisabledTracker, IssueTracker};
use autoloop::logging;
use autoloop::looping::{
    LoopOutcome, LoopRunner, LoopSettings, LoopStop, ThreadSleeper, finished_stop, new_run_id,
};

#[derive(Parser)]
#[command(
    name = "autoloop",
    version,
    about = "Drive a coding agent through a plan until its issues are closed"
)]
struct Cli {
    /// Working directory the agent operates in.
    #[arg(long, global = true, default_value = ".")]
    workdir: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.autoloop/` with a default config.
    Init {
        /// Overwrite an existing config.
        #[arg(short, long)]
        force: bool,
    },
    /// Start a new run.
    Run(RunArgs),
    /// Continue the run recorded in the checkpoint.
    Resume(Overrides),
    /// Print the checkpointed run.
    Status,
    /// Ask a running loop to pause after killing the current attempt.
    Pause,
    /// Withdraw a pause request.
    Unpause,
    /// Ask a running loop to stop; the run stays resumable.
    Stop,
}

#[derive(Args)]
struct RunArgs {
    /// Plan artifact (markdown).
    #[arg(long)]
    plan: PathBuf,
    /// Run only this phase.
    #[arg(long, conflicts_with = "tracker")]
    phase: Option<String>,
    /// Issue that must be closed for each phase to pass (repeatable).
    #[arg(long = "issue")]
    issues: Vec<String>,
    /// Pick phases from the tracker's ready queue.
    #[arg(long)]
    tracker: bool,
    /// Discard an unfinished run instead of refusing to start.
    #[arg(long)]
    fresh: bool,
    #[command(flatten)]
    overrides: Overrides,
}

#[derive(Args, Default)]
struct Overrides {
    #[arg(long)]
    max_iterations: Option<u32>,
    #[arg(long)]
    delay_secs: Option<u64>,
    #[arg(long)]
    agent_timeout_secs: Option<u64>,
}

impl Overrides {
    fn apply(&self, cfg: &mut LoopConfig) -> Result<()> {
        if let Some(max) = self.max_iterations {
            cfg.max_iterations = max;
        }
        if let Some(delay) = self.delay_secs {
            cfg.delay_secs = delay;
        }
        if let Some(timeout) = self.agent_timeout_secs {
            cfg.agent_timeout_secs = timeout;
        }
        cfg.validate()
    }
}

fn main() {
    logging::init();
    let cli = Cli::parse();
    let code = match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            exit_codes::CONFIG
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<i32> {
    let root = std::path::absolute(&cli.workdir)
        .with_context(|| format!("resolve {}", cli.workdir.display()))?;
    let paths = LoopPaths::new(&root);
    match cli.command {
        Command::Init { force } => cmd_init(&root, force),
        Command::Run(args) => cmd_run(paths, &args),
        Command::Resume(overrides) => cmd_resume(paths, &overrides),
        Command::Status => cmd_status(&paths),
        Command::Pause => marker_command(set_marker(&paths.pause_marker_path), "pause requested"),
        Command::Unpause => marker_command(clear_marker(&paths.pause_marker_path), "pause withdrawn"),
        Command::Stop => marker_command(set_marker(&paths.stop_marker_path), "stop requested"),
    }
}

fn cmd_init(root: &Path, force: bool) -> Result<i32> {
    let paths = init_workspace(root, &InitOptions { force })?;
    println!("initialized {}", paths.loop_dir.display());
    Ok(exit_codes::OK)
}

fn cmd_run(paths: LoopPaths, args: &RunArgs) -> Result<i32> {
    let mut cfg = load_config(&paths.config_path)?;
    args.overrides.apply(&mut cfg)?;

    if let Some(checkpoint) = load_checkpoint(&paths.checkpoint_path)?
        && !checkpoint.state.is_terminal()
        && !args.fresh
    {
        return Err(anyhow!(
            "run {} is unfinished ({:?}); use `autoloop resume` or pass --fresh",
            checkpoint.run_id,
            checkpoint.state
        ));
    }

    let mode = match (&args.phase, args.tracker) {
        (Some(phase_id), _) => {
            validate_id(phase_id)?;
            RunMode::Single {
                phase_id: phase_id.clone(),
            }
        }
        (None, true) => RunMode::Tracker,
        (None, false) => RunMode::Sequential,
    };
    let plan_path = std::path::absolute(&args.plan)
        .with_context(|| format!("resolve {}", args.plan.display()))?;
    let target = RunTarget {
        plan_path: Some(plan_path),
        mode,
        extra_issue_ids: args.issues.clone(),
    };

    let git = Git::new(&paths.root, Duration::from_secs(cfg.vcs.timeout_secs));
    let run = LoopRun::new(new_run_id(&git), cfg.max_iterations, cfg.delay());
    println!("run {} started", run.run_id);
    execute(paths, &cfg, run, &target)
}

fn cmd_resume(paths: LoopPaths, overrides: &Overrides) -> Result<i32> {
    let mut cfg = load_config(&paths.config_path)?;
    overrides.apply(&mut cfg)?;
    let checkpoint = load_checkpoint(&paths.checkpoint_path)?
        .ok_or_else(|| anyhow!("no checkpoint at {}", paths.checkpoint_path.display()))?;
    let (mut run, target) = checkpoint.into_run();

    if let Some(stop) = finished_stop(&run) {
        println!("run {} already finished ({:?})", run.run_id, run.state);
        return Ok(exit_codes::for_stop(&stop));
    }
    if let Some(max) = overrides.max_iterations {
        if max < run.iteration {
            return Err(anyhow!(
                "--max-iterations {max} is below the {} iterations already used",
                run.iteration
            ));
        }
        run.max_iterations = max;
    }
    if overrides.delay_secs.is_some() {
        run.delay = cfg.delay();
    }
    println!("resuming run {} at iteration {}", run.run_id, run.iteration);
    execute(paths, &cfg, run, &target)
}

fn execute(paths: LoopPaths, cfg: &LoopConfig, run: LoopRun, target: &RunTarget) -> Result<i32> {
    clear_marker(&paths.stop_marker_path)?;
    let control = LoopControl::with_markers(&paths);

    let mut observers: Vec<Arc<dyn LineObserver>> = vec![Arc::new(TracingObserver)];
    if cfg.stream_log {
        observers.push(Arc::new(FileTee::append(&paths.stream_log_path)?));
    }
    let agent = CliAgent::new(&cfg.agent.command, &paths.root, cfg.output_limit_bytes)?
        .with_observer(Arc::new(FanOut(observers)))
        .with_control(control.clone());
    let tracker: Box<dyn IssueTracker> = if cfg.tracker.enabled {
        Box::new(CliTracker::new(
            &cfg.tracker.command,
            &paths.root,
            Duration::from_secs(cfg.tracker.timeout_secs),
        ))
    } else {
        Box::new(DisabledTracker)
    };
    let vcs = GitStatus::new(Duration::from_secs(cfg.vcs.timeout_secs));
    let settings = LoopSettings {
        agent_timeout: cfg.agent_timeout(),
        prompt_budget_bytes: cfg.prompt_budget_bytes,
        ready_limit: cfg.tracker.ready_limit,
    };

    let outcome = LoopRunner::new(paths, &agent, tracker.as_ref(), &vcs, &ThreadSleeper)
        .with_control(control)
        .with_settings(settings)
        .run(run, target)?;
    print_outcome(&outcome);
    Ok(exit_codes::for_stop(&outcome.stop))
}

fn print_outcome(outcome: &LoopOutcome) {
    let run = &outcome.run;
    match &outcome.stop {
        LoopStop::Completed => println!(
            "run {} completed: {} phase(s) in {}s",
            run.run_id,
            run.context.completed_phases.len(),
            run.elapsed.as_secs()
        ),
        LoopStop::Stopped => println!(
            "run {} stopped at phase {} iteration {}; resume with `autoloop resume`",
            run.run_id,
            run.phase_id().unwrap_or("-"),
            run.iteration
        ),
        LoopStop::Failed(reason) => {
            eprintln!(
                "run {} failed at phase {}: {reason}",
                run.run_id,
                run.phase_id().unwrap_or("-")
            );
            if let Some(last) = &run.context.last_failure {
                eprintln!("last attempt: {last}");
            }
        }
    }
}

fn cmd_status(paths: &LoopPaths) -> Result<i32> {
    let Some(checkpoint) = load_checkpoint(&paths.checkpoint_path)? else {
        println!("no run recorded in {}", paths.loop_dir.display());
        return Ok(exit_codes::OK);
    };
    let (run, target) = checkpoint.into_run();
    println!("run:        {}", run.run_id);
    println!("state:      {}", state_label(run.state));
    println!("phase:      {}", run.phase_id().unwrap_or("-"));
    println!("iteration:  {}/{}", run.iteration, run.max_iterations);
    println!("elapsed:    {}s", run.elapsed.as_secs());
    if let Some(plan) = &target.plan_path {
        println!("plan:       {}", plan.display());
    }
    if !run.context.completed_phases.is_empty() {
        println!("completed:  {}", run.context.completed_phases.join(", "));
    }
    if let Some(reason) = &run.failure {
        println!("failure:    {reason}");
    }
    let control = LoopControl::with_markers(paths);
    if control.is_stop_requested() {
        println!("pending:    stop");
    } else if control.is_pause_requested() {
        println!("pending:    pause");
    }
    Ok(exit_codes::OK)
}

fn state_label(state: RunState) -> &'static str {
    match state {
        RunState::Idle => "idle",
        RunState::Running => "running",
        RunState::Paused => "paused",
        RunState::Completed => "completed",
        RunState::Failed => "failed",
    }
}

fn marker_command(result: Result<()>, message: &str) -> Result<i32> {
    result?;
    println!("{message}");
    Ok(exit_codes::OK)
}
