//! dreamrl CLI
//!
//! Launches world-model training runs and pokes at the built-in environments.

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use dreamrl::config::RunConfig;
use dreamrl::env::DreamEnv;
use dreamrl::utils::seed_rank;
use dreamrl_envs::{make, ENVIRONMENTS};

#[derive(Parser)]
#[command(name = "dreamrl")]
#[command(version, about = "dreamrl - World-model reinforcement learning in Rust", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Values that override the config file.
#[derive(clap::Args, Debug, Default)]
struct Overrides {
    /// Environment id (see `list-envs`)
    #[arg(long)]
    env: Option<String>,

    /// Total policy steps
    #[arg(long)]
    total_steps: Option<u64>,

    /// Parallel environment lanes on the player
    #[arg(long)]
    num_envs: Option<usize>,

    /// Player plus learners
    #[arg(long)]
    world_size: Option<usize>,

    /// Directory that holds `<run_name>/`
    #[arg(long)]
    root_dir: Option<PathBuf>,

    /// Checkpoint file to resume from
    #[arg(long)]
    resume_from: Option<PathBuf>,

    #[arg(long)]
    seed: Option<u64>,

    /// Shrink model and batch sizes for a smoke run
    #[arg(long)]
    tiny: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Train a Dreamer agent (requires --features torch)
    Train {
        /// JSON run configuration
        #[arg(long)]
        config: Option<PathBuf>,

        #[command(flatten)]
        overrides: Overrides,
    },

    /// Check a run configuration without starting anything
    ValidateConfig {
        /// JSON run configuration
        path: PathBuf,
    },

    /// List available environments
    ListEnvs,

    /// Run an environment with random actions
    Demo {
        /// Environment id
        #[arg(default_value = "point_mass")]
        env: String,

        /// Number of steps
        #[arg(long, default_value = "20")]
        steps: usize,

        #[arg(long, default_value = "0")]
        seed: u64,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Train { config, overrides } => {
            let config = load_config(config, &overrides)?;
            train(config)?;
        }
        Commands::ValidateConfig { path } => {
            let config = RunConfig::from_json_file(&path)?;
            config.validate()?;
            println!(
                "{} is valid: env={} world_size={} total_steps={}",
                path.display(),
                config.env.id,
                config.distributed.world_size,
                config.algo.total_steps
            );
        }
        Commands::ListEnvs => list_envs(),
        Commands::Demo { env, steps, seed } => demo(&env, steps, seed)?,
    }

    Ok(())
}

fn load_config(path: Option<PathBuf>, overrides: &Overrides) -> Result<RunConfig> {
    let mut config = match path {
        Some(path) => RunConfig::from_json_file(path)?,
        None => RunConfig::default().with_env_overrides(),
    };
    if overrides.tiny {
        config = config.tiny();
    }
    if let Some(env) = &overrides.env {
        config.env.id = env.clone();
    }
    if let Some(num_envs) = overrides.num_envs {
        config.env.num_envs = num_envs;
    }
    if let Some(steps) = overrides.total_steps {
        config = config.with_total_steps(steps);
    }
    if let Some(world_size) = overrides.world_size {
        config = config.with_world_size(world_size);
    }
    if let Some(root) = &overrides.root_dir {
        config = config.with_root_dir(root);
    }
    if let Some(resume) = &overrides.resume_from {
        config = config.with_resume_from(resume);
    }
    if let Some(seed) = overrides.seed {
        config = config.with_seed(seed);
    }
    Ok(config)
}

#[cfg(feature = "torch")]
fn train(mut config: RunConfig) -> Result<()> {
    use dreamrl::comm::{BackendRegistry, RunSetup};
    use dreamrl::coordinator::launch_local;
    use dreamrl::dreamer::{DreamerLearner, DreamerPlayer};
    use dreamrl::env::{ActionRepeat, EpisodeStats, RestartOnError};
    use dreamrl::log::{CompositeLogger, ConsoleLogger, JsonlLogger, MetricLogger};
    use dreamrl::vector::{Serial, VecEnvBackend};

    let env_config = config.env.clone();
    let envs = Serial::new(
        |_lane| {
            let factory_config = env_config.clone();
            let env = RestartOnError::new(move || make(&factory_config), env_config.max_restarts)?;
            Ok(EpisodeStats::new(ActionRepeat::new(env, env_config.action_repeat)?))
        },
        config.env.num_envs,
    )?;

    // Image observations go to the CNN unless the config says otherwise
    let observation_space = envs.observation_space();
    let keys = &mut config.algo.cnn_keys;
    if keys.encoder.is_empty() && keys.decoder.is_empty() {
        keys.encoder = observation_space.image_keys();
        keys.decoder = keys.encoder.clone();
        config.algo.mlp_keys.encoder.retain(|k| !keys.encoder.contains(k));
        config.algo.mlp_keys.decoder.retain(|k| !keys.encoder.contains(k));
    }
    config.validate()?;

    tracing::info!(
        env = %config.env.id,
        num_envs = config.env.num_envs,
        world_size = config.distributed.world_size,
        total_steps = config.algo.total_steps,
        run_dir = %config.run_dir().display(),
        "Starting training"
    );

    let setup = RunSetup {
        config: config.clone(),
        observation_space,
        action_space: envs.action_space(),
    };
    let player = DreamerPlayer::new(&setup)?;

    let run_dir = config.run_dir();
    std::fs::create_dir_all(&run_dir)?;
    #[allow(unused_mut)]
    let mut loggers: Vec<Box<dyn MetricLogger>> = vec![
        Box::new(ConsoleLogger::new()),
        Box::new(JsonlLogger::new(run_dir.join("metrics.jsonl"))?),
    ];
    #[cfg(feature = "tensorboard")]
    loggers.push(Box::new(dreamrl::log::TensorBoardLogger::for_run(&run_dir)));
    let logger = CompositeLogger::new(loggers);

    let summary = launch_local(
        &BackendRegistry::with_defaults(),
        config,
        envs,
        player,
        Box::new(logger),
        |setup, rank| DreamerLearner::new(setup, rank),
    )?;

    tracing::info!(
        policy_step = summary.player.policy_step,
        training_rounds = summary.player.training_rounds,
        checkpoints = summary.player.checkpoints.len(),
        "Training complete"
    );
    Ok(())
}

#[cfg(not(feature = "torch"))]
fn train(config: RunConfig) -> Result<()> {
    config.validate()?;
    bail!("training requires the 'torch' feature; rebuild with `cargo build --features torch` (libtorch must be installed)")
}

fn demo(env_id: &str, steps: usize, seed: u64) -> Result<()> {
    if steps == 0 {
        bail!("--steps must be positive");
    }
    tracing::info!(env = env_id, steps, "Running demo");

    let config = dreamrl::config::EnvConfig {
        id: env_id.to_string(),
        ..Default::default()
    };
    let mut env = make(&config)?;
    let action_space = env.action_space();
    let mut rng = seed_rank(seed, 0);
    env.reset(Some(seed))?;

    let mut episode_return = 0.0;
    for step in 0..steps {
        let action = action_space.sample(&mut rng);
        let result = env.step(&action)?;
        episode_return += result.reward;

        if let Some(render) = env.render() {
            println!("Step {}: reward={:.3}\n{}", step, result.reward, render);
        }

        if result.done() {
            println!("Episode finished: return={:.3}", episode_return);
            episode_return = 0.0;
            env.reset(None)?;
        }
    }
    Ok(())
}

fn list_envs() {
    println!("Available environments:");
    println!();
    for (id, description) in ENVIRONMENTS {
        println!("  {:<12} {}", id, description);
    }
    println!();
    println!("Training requires --features torch and libtorch installed.");
}
