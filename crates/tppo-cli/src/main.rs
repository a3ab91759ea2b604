//! TPPO CLI
//!
//! Command-line driver for token-level PPO training of the toy multi-agent
//! system and for inspecting optimizer checkpoints.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

use tppo::checkpoint::OptimizerSnapshot;
use tppo::mas::toy::{ToyMasConfig, ToyTokenMas};
use tppo::optim::AdamState;
use tppo::prelude::*;

#[derive(Parser)]
#[command(name = "tppo")]
#[command(version, about = "TPPO - Token-level multi-agent PPO", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train the toy multi-agent system on synthetic rollouts
    Train {
        /// JSON trainer config (missing fields use defaults)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Number of rollout/train iterations
        #[arg(long, default_value = "10")]
        iterations: u64,

        /// Prompts per rollout
        #[arg(long, default_value = "16")]
        batch_size: usize,

        /// Maximum action tokens per agent
        #[arg(long, default_value = "8")]
        max_tokens: usize,

        /// Comma-separated agent roles, in agent order
        #[arg(long, default_value = "planner,solver")]
        roles: String,

        /// Directory for optimizer checkpoints
        #[arg(long)]
        save_dir: Option<PathBuf>,

        /// Save every N iterations (0 saves only at the end)
        #[arg(long, default_value = "0")]
        save_every: u64,

        /// Random seed
        #[arg(long, default_value = "0")]
        seed: u64,
    },

    /// Summarize an optimizers.pt checkpoint
    Inspect {
        /// Path to optimizers.pt
        path: PathBuf,
    },

    /// Print the trainer config as JSON
    Config {
        /// Config file to resolve against the defaults
        #[arg(long)]
        path: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Train {
            config,
            iterations,
            batch_size,
            max_tokens,
            roles,
            save_dir,
            save_every,
            seed,
        } => {
            let config = load_config(config.as_deref())?;
            let roles = roles
                .split(',')
                .map(|r| r.trim().to_string())
                .filter(|r| !r.is_empty())
                .collect();
            let opts = TrainOptions {
                iterations,
                batch_size,
                max_tokens,
                roles,
                save_dir,
                save_every,
                seed,
            };
            train(config, opts)?;
        }
        Commands::Inspect { path } => {
            inspect(&path)?;
        }
        Commands::Config { path } => {
            let config = load_config(path.as_deref())?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<TrainerConfig> {
    let mut config = match path {
        Some(path) => TrainerConfig::from_json_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => TrainerConfig::default(),
    };
    if tch::Cuda::is_available() {
        tracing::info!("Using CUDA");
        config = config.cuda();
    }
    Ok(config)
}

struct TrainOptions {
    iterations: u64,
    batch_size: usize,
    max_tokens: usize,
    roles: Vec<String>,
    save_dir: Option<PathBuf>,
    save_every: u64,
    seed: u64,
}

fn train(config: TrainerConfig, opts: TrainOptions) -> Result<()> {
    tppo::utils::set_seed(opts.seed);
    let mut rng = StdRng::seed_from_u64(opts.seed);

    let mas = ToyTokenMas::new(ToyMasConfig {
        roles: opts.roles,
        device: config.device,
        ..Default::default()
    })?;
    let mut trainer = TppoTrainer::new(mas, config)?;

    tracing::info!(
        iterations = opts.iterations,
        batch_size = opts.batch_size,
        agents = trainer.mas().num_agents(),
        "Starting training"
    );

    let pb = ProgressBar::new(opts.iterations);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")?
            .progress_chars("#>-"),
    );

    let mut global_steps = 0u64;
    let mut info = TrainInfo::default();
    for iteration in 1..=opts.iterations {
        trainer.prep_rollout();
        let sample = trainer
            .mas()
            .synthetic_rollout(opts.batch_size, opts.max_tokens, &mut rng)?;
        let mut buffer = RolloutTokenBuffer::new(sample, rng.gen())?;

        trainer.prep_training();
        info = trainer.train(&mut buffer, global_steps)?;
        global_steps += opts.batch_size as u64;

        pb.set_message(format!(
            "v_loss: {:.4} kl: {:.2e}",
            info.value_loss, info.approx_kl
        ));
        pb.inc(1);

        if let Some(dir) = &opts.save_dir {
            if opts.save_every > 0 && iteration % opts.save_every == 0 {
                trainer.save_optimizers(dir, global_steps)?;
            }
        }
    }
    pb.finish_with_message("done");

    if let Some(dir) = &opts.save_dir {
        let path = trainer.save_optimizers(dir, global_steps)?;
        println!("Saved optimizers to {}", path.display());
    }
    println!("{}", serde_json::to_string_pretty(&info.to_map())?);
    Ok(())
}

fn summarize(name: &str, state: &AdamState) {
    println!(
        "{:<24} params: {:>4}  initialized: {:>4}  step: {}",
        name,
        state.params.len(),
        state.num_initialized(),
        state.max_step()
    );
}

fn inspect(path: &Path) -> Result<()> {
    let snapshot = OptimizerSnapshot::load(path, tch::Device::Cpu)
        .with_context(|| format!("failed to read {}", path.display()))?;

    println!("Optimizer checkpoint: {}", path.display());
    for (role, state) in &snapshot.policy_opt_states {
        summarize(&format!("policy[{}]", role), state);
    }
    summarize("critic", &snapshot.critic_opt_state);

    match &snapshot.param_groups {
        Some(groups) => {
            for (role, group) in &groups.policy {
                println!(
                    "policy[{}] lr: {:e}  eps: {:e}  weight_decay: {}",
                    role, group.lr, group.eps, group.weight_decay
                );
            }
            println!(
                "critic lr: {:e}  eps: {:e}  weight_decay: {}",
                groups.critic.lr, groups.critic.eps, groups.critic.weight_decay
            );
        }
        None => println!("No param groups recorded"),
    }
    Ok(())
}
