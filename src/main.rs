use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

use mannager::config::Config;
use mannager::data::{read_tree, write_tree};
use mannager::ml::{ModelManager, Registry};
use mannager::reshape::{load_instruction, reshape_to_table, reshape_to_tree, ReshapeOptions, RowRange};

/// Tree name used when `reshape` writes its result table.
const RESHAPED_OUTPUT_TREE: &str = "reshaped";

#[derive(Parser)]
#[command(name = "mannager")]
#[command(about = "Reshape columnar trees with instruction files and train models on the result")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Apply an instruction to a tree and write the resulting table
    Reshape {
        #[arg(short, long)]
        input: PathBuf,
        #[arg(short, long)]
        tree: String,
        #[arg(long)]
        instruction: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
        /// Row window as begin:end[:stride]
        #[arg(long)]
        range: Option<RowRange>,
        /// Also write the defined columns as tree `reshaped_tree` here
        #[arg(long)]
        snapshot: Option<PathBuf>,
        #[arg(long)]
        no_vectorize: bool,
    },
    /// Apply an instruction and persist the derived columns as a new tree
    ReshapeTree {
        #[arg(short, long)]
        input: PathBuf,
        #[arg(short, long)]
        tree: String,
        #[arg(long)]
        instruction: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
        #[arg(short, long)]
        name: String,
    },
    /// Train a model as described by a TOML config and save the manager
    Train {
        #[arg(short, long, default_value = "mannager.toml")]
        config: String,
    },
    /// Evaluate a saved manager on a tree
    Test {
        #[arg(short, long)]
        manager: PathBuf,
        #[arg(short, long)]
        input: PathBuf,
        #[arg(short, long)]
        tree: String,
        #[arg(short, long, default_value = "32")]
        batch_size: usize,
    },
}

fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    match cli.command {
        Command::Reshape {
            input,
            tree,
            instruction,
            output,
            range,
            snapshot,
            no_vectorize,
        } => {
            let source = read_tree(&input, &tree)?;
            let instruction = load_instruction(&instruction)?;
            let options = ReshapeOptions {
                range,
                intermediate_save_path: snapshot,
                vectorize: !no_vectorize,
            };
            let table = reshape_to_table(&source, &instruction, &options)?;
            write_tree(&output, RESHAPED_OUTPUT_TREE, &table)?;
        }
        Command::ReshapeTree {
            input,
            tree,
            instruction,
            output,
            name,
        } => {
            let source = read_tree(&input, &tree)?;
            let instruction = load_instruction(&instruction)?;
            reshape_to_tree(&source, &instruction, &output, &name)?;
        }
        Command::Train { config } => train(&config)?,
        Command::Test {
            manager,
            input,
            tree,
            batch_size,
        } => {
            let manager = ModelManager::load(&manager, &Registry::default())
                .with_context(|| format!("loading manager {}", manager.display()))?;
            let data = read_tree(&input, &tree)?;
            let scores = manager.test(&data, batch_size)?;
            println!("{}: {:?}", manager, scores);
        }
    }

    Ok(())
}

fn train(config_path: &str) -> Result<()> {
    let config = Config::from_file(config_path)
        .with_context(|| format!("reading config {}", config_path))?;
    let training = &config.training;

    let source = read_tree(&training.input, &training.tree)?;
    let data = match &training.instruction {
        Some(path) => {
            let instruction = load_instruction(path)?;
            let options = ReshapeOptions {
                range: training.range,
                ..ReshapeOptions::default()
            };
            reshape_to_table(&source, &instruction, &options)?
        }
        None => match training.range {
            Some(range) => source.slice(range.begin, range.end, range.stride)?,
            None => source,
        },
    };

    let conversion = Registry::default().conversion(&config.manager.conversion)?;
    let mut manager = ModelManager::new(
        Some(config.manager.build_model()),
        conversion,
        config.manager.description.clone(),
        config.manager.options(),
    );

    let outcome = manager.train(&data, training.epochs, training.batch_size, training.validation_split)?;
    if let Some(last) = outcome.history.last() {
        info!(
            "Final epoch {}: loss {:.5}, metric {:.4}, val_loss {:?}",
            last.epoch, last.loss, last.metric, last.val_loss
        );
    }

    manager.save(&training.output)?;
    Ok(())
}
