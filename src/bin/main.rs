use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use collab_sync::config::load_config;
use collab_sync::simulate::{SimulationOptions, run_simulation};

/// Queue, lock and broadcast core for real-time document collaboration
#[derive(Parser)]
#[command(name = "collab-sync")]
#[command(version)]
#[command(about = "Queue, lock and broadcast core for real-time document collaboration")]
struct Cli {
    /// Settings file merged over the defaults and the user config
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run concurrent writers against in-memory collaborators and report
    /// the final version of every document
    Simulate {
        /// Number of documents
        #[arg(long, default_value_t = 4)]
        docs: usize,

        /// Number of concurrent writers, each editing every document
        #[arg(long, default_value_t = 8)]
        writers: usize,

        /// Ops per writer and document
        #[arg(long, default_value_t = 50)]
        ops: usize,

        /// Seconds to wait for the queues to drain
        #[arg(long, default_value_t = 60)]
        timeout: u64,
    },
    /// Print the effective settings as TOML
    Config,
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    let config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    match cli.command {
        Commands::Config => match toml::to_string_pretty(&config.to_settings()) {
            Ok(text) => print!("{}", text),
            Err(e) => {
                eprintln!("Error: could not render settings: {}", e);
                std::process::exit(1);
            }
        },
        Commands::Simulate {
            docs,
            writers,
            ops,
            timeout,
        } => {
            let options = SimulationOptions { docs, writers, ops };
            eprintln!(
                "Simulating {} writer(s) x {} op(s) on {} document(s)...",
                writers, ops, docs
            );

            let report = match run_simulation(&config, options, Duration::from_secs(timeout)).await
            {
                Ok(report) => report,
                Err(e) => {
                    eprintln!("Error: {}", e);
                    std::process::exit(1);
                }
            };

            println!(
                "{:<12} {:>8} {:>8} {:>8} {:>8} {:>8}",
                "document", "version", "expected", "acks", "updates", "resyncs"
            );
            for doc in &report.documents {
                println!(
                    "{:<12} {:>8} {:>8} {:>8} {:>8} {:>8}",
                    doc.doc_id, doc.version, doc.expected_version, doc.acks, doc.updates, doc.resyncs
                );
            }
            eprintln!("Finished in {:.2?}", report.elapsed);

            if !report.is_complete() {
                eprintln!("Error: not every document reached its expected version");
                std::process::exit(1);
            }
        }
    }
}
