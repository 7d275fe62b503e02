use admissions_server::config::loader::load_config;
use admissions_server::{Backends, ServerBuilder, metrics, observability, run_workers};
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "admissions-server")]
#[command(about = "Webhook intake, job API and queue workers for the admissions portal")]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to admissions.toml when present)
    #[arg(short, long, global = true, env = "ADMISSIONS_CONFIG")]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP server
    Serve {
        /// Also run the queue workers in this process
        #[arg(long)]
        with_workers: bool,
    },
    /// Run the queue workers only
    Worker,
}

#[tokio::main]
async fn main() {
    // Load .env file if present (before anything else)
    if let Err(e) = dotenvy::dotenv() {
        // Not an error if .env doesn't exist - it's optional
        if !matches!(e, dotenvy::Error::Io(ref io_err) if io_err.kind() == std::io::ErrorKind::NotFound)
        {
            eprintln!("Warning: Failed to load .env file: {e}");
        }
    }

    let cli = Cli::parse();

    // Initialize tracing early with the default level
    observability::init_tracing();

    let cfg = match load_config(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            std::process::exit(2);
        }
    };
    observability::apply_logging_level(&cfg.logging.level);
    metrics::init_metrics();

    tracing::info!(
        path = cli.config.as_deref().unwrap_or("admissions.toml"),
        redis = cfg.redis.enabled,
        "Configuration loaded"
    );

    let backends = match Backends::from_config(&cfg) {
        Ok(b) => b,
        Err(e) => {
            eprintln!("Email transport initialization failed: {e}");
            std::process::exit(2);
        }
    };

    let result = match cli.command.unwrap_or(Command::Serve {
        with_workers: false,
    }) {
        Command::Serve { with_workers } => {
            let mut builder = ServerBuilder::new(cfg).with_backends(backends);
            if with_workers {
                builder = builder.with_workers();
            }
            match builder.build().await {
                Ok(server) => server.run().await,
                Err(e) => {
                    eprintln!("Server initialization failed: {e}");
                    std::process::exit(2);
                }
            }
        }
        Command::Worker => run_workers(cfg, backends).await,
    };

    if let Err(err) = result {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}
