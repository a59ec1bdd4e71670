use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use calcwire::calculator::{self, CalculatorClient};
use calcwire::{Channel, Config, Server};

/// Calculator service over the calcwire protocol
#[derive(Parser)]
#[command(name = "calcwire")]
#[command(about = "Calculator service over the calcwire protocol")]
#[command(version)]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Server address for client commands (overrides config)
    #[arg(short, long)]
    endpoint: Option<String>,

    /// Deadline for each call, in milliseconds (overrides config)
    #[arg(long, global = true)]
    deadline_ms: Option<u64>,

    /// Log verbosity level (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the calculator server
    Serve {
        /// Address to listen on (overrides config)
        #[arg(short, long)]
        listen: Option<String>,
    },
    /// Add two numbers
    Add {
        #[arg(allow_negative_numbers = true)]
        first: i64,
        #[arg(allow_negative_numbers = true)]
        second: i64,
    },
    /// Stream the prime factors of a number
    Primes { number: i64 },
    /// Average a list of numbers
    Average {
        #[arg(allow_negative_numbers = true)]
        numbers: Vec<i64>,
    },
    /// Print the running maximum after each number
    Max {
        #[arg(allow_negative_numbers = true)]
        numbers: Vec<i64>,
    },
    /// Square root of a positive number
    Sqrt {
        #[arg(allow_negative_numbers = true)]
        number: i32,
    },
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    if let Some(path) = path {
        if !path.is_file() {
            anyhow::bail!("config file does not exist: {}", path.display());
        }
    }
    Config::load(path).context("failed to load configuration")
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut config = load_config(cli.config.as_deref())?;
    if let Some(endpoint) = cli.endpoint {
        config.client.endpoint = endpoint;
    }
    if let Some(ms) = cli.deadline_ms {
        config.client.default_deadline_ms = Some(ms);
    }

    match cli.command {
        Commands::Serve { listen } => {
            if let Some(listen) = listen {
                config.server.listen = listen;
            }
            serve(config).await?;
        }
        Commands::Add { first, second } => {
            let client = connect(config).await?;
            println!("{}", client.add(first, second).await?);
        }
        Commands::Primes { number } => {
            let client = connect(config).await?;
            let mut factors = client.prime_number_decomposition(number).await?;
            while let Some(response) = factors.message().await? {
                println!("{}", response.factor);
            }
        }
        Commands::Average { numbers } => {
            let client = connect(config).await?;
            println!("{}", client.average(numbers).await?);
        }
        Commands::Max { numbers } => {
            let client = connect(config).await?;
            for max in client.find_max(numbers).await? {
                println!("{max}");
            }
        }
        Commands::Sqrt { number } => {
            let client = connect(config).await?;
            println!("{}", client.square_root(number).await?);
        }
    }
    Ok(())
}

async fn serve(config: Config) -> Result<()> {
    let listener = TcpListener::bind(&config.server.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.server.listen))?;

    let server = Server::builder(calculator::router())
        .config(config.server)
        .build();

    server
        .serve_with_shutdown(listener, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
        })
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

/// Connect to the configured endpoint; calls use the configured deadline.
async fn connect(config: Config) -> Result<CalculatorClient> {
    let endpoint = config.client.endpoint.clone();
    let channel = Channel::builder()
        .config(config.client)
        .connect_tcp(endpoint.as_str())
        .await
        .with_context(|| format!("failed to connect to {endpoint}"))?;
    Ok(CalculatorClient::new(channel))
}
