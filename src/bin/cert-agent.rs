//! cert-agent CLI: init/status/check/daemon/renew/crl surfaces over the
//! certificate lifecycle agent library.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use cert_lifecycle_agent::config::Config;
use cert_lifecycle_agent::control_loop::ControlLoop;
use cert_lifecycle_agent::enroll::Enrollment;
use cert_lifecycle_agent::status::StatusReport;

#[derive(Parser)]
#[command(name = "cert-agent")]
#[command(about = "Certificate lifecycle agent: monitors expiry/revocation and renews via a CA", long_about = None)]
#[command(version)]
struct Cli {
    /// Enable debug-level logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to the agent's configuration file
    #[arg(short, long, global = true, default_value = "config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write an annotated example configuration file and exit
    Init {
        /// Where to write the example configuration
        #[arg(short, long, default_value = "config.toml")]
        output: PathBuf,
    },

    /// Report the status of every managed certificate
    Status {
        /// Output format
        #[arg(short, long, default_value = "table")]
        format: StatusFormat,
    },

    /// Run a single check-and-renew pass and exit
    Check,

    /// Run the long-lived monitoring and renewal loop
    Daemon,

    /// Force renewal of a single managed certificate by name
    Renew {
        /// Name of the certificate entry to renew
        name: String,
    },

    /// Inspect or refresh the CRL cache
    Crl {
        /// Force a fresh download for every configured/embedded CRL source
        #[arg(long)]
        refresh: bool,
    },
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum StatusFormat {
    Json,
    Table,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose { tracing::Level::DEBUG } else { tracing::Level::INFO };
    tracing_subscriber::fmt().with_max_level(level).init();

    if let Err(e) = run(cli).await {
        tracing::error!(error = %e, "cert-agent exiting with an error");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> cert_lifecycle_agent::Result<()> {
    if let Commands::Init { output } = &cli.command {
        Config::create_example(output)
            .map_err(|e| cert_lifecycle_agent::AgentError::Config(e.to_string()))?;
        println!("wrote example configuration to {}", output.display());
        return Ok(());
    }

    let config = Config::from_file(&cli.config)
        .map_err(|e| cert_lifecycle_agent::AgentError::Config(e.to_string()))?;
    let control = ControlLoop::new(config)?;

    match cli.command {
        Commands::Init { .. } => unreachable!("handled above"),

        Commands::Status { format } => {
            control.initialize().await?;
            let statuses = control.evaluate_all().await;
            let report = StatusReport::from_statuses(&statuses);
            match format {
                StatusFormat::Json => println!("{}", report.to_json()?),
                StatusFormat::Table => print!("{}", report.to_table()),
            }
        }

        Commands::Check => {
            control.initialize().await?;
            let statuses = control.check_and_renew().await;
            let errored = statuses.iter().filter(|s| s.error_message.is_some()).count();
            if errored > 0 {
                return Err(cert_lifecycle_agent::AgentError::Other(format!(
                    "{errored} certificate(s) had errors during the check pass"
                )));
            }
        }

        Commands::Daemon => {
            control.initialize().await?;
            let shutdown = ShutdownSignal::install();
            control.run(|| shutdown.requested()).await;
        }

        Commands::Renew { name } => {
            control.initialize().await?;
            let cert = control
                .config()
                .certificates
                .iter()
                .find(|c| c.name == name)
                .ok_or_else(|| {
                    cert_lifecycle_agent::AgentError::Config(format!("no certificate named '{name}' configured"))
                })?;
            control.adapter().renew(cert).await?;
            control.adapter().verify(cert).await?;
            println!("renewed {name}");
        }

        Commands::Crl { refresh } => {
            control.initialize().await?;
            if refresh {
                let statuses = control.evaluate_all().await;
                println!("refreshed CRL sources for {} certificate(s)", statuses.len());
            } else {
                println!("CRL cache dir: {}", control.config().step_ca.crl_cache_dir.display());
            }
        }
    }

    Ok(())
}

/// Tracks SIGINT/SIGTERM for graceful daemon shutdown: finish the certificate
/// currently being checked, then stop taking new ones.
struct ShutdownSignal {
    flag: std::sync::Arc<std::sync::atomic::AtomicBool>,
}

impl ShutdownSignal {
    fn install() -> Self {
        let flag = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag_int = flag.clone();
        let flag_term = flag.clone();

        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("received SIGINT, shutting down gracefully");
                flag_int.store(true, std::sync::atomic::Ordering::SeqCst);
            }
        });

        #[cfg(unix)]
        tokio::spawn(async move {
            use tokio::signal::unix::{signal, SignalKind};
            if let Ok(mut term) = signal(SignalKind::terminate()) {
                term.recv().await;
                tracing::info!("received SIGTERM, shutting down gracefully");
                flag_term.store(true, std::sync::atomic::Ordering::SeqCst);
            }
        });

        ShutdownSignal { flag }
    }

    fn requested(&self) -> bool {
        self.flag.load(std::sync::atomic::Ordering::SeqCst)
    }
}
