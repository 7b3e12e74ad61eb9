use anyhow::Result;
use clap::{Parser, Subcommand};

mod commands;

use commands::documents::{self, ManifestArgs};

#[derive(Parser)]
#[command(name = "dfe")]
#[command(about = "NF-e / CT-e distribution sync", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Database commands
    Db {
        #[command(subcommand)]
        cmd: DbCmd,
    },

    /// Compute layered config hash + print canonical JSON
    ConfigHash {
        /// Paths in merge order (base -> env -> site)
        #[arg(required = true)]
        paths: Vec<String>,
    },

    /// Run the distribution loop until Ctrl-C
    Sync {
        /// Layered config paths in merge order
        #[arg(long = "config", required = true)]
        config_paths: Vec<String>,

        /// Run a single pass over all accounts and exit
        #[arg(long, default_value_t = false)]
        once: bool,
    },

    /// Watermark inspection
    Watermark {
        #[command(subcommand)]
        cmd: WatermarkCmd,
    },

    /// Register a recipient acknowledgement event for one document
    Manifest {
        #[arg(long = "config", required = true)]
        config_paths: Vec<String>,

        #[arg(long)]
        account: String,

        /// 44-digit access key
        #[arg(long)]
        key: String,

        /// Event code: 210200 | 210210 | 210220 | 210240
        #[arg(long)]
        event: String,

        /// Event sequence (1..=20)
        #[arg(long, default_value_t = 1)]
        sequence: u8,

        /// Required for 210240 (15..=255 characters)
        #[arg(long)]
        justification: Option<String>,
    },

    /// Query one document by access key and store it
    FetchKey {
        #[arg(long = "config", required = true)]
        config_paths: Vec<String>,

        #[arg(long)]
        account: String,

        /// 44-digit access key
        #[arg(long)]
        key: String,
    },
}

#[derive(Subcommand)]
enum DbCmd {
    Status,

    /// Apply SQL migrations.
    Migrate,
}

#[derive(Subcommand)]
enum WatermarkCmd {
    /// Print stored watermarks
    Show {
        #[arg(long = "config", required = true)]
        config_paths: Vec<String>,

        /// Restrict to one account
        #[arg(long)]
        account: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Silent if the file does not exist; production injects env vars directly.
    let _ = dotenvy::from_filename(".env.local");

    init_tracing();

    let cli = Cli::parse();

    match cli.cmd {
        Commands::Db { cmd } => {
            let pool = dfe_db::connect_from_env().await?;
            match cmd {
                DbCmd::Status => {
                    let s = dfe_db::status(&pool).await?;
                    println!(
                        "db_ok={} has_watermarks_table={}",
                        s.ok, s.has_watermarks_table
                    );
                }
                DbCmd::Migrate => {
                    dfe_db::migrate(&pool).await?;
                    println!("migrations_applied=true");
                }
            }
        }

        Commands::ConfigHash { paths } => {
            let path_refs: Vec<&str> = paths.iter().map(|s| s.as_str()).collect();
            let loaded = dfe_config::load_layered_yaml(&path_refs)?;
            println!("config_hash={}", loaded.config_hash);
            println!("{}", loaded.canonical_json);
        }

        Commands::Sync { config_paths, once } => {
            commands::sync::run(&config_paths, once).await?;
        }

        Commands::Watermark { cmd } => match cmd {
            WatermarkCmd::Show {
                config_paths,
                account,
            } => {
                documents::watermark_show(&config_paths, account.as_deref()).await?;
            }
        },

        Commands::Manifest {
            config_paths,
            account,
            key,
            event,
            sequence,
            justification,
        } => {
            let args = ManifestArgs {
                account: &account,
                key: &key,
                event: &event,
                sequence,
                justification,
            };
            documents::manifest(&config_paths, args).await?;
        }

        Commands::FetchKey {
            config_paths,
            account,
            key,
        } => {
            documents::fetch_key(&config_paths, &account, &key).await?;
        }
    }

    Ok(())
}

/// Logs go to stderr so stdout stays machine-readable (`key=value` lines).
fn init_tracing() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}
