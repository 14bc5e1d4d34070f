mod commands;
mod utils;

use clap::{Parser, Subcommand};
use pgfast_core::{init_logging, LoggingConfig};
use pgfast_schema::{DownOptions, UpOptions, Version};
use std::path::PathBuf;

use commands::GlobalOptions;

#[derive(Parser)]
#[command(name = "pgfast")]
#[command(about = "Dependency-ordered PostgreSQL migrations, fixtures and test databases")]
#[command(version)]
struct Cli {
    /// Connection URL (overrides DATABASE_URL and the config file)
    #[arg(long, global = true)]
    database_url: Option<String>,

    /// Migrations directory; repeat for several roots
    #[arg(long = "migrations-dir", global = true)]
    migrations_dirs: Vec<PathBuf>,

    /// YAML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level filter (RUST_LOG takes precedence)
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the migrations and fixtures directories
    Init,

    /// Migration management
    Schema {
        #[command(subcommand)]
        schema_command: SchemaCommands,
    },

    /// Fixture loading
    Fixtures {
        #[command(subcommand)]
        fixtures_command: FixturesCommands,
    },

    /// Disposable test databases
    TestDb {
        #[command(subcommand)]
        test_db_command: TestDbCommands,
    },
}

#[derive(Subcommand)]
enum SchemaCommands {
    /// Create a new up/down migration pair
    Create {
        /// Migration name
        name: String,

        /// Do not add a depends_on line for the latest migration
        #[arg(long)]
        no_depends: bool,
    },

    /// Apply pending migrations
    Up {
        /// Apply only up to and including this version
        #[arg(long)]
        target: Option<Version>,

        /// Show the plan without touching the database
        #[arg(long)]
        dry_run: bool,

        /// Skip checksum validation of applied migrations
        #[arg(long)]
        force: bool,
    },

    /// Roll back applied migrations
    Down {
        /// Number of migrations to roll back (default 1)
        #[arg(long, conflicts_with_all = ["target", "only"])]
        steps: Option<usize>,

        /// Roll back everything applied after this version
        #[arg(long, conflicts_with = "only")]
        target: Option<Version>,

        /// Roll back exactly this version
        #[arg(long)]
        only: Option<Version>,

        /// Show the plan without touching the database
        #[arg(long)]
        dry_run: bool,

        /// Skip checksum validation of the selected migrations
        #[arg(long)]
        force: bool,
    },

    /// Show applied and pending migrations
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the dependency graph
    Deps {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Compare applied checksums with the files on disk
    Verify {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum FixturesCommands {
    /// Load fixture files, or every discovered fixture when none are given
    Load {
        paths: Vec<PathBuf>,

        /// Target database URL (defaults to the configured one)
        #[arg(long)]
        database: Option<String>,
    },
}

#[derive(Subcommand)]
enum TestDbCommands {
    /// Create an empty test database, optionally from a template
    Create {
        #[arg(long)]
        template: Option<String>,
    },

    /// List test databases on the server
    List,

    /// Drop every test database
    Cleanup,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_logging(
        LoggingConfig::default()
            .with_level(&cli.log_level)
            .with_json(cli.json_logs)
            .with_service("pgfast"),
    )
    .map_err(|e| anyhow::anyhow!("failed to initialize logging: {}", e))?;

    let options = GlobalOptions {
        database_url: cli.database_url,
        migrations_dirs: cli.migrations_dirs,
        config: cli.config,
    };

    match cli.command {
        Commands::Init => {
            commands::init::run(&options.resolve()?)?;
        }
        Commands::Schema { schema_command } => match schema_command {
            SchemaCommands::Create { name, no_depends } => {
                commands::schema::create(&options.resolve()?, &name, no_depends)?;
            }
            SchemaCommands::Up { target, dry_run, force } => {
                let engine = options.engine().await?;
                let result = commands::schema::up(&engine, UpOptions { target, dry_run, force }).await;
                commands::close_after(engine, result).await?;
            }
            SchemaCommands::Down {
                steps,
                target,
                only,
                dry_run,
                force,
            } => {
                let engine = options.engine().await?;
                let target = commands::schema::down_target(steps, target, only);
                let result = commands::schema::down(&engine, DownOptions { target, dry_run, force }).await;
                commands::close_after(engine, result).await?;
            }
            SchemaCommands::Status { json } => {
                let engine = options.engine().await?;
                let result = commands::schema::status(&engine, json).await;
                commands::close_after(engine, result).await?;
            }
            SchemaCommands::Deps { json } => {
                let engine = options.engine().await?;
                let result = commands::schema::deps(&engine, json).await;
                commands::close_after(engine, result).await?;
            }
            SchemaCommands::Verify { json } => {
                let engine = options.engine().await?;
                let result = commands::schema::verify(&engine, json).await;
                commands::close_after(engine, result).await?;
            }
        },
        Commands::Fixtures { fixtures_command } => match fixtures_command {
            FixturesCommands::Load { paths, database } => {
                let options = GlobalOptions {
                    database_url: database.or(options.database_url),
                    ..options
                };
                commands::fixtures::load(&options.database_config()?, &paths).await?;
            }
        },
        Commands::TestDb { test_db_command } => {
            let config = options.database_config()?;
            match test_db_command {
                TestDbCommands::Create { template } => {
                    commands::test_db::create(config, template.as_deref()).await?
                }
                TestDbCommands::List => commands::test_db::list(config).await?,
                TestDbCommands::Cleanup => commands::test_db::cleanup(config).await?,
            }
        }
    }

    Ok(())
}
