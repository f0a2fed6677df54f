use std::env;
use std::fs;
use std::io::{self, IsTerminal};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use log::{LevelFilter, debug, error, info, warn};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use dockhand::api;
use dockhand::config::{
    APP_NAME, AppConfig, expand_str_path, resolve_config_path, write_default_config,
};
use dockhand::db::Database;
use dockhand::engine::{ContainerRuntime, EngineApi};
use dockhand::ops::{self, OperationOptions, Services};
use dockhand::registry::RegistryClient;
use dockhand::settings::{ProxyCell, ProxySetting, SettingsCell};
use dockhand::sync::{ContainerRecordRepository, ContainerSynchronizer};
use dockhand::ws::{MessageRouter, SessionRegistry};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Dockhand - real-time container engine control channel.",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    output: OutputOpts,
    /// Config file, or a directory containing config.toml
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct OutputOpts {
    /// Only log errors
    #[arg(short, long, global = true)]
    quiet: bool,
    /// More logging; repeat for trace
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Same as -v
    #[arg(long, global = true)]
    debug: bool,
    /// Same as -vv
    #[arg(long, global = true)]
    trace: bool,
    /// JSON log lines and JSON command output
    #[arg(long, global = true)]
    json: bool,
    /// Disable ANSI colors in log output
    #[arg(long = "no-color", global = true, conflicts_with = "color")]
    no_color: bool,
    #[arg(long, value_enum, default_value_t = ColorOption::Auto, global = true)]
    color: ColorOption,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ColorOption {
    Auto,
    Always,
    Never,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the control channel server
    Serve(ServeCommand),
    /// Write a config file with defaults
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Inspect or reset configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Reconcile the container mirror with the engine once and exit
    Sync,
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Debug, Clone, Args)]
struct ServeCommand {
    /// Address to bind (overrides server.host)
    #[arg(long, env = "DOCKHAND_HOST")]
    host: Option<String>,
    /// Port to bind (overrides server.port)
    #[arg(short, long, env = "DOCKHAND_PORT")]
    port: Option<u16>,
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Print the effective configuration
    Show,
    /// Print the config file path
    Path,
    /// Overwrite the config file with defaults
    Reset,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{e:?}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config_path = resolve_config_path(cli.config)?;

    // These work on the file itself and must not depend on its contents.
    match cli.command {
        Command::Init { force } => return init_config(&config_path, force),
        Command::Config {
            command: ConfigCommand::Path,
        } => {
            println!("{}", config_path.display());
            return Ok(());
        }
        Command::Config {
            command: ConfigCommand::Reset,
        } => return write_default_config(&config_path),
        Command::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), APP_NAME, &mut io::stdout());
            return Ok(());
        }
        _ => {}
    }

    if !config_path.exists() {
        write_default_config(&config_path)?;
    }
    let config = AppConfig::load(&config_path)?;
    init_logging(&cli.output, &config);
    debug!("config file: {}", config_path.display());

    match cli.command {
        Command::Serve(cmd) => serve(&config, cmd).await,
        Command::Sync => sync_once(&config, cli.output.json).await,
        Command::Config {
            command: ConfigCommand::Show,
        } => {
            if cli.output.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&config).context("serializing config")?
                );
            } else {
                println!("{config:#?}");
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

fn init_config(path: &std::path::Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!(
            "config already exists at {} (use --force to overwrite)",
            path.display()
        );
    }
    write_default_config(path)?;
    println!("Wrote {}", path.display());
    Ok(())
}

fn log_level(opts: &OutputOpts, config: &AppConfig) -> LevelFilter {
    if opts.quiet {
        return LevelFilter::Error;
    }
    match (opts.verbose, opts.debug, opts.trace) {
        (_, _, true) | (2.., _, _) => LevelFilter::Trace,
        (1, _, _) | (_, true, _) => LevelFilter::Debug,
        _ => config.logging.level.parse().unwrap_or(LevelFilter::Info),
    }
}

/// `tracing` for the HTTP stack, `env_logger` for everything that logs
/// through the `log` facade. `RUST_LOG` overrides both.
fn init_logging(opts: &OutputOpts, config: &AppConfig) {
    use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

    let level = log_level(opts, config);
    let directive = level.to_string().to_lowercase();
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("dockhand={directive},tower_http={directive}"))
    });

    let ansi = match opts.color {
        _ if opts.no_color || env::var_os("NO_COLOR").is_some() => false,
        ColorOption::Always => true,
        ColorOption::Never => false,
        ColorOption::Auto => io::stderr().is_terminal(),
    };

    let registry = tracing_subscriber::registry().with(env_filter);
    if opts.json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
            .ok();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_ansi(ansi))
            .try_init()
            .ok();
    }

    let mut builder = env_logger::Builder::from_env(env_logger::Env::default());
    if env::var_os("RUST_LOG").is_none() {
        builder.filter_level(level);
    }
    if !ansi {
        builder.write_style(env_logger::WriteStyle::Never);
    }
    builder.try_init().ok();
}

/// Proxy and mirror settings from the `proxy` section; invalid values are
/// dropped with a warning rather than refusing to start.
fn proxy_cell(config: &AppConfig) -> ProxyCell {
    let setting = ProxySetting::new(config.proxy.url.clone())
        .with_mirrors(config.proxy.mirror_urls.clone());
    let setting = match setting.validate() {
        Ok(()) => setting,
        Err(e) => {
            warn!("Ignoring configured proxy settings: {}", e);
            ProxySetting::default()
        }
    };
    Arc::new(SettingsCell::new(setting))
}

fn engine_client(config: &AppConfig, proxy: ProxyCell) -> ContainerRuntime {
    let cfg = &config.engine;
    let runtime = match (cfg.runtime, &cfg.binary) {
        (Some(rt), Some(binary)) => ContainerRuntime::with_binary(rt, binary.clone()),
        (Some(rt), None) => ContainerRuntime::with_type(rt),
        (None, _) => ContainerRuntime::detect(),
    };
    let runtime = match cfg.socket_path.as_deref().map(expand_str_path) {
        Some(Ok(path)) => runtime.socket(path),
        Some(Err(e)) => {
            warn!("Ignoring engine socket path: {:#}", e);
            runtime
        }
        None => runtime,
    };
    runtime.proxy(proxy)
}

async fn open_database(config: &AppConfig) -> Result<Database> {
    let data_dir = config.paths.data_dir()?;
    fs::create_dir_all(&data_dir)
        .with_context(|| format!("creating data directory {}", data_dir.display()))?;
    let path = config.paths.database_path()?;
    info!("Database path: {}", path.display());
    Database::new(&path).await
}

async fn sync_once(config: &AppConfig, json: bool) -> Result<()> {
    let database = open_database(config).await?;
    let engine: Arc<dyn EngineApi> = Arc::new(engine_client(config, proxy_cell(config)));
    let sync = ContainerSynchronizer::new(
        engine,
        ContainerRecordRepository::new(database.pool().clone()),
    );

    let report = sync.sync().await.context("synchronizing containers")?;
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("serializing sync report")?
        );
    } else {
        println!(
            "{} on engine: {} inserted, {} updated, {} rebound, {} removed, {} duplicates",
            report.engine_containers,
            report.inserted,
            report.updated,
            report.rebound,
            report.removed,
            report.duplicates_removed
        );
    }
    Ok(())
}

async fn serve(config: &AppConfig, cmd: ServeCommand) -> Result<()> {
    let database = open_database(config).await?;

    let proxy = proxy_cell(config);
    let runtime = engine_client(config, proxy.clone());
    match runtime.health_check().await {
        Ok(version) => info!(
            "{} engine available: {}",
            runtime.runtime_type(),
            version.trim()
        ),
        Err(e) => warn!(
            "{} engine unavailable ({}); operations will fail until it is up",
            runtime.runtime_type(),
            e
        ),
    }
    let engine: Arc<dyn EngineApi> = Arc::new(runtime);

    let sessions = Arc::new(SessionRegistry::new(config.ws.session_buffer));
    let services = Arc::new(
        Services::new(
            engine,
            &database,
            Arc::new(RegistryClient::new(proxy.clone())),
            sessions,
        )
        .with_proxy(proxy.clone())
        .with_options(OperationOptions {
            stop_timeout_secs: config.engine.stop_timeout_secs,
            ..OperationOptions::default()
        }),
    );
    let router = MessageRouter::new(services.clone()).context("building message router")?;

    let shutdown = CancellationToken::new();
    let mut background: Vec<JoinHandle<()>> = vec![services.sync.clone().spawn_periodic(
        config.sync.initial_delay(),
        config.sync.interval(),
        shutdown.clone(),
    )];
    if let Some(interval) = config.sync.update_check_interval() {
        background.push(ops::image::spawn_update_checks(
            services.clone(),
            interval,
            shutdown.clone(),
        ));
    }
    if config.events.enabled {
        background.push(ops::events::spawn_event_watch(
            services.clone(),
            config.events.restart_delay(),
            shutdown.clone(),
        ));
    }

    let state = api::AppState::new(router, proxy)
        .with_ping_interval(config.ws_ping_interval())
        .with_cors_origins(config.server.cors_origins.clone());

    let host = cmd.host.unwrap_or_else(|| config.server.host.clone());
    let port = cmd.port.unwrap_or(config.server.port);
    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .with_context(|| format!("invalid listen address {host}:{port}"))?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!("Listening on http://{}", addr);

    let token = shutdown.clone();
    axum::serve(listener, api::create_router(state))
        .with_graceful_shutdown(async move {
            wait_for_signal().await;
            info!("Shutdown requested");
            token.cancel();
        })
        .await
        .context("running server")?;

    shutdown.cancel();
    for task in background {
        if let Err(e) = task.await {
            error!("Background task ended abnormally: {}", e);
        }
    }
    info!("Shutdown complete");
    Ok(())
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn serve_accepts_only_its_own_flags() {
        let cli = Cli::try_parse_from(["dockhand", "serve", "--port", "9000", "-v"]).unwrap();
        assert_eq!(cli.output.verbose, 1);
        assert!(matches!(cli.command, Command::Serve(ServeCommand { port: Some(9000), .. })));

        for flag in ["--dry-run", "--yes", "--yaml", "--diagnostics"] {
            assert!(Cli::try_parse_from(["dockhand", flag, "serve"]).is_err(), "{flag}");
        }
    }
}
