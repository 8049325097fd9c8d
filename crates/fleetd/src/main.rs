use std::env;
use std::fmt;
use std::fs;
use std::io::{self, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use config::{Config, Environment, File, FileFormat};
use log::{LevelFilter, debug, info, warn};
use serde::Serialize;
use serde_json::Value;

use fleetd::FleetManager;
use fleetd::catalog::{Catalog, Vars, loader};
use fleetd::config::FleetConfig;
use fleetd::fixes::FixRequest;
use fleetd::shell::ssh::SshConnector;
use fleetd_protocol::{FixJobRecord, ReachabilityResult, TestRunResult};

const APP_NAME: &str = "fleetd";

/// Session id used by one-shot CLI commands.
const CLI_SESSION_ID: &str = "cli";

const FIX_POLL_INTERVAL: Duration = Duration::from_millis(250);
const EVICT_INTERVAL_SECS: u64 = 30;

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn async_main(ctx: RuntimeContext, command: Command) -> Result<()> {
    match command {
        Command::Serve(cmd) => handle_serve(&ctx, cmd).await,
        Command::Exec(cmd) => handle_exec(&ctx, cmd).await,
        Command::Test(cmd) => handle_test(&ctx, cmd).await,
        Command::Online(cmd) => handle_online(&ctx, cmd).await,
        Command::Fix(cmd) => handle_fix(&ctx, cmd).await,
        Command::Catalog { .. } | Command::Config { .. } | Command::Completions { .. } => {
            Err(anyhow!("command does not need the async runtime"))
        }
    }
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();

    let ctx = RuntimeContext::new(cli.common.clone())?;
    ctx.init_logging()?;
    debug!("resolved paths: {}", ctx.paths);

    match cli.command {
        Command::Catalog { command } => handle_catalog(&ctx, command),
        Command::Config { command } => handle_config(&ctx, command),
        Command::Completions { shell } => handle_completions(shell),
        command => async_main(ctx, command),
    }
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Fleetd - remote shells, tests, fixes and health monitoring for a robot fleet.",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Override the config file path
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    /// Override the catalog directory
    #[arg(long, value_name = "PATH", global = true)]
    catalog: Option<PathBuf>,
    /// Reduce output to only errors
    #[arg(short, long, action = clap::ArgAction::SetTrue, global = true)]
    quiet: bool,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Enable debug logging (equivalent to -vv)
    #[arg(long, global = true)]
    debug: bool,
    /// Enable trace logging (overrides other levels)
    #[arg(long, global = true)]
    trace: bool,
    /// Output machine readable JSON
    #[arg(long, global = true, conflicts_with = "yaml")]
    json: bool,
    /// Output machine readable YAML
    #[arg(long, global = true)]
    yaml: bool,
    /// Disable ANSI colors in output
    #[arg(long = "no-color", global = true, conflicts_with = "color")]
    no_color: bool,
    /// Control color output (auto, always, never)
    #[arg(long, value_enum, default_value_t = ColorOption::Auto, global = true)]
    color: ColorOption,
    /// Do not change anything on disk or on robots
    #[arg(long = "dry-run", global = true)]
    dry_run: bool,
    /// Maximum seconds to allow an operation to run
    #[arg(long = "timeout", value_name = "SECONDS", global = true)]
    timeout: Option<f64>,
    /// Override the degree of parallelism
    #[arg(long = "parallel", value_name = "N", global = true)]
    parallel: Option<usize>,
    /// Emit additional diagnostics for troubleshooting
    #[arg(long = "diagnostics", global = true)]
    diagnostics: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ColorOption {
    Auto,
    Always,
    Never,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the background monitor until interrupted
    Serve(ServeCommand),
    /// Run one command on a robot
    Exec(ExecCommand),
    /// Run a robot's tests
    Test(TestCommand),
    /// Check whether robots are reachable
    Online(OnlineCommand),
    /// Run a fix and wait for it to finish
    Fix(FixCommand),
    /// Inspect the robot and definition catalog
    Catalog {
        #[command(subcommand)]
        command: CatalogCommand,
    },
    /// Inspect and manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Debug, Clone, Args)]
struct ServeCommand {
    /// Do not start the background monitor
    #[arg(long = "no-monitor")]
    no_monitor: bool,
}

#[derive(Debug, Clone, Args)]
struct ExecCommand {
    /// Robot id
    robot: String,
    /// Command line to run
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

#[derive(Debug, Clone, Args)]
struct TestCommand {
    /// Robot id
    robot: String,
    /// Test id to run (repeatable). Runs every manual test when omitted.
    #[arg(long = "test", value_name = "ID")]
    tests: Vec<String>,
}

#[derive(Debug, Clone, Args)]
struct OnlineCommand {
    /// Robot ids. Checks every robot when omitted.
    robots: Vec<String>,
    /// Ignore cached probe results
    #[arg(long)]
    force: bool,
}

#[derive(Debug, Clone, Args)]
struct FixCommand {
    /// Robot id
    robot: String,
    /// Fix id
    fix: String,
    /// Fix parameter as KEY=VALUE (repeatable). VALUE is parsed as JSON when possible.
    #[arg(long = "param", value_name = "KEY=VALUE")]
    params: Vec<String>,
    /// Post-fix test id (repeatable). Replaces the fix's own list.
    #[arg(long = "post-test", value_name = "ID")]
    post_tests: Vec<String>,
}

#[derive(Debug, Subcommand)]
enum CatalogCommand {
    /// Load and validate the catalog
    Check,
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Output the effective configuration
    Show,
    /// Print the resolved config file path
    Path,
    /// Regenerate the default configuration file
    Reset,
}

#[derive(Debug, Clone)]
struct RuntimeContext {
    common: CommonOpts,
    paths: AppPaths,
    config: FleetConfig,
}

impl RuntimeContext {
    fn new(common: CommonOpts) -> Result<Self> {
        let mut paths = AppPaths::discover(common.config.clone())?;
        let config = load_or_init_config(&mut paths, &common)?;
        let paths = paths.apply_overrides(&config, common.catalog.clone())?;
        Ok(Self {
            common,
            paths,
            config,
        })
    }

    fn init_logging(&self) -> Result<()> {
        use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

        if self.common.quiet {
            log::set_max_level(LevelFilter::Off);
            return Ok(());
        }

        let level = match self.effective_log_level() {
            LevelFilter::Off => "off",
            LevelFilter::Error => "error",
            LevelFilter::Warn => "warn",
            LevelFilter::Info => "info",
            LevelFilter::Debug => "debug",
            LevelFilter::Trace => "trace",
        };

        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("fleetd={level},russh=warn")));

        let installed = if self.common.json {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json().with_writer(io::stderr))
                .try_init()
                .is_ok()
        } else {
            let force_color = matches!(self.common.color, ColorOption::Always)
                || env::var_os("FORCE_COLOR").is_some();
            let disable_color = self.common.no_color
                || matches!(self.common.color, ColorOption::Never)
                || env::var_os("NO_COLOR").is_some()
                || (!force_color && !io::stderr().is_terminal());

            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(io::stderr)
                        .with_ansi(!disable_color)
                        .with_target(self.common.diagnostics)
                        .with_file(self.common.diagnostics)
                        .with_line_number(self.common.diagnostics),
                )
                .try_init()
                .is_ok()
        };

        // The subscriber forwards `log` records itself; fall back to a
        // plain `log` backend only when it could not be installed.
        if !installed {
            let mut builder =
                env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
            builder.filter_level(self.effective_log_level());
            builder.try_init().ok();
        }

        Ok(())
    }

    fn effective_log_level(&self) -> LevelFilter {
        if self.common.trace {
            LevelFilter::Trace
        } else if self.common.debug {
            LevelFilter::Debug
        } else {
            match self.common.verbose {
                0 => LevelFilter::Warn,
                1 => LevelFilter::Info,
                2 => LevelFilter::Debug,
                _ => LevelFilter::Trace,
            }
        }
    }

    fn load_catalog(&self) -> Result<Catalog> {
        let dir = &self.paths.catalog_dir;
        loader::load_catalog(dir)
            .with_context(|| format!("loading catalog from {}", dir.display()))
    }

    fn manager(&self) -> Result<FleetManager> {
        let catalog = self.load_catalog()?;
        FleetManager::new(&self.config, catalog, Arc::new(SshConnector::new()))
            .context("initializing fleet core")
    }

    /// Print `value` as JSON or YAML when requested, otherwise run `human`.
    fn emit<T: Serialize>(&self, value: &T, human: impl FnOnce()) -> Result<()> {
        if self.common.json {
            println!(
                "{}",
                serde_json::to_string_pretty(value).context("serializing output to JSON")?
            );
        } else if self.common.yaml {
            print!(
                "{}",
                serde_yaml::to_string(value).context("serializing output to YAML")?
            );
        } else {
            human();
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct AppPaths {
    config_file: PathBuf,
    catalog_dir: PathBuf,
}

impl AppPaths {
    fn discover(override_path: Option<PathBuf>) -> Result<Self> {
        let config_file = match override_path {
            Some(path) => {
                let expanded = expand_path(path)?;
                if expanded.is_dir() {
                    expanded.join("config.toml")
                } else {
                    expanded
                }
            }
            None => default_config_dir()?.join("config.toml"),
        };

        if config_file.parent().is_none() {
            return Err(anyhow!("invalid config file path: {config_file:?}"));
        }

        Ok(Self {
            config_file,
            catalog_dir: default_data_dir()?.join("catalog"),
        })
    }

    fn apply_overrides(mut self, cfg: &FleetConfig, cli_catalog: Option<PathBuf>) -> Result<Self> {
        if let Some(dir) = cli_catalog {
            self.catalog_dir = expand_path(dir)?;
        } else if let Some(ref dir) = cfg.catalog.dir {
            self.catalog_dir = expand_str_path(dir)?;
        }
        Ok(self)
    }
}

impl fmt::Display for AppPaths {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "config: {}, catalog: {}",
            self.config_file.display(),
            self.catalog_dir.display()
        )
    }
}

// ============================================================================
// Commands
// ============================================================================

async fn handle_serve(ctx: &RuntimeContext, cmd: ServeCommand) -> Result<()> {
    let manager = ctx.manager()?;
    let catalog = manager.catalog();
    info!(
        "Loaded {} robot(s) from {}",
        catalog.robots().len(),
        ctx.paths.catalog_dir.display()
    );

    if ctx.config.monitor.enabled && !cmd.no_monitor {
        manager.start_monitor();
    } else {
        info!("Background monitor disabled");
    }

    let shutdown_signal = async {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for Ctrl+C: {e}");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    warn!("Failed to install SIGTERM handler: {e}");
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
    };
    tokio::pin!(shutdown_signal);

    let mut evict = tokio::time::interval(Duration::from_secs(EVICT_INTERVAL_SECS));
    loop {
        tokio::select! {
            _ = &mut shutdown_signal => break,
            _ = evict.tick() => manager.sessions().evict_idle().await,
        }
    }

    info!("Shutdown signal received, stopping monitor...");
    manager.shutdown().await;
    info!("Shutdown complete");
    Ok(())
}

async fn handle_exec(ctx: &RuntimeContext, cmd: ExecCommand) -> Result<()> {
    let manager = ctx.manager()?;
    let command = cmd.command.join(" ");
    if ctx.common.dry_run {
        info!("dry-run: would run '{command}' on {}", cmd.robot);
        return Ok(());
    }

    let output = manager
        .run_command(&cmd.robot, CLI_SESSION_ID, &command, ctx.common.timeout)
        .await;
    manager.shutdown().await;
    let output = output.with_context(|| format!("running command on {}", cmd.robot))?;

    #[derive(Serialize)]
    #[serde(rename_all = "camelCase")]
    struct ExecOutput<'a> {
        robot_id: &'a str,
        command: &'a str,
        output: &'a str,
    }
    ctx.emit(
        &ExecOutput {
            robot_id: &cmd.robot,
            command: &command,
            output: &output,
        },
        || println!("{output}"),
    )
}

async fn handle_test(ctx: &RuntimeContext, cmd: TestCommand) -> Result<()> {
    let manager = ctx.manager()?;
    let test_ids = (!cmd.tests.is_empty()).then_some(cmd.tests.as_slice());
    let results = manager
        .run_tests(&cmd.robot, None, test_ids, ctx.common.dry_run)
        .await;
    manager.shutdown().await;
    let results = results.with_context(|| format!("running tests on {}", cmd.robot))?;

    ctx.emit(&results, || print_test_results(&results))
}

async fn handle_online(ctx: &RuntimeContext, cmd: OnlineCommand) -> Result<()> {
    let manager = ctx.manager()?;
    let robot_ids = if cmd.robots.is_empty() {
        manager.catalog().robot_ids()
    } else {
        cmd.robots
    };
    let results = manager
        .check_online_batch(&robot_ids, ctx.common.timeout, cmd.force, ctx.common.parallel)
        .await;
    manager.shutdown().await;

    ctx.emit(&results, || print_reachability(&results))
}

async fn handle_fix(ctx: &RuntimeContext, cmd: FixCommand) -> Result<()> {
    let mut params = parse_params(&cmd.params)?;
    if !cmd.post_tests.is_empty() {
        params.insert("postTestIds".to_string(), Value::from(cmd.post_tests.clone()));
    }
    if ctx.common.dry_run {
        info!("dry-run: would run fix '{}' on {}", cmd.fix, cmd.robot);
        return Ok(());
    }

    let manager = ctx.manager()?;
    let record = manager
        .start_fix_job(FixRequest {
            robot_id: cmd.robot.clone(),
            fix_id: cmd.fix.clone(),
            client_session_id: None,
            params,
        })
        .with_context(|| format!("starting fix '{}' on {}", cmd.fix, cmd.robot))?;
    info!("Started fix run {}", record.run_id);

    let wait = async {
        loop {
            let current = manager.get_fix_job(&record.robot_id, &record.run_id)?;
            if current.status.is_terminal() {
                return Ok::<FixJobRecord, fleetd::FleetError>(current);
            }
            tokio::time::sleep(FIX_POLL_INTERVAL).await;
        }
    };
    let finished = match ctx.common.timeout {
        Some(limit) => tokio::time::timeout(Duration::from_secs_f64(limit.max(0.0)), wait)
            .await
            .map_err(|_| anyhow!("fix run {} did not finish in {limit}s", record.run_id))?,
        None => wait.await,
    };
    manager.shutdown().await;
    let finished = finished.context("polling fix run")?;

    ctx.emit(&finished, || print_fix_record(&finished))?;
    match finished.error {
        Some(error) => Err(anyhow!("fix '{}' failed: {error}", cmd.fix)),
        None => Ok(()),
    }
}

fn handle_catalog(ctx: &RuntimeContext, command: CatalogCommand) -> Result<()> {
    match command {
        CatalogCommand::Check => {
            let catalog = ctx.load_catalog()?;

            #[derive(Serialize)]
            #[serde(rename_all = "camelCase")]
            struct CatalogSummary {
                dir: String,
                robots: usize,
                command_primitives: usize,
                robot_ids: Vec<String>,
            }
            let summary = CatalogSummary {
                dir: ctx.paths.catalog_dir.display().to_string(),
                robots: catalog.robots().len(),
                command_primitives: catalog.primitives().len(),
                robot_ids: catalog.robot_ids(),
            };
            ctx.emit(&summary, || {
                println!("Catalog OK: {}", summary.dir);
                println!("  robots:             {}", summary.robots);
                println!("  command primitives: {}", summary.command_primitives);
            })
        }
    }
}

fn handle_config(ctx: &RuntimeContext, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Show => {
            if ctx.common.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&ctx.config)
                        .context("serializing config to JSON")?
                );
            } else if ctx.common.yaml {
                println!(
                    "{}",
                    serde_yaml::to_string(&ctx.config).context("serializing config to YAML")?
                );
            } else {
                println!("{:#?}", ctx.config);
            }
            Ok(())
        }
        ConfigCommand::Path => {
            println!("{}", ctx.paths.config_file.display());
            Ok(())
        }
        ConfigCommand::Reset => {
            if ctx.common.dry_run {
                info!(
                    "dry-run: would reset config at {}",
                    ctx.paths.config_file.display()
                );
                return Ok(());
            }
            write_default_config(&ctx.paths.config_file)
        }
    }
}

fn handle_completions(shell: Shell) -> Result<()> {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, APP_NAME, &mut io::stdout());
    Ok(())
}

// ============================================================================
// Output
// ============================================================================

fn print_test_results(results: &[TestRunResult]) {
    for result in results {
        println!(
            "{:<24} {:<8} {:<20} {}",
            result.id, result.status, result.value, result.details
        );
    }
}

fn print_reachability(results: &[ReachabilityResult]) {
    for result in results {
        println!(
            "{:<24} {:<8} {:>6}ms {}",
            result.robot_id, result.status, result.ms, result.details
        );
    }
}

fn print_fix_record(record: &FixJobRecord) {
    println!(
        "Fix {} on {}: {:?}",
        record.fix_id, record.robot_id, record.status
    );
    for event in &record.events {
        println!("  {} {:<20} {}", event.at.format("%H:%M:%S"), event.kind, event.message);
    }
    if let Some(test_run) = &record.test_run {
        print_test_results(&test_run.results);
    }
}

/// `KEY=VALUE` pairs into a parameter map.
fn parse_params(pairs: &[String]) -> Result<Vars> {
    let mut params = Vars::new();
    for pair in pairs {
        let (key, raw) = pair
            .split_once('=')
            .ok_or_else(|| anyhow!("invalid --param '{pair}', expected KEY=VALUE"))?;
        let key = key.trim();
        if key.is_empty() {
            return Err(anyhow!("invalid --param '{pair}', empty key"));
        }
        let value =
            serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        params.insert(key.to_string(), value);
    }
    Ok(params)
}

// ============================================================================
// Configuration
// ============================================================================

fn load_or_init_config(paths: &mut AppPaths, common: &CommonOpts) -> Result<FleetConfig> {
    if !paths.config_file.exists() {
        if common.dry_run {
            info!(
                "dry-run: would create default config at {}",
                paths.config_file.display()
            );
        } else {
            write_default_config(&paths.config_file)?;
        }
    }

    let env_prefix = env_prefix();
    let built = Config::builder()
        .add_source(
            File::from(paths.config_file.as_path())
                .format(FileFormat::Toml)
                .required(false),
        )
        .add_source(Environment::with_prefix(env_prefix.as_str()).separator("__"))
        .build()
        .with_context(|| format!("reading config {}", paths.config_file.display()))?;

    let config: FleetConfig = built
        .try_deserialize()
        .context("deserializing configuration")?;
    Ok(config)
}

fn write_default_config(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {parent:?}"))?;
    }

    let config = FleetConfig::default();
    let toml = toml::to_string_pretty(&config).context("serializing default config to TOML")?;
    let mut body = default_config_header(path);
    body.push_str(&toml);
    fs::write(path, body).with_context(|| format!("writing config file to {}", path.display()))
}

fn default_config_header(path: &Path) -> String {
    let mut buffer = String::new();
    buffer.push_str("# Configuration for ");
    buffer.push_str(APP_NAME);
    buffer.push('\n');
    buffer.push_str("# File: ");
    buffer.push_str(&path.display().to_string());
    buffer.push('\n');
    buffer.push('\n');
    buffer
}

fn expand_path(path: PathBuf) -> Result<PathBuf> {
    if let Some(text) = path.to_str() {
        expand_str_path(text)
    } else {
        Ok(path)
    }
}

fn expand_str_path(text: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(text).context("expanding path")?;
    Ok(PathBuf::from(expanded.to_string()))
}

fn default_config_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        let mut path = PathBuf::from(dir);
        path.push(APP_NAME);
        return Ok(path);
    }

    if let Some(mut dir) = dirs::config_dir() {
        dir.push(APP_NAME);
        return Ok(dir);
    }

    dirs::home_dir()
        .map(|home| home.join(".config").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine configuration directory"))
}

fn default_data_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_DATA_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(mut dir) = dirs::data_dir() {
        dir.push(APP_NAME);
        return Ok(dir);
    }

    dirs::home_dir()
        .map(|home| home.join(".local").join("share").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine data directory"))
}

fn env_prefix() -> String {
    APP_NAME
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logging_routes_log_records_through_tracing() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("config.toml");
        let catalog = dir.path().join("catalog");
        let cli = Cli::try_parse_from([
            "fleetd",
            "--config",
            config.to_str().unwrap(),
            "--catalog",
            catalog.to_str().unwrap(),
            "-v",
            "catalog",
            "check",
        ])
        .unwrap();

        let ctx = RuntimeContext::new(cli.common).unwrap();
        assert!(config.exists());
        ctx.init_logging().unwrap();

        assert!(tracing::dispatcher::has_been_set());
        // The `log` facade already belongs to the tracing bridge.
        assert!(env_logger::try_init().is_err());
    }
}
