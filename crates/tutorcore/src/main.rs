use std::env;
use std::fmt;
use std::fs;
use std::io::{self, IsTerminal, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::{ArgGroup, Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use config::{Config, Environment, File, FileFormat};
use log::{LevelFilter, debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use tutorcore::TutorCore;
use tutorcore::UserKey;
use tutorcore::account::ResetOptions;
use tutorcore::bots::{BotDirectory, BotRegistry};
use tutorcore::catalog::{NewMinutePackage, NewTariffPlan};
use tutorcore::config::{BillingConfig, BotEntry};
use tutorcore::db::{self, Database};
use tutorcore::payments::PaymentEvent;
use tutorcore::subscription::{self, TrialOutcome};

const APP_NAME: &str = "tutorcore";

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn async_main(ctx: RuntimeContext, command: Command) -> Result<()> {
    let core = ctx.open_core().await?;
    match command {
        Command::Sweep(cmd) => handle_sweep(&ctx, &core, cmd).await,
        Command::Status(user) => handle_status(&ctx, &core, user).await,
        Command::Subscribe(cmd) => handle_subscribe(&ctx, &core, cmd).await,
        Command::Activate(cmd) => handle_activate(&ctx, &core, cmd).await,
        Command::Trial(user) => handle_trial(&ctx, &core, user).await,
        Command::Minutes { command } => handle_minutes(&ctx, &core, command).await,
        Command::Reconcile(cmd) => handle_reconcile(&ctx, &core, cmd).await,
        Command::History { command } => handle_history(&ctx, &core, command).await,
        Command::Reset(cmd) => handle_reset(&ctx, &core, cmd).await,
        Command::Catalog { command } => handle_catalog(&ctx, &core, command).await,
        Command::Subscriptions => handle_subscriptions(&ctx, &core).await,
        Command::Init(_) | Command::Config { .. } | Command::Completions { .. } => {
            Err(anyhow!("command does not need the database"))
        }
    }
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();

    let ctx = RuntimeContext::new(cli.common.clone())?;
    ctx.init_logging()?;
    debug!("resolved paths: {}", ctx.paths);

    match cli.command {
        Command::Init(cmd) => handle_init(&ctx, cmd),
        Command::Config { command } => handle_config(&ctx, command),
        Command::Completions { shell } => handle_completions(shell),
        command => async_main(ctx, command),
    }
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Tutorcore - subscription, metering and history core for tutoring bots.",
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
    /// Do not change anything on disk
    #[arg(long = "dry-run", global = true)]
    dry_run: bool,
    /// Assume "yes" for interactive prompts
    #[arg(short = 'y', long = "yes", global = true)]
    assume_yes: bool,
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
    /// Expire stale pending and lapsed subscriptions on a fixed interval
    Sweep(SweepCommand),
    /// Show a user's subscription status and balance
    Status(UserArgs),
    /// Put a user into pending for a plan (free plans activate at once)
    Subscribe(SubscribeCommand),
    /// Confirm payment for a pending subscription
    Activate(ActivateCommand),
    /// Grant the bot's one-time trial
    Trial(UserArgs),
    /// Inspect and change voice-minute balances
    Minutes {
        #[command(subcommand)]
        command: MinutesCommand,
    },
    /// Apply confirmed payment events from a JSON file or stdin
    Reconcile(ReconcileCommand),
    /// Inspect and clear conversation history
    History {
        #[command(subcommand)]
        command: HistoryCommand,
    },
    /// Reset a user's settings
    Reset(ResetCommand),
    /// Manage tariff plans and minute packages
    Catalog {
        #[command(subcommand)]
        command: CatalogCommand,
    },
    /// List every subscription record
    Subscriptions,
    /// Create config directories and default files
    Init(InitCommand),
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
struct UserArgs {
    /// Bot id
    #[arg(long)]
    bot: String,
    /// Telegram user id
    #[arg(long, allow_negative_numbers = true)]
    user: i64,
}

#[derive(Debug, Clone, Args)]
struct SweepCommand {
    /// Run a single pass and exit
    #[arg(long)]
    once: bool,
}

#[derive(Debug, Clone, Args)]
struct SubscribeCommand {
    #[command(flatten)]
    user: UserArgs,
    /// Plan code in the bot's catalog
    #[arg(long)]
    plan: String,
    /// Provider payment id of the checkout
    #[arg(long)]
    payment_id: Option<String>,
}

#[derive(Debug, Clone, Args)]
#[command(group(ArgGroup::new("target").required(true).args(["payment_id", "bot"])))]
struct ActivateCommand {
    /// Provider payment id the subscription was created with
    #[arg(long)]
    payment_id: Option<String>,
    /// Bot id
    #[arg(long, requires = "user")]
    bot: Option<String>,
    /// Telegram user id
    #[arg(long, requires = "bot", allow_negative_numbers = true)]
    user: Option<i64>,
}

#[derive(Debug, Subcommand)]
enum MinutesCommand {
    /// Show the balance
    Balance(UserArgs),
    /// Credit minutes
    Add(MinutesAmountCommand),
    /// Deduct minutes if the balance covers them
    Use(MinutesAmountCommand),
}

#[derive(Debug, Clone, Args)]
struct MinutesAmountCommand {
    #[command(flatten)]
    user: UserArgs,
    /// Number of minutes
    amount: f64,
}

#[derive(Debug, Clone, Args)]
struct ReconcileCommand {
    /// JSON file with one event or an array of events ("-" for stdin)
    #[arg(value_name = "FILE")]
    input: String,
}

#[derive(Debug, Subcommand)]
enum HistoryCommand {
    /// Print a user's history
    Show(HistoryShowCommand),
    /// List users that have history
    Users,
    /// Delete a user's history in one bot
    Clear(UserArgs),
}

#[derive(Debug, Clone, Args)]
struct HistoryShowCommand {
    #[command(flatten)]
    user: UserArgs,
    /// Only the window that fits the character budget
    #[arg(long, conflicts_with = "last")]
    bounded: bool,
    /// Character budget for --bounded (defaults to billing.history_max_chars)
    #[arg(long, requires = "bounded")]
    max_chars: Option<usize>,
    /// Only the N most recent entries
    #[arg(long, value_name = "N")]
    last: Option<u32>,
}

#[derive(Debug, Clone, Args)]
struct ResetCommand {
    #[command(flatten)]
    user: UserArgs,
    /// Also revoke the trial grant
    #[arg(long)]
    with_trial: bool,
    /// Also delete the conversation history
    #[arg(long)]
    with_history: bool,
}

#[derive(Debug, Subcommand)]
enum CatalogCommand {
    /// List tariff plans
    Plans(CatalogFilter),
    /// Add a tariff plan
    AddPlan(AddPlanCommand),
    /// List minute packages
    Packages(CatalogFilter),
    /// Add a minute package
    AddPackage(AddPackageCommand),
    /// Enable or retire a minute package
    SetPackageActive(SetPackageActiveCommand),
}

#[derive(Debug, Clone, Args)]
struct CatalogFilter {
    /// Only this bot
    #[arg(long)]
    bot: Option<String>,
}

#[derive(Debug, Clone, Args)]
struct AddPlanCommand {
    #[arg(long)]
    bot: String,
    #[arg(long)]
    code: String,
    #[arg(long)]
    name: String,
    #[arg(long, default_value = "0")]
    price: f64,
    /// Length of one period in minutes (0 = open-ended)
    #[arg(long, default_value = "0")]
    duration_minutes: i64,
    /// Voice minutes credited on activation
    #[arg(long, default_value = "0")]
    voice_minutes: f64,
    /// Mark as the bot's trial plan
    #[arg(long)]
    trial: bool,
    #[arg(long, default_value = "")]
    description: String,
}

#[derive(Debug, Clone, Args)]
struct AddPackageCommand {
    #[arg(long)]
    bot: String,
    #[arg(long)]
    name: String,
    #[arg(long)]
    minutes: i64,
    #[arg(long)]
    price: f64,
    /// Create the package retired
    #[arg(long)]
    inactive: bool,
}

#[derive(Debug, Clone, Args)]
struct SetPackageActiveCommand {
    #[arg(long)]
    bot: String,
    #[arg(long)]
    id: i64,
    #[arg(long, action = clap::ArgAction::Set)]
    active: bool,
}

#[derive(Debug, Clone, Args)]
struct InitCommand {
    /// Recreate configuration even if it already exists
    #[arg(long = "force")]
    force: bool,
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
    config: AppConfig,
}

impl RuntimeContext {
    fn new(common: CommonOpts) -> Result<Self> {
        let mut paths = AppPaths::discover(common.config.clone())?;
        let config = load_or_init_config(&mut paths, &common)?;
        let paths = paths.apply_overrides(&config)?;
        let ctx = Self {
            common,
            paths,
            config,
        };
        ctx.ensure_directories()?;
        Ok(ctx)
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
            .unwrap_or_else(|_| EnvFilter::new(format!("tutorcore={level},sqlx=warn")));

        // Machine-readable output keeps logs on stderr as JSON.
        if self.common.json {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json().with_writer(io::stderr))
                .try_init()
                .ok();
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
                .ok();
        }

        // Also init env_logger for compatibility with log crate users
        let mut builder = env_logger::Builder::from_env(
            env_logger::Env::default().default_filter_or(self.config.logging.level.as_str()),
        );
        builder.filter_level(self.effective_log_level());
        builder.try_init().ok();

        Ok(())
    }

    fn effective_log_level(&self) -> LevelFilter {
        if self.common.trace {
            LevelFilter::Trace
        } else if self.common.debug {
            LevelFilter::Debug
        } else {
            match self.common.verbose {
                0 => self
                    .config
                    .logging
                    .level
                    .parse()
                    .unwrap_or(LevelFilter::Info),
                1 => LevelFilter::Debug,
                _ => LevelFilter::Trace,
            }
        }
    }

    fn ensure_directories(&self) -> Result<()> {
        if self.common.dry_run {
            info!(
                "dry-run: would ensure data dir {} and state dir {}",
                self.paths.data_dir.display(),
                self.paths.state_dir.display()
            );
            return Ok(());
        }

        fs::create_dir_all(&self.paths.data_dir).with_context(|| {
            format!("creating data directory {}", self.paths.data_dir.display())
        })?;
        fs::create_dir_all(&self.paths.state_dir).with_context(|| {
            format!(
                "creating state directory {}",
                self.paths.state_dir.display()
            )
        })?;
        Ok(())
    }

    fn database_path(&self) -> Result<PathBuf> {
        match self.config.database.path {
            Some(ref path) => expand_str_path(path),
            None => Ok(self.paths.data_dir.join(&self.config.database.file)),
        }
    }

    async fn open_core(&self) -> Result<TutorCore> {
        let db_path = self.database_path()?;
        let database = Database::new(&db_path)
            .await
            .with_context(|| format!("opening database {}", db_path.display()))?;
        let registry =
            BotRegistry::from_entries(&self.config.bots).context("building bot registry")?;
        if registry.is_empty() {
            warn!("no bots configured; payment events will be rejected");
        }
        Ok(TutorCore::new(
            &database,
            self.config.billing.clone(),
            Arc::new(BotDirectory::new(registry)),
        ))
    }

    async fn user_key(&self, core: &TutorCore, user: &UserArgs) -> Result<UserKey> {
        let key = UserKey::new(user.bot.as_str(), user.user)?;
        if !core.bots.snapshot().await.contains(&key.bot_id) {
            warn!("bot '{}' is not in the configured bot list", key.bot_id);
        }
        Ok(key)
    }

    fn dry_run(&self, action: impl fmt::Display) -> bool {
        if self.common.dry_run {
            info!("dry-run: would {action}");
        }
        self.common.dry_run
    }

    /// Print `value` as JSON/YAML when asked, otherwise the human text.
    fn emit<T: Serialize>(&self, value: &T, human: impl FnOnce() -> String) -> Result<()> {
        let output = if self.common.json {
            serde_json::to_string_pretty(value).context("serializing output to JSON")?
        } else if self.common.yaml {
            serde_yaml::to_string(value).context("serializing output to YAML")?
        } else {
            human()
        };
        println!("{output}");
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct AppPaths {
    config_file: PathBuf,
    data_dir: PathBuf,
    state_dir: PathBuf,
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

        let data_dir = default_data_dir()?;
        let state_dir = default_state_dir()?;

        Ok(Self {
            config_file,
            data_dir,
            state_dir,
        })
    }

    fn apply_overrides(mut self, cfg: &AppConfig) -> Result<Self> {
        if let Some(ref data_override) = cfg.paths.data_dir {
            self.data_dir = expand_str_path(data_override)?;
        }
        if let Some(ref state_override) = cfg.paths.state_dir {
            self.state_dir = expand_str_path(state_override)?;
        }
        Ok(self)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct AppConfig {
    bots: Vec<BotEntry>,
    logging: LoggingConfig,
    paths: PathsConfig,
    database: DatabaseConfig,
    billing: BillingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct LoggingConfig {
    level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
struct PathsConfig {
    data_dir: Option<String>,
    state_dir: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct DatabaseConfig {
    /// File name inside the data directory.
    file: String,
    /// Full path, overriding `file`.
    path: Option<String>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            file: format!("{APP_NAME}.db"),
            path: None,
        }
    }
}

async fn handle_sweep(ctx: &RuntimeContext, core: &TutorCore, cmd: SweepCommand) -> Result<()> {
    let billing = &core.billing;
    if cmd.once {
        if ctx.dry_run("run one sweep pass") {
            return Ok(());
        }
        let report = core.subscriptions.sweep_once(billing.pending_ttl()).await?;
        return ctx.emit(&report, || {
            format!(
                "Expired {} stale pending and {} lapsed subscription(s)",
                report.expired_pending, report.lapsed
            )
        });
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = tokio::spawn(subscription::run_sweeper(
        core.subscriptions.clone(),
        billing.sweep_interval(),
        billing.pending_ttl(),
        shutdown_rx,
    ));

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutdown requested, stopping sweeper");
    let _ = shutdown_tx.send(true);
    sweeper.await.context("joining sweeper task")?;
    Ok(())
}

async fn handle_status(ctx: &RuntimeContext, core: &TutorCore, user: UserArgs) -> Result<()> {
    let key = ctx.user_key(core, &user).await?;
    let record = core.subscriptions.get(&key).await?;
    let status = core.subscriptions.get_status(&key).await?;
    let trial_claimed = core.trials.has_claimed(&key).await?;

    let output = serde_json::json!({
        "key": key,
        "status": status,
        "has_access": status.has_access(),
        "trial_claimed": trial_claimed,
        "subscription": record,
    });
    ctx.emit(&output, || match record {
        Some(ref record) => format!("{} (trial claimed: {trial_claimed})", record.summary()),
        None => format!("{key} none (trial claimed: {trial_claimed})"),
    })
}

async fn handle_subscribe(
    ctx: &RuntimeContext,
    core: &TutorCore,
    cmd: SubscribeCommand,
) -> Result<()> {
    let key = ctx.user_key(core, &cmd.user).await?;
    if ctx.dry_run(format!("subscribe {key} to plan '{}'", cmd.plan)) {
        return Ok(());
    }
    let record = core
        .subscriptions
        .create(&key, &cmd.plan, cmd.payment_id.as_deref())
        .await?;
    ctx.emit(&record, || record.summary())
}

async fn handle_activate(
    ctx: &RuntimeContext,
    core: &TutorCore,
    cmd: ActivateCommand,
) -> Result<()> {
    let outcome = match (cmd.payment_id, cmd.bot, cmd.user) {
        (Some(payment_id), _, _) => {
            if ctx.dry_run(format!("activate payment '{payment_id}'")) {
                return Ok(());
            }
            core.subscriptions.activate_by_payment(&payment_id).await?
        }
        (None, Some(bot), Some(user)) => {
            let key = ctx.user_key(core, &UserArgs { bot, user }).await?;
            if ctx.dry_run(format!("activate {key}")) {
                return Ok(());
            }
            core.subscriptions.activate(&key).await?
        }
        _ => return Err(anyhow!("either --payment-id or --bot with --user is required")),
    };
    ctx.emit(&outcome, || format!("{outcome:?}"))
}

async fn handle_trial(ctx: &RuntimeContext, core: &TutorCore, user: UserArgs) -> Result<()> {
    let key = ctx.user_key(core, &user).await?;
    if ctx.dry_run(format!("grant a trial to {key}")) {
        return Ok(());
    }
    let outcome = core.subscriptions.start_trial(&key).await?;
    ctx.emit(&outcome, || match outcome {
        TrialOutcome::Granted(ref record) => format!("Trial granted: {}", record.summary()),
        TrialOutcome::AlreadyClaimed => format!("{key} already used the trial"),
    })
}

async fn handle_minutes(
    ctx: &RuntimeContext,
    core: &TutorCore,
    command: MinutesCommand,
) -> Result<()> {
    match command {
        MinutesCommand::Balance(user) => {
            let key = ctx.user_key(core, &user).await?;
            let balance = core.meter.balance(&key).await?;
            ctx.emit(&serde_json::json!({ "key": key, "balance": balance }), || {
                match balance {
                    Some(balance) => format!("{key}: {balance:.2} minutes"),
                    None => format!("{key}: no subscription record"),
                }
            })
        }
        MinutesCommand::Add(cmd) => {
            let key = ctx.user_key(core, &cmd.user).await?;
            if ctx.dry_run(format!("credit {} minutes to {key}", cmd.amount)) {
                return Ok(());
            }
            let balance = core.meter.add_minutes(&key, cmd.amount).await?;
            ctx.emit(&serde_json::json!({ "key": key, "balance": balance }), || {
                format!("{key}: balance now {balance:.2} minutes")
            })
        }
        MinutesCommand::Use(cmd) => {
            let key = ctx.user_key(core, &cmd.user).await?;
            if ctx.dry_run(format!("deduct {} minutes from {key}", cmd.amount)) {
                return Ok(());
            }
            let granted = core.meter.use_voice_minutes(&key, cmd.amount).await?;
            let balance = core.meter.balance(&key).await?;
            ctx.emit(
                &serde_json::json!({ "key": key, "granted": granted, "balance": balance }),
                || {
                    let verdict = if granted { "granted" } else { "declined" };
                    format!(
                        "{key}: deduction of {} {verdict}, balance {:.2}",
                        cmd.amount,
                        balance.unwrap_or(0.0)
                    )
                },
            )
        }
    }
}

async fn handle_reconcile(
    ctx: &RuntimeContext,
    core: &TutorCore,
    cmd: ReconcileCommand,
) -> Result<()> {
    let raw = if cmd.input == "-" {
        let mut buffer = String::new();
        io::stdin()
            .read_to_string(&mut buffer)
            .context("reading payment events from stdin")?;
        buffer
    } else {
        fs::read_to_string(&cmd.input)
            .with_context(|| format!("reading payment events from {}", cmd.input))?
    };

    let events = parse_events(&raw)?;
    if ctx.dry_run(format!("reconcile {} payment event(s)", events.len())) {
        return Ok(());
    }

    let mut results = Vec::with_capacity(events.len());
    let mut failures = 0;
    for event in &events {
        match core.reconciler.on_payment_confirmed(event).await {
            Ok(outcome) => results.push(serde_json::json!({
                "provider_payment_id": event.provider_payment_id,
                "result": outcome,
            })),
            Err(err) => {
                failures += 1;
                warn!("payment {} failed: {}", event.provider_payment_id, err);
                results.push(serde_json::json!({
                    "provider_payment_id": event.provider_payment_id,
                    "error": err.to_string(),
                    "retryable": err.is_transient(),
                }));
            }
        }
    }

    ctx.emit(&results, || {
        results
            .iter()
            .map(|r| r.to_string())
            .collect::<Vec<_>>()
            .join("\n")
    })?;

    if failures > 0 {
        return Err(anyhow!("{failures} of {} payment event(s) failed", events.len()));
    }
    Ok(())
}

/// Accept a single event object or an array of them.
fn parse_events(raw: &str) -> Result<Vec<PaymentEvent>> {
    let value: serde_json::Value = serde_json::from_str(raw).context("parsing payment events")?;
    if value.is_array() {
        serde_json::from_value(value).context("decoding payment event list")
    } else {
        Ok(vec![serde_json::from_value(value).context("decoding payment event")?])
    }
}

async fn handle_history(
    ctx: &RuntimeContext,
    core: &TutorCore,
    command: HistoryCommand,
) -> Result<()> {
    match command {
        HistoryCommand::Show(cmd) => {
            let key = ctx.user_key(core, &cmd.user).await?;
            let entries = if let Some(n) = cmd.last {
                core.history.get_last_n(&key, n).await?
            } else if cmd.bounded {
                core.history.get_bounded(&key, cmd.max_chars).await?
            } else {
                core.history.get_full(&key).await?
            };
            ctx.emit(&entries, || {
                entries
                    .iter()
                    .map(|e| {
                        let body = e
                            .text_content
                            .as_deref()
                            .or(e.image_url.as_deref())
                            .unwrap_or_default();
                        format!("[{}] {} ({}): {}", db::format_ms(e.created_at), e.role, e.kind, body)
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            })
        }
        HistoryCommand::Users => {
            let users = core.history.list_users().await?;
            ctx.emit(&users, || {
                users
                    .iter()
                    .map(|u| format!("{:<16} {}", u.telegram_id, u.bot_ids.join(", ")))
                    .collect::<Vec<_>>()
                    .join("\n")
            })
        }
        HistoryCommand::Clear(user) => {
            let key = ctx.user_key(core, &user).await?;
            if ctx.dry_run(format!("clear history of {key}")) {
                return Ok(());
            }
            let deleted = core.history.clear_user(&key).await?;
            ctx.emit(&serde_json::json!({ "key": key, "deleted": deleted }), || {
                format!("Deleted {deleted} history entries of {key}")
            })
        }
    }
}

async fn handle_reset(ctx: &RuntimeContext, core: &TutorCore, cmd: ResetCommand) -> Result<()> {
    let key = ctx.user_key(core, &cmd.user).await?;
    if ctx.dry_run(format!("reset settings of {key}")) {
        return Ok(());
    }
    let report = core
        .accounts
        .reset_settings(
            &key,
            ResetOptions {
                with_trial: cmd.with_trial,
                with_history: cmd.with_history,
            },
        )
        .await?;
    ctx.emit(&report, || {
        format!(
            "{key}: subscription deleted: {}, trial revoked: {}, history entries deleted: {}",
            report.subscription_deleted, report.trial_revoked, report.history_deleted
        )
    })
}

async fn handle_catalog(
    ctx: &RuntimeContext,
    core: &TutorCore,
    command: CatalogCommand,
) -> Result<()> {
    match command {
        CatalogCommand::Plans(filter) => {
            let plans = core.catalog.list_plans(filter.bot.as_deref()).await?;
            ctx.emit(&plans, || {
                let mut lines = vec![format!(
                    "{:<6} {:<12} {:<12} {:>10} {:>10} {:>8} {}",
                    "ID", "BOT", "CODE", "PRICE", "DURATION", "MINUTES", "TRIAL"
                )];
                lines.push("-".repeat(70));
                for p in &plans {
                    lines.push(format!(
                        "{:<6} {:<12} {:<12} {:>10.2} {:>10} {:>8.1} {}",
                        p.id,
                        p.bot_id,
                        p.code,
                        p.price,
                        p.duration_minutes,
                        p.voice_minutes,
                        if p.is_trial { "yes" } else { "no" }
                    ));
                }
                lines.join("\n")
            })
        }
        CatalogCommand::AddPlan(cmd) => {
            if ctx.dry_run(format!("add plan '{}' to bot '{}'", cmd.code, cmd.bot)) {
                return Ok(());
            }
            let plan = core
                .catalog
                .create_plan(NewTariffPlan {
                    bot_id: cmd.bot,
                    code: cmd.code,
                    name: cmd.name,
                    price: cmd.price,
                    duration_minutes: cmd.duration_minutes,
                    voice_minutes: cmd.voice_minutes,
                    is_trial: cmd.trial,
                    description: cmd.description,
                })
                .await?;
            ctx.emit(&plan, || format!("Created plan {} ({})", plan.id, plan.code))
        }
        CatalogCommand::Packages(filter) => {
            let packages = core.catalog.list_packages(filter.bot.as_deref()).await?;
            ctx.emit(&packages, || {
                let mut lines = vec![format!(
                    "{:<6} {:<12} {:<20} {:>8} {:>10} {}",
                    "ID", "BOT", "NAME", "MINUTES", "PRICE", "ACTIVE"
                )];
                lines.push("-".repeat(70));
                for p in &packages {
                    lines.push(format!(
                        "{:<6} {:<12} {:<20} {:>8} {:>10.2} {}",
                        p.id,
                        p.bot_id,
                        p.name,
                        p.minutes,
                        p.price,
                        if p.active { "yes" } else { "no" }
                    ));
                }
                lines.join("\n")
            })
        }
        CatalogCommand::AddPackage(cmd) => {
            if ctx.dry_run(format!("add package '{}' to bot '{}'", cmd.name, cmd.bot)) {
                return Ok(());
            }
            let package = core
                .catalog
                .create_package(NewMinutePackage {
                    bot_id: cmd.bot,
                    name: cmd.name,
                    minutes: cmd.minutes,
                    price: cmd.price,
                    active: !cmd.inactive,
                })
                .await?;
            ctx.emit(&package, || {
                format!("Created package {} ({} minutes)", package.id, package.minutes)
            })
        }
        CatalogCommand::SetPackageActive(cmd) => {
            if ctx.dry_run(format!("set package {} active={}", cmd.id, cmd.active)) {
                return Ok(());
            }
            let package = core
                .catalog
                .set_package_active(&cmd.bot, cmd.id, cmd.active)
                .await?;
            ctx.emit(&package, || {
                format!("Package {} active: {}", package.id, package.active)
            })
        }
    }
}

async fn handle_subscriptions(ctx: &RuntimeContext, core: &TutorCore) -> Result<()> {
    let records = core.subscriptions.list_all().await?;
    ctx.emit(&records, || {
        let mut lines: Vec<String> = records.iter().map(|r| r.summary()).collect();
        lines.push(format!("Total: {} subscriptions", records.len()));
        lines.join("\n")
    })
}

fn handle_init(ctx: &RuntimeContext, cmd: InitCommand) -> Result<()> {
    if ctx.paths.config_file.exists() && !(cmd.force || ctx.common.assume_yes) {
        return Err(anyhow!(
            "config already exists at {} (use --force to overwrite)",
            ctx.paths.config_file.display()
        ));
    }

    if ctx.common.dry_run {
        info!(
            "dry-run: would write default config to {}",
            ctx.paths.config_file.display()
        );
        return Ok(());
    }

    write_default_config(&ctx.paths.config_file)
}

fn handle_config(ctx: &RuntimeContext, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Show => ctx.emit(&ctx.config, || format!("{:#?}", ctx.config)),
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

fn load_or_init_config(paths: &mut AppPaths, common: &CommonOpts) -> Result<AppConfig> {
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

    let defaults = BillingConfig::default();
    let env_prefix = env_prefix();
    let built = Config::builder()
        .set_default("logging.level", "info")?
        .set_default("database.file", format!("{APP_NAME}.db"))?
        .set_default("billing.pending_ttl_secs", defaults.pending_ttl_secs as i64)?
        .set_default("billing.sweep_interval_secs", defaults.sweep_interval_secs as i64)?
        .set_default("billing.history_max_chars", defaults.history_max_chars as i64)?
        .add_source(
            File::from(paths.config_file.as_path())
                .format(FileFormat::Toml)
                .required(false),
        )
        .add_source(Environment::with_prefix(env_prefix.as_str()).separator("__"))
        .build()?;

    let config: AppConfig = built.try_deserialize()?;
    Ok(config)
}

fn write_default_config(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {parent:?}"))?;
    }

    let config = AppConfig::default();
    let toml = toml::to_string_pretty(&config).context("serializing default config to TOML")?;
    let mut body = default_config_header(path);
    body.push_str(&toml);
    body.push_str(DEFAULT_BOTS_HINT);
    fs::write(path, body).with_context(|| format!("writing config file to {}", path.display()))
}

const DEFAULT_BOTS_HINT: &str = r#"
# Bots accepted by payment reconciliation, e.g.
# [[bots]]
# id = "math"
# name = "Math Tutor"
"#;

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

fn default_state_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_STATE_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(mut dir) = dirs::state_dir() {
        dir.push(APP_NAME);
        return Ok(dir);
    }

    dirs::home_dir()
        .map(|home| home.join(".local").join("state").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine state directory"))
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

impl fmt::Display for AppPaths {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "config: {}, data: {}, state: {}",
            self.config_file.display(),
            self.data_dir.display(),
            self.state_dir.display()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_activate_requires_target() {
        assert!(Cli::try_parse_from([APP_NAME, "activate"]).is_err());
        assert!(Cli::try_parse_from([APP_NAME, "activate", "--bot", "math"]).is_err());
        assert!(Cli::try_parse_from([APP_NAME, "activate", "--payment-id", "pay-1"]).is_ok());
        assert!(
            Cli::try_parse_from([APP_NAME, "activate", "--bot", "math", "--user", "42"]).is_ok()
        );
    }

    #[test]
    fn test_default_config_round_trips_through_toml() {
        let body = toml::to_string_pretty(&AppConfig::default()).unwrap();
        let parsed: AppConfig = toml::from_str(&body).unwrap();
        assert_eq!(parsed.billing, BillingConfig::default());
        assert_eq!(parsed.database.file, "tutorcore.db");
        assert!(parsed.bots.is_empty());
    }

    #[test]
    fn test_parse_events_accepts_object_or_array() {
        let one = r#"{"provider_payment_id": "p1", "metadata": {"bot_id": "math"}}"#;
        assert_eq!(parse_events(one).unwrap().len(), 1);

        let many = r#"[{"provider_payment_id": "p1"}, {"provider_payment_id": "p2"}]"#;
        let events = parse_events(many).unwrap();
        assert_eq!(events[1].provider_payment_id, "p2");

        assert!(parse_events("not json").is_err());
    }

    #[test]
    fn test_env_prefix() {
        assert_eq!(env_prefix(), "TUTORCORE");
    }
}
