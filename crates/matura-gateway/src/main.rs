#![allow(clippy::print_stdout)] // CLI binary: stdout is the UI

mod advance;
mod cli;
mod config;
mod control;
mod dispatcher;
mod generator;
mod identity;
mod inbound;
mod pacing;
mod pair_loop;
mod supervisor;
mod sweep;
#[cfg(test)]
mod testkit;
mod tracing_setup;
mod webhook;

use anyhow::{Context, Result};
use clap::Parser;
use matura_agent::AnthropicProvider;
use matura_channels::{EvolutionChannel, loopback_pair};
use matura_core::{Channel, ChannelHealth, IdentityResolver, PairStore, Provider, ScriptSource};
use matura_store::SqliteStore;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::advance::Advancer;
use crate::cli::{Cli, Commands, PairCommands};
use crate::config::{ChannelKind, Config};
use crate::control::{NewPair, PairControl};
use crate::dispatcher::Dispatcher;
use crate::generator::ContentGenerator;
use crate::identity::ConfigDirectory;
use crate::inbound::ReplyListener;
use crate::pair_loop::LoopSettings;
use crate::supervisor::Supervisor;
use crate::sweep::Sweeper;
use crate::webhook::HookState;

/// How often the service looks for running pairs without a local loop.
const RECONCILE_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _tracing_guard = tracing_setup::init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = std::process::id(),
        "matura starting"
    );

    match cli.command {
        Commands::Start => cmd_start(cli.config.as_deref()).await,
        Commands::Sweep => cmd_sweep(cli.config.as_deref()).await,
        Commands::Pair { command } => cmd_pair(cli.config.as_deref(), command).await,
        Commands::Check => cmd_check(cli.config.as_deref()).await,
        Commands::Version => {
            println!("matura {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

/// Config plus the store and directory every command needs.
struct Base {
    config: Config,
    store: Arc<dyn PairStore>,
    directory: Arc<ConfigDirectory>,
}

impl Base {
    fn load(config_path: Option<&str>) -> Result<Self> {
        let config_file = Config::find_config_path(config_path);
        let config = Config::load(&config_file)
            .with_context(|| format!("loading config from {}", config_file.display()))?;
        let config_dir = config_dir(&config_file);

        let store_path = config.store_path(&config_dir);
        let store = SqliteStore::open(&store_path)
            .with_context(|| format!("opening pair store at {}", store_path.display()))?;
        info!(path = %store_path.display(), "pair store opened");

        let directory = Arc::new(ConfigDirectory::from_config(&config));
        Ok(Self {
            config,
            store: Arc::new(store),
            directory,
        })
    }

    fn identities(&self) -> Arc<dyn IdentityResolver> {
        Arc::clone(&self.directory) as Arc<dyn IdentityResolver>
    }

    fn scripts(&self) -> Arc<dyn ScriptSource> {
        Arc::clone(&self.directory) as Arc<dyn ScriptSource>
    }

    fn control(&self) -> PairControl {
        PairControl::new(Arc::clone(&self.store), self.identities(), self.scripts())
    }

    /// Control that can also advance and sweep pairs from this process.
    fn controlled_by(&self, drivers: &Drivers) -> PairControl {
        self.control().with_drivers(
            Arc::clone(&drivers.advancer),
            Arc::clone(&drivers.sweeper),
            self.config.lease.loop_ttl(),
        )
    }

    /// Build the provider, channel and advance machinery.
    fn drivers(&self) -> Result<Drivers> {
        let provider = build_provider(&self.config)?;
        let (channel, drain) = build_channel(&self.config)?;

        let generator = ContentGenerator::new(
            provider,
            self.scripts(),
            self.config.generation.clone(),
        );
        let dispatcher = Dispatcher::new(
            channel,
            self.identities(),
            self.config.dispatch.timeout(),
        );
        let advancer = Arc::new(Advancer::new(
            Arc::clone(&self.store),
            self.identities(),
            generator,
            dispatcher,
            &self.config.pacing,
        ));
        let sweeper = Arc::new(Sweeper::new(
            Arc::clone(&advancer),
            self.config.lease.sweep_ttl(),
        ));
        Ok(Drivers {
            advancer,
            sweeper,
            _drain: drain,
        })
    }
}

struct Drivers {
    advancer: Arc<Advancer>,
    sweeper: Arc<Sweeper>,
    /// Logs loopback sends; `None` for real channels.
    _drain: Option<JoinHandle<()>>,
}

fn config_dir(config_file: &Path) -> PathBuf {
    config_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf)
}

fn build_provider(config: &Config) -> Result<Arc<dyn Provider>> {
    anyhow::ensure!(
        config.provider.name == "anthropic",
        "only the 'anthropic' provider is supported (got '{}')",
        config.provider.name
    );
    let provider = AnthropicProvider::from_env(&config.provider.api_key_env, &config.provider.model)
        .context("failed to initialize Anthropic provider")?
        .with_max_tokens(config.provider.max_tokens);
    Ok(Arc::new(provider))
}

fn build_channel(config: &Config) -> Result<(Arc<dyn Channel>, Option<JoinHandle<()>>)> {
    match config.channel.kind {
        ChannelKind::Evolution => {
            let api_key = std::env::var(&config.channel.api_key_env).with_context(|| {
                format!("{} environment variable not set", config.channel.api_key_env)
            })?;
            let channel = EvolutionChannel::new(
                &config.channel.base_url,
                api_key,
                config.dispatch.timeout(),
            )?;
            Ok((Arc::new(channel), None))
        }
        ChannelKind::Loopback => {
            let (channel, mut handle) = loopback_pair(64);
            let drain = tokio::spawn(async move {
                while let Some(msg) = handle.rx.recv().await {
                    info!(
                        instance = %msg.instance,
                        address = %msg.address,
                        content = %msg.content,
                        "loopback send"
                    );
                }
            });
            Ok((Arc::new(channel), Some(drain)))
        }
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

async fn cmd_start(config_path: Option<&str>) -> Result<()> {
    let base = Base::load(config_path)?;
    let drivers = base.drivers()?;
    let shutdown = CancellationToken::new();

    let supervisor = Arc::new(Supervisor::new(
        Arc::clone(&drivers.advancer),
        LoopSettings::from_config(&base.config),
        shutdown.child_token(),
    ));
    let resumed = supervisor.resume_all().await?;
    info!(holder = supervisor.holder(), resumed, "scheduler started");

    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    tasks.push(tokio::spawn({
        let supervisor = Arc::clone(&supervisor);
        async move { supervisor.reconcile(RECONCILE_INTERVAL).await }
    }));

    if let Some(expr) = &base.config.sweep.cron {
        let schedule = sweep::parse_cron(expr)?;
        info!(cron = %expr, "sweep schedule enabled");
        tasks.push(tokio::spawn(sweep::run_sweep_schedule(
            Arc::clone(&drivers.sweeper),
            schedule,
            shutdown.child_token(),
        )));
    }

    if let Some(listen) = &base.config.webhook.listen {
        let addr: SocketAddr = listen
            .parse()
            .with_context(|| format!("invalid webhook.listen address: {listen}"))?;
        let state = Arc::new(HookState {
            listener: ReplyListener::new(
                Arc::clone(&base.store),
                base.identities(),
                Some(Arc::clone(&supervisor)),
                base.config.webhook.wake_on_reply,
            ),
            control: base.controlled_by(&drivers).with_supervisor(Arc::clone(&supervisor)),
        });
        let token = shutdown.child_token();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = webhook::serve(addr, state, token).await {
                error!(error = %e, "webhook server failed");
            }
        }));
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("shutdown requested");

    shutdown.cancel();
    supervisor.shutdown().await;
    for task in tasks {
        if let Err(e) = task.await {
            warn!(error = %e, "background task panicked");
        }
    }
    info!("matura stopped");
    Ok(())
}

async fn cmd_sweep(config_path: Option<&str>) -> Result<()> {
    let base = Base::load(config_path)?;
    let drivers = base.drivers()?;
    let report = base.controlled_by(&drivers).sweep_once().await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn cmd_pair(config_path: Option<&str>, command: PairCommands) -> Result<()> {
    let base = Base::load(config_path)?;

    match command {
        PairCommands::Create {
            id,
            member_a,
            member_b,
            script,
            looped,
        } => {
            let mode = script.map(|id| matura_core::SchedulingMode::scripted(id, looped));
            let pair = base
                .control()
                .create_pair(NewPair {
                    id,
                    member_a,
                    member_b,
                    mode,
                })
                .await?;
            println!("created pair {}", pair.id);
        }
        PairCommands::Delete { id } => {
            if base.control().delete_pair(&id).await? {
                println!("deleted pair {id}");
            } else {
                anyhow::bail!("pair not found: {id}");
            }
        }
        PairCommands::Start { id } => {
            let drivers = base.drivers()?;
            let transition = base.controlled_by(&drivers).start_pair(&id).await?;
            println!("start {id}: {transition}");
        }
        PairCommands::Pause { id } => {
            let transition = base.control().pause_pair(&id).await?;
            println!("pause {id}: {transition}");
        }
        PairCommands::Stop { id } => {
            let transition = base.control().stop_pair(&id).await?;
            println!("stop {id}: {transition}");
        }
        PairCommands::List => {
            let pairs = base.control().list_pairs().await?;
            if pairs.is_empty() {
                println!("no pairs");
            }
            for pair in pairs {
                let error = pair
                    .last_error
                    .as_deref()
                    .map(|e| format!("  error: {e}"))
                    .unwrap_or_default();
                println!(
                    "{:<36}  {:<8} {:<6} turn {:<5} {} <-> {}{error}",
                    pair.id,
                    pair.status,
                    if pair.active { "active" } else { "-" },
                    pair.turn_counter,
                    pair.member_a,
                    pair.member_b,
                );
            }
        }
        PairCommands::History { id, limit } => {
            let turns = base.control().turn_history(&id, limit).await?;
            for turn in turns {
                let mut flags = Vec::new();
                if turn.metadata.fallback {
                    flags.push("fallback");
                }
                if turn.metadata.duplicate {
                    flags.push("duplicate");
                }
                if !turn.metadata.committed {
                    flags.push("uncommitted");
                }
                let flags = if flags.is_empty() {
                    String::new()
                } else {
                    format!(" [{}]", flags.join(","))
                };
                println!(
                    "#{:<4} {} {} -> {} ({}){flags}: {}",
                    turn.turn_index,
                    turn.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    turn.from_member,
                    turn.to_member,
                    turn.driver,
                    turn.content,
                );
            }
        }
    }
    Ok(())
}

/// Validate the config, report identities missing channel coordinates and
/// probe the channel.
async fn cmd_check(config_path: Option<&str>) -> Result<()> {
    let config_file = Config::find_config_path(config_path);
    let config = Config::load(&config_file)
        .with_context(|| format!("loading config from {}", config_file.display()))?;
    println!("config ok: {}", config_file.display());

    let mut incomplete = 0;
    for identity in &config.identities {
        let mut missing = Vec::new();
        if identity.address.is_none() {
            missing.push("address");
        }
        if identity.instance.is_none() {
            missing.push("instance");
        }
        if identity.prompt.is_none() && identity.script.is_none() {
            missing.push("prompt or script");
        }
        if !missing.is_empty() {
            incomplete += 1;
            println!("identity {}: missing {}", identity.name, missing.join(", "));
        }
    }

    let (channel, _drain) = build_channel(&config)?;
    match channel.probe().await {
        ChannelHealth::Healthy => println!("channel {}: healthy", channel.id()),
        ChannelHealth::Degraded(reason) => {
            println!("channel {}: degraded ({reason})", channel.id());
        }
        ChannelHealth::Unhealthy(reason) => {
            anyhow::bail!("channel {} unhealthy: {reason}", channel.id());
        }
    }

    anyhow::ensure!(incomplete == 0, "{incomplete} identities are incomplete");
    Ok(())
}
