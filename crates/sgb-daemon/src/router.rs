use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
    time::{interval, Instant},
};
use tokio_util::sync::CancellationToken;

use sgb_core::{
    ai::CompletionPort,
    audit::{AuditEvent, AuditLogger},
    commands::CommandRegistry,
    config::Config,
    domain::InboundMessage,
    gateway::SecureGateway,
    groups::GroupIdNormalizer,
    roster::Roster,
    rpc::SignalApi,
    security::{RateLimiter, RateLimits},
    Result,
};
use sgb_signal_cli::SignalCliTransport;

use crate::handlers;

const NOTIFY_CHANNEL_CAPACITY: usize = 64;
const RATE_LIMIT_PRUNE_INTERVAL: Duration = Duration::from_secs(60);

/// Shared application state handed to every dispatched message.
pub struct AppState {
    pub cfg: Arc<Config>,
    pub api: SignalApi,
    pub roster: Arc<Roster>,
    pub registry: Arc<CommandRegistry>,
    pub rate_limiter: Arc<Mutex<RateLimiter>>,
    pub gateway: Arc<SecureGateway>,
    pub audit: Arc<AuditLogger>,
    pub ai: Arc<dyn CompletionPort>,
}

/// Connection/cache health exposed to the dashboard collaborator.
#[derive(Clone, Debug)]
pub struct Health {
    pub connected: bool,
    pub last_sync: Option<DateTime<Utc>>,
    pub pending_calls: usize,
    pub groups: usize,
}

#[derive(Clone, Debug)]
pub struct GroupSummary {
    pub id: String,
    pub name: String,
    pub member_count: usize,
}

/// The daemon instance: owns the transport lifecycle and the background
/// tasks (inbound loop, roster sync, limiter pruning).
pub struct Daemon {
    state: Arc<AppState>,
    transport: SignalCliTransport,
    notify_rx: Mutex<Option<mpsc::Receiver<InboundMessage>>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Daemon {
    pub fn new(cfg: Arc<Config>, ai: Arc<dyn CompletionPort>) -> Self {
        let (notify_tx, notify_rx) = mpsc::channel(NOTIFY_CHANNEL_CAPACITY);
        let transport = SignalCliTransport::new(&cfg.socket_path, notify_tx);

        let normalizer = Arc::new(GroupIdNormalizer::new());
        let roster = Arc::new(Roster::new(normalizer.clone()));
        let api = SignalApi::new(
            Arc::new(transport.clone()),
            normalizer,
            cfg.account.clone(),
            cfg.call_timeout,
            cfg.mutation_timeout,
        );

        let registry = Arc::new(CommandRegistry::builtin());
        let gateway = Arc::new(SecureGateway::new(
            cfg.usage_log_path.clone(),
            registry.names(),
        ));
        let audit = Arc::new(AuditLogger::new(
            cfg.audit_log_path.clone(),
            cfg.audit_log_json,
        ));
        let rate_limiter = Arc::new(Mutex::new(RateLimiter::new(RateLimits {
            enabled: cfg.rate_limit_enabled,
            window: cfg.rate_limit_window,
            general: cfg.rate_limit_general,
            ai: cfg.rate_limit_ai,
            mutation: cfg.rate_limit_mutation,
            lookup: cfg.rate_limit_lookup,
        })));

        let state = Arc::new(AppState {
            cfg,
            api,
            roster,
            registry,
            rate_limiter,
            gateway,
            audit,
            ai,
        });

        Self {
            state,
            transport,
            notify_rx: Mutex::new(Some(notify_rx)),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    /// Connect and spawn the background tasks. Returns once the daemon is
    /// running; inbound work is handled on the spawned tasks.
    pub async fn start(&self) -> Result<()> {
        let mut tasks = self.tasks.lock().await;

        self.transport.start();

        // Inbound loop: the single consumer of the notification channel.
        let Some(notify_rx) = self.notify_rx.lock().await.take() else {
            return Err(sgb_core::Error::Config(
                "daemon already started".to_string(),
            ));
        };
        tasks.push(tokio::spawn(inbound_loop(
            self.state.clone(),
            notify_rx,
            self.cancel.clone(),
        )));

        // Periodic roster sync on its own timer.
        tasks.push(tokio::spawn(sync_loop(
            self.state.clone(),
            self.cancel.clone(),
        )));

        // Rate-limit window pruning on its own timer.
        tasks.push(tokio::spawn(prune_loop(
            self.state.clone(),
            self.cancel.clone(),
        )));

        println!(
            "[DAEMON] started for {} (socket {})",
            self.state.cfg.account,
            self.state.cfg.socket_path.display()
        );
        Ok(())
    }

    pub async fn stop(&self) {
        self.cancel.cancel();
        self.transport.shutdown().await;
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            task.abort();
        }
        println!("[DAEMON] stopped");
    }

    pub fn health(&self) -> Health {
        let transport = self.state.api.transport();
        Health {
            connected: transport.is_connected(),
            last_sync: self.state.roster.last_sync(),
            pending_calls: transport.pending_calls(),
            groups: self.state.roster.snapshot().len(),
        }
    }

    pub fn list_groups(&self) -> Vec<GroupSummary> {
        self.state
            .roster
            .ordered_groups()
            .into_iter()
            .map(|g| GroupSummary {
                id: g.id.0.clone(),
                name: g.name.clone(),
                member_count: g.member_count,
            })
            .collect()
    }
}

async fn inbound_loop(
    state: Arc<AppState>,
    mut notify_rx: mpsc::Receiver<InboundMessage>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            msg = notify_rx.recv() => {
                let Some(msg) = msg else { return };
                // Independent messages dispatch concurrently; shared state is
                // behind replace-on-write snapshots and the limiter mutex.
                let state = state.clone();
                tokio::spawn(async move {
                    handlers::handle_inbound(state, msg).await;
                });
            }
        }
    }
}

async fn sync_loop(state: Arc<AppState>, cancel: CancellationToken) {
    let mut ticker = interval(state.cfg.sync_interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {
                match state.roster.sync_once(&state.api).await {
                    Ok(count) => {
                        println!("[SYNC] refreshed {count} groups");
                    }
                    Err(e) => {
                        // Previous snapshot stays; the next tick is the retry.
                        eprintln!("[SYNC] failed, keeping previous snapshot: {e}");
                        let _ = state.audit.write(AuditEvent::sync(&e.to_string()));
                    }
                }
            }
        }
    }
}

async fn prune_loop(state: Arc<AppState>, cancel: CancellationToken) {
    let mut ticker = interval(RATE_LIMIT_PRUNE_INTERVAL);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {
                state.rate_limiter.lock().await.prune_idle(Instant::now().into_std());
            }
        }
    }
}
