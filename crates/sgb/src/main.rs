use std::{sync::Arc, time::Duration};

use tokio::sync::mpsc;

use sgb_ai::AiClient;
use sgb_core::{
    ai::{CompletionPort, NoCompletion},
    config::Config,
    groups::GroupIdNormalizer,
    rpc::SignalApi,
    Error,
};
use sgb_daemon::Daemon;
use sgb_signal_cli::SignalCliTransport;

#[tokio::main]
async fn main() -> Result<(), Error> {
    sgb_core::logging::init("sgb")?;

    let mode = std::env::args().nth(1).unwrap_or_else(|| "start".to_string());
    let cfg = Arc::new(Config::load()?);

    match mode.as_str() {
        "start" => run(cfg).await,
        "health" => health(cfg).await,
        "stop" => request_stop(&cfg),
        other => {
            eprintln!("usage: sgb <start|stop|health>");
            Err(Error::Config(format!("unknown mode: {other}")))
        }
    }
}

async fn run(cfg: Arc<Config>) -> Result<(), Error> {
    let ai: Arc<dyn CompletionPort> = match &cfg.ai_api_url {
        Some(url) => Arc::new(AiClient::new(
            url.clone(),
            cfg.ai_api_key.clone(),
            cfg.ai_model.clone(),
        )),
        None => {
            println!("[DAEMON] no AI endpoint configured; assistant replies use the fallback");
            Arc::new(NoCompletion)
        }
    };

    // Fresh start: clear any stale stop request, then record our pid.
    let _ = std::fs::remove_file(&cfg.stop_file);
    std::fs::write(&cfg.pid_file, std::process::id().to_string())?;

    let daemon = Daemon::new(cfg.clone(), ai);
    daemon.start().await?;

    wait_for_shutdown(&cfg).await;

    daemon.stop().await;
    let _ = std::fs::remove_file(&cfg.pid_file);
    let _ = std::fs::remove_file(&cfg.stop_file);
    Ok(())
}

/// Block until SIGINT or a stop request from `sgb stop` (stop-file), whichever
/// comes first.
async fn wait_for_shutdown(cfg: &Config) {
    let stop_file = cfg.stop_file.clone();
    let watcher = async move {
        loop {
            if stop_file.exists() {
                println!("[DAEMON] stop requested via {}", stop_file.display());
                return;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            println!("[DAEMON] interrupt received");
        }
        _ = watcher => {}
    }
}

/// Read-only health probe: connect to the daemon socket and ask its version.
async fn health(cfg: Arc<Config>) -> Result<(), Error> {
    let (notify_tx, _notify_rx) = mpsc::channel(1);
    let transport = SignalCliTransport::new(&cfg.socket_path, notify_tx);
    transport.start();

    let connected = {
        use sgb_core::rpc::Transport;
        let mut up = false;
        for _ in 0..30 {
            if transport.is_connected() {
                up = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        up
    };

    if !connected {
        transport.shutdown().await;
        eprintln!("unreachable: {}", cfg.socket_path.display());
        return Err(Error::Transport("daemon socket unreachable".to_string()));
    }

    let api = SignalApi::new(
        Arc::new(transport.clone()),
        Arc::new(GroupIdNormalizer::new()),
        cfg.account.clone(),
        cfg.call_timeout,
        cfg.mutation_timeout,
    );

    let result = api.version().await;
    transport.shutdown().await;

    match result {
        Ok(version) => {
            println!(
                "ok: signal-cli {version} for {} at {}",
                cfg.account,
                cfg.socket_path.display()
            );
            Ok(())
        }
        Err(e) => {
            eprintln!("unhealthy: {e}");
            Err(e)
        }
    }
}

/// Ask a running daemon to shut down by creating the stop-file it watches.
fn request_stop(cfg: &Config) -> Result<(), Error> {
    if !cfg.pid_file.exists() {
        println!("no pidfile at {}; daemon not running?", cfg.pid_file.display());
        return Ok(());
    }
    std::fs::write(&cfg.stop_file, "stop\n")?;
    println!("stop requested; the daemon will exit within a second");
    Ok(())
}
