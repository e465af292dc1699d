// src/main.rs

//! Agent entry-point: Windows service or console fallback.
//!
//! 1. Resolve and load the configuration, set up structured logging
//! 2. Optionally expose Prometheus metrics
//! 3. Open the sink and the native event source
//! 4. Start one receiver per configured channel; each opens the checkpoint store
//! 5. Wait for Stop / Shutdown (SCM) or Ctrl-C (console), then shut down

// ───── std / 3rd-party imports ──────────────────────────────────────────────
use anyhow::{Context, anyhow};
use chrono::Local;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::{
    fs::OpenOptions,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::runtime::Runtime;

// ───── local imports ────────────────────────────────────────────────────────
use eventlog_receiver::{
    ChannelConfig, EventLogReceiver, ReceiverBuilder, ReceiverState,
    config::{MasterConfig, load},
    delivery::{JsonLinesSink, LogSink},
    logging::setup_logging,
    source::EventSource,
};

// ───── service constants ────────────────────────────────────────────────────
#[cfg(windows)]
const SERVICE_NAME: &str = "EventLogAgent";

#[cfg(windows)]
windows_service::define_windows_service!(ffi_service_main, service_main);

// ───── helpers ──────────────────────────────────────────────────────────────

/// Print an error with context and terminate the process.
macro_rules! fatal {
    ($ctx:expr, $($arg:tt)+) => {{
        eprintln!(
            "[{}][ERROR][{}] {}",
            chrono::Local::now().to_rfc3339(),
            $ctx,
            format!($($arg)+)
        );
        std::process::exit(1);
    }};
}

/// Directory that contains the running executable.
fn exe_dir() -> anyhow::Result<PathBuf> {
    let exe = std::env::current_exe().context("cannot determine executable path")?;
    exe.parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| anyhow!("executable {} has no parent directory", exe.display()))
}

/// `argv[1]` when given, else `config.toml` next to the executable.
fn config_path(exe_dir: &Path) -> PathBuf {
    std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| exe_dir.join("config.toml"))
}

#[cfg(windows)]
fn native_source() -> anyhow::Result<Arc<dyn EventSource>> {
    Ok(Arc::new(eventlog_receiver::source::wevtapi::WevtapiSource::new()))
}

#[cfg(not(windows))]
fn native_source() -> anyhow::Result<Arc<dyn EventSource>> {
    Err(anyhow!("the Windows Event Log is only available on Windows"))
}

fn open_sink(master: &MasterConfig, base_dir: &Path) -> anyhow::Result<Arc<dyn LogSink>> {
    match &master.output.file {
        Some(path) => {
            let path = base_dir.join(path);
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("cannot open output file {}", path.display()))?;
            log::info!("Writing log records to {}", path.display());
            Ok(Arc::new(JsonLinesSink::new(file)))
        }
        None => Ok(Arc::new(JsonLinesSink::stdout())),
    }
}

fn install_metrics(rt: &Runtime, master: &MasterConfig) -> anyhow::Result<()> {
    let Some(listen) = &master.metrics.listen else {
        return Ok(());
    };
    let addr: SocketAddr = listen
        .parse()
        .with_context(|| format!("invalid [metrics] listen address '{listen}'"))?;
    let _guard = rt.enter();
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("failed to install Prometheus exporter")?;
    log::info!("Prometheus metrics on http://{}/metrics", addr);
    Ok(())
}

// ───── agent ────────────────────────────────────────────────────────────────

struct Agent {
    rt: Runtime,
    receivers: Vec<Arc<EventLogReceiver>>,
}

/// Everything up to (not including) waiting for a stop request.
fn bootstrap() -> anyhow::Result<Agent> {
    // 1 ─ Context & configuration
    let exe_dir = exe_dir()?;
    let cfg_path = config_path(&exe_dir);
    let (master, channels) = load(&cfg_path)
        .with_context(|| format!("failed to load {}", cfg_path.display()))?;
    let base_dir = cfg_path.parent().map(Path::to_path_buf).unwrap_or(exe_dir);

    // 2 ─ Logging
    setup_logging(&base_dir, &master.logging).context("logging setup failed")?;
    log::info!("Agent bootstrap initiated with {} channel(s)", channels.len());
    if channels.is_empty() {
        log::warn!("No [[receivers]] configured; nothing to do");
    }

    // 3 ─ Runtime & metrics
    let rt = Runtime::new().context("Tokio runtime creation failed")?;
    install_metrics(&rt, &master)?;

    // 4 ─ Collaborators shared by all receivers; each receiver opens the store on start
    let sink = open_sink(&master, &base_dir)?;
    let source = native_source()?;

    let receivers: Vec<Arc<EventLogReceiver>> = channels
        .into_iter()
        .map(|cfg: ChannelConfig| {
            Arc::new(
                ReceiverBuilder::new(cfg, Arc::clone(&source), Arc::clone(&sink))
                    .storage(&base_dir, master.storage.clone())
                    .build(),
            )
        })
        .collect();

    // 5 ─ Start; any failure aborts the whole agent
    rt.block_on(async {
        for receiver in &receivers {
            if let Err(e) = receiver.start().await {
                for started in &receivers {
                    started.shutdown().await;
                }
                return Err(anyhow!(e).context(format!("receiver '{}' failed to start", receiver.channel())));
            }
        }
        Ok(())
    })?;

    // Surface workers that stopped on their own.
    let watched = receivers.clone();
    rt.spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(30));
        loop {
            tick.tick().await;
            for r in &watched {
                if let ReceiverState::Failed(reason) = r.state() {
                    log::error!("Receiver '{}' is unhealthy: {}", r.channel(), reason);
                }
            }
        }
    });

    log::info!("Agent running");
    Ok(Agent { rt, receivers })
}

impl Agent {
    fn shutdown(self) {
        log::warn!("Shutdown initiated");
        self.rt.block_on(async {
            for receiver in &self.receivers {
                receiver.shutdown().await;
            }
        });
        self.rt.shutdown_timeout(Duration::from_secs(5));
        log::info!("Agent stopped cleanly");
    }
}

fn run_console() {
    let agent = bootstrap().unwrap_or_else(|e| fatal!("bootstrap", "{:#}", e));
    agent.rt.block_on(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("Cannot listen for Ctrl-C: {}", e);
        }
    });
    agent.shutdown();
}

// ───── service logic ────────────────────────────────────────────────────────

#[cfg(windows)]
fn run_service() -> anyhow::Result<()> {
    use std::sync::mpsc;
    use windows_service::{
        service::{
            ServiceControl, ServiceControlAccept, ServiceExitCode, ServiceState, ServiceStatus,
            ServiceType,
        },
        service_control_handler::{self, ServiceControlHandlerResult},
    };

    let (svc_tx, svc_rx) = mpsc::sync_channel(1);
    let status_handle = service_control_handler::register(SERVICE_NAME, move |ctrl| match ctrl {
        ServiceControl::Stop | ServiceControl::Shutdown => {
            log::warn!("Stop requested via SCM");
            let _ = svc_tx.try_send(());
            ServiceControlHandlerResult::NoError
        }
        ServiceControl::Interrogate => ServiceControlHandlerResult::NoError,
        _ => ServiceControlHandlerResult::NotImplemented,
    })?;

    let mut status = ServiceStatus {
        service_type: ServiceType::OWN_PROCESS,
        current_state: ServiceState::StartPending,
        controls_accepted: ServiceControlAccept::empty(),
        exit_code: ServiceExitCode::Win32(0),
        checkpoint: 0,
        wait_hint: Duration::from_secs(30),
        process_id: None,
    };
    status_handle.set_service_status(status.clone())?;

    let agent = match bootstrap() {
        Ok(agent) => agent,
        Err(e) => {
            log::error!("Bootstrap failed: {:#}", e);
            status.current_state = ServiceState::Stopped;
            status.exit_code = ServiceExitCode::Win32(1);
            status_handle.set_service_status(status)?;
            return Err(e);
        }
    };

    status.current_state = ServiceState::Running;
    status.controls_accepted = ServiceControlAccept::STOP | ServiceControlAccept::SHUTDOWN;
    status_handle.set_service_status(status.clone())?;

    let _ = svc_rx.recv();
    status.current_state = ServiceState::StopPending;
    status.controls_accepted = ServiceControlAccept::empty();
    status_handle.set_service_status(status.clone())?;

    agent.shutdown();

    status.current_state = ServiceState::Stopped;
    status_handle.set_service_status(status)?;
    Ok(())
}

// Windows SCM entry point.
#[cfg(windows)]
fn service_main(_args: Vec<std::ffi::OsString>) {
    if let Err(e) = run_service() {
        fatal!("service", "{:#}", e);
    }
}

#[cfg(windows)]
fn main() {
    // If registering as a service fails, run as a plain console app.
    if let Err(e) = windows_service::service_dispatcher::start(SERVICE_NAME, ffi_service_main) {
        eprintln!(
            "[{}][ERROR][main] Not a service: {} – falling back to console.",
            Local::now().to_rfc3339(),
            e
        );
        run_console();
    }
}

#[cfg(not(windows))]
fn main() {
    eprintln!("[{}][INFO][main] Running in console mode", Local::now().to_rfc3339());
    run_console();
}
