mod control;
mod power;
mod screensaver;
mod status;

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use frame_link::{ChannelMessage, Command, Publisher};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use control::{AgentEvent, ControlSocket};
use power::{PowerPlan, PowerSwitch, RelayPulse};
use screensaver::{PowerAction, SaverEvent, ScreenSaver};

#[derive(Debug, Clone, Parser)]
#[command(
    name = "frame-agent",
    about = "Screen saver and photo cache companion for the photo frame"
)]
struct Args {
    /// Status publisher of the photo cache.
    #[arg(long, default_value = "127.0.0.1:5556")]
    status_addr: String,

    /// Address to publish displayed-photo notices on.
    #[arg(long, default_value = "127.0.0.1:5557")]
    command_bind: String,

    /// Local control socket.
    #[arg(long, default_value = "/run/photo-frame/agent.sock")]
    control_socket: PathBuf,

    /// Switch the screen off after this long without motion (e.g. "1h", "90s").
    #[arg(long, default_value = "1h", value_parser = humantime::parse_duration)]
    idle_timeout: Duration,

    /// Sysfs GPIO value file driving the monitor power relay.
    #[arg(long)]
    relay_gpio: Option<PathBuf>,

    /// How long the relay is held closed (milliseconds).
    #[arg(long, default_value_t = 400)]
    pulse_ms: u64,

    /// Shell command run when the screen is switched on.
    #[arg(long)]
    screen_on_command: Option<String>,

    /// Shell command run when the screen is switched off.
    #[arg(long)]
    screen_off_command: Option<String>,

    /// Mirror the latest photo cache status to this JSON file.
    #[arg(long)]
    status_file: Option<PathBuf>,

    /// Logging level (error|warn|info|debug|trace).
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn power_plan(&self) -> PowerPlan {
        PowerPlan {
            relay: self.relay_gpio.clone().map(|value_path| RelayPulse {
                value_path,
                pulse: Duration::from_millis(self.pulse_ms),
            }),
            on_command: self.screen_on_command.clone(),
            off_command: self.screen_off_command.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args.log_level)?;

    let plan = args.power_plan();
    let switch = if plan.relay.is_none() && plan.on_command.is_none() && plan.off_command.is_none()
    {
        warn!("no relay or screen commands configured; screen changes are only logged");
        None
    } else {
        Some(PowerSwitch::new(plan).context("invalid screen power settings")?)
    };

    let publisher = Publisher::bind(args.command_bind.as_str())
        .await
        .context("failed to open command channel")?;
    let socket = ControlSocket::bind(&args.control_socket)?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!("ctrl-c handler failed: {err}");
                return;
            }
            info!("ctrl-c received; initiating shutdown");
            cancel.cancel();
        });
    }

    let (events_tx, mut events) = mpsc::channel(32);
    let mut tasks = JoinSet::new();

    tasks.spawn({
        let events = events_tx.clone();
        let cancel = cancel.clone();
        async move {
            let mut sigterm =
                signal(SignalKind::terminate()).context("failed to register SIGTERM handler")?;
            let mut sigusr1 =
                signal(SignalKind::user_defined1()).context("failed to register SIGUSR1 handler")?;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = sigterm.recv() => {
                        info!("SIGTERM received; initiating shutdown");
                        cancel.cancel();
                    }
                    _ = sigusr1.recv() => {
                        debug!("SIGUSR1 received; treating as motion");
                        if events.send(AgentEvent::Saver(SaverEvent::Motion)).await.is_err() {
                            break;
                        }
                    }
                }
            }
            Ok::<(), anyhow::Error>(())
        }
    });

    tasks.spawn({
        let events = events_tx.clone();
        let cancel = cancel.clone();
        async move {
            socket
                .serve(events, cancel)
                .await
                .context("control socket task failed")
        }
    });

    tasks.spawn({
        let addr = args.status_addr.clone();
        let status_file = args.status_file.clone();
        let events = events_tx;
        let cancel = cancel.clone();
        async move {
            status::follow(addr, status_file, events, cancel)
                .await
                .context("status task failed")
        }
    });

    let mut saver = ScreenSaver::new(args.idle_timeout, Instant::now());
    info!(idle_timeout = ?args.idle_timeout, "screen saver armed");

    loop {
        let deadline = saver.next_deadline().map(tokio::time::Instant::from_std);
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
            _ = wait_until(deadline) => AgentEvent::Saver(SaverEvent::Timeout),
        };

        match event {
            AgentEvent::Saver(event) => {
                if let Some(action) = saver.on_event(event, Instant::now()) {
                    switch_screen(switch.as_ref(), action).await;
                }
                debug!(
                    ?event,
                    screen_on = saver.screen_on(),
                    manual_off = saver.manual_off(),
                    "screen saver updated"
                );
            }
            AgentEvent::Displayed(photo) => {
                match publisher.publish(&ChannelMessage::from(Command::DisplayedPhoto(photo.clone())))
                {
                    Ok(receivers) => debug!(%photo, receivers, "relayed displayed photo"),
                    Err(err) => warn!(%photo, error = %err, "failed to relay displayed photo"),
                }
            }
        }
    }

    cancel.cancel();
    while let Some(res) = tasks.join_next().await {
        match res {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("task error: {e:?}"),
            Err(e) => error!("join error: {e}"),
        }
    }
    publisher.shutdown().await;

    Ok(())
}

async fn wait_until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn switch_screen(switch: Option<&PowerSwitch>, action: PowerAction) {
    let Some(switch) = switch.cloned() else {
        info!(?action, "screen change requested");
        return;
    };
    match tokio::task::spawn_blocking(move || switch.apply(action)).await {
        Ok(report) if report.success() => info!(action = ?report.action, "screen switched"),
        Ok(report) => warn!(
            action = ?report.action,
            relay = ?report.relay,
            commands = ?report.commands,
            "screen switch failed"
        ),
        Err(err) => error!(?action, "screen switch task failed: {err}"),
    }
}

fn init_tracing(level: &str) -> Result<()> {
    let filter = EnvFilter::builder()
        .parse(level)
        .with_context(|| format!("invalid log level '{level}'"))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
    Ok(())
}
