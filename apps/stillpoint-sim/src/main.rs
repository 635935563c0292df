use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use stillpoint_relay::LocalRelay;
use stillpoint_sync::{
    Clock, ParticipantId, ParticipantStatus, PresenceMeta, SessionHandle, SessionMutation,
    SyncConfig, SystemClock,
};
use tokio::time::{interval, sleep, Instant};
use tracing::{info, warn};

mod telemetry;

#[derive(Debug, Parser)]
#[command(
    name = "stillpoint-sim",
    author,
    version,
    about = "Simulate a group meditation session over an in-process relay"
)]
struct Cli {
    /// Number of simulated participants.
    #[arg(long, env = "STILLPOINT_SIM_PEERS", default_value_t = 3)]
    peers: usize,

    /// Session identifier; peers share the relay topic derived from it.
    #[arg(long, env = "STILLPOINT_SIM_SESSION", default_value = "sim")]
    session: String,

    /// Countdown length the host starts.
    #[arg(long, env = "STILLPOINT_SIM_DURATION_MINUTES", default_value_t = 1)]
    duration_minutes: u32,

    /// Wall-clock length of the simulation. The host departs halfway.
    #[arg(long, env = "STILLPOINT_SIM_RUN_SECS", default_value_t = 10)]
    run_secs: u64,

    #[arg(long, env = "STILLPOINT_HEARTBEAT_MS", default_value_t = 1_000)]
    heartbeat_ms: u64,

    #[arg(long, env = "STILLPOINT_TICK_MS", default_value_t = 250)]
    tick_ms: u64,

    /// Drop the host without leaving instead of a clean leave.
    #[arg(long)]
    crash: bool,

    #[arg(long, env = "RUST_LOG", default_value = "info,stillpoint.sync=debug")]
    log_filter: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    telemetry::init_tracing(&cli.log_filter);
    anyhow::ensure!(cli.peers >= 2, "need at least two peers to observe a handover");

    let config = SyncConfig {
        heartbeat_ms: cli.heartbeat_ms,
        presence_grace_ms: cli.heartbeat_ms.saturating_mul(3),
        tick_ms: cli.tick_ms,
        ..SyncConfig::from_env()
    }
    .sanitized();
    info!(
        peers = cli.peers,
        session = %cli.session,
        duration_minutes = cli.duration_minutes,
        run_secs = cli.run_secs,
        heartbeat_ms = config.heartbeat_ms,
        grace_ms = config.presence_grace_ms,
        tick_ms = config.tick_ms,
        crash = cli.crash,
        "starting stillpoint-sim"
    );

    let relay = Arc::new(LocalRelay::new());
    let reaper = relay.spawn_reaper(
        config.heartbeat_interval(),
        Duration::from_millis(config.presence_grace_ms),
    );
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let mut peers = Vec::with_capacity(cli.peers);
    for index in 0..cli.peers {
        let id = format!("peer-{index}");
        let meta = PresenceMeta {
            id: ParticipantId::new(id.clone()),
            display_name: format!("Peer {index}"),
            joined_at_ms: clock.now_ms(),
            status: ParticipantStatus::Active,
        };
        let peer = SessionHandle::join(
            &cli.session,
            meta,
            relay.clone(),
            Arc::clone(&clock),
            config.clone(),
        )
        .with_context(|| format!("{id} failed to join"))?;
        let label = id.clone();
        peer.on_complete(move |completion| {
            info!(peer = %label, epoch_ms = completion.epoch_ms, "countdown complete");
        });
        peers.push(peer);
        // Distinct join stamps keep the election order readable.
        sleep(Duration::from_millis(5)).await;
    }
    sleep(config.tick_interval() * 4).await;

    let host_index = peers
        .iter()
        .position(SessionHandle::is_local_host)
        .context("no peer was elected host")?;
    let host = peers.remove(host_index);
    host.propose(SessionMutation::SetDuration {
        minutes: cli.duration_minutes,
    })
    .context("host failed to set duration")?;
    host.propose(SessionMutation::Play)
        .context("host failed to start the countdown")?;
    info!(host = %host.local_id(), "countdown started");

    let half = Duration::from_secs(cli.run_secs.max(2) / 2);
    report(&peers, Some(&host), half).await;

    if cli.crash {
        warn!(host = %host.local_id(), "host dropped without leaving");
        drop(host);
    } else {
        info!(host = %host.local_id(), "host leaving");
        host.leave().await.context("host failed to leave")?;
    }
    report(&peers, None, half).await;

    for peer in peers {
        let id = peer.local_id();
        if let Err(err) = peer.leave().await {
            warn!(peer = %id, error = %err, "leave failed");
        }
    }
    reaper.abort();
    info!("simulation finished");
    Ok(())
}

async fn report(peers: &[SessionHandle], host: Option<&SessionHandle>, span: Duration) {
    let deadline = Instant::now() + span;
    let mut ticker = interval(Duration::from_secs(1));
    while Instant::now() < deadline {
        ticker.tick().await;
        for peer in host.into_iter().chain(peers.iter()) {
            info!(
                peer = %peer.local_id(),
                host = ?peer.host().map(|id| id.to_string()),
                is_host = peer.is_local_host(),
                remaining_s = format_args!("{:.1}", peer.remaining_seconds()),
                roster = peer.roster().len(),
                "peer view"
            );
        }
    }
}
