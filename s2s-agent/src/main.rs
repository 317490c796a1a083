// s2s-agent: inspect the peer pool or deliver files through a remote input port.

mod config;

use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::Arc;

use anyhow::{bail, Context};
use s2s_core::{
    DataPacket, DeliveryController, DeliveryEvent, FileDataPacket, SiteToSiteClient,
    StopReason, TransactionCompletion,
};
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");
const USAGE: &str = "usage: s2s-agent [--version] <peers | send FILE...>";

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.iter().any(|a| a == "--version" || a == "-V") {
        println!("s2s-agent {}", VERSION);
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = config::load().context("loading configuration")?;
    match args.first().map(String::as_str) {
        Some("peers") => {
            let client = SiteToSiteClient::new(cfg.client).context("building site-to-site client")?;
            print_peers(&client);
            Ok(())
        }
        Some("send") if args.len() > 1 => send(cfg, &args[1..]),
        _ => bail!(USAGE),
    }
}

fn print_peers(client: &SiteToSiteClient) {
    if let Err(e) = client.refresh_peers() {
        tracing::warn!(error = %e, "peer refresh failed, showing seeds");
    }
    println!("port {}", client.port_identifier());
    for peer in client.peers() {
        match peer.failed_ago {
            Some(ago) => println!(
                "{}\tflow files {}\tfailed {}s ago",
                peer.url,
                peer.flow_file_count,
                ago.as_secs()
            ),
            None => println!("{}\tflow files {}", peer.url, peer.flow_file_count),
        }
    }
}

/// Deliver `files` as one batch, retrying per the configured delivery
/// settings, until it lands, retries run out, or a shutdown signal arrives.
fn send(cfg: config::Config, files: &[String]) -> anyhow::Result<()> {
    let mut packets: Vec<Box<dyn DataPacket>> = Vec::with_capacity(files.len());
    for file in files {
        let packet = FileDataPacket::new(file, HashMap::new()).with_context(|| format!("opening {file}"))?;
        packets.push(Box::new(packet));
    }

    let config::Config { client, delivery } = cfg;
    let client = Arc::new(SiteToSiteClient::new(client).context("building site-to-site client")?);
    let (events_tx, events_rx) = mpsc::channel();
    let controller = DeliveryController::new(
        client,
        Box::new(move || std::mem::take(&mut packets)),
        delivery.build_one_shot_policy(),
        delivery.skip_empty_batches,
    )
    .with_events(events_tx);
    controller.start()?;

    let rt = tokio::runtime::Runtime::new()?;
    let outcome = rt.block_on(async {
        let finished = tokio::task::spawn_blocking(move || wait_for_stop(events_rx));
        tokio::select! {
            r = finished => r.map(Some).map_err(anyhow::Error::from),
            r = shutdown_signal() => r.map(|_| None),
        }
    });
    controller.stop();
    rt.shutdown_background();

    match outcome? {
        Some((Some(done), _)) => {
            println!(
                "sent {} files ({} bytes) in {} ms",
                done.packets_transferred,
                done.bytes_transferred,
                done.duration.as_millis()
            );
            Ok(())
        }
        Some((None, reason)) => bail!("delivery gave up ({reason:?})"),
        None => bail!("interrupted before delivery completed"),
    }
}

fn wait_for_stop(events: mpsc::Receiver<DeliveryEvent>) -> (Option<TransactionCompletion>, StopReason) {
    let mut completed = None;
    for event in events {
        match event {
            DeliveryEvent::Completed(c) => completed = Some(c),
            DeliveryEvent::Stopped { reason } => return (completed, reason),
            DeliveryEvent::CreateFailed { .. } | DeliveryEvent::SendFailed { .. } => {}
        }
    }
    (completed, StopReason::Requested)
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    tracing::info!("shutdown requested");
    Ok(())
}
