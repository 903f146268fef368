//! Transceiver app: reads one link, publishes downlinked packets and sends
//! uplink requests addressed to it.

use std::sync::Arc;

use anyhow::{Context, bail};
use clap::Parser;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use iris_gds::GdsError;
use iris_gds::codec::PacketDispatcher;
use iris_gds::config::{CommonArgs, run_app};
use iris_gds::ipc::{IpcAppManager, MessageContent, Port, SocketSpec, Topic, UplinkPacketRequestContent};
use iris_gds::transceiver::{DriverChannels, TransceiverDriver};

/// Packets bundled into one bus message at most.
const MAX_BATCH: usize = 64;

#[derive(Parser, Debug)]
#[command(name = "iris-xcvr", version, about = "Publishes packets downlinked on one link")]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    /// Transceiver to run, by its name in the config. Defaults to the first.
    #[arg(long)]
    xcvr: Option<String>,
}

fn main() {
    let cli = Cli::parse();
    let common = cli.common.clone();
    run_app(&common, "xcvr", |name, shutdown| run(cli, name, shutdown))
}

async fn run(cli: Cli, name: String, shutdown: CancellationToken) -> anyhow::Result<()> {
    let config = cli.common.load_config()?;
    let standards = Arc::new(config.load_standards()?);
    let map = config.load_parameter_map()?;
    let dispatcher = Arc::new(PacketDispatcher::new(standards));

    let xcvr_config = match &cli.xcvr {
        Some(wanted) => config
            .transceivers
            .iter()
            .find(|t| &t.name == wanted)
            .with_context(|| format!("no transceiver named '{wanted}' in the config"))?,
        None => config.transceivers.first().context("the config lists no transceivers")?,
    };
    let xcvr_name = xcvr_config.name.clone();
    let xcvr = xcvr_config.build(dispatcher.clone(), &map);

    let mut app = IpcAppManager::builder(&name)
        .host(&config.ipc.host)
        .port_offset(config.ipc.port_offset)
        .high_water_mark(config.ipc.high_water_mark)
        .socket("downlink", SocketSpec::publisher(Port::TransceiverPub))
        .socket("uplink", SocketSpec::subscriber(Port::TransceiverSub, [Topic::UlPacket]).with_bind(true))
        .build(shutdown.clone())
        .await?;

    let mut driver = TransceiverDriver::spawn(xcvr, shutdown.clone());
    let mut status = driver.status_updates();
    let link_name = xcvr_name.clone();
    tokio::spawn(async move {
        while let Some(state) = status.next().await {
            info!(xcvr = %link_name, ?state, "link status");
        }
    });
    info!(xcvr = %xcvr_name, "running");
    let result = pump(&mut app, &mut driver, &dispatcher, &xcvr_name).await;

    // Publish whatever the driver already handed over, then close.
    let mut remaining = Vec::new();
    while let Ok(packet) = driver.packets.try_recv() {
        remaining.push(packet);
    }
    if !remaining.is_empty() {
        app.send_to("downlink", &MessageContent::packets(remaining))?;
    }
    app.shutdown().await;
    result
}

async fn pump(
    app: &mut IpcAppManager,
    driver: &mut DriverChannels,
    dispatcher: &PacketDispatcher,
    xcvr_name: &str,
) -> anyhow::Result<()> {
    loop {
        tokio::select! {
            packet = driver.packets.recv() => {
                let Some(packet) = packet else {
                    if app.is_shutting_down() {
                        return Ok(());
                    }
                    bail!("transceiver {xcvr_name} stopped");
                };
                let mut batch = vec![packet];
                while batch.len() < MAX_BATCH {
                    match driver.packets.try_recv() {
                        Ok(packet) => batch.push(packet),
                        Err(_) => break,
                    }
                }
                app.send_to("downlink", &MessageContent::packets(batch))?;
            }
            request = app.read("uplink") => match request {
                Ok(payload) => {
                    let (packet, target_xcvr) = match payload.message {
                        MessageContent::UplinkPacketRequestContent(UplinkPacketRequestContent { packet, target_xcvr }) => {
                            (packet, target_xcvr)
                        }
                        other => {
                            warn!(class = other.class(), "unexpected message on the uplink socket");
                            continue;
                        }
                    };
                    if target_xcvr != xcvr_name {
                        debug!(%target_xcvr, "uplink request for another transceiver");
                        continue;
                    }
                    match dispatcher.encode(&packet) {
                        Ok(bytes) => {
                            info!(len = bytes.len(), "uplinking {packet}");
                            driver.uplink.send(bytes).await.context("transceiver driver is gone")?;
                        }
                        Err(e) => warn!("cannot encode uplink packet {packet}: {e}"),
                    }
                }
                Err(GdsError::Shutdown) => return Ok(()),
                Err(e) => return Err(e.into()),
            },
        }
    }
}
