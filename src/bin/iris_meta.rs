//! MetaField app: derives payloads from downlinked packets and republishes
//! every payload for downstream consumers.

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use iris_gds::GdsError;
use iris_gds::codec::PayloadCollection;
use iris_gds::config::{CommonArgs, run_app};
use iris_gds::ipc::{DownlinkedPacketsContent, IpcAppManager, MessageContent, Port, SocketSpec, Topic};
use iris_gds::meta::MetaEngine;

#[derive(Parser, Debug)]
#[command(name = "iris-meta", version, about = "Derives MetaField payloads from downlinked packets")]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,
}

fn main() {
    let cli = Cli::parse();
    run_app(&cli.common, "meta", |name, shutdown| run(cli.common.clone(), name, shutdown))
}

async fn run(common: CommonArgs, name: String, shutdown: CancellationToken) -> anyhow::Result<()> {
    let config = common.load_config()?;
    let standards = config.load_standards()?;
    let modules = config
        .meta_modules
        .iter()
        .map(|m| m.build().with_context(|| format!("meta module {}", m.name)))
        .collect::<anyhow::Result<Vec<_>>>()?;
    let mut engine = MetaEngine::new(&standards, modules)?;
    let names: Vec<&str> = config.meta_modules.iter().map(|m| m.name.as_str()).collect();
    info!(modules = ?names, "meta engine ready");

    let mut app = IpcAppManager::builder(&name)
        .host(&config.ipc.host)
        .port_offset(config.ipc.port_offset)
        .high_water_mark(config.ipc.high_water_mark)
        .socket("packets", SocketSpec::subscriber(Port::TransceiverPub, [Topic::DlPackets]))
        .socket("payloads", SocketSpec::publisher(Port::MetaPub))
        .build(shutdown)
        .await?;

    let result = loop {
        let message = match app.read("packets").await {
            Ok(payload) => payload.message,
            Err(GdsError::Shutdown) => break Ok(()),
            Err(e) => break Err(e.into()),
        };
        let MessageContent::DownlinkedPacketsContent(DownlinkedPacketsContent { packets }) = message else {
            warn!("unexpected message on the packets socket");
            continue;
        };

        let mut out = PayloadCollection::new();
        for packet in &packets {
            let derived = engine.process_packet(packet);
            if !derived.is_empty() {
                debug!(derived = derived.len(), "from {packet}");
            }
            out.extend(packet.payloads.iter().cloned());
            out.extend(derived);
        }
        if out.is_empty() {
            continue;
        }
        if let Err(e) = app.send_to("payloads", &MessageContent::payloads(out)) {
            break Err(e.into());
        }
    };

    app.shutdown().await;
    result
}
