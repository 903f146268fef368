//! Imager app: rebuilds downlinked files from their blocks and exports each
//! one as soon as it is complete.

use async_trait::async_trait;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use iris_gds::{GdsError, Result};
use iris_gds::config::{CommonArgs, run_app};
use iris_gds::files::{FileBlockAssembler, ImageWriter};
use iris_gds::ipc::{
    DownlinkedPayloadsContent, IpcAppManager, IpcPayload, MessageContent, Port, SocketSpec, Topic, TopicHandler,
};

#[derive(Parser, Debug)]
#[command(name = "iris-imager", version, about = "Reassembles and exports downlinked images")]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    /// Also export groups still incomplete at shutdown.
    #[arg(long)]
    export_partial: bool,
}

fn main() {
    let cli = Cli::parse();
    let common = cli.common.clone();
    run_app(&common, "imager", |name, shutdown| run(cli, name, shutdown))
}

/// Feeds file blocks to the assembler and exports each group as it
/// completes.
struct ImageExporter {
    assembler: FileBlockAssembler,
    writer: ImageWriter,
    exported: usize,
}

impl ImageExporter {
    fn export(&mut self, file_group_id: u16) {
        let Some(file) = self.assembler.take(file_group_id) else {
            return;
        };
        match self.writer.write(&file) {
            Ok(paths) => {
                self.exported += 1;
                info!(fgid = file_group_id, complete = file.complete, raw = %paths.raw.display(), "file group exported");
            }
            Err(e) => error!(fgid = file_group_id, "export failed: {e}"),
        }
    }

    /// Deals with groups still open at shutdown: exports them when
    /// `partial` is set, otherwise reports each one.
    fn finish(&mut self, partial: bool) {
        let open: Vec<u16> = self.assembler.in_progress().map(|(id, _)| id).collect();
        for fgid in open {
            if partial {
                self.export(fgid);
            } else if let Some(group) = self.assembler.group(fgid) {
                warn!(fgid, "left incomplete: {group}");
            }
        }
        info!(exported = self.exported, "imager done");
    }
}

#[async_trait]
impl TopicHandler for ImageExporter {
    async fn handle(&mut self, payload: IpcPayload) -> Result<()> {
        let MessageContent::DownlinkedPayloadsContent(DownlinkedPayloadsContent { payloads }) = payload.message else {
            warn!("unexpected message on the payloads topic");
            return Ok(());
        };
        for fgid in self.assembler.add_payloads(&payloads) {
            self.export(fgid);
        }
        Ok(())
    }
}

async fn run(cli: Cli, name: String, shutdown: CancellationToken) -> anyhow::Result<()> {
    let config = cli.common.load_config()?;
    let writer = ImageWriter::new(&config.export_dir, &config.image_prefix);
    info!(dir = %writer.dir().display(), "exporting images");

    let mut app = IpcAppManager::builder(&name)
        .host(&config.ipc.host)
        .port_offset(config.ipc.port_offset)
        .high_water_mark(config.ipc.high_water_mark)
        .socket("payloads", SocketSpec::subscriber(Port::MetaPub, [Topic::DlPayloads]))
        .build(shutdown)
        .await?;

    let mut exporter = ImageExporter { assembler: FileBlockAssembler::new(config.pad_byte), writer, exported: 0 };
    let result = loop {
        match app.read("payloads").await {
            Ok(payload) => {
                if let Err(e) = exporter.handle(payload).await {
                    break Err(e);
                }
            }
            Err(GdsError::Shutdown) => break Ok(()),
            Err(e) => break Err(e),
        }
    };
    exporter.finish(cli.export_partial);
    app.shutdown().await;
    Ok(result?)
}
