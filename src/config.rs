//! App configuration: command-line flags shared by every binary, the YAML
//! config file, and process exit codes.

use std::future::Future;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Args;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, warn};

use crate::codec::PacketDispatcher;
use crate::framing::{EndecChain, EndecKind};
use crate::ipc::DEFAULT_HIGH_WATER_MARK;
use crate::logging::{self, LogLevel};
use crate::meta::MetaModuleConfig;
use crate::standards::{DataStandards, prebuilt};
use crate::transceiver::{
    FrameProcessor, ParameterMap, PcapOptions, PcapTransceiver, ReplayOptions, ReplayTransceiver, StreamSource,
    StreamTransceiver, Transceiver, UdpTransceiver,
};
use crate::types::{DataPathway, DataSource};
use crate::{GdsError, Result};

/// Clean exit.
pub const EXIT_SUCCESS: i32 = 0;
/// Unhandled error.
pub const EXIT_FAILURE: i32 = 1;
/// Stopped by a shutdown signal.
pub const EXIT_SHUTDOWN: i32 = 2;

/// Flags every app accepts.
#[derive(Args, Debug, Clone)]
pub struct CommonArgs {
    /// App identity, used in logs and socket names.
    #[arg(long, env = "IRIS_APP_NAME")]
    pub name: Option<String>,

    /// Minimum log level; `RUST_LOG` overrides it.
    #[arg(long, value_enum, default_value = "info", env = "IRIS_LOG_LEVEL")]
    pub log_level: LogLevel,

    /// YAML config file. Built-in defaults are used without one.
    #[arg(long, short, env = "IRIS_CONFIG")]
    pub config: Option<PathBuf>,
}

impl CommonArgs {
    pub fn name_or<'a>(&'a self, default: &'a str) -> &'a str {
        self.name.as_deref().unwrap_or(default)
    }

    pub fn load_config(&self) -> Result<GdsConfig> {
        match &self.config {
            Some(path) => {
                let mut config = GdsConfig::load(path)?;
                if let Some(dir) = path.parent() {
                    config.resolve_paths(dir);
                }
                Ok(config)
            }
            None => Ok(GdsConfig::default()),
        }
    }
}

/// How apps reach the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IpcConfig {
    pub host: String,
    /// Added to every well-known port.
    pub port_offset: u16,
    /// Frames a socket queues before dropping the oldest.
    pub high_water_mark: usize,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self { host: "127.0.0.1".into(), port_offset: 0, high_water_mark: DEFAULT_HIGH_WATER_MARK }
    }
}

/// Physical or archived link a transceiver reads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LinkConfig {
    Stream { source: StreamSource },
    Udp { bind: SocketAddr, peer: Option<SocketAddr> },
    Replay(ReplayOptions),
    Pcap(PcapOptions),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransceiverConfig {
    pub name: String,
    pub link: LinkConfig,
    /// Framing inside the link's own (SLIP or datagram) framing, outermost
    /// first.
    #[serde(default)]
    pub layers: Vec<EndecKind>,
    #[serde(default)]
    pub pathway: DataPathway,
}

impl TransceiverConfig {
    pub fn build(&self, dispatcher: Arc<PacketDispatcher>, map: &ParameterMap) -> Box<dyn Transceiver> {
        let processor = |source| {
            FrameProcessor::new(EndecChain::from_kinds(&self.layers), dispatcher.clone(), self.pathway, source)
        };
        match &self.link {
            LinkConfig::Stream { source } => {
                Box::new(StreamTransceiver::new(&self.name, source.clone(), processor(DataSource::SerialDirect)))
            }
            LinkConfig::Udp { bind, peer } => {
                Box::new(UdpTransceiver::new(&self.name, *bind, *peer, processor(DataSource::UdpDirect)))
            }
            LinkConfig::Replay(opts) => Box::new(ReplayTransceiver::new(opts.clone(), map.clone(), dispatcher.clone())),
            LinkConfig::Pcap(opts) => {
                Box::new(PcapTransceiver::new(&self.name, opts.clone(), processor(DataSource::Pcap)))
            }
        }
    }
}

/// Everything an app reads from its config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GdsConfig {
    pub ipc: IpcConfig,
    /// Data standards YAML. Only the built-in modules are known without it.
    pub standards: Option<PathBuf>,
    /// Where file groups are exported.
    pub export_dir: PathBuf,
    /// Goes into exported file names.
    pub image_prefix: String,
    /// Fills missing bytes of short lines.
    pub pad_byte: u8,
    /// YAMCS parameter map. The built-in map is used without it.
    pub parameter_map: Option<PathBuf>,
    pub transceivers: Vec<TransceiverConfig>,
    pub meta_modules: Vec<MetaModuleConfig>,
}

impl Default for GdsConfig {
    fn default() -> Self {
        Self {
            ipc: IpcConfig::default(),
            standards: None,
            export_dir: PathBuf::from("./out/images"),
            image_prefix: "iris".into(),
            pad_byte: 0xAA,
            parameter_map: None,
            transceivers: Vec::new(),
            meta_modules: Vec::new(),
        }
    }
}

impl GdsConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        Ok(serde_yaml_ng::from_str(yaml)?)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path)
            .map_err(|e| GdsError::config(format!("cannot read {}: {e}", path.display())))?;
        let config = Self::from_yaml_str(&yaml)
            .map_err(|e| GdsError::config(format!("{}: {e}", path.display())))?;
        info!(
            path = %path.display(),
            transceivers = config.transceivers.len(),
            meta_modules = config.meta_modules.len(),
            "loaded config"
        );
        Ok(config)
    }

    pub fn load_standards(&self) -> Result<DataStandards> {
        match &self.standards {
            Some(path) => DataStandards::load(path),
            None => {
                warn!("no data standards configured, only built-in modules are known");
                DataStandards::new(prebuilt::modules())
            }
        }
    }

    pub fn load_parameter_map(&self) -> Result<ParameterMap> {
        match &self.parameter_map {
            Some(path) => ParameterMap::load(path),
            None => Ok(ParameterMap::default()),
        }
    }

    /// Relative paths in the config resolve against `base`, usually the
    /// config file's directory.
    pub fn resolve_paths(&mut self, base: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        if let Some(p) = self.standards.as_mut() {
            resolve(p);
        }
        if let Some(p) = self.parameter_map.as_mut() {
            resolve(p);
        }
        resolve(&mut self.export_dir);
        for xcvr in &mut self.transceivers {
            match &mut xcvr.link {
                LinkConfig::Replay(opts) => resolve(&mut opts.path),
                LinkConfig::Pcap(opts) => resolve(&mut opts.path),
                LinkConfig::Stream { .. } | LinkConfig::Udp { .. } => {}
            }
        }
    }
}

/// Cancels `shutdown` on Ctrl-C or SIGTERM.
pub fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sig) => {
                    sig.recv().await;
                }
                Err(e) => {
                    warn!("cannot listen for SIGTERM: {e}");
                    std::future::pending::<()>().await;
                }
            }
        };
        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = shutdown.cancelled() => return,
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    warn!("cannot listen for Ctrl-C: {e}");
                    return;
                }
            }
            _ = terminate => {}
        }
        info!("shutdown signalled");
        shutdown.cancel();
    });
}

/// Runs an app on a single-threaded runtime and exits the process with its
/// exit code. `app` gets the app name and the shutdown token, which Ctrl-C
/// and SIGTERM cancel.
pub fn run_app<F, Fut>(common: &CommonArgs, default_name: &str, app: F) -> !
where
    F: FnOnce(String, CancellationToken) -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    let name = common.name_or(default_name).to_string();
    let span = logging::init(&name, common.log_level);
    let shutdown = CancellationToken::new();
    let result = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(anyhow::Error::from)
        .and_then(|runtime| {
            let shutdown = shutdown.clone();
            runtime.block_on(
                async move {
                    spawn_signal_handler(shutdown.clone());
                    app(name, shutdown).await
                }
                .instrument(span),
            )
        });
    if let Err(e) = &result {
        error!("{e:#}");
    }
    std::process::exit(exit_code(&result, &shutdown))
}

/// Exit code for an app that ran until `result`.
pub fn exit_code<T>(result: &anyhow::Result<T>, shutdown: &CancellationToken) -> i32 {
    match result {
        Err(_) => EXIT_FAILURE,
        Ok(_) if shutdown.is_cancelled() => EXIT_SHUTDOWN,
        Ok(_) => EXIT_SUCCESS,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser, Debug)]
    struct Cli {
        #[command(flatten)]
        common: CommonArgs,
    }

    #[test]
    fn parses_common_flags() {
        let cli = Cli::try_parse_from(["app", "--name", "xcvr-wired", "--log-level", "debug"]).unwrap();
        assert_eq!(cli.common.name_or("xcvr"), "xcvr-wired");
        assert_eq!(cli.common.log_level, LogLevel::Debug);

        let cli = Cli::try_parse_from(["app"]).unwrap();
        assert_eq!(cli.common.name_or("xcvr"), "xcvr");
        assert_eq!(cli.common.log_level, LogLevel::Info);
    }

    #[test]
    fn parses_full_config() {
        let yaml = r#"
ipc:
  port_offset: 100
export_dir: /tmp/images
pad_byte: 0
transceivers:
  - name: wired
    pathway: WIRED
    link:
      kind: stream
      source: { kind: serial, device: /dev/ttyUSB0, baud: 9600 }
  - name: wifi
    pathway: WIRELESS
    layers: [{ kind: ip_udp, src_addr: 192.168.1.2, dst_addr: 192.168.150.3, src_port: 8080, dst_port: 8080 }]
    link: { kind: udp, bind: "0.0.0.0:42000", peer: null }
  - name: archive
    link: { kind: replay, path: archive.jsonl, speed: 4.0 }
  - name: bench
    link: { kind: pcap, path: bench.pcap, filter_port: 8080, period_ms: 20 }
meta_modules:
  - name: Power
    id: 0x5000
    fields:
      - { kind: linear, name: VoltageMv, input: Power_Voltage, scale: 1000.0 }
"#;
        let config = GdsConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.ipc.port_offset, 100);
        assert_eq!(config.ipc.host, "127.0.0.1");
        assert_eq!(config.pad_byte, 0);
        assert_eq!(config.transceivers.len(), 4);
        assert_eq!(config.transceivers[0].pathway, DataPathway::Wired);
        assert!(matches!(config.transceivers[1].link, LinkConfig::Udp { peer: None, .. }));
        assert!(matches!(&config.transceivers[2].link, LinkConfig::Replay(o) if o.speed == 4.0 && o.loop_playback));
        assert!(
            matches!(&config.transceivers[3].link, LinkConfig::Pcap(o) if o.filter_port == Some(8080) && !o.loop_playback)
        );
        assert_eq!(config.meta_modules[0].fields.len(), 1);
    }

    #[test]
    fn missing_file_is_a_config_error() {
        let err = GdsConfig::load("/nonexistent/iris.yaml").unwrap_err();
        assert!(matches!(err, GdsError::Config { .. }));
    }

    #[test]
    fn relative_paths_follow_the_config_file() {
        let mut config = GdsConfig { standards: Some("standards.yaml".into()), ..GdsConfig::default() };
        config.transceivers.push(TransceiverConfig {
            name: "bench".into(),
            link: LinkConfig::Pcap(PcapOptions { path: "bench.pcap".into(), ..PcapOptions::default() }),
            layers: Vec::new(),
            pathway: DataPathway::Wired,
        });
        config.resolve_paths(Path::new("/etc/iris"));
        assert!(matches!(&config.transceivers[0].link, LinkConfig::Pcap(o) if o.path == Path::new("/etc/iris/bench.pcap")));
        assert_eq!(config.standards.unwrap(), PathBuf::from("/etc/iris/standards.yaml"));
        assert_eq!(config.export_dir, PathBuf::from("/etc/iris/./out/images"));
    }

    #[test]
    fn exit_codes() {
        let shutdown = CancellationToken::new();
        assert_eq!(exit_code(&anyhow::Ok(()), &shutdown), EXIT_SUCCESS);
        assert_eq!(exit_code::<()>(&Err(anyhow::anyhow!("boom")), &shutdown), EXIT_FAILURE);
        shutdown.cancel();
        assert_eq!(exit_code(&anyhow::Ok(()), &shutdown), EXIT_SHUTDOWN);
    }

    #[test]
    fn builds_every_link_kind() {
        let dispatcher = Arc::new(PacketDispatcher::new(Arc::new(crate::test_utils::fixtures::standards())));
        let map = ParameterMap::default();
        let config = TransceiverConfig {
            name: "udp".into(),
            link: LinkConfig::Udp { bind: "127.0.0.1:0".parse().unwrap(), peer: None },
            layers: vec![EndecKind::Passthrough],
            pathway: DataPathway::Wireless,
        };
        assert_eq!(config.build(dispatcher.clone(), &map).name(), "udp");

        let replay = TransceiverConfig {
            name: "replay".into(),
            link: LinkConfig::Replay(ReplayOptions::default()),
            layers: Vec::new(),
            pathway: DataPathway::None,
        };
        assert!(!replay.build(dispatcher.clone(), &map).name().is_empty());

        let pcap = TransceiverConfig {
            name: "bench".into(),
            link: LinkConfig::Pcap(PcapOptions::default()),
            layers: Vec::new(),
            pathway: DataPathway::Wired,
        };
        assert_eq!(pcap.build(dispatcher, &map).name(), "bench");
    }
}
