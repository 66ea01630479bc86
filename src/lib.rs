//! # SDR daemon core for a networked WebSDR IQ source
//!
//! The daemon ingests complex baseband samples from a remote CWSL
//! WebSDR server, fans them out to per-channel demodulator workers
//! through a broadcast ring, and exposes a UDP control plane carrying
//! typed TLV options. Clients tune channels, select presets, and
//! retrieve live status through that one socket.
//!
//! The DSP kernels, audio encoders, and the RTP sender are external
//! collaborators; this crate owns the ingest driver, the channel
//! store and lifecycle, and the control plane.

pub mod channel;
pub mod config;
pub mod demod;
pub mod frontend;
pub mod ring;
pub mod rt;
pub mod status;
pub mod tlv;
pub mod units;
pub mod websdr;

use std::{
    net::{
        SocketAddr,
        UdpSocket,
    },
    sync::Arc,
};

use tokio_util::sync::CancellationToken;

use crate::{
    channel::{
        ChannelList,
        preset::PresetTable,
    },
    config::DaemonConfig,
    frontend::{
        Frontend,
        FrontendHandle,
    },
    status::ControlPlane,
};

#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("configuration error")]
    Config(#[from] config::ConfigError),
    #[error("ingest setup failed")]
    Setup(#[from] websdr::SetupError),
    #[error("socket setup failed")]
    Io(#[from] std::io::Error),
}

/// Bind the control socket on the status port, joining the multicast
/// group when the destination is one. Status replies leave through
/// this same socket.
pub fn bind_control_socket(status_dest: &SocketAddr) -> Result<UdpSocket, std::io::Error> {
    match status_dest {
        SocketAddr::V4(v4) => {
            let socket = UdpSocket::bind(("0.0.0.0", v4.port()))?;
            if v4.ip().is_multicast() {
                socket.join_multicast_v4(v4.ip(), &std::net::Ipv4Addr::UNSPECIFIED)?;
                socket.set_multicast_loop_v4(true)?;
            }
            Ok(socket)
        }
        SocketAddr::V6(v6) => {
            let socket = UdpSocket::bind(("::", v6.port()))?;
            if v6.ip().is_multicast() {
                socket.join_multicast_v6(v6.ip(), 0)?;
                socket.set_multicast_loop_v6(true)?;
            }
            Ok(socket)
        }
    }
}

/// Run the daemon until the cancellation token fires.
pub async fn run(
    config: DaemonConfig,
    presets: PresetTable,
    cancel: CancellationToken,
) -> Result<(), DaemonError> {
    let status_dest = config.global.status_socket()?;
    let ctl_socket = Arc::new(bind_control_socket(&status_dest)?);
    let block_rate = 1000 / config.global.blocktime_ms.max(1);

    let frontend = Arc::new(FrontendHandle::new(Frontend::new(
        config.input.effective_description(),
    )));
    let source = websdr::setup(config.input, frontend.clone())?;

    let channels = Arc::new(ChannelList::new(config.global.channels, block_rate));
    let presets = Arc::new(presets);
    let (producer, subscriber) = ring::ring(demod::RING_DEPTH);

    let threads = source.startup(producer, cancel.clone())?;

    let control = ControlPlane {
        channels: channels.clone(),
        frontend: frontend.clone(),
        presets: presets.clone(),
        ctl_socket: ctl_socket.clone(),
        status_dest,
        worker: demod::WorkerDeps {
            frontend,
            presets,
            ring: subscriber,
            ctl_socket,
            status_dest,
            block_rate,
            idle_timeout_blocks: channels.idle_timeout_blocks(),
            cancel: cancel.clone(),
        },
    };

    let result = status::radio_status(control, cancel.clone()).await;

    // the reader notices the token and runs the disconnect sequence
    cancel.cancel();
    let _ = tokio::task::spawn_blocking(move || threads.join()).await;

    result.map_err(Into::into)
}
