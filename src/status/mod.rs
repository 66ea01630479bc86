//! Control-plane status thread.
//!
//! Receives CMD datagrams on the control socket, routes them by SSRC,
//! creates channels on demand, and answers with STATUS packets. Only
//! the dynamic-creation path decodes commands here; established
//! channels execute their own commands on their worker thread, fed
//! through the per-channel mailbox.

pub mod decode;
pub mod encode;

use std::{
    net::{
        SocketAddr,
        UdpSocket,
    },
    sync::Arc,
};

pub use decode::{
    CommandDisposition,
    DecodeContext,
    decode_radio_commands,
    is_reserved_ssrc,
};
pub use encode::{
    encode_radio_status,
    reset_radio_status,
    send_radio_status,
};
use tokio_util::sync::CancellationToken;

use crate::{
    channel::{
        BROADCAST_SSRC,
        ChannelList,
        TEMPLATE_SSRC,
        preset::PresetTable,
    },
    demod::{
        WorkerDeps,
        start_demod,
    },
    frontend::FrontendHandle,
    tlv::{
        self,
        PacketKind,
    },
};

/// Largest control datagram we accept.
const PKTSIZE: usize = 16_384;

/// Shared pieces of the control plane.
#[derive(Debug)]
pub struct ControlPlane {
    pub channels: Arc<ChannelList>,
    pub frontend: Arc<FrontendHandle>,
    pub presets: Arc<PresetTable>,
    pub ctl_socket: Arc<UdpSocket>,
    pub status_dest: SocketAddr,
    pub worker: WorkerDeps,
}

impl ControlPlane {
    /// Route one inbound datagram. Anything that is not a command is
    /// dropped without a word; responses also arrive on this socket.
    pub fn handle_packet(&self, datagram: &[u8], sender: SocketAddr) {
        let Some((&kind, payload)) = datagram.split_first()
        else {
            return;
        };
        if PacketKind::from_byte(kind) != Some(PacketKind::Cmd) {
            return;
        }

        match tlv::find_ssrc(payload).unwrap_or(TEMPLATE_SSRC) {
            TEMPLATE_SSRC => {
                // reserved for the dynamic channel template
            }
            BROADCAST_SSRC => self.schedule_broadcast(),
            ssrc => self.route_to_channel(ssrc, payload, sender),
        }
    }

    /// Ask every channel to dump its status, staggered two per tick
    /// so the replies don't all land in one burst.
    fn schedule_broadcast(&self) {
        for slot in self.channels.iter() {
            if !slot.is_inuse() || is_reserved_ssrc(slot.ssrc()) {
                continue;
            }
            slot.mailbox.lock().global_timer = (slot.index() >> 1) as u32 + 1;
        }
    }

    fn route_to_channel(&self, ssrc: u32, payload: &[u8], sender: SocketAddr) {
        if let Some(slot) = self.channels.lookup(ssrc) {
            // single-slot mailbox until this grows a real queue
            if !slot.enqueue_command(payload) {
                tracing::debug!(ssrc, %sender, "mailbox occupied, command dropped");
            }
            return;
        }

        match self.channels.create(ssrc) {
            Err(error) => {
                tracing::error!(ssrc, %sender, %error, "dynamic channel create failed");
            }
            Ok(slot) => {
                {
                    let mut body = slot.body.lock();
                    body.refresh_rtp_type();
                    let ctx = DecodeContext {
                        frontend: &self.frontend,
                        presets: &self.presets,
                        block_rate: self.channels.block_rate(),
                        idle_timeout_blocks: self.channels.idle_timeout_blocks(),
                        sender,
                    };
                    let disposition = decode_radio_commands(&mut body, &ctx, payload);
                    let frontend = self.frontend.snapshot();
                    send_radio_status(
                        &self.ctl_socket,
                        &self.status_dest,
                        &frontend,
                        &self.status_dest,
                        &mut body,
                        disposition == CommandDisposition::SpectrumChanged,
                    );
                    reset_radio_status(&mut body);
                }
                slot.mailbox.lock().global_timer = 0;
                // the worker detaches; expiry or cancellation ends it
                let _ = start_demod(slot.clone(), self.worker.clone());
                tracing::info!(ssrc, %sender, "dynamically started channel");
            }
        }
    }
}

/// Receive loop of the status thread.
pub async fn radio_status(
    control: ControlPlane,
    cancel: CancellationToken,
) -> Result<(), std::io::Error> {
    let std_socket = control.ctl_socket.try_clone()?;
    std_socket.set_nonblocking(true)?;
    let socket = tokio::net::UdpSocket::from_std(std_socket)?;

    let mut buffer = vec![0u8; PKTSIZE];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            result = socket.recv_from(&mut buffer) => {
                let (length, sender) = result?;
                control.handle_packet(&buffer[..length], sender);
            }
        }
    }

    tracing::debug!("status thread exiting");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        channel::DemodType,
        demod::RING_DEPTH,
        frontend::Frontend,
        ring,
        tlv::{
            Options,
            Tag,
            encode_eol,
        },
    };

    const BLOCK_RATE: u32 = 50;

    struct Fixture {
        control: ControlPlane,
        _producer: ring::Producer,
        status_rx: UdpSocket,
        sender: SocketAddr,
    }

    fn fixture() -> Fixture {
        let (producer, subscriber) = ring::ring(RING_DEPTH);
        let status_rx = UdpSocket::bind("127.0.0.1:0").unwrap();
        status_rx
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let status_dest = status_rx.local_addr().unwrap();
        let ctl_socket = Arc::new(UdpSocket::bind("127.0.0.1:0").unwrap());

        let mut frontend = Frontend::new("dispatch test");
        frontend.samprate = 192_000;
        frontend.frequency = 7_100_000.0;
        let frontend = Arc::new(FrontendHandle::new(frontend));
        let presets = Arc::new(PresetTable::builtin());
        let channels = Arc::new(ChannelList::new(8, BLOCK_RATE));
        let cancel = CancellationToken::new();

        Fixture {
            control: ControlPlane {
                channels: channels.clone(),
                frontend: frontend.clone(),
                presets: presets.clone(),
                ctl_socket: ctl_socket.clone(),
                status_dest,
                worker: WorkerDeps {
                    frontend,
                    presets,
                    ring: subscriber,
                    ctl_socket,
                    status_dest,
                    block_rate: BLOCK_RATE,
                    idle_timeout_blocks: 1000,
                    cancel,
                },
            },
            _producer: producer,
            status_rx,
            sender: "127.0.0.1:41000".parse().unwrap(),
        }
    }

    fn cmd(options: impl FnOnce(&mut Vec<u8>)) -> Vec<u8> {
        let mut datagram = vec![PacketKind::Cmd.to_byte()];
        options(&mut datagram);
        encode_eol(&mut datagram);
        datagram
    }

    fn recv_status(socket: &UdpSocket) -> std::collections::HashMap<u8, Vec<u8>> {
        let mut buffer = [0u8; PKTSIZE];
        let (length, _) = socket.recv_from(&mut buffer).unwrap();
        assert_eq!(PacketKind::from_byte(buffer[0]), Some(PacketKind::Status));
        Options::new(&buffer[1..length])
            .map(|option| (option.tag.0, option.value.to_vec()))
            .collect()
    }

    #[test]
    fn non_command_packets_are_ignored() {
        let fx = fixture();
        fx.control.handle_packet(&[], fx.sender);
        fx.control
            .handle_packet(&[PacketKind::Status.to_byte(), 0], fx.sender);
        assert!(fx.control.channels.lookup(1).is_none());
    }

    #[test]
    fn template_ssrc_changes_nothing() {
        let fx = fixture();
        let datagram = cmd(|buffer| {
            tlv::encode_int(buffer, Tag::OUTPUT_SSRC, TEMPLATE_SSRC.into());
            tlv::encode_int(buffer, Tag::OUTPUT_SAMPRATE, 48_000);
        });
        fx.control.handle_packet(&datagram, fx.sender);
        assert!(fx.control.channels.iter().all(|slot| !slot.is_inuse()));
    }

    #[test]
    fn broadcast_staggers_global_timers_only() {
        let fx = fixture();
        let slots: Vec<_> = [10u32, 20, 30].iter().map(|&ssrc| {
            let slot = fx.control.channels.create(ssrc).unwrap();
            slot.body.lock().tune.freq = 7_000_000.0;
            slot
        }).collect();
        let before: Vec<_> = slots.iter().map(|s| s.body.lock().clone()).collect();

        let datagram = cmd(|buffer| {
            tlv::encode_int(buffer, Tag::OUTPUT_SSRC, BROADCAST_SSRC.into());
            // any other options are irrelevant on a broadcast
            tlv::encode_int(buffer, Tag::OUTPUT_SAMPRATE, 48_000);
        });
        fx.control.handle_packet(&datagram, fx.sender);

        for (slot, before) in slots.iter().zip(&before) {
            assert_eq!(
                slot.mailbox.lock().global_timer,
                (slot.index() >> 1) as u32 + 1
            );
            let after = slot.body.lock();
            assert_eq!(after.output.samprate, before.output.samprate);
            assert_eq!(after.status.packets_in, before.status.packets_in);
        }
    }

    #[test]
    fn known_ssrc_lands_in_the_mailbox() {
        let fx = fixture();
        let slot = fx.control.channels.create(77).unwrap();

        let datagram = cmd(|buffer| {
            tlv::encode_int(buffer, Tag::OUTPUT_SSRC, 77);
            tlv::encode_int(buffer, Tag::COMMAND_TAG, 1);
        });
        fx.control.handle_packet(&datagram, fx.sender);
        assert!(slot.take_command().is_some());

        // mailbox holds one command; a second arrival while occupied
        // is dropped
        fx.control.handle_packet(&datagram, fx.sender);
        fx.control.handle_packet(&datagram, fx.sender);
        assert!(slot.take_command().is_some());
        assert!(slot.take_command().is_none());
    }

    #[test]
    fn unknown_ssrc_creates_channel_and_replies_once() {
        let fx = fixture();

        let datagram = cmd(|buffer| {
            tlv::encode_int(buffer, Tag::OUTPUT_SSRC, 42);
            tlv::encode_float(buffer, Tag::LOW_EDGE, 200.0);
            tlv::encode_float(buffer, Tag::HIGH_EDGE, 2800.0);
            tlv::encode_string(buffer, Tag::PRESET, "usb");
        });
        fx.control.handle_packet(&datagram, fx.sender);

        let slot = fx.control.channels.lookup(42).expect("channel created");
        {
            let body = slot.body.lock();
            assert_eq!(body.filter.min_if, 200.0);
            assert_eq!(body.filter.max_if, 2800.0);
            assert_eq!(body.preset, "usb");
            assert_eq!(body.status.blocks_since_poll, 0);
        }
        assert_eq!(slot.mailbox.lock().global_timer, 0);

        // exactly one status reply went to the status group
        let options = recv_status(&fx.status_rx);
        assert_eq!(tlv::decode_u32(&options[&Tag::OUTPUT_SSRC.0]), 42);
        fx.status_rx
            .set_read_timeout(Some(Duration::from_millis(200)))
            .unwrap();
        let mut buffer = [0u8; PKTSIZE];
        assert!(fx.status_rx.recv_from(&mut buffer).is_err());

        fx.control.worker.cancel.cancel();
    }

    #[test]
    fn spectrum_creation_reply_omits_bin_data() {
        let fx = fixture();

        let datagram = cmd(|buffer| {
            tlv::encode_int(buffer, Tag::OUTPUT_SSRC, 55);
            tlv::encode_int(buffer, Tag::DEMOD_TYPE, DemodType::Spect.to_int().into());
            tlv::encode_int(buffer, Tag::BIN_COUNT, 128);
            tlv::encode_float(buffer, Tag::NONCOHERENT_BIN_BW, 500.0);
        });
        fx.control.handle_packet(&datagram, fx.sender);

        let options = recv_status(&fx.status_rx);
        assert_eq!(tlv::decode_u32(&options[&Tag::BIN_COUNT.0]), 128);
        assert!(!options.contains_key(&Tag::BIN_DATA.0));

        fx.control.worker.cancel.cancel();
    }

    #[test]
    fn create_failure_is_survivable() {
        let fx = fixture();
        for ssrc in 1..=8 {
            fx.control.channels.create(ssrc).unwrap();
        }

        let datagram = cmd(|buffer| {
            tlv::encode_int(buffer, Tag::OUTPUT_SSRC, 99);
        });
        // table is full; the command is logged and dropped
        fx.control.handle_packet(&datagram, fx.sender);
        assert!(fx.control.channels.lookup(99).is_none());
    }
}
