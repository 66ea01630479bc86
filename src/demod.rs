//! Per-channel worker threads and their scheduling glue.
//!
//! Every active channel gets a worker that consumes ring blocks,
//! counts down the idle lifetime, executes mailbox commands, and
//! emits status at the channel's cadence. The DSP proper sits behind
//! [`DemodKernel`]; a restart tears the kernel down and builds a new
//! one without disturbing the channel slot.

use std::{
    net::{
        SocketAddr,
        UdpSocket,
    },
    sync::Arc,
    time::Duration,
};

use num_complex::Complex;
use tokio_util::sync::CancellationToken;

use crate::{
    channel::{
        Channel,
        ChannelSlot,
        DemodType,
        preset::PresetTable,
        unspecified_socket,
    },
    frontend::FrontendHandle,
    ring,
    status::{
        CommandDisposition,
        DecodeContext,
        decode_radio_commands,
        reset_radio_status,
        send_radio_status,
    },
};

/// In-flight blocks between the ingest driver and the workers.
pub const RING_DEPTH: usize = 64;

/// Smoothing constant of the baseband power estimate.
const BB_POWER_ALPHA: f32 = 0.05;

/// Everything a worker needs besides its channel slot.
#[derive(Clone, Debug)]
pub struct WorkerDeps {
    pub frontend: Arc<FrontendHandle>,
    pub presets: Arc<PresetTable>,
    pub ring: ring::Subscriber,
    pub ctl_socket: Arc<UdpSocket>,
    pub status_dest: SocketAddr,
    pub block_rate: u32,
    pub idle_timeout_blocks: u32,
    pub cancel: CancellationToken,
}

/// Seam to the demodulation kernels. The real kernels (mixer, FIR,
/// PLL, discriminator, resampler) live outside this crate; the core
/// only drives them block by block.
pub trait DemodKernel: Send {
    fn process(&mut self, chan: &mut Channel, samples: &[Complex<f32>]);
}

/// Baseband power bookkeeping shared by the audio demod types.
struct PowerKernel {
    input_samprate: u32,
}

impl DemodKernel for PowerKernel {
    fn process(&mut self, chan: &mut Channel, samples: &[Complex<f32>]) {
        if samples.is_empty() {
            return;
        }
        let energy: f32 = samples.iter().map(|s| s.norm_sqr()).sum();
        let mean = energy / samples.len() as f32;
        chan.sig.bb_power += BB_POWER_ALPHA * (mean - chan.sig.bb_power);
        chan.output.power = chan.sig.bb_power * chan.output.gain * chan.output.gain;
        if self.input_samprate > 0 {
            chan.output.samples +=
                samples.len() as u64 * chan.output.samprate as u64 / self.input_samprate as u64;
        }
    }
}

/// Noncoherent spectrum aggregation. This kernel is the sole owner of
/// `spectrum.bin_data`: it allocates on parameter changes, the
/// control plane only flags them.
struct SpectrumKernel {
    next_bin: usize,
}

impl SpectrumKernel {
    fn ensure_storage(chan: &mut Channel) {
        let bin_count = chan.spectrum.bin_count as usize;
        let stale = chan.spectrum.params_changed
            || chan
                .spectrum
                .bin_data
                .as_ref()
                .is_none_or(|bins| bins.len() != bin_count);
        if stale {
            chan.spectrum.bin_data = Some(vec![0.0; bin_count]);
            chan.spectrum.params_changed = false;
        }
    }
}

impl DemodKernel for SpectrumKernel {
    fn process(&mut self, chan: &mut Channel, samples: &[Complex<f32>]) {
        Self::ensure_storage(chan);
        if samples.is_empty() {
            return;
        }
        let energy: f32 =
            samples.iter().map(|s| s.norm_sqr()).sum::<f32>() / samples.len() as f32;
        if let Some(bins) = &mut chan.spectrum.bin_data
            && !bins.is_empty()
        {
            self.next_bin %= bins.len();
            bins[self.next_bin] += energy;
            self.next_bin += 1;
        }
    }
}

fn kernel_for(demod_type: DemodType, input_samprate: u32) -> Box<dyn DemodKernel> {
    match demod_type {
        DemodType::Linear | DemodType::Fm | DemodType::Wfm => {
            Box::new(PowerKernel { input_samprate })
        }
        DemodType::Spect => Box::new(SpectrumKernel { next_bin: 0 }),
    }
}

/// Fold the accumulated bin energies into per-poll averages. Called
/// by the status emitter; tolerates absent storage.
pub fn spectrum_poll(chan: &mut Channel) {
    let blocks = chan.status.blocks_since_poll;
    if blocks == 0 {
        return;
    }
    if let Some(bins) = &mut chan.spectrum.bin_data {
        let scale = 1.0 / blocks as f32;
        for bin in bins {
            *bin *= scale;
        }
    }
}

/// Where a channel's status replies go: its own status destination
/// when a client set one, the daemon-wide group otherwise.
fn reply_dest(chan: &Channel, fallback: SocketAddr) -> SocketAddr {
    let dest = chan.status.dest_socket;
    if dest.ip().is_unspecified() || dest.port() == 0 {
        fallback
    }
    else {
        dest
    }
}

/// Spawn the worker thread for a channel slot.
pub fn start_demod(slot: Arc<ChannelSlot>, deps: WorkerDeps) -> std::thread::JoinHandle<()> {
    let ssrc = slot.ssrc();
    std::thread::Builder::new()
        .name(format!("demod-{ssrc}"))
        .spawn(move || worker(slot, deps))
        .expect("spawning a demod worker failed")
}

fn worker(slot: Arc<ChannelSlot>, deps: WorkerDeps) {
    let ssrc = slot.ssrc();
    let _guard = tracing::debug_span!("demod worker", ssrc).entered();

    let mut consumer = deps.ring.consumer();
    let input_samprate = deps.frontend.snapshot().samprate;
    let block_timeout = Duration::from_millis(2000 / deps.block_rate.max(1) as u64);

    'restart: loop {
        let demod_type = slot.body.lock().demod_type;
        let mut kernel = kernel_for(demod_type, input_samprate);
        tracing::debug!(?demod_type, "worker running");

        loop {
            if deps.cancel.is_cancelled() {
                tracing::debug!("worker cancelled");
                return;
            }

            match consumer.recv_timeout(block_timeout) {
                Ok(block) => {
                    let mut body = slot.body.lock();
                    kernel.process(&mut body, &block);
                    body.status.blocks_since_poll += 1;
                    if body.lifetime > 0 {
                        body.lifetime -= 1;
                        if body.lifetime == 0 {
                            drop(body);
                            tracing::info!("channel expired");
                            slot.release();
                            return;
                        }
                    }
                }
                Err(ring::RecvError::TimedOut) => {
                    // idle stream; commands still get executed below
                }
                Err(ring::RecvError::Closed) => {
                    tracing::debug!("sample ring closed, worker exiting");
                    return;
                }
            }

            if let Some(command) = slot.take_command() {
                let mut body = slot.body.lock();
                let ctx = DecodeContext {
                    frontend: &deps.frontend,
                    presets: &deps.presets,
                    block_rate: deps.block_rate,
                    idle_timeout_blocks: deps.idle_timeout_blocks,
                    sender: unspecified_socket(),
                };
                let disposition = decode_radio_commands(&mut body, &ctx, &command);
                emit_status(
                    &deps,
                    &mut body,
                    disposition == CommandDisposition::SpectrumChanged,
                );
                if disposition == CommandDisposition::RestartNeeded {
                    drop(body);
                    tracing::debug!("restarting demod");
                    continue 'restart;
                }
            }

            let broadcast_due = {
                let mut mailbox = slot.mailbox.lock();
                if mailbox.global_timer > 0 {
                    mailbox.global_timer -= 1;
                    mailbox.global_timer == 0
                }
                else {
                    false
                }
            };
            if broadcast_due {
                let mut body = slot.body.lock();
                emit_status(&deps, &mut body, false);
            }

            {
                let mut body = slot.body.lock();
                let interval = body.status.output_interval as u64;
                if interval > 0 && body.status.blocks_since_poll >= interval {
                    emit_status(&deps, &mut body, false);
                }
            }
        }
    }
}

fn emit_status(deps: &WorkerDeps, body: &mut Channel, skip_spectrum_poll: bool) {
    let frontend = deps.frontend.snapshot();
    let dest = reply_dest(body, deps.status_dest);
    send_radio_status(
        &deps.ctl_socket,
        &dest,
        &frontend,
        &deps.status_dest,
        body,
        skip_spectrum_poll,
    );
    reset_radio_status(body);
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;
    use crate::{
        channel::ChannelList,
        frontend::Frontend,
        tlv::{
            self,
            Options,
            PacketKind,
            Tag,
        },
    };

    const BLOCK_RATE: u32 = 50;

    struct Fixture {
        list: ChannelList,
        deps: WorkerDeps,
        producer: ring::Producer,
        status_rx: UdpSocket,
    }

    fn fixture() -> Fixture {
        let (producer, subscriber) = ring::ring(RING_DEPTH);
        let status_rx = UdpSocket::bind("127.0.0.1:0").unwrap();
        status_rx
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let ctl_socket = Arc::new(UdpSocket::bind("127.0.0.1:0").unwrap());

        let mut frontend = Frontend::new("worker test");
        frontend.samprate = 192_000;
        frontend.frequency = 7_100_000.0;

        Fixture {
            list: ChannelList::new(4, BLOCK_RATE),
            deps: WorkerDeps {
                frontend: Arc::new(FrontendHandle::new(frontend)),
                presets: Arc::new(PresetTable::builtin()),
                ring: subscriber,
                ctl_socket,
                status_dest: status_rx.local_addr().unwrap(),
                block_rate: BLOCK_RATE,
                idle_timeout_blocks: 1000,
                cancel: CancellationToken::new(),
            },
            producer,
            status_rx,
        }
    }

    fn publish(producer: &mut ring::Producer, len: usize) {
        let mut block = producer.swap_blocks(None, len);
        let storage = block.reclaim_or_allocate(len);
        storage.fill(Complex::new(0.1, -0.1));
        block.set_filled(len);
        let _ = producer.swap_blocks(Some(block), len);
    }

    fn recv_status(socket: &UdpSocket) -> std::collections::HashMap<u8, Vec<u8>> {
        let mut buffer = [0u8; 16384];
        let (length, _) = socket.recv_from(&mut buffer).unwrap();
        assert_eq!(PacketKind::from_byte(buffer[0]), Some(PacketKind::Status));
        Options::new(&buffer[1..length])
            .map(|option| (option.tag.0, option.value.to_vec()))
            .collect()
    }

    #[test]
    fn parked_channel_expires_under_traffic() {
        let mut fx = fixture();
        let slot = fx.list.create(5).unwrap();
        {
            let mut body = slot.body.lock();
            body.lifetime = 3;
            body.tune.freq = 0.0;
        }
        let _worker = start_demod(slot.clone(), fx.deps.clone());

        let mut command = vec![];
        tlv::encode_int(&mut command, Tag::OUTPUT_SSRC, 5);
        tlv::encode_eol(&mut command);

        let deadline = Instant::now() + Duration::from_secs(2);
        let mut published = 0;
        while slot.is_inuse() && Instant::now() < deadline {
            // polls keep arriving; at 0 Hz they must not save it
            slot.enqueue_command(&command);
            publish(&mut fx.producer, 64);
            published += 1;
            std::thread::sleep(Duration::from_millis(20));
        }

        assert!(!slot.is_inuse(), "channel should have expired");
        assert!(published >= 3);
        fx.deps.cancel.cancel();
    }

    #[test]
    fn mailbox_command_applies_and_replies() {
        let fx = fixture();
        let slot = fx.list.create(9).unwrap();
        let _worker = start_demod(slot.clone(), fx.deps.clone());

        let mut command = vec![];
        tlv::encode_int(&mut command, Tag::OUTPUT_SSRC, 9);
        tlv::encode_int(&mut command, Tag::COMMAND_TAG, 0xbeef);
        tlv::encode_double(&mut command, Tag::RADIO_FREQUENCY, 7_040_000.0);
        tlv::encode_eol(&mut command);
        assert!(slot.enqueue_command(&command));

        let options = recv_status(&fx.status_rx);
        assert_eq!(tlv::decode_u32(&options[&Tag::OUTPUT_SSRC.0]), 9);
        assert_eq!(tlv::decode_u32(&options[&Tag::COMMAND_TAG.0]), 0xbeef);
        assert_eq!(
            tlv::decode_double(&options[&Tag::RADIO_FREQUENCY.0]),
            7_040_000.0
        );
        assert_eq!(slot.body.lock().tune.freq, 7_040_000.0);
        fx.deps.cancel.cancel();
    }

    #[test]
    fn demod_change_restarts_the_worker() {
        let fx = fixture();
        let slot = fx.list.create(11).unwrap();
        let _worker = start_demod(slot.clone(), fx.deps.clone());

        let mut command = vec![];
        tlv::encode_int(&mut command, Tag::OUTPUT_SSRC, 11);
        tlv::encode_int(&mut command, Tag::DEMOD_TYPE, DemodType::Fm.to_int() as u64);
        tlv::encode_eol(&mut command);
        assert!(slot.enqueue_command(&command));

        let _reply = recv_status(&fx.status_rx);
        assert_eq!(slot.body.lock().demod_type, DemodType::Fm);

        // the respawned worker still executes commands
        let mut command = vec![];
        tlv::encode_int(&mut command, Tag::OUTPUT_SSRC, 11);
        tlv::encode_int(&mut command, Tag::COMMAND_TAG, 7);
        tlv::encode_eol(&mut command);
        assert!(slot.enqueue_command(&command));
        let options = recv_status(&fx.status_rx);
        assert_eq!(tlv::decode_u32(&options[&Tag::COMMAND_TAG.0]), 7);
        fx.deps.cancel.cancel();
    }

    #[test]
    fn spectrum_worker_owns_bin_storage() {
        let mut fx = fixture();
        let slot = fx.list.create(13).unwrap();
        {
            let mut body = slot.body.lock();
            body.demod_type = DemodType::Spect;
            body.spectrum.bin_count = 8;
        }
        let _worker = start_demod(slot.clone(), fx.deps.clone());

        publish(&mut fx.producer, 64);
        let deadline = Instant::now() + Duration::from_secs(2);
        while slot.body.lock().spectrum.bin_data.is_none() && Instant::now() < deadline {
            publish(&mut fx.producer, 64);
            std::thread::sleep(Duration::from_millis(10));
        }

        let body = slot.body.lock();
        assert_eq!(body.spectrum.bin_data.as_ref().unwrap().len(), 8);
        assert!(!body.spectrum.params_changed);
        drop(body);
        fx.deps.cancel.cancel();
    }

    #[test]
    fn spectrum_poll_averages_by_blocks() {
        let mut chan = Channel::template(1, BLOCK_RATE);
        chan.spectrum.bin_data = Some(vec![10.0, 20.0]);
        chan.status.blocks_since_poll = 5;
        spectrum_poll(&mut chan);
        assert_eq!(chan.spectrum.bin_data.as_ref().unwrap()[0], 2.0);
        assert_eq!(chan.spectrum.bin_data.as_ref().unwrap()[1], 4.0);

        // nothing accumulated yet; bins stay put
        chan.status.blocks_since_poll = 0;
        spectrum_poll(&mut chan);
        assert_eq!(chan.spectrum.bin_data.as_ref().unwrap()[0], 2.0);
    }

    #[test]
    fn spectrum_windows_do_not_leak_into_each_other() {
        let mut chan = Channel::template(1, BLOCK_RATE);
        chan.spectrum.bin_data = Some(vec![10.0, 20.0]);
        chan.status.blocks_since_poll = 5;
        spectrum_poll(&mut chan);
        assert_eq!(chan.spectrum.bin_data.as_ref().unwrap()[..], [2.0, 4.0]);

        // emission resets the integrators along with the block count
        reset_radio_status(&mut chan);
        assert_eq!(chan.status.blocks_since_poll, 0);
        assert_eq!(chan.spectrum.bin_data.as_ref().unwrap()[..], [0.0, 0.0]);

        // the next window averages only its own accumulation
        {
            let bins = chan.spectrum.bin_data.as_mut().unwrap();
            bins[0] = 6.0;
            bins[1] = 3.0;
        }
        chan.status.blocks_since_poll = 3;
        spectrum_poll(&mut chan);
        assert_eq!(chan.spectrum.bin_data.as_ref().unwrap()[..], [2.0, 1.0]);
    }
}
