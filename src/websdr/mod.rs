//! Ingest driver for a CWSL WebSDR network source.
//!
//! The server is driven over a line-oriented TCP control session
//! (attach/detach/frequency/start/stop/quit); IQ samples arrive as
//! interleaved int16 pairs in UDP datagrams on a port we pick. The
//! driver selects a receiver slice covering the requested frequency,
//! starts streaming, and feeds normalized complex floats into the
//! sample ring.

pub mod control;

use std::{
    net::UdpSocket,
    sync::{
        Arc,
        atomic::{
            AtomicBool,
            Ordering,
        },
    },
    thread::JoinHandle,
    time::Duration,
};

use num_complex::Complex;
use tokio_util::sync::CancellationToken;

use crate::{
    config::WebsdrConfig,
    frontend::{
        FrontendHandle,
        Hooks,
    },
    ring,
    rt,
    websdr::control::{
        ControlError,
        ControlSession,
        Reply,
    },
};

/// Largest datagram we accept: 2048 complex samples.
pub const UDP_BUFFER_SAMPLES: usize = 2048;

/// Receivers probed during auto-selection.
const PROBE_RECEIVERS: i32 = 8;

/// Settle time between probe attach/detach cycles. The protocol has
/// no detach acknowledgement to wait on.
const PROBE_SETTLE: Duration = Duration::from_millis(100);

/// Liveness check cadence of the TCP sentinel.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);

/// Poll granularity of the UDP reader, so cancellation is observed
/// even on an idle stream.
const READER_POLL: Duration = Duration::from_millis(500);

#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error("control session failed")]
    Control(#[from] ControlError),
    #[error("socket setup failed")]
    Io(#[from] std::io::Error),
    #[error("no receiver covers {frequency} Hz")]
    NoReceiver { frequency: f64 },
}

/// A set-up but not yet streaming WebSDR source.
#[derive(Debug)]
pub struct WebsdrSource {
    config: WebsdrConfig,
    session: Arc<ControlSession>,
    frontend: Arc<FrontendHandle>,
    receiver_id: i32,
    block_in_samples: u32,
    l0_frequency: i64,
}

/// Threads of a streaming source; join them after cancellation.
#[derive(Debug)]
pub struct IngestThreads {
    pub reader: JoinHandle<()>,
    pub keepalive: JoinHandle<()>,
}

impl IngestThreads {
    pub fn join(self) {
        let _ = self.reader.join();
        let _ = self.keepalive.join();
    }
}

/// Connect, pick a receiver, and fill in the frontend descriptor.
pub fn setup(
    config: WebsdrConfig,
    frontend: Arc<FrontendHandle>,
) -> Result<WebsdrSource, SetupError> {
    let target_frequency = config
        .initial_frequency()
        .expect("config was validated")
        .unwrap_or(0.0);

    frontend.with_state(|state| {
        state.description = config.effective_description();
        state.samprate = config.samprate;
        state.calibrate = config.calibrate;
        if target_frequency != 0.0 {
            state.frequency = target_frequency;
            state.lock = true;
        }
    });

    let session = Arc::new(ControlSession::connect(&config.host, config.port)?);

    let mut source = WebsdrSource {
        config,
        session,
        frontend,
        receiver_id: 0,
        block_in_samples: 0,
        l0_frequency: 0,
    };
    source.attach_receiver(target_frequency)?;

    source.frontend.with_state(|state| {
        state.frequency = source.l0_frequency as f64 * (1.0 + state.calibrate);
        state.min_if = -0.47 * state.samprate as f32;
        state.max_if = 0.47 * state.samprate as f32;
        state.isreal = false;
        state.bits_per_sample = 16;
    });

    {
        let state = source.frontend.snapshot();
        tracing::info!(
            description = %state.description,
            library = source.config.library.as_deref().unwrap_or("builtin"),
            host = %source.config.host,
            port = source.config.port,
            receiver = source.receiver_id,
            samprate = state.samprate,
            udp_port = source.config.udp_port,
            scaling = source.config.scaling,
            frequency = state.frequency,
            calibrate = state.calibrate,
            "connected"
        );
    }

    Ok(source)
}

impl WebsdrSource {
    pub fn block_in_samples(&self) -> u32 {
        self.block_in_samples
    }

    /// Attach to the configured receiver, or probe all of them for
    /// the L0 closest to the target frequency. On a distance tie the
    /// earliest index wins.
    fn attach_receiver(&mut self, target_frequency: f64) -> Result<(), SetupError> {
        let reply = if self.config.receiver >= 0 {
            self.receiver_id = self.config.receiver;
            self.session
                .expect_ok(&format!("attach {}", self.receiver_id))?
        }
        else {
            tracing::info!(
                target_mhz = target_frequency / 1e6,
                "searching for a covering receiver"
            );

            let mut best: Option<(i32, i64, i64)> = None;
            for rx in 0..PROBE_RECEIVERS {
                let reply = match self.session.transact(&format!("attach {rx}")) {
                    Ok(reply) => reply,
                    Err(error) => {
                        tracing::warn!(receiver = rx, %error, "probe failed");
                        continue;
                    }
                };
                if !reply.is_ok() {
                    tracing::debug!(receiver = rx, reply = %reply.line(), "probe rejected");
                    continue;
                }

                let l0 = reply.int_field("L0").unwrap_or(0);
                let distance = (target_frequency as i64 - l0).abs();
                tracing::debug!(
                    receiver = rx,
                    l0_mhz = l0 as f64 / 1e6,
                    distance_mhz = distance as f64 / 1e6,
                    "probed"
                );
                if best.is_none_or(|(_, _, best_distance)| distance < best_distance) {
                    best = Some((rx, l0, distance));
                }

                if let Err(error) = self.session.transact(&format!("detach {rx}")) {
                    tracing::warn!(receiver = rx, %error, "failed to detach probe");
                }
                std::thread::sleep(PROBE_SETTLE);
            }

            let Some((rx, l0, distance)) = best
            else {
                return Err(SetupError::NoReceiver {
                    frequency: target_frequency,
                });
            };
            tracing::info!(
                receiver = rx,
                l0_mhz = l0 as f64 / 1e6,
                distance_mhz = distance as f64 / 1e6,
                "selected receiver"
            );

            self.receiver_id = rx;
            self.session.expect_ok(&format!("attach {rx}"))?
        };

        self.apply_attach_reply(&reply);
        tracing::info!(
            receiver = self.receiver_id,
            block_in_samples = self.block_in_samples,
            l0 = self.l0_frequency,
            "attached"
        );
        Ok(())
    }

    fn apply_attach_reply(&mut self, reply: &Reply) {
        if let Some(samprate) = reply.int_field("SampleRate") {
            self.frontend.with_state(|state| state.samprate = samprate as u32);
        }
        if let Some(block) = reply.int_field("BlockInSamples") {
            self.block_in_samples = block as u32;
            self.frontend.with_state(|state| state.block_size = block as u32);
        }
        if let Some(l0) = reply.int_field("L0") {
            self.l0_frequency = l0;
        }
    }

    /// Bind the UDP port, start streaming, and spawn the reader and
    /// keepalive threads.
    pub fn startup(
        self,
        producer: ring::Producer,
        cancel: CancellationToken,
    ) -> Result<IngestThreads, SetupError> {
        let scale = self.frontend.snapshot().scale_ad();

        let socket = UdpSocket::bind(("0.0.0.0", self.config.udp_port))?;
        socket.set_read_timeout(Some(READER_POLL))?;

        self.session.expect_ok(&format!(
            "start iq {} {}",
            self.config.udp_port, self.config.scaling
        ))?;
        let streaming = Arc::new(AtomicBool::new(true));

        tracing::debug!(
            udp_port = self.config.udp_port,
            scaling = self.config.scaling,
            "IQ streaming started"
        );

        // control reach-through: the server only supports retuning
        let calibrate = self.frontend.snapshot().calibrate;
        self.frontend.install_hooks(Hooks {
            tune: Some(tune_hook(self.session.clone(), calibrate)),
            ..Hooks::default()
        });

        let keepalive = std::thread::Builder::new()
            .name("websdr-tcp".into())
            .spawn({
                let streaming = streaming.clone();
                let cancel = cancel.clone();
                move || keepalive_thread(streaming, cancel)
            })?;

        let reader = std::thread::Builder::new()
            .name("websdr-udp".into())
            .spawn({
                let session = self.session.clone();
                let frontend = self.frontend.clone();
                let receiver_id = self.receiver_id;
                move || {
                    reader_thread(
                        socket,
                        producer,
                        frontend,
                        scale,
                        streaming.clone(),
                        cancel,
                    );
                    disconnect(&session, receiver_id, &streaming);
                }
            })?;

        Ok(IngestThreads { reader, keepalive })
    }
}

fn tune_hook(
    session: Arc<ControlSession>,
    calibrate: f64,
) -> Box<dyn Fn(f64) -> Option<f64> + Send + Sync> {
    Box::new(move |frequency| {
        match session.expect_ok(&format!("frequency {}", frequency as i64)) {
            Ok(_) => {
                let tuned = frequency * (1.0 + calibrate);
                tracing::debug!(frequency = tuned, "tuned");
                Some(tuned)
            }
            Err(error) => {
                tracing::warn!(frequency, %error, "tune failed");
                None
            }
        }
    })
}

/// The sentinel only reads connection flags; the server just expects
/// the TCP session to stay open while streaming.
fn keepalive_thread(streaming: Arc<AtomicBool>, cancel: CancellationToken) {
    let step = Duration::from_millis(250);
    let steps = (KEEPALIVE_INTERVAL.as_millis() / step.as_millis()) as u32;
    'outer: loop {
        for _ in 0..steps {
            if cancel.is_cancelled() || !streaming.load(Ordering::Acquire) {
                break 'outer;
            }
            std::thread::sleep(step);
        }
    }
    tracing::debug!("keepalive sentinel exiting");
}

/// Outcome of converting one datagram.
#[derive(Clone, Copy, Debug, PartialEq)]
struct Converted {
    sample_count: usize,
    overrange_delta: u64,
    mean_energy: f32,
}

/// Convert interleaved int16 pairs to scaled complex floats, tracking
/// clipped components and raw signal energy. `samples_since_over` is
/// the running non-clipped component count carried across datagrams.
fn convert_datagram(
    raw: &[i16],
    scale: f32,
    storage: &mut [Complex<f32>],
    samples_since_over: &mut u64,
) -> Converted {
    let sample_count = raw.len() / 2;
    let mut overrange_delta = 0;
    let mut energy = 0.0f32;

    for (out, pair) in storage[..sample_count].iter_mut().zip(raw.chunks_exact(2)) {
        let i_raw = pair[0];
        let q_raw = pair[1];

        for component in [q_raw, i_raw] {
            if component == i16::MIN || component == i16::MAX {
                overrange_delta += 1;
                *samples_since_over = 0;
            }
            else {
                *samples_since_over += 1;
            }
        }

        let sample = Complex::new(i_raw as f32, q_raw as f32);
        energy += sample.norm_sqr();
        *out = scale * sample;
    }

    Converted {
        sample_count,
        overrange_delta,
        mean_energy: if sample_count > 0 {
            energy / sample_count as f32
        }
        else {
            0.0
        },
    }
}

fn reader_thread(
    socket: UdpSocket,
    mut producer: ring::Producer,
    frontend: Arc<FrontendHandle>,
    scale: f32,
    streaming: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    let _guard = tracing::debug_span!("websdr reader").entered();
    rt::elevate_input_priority();
    rt::stick_to_core();

    let mut raw = [0i16; UDP_BUFFER_SAMPLES * 2];
    let mut samples_since_over = frontend.snapshot().samples_since_over;
    let mut block = producer.swap_blocks(None, UDP_BUFFER_SAMPLES);

    while streaming.load(Ordering::Acquire) && !cancel.is_cancelled() {
        let n = match socket.recv(bytemuck::cast_slice_mut(&mut raw)) {
            Ok(n) => n,
            Err(error)
                if matches!(
                    error.kind(),
                    std::io::ErrorKind::WouldBlock
                        | std::io::ErrorKind::TimedOut
                        | std::io::ErrorKind::Interrupted
                ) =>
            {
                continue;
            }
            Err(error) => {
                tracing::error!(%error, "UDP recv error");
                break;
            }
        };

        // 4 bytes per complex sample; shorter datagrams are dropped
        if n < 4 {
            continue;
        }
        let sample_count = n / 4;

        let storage = block.reclaim_or_allocate(UDP_BUFFER_SAMPLES);
        let converted = convert_datagram(
            &raw[..sample_count * 2],
            scale,
            storage,
            &mut samples_since_over,
        );
        block.set_filled(converted.sample_count);

        frontend.with_state(|state| {
            state.record_datagram(
                converted.sample_count,
                converted.overrange_delta,
                samples_since_over,
                converted.mean_energy,
            );
        });

        // one publish per datagram: consumers see all N samples or none
        block = producer.swap_blocks(Some(block), UDP_BUFFER_SAMPLES);
    }

    tracing::debug!("UDP reader shutting down");
}

/// Tear the session down in reverse state order: stop streaming,
/// detach, quit. Replies are ignored; the connection may already be
/// half dead.
fn disconnect(session: &ControlSession, receiver_id: i32, streaming: &AtomicBool) {
    if streaming.swap(false, Ordering::AcqRel) {
        let _ = session.transact("stop iq");
    }
    let _ = session.transact(&format!("detach {receiver_id}"));
    let _ = session.transact("quit");
}

#[cfg(test)]
mod tests {
    use std::{
        io::{
            Read,
            Write,
        },
        net::TcpListener,
    };

    use num_complex::Complex;

    use super::*;
    use crate::{
        config::WebsdrConfig,
        frontend::Frontend,
    };

    fn test_config(port: u16, receiver: i32, frequency: Option<&str>) -> WebsdrConfig {
        let mut text = format!(
            "device = \"cwsl_websdr\"\nhost = \"127.0.0.1\"\nport = {port}\nreceiver = {receiver}\n"
        );
        if let Some(frequency) = frequency {
            text.push_str(&format!("frequency = \"{frequency}\"\n"));
        }
        let mut config: WebsdrConfig = toml::from_str(&text).unwrap();
        config.validate().unwrap();
        config
    }

    fn scripted_server(replies: Vec<&'static str>) -> (std::thread::JoinHandle<Vec<String>>, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut received = vec![];
            let mut buffer = [0u8; 512];
            for reply in replies {
                let n = stream.read(&mut buffer).unwrap();
                received.push(
                    String::from_utf8_lossy(&buffer[..n])
                        .trim_end()
                        .to_owned(),
                );
                stream.write_all(reply.as_bytes()).unwrap();
            }
            received
        });
        (handle, port)
    }

    #[test]
    fn clean_datagram_accounting() {
        // 256 pairs alternating (30000, -30000); nothing clips
        let raw: Vec<i16> = std::iter::repeat([30000i16, -30000])
            .take(256)
            .flatten()
            .collect();
        let mut storage = vec![Complex::new(0.0f32, 0.0); 256];
        let mut since_over = 0;

        let converted = convert_datagram(&raw, 1.0 / 32768.0, &mut storage, &mut since_over);

        assert_eq!(converted.sample_count, 256);
        assert_eq!(converted.overrange_delta, 0);
        assert_eq!(since_over, 512);
        assert!(converted.mean_energy > 0.0);

        let mut frontend = Frontend::new("test");
        frontend.record_datagram(
            converted.sample_count,
            converted.overrange_delta,
            since_over,
            converted.mean_energy,
        );
        assert_eq!(frontend.samples, 256);
        assert_eq!(frontend.overranges, 0);
        assert_eq!(frontend.samples_since_over, 512);
        assert!(frontend.if_power > 0.0);
    }

    #[test]
    fn clipped_components_reset_the_run() {
        let raw = [i16::MAX, 5, 100, i16::MIN];
        let mut storage = vec![Complex::new(0.0f32, 0.0); 2];
        let mut since_over = 0;

        let converted = convert_datagram(&raw, 1.0 / 32768.0, &mut storage, &mut since_over);

        assert_eq!(converted.overrange_delta, 2);
        assert_eq!(since_over, 1);
    }

    #[test]
    fn scaling_is_applied_per_sample() {
        let raw = [16384i16, -16384];
        let mut storage = vec![Complex::new(0.0f32, 0.0); 1];
        let mut since_over = 0;
        convert_datagram(&raw, 1.0 / 32768.0, &mut storage, &mut since_over);
        assert_eq!(storage[0], Complex::new(0.5, -0.5));
    }

    #[test]
    fn auto_select_picks_closest_l0() {
        // probes with target 7.050 MHz against L0s of 0, 3.5, 7.1 and
        // 14.2 MHz; receivers 4..7 reject
        let (server, port) = scripted_server(vec![
            "OK SampleRate=192000 BlockInSamples=2048 L0=0\r\n",
            "OK\r\n",
            "OK SampleRate=192000 BlockInSamples=2048 L0=3500000\r\n",
            "OK\r\n",
            "OK SampleRate=192000 BlockInSamples=2048 L0=7100000\r\n",
            "OK\r\n",
            "OK SampleRate=192000 BlockInSamples=2048 L0=14200000\r\n",
            "OK\r\n",
            "ERROR no such receiver\r\n",
            "ERROR no such receiver\r\n",
            "ERROR no such receiver\r\n",
            "ERROR no such receiver\r\n",
            "OK SampleRate=192000 BlockInSamples=2048 L0=7100000\r\n",
        ]);

        let frontend = Arc::new(FrontendHandle::new(Frontend::new("test")));
        let config = test_config(port, -1, Some("7m050"));
        let source = setup(config, frontend.clone()).unwrap();

        assert_eq!(source.receiver_id, 2);
        assert_eq!(source.l0_frequency, 7_100_000);
        assert_eq!(source.block_in_samples(), 2048);

        let state = frontend.snapshot();
        assert_eq!(state.frequency, 7_100_000.0);
        assert_eq!(state.samprate, 192_000);
        assert_eq!(state.min_if, -0.47 * 192_000.0);
        assert!(state.lock);

        let received = server.join().unwrap();
        assert_eq!(received[0], "attach 0");
        assert_eq!(received[1], "detach 0");
        assert_eq!(received[12], "attach 2");
    }

    #[test]
    fn explicit_receiver_attaches_once() {
        let (server, port) = scripted_server(vec![
            "OK SampleRate=96000 BlockInSamples=1024 L0=14200000\r\n",
        ]);

        let frontend = Arc::new(FrontendHandle::new(Frontend::new("test")));
        let config = test_config(port, 5, None);
        let source = setup(config, frontend.clone()).unwrap();

        assert_eq!(source.receiver_id, 5);
        assert_eq!(frontend.snapshot().samprate, 96_000);
        assert!(!frontend.snapshot().lock);

        let received = server.join().unwrap();
        assert_eq!(received, vec!["attach 5"]);
    }

    #[test]
    fn calibration_shifts_the_center_frequency() {
        let (_server, port) = scripted_server(vec![
            "OK SampleRate=192000 BlockInSamples=2048 L0=7100000\r\n",
        ]);

        let frontend = Arc::new(FrontendHandle::new(Frontend::new("test")));
        let mut config = test_config(port, 1, None);
        config.calibrate = 1e-6;
        let _source = setup(config, frontend.clone()).unwrap();

        assert_eq!(frontend.snapshot().frequency, 7_100_000.0 * (1.0 + 1e-6));
    }
}
