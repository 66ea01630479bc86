//! Per-channel state and the fixed-capacity channel store.
//!
//! Channels are keyed by their RTP SSRC. They come into being when a
//! command references an unknown SSRC and die when their lifetime
//! counter runs out. A channel's bulk state is owned by its worker
//! thread; the control plane only touches the mailbox, which hands
//! commands across under a short lock.

pub mod preset;

use std::{
    net::{
        Ipv4Addr,
        SocketAddr,
        SocketAddrV4,
    },
    sync::{
        Arc,
        atomic::{
            AtomicBool,
            AtomicU32,
            Ordering,
        },
    },
};

use parking_lot::Mutex;

use crate::units::{
    db2power,
    db2voltage,
};

/// Reserved SSRC of the dynamic channel template.
pub const TEMPLATE_SSRC: u32 = 0;

/// SSRC addressing every channel at once.
pub const BROADCAST_SSRC: u32 = 0xffff_ffff;

/// Well-known ports forced onto caller-supplied destination sockets.
pub const DEFAULT_RTP_PORT: u16 = 5004;
pub const DEFAULT_STAT_PORT: u16 = 5006;

/// Seconds an unattended channel survives.
pub const IDLE_TIMEOUT_SECS: u32 = 20;

/// Sample rates Opus can encode.
pub const OPUS_SAMPRATES: [u32; 5] = [8000, 12000, 16000, 24000, 48000];

pub fn unspecified_socket() -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DemodType {
    #[default]
    Linear,
    Fm,
    Wfm,
    Spect,
}

impl DemodType {
    pub fn from_int(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::Linear),
            1 => Some(Self::Fm),
            2 => Some(Self::Wfm),
            3 => Some(Self::Spect),
            _ => None,
        }
    }

    pub fn to_int(self) -> u32 {
        match self {
            Self::Linear => 0,
            Self::Fm => 1,
            Self::Wfm => 2,
            Self::Spect => 3,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Encoding {
    #[default]
    None,
    S16be,
    S16le,
    F32le,
    Opus,
}

impl Encoding {
    pub fn from_int(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::None),
            1 => Some(Self::S16be),
            2 => Some(Self::S16le),
            3 => Some(Self::F32le),
            4 => Some(Self::Opus),
            _ => None,
        }
    }

    pub fn to_int(self) -> u32 {
        match self {
            Self::None => 0,
            Self::S16be => 1,
            Self::S16le => 2,
            Self::F32le => 3,
            Self::Opus => 4,
        }
    }
}

/// Locally assigned dynamic RTP payload type; deterministic in
/// (rate, channels, encoding) so a restarted channel keeps its PT.
pub fn payload_type_from_info(samprate: u32, channels: u8, encoding: Encoding) -> u8 {
    let hash = samprate / 1000 + channels as u32 * 5 + encoding.to_int() * 11;
    96 + (hash % 32) as u8
}

/// Fine-oscillator phase of the channel filter. Changing the filter
/// invalidates the phase, which the DSP re-derives on its next block.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub enum Remainder {
    #[default]
    NeedsInit,
    Phase(f32),
}

/// Squelch threshold as a power ratio.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Squelch {
    AlwaysOpen,
    Threshold(f32),
}

impl Squelch {
    /// Decode a threshold in dB; at or below -999 dB the squelch
    /// never closes.
    pub fn from_db(db: f32) -> Self {
        if db <= -999.0 {
            Self::AlwaysOpen
        }
        else {
            Self::Threshold(db2power(db).abs())
        }
    }

    /// Power ratio, with 0.0 standing in for "always open" on the
    /// wire.
    pub fn power(self) -> f32 {
        match self {
            Self::AlwaysOpen => 0.0,
            Self::Threshold(power) => power,
        }
    }
}

#[derive(Clone, Debug)]
pub struct OutputState {
    pub dest_socket: SocketAddr,
    pub source_socket: SocketAddr,
    pub rtp_type: u8,
    pub samprate: u32,
    pub channels: u8,
    pub encoding: Encoding,
    pub opus_bitrate: u32,
    /// voltage ratio
    pub gain: f32,
    /// voltage margin below full scale
    pub headroom: f32,
    pub power: f32,
    pub rtp_timestamp: u32,
    pub rtp_packets: u64,
    pub samples: u64,
    pub errors: u64,
    pub minpacket: u8,
    pub ttl: u8,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct Tune {
    pub freq: f64,
    pub shift: f64,
    pub second_lo: f64,
    pub doppler: f64,
    pub doppler_rate: f64,
}

#[derive(Clone, Copy, Debug)]
pub struct FilterState {
    pub min_if: f32,
    pub max_if: f32,
    pub kaiser_beta: f32,
    pub impulse_length: u32,
    pub block_drops: u64,
    pub remainder: Remainder,
}

/// Post-filter stage.
#[derive(Clone, Copy, Debug)]
pub struct Filter2 {
    /// 0 disables the stage; bounded at 10
    pub blocking: u32,
    pub kaiser_beta: f32,
    /// independent sideband
    pub isb: bool,
    pub block_size: u32,
    pub impulse_length: u32,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct Pll {
    pub enable: bool,
    pub square: bool,
    pub loop_bw: f32,
    pub cphase: f32,
    pub lock: bool,
    pub snr: f32,
    pub rotations: i64,
}

#[derive(Clone, Copy, Debug)]
pub struct LinearState {
    pub agc: bool,
    pub hangtime: f32,
    pub threshold: f32,
    pub recovery_rate: f32,
    pub env: bool,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct FmState {
    pub threshold_extend: bool,
    /// deemphasis pole, per-sample
    pub rate: f32,
    pub gain: f32,
    pub pdeviation: f32,
    pub tone_freq: f32,
    pub tone_deviation: f32,
    pub snr: f32,
    pub stereo_enable: bool,
}

/// Noncoherent spectrum parameters. The bin storage belongs to the
/// spectrum aggregator; mutators flag `params_changed` and leave
/// `bin_data` alone.
#[derive(Clone, Debug)]
pub struct SpectrumState {
    pub bin_count: u32,
    pub bin_bw: f32,
    pub bin_data: Option<Vec<f32>>,
    pub params_changed: bool,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct Signal {
    pub bb_power: f32,
    pub foffset: f32,
    /// noise density estimate
    pub n0: f32,
}

#[derive(Clone, Debug)]
pub struct StatusCounters {
    /// last command tag, echoed in replies
    pub tag: u32,
    pub packets_in: u64,
    pub packets_out: u64,
    pub blocks_since_poll: u64,
    /// unsolicited status cadence in blocks; 0 disables
    pub output_interval: u32,
    pub dest_socket: SocketAddr,
}

#[derive(Clone, Debug)]
pub struct Channel {
    pub ssrc: u32,
    pub demod_type: DemodType,
    pub output: OutputState,
    pub tune: Tune,
    pub filter: FilterState,
    pub filter2: Filter2,
    pub pll: Pll,
    pub linear: LinearState,
    pub fm: FmState,
    pub spectrum: SpectrumState,
    pub squelch_open: Squelch,
    pub squelch_close: Squelch,
    pub snr_squelch_enable: bool,
    pub sig: Signal,
    pub tp1: Option<f32>,
    pub tp2: Option<f32>,
    pub preset: String,
    pub options: u64,
    /// blocks until idle expiry; 0 means immortal
    pub lifetime: u32,
    pub status: StatusCounters,
}

impl Channel {
    /// The dynamic channel template: what a channel looks like before
    /// its first command.
    pub fn template(ssrc: u32, block_rate: u32) -> Self {
        let samprate = 24_000;
        let channels = 1;
        let encoding = Encoding::S16be;
        Self {
            ssrc,
            demod_type: DemodType::Linear,
            output: OutputState {
                dest_socket: unspecified_socket(),
                source_socket: unspecified_socket(),
                rtp_type: payload_type_from_info(samprate, channels, encoding),
                samprate,
                channels,
                encoding,
                opus_bitrate: 32_000,
                gain: db2voltage(0.0),
                headroom: db2voltage(-15.0),
                power: 0.0,
                rtp_timestamp: 0,
                rtp_packets: 0,
                samples: 0,
                errors: 0,
                minpacket: 0,
                ttl: 1,
            },
            tune: Tune::default(),
            filter: FilterState {
                min_if: -5000.0,
                max_if: 5000.0,
                kaiser_beta: 11.0,
                impulse_length: 0,
                block_drops: 0,
                remainder: Remainder::NeedsInit,
            },
            filter2: Filter2 {
                blocking: 0,
                kaiser_beta: 11.0,
                isb: false,
                block_size: 0,
                impulse_length: 0,
            },
            pll: Pll {
                loop_bw: 100.0,
                ..Pll::default()
            },
            linear: LinearState {
                agc: true,
                hangtime: 1.1,
                threshold: db2voltage(-6.0),
                recovery_rate: db2voltage(20.0),
                env: false,
            },
            fm: FmState::default(),
            spectrum: SpectrumState {
                bin_count: 64,
                bin_bw: 1000.0,
                bin_data: None,
                params_changed: false,
            },
            squelch_open: Squelch::Threshold(db2power(8.0)),
            squelch_close: Squelch::Threshold(db2power(7.0)),
            snr_squelch_enable: false,
            sig: Signal::default(),
            tp1: None,
            tp2: None,
            preset: String::new(),
            options: 0,
            lifetime: IDLE_TIMEOUT_SECS * block_rate,
            status: StatusCounters {
                tag: 0,
                packets_in: 0,
                packets_out: 0,
                blocks_since_poll: 0,
                output_interval: 0,
                dest_socket: unspecified_socket(),
            },
        }
    }

    /// Retune, keeping the second LO consistent with the frontend's
    /// first LO.
    pub fn set_freq(&mut self, frequency: f64, first_lo: f64) {
        self.tune.freq = frequency;
        self.tune.second_lo = frequency - first_lo;
    }

    pub fn refresh_rtp_type(&mut self) {
        self.output.rtp_type =
            payload_type_from_info(self.output.samprate, self.output.channels, self.output.encoding);
    }
}

/// Round an output sample rate to the nearest multiple of the block
/// rate, never below one block per second.
pub fn round_samprate(samprate: u32, block_rate: u32) -> u32 {
    let blocks = (samprate + block_rate / 2) / block_rate;
    blocks.max(1) * block_rate
}

/// Command hand-off slot plus the broadcast status timer, under one
/// short lock shared between the dispatcher and the channel worker.
#[derive(Debug, Default)]
pub struct Mailbox {
    command: Option<Box<[u8]>>,
    pub global_timer: u32,
}

/// One entry of the channel table.
#[derive(Debug)]
pub struct ChannelSlot {
    index: usize,
    inuse: AtomicBool,
    ssrc: AtomicU32,
    pub mailbox: Mutex<Mailbox>,
    pub body: Mutex<Channel>,
}

impl ChannelSlot {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn is_inuse(&self) -> bool {
        self.inuse.load(Ordering::Acquire)
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc.load(Ordering::Acquire)
    }

    /// Hand a command payload to the worker. A single slot is all we
    /// have: when it is still occupied the new command is dropped.
    pub fn enqueue_command(&self, payload: &[u8]) -> bool {
        let mut mailbox = self.mailbox.lock();
        if mailbox.command.is_some() {
            false
        }
        else {
            mailbox.command = Some(payload.into());
            true
        }
    }

    pub fn take_command(&self) -> Option<Box<[u8]>> {
        self.mailbox.lock().command.take()
    }

    /// Free the slot for reuse. The worker calls this on expiry.
    pub fn release(&self) {
        let mut mailbox = self.mailbox.lock();
        mailbox.command = None;
        mailbox.global_timer = 0;
        drop(mailbox);
        self.ssrc.store(TEMPLATE_SSRC, Ordering::Release);
        self.inuse.store(false, Ordering::Release);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CreateError {
    #[error("channel table full ({capacity} slots)")]
    TableFull { capacity: usize },
    #[error("ssrc {ssrc} is reserved")]
    ReservedSsrc { ssrc: u32 },
}

/// Fixed-capacity channel table keyed by SSRC.
#[derive(Debug)]
pub struct ChannelList {
    slots: Vec<Arc<ChannelSlot>>,
    block_rate: u32,
}

impl ChannelList {
    pub fn new(capacity: usize, block_rate: u32) -> Self {
        let slots = (0..capacity)
            .map(|index| {
                Arc::new(ChannelSlot {
                    index,
                    inuse: AtomicBool::new(false),
                    ssrc: AtomicU32::new(TEMPLATE_SSRC),
                    mailbox: Mutex::new(Mailbox::default()),
                    body: Mutex::new(Channel::template(TEMPLATE_SSRC, block_rate)),
                })
            })
            .collect();
        Self { slots, block_rate }
    }

    pub fn block_rate(&self) -> u32 {
        self.block_rate
    }

    pub fn idle_timeout_blocks(&self) -> u32 {
        IDLE_TIMEOUT_SECS * self.block_rate
    }

    pub fn lookup(&self, ssrc: u32) -> Option<Arc<ChannelSlot>> {
        self.slots
            .iter()
            .find(|slot| slot.is_inuse() && slot.ssrc() == ssrc)
            .cloned()
    }

    /// Claim a free slot and initialize it from the template.
    pub fn create(&self, ssrc: u32) -> Result<Arc<ChannelSlot>, CreateError> {
        if ssrc == TEMPLATE_SSRC || ssrc == BROADCAST_SSRC {
            return Err(CreateError::ReservedSsrc { ssrc });
        }

        for slot in &self.slots {
            if slot
                .inuse
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                slot.ssrc.store(ssrc, Ordering::Release);
                *slot.body.lock() = Channel::template(ssrc, self.block_rate);
                *slot.mailbox.lock() = Mailbox::default();
                return Ok(slot.clone());
            }
        }
        Err(CreateError::TableFull {
            capacity: self.slots.len(),
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<ChannelSlot>> {
        self.slots.iter()
    }
}
