//! Command option parsing and application.
//!
//! A CMD payload is scanned once, in wire order. Most options apply
//! immediately; the ones a preset may also supply are collected into
//! [`Overrides`] and re-applied after `PRESET`, so caller-supplied
//! values win over preset defaults.

use std::net::SocketAddr;

use crate::{
    channel::{
        BROADCAST_SSRC,
        Channel,
        DEFAULT_RTP_PORT,
        DEFAULT_STAT_PORT,
        DemodType,
        Encoding,
        OPUS_SAMPRATES,
        Remainder,
        Squelch,
        TEMPLATE_SSRC,
        preset::PresetTable,
        round_samprate,
    },
    frontend::FrontendHandle,
    tlv::{
        self,
        Options,
        Tag,
    },
    units::db2voltage,
};

/// What the worker must do after a command was applied.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandDisposition {
    /// Everything took effect in place.
    Applied,
    /// The demod worker must tear down and respawn its kernel.
    RestartNeeded,
    /// Spectrum parameters changed; the status emitter must not poll
    /// the bins this cycle, the aggregator still has to reallocate.
    SpectrumChanged,
}

/// Everything the parser needs besides the channel itself.
pub struct DecodeContext<'a> {
    pub frontend: &'a FrontendHandle,
    pub presets: &'a PresetTable,
    pub block_rate: u32,
    pub idle_timeout_blocks: u32,
    /// command origin, for operator logs
    pub sender: SocketAddr,
}

/// Options that both a caller and a preset may set. Collected during
/// the scan, applied after the preset ran.
#[derive(Clone, Copy, Debug, Default)]
struct Overrides {
    low_edge: Option<f32>,
    high_edge: Option<f32>,
    bin_count: Option<u32>,
    bin_bw: Option<f32>,
}

impl Overrides {
    fn any(&self) -> bool {
        self.low_edge.is_some()
            || self.high_edge.is_some()
            || self.bin_count.is_some()
            || self.bin_bw.is_some()
    }
}

/// Apply a CMD payload to a channel.
pub fn decode_radio_commands(
    chan: &mut Channel,
    ctx: &DecodeContext,
    payload: &[u8],
) -> CommandDisposition {
    let mut restart_needed = false;
    let mut new_filter_needed = false;
    let mut spectrum_params_changed = false;
    let mut overrides = Overrides::default();
    let ssrc = chan.ssrc;
    // tracks the frontend LO through the scan; a FIRST_LO_FREQUENCY
    // option moves it, and every later retune must use the new value
    let mut first_lo = ctx.frontend.snapshot().frequency;

    // A channel parked at 0 Hz is allowed to expire no matter how
    // often its client polls it; that is how orphans get retired.
    if chan.lifetime != 0 && chan.tune.freq != 0.0 {
        chan.lifetime = ctx.idle_timeout_blocks;
    }
    else if chan.lifetime != 0 {
        tracing::info!(
            ssrc,
            sender = %ctx.sender,
            lifetime = chan.lifetime,
            "command for idle channel at 0 Hz, lifetime not reset"
        );
    }
    chan.status.packets_in += 1;

    for option in Options::new(payload) {
        let value = option.value;
        match option.tag {
            Tag::COMMAND_TAG => {
                chan.status.tag = tlv::decode_u32(value);
            }
            Tag::OUTPUT_SSRC => {
                // routing already happened
            }
            Tag::OUTPUT_SAMPRATE => {
                let new_samprate = round_samprate(tlv::decode_u32(value), ctx.block_rate);
                if new_samprate != chan.output.samprate
                    && (chan.output.encoding != Encoding::Opus
                        || OPUS_SAMPRATES.contains(&new_samprate))
                {
                    chan.output.samprate = new_samprate;
                    chan.refresh_rtp_type();
                    restart_needed = true;
                }
            }
            Tag::RADIO_FREQUENCY => {
                let f = tlv::decode_double(value).abs();
                if f.is_finite() {
                    tracing::debug!(ssrc, frequency = f, "set frequency");
                    chan.set_freq(f, first_lo);
                }
            }
            Tag::FIRST_LO_FREQUENCY => {
                let f = tlv::decode_double(value).abs();
                if f.is_finite() && f != 0.0 {
                    first_lo = ctx.frontend.request_tune(f);
                    chan.set_freq(chan.tune.freq, first_lo);
                }
            }
            Tag::SHIFT_FREQUENCY => {
                let f = tlv::decode_double(value);
                if f.is_finite() {
                    chan.tune.shift = f;
                }
            }
            Tag::DOPPLER_FREQUENCY => {
                let f = tlv::decode_double(value);
                if f.is_finite() {
                    chan.tune.doppler = f;
                }
            }
            Tag::DOPPLER_FREQUENCY_RATE => {
                let f = tlv::decode_double(value);
                if f.is_finite() {
                    chan.tune.doppler_rate = f;
                }
            }
            Tag::LOW_EDGE => {
                let f = tlv::decode_float(value);
                if f.is_finite() {
                    overrides.low_edge = Some(f);
                    // spectrum channels take this as informational
                    // only, handled in the override pass
                    if chan.demod_type != DemodType::Spect {
                        chan.filter.min_if = f.max(-(chan.output.samprate as f32) / 2.0);
                        new_filter_needed = true;
                    }
                }
            }
            Tag::HIGH_EDGE => {
                let f = tlv::decode_float(value);
                if f.is_finite() {
                    overrides.high_edge = Some(f);
                    if chan.demod_type != DemodType::Spect {
                        chan.filter.max_if = f.min(chan.output.samprate as f32 / 2.0);
                        new_filter_needed = true;
                    }
                }
            }
            Tag::KAISER_BETA => {
                let f = tlv::decode_float(value).abs();
                if f.is_finite() && chan.filter.kaiser_beta != f {
                    chan.filter.kaiser_beta = f;
                    new_filter_needed = true;
                }
            }
            Tag::FILTER2_KAISER_BETA => {
                let f = tlv::decode_float(value).abs();
                if f.is_finite() && chan.filter2.kaiser_beta != f {
                    chan.filter2.kaiser_beta = f;
                    new_filter_needed = true;
                }
            }
            Tag::PRESET => {
                chan.preset = tlv::decode_string(value);
                let Some(preset) = ctx.presets.get(&chan.preset)
                else {
                    tracing::warn!(ssrc, preset = %chan.preset, "unknown preset");
                    continue;
                };

                let old_type = chan.demod_type;
                let old_samprate = chan.output.samprate;
                let old_low = chan.filter.min_if;
                let old_high = chan.filter.max_if;
                let old_kaiser = chan.filter.kaiser_beta;
                let old_shift = chan.tune.shift;

                preset.apply(chan);

                if old_shift != chan.tune.shift {
                    // keep the audible tone where it was
                    chan.set_freq(chan.tune.freq + chan.tune.shift - old_shift, first_lo);
                }
                if chan.filter.min_if != old_low
                    || chan.filter.max_if != old_high
                    || chan.filter.kaiser_beta != old_kaiser
                {
                    new_filter_needed = true;
                }
                if chan.demod_type != old_type || chan.output.samprate != old_samprate {
                    tracing::debug!(
                        ssrc,
                        ?old_type,
                        new_type = ?chan.demod_type,
                        old_samprate,
                        new_samprate = chan.output.samprate,
                        "preset changed demod"
                    );
                    restart_needed = true;
                }
            }
            Tag::DEMOD_TYPE => {
                if let Some(demod_type) = DemodType::from_int(tlv::decode_u32(value))
                    && demod_type != chan.demod_type
                {
                    tracing::debug!(ssrc, from = ?chan.demod_type, to = ?demod_type, "demod change");
                    chan.demod_type = demod_type;
                    restart_needed = true;
                }
            }
            Tag::INDEPENDENT_SIDEBAND => {
                let isb = tlv::decode_bool(value);
                if isb != chan.filter2.isb {
                    chan.filter2.isb = isb;
                    new_filter_needed = true;
                }
            }
            Tag::THRESH_EXTEND => {
                chan.fm.threshold_extend = tlv::decode_bool(value);
            }
            Tag::HEADROOM => {
                let f = tlv::decode_float(value);
                if f.is_finite() {
                    chan.output.headroom = db2voltage(-f.abs());
                }
            }
            Tag::AGC_ENABLE => {
                chan.linear.agc = tlv::decode_bool(value);
            }
            Tag::GAIN => {
                let f = tlv::decode_float(value);
                if f.is_finite() {
                    chan.output.gain = db2voltage(f);
                    // a manual gain and an AGC fighting over it makes
                    // no sense
                    chan.linear.agc = false;
                }
            }
            Tag::AGC_HANGTIME => {
                let f = tlv::decode_float(value);
                if f.is_finite() {
                    chan.linear.hangtime = f.abs();
                }
            }
            Tag::AGC_RECOVERY_RATE => {
                let f = tlv::decode_float(value);
                if f.is_finite() {
                    chan.linear.recovery_rate = db2voltage(f.abs());
                }
            }
            Tag::AGC_THRESHOLD => {
                let f = tlv::decode_float(value);
                if f.is_finite() {
                    chan.linear.threshold = db2voltage(-f.abs());
                }
            }
            Tag::PLL_ENABLE => {
                chan.pll.enable = tlv::decode_bool(value);
            }
            Tag::PLL_BW => {
                let f = tlv::decode_float(value);
                if f.is_finite() {
                    chan.pll.loop_bw = f.abs();
                }
            }
            Tag::PLL_SQUARE => {
                chan.pll.square = tlv::decode_bool(value);
            }
            Tag::ENVELOPE => {
                chan.linear.env = tlv::decode_bool(value);
            }
            Tag::SNR_SQUELCH => {
                chan.snr_squelch_enable = tlv::decode_bool(value);
            }
            Tag::OUTPUT_CHANNELS => {
                let channels = tlv::decode_u32(value);
                if channels != 1 && channels != 2 {
                    continue;
                }
                if chan.demod_type == DemodType::Wfm {
                    // stereo is a decoder mode, not an output layout
                    chan.fm.stereo_enable = channels == 2;
                }
                else if channels as u8 != chan.output.channels {
                    chan.output.channels = channels as u8;
                    chan.refresh_rtp_type();
                }
            }
            Tag::SQUELCH_OPEN => {
                let f = tlv::decode_float(value);
                if f.is_finite() {
                    chan.squelch_open = Squelch::from_db(f);
                }
            }
            Tag::SQUELCH_CLOSE => {
                let f = tlv::decode_float(value);
                if f.is_finite() {
                    chan.squelch_close = Squelch::from_db(f);
                }
            }
            Tag::NONCOHERENT_BIN_BW => {
                let f = tlv::decode_float(value);
                if f.is_finite() {
                    overrides.bin_bw = Some(f);
                }
            }
            Tag::BIN_COUNT => {
                let count = tlv::decode_u32(value);
                if count > 0 {
                    overrides.bin_count = Some(count);
                }
            }
            Tag::STATUS_INTERVAL => {
                chan.status.output_interval = tlv::decode_u32(value);
            }
            Tag::OUTPUT_ENCODING => {
                if let Some(encoding) = Encoding::from_int(tlv::decode_u32(value))
                    && encoding != chan.output.encoding
                {
                    chan.output.encoding = encoding;
                    // Opus runs at 48k internally and handles only a
                    // few rates
                    if encoding == Encoding::Opus
                        && !OPUS_SAMPRATES.contains(&chan.output.samprate)
                    {
                        chan.output.samprate = 48_000;
                        restart_needed = true;
                    }
                    chan.refresh_rtp_type();
                }
            }
            Tag::OPUS_BIT_RATE => {
                chan.output.opus_bitrate = tlv::decode_i64(value).unsigned_abs() as u32;
            }
            Tag::SETOPTS => {
                chan.options |= tlv::decode_u64(value);
            }
            Tag::CLEAROPTS => {
                chan.options &= !tlv::decode_u64(value);
            }
            Tag::RF_ATTEN => {
                let f = tlv::decode_float(value);
                if !f.is_nan() {
                    ctx.frontend.set_atten(f);
                }
            }
            Tag::RF_GAIN => {
                let f = tlv::decode_float(value);
                if !f.is_nan() {
                    ctx.frontend.set_gain(f);
                }
            }
            Tag::MINPACKET => {
                let minpacket = tlv::decode_u32(value);
                if minpacket <= 4 && minpacket as u8 != chan.output.minpacket {
                    chan.output.minpacket = minpacket as u8;
                }
            }
            Tag::FILTER2 => {
                let blocking = tlv::decode_u32(value).min(10);
                if blocking != chan.filter2.blocking {
                    chan.filter2.blocking = blocking;
                    new_filter_needed = true;
                }
            }
            Tag::OUTPUT_DATA_DEST_SOCKET => {
                // sets both data and status destinations, forcing
                // their ports to the well-known defaults
                if let Some(mut socket) = tlv::decode_socket(value) {
                    socket.set_port(DEFAULT_RTP_PORT);
                    chan.output.dest_socket = socket;
                    socket.set_port(DEFAULT_STAT_PORT);
                    chan.status.dest_socket = socket;
                }
            }
            _ => {
                // unknown tags are ignored
            }
        }
    }

    // Override pass: caller values win over whatever the preset wrote.
    if overrides.any() {
        if chan.demod_type == DemodType::Spect {
            // edges are informational here, spectrum channels span
            // their own bandwidth
            if let Some(low_edge) = overrides.low_edge {
                tracing::debug!(ssrc, low_edge, "spectrum low edge noted");
            }
            if let Some(high_edge) = overrides.high_edge {
                tracing::debug!(ssrc, high_edge, "spectrum high edge noted");
            }
            if let Some(bin_count) = overrides.bin_count
                && bin_count != chan.spectrum.bin_count
            {
                tracing::debug!(
                    ssrc,
                    from = chan.spectrum.bin_count,
                    to = bin_count,
                    "bin count changed, aggregator will reallocate"
                );
                chan.spectrum.bin_count = bin_count;
                chan.spectrum.params_changed = true;
                spectrum_params_changed = true;
            }
            if let Some(bin_bw) = overrides.bin_bw
                && bin_bw != chan.spectrum.bin_bw
            {
                tracing::debug!(
                    ssrc,
                    from = chan.spectrum.bin_bw,
                    to = bin_bw,
                    "bin bandwidth changed, aggregator will reallocate"
                );
                chan.spectrum.bin_bw = bin_bw;
                chan.spectrum.params_changed = true;
                spectrum_params_changed = true;
            }
        }
        else {
            if let Some(low_edge) = overrides.low_edge {
                let clamped = low_edge.max(-(chan.output.samprate as f32) / 2.0);
                if chan.filter.min_if != clamped {
                    chan.filter.min_if = clamped;
                    new_filter_needed = true;
                }
            }
            if let Some(high_edge) = overrides.high_edge {
                let clamped = high_edge.min(chan.output.samprate as f32 / 2.0);
                if chan.filter.max_if != clamped {
                    chan.filter.max_if = clamped;
                    new_filter_needed = true;
                }
            }
        }
    }

    if chan.demod_type == DemodType::Spect {
        // no presets in spectrum mode
        chan.preset.clear();
        if spectrum_params_changed {
            return CommandDisposition::SpectrumChanged;
        }
        return CommandDisposition::Applied;
    }

    if restart_needed {
        tracing::debug!(ssrc, "restart scheduled");
        return CommandDisposition::RestartNeeded;
    }
    if new_filter_needed {
        // retune to keep the passband edge inside the frontend, and
        // invalidate the fine oscillator so the DSP re-derives it
        chan.set_freq(chan.tune.freq, first_lo);
        chan.filter.remainder = Remainder::NeedsInit;
    }
    CommandDisposition::Applied
}

/// True when a CMD addressed to this SSRC must not mutate any channel.
pub fn is_reserved_ssrc(ssrc: u32) -> bool {
    ssrc == TEMPLATE_SSRC || ssrc == BROADCAST_SSRC
}
