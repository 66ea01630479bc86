//! STATUS packet emission.
//!
//! A status packet snapshots the frontend and one channel into TLV
//! options, in a fixed order that puts the identifying options first.
//! Values cross the wire in engineering units (dB, Hz, seconds).

use std::net::{
    SocketAddr,
    UdpSocket,
};

use crate::{
    channel::{
        Channel,
        DemodType,
    },
    demod::spectrum_poll,
    frontend::Frontend,
    tlv::{
        self,
        PacketKind,
        Tag,
    },
    units::{
        gps_time_ns,
        power2db,
        voltage2db,
    },
};

/// Zero the per-poll integrators after a status was sent, so the
/// next window accumulates fresh.
pub fn reset_radio_status(chan: &mut Channel) {
    chan.status.blocks_since_poll = 0;
    if let Some(bins) = &mut chan.spectrum.bin_data {
        bins.fill(0.0);
    }
}

/// Encode one STATUS packet.
///
/// `skip_spectrum_poll` suppresses the bin refresh for one cycle
/// after spectrum parameters changed; bin data is also omitted while
/// the aggregator has not allocated storage yet.
pub fn encode_radio_status(
    frontend: &Frontend,
    status_dest: &SocketAddr,
    chan: &mut Channel,
    skip_spectrum_poll: bool,
) -> Vec<u8> {
    let mut packet = vec![PacketKind::Status.to_byte()];
    let buffer = &mut packet;

    // identification first, to make dumps readable
    tlv::encode_int(buffer, Tag::OUTPUT_SSRC, chan.ssrc.into());
    tlv::encode_int(buffer, Tag::COMMAND_TAG, chan.status.tag.into());
    tlv::encode_int(buffer, Tag::CMD_CNT, chan.status.packets_in);
    if !frontend.description.is_empty() {
        tlv::encode_string(buffer, Tag::DESCRIPTION, &frontend.description);
    }

    tlv::encode_int(buffer, Tag::RTP_TIMESNAP, chan.output.rtp_timestamp.into());
    tlv::encode_socket(buffer, Tag::STATUS_DEST_SOCKET, status_dest);
    tlv::encode_int(buffer, Tag::GPS_TIME, gps_time_ns() as u64);
    tlv::encode_int(buffer, Tag::INPUT_SAMPLES, frontend.samples);
    tlv::encode_int(buffer, Tag::INPUT_SAMPRATE, frontend.samprate.into());
    tlv::encode_bool(buffer, Tag::FE_ISREAL, frontend.isreal);
    tlv::encode_double(buffer, Tag::CALIBRATE, frontend.calibrate);
    tlv::encode_float(buffer, Tag::RF_GAIN, frontend.rf_gain);
    tlv::encode_float(buffer, Tag::RF_ATTEN, frontend.rf_atten);
    tlv::encode_float(buffer, Tag::RF_LEVEL_CAL, frontend.rf_level_cal);
    tlv::encode_bool(buffer, Tag::RF_AGC, frontend.rf_agc);
    tlv::encode_int(buffer, Tag::LNA_GAIN, frontend.lna_gain as u64);
    tlv::encode_int(buffer, Tag::MIXER_GAIN, frontend.mixer_gain as u64);
    tlv::encode_int(buffer, Tag::IF_GAIN, frontend.if_gain as u64);
    tlv::encode_float(buffer, Tag::FE_LOW_EDGE, frontend.min_if);
    tlv::encode_float(buffer, Tag::FE_HIGH_EDGE, frontend.max_if);
    tlv::encode_int(buffer, Tag::AD_BITS_PER_SAMPLE, frontend.bits_per_sample.into());

    // tuning
    tlv::encode_double(buffer, Tag::RADIO_FREQUENCY, chan.tune.freq);
    tlv::encode_double(buffer, Tag::FIRST_LO_FREQUENCY, frontend.frequency);
    tlv::encode_double(buffer, Tag::SECOND_LO_FREQUENCY, chan.tune.second_lo);

    tlv::encode_int(buffer, Tag::FILTER_BLOCKSIZE, frontend.block_size.into());
    tlv::encode_int(buffer, Tag::FILTER_FIR_LENGTH, frontend.impulse_length.into());
    tlv::encode_int(buffer, Tag::FILTER_DROPS, chan.filter.block_drops);

    // level is relative to A/D saturation
    tlv::encode_float(
        buffer,
        Tag::IF_POWER,
        power2db(frontend.if_power * frontend.ad_power_scale()),
    );
    tlv::encode_int(buffer, Tag::AD_OVER, frontend.overranges);
    tlv::encode_int(buffer, Tag::SAMPLES_SINCE_OVER, frontend.samples_since_over);
    tlv::encode_float(buffer, Tag::NOISE_DENSITY, power2db(chan.sig.n0));

    tlv::encode_byte(buffer, Tag::DEMOD_TYPE, chan.demod_type.to_int() as u8);
    if !chan.preset.is_empty() {
        tlv::encode_string(buffer, Tag::PRESET, &chan.preset);
    }

    match chan.demod_type {
        DemodType::Linear => {
            tlv::encode_bool(buffer, Tag::SNR_SQUELCH, chan.snr_squelch_enable);
            tlv::encode_bool(buffer, Tag::PLL_ENABLE, chan.pll.enable);
            if chan.pll.enable {
                tlv::encode_float(buffer, Tag::FREQ_OFFSET, chan.sig.foffset);
                tlv::encode_bool(buffer, Tag::PLL_LOCK, chan.pll.lock);
                tlv::encode_bool(buffer, Tag::PLL_SQUARE, chan.pll.square);
                tlv::encode_float(buffer, Tag::PLL_PHASE, chan.pll.cphase);
                tlv::encode_float(buffer, Tag::PLL_BW, chan.pll.loop_bw);
                tlv::encode_int(buffer, Tag::PLL_WRAPS, chan.pll.rotations as u64);
                tlv::encode_float(buffer, Tag::PLL_SNR, power2db(chan.pll.snr));
            }
            tlv::encode_float(buffer, Tag::SQUELCH_OPEN, power2db(chan.squelch_open.power()));
            tlv::encode_float(buffer, Tag::SQUELCH_CLOSE, power2db(chan.squelch_close.power()));
            tlv::encode_bool(buffer, Tag::ENVELOPE, chan.linear.env);
            tlv::encode_double(buffer, Tag::SHIFT_FREQUENCY, chan.tune.shift);
            tlv::encode_bool(buffer, Tag::AGC_ENABLE, chan.linear.agc);
            if chan.linear.agc {
                tlv::encode_float(buffer, Tag::AGC_HANGTIME, chan.linear.hangtime);
                tlv::encode_float(
                    buffer,
                    Tag::AGC_THRESHOLD,
                    voltage2db(chan.linear.threshold),
                );
                tlv::encode_float(
                    buffer,
                    Tag::AGC_RECOVERY_RATE,
                    voltage2db(chan.linear.recovery_rate),
                );
            }
            tlv::encode_bool(buffer, Tag::INDEPENDENT_SIDEBAND, chan.filter2.isb);
        }
        DemodType::Fm | DemodType::Wfm => {
            tlv::encode_bool(buffer, Tag::SNR_SQUELCH, chan.snr_squelch_enable);
            if chan.demod_type == DemodType::Fm && chan.fm.tone_freq != 0.0 {
                tlv::encode_float(buffer, Tag::PL_TONE, chan.fm.tone_freq);
                tlv::encode_float(buffer, Tag::PL_DEVIATION, chan.fm.tone_deviation);
            }
            tlv::encode_float(buffer, Tag::FREQ_OFFSET, chan.sig.foffset);
            tlv::encode_float(buffer, Tag::SQUELCH_OPEN, power2db(chan.squelch_open.power()));
            tlv::encode_float(buffer, Tag::SQUELCH_CLOSE, power2db(chan.squelch_close.power()));
            tlv::encode_bool(buffer, Tag::THRESH_EXTEND, chan.fm.threshold_extend);
            tlv::encode_float(buffer, Tag::PEAK_DEVIATION, chan.fm.pdeviation);
            // deemphasis runs at the output rate, except WFM which
            // always deemphasizes at 48k
            let deemph_rate = if chan.demod_type == DemodType::Wfm {
                48_000.0
            }
            else {
                chan.output.samprate as f32
            };
            tlv::encode_float(
                buffer,
                Tag::DEEMPH_TC,
                -1.0 / ((-chan.fm.rate).ln_1p() * deemph_rate),
            );
            tlv::encode_float(buffer, Tag::DEEMPH_GAIN, voltage2db(chan.fm.gain));
            tlv::encode_float(buffer, Tag::FM_SNR, power2db(chan.fm.snr));
        }
        DemodType::Spect => {
            tlv::encode_float(buffer, Tag::NONCOHERENT_BIN_BW, chan.spectrum.bin_bw);
            tlv::encode_int(buffer, Tag::BIN_COUNT, chan.spectrum.bin_count.into());
            // right after a parameter change the aggregator may not
            // have reallocated yet; emit no bins that cycle
            if !skip_spectrum_poll && chan.spectrum.bin_data.is_some() {
                spectrum_poll(chan);
            }
            if let Some(bin_data) = &chan.spectrum.bin_data {
                tlv::encode_vector(buffer, Tag::BIN_DATA, bin_data);
            }
        }
    }

    tlv::encode_float(buffer, Tag::LOW_EDGE, chan.filter.min_if);
    tlv::encode_float(buffer, Tag::HIGH_EDGE, chan.filter.max_if);

    // output metadata means nothing in spectrum analysis mode
    if chan.demod_type != DemodType::Spect {
        tlv::encode_int(buffer, Tag::OUTPUT_SAMPRATE, chan.output.samprate.into());
        tlv::encode_int(buffer, Tag::OUTPUT_DATA_PACKETS, chan.output.rtp_packets);
        tlv::encode_float(buffer, Tag::KAISER_BETA, chan.filter.kaiser_beta);
        tlv::encode_int(buffer, Tag::FILTER2, chan.filter2.blocking.into());
        if chan.filter2.blocking != 0 {
            tlv::encode_int(buffer, Tag::FILTER2_BLOCKSIZE, chan.filter2.block_size.into());
            tlv::encode_int(
                buffer,
                Tag::FILTER2_FIR_LENGTH,
                chan.filter2.impulse_length.into(),
            );
            tlv::encode_float(buffer, Tag::FILTER2_KAISER_BETA, chan.filter2.kaiser_beta);
        }
        tlv::encode_float(buffer, Tag::BASEBAND_POWER, power2db(chan.sig.bb_power));
        tlv::encode_float(buffer, Tag::OUTPUT_LEVEL, power2db(chan.output.power));
        if chan.demod_type == DemodType::Linear {
            tlv::encode_float(buffer, Tag::GAIN, voltage2db(chan.output.gain));
        }
        tlv::encode_int(buffer, Tag::OUTPUT_SAMPLES, chan.output.samples);
        tlv::encode_int(buffer, Tag::OPUS_BIT_RATE, chan.output.opus_bitrate.into());
        tlv::encode_float(buffer, Tag::HEADROOM, voltage2db(chan.output.headroom));
        tlv::encode_double(buffer, Tag::DOPPLER_FREQUENCY, chan.tune.doppler);
        tlv::encode_double(buffer, Tag::DOPPLER_FREQUENCY_RATE, chan.tune.doppler_rate);
        tlv::encode_int(buffer, Tag::OUTPUT_CHANNELS, chan.output.channels.into());
        tlv::encode_socket(
            buffer,
            Tag::OUTPUT_DATA_SOURCE_SOCKET,
            &chan.output.source_socket,
        );
        tlv::encode_socket(buffer, Tag::OUTPUT_DATA_DEST_SOCKET, &chan.output.dest_socket);
        tlv::encode_int(buffer, Tag::OUTPUT_TTL, chan.output.ttl.into());
        tlv::encode_int(buffer, Tag::OUTPUT_METADATA_PACKETS, chan.status.packets_out);
        tlv::encode_byte(buffer, Tag::RTP_PT, chan.output.rtp_type);
        tlv::encode_int(buffer, Tag::STATUS_INTERVAL, chan.status.output_interval.into());
        tlv::encode_int(buffer, Tag::OUTPUT_ENCODING, chan.output.encoding.to_int().into());
        tlv::encode_int(buffer, Tag::MINPACKET, chan.output.minpacket.into());
    }

    // test points only when in use
    if let Some(tp1) = chan.tp1 {
        tlv::encode_float(buffer, Tag::TP1, tp1);
    }
    if let Some(tp2) = chan.tp2 {
        tlv::encode_float(buffer, Tag::TP2, tp2);
    }
    tlv::encode_int(buffer, Tag::BLOCKS_SINCE_POLL, chan.status.blocks_since_poll);
    tlv::encode_int(buffer, Tag::SETOPTS, chan.options);
    tlv::encode_int(buffer, Tag::OUTPUT_ERRORS, chan.output.errors);
    tlv::encode_eol(buffer);

    packet
}

/// Encode and send one status packet on the control socket.
///
/// Replies always leave via the control socket: it is the one bound
/// into the status group, and strict network policies reject sends
/// that cross from the data group.
pub fn send_radio_status(
    ctl_socket: &UdpSocket,
    dest: &SocketAddr,
    frontend: &Frontend,
    status_dest: &SocketAddr,
    chan: &mut Channel,
    skip_spectrum_poll: bool,
) {
    chan.status.packets_out += 1;
    let packet = encode_radio_status(frontend, status_dest, chan, skip_spectrum_poll);
    if let Err(error) = ctl_socket.send_to(&packet, dest) {
        chan.output.errors += 1;
        tracing::debug!(ssrc = chan.ssrc, %dest, %error, "status send failed");
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::{
        channel::Channel,
        tlv::Options,
    };

    const BLOCK_RATE: u32 = 50;

    fn decode_options(packet: &[u8]) -> HashMap<u8, Vec<u8>> {
        assert_eq!(PacketKind::from_byte(packet[0]), Some(PacketKind::Status));
        Options::new(&packet[1..])
            .map(|option| (option.tag.0, option.value.to_vec()))
            .collect()
    }

    fn frontend() -> Frontend {
        let mut frontend = Frontend::new("unit test frontend");
        frontend.samprate = 192_000;
        frontend.frequency = 7_100_000.0;
        frontend.if_power = 1000.0;
        frontend
    }

    #[test]
    fn status_packet_decodes() {
        let frontend = frontend();
        let status_dest: SocketAddr = "239.251.200.100:5006".parse().unwrap();
        let mut chan = Channel::template(42, BLOCK_RATE);
        chan.tune.freq = 7_050_000.0;
        chan.status.tag = 0xcafe;
        chan.preset = "usb".into();

        let packet = encode_radio_status(&frontend, &status_dest, &mut chan, false);
        let options = decode_options(&packet);

        assert_eq!(tlv::decode_u32(&options[&Tag::OUTPUT_SSRC.0]), 42);
        assert_eq!(tlv::decode_u32(&options[&Tag::COMMAND_TAG.0]), 0xcafe);
        assert_eq!(
            tlv::decode_double(&options[&Tag::RADIO_FREQUENCY.0]),
            7_050_000.0
        );
        assert_eq!(
            tlv::decode_double(&options[&Tag::FIRST_LO_FREQUENCY.0]),
            7_100_000.0
        );
        assert_eq!(tlv::decode_string(&options[&Tag::PRESET.0]), "usb");
        assert_eq!(
            tlv::decode_socket(&options[&Tag::STATUS_DEST_SOCKET.0]),
            Some(status_dest)
        );
        // linear channel carries output metadata
        assert_eq!(
            tlv::decode_u32(&options[&Tag::OUTPUT_SAMPRATE.0]),
            chan.output.samprate
        );
        assert!(options.contains_key(&Tag::GAIN.0));
        // no test points in use
        assert!(!options.contains_key(&Tag::TP1.0));
    }

    #[test]
    fn spectrum_omits_bins_without_storage() {
        let frontend = frontend();
        let status_dest: SocketAddr = "239.251.200.100:5006".parse().unwrap();
        let mut chan = Channel::template(7, BLOCK_RATE);
        chan.demod_type = DemodType::Spect;
        chan.spectrum.bin_data = None;

        let packet = encode_radio_status(&frontend, &status_dest, &mut chan, false);
        let options = decode_options(&packet);

        assert!(options.contains_key(&Tag::BIN_COUNT.0));
        assert!(!options.contains_key(&Tag::BIN_DATA.0));
        // spectrum channels skip the output metadata bundle
        assert!(!options.contains_key(&Tag::OUTPUT_SAMPRATE.0));
    }

    #[test]
    fn spectrum_bins_emitted_once_allocated() {
        let frontend = frontend();
        let status_dest: SocketAddr = "239.251.200.100:5006".parse().unwrap();
        let mut chan = Channel::template(7, BLOCK_RATE);
        chan.demod_type = DemodType::Spect;
        chan.spectrum.bin_count = 4;
        chan.spectrum.bin_data = Some(vec![1.0, 2.0, 3.0, 4.0]);

        let packet = encode_radio_status(&frontend, &status_dest, &mut chan, true);
        let options = decode_options(&packet);

        let bins = &options[&Tag::BIN_DATA.0];
        assert_eq!(bins.len(), 16);
        // skip flag left the accumulated values alone
        assert_eq!(tlv::decode_float(&bins[0..4]), 1.0);
    }

    #[test]
    fn send_failure_counts_as_output_error() {
        let frontend = frontend();
        let status_dest: SocketAddr = "239.251.200.100:5006".parse().unwrap();
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let mut chan = Channel::template(3, BLOCK_RATE);

        // port 0 is unroutable as a destination
        let bad_dest: SocketAddr = "127.0.0.1:0".parse().unwrap();
        send_radio_status(&socket, &bad_dest, &frontend, &status_dest, &mut chan, false);

        assert_eq!(chan.status.packets_out, 1);
        assert_eq!(chan.output.errors, 1);
    }
}
