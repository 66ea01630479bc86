//! TLV option codec for the control/status protocol.
//!
//! A datagram starts with a single packet-kind byte, followed by a
//! sequence of options terminated by [`Tag::EOL`]. Each non-EOL option
//! is `tag(1) length(1 or 1+N) value(length)`. When the high bit of
//! the first length byte is set, its low 7 bits give the number of
//! big-endian bytes that hold the actual length.
//!
//! Integers are minimal-width big-endian (leading zero bytes
//! stripped, so a zero value has an empty payload); floats are IEEE-754
//! big-endian; strings are raw UTF-8; sockets are family + address +
//! port.

use std::{
    fmt::Debug,
    net::{
        IpAddr,
        Ipv4Addr,
        Ipv6Addr,
        SocketAddr,
    },
};

use bytes::BufMut;

/// First byte of every control-plane datagram.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PacketKind {
    Status,
    Cmd,
}

impl PacketKind {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Status),
            1 => Some(Self::Cmd),
            _ => None,
        }
    }

    pub fn to_byte(self) -> u8 {
        match self {
            Self::Status => 0,
            Self::Cmd => 1,
        }
    }
}

/// Option tag.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tag(pub u8);

impl Tag {
    pub const EOL: Self = Self(0);
    pub const COMMAND_TAG: Self = Self(1);
    pub const OUTPUT_SSRC: Self = Self(2);
    pub const CMD_CNT: Self = Self(3);
    pub const GPS_TIME: Self = Self(4);
    pub const DESCRIPTION: Self = Self(5);
    pub const RTP_TIMESNAP: Self = Self(6);
    pub const STATUS_DEST_SOCKET: Self = Self(7);
    pub const INPUT_SAMPLES: Self = Self(8);
    pub const INPUT_SAMPRATE: Self = Self(9);
    pub const FE_ISREAL: Self = Self(10);
    pub const CALIBRATE: Self = Self(11);
    pub const RF_GAIN: Self = Self(12);
    pub const RF_ATTEN: Self = Self(13);
    pub const RF_LEVEL_CAL: Self = Self(14);
    pub const RF_AGC: Self = Self(15);
    pub const LNA_GAIN: Self = Self(16);
    pub const MIXER_GAIN: Self = Self(17);
    pub const IF_GAIN: Self = Self(18);
    pub const FE_LOW_EDGE: Self = Self(19);
    pub const FE_HIGH_EDGE: Self = Self(20);
    pub const AD_BITS_PER_SAMPLE: Self = Self(21);
    pub const RADIO_FREQUENCY: Self = Self(22);
    pub const FIRST_LO_FREQUENCY: Self = Self(23);
    pub const SECOND_LO_FREQUENCY: Self = Self(24);
    pub const SHIFT_FREQUENCY: Self = Self(25);
    pub const DOPPLER_FREQUENCY: Self = Self(26);
    pub const DOPPLER_FREQUENCY_RATE: Self = Self(27);
    pub const LOW_EDGE: Self = Self(28);
    pub const HIGH_EDGE: Self = Self(29);
    pub const KAISER_BETA: Self = Self(30);
    pub const FILTER2: Self = Self(31);
    pub const FILTER2_BLOCKSIZE: Self = Self(32);
    pub const FILTER2_FIR_LENGTH: Self = Self(33);
    pub const FILTER2_KAISER_BETA: Self = Self(34);
    pub const PRESET: Self = Self(35);
    pub const DEMOD_TYPE: Self = Self(36);
    pub const INDEPENDENT_SIDEBAND: Self = Self(37);
    pub const THRESH_EXTEND: Self = Self(38);
    pub const HEADROOM: Self = Self(39);
    pub const AGC_ENABLE: Self = Self(40);
    pub const GAIN: Self = Self(41);
    pub const AGC_HANGTIME: Self = Self(42);
    pub const AGC_RECOVERY_RATE: Self = Self(43);
    pub const AGC_THRESHOLD: Self = Self(44);
    pub const PLL_ENABLE: Self = Self(45);
    pub const PLL_BW: Self = Self(46);
    pub const PLL_SQUARE: Self = Self(47);
    pub const PLL_LOCK: Self = Self(48);
    pub const PLL_PHASE: Self = Self(49);
    pub const PLL_WRAPS: Self = Self(50);
    pub const PLL_SNR: Self = Self(51);
    pub const ENVELOPE: Self = Self(52);
    pub const SNR_SQUELCH: Self = Self(53);
    pub const OUTPUT_CHANNELS: Self = Self(54);
    pub const SQUELCH_OPEN: Self = Self(55);
    pub const SQUELCH_CLOSE: Self = Self(56);
    pub const NONCOHERENT_BIN_BW: Self = Self(57);
    pub const BIN_COUNT: Self = Self(58);
    pub const BIN_DATA: Self = Self(59);
    pub const STATUS_INTERVAL: Self = Self(60);
    pub const OUTPUT_ENCODING: Self = Self(61);
    pub const OPUS_BIT_RATE: Self = Self(62);
    pub const SETOPTS: Self = Self(63);
    pub const CLEAROPTS: Self = Self(64);
    pub const MINPACKET: Self = Self(65);
    pub const OUTPUT_DATA_DEST_SOCKET: Self = Self(66);
    pub const OUTPUT_DATA_SOURCE_SOCKET: Self = Self(67);
    pub const OUTPUT_TTL: Self = Self(68);
    pub const OUTPUT_METADATA_PACKETS: Self = Self(69);
    pub const RTP_PT: Self = Self(70);
    pub const OUTPUT_SAMPRATE: Self = Self(71);
    pub const OUTPUT_DATA_PACKETS: Self = Self(72);
    pub const OUTPUT_LEVEL: Self = Self(73);
    pub const BASEBAND_POWER: Self = Self(74);
    pub const OUTPUT_SAMPLES: Self = Self(75);
    pub const FILTER_BLOCKSIZE: Self = Self(76);
    pub const FILTER_FIR_LENGTH: Self = Self(77);
    pub const FILTER_DROPS: Self = Self(78);
    pub const IF_POWER: Self = Self(79);
    pub const AD_OVER: Self = Self(80);
    pub const SAMPLES_SINCE_OVER: Self = Self(81);
    pub const NOISE_DENSITY: Self = Self(82);
    pub const FREQ_OFFSET: Self = Self(83);
    pub const PL_TONE: Self = Self(84);
    pub const PL_DEVIATION: Self = Self(85);
    pub const PEAK_DEVIATION: Self = Self(86);
    pub const DEEMPH_TC: Self = Self(87);
    pub const DEEMPH_GAIN: Self = Self(88);
    pub const FM_SNR: Self = Self(89);
    pub const TP1: Self = Self(90);
    pub const TP2: Self = Self(91);
    pub const BLOCKS_SINCE_POLL: Self = Self(92);
    pub const OUTPUT_ERRORS: Self = Self(93);

    fn name(self) -> Option<&'static str> {
        Some(match self {
            Self::EOL => "EOL",
            Self::COMMAND_TAG => "COMMAND_TAG",
            Self::OUTPUT_SSRC => "OUTPUT_SSRC",
            Self::CMD_CNT => "CMD_CNT",
            Self::GPS_TIME => "GPS_TIME",
            Self::DESCRIPTION => "DESCRIPTION",
            Self::RTP_TIMESNAP => "RTP_TIMESNAP",
            Self::STATUS_DEST_SOCKET => "STATUS_DEST_SOCKET",
            Self::INPUT_SAMPLES => "INPUT_SAMPLES",
            Self::INPUT_SAMPRATE => "INPUT_SAMPRATE",
            Self::FE_ISREAL => "FE_ISREAL",
            Self::CALIBRATE => "CALIBRATE",
            Self::RF_GAIN => "RF_GAIN",
            Self::RF_ATTEN => "RF_ATTEN",
            Self::RF_LEVEL_CAL => "RF_LEVEL_CAL",
            Self::RF_AGC => "RF_AGC",
            Self::LNA_GAIN => "LNA_GAIN",
            Self::MIXER_GAIN => "MIXER_GAIN",
            Self::IF_GAIN => "IF_GAIN",
            Self::FE_LOW_EDGE => "FE_LOW_EDGE",
            Self::FE_HIGH_EDGE => "FE_HIGH_EDGE",
            Self::AD_BITS_PER_SAMPLE => "AD_BITS_PER_SAMPLE",
            Self::RADIO_FREQUENCY => "RADIO_FREQUENCY",
            Self::FIRST_LO_FREQUENCY => "FIRST_LO_FREQUENCY",
            Self::SECOND_LO_FREQUENCY => "SECOND_LO_FREQUENCY",
            Self::SHIFT_FREQUENCY => "SHIFT_FREQUENCY",
            Self::DOPPLER_FREQUENCY => "DOPPLER_FREQUENCY",
            Self::DOPPLER_FREQUENCY_RATE => "DOPPLER_FREQUENCY_RATE",
            Self::LOW_EDGE => "LOW_EDGE",
            Self::HIGH_EDGE => "HIGH_EDGE",
            Self::KAISER_BETA => "KAISER_BETA",
            Self::FILTER2 => "FILTER2",
            Self::FILTER2_BLOCKSIZE => "FILTER2_BLOCKSIZE",
            Self::FILTER2_FIR_LENGTH => "FILTER2_FIR_LENGTH",
            Self::FILTER2_KAISER_BETA => "FILTER2_KAISER_BETA",
            Self::PRESET => "PRESET",
            Self::DEMOD_TYPE => "DEMOD_TYPE",
            Self::INDEPENDENT_SIDEBAND => "INDEPENDENT_SIDEBAND",
            Self::THRESH_EXTEND => "THRESH_EXTEND",
            Self::HEADROOM => "HEADROOM",
            Self::AGC_ENABLE => "AGC_ENABLE",
            Self::GAIN => "GAIN",
            Self::AGC_HANGTIME => "AGC_HANGTIME",
            Self::AGC_RECOVERY_RATE => "AGC_RECOVERY_RATE",
            Self::AGC_THRESHOLD => "AGC_THRESHOLD",
            Self::PLL_ENABLE => "PLL_ENABLE",
            Self::PLL_BW => "PLL_BW",
            Self::PLL_SQUARE => "PLL_SQUARE",
            Self::PLL_LOCK => "PLL_LOCK",
            Self::PLL_PHASE => "PLL_PHASE",
            Self::PLL_WRAPS => "PLL_WRAPS",
            Self::PLL_SNR => "PLL_SNR",
            Self::ENVELOPE => "ENVELOPE",
            Self::SNR_SQUELCH => "SNR_SQUELCH",
            Self::OUTPUT_CHANNELS => "OUTPUT_CHANNELS",
            Self::SQUELCH_OPEN => "SQUELCH_OPEN",
            Self::SQUELCH_CLOSE => "SQUELCH_CLOSE",
            Self::NONCOHERENT_BIN_BW => "NONCOHERENT_BIN_BW",
            Self::BIN_COUNT => "BIN_COUNT",
            Self::BIN_DATA => "BIN_DATA",
            Self::STATUS_INTERVAL => "STATUS_INTERVAL",
            Self::OUTPUT_ENCODING => "OUTPUT_ENCODING",
            Self::OPUS_BIT_RATE => "OPUS_BIT_RATE",
            Self::SETOPTS => "SETOPTS",
            Self::CLEAROPTS => "CLEAROPTS",
            Self::MINPACKET => "MINPACKET",
            Self::OUTPUT_DATA_DEST_SOCKET => "OUTPUT_DATA_DEST_SOCKET",
            Self::OUTPUT_DATA_SOURCE_SOCKET => "OUTPUT_DATA_SOURCE_SOCKET",
            Self::OUTPUT_TTL => "OUTPUT_TTL",
            Self::OUTPUT_METADATA_PACKETS => "OUTPUT_METADATA_PACKETS",
            Self::RTP_PT => "RTP_PT",
            Self::OUTPUT_SAMPRATE => "OUTPUT_SAMPRATE",
            Self::OUTPUT_DATA_PACKETS => "OUTPUT_DATA_PACKETS",
            Self::OUTPUT_LEVEL => "OUTPUT_LEVEL",
            Self::BASEBAND_POWER => "BASEBAND_POWER",
            Self::OUTPUT_SAMPLES => "OUTPUT_SAMPLES",
            Self::FILTER_BLOCKSIZE => "FILTER_BLOCKSIZE",
            Self::FILTER_FIR_LENGTH => "FILTER_FIR_LENGTH",
            Self::FILTER_DROPS => "FILTER_DROPS",
            Self::IF_POWER => "IF_POWER",
            Self::AD_OVER => "AD_OVER",
            Self::SAMPLES_SINCE_OVER => "SAMPLES_SINCE_OVER",
            Self::NOISE_DENSITY => "NOISE_DENSITY",
            Self::FREQ_OFFSET => "FREQ_OFFSET",
            Self::PL_TONE => "PL_TONE",
            Self::PL_DEVIATION => "PL_DEVIATION",
            Self::PEAK_DEVIATION => "PEAK_DEVIATION",
            Self::DEEMPH_TC => "DEEMPH_TC",
            Self::DEEMPH_GAIN => "DEEMPH_GAIN",
            Self::FM_SNR => "FM_SNR",
            Self::TP1 => "TP1",
            Self::TP2 => "TP2",
            Self::BLOCKS_SINCE_POLL => "BLOCKS_SINCE_POLL",
            Self::OUTPUT_ERRORS => "OUTPUT_ERRORS",
            _ => return None,
        })
    }
}

impl Debug for Tag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.name() {
            Some(name) => write!(f, "Tag::{name}"),
            None => write!(f, "Tag({})", self.0),
        }
    }
}

fn put_header<B: BufMut>(buffer: &mut B, tag: Tag, len: usize) {
    buffer.put_u8(tag.0);
    if len < 0x80 {
        buffer.put_u8(len as u8);
    }
    else {
        let significant = ((usize::BITS - len.leading_zeros()) as usize).div_ceil(8);
        buffer.put_u8(0x80 | significant as u8);
        for i in (0..significant).rev() {
            buffer.put_u8((len >> (8 * i)) as u8);
        }
    }
}

/// Terminates the option list. EOL carries no length byte.
pub fn encode_eol<B: BufMut>(buffer: &mut B) {
    buffer.put_u8(Tag::EOL.0);
}

/// Minimal-width big-endian integer. A zero value has an empty payload.
pub fn encode_int<B: BufMut>(buffer: &mut B, tag: Tag, value: u64) {
    let significant = ((u64::BITS - value.leading_zeros()) as usize).div_ceil(8);
    put_header(buffer, tag, significant);
    for i in (0..significant).rev() {
        buffer.put_u8((value >> (8 * i)) as u8);
    }
}

pub fn encode_byte<B: BufMut>(buffer: &mut B, tag: Tag, value: u8) {
    encode_int(buffer, tag, value.into());
}

pub fn encode_bool<B: BufMut>(buffer: &mut B, tag: Tag, value: bool) {
    encode_int(buffer, tag, value.into());
}

pub fn encode_float<B: BufMut>(buffer: &mut B, tag: Tag, value: f32) {
    put_header(buffer, tag, 4);
    buffer.put_f32(value);
}

pub fn encode_double<B: BufMut>(buffer: &mut B, tag: Tag, value: f64) {
    put_header(buffer, tag, 8);
    buffer.put_f64(value);
}

pub fn encode_string<B: BufMut>(buffer: &mut B, tag: Tag, value: &str) {
    put_header(buffer, tag, value.len());
    buffer.put_slice(value.as_bytes());
}

/// Vector of big-endian floats, used for spectrum bin data.
pub fn encode_vector<B: BufMut>(buffer: &mut B, tag: Tag, values: &[f32]) {
    put_header(buffer, tag, values.len() * 4);
    for value in values {
        buffer.put_f32(*value);
    }
}

/// Family byte (4 or 6), address bytes, port in network order.
pub fn encode_socket<B: BufMut>(buffer: &mut B, tag: Tag, socket: &SocketAddr) {
    match socket {
        SocketAddr::V4(v4) => {
            put_header(buffer, tag, 7);
            buffer.put_u8(4);
            buffer.put_slice(&v4.ip().octets());
            buffer.put_u16(v4.port());
        }
        SocketAddr::V6(v6) => {
            put_header(buffer, tag, 19);
            buffer.put_u8(6);
            buffer.put_slice(&v6.ip().octets());
            buffer.put_u16(v6.port());
        }
    }
}

/// One decoded option, borrowing its value bytes from the datagram.
#[derive(Clone, Copy, Debug)]
pub struct OptionRef<'a> {
    pub tag: Tag,
    pub value: &'a [u8],
}

/// Iterator over the options of a CMD/STATUS payload (the bytes after
/// the packet-kind byte).
///
/// Scanning stops at EOL, at the end of the buffer, or at any length
/// that would overrun the datagram; options parsed up to that point
/// still take effect.
#[derive(Clone, Debug)]
pub struct Options<'a> {
    buffer: &'a [u8],
}

impl<'a> Options<'a> {
    pub fn new(buffer: &'a [u8]) -> Self {
        Self { buffer }
    }
}

impl<'a> Iterator for Options<'a> {
    type Item = OptionRef<'a>;

    fn next(&mut self) -> Option<OptionRef<'a>> {
        let (&tag, rest) = self.buffer.split_first()?;
        let tag = Tag(tag);
        if tag == Tag::EOL {
            self.buffer = &[];
            return None;
        }

        let (&len_byte, mut rest) = rest.split_first()?;
        let len = if len_byte & 0x80 == 0 {
            len_byte as usize
        }
        else {
            let length_of_length = (len_byte & 0x7f) as usize;
            if rest.len() < length_of_length {
                self.buffer = &[];
                return None;
            }
            let mut len = 0usize;
            for _ in 0..length_of_length {
                let (&byte, tail) = rest.split_first()?;
                len = (len << 8) | byte as usize;
                rest = tail;
            }
            len
        };

        if len > rest.len() {
            // truncated option; stop scanning
            self.buffer = &[];
            return None;
        }

        let (value, tail) = rest.split_at(len);
        self.buffer = tail;
        Some(OptionRef { tag, value })
    }
}

/// Fold big-endian bytes of any width into an integer.
pub fn decode_u64(value: &[u8]) -> u64 {
    let mut x = 0u64;
    for &byte in value {
        x = (x << 8) | byte as u64;
    }
    x
}

pub fn decode_i64(value: &[u8]) -> i64 {
    decode_u64(value) as i64
}

pub fn decode_u32(value: &[u8]) -> u32 {
    decode_u64(value) as u32
}

pub fn decode_bool(value: &[u8]) -> bool {
    decode_u64(value) != 0
}

pub fn decode_float(value: &[u8]) -> f32 {
    match value.len() {
        4 => f32::from_bits(decode_u32(value)),
        8 => f64::from_bits(decode_u64(value)) as f32,
        _ => decode_u64(value) as f32,
    }
}

pub fn decode_double(value: &[u8]) -> f64 {
    match value.len() {
        8 => f64::from_bits(decode_u64(value)),
        4 => f32::from_bits(decode_u32(value)) as f64,
        _ => decode_u64(value) as f64,
    }
}

pub fn decode_string(value: &[u8]) -> String {
    String::from_utf8_lossy(value).into_owned()
}

pub fn decode_socket(value: &[u8]) -> Option<SocketAddr> {
    match value.len() {
        7 if value[0] == 4 => {
            let octets: [u8; 4] = value[1..5].try_into().ok()?;
            let port = u16::from_be_bytes([value[5], value[6]]);
            Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), port))
        }
        19 if value[0] == 6 => {
            let octets: [u8; 16] = value[1..17].try_into().ok()?;
            let port = u16::from_be_bytes([value[17], value[18]]);
            Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        _ => None,
    }
}

/// First `OUTPUT_SSRC` option of a command payload, used for routing.
pub fn find_ssrc(payload: &[u8]) -> Option<u32> {
    Options::new(payload)
        .find(|option| option.tag == Tag::OUTPUT_SSRC)
        .map(|option| decode_u32(option.value))
}
