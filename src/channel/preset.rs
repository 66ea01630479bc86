//! Named parameter bundles.
//!
//! A preset writes a consistent set of demod/filter/samprate/shift
//! fields into a channel in one step. The table is read-only; it is
//! handed to the daemon at construction.

use std::collections::HashMap;

use crate::channel::{
    Channel,
    DemodType,
};

/// Fields a preset may supply. Absent fields leave the channel value
/// alone.
#[derive(Clone, Debug, Default)]
pub struct Preset {
    pub demod_type: Option<DemodType>,
    pub samprate: Option<u32>,
    pub low_edge: Option<f32>,
    pub high_edge: Option<f32>,
    pub kaiser_beta: Option<f32>,
    pub shift: Option<f64>,
    pub agc: Option<bool>,
    pub envelope: Option<bool>,
    pub pll: Option<bool>,
    pub channels: Option<u8>,
}

impl Preset {
    /// Write this preset into a channel. Tuning side effects (shift
    /// retune, filter/demod change detection) are the caller's job.
    pub fn apply(&self, chan: &mut Channel) {
        if let Some(demod_type) = self.demod_type {
            chan.demod_type = demod_type;
        }
        if let Some(samprate) = self.samprate {
            chan.output.samprate = samprate;
        }
        if let Some(low_edge) = self.low_edge {
            chan.filter.min_if = low_edge;
        }
        if let Some(high_edge) = self.high_edge {
            chan.filter.max_if = high_edge;
        }
        if let Some(kaiser_beta) = self.kaiser_beta {
            chan.filter.kaiser_beta = kaiser_beta;
        }
        if let Some(shift) = self.shift {
            chan.tune.shift = shift;
        }
        if let Some(agc) = self.agc {
            chan.linear.agc = agc;
        }
        if let Some(envelope) = self.envelope {
            chan.linear.env = envelope;
        }
        if let Some(pll) = self.pll {
            chan.pll.enable = pll;
        }
        if let Some(channels) = self.channels {
            chan.output.channels = channels;
        }
        chan.refresh_rtp_type();
    }
}

/// Read-only table keyed by preset name.
#[derive(Clone, Debug, Default)]
pub struct PresetTable {
    presets: HashMap<String, Preset>,
}

impl PresetTable {
    pub fn new(presets: HashMap<String, Preset>) -> Self {
        Self { presets }
    }

    pub fn get(&self, name: &str) -> Option<&Preset> {
        self.presets.get(name)
    }

    /// The stock demodulation presets.
    pub fn builtin() -> Self {
        let mut presets = HashMap::new();
        presets.insert(
            "usb".into(),
            Preset {
                demod_type: Some(DemodType::Linear),
                samprate: Some(12_000),
                low_edge: Some(300.0),
                high_edge: Some(2700.0),
                kaiser_beta: Some(11.0),
                shift: Some(0.0),
                agc: Some(true),
                envelope: Some(false),
                pll: Some(false),
                channels: Some(1),
            },
        );
        presets.insert(
            "lsb".into(),
            Preset {
                demod_type: Some(DemodType::Linear),
                samprate: Some(12_000),
                low_edge: Some(-2700.0),
                high_edge: Some(-300.0),
                kaiser_beta: Some(11.0),
                shift: Some(0.0),
                agc: Some(true),
                envelope: Some(false),
                pll: Some(false),
                channels: Some(1),
            },
        );
        presets.insert(
            "cwu".into(),
            Preset {
                demod_type: Some(DemodType::Linear),
                samprate: Some(12_000),
                low_edge: Some(-200.0),
                high_edge: Some(200.0),
                kaiser_beta: Some(11.0),
                shift: Some(500.0),
                agc: Some(true),
                envelope: Some(false),
                pll: Some(false),
                channels: Some(1),
            },
        );
        presets.insert(
            "am".into(),
            Preset {
                demod_type: Some(DemodType::Linear),
                samprate: Some(12_000),
                low_edge: Some(-5000.0),
                high_edge: Some(5000.0),
                kaiser_beta: Some(11.0),
                shift: Some(0.0),
                agc: Some(true),
                envelope: Some(true),
                pll: Some(false),
                channels: Some(1),
            },
        );
        presets.insert(
            "fm".into(),
            Preset {
                demod_type: Some(DemodType::Fm),
                samprate: Some(24_000),
                low_edge: Some(-8000.0),
                high_edge: Some(8000.0),
                kaiser_beta: Some(11.0),
                shift: Some(0.0),
                channels: Some(1),
                ..Preset::default()
            },
        );
        presets.insert(
            "wfm".into(),
            Preset {
                demod_type: Some(DemodType::Wfm),
                samprate: Some(48_000),
                low_edge: Some(-100_000.0),
                high_edge: Some(100_000.0),
                kaiser_beta: Some(11.0),
                shift: Some(0.0),
                channels: Some(2),
                ..Preset::default()
            },
        );
        presets.insert(
            "iq".into(),
            Preset {
                demod_type: Some(DemodType::Linear),
                samprate: Some(12_000),
                low_edge: Some(-6000.0),
                high_edge: Some(6000.0),
                kaiser_beta: Some(11.0),
                shift: Some(0.0),
                agc: Some(false),
                envelope: Some(false),
                pll: Some(false),
                channels: Some(2),
            },
        );
        Self { presets }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usb_supplies_a_consistent_bundle() {
        let table = PresetTable::builtin();
        let preset = table.get("usb").unwrap();

        let mut chan = Channel::template(1, 50);
        chan.tune.shift = 500.0;
        preset.apply(&mut chan);

        assert_eq!(chan.demod_type, DemodType::Linear);
        assert_eq!(chan.output.samprate, 12_000);
        assert_eq!(chan.filter.min_if, 300.0);
        assert_eq!(chan.filter.max_if, 2700.0);
        assert_eq!(chan.tune.shift, 0.0);
        assert!(chan.linear.agc);
    }

    #[test]
    fn absent_fields_leave_the_channel_alone() {
        let preset = Preset {
            low_edge: Some(-1000.0),
            ..Preset::default()
        };
        let mut chan = Channel::template(1, 50);
        let high_before = chan.filter.max_if;
        preset.apply(&mut chan);
        assert_eq!(chan.filter.min_if, -1000.0);
        assert_eq!(chan.filter.max_if, high_before);
    }

    #[test]
    fn unknown_preset_is_absent() {
        assert!(PresetTable::builtin().get("nbfm9000").is_none());
    }
}
