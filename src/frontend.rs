//! Shared descriptor of the current input slice.
//!
//! There is one frontend per daemon. The ingest driver is the only
//! writer of the sample counters; the control plane reads snapshots
//! for status emission and reaches capability hooks for gain and
//! attenuation control.

use parking_lot::Mutex;

/// Smoothing constant of the rolling IF power estimate.
pub const IF_POWER_ALPHA: f32 = 0.05;

/// Frontend state proper. Lives behind [`FrontendHandle`].
#[derive(Clone, Debug)]
pub struct Frontend {
    /// A/D sample rate in Hz
    pub samprate: u32,
    /// lower passband edge relative to the center frequency, Hz
    pub min_if: f32,
    /// upper passband edge relative to the center frequency, Hz
    pub max_if: f32,
    /// center (first LO) frequency in Hz, calibration applied
    pub frequency: f64,
    /// fractional frequency correction
    pub calibrate: f64,
    /// when set, tune requests leave the center frequency alone
    pub lock: bool,
    /// false for complex IQ
    pub isreal: bool,
    pub bits_per_sample: u32,
    pub description: String,
    /// input block length in samples, as reported by the source
    pub block_size: u32,
    /// FIR length of the input filter; 0 until the DSP reports one
    pub impulse_length: u32,

    pub rf_gain: f32,
    pub rf_atten: f32,
    pub rf_level_cal: f32,
    pub rf_agc: bool,
    pub lna_gain: i32,
    pub mixer_gain: i32,
    pub if_gain: i32,

    /// count of clipped A/D components, monotonic
    pub overranges: u64,
    /// components since the last clipped one
    pub samples_since_over: u64,
    /// rolling mean squared magnitude per sample
    pub if_power: f32,
    /// complex samples ingested
    pub samples: u64,
}

impl Frontend {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            samprate: 0,
            min_if: 0.0,
            max_if: 0.0,
            frequency: 0.0,
            calibrate: 0.0,
            lock: false,
            isreal: false,
            bits_per_sample: 16,
            description: description.into(),
            block_size: 0,
            impulse_length: 0,
            rf_gain: 0.0,
            rf_atten: 0.0,
            rf_level_cal: 0.0,
            rf_agc: false,
            lna_gain: 0,
            mixer_gain: 0,
            if_gain: 0,
            overranges: 0,
            samples_since_over: 0,
            if_power: 0.0,
            samples: 0,
        }
    }

    /// Scale applied once per sample to bring A/D integers to [-1, 1).
    pub fn scale_ad(&self) -> f32 {
        1.0 / (1i64 << (self.bits_per_sample - 1)) as f32
    }

    /// Scale that relates the raw-integer power estimate to full
    /// scale. Real data reads 3 dB hotter than complex because only
    /// one component carries signal.
    pub fn ad_power_scale(&self) -> f32 {
        let full_scale = (1i64 << (self.bits_per_sample - 1)) as f32;
        let scale = 1.0 / (full_scale * full_scale);
        if self.isreal { 2.0 * scale } else { scale }
    }

    /// Fold one ingested datagram into the counters. Called only from
    /// the ingest thread.
    pub fn record_datagram(
        &mut self,
        sample_count: usize,
        overrange_delta: u64,
        samples_since_over: u64,
        mean_energy: f32,
    ) {
        self.overranges += overrange_delta;
        self.samples_since_over = samples_since_over;
        self.if_power += IF_POWER_ALPHA * (mean_energy - self.if_power);
        self.samples += sample_count as u64;
    }
}

/// Capability hooks installed by the ingest driver. Absent hooks mean
/// the hardware has no such control.
#[derive(Default)]
pub struct Hooks {
    pub atten: Option<Box<dyn Fn(f32) + Send + Sync>>,
    pub gain: Option<Box<dyn Fn(f32) + Send + Sync>>,
    /// Returns the new center frequency on success.
    pub tune: Option<Box<dyn Fn(f64) -> Option<f64> + Send + Sync>>,
}

/// Shared frontend: state under a short-held lock, plus the
/// capability hooks for control-plane reach-through.
pub struct FrontendHandle {
    state: Mutex<Frontend>,
    hooks: Mutex<Hooks>,
}

impl FrontendHandle {
    pub fn new(frontend: Frontend) -> Self {
        Self {
            state: Mutex::new(frontend),
            hooks: Mutex::new(Hooks::default()),
        }
    }

    pub fn install_hooks(&self, hooks: Hooks) {
        *self.hooks.lock() = hooks;
    }

    pub fn snapshot(&self) -> Frontend {
        self.state.lock().clone()
    }

    pub fn with_state<R>(&self, f: impl FnOnce(&mut Frontend) -> R) -> R {
        f(&mut self.state.lock())
    }

    pub fn has_atten(&self) -> bool {
        self.hooks.lock().atten.is_some()
    }

    pub fn has_gain(&self) -> bool {
        self.hooks.lock().gain.is_some()
    }

    pub fn set_atten(&self, db: f32) {
        if let Some(atten) = &self.hooks.lock().atten {
            atten(db);
        }
    }

    pub fn set_gain(&self, db: f32) {
        if let Some(gain) = &self.hooks.lock().gain {
            gain(db);
        }
    }

    /// Route a first-LO change to the hardware. Locked frontends and
    /// frontends without a tune capability keep their frequency.
    pub fn request_tune(&self, frequency: f64) -> f64 {
        {
            let state = self.state.lock();
            if state.lock {
                return state.frequency;
            }
        }
        let tuned = self
            .hooks
            .lock()
            .tune
            .as_ref()
            .and_then(|tune| tune(frequency));
        let mut state = self.state.lock();
        if let Some(frequency) = tuned {
            state.frequency = frequency;
        }
        state.frequency
    }
}

impl std::fmt::Debug for FrontendHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrontendHandle")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scale_matches_bit_depth() {
        let mut frontend = Frontend::new("test");
        frontend.bits_per_sample = 16;
        assert_eq!(frontend.scale_ad(), 1.0 / 32768.0);
    }

    #[test]
    fn real_data_reads_3db_hotter() {
        let mut frontend = Frontend::new("test");
        frontend.bits_per_sample = 16;
        frontend.isreal = false;
        let complex_scale = frontend.ad_power_scale();
        frontend.isreal = true;
        assert_eq!(frontend.ad_power_scale(), 2.0 * complex_scale);
    }

    #[test]
    fn datagram_accounting() {
        let mut frontend = Frontend::new("test");
        frontend.record_datagram(256, 0, 512, 100.0);
        assert_eq!(frontend.samples, 256);
        assert_eq!(frontend.overranges, 0);
        assert_eq!(frontend.samples_since_over, 512);
        assert_eq!(frontend.if_power, IF_POWER_ALPHA * 100.0);

        frontend.record_datagram(2, 2, 1, 50.0);
        assert_eq!(frontend.samples, 258);
        assert_eq!(frontend.overranges, 2);
        assert_eq!(frontend.samples_since_over, 1);
    }

    #[test]
    fn locked_frontend_refuses_tune() {
        let mut frontend = Frontend::new("test");
        frontend.frequency = 7_100_000.0;
        frontend.lock = true;
        let handle = FrontendHandle::new(frontend);
        handle.install_hooks(Hooks {
            tune: Some(Box::new(|_| Some(0.0))),
            ..Hooks::default()
        });
        assert_eq!(handle.request_tune(14_000_000.0), 7_100_000.0);
    }

    #[test]
    fn tune_hook_updates_center_frequency() {
        let handle = FrontendHandle::new(Frontend::new("test"));
        handle.install_hooks(Hooks {
            tune: Some(Box::new(|f| Some(f * 1.5))),
            ..Hooks::default()
        });
        assert_eq!(handle.request_tune(1_000_000.0), 1_500_000.0);
        assert_eq!(handle.snapshot().frequency, 1_500_000.0);
    }
}
