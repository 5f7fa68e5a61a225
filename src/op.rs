//! Chain operators and controllers.
//!
//! An [`Operator`] transforms one period of audio in place; a
//! [`Controller`] produces one scalar per period that is mapped onto a
//! single operator parameter. Both run on the engine thread under real-time
//! constraints: no allocation, no blocking, bounded per-sample cost for a
//! given (channels, rate, buffersize) binding.

use crate::error::EngineError;
use crate::SampleBuffer;

/// A stateful per-period audio transform.
pub trait Operator: Send {
    /// Human-readable name for logs and chainsetup listings.
    fn name(&self) -> &str;

    /// Option prefix this operator serializes under (e.g. `ea`).
    fn prefix(&self) -> &'static str;

    /// Names of the parameters, in index order.
    fn parameter_names(&self) -> &'static [&'static str];

    /// Sets parameter `index` (0-based).
    fn set_parameter(&mut self, index: usize, value: f32);

    /// Reads parameter `index` (0-based).
    fn parameter(&self, index: usize) -> f32;

    /// Binds the operator to a concrete stream format. Called from
    /// `Chain::init`; may allocate internal state.
    fn init(&mut self, channels: usize, sample_rate: u32, buffersize: usize);

    /// Transforms one period in place.
    fn process(&mut self, buf: &mut SampleBuffer);
}

/// A per-period scalar generator in the range [0, 1].
pub trait Controller: Send {
    /// Human-readable name.
    fn name(&self) -> &str;

    /// Option prefix this controller serializes under (e.g. `kos`).
    fn prefix(&self) -> &'static str;

    /// Binds the controller to the stream clock.
    fn init(&mut self, sample_rate: u32, buffersize: usize);

    /// Samples the controller at the given stream position.
    fn value(&mut self, position_frames: u64) -> f32;

    /// Constructor arguments after the target/range fields, for saving.
    fn argument_string(&self) -> String;
}

/// Attachment of one controller to one operator parameter.
///
/// The controller's [0, 1] output is mapped linearly onto `[low, high]`
/// before being written to the target parameter. Targets are held by index
/// (never ownership); operators stay owned by the chain's operator list.
pub struct ControllerBinding {
    /// The controller itself.
    pub controller: Box<dyn Controller>,
    /// Index of the target operator in the chain.
    pub op_index: usize,
    /// Index of the target parameter on that operator.
    pub param_index: usize,
    /// Parameter value when the controller outputs 0.
    pub low: f32,
    /// Parameter value when the controller outputs 1.
    pub high: f32,
}

impl ControllerBinding {
    /// Maps the controller output at `position` onto the target range.
    pub fn mapped_value(&mut self, position_frames: u64) -> f32 {
        let raw = self.controller.value(position_frames).clamp(0.0, 1.0);
        self.low + (self.high - self.low) * raw
    }
}

/// Gain operator: scales every sample by a percentage.
///
/// 100% is unity; 0% silences the chain.
pub struct Gain {
    gain_percent: f32,
}

impl Gain {
    /// Creates a gain operator at the given percentage.
    pub fn new(gain_percent: f32) -> Self {
        Self { gain_percent }
    }
}

impl Operator for Gain {
    fn name(&self) -> &str {
        "Gain"
    }

    fn prefix(&self) -> &'static str {
        "ea"
    }

    fn parameter_names(&self) -> &'static [&'static str] {
        &["gain-%"]
    }

    fn set_parameter(&mut self, index: usize, value: f32) {
        if index == 0 {
            self.gain_percent = value;
        }
    }

    fn parameter(&self, index: usize) -> f32 {
        match index {
            0 => self.gain_percent,
            _ => 0.0,
        }
    }

    fn init(&mut self, _channels: usize, _sample_rate: u32, _buffersize: usize) {}

    fn process(&mut self, buf: &mut SampleBuffer) {
        let scale = self.gain_percent / 100.0;
        for channel in buf.iter_channels_mut() {
            for sample in channel {
                *sample *= scale;
            }
        }
    }
}

/// DC-offset adjustment: adds a fixed delta per channel.
pub struct DcFix {
    deltas: [f32; 2],
}

impl DcFix {
    /// Creates a DC-fix with left/right deltas.
    pub fn new(delta_left: f32, delta_right: f32) -> Self {
        Self {
            deltas: [delta_left, delta_right],
        }
    }
}

impl Operator for DcFix {
    fn name(&self) -> &str {
        "DC-Fix"
    }

    fn prefix(&self) -> &'static str {
        "eDC"
    }

    fn parameter_names(&self) -> &'static [&'static str] {
        &["delta-value-left", "delta-value-right"]
    }

    fn set_parameter(&mut self, index: usize, value: f32) {
        if index < 2 {
            self.deltas[index] = value;
        }
    }

    fn parameter(&self, index: usize) -> f32 {
        if index < 2 {
            self.deltas[index]
        } else {
            0.0
        }
    }

    fn init(&mut self, _channels: usize, _sample_rate: u32, _buffersize: usize) {}

    fn process(&mut self, buf: &mut SampleBuffer) {
        for (ch, channel) in buf.iter_channels_mut().enumerate() {
            let delta = self.deltas[ch.min(1)];
            for sample in channel {
                *sample += delta;
            }
        }
    }
}

/// Sine oscillator controller.
///
/// Output is `0.5 + 0.5 * sin(2π(f·t + φ))`, sampled once per period at the
/// period's start position.
pub struct SineOscillator {
    frequency: f32,
    phase: f32,
    sample_rate: u32,
}

impl SineOscillator {
    /// Creates an oscillator with frequency in Hz and phase in cycles.
    pub fn new(frequency: f32, phase: f32) -> Self {
        Self {
            frequency,
            phase,
            sample_rate: 0,
        }
    }
}

impl Controller for SineOscillator {
    fn name(&self) -> &str {
        "Sine oscillator"
    }

    fn prefix(&self) -> &'static str {
        "kos"
    }

    fn init(&mut self, sample_rate: u32, _buffersize: usize) {
        self.sample_rate = sample_rate;
    }

    fn value(&mut self, position_frames: u64) -> f32 {
        if self.sample_rate == 0 {
            return 0.5;
        }
        let t = position_frames as f64 / f64::from(self.sample_rate);
        let angle =
            2.0 * std::f64::consts::PI * (f64::from(self.frequency) * t + f64::from(self.phase));
        (0.5 + 0.5 * angle.sin()) as f32
    }

    fn argument_string(&self) -> String {
        format!("{},{}", self.frequency, self.phase)
    }
}

/// Creates an operator from an option prefix and its numeric arguments.
///
/// This is the constructor-registry entry point used by option
/// interpretation; chain editing APIs accept boxed operators directly.
pub fn create_operator(prefix: &str, args: &[f32]) -> Result<Box<dyn Operator>, EngineError> {
    match prefix {
        "ea" => Ok(Box::new(Gain::new(*args.first().unwrap_or(&100.0)))),
        "eDC" => Ok(Box::new(DcFix::new(
            *args.first().unwrap_or(&0.0),
            *args.get(1).unwrap_or(&0.0),
        ))),
        other => Err(EngineError::invalid_option(
            format!("-{other}"),
            "unknown operator prefix",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gain_scales_samples() {
        let mut buf = SampleBuffer::new(2, 16, 44100);
        buf.channel_mut(0).fill(0.5);
        buf.channel_mut(1).fill(-0.5);

        let mut gain = Gain::new(50.0);
        gain.init(2, 44100, 16);
        gain.process(&mut buf);
        assert!(buf.channel(0).iter().all(|&s| (s - 0.25).abs() < 1e-6));
        assert!(buf.channel(1).iter().all(|&s| (s + 0.25).abs() < 1e-6));
    }

    #[test]
    fn test_gain_parameter_access() {
        let mut gain = Gain::new(100.0);
        assert_eq!(gain.parameter_names(), &["gain-%"]);
        gain.set_parameter(0, 25.0);
        assert_eq!(gain.parameter(0), 25.0);
    }

    #[test]
    fn test_dcfix_per_channel_delta() {
        let mut buf = SampleBuffer::new(2, 8, 44100);
        let mut op = DcFix::new(0.1, -0.1);
        op.process(&mut buf);
        assert!(buf.channel(0).iter().all(|&s| (s - 0.1).abs() < 1e-6));
        assert!(buf.channel(1).iter().all(|&s| (s + 0.1).abs() < 1e-6));
    }

    #[test]
    fn test_sine_oscillator_range_and_phase() {
        let mut osc = SineOscillator::new(1.0, 0.0);
        osc.init(44100, 1024);
        // At t = 0 the sine starts at the midpoint.
        assert!((osc.value(0) - 0.5).abs() < 1e-6);
        // Quarter cycle later it peaks.
        assert!((osc.value(44100 / 4) - 1.0).abs() < 1e-3);
        for pos in (0..44100).step_by(1024) {
            let v = osc.value(pos);
            assert!((0.0..=1.0).contains(&v));
        }
    }

    #[test]
    fn test_controller_binding_maps_range() {
        let mut osc = SineOscillator::new(1.0, 0.25); // starts at peak
        osc.init(44100, 1024);
        let mut binding = ControllerBinding {
            controller: Box::new(osc),
            op_index: 0,
            param_index: 0,
            low: 20.0,
            high: 80.0,
        };
        let v = binding.mapped_value(0);
        assert!((v - 80.0).abs() < 1e-3);
    }

    #[test]
    fn test_create_operator_by_prefix() {
        let op = create_operator("ea", &[42.0]).unwrap();
        assert_eq!(op.parameter(0), 42.0);
        assert!(create_operator("zz", &[]).is_err());
    }
}
