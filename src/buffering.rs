//! Buffering modes and the automatic mode selector.
//!
//! A chainsetup runs in one of three buffering modes; unless the user picks
//! one explicitly, the mode is derived from the declared topology when the
//! chainsetup is enabled. Each mode carries a parameter tuple that can be
//! shadowed field-by-field by user overrides.

use crate::error::EngineError;

/// The three concrete buffering modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferingMode {
    /// Batch processing: large periods, double buffering.
    NonRt,
    /// Realtime-safe defaults for mixed or privileged-less setups.
    Rt,
    /// Small periods for interactive monitoring latency.
    RtLowLatency,
}

impl BufferingMode {
    /// The mode name used in options (`-B:<name>`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NonRt => "nonrt",
            Self::Rt => "rt",
            Self::RtLowLatency => "rtlowlatency",
        }
    }
}

/// The parameter tuple attached to a buffering mode.
///
/// Textual form (all six fields, in order):
/// `"<buffersize>,<raised:bool>,<sched_prio>,<double_buffering:bool>,<db_size>,<max_buffers:bool>"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferingParams {
    /// Period length in frames.
    pub buffersize: usize,
    /// Whether to raise scheduling priority and lock memory.
    pub raised_priority: bool,
    /// Scheduling priority to request when raised.
    pub sched_priority: i32,
    /// Whether non-realtime objects run behind the proxy server.
    pub double_buffering: bool,
    /// Total double-buffer size in frames (ring depth × buffersize).
    pub double_buffer_size: usize,
    /// Whether devices may use maximum-length internal buffers.
    pub max_buffers: bool,
}

impl BufferingParams {
    /// Defaults for the `nonrt` mode: `1024,true,50,true,100000,true`.
    pub fn nonrt_defaults() -> Self {
        Self {
            buffersize: 1024,
            raised_priority: true,
            sched_priority: 50,
            double_buffering: true,
            double_buffer_size: 100_000,
            max_buffers: true,
        }
    }

    /// Defaults for the `rt` mode: `1024,true,50,true,100000,true`.
    pub fn rt_defaults() -> Self {
        Self::nonrt_defaults()
    }

    /// Defaults for the `rtlowlatency` mode: `256,true,50,true,100000,false`.
    pub fn rtlowlatency_defaults() -> Self {
        Self {
            buffersize: 256,
            max_buffers: false,
            ..Self::nonrt_defaults()
        }
    }

    /// Defaults for a mode.
    pub fn defaults_for(mode: BufferingMode) -> Self {
        match mode {
            BufferingMode::NonRt => Self::nonrt_defaults(),
            BufferingMode::Rt => Self::rt_defaults(),
            BufferingMode::RtLowLatency => Self::rtlowlatency_defaults(),
        }
    }

    /// Parses the six-field tuple string.
    pub fn parse(s: &str) -> Result<Self, EngineError> {
        let fields: Vec<&str> = s.split(',').collect();
        if fields.len() != 6 {
            return Err(EngineError::invalid_option(
                s,
                "expected 6 comma-separated buffering parameters",
            ));
        }
        let parse_bool = |field: &str| match field {
            "true" => Ok(true),
            "false" => Ok(false),
            _ => Err(EngineError::invalid_option(
                s,
                "boolean fields must be 'true' or 'false'",
            )),
        };
        Ok(Self {
            buffersize: fields[0]
                .parse()
                .map_err(|_| EngineError::invalid_option(s, "buffersize is not a number"))?,
            raised_priority: parse_bool(fields[1])?,
            sched_priority: fields[2]
                .parse()
                .map_err(|_| EngineError::invalid_option(s, "sched priority is not a number"))?,
            double_buffering: parse_bool(fields[3])?,
            double_buffer_size: fields[4]
                .parse()
                .map_err(|_| EngineError::invalid_option(s, "db size is not a number"))?,
            max_buffers: parse_bool(fields[5])?,
        })
    }

    /// Renders the six-field tuple string.
    pub fn to_spec_string(&self) -> String {
        format!(
            "{},{},{},{},{},{}",
            self.buffersize,
            self.raised_priority,
            self.sched_priority,
            self.double_buffering,
            self.double_buffer_size,
            self.max_buffers
        )
    }
}

/// Per-field user overrides; a set field shadows the selected mode's value.
#[derive(Debug, Clone, Copy, Default)]
pub struct BufferingOverrides {
    /// Overridden period length.
    pub buffersize: Option<usize>,
    /// Overridden priority raising.
    pub raised_priority: Option<bool>,
    /// Overridden scheduling priority.
    pub sched_priority: Option<i32>,
    /// Overridden double buffering.
    pub double_buffering: Option<bool>,
    /// Overridden double-buffer size.
    pub double_buffer_size: Option<usize>,
    /// Overridden device buffering.
    pub max_buffers: Option<bool>,
}

impl BufferingOverrides {
    /// Applies set fields on top of `base`.
    pub fn apply(&self, base: BufferingParams) -> BufferingParams {
        BufferingParams {
            buffersize: self.buffersize.unwrap_or(base.buffersize),
            raised_priority: self.raised_priority.unwrap_or(base.raised_priority),
            sched_priority: self.sched_priority.unwrap_or(base.sched_priority),
            double_buffering: self.double_buffering.unwrap_or(base.double_buffering),
            double_buffer_size: self.double_buffer_size.unwrap_or(base.double_buffer_size),
            max_buffers: self.max_buffers.unwrap_or(base.max_buffers),
        }
    }
}

/// Topology counts feeding the automatic mode selector.
#[derive(Debug, Clone, Copy)]
pub struct Topology {
    /// Realtime inputs.
    pub realtime_inputs: usize,
    /// Realtime outputs.
    pub realtime_outputs: usize,
    /// Non-realtime inputs.
    pub nonrt_inputs: usize,
    /// Non-realtime outputs.
    pub nonrt_outputs: usize,
    /// Total chain operators across all chains.
    pub chain_operators: usize,
    /// Number of chains.
    pub chains: usize,
    /// Whether the process can obtain realtime scheduling.
    pub rt_capable: bool,
    /// Multitrack mode forced on/off by the user, or derived when `None`.
    pub multitrack_override: Option<bool>,
}

/// Outcome of automatic mode selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeDecision {
    /// The selected buffering mode.
    pub mode: BufferingMode,
    /// Whether multitrack mode is active.
    pub multitrack: bool,
    /// Whether raised priority must be dropped (no rt privileges).
    pub drop_priority: bool,
}

/// Selects the active buffering mode for a topology.
///
/// Decision order:
/// 1. multitrack = override, or: rt inputs and outputs *and* non-rt inputs
///    and outputs present, with more than one chain;
/// 2. no realtime objects at all → `nonrt`;
/// 3. multitrack → `rt`;
/// 4. no realtime-scheduling privileges → `rt`, priority dropped;
/// 5. no operators and one-way realtime operation → `rt`;
/// 6. otherwise → `rtlowlatency`.
pub fn select_mode(topology: &Topology) -> ModeDecision {
    let t = topology;
    let multitrack = t.multitrack_override.unwrap_or(
        t.realtime_inputs > 0
            && t.realtime_outputs > 0
            && t.nonrt_inputs > 0
            && t.nonrt_outputs > 0
            && t.chains > 1,
    );
    let has_realtime = t.realtime_inputs > 0 || t.realtime_outputs > 0;

    let (mode, drop_priority) = if !has_realtime {
        (BufferingMode::NonRt, false)
    } else if multitrack {
        (BufferingMode::Rt, false)
    } else if !t.rt_capable {
        (BufferingMode::Rt, true)
    } else if t.chain_operators == 0 && (t.realtime_inputs == 0 || t.realtime_outputs == 0) {
        (BufferingMode::Rt, false)
    } else {
        (BufferingMode::RtLowLatency, false)
    };

    tracing::debug!(?mode, multitrack, drop_priority, "buffering mode selected");
    ModeDecision {
        mode,
        multitrack,
        drop_priority,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topology() -> Topology {
        Topology {
            realtime_inputs: 0,
            realtime_outputs: 0,
            nonrt_inputs: 0,
            nonrt_outputs: 0,
            chain_operators: 0,
            chains: 1,
            rt_capable: true,
            multitrack_override: None,
        }
    }

    #[test]
    fn test_tuple_parse_and_render() {
        let params = BufferingParams::parse("1024,true,50,true,100000,true").unwrap();
        assert_eq!(params, BufferingParams::nonrt_defaults());
        assert_eq!(params.to_spec_string(), "1024,true,50,true,100000,true");

        let low = BufferingParams::parse("256,true,50,true,100000,false").unwrap();
        assert_eq!(low, BufferingParams::rtlowlatency_defaults());
    }

    #[test]
    fn test_tuple_parse_rejects_malformed() {
        assert!(BufferingParams::parse("1024,true,50,true,100000").is_err());
        assert!(BufferingParams::parse("1024,yes,50,true,100000,true").is_err());
        assert!(BufferingParams::parse("big,true,50,true,100000,true").is_err());
    }

    #[test]
    fn test_overrides_shadow_fields() {
        let overrides = BufferingOverrides {
            buffersize: Some(512),
            raised_priority: Some(false),
            ..Default::default()
        };
        let params = overrides.apply(BufferingParams::nonrt_defaults());
        assert_eq!(params.buffersize, 512);
        assert!(!params.raised_priority);
        assert_eq!(params.double_buffer_size, 100_000);
    }

    // Decision-table vectors, one per documented case.

    #[test]
    fn test_case_no_realtime_objects_is_nonrt() {
        let t = Topology {
            nonrt_inputs: 2,
            nonrt_outputs: 1,
            chain_operators: 3,
            ..topology()
        };
        let d = select_mode(&t);
        assert_eq!(d.mode, BufferingMode::NonRt);
        assert!(!d.multitrack);
    }

    #[test]
    fn test_case_multitrack_topology_is_rt() {
        let t = Topology {
            realtime_inputs: 1,
            realtime_outputs: 1,
            nonrt_inputs: 1,
            nonrt_outputs: 1,
            chains: 2,
            ..topology()
        };
        let d = select_mode(&t);
        assert_eq!(d.mode, BufferingMode::Rt);
        assert!(d.multitrack);
        assert!(!d.drop_priority);
    }

    #[test]
    fn test_case_multitrack_needs_more_than_one_chain() {
        let t = Topology {
            realtime_inputs: 1,
            realtime_outputs: 1,
            nonrt_inputs: 1,
            nonrt_outputs: 1,
            chains: 1,
            chain_operators: 1,
            ..topology()
        };
        let d = select_mode(&t);
        assert!(!d.multitrack);
        assert_eq!(d.mode, BufferingMode::RtLowLatency);
    }

    #[test]
    fn test_case_no_rt_privileges_drops_priority() {
        let t = Topology {
            realtime_inputs: 1,
            realtime_outputs: 1,
            chain_operators: 2,
            rt_capable: false,
            ..topology()
        };
        let d = select_mode(&t);
        assert_eq!(d.mode, BufferingMode::Rt);
        assert!(d.drop_priority);
    }

    #[test]
    fn test_case_one_way_rt_without_operators_is_rt() {
        let t = Topology {
            realtime_inputs: 1,
            nonrt_outputs: 1,
            chain_operators: 0,
            ..topology()
        };
        let d = select_mode(&t);
        assert_eq!(d.mode, BufferingMode::Rt);
        assert!(!d.drop_priority);
    }

    #[test]
    fn test_case_default_rt_setup_is_rtlowlatency() {
        let t = Topology {
            realtime_inputs: 1,
            realtime_outputs: 1,
            chain_operators: 2,
            ..topology()
        };
        let d = select_mode(&t);
        assert_eq!(d.mode, BufferingMode::RtLowLatency);
    }

    #[test]
    fn test_multitrack_override_forces_both_ways() {
        let on = Topology {
            realtime_inputs: 1,
            realtime_outputs: 1,
            chain_operators: 1,
            multitrack_override: Some(true),
            ..topology()
        };
        assert!(select_mode(&on).multitrack);
        assert_eq!(select_mode(&on).mode, BufferingMode::Rt);

        let off = Topology {
            realtime_inputs: 1,
            realtime_outputs: 1,
            nonrt_inputs: 1,
            nonrt_outputs: 1,
            chains: 2,
            chain_operators: 1,
            multitrack_override: Some(false),
            ..topology()
        };
        assert!(!select_mode(&off).multitrack);
        assert_eq!(select_mode(&off).mode, BufferingMode::RtLowLatency);
    }
}
