//! Environment: explicit defaults passed at chainsetup construction.

use crate::format::AudioFormat;

/// Defaults and host-capability facts a chainsetup is constructed with.
///
/// There is no global resource state in this crate; everything a chainsetup
/// would otherwise read from the surrounding system travels in one of
/// these. Tests construct the environment they need (in particular the
/// `rt_capable` flag, which steers buffering-mode selection).
#[derive(Debug, Clone)]
pub struct Environment {
    /// Format applied to objects that do not negotiate their own
    /// (default `s16_le,2,44100,i`).
    pub default_audio_format: AudioFormat,
    /// Output specification added when a setup declares inputs only.
    pub default_output: String,
    /// Whether the process can obtain realtime scheduling privileges.
    pub rt_capable: bool,
}

impl Default for Environment {
    fn default() -> Self {
        Self {
            default_audio_format: AudioFormat::default(),
            default_output: "null".to_string(),
            rt_capable: false,
        }
    }
}

impl Environment {
    /// Builds an environment with the realtime capability probed from the
    /// host.
    pub fn detect() -> Self {
        Self {
            rt_capable: probe_rt_capability(),
            ..Self::default()
        }
    }

    /// Overrides the realtime-capability flag.
    pub fn with_rt_capability(mut self, rt_capable: bool) -> Self {
        self.rt_capable = rt_capable;
        self
    }
}

/// Whether the process may raise its scheduling class. Conservative: only
/// euid 0 is assumed capable, matching the common unprivileged case where
/// the engine silently falls back to non-raised priority.
#[cfg(unix)]
fn probe_rt_capability() -> bool {
    unsafe { libc::geteuid() == 0 }
}

#[cfg(not(unix))]
fn probe_rt_capability() -> bool {
    false
}
