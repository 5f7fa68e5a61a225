//! Error types for chain-audio.
//!
//! Errors are split into two categories:
//! - **Lifecycle errors** ([`EngineError`]): prevent a chainsetup from being
//!   configured or enabled, and unwind the `enable` transition.
//! - **Data-path failures**: absorbed at runtime by marking the offending
//!   audio object `finished` and logging; the engine keeps ticking. Missed
//!   ring boundaries are counted in [`EngineStats`](crate::EngineStats),
//!   never raised as errors.

use std::path::PathBuf;

/// Errors surfaced from chainsetup configuration and lifecycle transitions.
///
/// These are returned from option interpretation, `enable()`, and the proxy
/// server control surface. Anything that happens on the data path after a
/// successful `enable()` is handled via `finished` flags and xrun counters
/// instead.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// An audio object failed to open.
    #[error("cannot open audio object '{label}': {source}")]
    ObjectOpen {
        /// Label of the object that failed.
        label: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// An audio object was opened but its format cannot be handled.
    #[error("unsupported format in '{label}': {detail}")]
    UnsupportedFormat {
        /// Label of the offending object.
        label: String,
        /// What exactly was not supported.
        detail: String,
    },

    /// An object reported a sample rate different from the chainsetup rate.
    ///
    /// All objects in one chainsetup must share a common rate; the error
    /// names both rates so the mismatch can be located.
    #[error("sample rate of '{label}' ({object_rate} Hz) differs from engine rate ({engine_rate} Hz)")]
    SampleRateMismatch {
        /// Label of the mismatched object.
        label: String,
        /// Rate the object reported after open.
        object_rate: u32,
        /// Rate established by the first opened input.
        engine_rate: u32,
    },

    /// Changing the format of an object whose format is locked.
    #[error("format of '{label}' is locked and cannot be changed while open")]
    FormatLocked {
        /// Label of the object.
        label: String,
    },

    /// An option token could not be interpreted.
    #[error("invalid option '{option}': {reason}")]
    InvalidOption {
        /// The offending option token.
        option: String,
        /// Why interpretation failed.
        reason: String,
    },

    /// No factory is registered for an object specification.
    #[error("unknown audio object type: '{spec}'")]
    UnknownObjectType {
        /// The object specification string (name or filename).
        spec: String,
    },

    /// Enabling a chainsetup with no inputs.
    #[error("no inputs in the chainsetup - add at least one input")]
    NoInputs,

    /// Enabling a chainsetup with no outputs.
    #[error("no outputs in the chainsetup - add at least one output")]
    NoOutputs,

    /// Enabling a chainsetup with no chains.
    #[error("no chains in the chainsetup")]
    NoChains,

    /// A chain is missing its input or output connection.
    #[error("chain '{chain}' is not fully connected")]
    ChainNotConnected {
        /// Name of the incomplete chain.
        chain: String,
    },

    /// Attaching a controller with no operator parameter selected.
    #[error("no controller target: select an operator and parameter first")]
    NoControllerTarget,

    /// A precondition on the lifecycle state machine was violated.
    ///
    /// Mutating topology requires a disabled chainsetup; reconfiguring
    /// operators requires an unlocked one. In debug builds this also trips
    /// a `debug_assert`.
    #[error("'{operation}' requires {requirement}")]
    InvalidState {
        /// The operation that was attempted.
        operation: &'static str,
        /// The state requirement that did not hold.
        requirement: &'static str,
    },

    /// The proxy server worker thread could not be spawned.
    #[error("failed to spawn proxy server thread: {source}")]
    ProxyThread {
        /// The underlying spawn error.
        #[source]
        source: std::io::Error,
    },

    /// A chainsetup file could not be read or written.
    #[error("chainsetup file {path}: {source}")]
    SetupFile {
        /// Path to the chainsetup file.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

impl EngineError {
    /// Creates an [`EngineError::InvalidOption`] with the given token and reason.
    pub fn invalid_option(option: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidOption {
            option: option.into(),
            reason: reason.into(),
        }
    }

    /// Creates an [`EngineError::ObjectOpen`] for the given label.
    pub fn object_open(label: impl Into<String>, source: std::io::Error) -> Self {
        Self::ObjectOpen {
            label: label.into(),
            source,
        }
    }
}
