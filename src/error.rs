use std::time::Duration;

use thiserror::Error;

use crate::layout::Signal;

/// Errors surfaced by the low-level adapter link.
///
/// The physical USB driver lives behind the [`AdapterLink`](crate::binding::AdapterLink)
/// trait; this is the error type its operations report.
#[derive(Error, Debug)]
pub enum AdapterError {
    /// The USB transport failed.
    #[error("USB communication error")]
    Usb(#[source] Option<Box<dyn std::error::Error + Send + Sync>>),
    /// The requested clock rate is outside what the adapter supports.
    #[error("the requested clock rate ({0} kHz) is not supported by the adapter")]
    UnsupportedClockRate(u32),
    /// The adapter does not expose the requested channel.
    #[error("the adapter has no channel {0}")]
    InvalidChannel(u8),
    /// Catch-all for driver specific failures.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// The stages a bring-up run moves through, in execution order.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    /// Layout validation. Runs before any hardware write.
    Validate,
    /// Application of the output/direction words and clock rate.
    ApplyLayout,
    /// The hardware reset pulse and settle delay.
    Reset,
    /// Scan chain interrogation.
    Discovery,
    /// Software reset and post-reset clock handling.
    PostReset,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::Validate => "validate",
            Stage::ApplyLayout => "apply-layout",
            Stage::Reset => "reset",
            Stage::Discovery => "discovery",
            Stage::PostReset => "post-reset",
        };
        f.write_str(name)
    }
}

/// All the ways a bring-up run can fail.
///
/// Layout errors are detected before any hardware write. Binding errors are
/// programming errors the caller can correct and retry. Runtime errors carry
/// enough context to decide whether physical inspection is needed. Control
/// errors are always retryable.
#[derive(Error, Debug)]
pub enum BringUpError {
    /// Two bindings in the candidate layout claim the same bit.
    #[error("signals {first} and {second} are both mapped to bit {bit}")]
    PinConflict {
        /// The contested bit index.
        bit: u8,
        /// The signal that claimed the bit first.
        first: Signal,
        /// The signal that claimed it again.
        second: Signal,
    },
    /// An output binding without a drive mode, or an input binding with one.
    #[error("signal {signal} has an inconsistent direction/drive-mode pairing")]
    DirectionMismatch {
        /// The offending signal.
        signal: Signal,
    },
    /// A binding's bit index does not fit the 16 bit channel word.
    #[error("signal {signal} is mapped to bit {bit}, outside the 16 bit channel word")]
    BitOutOfRange {
        /// The offending signal.
        signal: Signal,
        /// The out-of-range bit index.
        bit: u8,
    },
    /// The reset policy requires a signal the layout does not bind.
    #[error("the reset policy requires an output binding for {signal}, but the layout has none")]
    MissingRequiredSignal {
        /// The signal the policy requires.
        signal: Signal,
    },
    /// The signal is not part of the applied layout.
    #[error("signal {0} is not part of the applied layout")]
    UnknownSignal(Signal),
    /// Attempt to drive an input binding.
    #[error("signal {0} is an input and cannot be driven")]
    SignalIsInput(Signal),
    /// Attempt to read back an output binding.
    #[error("signal {0} is an output and cannot be read back")]
    SignalIsOutput(Signal),
    /// The reset sequence could not be driven through the adapter.
    #[error("target reset failed")]
    ResetFailed(#[source] AdapterError),
    /// The scan chain never produced two matching captures.
    #[error("no stable scan chain readback after {attempts} capture attempts")]
    ChainUnstable {
        /// Number of captures taken before giving up.
        attempts: usize,
    },
    /// A tap position with a non-empty expectation set observed something else.
    #[error(
        "tap {position}: expected one of {expected:#010x?}, observed {observed:#010x?}"
    )]
    TapIdMismatch {
        /// Chain position of the offending tap.
        position: usize,
        /// The admissible IDCODE values declared for this position.
        expected: Vec<u32>,
        /// The IDCODE that was read back, if any was readable at all.
        observed: Option<u32>,
    },
    /// Another run is already using this adapter binding.
    #[error("another bring-up run is already using this adapter binding")]
    SessionBusy,
    /// The caller's cancellation token fired between stages.
    #[error("bring-up was cancelled by the caller")]
    Cancelled,
    /// The caller-supplied wall-clock budget was exceeded.
    #[error("bring-up exceeded the caller-supplied budget of {0:?}")]
    BringUpTimedOut(Duration),
    /// Discovery finished but found no core-role tap.
    #[error("discovery completed but no core-role tap was found")]
    NoCoreFound,
    /// A plain adapter failure outside the reset sequence.
    #[error("adapter link error")]
    Adapter(#[from] AdapterError),
}

/// A failed bring-up run, with the last stage that completed successfully.
///
/// The adapter is left in whatever state the last successful write produced;
/// `last_completed` lets the caller decide whether to force a hardware reset
/// before retrying.
#[derive(Error, Debug)]
#[error("bring-up failed (last completed stage: {last_completed:?})")]
pub struct BringUpFailure {
    /// The last stage that ran to completion, or `None` if nothing did.
    pub last_completed: Option<Stage>,
    /// What went wrong.
    #[source]
    pub error: BringUpError,
}
