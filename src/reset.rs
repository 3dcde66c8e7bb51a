//! Reset policy and the strategy state machine that drives it.
//!
//! The hardware phase runs before tap discovery and pulses the `RESET`
//! signal through the adapter binding. The software phase is only reachable
//! once discovery has produced a debug access port: `Hybrid` mode runs the
//! hardware pulse first and re-asserts a software reset afterwards,
//! `SoftwareOnly` skips the pulse entirely.

use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::binding::AdapterBinding;
use crate::discovery::ChainAccess;
use crate::error::BringUpError;
use crate::layout::{DriveMode, Signal};

/// Which reset paths a bring-up run uses.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResetMode {
    /// Pulse the hardware reset line only.
    HardwareOnly,
    /// Issue the target's software reset request only.
    SoftwareOnly,
    /// Hardware pulse first, software re-assert once a DAP exists.
    Hybrid,
}

impl ResetMode {
    /// Whether this mode drives the hardware reset line.
    pub fn has_hardware(self) -> bool {
        matches!(self, ResetMode::HardwareOnly | ResetMode::Hybrid)
    }

    /// Whether this mode issues a software reset after discovery.
    pub fn has_software(self) -> bool {
        matches!(self, ResetMode::SoftwareOnly | ResetMode::Hybrid)
    }
}

/// Timing and drive configuration for the reset sequence.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResetPolicy {
    /// Which reset paths to use.
    pub mode: ResetMode,
    /// How long the hardware line is held asserted.
    pub assert_delay: Duration,
    /// How long the target gets to settle after release.
    pub settle_delay: Duration,
    /// Drive mode for the reset pulse. Overrides the layout's drive mode for
    /// this signal only.
    pub drive: DriveMode,
}

impl Default for ResetPolicy {
    fn default() -> Self {
        Self {
            mode: ResetMode::HardwareOnly,
            assert_delay: Duration::from_millis(10),
            settle_delay: Duration::from_millis(50),
            drive: DriveMode::PushPull,
        }
    }
}

/// States of the reset strategy selector.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ResetState {
    /// Nothing running.
    Idle,
    /// Hardware line held asserted.
    AssertingHardware,
    /// Software reset request in flight.
    AssertingSoftware,
    /// Waiting out the settle delay.
    Settling,
    /// Sequence completed.
    Done,
    /// An adapter write failed mid-sequence.
    Failed,
}

/// Drives the reset sequence described by a [`ResetPolicy`].
///
/// Edge-triggered and idempotent: running a phase again from `Done` restarts
/// the whole sequence cleanly and produces the same adapter writes in the
/// same order.
#[derive(Debug)]
pub struct ResetStrategy {
    state: ResetState,
}

impl Default for ResetStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl ResetStrategy {
    /// Creates an idle strategy.
    pub fn new() -> Self {
        Self {
            state: ResetState::Idle,
        }
    }

    /// The current state.
    pub fn state(&self) -> ResetState {
        self.state
    }

    fn transition(&mut self, next: ResetState) {
        tracing::debug!("reset strategy: {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    /// Runs the hardware phase of the policy, if it has one.
    ///
    /// Asserts `RESET`, waits `assert_delay`, releases it back to its park
    /// level and waits `settle_delay`. Any adapter write failure moves to
    /// `Failed` and surfaces [`BringUpError::ResetFailed`] with the cause.
    pub fn run_hardware(
        &mut self,
        binding: &mut AdapterBinding,
        policy: &ResetPolicy,
    ) -> Result<(), BringUpError> {
        self.transition(ResetState::Idle);
        if !policy.mode.has_hardware() {
            tracing::debug!("reset strategy: no hardware phase in {:?}", policy.mode);
            return Ok(());
        }

        self.transition(ResetState::AssertingHardware);
        self.drive_reset(binding, true, policy)?;
        thread::sleep(policy.assert_delay);
        self.drive_reset(binding, false, policy)?;

        self.settle(policy);
        Ok(())
    }

    /// Runs the software phase of the policy, if it has one.
    ///
    /// Only callable once discovery has produced a DAP; the chain access
    /// handle is how the request reaches the target.
    pub fn run_software(
        &mut self,
        chain: &mut dyn ChainAccess,
        policy: &ResetPolicy,
    ) -> Result<(), BringUpError> {
        if !policy.mode.has_software() {
            return Ok(());
        }

        self.transition(ResetState::AssertingSoftware);
        if let Err(source) = chain.issue_soft_reset() {
            self.transition(ResetState::Failed);
            return Err(BringUpError::ResetFailed(source));
        }

        self.settle(policy);
        Ok(())
    }

    fn settle(&mut self, policy: &ResetPolicy) {
        self.transition(ResetState::Settling);
        thread::sleep(policy.settle_delay);
        self.transition(ResetState::Done);
    }

    fn drive_reset(
        &mut self,
        binding: &mut AdapterBinding,
        active: bool,
        policy: &ResetPolicy,
    ) -> Result<(), BringUpError> {
        match binding.set_signal_with_drive(Signal::Reset, active, Some(policy.drive)) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.transition(ResetState::Failed);
                Err(match err {
                    BringUpError::Adapter(source) => BringUpError::ResetFailed(source),
                    other => other,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::AdapterBinding;
    use crate::fake::{FakeAdapter, Operation};
    use crate::layout::{Level, LayoutConfig, SignalBinding};

    fn fast_policy(mode: ResetMode) -> ResetPolicy {
        ResetPolicy {
            mode,
            assert_delay: Duration::ZERO,
            settle_delay: Duration::ZERO,
            drive: DriveMode::PushPull,
        }
    }

    fn reset_binding() -> (AdapterBinding, std::sync::Arc<std::sync::Mutex<Vec<Operation>>>) {
        let adapter = FakeAdapter::new();
        let log = adapter.log();
        let mut binding = AdapterBinding::new(Box::new(adapter));
        let layout = LayoutConfig {
            channel: 0,
            clock_khz: 1000,
            bindings: vec![
                SignalBinding::output(Signal::Reset, 7, Level::High, DriveMode::PushPull),
                SignalBinding::output(Signal::Tck, 0, Level::Low, DriveMode::PushPull),
            ],
        }
        .validate(&fast_policy(ResetMode::HardwareOnly))
        .unwrap();
        binding.apply_layout(&layout).unwrap();
        (binding, log)
    }

    #[test]
    fn hardware_reset_is_idempotent() {
        let (mut binding, log) = reset_binding();
        let policy = fast_policy(ResetMode::HardwareOnly);
        let mut strategy = ResetStrategy::new();

        strategy.run_hardware(&mut binding, &policy).unwrap();
        assert_eq!(strategy.state(), ResetState::Done);
        let first: Vec<_> = log.lock().unwrap().clone();

        strategy.run_hardware(&mut binding, &policy).unwrap();
        let second = log.lock().unwrap();

        // The second run appended a structurally identical write sequence.
        let appended = &second[first.len()..];
        let reset_writes = |ops: &[Operation]| {
            ops.iter()
                .filter(|op| matches!(op, Operation::WriteOutput(_)))
                .cloned()
                .collect::<Vec<_>>()
        };
        assert_eq!(reset_writes(appended), reset_writes(&first[4..]));
    }

    #[test]
    fn software_only_skips_the_adapter() {
        let (mut binding, log) = reset_binding();
        let before = log.lock().unwrap().len();

        let mut strategy = ResetStrategy::new();
        strategy
            .run_hardware(&mut binding, &fast_policy(ResetMode::SoftwareOnly))
            .unwrap();

        assert_eq!(log.lock().unwrap().len(), before);
        assert_eq!(strategy.state(), ResetState::Idle);
    }

    #[test]
    fn adapter_failure_surfaces_reset_failed() {
        let mut adapter = FakeAdapter::new();
        adapter.fail_after(4); // let apply_layout through, fail the pulse
        let mut binding = AdapterBinding::new(Box::new(adapter));
        let layout = LayoutConfig {
            channel: 0,
            clock_khz: 1000,
            bindings: vec![SignalBinding::output(
                Signal::Reset,
                7,
                Level::High,
                DriveMode::PushPull,
            )],
        }
        .validate(&fast_policy(ResetMode::HardwareOnly))
        .unwrap();
        binding.apply_layout(&layout).unwrap();

        let mut strategy = ResetStrategy::new();
        let err = strategy
            .run_hardware(&mut binding, &fast_policy(ResetMode::HardwareOnly))
            .unwrap_err();
        assert!(matches!(err, BringUpError::ResetFailed(_)));
        assert_eq!(strategy.state(), ResetState::Failed);
    }
}
