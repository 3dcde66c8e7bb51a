//! The bring-up sequencer: drives validation, layout application, reset,
//! discovery and post-reset handling in strict order against an exclusively
//! owned adapter binding.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::binding::AdapterBinding;
use crate::discovery::{ChainAccess, DiscoveryEngine, TapConfig, TargetHandle};
use crate::error::{BringUpError, BringUpFailure, Stage};
use crate::layout::{ChannelLayout, LayoutConfig};
use crate::reset::{ResetPolicy, ResetStrategy};

/// A caller-held handle that can abort a bring-up run between stages.
///
/// Cancellation is checked between stages only, never mid-transaction: an
/// adapter transaction in flight must not be abandoned.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    inner: Arc<AtomicBool>,
}

impl CancelToken {
    /// A fresh, uncancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation of the run holding the token.
    pub fn cancel(&self) {
        self.inner.store(true, Ordering::Release);
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.inner.load(Ordering::Acquire)
    }
}

/// Bring-up events a clock-rate override can attach to.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BringUpEvent {
    /// Before the hardware reset pulse.
    ResetStart,
    /// After the post-reset stage, for the target's entry point.
    ResetEnd,
}

/// A declarative per-event clock-rate override.
///
/// Replaces ad hoc "change the adapter speed on reset-start" callbacks with
/// a table the sequencer consults at the matching point of the run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClockOverride {
    /// The event this override applies to.
    pub event: BringUpEvent,
    /// The clock rate to switch to, in kHz.
    pub rate_khz: u32,
}

/// Caller-supplied control knobs for one bring-up run.
#[derive(Clone, Debug, Default)]
pub struct BringUpOptions {
    /// Checked between stages; aborts with [`BringUpError::Cancelled`].
    pub cancel: Option<CancelToken>,
    /// Overall wall-clock budget for the run, checked between stages.
    pub deadline: Option<Duration>,
    /// Per-event clock-rate overrides.
    pub clock_overrides: Vec<ClockOverride>,
}

impl BringUpOptions {
    fn override_for(&self, event: BringUpEvent) -> Option<u32> {
        self.clock_overrides
            .iter()
            .find(|o| o.event == event)
            .map(|o| o.rate_khz)
    }
}

/// The outcome of a bring-up run: ready target handles, or a typed failure
/// with the last stage that completed.
pub type BringUpResult = Result<Vec<TargetHandle>, BringUpFailure>;

/// Orchestrates a full target bring-up against one adapter binding.
///
/// Single-threaded and synchronous: each stage blocks until its adapter
/// transactions complete, and exactly one run may be active per binding.
/// Failures abort the remaining stages and leave the adapter in the state of
/// the last successful write; there is no automatic rollback, because
/// de-asserting arbitrary GPIOs on an unknown adapter is not always safe.
#[derive(Debug)]
pub struct Orchestrator {
    binding: AdapterBinding,
    reset: ResetStrategy,
    discovery: DiscoveryEngine,
}

impl Orchestrator {
    /// Takes exclusive ownership of an adapter binding.
    pub fn new(binding: AdapterBinding) -> Self {
        Self {
            binding,
            reset: ResetStrategy::new(),
            discovery: DiscoveryEngine::new(),
        }
    }

    /// Validates a candidate layout without touching hardware.
    pub fn validate(
        &self,
        config: &LayoutConfig,
        policy: &ResetPolicy,
    ) -> Result<ChannelLayout, BringUpError> {
        config.validate(policy)
    }

    /// The owned adapter binding, for inspection.
    pub fn binding(&self) -> &AdapterBinding {
        &self.binding
    }

    /// Mutable access to the owned binding, for callers that drive signals
    /// outside a run.
    pub fn binding_mut(&mut self) -> &mut AdapterBinding {
        &mut self.binding
    }

    /// Runs the full bring-up sequence.
    ///
    /// Only the discovery stage retries internally; the reset and layout
    /// stages never do, since repeating a physical reset pulse on failure
    /// can corrupt target state.
    pub fn bring_up(
        &mut self,
        chain: &mut dyn ChainAccess,
        config: &LayoutConfig,
        policy: &ResetPolicy,
        taps: &[TapConfig],
        options: &BringUpOptions,
    ) -> BringUpResult {
        if let Err(error) = self.binding.try_begin_run() {
            return Err(BringUpFailure {
                last_completed: None,
                error,
            });
        }

        let started = Instant::now();
        let mut last_completed = None;
        let result = self.run_stages(chain, config, policy, taps, options, started, &mut last_completed);
        self.binding.end_run();

        result.map_err(|error| {
            tracing::error!(
                "bring-up failed after stage {:?}: {error}",
                last_completed
            );
            BringUpFailure {
                last_completed,
                error,
            }
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn run_stages(
        &mut self,
        chain: &mut dyn ChainAccess,
        config: &LayoutConfig,
        policy: &ResetPolicy,
        taps: &[TapConfig],
        options: &BringUpOptions,
        started: Instant,
        last_completed: &mut Option<Stage>,
    ) -> Result<Vec<TargetHandle>, BringUpError> {
        let layout = config.validate(policy)?;
        *last_completed = Some(Stage::Validate);
        checkpoint(options, started)?;

        self.binding.apply_layout(&layout)?;
        *last_completed = Some(Stage::ApplyLayout);
        checkpoint(options, started)?;

        if let Some(rate) = options.override_for(BringUpEvent::ResetStart) {
            tracing::debug!("reset-start clock override: {rate} kHz");
            self.binding.set_clock_rate(rate)?;
        }
        self.reset.run_hardware(&mut self.binding, policy)?;
        *last_completed = Some(Stage::Reset);
        checkpoint(options, started)?;

        let handles = self.discovery.discover(chain, taps, policy)?;
        *last_completed = Some(Stage::Discovery);
        checkpoint(options, started)?;

        self.reset.run_software(chain, policy)?;
        if options.override_for(BringUpEvent::ResetStart).is_some()
            || options.override_for(BringUpEvent::ResetEnd).is_some()
        {
            let rate = options
                .override_for(BringUpEvent::ResetEnd)
                .unwrap_or_else(|| layout.clock_khz());
            tracing::debug!("post-reset clock rate: {rate} kHz");
            self.binding.set_clock_rate(rate)?;
        }
        if handles.is_empty() {
            return Err(BringUpError::NoCoreFound);
        }
        *last_completed = Some(Stage::PostReset);

        tracing::info!("bring-up complete: {} target handle(s)", handles.len());
        Ok(handles)
    }
}

/// Between-stage control check: cancellation first, then the wall-clock
/// budget.
fn checkpoint(options: &BringUpOptions, started: Instant) -> Result<(), BringUpError> {
    if let Some(cancel) = &options.cancel {
        if cancel.is_cancelled() {
            tracing::warn!("bring-up cancelled between stages");
            return Err(BringUpError::Cancelled);
        }
    }
    if let Some(budget) = options.deadline {
        if started.elapsed() > budget {
            return Err(BringUpError::BringUpTimedOut(budget));
        }
    }
    Ok(())
}
