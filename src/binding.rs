//! Ownership of one adapter channel: applying a validated layout and
//! driving or sampling individual signals through it.

use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{AdapterError, BringUpError};
use crate::layout::{ChannelLayout, Direction, DriveMode, Level, Signal};

/// Capability interface of the low-level adapter driver.
///
/// Implementations wrap the physical USB transport (MPSSE engine, bit-bang
/// engine, ...). Every method is one register transaction as seen by the
/// adapter link; the binding never asks for partial-byte updates.
pub trait AdapterLink: Debug + Send {
    /// Routes subsequent register accesses to the given channel.
    fn select_channel(&mut self, channel: u8) -> Result<(), AdapterError>;

    /// Writes the full output word of the selected channel.
    fn write_output_register(&mut self, word: u16) -> Result<(), AdapterError>;

    /// Writes the full direction word of the selected channel
    /// (bit set = adapter drives the pin).
    fn write_direction_register(&mut self, word: u16) -> Result<(), AdapterError>;

    /// Reads the input word of the selected channel.
    fn read_input_register(&mut self) -> Result<u16, AdapterError>;

    /// Sets the shift clock rate. Returns the rate actually configured.
    fn set_clock_rate(&mut self, khz: u32) -> Result<u32, AdapterError>;
}

/// An exclusively owned adapter channel with its live register state.
///
/// The binding holds the last output and direction words it committed, so
/// signal updates are read-modify-write against known state rather than
/// against a readback of the hardware.
#[derive(Debug)]
pub struct AdapterBinding {
    link: Box<dyn AdapterLink>,
    applied: Option<ChannelLayout>,
    output: u16,
    direction: u16,
    run_active: AtomicBool,
}

impl AdapterBinding {
    /// Takes ownership of an adapter link.
    pub fn new(link: Box<dyn AdapterLink>) -> Self {
        Self {
            link,
            applied: None,
            output: 0,
            direction: 0,
            run_active: AtomicBool::new(false),
        }
    }

    /// Applies a validated layout to the channel.
    ///
    /// Idempotent: the full output and direction words are rewritten rather
    /// than edited bit by bit, so re-applying the same layout cannot produce
    /// order-dependent transient glitches. The output word is committed
    /// before the direction word so levels are latched before drivers are
    /// enabled.
    pub fn apply_layout(&mut self, layout: &ChannelLayout) -> Result<(), BringUpError> {
        self.link.select_channel(layout.channel())?;
        self.link.write_output_register(layout.output_word())?;
        self.link.write_direction_register(layout.direction_word())?;
        let actual = self.link.set_clock_rate(layout.clock_khz())?;
        if actual != layout.clock_khz() {
            tracing::warn!(
                "adapter rounded clock rate from {} kHz to {} kHz",
                layout.clock_khz(),
                actual
            );
        }

        self.output = layout.output_word();
        self.direction = layout.direction_word();
        self.applied = Some(layout.clone());
        tracing::debug!(
            "applied layout to channel {}: output {:#06x}, direction {:#06x}",
            layout.channel(),
            self.output,
            self.direction
        );
        Ok(())
    }

    /// Drives an output signal to its asserted or released state.
    ///
    /// Released restores the pin to its declared park level; asserted drives
    /// the complement. A reset line parked high is therefore pulled low.
    pub fn set_signal(&mut self, signal: Signal, active: bool) -> Result<(), BringUpError> {
        self.set_signal_with_drive(signal, active, None)
    }

    /// Like [`set_signal`](Self::set_signal), but with a drive-mode override
    /// for the reset strategy (the reset policy's drive mode wins over the
    /// layout's for the reset pulse).
    pub(crate) fn set_signal_with_drive(
        &mut self,
        signal: Signal,
        active: bool,
        drive_override: Option<DriveMode>,
    ) -> Result<(), BringUpError> {
        let binding = self
            .applied
            .as_ref()
            .and_then(|l| l.binding(signal))
            .ok_or(BringUpError::UnknownSignal(signal))?;
        if binding.direction != Direction::Output {
            return Err(BringUpError::SignalIsInput(signal));
        }

        let bit = 1u16 << binding.bit;
        let high = active != (binding.active == Level::High);
        let drive = drive_override.or(binding.drive).unwrap_or(DriveMode::PushPull);

        tracing::debug!(
            "{} {} (bit {}, {:?}, pin {})",
            if active { "asserting" } else { "releasing" },
            signal,
            binding.bit,
            drive,
            if high { "high" } else { "low" }
        );

        match drive {
            DriveMode::PushPull => {
                let output = if high {
                    self.output | bit
                } else {
                    self.output & !bit
                };
                self.link.write_output_register(output)?;
                self.output = output;
            }
            DriveMode::OpenDrain => {
                if high {
                    // Release the line instead of driving it high.
                    let direction = self.direction & !bit;
                    self.link.write_direction_register(direction)?;
                    self.direction = direction;
                } else {
                    let output = self.output & !bit;
                    let direction = self.direction | bit;
                    self.link.write_output_register(output)?;
                    self.link.write_direction_register(direction)?;
                    self.output = output;
                    self.direction = direction;
                }
            }
        }
        Ok(())
    }

    /// Samples an input signal, normalized by its active level.
    pub fn read_signal(&mut self, signal: Signal) -> Result<bool, BringUpError> {
        let binding = self
            .applied
            .as_ref()
            .and_then(|l| l.binding(signal))
            .ok_or(BringUpError::UnknownSignal(signal))?;
        if binding.direction != Direction::Input {
            return Err(BringUpError::SignalIsOutput(signal));
        }

        let word = self.link.read_input_register()?;
        let high = word & (1 << binding.bit) != 0;
        Ok(high == (binding.active == Level::High))
    }

    /// Changes the shift clock rate, keeping the applied layout untouched.
    pub fn set_clock_rate(&mut self, khz: u32) -> Result<u32, BringUpError> {
        Ok(self.link.set_clock_rate(khz)?)
    }

    /// The last committed output word.
    pub fn output_word(&self) -> u16 {
        self.output
    }

    /// The last committed direction word.
    pub fn direction_word(&self) -> u16 {
        self.direction
    }

    /// The currently applied layout, if any.
    pub fn applied_layout(&self) -> Option<&ChannelLayout> {
        self.applied.as_ref()
    }

    /// Marks the binding as owned by a bring-up run.
    ///
    /// Fails with [`BringUpError::SessionBusy`] if a run is already active.
    /// Callers embedding the binding in a larger session manager can use this
    /// pair directly; the orchestrator does.
    pub fn try_begin_run(&self) -> Result<(), BringUpError> {
        self.run_active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| BringUpError::SessionBusy)
    }

    /// Releases the run ownership taken by [`try_begin_run`](Self::try_begin_run).
    pub fn end_run(&self) {
        self.run_active.store(false, Ordering::Release);
    }
}
