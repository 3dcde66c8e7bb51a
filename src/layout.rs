//! The signal layout table and its validator.
//!
//! A [`LayoutConfig`] is the caller's candidate mapping from logical debug
//! signals to GPIO bits of one adapter channel. Validation produces an
//! immutable [`ChannelLayout`] whose output and direction words are derived
//! from the bindings; the words are never stored independently, so they
//! cannot drift apart the way hand-maintained hex masks do.

use serde::{Deserialize, Serialize};

use crate::error::BringUpError;
use crate::reset::ResetPolicy;

/// Number of GPIO bits in one adapter channel word.
pub const CHANNEL_WIDTH: u8 = 16;

/// Logical debug signals that can be mapped onto channel bits.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Signal {
    /// System reset (SRST) towards the target.
    Reset,
    /// Test-logic reset (TRST) towards the tap controller.
    Trst,
    /// JTAG test mode select.
    Tms,
    /// JTAG test data in (probe to target).
    Tdi,
    /// JTAG test data out (target to probe).
    Tdo,
    /// JTAG test clock.
    Tck,
    /// Adapter output-enable / buffer-enable line.
    Enable,
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Signal::Reset => "RESET",
            Signal::Trst => "TRST",
            Signal::Tms => "TMS",
            Signal::Tdi => "TDI",
            Signal::Tdo => "TDO",
            Signal::Tck => "TCK",
            Signal::Enable => "ENABLE",
        };
        f.write_str(name)
    }
}

/// Whether the adapter drives the pin or samples it.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// The adapter drives this pin.
    Output,
    /// The adapter samples this pin.
    Input,
}

/// The polarity declared for a signal.
///
/// For outputs this is the level the derived default word parks the pin at;
/// asserting the signal drives the complement. An SRST line that resets the
/// target when pulled low is therefore declared `High`. For inputs it is the
/// level that reads back as `true`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Level {
    /// Parks high (outputs) / reads `true` when high (inputs).
    High,
    /// Parks low (outputs) / reads `true` when low (inputs).
    Low,
}

/// How an output pin is driven.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DriveMode {
    /// Actively driven in both directions.
    PushPull,
    /// Driven low, released high. Releasing clears the pin's direction bit.
    OpenDrain,
}

/// One entry of the signal layout table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalBinding {
    /// The logical signal this binding maps.
    pub signal: Signal,
    /// Bit index within the channel word.
    pub bit: u8,
    /// Pin direction.
    pub direction: Direction,
    /// Declared polarity, see [`Level`].
    pub active: Level,
    /// Drive mode. Required for outputs, forbidden for inputs.
    pub drive: Option<DriveMode>,
}

impl SignalBinding {
    /// Convenience constructor for an output binding.
    pub fn output(signal: Signal, bit: u8, active: Level, drive: DriveMode) -> Self {
        Self {
            signal,
            bit,
            direction: Direction::Output,
            active,
            drive: Some(drive),
        }
    }

    /// Convenience constructor for an input binding.
    pub fn input(signal: Signal, bit: u8, active: Level) -> Self {
        Self {
            signal,
            bit,
            direction: Direction::Input,
            active,
            drive: None,
        }
    }
}

/// A candidate layout, as supplied by configuration.
///
/// Mirrors the source configuration surface: channel selection, the
/// per-signal bit/direction/drive table and the JTAG clock rate.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LayoutConfig {
    /// Which adapter channel the table applies to.
    pub channel: u8,
    /// JTAG clock rate in kHz.
    pub clock_khz: u32,
    /// The signal bindings, in declaration order.
    pub bindings: Vec<SignalBinding>,
}

impl LayoutConfig {
    /// Validates the candidate table and derives the channel words.
    ///
    /// Checks run in order and fail fast: an invalid layout must never be
    /// partially applied, so the first problem found is returned.
    pub fn validate(&self, policy: &ResetPolicy) -> Result<ChannelLayout, BringUpError> {
        let mut claimed: [Option<Signal>; CHANNEL_WIDTH as usize] =
            [None; CHANNEL_WIDTH as usize];

        for binding in &self.bindings {
            if binding.bit >= CHANNEL_WIDTH {
                return Err(BringUpError::BitOutOfRange {
                    signal: binding.signal,
                    bit: binding.bit,
                });
            }
            if let Some(first) = claimed[binding.bit as usize] {
                return Err(BringUpError::PinConflict {
                    bit: binding.bit,
                    first,
                    second: binding.signal,
                });
            }
            claimed[binding.bit as usize] = Some(binding.signal);
        }

        for binding in &self.bindings {
            let consistent = match binding.direction {
                Direction::Output => binding.drive.is_some(),
                Direction::Input => binding.drive.is_none(),
            };
            if !consistent {
                return Err(BringUpError::DirectionMismatch {
                    signal: binding.signal,
                });
            }
        }

        if policy.mode.has_hardware() {
            let reset_ok = self.bindings.iter().any(|b| {
                b.signal == Signal::Reset && b.direction == Direction::Output
            });
            if !reset_ok {
                return Err(BringUpError::MissingRequiredSignal {
                    signal: Signal::Reset,
                });
            }
        }

        let (output_word, direction_word) = derive_words(&self.bindings);
        tracing::debug!(
            "validated layout for channel {}: output {:#06x}, direction {:#06x}",
            self.channel,
            output_word,
            direction_word
        );

        Ok(ChannelLayout {
            channel: self.channel,
            clock_khz: self.clock_khz,
            bindings: self.bindings.clone(),
            output_word,
            direction_word,
        })
    }
}

/// Computes the default output and direction words from a binding list.
///
/// Direction bit set iff the binding is an output; output bit set iff the
/// binding is an output that parks high.
fn derive_words(bindings: &[SignalBinding]) -> (u16, u16) {
    let mut output = 0u16;
    let mut direction = 0u16;
    for binding in bindings {
        if binding.direction == Direction::Output {
            direction |= 1 << binding.bit;
            if binding.active == Level::High {
                output |= 1 << binding.bit;
            }
        }
    }
    (output, direction)
}

/// A validated, immutable signal layout for one adapter channel.
///
/// Only [`LayoutConfig::validate`] can construct one; re-configuration builds
/// a new layout rather than mutating in place.
#[derive(Clone, Debug, PartialEq)]
pub struct ChannelLayout {
    channel: u8,
    clock_khz: u32,
    bindings: Vec<SignalBinding>,
    output_word: u16,
    direction_word: u16,
}

impl ChannelLayout {
    /// The adapter channel this layout applies to.
    pub fn channel(&self) -> u8 {
        self.channel
    }

    /// The configured JTAG clock rate in kHz.
    pub fn clock_khz(&self) -> u32 {
        self.clock_khz
    }

    /// The derived default output word.
    pub fn output_word(&self) -> u16 {
        self.output_word
    }

    /// The derived direction word.
    pub fn direction_word(&self) -> u16 {
        self.direction_word
    }

    /// Looks up the binding for a signal, if the layout maps it.
    pub fn binding(&self, signal: Signal) -> Option<&SignalBinding> {
        self.bindings.iter().find(|b| b.signal == signal)
    }

    /// The bindings, in declaration order.
    pub fn bindings(&self) -> &[SignalBinding] {
        &self.bindings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reset::{ResetMode, ResetPolicy};
    use rand::prelude::*;

    fn policy(mode: ResetMode) -> ResetPolicy {
        ResetPolicy {
            mode,
            ..ResetPolicy::default()
        }
    }

    fn jtag_config(bindings: Vec<SignalBinding>) -> LayoutConfig {
        LayoutConfig {
            channel: 0,
            clock_khz: 1000,
            bindings,
        }
    }

    fn reference_bindings() -> Vec<SignalBinding> {
        vec![
            SignalBinding::output(Signal::Reset, 7, Level::High, DriveMode::PushPull),
            SignalBinding::output(Signal::Enable, 5, Level::High, DriveMode::PushPull),
            SignalBinding::output(Signal::Tms, 3, Level::High, DriveMode::PushPull),
            SignalBinding::input(Signal::Tdo, 2, Level::High),
            SignalBinding::output(Signal::Tdi, 1, Level::Low, DriveMode::PushPull),
            SignalBinding::output(Signal::Tck, 0, Level::Low, DriveMode::PushPull),
        ]
    }

    #[test]
    fn derives_words_from_bindings() {
        let layout = jtag_config(reference_bindings())
            .validate(&policy(ResetMode::HardwareOnly))
            .unwrap();

        // Outputs on bits 7,5,3,1,0; of those, active-high on 7,5,3.
        assert_eq!(layout.output_word(), 0b1010_1000);
        assert_eq!(layout.direction_word(), 0b1010_1011);
    }

    #[test]
    fn rejects_pin_conflict_naming_both_signals() {
        let mut bindings = reference_bindings();
        bindings.push(SignalBinding::output(
            Signal::Trst,
            7,
            Level::Low,
            DriveMode::OpenDrain,
        ));

        let err = jtag_config(bindings)
            .validate(&policy(ResetMode::HardwareOnly))
            .unwrap_err();
        match err {
            BringUpError::PinConflict { bit, first, second } => {
                assert_eq!(bit, 7);
                assert_eq!(first, Signal::Reset);
                assert_eq!(second, Signal::Trst);
            }
            other => panic!("expected PinConflict, got {other:?}"),
        }
    }

    #[test]
    fn rejects_input_with_drive_mode() {
        let mut bindings = reference_bindings();
        bindings[3].drive = Some(DriveMode::PushPull);

        let err = jtag_config(bindings)
            .validate(&policy(ResetMode::HardwareOnly))
            .unwrap_err();
        assert!(matches!(
            err,
            BringUpError::DirectionMismatch {
                signal: Signal::Tdo
            }
        ));
    }

    #[test]
    fn rejects_output_without_drive_mode() {
        let mut bindings = reference_bindings();
        bindings[2].drive = None;

        let err = jtag_config(bindings)
            .validate(&policy(ResetMode::HardwareOnly))
            .unwrap_err();
        assert!(matches!(
            err,
            BringUpError::DirectionMismatch { signal: Signal::Tms }
        ));
    }

    #[test]
    fn hardware_reset_requires_reset_output() {
        let bindings = reference_bindings()
            .into_iter()
            .filter(|b| b.signal != Signal::Reset)
            .collect();

        let err = jtag_config(bindings)
            .validate(&policy(ResetMode::HardwareOnly))
            .unwrap_err();
        assert!(matches!(
            err,
            BringUpError::MissingRequiredSignal {
                signal: Signal::Reset
            }
        ));

        // Software-only mode is fine without a reset pin.
        let bindings: Vec<_> = reference_bindings()
            .into_iter()
            .filter(|b| b.signal != Signal::Reset)
            .collect();
        jtag_config(bindings)
            .validate(&policy(ResetMode::SoftwareOnly))
            .unwrap();
    }

    #[test]
    fn rejects_bit_outside_channel_word() {
        let mut bindings = reference_bindings();
        bindings[0].bit = 16;

        let err = jtag_config(bindings)
            .validate(&policy(ResetMode::HardwareOnly))
            .unwrap_err();
        assert!(matches!(err, BringUpError::BitOutOfRange { bit: 16, .. }));
    }

    /// Randomized check of the acceptance condition: a candidate is accepted
    /// iff all bit indices are unique and every direction/drive pairing is
    /// consistent.
    #[test]
    fn random_binding_sets_accepted_iff_consistent() {
        let signals = [
            Signal::Reset,
            Signal::Trst,
            Signal::Tms,
            Signal::Tdi,
            Signal::Tdo,
            Signal::Tck,
            Signal::Enable,
        ];
        let mut rng = StdRng::seed_from_u64(0x4ba0_0477);

        for _ in 0..500 {
            let mut bindings = vec![SignalBinding::output(
                Signal::Reset,
                rng.gen_range(0..CHANNEL_WIDTH),
                Level::High,
                DriveMode::PushPull,
            )];
            for &signal in signals[1..].iter() {
                if rng.gen_bool(0.3) {
                    continue;
                }
                let direction = if rng.gen_bool(0.8) {
                    Direction::Output
                } else {
                    Direction::Input
                };
                // Deliberately mis-pair drive and direction some of the time.
                let drive = if rng.gen_bool(0.85) == (direction == Direction::Output) {
                    Some(DriveMode::PushPull)
                } else {
                    None
                };
                bindings.push(SignalBinding {
                    signal,
                    bit: rng.gen_range(0..CHANNEL_WIDTH),
                    direction,
                    active: Level::High,
                    drive,
                });
            }

            let unique_bits = {
                let mut bits: Vec<_> = bindings.iter().map(|b| b.bit).collect();
                bits.sort_unstable();
                bits.dedup();
                bits.len() == bindings.len()
            };
            let consistent = bindings.iter().all(|b| match b.direction {
                Direction::Output => b.drive.is_some(),
                Direction::Input => b.drive.is_none(),
            });

            let result = jtag_config(bindings).validate(&policy(ResetMode::HardwareOnly));
            assert_eq!(result.is_ok(), unique_bits && consistent);
        }
    }
}
