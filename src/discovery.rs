//! Scan chain interrogation: IDCODE capture, expectation checking and
//! construction of DAP/core handles for the taps that carry one.

use std::fmt::Debug;

use bitfield::bitfield;
use bitvec::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{AdapterError, BringUpError};
use crate::reset::ResetPolicy;

bitfield! {
    /// A JTAG IDCODE as captured from the scan chain.
    #[derive(Copy, Clone, Eq, PartialEq)]
    pub struct IdCode(u32);
    impl Debug;

    u8;
    /// Silicon revision.
    pub version, set_version: 31, 28;

    u16;
    /// Vendor-assigned part number.
    pub part_number, set_part_number: 27, 12;

    /// The JEDEC JEP-106 manufacturer ID.
    pub manufacturer, set_manufacturer: 11, 1;

    u8;
    /// Continuation code of the manufacturer ID.
    pub manufacturer_continuation, set_manufacturer_continuation: 11, 8;

    /// Identity code of the manufacturer ID.
    pub manufacturer_identity, set_manufacturer_identity: 7, 1;

    bool;
    /// Marker bit distinguishing an IDCODE from a BYPASS capture. Always set.
    pub marker, set_marker: 0;
}

impl IdCode {
    /// Whether this looks like a real IDCODE: marker bit set and a
    /// non-reserved manufacturer ID.
    pub fn valid(&self) -> bool {
        self.marker() && self.manufacturer() != 0 && self.manufacturer() != 127
    }

    /// The manufacturer name, if the JEP-106 tables know it.
    pub fn manufacturer_name(&self) -> Option<&'static str> {
        let cc = self.manufacturer_continuation();
        let id = self.manufacturer_identity();
        jep106::JEP106Code::new(cc, id).get()
    }

    /// The raw 32 bit value.
    pub fn raw(&self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for IdCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(mfn) = self.manufacturer_name() {
            write!(f, "{:#010x} ({})", self.0, mfn)
        } else {
            write!(f, "{:#010x}", self.0)
        }
    }
}

/// Byte order of a discovered core.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Endianness {
    /// Little endian.
    Little,
    /// Big endian.
    Big,
}

/// What a tap position is used for.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TapRole {
    /// The tap fronts a debuggable core; discovery builds a handle for it.
    Core,
    /// Boundary-scan-only tap; enumerated but never given a handle.
    BoundaryScan,
}

/// The kind of core behind a core-role tap.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoreKind {
    /// An ARM Cortex-M core behind an ADI debug port.
    CortexM,
}

/// Capability interface of the target protocol layer.
///
/// Shift operations run with the scan chain in the corresponding shift state;
/// how the state machine gets there is the protocol layer's business.
pub trait ChainAccess: Debug {
    /// Puts the scan chain into test-logic-reset so DR captures reload
    /// IDCODEs.
    fn reset_chain(&mut self) -> Result<(), AdapterError>;

    /// Shifts `bits` bits out of the DR chain, clocking ones in.
    fn shift_dr(&mut self, bits: usize) -> Result<BitVec<u8, Lsb0>, AdapterError>;

    /// Shifts `pattern` through the IR chain, returning the captured bits.
    fn shift_ir(&mut self, pattern: &BitSlice<u8, Lsb0>)
        -> Result<BitVec<u8, Lsb0>, AdapterError>;

    /// Requests a software reset of the target behind the current DAP.
    fn issue_soft_reset(&mut self) -> Result<(), AdapterError>;

    /// Configures the byte order used for target accesses.
    fn set_endianness(&mut self, endianness: Endianness) -> Result<(), AdapterError>;
}

/// Per-position expectations for the scan chain, from configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TapConfig {
    /// Instruction register length in bits.
    pub ir_length: usize,
    /// Value the IR captures in Capture-IR.
    pub ir_capture: u32,
    /// Mask applied when checking the IR capture.
    pub ir_mask: u32,
    /// Admissible IDCODE values. Empty accepts anything.
    pub expected_idcodes: Vec<u32>,
    /// What this position is used for.
    pub role: TapRole,
    /// Core kind for core-role taps.
    pub core_kind: Option<CoreKind>,
    /// Byte order of the core behind this tap.
    pub endianness: Endianness,
}

impl TapConfig {
    /// A Cortex-M debug tap: 4 bit IR capturing `0b0001`, little endian.
    pub fn cortex_m(expected_idcodes: Vec<u32>) -> Self {
        Self {
            ir_length: 4,
            ir_capture: 0x1,
            ir_mask: 0xf,
            expected_idcodes,
            role: TapRole::Core,
            core_kind: Some(CoreKind::CortexM),
            endianness: Endianness::Little,
        }
    }

    /// A boundary-scan tap accepted regardless of its IDCODE.
    pub fn boundary_scan(ir_length: usize) -> Self {
        Self {
            ir_length,
            ir_capture: 0x1,
            ir_mask: 0x3,
            expected_idcodes: Vec::new(),
            role: TapRole::BoundaryScan,
            core_kind: None,
            endianness: Endianness::Little,
        }
    }
}

/// A confirmed tap. Immutable once discovery has accepted the position.
#[derive(Clone, Debug, PartialEq)]
pub struct TapDescriptor {
    /// Position in the physical scan order, ascending from 0.
    pub chain_position: usize,
    /// Instruction register length in bits.
    pub ir_length: usize,
    /// Expected Capture-IR value.
    pub ir_capture: u32,
    /// Mask for the Capture-IR check.
    pub ir_mask: u32,
    /// The admissible IDCODEs this position declared.
    pub expected_idcodes: Vec<u32>,
    /// The IDCODE that was actually observed, when one was readable.
    pub idcode: Option<IdCode>,
}

/// A ready-to-use target produced by a successful bring-up run.
///
/// Owned by the sequencer until returned; thereafter owned by the caller.
#[derive(Clone, Debug)]
pub struct TargetHandle {
    /// The tap this target sits behind.
    pub tap: TapDescriptor,
    /// Identifier of the debug access port, derived from the IDCODE.
    pub dap_id: u32,
    /// The kind of core.
    pub core_kind: CoreKind,
    /// Byte order configured for this core.
    pub endianness: Endianness,
    /// The reset policy the target was brought up with.
    pub reset_config: ResetPolicy,
}

/// Decodes one DR capture into per-position IDCODE observations.
///
/// A set leading bit starts a 32 bit IDCODE; a clear bit is a tap in BYPASS
/// (observed as `None`). Decoding stops after `expected` positions; missing
/// trailing positions are reported as `None`.
fn decode_chain(mut dr: &BitSlice<u8, Lsb0>, expected: usize) -> Vec<Option<u32>> {
    let mut observed = Vec::with_capacity(expected);

    while observed.len() < expected && !dr.is_empty() {
        if dr[0] {
            if dr.len() < 32 {
                tracing::error!("truncated IDCODE at position {}: {} bits", observed.len(), dr.len());
                observed.push(None);
                break;
            }
            observed.push(Some(dr[0..32].load_le::<u32>()));
            dr = &dr[32..];
        } else {
            observed.push(None);
            dr = &dr[1..];
        }
    }
    observed.resize(expected, None);
    observed
}

/// Default bound on DR capture attempts before the chain counts as unstable.
pub const DEFAULT_CAPTURE_ATTEMPTS: usize = 4;

/// The tap discovery state machine.
///
/// Captures the DR chain until two consecutive captures agree, checks every
/// position against its configured expectations and builds a handle for each
/// core-role tap, strictly in ascending chain-position order.
#[derive(Debug)]
pub struct DiscoveryEngine {
    capture_attempts: usize,
}

impl Default for DiscoveryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl DiscoveryEngine {
    /// An engine with the default capture bound.
    pub fn new() -> Self {
        Self {
            capture_attempts: DEFAULT_CAPTURE_ATTEMPTS,
        }
    }

    /// Overrides the capture bound. Mostly useful in tests.
    pub fn with_capture_attempts(capture_attempts: usize) -> Self {
        Self { capture_attempts }
    }

    /// Runs discovery against the configured chain.
    pub fn discover(
        &self,
        chain: &mut dyn ChainAccess,
        taps: &[TapConfig],
        policy: &ResetPolicy,
    ) -> Result<Vec<TargetHandle>, BringUpError> {
        let want_bits = 33 * taps.len().max(1);
        let capture = self.stable_capture(chain, want_bits)?;
        let observed = decode_chain(capture.as_bitslice(), taps.len());

        for (position, (config, raw)) in taps.iter().zip(&observed).enumerate() {
            self.check_position(position, config, *raw)?;
        }

        self.check_ir_chain(chain, taps)?;

        let mut handles = Vec::new();
        for (position, (config, raw)) in taps.iter().zip(&observed).enumerate() {
            let idcode = raw.map(IdCode).filter(IdCode::valid);
            let descriptor = TapDescriptor {
                chain_position: position,
                ir_length: config.ir_length,
                ir_capture: config.ir_capture,
                ir_mask: config.ir_mask,
                expected_idcodes: config.expected_idcodes.clone(),
                idcode,
            };

            if config.role == TapRole::Core {
                chain.set_endianness(config.endianness)?;
                let dap_id = raw.unwrap_or(0);
                if raw.is_none() {
                    tracing::warn!(
                        "tap {position}: core-role tap without a readable IDCODE, DAP id defaults to 0"
                    );
                }
                tracing::info!(
                    "tap {position}: core-role tap, DAP id {:#010x}, {:?} endian",
                    dap_id,
                    config.endianness
                );
                handles.push(TargetHandle {
                    tap: descriptor,
                    dap_id,
                    core_kind: config.core_kind.unwrap_or(CoreKind::CortexM),
                    endianness: config.endianness,
                    reset_config: policy.clone(),
                });
            } else {
                tracing::info!("tap {position}: boundary-scan tap");
            }
        }

        Ok(handles)
    }

    /// Captures DR until two consecutive captures agree.
    fn stable_capture(
        &self,
        chain: &mut dyn ChainAccess,
        bits: usize,
    ) -> Result<BitVec<u8, Lsb0>, BringUpError> {
        chain.reset_chain()?;
        let mut previous = chain.shift_dr(bits)?;
        let mut attempts = 1;

        loop {
            if attempts >= self.capture_attempts {
                tracing::error!(
                    "no stable DR capture after {attempts} attempts, giving up"
                );
                return Err(BringUpError::ChainUnstable { attempts });
            }

            chain.reset_chain()?;
            let current = chain.shift_dr(bits)?;
            attempts += 1;

            if current == previous {
                tracing::debug!("stable DR capture after {attempts} attempts");
                return Ok(current);
            }
            tracing::warn!("DR capture changed between attempts {} and {attempts}", attempts - 1);
            previous = current;
        }
    }

    fn check_position(
        &self,
        position: usize,
        config: &TapConfig,
        raw: Option<u32>,
    ) -> Result<(), BringUpError> {
        let idcode = raw.map(IdCode).filter(IdCode::valid);

        if config.expected_idcodes.is_empty() {
            match (raw, idcode) {
                (Some(_), Some(idcode)) => tracing::info!("tap {position}: IDCODE {idcode}"),
                (Some(raw), None) => {
                    tracing::warn!("tap {position}: unrecognisable IDCODE {raw:#010x}, accepted by wildcard")
                }
                (None, _) => tracing::info!("tap {position}: in BYPASS, accepted by wildcard"),
            }
            return Ok(());
        }

        match idcode {
            Some(idcode) if config.expected_idcodes.contains(&idcode.raw()) => {
                tracing::info!("tap {position}: IDCODE {idcode} matches expectation");
                Ok(())
            }
            _ => {
                tracing::error!(
                    "tap {position}: expected one of {:#010x?}, observed {raw:#010x?}",
                    config.expected_idcodes
                );
                Err(BringUpError::TapIdMismatch {
                    position,
                    expected: config.expected_idcodes.clone(),
                    observed: raw,
                })
            }
        }
    }

    /// Shifts all-ones through the IR chain and checks each position's
    /// capture value. Mismatches are tolerated with a warning; an
    /// already-halted or otherwise uncooperative tap must not abort bring-up.
    fn check_ir_chain(
        &self,
        chain: &mut dyn ChainAccess,
        taps: &[TapConfig],
    ) -> Result<(), BringUpError> {
        let total: usize = taps.iter().map(|t| t.ir_length).sum();
        if total == 0 {
            return Ok(());
        }

        let pattern = bitvec![u8, Lsb0; 1; total];
        let capture = chain.shift_ir(&pattern)?;

        let mut offset = 0;
        for (position, config) in taps.iter().enumerate() {
            if offset + config.ir_length > capture.len() || config.ir_length > 32 {
                tracing::warn!("tap {position}: IR capture too short to check");
                break;
            }
            let field: u32 = capture[offset..offset + config.ir_length].load_le();
            if field & config.ir_mask != config.ir_capture & config.ir_mask {
                tracing::warn!(
                    "tap {position}: IR captured {field:#x}, expected {:#x} (mask {:#x})",
                    config.ir_capture,
                    config.ir_mask
                );
            }
            offset += config.ir_length;
        }
        Ok(())
    }
}
