//! Mock adapter and scan chain for tests and dry runs.
#![allow(missing_docs)]

use std::sync::{Arc, Mutex};

use bitvec::prelude::*;

use crate::binding::AdapterLink;
use crate::discovery::{ChainAccess, Endianness};
use crate::error::AdapterError;
use crate::sequencer::CancelToken;

/// One register transaction as seen by the fake adapter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Operation {
    SelectChannel(u8),
    WriteOutput(u16),
    WriteDirection(u16),
    ReadInput,
    SetClockRate(u32),
}

/// A mock adapter link that records every register transaction.
///
/// Failure injection (`fail_after`) and cancellation triggering
/// (`cancel_after`) let tests exercise mid-sequence aborts without hardware.
#[derive(Debug, Default)]
pub struct FakeAdapter {
    log: Arc<Mutex<Vec<Operation>>>,
    input_word: u16,
    ops_seen: usize,
    fail_after: Option<usize>,
    cancel_after: Option<(usize, CancelToken)>,
}

impl FakeAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// A handle onto the transaction log, valid after the adapter has been
    /// boxed into a binding.
    pub fn log(&self) -> Arc<Mutex<Vec<Operation>>> {
        Arc::clone(&self.log)
    }

    /// Sets the word returned by input register reads.
    pub fn set_input_word(&mut self, word: u16) {
        self.input_word = word;
    }

    /// Lets the first `ops` transactions through, fails every one after.
    pub fn fail_after(&mut self, ops: usize) {
        self.fail_after = Some(ops);
    }

    /// Fires the token once `ops` transactions have completed.
    pub fn cancel_after(&mut self, ops: usize, token: CancelToken) {
        self.cancel_after = Some((ops, token));
    }

    fn record(&mut self, op: Operation) -> Result<(), AdapterError> {
        self.ops_seen += 1;
        if let Some(limit) = self.fail_after {
            if self.ops_seen > limit {
                return Err(AdapterError::Usb(None));
            }
        }
        self.log.lock().unwrap().push(op);
        if let Some((limit, token)) = &self.cancel_after {
            if self.ops_seen >= *limit {
                token.cancel();
            }
        }
        Ok(())
    }
}

impl AdapterLink for FakeAdapter {
    fn select_channel(&mut self, channel: u8) -> Result<(), AdapterError> {
        self.record(Operation::SelectChannel(channel))
    }

    fn write_output_register(&mut self, word: u16) -> Result<(), AdapterError> {
        self.record(Operation::WriteOutput(word))
    }

    fn write_direction_register(&mut self, word: u16) -> Result<(), AdapterError> {
        self.record(Operation::WriteDirection(word))
    }

    fn read_input_register(&mut self) -> Result<u16, AdapterError> {
        self.record(Operation::ReadInput)?;
        Ok(self.input_word)
    }

    fn set_clock_rate(&mut self, khz: u32) -> Result<u32, AdapterError> {
        self.record(Operation::SetClockRate(khz))?;
        Ok(khz)
    }
}

/// One simulated tap on the fake scan chain.
#[derive(Clone, Debug)]
pub struct FakeTap {
    pub idcode: Option<u32>,
    pub ir_length: usize,
    pub ir_capture: u32,
}

impl FakeTap {
    /// A tap presenting the given IDCODE with a standard 4 bit IR.
    pub fn with_idcode(idcode: u32) -> Self {
        Self {
            idcode: Some(idcode),
            ir_length: 4,
            ir_capture: 0x1,
        }
    }

    /// A tap captured in BYPASS (single 0 bit in the DR chain).
    pub fn bypass() -> Self {
        Self {
            idcode: None,
            ir_length: 5,
            ir_capture: 0x1,
        }
    }
}

/// A mock scan chain with configurable taps and instability.
#[derive(Debug, Default)]
pub struct FakeChain {
    taps: Vec<FakeTap>,
    unstable_captures: usize,
    captures: usize,
    fail_soft_reset: bool,

    pub chain_resets: usize,
    pub dr_shifts: usize,
    pub ir_shifts: usize,
    pub soft_resets: usize,
    pub endianness: Vec<Endianness>,
}

impl FakeChain {
    pub fn new(taps: Vec<FakeTap>) -> Self {
        Self {
            taps,
            ..Self::default()
        }
    }

    /// Corrupts the first `captures` DR captures, each differently, to
    /// exercise the stable-readback retry loop.
    pub fn unstable_for(&mut self, captures: usize) {
        self.unstable_captures = captures;
    }

    /// Makes soft reset requests fail.
    pub fn fail_soft_reset(&mut self) {
        self.fail_soft_reset = true;
    }

    /// Total chain traffic, for asserting that a stage never ran.
    pub fn traffic(&self) -> usize {
        self.chain_resets + self.dr_shifts + self.ir_shifts + self.soft_resets
    }

    fn dr_stream(&self, bits: usize) -> BitVec<u8, Lsb0> {
        let mut stream = BitVec::new();
        for tap in &self.taps {
            match tap.idcode {
                Some(raw) => {
                    let mut word = bitvec![u8, Lsb0; 0; 32];
                    word.store_le(raw);
                    stream.extend_from_bitslice(&word);
                }
                None => stream.push(false),
            }
        }
        // TDO idles high past the end of the chain.
        while stream.len() < bits {
            stream.push(true);
        }
        stream.truncate(bits);
        stream
    }
}

impl ChainAccess for FakeChain {
    fn reset_chain(&mut self) -> Result<(), AdapterError> {
        self.chain_resets += 1;
        Ok(())
    }

    fn shift_dr(&mut self, bits: usize) -> Result<BitVec<u8, Lsb0>, AdapterError> {
        self.dr_shifts += 1;
        self.captures += 1;
        let mut stream = self.dr_stream(bits);
        if self.captures <= self.unstable_captures && !stream.is_empty() {
            // Flip a different bit on every unstable capture.
            let index = self.captures % stream.len();
            let flipped = !stream[index];
            stream.set(index, flipped);
        }
        Ok(stream)
    }

    fn shift_ir(
        &mut self,
        pattern: &BitSlice<u8, Lsb0>,
    ) -> Result<BitVec<u8, Lsb0>, AdapterError> {
        self.ir_shifts += 1;
        let mut capture = BitVec::new();
        for tap in &self.taps {
            let mut field = bitvec![u8, Lsb0; 0; tap.ir_length];
            field.store_le(tap.ir_capture);
            capture.extend_from_bitslice(&field);
        }
        while capture.len() < pattern.len() {
            capture.push(true);
        }
        capture.truncate(pattern.len());
        Ok(capture)
    }

    fn issue_soft_reset(&mut self) -> Result<(), AdapterError> {
        if self.fail_soft_reset {
            return Err(AdapterError::Usb(None));
        }
        self.soft_resets += 1;
        Ok(())
    }

    fn set_endianness(&mut self, endianness: Endianness) -> Result<(), AdapterError> {
        self.endianness.push(endianness);
        Ok(())
    }
}
