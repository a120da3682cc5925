//! A software model of daisy-chained TAP controllers, usable anywhere a `Cable` is.
//!
//! Each modeled chip has a real instruction register that captures `0...01`, latches on
//! Update-IR and returns to BYPASS on reset.  Data registers are selected by the latched
//! opcode with its enable bits ignored; an unknown opcode selects the 1-bit bypass register.
//! The first chip added sits nearest TDI.
use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;

use bitvec::prelude::*;

use crate::cable::Cable;
use crate::error::{Error, Result};
use crate::statemachine::JtagState;
use crate::taps::{is_bypass_opcode, pad_opcode};
use crate::tree::ScanTree;

/// A data register of a simulated chip.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SimRegister {
    /// A shift register of storage elements; index 0 nearest TDI.
    Storage(BitVec),
    /// No storage: TDO is the complement of TDI while selected.
    InvertingLoopback,
}

impl SimRegister {
    /// A storage register of `len` elements, all cleared.
    pub fn storage(len: usize) -> Self {
        SimRegister::Storage(BitVec::repeat(false, len))
    }

    fn shift(&mut self, tdi: bool) -> bool {
        match self {
            SimRegister::Storage(bits) => match bits.pop() {
                Some(out) => {
                    bits.insert(0, tdi);
                    out
                }
                None => tdi,
            },
            SimRegister::InvertingLoopback => !tdi,
        }
    }
}

struct SimChip {
    ir_length: usize,
    ir: BitVec,
    /// Latched instruction as a padded `0`/`1` string.
    instruction: String,
    registers: Vec<SimRegister>,
    /// Opcode (enables cleared) to register index.
    opcodes: Vec<(String, usize)>,
    bypass: bool,
}

impl SimChip {
    fn new(ir_length: usize) -> Self {
        Self {
            ir_length,
            ir: BitVec::repeat(false, ir_length),
            instruction: "1".repeat(ir_length),
            registers: Vec::new(),
            opcodes: Vec::new(),
            bypass: false,
        }
    }

    fn reset(&mut self) {
        self.instruction = "1".repeat(self.ir_length);
    }

    fn selected(&self) -> Option<usize> {
        let key: String = self
            .instruction
            .chars()
            .enumerate()
            .map(|(i, c)| if i < 2 { '0' } else { c })
            .collect();
        if is_bypass_opcode(&key) {
            return None;
        }
        self.opcodes
            .iter()
            .find(|(opcode, _)| *opcode == key)
            .map(|(_, reg)| *reg)
    }

    fn capture_ir(&mut self) {
        self.ir.fill(false);
        let n = self.ir.len();
        if n > 0 {
            self.ir.set(n - 1, true);
        }
    }

    fn capture_dr(&mut self) {
        if self.selected().is_none() {
            self.bypass = false;
        }
    }

    fn update_ir(&mut self) {
        self.instruction = self.ir.iter().by_vals().map(|b| if b { '1' } else { '0' }).collect();
    }

    fn shift_ir(&mut self, tdi: bool) -> bool {
        match self.ir.pop() {
            Some(out) => {
                self.ir.insert(0, tdi);
                out
            }
            None => tdi,
        }
    }

    fn shift_dr(&mut self, tdi: bool) -> bool {
        match self.selected() {
            Some(reg) => self.registers[reg].shift(tdi),
            None => core::mem::replace(&mut self.bypass, tdi),
        }
    }
}

pub struct SimulatedChain {
    chips: Vec<SimChip>,
    state: JtagState,
    invert_scan_out: bool,
    clocks: u64,
    trst_pulses: usize,
    frequency_khz: u32,
    tap_volts: f32,
}

impl Default for SimulatedChain {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedChain {
    /// An empty chain: TDO follows TDI.
    pub fn new() -> Self {
        Self {
            chips: Vec::new(),
            state: JtagState::Reset,
            invert_scan_out: false,
            clocks: 0,
            trst_pulses: 0,
            frequency_khz: 0,
            tap_volts: 0.0,
        }
    }

    /// Model every chip of `tree` with a storage register per chain.  Duplicate chains address
    /// their original's register; chains with the bypass opcode use the bypass register.
    pub fn from_tree(tree: &ScanTree) -> Result<Self> {
        let mut sim = Self::new();
        for chip in tree.chips() {
            let ir_length = tree.ir_length(chip)?;
            let index = sim.add_chip(ir_length);
            for chain in tree.chains(chip) {
                let opcode = tree.opcode(chain)?;
                if is_bypass_opcode(&pad_opcode(opcode, ir_length, false, false)?) {
                    continue;
                }
                match tree.original_of(chain)? {
                    Some(original) => sim.add_alias(index, opcode, tree.opcode(original)?)?,
                    None => sim.add_register(
                        index,
                        opcode,
                        SimRegister::storage(tree.node(chain).length()),
                    )?,
                }
            }
        }
        Ok(sim)
    }

    /// Append a chip on the TDO side; returns its index.
    pub fn add_chip(&mut self, ir_length: usize) -> usize {
        self.chips.push(SimChip::new(ir_length));
        self.chips.len() - 1
    }

    fn chip(&self, chip: usize) -> Result<&SimChip> {
        self.chips
            .get(chip)
            .ok_or_else(|| Error::Config(format!("no simulated chip {}", chip)))
    }

    fn chip_mut(&mut self, chip: usize) -> Result<&mut SimChip> {
        self.chips
            .get_mut(chip)
            .ok_or_else(|| Error::Config(format!("no simulated chip {}", chip)))
    }

    fn key(&self, chip: usize, opcode: &str) -> Result<String> {
        pad_opcode(opcode, self.chip(chip)?.ir_length, false, false)
    }

    pub fn add_register(&mut self, chip: usize, opcode: &str, reg: SimRegister) -> Result<()> {
        let key = self.key(chip, opcode)?;
        let c = self.chip_mut(chip)?;
        if c.opcodes.iter().any(|(o, _)| *o == key) {
            return Err(Error::Config(format!(
                "simulated chip {} already has a register at opcode {}",
                chip, opcode
            )));
        }
        c.registers.push(reg);
        let index = c.registers.len() - 1;
        c.opcodes.push((key, index));
        Ok(())
    }

    /// Make `opcode` select the register already at `existing`.
    pub fn add_alias(&mut self, chip: usize, opcode: &str, existing: &str) -> Result<()> {
        let key = self.key(chip, opcode)?;
        let existing_key = self.key(chip, existing)?;
        let c = self.chip_mut(chip)?;
        let index = c
            .opcodes
            .iter()
            .find(|(o, _)| *o == existing_key)
            .map(|(_, r)| *r)
            .ok_or_else(|| Error::Config(format!("no register at opcode {}", existing)))?;
        c.opcodes.push((key, index));
        Ok(())
    }

    /// Replace the register selected by `opcode`.
    pub fn set_register(&mut self, chip: usize, opcode: &str, reg: SimRegister) -> Result<()> {
        let key = self.key(chip, opcode)?;
        let c = self.chip_mut(chip)?;
        match c.opcodes.iter().find(|(o, _)| *o == key).map(|(_, r)| *r) {
            Some(index) => {
                c.registers[index] = reg;
                Ok(())
            }
            None => Err(Error::Config(format!("no register at opcode {}", opcode))),
        }
    }

    /// Contents of a storage register as a `0`/`1` string, index 0 nearest TDI.
    pub fn register_state(&self, chip: usize, opcode: &str) -> Result<Option<String>> {
        let key = self.key(chip, opcode)?;
        let c = self.chip(chip)?;
        Ok(c
            .opcodes
            .iter()
            .find(|(o, _)| *o == key)
            .and_then(|(_, r)| match &c.registers[*r] {
                SimRegister::Storage(bits) => Some(
                    bits.iter()
                        .by_vals()
                        .map(|b| if b { '1' } else { '0' })
                        .collect(),
                ),
                SimRegister::InvertingLoopback => None,
            }))
    }

    /// Latched instruction of a chip, enables included.
    pub fn instruction(&self, chip: usize) -> Result<&str> {
        Ok(&self.chip(chip)?.instruction)
    }

    /// Electrically invert TDO.
    pub fn set_scan_out_inverted(&mut self, inverted: bool) {
        self.invert_scan_out = inverted;
    }

    pub fn tap_state(&self) -> JtagState {
        self.state
    }

    pub fn clock_count(&self) -> u64 {
        self.clocks
    }

    pub fn trst_pulses(&self) -> usize {
        self.trst_pulses
    }

    pub fn frequency_khz(&self) -> u32 {
        self.frequency_khz
    }

    pub fn tap_volts(&self) -> f32 {
        self.tap_volts
    }

    fn reset(&mut self) {
        self.state = JtagState::Reset;
        for chip in &mut self.chips {
            chip.reset();
        }
    }

    /// One TCK: shift if in a shift state, then move to the next state.
    fn clock(&mut self, tms: bool, tdi: bool) -> bool {
        self.clocks += 1;
        let mut bit = tdi;
        match self.state {
            JtagState::ShiftIR => {
                for chip in &mut self.chips {
                    bit = chip.shift_ir(bit);
                }
            }
            JtagState::ShiftDR => {
                for chip in &mut self.chips {
                    bit = chip.shift_dr(bit);
                }
            }
            _ => {}
        }

        self.state = self.state.next(tms);
        match self.state {
            JtagState::Reset => self.reset(),
            JtagState::CaptureIR => self.chips.iter_mut().for_each(SimChip::capture_ir),
            JtagState::CaptureDR => self.chips.iter_mut().for_each(SimChip::capture_dr),
            JtagState::UpdateIR => self.chips.iter_mut().for_each(SimChip::update_ir),
            _ => {}
        }
        bit ^ self.invert_scan_out
    }
}

impl Cable for SimulatedChain {
    fn change_mode(&mut self, tms: &[usize], tdi: bool) -> Result<()> {
        for t in tms {
            self.clock(*t != 0, tdi);
        }
        Ok(())
    }

    fn read_write_data(&mut self, data: &BitSlice, exit_after: bool) -> Result<BitVec> {
        let last = data.len().saturating_sub(1);
        Ok(data
            .iter()
            .by_vals()
            .enumerate()
            .map(|(i, tdi)| self.clock(exit_after && i == last, tdi))
            .collect())
    }

    fn pulse_trst(&mut self) -> Result<()> {
        self.trst_pulses += 1;
        self.reset();
        Ok(())
    }

    fn set_frequency(&mut self, khz: u32) -> Result<()> {
        self.frequency_khz = khz;
        Ok(())
    }

    fn set_tap_voltage(&mut self, volts: f32) -> Result<()> {
        self.tap_volts = volts;
        Ok(())
    }
}
