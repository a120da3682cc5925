//! JTAG testers: the devices that carry a root chain's in-bits to the chip and bring its out-bits
//! back.
//!
//! [`CableTester`] drives any [`Cable`] through the TAP state machine: it loads the system
//! instruction register with the chain's opcode (every other chip in BYPASS), checks the IR
//! capture, then shifts the chain's in-bits through the selected data register.
use alloc::boxed::Box;
use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;

use crate::bitvector::BitVector;
use crate::cable::Cable;
use crate::error::{Error, Result, Severity};
use crate::simulation::{check_data_nets, SimulationModel};
use crate::statemachine::{JtagSM, JtagState};
use crate::taps::{is_bypass_opcode, pad_opcode, Taps};
use crate::tree::{NodeId, ScanTree};

/// Number of auxiliary logic outputs a tester can drive.
pub const NUM_LOGIC_OUTPUTS: usize = 8;

/// Slowest supported TCK.
pub const MIN_KHZ: u32 = 390;

/// Fastest supported TCK.
pub const MAX_KHZ: u32 = 40_000;

/// Refuse a clock frequency outside [`MIN_KHZ`]..=[`MAX_KHZ`].
pub fn check_khz(khz: u32) -> Result<()> {
    if !(MIN_KHZ..=MAX_KHZ).contains(&khz) {
        return Err(Error::Config(format!(
            "TCK frequency {} kHz outside allowed range {}..={} kHz",
            khz, MIN_KHZ, MAX_KHZ
        )));
    }
    Ok(())
}

/// What one shift of a root chain produced.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShiftOutcome {
    /// Bits scanned out, already corrected for scan-out inversion.
    pub out_bits: BitVector,
    /// One message per data net that did not take the value written to it.
    pub write_mismatches: Vec<String>,
}

pub trait JtagTester {
    /// Set TAP voltage and TCK frequency, then reset.
    fn configure(&mut self, volts: f32, khz: u32) -> Result<()>;

    /// Reset the TAP controllers with TRST, leaving them in Idle with BYPASS selected.
    fn reset(&mut self) -> Result<()>;

    /// Reset through TMS only: five clocks with TMS high, then Idle.
    fn tms_reset(&mut self) -> Result<()>;

    /// Drive auxiliary logic output `index` (0..[`NUM_LOGIC_OUTPUTS`]).
    fn set_logic_output(&mut self, index: usize, level: bool) -> Result<()>;

    fn logic_outputs(&self) -> &[bool] {
        &[]
    }

    /// Whether TDO is electrically inverted and corrected in software.
    fn is_scan_out_inverted(&self) -> bool;

    fn set_scan_out_inverted(&mut self, _inverted: bool) -> Result<()> {
        Err(Error::Unsupported(String::from(
            "this tester can't invert scanned-out data",
        )))
    }

    /// Whether shifts read and write the chip's nets directly instead of scanning.
    fn is_bypass_scanning(&self) -> bool {
        false
    }

    /// State of the TAP controllers, if the tester tracks one.
    fn tap_state(&self) -> Option<JtagState>;

    /// Shift the in-bits of root chain `chain` and return what came out.  A bad instruction
    /// register capture is reported at `ir_bad`.
    fn shift(
        &mut self,
        tree: &ScanTree,
        chain: NodeId,
        read_enable: bool,
        write_enable: bool,
        ir_bad: Severity,
    ) -> Result<ShiftOutcome>;

    /// Shift only the last in-bit of `chain` and return the bit that came out.
    fn shift_one_bit(
        &mut self,
        tree: &ScanTree,
        chain: NodeId,
        _read_enable: bool,
        _write_enable: bool,
        _ir_bad: Severity,
    ) -> Result<bool> {
        Err(Error::Unsupported(format!(
            "one-bit shift of {} on this tester",
            tree.path(chain)
        )))
    }

    /// Release the hardware.
    fn disconnect(&mut self) -> Result<()> {
        Ok(())
    }
}

impl<T: JtagTester + ?Sized> JtagTester for Box<T> {
    fn configure(&mut self, volts: f32, khz: u32) -> Result<()> {
        (**self).configure(volts, khz)
    }

    fn reset(&mut self) -> Result<()> {
        (**self).reset()
    }

    fn tms_reset(&mut self) -> Result<()> {
        (**self).tms_reset()
    }

    fn set_logic_output(&mut self, index: usize, level: bool) -> Result<()> {
        (**self).set_logic_output(index, level)
    }

    fn logic_outputs(&self) -> &[bool] {
        (**self).logic_outputs()
    }

    fn is_scan_out_inverted(&self) -> bool {
        (**self).is_scan_out_inverted()
    }

    fn set_scan_out_inverted(&mut self, inverted: bool) -> Result<()> {
        (**self).set_scan_out_inverted(inverted)
    }

    fn is_bypass_scanning(&self) -> bool {
        (**self).is_bypass_scanning()
    }

    fn tap_state(&self) -> Option<JtagState> {
        (**self).tap_state()
    }

    fn shift(
        &mut self,
        tree: &ScanTree,
        chain: NodeId,
        read_enable: bool,
        write_enable: bool,
        ir_bad: Severity,
    ) -> Result<ShiftOutcome> {
        (**self).shift(tree, chain, read_enable, write_enable, ir_bad)
    }

    fn shift_one_bit(
        &mut self,
        tree: &ScanTree,
        chain: NodeId,
        read_enable: bool,
        write_enable: bool,
        ir_bad: Severity,
    ) -> Result<bool> {
        (**self).shift_one_bit(tree, chain, read_enable, write_enable, ir_bad)
    }

    fn disconnect(&mut self) -> Result<()> {
        (**self).disconnect()
    }
}

/// A tester that scans through a physical or simulated [`Cable`].
pub struct CableTester<C> {
    pub taps: Taps<C>,
    volts: f32,
    khz: u32,
    logic_outputs: [bool; NUM_LOGIC_OUTPUTS],
    inverted: bool,
    observer: Option<Box<dyn SimulationModel>>,
}

impl<C: Cable> CableTester<C> {
    /// Take over `cable`; the controllers are reset through TMS.
    pub fn new(cable: C) -> Result<Self> {
        Ok(Self {
            taps: Taps::new(JtagSM::new(cable)?),
            volts: 0.0,
            khz: 0,
            logic_outputs: [false; NUM_LOGIC_OUTPUTS],
            inverted: false,
            observer: None,
        })
    }

    /// Verify write-enabled shifts against the data nets of `model`.
    pub fn with_observer(mut self, model: Box<dyn SimulationModel>) -> Self {
        self.observer = Some(model);
        self
    }

    pub fn observer_mut(&mut self) -> Option<&mut (dyn SimulationModel + 'static)> {
        self.observer.as_deref_mut()
    }

    pub fn cable(&self) -> &C {
        &self.taps.sm.cable
    }

    pub fn cable_mut(&mut self) -> &mut C {
        &mut self.taps.sm.cable
    }

    pub fn volts(&self) -> f32 {
        self.volts
    }

    pub fn khz(&self) -> u32 {
        self.khz
    }

    /// Describe every chip of `tree` to the TAP layer, select the one owning `chain`, and load
    /// the instruction register.
    fn load_instruction(
        &mut self,
        tree: &ScanTree,
        chain: NodeId,
        read_enable: bool,
        write_enable: bool,
        ir_bad: Severity,
    ) -> Result<()> {
        let chip = tree.parent_chip(chain)?;
        let chips = tree.chips();
        let active = chips.iter().position(|c| *c == chip).ok_or_else(|| {
            Error::Config(format!("chip {} is not on the scan chain", tree.path(chip)))
        })?;
        let irlens = chips
            .iter()
            .map(|c| tree.ir_length(*c))
            .collect::<Result<Vec<_>>>()?;
        self.taps.set_taps(&irlens);
        self.taps.select_tap(active)?;

        let ir = self
            .taps
            .instruction_register(tree.opcode(chain)?, read_enable, write_enable)?;
        let mut captured = self.taps.write_ir(&ir)?;
        if self.inverted {
            captured = captured.not();
        }
        let expected = self.taps.expected_ir_capture();
        if captured != expected {
            ir_bad.report(&format!(
                "{}: instruction register scanned out {}, expected {}",
                tree.path(chain),
                captured.state(),
                expected.state()
            ))?;
        }
        Ok(())
    }
}

impl<C: Cable> JtagTester for CableTester<C> {
    fn configure(&mut self, volts: f32, khz: u32) -> Result<()> {
        check_khz(khz)?;
        self.taps.sm.cable.set_tap_voltage(volts)?;
        self.taps.sm.cable.set_frequency(khz)?;
        self.volts = volts;
        self.khz = khz;
        self.reset()
    }

    fn reset(&mut self) -> Result<()> {
        match self.taps.sm.trst_reset() {
            Err(Error::Unsupported(_)) => self.taps.sm.mode_reset(),
            other => other,
        }
    }

    fn tms_reset(&mut self) -> Result<()> {
        self.taps.sm.mode_reset()
    }

    fn set_logic_output(&mut self, index: usize, level: bool) -> Result<()> {
        let out = self.logic_outputs.get_mut(index).ok_or_else(|| {
            Error::Config(format!(
                "logic output {} outside allowed range 0..{}",
                index, NUM_LOGIC_OUTPUTS
            ))
        })?;
        *out = level;
        Ok(())
    }

    fn logic_outputs(&self) -> &[bool] {
        &self.logic_outputs
    }

    fn is_scan_out_inverted(&self) -> bool {
        self.inverted
    }

    fn set_scan_out_inverted(&mut self, inverted: bool) -> Result<()> {
        self.inverted = inverted;
        Ok(())
    }

    fn tap_state(&self) -> Option<JtagState> {
        Some(self.taps.sm.state())
    }

    fn shift(
        &mut self,
        tree: &ScanTree,
        chain: NodeId,
        read_enable: bool,
        write_enable: bool,
        ir_bad: Severity,
    ) -> Result<ShiftOutcome> {
        self.load_instruction(tree, chain, read_enable, write_enable, ir_bad)?;

        let bits = tree.bits(chain)?;
        let mut out_bits = BitVector::zeros(0, bits.out_bits.name());
        if bits.is_empty() {
            return Ok(ShiftOutcome {
                out_bits,
                write_mismatches: Vec::new(),
            });
        }
        if !bits.in_bits.is_fully_valid() {
            log::warn!(
                "{} has unknown in-bits, shifting them in as 0: {}",
                tree.path(chain),
                bits.in_bits.state()
            );
        }

        out_bits = self.taps.read_write_dr(&bits.in_bits)?;
        if self.inverted {
            out_bits = out_bits.not();
        }
        out_bits.set_name(bits.out_bits.name());

        let ir_length = tree.ir_length(tree.parent_chip(chain)?)?;
        let padded = pad_opcode(tree.opcode(chain)?, ir_length, false, false)?;
        if is_bypass_opcode(&padded) && !out_bits.is_zero()? {
            ir_bad.report(&format!(
                "{}: bypass register scanned out {}, expected all zeros",
                tree.path(chain),
                out_bits.state()
            ))?;
        }

        let mut write_mismatches = Vec::new();
        if let (true, Some(model)) = (write_enable, self.observer.as_deref_mut()) {
            let mut written = BitVector::zeros(bits.len(), "written");
            for (ind, p) in tree.bit_policies(chain)?.iter().enumerate() {
                written.set(ind, p.writeable());
            }
            for set in 0..2 {
                write_mismatches.extend(check_data_nets(model, tree, chain, set, &written)?);
            }
        }
        Ok(ShiftOutcome {
            out_bits,
            write_mismatches,
        })
    }

    fn shift_one_bit(
        &mut self,
        tree: &ScanTree,
        chain: NodeId,
        read_enable: bool,
        write_enable: bool,
        ir_bad: Severity,
    ) -> Result<bool> {
        // every bypass register recaptures 0 on each scan, so a lone bit can't cross one
        let chips = tree.chips().len();
        if chips != 1 {
            return Err(Error::Unsupported(format!(
                "one-bit shift of {} needs a single TAP on the scan chain, found {}",
                tree.path(chain),
                chips
            )));
        }
        let bits = tree.bits(chain)?;
        if bits.is_empty() {
            return Err(Error::Config(format!(
                "one-bit shift of {}, which has no bits",
                tree.path(chain)
            )));
        }
        self.load_instruction(tree, chain, read_enable, write_enable, ir_bad)?;

        let bit = bits.in_bits.value(bits.len() - 1).unwrap_or(false);
        let mut one = BitVector::zeros(1, "one bit");
        one.set(0, bit);
        let out = self.taps.read_write_dr(&one)?;
        Ok(out.get(0) ^ self.inverted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cable::sim::{SimRegister, SimulatedChain};
    use crate::error::Severities;
    use crate::simulation::{NetlistModel, NodeState};
    use crate::policy::DataNet;

    fn system(irlens: &[usize], target: usize, opcode: &str, len: usize) -> (ScanTree, NodeId) {
        let mut t = ScanTree::new("sys");
        let root = t.root();
        let mut chain = None;
        for (i, irlen) in irlens.iter().enumerate() {
            let chip = t.create_chip(&format!("chip{}", i), *irlen, "").unwrap();
            t.add_child(root, Some(chip));
            if i == target {
                let c = t.create_chain("data", opcode, len, "").unwrap();
                t.add_child(chip, Some(c));
                chain = Some(c);
            }
        }
        (t, chain.unwrap())
    }

    fn cable_tester(tree: &ScanTree) -> CableTester<SimulatedChain> {
        CableTester::new(SimulatedChain::from_tree(tree).unwrap()).unwrap()
    }

    #[test]
    fn configure_checks_clock_range() {
        let (t, _) = system(&[4], 0, "01", 3);
        let mut tester = cable_tester(&t);
        assert!(matches!(tester.configure(1.0, 100), Err(Error::Config(_))));
        assert!(tester.configure(1.0, 50_000).is_err());
        tester.configure(1.8, 10_000).unwrap();
        assert_eq!(tester.cable().frequency_khz(), 10_000);
        assert_eq!(tester.cable().tap_volts(), 1.8);
        assert_eq!(tester.cable().trst_pulses(), 1);
        assert_eq!(tester.tap_state(), Some(JtagState::Idle));
    }

    #[test]
    fn logic_outputs_are_bounded() {
        let (t, _) = system(&[4], 0, "01", 3);
        let mut tester = cable_tester(&t);
        tester.set_logic_output(7, true).unwrap();
        assert!(tester.logic_outputs()[7]);
        assert!(matches!(tester.set_logic_output(8, true), Err(Error::Config(_))));
    }

    #[test]
    fn shift_through_bypassed_neighbours() {
        let (mut t, chain) = system(&[4, 6, 5], 1, "0011", 5);
        let mut tester = cable_tester(&t);
        t.bits_mut(chain).unwrap().in_bits.put_str(0, "10110").unwrap();
        let out = tester.shift(&t, chain, false, true, Severity::Fatal).unwrap();
        assert_eq!(out.out_bits.state(), "00000");
        assert_eq!(tester.cable().instruction(1).unwrap(), "010011");
        assert_eq!(tester.cable().instruction(0).unwrap(), "1111");

        t.bits_mut(chain).unwrap().in_bits.put_str(0, "00000").unwrap();
        let out = tester.shift(&t, chain, false, true, Severity::Fatal).unwrap();
        assert_eq!(out.out_bits.state(), "10110");
    }

    #[test]
    fn inverted_scan_out_is_corrected() {
        let (mut t, chain) = system(&[4], 0, "01", 4);
        let mut sim = SimulatedChain::from_tree(&t).unwrap();
        sim.set_scan_out_inverted(true);
        let mut tester = CableTester::new(sim).unwrap();

        // left uncorrected, the IR capture looks wrong
        assert!(tester.shift(&t, chain, false, false, Severity::Fatal).is_err());

        tester.set_scan_out_inverted(true).unwrap();
        t.bits_mut(chain).unwrap().in_bits.put_str(0, "1100").unwrap();
        tester.shift(&t, chain, false, false, Severity::Fatal).unwrap();
        t.bits_mut(chain).unwrap().in_bits.put_str(0, "0000").unwrap();
        let out = tester.shift(&t, chain, false, false, Severity::Fatal).unwrap();
        assert_eq!(out.out_bits.state(), "1100");
    }

    #[test]
    fn inverting_loopback() {
        let (mut t, chain) = system(&[8], 0, "1001", 12);
        let mut sim = SimulatedChain::from_tree(&t).unwrap();
        sim.set_register(0, "1001", SimRegister::InvertingLoopback).unwrap();
        let mut tester = CableTester::new(sim).unwrap();
        t.bits_mut(chain).unwrap().in_bits.put_str(0, "100111010001").unwrap();
        let out = tester.shift(&t, chain, true, true, Severity::Fatal).unwrap();
        assert_eq!(out.out_bits.state(), "011000101110");
    }

    #[test]
    fn zero_length_chain_only_loads_the_instruction() {
        let (t, chain) = system(&[5], 0, "110", 0);
        let mut tester = cable_tester(&t);
        let out = tester.shift(&t, chain, true, false, Severity::Fatal).unwrap();
        assert!(out.out_bits.is_empty());
        assert_eq!(tester.cable().instruction(0).unwrap(), "10110");
    }

    #[test]
    fn bypass_chain_must_scan_out_zero() {
        let (mut t, chain) = system(&[4], 0, "11", 2);
        let mut tester = cable_tester(&t);
        t.bits_mut(chain).unwrap().in_bits.put_str(0, "01").unwrap();
        // the bypass register captured 0, then passes the first bit shifted in
        let out = tester.shift(&t, chain, false, false, Severity::NonFatal).unwrap();
        assert_eq!(out.out_bits.state(), "10");
        assert!(tester.shift(&t, chain, false, false, Severity::Fatal).is_err());
    }

    #[test]
    fn one_bit_shift() {
        let (mut t, chain) = system(&[4], 0, "01", 3);
        let mut tester = cable_tester(&t);
        t.bits_mut(chain).unwrap().in_bits.put_str(0, "001").unwrap();
        let quiet = Severities::QUIET.ir_bad;
        let outs: Vec<bool> = (0..4)
            .map(|_| tester.shift_one_bit(&t, chain, false, false, quiet).unwrap())
            .collect();
        assert_eq!(outs, [false, false, false, true]);

        let (t, chain) = system(&[4, 4], 0, "01", 3);
        let mut tester = cable_tester(&t);
        assert!(matches!(
            tester.shift_one_bit(&t, chain, false, false, quiet),
            Err(Error::Unsupported(_))
        ));
    }

    #[test]
    fn observer_reports_nets_that_missed_a_write() {
        let (mut t, chain) = system(&[4], 0, "01", 2);
        t.set_data_net(chain, 0, Some(DataNet::new("x.q"))).unwrap();
        t.set_writeable(chain, true).unwrap();
        let mut model = NetlistModel::new();
        model.set_net("x.q[0]", NodeState::High);
        model.set_net("x.q[1]", NodeState::High);
        let mut tester = cable_tester(&t).with_observer(Box::new(model));
        t.bits_mut(chain).unwrap().in_bits.put_str(0, "10").unwrap();
        let out = tester.shift(&t, chain, false, true, Severity::Fatal).unwrap();
        assert_eq!(out.write_mismatches.len(), 1);
        assert!(out.write_mismatches[0].contains("x.q[1]"));
        let out = tester.shift(&t, chain, false, false, Severity::Fatal).unwrap();
        assert!(out.write_mismatches.is_empty());
    }
}
