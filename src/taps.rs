//! A convenience wrapper for JTAG scan chains with multiple TAPs present.  `Taps` allows the
//! client to interact with one selected TAP as if it were the only TAP in the chain, so that the
//! client doesn't have to deal with putting the other TAPs into bypass and shifting data through
//! the bypass registers.
//!
//! Bit vectors here use the crate-wide order: index 0 is nearest TDI, so the last index is
//! clocked out first and the first scanned-out bit lands in the last index.  The instruction
//! register of the whole system is the concatenation of every TAP's register in chain order,
//! the first TAP nearest TDI.
use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;

use bitvec::prelude::*;

use crate::bitvector::BitVector;
use crate::cable::Cable;
use crate::error::{Error, Result};
use crate::statemachine::{JtagSM, Register};

/// Number of instruction register bits taken by the read-enable and write-enable flags.
pub const NUM_ENABLE_BITS: usize = 2;

/// Left-pad `opcode` with zeros to `ir_length` bits, then store the enables: character 0 is
/// read-enable and character 1 is write-enable.
pub fn pad_opcode(
    opcode: &str,
    ir_length: usize,
    read_enable: bool,
    write_enable: bool,
) -> Result<String> {
    let n = opcode.chars().count();
    if n == 0 || n > ir_length {
        return Err(Error::Config(format!(
            "opcode length {} of '{}' is outside allowed range 1..={}",
            n, opcode, ir_length
        )));
    }
    if let Some(bad) = opcode.chars().find(|c| *c != '0' && *c != '1') {
        return Err(Error::Config(format!(
            "bad character '{}' in opcode '{}', only 0 and 1 allowed",
            bad, opcode
        )));
    }
    let mut buf: Vec<char> = core::iter::repeat('0')
        .take(ir_length - n)
        .chain(opcode.chars())
        .collect();
    if ir_length >= NUM_ENABLE_BITS {
        buf[0] = if read_enable { '1' } else { '0' };
        buf[1] = if write_enable { '1' } else { '0' };
    }
    Ok(buf.into_iter().collect())
}

/// Whether a padded opcode with both enables clear selects the bypass register: all ones
/// outside the enable bits.
pub fn is_bypass_opcode(padded: &str) -> bool {
    padded.len() > NUM_ENABLE_BITS
        && padded
            .chars()
            .skip(NUM_ENABLE_BITS)
            .all(|c| c == '1')
}

/// Serial order: last index first.  Unknown bits go out as 0.
pub fn to_serial(bits: &BitVector) -> BitVec {
    (0..bits.len())
        .rev()
        .map(|i| bits.value(i).unwrap_or(false))
        .collect()
}

/// Inverse of [`to_serial`]: the k-th bit clocked out lands at index `len-1-k`.
pub fn from_serial(serial: &BitSlice, name: &str) -> BitVector {
    let mut v = BitVector::zeros(serial.len(), name);
    let last = serial.len().saturating_sub(1);
    for (k, bit) in serial.iter().by_vals().enumerate() {
        v.set(last - k, bit);
    }
    v
}

/// Surround `bits` with `pre` zeros on the TDI side and `post` zeros on the TDO side.
pub fn pad_bits(bits: &BitVector, pre: usize, post: usize) -> BitVector {
    let mut padded = BitVector::zeros(pre, "")
        .cat(bits)
        .cat(&BitVector::zeros(post, ""));
    padded.set_name(bits.name());
    padded
}

/// Remove `pre` bits from the front and `post` bits from the back.
pub fn strip_bits(bits: &BitVector, pre: usize, post: usize) -> Result<BitVector> {
    if pre + post > bits.len() {
        return Err(Error::LengthMismatch {
            what: format!("stripping {} pad bits from {}", pre + post, bits.name()),
            expected: pre + post,
            actual: bits.len(),
        });
    }
    let mut v = bits.slice(pre, bits.len() - pre - post)?;
    v.set_name(bits.name());
    Ok(v)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Tap {
    irlen: usize,
}

pub struct Taps<C> {
    pub sm: JtagSM<C>,
    taps: Vec<Tap>,
    active: usize,
}

impl<C: Cable> Taps<C> {
    /// Create an object using an existing `JtagSM` object
    pub fn new(sm: JtagSM<C>) -> Self {
        Self {
            sm,
            taps: Vec::new(),
            active: 0,
        }
    }

    /// Add a TAP to the scan chain with the given instruction register length
    pub fn add_tap(&mut self, irlen: usize) {
        self.taps.push(Tap { irlen });
    }

    /// Replace the TAP list with one entry per IR length, in chain order.
    pub fn set_taps(&mut self, irlens: &[usize]) {
        self.taps = irlens.iter().map(|irlen| Tap { irlen: *irlen }).collect();
        self.active = 0;
    }

    pub fn len(&self) -> usize {
        self.taps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.taps.is_empty()
    }

    /// Select which TAP subsequent register accesses address.
    pub fn select_tap(&mut self, tap: usize) -> Result<()> {
        if tap >= self.taps.len() {
            return Err(Error::Config(format!(
                "TAP {} selected, but only {} on the scan chain",
                tap,
                self.taps.len()
            )));
        }
        self.active = tap;
        Ok(())
    }

    /// Total instruction register length of all TAPs.
    pub fn ir_length(&self) -> usize {
        self.taps.iter().map(|t| t.irlen).sum()
    }

    /// Bypass bits between TDI and the selected TAP.
    pub fn pre_bits(&self) -> usize {
        self.active
    }

    /// Bypass bits between the selected TAP and TDO.
    pub fn post_bits(&self) -> usize {
        self.taps.len().saturating_sub(self.active + 1)
    }

    /// System instruction register addressing `opcode` on the selected TAP, with every other TAP
    /// in BYPASS (all ones).
    pub fn instruction_register(
        &self,
        opcode: &str,
        read_enable: bool,
        write_enable: bool,
    ) -> Result<BitVector> {
        let mut ir = BitVector::zeros(self.ir_length(), "instruction register");
        let mut offset = 0;
        for (i, t) in self.taps.iter().enumerate() {
            if i == self.active {
                let padded = pad_opcode(opcode, t.irlen, read_enable, write_enable)?;
                ir.put_str(offset, &padded)?;
            } else {
                ir.set_range(offset..offset + t.irlen, true);
            }
            offset += t.irlen;
        }
        Ok(ir)
    }

    /// Every TAP captures `0...01` into its instruction register, the 1 nearest TDO.
    pub fn expected_ir_capture(&self) -> BitVector {
        let mut v = BitVector::zeros(self.ir_length(), "expected IR capture");
        let mut offset = 0;
        for t in &self.taps {
            offset += t.irlen;
            if t.irlen > 0 {
                v.set(offset - 1, true);
            }
        }
        v
    }

    /// Shift `ir` into the instruction registers, returning the captured bits.
    pub fn write_ir(&mut self, ir: &BitVector) -> Result<BitVector> {
        if ir.len() != self.ir_length() {
            return Err(Error::LengthMismatch {
                what: String::from("instruction register"),
                expected: self.ir_length(),
                actual: ir.len(),
            });
        }
        log::trace!("IR in  {}", ir.state());
        let out = self.sm.scan(Register::Instruction, &to_serial(ir))?;
        let out = from_serial(&out, "IR scan out");
        log::trace!("IR out {}", out.state());
        Ok(out)
    }

    /// Shift `dr` into the data register of the selected TAP, padding for the TAPs in bypass,
    /// and return the bits that came out of it.
    pub fn read_write_dr(&mut self, dr: &BitVector) -> Result<BitVector> {
        let (pre, post) = (self.pre_bits(), self.post_bits());
        let padded = pad_bits(dr, pre, post);
        log::trace!("DR in  {}", padded.state());
        let out = self.sm.scan(Register::Data, &to_serial(&padded))?;
        let out = from_serial(&out, dr.name());
        log::trace!("DR out {}", out.state());
        strip_bits(&out, pre, post)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cable::sim::{SimRegister, SimulatedChain};
    use proptest::prelude::*;

    #[test]
    fn opcode_padding_and_enables() {
        assert_eq!(pad_opcode("1001", 8, false, false).unwrap(), "00001001");
        assert_eq!(pad_opcode("1001", 8, true, false).unwrap(), "10001001");
        assert_eq!(pad_opcode("1001", 8, false, true).unwrap(), "01001001");
        assert!(pad_opcode("100100100", 8, true, true).is_err());
        assert!(pad_opcode("10a1", 8, true, true).is_err());
        assert!(pad_opcode("", 8, true, true).is_err());
    }

    #[test]
    fn bypass_opcode() {
        let padded = pad_opcode("111111", 8, false, false).unwrap();
        assert!(is_bypass_opcode(&padded));
        assert!(!is_bypass_opcode(&pad_opcode("111110", 8, false, false).unwrap()));
    }

    fn three_taps() -> Taps<SimulatedChain> {
        let mut sim = SimulatedChain::new();
        sim.add_chip(4);
        let target = sim.add_chip(6);
        sim.add_chip(5);
        sim.add_register(target, "0011", SimRegister::storage(5)).unwrap();
        let mut taps = Taps::new(JtagSM::new(sim).unwrap());
        taps.set_taps(&[4, 6, 5]);
        taps.select_tap(1).unwrap();
        taps
    }

    #[test]
    fn other_taps_get_bypass() {
        let taps = three_taps();
        let ir = taps.instruction_register("0011", true, false).unwrap();
        assert_eq!(ir.state(), "111110001111111");
        assert_eq!(taps.pre_bits(), 1);
        assert_eq!(taps.post_bits(), 1);
        assert_eq!(taps.expected_ir_capture().state(), "000100000100001");
    }

    #[test]
    fn ir_capture_and_dr_round_trip() {
        let mut taps = three_taps();
        let ir = taps.instruction_register("0011", true, true).unwrap();
        let captured = taps.write_ir(&ir).unwrap();
        assert_eq!(captured, taps.expected_ir_capture());

        let first: BitVector = "10110".parse().unwrap();
        let second: BitVector = "01101".parse().unwrap();
        let out = taps.read_write_dr(&first).unwrap();
        assert_eq!(out.state(), "00000");
        let out = taps.read_write_dr(&second).unwrap();
        assert_eq!(out, first);
    }

    #[test]
    fn select_out_of_range() {
        let mut taps = three_taps();
        assert!(matches!(taps.select_tap(3), Err(Error::Config(_))));
    }

    fn bit_string(max: usize) -> impl Strategy<Value = String> {
        proptest::collection::vec(prop_oneof![Just('0'), Just('1'), Just('X')], 0..max)
            .prop_map(|v| v.into_iter().collect())
    }

    proptest! {
        #[test]
        fn pad_then_strip_recovers_the_chain(s in bit_string(64), pre in 0usize..5, post in 0usize..5) {
            let bits: BitVector = s.parse().unwrap();
            let padded = pad_bits(&bits, pre, post);
            prop_assert_eq!(padded.len(), bits.len() + pre + post);
            prop_assert_eq!(strip_bits(&padded, pre, post).unwrap(), bits);
        }

        #[test]
        fn serial_order_is_reversible(s in "[01]{0,80}") {
            let bits: BitVector = s.parse().unwrap();
            let serial = to_serial(&bits);
            if !bits.is_empty() {
                prop_assert_eq!(serial[0], bits.get(bits.len() - 1));
            }
            prop_assert_eq!(from_serial(&serial, "x"), bits);
        }
    }
}
