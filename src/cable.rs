//! Bit-level access to a JTAG port.  Hardware adapters and software models implement the `Cable`
//! trait; everything above it deals only in TMS sequences and bit slices.
pub mod gpio;
pub mod sim;

use alloc::boxed::Box;
use alloc::string::String;

use bitvec::prelude::*;

use crate::error::{Error, Result};

pub trait Cable {
    /// Clock out a series of TMS values to change the state of the TAP controllers.  Each element
    /// of `tms` determines the value of the TMS line, zero for low and any other value for high.
    /// `tdi` is held on the TDI line while the mode changes.
    fn change_mode(&mut self, tms: &[usize], tdi: bool) -> Result<()>;

    /// Shift `data` out on TDI while sampling TDO.  `data[0]` is the first bit clocked and the
    /// returned vector holds the TDO sample of each clock in the same order.  Should be called in
    /// ShiftIR or ShiftDR.  If `exit_after` is true TMS is raised on the last bit, leaving the
    /// controllers in Exit1IR or Exit1DR, otherwise the state doesn't change.
    fn read_write_data(&mut self, data: &BitSlice, exit_after: bool) -> Result<BitVec>;

    /// Like `read_write_data`, discarding what comes out.
    fn write_data(&mut self, data: &BitSlice, exit_after: bool) -> Result<()> {
        self.read_write_data(data, exit_after).map(|_| ())
    }

    /// Sample `bits` bits from TDO while clocking out all ones.
    fn read_data(&mut self, bits: usize, exit_after: bool) -> Result<BitVec> {
        let ones = BitVec::<usize, Lsb0>::repeat(true, bits);
        self.read_write_data(&ones, exit_after)
    }

    /// Pulse the asynchronous TRST line low then high.
    fn pulse_trst(&mut self) -> Result<()> {
        Err(Error::Unsupported(String::from("cable has no TRST line")))
    }

    /// Change the TCK frequency.  Cables with a fixed clock ignore this.
    fn set_frequency(&mut self, _khz: u32) -> Result<()> {
        Ok(())
    }

    /// Change the TAP signal voltage.  Cables with fixed levels ignore this.
    fn set_tap_voltage(&mut self, _volts: f32) -> Result<()> {
        Ok(())
    }
}

impl<C: Cable + ?Sized> Cable for Box<C> {
    fn change_mode(&mut self, tms: &[usize], tdi: bool) -> Result<()> {
        (**self).change_mode(tms, tdi)
    }

    fn read_write_data(&mut self, data: &BitSlice, exit_after: bool) -> Result<BitVec> {
        (**self).read_write_data(data, exit_after)
    }

    fn write_data(&mut self, data: &BitSlice, exit_after: bool) -> Result<()> {
        (**self).write_data(data, exit_after)
    }

    fn read_data(&mut self, bits: usize, exit_after: bool) -> Result<BitVec> {
        (**self).read_data(bits, exit_after)
    }

    fn pulse_trst(&mut self) -> Result<()> {
        (**self).pulse_trst()
    }

    fn set_frequency(&mut self, khz: u32) -> Result<()> {
        (**self).set_frequency(khz)
    }

    fn set_tap_voltage(&mut self, volts: f32) -> Result<()> {
        (**self).set_tap_voltage(volts)
    }
}
