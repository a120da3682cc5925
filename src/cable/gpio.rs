//! Bit-banged JTAG over `embedded-hal` pins.
use alloc::format;
use alloc::string::String;

use bitvec::prelude::*;
use embedded_hal::{
    delay::DelayNs,
    digital::{InputPin, OutputPin, PinState},
};

use crate::cable::Cable;
use crate::error::{Error, Result};

fn pin_err<E: embedded_hal::digital::Error>(e: E) -> Error {
    Error::Transport(format!("gpio pin: {:?}", e.kind()))
}

pub struct Gpio<Clk, Tdi, Tdo, Tms, Trst, Delay>
where
    Clk: OutputPin,
    Tdi: OutputPin,
    Tdo: InputPin,
    Tms: OutputPin,
    Trst: OutputPin,
    Delay: DelayNs,
{
    half_period: u32,
    delay: Delay,
    clock: Clk,
    tdi: Tdi,
    tdo: Tdo,
    tms: Tms,
    trst: Option<Trst>,
}

impl<Clk, Tdi, Tdo, Tms, Trst, Delay> Gpio<Clk, Tdi, Tdo, Tms, Trst, Delay>
where
    Clk: OutputPin,
    Tdi: OutputPin,
    Tdo: InputPin,
    Tms: OutputPin,
    Trst: OutputPin,
    Delay: DelayNs,
{
    /// `trst` is optional; without it only TMS resets are possible.
    pub fn new(
        freq_khz: u32,
        clock: Clk,
        tdi: Tdi,
        tdo: Tdo,
        tms: Tms,
        trst: Option<Trst>,
        delay: Delay,
    ) -> Self {
        Gpio {
            half_period: Self::half_period(freq_khz),
            clock,
            tdi,
            tdo,
            tms,
            trst,
            delay,
        }
    }

    fn half_period(freq_khz: u32) -> u32 {
        let period_ns = 1_000_000 / freq_khz.max(1);
        period_ns / 2
    }

    /// One TCK cycle: clock high, sample TDO, clock low.
    fn clock_bit(&mut self) -> Result<bool> {
        self.clock.set_high().map_err(pin_err)?;
        let tdo = self.tdo.is_high().map_err(pin_err)?;
        self.delay.delay_ns(self.half_period);
        self.clock.set_low().map_err(pin_err)?;
        self.delay.delay_ns(self.half_period);
        Ok(tdo)
    }
}

impl<Clk, Tdi, Tdo, Tms, Trst, Delay> Cable for Gpio<Clk, Tdi, Tdo, Tms, Trst, Delay>
where
    Clk: OutputPin,
    Tdi: OutputPin,
    Tdo: InputPin,
    Tms: OutputPin,
    Trst: OutputPin,
    Delay: DelayNs,
{
    fn change_mode(&mut self, tms: &[usize], tdi: bool) -> Result<()> {
        // clock starts low
        self.tdi.set_state(PinState::from(tdi)).map_err(pin_err)?;

        for d in tms {
            let state = match d {
                0 => PinState::Low,
                _ => PinState::High,
            };
            self.tms.set_state(state).map_err(pin_err)?;
            self.clock_bit()?;
        }
        Ok(())
    }

    fn read_write_data(&mut self, data: &BitSlice, exit_after: bool) -> Result<BitVec> {
        let mut out = BitVec::with_capacity(data.len());
        self.tms.set_low().map_err(pin_err)?;
        for (i, bit) in data.iter().by_vals().enumerate() {
            self.tdi.set_state(PinState::from(bit)).map_err(pin_err)?;
            if exit_after && i == data.len() - 1 {
                self.tms.set_high().map_err(pin_err)?;
            }
            out.push(self.clock_bit()?);
        }
        Ok(out)
    }

    fn pulse_trst(&mut self) -> Result<()> {
        let half_period = self.half_period;
        let Some(trst) = self.trst.as_mut() else {
            return Err(Error::Unsupported(String::from("no TRST pin configured")));
        };
        trst.set_low().map_err(pin_err)?;
        self.delay.delay_ns(half_period * 2);
        trst.set_high().map_err(pin_err)?;
        self.delay.delay_ns(half_period * 2);
        Ok(())
    }

    fn set_frequency(&mut self, khz: u32) -> Result<()> {
        self.half_period = Self::half_period(khz);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::rc::Rc;
    use alloc::vec::Vec;
    use core::cell::{Cell, RefCell};
    use core::convert::Infallible;
    use embedded_hal::digital::ErrorType;

    #[derive(Clone, Default)]
    struct Wire(Rc<Cell<bool>>);

    impl ErrorType for Wire {
        type Error = Infallible;
    }

    impl OutputPin for Wire {
        fn set_low(&mut self) -> core::result::Result<(), Infallible> {
            self.0.set(false);
            Ok(())
        }

        fn set_high(&mut self) -> core::result::Result<(), Infallible> {
            self.0.set(true);
            Ok(())
        }
    }

    /// TDO reads the complement of TDI.
    struct Inverter(Wire);

    impl ErrorType for Inverter {
        type Error = Infallible;
    }

    impl InputPin for Inverter {
        fn is_high(&mut self) -> core::result::Result<bool, Infallible> {
            Ok(!self.0 .0.get())
        }

        fn is_low(&mut self) -> core::result::Result<bool, Infallible> {
            Ok(self.0 .0.get())
        }
    }

    /// Records TMS at every rising clock edge.
    struct Clock {
        tms: Wire,
        seen: Rc<RefCell<Vec<bool>>>,
    }

    impl ErrorType for Clock {
        type Error = Infallible;
    }

    impl OutputPin for Clock {
        fn set_low(&mut self) -> core::result::Result<(), Infallible> {
            Ok(())
        }

        fn set_high(&mut self) -> core::result::Result<(), Infallible> {
            self.seen.borrow_mut().push(self.tms.0.get());
            Ok(())
        }
    }

    struct NoDelay;

    impl DelayNs for NoDelay {
        fn delay_ns(&mut self, _ns: u32) {}
    }

    fn cable() -> (Gpio<Clock, Wire, Inverter, Wire, Wire, NoDelay>, Rc<RefCell<Vec<bool>>>, Wire) {
        let tdi = Wire::default();
        let tms = Wire::default();
        let trst = Wire::default();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let clock = Clock {
            tms: tms.clone(),
            seen: seen.clone(),
        };
        let gpio = Gpio::new(
            1000,
            clock,
            tdi.clone(),
            Inverter(tdi),
            tms,
            Some(trst.clone()),
            NoDelay,
        );
        (gpio, seen, trst)
    }

    #[test]
    fn tms_sequence_is_clocked() {
        let (mut g, seen, _) = cable();
        g.change_mode(&[1, 1, 0, 1], true).unwrap();
        assert_eq!(*seen.borrow(), [true, true, false, true]);
    }

    #[test]
    fn shift_samples_tdo_and_exits_on_last_bit() {
        let (mut g, seen, _) = cable();
        let data = bitvec![1, 0, 0, 1, 1];
        let out = g.read_write_data(&data, true).unwrap();
        assert_eq!(out, bitvec![0, 1, 1, 0, 0]);
        assert_eq!(*seen.borrow(), [false, false, false, false, true]);
    }

    #[test]
    fn trst_ends_high() {
        let (mut g, _, trst) = cable();
        g.pulse_trst().unwrap();
        assert!(trst.0.get());
    }
}
