//! Bench instruments that a chain test drives besides the JTAG tester.
//!
//! Instruments talk a line-based command protocol (IEEE 488.2 / SCPI style) over some
//! [`Transport`]: GPIB, a serial port, a socket.  [`Instrument`] adds the framing and error
//! reporting every such device needs.  What a device can do is expressed through small
//! capability traits ([`VoltageReadable`], [`CurrentReadable`], [`PowerChannel`],
//! [`LogicSettable`]) so tests only depend on the part they use.
use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;

use crate::error::{Error, Result};
use crate::tester::JtagTester;

/// Byte stream to one instrument.
pub trait Transport {
    fn write(&mut self, data: &str) -> Result<()>;
    /// Read one reply of at most `max_len` bytes.
    fn read(&mut self, max_len: usize) -> Result<String>;
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn write(&mut self, data: &str) -> Result<()> {
        (**self).write(data)
    }

    fn read(&mut self, max_len: usize) -> Result<String> {
        (**self).read(max_len)
    }
}

/// Longest reply [`Instrument::query`] accepts.
pub const MAX_REPLY: usize = 200;
/// At most this many entries are drained from an error queue.
pub const MAX_QUEUED_ERRORS: usize = 16;

/// Error bits of the IEEE 488.2 standard event status register.
const EVENT_STATUS_ERRORS: [(u8, &str); 4] = [
    (0x04, "query error"),
    (0x08, "device-dependent error"),
    (0x10, "execution error"),
    (0x20, "command error"),
];

/// Names of the error bits set in an event status byte.
pub fn decode_event_status(status: u8) -> Vec<&'static str> {
    EVENT_STATUS_ERRORS
        .iter()
        .filter(|(bit, _)| status & bit != 0)
        .map(|(_, name)| *name)
        .collect()
}

pub struct Instrument<T> {
    name: String,
    transport: T,
    checking_status: bool,
}

impl<T: Transport> Instrument<T> {
    pub fn new(name: &str, transport: T) -> Self {
        Self {
            name: String::from(name),
            transport,
            checking_status: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Send one command line.
    pub fn write(&mut self, command: &str) -> Result<()> {
        log::trace!("{} <- {}", self.name, command);
        self.transport.write(&format!("{}\n", command))
    }

    /// Read one reply, surrounding whitespace removed.
    pub fn read(&mut self, max_len: usize) -> Result<String> {
        let reply = self.transport.read(max_len)?;
        let reply = String::from(reply.trim());
        log::trace!("{} -> {}", self.name, reply);
        Ok(reply)
    }

    pub fn query(&mut self, command: &str) -> Result<String> {
        self.write(command)?;
        self.read(MAX_REPLY)
    }

    /// Query a number.  A reply that doesn't parse is [`Error::MalformedResponse`].
    pub fn query_f32(&mut self, command: &str) -> Result<f32> {
        let reply = self.query(command)?;
        reply.parse().map_err(|_| Error::MalformedResponse {
            command: String::from(command),
            reply,
        })
    }

    pub fn query_u8(&mut self, command: &str) -> Result<u8> {
        let reply = self.query(command)?;
        reply
            .trim_start_matches('+')
            .parse()
            .map_err(|_| Error::MalformedResponse {
                command: String::from(command),
                reply,
            })
    }

    /// Send a command, then check that the instrument accepted it.
    pub fn write_checked(&mut self, command: &str) -> Result<()> {
        self.write(command)?;
        self.check_status()
    }

    /// Read the event status register.  Error bits become an [`Error::Transport`] carrying
    /// their names and whatever the error queue holds.  Does nothing when called while a status
    /// check is already running.
    pub fn check_status(&mut self) -> Result<()> {
        if self.checking_status {
            return Ok(());
        }
        self.checking_status = true;
        let result = self.read_status();
        self.checking_status = false;
        result
    }

    fn read_status(&mut self) -> Result<()> {
        let status = self.query_u8("*ESR?")?;
        let errors = decode_event_status(status);
        if errors.is_empty() {
            return Ok(());
        }
        let queued = self.drain_errors()?;
        let mut msg = format!("{}: {}", self.name, errors.join(", "));
        for q in &queued {
            msg.push_str("; ");
            msg.push_str(q);
        }
        Err(Error::Transport(msg))
    }

    /// Read the error queue until it reports no error, at most [`MAX_QUEUED_ERRORS`] entries.
    pub fn drain_errors(&mut self) -> Result<Vec<String>> {
        let mut errors = Vec::new();
        for _ in 0..MAX_QUEUED_ERRORS {
            let reply = self.query("SYST:ERR?")?;
            let code = reply.split(',').next().unwrap_or("").trim();
            match code.trim_start_matches('+').parse::<i32>() {
                Ok(0) => return Ok(errors),
                Ok(_) => errors.push(reply),
                Err(_) => {
                    return Err(Error::MalformedResponse {
                        command: String::from("SYST:ERR?"),
                        reply,
                    })
                }
            }
        }
        log::warn!(
            "{}: error queue still not empty after {} reads",
            self.name,
            MAX_QUEUED_ERRORS
        );
        Ok(errors)
    }
}

pub trait VoltageReadable {
    fn read_voltage(&mut self) -> Result<f32>;
}

pub trait CurrentReadable {
    fn read_current(&mut self) -> Result<f32>;
}

/// Volts a settled supply may differ from its setpoint.
pub const SETTLE_TOLERANCE: f32 = 0.01;
/// Readbacks [`PowerChannel::set_voltage_wait`] makes before giving up.
pub const SETTLE_READS: usize = 50;

/// A supply output whose voltage can be set and read back.
pub trait PowerChannel: VoltageReadable + CurrentReadable {
    /// Change the setpoint and return at once.
    fn set_voltage_no_wait(&mut self, volts: f32) -> Result<()>;

    fn voltage_setpoint(&mut self) -> Result<f32>;

    /// Change the setpoint and poll the output until it is within [`SETTLE_TOLERANCE`].
    fn set_voltage_wait(&mut self, volts: f32) -> Result<()> {
        self.set_voltage_no_wait(volts)?;
        let mut last = f32::NAN;
        for _ in 0..SETTLE_READS {
            last = self.read_voltage()?;
            let error = last - volts;
            if (-SETTLE_TOLERANCE..=SETTLE_TOLERANCE).contains(&error) {
                return Ok(());
            }
        }
        Err(Error::Transport(format!(
            "supply did not settle at {} V, last read {} V",
            volts, last
        )))
    }
}

/// A digital output that can be driven and read back.
pub trait LogicSettable {
    fn set_logic(&mut self, high: bool) -> Result<()>;
    fn is_logic_high(&mut self) -> Result<bool>;
}

/// A supply set by hand: every change is a request to the operator.  Reads return the
/// setpoint and no current.
pub struct ManualPowerChannel {
    name: String,
    volts: f32,
}

impl ManualPowerChannel {
    pub fn new(name: &str) -> Self {
        Self {
            name: String::from(name),
            volts: 0.0,
        }
    }
}

impl VoltageReadable for ManualPowerChannel {
    fn read_voltage(&mut self) -> Result<f32> {
        Ok(self.volts)
    }
}

impl CurrentReadable for ManualPowerChannel {
    fn read_current(&mut self) -> Result<f32> {
        Ok(0.0)
    }
}

impl PowerChannel for ManualPowerChannel {
    fn set_voltage_no_wait(&mut self, volts: f32) -> Result<()> {
        log::warn!("please set supply {} to {} V", self.name, volts);
        self.volts = volts;
        Ok(())
    }

    fn voltage_setpoint(&mut self) -> Result<f32> {
        Ok(self.volts)
    }
}

/// One output of a programmable supply, addressed with SCPI commands.
pub struct ScpiSupply<T> {
    pub instrument: Instrument<T>,
    channel: u8,
}

impl<T: Transport> ScpiSupply<T> {
    pub fn new(instrument: Instrument<T>, channel: u8) -> Self {
        Self {
            instrument,
            channel,
        }
    }

    fn select(&mut self) -> Result<()> {
        self.instrument
            .write_checked(&format!("INST:NSEL {}", self.channel))
    }

    /// Current limit of the output.
    pub fn set_current_limit(&mut self, amps: f32) -> Result<()> {
        self.select()?;
        self.instrument.write_checked(&format!("CURR {}", amps))
    }

    pub fn set_output(&mut self, on: bool) -> Result<()> {
        self.select()?;
        self.instrument
            .write_checked(if on { "OUTP ON" } else { "OUTP OFF" })
    }
}

impl<T: Transport> VoltageReadable for ScpiSupply<T> {
    fn read_voltage(&mut self) -> Result<f32> {
        self.select()?;
        self.instrument.query_f32("MEAS:VOLT?")
    }
}

impl<T: Transport> CurrentReadable for ScpiSupply<T> {
    fn read_current(&mut self) -> Result<f32> {
        self.select()?;
        self.instrument.query_f32("MEAS:CURR?")
    }
}

impl<T: Transport> PowerChannel for ScpiSupply<T> {
    fn set_voltage_no_wait(&mut self, volts: f32) -> Result<()> {
        self.select()?;
        self.instrument.write_checked(&format!("VOLT {}", volts))
    }

    fn voltage_setpoint(&mut self) -> Result<f32> {
        self.select()?;
        self.instrument.query_f32("VOLT?")
    }
}

/// One logic output of a JTAG tester.
pub struct TesterLogicOutput<'a, J: ?Sized> {
    tester: &'a mut J,
    index: usize,
}

impl<'a, J: JtagTester + ?Sized> TesterLogicOutput<'a, J> {
    pub fn new(tester: &'a mut J, index: usize) -> Self {
        Self { tester, index }
    }
}

impl<J: JtagTester + ?Sized> LogicSettable for TesterLogicOutput<'_, J> {
    fn set_logic(&mut self, high: bool) -> Result<()> {
        self.tester.set_logic_output(self.index, high)
    }

    fn is_logic_high(&mut self) -> Result<bool> {
        self.tester
            .logic_outputs()
            .get(self.index)
            .copied()
            .ok_or_else(|| Error::Config(format!("no logic output {}", self.index)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::collections::VecDeque;
    use alloc::vec;

    /// Records writes and answers reads from a script.
    #[derive(Default)]
    struct Script {
        written: Vec<String>,
        replies: VecDeque<String>,
    }

    impl Script {
        fn new(replies: &[&str]) -> Self {
            Self {
                written: Vec::new(),
                replies: replies.iter().map(|r| String::from(*r)).collect(),
            }
        }
    }

    impl Transport for Script {
        fn write(&mut self, data: &str) -> Result<()> {
            self.written.push(String::from(data));
            Ok(())
        }

        fn read(&mut self, max_len: usize) -> Result<String> {
            let mut reply = self
                .replies
                .pop_front()
                .ok_or_else(|| Error::Transport(String::from("read timed out")))?;
            reply.truncate(max_len);
            Ok(reply)
        }
    }

    #[test]
    fn framing_and_numbers() {
        let mut inst = Instrument::new("dmm", Script::new(&[" 1.25\r\n", "abc"]));
        assert_eq!(inst.query_f32("MEAS:VOLT?").unwrap(), 1.25);
        assert_eq!(
            inst.query_f32("MEAS:CURR?"),
            Err(Error::MalformedResponse {
                command: String::from("MEAS:CURR?"),
                reply: String::from("abc"),
            })
        );
        assert_eq!(inst.transport().written, ["MEAS:VOLT?\n", "MEAS:CURR?\n"]);
        assert!(matches!(inst.read(10), Err(Error::Transport(_))));
    }

    #[test]
    fn status_errors_carry_the_queue() {
        assert_eq!(decode_event_status(0x00), Vec::<&str>::new());
        assert_eq!(decode_event_status(0x31), ["execution error", "command error"]);

        let mut inst = Instrument::new(
            "psu",
            Script::new(&[
                "+32",
                "-113,\"Undefined header\"",
                "-221,\"Settings conflict\"",
                "+0,\"No error\"",
            ]),
        );
        let err = inst.write_checked("VOLTS 3").unwrap_err();
        assert_eq!(
            err,
            Error::Transport(String::from(
                "psu: command error; -113,\"Undefined header\"; -221,\"Settings conflict\""
            ))
        );

        let mut inst = Instrument::new("psu", Script::new(&["0"]));
        inst.write_checked("VOLT 3").unwrap();
        assert_eq!(inst.transport().written, ["VOLT 3\n", "*ESR?\n"]);
    }

    #[test]
    fn error_queue_is_bounded() {
        let replies = vec!["-100,\"Command error\""; MAX_QUEUED_ERRORS + 4];
        let mut inst = Instrument::new("psu", Script::new(&replies));
        assert_eq!(inst.drain_errors().unwrap().len(), MAX_QUEUED_ERRORS);

        let mut inst = Instrument::new("psu", Script::new(&["garbage"]));
        assert!(matches!(
            inst.drain_errors(),
            Err(Error::MalformedResponse { .. })
        ));
    }

    #[test]
    fn scpi_supply_settles() {
        let script = Script::new(&["0", "0", "0", "1.1", "0", "1.5", "0", "0.02"]);
        let mut psu = ScpiSupply::new(Instrument::new("psu", script), 2);
        psu.set_voltage_wait(1.5).unwrap();
        assert_eq!(psu.read_current().unwrap(), 0.02);
        let written = &psu.instrument.transport().written;
        assert_eq!(written[0], "INST:NSEL 2\n");
        assert_eq!(written[2], "VOLT 1.5\n");
        assert_eq!(written[6], "MEAS:VOLT?\n");

        let mut stuck = Script::new(&["0", "0"]);
        for _ in 0..SETTLE_READS {
            stuck.replies.push_back(String::from("0"));
            stuck.replies.push_back(String::from("0.3"));
        }
        let mut psu = ScpiSupply::new(Instrument::new("psu", stuck), 1);
        assert!(matches!(psu.set_voltage_wait(1.0), Err(Error::Transport(_))));
    }

    #[test]
    fn manual_supply_reports_setpoint() {
        let mut psu = ManualPowerChannel::new("vdd");
        psu.set_voltage_wait(0.9).unwrap();
        assert_eq!(psu.voltage_setpoint().unwrap(), 0.9);
        assert_eq!(psu.read_current().unwrap(), 0.0);
    }

    #[test]
    fn tester_logic_output() {
        use crate::cable::sim::SimulatedChain;
        use crate::tester::CableTester;

        let mut tester = CableTester::new(SimulatedChain::new()).unwrap();
        let mut out = TesterLogicOutput::new(&mut tester, 3);
        out.set_logic(true).unwrap();
        assert!(out.is_logic_high().unwrap());
        let mut bad = TesterLogicOutput::new(&mut tester, 8);
        assert!(matches!(bad.set_logic(true), Err(Error::Config(_))));
    }
}
