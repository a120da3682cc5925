//! Bring-up tests for the scan chains of a system.
//!
//! [`ChainTest`] checks chain lengths, shifts pseudorandom patterns through every chain and
//! compares what comes back, and sweeps supply voltage and TCK frequency to map where the
//! chains work.  Patterns come from a fixed-seed [`SmallRng`], so a failing run can be repeated
//! bit for bit.
use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::bitvector::BitVector;
use crate::control::ChainControl;
use crate::error::{Error, Result, Severities, Severity};
use crate::instrument::{ManualPowerChannel, PowerChannel};
use crate::tester::{JtagTester, MIN_KHZ};

/// Seed of the pattern generator.
pub const SEED: u64 = 1256;
/// Default frequency step of a schmoo.
pub const DEFAULT_KHZ_STEP: u32 = 1000;
/// Default voltage step of a schmoo.
pub const DEFAULT_MV_STEP: u32 = 100;
/// How many chain lengths of zeros [`ChainTest::measure_length`] flushes through a chain.
pub const LENGTH_MULTIPLIER: usize = 100;

/// One voltage/frequency point of a schmoo.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SchmooPoint {
    pub millivolts: u32,
    pub khz: u32,
    pub passed: bool,
}

/// One point of a supply voltage sweep.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SweepPoint {
    pub volts: f32,
    pub passed: bool,
    /// Supply current read back after the test.
    pub amps: f32,
}

pub struct ChainTest<'a, T, P = ManualPowerChannel> {
    control: &'a mut ChainControl<T>,
    supply: P,
    rng: SmallRng,
    /// Read enable used by every shift of the tests.
    pub read_enable: bool,
    /// Write enable used by every shift of the tests.
    pub write_enable: bool,
    num_tests: usize,
    mv_low: u32,
    mv_high: u32,
    mv_step: u32,
    khz_low: u32,
    khz_high: u32,
    khz_step: u32,
}

fn round_to(value: f32, step: u32) -> u32 {
    let steps = (value / step as f32 + 0.5) as u32;
    steps * step
}

impl<'a, T: JtagTester> ChainTest<'a, T> {
    /// A test without a controllable supply; voltage changes are requested from the operator.
    pub fn without_supply(control: &'a mut ChainControl<T>) -> Self {
        ChainTest::new(control, ManualPowerChannel::new("fake"))
    }
}

impl<'a, T: JtagTester, P: PowerChannel> ChainTest<'a, T, P> {
    /// The schmoo ranges default to 95% to 105% of the TAP voltage and 80% to 100% of the TAP
    /// clock.
    pub fn new(control: &'a mut ChainControl<T>, supply: P) -> Self {
        let mv = 1000.0 * control.jtag_volts();
        let mv_high = round_to(1.05 * mv, DEFAULT_MV_STEP);
        let mut mv_low = round_to(0.95 * mv, DEFAULT_MV_STEP);
        if mv_low == mv_high {
            mv_low = mv_high.saturating_sub(DEFAULT_MV_STEP);
        }
        let khz_high = control.jtag_khz();
        let mut khz_low = round_to(0.8 * khz_high as f32, DEFAULT_KHZ_STEP);
        if khz_low == khz_high {
            khz_low = khz_high.saturating_sub(DEFAULT_KHZ_STEP).max(MIN_KHZ);
        }
        Self {
            control,
            supply,
            rng: SmallRng::seed_from_u64(SEED),
            read_enable: false,
            write_enable: false,
            num_tests: 5,
            mv_low,
            mv_high,
            mv_step: DEFAULT_MV_STEP,
            khz_low,
            khz_high,
            khz_step: DEFAULT_KHZ_STEP,
        }
    }

    pub fn control(&mut self) -> &mut ChainControl<T> {
        self.control
    }

    pub fn supply(&mut self) -> &mut P {
        &mut self.supply
    }

    pub fn num_tests(&self) -> usize {
        self.num_tests
    }

    /// Number of random patterns each chain test compares.
    pub fn set_num_tests(&mut self, num_tests: usize) {
        self.num_tests = num_tests;
    }

    /// Schmoo voltage range as `(low, high, step)` volts.
    pub fn vdd_range(&self) -> (f32, f32, f32) {
        (
            self.mv_low as f32 / 1000.0,
            self.mv_high as f32 / 1000.0,
            self.mv_step as f32 / 1000.0,
        )
    }

    pub fn set_vdd_range(&mut self, low: f32, high: f32, step: f32) {
        self.mv_low = (low * 1000.0 + 0.5) as u32;
        self.mv_high = (high * 1000.0 + 0.5) as u32;
        self.mv_step = (step * 1000.0 + 0.5) as u32;
    }

    /// Schmoo frequency range as `(low, high, step)` kHz.
    pub fn khz_range(&self) -> (u32, u32, u32) {
        (self.khz_low, self.khz_high, self.khz_step)
    }

    pub fn set_khz_range(&mut self, low: u32, high: u32, step: u32) {
        self.khz_low = low;
        self.khz_high = high;
        self.khz_step = step;
    }

    /// `n` pseudorandom bits, all valid.
    pub fn random_bits(&mut self, n: usize) -> BitVector {
        let mut bits = BitVector::zeros(n, "randomBits");
        for i in 0..n {
            bits.set(i, self.rng.gen::<bool>());
        }
        bits
    }

    /// Measure the true length of the chain at `chain`.
    ///
    /// The chain is flushed with zeros, then ones are clocked in one bit at a time until the
    /// first one appears at TDO.  A length that differs from the described length is reported
    /// at `severity`.  Needs a tester that can shift single bits.
    pub fn measure_length(&mut self, chain: &str, severity: Severity) -> Result<usize> {
        if self.read_enable || self.write_enable {
            log::warn!(
                "measuring length of {} with read or write enable set, results may be wrong",
                chain
            );
        }
        let expected = self.control.length(chain)?;
        if expected == 0 {
            return Err(Error::Config(format!(
                "can't measure the length of {}, which has no bits",
                chain
            )));
        }
        let mut in_bits = BitVector::zeros(expected, "measureLength");
        self.control.set_in_bits(chain, &in_bits)?;
        let flush = Severities {
            ir_bad: Severity::Fatal,
            no_test: Severity::NoMessage,
            err_test: Severity::NoMessage,
        };
        for _ in 0..LENGTH_MULTIPLIER {
            self.control
                .shift_with(chain, self.read_enable, self.write_enable, &flush)?;
        }
        if !self.control.out_bits(chain)?.is_zero()? {
            Severity::Fatal.report(&format!(
                "shifted {} zeros into chain {} {} times in a row, and the last shift still \
                 scanned out a one; the chain is broken or longer than {} bits",
                expected,
                chain,
                LENGTH_MULTIPLIER,
                LENGTH_MULTIPLIER * expected
            ))?;
        }

        in_bits.set(expected - 1, true);
        self.control.set_in_bits(chain, &in_bits)?;
        let limit = LENGTH_MULTIPLIER * expected + 1;
        let mut shifts = 0;
        loop {
            let bit = self.control.shift_one_bit(
                chain,
                self.read_enable,
                self.write_enable,
                Severity::Fatal,
            )?;
            shifts += 1;
            if bit {
                break;
            }
            if shifts > limit {
                Severity::Fatal.report(&format!(
                    "no one came out of chain {} after {} single-bit shifts",
                    chain, shifts
                ))?;
            }
        }
        let measured = shifts - 1;
        if measured != expected {
            severity.report(&format!(
                "chain {} has described length {}, but measured length is {}",
                chain, expected, measured
            ))?;
        }
        Ok(measured)
    }

    /// Measure every chain in the system.  Returns whether all lengths are as described.
    pub fn test_lengths(&mut self, severity: Severity) -> Result<bool> {
        let mut status = true;
        for (i, chain) in self.control.chain_paths()?.iter().enumerate() {
            log::info!("Verifying length, chain {}: {}", i, chain);
            let length = self.measure_length(chain, severity)?;
            if length == self.control.length(chain)? {
                log::info!("{}: passed", chain);
            } else {
                log::info!("{}: failed; change length to {}", chain, length);
                status = false;
            }
        }
        Ok(status)
    }

    /// Shift random patterns through `chain` and check each comes back on the next shift.
    /// Mismatches are reported at `err_test`; returns `false` on the first one that isn't fatal.
    pub fn test_one_chain(&mut self, chain: &str, err_test: Severity) -> Result<bool> {
        let len = self.control.length(chain)?;
        let bits = self.random_bits(len);
        self.control.set_in_bits(chain, &bits)?;
        self.control
            .shift_with(chain, self.read_enable, self.write_enable, &Severities::QUIET)?;

        let sevs = Severities {
            ir_bad: Severity::NoMessage,
            no_test: Severity::Fatal,
            err_test,
        };
        for _ in 0..self.num_tests {
            let bits = self.random_bits(len);
            self.control.set_in_bits(chain, &bits)?;
            if !self
                .control
                .shift_with(chain, self.read_enable, self.write_enable, &sevs)?
            {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Like [`ChainTest::test_one_chain`], but checks the shadow register: every pattern is
    /// written, then read back with read enable while different bits are shifted in.
    pub fn test_one_chain_shadow(&mut self, chain: &str, err_test: Severity) -> Result<bool> {
        let id = self.control.find_node(chain)?;
        let policy = *self.control.tree().policy(id);
        if !policy.readable || !policy.writeable() || !policy.uses_shadow() {
            Severity::Fatal.report(&format!(
                "chain {} has access {}, but a read-write shadow register is needed to test it",
                chain,
                policy.mode()
            ))?;
        }
        let len = self.control.length(chain)?;
        let bits = self.random_bits(len);
        self.control.set_in_bits(chain, &bits)?;
        self.control.shift_with(chain, false, false, &Severities::QUIET)?;

        let sevs = Severities {
            ir_bad: Severity::NoMessage,
            no_test: Severity::Fatal,
            err_test,
        };
        for _ in 0..self.num_tests {
            let bits = self.random_bits(len);
            self.control.set_in_bits(chain, &bits)?;
            self.control.shift_with(chain, false, true, &Severities::QUIET)?;

            let bits = self.random_bits(len);
            self.control.set_in_bits(chain, &bits)?;
            if !self.control.shift_with(chain, true, false, &sevs)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Run [`ChainTest::test_one_chain`] on every chain of `chip`.  Returns the number of
    /// chains that failed.
    pub fn test_all_chains(&mut self, chip: &str, err_test: Severity) -> Result<usize> {
        let chains = self.control.chain_paths_of(chip)?;
        let mut failed = 0;
        for (i, chain) in chains.iter().enumerate() {
            if self.test_one_chain(chain, err_test)? {
                log::info!("dual shift to chain {}: {} passed", i, chain);
            } else {
                log::info!("dual shift to chain {}: {} failed", i, chain);
                failed += 1;
            }
        }
        if failed > 0 {
            log::error!(
                "{} out of {} chains failed on chip {}",
                failed,
                chains.len(),
                chip
            );
        }
        Ok(failed)
    }

    /// Run [`ChainTest::test_all_chains`] on every chip.
    pub fn test_system(&mut self, err_test: Severity) -> Result<usize> {
        let mut failed = 0;
        for chip in self.control.chips() {
            failed += self.test_all_chains(&chip, err_test)?;
        }
        if failed > 0 {
            log::error!("{} chains failed in system", failed);
        }
        Ok(failed)
    }

    fn check_steps(&self) -> Result<()> {
        if self.mv_step == 0 || self.khz_step == 0 {
            return Err(Error::Config(String::from(
                "schmoo voltage and frequency steps must be nonzero",
            )));
        }
        Ok(())
    }

    /// One test at the current operating point.  A fatal mismatch counts as a failure.
    fn test_point(&mut self, chain: &str, shadow: bool) -> Result<bool> {
        let outcome = if shadow {
            self.test_one_chain_shadow(chain, Severity::NoMessage)
        } else {
            self.test_one_chain(chain, Severity::NoMessage)
        };
        match outcome {
            Ok(passed) => Ok(passed),
            Err(Error::Verification(msg)) => {
                log::debug!("{}: {}", chain, msg);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Test `chain` at every supply voltage and TCK frequency of the schmoo ranges.  With
    /// `pulse_reset` the tester is reset after each voltage change.  The tester is set back to
    /// the configured TAP voltage and clock afterwards.
    pub fn schmoo(&mut self, chain: &str, shadow: bool, pulse_reset: bool) -> Result<Vec<SchmooPoint>> {
        self.check_steps()?;
        log::info!("Generating schmoo plot for chain {}", chain);
        let volts = self.control.jtag_volts();
        let mut points = Vec::new();
        let mut mv = self.mv_low;
        while mv <= self.mv_high {
            self.supply.set_voltage_wait(mv as f32 / 1000.0)?;
            if pulse_reset {
                self.control.tester.reset()?;
            }
            let mut khz = self.khz_low;
            while khz <= self.khz_high {
                self.control.tester.configure(volts, khz)?;
                let passed = self.test_point(chain, shadow)?;
                log::info!("vdd {} mV, {} kHz: {}", mv, khz, if passed { "pass" } else { "fail" });
                points.push(SchmooPoint {
                    millivolts: mv,
                    khz,
                    passed,
                });
                khz += self.khz_step;
            }
            mv += self.mv_step;
        }
        self.control.tester.configure(volts, self.control.jtag_khz())?;
        log::info!("finished testing {}", chain);
        Ok(points)
    }

    /// Test `chain` at every supply voltage of the schmoo range, at the configured clock,
    /// recording the supply current at each point.
    pub fn vdd_sweep(&mut self, chain: &str) -> Result<Vec<SweepPoint>> {
        self.check_steps()?;
        let mut points = Vec::new();
        let mut mv = self.mv_low;
        while mv <= self.mv_high {
            let volts = mv as f32 / 1000.0;
            self.supply.set_voltage_wait(volts)?;
            let passed = self.test_point(chain, false)?;
            let amps = self.supply.read_current()?;
            log::info!("vdd {} V: {}, {} A", volts, if passed { "pass" } else { "fail" }, amps);
            points.push(SweepPoint {
                volts,
                passed,
                amps,
            });
            mv += self.mv_step;
        }
        Ok(points)
    }

    /// First power-up of a system: optionally check lengths, test every chain, then schmoo the
    /// longest chain.
    pub fn bringup(&mut self, test_lengths: bool) -> Result<Vec<SchmooPoint>> {
        if test_lengths && !self.test_lengths(Severity::NonFatal)? {
            return Err(Error::Verification(String::from(
                "chain lengths are wrong; fix the description and run again",
            )));
        }
        self.test_system(Severity::Fatal)?;
        let mut longest: Option<(String, usize)> = None;
        for chain in self.control.chain_paths()? {
            let len = self.control.length(&chain)?;
            if longest.as_ref().map_or(true, |(_, l)| len > *l) {
                longest = Some((chain, len));
            }
        }
        match longest {
            Some((chain, _)) => self.schmoo(&chain, false, false),
            None => Ok(Vec::new()),
        }
    }
}
