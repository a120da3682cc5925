//! Path-based control of a scan chain system.
//!
//! [`ChainControl`] owns the [`ScanTree`] and the tester that shifts it.  Nodes are addressed by
//! dotted paths starting at the chip, e.g. `chip.chain.subchain`.  Buffers of a subchain are the
//! slice of its root chain's buffers at the subchain's bit offset.
use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;

use serde::{Deserialize, Serialize};

use crate::bitvector::BitVector;
use crate::config::ControlConfig;
use crate::error::{Error, Result, Severities, Severity};
use crate::tester::JtagTester;
use crate::tree::{ChainBits, NodeId, ScanTree};

/// Which chatter a [`ChainControl`] logs at `info`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogFlags {
    /// Every in-bit assignment.
    pub log_set: bool,
    /// Every shift.
    pub log_other: bool,
}

pub struct ChainControl<T> {
    tree: ScanTree,
    pub tester: T,
    config: ControlConfig,
    pub log: LogFlags,
}

impl<T: JtagTester> ChainControl<T> {
    /// Take ownership of `tree` and `tester`, and configure the tester with the TAP voltage and
    /// clock from `config`.  Logging starts out as `config.log` says.
    pub fn new(tree: ScanTree, mut tester: T, config: ControlConfig) -> Result<Self> {
        tester.configure(config.tap_volts, config.tap_khz)?;
        Ok(Self {
            tree,
            tester,
            log: config.log,
            config,
        })
    }

    pub fn tree(&self) -> &ScanTree {
        &self.tree
    }

    pub fn tree_mut(&mut self) -> &mut ScanTree {
        &mut self.tree
    }

    pub fn config(&self) -> &ControlConfig {
        &self.config
    }

    pub fn jtag_volts(&self) -> f32 {
        self.config.tap_volts
    }

    /// Change the TAP voltage; the tester is reconfigured.
    pub fn set_jtag_volts(&mut self, volts: f32) -> Result<()> {
        self.tester.configure(volts, self.config.tap_khz)?;
        self.config.tap_volts = volts;
        Ok(())
    }

    pub fn jtag_khz(&self) -> u32 {
        self.config.tap_khz
    }

    /// Change the TCK frequency; the tester is reconfigured.
    pub fn set_jtag_khz(&mut self, khz: u32) -> Result<()> {
        self.tester.configure(self.config.tap_volts, khz)?;
        self.config.tap_khz = khz;
        Ok(())
    }

    pub fn severities(&self) -> Severities {
        self.config.severities
    }

    /// Severities used by [`ChainControl::shift`].
    pub fn set_severities(&mut self, severities: Severities) {
        self.config.severities = severities;
    }

    pub fn find_node(&self, path: &str) -> Result<NodeId> {
        self.tree.find_path(path)
    }

    fn find_kind(&self, path: &str, expected: &'static str) -> Result<NodeId> {
        let id = self.find_node(path)?;
        let actual = self.tree.node(id).kind().label();
        if actual != expected {
            return Err(Error::WrongKind {
                path: String::from(path),
                expected,
                actual,
            });
        }
        Ok(id)
    }

    fn find_chip(&self, path: &str) -> Result<NodeId> {
        self.find_kind(path, "chip")
    }

    fn find_chain(&self, path: &str) -> Result<NodeId> {
        self.find_kind(path, "chain")
    }

    /// A chain or subchain.
    fn find_bits(&self, path: &str) -> Result<NodeId> {
        let id = self.find_node(path)?;
        match self.tree.node(id).kind().label() {
            "chain" | "subchain" => Ok(id),
            actual => Err(Error::WrongKind {
                path: String::from(path),
                expected: "chain or subchain",
                actual,
            }),
        }
    }

    /// Number of scan elements in the chain or subchain at `path`.
    pub fn length(&self, path: &str) -> Result<usize> {
        Ok(self.tree.node(self.find_bits(path)?).length())
    }

    fn view(&self, path: &str, pick: fn(&ChainBits) -> &BitVector, suffix: &str) -> Result<BitVector> {
        let (chain, offset, len) = self.tree.subchain_span(self.find_bits(path)?)?;
        let mut v = pick(self.tree.bits(chain)?).slice(offset, len)?;
        v.set_name(&format!("{}.{}", path, suffix));
        Ok(v)
    }

    /// Bits to be shifted in on the next shift.
    pub fn in_bits(&self, path: &str) -> Result<BitVector> {
        self.view(path, |b| &b.in_bits, "inBits")
    }

    /// Bits scanned out by the last shift.
    pub fn out_bits(&self, path: &str) -> Result<BitVector> {
        self.view(path, |b| &b.out_bits, "outBits")
    }

    /// What the last shift expected to scan out.
    pub fn expected_bits(&self, path: &str) -> Result<BitVector> {
        self.view(path, |b| &b.old_out_bits_expected, "expectedBits")
    }

    /// Shadow register state, where known.
    pub fn shadow_state(&self, path: &str) -> Result<BitVector> {
        self.view(path, |b| &b.shadow_state, "shadowState")
    }

    /// Replace the in-bits of the chain or subchain at `path`, validity included.
    pub fn set_in_bits(&mut self, path: &str, bits: &BitVector) -> Result<()> {
        let (chain, offset, len) = self.tree.subchain_span(self.find_bits(path)?)?;
        if bits.len() != len {
            return Err(Error::LengthMismatch {
                what: format!("in-bits of {}", path),
                expected: len,
                actual: bits.len(),
            });
        }
        if self.log.log_set {
            log::info!("{}.inBits = {}", path, bits.state());
        }
        self.tree.bits_mut(chain)?.in_bits.put_indiscriminate(offset, bits)
    }

    /// Like [`ChainControl::set_in_bits`], from a `0`/`1`/`X` string.
    pub fn set_in_bits_str(&mut self, path: &str, bits: &str) -> Result<()> {
        let bits = BitVector::from_str_named(bits, "setInBits")?;
        self.set_in_bits(path, &bits)
    }

    /// Set every in-bit at `path` to `value`.
    pub fn fill_in_bits(&mut self, path: &str, value: bool) -> Result<()> {
        let len = self.length(path)?;
        let mut bits = BitVector::zeros(len, "setInBits");
        bits.set_range(0..len, value);
        self.set_in_bits(path, &bits)
    }

    /// Reset the in-bits of every chain, to 0 or to their master-clear state.
    pub fn reset_in_bits(&mut self, use_master_clear_state: bool) -> Result<()> {
        for chip in self.tree.chips() {
            for chain in self.tree.chains(chip) {
                self.tree.reset_in_bits(chain, use_master_clear_state)?;
            }
        }
        Ok(())
    }

    /// Apply master clear to the shadow state of every chain on `chip`.
    pub fn process_master_clear(&mut self, chip: &str) -> Result<()> {
        for chain in self.chains_of(chip)? {
            self.tree.process_master_clear(chain)?;
        }
        Ok(())
    }

    /// Forget what every chain on `chip` is expected to scan out.
    pub fn invalidate(&mut self, chip: &str) -> Result<()> {
        for chain in self.chains_of(chip)? {
            self.tree.invalidate_chain(chain)?;
        }
        Ok(())
    }

    /// Shift the root chain at `path` with the configured severities.
    pub fn shift(&mut self, path: &str, read_enable: bool, write_enable: bool) -> Result<bool> {
        let sevs = self.config.severities;
        self.shift_with(path, read_enable, write_enable, &sevs)
    }

    /// Shift the root chain at `path`.  Returns whether the scanned-out bits matched and every
    /// write landed; failures at [`Severity::Fatal`] are errors instead.
    pub fn shift_with(
        &mut self,
        path: &str,
        read_enable: bool,
        write_enable: bool,
        sevs: &Severities,
    ) -> Result<bool> {
        let chain = self.find_chain(path)?;
        self.tree
            .shift_chain(&mut self.tester, chain, read_enable, write_enable, sevs, &self.log)
    }

    /// Shift a single bit through the root chain at `path`, returning the bit scanned out.
    pub fn shift_one_bit(
        &mut self,
        path: &str,
        read_enable: bool,
        write_enable: bool,
        ir_bad: Severity,
    ) -> Result<bool> {
        let chain = self.find_chain(path)?;
        let sevs = Severities {
            ir_bad,
            ..self.config.severities
        };
        self.tree
            .shift_one_bit(&mut self.tester, chain, read_enable, write_enable, &sevs, &self.log)
    }

    /// Call `listener` after every shift of the chain at `path`.
    pub fn add_shift_listener<F>(&mut self, path: &str, listener: F) -> Result<()>
    where
        F: FnMut(&ScanTree, NodeId) + 'static,
    {
        let chain = self.find_chain(path)?;
        self.tree.add_shift_listener(chain, listener);
        Ok(())
    }

    /// Paths of every chip, in daisy-chain order.
    pub fn chips(&self) -> Vec<String> {
        self.tree.chips().into_iter().map(|c| self.tree.path(c)).collect()
    }

    fn chains_of(&self, chip: &str) -> Result<Vec<NodeId>> {
        let chip = self.find_chip(chip)?;
        let chains = self.tree.node(chip).children().to_vec();
        if let Some(bad) = chains.iter().find(|c| !self.tree.node(**c).is_chain()) {
            return Err(Error::WrongKind {
                path: self.tree.path(*bad),
                expected: "chain",
                actual: self.tree.node(*bad).kind().label(),
            });
        }
        Ok(chains)
    }

    /// Paths of every root chain on `chip`.
    pub fn chain_paths_of(&self, chip: &str) -> Result<Vec<String>> {
        Ok(self
            .chains_of(chip)?
            .into_iter()
            .map(|c| self.tree.path(c))
            .collect())
    }

    /// Paths of every root chain in the system.
    pub fn chain_paths(&self) -> Result<Vec<String>> {
        let mut paths = Vec::new();
        for chip in self.chips() {
            paths.extend(self.chain_paths_of(&chip)?);
        }
        Ok(paths)
    }

    /// Paths of every node below `path`, in pre-order.
    pub fn descendents(&self, path: &str) -> Result<Vec<String>> {
        let id = self.find_node(path)?;
        Ok(self
            .tree
            .descendents(id)
            .into_iter()
            .map(|n| self.tree.path(n))
            .collect())
    }

    /// Path of the root chain containing `path`.
    pub fn parent_chain(&self, path: &str) -> Result<String> {
        let chain = self.tree.parent_chain(self.find_bits(path)?)?;
        Ok(self.tree.path(chain))
    }

    /// Instruction register length of one chip.
    pub fn ir_length(&self, chip: &str) -> Result<usize> {
        self.tree.ir_length(self.find_chip(chip)?)
    }

    /// Instruction register length of the whole system.
    pub fn total_ir_length(&self) -> Result<usize> {
        self.tree
            .chips()
            .into_iter()
            .map(|c| self.tree.ir_length(c))
            .sum()
    }

    pub fn opcode(&self, chain: &str) -> Result<&str> {
        self.tree.opcode(self.find_chain(chain)?)
    }

    pub fn subchain_pin(&self, path: &str) -> Result<Option<&str>> {
        Ok(self.tree.node(self.find_kind(path, "subchain")?).pin())
    }

    pub fn set_subchain_pin(&mut self, path: &str, pin: &str) -> Result<()> {
        let id = self.find_kind(path, "subchain")?;
        self.tree.set_pin(id, Some(pin))
    }

    /// Release the tester.
    pub fn disconnect(&mut self) -> Result<()> {
        self.tester.disconnect()
    }
}
