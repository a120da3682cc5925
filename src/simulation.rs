//! Direct access to a simulated chip's nets, and the bypass-scanning tester built on it.
//!
//! When a chain's elements name their data nets, a simulation doesn't need to clock bits
//! through the scan path at all: [`BypassTester`] reads those nets to produce the out-bits and
//! forces them to write the in-bits.  The bit-level contract of a shift is unchanged.
use alloc::collections::BTreeMap;
use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

use crate::bitvector::BitVector;
use crate::error::{Error, Result, Severity};
use crate::policy::DataNet;
use crate::statemachine::JtagState;
use crate::tester::{check_khz, JtagTester, ShiftOutcome};
use crate::tree::{NodeId, ScanTree};

/// Logic level of a simulated net.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeState {
    Low,
    High,
    /// Between the logic thresholds.
    Undefined,
}

impl NodeState {
    pub fn value(self) -> Option<bool> {
        match self {
            NodeState::Low => Some(false),
            NodeState::High => Some(true),
            NodeState::Undefined => None,
        }
    }
}

impl From<bool> for NodeState {
    fn from(high: bool) -> Self {
        if high {
            NodeState::High
        } else {
            NodeState::Low
        }
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeState::Low => "0",
            NodeState::High => "1",
            NodeState::Undefined => "undefined",
        };
        f.write_str(s)
    }
}

/// A running simulation whose nets can be observed and forced by name.
pub trait SimulationModel {
    /// Current state of `node`.  A net the simulation doesn't know is [`Error::NotFound`].
    fn node_state(&mut self, node: &str) -> Result<NodeState>;

    /// Force `node` to a logic level until released.
    fn set_node_state(&mut self, node: &str, high: bool) -> Result<()>;

    /// Stop forcing `nodes`.
    fn release_nodes(&mut self, nodes: &[String]) -> Result<()>;

    /// Advance simulated time.
    fn wait_ns(&mut self, ns: f64) -> Result<()>;

    fn simulation_time_ns(&self) -> f64;

    /// Whether direct reads and writes may trust known shadow register state instead of
    /// touching the nets.
    fn optimized_direct_reads_writes(&self) -> bool {
        false
    }

    /// Force every net of a bus; `state[i]` drives `nodes[i]`.
    fn set_bus_state(&mut self, nodes: &[&str], state: &BitVector) -> Result<()> {
        if nodes.len() != state.len() {
            return Err(Error::LengthMismatch {
                what: format!("bus state {}", state.name()),
                expected: nodes.len(),
                actual: state.len(),
            });
        }
        for (ind, node) in nodes.iter().enumerate() {
            self.set_node_state(node, state.try_get(ind)?)?;
        }
        Ok(())
    }

    /// Read every net of a bus.  Undefined nets come back as unknown bits.
    fn bus_state(&mut self, nodes: &[&str], name: &str) -> Result<BitVector> {
        let mut v = BitVector::new(nodes.len(), name);
        for (ind, node) in nodes.iter().enumerate() {
            if let Some(high) = self.node_state(node)?.value() {
                v.set(ind, high);
            }
        }
        Ok(v)
    }
}

#[derive(Clone, Copy, Debug)]
struct Net {
    state: NodeState,
    forced: bool,
    stuck: bool,
}

/// An in-memory table of named nets.  A forced value stays after release, like a latch node;
/// stuck nets ignore writes.
#[derive(Clone, Debug, Default)]
pub struct NetlistModel {
    nets: BTreeMap<String, Net>,
    time_ns: f64,
    optimized: bool,
}

impl NetlistModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Define `name` or change its state, as the circuit itself would.
    pub fn set_net(&mut self, name: &str, state: NodeState) {
        let net = self.nets.entry(String::from(name)).or_insert(Net {
            state,
            forced: false,
            stuck: false,
        });
        net.state = state;
    }

    /// Hold `name` at `state` regardless of writes.
    pub fn stick(&mut self, name: &str, state: NodeState) {
        self.set_net(name, state);
        if let Some(net) = self.nets.get_mut(name) {
            net.stuck = true;
        }
    }

    pub fn is_forced(&self, name: &str) -> bool {
        self.nets.get(name).is_some_and(|n| n.forced)
    }

    pub fn set_optimized_direct_reads_writes(&mut self, enabled: bool) {
        self.optimized = enabled;
    }
}

impl SimulationModel for NetlistModel {
    fn node_state(&mut self, node: &str) -> Result<NodeState> {
        self.nets
            .get(node)
            .map(|n| n.state)
            .ok_or_else(|| Error::NotFound(String::from(node)))
    }

    fn set_node_state(&mut self, node: &str, high: bool) -> Result<()> {
        let net = self.nets.entry(String::from(node)).or_insert(Net {
            state: NodeState::Undefined,
            forced: false,
            stuck: false,
        });
        net.forced = true;
        if !net.stuck {
            net.state = NodeState::from(high);
        }
        Ok(())
    }

    fn release_nodes(&mut self, nodes: &[String]) -> Result<()> {
        for node in nodes {
            if let Some(net) = self.nets.get_mut(node) {
                net.forced = false;
            }
        }
        Ok(())
    }

    fn wait_ns(&mut self, ns: f64) -> Result<()> {
        self.time_ns += ns;
        Ok(())
    }

    fn simulation_time_ns(&self) -> f64 {
        self.time_ns
    }

    fn optimized_direct_reads_writes(&self) -> bool {
        self.optimized
    }
}

/// Compare the data nets of net set `set` (0 or 1) with the in-bits just written to `chain`.
/// Only bits marked in `written` are checked.  Returns one message per net in the wrong state.
pub fn check_data_nets<M: SimulationModel + ?Sized>(
    model: &mut M,
    tree: &ScanTree,
    chain: NodeId,
    set: usize,
    written: &BitVector,
) -> Result<Vec<String>> {
    let nets = tree.data_nets(chain, set)?;
    let bits = tree.bits(chain)?;
    if written.len() != nets.len() {
        log::warn!(
            "can't check data nets of {}: {} bits to check, chain has {}",
            tree.path(chain),
            written.len(),
            nets.len()
        );
        return Ok(Vec::new());
    }

    let mut mismatches = Vec::new();
    for (ind, net) in nets.iter().enumerate() {
        let Some(net) = net else { continue };
        if !net.writeable || written.value(ind) != Some(true) {
            continue;
        }
        let Some(want) = bits.in_bits.value(ind) else {
            continue;
        };
        let want = want ^ net.inverted;
        let state = model.node_state(&net.name)?;
        if state != NodeState::from(want) {
            mismatches.push(format!(
                "attempted to set bit '{}' to {} via the scan chain at time {} ns, but its state is {}",
                net.name,
                u8::from(want),
                model.simulation_time_ns(),
                state
            ));
        } else {
            log::debug!("checked {}: {}", net.name, state);
        }
    }
    Ok(mismatches)
}

/// A tester for simulations that skips the scan path: shifts read and force the data nets
/// named by the chain's elements.
pub struct BypassTester<M> {
    pub model: M,
    volts: f32,
    khz: u32,
    /// Half a TCK period.
    delay_ns: f64,
}

impl<M: SimulationModel> BypassTester<M> {
    pub fn new(model: M) -> Self {
        Self {
            model,
            volts: 0.0,
            khz: 0,
            delay_ns: 0.0,
        }
    }

    pub fn volts(&self) -> f32 {
        self.volts
    }

    pub fn khz(&self) -> u32 {
        self.khz
    }

    pub fn delay_ns(&self) -> f64 {
        self.delay_ns
    }

    /// Net value of one data net, corrected for inversion.  `None` if the net is missing, not
    /// readable or undefined.
    fn read_net(&mut self, net: Option<&DataNet>) -> Result<Option<bool>> {
        let Some(net) = net.filter(|n| n.readable) else {
            return Ok(None);
        };
        let state = match self.model.node_state(&net.name) {
            Ok(state) => state,
            Err(Error::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        if state == NodeState::Undefined {
            log::warn!(
                "read intermediate (undefined) voltage state from net {} at time {} ns",
                net.name,
                self.model.simulation_time_ns()
            );
        }
        Ok(state.value().map(|v| v ^ net.inverted))
    }

    /// Read every readable bit of `chain` from its data nets.  Bits that aren't readable are
    /// left unknown.
    pub fn read_direct(&mut self, tree: &ScanTree, chain: NodeId) -> Result<BitVector> {
        let policies = tree.bit_policies(chain)?;
        let nets = tree.data_nets(chain, 0)?;
        let nets2 = tree.data_nets(chain, 1)?;
        let bits = tree.bits(chain)?;
        let optimized = self.model.optimized_direct_reads_writes();

        let mut out = BitVector::new(bits.len(), "outBits");
        let mut read = 0;
        let mut optimized_reads = 0;
        for (ind, p) in policies.iter().enumerate() {
            if !p.readable {
                continue;
            }
            if optimized && p.uses_shadow() && !p.uses_dual_ported_shadow() {
                if let Some(v) = bits.shadow_state.value(ind) {
                    out.set(ind, v);
                    optimized_reads += 1;
                    continue;
                }
            }

            let first = self.read_net(nets[ind].as_ref())?;
            let second = self.read_net(nets2[ind].as_ref())?;
            if let (Some(a), Some(b)) = (first, second) {
                if a != b {
                    log::error!(
                        "inconsistency reading bit {} of chain {} directly: {:?} is {}, {:?} is {}",
                        ind,
                        tree.path(chain),
                        nets[ind].as_ref().map(|n| &n.name),
                        u8::from(a),
                        nets2[ind].as_ref().map(|n| &n.name),
                        u8::from(b)
                    );
                }
            }
            match first.or(second) {
                Some(v) => {
                    out.set(ind, v);
                    read += 1;
                }
                None => out.set(ind, bits.in_bits.value(ind).unwrap_or(false)),
            }
        }
        log::info!(
            "read directly {} bits from chain {} of length {} (others unchanged), {} optimized reads",
            read,
            tree.path(chain),
            bits.len(),
            optimized_reads
        );
        Ok(out)
    }

    /// Force the data nets of every writeable bit of `chain` to its in-bit, let the circuit
    /// settle for three half-periods, release, and wait one more.  Returns which bits were
    /// written.
    pub fn write_direct(&mut self, tree: &ScanTree, chain: NodeId) -> Result<BitVector> {
        let policies = tree.bit_policies(chain)?;
        let nets = tree.data_nets(chain, 0)?;
        let nets2 = tree.data_nets(chain, 1)?;
        let bits = tree.bits(chain)?;
        let optimized = self.model.optimized_direct_reads_writes();

        let mut written = BitVector::zeros(bits.len(), "bitsWritten");
        let mut forced: Vec<String> = Vec::new();
        let mut optimized_writes = 0;
        for (ind, p) in policies.iter().enumerate() {
            if !p.writeable() {
                continue;
            }
            let Some(state) = bits.in_bits.value(ind) else {
                log::warn!(
                    "could not write bit {} of chain {} because it is not in a valid state",
                    ind,
                    tree.path(chain)
                );
                continue;
            };
            // shadow registers only change through scan or master clear
            if optimized && p.has_any_shadow() && bits.shadow_state.value(ind) == Some(state) {
                optimized_writes += 1;
                continue;
            }
            for net in [&nets[ind], &nets2[ind]].into_iter().flatten() {
                if !net.writeable {
                    continue;
                }
                self.model.set_node_state(&net.name, state ^ net.inverted)?;
                forced.push(net.name.clone());
                written.set(ind, true);
            }
        }

        self.model.wait_ns(self.delay_ns * 3.0)?;
        self.model.release_nodes(&forced)?;
        self.model.wait_ns(self.delay_ns)?;
        log::info!(
            "wrote directly {} nets from chain {} of length {}, {} optimized writes",
            forced.len(),
            tree.path(chain),
            bits.len(),
            optimized_writes
        );
        Ok(written)
    }
}

impl<M: SimulationModel> JtagTester for BypassTester<M> {
    fn configure(&mut self, volts: f32, khz: u32) -> Result<()> {
        check_khz(khz)?;
        self.volts = volts;
        self.khz = khz;
        self.delay_ns = 1e6 / f64::from(khz) / 2.0;
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        Ok(())
    }

    fn tms_reset(&mut self) -> Result<()> {
        Ok(())
    }

    fn set_logic_output(&mut self, index: usize, level: bool) -> Result<()> {
        Err(Error::Unsupported(format!(
            "set_logic_output({}, {}) on a bypass tester; drive the net through the simulation",
            index, level
        )))
    }

    fn is_scan_out_inverted(&self) -> bool {
        false
    }

    fn is_bypass_scanning(&self) -> bool {
        true
    }

    fn tap_state(&self) -> Option<JtagState> {
        None
    }

    fn shift(
        &mut self,
        tree: &ScanTree,
        chain: NodeId,
        read_enable: bool,
        write_enable: bool,
        _ir_bad: Severity,
    ) -> Result<ShiftOutcome> {
        log::debug!("bypass-scanning {}", tree.path(chain));
        let bits = tree.bits(chain)?;
        let mut out_bits = if read_enable {
            let mut out = bits.out_bits.clone();
            let read = self.read_direct(tree, chain)?;
            for ind in 0..read.len() {
                if let Some(v) = read.value(ind) {
                    out.set(ind, v);
                }
            }
            out
        } else {
            bits.out_bits_expected.clone()
        };
        out_bits.set_name(bits.out_bits.name());

        let mut write_mismatches = Vec::new();
        if write_enable {
            let written = self.write_direct(tree, chain)?;
            for set in 0..2 {
                write_mismatches.extend(check_data_nets(&mut self.model, tree, chain, set, &written)?);
            }
        }
        Ok(ShiftOutcome {
            out_bits,
            write_mismatches,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// chain of 4: `a` 2 bits RW on nets `a.q`, `b` 2 bits RWS on nets `b.q` (inverted)
    fn tree() -> (ScanTree, NodeId) {
        let mut t = ScanTree::new("sys");
        let chip = t.create_chip("chip", 4, "").unwrap();
        let root = t.root();
        t.add_child(root, Some(chip));
        let chain = t.create_chain("c", "01", 4, "").unwrap();
        t.add_child(chip, Some(chain));
        let a = t.create_subchain("a", 2, "");
        let b = t.create_subchain("b", 2, "");
        t.add_child(chain, Some(a));
        t.add_child(chain, Some(b));
        t.set_policy(a, "RW".parse().unwrap());
        t.set_policy(b, "RWS".parse().unwrap());
        t.set_data_net(a, 0, Some(DataNet::new("a.q"))).unwrap();
        let mut inverted = DataNet::new("b.q");
        inverted.inverted = true;
        t.set_data_net(b, 0, Some(inverted)).unwrap();
        (t, chain)
    }

    fn configured(model: NetlistModel) -> BypassTester<NetlistModel> {
        let mut tester = BypassTester::new(model);
        tester.configure(1.0, 1000).unwrap();
        tester
    }

    #[test]
    fn delay_is_half_a_period() {
        let tester = configured(NetlistModel::new());
        assert_eq!(tester.delay_ns(), 500.0);
        assert!(tester.is_bypass_scanning());
    }

    #[test]
    fn write_then_read_back() {
        let (mut t, chain) = tree();
        t.bits_mut(chain).unwrap().in_bits.put_str(0, "1001").unwrap();
        let mut tester = configured(NetlistModel::new());
        let out = tester.shift(&t, chain, false, true, Severity::Fatal).unwrap();
        assert!(out.write_mismatches.is_empty());
        assert_eq!(tester.model.node_state("a.q[0]").unwrap(), NodeState::High);
        assert_eq!(tester.model.node_state("b.q[1]").unwrap(), NodeState::Low);
        assert!(!tester.model.is_forced("a.q[0]"));
        assert_eq!(tester.model.simulation_time_ns(), 2000.0);

        t.bits_mut(chain).unwrap().in_bits.put_str(0, "0000").unwrap();
        let out = tester.shift(&t, chain, true, false, Severity::Fatal).unwrap();
        assert_eq!(out.out_bits.state(), "1001");
    }

    #[test]
    fn stuck_net_is_a_write_mismatch() {
        let (mut t, chain) = tree();
        t.bits_mut(chain).unwrap().in_bits.put_str(0, "0100").unwrap();
        let mut model = NetlistModel::new();
        model.stick("a.q[1]", NodeState::Low);
        let mut tester = configured(model);
        let out = tester.shift(&t, chain, false, true, Severity::Fatal).unwrap();
        assert_eq!(out.write_mismatches.len(), 1);
        assert!(out.write_mismatches[0].contains("a.q[1]"));
    }

    #[test]
    fn unreadable_bits_fall_back() {
        let (mut t, chain) = tree();
        let a = t.find(chain, "a").unwrap();
        t.set_readable(a, false);
        {
            let bits = t.bits_mut(chain).unwrap();
            bits.in_bits.put_str(0, "1111").unwrap();
            bits.out_bits.put_str(0, "01XX").unwrap();
        }
        let mut model = NetlistModel::new();
        model.set_net("b.q[0]", NodeState::Undefined);
        let mut tester = configured(model);
        let out = tester.shift(&t, chain, true, false, Severity::Fatal).unwrap();
        // `a` unchanged, `b[0]` undefined and `b[1]` missing: both take the in-bit
        assert_eq!(out.out_bits.state(), "0111");
    }

    #[test]
    fn optimized_access_trusts_shadow_state() {
        let (mut t, chain) = tree();
        {
            let bits = t.bits_mut(chain).unwrap();
            bits.in_bits.put_str(0, "0011").unwrap();
            bits.shadow_state.put_str(0, "XX10").unwrap();
        }
        let mut model = NetlistModel::new();
        model.set_optimized_direct_reads_writes(true);
        let mut tester = configured(model);
        let written = tester.write_direct(&t, chain).unwrap();
        // b[0] already holds the wanted shadow value
        assert_eq!(written.state(), "1101");
        assert!(tester.model.node_state("b.q[0]").is_err());

        let read = tester.read_direct(&t, chain).unwrap();
        assert_eq!(read.state(), "0010");
    }

    #[test]
    fn no_read_copies_expectation() {
        let (mut t, chain) = tree();
        t.bits_mut(chain).unwrap().out_bits_expected.put_str(0, "1X01").unwrap();
        let mut tester = configured(NetlistModel::new());
        let out = tester.shift(&t, chain, false, false, Severity::Fatal).unwrap();
        assert_eq!(out.out_bits.state(), "1X01");
        assert!(tester.set_logic_output(0, true).is_err());
    }

    #[test]
    fn bus_helpers() {
        let mut model = NetlistModel::new();
        let bus = ["d[0]", "d[1]", "d[2]"];
        model.set_bus_state(&bus, &"101".parse().unwrap()).unwrap();
        model.set_net("d[1]", NodeState::Undefined);
        assert_eq!(model.bus_state(&bus, "d").unwrap().state(), "1X1");
        assert!(model.set_bus_state(&bus, &"10".parse().unwrap()).is_err());
    }
}
