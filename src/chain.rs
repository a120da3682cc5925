//! Per-bit policy resolution and the bookkeeping that surrounds every shift of a root chain:
//! comparing scanned-out bits with expectation, tracking shadow registers and master clear.
use alloc::boxed::Box;
use alloc::format;
use alloc::vec::Vec;

use crate::control::LogFlags;
use crate::error::{Error, Result, Severities, Severity};
use crate::policy::{AccessPolicy, ClearBehavior, DataNet};
use crate::tester::JtagTester;
use crate::tree::{NodeId, ScanTree};

impl ScanTree {
    /// Leaf below `chain` that owns bit `bit`.  Leaves partition a chain in child order, so the
    /// leaf's access policy governs the bit.
    pub fn find_node_at_index(&self, chain: NodeId, bit: usize) -> Result<NodeId> {
        let length = self.node(chain).length();
        if bit >= length {
            return Err(Error::IndexOutOfRange {
                name: self.path(chain),
                index: bit,
                len: length,
            });
        }
        let mut node = chain;
        let mut offset = 0;
        'descend: while !self.node(node).children().is_empty() {
            for child in self.node(node).children() {
                let len = self.node(*child).length();
                if bit < offset + len {
                    node = *child;
                    continue 'descend;
                }
                offset += len;
            }
            return Err(self.short_children(node));
        }
        Ok(node)
    }

    fn short_children(&self, node: NodeId) -> Error {
        let sum: usize = self
            .node(node)
            .children()
            .iter()
            .map(|c| self.node(*c).length())
            .sum();
        Error::LengthMismatch {
            what: format!("children of {}", self.path(node)),
            expected: self.node(node).length(),
            actual: sum,
        }
    }

    /// Owning leaf of every bit of `chain`, in bit order.
    pub fn bit_owners(&self, chain: NodeId) -> Result<Vec<NodeId>> {
        let mut owners = Vec::with_capacity(self.node(chain).length());
        self.collect_owners(chain, &mut owners)?;
        if owners.len() != self.node(chain).length() {
            return Err(self.short_children(chain));
        }
        Ok(owners)
    }

    fn collect_owners(&self, node: NodeId, owners: &mut Vec<NodeId>) -> Result<()> {
        let n = self.node(node);
        if n.children().is_empty() {
            owners.extend(core::iter::repeat(node).take(n.length()));
            return Ok(());
        }
        let start = owners.len();
        for child in n.children() {
            self.collect_owners(*child, owners)?;
        }
        if owners.len() - start != n.length() {
            return Err(self.short_children(node));
        }
        Ok(())
    }

    /// Access policy of every bit of `chain`.
    pub fn bit_policies(&self, chain: NodeId) -> Result<Vec<AccessPolicy>> {
        Ok(self
            .bit_owners(chain)?
            .into_iter()
            .map(|n| *self.policy(n))
            .collect())
    }

    /// Check that every node below `chain` with children is exactly as long as its children.
    pub fn validate_chain(&self, chain: NodeId) -> Result<()> {
        self.bit_owners(chain).map(|_| ())
    }

    /// Root chain containing `node`, the bit offset of `node` within it, and its length.
    pub fn subchain_span(&self, node: NodeId) -> Result<(NodeId, usize, usize)> {
        let chain = self.parent_chain(node)?;
        let mut offset = 0;
        let mut cur = node;
        while cur != chain {
            let parent = self
                .parent(cur)
                .ok_or_else(|| Error::Config(format!("{} is detached", self.path(cur))))?;
            for sibling in self.node(parent).children() {
                if *sibling == cur {
                    break;
                }
                offset += self.node(*sibling).length();
            }
            cur = parent;
        }
        Ok((chain, offset, self.node(node).length()))
    }

    /// Data net of every bit of `chain` for net set `set` (0 primary, 1 secondary).  A leaf
    /// longer than one bit names a bus, expanded to `name[i]`.
    pub fn data_nets(&self, chain: NodeId, set: usize) -> Result<Vec<Option<DataNet>>> {
        let mut nets = Vec::with_capacity(self.node(chain).length());
        let owners = self.bit_owners(chain)?;
        let mut i = 0;
        while i < owners.len() {
            let leaf = self.node(owners[i]);
            let len = leaf.length();
            for j in 0..len {
                nets.push(leaf.data_net(set).map(|net| DataNet {
                    name: net.bit_name(j, len),
                    ..net.clone()
                }));
            }
            i += len;
        }
        Ok(nets)
    }

    /// Apply master clear to the shadow state of every element that has a shadow register.
    pub fn process_master_clear(&mut self, chain: NodeId) -> Result<()> {
        let policies = self.bit_policies(chain)?;
        let bits = self.bits_mut(chain)?;
        for (ind, p) in policies.iter().enumerate() {
            if !p.has_any_shadow() {
                continue;
            }
            match p.clears {
                ClearBehavior::Low => bits.shadow_state.clear(ind),
                ClearBehavior::High => bits.shadow_state.set(ind, true),
                ClearBehavior::Unknown => bits.shadow_state.invalidate(ind),
                ClearBehavior::None => {}
            }
        }
        Ok(())
    }

    /// Set every in-bit to 0, or to the master-clear state of its element.
    pub fn reset_in_bits(&mut self, chain: NodeId, use_master_clear_state: bool) -> Result<()> {
        let policies = self.bit_policies(chain)?;
        let bits = self.bits_mut(chain)?;
        for (ind, p) in policies.iter().enumerate() {
            let high = use_master_clear_state && p.clears == ClearBehavior::High;
            bits.in_bits.set(ind, high);
        }
        Ok(())
    }

    /// Forget what the chain is expected to scan out.  The next shift won't warn that no bits
    /// were compared.
    pub fn invalidate_chain(&mut self, chain: NodeId) -> Result<()> {
        let bits = self.bits_mut(chain)?;
        bits.out_bits_expected.invalidate_all();
        bits.initialized = false;
        Ok(())
    }

    /// Compare `out_bits` with `out_bits_expected`, first dropping expectations that can't hold.
    /// Returns whether every compared bit matched.
    pub fn check_out_bits(
        &mut self,
        chain: NodeId,
        read_enable: bool,
        sevs: &Severities,
    ) -> Result<bool> {
        let policies = self.bit_policies(chain)?;
        let path = self.path(chain);
        let bits = self.bits_mut(chain)?;

        for (ind, p) in policies.iter().enumerate() {
            if p.unpredictable {
                bits.out_bits_expected.invalidate(ind);
            } else if read_enable && p.readable {
                // the element loads its parallel input; only a shadow register makes that known
                match bits.shadow_state.value(ind) {
                    Some(v) if p.uses_shadow() => bits.out_bits_expected.set(ind, v),
                    _ => bits.out_bits_expected.invalidate(ind),
                }
            }
        }

        let no_test = sevs.no_test;
        if !bits.is_empty()
            && bits.out_bits_expected.is_invalid()
            && (bits.initialized || matches!(no_test, Severity::Fatal | Severity::NonFatal))
        {
            no_test.report(&format!("{}.shift() warning: no bits being compared", path))?;
        }
        bits.initialized = true;

        let errors = (0..bits.len())
            .filter(|ind| match bits.out_bits_expected.value(*ind) {
                Some(expected) => bits.out_bits.value(*ind) != Some(expected),
                None => false,
            })
            .count();
        if errors > 0 {
            sevs.err_test.report(&format!(
                "{}.shift() error: {} bits differ\n  expected: {}\n  outBits: {}",
                path,
                errors,
                bits.out_bits_expected.state(),
                bits.out_bits.state()
            ))?;
        }
        Ok(errors == 0)
    }

    /// Shift `chain` through `tester` and update every buffer from the result.  Returns whether
    /// the scanned-out bits matched expectation and every write landed.
    pub fn shift_chain<T: JtagTester + ?Sized>(
        &mut self,
        tester: &mut T,
        chain: NodeId,
        read_enable: bool,
        write_enable: bool,
        sevs: &Severities,
        flags: &LogFlags,
    ) -> Result<bool> {
        let path = self.path(chain);
        if flags.log_other {
            log::info!("------ {}, R={}, W={}", path, read_enable, write_enable);
        }
        let outcome = tester.shift(self, chain, read_enable, write_enable, sevs.ir_bad)?;

        {
            let bits = self.bits_mut(chain)?;
            if outcome.out_bits.len() != bits.len() {
                return Err(Error::LengthMismatch {
                    what: format!("bits scanned out of {}", path),
                    expected: bits.len(),
                    actual: outcome.out_bits.len(),
                });
            }
            bits.out_bits.put_indiscriminate(0, &outcome.out_bits)?;
        }
        for mismatch in &outcome.write_mismatches {
            sevs.err_test.report(mismatch)?;
        }

        let matched = self.check_out_bits(chain, read_enable, sevs)?;

        let policies = self.bit_policies(chain)?;
        let bits = self.bits_mut(chain)?;
        let previous = bits.out_bits_expected.clone();
        bits.old_out_bits_expected.put_indiscriminate(0, &previous)?;
        // after the shift every element holds what was scanned in
        bits.out_bits_expected.put_indiscriminate(0, &bits.in_bits)?;
        for (ind, p) in policies.iter().enumerate() {
            if read_enable && p.readable && p.uses_shadow() && !p.uses_dual_ported_shadow() {
                if let Some(v) = bits.shadow_state.value(ind) {
                    bits.out_bits_expected.set(ind, v);
                }
            }
            if write_enable && p.writeable() && p.has_any_shadow() {
                match bits.in_bits.value(ind) {
                    Some(v) => bits.shadow_state.set(ind, v),
                    None => bits.shadow_state.invalidate(ind),
                }
            }
        }

        self.notify_listeners(chain);
        Ok(matched && outcome.write_mismatches.is_empty())
    }

    /// Shift a single bit, `in_bits[len-1]`, into `chain` and return the bit that came out.
    /// Expectations and shadow state are unknown afterwards.
    pub fn shift_one_bit<T: JtagTester + ?Sized>(
        &mut self,
        tester: &mut T,
        chain: NodeId,
        read_enable: bool,
        write_enable: bool,
        sevs: &Severities,
        flags: &LogFlags,
    ) -> Result<bool> {
        if flags.log_other {
            log::info!(
                "***** {}, inBits={}",
                self.path(chain),
                self.bits(chain)?.in_bits.state()
            );
        }
        let out = tester.shift_one_bit(self, chain, read_enable, write_enable, sevs.ir_bad)?;
        let bits = self.bits_mut(chain)?;
        bits.out_bits_expected.invalidate_all();
        bits.old_out_bits_expected.invalidate_all();
        bits.shadow_state.invalidate_all();
        Ok(out)
    }

    /// Call `listener` after every completed shift of `chain`, or of any duplicate sharing its
    /// bits.  The listener is passed the chain it was registered on.
    pub fn add_shift_listener<F>(&mut self, chain: NodeId, listener: F)
    where
        F: FnMut(&ScanTree, NodeId) + 'static,
    {
        self.listeners.push((chain, Box::new(listener)));
    }

    pub fn remove_shift_listeners(&mut self, chain: NodeId) {
        self.listeners.retain(|(c, _)| *c != chain);
    }

    fn notify_listeners(&mut self, chain: NodeId) {
        let Ok(bank) = self.bank_id(chain) else {
            return;
        };
        let mut listeners = core::mem::take(&mut self.listeners);
        for (c, listener) in listeners.iter_mut() {
            if self.bank_id(*c).is_ok_and(|b| b == bank) {
                listener(self, *c);
            }
        }
        self.listeners = listeners;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::String;
    use crate::bitvector::BitVector;
    use crate::tester::ShiftOutcome;
    use crate::statemachine::JtagState;
    use alloc::rc::Rc;
    use core::cell::Cell;

    /// Scans out a fixed pattern and counts shifts.
    struct Canned {
        out: BitVector,
        mismatches: Vec<String>,
        shifts: usize,
    }

    impl JtagTester for Canned {
        fn configure(&mut self, _volts: f32, _khz: u32) -> Result<()> {
            Ok(())
        }
        fn reset(&mut self) -> Result<()> {
            Ok(())
        }
        fn tms_reset(&mut self) -> Result<()> {
            Ok(())
        }
        fn set_logic_output(&mut self, _index: usize, _level: bool) -> Result<()> {
            Ok(())
        }
        fn is_scan_out_inverted(&self) -> bool {
            false
        }
        fn tap_state(&self) -> Option<JtagState> {
            None
        }
        fn shift(
            &mut self,
            _tree: &ScanTree,
            _chain: NodeId,
            _r: bool,
            _w: bool,
            _ir_bad: Severity,
        ) -> Result<ShiftOutcome> {
            self.shifts += 1;
            Ok(ShiftOutcome {
                out_bits: self.out.clone(),
                write_mismatches: self.mismatches.clone(),
            })
        }
    }

    fn canned(out: &str) -> Canned {
        Canned {
            out: out.parse().unwrap(),
            mismatches: Vec::new(),
            shifts: 0,
        }
    }

    /// chain of 6: `a` 2 bits RWS clears high, `b` 4 bits R, `b.c` 4 bits unpredictable
    fn tree() -> (ScanTree, NodeId) {
        let mut t = ScanTree::new("sys");
        let chip = t.create_chip("chip", 4, "").unwrap();
        let root = t.root();
        t.add_child(root, Some(chip));
        let chain = t.create_chain("c", "01", 6, "").unwrap();
        t.add_child(chip, Some(chain));
        let a = t.create_subchain("a", 2, "");
        let b = t.create_subchain("b", 4, "");
        t.add_child(chain, Some(a));
        t.add_child(chain, Some(b));
        t.set_policy(a, "RWS".parse().unwrap());
        t.set_clear_behavior(a, ClearBehavior::High);
        t.set_readable(b, true);
        (t, chain)
    }

    #[test]
    fn bits_resolve_to_leaves() {
        let (mut t, chain) = tree();
        let a = t.find(chain, "a").unwrap();
        let b = t.find(chain, "b").unwrap();
        assert_eq!(t.find_node_at_index(chain, 1).unwrap(), a);
        assert_eq!(t.find_node_at_index(chain, 2).unwrap(), b);
        assert_eq!(t.find_node_at_index(chain, 5).unwrap(), b);
        assert!(t.find_node_at_index(chain, 6).is_err());
        assert_eq!(t.subchain_span(b).unwrap(), (chain, 2, 4));

        let extra = t.create_subchain("d", 1, "");
        t.add_child(chain, Some(extra));
        assert!(matches!(t.validate_chain(chain), Err(Error::LengthMismatch { .. })));
    }

    #[test]
    fn master_clear_and_reset() {
        let (mut t, chain) = tree();
        t.process_master_clear(chain).unwrap();
        assert_eq!(t.bits(chain).unwrap().shadow_state.state(), "11XXXX");
        t.reset_in_bits(chain, true).unwrap();
        assert_eq!(t.bits(chain).unwrap().in_bits.state(), "110000");
        t.reset_in_bits(chain, false).unwrap();
        assert_eq!(t.bits(chain).unwrap().in_bits.state(), "000000");
    }

    #[test]
    fn shift_updates_expectations_and_shadow() {
        let (mut t, chain) = tree();
        t.bits_mut(chain).unwrap().in_bits.put_str(0, "101100").unwrap();
        let mut tester = canned("000000");
        let flags = LogFlags::default();
        let ok = t
            .shift_chain(&mut tester, chain, false, true, &Severities::default(), &flags)
            .unwrap();
        assert!(ok);
        let bits = t.bits(chain).unwrap();
        assert_eq!(bits.out_bits.state(), "000000");
        assert_eq!(bits.out_bits_expected.state(), "101100");
        assert_eq!(bits.shadow_state.state(), "10XXXX");
        assert!(bits.old_out_bits_expected.is_invalid());
    }

    #[test]
    fn read_enable_expects_shadow_state() {
        let (mut t, chain) = tree();
        {
            let bits = t.bits_mut(chain).unwrap();
            bits.in_bits.put_str(0, "000000").unwrap();
            bits.shadow_state.put_str(0, "01XXXX").unwrap();
        }
        let mut tester = canned("000000");
        let quiet = Severities::QUIET;
        t.shift_chain(&mut tester, chain, true, false, &quiet, &LogFlags::default())
            .unwrap();
        // readable non-shadow bits are unknown under read-enable
        let bits = t.bits(chain).unwrap();
        assert_eq!(bits.out_bits_expected.state(), "010000");

        // the shadow value is compared on the next read
        let mut tester = canned("110000");
        let sevs = Severities {
            err_test: Severity::NonFatal,
            ..Severities::default()
        };
        let ok = t
            .shift_chain(&mut tester, chain, true, false, &sevs, &LogFlags::default())
            .unwrap();
        assert!(!ok);
    }

    #[test]
    fn mismatch_is_fatal_by_default() {
        let (mut t, chain) = tree();
        t.bits_mut(chain).unwrap().in_bits.put_str(0, "111111").unwrap();
        let mut tester = canned("000000");
        let sevs = Severities::default();
        let flags = LogFlags::default();
        t.shift_chain(&mut tester, chain, false, false, &sevs, &flags).unwrap();
        let err = t
            .shift_chain(&mut tester, chain, false, false, &sevs, &flags)
            .unwrap_err();
        assert!(matches!(err, Error::Verification(_)));
    }

    #[test]
    fn write_mismatch_follows_err_test_severity() {
        let (mut t, chain) = tree();
        t.bits_mut(chain).unwrap().in_bits.put_str(0, "000000").unwrap();
        let mut tester = canned("000000");
        tester.mismatches.push(String::from("net a[0] did not take 1"));
        let quiet = Severities {
            err_test: Severity::NoMessage,
            ..Severities::QUIET
        };
        let flags = LogFlags::default();
        let ok = t.shift_chain(&mut tester, chain, false, true, &quiet, &flags).unwrap();
        assert!(!ok);
        let fatal = Severities {
            err_test: Severity::Fatal,
            ..Severities::QUIET
        };
        assert!(t.shift_chain(&mut tester, chain, false, true, &fatal, &flags).is_err());
    }

    #[test]
    fn uninitialized_chain_skips_no_compare_warning() {
        let (mut t, chain) = tree();
        t.bits_mut(chain).unwrap().in_bits.put_str(0, "000000").unwrap();
        let mut tester = canned("000000");
        let strict = Severities {
            no_test: Severity::Warning,
            ..Severities::default()
        };
        let flags = LogFlags::default();
        // nothing expected yet, and not initialized: silent
        assert!(t.shift_chain(&mut tester, chain, true, false, &strict, &flags).unwrap());
        t.invalidate_chain(chain).unwrap();
        assert!(!t.bits(chain).unwrap().initialized);
        let fatal = Severities {
            no_test: Severity::Fatal,
            ..Severities::default()
        };
        t.invalidate_chain(chain).unwrap();
        assert!(t.shift_chain(&mut tester, chain, false, false, &fatal, &flags).is_err());
    }

    #[test]
    fn listeners_see_completed_shifts() {
        let (mut t, chain) = tree();
        t.reset_in_bits(chain, false).unwrap();
        let seen = Rc::new(Cell::new(0));
        let counter = seen.clone();
        t.add_shift_listener(chain, move |tree, c| {
            assert!(tree.bits(c).unwrap().out_bits.is_fully_valid());
            counter.set(counter.get() + 1);
        });
        let mut tester = canned("000000");
        let flags = LogFlags::default();
        t.shift_chain(&mut tester, chain, false, false, &Severities::QUIET, &flags).unwrap();
        t.shift_chain(&mut tester, chain, false, false, &Severities::QUIET, &flags).unwrap();
        assert_eq!(seen.get(), 2);
        assert_eq!(tester.shifts, 2);
        t.remove_shift_listeners(chain);
        t.shift_chain(&mut tester, chain, false, false, &Severities::QUIET, &flags).unwrap();
        assert_eq!(seen.get(), 2);
    }

    #[test]
    fn listeners_follow_shared_bits() {
        let (mut t, chain) = tree();
        let chip = t.parent(chain).unwrap();
        let alias = t.create_duplicate(chain, "alias", "10", "").unwrap();
        t.add_child(chip, Some(alias));
        let other = t.create_chain("other", "100", 6, "").unwrap();
        t.add_child(chip, Some(other));
        t.reset_in_bits(chain, false).unwrap();

        let seen = Rc::new(Cell::new(None));
        let last = seen.clone();
        t.add_shift_listener(chain, move |_, c| last.set(Some(c)));
        let mut tester = canned("000000");
        let flags = LogFlags::default();
        t.shift_chain(&mut tester, alias, false, false, &Severities::QUIET, &flags).unwrap();
        assert_eq!(seen.get(), Some(chain));

        seen.set(None);
        t.reset_in_bits(other, false).unwrap();
        t.shift_chain(&mut tester, other, false, false, &Severities::QUIET, &flags).unwrap();
        assert_eq!(seen.get(), None);
    }

    #[test]
    fn bussed_data_nets() {
        let (mut t, chain) = tree();
        let b = t.find(chain, "b").unwrap();
        t.set_data_net(b, 0, Some(DataNet::new("core.q"))).unwrap();
        let nets = t.data_nets(chain, 0).unwrap();
        assert_eq!(nets.len(), 6);
        assert!(nets[0].is_none());
        assert_eq!(nets[2].as_ref().unwrap().name, "core.q[0]");
        assert_eq!(nets[5].as_ref().unwrap().name, "core.q[3]");
        assert!(t.data_nets(chain, 1).unwrap().iter().all(Option::is_none));
    }
}
