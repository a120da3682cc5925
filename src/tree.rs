//! The scan chain hierarchy: a system node owning chips, chips owning chains, and chains
//! optionally divided into subchains.
//!
//! Nodes live in an arena owned by [`ScanTree`] and refer to each other by [`NodeId`].  A node
//! has at most one parent.  Child order is significant: it is the physical order of chips on the
//! JTAG daisy chain and the order in which subchains concatenate into a chain.
//!
//! Chain bit buffers live in a second arena and are referenced by [`BankId`].  A duplicate chain
//! refers to the same bank as its original, so the two are views over one set of buffers.
use alloc::boxed::Box;
use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;

use crate::bitvector::BitVector;
use crate::error::{Error, Result};
use crate::policy::{AccessPolicy, DataNet};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(usize);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BankId(usize);

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NodeKind {
    /// Root of the hierarchy.
    System,
    /// One JTAG TAP controller.
    Chip { ir_length: usize },
    /// A root scan chain, addressed by `opcode` in its chip's instruction register.
    Chain {
        opcode: String,
        bank: BankId,
        /// Set on a duplicate chain: the chain whose buffers it shares.
        original: Option<NodeId>,
    },
    /// A named run of bits inside a chain.
    Subchain,
}

impl NodeKind {
    pub fn label(&self) -> &'static str {
        match self {
            NodeKind::System => "system",
            NodeKind::Chip { .. } => "chip",
            NodeKind::Chain { .. } => "chain",
            NodeKind::Subchain => "subchain",
        }
    }
}

#[derive(Clone, Debug)]
pub struct TreeNode {
    name: String,
    comment: String,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    kind: NodeKind,
    /// Number of scan elements; zero for the system and chips.
    length: usize,
    policy: AccessPolicy,
    /// Primary and secondary data nets, used by simulation testers.
    data_nets: [Option<DataNet>; 2],
    /// Chip pin a subchain's value can be observed on.
    pin: Option<String>,
}

impl TreeNode {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn comment(&self) -> &str {
        &self.comment
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    pub fn length(&self) -> usize {
        self.length
    }

    pub fn policy(&self) -> &AccessPolicy {
        &self.policy
    }

    /// `set` 0 is the primary net, 1 the secondary.
    pub fn data_net(&self, set: usize) -> Option<&DataNet> {
        self.data_nets.get(set).and_then(|n| n.as_ref())
    }

    pub fn pin(&self) -> Option<&str> {
        self.pin.as_deref()
    }

    pub fn is_chain(&self) -> bool {
        matches!(self.kind, NodeKind::Chain { .. })
    }

    pub fn is_chip(&self) -> bool {
        matches!(self.kind, NodeKind::Chip { .. })
    }
}

/// The bit buffers of one root scan chain.
#[derive(Clone, Debug)]
pub struct ChainBits {
    /// Pattern to scan in on the next shift.
    pub in_bits: BitVector,
    /// Pattern scanned out by the last shift.
    pub out_bits: BitVector,
    /// Expected value of `out_bits` on the next shift.
    pub out_bits_expected: BitVector,
    /// Expected value of `out_bits` for the previous shift.
    pub old_out_bits_expected: BitVector,
    /// State of the elements' shadow registers, for those that have one.
    pub shadow_state: BitVector,
    /// Whether any data has been shifted through these buffers yet.
    pub(crate) initialized: bool,
}

impl ChainBits {
    fn new(length: usize, path: &str) -> Self {
        Self {
            in_bits: BitVector::new(length, &format!("{}.inBits", path)),
            out_bits: BitVector::new(length, &format!("{}.outBits", path)),
            out_bits_expected: BitVector::new(length, &format!("{}.outBitsExpected", path)),
            old_out_bits_expected: BitVector::new(length, &format!("{}.oldOutBitsExpected", path)),
            shadow_state: BitVector::new(length, &format!("{}.shadowState", path)),
            initialized: false,
        }
    }

    pub fn len(&self) -> usize {
        self.in_bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.in_bits.is_empty()
    }
}

pub type ShiftListener = Box<dyn FnMut(&ScanTree, NodeId)>;

pub struct ScanTree {
    nodes: Vec<TreeNode>,
    banks: Vec<ChainBits>,
    pub(crate) listeners: Vec<(NodeId, ShiftListener)>,
}

impl ScanTree {
    /// Create a tree containing only the system node.
    pub fn new(system_name: &str) -> Self {
        let mut tree = Self {
            nodes: Vec::new(),
            banks: Vec::new(),
            listeners: Vec::new(),
        };
        tree.push(system_name, "", NodeKind::System, 0);
        tree
    }

    fn push(&mut self, name: &str, comment: &str, kind: NodeKind, length: usize) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(TreeNode {
            name: String::from(name),
            comment: String::from(comment),
            parent: None,
            children: Vec::new(),
            kind,
            length,
            policy: AccessPolicy::default(),
            data_nets: [None, None],
            pin: None,
        });
        id
    }

    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    /// # Panics
    /// If `id` does not belong to this tree.
    pub fn node(&self, id: NodeId) -> &TreeNode {
        &self.nodes[id.0]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Create a detached chip node with an instruction register `ir_length` bits long.
    pub fn create_chip(&mut self, name: &str, ir_length: usize, comment: &str) -> Result<NodeId> {
        if ir_length < 2 {
            return Err(Error::Config(format!(
                "chip '{}' has IR length {}, but at least 2 bits are needed for the enable bits",
                name, ir_length
            )));
        }
        Ok(self.push(name, comment, NodeKind::Chip { ir_length }, 0))
    }

    /// Create a detached root scan chain and its bit buffers.
    pub fn create_chain(
        &mut self,
        name: &str,
        opcode: &str,
        length: usize,
        comment: &str,
    ) -> Result<NodeId> {
        if let Some(bad) = opcode.chars().find(|c| *c != '0' && *c != '1') {
            return Err(Error::Config(format!(
                "bad character '{}' in opcode '{}' of chain '{}', only 0 and 1 allowed",
                bad, opcode, name
            )));
        }
        let bank = BankId(self.banks.len());
        self.banks.push(ChainBits::new(length, name));
        Ok(self.push(
            name,
            comment,
            NodeKind::Chain {
                opcode: String::from(opcode),
                bank,
                original: None,
            },
            length,
        ))
    }

    /// Create a detached chain that shares the bit buffers and children of `original`, under a
    /// different name and opcode.
    pub fn create_duplicate(
        &mut self,
        original: NodeId,
        name: &str,
        opcode: &str,
        comment: &str,
    ) -> Result<NodeId> {
        let bank = self.bank_id(original)?;
        let (length, policy, nets, children) = {
            let o = self.node(original);
            (o.length, o.policy, o.data_nets.clone(), o.children.clone())
        };
        if let Some(bad) = opcode.chars().find(|c| *c != '0' && *c != '1') {
            return Err(Error::Config(format!(
                "bad character '{}' in opcode '{}' of chain '{}'",
                bad, opcode, name
            )));
        }
        let id = self.push(
            name,
            comment,
            NodeKind::Chain {
                opcode: String::from(opcode),
                bank,
                original: Some(original),
            },
            length,
        );
        let node = &mut self.nodes[id.0];
        node.policy = policy;
        node.data_nets = nets;
        // Shared, not cloned: the children keep their original parent.
        node.children = children;
        Ok(id)
    }

    /// Create a detached subchain of `length` elements.
    pub fn create_subchain(&mut self, name: &str, length: usize, comment: &str) -> NodeId {
        self.push(name, comment, NodeKind::Subchain, length)
    }

    /// Append `child` to `parent`'s children.  `None` is accepted and ignored so optional
    /// children can be passed straight through.
    pub fn add_child(&mut self, parent: NodeId, child: Option<NodeId>) {
        let Some(child) = child else {
            return;
        };
        self.nodes[child.0].parent = Some(parent);
        self.nodes[parent.0].children.push(child);
    }

    pub fn child_at(&self, id: NodeId, index: usize) -> Option<NodeId> {
        self.node(id).children.get(index).copied()
    }

    pub fn child_count(&self, id: NodeId) -> usize {
        self.node(id).children.len()
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).parent
    }

    pub fn name(&self, id: NodeId) -> &str {
        &self.node(id).name
    }

    /// Ancestors from the root down to and including `id`.
    pub fn hierarchy(&self, id: NodeId) -> Vec<NodeId> {
        let mut chain = Vec::new();
        let mut cur = Some(id);
        while let Some(n) = cur {
            chain.push(n);
            cur = self.node(n).parent;
        }
        chain.reverse();
        chain
    }

    /// Dot-joined names from depth `start_level` down to `id`.  Level 0 is the root.
    pub fn path_string(&self, id: NodeId, start_level: usize) -> String {
        let names: Vec<&str> = self
            .hierarchy(id)
            .into_iter()
            .skip(start_level)
            .map(|n| self.name(n))
            .collect();
        names.join(".")
    }

    /// Path without the system level, as users write it.
    pub fn path(&self, id: NodeId) -> String {
        self.path_string(id, 1)
    }

    /// Pre-order list of every node below `id`, excluding `id` itself.
    pub fn descendents(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack: Vec<NodeId> = self.node(id).children.iter().rev().copied().collect();
        while let Some(n) = stack.pop() {
            out.push(n);
            stack.extend(self.node(n).children.iter().rev().copied());
        }
        out
    }

    /// Walk `path` from `root`, matching each dot-separated segment against child names.  An empty
    /// path names `root`.  Duplicate sibling names are a configuration error, never resolved.
    pub fn find(&self, root: NodeId, path: &str) -> Result<NodeId> {
        if path.is_empty() {
            return Ok(root);
        }
        let mut cur = root;
        for segment in path.split('.') {
            let mut matches = self
                .node(cur)
                .children
                .iter()
                .copied()
                .filter(|c| self.name(*c) == segment);
            let found = matches.next();
            let extra = matches.count();
            match found {
                None => return Err(Error::NotFound(String::from(path))),
                Some(_) if extra > 0 => {
                    return Err(Error::Ambiguous {
                        path: String::from(path),
                        segment: String::from(segment),
                        count: extra + 1,
                    })
                }
                Some(c) => cur = c,
            }
        }
        Ok(cur)
    }

    /// [`ScanTree::find`] from the system node.
    pub fn find_path(&self, path: &str) -> Result<NodeId> {
        self.find(self.root(), path)
    }

    fn wrong_kind(&self, id: NodeId, expected: &'static str) -> Error {
        Error::WrongKind {
            path: self.path(id),
            expected,
            actual: self.node(id).kind.label(),
        }
    }

    pub fn ir_length(&self, chip: NodeId) -> Result<usize> {
        match self.node(chip).kind {
            NodeKind::Chip { ir_length } => Ok(ir_length),
            _ => Err(self.wrong_kind(chip, "chip")),
        }
    }

    pub fn opcode(&self, chain: NodeId) -> Result<&str> {
        match &self.node(chain).kind {
            NodeKind::Chain { opcode, .. } => Ok(opcode),
            _ => Err(self.wrong_kind(chain, "chain")),
        }
    }

    /// The chain a duplicate shares its buffers with, or `None` for an ordinary chain.
    pub fn original_of(&self, chain: NodeId) -> Result<Option<NodeId>> {
        match &self.node(chain).kind {
            NodeKind::Chain { original, .. } => Ok(*original),
            _ => Err(self.wrong_kind(chain, "chain")),
        }
    }

    pub fn bank_id(&self, chain: NodeId) -> Result<BankId> {
        match &self.node(chain).kind {
            NodeKind::Chain { bank, .. } => Ok(*bank),
            _ => Err(self.wrong_kind(chain, "chain")),
        }
    }

    /// Bit buffers of a chain.
    pub fn bits(&self, chain: NodeId) -> Result<&ChainBits> {
        let bank = self.bank_id(chain)?;
        Ok(&self.banks[bank.0])
    }

    pub fn bits_mut(&mut self, chain: NodeId) -> Result<&mut ChainBits> {
        let bank = self.bank_id(chain)?;
        Ok(&mut self.banks[bank.0])
    }

    /// Whether two chains are views over the same buffers.
    pub fn shares_bits(&self, a: NodeId, b: NodeId) -> Result<bool> {
        Ok(self.bank_id(a)? == self.bank_id(b)?)
    }

    /// Closest ancestor (or self) of the given kind.
    fn ancestor(&self, id: NodeId, expected: &'static str) -> Result<NodeId> {
        let mut cur = Some(id);
        while let Some(n) = cur {
            if self.node(n).kind.label() == expected {
                return Ok(n);
            }
            cur = self.node(n).parent;
        }
        Err(Error::Config(format!(
            "{} does not have a {} as an ancestor",
            self.path(id),
            expected
        )))
    }

    pub fn parent_chip(&self, id: NodeId) -> Result<NodeId> {
        self.ancestor(id, "chip")
    }

    pub fn parent_chain(&self, id: NodeId) -> Result<NodeId> {
        self.ancestor(id, "chain")
    }

    /// Chip nodes directly under the system node, in daisy-chain order.
    pub fn chips(&self) -> Vec<NodeId> {
        self.node(self.root())
            .children
            .iter()
            .copied()
            .filter(|c| self.node(*c).is_chip())
            .collect()
    }

    /// Chain nodes under `chip`.
    pub fn chains(&self, chip: NodeId) -> Vec<NodeId> {
        self.node(chip)
            .children
            .iter()
            .copied()
            .filter(|c| self.node(*c).is_chain())
            .collect()
    }

    pub fn policy(&self, id: NodeId) -> &AccessPolicy {
        &self.node(id).policy
    }

    /// Replace the access policy of one node.  [`AccessPolicy`] setters already refuse a shadow
    /// register on an element that is not writeable.
    pub fn set_policy(&mut self, id: NodeId, policy: AccessPolicy) {
        self.nodes[id.0].policy = policy;
    }

    pub fn set_readable(&mut self, id: NodeId, readable: bool) {
        self.nodes[id.0].policy.readable = readable;
    }

    pub fn set_writeable(&mut self, id: NodeId, writeable: bool) -> Result<()> {
        self.nodes[id.0].policy.set_writeable(writeable).map_err(|e| self.annotate(id, e))
    }

    pub fn set_unpredictable(&mut self, id: NodeId, unpredictable: bool) {
        self.nodes[id.0].policy.unpredictable = unpredictable;
    }

    pub fn set_uses_shadow(&mut self, id: NodeId, shadow: bool) -> Result<()> {
        self.nodes[id.0].policy.set_uses_shadow(shadow).map_err(|e| self.annotate(id, e))
    }

    pub fn set_uses_dual_ported_shadow(&mut self, id: NodeId, shadow: bool) -> Result<()> {
        self.nodes[id.0]
            .policy
            .set_uses_dual_ported_shadow(shadow)
            .map_err(|e| self.annotate(id, e))
    }

    pub fn set_clear_behavior(&mut self, id: NodeId, clears: crate::policy::ClearBehavior) {
        self.nodes[id.0].policy.clears = clears;
    }

    pub fn set_data_net(&mut self, id: NodeId, set: usize, net: Option<DataNet>) -> Result<()> {
        let name = self.path(id);
        let slot = self.nodes[id.0]
            .data_nets
            .get_mut(set)
            .ok_or_else(|| Error::Config(format!("data net set {} on {} must be 0 or 1", set, name)))?;
        *slot = net;
        Ok(())
    }

    /// Name the chip pin subchain `id` can be observed on.
    pub fn set_pin(&mut self, id: NodeId, pin: Option<&str>) -> Result<()> {
        let node = &self.nodes[id.0];
        if node.kind != NodeKind::Subchain {
            return Err(Error::WrongKind {
                path: self.path(id),
                expected: "subchain",
                actual: node.kind.label(),
            });
        }
        self.nodes[id.0].pin = pin.map(String::from);
        Ok(())
    }

    fn annotate(&self, id: NodeId, e: Error) -> Error {
        match e {
            Error::Config(msg) => Error::Config(format!("{}: {}", self.path(id), msg)),
            other => other,
        }
    }
}
