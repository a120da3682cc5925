//! Session configuration and a serializable description of a scan chain system.
//!
//! A [`SystemDescription`] is what a chip's scan chain file boils down to.  [`SystemDescription::build`]
//! turns it into a [`ScanTree`]; access and master-clear defaults given on a node are copied to
//! every descendant that doesn't override them.
use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;

use serde::{Deserialize, Serialize};

use crate::control::LogFlags;
use crate::error::{Error, Result, Severities};
use crate::policy::{AccessPolicy, ClearBehavior, DataNet};
use crate::tree::{NodeId, ScanTree};

/// Tester setup and checking policy for one test session.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// TAP signal voltage.
    pub tap_volts: f32,
    /// TCK frequency.
    pub tap_khz: u32,
    pub severities: Severities,
    pub log: LogFlags,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            tap_volts: 1.8,
            tap_khz: 1000,
            severities: Severities::default(),
            log: LogFlags::default(),
        }
    }
}

fn system_name() -> String {
    String::from("system")
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SystemDescription {
    #[serde(default = "system_name")]
    pub name: String,
    #[serde(default)]
    pub comment: String,
    /// In daisy-chain order, the first chip nearest TDI.
    pub chips: Vec<ChipDescription>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChipDescription {
    pub name: String,
    pub ir_length: usize,
    #[serde(default)]
    pub comment: String,
    /// Access letters, see [`AccessPolicy`]'s `FromStr`.
    #[serde(default)]
    pub access: Option<String>,
    #[serde(default)]
    pub clears: Option<ClearBehavior>,
    #[serde(default)]
    pub chains: Vec<ChainDescription>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChainDescription {
    pub name: String,
    pub opcode: String,
    /// Defaults to the total length of the subchains.
    #[serde(default)]
    pub length: Option<usize>,
    #[serde(default)]
    pub comment: String,
    #[serde(default)]
    pub access: Option<String>,
    #[serde(default)]
    pub clears: Option<ClearBehavior>,
    #[serde(default)]
    pub data_net: Option<DataNet>,
    #[serde(default)]
    pub data_net2: Option<DataNet>,
    /// Name of an earlier chain on the same chip whose buffers this chain shares.
    #[serde(default)]
    pub same_as: Option<String>,
    #[serde(default)]
    pub subchains: Vec<SubchainDescription>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SubchainDescription {
    pub name: String,
    #[serde(default)]
    pub length: Option<usize>,
    #[serde(default)]
    pub comment: String,
    #[serde(default)]
    pub access: Option<String>,
    #[serde(default)]
    pub clears: Option<ClearBehavior>,
    #[serde(default)]
    pub data_net: Option<DataNet>,
    #[serde(default)]
    pub data_net2: Option<DataNet>,
    #[serde(default)]
    pub pin: Option<String>,
    /// Instantiate once per index, the index appended to the name.
    #[serde(default)]
    pub repeat: Option<Repeat>,
    #[serde(default)]
    pub subchains: Vec<SubchainDescription>,
}

/// Loop indices `initial`, `initial + increment`, ... up to and including `last`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repeat {
    pub initial: i64,
    #[serde(rename = "final")]
    pub last: i64,
    pub increment: i64,
}

impl Repeat {
    pub fn indices(&self) -> Result<Vec<i64>> {
        let Repeat {
            initial,
            last,
            increment,
        } = *self;
        let ascending = last >= initial && increment > 0;
        let descending = last <= initial && increment < 0;
        if !ascending && !descending {
            return Err(Error::Config(format!(
                "repeat from {} to {} by {} never ends",
                initial, last, increment
            )));
        }
        let mut out = Vec::new();
        let mut ind = initial;
        while (ascending && ind <= last) || (descending && ind >= last) {
            out.push(ind);
            ind += increment;
        }
        Ok(out)
    }
}

/// Policy of a node: its own access and clear settings, else its parent's.
fn resolve(parent: &AccessPolicy, access: Option<&str>, clears: Option<ClearBehavior>) -> Result<AccessPolicy> {
    let mut policy = match access {
        Some(a) => a.parse()?,
        None => *parent,
    };
    policy.clears = clears.unwrap_or(parent.clears);
    Ok(policy)
}

impl SystemDescription {
    /// Build the scan tree.  Every chain is validated: subchain lengths must add up.
    pub fn build(&self) -> Result<ScanTree> {
        let mut tree = ScanTree::new(&self.name);
        let root = tree.root();
        let defaults = AccessPolicy::default();
        for chip in &self.chips {
            let id = tree.create_chip(&chip.name, chip.ir_length, &chip.comment)?;
            let policy = resolve(&defaults, chip.access.as_deref(), chip.clears)?;
            tree.set_policy(id, policy);
            tree.add_child(root, Some(id));
            for chain in &chip.chains {
                chain.build(&mut tree, id, &policy)?;
            }
        }
        Ok(tree)
    }
}

impl ChainDescription {
    fn build(&self, tree: &mut ScanTree, chip: NodeId, parent: &AccessPolicy) -> Result<()> {
        let id = match &self.same_as {
            Some(original) => {
                let original = tree.chains(chip).into_iter().find(|c| tree.name(*c) == original).ok_or_else(|| {
                    Error::Config(format!(
                        "can't find chain {} on chip {} for duplicate chain {}",
                        original,
                        tree.path(chip),
                        self.name
                    ))
                })?;
                tree.create_duplicate(original, &self.name, &self.opcode, &self.comment)?
            }
            None => {
                let length = match self.length {
                    Some(length) => length,
                    None => total_length(&self.subchains, &self.name)?,
                };
                let id = tree.create_chain(&self.name, &self.opcode, length, &self.comment)?;
                let policy = resolve(parent, self.access.as_deref(), self.clears)?;
                tree.set_policy(id, policy);
                tree.set_data_net(id, 0, self.data_net.clone())?;
                tree.set_data_net(id, 1, self.data_net2.clone())?;
                for sub in &self.subchains {
                    sub.build(tree, id, &policy)?;
                }
                id
            }
        };
        tree.add_child(chip, Some(id));
        tree.validate_chain(id)
    }
}

fn total_length(subchains: &[SubchainDescription], owner: &str) -> Result<usize> {
    if subchains.is_empty() {
        return Err(Error::Config(format!(
            "{} has neither a length nor subchains",
            owner
        )));
    }
    let mut total = 0;
    for sub in subchains {
        let copies = match &sub.repeat {
            Some(r) => r.indices()?.len(),
            None => 1,
        };
        total += copies * sub.length()?;
    }
    Ok(total)
}

impl SubchainDescription {
    fn length(&self) -> Result<usize> {
        match self.length {
            Some(length) => Ok(length),
            None => total_length(&self.subchains, &self.name),
        }
    }

    fn build(&self, tree: &mut ScanTree, parent: NodeId, parent_policy: &AccessPolicy) -> Result<()> {
        let names = match &self.repeat {
            Some(r) => r
                .indices()?
                .into_iter()
                .map(|ind| format!("{}{}", self.name, ind))
                .collect(),
            None => alloc::vec![self.name.clone()],
        };
        let length = self.length()?;
        let policy = resolve(parent_policy, self.access.as_deref(), self.clears)?;
        for name in names {
            let id = tree.create_subchain(&name, length, &self.comment);
            tree.set_policy(id, policy);
            tree.set_data_net(id, 0, self.data_net.clone())?;
            tree.set_data_net(id, 1, self.data_net2.clone())?;
            tree.set_pin(id, self.pin.as_deref())?;
            for sub in &self.subchains {
                sub.build(tree, id, &policy)?;
            }
            tree.add_child(parent, Some(id));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SYSTEM: &str = r#"{
        "name": "bench",
        "chips": [
            {
                "name": "core",
                "ir_length": 8,
                "access": "RW",
                "clears": "low",
                "chains": [
                    {
                        "name": "ctl",
                        "opcode": "1001",
                        "subchains": [
                            { "name": "mode", "length": 2, "access": "RWS" },
                            { "name": "lane", "length": 3, "clears": "high",
                              "repeat": { "initial": 0, "final": 2, "increment": 1 },
                              "data_net": { "name": "xlane.en", "inverted": true } },
                            { "name": "status", "access": "R", "subchains": [
                                { "name": "busy", "length": 1, "pin": "BUSY_OUT" },
                                { "name": "err", "length": 4, "access": "U" }
                            ] }
                        ]
                    },
                    { "name": "ctlAlias", "opcode": "1010", "same_as": "ctl" }
                ]
            },
            { "name": "io", "ir_length": 4, "chains": [
                { "name": "pads", "opcode": "01", "length": 12 }
            ] }
        ]
    }"#;

    fn build(json: &str) -> Result<ScanTree> {
        let desc: SystemDescription = serde_json::from_str(json).unwrap();
        desc.build()
    }

    #[test]
    fn builds_tree_with_inherited_policy() {
        let t = build(SYSTEM).unwrap();
        let ctl = t.find_path("core.ctl").unwrap();
        assert_eq!(t.node(ctl).length(), 2 + 3 * 3 + 5);
        assert_eq!(t.name(t.root()), "bench");

        let mode = t.find_path("core.ctl.mode").unwrap();
        assert_eq!(t.policy(mode).mode(), "RWS");
        assert_eq!(t.policy(mode).clears, ClearBehavior::Low);

        let lane1 = t.find_path("core.ctl.lane1").unwrap();
        assert_eq!(t.policy(lane1).mode(), "RW");
        assert_eq!(t.policy(lane1).clears, ClearBehavior::High);
        assert!(t.node(lane1).data_net(0).unwrap().inverted);

        let busy = t.find_path("core.ctl.status.busy").unwrap();
        assert_eq!(t.policy(busy).mode(), "R");
        assert_eq!(t.node(busy).pin(), Some("BUSY_OUT"));
        assert_eq!(t.node(mode).pin(), None);
        let err = t.find_path("core.ctl.status.err").unwrap();
        assert_eq!(t.policy(err).mode(), "U");

        let alias = t.find_path("core.ctlAlias").unwrap();
        assert!(t.shares_bits(ctl, alias).unwrap());
        assert_eq!(t.node(t.find_path("io.pads").unwrap()).length(), 12);
        assert_eq!(t.ir_length(t.find_path("io").unwrap()).unwrap(), 4);
    }

    #[test]
    fn bad_descriptions() {
        let shadow_without_write = r#"{"chips": [{"name": "c", "ir_length": 4, "chains": [
            {"name": "a", "opcode": "01", "length": 3, "access": "RS"}]}]}"#;
        assert!(matches!(build(shadow_without_write), Err(Error::Config(_))));

        let short = r#"{"chips": [{"name": "c", "ir_length": 4, "chains": [
            {"name": "a", "opcode": "01", "length": 3, "subchains": [{"name": "s", "length": 2}]}]}]}"#;
        assert!(matches!(build(short), Err(Error::LengthMismatch { .. })));

        let endless = r#"{"chips": [{"name": "c", "ir_length": 4, "chains": [
            {"name": "a", "opcode": "01", "subchains": [
                {"name": "s", "length": 1, "repeat": {"initial": 0, "final": 3, "increment": -1}}]}]}]}"#;
        assert!(matches!(build(endless), Err(Error::Config(_))));

        let missing = r#"{"chips": [{"name": "c", "ir_length": 4, "chains": [
            {"name": "b", "opcode": "10", "same_as": "a"}]}]}"#;
        assert!(matches!(build(missing), Err(Error::Config(_))));

        let no_length = r#"{"chips": [{"name": "c", "ir_length": 4, "chains": [
            {"name": "a", "opcode": "01"}]}]}"#;
        assert!(matches!(build(no_length), Err(Error::Config(_))));
    }

    #[test]
    fn repeat_indices() {
        let down = Repeat {
            initial: 6,
            last: 0,
            increment: -3,
        };
        assert_eq!(down.indices().unwrap(), [6, 3, 0]);
        let up = Repeat {
            initial: 1,
            last: 1,
            increment: 5,
        };
        assert_eq!(up.indices().unwrap(), [1]);
    }

    #[test]
    fn control_config_defaults() {
        let cfg: ControlConfig = serde_json::from_str(r#"{"tap_khz": 5000}"#).unwrap();
        assert_eq!(cfg.tap_khz, 5000);
        assert_eq!(cfg.tap_volts, 1.8);
        assert_eq!(cfg.severities, Severities::default());
        let cfg: ControlConfig =
            serde_json::from_str(r#"{"severities": {"err_test": "nonfatal"}}"#).unwrap();
        assert_eq!(cfg.severities.err_test, crate::error::Severity::NonFatal);
        assert_eq!(cfg.severities.ir_bad, crate::error::Severity::Fatal);
    }
}
