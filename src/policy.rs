//! Access policy of scan chain elements.
//!
//! Every node stores its own explicit policy.  Defaults set at an ancestor are copied downward by
//! whoever builds the tree (see [`crate::config`]); nothing walks up the tree at shift time.
use alloc::format;
use alloc::string::String;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// What a master clear does to a shadow register.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClearBehavior {
    /// Master clear has no effect.
    #[default]
    None,
    /// Clears to `0`.
    Low,
    /// Clears to `1`.
    High,
    /// Ends in an unknown state.
    Unknown,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AccessPolicy {
    pub readable: bool,
    writeable: bool,
    /// Scanned-out bits are not meaningful.
    pub unpredictable: bool,
    uses_shadow: bool,
    uses_dual_ported_shadow: bool,
    pub clears: ClearBehavior,
}

impl Default for AccessPolicy {
    fn default() -> Self {
        Self {
            readable: false,
            writeable: false,
            unpredictable: false,
            uses_shadow: false,
            uses_dual_ported_shadow: false,
            clears: ClearBehavior::None,
        }
    }
}

impl AccessPolicy {
    pub fn writeable(&self) -> bool {
        self.writeable
    }

    /// Whether elements have a predictable shadow register that scan both writes and reads.
    pub fn uses_shadow(&self) -> bool {
        self.uses_shadow
    }

    /// Whether elements have a shadow register written by scan and read from elsewhere.
    pub fn uses_dual_ported_shadow(&self) -> bool {
        self.uses_dual_ported_shadow
    }

    pub fn has_any_shadow(&self) -> bool {
        self.uses_shadow || self.uses_dual_ported_shadow
    }

    /// A shadow register that scan can't write is a configuration error.
    pub fn set_uses_shadow(&mut self, shadow: bool) -> Result<()> {
        if shadow && !self.writeable {
            return Err(Error::Config(String::from(
                "shadow register requested on an element that is not writeable",
            )));
        }
        self.uses_shadow = shadow;
        Ok(())
    }

    pub fn set_uses_dual_ported_shadow(&mut self, shadow: bool) -> Result<()> {
        if shadow && !self.writeable {
            return Err(Error::Config(String::from(
                "dual-ported shadow register requested on an element that is not writeable",
            )));
        }
        self.uses_dual_ported_shadow = shadow;
        Ok(())
    }

    /// Clearing `writeable` is refused while a shadow register is configured.
    pub fn set_writeable(&mut self, writeable: bool) -> Result<()> {
        if !writeable && self.has_any_shadow() {
            return Err(Error::Config(String::from(
                "element with a shadow register must stay writeable",
            )));
        }
        self.writeable = writeable;
        Ok(())
    }

    /// Compact mode string, e.g. `RWS` or `R`, matching [`AccessPolicy::from_str`].
    pub fn mode(&self) -> String {
        let mut s = String::new();
        if self.readable {
            s.push('R');
        }
        if self.writeable {
            s.push('W');
        }
        if self.uses_shadow {
            s.push('S');
        }
        if self.uses_dual_ported_shadow {
            s.push('D');
        }
        if self.unpredictable {
            s.push('U');
        }
        s
    }
}

impl FromStr for AccessPolicy {
    type Err = Error;

    /// Letters in any order: `R`ead, `W`rite, `S`hadow, `D`ual-ported shadow, `U`npredictable.
    /// `?` (access unknown) is taken as `RW`, and `-` is no access.
    fn from_str(s: &str) -> Result<Self> {
        let mut p = AccessPolicy::default();
        match s.trim() {
            "?" => {
                p.readable = true;
                p.writeable = true;
                return Ok(p);
            }
            "-" => return Ok(p),
            _ => {}
        }
        let mut shadow = false;
        let mut dual = false;
        for ch in s.chars() {
            match ch.to_ascii_uppercase() {
                'R' => p.readable = true,
                'W' => p.writeable = true,
                'S' => shadow = true,
                'D' => dual = true,
                'U' => p.unpredictable = true,
                other => {
                    return Err(Error::Config(format!(
                        "bad access character '{}' in '{}'",
                        other, s
                    )))
                }
            }
        }
        if shadow && dual {
            return Err(Error::Config(format!(
                "bad access string '{}': S and D can't be given together",
                s
            )));
        }
        p.set_uses_shadow(shadow)?;
        p.set_uses_dual_ported_shadow(dual)?;
        Ok(p)
    }
}

/// A simulation net driven or observed by a scan chain element.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataNet {
    pub name: String,
    #[serde(default = "yes")]
    pub readable: bool,
    #[serde(default = "yes")]
    pub writeable: bool,
    /// The net holds the complement of the scan element.
    #[serde(default)]
    pub inverted: bool,
}

fn yes() -> bool {
    true
}

impl DataNet {
    pub fn new(name: &str) -> Self {
        Self {
            name: String::from(name),
            readable: true,
            writeable: true,
            inverted: false,
        }
    }

    /// Net name for bit `index` of an element `len` bits wide.
    pub fn bit_name(&self, index: usize, len: usize) -> String {
        if len == 1 {
            self.name.clone()
        } else {
            format!("{}[{}]", self.name, index)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shadow_requires_write() {
        let mut p = AccessPolicy::default();
        p.readable = true;
        assert!(matches!(p.set_uses_shadow(true), Err(Error::Config(_))));
        p.set_writeable(true).unwrap();
        p.set_uses_shadow(true).unwrap();
        assert!(p.set_writeable(false).is_err());
        assert_eq!(p.mode(), "RWS");
    }

    #[test]
    fn parse_mode_string() {
        let p: AccessPolicy = "rwd".parse().unwrap();
        assert!(p.readable && p.writeable() && p.uses_dual_ported_shadow());
        assert!(!p.uses_shadow());
        assert!("RS".parse::<AccessPolicy>().is_err());
        assert!("RQ".parse::<AccessPolicy>().is_err());
        assert!("RWSD".parse::<AccessPolicy>().is_err());
        assert_eq!("?".parse::<AccessPolicy>().unwrap().mode(), "RW");
        assert_eq!("-".parse::<AccessPolicy>().unwrap(), AccessPolicy::default());
    }

    #[test]
    fn bussed_net_names() {
        let n = DataNet::new("xcore.dat");
        assert_eq!(n.bit_name(0, 1), "xcore.dat");
        assert_eq!(n.bit_name(2, 4), "xcore.dat[2]");
    }
}
