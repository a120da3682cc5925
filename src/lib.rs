//! This crate drives the scan chains of chips under test through a JTAG port, at a
//! variety of levels of abstraction.  At the lowest level is a cable: anything that
//! implements the Cable trait, such as a GPIO bit-bang adapter or the software model in
//! `cable::sim`.  JtagSM tracks the state of the TAP controllers and gets from one state
//! to another with the fewest TMS changes, and Taps puts every chip except one in
//! BYPASS so a single chip's registers can be shifted.
//!
//! Above that, a system of chips is described as a ScanTree: chips, their scan chains
//! (each selected by an opcode) and subchains that name slices of a chain.  Each chain
//! keeps the bits to shift in, the bits that came out, what is expected to come out
//! next, and what its shadow registers hold.  A JtagTester shifts one chain, either
//! through a cable or by reading and writing the nets of a simulation directly, and
//! ChainControl ties the two together behind dotted paths like `chip.chain.subchain`,
//! checking every shift against expectation with a configurable severity.
//!
//! ChainTest builds bring-up tests on top: length measurement, random pattern tests of
//! every chain, and voltage and frequency schmoos.
//!
//! # Example
//! ```
//! use jtag_chains::cable::sim::SimulatedChain;
//! use jtag_chains::config::ControlConfig;
//! use jtag_chains::control::ChainControl;
//! use jtag_chains::tester::CableTester;
//! use jtag_chains::tree::ScanTree;
//!
//! let mut tree = ScanTree::new("system");
//! let root = tree.root();
//! let chip = tree.create_chip("cpu", 8, "")?;
//! tree.add_child(root, Some(chip));
//! let chain = tree.create_chain("ctl", "1001", 16, "")?;
//! tree.add_child(chip, Some(chain));
//!
//! let tester = CableTester::new(SimulatedChain::from_tree(&tree)?)?;
//! let mut control = ChainControl::new(tree, tester, ControlConfig::default())?;
//! control.set_in_bits_str("cpu.ctl", "1010101010101010")?;
//! control.shift("cpu.ctl", false, true)?;
//! control.fill_in_bits("cpu.ctl", false)?;
//! assert!(control.shift("cpu.ctl", false, true)?);
//! assert_eq!(control.out_bits("cpu.ctl")?.state(), "1010101010101010");
//! # Ok::<(), jtag_chains::Error>(())
//! ```

#![no_std]

#[cfg(feature = "std")]
extern crate std;

extern crate alloc;

pub mod bitvector;
pub mod cable;
pub mod chain;
pub mod chaintest;
pub mod config;
pub mod control;
pub mod error;
pub mod instrument;
pub mod policy;
#[cfg(feature = "std")]
pub mod process;
pub mod simulation;
pub mod statemachine;
pub mod taps;
pub mod tester;
pub mod tree;

pub use error::{Error, Result};
