//! This provides a higher-level interface than the `Cable` trait.  Specifically, it keeps track of
//! the state of the TAP controllers, and allows setting the state to any desired state.  `JtagSM`
//! will get to that state by the most efficient path, based on the current state.
use alloc::vec;
use alloc::vec::Vec;

use bitvec::prelude::*;

use crate::cable::Cable;
use crate::error::Result;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Register {
    Data,
    Instruction,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JtagState {
    Reset = 0,
    Idle = 1,
    SelectDR = 2,
    CaptureDR = 3,
    ShiftDR = 4,
    Exit1DR = 5,
    PauseDR = 6,
    Exit2DR = 7,
    UpdateDR = 8,
    SelectIR = 9,
    CaptureIR = 10,
    ShiftIR = 11,
    Exit1IR = 12,
    PauseIR = 13,
    Exit2IR = 14,
    UpdateIR = 15,
}

use JtagState::*;

/// Next state for TMS low and TMS high, indexed by the current state.
const EDGES: [[JtagState; 2]; 16] = [
    [Idle, Reset],          // Reset
    [Idle, SelectDR],       // Idle
    [CaptureDR, SelectIR],  // SelectDR
    [ShiftDR, Exit1DR],     // CaptureDR
    [ShiftDR, Exit1DR],     // ShiftDR
    [PauseDR, UpdateDR],    // Exit1DR
    [PauseDR, Exit2DR],     // PauseDR
    [ShiftDR, UpdateDR],    // Exit2DR
    [Idle, SelectDR],       // UpdateDR
    [CaptureIR, Reset],     // SelectIR
    [ShiftIR, Exit1IR],     // CaptureIR
    [ShiftIR, Exit1IR],     // ShiftIR
    [PauseIR, UpdateIR],    // Exit1IR
    [PauseIR, Exit2IR],     // PauseIR
    [ShiftIR, UpdateIR],    // Exit2IR
    [Idle, SelectDR],       // UpdateIR
];

impl JtagState {
    /// State after one TCK with the given TMS level.
    pub fn next(self, tms: bool) -> JtagState {
        EDGES[self as usize][tms as usize]
    }

    fn shift_state(reg: Register) -> JtagState {
        match reg {
            Register::Data => ShiftDR,
            Register::Instruction => ShiftIR,
        }
    }
}

#[derive(Clone)]
struct Path {
    path: Vec<usize>,
    state: JtagState,
}

pub struct JtagSM<C> {
    pub cable: C,
    state: JtagState,
}

impl<C: Cable> JtagSM<C> {
    /// Create a JTAG state machine using an existing `Cable`.  The controllers are reset through
    /// TMS and left in Idle.
    pub fn new(cable: C) -> Result<Self> {
        let mut sm = Self {
            cable,
            state: Reset,
        };
        sm.mode_reset()?;
        Ok(sm)
    }

    pub fn state(&self) -> JtagState {
        self.state
    }

    /// Reset the controllers by driving TMS high for 5 clocks, then enter Idle.
    pub fn mode_reset(&mut self) -> Result<()> {
        self.cable.change_mode(&[1, 1, 1, 1, 1, 0], true)?;
        self.state = Idle;
        Ok(())
    }

    /// Reset the controllers with the TRST line, then enter Idle.
    pub fn trst_reset(&mut self) -> Result<()> {
        self.cable.pulse_trst()?;
        self.state = Reset;
        self.change_mode(Idle)
    }

    fn get_path(&self, state: JtagState) -> Vec<usize> {
        let mut paths = vec![
            Path {
                path: vec![0],
                state: self.state.next(false),
            },
            Path {
                path: vec![1],
                state: self.state.next(true),
            },
        ];

        loop {
            if let Some(p) = paths.iter().find(|p| p.state == state) {
                return p.path.clone();
            }

            let mut newpaths = Vec::with_capacity(paths.len() * 2);
            for p in paths {
                for tms in 0..2 {
                    let mut next = p.clone();
                    next.state = p.state.next(tms == 1);
                    next.path.push(tms);
                    newpaths.push(next);
                }
            }
            paths = newpaths;
        }
    }

    /// Use TMS to get into `state` by the most efficient path
    pub fn change_mode(&mut self, state: JtagState) -> Result<()> {
        if self.state == state {
            return Ok(());
        }

        let path = self.get_path(state);
        log::trace!("path from {:?} to {:?}: {:?}", self.state, state, path);
        self.cable.change_mode(&path, true)?;
        self.state = state;
        Ok(())
    }

    /// Shift `data` through the instruction or data register, starting and ending in Idle.
    /// `data[0]` is clocked first; the result holds the TDO sample of each clock in the same
    /// order.  An empty `data` leaves the controllers untouched.
    pub fn scan(&mut self, reg: Register, data: &BitSlice) -> Result<BitVec> {
        if data.is_empty() {
            return Ok(BitVec::new());
        }
        self.change_mode(Idle)?;
        self.change_mode(JtagState::shift_state(reg))?;
        let out = self.cable.read_write_data(data, true)?;
        self.state = match reg {
            Register::Data => Exit1DR,
            Register::Instruction => Exit1IR,
        };
        self.change_mode(Idle)?;
        Ok(out)
    }

    /// Clock `bits` ones through a register, returning what comes out.
    pub fn read_reg(&mut self, reg: Register, bits: usize) -> Result<BitVec> {
        let ones = BitVec::<usize, Lsb0>::repeat(true, bits);
        self.scan(reg, &ones)
    }
}
