//! Guard insertion
//!
//! Each guarded instruction ends its block: the block is split right after
//! it, and the split's fallthrough is replaced by a branch to the function's
//! trap block (or an unconditional jump when the fact can never hold).
//!
//! Facts carry their location in the function as it was before any split.
//! Splitting moves the tail of a block into a continuation block, so every
//! original block keeps a cursor naming the block that now holds its tail
//! and the original index of that block's first instruction. Locating a
//! fact is a map lookup plus a subtraction.

use std::collections::HashMap;

use tracing::debug;

use super::collect::Fact;
use super::condition::TrapCondition;
use crate::error::{InstrumentError, Result};
use crate::mir::{BasicBlock, MirExternFn, MirFunction, MirInst, MirType, Terminator};

/// Callee of every trap block
pub const TRAP_INTRINSIC: &str = "__rangeguard_trap";

/// Module the trap intrinsic is declared in
pub const TRAP_MODULE: &str = "intrinsics";

/// Preferred label of the trap block
pub const TRAP_LABEL: &str = "trap";

/// Declaration of the trap intrinsic: no arguments, never returns or unwinds
pub fn trap_intrinsic() -> MirExternFn {
    MirExternFn {
        module: TRAP_MODULE.to_string(),
        name: TRAP_INTRINSIC.to_string(),
        params: vec![],
        ret_ty: MirType::Unit,
        no_return: true,
        no_unwind: true,
    }
}

/// What happened to one fact
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SiteKind {
    /// Branch to the trap block when the guard fires
    Conditional,
    /// Jump to the trap block whenever the instruction executes
    Unconditional,
    /// The guard had no terms; nothing was inserted
    Skipped,
}

/// Where an original block's unsplit tail lives now
#[derive(Debug, Clone)]
struct Cursor {
    label: String,
    /// Original index of the first instruction in `label`
    base: usize,
}

/// Inserts guards into one function
///
/// New blocks are appended, so existing blocks never move and every label
/// keeps its position for the lifetime of the instrumenter.
pub struct CfgInstrumenter<'f> {
    func: &'f mut MirFunction,
    trap_block: String,
    cursors: HashMap<String, Cursor>,
    positions: HashMap<String, usize>,
    /// Next suffix to try for each label base
    suffixes: HashMap<String, usize>,
}

impl<'f> CfgInstrumenter<'f> {
    /// Start instrumenting `func` by giving it its trap block
    pub fn new(func: &'f mut MirFunction) -> Self {
        let positions = func
            .blocks
            .iter()
            .enumerate()
            .map(|(index, block)| (block.label.clone(), index))
            .collect();
        let mut instrumenter = Self {
            func,
            trap_block: String::new(),
            cursors: HashMap::new(),
            positions,
            suffixes: HashMap::new(),
        };
        let label = instrumenter.fresh_label(TRAP_LABEL);
        instrumenter.push_block(BasicBlock::new(
            label.clone(),
            vec![MirInst::Call {
                dest: None,
                func: TRAP_INTRINSIC.to_string(),
                args: vec![],
                is_tail: false,
            }],
            Terminator::Unreachable,
        ));
        instrumenter.trap_block = label;
        instrumenter
    }

    /// Label of the trap block
    pub fn trap_block(&self) -> &str {
        &self.trap_block
    }

    /// A label no block uses, derived from `base`
    fn fresh_label(&mut self, base: &str) -> String {
        let next = self.suffixes.entry(base.to_string()).or_insert(0);
        loop {
            let label = match *next {
                0 => base.to_string(),
                n => format!("{base}.{n}"),
            };
            *next += 1;
            if !self.positions.contains_key(&label) {
                return label;
            }
        }
    }

    fn push_block(&mut self, block: BasicBlock) {
        self.positions.insert(block.label.clone(), self.func.blocks.len());
        self.func.blocks.push(block);
    }

    /// Guard the instruction `fact` describes with `condition`
    ///
    /// Facts must arrive in the order they were collected.
    pub fn instrument(&mut self, fact: &Fact, condition: &TrapCondition) -> Result<SiteKind> {
        if let TrapCondition::Conditional(guard) = condition {
            if guard.is_empty() {
                return Ok(SiteKind::Skipped);
            }
        }

        let original = &fact.location.block;
        let cursor = self.cursors.get(original).cloned().unwrap_or_else(|| Cursor {
            label: original.clone(),
            base: 0,
        });
        if fact.location.index < cursor.base {
            return Err(InstrumentError::OutOfOrderFact {
                value: fact.value.name.clone(),
                block: original.clone(),
                index: fact.location.index,
            });
        }
        let local = fact.location.index - cursor.base;
        let missing = || InstrumentError::MissingSuccessor {
            value: fact.value.name.clone(),
            block: cursor.label.clone(),
        };
        let host = self.positions.get(&cursor.label).copied().ok_or_else(missing)?;
        let defines_value = self.func.blocks[host]
            .instructions
            .get(local)
            .and_then(MirInst::dest)
            .is_some_and(|dest| *dest == fact.value);
        if !defines_value {
            return Err(missing());
        }

        let cont = self.split_after(host, local, original);

        debug!(
            "instrumenting {} {} at: {}",
            fact.range,
            fact.known.bitstring(),
            fact.text
        );

        let trap = self.trap_block.clone();
        let kind = match condition {
            TrapCondition::Unconditional => {
                self.func.blocks[host].terminator = Terminator::Goto(trap);
                SiteKind::Unconditional
            }
            TrapCondition::Conditional(guard) => {
                let (insts, needs_trap) = guard.lower(&fact.value, &fact.ty, self.func);
                let block = &mut self.func.blocks[host];
                block.instructions.extend(insts);
                block.terminator = Terminator::Branch {
                    cond: needs_trap,
                    then_label: trap,
                    else_label: cont.clone(),
                };
                SiteKind::Conditional
            }
        };

        self.cursors.insert(
            original.clone(),
            Cursor {
                label: cont,
                base: fact.location.index + 1,
            },
        );
        Ok(kind)
    }

    /// Move everything after instruction `at` of block `host` into a new
    /// block, and fall through to that block
    ///
    /// Phis in the successors now see the new block as their predecessor.
    fn split_after(&mut self, host: usize, at: usize, original: &str) -> String {
        let label = self.fresh_label(&format!("{original}.cont"));
        let block = &mut self.func.blocks[host];
        let tail = block.instructions.split_off(at + 1);
        let terminator = std::mem::replace(&mut block.terminator, Terminator::Goto(label.clone()));
        let host_label = block.label.clone();

        let successors = terminator.successors();
        self.push_block(BasicBlock::new(label.clone(), tail, terminator));
        for successor in &successors {
            let Some(&index) = self.positions.get(successor) else { continue };
            let phis = self.func.blocks[index]
                .instructions
                .iter_mut()
                .take_while(|inst| inst.is_phi());
            for inst in phis {
                if let MirInst::Phi { values, .. } = inst {
                    for (_, pred) in values.iter_mut().filter(|(_, pred)| *pred == host_label) {
                        *pred = label.clone();
                    }
                }
            }
        }
        label
    }
}
