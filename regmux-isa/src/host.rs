//! Instruction/operand predicates and block navigation the host provides.
//!
//! The Liveness Analyzer and the Shepherd only ever ask yes/no questions
//! about an instruction (does it read this register, does it write that
//! flag bit, is it the last instruction in the block) - they never inspect
//! an encoding directly. [`InstQuery`] is that question set.

use crate::emit::InstId;
use crate::liveness::AflagsMask;
use crate::reg::{GprId, SimdId, SimdWidth};

/// Per-block hints a client may declare (§6 "Block properties hint").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockProperties {
    /// The block has no internal control flow the Shepherd needs to be
    /// conservative about, even though it may contain a cti as its
    /// terminator.
    pub ignore_control_flow: bool,
    /// The block's control flow spans past what a single linear scan can
    /// see (e.g. instrumentation-inserted control flow); forces the same
    /// conservative restoration path as "has internal control flow".
    pub contains_spanning_control_flow: bool,
}

impl BlockProperties {
    /// Per §4.5(b): conservative GPR restoration-before-read kicks in when
    /// the register is unreserved and the block has internal control flow
    /// the client hasn't opted out of with `ignore_control_flow`, or when
    /// the client has explicitly flagged spanning control flow.
    ///
    /// `bb_has_internal_flow` is computed per block by the Liveness
    /// Analyzer's reverse scan (a control transfer seen anywhere but the
    /// block's last instruction), not carried in this struct - it isn't a
    /// client-declared hint, it's derived from the instruction stream.
    pub fn forces_conservative_restore(&self, bb_has_internal_flow: bool) -> bool {
        (bb_has_internal_flow && !self.ignore_control_flow) || self.contains_spanning_control_flow
    }
}

/// The registers a single operand references, split by class, as the host
/// would enumerate them off its own `opnd_num_regs_used`/`opnd_get_reg_used`
/// equivalent. GPRs are listed pointer-sized (sub-register references
/// normalized up) since that's the granularity the mediator tracks them at.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OperandRegs {
    pub gprs: Vec<GprId>,
    pub simd: Vec<(SimdId, SimdWidth)>,
}

/// Instruction-level predicates the host answers.
pub trait InstQuery {
    fn reads_gpr_exact(&self, inst: InstId, reg: GprId) -> bool;
    /// Reads `reg`, including as part of a wider/aliased read (e.g. reading
    /// the 64-bit register when only its low 32 bits are the named GPR).
    fn reads_gpr_inclusive(&self, inst: InstId, reg: GprId) -> bool;
    fn writes_gpr_exact(&self, inst: InstId, reg: GprId) -> bool;
    /// Writes only part of `reg` (e.g. an 8-bit sub-register write that
    /// leaves the rest of the register holding its old value) - triggers
    /// restore-before-read in the Shepherd (§4.5b) because the old value
    /// must be present for the partial write to compose correctly.
    fn writes_gpr_partial(&self, inst: InstId, reg: GprId) -> bool;
    /// Writes `reg` only along some control-flow paths (e.g. a conditional
    /// move) - same restore-before-read trigger as a partial write.
    fn writes_gpr_conditional(&self, inst: InstId, reg: GprId) -> bool;

    fn reads_simd(&self, inst: InstId, reg: SimdId, width: SimdWidth) -> bool;
    fn writes_simd_exact(&self, inst: InstId, reg: SimdId, width: SimdWidth) -> bool;

    fn reads_flags(&self, inst: InstId) -> AflagsMask;
    fn writes_flags(&self, inst: InstId) -> AflagsMask;
    /// True if `inst`'s condition-source operands (e.g. a `cmovcc`'s
    /// implicit flag test) read flags, distinct from an explicit flags
    /// read operand.
    fn reads_condition_srcs(&self, inst: InstId) -> AflagsMask;

    fn is_control_transfer(&self, inst: InstId) -> bool;
    fn is_interrupt(&self, inst: InstId) -> bool;
    fn is_syscall(&self, inst: InstId) -> bool;
    /// Any of control-transfer, interrupt or syscall - the liveness
    /// analyzer's "conservative boundary assumption" trigger (§4.3).
    fn is_block_boundary(&self, inst: InstId) -> bool {
        self.is_control_transfer(inst) || self.is_interrupt(inst) || self.is_syscall(inst)
    }

    fn is_app_instruction(&self, inst: InstId) -> bool;
    fn is_last_in_block(&self, inst: InstId) -> bool;

    fn next(&self, inst: InstId) -> Option<InstId>;
    fn prev(&self, inst: InstId) -> Option<InstId>;
    fn first(&self) -> Option<InstId>;
    fn last(&self) -> Option<InstId>;
}
