//! Fixtures standing in for the DBI host runtime, for the scenario and
//! invariant tests under `regmux-core/tests/`. A separate copy from
//! `regmux_core::test_support` (cfg-gated to the crate's own unit tests and
//! not visible to this integration-test binary) - see that module's doc
//! comment.

#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};

use regmux_isa::decode::{DecodedShape, Decoder, MachineContext, TlsSnapshot};
use regmux_isa::emit::{Anchor, InstId, TlsOffset};
use regmux_isa::liveness::AflagsMask;
use regmux_isa::reg::SimdWidth;
use regmux_isa::tls::TlsLayout;
use regmux_isa::{Arch, CodeEmitter, GprId, InstQuery, SimdId};

pub fn toy_layout() -> TlsLayout {
    TlsLayout {
        primitive_slots_base: TlsOffset(0),
        primitive_slot_count: 8,
        simd_block_ptr_cell: TlsOffset(512),
    }
}

/// A 4-GPR, 2-SIMD toy architecture, gpr3 as sp, gpr0 as the x86-style
/// accumulator - big enough to exercise every reservation path without the
/// noise of a real register file.
pub struct FakeArch {
    pub gpr_count: u8,
    pub simd_count: u8,
    pub sp: GprId,
    pub stolen: Option<GprId>,
    pub accumulator: Option<GprId>,
    pub bits: &'static [u8],
    pub supports_wide_simd: bool,
}

impl Default for FakeArch {
    fn default() -> Self {
        Self {
            gpr_count: 4,
            simd_count: 2,
            sp: GprId(3),
            stolen: None,
            accumulator: Some(GprId(0)),
            bits: &[0, 1, 2, 3, 4, 5],
            supports_wide_simd: false,
        }
    }
}

impl Arch for FakeArch {
    fn gpr_count(&self) -> u8 {
        self.gpr_count
    }
    fn simd_count(&self) -> u8 {
        self.simd_count
    }
    fn sp(&self) -> GprId {
        self.sp
    }
    fn stolen_gpr(&self) -> Option<GprId> {
        self.stolen
    }
    fn pc(&self) -> Option<GprId> {
        None
    }
    fn accumulator(&self) -> Option<GprId> {
        self.accumulator
    }
    fn aflags_bits(&self) -> &'static [u8] {
        self.bits
    }
    fn simd_widest_bytes(&self) -> u16 {
        16
    }
    fn supports_wide_simd_spill(&self) -> bool {
        self.supports_wide_simd
    }
}

#[derive(Default, Clone)]
pub struct FakeInst {
    reads_gpr_exact: HashSet<GprId>,
    reads_gpr_inclusive: HashSet<GprId>,
    writes_gpr_exact: HashSet<GprId>,
    writes_gpr_partial: HashSet<GprId>,
    writes_gpr_conditional: HashSet<GprId>,
    reads_simd: HashSet<(SimdId, SimdWidth)>,
    writes_simd_exact: HashSet<(SimdId, SimdWidth)>,
    reads_flags: AflagsMask,
    writes_flags: AflagsMask,
    reads_condition_srcs: AflagsMask,
    control_transfer: bool,
    interrupt: bool,
    syscall: bool,
    app: bool,
}

impl FakeInst {
    pub fn new() -> Self {
        Self {
            app: true,
            ..Default::default()
        }
    }

    pub fn reads_gpr_exact(mut self, reg: GprId) -> Self {
        self.reads_gpr_exact.insert(reg);
        self.reads_gpr_inclusive.insert(reg);
        self
    }

    pub fn writes_gpr_exact(mut self, reg: GprId) -> Self {
        self.writes_gpr_exact.insert(reg);
        self
    }

    pub fn writes_gpr_partial(mut self, reg: GprId) -> Self {
        self.writes_gpr_partial.insert(reg);
        self
    }

    pub fn writes_gpr_conditional(mut self, reg: GprId) -> Self {
        self.writes_gpr_conditional.insert(reg);
        self
    }

    pub fn reads_simd(mut self, reg: SimdId, width: SimdWidth) -> Self {
        self.reads_simd.insert((reg, width));
        self
    }

    pub fn writes_simd(mut self, reg: SimdId, width: SimdWidth) -> Self {
        self.writes_simd_exact.insert((reg, width));
        self
    }

    pub fn reads_flags(mut self, mask: AflagsMask) -> Self {
        self.reads_flags = mask;
        self
    }

    pub fn writes_flags(mut self, mask: AflagsMask) -> Self {
        self.writes_flags = mask;
        self
    }

    pub fn control_transfer(mut self) -> Self {
        self.control_transfer = true;
        self
    }
}

/// A straight-line basic block of [`FakeInst`]s implementing [`InstQuery`].
#[derive(Default)]
pub struct FakeInstList {
    insts: Vec<FakeInst>,
}

impl FakeInstList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, inst: FakeInst) -> InstId {
        let id = InstId(self.insts.len() as u64);
        self.insts.push(inst);
        id
    }

    pub fn ids(&self) -> Vec<InstId> {
        (0..self.insts.len() as u64).map(InstId).collect()
    }

    fn get(&self, inst: InstId) -> &FakeInst {
        &self.insts[inst.0 as usize]
    }
}

impl InstQuery for FakeInstList {
    fn reads_gpr_exact(&self, inst: InstId, reg: GprId) -> bool {
        self.get(inst).reads_gpr_exact.contains(&reg)
    }
    fn reads_gpr_inclusive(&self, inst: InstId, reg: GprId) -> bool {
        self.get(inst).reads_gpr_inclusive.contains(&reg)
    }
    fn writes_gpr_exact(&self, inst: InstId, reg: GprId) -> bool {
        self.get(inst).writes_gpr_exact.contains(&reg)
    }
    fn writes_gpr_partial(&self, inst: InstId, reg: GprId) -> bool {
        self.get(inst).writes_gpr_partial.contains(&reg)
    }
    fn writes_gpr_conditional(&self, inst: InstId, reg: GprId) -> bool {
        self.get(inst).writes_gpr_conditional.contains(&reg)
    }
    fn reads_simd(&self, inst: InstId, reg: SimdId, width: SimdWidth) -> bool {
        self.get(inst).reads_simd.contains(&(reg, width))
    }
    fn writes_simd_exact(&self, inst: InstId, reg: SimdId, width: SimdWidth) -> bool {
        self.get(inst).writes_simd_exact.contains(&(reg, width))
    }
    fn reads_flags(&self, inst: InstId) -> AflagsMask {
        self.get(inst).reads_flags
    }
    fn writes_flags(&self, inst: InstId) -> AflagsMask {
        self.get(inst).writes_flags
    }
    fn reads_condition_srcs(&self, inst: InstId) -> AflagsMask {
        self.get(inst).reads_condition_srcs
    }
    fn is_control_transfer(&self, inst: InstId) -> bool {
        self.get(inst).control_transfer
    }
    fn is_interrupt(&self, inst: InstId) -> bool {
        self.get(inst).interrupt
    }
    fn is_syscall(&self, inst: InstId) -> bool {
        self.get(inst).syscall
    }
    fn is_app_instruction(&self, inst: InstId) -> bool {
        self.get(inst).app
    }
    fn is_last_in_block(&self, inst: InstId) -> bool {
        inst.0 as usize + 1 == self.insts.len()
    }
    fn next(&self, inst: InstId) -> Option<InstId> {
        let n = inst.0 + 1;
        (n < self.insts.len() as u64).then_some(InstId(n))
    }
    fn prev(&self, inst: InstId) -> Option<InstId> {
        inst.0.checked_sub(1).map(InstId)
    }
    fn first(&self) -> Option<InstId> {
        (!self.insts.is_empty()).then_some(InstId(0))
    }
    fn last(&self) -> Option<InstId> {
        (!self.insts.is_empty()).then_some(InstId(self.insts.len() as u64 - 1))
    }
}

/// One recorded emission, for asserting what got emitted without a real
/// encoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Emitted {
    MoveGpr { dst: GprId, src: GprId },
    XchgGpr { a: GprId, b: GprId },
    StoreTls { reg: GprId, offset: TlsOffset },
    LoadTls { reg: GprId, offset: TlsOffset },
    LoadSimdBlockBase { dst: GprId },
    SimdStoreBaseDisp { base: GprId, slot: u16, width: SimdWidth, reg: SimdId },
    SimdLoadBaseDisp { base: GprId, slot: u16, width: SimdWidth, reg: SimdId },
    Lahf,
    Sahf,
    Seto,
    CmpAlRestoreOverflow,
}

#[derive(Default)]
pub struct FakeEmitter {
    pub log: Vec<(InstId, Anchor, Emitted)>,
}

impl FakeEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&mut self, where_: InstId, anchor: Anchor, what: Emitted) {
        self.log.push((where_, anchor, what));
    }

    /// The sub-sequence of `self.log` at `anchor`, in emission order.
    pub fn at(&self, anchor: Anchor) -> Vec<&Emitted> {
        self.log.iter().filter(|(_, a, _)| *a == anchor).map(|(_, _, e)| e).collect()
    }
}

impl CodeEmitter for FakeEmitter {
    fn emit_move_gpr(&mut self, where_: InstId, anchor: Anchor, dst: GprId, src: GprId) {
        self.record(where_, anchor, Emitted::MoveGpr { dst, src });
    }
    fn emit_xchg_gpr(&mut self, where_: InstId, anchor: Anchor, a: GprId, b: GprId) {
        self.record(where_, anchor, Emitted::XchgGpr { a, b });
    }
    fn emit_store_tls(&mut self, where_: InstId, anchor: Anchor, reg: GprId, offset: TlsOffset) {
        self.record(where_, anchor, Emitted::StoreTls { reg, offset });
    }
    fn emit_load_tls(&mut self, where_: InstId, anchor: Anchor, reg: GprId, offset: TlsOffset) {
        self.record(where_, anchor, Emitted::LoadTls { reg, offset });
    }
    fn emit_load_simd_block_base(&mut self, where_: InstId, anchor: Anchor, dst: GprId) {
        self.record(where_, anchor, Emitted::LoadSimdBlockBase { dst });
    }
    fn emit_simd_store_base_disp(
        &mut self,
        where_: InstId,
        anchor: Anchor,
        base: GprId,
        slot: u16,
        width: SimdWidth,
        reg: SimdId,
    ) {
        self.record(where_, anchor, Emitted::SimdStoreBaseDisp { base, slot, width, reg });
    }
    fn emit_simd_load_base_disp(
        &mut self,
        where_: InstId,
        anchor: Anchor,
        base: GprId,
        slot: u16,
        width: SimdWidth,
        reg: SimdId,
    ) {
        self.record(where_, anchor, Emitted::SimdLoadBaseDisp { base, slot, width, reg });
    }
    fn emit_lahf(&mut self, where_: InstId, anchor: Anchor) -> bool {
        self.record(where_, anchor, Emitted::Lahf);
        true
    }
    fn emit_sahf(&mut self, where_: InstId, anchor: Anchor) -> bool {
        self.record(where_, anchor, Emitted::Sahf);
        true
    }
    fn emit_seto(&mut self, where_: InstId, anchor: Anchor) -> bool {
        self.record(where_, anchor, Emitted::Seto);
        true
    }
    fn emit_cmp_al_restore_overflow(&mut self, where_: InstId, anchor: Anchor) -> bool {
        self.record(where_, anchor, Emitted::CmpAlRestoreOverflow);
        true
    }
}

/// A fault-time decoder that replays a fixed sequence of decoded shapes, as
/// if they'd been disassembled from the code cache starting at pc 0 - used
/// by the fault-reconstruction scenario tests.
pub struct FakeDecoder {
    pub insts: Vec<(DecodedShape, u32)>,
}

impl Decoder for FakeDecoder {
    fn decode_one(&self, pc: u64) -> Option<(DecodedShape, u32)> {
        self.insts.get(pc as usize).copied()
    }
}

#[derive(Default)]
pub struct FakeCtx {
    gprs: RefCell<HashMap<GprId, u64>>,
    simd: RefCell<HashMap<SimdId, Vec<u8>>>,
    aflags: RefCell<u64>,
}

impl MachineContext for FakeCtx {
    fn read_gpr(&self, reg: GprId) -> u64 {
        *self.gprs.borrow().get(&reg).unwrap_or(&0)
    }
    fn write_gpr(&mut self, reg: GprId, value: u64) {
        self.gprs.borrow_mut().insert(reg, value);
    }
    fn read_simd(&self, reg: SimdId, _width: SimdWidth) -> Vec<u8> {
        self.simd.borrow().get(&reg).cloned().unwrap_or_default()
    }
    fn write_simd(&mut self, reg: SimdId, _width: SimdWidth, bytes: &[u8]) {
        self.simd.borrow_mut().insert(reg, bytes.to_vec());
    }
    fn read_aflags(&self) -> u64 {
        *self.aflags.borrow()
    }
    fn write_aflags(&mut self, value: u64) {
        *self.aflags.borrow_mut() = value;
    }
}

#[derive(Default)]
pub struct FakeTls {
    pub mem: HashMap<u32, u64>,
    pub bytes: HashMap<u32, Vec<u8>>,
}

impl TlsSnapshot for FakeTls {
    fn read_u64(&self, offset: u32) -> u64 {
        *self.mem.get(&offset).unwrap_or(&0)
    }
    fn read_bytes(&self, offset: u32, len: usize) -> Vec<u8> {
        self.bytes.get(&offset).cloned().unwrap_or_else(|| vec![0; len])
    }
    fn read_simd_slot(&self, slot: u32, len: usize) -> Vec<u8> {
        self.bytes.get(&slot).cloned().unwrap_or_else(|| vec![0; len])
    }
}
