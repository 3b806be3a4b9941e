//! Scenario S4: an application instruction that both reads and writes a
//! register the tool currently holds reserved. The Shepherd must bracket
//! it: spill the tool value, restore the app value, let the instruction
//! run, re-spill the (now updated) app value, then restore the tool value
//! - in that order, relative to the instruction.

mod support;

use pretty_assertions::assert_eq;

use regmux_isa::emit::Anchor;
use regmux_isa::host::BlockProperties;
use regmux_isa::reg::PhysReg;
use regmux_isa::GprId;
use regmux_core::liveness::analyze_block;
use regmux_core::reservation::{self as rsv, ReservationClass};
use regmux_core::shepherd::shepherd_instruction;
use regmux_core::thread_state::ThreadState;

use support::{toy_layout, Emitted, FakeArch, FakeEmitter, FakeInst, FakeInstList};

#[test]
fn bracket_preserves_tool_value_around_an_app_read_modify_write() {
    let arch = FakeArch::default();
    let mut list = FakeInstList::new();
    list.push(FakeInst::new().reads_gpr_exact(GprId(1)).writes_gpr_exact(GprId(1)));
    list.push(FakeInst::new());
    let insts = list.ids();

    let mut state = ThreadState::new(&arch, toy_layout(), 8, 0, 2);
    let live = analyze_block(&list, &arch, &mut state);
    state.begin_block(live);

    let mut emitter = FakeEmitter::new();
    // The tool holds gpr1 reserved across this instruction (claimed via a
    // disjoint allowed-set so it never collides with gpr1 itself).
    let allowed = |r: PhysReg| r == PhysReg::Gpr(GprId(2));
    rsv::reserve(&mut state, &arch, &mut emitter, ReservationClass::Gpr, &allowed, false, insts[0], Anchor::BeforeInst).unwrap();

    shepherd_instruction(&mut state, &arch, &mut emitter, &list, insts[0], BlockProperties::default(), false).unwrap();

    let at = |anchor: Anchor| -> Vec<&Emitted> {
        emitter.log.iter().filter(|(_, a, _)| *a == anchor).map(|(_, _, e)| e).collect()
    };
    let before = at(Anchor::BeforeInst);
    let after = at(Anchor::AfterInst);
    let next = at(Anchor::BeforeNext);

    assert!(
        before.iter().any(|e| matches!(e, Emitted::StoreTls { reg, .. } if *reg == GprId(1))),
        "tool value of gpr1 must be spilled to a temp slot before the app instruction runs"
    );
    assert!(
        before.iter().any(|e| matches!(e, Emitted::LoadTls { reg, .. } if *reg == GprId(1))),
        "gpr1's app value must be restored before the app instruction reads it"
    );
    assert!(
        after.iter().any(|e| matches!(e, Emitted::StoreTls { reg, .. } if *reg == GprId(1))),
        "the app's updated value must be re-spilled after the write"
    );
    assert!(
        next.iter().any(|e| matches!(e, Emitted::LoadTls { reg, .. } if *reg == GprId(1))),
        "the tool's own value must be restored from the temp slot at the next instruction boundary"
    );
}
