//! Top-level entry point (§2, §6a): owns one [`ThreadState`] per instrumented
//! thread plus the process-wide [`Config`], and wires the six components
//! together behind a single public surface a host embeds against.
//!
//! A struct that owns its allocator bits, an explicit `init`, and thin
//! public methods that delegate to the free functions doing the actual
//! work (`reservation`, `shepherd`, `liveness`, `reconstructor`) rather
//! than reimplementing them inline.

use std::collections::HashMap;

use log::{debug, trace, warn};
use regmux_common::error::RegmuxError;
use regmux_common::options::{Config, Options};
use regmux_isa::decode::{Decoder, MachineContext, TlsSnapshot};
use regmux_isa::emit::{Anchor, InstId};
use regmux_isa::host::{BlockProperties, InstQuery, OperandRegs};
use regmux_isa::tls::{ThreadLocalStorage, TlsLayout};
use regmux_isa::reg::{PhysReg, SimdWidth};
use regmux_isa::{Arch, CodeEmitter, GprId, SimdId};

use crate::liveness::{analyze_block, analyze_forward, BlockLiveness, ForwardLiveness};
use crate::reconstructor;
use crate::reservation::{self, ReservationClass, ReservationInfo};
use crate::shepherd::shepherd_instruction;
use crate::thread_state::ThreadState;

/// Opaque per-thread handle a host keys its own thread bookkeeping against.
/// The mediator never interprets this beyond using it as a `HashMap` key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadId(pub u64);

/// Register-management mediator: one per process, shared across threads
/// through the host's own synchronization (per-thread state never crosses
/// threads, so nothing here needs a lock of its own - see §5).
pub struct Mediator {
    config: Config,
    threads: HashMap<ThreadId, ThreadState>,
    layout: TlsLayout,
    gpr_slot_stride: u32,
}

impl Mediator {
    /// First client's `init` (§6a): constructs the process-wide
    /// configuration and the TLS layout it implies. Later clients attach via
    /// [`Mediator::attach`].
    pub fn new(options: Options, layout: TlsLayout, gpr_slot_stride: u32) -> Self {
        debug!(
            "mediator init: {} gpr slots, {} simd slots, conservative={}",
            options.num_spill_slots, options.num_spill_simd_slots, options.conservative
        );
        Self {
            config: Config::new(options),
            threads: HashMap::new(),
            layout,
            gpr_slot_stride,
        }
    }

    /// A further client's `init` (§6a): folds its request into the existing
    /// configuration and bumps the refcount.
    pub fn attach(&mut self, options: Options) {
        self.config.init(options);
    }

    /// A client's `exit` (§6a). Returns `true` once every client has exited,
    /// meaning the host may tear down the TLS layout and drop this mediator.
    pub fn detach(&mut self) -> bool {
        self.config.exit()
    }

    pub fn options(&self) -> &Options {
        self.config.options()
    }

    /// Registers a new thread, allocating its [`ThreadState`] from the
    /// current effective options: the SIMD indirect block is thread-allocated
    /// at thread start (§3 "Lifecycle").
    pub fn thread_init(&mut self, thread: ThreadId, arch: &dyn Arch) {
        let opts = self.config.options();
        let state = ThreadState::new(
            arch,
            self.layout,
            self.gpr_slot_stride,
            opts.num_spill_slots,
            opts.num_spill_simd_slots,
        );
        self.threads.insert(thread, state);
        trace!("thread {} registered", thread.0);
    }

    /// Tears down a thread's state (§3 "the SIMD indirect block is ...
    /// freed at thread exit" - freeing the block itself is a host concern;
    /// this only drops the mediator's own bookkeeping for it).
    pub fn thread_exit(&mut self, thread: ThreadId) {
        self.threads.remove(&thread);
    }

    fn state_mut(&mut self, thread: ThreadId) -> Result<&mut ThreadState, RegmuxError> {
        self.threads.get_mut(&thread).ok_or_else(|| RegmuxError::InvalidParameter {
            message: format!("thread {} was never registered with thread_init", thread.0),
        })
    }

    fn state(&self, thread: ThreadId) -> Result<&ThreadState, RegmuxError> {
        self.threads.get(&thread).ok_or_else(|| RegmuxError::InvalidParameter {
            message: format!("thread {} was never registered with thread_init", thread.0),
        })
    }

    /// Analysis-phase callback (§4.3 "block mode"): run once per block,
    /// before any reservation in it. Also seeds `app_uses` tie-breaking.
    pub fn begin_block(
        &mut self,
        thread: ThreadId,
        host: &dyn InstQuery,
        arch: &dyn Arch,
    ) -> Result<BlockLiveness, RegmuxError> {
        let state = self.state_mut(thread)?;
        Ok(analyze_block(host, arch, state))
    }

    /// Commits the block's live vectors into per-thread state so subsequent
    /// reservation calls this block can consult them.
    pub fn enter_block(&mut self, thread: ThreadId, live: BlockLiveness) -> Result<(), RegmuxError> {
        self.state_mut(thread)?.begin_block(live);
        Ok(())
    }

    /// End-of-block bookkeeping (§8 property 1): every register must be
    /// native and unreserved, every slot free. Checked unconditionally (not
    /// just via `debug_assert`) because a violation here is exactly the
    /// "internal invariant failure" §7 routes to the error callback: if the
    /// callback is absent or declines to suppress it, the process aborts
    /// rather than carry corrupted bookkeeping into the next block.
    pub fn end_block(&mut self, thread: ThreadId) -> Result<(), RegmuxError> {
        let state = self.state_mut(thread)?;
        if let Some(reason) = state.clean_violation() {
            warn!("block-end invariant violated: {reason}");
            if !self.config.report_internal_failure(regmux_common::Status::Error) {
                std::process::abort();
            }
        }
        state.end_block();
        Ok(())
    }

    /// Forward-mode liveness (§4.3 "Forward mode"), for callers operating
    /// outside the block insertion phase.
    pub fn liveness_forward(&self, host: &dyn InstQuery, arch: &dyn Arch, start: InstId) -> ForwardLiveness {
        analyze_forward(host, arch, start)
    }

    /// `reserve(class, allowed, only_if_dead, where)` (§4.4).
    #[allow(clippy::too_many_arguments)]
    pub fn reserve(
        &mut self,
        thread: ThreadId,
        arch: &dyn Arch,
        emitter: &mut dyn CodeEmitter,
        class: ReservationClass,
        allowed: &dyn Fn(PhysReg) -> bool,
        only_if_dead: bool,
        where_: InstId,
        anchor: Anchor,
    ) -> Result<PhysReg, RegmuxError> {
        let state = self.state_mut(thread)?;
        reservation::reserve(state, arch, emitter, class, allowed, only_if_dead, where_, anchor)
    }

    /// `unreserve(reg, where)` (§4.4).
    pub fn unreserve(
        &mut self,
        thread: ThreadId,
        arch: &dyn Arch,
        emitter: &mut dyn CodeEmitter,
        reg: PhysReg,
        where_: InstId,
        anchor: Anchor,
        defer: bool,
    ) -> Result<(), RegmuxError> {
        let state = self.state_mut(thread)?;
        reservation::unreserve(state, arch, emitter, reg, where_, anchor, defer)
    }

    pub fn reservation_info(&self, thread: ThreadId, reg: PhysReg) -> Result<ReservationInfo, RegmuxError> {
        Ok(reservation::reservation_info(self.state(thread)?, reg))
    }

    /// `reserve_aflags(where)` (§4.4): a client's exclusive hold on the
    /// arithmetic flags, independent of any GPR/SIMD reservation.
    pub fn reserve_aflags(
        &mut self,
        thread: ThreadId,
        arch: &dyn Arch,
        emitter: &mut dyn CodeEmitter,
        where_: InstId,
        anchor: Anchor,
    ) -> Result<(), RegmuxError> {
        let state = self.state_mut(thread)?;
        reservation::reserve_aflags(state, arch, emitter, where_, anchor)
    }

    /// `unreserve_aflags(where, defer)` (§4.4).
    pub fn unreserve_aflags(
        &mut self,
        thread: ThreadId,
        arch: &dyn Arch,
        emitter: &mut dyn CodeEmitter,
        where_: InstId,
        anchor: Anchor,
        defer: bool,
    ) -> Result<(), RegmuxError> {
        let state = self.state_mut(thread)?;
        reservation::unreserve_aflags(state, arch, emitter, where_, anchor, defer)
    }

    /// `get_app_value(reg, dst, where, stateful)` (§4.4).
    #[allow(clippy::too_many_arguments)]
    pub fn get_app_value(
        &mut self,
        thread: ThreadId,
        emitter: &mut dyn CodeEmitter,
        reg: GprId,
        dst: GprId,
        where_: InstId,
        anchor: Anchor,
        stateful: bool,
    ) -> Result<(), RegmuxError> {
        let state = self.state_mut(thread)?;
        reservation::get_app_value(state, emitter, reg, dst, where_, anchor, stateful)
    }

    /// `restore_app_values_for(operand, swap, where)` (§4.4).
    #[allow(clippy::too_many_arguments)]
    pub fn restore_app_values_for(
        &mut self,
        thread: ThreadId,
        arch: &dyn Arch,
        emitter: &mut dyn CodeEmitter,
        operand: &OperandRegs,
        swap: &mut Option<GprId>,
        where_: InstId,
        anchor: Anchor,
    ) -> Result<(), RegmuxError> {
        let state = self.state_mut(thread)?;
        reservation::restore_app_values_for(state, arch, emitter, operand, swap, where_, anchor)
    }

    /// Cross-App-Instruction Shepherd (§4.5): call once per application
    /// instruction, in program order, during insertion.
    #[allow(clippy::too_many_arguments)]
    pub fn shepherd_instruction(
        &mut self,
        thread: ThreadId,
        arch: &dyn Arch,
        emitter: &mut dyn CodeEmitter,
        host: &dyn InstQuery,
        inst: InstId,
        block_props: BlockProperties,
    ) -> Result<(), RegmuxError> {
        let conservative = self.config.options().conservative;
        let state = self.state_mut(thread)?;
        shepherd_instruction(state, arch, emitter, host, inst, block_props, conservative)
    }

    /// Fault-Time State Reconstructor (§4.6). Stateless with respect to
    /// [`ThreadState`] - it works purely from decoded bytes, the TLS
    /// snapshot and the machine context, since by fault time the
    /// instrumented block's live `ThreadState` no longer exists.
    #[allow(clippy::too_many_arguments)]
    pub fn reconstruct_fault_state(
        &self,
        decoder: &dyn Decoder,
        raw_ctx: &dyn MachineContext,
        native_ctx: &mut dyn MachineContext,
        tls: &dyn TlsSnapshot,
        arch: &dyn Arch,
        fragment_start: u64,
        faulting_pc: u64,
    ) {
        reconstructor::reconstruct(
            decoder,
            raw_ctx,
            native_ctx,
            tls,
            &self.layout,
            self.gpr_slot_stride,
            arch.simd_widest_bytes() as u32,
            arch.accumulator(),
            fragment_start,
            faulting_pc,
        );
    }
}

/// Resolves a thread's TLS layout/segment the way a host's
/// [`ThreadLocalStorage`] implementation would hand it to [`Mediator::new`]
/// - pulled out as a free function since it has no other state to own.
pub fn layout_from_tls(tls: &dyn ThreadLocalStorage) -> TlsLayout {
    tls.layout()
}
