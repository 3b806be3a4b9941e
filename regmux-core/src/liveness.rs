//! Liveness Analyzer (§4.3): block-mode reverse scan and forward-mode scan.

use std::collections::HashMap;

use regmux_isa::liveness::{AflagsMask, GprLiveness, SimdLiveness};
use regmux_isa::reg::SimdWidth;
use regmux_isa::{Arch, GprId, InstId, InstQuery, SimdId};

use crate::thread_state::ThreadState;

const SCAN_WIDTHS: [SimdWidth; 3] = [SimdWidth::Zmm, SimdWidth::Ymm, SimdWidth::Xmm];

fn live_at(width: SimdWidth) -> SimdLiveness {
    match width {
        SimdWidth::Xmm => SimdLiveness::XmmLive,
        SimdWidth::Ymm => SimdLiveness::YmmLive,
        SimdWidth::Zmm => SimdLiveness::ZmmLive,
    }
}

fn dead_at(width: SimdWidth) -> SimdLiveness {
    match width {
        SimdWidth::Xmm => SimdLiveness::XmmDead,
        SimdWidth::Ymm => SimdLiveness::YmmDead,
        SimdWidth::Zmm => SimdLiveness::ZmmDead,
    }
}

/// Per-block live vectors, indexed by *reverse* instruction position (0 is
/// the block's last instruction), plus the `InstId -> reverse position`
/// map every reservation-time query goes through (§3 "Live vectors").
pub struct BlockLiveness {
    gpr_live: Vec<Vec<GprLiveness>>,
    simd_live: Vec<Vec<SimdLiveness>>,
    aflags_live: Vec<AflagsMask>,
    index_of: HashMap<InstId, usize>,
    bb_has_internal_flow: bool,
}

impl BlockLiveness {
    pub fn gpr_liveness_at(&self, reg: GprId, inst: InstId) -> GprLiveness {
        match self.index_of.get(&inst) {
            Some(&i) => self.gpr_live[reg.0 as usize][i],
            None => GprLiveness::Unknown,
        }
    }

    pub fn simd_liveness_at(&self, reg: SimdId, inst: InstId) -> SimdLiveness {
        match self.index_of.get(&inst) {
            Some(&i) => self.simd_live[reg.0 as usize][i],
            None => SimdLiveness::Unknown,
        }
    }

    pub fn aflags_live_at(&self, inst: InstId) -> AflagsMask {
        match self.index_of.get(&inst) {
            Some(&i) => self.aflags_live[i],
            None => AflagsMask::ALL,
        }
    }

    pub fn contains(&self, inst: InstId) -> bool {
        self.index_of.contains_key(&inst)
    }

    /// Whether the scan observed a control transfer anywhere but the
    /// block's own terminator - the Shepherd's conservative-restore trigger
    /// (§4.5b), distinct from a client-declared [`BlockProperties`](regmux_isa::host::BlockProperties) hint.
    pub fn bb_has_internal_flow(&self) -> bool {
        self.bb_has_internal_flow
    }
}

/// Block mode (§4.3): one reverse scan over the whole block, run once at
/// block-analysis time. Also accumulates each register's `app_uses` count
/// into `state`, the reservation tie-breaker (§4.4 step 3).
pub fn analyze_block(host: &dyn InstQuery, arch: &dyn Arch, state: &mut ThreadState) -> BlockLiveness {
    let gpr_count = arch.gpr_count() as usize;
    let simd_count = arch.simd_count() as usize;

    for r in state.gpr.iter_mut() {
        r.app_uses = 0;
    }
    for r in state.simd.iter_mut() {
        r.app_uses = 0;
    }

    let mut gpr_running = vec![GprLiveness::Unknown; gpr_count];
    let mut simd_running = vec![SimdLiveness::Unknown; simd_count];
    let mut aflags_running = AflagsMask::EMPTY;

    let mut gpr_live: Vec<Vec<GprLiveness>> = vec![Vec::new(); gpr_count];
    let mut simd_live: Vec<Vec<SimdLiveness>> = vec![Vec::new(); simd_count];
    let mut aflags_live: Vec<AflagsMask> = Vec::new();
    let mut order: Vec<InstId> = Vec::new();
    let mut bb_has_internal_flow = false;

    let mut cursor = host.last();
    while let Some(inst) = cursor {
        order.push(inst);
        let boundary = host.is_block_boundary(inst);
        if host.is_control_transfer(inst) && !host.is_last_in_block(inst) {
            bb_has_internal_flow = true;
        }

        for g in 0..gpr_count {
            let gid = GprId(g as u8);
            if host.reads_gpr_inclusive(inst, gid) {
                gpr_running[g] = GprLiveness::Live;
                state.gpr[g].app_uses += 1;
            } else if host.writes_gpr_exact(inst, gid) {
                gpr_running[g] = GprLiveness::Dead;
                state.gpr[g].app_uses += 1;
            } else if boundary {
                gpr_running[g] = GprLiveness::Live;
            }
            gpr_live[g].push(gpr_running[g]);
        }

        for s in 0..simd_count {
            let sid = SimdId(s as u8);
            let read_width = SCAN_WIDTHS.iter().copied().find(|&w| host.reads_simd(inst, sid, w));
            if let Some(w) = read_width {
                simd_running[s] = live_at(w);
                state.simd[s].app_uses += 1;
            } else {
                let write_width = SCAN_WIDTHS
                    .iter()
                    .copied()
                    .find(|&w| host.writes_simd_exact(inst, sid, w));
                if let Some(w) = write_width {
                    simd_running[s] = dead_at(w);
                    state.simd[s].app_uses += 1;
                } else if boundary {
                    simd_running[s] = SimdLiveness::ZmmLive;
                }
            }
            simd_live[s].push(simd_running[s]);
        }

        let reads_total = host.reads_flags(inst).union(host.reads_condition_srcs(inst));
        let writes = host.writes_flags(inst);
        for &bit in arch.aflags_bits() {
            if reads_total.contains(bit) {
                aflags_running.set(bit);
            } else if writes.contains(bit) {
                aflags_running.clear(bit);
            }
        }
        if boundary {
            aflags_running = AflagsMask::ALL;
        }
        aflags_live.push(aflags_running);

        cursor = host.prev(inst);
    }

    let index_of = order.into_iter().enumerate().map(|(i, inst)| (inst, i)).collect();

    BlockLiveness {
        gpr_live,
        simd_live,
        aflags_live,
        index_of,
        bb_has_internal_flow,
    }
}

/// A single-point liveness snapshot produced by [`analyze_forward`]. Unlike
/// block mode this carries no position index: forward mode only ever
/// answers "what is live right here", used outside the insertion phase
/// (§4.3 "Forward mode").
pub struct ForwardLiveness {
    gpr: Vec<GprLiveness>,
    simd: Vec<SimdLiveness>,
    aflags: AflagsMask,
}

impl ForwardLiveness {
    pub fn gpr(&self, reg: GprId) -> GprLiveness {
        self.gpr[reg.0 as usize]
    }

    pub fn simd(&self, reg: SimdId) -> SimdLiveness {
        self.simd[reg.0 as usize]
    }

    pub fn aflags(&self) -> AflagsMask {
        self.aflags
    }
}

/// Linear forward scan from `start` until the first block boundary
/// instruction (inclusive), resolving the *first* event seen per register.
/// Anything still unresolved at the end is pessimistically Live (§4.3).
pub fn analyze_forward(host: &dyn InstQuery, arch: &dyn Arch, start: InstId) -> ForwardLiveness {
    let gpr_count = arch.gpr_count() as usize;
    let simd_count = arch.simd_count() as usize;

    let mut gpr = vec![GprLiveness::Unknown; gpr_count];
    let mut simd = vec![SimdLiveness::Unknown; simd_count];
    let mut aflags_read = AflagsMask::EMPTY;
    let mut aflags_written = AflagsMask::EMPTY;

    let mut cursor = Some(start);
    while let Some(inst) = cursor {
        for g in 0..gpr_count {
            if gpr[g] != GprLiveness::Unknown {
                continue;
            }
            let gid = GprId(g as u8);
            if host.reads_gpr_inclusive(inst, gid) {
                gpr[g] = GprLiveness::Live;
            } else if host.writes_gpr_exact(inst, gid) {
                gpr[g] = GprLiveness::Dead;
            }
        }

        for s in 0..simd_count {
            if simd[s] != SimdLiveness::Unknown {
                continue;
            }
            let sid = SimdId(s as u8);
            let resolved = SCAN_WIDTHS
                .iter()
                .copied()
                .find(|&w| host.reads_simd(inst, sid, w))
                .map(live_at)
                .or_else(|| {
                    SCAN_WIDTHS
                        .iter()
                        .copied()
                        .find(|&w| host.writes_simd_exact(inst, sid, w))
                        .map(dead_at)
                });
            if let Some(v) = resolved {
                simd[s] = v;
            }
        }

        let reads_total = host.reads_flags(inst).union(host.reads_condition_srcs(inst));
        let writes = host.writes_flags(inst);
        for &bit in arch.aflags_bits() {
            if aflags_read.contains(bit) || aflags_written.contains(bit) {
                continue;
            }
            if reads_total.contains(bit) {
                aflags_read.set(bit);
            } else if writes.contains(bit) {
                aflags_written.set(bit);
            }
        }

        if host.is_block_boundary(inst) {
            break;
        }
        cursor = host.next(inst);
    }

    for g in gpr.iter_mut() {
        if *g == GprLiveness::Unknown {
            *g = GprLiveness::Live;
        }
    }
    for s in simd.iter_mut() {
        if *s == SimdLiveness::Unknown {
            *s = SimdLiveness::ZmmLive;
        }
    }

    let mut aflags = AflagsMask::EMPTY;
    for &bit in arch.aflags_bits() {
        if aflags_read.contains(bit) || !aflags_written.contains(bit) {
            aflags.set(bit);
        }
    }

    ForwardLiveness { gpr, simd, aflags }
}
