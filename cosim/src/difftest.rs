use std::fmt;
use thiserror::Error;
use tracing::{debug, error};

use crate::ref_module::{gpr_name, DiffContext, Direction, RefModule, NR_GPR};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffState {
  /// No reference model; every step passes.
  Disabled,
  Armed,
  /// The next step is consumed without comparison.
  SkipPending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
  Pc,
  Gpr(usize),
}

impl fmt::Display for Field {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Field::Pc => write!(f, "pc"),
      Field::Gpr(i) => write!(f, "gpr{i}({})", gpr_name(*i)),
    }
  }
}

/// One architectural field that differs between REF and DUT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mismatch {
  pub field: Field,
  pub ref_val: u32,
  pub dut_val: u32,
}

impl fmt::Display for Mismatch {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} mismatch! ref={:#010x}, dut={:#010x}", self.field, self.ref_val, self.dut_val)
  }
}

fn join(mismatches: &[Mismatch]) -> String {
  mismatches.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Divergence {
  /// REF expects to execute somewhere else than the DUT did; the harness lost sync.
  #[error("pc mismatch before execution! ref={ref_pc:#010x}, dut={dut_pc:#010x}")]
  PcBeforeExec { ref_pc: u32, dut_pc: u32 },
  /// State differs after the instruction at `pc`.
  #[error("{} field(s) diverged after pc={pc:#010x}: {}", .mismatches.len(), join(.mismatches))]
  State { pc: u32, mismatches: Vec<Mismatch> },
}

/// Lockstep comparison of the DUT against a reference model.
///
/// After the DUT retires an instruction the harness commits the stores it made
/// (`store_commit`), then calls `step` with the PC the instruction executed at
/// and the DUT state after it. REF is checked to be at the same PC, advanced by
/// one instruction and compared field by field: PC first, then x0..x31.
///
/// A mismatch is reported, never repaired: neither side is overwritten from
/// the other.
pub struct Difftest {
  refmodule: RefModule,
  skip: bool,
}

impl Difftest {
  pub fn new(refmodule: RefModule) -> Self {
    Self { refmodule, skip: false }
  }

  pub fn state(&self) -> DiffState {
    if !self.refmodule.is_enabled() {
      DiffState::Disabled
    } else if self.skip {
      DiffState::SkipPending
    } else {
      DiffState::Armed
    }
  }

  pub fn ref_module(&mut self) -> &mut RefModule {
    &mut self.refmodule
  }

  /// Lets the next `step` pass without comparison, for instructions REF cannot
  /// model. At most one skip may be pending.
  pub fn skip_dut_once(&mut self) -> anyhow::Result<()> {
    match self.state() {
      DiffState::Disabled => Ok(()),
      DiffState::Armed => {
        self.skip = true;
        Ok(())
      }
      DiffState::SkipPending => anyhow::bail!("skip_dut_once: a skip is already pending"),
    }
  }

  /// Mirrors a DUT store of the low `len` bytes of `data` into REF memory.
  pub fn store_commit(&mut self, addr: u32, data: u32, len: u32) -> anyhow::Result<()> {
    if !(1..=4).contains(&len) {
      anyhow::bail!("store_commit addr={addr:#x}: length {len} out of range 1..=4");
    }
    let mut bytes = data.to_le_bytes();
    self.refmodule.memcpy(addr, &mut bytes[..len as usize], Direction::ToRef);
    Ok(())
  }

  /// Compares one retired DUT instruction against REF.
  ///
  /// `dut_gpr` is `None` when the DUT exposes no register file tap; then only the PC is checked.
  pub fn step(
    &mut self,
    dut_pre_pc: u32,
    dut_post_pc: u32,
    dut_gpr: Option<&[u32; NR_GPR]>,
  ) -> Result<(), Divergence> {
    match self.state() {
      DiffState::Disabled => return Ok(()),
      DiffState::SkipPending => {
        self.consume_skip(dut_post_pc, dut_gpr);
        return Ok(());
      }
      DiffState::Armed => {}
    }

    let ref_pc = self.refmodule.context().pc;
    if ref_pc != dut_pre_pc {
      let divergence = Divergence::PcBeforeExec { ref_pc, dut_pc: dut_pre_pc };
      error!("{divergence}");
      return Err(divergence);
    }

    self.refmodule.exec(1);
    self.check(dut_pre_pc, dut_post_pc, dut_gpr)
  }

  /// Has REF take trap `cause` and compares against the DUT's post-trap state.
  pub fn raise_intr(
    &mut self,
    cause: u64,
    dut_post_pc: u32,
    dut_gpr: Option<&[u32; NR_GPR]>,
  ) -> Result<(), Divergence> {
    match self.state() {
      DiffState::Disabled => return Ok(()),
      DiffState::SkipPending => {
        self.consume_skip(dut_post_pc, dut_gpr);
        return Ok(());
      }
      DiffState::Armed => {}
    }

    let pc = self.refmodule.context().pc;
    debug!("difftest: raise_intr cause={cause:#x} at pc={pc:#010x}");
    self.refmodule.raise_intr(cause);
    self.check(pc, dut_post_pc, dut_gpr)
  }

  // Reference resumes from the DUT's state after the skipped instruction.
  fn consume_skip(&mut self, dut_post_pc: u32, dut_gpr: Option<&[u32; NR_GPR]>) {
    self.skip = false;
    let mut ctx = self.refmodule.context();
    ctx.pc = dut_post_pc;
    if let Some(gpr) = dut_gpr {
      ctx.gpr = *gpr;
    }
    self.refmodule.set_context(ctx);
    debug!("difftest: skipped, reference resynced to pc={dut_post_pc:#010x}");
  }

  fn check(
    &mut self,
    pc: u32,
    dut_post_pc: u32,
    dut_gpr: Option<&[u32; NR_GPR]>,
  ) -> Result<(), Divergence> {
    let ref_ctx = self.refmodule.context();
    let mismatches = compare(&ref_ctx, dut_post_pc, dut_gpr);
    if mismatches.is_empty() {
      return Ok(());
    }
    for mismatch in &mismatches {
      error!("{mismatch}");
    }
    Err(Divergence::State { pc, mismatches })
  }
}

fn compare(ref_ctx: &DiffContext, dut_pc: u32, dut_gpr: Option<&[u32; NR_GPR]>) -> Vec<Mismatch> {
  let mut mismatches = Vec::new();
  if ref_ctx.pc != dut_pc {
    mismatches.push(Mismatch { field: Field::Pc, ref_val: ref_ctx.pc, dut_val: dut_pc });
  }
  if let Some(gpr) = dut_gpr {
    let dut_ctx = DiffContext::new(*gpr, dut_pc);
    for i in 0..NR_GPR {
      let (ref_val, dut_val) = (ref_ctx.reg(i), dut_ctx.reg(i));
      if ref_val != dut_val {
        mismatches.push(Mismatch { field: Field::Gpr(i), ref_val, dut_val });
      }
    }
  }
  mismatches
}
