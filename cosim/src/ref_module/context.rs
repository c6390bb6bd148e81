use std::mem::size_of;

/// Revision of the register-context layout shared with reference modules.
pub const CONTEXT_LAYOUT_VERSION: u32 = 1;

pub const NR_GPR: usize = 32;

/// Bytes of one context on the wire: 32 GPRs then the PC, all little-endian u32.
pub const CONTEXT_BYTES: usize = (NR_GPR + 1) * 4;

/// Architectural state exchanged with the reference module by `difftest_regcpy`.
///
/// The layout is the wire contract: `gpr[0..32]` immediately followed by `pc`,
/// each a little-endian 32-bit word, no padding. The bridge hands a pointer to
/// this struct across the module boundary, so fields must never be reordered.
/// Values are kept in host order; `to_wire`/`from_wire` convert at the boundary.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DiffContext {
  pub gpr: [u32; NR_GPR],
  pub pc: u32,
}

const _: () = assert!(size_of::<DiffContext>() == CONTEXT_BYTES);

impl DiffContext {
  pub fn new(gpr: [u32; NR_GPR], pc: u32) -> Self {
    Self { gpr, pc }
  }

  /// Register `idx`; x0 reads as zero whatever the storage holds.
  pub fn reg(&self, idx: usize) -> u32 {
    if idx == 0 {
      0
    } else {
      self.gpr[idx]
    }
  }

  /// Host order to little-endian wire order. A no-op on little-endian hosts.
  pub(crate) fn to_wire(mut self) -> Self {
    self.gpr.iter_mut().for_each(|r| *r = r.to_le());
    self.pc = self.pc.to_le();
    self
  }

  pub(crate) fn from_wire(mut self) -> Self {
    self.gpr.iter_mut().for_each(|r| *r = u32::from_le(*r));
    self.pc = u32::from_le(self.pc);
    self
  }

  pub fn to_bytes(&self) -> [u8; CONTEXT_BYTES] {
    let mut bytes = [0u8; CONTEXT_BYTES];
    let words = self.gpr.iter().chain(std::iter::once(&self.pc));
    for (chunk, word) in bytes.chunks_exact_mut(4).zip(words) {
      chunk.copy_from_slice(&word.to_le_bytes());
    }
    bytes
  }

  pub fn from_bytes(bytes: &[u8; CONTEXT_BYTES]) -> Self {
    let mut words = bytes
      .chunks_exact(4)
      .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
    let mut ctx = Self::default();
    for r in ctx.gpr.iter_mut() {
      *r = words.next().unwrap_or(0);
    }
    ctx.pc = words.next().unwrap_or(0);
    ctx
  }
}

/// ABI name of general-purpose register `idx`.
pub fn gpr_name(idx: usize) -> &'static str {
  const NAMES: [&str; NR_GPR] = [
    "zero", "ra", "sp", "gp", "tp", "t0", "t1", "t2", "s0", "s1", "a0", "a1", "a2", "a3", "a4",
    "a5", "a6", "a7", "s2", "s3", "s4", "s5", "s6", "s7", "s8", "s9", "s10", "s11", "t3", "t4",
    "t5", "t6",
  ];
  NAMES.get(idx).copied().unwrap_or("?")
}
