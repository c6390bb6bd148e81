use std::ffi::c_void;

use super::{DiffContext, Direction, RefBackend};

extern "C" {
  fn difftest_init();
  fn difftest_memcpy(addr: u32, buf: *mut c_void, n: usize, direction: bool);
  fn difftest_regcpy(dut: *mut c_void, direction: bool);
  fn difftest_exec(n: u64);
  fn difftest_raise_intr(no: u64);
}

/// Reference model linked into the binary (see `build.rs`, feature `static-ref`).
///
/// The linked module is process-global, so only one `LinkedRef` should drive it.
pub struct LinkedRef {
  _private: (),
}

impl LinkedRef {
  pub fn new() -> Self {
    Self { _private: () }
  }
}

impl Default for LinkedRef {
  fn default() -> Self {
    Self::new()
  }
}

impl RefBackend for LinkedRef {
  fn init(&mut self) {
    unsafe { difftest_init() }
  }

  fn memcpy(&mut self, addr: u32, buf: &mut [u8], direction: Direction) {
    unsafe { difftest_memcpy(addr, buf.as_mut_ptr().cast(), buf.len(), direction.as_flag()) }
  }

  fn regcpy(&mut self, ctx: &mut DiffContext, direction: Direction) {
    let mut wire = ctx.to_wire();
    unsafe { difftest_regcpy((&mut wire as *mut DiffContext).cast(), direction.as_flag()) }
    if direction == Direction::ToDut {
      *ctx = wire.from_wire();
    }
  }

  fn exec(&mut self, n: u64) {
    unsafe { difftest_exec(n) }
  }

  fn raise_intr(&mut self, no: u64) {
    unsafe { difftest_raise_intr(no) }
  }
}
