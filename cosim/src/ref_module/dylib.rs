use anyhow::Context;
use libc::{RTLD_LAZY, RTLD_LOCAL};
use libloading::os::unix::Library;
use std::ffi::c_void;
use std::path::Path;

use super::{DiffContext, Direction, RefBackend};

type MemcpyFn = unsafe extern "C" fn(u32, *mut c_void, usize, bool);
type RegcpyFn = unsafe extern "C" fn(*mut c_void, bool);
type ExecFn = unsafe extern "C" fn(u64);
type RaiseIntrFn = unsafe extern "C" fn(u64);
type InitFn = unsafe extern "C" fn();

unsafe fn load_symbol<T: Copy>(lib: &Library, symbol: &'static [u8]) -> anyhow::Result<T> {
  let sym = lib.get::<T>(symbol).with_context(|| {
    let name = String::from_utf8_lossy(symbol.strip_suffix(b"\0").unwrap_or(symbol)).into_owned();
    format!("symbol '{name}' not found in reference module")
  })?;
  Ok(*sym)
}

/// Reference model loaded at runtime from a shared object (e.g. a nemu
/// `riscv32-nemu-interpreter-so` build).
pub struct DylibRef {
  memcpy: MemcpyFn,
  regcpy: RegcpyFn,
  exec: ExecFn,
  raise_intr: RaiseIntrFn,
  init: InitFn,
  // keeps the entry points above valid; dropped last
  _lib: Library,
}

impl DylibRef {
  /// Opens `path` and resolves the five entry points in ABI order.
  pub fn open(path: &Path) -> anyhow::Result<Self> {
    let lib = unsafe { Library::open(Some(path), RTLD_LAZY | RTLD_LOCAL) }
      .with_context(|| format!("failed to load reference module '{}'", path.display()))?;
    unsafe {
      Ok(Self {
        memcpy: load_symbol(&lib, b"difftest_memcpy\0")?,
        regcpy: load_symbol(&lib, b"difftest_regcpy\0")?,
        exec: load_symbol(&lib, b"difftest_exec\0")?,
        raise_intr: load_symbol(&lib, b"difftest_raise_intr\0")?,
        init: load_symbol(&lib, b"difftest_init\0")?,
        _lib: lib,
      })
    }
  }
}

impl RefBackend for DylibRef {
  fn init(&mut self) {
    unsafe { (self.init)() }
  }

  fn memcpy(&mut self, addr: u32, buf: &mut [u8], direction: Direction) {
    unsafe { (self.memcpy)(addr, buf.as_mut_ptr().cast(), buf.len(), direction.as_flag()) }
  }

  fn regcpy(&mut self, ctx: &mut DiffContext, direction: Direction) {
    let mut wire = ctx.to_wire();
    unsafe { (self.regcpy)((&mut wire as *mut DiffContext).cast(), direction.as_flag()) }
    if direction == Direction::ToDut {
      *ctx = wire.from_wire();
    }
  }

  fn exec(&mut self, n: u64) {
    unsafe { (self.exec)(n) }
  }

  fn raise_intr(&mut self, no: u64) {
    unsafe { (self.raise_intr)(no) }
  }
}
