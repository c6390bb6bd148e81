//! DPI-C memory callbacks imported by the hardware model.
//!
//! The design calls these from inside `eval`, so they reach guest memory
//! through a handle bound here instead of through the driver.

use std::ffi::c_int;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use tracing::{error, trace};

use crate::memory::SharedMemory;

static DPI_MEMORY: Mutex<Option<SharedMemory>> = Mutex::new(None);
static MEM_TRACE: AtomicBool = AtomicBool::new(false);

/// Routes the DPI callbacks to `mem` until `unbind_memory`.
pub fn bind_memory(mem: SharedMemory, trace: bool) {
  MEM_TRACE.store(trace, Ordering::Relaxed);
  *DPI_MEMORY.lock().unwrap_or_else(PoisonError::into_inner) = Some(mem);
}

pub fn unbind_memory() {
  DPI_MEMORY.lock().unwrap_or_else(PoisonError::into_inner).take();
}

fn with_memory<R>(what: &str, f: impl FnOnce(&SharedMemory) -> anyhow::Result<R>) -> Option<R> {
  let guard = DPI_MEMORY.lock().unwrap_or_else(PoisonError::into_inner);
  let Some(mem) = guard.as_ref() else {
    error!("{what}: no memory bound");
    return None;
  };
  match f(mem) {
    Ok(r) => Some(r),
    Err(e) => {
      error!("{what}: {e:#}");
      mem.set_fault(format!("{what}: {e:#}"));
      None
    }
  }
}

fn read(what: &str, addr: c_int, len: c_int) -> c_int {
  let value = with_memory(what, |mem| {
    let len = u32::try_from(len).map_err(|_| anyhow::anyhow!("negative length {len}"))?;
    mem.read(addr as u32, len)
  })
  .unwrap_or(0);
  if MEM_TRACE.load(Ordering::Relaxed) {
    trace!("{what} addr={:#010x} len={len} data={value:#010x}", addr as u32);
  }
  value as c_int
}

fn write(what: &str, addr: c_int, len: c_int, data: c_int) {
  if MEM_TRACE.load(Ordering::Relaxed) {
    trace!("{what} addr={:#010x} len={len} data={:#010x}", addr as u32, data as u32);
  }
  with_memory(what, |mem| {
    let len = u32::try_from(len).map_err(|_| anyhow::anyhow!("negative length {len}"))?;
    mem.store(addr as u32, len, data as u32)
  });
}

/// `import "DPI-C" function int mem_read(input int addr)`
#[no_mangle]
pub extern "C" fn mem_read(addr: c_int) -> c_int {
  read("mem_read", addr, 4)
}

/// `import "DPI-C" function void mem_write(input int addr, input int data)`
#[no_mangle]
pub extern "C" fn mem_write(addr: c_int, data: c_int) {
  write("mem_write", addr, 4, data)
}

/// # Safety
/// `data` must be null or point to a writable `int`.
#[no_mangle]
pub unsafe extern "C" fn inst_mem_read(addr: c_int, len: c_int, data: *mut c_int) {
  let value = read("inst_mem_read", addr, len);
  if let Some(data) = data.as_mut() {
    *data = value;
  }
}

/// # Safety
/// `data` must be null or point to a writable `int`.
#[no_mangle]
pub unsafe extern "C" fn data_mem_read(addr: c_int, len: c_int, data: *mut c_int) {
  let value = read("data_mem_read", addr, len);
  if let Some(data) = data.as_mut() {
    *data = value;
  }
}

#[no_mangle]
pub extern "C" fn data_mem_write(addr: c_int, len: c_int, data: c_int) {
  write("data_mem_write", addr, len, data)
}
