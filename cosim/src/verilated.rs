//! Hardware model behind a thin C wrapper around the Verilator-generated top.
//!
//! The wrapper owns the `V<top>` instance and exposes its ports one by one;
//! the harness owns the clock and the main loop.

use std::ffi::{c_int, c_void};
use std::ptr::NonNull;
use tracing::{error, info};

use crate::{
  dpi,
  drive::Driver,
  dut::{CoreDebugInfo, DutModel},
  plusarg::PlusArgMatcher,
  ref_module::NR_GPR,
  SimArgs,
};

/// Debug taps as the wrapper writes them.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct RawDebugInfo {
  intr_cause: u64,
  pc: u32,
  next_pc: u32,
  inst: u32,
  gpr: [u32; NR_GPR],
  has_gpr: u8,
  skip: u8,
  has_intr: u8,
  _pad: u8,
}

impl From<RawDebugInfo> for CoreDebugInfo {
  fn from(raw: RawDebugInfo) -> Self {
    CoreDebugInfo {
      pc: raw.pc,
      next_pc: raw.next_pc,
      inst: raw.inst,
      gpr: (raw.has_gpr != 0).then_some(raw.gpr),
      skip: raw.skip != 0,
      interrupt: (raw.has_intr != 0).then_some(raw.intr_cause),
    }
  }
}

extern "C" {
  fn cosim_dut_new() -> *mut c_void;
  fn cosim_dut_delete(top: *mut c_void);
  fn cosim_dut_set_reset(top: *mut c_void, high: u8);
  fn cosim_dut_set_clock(top: *mut c_void, high: u8);
  fn cosim_dut_eval(top: *mut c_void);
  fn cosim_dut_inst_done(top: *mut c_void) -> u8;
  fn cosim_dut_debug(top: *mut c_void, info: *mut RawDebugInfo);
}

pub struct VerilatedDut {
  top: NonNull<c_void>,
}

impl VerilatedDut {
  pub fn new() -> anyhow::Result<Self> {
    let top = NonNull::new(unsafe { cosim_dut_new() })
      .ok_or_else(|| anyhow::anyhow!("cosim_dut_new returned null"))?;
    Ok(Self { top })
  }
}

impl Drop for VerilatedDut {
  fn drop(&mut self) {
    unsafe { cosim_dut_delete(self.top.as_ptr()) }
  }
}

impl DutModel for VerilatedDut {
  fn set_reset(&mut self, high: bool) {
    unsafe { cosim_dut_set_reset(self.top.as_ptr(), high as u8) }
  }

  fn set_clock(&mut self, high: bool) {
    unsafe { cosim_dut_set_clock(self.top.as_ptr(), high as u8) }
  }

  fn eval(&mut self) {
    unsafe { cosim_dut_eval(self.top.as_ptr()) }
  }

  fn inst_done(&self) -> bool {
    unsafe { cosim_dut_inst_done(self.top.as_ptr()) != 0 }
  }

  fn debug_info(&self) -> CoreDebugInfo {
    let mut raw = RawDebugInfo::default();
    unsafe { cosim_dut_debug(self.top.as_ptr(), &mut raw) };
    raw.into()
  }
}

fn run() -> anyhow::Result<c_int> {
  let args = SimArgs::from_plusargs(&PlusArgMatcher::from_args())?;
  args.setup_logger()?;
  info!("cosim start");

  let mut driver = Driver::setup(VerilatedDut::new()?, &args)?;
  dpi::bind_memory(driver.memory().clone(), args.mem_trace);
  let report = driver.run();
  dpi::unbind_memory();

  Ok(report.state.exit_code())
}

/// Harness entry point for the C++ `main` of the simulation binary.
#[no_mangle]
pub extern "C" fn cosim_main() -> c_int {
  match run() {
    Ok(code) => code,
    Err(e) => {
      error!("cosim: {e:#}");
      // the logger may not be up yet
      eprintln!("cosim: {e:#}");
      2
    }
  }
}
