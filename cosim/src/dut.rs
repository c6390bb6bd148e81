use tracing::{debug, error};

use crate::ref_module::NR_GPR;

const RESET_CYCLES: u32 = 20;

/// Debug taps sampled once per retired instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CoreDebugInfo {
  /// PC of the instruction that just retired.
  pub pc: u32,
  /// PC the core continues at.
  pub next_pc: u32,
  pub inst: u32,
  /// Register file after the instruction, if the design exposes it.
  pub gpr: Option<[u32; NR_GPR]>,
  /// The design asks for this instruction not to be compared.
  pub skip: bool,
  /// Cause code when the retirement was a trap entry instead of an instruction.
  pub interrupt: Option<u64>,
}

/// What the harness needs from a hardware simulation model.
///
/// `Core` owns the clock: it drives `set_clock` and `eval` for each
/// half-cycle and samples `inst_done` after every rising edge.
pub trait DutModel {
  fn set_reset(&mut self, high: bool);
  fn set_clock(&mut self, high: bool);
  fn eval(&mut self);
  /// Retirement strobe, valid after an `eval` following a rising edge.
  fn inst_done(&self) -> bool;
  fn debug_info(&self) -> CoreDebugInfo;
}

/// Steps a `DutModel` in cycles and instructions.
pub struct Core<D: DutModel> {
  dut: D,
  clock: bool,
  cycle_cnt: u64,
  inst_cnt: u64,
}

impl<D: DutModel> Core<D> {
  pub fn new(dut: D) -> Self {
    Self { dut, clock: false, cycle_cnt: 0, inst_cnt: 0 }
  }

  pub fn dut(&self) -> &D {
    &self.dut
  }

  pub fn dut_mut(&mut self) -> &mut D {
    &mut self.dut
  }

  pub fn cycle_cnt(&self) -> u64 {
    self.cycle_cnt
  }

  pub fn inst_cnt(&self) -> u64 {
    self.inst_cnt
  }

  /// Holds reset for `RESET_CYCLES` cycles and releases it with the clock low.
  pub fn reset(&mut self) {
    self.clock = false;
    self.dut.set_clock(false);
    self.dut.set_reset(true);
    for _ in 0..RESET_CYCLES * 2 {
      self.dut.eval();
      self.clock = !self.clock;
      self.dut.set_clock(self.clock);
      self.dut.eval();
    }
    self.dut.set_reset(false);
    self.dut.eval();
    self.cycle_cnt = 0;
    self.inst_cnt = 0;
    debug!("core reset for {RESET_CYCLES} cycles");
  }

  /// Toggles the clock and evaluates. Returns true on a rising edge.
  pub fn toggle_clock(&mut self) -> bool {
    self.clock = !self.clock;
    self.dut.set_clock(self.clock);
    self.dut.eval();
    if self.clock {
      self.cycle_cnt += 1;
    }
    self.clock
  }

  /// One full cycle.
  pub fn tick(&mut self) -> bool {
    let mut retired = false;
    for _ in 0..2 {
      if self.toggle_clock() && self.dut.inst_done() {
        retired = true;
      }
    }
    if retired {
      self.inst_cnt += 1;
    }
    retired
  }

  /// Runs until one instruction retires. Fails after `max_cycles` cycles
  /// without a retirement rather than spinning on a hung design.
  pub fn run_inst_once(&mut self, max_cycles: u64) -> anyhow::Result<u64> {
    let start = self.cycle_cnt;
    loop {
      if self.tick() {
        return Ok(self.cycle_cnt - start);
      }
      let waited = self.cycle_cnt - start;
      if waited >= max_cycles {
        let info = self.dut.debug_info();
        error!(
          "no instruction retired in {waited} cycles (last pc={:#010x}, inst_cnt={})",
          info.pc, self.inst_cnt
        );
        anyhow::bail!("core stuck: no retirement within {max_cycles} cycles");
      }
    }
  }

  /// Runs `num_inst` instructions; returns how many retired before any failure.
  pub fn run_inst(&mut self, num_inst: u64, max_cycles: u64) -> (u64, anyhow::Result<()>) {
    for done in 0..num_inst {
      if let Err(e) = self.run_inst_once(max_cycles) {
        return (done, Err(e));
      }
    }
    (num_inst, Ok(()))
  }

  /// Runs `num_cycle` cycles; returns the number of instructions retired.
  pub fn run_cycle(&mut self, num_cycle: u64) -> u64 {
    (0..num_cycle).filter(|_| self.tick()).count() as u64
  }

  pub fn debug_info(&self) -> CoreDebugInfo {
    self.dut.debug_info()
  }
}
