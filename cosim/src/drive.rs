use regex::{Captures, Regex};
use riscv_isa::{decode_full, Target};
use std::str::FromStr;
use tracing::{debug, error, info, trace, warn};

use crate::{
  difftest::{DiffState, Difftest, Divergence},
  dut::{Core, CoreDebugInfo, DutModel},
  memory::{SharedMemory, VMem, GUEST_BASE},
  ref_module::{RefModule, NR_GPR},
  SimArgs,
};

#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SimState {
  Running = 0,
  GoodTrap,
  BadTrap,
  Timeout,
  Finished,
}

impl SimState {
  /// Process exit status for this outcome.
  pub fn exit_code(self) -> i32 {
    match self {
      SimState::GoodTrap | SimState::Finished => 0,
      _ => 1,
    }
  }
}

const EBREAK: u32 = 0x0010_0073;
const OPCODE_SYSTEM: u32 = 0x73;

/// csrrw/csrrs/csrrc and their immediate forms.
pub fn is_csr_access(inst: u32) -> bool {
  inst & 0x7f == OPCODE_SYSTEM && matches!((inst >> 12) & 0x7, 1 | 2 | 3 | 5 | 6 | 7)
}

/// Where and how the run diverged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DivergenceReport {
  /// 1-based index of the retired instruction.
  pub inst_index: u64,
  pub pc: u32,
  pub inst: u32,
  pub divergence: Divergence,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimReport {
  pub state: SimState,
  pub inst_count: u64,
  pub cycle_count: u64,
  /// `a0` at `ebreak`; `None` when the run did not trap or nothing exposed it.
  pub exit_code: Option<u32>,
  pub divergence: Option<DivergenceReport>,
}

/// Runs a DUT in lockstep with the reference model until it traps, diverges,
/// hangs or hits the instruction limit.
pub struct Driver<D: DutModel> {
  core: Core<D>,
  difftest: Difftest,
  mem: SharedMemory,

  state: SimState,
  exit_code: Option<u32>,
  divergence: Option<DivergenceReport>,

  inst_trace: bool,
  mem_trace: bool,
  skip_csr: bool,
  max_insts: Option<u64>,
  max_cycles_per_inst: u64,

  target: Target,
  operand_re: Regex,
}

impl<D: DutModel> Driver<D> {
  pub fn new(dut: D, mem: SharedMemory, refmodule: RefModule, args: &SimArgs) -> anyhow::Result<Self> {
    let target = Target::from_str("RV32IMACZifencei_Zicsr")
      .map_err(|e| anyhow::anyhow!("unsupported disassembler target: {e:?}"))?;
    let operand_re = Regex::new(
      r"(?x)
        (-?\b\d+\b)     # offset
        \(
          (x\d+)        # base register
        \)
        |
        (\bx\d+\b)      # plain register
      ",
    )?;

    Ok(Self {
      core: Core::new(dut),
      difftest: Difftest::new(refmodule),
      mem,
      state: SimState::Running,
      exit_code: None,
      divergence: None,
      inst_trace: args.inst_trace,
      mem_trace: args.mem_trace,
      skip_csr: args.skip_csr,
      max_insts: args.max_insts,
      max_cycles_per_inst: args.max_cycles_per_inst,
      target,
      operand_re,
    })
  }

  /// Loads the image, binds the reference model to it and builds the driver.
  pub fn setup(dut: D, args: &SimArgs) -> anyhow::Result<Self> {
    let mut vmem = VMem::new();
    let image = vmem.load_image(args.image_file.as_deref(), GUEST_BASE)?;
    if image.entry != GUEST_BASE {
      info!("image entry {:#010x} differs from reset vector {GUEST_BASE:#010x}", image.entry);
    }

    let refmodule = if !args.difftest {
      info!("difftest disabled by configuration");
      RefModule::disabled()
    } else {
      Self::bind_ref(args, &vmem, image.base, image.size)
    };

    Self::new(dut, SharedMemory::new(vmem), refmodule, args)
  }

  #[cfg(feature = "static-ref")]
  fn bind_ref(args: &SimArgs, vmem: &VMem, base: u32, size: usize) -> RefModule {
    match args.ref_so.as_deref() {
      Some(path) => RefModule::new(Some(path), vmem, base, size),
      None => RefModule::linked(vmem, base, size),
    }
  }

  #[cfg(not(feature = "static-ref"))]
  fn bind_ref(args: &SimArgs, vmem: &VMem, base: u32, size: usize) -> RefModule {
    RefModule::new(args.ref_so.as_deref(), vmem, base, size)
  }

  pub fn memory(&self) -> &SharedMemory {
    &self.mem
  }

  pub fn difftest(&mut self) -> &mut Difftest {
    &mut self.difftest
  }

  pub fn core(&mut self) -> &mut Core<D> {
    &mut self.core
  }

  pub fn state(&self) -> SimState {
    self.state
  }

  /// Resets the core and runs to completion.
  pub fn run(&mut self) -> SimReport {
    self.core.reset();
    while self.state == SimState::Running {
      self.step_inst();
    }
    self.log_final();
    self.report()
  }

  pub fn report(&self) -> SimReport {
    SimReport {
      state: self.state,
      inst_count: self.core.inst_cnt(),
      cycle_count: self.core.cycle_cnt(),
      exit_code: self.exit_code,
      divergence: self.divergence.clone(),
    }
  }

  /// Runs the core to the next retirement and checks it.
  pub fn step_inst(&mut self) {
    if self.state != SimState::Running {
      return;
    }

    if let Err(e) = self.core.run_inst_once(self.max_cycles_per_inst) {
      error!("[{}] watchdog timeout: {e:#}", self.core.cycle_cnt());
      self.state = SimState::Timeout;
      return;
    }

    let info = self.core.debug_info();
    let index = self.core.inst_cnt();
    if self.inst_trace {
      let disasm = self.disasm(info.inst, info.gpr.as_ref());
      trace!("[{index}] pc={:#010x} inst={:#010x} {disasm}", info.pc, info.inst);
    }

    if let Some(fault) = self.mem.take_fault() {
      error!("[{index}] memory fault at pc={:#010x}: {fault}", info.pc);
      self.state = SimState::BadTrap;
      return;
    }

    // stores must reach REF before it executes the instruction that made them
    for store in self.mem.drain_stores() {
      if self.mem_trace {
        trace!(
          "[{index}] store_commit addr={:#010x} len={} data={}",
          store.addr,
          store.len,
          hex::encode(&store.data.to_le_bytes()[..store.len as usize])
        );
      }
      if let Err(e) = self.difftest.store_commit(store.addr, store.data, store.len) {
        error!("[{index}] {e:#}");
        self.state = SimState::BadTrap;
        return;
      }
    }

    // a trap entry is never skipped: REF has to take it too
    let skip = info.skip || (self.skip_csr && is_csr_access(info.inst));
    if skip && info.interrupt.is_none() {
      debug!("[{index}] skip difftest for pc={:#010x} inst={:#010x}", info.pc, info.inst);
      if let Err(e) = self.difftest.skip_dut_once() {
        error!("[{index}] {e:#}");
        self.state = SimState::BadTrap;
        return;
      }
    }

    let result = match info.interrupt {
      Some(cause) => self.difftest.raise_intr(cause, info.next_pc, info.gpr.as_ref()),
      None => self.difftest.step(info.pc, info.next_pc, info.gpr.as_ref()),
    };
    if let Err(divergence) = result {
      self.report_divergence(index, &info, divergence);
      self.state = SimState::BadTrap;
      return;
    }

    if info.interrupt.is_none() && info.inst == EBREAK {
      self.exit_code = self.a0(&info);
      self.state = match self.exit_code {
        Some(0) => SimState::GoodTrap,
        Some(_) => SimState::BadTrap,
        None => SimState::Finished,
      };
      match self.exit_code {
        Some(a0) => info!("[{index}] ebreak at pc={:#010x}, a0={a0:#x}", info.pc),
        None => warn!(
          "[{index}] ebreak at pc={:#010x}, exit code unknown: no register tap and no reference",
          info.pc
        ),
      }
    } else if self.max_insts.is_some_and(|max| index >= max) {
      info!("[{index}] instruction limit reached");
      self.state = SimState::Finished;
    }
  }

  // the DUT's a0 when it is tapped, otherwise the reference's
  fn a0(&mut self, info: &CoreDebugInfo) -> Option<u32> {
    match info.gpr {
      Some(gpr) => Some(gpr[10]),
      None if self.difftest.state() == DiffState::Disabled => None,
      None => Some(self.difftest.ref_module().context().reg(10)),
    }
  }

  fn report_divergence(&mut self, index: u64, info: &CoreDebugInfo, divergence: Divergence) {
    let disasm = self.disasm(info.inst, info.gpr.as_ref());
    error!(
      "[{index}] dut pc: {:#010x}, inst: {:#010x} [{disasm}], cycle: {}",
      info.pc,
      info.inst,
      self.core.cycle_cnt()
    );
    error!("[{index}] difftest mismatch! {divergence}");
    self.divergence = Some(DivergenceReport { inst_index: index, pc: info.pc, inst: info.inst, divergence });
  }

  fn log_final(&self) {
    let (insts, cycles) = (self.core.inst_cnt(), self.core.cycle_cnt());
    match self.state {
      SimState::GoodTrap => info!("sim_final: GoodTrap ({insts} insts, {cycles} cycles)"),
      SimState::Finished => info!("sim_final: Finished ({insts} insts, {cycles} cycles)"),
      SimState::BadTrap => error!("sim_final: BadTrap ({insts} insts, {cycles} cycles)"),
      SimState::Timeout => error!("sim_final: Timeout ({insts} insts, {cycles} cycles)"),
      SimState::Running => error!("sim_final: Running"),
    }
  }

  /// Disassembly with register operands annotated by their values.
  pub fn disasm(&self, inst: u32, gpr: Option<&[u32; NR_GPR]>) -> String {
    let raw = decode_full(inst, &self.target).to_string();
    let Some(gpr) = gpr else {
      return raw;
    };
    let value = |name: &str| -> Option<u32> {
      let idx: usize = name.strip_prefix('x')?.parse().ok()?;
      match idx {
        0 => Some(0),
        1..=31 => Some(gpr[idx]),
        _ => None,
      }
    };

    self
      .operand_re
      .replace_all(&raw, |caps: &Captures| {
        if let (Some(offset), Some(base)) = (caps.get(1), caps.get(2)) {
          let (Ok(offset_num), Some(base_val)) = (offset.as_str().parse::<i32>(), value(base.as_str()))
          else {
            return caps[0].to_string();
          };
          let addr = base_val.wrapping_add(offset_num as u32);
          format!("{}({}<{:#x}>)=<{:#x}>", offset.as_str(), base.as_str(), base_val, addr)
        } else if let Some(reg) = caps.get(3) {
          match value(reg.as_str()) {
            Some(v) => format!("{}<{:#x}>", reg.as_str(), v),
            None => caps[0].to_string(),
          }
        } else {
          caps[0].to_string()
        }
      })
      .into_owned()
  }
}
