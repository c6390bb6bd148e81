//! In-process stand-ins for the hardware model and the reference module.
//!
//! Both sides run the same tiny RV32I interpreter. The DUT side retires one
//! instruction every `latency` cycles through `SharedMemory`, the way a
//! design reaches memory over DPI. Knobs on `FakeCore` inject the failures the
//! harness has to catch.

#![allow(dead_code)]

use cosim::{
  drive::Driver,
  dut::{CoreDebugInfo, DutModel},
  memory::{SharedMemory, VMem, GUEST_BASE},
  ref_module::{DiffContext, Direction, RefBackend, RefModule, NR_GPR},
  SimArgs,
};

pub const TRAP_VECTOR: u32 = GUEST_BASE + 0x100;
/// Word of `StubRef` memory where `raise_intr` records the last cause.
pub const CAUSE_SLOT: u32 = GUEST_BASE + 0xf0;

// instruction encoders

fn rv_r(f7: u32, rs2: u32, rs1: u32, f3: u32, rd: u32, op: u32) -> u32 {
  (f7 << 25) | (rs2 << 20) | (rs1 << 15) | (f3 << 12) | (rd << 7) | op
}

fn rv_i(imm: i32, rs1: u32, f3: u32, rd: u32, op: u32) -> u32 {
  let imm = (imm as u32) & 0xfff;
  (imm << 20) | (rs1 << 15) | (f3 << 12) | (rd << 7) | op
}

fn rv_s(imm: i32, rs2: u32, rs1: u32, f3: u32) -> u32 {
  let imm = imm as u32;
  (((imm >> 5) & 0x7f) << 25) | (rs2 << 20) | (rs1 << 15) | (f3 << 12) | ((imm & 0x1f) << 7) | 0x23
}

fn rv_b(imm: i32, rs2: u32, rs1: u32, f3: u32) -> u32 {
  let i = imm as u32;
  (((i >> 12) & 1) << 31)
    | (((i >> 5) & 0x3f) << 25)
    | (rs2 << 20)
    | (rs1 << 15)
    | (f3 << 12)
    | (((i >> 1) & 0xf) << 8)
    | (((i >> 11) & 1) << 7)
    | 0x63
}

pub fn lui(rd: u32, imm: u32) -> u32 {
  (imm & 0xffff_f000) | (rd << 7) | 0x37
}

pub fn addi(rd: u32, rs1: u32, imm: i32) -> u32 {
  rv_i(imm, rs1, 0, rd, 0x13)
}

pub fn add(rd: u32, rs1: u32, rs2: u32) -> u32 {
  rv_r(0, rs2, rs1, 0, rd, 0x33)
}

pub fn sub(rd: u32, rs1: u32, rs2: u32) -> u32 {
  rv_r(0x20, rs2, rs1, 0, rd, 0x33)
}

pub fn lw(rd: u32, rs1: u32, imm: i32) -> u32 {
  rv_i(imm, rs1, 2, rd, 0x03)
}

pub fn sw(rs2: u32, rs1: u32, imm: i32) -> u32 {
  rv_s(imm, rs2, rs1, 2)
}

pub fn bne(rs1: u32, rs2: u32, offset: i32) -> u32 {
  rv_b(offset, rs2, rs1, 1)
}

pub fn jal(rd: u32, offset: i32) -> u32 {
  let i = offset as u32;
  (((i >> 20) & 1) << 31)
    | (((i >> 1) & 0x3ff) << 21)
    | (((i >> 11) & 1) << 20)
    | (((i >> 12) & 0xff) << 12)
    | (rd << 7)
    | 0x6f
}

pub fn csrrs(rd: u32, csr: u32, rs1: u32) -> u32 {
  (csr << 20) | (rs1 << 15) | (2 << 12) | (rd << 7) | 0x73
}

pub const NOP: u32 = 0x0000_0013;
pub const EBREAK: u32 = 0x0010_0073;

pub const A0: u32 = 10;
pub const A1: u32 = 11;
pub const A2: u32 = 12;
pub const T0: u32 = 5;
pub const T1: u32 = 6;

// interpreter

pub trait Bus {
  fn load(&mut self, addr: u32, len: u32) -> u32;
  fn store(&mut self, addr: u32, len: u32, data: u32);
}

/// Memory as the design sees it: faults are latched, not returned.
struct DutBus<'a>(&'a SharedMemory);

impl Bus for DutBus<'_> {
  fn load(&mut self, addr: u32, len: u32) -> u32 {
    self.0.read(addr, len).unwrap_or_else(|e| {
      self.0.set_fault(format!("load {addr:#x}: {e}"));
      0
    })
  }

  fn store(&mut self, addr: u32, len: u32, data: u32) {
    if let Err(e) = self.0.store(addr, len, data) {
      self.0.set_fault(format!("store {addr:#x}: {e}"));
    }
  }
}

impl Bus for VMem {
  fn load(&mut self, addr: u32, len: u32) -> u32 {
    self.read(addr, len).unwrap_or(0)
  }

  fn store(&mut self, addr: u32, len: u32, data: u32) {
    let _ = self.write(addr, len, data);
  }
}

#[derive(Debug, Clone)]
pub struct Hart {
  pub pc: u32,
  pub gpr: [u32; NR_GPR],
  /// Value every CSR read returns.
  pub csr_value: u32,
}

impl Hart {
  pub fn new(pc: u32) -> Self {
    Self { pc, gpr: [0; NR_GPR], csr_value: 0 }
  }

  /// Executes one instruction; returns `(pc, inst)` of it.
  pub fn step(&mut self, bus: &mut impl Bus) -> (u32, u32) {
    let pc = self.pc;
    let inst = bus.load(pc, 4);

    let op = inst & 0x7f;
    let rd = ((inst >> 7) & 0x1f) as usize;
    let f3 = (inst >> 12) & 0x7;
    let rs1 = ((inst >> 15) & 0x1f) as usize;
    let rs2 = ((inst >> 20) & 0x1f) as usize;
    let f7 = inst >> 25;

    let imm_i = ((inst as i32) >> 20) as u32;
    let imm_s = ((((inst as i32) >> 25) << 5) as u32) | ((inst >> 7) & 0x1f);
    let imm_b = ((((inst as i32) >> 31) << 12) as u32)
      | (((inst >> 7) & 1) << 11)
      | (((inst >> 25) & 0x3f) << 5)
      | (((inst >> 8) & 0xf) << 1);
    let imm_j = ((((inst as i32) >> 31) << 20) as u32)
      | (inst & 0x000f_f000)
      | (((inst >> 20) & 1) << 11)
      | (((inst >> 21) & 0x3ff) << 1);

    let (a, b) = (self.gpr[rs1], self.gpr[rs2]);
    let mut next = pc.wrapping_add(4);
    let mut wb = None;

    match op {
      0x37 => wb = Some(inst & 0xffff_f000),
      0x17 => wb = Some(pc.wrapping_add(inst & 0xffff_f000)),
      0x6f => {
        wb = Some(next);
        next = pc.wrapping_add(imm_j);
      }
      0x67 => {
        wb = Some(next);
        next = a.wrapping_add(imm_i) & !1;
      }
      0x63 => {
        let taken = match f3 {
          0 => a == b,
          1 => a != b,
          4 => (a as i32) < (b as i32),
          5 => (a as i32) >= (b as i32),
          6 => a < b,
          7 => a >= b,
          _ => false,
        };
        if taken {
          next = pc.wrapping_add(imm_b);
        }
      }
      0x03 => {
        let addr = a.wrapping_add(imm_i);
        wb = Some(match f3 {
          0 => bus.load(addr, 1) as i8 as i32 as u32,
          1 => bus.load(addr, 2) as i16 as i32 as u32,
          2 => bus.load(addr, 4),
          4 => bus.load(addr, 1),
          5 => bus.load(addr, 2),
          _ => 0,
        });
      }
      0x23 => bus.store(a.wrapping_add(imm_s), 1 << f3, b),
      0x13 => {
        let shamt = imm_i & 0x1f;
        wb = Some(match f3 {
          0 => a.wrapping_add(imm_i),
          1 => a << shamt,
          2 => ((a as i32) < (imm_i as i32)) as u32,
          3 => (a < imm_i) as u32,
          4 => a ^ imm_i,
          5 if f7 & 0x20 != 0 => ((a as i32) >> shamt) as u32,
          5 => a >> shamt,
          6 => a | imm_i,
          _ => a & imm_i,
        });
      }
      0x33 => {
        let shamt = b & 0x1f;
        wb = Some(match (f3, f7) {
          (0, 0x20) => a.wrapping_sub(b),
          (0, _) => a.wrapping_add(b),
          (1, _) => a << shamt,
          (2, _) => ((a as i32) < (b as i32)) as u32,
          (3, _) => (a < b) as u32,
          (4, _) => a ^ b,
          (5, 0x20) => ((a as i32) >> shamt) as u32,
          (5, _) => a >> shamt,
          (6, _) => a | b,
          _ => a & b,
        });
      }
      0x73 if f3 != 0 => wb = Some(self.csr_value),
      _ => {}
    }

    if let Some(value) = wb {
      if rd != 0 {
        self.gpr[rd] = value;
      }
    }
    self.pc = next;
    (pc, inst)
  }
}

// fake dut

/// Overwrites `reg` with `value` right after the `at`-th retirement.
#[derive(Debug, Clone, Copy)]
pub struct Bug {
  pub at: u64,
  pub reg: usize,
  pub value: u32,
}

pub struct FakeCore {
  hart: Hart,
  mem: SharedMemory,

  pub latency: u64,
  pub expose_gpr: bool,
  pub bug: Option<Bug>,
  /// Stops retiring once the pc gets here.
  pub hang_at: Option<u32>,
  /// Instructions at these pcs are reported with the skip hint.
  pub skip_pcs: Vec<u32>,
  /// `(retirement, cause)`: that retirement is a trap entry to `TRAP_VECTOR`.
  pub intr_at: Option<(u64, u64)>,
  /// A malformed store is issued at this retirement.
  pub fault_at: Option<u64>,

  reset: bool,
  clock: bool,
  last_clock: bool,
  cycles: u64,
  wait: u64,
  retired: u64,
  done: bool,
  last: CoreDebugInfo,
}

impl FakeCore {
  pub fn new(mem: SharedMemory) -> Self {
    Self {
      hart: Hart::new(GUEST_BASE),
      mem,
      latency: 1,
      expose_gpr: true,
      bug: None,
      hang_at: None,
      skip_pcs: Vec::new(),
      intr_at: None,
      fault_at: None,
      reset: false,
      clock: false,
      last_clock: false,
      cycles: 0,
      wait: 0,
      retired: 0,
      done: false,
      last: CoreDebugInfo::default(),
    }
  }

  /// Points the core at `mem`, for drivers that create the memory themselves.
  pub fn attach(&mut self, mem: SharedMemory) {
    self.mem = mem;
  }

  fn retire(&mut self) {
    let index = self.retired + 1;

    let mut info = match self.intr_at {
      Some((at, cause)) if at == index => {
        let pc = self.hart.pc;
        self.hart.pc = TRAP_VECTOR;
        CoreDebugInfo {
          pc,
          next_pc: TRAP_VECTOR,
          skip: self.skip_pcs.contains(&pc),
          interrupt: Some(cause),
          ..Default::default()
        }
      }
      _ => {
        self.hart.csr_value = self.cycles as u32;
        let (pc, inst) = self.hart.step(&mut DutBus(&self.mem));
        CoreDebugInfo {
          pc,
          next_pc: self.hart.pc,
          inst,
          skip: self.skip_pcs.contains(&pc),
          ..Default::default()
        }
      }
    };

    if self.fault_at == Some(index) {
      DutBus(&self.mem).store(self.hart.pc, 0, 0);
    }
    if let Some(bug) = self.bug.filter(|bug| bug.at == index && bug.reg != 0) {
      self.hart.gpr[bug.reg] = bug.value;
    }

    info.gpr = self.expose_gpr.then_some(self.hart.gpr);
    self.retired = index;
    self.done = true;
    self.last = info;
  }
}

impl DutModel for FakeCore {
  fn set_reset(&mut self, high: bool) {
    self.reset = high;
  }

  fn set_clock(&mut self, high: bool) {
    self.clock = high;
  }

  fn eval(&mut self) {
    let rising = self.clock && !self.last_clock;
    self.last_clock = self.clock;

    if self.reset {
      self.hart = Hart::new(GUEST_BASE);
      self.cycles = 0;
      self.wait = 0;
      self.retired = 0;
      self.done = false;
      return;
    }
    if !rising {
      return;
    }

    self.cycles += 1;
    self.done = false;
    if self.hang_at == Some(self.hart.pc) {
      return;
    }
    self.wait += 1;
    if self.wait >= self.latency {
      self.wait = 0;
      self.retire();
    }
  }

  fn inst_done(&self) -> bool {
    self.done
  }

  fn debug_info(&self) -> CoreDebugInfo {
    self.last
  }
}

// stub reference

/// Reference model with its own memory, reached only through `RefBackend`.
pub struct StubRef {
  hart: Hart,
  mem: VMem,
}

impl StubRef {
  pub fn new() -> Self {
    Self { hart: Hart::new(0), mem: VMem::new() }
  }
}

impl RefBackend for StubRef {
  fn init(&mut self) {
    self.hart = Hart::new(GUEST_BASE);
  }

  fn memcpy(&mut self, addr: u32, buf: &mut [u8], direction: Direction) {
    match direction {
      Direction::ToRef => self.mem.write_bytes(addr, buf),
      Direction::ToDut => self.mem.read_bytes(addr, buf),
    }
  }

  fn regcpy(&mut self, ctx: &mut DiffContext, direction: Direction) {
    match direction {
      Direction::ToDut => *ctx = DiffContext::new(self.hart.gpr, self.hart.pc),
      Direction::ToRef => {
        self.hart.gpr = ctx.gpr;
        self.hart.gpr[0] = 0;
        self.hart.pc = ctx.pc;
      }
    }
  }

  fn exec(&mut self, n: u64) {
    for _ in 0..n {
      self.hart.step(&mut self.mem);
    }
  }

  fn raise_intr(&mut self, no: u64) {
    self.mem.store(CAUSE_SLOT, 4, no as u32);
    self.hart.pc = TRAP_VECTOR;
  }
}

// bench

pub fn program(words: &[u32]) -> VMem {
  let mut vmem = VMem::new();
  for (i, word) in words.iter().enumerate() {
    vmem.write_bytes(GUEST_BASE + 4 * i as u32, &word.to_le_bytes());
  }
  vmem
}

pub fn image_bytes(words: &[u32]) -> Vec<u8> {
  words.iter().flat_map(|word| word.to_le_bytes()).collect()
}

/// Driver over a `FakeCore` checked against a `StubRef` seeded with the same image.
pub fn bench_from(
  vmem: VMem,
  image_size: usize,
  args: &SimArgs,
  configure: impl FnOnce(&mut FakeCore),
) -> Driver<FakeCore> {
  let refmodule = if args.difftest {
    RefModule::with_backend(Box::new(StubRef::new()), &vmem, GUEST_BASE, image_size)
  } else {
    RefModule::disabled()
  };
  let mem = SharedMemory::new(vmem);
  let mut dut = FakeCore::new(mem.clone());
  configure(&mut dut);
  Driver::new(dut, mem, refmodule, args).unwrap()
}

pub fn bench(words: &[u32], args: &SimArgs, configure: impl FnOnce(&mut FakeCore)) -> Driver<FakeCore> {
  bench_from(program(words), words.len() * 4, args, configure)
}

/// a0 = 10 + 9 + ... + 1, minus 55, so the run ends in a good trap after 34 instructions.
pub fn sum_loop() -> Vec<u32> {
  vec![
    addi(A0, 0, 0),
    addi(T0, 0, 10),
    add(A0, A0, T0),
    addi(T0, T0, -1),
    bne(T0, 0, -8),
    addi(A0, A0, -55),
    EBREAK,
  ]
}

pub const SUM_LOOP_INSTS: u64 = 34;
