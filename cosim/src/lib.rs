use plusarg::PlusArgMatcher;
use std::path::PathBuf;
use tracing::Level;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

pub mod difftest;
pub mod dpi;
pub mod drive;
pub mod dut;
pub mod memory;
pub mod plusarg;
pub mod ref_module;
#[cfg(feature = "verilator")]
pub mod verilated;

const DEFAULT_MAX_CYCLES_PER_INST: u64 = 10_000;

pub struct SimArgs {
  /// Program image, raw binary or ELF. The built-in image is used when absent.
  pub image_file: Option<PathBuf>,

  /// Reference model shared object implementing the difftest ABI.
  pub ref_so: Option<PathBuf>,

  /// Compare against the reference model at all.
  pub difftest: bool,

  pub log_level: String,

  pub inst_trace: bool,
  pub mem_trace: bool,

  /// Skip comparison of CSR instructions.
  pub skip_csr: bool,

  pub max_insts: Option<u64>,
  pub max_cycles_per_inst: u64,
}

impl Default for SimArgs {
  fn default() -> Self {
    Self {
      image_file: None,
      ref_so: None,
      difftest: true,
      log_level: "info".into(),
      inst_trace: false,
      mem_trace: false,
      skip_csr: false,
      max_insts: None,
      max_cycles_per_inst: default_max_cycles(),
    }
  }
}

fn default_max_cycles() -> u64 {
  option_env!("DESIGN_TIMEOUT")
    .and_then(|timeout| timeout.parse().ok())
    .unwrap_or(DEFAULT_MAX_CYCLES_PER_INST)
}

impl SimArgs {
  pub fn setup_logger(&self) -> anyhow::Result<()> {
    let log_level: Level = self.log_level.parse()?;
    let global_logger = FmtSubscriber::builder()
      .with_env_filter(EnvFilter::from_default_env())
      .with_max_level(log_level)
      .without_time()
      .with_target(false)
      .with_ansi(true)
      .compact()
      .finish();
    tracing::subscriber::set_global_default(global_logger)?;
    Ok(())
  }

  pub fn from_plusargs(matcher: &PlusArgMatcher) -> anyhow::Result<Self> {
    let defaults = Self::default();
    Ok(Self {
      image_file: matcher.try_match("image-file").map(PathBuf::from),
      ref_so: matcher.try_match("diff-ref-so").map(PathBuf::from),
      difftest: matcher.flag("difftest", defaults.difftest)?,
      log_level: matcher.try_match("log-level").unwrap_or("info").into(),
      inst_trace: matcher.flag("inst-trace", false)?,
      mem_trace: matcher.flag("mem-trace", false)?,
      skip_csr: matcher.flag("skip-csr", false)?,
      max_insts: matcher.try_parse("max-insts")?,
      max_cycles_per_inst: matcher
        .try_parse("max-cycles-per-inst")?
        .unwrap_or(defaults.max_cycles_per_inst),
    })
  }
}
