mod context;
pub mod dylib;
#[cfg(feature = "static-ref")]
pub mod linked;

pub use context::{gpr_name, DiffContext, CONTEXT_BYTES, CONTEXT_LAYOUT_VERSION, NR_GPR};
pub use dylib::DylibRef;
#[cfg(feature = "static-ref")]
pub use linked::LinkedRef;

use std::path::Path;
use tracing::{info, warn};

use crate::memory::VMem;

/// Copy direction of `difftest_memcpy` / `difftest_regcpy`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
  /// Reference state is copied into the caller's buffer.
  ToDut,
  /// The caller's buffer is copied into the reference model.
  ToRef,
}

impl Direction {
  /// Value of the C `bool direction` argument.
  pub fn as_flag(self) -> bool {
    match self {
      Direction::ToDut => false,
      Direction::ToRef => true,
    }
  }
}

/// The five entry points a reference model exports.
///
/// One implementation per way of reaching a reference: a runtime-loaded
/// library (`DylibRef`), a statically linked one (`LinkedRef`), or an
/// in-process model used by tests. Implementations own per-process state of a
/// non-reentrant module and are driven from one thread.
pub trait RefBackend {
  fn init(&mut self);
  /// With `ToDut`, fills `buf` from reference memory at `addr`; with `ToRef`, writes `buf` there.
  fn memcpy(&mut self, addr: u32, buf: &mut [u8], direction: Direction);
  fn regcpy(&mut self, ctx: &mut DiffContext, direction: Direction);
  fn exec(&mut self, n: u64);
  fn raise_intr(&mut self, no: u64);
}

/// Binding to a reference model, or nothing.
///
/// A disabled binding turns every operation into a no-op so DUT-only runs
/// proceed when no reference is configured or it fails to load.
pub struct RefModule {
  backend: Option<Box<dyn RefBackend>>,
}

impl RefModule {
  pub fn disabled() -> Self {
    Self { backend: None }
  }

  /// Loads the shared library at `path` and seeds it with the image at
  /// `[base, base + image_size)` of `mem`. Any load or symbol failure is logged
  /// and yields a disabled binding.
  pub fn new(path: Option<&Path>, mem: &VMem, base: u32, image_size: usize) -> Self {
    let Some(path) = path else {
      info!("difftest: no reference module given, comparison disabled");
      return Self::disabled();
    };
    match DylibRef::open(path) {
      Ok(backend) => {
        info!("difftest: loaded reference module {}", path.display());
        Self::with_backend(Box::new(backend), mem, base, image_size)
      }
      Err(e) => {
        warn!("difftest: {e:#}; comparison disabled");
        Self::disabled()
      }
    }
  }

  /// Reference model linked into this binary.
  #[cfg(feature = "static-ref")]
  pub fn linked(mem: &VMem, base: u32, image_size: usize) -> Self {
    Self::with_backend(Box::new(LinkedRef::new()), mem, base, image_size)
  }

  /// Initialises `backend` and copies the DUT's loaded image into it.
  pub fn with_backend(
    backend: Box<dyn RefBackend>,
    mem: &VMem,
    base: u32,
    image_size: usize,
  ) -> Self {
    let mut module = Self { backend: Some(backend) };
    module.init();
    let mut image = mem.image(base, image_size);
    module.memcpy(base, &mut image, Direction::ToRef);
    info!("difftest: copied {image_size} bytes of image at {base:#010x} to reference");
    module
  }

  pub fn is_enabled(&self) -> bool {
    self.backend.is_some()
  }

  pub fn init(&mut self) {
    if let Some(backend) = self.backend.as_mut() {
      backend.init();
    }
  }

  pub fn memcpy(&mut self, addr: u32, buf: &mut [u8], direction: Direction) {
    if let Some(backend) = self.backend.as_mut() {
      backend.memcpy(addr, buf, direction);
    }
  }

  pub fn regcpy(&mut self, ctx: &mut DiffContext, direction: Direction) {
    if let Some(backend) = self.backend.as_mut() {
      backend.regcpy(ctx, direction);
    }
  }

  pub fn exec(&mut self, n: u64) {
    if let Some(backend) = self.backend.as_mut() {
      backend.exec(n);
    }
  }

  pub fn raise_intr(&mut self, no: u64) {
    if let Some(backend) = self.backend.as_mut() {
      backend.raise_intr(no);
    }
  }

  /// Current reference context.
  pub fn context(&mut self) -> DiffContext {
    let mut ctx = DiffContext::default();
    self.regcpy(&mut ctx, Direction::ToDut);
    ctx
  }

  pub fn set_context(&mut self, mut ctx: DiffContext) {
    self.regcpy(&mut ctx, Direction::ToRef);
  }
}
