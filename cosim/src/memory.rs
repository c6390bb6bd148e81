use anyhow::Context;
use elf::{
  abi::{EM_RISCV, ET_EXEC, PT_LOAD},
  endian::LittleEndian,
  ElfStream,
};
use std::collections::BTreeMap;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::{fs, mem};
use tracing::{debug, info, warn};

/// Guest physical address the program image is loaded at.
pub const GUEST_BASE: u32 = 0x8000_0000;

const BLOCK_SIZE: usize = 4096;
const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];

/// Fallback program used when no image is supplied.
const DEFAULT_IMG: [u32; 5] = [
  0x0000_0297, // auipc t0, 0
  0x0002_8823, // sb    zero, 16(t0)
  0x0102_c503, // lbu   a0, 16(t0)
  0x0010_0073, // ebreak
  0xdead_beef, // data
];

type Block = Box<[u8; BLOCK_SIZE]>;

/// Sparse, zero-initialised, byte-addressable guest memory.
///
/// Blocks of `BLOCK_SIZE` bytes are allocated on first write and never freed.
/// Reads of untouched addresses return zero without allocating.
#[derive(Default)]
pub struct VMem {
  blocks: BTreeMap<u32, Block>,
}

/// What an image load put into memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageInfo {
  pub base: u32,
  pub size: usize,
  pub entry: u32,
}

fn check_len(len: u32) -> anyhow::Result<()> {
  if !(1..=4).contains(&len) {
    anyhow::bail!("memory access length {len} out of range 1..=4");
  }
  Ok(())
}

fn split(addr: u32) -> (u32, usize) {
  (addr / BLOCK_SIZE as u32, addr as usize % BLOCK_SIZE)
}

impl VMem {
  pub fn new() -> Self {
    Self::default()
  }

  /// Number of blocks allocated so far.
  pub fn block_count(&self) -> usize {
    self.blocks.len()
  }

  fn read_byte(&self, addr: u32) -> u8 {
    let (index, offset) = split(addr);
    self.blocks.get(&index).map_or(0, |block| block[offset])
  }

  fn write_byte(&mut self, addr: u32, byte: u8) {
    let (index, offset) = split(addr);
    let block = self.blocks.entry(index).or_insert_with(|| Box::new([0; BLOCK_SIZE]));
    block[offset] = byte;
  }

  /// Little-endian read of `len` bytes starting at `addr`.
  pub fn read(&self, addr: u32, len: u32) -> anyhow::Result<u32> {
    check_len(len)?;
    let value = (0..len).fold(0u32, |acc, i| {
      acc | (self.read_byte(addr.wrapping_add(i)) as u32) << (i * 8)
    });
    Ok(value)
  }

  /// Stores the low `len` bytes of `data` little-endian at `addr`.
  pub fn write(&mut self, addr: u32, len: u32, data: u32) -> anyhow::Result<()> {
    check_len(len)?;
    for (i, byte) in data.to_le_bytes().into_iter().take(len as usize).enumerate() {
      self.write_byte(addr.wrapping_add(i as u32), byte);
    }
    Ok(())
  }

  pub fn read_bytes(&self, addr: u32, buf: &mut [u8]) {
    for (i, byte) in buf.iter_mut().enumerate() {
      *byte = self.read_byte(addr.wrapping_add(i as u32));
    }
  }

  pub fn write_bytes(&mut self, addr: u32, data: &[u8]) {
    for (i, byte) in data.iter().enumerate() {
      self.write_byte(addr.wrapping_add(i as u32), *byte);
    }
  }

  /// Copy of `len` bytes starting at `addr`.
  pub fn image(&self, addr: u32, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    self.read_bytes(addr, &mut buf);
    buf
  }

  /// Loads a raw binary byte for byte at `offset`. Returns the number of bytes loaded.
  pub fn load_from_file(&mut self, path: &Path, offset: u32) -> anyhow::Result<usize> {
    let bytes = fs::read(path).with_context(|| format!("reading image {}", path.display()))?;
    self.write_bytes(offset, &bytes);
    info!("loaded image {} ({} bytes) at {offset:#010x}", path.display(), bytes.len());
    Ok(bytes.len())
  }

  /// Writes the built-in fallback program at `offset`.
  pub fn load_default_img(&mut self, offset: u32) -> usize {
    let bytes: Vec<u8> = DEFAULT_IMG.iter().flat_map(|word| word.to_le_bytes()).collect();
    self.write_bytes(offset, &bytes);
    info!("no image given, loaded built-in image ({} bytes) at {offset:#010x}", bytes.len());
    bytes.len()
  }

  /// Loads the PT_LOAD segments of a 32-bit RISC-V executable.
  pub fn load_elf(&mut self, path: &Path) -> anyhow::Result<ImageInfo> {
    let file = fs::File::open(path).with_context(|| "reading ELF file")?;
    let elf: ElfStream<LittleEndian, _> =
      ElfStream::open_stream(&file).with_context(|| "parsing ELF file")?;

    if elf.ehdr.e_machine != EM_RISCV {
      anyhow::bail!("ELF is not in RISC-V");
    }
    if elf.ehdr.e_type != ET_EXEC {
      anyhow::bail!("ELF is not an executable");
    }
    if elf.ehdr.e_phnum == 0 {
      anyhow::bail!("ELF has zero size program header");
    }
    let entry = u32::try_from(elf.ehdr.e_entry).context("ELF entry beyond 32-bit space")?;
    debug!("ELF entry: {entry:#x}");

    let mut low = u32::MAX;
    let mut high = 0u64;
    let mut load_buffer = Vec::new();
    for phdr in elf.segments().iter().filter(|phdr| phdr.p_type == PT_LOAD) {
      let vaddr = u32::try_from(phdr.p_vaddr).context("segment vaddr beyond 32-bit space")?;
      let filesz = usize::try_from(phdr.p_filesz).context("segment too large")?;
      debug!(
        "Read loadable segments 0x{:x}..0x{:x} to memory 0x{:x}",
        phdr.p_offset,
        phdr.p_offset + filesz as u64,
        vaddr
      );
      load_buffer.resize(filesz, 0u8);
      file.read_exact_at(&mut load_buffer, phdr.p_offset).with_context(|| {
        format!("reading segment vaddr={vaddr:#x} filesz={filesz} offset={}", phdr.p_offset)
      })?;
      self.write_bytes(vaddr, &load_buffer);
      low = low.min(vaddr);
      high = high.max(vaddr as u64 + phdr.p_memsz.max(phdr.p_filesz));
    }
    if low == u32::MAX {
      anyhow::bail!("ELF has no loadable segment");
    }

    let size = (high - low as u64) as usize;
    info!("loaded ELF {} ({size} bytes) at {low:#010x}", path.display());
    Ok(ImageInfo { base: low, size, entry })
  }

  /// Loads `path` as ELF when it carries the ELF magic, else as a raw binary at `base`.
  /// Without a path the built-in image goes to `base`.
  pub fn load_image(&mut self, path: Option<&Path>, base: u32) -> anyhow::Result<ImageInfo> {
    let Some(path) = path else {
      let size = self.load_default_img(base);
      return Ok(ImageInfo { base, size, entry: base });
    };

    let mut magic = [0u8; 4];
    let file = fs::File::open(path).with_context(|| format!("opening image {}", path.display()))?;
    let is_elf = file.read_exact_at(&mut magic, 0).is_ok() && magic == ELF_MAGIC;
    drop(file);

    if is_elf {
      let info = self.load_elf(path)?;
      if info.base != base {
        warn!("ELF loaded at {:#010x}, expected guest base {base:#010x}", info.base);
      }
      Ok(info)
    } else {
      let size = self.load_from_file(path, base)?;
      Ok(ImageInfo { base, size, entry: base })
    }
  }
}

/// A store the DUT performed through the DPI memory port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreEvent {
  pub addr: u32,
  pub data: u32,
  pub len: u32,
}

#[derive(Default)]
struct MemoryCell {
  mem: VMem,
  stores: Vec<StoreEvent>,
  fault: Option<String>,
}

/// Handle to the one `VMem` of a harness instance.
///
/// Clones share the same memory. The DPI shim holds a clone so the hardware
/// model's memory port and the driver observe identical contents. Stores made
/// through `store` are queued until the driver forwards them to the reference
/// model.
#[derive(Clone, Default)]
pub struct SharedMemory {
  inner: Arc<Mutex<MemoryCell>>,
}

impl SharedMemory {
  pub fn new(mem: VMem) -> Self {
    Self { inner: Arc::new(Mutex::new(MemoryCell { mem, ..Default::default() })) }
  }

  fn cell(&self) -> MutexGuard<'_, MemoryCell> {
    self.inner.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Runs `f` with the memory locked. Must not call back into the hardware model.
  pub fn with<R>(&self, f: impl FnOnce(&mut VMem) -> R) -> R {
    f(&mut self.cell().mem)
  }

  pub fn read(&self, addr: u32, len: u32) -> anyhow::Result<u32> {
    self.cell().mem.read(addr, len)
  }

  /// Writes without recording a store, e.g. for loaders.
  pub fn write(&self, addr: u32, len: u32, data: u32) -> anyhow::Result<()> {
    self.cell().mem.write(addr, len, data)
  }

  /// A DUT store: written to memory and queued for store-commit.
  pub fn store(&self, addr: u32, len: u32, data: u32) -> anyhow::Result<()> {
    let mut cell = self.cell();
    cell.mem.write(addr, len, data)?;
    cell.stores.push(StoreEvent { addr, data, len });
    Ok(())
  }

  /// Stores queued since the last call, oldest first.
  pub fn drain_stores(&self) -> Vec<StoreEvent> {
    mem::take(&mut self.cell().stores)
  }

  /// Latches a memory fault raised where no error can be returned. The first fault wins.
  pub fn set_fault(&self, msg: String) {
    let mut cell = self.cell();
    if cell.fault.is_none() {
      cell.fault = Some(msg);
    }
  }

  pub fn take_fault(&self) -> Option<String> {
    self.cell().fault.take()
  }
}
