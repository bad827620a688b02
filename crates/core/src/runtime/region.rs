//! Patchable code regions.
//!
//! Everything that rewrites machine code goes through `CodeRegion::patch`,
//! so encoders and the sled logic can be exercised against a plain buffer.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegionError {
    #[error("Patch of {len} bytes at offset {offset:#x} exceeds region of {size:#x} bytes")]
    OutOfBounds { offset: usize, len: usize, size: usize },
}

/// A contiguous range of code at a fixed address.
pub trait CodeRegion {
    /// Address of the first byte.
    fn base(&self) -> u64;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current contents.
    fn bytes(&self) -> &[u8];

    /// Overwrite `bytes.len()` bytes at `offset`.
    fn patch(&mut self, offset: usize, bytes: &[u8]) -> Result<(), RegionError>;

    fn read_word(&self, index: usize) -> Option<u32> {
        let raw = self.bytes().get(index * 4..index * 4 + 4)?;
        Some(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    fn write_words(&mut self, index: usize, words: &[u32]) -> Result<(), RegionError> {
        let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        self.patch(index * 4, &bytes)
    }
}

fn check_bounds(offset: usize, len: usize, size: usize) -> Result<(), RegionError> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(()),
        _ => Err(RegionError::OutOfBounds { offset, len, size }),
    }
}

/// In-memory region placed at a pretend address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferRegion {
    base: u64,
    data: Vec<u8>,
    patches: usize,
}

impl BufferRegion {
    pub fn new(base: u64, data: Vec<u8>) -> Self {
        Self { base, data, patches: 0 }
    }

    pub fn zeroed(base: u64, len: usize) -> Self {
        Self::new(base, vec![0; len])
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    /// Number of `patch` calls so far.
    pub fn patch_count(&self) -> usize {
        self.patches
    }
}

impl CodeRegion for BufferRegion {
    fn base(&self) -> u64 {
        self.base
    }

    fn len(&self) -> usize {
        self.data.len()
    }

    fn bytes(&self) -> &[u8] {
        &self.data
    }

    fn patch(&mut self, offset: usize, bytes: &[u8]) -> Result<(), RegionError> {
        check_bounds(offset, bytes.len(), self.data.len())?;
        self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
        self.patches += 1;
        Ok(())
    }
}

/// Live code in the current process.
///
/// Every patch flips the covering pages to read-write, copies the bytes,
/// flips them back to read-execute and flushes the instruction cache. The
/// pages are never writable and executable at the same time. A failing
/// protection change is fatal: a diagnostic goes to stderr and the process
/// exits. Concurrent patching needs external locking.
#[cfg(unix)]
pub struct ExecutableRegion {
    ptr: *mut u8,
    len: usize,
    page_size: usize,
}

#[cfg(unix)]
impl ExecutableRegion {
    /// Exit status used when page protection cannot be changed.
    pub const PROTECT_FAILURE_STATUS: i32 = 53;

    /// # Safety
    ///
    /// `ptr..ptr + len` must be mapped code owned by the caller for the
    /// lifetime of the region, and `page_size` must be the protection
    /// granularity of that mapping.
    pub unsafe fn from_raw(ptr: *mut u8, len: usize, page_size: usize) -> Self {
        Self { ptr, len, page_size }
    }

    fn page_span(&self, offset: usize, len: usize) -> (*mut libc::c_void, usize) {
        let start = self.ptr as usize + offset;
        let page_start = start & !(self.page_size - 1);
        let end = start + len;
        let span = (end - page_start + self.page_size - 1) & !(self.page_size - 1);
        (page_start as *mut libc::c_void, span)
    }

    fn protect(&self, addr: *mut libc::c_void, len: usize, prot: libc::c_int) {
        // SAFETY: the span covers pages of the mapping handed to `from_raw`.
        let rc = unsafe { libc::mprotect(addr, len, prot) };
        if rc != 0 {
            eprintln!("mprotect failed at {addr:p} ({len:#x} bytes): {}", std::io::Error::last_os_error());
            std::process::exit(Self::PROTECT_FAILURE_STATUS);
        }
    }
}

#[cfg(all(unix, target_arch = "aarch64"))]
extern "C" {
    fn __clear_cache(start: *mut libc::c_char, end: *mut libc::c_char);
}

#[cfg(all(unix, target_arch = "aarch64"))]
fn flush_icache(start: *mut u8, len: usize) {
    // SAFETY: the range was just written and belongs to the region.
    unsafe {
        __clear_cache(start as *mut libc::c_char, start.add(len) as *mut libc::c_char);
    }
}

/// Instruction fetch is coherent with data writes here.
#[cfg(all(unix, not(target_arch = "aarch64")))]
fn flush_icache(_start: *mut u8, _len: usize) {}

#[cfg(unix)]
impl CodeRegion for ExecutableRegion {
    fn base(&self) -> u64 {
        self.ptr as u64
    }

    fn len(&self) -> usize {
        self.len
    }

    fn bytes(&self) -> &[u8] {
        // SAFETY: the region is readable in both protection states.
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    fn patch(&mut self, offset: usize, bytes: &[u8]) -> Result<(), RegionError> {
        check_bounds(offset, bytes.len(), self.len)?;
        let (pages, span) = self.page_span(offset, bytes.len());
        self.protect(pages, span, libc::PROT_READ | libc::PROT_WRITE);
        // SAFETY: bounds checked above and the pages are writable now.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr.add(offset), bytes.len());
        }
        self.protect(pages, span, libc::PROT_READ | libc::PROT_EXEC);
        // SAFETY: same range as the copy.
        flush_icache(unsafe { self.ptr.add(offset) }, bytes.len());
        Ok(())
    }
}
