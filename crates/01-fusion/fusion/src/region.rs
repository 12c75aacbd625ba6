//! Arena mappings and offset-addressed pointers.
//!
//! Every participant maps the same arena file, but not necessarily at the
//! same address. Shared structures therefore never store pointers; they store
//! [`ShmPtr`] offsets from the start of the mapping, which each process
//! translates through its own [`SharedRegion`].

use crate::{FusionError, FusionResult};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::mem;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;

/// Alignment every arena allocation honours.
pub const ARENA_ALIGNMENT: usize = 16;

/// Arena-relative pointer to a `T` living in shared memory.
///
/// Offsets are only meaningful inside the world that issued them. Offset zero
/// is the arena header, so it doubles as the null value.
#[repr(transparent)]
pub struct ShmPtr<T> {
    offset: u64,
    _marker: PhantomData<fn() -> T>,
}

impl<T> ShmPtr<T> {
    pub const NULL: Self = Self::from_raw(0);

    pub const fn from_raw(offset: u64) -> Self {
        Self {
            offset,
            _marker: PhantomData,
        }
    }

    pub const fn raw(self) -> u64 {
        self.offset
    }

    pub const fn is_null(self) -> bool {
        self.offset == 0
    }

    /// Reinterprets the pointer; the caller vouches for the layout.
    pub const fn cast<U>(self) -> ShmPtr<U> {
        ShmPtr::from_raw(self.offset)
    }

    /// Pointer to a field `delta` bytes into the pointee.
    pub const fn byte_add<U>(self, delta: u64) -> ShmPtr<U> {
        ShmPtr::from_raw(self.offset + delta)
    }
}

impl<T> Clone for ShmPtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for ShmPtr<T> {}

impl<T> PartialEq for ShmPtr<T> {
    fn eq(&self, other: &Self) -> bool {
        self.offset == other.offset
    }
}

impl<T> Eq for ShmPtr<T> {}

impl<T> Hash for ShmPtr<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.offset.hash(state);
    }
}

impl<T> fmt::Debug for ShmPtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ShmPtr({:#x})", self.offset)
    }
}

/// Marker for plain data that may be placed in an arena.
///
/// # Safety
///
/// Implementors must be `#[repr(C)]` (or primitive), contain no pointers or
/// references, and be valid for the all-zero bit pattern; arena allocations
/// start zeroed and are shared byte-for-byte with other processes.
pub unsafe trait Shareable: Copy + Send + Sync + 'static {}

macro_rules! shareable {
    ($($ty:ty),* $(,)?) => {
        $(unsafe impl Shareable for $ty {})*
    };
}

shareable!(u8, u16, u32, u64, i8, i16, i32, i64, f32, f64, ());

unsafe impl<T: Shareable, const N: usize> Shareable for [T; N] {}

/// Views a shareable value as raw bytes.
pub fn bytes_of<T: Shareable>(value: &T) -> &[u8] {
    // SAFETY: `Shareable` types are plain data without padding requirements on
    // read; the slice covers exactly one `T`.
    unsafe { std::slice::from_raw_parts(value as *const T as *const u8, mem::size_of::<T>()) }
}

/// Rebuilds a shareable value from bytes produced by [`bytes_of`].
pub fn read_from_bytes<T: Shareable>(bytes: &[u8]) -> FusionResult<T> {
    if bytes.len() != mem::size_of::<T>() {
        return Err(FusionError::InvArg("payload size does not match message type"));
    }
    // SAFETY: length checked above; `Shareable` admits any bit pattern and the
    // unaligned read copes with arbitrary byte buffers.
    Ok(unsafe { std::ptr::read_unaligned(bytes.as_ptr() as *const T) })
}

/// A file-backed shared mapping.
///
/// The mapping is created once with a fixed length and never grows; all
/// structures inside it are addressed by offset.
pub struct SharedRegion {
    base: NonNull<u8>,
    len: usize,
    path: PathBuf,
    _map: memmap2::MmapMut,
    _file: File,
}

// SAFETY: the mapping is process-shared memory. Everything reachable through
// `at` is made of atomics or immutable-after-publish fields, so concurrent
// access from several threads is as sound as concurrent access from several
// processes.
unsafe impl Send for SharedRegion {}
// SAFETY: see above.
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// Creates a new arena file of `len` bytes; fails if it already exists.
    pub fn create(path: &Path, len: usize) -> FusionResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        file.set_len(len as u64)?;
        Self::map(file, path, len)
    }

    /// Maps an existing arena file at its current length.
    pub fn open(path: &Path) -> FusionResult<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len() as usize;
        if len == 0 {
            return Err(FusionError::Init);
        }
        Self::map(file, path, len)
    }

    fn map(file: File, path: &Path, len: usize) -> FusionResult<Self> {
        // SAFETY: the file stays open for the lifetime of the mapping and all
        // participants agree to only touch it through the arena protocol.
        let mut map = unsafe { memmap2::MmapOptions::new().len(len).map_mut(&file)? };
        let base = NonNull::new(map.as_mut_ptr()).ok_or(FusionError::NoSharedMemory {
            requested: len,
        })?;
        if base.as_ptr() as usize % ARENA_ALIGNMENT != 0 {
            return Err(FusionError::fusion("arena mapping is misaligned"));
        }
        Ok(Self {
            base,
            len,
            path: path.to_path_buf(),
            _map: map,
            _file: file,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Translates `ptr` into a reference inside this mapping.
    ///
    /// Out-of-range or misaligned offsets indicate a corrupted structure and
    /// are reported as bugs.
    pub fn at<T>(&self, ptr: ShmPtr<T>) -> FusionResult<&T> {
        let offset = ptr.raw() as usize;
        match offset.checked_add(mem::size_of::<T>()) {
            Some(end) if end <= self.len && offset % mem::align_of::<T>() == 0 => {
                // SAFETY: bounds and alignment checked; shared structures only
                // contain atomics or fields frozen before publication.
                Ok(unsafe { &*(self.base.as_ptr().add(offset) as *const T) })
            }
            _ => Err(FusionError::Bug("arena pointer out of range")),
        }
    }

    /// Raw pointer to `len` bytes at `offset`.
    pub fn bytes_ptr(&self, offset: u64, len: usize) -> FusionResult<*mut u8> {
        let offset = offset as usize;
        match offset.checked_add(len) {
            Some(end) if end <= self.len => {
                // SAFETY: range checked against the mapping length.
                Ok(unsafe { self.base.as_ptr().add(offset) })
            }
            _ => Err(FusionError::Bug("arena byte range out of range")),
        }
    }

    /// Zeroes `len` bytes at `offset`.
    pub fn zero(&self, offset: u64, len: usize) -> FusionResult<()> {
        let ptr = self.bytes_ptr(offset, len)?;
        // SAFETY: range checked; callers only zero blocks they own exclusively.
        unsafe { std::ptr::write_bytes(ptr, 0, len) };
        Ok(())
    }

    /// Copies `data` into the arena at `offset`.
    pub fn write_bytes(&self, offset: u64, data: &[u8]) -> FusionResult<()> {
        let ptr = self.bytes_ptr(offset, data.len())?;
        // SAFETY: range checked; the destination block is owned by the writer.
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), ptr, data.len()) };
        Ok(())
    }

    /// Copies `len` bytes at `offset` out of the arena.
    pub fn read_bytes(&self, offset: u64, len: usize) -> FusionResult<Vec<u8>> {
        let ptr = self.bytes_ptr(offset, len)?;
        let mut out = vec![0u8; len];
        // SAFETY: range checked; the source block was published before this read.
        unsafe { std::ptr::copy_nonoverlapping(ptr, out.as_mut_ptr(), len) };
        Ok(out)
    }
}

impl fmt::Debug for SharedRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedRegion")
            .field("path", &self.path)
            .field("len", &self.len)
            .finish()
    }
}

pub(crate) const fn align_up(value: usize, align: usize) -> usize {
    (value + (align - 1)) & !(align - 1)
}
