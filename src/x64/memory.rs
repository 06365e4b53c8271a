//! Executable memory for exec blocks and shellcode objects.
//!
//! An [`ExecRegion`] is a single anonymous mapping made of a code area
//! followed by one data page. The code area flips between writable and
//! executable; the data page stays read-write so translated code can store
//! into the context and shadow slots placed there.

use std::ptr::NonNull;

use crate::core::error::MemoryError;

pub const PAGE_SIZE: usize = 4096;

pub struct ExecRegion {
    ptr: NonNull<u8>,
    code_size: usize,
    data_size: usize,
    executable: bool,
}

impl ExecRegion {
    /// Map `code_pages` pages of code plus one data page.
    pub fn new(code_pages: usize) -> Result<Self, MemoryError> {
        if code_pages == 0 {
            return Err(MemoryError::InvalidSize);
        }
        let page = page_size();
        let code_size = round_up(code_pages * PAGE_SIZE, page);
        let data_size = round_up(PAGE_SIZE, page);
        let ptr = mmap_rw(code_size + data_size)?;
        log::debug!(
            "mapped exec region at {:p}: {code_size} code bytes, {data_size} data bytes",
            ptr
        );
        Ok(Self {
            ptr,
            code_size,
            data_size,
            executable: false,
        })
    }

    pub fn code_address(&self) -> u64 {
        self.ptr.as_ptr() as u64
    }

    pub fn code_size(&self) -> usize {
        self.code_size
    }

    pub fn data_address(&self) -> u64 {
        self.code_address() + self.code_size as u64
    }

    pub fn data_size(&self) -> usize {
        self.data_size
    }

    /// Start of the data page. Always writable.
    pub fn data_ptr(&self) -> *mut u8 {
        // SAFETY: the data page directly follows the code area in the mapping.
        unsafe { self.ptr.as_ptr().add(self.code_size) }
    }

    pub fn is_executable(&self) -> bool {
        self.executable
    }

    /// Copy `bytes` into the code area. The area must be writable.
    pub fn write_code(&mut self, offset: usize, bytes: &[u8]) -> Result<(), MemoryError> {
        if self.executable {
            return Err(MemoryError::ProtectionFailed { errno: libc::EPERM });
        }
        if offset + bytes.len() > self.code_size {
            return Err(MemoryError::OutOfBounds {
                offset,
                len: bytes.len(),
                size: self.code_size,
            });
        }
        // SAFETY: bounds checked above; the code area is mapped read-write.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr.as_ptr().add(offset), bytes.len());
        }
        Ok(())
    }

    pub fn make_code_writable(&mut self) -> Result<(), MemoryError> {
        if !self.executable {
            return Ok(());
        }
        self.protect(libc::PROT_READ | libc::PROT_WRITE)?;
        self.executable = false;
        Ok(())
    }

    pub fn make_code_executable(&mut self) -> Result<(), MemoryError> {
        if self.executable {
            return Ok(());
        }
        self.protect(libc::PROT_READ | libc::PROT_EXEC)?;
        self.executable = true;
        Ok(())
    }

    fn protect(&self, prot: libc::c_int) -> Result<(), MemoryError> {
        // SAFETY: the range is the code area of our own mapping.
        let result =
            unsafe { libc::mprotect(self.ptr.as_ptr() as *mut libc::c_void, self.code_size, prot) };
        if result != 0 {
            return Err(MemoryError::ProtectionFailed { errno: errno() });
        }
        Ok(())
    }
}

impl Drop for ExecRegion {
    fn drop(&mut self) {
        // SAFETY: the mapping was created by `mmap_rw` with this size.
        unsafe {
            libc::munmap(
                self.ptr.as_ptr() as *mut libc::c_void,
                self.code_size + self.data_size,
            );
        }
    }
}

impl std::fmt::Debug for ExecRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecRegion")
            .field("code", &format_args!("{:#x}", self.code_address()))
            .field("code_size", &self.code_size)
            .field("executable", &self.executable)
            .finish()
    }
}

fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 {
        PAGE_SIZE
    } else {
        size as usize
    }
}

fn round_up(size: usize, align: usize) -> usize {
    (size + align - 1) & !(align - 1)
}

fn errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

fn mmap_rw(size: usize) -> Result<NonNull<u8>, MemoryError> {
    // SAFETY: anonymous private mapping, no file descriptor involved.
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(MemoryError::AllocationFailed {
            size,
            errno: errno(),
        });
    }
    NonNull::new(ptr as *mut u8).ok_or(MemoryError::AllocationFailed { size, errno: 0 })
}
