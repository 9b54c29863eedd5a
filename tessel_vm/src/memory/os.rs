use std::{io, ptr::NonNull};

use super::{MemoryError, PageReservation};

/// Address space reserved from the OS with no access rights.
/// Committed ranges are made readable and writable on demand.
pub struct OsReservation {
    base: NonNull<u8>,
    size: usize,
}

// The mapping is owned exclusively by this value.
unsafe impl Send for OsReservation {}

impl OsReservation {
    pub fn reserve(size: usize) -> Result<Self, MemoryError> {
        let base = reserve_region(size)?;
        Ok(Self { base, size })
    }
}

impl PageReservation for OsReservation {
    fn base(&self) -> NonNull<u8> {
        self.base
    }

    fn size(&self) -> usize {
        self.size
    }

    fn commit(&mut self, offset: usize, len: usize) -> Result<(), MemoryError> {
        debug_assert!(offset + len <= self.size);

        let ptr = unsafe { self.base.as_ptr().add(offset) };
        commit_region(ptr, len).map_err(|source| MemoryError::Commit {
            offset,
            len,
            source,
        })
    }

    fn decommit(&mut self, offset: usize, len: usize) -> Result<(), MemoryError> {
        debug_assert!(offset + len <= self.size);

        let ptr = unsafe { self.base.as_ptr().add(offset) };
        decommit_region(ptr, len).map_err(|source| MemoryError::Decommit {
            offset,
            len,
            source,
        })
    }
}

impl Drop for OsReservation {
    fn drop(&mut self) {
        if let Err(err) = release_region(self.base.as_ptr(), self.size) {
            tessel_log::error!("couldn't release stack reservation: {}", err);
        }
    }
}

#[cfg(unix)]
pub(super) fn page_size() -> usize {
    match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
        size if size > 0 => size as usize,
        _ => 4096,
    }
}

#[cfg(unix)]
fn reserve_region(size: usize) -> Result<NonNull<u8>, MemoryError> {
    #[cfg(target_os = "linux")]
    const EXTRA_FLAGS: libc::c_int = libc::MAP_NORESERVE;
    #[cfg(not(target_os = "linux"))]
    const EXTRA_FLAGS: libc::c_int = 0;

    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_NONE,
            libc::MAP_ANON | libc::MAP_PRIVATE | EXTRA_FLAGS,
            -1,
            0,
        )
    };

    if ptr == libc::MAP_FAILED {
        return Err(MemoryError::Reserve {
            size,
            source: io::Error::last_os_error(),
        });
    }

    NonNull::new(ptr as *mut u8).ok_or(MemoryError::Reserve {
        size,
        source: io::Error::new(io::ErrorKind::Other, "mmap returned null"),
    })
}

#[cfg(unix)]
fn commit_region(ptr: *mut u8, len: usize) -> io::Result<()> {
    let rc = unsafe { libc::mprotect(ptr as *mut _, len, libc::PROT_READ | libc::PROT_WRITE) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(unix)]
fn decommit_region(ptr: *mut u8, len: usize) -> io::Result<()> {
    // Private anonymous pages read back as zero after MADV_DONTNEED.
    let rc = unsafe { libc::madvise(ptr as *mut _, len, libc::MADV_DONTNEED) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }

    let rc = unsafe { libc::mprotect(ptr as *mut _, len, libc::PROT_NONE) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(unix)]
fn release_region(ptr: *mut u8, len: usize) -> io::Result<()> {
    let rc = unsafe { libc::munmap(ptr as *mut _, len) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(windows)]
pub(super) fn page_size() -> usize {
    use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};

    let mut info: SYSTEM_INFO = unsafe { std::mem::zeroed() };
    unsafe { GetSystemInfo(&mut info) };
    info.dwPageSize as usize
}

#[cfg(windows)]
fn reserve_region(size: usize) -> Result<NonNull<u8>, MemoryError> {
    use windows_sys::Win32::System::Memory::{VirtualAlloc, MEM_RESERVE, PAGE_NOACCESS};

    let ptr = unsafe { VirtualAlloc(std::ptr::null(), size, MEM_RESERVE, PAGE_NOACCESS) };

    NonNull::new(ptr as *mut u8).ok_or_else(|| MemoryError::Reserve {
        size,
        source: io::Error::last_os_error(),
    })
}

#[cfg(windows)]
fn commit_region(ptr: *mut u8, len: usize) -> io::Result<()> {
    use windows_sys::Win32::System::Memory::{VirtualAlloc, MEM_COMMIT, PAGE_READWRITE};

    let res = unsafe { VirtualAlloc(ptr as *const _, len, MEM_COMMIT, PAGE_READWRITE) };
    if res.is_null() {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(windows)]
fn decommit_region(ptr: *mut u8, len: usize) -> io::Result<()> {
    use windows_sys::Win32::System::Memory::{VirtualFree, MEM_DECOMMIT};

    let ok = unsafe { VirtualFree(ptr as *mut _, len, MEM_DECOMMIT) };
    if ok == 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(windows)]
fn release_region(ptr: *mut u8, _len: usize) -> io::Result<()> {
    use windows_sys::Win32::System::Memory::{VirtualFree, MEM_RELEASE};

    let ok = unsafe { VirtualFree(ptr as *mut _, 0, MEM_RELEASE) };
    if ok == 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(any(unix, windows)))]
pub(super) fn page_size() -> usize {
    4096
}

#[cfg(not(any(unix, windows)))]
fn reserve_region(_size: usize) -> Result<NonNull<u8>, MemoryError> {
    Err(MemoryError::Unsupported)
}

#[cfg(not(any(unix, windows)))]
fn commit_region(_ptr: *mut u8, _len: usize) -> io::Result<()> {
    Err(io::Error::new(io::ErrorKind::Other, "unsupported platform"))
}

#[cfg(not(any(unix, windows)))]
fn decommit_region(_ptr: *mut u8, _len: usize) -> io::Result<()> {
    Err(io::Error::new(io::ErrorKind::Other, "unsupported platform"))
}

#[cfg(not(any(unix, windows)))]
fn release_region(_ptr: *mut u8, _len: usize) -> io::Result<()> {
    Ok(())
}
