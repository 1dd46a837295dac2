//! W^X executable memory: a region is writable while the compiler fills it
//! in, then flipped read+execute before any guest call can reach it. Never
//! both at once.

use std::ptr::NonNull;

#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error("mmap failed: {0}")]
    Mmap(std::io::Error),
    #[error("mprotect failed: {0}")]
    Mprotect(std::io::Error),
}

/// One page-rounded anonymous mapping holding a single compiled chunk's
/// machine code. Freed on drop via `munmap`.
pub struct ExecutableMemory {
    ptr: NonNull<u8>,
    len: usize,
}

impl ExecutableMemory {
    /// Map `code.len()` bytes rounded up to a whole page, copy `code` in
    /// while the mapping is still writable, then `mprotect` it to
    /// read+execute. The mapping is never writable and executable at once.
    pub fn new(code: &[u8]) -> Result<Self, MemoryError> {
        let len = round_up_to_page(code.len().max(1));
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(MemoryError::Mmap(std::io::Error::last_os_error()));
        }
        // SAFETY: mmap succeeded, addr is non-null and len bytes are ours.
        let ptr = unsafe { NonNull::new_unchecked(addr as *mut u8) };
        unsafe {
            std::ptr::copy_nonoverlapping(code.as_ptr(), ptr.as_ptr(), code.len());
        }
        let rc = unsafe {
            libc::mprotect(ptr.as_ptr() as *mut libc::c_void, len, libc::PROT_READ | libc::PROT_EXEC)
        };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            unsafe {
                libc::munmap(ptr.as_ptr() as *mut libc::c_void, len);
            }
            return Err(MemoryError::Mprotect(err));
        }
        Ok(Self { ptr, len })
    }

    /// Address of the first byte, castable to the compiled chunk's entry
    /// point type.
    pub fn entry_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// Page-rounded size of the mapping (not the length of the code it
    /// holds), for `CodeCache` size accounting.
    pub fn mapped_len(&self) -> usize {
        self.len
    }
}

impl Drop for ExecutableMemory {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len);
        }
    }
}

fn page_size() -> usize {
    let n = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if n <= 0 {
        4096
    } else {
        n as usize
    }
}

fn round_up_to_page(n: usize) -> usize {
    let page = page_size();
    (n + page - 1) / page * page
}

#[cfg(test)]
mod tests {
    use super::*;

    // mov eax, 42; ret
    const RETURN_42: &[u8] = &[0xB8, 0x2A, 0x00, 0x00, 0x00, 0xC3];

    #[test]
    fn maps_writes_and_executes() {
        let mem = ExecutableMemory::new(RETURN_42).expect("mmap should succeed");
        assert!(mem.mapped_len() >= RETURN_42.len());
        let f: extern "C" fn() -> i32 = unsafe { std::mem::transmute(mem.entry_ptr()) };
        assert_eq!(f(), 42);
    }

    #[test]
    fn rounds_length_up_to_a_whole_page() {
        let mem = ExecutableMemory::new(&[0xC3]).unwrap();
        assert_eq!(mem.mapped_len() % page_size(), 0);
        assert!(mem.mapped_len() >= page_size());
    }

    #[test]
    fn empty_code_still_maps_a_full_page() {
        let mem = ExecutableMemory::new(&[]).unwrap();
        assert_eq!(mem.mapped_len(), page_size());
    }
}
