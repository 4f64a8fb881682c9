//! Bounded copies from guest memory
//!
//! The hypercall dispatcher hands the core raw guest pointers; everything
//! crossing that boundary is copied out with an explicit size cap before it
//! is looked at.

extern crate alloc;

use alloc::string::String;
use alloc::vec::Vec;

use crate::CoprocError;

/// Granule of the guest copy cap.
pub const PAGE_SIZE: usize = 4096;

/// Read access to a guest's memory, provided by the hypercall plumbing.
pub trait GuestMemory {
    /// Copy `dst.len()` bytes from guest address `src` into `dst`.
    fn copy_from_guest(&self, dst: &mut [u8], src: u64) -> Result<(), CoprocError>;
}

/// Copy a string of up to `size` bytes from guest memory, capped at
/// `max_size`, and NUL-terminate it: the result ends at the first NUL or at
/// `size`, whichever comes first.
pub fn copy_string_from_guest(
    mem: &dyn GuestMemory,
    src: u64,
    size: usize,
    max_size: usize,
) -> Result<String, CoprocError> {
    if size == 0 || size > max_size {
        return Err(CoprocError::InvalidArgument);
    }

    let mut buf = Vec::new();
    buf.try_reserve_exact(size).map_err(|_| CoprocError::OutOfMemory)?;
    buf.resize(size, 0);

    mem.copy_from_guest(&mut buf, src)?;

    let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    buf.truncate(len);
    String::from_utf8(buf).map_err(|_| CoprocError::InvalidArgument)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FlatMemory(Vec<u8>);

    impl GuestMemory for FlatMemory {
        fn copy_from_guest(&self, dst: &mut [u8], src: u64) -> Result<(), CoprocError> {
            let start = src as usize;
            let end = start.checked_add(dst.len()).ok_or(CoprocError::InvalidArgument)?;
            if end > self.0.len() {
                return Err(CoprocError::InvalidArgument);
            }
            dst.copy_from_slice(&self.0[start..end]);
            Ok(())
        }
    }

    #[test]
    fn copy_stops_at_nul() {
        let mem = FlatMemory(b"/soc/gpu\0garbage".to_vec());
        let s = copy_string_from_guest(&mem, 0, 16, PAGE_SIZE).unwrap();
        assert_eq!(s, "/soc/gpu");
    }

    #[test]
    fn copy_without_nul_takes_whole_buffer() {
        let mem = FlatMemory(b"/c0".to_vec());
        let s = copy_string_from_guest(&mem, 0, 3, PAGE_SIZE).unwrap();
        assert_eq!(s, "/c0");
    }

    #[test]
    fn oversized_request_is_rejected() {
        let mem = FlatMemory(vec![0; 2 * PAGE_SIZE]);
        assert_eq!(
            copy_string_from_guest(&mem, 0, PAGE_SIZE + 1, PAGE_SIZE),
            Err(CoprocError::InvalidArgument)
        );
        assert_eq!(
            copy_string_from_guest(&mem, 0, 0, PAGE_SIZE),
            Err(CoprocError::InvalidArgument)
        );
    }

    #[test]
    fn out_of_range_guest_pointer_fails() {
        let mem = FlatMemory(b"abc".to_vec());
        assert!(copy_string_from_guest(&mem, 2, 4, PAGE_SIZE).is_err());
    }
}
