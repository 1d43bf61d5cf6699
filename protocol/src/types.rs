use core::fmt;

/// Exit codes returned by the stage and supervisor processes
pub mod exit {
    pub const EXIT_OK: i32 = 0;
    pub const EXIT_SETUP_FAILED: i32 = 70;
    pub const EXIT_DISCONNECTED: i32 = 71;
    pub const EXIT_IO_ERROR: i32 = 72;
}

/// A host file descriptor, carried out-of-band next to the byte stream.
///
/// Serializing a `SysFd` never places bytes in the message; the descriptor
/// is routed to the file queue and travels via SCM_RIGHTS.
#[derive(Debug, PartialEq, Eq, Copy, Clone, Hash)]
#[repr(C)]
pub struct SysFd(pub u32);

impl Default for SysFd {
    fn default() -> Self {
        SysFd(!0u32)
    }
}

impl std::os::unix::io::AsRawFd for SysFd {
    fn as_raw_fd(&self) -> std::os::unix::io::RawFd {
        self.0 as std::os::raw::c_int
    }
}

/// Raw kernel errno as returned by a failed privileged syscall (negative)
#[derive(PartialEq, Eq, Copy, Clone, Serialize, Deserialize)]
#[repr(C)]
pub struct Errno(pub i32);

impl fmt::Debug for Errno {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Errno({})", self.0)
    }
}

/// Flags understood by the loop-device attach operation
pub mod loop_flags {
    pub const READ_ONLY: u32 = 1;
    pub const AUTOCLEAR: u32 = 4;
}

/// Loop device configuration, applied immediately after attach.
///
/// A `sizelimit` of zero means "to the end of the backing file".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[repr(C)]
pub struct LoopInfo64 {
    pub offset: u64,
    pub sizelimit: u64,
    pub flags: u32,
}
