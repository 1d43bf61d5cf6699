//! Loop device attach primitive
//!
//! One operation: expose a byte range of a backing file as a block
//! device, configured with auto-clear so the kernel releases the device
//! when its last consumer closes it.

use crate::errors::CryptError;
use sifbox_protocol::{loop_flags, LoopInfo64};
use std::{
    fs::{File, OpenOptions},
    io,
    os::unix::io::AsRawFd,
    path::PathBuf,
};

const LOOP_CONTROL: &str = "/dev/loop-control";

// Kernel loop ioctl ABI
const LOOP_SET_FD: libc::c_ulong = 0x4C00;
const LOOP_CLR_FD: libc::c_ulong = 0x4C01;
const LOOP_SET_STATUS64: libc::c_ulong = 0x4C04;
const LOOP_CTL_GET_FREE: libc::c_ulong = 0x4C82;

const LO_FLAGS_READ_ONLY: u32 = 1;
const LO_FLAGS_AUTOCLEAR: u32 = 4;
const LO_NAME_SIZE: usize = 64;
const LO_KEY_SIZE: usize = 32;

/// Mirror of the kernel's struct loop_info64
#[repr(C)]
struct RawLoopInfo64 {
    lo_device: u64,
    lo_inode: u64,
    lo_rdevice: u64,
    lo_offset: u64,
    lo_sizelimit: u64,
    lo_number: u32,
    lo_encrypt_type: u32,
    lo_encrypt_key_size: u32,
    lo_flags: u32,
    lo_file_name: [u8; LO_NAME_SIZE],
    lo_crypt_name: [u8; LO_NAME_SIZE],
    lo_encrypt_key: [u8; LO_KEY_SIZE],
    lo_init: [u64; 2],
}

impl RawLoopInfo64 {
    fn from_wire(info: &LoopInfo64) -> RawLoopInfo64 {
        let mut flags = 0;
        if info.flags & loop_flags::READ_ONLY != 0 {
            flags |= LO_FLAGS_READ_ONLY;
        }
        if info.flags & loop_flags::AUTOCLEAR != 0 {
            flags |= LO_FLAGS_AUTOCLEAR;
        }
        RawLoopInfo64 {
            lo_device: 0,
            lo_inode: 0,
            lo_rdevice: 0,
            lo_offset: info.offset,
            lo_sizelimit: info.sizelimit,
            lo_number: 0,
            lo_encrypt_type: 0,
            lo_encrypt_key_size: 0,
            lo_flags: flags,
            lo_file_name: [0; LO_NAME_SIZE],
            lo_crypt_name: [0; LO_NAME_SIZE],
            lo_encrypt_key: [0; LO_KEY_SIZE],
            lo_init: [0; 2],
        }
    }
}

/// An attached loop device. With auto-clear set the kernel detaches the
/// device once this handle and every mount using it are gone.
#[derive(Debug)]
pub struct LoopDevice {
    pub index: u32,
    pub path: PathBuf,
    device: File,
}

impl LoopDevice {
    pub fn device(&self) -> &File {
        &self.device
    }
}

/// Attach `offset..offset+sizelimit` of `backing` to a free loop device
pub fn attach(backing: &File, info: &LoopInfo64) -> Result<LoopDevice, CryptError> {
    let filesize = backing.metadata()?.len();
    if info.offset + info.sizelimit > filesize {
        return Err(CryptError::LoopRange {
            offset: info.offset,
            sizelimit: info.sizelimit,
            filesize,
        });
    }

    let control = OpenOptions::new().read(true).write(true).open(LOOP_CONTROL)?;
    let index = ioctl(&control, LOOP_CTL_GET_FREE, 0)?;

    let path = PathBuf::from(format!("/dev/loop{}", index));
    let device = if info.flags & loop_flags::READ_ONLY != 0 {
        OpenOptions::new().read(true).open(&path)?
    } else {
        OpenOptions::new().read(true).write(true).open(&path)?
    };

    ioctl(&device, LOOP_SET_FD, backing.as_raw_fd() as libc::c_ulong)?;

    let raw = RawLoopInfo64::from_wire(info);
    let status = unsafe {
        libc::ioctl(
            device.as_raw_fd(),
            LOOP_SET_STATUS64 as _,
            &raw as *const RawLoopInfo64,
        )
    };
    if status < 0 {
        let err = io::Error::last_os_error();
        let _ = ioctl(&device, LOOP_CLR_FD, 0);
        return Err(err.into());
    }

    log::debug!("attached {:?} at offset {}", path, info.offset);
    Ok(LoopDevice {
        index: index as u32,
        path,
        device,
    })
}

fn ioctl(file: &File, request: libc::c_ulong, arg: libc::c_ulong) -> Result<libc::c_int, CryptError> {
    let result = unsafe { libc::ioctl(file.as_raw_fd(), request as _, arg) };
    if result < 0 {
        Err(io::Error::last_os_error().into())
    } else {
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_info_carries_range_and_flags() {
        let raw = RawLoopInfo64::from_wire(&LoopInfo64 {
            offset: 0x10000,
            sizelimit: 100,
            flags: loop_flags::READ_ONLY | loop_flags::AUTOCLEAR,
        });
        assert_eq!(raw.lo_offset, 0x10000);
        assert_eq!(raw.lo_sizelimit, 100);
        assert_eq!(raw.lo_flags, LO_FLAGS_READ_ONLY | LO_FLAGS_AUTOCLEAR);
    }

    #[test]
    fn range_outside_backing_is_refused() {
        let path = std::env::temp_dir().join(format!(
            "sifbox-loop-{}-{:x}.tmp",
            std::process::id(),
            rand::random::<u64>()
        ));
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .unwrap();
        file.set_len(4096).unwrap();
        std::fs::remove_file(&path).unwrap();

        let result = attach(
            &file,
            &LoopInfo64 {
                offset: 4096,
                sizelimit: 1,
                flags: 0,
            },
        );
        assert!(matches!(result, Err(CryptError::LoopRange { .. })));
    }
}
