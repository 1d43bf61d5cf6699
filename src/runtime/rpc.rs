//! The privileged mount RPC protocol: a client used by the setup role
//! and a server performing the syscalls
//!
//! Each call is one synchronous request/response over a connected socket
//! pair. Ordering is guaranteed purely by sequential blocking calls.

use crate::{crypt::loopdev, errors::RuntimeError};
use fd_queue::{UnixStream, DequeueFd, EnqueueFd};
use sifbox_protocol::{buffer, buffer::IPCBuffer, Errno, LoopInfo64, MountCall, MountReply, SysFd};
use std::{
    ffi::CString,
    fs::File,
    io,
    io::{Read, Write},
    os::unix::io::{AsRawFd, FromRawFd},
};

/// The verbs the privileged server exposes. The setup sequence is written
/// against this trait so tests can substitute a scripted fake server.
pub trait MountRpc {
    fn mount(
        &mut self,
        source: Option<&str>,
        target: &str,
        fstype: Option<&str>,
        flags: u64,
        data: Option<&str>,
    ) -> Result<(), RuntimeError>;

    fn mkdir(&mut self, path: &str, mode: u32) -> Result<(), RuntimeError>;

    fn chroot(&mut self, root: &str) -> Result<(), RuntimeError>;

    fn loop_device(
        &mut self,
        image: &File,
        read_only: bool,
        info: LoopInfo64,
    ) -> Result<u32, RuntimeError>;
}

/// Socket-backed client side of the protocol
pub struct RpcClient {
    stream: UnixStream,
}

impl RpcClient {
    pub fn new(stream: UnixStream) -> RpcClient {
        RpcClient { stream }
    }

    /// Send one call and block until its reply arrives
    fn transact(&mut self, call: &MountCall) -> Result<MountReply, RuntimeError> {
        log::debug!("<{:x?}", call);
        let mut outgoing = IPCBuffer::new();
        outgoing.push_back(call)?;
        for file in outgoing.as_slice().files {
            self.stream.enqueue(file)?;
        }
        self.stream.write_all(outgoing.as_slice().bytes)?;
        self.stream.flush()?;

        let mut incoming = IPCBuffer::new();
        loop {
            match incoming.pop_front::<MountReply>() {
                Ok(reply) => {
                    log::debug!(">{:x?}", reply);
                    return Ok(reply);
                }
                Err(buffer::Error::UnexpectedEnd) => {
                    let slice = incoming.begin_fill();
                    match self.stream.read(slice.bytes)? {
                        0 => return Err(RuntimeError::Disconnected),
                        len => incoming.commit_fill(len, 0),
                    }
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn transact_status(&mut self, verb: &'static str, call: &MountCall) -> Result<(), RuntimeError> {
        match self.transact(call)? {
            MountReply::Status(Ok(())) => Ok(()),
            MountReply::Status(Err(errno)) => Err(RuntimeError::privileged(verb, errno)),
            MountReply::LoopAttached(_) => Err(RuntimeError::UnexpectedReply),
        }
    }
}

impl MountRpc for RpcClient {
    fn mount(
        &mut self,
        source: Option<&str>,
        target: &str,
        fstype: Option<&str>,
        flags: u64,
        data: Option<&str>,
    ) -> Result<(), RuntimeError> {
        self.transact_status(
            "mount",
            &MountCall::Mount {
                source: source.map(String::from),
                target: target.to_string(),
                fstype: fstype.map(String::from),
                flags,
                data: data.map(String::from),
            },
        )
    }

    fn mkdir(&mut self, path: &str, mode: u32) -> Result<(), RuntimeError> {
        self.transact_status(
            "mkdir",
            &MountCall::Mkdir {
                path: path.to_string(),
                mode,
            },
        )
    }

    fn chroot(&mut self, root: &str) -> Result<(), RuntimeError> {
        self.transact_status(
            "chroot",
            &MountCall::Chroot {
                root: root.to_string(),
            },
        )
    }

    fn loop_device(
        &mut self,
        image: &File,
        read_only: bool,
        info: LoopInfo64,
    ) -> Result<u32, RuntimeError> {
        let call = MountCall::LoopDevice {
            image: SysFd(image.as_raw_fd() as u32),
            read_only,
            info,
        };
        match self.transact(&call)? {
            MountReply::LoopAttached(Ok(index)) => Ok(index),
            MountReply::LoopAttached(Err(errno)) => {
                Err(RuntimeError::privileged("loop attach", errno))
            }
            MountReply::Status(_) => Err(RuntimeError::UnexpectedReply),
        }
    }
}

/// Privileged server side: a small, bounded set of syscalls performed on
/// behalf of the setup role. Serves until the client closes the socket.
pub struct RpcServer {
    stream: UnixStream,
}

impl RpcServer {
    pub fn new(stream: UnixStream) -> RpcServer {
        RpcServer { stream }
    }

    pub fn serve(mut self) -> Result<(), RuntimeError> {
        let mut buffer = IPCBuffer::new();
        loop {
            let call = loop {
                match buffer.pop_front::<MountCall>() {
                    Ok(call) => break call,
                    Err(buffer::Error::UnexpectedEnd) => {
                        let (num_bytes, num_files) = {
                            let slice = buffer.begin_fill();
                            let num_bytes = self.stream.read(slice.bytes)?;
                            if num_bytes == 0 {
                                // Normal shutdown: setup role closed its end
                                return Ok(());
                            }
                            let mut num_files = 0;
                            while num_files < slice.files.len() {
                                match self.stream.dequeue() {
                                    Some(fd) => {
                                        slice.files[num_files] = SysFd(fd as u32);
                                        num_files += 1;
                                    }
                                    None => break,
                                }
                            }
                            (num_bytes, num_files)
                        };
                        buffer.commit_fill(num_bytes, num_files);
                    }
                    Err(err) => return Err(err.into()),
                }
            };

            log::debug!(">{:x?}", call);
            let reply = dispatch(call);
            log::debug!("<{:x?}", reply);

            let mut outgoing = IPCBuffer::new();
            outgoing.push_back(&reply)?;
            self.stream.write_all(outgoing.as_slice().bytes)?;
            self.stream.flush()?;
        }
    }
}

fn dispatch(call: MountCall) -> MountReply {
    match call {
        MountCall::Mount {
            source,
            target,
            fstype,
            flags,
            data,
        } => MountReply::Status(do_mount(
            source.as_deref(),
            &target,
            fstype.as_deref(),
            flags,
            data.as_deref(),
        )),
        MountCall::Mkdir { path, mode } => MountReply::Status(do_mkdir(&path, mode)),
        MountCall::Chroot { root } => MountReply::Status(do_chroot(&root)),
        MountCall::LoopDevice {
            image,
            read_only: _,
            info,
        } => MountReply::LoopAttached(do_loop_device(image, info)),
    }
}

fn os_errno() -> Errno {
    Errno(-io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO))
}

fn cstring(s: &str) -> Result<CString, Errno> {
    CString::new(s).map_err(|_| Errno(-libc::EINVAL))
}

fn do_mount(
    source: Option<&str>,
    target: &str,
    fstype: Option<&str>,
    flags: u64,
    data: Option<&str>,
) -> Result<(), Errno> {
    let source = source.map(cstring).transpose()?;
    let target = cstring(target)?;
    let fstype = fstype.map(cstring).transpose()?;
    let data = data.map(cstring).transpose()?;

    let as_ptr = |c: &Option<CString>| c.as_ref().map_or(std::ptr::null(), |c| c.as_ptr());
    let result = unsafe {
        libc::mount(
            as_ptr(&source),
            target.as_ptr(),
            as_ptr(&fstype),
            flags as libc::c_ulong,
            as_ptr(&data) as *const libc::c_void,
        )
    };
    if result != 0 {
        return Err(os_errno());
    }
    Ok(())
}

fn do_mkdir(path: &str, mode: u32) -> Result<(), Errno> {
    let path = cstring(path)?;
    let result = unsafe { libc::mkdir(path.as_ptr(), mode as libc::mode_t) };
    if result != 0 {
        let err = io::Error::last_os_error();
        // An already existing mountpoint directory is fine
        if err.raw_os_error() != Some(libc::EEXIST) {
            return Err(os_errno());
        }
    }
    Ok(())
}

/// Enter the assembled root: chdir in, pivot onto a throwaway directory
/// inside it, re-chroot, detach the relocated old root, return to "/"
fn do_chroot(root: &str) -> Result<(), Errno> {
    const PIVOT_DIR: &str = "etc";

    let root = cstring(root)?;
    if unsafe { libc::chdir(root.as_ptr()) } != 0 {
        return Err(os_errno());
    }
    let here = cstring(".")?;
    let pivot = cstring(PIVOT_DIR)?;
    if unsafe { libc::syscall(libc::SYS_pivot_root, here.as_ptr(), pivot.as_ptr()) } != 0 {
        return Err(os_errno());
    }
    if unsafe { libc::chroot(here.as_ptr()) } != 0 {
        return Err(os_errno());
    }
    let old_root = cstring("/etc")?;
    if unsafe { libc::umount2(old_root.as_ptr(), libc::MNT_DETACH) } != 0 {
        return Err(os_errno());
    }
    let slash = cstring("/")?;
    if unsafe { libc::chdir(slash.as_ptr()) } != 0 {
        return Err(os_errno());
    }
    Ok(())
}

fn do_loop_device(image: SysFd, info: LoopInfo64) -> Result<u32, Errno> {
    // The descriptor arrived over SCM_RIGHTS and is ours to close
    let backing = unsafe { File::from_raw_fd(image.as_raw_fd()) };
    match loopdev::attach(&backing, &info) {
        Ok(device) => Ok(device.index),
        Err(crate::errors::CryptError::Io(err)) => {
            Err(Errno(-err.raw_os_error().unwrap_or(libc::EIO)))
        }
        Err(_) => Err(Errno(-libc::EINVAL)),
    }
}
