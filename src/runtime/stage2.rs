//! Phase 2: privileged mount construction
//!
//! Two roles share this phase. The setup role drives the privileged RPC
//! server through the strict mount sequence and exits; the final role
//! waits for both setup-role children, then replaces itself with the
//! contained program (or hands off to a detached supervisor in instance
//! mode).
//!
//! The sequence order is load-bearing: private remount first so mount
//! events never leak to the host, the root before anything mounted into
//! it, and the chroot strictly last. Any failure aborts the launch; a
//! half-constructed root is never executed into.

use crate::{
    crypt,
    errors::{RuntimeError, SifError},
    runtime::{rpc::MountRpc, LaunchConfig, ASSEMBLY_DIR, STAGING_DIR},
    sif::{Fstype, OpenMode, SifFile},
};
use sifbox_protocol::{loop_flags, LoopInfo64};
use std::{
    ffi::CString,
    fs::File,
    io,
    os::unix::io::RawFd,
    path::{Path, PathBuf},
};

/// Where this phase assembles and stages the container root; overridable
/// so the sequence can run against scratch directories in tests
#[derive(Debug, Clone)]
pub struct SessionPaths {
    pub assembly: PathBuf,
    pub staging: PathBuf,
}

impl Default for SessionPaths {
    fn default() -> SessionPaths {
        SessionPaths {
            assembly: PathBuf::from(ASSEMBLY_DIR),
            staging: PathBuf::from(STAGING_DIR),
        }
    }
}

/// The setup role: construct the mount tree, strictly in order, then
/// chroot into it and exit
pub fn run_setup(
    client: &mut dyn MountRpc,
    config: &LaunchConfig,
    session: &SessionPaths,
) -> Result<(), RuntimeError> {
    let namespaces = config.namespaces();
    let spec = &config.spec;
    let assembly = path_str(&session.assembly)?;

    // Nothing mounted from here on may propagate back to the host
    client.mount(
        None,
        "/",
        None,
        (libc::MS_PRIVATE | libc::MS_REC) as u64,
        None,
    )?;
    mkdir_all(client, &session.assembly)?;

    let root_meta = std::fs::metadata(&spec.root)?;
    if root_meta.is_file() && !namespaces.user {
        mount_image_root(client, config, assembly)?;
    } else {
        // Directory root, or a user namespace where loop devices are out
        // of reach: a read-only bind of the root path itself
        client.mount(
            Some(path_str(&spec.root)?),
            assembly,
            None,
            (libc::MS_BIND | libc::MS_NOSUID | libc::MS_NODEV | libc::MS_RDONLY) as u64,
            None,
        )?;
    }

    let proc_target = session.assembly.join("proc");
    mkdir_all(client, &proc_target)?;
    if namespaces.pid {
        client.mount(
            Some("proc"),
            path_str(&proc_target)?,
            Some("proc"),
            (libc::MS_NOSUID | libc::MS_NODEV) as u64,
            None,
        )?;
    } else {
        bind(client, Path::new("/proc"), &proc_target, true)?;
    }

    let sys_target = session.assembly.join("sys");
    mkdir_all(client, &sys_target)?;
    if !namespaces.user {
        client.mount(
            Some("sysfs"),
            path_str(&sys_target)?,
            Some("sysfs"),
            (libc::MS_NOSUID | libc::MS_NODEV) as u64,
            None,
        )?;
    } else {
        bind(client, Path::new("/sys"), &sys_target, true)?;
    }

    bind(client, Path::new("/dev"), &session.assembly.join("dev"), true)?;
    bind(
        client,
        Path::new("/etc/passwd"),
        &session.assembly.join("etc/passwd"),
        false,
    )?;
    bind(
        client,
        Path::new("/etc/group"),
        &session.assembly.join("etc/group"),
        false,
    )?;
    let home_target = session
        .assembly
        .join(spec.home.strip_prefix("/").unwrap_or(&spec.home));
    bind(client, &spec.home, &home_target, false)?;

    for extra in &spec.binds {
        let target = session
            .assembly
            .join(extra.destination.strip_prefix("/").unwrap_or(&extra.destination));
        bind(client, &extra.source, &target, false)?;
    }

    // Stage the assembled root on a fixed path and enter it
    mkdir_all(client, &session.staging)?;
    client.mount(
        Some(assembly),
        path_str(&session.staging)?,
        None,
        (libc::MS_BIND | libc::MS_REC) as u64,
        None,
    )?;
    std::env::set_current_dir(&session.staging)?;
    client.chroot(path_str(&session.staging)?)?;
    Ok(())
}

/// Loop-attach the image's primary partition read-only and mount it with
/// the filesystem type carried in the partition metadata, decrypting
/// through a mapper device first when the partition is encrypted
fn mount_image_root(
    client: &mut dyn MountRpc,
    config: &LaunchConfig,
    assembly: &str,
) -> Result<(), RuntimeError> {
    let spec = &config.spec;
    let image = SifFile::load(&spec.root, OpenMode::ReadOnly)?;
    let partition = image.primary_partition()?;
    let extra = partition.partition()?;
    let (fileoff, filelen) = (partition.fileoff, partition.filelen);

    let backing = File::open(&spec.root)?;
    let index = client.loop_device(
        &backing,
        true,
        LoopInfo64 {
            offset: fileoff as u64,
            sizelimit: filelen as u64,
            flags: loop_flags::READ_ONLY | loop_flags::AUTOCLEAR,
        },
    )?;
    let loop_path = format!("/dev/loop{}", index);

    let fstype = extra.fstype.mount_name().ok_or(SifError::InvalidField {
        field: "fstype",
        value: extra.fstype as i64,
    })?;

    let device = match (extra.fstype, &config.key) {
        (Fstype::EncryptedSquash, Some(key)) => {
            crypt::device::open(Path::new(&loop_path), key)?
                .path()
                .to_string_lossy()
                .into_owned()
        }
        _ => loop_path,
    };

    client.mount(
        Some(&device),
        assembly,
        Some(fstype),
        (libc::MS_NOSUID | libc::MS_RDONLY | libc::MS_NODEV) as u64,
        Some("errors=remount-ro"),
    )?;
    Ok(())
}

/// Issue Mkdir for every missing component of `path`
fn mkdir_all(client: &mut dyn MountRpc, path: &Path) -> Result<(), RuntimeError> {
    let mut partial = PathBuf::from("/");
    for component in path.components().skip(1) {
        partial.push(component);
        client.mkdir(path_str(&partial)?, 0o755)?;
    }
    Ok(())
}

/// Bind one host path into the assembly, creating a directory mountpoint
/// when the source is a directory
fn bind(
    client: &mut dyn MountRpc,
    source: &Path,
    target: &Path,
    recursive: bool,
) -> Result<(), RuntimeError> {
    if std::fs::metadata(source)?.is_dir() {
        mkdir_all(client, target)?;
    }
    let mut flags = libc::MS_BIND | libc::MS_NOSUID | libc::MS_NODEV;
    if recursive {
        flags |= libc::MS_REC;
    }
    client.mount(
        Some(path_str(source)?),
        path_str(target)?,
        None,
        flags as u64,
        None,
    )
}

fn path_str(path: &Path) -> Result<&str, RuntimeError> {
    path.to_str().ok_or_else(|| {
        RuntimeError::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            "path is not valid utf-8",
        ))
    })
}

/// The final role: wait for both setup-role children with explicit
/// per-child waits, summing their exit statuses; any non-zero sum is a
/// failed setup. On success the config socket is marked close-on-exec so
/// the supervisor can tell a successful exec (socket closes) apart from
/// a setup failure.
pub fn run_final(
    children: &[libc::pid_t],
    config_socket_fd: RawFd,
) -> Result<(), RuntimeError> {
    let mut status_sum = 0;
    for &pid in children {
        let mut status: libc::c_int = 0;
        if unsafe { libc::waitpid(pid, &mut status, 0) } < 0 {
            return Err(io::Error::last_os_error().into());
        }
        status_sum += if libc::WIFEXITED(status) {
            libc::WEXITSTATUS(status)
        } else {
            1
        };
    }
    if status_sum != 0 {
        return Err(RuntimeError::SetupFailed { status_sum });
    }
    set_close_on_exec(config_socket_fd)?;
    Ok(())
}

/// Replace this process with the contained program. Only returns on error.
pub fn exec_payload(config: &LaunchConfig) -> Result<std::convert::Infallible, RuntimeError> {
    let spec = &config.spec;
    if spec.process.args.is_empty() {
        return Err(RuntimeError::NoEntryPoint);
    }

    let cwd = CString::new(spec.process.cwd.as_str())?;
    if unsafe { libc::chdir(cwd.as_ptr()) } != 0 {
        log::warn!("cannot enter working directory {:?}", spec.process.cwd);
    }

    let argv: Vec<CString> = spec
        .process
        .args
        .iter()
        .map(|arg| CString::new(arg.as_str()))
        .collect::<Result<_, _>>()?;
    let envp: Vec<CString> = spec
        .process
        .env
        .iter()
        .map(|var| CString::new(var.as_str()))
        .collect::<Result<_, _>>()?;

    let mut argv_ptrs: Vec<*const libc::c_char> = argv.iter().map(|a| a.as_ptr()).collect();
    argv_ptrs.push(std::ptr::null());
    let mut envp_ptrs: Vec<*const libc::c_char> = envp.iter().map(|e| e.as_ptr()).collect();
    envp_ptrs.push(std::ptr::null());

    unsafe { libc::execve(argv_ptrs[0] as *const _, argv_ptrs.as_ptr(), envp_ptrs.as_ptr()) };
    Err(io::Error::last_os_error().into())
}

fn set_close_on_exec(fd: RawFd) -> Result<(), RuntimeError> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error().into());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error().into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        runtime::{BindPath, EngineSpec, Namespaces, ProcessSpec, CONFIG_VERSION},
        sif::{
            CreateInfo, DataSource, Datatype, DescriptorInput, Parttype, PartitionExtra,
            SifFile, arch_code,
        },
    };
    use sifbox_protocol::Errno;

    /// Scripted stand-in for the privileged server, recording the call
    /// order and optionally failing one verb/target combination
    struct FakeRpc {
        calls: Vec<String>,
        fail_on: Option<&'static str>,
    }

    impl FakeRpc {
        fn new() -> FakeRpc {
            FakeRpc {
                calls: Vec::new(),
                fail_on: None,
            }
        }

        fn record(&mut self, entry: String, trigger: &str) -> Result<(), RuntimeError> {
            self.calls.push(entry);
            match self.fail_on {
                Some(pattern) if trigger.contains(pattern) => Err(RuntimeError::Privileged {
                    verb: "mount",
                    errno: Errno(-libc::EPERM).0,
                }),
                _ => Ok(()),
            }
        }
    }

    impl MountRpc for FakeRpc {
        fn mount(
            &mut self,
            source: Option<&str>,
            target: &str,
            fstype: Option<&str>,
            _flags: u64,
            _data: Option<&str>,
        ) -> Result<(), RuntimeError> {
            let entry = format!(
                "mount {} -> {} ({})",
                source.unwrap_or("none"),
                target,
                fstype.unwrap_or("bind")
            );
            let trigger = format!("{}|{}", target, fstype.unwrap_or("bind"));
            self.record(entry, &trigger)
        }

        fn mkdir(&mut self, _path: &str, _mode: u32) -> Result<(), RuntimeError> {
            Ok(())
        }

        fn chroot(&mut self, root: &str) -> Result<(), RuntimeError> {
            let entry = format!("chroot {}", root);
            self.record(entry, "chroot")
        }

        fn loop_device(
            &mut self,
            _image: &File,
            _read_only: bool,
            info: LoopInfo64,
        ) -> Result<u32, RuntimeError> {
            self.calls
                .push(format!("loop offset={} len={}", info.offset, info.sizelimit));
            Ok(7)
        }
    }

    fn scratch_session() -> SessionPaths {
        let base = std::env::temp_dir().join(format!(
            "sifbox-stage2-{}-{:x}",
            std::process::id(),
            rand::random::<u64>()
        ));
        let session = SessionPaths {
            assembly: base.join("assembly"),
            staging: base.join("root"),
        };
        std::fs::create_dir_all(&session.assembly).unwrap();
        std::fs::create_dir_all(&session.staging).unwrap();
        session
    }

    fn image_with_primary_partition() -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "sifbox-stage2-image-{}-{:x}.sif",
            std::process::id(),
            rand::random::<u64>()
        ));
        SifFile::create(
            &path,
            CreateInfo::new(vec![DescriptorInput::new(
                Datatype::Partition,
                DataSource::Bytes(vec![0u8; 100]),
            )
            .name("rootfs")
            .partition(PartitionExtra {
                fstype: crate::sif::Fstype::Squash,
                parttype: Parttype::PrimSys,
                arch: *arch_code("amd64").unwrap(),
            })]),
        )
        .unwrap();
        path
    }

    fn config_for(root: PathBuf, namespaces: Namespaces) -> LaunchConfig {
        LaunchConfig {
            version: CONFIG_VERSION,
            ns_flags: namespaces.flags(),
            uid_map: Vec::new(),
            gid_map: Vec::new(),
            key: None,
            spec: EngineSpec {
                engine: "sif".to_string(),
                image: root.clone(),
                root,
                writable: false,
                overlay: None,
                binds: Vec::new(),
                namespaces,
                process: ProcessSpec::default(),
                home: std::env::temp_dir(),
                instance: false,
                key_uri: None,
            },
        }
    }

    #[test]
    fn mount_order_for_pid_namespace_without_user_namespace() {
        let session = scratch_session();
        let image = image_with_primary_partition();
        let config = config_for(
            image.clone(),
            Namespaces {
                pid: true,
                mount: true,
                ..Default::default()
            },
        );

        let mut fake = FakeRpc::new();
        run_setup(&mut fake, &config, &session).unwrap();

        // The image is file-backed with no user namespace: loop attach,
        // then typed mount; fresh proc for the pid namespace; fresh sysfs
        // because there is no user namespace
        assert!(fake.calls[0].starts_with("mount none -> /"));
        assert!(fake.calls[1].starts_with("loop offset="), "{:?}", fake.calls);
        assert!(fake.calls[2].contains("/dev/loop7"));
        assert!(fake.calls[2].contains("(squashfs)"));
        assert!(fake.calls[3].contains("mount proc"));
        assert!(fake.calls[4].contains("mount sysfs"));
        assert!(fake.calls[5].contains("/dev -> "));
        assert!(fake.calls[6].contains("/etc/passwd"));
        assert!(fake.calls[7].contains("/etc/group"));
        // home bind, then the staging bind, then the chroot, and nothing after
        assert!(fake.calls[fake.calls.len() - 2].contains(session.staging.to_str().unwrap()));
        assert!(fake.calls.last().unwrap().starts_with("chroot"));

        std::fs::remove_file(&image).unwrap();
    }

    #[test]
    fn directory_root_in_user_namespace_is_bound_not_looped() {
        let session = scratch_session();
        let rootdir = std::env::temp_dir();
        let config = config_for(
            rootdir,
            Namespaces {
                user: true,
                pid: false,
                mount: true,
                ..Default::default()
            },
        );

        let mut fake = FakeRpc::new();
        run_setup(&mut fake, &config, &session).unwrap();

        assert!(!fake.calls.iter().any(|c| c.starts_with("loop")));
        // Host /proc is bound since there is no pid namespace, host /sys
        // since a user namespace is active
        assert!(fake.calls.iter().any(|c| c.contains("/proc -> ")));
        assert!(fake.calls.iter().any(|c| c.contains("/sys -> ")));
        assert!(fake.calls.last().unwrap().starts_with("chroot"));
    }

    #[test]
    fn sys_mount_failure_halts_before_chroot() {
        let session = scratch_session();
        let image = image_with_primary_partition();
        let config = config_for(
            image.clone(),
            Namespaces {
                pid: true,
                mount: true,
                ..Default::default()
            },
        );

        let mut fake = FakeRpc::new();
        fake.fail_on = Some("sysfs");
        let result = run_setup(&mut fake, &config, &session);
        assert!(matches!(result, Err(RuntimeError::Privileged { .. })));
        assert!(!fake.calls.iter().any(|c| c.starts_with("chroot")));

        std::fs::remove_file(&image).unwrap();
    }

    #[test]
    fn extra_binds_land_inside_the_assembly() {
        let session = scratch_session();
        let mut config = config_for(
            std::env::temp_dir(),
            Namespaces {
                user: true,
                mount: true,
                ..Default::default()
            },
        );
        config.spec.binds = vec![BindPath {
            source: std::env::temp_dir(),
            destination: PathBuf::from("/data"),
            read_only: true,
        }];

        let mut fake = FakeRpc::new();
        run_setup(&mut fake, &config, &session).unwrap();
        let expected = format!("{}/data", session.assembly.to_str().unwrap());
        assert!(fake.calls.iter().any(|c| c.contains(&expected)));
    }

    #[test]
    fn final_role_reports_the_status_sum() {
        // Children that exit non-zero must fail the launch
        let child = unsafe { libc::fork() };
        if child == 0 {
            unsafe { libc::_exit(3) };
        }
        let (socket, _peer) = std::os::unix::net::UnixStream::pair().unwrap();
        use std::os::unix::io::AsRawFd;
        match run_final(&[child], socket.as_raw_fd()) {
            Err(RuntimeError::SetupFailed { status_sum }) => assert_eq!(status_sum, 3),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn final_role_accepts_clean_children() {
        let child = unsafe { libc::fork() };
        if child == 0 {
            unsafe { libc::_exit(0) };
        }
        let (socket, _peer) = std::os::unix::net::UnixStream::pair().unwrap();
        use std::os::unix::io::AsRawFd;
        run_final(&[child], socket.as_raw_fd()).unwrap();
        // And the socket is now close-on-exec
        let flags = unsafe { libc::fcntl(socket.as_raw_fd(), libc::F_GETFD) };
        assert!(flags & libc::FD_CLOEXEC != 0);
    }
}
