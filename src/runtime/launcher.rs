//! Process orchestration for one launch
//!
//! The launcher wires the fixed process sequence together: a socket pair
//! carrying the serialized configuration, the unprivileged stage 1
//! child, the privileged stage 2 process (which forks the RPC server and
//! the setup-role client inside the new namespaces), and finally the
//! supervisor in this process.
//!
//! File descriptors are handed to re-executed stages as numeric argv
//! arguments (`-stage`, `-socket`); the configuration itself always
//! travels over the socket.

use crate::{
    errors::RuntimeError,
    runtime::{
        envchunk, rpc::{RpcClient, RpcServer}, stage2, supervisor,
        supervisor::SupervisorParams, EngineSpec, LaunchConfig, CONFIG_VERSION,
        ENV_CONFIG_PREFIX, ENV_CONTAINER_PID, ENV_RUNTIME, ENV_SOCKET,
    },
};
use sifbox_protocol::exit;
use std::{
    io::{Read, Write},
    os::unix::{
        io::{AsRawFd, RawFd},
        net::UnixStream,
        process::CommandExt,
    },
    process::Command,
};

/// Environment prefix carrying the engine spec to the stage 1 child
pub const ENV_SPEC_PREFIX: &str = "SIFBOX_SPEC";

const SELF_EXE: &str = "/proc/self/exe";

pub struct Launcher {
    spec: EngineSpec,
}

impl Launcher {
    pub fn new(spec: EngineSpec) -> Launcher {
        Launcher { spec }
    }

    /// Run the whole launch sequence. For a foreground container this
    /// blocks until the container exits and returns its exit status; an
    /// instance detaches and returns immediately.
    pub fn run(self) -> Result<i32, RuntimeError> {
        let spec = self.spec;

        // One socket pair: stage 1 writes the configuration into its
        // end, stage 2 reads it from the other. This process keeps the
        // stage 1 end open to observe the exec/failure outcome.
        let (monitor_socket, stage2_socket) = UnixStream::pair()?;
        clear_close_on_exec(monitor_socket.as_raw_fd())?;
        clear_close_on_exec(stage2_socket.as_raw_fd())?;

        let spec_json = serde_json::to_vec(&spec)?;
        let mut stage1 = Command::new(SELF_EXE);
        stage1
            .arg0("sifbox-stage1")
            .args(&["stage", "-stage", "1"])
            .args(&["-socket", &monitor_socket.as_raw_fd().to_string()])
            .envs(envchunk::to_env(ENV_SPEC_PREFIX, &spec_json)?);
        let mut stage1 = stage1.spawn()?;

        // Stage 2 must not inherit the monitor end, or the exec signal
        // would be masked by its own copy staying open in the container
        set_close_on_exec(monitor_socket.as_raw_fd())?;

        let mut stage2 = Command::new(SELF_EXE);
        stage2
            .arg0("sifbox-stage2")
            .args(&["stage", "-stage", "2"])
            .args(&["-socket", &stage2_socket.as_raw_fd().to_string()]);
        let mut stage2 = stage2.spawn()?;
        // Only stage 2 may hold the read end now; our copy would keep
        // the monitor from ever seeing it close
        drop(stage2_socket);

        let stage1_status = stage1.wait()?;
        if !stage1_status.success() {
            return Err(RuntimeError::SetupFailed {
                status_sum: stage1_status.code().unwrap_or(1),
            });
        }

        if spec.instance {
            // The detached supervisor owns the instance from here
            log::info!("instance started, pid {}", stage2.id());
            return Ok(0);
        }

        // Closure of the stage 2 end means a successful exec; any data
        // first means the setup failed before exec
        let mut marker = [0u8; 1];
        let mut monitor = monitor_socket;
        if monitor.read(&mut marker)? > 0 {
            let status = stage2.wait()?;
            return Err(RuntimeError::SetupFailed {
                status_sum: status.code().unwrap_or(1),
            });
        }

        supervisor::run(SupervisorParams {
            container_pid: stage2.id() as libc::pid_t,
            config_socket: monitor,
            engine_name: spec.engine.clone(),
            config: local_config(spec),
        })
    }
}

/// Minimal configuration for supervisor-side cleanup when the full
/// stage 1 output is not on hand
fn local_config(spec: EngineSpec) -> LaunchConfig {
    LaunchConfig {
        version: CONFIG_VERSION,
        ns_flags: spec.namespaces.flags(),
        uid_map: Vec::new(),
        gid_map: Vec::new(),
        key: None,
        spec,
    }
}

/// Entry point of the re-executed stage 1 process: the engine spec
/// arrives chunked in the environment, the socket as an inherited
/// descriptor named on argv
pub fn stage1_main(config_fd: RawFd) -> Result<(), RuntimeError> {
    let spec_json = envchunk::from_env(ENV_SPEC_PREFIX)?;
    let spec: EngineSpec = serde_json::from_slice(&spec_json)?;
    crate::runtime::stage1::main(config_fd, spec)
}

/// Entry point of the re-executed privileged stage 2 process (the final
/// role): read the configuration, create the namespaces, fork the two
/// setup-role children, wait for both, then exec the payload or hand
/// off to a detached supervisor.
pub fn stage2_main(config_fd: RawFd) -> Result<(), RuntimeError> {
    use std::os::unix::io::FromRawFd;
    let mut config_socket = unsafe { UnixStream::from_raw_fd(config_fd) };
    let config = LaunchConfig::read_from(&mut config_socket)?;
    let namespaces = config.namespaces();

    if unsafe { libc::unshare(namespaces.clone_flags()) } != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    if namespaces.user {
        write_id_maps(&config)?;
    }

    let (client_socket, server_socket) = fd_queue::UnixStream::pair()?;

    // Setup-role child one: the privileged RPC server, inside the new
    // namespaces so its mounts land in the container's mount tree
    let server_pid = unsafe { libc::fork() };
    if server_pid == 0 {
        drop(client_socket);
        let code = match RpcServer::new(server_socket).serve() {
            Ok(()) => exit::EXIT_OK,
            Err(err) => {
                log::error!("rpc server failed: {}", err);
                exit::EXIT_IO_ERROR
            }
        };
        unsafe { libc::_exit(code) };
    }

    // Setup-role child two: the client driving the mount sequence
    let client_pid = unsafe { libc::fork() };
    if client_pid == 0 {
        drop(server_socket);
        let mut client = RpcClient::new(client_socket);
        let code = match stage2::run_setup(&mut client, &config, &Default::default()) {
            Ok(()) => exit::EXIT_OK,
            Err(err) => {
                log::error!("container setup failed: {}", err);
                exit::EXIT_SETUP_FAILED
            }
        };
        unsafe { libc::_exit(code) };
    }

    // The parent must not keep either socket end alive, or the server
    // would never observe the client closing
    drop(client_socket);
    drop(server_socket);

    let finished = stage2::run_final(&[server_pid, client_pid], config_socket.as_raw_fd());
    if let Err(err) = finished {
        // EOF-with-data tells the monitor this was a failure, not an exec
        let _ = config_socket.write(&[1]);
        return Err(err);
    }

    if config.spec.instance {
        instance_handoff(&config, config_socket)
    } else {
        stage2::exec_payload(&config).map(|_| ())
    }
}

/// Identity uid/gid mappings written after unshare when a user namespace
/// is active
fn write_id_maps(config: &LaunchConfig) -> Result<(), RuntimeError> {
    std::fs::write("/proc/self/setgroups", b"deny")?;
    let format_maps = |maps: &[crate::runtime::IdMap]| {
        maps.iter()
            .map(|map| format!("{} {} {}\n", map.container_id, map.host_id, map.size))
            .collect::<String>()
    };
    std::fs::write("/proc/self/uid_map", format_maps(&config.uid_map))?;
    std::fs::write("/proc/self/gid_map", format_maps(&config.gid_map))?;
    Ok(())
}

/// Instance mode: fork the payload, then turn this process into the
/// detached supervisor via setsid and re-exec, with the configuration
/// chunked into the environment
fn instance_handoff(config: &LaunchConfig, config_socket: UnixStream) -> Result<(), RuntimeError> {
    let payload_pid = unsafe { libc::fork() };
    if payload_pid == 0 {
        let _ = stage2::exec_payload(config);
        unsafe { libc::_exit(exit::EXIT_SETUP_FAILED) };
    }

    unsafe { libc::setsid() };
    // The supervisor inherits the socket across exec for its watcher
    clear_close_on_exec(config_socket.as_raw_fd())?;

    let mut supervisor = Command::new(SELF_EXE);
    supervisor
        .arg0("sifbox-supervisor")
        .arg("supervisor")
        .env(ENV_CONTAINER_PID, payload_pid.to_string())
        .env(ENV_SOCKET, config_socket.as_raw_fd().to_string())
        .env(ENV_RUNTIME, &config.spec.engine)
        .envs(envchunk::to_env(ENV_CONFIG_PREFIX, &config.encode()?)?);
    Err(supervisor.exec().into())
}

fn clear_close_on_exec(fd: RawFd) -> Result<(), RuntimeError> {
    update_fd_flags(fd, |flags| flags & !libc::FD_CLOEXEC)
}

fn set_close_on_exec(fd: RawFd) -> Result<(), RuntimeError> {
    update_fd_flags(fd, |flags| flags | libc::FD_CLOEXEC)
}

fn update_fd_flags<F: Fn(libc::c_int) -> libc::c_int>(
    fd: RawFd,
    update: F,
) -> Result<(), RuntimeError> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFD, update(flags)) } < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
}
