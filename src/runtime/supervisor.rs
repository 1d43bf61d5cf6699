//! Phase 3: the long-lived supervisor
//!
//! Holds a reference to the container's network namespace for later
//! teardown, reaps the container's top-level pid, and in instance mode
//! watches the configuration socket so an external controller can take
//! over the detached instance.

use crate::{
    errors::RuntimeError,
    runtime::{
        engine_by_name, envchunk, LaunchConfig, ENV_CONFIG_PREFIX, ENV_CONTAINER_PID, ENV_RUNTIME,
        ENV_SOCKET,
    },
};
use std::{
    fs::File,
    io::Read,
    os::unix::{io::FromRawFd, net::UnixStream},
    time::Duration,
};
use tokio::{task, time};

/// Delay between the configuration socket waking the watcher and the
/// supervisor stopping itself for the controller
const STOP_GRACE: Duration = Duration::from_millis(500);

pub struct SupervisorParams {
    pub container_pid: libc::pid_t,
    pub config_socket: UnixStream,
    pub engine_name: String,
    pub config: LaunchConfig,
}

/// Entry point when re-executed as the detached instance supervisor;
/// everything arrives through the environment
pub fn run_from_env() -> Result<i32, RuntimeError> {
    let container_pid: libc::pid_t = std::env::var(ENV_CONTAINER_PID)
        .ok()
        .and_then(|value| value.parse().ok())
        .ok_or(RuntimeError::BadEnvironment(ENV_CONTAINER_PID))?;
    let socket_fd: i32 = std::env::var(ENV_SOCKET)
        .ok()
        .and_then(|value| value.parse().ok())
        .ok_or(RuntimeError::BadEnvironment(ENV_SOCKET))?;
    let engine_name =
        std::env::var(ENV_RUNTIME).map_err(|_| RuntimeError::BadEnvironment(ENV_RUNTIME))?;

    let config = LaunchConfig::decode(&envchunk::from_env(ENV_CONFIG_PREFIX)?)?;
    let config_socket = unsafe { UnixStream::from_raw_fd(socket_fd) };

    run(SupervisorParams {
        container_pid,
        config_socket,
        engine_name,
        config,
    })
}

/// Supervise one container until it exits, then clean up and return its
/// exit status. Cleanup failures are logged, never promoted.
pub fn run(params: SupervisorParams) -> Result<i32, RuntimeError> {
    let engine = engine_by_name(&params.engine_name)?;

    // Keep the network namespace pinned while the container runs, so
    // teardown can still reach it after the last process exits
    let netns = File::open(format!("/proc/{}/ns/net", params.container_pid));
    if let Err(err) = &netns {
        log::debug!("network namespace not available: {}", err);
    }

    let mut runtime = tokio::runtime::Runtime::new()?;
    let status = runtime.block_on(async {
        if params.config.spec.instance {
            spawn_instance_watcher(params.config_socket.try_clone()?);
        }

        let pid = params.container_pid;
        let status = task::spawn_blocking(move || reap(pid)).await?;
        Ok::<i32, RuntimeError>(status)
    })?;

    if let Err(err) = engine.cleanup(&params.config) {
        log::warn!("engine cleanup failed: {}", err);
    }
    drop(netns);
    log::debug!("container exited with status {}", status);
    Ok(status)
}

/// Blocking per-pid wait, restarted across signal interruptions. The
/// container's own status is always what the supervisor propagates.
fn reap(pid: libc::pid_t) -> i32 {
    let mut status: libc::c_int = 0;
    loop {
        let result = unsafe { libc::waitpid(pid, &mut status, 0) };
        if result >= 0 {
            break;
        }
        let err = std::io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINTR) => continue,
            _ => {
                log::warn!("waitpid({}) failed: {}", pid, err);
                return 1;
            }
        }
    }
    if libc::WIFEXITED(status) {
        libc::WEXITSTATUS(status)
    } else if libc::WIFSIGNALED(status) {
        128 + libc::WTERMSIG(status)
    } else {
        1
    }
}

/// Instance mode: block on the configuration socket until it closes or
/// produces data, then stop this process after a short grace delay so an
/// external controller can resume and signal it later
fn spawn_instance_watcher(socket: UnixStream) {
    task::spawn(async move {
        let _ = task::spawn_blocking(move || {
            let mut socket = socket;
            let mut byte = [0u8; 1];
            let _ = socket.read(&mut byte);
        })
        .await;
        time::delay_for(STOP_GRACE).await;
        log::debug!("instance detached, stopping for the controller");
        unsafe { libc::kill(libc::getpid(), libc::SIGSTOP) };
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{EngineSpec, Namespaces, ProcessSpec, CONFIG_VERSION};
    use std::path::PathBuf;

    fn sample_config() -> LaunchConfig {
        LaunchConfig {
            version: CONFIG_VERSION,
            ns_flags: 0,
            uid_map: Vec::new(),
            gid_map: Vec::new(),
            key: None,
            spec: EngineSpec {
                engine: "sif".to_string(),
                image: PathBuf::from("/images/app.sif"),
                root: PathBuf::from("/images/app.sif"),
                writable: false,
                overlay: None,
                binds: Vec::new(),
                namespaces: Namespaces::default(),
                process: ProcessSpec::default(),
                home: PathBuf::from("/root"),
                instance: false,
                key_uri: None,
            },
        }
    }

    #[test]
    fn supervisor_propagates_the_container_status() {
        let child = unsafe { libc::fork() };
        if child == 0 {
            unsafe { libc::_exit(42) };
        }
        let (socket, _peer) = UnixStream::pair().unwrap();
        let status = run(SupervisorParams {
            container_pid: child,
            config_socket: socket,
            engine_name: "sif".to_string(),
            config: sample_config(),
        })
        .unwrap();
        assert_eq!(status, 42);
    }

    #[test]
    fn signal_death_maps_above_128() {
        let child = unsafe { libc::fork() };
        if child == 0 {
            unsafe {
                libc::kill(libc::getpid(), libc::SIGKILL);
                libc::_exit(0)
            };
        }
        assert_eq!(reap(child), 128 + libc::SIGKILL);
    }
}
