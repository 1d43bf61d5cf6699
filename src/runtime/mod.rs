//! Privilege-separated launch engine
//!
//! A launch is a fixed sequence of cooperating processes: an unprivileged
//! setup phase that computes the launch configuration, a privileged phase
//! that builds the mount namespace through a narrow RPC protocol, and a
//! long-lived supervisor that reaps the container and cleans up.

pub mod envchunk;
pub mod launcher;
pub mod rpc;
pub mod stage1;
pub mod stage2;
pub mod supervisor;

use crate::errors::RuntimeError;
use std::{
    io::{Read, Write},
    path::PathBuf,
};

/// Version tag carried by every serialized launch configuration
pub const CONFIG_VERSION: u32 = 1;

/// Where the privileged phase assembles the container root
pub const SESSION_DIR: &str = "/var/run/sifbox/session";
pub const ASSEMBLY_DIR: &str = "/var/run/sifbox/session/assembly";
pub const STAGING_DIR: &str = "/var/run/sifbox/session/root";

/// Environment consumed by the supervisor process
pub const ENV_CONTAINER_PID: &str = "SMASTER_CONTAINER_PID";
pub const ENV_SOCKET: &str = "SMASTER_SOCKET";
pub const ENV_RUNTIME: &str = "SRUNTIME";

/// Prefix for the chunked configuration fallback transport
pub const ENV_CONFIG_PREFIX: &str = "SMASTER_CONFIG";

/// Which kernel namespaces a launch requests
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Namespaces {
    pub user: bool,
    pub ipc: bool,
    pub uts: bool,
    pub pid: bool,
    pub net: bool,
    pub mount: bool,
}

pub mod nsflags {
    pub const USER: u32 = 1 << 0;
    pub const IPC: u32 = 1 << 1;
    pub const UTS: u32 = 1 << 2;
    pub const PID: u32 = 1 << 3;
    pub const NET: u32 = 1 << 4;
    pub const MOUNT: u32 = 1 << 5;
}

impl Namespaces {
    pub fn flags(&self) -> u32 {
        let mut flags = 0;
        if self.user {
            flags |= nsflags::USER;
        }
        if self.ipc {
            flags |= nsflags::IPC;
        }
        if self.uts {
            flags |= nsflags::UTS;
        }
        if self.pid {
            flags |= nsflags::PID;
        }
        if self.net {
            flags |= nsflags::NET;
        }
        if self.mount {
            flags |= nsflags::MOUNT;
        }
        flags
    }

    pub fn from_flags(flags: u32) -> Namespaces {
        Namespaces {
            user: flags & nsflags::USER != 0,
            ipc: flags & nsflags::IPC != 0,
            uts: flags & nsflags::UTS != 0,
            pid: flags & nsflags::PID != 0,
            net: flags & nsflags::NET != 0,
            mount: flags & nsflags::MOUNT != 0,
        }
    }

    /// Translate to the clone/unshare flag bits
    pub fn clone_flags(&self) -> libc::c_int {
        let mut flags = 0;
        if self.user {
            flags |= libc::CLONE_NEWUSER;
        }
        if self.ipc {
            flags |= libc::CLONE_NEWIPC;
        }
        if self.uts {
            flags |= libc::CLONE_NEWUTS;
        }
        if self.pid {
            flags |= libc::CLONE_NEWPID;
        }
        if self.net {
            flags |= libc::CLONE_NEWNET;
        }
        if self.mount {
            flags |= libc::CLONE_NEWNS;
        }
        flags
    }
}

/// One bind mount requested for the container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindPath {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub read_only: bool,
}

/// The contained process to run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessSpec {
    pub args: Vec<String>,
    pub env: Vec<String>,
    pub cwd: String,
}

/// Describes one launch. Constructed once per invocation, immutable for
/// the life of the container process tree, and serialized across the
/// privilege boundary exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineSpec {
    pub engine: String,
    pub image: PathBuf,
    pub root: PathBuf,
    pub writable: bool,
    pub overlay: Option<PathBuf>,
    pub binds: Vec<BindPath>,
    pub namespaces: Namespaces,
    pub process: ProcessSpec,
    pub home: PathBuf,
    pub instance: bool,
    pub key_uri: Option<String>,
}

/// One uid or gid range mapping for a user namespace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdMap {
    pub container_id: u32,
    pub host_id: u32,
    pub size: u32,
}

/// The full low-level configuration handed across the privilege
/// boundary, as an explicit versioned serialization rather than a raw
/// struct copy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchConfig {
    pub version: u32,
    pub ns_flags: u32,
    pub uid_map: Vec<IdMap>,
    pub gid_map: Vec<IdMap>,
    pub key: Option<Vec<u8>>,
    pub spec: EngineSpec,
}

impl LaunchConfig {
    /// Length-prefixed write onto a connected socket
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<(), RuntimeError> {
        let encoded = serde_json::to_vec(self)?;
        writer.write_all(&(encoded.len() as u32).to_le_bytes())?;
        writer.write_all(&encoded)?;
        writer.flush()?;
        Ok(())
    }

    /// Counterpart of `write_to`, validating the configuration version
    pub fn read_from<R: Read>(reader: &mut R) -> Result<LaunchConfig, RuntimeError> {
        let mut len_bytes = [0u8; 4];
        reader.read_exact(&mut len_bytes)?;
        let mut encoded = vec![0u8; u32::from_le_bytes(len_bytes) as usize];
        reader.read_exact(&mut encoded)?;
        LaunchConfig::decode(&encoded)
    }

    pub fn encode(&self) -> Result<Vec<u8>, RuntimeError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(encoded: &[u8]) -> Result<LaunchConfig, RuntimeError> {
        let config: LaunchConfig = serde_json::from_slice(encoded)?;
        if config.version != CONFIG_VERSION {
            return Err(RuntimeError::ConfigVersion {
                found: config.version,
                expected: CONFIG_VERSION,
            });
        }
        Ok(config)
    }

    pub fn namespaces(&self) -> Namespaces {
        Namespaces::from_flags(self.ns_flags)
    }
}

/// A runtime engine implementation the supervisor can instantiate by name
pub trait RuntimeEngine {
    fn name(&self) -> &'static str;

    /// Best-effort teardown after the container exits. Failures here are
    /// logged by the supervisor and never promoted to the exit code.
    fn cleanup(&self, config: &LaunchConfig) -> Result<(), RuntimeError>;
}

/// The engine that launches SIF images
pub struct SifEngine;

impl RuntimeEngine for SifEngine {
    fn name(&self) -> &'static str {
        "sif"
    }

    fn cleanup(&self, _config: &LaunchConfig) -> Result<(), RuntimeError> {
        for target in [STAGING_DIR, ASSEMBLY_DIR] {
            let path = std::ffi::CString::new(target)?;
            if unsafe { libc::umount2(path.as_ptr(), libc::MNT_DETACH) } != 0 {
                let err = std::io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::EINVAL) {
                    log::warn!("cleanup unmount of {} failed: {}", target, err);
                }
            }
        }
        if let Err(err) = std::fs::remove_dir_all(SESSION_DIR) {
            log::warn!("cleanup of {} failed: {}", SESSION_DIR, err);
        }
        Ok(())
    }
}

pub fn engine_by_name(name: &str) -> Result<Box<dyn RuntimeEngine + Send + Sync>, RuntimeError> {
    match name {
        "sif" => Ok(Box::new(SifEngine)),
        other => Err(RuntimeError::UnknownEngine(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_spec() -> EngineSpec {
        EngineSpec {
            engine: "sif".to_string(),
            image: PathBuf::from("/images/app.sif"),
            root: PathBuf::from("/images/app.sif"),
            writable: false,
            overlay: None,
            binds: vec![BindPath {
                source: PathBuf::from("/data"),
                destination: PathBuf::from("/data"),
                read_only: true,
            }],
            namespaces: Namespaces {
                pid: true,
                mount: true,
                ..Default::default()
            },
            process: ProcessSpec {
                args: vec!["/bin/sh".to_string()],
                env: vec!["PATH=/bin".to_string()],
                cwd: "/".to_string(),
            },
            home: PathBuf::from("/home/user"),
            instance: false,
            key_uri: None,
        }
    }

    #[test]
    fn namespace_flag_round_trip() {
        let namespaces = Namespaces {
            user: true,
            pid: true,
            mount: true,
            ..Default::default()
        };
        assert_eq!(Namespaces::from_flags(namespaces.flags()), namespaces);
        assert_eq!(
            namespaces.clone_flags(),
            libc::CLONE_NEWUSER | libc::CLONE_NEWPID | libc::CLONE_NEWNS
        );
    }

    #[test]
    fn config_socket_round_trip() {
        let config = LaunchConfig {
            version: CONFIG_VERSION,
            ns_flags: nsflags::PID | nsflags::MOUNT,
            uid_map: vec![IdMap {
                container_id: 0,
                host_id: 1000,
                size: 1,
            }],
            gid_map: vec![IdMap {
                container_id: 0,
                host_id: 1000,
                size: 1,
            }],
            key: None,
            spec: sample_spec(),
        };
        let mut wire = Vec::new();
        config.write_to(&mut wire).unwrap();
        let read_back = LaunchConfig::read_from(&mut &wire[..]).unwrap();
        assert_eq!(read_back, config);
    }

    #[test]
    fn wrong_config_version_is_refused() {
        let mut config = LaunchConfig {
            version: CONFIG_VERSION + 1,
            ns_flags: 0,
            uid_map: Vec::new(),
            gid_map: Vec::new(),
            key: None,
            spec: sample_spec(),
        };
        config.spec.instance = true;
        let encoded = serde_json::to_vec(&config).unwrap();
        assert!(matches!(
            LaunchConfig::decode(&encoded),
            Err(RuntimeError::ConfigVersion { .. })
        ));
    }

    #[test]
    fn unknown_engine_is_refused() {
        assert!(engine_by_name("sif").is_ok());
        assert!(matches!(
            engine_by_name("warp"),
            Err(RuntimeError::UnknownEngine(_))
        ));
    }
}
