//! Phase 1: unprivileged launch setup
//!
//! Parses the namespace requirements out of the engine spec, populates
//! the initial uid/gid mapping, derives key material when the image is
//! encrypted, and hands the resulting configuration to the privileged
//! phase over an already-connected socket.

use crate::{
    crypt,
    errors::RuntimeError,
    runtime::{EngineSpec, IdMap, LaunchConfig, CONFIG_VERSION},
};
use std::{io::Write, os::unix::net::UnixStream};

/// Compute the full launch configuration for a spec
pub fn prepare_config(spec: EngineSpec) -> Result<LaunchConfig, RuntimeError> {
    let ns_flags = spec.namespaces.flags();

    // Identity mapping of the invoking user; a custom mapping would be
    // spliced in here when a user namespace requests one
    let uid = unsafe { libc::getuid() };
    let gid = unsafe { libc::getgid() };
    let uid_map = vec![IdMap {
        container_id: uid,
        host_id: uid,
        size: 1,
    }];
    let gid_map = vec![IdMap {
        container_id: gid,
        host_id: gid,
        size: 1,
    }];

    let key = match &spec.key_uri {
        None => None,
        Some(uri) => {
            let source = crypt::parse_uri(uri)?;
            Some(crypt::new_key(&source)?.bytes)
        }
    };

    Ok(LaunchConfig {
        version: CONFIG_VERSION,
        ns_flags,
        uid_map,
        gid_map,
        key,
        spec,
    })
}

/// Run the whole phase: build the configuration and send it,
/// length-prefixed, to the privileged phase
pub fn run<W: Write>(config_socket: &mut W, spec: EngineSpec) -> Result<(), RuntimeError> {
    let config = prepare_config(spec)?;
    log::debug!("stage1 sending configuration, ns_flags={:#x}", config.ns_flags);
    config.write_to(config_socket)
}

/// Entry point when re-executed as the stage 1 process: the engine spec
/// arrives chunked in the environment, the socket as an inherited
/// descriptor
pub fn main(config_fd: i32, spec: EngineSpec) -> Result<(), RuntimeError> {
    use std::os::unix::io::FromRawFd;
    let mut socket = unsafe { UnixStream::from_raw_fd(config_fd) };
    run(&mut socket, spec)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{Namespaces, ProcessSpec};
    use std::path::PathBuf;

    fn sample_spec() -> EngineSpec {
        EngineSpec {
            engine: "sif".to_string(),
            image: PathBuf::from("/images/app.sif"),
            root: PathBuf::from("/images/app.sif"),
            writable: false,
            overlay: None,
            binds: Vec::new(),
            namespaces: Namespaces {
                pid: true,
                mount: true,
                ..Default::default()
            },
            process: ProcessSpec::default(),
            home: PathBuf::from("/root"),
            instance: false,
            key_uri: None,
        }
    }

    #[test]
    fn identity_mapping_of_the_invoking_user() {
        let config = prepare_config(sample_spec()).unwrap();
        let uid = unsafe { libc::getuid() };
        assert_eq!(config.uid_map.len(), 1);
        assert_eq!(config.uid_map[0].container_id, uid);
        assert_eq!(config.uid_map[0].host_id, uid);
        assert_eq!(config.uid_map[0].size, 1);
        assert!(config.key.is_none());
    }

    #[test]
    fn passthrough_key_uri_lands_in_the_config() {
        let mut spec = sample_spec();
        spec.key_uri = Some("hunter2".to_string());
        let config = prepare_config(spec).unwrap();
        assert_eq!(config.key.as_deref(), Some(&b"hunter2"[..]));
    }

    #[test]
    fn config_crosses_a_socket_pair() {
        let (mut sender, receiver) = UnixStream::pair().unwrap();
        run(&mut sender, sample_spec()).unwrap();
        drop(sender);
        let mut receiver = receiver;
        let config = LaunchConfig::read_from(&mut receiver).unwrap();
        assert_eq!(config.version, CONFIG_VERSION);
        assert_eq!(config.spec, sample_spec());
    }
}
