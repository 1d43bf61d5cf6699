use crate::types::*;

/// One privileged operation requested by the setup role.
///
/// Calls are strictly synchronous: the client sends one `MountCall` and
/// blocks until the matching `MountReply` arrives. There is no pipelining,
/// which is what makes the mount sequence safe to reason about.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub enum MountCall {
    Mount {
        source: Option<String>,
        target: String,
        fstype: Option<String>,
        flags: u64,
        data: Option<String>,
    },
    Mkdir {
        path: String,
        mode: u32,
    },
    Chroot {
        root: String,
    },
    LoopDevice {
        image: SysFd,
        read_only: bool,
        info: LoopInfo64,
    },
}

/// The single reply produced for each `MountCall`
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub enum MountReply {
    Status(Result<(), Errno>),
    LoopAttached(Result<u32, Errno>),
}
