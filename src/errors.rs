//! Error types you might see while building images or launching containers

use sifbox_protocol::Errno;
use thiserror::Error;

/// Errors from the SIF image format engine
#[derive(Error, Debug)]
pub enum SifError {
    /// io error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// not a SIF file
    #[error("not a SIF file (bad magic)")]
    BadMagic,

    /// image version is newer than this build supports
    #[error("unsupported SIF version {found:?}")]
    UnsupportedVersion { found: String },

    /// image is truncated or a descriptor points outside the file
    #[error("object data lies outside the image file")]
    Truncated,

    /// more than one primary system partition found
    #[error("more than one primary system partition")]
    DuplicatePrimary,

    /// the image has no primary system partition
    #[error("image has no primary system partition")]
    NoPrimaryPartition,

    /// no descriptor matched the lookup
    #[error("no descriptor matched")]
    NotFound,

    /// a unique lookup matched more than one descriptor
    #[error("lookup expected a unique match but found several")]
    MultipleMatches,

    /// all descriptor slots are in use
    #[error("no free descriptor slot in the image")]
    NoFreeDescriptor,

    /// streamed object did not match its declared size
    #[error("declared object size {expected} but wrote {actual} bytes")]
    SizeMismatch { expected: i64, actual: i64 },

    /// descriptor name does not fit the fixed-size name field
    #[error("descriptor name longer than {0} bytes")]
    NameTooLong(usize),

    /// type-specific payload does not fit the fixed-size extra field
    #[error("extra payload longer than {0} bytes")]
    ExtraTooLong(usize),

    /// a descriptor field holds a value outside its enum range
    #[error("invalid value {value} for descriptor field {field}")]
    InvalidField { field: &'static str, value: i64 },

    /// operation needs a writable image but it was opened read-only
    #[error("image is opened read-only")]
    ReadOnly,

    /// the requested architecture name is not known
    #[error("unknown architecture name {0:?}")]
    UnknownArchitecture(String),
}

/// Errors from the encryption and loop-device layer
#[derive(Error, Debug)]
pub enum CryptError {
    /// io error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// key URI names a scheme this build does not understand
    #[error("unsupported key URI scheme {0:?}")]
    UnsupportedKeyUri(String),

    /// rsa key wrap or unwrap failed
    #[error("rsa error: {0}")]
    Rsa(#[from] rsa::Error),

    /// referenced PEM file could not be parsed as a key
    #[error("pem key parse error: {0}")]
    PemKey(String),

    /// wrapped key message block is not valid PEM
    #[error("pem message parse error: {0}")]
    PemMessage(#[from] pem::PemError),

    /// the external crypt tool is not installed
    #[error("crypt tool not found; install cryptsetup >= 2.0")]
    ToolMissing,

    /// the external crypt tool is too old to handle LUKS2
    #[error("incompatible cryptsetup version {found:?}, need >= 2.0")]
    UnsupportedToolVersion { found: String },

    /// generic external tool failure
    #[error("cryptsetup failed with {status}: {stderr}")]
    ToolFailed { status: i32, stderr: String },

    /// the supplied key does not open the device
    #[error("no key available with this passphrase")]
    NoKeyAvailable,

    /// could not find an unused device-mapper name
    #[error("crypt device name collisions persisted after {0} attempts")]
    NameCollision(usize),

    /// requested byte range is not contained in the backing file
    #[error("loop range {offset}+{sizelimit} exceeds backing file size {filesize}")]
    LoopRange {
        offset: u64,
        sizelimit: u64,
        filesize: u64,
    },
}

/// Errors that occur while launching or supervising a container
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// io error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// protocol error
    #[error("protocol error: {0}")]
    Protocol(#[from] sifbox_protocol::buffer::Error),

    /// connection lost unexpectedly
    #[error("connection lost unexpectedly")]
    Disconnected,

    /// file queue full error
    #[error("file queue full error")]
    FileQueueFull(#[from] fd_queue::QueueFullError),

    /// container image error
    #[error("container image error: {0}")]
    Sif(#[from] SifError),

    /// encryption layer error
    #[error("encryption error: {0}")]
    Crypt(#[from] CryptError),

    /// launch configuration could not be encoded or decoded
    #[error("launch configuration error: {0}")]
    Config(#[from] serde_json::Error),

    /// launch configuration was produced by an incompatible build
    #[error("launch configuration version {found}, expected {expected}")]
    ConfigVersion { found: u32, expected: u32 },

    /// a privileged operation was refused by the kernel
    #[error("privileged {verb} failed: errno {errno}")]
    Privileged { verb: &'static str, errno: i32 },

    /// the server answered a call with the wrong reply kind
    #[error("unexpected reply to a privileged call")]
    UnexpectedReply,

    /// one of the setup-role processes failed
    #[error("container setup failed (exit status sum {status_sum})")]
    SetupFailed { status_sum: i32 },

    /// no engine implementation registered under this name
    #[error("unknown runtime engine {0:?}")]
    UnknownEngine(String),

    /// a required environment variable is missing or malformed
    #[error("missing or malformed environment variable {0}")]
    BadEnvironment(&'static str),

    /// serialized configuration exceeds what the environment can carry
    #[error("configuration too large for the environment transport")]
    ConfigTooLarge,

    /// argument string contained internal nul byte
    #[error("argument string contained internal nul byte")]
    NulString(#[from] std::ffi::NulError),

    /// the container process has no argv to exec
    #[error("container has no configured entry point")]
    NoEntryPoint,

    /// asynchronous supervisor task failed
    #[error("supervisor task failed: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),
}

impl RuntimeError {
    pub(crate) fn privileged(verb: &'static str, errno: Errno) -> RuntimeError {
        RuntimeError::Privileged {
            verb,
            errno: errno.0,
        }
    }
}
