//! Encryption and loop-device layer
//!
//! Builds encrypted, loop-backed block devices holding already-built
//! filesystem images, and derives or unwraps the symmetric keys that
//! protect them.

pub mod device;
pub mod key;
pub mod loopdev;

pub use device::{encrypt_filesystem, CryptDevice, HEADER_SLACK};
pub use key::{new_key, parse_uri, KeySource, PlaintextKey};
pub use loopdev::LoopDevice;
