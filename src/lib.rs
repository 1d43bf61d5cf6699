#[cfg(not(any(target_os = "linux", target_os = "android")))]
compile_error!("sifbox only works on linux or android");

#[macro_use] extern crate lazy_static;
#[macro_use] extern crate serde;

pub mod crypt;
pub mod errors;
pub mod runtime;
pub mod sif;

pub use crate::{
    errors::{CryptError, RuntimeError, SifError},
    sif::SifFile,
};
pub use sifbox_protocol as protocol;
