#[cfg(not(any(target_os = "linux", target_os = "android")))]
compile_error!("sifbox only works on linux or android");

#[macro_use] extern crate serde;


pub mod buffer;
pub mod de;
pub mod ser;

mod messages;
mod types;

pub use messages::*;
pub use types::*;
