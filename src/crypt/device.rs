//! LUKS2 device management through the external cryptsetup tool
//!
//! The key always travels over a stdin pipe, never argv or the
//! environment. Concurrent encrypt operations are serialized by an
//! exclusive advisory lock on the mapper directory, and mapper names are
//! randomized with a small retry bound for collisions.

use crate::{
    crypt::loopdev,
    errors::CryptError,
};
use regex::Regex;
use sifbox_protocol::{loop_flags, LoopInfo64};
use std::{
    fs,
    fs::{File, OpenOptions},
    io,
    io::Write,
    os::unix::io::AsRawFd,
    path::{Path, PathBuf},
    process::{Command, Stdio},
};

/// Fixed allowance for the LUKS2 header, comfortably above the overhead
/// observed with current format defaults
pub const HEADER_SLACK: u64 = 16 * 1024 * 1024;

const CRYPTSETUP: &str = "cryptsetup";
const MAPPER_DIR: &str = "/dev/mapper";
const NAME_RETRIES: usize = 3;

/// An open device-mapper crypt device
#[derive(Debug)]
pub struct CryptDevice {
    pub name: String,
}

impl CryptDevice {
    pub fn path(&self) -> PathBuf {
        Path::new(MAPPER_DIR).join(&self.name)
    }
}

/// Exclusive advisory lock on the mapper directory, held across
/// format/open/close so concurrent encrypt operations cannot race on a
/// device name. Released on drop.
struct MapperLock {
    dir: File,
}

impl MapperLock {
    fn acquire() -> Result<MapperLock, CryptError> {
        let dir = File::open(MAPPER_DIR)?;
        if unsafe { libc::flock(dir.as_raw_fd(), libc::LOCK_EX) } != 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(MapperLock { dir })
    }
}

impl Drop for MapperLock {
    fn drop(&mut self) {
        unsafe { libc::flock(self.dir.as_raw_fd(), libc::LOCK_UN) };
    }
}

/// Report the installed cryptsetup version, distinguishing "not
/// installed" from every other failure
pub fn tool_version() -> Result<(u32, u32, u32), CryptError> {
    let output = match Command::new(CRYPTSETUP).arg("--version").output() {
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Err(CryptError::ToolMissing),
        Err(err) => return Err(err.into()),
        Ok(output) => output,
    };
    let stdout = String::from_utf8_lossy(&output.stdout);
    parse_version(&stdout).ok_or_else(|| CryptError::UnsupportedToolVersion {
        found: stdout.trim().to_string(),
    })
}

fn parse_version(stdout: &str) -> Option<(u32, u32, u32)> {
    lazy_static! {
        static ref RE: Regex = Regex::new(r"cryptsetup (\d+)\.(\d+)(?:\.(\d+))?").unwrap();
    }
    let captures = RE.captures(stdout)?;
    let field = |i| {
        captures
            .get(i)
            .map_or(Some(0), |m| m.as_str().parse().ok())
    };
    Some((field(1)?, field(2)?, field(3)?))
}

/// LUKS2 needs cryptsetup 2.0 or newer; an older tool is a distinct,
/// user-actionable condition rather than a generic failure
fn check_tool() -> Result<(), CryptError> {
    let (major, minor, patch) = tool_version()?;
    if major < 2 {
        return Err(CryptError::UnsupportedToolVersion {
            found: format!("{}.{}.{}", major, minor, patch),
        });
    }
    Ok(())
}

/// Run cryptsetup with the key piped to stdin
fn run_with_key(args: &[&str], key: &[u8]) -> Result<(), CryptError> {
    let mut child = Command::new(CRYPTSETUP)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|err| match err.kind() {
            io::ErrorKind::NotFound => CryptError::ToolMissing,
            _ => CryptError::Io(err),
        })?;

    child
        .stdin
        .take()
        .expect("cryptsetup stdin is piped")
        .write_all(key)?;

    let output = child.wait_with_output()?;
    if output.status.success() {
        return Ok(());
    }
    let status = output.status.code().unwrap_or(-1);
    // cryptsetup exits 2 when no key slot matches the passphrase
    if status == 2 {
        return Err(CryptError::NoKeyAvailable);
    }
    Err(CryptError::ToolFailed {
        status,
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    })
}

/// Initialize a LUKS2 header on a block device
pub fn format(device: &Path, key: &[u8]) -> Result<(), CryptError> {
    check_tool()?;
    let device = device.to_string_lossy();
    run_with_key(
        &[
            "luksFormat",
            "--batch-mode",
            "--type",
            "luks2",
            "--key-file",
            "-",
            &device,
        ],
        key,
    )
}

/// Open a formatted device under a fresh randomized mapper name
pub fn open(device: &Path, key: &[u8]) -> Result<CryptDevice, CryptError> {
    check_tool()?;
    let device = device.to_string_lossy();
    for attempt in 0..NAME_RETRIES {
        let name = format!("sifbox_crypt_{:08x}", rand::random::<u32>());
        if Path::new(MAPPER_DIR).join(&name).exists() {
            log::debug!("mapper name {} taken, retry {}", name, attempt + 1);
            continue;
        }
        match run_with_key(&["open", "--type", "luks", "--key-file", "-", &device, &name], key) {
            Ok(()) => return Ok(CryptDevice { name }),
            // A racing open can still claim the name between the
            // existence check and the open call
            Err(CryptError::ToolFailed { status: 5, .. }) => continue,
            Err(err) => return Err(err),
        }
    }
    Err(CryptError::NameCollision(NAME_RETRIES))
}

/// Close an open crypt device
pub fn close(device: CryptDevice) -> Result<(), CryptError> {
    let output = Command::new(CRYPTSETUP)
        .args(&["close", &device.name])
        .output()?;
    if output.status.success() {
        Ok(())
    } else {
        Err(CryptError::ToolFailed {
            status: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

/// Turn an already-built plaintext filesystem image into an encrypted
/// block image.
///
/// The result is a new temporary file holding a LUKS2 container whose
/// payload is a byte copy of `plain`. The caller owns the returned path
/// and is responsible for deleting it.
pub fn encrypt_filesystem(plain: &Path, key: &[u8]) -> Result<PathBuf, CryptError> {
    let plain_len = fs::metadata(plain)?.len();

    let container_path = plain.with_extension(format!(
        "enc-{}-{:x}",
        std::process::id(),
        rand::random::<u64>()
    ));
    let container = OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .open(&container_path)?;
    container.set_len(plain_len + HEADER_SLACK)?;

    let result = fill_container(&container, plain, key);
    if let Err(err) = result {
        let _ = fs::remove_file(&container_path);
        return Err(err);
    }
    Ok(container_path)
}

fn fill_container(container: &File, plain: &Path, key: &[u8]) -> Result<(), CryptError> {
    let device = loopdev::attach(
        container,
        &LoopInfo64 {
            offset: 0,
            sizelimit: 0,
            flags: loop_flags::AUTOCLEAR,
        },
    )?;

    let _lock = MapperLock::acquire()?;
    format(&device.path, key)?;
    let mapper = open(&device.path, key)?;

    let copied = (|| -> Result<(), CryptError> {
        let mut src = File::open(plain)?;
        let mut dst = OpenOptions::new().write(true).open(mapper.path())?;
        io::copy(&mut src, &mut dst)?;
        dst.sync_all()?;
        Ok(())
    })();

    // Close even when the copy failed; a stale mapper entry would block
    // the next attempt
    let closed = close(mapper);
    copied?;
    closed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_lines() {
        assert_eq!(parse_version("cryptsetup 2.3.4"), Some((2, 3, 4)));
        assert_eq!(parse_version("cryptsetup 2.0"), Some((2, 0, 0)));
        assert_eq!(
            parse_version("cryptsetup 1.7.5 flags: UDEV"),
            Some((1, 7, 5))
        );
        assert_eq!(parse_version("something else"), None);
    }

    #[test]
    fn mapper_path() {
        let device = CryptDevice {
            name: "sifbox_crypt_00c0ffee".to_string(),
        };
        assert_eq!(
            device.path(),
            PathBuf::from("/dev/mapper/sifbox_crypt_00c0ffee")
        );
    }
}
