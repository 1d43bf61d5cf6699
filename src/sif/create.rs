//! Descriptor creation requests and data object placement

use crate::{errors::SifError, sif::layout::*};
use std::{
    fs::File,
    io,
    io::{Read, Seek, SeekFrom, Write},
    path::PathBuf,
};

/// Where the bytes of a new data object come from
pub enum DataSource {
    Bytes(Vec<u8>),
    Reader(Box<dyn Read>),
    File(PathBuf),
}

impl std::fmt::Debug for DataSource {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            DataSource::Bytes(b) => write!(f, "Bytes({} bytes)", b.len()),
            DataSource::Reader(_) => write!(f, "Reader"),
            DataSource::File(p) => write!(f, "File({:?})", p),
        }
    }
}

/// Request to create one descriptor and its data object
///
/// A declared `size` of zero means the length is unknown until the
/// source is drained (for example a stream from stdin); any non-zero
/// size is verified against the bytes actually written.
#[derive(Debug)]
pub struct DescriptorInput {
    pub dtype: Datatype,
    pub source: DataSource,
    pub size: i64,
    pub align: Option<usize>,
    pub name: String,
    pub group: u32,
    pub link: u32,
    pub partition: Option<PartitionExtra>,
    pub signature: Option<SignatureExtra>,
    pub crypto: Option<CryptoExtra>,
}

impl DescriptorInput {
    pub fn new(dtype: Datatype, source: DataSource) -> DescriptorInput {
        let size = match &source {
            DataSource::Bytes(b) => b.len() as i64,
            _ => 0,
        };
        DescriptorInput {
            dtype,
            source,
            size,
            align: None,
            name: String::new(),
            group: UNUSED_GROUP,
            link: UNUSED_LINK,
            partition: None,
            signature: None,
            crypto: None,
        }
    }

    pub fn name(mut self, name: &str) -> DescriptorInput {
        self.name = name.to_string();
        self
    }

    pub fn size(mut self, size: i64) -> DescriptorInput {
        self.size = size;
        self
    }

    pub fn align(mut self, align: usize) -> DescriptorInput {
        self.align = Some(align);
        self
    }

    pub fn group(mut self, group_number: u32) -> DescriptorInput {
        self.group = GROUP_MASK | group_number;
        self
    }

    pub fn link(mut self, id: u32) -> DescriptorInput {
        self.link = id;
        self
    }

    pub fn link_group(mut self, group_number: u32) -> DescriptorInput {
        self.link = GROUP_MASK | group_number;
        self
    }

    pub fn partition(mut self, part: PartitionExtra) -> DescriptorInput {
        self.partition = Some(part);
        self
    }

    pub fn signature(mut self, sig: SignatureExtra) -> DescriptorInput {
        self.signature = Some(sig);
        self
    }

    pub fn crypto(mut self, msg: CryptoExtra) -> DescriptorInput {
        self.crypto = Some(msg);
        self
    }
}

/// Settings for a whole new image
#[derive(Debug)]
pub struct CreateInfo {
    pub id: [u8; ID_LEN],
    pub launch: Vec<u8>,
    pub inputs: Vec<DescriptorInput>,
}

impl CreateInfo {
    pub fn new(inputs: Vec<DescriptorInput>) -> CreateInfo {
        CreateInfo {
            id: rand::random(),
            launch: DEFAULT_LAUNCH.to_vec(),
            inputs,
        }
    }
}

pub(super) fn page_size() -> usize {
    match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
        size if size > 0 => size as usize,
        _ => 4096,
    }
}

pub(super) fn align_up(offset: i64, align: usize) -> i64 {
    let align = align.max(1) as i64;
    (offset + align - 1) / align * align
}

pub(super) fn unix_now() -> i64 {
    match std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH) {
        Ok(elapsed) => elapsed.as_secs() as i64,
        Err(_) => 0,
    }
}

/// Write one object's bytes at `offset` and return the length stored,
/// verifying it against the declared size unless the size is unknown
pub(super) fn write_payload(
    dest: &mut File,
    offset: u64,
    source: DataSource,
    declared: i64,
) -> Result<i64, SifError> {
    dest.seek(SeekFrom::Start(offset))?;
    let written = match source {
        DataSource::Bytes(bytes) => {
            dest.write_all(&bytes)?;
            bytes.len() as i64
        }
        DataSource::Reader(mut reader) => io::copy(&mut reader, dest)? as i64,
        DataSource::File(path) => {
            let mut file = File::open(path)?;
            io::copy(&mut file, dest)? as i64
        }
    };
    if declared != 0 && declared != written {
        return Err(SifError::SizeMismatch {
            expected: declared,
            actual: written,
        });
    }
    Ok(written)
}

/// Fill in one free table slot from an input; the data bytes were already
/// placed at `fileoff` with `padding` alignment bytes before them
pub(super) fn fill_descriptor(
    slot: &mut Descriptor,
    input: &DescriptorInput,
    id: u32,
    fileoff: i64,
    filelen: i64,
    padding: i64,
) -> Result<(), SifError> {
    let now = unix_now();
    slot.dtype = input.dtype as i32;
    slot.used = true;
    slot.id = id;
    slot.group = input.group;
    slot.link = input.link;
    slot.fileoff = fileoff;
    slot.filelen = filelen;
    slot.storelen = filelen + padding;
    slot.ctime = now;
    slot.mtime = now;
    slot.uid = unsafe { libc::getuid() } as i64;
    slot.gid = unsafe { libc::getgid() } as i64;
    slot.set_name(&input.name)?;
    if let Some(part) = &input.partition {
        slot.set_partition(part);
    }
    if let Some(sig) = &input.signature {
        slot.set_signature(sig)?;
    }
    if let Some(msg) = &input.crypto {
        slot.set_crypto(msg);
    }
    Ok(())
}
