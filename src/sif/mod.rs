//! The SIF container image format engine
//!
//! A SIF image is a single file holding a global header, a fixed-capacity
//! table of descriptors, and the page-aligned data objects they point at:
//! a definition file, filesystem partitions, JSON metadata, signatures,
//! and crypto messages.

mod backing;
mod create;
mod layout;

pub use backing::Backing;
pub use create::{CreateInfo, DataSource, DescriptorInput};
pub use layout::*;

use crate::errors::SifError;
use create::{align_up, fill_descriptor, page_size, unix_now, write_payload};
use std::{
    fs,
    fs::OpenOptions,
    os::unix::fs::FileExt,
    path::{Path, PathBuf},
};

/// How `SifFile::delete_object` disposes of the object's data region
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DeletePolicy {
    /// Compact when the object is last in the file, otherwise leave a hole
    Default,
    /// Overwrite the data region with zeros; file size is unchanged
    Zero,
    /// Truncate the file when the object is last, otherwise leave the hole
    Compact,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum OpenMode {
    ReadOnly,
    ReadWrite,
}

/// An open SIF image
///
/// The descriptor array always holds exactly `header.dtotal` entries,
/// used or not. The id of the primary system partition is cached at load
/// time and maintained transactionally across add and delete.
#[derive(Debug)]
pub struct SifFile {
    path: PathBuf,
    header: Header,
    descriptors: Vec<Descriptor>,
    backing: Backing,
    writable: bool,
    primary_id: Option<u32>,
}

impl SifFile {
    /// Create a new image at `path` from an ordered list of inputs.
    ///
    /// The destination appears monolithically: objects, table and header
    /// are staged in a temporary sibling file which is fsynced and then
    /// renamed over the destination, so no partial image is ever visible.
    pub fn create(path: &Path, info: CreateInfo) -> Result<SifFile, SifError> {
        let temp = temp_sibling(path);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&temp)?;

        let built = build_image(&mut file, info);
        match built {
            Err(err) => {
                drop(file);
                let _ = fs::remove_file(&temp);
                Err(err)
            }
            Ok((header, descriptors, primary_id)) => {
                file.sync_all()?;
                fs::rename(&temp, path)?;
                Ok(SifFile {
                    path: path.to_path_buf(),
                    header,
                    descriptors,
                    backing: Backing::map_or_buffer(file),
                    writable: true,
                    primary_id,
                })
            }
        }
    }

    /// Open an existing image, validating magic and version and caching
    /// the primary system partition id. Loading never mutates the file.
    pub fn load(path: &Path, mode: OpenMode) -> Result<SifFile, SifError> {
        let writable = mode == OpenMode::ReadWrite;
        let file = OpenOptions::new().read(true).write(writable).open(path)?;
        let backing = Backing::map_or_buffer(file);

        let mut header_bytes = [0u8; HEADER_LEN];
        backing.read_exact_at(&mut header_bytes, 0)?;
        let header = Header::decode(&header_bytes)?;

        if header.dtotal < 0 || header.descroff < 0 {
            return Err(SifError::Truncated);
        }
        let mut descriptors = Vec::with_capacity(header.dtotal as usize);
        let mut record = [0u8; DESCRIPTOR_LEN];
        for index in 0..header.dtotal as usize {
            let offset = header.descroff as u64 + (index * DESCRIPTOR_LEN) as u64;
            backing.read_exact_at(&mut record, offset)?;
            descriptors.push(Descriptor::decode(&record)?);
        }

        let mut primary_id = None;
        for descriptor in &descriptors {
            if descriptor.is_primary() {
                if primary_id.is_some() {
                    return Err(SifError::DuplicatePrimary);
                }
                primary_id = Some(descriptor.id);
            }
        }

        Ok(SifFile {
            path: path.to_path_buf(),
            header,
            descriptors,
            backing,
            writable,
            primary_id,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &Descriptor> {
        self.descriptors.iter().filter(|d| d.used)
    }

    /// Look up the descriptor with this id, treating both "absent" and
    /// "ambiguous" as distinct errors
    pub fn descriptor(&self, id: u32) -> Result<&Descriptor, SifError> {
        let mut matches = self.descriptors().filter(|d| d.id == id);
        match (matches.next(), matches.next()) {
            (None, _) => Err(SifError::NotFound),
            (Some(_), Some(_)) => Err(SifError::MultipleMatches),
            (Some(found), None) => Ok(found),
        }
    }

    /// All partition descriptors belonging to a group
    pub fn partitions_in_group(&self, group_number: u32) -> Result<Vec<&Descriptor>, SifError> {
        self.collect(|d| {
            d.group == GROUP_MASK | group_number && d.datatype() == Some(Datatype::Partition)
        })
    }

    /// All signature descriptors belonging to a group
    pub fn signatures_in_group(&self, group_number: u32) -> Result<Vec<&Descriptor>, SifError> {
        self.collect(|d| {
            d.group == GROUP_MASK | group_number && d.datatype() == Some(Datatype::Signature)
        })
    }

    /// All descriptors whose link field points at this descriptor id
    pub fn linked_to(&self, id: u32) -> Result<Vec<&Descriptor>, SifError> {
        self.collect(|d| d.link == id)
    }

    /// All descriptors whose link field points at this group
    pub fn linked_to_group(&self, group_number: u32) -> Result<Vec<&Descriptor>, SifError> {
        self.collect(|d| d.link == GROUP_MASK | group_number)
    }

    /// Match every non-zero field of a template descriptor
    pub fn find(&self, template: &Descriptor) -> Result<Vec<&Descriptor>, SifError> {
        self.collect(|d| {
            (template.dtype == 0 || d.dtype == template.dtype)
                && (template.id == 0 || d.id == template.id)
                && (template.group == UNUSED_GROUP || d.group == template.group)
                && (template.link == UNUSED_LINK || d.link == template.link)
                && (template.filelen == 0 || d.filelen == template.filelen)
                && (template.name[0] == 0 || d.name == template.name)
        })
    }

    fn collect<F: Fn(&&Descriptor) -> bool>(&self, pred: F) -> Result<Vec<&Descriptor>, SifError> {
        let found: Vec<&Descriptor> = self.descriptors().filter(|d| pred(d)).collect();
        if found.is_empty() {
            Err(SifError::NotFound)
        } else {
            Ok(found)
        }
    }

    /// The one partition designated as the default root filesystem
    pub fn primary_partition(&self) -> Result<&Descriptor, SifError> {
        match self.primary_id {
            None => Err(SifError::NoPrimaryPartition),
            Some(id) => self.descriptor(id),
        }
    }

    /// Read a data object fully into memory
    pub fn read_data(&self, descriptor: &Descriptor) -> Result<Vec<u8>, SifError> {
        if descriptor.fileoff < 0 || descriptor.filelen < 0 {
            return Err(SifError::Truncated);
        }
        let end = descriptor.fileoff as u64 + descriptor.filelen as u64;
        if end > self.backing.len()? {
            return Err(SifError::Truncated);
        }
        let mut buf = vec![0u8; descriptor.filelen as usize];
        self.backing.read_exact_at(&mut buf, descriptor.fileoff as u64)?;
        Ok(buf)
    }

    /// Append one new data object to the image
    pub fn add_object(&mut self, mut input: DescriptorInput) -> Result<u32, SifError> {
        self.check_writable()?;
        let slot_index = self
            .descriptors
            .iter()
            .position(|d| !d.used)
            .ok_or(SifError::NoFreeDescriptor)?;

        if let Some(part) = &input.partition {
            if part.parttype == Parttype::PrimSys && self.primary_id.is_some() {
                return Err(SifError::DuplicatePrimary);
            }
        }

        let cursor = self.data_end()?;
        let align = input.align.unwrap_or_else(page_size);
        let fileoff = align_up(cursor, align);
        let padding = fileoff - cursor;
        let source = std::mem::replace(&mut input.source, DataSource::Bytes(Vec::new()));
        let filelen = write_payload(self.backing.file_mut(), fileoff as u64, source, input.size)?;

        let id = (slot_index + 1) as u32;
        let mut slot = Descriptor::empty();
        fill_descriptor(&mut slot, &input, id, fileoff, filelen, padding)?;

        if slot.is_primary() {
            self.primary_id = Some(id);
            self.header.arch = slot.partition()?.arch;
        }

        self.descriptors[slot_index] = slot;
        self.header.dfree -= 1;
        self.header.datalen = fileoff + filelen - self.header.dataoff;
        self.header.mtime = unix_now();
        self.sync_metadata()?;
        Ok(id)
    }

    /// Delete one object, disposing of its data region per `policy`.
    ///
    /// Deleting the primary system partition resets the cached primary id
    /// and the header architecture to unknown.
    pub fn delete_object(&mut self, id: u32, policy: DeletePolicy) -> Result<(), SifError> {
        self.check_writable()?;
        let (fileoff, filelen, was_primary) = {
            let descriptor = self.descriptor(id)?;
            (
                descriptor.fileoff,
                descriptor.filelen,
                self.primary_id == Some(id),
            )
        };
        let index = self
            .descriptors
            .iter()
            .position(|d| d.used && d.id == id)
            .ok_or(SifError::NotFound)?;

        let data_end = self.data_end()?;
        let is_last = fileoff + filelen >= data_end;

        match policy {
            DeletePolicy::Zero => {
                let zeros = vec![0u8; filelen as usize];
                self.backing.file().write_all_at(&zeros, fileoff as u64)?;
            }
            DeletePolicy::Compact | DeletePolicy::Default => {
                if is_last {
                    let new_end = self
                        .descriptors()
                        .filter(|d| d.id != id)
                        .map(|d| d.fileoff + d.filelen)
                        .max()
                        .unwrap_or(self.header.dataoff);
                    self.backing.file().set_len(new_end as u64)?;
                    self.header.datalen = new_end - self.header.dataoff;
                }
                // A deleted object in the middle just leaves a hole
            }
        }

        self.descriptors[index] = Descriptor::empty();
        self.header.dfree += 1;
        self.header.mtime = unix_now();
        if was_primary {
            self.primary_id = None;
            self.header.arch = *ARCH_UNKNOWN;
        }
        self.sync_metadata()
    }

    /// Designate a partition as the primary system partition; refused
    /// while another partition already holds that role
    pub fn set_primary(&mut self, id: u32) -> Result<(), SifError> {
        self.check_writable()?;
        match self.primary_id {
            Some(current) if current == id => return Ok(()),
            Some(_) => return Err(SifError::DuplicatePrimary),
            None => (),
        }
        self.descriptor(id)?;
        let index = self
            .descriptors
            .iter()
            .position(|d| d.used && d.id == id)
            .ok_or(SifError::NotFound)?;
        let mut part = self.descriptors[index].partition()?;
        part.parttype = Parttype::PrimSys;
        self.descriptors[index].set_partition(&part);
        self.descriptors[index].mtime = unix_now();
        self.header.arch = part.arch;
        self.primary_id = Some(id);
        self.sync_metadata()
    }

    /// Multi-line human readable dump of the header and used descriptors
    pub fn describe(&self) -> String {
        let mut out = String::new();
        let header = &self.header;
        out.push_str(&format!(
            "arch: {}\nid: {}\ncreated: {}\nmodified: {}\ndescriptors: {} used, {} free\ndata: {} bytes at {}\n",
            header.arch_name(),
            hex(&header.id),
            header.ctime,
            header.mtime,
            header.dtotal - header.dfree,
            header.dfree,
            header.datalen,
            header.dataoff,
        ));
        for descriptor in self.descriptors() {
            out.push_str(&format!(
                "  {:>3} {:<14} {:>10} bytes at {:>10} {:?}{}\n",
                descriptor.id,
                match descriptor.datatype() {
                    Some(dtype) => format!("{:?}", dtype),
                    None => format!("raw({:#x})", descriptor.dtype),
                },
                descriptor.filelen,
                descriptor.fileoff,
                descriptor.name(),
                if Some(descriptor.id) == self.primary_id {
                    " (primary)"
                } else {
                    ""
                },
            ));
        }
        out
    }

    fn check_writable(&self) -> Result<(), SifError> {
        if self.writable {
            Ok(())
        } else {
            Err(SifError::ReadOnly)
        }
    }

    /// End offset of the highest data object, or the start of the data
    /// section for an image with no objects
    fn data_end(&self) -> Result<i64, SifError> {
        Ok(self
            .descriptors()
            .map(|d| d.fileoff + d.filelen)
            .max()
            .unwrap_or(self.header.dataoff))
    }

    /// Serialize the full descriptor table, then the header, then sync.
    /// Mutations only report success after the sync completes.
    fn sync_metadata(&mut self) -> Result<(), SifError> {
        let file = self.backing.file();
        for (index, descriptor) in self.descriptors.iter().enumerate() {
            let offset = self.header.descroff as u64 + (index * DESCRIPTOR_LEN) as u64;
            file.write_all_at(&descriptor.encode(), offset)?;
        }
        file.write_all_at(&self.header.encode(), 0)?;
        file.sync_all()?;
        self.backing.remap();
        Ok(())
    }
}

fn temp_sibling(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(format!(
        ".tmp-{}-{:x}",
        std::process::id(),
        rand::random::<u64>()
    ));
    path.with_file_name(name)
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

type BuiltImage = (Header, Vec<Descriptor>, Option<u32>);

fn build_image(file: &mut fs::File, info: CreateInfo) -> Result<BuiltImage, SifError> {
    if info.inputs.len() > DESCRIPTOR_CAPACITY {
        return Err(SifError::NoFreeDescriptor);
    }

    let descroff = HEADER_LEN as i64;
    let descrlen = (DESCRIPTOR_CAPACITY * DESCRIPTOR_LEN) as i64;
    let dataoff = descroff + descrlen;

    let mut descriptors = vec![Descriptor::empty(); DESCRIPTOR_CAPACITY];
    let mut cursor = dataoff;
    let mut primary_id = None;
    let mut arch = *ARCH_UNKNOWN;

    for (index, mut input) in info.inputs.into_iter().enumerate() {
        let align = input.align.unwrap_or_else(page_size);
        let fileoff = align_up(cursor, align);
        let padding = fileoff - cursor;
        let source = std::mem::replace(&mut input.source, DataSource::Bytes(Vec::new()));
        let filelen = write_payload(file, fileoff as u64, source, input.size)?;

        let id = (index + 1) as u32;
        fill_descriptor(&mut descriptors[index], &input, id, fileoff, filelen, padding)?;

        if descriptors[index].is_primary() {
            if primary_id.is_some() {
                return Err(SifError::DuplicatePrimary);
            }
            primary_id = Some(id);
            arch = descriptors[index].partition()?.arch;
        }
        cursor = fileoff + filelen;
    }

    let used = descriptors.iter().filter(|d| d.used).count() as i64;
    let now = unix_now();
    let mut launch = [0u8; LAUNCH_LEN];
    let launch_len = info.launch.len().min(LAUNCH_LEN);
    launch[..launch_len].copy_from_slice(&info.launch[..launch_len]);

    let header = Header {
        launch,
        magic: *SIF_MAGIC,
        version: *SIF_VERSION,
        arch,
        id: info.id,
        ctime: now,
        mtime: now,
        dfree: DESCRIPTOR_CAPACITY as i64 - used,
        dtotal: DESCRIPTOR_CAPACITY as i64,
        descroff,
        descrlen,
        dataoff,
        datalen: cursor - dataoff,
    };

    // Table first, header last: a reader never sees a header that points
    // at an unwritten table
    for (index, descriptor) in descriptors.iter().enumerate() {
        let offset = descroff as u64 + (index * DESCRIPTOR_LEN) as u64;
        file.write_all_at(&descriptor.encode(), offset)?;
    }
    file.write_all_at(&header.encode(), 0)?;

    Ok((header, descriptors, primary_id))
}
