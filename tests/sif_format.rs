//! End-to-end properties of the SIF image format: create, reload,
//! lookup, delete and compact against real files on disk

use sifbox::sif::{
    arch_code, CreateInfo, DataSource, Datatype, DeletePolicy, Descriptor, DescriptorInput,
    Fstype, OpenMode, Parttype, PartitionExtra, SifFile, DESCRIPTOR_CAPACITY,
};
use sifbox::SifError;
use std::{fs, io::Cursor, path::PathBuf};

struct TempImage {
    path: PathBuf,
}

impl TempImage {
    fn new() -> TempImage {
        TempImage {
            path: std::env::temp_dir().join(format!(
                "sifbox-test-{}-{:x}.sif",
                std::process::id(),
                rand::random::<u64>()
            )),
        }
    }
}

impl Drop for TempImage {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn squash_partition(bytes: Vec<u8>) -> DescriptorInput {
    DescriptorInput::new(Datatype::Partition, DataSource::Bytes(bytes))
        .name("rootfs")
        .group(1)
        .partition(PartitionExtra {
            fstype: Fstype::Squash,
            parttype: Parttype::PrimSys,
            arch: *arch_code("amd64").unwrap(),
        })
}

#[test]
fn create_and_reload_round_trip() {
    let image = TempImage::new();
    let deffile = b"bootstrap: docker\nfrom: alpine\n".to_vec();
    let labels = br#"{"maintainer": "nobody"}"#.to_vec();

    SifFile::create(
        &image.path,
        CreateInfo::new(vec![
            DescriptorInput::new(Datatype::Deffile, DataSource::Bytes(deffile.clone()))
                .name("definition"),
            squash_partition(vec![0xAA; 100]),
            DescriptorInput::new(Datatype::Labels, DataSource::Bytes(labels.clone()))
                .name("labels")
                .link(2),
        ]),
    )
    .unwrap();

    let loaded = SifFile::load(&image.path, OpenMode::ReadOnly).unwrap();
    assert_eq!(loaded.descriptors().count(), 3);

    let first = loaded.descriptor(1).unwrap();
    assert_eq!(first.datatype(), Some(Datatype::Deffile));
    assert_eq!(first.filelen as usize, deffile.len());
    assert_eq!(loaded.read_data(first).unwrap(), deffile);

    let second = loaded.descriptor(2).unwrap();
    assert_eq!(second.datatype(), Some(Datatype::Partition));
    assert_eq!(second.filelen, 100);
    let part = second.partition().unwrap();
    assert_eq!(part.fstype, Fstype::Squash);
    assert_eq!(part.parttype, Parttype::PrimSys);

    let third = loaded.descriptor(3).unwrap();
    assert_eq!(third.datatype(), Some(Datatype::Labels));
    assert_eq!(loaded.read_data(third).unwrap(), labels);
    assert_eq!(third.link, 2);
}

#[test]
fn example_scenario_from_deffile_and_partition() {
    // A deffile plus a 100-byte squashfs partition marked amd64: the
    // loaded image must report the primary partition and the header arch
    let image = TempImage::new();
    SifFile::create(
        &image.path,
        CreateInfo::new(vec![
            DescriptorInput::new(Datatype::Deffile, DataSource::Bytes(b"test\n".to_vec())),
            squash_partition(vec![0; 100]),
        ]),
    )
    .unwrap();

    let loaded = SifFile::load(&image.path, OpenMode::ReadOnly).unwrap();
    let primary = loaded.primary_partition().unwrap();
    let extra = primary.partition().unwrap();
    assert_eq!(extra.fstype, Fstype::Squash);
    assert_eq!(extra.parttype, Parttype::PrimSys);
    assert_eq!(loaded.header().arch, *arch_code("amd64").unwrap());
    assert_eq!(loaded.header().arch_name(), "amd64");
}

#[test]
fn streamed_input_with_declared_size() {
    let image = TempImage::new();
    let reader = Cursor::new(vec![0x55; 4321]);
    SifFile::create(
        &image.path,
        CreateInfo::new(vec![DescriptorInput::new(
            Datatype::Generic,
            DataSource::Reader(Box::new(reader)),
        )
        .size(4321)]),
    )
    .unwrap();

    let loaded = SifFile::load(&image.path, OpenMode::ReadOnly).unwrap();
    assert_eq!(loaded.descriptor(1).unwrap().filelen, 4321);
}

#[test]
fn streamed_size_mismatch_fails_and_leaves_nothing() {
    let image = TempImage::new();
    let reader = Cursor::new(vec![0x55; 10]);
    let result = SifFile::create(
        &image.path,
        CreateInfo::new(vec![DescriptorInput::new(
            Datatype::Generic,
            DataSource::Reader(Box::new(reader)),
        )
        .size(11)]),
    );
    assert!(matches!(
        result,
        Err(SifError::SizeMismatch {
            expected: 11,
            actual: 10
        })
    ));
    // All-or-nothing: no partial file at the destination
    assert!(!image.path.exists());
}

#[test]
fn object_offsets_respect_alignment() {
    let image = TempImage::new();
    SifFile::create(
        &image.path,
        CreateInfo::new(vec![
            DescriptorInput::new(Datatype::Generic, DataSource::Bytes(vec![1; 10])),
            DescriptorInput::new(Datatype::Generic, DataSource::Bytes(vec![2; 10])).align(512),
            DescriptorInput::new(Datatype::Generic, DataSource::Bytes(vec![3; 10])).align(64),
        ]),
    )
    .unwrap();

    let loaded = SifFile::load(&image.path, OpenMode::ReadOnly).unwrap();
    let aligns = [4096, 512, 64];
    for (descriptor, align) in loaded.descriptors().zip(aligns.iter()) {
        assert_eq!(
            descriptor.fileoff % align,
            0,
            "descriptor {} offset {} not aligned to {}",
            descriptor.id,
            descriptor.fileoff,
            align
        );
    }
}

#[test]
fn second_primary_partition_is_refused() {
    let image = TempImage::new();
    let result = SifFile::create(
        &image.path,
        CreateInfo::new(vec![
            squash_partition(vec![0; 64]),
            squash_partition(vec![0; 64]),
        ]),
    );
    assert!(matches!(result, Err(SifError::DuplicatePrimary)));

    // The same rule holds for set_primary on a loaded image
    SifFile::create(
        &image.path,
        CreateInfo::new(vec![
            squash_partition(vec![0; 64]),
            DescriptorInput::new(Datatype::Partition, DataSource::Bytes(vec![0; 64]))
                .name("data")
                .group(1)
                .partition(PartitionExtra {
                    fstype: Fstype::Squash,
                    parttype: Parttype::System,
                    arch: *arch_code("amd64").unwrap(),
                }),
        ]),
    )
    .unwrap();
    let mut loaded = SifFile::load(&image.path, OpenMode::ReadWrite).unwrap();
    assert!(matches!(
        loaded.set_primary(2),
        Err(SifError::DuplicatePrimary)
    ));
}

#[test]
fn deleting_the_primary_resets_the_architecture() {
    let image = TempImage::new();
    SifFile::create(&image.path, CreateInfo::new(vec![squash_partition(vec![0; 64])])).unwrap();

    let mut loaded = SifFile::load(&image.path, OpenMode::ReadWrite).unwrap();
    assert_eq!(loaded.header().arch_name(), "amd64");
    loaded.delete_object(1, DeletePolicy::Default).unwrap();
    assert!(matches!(
        loaded.primary_partition(),
        Err(SifError::NoPrimaryPartition)
    ));
    assert_eq!(loaded.header().arch_name(), "unknown");

    // And the reset survives a reload
    let reloaded = SifFile::load(&image.path, OpenMode::ReadOnly).unwrap();
    assert_eq!(reloaded.header().arch_name(), "unknown");
    assert_eq!(reloaded.descriptors().count(), 0);
}

#[test]
fn compact_deletes_shrink_only_the_last_object() {
    let image = TempImage::new();
    SifFile::create(
        &image.path,
        CreateInfo::new(vec![
            DescriptorInput::new(Datatype::Generic, DataSource::Bytes(vec![1; 100])),
            DescriptorInput::new(Datatype::Generic, DataSource::Bytes(vec![2; 100])),
        ]),
    )
    .unwrap();

    // Deleting the middle object with Compact leaves the hole in place
    let size_before = fs::metadata(&image.path).unwrap().len();
    let mut loaded = SifFile::load(&image.path, OpenMode::ReadWrite).unwrap();
    let first_end = {
        let d = loaded.descriptor(1).unwrap();
        (d.fileoff + d.filelen) as u64
    };
    loaded.delete_object(1, DeletePolicy::Compact).unwrap();
    assert_eq!(fs::metadata(&image.path).unwrap().len(), size_before);

    // Deleting the (now) last object truncates to the end of the next
    // highest remaining object; with none left, to the data offset
    loaded.delete_object(2, DeletePolicy::Compact).unwrap();
    let size_after = fs::metadata(&image.path).unwrap().len();
    assert!(size_after < size_before);
    assert!(size_after <= first_end);
}

#[test]
fn zero_delete_erases_without_shrinking() {
    let image = TempImage::new();
    SifFile::create(
        &image.path,
        CreateInfo::new(vec![DescriptorInput::new(
            Datatype::Generic,
            DataSource::Bytes(vec![0xEE; 256]),
        )]),
    )
    .unwrap();

    let size_before = fs::metadata(&image.path).unwrap().len();
    let mut loaded = SifFile::load(&image.path, OpenMode::ReadWrite).unwrap();
    let (fileoff, filelen) = {
        let d = loaded.descriptor(1).unwrap();
        (d.fileoff as usize, d.filelen as usize)
    };
    loaded.delete_object(1, DeletePolicy::Zero).unwrap();

    assert_eq!(fs::metadata(&image.path).unwrap().len(), size_before);
    let raw = fs::read(&image.path).unwrap();
    assert!(raw[fileoff..fileoff + filelen].iter().all(|b| *b == 0));
}

#[test]
fn free_slot_returns_to_the_pool() {
    let image = TempImage::new();
    SifFile::create(
        &image.path,
        CreateInfo::new(vec![DescriptorInput::new(
            Datatype::Generic,
            DataSource::Bytes(vec![7; 32]),
        )]),
    )
    .unwrap();

    let mut loaded = SifFile::load(&image.path, OpenMode::ReadWrite).unwrap();
    let free_before = loaded.header().dfree;
    loaded.delete_object(1, DeletePolicy::Default).unwrap();
    assert_eq!(loaded.header().dfree, free_before + 1);

    let id = loaded
        .add_object(DescriptorInput::new(
            Datatype::Generic,
            DataSource::Bytes(vec![8; 32]),
        ))
        .unwrap();
    assert_eq!(id, 1);
    assert_eq!(loaded.header().dfree, free_before);
}

#[test]
fn capacity_is_enforced() {
    let image = TempImage::new();
    let inputs: Vec<DescriptorInput> = (0..DESCRIPTOR_CAPACITY + 1)
        .map(|_| {
            DescriptorInput::new(Datatype::Generic, DataSource::Bytes(vec![0; 8])).align(8)
        })
        .collect();
    assert!(matches!(
        SifFile::create(&image.path, CreateInfo::new(inputs)),
        Err(SifError::NoFreeDescriptor)
    ));
}

#[test]
fn group_and_link_lookups() {
    let image = TempImage::new();
    SifFile::create(
        &image.path,
        CreateInfo::new(vec![
            squash_partition(vec![0; 64]),
            DescriptorInput::new(Datatype::Signature, DataSource::Bytes(vec![9; 64]))
                .name("sig")
                .group(1)
                .link(1),
        ]),
    )
    .unwrap();

    let loaded = SifFile::load(&image.path, OpenMode::ReadOnly).unwrap();
    let partitions = loaded.partitions_in_group(1).unwrap();
    assert_eq!(partitions.len(), 1);
    assert_eq!(partitions[0].id, 1);

    let signatures = loaded.signatures_in_group(1).unwrap();
    assert_eq!(signatures.len(), 1);
    assert_eq!(signatures[0].id, 2);

    let linked = loaded.linked_to(1).unwrap();
    assert_eq!(linked.len(), 1);
    assert_eq!(linked[0].id, 2);

    assert!(matches!(
        loaded.partitions_in_group(9),
        Err(SifError::NotFound)
    ));
    assert!(matches!(loaded.descriptor(42), Err(SifError::NotFound)));
}

#[test]
fn template_search_matches_nonzero_fields() {
    let image = TempImage::new();
    SifFile::create(
        &image.path,
        CreateInfo::new(vec![
            DescriptorInput::new(Datatype::Generic, DataSource::Bytes(vec![0; 16])),
            DescriptorInput::new(Datatype::Labels, DataSource::Bytes(vec![0; 16])),
            DescriptorInput::new(Datatype::Generic, DataSource::Bytes(vec![0; 32])),
        ]),
    )
    .unwrap();

    let loaded = SifFile::load(&image.path, OpenMode::ReadOnly).unwrap();
    let mut template = Descriptor::empty();
    template.dtype = Datatype::Generic as i32;
    let found = loaded.find(&template).unwrap();
    assert_eq!(found.len(), 2);

    template.filelen = 32;
    let found = loaded.find(&template).unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id, 3);
}

#[test]
fn ambiguous_id_lookup_is_an_error_not_a_guess() {
    // Force two used descriptors onto the same id by editing the table
    // on disk, then expect the unique lookup to refuse to pick one
    use sifbox::sif::{DESCRIPTOR_LEN, HEADER_LEN};

    let image = TempImage::new();
    SifFile::create(
        &image.path,
        CreateInfo::new(vec![
            DescriptorInput::new(Datatype::Generic, DataSource::Bytes(vec![1; 8])),
            DescriptorInput::new(Datatype::Generic, DataSource::Bytes(vec![2; 8])),
        ]),
    )
    .unwrap();

    let mut raw = fs::read(&image.path).unwrap();
    // Second record's id field sits after dtype(4) and used(4)
    let id_offset = HEADER_LEN + DESCRIPTOR_LEN + 8;
    raw[id_offset..id_offset + 4].copy_from_slice(&1u32.to_le_bytes());
    fs::write(&image.path, &raw).unwrap();

    let loaded = SifFile::load(&image.path, OpenMode::ReadOnly).unwrap();
    assert!(matches!(
        loaded.descriptor(1),
        Err(SifError::MultipleMatches)
    ));
}

#[test]
fn not_a_sif_file() {
    let image = TempImage::new();
    fs::write(&image.path, vec![b'x'; 256]).unwrap();
    assert!(matches!(
        SifFile::load(&image.path, OpenMode::ReadOnly),
        Err(SifError::BadMagic)
    ));
}
