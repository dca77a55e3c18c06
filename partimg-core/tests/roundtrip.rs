use partimg_core::bitmap::BlockBitmap;
use partimg_core::checksum::{ChecksumAlgorithm, ChecksumStream};
use partimg_core::device::ReadSeek;
use partimg_core::image::{self, BitmapEncoding, FilesystemDescriptor, ImageOptions};
use partimg_core::{
    Error, FilesystemProbe, RawProbe, TransferConfig, check_image, clone_to_image,
    clone_to_partition, image_info, restore,
};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use tempfile::tempdir;

const BS: usize = 1024;

/// Reports a fixed list of allocated blocks.
struct ListedProbe {
    total: u64,
    used: Vec<u64>,
}

impl FilesystemProbe for ListedProbe {
    fn name(&self) -> &str {
        "listed"
    }

    fn probe_filesystem(
        &self,
        _device: &mut dyn ReadSeek,
    ) -> partimg_core::Result<FilesystemDescriptor> {
        Ok(FilesystemDescriptor::new(
            "TESTFS",
            BS as u32,
            self.total,
            self.used.len() as u64,
        ))
    }

    fn read_allocation_bitmap(
        &self,
        _device: &mut dyn ReadSeek,
        descriptor: &FilesystemDescriptor,
    ) -> partimg_core::Result<BlockBitmap> {
        let mut bitmap = BlockBitmap::create(descriptor.total_blocks)?;
        for &block in &self.used {
            bitmap.set(block)?;
        }
        Ok(bitmap)
    }
}

fn running() -> Arc<AtomicBool> {
    Arc::new(AtomicBool::new(true))
}

fn device_bytes(blocks: usize) -> Vec<u8> {
    (0..blocks * BS).map(|i| ((i / BS) * 31 + i % 251) as u8).collect()
}

fn write_device(path: &Path, blocks: usize) -> Vec<u8> {
    let data = device_bytes(blocks);
    fs::write(path, &data).unwrap();
    data
}

fn block(data: &[u8], index: u64) -> &[u8] {
    let start = index as usize * BS;
    &data[start..start + BS]
}

fn sample_probe() -> ListedProbe {
    ListedProbe {
        total: 48,
        used: vec![0, 1, 2, 7, 8, 20, 21, 22, 23, 47],
    }
}

fn sample_config() -> TransferConfig {
    TransferConfig::new()
        .io_buffer_size(3 * BS)
        .checksum(ChecksumAlgorithm::Crc32, 4)
}

#[test]
fn image_then_restore_recreates_allocated_blocks() {
    let dir = tempdir().unwrap();
    let dev = dir.path().join("device.bin");
    let img = dir.path().join("device.img");
    let out = dir.path().join("restored.bin");
    let source = write_device(&dev, 48);
    let probe = sample_probe();
    let config = sample_config();

    let summary = clone_to_image(&probe, &dev, &img, false, &config, running(), |_| {}).unwrap();
    assert_eq!(summary.blocks_transferred, 10);
    assert_eq!(summary.checksum_tags, 3);
    let expected_len = image::data_offset(48, BitmapEncoding::Bit) + 10 * BS as u64 + 3 * 4;
    assert_eq!(fs::metadata(&img).unwrap().len(), expected_len);

    let mut events = Vec::new();
    let summary = restore(&img, &out, false, &config, running(), |event| {
        events.push((event.units_done, event.total_units))
    })
    .unwrap();
    assert_eq!(summary.blocks_transferred, 10);
    assert!(!summary.used_blocks_mismatch());
    assert_eq!(events.last(), Some(&(10, 10)));

    let restored = fs::read(&out).unwrap();
    assert_eq!(restored.len(), 48 * BS);
    for index in 0..48u64 {
        if probe.used.contains(&index) {
            assert_eq!(block(&restored, index), block(&source, index), "block {index}");
        } else {
            assert!(block(&restored, index).iter().all(|&b| b == 0), "hole {index}");
        }
    }
}

#[test]
fn imaging_is_deterministic_and_respects_existing_targets() {
    let dir = tempdir().unwrap();
    let dev = dir.path().join("device.bin");
    let img = dir.path().join("device.img");
    write_device(&dev, 48);
    let probe = sample_probe();
    let config = sample_config();

    clone_to_image(&probe, &dev, &img, false, &config, running(), |_| {}).unwrap();
    let first = fs::read(&img).unwrap();
    clone_to_image(&probe, &dev, &img, true, &config, running(), |_| {}).unwrap();
    assert_eq!(fs::read(&img).unwrap(), first);

    let err = clone_to_image(&probe, &dev, &img, false, &config, running(), |_| {}).unwrap_err();
    assert!(matches!(err, Error::TargetExists(ref p) if p == &img));
    assert_eq!(fs::read(&img).unwrap(), first);
}

#[test]
fn check_image_catches_a_damaged_block() {
    let dir = tempdir().unwrap();
    let dev = dir.path().join("device.bin");
    let img = dir.path().join("device.img");
    write_device(&dev, 48);
    let config = sample_config();
    clone_to_image(&sample_probe(), &dev, &img, false, &config, running(), |_| {}).unwrap();

    let summary = check_image(&img, &config, running(), |_| {}).unwrap();
    assert_eq!(summary.checksum_tags, 3);

    let mut bytes = fs::read(&img).unwrap();
    // Second block of the second checksum group.
    let at = image::data_offset(48, BitmapEncoding::Bit) as usize + 4 * BS + 4 + BS + 17;
    bytes[at] ^= 0x40;
    fs::write(&img, &bytes).unwrap();

    let err = check_image(&img, &config, running(), |_| {}).unwrap_err();
    assert!(matches!(
        err,
        Error::ChecksumMismatch {
            block: 7,
            legacy: false,
            ..
        }
    ));

    let lenient = sample_config().ignore_checksum(true);
    assert!(check_image(&img, &lenient, running(), |_| {}).is_ok());
}

/// Builds an image the way older writers did: legacy CRC, two blocks per group.
fn legacy_image(total: u64, used: &[u64], source: &[u8]) -> Vec<u8> {
    let mut bitmap = BlockBitmap::create(total).unwrap();
    for &b in used {
        bitmap.set(b).unwrap();
    }
    let desc = FilesystemDescriptor::new("EXTFS", BS as u32, total, used.len() as u64);
    let opts = ImageOptions::new(ChecksumAlgorithm::Crc32Legacy, 2, true);
    let mut buf = Vec::new();
    image::write_header(&mut buf, &desc, &opts).unwrap();
    image::write_bitmap(&mut buf, &bitmap).unwrap();

    let mut stream = ChecksumStream::new(ChecksumAlgorithm::Crc32Legacy);
    for (i, &b) in used.iter().enumerate() {
        let data = block(source, b);
        buf.extend_from_slice(data);
        stream.update(data);
        if (i + 1) % 2 == 0 || i + 1 == used.len() {
            stream.append_tag(&mut buf);
            stream.reset();
        }
    }
    buf
}

#[test]
fn legacy_checksum_images_restore() {
    let dir = tempdir().unwrap();
    let img = dir.path().join("legacy.img");
    let out = dir.path().join("restored.bin");
    let source = device_bytes(6);
    let used = [1u64, 2, 4];
    fs::write(&img, legacy_image(6, &used, &source)).unwrap();

    let config = TransferConfig::new();
    let summary = restore(&img, &out, false, &config, running(), |_| {}).unwrap();
    assert_eq!(summary.checksum_tags, 2);
    let restored = fs::read(&out).unwrap();
    for &b in &used {
        assert_eq!(block(&restored, b), block(&source, b));
    }
}

#[test]
fn legacy_checksum_only_sees_the_first_byte() {
    let dir = tempdir().unwrap();
    let img = dir.path().join("legacy.img");
    let source = device_bytes(6);
    let used = [1u64, 2, 4];
    let pristine = legacy_image(6, &used, &source);
    let data_at = image::data_offset(6, BitmapEncoding::Bit) as usize;
    let config = TransferConfig::new();

    // Damage past the first byte goes unnoticed by the legacy algorithm.
    let mut bytes = pristine.clone();
    bytes[data_at + 100] ^= 0xFF;
    fs::write(&img, &bytes).unwrap();
    assert!(check_image(&img, &config, running(), |_| {}).is_ok());

    let first = pristine[data_at];
    let algo = ChecksumAlgorithm::Crc32Legacy;
    assert_ne!(
        algo.fold(0xFFFF_FFFF, &[first; BS]),
        algo.fold(0xFFFF_FFFF, &[first ^ 0xFF; BS])
    );
    let mut bytes = pristine;
    bytes[data_at] ^= 0xFF;
    fs::write(&img, &bytes).unwrap();
    let err = check_image(&img, &config, running(), |_| {}).unwrap_err();
    assert!(matches!(
        err,
        Error::ChecksumMismatch {
            block: 1,
            legacy: true,
            algorithm: ChecksumAlgorithm::Crc32Legacy,
            ..
        }
    ));
}

#[test]
fn raw_probe_images_every_whole_block() {
    let dir = tempdir().unwrap();
    let dev = dir.path().join("device.bin");
    let img = dir.path().join("device.img");
    let mut data = device_bytes(10);
    data.extend_from_slice(&[0xAB; 100]);
    fs::write(&dev, &data).unwrap();

    let probe = RawProbe::new(BS as u32).unwrap();
    let config = TransferConfig::new();
    let summary = clone_to_image(&probe, &dev, &img, false, &config, running(), |_| {}).unwrap();
    assert_eq!(summary.blocks_transferred, 10);

    let info = image_info(&img, false).unwrap();
    assert_eq!(info.head.descriptor.total_blocks, 10);
    assert_eq!(info.used_blocks_counted, 10);
    assert_eq!(info.head.descriptor.fs_name(), "RAW");
    assert_eq!(info.expected_size, fs::metadata(&img).unwrap().len());
}

#[test]
fn image_info_can_tolerate_a_corrupt_bitmap() {
    let dir = tempdir().unwrap();
    let dev = dir.path().join("device.bin");
    let img = dir.path().join("device.img");
    write_device(&dev, 48);
    clone_to_image(&sample_probe(), &dev, &img, false, &sample_config(), running(), |_| {})
        .unwrap();

    let mut bytes = fs::read(&img).unwrap();
    bytes[image::IMAGE_HEAD_SIZE + image::CRC_SIZE + 1] ^= 0x01;
    fs::write(&img, &bytes).unwrap();

    assert!(matches!(image_info(&img, false), Err(Error::Corrupt { .. })));
    let info = image_info(&img, true).unwrap();
    assert!(info.bitmap_corruption.is_some());
    assert_eq!(info.head.descriptor.fs_name(), "TESTFS");

    let err = restore(
        &img,
        &dir.path().join("out.bin"),
        false,
        &TransferConfig::new(),
        running(),
        |_| {},
    )
    .unwrap_err();
    assert!(matches!(err, Error::Corrupt { .. }));
}

#[test]
fn partition_copy_keeps_unallocated_target_blocks() {
    let dir = tempdir().unwrap();
    let dev = dir.path().join("device.bin");
    let target = dir.path().join("target.bin");
    let source = write_device(&dev, 48);
    fs::write(&target, vec![0xEE; 48 * BS]).unwrap();
    let probe = sample_probe();
    let config = TransferConfig::new().io_buffer_size(4 * BS).verify(true);

    let err = clone_to_partition(&probe, &dev, &target, false, &config, running(), |_| {})
        .unwrap_err();
    assert!(matches!(err, Error::TargetExists(_)));

    let summary =
        clone_to_partition(&probe, &dev, &target, true, &config, running(), |_| {}).unwrap();
    assert_eq!(summary.blocks_transferred, 10);

    let copied = fs::read(&target).unwrap();
    for index in 0..48u64 {
        if probe.used.contains(&index) {
            assert_eq!(block(&copied, index), block(&source, index));
        } else {
            assert!(block(&copied, index).iter().all(|&b| b == 0xEE));
        }
    }
}

#[test]
fn cancelled_sessions_stop_before_writing_blocks() {
    let dir = tempdir().unwrap();
    let dev = dir.path().join("device.bin");
    let img = dir.path().join("device.img");
    write_device(&dev, 48);
    let stopped = Arc::new(AtomicBool::new(false));

    let err = clone_to_image(
        &sample_probe(),
        &dev,
        &img,
        false,
        &sample_config(),
        stopped,
        |_| {},
    )
    .unwrap_err();
    assert!(matches!(err, Error::Cancelled));
    assert_eq!(
        fs::metadata(&img).unwrap().len(),
        image::data_offset(48, BitmapEncoding::Bit)
    );
}
