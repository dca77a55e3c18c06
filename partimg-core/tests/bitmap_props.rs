use partimg_core::Error;
use partimg_core::bitmap::BlockBitmap;
use partimg_core::image::{self, BitmapEncoding};
use proptest::prelude::*;
use proptest::sample::Index;

fn bitmap_from(total: u64, picks: &[u64]) -> BlockBitmap {
    let mut bitmap = BlockBitmap::create(total).unwrap();
    for &p in picks {
        bitmap.set(p % total).unwrap();
    }
    bitmap
}

proptest! {
    #[test]
    fn stored_bitmap_reads_back(
        total in 1u64..4000,
        picks in prop::collection::vec(any::<u64>(), 0..128),
    ) {
        let bitmap = bitmap_from(total, &picks);
        let mut buf = Vec::new();
        image::write_bitmap(&mut buf, &bitmap).unwrap();
        prop_assert_eq!(buf.len(), BitmapEncoding::Bit.stored_len(total) + image::CRC_SIZE);

        let back = image::read_bitmap(&mut buf.as_slice(), total, BitmapEncoding::Bit).unwrap();
        prop_assert_eq!(back.as_bytes(), bitmap.as_bytes());
        prop_assert_eq!(back.count_set(), bitmap.count_set());
    }

    #[test]
    fn any_damaged_bitmap_byte_is_detected(
        total in 1u64..4000,
        picks in prop::collection::vec(any::<u64>(), 0..128),
        at in any::<Index>(),
        mask in 1u8..=255,
    ) {
        let bitmap = bitmap_from(total, &picks);
        let mut buf = Vec::new();
        image::write_bitmap(&mut buf, &bitmap).unwrap();
        let i = at.index(buf.len());
        buf[i] ^= mask;

        let result = image::read_bitmap(&mut buf.as_slice(), total, BitmapEncoding::Bit);
        let corrupt = matches!(result, Err(Error::Corrupt { .. }));
        prop_assert!(corrupt);
    }

    #[test]
    fn chunks_cover_exactly_the_allocated_blocks(
        total in 1u64..2000,
        picks in prop::collection::vec(any::<u64>(), 0..200),
        capacity in 1u64..40,
    ) {
        let bitmap = bitmap_from(total, &picks);
        let mut covered = 0;
        let mut last_end = 0;
        for (first, count) in bitmap.chunks(capacity) {
            prop_assert!(count >= 1 && count <= capacity);
            prop_assert!(first >= last_end);
            for block in first..first + count {
                prop_assert!(bitmap.get(block).unwrap());
            }
            covered += count;
            last_end = first + count;
        }
        prop_assert_eq!(covered, bitmap.count_set());
    }
}
