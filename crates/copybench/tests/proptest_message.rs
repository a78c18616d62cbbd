//! Property-based tests for the message model.

use copybench::message::{effective_size, per_segment_size, Message, SEGMENT_COUNT};
use proptest::prelude::*;

proptest! {
    #[test]
    fn segment_law_holds(size in 1usize..2_000_000) {
        let per = per_segment_size(size);
        prop_assert_eq!(per, std::cmp::max(1, size / 8));
        prop_assert_eq!(effective_size(size), per * SEGMENT_COUNT);
        if size >= SEGMENT_COUNT {
            prop_assert!(effective_size(size) <= size);
            prop_assert!(size - effective_size(size) < SEGMENT_COUNT);
        } else {
            prop_assert_eq!(effective_size(size), SEGMENT_COUNT);
        }
    }

    #[test]
    fn built_message_matches_law(size in 1usize..65_536) {
        let msg = Message::new(size).unwrap();
        prop_assert_eq!(msg.segments().len(), SEGMENT_COUNT);
        prop_assert_eq!(msg.len(), effective_size(size));
        for (i, seg) in msg.segments().iter().enumerate() {
            prop_assert_eq!(seg.len(), per_segment_size(size));
            prop_assert!(seg.iter().all(|&b| b == b'A' + i as u8));
        }
    }

    #[test]
    fn slices_from_covers_the_suffix(size in 1usize..4096, cut in 0usize..4096) {
        let msg = Message::new(size).unwrap();
        let offset = cut % (msg.len() + 1);
        let mut whole = Vec::new();
        msg.serialize_into(&mut whole);
        let suffix: Vec<u8> = msg.slices_from(offset).concat();
        prop_assert_eq!(&suffix[..], &whole[offset..]);
    }
}
