//! Size class thresholds.
//!
//! 42 ascending thresholds from 8 bytes to 327684 bytes. A request belongs to
//! the first class whose threshold is at least the requested size. The last
//! threshold is the largest request the bucket tier services.

/// Number of size classes.
pub const NUM_SIZE_CLASSES: usize = 42;

/// Largest request serviced by the bucket tier (bytes).
pub const MAX_CLASS_SIZE: usize = SIZE_TABLE[NUM_SIZE_CLASSES - 1];

/// Size class thresholds.
///
/// Row 0: 8..112, 16-byte steps after the first two
/// Row 1: 128..384, 32-byte steps
/// Row 2: 448..1024, 64/128-byte steps
/// Rows 3-4: 1168..16384, about four classes per doubling
/// Tail: 21840 and the 327684 catch-all
const SIZE_TABLE: [usize; NUM_SIZE_CLASSES] = [
    8, 16, 32, 48, 64, 80, 96, 112, //
    128, 160, 192, 224, 256, 288, 320, 384, //
    448, 512, 576, 640, 704, 768, 896, 1024, //
    1168, 1360, 1632, 2048, 2336, 2720, 3264, 4096, //
    4672, 5456, 6544, 8192, 9360, 10912, 13104, 16384, //
    21840, 327684,
];

/// The full threshold table.
#[must_use]
pub const fn thresholds() -> &'static [usize; NUM_SIZE_CLASSES] {
    &SIZE_TABLE
}

/// Returns the class index for `size`, or `None` when `size` exceeds
/// [`MAX_CLASS_SIZE`].
///
/// Binary search for the smallest index whose threshold is `>= size`, so a
/// size equal to a threshold stays in that threshold's class.
#[must_use]
pub fn class_of(size: usize) -> Option<usize> {
    let index = SIZE_TABLE.partition_point(|&threshold| threshold < size);
    (index < NUM_SIZE_CLASSES).then_some(index)
}

/// Returns the block size for `class`, or 0 for out-of-range indices.
#[must_use]
pub fn class_size(class: usize) -> usize {
    SIZE_TABLE.get(class).copied().unwrap_or(0)
}
