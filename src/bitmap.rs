use core::alloc::Layout;

/// A packed bit vector stored in externally owned memory.
///
/// Bits are packed eight to a byte, least significant bit first.
pub struct Bitmap {
    num_bits: usize,
    map: *mut u8,
}

impl Bitmap {
    pub fn map_layout(num_bits: usize) -> Layout {
        Layout::array::<u8>(Self::num_bytes(num_bits)).expect("bitmap metadata layout error")
    }

    /// Constructs a new bitmap of `num_bits` bits, backed by `map`, with every
    /// bit cleared.
    ///
    /// A `Layout` describing a suitable region for `map` can be obtained with
    /// `Bitmap::map_layout(num_bits)`.
    ///
    /// # Safety
    ///
    /// Behavior is undefined if any of the following conditions are violated:
    /// - `map` must be valid for reads and writes for
    ///   `Bitmap::num_bytes(num_bits)` bytes.
    /// - No other value may access that memory while the bitmap exists.
    pub unsafe fn new(num_bits: usize, map: *mut u8) -> Bitmap {
        assert!(num_bits > 0);
        assert!(!map.is_null());

        unsafe { map.write_bytes(0, Self::num_bytes(num_bits)) };

        Bitmap { num_bits, map }
    }

    #[inline]
    pub const fn num_bytes(num_bits: usize) -> usize {
        num_bits.div_ceil(u8::BITS as usize)
    }

    /// Returns a tuple of the index of the byte containing `bit` and a mask
    /// which extracts it.
    #[inline]
    const fn index_and_mask(bit: usize) -> (usize, u8) {
        (bit / u8::BITS as usize, 1 << (bit % u8::BITS as usize))
    }

    /// Gets the value of the indexed bit.
    #[inline]
    pub fn get(&self, index: usize) -> bool {
        assert!(index < self.num_bits);

        let (byte_idx, mask) = Self::index_and_mask(index);

        unsafe { self.map.add(byte_idx).read() & mask != 0 }
    }

    /// Sets the value of the indexed bit.
    #[inline]
    pub fn set(&mut self, index: usize, value: bool) {
        assert!(index < self.num_bits);

        let (byte_idx, mask) = Self::index_and_mask(index);

        unsafe {
            let byte_ptr = self.map.add(byte_idx);
            let byte = byte_ptr.read();
            byte_ptr.write(match value {
                true => byte | mask,
                false => byte & !mask,
            });
        }
    }

    /// Counts the set bits.
    pub fn count_ones(&self) -> usize {
        let num_bytes = Self::num_bytes(self.num_bits);
        let tail_bits = self.num_bits % u8::BITS as usize;

        (0..num_bytes)
            .map(|i| {
                let mut byte = unsafe { self.map.add(i).read() };

                // Bits past `num_bits` in the last byte are never set through
                // this type, but don't rely on it.
                if i == num_bytes - 1 && tail_bits != 0 {
                    byte &= (1 << tail_bits) - 1;
                }

                byte.count_ones() as usize
            })
            .sum()
    }
}
