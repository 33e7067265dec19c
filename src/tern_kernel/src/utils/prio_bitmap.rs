//! Provides `FixedPrioBitmap`, a bit array structure tracking which priority
//! buckets of a task queue are occupied.
//!
//! The kernel restricts the number of priority levels to the machine word
//! width, so a single word suffices and every scan operation is one
//! count-leading-zeros away.
use core::fmt;

use super::Init;

/// Trait for [`FixedPrioBitmap`].
///
/// All methods panic when the given bit position is out of range.
pub trait PrioBitmap: Init + Send + Sync + Clone + Copy + fmt::Debug + 'static {
    /// Get the bit at the specified position.
    fn get(&self, i: usize) -> bool;

    /// Set the bit at the specified position.
    fn set(&mut self, i: usize);

    /// Clear the bit at the specified position.
    fn clear(&mut self, i: usize);

    /// Get the position of the most significant set bit, which corresponds
    /// to the highest occupied priority.
    fn find_last_set(&self) -> Option<usize>;
}

/// A bit array structure supporting constant-time find-last-set.
///
/// `LEN` is the number of valid bit positions and must not exceed
/// `usize::BITS`.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct FixedPrioBitmap<const LEN: usize> {
    bits: usize,
}

impl<const LEN: usize> Init for FixedPrioBitmap<LEN> {
    const INIT: Self = Self { bits: 0 };
}

impl<const LEN: usize> fmt::Debug for FixedPrioBitmap<LEN> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_list()
            .entries((0..LEN).filter(|&i| self.get(i)))
            .finish()
    }
}

impl<const LEN: usize> FixedPrioBitmap<LEN> {
    const LEN_OK: () = assert!(LEN <= usize::BITS as usize, "too many priority levels");
}

impl<const LEN: usize> PrioBitmap for FixedPrioBitmap<LEN> {
    fn get(&self, i: usize) -> bool {
        #[allow(clippy::let_unit_value)]
        let () = Self::LEN_OK;
        assert!(i < LEN);
        (self.bits >> i) & 1 != 0
    }

    fn set(&mut self, i: usize) {
        assert!(i < LEN);
        self.bits |= 1 << i;
    }

    fn clear(&mut self, i: usize) {
        assert!(i < LEN);
        self.bits &= !(1 << i);
    }

    fn find_last_set(&self) -> Option<usize> {
        if self.bits == 0 {
            None
        } else {
            Some(usize::BITS as usize - 1 - self.bits.leading_zeros() as usize)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;
    use std::collections::BTreeSet;

    /// A modifying operation on the bitmap.
    #[derive(Debug)]
    enum Cmd {
        Insert(usize),
        Remove(usize),
    }

    /// Map random bytes to operations on the bitmap.
    fn interpret(bytecode: &[u8], len: usize) -> impl Iterator<Item = Cmd> + '_ {
        let mut i = 0;
        let mut known_set_bits = Vec::new();
        std::iter::from_fn(move || {
            if let Some(instr) = bytecode.get(i..i + 3) {
                i += 3;

                let value = u16::from_le_bytes([instr[1], instr[2]]) as usize;

                if instr[0] % 2 == 0 || known_set_bits.is_empty() {
                    let bit = value % len;
                    known_set_bits.push(bit);
                    Some(Cmd::Insert(bit))
                } else {
                    let i = value % known_set_bits.len();
                    let bit = known_set_bits.swap_remove(i);
                    Some(Cmd::Remove(bit))
                }
            } else {
                None
            }
        })
    }

    fn test_inner<const LEN: usize>(bytecode: Vec<u8>) {
        let mut subject = FixedPrioBitmap::<LEN>::INIT;
        let mut reference = BTreeSet::new();

        log::info!("len = {LEN}");

        for cmd in interpret(&bytecode, LEN) {
            log::trace!("    {cmd:?}");
            match cmd {
                Cmd::Insert(bit) => {
                    subject.set(bit);
                    reference.insert(bit);
                }
                Cmd::Remove(bit) => {
                    subject.clear(bit);
                    reference.remove(&bit);
                }
            }

            assert_eq!(subject.find_last_set(), reference.iter().next_back().cloned());
        }

        let set_bits: Vec<usize> = (0..LEN).filter(|&i| subject.get(i)).collect();
        let expected: Vec<usize> = reference.iter().cloned().collect();
        assert_eq!(set_bits, expected);
    }

    #[quickcheck]
    fn size_1(bytecode: Vec<u8>) {
        test_inner::<1>(bytecode);
    }

    #[quickcheck]
    fn size_5(bytecode: Vec<u8>) {
        test_inner::<5>(bytecode);
    }

    #[quickcheck]
    fn size_16(bytecode: Vec<u8>) {
        test_inner::<16>(bytecode);
    }

    #[cfg(target_pointer_width = "64")]
    #[quickcheck]
    fn size_64(bytecode: Vec<u8>) {
        test_inner::<64>(bytecode);
    }
}
