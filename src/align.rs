use std::num::Wrapping;

pub(crate) fn align(ix: usize, alignment: usize) -> usize {
    debug_assert!(
        alignment.is_power_of_two(),
        "{} is not power of 2, cannot be used as alignment",
        alignment
    );
    let mask = Wrapping(alignment) - Wrapping(1);
    let old_size = Wrapping(ix);
    let new_size = old_size + ((-old_size) & mask);
    new_size.0
}

/// Zero-pads `vec` up to the next multiple of `alignment`.
pub(crate) fn pad_to(vec: &mut Vec<u8>, alignment: usize) {
    vec.resize(align(vec.len(), alignment), 0);
}

#[cfg(test)]
mod tests {
    use super::{align, pad_to};
    use test_log::test;

    #[test]
    fn alignment() {
        assert_eq!(align(23, 4), 24);
        assert_eq!(align(32, 4), 32);
        assert_eq!(align(31, 1), 31);
        assert_eq!(align(0, 8), 0);
        assert_eq!(align(13, 8), 16);
    }

    #[test]
    fn padding() {
        let mut vec = vec![1u8, 2, 3];
        pad_to(&mut vec, 8);
        assert_eq!(vec, vec![1, 2, 3, 0, 0, 0, 0, 0]);
        pad_to(&mut vec, 4);
        assert_eq!(vec.len(), 8);
    }
}
