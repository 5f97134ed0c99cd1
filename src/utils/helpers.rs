use crate::core::scalar::Scalar;
use num_traits::Zero;

pub fn arg_min<T: PartialOrd + Copy>(values: &[T]) -> (usize, T) {
    values.iter().enumerate().fold(
        (0, values[0]),
        |(i_min, v_min), (i, &v)| {
            if v < v_min {
                (i, v)
            } else {
                (i_min, v_min)
            }
        },
    )
}

pub fn arg_max<T: PartialOrd + Copy>(values: &[T]) -> (usize, T) {
    values.iter().enumerate().fold(
        (0, values[0]),
        |(i_max, v_max), (i, &v)| {
            if v > v_max {
                (i, v)
            } else {
                (i_max, v_max)
            }
        },
    )
}

/// Index and magnitude of the entry of largest modulus, skipping masked
/// positions. Returns `None` when every position is masked.
pub fn arg_max_modulus<T: Scalar>(values: &[T], masked: &[bool]) -> Option<(usize, T::Real)> {
    let mut best: Option<(usize, T::Real)> = None;
    for (i, v) in values.iter().enumerate() {
        if masked[i] {
            continue;
        }
        let m = v.modulus();
        match best {
            Some((_, b)) if b >= m => {}
            _ => best = Some((i, m)),
        }
    }
    best
}

/// Squared Euclidean norm of a scalar slice.
pub fn norm_sqr<T: Scalar>(values: &[T]) -> T::Real {
    values
        .iter()
        .fold(T::Real::zero(), |acc, v| acc + v.modulus_sqr())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arg_extrema() {
        let values = [3.0_f64, -1.0, 7.0, 0.5];
        assert_eq!(arg_max(&values), (2, 7.0));
        assert_eq!(arg_min(&values), (1, -1.0));
    }

    #[test]
    fn test_arg_max_modulus_respects_mask() {
        let values = [3.0_f64, -9.0, 7.0];
        let masked = [false, true, false];
        assert_eq!(arg_max_modulus(&values, &masked), Some((2, 7.0)));
        assert_eq!(arg_max_modulus(&values, &[true; 3]), None);
    }
}
