//! Lookup helpers over a monotone channel axis.
use num_traits::Float;

/// Index of the first element of `axis` not less than `target`, clamped to
/// the last valid index
pub fn lower_bound<T: Float>(axis: &[T], target: T) -> usize {
    if axis.is_empty() {
        return 0;
    }
    let mut lo = 0usize;
    let mut hi = axis.len();
    while lo < hi {
        let mid = (lo + hi) / 2;
        if axis[mid] < target {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    lo.min(axis.len() - 1)
}

/// Index of the element of `axis` closest to `target`
pub fn nearest<T: Float>(axis: &[T], target: T) -> usize {
    if axis.is_empty() {
        return 0;
    }
    let idx = lower_bound(axis, target);
    if idx == 0 {
        return 0;
    }
    let below = idx - 1;
    if (axis[idx] - target).abs() < (axis[below] - target).abs() {
        idx
    } else {
        below
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn lower_bound_finds_first_not_less() {
        let axis = [0.0, 1.0, 2.0, 3.0, 4.0];
        assert_eq!(lower_bound(&axis, 2.0), 2);
        assert_eq!(lower_bound(&axis, 1.5), 2);
        assert_eq!(lower_bound(&axis, -10.0), 0);
        assert_eq!(lower_bound(&axis, 10.0), 4);
    }

    #[test]
    fn nearest_rounds_to_closest() {
        let axis = [0.0, 1.0, 2.0, 3.0, 4.0];
        assert_eq!(nearest(&axis, 1.2), 1);
        assert_eq!(nearest(&axis, 1.8), 2);
        assert_eq!(nearest(&axis, 9.0), 4);
        assert_eq!(nearest(&axis, -9.0), 0);
    }
}
