use itertools::izip;

pub(crate) const LN_SQRT_2PI: f64 = 0.918_938_533_204_672_8;

#[inline]
pub(crate) fn logaddexp(a: f64, b: f64) -> f64 {
    if a == b {
        return a + 2f64.ln();
    }
    let diff = a - b;
    if diff > 0. {
        a + (-diff).exp().ln_1p()
    } else if diff < 0. {
        b + diff.exp().ln_1p()
    } else {
        // diff is NAN
        diff
    }
}

pub(crate) fn logsumexp(values: &[f64]) -> f64 {
    values
        .iter()
        .copied()
        .fold(f64::NEG_INFINITY, logaddexp)
}

#[inline]
pub(crate) fn normal_log_density(x: f64, mu: f64, sigma: f64) -> f64 {
    let z = (x - mu) / sigma;
    -0.5 * z * z - sigma.ln() - LN_SQRT_2PI
}

pub(crate) fn vector_dot(a: &[f64], b: &[f64]) -> f64 {
    assert!(a.len() == b.len());
    izip!(a, b).map(|(x, y)| x * y).sum()
}

pub(crate) fn axpy(x: &[f64], y: &mut [f64], a: f64) {
    assert!(y.len() == x.len());
    izip!(x, y).for_each(|(x, y)| {
        *y += a * x;
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn check_logaddexp(x in -10f64..10f64, y in -10f64..10f64) {
            let a = (x.exp() + y.exp()).ln();
            let b = logaddexp(x, y);
            let neginf = f64::NEG_INFINITY;
            let nan = f64::NAN;
            prop_assert!((a - b).abs() < 1e-10);
            prop_assert_eq!(b, logaddexp(y, x));
            prop_assert_eq!(x, logaddexp(x, neginf));
            prop_assert_eq!(logaddexp(neginf, neginf), neginf);
            prop_assert!(logaddexp(nan, x).is_nan());
        }

        #[test]
        fn check_logsumexp(values in proptest::collection::vec(-10f64..10f64, 1..8)) {
            let direct = values.iter().map(|x| x.exp()).sum::<f64>().ln();
            prop_assert!((direct - logsumexp(&values)).abs() < 1e-10);
        }
    }

    #[test]
    fn check_neginf() {
        assert_eq!(logaddexp(f64::NEG_INFINITY, 2.), 2.);
        assert_eq!(logaddexp(2., f64::NEG_INFINITY), 2.);
        assert_eq!(logsumexp(&[]), f64::NEG_INFINITY);
    }

    #[test]
    fn check_normal_log_density() {
        assert_abs_diff_eq!(normal_log_density(0., 0., 1.), -LN_SQRT_2PI, epsilon = 1e-15);
        assert_abs_diff_eq!(
            normal_log_density(3., 1., 2.),
            -0.5 - 2f64.ln() - LN_SQRT_2PI,
            epsilon = 1e-12
        );
    }

    #[test]
    fn check_axpy_dot() {
        let x = [1., 2., 3.];
        let mut y = [1., 1., 1.];
        axpy(&x, &mut y, 2.);
        assert_eq!(y, [3., 5., 7.]);
        assert_eq!(vector_dot(&x, &y), 3. + 10. + 21.);
    }
}
