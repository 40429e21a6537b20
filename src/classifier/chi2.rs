//! Chi-squared survival function for the classifier's combining step

/// `P(chi2 >= x2)` for a chi-squared distribution with `v` degrees of
/// freedom; `v` must be even. Computed by the standard series expansion,
/// which is exact enough here because `v <= 300` by construction.
pub fn chi2q(x2: f64, v: u32) -> f64 {
    debug_assert!(v % 2 == 0, "degrees of freedom must be even");
    let m = x2 / 2.0;
    let mut term = (-m).exp();
    let mut sum = term;
    for i in 1..(v / 2) {
        term *= m / f64::from(i);
        sum += term;
    }
    sum.min(1.0)
}

/// Decompose `x` into `(mantissa, exponent)` with `x = m * 2^e` and
/// `0.5 <= |m| < 1`. Used to keep long probability products from
/// underflowing without paying for a logarithm per factor.
pub fn frexp(x: f64) -> (f64, i32) {
    if x == 0.0 || !x.is_finite() {
        return (x, 0);
    }
    let bits = x.to_bits();
    let raw_exp = ((bits >> 52) & 0x7ff) as i32;
    if raw_exp == 0 {
        // Subnormal: renormalize first
        let (m, e) = frexp(x * 2f64.powi(64));
        return (m, e - 64);
    }
    let e = raw_exp - 1022;
    let mantissa = f64::from_bits((bits & !(0x7ffu64 << 52)) | (1022u64 << 52));
    (mantissa, e)
}

#[cfg(test)]
mod tests {
    use super::{chi2q, frexp};

    #[test]
    fn chi2q_boundaries() {
        assert!((chi2q(0.0, 2) - 1.0).abs() < 1e-12);
        assert!(chi2q(1000.0, 2) < 1e-12);
        let mid = chi2q(10.0, 10);
        assert!(mid > 0.0 && mid < 1.0);
    }

    #[test]
    fn chi2q_is_monotonic_in_x2() {
        let mut last = 1.0;
        for i in 0..50 {
            let q = chi2q(f64::from(i), 20);
            assert!(q <= last + 1e-12);
            last = q;
        }
    }

    #[test]
    fn frexp_round_trips() {
        for x in [1.0, 0.5, 3.75, 1e-300, 123456.789, 1e300] {
            let (m, e) = frexp(x);
            assert!((0.5..1.0).contains(&m.abs()), "mantissa {m} for {x}");
            assert!((m * 2f64.powi(e) - x).abs() <= x * 1e-15);
        }
        assert_eq!(frexp(0.0), (0.0, 0));
    }
}
