//! A module for the leaf covariance models of the kernel algebra.
//!
//! The following stationary models are implemented with unit variance and
//! unit length scale (use [`Kernel::scale`] and [`Kernel::stretch`]):
//! * squared exponential,
//! * absolute exponential,
//! * matern 3/2,
//! * matern 5/2,
//! * rational quadratic,
//! * delta (independent noise).
//!
//! Besides, the linear kernel and the constant zero and one kernels.

use crate::cache::{Cache, Resolve};
use crate::errors::{GpError, Result};
use crate::kernel::{check_elwise, CovarianceModel, Kernel};
use crate::utils::{elwise_sq_distances, pairwise_dot, pairwise_sq_distances};
use gpgraph_spd::Spd;
use ndarray::{Array1, Array2, ArrayView1, Axis};
use std::any::Any;
use std::convert::TryFrom;

/// Squared distances shared by every stationary leaf evaluated on the same inputs
fn sq_distances(x: &Array2<f64>, y: &Array2<f64>, cache: &Cache) -> Result<Array2<f64>> {
    cache.memo(
        "pairwise_sq_distances",
        vec![x.resolve(), y.resolve()],
        vec![],
        || pairwise_sq_distances(x, y),
    )
}

/// Partial derivatives of a radial kernel `g(r²)` between two inputs,
/// `d1` and `d2` being the first and second derivatives of `g`
fn radial_partial(
    x: ArrayView1<f64>,
    y: ArrayView1<f64>,
    left: Option<usize>,
    right: Option<usize>,
    g: &dyn Fn(f64) -> [f64; 3],
) -> f64 {
    let r2 = x.iter().zip(y.iter()).map(|(a, b)| (a - b) * (a - b)).sum::<f64>();
    let [v, d1, d2] = g(r2);
    match (left, right) {
        (None, None) => v,
        (Some(i), None) => 2. * (x[i] - y[i]) * d1,
        (None, Some(j)) => -2. * (x[j] - y[j]) * d1,
        (Some(i), Some(j)) => {
            let dd = (x[i] - y[i]) * (x[j] - y[j]);
            // d2 may be singular at r = 0 where it is not needed
            let curv = if dd == 0. { 0. } else { 4. * dd * d2 };
            let diag = if i == j { 2. * d1 } else { 0. };
            -(curv + diag)
        }
    }
}

fn radial_derivative(
    x: &Array2<f64>,
    y: &Array2<f64>,
    left: Option<usize>,
    right: Option<usize>,
    g: &dyn Fn(f64) -> [f64; 3],
) -> Array2<f64> {
    Array2::from_shape_fn((x.nrows(), y.nrows()), |(a, b)| {
        radial_partial(x.row(a), y.row(b), left, right, g)
    })
}

fn radial_derivative_elwise(
    x: &Array2<f64>,
    y: &Array2<f64>,
    left: Option<usize>,
    right: Option<usize>,
    g: &dyn Fn(f64) -> [f64; 3],
) -> Result<Array1<f64>> {
    check_elwise(x, y)?;
    Ok(Array1::from_shape_fn(x.nrows(), |a| {
        radial_partial(x.row(a), y.row(a), left, right, g)
    }))
}

macro_rules! declare_stationary_kernel {
    (@decl $(#[$meta:meta])* $name:ident, $display:expr, $length_scale:expr, $value:expr, { $($extra:tt)* }) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, Default)]
        pub struct $name;

        impl $name {
            fn value(r2: f64) -> f64 {
                let f: fn(f64) -> f64 = $value;
                f(r2)
            }
        }

        impl CovarianceModel for $name {
            fn compute(&self, x: &Array2<f64>, y: &Array2<f64>, cache: &Cache) -> Result<Array2<f64>> {
                Ok(sq_distances(x, y, cache)?.mapv(Self::value))
            }

            fn compute_elwise(&self, x: &Array2<f64>, y: &Array2<f64>, _cache: &Cache) -> Result<Array1<f64>> {
                Ok(elwise_sq_distances(x, y)?.mapv(Self::value))
            }

            fn stationary(&self) -> bool {
                true
            }

            fn var(&self) -> f64 {
                1.
            }

            fn length_scale(&self) -> f64 {
                $length_scale
            }

            fn display(&self, _f: &dyn Fn(f64) -> f64) -> String {
                $display.to_string()
            }

            fn as_any(&self) -> &dyn Any {
                self
            }

            $($extra)*
        }
    };
    ($(#[$meta:meta])* $name:ident, $display:expr, $length_scale:expr, $value:expr) => {
        declare_stationary_kernel!(@decl $(#[$meta])* $name, $display, $length_scale, $value, {});
    };
    ($(#[$meta:meta])* $name:ident, $display:expr, $length_scale:expr, $value:expr, $derivatives:expr) => {
        declare_stationary_kernel!(@decl $(#[$meta])* $name, $display, $length_scale, $value, {
            fn has_derivative(&self) -> bool {
                true
            }

            fn derivative(
                &self,
                x: &Array2<f64>,
                y: &Array2<f64>,
                left: Option<usize>,
                right: Option<usize>,
                _cache: &Cache,
            ) -> Result<Array2<f64>> {
                let g: fn(f64) -> [f64; 3] = $derivatives;
                Ok(radial_derivative(x, y, left, right, &g))
            }

            fn derivative_elwise(
                &self,
                x: &Array2<f64>,
                y: &Array2<f64>,
                left: Option<usize>,
                right: Option<usize>,
                _cache: &Cache,
            ) -> Result<Array1<f64>> {
                let g: fn(f64) -> [f64; 3] = $derivatives;
                radial_derivative_elwise(x, y, left, right, &g)
            }
        });
    };
}

declare_stationary_kernel!(
    /// Squared exponential kernel `exp(-r²/2)`
    SquaredExponential,
    "EQ()",
    1.,
    |r2| (-0.5 * r2).exp(),
    |r2| {
        let v = (-0.5 * r2).exp();
        [v, -0.5 * v, 0.25 * v]
    }
);

declare_stationary_kernel!(
    /// Absolute exponential kernel `exp(-r)`
    AbsoluteExponential,
    "Exp()",
    1.,
    |r2| (-r2.sqrt()).exp()
);

declare_stationary_kernel!(
    /// Matern 3/2 kernel `(1 + √3 r) exp(-√3 r)`
    Matern32,
    "Matern32()",
    1.,
    |r2| {
        let r = (3. * r2).sqrt();
        (1. + r) * (-r).exp()
    },
    |r2| {
        let r = (3. * r2).sqrt();
        let e = (-r).exp();
        let d2 = if r > 0. { 2.25 * e / r } else { f64::INFINITY };
        [(1. + r) * e, -1.5 * e, d2]
    }
);

declare_stationary_kernel!(
    /// Matern 5/2 kernel `(1 + √5 r + 5r²/3) exp(-√5 r)`
    Matern52,
    "Matern52()",
    1.,
    |r2| {
        let r = (5. * r2).sqrt();
        (1. + r + 5. * r2 / 3.) * (-r).exp()
    },
    |r2| {
        let r = (5. * r2).sqrt();
        let e = (-r).exp();
        [(1. + r + 5. * r2 / 3.) * e, -5. / 6. * (1. + r) * e, 25. / 12. * e]
    }
);

/// Rational quadratic kernel `(1 + r²/(2α))^(-α)`
#[derive(Clone, Copy, Debug)]
pub struct RationalQuadratic {
    alpha: f64,
}

impl RationalQuadratic {
    /// Constructor given the shape parameter `alpha > 0`
    pub fn new(alpha: f64) -> Result<RationalQuadratic> {
        if !(alpha > 0.) {
            return Err(GpError::InvalidValueError(format!(
                "rational quadratic shape should be positive, got {alpha}"
            )));
        }
        Ok(RationalQuadratic { alpha })
    }

    fn value(&self, r2: f64) -> f64 {
        (1. + r2 / (2. * self.alpha)).powf(-self.alpha)
    }

    fn derivatives(&self, r2: f64) -> [f64; 3] {
        let a = self.alpha;
        let u = 1. + r2 / (2. * a);
        [
            u.powf(-a),
            -0.5 * u.powf(-a - 1.),
            (a + 1.) / (4. * a) * u.powf(-a - 2.),
        ]
    }
}

impl CovarianceModel for RationalQuadratic {
    fn compute(&self, x: &Array2<f64>, y: &Array2<f64>, cache: &Cache) -> Result<Array2<f64>> {
        Ok(sq_distances(x, y, cache)?.mapv(|r2| self.value(r2)))
    }

    fn compute_elwise(&self, x: &Array2<f64>, y: &Array2<f64>, _cache: &Cache) -> Result<Array1<f64>> {
        Ok(elwise_sq_distances(x, y)?.mapv(|r2| self.value(r2)))
    }

    fn stationary(&self) -> bool {
        true
    }

    fn var(&self) -> f64 {
        1.
    }

    fn length_scale(&self) -> f64 {
        1.
    }

    fn has_derivative(&self) -> bool {
        true
    }

    fn derivative(
        &self,
        x: &Array2<f64>,
        y: &Array2<f64>,
        left: Option<usize>,
        right: Option<usize>,
        _cache: &Cache,
    ) -> Result<Array2<f64>> {
        Ok(radial_derivative(x, y, left, right, &|r2| self.derivatives(r2)))
    }

    fn derivative_elwise(
        &self,
        x: &Array2<f64>,
        y: &Array2<f64>,
        left: Option<usize>,
        right: Option<usize>,
        _cache: &Cache,
    ) -> Result<Array1<f64>> {
        radial_derivative_elwise(x, y, left, right, &|r2| self.derivatives(r2))
    }

    fn display(&self, f: &dyn Fn(f64) -> f64) -> String {
        format!("RQ({})", f(self.alpha))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Linear kernel `x·y`
#[derive(Clone, Copy, Debug, Default)]
pub struct Linear;

impl CovarianceModel for Linear {
    fn compute(&self, x: &Array2<f64>, y: &Array2<f64>, _cache: &Cache) -> Result<Array2<f64>> {
        pairwise_dot(x, y)
    }

    fn compute_elwise(&self, x: &Array2<f64>, y: &Array2<f64>, _cache: &Cache) -> Result<Array1<f64>> {
        check_elwise(x, y)?;
        Ok((x * y).sum_axis(Axis(1)))
    }

    fn var(&self) -> f64 {
        f64::INFINITY
    }

    fn length_scale(&self) -> f64 {
        f64::INFINITY
    }

    fn has_derivative(&self) -> bool {
        true
    }

    fn derivative(
        &self,
        x: &Array2<f64>,
        y: &Array2<f64>,
        left: Option<usize>,
        right: Option<usize>,
        _cache: &Cache,
    ) -> Result<Array2<f64>> {
        let shape = (x.nrows(), y.nrows());
        Ok(match (left, right) {
            (Some(i), Some(j)) if i == j => Array2::ones(shape),
            (Some(_), Some(_)) => Array2::zeros(shape),
            (Some(i), None) => Array2::from_shape_fn(shape, |(_, b)| y[[b, i]]),
            (None, Some(j)) => Array2::from_shape_fn(shape, |(a, _)| x[[a, j]]),
            (None, None) => pairwise_dot(x, y)?,
        })
    }

    fn display(&self, _f: &dyn Fn(f64) -> f64) -> String {
        "Linear()".to_string()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Squared distance under which two inputs are considered identical by [`Delta`]
pub const DELTA_EPSILON: f64 = 1e-10;

/// Independent noise kernel: one for identical inputs, zero otherwise
#[derive(Clone, Copy, Debug, Default)]
pub struct Delta;

fn delta(r2: f64) -> f64 {
    if r2 < DELTA_EPSILON {
        1.
    } else {
        0.
    }
}

impl CovarianceModel for Delta {
    fn compute(&self, x: &Array2<f64>, y: &Array2<f64>, cache: &Cache) -> Result<Array2<f64>> {
        Ok(sq_distances(x, y, cache)?.mapv(delta))
    }

    fn compute_elwise(&self, x: &Array2<f64>, y: &Array2<f64>, _cache: &Cache) -> Result<Array1<f64>> {
        Ok(elwise_sq_distances(x, y)?.mapv(delta))
    }

    fn compute_structured(&self, x: &Array2<f64>, cache: &Cache) -> Result<Spd<f64>> {
        let m = self.compute(x, x, cache)?;
        if m == Array2::eye(x.nrows()) {
            Ok(Spd::eye(x.nrows()))
        } else {
            Ok(Spd::dense(m))
        }
    }

    fn stationary(&self) -> bool {
        true
    }

    fn var(&self) -> f64 {
        1.
    }

    fn length_scale(&self) -> f64 {
        0.
    }

    fn display(&self, _f: &dyn Fn(f64) -> f64) -> String {
        "Delta()".to_string()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Constant zero kernel
#[derive(Clone, Copy, Debug, Default)]
pub struct ZeroKernel;

impl CovarianceModel for ZeroKernel {
    fn compute(&self, x: &Array2<f64>, y: &Array2<f64>, _cache: &Cache) -> Result<Array2<f64>> {
        Ok(Array2::zeros((x.nrows(), y.nrows())))
    }

    fn compute_elwise(&self, x: &Array2<f64>, y: &Array2<f64>, _cache: &Cache) -> Result<Array1<f64>> {
        check_elwise(x, y)?;
        Ok(Array1::zeros(x.nrows()))
    }

    fn compute_structured(&self, x: &Array2<f64>, _cache: &Cache) -> Result<Spd<f64>> {
        Ok(Spd::zeros(x.nrows()))
    }

    fn stationary(&self) -> bool {
        true
    }

    fn var(&self) -> f64 {
        0.
    }

    fn length_scale(&self) -> f64 {
        0.
    }

    fn is_zero(&self) -> bool {
        true
    }

    fn has_derivative(&self) -> bool {
        true
    }

    fn derivative(
        &self,
        x: &Array2<f64>,
        y: &Array2<f64>,
        _left: Option<usize>,
        _right: Option<usize>,
        _cache: &Cache,
    ) -> Result<Array2<f64>> {
        Ok(Array2::zeros((x.nrows(), y.nrows())))
    }

    fn display(&self, _f: &dyn Fn(f64) -> f64) -> String {
        "0".to_string()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Constant one kernel
#[derive(Clone, Copy, Debug, Default)]
pub struct OneKernel;

impl CovarianceModel for OneKernel {
    fn compute(&self, x: &Array2<f64>, y: &Array2<f64>, _cache: &Cache) -> Result<Array2<f64>> {
        Ok(Array2::ones((x.nrows(), y.nrows())))
    }

    fn compute_elwise(&self, x: &Array2<f64>, y: &Array2<f64>, _cache: &Cache) -> Result<Array1<f64>> {
        check_elwise(x, y)?;
        Ok(Array1::ones(x.nrows()))
    }

    fn compute_structured(&self, x: &Array2<f64>, _cache: &Cache) -> Result<Spd<f64>> {
        Ok(Spd::low_rank(Array2::ones((x.nrows(), 1))))
    }

    fn stationary(&self) -> bool {
        true
    }

    fn var(&self) -> f64 {
        1.
    }

    fn length_scale(&self) -> f64 {
        f64::INFINITY
    }

    fn is_one(&self) -> bool {
        true
    }

    fn has_derivative(&self) -> bool {
        true
    }

    fn derivative(
        &self,
        x: &Array2<f64>,
        y: &Array2<f64>,
        _left: Option<usize>,
        _right: Option<usize>,
        _cache: &Cache,
    ) -> Result<Array2<f64>> {
        Ok(Array2::zeros((x.nrows(), y.nrows())))
    }

    fn display(&self, _f: &dyn Fn(f64) -> f64) -> String {
        "1".to_string()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl TryFrom<&str> for Kernel {
    type Error = GpError;

    /// Parse a kernel name, the rational quadratic reading either `RQ`
    /// (unit shape) or `RQ(alpha)`
    fn try_from(s: &str) -> Result<Self> {
        if let Some(alpha) = s.strip_prefix("RQ(").and_then(|a| a.strip_suffix(')')) {
            let alpha = alpha.trim().parse::<f64>().map_err(|e| {
                GpError::InvalidValueError(format!("Bad rational quadratic shape {alpha}: {e}"))
            })?;
            return Ok(Kernel::new(RationalQuadratic::new(alpha)?));
        }
        match s {
            "RQ" | "RationalQuadratic" => Ok(Kernel::new(RationalQuadratic::new(1.)?)),
            "EQ" | "SquaredExponential" => Ok(Kernel::new(SquaredExponential)),
            "Exp" | "AbsoluteExponential" => Ok(Kernel::new(AbsoluteExponential)),
            "Matern32" => Ok(Kernel::new(Matern32)),
            "Matern52" => Ok(Kernel::new(Matern52)),
            "Linear" => Ok(Kernel::new(Linear)),
            "Delta" => Ok(Kernel::new(Delta)),
            _ => Err(GpError::InvalidValueError(format!(
                "Bad string value for kernel: {s}, should be one of EQ, Exp, Matern32, Matern52, RQ, RQ(alpha), Linear, Delta"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use paste::paste;

    macro_rules! test_stationary_kernel {
        ($kernel:ident, $expected:expr) => {
            paste! {
                #[test]
                fn [<test_kernel_ $kernel:lower>]() {
                    let x = array![[0., 0.], [1., 0.]];
                    let y = array![[0., 0.], [0., 2.], [3., 4.]];
                    let k = Kernel::new($kernel);
                    let m = k.matrix(&x, &y).unwrap();
                    let value: fn(f64) -> f64 = $expected;
                    let expected = pairwise_sq_distances(&x, &y).unwrap().mapv(|r2| value(r2.sqrt()));
                    assert_abs_diff_eq!(m, expected, epsilon = 1e-12);
                    assert_abs_diff_eq!(k.matrix(&x, &x).unwrap().diag().to_owned(), array![1., 1.], epsilon = 1e-12);
                    assert!(k.stationary());
                    assert_eq!(k.var(), 1.);
                }
            }
        };
    }

    test_stationary_kernel!(SquaredExponential, |r| (-0.5 * r * r).exp());
    test_stationary_kernel!(AbsoluteExponential, |r| (-r).exp());
    test_stationary_kernel!(Matern32, |r| (1. + 3f64.sqrt() * r) * (-(3f64.sqrt()) * r).exp());
    test_stationary_kernel!(Matern52, |r| {
        (1. + 5f64.sqrt() * r + 5. * r * r / 3.) * (-(5f64.sqrt()) * r).exp()
    });

    #[test]
    fn test_rational_quadratic() {
        let x = array![[0.], [1.]];
        let k = Kernel::new(RationalQuadratic::new(2.).unwrap());
        assert_abs_diff_eq!(
            k.matrix(&x, &x).unwrap(),
            array![[1., 1.25f64.powf(-2.)], [1.25f64.powf(-2.), 1.]],
            epsilon = 1e-12
        );
        assert_eq!(format!("{k}"), "RQ(2)");
        assert!(RationalQuadratic::new(0.).is_err());
    }

    #[test]
    fn test_linear_delta_constants() {
        let x = array![[1., 2.], [3., 4.]];
        let y = array![[1., 2.], [0., 1.], [3., 4.]];
        assert_abs_diff_eq!(
            Kernel::new(Linear).matrix(&x, &y).unwrap(),
            array![[5., 2., 11.], [11., 4., 25.]]
        );
        assert_abs_diff_eq!(
            Kernel::new(Delta).matrix(&x, &y).unwrap(),
            array![[1., 0., 0.], [0., 0., 1.]]
        );
        let dup = array![[1., 2.], [1., 2.]];
        let cache = Cache::new();
        assert_eq!(
            Kernel::new(Delta).structured(&dup, &cache).unwrap().structure(),
            gpgraph_spd::Structure::Dense
        );
        assert_abs_diff_eq!(Kernel::zero().matrix(&x, &y).unwrap(), Array2::zeros((2, 3)));
        assert_abs_diff_eq!(Kernel::one().matrix(&x, &y).unwrap(), Array2::ones((2, 3)));
        assert_eq!(
            Kernel::one().structured(&y, &cache).unwrap().structure(),
            gpgraph_spd::Structure::LowRank
        );
    }

    #[test]
    fn test_kernel_from_str() {
        assert_eq!(format!("{}", Kernel::try_from("EQ").unwrap()), "EQ()");
        assert_eq!(format!("{}", Kernel::try_from("Exp").unwrap()), "Exp()");
        assert!(Kernel::try_from("Foo").is_err());
        assert_eq!(format!("{}", Kernel::try_from("RQ").unwrap()), "RQ(1)");
        assert_eq!(format!("{}", Kernel::try_from("RQ(0.5)").unwrap()), "RQ(0.5)");
        assert!(Kernel::try_from("RQ(abc)").is_err());
        assert!(Kernel::try_from("RQ(-1)").is_err());
    }

    fn central_difference(k: &Kernel, x: &Array2<f64>, y: &Array2<f64>, i: usize, j: usize) -> Array2<f64> {
        let h = 1e-4;
        let bump = |a: &Array2<f64>, d: usize, s: f64| {
            let mut b = a.to_owned();
            b.column_mut(d).mapv_inplace(|v| v + s);
            b
        };
        let m = |a: &Array2<f64>, b: &Array2<f64>| k.matrix(a, b).unwrap();
        (m(&bump(x, i, h), &bump(y, j, h)) - m(&bump(x, i, h), &bump(y, j, -h))
            - m(&bump(x, i, -h), &bump(y, j, h))
            + m(&bump(x, i, -h), &bump(y, j, -h)))
            / (4. * h * h)
    }

    #[test]
    fn test_closed_form_derivatives() {
        let x = array![[0., 0.5], [1., -0.3], [0.2, 0.1]];
        let y = array![[0.4, 0.], [1.1, -0.2], [-1., 2.]];
        let cache = Cache::new();
        let kernels = [
            Kernel::new(SquaredExponential),
            Kernel::new(Matern52),
            Kernel::new(RationalQuadratic::new(0.7).unwrap()),
            Kernel::new(Linear),
        ];
        for k in kernels.iter() {
            assert!(k.has_derivative());
            for (i, j) in [(0, 0), (0, 1), (1, 1)] {
                let analytic = k.partial(&x, &y, Some(i), Some(j), &cache).unwrap();
                assert_abs_diff_eq!(analytic, central_difference(k, &x, &y, i, j), epsilon = 1e-5);
                let elwise = k.partial_elwise(&x, &y, Some(i), Some(j), &cache).unwrap();
                assert_abs_diff_eq!(elwise, analytic.diag().to_owned(), epsilon = 1e-12);
            }
        }
        // derivative variances at zero distance
        for (k, var) in [(Kernel::new(Matern32), 3.), (Kernel::new(Matern52), 5. / 3.)] {
            let d = k.partial_elwise(&x, &x, Some(0), Some(0), &cache).unwrap();
            assert_abs_diff_eq!(d, Array1::from_elem(3, var), epsilon = 1e-12);
            let d = k.partial_elwise(&x, &x, Some(0), Some(1), &cache).unwrap();
            assert_abs_diff_eq!(d, Array1::<f64>::zeros(3), epsilon = 1e-12);
        }
        assert!(!Kernel::new(AbsoluteExponential).has_derivative());
        assert!(Kernel::new(SquaredExponential).partial(&x, &y, Some(2), None, &cache).is_err());
    }
}
