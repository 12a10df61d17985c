//! Oxygen-hemoglobin binding curve.
//!
//! Uses a Hill-type equilibrium curve `S(p) = p^n / (p^n + p50^n)` which is
//! an improvement over plain Michaelis-Menten kinetics for cooperative
//! binding. Typical parameters for the microcirculation: n ~ 2-2.7,
//! P50 ~ 27-38 mmHg.
//!
//! References:
//! - Hill AV. J Physiol. 1910;40:iv-vii (original Hill equation)
//! - Pries AR, Secomb TW. Microcirculation handbook chapters on blood O2
//!   transport (Hill-curve usage for network simulations)

/// Hill-type oxygen saturation curve with cached curvature bound.
///
/// The maximum magnitude of d²S/dp² over the physiological range is
/// precomputed at construction; the implicit axial integrator uses it as a
/// stability hint. Rebuild the curve whenever the underlying parameters
/// change.
#[derive(Debug, Clone)]
pub struct SaturationCurve {
    /// Hill exponent n (cooperativity)
    pub exponent: f64,
    /// Partial pressure at 50% saturation (mmHg)
    pub p50_mmHg: f64,
    /// Cached max |d²S/dp²| over p >= 0
    ds2_max: f64,
}

impl SaturationCurve {
    /// Build a curve and precompute the curvature bound.
    ///
    /// The extrema of d²S/dp² sit at the roots of d³S/dp³ = 0, which for
    /// the Hill curve family are available in closed form:
    /// `mu^n = (2n² - 2 ± sqrt(3n⁴ - 3n²)) / (n² + 3n + 2)` with `mu = p/p50`.
    pub fn new(exponent: f64, p50_mmHg: f64) -> Self {
        let mut curve = Self {
            exponent,
            p50_mmHg,
            ds2_max: 0.0,
        };

        let n = exponent;
        let t1 = 2.0 * n * n - 2.0;
        let t2 = (3.0 * n * n * n * n - 3.0 * n * n).max(0.0).sqrt();
        let t3 = n * n + 3.0 * n + 2.0;
        let mut ds2_max: f64 = 0.0;
        for root in [(t1 + t2) / t3, (t1 - t2) / t3] {
            if root <= 0.0 {
                continue;
            }
            let p = root.powf(1.0 / n) * p50_mmHg;
            let (_, _, d2) = curve.diff_saturation2(p);
            ds2_max = ds2_max.max(d2.abs());
        }
        curve.ds2_max = ds2_max;
        curve
    }

    /// Saturation S(p), bounded in [0, 1). Defined as 0 for p <= 0.
    pub fn saturation(&self, p: f64) -> f64 {
        if p <= 0.0 {
            return 0.0;
        }
        let mun = (p / self.p50_mmHg).powf(self.exponent);
        mun / (mun + 1.0)
    }

    /// Saturation and its first derivative dS/dp (per mmHg).
    pub fn diff_saturation(&self, p: f64) -> (f64, f64) {
        if p <= 0.0 {
            return (0.0, 0.0);
        }
        let n = self.exponent;
        let mu = p / self.p50_mmHg;
        let mun = mu.powf(n);
        let mun_1 = mu.powf(n - 1.0);
        let denom = mun + 1.0;
        let s = mun / denom;
        let ds = n * mun_1 / (denom * denom) / self.p50_mmHg;
        (s, ds)
    }

    /// Saturation with first and second derivatives.
    pub fn diff_saturation2(&self, p: f64) -> (f64, f64, f64) {
        if p <= 0.0 {
            return (0.0, 0.0, 0.0);
        }
        let n = self.exponent;
        let mu = p / self.p50_mmHg;
        let mun = mu.powf(n);
        let mun_1 = mu.powf(n - 1.0);
        let mun_2 = mu.powf(n - 2.0);
        let denom = mun + 1.0;
        let s = mun / denom;
        let ds = n * mun_1 / (denom * denom) / self.p50_mmHg;
        let d2s = n * mun_2 * ((n - 1.0) - (n + 1.0) * mun)
            / (denom * denom * denom)
            / (self.p50_mmHg * self.p50_mmHg);
        (s, ds, d2s)
    }

    /// Upper bound on |d²S/dp²|, cached at construction.
    pub fn max_curvature(&self) -> f64 {
        self.ds2_max
    }
}
