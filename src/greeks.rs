//! Black-Scholes pricing, Greeks and implied volatility.
//!
//! Pure functions, no shared state. Prices use continuous dividend yield
//! `q`; all rates are annualized, `t` is in years. Inputs that would
//! produce NaN or infinity (t <= 0, sigma <= 0) fall back to intrinsic
//! value with zeroed time-sensitive Greeks.

use statrs::distribution::{Continuous, ContinuousCDF, Normal};

use crate::models::OptionType;

pub const IV_LOWER_BOUND: f64 = 1e-4;
pub const IV_UPPER_BOUND: f64 = 5.0;
const IV_MAX_ITERATIONS: usize = 100;
const IV_TOLERANCE: f64 = 1e-8;

fn standard_normal() -> Normal {
    // Unit normal construction cannot fail.
    Normal::new(0.0, 1.0).expect("unit normal")
}

fn d1_d2(spot: f64, strike: f64, t: f64, sigma: f64, rate: f64, div_yield: f64) -> (f64, f64) {
    let vol_sqrt_t = sigma * t.sqrt();
    let d1 = ((spot / strike).ln() + (rate - div_yield + 0.5 * sigma * sigma) * t) / vol_sqrt_t;
    (d1, d1 - vol_sqrt_t)
}

fn intrinsic(spot: f64, strike: f64, option_type: OptionType) -> f64 {
    match option_type {
        OptionType::Ce => (spot - strike).max(0.0),
        OptionType::Pe => (strike - spot).max(0.0),
    }
}

/// Black-Scholes price. `t = 0` (or degenerate vol) returns intrinsic
/// value rather than NaN.
pub fn price(
    spot: f64,
    strike: f64,
    t: f64,
    sigma: f64,
    rate: f64,
    div_yield: f64,
    option_type: OptionType,
) -> f64 {
    if t <= 0.0 || sigma <= 0.0 || spot <= 0.0 || strike <= 0.0 {
        return intrinsic(spot, strike, option_type);
    }
    let n = standard_normal();
    let (d1, d2) = d1_d2(spot, strike, t, sigma, rate, div_yield);
    let df_spot = spot * (-div_yield * t).exp();
    let df_strike = strike * (-rate * t).exp();
    match option_type {
        OptionType::Ce => df_spot * n.cdf(d1) - df_strike * n.cdf(d2),
        OptionType::Pe => df_strike * n.cdf(-d2) - df_spot * n.cdf(-d1),
    }
}

/// Spot sensitivity. At expiry this degenerates to the intrinsic
/// indicator (0/1 for calls, -1/0 for puts).
pub fn delta(
    spot: f64,
    strike: f64,
    t: f64,
    sigma: f64,
    rate: f64,
    div_yield: f64,
    option_type: OptionType,
) -> f64 {
    if t <= 0.0 || sigma <= 0.0 || spot <= 0.0 || strike <= 0.0 {
        return match option_type {
            OptionType::Ce => {
                if spot > strike {
                    1.0
                } else {
                    0.0
                }
            }
            OptionType::Pe => {
                if spot < strike {
                    -1.0
                } else {
                    0.0
                }
            }
        };
    }
    let n = standard_normal();
    let (d1, _) = d1_d2(spot, strike, t, sigma, rate, div_yield);
    let decay = (-div_yield * t).exp();
    match option_type {
        OptionType::Ce => decay * n.cdf(d1),
        OptionType::Pe => decay * (n.cdf(d1) - 1.0),
    }
}

/// Delta sensitivity to spot; identical for calls and puts.
pub fn gamma(spot: f64, strike: f64, t: f64, sigma: f64, rate: f64, div_yield: f64) -> f64 {
    if t <= 0.0 || sigma <= 0.0 || spot <= 0.0 || strike <= 0.0 {
        return 0.0;
    }
    let n = standard_normal();
    let (d1, _) = d1_d2(spot, strike, t, sigma, rate, div_yield);
    (-div_yield * t).exp() * n.pdf(d1) / (spot * sigma * t.sqrt())
}

/// Annualized time decay. The put/call relation
/// `theta_put = theta_call + r*K*e^(-rt) - q*S*e^(-qt)` holds by
/// construction.
pub fn theta(
    spot: f64,
    strike: f64,
    t: f64,
    sigma: f64,
    rate: f64,
    div_yield: f64,
    option_type: OptionType,
) -> f64 {
    if t <= 0.0 || sigma <= 0.0 || spot <= 0.0 || strike <= 0.0 {
        return 0.0;
    }
    let n = standard_normal();
    let (d1, d2) = d1_d2(spot, strike, t, sigma, rate, div_yield);
    let df_spot = spot * (-div_yield * t).exp();
    let df_strike = strike * (-rate * t).exp();
    let decay_term = -df_spot * n.pdf(d1) * sigma / (2.0 * t.sqrt());
    match option_type {
        OptionType::Ce => decay_term - rate * df_strike * n.cdf(d2) + div_yield * df_spot * n.cdf(d1),
        OptionType::Pe => decay_term + rate * df_strike * n.cdf(-d2) - div_yield * df_spot * n.cdf(-d1),
    }
}

/// Volatility sensitivity per unit of vol; identical for calls and puts.
pub fn vega(spot: f64, strike: f64, t: f64, sigma: f64, rate: f64, div_yield: f64) -> f64 {
    if t <= 0.0 || sigma <= 0.0 || spot <= 0.0 || strike <= 0.0 {
        return 0.0;
    }
    let n = standard_normal();
    let (d1, _) = d1_d2(spot, strike, t, sigma, rate, div_yield);
    spot * (-div_yield * t).exp() * n.pdf(d1) * t.sqrt()
}

/// Implied volatility by Brent root-finding on `price(sigma) - market`.
///
/// Returns `None` when the market price does not bracket inside
/// `[IV_LOWER_BOUND, IV_UPPER_BOUND]` (e.g. price at or below intrinsic)
/// or the iteration budget is exhausted. Callers map `None` to the
/// configured failure value (0.0 in this deployment).
pub fn implied_vol(
    market_price: f64,
    spot: f64,
    strike: f64,
    t: f64,
    rate: f64,
    div_yield: f64,
    option_type: OptionType,
) -> Option<f64> {
    if !market_price.is_finite() || market_price <= 0.0 || t <= 0.0 {
        return None;
    }

    let objective =
        |sigma: f64| price(spot, strike, t, sigma, rate, div_yield, option_type) - market_price;

    let mut a = IV_LOWER_BOUND;
    let mut b = IV_UPPER_BOUND;
    let mut fa = objective(a);
    let mut fb = objective(b);

    if fa == 0.0 {
        return Some(a);
    }
    if fb == 0.0 {
        return Some(b);
    }
    if fa * fb > 0.0 {
        // Not bracketed: market price below intrinsic or above the
        // sigma-cap price.
        return None;
    }

    // Brent's method: inverse quadratic / secant with bisection fallback.
    let mut c = a;
    let mut fc = fa;
    let mut d = b - a;
    let mut e = d;

    for _ in 0..IV_MAX_ITERATIONS {
        if fb.abs() > fc.abs() {
            a = b;
            b = c;
            c = a;
            fa = fb;
            fb = fc;
            fc = fa;
        }

        let tol = 2.0 * f64::EPSILON * b.abs() + 0.5 * IV_TOLERANCE;
        let m = 0.5 * (c - b);

        if m.abs() <= tol || fb == 0.0 {
            return Some(b);
        }

        if e.abs() < tol || fa.abs() <= fb.abs() {
            d = m;
            e = m;
        } else {
            let s = fb / fa;
            let (mut p, mut q) = if a == c {
                // Secant step.
                (2.0 * m * s, 1.0 - s)
            } else {
                // Inverse quadratic interpolation.
                let q = fa / fc;
                let r = fb / fc;
                (
                    s * (2.0 * m * q * (q - r) - (b - a) * (r - 1.0)),
                    (q - 1.0) * (r - 1.0) * (s - 1.0),
                )
            };
            if p > 0.0 {
                q = -q;
            }
            p = p.abs();

            if 2.0 * p < (3.0 * m * q - (tol * q).abs()).min((e * q).abs()) {
                e = d;
                d = p / q;
            } else {
                d = m;
                e = m;
            }
        }

        a = b;
        fa = fb;
        b += if d.abs() > tol {
            d
        } else if m > 0.0 {
            tol
        } else {
            -tol
        };
        fb = objective(b);

        if (fb > 0.0) == (fc > 0.0) {
            c = a;
            fc = fa;
            d = b - a;
            e = d;
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const S: f64 = 24_000.0;
    const K: f64 = 24_000.0;
    const T: f64 = 30.0 / 365.0;
    const R: f64 = 0.10;
    const Q: f64 = 0.0;
    const SIGMA: f64 = 0.15;

    #[test]
    fn test_put_call_parity_atm() {
        let call = price(S, K, T, SIGMA, R, Q, OptionType::Ce);
        let put = price(S, K, T, SIGMA, R, Q, OptionType::Pe);
        let forward = S * (-Q * T).exp() - K * (-R * T).exp();
        assert!(((call - put - forward) / K).abs() <= 0.01);
    }

    #[test]
    fn test_parity_holds_across_strikes() {
        for strike in [20_000.0, 22_500.0, 24_000.0, 26_000.0] {
            let call = price(S, strike, T, SIGMA, R, Q, OptionType::Ce);
            let put = price(S, strike, T, SIGMA, R, Q, OptionType::Pe);
            let forward = S - strike * (-R * T).exp();
            assert!(
                ((call - put - forward) / strike).abs() <= 0.01,
                "parity violated at strike {strike}"
            );
        }
    }

    #[test]
    fn test_greek_ranges_for_valid_inputs() {
        let delta_call = delta(S, K, T, SIGMA, R, Q, OptionType::Ce);
        let delta_put = delta(S, K, T, SIGMA, R, Q, OptionType::Pe);
        assert!((0.0..=1.0).contains(&delta_call));
        assert!((-1.0..=0.0).contains(&delta_put));
        assert!(gamma(S, K, T, SIGMA, R, Q) >= 0.0);
        assert!(vega(S, K, T, SIGMA, R, Q) >= 0.0);
        assert!(theta(S, K, T, SIGMA, R, Q, OptionType::Ce) <= 0.0);
    }

    #[test]
    fn test_theta_put_call_relation() {
        let theta_call = theta(S, K, T, SIGMA, R, Q, OptionType::Ce);
        let theta_put = theta(S, K, T, SIGMA, R, Q, OptionType::Pe);
        let expected = theta_call + R * K * (-R * T).exp() - Q * S * (-Q * T).exp();
        assert!((theta_put - expected).abs() < 1e-6);
    }

    #[test]
    fn test_gamma_vega_same_for_call_and_put() {
        // Closed forms are side-independent; exercise both moneyness sides.
        for strike in [23_000.0, 25_000.0] {
            let g = gamma(S, strike, T, SIGMA, R, Q);
            let v = vega(S, strike, T, SIGMA, R, Q);
            assert!(g > 0.0 && v > 0.0);
        }
    }

    #[test]
    fn test_expiry_boundary_returns_intrinsic() {
        assert_eq!(price(24_500.0, K, 0.0, SIGMA, R, Q, OptionType::Ce), 500.0);
        assert_eq!(price(23_500.0, K, 0.0, SIGMA, R, Q, OptionType::Ce), 0.0);
        assert_eq!(price(23_500.0, K, 0.0, SIGMA, R, Q, OptionType::Pe), 500.0);
        assert_eq!(theta(S, K, 0.0, SIGMA, R, Q, OptionType::Ce), 0.0);
        assert_eq!(vega(S, K, 0.0, SIGMA, R, Q), 0.0);
    }

    #[test]
    fn test_deep_itm_call_delta_approaches_one() {
        let d = delta(S * 100.0, K, T, SIGMA, R, Q, OptionType::Ce);
        assert!(d > 0.999);
        let g = gamma(S * 100.0, K, T, SIGMA, R, Q);
        assert!(g < 1e-9);
    }

    #[test]
    fn test_implied_vol_round_trip() {
        for sigma in [0.05, 0.10, 0.25, 0.50, 1.0] {
            for t in [1.0 / 365.0, 30.0 / 365.0, 1.0] {
                let market = price(S, K, t, sigma, R, Q, OptionType::Ce);
                let iv = implied_vol(market, S, K, t, R, Q, OptionType::Ce)
                    .expect("bracketed root");
                assert!(
                    (iv - sigma).abs() < 1e-3,
                    "sigma {sigma} t {t} recovered {iv}"
                );
            }
        }
    }

    #[test]
    fn test_implied_vol_rejects_price_below_intrinsic() {
        // Deep ITM call priced below intrinsic has no solution.
        let below_intrinsic = (S - 20_000.0) * 0.5;
        assert!(implied_vol(below_intrinsic, S, 20_000.0, T, R, Q, OptionType::Ce).is_none());
    }

    #[test]
    fn test_implied_vol_terminates_on_garbage() {
        assert!(implied_vol(f64::NAN, S, K, T, R, Q, OptionType::Ce).is_none());
        assert!(implied_vol(-5.0, S, K, T, R, Q, OptionType::Ce).is_none());
        assert!(implied_vol(100.0, S, K, 0.0, R, Q, OptionType::Ce).is_none());
    }
}
