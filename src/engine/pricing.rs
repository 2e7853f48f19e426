//! Black-Scholes pricing and implied volatility inversion
//!
//! European pricing with a Newton-Raphson IV solver. The solver is allowed
//! to fail: deep ITM/OTM options with near-zero time value have vanishing
//! vega and no stable inverse, so non-convergence returns `None` and the
//! caller stores a null field.

use std::f64::consts::PI;

const IV_MAX_ITERATIONS: u32 = 100;
const IV_TOLERANCE: f64 = 1e-6;
const IV_INITIAL_GUESS: f64 = 0.20;
const IV_MIN: f64 = 0.001;
const IV_MAX: f64 = 5.0;

/// Standard normal CDF via the error function
fn norm_cdf(x: f64) -> f64 {
    0.5 * (1.0 + erf(x / std::f64::consts::SQRT_2))
}

/// Standard normal PDF
fn norm_pdf(x: f64) -> f64 {
    (-(x * x) / 2.0).exp() / (2.0 * PI).sqrt()
}

/// Error function, Abramowitz & Stegun 7.1.26 (max error < 1.5e-7)
fn erf(x: f64) -> f64 {
    let a1 = 0.254829592;
    let a2 = -0.284496736;
    let a3 = 1.421413741;
    let a4 = -1.453152027;
    let a5 = 1.061405429;
    let p = 0.3275911;

    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();

    let t = 1.0 / (1.0 + p * x);
    let y = 1.0 - (((((a5 * t + a4) * t) + a3) * t + a2) * t + a1) * t * (-x * x).exp();

    sign * y
}

fn d1_d2(spot: f64, strike: f64, time: f64, rate: f64, volatility: f64) -> (f64, f64) {
    let d1 = ((spot / strike).ln() + (rate + volatility * volatility / 2.0) * time)
        / (volatility * time.sqrt());
    let d2 = d1 - volatility * time.sqrt();
    (d1, d2)
}

/// European call price; intrinsic value at or past expiry
pub fn black_scholes_call(spot: f64, strike: f64, time: f64, rate: f64, volatility: f64) -> f64 {
    if time <= 0.0 {
        return (spot - strike).max(0.0);
    }
    let (d1, d2) = d1_d2(spot, strike, time, rate, volatility);
    spot * norm_cdf(d1) - strike * (-rate * time).exp() * norm_cdf(d2)
}

/// European put price; intrinsic value at or past expiry
pub fn black_scholes_put(spot: f64, strike: f64, time: f64, rate: f64, volatility: f64) -> f64 {
    if time <= 0.0 {
        return (strike - spot).max(0.0);
    }
    let (d1, d2) = d1_d2(spot, strike, time, rate, volatility);
    strike * (-rate * time).exp() * norm_cdf(-d2) - spot * norm_cdf(-d1)
}

/// Option side for the IV solver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionSide {
    Call,
    Put,
}

/// Solve for implied volatility by Newton-Raphson iteration.
///
/// Returns `None` when inputs are degenerate or the iteration does not
/// converge within the bounded iteration count.
pub fn implied_volatility(
    market_price: f64,
    spot: f64,
    strike: f64,
    time: f64,
    rate: f64,
    side: OptionSide,
) -> Option<f64> {
    if market_price <= 0.0 || spot <= 0.0 || strike <= 0.0 || time <= 0.0 {
        return None;
    }

    let mut vol = IV_INITIAL_GUESS;

    for _ in 0..IV_MAX_ITERATIONS {
        let price = match side {
            OptionSide::Call => black_scholes_call(spot, strike, time, rate, vol),
            OptionSide::Put => black_scholes_put(spot, strike, time, rate, vol),
        };

        let diff = price - market_price;
        if diff.abs() < IV_TOLERANCE {
            return Some(vol);
        }

        let (d1, _) = d1_d2(spot, strike, time, rate, vol);
        let vega = spot * time.sqrt() * norm_pdf(d1);
        if vega.abs() < 1e-10 {
            return None;
        }

        vol = (vol - diff / vega).clamp(IV_MIN, IV_MAX);
    }

    None
}

/// Intrinsic value of a call at the given spot
pub fn call_intrinsic(spot: f64, strike: f64) -> f64 {
    (spot - strike).max(0.0)
}

/// Intrinsic value of a put at the given spot
pub fn put_intrinsic(spot: f64, strike: f64) -> f64 {
    (strike - spot).max(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_call_parity() {
        // C - P = S - K*e^(-rT)
        let spot = 19500.0;
        let strike = 19500.0;
        let time = 30.0 / 365.0;
        let rate = 0.065;
        let vol = 0.15;

        let call = black_scholes_call(spot, strike, time, rate, vol);
        let put = black_scholes_put(spot, strike, time, rate, vol);
        let expected = spot - strike * (-rate * time).exp();

        assert!((call - put - expected).abs() < 1.0);
    }

    #[test]
    fn test_parity_roundtrip_recovers_call() {
        // Given F = K + C - P, recomputing C from F, K, P returns C
        let strike = 19500.0;
        let call: f64 = 120.0;
        let put = 95.0;

        let synthetic = strike + call - put;
        let recovered_call = synthetic - strike + put;
        assert!((recovered_call - call).abs() < 1e-9);
    }

    #[test]
    fn test_iv_roundtrip() {
        let spot = 19500.0;
        let strike = 19500.0;
        let time = 7.0 / 365.0;
        let rate = 0.065;
        let vol = 0.14;

        let price = black_scholes_call(spot, strike, time, rate, vol);
        let iv = implied_volatility(price, spot, strike, time, rate, OptionSide::Call).unwrap();
        assert!((iv - vol).abs() < 1e-3);

        let put_price = black_scholes_put(spot, strike, time, rate, vol);
        let put_iv =
            implied_volatility(put_price, spot, strike, time, rate, OptionSide::Put).unwrap();
        assert!((put_iv - vol).abs() < 1e-3);
    }

    #[test]
    fn test_iv_degenerate_inputs_return_none() {
        assert!(implied_volatility(0.0, 19500.0, 19500.0, 0.02, 0.065, OptionSide::Call).is_none());
        assert!(
            implied_volatility(120.0, 19500.0, 19500.0, 0.0, 0.065, OptionSide::Call).is_none()
        );
    }

    #[test]
    fn test_iv_deep_itm_near_expiry_does_not_converge() {
        // Price below intrinsic with almost no time value: vega collapses
        let spot = 19500.0;
        let strike = 15000.0;
        let time = 0.5 / 365.0;
        let iv = implied_volatility(4400.0, spot, strike, time, 0.065, OptionSide::Call);
        assert!(iv.is_none());
    }

    #[test]
    fn test_expiry_prices_are_intrinsic() {
        assert_eq!(black_scholes_call(19550.0, 19500.0, 0.0, 0.065, 0.2), 50.0);
        assert_eq!(black_scholes_put(19450.0, 19500.0, 0.0, 0.065, 0.2), 50.0);
        assert_eq!(call_intrinsic(19450.0, 19500.0), 0.0);
        assert_eq!(put_intrinsic(19450.0, 19500.0), 50.0);
    }
}
