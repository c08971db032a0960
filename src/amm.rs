//! Virtual liquidity curve for quoting cross-chain swaps.
//!
//! The router treats each swap pool as a single weighted curve over the
//! 18-decimal-normalized balances it holds on every member chain. The curve
//! is a constant sum softened by an amplified product term: swaps preserve
//!
//! `D = Σ B_k + A · Π B_k`
//!
//! With `A = 0` the curve is pure constant sum (1:1 stable quote); larger
//! `A` penalizes trades that unbalance the pool. All arithmetic is `U256`
//! fixed point at 1e18 scale with floor division.

use ethers::types::U256;

use crate::error::{RouterError, RouterResult};

/// 1e18 fixed-point scale.
pub fn scale() -> U256 {
    U256::exp10(18)
}

/// Inputs for a quote. Balances must already be normalized via
/// [`normalize`] (18 decimals, weight applied).
#[derive(Debug, Clone)]
pub struct SwapQuote<'a> {
    /// Raw input amount in sending-asset units.
    pub amount_in: U256,
    pub input_decimals: u8,
    pub output_decimals: u8,
    pub balances: &'a [U256],
    pub sending_index: usize,
    pub receiving_index: usize,
    pub input_weight: u32,
    pub output_weight: u32,
    /// Maximum tolerated price impact, 1e18 fixed-point fraction.
    pub max_price_impact_e18: U256,
    pub amplification: u64,
    pub allowed_vamm: bool,
}

/// Normalize a raw asset amount to the 18-decimal weighted representation.
pub fn normalize(amount: U256, decimals: u8, weight: u32) -> U256 {
    let weighted = amount * U256::from(weight);
    if decimals <= 18 {
        weighted * U256::exp10((18 - decimals) as usize)
    } else {
        weighted / U256::exp10((decimals - 18) as usize)
    }
}

/// Scale an 18-decimal amount back down to raw asset units.
pub fn denormalize(amount: U256, decimals: u8, weight: u32) -> U256 {
    let unweighted = amount / U256::from(weight);
    if decimals <= 18 {
        unweighted / U256::exp10((18 - decimals) as usize)
    } else {
        unweighted * U256::exp10((decimals - 18) as usize)
    }
}

fn mul_fp(a: U256, b: U256) -> U256 {
    a * b / scale()
}

/// Compute the amount delivered on the receiving side, in receiving-asset
/// units. Fails with `PriceImpactTooHigh` when the effective price moves
/// beyond the configured bound, and `NotEnoughLiquidity` when the pool
/// cannot cover the output.
pub fn amount_received(quote: &SwapQuote<'_>) -> RouterResult<U256> {
    if quote.amount_in.is_zero() {
        return Ok(U256::zero());
    }
    if quote.sending_index == quote.receiving_index
        || quote.sending_index >= quote.balances.len()
        || quote.receiving_index >= quote.balances.len()
    {
        return Err(RouterError::ParamsInvalid {
            message: "swap indices out of range".into(),
        });
    }

    let x = normalize(quote.amount_in, quote.input_decimals, quote.input_weight);
    let b_in = quote.balances[quote.sending_index];
    let b_out = quote.balances[quote.receiving_index];

    // Liquidity shortfalls are reported in raw output-asset units.
    let liquidity_error = || RouterError::NotEnoughLiquidity {
        balance: denormalize(b_out, quote.output_decimals, quote.output_weight).to_string(),
        amount_received: denormalize(x, quote.output_decimals, quote.output_weight).to_string(),
    };

    let out_normalized = if !quote.allowed_vamm && quote.balances.len() == 2 {
        constant_product_out(b_in, b_out, x)
    } else {
        amplified_sum_out(
            quote.balances,
            quote.sending_index,
            quote.receiving_index,
            x,
            quote.amplification,
        )
        .ok_or_else(liquidity_error)?
    };

    if out_normalized > b_out {
        return Err(liquidity_error());
    }

    // Effective price impact: 1 - out/in on normalized values.
    if out_normalized < x {
        let impact = (x - out_normalized) * scale() / x;
        if impact > quote.max_price_impact_e18 {
            return Err(RouterError::PriceImpactTooHigh {
                impact_e18: impact.to_string(),
                max_e18: quote.max_price_impact_e18.to_string(),
            });
        }
    }

    Ok(denormalize(
        out_normalized,
        quote.output_decimals,
        quote.output_weight,
    ))
}

/// Pure constant-product curve, used when virtual-AMM pricing is disabled
/// and the pool is a plain two-asset pair.
fn constant_product_out(b_in: U256, b_out: U256, x: U256) -> U256 {
    b_out * x / (b_in + x)
}

/// Output that preserves `Σ B_k + A · Π B_k`, `None` when the pool cannot
/// cover the trade.
///
/// Only `B_i` and `B_j` move, so with `C = Π_{k≠i,j} B_k` the invariant is
/// linear in the new `B_j` and solves in closed form.
fn amplified_sum_out(balances: &[U256], i: usize, j: usize, x: U256, amplification: u64) -> Option<U256> {
    let a = U256::from(amplification);
    let b_in = balances[i];
    let b_out = balances[j];

    // Fixed-point product of the untouched balances; SCALE when none.
    let mut c = scale();
    for (k, b) in balances.iter().enumerate() {
        if k != i && k != j {
            c = mul_fp(c, *b);
        }
    }

    // numerator = B_i + B_j + A·C·B_i·B_j − (B_i + x)
    let cross = a * mul_fp(c, mul_fp(b_in, b_out));
    let lhs = b_in + b_out + cross;
    let shifted_in = b_in + x;
    let numerator = lhs.checked_sub(shifted_in)?;

    // denominator (fixed point) = 1 + A·C·(B_i + x)
    let denominator = scale() + a * mul_fp(c, shifted_in);

    let new_b_out = numerator * scale() / denominator;

    b_out.checked_sub(new_b_out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn e18(v: u64) -> U256 {
        U256::from(v) * U256::exp10(18)
    }

    fn quote<'a>(balances: &'a [U256], amount_in: U256) -> SwapQuote<'a> {
        SwapQuote {
            amount_in,
            input_decimals: 18,
            output_decimals: 18,
            balances,
            sending_index: 0,
            receiving_index: 1,
            input_weight: 1,
            output_weight: 1,
            max_price_impact_e18: U256::exp10(17), // 0.1
            amplification: 0,
            allowed_vamm: true,
        }
    }

    #[test]
    fn constant_sum_quotes_one_to_one() {
        let balances = [e18(1_000_000), e18(1_000_000)];
        let q = quote(&balances, e18(1_000));
        assert_eq!(amount_received(&q).unwrap(), e18(1_000));
    }

    #[test]
    fn amplification_penalizes_but_stays_positive() {
        let balances = [e18(1_000_000), e18(1_000_000)];
        let mut q = quote(&balances, e18(10_000));
        q.amplification = 85;
        let out = amount_received(&q).unwrap();
        assert!(out > U256::zero());
        assert!(out <= e18(10_000));
    }

    #[test]
    fn output_never_exceeds_pool_balance() {
        let balances = [e18(1_000_000), e18(500)];
        let mut q = quote(&balances, e18(100_000));
        q.amplification = 85;
        q.max_price_impact_e18 = scale(); // disable the impact bound
        match amount_received(&q) {
            Ok(out) => assert!(out <= e18(500)),
            Err(RouterError::NotEnoughLiquidity { .. }) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn price_impact_bound_rejects() {
        // Tiny receiving balance forces a deep price move under the
        // product term.
        let balances = [e18(100), e18(100)];
        let mut q = quote(&balances, e18(90));
        q.amplification = 1_000;
        q.max_price_impact_e18 = U256::exp10(16); // 1%
        let err = amount_received(&q).unwrap_err();
        assert_eq!(err.kind(), "PriceImpactTooHigh");
    }

    #[test]
    fn constant_product_fallback_for_plain_pairs() {
        let balances = [e18(1_000), e18(1_000)];
        let mut q = quote(&balances, e18(100));
        q.allowed_vamm = false;
        q.max_price_impact_e18 = scale();
        // out = 1000 * 100 / 1100
        let expected = e18(1_000) * e18(100) / (e18(1_000) + e18(100));
        assert_eq!(amount_received(&q).unwrap(), expected);
    }

    #[test]
    fn decimal_scaling_round_trips() {
        // 6-decimal input, 6-decimal output, balanced pool: the quote comes
        // back in output units unchanged.
        let balances = [
            normalize(U256::from(1_000_000_000_000u64), 6, 1),
            normalize(U256::from(1_000_000_000_000u64), 6, 1),
        ];
        let mut q = quote(&balances, U256::from(1_000_000u64));
        q.input_decimals = 6;
        q.output_decimals = 6;
        assert_eq!(amount_received(&q).unwrap(), U256::from(1_000_000u64));
    }

    #[test]
    fn zero_input_is_zero_output() {
        let balances = [e18(10), e18(10)];
        let q = quote(&balances, U256::zero());
        assert_eq!(amount_received(&q).unwrap(), U256::zero());
    }

    #[test]
    fn weights_apply_to_normalization() {
        assert_eq!(normalize(U256::from(100u64), 18, 2), U256::from(200u64));
        assert_eq!(denormalize(U256::from(200u64), 18, 2), U256::from(100u64));
    }
}
