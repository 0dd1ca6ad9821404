const MANTISSA_BITS: u32 = 52;
const MANTISSA_MASK: u64 = (1 << MANTISSA_BITS) - 1;
const EXPONENT_MASK: u64 = 0x7ff;
const EXPONENT_BIAS: i32 = 1075;

/// Returns `floor(f * 2^64)` for `f` in `[0, 1)`, computed exactly.
///
/// Multiplying `f` by `u64::MAX as f64` rounds, since a 64-bit float cannot represent every
/// integer in the `u64` range. Instead we decompose `f` into `mantissa * 2^exponent` and shift the
/// mantissa in 128-bit arithmetic, which is exact for every finite input. Values outside `[0, 1)`
/// are clamped: anything not greater than zero (NaN included) gives 0, anything at or above one
/// gives 2^64.
pub(crate) fn scale_fraction_to_u64_range(f: f64) -> u128 {
    if f.is_nan() || f <= 0.0 {
        return 0;
    }
    if f >= 1.0 {
        return 1 << 64;
    }

    let bits = f.to_bits();
    let biased_exponent = ((bits >> MANTISSA_BITS) & EXPONENT_MASK) as i32;
    let (mantissa, exponent) = if biased_exponent == 0 {
        // subnormal
        (bits & MANTISSA_MASK, 1 - EXPONENT_BIAS)
    } else {
        (
            (bits & MANTISSA_MASK) | (1 << MANTISSA_BITS),
            biased_exponent - EXPONENT_BIAS,
        )
    };

    let mantissa = u128::from(mantissa);
    let shift = exponent + 64;
    if shift >= 0 {
        // f < 1 keeps mantissa * 2^shift below 2^64, so this cannot overflow
        mantissa << shift
    } else {
        mantissa.checked_shr(shift.unsigned_abs()).unwrap_or(0)
    }
}
