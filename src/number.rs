// ABOUTME: Fixed-precision decimal numbers with a NaN lane for the Slug runtime

use bigdecimal::{BigDecimal, RoundingMode};
use num_traits::{Signed, ToPrimitive, Zero};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::num::NonZeroU64;
use std::str::FromStr;

/// Significant digits kept when a division does not terminate.
const DIV_PRECISION: u64 = 14;

/// A Slug number: an arbitrary-precision signed decimal, or NaN.
///
/// NaN is sticky: any arithmetic involving NaN yields NaN, and every
/// comparison involving NaN is false (including `NaN == NaN`).
#[derive(Debug, Clone)]
pub enum Number {
    Dec(BigDecimal),
    NaN,
}

impl Number {
    pub fn from_i64(n: i64) -> Self {
        Number::Dec(BigDecimal::from(n))
    }

    pub fn zero() -> Self {
        Number::Dec(BigDecimal::zero())
    }

    /// Parse a decimal literal (`42`, `-1.5`) or hex literal (`0xFF`).
    /// Unparseable input collapses to NaN.
    pub fn parse(text: &str) -> Self {
        if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
            return match i128::from_str_radix(hex, 16) {
                Ok(n) => Number::Dec(BigDecimal::from(n)),
                Err(_) => Number::NaN,
            };
        }
        match BigDecimal::from_str(text) {
            Ok(d) => Number::Dec(d),
            Err(_) => Number::NaN,
        }
    }

    pub fn is_nan(&self) -> bool {
        matches!(self, Number::NaN)
    }

    pub fn is_zero(&self) -> bool {
        matches!(self, Number::Dec(d) if d.is_zero())
    }

    pub fn is_integer(&self) -> bool {
        matches!(self, Number::Dec(d) if d.is_integer())
    }

    /// The integral part, truncated toward zero.
    pub fn trunc(&self) -> Number {
        match self {
            Number::Dec(d) => Number::Dec(d.with_scale_round(0, RoundingMode::Down)),
            Number::NaN => Number::NaN,
        }
    }

    /// Convert to i64 if the value is integral and in range; otherwise None.
    pub fn to_i64(&self) -> Option<i64> {
        match self {
            Number::Dec(d) if d.is_integer() => d.to_i64(),
            _ => None,
        }
    }

    /// Convert to a non-negative index.
    pub fn to_index(&self) -> Option<usize> {
        self.to_i64().and_then(|n| usize::try_from(n).ok())
    }

    pub fn add(&self, other: &Number) -> Number {
        match (self, other) {
            (Number::Dec(a), Number::Dec(b)) => Number::Dec(a + b),
            _ => Number::NaN,
        }
    }

    pub fn sub(&self, other: &Number) -> Number {
        match (self, other) {
            (Number::Dec(a), Number::Dec(b)) => Number::Dec(a - b),
            _ => Number::NaN,
        }
    }

    pub fn mul(&self, other: &Number) -> Number {
        match (self, other) {
            (Number::Dec(a), Number::Dec(b)) => Number::Dec(a * b),
            _ => Number::NaN,
        }
    }

    /// Division by zero yields NaN. Non-terminating quotients round to
    /// fourteen significant digits, half-even; exact quotients are kept.
    pub fn div(&self, other: &Number) -> Number {
        match (self, other) {
            (Number::Dec(a), Number::Dec(b)) => {
                if b.is_zero() {
                    return Number::NaN;
                }
                let q = a / b;
                if &(&q * b) == a {
                    Number::Dec(q)
                } else {
                    let prec = NonZeroU64::new(DIV_PRECISION).unwrap();
                    Number::Dec(q.with_precision_round(prec, RoundingMode::HalfEven))
                }
            }
            _ => Number::NaN,
        }
    }

    pub fn rem(&self, other: &Number) -> Number {
        match (self, other) {
            (Number::Dec(a), Number::Dec(b)) => {
                if b.is_zero() {
                    return Number::NaN;
                }
                Number::Dec(a % b)
            }
            _ => Number::NaN,
        }
    }

    pub fn neg(&self) -> Number {
        match self {
            Number::Dec(d) => Number::Dec(-d),
            Number::NaN => Number::NaN,
        }
    }

    fn bitwise<F>(&self, other: &Number, f: F) -> Number
    where
        F: Fn(i64, i64) -> Option<i64>,
    {
        match (self.to_i64(), other.to_i64()) {
            (Some(a), Some(b)) => match f(a, b) {
                Some(r) => Number::from_i64(r),
                None => Number::NaN,
            },
            _ => Number::NaN,
        }
    }

    pub fn bit_and(&self, other: &Number) -> Number {
        self.bitwise(other, |a, b| Some(a & b))
    }

    pub fn bit_or(&self, other: &Number) -> Number {
        self.bitwise(other, |a, b| Some(a | b))
    }

    pub fn bit_xor(&self, other: &Number) -> Number {
        self.bitwise(other, |a, b| Some(a ^ b))
    }

    /// Shifts that overflow the 64-bit coefficient collapse to NaN.
    pub fn shl(&self, other: &Number) -> Number {
        self.bitwise(other, |a, b| {
            let shift = u32::try_from(b).ok()?;
            a.checked_shl(shift).filter(|r| (r >> shift) == a)
        })
    }

    pub fn shr(&self, other: &Number) -> Number {
        self.bitwise(other, |a, b| {
            let shift = u32::try_from(b).ok()?;
            a.checked_shr(shift)
        })
    }

    pub fn bit_not(&self) -> Number {
        match self.to_i64() {
            Some(a) => Number::from_i64(!a),
            None => Number::NaN,
        }
    }

    pub fn eq(&self, other: &Number) -> bool {
        match (self, other) {
            (Number::Dec(a), Number::Dec(b)) => a == b,
            _ => false,
        }
    }

    pub fn cmp(&self, other: &Number) -> Option<Ordering> {
        match (self, other) {
            (Number::Dec(a), Number::Dec(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    /// Hash of the integral part only. Equal numbers produce equal hashes;
    /// `1` and `1.5` may collide, which map lookups tolerate.
    pub fn integral_hash(&self) -> u64 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        match self {
            Number::NaN => "NaN".hash(&mut hasher),
            Number::Dec(_) => match self.trunc() {
                Number::Dec(t) => t.normalized().to_string().hash(&mut hasher),
                Number::NaN => "NaN".hash(&mut hasher),
            },
        }
        hasher.finish()
    }
}

/// Structural equality, used for AST comparison: `NaN` equals `NaN` here.
/// Language-level equality goes through [`Number::eq`], where it does not.
impl PartialEq for Number {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Number::Dec(a), Number::Dec(b)) => a == b,
            (Number::NaN, Number::NaN) => true,
            _ => false,
        }
    }
}

impl fmt::Display for Number {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Number::NaN => write!(f, "NaN"),
            Number::Dec(d) => {
                let n = d.normalized();
                if n.is_negative() && n.is_zero() {
                    write!(f, "0")
                } else {
                    write!(f, "{}", n)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn num(s: &str) -> Number {
        Number::parse(s)
    }

    #[test]
    fn test_parse_and_display() {
        assert_eq!(num("42").to_string(), "42");
        assert_eq!(num("-1.50").to_string(), "-1.5");
        assert_eq!(num("0xFF").to_string(), "255");
        assert!(num("bogus").is_nan());
    }

    #[test]
    fn test_arithmetic() {
        assert!(num("2").add(&num("3")).eq(&num("5")));
        assert!(num("10").sub(&num("4")).eq(&num("6")));
        assert!(num("6").mul(&num("7")).eq(&num("42")));
        assert!(num("20").div(&num("4")).eq(&num("5")));
        assert!(num("17").rem(&num("5")).eq(&num("2")));
    }

    #[test]
    fn test_division_by_zero_is_nan() {
        assert!(num("1").div(&num("0")).is_nan());
        assert!(num("1").rem(&num("0")).is_nan());
    }

    #[test]
    fn test_division_rounds_half_even() {
        // 1/3 rounds to 14 significant digits
        let third = num("1").div(&num("3"));
        assert_eq!(third.to_string(), "0.33333333333333");
        // exact quotients keep all digits
        assert_eq!(num("1").div(&num("8")).to_string(), "0.125");
    }

    #[test]
    fn test_nan_is_sticky_and_unequal() {
        let nan = Number::NaN;
        assert!(nan.add(&num("1")).is_nan());
        assert!(!nan.eq(&nan));
        assert!(nan.cmp(&num("1")).is_none());
    }

    #[test]
    fn test_bitwise_on_integral() {
        assert!(num("12").bit_and(&num("10")).eq(&num("8")));
        assert!(num("12").bit_or(&num("10")).eq(&num("14")));
        assert!(num("12").bit_xor(&num("10")).eq(&num("6")));
        assert!(num("1").shl(&num("4")).eq(&num("16")));
        assert!(num("16").shr(&num("4")).eq(&num("1")));
        assert!(num("0").bit_not().eq(&num("-1")));
    }

    #[test]
    fn test_bitwise_overflow_collapses_to_nan() {
        assert!(num("1").shl(&num("200")).is_nan());
        assert!(num("1.5").bit_and(&num("1")).is_nan());
        // larger than i64 coefficient
        assert!(num("99999999999999999999999999").bit_or(&num("1")).is_nan());
    }

    #[test]
    fn test_integral_hash_matches_equal_values() {
        assert_eq!(num("3").integral_hash(), num("3.0").integral_hash());
        assert_eq!(num("3.9").integral_hash(), num("3.1").integral_hash());
        assert_ne!(num("3").integral_hash(), num("4").integral_hash());
    }

    #[test]
    fn test_factorial_stays_exact() {
        let mut acc = num("1");
        for i in 1..=30i64 {
            acc = acc.mul(&Number::from_i64(i));
        }
        assert_eq!(acc.to_string(), "265252859812191058636308480000000");
    }
}
