#![forbid(unsafe_code)]

//! Sortable sibling keys that support "insert between" without renumbering.
//!
//! Keys are decimal fractions written as `0.<digits>` inside `[0.1, 0.9]`. Normalized
//! keys (no trailing zeros) compare the same way as strings and as numbers, so the
//! backing store can order them with its default collation.
//!
//! Repeated insertion at one extreme grows a key by roughly one digit every few
//! inserts; renumber a relation with [`initial`] to reclaim short keys.

use std::cmp::Ordering;

pub const NEW_RANGE_START: &str = "0.5";
pub const RANGE_BEGIN: &str = "0.1";
pub const RANGE_END: &str = "0.9";

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum OrderKeyError {
    #[error("order key is not of the form 0.<digits>: {key:?}")]
    Malformed { key: String },
    #[error("order key outside [0.1, 0.9]: {key}")]
    OutOfRange { key: String },
    #[error("lower order key is not below upper order key: {lower} >= {upper}")]
    NotIncreasing { lower: String, upper: String },
}

/// Fraction digits after the decimal point, without trailing zeros.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct Fraction(Vec<u8>);

impl Fraction {
    fn parse(key: &str) -> Result<Self, OrderKeyError> {
        let malformed = || OrderKeyError::Malformed {
            key: key.to_string(),
        };
        let digits = key.strip_prefix("0.").ok_or_else(malformed)?;
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(malformed());
        }
        Ok(Self::normalized(digits.bytes().map(|b| b - b'0').collect()))
    }

    fn parse_in_range(key: &str) -> Result<Self, OrderKeyError> {
        let value = Self::parse(key)?;
        if value < Self(vec![1]) || value > Self(vec![9]) {
            return Err(OrderKeyError::OutOfRange {
                key: key.to_string(),
            });
        }
        Ok(value)
    }

    fn normalized(mut digits: Vec<u8>) -> Self {
        while digits.last() == Some(&0) {
            digits.pop();
        }
        Self(digits)
    }

    fn significant_digits(&self) -> usize {
        self.0.len()
    }

    fn padded(&self, len: usize) -> Vec<u8> {
        let mut digits = self.0.clone();
        digits.resize(len.max(digits.len()), 0);
        digits
    }

    /// Exact `(self + other) * 0.5`; assumes the sum is below 2.
    fn midpoint(&self, other: &Self) -> Self {
        let len = self.0.len().max(other.0.len());
        let (a, b) = (self.padded(len), other.padded(len));

        // Sum as an integer scaled by 10^len, with one leading digit for the carry.
        let mut sum = vec![0u8; len + 1];
        let mut carry = 0u8;
        for i in (0..len).rev() {
            let d = a[i] + b[i] + carry;
            sum[i + 1] = d % 10;
            carry = d / 10;
        }
        sum[0] = carry;

        // Times five, then read as len+1 fraction digits.
        let mut carry = 0u8;
        for digit in sum.iter_mut().rev() {
            let d = *digit * 5 + carry;
            *digit = d % 10;
            carry = d / 10;
        }
        debug_assert_eq!(carry, 0);
        Self::normalized(sum)
    }

    fn abs_diff(&self, other: &Self) -> Self {
        let (hi, lo) = if self >= other {
            (self, other)
        } else {
            (other, self)
        };
        let len = hi.0.len().max(lo.0.len());
        let (mut hi, lo) = (hi.padded(len), lo.padded(len));
        let mut borrow = 0u8;
        for i in (0..len).rev() {
            let sub = lo[i] + borrow;
            if hi[i] >= sub {
                hi[i] -= sub;
                borrow = 0;
            } else {
                hi[i] = hi[i] + 10 - sub;
                borrow = 1;
            }
        }
        Self::normalized(hi)
    }

    fn round(&self, places: usize, mode: Rounding) -> Option<Self> {
        if places >= self.0.len() {
            return Some(self.clone());
        }
        let (head, tail) = self.0.split_at(places);
        let first_dropped = tail[0];
        let more_dropped = tail.len() > 1;
        let bump = match mode {
            Rounding::Down => false,
            Rounding::Up => true,
            Rounding::HalfUp => first_dropped >= 5,
            Rounding::HalfEven => match first_dropped.cmp(&5) {
                Ordering::Greater => true,
                Ordering::Less => false,
                Ordering::Equal => more_dropped || head.last().is_some_and(|d| d % 2 == 1),
            },
        };
        let mut digits = head.to_vec();
        if bump {
            let mut i = digits.len();
            loop {
                if i == 0 {
                    // Carried into the integer part.
                    return None;
                }
                i -= 1;
                if digits[i] == 9 {
                    digits[i] = 0;
                } else {
                    digits[i] += 1;
                    break;
                }
            }
        }
        Some(Self::normalized(digits))
    }

    fn to_key(&self) -> String {
        let mut key = String::with_capacity(self.0.len() + 2);
        key.push_str("0.");
        key.extend(self.0.iter().map(|d| char::from(b'0' + d)));
        key
    }
}

#[derive(Clone, Copy, Debug)]
enum Rounding {
    Down,
    HalfUp,
    HalfEven,
    Up,
}

/// `size` increasing keys for a fresh, unordered batch of siblings.
pub fn initial(size: usize) -> Vec<String> {
    let width = size.to_string().len();
    (0..size)
        .map(|i| {
            let digits = format!("5{i:0width$}");
            Fraction::normalized(digits.bytes().map(|b| b - b'0').collect()).to_key()
        })
        .collect()
}

/// A key strictly between `lower` and `upper`; a missing bound is the range edge.
pub fn between(lower: Option<&str>, upper: Option<&str>) -> Result<String, OrderKeyError> {
    if lower.is_none() && upper.is_none() {
        return Ok(NEW_RANGE_START.to_string());
    }
    let lower_key = lower.unwrap_or(RANGE_BEGIN);
    let upper_key = upper.unwrap_or(RANGE_END);
    let a = Fraction::parse_in_range(lower_key)?;
    let b = Fraction::parse_in_range(upper_key)?;
    if a >= b {
        return Err(OrderKeyError::NotIncreasing {
            lower: lower_key.to_string(),
            upper: upper_key.to_string(),
        });
    }

    let mid = a.midpoint(&b);
    let mut candidates = vec![mid.clone()];
    for places in (1..mid.significant_digits()).rev() {
        for mode in [
            Rounding::Down,
            Rounding::HalfUp,
            Rounding::HalfEven,
            Rounding::Up,
        ] {
            candidates.extend(mid.round(places, mode));
        }
    }

    let mut best: Option<(usize, Fraction, Fraction)> = None;
    for candidate in candidates.into_iter().filter(|c| *c > a && *c < b) {
        let digits = candidate.significant_digits();
        let distance = candidate.abs_diff(&mid);
        let better = match &best {
            None => true,
            Some((best_digits, best_distance, _)) => {
                (digits, &distance) < (*best_digits, best_distance)
            }
        };
        if better {
            best = Some((digits, distance, candidate));
        }
    }

    // `mid` itself always lies strictly inside (a, b).
    let (_, _, chosen) = best.unwrap_or((0, Fraction(Vec::new()), mid));
    Ok(chosen.to_key())
}

/// Orders keys with missing keys last.
pub fn compare_order_keys(a: Option<&str>, b: Option<&str>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(a), Some(b)) => a.cmp(b),
    }
}
