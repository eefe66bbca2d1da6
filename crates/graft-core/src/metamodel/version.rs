//! Version-value policies for optimistic locking.

use crate::error::{Error, IllegalStateKind, Result, TypeError};
use crate::value::Value;
use std::cmp::Ordering;

/// Source of "now" for timestamp versions.
pub trait VersionContext {
    /// Current time in microseconds since the Unix epoch.
    fn current_timestamp_micros(&self) -> i64;
}

/// Seed and next-value policy of a version-capable attribute type.
///
/// `next` must be deterministic for a given `current` and context, and its
/// result must order strictly after `current` under [`compare`]. A current
/// value with no successor in the type is an error, never a wrap.
///
/// [`compare`]: VersionSupport::compare
pub trait VersionSupport: Send + Sync {
    /// Initial version for a newly saved entity.
    fn seed(&self, ctx: &dyn VersionContext) -> Value;

    /// Version following `current`; null yields the seed.
    fn next(&self, current: &Value, ctx: &dyn VersionContext) -> Result<Value>;

    /// Ordering between two versions of this type.
    fn compare(&self, a: &Value, b: &Value) -> Option<Ordering> {
        match (a.as_i64(), b.as_i64()) {
            (Some(a), Some(b)) => Some(a.cmp(&b)),
            _ => None,
        }
    }

    /// Do two versions denote the same state?
    fn is_same(&self, a: &Value, b: &Value) -> bool {
        match (a.is_null(), b.is_null()) {
            (true, true) => true,
            (false, false) => self
                .compare(a, b)
                .map_or_else(|| a == b, |ordering| ordering == Ordering::Equal),
            _ => false,
        }
    }
}

/// Integer payload of any integral variant.
pub(crate) fn integral(value: &Value) -> Option<i64> {
    match value {
        Value::TinyInt(v) => Some(i64::from(*v)),
        Value::SmallInt(v) => Some(i64::from(*v)),
        Value::Int(v) => Some(i64::from(*v)),
        Value::BigInt(v) => Some(*v),
        _ => None,
    }
}

fn type_mismatch(expected: &'static str, actual: &Value) -> Error {
    Error::Type(TypeError {
        expected,
        actual: actual.type_name().to_string(),
        attribute: None,
    })
}

fn overflow(type_name: &str, current: &Value) -> Error {
    Error::illegal_state(
        IllegalStateKind::VersionOverflow,
        None,
        format!("{type_name} version {current} has no successor"),
    )
}

/// `current + 1`, narrowed back into the counter's type by `make`.
fn next_counter(
    current: &Value,
    type_name: &'static str,
    make: fn(i64) -> Option<Value>,
) -> Result<Value> {
    let value = integral(current).ok_or_else(|| type_mismatch(type_name, current))?;
    value
        .checked_add(1)
        .and_then(make)
        .ok_or_else(|| overflow(type_name, current))
}

/// Counter versions over 16-bit integers.
#[derive(Debug, Default, Clone, Copy)]
pub struct ShortVersion;

impl VersionSupport for ShortVersion {
    fn seed(&self, _ctx: &dyn VersionContext) -> Value {
        Value::SmallInt(1)
    }

    fn next(&self, current: &Value, ctx: &dyn VersionContext) -> Result<Value> {
        if current.is_null() {
            return Ok(self.seed(ctx));
        }
        next_counter(current, "short", |v| i16::try_from(v).ok().map(Value::SmallInt))
    }
}

/// Counter versions over 32-bit integers.
#[derive(Debug, Default, Clone, Copy)]
pub struct IntegerVersion;

impl VersionSupport for IntegerVersion {
    fn seed(&self, _ctx: &dyn VersionContext) -> Value {
        Value::Int(1)
    }

    fn next(&self, current: &Value, ctx: &dyn VersionContext) -> Result<Value> {
        if current.is_null() {
            return Ok(self.seed(ctx));
        }
        next_counter(current, "integer", |v| i32::try_from(v).ok().map(Value::Int))
    }
}

/// Counter versions over 64-bit integers.
#[derive(Debug, Default, Clone, Copy)]
pub struct LongVersion;

impl VersionSupport for LongVersion {
    fn seed(&self, _ctx: &dyn VersionContext) -> Value {
        Value::BigInt(1)
    }

    fn next(&self, current: &Value, ctx: &dyn VersionContext) -> Result<Value> {
        if current.is_null() {
            return Ok(self.seed(ctx));
        }
        next_counter(current, "long", |v| Some(Value::BigInt(v)))
    }
}

/// Timestamp versions (microsecond resolution).
///
/// The next value is the current clock reading, bumped past `current` when
/// the clock has not advanced.
#[derive(Debug, Default, Clone, Copy)]
pub struct TimestampVersion;

impl VersionSupport for TimestampVersion {
    fn seed(&self, ctx: &dyn VersionContext) -> Value {
        Value::Timestamp(ctx.current_timestamp_micros())
    }

    fn next(&self, current: &Value, ctx: &dyn VersionContext) -> Result<Value> {
        let now = ctx.current_timestamp_micros();
        let ts = match current {
            Value::Null => return Ok(Value::Timestamp(now)),
            Value::Timestamp(ts) => *ts,
            other => integral(other).ok_or_else(|| type_mismatch("timestamp", other))?,
        };
        ts.checked_add(1)
            .map(|after| Value::Timestamp(now.max(after)))
            .ok_or_else(|| overflow("timestamp", current))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedClock(i64);

    impl VersionContext for FixedClock {
        fn current_timestamp_micros(&self) -> i64 {
            self.0
        }
    }

    #[test]
    fn test_counters_seed_at_one() {
        let ctx = FixedClock(0);
        assert_eq!(ShortVersion.seed(&ctx), Value::SmallInt(1));
        assert_eq!(IntegerVersion.seed(&ctx), Value::Int(1));
        assert_eq!(LongVersion.seed(&ctx), Value::BigInt(1));
    }

    #[test]
    fn test_counters_increment_strictly() {
        let ctx = FixedClock(0);
        for v in [-10, -1, 0, 1, 41, 10_000] {
            let next = LongVersion.next(&Value::BigInt(v), &ctx).unwrap();
            assert_eq!(
                LongVersion.compare(&next, &Value::BigInt(v)),
                Some(Ordering::Greater)
            );
            let next = IntegerVersion.next(&Value::Int(v as i32), &ctx).unwrap();
            assert_eq!(next, Value::Int(v as i32 + 1));
        }
        assert_eq!(
            ShortVersion.next(&Value::SmallInt(7), &ctx).unwrap(),
            Value::SmallInt(8)
        );
    }

    #[test]
    fn test_counter_next_narrows_wider_integers() {
        let ctx = FixedClock(0);
        assert_eq!(IntegerVersion.next(&Value::BigInt(5), &ctx).unwrap(), Value::Int(6));
        assert_eq!(ShortVersion.next(&Value::Int(2), &ctx).unwrap(), Value::SmallInt(3));
        let err = IntegerVersion.next(&Value::Text("5".into()), &ctx).unwrap_err();
        assert!(matches!(err, Error::Type(ref e) if e.expected == "integer"));
    }

    #[test]
    fn test_counter_overflow_is_an_error() {
        let ctx = FixedClock(0);
        let err = IntegerVersion.next(&Value::Int(i32::MAX), &ctx).unwrap_err();
        assert_eq!(err.illegal_state_kind(), Some(IllegalStateKind::VersionOverflow));
        assert!(ShortVersion.next(&Value::SmallInt(i16::MAX), &ctx).is_err());
        assert!(LongVersion.next(&Value::BigInt(i64::MAX), &ctx).is_err());
        assert!(TimestampVersion.next(&Value::Timestamp(i64::MAX), &ctx).is_err());
    }

    #[test]
    fn test_timestamp_next_orders_after_current_even_when_clock_lags() {
        let ctx = FixedClock(1_000);
        assert_eq!(TimestampVersion.seed(&ctx), Value::Timestamp(1_000));
        for (current, expected) in [(500, 1_000), (1_000, 1_001), (5_000, 5_001)] {
            assert_eq!(
                TimestampVersion.next(&Value::Timestamp(current), &ctx).unwrap(),
                Value::Timestamp(expected)
            );
        }
    }

    #[test]
    fn test_next_of_null_is_seed() {
        let ctx = FixedClock(9);
        assert_eq!(LongVersion.next(&Value::Null, &ctx).unwrap(), Value::BigInt(1));
        assert_eq!(
            TimestampVersion.next(&Value::Null, &ctx).unwrap(),
            Value::Timestamp(9)
        );
    }

    #[test]
    fn test_is_same_compares_numerically() {
        assert!(IntegerVersion.is_same(&Value::Int(1), &Value::BigInt(1)));
        assert!(!IntegerVersion.is_same(&Value::Int(1), &Value::Int(2)));
        assert!(!IntegerVersion.is_same(&Value::Null, &Value::Int(1)));
        assert!(TimestampVersion.is_same(&Value::Null, &Value::Null));
    }
}
