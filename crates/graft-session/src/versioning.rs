//! Optimistic-lock version values.
//!
//! Pure transformations over caller-supplied state. Seeding and increment
//! policies come from the attribute type through [`VersionSupport`]; nothing
//! here knows about concrete version types.

use graft_core::{EntityDescriptor, Result, Value, VersionContext, VersionSupport};

/// Initial version value for a newly saved entity.
pub fn seed(version_type: &dyn VersionSupport, ctx: &dyn VersionContext) -> Value {
    let seed = version_type.seed(ctx);
    tracing::trace!(seed = %seed, "Seeding version");
    seed
}

/// Seed the version in `fields` if it is null or a negative sentinel.
///
/// Returns `true` when the value was replaced.
pub fn seed_version(
    fields: &mut [Value],
    version_index: usize,
    version_type: &dyn VersionSupport,
    ctx: &dyn VersionContext,
) -> bool {
    let Some(current) = fields.get(version_index) else {
        return false;
    };
    if current.is_null() || current.is_negative_number() {
        fields[version_index] = seed(version_type, ctx);
        true
    } else {
        tracing::trace!(version = %current, "Using existing version");
        false
    }
}

/// Version following `current`.
///
/// Fails when `current` is not a value of the version type or has no
/// successor in it.
pub fn increment(
    current: &Value,
    version_type: &dyn VersionSupport,
    ctx: &dyn VersionContext,
) -> Result<Value> {
    let next = version_type.next(current, ctx)?;
    tracing::trace!(from = %current, to = %next, "Incrementing version");
    Ok(next)
}

/// Whether a flush with these dirty attributes must bump the version.
///
/// Any structural collection change forces an increment; otherwise at least
/// one dirty attribute must participate in optimistic locking.
pub fn is_version_increment_required(
    dirty: &[usize],
    has_dirty_collections: bool,
    versionability: &[bool],
) -> bool {
    has_dirty_collections
        || dirty
            .iter()
            .any(|&i| versionability.get(i).copied().unwrap_or(false))
}

/// Version value held in a disassembled state array.
pub fn get_version(fields: &[Value], descriptor: &EntityDescriptor) -> Option<Value> {
    let index = descriptor.version_index()?;
    fields.get(index).filter(|v| !v.is_null()).cloned()
}

/// Store `version` into a disassembled state array.
pub fn set_version(fields: &mut [Value], version: Value, descriptor: &EntityDescriptor) {
    if let Some(slot) = descriptor
        .version_index()
        .and_then(|index| fields.get_mut(index))
    {
        *slot = version;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use graft_core::metamodel::{IntegerVersion, LongType, LongVersion, ShortVersion, TimestampVersion};

    struct FixedClock(i64);

    impl VersionContext for FixedClock {
        fn current_timestamp_micros(&self) -> i64 {
            self.0
        }
    }

    #[test]
    fn test_seed_on_negative_null_and_existing() {
        let ctx = FixedClock(0);

        let mut fields = vec![Value::Text("a".into()), Value::Int(-1)];
        assert!(seed_version(&mut fields, 1, &IntegerVersion, &ctx));
        assert_eq!(fields[1], Value::Int(1));

        let mut fields = vec![Value::Int(5)];
        assert!(!seed_version(&mut fields, 0, &IntegerVersion, &ctx));
        assert_eq!(fields[0], Value::Int(5));

        let mut fields = vec![Value::Null];
        assert!(seed_version(&mut fields, 0, &IntegerVersion, &ctx));
        assert_eq!(fields[0], Value::Int(1));

        // out of range index is a no-op
        let mut fields = vec![Value::Null];
        assert!(!seed_version(&mut fields, 3, &IntegerVersion, &ctx));
    }

    #[test]
    fn test_increment_strictly_increases() {
        let ctx = FixedClock(0);
        for v in [0_i16, 1, 41, 1000] {
            let next = increment(&Value::SmallInt(v), &ShortVersion, &ctx).unwrap();
            assert!(next.as_i64().unwrap() > i64::from(v));
        }
        for v in [0_i32, 7, 99_999] {
            let next = increment(&Value::Int(v), &IntegerVersion, &ctx).unwrap();
            assert!(next.as_i64().unwrap() > i64::from(v));
        }
        for v in [0_i64, 12, 1 << 40] {
            let next = increment(&Value::BigInt(v), &LongVersion, &ctx).unwrap();
            assert!(next.as_i64().unwrap() > v);
        }
    }

    #[test]
    fn test_timestamp_increment_orders_after_current() {
        // clock behind the current value
        let ctx = FixedClock(100);
        let next = increment(&Value::Timestamp(500), &TimestampVersion, &ctx).unwrap();
        assert_eq!(next, Value::Timestamp(501));

        let ctx = FixedClock(10_000);
        let next = increment(&Value::Timestamp(500), &TimestampVersion, &ctx).unwrap();
        assert_eq!(next, Value::Timestamp(10_000));
        assert_eq!(seed(&TimestampVersion, &ctx), Value::Timestamp(10_000));
    }

    #[test]
    fn test_increment_required() {
        assert!(is_version_increment_required(&[2], false, &[false, false, true]));
        assert!(!is_version_increment_required(&[0], false, &[false, true]));
        assert!(is_version_increment_required(&[], true, &[]));
        assert!(is_version_increment_required(&[0], true, &[false]));
        assert!(!is_version_increment_required(&[], false, &[true]));
        assert!(!is_version_increment_required(&[7], false, &[true]));
    }

    #[test]
    fn test_get_and_set_version() {
        let desc = EntityDescriptor::builder("Doc")
            .id("id", LongType)
            .basic("title", graft_core::metamodel::StringType)
            .version("version", graft_core::metamodel::IntegerType)
            .build()
            .unwrap();
        let mut fields = vec![Value::Text("t".into()), Value::Null];
        assert_eq!(get_version(&fields, &desc), None);
        set_version(&mut fields, Value::Int(3), &desc);
        assert_eq!(get_version(&fields, &desc), Some(Value::Int(3)));
    }
}
