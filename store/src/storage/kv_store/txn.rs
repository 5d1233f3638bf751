use std::cmp::Ordering;

use crate::rpc::{compare::TargetUnion, Compare, CompareResult, CompareTarget, KeyValue};

/// Evaluate one `Compare` against a key's current `KeyValue`, or against the
/// zero-value defaults (§4.1 "Compare predicates") when the key is absent —
/// this is what lets a Txn express "key does not exist" as `Version == 0`.
pub(crate) fn compare_holds(cmp: &Compare, kv: Option<&KeyValue>) -> bool {
    let result = match cmp.target() {
        CompareTarget::Version => compare_i64(kv.map_or(0, |kv| kv.version), target_i64(cmp)),
        CompareTarget::Create => compare_i64(kv.map_or(0, |kv| kv.create_revision), target_i64(cmp)),
        CompareTarget::Mod => compare_i64(kv.map_or(0, |kv| kv.mod_revision), target_i64(cmp)),
        CompareTarget::Value => compare_bytes(
            kv.map_or(&[][..], |kv| kv.value.as_slice()),
            target_bytes(cmp),
        ),
        CompareTarget::Lease => compare_i64(kv.map_or(0, |kv| kv.lease), target_i64(cmp)),
    };
    match cmp.result() {
        CompareResult::Equal => result == Ordering::Equal,
        CompareResult::Greater => result == Ordering::Greater,
        CompareResult::Less => result == Ordering::Less,
        CompareResult::NotEqual => result != Ordering::Equal,
    }
}

fn target_i64(cmp: &Compare) -> i64 {
    match cmp.target_union {
        Some(
            TargetUnion::Version(v)
            | TargetUnion::CreateRevision(v)
            | TargetUnion::ModRevision(v)
            | TargetUnion::Lease(v),
        ) => v,
        _ => 0,
    }
}

fn target_bytes(cmp: &Compare) -> &[u8] {
    match &cmp.target_union {
        Some(TargetUnion::Value(v)) => v.as_slice(),
        _ => &[],
    }
}

fn compare_i64(val: i64, target: i64) -> Ordering {
    val.cmp(&target)
}

fn compare_bytes(val: &[u8], target: &[u8]) -> Ordering {
    val.cmp(target)
}
