//! The interpreter and its supporting runtime (spec §4.4).

pub mod error;
pub mod frame;
pub mod ic;
pub mod interpreter;
pub mod native;
pub mod strings;

pub use error::VmError;
pub use interpreter::{Vm, VmOptions};

use crate::object::ObjRef;
use crate::value::Value;

/// Parses `PSEUDOCODE_GC_GROWTH` (spec §6/§4.3): any value `> 1.0`, else the
/// caller keeps the collector's default growth factor.
pub(crate) fn parse_gc_growth(raw: &str) -> Option<f64> {
    raw.parse::<f64>().ok().filter(|v| *v > 1.0)
}

/// Structural equality used by dict key lookup (spec §3) and by `==`/`!=`
/// on arrays and dicts: numbers compare by value across int/float, strings
/// by content, arrays/dicts recursively by element, everything else
/// (closures, classes, instances, bound methods) by identity.
pub fn values_structurally_equal(a: Value, b: Value) -> bool {
    if a.is_number() && b.is_number() {
        return a.as_number() == b.as_number();
    }
    match (a.as_object(), b.as_object()) {
        (Some(oa), Some(ob)) => objects_structurally_equal(oa, ob),
        (None, None) => a == b,
        _ => false,
    }
}

fn objects_structurally_equal(a: ObjRef, b: ObjRef) -> bool {
    use crate::object::ObjKind::*;
    if a == b {
        return true;
    }
    match (a.kind(), b.kind()) {
        (Str(sa), Str(sb)) => sa.as_str() == sb.as_str(),
        (Array(aa), Array(ab)) => {
            aa.elements.len() == ab.elements.len()
                && aa
                    .elements
                    .iter()
                    .zip(ab.elements.iter())
                    .all(|(x, y)| values_structurally_equal(*x, *y))
        }
        (Dict(da), Dict(db)) => {
            da.len() == db.len()
                && da.iter().all(|(k, v)| match db.get(k) {
                    Some(v2) => values_structurally_equal(v, v2),
                    None => false,
                })
        }
        _ => false,
    }
}
