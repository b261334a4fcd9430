//! Inline caches for `GET_FIELD`/`SET_FIELD`/`INVOKE`/`GET_SUPER` (spec
//! §4.5): monomorphic first, degrading to a small polymorphic list, and
//! finally megamorphic (always re-resolve). Each cache entry is keyed by
//! the instance's class `version` (spec §4.5: "a class mutation bumps
//! `version`, invalidating every cache filled against an older one")
//! rather than by identity, so a cache entry silently goes stale instead
//! of needing active invalidation when a class gains a field or method.

const POLYMORPHIC_LIMIT: usize = 4;

#[derive(Clone, Copy)]
pub struct CacheEntry {
    pub class: crate::object::ObjRef,
    pub class_version: u32,
    pub slot: usize,
}

#[derive(Default, Clone)]
pub enum InlineCache {
    #[default]
    Empty,
    Monomorphic(CacheEntry),
    Polymorphic(Vec<CacheEntry>),
    Megamorphic,
}

impl InlineCache {
    /// Looks up a cached field/method slot for `class` at `class_version`.
    pub fn lookup(&self, class: crate::object::ObjRef, class_version: u32) -> Option<usize> {
        let matches = |e: &CacheEntry| e.class == class && e.class_version == class_version;
        match self {
            InlineCache::Empty => None,
            InlineCache::Monomorphic(e) => matches(e).then_some(e.slot),
            InlineCache::Polymorphic(entries) => entries.iter().find(|e| matches(e)).map(|e| e.slot),
            InlineCache::Megamorphic => None,
        }
    }

    /// Records a freshly resolved `(class, version) -> slot` mapping,
    /// promoting Empty -> Monomorphic -> Polymorphic -> Megamorphic as
    /// distinct shapes accumulate (spec §4.5).
    pub fn record(&mut self, class: crate::object::ObjRef, class_version: u32, slot: usize) {
        let entry = CacheEntry { class, class_version, slot };
        *self = match std::mem::take(self) {
            InlineCache::Empty => InlineCache::Monomorphic(entry),
            InlineCache::Monomorphic(prev) if prev.class == class => InlineCache::Monomorphic(entry),
            InlineCache::Monomorphic(prev) => InlineCache::Polymorphic(vec![prev, entry]),
            InlineCache::Polymorphic(mut entries) => {
                entries.retain(|e| e.class != class);
                if entries.len() >= POLYMORPHIC_LIMIT {
                    InlineCache::Megamorphic
                } else {
                    entries.push(entry);
                    InlineCache::Polymorphic(entries)
                }
            }
            InlineCache::Megamorphic => InlineCache::Megamorphic,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::collector::GarbageCollector;
    use crate::object::{ObjKind, RClass};

    fn fake_class(gc: &mut GarbageCollector, name: &str) -> crate::object::ObjRef {
        gc.allocate(ObjKind::Class(RClass::new(name.to_string(), None)))
    }

    #[test]
    fn empty_cache_misses() {
        let mut gc = GarbageCollector::new();
        let c = fake_class(&mut gc, "A");
        let cache = InlineCache::default();
        assert_eq!(cache.lookup(c, 0), None);
    }

    #[test]
    fn monomorphic_hit_and_stale_version_miss() {
        let mut gc = GarbageCollector::new();
        let c = fake_class(&mut gc, "A");
        let mut cache = InlineCache::default();
        cache.record(c, 1, 3);
        assert_eq!(cache.lookup(c, 1), Some(3));
        assert_eq!(cache.lookup(c, 2), None);
    }

    #[test]
    fn degrades_to_polymorphic_then_megamorphic() {
        let mut gc = GarbageCollector::new();
        let mut cache = InlineCache::default();
        let classes: Vec<_> = (0..6).map(|i| fake_class(&mut gc, &format!("C{i}"))).collect();
        for (i, c) in classes.iter().enumerate() {
            cache.record(*c, 0, i);
        }
        assert!(matches!(cache, InlineCache::Megamorphic));
    }
}
