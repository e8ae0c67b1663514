//! JSON merge patch (RFC 7386): apply and create, plus the list-aware merge
//! used for server-side apply.

use serde_json::{Map, Value as Json};

/// Apply `patch` onto `target` in place. `null` removes a key; non-object
/// patch values (arrays included) replace the target value wholesale.
pub fn merge_patch(target: &mut Json, patch: &Json) {
    let Json::Object(patch_map) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Json::Object(Map::new());
    }
    if let Json::Object(target_map) = target {
        for (k, pv) in patch_map {
            if pv.is_null() {
                target_map.remove(k);
            } else {
                let slot = target_map.entry(k.clone()).or_insert(Json::Null);
                merge_patch(slot, pv);
            }
        }
    }
}

/// Entries of a list whose elements are all objects with distinct string
/// `name`s, the way Kubernetes keys `containers`, `volumes` or `env`.
pub fn named_entries(list: &[Json]) -> Option<Vec<&str>> {
    let mut names = Vec::with_capacity(list.len());
    for item in list {
        let name = item.get("name")?.as_str()?;
        if names.contains(&name) {
            return None;
        }
        names.push(name);
    }
    Some(names)
}

/// Merge an applied configuration into `target` the way server-side apply
/// does for a single field manager. Objects merge key by key and `null`
/// removes a key. A list of named entries keeps the applied entries in the
/// applied order, each merged into the stored entry of the same name, so
/// fields the manager never set survive; stored entries the manager no
/// longer applies are dropped. Other lists and scalars are replaced.
pub fn apply_merge(target: &mut Json, applied: &Json) {
    match applied {
        Json::Object(am) => {
            if !target.is_object() {
                *target = Json::Object(Map::new());
            }
            if let Json::Object(tm) = target {
                for (k, av) in am {
                    if av.is_null() {
                        tm.remove(k);
                    } else {
                        apply_merge(tm.entry(k.clone()).or_insert(Json::Null), av);
                    }
                }
            }
        }
        Json::Array(aa) => {
            let keyed = named_entries(aa).is_some() && matches!(&*target, Json::Array(ta) if named_entries(ta).is_some());
            match target {
                Json::Array(ta) if keyed => {
                    let mut stored = std::mem::take(ta);
                    for entry in aa {
                        let mut next = match stored.iter().position(|t| t.get("name") == entry.get("name")) {
                            Some(i) => stored.swap_remove(i),
                            None => Json::Null,
                        };
                        apply_merge(&mut next, entry);
                        ta.push(next);
                    }
                }
                _ => *target = applied.clone(),
            }
        }
        _ => *target = applied.clone(),
    }
}

/// Smallest merge patch turning `from` into `to`. Keys present in `from`
/// but absent in `to` are nulled out.
pub fn merge_diff(from: &Json, to: &Json) -> Json {
    match (from, to) {
        (Json::Object(fm), Json::Object(tm)) => {
            let mut out = Map::new();
            for (k, tv) in tm {
                match fm.get(k) {
                    Some(fv) if fv == tv => {}
                    Some(fv) if fv.is_object() && tv.is_object() => {
                        out.insert(k.clone(), merge_diff(fv, tv));
                    }
                    _ => {
                        out.insert(k.clone(), tv.clone());
                    }
                }
            }
            for k in fm.keys() {
                if !tm.contains_key(k) {
                    out.insert(k.clone(), Json::Null);
                }
            }
            Json::Object(out)
        }
        _ => to.clone(),
    }
}
