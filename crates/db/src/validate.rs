// Copyright (C) 2025 The Weald Authors. This program is free
// software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, version
// 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

//! Post-read integrity checks over the object graph, in three phases:
//! dangling references, cycles, then bidirectional link consistency.
//! Dangling references are repairable; everything else aborts the load.

use tracing::{error, info};

use weald_var::{NOTHING, Obj, Var, Variant, v_obj};

use crate::objects::{ObjectStore, enlist_objs};
use crate::v4::{V4Object, V4Table};

#[derive(Debug, thiserror::Error)]
pub enum ValidateError {
    #[error("invalid objects found in hierarchies")]
    InvalidObjects,
    #[error("cycles found in hierarchies")]
    Cycles,
    #[error("inconsistencies found in hierarchies")]
    Inconsistencies,
}

const PROGRESS_INTERVAL: i32 = 10_000;

fn maybe_log_progress(oid: i32, log_oid: &mut i32) {
    if oid == *log_oid {
        *log_oid += PROGRESS_INTERVAL;
        info!("VALIDATE: Done through #{oid} ...");
    }
}

/// Validate the legacy intrusive-pointer hierarchies. Phase 1 repairs
/// dangling pointers in place; phases 2 and 3 only detect.
pub fn v4_validate_hierarchies(table: &mut V4Table) -> Result<(), ValidateError> {
    let size = table.last_used_objid().id() + 1;
    let mut broken = false;
    let mut fixed_nexts = 0;

    info!("VALIDATING the object hierarchies ...");

    info!("VALIDATE: Phase 1: Check for invalid objects ...");
    let mut log_oid = PROGRESS_INTERVAL;
    for oid_num in 0..size {
        let oid = Obj::mk_id(oid_num);
        maybe_log_progress(oid_num, &mut log_oid);
        let Some(o) = table.find_object(oid) else {
            continue;
        };
        let (mut parent, mut child, mut sibling) = (o.parent, o.child, o.sibling);
        let (mut location, mut contents, mut next) = (o.location, o.contents, o.next);

        // An object nowhere can't be threaded onto a contents chain.
        if location == NOTHING && next != NOTHING {
            next = NOTHING;
            fixed_nexts += 1;
        }

        let mut check = |field: &mut Obj, name: &str| {
            if *field != NOTHING && table.find_object(*field).is_none() {
                error!("VALIDATE: {oid}.{name} = {field} <invalid> ... fixed.");
                *field = NOTHING;
            }
        };
        check(&mut parent, "parent");
        check(&mut child, "child");
        check(&mut sibling, "sibling");
        check(&mut location, "location");
        check(&mut contents, "contents");
        check(&mut next, "next");

        if let Some(o) = table.find_object_mut(oid) {
            o.parent = parent;
            o.child = child;
            o.sibling = sibling;
            o.location = location;
            o.contents = contents;
            o.next = next;
        }
    }

    if fixed_nexts != 0 {
        error!("VALIDATE: Fixed {fixed_nexts} should-be-null next pointer(s) ...");
    }

    info!("VALIDATE: Phase 2: Check for cycles ...");
    let mut log_oid = PROGRESS_INTERVAL;
    for oid_num in 0..size {
        let oid = Obj::mk_id(oid_num);
        maybe_log_progress(oid_num, &mut log_oid);
        let Some(o) = table.find_object(oid) else {
            continue;
        };
        let checks: [(Obj, fn(&V4Object) -> Obj, &str); 4] = [
            (o.parent, |o| o.parent, "parent"),
            (o.child, |o| o.sibling, "child"),
            (o.location, |o| o.location, "location"),
            (o.contents, |o| o.next, "contents"),
        ];
        for (start, step, name) in checks {
            if chain_exceeds(table, start, step, size) {
                error!("VALIDATE: Cycle in `{name}' chain of {oid}");
                broken = true;
            }
        }
    }

    if broken {
        // Can't continue if cycles found
        return Err(ValidateError::Cycles);
    }

    info!("VALIDATE: Phase 3: Check for inconsistencies ...");
    let mut log_oid = PROGRESS_INTERVAL;
    for oid_num in 0..size {
        let oid = Obj::mk_id(oid_num);
        maybe_log_progress(oid_num, &mut log_oid);
        let Some(o) = table.find_object(oid) else {
            continue;
        };

        // Is oid on its parent's child list, and its location's contents list?
        let up_checks: [(Obj, &str, fn(&V4Object) -> Obj, &str, fn(&V4Object) -> Obj); 2] = [
            (o.parent, "parent", |o| o.child, "child", |o| o.sibling),
            (
                o.location,
                "location",
                |o| o.contents,
                "contents",
                |o| o.next,
            ),
        ];
        for (up, up_name, down, down_name, across) in up_checks {
            if up == NOTHING {
                continue;
            }
            let Some(up_o) = table.find_object(up) else {
                continue;
            };
            if !chain_contains(table, down(up_o), across, oid) {
                error!("VALIDATE: {oid} not in {up_name} ({up})'s {down_name} list.");
                broken = true;
            }
        }

        // Does everything on oid's child and contents lists point back at it?
        let down_checks: [(fn(&V4Object) -> Obj, Obj, &str, fn(&V4Object) -> Obj); 2] = [
            (|o| o.parent, o.child, "child", |o| o.sibling),
            (|o| o.location, o.contents, "contents", |o| o.next),
        ];
        for (up, down_start, down_name, across) in down_checks {
            let mut oid2 = down_start;
            while let Some(o2) = table.find_object(oid2) {
                if up(o2) != oid {
                    error!("VALIDATE: {oid2} erroneously on {oid}'s {down_name} list.");
                    broken = true;
                }
                oid2 = across(o2);
            }
        }
    }

    if broken {
        return Err(ValidateError::Inconsistencies);
    }

    info!("VALIDATING the object hierarchies ... finished.");
    Ok(())
}

/// Walk an intrusive chain; true if it runs longer than the whole table,
/// which can only mean a loop.
fn chain_exceeds(table: &V4Table, start: Obj, step: fn(&V4Object) -> Obj, size: i32) -> bool {
    let mut count = 0;
    let mut cur = start;
    while cur != NOTHING {
        count += 1;
        if count > size {
            return true;
        }
        cur = match table.find_object(cur) {
            Some(o) => step(o),
            None => break,
        };
    }
    false
}

fn chain_contains(table: &V4Table, start: Obj, step: fn(&V4Object) -> Obj, needle: Obj) -> bool {
    let mut cur = start;
    while cur != NOTHING {
        if cur == needle {
            return true;
        }
        cur = match table.find_object(cur) {
            Some(o) => step(o),
            None => break,
        };
    }
    false
}

fn is_obj(v: &Var) -> bool {
    matches!(v.variant(), Variant::Obj(_))
}

fn is_list_of_objs(v: &Var) -> bool {
    match v.variant() {
        Variant::List(l) => l.iter().all(is_obj),
        _ => false,
    }
}

fn is_obj_or_list_of_objs(v: &Var) -> bool {
    is_obj(v) || is_list_of_objs(v)
}

/// Validate the live store's list-valued hierarchies. Structural type
/// violations are fatal; dangling ids inside lists are removed, dangling
/// scalars are nulled.
pub fn ng_validate_hierarchies(store: &mut ObjectStore) -> Result<(), ValidateError> {
    let size = store.last_used_objid().id() + 1;
    let mut broken = false;

    info!("VALIDATING the object hierarchies ...");

    info!("VALIDATE: Phase 1: Check for invalid objects ...");
    let mut log_oid = PROGRESS_INTERVAL;
    for oid_num in 0..size {
        let oid = Obj::mk_id(oid_num);
        maybe_log_progress(oid_num, &mut log_oid);
        let Some(o) = store.find(oid) else {
            continue;
        };
        if !is_obj_or_list_of_objs(&o.parents) {
            error!("VALIDATE: {oid}.parents is not an object or list of objects.");
            broken = true;
        }
        if !is_list_of_objs(&o.children) {
            error!("VALIDATE: {oid}.children is not a list of objects.");
            broken = true;
        }
        if !is_obj(&o.location) {
            error!("VALIDATE: {oid}.location is not an object.");
            broken = true;
        }
        if !is_list_of_objs(&o.contents) {
            error!("VALIDATE: {oid}.contents is not a list of objects.");
            broken = true;
        }

        if broken {
            continue;
        }

        let mut parents = o.parents.clone();
        let mut children = o.children.clone();
        let mut location = o.location.clone();
        let mut contents = o.contents.clone();
        repair_refs(store, oid, &mut parents, "parent");
        repair_refs(store, oid, &mut children, "child");
        repair_refs(store, oid, &mut location, "location");
        repair_refs(store, oid, &mut contents, "content");
        if let Some(o) = store.find_mut(oid) {
            o.parents = parents;
            o.children = children;
            o.location = location;
            o.contents = contents;
        }
    }

    if broken {
        // Can't continue if invalid objects found
        return Err(ValidateError::InvalidObjects);
    }

    info!("VALIDATE: Phase 2: Check for cycles ...");
    let mut log_oid = PROGRESS_INTERVAL;
    for oid_num in 0..size {
        let oid = Obj::mk_id(oid_num);
        maybe_log_progress(oid_num, &mut log_oid);
        if !store.valid(oid) {
            continue;
        }
        if store.ancestors(oid).contains(&oid) {
            error!("VALIDATE: Cycle in parent chain of {oid}.");
            broken = true;
        }
        if store.all_locations(oid).contains(&oid) {
            error!("VALIDATE: Cycle in location chain of {oid}.");
            broken = true;
        }
    }

    if broken {
        // Can't continue if cycles found
        return Err(ValidateError::Cycles);
    }

    info!("VALIDATE: Phase 3: Check for inconsistencies ...");
    let mut log_oid = PROGRESS_INTERVAL;
    for oid_num in 0..size {
        let oid = Obj::mk_id(oid_num);
        maybe_log_progress(oid_num, &mut log_oid);
        let Some(o) = store.find(oid) else {
            continue;
        };
        let pair_checks = [
            (&o.location, "location", PairField::Contents, "contents"),
            (&o.contents, "content", PairField::Location, "location"),
            (&o.parents, "parent", PairField::Children, "children"),
            (&o.children, "child", PairField::Parents, "parents"),
        ];
        for (up, up_name, down, down_name) in pair_checks {
            for up_id in enlist_objs(up) {
                if up_id == NOTHING {
                    continue;
                }
                let Some(up_o) = store.find(up_id) else {
                    continue;
                };
                let down_field = match down {
                    PairField::Contents => &up_o.contents,
                    PairField::Location => &up_o.location,
                    PairField::Children => &up_o.children,
                    PairField::Parents => &up_o.parents,
                };
                if !enlist_objs(down_field).contains(&oid) {
                    error!("VALIDATE: {oid} not in its {up_name}'s ({up_id}) {down_name}.");
                    broken = true;
                    break;
                }
            }
        }
    }

    if broken {
        return Err(ValidateError::Inconsistencies);
    }

    info!("VALIDATING the object hierarchies ... finished.");
    Ok(())
}

#[derive(Clone, Copy)]
enum PairField {
    Contents,
    Location,
    Children,
    Parents,
}

/// Null out a dangling scalar reference, or drop dangling members from a
/// list-valued one. Sentinel members of lists stay.
fn repair_refs(store: &ObjectStore, oid: Obj, field: &mut Var, name: &str) {
    match field.variant() {
        Variant::List(l) => {
            let mut kept = Vec::with_capacity(l.len());
            let mut removed = false;
            for v in l.iter() {
                match v.as_object() {
                    Some(target) if target != NOTHING && !store.valid(target) => {
                        error!("VALIDATE: {oid}.{name} = {target} <invalid> ... removed.");
                        removed = true;
                    }
                    _ => kept.push(v.clone()),
                }
            }
            if removed {
                *field = Var::from_variant(Variant::List(kept.into()));
            }
        }
        Variant::Obj(target) => {
            let target = *target;
            if target != NOTHING && !store.valid(target) {
                error!("VALIDATE: {oid}.{name} = {target} <invalid> ... fixed.");
                *field = v_obj(NOTHING);
            }
        }
        _ => {}
    }
}
