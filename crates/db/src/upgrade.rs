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

//! In-place migration of a validated v4 shadow table into the live store.
//! The intrusive first-child/next-sibling and head/next chains become list
//! values; everything else transfers unchanged. Slots are allocated in the
//! same order they were read, so object ids are stable.

use tracing::info;

use weald_var::{NOTHING, Obj, v_list, v_obj};

use crate::objects::ObjectStore;
use crate::v4::{V4Object, V4Table};

const PROGRESS_INTERVAL: i32 = 10_000;

pub(crate) fn v4_upgrade_objects(table: V4Table, store: &mut ObjectStore) {
    let size = table.last_used_objid().id() + 1;

    info!("UPGRADING objects to new structure ...");

    // The chains have to be walked while every record is still in place, so
    // collect both list fields up front, then consume the table.
    let mut children_lists = Vec::with_capacity(size as usize);
    let mut contents_lists = Vec::with_capacity(size as usize);
    for oid_num in 0..size {
        match table.find_object(Obj::mk_id(oid_num)) {
            Some(o) => {
                children_lists.push(chain_to_list(&table, o.child, |o| o.sibling));
                contents_lists.push(chain_to_list(&table, o.contents, |o| o.next));
            }
            None => {
                children_lists.push(Vec::new());
                contents_lists.push(Vec::new());
            }
        }
    }

    let mut log_oid = PROGRESS_INTERVAL;
    for (oid_num, slot) in table.into_slots().into_iter().enumerate() {
        if oid_num as i32 == log_oid {
            log_oid += PROGRESS_INTERVAL;
            info!("UPGRADE: Done through #{oid_num} ...");
        }
        let Some(o) = slot else {
            store.new_recycled_object();
            continue;
        };
        let children: Vec<_> = children_lists[oid_num].iter().map(|c| v_obj(*c)).collect();
        let contents: Vec<_> = contents_lists[oid_num].iter().map(|c| v_obj(*c)).collect();

        let new = store.new_object();
        new.name = o.name;
        new.flags = o.flags;
        new.owner = o.owner;
        // The parent becomes a scalar object value even when it is NOTHING;
        // a singleton, never an empty list.
        new.parents = v_obj(o.parent);
        new.children = v_list(&children);
        new.location = v_obj(o.location);
        new.contents = v_list(&contents);
        new.verbdefs = o.verbdefs;
        new.propdefs = o.propdefs;
        new.propvals = o.propvals;
    }

    info!("UPGRADING objects to new structure ... finished.");
}

fn chain_to_list(table: &V4Table, start: Obj, step: fn(&V4Object) -> Obj) -> Vec<Obj> {
    let mut out = Vec::new();
    let mut cur = start;
    while cur != NOTHING {
        match table.find_object(cur) {
            Some(o) => {
                out.push(cur);
                cur = step(o);
            }
            None => break,
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::Parents;
    use weald_var::Symbol;

    /// #0 root with children #1 and #2 via the sibling chain.
    fn three_object_tree() -> V4Table {
        let mut table = V4Table::new();
        {
            let o0 = table.new_object();
            o0.name = Symbol::mk("root");
            o0.child = Obj::mk_id(1);
        }
        {
            let o1 = table.new_object();
            o1.parent = Obj::mk_id(0);
            o1.sibling = Obj::mk_id(2);
        }
        {
            let o2 = table.new_object();
            o2.parent = Obj::mk_id(0);
        }
        table
    }

    #[test]
    fn test_sibling_chain_becomes_children_list() {
        let mut store = ObjectStore::new();
        v4_upgrade_objects(three_object_tree(), &mut store);

        let o0 = store.find(Obj::mk_id(0)).unwrap();
        assert_eq!(o0.parents(), Parents::One(NOTHING));
        assert_eq!(o0.children_ids(), vec![Obj::mk_id(1), Obj::mk_id(2)]);

        let o1 = store.find(Obj::mk_id(1)).unwrap();
        assert_eq!(o1.parents(), Parents::One(Obj::mk_id(0)));
        assert_eq!(o1.children_ids(), vec![]);

        let o2 = store.find(Obj::mk_id(2)).unwrap();
        assert_eq!(o2.parents(), Parents::One(Obj::mk_id(0)));
        assert_eq!(o2.children_ids(), vec![]);
    }

    #[test]
    fn test_nothing_parent_stays_scalar() {
        let mut store = ObjectStore::new();
        let mut table = V4Table::new();
        table.new_object();
        v4_upgrade_objects(table, &mut store);
        // A scalar #-1, not an empty list.
        let o = store.find(Obj::mk_id(0)).unwrap();
        assert_eq!(o.parents.as_object(), Some(NOTHING));
        assert!(o.parents.as_list().is_none());
    }

    #[test]
    fn test_recycled_slot_preserved_in_place() {
        let mut table = V4Table::new();
        table.new_object().name = Symbol::mk("first");
        table.new_recycled_object();
        table.new_object().name = Symbol::mk("third");

        let mut store = ObjectStore::new();
        v4_upgrade_objects(table, &mut store);
        assert_eq!(store.last_used_objid(), Obj::mk_id(2));
        assert!(store.valid(Obj::mk_id(0)));
        assert!(!store.valid(Obj::mk_id(1)));
        assert_eq!(
            store.find(Obj::mk_id(2)).unwrap().name,
            Symbol::mk("third")
        );
    }

    #[test]
    fn test_containment_chain_becomes_contents_list() {
        let mut table = V4Table::new();
        {
            let room = table.new_object();
            room.name = Symbol::mk("room");
            room.contents = Obj::mk_id(1);
        }
        {
            let a = table.new_object();
            a.location = Obj::mk_id(0);
            a.next = Obj::mk_id(2);
        }
        {
            let b = table.new_object();
            b.location = Obj::mk_id(0);
        }
        let mut store = ObjectStore::new();
        v4_upgrade_objects(table, &mut store);

        let room = store.find(Obj::mk_id(0)).unwrap();
        assert_eq!(room.contents_ids(), vec![Obj::mk_id(1), Obj::mk_id(2)]);
        assert_eq!(
            store.find(Obj::mk_id(1)).unwrap().location_id(),
            Obj::mk_id(0)
        );
    }
}
