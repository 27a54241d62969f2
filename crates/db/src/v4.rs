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

//! The transient shadow table used while loading a legacy (format version 4)
//! snapshot. The v4 format encodes both hierarchies as intrusive chains:
//! first-child/next-sibling for inheritance, head/next for containment. The
//! table exists only between read and migration, then is dropped wholesale.

use weald_var::{NOTHING, Obj, Symbol};

use crate::objects::{PropVal, VerbDef};

pub struct V4Object {
    pub id: Obj,
    pub name: Symbol,
    pub flags: u8,
    pub owner: Obj,
    pub location: Obj,
    pub contents: Obj,
    pub next: Obj,
    pub parent: Obj,
    pub child: Obj,
    pub sibling: Obj,
    pub verbdefs: Vec<VerbDef>,
    pub propdefs: Vec<Symbol>,
    pub propvals: Vec<PropVal>,
}

impl V4Object {
    fn new(id: Obj) -> Self {
        Self {
            id,
            name: Symbol::mk(""),
            flags: 0,
            owner: NOTHING,
            location: NOTHING,
            contents: NOTHING,
            next: NOTHING,
            parent: NOTHING,
            child: NOTHING,
            sibling: NOTHING,
            verbdefs: Vec::new(),
            propdefs: Vec::new(),
            propvals: Vec::new(),
        }
    }
}

const INITIAL_CAPACITY: usize = 100;

pub struct V4Table {
    slots: Vec<Option<V4Object>>,
}

impl Default for V4Table {
    fn default() -> Self {
        Self::new()
    }
}

impl V4Table {
    pub fn new() -> Self {
        Self {
            slots: Vec::with_capacity(INITIAL_CAPACITY),
        }
    }

    pub fn new_object(&mut self) -> &mut V4Object {
        let id = Obj::mk_id(self.slots.len() as i32);
        self.slots.push(Some(V4Object::new(id)));
        self.slots
            .last_mut()
            .and_then(|s| s.as_mut())
            .expect("slot just pushed")
    }

    pub fn new_recycled_object(&mut self) {
        self.slots.push(None);
    }

    pub fn find_object(&self, oid: Obj) -> Option<&V4Object> {
        if oid.id() < 0 {
            return None;
        }
        self.slots.get(oid.id() as usize)?.as_ref()
    }

    pub fn find_object_mut(&mut self, oid: Obj) -> Option<&mut V4Object> {
        if oid.id() < 0 {
            return None;
        }
        self.slots.get_mut(oid.id() as usize)?.as_mut()
    }

    pub fn valid(&self, oid: Obj) -> bool {
        self.find_object(oid).is_some()
    }

    pub fn last_used_objid(&self) -> Obj {
        Obj::mk_id(self.slots.len() as i32 - 1)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Sum of propdef counts along the parent chain, starting at `oid`.
    /// The v4 format does not record the propval count's derivation per
    /// object, so it has to be recomputed this way. Bounded by the table
    /// size so an unvalidated cycle cannot hang it.
    pub fn count_properties(&self, oid: Obj) -> usize {
        let mut n = 0;
        let mut cur = oid;
        let mut steps = 0;
        while let Some(o) = self.find_object(cur) {
            n += o.propdefs.len();
            cur = o.parent;
            steps += 1;
            if steps > self.slots.len() {
                break;
            }
        }
        n
    }

    /// Resolve a one-based ordinal into an object's verbdef sequence.
    pub fn find_indexed_verb(&self, oid: Obj, index: usize) -> Option<&VerbDef> {
        self.find_object(oid)?.verbdefs.get(index.checked_sub(1)?)
    }

    pub fn find_indexed_verb_mut(&mut self, oid: Obj, index: usize) -> Option<&mut VerbDef> {
        self.find_object_mut(oid)?
            .verbdefs
            .get_mut(index.checked_sub(1)?)
    }

    pub(crate) fn into_slots(self) -> Vec<Option<V4Object>> {
        self.slots
    }
}
