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

use std::fmt::{Debug, Display, Formatter};
use std::sync::{Arc, Mutex};

use ahash::AHashMap;
use once_cell::sync::Lazy;

// Process-global intern pool. Names read during a snapshot load all land
// here, so the thousands of objects sharing "description" share one
// allocation. Exact-string matching; names must survive a dump byte-for-byte.
struct InternerState {
    ids: AHashMap<Arc<str>, u32>,
    strings: Vec<Arc<str>>,
}

impl InternerState {
    fn new() -> Self {
        Self {
            ids: AHashMap::new(),
            strings: Vec::new(),
        }
    }

    fn intern(&mut self, s: &str) -> u32 {
        if let Some(&id) = self.ids.get(s) {
            return id;
        }
        let id = self.strings.len() as u32;
        let entry: Arc<str> = Arc::from(s);
        self.strings.push(entry.clone());
        self.ids.insert(entry, id);
        id
    }

    fn resolve(&self, id: u32) -> Arc<str> {
        self.strings[id as usize].clone()
    }
}

static GLOBAL_INTERNER: Lazy<Mutex<InternerState>> = Lazy::new(|| Mutex::new(InternerState::new()));

/// An interned string used for object, verb, and property names.
///
/// Two symbols made from the same text compare equal in O(1).
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct Symbol(u32);

impl Symbol {
    pub fn mk(s: &str) -> Self {
        let mut interner = GLOBAL_INTERNER.lock().unwrap();
        Symbol(interner.intern(s))
    }

    pub fn as_arc_str(&self) -> Arc<str> {
        let interner = GLOBAL_INTERNER.lock().unwrap();
        interner.resolve(self.0)
    }

    pub fn as_string(&self) -> String {
        self.as_arc_str().to_string()
    }
}

impl Ord for Symbol {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        if self.0 == other.0 {
            return std::cmp::Ordering::Equal;
        }
        self.as_arc_str().cmp(&other.as_arc_str())
    }
}

impl PartialOrd for Symbol {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Display for Symbol {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_arc_str())
    }
}

impl Debug for Symbol {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Symbol({:?})", self.as_arc_str())
    }
}

impl From<&str> for Symbol {
    fn from(s: &str) -> Self {
        Symbol::mk(s)
    }
}
