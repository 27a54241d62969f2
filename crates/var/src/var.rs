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

use std::fmt::{Debug, Formatter};

use strum::{Display, FromRepr};

use crate::error::Error;
use crate::list::List;
use crate::obj::Obj;

/// Type codes as they appear in snapshot files. The numbering is load-bearing
/// and cannot change without a format version bump.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Display, FromRepr)]
#[allow(non_camel_case_types)]
pub enum VarType {
    TYPE_INT = 0,
    TYPE_OBJ = 1,
    TYPE_STR = 2,
    TYPE_ERR = 3,
    TYPE_LIST = 4,
    TYPE_CLEAR = 5,
    TYPE_NONE = 6,
    TYPE_CATCH = 7,
    TYPE_FINALLY = 8,
    TYPE_FLOAT = 9,
}

/// Our series of types.
#[derive(Clone, PartialEq)]
pub enum Variant {
    None,
    Int(i64),
    Float(f64),
    Str(Box<str>),
    Obj(Obj),
    Err(Error),
    List(List),
}

/// A tagged value.
#[derive(Clone, PartialEq)]
pub struct Var(Variant);

pub fn v_none() -> Var {
    Var(Variant::None)
}

pub fn v_int(i: i64) -> Var {
    Var(Variant::Int(i))
}

pub fn v_float(f: f64) -> Var {
    Var(Variant::Float(f))
}

pub fn v_str(s: &str) -> Var {
    Var(Variant::Str(s.into()))
}

pub fn v_obj(o: Obj) -> Var {
    Var(Variant::Obj(o))
}

pub fn v_err(e: Error) -> Var {
    Var(Variant::Err(e))
}

pub fn v_list(values: &[Var]) -> Var {
    Var(Variant::List(values.iter().cloned().collect()))
}

impl Var {
    pub fn from_variant(variant: Variant) -> Self {
        Var(variant)
    }

    pub fn variant(&self) -> &Variant {
        &self.0
    }

    pub fn type_code(&self) -> VarType {
        match &self.0 {
            Variant::None => VarType::TYPE_NONE,
            Variant::Int(_) => VarType::TYPE_INT,
            Variant::Float(_) => VarType::TYPE_FLOAT,
            Variant::Str(_) => VarType::TYPE_STR,
            Variant::Obj(_) => VarType::TYPE_OBJ,
            Variant::Err(_) => VarType::TYPE_ERR,
            Variant::List(_) => VarType::TYPE_LIST,
        }
    }

    pub fn as_object(&self) -> Option<Obj> {
        match &self.0 {
            Variant::Obj(o) => Some(*o),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&List> {
        match &self.0 {
            Variant::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match &self.0 {
            Variant::Str(s) => Some(&**s),
            _ => None,
        }
    }
}

impl Debug for Var {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.0 {
            Variant::None => write!(f, "None"),
            Variant::Int(i) => write!(f, "Integer({i})"),
            Variant::Float(fl) => write!(f, "Float({fl})"),
            Variant::Str(s) => write!(f, "String({s:?})"),
            Variant::Obj(o) => write!(f, "Object({o})"),
            Variant::Err(e) => write!(f, "Error({e})"),
            Variant::List(l) => {
                let items: Vec<_> = l.iter().collect();
                write!(f, "List([size = {}, items = {:?}])", l.len(), items)
            }
        }
    }
}
