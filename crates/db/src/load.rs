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

//! The top-level snapshot reader: header, user list, object bodies (legacy
//! or current form), validation, verb programs, the trailing task-queue and
//! connection sections, and finally migration when the input was legacy.

use std::io::Read;

use tracing::{error, info};

use weald_var::Obj;

use crate::dbio::{DbioError, DbioReader};
use crate::objects::ObjectStore;
use crate::tasks;
use crate::upgrade::v4_upgrade_objects;
use crate::v4::V4Table;
use crate::validate::{ValidateError, ng_validate_hierarchies, v4_validate_hierarchies};
use crate::DbVersion;

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("cannot open input database file {0}: {1}")]
    CouldNotOpenFile(String, std::io::Error),
    #[error(transparent)]
    Dbio(#[from] DbioError),
    #[error("unknown DB version number: {0}")]
    UnknownVersion(u16),
    #[error("bad object #{0}")]
    BadObject(i32),
    #[error("errors in object hierarchies: {0}")]
    Hierarchy(#[from] ValidateError),
    #[error("bad program header: {0}")]
    BadProgramHeader(String),
    #[error("verb program for nonexistent object #{0}:{1}")]
    ProgramObjectMissing(i32, usize),
    #[error("unknown verb index #{0}:{1}")]
    UnknownVerbIndex(i32, usize),
}

/// Everything a snapshot yields: the live store, the player set, and the
/// format version the file declared.
pub struct LoadedWorld {
    pub store: ObjectStore,
    pub users: Vec<Obj>,
    pub version: DbVersion,
}

/// Parse and build the whole world from a snapshot stream.
pub fn read_db_file<R: Read>(reader: R) -> Result<LoadedWorld, LoadError> {
    let mut dbio = DbioReader::new(reader);

    // A headerless file is prehistoric: its first line is already the object
    // count, so give the line back.
    let first = dbio.read_string()?;
    let version = match DbVersion::parse_header(&first) {
        Some(raw) => match DbVersion::from_repr(raw) {
            Some(v) => v,
            None => {
                error!("READ_DB_FILE: Unknown DB version number: {raw}");
                return Err(LoadError::UnknownVersion(raw));
            }
        },
        None => {
            dbio.pushback(first);
            DbVersion::Prehistory
        }
    };
    info!("LOADING: Format version {}", version as u16);

    let nobjs = dbio.read_num()?;
    let nprogs = dbio.read_num()?;
    let _reserved = dbio.read_num()?;
    let nusers = dbio.read_num()?;

    let mut users = Vec::with_capacity(nusers.max(0) as usize);
    for _ in 0..nusers {
        users.push(dbio.read_objid()?);
    }

    let legacy = version.is_legacy();
    let mut v4_table = V4Table::new();
    let mut store = ObjectStore::new();

    info!("LOADING: Reading {nobjs} objects ...");
    for i in 1..=nobjs {
        let result = if legacy {
            v4_read_object(&mut dbio, &mut v4_table)
        } else {
            ng_read_object(&mut dbio, &mut store)
        };
        if let Err(e) = result {
            error!("READ_DB_FILE: Bad object #{}: {e}", i - 1);
            return Err(e);
        }
        if i % 10_000 == 0 || i == nobjs {
            info!("LOADING: Done reading {i} objects ...");
        }
    }

    if legacy {
        v4_validate_hierarchies(&mut v4_table)?;
    } else {
        ng_validate_hierarchies(&mut store)?;
    }

    info!("LOADING: Reading {nprogs} MOO verb programs ...");
    for i in 1..=nprogs {
        read_program_block(&mut dbio, &mut v4_table, &mut store, legacy, version)?;
        if i % 5_000 == 0 || i == nprogs {
            info!("LOADING: Done reading {i} verb programs ...");
        }
    }

    info!("LOADING: Reading forked and suspended tasks ...");
    tasks::read_task_queue(&mut dbio, version)?;

    info!("LOADING: Reading list of formerly active connections ...");
    tasks::read_active_connections(&mut dbio)?;

    if legacy {
        v4_upgrade_objects(v4_table, &mut store);
    }

    Ok(LoadedWorld {
        store,
        users,
        version,
    })
}

/// The `#<n>` / `#<n> recycled` line that frames each object body.
fn parse_object_spec(line: &str) -> Option<(i32, bool)> {
    let rest = line.strip_prefix('#')?;
    match rest.split_once(' ') {
        None => rest.trim().parse().ok().map(|n| (n, false)),
        Some((n, tail)) if tail.trim() == "recycled" => {
            n.trim().parse().ok().map(|n| (n, true))
        }
        Some(_) => None,
    }
}

fn v4_read_object<R: Read>(dbio: &mut DbioReader<R>, table: &mut V4Table) -> Result<(), LoadError> {
    let line = dbio.read_string()?;
    let Some((oid, recycled)) = parse_object_spec(&line) else {
        return Err(DbioError::Parse(format!("invalid object spec: {line}"), dbio.line_num).into());
    };
    // Ids are consecutive; anything else means the file is mangled.
    if oid != table.last_used_objid().id() + 1 {
        return Err(LoadError::BadObject(oid));
    }
    if recycled {
        table.new_recycled_object();
        return Ok(());
    }

    let o = table.new_object();
    o.name = dbio.read_string_intern()?;
    let _old_handles = dbio.read_string()?;
    o.flags = dbio.read_num()? as u8;
    o.owner = dbio.read_objid()?;

    o.location = dbio.read_objid()?;
    o.contents = dbio.read_objid()?;
    o.next = dbio.read_objid()?;

    o.parent = dbio.read_objid()?;
    o.child = dbio.read_objid()?;
    o.sibling = dbio.read_objid()?;

    let nverbdefs = dbio.read_num()?;
    for _ in 0..nverbdefs {
        o.verbdefs.push(dbio.read_verbdef()?);
    }
    let npropdefs = dbio.read_num()?;
    for _ in 0..npropdefs {
        o.propdefs.push(dbio.read_string_intern()?);
    }
    let npropvals = dbio.read_num()?;
    for _ in 0..npropvals {
        o.propvals.push(dbio.read_propval()?);
    }
    Ok(())
}

fn ng_read_object<R: Read>(
    dbio: &mut DbioReader<R>,
    store: &mut ObjectStore,
) -> Result<(), LoadError> {
    let line = dbio.read_string()?;
    let Some((oid, recycled)) = parse_object_spec(&line) else {
        return Err(DbioError::Parse(format!("invalid object spec: {line}"), dbio.line_num).into());
    };
    if oid != store.last_used_objid().id() + 1 {
        return Err(LoadError::BadObject(oid));
    }
    if recycled {
        store.new_recycled_object();
        return Ok(());
    }

    let o = store.new_object();
    o.name = dbio.read_string_intern()?;
    o.flags = dbio.read_num()? as u8;
    o.owner = dbio.read_objid()?;

    o.location = dbio.read_var()?;
    o.contents = dbio.read_var()?;

    o.parents = dbio.read_var()?;
    o.children = dbio.read_var()?;

    let nverbdefs = dbio.read_num()?;
    for _ in 0..nverbdefs {
        o.verbdefs.push(dbio.read_verbdef()?);
    }
    let npropdefs = dbio.read_num()?;
    for _ in 0..npropdefs {
        o.propdefs.push(dbio.read_string_intern()?);
    }
    let npropvals = dbio.read_num()?;
    for _ in 0..npropvals {
        o.propvals.push(dbio.read_propval()?);
    }
    Ok(())
}

/// One `#<oid>:<vnum>` program block: resolve the verb by ordinal and bind
/// the program to it.
fn read_program_block<R: Read>(
    dbio: &mut DbioReader<R>,
    v4_table: &mut V4Table,
    store: &mut ObjectStore,
    legacy: bool,
    version: DbVersion,
) -> Result<(), LoadError> {
    let header = dbio.read_string()?;
    let Some((oid_num, vnum)) = parse_program_header(&header) else {
        error!("READ_DB_FILE: Bad program header: {header}");
        return Err(LoadError::BadProgramHeader(header));
    };
    let oid = Obj::mk_id(oid_num);

    let exists = if legacy {
        v4_table.valid(oid)
    } else {
        store.valid(oid)
    };
    if !exists {
        error!("READ_DB_FILE: Verb for non-existant object: #{oid_num}:{vnum}.");
        return Err(LoadError::ProgramObjectMissing(oid_num, vnum));
    }

    // The file is zero-based; verb ordinals here are one-based.
    let verb_name = if legacy {
        v4_table.find_indexed_verb(oid, vnum + 1).map(|v| v.name)
    } else {
        store.find_indexed_verb(oid, vnum + 1).map(|v| v.name)
    };
    let Some(verb_name) = verb_name else {
        error!("READ_DB_FILE: Unknown verb index: #{oid_num}:{vnum}.");
        return Err(LoadError::UnknownVerbIndex(oid_num, vnum));
    };

    let program = dbio.read_program(version, || format!("{oid}:{verb_name}"))?;

    let slot = if legacy {
        v4_table.find_indexed_verb_mut(oid, vnum + 1)
    } else {
        store.find_indexed_verb_mut(oid, vnum + 1)
    };
    if let Some(vd) = slot {
        vd.program = Some(program);
    }
    Ok(())
}

fn parse_program_header(header: &str) -> Option<(i32, usize)> {
    let (oid_str, vnum_str) = header.strip_prefix('#')?.split_once(':')?;
    Some((oid_str.parse().ok()?, vnum_str.parse().ok()?))
}
