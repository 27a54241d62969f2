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

//! Whole-world snapshot persistence.
//!
//! The world lives in memory; this crate loads it from a textual snapshot at
//! startup (migrating legacy v4 snapshots in place), validates the object
//! graph, and periodically writes a fresh snapshot back out, atomically
//! replacing the previous one.

use std::fs::File;
use std::path::PathBuf;

use strum::{Display, FromRepr};
use tracing::{error, info};

pub use dbio::{DbioError, DbioReader, DbioWriter};
pub use dump::{
    CheckpointHooks, DumpConfig, DumpError, DumpReason, FlushType, NoHooks, db_disk_size, db_flush,
    dump_database, write_db_file,
};
pub use load::{LoadError, LoadedWorld, read_db_file};
pub use objects::{Object, ObjectStore, Parents, Program, PropVal, VerbDef};
pub use v4::{V4Object, V4Table};
pub use validate::{ValidateError, ng_validate_hierarchies, v4_validate_hierarchies};

mod dbio;
mod dump;
mod load;
mod objects;
mod tasks;
mod upgrade;
mod v4;
mod validate;

const HEADER_PREFIX: &str = "** LambdaMOO Database, Format Version ";
const HEADER_SUFFIX: &str = " **";

/// Snapshot format versions this build recognizes. Anything strictly below
/// `NextGen` is read through the legacy v4 path and migrated on load.
#[repr(u16)]
#[derive(Debug, Eq, PartialEq, Ord, PartialOrd, Copy, Clone, Display, FromRepr)]
pub enum DbVersion {
    /// Before format versions.
    Prehistory = 0,
    /// Addition of the `try'/`except'/`finally'/`endtry' keywords.
    Exceptions = 1,
    /// Addition of the `break' and `continue' keywords.
    BreakCont = 2,
    /// Addition of floats, and version numbers on each frame of a suspended task.
    Float = 3,
    /// Built-in function override bug fixed; no format change of its own.
    BfbugFixed = 4,
    /// The current format: relationship fields are general values, so an
    /// object can carry multiple parents.
    NextGen = 5,
}

pub const CURRENT_DB_VERSION: DbVersion = DbVersion::NextGen;

impl DbVersion {
    /// Parse the fixed header line, yielding the raw version number. Returns
    /// `None` when the line is not a header at all (prehistoric snapshots
    /// start straight in with the object count).
    pub fn parse_header(line: &str) -> Option<u16> {
        line.strip_prefix(HEADER_PREFIX)?
            .strip_suffix(HEADER_SUFFIX)?
            .trim()
            .parse()
            .ok()
    }

    pub fn header_line(&self) -> String {
        format!("{}{}{}", HEADER_PREFIX, *self as u16, HEADER_SUFFIX)
    }

    pub fn is_legacy(&self) -> bool {
        *self < DbVersion::NextGen
    }
}

/// The process-wide persistence state: snapshot file names, the dump
/// generation counter, and the version the input file declared. Owned by the
/// server's top level and threaded through load and dump.
pub struct DbContext {
    pub input_db_name: PathBuf,
    pub dump_db_name: PathBuf,
    pub dump_generation: u32,
    pub input_version: DbVersion,
}

impl DbContext {
    pub fn new(input_db_name: PathBuf, dump_db_name: PathBuf) -> Self {
        Self {
            input_db_name,
            dump_db_name,
            dump_generation: 0,
            input_version: CURRENT_DB_VERSION,
        }
    }
}

/// Load the whole world from the context's input snapshot.
pub fn db_load(ctx: &mut DbContext) -> Result<LoadedWorld, LoadError> {
    let f = File::open(&ctx.input_db_name)
        .map_err(|e| LoadError::CouldNotOpenFile(ctx.input_db_name.display().to_string(), e))?;

    info!("LOADING: {}", ctx.input_db_name.display());
    let world = match read_db_file(f) {
        Ok(world) => world,
        Err(e) => {
            error!("DB_LOAD: Cannot load database: {e}");
            return Err(e);
        }
    };
    info!(
        "LOADING: {} done, will dump new database on {}",
        ctx.input_db_name.display(),
        ctx.dump_db_name.display()
    );
    ctx.input_version = world.version;
    Ok(world)
}

/// Final synchronous dump, with the shutdown retry policy.
pub fn db_shutdown(ctx: &mut DbContext, world: &LoadedWorld, config: &DumpConfig) {
    let _ = dump_database(
        DumpReason::Shutdown,
        ctx,
        world,
        config,
        &mut dump::NoHooks,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_header_line() {
        assert_eq!(
            DbVersion::parse_header("** LambdaMOO Database, Format Version 4 **"),
            Some(4)
        );
        assert_eq!(
            DbVersion::parse_header("** LambdaMOO Database, Format Version 5 **"),
            Some(5)
        );
        assert_eq!(DbVersion::parse_header("3"), None);
        assert_eq!(DbVersion::parse_header("** Something else **"), None);
    }

    #[test]
    fn test_header_round_trip() {
        let line = CURRENT_DB_VERSION.header_line();
        assert_eq!(DbVersion::parse_header(&line), Some(5));
        assert_eq!(DbVersion::from_repr(5), Some(DbVersion::NextGen));
        assert_eq!(DbVersion::from_repr(6), None);
    }

    #[test]
    fn test_legacy_ordering() {
        assert!(DbVersion::Prehistory.is_legacy());
        assert!(DbVersion::BfbugFixed.is_legacy());
        assert!(!DbVersion::NextGen.is_legacy());
    }
}
