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

//! Snapshot output and the checkpoint protocol.
//!
//! A checkpoint forks a child that serializes its copy-on-write image of the
//! world while the parent keeps serving; the parent never waits on it. The
//! new file is fsynced before the old one is unlinked and the temporary
//! renamed over it, so a crash at any point leaves a readable snapshot on
//! disk. Shutdown and panic dumps run the same serializer synchronously.

use std::ffi::CString;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::thread;
use std::time::Duration;

use tracing::{error, info};

use weald_var::Obj;

use crate::dbio::DbioWriter;
use crate::load::LoadedWorld;
use crate::objects::ObjectStore;
use crate::tasks;
use crate::{CURRENT_DB_VERSION, DbContext};

/// The flush requests the scheduler can issue. Only `AllNow` and `Panic`
/// actually write; rate control lives with the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushType {
    IfFull,
    OneSecond,
    AllNow,
    Panic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpReason {
    Shutdown,
    Checkpoint,
    Panic,
}

impl DumpReason {
    fn label(&self) -> &'static str {
        match self {
            DumpReason::Shutdown => "DUMPING",
            DumpReason::Checkpoint => "CHECKPOINTING",
            DumpReason::Panic => "PANIC-DUMPING",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DumpError {
    #[error("could not fork checkpoint process: {0}")]
    ForkFailed(io::Error),
    #[error("dump failed")]
    DumpFailed,
}

#[derive(Default)]
pub struct DumpConfig {
    /// Run checkpoints synchronously in the calling process instead of a
    /// forked child. Required where fork is unavailable or the process has
    /// grown threads.
    pub unforked_checkpoints: bool,
}

/// Server-side notifications out of the checkpoint path. Command history is
/// the connection layer's to reset once a checkpoint is underway.
pub trait CheckpointHooks {
    fn reset_command_history(&mut self) {}
}

pub struct NoHooks;

impl CheckpointHooks for NoHooks {}

const RETRY_INTERVAL_SECONDS: u64 = 60;

enum Fork {
    Parent(libc::pid_t),
    Child,
}

fn fork_server(name: &str) -> io::Result<Fork> {
    // The server is single-threaded by design; child and parent share no
    // mutable memory after this returns.
    match unsafe { libc::fork() } {
        -1 => Err(io::Error::last_os_error()),
        0 => Ok(Fork::Child),
        pid => {
            info!("Forked {name} child: pid {pid}");
            Ok(Fork::Parent(pid))
        }
    }
}

/// Rename the process as seen in `ps`.
fn set_server_cmdline(name: &str) {
    #[cfg(target_os = "linux")]
    if let Ok(cname) = CString::new(name) {
        unsafe {
            libc::prctl(libc::PR_SET_NAME, cname.as_ptr());
        }
    }
    #[cfg(not(target_os = "linux"))]
    let _ = name;
}

/// Write one full snapshot: the whole object table, recycled slots included,
/// then every verb program in (object, ordinal) order, then the trailing
/// sections. Record order is fixed; a byte-identical store yields a
/// byte-identical file.
pub fn write_db_file<W: Write>(
    w: &mut DbioWriter<W>,
    world: &LoadedWorld,
    reason: &str,
) -> io::Result<()> {
    let store = &world.store;
    let max_oid = store.last_used_objid().id();

    let mut nprogs = 0;
    for oid_num in 0..=max_oid {
        if let Some(o) = store.find(Obj::mk_id(oid_num)) {
            nprogs += o.verbdefs.iter().filter(|v| v.program.is_some()).count();
        }
    }

    w.write_line(&CURRENT_DB_VERSION.header_line())?;
    w.write_num((max_oid + 1) as i64)?;
    w.write_num(nprogs as i64)?;
    w.write_num(0)?;
    w.write_num(world.users.len() as i64)?;
    for user in &world.users {
        w.write_objid(*user)?;
    }

    info!("{reason}: Writing {} objects ...", max_oid + 1);
    for oid_num in 0..=max_oid {
        ng_write_object(w, store, Obj::mk_id(oid_num))?;
        if (oid_num + 1) % 10_000 == 0 || oid_num == max_oid {
            info!("{reason}: Done writing {} objects ...", oid_num + 1);
        }
    }

    info!("{reason}: Writing {nprogs} MOO verb programs ...");
    let mut written = 0;
    for oid_num in 0..=max_oid {
        let Some(o) = store.find(Obj::mk_id(oid_num)) else {
            continue;
        };
        for (vcount, v) in o.verbdefs.iter().enumerate() {
            let Some(program) = &v.program else {
                continue;
            };
            w.write_line(&format!("#{oid_num}:{vcount}"))?;
            w.write_program(program)?;
            written += 1;
            if written % 5_000 == 0 || written == nprogs {
                info!("{reason}: Done writing {written} verb programs ...");
            }
        }
    }

    info!("{reason}: Writing forked and suspended tasks ...");
    tasks::write_task_queue(w)?;

    info!("{reason}: Writing list of formerly active connections ...");
    tasks::write_active_connections(w)?;

    Ok(())
}

fn ng_write_object<W: Write>(
    w: &mut DbioWriter<W>,
    store: &ObjectStore,
    oid: Obj,
) -> io::Result<()> {
    let Some(o) = store.find(oid) else {
        return w.write_line(&format!("#{} recycled", oid.id()));
    };

    w.write_line(&format!("#{}", oid.id()))?;
    w.write_string(&o.name.as_arc_str())?;
    w.write_num(o.flags as i64)?;
    w.write_objid(o.owner)?;

    w.write_var(&o.location)?;
    w.write_var(&o.contents)?;

    w.write_var(&o.parents)?;
    w.write_var(&o.children)?;

    w.write_num(o.verbdefs.len() as i64)?;
    for v in &o.verbdefs {
        w.write_verbdef(v)?;
    }
    w.write_num(o.propdefs.len() as i64)?;
    for p in &o.propdefs {
        w.write_string(&p.as_arc_str())?;
    }

    let nprops = store.count_properties(oid);
    if nprops != o.propvals.len() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "{oid} carries {} property values but its inheritance chain defines {nprops}",
                o.propvals.len()
            ),
        ));
    }
    w.write_num(nprops as i64)?;
    for pv in &o.propvals {
        w.write_propval(pv)?;
    }
    Ok(())
}

fn temp_dump_name(ctx: &DbContext, generation: u32) -> String {
    format!("{}.#{}#", ctx.dump_db_name.display(), generation)
}

fn panic_dump_name(ctx: &DbContext) -> String {
    format!("{}.PANIC", ctx.dump_db_name.display())
}

/// Produce a full dump per the reason's protocol: forked for checkpoints
/// (unless configured otherwise), synchronous with retry for shutdown,
/// synchronous to a `.PANIC` file that is never renamed for panics.
pub fn dump_database(
    reason: DumpReason,
    ctx: &mut DbContext,
    world: &LoadedWorld,
    config: &DumpConfig,
    hooks: &mut dyn CheckpointHooks,
) -> Result<(), DumpError> {
    let label = reason.label();
    let mut forked_child = false;

    let success = loop {
        // Remove the previous generation's temporary before starting the next.
        let _ = fs::remove_file(temp_dump_name(ctx, ctx.dump_generation));

        let temp_name = if reason == DumpReason::Panic {
            panic_dump_name(ctx)
        } else {
            ctx.dump_generation += 1;
            temp_dump_name(ctx, ctx.dump_generation)
        };

        info!("{label} on {temp_name} ...");

        if config.unforked_checkpoints {
            hooks.reset_command_history();
        } else if reason == DumpReason::Checkpoint && !forked_child {
            match fork_server("checkpointer") {
                Err(e) => {
                    error!("Could not fork checkpointer: {e}");
                    return Err(DumpError::ForkFailed(e));
                }
                Ok(Fork::Parent(_)) => {
                    hooks.reset_command_history();
                    return Ok(());
                }
                Ok(Fork::Child) => {
                    forked_child = true;
                    set_server_cmdline("(weald checkpointer)");
                }
            }
        }

        let f = match File::create(&temp_name) {
            Ok(f) => f,
            Err(e) => {
                error!("Opening temporary dump file: {e}");
                break false;
            }
        };

        let mut w = DbioWriter::new(BufWriter::new(f));
        let dump_result = write_db_file(&mut w, world, label).and_then(move |()| {
            // The durability boundary: the new image reaches disk before the
            // old one goes away.
            let f = w
                .into_inner()
                .into_inner()
                .map_err(io::IntoInnerError::into_error)?;
            f.sync_all()
        });

        match dump_result {
            Ok(()) => {
                info!("{label} on {temp_name} finished");
                if reason == DumpReason::Panic {
                    break true;
                }
                let _ = fs::remove_file(&ctx.dump_db_name);
                match fs::rename(&temp_name, &ctx.dump_db_name) {
                    Ok(()) => break true,
                    Err(e) => {
                        error!("Renaming temporary dump file: {e}");
                        break false;
                    }
                }
            }
            Err(e) => {
                error!("Trying to dump database: {e}");
                let _ = fs::remove_file(&temp_name);
                match reason {
                    DumpReason::Checkpoint => {
                        error!("Abandoning checkpoint attempt ...");
                        break false;
                    }
                    DumpReason::Shutdown => {
                        error!("Waiting {RETRY_INTERVAL_SECONDS} seconds and retrying dump ...");
                        thread::sleep(Duration::from_secs(RETRY_INTERVAL_SECONDS));
                        continue;
                    }
                    DumpReason::Panic => break false,
                }
            }
        }
    };

    if forked_child {
        // We're a child, so we'd better go away.
        std::process::exit(if success { 0 } else { 1 });
    }

    if success {
        Ok(())
    } else {
        Err(DumpError::DumpFailed)
    }
}

/// The scheduler's entry point; only two of the four kinds write.
pub fn db_flush(
    kind: FlushType,
    ctx: &mut DbContext,
    world: &LoadedWorld,
    config: &DumpConfig,
    hooks: &mut dyn CheckpointHooks,
) -> Result<(), DumpError> {
    match kind {
        FlushType::IfFull | FlushType::OneSecond => Ok(()),
        FlushType::AllNow => dump_database(DumpReason::Checkpoint, ctx, world, config, hooks),
        FlushType::Panic => dump_database(DumpReason::Panic, ctx, world, config, hooks),
    }
}

/// Byte size of the latest authoritative snapshot: the dump file once a
/// checkpoint has succeeded, otherwise the input file.
pub fn db_disk_size(ctx: &DbContext) -> io::Result<u64> {
    if ctx.dump_generation > 0
        && let Ok(md) = fs::metadata(&ctx.dump_db_name)
    {
        return Ok(md.len());
    }
    fs::metadata(&ctx.input_db_name).map(|md| md.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DbVersion;

    #[test]
    fn test_temp_names_carry_generation() {
        let ctx = DbContext::new("in.db".into(), "out.db".into());
        assert_eq!(temp_dump_name(&ctx, 3), "out.db.#3#");
        assert_eq!(panic_dump_name(&ctx), "out.db.PANIC");
    }

    #[test]
    fn test_empty_world_serialization() {
        let world = LoadedWorld {
            store: ObjectStore::new(),
            users: vec![],
            version: DbVersion::NextGen,
        };
        let mut out = Vec::new();
        {
            let mut w = DbioWriter::new(&mut out);
            write_db_file(&mut w, &world, "DUMPING").unwrap();
        }
        let text = String::from_utf8(out).unwrap();
        assert_eq!(
            text,
            "** LambdaMOO Database, Format Version 5 **\n0\n0\n0\n0\n\
             0 clocks\n0 queued tasks\n0 suspended tasks\n0 active connections\n"
        );
    }

    #[test]
    fn test_propval_count_mismatch_is_an_error() {
        let mut store = ObjectStore::new();
        {
            let o = store.new_object();
            o.propvals.push(crate::objects::PropVal {
                value: weald_var::v_int(1),
                owner: Obj::mk_id(0),
                perms: 0,
                is_clear: false,
            });
        }
        let world = LoadedWorld {
            store,
            users: vec![],
            version: DbVersion::NextGen,
        };
        let mut out = Vec::new();
        let mut w = DbioWriter::new(&mut out);
        assert!(write_db_file(&mut w, &world, "DUMPING").is_err());
    }
}
