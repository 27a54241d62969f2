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

//! Framing for the task-queue and active-connections sections at the tail of
//! a snapshot. Their contents belong to the scheduler and the network layer;
//! here they are parsed for shape and dropped, and written back empty.

use std::io::{self, Read, Write};

use crate::dbio::{DbioError, DbioReader, DbioWriter};
use crate::DbVersion;

pub(crate) fn read_task_queue<R: Read>(
    dbio: &mut DbioReader<R>,
    version: DbVersion,
) -> Result<(), DbioError> {
    let clocks = read_counted_line(dbio, " clocks")?;
    for _ in 0..clocks {
        let _ = dbio.read_string()?;
    }

    let queued_tasks = read_counted_line(dbio, " queued tasks")?;
    for _ in 0..queued_tasks {
        let _task_desc = dbio.read_number_line(4)?;
        read_activ_as_pi(dbio)?;
    }

    let suspended_tasks = read_counted_line(dbio, " suspended tasks")?;
    for _ in 0..suspended_tasks {
        let _task_line = dbio.read_string()?;
        read_vm(dbio, version)?;
    }

    Ok(())
}

pub(crate) fn read_active_connections<R: Read>(dbio: &mut DbioReader<R>) -> Result<(), DbioError> {
    let line = dbio.read_string()?;
    let has_listeners = line.ends_with(" with listeners");
    let count_str = if has_listeners {
        line.trim_end_matches(" active connections with listeners")
    } else {
        line.trim_end_matches(" active connections")
    };
    let count: usize = count_str.trim().parse().map_err(|e| {
        DbioError::Parse(
            format!("invalid active connections count ({count_str}): {e}"),
            dbio.line_num,
        )
    })?;
    for _ in 0..count {
        if has_listeners {
            let _who_listener = dbio.read_number_line(2)?;
        } else {
            let _who = dbio.read_num()?;
        }
    }
    Ok(())
}

fn read_counted_line<R: Read>(dbio: &mut DbioReader<R>, suffix: &str) -> Result<usize, DbioError> {
    let line = dbio.read_string()?;
    let count_str = line.trim_end_matches(suffix);
    count_str.trim().parse().map_err(|e| {
        DbioError::Parse(
            format!("invalid{suffix} count ({count_str}): {e}"),
            dbio.line_num,
        )
    })
}

/// One suspended virtual machine: a frame count, then that many activations.
fn read_vm<R: Read>(dbio: &mut DbioReader<R>, version: DbVersion) -> Result<(), DbioError> {
    let vm_header = dbio.read_number_line(3)?;
    let top = vm_header[0].max(0) as usize;
    for _ in 0..top {
        read_activ(dbio, version)?;
    }
    Ok(())
}

fn read_activ<R: Read>(dbio: &mut DbioReader<R>, version: DbVersion) -> Result<(), DbioError> {
    // Frames carry their own language version from Float onward.
    if version > DbVersion::Float {
        let _lang_version = dbio.read_string()?;
    }
    let _program = dbio.read_program(version, || "suspended task frame".into())?;
    read_rt_env(dbio)?;

    let stack_in_use = read_counted_line(dbio, " rt_stack slots in use")?;
    for _ in 0..stack_in_use {
        let _entry = dbio.read_var()?;
    }
    read_activ_as_pi(dbio)?;
    let _temp = dbio.read_var()?;
    Ok(())
}

fn read_rt_env<R: Read>(dbio: &mut DbioReader<R>) -> Result<(), DbioError> {
    let num_variables = read_counted_line(dbio, " variables")?;
    for _ in 0..num_variables {
        let _name = dbio.read_string()?;
        let _value = dbio.read_var()?;
    }
    Ok(())
}

fn read_activ_as_pi<R: Read>(dbio: &mut DbioReader<R>) -> Result<(), DbioError> {
    let _this = dbio.read_var()?;
    let _a_line = dbio.read_number_line(9)?;
    let _argstr = dbio.read_string()?;
    let _dobjstr = dbio.read_string()?;
    let _iobjstr = dbio.read_string()?;
    let _prepstr = dbio.read_string()?;
    let _verb = dbio.read_string()?;
    let _verbname = dbio.read_string()?;
    Ok(())
}

pub(crate) fn write_task_queue<W: Write>(w: &mut DbioWriter<W>) -> io::Result<()> {
    w.write_line("0 clocks")?;
    w.write_line("0 queued tasks")?;
    w.write_line("0 suspended tasks")
}

pub(crate) fn write_active_connections<W: Write>(w: &mut DbioWriter<W>) -> io::Result<()> {
    w.write_line("0 active connections")
}
