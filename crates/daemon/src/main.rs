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

use std::time::{Duration, Instant};

use clap::Parser;
use eyre::{Report, WrapErr};
use signal_hook::consts::{SIGCHLD, SIGINT, SIGTERM, SIGUSR1, SIGUSR2};
use signal_hook::iterator::Signals;
use tracing::{error, info, warn};

use weald_db::{
    CheckpointHooks, DbContext, DumpConfig, FlushType, db_flush, db_load, db_shutdown,
};
use weald_exec::ExecWaiters;

use crate::args::Args;

mod args;

struct ServerHooks;

impl CheckpointHooks for ServerHooks {}

fn main() -> Result<(), Report> {
    color_eyre::install()?;
    tracing_subscriber::fmt().with_target(false).init();

    let args = Args::parse();

    let mut ctx = DbContext::new(args.input_db.clone(), args.output_db.clone());
    let world = db_load(&mut ctx).wrap_err("world load failed; not starting")?;
    info!(
        "World up: {} object slots, {} players, format version {}",
        world.store.len(),
        world.users.len(),
        world.version as u16
    );

    let dump_config = DumpConfig {
        unforked_checkpoints: args.unforked_checkpoints,
    };
    let mut waiters = ExecWaiters::new();
    let mut hooks = ServerHooks;

    let mut signals = Signals::new([SIGINT, SIGTERM, SIGUSR1, SIGUSR2, SIGCHLD])?;
    let checkpoint_interval = Duration::from_secs(args.checkpoint_interval);
    let mut last_checkpoint = Instant::now();

    info!(
        "Serving; checkpointing every {} seconds to {}",
        args.checkpoint_interval,
        args.output_db.display()
    );

    'serve: loop {
        for signal in signals.pending() {
            match signal {
                SIGINT | SIGTERM | SIGUSR1 => {
                    info!("Shutdown requested (signal {signal})");
                    break 'serve;
                }
                SIGUSR2 => {
                    info!("Checkpoint requested (signal {signal})");
                    if let Err(e) =
                        db_flush(FlushType::AllNow, &mut ctx, &world, &dump_config, &mut hooks)
                    {
                        error!("Checkpoint failed: {e}");
                    }
                    last_checkpoint = Instant::now();
                }
                SIGCHLD => reap_children(&mut waiters),
                _ => {}
            }
        }

        if last_checkpoint.elapsed() >= checkpoint_interval {
            if let Err(e) = db_flush(FlushType::AllNow, &mut ctx, &world, &dump_config, &mut hooks)
            {
                error!("Checkpoint failed: {e}");
            }
            last_checkpoint = Instant::now();
        }

        std::thread::sleep(Duration::from_millis(250));
    }

    db_shutdown(&mut ctx, &world, &dump_config);
    Ok(())
}

/// Reap every exited child. A pid with an exec waiter resumes that task;
/// checkpoint children just get their status logged.
fn reap_children(waiters: &mut ExecWaiters) {
    loop {
        let mut status = 0;
        let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
        if pid <= 0 {
            break;
        }
        let code = if libc::WIFEXITED(status) {
            libc::WEXITSTATUS(status)
        } else {
            -1
        };
        if waiters.completed(pid, code) {
            info!("EXEC: Child {pid} finished with status {code}");
        } else if code != 0 {
            warn!("Child process {pid} exited with status {code}");
        } else {
            info!("Child process {pid} exited");
        }
    }
}
