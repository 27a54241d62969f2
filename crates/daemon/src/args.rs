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

use clap::builder::ValueHint;
use clap_derive::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "weald-daemon",
    about = "Load a world snapshot, serve it, and checkpoint it back to disk"
)]
pub struct Args {
    #[arg(
        value_name = "input-db-file",
        help = "Path of the snapshot to load the world from",
        value_hint = ValueHint::FilePath
    )]
    pub input_db: PathBuf,

    #[arg(
        value_name = "output-db-file",
        help = "Path checkpoints are written to",
        value_hint = ValueHint::FilePath
    )]
    pub output_db: PathBuf,

    #[arg(
        long,
        value_name = "seconds",
        help = "Seconds between automatic checkpoints",
        default_value = "3600"
    )]
    pub checkpoint_interval: u64,

    #[arg(
        long,
        help = "Run checkpoints synchronously in the server process instead of a forked child"
    )]
    pub unforked_checkpoints: bool,
}
