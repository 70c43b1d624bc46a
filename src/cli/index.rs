/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Tommaso Fontana
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

use anyhow::Result;
use clap::{ArgMatches, Args, Command, FromArgMatches};
use log::info;
use ngramix::counts::{index_counts, GoogleCounts};
use ngramix::temp;
use std::path::PathBuf;

pub const COMMAND_NAME: &str = "index";

#[derive(Args, Debug)]
#[command(about = "Builds a sharded count repository from Google-layout count files.", long_about = None)]
struct CliArgs {
    /// The root of the Google-layout count tree.
    counts: PathBuf,
    /// The destination count repository.
    #[arg(short, long)]
    output: PathBuf,
    /// The number of shards (the parallelism degree).
    #[arg(long, default_value_t = num_cpus::get())]
    shard: usize,
    /// Limit the indexed order; everything available if absent.
    #[arg(long)]
    order: Option<usize>,
}

pub fn cli(command: Command) -> Command {
    command.subcommand(CliArgs::augment_args(Command::new(COMMAND_NAME)))
}

pub fn main(submatches: &ArgMatches) -> Result<()> {
    let args = CliArgs::from_arg_matches(submatches)?;
    let source = GoogleCounts::open(&args.counts)?;
    let order = args.order.unwrap_or_else(|| source.order());
    let counts = index_counts(&source, order, args.shard)?;
    temp::register(&args.output);
    counts.write(&args.output)?;
    temp::unregister(&args.output);
    let (bytes, packed) = counts.index.stat();
    info!("index: {} bytes, {} packed", bytes, packed);
    Ok(())
}
