/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Tommaso Fontana
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

use anyhow::Result;
use clap::{ArgMatches, Args, Command, FromArgMatches};
use log::info;
use ngramix::counts::NGramCounts;
use ngramix::temp::{self, TempRoot};
use std::path::PathBuf;

pub const COMMAND_NAME: &str = "estimate";

#[derive(Args, Debug)]
#[command(about = "Estimates a serving model from a count repository.", long_about = None)]
struct CliArgs {
    /// The count repository.
    ngram: PathBuf,
    /// The destination model repository.
    #[arg(short, long)]
    output: PathBuf,
    /// Expected shard count; the repository's own if absent.
    #[arg(long)]
    shard: Option<usize>,
    /// Treat <unk> as a zero event during estimation.
    #[arg(long)]
    remove_unk: bool,
    /// Override the temporary-file root.
    #[arg(long)]
    temporary: Option<PathBuf>,
}

pub fn cli(command: Command) -> Command {
    command.subcommand(CliArgs::augment_args(Command::new(COMMAND_NAME)))
}

pub fn main(submatches: &ArgMatches) -> Result<()> {
    let args = CliArgs::from_arg_matches(submatches)?;
    let temp_root = TempRoot::new(args.temporary.clone());

    let mut counts = NGramCounts::open(&args.ngram, args.shard)?;
    if !counts.has_types() {
        counts.modify()?;
    }
    let mut model = counts.estimate(args.remove_unk)?;
    model.bounds()?;
    let model = model.backward(&temp_root)?;

    temp::register(&args.output);
    model.write(&args.output)?;
    temp::unregister(&args.output);
    let (bytes, packed) = model.index.stat();
    let values: usize = model.logprobs.iter().map(|data| data.size_bytes()).sum();
    info!(
        "model written to {}: index {} bytes ({} packed), {} value bytes per array",
        args.output.display(),
        bytes,
        packed,
        values
    );
    Ok(())
}
