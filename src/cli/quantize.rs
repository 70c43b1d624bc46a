/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Tommaso Fontana
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

use anyhow::Result;
use clap::{ArgMatches, Args, Command, FromArgMatches};
use log::info;
use ngramix::model::NGramModel;
use ngramix::temp;
use std::path::PathBuf;

pub const COMMAND_NAME: &str = "quantize";

#[derive(Args, Debug)]
#[command(about = "Quantizes a model's value arrays to 8 bits per entry.", long_about = None)]
struct CliArgs {
    /// The model repository.
    ngram: PathBuf,
    /// The destination model repository.
    #[arg(short, long)]
    output: PathBuf,
    /// Expected shard count; the repository's own if absent.
    #[arg(long)]
    shard: Option<usize>,
}

pub fn cli(command: Command) -> Command {
    command.subcommand(CliArgs::augment_args(Command::new(COMMAND_NAME)))
}

pub fn main(submatches: &ArgMatches) -> Result<()> {
    let args = CliArgs::from_arg_matches(submatches)?;
    let mut model = NGramModel::open(&args.ngram, args.shard)?;
    model.quantize()?;
    temp::register(&args.output);
    model.write(&args.output)?;
    temp::unregister(&args.output);
    info!("quantized model written to {}", args.output.display());
    Ok(())
}
