/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Tommaso Fontana
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

use anyhow::{Context, Result};
use clap::{ArgMatches, Args, Command, FromArgMatches};
use ngramix::model::NGramModel;
use std::path::PathBuf;

pub const COMMAND_NAME: &str = "to-arpa";

#[derive(Args, Debug)]
#[command(about = "Exports a model repository in ARPA format.", long_about = None)]
struct CliArgs {
    /// The model repository.
    ngram: PathBuf,
    /// The destination file; standard output if absent.
    #[arg(short, long)]
    output: Option<PathBuf>,
    /// Expected shard count; the repository's own if absent.
    #[arg(long)]
    shard: Option<usize>,
}

pub fn cli(command: Command) -> Command {
    command.subcommand(CliArgs::augment_args(Command::new(COMMAND_NAME)))
}

pub fn main(submatches: &ArgMatches) -> Result<()> {
    let args = CliArgs::from_arg_matches(submatches)?;
    let model = NGramModel::open(&args.ngram, args.shard)?;
    match &args.output {
        Some(path) => {
            let file = std::fs::File::create(path)
                .with_context(|| format!("Cannot create {}", path.display()))?;
            model.to_arpa(file)
        }
        None => {
            let stdout = std::io::stdout();
            model.to_arpa(stdout.lock())
        }
    }
}
