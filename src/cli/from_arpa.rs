/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Tommaso Fontana
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

use anyhow::{Context, Result};
use clap::{ArgMatches, Args, Command, FromArgMatches};
use ngramix::model::from_arpa;
use ngramix::temp::{self, TempRoot};
use std::path::PathBuf;

pub const COMMAND_NAME: &str = "from-arpa";

#[derive(Args, Debug)]
#[command(about = "Imports an ARPA model into a sharded repository.", long_about = None)]
struct CliArgs {
    /// The ARPA file; standard input if absent.
    arpa: Option<PathBuf>,
    /// The destination model repository.
    #[arg(short, long)]
    output: PathBuf,
    /// The number of shards.
    #[arg(long, default_value_t = num_cpus::get())]
    shard: usize,
    /// Keep the forward orientation instead of reorganising for serving.
    #[arg(long)]
    forward: bool,
    /// Skip the upper-bound computation.
    #[arg(long)]
    no_bounds: bool,
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

    let mut model = match &args.arpa {
        Some(path) => {
            let file = std::fs::File::open(path)
                .with_context(|| format!("Cannot open {}", path.display()))?;
            from_arpa(std::io::BufReader::new(file), args.shard, &temp_root)?
        }
        None => {
            let stdin = std::io::stdin();
            from_arpa(stdin.lock(), args.shard, &temp_root)?
        }
    };
    if !args.no_bounds {
        model.bounds()?;
    }
    let model = if args.forward {
        model
    } else {
        model.backward(&temp_root)?
    };

    temp::register(&args.output);
    model.write(&args.output)?;
    temp::unregister(&args.output);
    Ok(())
}
