/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Tommaso Fontana
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

use anyhow::{Context, Result};
use clap::{ArgMatches, Args, Command, FromArgMatches};
use ngramix::counts::{extract_corpus, DEFAULT_WATERMARK};
use ngramix::temp;
use std::io::BufRead;
use std::path::PathBuf;

pub const COMMAND_NAME: &str = "extract";

#[derive(Args, Debug)]
#[command(about = "Counts the n-grams of a corpus into a Google-layout tree.", long_about = None)]
struct CliArgs {
    /// The corpus, one sentence per line; standard input if absent.
    corpus: Option<PathBuf>,
    /// The destination count directory.
    #[arg(short, long)]
    output: PathBuf,
    /// The highest n-gram order to count.
    #[arg(long, default_value_t = 5)]
    order: usize,
    /// Memory watermark in bytes before counts spill to disk.
    #[arg(long, default_value_t = DEFAULT_WATERMARK)]
    watermark: usize,
}

pub fn cli(command: Command) -> Command {
    command.subcommand(CliArgs::augment_args(Command::new(COMMAND_NAME)))
}

pub fn main(submatches: &ArgMatches) -> Result<()> {
    let args = CliArgs::from_arg_matches(submatches)?;
    std::fs::create_dir_all(&args.output)
        .with_context(|| format!("Cannot create {}", args.output.display()))?;
    // An interrupted run leaves no partial count tree behind.
    temp::register(&args.output);

    match &args.corpus {
        Some(path) => {
            let file = std::fs::File::open(path)
                .with_context(|| format!("Cannot open corpus {}", path.display()))?;
            extract_corpus(
                std::io::BufReader::new(file).lines(),
                &args.output,
                args.order,
                args.watermark,
            )?;
        }
        None => {
            let stdin = std::io::stdin();
            extract_corpus(stdin.lock().lines(), &args.output, args.order, args.watermark)?;
        }
    }
    temp::unregister(&args.output);
    Ok(())
}
