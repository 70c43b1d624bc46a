/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Tommaso Fontana
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

use anyhow::{Context, Result};
use clap::{ArgMatches, Args, Command, FromArgMatches};
use log::info;
use ngramix::model::NGramModel;
use ngramix::Id;
use std::io::{BufRead, Write};
use std::path::PathBuf;

pub const COMMAND_NAME: &str = "score";

#[derive(Args, Debug)]
#[command(about = "Scores sentences, one per line, printing logprob and OOV count.", long_about = None)]
struct CliArgs {
    /// The model repository.
    #[arg(long)]
    ngram: PathBuf,
    /// Sentences to score; standard input if absent.
    input: Option<PathBuf>,
    /// Expected shard count; the repository's own if absent.
    #[arg(long)]
    shard: Option<usize>,
}

pub fn cli(command: Command) -> Command {
    command.subcommand(CliArgs::augment_args(Command::new(COMMAND_NAME)))
}

fn score_lines(model: &NGramModel, lines: impl Iterator<Item = std::io::Result<String>>) -> Result<()> {
    let stdout = std::io::stdout();
    let mut out = std::io::BufWriter::new(stdout.lock());
    let vocab = model.index.vocab();
    let mut total = 0.0f64;
    let mut total_oov = 0usize;
    let mut ids: Vec<Id> = Vec::new();
    for line in lines {
        let line = line.context("Cannot read input line")?;
        ids.clear();
        ids.extend(line.split_whitespace().map(|w| vocab.id_or_unk(w)));
        let (logprob, oov) = model.score_sequence(&ids)?;
        writeln!(out, "{}\t{}", logprob, oov)?;
        total += logprob as f64;
        total_oov += oov;
    }
    out.flush()?;
    info!("total: {} ({} OOV)", total, total_oov);
    Ok(())
}

pub fn main(submatches: &ArgMatches) -> Result<()> {
    let args = CliArgs::from_arg_matches(submatches)?;
    let model = NGramModel::open(&args.ngram, args.shard)?;
    match &args.input {
        Some(path) => {
            let file = std::fs::File::open(path)
                .with_context(|| format!("Cannot open {}", path.display()))?;
            score_lines(&model, std::io::BufReader::new(file).lines())
        }
        None => {
            let stdin = std::io::stdin();
            score_lines(&model, stdin.lock().lines())
        }
    }
}
