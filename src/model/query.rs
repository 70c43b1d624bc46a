/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Scoring: log-probabilities and admissible upper bounds with recorded
//! state.
//!
//! The returned state is the maximal stored suffix of `context + word`, so
//! feeding it to the next call scores a sentence incrementally in O(order)
//! per word. State queries need backward storage; n-gram and sequence
//! scoring work on either orientation.

use super::NGramModel;
use crate::error::Error;
use crate::index::State;
use crate::vocab::{BOS, UNK};
use crate::{logprob_bos, Id, LOGPROB_MIN, NONE};
use anyhow::Result;

impl NGramModel {
    pub fn root(&self) -> State {
        self.index.root()
    }

    fn require_backward(&self) -> Result<()> {
        if !self.index.backward() {
            return Err(Error::CorruptIndex(
                "state queries require a backward index; reorganise the model first".into(),
            )
            .into());
        }
        Ok(())
    }

    /// `log P(word | context)`, with the successor state.
    pub fn score(&self, state: State, word: Id) -> Result<(State, f32)> {
        self.require_backward()?;
        self.score_state(state, word, false)
    }

    /// The admissible upper bound used for pruning, with the successor
    /// state.
    pub fn bound(&self, state: State, word: Id) -> Result<(State, f32)> {
        self.require_backward()?;
        self.score_state(state, word, true)
    }

    fn score_state(&self, state: State, word: Id, use_bounds: bool) -> Result<(State, f32)> {
        let max_order = self.index.order();
        let mut state = state;
        while self.index.state_order(state) + 1 > max_order {
            state = self.index.suffix(state);
        }

        let mut state_ret = State::root();
        let mut have_ret = false;
        let mut backoffed = false;
        let mut logbackoff = 0.0f32;
        loop {
            let order = self.index.state_order(state) + 1;
            let next = self.index.next(state, word);
            if !next.is_root_node() {
                if !have_ret {
                    state_ret = if order >= max_order {
                        self.index.suffix(next)
                    } else {
                        next
                    };
                    have_ret = true;
                }
                let shard = next.value_shard();
                let logprob = if use_bounds && !backoffed {
                    self.logbound_at(shard, next.node(), order)?
                } else {
                    self.logprob_at(shard, next.node(), order)?
                };
                if logprob != LOGPROB_MIN {
                    return Ok((state_ret, logprob + logbackoff));
                }
            }
            backoffed = true;
            if state.is_root_node() {
                let logprob = if word == BOS {
                    logprob_bos()
                } else {
                    self.smooth
                };
                return Ok((state_ret, logprob + logbackoff));
            }
            logbackoff += self.backoff_at(state.value_shard(), state.node(), order - 1)?;
            state = self.index.suffix(state);
        }
    }

    /// `log P(last | rest)` of an explicit n-gram, on either orientation.
    pub fn logprob_ngram(&self, ngram: &[Id]) -> Result<f32> {
        self.ngram_value(ngram, false)
    }

    /// The upper bound of an explicit n-gram.
    pub fn logbound_ngram(&self, ngram: &[Id]) -> Result<f32> {
        self.ngram_value(ngram, true)
    }

    fn ngram_value(&self, ngram: &[Id], use_bounds: bool) -> Result<f32> {
        if ngram.is_empty() {
            return Ok(0.0);
        }
        let n = ngram.len().min(self.index.order());
        let window = &ngram[ngram.len() - n..];
        if self.index.backward() {
            let (context, word) = window.split_at(window.len() - 1);
            let state = self.context_state(context);
            self.score_state(state, word[0], use_bounds).map(|r| r.1)
        } else {
            self.forward_walk(window, use_bounds)
        }
    }

    /// The state of the longest stored suffix of a forward-order context.
    fn context_state(&self, context: &[Id]) -> State {
        let mut key = Vec::with_capacity(context.len());
        for start in 0..context.len() {
            key.clear();
            key.extend(context[start..].iter().rev());
            let shard = self.index.shard_index(&key);
            let (matched, pos) = self.index.traverse(shard, &key);
            if matched == key.len() {
                return if key.len() == 1 {
                    State::unigram(key[0])
                } else {
                    State::at(shard, pos)
                };
            }
        }
        State::root()
    }

    /// The back-off walk over a forward index, §-style: try the full
    /// n-gram, else charge the matched context's back-off and drop the
    /// oldest token.
    fn forward_walk(&self, window: &[Id], use_bounds: bool) -> Result<f32> {
        let mut acc = 0.0f32;
        let mut backoffed = false;
        for start in 0..window.len() {
            let key = &window[start..];
            let order = key.len();
            let shard = self.index.shard_index(key);
            // Back-offs of unigram contexts always read shard 0.
            let shard_backoff = if order == 2 { 0 } else { shard };
            let (matched, pos) = self.index.traverse(shard, key);

            if order == 1 {
                if matched == 1 {
                    let logprob = if use_bounds && !backoffed {
                        self.logbound_at(0, pos, 1)?
                    } else {
                        self.logprob_at(0, pos, 1)?
                    };
                    if logprob != LOGPROB_MIN {
                        return Ok(acc + logprob);
                    }
                }
                return Ok(acc
                    + if matched == 1 && key[0] == BOS {
                        logprob_bos()
                    } else {
                        self.smooth
                    });
            }

            if matched == key.len() {
                let logprob = if use_bounds && !backoffed {
                    self.logbound_at(shard, pos, order)?
                } else {
                    self.logprob_at(shard, pos, order)?
                };
                if logprob != LOGPROB_MIN {
                    return Ok(acc + logprob);
                }
                let parent = self.index.shard(shard).parent(pos);
                if parent != NONE {
                    acc += self.backoff_at(shard_backoff, parent, order - 1)?;
                }
            } else if matched == key.len() - 1 {
                acc += self.backoff_at(shard_backoff, pos, order - 1)?;
            }
            backoffed = true;
        }
        unreachable!("the unigram iteration always returns");
    }

    /// Scores a sequence, returning the total log-probability and the
    /// number of out-of-vocabulary tokens. Empty sequences score 0.
    pub fn score_sequence(&self, ids: &[Id]) -> Result<(f32, usize)> {
        let mut total = 0.0f32;
        let mut oov = 0usize;
        if self.index.backward() {
            let mut state = self.root();
            for &id in ids {
                if id == UNK || id as usize >= self.index.unigrams() {
                    oov += 1;
                }
                let (next, logprob) = self.score_state(state, id, false)?;
                total += logprob;
                state = next;
            }
        } else {
            for i in 0..ids.len() {
                if ids[i] == UNK || ids[i] as usize >= self.index.unigrams() {
                    oov += 1;
                }
                let start = (i + 1).saturating_sub(self.index.order());
                total += self.logprob_ngram(&ids[start..=i])?;
            }
        }
        Ok((total, oov))
    }

    /// Whether the full n-gram is stored.
    pub fn exists(&self, ngram: &[Id]) -> bool {
        if ngram.is_empty() {
            return false;
        }
        let key: Vec<Id> = if self.index.backward() {
            ngram.iter().rev().copied().collect()
        } else {
            ngram.to_vec()
        };
        let (matched, _) = self.index.traverse_any(&key);
        matched == key.len()
    }
}
