/*
 * SPDX-FileCopyrightText: 2023 Inria
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! A small Adaptive Replacement Cache for decompressed blocks.
//!
//! ARC keeps two LRU lists, `t1` for blocks seen once and `t2` for blocks
//! seen at least twice, plus two "ghost" lists `b1`/`b2` remembering recent
//! evictions; the target size `p` of `t1` adapts to whichever ghost list is
//! being hit. Capacities here are tiny (16 entries per slot), so the lists
//! are plain deques.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct ArcCache {
    cap: usize,
    p: usize,
    t1: VecDeque<u64>,
    t2: VecDeque<u64>,
    b1: VecDeque<u64>,
    b2: VecDeque<u64>,
    values: HashMap<u64, Arc<[u8]>>,
}

fn remove(list: &mut VecDeque<u64>, key: u64) -> bool {
    if let Some(i) = list.iter().position(|&k| k == key) {
        list.remove(i);
        true
    } else {
        false
    }
}

impl ArcCache {
    pub fn new(cap: usize) -> Self {
        assert!(cap > 0);
        ArcCache {
            cap,
            p: 0,
            t1: VecDeque::new(),
            t2: VecDeque::new(),
            b1: VecDeque::new(),
            b2: VecDeque::new(),
            values: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Looks a block up, promoting it to the front of `t2` on a hit.
    pub fn get(&mut self, key: u64) -> Option<Arc<[u8]>> {
        if remove(&mut self.t1, key) || remove(&mut self.t2, key) {
            self.t2.push_front(key);
            return self.values.get(&key).cloned();
        }
        None
    }

    /// Demotes one resident entry to the appropriate ghost list.
    fn replace(&mut self, in_b2: bool) {
        if !self.t1.is_empty() && (self.t1.len() > self.p || (in_b2 && self.t1.len() == self.p)) {
            let victim = self.t1.pop_back().unwrap();
            self.values.remove(&victim);
            self.b1.push_front(victim);
        } else if let Some(victim) = self.t2.pop_back() {
            self.values.remove(&victim);
            self.b2.push_front(victim);
        }
    }

    /// Inserts a block, possibly evicting another.
    pub fn insert(&mut self, key: u64, value: Arc<[u8]>) {
        if self.values.contains_key(&key) {
            remove(&mut self.t1, key);
            remove(&mut self.t2, key);
            self.t2.push_front(key);
            self.values.insert(key, value);
            return;
        }
        if remove(&mut self.b1, key) {
            let delta = (self.b2.len() / self.b1.len().max(1)).max(1);
            self.p = (self.p + delta).min(self.cap);
            self.replace(false);
            self.t2.push_front(key);
            self.values.insert(key, value);
            return;
        }
        if remove(&mut self.b2, key) {
            let delta = (self.b1.len() / self.b2.len().max(1)).max(1);
            self.p = self.p.saturating_sub(delta);
            self.replace(true);
            self.t2.push_front(key);
            self.values.insert(key, value);
            return;
        }
        // A genuinely new key.
        if self.t1.len() + self.b1.len() == self.cap {
            if self.t1.len() < self.cap {
                self.b1.pop_back();
                self.replace(false);
            } else {
                let victim = self.t1.pop_back().unwrap();
                self.values.remove(&victim);
            }
        } else if self.t1.len() + self.t2.len() + self.b1.len() + self.b2.len() >= self.cap {
            if self.t1.len() + self.t2.len() + self.b1.len() + self.b2.len() == 2 * self.cap {
                self.b2.pop_back();
            }
            self.replace(false);
        }
        self.t1.push_front(key);
        self.values.insert(key, value);
    }
}
