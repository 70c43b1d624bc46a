/*
 * SPDX-FileCopyrightText: 2023 Inria
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Memory-mapped storage primitives: raw and block-compressed byte arrays,
//! packed integer vectors and the succinct bit vector backing the trie.

mod arc_cache;
pub use arc_cache::*;

mod block_file;
pub use block_file::*;

mod bitvec;
pub use bitvec::*;

mod mmap;
pub use mmap::*;

mod packed;
pub use packed::*;
