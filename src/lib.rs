/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

#![doc = include_str!("../README.md")]
#![deny(unstable_features)]
#![deny(trivial_casts)]
#![deny(unconditional_recursion)]
#![deny(clippy::empty_loop)]
#![deny(unreachable_code)]
#![deny(unreachable_patterns)]
#![deny(unused_macro_rules)]

pub mod codec;
pub mod counts;
pub mod error;
pub mod index;
pub mod model;
pub mod properties;
pub mod storage;
pub mod temp;
pub mod vocab;

/// A vocabulary identifier. Ids are dense: `0..U` for `U` unigrams.
pub type Id = u32;

/// Sentinel for "no node position".
pub const NONE: usize = usize::MAX;

/// Sentinel log-probability meaning "absent, back off".
pub const LOGPROB_MIN: f32 = f32::MIN;

/// The log-probability assigned to `<s>` as an event, following the SRILM
/// convention of −99 in base 10.
pub fn logprob_bos() -> f32 {
    -99.0 * std::f32::consts::LN_10
}

/// Prelude module to import everything from this crate.
pub mod prelude {
    pub use crate::codec::*;
    pub use crate::counts::*;
    pub use crate::error::Error;
    pub use crate::index::*;
    pub use crate::model::*;
    pub use crate::properties::*;
    pub use crate::storage::*;
    pub use crate::temp::*;
    pub use crate::vocab::*;
    pub use crate::{logprob_bos, Id, LOGPROB_MIN, NONE};
}
