/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Tommaso Fontana
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Command line interface structs and functions, organized by subcommands.

pub mod estimate;
pub mod extract;
pub mod from_arpa;
pub mod index;
pub mod quantize;
pub mod score;
pub mod to_arpa;
