//
// libskry_r - astronomical image stacking
// Copyright (c) 2017 Filip Szczerek <ga.software@yahoo.com>
//
// This project is licensed under the terms of the MIT license
// (see the LICENSE file for details).
//
//
// File description:
//   Library root.
//


#[macro_use]
mod utils;

pub mod config;
pub mod defs;
pub mod filters;
pub mod image;
pub mod img_align;
pub mod img_seq;
pub mod quality;
pub mod ref_pt_align;
pub mod stacking;
pub mod triangulation;

mod blk_match;
mod img_list;
mod img_mem;

#[cfg(test)]
mod test_utils;
