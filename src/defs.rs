//
// libskry_r - astronomical image stacking
// Copyright (c) 2017 Filip Szczerek <ga.software@yahoo.com>
//
// This project is licensed under the terms of the MIT license
// (see the LICENSE file for details).
//
//
// File description:
//   Common definitions.
//

use crate::image::{Image, ImageError};
use crate::triangulation::TriangulationError;
use serde::{Deserialize, Serialize};
use std::cmp::{max, min};
use std::ops::{Add, AddAssign, Sub};
use thiserror::Error;


pub const WHITE_8BIT: u8 = 0xFF;


#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct PointFlt {
    pub x: f32,
    pub y: f32
}


impl std::fmt::Display for PointFlt {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "({:0.1}, {:0.1})", self.x, self.y)
    }
}


#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct Point {
    pub x: i32,
    pub y: i32
}


impl Add for Point {
    type Output = Point;

    fn add(self, other: Point) -> Point {
        Point{ x: self.x + other.x, y: self.y + other.y }
    }
}


impl Sub for Point {
    type Output = Point;

    fn sub(self, other: Point) -> Point {
        Point{ x: self.x - other.x, y: self.y - other.y }
    }
}


impl AddAssign for Point {
    fn add_assign(&mut self, other: Point) {
        self.x += other.x;
        self.y += other.y;
    }
}


impl std::fmt::Display for Point {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}


impl Point {
    pub fn sqr_dist(p1: &Point, p2: &Point) -> i32 {
        sqr!(p1.x - p2.x) + sqr!(p1.y - p2.y)
    }
}


#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32
}


impl Rect {
    pub fn contains_point(&self, p: &Point) -> bool {
        p.x >= self.x && p.x < self.x + self.width as i32 && p.y >= self.y && p.y < self.y + self.height as i32
    }


    pub fn contains_rect(&self, other: &Rect) -> bool {
        other.x >= self.x && other.y >= self.y &&
        other.x + other.width as i32 <= self.x + self.width as i32 &&
        other.y + other.height as i32 <= self.y + self.height as i32
    }


    pub fn get_pos(&self) -> Point { Point{ x: self.x, y: self.y } }


    pub fn is_empty(&self) -> bool { self.width == 0 || self.height == 0 }


    /// Returns the common part of `self` and `other`, or `None` if they do not overlap.
    pub fn intersection(&self, other: &Rect) -> Option<Rect> {
        let x = max(self.x, other.x);
        let y = max(self.y, other.y);
        let xend = min(self.x + self.width as i32, other.x + other.width as i32);
        let yend = min(self.y + self.height as i32, other.y + other.height as i32);

        if xend <= x || yend <= y {
            None
        } else {
            Some(Rect{ x, y, width: (xend - x) as u32, height: (yend - y) as u32 })
        }
    }
}


#[derive(Debug, Error)]
pub enum ProcessingError {
    /// There are no more steps in the current processing phase.
    #[error("no more steps in the current processing phase")]
    NoMoreSteps,

    /// Processing phase was asked for its results before completing.
    #[error("processing phase has not completed yet")]
    NotComplete,

    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("out of memory")]
    OutOfMemory,

    #[error(transparent)]
    ImageError(#[from] ImageError),

    #[error(transparent)]
    Triangulation(#[from] TriangulationError)
}


/// Represents a single processing phase.
pub trait ProcessingPhase {
    /// Executes one processing step.
    ///
    /// Returns `Err(ProcessingError::NoMoreSteps)` after the last image has been processed.
    ///
    fn step(&mut self) -> Result<(), ProcessingError>;


    /// Returns a copy of the image that was processed by the last call to `step()`.
    ///
    /// Can be used to show processing visualization.
    ///
    fn get_curr_img(&mut self) -> Result<Image, ImageError>;
}
