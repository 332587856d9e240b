//
// libskry_r - astronomical image stacking
// Copyright (c) 2017 Filip Szczerek <ga.software@yahoo.com>
//
// This project is licensed under the terms of the MIT license
// (see the LICENSE file for details).
//
//
// File description:
//   Delaunay triangulation.
//

use crate::defs::{Point, Rect};
use thiserror::Error;


#[derive(Debug, Error, PartialEq, Eq)]
pub enum TriangulationError {
    #[error("point {index} at {pos} lies outside the triangulation envelope")]
    PointOutsideEnvelope { index: usize, pos: Point },

    #[error("point {index} at {pos} duplicates another point")]
    DuplicatePoint { index: usize, pos: Point }
}


#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Edge {
    /// First vertex
    pub v0: usize,
    /// Second vertex
    pub v1: usize,

    /// First adjacent triangle (if `None`, `t1` is not `None`)
    pub t0: Option<usize>,
    /// Second adjacent triangle (if `None`, `t0` is not `None`)
    pub t1: Option<usize>,

    /// First opposite vertex (if `None`, `w1` is not `None`)
    pub w0: Option<usize>,
    /// Second opposite vertex (if `None`, `w0` is not `None`)
    pub w1: Option<usize>
}


/// Vertices and edges are specified in the same rotational order for all triangles
/// (the cross product of `v0->v1` and `v0->v2` is positive).
///
/// Note: in `Triangulation.edges` the edges' vertices may not be specified in the order
/// mentioned below for `e0`, `e1`, `e2`.
///
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Triangle {
    /// First vertex
    pub v0: usize,
    /// Second vertex
    pub v1: usize,
    /// Third vertex
    pub v2: usize,

    /// First edge (contains v0, v1)
    pub e0: usize,
    /// Second edge (contains v1, v2)
    pub e1: usize,
    /// Third edge (contains v2, v0)
    pub e2: usize
}


impl Triangle {
    pub fn contains(&self, vertex: usize) -> bool {
        vertex == self.v0 || vertex == self.v1 || vertex == self.v2
    }


    pub fn next_vertex(&self, vertex: usize) -> usize {
        if vertex == self.v0 {
            self.v1
        } else if vertex == self.v1 {
            self.v2
        } else if vertex == self.v2 {
            self.v0
        } else {
            panic!("Attempted to get next vertex after {} in triangle ({}, {}, {}).",
                   vertex, self.v0, self.v1, self.v2);
        }
    }


    /// Returns the vertex which does not belong to the edge `(va, vb)`.
    pub fn opposite_vertex(&self, va: usize, vb: usize) -> usize {
        [self.v0, self.v1, self.v2].into_iter()
            .find(|&v| v != va && v != vb)
            .unwrap_or_else(|| panic!("Triangle ({}, {}, {}) is degenerate.", self.v0, self.v1, self.v2))
    }


    /// Returns the 'leading' edge of a vertex.
    ///
    /// Each vertex has a 'leading' and a 'trailing' edge (in the order of vertices).
    /// The 'leading' edge is the one which contains the vertex and the vertex which succeeds it.
    ///
    pub fn get_leading_edge_containing_vertex(&self, vertex: usize) -> usize {
        if vertex == self.v0 {
            self.e0
        } else if vertex == self.v1 {
            self.e1
        } else if vertex == self.v2 {
            self.e2
        } else {
            panic!("Attempted to get leading edge containing vertex {} in triangle ({}, {}, {}).",
                   vertex, self.v0, self.v1, self.v2);
        }
    }


    pub fn edges(&self) -> [usize; 3] { [self.e0, self.e1, self.e2] }
}


/// Where a new point falls in the existing triangulation.
enum Location {
    InsideTriangle(usize),
    OnEdge(usize)
}


/// Relative tolerance of the circumcircle test; points (almost) on the circle are not inside.
const CIRCUMCIRCLE_TOLERANCE: f64 = 1.0e-9;


#[derive(Clone, Debug, Default)]
pub struct Triangulation {
    vertices: Vec<Point>,
    edges: Vec<Edge>,
    triangles: Vec<Triangle>
}


impl Triangulation {
    pub fn get_vertices(&self) -> &[Point] {
        &self.vertices[..]
    }


    pub fn get_edges(&self) -> &[Edge] {
        &self.edges[..]
    }


    pub fn get_triangles(&self) -> &[Triangle] {
        &self.triangles[..]
    }


    /// Finds Delaunay triangulation for the specified point set (all have to be different).
    ///
    /// Also adds three additional points (at the end of the vertex list) for the initial triangle
    /// which strictly contains `envelope`. `envelope` (including its border) has to contain all `points`.
    ///
    pub fn find_delaunay_triangulation(points: &[Point], envelope: &Rect) -> Result<Triangulation, TriangulationError> {
        for (index, pos) in points.iter().enumerate() {
            if pos.x < envelope.x || pos.x > envelope.x + envelope.width as i32 ||
               pos.y < envelope.y || pos.y > envelope.y + envelope.height as i32 {
                return Err(TriangulationError::PointOutsideEnvelope{ index, pos: *pos });
            }
        }

        let n = points.len();
        let mut tri = Triangulation{ vertices: Vec::with_capacity(n + 3), edges: vec![], triangles: vec![] };
        tri.vertices.extend_from_slice(points);

        // The initial triangle; its vertices `all_` are appended at the end of the array.
        // The envelope (extended by the margin `m`) is inscribed in the triangle's lower part.
        let m = envelope.width.max(envelope.height) as i32 + 16;
        let (ex, ey) = (envelope.x, envelope.y);
        let (ew, eh) = (envelope.width as i32, envelope.height as i32);

        let all0 = Point{ x: ex - 3 * m,      y: ey - m };
        let all1 = Point{ x: ex + ew + 3 * m, y: ey - m };
        let all2 = Point{ x: ex + ew / 2,     y: ey + eh + 3 * m };

        tri.vertices.extend_from_slice(&[all0, all1, all2]);

        tri.edges.push(Edge{ v0: n, v1: n + 1, t0: Some(0), t1: None, w0: Some(n + 2), w1: None });
        tri.edges.push(Edge{ v0: n + 1, v1: n + 2, t0: Some(0), t1: None, w0: Some(n), w1: None });
        tri.edges.push(Edge{ v0: n + 2, v1: n, t0: Some(0), t1: None, w0: Some(n + 1), w1: None });

        tri.triangles.push(Triangle{ v0: n, v1: n + 1, v2: n + 2, e0: 0, e1: 1, e2: 2 });

        // Process subsequent points and incrementally refresh the triangulation
        for pidx in 0..n {
            if let Some(prev) = points[..pidx].iter().position(|p| *p == points[pidx]) {
                log::debug!("point {} duplicates point {}", pidx, prev);
                return Err(TriangulationError::DuplicatePoint{ index: pidx, pos: points[pidx] });
            }

            match tri.locate(pidx) {
                Some(Location::InsideTriangle(tidx)) => tri.add_point_inside_triangle(pidx, tidx),

                Some(Location::OnEdge(eidx)) => {
                    if tri.edges[eidx].t0.is_none() || tri.edges[eidx].t1.is_none() {
                        // Only possible on the initial triangle's border
                        return Err(TriangulationError::PointOutsideEnvelope{ index: pidx, pos: points[pidx] });
                    }
                    tri.add_point_on_edge(pidx, eidx);
                },

                None => return Err(TriangulationError::PointOutsideEnvelope{ index: pidx, pos: points[pidx] })
            }
        }

        Ok(tri)
    }


    /// Returns twice the signed area of triangle `(a, b, c)`.
    fn orientation(a: &Point, b: &Point, c: &Point) -> i64 {
        (b.x as i64 - a.x as i64) * (c.y as i64 - a.y as i64) - (b.y as i64 - a.y as i64) * (c.x as i64 - a.x as i64)
    }


    /// Finds the triangle containing vertex `pidx` or the edge it lies on.
    fn locate(&self, pidx: usize) -> Option<Location> {
        let p = &self.vertices[pidx];

        for (tidx, t) in self.triangles.iter().enumerate() {
            let (a, b, c) = (&self.vertices[t.v0], &self.vertices[t.v1], &self.vertices[t.v2]);

            let d0 = Triangulation::orientation(a, b, p);
            let d1 = Triangulation::orientation(b, c, p);
            let d2 = Triangulation::orientation(c, a, p);

            if d0 >= 0 && d1 >= 0 && d2 >= 0 {
                return Some(if d0 == 0 {
                    Location::OnEdge(t.e0)
                } else if d1 == 0 {
                    Location::OnEdge(t.e1)
                } else if d2 == 0 {
                    Location::OnEdge(t.e2)
                } else {
                    Location::InsideTriangle(tidx)
                });
            }
        }

        None
    }


    /// Adds new point `pidx` that lies on an existing edge `eidx`.
    fn add_point_on_edge(&mut self, pidx: usize, eidx: usize) {
        //    Starting configuration: (| = edge 'e')
        //
        //                k0
        //               .|.
        //              . | .
        //            q0  |  .
        //            .   |   q3
        //           .    |    .
        //         wt0    p     wt1
        //          .  t0 | t1  .
        //           .    |    .
        //           q1   |   q2
        //             .  |  .
        //              . | .
        //               k1
        //
        //    Point 'p' is inserted into edge 'e', which has adjacent triangles t0, t1
        //    and the corresponding opposing vertices wt0, wt1. The adjacent triangles
        //    form a quadrilateral (with edges q0-3) whose diagonal is the edge 'e'.
        //
        //    Edge 'e' is subdivided into e0, e1, where e0 contains k0 and e1 contains k1.
        //    This creates two more edges e2, e3, which subdivide triangle t0 into triangles t0a/t0b
        //    and triangle t1 into t1a/t1b:
        //
        //                k0
        //               .|.
        //              . | .
        //            q0  |  .
        //            .   e0  . q3
        //           .    |    .
        //          . t0a | t1b .
        //         .      |      .
        //      wt0...e2..p...e3..wt1
        //        .       |       .
        //         .  t0b |      .
        //          .     | t1a .
        //           .    |    .
        //           q1   e1  q2
        //             .  |  .
        //              . | .
        //               k1
        //
        //    After subdivision, the Delaunay condition needs to be checked for edges e0..3, q0..3.

        let e = self.edges[eidx];
        let (t0_idx, t1_idx) = match (e.t0, e.t1) {
            (Some(t0), Some(t1)) => (t0, t1),
            _ => unreachable!("insertion edge must have two adjacent triangles")
        };
        let t0 = self.triangles[t0_idx];
        let t1 = self.triangles[t1_idx];

        let wt0 = t0.opposite_vertex(e.v0, e.v1);
        let wt1 = t1.opposite_vertex(e.v0, e.v1);

        let k0 = t1.next_vertex(wt1);
        let k1 = t0.next_vertex(wt0);

        // Edges of the quadrilateral (k0, wt0, k1, wt1)
        let q0 = t0.get_leading_edge_containing_vertex(k0);
        let q1 = t0.get_leading_edge_containing_vertex(wt0);
        let q2 = t1.get_leading_edge_containing_vertex(k1);
        let q3 = t1.get_leading_edge_containing_vertex(wt1);

        // 't0a' and 't1a' reuse the storage of 't0' and 't1'
        let t0a_idx = t0_idx;
        let t1a_idx = t1_idx;
        let t0b_idx = self.triangles.len();
        let t1b_idx = t0b_idx + 1;

        // 'e0' reuses the storage of 'e'
        let e0_idx = eidx;
        let e1_idx = self.edges.len();
        let e2_idx = e1_idx + 1;
        let e3_idx = e1_idx + 2;

        self.edges[e0_idx] = Edge{ v0: pidx, v1: k0, t0: Some(t0a_idx), t1: Some(t1b_idx), w0: Some(wt0), w1: Some(wt1) };
        self.edges.push(Edge{ v0: pidx, v1: k1, t0: Some(t0b_idx), t1: Some(t1a_idx), w0: Some(wt0), w1: Some(wt1) });
        self.edges.push(Edge{ v0: pidx, v1: wt0, t0: Some(t0a_idx), t1: Some(t0b_idx), w0: Some(k0), w1: Some(k1) });
        self.edges.push(Edge{ v0: pidx, v1: wt1, t0: Some(t1a_idx), t1: Some(t1b_idx), w0: Some(k1), w1: Some(k0) });

        self.triangles[t0a_idx] = Triangle{ v0: pidx, v1: k0, v2: wt0, e0: e0_idx, e1: q0, e2: e2_idx };
        self.triangles[t1a_idx] = Triangle{ v0: pidx, v1: k1, v2: wt1, e0: e1_idx, e1: q2, e2: e3_idx };
        self.triangles.push(Triangle{ v0: pidx, v1: wt0, v2: k1, e0: e2_idx, e1: q1, e2: e1_idx });
        self.triangles.push(Triangle{ v0: pidx, v1: wt1, v2: k0, e0: e3_idx, e1: q3, e2: e0_idx });

        // Update the edges of the quadrilateral: their adjacent triangles and opposite vertices

        replace_adjacent_triangle(&mut self.edges[q0], t0_idx, t0a_idx);
        replace_opposing_vertex(&mut self.edges[q0], k1, pidx);

        replace_adjacent_triangle(&mut self.edges[q1], t0_idx, t0b_idx);
        replace_opposing_vertex(&mut self.edges[q1], k0, pidx);

        replace_adjacent_triangle(&mut self.edges[q2], t1_idx, t1a_idx);
        replace_opposing_vertex(&mut self.edges[q2], k0, pidx);

        replace_adjacent_triangle(&mut self.edges[q3], t1_idx, t1b_idx);
        replace_opposing_vertex(&mut self.edges[q3], k1, pidx);

        for edge in [e0_idx, e1_idx, e2_idx, e3_idx, q0, q1, q2, q3] {
            self.test_and_swap_edge(edge, None, None);
        }
    }


    /// Adds a new point `pidx` inside an existing triangle `tidx`.
    fn add_point_inside_triangle(&mut self, pidx: usize, tidx: usize) {
        // Subdivide 't' into 3 sub-triangles 'tsub0', 'tsub1', 'tsub2' using 'pidx'.
        //
        // The order of existing triangles has to be preserved (they are referenced by the existing edges),
        // so replace 't' by 'tsub0' and add 'tsub1' and 'tsub2' at the triangle array's end.

        let t = self.triangles[tidx];

        let tsub0 = tidx;
        let tsub1 = self.triangles.len();
        let tsub2 = tsub1 + 1;

        // New edges which connect 't.v0', 't.v1', 't.v2' with 'pidx'
        let enew0 = self.edges.len();
        let enew1 = enew0 + 1;
        let enew2 = enew0 + 2;

        self.edges.push(Edge{ v0: t.v0, v1: pidx, t0: Some(tsub0), t1: Some(tsub2), w0: Some(t.v1), w1: Some(t.v2) });
        self.edges.push(Edge{ v0: t.v1, v1: pidx, t0: Some(tsub0), t1: Some(tsub1), w0: Some(t.v0), w1: Some(t.v2) });
        self.edges.push(Edge{ v0: t.v2, v1: pidx, t0: Some(tsub1), t1: Some(tsub2), w0: Some(t.v1), w1: Some(t.v0) });

        self.triangles[tsub0] = Triangle{ v0: pidx, v1: t.v0, v2: t.v1, e0: enew0, e1: t.e0, e2: enew1 };
        self.triangles.push(Triangle{ v0: pidx, v1: t.v1, v2: t.v2, e0: enew1, e1: t.e1, e2: enew2 });
        self.triangles.push(Triangle{ v0: pidx, v1: t.v2, v2: t.v0, e0: enew2, e1: t.e2, e2: enew0 });

        // Update adjacent triangle and opposing vertex data for 't's edges

        replace_opposing_vertex(&mut self.edges[t.e0], t.v2, pidx);
        replace_adjacent_triangle(&mut self.edges[t.e0], tidx, tsub0);

        replace_opposing_vertex(&mut self.edges[t.e1], t.v0, pidx);
        replace_adjacent_triangle(&mut self.edges[t.e1], tidx, tsub1);

        replace_opposing_vertex(&mut self.edges[t.e2], t.v1, pidx);
        replace_adjacent_triangle(&mut self.edges[t.e2], tidx, tsub2);

        // Check Delaunay condition for the old 't's edges and swap them if necessary.
        // Also recursively check any edges affected by the swap.

        self.test_and_swap_edge(t.e0, Some(enew0), Some(enew1));
        self.test_and_swap_edge(t.e1, Some(enew1), Some(enew2));
        self.test_and_swap_edge(t.e2, Some(enew2), Some(enew0));
    }


    /// Checks if vertex `pidx` is inside the circumcircle of triangle `tidx`.
    ///
    /// Vertices lying (almost) exactly on the circle are not inside.
    ///
    #[allow(non_snake_case)]
    fn is_inside_circumcircle(&self, pidx: usize, tidx: usize) -> bool {
        let p = &self.vertices[pidx];
        let t = &self.triangles[tidx];

        let pt = |v: usize| (self.vertices[v].x as f64, self.vertices[v].y as f64);
        let (Ax, Ay) = pt(t.v0);
        let (Bx, By) = pt(t.v1);
        let (Cx, Cy) = pt(t.v2);

        // Circumcenter and squared radius of the circumcircle
        let (ux, uy, radiusq);

        let d = 2.0 * (Ax * (By - Cy) + Bx * (Cy - Ay) + Cx * (Ay - By));

        if d != 0.0 {
            let (a2, b2, c2) = (sqr!(Ax) + sqr!(Ay), sqr!(Bx) + sqr!(By), sqr!(Cx) + sqr!(Cy));

            ux = (a2 * (By - Cy) + b2 * (Cy - Ay) + c2 * (Ay - By)) / d;
            uy = (a2 * (Cx - Bx) + b2 * (Ax - Cx) + c2 * (Bx - Ax)) / d;

            radiusq = sqr!(ux - Ax) + sqr!(uy - Ay);
        } else {
            // Degenerate triangle (collinear vertices); use the circle spanned by the extreme vertices
            let dist_AB_sq = sqr!(Ax - Bx) + sqr!(Ay - By);
            let dist_AC_sq = sqr!(Ax - Cx) + sqr!(Ay - Cy);
            let dist_BC_sq = sqr!(Bx - Cx) + sqr!(By - Cy);

            let ((e1x, e1y), (e2x, e2y)) =
                if dist_AB_sq >= dist_AC_sq && dist_AB_sq >= dist_BC_sq {
                    ((Ax, Ay), (Bx, By))
                } else if dist_AC_sq >= dist_AB_sq && dist_AC_sq >= dist_BC_sq {
                    ((Ax, Ay), (Cx, Cy))
                } else {
                    ((Bx, By), (Cx, Cy))
                };

            ux = 0.5 * (e1x + e2x);
            uy = 0.5 * (e1y + e2y);
            radiusq = 0.25 * (sqr!(e1x - e2x) + sqr!(e1y - e2y));
        }

        sqr!(p.x as f64 - ux) + sqr!(p.y as f64 - uy) < radiusq * (1.0 - CIRCUMCIRCLE_TOLERANCE)
    }


    /// Ensures the specified edge satisfies the Delaunay condition.
    ///
    /// If edge `e` violates the Delaunay condition, swaps it and recursively
    /// continues to test the 4 neighboring edges (except `eskip1`, `eskip2`).
    ///
    /// Before:
    ///
    /// ```text
    ///     D---------C
    ///    / t1 ___/ /
    ///   /  __e    /
    ///  / _/   t0 /
    /// A---------B
    /// ```
    ///
    /// After swapping e:
    ///
    /// ```text
    ///     D-------C
    ///    / \  t0 /
    ///   /   e   /
    ///  / t1  \ /
    /// A-------B
    /// ```
    ///
    /// For each of the triangles adjacent to `e` before the swap, the vertex opposite to `e`
    /// and the next vertex stay in the same (reused) triangle after the swap.
    ///
    fn test_and_swap_edge(&mut self, e: usize, eskip1: Option<usize>, eskip2: Option<usize>) {
        // Edge 'e' before the swap
        let eprev = self.edges[e];

        let (t0prev, t1prev) = match (eprev.t0, eprev.t1) {
            (Some(t0), Some(t1)) => (t0, t1),
            _ => return
        };

        // The only vertex in 't0' ('t1') which does not belong to 'e'
        let t0refv = self.triangles[t0prev].opposite_vertex(eprev.v0, eprev.v1);
        let t1refv = self.triangles[t1prev].opposite_vertex(eprev.v0, eprev.v1);

        if !self.is_inside_circumcircle(t1refv, t0prev) && !self.is_inside_circumcircle(t0refv, t1prev) {
            return;
        }

        let t0old = self.triangles[t0prev];
        let t1old = self.triangles[t1prev];

        //    Before:                    After:
        //
        //        D---------C           D-------C
        //       / t1 ___/ /           / \  t0 /
        //      /  __e    /           /   e   /
        //     / _/   t0 /           / t1  \ /
        //    A---------B           A-------B
        //
        //    t0: v0=A, v1=B, v2=C    t0: v0=B, v1=C, v2=D
        //    t1: v0=D, v1=A, v2=C    t1: v0=D, v1=A, v2=B

        let mut t0new = Triangle{ v0: t0refv, v1: t0old.next_vertex(t0refv), v2: t1refv, ..Default::default() };
        let mut t1new = Triangle{ v0: t1refv, v1: t1old.next_vertex(t1refv), v2: t0refv, ..Default::default() };

        // The quadrilateral may be non-convex for an (almost) degenerate configuration;
        // such a swap would produce overlapping triangles
        if Triangulation::orientation(&self.vertices[t0new.v0], &self.vertices[t0new.v1], &self.vertices[t0new.v2]) <= 0 ||
           Triangulation::orientation(&self.vertices[t1new.v0], &self.vertices[t1new.v1], &self.vertices[t1new.v2]) <= 0 {
            return;
        }

        // Edges to be checked recursively after 'e' is swapped
        let edges_to_check: Vec<usize> = t0old.edges().into_iter().chain(t1old.edges())
            .filter(|&edge| edge != e && Some(edge) != eskip1 && Some(edge) != eskip2)
            .collect();

        // The leading edge of the reference vertex stays the same, the second edge comes
        // from the other triangle, the third edge is the swapped 'e'

        t0new.e0 = t0old.get_leading_edge_containing_vertex(t0new.v0);
        t0new.e1 = t1old.get_leading_edge_containing_vertex(t0new.v1);
        t0new.e2 = e;

        t1new.e0 = t1old.get_leading_edge_containing_vertex(t1new.v0);
        t1new.e1 = t0old.get_leading_edge_containing_vertex(t1new.v1);
        t1new.e2 = e;

        replace_opposing_vertex(&mut self.edges[t0new.e0], t1new.v1, t0new.v2);
        replace_opposing_vertex(&mut self.edges[t0new.e1], t1new.v1, t0new.v0);
        replace_opposing_vertex(&mut self.edges[t1new.e0], t0new.v1, t1new.v2);
        replace_opposing_vertex(&mut self.edges[t1new.e1], t0new.v1, t1new.v0);

        replace_adjacent_triangle(&mut self.edges[t0new.e1], t1prev, t0prev);
        replace_adjacent_triangle(&mut self.edges[t1new.e1], t0prev, t1prev);

        self.edges[e] = Edge{ v0: t0new.v0, v1: t1new.v0,
                              t0: Some(t0prev), t1: Some(t1prev),
                              w0: Some(t0new.v1), w1: Some(t1new.v1) };

        self.triangles[t0prev] = t0new;
        self.triangles[t1prev] = t1new;

        for edge in edges_to_check {
            self.test_and_swap_edge(edge, Some(e), None);
        }
    }
}


fn replace_opposing_vertex(edge: &mut Edge, wold: usize, wnew: usize) {
    if edge.w0 == Some(wold) {
        edge.w0 = Some(wnew);
    } else if edge.w1 == Some(wold) {
        edge.w1 = Some(wnew);
    } else if edge.w0.is_none() {
        edge.w0 = Some(wnew);
    } else if edge.w1.is_none() {
        edge.w1 = Some(wnew);
    }
}


fn replace_adjacent_triangle(edge: &mut Edge, told: usize, tnew: usize) {
    if edge.t0 == Some(told) {
        edge.t0 = Some(tnew);
    } else if edge.t1 == Some(told) {
        edge.t1 = Some(tnew);
    } else if edge.t0.is_none() {
        edge.t0 = Some(tnew);
    } else if edge.t1.is_none() {
        edge.t1 = Some(tnew);
    }
}
