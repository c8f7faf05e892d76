//! Perspective rectification from camera pixels to a reference rectangle.
//!
//! A `ViewTransformer` is solved once from four pixel-space corners and four
//! reference-space corners, then only read. It holds no mutable state, so a
//! shared reference can be used from any thread.

use anyhow::{anyhow, Result};
use nalgebra::{Matrix3, SMatrix, SVector, Vector3};

/// Relative size of the projective denominator below which a point is treated
/// as lying on the vanishing line.
const VANISHING_TOLERANCE: f64 = 1e-9;

/// Quadrilateral given as four `[x, y]` corners, clockwise from top-left.
pub type Quad = [[f64; 2]; 4];

#[derive(Clone, Debug, PartialEq)]
pub struct ViewTransformer {
    m: Matrix3<f64>,
}

impl ViewTransformer {
    /// Solve the homography mapping `source[i]` onto `target[i]`.
    pub fn new(source: Quad, target: Quad) -> Result<Self> {
        for p in source.iter().chain(target.iter()) {
            if !p[0].is_finite() || !p[1].is_finite() {
                return Err(anyhow!("calibration points must be finite"));
            }
        }

        // h22 is fixed to 1, leaving eight unknowns for eight equations.
        let mut a = SMatrix::<f64, 8, 8>::zeros();
        let mut b = SVector::<f64, 8>::zeros();
        for (i, (s, d)) in source.iter().zip(target.iter()).enumerate() {
            let (x, y) = (s[0], s[1]);
            let (u, v) = (d[0], d[1]);

            let r = 2 * i;
            a[(r, 0)] = x;
            a[(r, 1)] = y;
            a[(r, 2)] = 1.0;
            a[(r, 6)] = -u * x;
            a[(r, 7)] = -u * y;
            b[r] = u;

            a[(r + 1, 3)] = x;
            a[(r + 1, 4)] = y;
            a[(r + 1, 5)] = 1.0;
            a[(r + 1, 6)] = -v * x;
            a[(r + 1, 7)] = -v * y;
            b[r + 1] = v;
        }

        let h = a
            .lu()
            .solve(&b)
            .ok_or_else(|| anyhow!("calibration points are degenerate (collinear or repeated)"))?;
        if h.iter().any(|c| !c.is_finite()) {
            return Err(anyhow!("calibration produced a non-finite homography"));
        }

        let m = Matrix3::new(h[0], h[1], h[2], h[3], h[4], h[5], h[6], h[7], 1.0);
        Ok(Self { m })
    }

    /// Map the full `width`x`height` frame onto the reference rectangle.
    pub fn for_frame(width: u32, height: u32, reference_width: f64, reference_height: f64) -> Result<Self> {
        let (w, h) = (width as f64, height as f64);
        let source = [[0.0, 0.0], [w, 0.0], [w, h], [0.0, h]];
        Self::new(source, reference_rectangle(reference_width, reference_height))
    }

    pub fn matrix(&self) -> &Matrix3<f64> {
        &self.m
    }

    /// Map a single point. Points on (or numerically at) the vanishing line
    /// come back as NaN.
    pub fn transform_point(&self, point: [f64; 2]) -> [f64; 2] {
        let p = self.m * Vector3::new(point[0], point[1], 1.0);
        // w is a cancelling sum; compare it to the size of its terms.
        let scale = (self.m[(2, 0)] * point[0]).abs() + (self.m[(2, 1)] * point[1]).abs() + 1.0;
        if p[2].abs() <= VANISHING_TOLERANCE * scale {
            return [f64::NAN, f64::NAN];
        }
        [p[0] / p[2], p[1] / p[2]]
    }

    /// Map a batch of points. An empty batch yields an empty result.
    pub fn transform(&self, points: &[[f64; 2]]) -> Vec<[f64; 2]> {
        points.iter().map(|p| self.transform_point(*p)).collect()
    }
}

/// Corners of a `width`x`height` reference rectangle in unit coordinates.
pub fn reference_rectangle(width: f64, height: f64) -> Quad {
    [
        [0.0, 0.0],
        [width - 1.0, 0.0],
        [width - 1.0, height - 1.0],
        [0.0, height - 1.0],
    ]
}
