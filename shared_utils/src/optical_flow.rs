//! Dense optical flow estimation.
//!
//! Pyramidal polynomial-expansion flow (Farneback's method): every pixel
//! neighbourhood of both frames is approximated by a quadratic polynomial
//! via Gaussian-weighted least squares, and the displacement field is
//! solved from the averaged expansion coefficients, accumulated over a box
//! window and refined coarse-to-fine across an image pyramid.
//!
//! Defaults match the conventional parameterization: pyramid scale 0.5,
//! 3 levels, window 15, 3 iterations, neighbourhood 5, sigma 1.2. These are
//! fixed calibration inputs; changing them changes every downstream motion
//! score.

use image::GrayImage;
use rayon::prelude::*;

/// Least-squares regulariser; keeps the per-pixel solve at exactly zero
/// displacement in gradient-free regions instead of dividing by zero.
const DET_EPS: f64 = 1e-3;

#[derive(Debug, Clone)]
pub struct FlowParams {
    pub pyr_scale: f64,
    pub levels: usize,
    pub winsize: usize,
    pub iterations: usize,
    pub poly_n: usize,
    pub poly_sigma: f64,
}

impl Default for FlowParams {
    fn default() -> Self {
        Self {
            pyr_scale: 0.5,
            levels: 3,
            winsize: 15,
            iterations: 3,
            poly_n: 5,
            poly_sigma: 1.2,
        }
    }
}

/// Dense displacement field, one `(dx, dy)` vector per pixel.
pub struct FlowField {
    pub width: usize,
    pub height: usize,
    pub dx: Vec<f64>,
    pub dy: Vec<f64>,
}

impl FlowField {
    fn zeros(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            dx: vec![0.0; width * height],
            dy: vec![0.0; width * height],
        }
    }

    /// Arithmetic mean of the polar magnitude over all pixels; the angle is
    /// discarded.
    pub fn mean_magnitude(&self) -> f64 {
        let n = (self.width * self.height) as f64;
        self.dx
            .par_iter()
            .zip(self.dy.par_iter())
            .map(|(dx, dy)| (dx * dx + dy * dy).sqrt())
            .sum::<f64>()
            / n
    }
}

/// Estimate dense flow from `prev` to `next`. Both frames must share
/// dimensions; the field is returned at full input resolution.
pub fn farneback_flow(prev: &GrayImage, next: &GrayImage, params: &FlowParams) -> FlowField {
    assert_eq!(
        prev.dimensions(),
        next.dimensions(),
        "flow requires equally sized frames"
    );

    let p0 = Plane::from_gray(prev);
    let p1 = Plane::from_gray(next);

    let poly_win = 2 * params.poly_n + 1;
    // Drop pyramid levels too small to fit a polynomial neighbourhood.
    let mut levels = params.levels.max(1);
    while levels > 1 {
        let scale = params.pyr_scale.powi(levels as i32 - 1);
        let lw = ((p0.w as f64) * scale).round() as usize;
        let lh = ((p0.h as f64) * scale).round() as usize;
        if lw.min(lh) >= poly_win {
            break;
        }
        levels -= 1;
    }

    let mut flow: Option<FlowField> = None;

    for k in (0..levels).rev() {
        let scale = params.pyr_scale.powi(k as i32);
        let lw = (((p0.w as f64) * scale).round() as usize).max(1);
        let lh = (((p0.h as f64) * scale).round() as usize).max(1);

        let (i0, i1) = if k == 0 {
            (p0.clone(), p1.clone())
        } else {
            // Anti-alias against the original, then resample; the smoothing
            // sigma grows with the downscale factor.
            let sigma = (1.0 / scale - 1.0) * 0.5;
            (
                p0.gaussian_blur(sigma).resize_bilinear(lw, lh),
                p1.gaussian_blur(sigma).resize_bilinear(lw, lh),
            )
        };

        let mut level_flow = match flow.take() {
            None => FlowField::zeros(lw, lh),
            Some(coarse) => upscale_flow(&coarse, lw, lh, 1.0 / params.pyr_scale),
        };

        let r0 = PolyExpansion::compute(&i0, params.poly_n, params.poly_sigma);
        let r1 = PolyExpansion::compute(&i1, params.poly_n, params.poly_sigma);

        for _ in 0..params.iterations.max(1) {
            update_flow(&r0, &r1, &mut level_flow, params.winsize);
        }

        flow = Some(level_flow);
    }

    flow.expect("at least one pyramid level is always processed")
}

// ───────────────────────────────────────────────────────────────
// Float plane primitives
// ───────────────────────────────────────────────────────────────

#[derive(Clone)]
struct Plane {
    w: usize,
    h: usize,
    data: Vec<f64>,
}

impl Plane {
    fn zeros(w: usize, h: usize) -> Self {
        Self {
            w,
            h,
            data: vec![0.0; w * h],
        }
    }

    fn from_gray(img: &GrayImage) -> Self {
        let (w, h) = img.dimensions();
        Self {
            w: w as usize,
            h: h as usize,
            data: img.pixels().map(|p| p.0[0] as f64).collect(),
        }
    }

    #[inline]
    fn get(&self, x: usize, y: usize) -> f64 {
        self.data[y * self.w + x]
    }

    /// Replicate-border access.
    #[inline]
    fn at(&self, x: isize, y: isize) -> f64 {
        let x = x.clamp(0, self.w as isize - 1) as usize;
        let y = y.clamp(0, self.h as isize - 1) as usize;
        self.data[y * self.w + x]
    }

    fn bilinear(&self, fx: f64, fy: f64) -> f64 {
        let fx = fx.clamp(0.0, (self.w - 1) as f64);
        let fy = fy.clamp(0.0, (self.h - 1) as f64);
        let x0 = fx.floor() as usize;
        let y0 = fy.floor() as usize;
        let x1 = (x0 + 1).min(self.w - 1);
        let y1 = (y0 + 1).min(self.h - 1);
        let wx = fx - x0 as f64;
        let wy = fy - y0 as f64;
        let top = self.get(x0, y0) * (1.0 - wx) + self.get(x1, y0) * wx;
        let bot = self.get(x0, y1) * (1.0 - wx) + self.get(x1, y1) * wx;
        top * (1.0 - wy) + bot * wy
    }

    fn resize_bilinear(&self, nw: usize, nh: usize) -> Plane {
        let sx = self.w as f64 / nw as f64;
        let sy = self.h as f64 / nh as f64;
        let data: Vec<f64> = (0..nh)
            .into_par_iter()
            .flat_map_iter(|y| {
                let fy = (y as f64 + 0.5) * sy - 0.5;
                (0..nw)
                    .map(|x| {
                        let fx = (x as f64 + 0.5) * sx - 0.5;
                        self.bilinear(fx, fy)
                    })
                    .collect::<Vec<f64>>()
            })
            .collect();
        Plane { w: nw, h: nh, data }
    }

    fn transpose(&self) -> Plane {
        let mut out = Plane::zeros(self.h, self.w);
        for y in 0..self.h {
            for x in 0..self.w {
                out.data[x * self.h + y] = self.data[y * self.w + x];
            }
        }
        out
    }

    /// Separable convolution along rows with a symmetric kernel, replicated
    /// borders. `kernel.len() == 2 * radius + 1`.
    fn convolve_rows(&self, kernel: &[f64]) -> Plane {
        let radius = kernel.len() as isize / 2;
        let data: Vec<f64> = (0..self.h as isize)
            .into_par_iter()
            .flat_map_iter(|y| {
                (0..self.w as isize)
                    .map(|x| {
                        kernel
                            .iter()
                            .enumerate()
                            .map(|(i, k)| k * self.at(x + i as isize - radius, y))
                            .sum()
                    })
                    .collect::<Vec<f64>>()
            })
            .collect();
        Plane {
            w: self.w,
            h: self.h,
            data,
        }
    }

    fn gaussian_blur(&self, sigma: f64) -> Plane {
        if sigma <= 0.0 {
            return self.clone();
        }
        let kernel = gaussian_kernel(sigma);
        self.convolve_rows(&kernel)
            .transpose()
            .convolve_rows(&kernel)
            .transpose()
    }

    /// Normalized box average over a `winsize`-wide square window, windows
    /// clipped at the borders.
    fn box_blur(&self, winsize: usize) -> Plane {
        let radius = (winsize / 2) as isize;
        self.box_blur_rows(radius)
            .transpose()
            .box_blur_rows(radius)
            .transpose()
    }

    fn box_blur_rows(&self, radius: isize) -> Plane {
        let w = self.w as isize;
        let data: Vec<f64> = (0..self.h)
            .into_par_iter()
            .flat_map_iter(|y| {
                let row = &self.data[y * self.w..(y + 1) * self.w];
                // Prefix sums make every clipped window O(1).
                let mut prefix = Vec::with_capacity(self.w + 1);
                let mut acc = 0.0;
                prefix.push(acc);
                for v in row {
                    acc += v;
                    prefix.push(acc);
                }
                (0..w)
                    .map(|x| {
                        let lo = (x - radius).max(0) as usize;
                        let hi = ((x + radius).min(w - 1) + 1) as usize;
                        (prefix[hi] - prefix[lo]) / (hi - lo) as f64
                    })
                    .collect::<Vec<f64>>()
            })
            .collect();
        Plane {
            w: self.w,
            h: self.h,
            data,
        }
    }
}

fn gaussian_kernel(sigma: f64) -> Vec<f64> {
    let mut ksize = (sigma * 5.0).round() as usize;
    if ksize % 2 == 0 {
        ksize += 1;
    }
    let ksize = ksize.max(3);
    let radius = (ksize / 2) as isize;
    let mut kernel: Vec<f64> = (-radius..=radius)
        .map(|i| (-((i * i) as f64) / (2.0 * sigma * sigma)).exp())
        .collect();
    let sum: f64 = kernel.iter().sum();
    for k in &mut kernel {
        *k /= sum;
    }
    kernel
}

// ───────────────────────────────────────────────────────────────
// Polynomial expansion
// ───────────────────────────────────────────────────────────────

/// Per-pixel quadratic fit `f(u) ≈ c + bᵀu + uᵀAu` over a Gaussian-weighted
/// neighbourhood. Only the planes the displacement solve needs are kept:
/// the linear coefficients and the symmetric quadratic ones.
struct PolyExpansion {
    bx: Plane,
    by: Plane,
    axx: Plane,
    ayy: Plane,
    axy: Plane,
}

impl PolyExpansion {
    fn compute(img: &Plane, n: usize, sigma: f64) -> Self {
        let n = n.max(1) as isize;

        // Normalized 1D Gaussian applicability over [-n, n] and its moments.
        let mut g: Vec<f64> = (-n..=n)
            .map(|i| (-((i * i) as f64) / (2.0 * sigma * sigma)).exp())
            .collect();
        let gsum: f64 = g.iter().sum();
        for v in &mut g {
            *v /= gsum;
        }
        let m2: f64 = g
            .iter()
            .enumerate()
            .map(|(i, v)| v * ((i as isize - n) * (i as isize - n)) as f64)
            .sum();
        let m4: f64 = g
            .iter()
            .enumerate()
            .map(|(i, v)| {
                let k = (i as isize - n) as f64;
                v * k * k * k * k
            })
            .sum();

        // Closed-form entries of the inverted normal-equation matrix for the
        // basis {1, x, y, x², y², xy} under a separable symmetric weight:
        // the {1, x², y²} block reduces to det (m4 - m2²)².
        let q = m2 * m2;
        let ig11 = 1.0 / m2;
        let ig33 = 1.0 / (m4 - q);
        let ig03 = -m2 / (m4 - q);
        let ig55 = 1.0 / q;

        let (w, h) = (img.w, img.h);

        // Vertical pass: zeroth, first and second weighted moments along y.
        let mut t0 = Plane::zeros(w, h);
        let mut t1 = Plane::zeros(w, h);
        let mut t2 = Plane::zeros(w, h);
        let rows: Vec<Vec<[f64; 3]>> = (0..h as isize)
            .into_par_iter()
            .map(|y| {
                (0..w as isize)
                    .map(|x| {
                        let mut s = [0.0f64; 3];
                        for (i, gv) in g.iter().enumerate() {
                            let k = i as isize - n;
                            let v = img.at(x, y + k);
                            let kf = k as f64;
                            s[0] += gv * v;
                            s[1] += gv * kf * v;
                            s[2] += gv * kf * kf * v;
                        }
                        s
                    })
                    .collect()
            })
            .collect();
        for (y, row) in rows.iter().enumerate() {
            for (x, s) in row.iter().enumerate() {
                t0.data[y * w + x] = s[0];
                t1.data[y * w + x] = s[1];
                t2.data[y * w + x] = s[2];
            }
        }

        // Horizontal pass combines the moments into the six correlations and
        // resolves them through the inverted normal equations.
        let mut out = PolyExpansion {
            bx: Plane::zeros(w, h),
            by: Plane::zeros(w, h),
            axx: Plane::zeros(w, h),
            ayy: Plane::zeros(w, h),
            axy: Plane::zeros(w, h),
        };
        let rows: Vec<Vec<[f64; 5]>> = (0..h as isize)
            .into_par_iter()
            .map(|y| {
                (0..w as isize)
                    .map(|x| {
                        let (mut r1, mut r2, mut r3, mut r4, mut r5, mut r6) =
                            (0.0f64, 0.0f64, 0.0f64, 0.0f64, 0.0f64, 0.0f64);
                        for (i, gv) in g.iter().enumerate() {
                            let j = i as isize - n;
                            let jf = j as f64;
                            let v0 = t0.at(x + j, y);
                            let v1 = t1.at(x + j, y);
                            let v2 = t2.at(x + j, y);
                            r1 += gv * v0;
                            r2 += gv * v1;
                            r3 += gv * jf * v0;
                            r4 += gv * v2;
                            r5 += gv * jf * jf * v0;
                            r6 += gv * jf * v1;
                        }
                        [
                            ig11 * r3,             // bx
                            ig11 * r2,             // by
                            ig03 * r1 + ig33 * r5, // axx
                            ig03 * r1 + ig33 * r4, // ayy
                            ig55 * r6,             // axy
                        ]
                    })
                    .collect()
            })
            .collect();
        for (y, row) in rows.iter().enumerate() {
            for (x, c) in row.iter().enumerate() {
                out.bx.data[y * w + x] = c[0];
                out.by.data[y * w + x] = c[1];
                out.axx.data[y * w + x] = c[2];
                out.ayy.data[y * w + x] = c[3];
                out.axy.data[y * w + x] = c[4];
            }
        }
        out
    }
}

// ───────────────────────────────────────────────────────────────
// Displacement solve
// ───────────────────────────────────────────────────────────────

/// One refinement sweep: average the expansions of both frames (the second
/// warped by the current flow), accumulate the normal equations over the
/// box window, and re-solve the per-pixel 2×2 system.
fn update_flow(r0: &PolyExpansion, r1: &PolyExpansion, flow: &mut FlowField, winsize: usize) {
    let (w, h) = (flow.width, flow.height);

    let mut g11 = Plane::zeros(w, h);
    let mut g12 = Plane::zeros(w, h);
    let mut g22 = Plane::zeros(w, h);
    let mut h1 = Plane::zeros(w, h);
    let mut h2 = Plane::zeros(w, h);

    let (flow_dx, flow_dy) = (&flow.dx, &flow.dy);
    let rows: Vec<Vec<[f64; 5]>> = (0..h)
        .into_par_iter()
        .map(|y| {
            (0..w)
                .map(|x| {
                    let i = y * w + x;
                    let dx = flow_dx[i];
                    let dy = flow_dy[i];
                    let fx = x as f64 + dx;
                    let fy = y as f64 + dy;

                    let a11 = (r0.axx.get(x, y) + r1.axx.bilinear(fx, fy)) * 0.5;
                    let a22 = (r0.ayy.get(x, y) + r1.ayy.bilinear(fx, fy)) * 0.5;
                    // A(0,1) is half the xy coefficient, and averaging the
                    // two frames halves it again.
                    let a12 = (r0.axy.get(x, y) + r1.axy.bilinear(fx, fy)) * 0.25;

                    let db1 =
                        -0.5 * (r1.bx.bilinear(fx, fy) - r0.bx.get(x, y)) + a11 * dx + a12 * dy;
                    let db2 =
                        -0.5 * (r1.by.bilinear(fx, fy) - r0.by.get(x, y)) + a12 * dx + a22 * dy;

                    [
                        a11 * a11 + a12 * a12,
                        a12 * (a11 + a22),
                        a22 * a22 + a12 * a12,
                        a11 * db1 + a12 * db2,
                        a12 * db1 + a22 * db2,
                    ]
                })
                .collect()
        })
        .collect();
    for (y, row) in rows.iter().enumerate() {
        for (x, m) in row.iter().enumerate() {
            g11.data[y * w + x] = m[0];
            g12.data[y * w + x] = m[1];
            g22.data[y * w + x] = m[2];
            h1.data[y * w + x] = m[3];
            h2.data[y * w + x] = m[4];
        }
    }

    let g11 = g11.box_blur(winsize);
    let g12 = g12.box_blur(winsize);
    let g22 = g22.box_blur(winsize);
    let h1 = h1.box_blur(winsize);
    let h2 = h2.box_blur(winsize);

    let solved: Vec<(f64, f64)> = (0..w * h)
        .into_par_iter()
        .map(|i| {
            let (a, b, c) = (g11.data[i], g12.data[i], g22.data[i]);
            let det = a * c - b * b + DET_EPS;
            (
                (c * h1.data[i] - b * h2.data[i]) / det,
                (a * h2.data[i] - b * h1.data[i]) / det,
            )
        })
        .collect();
    for (i, (dx, dy)) in solved.into_iter().enumerate() {
        flow.dx[i] = dx;
        flow.dy[i] = dy;
    }
}

fn upscale_flow(coarse: &FlowField, nw: usize, nh: usize, gain: f64) -> FlowField {
    let cdx = Plane {
        w: coarse.width,
        h: coarse.height,
        data: coarse.dx.clone(),
    };
    let cdy = Plane {
        w: coarse.width,
        h: coarse.height,
        data: coarse.dy.clone(),
    };
    let mut dx = cdx.resize_bilinear(nw, nh).data;
    let mut dy = cdy.resize_bilinear(nw, nh).data;
    // Displacements are in pixels of their own level; stepping a level up
    // rescales them with the geometry.
    for v in dx.iter_mut().chain(dy.iter_mut()) {
        *v *= gain;
    }
    FlowField {
        width: nw,
        height: nh,
        dx,
        dy,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;
    use std::f64::consts::TAU;

    fn sinusoid(w: u32, h: u32, shift: f64) -> GrayImage {
        GrayImage::from_fn(w, h, |x, y| {
            let fx = x as f64 - shift;
            let v = 127.5
                + 55.0 * (fx * TAU / 16.0).sin()
                + 40.0 * (y as f64 * TAU / 16.0).sin();
            Luma([v.round().clamp(0.0, 255.0) as u8])
        })
    }

    #[test]
    fn test_identical_frames_have_zero_flow() {
        let frame = sinusoid(64, 64, 0.0);
        let flow = farneback_flow(&frame, &frame, &FlowParams::default());
        assert_eq!(flow.mean_magnitude(), 0.0);
    }

    #[test]
    fn test_uniform_frames_have_zero_flow() {
        let a = GrayImage::from_pixel(48, 48, Luma([10]));
        let b = GrayImage::from_pixel(48, 48, Luma([240]));
        let flow = farneback_flow(&a, &b, &FlowParams::default());
        assert_eq!(flow.mean_magnitude(), 0.0);
    }

    #[test]
    fn test_field_matches_input_dimensions() {
        let a = sinusoid(40, 24, 0.0);
        let b = sinusoid(40, 24, 1.0);
        let flow = farneback_flow(&a, &b, &FlowParams::default());
        assert_eq!((flow.width, flow.height), (40, 24));
        assert_eq!(flow.dx.len(), 40 * 24);
    }

    #[test]
    fn test_translation_magnitude_is_monotonic_in_speed() {
        let base = sinusoid(64, 64, 0.0);
        let m1 = farneback_flow(&base, &sinusoid(64, 64, 1.0), &FlowParams::default())
            .mean_magnitude();
        let m2 = farneback_flow(&base, &sinusoid(64, 64, 2.0), &FlowParams::default())
            .mean_magnitude();
        assert!(m1 > 0.2, "1px shift should register, got {}", m1);
        assert!(m2 > m1, "2px shift ({}) should exceed 1px shift ({})", m2, m1);
    }

    #[test]
    fn test_small_frames_fall_back_to_fewer_levels() {
        // 12x12 cannot host a 3-level pyramid with an 11-wide neighbourhood.
        let a = GrayImage::from_fn(12, 12, |x, y| Luma([((x * 20 + y * 7) % 256) as u8]));
        let b = GrayImage::from_fn(12, 12, |x, y| Luma([((x * 20 + y * 7 + 3) % 256) as u8]));
        let flow = farneback_flow(&a, &b, &FlowParams::default());
        assert_eq!((flow.width, flow.height), (12, 12));
        assert!(flow.mean_magnitude().is_finite());
    }
}
