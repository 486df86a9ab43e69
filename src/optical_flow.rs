use nalgebra as na;

use crate::config::Config;
use crate::frame::PyramidFrame;
use crate::image::*;
use crate::my_types::*;

type Range = [[i16; 2]; 2];

/// Pyramidal Lucas-Kanade point tracker.
pub struct OpticalFlow {
    lk_iters: usize,
    lk_levels: usize,
    lk_win_size: usize,
    lk_term: f64,
    lk_min_eig: f64,
    fb_max_error: f64,
    ix: Matrixd,
    iy: Matrixd,
    it: Matrixd,
    grid: Matrixd,
}

impl OpticalFlow {
    pub fn new(config: &Config, lk_levels: usize) -> OpticalFlow {
        let lk_win_size = config.lk_win_size;
        OpticalFlow {
            lk_iters: config.lk_iters,
            lk_levels,
            lk_win_size,
            lk_term: config.lk_term,
            lk_min_eig: config.lk_min_eig,
            fb_max_error: config.fb_max_error,
            ix: na::DMatrix::zeros(lk_win_size, lk_win_size),
            iy: na::DMatrix::zeros(lk_win_size, lk_win_size),
            it: na::DMatrix::zeros(lk_win_size, lk_win_size),
            grid: na::DMatrix::zeros(lk_win_size, lk_win_size),
        }
    }

    pub fn levels(&self) -> usize {
        self.lk_levels
    }

    /// Track `point0` from frame0 into frame1 and check it tracks back.
    /// Returns the destination and a match score in (0, 1].
    pub fn process(
        &mut self,
        pyramid_frame0: &PyramidFrame,
        pyramid_frame1: &PyramidFrame,
        point0: Vector2d,
        point1_in: Option<Vector2d>,
    ) -> Option<(Vector2d, f64)> {
        let point1 = self.process_feature(pyramid_frame0, pyramid_frame1, point0, point1_in)?;
        if self.fb_max_error > 0. {
            let back = self.process_feature(pyramid_frame1, pyramid_frame0, point1, Some(point0))?;
            if (back - point0).norm_squared() > self.fb_max_error.powi(2) {
                return None;
            }
        }
        let residual = self.mean_residual(&pyramid_frame0.image, &pyramid_frame1.image, point0, point1)?;
        Some((point1, 1. / (1. + residual)))
    }

    /// ref http://robots.stanford.edu/cs223b04/algo_tracking.pdf
    fn process_feature(
        &mut self,
        pyramid_frame0: &PyramidFrame,
        pyramid_frame1: &PyramidFrame,
        point0: Vector2d,
        point1_in: Option<Vector2d>,
    ) -> Option<Vector2d> {
        let lk_term2 = self.lk_term.powi(2);
        let r = (self.lk_win_size - 1) / 2;

        // initial guess
        let mut g_init = point1_in
            .map(|p| p - point0)
            .unwrap_or(Vector2d::zeros())
            / u32::pow(2, self.lk_levels as u32) as f64;
        let mut d = Vector2d::zeros();
        for level in (0..self.lk_levels + 1).rev() {
            let level0 = pyramid_frame0.get_image_at_level(level);
            let level1 = pyramid_frame1.get_image_at_level(level);
            let u = point0 / u32::pow(2, level as u32) as f64;
            let tracked = self.process_level(level0, level1, u, g_init, r, lk_term2);
            d = match tracked {
                Some(d) => d,
                // coarse levels may lack texture, carry the guess down
                None if level > 0 => Vector2d::zeros(),
                None => return None,
            };
            if level > 0 {
                g_init = 2. * (g_init + d)
            }
        }

        Some(point0 + g_init + d)
    }

    fn process_level(
        &mut self,
        level0: &Image,
        level1: &Image,
        u: Vector2d,
        g_init: Vector2d,
        r: usize,
        lk_term2: f64,
    ) -> Option<Vector2d> {
        let range = integration_range(level0, u, r, 1)?;
        // compute the derivative
        scharr(level0, u, range, &mut self.ix, &mut self.iy, &mut self.grid);
        let gradient = spatial_gradient(&self.ix, &self.iy);
        let pixels = (self.ix.nrows() * self.ix.ncols()) as f64;
        if (gradient / pixels).symmetric_eigenvalues().min() < self.lk_min_eig {
            return None;
        }
        let mut nu = Vector2d::zeros();
        for _ in 0..self.lk_iters {
            image_difference(range, r, &self.grid, &mut self.it, level1, u + g_init + nu)?;
            let eta = flow_vector(&gradient, &self.ix, &self.iy, &self.it)?;
            nu += eta;
            if eta.norm_squared() < lk_term2 {
                return Some(nu);
            }
        }
        None
    }

    /// Mean absolute intensity difference of the windows around the two points
    fn mean_residual(&mut self, image0: &Image, image1: &Image, point0: Vector2d, point1: Vector2d) -> Option<f64> {
        let r = (self.lk_win_size - 1) / 2;
        let range0 = integration_range(image0, point0, r, 0)?;
        let range1 = integration_range(image1, point1, r, 0)?;
        let range = [
            [range0[0][0].max(range1[0][0]), range0[0][1].min(range1[0][1])],
            [range0[1][0].max(range1[1][0]), range0[1][1].min(range1[1][1])],
        ];
        fill_grid(image0, range, point0, &mut self.grid);
        fill_grid(image1, range, point1, &mut self.it);
        let n = (self.grid.nrows() * self.grid.ncols()) as f64;
        Some((&self.grid - &self.it).abs().sum() / n)
    }
}

fn flow_vector(gradient: &Matrix2d, ix: &Matrixd, iy: &Matrixd, it: &Matrixd) -> Option<Vector2d> {
    let mut b = Vector2d::zeros();

    for y in 0..iy.nrows() {
        for x in 0..ix.ncols() {
            b[0] += it[(y, x)] * ix[(y, x)];
            b[1] += it[(y, x)] * iy[(y, x)];
        }
    }

    gradient.try_inverse().map(|inv_g| inv_g * b)
}

fn image_difference(
    prev_range: Range,
    r: usize,
    i0: &Matrixd,
    it: &mut Matrixd,
    level: &Image,
    center: Vector2d,
) -> Option<()> {
    let range = integration_range(level, center, r, 0)?;
    if range != prev_range {
        return None;
    }
    fill_grid(level, range, center, it);
    *it *= -1.;
    *it += i0.view((1, 1), (it.nrows(), it.ncols()));
    Some(())
}

fn spatial_gradient(ix: &Matrixd, iy: &Matrixd) -> Matrix2d {
    assert_eq!(ix.nrows(), iy.nrows());
    assert_eq!(ix.ncols(), iy.ncols());

    let mut x2 = 0.;
    let mut y2 = 0.;
    let mut xy = 0.;

    for y in 0..iy.nrows() {
        for x in 0..ix.ncols() {
            x2 += ix[(y, x)] * ix[(y, x)];
            y2 += iy[(y, x)] * iy[(y, x)];
            xy += ix[(y, x)] * iy[(y, x)];
        }
    }

    Matrix2d::new(x2, xy, xy, y2)
}

/// ref https://theailearner.com/tag/scharr-operator/
fn scharr(
    level: &Image,
    center: Vector2d,
    range: Range,
    out_x: &mut Matrixd,
    out_y: &mut Matrixd,
    grid: &mut Matrixd,
) {
    let grange = [
        [range[0][0] - 1, range[0][1] + 1],
        [range[1][0] - 1, range[1][1] + 1],
    ];
    fill_grid(level, grange, center, grid);

    *out_x = Matrixd::zeros(grid.nrows() - 2, grid.ncols() - 2);
    *out_y = Matrixd::zeros(grid.nrows() - 2, grid.ncols() - 2);
    for y in 1..(grid.nrows() - 1) {
        for x in 1..(grid.ncols() - 1) {
            out_x[(y - 1, x - 1)] =
                (10. * grid[(y, x + 1)] + 3. * grid[(y + 1, x + 1)] + 3. * grid[(y - 1, x + 1)]
                    - 10. * grid[(y, x - 1)]
                    - 3. * grid[(y + 1, x - 1)]
                    - 3. * grid[(y - 1, x - 1)])
                    / 32.;
            out_y[(y - 1, x - 1)] =
                (10. * grid[(y + 1, x)] + 3. * grid[(y + 1, x + 1)] + 3. * grid[(y + 1, x - 1)]
                    - 10. * grid[(y - 1, x)]
                    - 3. * grid[(y - 1, x + 1)]
                    - 3. * grid[(y - 1, x - 1)])
                    / 32.;
        }
    }
}

fn fill_grid(level: &Image, range: Range, center: Vector2d, grid: &mut Matrixd) {
    *grid = na::DMatrix::zeros(
        (range[1][1] - range[1][0] + 1) as usize,
        (range[0][1] - range[0][0] + 1) as usize,
    );

    for (y_ind, y) in (range[1][0]..=range[1][1]).enumerate() {
        for (x_ind, x) in (range[0][0]..=range[0][1]).enumerate() {
            grid[(y_ind, x_ind)] = bilinear(level, center + Vector2d::new(x as f64, y as f64));
        }
    }
}

/// Returns closed range of integer steps that can be taken without going outside
/// the image borders. Returns None if the center point is outside the level
/// boundaries or the range would be empty.
fn integration_range(level: &Image, center: Vector2d, r: usize, padding: i16) -> Option<Range> {
    let r = r as i16;
    let mut range = [[0, 0], [0, 0]];
    for i in 0..2 {
        let s = level.size(i);
        if center[i] < 0. || center[i] > (s - 1) as f64 {
            return None;
        }
        let n = center[i] as i16;
        let fract = if center[i].fract() > 0. { 1 } else { 0 };
        range[i] = [
            i16::max(-r, -n + padding),
            i16::min(r, s as i16 - n - padding - 1 - fract),
        ];
        if range[i][0] > range[i][1] {
            return None;
        }
    }
    Some(range)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_pyramid_frame(image: Image, lk_levels: usize) -> PyramidFrame {
        let mut frame = PyramidFrame::empty();
        frame.assign(&image, lk_levels).unwrap();
        frame
    }

    fn patch() -> Image {
        Image {
            data: vec![
                44, 44, 44, 44, 44, 44, 44, 44, 44, 44, 55, 55, 55, 55, 55, 55, 55, 44, 44, 55, 77,
                77, 77, 77, 77, 55, 44, 44, 55, 77, 88, 88, 88, 77, 55, 44, 44, 55, 77, 88, 99, 88,
                77, 55, 44, 44, 55, 77, 88, 88, 88, 77, 55, 44, 44, 55, 77, 77, 77, 77, 77, 55, 44,
                44, 55, 55, 55, 55, 55, 55, 55, 44, 44, 44, 44, 44, 44, 44, 44, 44, 44,
            ],
            width: 9,
            height: 9,
        }
    }

    #[test]
    fn test_flow() {
        let image_size: i32 = 128;
        let mut image0 = Image {
            data: vec![0; image_size.pow(2) as usize],
            width: 128,
            height: 128,
        };
        let mut image1 = image0.clone();
        let patch = patch();

        // Place the patch at different positions in the two images.
        let x: i32 = 60;
        let y: i32 = 60;
        let dx: i32 = -2;
        let dy: i32 = 1;
        image0.set_sub_image_i32(x, y, &patch);
        image1.set_sub_image_i32(x + dx, y + dy, &patch);

        let lk_levels = 3;
        let pyramid_frame0 = make_pyramid_frame(image0, lk_levels);
        let pyramid_frame1 = make_pyramid_frame(image1, lk_levels);

        // Place feature at center of the first patch.
        let r = (patch.width - 1) as i32 / 2;
        let point0 = Vector2d::new((x + r) as f64, (y + r) as f64);

        let mut config = Config::default();
        config.lk_min_eig = 1e-4;
        let mut flow = OpticalFlow::new(&config, lk_levels);
        let (point1, score) = flow
            .process(&pyramid_frame0, &pyramid_frame1, point0, None)
            .expect("patch should be tracked");
        let err = (point1 - point0) - Vector2d::new(dx as f64, dy as f64);
        assert!(err.norm() < 1.0, "optical flow err {}", err.norm());
        assert!(score > 0. && score <= 1.);
    }

    #[test]
    fn test_textured_windows_pass_default_gate() {
        let scene = crate::synthetic::SyntheticScene::new(7);
        let image = |shift: Vector2d| Image {
            data: scene.render(160, 120, shift),
            width: 160,
            height: 120,
        };
        let lk_levels = 3;
        let frame0 = make_pyramid_frame(image(Vector2d::zeros()), lk_levels);
        let frame1 = make_pyramid_frame(image(Vector2d::new(1., 0.)), lk_levels);
        let mut flow = OpticalFlow::new(&Config::default(), lk_levels);

        let mut total = 0;
        let mut found = 0;
        for y in (12..108).step_by(8) {
            for x in (12..148).step_by(8) {
                let point0 = Vector2d::new(x as f64, y as f64);
                total += 1;
                if let Some((point1, _)) = flow.process(&frame0, &frame1, point0, None) {
                    found += 1;
                    assert!((point1 - point0 - Vector2d::new(1., 0.)).norm() < 1.);
                }
            }
        }
        assert!(found * 2 > total, "only {found} of {total} windows tracked");
    }

    #[test]
    fn test_flat_region_not_found() {
        let image = Image {
            data: vec![80; 64 * 64],
            width: 64,
            height: 64,
        };
        let frame0 = make_pyramid_frame(image.clone(), 2);
        let frame1 = make_pyramid_frame(image, 2);
        let mut flow = OpticalFlow::new(&Config::default(), 2);
        assert!(flow
            .process(&frame0, &frame1, Vector2d::new(32., 32.), None)
            .is_none());
    }

    #[test]
    fn test_scharr() {
        let mut image = Image {
            data: vec![
                0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
            ],
            width: 5,
            height: 5,
        };

        let mut out_x = na::dmatrix!();
        let mut out_y = na::dmatrix!();
        let mut grid = na::dmatrix!();

        let center = Vector2d::new(2.0, 2.0);
        let range = integration_range(&image, center, 1, 1).unwrap();
        scharr(&image, center, range, &mut out_x, &mut out_y, &mut grid);
        assert_eq!(out_x, na::DMatrix::zeros(3, 3));
        assert_eq!(out_y, na::DMatrix::zeros(3, 3));

        image.data = vec![
            0, 1, 2, 3, 4, 0, 1, 2, 3, 4, 0, 1, 2, 3, 4, 0, 1, 2, 3, 4, 0, 1, 2, 3, 4,
        ];
        scharr(&image, center, range, &mut out_x, &mut out_y, &mut grid);
        assert_eq!(out_x, na::DMatrix::repeat(3, 3, 1.));
        assert_eq!(out_y, na::DMatrix::zeros(3, 3));

        image.data = vec![
            0, 1, 2, 3, 4, 1, 2, 3, 4, 5, 2, 3, 4, 5, 6, 3, 4, 5, 6, 7, 4, 5, 6, 7, 8,
        ];
        scharr(&image, center, range, &mut out_x, &mut out_y, &mut grid);
        assert_eq!(out_x, na::DMatrix::repeat(3, 3, 1.));
        assert_eq!(out_y, na::DMatrix::repeat(3, 3, 1.));
    }

    #[test]
    fn test_integration_range() {
        // Width and height are pixels. Coordinate (0, 0) means center of top-left
        // pixel. Thus (9, 9) is the center of the bottom-right pixel for 10x10
        // image.
        let image = Image {
            data: vec![],
            width: 10,
            height: 10,
        };
        assert_eq!(integration_range(&image, Vector2d::new(4.5, 4.5), 3, 0).unwrap(), [[-3, 3], [-3, 3]]);
        assert_eq!(integration_range(&image, Vector2d::new(1.5, 2.5), 3, 0).unwrap(), [[-1, 3], [-2, 3]]);
        assert_eq!(integration_range(&image, Vector2d::new(0.9, 1.9), 3, 1).unwrap(), [[1, 3], [0, 3]]);
        assert_eq!(integration_range(&image, Vector2d::new(8.5, 2.0), 3, 0).unwrap(), [[-3, 0], [-2, 3]]);
        assert_eq!(integration_range(&image, Vector2d::new(9.5, 2.0), 3, 0), None);
    }
}
