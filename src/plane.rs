//! Maps the pixel grid of an image onto a square-pixel window of the
//! complex plane.  The window is described the way the renderers
//! describe it: a center point and a radius, where the radius spans
//! half the image width.  Pixel spacing is identical on both axes, so
//! the vertical extent follows from the image shape instead of being
//! chosen independently.

use num::Complex;

use calc::{CalcError, CalcResult};

/// A width x height pixel grid laid over a window of the complex
/// plane.  Pixel (0, 0) sits at the lower-left corner of the window
/// and coordinates grow rightward and upward.
#[derive(Clone, Debug)]
pub struct PlaneMap {
    width: usize,
    height: usize,
    begin: Complex<f64>,
    ival: f64,
}

impl PlaneMap {
    /// Builds the mapping for an image of the given shape looking at
    /// `center` with half-width `radius`.
    pub fn new(
        width: usize,
        height: usize,
        center: Complex<f64>,
        radius: f64,
    ) -> CalcResult<PlaneMap> {
        if width < 2 || height == 0 {
            return Err(CalcError::config(format!(
                "image shape {}x{} is too small to map",
                width, height
            )));
        }
        if !(radius.is_finite() && radius > 0.0) {
            return Err(CalcError::config(format!(
                "view radius {} is not a positive finite number",
                radius
            )));
        }
        if !(center.re.is_finite() && center.im.is_finite()) {
            return Err(CalcError::config("view center is not finite"));
        }
        // Half the width carries the radius; the height follows the
        // same spacing.
        let ival = radius / ((width / 2) as f64);
        let begin = Complex::new(center.re - radius, center.im - ival * ((height / 2) as f64));
        Ok(PlaneMap { width, height, begin, ival })
    }

    /// Width of the pixel grid.
    pub fn width(&self) -> usize {
        self.width
    }

    /// Height of the pixel grid.
    pub fn height(&self) -> usize {
        self.height
    }

    /// The total number of points in the grid.  Used to size result
    /// buffers.
    pub fn len(&self) -> usize {
        self.width * self.height
    }

    /// Describes that the grid holds no pixels, which `new` never
    /// lets happen.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The distance between two neighboring pixels on either axis.
    pub fn spacing(&self) -> f64 {
        self.ival
    }

    /// The complex number under pixel (px, py).
    pub fn point(&self, px: usize, py: usize) -> Complex<f64> {
        Complex::new(
            self.begin.re + (px as f64) * self.ival,
            self.begin.im + (py as f64) * self.ival,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bad_shapes_are_refused() {
        assert!(PlaneMap::new(0, 4, Complex::new(0.0, 0.0), 2.0).is_err());
        assert!(PlaneMap::new(1, 4, Complex::new(0.0, 0.0), 2.0).is_err());
        assert!(PlaneMap::new(4, 0, Complex::new(0.0, 0.0), 2.0).is_err());
        assert!(PlaneMap::new(4, 4, Complex::new(0.0, 0.0), 0.0).is_err());
        assert!(PlaneMap::new(4, 4, Complex::new(0.0, 0.0), -1.0).is_err());
        assert!(PlaneMap::new(4, 4, Complex::new(0.0, 0.0), f64::NAN).is_err());
        assert!(PlaneMap::new(4, 4, Complex::new(f64::INFINITY, 0.0), 2.0).is_err());
    }

    #[test]
    fn the_center_lands_on_the_middle_pixel() {
        let pm = PlaneMap::new(4, 4, Complex::new(0.0, 0.0), 2.0).unwrap();
        assert_eq!(pm.point(2, 2), Complex::new(0.0, 0.0));
        assert_eq!(pm.point(0, 0), Complex::new(-2.0, -2.0));
    }

    #[test]
    fn the_left_edge_sits_at_center_minus_radius() {
        let pm = PlaneMap::new(800, 600, Complex::new(-0.5, 0.0), 2.0).unwrap();
        assert_eq!(pm.point(0, 300).re, -2.5);
        let mid = pm.point(400, 300);
        assert!((mid.re - -0.5).abs() < 1e-12);
        assert!((mid.im - 0.0).abs() < 1e-12);
    }

    #[test]
    fn spacing_is_square_on_both_axes() {
        let pm = PlaneMap::new(640, 480, Complex::new(0.25, -0.5), 1.5).unwrap();
        let dx = pm.point(11, 7).re - pm.point(10, 7).re;
        let dy = pm.point(10, 8).im - pm.point(10, 7).im;
        assert!((dx - pm.spacing()).abs() < 1e-15);
        assert!((dy - pm.spacing()).abs() < 1e-15);
    }

    #[test]
    fn odd_widths_halve_like_the_renderers_expect() {
        // 5 / 2 counts as 2 columns of radius, not 2.5.
        let pm = PlaneMap::new(5, 3, Complex::new(0.0, 0.0), 2.0).unwrap();
        assert_eq!(pm.spacing(), 1.0);
        assert_eq!(pm.point(2, 1), Complex::new(0.0, 0.0));
    }

    #[test]
    fn len_counts_the_grid() {
        let pm = PlaneMap::new(8, 4, Complex::new(0.0, 0.0), 2.0).unwrap();
        assert_eq!(pm.len(), 32);
        assert!(!pm.is_empty());
    }
}
