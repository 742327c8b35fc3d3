//! Interpolated raster access: DEM grids and stereo disparity maps.
//!
//! Both raster kinds are immutable once loaded and sampled through pure
//! functions, so solver threads can evaluate residuals against them
//! concurrently without synchronisation. Invalid samples (nodata cells,
//! coordinates off the grid) come back as `None` and are dropped by the
//! callers under the numerical-skip policy.

use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

use nalgebra::Vector2;

use crate::error::{AdjustError, AdjustResult};

/// Affine georeference mapping raster pixels to lon/lat degrees.
///
/// `lon = x0 + col * dx`, `lat = y0 + row * dy` (dy is negative for
/// north-up rasters).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoTransform {
    pub x0: f64,
    pub dx: f64,
    pub y0: f64,
    pub dy: f64,
}

impl GeoTransform {
    pub fn pixel_to_lonlat(&self, pix: &Vector2<f64>) -> Vector2<f64> {
        Vector2::new(self.x0 + pix.x * self.dx, self.y0 + pix.y * self.dy)
    }

    pub fn lonlat_to_pixel(&self, ll: &Vector2<f64>) -> Vector2<f64> {
        Vector2::new((ll.x - self.x0) / self.dx, (ll.y - self.y0) / self.dy)
    }

    /// Parse a four-number sidecar line: `x0 dx y0 dy`.
    pub fn read_from_file<P: AsRef<Path>>(path: P) -> AdjustResult<Self> {
        let text = std::fs::read_to_string(&path)?;
        let vals: Vec<f64> = text
            .split_whitespace()
            .map(|t| t.parse::<f64>())
            .collect::<Result<_, _>>()?;
        if vals.len() != 4 {
            return Err(AdjustError::Io(format!(
                "Expected 4 georeference values in {}, got {}",
                path.as_ref().display(),
                vals.len()
            )));
        }
        Ok(GeoTransform {
            x0: vals[0],
            dx: vals[1],
            y0: vals[2],
            dy: vals[3],
        })
    }
}

/// An in-memory DEM with a nodata mask and bilinear sampling.
#[derive(Debug, Clone)]
pub struct DemGrid {
    cols: usize,
    rows: usize,
    nodata: f64,
    data: Vec<f64>,
    georef: GeoTransform,
}

impl DemGrid {
    pub fn new(
        cols: usize,
        rows: usize,
        nodata: f64,
        data: Vec<f64>,
        georef: GeoTransform,
    ) -> AdjustResult<Self> {
        if data.len() != cols * rows {
            return Err(AdjustError::Io(format!(
                "DEM data length {} does not match {} x {}",
                data.len(),
                cols,
                rows
            )));
        }
        Ok(DemGrid {
            cols,
            rows,
            nodata,
            data,
            georef,
        })
    }

    /// Load an ESRI ASCII grid (`ncols`, `nrows`, `xllcorner`, `yllcorner`,
    /// `cellsize`, `NODATA_value` header followed by north-to-south rows).
    pub fn read_esri_ascii<P: AsRef<Path>>(path: P) -> AdjustResult<Self> {
        let reader = BufReader::new(File::open(&path)?);
        let mut cols = 0usize;
        let mut rows = 0usize;
        let mut xll = 0.0;
        let mut yll = 0.0;
        let mut cellsize = 0.0;
        let mut nodata = -f64::MAX;
        let mut data = Vec::new();

        for line in reader.lines() {
            let line = line?;
            let mut toks = line.split_whitespace();
            let Some(first) = toks.next() else { continue };
            match first.to_ascii_lowercase().as_str() {
                "ncols" => cols = toks.next().unwrap_or("0").parse()?,
                "nrows" => rows = toks.next().unwrap_or("0").parse()?,
                "xllcorner" => xll = toks.next().unwrap_or("0").parse()?,
                "yllcorner" => yll = toks.next().unwrap_or("0").parse()?,
                "cellsize" => cellsize = toks.next().unwrap_or("0").parse()?,
                "nodata_value" => nodata = toks.next().unwrap_or("0").parse()?,
                _ => {
                    data.push(first.parse::<f64>()?);
                    for t in toks {
                        data.push(t.parse::<f64>()?);
                    }
                }
            }
        }

        if cols == 0 || rows == 0 || cellsize <= 0.0 {
            return Err(AdjustError::Io(format!(
                "Malformed ESRI grid header in {}",
                path.as_ref().display()
            )));
        }
        // ESRI rows run north to south from the top-left cell centre.
        let georef = GeoTransform {
            x0: xll + 0.5 * cellsize,
            dx: cellsize,
            y0: yll + (rows as f64 - 0.5) * cellsize,
            dy: -cellsize,
        };
        DemGrid::new(cols, rows, nodata, data, georef)
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn georef(&self) -> &GeoTransform {
        &self.georef
    }

    fn cell(&self, col: usize, row: usize) -> Option<f64> {
        let v = self.data[row * self.cols + col];
        if v == self.nodata || !v.is_finite() {
            None
        } else {
            Some(v)
        }
    }

    /// Whether a fractional pixel lies inside the interpolatable area.
    pub fn contains_pixel(&self, pix: &Vector2<f64>) -> bool {
        pix.x >= 0.0
            && pix.y >= 0.0
            && pix.x <= (self.cols - 1) as f64
            && pix.y <= (self.rows - 1) as f64
    }

    /// Bilinearly sample the DEM at a fractional pixel. `None` when the
    /// pixel is off the grid or any contributing cell is nodata.
    pub fn sample_pixel(&self, pix: &Vector2<f64>) -> Option<f64> {
        if !self.contains_pixel(pix) || !pix.x.is_finite() || !pix.y.is_finite() {
            return None;
        }
        let iu = (pix.x.trunc() as usize).min(self.cols - 1);
        let iv = (pix.y.trunc() as usize).min(self.rows - 1);
        let fu = pix.x - iu as f64;
        let fv = pix.y - iv as f64;
        let iu1 = (iu + 1).min(self.cols - 1);
        let iv1 = (iv + 1).min(self.rows - 1);

        let v00 = self.cell(iu, iv)?;
        let v01 = self.cell(iu1, iv)?;
        let v10 = self.cell(iu, iv1)?;
        let v11 = self.cell(iu1, iv1)?;

        Some(
            v00 * (1.0 - fu) * (1.0 - fv)
                + v01 * fu * (1.0 - fv)
                + v10 * (1.0 - fu) * fv
                + v11 * fu * fv,
        )
    }

    /// Sample the DEM height at a lon/lat position in degrees.
    pub fn sample_lonlat(&self, ll: &Vector2<f64>) -> Option<f64> {
        self.sample_pixel(&self.georef.lonlat_to_pixel(ll))
    }
}

/// A per-pixel stereo disparity raster with a validity mask.
///
/// Stored as interleaved `(dx, dy, valid)` records in raster order. A
/// bilinear sample is valid only when all four contributing pixels are.
#[derive(Debug, Clone)]
pub struct DisparityMap {
    cols: usize,
    rows: usize,
    dx: Vec<f64>,
    dy: Vec<f64>,
    valid: Vec<bool>,
}

impl DisparityMap {
    pub fn new(cols: usize, rows: usize, dx: Vec<f64>, dy: Vec<f64>, valid: Vec<bool>) -> Self {
        assert_eq!(dx.len(), cols * rows);
        assert_eq!(dy.len(), cols * rows);
        assert_eq!(valid.len(), cols * rows);
        DisparityMap {
            cols,
            rows,
            dx,
            dy,
            valid,
        }
    }

    /// Read the flat little-endian binary format: `u64 cols`, `u64 rows`,
    /// then `cols * rows` records of `f64 dx, f64 dy, u8 valid`.
    pub fn read_binary<P: AsRef<Path>>(path: P) -> AdjustResult<Self> {
        let mut file = File::open(&path)?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;
        if buf.len() < 16 {
            return Err(AdjustError::Io(format!(
                "Disparity file too short: {}",
                path.as_ref().display()
            )));
        }
        let cols = u64::from_le_bytes(buf[0..8].try_into().unwrap()) as usize;
        let rows = u64::from_le_bytes(buf[8..16].try_into().unwrap()) as usize;
        let record = 17;
        if buf.len() != 16 + cols * rows * record {
            return Err(AdjustError::Io(format!(
                "Disparity file size mismatch for {} x {} raster: {}",
                cols,
                rows,
                path.as_ref().display()
            )));
        }
        let n = cols * rows;
        let mut dx = Vec::with_capacity(n);
        let mut dy = Vec::with_capacity(n);
        let mut valid = Vec::with_capacity(n);
        for i in 0..n {
            let off = 16 + i * record;
            dx.push(f64::from_le_bytes(buf[off..off + 8].try_into().unwrap()));
            dy.push(f64::from_le_bytes(
                buf[off + 8..off + 16].try_into().unwrap(),
            ));
            valid.push(buf[off + 16] != 0);
        }
        Ok(DisparityMap::new(cols, rows, dx, dy, valid))
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn contains_pixel(&self, pix: &Vector2<f64>) -> bool {
        pix.x >= 0.0
            && pix.y >= 0.0
            && pix.x <= (self.cols - 1) as f64
            && pix.y <= (self.rows - 1) as f64
    }

    /// Bilinearly sample the disparity at a fractional pixel.
    pub fn sample_pixel(&self, pix: &Vector2<f64>) -> Option<Vector2<f64>> {
        if !self.contains_pixel(pix) || !pix.x.is_finite() || !pix.y.is_finite() {
            return None;
        }
        let iu = (pix.x.trunc() as usize).min(self.cols - 1);
        let iv = (pix.y.trunc() as usize).min(self.rows - 1);
        let fu = pix.x - iu as f64;
        let fv = pix.y - iv as f64;
        let iu1 = (iu + 1).min(self.cols - 1);
        let iv1 = (iv + 1).min(self.rows - 1);

        let idx = [
            iv * self.cols + iu,
            iv * self.cols + iu1,
            iv1 * self.cols + iu,
            iv1 * self.cols + iu1,
        ];
        if idx.iter().any(|&i| !self.valid[i]) {
            return None;
        }
        let w = [
            (1.0 - fu) * (1.0 - fv),
            fu * (1.0 - fv),
            (1.0 - fu) * fv,
            fu * fv,
        ];
        let mut out = Vector2::zeros();
        for k in 0..4 {
            out.x += self.dx[idx[k]] * w[k];
            out.y += self.dy[idx[k]] * w[k];
        }
        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat_dem() -> DemGrid {
        let georef = GeoTransform {
            x0: 10.0,
            dx: 0.1,
            y0: 45.0,
            dy: -0.1,
        };
        DemGrid::new(4, 4, -9999.0, vec![100.0; 16], georef).unwrap()
    }

    #[test]
    fn test_georef_round_trip() {
        let dem = flat_dem();
        let pix = Vector2::new(1.5, 2.25);
        let ll = dem.georef().pixel_to_lonlat(&pix);
        let back = dem.georef().lonlat_to_pixel(&ll);
        assert!((back - pix).norm() < 1e-12);
    }

    #[test]
    fn test_bilinear_flat() {
        let dem = flat_dem();
        assert_eq!(dem.sample_pixel(&Vector2::new(1.3, 2.7)), Some(100.0));
        assert_eq!(dem.sample_pixel(&Vector2::new(-0.1, 0.0)), None);
        assert_eq!(dem.sample_pixel(&Vector2::new(0.0, 3.5)), None);
    }

    #[test]
    fn test_bilinear_gradient() {
        let georef = GeoTransform {
            x0: 0.0,
            dx: 1.0,
            y0: 0.0,
            dy: 1.0,
        };
        // Height equals the column index.
        let data: Vec<f64> = (0..9).map(|i| (i % 3) as f64).collect();
        let dem = DemGrid::new(3, 3, -9999.0, data, georef).unwrap();
        let h = dem.sample_pixel(&Vector2::new(0.5, 1.0)).unwrap();
        assert!((h - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_nodata_poisons_sample() {
        let georef = GeoTransform {
            x0: 0.0,
            dx: 1.0,
            y0: 0.0,
            dy: 1.0,
        };
        let mut data = vec![5.0; 9];
        data[4] = -9999.0; // centre cell
        let dem = DemGrid::new(3, 3, -9999.0, data, georef).unwrap();
        assert_eq!(dem.sample_pixel(&Vector2::new(0.5, 0.5)), None);
        assert_eq!(dem.sample_pixel(&Vector2::new(0.25, 0.25)), None);
    }

    #[test]
    fn test_disparity_validity() {
        let mut valid = vec![true; 4];
        valid[3] = false;
        let disp = DisparityMap::new(2, 2, vec![1.0; 4], vec![-2.0; 4], valid);
        let d = disp.sample_pixel(&Vector2::new(0.0, 0.0)).unwrap();
        assert!((d - Vector2::new(1.0, -2.0)).norm() < 1e-12);
        // Interpolation touching the invalid pixel fails.
        assert_eq!(disp.sample_pixel(&Vector2::new(0.5, 0.5)), None);
    }
}
