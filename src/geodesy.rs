//! Datum definitions and geodetic/Cartesian coordinate conversions.
//!
//! A [`Datum`] is a biaxial ellipsoid (semi-major axis `a`, semi-minor axis
//! `b`) with a name. All world coordinates inside the adjustment are
//! geocentric Cartesian metres; conversions to and from geodetic
//! (longitude, latitude, height-above-datum) happen only at the edges:
//! GCP parsing, DEM sampling, LLH residuals and report writing.

use nalgebra::Vector3;

use crate::error::{AdjustError, AdjustResult};

/// Name used when no datum was supplied on the command line.
pub const UNSPECIFIED_DATUM: &str = "unspecified_datum";

/// A reference ellipsoid for geodetic/Cartesian conversions.
#[derive(Debug, Clone, PartialEq)]
pub struct Datum {
    name: String,
    semi_major: f64,
    semi_minor: f64,
}

impl Default for Datum {
    fn default() -> Self {
        Datum {
            name: UNSPECIFIED_DATUM.to_string(),
            semi_major: 1.0,
            semi_minor: 1.0,
        }
    }
}

impl std::fmt::Display for Datum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} (a = {} m, b = {} m)",
            self.name, self.semi_major, self.semi_minor
        )
    }
}

impl Datum {
    /// Create a datum from explicit semi-axes in metres.
    pub fn from_semi_axes(name: &str, semi_major: f64, semi_minor: f64) -> AdjustResult<Self> {
        if semi_major <= 0.0 || semi_minor <= 0.0 || semi_minor > semi_major {
            return Err(AdjustError::Argument(format!(
                "Invalid ellipsoid semi-axes: a = {semi_major}, b = {semi_minor}"
            )));
        }
        Ok(Datum {
            name: name.to_string(),
            semi_major,
            semi_minor,
        })
    }

    /// Look up a well-known datum by name.
    ///
    /// Accepted names: WGS_1984, D_MOON, D_MARS, MOLA, NAD83, WGS72, NAD27,
    /// and the aliases Earth (= WGS_1984), Mars (= D_MARS), Moon (= D_MOON).
    pub fn well_known(name: &str) -> AdjustResult<Self> {
        let (canonical, a, b) = match name {
            "WGS_1984" | "WGS84" | "Earth" => ("WGS_1984", 6378137.0, 6356752.3142),
            "D_MOON" | "Moon" => ("D_MOON", 1737400.0, 1737400.0),
            "D_MARS" | "Mars" => ("D_MARS", 3396190.0, 3396190.0),
            "MOLA" => ("MOLA", 3396000.0, 3396000.0),
            "NAD83" => ("NAD83", 6378137.0, 6356752.31414),
            "WGS72" => ("WGS72", 6378135.0, 6356750.52),
            "NAD27" => ("NAD27", 6378206.4, 6356583.8),
            other => {
                return Err(AdjustError::Argument(format!("Unknown datum: {other}")));
            }
        };
        Datum::from_semi_axes(canonical, a, b)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn semi_major_axis(&self) -> f64 {
        self.semi_major
    }

    pub fn semi_minor_axis(&self) -> f64 {
        self.semi_minor
    }

    /// Whether a real datum was configured (reports and GCP handling require one).
    pub fn is_specified(&self) -> bool {
        self.name != UNSPECIFIED_DATUM
    }

    /// First eccentricity squared.
    fn e2(&self) -> f64 {
        let a2 = self.semi_major * self.semi_major;
        let b2 = self.semi_minor * self.semi_minor;
        (a2 - b2) / a2
    }

    /// Convert geodetic (lon, lat in degrees, height in metres above the
    /// ellipsoid) to geocentric Cartesian metres.
    pub fn geodetic_to_cartesian(&self, llh: &Vector3<f64>) -> Vector3<f64> {
        let lon = llh.x.to_radians();
        let lat = llh.y.to_radians();
        let h = llh.z;
        let e2 = self.e2();

        let sin_lat = lat.sin();
        let cos_lat = lat.cos();
        // Prime vertical radius of curvature
        let n = self.semi_major / (1.0 - e2 * sin_lat * sin_lat).sqrt();

        Vector3::new(
            (n + h) * cos_lat * lon.cos(),
            (n + h) * cos_lat * lon.sin(),
            (n * (1.0 - e2) + h) * sin_lat,
        )
    }

    /// Convert geocentric Cartesian metres to geodetic
    /// (lon, lat in degrees, height in metres).
    ///
    /// Bowring's iteration on the reduced latitude; three rounds are enough
    /// for sub-millimetre height accuracy anywhere on Earth-sized bodies.
    pub fn cartesian_to_geodetic(&self, xyz: &Vector3<f64>) -> Vector3<f64> {
        let a = self.semi_major;
        let b = self.semi_minor;
        let e2 = self.e2();
        let ep2 = (a * a - b * b) / (b * b);

        let p = (xyz.x * xyz.x + xyz.y * xyz.y).sqrt();
        let lon = xyz.y.atan2(xyz.x);

        if p < 1e-12 {
            // On the polar axis
            let lat = if xyz.z >= 0.0 {
                std::f64::consts::FRAC_PI_2
            } else {
                -std::f64::consts::FRAC_PI_2
            };
            let h = xyz.z.abs() - b;
            return Vector3::new(lon.to_degrees(), lat.to_degrees(), h);
        }

        let mut beta = (a * xyz.z).atan2(b * p);
        let mut lat = 0.0;
        for _ in 0..3 {
            let sb = beta.sin();
            let cb = beta.cos();
            lat = (xyz.z + ep2 * b * sb * sb * sb).atan2(p - e2 * a * cb * cb * cb);
            beta = (b * lat.tan() / a).atan();
        }

        let sin_lat = lat.sin();
        let n = a / (1.0 - e2 * sin_lat * sin_lat).sqrt();
        let h = if lat.abs() < std::f64::consts::FRAC_PI_4 {
            p / lat.cos() - n
        } else {
            xyz.z / sin_lat - n * (1.0 - e2)
        };

        Vector3::new(lon.to_degrees(), lat.to_degrees(), h)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_well_known_names() {
        assert_eq!(Datum::well_known("Earth").unwrap().name(), "WGS_1984");
        assert_eq!(Datum::well_known("D_MOON").unwrap().name(), "D_MOON");
        assert!(Datum::well_known("D_VENUS").is_err());
    }

    #[test]
    fn test_round_trip_wgs84() {
        let datum = Datum::well_known("WGS_1984").unwrap();
        for &(lon, lat, h) in &[
            (0.0, 0.0, 0.0),
            (-122.4, 37.7, 150.0),
            (15.0, -75.0, 2300.0),
            (179.9, 89.0, -50.0),
        ] {
            let llh = Vector3::new(lon, lat, h);
            let xyz = datum.geodetic_to_cartesian(&llh);
            let back = datum.cartesian_to_geodetic(&xyz);
            let xyz2 = datum.geodetic_to_cartesian(&back);
            assert!(
                (xyz - xyz2).norm() < 1e-3,
                "round trip failed at ({lon}, {lat}, {h}): {:?}",
                back
            );
        }
    }

    #[test]
    fn test_equator_point() {
        let datum = Datum::well_known("WGS_1984").unwrap();
        let xyz = datum.geodetic_to_cartesian(&Vector3::new(0.0, 0.0, 0.0));
        assert!((xyz - Vector3::new(6378137.0, 0.0, 0.0)).norm() < 1e-6);
    }

    #[test]
    fn test_spherical_moon() {
        // On a sphere the geodetic latitude equals the geocentric one.
        let datum = Datum::well_known("D_MOON").unwrap();
        let llh = Vector3::new(45.0, 30.0, 1000.0);
        let xyz = datum.geodetic_to_cartesian(&llh);
        let back = datum.cartesian_to_geodetic(&xyz);
        assert!((back - llh).norm() < 1e-6);
    }
}
