//! Forward projection from geographic coordinates into GDA94 / Australian
//! Albers (EPSG:3577), the grid the fractional-cover rasters are published on.

const SEMI_MAJOR_AXIS: f64 = 6_378_137.0;
const INVERSE_FLATTENING: f64 = 298.257_222_101;
const STANDARD_PARALLEL_1: f64 = -18.0;
const STANDARD_PARALLEL_2: f64 = -36.0;
const LATITUDE_OF_ORIGIN: f64 = 0.0;
const CENTRAL_MERIDIAN: f64 = 132.0;

#[derive(Debug, Clone, Copy)]
pub struct AustralianAlbers {
    eccentricity: f64,
    n: f64,
    c: f64,
    rho0: f64,
}

impl AustralianAlbers {
    pub fn new() -> Self {
        let flattening = 1.0 / INVERSE_FLATTENING;
        let e2 = 2.0 * flattening - flattening * flattening;
        let eccentricity = e2.sqrt();

        let phi1 = STANDARD_PARALLEL_1.to_radians();
        let phi2 = STANDARD_PARALLEL_2.to_radians();
        let m1 = m(phi1, e2);
        let m2 = m(phi2, e2);
        let q1 = q(phi1, eccentricity);
        let q2 = q(phi2, eccentricity);
        let q0 = q(LATITUDE_OF_ORIGIN.to_radians(), eccentricity);

        let n = (m1 * m1 - m2 * m2) / (q2 - q1);
        let c = m1 * m1 + n * q1;
        let rho0 = SEMI_MAJOR_AXIS * (c - n * q0).sqrt() / n;

        Self {
            eccentricity,
            n,
            c,
            rho0,
        }
    }

    /// `(x, y)` in metres for a longitude/latitude pair in degrees.
    pub fn project(&self, lon: f64, lat: f64) -> (f64, f64) {
        let rho = SEMI_MAJOR_AXIS * (self.c - self.n * q(lat.to_radians(), self.eccentricity)).sqrt()
            / self.n;
        let theta = self.n * (lon - CENTRAL_MERIDIAN).to_radians();
        (rho * theta.sin(), self.rho0 - rho * theta.cos())
    }
}

impl Default for AustralianAlbers {
    fn default() -> Self {
        Self::new()
    }
}

fn m(phi: f64, e2: f64) -> f64 {
    let sin = phi.sin();
    phi.cos() / (1.0 - e2 * sin * sin).sqrt()
}

fn q(phi: f64, eccentricity: f64) -> f64 {
    let e2 = eccentricity * eccentricity;
    let sin = phi.sin();
    (1.0 - e2)
        * (sin / (1.0 - e2 * sin * sin)
            - (1.0 / (2.0 * eccentricity))
                * ((1.0 - eccentricity * sin) / (1.0 + eccentricity * sin)).ln())
}
