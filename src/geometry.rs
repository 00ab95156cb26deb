//! Spherical geometry primitives for the geodesic mesh.
//! Coordinates are decimal degrees; containment math runs on the unit sphere.

use serde::{Deserialize, Serialize};

/// Mean Earth radius in metres, used for all great-circle distances.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

// ----------------------------------------------------------------------------
// Geographic point
// ----------------------------------------------------------------------------

/// A geographic point in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

impl GeoPoint {
    #[inline]
    pub fn new(lat: f64, lon: f64) -> Self {
        GeoPoint { lat, lon }
    }

    /// Finite and within the geographic domain.
    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lon.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lon)
    }

    /// Unit vector on the sphere for this point.
    pub fn to_vec3(&self) -> Vec3 {
        let lat = self.lat.to_radians();
        let lon = self.lon.to_radians();
        Vec3 {
            x: lat.cos() * lon.cos(),
            y: lat.cos() * lon.sin(),
            z: lat.sin(),
        }
    }
}

// ----------------------------------------------------------------------------
// Unit-sphere vectors
// ----------------------------------------------------------------------------

/// A vector in R3; mesh code keeps these unit-length.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Vec3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vec3 {
    #[inline]
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Vec3 { x, y, z }
    }

    #[inline]
    pub fn dot(&self, other: &Vec3) -> f64 {
        self.x * other.x + self.y * other.y + self.z * other.z
    }

    #[inline]
    pub fn cross(&self, other: &Vec3) -> Vec3 {
        Vec3 {
            x: self.y * other.z - self.z * other.y,
            y: self.z * other.x - self.x * other.z,
            z: self.x * other.y - self.y * other.x,
        }
    }

    #[inline]
    pub fn add(&self, other: &Vec3) -> Vec3 {
        Vec3 {
            x: self.x + other.x,
            y: self.y + other.y,
            z: self.z + other.z,
        }
    }

    pub fn norm(&self) -> f64 {
        self.dot(self).sqrt()
    }

    /// Scales to unit length. Zero vectors are left untouched.
    pub fn normalize(&self) -> Vec3 {
        let n = self.norm();
        if n == 0.0 {
            return *self;
        }
        Vec3 {
            x: self.x / n,
            y: self.y / n,
            z: self.z / n,
        }
    }

    /// Geodesic midpoint: the unit-normalized sum of two unit vectors.
    #[inline]
    pub fn midpoint(&self, other: &Vec3) -> Vec3 {
        self.add(other).normalize()
    }

    /// Back to decimal degrees.
    pub fn to_geo(&self) -> GeoPoint {
        let v = self.normalize();
        GeoPoint {
            lat: v.z.asin().to_degrees(),
            lon: v.y.atan2(v.x).to_degrees(),
        }
    }

    /// Signed volume of the parallelepiped (a, b, c); positive when the
    /// triple is counter-clockwise seen from outside the sphere.
    #[inline]
    pub fn triple(a: &Vec3, b: &Vec3, c: &Vec3) -> f64 {
        a.cross(b).dot(c)
    }
}

// ----------------------------------------------------------------------------
// Distances and containment
// ----------------------------------------------------------------------------

/// Great-circle distance in metres (haversine).
pub fn haversine_m(a: &GeoPoint, b: &GeoPoint) -> f64 {
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let dlat = (b.lat - a.lat).to_radians();
    let dlon = (b.lon - a.lon).to_radians();

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().min(1.0).asin()
}

/// Point-in-spherical-triangle via edge-plane sign consistency.
///
/// The triangle must be wound counter-clockwise seen from outside; `eps`
/// admits points on an edge or vertex.
pub fn spherical_contains(a: &Vec3, b: &Vec3, c: &Vec3, p: &Vec3, eps: f64) -> bool {
    a.cross(b).dot(p) >= -eps && b.cross(c).dot(p) >= -eps && c.cross(a).dot(p) >= -eps
}

/// Spherical triangle centroid: the normalized mean of the three vertices.
pub fn spherical_centroid(a: &Vec3, b: &Vec3, c: &Vec3) -> Vec3 {
    a.add(b).add(c).normalize()
}

/// Longitude difference normalized to (-180, 180].
#[inline]
fn lon_delta(lon: f64, reference: f64) -> f64 {
    let mut d = lon - reference;
    while d > 180.0 {
        d -= 360.0;
    }
    while d <= -180.0 {
        d += 360.0;
    }
    d
}

/// Point-in-triangle in the tangent plane at the triangle centroid.
///
/// Sound for triangles up to roughly 10 km on a side; shallow-level
/// triangles must use [`spherical_contains`] instead.
pub fn planar_contains(tri: &[GeoPoint; 3], p: &GeoPoint, eps: f64) -> bool {
    let lat0 = (tri[0].lat + tri[1].lat + tri[2].lat) / 3.0;
    let lon0 = (tri[0].lon + tri[1].lon + tri[2].lon) / 3.0;
    let scale = lat0.to_radians().cos().max(1e-6);

    let project = |g: &GeoPoint| (lon_delta(g.lon, lon0) * scale, g.lat - lat0);
    let a = project(&tri[0]);
    let b = project(&tri[1]);
    let c = project(&tri[2]);
    let q = project(p);

    let sign =
        |u: (f64, f64), v: (f64, f64)| (v.0 - u.0) * (q.1 - u.1) - (v.1 - u.1) * (q.0 - u.0);
    let d1 = sign(a, b);
    let d2 = sign(b, c);
    let d3 = sign(c, a);

    let has_neg = d1 < -eps || d2 < -eps || d3 < -eps;
    let has_pos = d1 > eps || d2 > eps || d3 > eps;
    !(has_neg && has_pos)
}

/// Spherical triangle area in square metres, via l'Huilier's theorem.
pub fn spherical_triangle_area_m2(a: &Vec3, b: &Vec3, c: &Vec3) -> f64 {
    // Arc lengths of the three sides.
    let sa = b.dot(c).clamp(-1.0, 1.0).acos();
    let sb = a.dot(c).clamp(-1.0, 1.0).acos();
    let sc = a.dot(b).clamp(-1.0, 1.0).acos();
    let s = (sa + sb + sc) / 2.0;

    let t = (s / 2.0).tan()
        * ((s - sa) / 2.0).tan()
        * ((s - sb) / 2.0).tan()
        * ((s - sc) / 2.0).tan();
    let excess = 4.0 * t.max(0.0).sqrt().atan();
    excess * EARTH_RADIUS_M * EARTH_RADIUS_M
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geo_vec3_round_trip() {
        let p = GeoPoint::new(47.4979, 19.0402); // Budapest
        let back = p.to_vec3().to_geo();
        assert!((back.lat - p.lat).abs() < 1e-9);
        assert!((back.lon - p.lon).abs() < 1e-9);
    }

    #[test]
    fn test_haversine_london_paris() {
        let london = GeoPoint::new(51.5074, -0.1278);
        let paris = GeoPoint::new(48.8566, 2.3522);
        let d = haversine_m(&london, &paris);
        assert!((d - 343_500.0).abs() < 2_000.0, "got {d}");
    }

    #[test]
    fn test_haversine_zero_distance() {
        let p = GeoPoint::new(10.0, 10.0);
        assert_eq!(haversine_m(&p, &p), 0.0);
    }

    #[test]
    fn test_geodesic_midpoint_is_unit() {
        let a = GeoPoint::new(0.0, 0.0).to_vec3();
        let b = GeoPoint::new(0.0, 90.0).to_vec3();
        let m = a.midpoint(&b);
        assert!((m.norm() - 1.0).abs() < 1e-12);
        let g = m.to_geo();
        assert!((g.lon - 45.0).abs() < 1e-9);
        assert!(g.lat.abs() < 1e-9);
    }

    #[test]
    fn test_spherical_contains_centroid() {
        let a = GeoPoint::new(10.0, 10.0).to_vec3();
        let b = GeoPoint::new(10.0, 20.0).to_vec3();
        let c = GeoPoint::new(20.0, 15.0).to_vec3();
        // (a, b, c) is CCW seen from outside at this orientation
        let centroid = spherical_centroid(&a, &b, &c);
        assert!(spherical_contains(&a, &b, &c, &centroid, 1e-12));

        let outside = GeoPoint::new(-10.0, 15.0).to_vec3();
        assert!(!spherical_contains(&a, &b, &c, &outside, 1e-12));
    }

    #[test]
    fn test_spherical_contains_vertex_is_boundary() {
        let a = GeoPoint::new(10.0, 10.0).to_vec3();
        let b = GeoPoint::new(10.0, 20.0).to_vec3();
        let c = GeoPoint::new(20.0, 15.0).to_vec3();
        assert!(spherical_contains(&a, &b, &c, &a, 1e-9));
    }

    #[test]
    fn test_planar_contains() {
        let tri = [
            GeoPoint::new(47.0, 19.0),
            GeoPoint::new(47.0, 19.01),
            GeoPoint::new(47.01, 19.005),
        ];
        assert!(planar_contains(&tri, &GeoPoint::new(47.003, 19.005), 1e-12));
        assert!(!planar_contains(&tri, &GeoPoint::new(47.02, 19.005), 1e-12));
    }

    #[test]
    fn test_spherical_area_octant() {
        // One octant of the sphere is exactly one eighth of its surface.
        let a = GeoPoint::new(0.0, 0.0).to_vec3();
        let b = GeoPoint::new(0.0, 90.0).to_vec3();
        let c = GeoPoint::new(90.0, 0.0).to_vec3();
        let area = spherical_triangle_area_m2(&a, &b, &c);
        let octant = 4.0 * std::f64::consts::PI * EARTH_RADIUS_M * EARTH_RADIUS_M / 8.0;
        assert!((area - octant).abs() / octant < 1e-9);
    }

    #[test]
    fn test_planar_contains_across_antimeridian() {
        let tri = [
            GeoPoint::new(0.0, 179.99),
            GeoPoint::new(0.0, -179.99),
            GeoPoint::new(0.02, 180.0),
        ];
        assert!(planar_contains(&tri, &GeoPoint::new(0.005, 180.0), 1e-12));
    }
}
