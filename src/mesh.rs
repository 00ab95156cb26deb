//! Icosahedral geodesic mesh algebra.
//!
//! The Earth's surface is tiled by the 20 faces of an icosahedron projected
//! onto the unit sphere; each triangle subdivides into four children down to
//! level 21. This module is pure: it owns the addressing algebra
//! (encode/decode, parent/children, polygon/centroid, point lookup) and no
//! state.

use once_cell::sync::Lazy;
use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::geometry::{planar_contains, spherical_centroid, spherical_contains, GeoPoint, Vec3};

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

/// Level of the 20 face triangles.
pub const MIN_LEVEL: u8 = 1;
/// Deepest subdivision level (~7 m sides).
pub const MAX_LEVEL: u8 = 21;
/// Number of faces of the base icosahedron.
pub const FACE_COUNT: u8 = 20;

/// Approximate edge length of a face triangle in metres.
const BASE_EDGE_M: f64 = 7_200_000.0;

/// Canonical id version prefix.
const ID_PREFIX: &str = "STP-v1";
/// Fixed width of the path field in the canonical string (MAX_LEVEL - 1).
const PATH_WIDTH: usize = 20;

/// Levels at or below this use spherical containment; deeper levels use the
/// planar tangent-plane approximation (sides are ≤ ~225 km from level 6 on,
/// and the planar error is negligible below ~10 km sides; spherical tests
/// are kept through level 5 where faces span thousands of kilometres).
const SPHERICAL_CONTAINMENT_MAX_LEVEL: u8 = 5;

/// Tolerance for edge/vertex containment on the unit sphere.
const EDGE_EPS: f64 = 1e-12;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MeshError {
    #[error("malformed triangle id: {0}")]
    MalformedId(String),
    #[error("triangle id checksum mismatch")]
    BadChecksum,
    #[error("level-21 triangle cannot be subdivided")]
    MaxLevel,
    #[error("level-1 triangle has no parent")]
    RootLevel,
    #[error("invalid coordinates: lat {0}, lon {1}")]
    InvalidCoordinates(f64, f64),
    #[error("level must be within 1..=21, got {0}")]
    InvalidLevel(u8),
    #[error("face must be within 0..=19, got {0}")]
    InvalidFace(u8),
}

// ----------------------------------------------------------------------------
// Base icosahedron
// ----------------------------------------------------------------------------

/// The 12 icosahedron vertices (golden-ratio construction), unit-normalized.
static VERTICES: Lazy<[Vec3; 12]> = Lazy::new(|| {
    let phi = (1.0 + 5.0_f64.sqrt()) / 2.0;
    [
        (-1.0, phi, 0.0),
        (1.0, phi, 0.0),
        (-1.0, -phi, 0.0),
        (1.0, -phi, 0.0),
        (0.0, -1.0, phi),
        (0.0, 1.0, phi),
        (0.0, -1.0, -phi),
        (0.0, 1.0, -phi),
        (phi, 0.0, -1.0),
        (phi, 0.0, 1.0),
        (-phi, 0.0, -1.0),
        (-phi, 0.0, 1.0),
    ]
    .map(|(x, y, z)| Vec3::new(x, y, z).normalize())
});

/// Corner-vertex ordering for each face. Every triple is counter-clockwise
/// seen from outside the sphere; child ordering (and therefore every path
/// digit ever serialized) depends on this table staying fixed.
const FACES: [[usize; 3]; 20] = [
    [0, 11, 5],
    [0, 5, 1],
    [0, 1, 7],
    [0, 7, 10],
    [0, 10, 11],
    [1, 5, 9],
    [5, 11, 4],
    [11, 10, 2],
    [10, 7, 6],
    [7, 1, 8],
    [3, 9, 4],
    [3, 4, 2],
    [3, 2, 6],
    [3, 6, 8],
    [3, 8, 9],
    [4, 9, 5],
    [2, 4, 11],
    [6, 2, 10],
    [8, 6, 7],
    [9, 8, 1],
];

/// One subdivision step. Children are ordered 0=A-corner, 1=B-corner,
/// 2=C-corner, 3=center; the ordering is serialized in paths and events and
/// must never change.
#[inline]
fn subdivide_step(a: Vec3, b: Vec3, c: Vec3, digit: u8) -> (Vec3, Vec3, Vec3) {
    let mab = a.midpoint(&b);
    let mbc = b.midpoint(&c);
    let mca = c.midpoint(&a);
    match digit {
        0 => (a, mab, mca),
        1 => (mab, b, mbc),
        2 => (mca, mbc, c),
        _ => (mab, mbc, mca),
    }
}

// ----------------------------------------------------------------------------
// Triangle identifier
// ----------------------------------------------------------------------------

/// Address of one mesh cell: face plus the child-index path from that face.
///
/// `level == path.len() + 1`. The canonical textual form is
/// `STP-v1-FF-LL-PPPPPPPPPPPPPPPPPPPP-CCCC`: zero-padded face and level, a
/// fixed-width 20-digit base-4 path (digits beyond `level-1` are `0`
/// padding), and a 4-hex-char SHA-256 checksum over the preceding bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TriangleId {
    face: u8,
    path: Vec<u8>,
}

impl TriangleId {
    /// Builds an id from parts, validating ranges.
    pub fn new(face: u8, path: Vec<u8>) -> Result<Self, MeshError> {
        if face >= FACE_COUNT {
            return Err(MeshError::InvalidFace(face));
        }
        if path.len() + 1 > MAX_LEVEL as usize {
            return Err(MeshError::InvalidLevel((path.len() + 1) as u8));
        }
        if let Some(&bad) = path.iter().find(|&&d| d > 3) {
            return Err(MeshError::MalformedId(format!("path digit {bad} out of range")));
        }
        Ok(TriangleId { face, path })
    }

    /// A face (level-1) triangle.
    pub fn face_root(face: u8) -> Result<Self, MeshError> {
        Self::new(face, Vec::new())
    }

    pub fn face(&self) -> u8 {
        self.face
    }

    pub fn level(&self) -> u8 {
        (self.path.len() + 1) as u8
    }

    pub fn path(&self) -> &[u8] {
        &self.path
    }

    /// Path digits as a stable string (`""` for faces, `"031"` etc. below).
    pub fn path_string(&self) -> String {
        self.path.iter().map(|d| char::from(b'0' + d)).collect()
    }

    /// Canonical textual form.
    pub fn encode(&self) -> String {
        let mut padded = self.path_string();
        padded.push_str(&"0".repeat(PATH_WIDTH - self.path.len()));
        let body = format!("{ID_PREFIX}-{:02}-{:02}-{padded}", self.face, self.level());
        let sum = checksum(body.as_bytes());
        format!("{body}-{sum}")
    }

    /// Parses and verifies a canonical id string.
    pub fn decode(s: &str) -> Result<Self, MeshError> {
        let malformed = || MeshError::MalformedId(s.to_string());

        let parts: Vec<&str> = s.split('-').collect();
        if parts.len() != 6 || parts[0] != "STP" || parts[1] != "v1" {
            return Err(malformed());
        }
        let (face_s, level_s, path_s, sum_s) = (parts[2], parts[3], parts[4], parts[5]);
        if face_s.len() != 2 || level_s.len() != 2 || path_s.len() != PATH_WIDTH || sum_s.len() != 4
        {
            return Err(malformed());
        }

        let face: u8 = face_s.parse().map_err(|_| malformed())?;
        let level: u8 = level_s.parse().map_err(|_| malformed())?;
        if face >= FACE_COUNT {
            return Err(MeshError::InvalidFace(face));
        }
        if !(MIN_LEVEL..=MAX_LEVEL).contains(&level) {
            return Err(MeshError::InvalidLevel(level));
        }

        let digits = level as usize - 1;
        let mut path = Vec::with_capacity(digits);
        for (i, ch) in path_s.chars().enumerate() {
            match ch {
                '0'..='3' if i < digits => path.push(ch as u8 - b'0'),
                '0' => {} // padding
                _ => return Err(malformed()),
            }
        }

        // Checksum covers everything before its own separator.
        let body_len = s.len() - 5;
        if checksum(s[..body_len].as_bytes()) != sum_s {
            return Err(MeshError::BadChecksum);
        }

        Ok(TriangleId { face, path })
    }

    /// The four children, in the fixed 0..=3 ordering.
    pub fn children(&self) -> Result<[TriangleId; 4], MeshError> {
        if self.level() >= MAX_LEVEL {
            return Err(MeshError::MaxLevel);
        }
        Ok([0u8, 1, 2, 3].map(|d| {
            let mut path = self.path.clone();
            path.push(d);
            TriangleId { face: self.face, path }
        }))
    }

    /// The enclosing triangle one level up.
    pub fn parent(&self) -> Result<TriangleId, MeshError> {
        if self.path.is_empty() {
            return Err(MeshError::RootLevel);
        }
        let mut path = self.path.clone();
        path.pop();
        Ok(TriangleId { face: self.face, path })
    }

    /// Spherical corner vertices (A, B, C), derived by walking the path down
    /// from the face triangle.
    pub fn vertices(&self) -> [Vec3; 3] {
        let corners = FACES[self.face as usize];
        let mut a = VERTICES[corners[0]];
        let mut b = VERTICES[corners[1]];
        let mut c = VERTICES[corners[2]];
        for &digit in &self.path {
            (a, b, c) = subdivide_step(a, b, c, digit);
        }
        [a, b, c]
    }

    /// Closed boundary ring: A, B, C, A — counter-clockwise on the sphere.
    pub fn polygon(&self) -> Vec<GeoPoint> {
        let [a, b, c] = self.vertices();
        vec![a.to_geo(), b.to_geo(), c.to_geo(), a.to_geo()]
    }

    /// Normalized mean of the three vertices.
    pub fn centroid(&self) -> GeoPoint {
        let [a, b, c] = self.vertices();
        spherical_centroid(&a, &b, &c).to_geo()
    }

    /// Whether the point lies in this triangle (boundary inclusive).
    ///
    /// Spherical containment through level 5, planar tangent-plane test from
    /// level 6 down where the approximation is sound.
    pub fn contains(&self, lat: f64, lon: f64) -> Result<bool, MeshError> {
        let p = GeoPoint::new(lat, lon);
        if !p.is_valid() {
            return Err(MeshError::InvalidCoordinates(lat, lon));
        }
        let [a, b, c] = self.vertices();
        if self.level() <= SPHERICAL_CONTAINMENT_MAX_LEVEL {
            Ok(spherical_contains(&a, &b, &c, &p.to_vec3(), EDGE_EPS))
        } else {
            let tri = [a.to_geo(), b.to_geo(), c.to_geo()];
            Ok(planar_contains(&tri, &p, EDGE_EPS))
        }
    }

    /// Approximate side length at this triangle's level.
    pub fn estimated_side_length_m(&self) -> f64 {
        side_length_m(self.level())
    }
}

impl fmt::Display for TriangleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl FromStr for TriangleId {
    type Err = MeshError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TriangleId::decode(s)
    }
}

impl Serialize for TriangleId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.encode())
    }
}

impl<'de> Deserialize<'de> for TriangleId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        TriangleId::decode(&s).map_err(D::Error::custom)
    }
}

/// First two bytes of SHA-256, lowercase hex.
fn checksum(body: &[u8]) -> String {
    let digest = Sha256::digest(body);
    hex::encode(&digest[..2])
}

// ----------------------------------------------------------------------------
// Lookup
// ----------------------------------------------------------------------------

/// Approximate side length for a level: faces are ~7200 km on a side and
/// each subdivision halves the edge.
pub fn side_length_m(level: u8) -> f64 {
    BASE_EDGE_M / f64::powi(2.0, level as i32 - 1)
}

/// Finds the triangle at `level` containing the point, descending from the
/// face triangles. Edge ties resolve to the smaller face index or path digit
/// (the first containing candidate wins).
pub fn locate(lat: f64, lon: f64, level: u8) -> Result<TriangleId, MeshError> {
    let p = GeoPoint::new(lat, lon);
    if !p.is_valid() {
        return Err(MeshError::InvalidCoordinates(lat, lon));
    }
    if !(MIN_LEVEL..=MAX_LEVEL).contains(&level) {
        return Err(MeshError::InvalidLevel(level));
    }
    let v = p.to_vec3();

    let face = find_face(&v);
    let corners = FACES[face as usize];
    let (mut a, mut b, mut c) = (
        VERTICES[corners[0]],
        VERTICES[corners[1]],
        VERTICES[corners[2]],
    );

    let mut path = Vec::with_capacity(level as usize - 1);
    for _ in 1..level {
        let digit = pick_child(&a, &b, &c, &v);
        (a, b, c) = subdivide_step(a, b, c, digit);
        path.push(digit);
    }
    Ok(TriangleId { face, path })
}

/// The face containing the point; the smallest index wins on edges. A
/// fallback by best edge-plane margin covers points that float just outside
/// every face near a shared vertex.
fn find_face(v: &Vec3) -> u8 {
    for (i, corners) in FACES.iter().enumerate() {
        let (a, b, c) = (VERTICES[corners[0]], VERTICES[corners[1]], VERTICES[corners[2]]);
        if spherical_contains(&a, &b, &c, v, EDGE_EPS) {
            return i as u8;
        }
    }
    let mut best = 0u8;
    let mut best_margin = f64::NEG_INFINITY;
    for (i, corners) in FACES.iter().enumerate() {
        let (a, b, c) = (VERTICES[corners[0]], VERTICES[corners[1]], VERTICES[corners[2]]);
        let margin = a
            .cross(&b)
            .dot(v)
            .min(b.cross(&c).dot(v))
            .min(c.cross(&a).dot(v));
        if margin > best_margin {
            best_margin = margin;
            best = i as u8;
        }
    }
    best
}

/// The child containing the point, in digit order so that edge ties prefer
/// the smaller digit; falls back to the best margin when rounding leaves the
/// point marginally outside all four.
fn pick_child(a: &Vec3, b: &Vec3, c: &Vec3, v: &Vec3) -> u8 {
    let mut best = 3u8;
    let mut best_margin = f64::NEG_INFINITY;
    for digit in 0u8..4 {
        let (ca, cb, cc) = subdivide_step(*a, *b, *c, digit);
        let margin = ca
            .cross(&cb)
            .dot(v)
            .min(cb.cross(&cc).dot(v))
            .min(cc.cross(&ca).dot(v));
        if margin >= -EDGE_EPS {
            return digit;
        }
        if margin > best_margin {
            best_margin = margin;
            best = digit;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::haversine_m;

    fn id(face: u8, path: &[u8]) -> TriangleId {
        TriangleId::new(face, path.to_vec()).unwrap()
    }

    #[test]
    fn test_faces_are_ccw() {
        for corners in FACES.iter() {
            let (a, b, c) = (VERTICES[corners[0]], VERTICES[corners[1]], VERTICES[corners[2]]);
            assert!(Vec3::triple(&a, &b, &c) > 0.0);
        }
    }

    #[test]
    fn test_encode_shape() {
        let s = id(7, &[0, 1, 2, 3]).encode();
        assert!(s.starts_with("STP-v1-07-05-0123"));
        assert_eq!(s.len(), "STP-v1".len() + 1 + 2 + 1 + 2 + 1 + 20 + 1 + 4);
    }

    #[test]
    fn test_round_trip_sampled() {
        // A spread of faces, levels and paths rather than the full grid.
        let samples: Vec<TriangleId> = vec![
            id(0, &[]),
            id(19, &[]),
            id(3, &[2]),
            id(7, &[0, 1, 2, 3]),
            id(11, &[3, 3, 3, 3, 3, 3, 3, 3, 3]),
            id(14, &[0, 2, 1, 3, 0, 2, 1, 3, 0, 2, 1, 3, 0, 2, 1, 3, 0, 2, 1, 3]),
        ];
        for t in samples {
            let decoded = TriangleId::decode(&t.encode()).unwrap();
            assert_eq!(decoded, t);
            assert_eq!(decoded.level(), t.path().len() as u8 + 1);
        }
    }

    #[test]
    fn test_decode_rejects_malformed() {
        assert!(matches!(
            TriangleId::decode("not-an-id"),
            Err(MeshError::MalformedId(_))
        ));
        assert!(matches!(
            TriangleId::decode("STQ-v1-00-01-00000000000000000000-abcd"),
            Err(MeshError::MalformedId(_))
        ));
        // Significant digits must fit the level: level 1 has no path digits.
        assert!(matches!(
            TriangleId::decode("STP-v1-00-01-10000000000000000000-ffff"),
            Err(MeshError::MalformedId(_))
        ));
        assert!(matches!(
            TriangleId::decode("STP-v1-20-01-00000000000000000000-abcd"),
            Err(MeshError::InvalidFace(20))
        ));
        assert!(matches!(
            TriangleId::decode("STP-v1-00-22-00000000000000000000-abcd"),
            Err(MeshError::InvalidLevel(22))
        ));
    }

    #[test]
    fn test_decode_rejects_bad_checksum() {
        let mut s = id(4, &[1, 2]).encode();
        let good_tail = s.split_off(s.len() - 4);
        let flipped = if good_tail.starts_with('0') { "1111" } else { "0000" };
        s.push_str(flipped);
        assert_eq!(TriangleId::decode(&s), Err(MeshError::BadChecksum));
    }

    #[test]
    fn test_hierarchy_parent_children() {
        let t = id(5, &[1, 3, 0]);
        let children = t.children().unwrap();
        for (i, child) in children.iter().enumerate() {
            assert_eq!(child.level(), t.level() + 1);
            assert_eq!(child.path()[..3], t.path()[..]);
            assert_eq!(child.path()[3], i as u8);
            assert_eq!(&child.parent().unwrap(), &t);
        }
    }

    #[test]
    fn test_children_fails_at_max_level() {
        let deep = id(0, &[0; 20]);
        assert_eq!(deep.level(), MAX_LEVEL);
        assert_eq!(deep.children(), Err(MeshError::MaxLevel));
    }

    #[test]
    fn test_parent_fails_at_root() {
        assert_eq!(id(0, &[]).parent(), Err(MeshError::RootLevel));
    }

    #[test]
    fn test_centroid_is_contained() {
        for t in [id(0, &[]), id(9, &[2]), id(16, &[3, 1]), id(2, &[0, 1, 2, 3, 0, 1, 2])] {
            let c = t.centroid();
            assert!(t.contains(c.lat, c.lon).unwrap(), "centroid outside {t}");
        }
    }

    #[test]
    fn test_children_lie_within_parent() {
        let parent = id(8, &[2, 0]);
        for child in parent.children().unwrap() {
            let c = child.centroid();
            assert!(parent.contains(c.lat, c.lon).unwrap());
            // Child vertices are on the parent boundary or inside it.
            let [a, b, c3] = child.vertices();
            let [pa, pb, pc] = parent.vertices();
            for v in [a, b, c3] {
                assert!(spherical_contains(&pa, &pb, &pc, &v, 1e-9));
            }
        }
    }

    #[test]
    fn test_polygon_is_closed_ring() {
        let ring = id(12, &[1, 1]).polygon();
        assert_eq!(ring.len(), 4);
        assert_eq!(ring[0], ring[3]);
    }

    #[test]
    fn test_locate_round_trips_centroid() {
        for t in [
            id(0, &[]),
            id(7, &[3, 1]),
            id(13, &[0, 2, 2, 1, 3]),
            id(19, &[1, 0, 3, 2, 1, 0, 3, 2, 1, 0]),
        ] {
            let c = t.centroid();
            let located = locate(c.lat, c.lon, t.level()).unwrap();
            assert_eq!(located, t);
        }
    }

    #[test]
    fn test_locate_rejects_bad_input() {
        assert!(matches!(
            locate(91.0, 0.0, 10),
            Err(MeshError::InvalidCoordinates(_, _))
        ));
        assert!(matches!(locate(0.0, 0.0, 0), Err(MeshError::InvalidLevel(0))));
        assert!(matches!(locate(0.0, 0.0, 22), Err(MeshError::InvalidLevel(22))));
    }

    #[test]
    fn test_locate_depth_consistency() {
        // The deep cell's ancestors match what locate returns at each level.
        let deep = locate(47.4979, 19.0402, 12).unwrap();
        let mut t = deep.clone();
        for level in (1..12u8).rev() {
            t = t.parent().unwrap();
            assert_eq!(locate(47.4979, 19.0402, level).unwrap(), t);
        }
    }

    #[test]
    fn test_side_length_halves_per_level() {
        assert_eq!(side_length_m(1), 7_200_000.0);
        assert_eq!(side_length_m(2), 3_600_000.0);
        assert!((side_length_m(11) - 7_031.25).abs() < 1e-9);
    }

    #[test]
    fn test_subdivision_shrinks_edges() {
        let t = id(6, &[]);
        let child = &t.children().unwrap()[3];
        let ring = child.polygon();
        let parent_ring = t.polygon();
        let edge = haversine_m(&ring[0], &ring[1]);
        let parent_edge = haversine_m(&parent_ring[0], &parent_ring[1]);
        assert!(edge < parent_edge * 0.6);
    }

    #[test]
    fn test_serde_round_trip() {
        let t = id(3, &[1, 2]);
        let json = serde_json::to_string(&t).unwrap();
        let back: TriangleId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, t);
        assert!(serde_json::from_str::<TriangleId>("\"garbage\"").is_err());
    }
}
