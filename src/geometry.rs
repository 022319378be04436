//! Polygon records written by the detector.
//!
//! Each record is a JSON list of `[longitude, latitude]` pairs. Records are
//! validated once, when they cross into the store, and handled as
//! [`Polygon`] values from then on.

use geo::{Area, Coord, Intersects, Line, LineString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f64; 2]", into = "[f64; 2]")]
pub struct Vertex {
    pub lon: f64,
    pub lat: f64,
}

impl From<[f64; 2]> for Vertex {
    fn from([lon, lat]: [f64; 2]) -> Self {
        Self { lon, lat }
    }
}

impl From<Vertex> for [f64; 2] {
    fn from(v: Vertex) -> Self {
        [v.lon, v.lat]
    }
}

#[derive(Debug, Error, PartialEq, Clone)]
pub enum GeometryError {
    #[error("not a list of [longitude, latitude] pairs: {0}")]
    Syntax(String),
    #[error("vertex {index} is out of range (lon {lon}, lat {lat})")]
    OutOfRange { index: usize, lon: f64, lat: f64 },
    #[error("polygon needs at least 3 distinct vertices, found {0}")]
    TooFewVertices(usize),
    #[error("vertex {0} repeats the previous vertex")]
    RepeatedVertex(usize),
    #[error("polygon has zero area")]
    Degenerate,
    #[error("edges {0} and {1} intersect")]
    SelfIntersecting(usize, usize),
}

/// A simple closed polygon in geographic coordinates.
///
/// The vertex sequence is kept exactly as read. `explicitly_closed` records
/// whether the source repeated the first vertex at the end.
#[derive(Debug, Clone, PartialEq)]
pub struct Polygon {
    vertices: Vec<Vertex>,
    explicitly_closed: bool,
}

impl Polygon {
    pub fn new(vertices: Vec<Vertex>) -> Result<Self, GeometryError> {
        for (index, v) in vertices.iter().enumerate() {
            let in_range = v.lon.is_finite()
                && v.lat.is_finite()
                && (-180.0..=180.0).contains(&v.lon)
                && (-90.0..=90.0).contains(&v.lat);
            if !in_range {
                return Err(GeometryError::OutOfRange {
                    index,
                    lon: v.lon,
                    lat: v.lat,
                });
            }
        }

        let explicitly_closed = vertices.len() > 1 && vertices.first() == vertices.last();
        let polygon = Self {
            vertices,
            explicitly_closed,
        };
        polygon.validate_ring()?;
        Ok(polygon)
    }

    pub fn from_json(text: &str) -> Result<Self, GeometryError> {
        let vertices: Vec<Vertex> =
            serde_json::from_str(text).map_err(|e| GeometryError::Syntax(e.to_string()))?;
        Self::new(vertices)
    }

    pub fn to_json(&self) -> String {
        // A Vec of [f64; 2] always serializes.
        serde_json::to_string(&self.vertices).unwrap_or_default()
    }

    /// Vertices exactly as read, including an explicit closing vertex.
    pub fn vertices(&self) -> &[Vertex] {
        &self.vertices
    }

    /// The open ring: every vertex once, without the closing duplicate.
    pub fn ring(&self) -> &[Vertex] {
        if self.explicitly_closed {
            &self.vertices[..self.vertices.len() - 1]
        } else {
            &self.vertices
        }
    }

    pub fn is_explicitly_closed(&self) -> bool {
        self.explicitly_closed
    }

    /// The ring as a `geo` polygon, closed, without holes.
    pub fn to_geo(&self) -> geo::Polygon<f64> {
        let exterior: Vec<Coord<f64>> = self.ring().iter().map(|&v| v.into()).collect();
        geo::Polygon::new(LineString::from(exterior), Vec::new())
    }

    fn validate_ring(&self) -> Result<(), GeometryError> {
        let ring = self.ring();
        let n = ring.len();

        for i in 1..n {
            if ring[i] == ring[i - 1] {
                return Err(GeometryError::RepeatedVertex(i));
            }
        }
        let mut distinct: Vec<&Vertex> = Vec::with_capacity(n);
        for v in ring {
            if !distinct.contains(&v) {
                distinct.push(v);
            }
        }
        if distinct.len() < 3 {
            return Err(GeometryError::TooFewVertices(distinct.len()));
        }

        let polygon = self.to_geo();
        if polygon.signed_area() == 0.0 {
            return Err(GeometryError::Degenerate);
        }

        // Edge i runs from ring[i] to ring[i + 1]. Adjacent edges share a
        // vertex and are skipped, including the wrap-around pair (0, n-1).
        let edges: Vec<Line<f64>> = polygon.exterior().lines().collect();
        for i in 0..edges.len() {
            for j in (i + 2)..edges.len() {
                if i == 0 && j == edges.len() - 1 {
                    continue;
                }
                if edges[i].intersects(&edges[j]) {
                    return Err(GeometryError::SelfIntersecting(i, j));
                }
            }
        }
        Ok(())
    }
}

impl From<Vertex> for Coord<f64> {
    fn from(v: Vertex) -> Self {
        Coord { x: v.lon, y: v.lat }
    }
}
