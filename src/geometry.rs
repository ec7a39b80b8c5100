// Anchor geometry - fixed anchor coordinates in the shared metric frame
//
// The geometry is static configuration: anchor order is configuration order
// and the first anchor is the TDOA time reference.

use std::collections::HashSet;

use serde::Serialize;

use crate::constants::C;

/// Anchor identifier as reported on the wire
pub type AnchorId = String;

/// A fixed anchor with its 2-D position in meters
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Anchor {
    pub id: AnchorId,
    pub position: [f64; 2],
}

/// Immutable map of configured anchors.
#[derive(Debug, Clone, Serialize)]
pub struct AnchorGeometry {
    anchors: Vec<Anchor>,
}

impl AnchorGeometry {
    /// Build the geometry, rejecting duplicate ids, coincident anchors,
    /// non-finite coordinates and fewer than three anchors.
    pub fn new(anchors: Vec<Anchor>) -> Result<Self, String> {
        if anchors.len() < 3 {
            return Err(format!(
                "at least 3 anchors are needed for 2-D TDOA, got {}",
                anchors.len()
            ));
        }

        let mut seen = HashSet::new();
        for anchor in &anchors {
            if !seen.insert(anchor.id.as_str()) {
                return Err(format!("duplicate anchor id '{}'", anchor.id));
            }
            if !anchor.position.iter().all(|v| v.is_finite()) {
                return Err(format!("anchor '{}' has a non-finite position", anchor.id));
            }
        }

        for (i, a) in anchors.iter().enumerate() {
            for b in &anchors[i + 1..] {
                if distance(a.position, b.position) == 0.0 {
                    return Err(format!("anchors '{}' and '{}' coincide", a.id, b.id));
                }
            }
        }

        Ok(AnchorGeometry { anchors })
    }

    /// The four-anchor 3 m x 2 m rectangle of the reference deployment.
    pub fn reference_deployment() -> Self {
        let anchors = [
            ("anchor1", [0.0, 0.0]),
            ("anchor2", [3.0, 0.0]),
            ("anchor3", [3.0, 2.0]),
            ("anchor4", [0.0, 2.0]),
        ]
        .into_iter()
        .map(|(id, position)| Anchor {
            id: id.to_string(),
            position,
        })
        .collect();
        AnchorGeometry { anchors }
    }

    pub fn len(&self) -> usize {
        self.anchors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.anchors.is_empty()
    }

    pub fn anchors(&self) -> &[Anchor] {
        &self.anchors
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.anchors.iter().map(|a| a.id.as_str())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.anchors.iter().any(|a| a.id == id)
    }

    pub fn position(&self, id: &str) -> Option<[f64; 2]> {
        self.anchors.iter().find(|a| a.id == id).map(|a| a.position)
    }

    /// The time-reference anchor (first configured).
    pub fn reference(&self) -> &Anchor {
        &self.anchors[0]
    }

    pub fn centroid(&self) -> [f64; 2] {
        let n = self.anchors.len() as f64;
        let (sx, sy) = self
            .anchors
            .iter()
            .fold((0.0, 0.0), |(sx, sy), a| (sx + a.position[0], sy + a.position[1]));
        [sx / n, sy / n]
    }

    /// Time of flight from `source` to each anchor, in seconds.
    pub fn flight_times(&self, source: [f64; 2]) -> Vec<f64> {
        self.anchors
            .iter()
            .map(|a| distance(a.position, source) / C)
            .collect()
    }
}

/// Euclidean distance between two points (m).
pub fn distance(p0: [f64; 2], p1: [f64; 2]) -> f64 {
    let dx = p0[0] - p1[0];
    let dy = p0[1] - p1[1];
    (dx * dx + dy * dy).sqrt()
}

/// Parse an `id=x,y` anchor argument (command line form).
pub fn parse_anchor(s: &str) -> Result<Anchor, String> {
    let (id, coords) = s
        .split_once('=')
        .ok_or_else(|| format!("expected ID=X,Y, got '{}'", s))?;
    let id = id.trim();
    if id.is_empty() {
        return Err(format!("empty anchor id in '{}'", s));
    }
    let (x, y) = coords
        .split_once(',')
        .ok_or_else(|| format!("expected X,Y coordinates, got '{}'", coords))?;
    let x: f64 = x.trim().parse().map_err(|e| format!("bad x '{}': {}", x, e))?;
    let y: f64 = y.trim().parse().map_err(|e| format!("bad y '{}': {}", y, e))?;
    Ok(Anchor {
        id: id.to_string(),
        position: [x, y],
    })
}

/// Parse an `x,y` position.
pub fn parse_point(s: &str) -> Result<[f64; 2], String> {
    let (x, y) = s
        .split_once(',')
        .ok_or_else(|| format!("expected X,Y, got '{}'", s))?;
    let x: f64 = x.trim().parse().map_err(|e| format!("bad x '{}': {}", x, e))?;
    let y: f64 = y.trim().parse().map_err(|e| format!("bad y '{}': {}", y, e))?;
    Ok([x, y])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distance() {
        assert!((distance([0.0, 0.0], [3.0, 4.0]) - 5.0).abs() < 1e-12);
    }

    #[test]
    fn test_reference_deployment() {
        let g = AnchorGeometry::reference_deployment();
        assert_eq!(g.len(), 4);
        assert_eq!(g.reference().id, "anchor1");
        assert_eq!(g.centroid(), [1.5, 1.0]);
        assert_eq!(g.position("anchor3"), Some([3.0, 2.0]));
        assert!(g.position("anchor9").is_none());
    }

    #[test]
    fn test_geometry_validation() {
        let a = |id: &str, x: f64, y: f64| Anchor {
            id: id.to_string(),
            position: [x, y],
        };
        assert!(AnchorGeometry::new(vec![a("a", 0.0, 0.0), a("b", 1.0, 0.0)]).is_err());
        assert!(AnchorGeometry::new(vec![a("a", 0.0, 0.0), a("a", 1.0, 0.0), a("c", 0.0, 1.0)]).is_err());
        assert!(AnchorGeometry::new(vec![a("a", 0.0, 0.0), a("b", 0.0, 0.0), a("c", 0.0, 1.0)]).is_err());
        assert!(AnchorGeometry::new(vec![a("a", f64::NAN, 0.0), a("b", 1.0, 0.0), a("c", 0.0, 1.0)]).is_err());
        assert!(AnchorGeometry::new(vec![a("a", 0.0, 0.0), a("b", 1.0, 0.0), a("c", 0.0, 1.0)]).is_ok());
    }

    #[test]
    fn test_parse_anchor() {
        let anchor = parse_anchor("north=1.5, -2").unwrap();
        assert_eq!(anchor.id, "north");
        assert_eq!(anchor.position, [1.5, -2.0]);
        assert!(parse_anchor("north").is_err());
        assert!(parse_anchor("=1,2").is_err());
        assert!(parse_anchor("a=1;2").is_err());
        assert_eq!(parse_point("3,4"), Ok([3.0, 4.0]));
    }
}
