//! Bounding-box predicates
//!
//! Rectangles are closed: boxes that share only an edge still overlap.

use crate::types::BoundingBox;

/// True unless the boxes are disjoint on the x or the y axis.
/// Symmetric and reflexive.
pub fn overlaps(a: &BoundingBox, b: &BoundingBox) -> bool {
    let disjoint_x = a.x1 < b.x0 || b.x1 < a.x0;
    let disjoint_y = a.y1 < b.y0 || b.y1 < a.y0;
    !(disjoint_x || disjoint_y)
}

/// Manhattan distance between box centers
pub fn center_distance(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let (ax, ay) = a.center();
    let (bx, by) = b.center();
    (ax - bx).abs() + (ay - by).abs()
}

pub fn area(b: &BoundingBox) -> f32 {
    b.width().max(0.0) * b.height().max(0.0)
}

pub fn intersection_area(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let w = a.x1.min(b.x1) - a.x0.max(b.x0);
    let h = a.y1.min(b.y1) - a.y0.max(b.y0);
    if w <= 0.0 || h <= 0.0 {
        0.0
    } else {
        w * h
    }
}

/// Intersection over union; 0.0 when the union is empty
pub fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let inter = intersection_area(a, b);
    let union = area(a) + area(b) - inter;
    if union <= 0.0 {
        0.0
    } else {
        inter / union
    }
}

/// Tight bounding union of the given boxes
pub fn merge<'a, I>(boxes: I) -> Option<BoundingBox>
where
    I: IntoIterator<Item = &'a BoundingBox>,
{
    boxes.into_iter().fold(None, |acc, b| {
        Some(match acc {
            None => *b,
            Some(m) => BoundingBox {
                x0: m.x0.min(b.x0),
                y0: m.y0.min(b.y0),
                x1: m.x1.max(b.x1),
                y1: m.y1.max(b.y1),
            },
        })
    })
}

/// x0 < x1 and y0 < y1, all coordinates finite
pub fn validate(b: &BoundingBox) -> bool {
    [b.x0, b.y0, b.x1, b.y1].iter().all(|v| v.is_finite()) && b.x0 < b.x1 && b.y0 < b.y1
}

/// `inner` lies entirely within `outer`
pub fn contains(outer: &BoundingBox, inner: &BoundingBox) -> bool {
    inner.x0 >= outer.x0 && inner.y0 >= outer.y0 && inner.x1 <= outer.x1 && inner.y1 <= outer.y1
}

/// Copy of `b` grown by `margin` on every side
pub fn expand(b: &BoundingBox, margin: f32) -> BoundingBox {
    BoundingBox {
        x0: b.x0 - margin,
        y0: b.y0 - margin,
        x1: b.x1 + margin,
        y1: b.y1 + margin,
    }
}
