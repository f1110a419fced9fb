//! Box geometry: merged bounds, overlap ratio and proximity predicates.

use crate::types::Extent;

/// Edges of a bounding region in (left, right, top, bottom) form.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub left: f64,
    pub right: f64,
    pub top: f64,
    pub bottom: f64,
}

impl Bounds {
    pub fn length(&self) -> f64 {
        self.right - self.left
    }

    pub fn width(&self) -> f64 {
        self.top - self.bottom
    }

    pub fn area(&self) -> f64 {
        self.length() * self.width()
    }

    pub fn center_x(&self) -> f64 {
        (self.left + self.right) / 2.0
    }

    pub fn center_y(&self) -> f64 {
        (self.top + self.bottom) / 2.0
    }
}

/// Smallest region enclosing both boxes.
pub fn outer_bounds<A: Extent, B: Extent>(a: &A, b: &B) -> Bounds {
    Bounds {
        left: a.left().min(b.left()),
        right: a.right().max(b.right()),
        top: a.top().max(b.top()),
        bottom: a.bottom().min(b.bottom()),
    }
}

/// Region shared by both boxes.
///
/// Not clamped: for disjoint boxes the length and/or width come out negative.
pub fn inner_bounds<A: Extent, B: Extent>(a: &A, b: &B) -> Bounds {
    Bounds {
        left: a.left().max(b.left()),
        right: a.right().min(b.right()),
        top: a.top().min(b.top()),
        bottom: a.bottom().max(b.bottom()),
    }
}

/// Euclidean distance between the two centres.
pub fn center_distance<A: Extent, B: Extent>(a: &A, b: &B) -> f64 {
    let dx = a.center_x() - b.center_x();
    let dy = a.center_y() - b.center_y();
    (dx * dx + dy * dy).sqrt()
}

/// Overlap ratio used by the cluster merge: inner-bounds area over the smaller
/// of the two stored areas.
///
/// Returns 0.0 when either area is non-positive. The inner area is the raw
/// product of the unclamped inner bounds, so callers gate it with
/// [`is_coarse_overlap`].
///
/// # Example
///
/// ```
/// use defect_eval::metrics::iou::calculate_iou;
/// use defect_eval::types::GroundTruthBox;
///
/// let small = GroundTruthBox::new(1, 0, 0.5, 0.5, 0.1, 0.1, 1);
/// let large = GroundTruthBox::new(1, 0, 0.5, 0.5, 0.2, 0.2, 2);
/// let iou = calculate_iou(&small, small.area, &large, large.area);
/// assert!((iou - 1.0).abs() < 1e-9);
/// ```
pub fn calculate_iou<A: Extent, B: Extent>(a: &A, a_area: f64, b: &B, b_area: f64) -> f64 {
    let min_area = a_area.min(b_area);
    if min_area <= 0.0 {
        return 0.0;
    }
    inner_bounds(a, b).area() / min_area
}

/// Coarse proximity gate of the cluster merge: centres closer than half the
/// summed lengths along x, or half the summed widths along y.
///
/// Either axis suffices, so diagonal neighbours that do not intersect can pass.
pub fn is_coarse_overlap<A: Extent, B: Extent>(a: &A, b: &B) -> bool {
    (a.center_x() - b.center_x()).abs() <= (a.length() + b.length()) / 2.0
        || (a.center_y() - b.center_y()).abs() <= (a.width() + b.width()) / 2.0
}

/// Ground-truth match predicate: centres strictly within half the summed
/// lengths along x and half the summed widths along y.
pub fn is_within_reach<A: Extent, B: Extent>(a: &A, b: &B) -> bool {
    (a.center_x() - b.center_x()).abs() < (a.length() + b.length()) / 2.0
        && (a.center_y() - b.center_y()).abs() < (a.width() + b.width()) / 2.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::GroundTruthBox;

    fn bbox(cx: f64, cy: f64, length: f64, width: f64) -> GroundTruthBox {
        GroundTruthBox::new(1, 0, cx, cy, length, width, 1)
    }

    #[test]
    fn test_outer_bounds() {
        let a = bbox(0.0, 0.0, 2.0, 2.0);
        let b = bbox(2.0, 1.0, 2.0, 2.0);
        let outer = outer_bounds(&a, &b);
        assert_eq!(outer, Bounds { left: -1.0, right: 3.0, top: 2.0, bottom: -1.0 });
        assert_eq!(outer.area(), 12.0);
        assert_eq!(outer.center_x(), 1.0);
    }

    #[test]
    fn test_identical_boxes() {
        let a = bbox(0.5, 0.5, 0.2, 0.2);
        let iou = calculate_iou(&a, a.area, &a, a.area);
        assert!((iou - 1.0).abs() < 1e-10);
    }

    #[test]
    fn test_partial_overlap_uses_smaller_area() {
        let a = bbox(0.0, 0.0, 2.0, 2.0);
        let b = bbox(1.0, 0.0, 2.0, 2.0);
        // Intersection: 1 x 2 = 2, smaller area = 4
        let iou = calculate_iou(&a, a.area, &b, b.area);
        assert!((iou - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_non_positive_area() {
        let a = bbox(0.0, 0.0, 2.0, 2.0);
        let b = bbox(0.0, 0.0, 0.0, 2.0);
        assert_eq!(calculate_iou(&a, a.area, &b, b.area), 0.0);
    }

    #[test]
    fn test_coarse_overlap_accepts_diagonal_neighbours() {
        let a = bbox(0.0, 0.0, 1.0, 1.0);
        let b = bbox(0.5, 5.0, 1.0, 1.0);
        assert!(is_coarse_overlap(&a, &b));
        assert!(!is_within_reach(&a, &b));
    }

    #[test]
    fn test_within_reach_is_strict() {
        let a = bbox(0.0, 0.0, 1.0, 1.0);
        let touching = bbox(1.0, 0.0, 1.0, 1.0);
        let inside = bbox(0.9, 0.0, 1.0, 1.0);
        assert!(!is_within_reach(&a, &touching));
        assert!(is_within_reach(&a, &inside));
    }
}
