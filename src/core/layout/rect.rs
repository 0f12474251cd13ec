use serde::{Deserialize, Serialize};

/// An immutable snapshot of an element's box in document coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct LayoutRect {
    pub left: f64,
    pub top: f64,
    pub width: f64,
    pub height: f64,
}

pub fn layout_rect_ltwh(left: f64, top: f64, width: f64, height: f64) -> LayoutRect {
    LayoutRect {
        left,
        top,
        width,
        height,
    }
}

impl LayoutRect {
    pub const ZERO: LayoutRect = LayoutRect {
        left: 0.0,
        top: 0.0,
        width: 0.0,
        height: 0.0,
    };

    pub fn right(&self) -> f64 {
        self.left + self.width
    }

    pub fn bottom(&self) -> f64 {
        self.top + self.height
    }

    pub fn moved(&self, dx: f64, dy: f64) -> Self {
        layout_rect_ltwh(self.left + dx, self.top + dy, self.width, self.height)
    }

    pub fn with_size(&self, width: f64, height: f64) -> Self {
        layout_rect_ltwh(self.left, self.top, width, height)
    }

    pub fn size_equals(&self, other: &LayoutRect) -> bool {
        self.width == other.width && self.height == other.height
    }

    pub fn has_area(&self) -> bool {
        self.width > 0.0 && self.height > 0.0
    }

    /// Edges that touch count as overlapping.
    pub fn overlaps(&self, other: &LayoutRect) -> bool {
        self.top <= other.bottom()
            && other.top <= self.bottom()
            && self.left <= other.right()
            && other.left <= self.right()
    }
}

/// Margins passed along with a size change. `None` leaves a side untouched.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Margins {
    pub top: Option<f64>,
    pub right: Option<f64>,
    pub bottom: Option<f64>,
    pub left: Option<f64>,
}

impl Margins {
    pub fn new(top: f64, right: f64, bottom: f64, left: f64) -> Self {
        Self {
            top: Some(top),
            right: Some(right),
            bottom: Some(bottom),
            left: Some(left),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_edges() {
        let rect = layout_rect_ltwh(11.0, 12.0, 111.0, 222.0);
        assert_eq!(rect.right(), 122.0);
        assert_eq!(rect.bottom(), 234.0);
        assert_eq!(rect.moved(0.0, 10.0).top, 22.0);
    }

    #[test]
    fn test_value_equality() {
        let a = layout_rect_ltwh(0.0, 0.0, 10.0, 10.0);
        let b = layout_rect_ltwh(0.0, 0.0, 10.0, 10.0);
        assert_eq!(a, b);
        assert_ne!(a, a.moved(1.0, 0.0));
        assert!(a.size_equals(&a.moved(5.0, 5.0)));
    }

    #[test]
    fn test_overlap() {
        let viewport = layout_rect_ltwh(0.0, 0.0, 100.0, 100.0);
        assert!(viewport.overlaps(&layout_rect_ltwh(-50.0, -50.0, 100.0, 100.0)));
        assert!(viewport.overlaps(&layout_rect_ltwh(0.0, 100.0, 10.0, 10.0)));
        assert!(!viewport.overlaps(&layout_rect_ltwh(0.0, 110.0, 100.0, 100.0)));
        assert!(!viewport.overlaps(&layout_rect_ltwh(200.0, 0.0, 100.0, 100.0)));
    }

    #[test]
    fn test_area() {
        assert!(!LayoutRect::ZERO.has_area());
        assert!(!layout_rect_ltwh(0.0, 0.0, 10.0, 0.0).has_area());
        assert!(layout_rect_ltwh(0.0, 0.0, 1.0, 1.0).has_area());
    }
}
