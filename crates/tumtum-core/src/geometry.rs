use serde::{Deserialize, Serialize};

/// A 2D point in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

impl From<(i32, i32)> for Point {
    fn from((x, y): (i32, i32)) -> Self {
        Self { x, y }
    }
}

/// Axis-aligned rectangle in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl Rect {
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Right edge, widened so coordinates near `i32::MAX` cannot overflow.
    pub fn right(&self) -> i64 {
        i64::from(self.x) + i64::from(self.width)
    }

    pub fn bottom(&self) -> i64 {
        i64::from(self.y) + i64::from(self.height)
    }

    pub fn area(&self) -> i64 {
        i64::from(self.width) * i64::from(self.height)
    }

    /// True if `other` lies fully inside `self`. Shared edges count as inside.
    pub fn contains(&self, other: &Rect) -> bool {
        other.x >= self.x
            && other.y >= self.y
            && other.right() <= self.right()
            && other.bottom() <= self.bottom()
    }

    /// True if `p` lies inside `self`, edges inclusive.
    pub fn contains_point(&self, p: &Point) -> bool {
        let (x, y) = (i64::from(p.x), i64::from(p.y));
        i64::from(self.x) <= x && x <= self.right() && i64::from(self.y) <= y && y <= self.bottom()
    }

    /// True if every point of `points` lies inside `self`.
    ///
    /// An empty slice is never "inside": a missing landmark must not satisfy
    /// a positioning guard.
    pub fn contains_all(&self, points: &[Point]) -> bool {
        !points.is_empty() && points.iter().all(|p| self.contains_point(p))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contained_rect() {
        let outer = Rect::new(0, 0, 20, 20);
        assert!(outer.contains(&Rect::new(10, 10, 5, 5)));
    }

    #[test]
    fn test_rect_exceeding_right_edge() {
        let outer = Rect::new(0, 0, 20, 20);
        assert!(!outer.contains(&Rect::new(18, 10, 5, 5)));
    }

    #[test]
    fn test_rect_exceeding_top_left() {
        let outer = Rect::new(10, 10, 20, 20);
        assert!(!outer.contains(&Rect::new(9, 15, 5, 5)));
        assert!(!outer.contains(&Rect::new(15, 9, 5, 5)));
        assert!(!outer.contains(&Rect::new(15, 26, 5, 5)));
    }

    #[test]
    fn test_identical_rect_is_contained() {
        let r = Rect::new(3, 4, 10, 10);
        assert!(r.contains(&r));
    }

    #[test]
    fn test_point_on_edges_is_inside() {
        let r = Rect::new(150, 150, 40, 40);
        assert!(r.contains_point(&Point::new(150, 150)));
        assert!(r.contains_point(&Point::new(190, 190)));
        assert!(!r.contains_point(&Point::new(191, 170)));
        assert!(!r.contains_point(&Point::new(170, 149)));
    }

    #[test]
    fn test_contains_all_requires_every_point() {
        let r = Rect::new(150, 150, 40, 40);
        let inside = [Point::new(160, 165), Point::new(170, 168), Point::new(180, 166)];
        assert!(r.contains_all(&inside));

        let one_out = [Point::new(160, 165), Point::new(200, 168)];
        assert!(!r.contains_all(&one_out));
    }

    #[test]
    fn test_contains_all_rejects_empty() {
        let r = Rect::new(0, 0, 100, 100);
        assert!(!r.contains_all(&[]));
    }

    #[test]
    fn test_edges_near_i32_max() {
        let outer = Rect::new(i32::MAX - 10, 0, 100, 100);
        assert_eq!(outer.right(), i64::from(i32::MAX) + 90);
        assert!(outer.contains(&Rect::new(i32::MAX - 5, 0, 1, 1)));
        assert!(outer.contains_point(&Point::new(i32::MAX, 50)));

        let wide = Rect::new(0, 0, i32::MAX, i32::MAX);
        assert!(!wide.contains(&Rect::new(i32::MAX, i32::MAX, i32::MAX, 1)));
    }

    #[test]
    fn test_area_does_not_overflow() {
        let r = Rect::new(0, 0, 100_000, 100_000);
        assert_eq!(r.area(), 10_000_000_000);
    }
}
