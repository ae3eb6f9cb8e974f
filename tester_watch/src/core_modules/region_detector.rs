// THEORY:
// The region detector groups the changed pixels of a `ChangeMask` into
// connected regions. A dialog appearing on the tester screen shows up as one
// large contiguous region, while camera sensor noise shows up as many small
// scattered ones, so the area of the largest region is the second half of the
// popup test.
//
// Algorithm:
// 1.  Scan the mask row by row for a changed pixel that has not been visited.
// 2.  Grow a region from it with an explicit stack, following all 8 neighbours
//     (diagonal contact joins regions, as external contour tracing does).
// 3.  Aggregate the region's pixel count and bounding box.
// 4.  Measure the area enclosed by the region's outer boundary: flood the
//     unchanged pixels 4-connected from outside the bounding box, and whatever
//     is not reached belongs to the region. A dialog whose frame changed but
//     whose body matches the old screen still counts with its full size.
//
// The detector is stateless: one mask in, a list of regions out.

use crate::core_modules::frame_diff::ChangeMask;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Point {
    pub x: u32,
    pub y: u32,
}

/// A connected group of changed pixels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangedRegion {
    /// Area enclosed by the region's outer boundary, holes included.
    pub area: usize,
    /// Number of changed pixels in the region.
    pub pixels: usize,
    /// Inclusive top-left and bottom-right corners.
    pub bounding_box: (Point, Point),
}

/// Finds every connected region of changed pixels in the mask.
pub fn find_regions(mask: &ChangeMask) -> Vec<ChangedRegion> {
    let width = mask.width();
    let height = mask.height();
    let mut visited = vec![false; mask.total_pixels()];
    let mut regions = Vec::new();

    for y in 0..height {
        for x in 0..width {
            let index = (y * width + x) as usize;
            if visited[index] || !mask.is_changed(x, y) {
                continue;
            }
            regions.push(grow_region(mask, Point { x, y }, &mut visited));
        }
    }

    regions
}

/// Area of the largest region, or 0 when nothing changed.
pub fn largest_region_area(regions: &[ChangedRegion]) -> usize {
    regions.iter().map(|r| r.area).max().unwrap_or(0)
}

fn grow_region(mask: &ChangeMask, seed: Point, visited: &mut [bool]) -> ChangedRegion {
    let width = mask.width() as i64;
    let height = mask.height() as i64;
    let mut stack = vec![seed];
    visited[(seed.y as i64 * width + seed.x as i64) as usize] = true;

    let mut members = Vec::new();
    let mut min = seed;
    let mut max = seed;

    while let Some(current) = stack.pop() {
        members.push(current);
        min.x = min.x.min(current.x);
        min.y = min.y.min(current.y);
        max.x = max.x.max(current.x);
        max.y = max.y.max(current.y);

        for dy in -1i64..=1 {
            for dx in -1i64..=1 {
                if dx == 0 && dy == 0 {
                    continue;
                }
                let nx = current.x as i64 + dx;
                let ny = current.y as i64 + dy;
                if nx < 0 || ny < 0 || nx >= width || ny >= height {
                    continue;
                }
                let index = (ny * width + nx) as usize;
                if !visited[index] && mask.is_changed(nx as u32, ny as u32) {
                    visited[index] = true;
                    stack.push(Point {
                        x: nx as u32,
                        y: ny as u32,
                    });
                }
            }
        }
    }

    ChangedRegion {
        area: enclosed_area(&members, min, max),
        pixels: members.len(),
        bounding_box: (min, max),
    }
}

/// Pixels inside the outer boundary of `members`, found by flooding the
/// complement from a one-pixel margin around the bounding box.
fn enclosed_area(members: &[Point], min: Point, max: Point) -> usize {
    let width = (max.x - min.x + 3) as usize;
    let height = (max.y - min.y + 3) as usize;
    let mut blocked = vec![false; width * height];
    for p in members {
        blocked[(p.y - min.y + 1) as usize * width + (p.x - min.x + 1) as usize] = true;
    }

    // The margin corner is never part of the region.
    let mut outside = 0usize;
    let mut stack = vec![(0usize, 0usize)];
    blocked[0] = true;
    while let Some((x, y)) = stack.pop() {
        outside += 1;
        let neighbours = [
            (x.wrapping_sub(1), y),
            (x + 1, y),
            (x, y.wrapping_sub(1)),
            (x, y + 1),
        ];
        for (nx, ny) in neighbours {
            if nx >= width || ny >= height {
                continue;
            }
            let index = ny * width + nx;
            if !blocked[index] {
                blocked[index] = true;
                stack.push((nx, ny));
            }
        }
    }

    width * height - outside
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma};

    fn mask_with(width: u32, height: u32, changed: &[(u32, u32)]) -> ChangeMask {
        let reference = GrayImage::new(width, height);
        let mut current = reference.clone();
        for &(x, y) in changed {
            current.put_pixel(x, y, Luma([255]));
        }
        ChangeMask::between(&current, &reference, 10).expect("same size")
    }

    #[test]
    fn separate_blocks_become_separate_regions() {
        let mut changed = Vec::new();
        for y in 0..3 {
            for x in 0..4 {
                changed.push((x, y));
            }
        }
        changed.push((9, 9));
        let mask = mask_with(10, 10, &changed);

        let regions = find_regions(&mask);

        assert_eq!(regions.len(), 2);
        assert_eq!(largest_region_area(&regions), 12);
        assert_eq!(regions[0].bounding_box, (Point { x: 0, y: 0 }, Point { x: 3, y: 2 }));
    }

    #[test]
    fn diagonal_contact_joins_regions() {
        let mask = mask_with(4, 4, &[(0, 0), (1, 1), (2, 2)]);

        let regions = find_regions(&mask);

        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].area, 3);
        assert_eq!(regions[0].pixels, 3);
    }

    #[test]
    fn hollow_outline_encloses_its_interior() {
        let mut changed = Vec::new();
        for i in 10..70 {
            changed.extend([(i, 10), (i, 69), (10, i), (69, i)]);
        }
        let mask = mask_with(100, 100, &changed);

        let regions = find_regions(&mask);

        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].pixels, 236);
        assert_eq!(regions[0].area, 3600);
    }

    #[test]
    fn region_inside_a_ring_is_counted_once_by_the_ring() {
        let mut changed = Vec::new();
        for i in 0..9 {
            changed.extend([(i, 0), (i, 8), (0, i), (8, i)]);
        }
        changed.push((4, 4));
        let mask = mask_with(9, 9, &changed);

        let regions = find_regions(&mask);

        assert_eq!(regions.len(), 2);
        assert_eq!(largest_region_area(&regions), 81);
    }

    #[test]
    fn unchanged_mask_has_no_regions() {
        let mask = mask_with(5, 5, &[]);

        assert!(find_regions(&mask).is_empty());
        assert_eq!(largest_region_area(&[]), 0);
    }
}
