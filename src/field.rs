/// A square 2D grid of per-cell values with closed boundaries.
///
/// Cells outside the grid do not exist: neighbor lookups near an edge
/// return fewer directions and interpolated sampling clamps to the rim.
#[derive(Clone, PartialEq)]
pub struct Field<T> {
    pub size: usize,
    data: Vec<T>,
}

/// Direction indices for the four axis-aligned neighbors.
/// Order: left, right, up, down. `d ^ 1` is the opposite direction.
pub const DIR_LEFT: usize = 0;
pub const DIR_RIGHT: usize = 1;
pub const DIR_UP: usize = 2;
pub const DIR_DOWN: usize = 3;

/// Offsets (dx, dy) matching the direction indices above.
pub const DIR_OFFSETS: [(i32, i32); 4] = [(-1, 0), (1, 0), (0, -1), (0, 1)];

/// The direction pointing back at the cell a flow came from.
#[inline]
pub fn opposite(dir: usize) -> usize {
    dir ^ 1
}

impl<T: Clone> Field<T> {
    pub fn new_with(size: usize, value: T) -> Self {
        Self {
            size,
            data: vec![value; size * size],
        }
    }

    #[inline]
    fn index(&self, x: usize, y: usize) -> usize {
        debug_assert!(x < self.size && y < self.size);
        y * self.size + x
    }

    #[inline]
    pub fn get(&self, x: usize, y: usize) -> &T {
        &self.data[self.index(x, y)]
    }

    #[inline]
    pub fn set(&mut self, x: usize, y: usize, value: T) {
        let idx = self.index(x, y);
        self.data[idx] = value;
    }

    pub fn fill(&mut self, value: T) {
        self.data.fill(value);
    }

    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.data
    }

    /// Overwrite this field's contents from another of the same size.
    pub fn copy_from(&mut self, other: &Field<T>) {
        debug_assert_eq!(self.size, other.size);
        self.data.clone_from_slice(&other.data);
    }

    /// Iterate over all cells with their coordinates.
    pub fn iter(&self) -> impl Iterator<Item = (usize, usize, &T)> {
        let size = self.size;
        self.data.iter().enumerate().map(move |(idx, val)| {
            let x = idx % size;
            let y = idx / size;
            (x, y, val)
        })
    }

    /// The neighbor one step in `dir`, or `None` when that step leaves the grid.
    #[inline]
    pub fn neighbor(&self, x: usize, y: usize, dir: usize) -> Option<(usize, usize)> {
        let (dx, dy) = DIR_OFFSETS[dir];
        let nx = x as i32 + dx;
        let ny = y as i32 + dy;
        if nx < 0 || ny < 0 || nx >= self.size as i32 || ny >= self.size as i32 {
            None
        } else {
            Some((nx as usize, ny as usize))
        }
    }
}

impl Field<f32> {
    /// Sample at fractional coordinates using bilinear interpolation.
    /// Coordinates beyond the rim clamp to the nearest edge cell.
    pub fn sample_bilinear(&self, x: f32, y: f32) -> f32 {
        let max = (self.size - 1) as f32;
        let x = x.clamp(0.0, max);
        let y = y.clamp(0.0, max);

        let x0 = x.floor() as usize;
        let y0 = y.floor() as usize;
        let x1 = (x0 + 1).min(self.size - 1);
        let y1 = (y0 + 1).min(self.size - 1);

        let fx = x.fract();
        let fy = y.fract();

        let v00 = *self.get(x0, y0);
        let v10 = *self.get(x1, y0);
        let v01 = *self.get(x0, y1);
        let v11 = *self.get(x1, y1);

        let v0 = v00 * (1.0 - fx) + v10 * fx;
        let v1 = v01 * (1.0 - fx) + v11 * fx;
        v0 * (1.0 - fy) + v1 * fy
    }

    /// Central-difference gradient at a cell, one-sided at the rim.
    /// Returns (dh/dx, dh/dy) in value units per cell.
    pub fn gradient_at_cell(&self, x: usize, y: usize) -> (f32, f32) {
        let size = self.size;

        let grad_x = if size == 1 {
            0.0
        } else if x == 0 {
            *self.get(1, y) - *self.get(0, y)
        } else if x == size - 1 {
            *self.get(x, y) - *self.get(x - 1, y)
        } else {
            (*self.get(x + 1, y) - *self.get(x - 1, y)) / 2.0
        };

        let grad_y = if size == 1 {
            0.0
        } else if y == 0 {
            *self.get(x, 1) - *self.get(x, 0)
        } else if y == size - 1 {
            *self.get(x, y) - *self.get(x, y - 1)
        } else {
            (*self.get(x, y + 1) - *self.get(x, y - 1)) / 2.0
        };

        (grad_x, grad_y)
    }
}
