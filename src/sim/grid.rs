//! Double-buffered field storage for the erosion pipeline.
//!
//! Each per-cell quantity lives in a read/write buffer pair: stages read
//! the frozen read buffer and fill the write buffer, and a commit copies
//! the write buffer back once the stage has finished for every cell. No
//! stage ever observes another cell's in-progress write.

use crate::field::Field;
use crate::sim::error::SimulationError;

/// One double-buffered field. `read` is the authoritative state at stage
/// start; `write` receives the stage's output.
pub struct FieldPair<T> {
    read: Field<T>,
    write: Field<T>,
}

impl<T: Clone> FieldPair<T> {
    fn new_with(size: usize, value: T) -> Self {
        Self {
            read: Field::new_with(size, value.clone()),
            write: Field::new_with(size, value),
        }
    }

    pub fn read(&self) -> &Field<T> {
        &self.read
    }

    /// Split borrow for a stage over this field: the frozen read buffer
    /// plus the write buffer it fills.
    pub fn rw(&mut self) -> (&Field<T>, &mut Field<T>) {
        (&self.read, &mut self.write)
    }

    /// Copy the write buffer into the read buffer. Called once per written
    /// field at each stage boundary.
    pub fn commit(&mut self) {
        self.read.copy_from(&self.write);
    }

    fn fill_both(&mut self, value: T) {
        self.read.fill(value.clone());
        self.write.fill(value);
    }
}

/// Names the five per-cell fields for commit calls.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldId {
    Height,
    Water,
    Sediment,
    Outflow,
    Velocity,
}

/// Owns every per-cell field buffer of the simulation.
///
/// Exclusively held by the simulator; external readers only ever see the
/// read buffers through immutable views. Buffers are freed on drop.
pub struct SimulationGrid {
    pub(crate) size: usize,
    pub(crate) height: FieldPair<f32>,
    pub(crate) water: FieldPair<f32>,
    pub(crate) sediment: FieldPair<f32>,
    pub(crate) outflow: FieldPair<[f32; 4]>,
    pub(crate) velocity: FieldPair<[f32; 2]>,
}

impl SimulationGrid {
    /// Create read/write buffer pairs for all five fields.
    pub fn allocate(size: usize) -> Result<Self, SimulationError> {
        if size == 0 {
            return Err(SimulationError::InvalidSize(size));
        }
        Ok(Self {
            size,
            height: FieldPair::new_with(size, 0.0),
            water: FieldPair::new_with(size, 0.0),
            sediment: FieldPair::new_with(size, 0.0),
            outflow: FieldPair::new_with(size, [0.0; 4]),
            velocity: FieldPair::new_with(size, [0.0; 2]),
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Copy the source elevation field into the height read buffer.
    pub fn seed_height(&mut self, source: &Field<f32>) -> Result<(), SimulationError> {
        if source.size != self.size {
            return Err(SimulationError::InvalidHeightmap(format!(
                "source is {0}x{0}, grid is {1}x{1}",
                source.size, self.size
            )));
        }
        self.height.write.copy_from(source);
        self.height.commit();
        Ok(())
    }

    /// Zero water, sediment, outflow and velocity in both buffers.
    /// Height is left untouched.
    pub fn reset_dynamic_fields(&mut self) {
        self.water.fill_both(0.0);
        self.sediment.fill_both(0.0);
        self.outflow.fill_both([0.0; 4]);
        self.velocity.fill_both([0.0; 2]);
    }

    /// Commit one field's write buffer into its read buffer.
    pub fn commit(&mut self, field: FieldId) {
        match field {
            FieldId::Height => self.height.commit(),
            FieldId::Water => self.water.commit(),
            FieldId::Sediment => self.sediment.commit(),
            FieldId::Outflow => self.outflow.commit(),
            FieldId::Velocity => self.velocity.commit(),
        }
    }

    pub fn height(&self) -> &Field<f32> {
        self.height.read()
    }

    pub fn water(&self) -> &Field<f32> {
        self.water.read()
    }

    pub fn sediment(&self) -> &Field<f32> {
        self.sediment.read()
    }

    pub fn outflow(&self) -> &Field<[f32; 4]> {
        self.outflow.read()
    }

    pub fn velocity(&self) -> &Field<[f32; 2]> {
        self.velocity.read()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_rejects_zero_size() {
        assert!(matches!(
            SimulationGrid::allocate(0),
            Err(SimulationError::InvalidSize(0))
        ));
    }

    #[test]
    fn test_seed_height_rejects_mismatch() {
        let mut grid = SimulationGrid::allocate(4).unwrap();
        let source = Field::new_with(5, 0.5f32);
        assert!(matches!(
            grid.seed_height(&source),
            Err(SimulationError::InvalidHeightmap(_))
        ));
    }

    #[test]
    fn test_seed_height_fills_read_buffer() {
        let mut grid = SimulationGrid::allocate(3).unwrap();
        let mut source = Field::new_with(3, 0.25f32);
        source.set(1, 2, 0.75);
        grid.seed_height(&source).unwrap();
        assert_eq!(*grid.height().get(1, 2), 0.75);
        assert_eq!(*grid.height().get(0, 0), 0.25);
    }

    #[test]
    fn test_reset_leaves_height() {
        let mut grid = SimulationGrid::allocate(3).unwrap();
        let source = Field::new_with(3, 0.6f32);
        grid.seed_height(&source).unwrap();

        let (_, water_w) = grid.water.rw();
        water_w.fill(1.0);
        grid.commit(FieldId::Water);
        assert_eq!(*grid.water().get(0, 0), 1.0);

        grid.reset_dynamic_fields();
        assert_eq!(*grid.water().get(0, 0), 0.0);
        assert_eq!(*grid.sediment().get(2, 2), 0.0);
        assert_eq!(*grid.outflow().get(1, 1), [0.0; 4]);
        assert_eq!(*grid.height().get(1, 1), 0.6);
    }

    #[test]
    fn test_commit_copies_write_into_read() {
        let mut grid = SimulationGrid::allocate(2).unwrap();
        {
            let (_, write) = grid.sediment.rw();
            write.set(1, 0, 0.9);
        }
        // Not yet visible through the read buffer.
        assert_eq!(*grid.sediment().get(1, 0), 0.0);
        grid.commit(FieldId::Sediment);
        assert_eq!(*grid.sediment().get(1, 0), 0.9);
    }
}
