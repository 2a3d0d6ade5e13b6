use ndarray::Array3;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::{
    engine::{distribution::Distribution, units::Units},
    error::{DataError, IoError, VeldResult},
    external::{DataRequest, ExternalLayer},
};

/// On-disk form of a binary data grid (`.jshd`): postcard-encoded, one
/// flattened value block per variable.
#[derive(Debug, Serialize, Deserialize)]
struct GridFile {
    /// RFC 3339 timestamp of the preprocess run that produced the file.
    created_at: String,
    variables: Vec<String>,
    units: Vec<String>,
    min_lat: f64,
    min_lon: f64,
    cell_size: f64,
    timesteps: usize,
    rows: usize,
    cols: usize,
    values: Vec<Vec<f64>>,
}

/// A preprocessed data grid supporting lookup by (variable, timestep,
/// grid-x, grid-y). Produced by `preprocess`, consumed by `run`.
#[derive(Debug)]
pub struct DataGrid {
    variables: Vec<String>,
    units: Vec<Units>,
    min_lat: f64,
    min_lon: f64,
    cell_size: f64,
    // Indexed [timestep, row (y), col (x)] per variable.
    grids: Vec<Array3<f64>>,
}

impl DataGrid {
    pub fn read(path: &Path) -> VeldResult<Self> {
        let bytes = std::fs::read(path)?;
        let file: GridFile =
            postcard::from_bytes(&bytes).map_err(|e| IoError::Decode(e.to_string()))?;
        Self::from_file(file)
    }

    pub fn write(&self, path: &Path) -> VeldResult<()> {
        let file = GridFile {
            created_at: chrono::Utc::now().to_rfc3339(),
            variables: self.variables.clone(),
            units: self.units.iter().map(|u| u.canonical().to_string()).collect(),
            min_lat: self.min_lat,
            min_lon: self.min_lon,
            cell_size: self.cell_size,
            timesteps: self.timesteps(),
            rows: self.rows(),
            cols: self.cols(),
            values: self
                .grids
                .iter()
                .map(|g| g.iter().copied().collect())
                .collect(),
        };
        let bytes = postcard::to_stdvec(&file).map_err(|e| IoError::Encode(e.to_string()))?;
        std::fs::write(path, bytes)?;
        Ok(())
    }

    fn from_file(file: GridFile) -> VeldResult<Self> {
        if file.variables.len() != file.values.len() || file.variables.len() != file.units.len() {
            return Err(DataError::Grid(format!(
                "{} variables but {} value blocks",
                file.variables.len(),
                file.values.len()
            ))
            .into());
        }
        let shape = (file.timesteps, file.rows, file.cols);
        let mut grids = Vec::with_capacity(file.values.len());
        for block in file.values {
            let grid = Array3::from_shape_vec(shape, block)
                .map_err(|e| DataError::Grid(e.to_string()))?;
            grids.push(grid);
        }
        let units = file
            .units
            .iter()
            .map(|u| Units::of(u))
            .collect::<VeldResult<Vec<_>>>()?;
        Ok(Self {
            variables: file.variables,
            units,
            min_lat: file.min_lat,
            min_lon: file.min_lon,
            cell_size: file.cell_size,
            grids,
        })
    }

    pub fn variables(&self) -> &[String] {
        &self.variables
    }

    pub fn timesteps(&self) -> usize {
        self.grids.first().map(|g| g.shape()[0]).unwrap_or(0)
    }

    pub fn rows(&self) -> usize {
        self.grids.first().map(|g| g.shape()[1]).unwrap_or(0)
    }

    pub fn cols(&self) -> usize {
        self.grids.first().map(|g| g.shape()[2]).unwrap_or(0)
    }

    fn variable_index(&self, variable: &str, source: &str) -> VeldResult<usize> {
        self.variables
            .iter()
            .position(|v| v == variable)
            .ok_or_else(|| {
                DataError::VariableNotFound {
                    source_name: source.to_string(),
                    variable: variable.to_string(),
                }
                .into()
            })
    }

    /// Value at a grid coordinate. Out-of-bounds coordinates are an error
    /// (`inspect_jshd` reports them with a non-zero exit).
    pub fn lookup(&self, variable: &str, timestep: usize, x: usize, y: usize) -> VeldResult<f64> {
        let index = self.variable_index(variable, "grid")?;
        self.grids[index]
            .get((timestep, y, x))
            .copied()
            .ok_or_else(|| {
                DataError::OutOfBounds(format!(
                    "({x}, {y}) at t={timestep} outside {}x{}x{}",
                    self.cols(),
                    self.rows(),
                    self.timesteps()
                ))
                .into()
            })
    }

    /// Geographic lookup; `None` outside the grid extent.
    pub fn value_at(&self, variable: &str, timestep: usize, lat: f64, lon: f64) -> VeldResult<Option<f64>> {
        let index = self.variable_index(variable, "grid")?;
        if lat < self.min_lat || lon < self.min_lon {
            return Ok(None);
        }
        let y = ((lat - self.min_lat) / self.cell_size) as usize;
        let x = ((lon - self.min_lon) / self.cell_size) as usize;
        Ok(self.grids[index].get((timestep, y, x)).copied())
    }

    fn units_for(&self, index: usize) -> Units {
        self.units.get(index).cloned().unwrap_or_else(Units::empty)
    }
}

impl ExternalLayer for DataGrid {
    fn fulfill(&self, request: &DataRequest) -> VeldResult<Distribution> {
        let index = self.variable_index(&request.variable, &request.source)?;
        if request.timestep >= self.timesteps() as u64 {
            return Err(DataError::OutOfBounds(format!(
                "timestep {} outside 0..{}",
                request.timestep,
                self.timesteps()
            ))
            .into());
        }

        // Sample every cell whose center falls inside the request geometry;
        // an empty intersection reports the caller's default value.
        let mut samples = Vec::new();
        for y in 0..self.rows() {
            for x in 0..self.cols() {
                let lat = self.min_lat + (y as f64 + 0.5) * self.cell_size;
                let lon = self.min_lon + (x as f64 + 0.5) * self.cell_size;
                if request.geometry.contains(lat, lon) {
                    samples.push(self.grids[index][(request.timestep as usize, y, x)]);
                }
            }
        }
        if samples.is_empty() {
            samples.push(request.default_value);
        }
        Ok(Distribution::realized_f64(samples, self.units_for(index)))
    }
}

/// Accumulates values during `preprocess`.
#[derive(Debug)]
pub struct DataGridBuilder {
    variables: Vec<String>,
    units: Vec<Units>,
    min_lat: f64,
    min_lon: f64,
    cell_size: f64,
    timesteps: usize,
    rows: usize,
    cols: usize,
    fill: f64,
    grids: Vec<Array3<f64>>,
}

impl DataGridBuilder {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        min_lat: f64,
        min_lon: f64,
        cell_size: f64,
        timesteps: usize,
        rows: usize,
        cols: usize,
        fill: f64,
    ) -> Self {
        Self {
            variables: Vec::new(),
            units: Vec::new(),
            min_lat,
            min_lon,
            cell_size,
            timesteps,
            rows,
            cols,
            fill,
            grids: Vec::new(),
        }
    }

    pub fn variable(&mut self, name: &str, units: Units) -> usize {
        self.variables.push(name.to_string());
        self.units.push(units);
        self.grids.push(Array3::from_elem(
            (self.timesteps, self.rows, self.cols),
            self.fill,
        ));
        self.variables.len() - 1
    }

    pub fn set(&mut self, variable: usize, timestep: usize, x: usize, y: usize, value: f64) -> VeldResult<()> {
        let grid = self
            .grids
            .get_mut(variable)
            .ok_or_else(|| DataError::Grid(format!("no variable at index {variable}")))?;
        match grid.get_mut((timestep, y, x)) {
            Some(cell) => {
                *cell = value;
                Ok(())
            }
            None => Err(DataError::OutOfBounds(format!("({x}, {y}) at t={timestep}")).into()),
        }
    }

    pub fn build(self) -> DataGrid {
        DataGrid {
            variables: self.variables,
            units: self.units,
            min_lat: self.min_lat,
            min_lon: self.min_lon,
            cell_size: self.cell_size,
            grids: self.grids,
        }
    }
}
