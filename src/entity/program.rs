use std::{collections::HashMap, sync::Arc};

use crate::{
    engine::{convert::{Converter, ConverterBuilder}, value::EngineValue},
    entity::{EntityKind, prototype::EntityPrototype},
    error::{EngineError, ProgramError, VeldResult},
    geom::{GeoKey, Geometry, Lat, Lon},
};

/// The patch grid extent: a rectangle of square cells in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridSpec {
    pub min_lat: f64,
    pub min_lon: f64,
    pub max_lat: f64,
    pub max_lon: f64,
    pub cell_size: f64,
}

impl GridSpec {
    /// A single-cell grid, the smallest useful simulation surface.
    pub fn single_cell() -> Self {
        Self {
            min_lat: 0.0,
            min_lon: 0.0,
            max_lat: 1.0,
            max_lon: 1.0,
            cell_size: 1.0,
        }
    }

    fn validate(&self) -> VeldResult<()> {
        if self.cell_size <= 0.0 {
            return Err(
                ProgramError::InvalidGrid(format!("cell size {} must be positive", self.cell_size))
                    .into(),
            );
        }
        if self.max_lat <= self.min_lat || self.max_lon <= self.min_lon {
            return Err(ProgramError::InvalidGrid(format!(
                "extent ({}, {}) to ({}, {}) is empty",
                self.min_lat, self.min_lon, self.max_lat, self.max_lon
            ))
            .into());
        }
        Ok(())
    }

    /// Cell identities and extents, row-major from the minimum corner.
    pub fn cells(&self) -> Vec<(GeoKey, Geometry)> {
        let rows = ((self.max_lat - self.min_lat) / self.cell_size).ceil() as usize;
        let cols = ((self.max_lon - self.min_lon) / self.cell_size).ceil() as usize;

        let mut cells = Vec::with_capacity(rows * cols);
        for row in 0..rows {
            for col in 0..cols {
                let lat = self.min_lat + row as f64 * self.cell_size;
                let lon = self.min_lon + col as f64 * self.cell_size;
                let geometry = Geometry::rect(
                    lat,
                    lon,
                    (lat + self.cell_size).min(self.max_lat),
                    (lon + self.cell_size).min(self.max_lon),
                );
                cells.push((GeoKey::new(Lat(lat), Lon(lon), 0), geometry));
            }
        }
        cells
    }
}

/// A config variable the program reads, surfaced by `discover_config`.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredConfigVar {
    pub name: String,
    pub default_value: Option<String>,
}

impl std::fmt::Display for DiscoveredConfigVar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.default_value {
            Some(default) => write!(f, "{}({})", self.name, default),
            None => write!(f, "{}", self.name),
        }
    }
}

/// The built, immutable program: the conversion graph, the prototype store,
/// the simulation store, the grid, and the export column registry.
pub struct Program {
    converter: Arc<Converter>,
    prototypes: HashMap<Arc<str>, Arc<EntityPrototype>>,
    simulations: HashMap<Arc<str>, Arc<EntityPrototype>>,
    grid: GridSpec,
    exports: HashMap<Arc<str>, Vec<Arc<str>>>,
    config_vars: Vec<DiscoveredConfigVar>,
}

impl Program {
    pub fn converter(&self) -> &Arc<Converter> {
        &self.converter
    }

    pub fn grid(&self) -> GridSpec {
        self.grid
    }

    pub fn prototype(&self, type_name: &str) -> VeldResult<&Arc<EntityPrototype>> {
        self.prototypes
            .get(type_name)
            .ok_or_else(|| EngineError::UnknownEntity(type_name.to_string()).into())
    }

    pub fn simulation(&self, name: &str) -> VeldResult<&Arc<EntityPrototype>> {
        self.simulations
            .get(name)
            .ok_or_else(|| ProgramError::MissingSimulation(name.to_string()).into())
    }

    pub fn simulation_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.simulations.keys().map(|k| k.to_string()).collect();
        names.sort();
        names
    }

    /// The patch prototypes in deterministic order.
    pub fn patch_prototypes(&self) -> Vec<Arc<EntityPrototype>> {
        let mut patches: Vec<_> = self
            .prototypes
            .values()
            .filter(|p| p.kind() == EntityKind::Patch)
            .cloned()
            .collect();
        patches.sort_by(|a, b| a.type_name().cmp(b.type_name()));
        patches
    }

    /// Export columns for a type; `None` exports every attribute.
    pub fn exports_for(&self, type_name: &str) -> Option<&[Arc<str>]> {
        self.exports.get(type_name).map(|cols| cols.as_slice())
    }

    pub fn config_vars(&self) -> &[DiscoveredConfigVar] {
        &self.config_vars
    }
}

impl std::fmt::Debug for Program {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Program({} types, {} simulations)",
            self.prototypes.len(),
            self.simulations.len()
        )
    }
}

/// Accepts the DSL compiler's output and assembles a [`Program`].
/// Building is all-or-nothing.
pub struct ProgramBuilder {
    converter: ConverterBuilder,
    prototypes: Vec<EntityPrototype>,
    simulations: Vec<EntityPrototype>,
    grid: GridSpec,
    exports: HashMap<Arc<str>, Vec<Arc<str>>>,
    config_vars: Vec<DiscoveredConfigVar>,
}

impl Default for ProgramBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgramBuilder {
    pub fn new() -> Self {
        Self {
            converter: ConverterBuilder::new(),
            prototypes: Vec::new(),
            simulations: Vec::new(),
            grid: GridSpec::single_cell(),
            exports: HashMap::new(),
            config_vars: Vec::new(),
        }
    }

    /// Registers a linear unit conversion; the inverse edge is implied.
    pub fn scale_conversion(
        mut self,
        from: &crate::engine::units::Units,
        to: &crate::engine::units::Units,
        factor: f64,
    ) -> Self {
        self.converter = self.converter.scale(from, to, factor);
        self
    }

    /// Registers a one-way conversion backed by a compiled callable.
    pub fn callable_conversion(
        mut self,
        from: &crate::engine::units::Units,
        to: &crate::engine::units::Units,
        transform: Arc<dyn crate::engine::callable::CompiledCallable>,
        exact: bool,
    ) -> Self {
        self.converter = self.converter.callable(from, to, transform, exact);
        self
    }

    pub fn prototype(mut self, prototype: EntityPrototype) -> Self {
        self.prototypes.push(prototype);
        self
    }

    pub fn simulation(mut self, prototype: EntityPrototype) -> Self {
        self.simulations.push(prototype);
        self
    }

    pub fn grid(mut self, grid: GridSpec) -> Self {
        self.grid = grid;
        self
    }

    /// Restricts export rows for a type to the named attributes, in order.
    pub fn export(mut self, type_name: &str, attributes: &[&str]) -> Self {
        self.exports.insert(
            Arc::from(type_name),
            attributes.iter().map(|a| Arc::from(*a)).collect(),
        );
        self
    }

    /// Records a config variable reference for `discover_config`.
    pub fn config_var(mut self, name: &str, default_value: Option<&str>) -> Self {
        self.config_vars.push(DiscoveredConfigVar {
            name: name.to_string(),
            default_value: default_value.map(|d| d.to_string()),
        });
        self
    }

    pub fn build(self) -> VeldResult<Program> {
        self.grid.validate()?;

        let mut prototypes: HashMap<Arc<str>, Arc<EntityPrototype>> = HashMap::new();
        for proto in self.prototypes {
            let name = proto.type_name_arc();
            if prototypes.insert(name.clone(), Arc::new(proto)).is_some() {
                return Err(ProgramError::DuplicateType(name.to_string()).into());
            }
        }

        let mut simulations: HashMap<Arc<str>, Arc<EntityPrototype>> = HashMap::new();
        for proto in self.simulations {
            let name = proto.type_name_arc();
            if prototypes.contains_key(&name)
                || simulations.insert(name.clone(), Arc::new(proto)).is_some()
            {
                return Err(ProgramError::DuplicateType(name.to_string()).into());
            }
        }

        let mut config_vars = self.config_vars;
        config_vars.sort_by(|a, b| a.name.cmp(&b.name));
        config_vars.dedup_by(|a, b| a.name == b.name);

        Ok(Program {
            converter: Arc::new(self.converter.build()),
            prototypes,
            simulations,
            grid: self.grid,
            exports: self.exports,
            config_vars,
        })
    }
}

/// Seed helper shared by builders: an `EngineValue` carrying `value units`.
pub fn seed_value(value: f64, units: &str) -> VeldResult<EngineValue> {
    Ok(EngineValue::decimal(
        value,
        crate::engine::units::Units::of(units)?,
    ))
}
