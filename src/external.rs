pub mod cache;
pub mod grid;
pub mod points;
pub mod priming;

use crate::{engine::distribution::Distribution, error::VeldResult, geom::Geometry};

/// A request for external geospatial values: a source, a variable, the
/// timestep, and the target geometry. The optional priming geometry is
/// injected by the priming decorator and keys the cache decorator.
#[derive(Debug, Clone)]
pub struct DataRequest {
    pub source: String,
    pub variable: String,
    pub timestep: u64,
    pub geometry: Geometry,
    pub priming: Option<Geometry>,
    /// Value reported for locations outside the data extent. Never a
    /// silent zero.
    pub default_value: f64,
}

impl DataRequest {
    pub fn new(source: &str, variable: &str, timestep: u64, geometry: Geometry) -> Self {
        Self {
            source: source.to_string(),
            variable: variable.to_string(),
            timestep,
            geometry,
            priming: None,
            default_value: f64::NAN,
        }
    }

    pub fn with_default(mut self, default_value: f64) -> Self {
        self.default_value = default_value;
        self
    }

    pub fn with_priming(mut self, priming: Geometry) -> Self {
        self.priming = Some(priming);
        self
    }

    /// Cache key fragment for the priming geometry; `None` when the request
    /// is unprimed.
    pub(crate) fn priming_key(&self) -> Option<String> {
        self.priming.as_ref().map(|g| format!("{g:?}"))
    }
}

/// Uniform geospatial value lookup. Implementations wrap raster readers;
/// the shipped ones are the binary data grid and CSV points. GeoTIFF and
/// NetCDF readers are external collaborators implementing the same trait.
pub trait ExternalLayer: Send + Sync {
    /// Resolves a request to a realized distribution of the values under
    /// the request geometry.
    fn fulfill(&self, request: &DataRequest) -> VeldResult<Distribution>;
}
