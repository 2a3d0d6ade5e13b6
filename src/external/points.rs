use std::{collections::HashMap, path::Path};

use crate::{
    engine::{distribution::Distribution, units::Units},
    error::{DataError, VeldResult},
    external::{DataRequest, ExternalLayer},
};

#[derive(Debug)]
struct PointRecord {
    lat: f64,
    lon: f64,
    timestep: u64,
    values: HashMap<String, f64>,
}

/// Point observations loaded from CSV.
///
/// Expected columns: `lat`, `lon`, optional `timestep` (default 0), and one
/// column per variable. Units per variable are declared by the caller;
/// undeclared variables are dimensionless.
#[derive(Debug)]
pub struct CsvPoints {
    records: Vec<PointRecord>,
    units: HashMap<String, Units>,
}

impl CsvPoints {
    pub fn read(path: &Path) -> VeldResult<Self> {
        let mut reader = csv::Reader::from_path(path)
            .map_err(|e| DataError::Points(format!("{}: {e}", path.display())))?;
        let headers: Vec<String> = reader
            .headers()
            .map_err(|e| DataError::Points(e.to_string()))?
            .iter()
            .map(|h| h.trim().to_string())
            .collect();

        let lat_idx = column(&headers, "lat")?;
        let lon_idx = column(&headers, "lon")?;
        let timestep_idx = headers.iter().position(|h| h == "timestep");

        let mut records = Vec::new();
        for row in reader.records() {
            let row = row.map_err(|e| DataError::Points(e.to_string()))?;
            let mut values = HashMap::new();
            for (idx, header) in headers.iter().enumerate() {
                if idx == lat_idx || idx == lon_idx || Some(idx) == timestep_idx {
                    continue;
                }
                if let Some(cell) = row.get(idx)
                    && !cell.trim().is_empty()
                {
                    values.insert(header.clone(), parse_number(cell)?);
                }
            }
            records.push(PointRecord {
                lat: parse_number(row.get(lat_idx).unwrap_or_default())?,
                lon: parse_number(row.get(lon_idx).unwrap_or_default())?,
                timestep: timestep_idx
                    .and_then(|idx| row.get(idx))
                    .map(|c| parse_number(c).map(|v| v as u64))
                    .transpose()?
                    .unwrap_or(0),
                values,
            });
        }

        Ok(Self {
            records,
            units: HashMap::new(),
        })
    }

    /// Declares the units a variable column carries.
    pub fn with_units(mut self, variable: &str, units: Units) -> Self {
        self.units.insert(variable.to_string(), units);
        self
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

fn column(headers: &[String], name: &str) -> VeldResult<usize> {
    headers
        .iter()
        .position(|h| h == name)
        .ok_or_else(|| DataError::Points(format!("missing required column '{name}'")).into())
}

fn parse_number(cell: &str) -> VeldResult<f64> {
    cell.trim()
        .parse()
        .map_err(|_| DataError::Points(format!("not a number: '{cell}'")).into())
}

impl ExternalLayer for CsvPoints {
    fn fulfill(&self, request: &DataRequest) -> VeldResult<Distribution> {
        let units = self
            .units
            .get(&request.variable)
            .cloned()
            .unwrap_or_else(Units::empty);

        let mut samples: Vec<f64> = self
            .records
            .iter()
            .filter(|r| r.timestep == request.timestep)
            .filter(|r| request.geometry.contains(r.lat, r.lon))
            .filter_map(|r| r.values.get(&request.variable).copied())
            .collect();

        if samples.is_empty() {
            samples.push(request.default_value);
        }
        Ok(Distribution::realized_f64(samples, units))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::geom::Geometry;
    use std::io::Write;

    fn sample_csv() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let mut file = std::fs::File::create(dir.path().join("points.csv")).unwrap();
        writeln!(file, "lat,lon,timestep,temp,ndvi").unwrap();
        writeln!(file, "1.0,1.0,0,20.5,0.8").unwrap();
        writeln!(file, "1.5,1.5,0,21.0,0.7").unwrap();
        writeln!(file, "9.0,9.0,0,30.0,0.2").unwrap();
        writeln!(file, "1.0,1.0,1,18.0,").unwrap();
        dir
    }

    #[test]
    fn test_reads_and_filters_by_geometry_and_timestep() {
        let dir = sample_csv();
        let points = CsvPoints::read(&dir.path().join("points.csv")).unwrap();
        assert_eq!(points.len(), 4);

        let request = DataRequest::new(
            "points.csv",
            "temp",
            0,
            Geometry::rect(0.0, 0.0, 2.0, 2.0),
        );
        let dist = points.fulfill(&request).unwrap();
        let samples = dist.samples().unwrap();
        assert_eq!(samples.len(), 2, "two points inside, third excluded");
    }

    #[test]
    fn test_empty_selection_reports_default() {
        let dir = sample_csv();
        let points = CsvPoints::read(&dir.path().join("points.csv")).unwrap();
        let request = DataRequest::new(
            "points.csv",
            "temp",
            7,
            Geometry::rect(0.0, 0.0, 2.0, 2.0),
        )
        .with_default(-273.0);
        let samples_dist = points.fulfill(&request).unwrap();
        let samples = samples_dist.samples().unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].to_f64(), -273.0);
    }

    #[test]
    fn test_missing_required_column_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.csv");
        std::fs::write(&path, "x,y,temp\n1,2,3\n").unwrap();
        assert!(CsvPoints::read(&path).is_err());
    }
}
