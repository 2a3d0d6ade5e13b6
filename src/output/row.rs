use crate::sim::{Replicate, StepCount};

/// One export row: an entity's exported attribute values at the end of a
/// timestep. The last two columns are always `step` and `replicate`.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportRow {
    /// Globally unique entity display name (`Type@lat,lon#seq`).
    pub entity: String,
    pub type_name: String,
    pub step: StepCount,
    pub replicate: Replicate,
    /// Attribute name and rendered value, in export-column order. Unset
    /// attributes render as empty cells.
    pub cells: Vec<(String, String)>,
}

impl ExportRow {
    /// Header cells for this row's shape: `entity`, the attribute columns,
    /// then `step` and `replicate`.
    pub fn header(&self) -> Vec<String> {
        let mut header = Vec::with_capacity(self.cells.len() + 3);
        header.push("entity".to_string());
        header.extend(self.cells.iter().map(|(name, _)| name.clone()));
        header.push("step".to_string());
        header.push("replicate".to_string());
        header
    }

    /// Data cells in header order.
    pub fn record(&self) -> Vec<String> {
        let mut record = Vec::with_capacity(self.cells.len() + 3);
        record.push(self.entity.clone());
        record.extend(self.cells.iter().map(|(_, value)| value.clone()));
        record.push(self.step.0.to_string());
        record.push(self.replicate.0.to_string());
        record
    }

    /// Fetches a cell by attribute name.
    pub fn cell(&self, name: &str) -> Option<&str> {
        self.cells
            .iter()
            .find(|(cell_name, _)| cell_name == name)
            .map(|(_, value)| value.as_str())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn row() -> ExportRow {
        ExportRow {
            entity: "Tree@0,0#3".to_string(),
            type_name: "Tree".to_string(),
            step: StepCount(4),
            replicate: Replicate(1),
            cells: vec![
                ("age".to_string(), "4".to_string()),
                ("height".to_string(), String::new()),
            ],
        }
    }

    #[test]
    fn test_step_and_replicate_are_last_columns() {
        let header = row().header();
        assert_eq!(header.last().unwrap(), "replicate");
        assert_eq!(header[header.len() - 2], "step");
    }

    #[test]
    fn test_record_matches_header_arity() {
        let r = row();
        assert_eq!(r.header().len(), r.record().len());
        assert_eq!(r.cell("age"), Some("4"));
        assert_eq!(r.cell("height"), Some(""));
        assert_eq!(r.cell("missing"), None);
    }
}
