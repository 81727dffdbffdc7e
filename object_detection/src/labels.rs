use crate::config::{LabelsConfig, Validatable};
use std::{
    fs::File,
    io::{self, BufRead},
    path::Path,
};

/// Class names indexed by the model's class id.
#[derive(Debug, Clone, Default)]
pub struct Labels {
    class_labels: Vec<String>,
}

impl Labels {
    pub fn new(class_labels: Vec<String>) -> Self {
        Self { class_labels }
    }

    pub fn load(labels_cfg: &LabelsConfig) -> io::Result<Self> {
        load_labels(&labels_cfg.get_path())
    }

    pub fn get(&self, class_id: usize) -> String {
        match self.class_labels.get(class_id) {
            Some(label) => label.clone(),
            None => format!("Unknown class {}", class_id),
        }
    }

    pub fn len(&self) -> usize {
        self.class_labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.class_labels.is_empty()
    }
}

pub fn load_labels(filepath: &Path) -> io::Result<Labels> {
    let file = File::open(filepath)?;
    parse_labels(io::BufReader::new(file))
}

/// One label per line. Blank lines and `#` comments are skipped.
pub fn parse_labels(reader: impl BufRead) -> io::Result<Labels> {
    let mut class_labels = Vec::new();

    for line_result in reader.lines() {
        let line = line_result?;
        let label = line.trim();
        if label.is_empty() || label.starts_with('#') {
            continue;
        }
        class_labels.push(label.to_string());
    }

    if class_labels.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "Labels file contains no labels",
        ));
    }

    Ok(Labels::new(class_labels))
}
