use crate::domain::project::ProjectBinding;
use crate::error::{PaymentError, Result};
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Reads project webhook bindings from a CSV source.
///
/// Expected header: `webhook_key, org_id, project_id, provider, signing_secret`.
/// Whitespace around fields is trimmed.
pub struct ProjectReader<R: Read> {
    reader: csv::Reader<R>,
}

impl<R: Read> ProjectReader<R> {
    pub fn new(source: R) -> Self {
        let reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(source);
        Self { reader }
    }

    /// Lazily deserializes one binding per row.
    pub fn bindings(self) -> impl Iterator<Item = Result<ProjectBinding>> {
        self.reader
            .into_deserialize()
            .map(|result| result.map_err(PaymentError::from))
    }
}

/// Loads every binding in `path`, failing on the first bad row.
pub fn load_projects(path: impl AsRef<Path>) -> Result<Vec<ProjectBinding>> {
    let file = File::open(path)?;
    ProjectReader::new(file).bindings().collect()
}
