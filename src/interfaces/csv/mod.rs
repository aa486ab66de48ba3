pub mod project_reader;
