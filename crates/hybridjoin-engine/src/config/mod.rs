//! Pipeline YAML configuration: types, parsing, and validation.

pub mod parser;
pub mod types;
pub mod validator;
