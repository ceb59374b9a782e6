//! Declarative workflow documents: schema, loading and validation.

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{dump, load, parse, Format};
pub use schema::*;
pub use validation::validate;

/// Parse a schema version, accepting the short `MAJOR.MINOR` form.
pub fn parse_schema_version(raw: &str) -> Option<semver::Version> {
    let raw = raw.trim();
    let padded = match raw.matches('.').count() {
        0 => format!("{}.0.0", raw),
        1 => format!("{}.0", raw),
        _ => raw.to_string(),
    };
    semver::Version::parse(&padded).ok()
}
