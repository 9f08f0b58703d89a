//! Form types and their canonical, versioned schemas.

pub mod schema;
pub mod types;

pub use schema::{
    ExtractionStrategy, FieldKind, FieldSpec, FormSchema, PlaneLayout, PlaneSpec, SchemaRegistry,
};
pub use types::FormType;
