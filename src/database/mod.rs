pub mod document;
pub mod error;
pub mod memory;
pub mod model;
pub mod pipeline;
pub mod pool;
pub mod postgres;
pub mod schema;
pub mod update;

pub use document::Document;
pub use error::StoreError;
pub use memory::MemoryModel;
pub use model::{Model, ModelRef};
pub use pipeline::{Accumulator, Group, GroupKey, Operand, Stage};
pub use postgres::PgModel;
pub use schema::{FieldDef, FieldType, Schema};
pub use update::Update;
