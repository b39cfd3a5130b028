//! Schema snapshots, comparison and structural application

pub mod apply;
pub mod collector;
pub mod diff;
pub mod model;
pub mod topology;

pub use apply::apply_differences;
pub use collector::{CollectOptions, PostgresCollector, SchemaCollector};
pub use diff::{
    ColumnChange, ComparisonOptions, DiffAction, DiffSummary, ObjectChanges, SchemaComparator, SchemaDiff,
    SchemaDifference, TableChanges,
};
pub use model::{ObjectDefinition, ObjectType, SchemaDefinition, TableDefinition, TableRef};
pub use topology::dependency_order;
