//! Declarative side of the pipeline: stage and core table descriptors, their dependency
//! ordering, and the compilation of tabular staging files into view DDL.
//!
//! Nothing in this crate talks to a database. Callers supply the raw store's table list and
//! schemas where needed.

pub mod core_tables;
pub mod resolver;
pub mod sql;
pub mod stage;
pub mod tabular;

pub use self::{
    core_tables::{CoreTableConfig, LoadCoreTablesError},
    resolver::{ResolveError, Task},
    stage::{Datamart, LoadStageError, StageConfig},
    tabular::{TabularError, TabularFormat, TabularPlan},
};
