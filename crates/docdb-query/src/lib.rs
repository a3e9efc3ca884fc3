//! Token-based query builder for docdb.
//!
//! `docdb-query` is the **query construction layer**. A [`QueryBuilder`]
//! records typed tokens as its fluent methods are called and renders them
//! into query text plus a parameter table. Values are never inlined into the
//! text.
//!
//! # Role In The Architecture
//!
//! - **Tokens**: one closed enum per query section, each rendering itself.
//! - **Builder**: enforces operator placement, negation guards, clause
//!   balance and modifier placement as tokens are appended.
//! - **IndexQuery**: the frozen request form, with a deterministic content
//!   hash used to key response caching.
//!
//! Queries execute through the session in `docdb-session`; most users reach
//! these types via the `docdb` facade crate.

pub mod builder;
pub mod index_query;
pub mod tokens;

pub use builder::QueryBuilder;
pub use index_query::{IndexQuery, QueryHashCalculator};
pub use tokens::{
    DeclareToken, FromToken, LoadToken, OrderByToken, OrderingType, SelectToken, ShapeToken,
    SpatialRelation, SpatialUnits, WhereClauseToken, WhereOperator, WhereOptions, WhereToken,
};
