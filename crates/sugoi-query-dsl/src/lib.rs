//! Filter DSL for sugoi storage queries
//!
//! A compact string form of a storage filter plus its access parameters.
//!
//! # Syntax
//!
//! ```text
//! Position, Velocity              // both components, read only
//! [inout]Position, Velocity       // Position is read and written
//! Position, !Frozen               // Position but NOT Frozen
//! Position, ?Health               // Health fetched when present
//! Sprite|Mesh                     // Sprite OR Mesh
//! $Material                       // shared through a meta entity
//! [atomic]Counter                 // atomic access
//! <rand>[in]Transform             // Transform of any entity may be read
//! [has]Player                     // filter only
//! ```
//!
//! # Examples
//!
//! ```
//! use sugoi_query_dsl::{Access, Operator, parse_query};
//!
//! let query = parse_query("[inout]Position, !Frozen, ?Health").unwrap();
//! assert_eq!(query.terms.len(), 3);
//! assert_eq!(query.terms[0].access, Access::InOut);
//! assert_eq!(query.terms[1].operator, Operator::Not);
//! assert_eq!(query.terms[2].operator, Operator::Optional);
//! ```

mod parser;

pub use parser::{Access, Operator, Order, ParseError, Query, Term, parse_query};
