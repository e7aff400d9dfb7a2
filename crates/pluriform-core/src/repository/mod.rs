//! Transactional storage for articles, events, and link rows

pub mod migrations;
mod sqlite;

pub use sqlite::{
    EventBundle, EventRecompute, EventRepository, RepositoryError, Result, merge_entities,
};
