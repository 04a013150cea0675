//! Image record persistence.

pub mod postgres;
pub mod repository;

pub use postgres::PostgresImageRepository;
pub use repository::{ImageRepository, InMemoryImageRepository, RepositoryError};
