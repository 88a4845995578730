mod model;
mod repository;

pub use model::SessionSecretDB;
pub use repository::SqliteSecretStore;
