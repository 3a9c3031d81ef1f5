pub mod secure_storage;
pub mod paths;

pub use secure_storage::{KeyringStorage, SecureStorage, SecureStorageManager};
pub use paths::AppPaths;
