pub use super::file::Entity as File;
